//! Services of the metrics pipeline.
//!
//! Metrics flow from the [readers](reader) through the [dispatcher](dispatcher) into one of the
//! [aggregators](aggregator). The [flush coordinator](flush) periodically collects snapshots from
//! all aggregators and hands the combined batch to every [backend](backend).

pub mod aggregator;
pub mod backend;
pub mod dispatcher;
pub mod flush;
pub mod reader;
