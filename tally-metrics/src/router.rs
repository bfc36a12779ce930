use crate::BucketKey;

/// Returns the index of the shard that owns `key`.
///
/// The result only depends on the key and the number of shards, so all metrics of a series
/// always end up with the same aggregator. `shards` must be non-zero.
pub fn route(key: &BucketKey, shards: usize) -> usize {
    debug_assert!(shards > 0, "routing requires at least one shard");
    key.hash32() as usize % shards.max(1)
}
