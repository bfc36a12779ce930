use std::collections::BTreeSet;
use std::fmt;
use std::iter::FusedIterator;

use serde::Serialize;

use crate::UnixTimestamp;

/// Type used for counter values.
pub type CounterType = f64;

/// Type used for gauge values.
pub type GaugeType = f64;

/// Type used for timer samples.
pub type TimerType = f64;

/// The tags of a metric.
///
/// Tags are opaque strings, usually in the form `key:value`. They are kept sorted and
/// deduplicated, so two metrics with the same tags in a different order share one series.
pub type Tags = BTreeSet<String>;

/// The type of a [`MetricValue`], determining its aggregation and evaluation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Counts instances of an event.
    ///
    /// Counters can be incremented and decremented. Sampled submissions are scaled up by the
    /// inverse of their sample rate.
    Counter,
    /// Stores the last reported value.
    ///
    /// Gauges are not reset when flushed. They keep reporting their value until they expire.
    Gauge,
    /// Collects individual duration samples.
    ///
    /// On flush, statistics and percentiles are computed from all samples of the window.
    Timer,
    /// Counts the number of unique reported values.
    Set,
}

impl MetricType {
    /// Return the shortcode for this metric type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "c",
            MetricType::Gauge => "g",
            MetricType::Timer => "ms",
            MetricType::Set => "s",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricType {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "c" => Self::Counter,
            "g" => Self::Gauge,
            "ms" | "h" => Self::Timer,
            "s" => Self::Set,
            _ => return Err(ParseMetricError::UnknownType),
        })
    }
}

/// The [typed value](Metric::value) of a metric.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// Adds to a counter. See [`MetricType::Counter`].
    Counter(CounterType),
    /// Replaces the value of a gauge. See [`MetricType::Gauge`].
    Gauge(GaugeType),
    /// Adds a signed delta to the value of a gauge.
    ///
    /// Submitted with an explicit sign, for example `connections:-1|g`.
    GaugeDelta(GaugeType),
    /// A single timer sample. See [`MetricType::Timer`].
    Timer(TimerType),
    /// A set member. See [`MetricType::Set`].
    Set(String),
}

impl MetricValue {
    /// Returns the type of this value.
    pub fn ty(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) | Self::GaugeDelta(_) => MetricType::Gauge,
            Self::Timer(_) => MetricType::Timer,
            Self::Set(_) => MetricType::Set,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Counter(value) => value.fmt(f),
            MetricValue::Gauge(value) => value.fmt(f),
            MetricValue::GaugeDelta(value) => write!(f, "{value:+}"),
            MetricValue::Timer(value) => value.fmt(f),
            MetricValue::Set(value) => value.fmt(f),
        }
    }
}

/// An error returned by [`Metric::parse`] and [`Metric::parse_all`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseMetricError {
    /// The line is not valid UTF-8.
    #[error("metric is not valid UTF-8")]
    InvalidUtf8,
    /// The line is missing the `:value` or `|type` section.
    #[error("metric is missing its value or type")]
    MissingValue,
    /// The metric name is empty or contains reserved characters.
    #[error("invalid metric name")]
    InvalidName,
    /// The type code is not one of the known metric types.
    #[error("unknown metric type")]
    UnknownType,
    /// The value cannot be parsed for the metric type.
    #[error("invalid metric value")]
    InvalidValue,
    /// The sample rate is not a number in `(0, 1]`.
    #[error("sample rate out of range")]
    InvalidSampleRate,
}

impl ParseMetricError {
    /// Returns a short identifier for this error, suitable as a metric tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MissingValue => "missing_value",
            Self::InvalidName => "invalid_name",
            Self::UnknownType => "unknown_type",
            Self::InvalidValue => "invalid_value",
            Self::InvalidSampleRate => "invalid_sample_rate",
        }
    }
}

/// Validates a metric name.
///
/// Metric names cannot be empty and must not contain whitespace, control characters or the
/// protocol delimiters.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '|' | ':' | '#'))
}

fn parse_number(string: &str) -> Option<f64> {
    string.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_value(string: &str, ty: MetricType) -> Result<MetricValue, ParseMetricError> {
    let value = match ty {
        MetricType::Counter => parse_number(string).map(MetricValue::Counter),
        MetricType::Gauge => match string.as_bytes().first() {
            Some(b'+' | b'-') => parse_number(string).map(MetricValue::GaugeDelta),
            _ => parse_number(string).map(MetricValue::Gauge),
        },
        MetricType::Timer => parse_number(string).map(MetricValue::Timer),
        MetricType::Set if !string.is_empty() => Some(MetricValue::Set(string.to_owned())),
        MetricType::Set => None,
    };

    value.ok_or(ParseMetricError::InvalidValue)
}

fn parse_sample_rate(string: &str) -> Result<f64, ParseMetricError> {
    match string.parse::<f64>() {
        Ok(rate) if rate > 0.0 && rate <= 1.0 => Ok(rate),
        _ => Err(ParseMetricError::InvalidSampleRate),
    }
}

/// Parses tags in the format `tag1,tag2:value`.
///
/// Tags are trimmed and empty tags are skipped.
fn parse_tags(string: &str) -> Tags {
    string
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_owned)
        .collect()
}

/// A single metric value representing the payload sent from clients.
///
/// As opposed to aggregated buckets, this single metric always represents a single submission
/// and cannot store multiple values.
///
/// # Submission Protocol
///
/// ```text
/// <name>:<value>|<type>[|@<sample_rate>][|#<tag1>,<tag2>]
/// ```
///
/// An example submission looks like this:
///
/// ```text
/// endpoint.response_time:57|ms|#route:user_index
/// endpoint.hits:1|c|@0.1|#route:user_index
/// ```
///
/// Sections after the type that are neither a sample rate nor tags are ignored.
///
/// To parse a submission payload, use [`Metric::parse_all`].
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// The name of the metric without its type.
    pub name: String,
    /// The value of the metric.
    pub value: MetricValue,
    /// The client-side sample rate in `(0, 1]`, if the client sampled.
    pub sample_rate: Option<f64>,
    /// The time at which the metric was received.
    pub timestamp: UnixTimestamp,
    /// A list of tags adding dimensions to the metric.
    pub tags: Tags,
}

impl Metric {
    fn parse_str(string: &str, timestamp: UnixTimestamp) -> Result<Self, ParseMetricError> {
        let mut components = string.split('|');

        let name_value = components.next().unwrap_or_default();
        let (name, raw_value) = name_value
            .split_once(':')
            .ok_or(ParseMetricError::MissingValue)?;
        if !is_valid_name(name) {
            return Err(ParseMetricError::InvalidName);
        }

        let ty: MetricType = components
            .next()
            .ok_or(ParseMetricError::MissingValue)?
            .parse()?;

        let mut metric = Self {
            name: name.to_owned(),
            value: parse_value(raw_value, ty)?,
            sample_rate: None,
            timestamp,
            tags: Tags::new(),
        };

        for component in components {
            if let Some(rate) = component.strip_prefix('@') {
                metric.sample_rate = Some(parse_sample_rate(rate)?);
            } else if let Some(tags) = component.strip_prefix('#') {
                metric.tags = parse_tags(tags);
            }
        }

        Ok(metric)
    }

    /// Parses a single metric value from the raw protocol.
    ///
    /// See the [`Metric`] for more information on the protocol.
    ///
    /// # Example
    ///
    /// ```
    /// use tally_metrics::{Metric, UnixTimestamp};
    ///
    /// let metric = Metric::parse(b"response_time:57|ms", UnixTimestamp::now())
    ///     .expect("metric should parse");
    /// ```
    pub fn parse(slice: &[u8], timestamp: UnixTimestamp) -> Result<Self, ParseMetricError> {
        let string = std::str::from_utf8(slice).or(Err(ParseMetricError::InvalidUtf8))?;
        Self::parse_str(string, timestamp)
    }

    /// Parses a set of metric values from the raw protocol.
    ///
    /// Returns a metric result for each line in `slice`, ignoring empty lines. Both UNIX newlines
    /// (`\n`) and Windows newlines (`\r\n`) are supported.
    ///
    /// It is possible to continue consuming the iterator after `Err` is yielded.
    ///
    /// # Example
    ///
    /// ```
    /// use tally_metrics::{Metric, UnixTimestamp};
    ///
    /// let data = br#"
    /// endpoint.response_time:57|ms
    /// endpoint.hits:1|c
    /// "#;
    ///
    /// for metric_result in Metric::parse_all(data, UnixTimestamp::now()) {
    ///     let metric = metric_result.expect("metric should parse");
    ///     println!("Metric {}: {}", metric.name, metric.value);
    /// }
    /// ```
    pub fn parse_all(slice: &[u8], timestamp: UnixTimestamp) -> ParseMetrics<'_> {
        ParseMetrics { slice, timestamp }
    }
}

/// Iterator over parsed metrics returned from [`Metric::parse_all`].
#[derive(Clone, Debug)]
pub struct ParseMetrics<'a> {
    slice: &'a [u8],
    timestamp: UnixTimestamp,
}

impl Iterator for ParseMetrics<'_> {
    type Item = Result<Metric, ParseMetricError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.slice.is_empty() {
                return None;
            }

            let mut split = self.slice.splitn(2, |&b| b == b'\n');
            let current = split.next()?;
            self.slice = split.next().unwrap_or_default();

            let string = match std::str::from_utf8(current) {
                Ok(string) => string.strip_suffix('\r').unwrap_or(string),
                Err(_) => return Some(Err(ParseMetricError::InvalidUtf8)),
            };

            if !string.is_empty() {
                return Some(Metric::parse_str(string, self.timestamp));
            }
        }
    }
}

impl FusedIterator for ParseMetrics<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Metric, ParseMetricError> {
        Metric::parse(s.as_bytes(), UnixTimestamp::from_secs(4711))
    }

    #[test]
    fn test_parse_garbage() {
        let s = "x23-408j17z4232@#34d\nc3456y7^😎";
        assert!(parse(s).is_err());
    }

    #[test]
    fn test_parse_counter() {
        let metric = parse("foo:42|c").unwrap();
        insta::assert_debug_snapshot!(metric, @r###"
        Metric {
            name: "foo",
            value: Counter(
                42.0,
            ),
            sample_rate: None,
            timestamp: UnixTimestamp(4711),
            tags: {},
        }
        "###);
    }

    #[test]
    fn test_parse_counter_sampled() {
        let metric = parse("foo:1|c|@0.25|#env:prod").unwrap();
        assert_eq!(metric.sample_rate, Some(0.25));
        assert_eq!(metric.value, MetricValue::Counter(1.0));
    }

    #[test]
    fn test_parse_timer() {
        let metric = parse("request.duration:17.5|ms").unwrap();
        assert_eq!(metric.value, MetricValue::Timer(17.5));

        // Histograms are a common alias for timers.
        let metric = parse("request.duration:17.5|h").unwrap();
        assert_eq!(metric.value, MetricValue::Timer(17.5));
    }

    #[test]
    fn test_parse_set() {
        let metric = parse("users:e2546e4c-ecd0-43ad-ae27-87960e57a658|s").unwrap();
        insta::assert_debug_snapshot!(metric, @r###"
        Metric {
            name: "users",
            value: Set(
                "e2546e4c-ecd0-43ad-ae27-87960e57a658",
            ),
            sample_rate: None,
            timestamp: UnixTimestamp(4711),
            tags: {},
        }
        "###);
    }

    #[test]
    fn test_parse_set_with_colon() {
        let metric = parse("peers:10.0.0.1:8080|s").unwrap();
        assert_eq!(metric.value, MetricValue::Set("10.0.0.1:8080".to_owned()));
    }

    #[test]
    fn test_parse_gauge() {
        assert_eq!(parse("foo:42|g").unwrap().value, MetricValue::Gauge(42.0));
        assert_eq!(
            parse("foo:+4|g").unwrap().value,
            MetricValue::GaugeDelta(4.0)
        );
        assert_eq!(
            parse("foo:-2.5|g").unwrap().value,
            MetricValue::GaugeDelta(-2.5)
        );
    }

    #[test]
    fn test_parse_tags() {
        let metric = parse("foo:17.5|ms|#foo, bar:baz,,foo").unwrap();
        insta::assert_debug_snapshot!(metric.tags, @r###"
        {
            "bar:baz",
            "foo",
        }
        "###);
    }

    #[test]
    fn test_parse_tags_and_rate_any_order() {
        let a = parse("foo:1|c|#b,a|@0.5").unwrap();
        let b = parse("foo:1|c|@0.5|#a,b").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_ignores_unknown_sections() {
        let metric = parse("foo:1|c|T1692189000|#a").unwrap();
        assert_eq!(metric.tags.len(), 1);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("foo#bar:42|c"), Err(ParseMetricError::InvalidName));
        assert_eq!(parse(":42|c"), Err(ParseMetricError::InvalidName));
        assert_eq!(parse("foo bar:42|c"), Err(ParseMetricError::InvalidName));
        assert_eq!(parse("foo:42"), Err(ParseMetricError::MissingValue));
        assert_eq!(parse("foo|c"), Err(ParseMetricError::MissingValue));
        assert_eq!(parse("foo:42|x"), Err(ParseMetricError::UnknownType));
        assert_eq!(parse("foo:abc|c"), Err(ParseMetricError::InvalidValue));
        assert_eq!(parse("foo:inf|ms"), Err(ParseMetricError::InvalidValue));
        assert_eq!(parse("foo:|s"), Err(ParseMetricError::InvalidValue));
        assert_eq!(
            Metric::parse(b"foo:\xff|c", UnixTimestamp::from_secs(0)),
            Err(ParseMetricError::InvalidUtf8)
        );
    }

    #[test]
    fn test_parse_sample_rate_out_of_range() {
        for rate in ["0", "-0.5", "1.5", "NaN", "abc", ""] {
            assert_eq!(
                parse(&format!("foo:1|c|@{rate}")),
                Err(ParseMetricError::InvalidSampleRate),
                "rate {rate:?}"
            );
        }
        assert!(parse("foo:1|c|@1").is_ok());
    }

    #[test]
    fn test_parse_is_idempotent() {
        let line = "api.latency:250|ms|@0.5|#host:web-1,region:eu";
        assert_eq!(parse(line).unwrap(), parse(line).unwrap());
    }

    #[test]
    fn test_parse_all() {
        let s = "foo:42|c\nbar:17|c";
        let timestamp = UnixTimestamp::from_secs(4711);

        let metrics: Vec<Metric> = Metric::parse_all(s.as_bytes(), timestamp)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(metrics.len(), 2);
    }

    #[test]
    fn test_parse_all_crlf() {
        let s = "foo:42|c\r\nbar:17|c";
        let timestamp = UnixTimestamp::from_secs(4711);

        let metrics: Vec<Metric> = Metric::parse_all(s.as_bytes(), timestamp)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(metrics.len(), 2);
    }

    #[test]
    fn test_parse_all_empty_lines() {
        let s = "foo:42|c\n\n\nbar:17|c";
        let timestamp = UnixTimestamp::from_secs(4711);

        let metric_count = Metric::parse_all(s.as_bytes(), timestamp).count();
        assert_eq!(metric_count, 2);
    }

    #[test]
    fn test_parse_all_trailing() {
        let s = "foo:42|c\nbar:17|c\n";
        let timestamp = UnixTimestamp::from_secs(4711);

        let metric_count = Metric::parse_all(s.as_bytes(), timestamp).count();
        assert_eq!(metric_count, 2);
    }

    #[test]
    fn test_parse_all_skips_bad_lines() {
        let s = "foo:42|c\nnot a metric\nbar:1|q\nbaz:3|g";
        let timestamp = UnixTimestamp::from_secs(4711);

        let results: Vec<_> = Metric::parse_all(s.as_bytes(), timestamp).collect();
        assert_eq!(results.len(), 4);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(ParseMetricError::MissingValue));
        assert_eq!(results[2], Err(ParseMetricError::UnknownType));
        assert_eq!(results[3].as_ref().unwrap().name, "baz");
    }
}
