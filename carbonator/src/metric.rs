//! The sampled value handed from collection to delivery.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors produced by [`CollectedMetric`].
pub enum Error {
    /// A required identity field was empty.
    #[error("CollectedMetric field `{0}` must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
/// One sample of one counter.
///
/// The output template travels unresolved; each output renders it with its
/// own prefix and escaping at delivery time. Construction stamps the
/// timestamp and nothing mutates it afterward.
pub struct CollectedMetric {
    template: String,
    category: String,
    name: String,
    instance: Option<String>,
    value: f64,
    timestamp: SystemTime,
}

impl CollectedMetric {
    /// Create a new [`CollectedMetric`] stamped with the current time.
    ///
    /// # Errors
    ///
    /// Fails if `template`, `category` or `name` is empty.
    pub fn new(
        template: impl Into<String>,
        category: impl Into<String>,
        name: impl Into<String>,
        instance: Option<String>,
        value: f32,
    ) -> Result<Self, Error> {
        Self::new_at(template, category, name, instance, value, SystemTime::now())
    }

    /// As [`CollectedMetric::new`] but with an explicit timestamp.
    ///
    /// # Errors
    ///
    /// Fails if `template`, `category` or `name` is empty.
    pub fn new_at(
        template: impl Into<String>,
        category: impl Into<String>,
        name: impl Into<String>,
        instance: Option<String>,
        value: f32,
        timestamp: SystemTime,
    ) -> Result<Self, Error> {
        let template = template.into();
        let category = category.into();
        let name = name.into();
        if template.is_empty() {
            return Err(Error::Empty("template"));
        }
        if category.is_empty() {
            return Err(Error::Empty("category"));
        }
        if name.is_empty() {
            return Err(Error::Empty("name"));
        }
        Ok(Self {
            template,
            category,
            name,
            instance,
            value: f64::from(value),
            timestamp,
        })
    }

    #[must_use]
    /// The unresolved output template.
    pub fn template(&self) -> &str {
        &self.template
    }

    #[must_use]
    /// The counter category.
    pub fn category(&self) -> &str {
        &self.category
    }

    #[must_use]
    /// The counter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    /// The counter instance, if the counter has one.
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    #[must_use]
    /// The sampled value.
    pub fn value(&self) -> f64 {
        self.value
    }

    #[must_use]
    /// When the sample was taken.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    #[must_use]
    /// Seconds since the unix epoch, as Graphite wants them. A timestamp
    /// before the epoch renders as zero.
    pub fn unix_seconds(&self) -> u64 {
        self.since_epoch().as_secs()
    }

    #[must_use]
    /// Nanoseconds since the unix epoch, as InfluxDB wants them.
    pub fn unix_nanos(&self) -> u128 {
        self.since_epoch().as_nanos()
    }

    fn since_epoch(&self) -> Duration {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_identity_is_rejected() {
        assert_eq!(
            CollectedMetric::new("", "Processor", "% Idle Time", None, 1.0),
            Err(Error::Empty("template"))
        );
        assert_eq!(
            CollectedMetric::new("t", "", "% Idle Time", None, 1.0),
            Err(Error::Empty("category"))
        );
        assert_eq!(
            CollectedMetric::new("t", "Processor", "", None, 1.0),
            Err(Error::Empty("name"))
        );
    }

    #[test]
    fn epoch_accessors() {
        let at = UNIX_EPOCH + Duration::new(1_700_000_000, 250);
        let metric = CollectedMetric::new_at("t", "c", "n", Some("i".into()), 2.5, at)
            .expect("valid metric");
        assert_eq!(metric.unix_seconds(), 1_700_000_000);
        assert_eq!(metric.unix_nanos(), 1_700_000_000_000_000_250);
        assert_eq!(metric.instance(), Some("i"));
        assert!((metric.value() - 2.5).abs() < f64::EPSILON);
    }
}
