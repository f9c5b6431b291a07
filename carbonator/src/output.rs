//! Carbonator outputs
//!
//! An output owns a bounded buffer of [`CollectedMetric`] and delivers its
//! contents to one backend on its own timer, the variants of [`Client`].
//! Producers only ever wait a bounded time to enqueue, and a batch pays that
//! wait at most once, so a slow or absent backend costs collection one
//! timeout and then the metrics it could not hold.

use serde::{Deserialize, Serialize};

use crate::{metric::CollectedMetric, signals::Running};

pub mod common;
pub mod graphite;
pub mod influx;

pub use common::ConnectionState;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Client`].
pub enum Error {
    /// See [`crate::output::graphite::Error`] for details.
    #[error(transparent)]
    Graphite(#[from] graphite::Error),
    /// See [`crate::output::influx::Error`] for details.
    #[error(transparent)]
    Influx(#[from] influx::Error),
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Client`]
pub struct Config {
    /// Common output configs
    #[serde(flatten)]
    pub general: General,
    /// The output config
    #[serde(flatten)]
    pub inner: Inner,
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configurations common to all [`Client`] variants
pub struct General {
    /// The ID assigned to this output, attached to its telemetry
    pub id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Configuration for [`Client`]
pub enum Inner {
    /// See [`crate::output::graphite::Config`] for details.
    Graphite(graphite::Config),
    /// See [`crate::output::influx::Config`] for details.
    Influx(influx::Config),
}

#[derive(Debug)]
/// The output client.
///
/// All outputs supported by carbonator are a variant of this enum. Please
/// see variant documentation for details.
pub enum Client {
    /// See [`crate::output::graphite::Graphite`] for details.
    Graphite(graphite::Graphite),
    /// See [`crate::output::influx::Influx`] for details.
    Influx(influx::Influx),
}

impl Client {
    /// Create a new [`Client`], deferring to the underlying variant.
    ///
    /// # Errors
    ///
    /// Function will return an error if the variant rejects its
    /// configuration.
    pub fn new(config: Config, running: Running) -> Result<Self, Error> {
        let client = match config.inner {
            Inner::Graphite(conf) => {
                Self::Graphite(graphite::Graphite::new(config.general, &conf, running)?)
            }
            Inner::Influx(conf) => {
                Self::Influx(influx::Influx::new(config.general, &conf, running)?)
            }
        };
        Ok(client)
    }

    #[must_use]
    /// The variant name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Client::Graphite(_) => "graphite",
            Client::Influx(_) => "influx",
        }
    }

    #[must_use]
    /// Where this client delivers to.
    pub fn destination(&self) -> &str {
        match self {
            Client::Graphite(inner) => inner.destination(),
            Client::Influx(inner) => inner.destination(),
        }
    }

    /// Arm the delivery timer.
    ///
    /// # Errors
    ///
    /// Function will return an error if the client was already started.
    pub fn start(&self) -> Result<(), Error> {
        match self {
            Client::Graphite(inner) => inner.start()?,
            Client::Influx(inner) => inner.start()?,
        }
        Ok(())
    }

    /// Offer `metric` for delivery. Returns `false` if it was dropped.
    pub async fn try_add(&self, metric: CollectedMetric) -> bool {
        match self {
            Client::Graphite(inner) => inner.try_add(metric).await,
            Client::Influx(inner) => inner.try_add(metric).await,
        }
    }

    /// Offer a batch for delivery, see [`graphite::Graphite::offer`].
    /// Returns how many were accepted.
    pub async fn offer(&self, metrics: &[CollectedMetric]) -> usize {
        match self {
            Client::Graphite(inner) => inner.offer(metrics).await,
            Client::Influx(inner) => inner.offer(metrics).await,
        }
    }

    /// Run one delivery pass now, outside the timer.
    pub async fn deliver(&self) {
        match self {
            Client::Graphite(inner) => inner.deliver().await,
            Client::Influx(inner) => inner.deliver().await,
        }
    }

    #[must_use]
    /// Metrics currently buffered.
    pub fn buffered(&self) -> usize {
        match self {
            Client::Graphite(inner) => inner.buffered(),
            Client::Influx(inner) => inner.buffered(),
        }
    }

    /// Stop delivering and release the buffer. Safe to call repeatedly.
    pub async fn stop(&self) {
        match self {
            Client::Graphite(inner) => inner.stop().await,
            Client::Influx(inner) => inner.stop().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> Result<Config, serde_yaml::Error> {
        serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(
            contents,
        ))
    }

    #[test]
    fn config_deserializes_as_singleton_map() {
        let contents = r#"
id: carbon
graphite:
  server: graphite.example.com
  prefix: "servers."
"#;
        let config = parse(contents).expect("valid config");
        assert_eq!(config.general.id.as_deref(), Some("carbon"));
        let Inner::Graphite(graphite) = config.inner else {
            panic!("expected graphite, got {:?}", config.inner);
        };
        assert_eq!(graphite.port, 2003);
        assert_eq!(graphite.prefix, "servers.");
        assert_eq!(graphite.reconnect_interval_max_milliseconds, 30_000);

        let contents = r#"
influx:
  posting_url: "http://localhost:8086/write?db=metrics"
  max_batch_size: 500
"#;
        let config = parse(contents).expect("valid config");
        assert_eq!(config.general.id, None);
        assert_eq!(
            config.inner,
            Inner::Influx(influx::Config {
                max_batch_size: 500,
                ..influx::Config::new("http://localhost:8086/write?db=metrics")
            })
        );
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let contents = r#"
statsd:
  server: localhost
"#;
        assert!(parse(contents).is_err());
    }

    #[tokio::test]
    async fn invalid_variant_config_is_an_error() {
        let config = Config {
            general: General::default(),
            inner: Inner::Graphite(graphite::Config::new("")),
        };
        assert!(matches!(
            Client::new(config, Running::new()),
            Err(Error::Graphite(graphite::Error::Configuration(_)))
        ));
    }

    #[tokio::test]
    async fn dispatches_to_variant() {
        let config = Config {
            general: General {
                id: Some("local".to_string()),
            },
            inner: Inner::Influx(influx::Config::new("http://127.0.0.1:1/write")),
        };
        let client = Client::new(config, Running::new()).expect("valid config");
        assert_eq!(client.name(), "influx");
        assert_eq!(client.destination(), "http://127.0.0.1:1/write");
        client.start().expect("start");
        assert!(client.start().is_err());
        client.stop().await;
        assert_eq!(client.buffered(), 0);
    }
}
