//! Counter selection and sampling.
//!
//! A [`Watcher`] turns one configured [`Selector`] into a fixed set of bound
//! counter handles at initialization time and samples all of them on demand.
//! Patterns are unanchored regular expressions, `Processor` matches
//! `% Processor Time`; anchor them with `^...$` for exact matches.
//!
//! ## Metrics
//!
//! `sample_failure`: Counter reads that failed and were skipped
//!

use std::{fmt, sync::Arc};

use metrics::counter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    counter::{self, Counter, CounterId, Source},
    metric::{self, CollectedMetric},
};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration of one [`Watcher`].
pub struct Selector {
    /// Output template, see [`crate::template`]
    pub template: String,
    /// The counter category, matched exactly
    pub category: String,
    /// Pattern over counter names
    pub counter: String,
    /// Pattern over instance names. When absent the category's own,
    /// instance-less counters are selected.
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Watcher`].
pub enum Error {
    /// The selector lacks a required field.
    #[error("Selector field `{0}` must not be empty")]
    Configuration(&'static str),
    /// A pattern failed to compile.
    #[error("Invalid selector pattern: {0}")]
    Pattern(#[from] regex::Error),
    /// The selector resolved to nothing.
    #[error("Selector matched no counters in category {0}")]
    NoMatches(String),
    /// See [`crate::counter::Error`] for details.
    #[error(transparent)]
    Counter(#[from] counter::Error),
    /// See [`crate::metric::Error`] for details.
    #[error(transparent)]
    Metric(#[from] metric::Error),
}

struct Bound {
    id: CounterId,
    counter: Box<dyn Counter>,
}

impl fmt::Debug for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound").field("id", &self.id).finish_non_exhaustive()
    }
}

#[derive(Debug)]
/// Resolves a [`Selector`] against a [`Source`] and samples the result.
pub struct Watcher {
    selector: Selector,
    source: Arc<dyn Source>,
    bound: Vec<Bound>,
    labels: Vec<(String, String)>,
}

impl Watcher {
    /// Create a new, unresolved [`Watcher`]. Call [`Watcher::initialize`]
    /// before reporting.
    #[must_use]
    pub fn new(selector: Selector, source: Arc<dyn Source>) -> Self {
        let labels = vec![("category".to_string(), selector.category.clone())];
        Self {
            selector,
            source,
            bound: Vec::new(),
            labels,
        }
    }

    #[must_use]
    /// The selector this watcher resolves.
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    #[must_use]
    /// The number of bound counters.
    pub fn len(&self) -> usize {
        self.bound.len()
    }

    #[must_use]
    /// Whether no counters are bound.
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    /// The identities of all bound counters.
    pub fn bound(&self) -> impl Iterator<Item = &CounterId> {
        self.bound.iter().map(|b| &b.id)
    }

    /// Resolve the selector, replacing any previously bound counters. Every
    /// newly bound counter is read once and the value discarded, so the first
    /// reported sample has a baseline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the template, category or counter
    /// pattern is empty, [`Error::Pattern`] for an invalid pattern,
    /// [`Error::Counter`] if the category cannot be enumerated and
    /// [`Error::NoMatches`] if nothing matched.
    pub fn initialize(&mut self) -> Result<usize, Error> {
        if self.selector.category.is_empty() {
            return Err(Error::Configuration("category"));
        }
        if self.selector.template.is_empty() {
            return Err(Error::Configuration("template"));
        }
        if self.selector.counter.is_empty() {
            return Err(Error::Configuration("counter"));
        }
        self.dispose();

        let category = self.selector.category.as_str();
        let counter_re = Regex::new(&self.selector.counter)?;
        let mut ids = Vec::new();
        match self.selector.instance.as_deref().filter(|p| !p.is_empty()) {
            Some(pattern) => {
                let instance_re = Regex::new(pattern)?;
                for instance in self.source.instances(category)? {
                    if !instance_re.is_match(&instance) {
                        continue;
                    }
                    let names = match self.source.counters(category, Some(&instance)) {
                        Ok(names) => names,
                        Err(err) => {
                            debug!("skipping instance {instance} of {category}: {err}");
                            continue;
                        }
                    };
                    ids.extend(
                        names
                            .into_iter()
                            .filter(|name| counter_re.is_match(name))
                            .map(|name| CounterId::new(category, name, Some(instance.as_str()))),
                    );
                }
            }
            None => {
                ids.extend(
                    self.source
                        .counters(category, None)?
                        .into_iter()
                        .filter(|name| counter_re.is_match(name))
                        .map(|name| CounterId::new(category, name, None::<String>)),
                );
            }
        }

        for id in ids {
            let mut counter = match self.source.open(&id) {
                Ok(counter) => counter,
                Err(err) => {
                    debug!("unable to bind {id}: {err}");
                    continue;
                }
            };
            if let Err(err) = counter.next_value() {
                debug!("priming read of {id} failed: {err}");
            }
            self.bound.push(Bound { id, counter });
        }

        if self.bound.is_empty() {
            return Err(Error::NoMatches(category.to_string()));
        }
        info!(
            "bound {count} counters in {category} for template {template}",
            count = self.bound.len(),
            template = self.selector.template,
        );
        Ok(self.bound.len())
    }

    /// Sample every bound counter once, appending one [`CollectedMetric`]
    /// per successful read to `sink`. Returns how many were appended.
    ///
    /// In strict mode the first failed read aborts the report. Otherwise
    /// failures are logged, counted and skipped; the handle stays bound and
    /// is read again next time.
    ///
    /// # Errors
    ///
    /// Only in strict mode, returns the failure of the first counter that
    /// could not be read.
    pub fn report(&mut self, sink: &mut Vec<CollectedMetric>, strict: bool) -> Result<usize, Error> {
        let mut reported = 0;
        for bound in &mut self.bound {
            match bound.counter.next_value() {
                Ok(value) => {
                    sink.push(CollectedMetric::new(
                        self.selector.template.as_str(),
                        bound.id.category.as_str(),
                        bound.id.name.as_str(),
                        bound.id.instance.clone(),
                        value,
                    )?);
                    reported += 1;
                }
                Err(err) if strict => return Err(err.into()),
                Err(err) => {
                    debug!("skipping sample of {id}: {err}", id = bound.id);
                    counter!("sample_failure", &self.labels).increment(1);
                }
            }
        }
        Ok(reported)
    }

    /// Release every bound counter. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        self.bound.clear();
    }
}
