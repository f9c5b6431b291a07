//! A deterministic, in-process [`Source`].
//!
//! Counters are registered with a sequence of values. Every handle walks the
//! sequence independently and the last value repeats forever. Instances can
//! be removed while handles are open to model a process exiting.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use super::{Counter, CounterId, Error, Source};

#[derive(Debug, Default)]
struct Series {
    values: Vec<f32>,
    reads: usize,
}

#[derive(Debug, Default)]
struct Category {
    counters: BTreeMap<String, Series>,
    instances: BTreeMap<String, BTreeMap<String, Series>>,
}

#[derive(Debug, Default)]
struct State {
    categories: BTreeMap<String, Category>,
}

impl State {
    fn series_mut(&mut self, id: &CounterId) -> Option<&mut Series> {
        let category = self.categories.get_mut(&id.category)?;
        match &id.instance {
            Some(instance) => category.instances.get_mut(instance)?.get_mut(&id.name),
            None => category.counters.get_mut(&id.name),
        }
    }
}

#[derive(Debug, Clone, Default)]
/// An in-memory counter source. Clones share state.
pub struct Memory {
    state: Arc<Mutex<State>>,
}

impl Memory {
    /// Create an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builder form of [`Memory::insert`].
    #[must_use]
    pub fn with_counter<I>(self, category: &str, instance: Option<&str>, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = f32>,
    {
        self.insert(category, instance, name, values);
        self
    }

    /// Register a counter yielding `values` in order. An empty sequence
    /// yields `0.0`. Registering an existing counter replaces its values.
    pub fn insert<I>(&self, category: &str, instance: Option<&str>, name: &str, values: I)
    where
        I: IntoIterator<Item = f32>,
    {
        let mut values: Vec<f32> = values.into_iter().collect();
        if values.is_empty() {
            values.push(0.0);
        }
        let series = Series { values, reads: 0 };

        let mut state = self.lock();
        let cat = state.categories.entry(category.to_string()).or_default();
        match instance {
            Some(instance) => {
                cat.instances
                    .entry(instance.to_string())
                    .or_default()
                    .insert(name.to_string(), series);
            }
            None => {
                cat.counters.insert(name.to_string(), series);
            }
        }
    }

    /// Remove an instance and all of its counters. Open handles onto it
    /// report [`Error::Vanished`] from then on.
    pub fn remove_instance(&self, category: &str, instance: &str) {
        if let Some(cat) = self.lock().categories.get_mut(category) {
            cat.instances.remove(instance);
        }
    }

    /// How many times any handle has read `id`.
    #[must_use]
    pub fn reads(&self, id: &CounterId) -> usize {
        self.lock().series_mut(id).map_or(0, |s| s.reads)
    }
}

impl Source for Memory {
    fn categories(&self) -> Result<Vec<String>, Error> {
        Ok(self.lock().categories.keys().cloned().collect())
    }

    fn instances(&self, category: &str) -> Result<Vec<String>, Error> {
        let state = self.lock();
        let cat = state
            .categories
            .get(category)
            .ok_or_else(|| Error::CategoryNotFound(category.to_string()))?;
        Ok(cat.instances.keys().cloned().collect())
    }

    fn counters(&self, category: &str, instance: Option<&str>) -> Result<Vec<String>, Error> {
        let state = self.lock();
        let cat = state
            .categories
            .get(category)
            .ok_or_else(|| Error::CategoryNotFound(category.to_string()))?;
        let counters = match instance {
            Some(instance) => {
                cat.instances
                    .get(instance)
                    .ok_or_else(|| Error::InstanceNotFound {
                        category: category.to_string(),
                        instance: instance.to_string(),
                    })?
            }
            None => &cat.counters,
        };
        Ok(counters.keys().cloned().collect())
    }

    fn open(&self, id: &CounterId) -> Result<Box<dyn Counter>, Error> {
        if self.lock().series_mut(id).is_none() {
            return Err(Error::CounterNotFound(id.clone()));
        }
        Ok(Box::new(Handle {
            source: self.clone(),
            id: id.clone(),
            cursor: 0,
        }))
    }
}

#[derive(Debug)]
struct Handle {
    source: Memory,
    id: CounterId,
    cursor: usize,
}

impl Counter for Handle {
    fn next_value(&mut self) -> Result<f32, Error> {
        let mut state = self.source.lock();
        let series = state
            .series_mut(&self.id)
            .ok_or_else(|| Error::Vanished(self.id.clone()))?;
        series.reads += 1;
        let idx = self.cursor.min(series.values.len() - 1);
        self.cursor = self.cursor.saturating_add(1);
        Ok(series.values[idx])
    }
}
