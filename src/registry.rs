use std::sync::{Arc, RwLock};

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use regex::Regex;

use crate::data::Metric;
use crate::error::Error;

type MetricMap = HashMap<String, Metric, FnvBuildHasher>;

/// Anything that can be walked as a set of named metrics.
///
/// The visitor returns `Err` to short-circuit the walk; the error is
/// propagated to the caller.
pub trait MetricSource: Send + Sync {
    fn each(&self, f: &mut dyn FnMut(&str, &Metric) -> Result<(), Error>) -> Result<(), Error>;
}

/// A concurrent map of named metric handles.
///
/// Scoping is purely lexical: a scoped view prepends `prefix/` to names
/// added through it while sharing the backing map with its parent, so
/// iteration over any view sees every registered metric. Adding a name that
/// already exists replaces the previous handle.
#[derive(Clone, Default)]
pub struct Registry {
    scope: String,
    metrics: Arc<RwLock<MetricMap>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            scope: String::new(),
            metrics: Arc::new(RwLock::new(MetricMap::default())),
        }
    }

    fn scoped_name(&self, name: &str) -> String {
        if self.scope.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.scope, name)
        }
    }

    /// Returns a view that prepends `scope/` to names added through it.
    pub fn scope(&self, scope: &str) -> Registry {
        Registry {
            scope: self.scoped_name(scope),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn add<M: Into<Metric>>(&self, name: &str, metric: M) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.insert(self.scoped_name(name), metric.into());
    }

    pub fn remove(&self, name: &str) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.remove(&self.scoped_name(name));
    }
}

impl MetricSource for Registry {
    /// Calls `f` for every registered metric.
    ///
    /// The entries are snapshotted under the read lock and the callback runs
    /// without it, so the callback is free to add or remove metrics; such
    /// mutations may or may not be visible to the walk in progress.
    fn each(&self, f: &mut dyn FnMut(&str, &Metric) -> Result<(), Error>) -> Result<(), Error> {
        let entries: Vec<(String, Metric)> = {
            let metrics = self.metrics.read().unwrap();
            metrics.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        visit_entries("", entries, f)
    }
}

// Collections expand in place, recursively, with the outer name as prefix.
fn visit_entries(
    scope: &str,
    entries: Vec<(String, Metric)>,
    f: &mut dyn FnMut(&str, &Metric) -> Result<(), Error>,
) -> Result<(), Error> {
    for (name, metric) in entries {
        let name = if scope.is_empty() {
            name
        } else {
            format!("{}/{}", scope, name)
        };
        if let Metric::Collection(collection) = &metric {
            visit_entries(&name, collection.metrics(), f)?;
        } else {
            f(&name, &metric)?;
        }
    }
    Ok(())
}

/// A filtering view over a registry.
///
/// For each entry, exclusion wins over inclusion; an empty include list
/// matches everything and an empty exclude list rejects nothing.
#[derive(Clone)]
pub struct FilteredRegistry {
    registry: Registry,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl FilteredRegistry {
    pub fn new(registry: Registry, include: Vec<Regex>, exclude: Vec<Regex>) -> FilteredRegistry {
        FilteredRegistry {
            registry,
            include,
            exclude,
        }
    }

    pub fn scope(&self, scope: &str) -> FilteredRegistry {
        FilteredRegistry {
            registry: self.registry.scope(scope),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        }
    }

    pub fn add<M: Into<Metric>>(&self, name: &str, metric: M) {
        self.registry.add(name, metric);
    }

    pub fn remove(&self, name: &str) {
        self.registry.remove(name);
    }
}

impl MetricSource for FilteredRegistry {
    fn each(&self, f: &mut dyn FnMut(&str, &Metric) -> Result<(), Error>) -> Result<(), Error> {
        self.registry.each(&mut |name, metric| {
            for re in &self.exclude {
                if re.is_match(name) {
                    return Ok(());
                }
            }
            if self.include.is_empty() {
                return f(name, metric);
            }
            for re in &self.include {
                if re.is_match(name) {
                    return f(name, metric);
                }
            }
            Ok(())
        })
    }
}
