//! Lookup from job kind to the unit of work that runs it.

use std::collections::HashMap;
use std::sync::Arc;

use super::{JobKind, UnitOfWork};

/// Units of work known to a worker pool.
#[derive(Clone, Default)]
pub struct UnitRegistry {
    units: HashMap<JobKind, Arc<dyn UnitOfWork>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under its own kind, replacing any earlier one.
    pub fn register(&mut self, unit: Arc<dyn UnitOfWork>) -> &mut Self {
        self.units.insert(unit.kind(), unit);
        self
    }

    pub fn with(mut self, unit: Arc<dyn UnitOfWork>) -> Self {
        self.register(unit);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn UnitOfWork>> {
        self.units.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        self.units.keys().copied().collect()
    }
}
