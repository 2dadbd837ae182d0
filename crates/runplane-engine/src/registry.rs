// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kind-keyed registries of runtimes and actuators.
//!
//! Registration is explicit: the engine builder hands every strategy to the
//! registry once at startup. Two entries declaring the same kind are a wiring
//! bug and fail construction with [`Error::DuplicateKind`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::actuator::Actuator;
use crate::error::{Error, Result};
use crate::runtimes::Runtime;

/// Strategies keyed by their declared kind.
pub struct Registry<T: ?Sized> {
    entity: &'static str,
    entries: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> Registry<T> {
    /// Create an empty registry; `entity` names the strategy in errors.
    pub fn empty(entity: &'static str) -> Self {
        Self {
            entity,
            entries: HashMap::new(),
        }
    }

    /// Register a strategy under `kind`.
    pub fn register(&mut self, kind: impl Into<String>, entry: Arc<T>) -> Result<()> {
        let kind = kind.into();
        if self.entries.contains_key(&kind) {
            return Err(Error::DuplicateKind(kind));
        }
        self.entries.insert(kind, entry);
        Ok(())
    }

    /// Strategy for `kind`.
    pub fn get(&self, kind: &str) -> Result<Arc<T>> {
        self.entries
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::not_found(self.entity, kind))
    }

    /// Whether `kind` is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.entries.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Runtimes keyed by run kind.
pub type RuntimeFactory = Registry<dyn Runtime>;

/// Actuators keyed by trigger kind.
pub type ActuatorFactory = Registry<dyn Actuator>;

impl Registry<dyn Runtime> {
    /// Build the factory from runtimes, keyed by [`Runtime::kind`].
    pub fn new(runtimes: impl IntoIterator<Item = Arc<dyn Runtime>>) -> Result<Self> {
        let mut registry = Self::empty("Runtime");
        for runtime in runtimes {
            registry.register(runtime.kind().to_string(), runtime)?;
        }
        Ok(registry)
    }
}

impl Registry<dyn Actuator> {
    /// Build the factory from actuators, keyed by [`Actuator::kind`].
    pub fn new(actuators: impl IntoIterator<Item = Arc<dyn Actuator>>) -> Result<Self> {
        let mut registry = Self::empty("Actuator");
        for actuator in actuators {
            registry.register(actuator.kind().to_string(), actuator)?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::actuator::Trigger;
    use crate::run::{Executable, Run, RunSpec, Task};
    use crate::runnable::Runnable;

    struct Named(&'static str);

    #[async_trait]
    impl Runtime for Named {
        fn kind(&self) -> &str {
            self.0
        }
        async fn build(&self, _: &Executable, _: &Task, _: &Run) -> Result<RunSpec> {
            Ok(RunSpec::default())
        }
        async fn run(&self, run: &Run) -> Result<Runnable> {
            Ok(Runnable::new(&run.id, &run.project, self.0, "job", "mock"))
        }
        async fn stop(&self, run: &Run) -> Result<Runnable> {
            self.run(run).await
        }
        async fn resume(&self, run: &Run) -> Result<Runnable> {
            self.run(run).await
        }
        async fn delete(&self, run: &Run) -> Result<Runnable> {
            self.run(run).await
        }
    }

    #[async_trait]
    impl Actuator for Named {
        fn kind(&self) -> &str {
            self.0
        }
        async fn start(&self, _: &Trigger) -> Result<()> {
            Ok(())
        }
        async fn stop(&self, _: &Trigger) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_runtime_lookup() {
        let factory = RuntimeFactory::new([
            Arc::new(Named("container")) as Arc<dyn Runtime>,
            Arc::new(Named("batch")),
        ])
        .unwrap();

        assert_eq!(factory.get("batch").unwrap().kind(), "batch");
        assert_eq!(factory.kinds(), vec!["batch", "container"]);
        assert!(factory.contains("container"));
    }

    #[test]
    fn test_unknown_kind_is_not_found() {
        let factory = RuntimeFactory::new([Arc::new(Named("container")) as Arc<dyn Runtime>]).unwrap();
        let err = factory.get("python").err().unwrap();
        assert_eq!(err.to_string(), "Runtime not found: python");
    }

    #[test]
    fn test_duplicate_kind_fails_construction() {
        let result = ActuatorFactory::new([
            Arc::new(Named("schedule")) as Arc<dyn Actuator>,
            Arc::new(Named("schedule")),
        ]);
        assert!(matches!(result, Err(Error::DuplicateKind(kind)) if kind == "schedule"));
    }
}
