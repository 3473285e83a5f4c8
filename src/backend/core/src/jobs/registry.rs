//! Resolves class names to job behaviours.

use std::collections::HashMap;
use std::sync::Arc;

use super::job::Job;

/// Registry of the behaviours this process can perform.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<&'static str, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a behaviour under its `name()`. A later registration with the
    /// same name replaces the earlier one.
    pub fn register<J: Job + 'static>(&mut self, job: J) -> &mut Self {
        self.jobs.insert(job.name(), Arc::new(job));
        self
    }

    pub fn with<J: Job + 'static>(mut self, job: J) -> Self {
        self.register(job);
        self
    }

    pub fn resolve(&self, class_name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(class_name).cloned()
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.jobs.contains_key(class_name)
    }

    pub fn class_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.jobs.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.class_names())
            .finish()
    }
}
