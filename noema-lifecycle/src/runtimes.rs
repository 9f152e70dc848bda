//! Maps a tool's `service` tag to the [`Runtime`] adapter that executes it.

use std::collections::HashMap;
use std::sync::Arc;

use noema_model::Service;
use noema_runtimes::Runtime;

#[derive(Clone, Default)]
pub struct RuntimeTable {
    runtimes: HashMap<Service, Arc<dyn Runtime>>,
}

impl RuntimeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, service: Service, runtime: Arc<dyn Runtime>) -> Self {
        self.runtimes.insert(service, runtime);
        self
    }

    pub fn get(&self, service: Service) -> Option<Arc<dyn Runtime>> {
        self.runtimes.get(&service).cloned()
    }
}
