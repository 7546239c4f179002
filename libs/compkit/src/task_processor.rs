use std::collections::HashMap;

use tokio::runtime::Handle;

/// Named handle to an external worker pool.
///
/// The container only stores and hands out these handles; pool construction
/// and scheduling policy stay with the owner. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct TaskProcessor {
    name: String,
    handle: Handle,
}

impl TaskProcessor {
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime handle the pool schedules onto.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

/// Registry handed to the container at construction; read-only afterwards.
pub type TaskProcessorMap = HashMap<String, TaskProcessor>;
