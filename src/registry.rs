use crate::{
    error::KernelError,
    task::{Backend, TaskRecord},
    types::{FunctionId, HashMap},
};
use derive_more::Debug;
use std::sync::Arc;
use tracing::trace;

/// Kernel entry point. Receives the task with all buffers resolved.
pub type KernelFn = dyn Fn(&TaskRecord) -> Result<(), KernelError> + Send + Sync;

/// Function-id to kernel table, usable directly as an execution backend.
///
/// Kernel numerics are the kernels' business; the registry only looks up the
/// entry point and invokes it.
#[derive(Debug, Default, Clone)]
pub struct KernelRegistry {
    #[debug(skip)]
    kernels: HashMap<FunctionId, Arc<KernelFn>>,
}

impl KernelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kernel` under `function_id`, replacing any previous entry.
    pub fn register<F>(&mut self, function_id: FunctionId, kernel: F) -> &mut Self
    where
        F: Fn(&TaskRecord) -> Result<(), KernelError> + Send + Sync + 'static,
    {
        self.kernels.insert(function_id, Arc::new(kernel));
        self
    }

    /// Builder-style [`KernelRegistry::register`].
    #[must_use]
    pub fn with<F>(mut self, function_id: FunctionId, kernel: F) -> Self
    where
        F: Fn(&TaskRecord) -> Result<(), KernelError> + Send + Sync + 'static,
    {
        self.register(function_id, kernel);
        self
    }

    /// Whether a kernel is registered under `function_id`.
    #[must_use]
    pub fn contains(&self, function_id: FunctionId) -> bool {
        self.kernels.contains_key(&function_id)
    }
}

impl Backend for KernelRegistry {
    fn execute(&self, task: &TaskRecord) -> Result<(), KernelError> {
        let kernel = self
            .kernels
            .get(&task.function_id)
            .ok_or(KernelError::UnknownFunction(task.function_id))?;
        trace!(task = %task.id, function_id = task.function_id, kernel = %task.kernel, "invoking kernel");
        kernel(task)
    }
}
