use crate::{
    error::KernelError,
    region::{Access, BufferHandle, Region, StridedView},
    types::{FunctionId, TaskId, WorkerClass},
};
use derive_more::Display;

/// Parameter kind with its stable numeric tag.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParamKind {
    /// Read-only buffer.
    Input = 0,
    /// Write-only buffer. A deferred buffer is allocated from the arena.
    Output = 1,
    /// Read, then written in place.
    InOut = 2,
    /// Raw scalar value, never part of dependency inference.
    Scalar = 3,
}

impl ParamKind {
    /// Access pattern, `None` for scalars.
    #[must_use]
    pub const fn access(self) -> Option<Access> {
        match self {
            Self::Input => Some(Access::Read),
            Self::Output => Some(Access::Write),
            Self::InOut => Some(Access::ReadWrite),
            Self::Scalar => None,
        }
    }
}

impl TryFrom<u8> for ParamKind {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Input),
            1 => Ok(Self::Output),
            2 => Ok(Self::InOut),
            3 => Ok(Self::Scalar),
            other => Err(other),
        }
    }
}

/// One parameter of a task submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    kind: ParamKind,
    buffer: Option<BufferHandle>,
    view: Option<StridedView>,
    scalar: u64,
}

impl Param {
    fn with_buffer(kind: ParamKind, buffer: &BufferHandle) -> Self {
        Self {
            kind,
            buffer: Some(*buffer),
            view: None,
            scalar: 0,
        }
    }

    /// Read-only buffer parameter. The buffer must have an address by the
    /// time the task is submitted.
    #[must_use]
    pub fn input(buffer: &BufferHandle) -> Self {
        Self::with_buffer(ParamKind::Input, buffer)
    }

    /// Output parameter. A deferred buffer is allocated in the innermost scope
    /// on submission; an addressed one is used as-is.
    #[must_use]
    pub fn output(buffer: &BufferHandle) -> Self {
        Self::with_buffer(ParamKind::Output, buffer)
    }

    /// In-place parameter. The buffer must have an address.
    #[must_use]
    pub fn inout(buffer: &BufferHandle) -> Self {
        Self::with_buffer(ParamKind::InOut, buffer)
    }

    /// Raw scalar, e.g. an element count.
    #[must_use]
    pub const fn scalar(value: u64) -> Self {
        Self {
            kind: ParamKind::Scalar,
            buffer: None,
            view: None,
            scalar: value,
        }
    }

    /// Scalar carrying the bit pattern of an `f32` in its low 32 bits.
    #[must_use]
    pub fn scalar_f32(value: f32) -> Self {
        Self::scalar(u64::from(value.to_bits()))
    }

    /// Restrict a buffer parameter to a strided view of the buffer.
    #[must_use]
    pub fn with_view(mut self, view: StridedView) -> Self {
        self.view = Some(view);
        self
    }

    /// Parameter kind.
    #[must_use]
    pub const fn kind(&self) -> ParamKind {
        self.kind
    }

    /// Buffer of a non-scalar parameter.
    #[must_use]
    pub const fn buffer(&self) -> Option<&BufferHandle> {
        self.buffer.as_ref()
    }

    /// Raw scalar value, `None` for buffer parameters.
    #[must_use]
    pub const fn scalar_value(&self) -> Option<u64> {
        match self.kind {
            ParamKind::Scalar => Some(self.scalar),
            _ => None,
        }
    }

    /// Scalar reinterpreted as an `f32` bit pattern.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn scalar_f32_value(&self) -> Option<f32> {
        self.scalar_value().map(|bits| f32::from_bits(bits as u32))
    }

    /// Region used for dependency inference. `None` for scalars and for
    /// buffers that have no address yet.
    #[must_use]
    pub fn region(&self) -> Option<Region> {
        let buffer = self.buffer.as_ref()?;
        match &self.view {
            Some(view) => Region::of_view(buffer, view),
            None => Region::whole(buffer),
        }
    }

    pub(crate) fn resolve(&mut self, buffer: BufferHandle) {
        self.buffer = Some(buffer);
    }
}

/// Lifecycle of a task.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Submitted, waiting for predecessors.
    Pending = 0,
    /// All predecessors completed; sitting in a ready queue.
    Ready = 1,
    /// Popped by a scheduler agent.
    Dispatched = 2,
    /// Accepted by the execution backend.
    Running = 3,
    /// Finished successfully. Terminal.
    Completed = 4,
    /// The backend reported failure. Terminal.
    Failed = 5,
}

impl TaskState {
    pub(crate) const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Ready,
            2 => Self::Dispatched,
            3 => Self::Running,
            4 => Self::Completed,
            5 => Self::Failed,
            _ => panic!("TaskState::from_u8: [1]"),
        }
    }

    /// Whether the task will not change state again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Everything an execution backend needs to run a task.
///
/// Runtime-allocated outputs are already resolved to arena addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    /// Task id.
    pub id: TaskId,
    /// Kernel entry point in the kernel registry.
    pub function_id: FunctionId,
    /// Ready queue the task is routed to.
    pub worker_class: WorkerClass,
    /// Human-readable kernel name.
    pub kernel: String,
    /// Parameters in submission order.
    pub params: Vec<Param>,
}

impl TaskRecord {
    /// Assemble a record.
    #[must_use]
    pub fn new(
        id: TaskId,
        function_id: FunctionId,
        worker_class: WorkerClass,
        kernel: impl Into<String>,
        params: Vec<Param>,
    ) -> Self {
        Self {
            id,
            function_id,
            worker_class,
            kernel: kernel.into(),
            params,
        }
    }

    /// Buffer of parameter `index`.
    #[must_use]
    pub fn buffer(&self, index: usize) -> Option<&BufferHandle> {
        self.params.get(index)?.buffer()
    }

    /// Scalar of parameter `index`.
    #[must_use]
    pub fn scalar(&self, index: usize) -> Option<u64> {
        self.params.get(index)?.scalar_value()
    }
}

/// Execution backend: runs a task's kernel and reports the outcome.
///
/// Called from scheduler agent threads, possibly for several tasks at once.
/// A task is only handed over once every predecessor has completed.
pub trait Backend: Send + Sync + 'static {
    /// Run `task` to completion.
    ///
    /// # Errors
    /// Any error marks the task `Failed` and aborts the session.
    fn execute(&self, task: &TaskRecord) -> Result<(), KernelError>;
}

impl<F> Backend for F
where
    F: Fn(&TaskRecord) -> Result<(), KernelError> + Send + Sync + 'static,
{
    fn execute(&self, task: &TaskRecord) -> Result<(), KernelError> {
        self(task)
    }
}
