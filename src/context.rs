use crate::{
    arena::{HeapRegion, ScopedArena},
    config::{Capacities, SchedulerConfig},
    error::{OrchestrationError, Result},
    executor::{AgentStats, Executor},
    region::{Access, BufferHandle, Region},
    region_map::RegionMap,
    task::{Backend, Param, ParamKind, TaskRecord, TaskState},
    types::{Address, FunctionId, TaskId, WorkerClass},
};
use core::ops::{Deref, DerefMut};
use tracing::{debug, error, info};

/// Everything `begin` needs to start a session.
#[derive(Debug, Clone)]
pub struct BeginInfo {
    /// Opaque handle of the shared memory the host set up, passed through.
    pub shared_memory: Address,
    /// Raw orchestration arguments (tensor addresses, sizes, counts).
    pub args: Vec<u64>,
    /// Number of arguments the orchestration entry was written for.
    pub expected_arg_count: usize,
    /// Fixed capacities of the session.
    pub capacities: Capacities,
    /// Scheduler agents.
    pub scheduler: SchedulerConfig,
    /// Backing memory of the scoped arena.
    pub heap: HeapRegion,
}

impl BeginInfo {
    /// Session description with default capacities and scheduler.
    #[must_use]
    pub fn new(args: Vec<u64>, expected_arg_count: usize, heap: HeapRegion) -> Self {
        Self {
            shared_memory: 0,
            args,
            expected_arg_count,
            capacities: Capacities::default(),
            scheduler: SchedulerConfig::default(),
            heap,
        }
    }

    /// Set the capacities.
    #[must_use]
    pub fn with_capacities(mut self, capacities: Capacities) -> Self {
        self.capacities = capacities;
        self
    }

    /// Set the scheduler configuration.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set the shared-memory handle.
    #[must_use]
    pub fn with_shared_memory(mut self, shared_memory: Address) -> Self {
        self.shared_memory = shared_memory;
        self
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHandle {
    id: TaskId,
    predecessors: Vec<TaskId>,
    buffers: Vec<Option<BufferHandle>>,
}

impl TaskHandle {
    /// Id of the submitted task.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Tasks this one depends on, as inferred from region overlap.
    ///
    /// Predecessors that had already completed are still listed while they
    /// occupy their task-window slot. Once a newer task reuses that slot, the
    /// dependency index may have dropped their entries, and they no longer
    /// show up here.
    #[must_use]
    pub fn predecessors(&self) -> &[TaskId] {
        &self.predecessors
    }

    /// Buffer of parameter `index` as handed to the backend. For a deferred
    /// output this is the arena allocation made on submission.
    #[must_use]
    pub fn buffer(&self, index: usize) -> Option<BufferHandle> {
        self.buffers.get(index).copied().flatten()
    }
}

/// Summary returned by [`Context::end`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Tasks submitted over the whole session.
    pub tasks_submitted: u64,
    /// Tasks that completed.
    pub tasks_completed: u64,
    /// Highest arena offset reached, in bytes.
    pub arena_peak: u64,
    /// Per-agent counters, ordered by agent index.
    pub agents: Vec<AgentStats>,
}

/// Orchestration session: builds the task graph on the calling thread while
/// scheduler agents execute it.
///
/// The outermost scope is opened by [`Context::begin`] and closed by
/// [`Context::end`]. Nested scopes reclaim their intermediate buffers when
/// they close, after every task submitted directly in them has completed.
#[derive(Debug)]
pub struct Context {
    shared_memory: Address,
    args: Vec<u64>,
    arena: ScopedArena,
    regions: RegionMap,
    /// Tasks submitted directly in each open scope, outermost first.
    scope_tasks: Vec<Vec<TaskId>>,
    executor: Executor,
    next_task: u64,
}

impl Context {
    /// Start a session and its scheduler agents.
    ///
    /// # Errors
    /// - `ArgCountMismatch` if `info.args` does not hold exactly
    ///   `info.expected_arg_count` arguments.
    /// - `AgentSpawn` if the agent threads cannot be started.
    /// - `CapacityExceeded(ScopeDepth)` if the scope depth limit is zero.
    ///
    /// # Panics
    /// If `info.heap.base` is zero.
    pub fn begin(info: BeginInfo, backend: impl Backend) -> Result<Self> {
        let BeginInfo {
            shared_memory,
            args,
            expected_arg_count,
            capacities,
            scheduler,
            heap,
        } = info;
        if args.len() != expected_arg_count {
            return Err(OrchestrationError::ArgCountMismatch {
                expected: expected_arg_count,
                actual: args.len(),
            });
        }
        let heap = HeapRegion {
            size: heap.size.min(capacities.arena_bytes),
            ..heap
        };
        let mut arena = ScopedArena::new(heap, capacities.max_scope_depth);
        arena.open_scope()?;
        let executor = Executor::start(&capacities, &scheduler, backend)?;
        info!(
            args = args.len(),
            task_window = capacities.task_window.get(),
            edge_pool = capacities.edge_pool,
            heap_bytes = heap.size,
            agents = scheduler.agents.get(),
            "orchestration session started"
        );
        Ok(Self {
            shared_memory,
            args,
            arena,
            regions: RegionMap::default(),
            scope_tasks: vec![Vec::new()],
            executor,
            next_task: 0,
        })
    }

    /// Raw orchestration arguments.
    #[must_use]
    pub fn args(&self) -> &[u64] {
        &self.args
    }

    /// Shared-memory handle given to `begin`.
    #[must_use]
    pub const fn shared_memory(&self) -> Address {
        self.shared_memory
    }

    /// Number of open scopes, the outermost included.
    #[must_use]
    pub fn scope_depth(&self) -> usize {
        self.arena.depth()
    }

    /// The dependency index.
    #[must_use]
    pub const fn regions(&self) -> &RegionMap {
        &self.regions
    }

    /// The execution side of the session.
    #[must_use]
    pub const fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Whether `buffer` is usable: external, or an arena allocation whose
    /// scope is still open.
    #[must_use]
    pub fn is_live(&self, buffer: &BufferHandle) -> bool {
        self.arena.is_live(buffer)
    }

    /// Current state of `task`, `None` if it was never submitted.
    #[must_use]
    pub fn state(&self, task: TaskId) -> Option<TaskState> {
        self.executor.window().state(task)
    }

    fn ensure_running(&self) -> Result<()> {
        match self.executor.failure() {
            Some((task, _)) => Err(OrchestrationError::SessionAborted(task)),
            None => Ok(()),
        }
    }

    /// Open a nested scope. Prefer [`Context::scope`].
    ///
    /// # Errors
    /// - `CapacityExceeded(ScopeDepth)` beyond the configured depth.
    /// - `SessionAborted` after a task failure.
    pub fn open_scope(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.arena.open_scope()?;
        self.scope_tasks.push(Vec::new());
        Ok(())
    }

    /// Close the innermost nested scope.
    ///
    /// Waits until every task submitted directly in the scope has completed,
    /// then reclaims the scope's buffers and forgets their dependency entries.
    ///
    /// # Errors
    /// - `ScopeImbalance` when only the outermost scope is open.
    /// - `TaskExecutionFailure` if a task failed while waiting; the scope stays
    ///   open and the session is aborted.
    pub fn close_scope(&mut self) -> Result<()> {
        if self.arena.depth() <= 1 {
            return Err(OrchestrationError::ScopeImbalance(
                "close without matching open",
            ));
        }
        let tasks = self
            .scope_tasks
            .last()
            .expect("Context::close_scope: [1]");
        self.executor.wait_all(tasks)?;
        let tasks = self.scope_tasks.pop().expect("Context::close_scope: [2]");
        let reclaimed = self.arena.close_scope()?;
        self.regions.invalidate(&reclaimed.buffers);
        debug!(
            depth = reclaimed.depth,
            tasks = tasks.len(),
            buffers = reclaimed.buffers.len(),
            "nested scope reclaimed"
        );
        Ok(())
    }

    /// Open a nested scope that closes when the guard is dropped.
    ///
    /// # Errors
    /// See [`Context::open_scope`].
    pub fn scope(&mut self) -> Result<ScopeGuard<'_>> {
        self.open_scope()?;
        Ok(ScopeGuard {
            depth: self.arena.depth(),
            ctx: self,
            closed: false,
        })
    }

    /// Allocate an intermediate buffer in the innermost scope.
    ///
    /// # Errors
    /// - `CapacityExceeded(Arena)` when the arena is full.
    /// - `SessionAborted` after a task failure.
    pub fn allocate(&mut self, size: u64) -> Result<BufferHandle> {
        self.ensure_running()?;
        self.arena.allocate(size)
    }

    fn validate(&self, kernel: &str, params: &[Param]) -> Result<()> {
        let invalid = |index, reason| OrchestrationError::InvalidParameter {
            index,
            kernel: kernel.to_owned(),
            reason,
        };
        for (index, param) in params.iter().enumerate() {
            let Some(buffer) = param.buffer() else {
                continue;
            };
            match param.kind() {
                ParamKind::Input | ParamKind::InOut if buffer.is_deferred() => {
                    return Err(invalid(index, "input buffer has a null address"));
                }
                ParamKind::Scalar => {}
                _ if !buffer.is_deferred() && !self.arena.is_live(buffer) => {
                    return Err(invalid(index, "buffer was reclaimed by a closed scope"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Submit a task. Dependencies on earlier tasks are inferred from the
    /// regions its parameters touch.
    ///
    /// A failed submission changes nothing: no task is inserted, no edge is
    /// consumed and no arena space is kept.
    ///
    /// # Errors
    /// - `InvalidParameter` for an input without an address or a reclaimed
    ///   buffer.
    /// - `CapacityExceeded` when the task window, the edge pool or the arena
    ///   is exhausted.
    /// - `SessionAborted` after a task failure.
    pub fn submit_task(
        &mut self,
        function_id: FunctionId,
        worker_class: WorkerClass,
        kernel: &str,
        params: &[Param],
    ) -> Result<TaskHandle> {
        self.ensure_running()?;
        self.validate(kernel, params)?;
        let id = TaskId(self.next_task);
        self.executor.window().check_vacancy(id)?;

        let checkpoint = self.arena.checkpoint();
        let mut resolved = params.to_vec();
        for param in &mut resolved {
            let deferred = match (param.kind(), param.buffer()) {
                (ParamKind::Output, Some(buffer)) if buffer.is_deferred() => buffer.size(),
                _ => continue,
            };
            match self.arena.allocate(deferred) {
                Ok(buffer) => param.resolve(buffer),
                Err(err) => {
                    self.arena.rollback(checkpoint);
                    return Err(err);
                }
            }
        }

        let accesses: Vec<(Region, Access)> = resolved
            .iter()
            .filter_map(|param| Some((param.region()?, param.kind().access()?)))
            .collect();
        let predecessors = self.regions.dependencies(&accesses);
        let window = self.executor.window();
        if let Err(err) = window.reserve_edges(predecessors.len()) {
            self.arena.rollback(checkpoint);
            return Err(err);
        }

        self.regions
            .record(id, &accesses, |task| window.is_retired(task));
        let buffers = resolved.iter().map(|param| param.buffer().copied()).collect();
        window.insert(TaskRecord::new(id, function_id, worker_class, kernel, resolved));
        let attached = predecessors
            .iter()
            .filter(|&&pred| window.attach(pred, id))
            .count();
        if let Some(ready) = window.seal(id) {
            self.executor.enqueue(ready);
        }
        self.scope_tasks
            .last_mut()
            .expect("Context::submit_task: [1]")
            .push(id);
        self.next_task += 1;

        debug!(
            task = %id,
            kernel,
            function_id,
            %worker_class,
            predecessors = predecessors.len(),
            attached,
            "task submitted"
        );
        Ok(TaskHandle {
            id,
            predecessors: predecessors.into_iter().collect(),
            buffers,
        })
    }

    /// Block until `task` completed.
    ///
    /// # Errors
    /// `TaskExecutionFailure` if the session was aborted first.
    ///
    /// # Panics
    /// If `task` was never submitted.
    pub fn wait(&self, task: TaskId) -> Result<()> {
        self.executor.wait_for(task)
    }

    /// Finish the session: wait for every task, stop the agents and release
    /// the outermost scope.
    ///
    /// # Errors
    /// - `TaskExecutionFailure` if any task failed.
    /// - `ScopeImbalance` if nested scopes were left open. Their tasks are
    ///   still waited for and their buffers reclaimed.
    pub fn end(mut self) -> Result<SessionReport> {
        let outstanding: Vec<TaskId> = self.scope_tasks.iter().flatten().copied().collect();
        let outcome = self.executor.wait_all(&outstanding);
        let agents = self.executor.shutdown();
        let unclosed = self.arena.depth().saturating_sub(1);
        while self.arena.depth() > 0 {
            let reclaimed = self.arena.close_scope()?;
            self.regions.invalidate(&reclaimed.buffers);
        }
        self.scope_tasks.clear();

        if let Err(err) = outcome {
            error!(error = %err, "orchestration session aborted");
            return Err(err);
        }
        if unclosed != 0 {
            return Err(OrchestrationError::ScopeImbalance(
                "session ended with nested scopes still open",
            ));
        }
        let report = SessionReport {
            tasks_submitted: self.next_task,
            tasks_completed: self.executor.completed(),
            arena_peak: self.arena.peak(),
            agents,
        };
        info!(
            tasks = report.tasks_submitted,
            arena_peak = report.arena_peak,
            "orchestration session finished"
        );
        Ok(report)
    }
}

/// Nested scope that closes when dropped.
///
/// Dereferences to the [`Context`], so tasks are submitted through the guard.
/// Dropping cannot report errors; call [`ScopeGuard::close`] to observe them.
///
/// The guard only ever closes the scope it opened. If that scope is no longer
/// the innermost one when the guard closes, nothing is closed.
#[must_use = "dropping the guard closes the scope immediately"]
#[derive(Debug)]
pub struct ScopeGuard<'a> {
    ctx: &'a mut Context,
    /// Depth of the guarded scope.
    depth: usize,
    closed: bool,
}

impl ScopeGuard<'_> {
    /// Close the scope, reporting failures.
    ///
    /// # Errors
    /// - `ScopeImbalance` if the guarded scope was already closed through the
    ///   context, or scopes opened inside it are still open.
    /// - See [`Context::close_scope`].
    pub fn close(mut self) -> Result<()> {
        self.close_guarded()
    }

    fn close_guarded(&mut self) -> Result<()> {
        self.closed = true;
        if self.ctx.scope_depth() != self.depth {
            return Err(OrchestrationError::ScopeImbalance(
                "guarded scope is not the innermost open scope",
            ));
        }
        self.ctx.close_scope()
    }
}

impl Deref for ScopeGuard<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.ctx
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.ctx
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close_guarded() {
                error!(error = %err, depth = self.depth, "closing scope on drop failed");
            }
        }
    }
}
