mod agent;
mod queues;
/// Task window: ring buffer of in-flight tasks and their dependency counters.
pub mod window;

pub use crate::executor::agent::AgentStats;
use crate::{
    config::{Capacities, SchedulerConfig},
    error::{OrchestrationError, Result},
    executor::{
        queues::ReadyQueues,
        window::{ReadyTask, TaskWindow},
    },
    task::{Backend, TaskState},
    types::{TaskId, WorkerClass},
};
use derive_more::Debug;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::Arc;
use tracing::debug;

/// State shared between the builder and the scheduler agents.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) window: TaskWindow,
    pub(crate) queues: ReadyQueues,
    #[debug(skip)]
    pub(crate) backend: Box<dyn Backend>,
    progress: Mutex<Progress>,
    progress_changed: Condvar,
}

#[derive(Debug, Default)]
struct Progress {
    completed: u64,
    /// First failure observed; later ones are dropped.
    failure: Option<(TaskId, OrchestrationError)>,
    exited: Vec<AgentStats>,
}

impl Shared {
    fn task_completed(&self) {
        self.progress.lock().completed += 1;
        self.progress_changed.notify_all();
    }

    fn task_failed(&self, task: TaskId, error: OrchestrationError) {
        {
            let mut progress = self.progress.lock();
            if progress.failure.is_none() {
                progress.failure = Some((task, error));
            }
        }
        self.queues.close();
        self.progress_changed.notify_all();
    }

    fn agent_exited(&self, stats: AgentStats) {
        self.progress.lock().exited.push(stats);
        self.progress_changed.notify_all();
    }
}

/// Execution side of a session: the task window, the per-class ready queues
/// and the scheduler agents draining them.
///
/// Agents run on a dedicated rayon pool with one thread per agent. The
/// builder feeds ready tasks in through [`Executor::enqueue`]; completions
/// are processed by the agents themselves.
#[must_use]
#[derive(Debug)]
pub struct Executor {
    shared: Arc<Shared>,
    #[debug(skip)]
    pool: ThreadPool,
    agents: usize,
    stopped: bool,
}

impl Executor {
    /// Build the task window and start the scheduler agents.
    ///
    /// # Errors
    /// `AgentSpawn` if the agent threads cannot be created.
    pub fn start(
        capacities: &Capacities,
        scheduler: &SchedulerConfig,
        backend: impl Backend,
    ) -> Result<Self> {
        let agents = scheduler.agents.get();
        let pool = ThreadPoolBuilder::new()
            .num_threads(agents)
            .thread_name(|index| format!("tgo-sched-{index}"))
            .build()
            .map_err(|err| OrchestrationError::AgentSpawn(err.to_string()))?;
        let shared = Arc::new(Shared {
            window: TaskWindow::new(capacities.task_window, capacities.edge_pool),
            queues: ReadyQueues::default(),
            backend: Box::new(backend),
            progress: Mutex::new(Progress::default()),
            progress_changed: Condvar::new(),
        });
        {
            let shared = Arc::clone(&shared);
            pool.spawn_broadcast(move |ctx| {
                let stats = agent::run(&shared, ctx.index());
                shared.agent_exited(stats);
            });
        }
        debug!(
            agents,
            window = capacities.task_window.get(),
            edge_pool = capacities.edge_pool,
            "executor started"
        );
        Ok(Self {
            shared,
            pool,
            agents,
            stopped: false,
        })
    }

    /// The task window.
    #[must_use]
    pub fn window(&self) -> &TaskWindow {
        &self.shared.window
    }

    /// Hand a ready task to its class's queue.
    pub fn enqueue(&self, task: ReadyTask) {
        self.shared.queues.push(task);
    }

    /// Number of tasks waiting in `class`'s ready queue.
    #[must_use]
    pub fn queued(&self, class: WorkerClass) -> usize {
        self.shared.queues.len(class)
    }

    /// Number of tasks completed so far.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.shared.progress.lock().completed
    }

    /// The failure that aborted the session, if any.
    #[must_use]
    pub fn failure(&self) -> Option<(TaskId, OrchestrationError)> {
        self.shared.progress.lock().failure.clone()
    }

    /// Block until `task` completed.
    ///
    /// # Errors
    /// The session's `TaskExecutionFailure` if any task failed first.
    ///
    /// # Panics
    /// If `task` was never submitted.
    pub fn wait_for(&self, task: TaskId) -> Result<()> {
        let mut progress = self.shared.progress.lock();
        loop {
            if let Some((_, error)) = &progress.failure {
                return Err(error.clone());
            }
            let state = self
                .shared
                .window
                .state(task)
                .expect("Executor::wait_for: task was never submitted");
            if state == TaskState::Completed {
                return Ok(());
            }
            self.shared.progress_changed.wait(&mut progress);
        }
    }

    /// Block until every task in `tasks` completed.
    ///
    /// # Errors
    /// The session's `TaskExecutionFailure` if any task failed first.
    pub fn wait_all(&self, tasks: &[TaskId]) -> Result<()> {
        tasks.iter().try_for_each(|&task| self.wait_for(task))
    }

    /// Stop the agents once they are idle and collect their counters.
    ///
    /// Tasks still queued are dropped, so callers wait for completion first.
    pub fn shutdown(&mut self) -> Vec<AgentStats> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;
        self.shared.queues.close();
        let mut progress = self.shared.progress.lock();
        while progress.exited.len() < self.agents {
            self.shared.progress_changed.wait(&mut progress);
        }
        let mut stats = core::mem::take(&mut progress.exited);
        drop(progress);
        stats.sort_unstable_by_key(|stats| stats.index);
        debug!(threads = self.pool.current_num_threads(), "executor stopped");
        stats
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Unblock the agents so the pool can wind down.
        self.shared.queues.close();
    }
}
