use crate::{
    error::{KernelError, OrchestrationError},
    executor::{Shared, queues::Popped},
    task::TaskRecord,
    types::WorkerClass,
};
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
};
use tracing::{debug, error, trace};

/// Counters of one scheduler agent, reported when the session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentStats {
    /// Agent number, `0..agents`.
    pub index: usize,
    /// Class whose queue the agent serves first.
    pub home: WorkerClass,
    /// Tasks handed to the backend.
    pub dispatched: u64,
    /// Tasks whose completion this agent processed.
    pub completed: u64,
    /// Dispatched tasks taken from another class's queue.
    pub stolen: u64,
}

/// Scheduler agent loop: pop, dispatch, run, publish completion.
///
/// Exits when the ready queues are closed, either by shutdown or because a
/// task failed.
pub(super) fn run(shared: &Shared, index: usize) -> AgentStats {
    let home = WorkerClass::ALL[index % WorkerClass::COUNT];
    let mut stats = AgentStats {
        index,
        home,
        dispatched: 0,
        completed: 0,
        stolen: 0,
    };
    debug!(agent = index, %home, "scheduler agent started");

    while let Some(Popped { id, stolen }) = shared.queues.pop(home) {
        let task = shared.window.dispatch(id);
        stats.dispatched += 1;
        if stolen {
            stats.stolen += 1;
        }
        trace!(agent = index, task = %id, kernel = %task.kernel, stolen, "dispatching");

        shared.window.mark_running(id);
        match execute(shared, &task) {
            Ok(()) => {
                let released = shared.window.complete(id);
                trace!(task = %id, released = released.len(), "completed");
                shared.queues.push_all(released);
                shared.task_completed();
                stats.completed += 1;
            }
            Err(cause) => {
                shared.window.fail(id);
                error!(task = %id, kernel = %task.kernel, %cause, "task failed, aborting session");
                shared.task_failed(
                    id,
                    OrchestrationError::TaskExecutionFailure {
                        task: id,
                        kernel: task.kernel.clone(),
                        function_id: task.function_id,
                        cause: cause.to_string(),
                    },
                );
            }
        }
    }

    debug!(
        agent = index,
        dispatched = stats.dispatched,
        completed = stats.completed,
        stolen = stats.stolen,
        "scheduler agent stopped"
    );
    stats
}

/// Run the backend, turning a panicking kernel into a task failure.
fn execute(shared: &Shared, task: &TaskRecord) -> Result<(), KernelError> {
    catch_unwind(AssertUnwindSafe(|| shared.backend.execute(task)))
        .unwrap_or_else(|payload| Err(KernelError::Failed(panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload");
    format!("kernel panicked: {message}")
}
