use crate::{executor::window::ReadyTask, types::{TaskId, WorkerClass}};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

#[derive(Debug, Default)]
struct QueueState {
    queues: [VecDeque<TaskId>; WorkerClass::COUNT],
    closed: bool,
}

/// Task popped by an agent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Popped {
    pub(crate) id: TaskId,
    /// Taken from a queue other than the agent's home class.
    pub(crate) stolen: bool,
}

/// One FIFO ready queue per worker class, shared by all agents.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueues {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ReadyQueues {
    pub(crate) fn push(&self, task: ReadyTask) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.queues[task.class.index()].push_back(task.id);
        drop(state);
        self.available.notify_one();
    }

    pub(crate) fn push_all(&self, tasks: impl IntoIterator<Item = ReadyTask>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let mut pushed = 0usize;
        for task in tasks {
            state.queues[task.class.index()].push_back(task.id);
            pushed += 1;
        }
        drop(state);
        match pushed {
            0 => {}
            1 => {
                self.available.notify_one();
            }
            _ => {
                self.available.notify_all();
            }
        }
    }

    /// Pop the next task, preferring `home` and falling back to the other
    /// classes. Blocks while every queue is empty; returns `None` once the
    /// queues are closed.
    pub(crate) fn pop(&self, home: WorkerClass) -> Option<Popped> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(id) = state.queues[home.index()].pop_front() {
                return Some(Popped { id, stolen: false });
            }
            let stolen = WorkerClass::ALL
                .into_iter()
                .filter(|&class| class != home)
                .find_map(|class| state.queues[class.index()].pop_front());
            if let Some(id) = stolen {
                return Some(Popped { id, stolen: true });
            }
            self.available.wait(&mut state);
        }
    }

    /// Wake every agent and make further pops return `None`. Tasks still
    /// queued are dropped.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for queue in &mut state.queues {
            queue.clear();
        }
        drop(state);
        self.available.notify_all();
    }

    pub(crate) fn len(&self, class: WorkerClass) -> usize {
        self.state.lock().queues[class.index()].len()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn ready(id: u64, class: WorkerClass) -> ReadyTask {
        ReadyTask {
            id: TaskId(id),
            class,
        }
    }

    #[test]
    fn fifo_per_class_with_stealing() {
        let queues = ReadyQueues::default();
        queues.push_all([
            ready(0, WorkerClass::VectorUnit),
            ready(1, WorkerClass::MatrixUnit),
            ready(2, WorkerClass::VectorUnit),
        ]);
        assert_eq!(queues.len(WorkerClass::VectorUnit), 2);
        let first = queues.pop(WorkerClass::MatrixUnit).unwrap();
        assert_eq!(first, Popped { id: TaskId(1), stolen: false });
        let second = queues.pop(WorkerClass::MatrixUnit).unwrap();
        assert_eq!(second, Popped { id: TaskId(0), stolen: true });
        let third = queues.pop(WorkerClass::VectorUnit).unwrap();
        assert_eq!(third, Popped { id: TaskId(2), stolen: false });
    }

    #[test]
    fn close_wakes_blocked_agents() {
        let queues = std::sync::Arc::new(ReadyQueues::default());
        let waiter = {
            let queues = queues.clone();
            std::thread::spawn(move || queues.pop(WorkerClass::VectorUnit))
        };
        queues.close();
        assert_eq!(waiter.join().unwrap(), None);
        queues.push(ready(7, WorkerClass::VectorUnit));
        assert_eq!(queues.len(WorkerClass::VectorUnit), 0);
    }
}
