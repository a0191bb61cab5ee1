use crate::{
    error::{Capacity, OrchestrationError, Result},
    sync::{AtomicU8, AtomicU32, AtomicUsize, Mutex, Ordering, fence},
    task::{TaskRecord, TaskState},
    types::{TaskId, WorkerClass},
};
use core::num::NonZeroUsize;
use std::sync::Arc;

/// A task whose dependency counter just reached zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReadyTask {
    /// The task.
    pub id: TaskId,
    /// Queue it belongs to.
    pub class: WorkerClass,
}

/// Fixed pool of dependency edges.
///
/// An edge is reserved before a submission mutates anything and returned when
/// its predecessor completes, so exhaustion never leaves a half-wired task.
#[derive(Debug)]
pub struct EdgePool {
    capacity: usize,
    used: AtomicUsize,
}

impl EdgePool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    fn reserve(&self, edges: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(edges);
            if next > self.capacity {
                return Err(OrchestrationError::CapacityExceeded {
                    capacity: Capacity::EdgePool,
                    requested: edges as u64,
                    available: self.capacity.saturating_sub(current) as u64,
                });
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, edges: usize) {
        if edges != 0 {
            let before = self.used.fetch_sub(edges, Ordering::Relaxed);
            assert!(before >= edges, "EdgePool::release: [1]");
        }
    }
}

#[derive(Debug)]
#[repr(align(128))]
struct TaskSlot {
    /// Predecessors that haven't completed yet, plus one until the task is
    /// sealed.
    pending: AtomicU32,
    /// `TaskState` of the occupant.
    state: AtomicU8,
    inner: Mutex<SlotInner>,
}

#[derive(Debug, Default)]
struct SlotInner {
    occupant: Option<TaskId>,
    record: Option<Arc<TaskRecord>>,
    /// Tasks waiting on the occupant. Taken when the occupant completes.
    successors: Vec<TaskId>,
}

/// Ring buffer of in-flight tasks with per-task dependency countdowns.
///
/// Protocol:
/// - The builder `insert`s a task with its counter at one (the seal guard),
///   `attach`es it to each predecessor, then `seal`s it. Attaching happens
///   under the predecessor's slot lock and is skipped once the predecessor
///   has completed, so a completion racing with a submission is never lost.
/// - A completing task marks itself completed under its own lock, takes its
///   successor list and decrements every successor. Whoever moves a counter
///   to zero (sealer or completer) is the single owner of the `Ready`
///   transition.
#[derive(Debug)]
pub struct TaskWindow {
    slots: Box<[TaskSlot]>,
    edges: EdgePool,
}

impl TaskWindow {
    /// Window with `capacity` slots and room for `edge_pool` outstanding edges.
    #[must_use]
    pub fn new(capacity: NonZeroUsize, edge_pool: usize) -> Self {
        let slots = (0..capacity.get())
            .map(|_| TaskSlot {
                pending: AtomicU32::new(0),
                state: AtomicU8::new(TaskState::Completed as u8),
                inner: Mutex::new(SlotInner::default()),
            })
            .collect();
        Self {
            slots,
            edges: EdgePool::new(edge_pool),
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Edges currently reserved or attached.
    #[must_use]
    pub fn edges_in_use(&self) -> usize {
        self.edges.used.load(Ordering::Relaxed)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, id: TaskId) -> &TaskSlot {
        &self.slots[(id.get() % self.slots.len() as u64) as usize]
    }

    /// Check that the slot `id` maps to is free or holds a completed task.
    ///
    /// # Errors
    /// `CapacityExceeded(TaskWindow)` otherwise.
    pub fn check_vacancy(&self, id: TaskId) -> Result<()> {
        let slot = self.slot(id);
        let inner = slot.inner.lock();
        let state = TaskState::from_u8(slot.state.load(Ordering::Acquire));
        if inner.occupant.is_none() || state == TaskState::Completed {
            Ok(())
        } else {
            Err(OrchestrationError::CapacityExceeded {
                capacity: Capacity::TaskWindow,
                requested: 1,
                available: 0,
            })
        }
    }

    /// Reserve `count` edges for an upcoming submission.
    ///
    /// # Errors
    /// `CapacityExceeded(EdgePool)` if the pool cannot hold them all.
    pub fn reserve_edges(&self, count: usize) -> Result<()> {
        self.edges.reserve(count)
    }

    /// Return edges reserved but never attached.
    pub fn release_edges(&self, count: usize) {
        self.edges.release(count);
    }

    /// Place a task in its slot, unsealed and `Pending`.
    ///
    /// # Panics
    /// If the slot is still occupied by an unfinished task.
    pub fn insert(&self, record: TaskRecord) {
        let id = record.id;
        let slot = self.slot(id);
        let mut inner = slot.inner.lock();
        assert!(
            inner.occupant.is_none()
                || TaskState::from_u8(slot.state.load(Ordering::Acquire)) == TaskState::Completed,
            "TaskWindow::insert: slot of {id} is busy"
        );
        assert!(inner.successors.is_empty(), "TaskWindow::insert: [1]");
        inner.occupant = Some(id);
        inner.record = Some(Arc::new(record));
        slot.pending.store(1, Ordering::Relaxed);
        slot.state.store(TaskState::Pending as u8, Ordering::Release);
    }

    /// Make `succ` wait for `pred`, consuming one reserved edge.
    ///
    /// Returns `false` (and gives the edge back) when `pred` already completed
    /// or its slot was reused.
    pub fn attach(&self, pred: TaskId, succ: TaskId) -> bool {
        assert!(pred < succ, "TaskWindow::attach: edge {pred}->{succ} goes backwards");
        let slot = self.slot(pred);
        let mut inner = slot.inner.lock();
        let completed = inner.occupant != Some(pred)
            || TaskState::from_u8(slot.state.load(Ordering::Acquire)) == TaskState::Completed;
        if completed {
            drop(inner);
            self.edges.release(1);
            return false;
        }
        self.slot(succ).pending.fetch_add(1, Ordering::Relaxed);
        inner.successors.push(succ);
        true
    }

    /// Drop the seal guard. Returns the task if nothing is left to wait for.
    pub fn seal(&self, id: TaskId) -> Option<ReadyTask> {
        if self.slot(id).pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            Some(self.make_ready(id))
        } else {
            None
        }
    }

    fn make_ready(&self, id: TaskId) -> ReadyTask {
        let slot = self.slot(id);
        let inner = slot.inner.lock();
        assert_eq!(inner.occupant, Some(id), "TaskWindow::make_ready: [1]");
        let previous = slot
            .state
            .swap(TaskState::Ready as u8, Ordering::AcqRel);
        assert_eq!(
            previous,
            TaskState::Pending as u8,
            "TaskWindow::make_ready: {id} became ready twice"
        );
        let class = inner
            .record
            .as_ref()
            .expect("TaskWindow::make_ready: [2]")
            .worker_class;
        ReadyTask { id, class }
    }

    fn transition(&self, id: TaskId, from: TaskState, to: TaskState) {
        let result = self.slot(id).state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(
            result.is_ok(),
            "TaskWindow::transition: {id} is not {from} (wanted {to})"
        );
    }

    /// `Ready → Dispatched`. Returns what the backend needs to run the task.
    pub fn dispatch(&self, id: TaskId) -> Arc<TaskRecord> {
        self.transition(id, TaskState::Ready, TaskState::Dispatched);
        let inner = self.slot(id).inner.lock();
        assert_eq!(inner.occupant, Some(id), "TaskWindow::dispatch: [1]");
        Arc::clone(inner.record.as_ref().expect("TaskWindow::dispatch: [2]"))
    }

    /// `Dispatched → Running`.
    pub fn mark_running(&self, id: TaskId) {
        self.transition(id, TaskState::Dispatched, TaskState::Running);
    }

    /// `Running → Completed`. Returns the successors this completion released.
    pub fn complete(&self, id: TaskId) -> Vec<ReadyTask> {
        let slot = self.slot(id);
        let successors = {
            let mut inner = slot.inner.lock();
            assert_eq!(inner.occupant, Some(id), "TaskWindow::complete: [1]");
            let previous = slot
                .state
                .swap(TaskState::Completed as u8, Ordering::AcqRel);
            assert_eq!(
                previous,
                TaskState::Running as u8,
                "TaskWindow::complete: {id} completed twice or without running"
            );
            core::mem::take(&mut inner.successors)
        };
        self.edges.release(successors.len());

        if !successors.is_empty() {
            fence(Ordering::Release);
        }
        let released: Vec<TaskId> = successors
            .into_iter()
            .filter(|&succ| self.slot(succ).pending.fetch_sub(1, Ordering::Relaxed) == 1)
            .collect();
        if !released.is_empty() {
            fence(Ordering::Acquire);
        }
        released.into_iter().map(|succ| self.make_ready(succ)).collect()
    }

    /// `Running → Failed`. Successors stay blocked forever.
    pub fn fail(&self, id: TaskId) {
        self.transition(id, TaskState::Running, TaskState::Failed);
    }

    /// State of `id`, `None` if it was never inserted. A task whose slot has
    /// been taken over by a newer task reports `Completed`.
    #[must_use]
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        let slot = self.slot(id);
        let inner = slot.inner.lock();
        match inner.occupant {
            Some(occupant) if occupant == id => {
                Some(TaskState::from_u8(slot.state.load(Ordering::Acquire)))
            }
            Some(occupant) if occupant > id => Some(TaskState::Completed),
            _ => None,
        }
    }

    /// Whether `id`'s slot now belongs to a newer task.
    #[must_use]
    pub fn is_retired(&self, id: TaskId) -> bool {
        self.slot(id).inner.lock().occupant.is_some_and(|occupant| occupant > id)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn record(id: u64, class: WorkerClass) -> TaskRecord {
        TaskRecord::new(TaskId(id), 0, class, "noop", vec![])
    }

    fn window(slots: usize, edges: usize) -> TaskWindow {
        TaskWindow::new(NonZeroUsize::new(slots).unwrap(), edges)
    }

    fn run(window: &TaskWindow, id: u64) -> Vec<ReadyTask> {
        window.dispatch(TaskId(id));
        window.mark_running(TaskId(id));
        window.complete(TaskId(id))
    }

    #[test]
    fn root_is_ready_on_seal() {
        let window = window(4, 0);
        window.insert(record(0, WorkerClass::MatrixUnit));
        assert_eq!(window.state(TaskId(0)), Some(TaskState::Pending));
        assert_eq!(
            window.seal(TaskId(0)),
            Some(ReadyTask {
                id: TaskId(0),
                class: WorkerClass::MatrixUnit
            })
        );
        assert_eq!(window.state(TaskId(0)), Some(TaskState::Ready));
    }

    #[test]
    fn diamond_releases_join_once() {
        let window = window(8, 4);
        window.insert(record(0, WorkerClass::VectorUnit));
        window.seal(TaskId(0)).unwrap();
        for id in [1, 2] {
            window.insert(record(id, WorkerClass::VectorUnit));
            window.reserve_edges(1).unwrap();
            assert!(window.attach(TaskId(0), TaskId(id)));
            assert_eq!(window.seal(TaskId(id)), None);
        }
        window.insert(record(3, WorkerClass::MatrixUnit));
        window.reserve_edges(2).unwrap();
        assert!(window.attach(TaskId(1), TaskId(3)));
        assert!(window.attach(TaskId(2), TaskId(3)));
        assert_eq!(window.seal(TaskId(3)), None);
        assert_eq!(window.edges_in_use(), 4);

        let ready: Vec<_> = run(&window, 0).into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec![TaskId(1), TaskId(2)]);
        assert!(run(&window, 1).is_empty());
        assert_eq!(window.state(TaskId(3)), Some(TaskState::Pending));
        let ready = run(&window, 2);
        assert_eq!(
            ready,
            vec![ReadyTask {
                id: TaskId(3),
                class: WorkerClass::MatrixUnit
            }]
        );
        run(&window, 3);
        assert_eq!(window.edges_in_use(), 0);
    }

    #[test]
    fn attaching_to_completed_task_is_skipped() {
        let window = window(4, 1);
        window.insert(record(0, WorkerClass::VectorUnit));
        window.seal(TaskId(0)).unwrap();
        run(&window, 0);
        window.insert(record(1, WorkerClass::VectorUnit));
        window.reserve_edges(1).unwrap();
        assert!(!window.attach(TaskId(0), TaskId(1)));
        assert_eq!(window.edges_in_use(), 0);
        assert!(window.seal(TaskId(1)).is_some());
    }

    #[test]
    fn full_window_rejects_until_slot_completes() {
        let window = window(2, 0);
        for id in [0, 1] {
            window.check_vacancy(TaskId(id)).unwrap();
            window.insert(record(id, WorkerClass::VectorUnit));
            window.seal(TaskId(id)).unwrap();
        }
        assert!(matches!(
            window.check_vacancy(TaskId(2)),
            Err(OrchestrationError::CapacityExceeded {
                capacity: Capacity::TaskWindow,
                ..
            })
        ));
        assert_eq!(window.state(TaskId(0)), Some(TaskState::Ready));
        run(&window, 0);
        window.check_vacancy(TaskId(2)).unwrap();
        window.insert(record(2, WorkerClass::VectorUnit));
        assert!(window.is_retired(TaskId(0)));
        assert_eq!(window.state(TaskId(0)), Some(TaskState::Completed));
        assert_eq!(window.state(TaskId(5)), None);
    }

    #[test]
    fn edge_pool_is_bounded() {
        let window = window(2, 3);
        window.reserve_edges(2).unwrap();
        assert!(matches!(
            window.reserve_edges(2),
            Err(OrchestrationError::CapacityExceeded {
                capacity: Capacity::EdgePool,
                requested: 2,
                available: 1,
            })
        ));
        window.release_edges(2);
        window.reserve_edges(3).unwrap();
    }
}
