#![allow(missing_docs)]
#![cfg(feature = "loom")]

use core::num::NonZeroUsize;
use loom::{sync::Arc, thread};
use tgo::{
    executor::window::{ReadyTask, TaskWindow},
    task::{TaskRecord, TaskState},
    types::{TaskId, WorkerClass},
};

fn window(slots: usize, edges: usize) -> Arc<TaskWindow> {
    Arc::new(TaskWindow::new(NonZeroUsize::new(slots).unwrap(), edges))
}

fn submit(window: &TaskWindow, id: u64, preds: &[u64]) -> Option<ReadyTask> {
    window.insert(TaskRecord::new(
        TaskId(id),
        0,
        WorkerClass::VectorUnit,
        "loom",
        vec![],
    ));
    window.reserve_edges(preds.len()).unwrap();
    for &pred in preds {
        window.attach(TaskId(pred), TaskId(id));
    }
    window.seal(TaskId(id))
}

fn run(window: &TaskWindow, id: u64) -> Vec<ReadyTask> {
    window.dispatch(TaskId(id));
    window.mark_running(TaskId(id));
    window.complete(TaskId(id))
}

#[test]
fn loom_join_is_released_exactly_once() {
    loom::model(|| {
        // 0   1
        //  \ /
        //   2
        let window = window(4, 2);
        submit(&window, 0, &[]).unwrap();
        submit(&window, 1, &[]).unwrap();
        assert_eq!(submit(&window, 2, &[0, 1]), None);

        let handles: Vec<_> = [0, 1]
            .into_iter()
            .map(|id| {
                let window = Arc::clone(&window);
                thread::spawn(move || run(&window, id))
            })
            .collect();
        let released: Vec<ReadyTask> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, TaskId(2));
        assert_eq!(window.state(TaskId(2)), Some(TaskState::Ready));
        assert_eq!(window.edges_in_use(), 0);
    });
}

#[test]
fn loom_attach_racing_with_completion() {
    loom::model(|| {
        let window = window(4, 1);
        submit(&window, 0, &[]).unwrap();

        let completer = {
            let window = Arc::clone(&window);
            thread::spawn(move || run(&window, 0))
        };
        let sealed = submit(&window, 1, &[0]);
        let released = completer.join().unwrap();

        // Either the seal or the completion made the successor ready, never both.
        match (sealed, released.as_slice()) {
            (Some(ready), []) => assert_eq!(ready.id, TaskId(1)),
            (None, [ready]) => assert_eq!(ready.id, TaskId(1)),
            other => panic!("successor released {other:?}"),
        }
        assert_eq!(window.state(TaskId(1)), Some(TaskState::Ready));
        assert_eq!(window.edges_in_use(), 0);
    });
}

#[test]
fn loom_fan_out_from_one_completion() {
    loom::model(|| {
        // 0 -> {1, 2}, 1 and 2 run concurrently, 3 joins them.
        let window = window(4, 4);
        submit(&window, 0, &[]).unwrap();
        assert_eq!(submit(&window, 1, &[0]), None);
        assert_eq!(submit(&window, 2, &[0]), None);
        assert_eq!(submit(&window, 3, &[1, 2]), None);

        let ready = run(&window, 0);
        assert_eq!(ready.len(), 2);
        let handles: Vec<_> = ready
            .into_iter()
            .map(|task| {
                let window = Arc::clone(&window);
                thread::spawn(move || run(&window, task.id.get()))
            })
            .collect();
        let released: Vec<ReadyTask> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(released.iter().map(|task| task.id).collect::<Vec<_>>(), vec![TaskId(3)]);
        run(&window, 3);
        assert_eq!(window.state(TaskId(3)), Some(TaskState::Completed));
        assert_eq!(window.edges_in_use(), 0);
    });
}
