#![allow(dead_code)]

pub use shield_test_utils::builders;
pub use shield_test_utils::fake_executor;
pub use shield_test_utils::{init_tracing, with_timeout};

use std::time::Duration;

use shield::engine::SupervisorHandle;
use shield::model::{Id, Task};

/// Poll the supervisor until `pred` holds for the task (about 4 seconds).
pub async fn wait_for_task<F>(handle: &SupervisorHandle, id: Id, pred: F) -> Option<Task>
where
    F: Fn(&Task) -> bool,
{
    for _ in 0..200 {
        let tasks = handle.snapshot().await.ok()?;
        if let Some(task) = tasks.into_iter().find(|t| t.id == id) {
            if pred(&task) {
                return Some(task);
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

/// Poll until the supervisor's task table satisfies `pred`.
pub async fn wait_for_tasks<F>(handle: &SupervisorHandle, pred: F) -> Option<Vec<Task>>
where
    F: Fn(&[Task]) -> bool,
{
    for _ in 0..200 {
        let tasks = handle.snapshot().await.ok()?;
        if pred(&tasks) {
            return Some(tasks);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}
