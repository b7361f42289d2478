// src/engine/queue.rs

use std::collections::VecDeque;

use crate::model::Id;

/// FIFO queue of pending task IDs waiting for a free worker.
///
/// The queue only holds IDs; the tasks themselves live in the supervisor's
/// task table. An ID leaves the queue when a worker accepts it, when the task
/// is canceled while still pending, or temporarily while a hand-off is being
/// attempted (a failed hand-off puts it back at the head).
#[derive(Debug, Default)]
pub struct RunQueue {
    ids: VecDeque<Id>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: Id) {
        self.ids.push_back(id);
    }

    /// Return a task to the head of the queue after a failed hand-off.
    pub fn requeue_front(&mut self, id: Id) {
        self.ids.push_front(id);
    }

    pub fn pop(&mut self) -> Option<Id> {
        self.ids.pop_front()
    }

    /// Remove a specific task, e.g. when it is canceled before dispatch.
    pub fn remove(&mut self, id: Id) -> bool {
        match self.ids.iter().position(|queued| *queued == id) {
            Some(pos) => {
                self.ids.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: Id) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Id> {
        self.ids.iter()
    }
}
