//! Use-case queue
//!
//! FIFO backlog of use cases waiting for a sandbox. Dequeue is atomic, so an
//! item is handed out at most once unless it is explicitly enqueued again.

use docprobe_core::domain::use_case::UseCase;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

/// A use case waiting for, or assigned to, a sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub index: u32,
    pub use_case: UseCase,
    /// Distinguishes sandboxes started for the same use case across deliveries
    pub attempt_id: Uuid,
}

impl QueueItem {
    pub fn new(index: u32, use_case: UseCase) -> Self {
        Self {
            index,
            use_case,
            attempt_id: Uuid::new_v4(),
        }
    }
}

#[derive(Default)]
pub struct UseCaseQueue {
    items: Mutex<VecDeque<QueueItem>>,
}

impl UseCaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_items<T>(&self, f: impl FnOnce(&mut VecDeque<QueueItem>) -> T) -> T {
        let mut items = match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut items)
    }

    /// Appends use cases in the given order
    pub fn enqueue<I>(&self, use_cases: I)
    where
        I: IntoIterator<Item = (u32, UseCase)>,
    {
        self.with_items(|items| {
            items.extend(
                use_cases
                    .into_iter()
                    .map(|(index, use_case)| QueueItem::new(index, use_case)),
            );
        });
    }

    pub fn dequeue(&self) -> Option<QueueItem> {
        self.with_items(|items| items.pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.with_items(|items| items.is_empty())
    }

    pub fn remaining_count(&self) -> usize {
        self.with_items(|items| items.len())
    }

    /// Removes and returns everything still queued
    pub fn drain(&self) -> Vec<QueueItem> {
        self.with_items(|items| items.drain(..).collect())
    }
}
