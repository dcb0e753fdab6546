//! Bounded three-class priority queue feeding the worker's drain loop.
//!
//! Urgent drains before default before background, FIFO within a class.
//! Capacity covers all classes together; a full queue rejects the push so
//! the caller can fail the request with `QUEUE_FULL`.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use weft_types::Priority;

struct Lanes<T> {
    urgent: VecDeque<T>,
    normal: VecDeque<T>,
    background: VecDeque<T>,
}

impl<T> Lanes<T> {
    fn len(&self) -> usize {
        self.urgent.len() + self.normal.len() + self.background.len()
    }
}

pub struct PriorityQueue<T> {
    lanes: Mutex<Lanes<T>>,
    capacity: usize,
    ready: Notify,
}

impl<T> PriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                urgent: VecDeque::new(),
                normal: VecDeque::new(),
                background: VecDeque::new(),
            }),
            capacity,
            ready: Notify::new(),
        }
    }

    /// Enqueue, or hand the item back when the queue is full.
    pub fn push(&self, item: T, priority: Priority) -> Result<(), T> {
        {
            let mut lanes = self.lanes.lock().expect("queue lock");
            if lanes.len() >= self.capacity {
                return Err(item);
            }
            match priority {
                Priority::Urgent => lanes.urgent.push_back(item),
                Priority::Default => lanes.normal.push_back(item),
                Priority::Background => lanes.background.push_back(item),
            }
        }
        self.ready.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let mut lanes = self.lanes.lock().expect("queue lock");
        lanes
            .urgent
            .pop_front()
            .or_else(|| lanes.normal.pop_front())
            .or_else(|| lanes.background.pop_front())
    }

    /// Await the next item (single-consumer).
    pub async fn wait_pop(&self) -> T {
        loop {
            if let Some(item) = self.pop() {
                return item;
            }
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
