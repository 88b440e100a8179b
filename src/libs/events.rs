//! Task change notifications.
//!
//! Events are buffered while a transaction is open and published only after it
//! commits, so subscribers never observe state that is later rolled back.

use crate::libs::task::{Task, TaskStatus};
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Created { task: Task },
    Updated { task: Task },
    StatusChanged { path: String, from: TaskStatus, to: TaskStatus },
    Deleted { task: Task },
}

impl TaskEvent {
    pub fn path(&self) -> &str {
        match self {
            TaskEvent::Created { task } | TaskEvent::Updated { task } | TaskEvent::Deleted { task } => &task.path,
            TaskEvent::StatusChanged { path, .. } => path,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Sends to current subscribers. Having none is not an error.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = TaskEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}
