use std::collections::HashMap;
use std::sync::Mutex;

use relay_store::TaskEvent;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum BusItem {
    Event(TaskEvent),
    End,
}

#[derive(Default)]
struct TaskChannel {
    next_subscriber_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<BusItem>)>,
}

/// In-process fan-out of task events to live subscribers.
///
/// Channels are unbounded so a slow observer can never force an event drop;
/// the no-gap delivery contract rules out lossy broadcast. A task's channel
/// exists only while it has subscribers and disappears on end-of-stream, so
/// the registry does not grow with finished tasks.
#[derive(Default)]
pub struct TaskEventBus {
    channels: Mutex<HashMap<String, TaskChannel>>,
}

impl TaskEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, task_id: &str) -> (u64, mpsc::UnboundedReceiver<BusItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock().expect("event bus mutex poisoned");
        let channel = channels.entry(task_id.to_string()).or_default();
        channel.next_subscriber_id += 1;
        let id = channel.next_subscriber_id;
        channel.subscribers.push((id, tx));
        (id, rx)
    }

    pub(crate) fn detach(&self, task_id: &str, subscriber_id: u64) {
        let mut channels = self.channels.lock().expect("event bus mutex poisoned");
        if let Some(channel) = channels.get_mut(task_id) {
            channel.subscribers.retain(|(id, _)| *id != subscriber_id);
            if channel.subscribers.is_empty() {
                channels.remove(task_id);
            }
        }
    }

    pub(crate) fn publish(&self, task_id: &str, event: TaskEvent) {
        let mut channels = self.channels.lock().expect("event bus mutex poisoned");
        if let Some(channel) = channels.get_mut(task_id) {
            channel
                .subscribers
                .retain(|(_, tx)| tx.send(BusItem::Event(event.clone())).is_ok());
        }
    }

    pub(crate) fn end(&self, task_id: &str) {
        let mut channels = self.channels.lock().expect("event bus mutex poisoned");
        if let Some(channel) = channels.remove(task_id) {
            for (_, tx) in channel.subscribers {
                let _ = tx.send(BusItem::End);
            }
        }
    }

    pub fn active_channels(&self) -> usize {
        self.channels.lock().expect("event bus mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_store::TaskEventKind;
    use serde_json::json;

    fn event(id: i64) -> TaskEvent {
        TaskEvent {
            id,
            task_id: "t-1".to_string(),
            kind: TaskEventKind::Delta,
            data: json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn subscribers_receive_published_events_then_end() {
        let bus = TaskEventBus::new();
        let (_, mut rx) = bus.attach("t-1");

        bus.publish("t-1", event(1));
        bus.end("t-1");

        assert!(matches!(rx.recv().await, Some(BusItem::Event(e)) if e.id == 1));
        assert!(matches!(rx.recv().await, Some(BusItem::End)));
        assert_eq!(bus.active_channels(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn detach_removes_empty_channel() {
        let bus = TaskEventBus::new();
        let (id, _rx) = bus.attach("t-1");
        assert_eq!(bus.active_channels(), 1);
        bus.detach("t-1", id);
        assert_eq!(bus.active_channels(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = TaskEventBus::new();
        bus.publish("t-unknown", event(1));
        assert_eq!(bus.active_channels(), 0);
    }
}
