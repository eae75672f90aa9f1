use std::collections::VecDeque;
use std::sync::Arc;

use relay_store::TaskEvent;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::bus::{BusItem, TaskEventBus};

/// Observer-facing sequence of a task's events.
///
/// Delivery order: replayed persisted events first, then live events until
/// end-of-stream. A single monotonic watermark spans both phases, so an id
/// delivered once is never delivered again — reconnection with a stale
/// `last_event_id` and the attach-before-replay race both dedup here.
pub struct TaskSubscription {
    bus: Arc<TaskEventBus>,
    task_id: String,
    subscriber_id: u64,
    replay: VecDeque<TaskEvent>,
    live: mpsc::UnboundedReceiver<BusItem>,
    watermark: i64,
    terminal_at_subscribe: bool,
    draining_buffer: bool,
    finished: bool,
}

impl TaskSubscription {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        bus: Arc<TaskEventBus>,
        task_id: String,
        subscriber_id: u64,
        replay: Vec<TaskEvent>,
        live: mpsc::UnboundedReceiver<BusItem>,
        last_event_id: i64,
        terminal_at_subscribe: bool,
    ) -> Self {
        Self {
            bus,
            task_id,
            subscriber_id,
            replay: VecDeque::from(replay),
            live,
            watermark: last_event_id,
            terminal_at_subscribe,
            draining_buffer: true,
            finished: false,
        }
    }

    /// Next event, or `None` at end-of-stream. The end signal is
    /// authoritative: after `None` the task has reached a terminal status.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        if self.finished {
            return None;
        }

        while let Some(event) = self.replay.pop_front() {
            if event.id <= self.watermark {
                continue;
            }
            self.watermark = event.id;
            return Some(event);
        }

        if self.draining_buffer {
            // live events buffered while the replay read ran
            loop {
                match self.live.try_recv() {
                    Ok(BusItem::Event(event)) if event.id > self.watermark => {
                        self.watermark = event.id;
                        return Some(event);
                    }
                    Ok(BusItem::Event(_)) => {}
                    Ok(BusItem::End) | Err(TryRecvError::Disconnected) => {
                        self.finished = true;
                        return None;
                    }
                    Err(TryRecvError::Empty) => {
                        self.draining_buffer = false;
                        break;
                    }
                }
            }
            if self.terminal_at_subscribe {
                self.finished = true;
                return None;
            }
        }

        loop {
            match self.live.recv().await {
                Some(BusItem::Event(event)) if event.id > self.watermark => {
                    self.watermark = event.id;
                    return Some(event);
                }
                Some(BusItem::Event(_)) => {}
                Some(BusItem::End) | None => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Drains the subscription to end-of-stream.
    pub async fn collect(mut self) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}

impl Drop for TaskSubscription {
    fn drop(&mut self) {
        self.bus.detach(&self.task_id, self.subscriber_id);
    }
}
