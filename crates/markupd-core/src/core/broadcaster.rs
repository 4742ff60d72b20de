//! Broadcaster - fan task updates out to connected observers
//!
//! Each observer owns a bounded queue. A notification is encoded once and
//! offered to every observer without waiting. When an observer's queue is
//! full the new snapshot is coalesced into it rather than dropped: it replaces
//! the newest queued snapshot of the same task, and a terminal snapshot may
//! push out the oldest non-terminal one. An open observer therefore always
//! ends up with each task's final state.

use crate::types::Task;
use crate::ws::Outbound;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Per-observer queue depth
pub const OBSERVER_CHANNEL_CAPACITY: usize = 64;

/// Encoded frame shared by every observer of one notification
pub type Frame = Arc<str>;

/// Handle identifying a registered observer
pub type ObserverId = u64;

struct Pending {
    task_id: String,
    terminal: bool,
    frame: Frame,
}

/// What happened to a snapshot offered to a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offer {
    Queued,
    Merged,
    Displaced,
    Skipped,
}

struct ObserverQueue {
    pending: StdMutex<VecDeque<Pending>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl ObserverQueue {
    fn pending(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn offer(&self, item: Pending) -> Offer {
        let offer = {
            let mut pending = self.pending();
            if pending.len() < self.capacity {
                pending.push_back(item);
                Offer::Queued
            } else if let Some(slot) = pending.iter_mut().rev().find(|p| p.task_id == item.task_id)
            {
                // snapshots are cumulative, the newer one supersedes
                slot.terminal |= item.terminal;
                slot.frame = item.frame;
                Offer::Merged
            } else if item.terminal {
                if let Some(idx) = pending.iter().position(|p| !p.terminal) {
                    pending.remove(idx);
                }
                pending.push_back(item);
                Offer::Displaced
            } else {
                Offer::Skipped
            }
        };
        if offer != Offer::Skipped {
            self.notify.notify_one();
        }
        offer
    }

    fn pop(&self) -> Option<Frame> {
        self.pending().pop_front().map(|p| p.frame)
    }
}

/// Receiving side of one observer's queue
pub struct ObserverReceiver {
    queue: Arc<ObserverQueue>,
}

impl ObserverReceiver {
    /// Next frame, or `None` once the observer has been unregistered and
    /// its queue drained. Cancel safe.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.queue.pop() {
                return Some(frame);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Next frame if one is queued
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.queue.pop()
    }
}

impl Drop for ObserverReceiver {
    fn drop(&mut self) {
        self.queue.closed.store(true, Ordering::SeqCst);
    }
}

pub struct Broadcaster {
    observers: StdMutex<HashMap<ObserverId, Arc<ObserverQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(OBSERVER_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            observers: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    fn observers(&self) -> MutexGuard<'_, HashMap<ObserverId, Arc<ObserverQueue>>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new observer
    pub fn register(&self) -> (ObserverId, ObserverReceiver) {
        let queue = Arc::new(ObserverQueue {
            pending: StdMutex::new(VecDeque::with_capacity(self.capacity)),
            notify: Notify::new(),
            capacity: self.capacity,
            closed: AtomicBool::new(false),
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers().insert(id, Arc::clone(&queue));
        debug!(observer_id = id, "Observer registered");
        (id, ObserverReceiver { queue })
    }

    /// Remove an observer. Its receiver drains what is queued, then ends.
    /// Unknown ids are ignored.
    pub fn unregister(&self, id: ObserverId) {
        if let Some(queue) = self.observers().remove(&id) {
            queue.close();
            debug!(observer_id = id, "Observer unregistered");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers().len()
    }

    /// Offer a `task_update` for `task` to every open observer.
    ///
    /// Returns how many observers now hold the snapshot.
    pub fn notify(&self, task: &Task) -> usize {
        let frame: Frame = match (Outbound::TaskUpdate { task: task.clone() }).to_text() {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to encode task update");
                return 0;
            }
        };

        let snapshot: Vec<(ObserverId, Arc<ObserverQueue>)> = self
            .observers()
            .iter()
            .map(|(id, queue)| (*id, Arc::clone(queue)))
            .collect();

        let terminal = task.is_terminal();
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, queue) in snapshot {
            if queue.is_closed() {
                closed.push(id);
                continue;
            }
            let offer = queue.offer(Pending {
                task_id: task.id.clone(),
                terminal,
                frame: Arc::clone(&frame),
            });
            match offer {
                Offer::Queued => delivered += 1,
                Offer::Merged | Offer::Displaced => {
                    debug!(observer_id = id, task_id = %task.id, ?offer, "Observer queue full, update coalesced");
                    delivered += 1;
                }
                Offer::Skipped => {
                    debug!(observer_id = id, task_id = %task.id, "Observer queue full, update skipped");
                }
            }
        }

        if !closed.is_empty() {
            let mut observers = self.observers();
            for id in closed {
                observers.remove(&id);
                debug!(observer_id = id, "Pruned closed observer");
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ElementDescriptor;
    use crate::types::ChangeRequest;
    use crate::CommitInfo;
    use chrono::Utc;
    use std::path::PathBuf;

    fn task(id: &str) -> Task {
        let request = ChangeRequest {
            id: None,
            feedback_text: "x".to_string(),
            element_descriptor: ElementDescriptor::new("a"),
            project_path: PathBuf::from("/tmp"),
            page_url: None,
            model_hint: None,
        };
        Task::new(id.to_string(), &request, Utc::now())
    }

    fn status_of(frame: &str) -> (String, String) {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        (
            value["task"]["id"].as_str().unwrap().to_string(),
            value["task"]["status"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn test_notify_reaches_every_observer() {
        let b = Broadcaster::new();
        let (_a, mut rx_a) = b.register();
        let (_b, mut rx_b) = b.register();

        assert_eq!(b.notify(&task("t1")), 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["type"], "task_update");
            assert_eq!(value["task"]["id"], "t1");
        }
    }

    #[tokio::test]
    async fn test_full_queue_keeps_latest_snapshot_per_task() {
        let b = Broadcaster::with_capacity(2);
        let (_slow, mut slow_rx) = b.register();

        let mut t1 = task("t1");
        b.notify(&t1);
        t1.append_output("one\n");
        b.notify(&t1);
        // full: merged into the newest t1 frame
        t1.append_output("two\n");
        assert_eq!(b.notify(&t1), 1);
        // full, nothing queued for t2 and not terminal
        assert_eq!(b.notify(&task("t2")), 0);

        let first = slow_rx.try_recv().unwrap();
        assert!(!first.contains("one"));
        let second = slow_rx.try_recv().unwrap();
        assert!(second.contains("one\\ntwo\\n"));
        assert!(slow_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_terminal_snapshot_survives_full_queue() {
        let b = Broadcaster::with_capacity(4);
        let (_slow, mut slow_rx) = b.register();

        let mut t1 = task("t1");
        b.notify(&t1);
        for i in 0..8 {
            t1.append_output(&format!("line {}\n", i));
            b.notify(&t1);
        }
        assert!(t1.complete(0, CommitInfo::default(), Utc::now()));
        b.notify(&t1);

        let mut last = None;
        let mut received = 0;
        while let Some(frame) = slow_rx.try_recv() {
            received += 1;
            last = Some(status_of(&frame));
        }
        assert_eq!(received, 4);
        assert_eq!(last, Some(("t1".to_string(), "complete".to_string())));
    }

    #[tokio::test]
    async fn test_terminal_snapshot_displaces_oldest_progress() {
        let b = Broadcaster::with_capacity(2);
        let (_slow, mut slow_rx) = b.register();

        b.notify(&task("a"));
        b.notify(&task("b"));
        let mut c = task("c");
        assert!(c.fail(Some(1), None, Utc::now()));
        assert_eq!(b.notify(&c), 1);

        assert_eq!(status_of(&slow_rx.try_recv().unwrap()).0, "b");
        assert_eq!(
            status_of(&slow_rx.try_recv().unwrap()),
            ("c".to_string(), "failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_closed_observer_pruned() {
        let b = Broadcaster::new();
        let (_gone, rx) = b.register();
        let (_live, mut live_rx) = b.register();
        drop(rx);

        assert_eq!(b.notify(&task("t1")), 1);
        assert_eq!(b.observer_count(), 1);
        assert!(live_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unregister_ends_receiver_after_drain() {
        let b = Broadcaster::new();
        let (id, mut rx) = b.register();
        b.notify(&task("t1"));
        b.unregister(id);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_notify() {
        let b = Arc::new(Broadcaster::new());
        let (_id, mut rx) = b.register();

        let sender = Arc::clone(&b);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            sender.notify(&task("late"));
        });

        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status_of(&frame).0, "late");
    }

    #[test]
    fn test_notify_without_observers() {
        let b = Broadcaster::new();
        assert_eq!(b.notify(&task("t1")), 0);
    }

    #[test]
    fn test_unregister() {
        let b = Broadcaster::new();
        let (id, _rx) = b.register();
        let (other, _rx2) = b.register();
        assert_ne!(id, other);

        b.unregister(id);
        b.unregister(id);
        assert_eq!(b.observer_count(), 1);
    }
}
