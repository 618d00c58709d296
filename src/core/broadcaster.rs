//! Event Broadcaster (C5): fans the session manager's single event channel
//! out to any number of independent subscribers.
//!
//! Grounded on the teacher's `core::git_events::GitEventWatcher`: a single
//! background thread, an `Arc<AtomicBool>` stop flag, and a join handle kept
//! alongside the thread's shared state. That module polls and diffs; this
//! one is a true pub/sub generalization of the same "one thread owns the
//! loop, others only flip a flag" shape. Subscriber delivery uses a small
//! condvar-backed bounded queue rather than `std::sync::mpsc` (which is
//! unbounded and so cannot express drop-oldest on its own).

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Condvar, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::core::session_manager::Event;

struct SubscriberInner {
    queue: Mutex<VecDeque<Event>>,
    cv: Condvar,
    buf_size: usize,
    closed: AtomicBool,
}

/// The receiving half handed back from `subscribe`. Blocking `recv` is used
/// by RPC's `StreamEvents` handler thread; `try_recv` by in-process consumers
/// (the local TUI) that poll on their own event loop tick.
pub struct EventReceiver(Arc<SubscriberInner>);

impl EventReceiver {
    pub fn recv(&self) -> Option<Event> {
        let mut q = self.0.queue.lock().expect("subscriber queue mutex poisoned");
        loop {
            if let Some(e) = q.pop_front() {
                return Some(e);
            }
            if self.0.closed.load(Ordering::SeqCst) {
                return None;
            }
            q = self.0.cv.wait(q).expect("subscriber condvar wait poisoned");
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.0.queue.lock().expect("subscriber queue mutex poisoned").pop_front()
    }
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberInner>>>,
    next_id: AtomicU64,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

pub type SharedBroadcaster = Arc<Broadcaster>;

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    /// Registers a new subscriber with a bounded buffer of `bufSize` events.
    pub fn subscribe(&self, buf_size: usize) -> (u64, EventReceiver) {
        let inner = Arc::new(SubscriberInner {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            buf_size: buf_size.max(1),
            closed: AtomicBool::new(false),
        });
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().expect("subscriber map mutex poisoned").insert(id, inner.clone());
        (id, EventReceiver(inner))
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Some(inner) = self.subscribers.lock().expect("subscriber map mutex poisoned").remove(&id) {
            inner.closed.store(true, Ordering::SeqCst);
            inner.cv.notify_all();
        }
    }

    fn publish(&self, event: Event) {
        let subs = self.subscribers.lock().expect("subscriber map mutex poisoned");
        for (id, inner) in subs.iter() {
            let mut q = inner.queue.lock().expect("subscriber queue mutex poisoned");
            if q.len() >= inner.buf_size {
                q.pop_front();
                warn!(subscriber_id = id, "broadcaster dropped oldest event for slow subscriber");
            }
            q.push_back(event.clone());
            inner.cv.notify_one();
        }
    }

    /// Runs the fan-out loop on the calling thread until `source` closes or
    /// `stop()` is called.
    fn run(self: &Arc<Self>, source: Receiver<Event>) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match source.recv_timeout(Duration::from_millis(200)) {
                Ok(event) => self.publish(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let subs = self.subscribers.lock().expect("subscriber map mutex poisoned");
        for inner in subs.values() {
            inner.closed.store(true, Ordering::SeqCst);
            inner.cv.notify_all();
        }
    }

    /// Spawns the drain thread. Mirrors `GitEventWatcher::start`'s
    /// idempotent "only one background thread per instance" guard.
    pub fn spawn(self: &Arc<Self>, source: Receiver<Event>) {
        let mut handle = self.handle.lock().expect("broadcaster handle mutex poisoned");
        if handle.is_some() {
            return;
        }
        let me = self.clone();
        *handle = Some(thread::spawn(move || me.run(source)));
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().expect("broadcaster handle mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session_manager::SessionStatus;
    use std::sync::mpsc;

    fn state_event(id: &str) -> Event {
        Event::StateChange {
            session_id: id.to_string(),
            old_status: SessionStatus::Running,
            new_status: SessionStatus::Idle,
        }
    }

    #[test]
    fn drop_oldest_keeps_buffer_bounded() {
        let bc = Broadcaster::new();
        let (id, rx) = bc.subscribe(2);
        let (source_tx, source_rx) = mpsc::channel();
        bc.spawn(source_rx);

        for i in 0..5 {
            source_tx.send(state_event(&i.to_string())).unwrap();
        }
        drop(source_tx);
        bc.stop();

        let mut received = Vec::new();
        while let Some(e) = rx.try_recv() {
            received.push(e);
        }
        assert_eq!(received.len(), 2, "buffer of 2 can hold at most the two most recent events");
        bc.unsubscribe(id);
    }

    #[test]
    fn subscriber_removed_after_unsubscribe() {
        let bc = Broadcaster::new();
        let (id, _rx) = bc.subscribe(4);
        assert_eq!(bc.subscribers.lock().unwrap().len(), 1);
        bc.unsubscribe(id);
        assert_eq!(bc.subscribers.lock().unwrap().len(), 0);
    }
}
