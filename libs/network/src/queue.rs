//! Thread-safe message queue with type filters
//!
//! A FIFO of owned [`Message`]s guarded by one `parking_lot::Mutex` and a
//! condition variable signalled on every push. Consumers can restrict what
//! they pop with a set of type-id filters. A disabled queue hands out a
//! sentinel message once it is empty, which lets blocked consumers notice
//! shutdown without a separate flag.

use emsg_codec::Message;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

struct Inner {
    entries: VecDeque<Message>,
    filters: HashSet<u32>,
    disabled: Option<Message>,
}

impl Inner {
    fn position_filtered(&self) -> Option<usize> {
        if self.filters.is_empty() {
            return if self.entries.is_empty() { None } else { Some(0) };
        }
        self.entries.iter().position(|m| self.filters.contains(&m.type_id))
    }

    /// The sentinel stands in only for an empty queue
    fn sentinel(&self) -> Option<&Message> {
        if self.entries.is_empty() {
            self.disabled.as_ref()
        } else {
            None
        }
    }

    fn take_at(&mut self, index: Option<usize>) -> Option<Message> {
        match index {
            Some(i) => self.entries.remove(i),
            None => self.sentinel().cloned(),
        }
    }
}

/// Mutex-guarded FIFO of messages
pub struct MessageQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                filters: HashSet::new(),
                disabled: None,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a message and wake waiters
    pub fn push_tail(&self, msg: Message) {
        self.inner.lock().entries.push_back(msg);
        self.available.notify_all();
    }

    /// Insert a message at the front and wake waiters
    pub fn push_head(&self, msg: Message) {
        self.inner.lock().entries.push_front(msg);
        self.available.notify_all();
    }

    /// Remove the front message, or the sentinel if disabled and empty
    pub fn pop_head(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        let index = if inner.entries.is_empty() { None } else { Some(0) };
        inner.take_at(index)
    }

    /// Remove the earliest message whose type is in the filter set
    ///
    /// With no filters this is `pop_head`. Other entries keep their order.
    pub fn pop_filtered(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        let index = inner.position_filtered();
        inner.take_at(index)
    }

    /// Remove the earliest message satisfying `predicate`
    pub fn pop_matching<F>(&self, predicate: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let mut inner = self.inner.lock();
        let index = inner.entries.iter().position(|m| predicate(m));
        inner.take_at(index)
    }

    /// Inspect the front message (or the sentinel) without removing it
    pub fn peek_head<R>(&self, f: impl FnOnce(Option<&Message>) -> R) -> R {
        let inner = self.inner.lock();
        f(inner.entries.front().or(inner.sentinel()))
    }

    /// Inspect the message `pop_filtered` would return
    pub fn peek_filtered<R>(&self, f: impl FnOnce(Option<&Message>) -> R) -> R {
        let inner = self.inner.lock();
        let found = match inner.position_filtered() {
            Some(i) => inner.entries.get(i),
            None => inner.sentinel(),
        };
        f(found)
    }

    /// Inspect the message `pop_matching` would return
    pub fn peek_matching<P, R>(&self, predicate: P, f: impl FnOnce(Option<&Message>) -> R) -> R
    where
        P: Fn(&Message) -> bool,
    {
        let inner = self.inner.lock();
        let found = match inner.entries.iter().find(|m| predicate(m)) {
            Some(m) => Some(m),
            None => inner.sentinel(),
        };
        f(found)
    }

    /// Enable, or disable with a sentinel returned whenever the queue is empty
    ///
    /// Disabling wakes every waiter.
    pub fn enable(&self, enabled: bool, sentinel: impl FnOnce() -> Message) {
        let mut inner = self.inner.lock();
        if enabled {
            inner.disabled = None;
        } else {
            inner.disabled = Some(sentinel());
            drop(inner);
            self.available.notify_all();
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disabled.is_some()
    }

    pub fn add_filter(&self, type_id: u32) {
        self.inner.lock().filters.insert(type_id);
    }

    pub fn remove_filter(&self, type_id: u32) {
        self.inner.lock().filters.remove(&type_id);
    }

    pub fn clear_filters(&self) {
        self.inner.lock().filters.clear();
    }

    pub fn filters(&self) -> Vec<u32> {
        self.inner.lock().filters.iter().copied().collect()
    }

    /// Block until a filtered message is available or the queue is disabled
    ///
    /// Returns `None` when `timeout` elapses or `cancel` is raised. The cancel
    /// flag is read under the queue lock, so a `wake_all` issued after
    /// setting it cannot be missed.
    pub fn wait_pop_filtered(&self, timeout: Option<Duration>, cancel: Option<&AtomicBool>) -> Option<Message> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                return None;
            }
            let index = inner.position_filtered();
            if index.is_some() {
                return inner.take_at(index);
            }
            // A disabled queue releases waiters even if unmatched entries remain
            if let Some(sentinel) = &inner.disabled {
                return Some(sentinel.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut inner, deadline).timed_out() {
                        let index = inner.position_filtered();
                        return inner.take_at(index);
                    }
                }
                None => self.available.wait(&mut inner),
            }
        }
    }

    /// Wake every blocked waiter
    pub fn wake_all(&self) {
        let _guard = self.inner.lock();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Drop every queued message, keeping filters and the disabled state
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Take every queued message in order
    pub fn drain(&self) -> Vec<Message> {
        self.inner.lock().entries.drain(..).collect()
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MessageQueue")
            .field("len", &inner.entries.len())
            .field("filters", &inner.filters.len())
            .field("disabled", &inner.disabled.is_some())
            .finish()
    }
}
