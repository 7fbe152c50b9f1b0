//! StatusBroadcaster - ステータスの保持と通知
//!
//! Every component owns one broadcaster holding its current status snapshot.
//!
//! - `subscribe` replays the current snapshot to the new listener right away.
//! - `change_status` only emits when the snapshot actually changed, and
//!   emissions are coalesced: all changes made before the next scheduling
//!   point reach listeners as a single call carrying the latest snapshot.
//! - Deliveries never overlap, so every listener sees snapshots in the order
//!   they were made and ends on the latest one.
//! - Timers registered here are torn down together with the component.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

pub type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Marker for types that can be broadcast as status snapshots.
pub trait Snapshot: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> Snapshot for T {}

/// Detaches a listener. Dropping it without calling
/// [`unsubscribe`](Self::unsubscribe) keeps the listener attached.
#[must_use = "call `unsubscribe()` to detach the listener"]
pub struct Unsubscribe {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn new(detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn noop() -> Self {
        Self { detach: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe").finish_non_exhaustive()
    }
}

/// Cancels one timer registered through [`StatusBroadcaster::set_timer`].
#[must_use = "dropping the canceller leaves the timer armed"]
pub struct TimerCanceller {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl TimerCanceller {
    /// Cancel without invoking the callback. No-op if it already fired.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerCanceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerCanceller").finish_non_exhaustive()
    }
}

struct TimerEntry {
    callback: Box<dyn FnOnce() + Send>,
    fire_on_teardown: bool,
    abort: Option<AbortHandle>,
}

struct Inner<S> {
    snapshot: S,
    listeners: Vec<(u64, Listener<S>)>,
    emit_pending: bool,
    timers: HashMap<u64, TimerEntry>,
}

struct Shared<S> {
    inner: Mutex<Inner<S>>,
    /// Held while listeners are being called. Lock order: `deliver`, then `inner`.
    deliver: Mutex<()>,
    next_id: AtomicU64,
}

impl<S: Snapshot> Shared<S> {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver pending snapshots until none is left. If another flush is
    /// already delivering (on another thread, or further up this stack from
    /// a listener), that flush picks up the pending snapshot instead.
    fn flush(&self) {
        loop {
            {
                let Some(_delivering) = self.deliver.try_lock() else {
                    return;
                };
                while let Some((snapshot, listeners)) = self.take_pending() {
                    for listener in listeners {
                        listener(&snapshot);
                    }
                }
            }
            // a change may have landed between the last check and the unlock
            if !self.inner.lock().emit_pending {
                return;
            }
        }
    }

    fn take_pending(&self) -> Option<(S, Vec<Listener<S>>)> {
        let mut inner = self.inner.lock();
        if !inner.emit_pending {
            return None;
        }
        inner.emit_pending = false;
        let listeners = inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
        Some((inner.snapshot.clone(), listeners))
    }

    fn cancel_timer(&self, id: u64) {
        let entry = self.inner.lock().timers.remove(&id);
        if let Some(abort) = entry.and_then(|e| e.abort) {
            abort.abort();
        }
    }
}

pub struct StatusBroadcaster<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for StatusBroadcaster<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Snapshot + fmt::Debug> fmt::Debug for StatusBroadcaster<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBroadcaster")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl<S: Snapshot> StatusBroadcaster<S> {
    pub fn new(initial: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    snapshot: initial,
                    listeners: Vec::new(),
                    emit_pending: false,
                    timers: HashMap::new(),
                }),
                deliver: Mutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn snapshot(&self) -> S {
        self.shared.inner.lock().snapshot.clone()
    }

    pub fn subscribe(&self, listener: impl Fn(&S) + Send + Sync + 'static) -> Unsubscribe {
        self.subscribe_arc(Arc::new(listener))
    }

    /// Attach a listener; it receives the current snapshot before this returns.
    ///
    /// Must not be called from inside a listener of the same broadcaster.
    pub fn subscribe_arc(&self, listener: Listener<S>) -> Unsubscribe {
        let id = self.shared.next_id();
        {
            let _delivering = self.shared.deliver.lock();
            let snapshot = {
                let mut inner = self.shared.inner.lock();
                inner.listeners.push((id, Arc::clone(&listener)));
                inner.snapshot.clone()
            };
            listener(&snapshot);
        }
        // a flush that ran into the replay left its snapshot pending
        self.shared.flush();

        let weak = Arc::downgrade(&self.shared);
        Unsubscribe::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.inner.lock().listeners.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Apply `update` to a copy of the snapshot and publish it if anything
    /// changed. Returns whether the snapshot changed.
    ///
    /// `update` runs under the broadcaster lock and must not call back into it.
    pub fn change_status(&self, update: impl FnOnce(&mut S)) -> bool {
        let schedule = {
            let mut inner = self.shared.inner.lock();
            let mut next = inner.snapshot.clone();
            update(&mut next);
            if next == inner.snapshot {
                return false;
            }
            inner.snapshot = next;
            !std::mem::replace(&mut inner.emit_pending, true)
        };
        if schedule {
            self.schedule_emit();
        }
        true
    }

    /// Deliver a pending emission immediately.
    pub fn flush(&self) {
        self.shared.flush();
    }

    fn schedule_emit(&self) {
        match Handle::try_current() {
            Ok(handle) => {
                let weak: Weak<Shared<S>> = Arc::downgrade(&self.shared);
                handle.spawn(async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.flush();
                    }
                });
            }
            // outside a runtime there is no later turn to defer to
            Err(_) => self.shared.flush(),
        }
    }

    /// Run `callback` after `delay` unless cancelled first.
    ///
    /// With `fire_on_teardown`, [`teardown_all_timers`](Self::teardown_all_timers)
    /// invokes the callback instead of dropping it. Must be called from within
    /// a tokio runtime.
    pub fn set_timer(
        &self,
        delay: Duration,
        fire_on_teardown: bool,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerCanceller {
        let id = self.shared.next_id();
        self.shared.inner.lock().timers.insert(
            id,
            TimerEntry {
                callback: Box::new(callback),
                fire_on_teardown,
                abort: None,
            },
        );

        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let entry = weak
                .upgrade()
                .and_then(|shared| shared.inner.lock().timers.remove(&id));
            if let Some(entry) = entry {
                (entry.callback)();
            }
        });
        if let Some(entry) = self.shared.inner.lock().timers.get_mut(&id) {
            entry.abort = Some(task.abort_handle());
        }

        let weak = Arc::downgrade(&self.shared);
        TimerCanceller {
            cancel: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.cancel_timer(id);
                }
            })),
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.shared.inner.lock().timers.len()
    }

    /// Cancel every outstanding timer, invoking those registered with
    /// `fire_on_teardown`, then flush any pending emission.
    pub fn teardown_all_timers(&self) {
        let entries: Vec<TimerEntry> = self
            .shared
            .inner
            .lock()
            .timers
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
            if entry.fire_on_teardown {
                (entry.callback)();
            }
        }
        self.shared.flush();
    }
}
