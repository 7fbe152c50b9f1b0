//! LeaseHandle - 借用したリソースへのハンドル

use std::any::{Any, type_name};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::errors::TaskerError;

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A borrowed, releasable handle to a stateful resource.
///
/// Handles are cheap to clone; all clones share one release flag. `release()`
/// flips the flag before doing anything else, so the release hook runs at most
/// once no matter how many clones call it.
#[derive(Clone)]
pub struct LeaseHandle {
    inner: Arc<LeaseInner>,
}

struct LeaseInner {
    released: AtomicBool,
    payload: Arc<dyn Any + Send + Sync>,
    on_release: Mutex<Option<ReleaseFn>>,
}

impl LeaseHandle {
    pub fn new<T, F, Fut>(payload: T, on_release: F) -> Self
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let on_release: ReleaseFn = Box::new(move || Box::pin(on_release()));
        Self {
            inner: Arc::new(LeaseInner {
                released: AtomicBool::new(false),
                payload: Arc::new(payload),
                on_release: Mutex::new(Some(on_release)),
            }),
        }
    }

    /// A handle whose release has no side effect.
    pub fn detached<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                released: AtomicBool::new(false),
                payload: Arc::new(payload),
                on_release: Mutex::new(None),
            }),
        }
    }

    pub fn was_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self.inner.on_release.lock().take();
        if let Some(hook) = hook {
            hook().await;
        }
    }

    pub fn payload<T: Any + Send + Sync>(&self) -> Result<&T, TaskerError> {
        self.inner
            .payload
            .downcast_ref::<T>()
            .ok_or(TaskerError::PayloadType {
                expected: type_name::<T>(),
            })
    }
}

impl fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("was_released", &self.was_released())
            .finish_non_exhaustive()
    }
}
