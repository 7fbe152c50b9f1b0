//! InMemorySessionTransport - プロセス内で完結するセッション transport
//!
//! ログイン・ログアウトの実処理はユーザーが渡す hook に任せ、この transport は
//! 状態管理だけを担当します。
//!
//! # 実装詳細
//! - ログインは tokio::sync::Mutex で直列化（同時に 1 回だけ）
//! - ログイン済みなら後続のリクエストはそのまま lease を受け取る
//! - `in_queue` が 0 より大きい間は `InUse`
//! - release hook はリクエストごとに必ず 1 回だけ呼ぶ（失敗時はエラーを返す前）
//!
//! # 使用例
//! ```ignore
//! let params = SessionParams::new().login(|ctx| async move {
//!     let token = fetch_token(ctx.enhancement.username).await?;
//!     Ok(Some(json!({ "token": token })))
//! });
//! let session = Session::new("api", Arc::new(InMemorySessionFactory::new(params)), opts);
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{Span, debug, warn};

use crate::app::broadcaster::{Listener, StatusBroadcaster, Unsubscribe};
use crate::domain::{
    LeaseHandle, RequestRef, SessionState, SessionStatus, TaskerError, merge_state,
};
use crate::ports::{
    Clock, LoginEnhancement, LoginEnhancer, SessionObject, SessionRequest, SessionTransport,
    SystemClock, TransportConfig, TransportFactory,
};

/// Input of the login hook.
#[derive(Debug, Clone)]
pub struct LoginContext {
    pub enhancement: LoginEnhancement,
    /// Transport state at the time of the login.
    pub state: Value,
}

/// Returns a partial state to merge on success.
pub type LoginFn =
    Arc<dyn Fn(LoginContext) -> BoxFuture<'static, Result<Option<Value>, TaskerError>> + Send + Sync>;

pub type LogoutFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), TaskerError>> + Send + Sync>;

/// Login/logout hooks. Without a login hook the session counts as
/// logged in from the start.
#[derive(Clone, Default)]
pub struct SessionParams {
    login: Option<LoginFn>,
    logout: Option<LogoutFn>,
}

impl SessionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn login<F, Fut>(mut self, login: F) -> Self
    where
        F: Fn(LoginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, TaskerError>> + Send + 'static,
    {
        self.login = Some(Arc::new(move |ctx: LoginContext| login(ctx).boxed()));
        self
    }

    pub fn logout<F, Fut>(mut self, logout: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskerError>> + Send + 'static,
    {
        self.logout = Some(Arc::new(move |state: Value| logout(state).boxed()));
        self
    }
}

impl fmt::Debug for SessionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionParams")
            .field("login", &self.login.is_some())
            .field("logout", &self.logout.is_some())
            .finish()
    }
}

pub struct InMemorySessionFactory {
    params: SessionParams,
    clock: Arc<dyn Clock>,
}

impl InMemorySessionFactory {
    pub fn new(params: SessionParams) -> Self {
        Self {
            params,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl TransportFactory for InMemorySessionFactory {
    fn create(&self, config: TransportConfig) -> Arc<dyn SessionTransport> {
        Arc::new(InMemorySessionTransport::new(
            config,
            self.params.clone(),
            Arc::clone(&self.clock),
        ))
    }
}

pub struct InMemorySessionTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    name: String,
    span: Span,
    log_requests: bool,
    params: SessionParams,
    enhancer: Arc<dyn LoginEnhancer>,
    clock: Arc<dyn Clock>,
    state: Mutex<Value>,
    login_lock: tokio::sync::Mutex<()>,
    shut_down: AtomicBool,
    status: StatusBroadcaster<SessionStatus>,
}

impl InMemorySessionTransport {
    pub fn new(config: TransportConfig, params: SessionParams, clock: Arc<dyn Clock>) -> Self {
        let mut status = SessionStatus::new(config.name.clone());
        status.state = SessionState::Ready;
        status.is_logged_in = params.login.is_none();
        Self {
            inner: Arc::new(TransportInner {
                name: config.name,
                span: config.span,
                log_requests: config.log_requests,
                params,
                enhancer: config.enhancer,
                clock,
                state: Mutex::new(config.initial_state.unwrap_or(Value::Null)),
                login_lock: tokio::sync::Mutex::new(()),
                shut_down: AtomicBool::new(false),
                status: StatusBroadcaster::new(status),
            }),
        }
    }
}

impl TransportInner {
    fn is_logged_in(&self) -> bool {
        self.status.snapshot().is_logged_in
    }

    async fn ensure_logged_in(&self, reference: RequestRef) -> Result<(), TaskerError> {
        let Some(login) = self.params.login.clone() else {
            return Ok(());
        };
        let _serialized = self.login_lock.lock().await;
        if self.is_logged_in() {
            return Ok(());
        }

        self.status.change_status(|s| s.state = SessionState::LoggingIn);
        debug!(parent: &self.span, "logging in");
        let enhancement = self.enhancer.enhance(reference).await;
        let state = self.state.lock().clone();

        match login(LoginContext { enhancement, state }).await {
            Ok(update) => {
                if let Some(partial) = update {
                    merge_state(&mut self.state.lock(), partial);
                }
                let now = self.clock.now();
                self.status.change_status(|s| {
                    s.is_logged_in = true;
                    s.last_login = Some(now);
                    s.error = None;
                    s.state = SessionState::InUse;
                });
                debug!(parent: &self.span, "logged in");
                Ok(())
            }
            Err(err) => {
                let err = match err {
                    TaskerError::LoginFailed(_) => err,
                    other => TaskerError::LoginFailed(other.to_string()),
                };
                self.status.change_status(|s| s.is_logged_in = false);
                Err(err)
            }
        }
    }

    /// Bookkeeping once a request leaves the queue.
    fn finish_request(&self, error: Option<&TaskerError>) {
        let message = error.map(ToString::to_string);
        self.status.change_status(|s| {
            s.in_queue = s.in_queue.saturating_sub(1);
            if message.is_some() {
                s.error = message;
            }
            s.state = if s.state == SessionState::Shutdown {
                SessionState::Shutdown
            } else if s.in_queue > 0 {
                SessionState::InUse
            } else if s.error.is_some() && !s.is_logged_in {
                SessionState::Error
            } else {
                SessionState::Ready
            };
        });
    }
}

#[async_trait]
impl SessionTransport for InMemorySessionTransport {
    async fn request_session(&self, request: SessionRequest) -> Result<LeaseHandle, TaskerError> {
        let SessionRequest {
            reference,
            timeout,
            on_release,
        } = request;
        let inner = &self.inner;

        if inner.shut_down.load(Ordering::SeqCst) {
            on_release(reference).await;
            return Err(TaskerError::Operation(format!(
                "session '{}' is shut down",
                inner.name
            )));
        }

        inner.status.change_status(|s| {
            s.in_queue += 1;
            if s.state != SessionState::LoggingIn {
                s.state = SessionState::InUse;
            }
        });
        if inner.log_requests {
            debug!(parent: &inner.span, %reference, "session requested");
        }

        let outcome = match tokio::time::timeout(timeout, inner.ensure_logged_in(reference)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskerError::Timeout { after: timeout }),
        };

        match outcome {
            Ok(()) => {
                let payload = SessionObject {
                    name: inner.name.clone(),
                    state: inner.state.lock().clone(),
                    reference,
                };
                let owner = Arc::clone(inner);
                Ok(LeaseHandle::new(payload, move || async move {
                    owner.finish_request(None);
                    if owner.log_requests {
                        debug!(parent: &owner.span, %reference, "session released");
                    }
                    on_release(reference).await;
                }))
            }
            Err(err) => {
                warn!(parent: &inner.span, %reference, error = %err, "session request failed");
                inner.finish_request(Some(&err));
                on_release(reference).await;
                Err(err)
            }
        }
    }

    fn set_state(&self, partial: Value) {
        merge_state(&mut self.inner.state.lock(), partial);
    }

    fn state(&self) -> Value {
        self.inner.state.lock().clone()
    }

    fn is_logged_in(&self) -> bool {
        self.inner.is_logged_in()
    }

    fn invalidate_session(&self, reason: &str) {
        debug!(parent: &self.inner.span, reason, "session invalidated");
        self.inner.status.change_status(|s| s.is_logged_in = false);
    }

    async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(logout) = inner.params.logout.clone() {
            if inner.is_logged_in() {
                let state = inner.state.lock().clone();
                if let Err(err) = logout(state).await {
                    warn!(parent: &inner.span, error = %err, "logout failed");
                }
            }
        }
        inner.status.change_status(|s| {
            s.state = SessionState::Shutdown;
            s.is_logged_in = false;
        });
        inner.status.teardown_all_timers();
    }

    fn on_status(&self, listener: Listener<SessionStatus>) -> Unsubscribe {
        self.inner.status.subscribe_arc(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NoEnhancement;

    #[async_trait]
    impl LoginEnhancer for NoEnhancement {
        async fn enhance(&self, _reference: RequestRef) -> LoginEnhancement {
            LoginEnhancement::default()
        }
    }

    fn transport(params: SessionParams) -> InMemorySessionTransport {
        InMemorySessionTransport::new(
            TransportConfig {
                name: "t".into(),
                span: Span::none(),
                log_requests: true,
                initial_state: None,
                enhancer: Arc::new(NoEnhancement),
            },
            params,
            Arc::new(SystemClock),
        )
    }

    fn request(timeout: Duration, released: &Arc<AtomicUsize>) -> SessionRequest {
        let released = Arc::clone(released);
        SessionRequest {
            reference: RequestRef::generate(&SystemClock),
            timeout,
            on_release: Box::new(move |_| {
                Box::pin(async move {
                    released.fetch_add(1, Ordering::SeqCst);
                })
            }),
        }
    }

    #[tokio::test]
    async fn logs_in_once_for_concurrent_requests() {
        let logins = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&logins);
        let t = transport(SessionParams::new().login(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(Some(serde_json::json!({"token": "abc"})))
            }
        }));
        let released = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            t.request_session(request(Duration::from_secs(1), &released)),
            t.request_session(request(Duration::from_secs(1), &released)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert_eq!(a.payload::<SessionObject>().unwrap().state["token"], "abc");
        assert_eq!(t.inner.status.snapshot().in_queue, 2);

        a.release().await;
        b.release().await;
        assert_eq!(released.load(Ordering::SeqCst), 2);
        let status = t.inner.status.snapshot();
        assert_eq!(status.in_queue, 0);
        assert_eq!(status.state, SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_login_times_out_and_still_fires_release_hook() {
        let t = transport(SessionParams::new().login(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }));
        let released = Arc::new(AtomicUsize::new(0));

        let err = t
            .request_session(request(Duration::from_millis(50), &released))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TaskerError::Timeout {
                after: Duration::from_millis(50)
            }
        );
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(t.inner.status.snapshot().in_queue, 0);
    }

    #[tokio::test]
    async fn invalidation_forces_a_new_login() {
        let logins = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&logins);
        let t = transport(SessionParams::new().login(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        }));
        let released = Arc::new(AtomicUsize::new(0));

        let lease = t.request_session(request(Duration::from_secs(1), &released)).await.unwrap();
        lease.release().await;
        t.invalidate_session("test");
        assert!(!t.is_logged_in());

        let lease = t.request_session(request(Duration::from_secs(1), &released)).await.unwrap();
        lease.release().await;
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_logs_out_and_rejects_new_requests() {
        let logged_out = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&logged_out);
        let t = transport(
            SessionParams::new()
                .login(|_| async { Ok(None) })
                .logout(move |_| {
                    flag.store(true, Ordering::SeqCst);
                    async { Ok(()) }
                }),
        );
        let released = Arc::new(AtomicUsize::new(0));
        let lease = t.request_session(request(Duration::from_secs(1), &released)).await.unwrap();
        lease.release().await;

        t.shutdown().await;
        assert!(logged_out.load(Ordering::SeqCst));
        assert_eq!(t.inner.status.snapshot().state, SessionState::Shutdown);

        assert!(t.request_session(request(Duration::from_secs(1), &released)).await.is_err());
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }
}
