//! Registry - 名前付きコンポーネントの登録と制御
//!
//! Registering a task walks everything it depends on: its source and target
//! apis, their sessions, parent sessions and credentials. Each component is
//! registered once, bound to its own span under `tasker`.
//!
//! The same name bound to two different instances is a `DuplicateName`
//! error; registering the same instance twice is fine.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{Span, debug, info_span};

use super::broadcaster::Unsubscribe;
use super::config::TaskerConfig;
use super::credentials::{Credentials, CredentialsData};
use super::data_api::DataApi;
use super::session::Session;
use super::task::ManagedTask;
use crate::domain::{CredentialsStatus, DataApiStatus, SessionStatus, TaskStatus, TaskerError};

/// Aggregated snapshot of every registered component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStatus {
    pub credentials: Vec<CredentialsStatus>,
    pub sessions: Vec<SessionStatus>,
    pub apis: Vec<DataApiStatus>,
    pub tasks: Vec<TaskStatus>,
}

struct Components {
    tasks: BTreeMap<String, Arc<dyn ManagedTask>>,
    sources: BTreeMap<String, Arc<DataApi>>,
    targets: BTreeMap<String, Arc<DataApi>>,
    sessions: BTreeMap<String, Arc<Session>>,
    credentials: BTreeMap<String, Arc<Credentials>>,
}

impl Components {
    fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            sources: BTreeMap::new(),
            targets: BTreeMap::new(),
            sessions: BTreeMap::new(),
            credentials: BTreeMap::new(),
        }
    }
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Add `item` to `staged` unless an identical instance is already known.
fn claim<T: ?Sized>(
    existing: &BTreeMap<String, Arc<T>>,
    staged: &mut BTreeMap<String, Arc<T>>,
    kind: &'static str,
    name: &str,
    item: &Arc<T>,
) -> Result<bool, TaskerError> {
    match existing.get(name).or_else(|| staged.get(name)) {
        Some(known) if same(known, item) => Ok(false),
        Some(_) => Err(TaskerError::DuplicateName {
            kind,
            name: name.to_string(),
        }),
        None => {
            staged.insert(name.to_string(), Arc::clone(item));
            Ok(true)
        }
    }
}

fn claim_session(
    existing: &Components,
    staged: &mut Components,
    session: &Arc<Session>,
) -> Result<(), TaskerError> {
    if !claim(&existing.sessions, &mut staged.sessions, "session", session.name(), session)? {
        return Ok(());
    }
    if let Some(parent) = session.parent() {
        claim_session(existing, staged, parent)?;
    }
    if let Some(credentials) = session.credentials() {
        claim(
            &existing.credentials,
            &mut staged.credentials,
            "credentials",
            credentials.name(),
            credentials,
        )?;
    }
    Ok(())
}

/// Logs a component's state transitions.
fn state_logger<S, K, F>(
    span: Span,
    kind: &'static str,
    state_of: F,
) -> impl Fn(&S) + Send + Sync + 'static
where
    S: 'static,
    F: Fn(&S) -> K + Send + Sync + 'static,
    K: PartialEq + Debug + Send + 'static,
{
    let previous: Mutex<Option<K>> = Mutex::new(None);
    move |status: &S| {
        let current = state_of(status);
        let mut previous = previous.lock();
        if previous.as_ref() != Some(&current) {
            if let Some(before) = previous.as_ref() {
                debug!(parent: &span, kind, from = ?before, to = ?current, "status changed");
            }
            *previous = Some(current);
        }
    }
}

pub struct Registry {
    config: TaskerConfig,
    span: Span,
    components: Mutex<Components>,
    watchers: Mutex<Vec<Unsubscribe>>,
}

impl Registry {
    pub fn new(config: TaskerConfig) -> Self {
        Self {
            config,
            span: info_span!("tasker"),
            components: Mutex::new(Components::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tasks(
        config: TaskerConfig,
        tasks: impl IntoIterator<Item = Arc<dyn ManagedTask>>,
    ) -> Result<Self, TaskerError> {
        let registry = Self::new(config);
        for task in tasks {
            registry.register_task(task)?;
        }
        Ok(registry)
    }

    pub fn config(&self) -> &TaskerConfig {
        &self.config
    }

    /// Register `task` and everything it depends on. Nothing is registered
    /// when a name conflict is found.
    pub fn register_task(&self, task: Arc<dyn ManagedTask>) -> Result<(), TaskerError> {
        let mut components = self.components.lock();
        let mut staged = Components::new();

        claim(&components.tasks, &mut staged.tasks, "task", task.name(), &task)?;
        for (kind, apis) in [("source", task.sources()), ("target", task.targets())] {
            for api in apis {
                let (existing, staging) = match kind {
                    "source" => (&components.sources, &mut staged.sources),
                    _ => (&components.targets, &mut staged.targets),
                };
                if claim(existing, staging, kind, api.name(), &api)? {
                    for session in api.sessions() {
                        claim_session(&components, &mut staged, session)?;
                    }
                }
            }
        }

        self.commit(&mut components, staged);
        Ok(())
    }

    fn commit(&self, components: &mut Components, staged: Components) {
        let log = self.config.log_status_changes;
        let mut watchers = Vec::new();

        for (name, credentials) in staged.credentials {
            let span = info_span!(parent: &self.span, "credentials", name = %name);
            credentials.register(span.clone());
            if log {
                let logger = state_logger(span, "credentials", |s: &CredentialsStatus| s.state);
                watchers.push(credentials.on_status(logger));
            }
            components.credentials.insert(name, credentials);
        }
        for (name, session) in staged.sessions {
            let span = info_span!(parent: &self.span, "session", name = %name);
            session.register(span.clone(), self.config.log_requests);
            if log {
                let logger = state_logger(span, "session", |s: &SessionStatus| s.state);
                watchers.push(session.on_status(logger));
            }
            components.sessions.insert(name, session);
        }
        for (kind, apis) in [("source", staged.sources), ("target", staged.targets)] {
            for (name, api) in apis {
                let span = info_span!(parent: &self.span, "api", kind, name = %name);
                api.register(span.clone());
                if log {
                    let logger = state_logger(span, kind, |s: &DataApiStatus| s.state);
                    watchers.push(api.on_status(logger));
                }
                match kind {
                    "source" => components.sources.insert(name, api),
                    _ => components.targets.insert(name, api),
                };
            }
        }
        for (name, task) in staged.tasks {
            let span = info_span!(parent: &self.span, "task", name = %name);
            task.register(span.clone());
            if log {
                let logger = state_logger(span, "task", |s: &TaskStatus| s.state);
                watchers.push(task.on_status(Arc::new(logger)));
            }
            components.tasks.insert(name, task);
        }

        self.watchers.lock().extend(watchers);
    }

    pub fn task(&self, name: &str) -> Option<Arc<dyn ManagedTask>> {
        self.components.lock().tasks.get(name).cloned()
    }

    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.components.lock().sessions.get(name).cloned()
    }

    pub fn credentials(&self, name: &str) -> Option<Arc<Credentials>> {
        self.components.lock().credentials.get(name).cloned()
    }

    fn tasks_named(&self, name: Option<&str>) -> Result<Vec<Arc<dyn ManagedTask>>, TaskerError> {
        let components = self.components.lock();
        match name {
            Some(name) => components
                .tasks
                .get(name)
                .cloned()
                .map(|t| vec![t])
                .ok_or_else(|| TaskerError::NotDefined {
                    kind: "task",
                    name: name.to_string(),
                }),
            None => Ok(components.tasks.values().cloned().collect()),
        }
    }

    /// Force-start every task when `autostart_tasks` is set. Runs are
    /// spawned onto the current runtime.
    pub fn start(&self) {
        if !self.config.autostart_tasks {
            return;
        }
        let tasks: Vec<_> = self.components.lock().tasks.values().cloned().collect();
        for task in tasks {
            tokio::spawn(async move { task.force_start().await });
        }
    }

    /// Force-start one task, or all of them with `None`.
    pub async fn start_task(&self, name: Option<&str>) -> Result<(), TaskerError> {
        let tasks = self.tasks_named(name)?;
        join_all(tasks.iter().map(|t| t.force_start())).await;
        Ok(())
    }

    pub fn stop_task(&self, name: Option<&str>) -> Result<(), TaskerError> {
        for task in self.tasks_named(name)? {
            task.force_stop();
        }
        Ok(())
    }

    pub fn invalidate_session(&self, name: Option<&str>) -> Result<(), TaskerError> {
        let sessions: Vec<Arc<Session>> = {
            let components = self.components.lock();
            match name {
                Some(name) => vec![components.sessions.get(name).cloned().ok_or_else(|| {
                    TaskerError::NotDefined {
                        kind: "session",
                        name: name.to_string(),
                    }
                })?],
                None => components.sessions.values().cloned().collect(),
            }
        };
        for session in sessions {
            session.invalidate_session();
        }
        Ok(())
    }

    pub fn set_credentials(&self, name: &str, data: CredentialsData) -> Result<(), TaskerError> {
        let credentials = self.credentials(name).ok_or_else(|| TaskerError::NotDefined {
            kind: "credentials",
            name: name.to_string(),
        })?;
        credentials.set_credentials(data);
        Ok(())
    }

    pub fn status(&self) -> RegistryStatus {
        let components = self.components.lock();
        let mut apis: BTreeMap<&str, DataApiStatus> = BTreeMap::new();
        for api in components.sources.values().chain(components.targets.values()) {
            apis.entry(api.name()).or_insert_with(|| api.status());
        }
        RegistryStatus {
            credentials: components.credentials.values().map(|c| c.status()).collect(),
            sessions: components.sessions.values().map(|s| s.status()).collect(),
            apis: apis.into_values().collect(),
            tasks: components.tasks.values().map(|t| t.status()).collect(),
        }
    }

    /// Stop every task, then shut every session down.
    pub async fn shutdown(&self) {
        debug!(parent: &self.span, "shutting down");
        let (tasks, sessions): (Vec<_>, Vec<_>) = {
            let components = self.components.lock();
            (
                components.tasks.values().cloned().collect(),
                components.sessions.values().cloned().collect(),
            )
        };
        for task in &tasks {
            task.shutdown();
        }
        join_all(sessions.iter().map(|s| s.shutdown())).await;
        for watcher in self.watchers.lock().drain(..) {
            watcher.unsubscribe();
        }
        debug!(parent: &self.span, "shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Task;
    use crate::domain::Control;
    use crate::impls::{InMemorySessionFactory, SessionParams, memory_data_api};
    use crate::app::session::SessionOptions;
    use serde_json::Map;

    fn task_with(name: &str, api: Arc<DataApi>) -> Arc<dyn ManagedTask> {
        Arc::new(
            Task::<()>::builder(name)
                .source(api)
                .step("noop", |_| async { Ok(Control::Next) })
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn same_instance_under_one_name_is_accepted() {
        let api = memory_data_api("mem", Map::new());
        let registry = Registry::new(TaskerConfig::default());
        registry.register_task(task_with("a", Arc::clone(&api))).unwrap();
        registry.register_task(task_with("b", api)).unwrap();
        assert_eq!(registry.status().apis.len(), 1);
        assert_eq!(registry.status().tasks.len(), 2);
    }

    #[test]
    fn different_instances_under_one_name_conflict() {
        let registry = Registry::new(TaskerConfig::default());
        registry
            .register_task(task_with("a", memory_data_api("mem", Map::new())))
            .unwrap();
        let err = registry
            .register_task(task_with("b", memory_data_api("mem", Map::new())))
            .unwrap_err();
        assert_eq!(
            err,
            TaskerError::DuplicateName {
                kind: "source",
                name: "mem".into()
            }
        );
        assert!(registry.task("b").is_none(), "nothing is registered on conflict");
    }

    #[tokio::test]
    async fn sessions_and_parents_are_registered_through_apis() {
        let factory = Arc::new(InMemorySessionFactory::new(SessionParams::new()));
        let parent = Arc::new(Session::new("parent", factory.clone(), SessionOptions::default()));
        let child = Arc::new(Session::new(
            "child",
            factory,
            SessionOptions::default().parent(Arc::clone(&parent)),
        ));
        let api = DataApi::builder("remote")
            .session("login", Arc::clone(&child))
            .source("ping", |_, _| async { Ok(serde_json::Value::Null) })
            .build();

        let registry = Registry::new(TaskerConfig::default());
        registry.register_task(task_with("t", api)).unwrap();

        assert!(parent.is_registered());
        assert!(child.is_registered());
        assert_eq!(registry.status().sessions.len(), 2);
        assert!(matches!(
            registry.invalidate_session(Some("nope")),
            Err(TaskerError::NotDefined { kind: "session", .. })
        ));
    }
}
