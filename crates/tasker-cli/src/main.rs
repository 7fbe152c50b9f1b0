use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tasker_core::app::{EnvVars, Preset, SessionOptions};
use tasker_core::domain::TaskerError;
use tasker_core::impls::{InMemorySessionFactory, LoginContext, SessionParams, memory_data_api};
use tasker_core::ports::SessionObject;
use tasker_core::{
    Control, Credentials, CredentialsData, DataApi, ManagedTask, Registry, Session, Task,
    TaskerConfig,
};

/// `TASKER_CONFIG` が指定されていればその JSON を読み、なければ manual preset + autostart
fn load_config() -> Result<TaskerConfig, TaskerError> {
    match std::env::var("TASKER_CONFIG") {
        Ok(path) => TaskerConfig::from_path(path),
        Err(_) => Ok(TaskerConfig {
            autostart_tasks: true,
            ..TaskerConfig::preset(Preset::Manual)
        }),
    }
}

async fn login(ctx: LoginContext) -> Result<Option<Value>, TaskerError> {
    let Some(user) = ctx.enhancement.username else {
        return Err(TaskerError::LoginFailed("no username provided".into()));
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(Some(json!({ "token": format!("token-{user}") })))
}

fn users_api(session: Arc<Session>) -> Arc<DataApi> {
    DataApi::builder("users")
        .session("login", session)
        .source("list", |ctx, _params| async move {
            let lease = ctx.request_resource("login", None).await?;
            let session = lease.payload::<SessionObject>()?;
            let token = session.state["token"].as_str().unwrap_or_default().to_string();
            Ok(json!([
                { "id": 1, "name": "alice", "fetched_with": token },
                { "id": 2, "name": "bob", "fetched_with": token },
            ]))
        })
        .build()
}

fn sync_task(users: Arc<DataApi>, store: Arc<DataApi>) -> Result<Task<u64>, TaskerError> {
    Task::<u64>::builder("sync-users")
        .source(users)
        .target(store)
        .interval(Duration::from_secs(30))
        .step("fetch", |ctx| async move {
            let users = ctx.get_from_source("users", "list", Value::Null).await?;
            let count = users.as_array().map_or(0, Vec::len) as u64;
            ctx.send_to_target("store", "set", json!({ "key": "users", "value": users }))
                .await?;
            ctx.set_source_last_updated("users", "list", Some(Utc::now()))?;
            ctx.with_state(|synced| *synced += count);
            Ok(Control::Next)
        })
        .step("report", |ctx| async move {
            info!(parent: ctx.span(), synced = ctx.state(), "users synced");
            Ok(Control::Next)
        })
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // (A) 認証情報とセッション
    let credentials = Arc::new(Credentials::from_env(
        "demo",
        &EnvVars {
            username: Some("TASKER_USERNAME".into()),
            password: Some("TASKER_PASSWORD".into()),
        },
    ));
    if credentials.credentials().username.is_none() {
        warn!("TASKER_USERNAME is not set; using demo credentials");
        credentials.set_credentials(CredentialsData::new("demo", "demo"));
    }
    let factory = Arc::new(InMemorySessionFactory::new(SessionParams::new().login(login)));
    let session = Arc::new(Session::new(
        "demo-login",
        factory,
        SessionOptions::default().credentials(credentials),
    ));

    // (B) API とタスク
    let task = sync_task(users_api(session), memory_data_api("store", Map::new()))?;
    let registry = Registry::with_tasks(config, [Arc::new(task) as Arc<dyn ManagedTask>])?;

    // (C) 起動して Ctrl-C を待つ
    registry.start();
    tokio::signal::ctrl_c().await?;

    registry.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&registry.status())?);
    Ok(())
}
