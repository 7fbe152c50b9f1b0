//! tasker-core
//!
//! Scheduled data-sync runtime: tasks run ordered steps that read from
//! source apis and write to target apis, sharing logged-in sessions.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, control, lease, state, status, errors）
//! - **ports**: 抽象化レイヤー（SessionTransport, Scheduler, Dependency, Clock）
//! - **app**: アプリケーションロジック（broadcaster, session, data_api, task, registry）
//! - **impls**: 実装（in-memory session transport, cron scheduler, memory store, pool）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use crate::app::{
    Credentials, CredentialsData, DataApi, ManagedTask, Registry, Session, SessionOptions,
    StepContext, Task, TaskerConfig,
};
pub use crate::domain::{Control, TaskerError};
