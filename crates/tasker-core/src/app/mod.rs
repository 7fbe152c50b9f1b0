//! App - アプリケーション層
//!
//! ports を組み合わせてランタイムの部品を実装します。
//!
//! # 主要コンポーネント
//! - **StatusBroadcaster**: ステータスの coalesce 配信とタイマー管理
//! - **Credentials / Session**: ログイン状態を持つ共有リソース
//! - **DataApi**: 名前付き source / target 操作
//! - **Task**: ステップ列の実行エンジン
//! - **Registry**: 登録・起動・停止・シャットダウン

pub mod broadcaster;
pub mod config;
pub mod credentials;
pub mod data_api;
pub mod registry;
pub mod session;
pub mod task;

pub use self::broadcaster::{Listener, StatusBroadcaster, TimerCanceller, Unsubscribe};
pub use self::config::{LogLevel, Preset, TaskerConfig};
pub use self::credentials::{Credentials, CredentialsData, EnvVars};
pub use self::data_api::{ApiContext, ApiSide, DataApi, DataApiBuilder};
pub use self::registry::{Registry, RegistryStatus};
pub use self::session::{DEFAULT_SESSION_TIMEOUT, Session, SessionOptions};
pub use self::task::{ManagedTask, SchedulePolicy, StepContext, Task, TaskBuilder};
