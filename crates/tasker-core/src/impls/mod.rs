//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemorySessionFactory**: クロージャで login / logout を差し込めるセッション transport
//! - **CronScheduler / ManualScheduler**: cron 式とテスト用の手動 tick
//! - **MemoryStore**: メモリ上の key-value ストア（依存リソースと DataApi）
//! - **ResourcePool**: セマフォで貸し出しを制限するプール

pub mod cron_scheduler;
pub mod inmem_session;
pub mod memory_store;
pub mod pool;

pub use self::cron_scheduler::{CronScheduler, ManualScheduler, parse_schedule};
pub use self::inmem_session::{
    InMemorySessionFactory, InMemorySessionTransport, LoginContext, SessionParams,
};
pub use self::memory_store::{MemoryStore, MemoryStoreHandle, memory_data_api};
pub use self::pool::{PoolDependency, Pooled, ResourcePool};
