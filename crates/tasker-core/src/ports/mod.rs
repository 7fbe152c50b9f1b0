//! Ports - 抽象化レイヤー
//!
//! 外部コラボレーター（transport, cron, 時刻）へのインターフェース。
//! 実装は `impls` に置きます。

pub mod clock;
pub mod dependency;
pub mod scheduler;
pub mod session_transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::dependency::Dependency;
pub use self::scheduler::{Scheduler, TickFn};
pub use self::session_transport::{
    LoginEnhancement, LoginEnhancer, ReleaseHook, SessionObject, SessionRequest,
    SessionTransport, TransportConfig, TransportFactory,
};
