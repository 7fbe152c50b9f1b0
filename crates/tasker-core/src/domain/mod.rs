//! Domain model (IDs, errors, control symbols, leases, status snapshots).

pub mod control;
pub mod errors;
pub mod ids;
pub mod json;
pub mod lease;
pub mod state;
pub mod status;

pub use self::control::Control;
pub use self::errors::{ErrorKind, TaskerError};
pub use self::ids::{RequestRef, RunId};
pub use self::json::merge_state;
pub use self::lease::LeaseHandle;
pub use self::state::{ApiState, CredentialsState, SessionState, TaskRunState};
pub use self::status::{
    CredentialsStatus, DataApiStatus, SessionStatus, TaskStatus, Timestamps,
};
