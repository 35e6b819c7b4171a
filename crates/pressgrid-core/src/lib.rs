//! pressgrid-core — shared building blocks for the pressgrid control plane.
//!
//! - [`config`]: `pressgrid.toml` parsing with per-section defaults
//! - [`clock`]: injectable UTC clock (system and manual)
//! - [`ids`]: injectable identifier generator (UUIDv4 and sequential)
//! - [`text`]: tail-preserving truncation for stored error messages

pub mod clock;
pub mod config;
pub mod ids;
pub mod text;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::PressConfig;
pub use ids::{IdGenerator, SequentialIds, SharedIds, UuidV4Ids};
pub use text::{truncate_tail, JOB_ERROR_MESSAGE_MAX, SERVICE_MESSAGE_MAX};
