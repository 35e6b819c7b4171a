//! pressgrid-state — embedded state store for the pressgrid control plane.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for nodes, sites, environments, releases, backups, domains, drift
//! checks, jobs, restore sidecars and audit entries.
//!
//! # Architecture
//!
//! ```text
//!   service command ──► StateStore::with_tx(|tx| { read ─► decide ─► write ─► enqueue })
//!                                     │
//!                                     ▼
//!                       redb WriteTransaction (single writer)
//!                          commit on Ok / abort on Err
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns
//! and bound to their table through the [`Record`] trait. redb admits one
//! write transaction at a time, which is what makes "read state, decide,
//! enqueue" atomic for every service command and worker claim.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod record;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use record::Record;
pub use store::{StateStore, StoreTx, StoreView};
pub use types::*;
