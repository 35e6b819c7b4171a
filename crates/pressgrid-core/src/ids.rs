//! Injectable identifier generation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Produces ids for entities and jobs.
pub trait IdGenerator: Send + Sync + fmt::Debug {
    fn new_id(&self) -> String;
}

/// Shared handle to an id generator.
pub type SharedIds = Arc<dyn IdGenerator>;

/// Random UUIDv4 ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV4Ids;

impl IdGenerator for UuidV4Ids {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic, monotonically increasing ids in UUIDv4 layout.
///
/// Ids sort in generation order, which keeps `(created_at, id)` ordering
/// predictable in tests that freeze the clock.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIds {
    fn new_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("00000000-0000-4000-8000-{n:012x}")
    }
}
