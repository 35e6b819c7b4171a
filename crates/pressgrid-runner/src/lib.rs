//! pressgrid-runner — the process boundary of the control plane.
//!
//! Nothing in pressgrid touches a node directly. Side effects go through
//! two injected capabilities:
//!
//! - [`PlaybookRunner`]: runs an allow-listed [`Playbook`] with an inventory
//!   and an extra-vars file ([`AnsibleRunner`] spawns `ansible-playbook`)
//! - [`SshRunner`]: runs one remote command for synchronous queries
//!   ([`ExecSshRunner`] spawns `ssh`)
//!
//! Exit codes are mapped to the job error taxonomy once, here, as
//! [`ExecutionError`].
//!
//! ```text
//! handler ──► PlaybookExecutor ──► tempdir{inventory.ini, vars.json}
//!                 │                      │
//!                 ├── timeout / shutdown │
//!                 ▼                      ▼
//!           PlaybookRunner::run(PlaybookInvocation) ──► RunnerError ──► ExecutionError
//! ```

pub mod error;
pub mod executor;
pub mod inventory;
pub mod playbook;
pub mod ssh;

pub use error::{classify_exit, codes, ExecutionError, RunnerError, SshError};
pub use executor::PlaybookExecutor;
pub use inventory::InventoryTarget;
pub use playbook::{redact_vars, AnsibleRunner, Playbook, PlaybookInvocation, PlaybookRunner};
pub use ssh::{is_unreachable_output, ExecSshRunner, SshRunner};
