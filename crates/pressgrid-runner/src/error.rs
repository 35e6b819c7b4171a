//! Runner errors and the classified execution error.

use thiserror::Error;

/// Stable error codes stored on failed jobs.
pub mod codes {
    pub const ANSIBLE_PLAY_ERROR: &str = "ANSIBLE_PLAY_ERROR";
    pub const ANSIBLE_HOST_FAILED: &str = "ANSIBLE_HOST_FAILED";
    pub const ANSIBLE_HOST_UNREACHABLE: &str = "ANSIBLE_HOST_UNREACHABLE";
    pub const ANSIBLE_SYNTAX_ERROR: &str = "ANSIBLE_SYNTAX_ERROR";
    pub const ANSIBLE_UNEXPECTED_ERROR: &str = "ANSIBLE_UNEXPECTED_ERROR";
    pub const ANSIBLE_TIMEOUT: &str = "ANSIBLE_TIMEOUT";
    pub const ANSIBLE_UNKNOWN_EXIT: &str = "ANSIBLE_UNKNOWN_EXIT";
}

/// Failure reported by a [`PlaybookRunner`](crate::PlaybookRunner).
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    #[error("playbook exited with code {code}")]
    Exit { code: i32, output: String },

    #[error("playbook timed out")]
    Timeout { output: String },

    #[error("failed to spawn playbook runner: {0}")]
    Spawn(String),
}

/// Failure reported by an [`SshRunner`](crate::SshRunner).
#[derive(Debug, Clone, Error)]
pub enum SshError {
    #[error("ssh command exited with code {code}")]
    Exit { code: i32, output: String },

    #[error("failed to spawn ssh: {0}")]
    Spawn(String),
}

impl SshError {
    pub fn output(&self) -> &str {
        match self {
            SshError::Exit { output, .. } => output,
            SshError::Spawn(message) => message,
        }
    }
}

/// Classified handler failure: `(code, message, retryable)`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ExecutionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    /// A non-retryable error with `code`.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(code, message, false)
    }

    /// Degrade an unstructured error to `ANSIBLE_UNKNOWN_EXIT`.
    pub fn unstructured(err: &dyn std::error::Error) -> Self {
        Self::fatal(codes::ANSIBLE_UNKNOWN_EXIT, err.to_string())
    }

    /// Map a runner failure onto the exit-code taxonomy.
    pub fn from_runner(err: &RunnerError) -> Self {
        match err {
            RunnerError::Exit { code, output } => {
                let (mapped, retryable) = classify_exit(*code);
                let message = if output.trim().is_empty() {
                    format!("ansible-playbook exited with code {code}")
                } else {
                    output.clone()
                };
                Self::new(mapped, message, retryable)
            }
            RunnerError::Timeout { output } => {
                let message = if output.trim().is_empty() {
                    "playbook timed out".to_string()
                } else {
                    output.clone()
                };
                Self::new(codes::ANSIBLE_TIMEOUT, message, true)
            }
            RunnerError::Spawn(message) => Self::fatal(codes::ANSIBLE_UNEXPECTED_ERROR, message.clone()),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(codes::ANSIBLE_TIMEOUT, message, true)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == codes::ANSIBLE_TIMEOUT
    }

    /// Replace the code, keeping message and retryability.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Fill an empty code with `ANSIBLE_UNKNOWN_EXIT` and an empty message with the code.
    pub fn normalized(mut self) -> Self {
        if self.code.trim().is_empty() {
            self.code = codes::ANSIBLE_UNKNOWN_EXIT.to_string();
        }
        if self.message.trim().is_empty() {
            self.message = self.code.clone();
        }
        self
    }
}

impl From<RunnerError> for ExecutionError {
    fn from(err: RunnerError) -> Self {
        ExecutionError::from_runner(&err)
    }
}

/// Exit code → `(code, retryable)`.
pub fn classify_exit(exit_code: i32) -> (&'static str, bool) {
    match exit_code {
        1 => (codes::ANSIBLE_PLAY_ERROR, true),
        2 => (codes::ANSIBLE_HOST_FAILED, true),
        4 => (codes::ANSIBLE_HOST_UNREACHABLE, true),
        5 => (codes::ANSIBLE_SYNTAX_ERROR, false),
        250 => (codes::ANSIBLE_UNEXPECTED_ERROR, false),
        _ => (codes::ANSIBLE_UNKNOWN_EXIT, false),
    }
}
