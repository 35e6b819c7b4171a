//! Message truncation for persisted error text.
//!
//! Runner output puts the interesting part (the failing task, the stack
//! trace) at the end, so truncation keeps the tail and drops the head.

/// Hard cap for `jobs.error_message`.
pub const JOB_ERROR_MESSAGE_MAX: usize = 10 * 1024;

/// Cap for messages written by service completion APIs.
pub const SERVICE_MESSAGE_MAX: usize = 512;

/// Trim surrounding whitespace and keep at most the last `max_bytes` bytes.
///
/// The cut is moved forward to the next character boundary, so the result
/// is always valid UTF-8 and never longer than `max_bytes`.
pub fn truncate_tail(message: &str, max_bytes: usize) -> String {
    let trimmed = message.trim();
    if trimmed.len() <= max_bytes {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max_bytes;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}
