//! Unwind payloads used for non-local transfers.
//!
//! All control transfers in this crate ride on Rust's native unwinding:
//! `resume_unwind` starts the transfer (without invoking the panic hook) and
//! `catch_unwind` is the continuation point. Each catching site claims only
//! its own marker and resumes everything else untouched.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::panic::ErrorCode;

pub(crate) type Payload = Box<dyn Any + Send + 'static>;

/// An exception is on its way to the innermost try-scope.
///
/// Zero-sized, so boxing it does not allocate.
pub(crate) struct Thrown;

/// A catch clause asked for the pending exception to keep propagating.
pub(crate) struct Rethrown;

/// A defer-panic travelling to the `recover` call that owns `token`.
pub(crate) struct Panicking {
    pub(crate) code: ErrorCode,
    pub(crate) token: u64,
}

/// Payload of [`crate::thread::exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadExit {
    status: i32,
}

impl ThreadExit {
    pub(crate) fn new(status: i32) -> Self {
        Self { status }
    }

    /// Status the exiting thread reports.
    pub fn status(&self) -> i32 {
        self.status
    }
}

/// How an exception left a guarded closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Escape {
    Thrown,
    Rethrown,
}

/// Run `f`, turning exception unwinds into [`Escape`] and resuming any other
/// payload.
pub(crate) fn capture<R>(f: impl FnOnce() -> R) -> Result<R, Escape> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) if payload.is::<Thrown>() => Err(Escape::Thrown),
        Err(payload) if payload.is::<Rethrown>() => Err(Escape::Rethrown),
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// Best-effort text for a payload that is not one of ours.
pub(crate) fn describe(payload: &Payload) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if payload.is::<Thrown>() || payload.is::<Rethrown>() {
        "exception escaped its try-scope".to_string()
    } else if let Some(panicking) = payload.downcast_ref::<Panicking>() {
        format!("unrecovered panic with error {}", panicking.code)
    } else {
        "Box<dyn Any>".to_string()
    }
}
