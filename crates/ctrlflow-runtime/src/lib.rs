//! Structured non-local control flow for Rust threads.
//!
//! This library provides two independent unwinding mechanisms:
//!
//! - Typed exceptions with try/catch/finally ([`Try`], [`try_catch!`],
//!   [`throw`], [`rethrow`]), plus optional translation of hardware faults
//!   (division by zero, invalid memory access, ...) into thrown values
//!   ([`signal`]).
//! - Deferred cleanups with panic/recover ([`scope`], [`defer()`],
//!   [`scoped_defer`], [`panic()`], [`recover`]).
//!
//! # Architecture
//!
//! Both mechanisms keep a strictly per-thread stack: open try-scopes for
//! exceptions, open cleanup frames for defer. Transfers ride on native
//! unwinding, with a private payload per mechanism, so an exception never
//! stops at a `recover` and a panic never stops at a catch clause.
//!
//! ```
//! use ctrlflow_runtime::{throw, try_catch};
//! use std::cell::Cell;
//!
//! let ran_finally = Cell::new(false);
//! try_catch! {
//!     { throw(5i32); }
//!     catch (i32, e) { assert_eq!(e, 5); }
//!     finally { ran_finally.set(true); }
//! }
//! assert!(ran_finally.get());
//! ```
//!
//! An exception that no try-scope catches, or a panic that no `recover`
//! intercepts, ends the calling thread only. Run thread bodies through
//! [`thread::run`] or [`thread::spawn`] to observe the resulting status.

mod config;
mod defer;
mod error;
mod exceptions;
mod throwable;
mod try_scope;
mod unwind;

pub mod errno;
pub mod hooks;
pub mod panic;
pub mod signal;
pub mod thread;

pub use config::{PanicConfig, RuntimeConfig, SignalConfig};
pub use defer::{defer, scope, scoped_defer, thread_init, FrameGuard, DEFER_MAX};
pub use error::{Result, RuntimeError};
pub use exceptions::{current_exception, rethrow, throw, try_depth, Exception};
pub use hooks::Hooks;
pub use panic::{panic, recover, ErrorCode};
pub use throwable::{Throwable, MAX_THROWABLE_SIZE};
pub use try_scope::{Stage, Try};

/// Runtime version for compatibility checking.
pub const RUNTIME_VERSION: u32 = 1;

/// Apply `config` process-wide and prepare the calling thread.
///
/// Call once, early in `main`, before spawning threads.
pub fn init(config: &RuntimeConfig) -> Result<()> {
    config.apply()?;
    defer::thread_init();
    log::debug!("ctrlflow runtime v{RUNTIME_VERSION} initialized");
    Ok(())
}
