//! Panic and recover over the cleanup-frame stack.
//!
//! [`panic`] walks the calling thread's cleanup frames from the innermost
//! outward, closing each one (its cleanups run) until it reaches a frame
//! that a [`recover`] call has marked. Control then transfers to that
//! `recover`, which returns the error code. With no marked frame, the
//! error is reported and the thread exits with the code as its status.
//!
//! Panics and exceptions are independent: a try-scope never catches a
//! panic and `recover` never catches an exception.

use core::fmt;
use core::num::NonZeroI32;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::{self as unwinding, AssertUnwindSafe};

use crate::defer;
use crate::errno;
use crate::thread;
use crate::unwind::Panicking;

/// Non-zero error code carried by a panic, in the `errno` domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(NonZeroI32);

impl ErrorCode {
    pub const EPERM: ErrorCode = ErrorCode::from_const(libc::EPERM);
    pub const ENOENT: ErrorCode = ErrorCode::from_const(libc::ENOENT);
    pub const EIO: ErrorCode = ErrorCode::from_const(libc::EIO);
    pub const ENOMEM: ErrorCode = ErrorCode::from_const(libc::ENOMEM);
    pub const EINVAL: ErrorCode = ErrorCode::from_const(libc::EINVAL);
    pub const ERANGE: ErrorCode = ErrorCode::from_const(libc::ERANGE);

    const fn from_const(code: i32) -> Self {
        match NonZeroI32::new(code) {
            Some(code) => ErrorCode(code),
            None => panic!("error code must be non-zero"),
        }
    }

    /// `None` for zero, which means "no error".
    pub fn new(code: i32) -> Option<Self> {
        NonZeroI32::new(code).map(ErrorCode)
    }

    pub fn get(self) -> i32 {
        self.0.get()
    }

    /// Symbolic name, e.g. `"EINVAL"`.
    pub fn name(self) -> &'static str {
        errno::error_name(self.get())
    }

    pub fn description(self) -> String {
        errno::error_description(self.get())
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> i32 {
        code.get()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.get())
    }
}

static FORCE_BACKTRACE: AtomicBool = AtomicBool::new(false);
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Capture a backtrace for un-recovered panics regardless of
/// `RUST_BACKTRACE`.
pub fn set_force_backtrace(force: bool) {
    FORCE_BACKTRACE.store(force, Ordering::Relaxed);
}

/// Restores a frame's previous recovery mark, however `recover` is left.
struct RecoveryMark {
    frame: u64,
    previous: Option<u64>,
}

impl Drop for RecoveryMark {
    fn drop(&mut self) {
        defer::mark_recovery(self.frame, self.previous);
    }
}

/// Run `body` with the calling frame marked as the recovery target.
///
/// Returns `Ok` with the body's value if it completes, or `Err(code)` if a
/// [`panic`] inside it was recovered here. Frames opened inside `body` are
/// closed, their cleanups run, before this returns. A nested `recover` in
/// the same frame takes over the mark until it returns.
///
/// ```
/// use ctrlflow_runtime::{defer, panic, recover, scope, ErrorCode};
///
/// let result = recover(|| {
///     scope(|| {
///         defer(|| println!("cleaned up"));
///         panic(ErrorCode::EINVAL)
///     })
/// });
/// assert_eq!(result, Err::<(), _>(ErrorCode::EINVAL));
/// ```
pub fn recover<R>(body: impl FnOnce() -> R) -> Result<R, ErrorCode> {
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    let frame = defer::innermost_or_root();
    let _mark = RecoveryMark {
        frame,
        previous: defer::mark_recovery(frame, Some(token)),
    };

    match unwinding::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => Ok(value),
        Err(payload) => match payload.downcast::<Panicking>() {
            Ok(panicking) if panicking.token == token => {
                log::debug!("recovered panic with error {}", panicking.code);
                Err(panicking.code)
            }
            Ok(panicking) => unwinding::resume_unwind(panicking),
            Err(payload) => unwinding::resume_unwind(payload),
        },
    }
}

/// Raise a panic with `code`.
///
/// Never returns: control reaches the nearest recovering frame, or the
/// calling thread exits with `code` as its status.
pub fn panic(code: ErrorCode) -> ! {
    log::debug!("panic with error {code}");

    while let Some((frame, recovery)) = defer::innermost() {
        if let Some(token) = recovery {
            unwinding::resume_unwind(Box::new(Panicking { code, token }));
        }
        defer::deregister(frame);
    }

    eprintln!("Panic with error {}: {}", code.name(), code.description());
    report_backtrace();
    thread::exit(code.get())
}

fn report_backtrace() {
    let backtrace = if FORCE_BACKTRACE.load(Ordering::Relaxed) {
        Backtrace::force_capture()
    } else {
        Backtrace::capture()
    };

    match backtrace.status() {
        BacktraceStatus::Captured => eprintln!("{backtrace}"),
        _ => eprintln!("Backtrace not supported"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::defer::{defer, scope};

    #[test]
    fn test_error_code_rejects_zero() {
        assert_eq!(ErrorCode::new(0), None);
        let code = ErrorCode::new(libc::EINVAL).unwrap();
        assert_eq!(code, ErrorCode::EINVAL);
        assert_eq!(code.get(), libc::EINVAL);
        assert_eq!(code.name(), "EINVAL");
        assert_eq!(code.to_string(), format!("EINVAL ({})", libc::EINVAL));
    }

    #[test]
    fn test_recover_without_panic() {
        assert_eq!(recover(|| 42), Ok(42));
    }

    #[test]
    fn test_recover_runs_intervening_cleanups() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let result = scope(|| {
            recover(|| {
                scope(|| {
                    for n in 1..=2 {
                        let order = Rc::clone(&order);
                        defer(move || order.borrow_mut().push(n));
                    }
                    panic(ErrorCode::EINVAL)
                })
            })
        });

        assert_eq!(result, Err::<(), _>(ErrorCode::EINVAL));
        assert_eq!(*order.borrow(), [2, 1]);
    }

    #[test]
    fn test_recovering_frame_stays_open() {
        let order = Rc::new(RefCell::new(Vec::new()));
        scope(|| {
            let outer = Rc::clone(&order);
            defer(move || outer.borrow_mut().push("recovering frame"));

            let result: Result<(), _> = recover(|| panic(ErrorCode::EIO));
            assert_eq!(result, Err(ErrorCode::EIO));
            order.borrow_mut().push("after recover");
        });
        assert_eq!(*order.borrow(), ["after recover", "recovering frame"]);
    }

    #[test]
    fn test_nested_recover_latest_wins() {
        scope(|| {
            let outer = recover(|| {
                let inner: Result<(), _> = recover(|| panic(ErrorCode::ENOMEM));
                assert_eq!(inner, Err(ErrorCode::ENOMEM));
                panic(ErrorCode::ERANGE)
            });
            assert_eq!(outer, Err::<(), _>(ErrorCode::ERANGE));
            assert_eq!(defer::innermost().map(|(_, mark)| mark), Some(None));
        });
    }

    #[test]
    fn test_recover_ignores_foreign_unwind() {
        let result = unwinding::catch_unwind(|| recover(|| unwinding::resume_unwind(Box::new(5u8))));
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<u8>(), Some(&5));
    }
}
