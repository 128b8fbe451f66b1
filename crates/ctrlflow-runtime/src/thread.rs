//! Thread entry points that understand the runtime's exit paths.
//!
//! An unhandled exception or an un-recovered panic ends only the calling
//! thread, by unwinding it with [`ThreadExit`]. [`run`] and [`spawn`] turn
//! that into the thread's exit status and close any cleanup frames the
//! body left open.

use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;

use crate::defer;
use crate::error::{Result, RuntimeError};
use crate::unwind;

pub use crate::unwind::ThreadExit;

/// Status of a thread that finished normally.
pub const EXIT_SUCCESS: i32 = 0;
/// Status of a thread ended by an unhandled or unexpected exception.
pub const EXIT_FAILURE: i32 = 1;

/// Terminate the calling thread with `status`.
///
/// The thread unwinds: cleanup frames close and destructors run on the way
/// out. Under [`run`] or [`spawn`] the status becomes the thread's result;
/// elsewhere the unwind ends the thread like an uncaught Rust panic would.
pub fn exit(status: i32) -> ! {
    log::debug!("thread exit with status {status}");
    panic::resume_unwind(Box::new(ThreadExit::new(status)))
}

/// Run `body` on the current thread as a runtime thread.
///
/// Returns the body's status, or the status passed to [`exit`]. Any other
/// unwind (an ordinary Rust panic) is resumed after teardown. Teardown
/// closes only the cleanup frames opened inside `run`.
pub fn run(body: impl FnOnce() -> i32) -> i32 {
    let session = defer::ThreadSession::enter();

    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    session.leave();

    match outcome {
        Ok(status) => status,
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(exit) => exit.status(),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Thread factory with a name and stack size.
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Start `body` on a new runtime thread.
    pub fn spawn<F>(self, body: F) -> Result<ThreadHandle>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let mut builder = std::thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(bytes) = self.stack_size {
            builder = builder.stack_size(bytes);
        }

        let inner = builder
            .spawn(move || run(body))
            .map_err(RuntimeError::Spawn)?;
        Ok(ThreadHandle { inner })
    }
}

/// Start `body` on a new runtime thread with default settings.
pub fn spawn<F>(body: F) -> Result<ThreadHandle>
where
    F: FnOnce() -> i32 + Send + 'static,
{
    Builder::new().spawn(body)
}

/// Handle to a thread started with [`spawn`].
#[derive(Debug)]
pub struct ThreadHandle {
    inner: JoinHandle<i32>,
}

impl ThreadHandle {
    pub fn thread(&self) -> &std::thread::Thread {
        self.inner.thread()
    }

    /// Wait for the thread and return its exit status.
    ///
    /// Errors only if the thread ended with an ordinary Rust panic.
    pub fn wait(self) -> Result<i32> {
        self.inner
            .join()
            .map_err(|payload| RuntimeError::ThreadPanicked(unwind::describe(&payload)))
    }
}
