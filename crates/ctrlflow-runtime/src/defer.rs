//! Deferred cleanup frames.
//!
//! Each thread owns a stack of cleanup frames. A frame is opened by
//! [`FrameGuard::enter`] (or [`scope`]) and closed when the guard drops;
//! closing a frame runs its pending cleanups, most recently registered
//! first, each exactly once. [`defer`] and [`scoped_defer`] register into
//! the innermost open frame.
//!
//! ```
//! use ctrlflow_runtime::{scope, scoped_defer};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let order = Rc::new(RefCell::new(Vec::new()));
//! scope(|| {
//!     let log = Rc::clone(&order);
//!     let first = scoped_defer(move |n| log.borrow_mut().push(n), 1);
//!     let log = Rc::clone(&order);
//!     scoped_defer(move |n| log.borrow_mut().push(n), 2);
//!     assert_eq!(first, 1);
//! });
//! assert_eq!(*order.borrow(), [2, 1]);
//! ```
//!
//! Cleanups are `'static`: a frame left open by a leaked guard, or the
//! thread's root frame, may run them long after the registering function
//! returned.

use std::cell::{Cell, RefCell};
use std::mem;
use std::sync::Once;

/// Maximum number of cleanups one frame can hold.
pub const DEFER_MAX: usize = 16;

type Cleanup = Box<dyn FnOnce()>;

/// One function activation's worth of deferred cleanups.
pub(crate) struct CleanupFrame {
    id: u64,
    entries: Vec<Cleanup>,
    /// Token of the `recover` call currently targeting this frame.
    pub(crate) recovery: Option<u64>,
    complete: bool,
}

impl CleanupFrame {
    fn new(id: u64) -> Self {
        Self {
            id,
            entries: Vec::with_capacity(DEFER_MAX),
            recovery: None,
            complete: false,
        }
    }
}

impl Drop for CleanupFrame {
    // Only reached with pending entries when thread-local storage is torn
    // down under a still-open frame.
    fn drop(&mut self) {
        if self.complete {
            return;
        }
        while let Some(cleanup) = self.entries.pop() {
            cleanup();
        }
        self.complete = true;
    }
}

#[derive(Default)]
pub(crate) struct FrameStack {
    frames: Vec<CleanupFrame>,
    next_id: u64,
}

impl FrameStack {
    fn push(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.frames.push(CleanupFrame::new(id));
        id
    }
}

thread_local! {
    static FRAMES: RefCell<FrameStack> = RefCell::new(FrameStack::default());
    static INITIALIZED: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn with_frames<R>(f: impl FnOnce(&mut FrameStack) -> R) -> R {
    FRAMES.with(|frames| f(&mut frames.borrow_mut()))
}

/// Id and recovery mark of the innermost frame.
pub(crate) fn innermost() -> Option<(u64, Option<u64>)> {
    with_frames(|stack| stack.frames.last().map(|frame| (frame.id, frame.recovery)))
}

/// Id of the innermost frame, creating the root frame if none is open.
pub(crate) fn innermost_or_root() -> u64 {
    with_frames(|stack| match stack.frames.last() {
        Some(frame) => frame.id,
        None => stack.push(),
    })
}

/// Set the recovery mark of frame `id`, returning the previous mark.
pub(crate) fn mark_recovery(id: u64, token: Option<u64>) -> Option<u64> {
    with_frames(|stack| {
        stack
            .frames
            .iter_mut()
            .rev()
            .find(|frame| frame.id == id)
            .and_then(|frame| mem::replace(&mut frame.recovery, token))
    })
}

/// Close frame `id`: run its cleanups in reverse order, then unlink it.
///
/// Cleanups run outside the stack borrow, one at a time, so they may open
/// frames or register cleanups of their own. No-op if the frame is already
/// gone.
pub(crate) fn deregister(id: u64) {
    loop {
        let next = with_frames(|stack| {
            let frame = stack.frames.iter_mut().rev().find(|frame| frame.id == id)?;
            Some(frame.entries.pop())
        });
        match next {
            Some(Some(cleanup)) => cleanup(),
            Some(None) => break,
            None => return,
        }
    }

    let frame = with_frames(|stack| {
        let index = stack.frames.iter().rposition(|frame| frame.id == id)?;
        let mut frame = stack.frames.remove(index);
        frame.complete = true;
        Some(frame)
    });
    // Dropped outside the borrow.
    drop(frame);
}

/// Non-recoverable unwind: close every frame opened after `base`,
/// innermost first, ignoring recovery marks. `None` closes them all.
pub(crate) fn unwind_to(base: Option<u64>) {
    while let Some((id, _)) = innermost() {
        if base.is_some_and(|base| id <= base) {
            break;
        }
        deregister(id);
    }
}

pub(crate) fn unwind_all() {
    unwind_to(None);
}

/// Scope guard for one cleanup frame.
///
/// Dropping the guard closes the frame, whether the scope is left normally
/// or by unwinding. Guards must be dropped in reverse order of creation,
/// which holding them in locals guarantees.
#[must_use = "the frame closes as soon as the guard is dropped"]
pub struct FrameGuard {
    id: u64,
    // Frames are thread-local.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl FrameGuard {
    /// Open a new innermost frame.
    pub fn enter() -> Self {
        let id = with_frames(FrameStack::push);
        log::trace!("enter defer frame {id}");
        Self {
            id,
            _not_send: std::marker::PhantomData,
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        log::trace!("leave defer frame {}", self.id);
        deregister(self.id);
    }
}

/// Run `body` in its own cleanup frame.
pub fn scope<R>(body: impl FnOnce() -> R) -> R {
    let _frame = FrameGuard::enter();
    body()
}

/// Register `cleanup` in the innermost frame.
///
/// Registering more than [`DEFER_MAX`] cleanups in one frame aborts the
/// process. Without any open frame the cleanup lands in the thread's root
/// frame and runs at thread teardown.
pub fn defer(cleanup: impl FnOnce() + 'static) {
    let mut pending: Option<Cleanup> = Some(Box::new(cleanup));

    let overflow = FRAMES.try_with(|frames| {
        let mut stack = frames.borrow_mut();
        if stack.frames.is_empty() {
            stack.push();
        }
        match stack.frames.last_mut() {
            Some(frame) if frame.entries.len() < DEFER_MAX => {
                frame.entries.extend(pending.take());
                false
            }
            _ => true,
        }
    });

    match overflow {
        Ok(false) => {}
        Ok(true) => {
            eprintln!("Tried to defer more than DEFER_MAX handlers");
            std::process::abort();
        }
        // Thread-local storage is already being destroyed: nothing is left
        // to defer to.
        Err(_) => {
            if let Some(cleanup) = pending.take() {
                cleanup();
            }
        }
    }
}

/// Register `handler(arg)` in the innermost frame and return `arg`.
pub fn scoped_defer<T>(handler: impl FnOnce(T) + 'static, arg: T) -> T
where
    T: Clone + 'static,
{
    let held = arg.clone();
    defer(move || handler(held));
    arg
}

static PROCESS_INIT: Once = Once::new();

extern "C" fn process_fini() {
    // The exiting thread's storage may already be gone.
    if FRAMES.try_with(|_| ()).is_ok() {
        unwind_all();
    }
}

fn register_process_fini() {
    PROCESS_INIT.call_once(|| {
        // SAFETY: `process_fini` is a plain function with no preconditions.
        if unsafe { libc::atexit(process_fini) } != 0 {
            eprintln!("Could not register atexit() handler");
            std::process::abort();
        }
    });
}

/// Mark the thread initialized and open its root frame. Returns `false` if
/// it already was.
fn init_thread() -> bool {
    register_process_fini();
    if INITIALIZED.with(|init| init.replace(true)) {
        return false;
    }
    innermost_or_root();
    true
}

/// Prepare the calling thread for deferred cleanups.
///
/// Opens the thread's root frame and, once per process, registers an exit
/// handler that closes whatever frames are still open on the thread that
/// exits the process. [`crate::thread::run`] and [`crate::thread::spawn`]
/// call this for you.
pub fn thread_init() {
    if !init_thread() {
        log::warn!("thread_init called twice on the same thread");
    }
}

/// Frames owned by one [`crate::thread::run`] call.
///
/// Leaving closes only the frames opened since entry, so a `run` nested in
/// an open scope leaves that scope's cleanups for the scope's own exit.
pub(crate) struct ThreadSession {
    base: Option<u64>,
    owns_init: bool,
}

impl ThreadSession {
    pub(crate) fn enter() -> Self {
        let base = innermost().map(|(id, _)| id);
        let owns_init = init_thread();
        // Cleanups registered by the body belong to the session, not to a
        // frame that was already open.
        if innermost().map(|(id, _)| id) == base {
            with_frames(FrameStack::push);
        }
        Self { base, owns_init }
    }

    /// Non-recoverable teardown of the session's frames.
    pub(crate) fn leave(self) {
        unwind_to(self.base);
        if self.owns_init {
            INITIALIZED.with(|init| init.set(false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn open_frames() -> usize {
        with_frames(|stack| stack.frames.len())
    }

    #[derive(Clone, Default)]
    struct Trace(Rc<RefCell<Vec<&'static str>>>);

    impl Trace {
        fn push(&self, event: &'static str) {
            self.0.borrow_mut().push(event);
        }

        fn recorder(&self, event: &'static str) -> impl FnOnce() + 'static {
            let trace = self.clone();
            move || trace.push(event)
        }

        fn events(&self) -> Vec<&'static str> {
            self.0.borrow().clone()
        }
    }

    #[test]
    fn test_reverse_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        scope(|| {
            for n in 1..=3 {
                let order = Rc::clone(&order);
                scoped_defer(move |n| order.borrow_mut().push(n), n);
            }
        });
        assert_eq!(*order.borrow(), [3, 2, 1]);
    }

    #[test]
    fn test_nested_frames_close_independently() {
        let trace = Trace::default();
        scope(|| {
            defer(trace.recorder("outer"));
            scope(|| defer(trace.recorder("inner")));
            trace.push("between");
        });
        assert_eq!(trace.events(), ["inner", "between", "outer"]);
    }

    #[test]
    fn test_cleanup_may_defer() {
        let trace = Trace::default();
        scope(|| {
            let inner = trace.clone();
            defer(move || {
                inner.push("first");
                scope(|| defer(inner.recorder("second")));
            });
        });
        assert_eq!(trace.events(), ["first", "second"]);
    }

    #[test]
    fn test_frames_closed_on_unwind() {
        let trace = Trace::default();
        let base = open_frames();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scope(|| {
                defer(trace.recorder("cleanup"));
                std::panic::resume_unwind(Box::new("boom"));
            })
        }));
        assert!(result.is_err());
        assert_eq!(trace.events(), ["cleanup"]);
        assert_eq!(open_frames(), base);
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let trace = Trace::default();
        let guard = FrameGuard::enter();
        defer(trace.recorder("once"));
        deregister(guard.id);
        drop(guard);
        assert_eq!(trace.events(), ["once"]);
    }

    #[test]
    fn test_exactly_max_entries() {
        let count = Rc::new(Cell::new(0));
        scope(|| {
            for _ in 0..DEFER_MAX {
                let count = Rc::clone(&count);
                defer(move || count.set(count.get() + 1));
            }
        });
        assert_eq!(count.get(), DEFER_MAX);
    }

    #[test]
    fn test_thread_init_and_session() {
        std::thread::spawn(|| {
            let trace = Trace::default();
            let session = ThreadSession::enter();
            assert_eq!(open_frames(), 1);
            thread_init();
            assert_eq!(open_frames(), 1);

            defer(trace.recorder("root"));
            session.leave();
            assert_eq!(trace.events(), ["root"]);
            assert_eq!(open_frames(), 0);
            assert!(!INITIALIZED.with(Cell::get));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_session_inside_scope_keeps_outer_frames() {
        let trace = Trace::default();
        scope(|| {
            defer(trace.recorder("outer"));
            let session = ThreadSession::enter();
            defer(trace.recorder("session"));
            let inner = FrameGuard::enter();
            defer(trace.recorder("inner"));
            std::mem::forget(inner);
            session.leave();
            assert_eq!(trace.events(), ["inner", "session"]);
        });
        assert_eq!(trace.events(), ["inner", "session", "outer"]);
    }

    #[test]
    fn test_teardown_ignores_recovery_marks() {
        std::thread::spawn(|| {
            let trace = Trace::default();
            let session = ThreadSession::enter();
            let guard = FrameGuard::enter();
            defer(trace.recorder("marked"));
            mark_recovery(guard.id, Some(99));
            std::mem::forget(guard);

            session.leave();
            assert_eq!(trace.events(), ["marked"]);
            assert_eq!(open_frames(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_root_frame_runs_at_thread_exit() {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || defer(move || tx.send("root").unwrap()))
            .join()
            .unwrap();
        assert_eq!(rx.recv().unwrap(), "root");
    }

    #[test]
    fn test_recovery_mark_replace() {
        scope(|| {
            let (id, mark) = innermost().unwrap();
            assert_eq!(mark, None);
            assert_eq!(mark_recovery(id, Some(7)), None);
            assert_eq!(mark_recovery(id, Some(8)), Some(7));
            assert_eq!(innermost(), Some((id, Some(8))));
        });
    }
}
