//! Exception records and the throw algorithm.
//!
//! Exception state is strictly thread-local: a stack of active try-scopes
//! (tracked by depth, the scopes themselves live on the Rust stack) and a
//! single record holding the in-flight value. Both are plain `Cell`s with
//! constant initializers so the throw path stays usable from a fault
//! handler on the same thread.

use core::any::TypeId;
use core::cell::Cell;
use core::fmt;
use core::mem::{size_of, MaybeUninit};
use core::ptr;
use std::panic;

use crate::hooks;
use crate::thread::{self, EXIT_FAILURE};
use crate::throwable::{SizeCheck, Throwable, MAX_THROWABLE_SIZE};
use crate::unwind::{self, Rethrown, Thrown};

type PayloadBytes = [MaybeUninit<u8>; MAX_THROWABLE_SIZE];

/// An owned copy of a thrown value together with its type tag.
#[derive(Clone, Copy)]
pub struct Exception {
    type_name: &'static str,
    type_id: TypeId,
    size: usize,
    payload: PayloadBytes,
}

impl Exception {
    fn new<T: Throwable>(value: T) -> Self {
        let () = SizeCheck::<T>::OK;

        let mut payload = [MaybeUninit::uninit(); MAX_THROWABLE_SIZE];
        // SAFETY: `T` fits in the buffer (checked above) and the buffer is a
        // plain byte array, so any bit pattern, padding included, is fine.
        unsafe {
            ptr::copy_nonoverlapping(
                (&value as *const T).cast::<MaybeUninit<u8>>(),
                payload.as_mut_ptr(),
                size_of::<T>(),
            );
        }

        Self {
            type_name: T::TYPE_NAME,
            type_id: TypeId::of::<T>(),
            size: size_of::<T>(),
            payload,
        }
    }

    /// The type tag the value was thrown with.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Size in bytes of the thrown value.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Personality check: does this exception match a `catch` for `T`?
    ///
    /// Tags are compared first; the Rust type is verified as well so the
    /// payload can be read back soundly.
    pub fn is<T: Throwable>(&self) -> bool {
        self.type_name == T::TYPE_NAME && self.type_id == TypeId::of::<T>()
    }

    /// Copy the thrown value out, if it is a `T`.
    pub fn downcast<T: Throwable>(&self) -> Option<T> {
        if !self.is::<T>() {
            return None;
        }
        // SAFETY: the payload was written from a `T` by `Exception::new`
        // (checked through `TypeId`), and `T: Copy`.
        Some(unsafe { ptr::read_unaligned(self.payload.as_ptr().cast::<T>()) })
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exception")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Thread-local record of the exception in flight.
///
/// `current` is `Some` exactly while a throw is between its origin and the
/// scope that consumes it.
struct ExceptionRecord {
    current: Cell<Option<Exception>>,
}

thread_local! {
    static RECORD: ExceptionRecord = const {
        ExceptionRecord {
            current: Cell::new(None),
        }
    };

    /// Number of try-scopes currently open on this thread.
    static TRY_DEPTH: Cell<usize> = const { Cell::new(0) };

    /// Set while the on-throw hook runs, so a throw from the hook goes
    /// straight to its guard instead of re-entering the hook.
    static IN_THROW_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// The exception currently in flight on this thread, if any.
pub fn current_exception() -> Option<Exception> {
    RECORD.with(|record| record.current.get())
}

pub(crate) fn set_current(exception: Option<Exception>) {
    RECORD.with(|record| record.current.set(exception));
}

/// Number of try-scopes open on the calling thread.
pub fn try_depth() -> usize {
    TRY_DEPTH.with(Cell::get)
}

/// One entry on the thread-local try-scope stack.
///
/// Pushing records the enclosing depth as the link; dropping pops back to
/// it, whichever way the owning frame is left.
pub(crate) struct ScopeEntry {
    link: usize,
}

impl ScopeEntry {
    pub(crate) fn push() -> Self {
        let link = TRY_DEPTH.with(|depth| {
            let link = depth.get();
            depth.set(link + 1);
            link
        });
        Self { link }
    }

    /// Depth of the enclosing scope.
    pub(crate) fn link(&self) -> usize {
        self.link
    }
}

impl Drop for ScopeEntry {
    fn drop(&mut self) {
        TRY_DEPTH.with(|depth| depth.set(self.link));
    }
}

/// Throw `value`.
///
/// Control transfers to the innermost enclosing try-scope. With no
/// try-scope open, the unhandled-exception hook runs and the calling thread
/// exits with [`EXIT_FAILURE`].
pub fn throw<T: Throwable>(value: T) -> ! {
    log::debug!("throw {}", T::TYPE_NAME);
    raise(value)
}

/// Throw without logging. Used from fault-handler context.
pub(crate) fn raise<T: Throwable>(value: T) -> ! {
    set_current(Some(Exception::new(value)));
    dispatch()
}

/// Re-throw the exception being handled, keeping its tag and payload.
///
/// Meant for catch clauses: the clause is abandoned, the finally clause of
/// the same try still runs, and the exception then continues outward.
pub fn rethrow() -> ! {
    if current_exception().is_none() {
        log::warn!("rethrow() called with no exception in flight");
        unexpected();
    }
    if try_depth() == 0 {
        unhandled();
    }
    panic::resume_unwind(Box::new(Rethrown))
}

/// The throw algorithm, once the record holds the value.
pub(crate) fn dispatch() -> ! {
    let reentered = IN_THROW_HOOK.with(Cell::get);
    if let (Some(hook), false) = (hooks::on_throw(), reentered) {
        if let Some(exception) = current_exception() {
            let escaped = guarded(|| {
                let _running = ThrowHookRunning::set();
                hook(&exception)
            });
            if escaped {
                unexpected();
            }
        }
    }

    if try_depth() > 0 {
        panic::resume_unwind(Box::new(Thrown));
    }

    unhandled()
}

struct ThrowHookRunning;

impl ThrowHookRunning {
    fn set() -> Self {
        IN_THROW_HOOK.with(|flag| flag.set(true));
        ThrowHookRunning
    }
}

impl Drop for ThrowHookRunning {
    fn drop(&mut self) {
        IN_THROW_HOOK.with(|flag| flag.set(false));
    }
}

/// Run `f` inside its own try-scope. Returns `true` if an exception
/// escaped it.
pub(crate) fn guarded(f: impl FnOnce()) -> bool {
    let _scope = ScopeEntry::push();
    unwind::capture(f).is_err()
}

fn type_name_or_unknown(exception: Option<Exception>) -> &'static str {
    exception.map_or("???", |exception| exception.type_name())
}

/// No try-scope took the exception: report it and end the thread.
pub(crate) fn unhandled() -> ! {
    let exception = current_exception();

    match (hooks::on_unhandled(), exception) {
        (Some(hook), Some(exception)) => {
            if guarded(|| hook(&exception)) {
                unexpected();
            }
        }
        _ => eprintln!(
            "Unhandled exception of type \"{}\"",
            type_name_or_unknown(exception)
        ),
    }

    set_current(None);
    thread::exit(EXIT_FAILURE)
}

/// An exception escaped a catch clause, a finally clause or a hook.
///
/// If the unexpected hook itself throws, it is removed and the default
/// report is used instead, so this always terminates.
pub(crate) fn unexpected() -> ! {
    let exception = current_exception();

    match (hooks::on_unexpected(), exception) {
        (Some(hook), Some(exception)) => {
            if guarded(|| hook(&exception)) {
                log::warn!("unexpected-exception hook threw; falling back to default");
                hooks::set_on_unexpected(None);
                unexpected();
            }
        }
        _ => eprintln!(
            "Unexpected exception of type \"{}\"",
            type_name_or_unknown(exception)
        ),
    }

    set_current(None);
    thread::exit(EXIT_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Reading {
        sensor: u16,
        value: f64,
    }

    crate::throwable!(Reading);

    #[test]
    fn test_exception_roundtrips_value() {
        let reading = Reading {
            sensor: 4,
            value: -1.5,
        };
        let exception = Exception::new(reading);

        assert_eq!(exception.type_name(), "Reading");
        assert_eq!(exception.size(), size_of::<Reading>());
        assert_eq!(exception.downcast::<Reading>(), Some(reading));
        assert_eq!(exception.downcast::<i32>(), None);
    }

    #[test]
    fn test_personality_requires_same_tag() {
        let exception = Exception::new(5i32);
        assert!(exception.is::<i32>());
        assert!(!exception.is::<u32>());
        assert!(!exception.is::<i64>());
    }

    #[test]
    fn test_scope_entry_links() {
        let base = try_depth();
        {
            let outer = ScopeEntry::push();
            assert_eq!(outer.link(), base);
            {
                let inner = ScopeEntry::push();
                assert_eq!(inner.link(), base + 1);
                assert_eq!(try_depth(), base + 2);
            }
            assert_eq!(try_depth(), base + 1);
        }
        assert_eq!(try_depth(), base);
    }

    #[test]
    fn test_guarded_reports_escape() {
        assert!(!guarded(|| {}));
        assert!(guarded(|| throw(1u8)));
        set_current(None);
        assert_eq!(try_depth(), 0);
    }
}
