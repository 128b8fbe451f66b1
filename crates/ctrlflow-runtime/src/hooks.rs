//! Process-wide exception event hooks.
//!
//! Hooks are global to the program. They are meant to be installed once,
//! early (typically at the top of `main`), before other threads are
//! spawned; installing them while other threads throw is allowed by the
//! type system but the threads may observe either the old or the new hook.
//! Passing `None` restores the default behavior.
//!
//! A hook should log or set a flag and return. A hook that throws routes the
//! exception to the unexpected path; a hook that never returns leaves the
//! throwing thread wherever the hook took it.

use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::exceptions::Exception;

/// Signature shared by all hooks.
pub type Hook = fn(&Exception);

static ON_THROW: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static ON_UNHANDLED: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static ON_UNEXPECTED: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

// Hooks are stored as erased pointers so they can be read from a fault
// handler without taking a lock.
fn store(slot: &AtomicPtr<()>, hook: Option<Hook>) {
    let raw = hook.map_or(ptr::null_mut(), |hook| hook as *mut ());
    slot.store(raw, Ordering::Release);
}

fn load(slot: &AtomicPtr<()>) -> Option<Hook> {
    let raw = slot.load(Ordering::Acquire);
    if raw.is_null() {
        return None;
    }
    // SAFETY: non-null values in the slots only ever come from `store`,
    // which erased a `Hook`.
    Some(unsafe { mem::transmute::<*mut (), Hook>(raw) })
}

/// Called whenever an exception is thrown or propagates to an outer scope.
pub fn set_on_throw(hook: Option<Hook>) {
    store(&ON_THROW, hook);
}

/// Called when an exception leaves the outermost try-scope of a thread.
/// The default prints the exception's type tag to stderr.
pub fn set_on_unhandled(hook: Option<Hook>) {
    store(&ON_UNHANDLED, hook);
}

/// Called when an exception escapes a catch clause, a finally clause or
/// another hook. The default prints the exception's type tag to stderr.
pub fn set_on_unexpected(hook: Option<Hook>) {
    store(&ON_UNEXPECTED, hook);
}

pub(crate) fn on_throw() -> Option<Hook> {
    load(&ON_THROW)
}

pub(crate) fn on_unhandled() -> Option<Hook> {
    load(&ON_UNHANDLED)
}

pub(crate) fn on_unexpected() -> Option<Hook> {
    load(&ON_UNEXPECTED)
}

/// The complete hook set, for installing or inspecting all three at once.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hooks {
    pub on_throw: Option<Hook>,
    pub on_unhandled: Option<Hook>,
    pub on_unexpected: Option<Hook>,
}

impl Hooks {
    /// Snapshot of the installed hooks.
    pub fn current() -> Self {
        Self {
            on_throw: on_throw(),
            on_unhandled: on_unhandled(),
            on_unexpected: on_unexpected(),
        }
    }

    /// Install all three hooks, replacing whatever was set.
    pub fn install(self) {
        set_on_throw(self.on_throw);
        set_on_unhandled(self.on_unhandled);
        set_on_unexpected(self.on_unexpected);
    }
}
