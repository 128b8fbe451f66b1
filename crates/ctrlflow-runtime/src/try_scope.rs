//! try / catch / catch_any / finally.
//!
//! A try-scope walks a fixed sequence of stages:
//!
//! ```text
//! TRY(0) -> CATCH(1) -> FINALLY(2) -> PROPAGATE(3)
//!                 \________\______________> UNEXPECTED(-1)
//! ```
//!
//! The body runs in `Try`. If it threw, catch clauses are tested in the
//! order they were declared and the first match consumes the exception.
//! The finally clause always runs, exactly once. `Propagate` pops the scope
//! and, if the exception is still pending, throws it again toward the next
//! enclosing scope. While a catch or finally clause runs the scope sits in
//! `Unexpected`: an exception escaping the clause ends the thread through
//! the unexpected-exception path.
//!
//! Catch clauses are first-come-first-served, so a `catch_any` declared
//! before a typed catch takes precedence over it.

use core::any::TypeId;

use crate::exceptions::{self, Exception, ScopeEntry};
use crate::throwable::Throwable;
use crate::unwind::{self, Escape};

/// Stage of a try-scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Stage {
    Unexpected = -1,
    Try = 0,
    Catch = 1,
    Finally = 2,
    Propagate = 3,
}

enum Matcher {
    Type {
        type_name: &'static str,
        type_id: TypeId,
    },
    Any,
}

impl Matcher {
    fn matches(&self, exception: &Exception) -> bool {
        match self {
            Matcher::Type { type_name, type_id } => {
                exception.type_name() == *type_name && same_type(exception, *type_id)
            }
            Matcher::Any => true,
        }
    }
}

// The tag matched; make sure the Rust type agrees before the clause reads
// the payload.
fn same_type(exception: &Exception, type_id: TypeId) -> bool {
    let same = exception.type_id() == type_id;
    if !same {
        log::warn!(
            "type tag {:?} is shared by two different Rust types",
            exception.type_name()
        );
    }
    same
}

struct Clause<'a> {
    matcher: Matcher,
    handler: Box<dyn FnOnce(&Exception) + 'a>,
}

/// A try block with its catch and finally clauses.
///
/// ```
/// use ctrlflow_runtime::{throw, Try};
///
/// let mut caught = None;
/// let mut cleaned_up = false;
///
/// Try::new(|| throw(5i32))
///     .catch(|e: i32| caught = Some(e))
///     .finally(|| cleaned_up = true)
///     .run();
///
/// assert_eq!(caught, Some(5));
/// assert!(cleaned_up);
/// ```
#[must_use = "a try block does nothing until `run` is called"]
pub struct Try<'a> {
    body: Box<dyn FnOnce() + 'a>,
    clauses: Vec<Clause<'a>>,
    finally: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Try<'a> {
    /// Start a try block guarding `body`.
    pub fn new(body: impl FnOnce() + 'a) -> Self {
        Self {
            body: Box::new(body),
            clauses: Vec::new(),
            finally: None,
        }
    }

    /// Catch exceptions thrown as `T`.
    pub fn catch<T: Throwable>(mut self, handler: impl FnOnce(T) + 'a) -> Self {
        self.clauses.push(Clause {
            matcher: Matcher::Type {
                type_name: T::TYPE_NAME,
                type_id: TypeId::of::<T>(),
            },
            handler: Box::new(move |exception: &Exception| {
                if let Some(value) = exception.downcast::<T>() {
                    handler(value);
                }
            }),
        });
        self
    }

    /// Catch any exception. Should be declared after every typed catch
    /// meant to take precedence.
    pub fn catch_any(mut self, handler: impl FnOnce(Exception) + 'a) -> Self {
        self.clauses.push(Clause {
            matcher: Matcher::Any,
            handler: Box::new(move |exception: &Exception| handler(*exception)),
        });
        self
    }

    /// Code that runs whether or not an exception was thrown or caught.
    /// Declaring a second finally clause replaces the first.
    pub fn finally(mut self, finally: impl FnOnce() + 'a) -> Self {
        if self.finally.is_some() {
            log::warn!("try block declares more than one finally clause");
        }
        self.finally = Some(Box::new(finally));
        self
    }

    /// Execute the try block.
    pub fn run(self) {
        let Try {
            body,
            clauses,
            finally,
        } = self;

        let mut scope = TryScope::enter();

        scope.advance(Stage::Try);
        if let Err(escape) = unwind::capture(body) {
            scope.pending = exceptions::current_exception();
            if scope.pending.is_none() {
                log::warn!("{escape:?} with an empty exception record");
                exceptions::unexpected();
            }
        }

        scope.advance(Stage::Catch);
        if let Some(exception) = scope.pending {
            if let Some(clause) = clauses
                .into_iter()
                .find(|clause| clause.matcher.matches(&exception))
            {
                scope.advance(Stage::Unexpected);
                match unwind::capture(|| (clause.handler)(&exception)) {
                    Ok(()) => scope.consume(),
                    Err(Escape::Rethrown) => {}
                    Err(Escape::Thrown) => exceptions::unexpected(),
                }
                scope.advance(Stage::Catch);
            }
        }

        scope.advance(Stage::Finally);
        if let Some(finally) = finally {
            scope.advance(Stage::Unexpected);
            if unwind::capture(finally).is_err() {
                exceptions::unexpected();
            }
            scope.advance(Stage::Finally);
        }

        scope.advance(Stage::Propagate);
        if let Some(exception) = scope.leave() {
            exceptions::set_current(Some(exception));
            exceptions::dispatch();
        }
    }
}

/// Bookkeeping for one active try block.
struct TryScope {
    entry: ScopeEntry,
    stage: Stage,
    /// Exception taken at `Try`, cleared once a clause consumes it.
    pending: Option<Exception>,
    /// Exception that was in flight when the scope was entered.
    outer: Option<Exception>,
}

impl TryScope {
    fn enter() -> Self {
        Self {
            outer: exceptions::current_exception(),
            entry: ScopeEntry::push(),
            stage: Stage::Try,
            pending: None,
        }
    }

    fn advance(&mut self, stage: Stage) {
        log::trace!(
            "try-scope {}: {:?} -> {:?}",
            self.entry.link(),
            self.stage,
            stage
        );
        self.stage = stage;
    }

    fn consume(&mut self) {
        self.pending = None;
        exceptions::set_current(self.outer);
    }

    /// Pop the scope, returning the exception that must keep propagating.
    fn leave(self) -> Option<Exception> {
        let pending = self.pending;
        drop(self.entry);
        pending
    }
}

/// Keyword-style try block.
///
/// The first block is the guarded body; `catch (Type, binding)`,
/// `catch_any (binding)` and `finally` clauses follow in any order.
///
/// ```
/// use ctrlflow_runtime::{throw, try_catch};
///
/// use std::cell::RefCell;
///
/// let log = RefCell::new(Vec::new());
/// try_catch! {
///     {
///         log.borrow_mut().push("try");
///         throw(7u32);
///     }
///     catch (i32, _e) { log.borrow_mut().push("int"); }
///     catch (u32, e) { assert_eq!(e, 7); log.borrow_mut().push("uint"); }
///     catch_any (_e) { log.borrow_mut().push("any"); }
///     finally { log.borrow_mut().push("finally"); }
/// }
/// assert_eq!(log.into_inner(), ["try", "uint", "finally"]);
/// ```
#[macro_export]
macro_rules! try_catch {
    ($body:block $($clauses:tt)*) => {
        $crate::try_catch!(@clauses $crate::Try::new(|| $body); $($clauses)*)
    };
    (@clauses $acc:expr; catch ($ty:ty, $bind:pat_param) $handler:block $($rest:tt)*) => {
        $crate::try_catch!(@clauses $acc.catch(|$bind: $ty| $handler); $($rest)*)
    };
    (@clauses $acc:expr; catch_any ($bind:pat_param) $handler:block $($rest:tt)*) => {
        $crate::try_catch!(@clauses $acc.catch_any(|$bind: $crate::Exception| $handler); $($rest)*)
    };
    (@clauses $acc:expr; finally $handler:block $($rest:tt)*) => {
        $crate::try_catch!(@clauses $acc.finally(|| $handler); $($rest)*)
    };
    (@clauses $acc:expr;) => {
        $acc.run()
    };
}
