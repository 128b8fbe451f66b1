//! Translation of hardware faults into exceptions.
//!
//! When enabled, SIGFPE, SIGILL, SIGSEGV and SIGBUS are caught on the
//! faulting thread and re-thrown as one of five typed fault values, so a
//! fault inside a try block lands in a matching catch clause:
//!
//! | Fault                 | Signal                 | Thrown as             |
//! |-----------------------|------------------------|-----------------------|
//! | arithmetic            | SIGFPE                 | [`ArithmeticError`]   |
//! | illegal instruction   | SIGILL                 | [`IllegalInstruction`]|
//! | bad stack             | SIGILL (`ILL_BADSTK`)  | [`StackCorruption`]   |
//! | invalid memory access | SIGSEGV, SIGBUS        | [`AccessViolation`]   |
//! | misaligned access     | SIGBUS (`BUS_ADRALN`)  | [`MisalignedAccess`]  |
//!
//! The throw unwinds straight out of the signal frame, abandoning the
//! interrupted instruction stream. Only synchronous faults raised on the
//! thread that owns the try block are meaningful; the throw path uses the
//! thread-local exception record, lock-free hook lookup and the platform
//! unwinder, and nothing is logged from handler context.
//!
//! Installing these handlers replaces the standard library's own SIGSEGV
//! and SIGBUS handlers (used to report stack overflows); [`disable`]
//! restores the default dispositions, not the previous ones.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;
#[cfg(not(unix))]
use crate::error::RuntimeError;
use crate::exceptions;

/// Thrown on SIGFPE. Usually caused by buggy code but safe to catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithmeticError {
    pub kind: ArithmeticKind,
    pub message: &'static str,
    /// Address of the faulting instruction.
    pub pc: usize,
}

/// Sub-kind of an arithmetic fault, from the signal's detail code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticKind {
    IntegerDivideByZero,
    IntegerOverflow,
    FloatDivideByZero,
    FloatOverflow,
    FloatUnderflow,
    FloatInexact,
    FloatInvalid,
    SubscriptOutOfRange,
    Unknown,
}

impl ArithmeticKind {
    pub fn message(self) -> &'static str {
        match self {
            ArithmeticKind::IntegerDivideByZero => "Integer division by zero.",
            ArithmeticKind::IntegerOverflow => "Integer overflow.",
            ArithmeticKind::FloatDivideByZero => "Floating point division by zero.",
            ArithmeticKind::FloatOverflow => "Floating point overflow.",
            ArithmeticKind::FloatUnderflow => "Floating point underflow.",
            ArithmeticKind::FloatInexact => "Floating point inexact result.",
            ArithmeticKind::FloatInvalid => "Invalid floating point operation.",
            ArithmeticKind::SubscriptOutOfRange => "Subscript out of range.",
            ArithmeticKind::Unknown => "Unknown arithmetic exception.",
        }
    }
}

/// Thrown on an illegal, privileged or malformed instruction. Not
/// advisable to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalInstruction {
    pub message: &'static str,
    pub pc: usize,
}

/// Thrown when the stack is found corrupted. Fatal in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackCorruption {
    pub message: &'static str,
    pub pc: usize,
}

/// Thrown on access to memory the program does not own, e.g. a null or
/// dangling pointer dereference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessViolation {
    pub message: &'static str,
    /// Faulting memory address.
    pub address: usize,
}

/// Thrown on some platforms when a pointer is not aligned for the type it
/// points to. Elsewhere the same bug shows up as [`AccessViolation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MisalignedAccess {
    pub message: &'static str,
    pub address: usize,
}

crate::throwable!(
    ArithmeticError,
    IllegalInstruction,
    StackCorruption,
    AccessViolation,
    MisalignedAccess,
);

/// The signals the translator handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSignal {
    Fpe,
    Ill,
    Segv,
    Bus,
}

impl FaultSignal {
    pub const ALL: [FaultSignal; 4] = [
        FaultSignal::Ill,
        FaultSignal::Fpe,
        FaultSignal::Segv,
        FaultSignal::Bus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FaultSignal::Fpe => "SIGFPE",
            FaultSignal::Ill => "SIGILL",
            FaultSignal::Segv => "SIGSEGV",
            FaultSignal::Bus => "SIGBUS",
        }
    }

    #[cfg(unix)]
    pub fn as_raw(self) -> libc::c_int {
        match self {
            FaultSignal::Fpe => libc::SIGFPE,
            FaultSignal::Ill => libc::SIGILL,
            FaultSignal::Segv => libc::SIGSEGV,
            FaultSignal::Bus => libc::SIGBUS,
        }
    }

    #[cfg(unix)]
    pub fn from_raw(signal: libc::c_int) -> Option<Self> {
        FaultSignal::ALL
            .into_iter()
            .find(|candidate| candidate.as_raw() == signal)
    }
}

/// A classified fault, ready to be thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Arithmetic(ArithmeticError),
    IllegalInstruction(IllegalInstruction),
    StackCorruption(StackCorruption),
    AccessViolation(AccessViolation),
    MisalignedAccess(MisalignedAccess),
}

impl Fault {
    /// Throw the fault value.
    fn raise(self) -> ! {
        match self {
            Fault::Arithmetic(error) => exceptions::raise(error),
            Fault::IllegalInstruction(error) => exceptions::raise(error),
            Fault::StackCorruption(error) => exceptions::raise(error),
            Fault::AccessViolation(error) => exceptions::raise(error),
            Fault::MisalignedAccess(error) => exceptions::raise(error),
        }
    }
}

/// `si_code` values. libc does not export these uniformly across targets.
#[cfg(target_os = "linux")]
mod si_code {
    pub const FPE_INTDIV: i32 = 1;
    pub const FPE_INTOVF: i32 = 2;
    pub const FPE_FLTDIV: i32 = 3;
    pub const FPE_FLTOVF: i32 = 4;
    pub const FPE_FLTUND: i32 = 5;
    pub const FPE_FLTRES: i32 = 6;
    pub const FPE_FLTINV: i32 = 7;
    pub const FPE_FLTSUB: i32 = 8;
    pub const ILL_BADSTK: i32 = 8;
    pub const BUS_ADRALN: i32 = 1;
}

#[cfg(not(target_os = "linux"))]
mod si_code {
    pub const FPE_FLTDIV: i32 = 1;
    pub const FPE_FLTOVF: i32 = 2;
    pub const FPE_FLTUND: i32 = 3;
    pub const FPE_FLTRES: i32 = 4;
    pub const FPE_FLTINV: i32 = 5;
    pub const FPE_FLTSUB: i32 = 6;
    pub const FPE_INTDIV: i32 = 7;
    pub const FPE_INTOVF: i32 = 8;
    pub const ILL_BADSTK: i32 = 8;
    pub const BUS_ADRALN: i32 = 1;
}

fn arithmetic_kind(code: i32) -> ArithmeticKind {
    match code {
        si_code::FPE_INTDIV => ArithmeticKind::IntegerDivideByZero,
        si_code::FPE_INTOVF => ArithmeticKind::IntegerOverflow,
        si_code::FPE_FLTDIV => ArithmeticKind::FloatDivideByZero,
        si_code::FPE_FLTOVF => ArithmeticKind::FloatOverflow,
        si_code::FPE_FLTUND => ArithmeticKind::FloatUnderflow,
        si_code::FPE_FLTRES => ArithmeticKind::FloatInexact,
        si_code::FPE_FLTINV => ArithmeticKind::FloatInvalid,
        si_code::FPE_FLTSUB => ArithmeticKind::SubscriptOutOfRange,
        _ => ArithmeticKind::Unknown,
    }
}

/// Classify a fault from its signal, detail code and fault address.
pub fn classify(signal: FaultSignal, code: i32, address: usize) -> Fault {
    match signal {
        FaultSignal::Fpe => {
            let kind = arithmetic_kind(code);
            Fault::Arithmetic(ArithmeticError {
                kind,
                message: kind.message(),
                pc: address,
            })
        }
        FaultSignal::Bus if code == si_code::BUS_ADRALN => {
            Fault::MisalignedAccess(MisalignedAccess {
                message: "Invalid address alignment.",
                address,
            })
        }
        FaultSignal::Bus | FaultSignal::Segv => Fault::AccessViolation(AccessViolation {
            message: "Access violation.",
            address,
        }),
        FaultSignal::Ill if code == si_code::ILL_BADSTK => {
            Fault::StackCorruption(StackCorruption {
                message: "Internal stack error.",
                pc: address,
            })
        }
        FaultSignal::Ill => Fault::IllegalInstruction(IllegalInstruction {
            message: "Illegal instruction.",
            pc: address,
        }),
    }
}

static ENABLED: AtomicBool = AtomicBool::new(false);

/// Whether fault translation is currently installed.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

#[cfg(unix)]
mod platform {
    use core::ffi::c_void;
    use core::mem;
    use core::ptr;
    use std::io;

    use super::{classify, FaultSignal};
    use crate::error::{Result, RuntimeError};

    extern "C-unwind" {
        /// Declared with the unwinding ABI: the handler may unwind back out
        /// through this call.
        #[link_name = "raise"]
        fn raise_unwind(signal: libc::c_int) -> libc::c_int;
    }

    /// Fault handler. Runs on the faulting thread and never returns.
    extern "C-unwind" fn handle_fault(
        signal: libc::c_int,
        info: *mut libc::siginfo_t,
        _context: *mut c_void,
    ) {
        let Some(fault_signal) = FaultSignal::from_raw(signal) else {
            // SAFETY: abort is async-signal-safe.
            unsafe { libc::abort() };
        };

        let (code, address) = if info.is_null() {
            (0, 0)
        } else {
            // SAFETY: the kernel passes a valid siginfo_t with SA_SIGINFO.
            unsafe { ((*info).si_code, fault_address(info)) }
        };

        classify(fault_signal, code, address).raise()
    }

    #[cfg(target_os = "linux")]
    unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
        // SAFETY: caller guarantees `info` is valid.
        unsafe { (*info).si_addr() as usize }
    }

    #[cfg(not(target_os = "linux"))]
    unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
        // SAFETY: caller guarantees `info` is valid.
        unsafe { (*info).si_addr as usize }
    }

    fn set_disposition(signal: FaultSignal, handler: libc::sighandler_t, flags: libc::c_int) -> Result<()> {
        // SAFETY: `action` is fully initialized before use and the signal
        // numbers are valid.
        let ret = unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = handler;
            action.sa_flags = flags;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal.as_raw(), &action, ptr::null_mut())
        };

        if ret != 0 {
            return Err(RuntimeError::Signal {
                signal: signal.name(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub(super) fn install() -> Result<()> {
        let handler = handle_fault
            as extern "C-unwind" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)
            as libc::sighandler_t;

        // SA_NODEFER: the handler unwinds instead of returning, so the
        // signal must not stay blocked afterwards.
        for signal in FaultSignal::ALL {
            set_disposition(signal, handler, libc::SA_SIGINFO | libc::SA_NODEFER)?;
        }
        Ok(())
    }

    pub(super) fn restore_defaults() -> Result<()> {
        for signal in FaultSignal::ALL {
            set_disposition(signal, libc::SIG_DFL, 0)?;
        }
        Ok(())
    }

    /// Current handler address for `signal`.
    pub(super) fn disposition(signal: FaultSignal) -> Result<libc::sighandler_t> {
        // SAFETY: querying with a null new action only reads the old one.
        unsafe {
            let mut old: libc::sigaction = mem::zeroed();
            if libc::sigaction(signal.as_raw(), ptr::null(), &mut old) != 0 {
                return Err(RuntimeError::Signal {
                    signal: signal.name(),
                    source: io::Error::last_os_error(),
                });
            }
            Ok(old.sa_sigaction)
        }
    }

    pub(super) fn raise(signal: FaultSignal) -> Result<()> {
        // SAFETY: raising a signal on the calling thread; with translation
        // enabled the handler may unwind out of this call.
        if unsafe { raise_unwind(signal.as_raw()) } != 0 {
            return Err(RuntimeError::Signal {
                signal: signal.name(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

/// Start translating fault signals into exceptions.
#[cfg(unix)]
pub fn enable() -> Result<()> {
    platform::install()?;
    ENABLED.store(true, Ordering::Release);
    log::debug!("fault signal translation enabled");
    Ok(())
}

/// Restore the default dispositions of the fault signals.
#[cfg(unix)]
pub fn disable() -> Result<()> {
    platform::restore_defaults()?;
    ENABLED.store(false, Ordering::Release);
    log::debug!("fault signal translation disabled");
    Ok(())
}

/// Whether `signal` currently has its default disposition.
#[cfg(unix)]
pub fn is_default(signal: FaultSignal) -> Result<bool> {
    Ok(platform::disposition(signal)? == libc::SIG_DFL)
}

/// Raise `signal` on the calling thread.
///
/// With translation enabled and a try block open, this does not return:
/// the matching fault value is thrown instead.
#[cfg(unix)]
pub fn raise(signal: FaultSignal) -> Result<()> {
    platform::raise(signal)
}

#[cfg(not(unix))]
pub fn enable() -> Result<()> {
    Err(RuntimeError::Unsupported("fault signal translation"))
}

#[cfg(not(unix))]
pub fn disable() -> Result<()> {
    Err(RuntimeError::Unsupported("fault signal translation"))
}
