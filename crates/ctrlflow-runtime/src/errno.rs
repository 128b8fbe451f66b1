//! Symbolic names and descriptions for `errno` codes.
//!
//! Used for un-recovered panic diagnostics; the name table covers the
//! POSIX set everywhere and the Linux extensions on Linux.

use std::ffi::CStr;
use std::os::raw::c_char;

macro_rules! errno_names {
    ($code:expr; $($name:ident),* $(,)?) => {
        match $code {
            $(c if c == libc::$name => Some(stringify!($name)),)*
            _ => None,
        }
    };
}

fn posix_name(code: i32) -> Option<&'static str> {
    errno_names!(code;
        EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, ENOEXEC, EBADF, ECHILD,
        EAGAIN, ENOMEM, EACCES, EFAULT, EBUSY, EEXIST, EXDEV, ENODEV, ENOTDIR,
        EISDIR, EINVAL, ENFILE, EMFILE, ENOTTY, ETXTBSY, EFBIG, ENOSPC, ESPIPE,
        EROFS, EMLINK, EPIPE, EDOM, ERANGE, EDEADLK, ENAMETOOLONG, ENOLCK,
        ENOSYS, ENOTEMPTY, ELOOP, ENOMSG, EIDRM, ENOSTR, ENODATA, ETIME, ENOSR,
        ENOLINK, EPROTO, EMULTIHOP, EBADMSG, EOVERFLOW, EILSEQ, EUSERS,
        ENOTSOCK, EDESTADDRREQ, EMSGSIZE, EPROTOTYPE, ENOPROTOOPT,
        EPROTONOSUPPORT, ESOCKTNOSUPPORT, EOPNOTSUPP, EPFNOSUPPORT,
        EAFNOSUPPORT, EADDRINUSE, EADDRNOTAVAIL, ENETDOWN, ENETUNREACH,
        ENETRESET, ECONNABORTED, ECONNRESET, ENOBUFS, EISCONN, ENOTCONN,
        ESHUTDOWN, ETOOMANYREFS, ETIMEDOUT, ECONNREFUSED, EHOSTDOWN,
        EHOSTUNREACH, EALREADY, EINPROGRESS, ESTALE, EDQUOT, ECANCELED,
        EOWNERDEAD, ENOTRECOVERABLE,
    )
}

#[cfg(target_os = "linux")]
fn platform_name(code: i32) -> Option<&'static str> {
    errno_names!(code;
        ENOTBLK, ECHRNG, EL2NSYNC, EL3HLT, EL3RST, ELNRNG, EUNATCH, ENOCSI,
        EL2HLT, EBADE, EBADR, EXFULL, ENOANO, EBADRQC, EBADSLT, EBFONT, ENONET,
        ENOPKG, EREMOTE, EADV, ESRMNT, ECOMM, EDOTDOT, ENOTUNIQ, EBADFD,
        EREMCHG, ELIBACC, ELIBBAD, ELIBSCN, ELIBMAX, ELIBEXEC, ERESTART,
        ESTRPIPE, EUCLEAN, ENOTNAM, ENAVAIL, EISNAM, EREMOTEIO, ENOMEDIUM,
        EMEDIUMTYPE, ENOKEY, EKEYEXPIRED, EKEYREVOKED, EKEYREJECTED, ERFKILL,
        EHWPOISON,
    )
}

#[cfg(not(target_os = "linux"))]
fn platform_name(_code: i32) -> Option<&'static str> {
    None
}

/// Symbolic name of `code`, e.g. `"EINVAL"`, or `"???"` if unknown.
///
/// Aliased codes (`EWOULDBLOCK`, `EDEADLOCK`, `ENOTSUP` on Linux) report
/// the name they alias.
pub fn error_name(code: i32) -> &'static str {
    posix_name(code)
        .or_else(|| platform_name(code))
        .unwrap_or("???")
}

/// Human-readable description of `code`, as reported by the C library.
pub fn error_description(code: i32) -> String {
    let mut buf = [0 as c_char; 256];
    // SAFETY: `buf` is writable for its full length and strerror_r
    // NUL-terminates on success.
    let ret = unsafe { libc::strerror_r(code, buf.as_mut_ptr(), buf.len()) };
    if ret != 0 {
        return format!("Unknown error {code}");
    }
    // SAFETY: NUL-terminated on success (checked above).
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_name() {
        assert_eq!(error_name(libc::EINVAL), "EINVAL");
        assert_eq!(error_name(libc::ENOMEM), "ENOMEM");
        assert_eq!(error_name(libc::EAGAIN), "EAGAIN");
        assert_eq!(error_name(-1), "???");
        assert_eq!(error_name(0), "???");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_only_names() {
        assert_eq!(error_name(libc::EKEYREVOKED), "EKEYREVOKED");
    }

    #[test]
    fn test_error_description() {
        let text = error_description(libc::ENOENT);
        assert!(!text.is_empty());
        assert_ne!(text, format!("Unknown error {}", libc::ENOENT));
    }
}
