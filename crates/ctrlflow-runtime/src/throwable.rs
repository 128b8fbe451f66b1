//! Type tags for thrown values.
//!
//! Every value passed to [`throw`](crate::throw) carries a short type tag that
//! catch clauses compare against. Primitive scalars use canonical names
//! (`int`, `double`, ...); user types use their declared name, normally
//! attached with the [`throwable!`](crate::throwable!) macro.

use core::marker::PhantomData;
use core::mem::size_of;

/// The maximum size of a value allowed to be thrown.
pub const MAX_THROWABLE_SIZE: usize = 128;

/// A value that can be thrown and caught.
///
/// Thrown values are copied byte-for-byte into a thread-local record, so
/// they must be `Copy` and own no borrowed data.
pub trait Throwable: Copy + 'static {
    /// Tag compared by catch clauses. Must be non-empty.
    const TYPE_NAME: &'static str;
}

/// Compile-time guard for [`MAX_THROWABLE_SIZE`].
///
/// Referencing `SizeCheck::<T>::OK` fails to compile when `T` is too large.
pub(crate) struct SizeCheck<T>(PhantomData<T>);

impl<T> SizeCheck<T> {
    pub(crate) const OK: () = assert!(
        size_of::<T>() <= MAX_THROWABLE_SIZE,
        "throwable object size exceeds MAX_THROWABLE_SIZE"
    );
}

/// Implement [`Throwable`] for one or more types, tagging each with its
/// declared name.
///
/// ```
/// #[derive(Clone, Copy)]
/// struct ParseError {
///     line: u32,
/// }
///
/// ctrlflow_runtime::throwable!(ParseError);
///
/// use ctrlflow_runtime::Throwable;
/// assert_eq!(ParseError::TYPE_NAME, "ParseError");
/// ```
#[macro_export]
macro_rules! throwable {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl $crate::Throwable for $ty {
                const TYPE_NAME: &'static str = stringify!($ty);
            }
        )+
    };
}

macro_rules! primitive_throwable {
    ($($ty:ty => $name:literal),+ $(,)?) => {
        $(
            impl Throwable for $ty {
                const TYPE_NAME: &'static str = $name;
            }
        )+
    };
}

primitive_throwable! {
    i8 => "schar",
    u8 => "uchar",
    char => "char",
    i16 => "short",
    u16 => "ushort",
    i32 => "int",
    u32 => "uint",
    i64 => "long",
    u64 => "ulong",
    i128 => "longlong",
    u128 => "ulonglong",
    isize => "isize",
    usize => "usize",
    f32 => "float",
    f64 => "double",
    bool => "bool",
}
