//! Fatal invariant checks.
//!
//! [`kassert!`] is always enabled. A failed check means a caller broke the
//! contract of a primitive (stale handle, unbalanced release, teardown with
//! queued work). Nothing downstream can be trusted after that, so the failure
//! is logged at error level and the thread panics.

/// Assert an invariant of a kernsync primitive, panicking with the message on
/// failure.
#[macro_export]
macro_rules! kassert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::diag::fatal(::core::format_args!(
                "assertion failed: {}",
                ::core::stringify!($cond)
            ));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::diag::fatal(::core::format_args!($($arg)+));
        }
    };
}

/// Log and panic. Called by [`kassert!`]; not meant to be used directly.
#[cold]
#[inline(never)]
#[track_caller]
pub fn fatal(args: core::fmt::Arguments<'_>) -> ! {
    log::error!("{args}");
    panic!("{args}");
}
