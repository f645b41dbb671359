//! Fatal-error sink for broken pool contracts.
//!
//! Contract violations (double frees, foreign pointers, destroying a referenced object, ...) are
//! programming errors, not recoverable conditions. They are checked in every build, logged as
//! `error` events and then raised as a panic carrying the rendered [`InvariantViolation`].

use std::fmt;
use std::panic::Location;

use crate::InvariantViolation;

/// Checks a pool contract, reporting a violation with the given message if it does not hold.
macro_rules! invariant {
    ($condition:expr, $($message:tt)+) => {
        if !$condition {
            $crate::fatal::violation(stringify!($condition), format_args!($($message)+));
        }
    };
}

pub(crate) use invariant;

#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn violation(condition: &'static str, message: fmt::Arguments<'_>) -> ! {
    let violation = InvariantViolation::new(condition, Location::caller(), message);

    tracing::error!(
        condition = violation.condition(),
        location = violation.location(),
        "{}",
        violation.message()
    );

    panic!("{violation}");
}
