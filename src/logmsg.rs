//! Leveled console messages.
//!
//! A single process-wide verbosity knob set once by the CLI. Level 0 prints
//! errors and forced messages only; each `-v` raises the level. Messages go
//! to stderr so that listings and prompts on stdout stay parseable.

use std::sync::atomic::{AtomicI32, Ordering};

static VERBOSITY: AtomicI32 = AtomicI32::new(0);

pub fn set_verbosity(level: i32) {
    VERBOSITY.store(level, Ordering::Relaxed);
}

pub fn verbosity() -> i32 {
    VERBOSITY.load(Ordering::Relaxed)
}

/// Print to stderr when the current verbosity is at least `$lvl`.
#[macro_export]
macro_rules! msg {
    ($lvl:expr, $($arg:tt)*) => {
        if $crate::logmsg::verbosity() >= $lvl {
            eprintln!($($arg)*);
        }
    };
}

/// Print an error line to stderr unconditionally.
#[macro_export]
macro_rules! errmsg {
    ($($arg:tt)*) => {
        eprintln!($($arg)*)
    };
}
