/// Console logging with a verbose toggle
///
/// Wire traffic is chatty, so it only prints when verbose mode is on
/// (VERBOSE=1 in the environment, or the --verbose flag).

use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Enable or disable verbose logging
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::SeqCst);
}

/// Check if verbose logging is enabled
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::SeqCst)
}

/// Applies the VERBOSE environment toggle
pub fn init_from_env() {
    if std::env::var("VERBOSE").map(|v| v == "1").unwrap_or(false) {
        set_verbose(true);
    }
}

/// Log a message only in verbose mode
#[macro_export]
macro_rules! verbose {
    ($($arg:tt)*) => {
        if $crate::logging::is_verbose() {
            println!($($arg)*);
        }
    };
}

/// Log an error/warning message (always shown)
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*)
    };
}

/// Log an important info message (always shown)
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        println!($($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_toggle() {
        set_verbose(true);
        assert!(is_verbose());
        set_verbose(false);
        assert!(!is_verbose());
    }
}
