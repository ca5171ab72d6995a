use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

/// Global shutdown flag (atomic bool)
///
/// Set to true when shutdown is requested via signal.
/// Role loops check this flag regularly and stop their workers.
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Set by SIGHUP, cleared by the role loop once the config was re-read
pub static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global flag to track which signal triggered shutdown
///
/// Values: 0 = none, 1 = SIGINT, 2 = SIGTERM
pub static SIGNAL_TYPE: AtomicU8 = AtomicU8::new(0);

/// Checks if graceful shutdown has been requested
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Signals all role loops to shutdown gracefully
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Request shutdown with signal type for later logging
///
/// This only sets atomic flags; logging is done in the main thread.
///
/// # Arguments
/// * `signal_type` - 1 for SIGINT, 2 for SIGTERM
pub fn request_shutdown_with_signal(signal_type: u8) {
    SIGNAL_TYPE.store(signal_type, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Get the signal type that triggered shutdown
///
/// # Returns
/// * `None` if no signal received
/// * `Some(1)` for SIGINT (Ctrl+C)
/// * `Some(2)` for SIGTERM
pub fn get_signal_type() -> Option<u8> {
    let signal_type = SIGNAL_TYPE.load(Ordering::SeqCst);
    if signal_type == 0 {
        None
    } else {
        Some(signal_type)
    }
}

/// Asks the role loop to re-read its configuration
pub fn request_reload() {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

/// Returns true once per reload request
pub fn take_reload_request() -> bool {
    RELOAD_REQUESTED.swap(false, Ordering::SeqCst)
}

/// Installs SIGINT/SIGTERM (shutdown) and SIGHUP (reload) handling
///
/// The handler thread only flips atomics.
pub fn install_signal_handlers() -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGHUP => request_reload(),
                    SIGINT => request_shutdown_with_signal(1),
                    _ => request_shutdown_with_signal(2),
                }
            }
        })?;
    Ok(())
}

/// Reset the flags (for testing purposes only)
#[cfg(test)]
pub fn reset_shutdown_for_tests() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    RELOAD_REQUESTED.store(false, Ordering::SeqCst);
    SIGNAL_TYPE.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_shutdown_with_signal() {
        reset_shutdown_for_tests();
        assert!(!is_shutdown_requested());
        assert_eq!(get_signal_type(), None);

        request_shutdown_with_signal(2);
        assert!(is_shutdown_requested());
        assert_eq!(get_signal_type(), Some(2));

        reset_shutdown_for_tests();
    }

    #[test]
    #[serial]
    fn test_reload_request_is_consumed_once() {
        reset_shutdown_for_tests();
        request_reload();
        assert!(take_reload_request());
        assert!(!take_reload_request());
        reset_shutdown_for_tests();
    }
}
