use chrono::Local;
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Global log file path protected by Mutex
///
/// When None, logs go to stdout.
pub static LOG_FILE: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Whether `debug` lines are written at all
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Logs a message with timestamp to configured output
///
/// # Example
/// ```text
/// // log("Starting server").unwrap();
/// ```
pub fn log(message: &str) -> io::Result<()> {
    log_with_tag(message, None)
}

/// Logs a message with timestamp and optional worker tag
///
/// Every chain, listener and responder tags its lines with the name of the
/// config section it serves, so interleaved output from many threads can be
/// told apart.
///
/// # Example
/// ```text
/// // log_with_tag("Listener started", Some("client:eumetcast")).unwrap();
/// ```
pub fn log_with_tag(message: &str, tag: Option<&str>) -> io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let log_message = match tag {
        Some(tag) => format!("{} [{}] {}\n", timestamp, tag, message),
        None => format!("{} {}\n", timestamp, message),
    };

    // A poisoned lock only means another thread panicked mid-write
    let guard = match LOG_FILE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match &*guard {
        Some(log_file) => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;
            file.write_all(log_message.as_bytes())?;
        }
        None => {
            print!("{}", log_message);
        }
    }

    Ok(())
}

/// Logs a message only when debug output was enabled
pub fn debug(message: &str, tag: Option<&str>) {
    if DEBUG_ENABLED.load(Ordering::Relaxed) {
        let _ = log_with_tag(&format!("DEBUG {}", message), tag);
    }
}

/// Turns `debug` output on or off
pub fn set_debug(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Sets the path for the log file
///
/// Subsequent calls to the log functions append to this file.
pub fn set_log_file<P: AsRef<Path>>(path: P) {
    let path_str = path.as_ref().to_string_lossy().into_owned();
    let mut guard = match LOG_FILE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(path_str);
}
