//! Trollmover library
//!
//! Moves satellite data files between hosts on announcement. Four roles
//! share this library:
//!
//! - `server` watches directories, announces new files and pushes them to
//!   whoever asks;
//! - `client` listens to servers and requests announced files into its
//!   destination;
//! - `mirror` relays a set of upstream servers as a single server;
//! - `dispatcher` copies announced local files to rule-selected targets.
//!
//! Roles talk over the message bus in `bus` and move data with the movers
//! in `movers`.

pub mod bus;
pub mod cli;
pub mod client;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod listener;
pub mod logging;
pub mod message;
pub mod mirror;
pub mod movers;
pub mod pattern;
pub mod protocols;
pub mod responder;
pub mod rules;
pub mod server;
pub mod shutdown;
pub mod unpack;
pub mod uri;
pub mod watcher;

use serde::de::DeserializeOwned;

pub use config::RoleConfig;
pub use error::{MoveError, Result};
pub use logging::{debug, log, log_with_tag, set_debug, set_log_file};
pub use shutdown::{install_signal_handlers, is_shutdown_requested, request_shutdown, take_reload_request};

/// Name of the program, used in usage and version output
pub const PROGRAM_NAME: &str = "trollmover";

/// Current version of the program (from Cargo.toml)
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A running role, driven by successive configuration snapshots
pub trait Role {
    /// Role-wide options of the configuration file
    type Options: DeserializeOwned;

    /// Brings the running chains in line with `config`
    ///
    /// Only sections that changed since the previous call are touched.
    /// Sections that fail to start are reported and skipped; the others
    /// keep running.
    fn apply(&mut self, config: RoleConfig<Self::Options>) -> Vec<MoveError>;

    /// Stops every chain and background thread
    fn stop(&mut self);
}
