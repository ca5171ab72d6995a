//! Remote upload protocols
//!
//! FTP, FTPS, SFTP and SCP sessions behind one `RemoteSession` trait.
//! A session is opened ready to upload (connected, authenticated, binary
//! mode); `Remote` wraps whichever protocol a destination URI asks for so
//! the movers can pool it.

pub mod ftp;
pub mod ftps;
pub mod scp;
pub mod sftp;

pub use ftp::FtpSession;
pub use ftps::FtpsSession;
pub use scp::ScpSession;
pub use sftp::SftpSession;

use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Error type shared by all protocols
pub type RemoteError = suppaftp::FtpError;

/// Upload protocol selected from a URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ftp,
    Ftps,
    Sftp,
    Scp,
}

impl Protocol {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "ftp" => Some(Protocol::Ftp),
            "ftps" => Some(Protocol::Ftps),
            "sftp" => Some(Protocol::Sftp),
            "scp" | "ssh" => Some(Protocol::Scp),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Ftp | Protocol::Ftps => 21,
            Protocol::Sftp | Protocol::Scp => 22,
        }
    }

    /// User when the destination names none
    pub fn default_user(&self) -> String {
        match self {
            Protocol::Ftp | Protocol::Ftps => "anonymous".to_string(),
            Protocol::Sftp | Protocol::Scp => std::env::var("USER").unwrap_or_default(),
        }
    }
}

/// Where to connect
#[derive(Debug, Clone, Copy)]
pub struct Endpoint<'a> {
    pub host: &'a str,
    pub port: u16,
    pub timeout: Duration,
    /// Accept any server certificate (FTPS with self-signed certs)
    pub insecure_skip_verify: bool,
}

/// Who to log in as
#[derive(Clone, Copy, Default)]
pub struct Login<'a> {
    pub user: &'a str,
    pub password: Option<&'a str>,
    /// Private key for the SSH based protocols
    pub keyfile: Option<&'a str>,
    pub passphrase: Option<&'a str>,
}

pub(crate) fn io_error(kind: ErrorKind, message: String) -> RemoteError {
    RemoteError::ConnectionError(std::io::Error::new(kind, message))
}

/// Tries every address of `endpoint` in turn, keeping the last failure
pub(crate) fn first_reachable<T>(
    endpoint: &Endpoint<'_>,
    mut attempt: impl FnMut(SocketAddr) -> Result<T, RemoteError>,
) -> Result<T, RemoteError> {
    let addrs = (endpoint.host, endpoint.port)
        .to_socket_addrs()
        .map_err(RemoteError::ConnectionError)?;
    let mut last_error = None;
    for addr in addrs {
        match attempt(addr) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io_error(ErrorKind::NotFound, format!("No addresses found for {}", endpoint.host))
    }))
}

/// Joins `name` to `dir` unless it is absolute
pub(crate) fn join_remote(dir: &str, name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// An authenticated upload session
pub trait RemoteSession: Sized + Send {
    fn open(endpoint: &Endpoint<'_>, login: &Login<'_>) -> Result<Self, RemoteError>;

    /// Makes `dir` the directory relative names resolve against
    fn enter(&mut self, dir: &str) -> Result<(), RemoteError>;

    /// Creates one directory level
    fn mkdir(&mut self, path: &str) -> Result<(), RemoteError>;

    fn upload(&mut self, name: &str, reader: &mut dyn Read, size: u64) -> Result<u64, RemoteError>;

    fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError>;

    fn remove(&mut self, name: &str) -> Result<(), RemoteError>;

    /// Cheap round trip telling whether the session still works
    fn ping(&mut self) -> Result<(), RemoteError>;

    fn close(self);
}

/// Any of the protocol sessions
///
/// `RemoteSession::open` returns `Self`, so the trait is not object safe;
/// this enum is the concrete type the movers hold.
pub enum Remote {
    Ftp(FtpSession),
    Ftps(FtpsSession),
    Sftp(SftpSession),
    Scp(ScpSession),
}

macro_rules! each {
    ($self:expr, $session:ident => $call:expr) => {
        match $self {
            Remote::Ftp($session) => $call,
            Remote::Ftps($session) => $call,
            Remote::Sftp($session) => $call,
            Remote::Scp($session) => $call,
        }
    };
}

impl Remote {
    pub fn open(protocol: Protocol, endpoint: &Endpoint<'_>, login: &Login<'_>) -> Result<Self, RemoteError> {
        Ok(match protocol {
            Protocol::Ftp => Remote::Ftp(FtpSession::open(endpoint, login)?),
            Protocol::Ftps => Remote::Ftps(FtpsSession::open(endpoint, login)?),
            Protocol::Sftp => Remote::Sftp(SftpSession::open(endpoint, login)?),
            Protocol::Scp => Remote::Scp(ScpSession::open(endpoint, login)?),
        })
    }

    pub fn enter(&mut self, dir: &str) -> Result<(), RemoteError> {
        each!(self, s => s.enter(dir))
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        each!(self, s => s.mkdir(path))
    }

    pub fn upload(&mut self, name: &str, reader: &mut dyn Read, size: u64) -> Result<u64, RemoteError> {
        each!(self, s => s.upload(name, reader, size))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        each!(self, s => s.rename(from, to))
    }

    pub fn remove(&mut self, name: &str) -> Result<(), RemoteError> {
        each!(self, s => s.remove(name))
    }

    pub fn ping(&mut self) -> Result<(), RemoteError> {
        each!(self, s => s.ping())
    }

    pub fn close(self) {
        each!(self, s => s.close())
    }
}
