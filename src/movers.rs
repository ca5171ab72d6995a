//! Mover backends
//!
//! A `Mover` opens a `Connection` toward one destination endpoint; the
//! connection uploads files until it is closed. The registry picks the
//! mover from the URI scheme.

use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::config::ConnectionParams;
use crate::error::{MoveError, Result};
use crate::logging::debug;
use crate::protocols::{Endpoint, Login, Protocol, Remote, RemoteError};
use crate::uri::Destination;

/// An open backend session
pub trait Connection: Send {
    /// Uploads `source` to the full destination path `dest.path`
    fn put(&mut self, source: &Path, dest: &Destination) -> Result<()>;

    /// Whether the session can still be used
    fn is_alive(&mut self) -> bool;

    fn close(self: Box<Self>);
}

pub trait Mover: Send + Sync {
    fn open(&self, dest: &Destination, params: &ConnectionParams) -> Result<Box<dyn Connection>>;
}

/// Local filesystem: hard link when possible, copy otherwise
pub struct LocalMover;

struct LocalConnection;

/// Places `source` at `target`, creating the parent directories
pub fn link_or_copy(source: &Path, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if target.exists() {
        fs::remove_file(target)?;
    }
    match fs::hard_link(source, target) {
        Ok(()) => Ok(()),
        Err(_) => fs::copy(source, target).map(|_| ()),
    }
}

impl Connection for LocalConnection {
    fn put(&mut self, source: &Path, dest: &Destination) -> Result<()> {
        link_or_copy(source, Path::new(&dest.path)).map_err(|e| MoveError::transfer(dest.clean(), e))
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    fn close(self: Box<Self>) {}
}

impl Mover for LocalMover {
    fn open(&self, _dest: &Destination, _params: &ConnectionParams) -> Result<Box<dyn Connection>> {
        Ok(Box::new(LocalConnection))
    }
}

/// FTP, FTPS, SFTP and SCP through the protocol clients
pub struct RemoteMover {
    protocol: Protocol,
}

impl RemoteMover {
    pub fn new(protocol: Protocol) -> Self {
        RemoteMover { protocol }
    }
}

struct RemoteConnection {
    remote: Option<Remote>,
    create_dirs: bool,
    created: Vec<String>,
}

fn remote_err(dest: &Destination, e: RemoteError) -> MoveError {
    MoveError::transfer(dest.clean(), e.to_string().replace('\n', " "))
}

impl RemoteConnection {
    fn ensure_dir(remote: &mut Remote, dir: &str, created: &mut Vec<String>) {
        if created.iter().any(|d| d == dir) {
            return;
        }
        let mut path = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            path.push('/');
            path.push_str(part);
            // already existing directories make mkdir fail, which is fine
            let _ = remote.mkdir(&path);
        }
        created.push(dir.to_string());
    }
}

impl Connection for RemoteConnection {
    fn put(&mut self, source: &Path, dest: &Destination) -> Result<()> {
        let remote = self
            .remote
            .as_mut()
            .ok_or_else(|| MoveError::transfer(dest.clean(), "connection already closed"))?;

        let target = Path::new(&dest.path);
        let dir = target
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let filename = dest
            .file_name()
            .ok_or_else(|| MoveError::transfer(dest.clean(), "destination has no file name"))?
            .to_string();

        if self.create_dirs {
            Self::ensure_dir(remote, &dir, &mut self.created);
        }
        remote.enter(if dir.is_empty() { "/" } else { &dir }).map_err(|e| remote_err(dest, e))?;

        let mut file = File::open(source)?;
        let size = file.metadata()?.len();

        // Upload to a temporary name, then rename into place
        let tmp_filename = format!(".{}.tmp~", filename);
        if let Err(e) = remote.upload(&tmp_filename, &mut file, size) {
            let _ = remote.remove(&tmp_filename);
            return Err(remote_err(dest, e));
        }
        if remote.rename(&tmp_filename, &filename).is_err() {
            // the target probably exists; replace it
            let _ = remote.remove(&filename);
            if let Err(e) = remote.rename(&tmp_filename, &filename) {
                let _ = remote.remove(&tmp_filename);
                return Err(remote_err(dest, e));
            }
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.remote.as_mut() {
            Some(remote) => remote.ping().is_ok(),
            None => false,
        }
    }

    fn close(mut self: Box<Self>) {
        if let Some(remote) = self.remote.take() {
            remote.close();
        }
    }
}

impl Mover for RemoteMover {
    fn open(&self, dest: &Destination, params: &ConnectionParams) -> Result<Box<dyn Connection>> {
        let user = dest.username.clone().unwrap_or_else(|| self.protocol.default_user());
        let login = Login {
            user: &user,
            password: dest.password.as_ref().map(|p| p.expose_secret().as_str()),
            keyfile: params.ssh_key_filename.as_deref(),
            passphrase: params.ssh_key_passphrase.as_ref().map(|p| p.expose_secret().as_str()),
        };
        let endpoint = Endpoint {
            host: &dest.host,
            port: dest.port.unwrap_or_else(|| self.protocol.default_port()),
            timeout: params.timeout(),
            insecure_skip_verify: params.insecure_skip_verify,
        };

        debug(&format!("Connecting to {}", dest.clean()), Some("mover"));
        let remote = Remote::open(self.protocol, &endpoint, &login).map_err(|e| remote_err(dest, e))?;
        Ok(Box::new(RemoteConnection {
            remote: Some(remote),
            create_dirs: params.create_target_directory,
            created: Vec::new(),
        }))
    }
}

/// Movers keyed by URI scheme
#[derive(Clone)]
pub struct MoverRegistry {
    movers: HashMap<String, Arc<dyn Mover>>,
}

impl MoverRegistry {
    pub fn empty() -> Self {
        MoverRegistry {
            movers: HashMap::new(),
        }
    }

    pub fn register(&mut self, scheme: &str, mover: Arc<dyn Mover>) {
        self.movers.insert(scheme.to_string(), mover);
    }

    pub fn get(&self, scheme: &str) -> Result<Arc<dyn Mover>> {
        self.movers
            .get(scheme)
            .cloned()
            .ok_or_else(|| MoveError::UnsupportedScheme(scheme.to_string()))
    }
}

impl Default for MoverRegistry {
    fn default() -> Self {
        let mut registry = MoverRegistry::empty();
        let local: Arc<dyn Mover> = Arc::new(LocalMover);
        registry.register("file", local.clone());
        registry.register("", local);
        for scheme in ["ftp", "ftps", "sftp", "scp", "ssh"] {
            if let Some(protocol) = Protocol::from_scheme(scheme) {
                registry.register(scheme, Arc::new(RemoteMover::new(protocol)));
            }
        }
        registry
    }
}
