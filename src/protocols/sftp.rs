//! SFTP sessions over ssh2
//!
//! `ssh_session` is shared with the SCP sessions.

use ssh2::{Session, Sftp};
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::path::Path;

use crate::protocols::{first_reachable, io_error, join_remote, Endpoint, Login, RemoteError, RemoteSession};

/// Connects, performs the handshake and authenticates
///
/// A password wins over a key file; with neither, the keys of a running
/// ssh-agent are tried.
pub(crate) fn ssh_session(endpoint: &Endpoint<'_>, login: &Login<'_>) -> Result<Session, RemoteError> {
    let timeout = endpoint.timeout;
    let stream = first_reachable(endpoint, |addr| {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(RemoteError::ConnectionError)?;
        stream.set_read_timeout(Some(timeout)).map_err(RemoteError::ConnectionError)?;
        stream.set_write_timeout(Some(timeout)).map_err(RemoteError::ConnectionError)?;
        Ok(stream)
    })?;

    let mut session = Session::new()
        .map_err(|e| io_error(ErrorKind::Other, format!("Cannot create SSH session: {}", e)))?;
    session.set_tcp_stream(stream);
    session.handshake().map_err(|e| {
        io_error(
            ErrorKind::ConnectionRefused,
            format!("SSH handshake with {} failed: {}", endpoint.host, e),
        )
    })?;
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);

    let user = login.user;
    let auth = match (login.password, login.keyfile) {
        (Some(password), _) => session.userauth_password(user, password),
        (None, Some(keyfile)) => session.userauth_pubkey_file(user, None, Path::new(keyfile), login.passphrase),
        (None, None) => session.userauth_agent(user),
    };
    auth.map_err(|e| {
        io_error(
            ErrorKind::PermissionDenied,
            format!("SSH authentication failed for '{}': {}", user, e),
        )
    })?;
    Ok(session)
}

pub struct SftpSession {
    session: Session,
    sftp: Sftp,
    dir: String,
}

fn failed(action: &str, path: &str, e: ssh2::Error) -> RemoteError {
    io_error(ErrorKind::Other, format!("Cannot {} '{}': {}", action, path, e))
}

impl RemoteSession for SftpSession {
    fn open(endpoint: &Endpoint<'_>, login: &Login<'_>) -> Result<Self, RemoteError> {
        let session = ssh_session(endpoint, login)?;
        let sftp = session.sftp().map_err(|e| {
            io_error(ErrorKind::ConnectionRefused, format!("Cannot open SFTP channel: {}", e))
        })?;
        Ok(SftpSession {
            session,
            sftp,
            dir: "/".to_string(),
        })
    }

    /// There is no remote working directory; the path is checked and kept
    fn enter(&mut self, dir: &str) -> Result<(), RemoteError> {
        self.sftp
            .stat(Path::new(dir))
            .map_err(|e| io_error(ErrorKind::NotFound, format!("Cannot access '{}': {}", dir, e)))?;
        self.dir = dir.to_string();
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        let path = join_remote(&self.dir, path);
        self.sftp.mkdir(Path::new(&path), 0o755).map_err(|e| failed("create directory", &path, e))
    }

    fn upload(&mut self, name: &str, reader: &mut dyn Read, _size: u64) -> Result<u64, RemoteError> {
        let path = join_remote(&self.dir, name);
        let mut file = self.sftp.create(Path::new(&path)).map_err(|e| failed("create", &path, e))?;
        std::io::copy(reader, &mut file).map_err(RemoteError::ConnectionError)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        let from = join_remote(&self.dir, from);
        let to = join_remote(&self.dir, to);
        self.sftp
            .rename(Path::new(&from), Path::new(&to), None)
            .map_err(|e| failed("rename", &from, e))
    }

    fn remove(&mut self, name: &str) -> Result<(), RemoteError> {
        let path = join_remote(&self.dir, name);
        self.sftp.unlink(Path::new(&path)).map_err(|e| failed("remove", &path, e))
    }

    fn ping(&mut self) -> Result<(), RemoteError> {
        self.sftp
            .stat(Path::new(&self.dir))
            .map(|_| ())
            .map_err(|e| io_error(ErrorKind::BrokenPipe, format!("SFTP session lost: {}", e)))
    }

    fn close(self) {
        drop(self.sftp);
        let _ = self.session.disconnect(None, "bye", None);
    }
}
