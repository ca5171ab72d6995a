//! SCP sessions
//!
//! Uploads go through `scp_send`; directories, renames and removals run
//! as remote shell commands.

use ssh2::Session;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use crate::protocols::sftp::ssh_session;
use crate::protocols::{io_error, join_remote, Endpoint, Login, RemoteError, RemoteSession};

pub struct ScpSession {
    session: Session,
    dir: String,
}

/// Quotes one shell argument for the remote side
fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

impl ScpSession {
    fn run(&mut self, command: &str) -> Result<(), RemoteError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| io_error(ErrorKind::Other, format!("Cannot open SSH channel: {}", e)))?;
        channel
            .exec(command)
            .map_err(|e| io_error(ErrorKind::Other, format!("'{}' failed: {}", command, e)))?;
        let mut stderr = String::new();
        let _ = channel.stderr().read_to_string(&mut stderr);
        let _ = channel.wait_close();
        match channel.exit_status() {
            Ok(0) => Ok(()),
            Ok(code) => Err(io_error(
                ErrorKind::Other,
                format!("'{}' exited with {}: {}", command, code, stderr.trim()),
            )),
            Err(e) => Err(io_error(ErrorKind::Other, e.to_string())),
        }
    }
}

impl RemoteSession for ScpSession {
    fn open(endpoint: &Endpoint<'_>, login: &Login<'_>) -> Result<Self, RemoteError> {
        Ok(ScpSession {
            session: ssh_session(endpoint, login)?,
            dir: ".".to_string(),
        })
    }

    fn enter(&mut self, dir: &str) -> Result<(), RemoteError> {
        self.dir = dir.to_string();
        Ok(())
    }

    fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        let path = join_remote(&self.dir, path);
        self.run(&format!("mkdir -p {}", quote(&path)))
    }

    fn upload(&mut self, name: &str, reader: &mut dyn Read, size: u64) -> Result<u64, RemoteError> {
        let path = join_remote(&self.dir, name);
        let mut channel = self
            .session
            .scp_send(Path::new(&path), 0o644, size, None)
            .map_err(|e| io_error(ErrorKind::Other, format!("scp to '{}' failed: {}", path, e)))?;
        let written = std::io::copy(reader, &mut channel).map_err(RemoteError::ConnectionError)?;
        channel.flush().map_err(RemoteError::ConnectionError)?;
        channel
            .send_eof()
            .and_then(|_| channel.wait_eof())
            .and_then(|_| channel.close())
            .and_then(|_| channel.wait_close())
            .map_err(|e| io_error(ErrorKind::Other, format!("scp to '{}' not confirmed: {}", path, e)))?;
        Ok(written)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        let command = format!(
            "mv -f {} {}",
            quote(&join_remote(&self.dir, from)),
            quote(&join_remote(&self.dir, to))
        );
        self.run(&command)
    }

    fn remove(&mut self, name: &str) -> Result<(), RemoteError> {
        let command = format!("rm -f {}", quote(&join_remote(&self.dir, name)));
        self.run(&command)
    }

    fn ping(&mut self) -> Result<(), RemoteError> {
        self.session
            .keepalive_send()
            .map(|_| ())
            .map_err(|e| io_error(ErrorKind::BrokenPipe, format!("SSH session lost: {}", e)))
    }

    fn close(self) {
        let _ = self.session.disconnect(None, "bye", None);
    }
}
