//! Plain FTP sessions

use std::io::Read;
use suppaftp::types::FileType;
use suppaftp::FtpStream;

use crate::protocols::{first_reachable, Endpoint, Login, RemoteError, RemoteSession};

pub struct FtpSession {
    stream: FtpStream,
}

impl RemoteSession for FtpSession {
    fn open(endpoint: &Endpoint<'_>, login: &Login<'_>) -> Result<Self, RemoteError> {
        let mut stream = first_reachable(endpoint, |addr| FtpStream::connect_timeout(addr, endpoint.timeout))?;
        let ready = stream
            .login(login.user, login.password.unwrap_or(""))
            .and_then(|_| stream.transfer_type(FileType::Binary));
        if let Err(e) = ready {
            let _ = stream.quit();
            return Err(e);
        }
        Ok(FtpSession { stream })
    }

    fn enter(&mut self, dir: &str) -> Result<(), RemoteError> {
        self.stream.cwd(dir)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        self.stream.mkdir(path)
    }

    fn upload(&mut self, name: &str, mut reader: &mut dyn Read, _size: u64) -> Result<u64, RemoteError> {
        self.stream.put_file(name, &mut reader)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.stream.rename(from, to)
    }

    fn remove(&mut self, name: &str) -> Result<(), RemoteError> {
        self.stream.rm(name)
    }

    fn ping(&mut self) -> Result<(), RemoteError> {
        self.stream.noop()
    }

    fn close(mut self) {
        let _ = self.stream.quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_open_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = Endpoint {
            host: "127.0.0.1",
            port,
            timeout: Duration::from_secs(1),
            insecure_skip_verify: false,
        };
        let login = Login {
            user: "anonymous",
            ..Default::default()
        };
        assert!(FtpSession::open(&endpoint, &login).is_err());
    }
}
