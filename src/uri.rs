//! Destination URIs
//!
//! Accepts `scheme://[user[:password]@]host[:port]/path` and bare paths
//! (treated as `file`). The password is kept as a secret and never shown
//! by `Display` or `clean()`.

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::path::Path;
use zeroize::Zeroizing;

use crate::error::{MoveError, Result};
use crate::message::HOSTNAME;

static URI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<scheme>[a-zA-Z][a-zA-Z0-9+.-]*)://(?:(?P<user>[^:@/]+)(?::(?P<password>[^@/]*))?@)?(?P<host>[^:/]*)(?::(?P<port>\d+))?(?P<path>/.*)?$",
    )
    .expect("Invalid URI regex")
});

/// A parsed destination or source URI
#[derive(Clone)]
pub struct Destination {
    pub scheme: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Destination {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(MoveError::InvalidMessage("empty destination".into()));
        }

        if !uri.contains("://") {
            return Ok(Destination {
                scheme: "file".into(),
                username: None,
                password: None,
                host: String::new(),
                port: None,
                path: uri.to_string(),
            });
        }

        let caps = URI_REGEX
            .captures(uri)
            .ok_or_else(|| MoveError::InvalidMessage(format!("malformed URI '{}'", redact(uri))))?;

        let port = match caps.name("port") {
            Some(p) => Some(p.as_str().parse::<u16>().map_err(|e| {
                MoveError::InvalidMessage(format!("bad port in '{}': {}", redact(uri), e))
            })?),
            None => None,
        };

        Ok(Destination {
            scheme: caps["scheme"].to_ascii_lowercase(),
            username: caps.name("user").map(|m| m.as_str().to_string()),
            password: caps
                .name("password")
                .map(|m| SecretString::new(m.as_str().to_string())),
            host: caps
                .name("host")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            port,
            path: caps
                .name("path")
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
        })
    }

    /// True when the URI designates this machine's filesystem
    pub fn is_local(&self) -> bool {
        (self.scheme == "file" || self.scheme.is_empty())
            && (self.host.is_empty()
                || self.host == "localhost"
                || self.host == "127.0.0.1"
                || self.host == HOSTNAME.as_str())
    }

    /// The URI without credentials, safe for logs and replies
    pub fn clean(&self) -> String {
        let mut out = format!("{}://{}", self.scheme, self.host);
        if let Some(port) = self.port {
            out.push_str(&format!(":{}", port));
        }
        out.push_str(&self.path);
        out
    }

    /// The full URI including credentials, wiped from memory on drop
    pub fn expose(&self) -> Zeroizing<String> {
        let mut out = Zeroizing::new(format!("{}://", self.scheme));
        if let Some(user) = &self.username {
            out.push_str(user);
            if let Some(password) = &self.password {
                out.push(':');
                out.push_str(password.expose_secret());
            }
            out.push('@');
        }
        out.push_str(&self.host);
        if let Some(port) = self.port {
            out.push_str(&format!(":{}", port));
        }
        out.push_str(&self.path);
        out
    }

    /// Same endpoint, different path
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        let mut dest = self.clone();
        dest.path = path.into();
        dest
    }

    /// Same path and credentials on another host (used for backup targets)
    pub fn with_host(&self, host: &str) -> Self {
        let mut dest = self.clone();
        match host.rsplit_once(':') {
            Some((h, p)) if p.parse::<u16>().is_ok() => {
                dest.host = h.to_string();
                dest.port = p.parse().ok();
            }
            _ => dest.host = host.to_string(),
        }
        dest
    }

    /// Appends a file name to the destination when it names a directory
    pub fn join(&self, file_name: &str) -> Self {
        if self.path.ends_with('/') {
            self.with_path(format!("{}{}", self.path, file_name))
        } else {
            self.with_path(format!("{}/{}", self.path, file_name))
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        Path::new(&self.path).file_name().and_then(|n| n.to_str())
    }

    /// Key identifying the remote endpoint (for connection pooling)
    pub fn endpoint(&self) -> String {
        format!(
            "{}://{}@{}:{}",
            self.scheme,
            self.username.as_deref().unwrap_or(""),
            self.host,
            self.port.map(|p| p.to_string()).unwrap_or_default()
        )
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.clean())
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({})", self.clean())
    }
}

/// Removes login information from a URI string
pub fn clean_url(uri: &str) -> String {
    match Destination::parse(uri) {
        Ok(dest) if uri.contains("://") => dest.clean(),
        Ok(_) => uri.to_string(),
        Err(_) => redact(uri),
    }
}

fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.find('@')) {
        (Some(start), Some(at)) if at > start => format!("{}{}", &uri[..start + 3], &uri[at + 1..]),
        _ => uri.to_string(),
    }
}
