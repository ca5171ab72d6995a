//! Configuration files for the four roles
//!
//! Every role reads one JSON object. Keys holding an object are sections
//! (one chain per section for server, client and mirror, one target per
//! section for the dispatcher); every other key is a role-wide option.
//! Sections are kept in file order and parsed lazily, so a broken section
//! only takes itself down when the file is reloaded.

use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{MoveError, Result};
use crate::rules::DispatchRule;

/// Raw JSON object (a section or the option block)
pub type Section = serde_json::Map<String, Value>;

fn default_true() -> bool {
    true
}
fn default_uptime() -> f64 {
    30.0
}
fn default_connect_timeout() -> f64 {
    30.0
}
fn default_delete_delay() -> f64 {
    30.0
}
fn default_heartbeat_interval() -> f64 {
    30.0
}
fn default_missed_beats() -> u32 {
    3
}
fn default_req_timeout() -> f64 {
    1.0
}
fn default_transfer_req_timeout() -> f64 {
    10.0
}
fn default_ftp_root() -> String {
    "/".to_string()
}

/// Seconds given as a float in the config
pub fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Parameters handed to the movers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// How long an idle backend connection is kept for reuse (seconds)
    pub connection_uptime: f64,
    /// Private key for scp/sftp
    pub ssh_key_filename: Option<String>,
    /// Passphrase of `ssh_key_filename`
    pub ssh_key_passphrase: Option<SecretString>,
    /// Hosts (`host` or `host:port`) tried in order when the primary fails
    pub backup_targets: Vec<String>,
    /// Create missing remote directories before uploading
    pub create_target_directory: bool,
    /// TCP connect timeout (seconds)
    pub connect_timeout: f64,
    /// Skip TLS certificate verification (FTPS with self-signed certs)
    pub insecure_skip_verify: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        ConnectionParams {
            connection_uptime: default_uptime(),
            ssh_key_filename: None,
            ssh_key_passphrase: None,
            backup_targets: Vec::new(),
            create_target_directory: true,
            connect_timeout: default_connect_timeout(),
            insecure_skip_verify: false,
        }
    }
}

impl ConnectionParams {
    pub fn uptime(&self) -> Duration {
        seconds(self.connection_uptime)
    }

    pub fn timeout(&self) -> Duration {
        seconds(self.connect_timeout)
    }
}

/// One upstream Server/Mirror a client listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Provider {
    /// `host:port` of the provider's publisher
    pub address: String,
    /// Topic override for this provider
    pub topic: Option<String>,
}

impl Provider {
    /// Parses `host:port` or `host:port/topic`
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let (address, topic) = match spec.split_once('/') {
            Some((a, t)) if !t.is_empty() => (a, Some(format!("/{}", t))),
            Some((a, _)) => (a, None),
            None => (spec, None),
        };
        if address.is_empty() || !address.contains(':') {
            return Err(MoveError::Config(format!(
                "provider '{}' must be host:port[/topic]",
                spec
            )));
        }
        Ok(Provider {
            address: address.to_string(),
            topic,
        })
    }
}

/// A server chain: watch `origin`, announce on `topic`, serve requests
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Pattern of the watched files; its directory part must be static
    pub origin: String,
    pub topic: String,
    /// Port of the Responder. Without it, announcements carry resolved
    /// URIs and no transfer requests are served.
    pub request_port: Option<u16>,
    /// Address advertised to clients instead of `<hostname>:<request_port>`
    pub request_address: Option<String>,
    /// Static metadata, `key=value;key2=a,b`
    pub info: Option<String>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default = "default_delete_delay")]
    pub delete_delay: f64,
    /// `bzip`, `tar` or `xrit`
    pub compression: Option<String>,
    pub working_directory: Option<String>,
    pub xritdecompressor: Option<String>,
    pub station: Option<String>,
    #[serde(default)]
    pub disable_backlog: bool,
    #[serde(flatten)]
    pub connection: ConnectionParams,
}

/// A client chain: listen to providers on `topic`, fetch into `destination`
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    pub providers: Vec<String>,
    /// Publish addresses of hot-spare peers serving the same destination
    #[serde(default)]
    pub peers: Vec<String>,
    pub destination: String,
    pub topic: String,
    /// `user:password` inserted into `destination`
    pub login: Option<String>,
    #[serde(default = "default_true")]
    pub heartbeat: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
    #[serde(default = "default_missed_beats")]
    pub missed_beats: u32,
    /// Hot-spare delay before requesting (seconds)
    pub processing_delay: Option<f64>,
    #[serde(default = "default_req_timeout")]
    pub req_timeout: f64,
    #[serde(default = "default_transfer_req_timeout")]
    pub transfer_req_timeout: f64,
    pub compression: Option<String>,
    /// Remove the received archive after unpacking
    #[serde(default)]
    pub delete: bool,
    pub working_directory: Option<String>,
    pub xritdecompressor: Option<String>,
    #[serde(default = "default_true")]
    pub create_target_directory: bool,
    /// Local directory served as `/` by the FTP destination
    #[serde(default = "default_ftp_root")]
    pub ftp_root: String,
    /// Metadata rewrites, `key -> "old:new|old2:new2"`
    #[serde(default)]
    pub replacements: BTreeMap<String, String>,
}

/// A mirror chain: client toward `providers`, server toward downstream
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorSection {
    pub providers: Vec<String>,
    pub topic: String,
    pub request_port: u16,
    pub request_address: Option<String>,
    /// Staging directory
    pub working_directory: Option<String>,
    /// `scheme://[user[:password]@]host[:port]` upstream servers push into
    /// the staging directory through; local file access when unset
    pub destination: Option<String>,
    /// Wait this long before republishing (seconds)
    pub delay: Option<f64>,
    #[serde(default = "default_req_timeout")]
    pub req_timeout: f64,
    #[serde(default = "default_transfer_req_timeout")]
    pub transfer_req_timeout: f64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
    #[serde(default = "default_missed_beats")]
    pub missed_beats: u32,
    pub station: Option<String>,
    #[serde(flatten)]
    pub connection: ConnectionParams,
}

/// One dispatch target (a receiving host)
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Empty for local dispatch
    #[serde(default)]
    pub host: String,
    pub directory: Option<String>,
    /// Defaults to the source file name
    pub filepattern: Option<String>,
    pub publish_topic: Option<String>,
    #[serde(default)]
    pub connection_parameters: ConnectionParams,
    /// `key -> {old: new, ..., _alias_name: new_key}` (or a list of those)
    #[serde(default)]
    pub aliases: Section,
    pub dispatch_configs: Vec<DispatchRule>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerOptions {
    pub publish_port: u16,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
    pub disable_backlog: bool,
    pub station: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ClientOptions {
    pub publish_port: u16,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MirrorOptions {
    pub publish_port: u16,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DispatcherOptions {
    pub subscribe_addresses: Vec<String>,
    pub publish_port: Option<u16>,
}

/// Immutable snapshot of one configuration file
#[derive(Debug, Clone)]
pub struct RoleConfig<O> {
    pub options: O,
    sections: Vec<(String, Value)>,
}

pub type ServerConfig = RoleConfig<ServerOptions>;
pub type ClientConfig = RoleConfig<ClientOptions>;
pub type MirrorConfig = RoleConfig<MirrorOptions>;
pub type DispatcherConfig = RoleConfig<DispatcherOptions>;

impl<O: DeserializeOwned> RoleConfig<O> {
    /// Reads and splits a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            MoveError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| MoveError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| MoveError::Config(format!("invalid JSON: {}", e)))?;
        let root = match root {
            Value::Object(map) => map,
            _ => return Err(MoveError::Config("top level must be an object".into())),
        };

        let mut options = Section::new();
        let mut sections = Vec::new();
        for (key, value) in root {
            if value.is_object() {
                sections.push((key, value));
            } else {
                options.insert(key, value);
            }
        }
        let options = serde_json::from_value(Value::Object(options))
            .map_err(|e| MoveError::Config(format!("invalid options: {}", e)))?;
        Ok(RoleConfig { options, sections })
    }
}

impl<O> RoleConfig<O> {
    /// Section names in file order
    pub fn names(&self) -> Vec<&str> {
        self.sections.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Deserializes one section
    pub fn section<S: DeserializeOwned>(&self, name: &str) -> Result<S> {
        let raw = self
            .raw(name)
            .ok_or_else(|| MoveError::Config(format!("no section '{}'", name)))?;
        serde_json::from_value(raw.clone())
            .map_err(|e| MoveError::Config(format!("section '{}': {}", name, e)))
    }

    /// Deserializes every section, failing on the first broken one
    pub fn sections<S: DeserializeOwned>(&self) -> Result<Vec<(String, S)>> {
        self.names()
            .into_iter()
            .map(|name| Ok((name.to_string(), self.section(name)?)))
            .collect()
    }
}

/// Section names that differ between two snapshots
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff<O>(old: &RoleConfig<O>, new: &RoleConfig<O>) -> ConfigDiff {
    let mut result = ConfigDiff::default();
    for (name, value) in &new.sections {
        match old.raw(name) {
            None => result.added.push(name.clone()),
            Some(previous) if previous != value => result.changed.push(name.clone()),
            Some(_) => {}
        }
    }
    for (name, _) in &old.sections {
        if new.raw(name).is_none() {
            result.removed.push(name.clone());
        }
    }
    result
}

/// Parses the server `info` string: `key=value;key2=a,b`
///
/// Values holding a comma become lists.
pub fn parse_info(info: &str) -> Section {
    let mut out = Section::new();
    for item in info.split(';') {
        let Some((key, value)) = item.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = if value.contains(',') {
            Value::Array(
                value
                    .split(',')
                    .map(|v| Value::String(v.trim().to_string()))
                    .collect(),
            )
        } else {
            Value::String(value.to_string())
        };
        out.insert(key.to_string(), value);
    }
    out
}

/// Detects modifications of a config file through its mtime
#[derive(Debug)]
pub struct ConfigWatch {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl ConfigWatch {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let modified = mtime(&path);
        ConfigWatch { path, modified }
    }

    /// True once per modification
    pub fn changed(&mut self) -> bool {
        let current = mtime(&self.path);
        if current.is_some() && current != self.modified {
            self.modified = current;
            true
        } else {
            false
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    const SERVER_CONFIG: &str = r#"{
        "publish_port": 9010,
        "heartbeat_interval": 10,
        "eumetcast_hrit": {
            "origin": "/local_disk/tmp/H-000-{series:_<6s}-{time:%Y%m%d%H%M}-__",
            "topic": "/1b/hrit-segment/0deg",
            "request_port": 9094,
            "info": "sensors=seviri;stations=ka,kb",
            "delete": true,
            "compression": "xrit",
            "connection_uptime": 20,
            "ssh_key_passphrase": "not-logged"
        },
        "aapp_data": {
            "origin": "/data/{platform}_{orbit:05d}.l1b",
            "topic": "/1b/avhrr"
        }
    }"#;

    #[test]
    fn test_load_server_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("server.json");
        File::create(&path)
            .unwrap()
            .write_all(SERVER_CONFIG.as_bytes())
            .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.options.publish_port, 9010);
        assert_eq!(config.options.heartbeat_interval, 10.0);
        assert_eq!(config.names(), vec!["eumetcast_hrit", "aapp_data"]);

        let sections: Vec<(String, ServerSection)> = config.sections().unwrap();
        let hrit = &sections[0].1;
        assert_eq!(hrit.request_port, Some(9094));
        assert!(hrit.delete);
        assert_eq!(hrit.delete_delay, 30.0);
        assert_eq!(hrit.connection.uptime(), Duration::from_secs(20));
        assert_eq!(
            hrit.connection
                .ssh_key_passphrase
                .as_ref()
                .unwrap()
                .expose_secret(),
            "not-logged"
        );

        let aapp = &sections[1].1;
        assert_eq!(aapp.request_port, None);
        assert!(!aapp.delete);
        assert!(aapp.connection.create_target_directory);
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::parse(
            r#"{"c": {"providers": ["server:9010"], "destination": "/tmp/in", "topic": "/x"}}"#,
        )
        .unwrap();
        let section: ClientSection = config.section("c").unwrap();
        assert_eq!(section.req_timeout, 1.0);
        assert_eq!(section.transfer_req_timeout, 10.0);
        assert_eq!(section.missed_beats, 3);
        assert!(section.heartbeat);
        assert!(section.processing_delay.is_none());
        assert_eq!(section.ftp_root, "/");
    }

    #[test]
    fn test_invalid_files() {
        assert!(ServerConfig::parse("not json").is_err());
        assert!(ServerConfig::parse("[1, 2]").is_err());
        let config = ServerConfig::parse(r#"{"broken": {"topic": "/x"}}"#).unwrap();
        assert!(config.section::<ServerSection>("broken").is_err());
        assert!(config.section::<ServerSection>("missing").is_err());
    }

    #[test]
    fn test_diff_sections() {
        let old = ServerConfig::parse(
            r#"{"a": {"origin": "/a/{x}", "topic": "/a"},
                "b": {"origin": "/b/{x}", "topic": "/b"},
                "c": {"origin": "/c/{x}", "topic": "/c"}}"#,
        )
        .unwrap();
        let new = ServerConfig::parse(
            r#"{"a": {"origin": "/a/{x}", "topic": "/a"},
                "b": {"origin": "/b/{x}", "topic": "/b2"},
                "d": {"origin": "/d/{x}", "topic": "/d"}}"#,
        )
        .unwrap();
        let d = diff(&old, &new);
        assert_eq!(d.added, vec!["d"]);
        assert_eq!(d.removed, vec!["c"]);
        assert_eq!(d.changed, vec!["b"]);
        assert!(diff(&new, &new).is_empty());
    }

    #[test]
    fn test_parse_info() {
        let info = parse_info("sensors=seviri; stations=ka,kb ;broken;=x");
        assert_eq!(info["sensors"], Value::from("seviri"));
        assert_eq!(info["stations"], serde_json::json!(["ka", "kb"]));
        assert_eq!(info.len(), 2);
    }

    #[test]
    fn test_provider_parse() {
        let p = Provider::parse("server1:9010/1b/avhrr").unwrap();
        assert_eq!(p.address, "server1:9010");
        assert_eq!(p.topic.as_deref(), Some("/1b/avhrr"));
        assert_eq!(Provider::parse("server1:9010").unwrap().topic, None);
        assert!(Provider::parse("server1").is_err());
    }

    #[test]
    fn test_config_watch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "{}").unwrap();
        let mut watch = ConfigWatch::new(&path);
        assert!(!watch.changed());

        let later = SystemTime::now() + Duration::from_secs(5);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(watch.changed());
        assert!(!watch.changed());
    }
}
