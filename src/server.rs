//! Server role
//!
//! One chain per config section: a directory watcher feeding an announcer,
//! plus (with `request_port`) a request server pushing files to the
//! clients that ask for them. All chains share one publisher and one
//! heartbeat.

use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::bus::{Publish, RequestHandler, Service, Transport};
use crate::config::{self, parse_info, seconds, ConnectionParams, Section, ServerConfig, ServerOptions, ServerSection};
use crate::error::{MoveError, Result};
use crate::executor::TransferExecutor;
use crate::heartbeat::Beacon;
use crate::listener::SERVER_HEARTBEAT_TOPIC;
use crate::logging::{debug, log_with_tag};
use crate::message::{announcement_kind, Message, MessageType, Metadata, HOSTNAME};
use crate::movers::MoverRegistry;
use crate::pattern::Pattern;
use crate::unpack::Unpacker;
use crate::uri::{clean_url, Destination};
use crate::watcher::{backlog, DirWatcher};
use crate::Role;

/// Upper bound of entries in an `info` reply
pub const INFO_MAX_COUNT: usize = 2256;
const ANNOUNCED_CAPACITY: usize = 61000;
const POLL: Duration = Duration::from_millis(200);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Recently announced `<topic>/<uid>` entries, newest first
#[derive(Debug, Default)]
pub struct AnnounceLog {
    entries: VecDeque<String>,
}

impl AnnounceLog {
    pub fn push(&mut self, entry: String) {
        if self.entries.len() >= ANNOUNCED_CAPACITY {
            self.entries.pop_back();
        }
        self.entries.push_front(entry);
    }

    pub fn matching(&self, prefix: &str, max_count: usize) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.starts_with(prefix))
            .take(max_count)
            .cloned()
            .collect()
    }
}

/// Removes files (or whole directories) a fixed delay after they were scheduled
pub struct Deleter {
    tx: Option<Sender<PathBuf>>,
    handle: Option<JoinHandle<()>>,
}

impl Deleter {
    pub fn start(delay: Duration, tag: &str) -> Self {
        let (tx, rx) = mpsc::channel::<PathBuf>();
        let tag = tag.to_string();
        let handle = thread::Builder::new()
            .name(format!("{}:deleter", tag))
            .spawn(move || {
                let mut pending: VecDeque<(Instant, PathBuf)> = VecDeque::new();
                loop {
                    let wait = pending
                        .front()
                        .map(|(due, _)| due.saturating_duration_since(Instant::now()))
                        .unwrap_or(Duration::from_secs(2))
                        .min(Duration::from_secs(2));
                    match rx.recv_timeout(wait) {
                        Ok(path) => pending.push_back((Instant::now() + delay, path)),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    while pending.front().map(|(due, _)| *due <= Instant::now()).unwrap_or(false) {
                        if let Some((_, path)) = pending.pop_front() {
                            let removed = if path.is_dir() {
                                fs::remove_dir_all(&path)
                            } else {
                                fs::remove_file(&path)
                            };
                            match removed {
                                Ok(()) => debug(&format!("Removed {}", path.display()), Some(&tag)),
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => {
                                    let _ = log_with_tag(
                                        &format!("Cannot remove {}: {}", path.display(), e),
                                        Some(&tag),
                                    );
                                }
                            }
                        }
                    }
                }
            })
            .ok();
        Deleter { tx: Some(tx), handle }
    }

    pub fn add(&self, path: PathBuf) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(path);
        }
    }

    pub fn stop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Deleter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A file made available for a push
pub struct Staged {
    pub path: PathBuf,
    /// Holds a temporary copy; dropping it removes the copy
    scratch: Option<TempDir>,
}

impl Staged {
    /// A file served where it lies
    pub fn in_place(path: PathBuf) -> Self {
        Staged { path, scratch: None }
    }

    /// A copy living in `scratch`, gone together with it
    pub fn in_scratch(path: PathBuf, scratch: TempDir) -> Self {
        Staged {
            path,
            scratch: Some(scratch),
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.scratch.is_some()
    }
}

/// Where the files of a push request come from
pub trait Origin: Send + Sync {
    fn fetch(&self, request: &Message, file: &Metadata) -> Result<Staged>;

    /// The local file an `ack` of `file` releases for deletion, if any.
    /// Never transfers anything.
    fn release(&self, file: &Metadata) -> Result<Option<PathBuf>>;
}

/// Files on this machine, restricted to names matching the chain's pattern
pub struct LocalOrigin {
    pub pattern: Option<Pattern>,
}

impl LocalOrigin {
    fn local_path(&self, file: &Metadata) -> Result<PathBuf> {
        let uri = file
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| MoveError::InvalidMessage("file descriptor without uri".into()))?;
        let path = Destination::parse(uri)?.path;
        if let Some(pattern) = &self.pattern {
            if !pattern.matches_file_name(&path) {
                return Err(MoveError::InvalidMessage(format!("{} not reachable", path)));
            }
        }
        Ok(PathBuf::from(path))
    }
}

impl Origin for LocalOrigin {
    fn fetch(&self, _request: &Message, file: &Metadata) -> Result<Staged> {
        Ok(Staged::in_place(self.local_path(file)?))
    }

    fn release(&self, file: &Metadata) -> Result<Option<PathBuf>> {
        self.local_path(file).map(Some)
    }
}

/// Answers `push`, `ack`, `ping` and `info` requests
pub struct RequestServer {
    tag: String,
    origin: Box<dyn Origin>,
    executor: TransferExecutor,
    params: ConnectionParams,
    deleter: Option<Deleter>,
    station: String,
    announced: Arc<Mutex<AnnounceLog>>,
    started: Instant,
}

impl RequestServer {
    pub fn new(
        tag: &str,
        origin: Box<dyn Origin>,
        executor: TransferExecutor,
        params: ConnectionParams,
        deleter: Option<Deleter>,
        station: String,
        announced: Arc<Mutex<AnnounceLog>>,
    ) -> Self {
        RequestServer {
            tag: tag.to_string(),
            origin,
            executor,
            params,
            deleter,
            station,
            announced,
            started: Instant::now(),
        }
    }

    /// Always produces a reply
    pub fn handle(&self, request: &Message) -> Message {
        debug(&format!("Processing {} request on {}", request.kind, request.subject), Some(&self.tag));
        let result = match request.kind {
            MessageType::Ping => Ok(self.pong(request)),
            MessageType::Push => self.push(request),
            MessageType::Ack => self.ack(request),
            MessageType::Info => Ok(self.info(request)),
            _ => Ok(request.reply(MessageType::Unknown, Metadata::new())),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                let _ = log_with_tag(&format!("Request failed: {}", e), Some(&self.tag));
                Message::error_reply(&request.subject, e)
            }
        }
    }

    fn pong(&self, request: &Message) -> Message {
        let mut data = Metadata::new();
        data.insert("station".into(), Value::String(self.station.clone()));
        request.reply(MessageType::Pong, data)
    }

    fn push(&self, request: &Message) -> Result<Message> {
        let destination = request
            .get_str("destination")
            .ok_or_else(|| MoveError::InvalidMessage("push request without destination".into()))?;
        let dest = Destination::parse(destination)?;
        let files = request.files();
        if files.is_empty() {
            return Err(MoveError::InvalidMessage("push request without files".into()));
        }

        for file in &files {
            // a temporary copy goes away with `staged` at the end of the iteration
            let staged = self.origin.fetch(request, file)?;
            let name = staged
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| MoveError::InvalidMessage(format!("no file name in {}", staged.path.display())))?;
            let mut target = dest.clone();
            if let Some(rel_path) = file.get("path").and_then(Value::as_str) {
                target = target.join(rel_path.trim_matches('/'));
            }
            let target = target.join(&name);

            self.executor.transfer(&staged.path, &target, &self.params)?;
            let _ = log_with_tag(
                &format!("Pushed {} to {}", staged.path.display(), target.clean()),
                Some(&self.tag),
            );
            if !staged.is_temporary() {
                if let Some(deleter) = &self.deleter {
                    deleter.add(staged.path.clone());
                }
            }
        }

        let mut data = request.data.clone();
        data.insert("destination".into(), Value::String(clean_url(destination)));
        Ok(request.reply(announcement_kind(&data), data))
    }

    fn ack(&self, request: &Message) -> Result<Message> {
        for file in request.files() {
            if !file.contains_key("uri") {
                continue;
            }
            if let Some(path) = self.origin.release(&file)? {
                if let Some(deleter) = &self.deleter {
                    deleter.add(path);
                }
            }
        }
        let mut data = request.data.clone();
        if let Some(destination) = request.get_str("destination") {
            data.insert("destination".into(), Value::String(clean_url(destination)));
        }
        Ok(request.reply(MessageType::Ack, data))
    }

    fn info(&self, request: &Message) -> Message {
        let max_count = request
            .data
            .get("max_count")
            .and_then(Value::as_u64)
            .map(|n| (n as usize).min(INFO_MAX_COUNT))
            .unwrap_or(INFO_MAX_COUNT);
        let files = lock(&self.announced).matching(&request.subject, max_count);
        let uptime = self.started.elapsed().as_secs();
        let mut data = Metadata::new();
        data.insert("files".into(), json!(files));
        data.insert("max_count".into(), json!(max_count));
        data.insert(
            "uptime".into(),
            json!(format!("{}:{:02}:{:02}", uptime / 3600, uptime / 60 % 60, uptime % 60)),
        );
        request.reply(MessageType::Info, data)
    }
}

/// Turns new files into announcements
struct Announcer {
    tag: String,
    topic: String,
    pattern: Pattern,
    info: Section,
    unpacker: Option<Unpacker>,
    delete_packed: bool,
    request_address: Option<String>,
    publisher: Arc<dyn Publish>,
    announced: Arc<Mutex<AnnounceLog>>,
}

fn descriptor(path: &Path, local_uri: bool) -> Metadata {
    let mut file = Metadata::new();
    let uid = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let uri = if local_uri {
        format!("file://{}{}", HOSTNAME.as_str(), path.display())
    } else {
        path.display().to_string()
    };
    file.insert("uri".into(), Value::String(uri));
    file.insert("uid".into(), Value::String(uid));
    file
}

impl Announcer {
    fn announce(&self, path: &Path) -> Result<Message> {
        let fields = self.pattern.parse(&path.to_string_lossy())?;
        debug(&format!("We have a match: {}", path.display()), Some(&self.tag));

        let produced = match &self.unpacker {
            Some(unpacker) => {
                let produced = unpacker.unpack(path)?;
                if self.delete_packed && produced.iter().all(|p| p != path) {
                    let _ = fs::remove_file(path);
                }
                produced
            }
            None => vec![path.to_path_buf()],
        };

        let mut data = self.info.clone();
        data.extend(fields);
        let local_uri = self.request_address.is_none();
        match produced.as_slice() {
            [single] => data.extend(descriptor(single, local_uri)),
            many => {
                let dataset = many
                    .iter()
                    .map(|p| Value::Object(descriptor(p, local_uri)))
                    .collect();
                data.insert("dataset".into(), Value::Array(dataset));
            }
        }
        match &self.request_address {
            Some(address) => {
                data.insert("request_address".into(), Value::String(address.clone()));
            }
            None => {
                data.insert(
                    "filesystem".into(),
                    json!({"cls": "local", "protocol": "file", "host": HOSTNAME.as_str()}),
                );
            }
        }

        let msg = Message::new(self.topic.as_str(), announcement_kind(&data), data);
        self.publisher.send(&msg)?;
        let mut announced = lock(&self.announced);
        for uid in msg.uids() {
            announced.push(format!("{}/{}", self.topic, uid));
        }
        debug(&format!("Message sent: {}", msg), Some(&self.tag));
        Ok(msg)
    }

    fn handle(&self, path: &Path) {
        match self.announce(path) {
            Ok(_) => {}
            Err(e) if e.is_benign() => debug(&e.to_string(), Some(&self.tag)),
            Err(e) => {
                let _ = log_with_tag(&format!("Cannot announce {}: {}", path.display(), e), Some(&self.tag));
            }
        }
    }
}

/// Shared by all chains of a server
#[derive(Clone)]
pub struct ServerContext {
    pub transport: Arc<dyn Transport>,
    pub registry: MoverRegistry,
    pub publisher: Arc<dyn Publish>,
    pub announced: Arc<Mutex<AnnounceLog>>,
    pub station: Option<String>,
    pub disable_backlog: bool,
}

/// One running config section
pub struct Chain {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    service: Option<Box<dyn Service>>,
    request_address: Option<String>,
    _watcher: DirWatcher,
}

/// `host:port` advertised for a service
fn advertised(service: &dyn Service, request_address: Option<&str>) -> String {
    let address = service.address();
    match request_address {
        Some(host) => {
            let port = address.rsplit(':').next().unwrap_or_default();
            format!("{}:{}", host, port)
        }
        None => address,
    }
}

impl Chain {
    pub fn start(name: &str, section: ServerSection, ctx: &ServerContext) -> Result<Self> {
        let tag = format!("server:{}", name);
        let pattern = Pattern::new(&section.origin)?;
        let directory = PathBuf::from(pattern.directory()?);
        let unpacker = section
            .compression
            .as_deref()
            .map(|c| Unpacker::new(c, section.working_directory.as_deref(), section.xritdecompressor.as_deref()))
            .transpose()?;
        let station = section
            .station
            .clone()
            .or_else(|| ctx.station.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let (service, request_address) = match section.request_port {
            Some(port) => {
                let deleter = (section.delete || unpacker.is_some())
                    .then(|| Deleter::start(seconds(section.delete_delay), &tag));
                let server = Arc::new(RequestServer::new(
                    &tag,
                    Box::new(LocalOrigin {
                        pattern: Some(pattern.clone()),
                    }),
                    TransferExecutor::new(ctx.registry.clone(), &tag),
                    section.connection.clone(),
                    deleter,
                    station,
                    ctx.announced.clone(),
                ));
                let handler: RequestHandler = Arc::new(move |msg: &Message| server.handle(msg));
                let service = ctx.transport.serve(port, handler)?;
                let address = advertised(service.as_ref(), section.request_address.as_deref());
                let _ = log_with_tag(&format!("Serving requests on {}", address), Some(&tag));
                (Some(service), Some(address))
            }
            None => (None, None),
        };

        let announcer = Announcer {
            tag: tag.clone(),
            topic: section.topic.clone(),
            pattern,
            info: section.info.as_deref().map(parse_info).unwrap_or_default(),
            unpacker,
            delete_packed: section.delete,
            request_address: request_address.clone(),
            publisher: ctx.publisher.clone(),
            announced: ctx.announced.clone(),
        };

        let (tx, rx) = mpsc::channel();
        let watcher = DirWatcher::start(&directory, tx, &tag)?;
        let _ = log_with_tag(&format!("Watching {}", section.origin), Some(&tag));

        let process_backlog = !(ctx.disable_backlog || section.disable_backlog);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let worker = thread::Builder::new()
            .name(tag.clone())
            .spawn(move || {
                if process_backlog {
                    for path in backlog(&directory) {
                        if thread_stop.load(Ordering::SeqCst) {
                            return;
                        }
                        announcer.handle(&path);
                    }
                }
                while !thread_stop.load(Ordering::SeqCst) {
                    match rx.recv_timeout(POLL) {
                        Ok(path) => announcer.handle(&path),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Chain {
            stop,
            worker: Some(worker),
            service,
            request_address,
            _watcher: watcher,
        })
    }

    /// Address clients send their requests to, if the chain serves any
    pub fn request_address(&self) -> Option<&str> {
        self.request_address.as_deref()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(mut service) = self.service.take() {
            service.stop();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct Server {
    ctx: ServerContext,
    chains: BTreeMap<String, Chain>,
    config: Option<ServerConfig>,
    beacon: Beacon,
}

impl Server {
    /// Opens the publisher; failing to bind it is fatal
    pub fn new(transport: Arc<dyn Transport>, registry: MoverRegistry, options: &ServerOptions) -> Result<Self> {
        let publisher = transport.publisher(options.publish_port)?;
        let _ = log_with_tag(&format!("Publishing on {}", publisher.address()), Some("server"));
        let beacon = Beacon::start(
            publisher.clone(),
            SERVER_HEARTBEAT_TOPIC,
            seconds(options.heartbeat_interval),
        );
        Ok(Server {
            ctx: ServerContext {
                transport,
                registry,
                publisher,
                announced: Arc::new(Mutex::new(AnnounceLog::default())),
                station: options.station.clone(),
                disable_backlog: options.disable_backlog,
            },
            chains: BTreeMap::new(),
            config: None,
            beacon,
        })
    }

    pub fn publish_address(&self) -> String {
        self.ctx.publisher.address()
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.get(name)
    }
}

impl Role for Server {
    type Options = ServerOptions;

    fn apply(&mut self, config: ServerConfig) -> Vec<MoveError> {
        let changes = match &self.config {
            Some(old) => config::diff(old, &config),
            None => config::ConfigDiff {
                added: config.names().into_iter().map(String::from).collect(),
                ..Default::default()
            },
        };

        for name in changes.removed.iter().chain(&changes.changed) {
            if let Some(mut chain) = self.chains.remove(name) {
                chain.stop();
                let _ = log_with_tag(&format!("Stopped chain {}", name), Some("server"));
            }
        }

        let mut failures = Vec::new();
        for name in changes.added.iter().chain(&changes.changed) {
            let started = config
                .section::<ServerSection>(name)
                .and_then(|section| Chain::start(name, section, &self.ctx));
            match started {
                Ok(chain) => {
                    let _ = log_with_tag(&format!("Started chain {}", name), Some("server"));
                    self.chains.insert(name.clone(), chain);
                }
                Err(e) => {
                    let err = MoveError::ConfigReload {
                        section: name.clone(),
                        reason: e.to_string(),
                    };
                    let _ = log_with_tag(&err.to_string(), Some("server"));
                    failures.push(err);
                }
            }
        }
        self.config = Some(config);
        failures
    }

    fn stop(&mut self) {
        for (_, mut chain) in std::mem::take(&mut self.chains) {
            chain.stop();
        }
        self.beacon.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use std::time::Duration;
    use tempfile::tempdir;

    fn server_config(dir: &Path, extra: &str) -> ServerConfig {
        ServerConfig::parse(&format!(
            r#"{{
                "publish_port": 0,
                "chain1": {{
                    "origin": "{}/{{platform}}_{{orbit:05d}}.txt",
                    "topic": "/1b/test",
                    "info": "sensor=avhrr;channels=1,2"
                    {}
                }}
            }}"#,
            dir.display(),
            extra
        ))
        .unwrap()
    }

    fn start(bus: &MemoryBus, config: ServerConfig) -> Server {
        let mut server = Server::new(Arc::new(bus.clone()), MoverRegistry::default(), &config.options).unwrap();
        assert!(server.apply(config).is_empty());
        server
    }

    fn next_file_message(sub: &mut Box<dyn crate::bus::MessageSource>) -> Message {
        loop {
            let msg = sub.recv_timeout(Duration::from_secs(5)).unwrap().expect("no announcement");
            if msg.kind != MessageType::Beat {
                return msg;
            }
        }
    }

    #[test]
    fn test_announces_matching_files_only() {
        let dir = tempdir().unwrap();
        let bus = MemoryBus::new();
        let mut server = start(&bus, server_config(dir.path(), r#", "request_port": 0"#));
        let mut sub = bus
            .subscribe(&server.publish_address(), &["/1b".to_string()])
            .unwrap();
        thread::sleep(Duration::from_millis(100));

        fs::write(dir.path().join("other.dat"), b"x").unwrap();
        fs::write(dir.path().join("noaa19_01234.txt"), b"x").unwrap();

        let msg = next_file_message(&mut sub);
        assert_eq!(msg.kind, MessageType::File);
        assert_eq!(msg.subject, "/1b/test");
        assert_eq!(msg.data["uid"], "noaa19_01234.txt");
        assert_eq!(msg.data["platform"], "noaa19");
        assert_eq!(msg.data["orbit"], 1234);
        assert_eq!(msg.data["sensor"], "avhrr");
        assert_eq!(msg.data["channels"], json!(["1", "2"]));
        let request_address = server.chain("chain1").unwrap().request_address().unwrap().to_string();
        assert_eq!(msg.data["request_address"], Value::String(request_address));
        server.stop();
    }

    #[test]
    fn test_without_request_port_announces_local_uri() {
        let dir = tempdir().unwrap();
        let bus = MemoryBus::new();
        let mut server = start(&bus, server_config(dir.path(), ""));
        let mut sub = bus.subscribe(&server.publish_address(), &["/1b".to_string()]).unwrap();
        thread::sleep(Duration::from_millis(100));

        fs::write(dir.path().join("metop_00001.txt"), b"x").unwrap();
        let msg = next_file_message(&mut sub);
        let uri = msg.get_str("uri").unwrap();
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("/metop_00001.txt"));
        assert!(msg.data.contains_key("filesystem"));
        assert!(!msg.data.contains_key("request_address"));
        server.stop();
    }

    #[test]
    fn test_backlog_is_announced_at_start() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("noaa18_00042.txt"), b"old").unwrap();
        let bus = MemoryBus::new();
        let config = server_config(dir.path(), "");
        let mut server = Server::new(Arc::new(bus.clone()), MoverRegistry::default(), &config.options).unwrap();
        let mut sub = bus.subscribe(&server.publish_address(), &["/1b".to_string()]).unwrap();
        assert!(server.apply(config).is_empty());

        let msg = next_file_message(&mut sub);
        assert_eq!(msg.data["uid"], "noaa18_00042.txt");
        server.stop();
    }

    #[test]
    fn test_requests_always_answered() {
        let dir = tempdir().unwrap();
        let bus = MemoryBus::new();
        let mut server = start(&bus, server_config(dir.path(), r#", "request_port": 0, "station": "norrkoping""#));
        let address = server.chain("chain1").unwrap().request_address().unwrap().to_string();
        let timeout = Duration::from_secs(2);

        let ping = Message::new("/1b/test", MessageType::Ping, Metadata::new());
        let pong = bus.request(&address, &ping, timeout).unwrap();
        assert_eq!(pong.kind, MessageType::Pong);
        assert_eq!(pong.data["station"], "norrkoping");

        // push without a destination
        let mut data = Metadata::new();
        data.insert("uid".into(), json!("noaa19_00001.txt"));
        data.insert("uri".into(), json!(format!("{}/noaa19_00001.txt", dir.path().display())));
        let push = Message::new("/1b/test", MessageType::Push, data.clone());
        let reply = bus.request(&address, &push, timeout).unwrap();
        assert_eq!(reply.kind, MessageType::Error);

        // file outside the pattern
        let mut bad = data.clone();
        bad.insert("uri".into(), json!("/etc/passwd"));
        bad.insert("destination".into(), json!("file:///tmp/x/"));
        let reply = bus
            .request(&address, &Message::new("/1b/test", MessageType::Push, bad), timeout)
            .unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        assert!(reply.get_str("reason").unwrap().contains("not reachable"));

        // missing source file
        data.insert("destination".into(), json!(format!("file://{}/out/", dir.path().display())));
        let reply = bus
            .request(&address, &Message::new("/1b/test", MessageType::Push, data), timeout)
            .unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        server.stop();
    }

    #[test]
    fn test_push_and_info() {
        let dir = tempdir().unwrap();
        let out = tempdir().unwrap();
        let bus = MemoryBus::new();
        let mut server = start(
            &bus,
            server_config(dir.path(), r#", "request_port": 0, "delete": true, "delete_delay": 0"#),
        );
        let mut sub = bus.subscribe(&server.publish_address(), &["/1b".to_string()]).unwrap();
        thread::sleep(Duration::from_millis(100));
        let source = dir.path().join("noaa19_00007.txt");
        fs::write(&source, b"payload").unwrap();
        let announcement = next_file_message(&mut sub);

        let mut data = announcement.data.clone();
        data.insert("destination".into(), json!(format!("file://user:pw@{}", out.path().display())));
        let address = announcement.get_str("request_address").unwrap().to_string();
        let reply = bus
            .request(&address, &Message::new("/1b/test", MessageType::Push, data), Duration::from_secs(5))
            .unwrap();
        assert_eq!(reply.kind, MessageType::File);
        assert!(!reply.get_str("destination").unwrap().contains("pw"));
        assert_eq!(fs::read(out.path().join("noaa19_00007.txt")).unwrap(), b"payload");

        let deadline = Instant::now() + Duration::from_secs(5);
        while source.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(!source.exists());

        let info = bus
            .request(&address, &Message::new("/1b", MessageType::Info, Metadata::new()), Duration::from_secs(2))
            .unwrap();
        assert_eq!(info.kind, MessageType::Info);
        assert_eq!(info.data["files"], json!(["/1b/test/noaa19_00007.txt"]));
        server.stop();
    }

    #[test]
    fn test_reload_only_touches_changed_sections() {
        let dir1 = tempdir().unwrap();
        let dir2 = tempdir().unwrap();
        let bus = MemoryBus::new();
        let text = |topic2: &str| {
            format!(
                r#"{{"a": {{"origin": "{}/{{name}}.txt", "topic": "/a", "request_port": 0}},
                    "b": {{"origin": "{}/{{name}}.txt", "topic": "{}"}}}}"#,
                dir1.path().display(),
                dir2.path().display(),
                topic2
            )
        };
        let first = ServerConfig::parse(&text("/b")).unwrap();
        let mut server = start(&bus, first);
        let address_a = server.chain("a").unwrap().request_address().unwrap().to_string();

        let second = ServerConfig::parse(&text("/b2")).unwrap();
        assert!(server.apply(second).is_empty());
        assert_eq!(server.chain("a").unwrap().request_address().unwrap(), address_a);
        assert!(server.chain("b").is_some());

        let broken = ServerConfig::parse(&format!(
            r#"{{"a": {{"origin": "{}/{{name}}.txt", "topic": "/a", "request_port": 0}},
                "b": {{"topic": "/b"}}}}"#,
            dir1.path().display()
        ))
        .unwrap();
        let failures = server.apply(broken);
        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], MoveError::ConfigReload { section, .. } if section == "b"));
        assert!(server.chain("a").is_some());
        server.stop();
    }

    #[test]
    fn test_ack_schedules_local_file_removal() {
        let dir = tempdir().unwrap();
        let bus = MemoryBus::new();
        let mut server = start(
            &bus,
            server_config(dir.path(), r#", "request_port": 0, "delete": true, "delete_delay": 0"#),
        );
        let address = server.chain("chain1").unwrap().request_address().unwrap().to_string();
        let source = dir.path().join("noaa19_00003.txt");
        fs::write(&source, b"x").unwrap();

        let mut data = Metadata::new();
        data.insert("uid".into(), json!("noaa19_00003.txt"));
        data.insert("uri".into(), json!(source.display().to_string()));
        let reply = bus
            .request(&address, &Message::new("/1b/test", MessageType::Ack, data), Duration::from_secs(2))
            .unwrap();
        assert_eq!(reply.kind, MessageType::Ack);
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(!source.exists());
        server.stop();
    }

    #[test]
    fn test_deleter_removes_files_and_directories() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        let scratch = dir.path().join("scratch");
        fs::write(&file, b"x").unwrap();
        fs::create_dir_all(scratch.join("deep")).unwrap();
        fs::write(scratch.join("deep/b.txt"), b"y").unwrap();

        let mut deleter = Deleter::start(Duration::from_millis(50), "test");
        deleter.add(file.clone());
        deleter.add(scratch.clone());
        let deadline = Instant::now() + Duration::from_secs(5);
        while (file.exists() || scratch.exists()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!file.exists());
        assert!(!scratch.exists());
        deleter.stop();
    }

    #[test]
    fn test_scratch_copy_goes_with_staged_file() {
        let root = tempdir().unwrap();
        let scratch = tempfile::Builder::new().prefix(".push-").tempdir_in(root.path()).unwrap();
        let path = scratch.path().join("scene.dat");
        fs::write(&path, b"x").unwrap();
        let staged = Staged::in_scratch(path.clone(), scratch);
        assert!(staged.is_temporary());
        drop(staged);
        assert!(!path.exists());
        assert!(fs::read_dir(root.path()).unwrap().next().is_none());
        assert!(!Staged::in_place(root.path().join("x")).is_temporary());
    }

    #[test]
    fn test_announce_log_prefix_and_limit() {
        let mut log = AnnounceLog::default();
        log.push("/a/1".into());
        log.push("/b/2".into());
        log.push("/a/3".into());
        assert_eq!(log.matching("/a", 10), vec!["/a/3", "/a/1"]);
        assert_eq!(log.matching("/a", 1), vec!["/a/3"]);
    }
}
