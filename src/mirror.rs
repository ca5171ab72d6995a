//! Mirror role
//!
//! Listens to upstream servers like a client and republishes their
//! announcements with its own request address. A downstream push request
//! is served by first fetching the file from an upstream server into a
//! scratch directory of its own under the staging directory; the scratch
//! directory is removed once the push is over. An `ack` never reaches
//! upstream.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::bus::{Publish, RequestHandler, Service, Transport};
use crate::config::{self, seconds, MirrorConfig, MirrorOptions, MirrorSection, Provider};
use crate::error::{MoveError, Result};
use crate::executor::TransferExecutor;
use crate::heartbeat::Beacon;
use crate::listener::{HeartbeatPolicy, ListenerSet, ListenerSettings, SERVER_HEARTBEAT_TOPIC};
use crate::logging::{debug, log_with_tag};
use crate::message::{Message, MessageType, Metadata, HOSTNAME};
use crate::movers::MoverRegistry;
use crate::server::{AnnounceLog, Deleter, Origin, RequestServer, Staged};
use crate::uri::Destination;
use crate::Role;

const POLL: Duration = Duration::from_millis(200);
const REGISTRY_CAPACITY: usize = 11000;
/// Name prefix of the per-request scratch directories
const SCRATCH_PREFIX: &str = ".push-";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Upstream announcements by uid, oldest evicted first
#[derive(Debug)]
pub struct FileRegistry {
    entries: HashMap<String, Vec<Message>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl FileRegistry {
    pub fn new(capacity: usize) -> Self {
        FileRegistry {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Records `msg` under each of its uids; true when none was known
    pub fn register(&mut self, msg: &Message) -> bool {
        let mut fresh = true;
        for uid in msg.uids() {
            match self.entries.get_mut(&uid) {
                Some(sources) => {
                    fresh = false;
                    sources.push(msg.clone());
                }
                None => {
                    while self.order.len() >= self.capacity {
                        if let Some(old) = self.order.pop_front() {
                            self.entries.remove(&old);
                        }
                    }
                    self.order.push_back(uid.clone());
                    self.entries.insert(uid, vec![msg.clone()]);
                }
            }
        }
        fresh
    }

    pub fn sources(&self, uid: &str) -> Vec<Message> {
        self.entries.get(uid).cloned().unwrap_or_default()
    }
}

/// Removes scratch directories left over by an earlier run
fn sweep_scratch(staging: &Path, tag: &str) {
    let Ok(entries) = fs::read_dir(staging) else {
        return;
    };
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with(SCRATCH_PREFIX) {
            continue;
        }
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => debug(&format!("Swept {}", path.display()), Some(tag)),
            Err(e) => {
                let _ = log_with_tag(&format!("Cannot sweep {}: {}", path.display(), e), Some(tag));
            }
        }
    }
}

/// How long a failed request's scratch directory may still receive a late upstream write
fn late_write_grace(timeout: Duration) -> Duration {
    (timeout * 2).max(Duration::from_secs(1))
}

/// Fetches requested files from the upstream servers that announced them
pub struct UpstreamOrigin {
    tag: String,
    transport: Arc<dyn Transport>,
    registry: Arc<Mutex<FileRegistry>>,
    staging: PathBuf,
    /// Scheme, host and credentials upstream servers push to
    destination: Destination,
    timeout: Duration,
    late_writes: Deleter,
    _tmp: Option<TempDir>,
}

impl UpstreamOrigin {
    fn new(
        tag: &str,
        section: &MirrorSection,
        transport: Arc<dyn Transport>,
        registry: Arc<Mutex<FileRegistry>>,
    ) -> Result<Self> {
        let (staging, tmp) = match &section.working_directory {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                sweep_scratch(Path::new(dir), tag);
                (PathBuf::from(dir), None)
            }
            None => {
                let tmp = tempfile::Builder::new().prefix("trollmover-mirror").tempdir()?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
        };
        let destination = match &section.destination {
            Some(uri) => Destination::parse(uri)?,
            None => Destination::parse(&format!("file://{}", HOSTNAME.as_str()))?,
        };
        let timeout = seconds(section.transfer_req_timeout);
        Ok(UpstreamOrigin {
            tag: tag.to_string(),
            transport,
            registry,
            staging,
            destination,
            timeout,
            late_writes: Deleter::start(late_write_grace(timeout), &format!("{}:scratch", tag)),
            _tmp: tmp,
        })
    }

    /// Push request for the single file `uid` of an upstream announcement
    fn upstream_request(&self, source: &Message, uid: &str, destination: &Destination) -> Message {
        let mut data = source.data.clone();
        data.remove("dataset");
        data.remove("collection");
        if let Some(file) = source
            .files()
            .into_iter()
            .find(|f| f.get("uid").and_then(Value::as_str) == Some(uid))
        {
            data.extend(file);
        }
        data.insert("destination".into(), Value::String(destination.expose().to_string()));
        Message::new(source.subject.as_str(), MessageType::Push, data)
    }
}

impl Origin for UpstreamOrigin {
    fn fetch(&self, _request: &Message, file: &Metadata) -> Result<Staged> {
        let uid = file
            .get("uid")
            .and_then(Value::as_str)
            .ok_or_else(|| MoveError::InvalidMessage("file descriptor without uid".into()))?;
        if Path::new(uid).file_name().and_then(|n| n.to_str()) != Some(uid) {
            return Err(MoveError::InvalidMessage(format!("{} not reachable", uid)));
        }
        let sources = lock(&self.registry).sources(uid);
        if sources.is_empty() {
            return Err(MoveError::InvalidMessage(format!("no source message found for {}", uid)));
        }

        let scratch = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&self.staging)?;
        // An upstream that gave up too late may still write here
        let abandoned = scopeguard::guard(scratch.path().to_path_buf(), |dir| self.late_writes.add(dir));
        let destination = self.destination.with_path(scratch.path().display().to_string());
        let target = scratch.path().join(uid);
        for source in &sources {
            let Some(address) = source.get_str("request_address") else {
                continue;
            };
            let request = self.upstream_request(source, uid, &destination);
            match self.transport.request(address, &request, self.timeout) {
                Ok(reply) if reply.kind.is_announcement() && target.exists() => {
                    debug(&format!("Staged {} from {}", uid, address), Some(&self.tag));
                    scopeguard::ScopeGuard::into_inner(abandoned);
                    return Ok(Staged::in_scratch(target, scratch));
                }
                Ok(reply) => {
                    let reason = reply.get_str("reason").unwrap_or(reply.kind.as_str()).to_string();
                    let _ = log_with_tag(&format!("Upstream {} refused {}: {}", address, uid, reason), Some(&self.tag));
                }
                Err(e) => {
                    let _ = log_with_tag(&format!("Upstream {} failed for {}: {}", address, uid, e), Some(&self.tag));
                }
            }
        }
        Err(MoveError::transfer(self.destination.clean(), format!("no upstream could deliver {}", uid)))
    }

    /// Mirrored files only live in scratch directories; there is nothing to release
    fn release(&self, _file: &Metadata) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Shared by all chains of a mirror
#[derive(Clone)]
struct MirrorContext {
    transport: Arc<dyn Transport>,
    registry: MoverRegistry,
    publisher: Arc<dyn Publish>,
    announced: Arc<Mutex<AnnounceLog>>,
}

/// One running config section
pub struct Chain {
    listeners: ListenerSet,
    service: Option<Box<dyn Service>>,
    request_address: String,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Chain {
    fn start(name: &str, section: MirrorSection, ctx: &MirrorContext) -> Result<Self> {
        let tag = format!("mirror:{}", name);
        let files = Arc::new(Mutex::new(FileRegistry::new(REGISTRY_CAPACITY)));
        let origin = UpstreamOrigin::new(&tag, &section, ctx.transport.clone(), files.clone())?;
        let station = section.station.clone().unwrap_or_else(|| "unknown".to_string());
        let server = Arc::new(RequestServer::new(
            &tag,
            Box::new(origin),
            TransferExecutor::new(ctx.registry.clone(), &tag),
            section.connection.clone(),
            None,
            station,
            ctx.announced.clone(),
        ));
        let handler: RequestHandler = Arc::new(move |msg: &Message| server.handle(msg));
        let service = ctx.transport.serve(section.request_port, handler)?;
        let request_address = match &section.request_address {
            Some(host) => {
                let address = service.address();
                format!("{}:{}", host, address.rsplit(':').next().unwrap_or_default())
            }
            None => service.address(),
        };
        let _ = log_with_tag(&format!("Serving requests on {}", request_address), Some(&tag));

        let policy = HeartbeatPolicy {
            interval: seconds(section.heartbeat_interval),
            missed_beats: section.missed_beats,
        };
        let mut wanted = Vec::new();
        for spec in &section.providers {
            let provider = Provider::parse(spec)?;
            wanted.push(ListenerSettings {
                address: provider.address,
                topics: vec![provider.topic.unwrap_or_else(|| section.topic.clone())],
                heartbeat: Some(policy),
            });
        }
        let (tx, rx) = mpsc::channel();
        let mut listeners = ListenerSet::new(ctx.transport.clone(), tx, &tag);
        listeners.refresh(wanted);

        let stop = Arc::new(AtomicBool::new(false));
        let relay = Relay {
            tag: tag.clone(),
            publisher: ctx.publisher.clone(),
            announced: ctx.announced.clone(),
            files,
            request_address: request_address.clone(),
            delay: section.delay.filter(|d| *d > 0.0).map(seconds),
        };
        let thread_stop = stop.clone();
        let worker = thread::Builder::new().name(tag.clone()).spawn(move || {
            let mut queue: VecDeque<(Instant, Message)> = VecDeque::new();
            while !thread_stop.load(Ordering::SeqCst) {
                match rx.recv_timeout(POLL) {
                    Ok((_, msg)) => relay.on_message(msg, &mut queue),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                while queue.front().map(|(due, _)| *due <= Instant::now()).unwrap_or(false) {
                    if let Some((_, msg)) = queue.pop_front() {
                        relay.publish(&msg);
                    }
                }
            }
        })?;

        Ok(Chain {
            listeners,
            service: Some(service),
            request_address,
            stop,
            worker: Some(worker),
        })
    }

    pub fn request_address(&self) -> &str {
        &self.request_address
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.listeners.stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Some(mut service) = self.service.take() {
            service.stop();
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Republishes upstream announcements under the mirror's request address
struct Relay {
    tag: String,
    publisher: Arc<dyn Publish>,
    announced: Arc<Mutex<AnnounceLog>>,
    files: Arc<Mutex<FileRegistry>>,
    request_address: String,
    delay: Option<Duration>,
}

impl Relay {
    fn on_message(&self, msg: Message, queue: &mut VecDeque<(Instant, Message)>) {
        if !msg.kind.is_announcement() || !msg.data.contains_key("request_address") {
            return;
        }
        if !lock(&self.files).register(&msg) {
            debug(&format!("Already published {:?}", msg.uids()), Some(&self.tag));
            return;
        }
        let mut data = msg.data.clone();
        data.insert("request_address".into(), Value::String(self.request_address.clone()));
        let mirrored = Message::new(msg.subject.as_str(), msg.kind, data);
        match self.delay {
            Some(delay) => queue.push_back((Instant::now() + delay, mirrored)),
            None => self.publish(&mirrored),
        }
    }

    fn publish(&self, msg: &Message) {
        debug(&format!("Sending {}", msg), Some(&self.tag));
        if let Err(e) = self.publisher.send(msg) {
            let _ = log_with_tag(&format!("Cannot publish: {}", e), Some(&self.tag));
            return;
        }
        let mut announced = lock(&self.announced);
        for uid in msg.uids() {
            announced.push(format!("{}/{}", msg.subject, uid));
        }
    }
}

pub struct Mirror {
    ctx: MirrorContext,
    chains: BTreeMap<String, Chain>,
    config: Option<MirrorConfig>,
    beacon: Beacon,
}

impl Mirror {
    pub fn new(transport: Arc<dyn Transport>, registry: MoverRegistry, options: &MirrorOptions) -> Result<Self> {
        let publisher = transport.publisher(options.publish_port)?;
        let _ = log_with_tag(&format!("Publishing on {}", publisher.address()), Some("mirror"));
        let beacon = Beacon::start(
            publisher.clone(),
            SERVER_HEARTBEAT_TOPIC,
            seconds(options.heartbeat_interval),
        );
        Ok(Mirror {
            ctx: MirrorContext {
                transport,
                registry,
                publisher,
                announced: Arc::new(Mutex::new(AnnounceLog::default())),
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

impl Role for Mirror {
    type Options = MirrorOptions;

    fn apply(&mut self, config: MirrorConfig) -> Vec<MoveError> {
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
            }
        }

        let mut failures = Vec::new();
        for name in changes.added.iter().chain(&changes.changed) {
            let started = config
                .section::<MirrorSection>(name)
                .and_then(|section| Chain::start(name, section, &self.ctx));
            match started {
                Ok(chain) => {
                    let _ = log_with_tag(&format!("Started chain {}", name), Some("mirror"));
                    self.chains.insert(name.clone(), chain);
                }
                Err(e) => {
                    let err = MoveError::ConfigReload {
                        section: name.clone(),
                        reason: e.to_string(),
                    };
                    let _ = log_with_tag(&err.to_string(), Some("mirror"));
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
