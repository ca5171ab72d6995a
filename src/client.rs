//! Client role
//!
//! Each chain listens to its providers (and hot-spare peers), requests
//! announced files into its destination and publishes a local message
//! once a transfer is done.
//!
//! Per message identity the chain goes through:
//!
//! 1. delayed: a hot spare waits `processing_delay` for a peer to act
//! 2. ongoing: a worker requests from the first announcing provider and,
//!    on failure, once from an alternate provider; a peer's public `push`
//!    also makes an identity ongoing
//! 3. done: the identity enters the dedup cache, the remaining providers
//!    get an `ack`

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bus::{Publish, Transport};
use crate::config::{self, seconds, ClientConfig, ClientOptions, ClientSection, Provider};
use crate::dedup::DedupCache;
use crate::error::{MoveError, Result};
use crate::heartbeat::{Beacon, HeartbeatState};
use crate::listener::{Delivery, HeartbeatPolicy, ListenerSet, ListenerSettings, CLIENT_HEARTBEAT_TOPIC};
use crate::logging::{debug, log_with_tag};
use crate::message::{announcement_kind, visit_files, Message, MessageType, Metadata, HOSTNAME};
use crate::pattern::compose;
use crate::unpack::Unpacker;
use crate::uri::Destination;
use crate::Role;

const POLL: Duration = Duration::from_millis(200);
/// Providers tried per identity: the announcing one and one alternate
const MAX_ATTEMPTS: usize = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Announcements of one identity, in receipt order
#[derive(Debug)]
struct Pending {
    candidates: Vec<Delivery>,
    since: Instant,
    /// A peer announced it is handling this identity
    held_by_peer: bool,
}

impl Pending {
    fn new(held_by_peer: bool) -> Self {
        Pending {
            candidates: Vec::new(),
            since: Instant::now(),
            held_by_peer,
        }
    }
}

#[derive(Debug)]
struct State {
    delayed: HashMap<String, (Instant, Vec<Delivery>)>,
    ongoing: HashMap<String, Pending>,
    heartbeat: HeartbeatState,
}

/// Everything a chain's workers need; replaced as a whole on reload,
/// except for `state`, which the new core shares with the old one
struct Core {
    tag: String,
    section: ClientSection,
    transport: Arc<dyn Transport>,
    publisher: Arc<dyn Publish>,
    cache: Arc<Mutex<DedupCache>>,
    unpacker: Option<Unpacker>,
    state: Arc<Mutex<State>>,
}

/// Request pair for one push: the real one carries the login, the public
/// one is published for the hot spares
pub fn push_requests(msg: &Message, destination: &str, login: Option<&str>) -> Result<(Message, Message)> {
    let dest = Destination::parse(destination)?;
    let mut host = if dest.host.is_empty() {
        HOSTNAME.clone()
    } else {
        dest.host.clone()
    };
    if let Some(port) = dest.port {
        host.push_str(&format!(":{}", port));
    }

    let mut public = msg.data.clone();
    public.insert(
        "destination".into(),
        Value::String(format!("{}://{}{}", dest.scheme, host, dest.path)),
    );
    let public = Message::new(msg.subject.as_str(), MessageType::Push, public);
    let request = match login {
        Some(login) => {
            let mut data = msg.data.clone();
            data.insert(
                "destination".into(),
                Value::String(format!("{}://{}@{}{}", dest.scheme, login, host, dest.path)),
            );
            Message::new(msg.subject.as_str(), MessageType::Push, data)
        }
        None => public.clone(),
    };
    Ok((request, public))
}

/// Local directory receiving the files of `destination`
pub fn local_dir(destination: &str, ftp_root: &str) -> Result<Option<PathBuf>> {
    let dest = Destination::parse(destination)?;
    if dest.scheme == "s3" {
        return Ok(None);
    }
    Ok(Some(Path::new(ftp_root).join(dest.path.trim_start_matches('/'))))
}

/// Points the file URIs at the destination
///
/// A destination on this host is advertised over ssh, a remote one keeps
/// its scheme and gets the login user (never the password).
pub fn make_uris(data: &mut Metadata, destination: &str, login: Option<&str>) -> Result<()> {
    let dest = Destination::parse(destination)?;
    let (scheme, host) = if dest.scheme != "s3" && dest.is_local() {
        let host = if dest.host.is_empty() {
            HOSTNAME.clone()
        } else {
            dest.host.clone()
        };
        ("ssh".to_string(), host)
    } else {
        let mut host = dest.host.clone();
        if let Some(port) = dest.port {
            host.push_str(&format!(":{}", port));
        }
        if let Some(user) = login.and_then(|l| l.split(':').next()) {
            host = format!("{}@{}", user, host);
        }
        (dest.scheme.clone(), host)
    };

    visit_files(data, &mut |file: &mut Metadata| {
        if let Some(uid) = file.get("uid").and_then(Value::as_str) {
            let path = Path::new(&dest.path).join(uid);
            let uri = format!("{}://{}{}", scheme, host, path.display());
            file.insert("uri".into(), Value::String(uri));
        }
    });
    Ok(())
}

/// Rewrites metadata values, each replacement given as `old:new|old2:new2`
///
/// A replacement without `:` pairs is used as the new value as a whole.
pub fn replace_mda(data: &mut Metadata, replacements: &BTreeMap<String, String>) {
    for (key, spec) in replacements {
        let Some(current) = data.get(key) else {
            continue;
        };
        let pairs: Option<HashMap<&str, &str>> = spec.split('|').map(|item| item.split_once(':')).collect();
        let replacement = match pairs {
            Some(pairs) => match current.as_str().and_then(|c| pairs.get(c)) {
                Some(new) => new.to_string(),
                None => continue,
            },
            None => spec.clone(),
        };
        data.insert(key.clone(), Value::String(replacement));
    }
}

impl Core {
    fn new(
        name: &str,
        section: ClientSection,
        transport: Arc<dyn Transport>,
        publisher: Arc<dyn Publish>,
        cache: Arc<Mutex<DedupCache>>,
    ) -> Result<Self> {
        let unpacker = section
            .compression
            .as_deref()
            .map(|c| Unpacker::new(c, section.working_directory.as_deref(), section.xritdecompressor.as_deref()))
            .transpose()?;
        let mut heartbeat = HeartbeatState::new(seconds(section.heartbeat_interval), section.missed_beats);
        for provider in &section.providers {
            heartbeat.track(&Provider::parse(provider)?.address);
        }
        Ok(Core {
            tag: format!("client:{}", name),
            section,
            transport,
            publisher,
            cache,
            unpacker,
            state: Arc::new(Mutex::new(State {
                delayed: HashMap::new(),
                ongoing: HashMap::new(),
                heartbeat,
            })),
        })
    }

    /// Takes over the delayed and in-flight identities of `old`, whose
    /// request workers keep reporting into the same state. The heartbeat
    /// settings are the new ones.
    fn inherit(&mut self, old: &Core) {
        {
            let mut shared = lock(&old.state);
            let mut own = lock(&self.state);
            own.heartbeat.carry_over(&shared.heartbeat);
            std::mem::swap(&mut shared.heartbeat, &mut own.heartbeat);
        }
        self.state = old.state.clone();
    }

    fn listener_settings(&self) -> Result<Vec<ListenerSettings>> {
        let policy = self.section.heartbeat.then(|| HeartbeatPolicy {
            interval: seconds(self.section.heartbeat_interval),
            missed_beats: self.section.missed_beats,
        });
        let mut wanted = Vec::new();
        for spec in &self.section.providers {
            let provider = Provider::parse(spec)?;
            wanted.push(ListenerSettings {
                address: provider.address,
                topics: vec![provider.topic.unwrap_or_else(|| self.section.topic.clone())],
                heartbeat: policy,
            });
        }
        for peer in &self.section.peers {
            wanted.push(ListenerSettings {
                address: peer.clone(),
                topics: vec![self.section.topic.clone()],
                heartbeat: None,
            });
        }
        Ok(wanted)
    }

    fn on_delivery(self: &Arc<Self>, provider: String, msg: Message) {
        let fingerprint = msg.fingerprint();
        let mut state = lock(&self.state);
        // peers share the channel but are not providers
        state.heartbeat.beat(&provider);

        match msg.kind {
            MessageType::Beat => {}
            MessageType::Push => {
                debug("A peer published 'push'", Some(&self.tag));
                let delayed = state.delayed.remove(&fingerprint).map(|(_, c)| c).unwrap_or_default();
                let pending = state
                    .ongoing
                    .entry(fingerprint)
                    .or_insert_with(|| Pending::new(true));
                pending.candidates.extend(delayed);
            }
            MessageType::Ack => {
                debug("A peer finished a transfer", Some(&self.tag));
                self.peer_done(&mut state, &fingerprint);
            }
            kind if kind.is_announcement() && !msg.data.contains_key("request_address") => {
                debug("Ignoring a local message from a peer", Some(&self.tag));
                self.peer_done(&mut state, &fingerprint);
            }
            kind if kind.is_announcement() => {
                if lock(&self.cache).touch(&fingerprint) {
                    debug(&MoveError::DuplicateMessage(fingerprint).to_string(), Some(&self.tag));
                    return;
                }
                if let Some(pending) = state.ongoing.get_mut(&fingerprint) {
                    pending.candidates.push((provider, msg));
                    return;
                }
                match self.section.processing_delay.filter(|d| *d > 0.0) {
                    Some(delay) => {
                        let entry = state
                            .delayed
                            .entry(fingerprint.clone())
                            .or_insert_with(|| (Instant::now() + seconds(delay), Vec::new()));
                        entry.1.push((provider, msg));
                        debug(&format!("Delaying {}", fingerprint), Some(&self.tag));
                    }
                    None => {
                        let mut pending = Pending::new(false);
                        pending.candidates.push((provider, msg));
                        state.ongoing.insert(fingerprint.clone(), pending);
                        drop(state);
                        self.spawn_request(fingerprint);
                    }
                }
            }
            _ => {}
        }
    }

    fn peer_done(&self, state: &mut State, fingerprint: &str) {
        lock(&self.cache).insert(fingerprint);
        state.delayed.remove(fingerprint);
        if state.ongoing.get(fingerprint).map(|p| p.held_by_peer).unwrap_or(false) {
            state.ongoing.remove(fingerprint);
        }
    }

    /// Starts the delayed identities that are due and takes over the ones
    /// a peer announced but never finished
    fn on_tick(self: &Arc<Self>) {
        let now = Instant::now();
        let takeover = seconds(self.section.transfer_req_timeout * 2.0 + self.section.processing_delay.unwrap_or(0.0));
        let mut start = Vec::new();
        {
            let mut state = lock(&self.state);
            let due: Vec<String> = state
                .delayed
                .iter()
                .filter(|(_, (at, _))| *at <= now)
                .map(|(fp, _)| fp.clone())
                .collect();
            for fingerprint in due {
                if let Some((_, candidates)) = state.delayed.remove(&fingerprint) {
                    let mut pending = Pending::new(false);
                    pending.candidates = candidates;
                    state.ongoing.insert(fingerprint.clone(), pending);
                    start.push(fingerprint);
                }
            }
            for (fingerprint, pending) in state.ongoing.iter_mut() {
                if pending.held_by_peer && now.saturating_duration_since(pending.since) >= takeover {
                    let _ = log_with_tag(
                        &format!("Peer did not finish {}, taking over", fingerprint),
                        Some(&self.tag),
                    );
                    pending.held_by_peer = false;
                    start.push(fingerprint.clone());
                }
            }
            let down = if self.section.heartbeat {
                state.heartbeat.check()
            } else {
                Vec::new()
            };
            for provider in down {
                let _ = log_with_tag(
                    &format!("Provider {} is unreachable, excluding it from requests", provider),
                    Some(&self.tag),
                );
            }
        }
        for fingerprint in start {
            self.spawn_request(fingerprint);
        }
    }

    fn spawn_request(self: &Arc<Self>, fingerprint: String) {
        let core = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}:request", self.tag))
            .spawn(move || core.request_files(&fingerprint));
        if let Err(e) = spawned {
            let _ = log_with_tag(&format!("Cannot start request worker: {}", e), Some(&self.tag));
        }
    }

    /// Next announcement from a provider that is still alive
    fn next_candidate(&self, fingerprint: &str) -> Option<Delivery> {
        let mut state = lock(&self.state);
        let State { ongoing, heartbeat, .. } = &mut *state;
        let pending = ongoing.get_mut(fingerprint)?;
        while !pending.candidates.is_empty() {
            let (provider, msg) = pending.candidates.remove(0);
            if !self.section.heartbeat || heartbeat.is_alive(&provider) {
                return Some((provider, msg));
            }
            debug(&format!("Skipping unreachable provider {}", provider), Some(&self.tag));
        }
        None
    }

    fn request_files(&self, fingerprint: &str) {
        let mut done = false;
        let mut attempts = 0;
        while attempts < MAX_ATTEMPTS {
            let Some((provider, msg)) = self.next_candidate(fingerprint) else {
                break;
            };
            attempts += 1;
            match self.request(&msg) {
                Ok(()) => {
                    done = true;
                    break;
                }
                Err(e) => {
                    let _ = log_with_tag(
                        &format!("Request to {} failed: {}", provider, e),
                        Some(&self.tag),
                    );
                }
            }
        }

        let remaining = lock(&self.state)
            .ongoing
            .remove(fingerprint)
            .map(|p| p.candidates)
            .unwrap_or_default();
        if done {
            for (provider, msg) in remaining {
                self.send_ack(&provider, &msg);
            }
        } else {
            let _ = log_with_tag(
                &format!("Could not get a working source for {}, dropping it", fingerprint),
                Some(&self.tag),
            );
        }
    }

    fn send_ack(&self, provider: &str, msg: &Message) {
        let Some(address) = msg.get_str("request_address") else {
            return;
        };
        let ack = Message::new(msg.subject.as_str(), MessageType::Ack, msg.data.clone());
        match self.transport.request(address, &ack, seconds(self.section.req_timeout)) {
            Ok(reply) if reply.kind == MessageType::Ack => {}
            Ok(reply) => {
                let _ = log_with_tag(
                    &format!("Unexpected ack reply from {}: {}", provider, reply),
                    Some(&self.tag),
                );
            }
            Err(e) => {
                let _ = log_with_tag(&format!("Ack to {} failed: {}", provider, e), Some(&self.tag));
            }
        }
    }

    fn request(&self, msg: &Message) -> Result<()> {
        let address = msg
            .get_str("request_address")
            .ok_or_else(|| MoveError::InvalidMessage("announcement without request_address".into()))?;
        let destination = compose(&self.section.destination, &msg.data)?;
        let (request, public) = push_requests(msg, &destination, self.section.login.as_deref())?;
        let local = local_dir(&destination, &self.section.ftp_root)?;
        if self.section.create_target_directory {
            if let Some(dir) = &local {
                fs::create_dir_all(dir)?;
            }
        }

        let _ = log_with_tag(&format!("Requesting: {}", public), Some(&self.tag));
        if let Err(e) = self.publisher.send(&public) {
            debug(&format!("Cannot publish push: {}", e), Some(&self.tag));
        }
        let reply = self
            .transport
            .request(address, &request, seconds(self.section.transfer_req_timeout))?;
        if !reply.kind.is_announcement() {
            let reason = reply.get_str("reason").unwrap_or(reply.kind.as_str()).to_string();
            return Err(MoveError::transfer(address, reason));
        }
        debug("Server done sending file", Some(&self.tag));

        lock(&self.cache).insert(msg.fingerprint());
        let ack = Message::new(msg.subject.as_str(), MessageType::Ack, msg.data.clone());
        if let Err(e) = self.publisher.send(&ack) {
            debug(&format!("Cannot publish ack: {}", e), Some(&self.tag));
        }

        match self.local_message(&reply, &destination, local.as_deref()) {
            Ok(local_msg) => {
                debug(&format!("Publishing {}", local_msg), Some(&self.tag));
                self.publisher.send(&local_msg)?;
            }
            Err(e) => {
                let _ = log_with_tag(&format!("Couldn't unpack {}: {}", reply, e), Some(&self.tag));
            }
        }
        Ok(())
    }

    /// Message describing the received files at their new location
    fn local_message(&self, reply: &Message, destination: &str, local: Option<&Path>) -> Result<Message> {
        let mut msg = reply.clone();
        if let (Some(unpacker), Some(dir)) = (&self.unpacker, local) {
            let mut failure = None;
            msg.for_each_file(|file| {
                let Some(uid) = file.get("uid").and_then(Value::as_str).map(str::to_string) else {
                    return;
                };
                if !unpacker.compression.is_compressed(&uid) || failure.is_some() {
                    return;
                }
                let packed = dir.join(&uid);
                let produced = match unpacker.unpack(&packed) {
                    Ok(produced) => produced,
                    Err(e) => {
                        failure = Some(e);
                        return;
                    }
                };
                if self.section.delete {
                    let _ = fs::remove_file(&packed);
                }
                file.remove("uid");
                file.remove("uri");
                let describe = |p: &PathBuf| {
                    let mut d = Metadata::new();
                    let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                    d.insert("uid".into(), Value::String(name));
                    d.insert("uri".into(), Value::String(p.display().to_string()));
                    d
                };
                match produced.as_slice() {
                    [single] => file.extend(describe(single)),
                    many => {
                        let dataset = many.iter().map(|p| Value::Object(describe(p))).collect();
                        file.insert("dataset".into(), Value::Array(dataset));
                    }
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
        }

        let mut data = std::mem::take(&mut msg.data);
        make_uris(&mut data, destination, self.section.login.as_deref())?;
        if let Some(origin) = data.remove("request_address") {
            data.insert("origin".into(), origin);
        }
        replace_mda(&mut data, &self.section.replacements);
        data.remove("destination");
        Ok(Message::new(msg.subject.as_str(), announcement_kind(&data), data))
    }
}

/// One running config section
pub struct Chain {
    core: Arc<Core>,
    listeners: ListenerSet,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Receiver<Delivery>>>,
}

fn run(core: Arc<Core>, rx: Receiver<Delivery>, stop: Arc<AtomicBool>) -> Receiver<Delivery> {
    let mut last_tick = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL) {
            Ok((provider, msg)) => core.on_delivery(provider, msg),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if last_tick.elapsed() >= POLL {
            core.on_tick();
            last_tick = Instant::now();
        }
    }
    rx
}

impl Chain {
    fn start(core: Core, transport: Arc<dyn Transport>) -> Result<Self> {
        let core = Arc::new(core);
        let wanted = core.listener_settings()?;
        let (tx, rx) = mpsc::channel();
        let mut listeners = ListenerSet::new(transport, tx, &core.tag);
        listeners.refresh(wanted);
        let mut chain = Chain {
            core,
            listeners,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        };
        chain.spawn(rx)?;
        Ok(chain)
    }

    fn spawn(&mut self, rx: Receiver<Delivery>) -> Result<()> {
        let core = self.core.clone();
        let stop = Arc::new(AtomicBool::new(false));
        self.stop = stop.clone();
        self.worker = Some(
            thread::Builder::new()
                .name(core.tag.clone())
                .spawn(move || run(core, rx, stop))?,
        );
        Ok(())
    }

    /// Swaps in a new section; listeners with unchanged settings keep
    /// running, transfers in flight finish with the old settings and
    /// delayed identities stay scheduled
    fn update(&mut self, mut core: Core) -> Result<()> {
        let rx = self.halt();
        core.inherit(&self.core);
        self.core = Arc::new(core);
        self.listeners.refresh(self.core.listener_settings()?);
        match rx {
            Some(rx) => self.spawn(rx),
            None => Err(MoveError::Config("chain worker is gone".into())),
        }
    }

    fn halt(&mut self) -> Option<Receiver<Delivery>> {
        self.stop.store(true, Ordering::SeqCst);
        self.worker.take().and_then(|w| w.join().ok())
    }

    pub fn stop(&mut self) {
        self.halt();
        self.listeners.stop();
    }

    pub fn providers(&self) -> Vec<String> {
        self.listeners.addresses()
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct Client {
    transport: Arc<dyn Transport>,
    publisher: Arc<dyn Publish>,
    cache: Arc<Mutex<DedupCache>>,
    chains: BTreeMap<String, Chain>,
    config: Option<ClientConfig>,
    beacon: Beacon,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, options: &ClientOptions) -> Result<Self> {
        let publisher = transport.publisher(options.publish_port)?;
        let _ = log_with_tag(&format!("Publishing on {}", publisher.address()), Some("client"));
        let beacon = Beacon::start(
            publisher.clone(),
            CLIENT_HEARTBEAT_TOPIC,
            seconds(options.heartbeat_interval),
        );
        Ok(Client {
            transport,
            publisher,
            cache: Arc::new(Mutex::new(DedupCache::default())),
            chains: BTreeMap::new(),
            config: None,
            beacon,
        })
    }

    pub fn publish_address(&self) -> String {
        self.publisher.address()
    }

    pub fn chain(&self, name: &str) -> Option<&Chain> {
        self.chains.get(name)
    }

    fn core(&self, name: &str, config: &ClientConfig) -> Result<Core> {
        let section: ClientSection = config.section(name)?;
        Core::new(
            name,
            section,
            self.transport.clone(),
            self.publisher.clone(),
            self.cache.clone(),
        )
    }
}

impl Role for Client {
    type Options = ClientOptions;

    fn apply(&mut self, config: ClientConfig) -> Vec<MoveError> {
        let changes = match &self.config {
            Some(old) => config::diff(old, &config),
            None => config::ConfigDiff {
                added: config.names().into_iter().map(String::from).collect(),
                ..Default::default()
            },
        };

        for name in &changes.removed {
            if let Some(mut chain) = self.chains.remove(name) {
                chain.stop();
                let _ = log_with_tag(&format!("Removed chain {}", name), Some("client"));
            }
        }

        let mut failures = Vec::new();
        for name in changes.added.iter().chain(&changes.changed) {
            let result = self.core(name, &config).and_then(|core| match self.chains.get_mut(name) {
                Some(chain) => chain.update(core),
                None => {
                    let chain = Chain::start(core, self.transport.clone())?;
                    self.chains.insert(name.clone(), chain);
                    Ok(())
                }
            });
            match result {
                Ok(()) => {
                    let _ = log_with_tag(&format!("Chain {} is running", name), Some("client"));
                }
                Err(e) => {
                    if let Some(mut chain) = self.chains.remove(name) {
                        chain.stop();
                    }
                    let err = MoveError::ConfigReload {
                        section: name.clone(),
                        reason: e.to_string(),
                    };
                    let _ = log_with_tag(&err.to_string(), Some("client"));
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
    use crate::bus::{MemoryBus, MessageSource, RequestHandler, Service};
    use crate::config::ServerConfig;
    use crate::listener::SERVER_HEARTBEAT_TOPIC;
    use crate::movers::MoverRegistry;
    use crate::server::Server;
    use serde_json::json;
    use tempfile::tempdir;

    /// Publisher plus request service that records every request
    struct FakeProvider {
        publisher: Arc<dyn Publish>,
        service: Box<dyn Service>,
        requests: Arc<Mutex<Vec<Message>>>,
    }

    impl FakeProvider {
        fn start(bus: &MemoryBus, fail: bool) -> Self {
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = requests.clone();
            let handler: RequestHandler = Arc::new(move |msg: &Message| {
                seen.lock().unwrap().push(msg.clone());
                match msg.kind {
                    _ if fail => Message::error_reply(&msg.subject, "broken provider"),
                    MessageType::Push => msg.reply(announcement_kind(&msg.data), msg.data.clone()),
                    kind => msg.reply(kind, msg.data.clone()),
                }
            });
            FakeProvider {
                publisher: bus.publisher(0).unwrap(),
                service: bus.serve(0, handler).unwrap(),
                requests,
            }
        }

        fn announce(&self, uid: &str) {
            let mut data = Metadata::new();
            data.insert("uid".into(), json!(uid));
            data.insert("uri".into(), json!(format!("/data/{}", uid)));
            data.insert("request_address".into(), json!(self.service.address()));
            self.publisher
                .send(&Message::new("/test/topic", MessageType::File, data))
                .unwrap();
        }

        fn pushes(&self) -> Vec<Message> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.kind == MessageType::Push)
                .cloned()
                .collect()
        }
    }

    fn client_config(providers: &[&str], destination: &Path, extra: &str) -> ClientConfig {
        let providers: Vec<String> = providers.iter().map(|p| format!("\"{}\"", p)).collect();
        ClientConfig::parse(&format!(
            r#"{{"publish_port": 0,
                 "chain": {{"providers": [{}], "destination": "file://{}", "topic": "/test",
                            "heartbeat": false {}}}}}"#,
            providers.join(", "),
            destination.display(),
            extra
        ))
        .unwrap()
    }

    fn start_client(bus: &MemoryBus, config: ClientConfig) -> Client {
        let mut client = Client::new(Arc::new(bus.clone()), &config.options).unwrap();
        assert!(client.apply(config).is_empty());
        // let the listeners subscribe
        thread::sleep(Duration::from_millis(300));
        client
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        cond()
    }

    #[test]
    fn test_duplicate_announcement_is_not_requested() {
        let bus = MemoryBus::new();
        let out = tempdir().unwrap();
        let provider = FakeProvider::start(&bus, false);
        let mut client = start_client(&bus, client_config(&[&provider.publisher.address()], out.path(), ""));

        provider.announce("a.txt");
        assert!(wait_for(|| provider.pushes().len() == 1));
        provider.announce("a.txt");
        thread::sleep(Duration::from_millis(500));
        assert_eq!(provider.pushes().len(), 1);

        provider.announce("b.txt");
        assert!(wait_for(|| provider.pushes().len() == 2));
        client.stop();
    }

    #[test]
    fn test_hot_spare_defers_to_primary() {
        let bus = MemoryBus::new();
        let provider = FakeProvider::start(&bus, false);
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let address = provider.publisher.address();

        let mut primary = start_client(&bus, client_config(&[&address], dir_a.path(), ""));
        let spare_extra = format!(
            r#", "processing_delay": 1.0, "peers": ["{}"]"#,
            primary.publish_address()
        );
        let mut spare = start_client(&bus, client_config(&[&address], dir_b.path(), &spare_extra));

        provider.announce("hrpt_noaa19_20240101_1200_12345.l1b");
        thread::sleep(Duration::from_millis(1800));

        let destinations: Vec<String> = provider
            .pushes()
            .iter()
            .filter_map(|m| m.get_str("destination").map(str::to_string))
            .collect();
        assert_eq!(destinations.len(), 1);
        assert!(destinations[0].ends_with(&dir_a.path().display().to_string()));
        primary.stop();
        spare.stop();
    }

    #[test]
    fn test_hot_spare_requests_when_primary_silent() {
        let bus = MemoryBus::new();
        let provider = FakeProvider::start(&bus, false);
        let out = tempdir().unwrap();
        let mut spare = start_client(
            &bus,
            client_config(&[&provider.publisher.address()], out.path(), r#", "processing_delay": 0.3"#),
        );

        provider.announce("x.txt");
        thread::sleep(Duration::from_millis(100));
        assert!(provider.pushes().is_empty());
        assert!(wait_for(|| provider.pushes().len() == 1));
        spare.stop();
    }

    #[test]
    fn test_retried_once_on_alternate_provider() {
        let bus = MemoryBus::new();
        let out = tempdir().unwrap();
        let broken1 = FakeProvider::start(&bus, true);
        let broken2 = FakeProvider::start(&bus, true);
        let broken3 = FakeProvider::start(&bus, true);
        let addresses = [
            broken1.publisher.address(),
            broken2.publisher.address(),
            broken3.publisher.address(),
        ];
        let refs: Vec<&str> = addresses.iter().map(String::as_str).collect();
        let mut client = start_client(&bus, client_config(&refs, out.path(), r#", "processing_delay": 0.5"#));

        broken1.announce("y.txt");
        broken2.announce("y.txt");
        broken3.announce("y.txt");
        thread::sleep(Duration::from_millis(1500));

        assert_eq!(broken1.pushes().len(), 1);
        assert_eq!(broken2.pushes().len(), 1);
        assert!(broken3.pushes().is_empty());
        client.stop();
    }

    #[test]
    fn test_alternate_provider_succeeds_and_remaining_get_ack() {
        let bus = MemoryBus::new();
        let out = tempdir().unwrap();
        let broken = FakeProvider::start(&bus, true);
        let good = FakeProvider::start(&bus, false);
        let spare = FakeProvider::start(&bus, false);
        let addresses = [broken.publisher.address(), good.publisher.address(), spare.publisher.address()];
        let refs: Vec<&str> = addresses.iter().map(String::as_str).collect();
        let mut client = start_client(&bus, client_config(&refs, out.path(), r#", "processing_delay": 0.5"#));

        broken.announce("z.txt");
        good.announce("z.txt");
        spare.announce("z.txt");
        assert!(wait_for(|| !spare.requests.lock().unwrap().is_empty()));
        assert_eq!(good.pushes().len(), 1);
        assert!(spare.pushes().is_empty());
        assert_eq!(spare.requests.lock().unwrap()[0].kind, MessageType::Ack);
        client.stop();
    }

    #[test]
    fn test_delayed_request_survives_reload() {
        let bus = MemoryBus::new();
        let provider = FakeProvider::start(&bus, false);
        let out = tempdir().unwrap();
        let address = provider.publisher.address();
        let mut client = start_client(
            &bus,
            client_config(&[&address], out.path(), r#", "processing_delay": 1.0"#),
        );

        provider.announce("reloaded.txt");
        thread::sleep(Duration::from_millis(300));
        assert!(provider.pushes().is_empty());
        let changed = client_config(&[&address], out.path(), r#", "processing_delay": 1.0, "req_timeout": 2.0"#);
        assert!(client.apply(changed).is_empty());

        assert!(wait_for(|| provider.pushes().len() == 1));
        assert_eq!(provider.pushes()[0].get_str("uid"), Some("reloaded.txt"));
        client.stop();
    }

    #[test]
    fn test_provider_missing_beats_is_skipped() {
        let bus = MemoryBus::new();
        let out = tempdir().unwrap();
        let silent = FakeProvider::start(&bus, false);
        let beating = FakeProvider::start(&bus, false);
        let mut beacon = Beacon::start(
            beating.publisher.clone(),
            SERVER_HEARTBEAT_TOPIC,
            Duration::from_millis(100),
        );
        let config = ClientConfig::parse(&format!(
            r#"{{"publish_port": 0,
                 "chain": {{"providers": ["{}", "{}"], "destination": "file://{}", "topic": "/test",
                            "heartbeat": true, "heartbeat_interval": 0.2, "missed_beats": 1,
                            "processing_delay": 1.0}}}}"#,
            silent.publisher.address(),
            beating.publisher.address(),
            out.path().display()
        ))
        .unwrap();
        let mut client = start_client(&bus, config);

        // the silent provider announces first, but has missed its beats
        // by the time the delay is over
        silent.announce("hb.txt");
        thread::sleep(Duration::from_millis(50));
        silent.announce("hb.txt");
        beating.announce("hb.txt");

        assert!(wait_for(|| beating.pushes().len() == 1));
        assert!(silent.pushes().is_empty());
        client.stop();
        beacon.stop();
    }

    #[test]
    fn test_peer_traffic_is_not_tracked_as_provider() {
        let bus = MemoryBus::new();
        let out = tempdir().unwrap();
        let provider = FakeProvider::start(&bus, false);
        let peer = bus.publisher(0).unwrap();
        let extra = format!(r#", "peers": ["{}"]"#, peer.address());
        let mut client = start_client(&bus, client_config(&[&provider.publisher.address()], out.path(), &extra));

        let mut data = Metadata::new();
        data.insert("uid".into(), json!("peer.txt"));
        peer.send(&Message::new("/test/topic", MessageType::Push, data)).unwrap();
        {
            let state = &client.chain("chain").unwrap().core.state;
            assert!(wait_for(|| lock(state).ongoing.len() == 1));
            let state = lock(state);
            assert!(!state.heartbeat.is_tracked(&peer.address()));
            assert!(state.heartbeat.is_tracked(&provider.publisher.address()));
        }
        client.stop();
    }

    #[test]
    fn test_round_trip_with_server() {
        for delete in [false, true] {
            let bus = MemoryBus::new();
            let src = tempdir().unwrap();
            let out = tempdir().unwrap();
            let server_config = ServerConfig::parse(&format!(
                r#"{{"publish_port": 0,
                     "files": {{"origin": "{}/{{name}}.txt", "topic": "/test/txt", "request_port": 0,
                                "delete": {}, "delete_delay": 0}}}}"#,
                src.path().display(),
                delete
            ))
            .unwrap();
            let mut server =
                Server::new(Arc::new(bus.clone()), MoverRegistry::default(), &server_config.options).unwrap();
            assert!(server.apply(server_config).is_empty());

            let mut client = start_client(&bus, client_config(&[&server.publish_address()], out.path(), ""));
            let mut local: Box<dyn MessageSource> =
                bus.subscribe(&client.publish_address(), &["/test".to_string()]).unwrap();

            let source = src.path().join("test1.txt");
            fs::write(&source, b"round trip payload").unwrap();

            let received = out.path().join("test1.txt");
            assert!(wait_for(|| received.exists()));
            assert_eq!(fs::read(&received).unwrap(), b"round trip payload");

            let completion = loop {
                let msg = local.recv_timeout(Duration::from_secs(5)).unwrap().expect("no local message");
                if msg.kind == MessageType::File {
                    break msg;
                }
            };
            assert!(completion.get_str("uri").unwrap().ends_with("/test1.txt"));
            assert!(completion.data.contains_key("origin"));
            assert!(!completion.data.contains_key("destination"));

            if delete {
                assert!(wait_for(|| !source.exists()));
            } else {
                thread::sleep(Duration::from_millis(300));
                assert!(source.exists());
            }
            client.stop();
            server.stop();
        }
    }

    #[test]
    fn test_push_requests_carry_login_only_privately() {
        let mut data = Metadata::new();
        data.insert("uid".into(), json!("f.txt"));
        let msg = Message::new("/t", MessageType::File, data);
        let (request, public) = push_requests(&msg, "ftp://ftp.example.com:2121/in", Some("user:pw")).unwrap();
        assert_eq!(request.get_str("destination"), Some("ftp://user:pw@ftp.example.com:2121/in"));
        assert_eq!(public.get_str("destination"), Some("ftp://ftp.example.com:2121/in"));
        assert_eq!(public.kind, MessageType::Push);
    }

    #[test]
    fn test_make_uris_and_replacements() {
        let mut data = json!({
            "platform_name": "NOAA-19",
            "dataset": [{"uid": "a.l1b", "uri": "/src/a.l1b"}, {"uid": "b.l1b", "uri": "/src/b.l1b"}]
        })
        .as_object()
        .unwrap()
        .clone();
        make_uris(&mut data, "ftp://ftp.example.com/out", Some("user:pw")).unwrap();
        assert_eq!(data["dataset"][0]["uri"], "ftp://user@ftp.example.com/out/a.l1b");
        assert_eq!(data["dataset"][1]["uri"], "ftp://user@ftp.example.com/out/b.l1b");

        let mut replacements = BTreeMap::new();
        replacements.insert("platform_name".to_string(), "NOAA-19:noaa19|NOAA-18:noaa18".to_string());
        replace_mda(&mut data, &replacements);
        assert_eq!(data["platform_name"], "noaa19");

        replacements.insert("platform_name".to_string(), "fixed".to_string());
        replace_mda(&mut data, &replacements);
        assert_eq!(data["platform_name"], "fixed");
    }

    #[test]
    fn test_local_dir_under_ftp_root() {
        assert_eq!(
            local_dir("ftp://host/incoming/x", "/srv/ftp").unwrap(),
            Some(PathBuf::from("/srv/ftp/incoming/x"))
        );
        assert_eq!(local_dir("s3://bucket/x", "/").unwrap(), None);
    }
}
