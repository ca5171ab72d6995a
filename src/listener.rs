//! Subscription workers
//!
//! One thread per provider address. Messages are forwarded into a shared
//! channel as `(provider, message)`, so messages of one provider keep their
//! receipt order. A provider that stays silent for `missed_beats`
//! heartbeat intervals is resubscribed; a worker thread that dies is
//! restarted up to `MAX_RESTARTS` times and then switched off.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bus::Transport;
use crate::logging::{debug, log_with_tag};
use crate::message::Message;

pub const MAX_RESTARTS: u32 = 3;
pub const SERVER_HEARTBEAT_TOPIC: &str = "/heartbeat/move_it_server";
pub const CLIENT_HEARTBEAT_TOPIC: &str = "/heartbeat/move_it";

const POLL: Duration = Duration::from_millis(200);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// What a listener forwards
pub type Delivery = (String, Message);

/// Liveness expectations for a provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub missed_beats: u32,
}

impl HeartbeatPolicy {
    fn silence_limit(&self) -> Duration {
        self.interval * self.missed_beats.max(1)
    }
}

/// Settings of one listener; two listeners with equal settings are
/// interchangeable, which is what config refresh relies on
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerSettings {
    pub address: String,
    pub topics: Vec<String>,
    pub heartbeat: Option<HeartbeatPolicy>,
}

/// A running subscription worker
pub struct Listener {
    settings: ListenerSettings,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn start(
        transport: Arc<dyn Transport>,
        settings: ListenerSettings,
        out: Sender<Delivery>,
        tag: &str,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_settings = settings.clone();
        let tag = format!("{}:{}", tag, settings.address);
        let spawned = thread::Builder::new()
            .name(tag.clone())
            .spawn(move || supervise(transport, thread_settings, out, thread_stop, tag));

        let handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                let _ = log_with_tag(&format!("Cannot start listener: {}", e), None);
                None
            }
        };
        Listener {
            settings,
            stop,
            handle,
        }
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn supervise(
    transport: Arc<dyn Transport>,
    settings: ListenerSettings,
    out: Sender<Delivery>,
    stop: Arc<AtomicBool>,
    tag: String,
) {
    let mut deaths = 0;
    while !stop.load(Ordering::SeqCst) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            receive(transport.as_ref(), &settings, &out, &stop, &tag)
        }));
        match result {
            Ok(()) => return,
            Err(_) => {
                deaths += 1;
                let _ = log_with_tag(
                    &format!("Listener died {} time(s)", deaths),
                    Some(&tag),
                );
                if deaths >= MAX_RESTARTS {
                    let _ = log_with_tag("Listener switched off", Some(&tag));
                    return;
                }
                thread::sleep(Duration::from_millis(500));
            }
        }
    }
}

/// Returns when stopped or when the consumer went away
fn receive(
    transport: &dyn Transport,
    settings: &ListenerSettings,
    out: &Sender<Delivery>,
    stop: &AtomicBool,
    tag: &str,
) {
    let mut topics = settings.topics.clone();
    if settings.heartbeat.is_some() && !topics.is_empty() {
        topics.push("/heartbeat".to_string());
    }

    while !stop.load(Ordering::SeqCst) {
        let mut source = match transport.subscribe(&settings.address, &topics) {
            Ok(source) => source,
            Err(e) => {
                debug(&format!("Subscription failed: {}", e), Some(tag));
                thread::sleep(RECONNECT_DELAY);
                continue;
            }
        };
        let _ = log_with_tag(
            &format!("Subscribed to {} with topics {:?}", settings.address, topics),
            Some(tag),
        );
        let mut last_seen = Instant::now();

        while !stop.load(Ordering::SeqCst) {
            match source.recv_timeout(POLL) {
                Ok(Some(msg)) => {
                    last_seen = Instant::now();
                    if out.send((settings.address.clone(), msg)).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    if let Some(policy) = settings.heartbeat {
                        if last_seen.elapsed() > policy.silence_limit() {
                            let _ = log_with_tag(
                                "Missing a heartbeat, restarting the subscriber",
                                Some(tag),
                            );
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = log_with_tag(&format!("Subscription broken: {}", e), Some(tag));
                    thread::sleep(RECONNECT_DELAY);
                    break;
                }
            }
        }
    }
}

/// The listeners of one chain, keyed by provider address
pub struct ListenerSet {
    transport: Arc<dyn Transport>,
    out: Sender<Delivery>,
    tag: String,
    listeners: HashMap<String, Listener>,
}

impl ListenerSet {
    pub fn new(transport: Arc<dyn Transport>, out: Sender<Delivery>, tag: &str) -> Self {
        ListenerSet {
            transport,
            out,
            tag: tag.to_string(),
            listeners: HashMap::new(),
        }
    }

    /// Makes the running listeners match `wanted`; listeners whose
    /// settings did not change keep running
    pub fn refresh(&mut self, wanted: Vec<ListenerSettings>) {
        let keep: Vec<String> = wanted
            .iter()
            .filter(|s| {
                self.listeners
                    .get(&s.address)
                    .map(|l| l.settings() == *s && l.is_alive())
                    .unwrap_or(false)
            })
            .map(|s| s.address.clone())
            .collect();

        let stale: Vec<String> = self
            .listeners
            .keys()
            .filter(|a| !keep.contains(a))
            .cloned()
            .collect();
        for address in stale {
            if let Some(mut listener) = self.listeners.remove(&address) {
                debug(&format!("Stopping listener to {}", address), Some(&self.tag));
                listener.stop();
            }
        }

        for settings in wanted {
            if keep.contains(&settings.address) {
                debug(
                    &format!("Not restarting listener to {}, config not changed", settings.address),
                    Some(&self.tag),
                );
                continue;
            }
            let address = settings.address.clone();
            let listener = Listener::start(self.transport.clone(), settings, self.out.clone(), &self.tag);
            self.listeners.insert(address, listener);
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        self.listeners.keys().cloned().collect()
    }

    pub fn stop(&mut self) {
        for (_, mut listener) in self.listeners.drain() {
            listener.stop();
        }
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        self.stop();
    }
}
