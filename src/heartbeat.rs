//! Provider liveness tracking and beat publication

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bus::Publish;
use crate::logging::debug;
use crate::message::{Message, MessageType, Metadata};

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_seen: Instant,
    missed: u32,
}

/// Per-provider last-seen time and missed beat counter
///
/// A provider that has never beaten is assumed alive; it only goes down
/// after `missed_beats` consecutive intervals pass without a beat.
#[derive(Debug)]
pub struct HeartbeatState {
    interval: Duration,
    missed_beats: u32,
    providers: HashMap<String, Liveness>,
}

impl HeartbeatState {
    pub fn new(interval: Duration, missed_beats: u32) -> Self {
        HeartbeatState {
            interval,
            missed_beats: missed_beats.max(1),
            providers: HashMap::new(),
        }
    }

    /// Registers a provider without marking it as seen
    pub fn track(&mut self, provider: &str) {
        self.providers
            .entry(provider.to_string())
            .or_insert(Liveness {
                last_seen: Instant::now(),
                missed: 0,
            });
    }

    /// Records a beat (or any other traffic) from `provider`; senders
    /// that are not tracked are ignored
    pub fn beat(&mut self, provider: &str) {
        self.beat_at(provider, Instant::now());
    }

    fn beat_at(&mut self, provider: &str, now: Instant) {
        if let Some(state) = self.providers.get_mut(provider) {
            state.last_seen = now;
            state.missed = 0;
        }
    }

    /// Keeps what `previous` knew about the providers tracked here
    pub fn carry_over(&mut self, previous: &HeartbeatState) {
        for (name, state) in self.providers.iter_mut() {
            if let Some(known) = previous.providers.get(name) {
                *state = *known;
            }
        }
    }

    pub fn is_tracked(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Recomputes the missed counters; returns the providers that just went down
    pub fn check(&mut self) -> Vec<String> {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> Vec<String> {
        let mut went_down = Vec::new();
        let interval = self.interval.as_secs_f64().max(f64::EPSILON);
        for (name, state) in self.providers.iter_mut() {
            let elapsed = now.saturating_duration_since(state.last_seen).as_secs_f64();
            let missed = (elapsed / interval).floor() as u32;
            if missed >= self.missed_beats && state.missed < self.missed_beats {
                went_down.push(name.clone());
            }
            state.missed = missed;
        }
        went_down
    }

    pub fn is_alive(&self, provider: &str) -> bool {
        self.providers
            .get(provider)
            .map(|s| s.missed < self.missed_beats)
            .unwrap_or(true)
    }

    pub fn missed(&self, provider: &str) -> u32 {
        self.providers.get(provider).map(|s| s.missed).unwrap_or(0)
    }

    pub fn forget(&mut self, provider: &str) {
        self.providers.remove(provider);
    }
}

/// Publishes a `beat` on `topic` every `interval` until stopped
pub struct Beacon {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Beacon {
    pub fn start(publisher: Arc<dyn Publish>, topic: &str, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let topic = topic.to_string();
        let interval = interval.max(Duration::from_millis(100));
        let handle = thread::Builder::new()
            .name("heartbeat".into())
            .spawn(move || {
                let mut data = Metadata::new();
                data.insert("min_interval".into(), Value::from(interval.as_secs_f64()));
                let mut next = Instant::now();
                while !thread_stop.load(Ordering::SeqCst) {
                    if Instant::now() >= next {
                        let beat = Message::new(topic.as_str(), MessageType::Beat, data.clone());
                        if let Err(e) = publisher.send(&beat) {
                            debug(&format!("Cannot send heartbeat: {}", e), None);
                        }
                        next = Instant::now() + interval;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            })
            .ok();
        Beacon { stop, handle }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Beacon {
    fn drop(&mut self) {
        self.stop();
    }
}
