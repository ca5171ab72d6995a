use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::{topic_matches, MessageSource, Publish, RequestHandler, Service, Transport};
use crate::error::{MoveError, Result};
use crate::message::Message;
use crate::responder::answer;

type ReplyTx = Sender<String>;

#[derive(Default)]
struct State {
    next_port: u16,
    subscribers: HashMap<String, Vec<Sender<String>>>,
    services: HashMap<String, Sender<(String, ReplyTx)>>,
}

/// In-process bus; addresses look like `memory:<port>`
///
/// Messages still go through the wire encoding so both sides see exactly
/// what a TCP peer would.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        MemoryBus::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn allocate(&self, port: u16) -> String {
        let mut state = self.lock();
        let port = if port == 0 {
            state.next_port += 1;
            60000 - state.next_port
        } else {
            port
        };
        format!("memory:{}", port)
    }
}

struct MemoryPublisher {
    bus: MemoryBus,
    address: String,
}

impl Publish for MemoryPublisher {
    fn send(&self, msg: &Message) -> Result<()> {
        let line = msg.encode();
        let mut state = self.bus.lock();
        if let Some(subs) = state.subscribers.get_mut(&self.address) {
            subs.retain(|tx| tx.send(line.clone()).is_ok());
        }
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

struct MemorySubscription {
    rx: Receiver<String>,
    topics: Vec<String>,
}

impl MessageSource for MemorySubscription {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(line) => {
                    let msg = Message::decode(&line)?;
                    if topic_matches(&self.topics, &msg.subject) {
                        return Ok(Some(msg));
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MoveError::Bus("memory bus dropped".into()))
                }
            }
        }
    }
}

struct MemoryService {
    bus: MemoryBus,
    address: String,
    stop: Arc<AtomicBool>,
}

impl Service for MemoryService {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.bus.lock().services.remove(&self.address);
    }
}

impl Drop for MemoryService {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Transport for MemoryBus {
    fn publisher(&self, port: u16) -> Result<Arc<dyn Publish>> {
        Ok(Arc::new(MemoryPublisher {
            bus: self.clone(),
            address: self.allocate(port),
        }))
    }

    fn subscribe(&self, address: &str, topics: &[String]) -> Result<Box<dyn MessageSource>> {
        let (tx, rx) = mpsc::channel();
        self.lock()
            .subscribers
            .entry(address.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(MemorySubscription {
            rx,
            topics: topics.to_vec(),
        }))
    }

    fn request(&self, address: &str, msg: &Message, timeout: Duration) -> Result<Message> {
        let service = self
            .lock()
            .services
            .get(address)
            .cloned()
            .ok_or_else(|| MoveError::RequestTimeout {
                address: address.to_string(),
            })?;
        let (reply_tx, reply_rx) = mpsc::channel();
        service
            .send((msg.encode(), reply_tx))
            .map_err(|_| MoveError::Bus(format!("{} is gone", address)))?;
        match reply_rx.recv_timeout(timeout) {
            Ok(line) => Message::decode(&line),
            Err(_) => Err(MoveError::RequestTimeout {
                address: address.to_string(),
            }),
        }
    }

    fn serve(&self, port: u16, handler: RequestHandler) -> Result<Box<dyn Service>> {
        let address = self.allocate(port);
        let (tx, rx) = mpsc::channel::<(String, ReplyTx)>();
        {
            let mut state = self.lock();
            if state.services.contains_key(&address) {
                return Err(MoveError::Bus(format!("{} already served", address)));
            }
            state.services.insert(address.clone(), tx);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        thread::Builder::new()
            .name(format!("responder:{}", address))
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    match rx.recv_timeout(Duration::from_millis(50)) {
                        Ok((raw, reply_tx)) => {
                            let handler = handler.clone();
                            thread::spawn(move || {
                                let _ = reply_tx.send(answer(&handler, &raw).encode());
                            });
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Box::new(MemoryService {
            bus: self.clone(),
            address,
            stop,
        }))
    }
}
