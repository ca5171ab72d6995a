use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::{topic_matches, MessageSource, Publish, RequestHandler, Service, Transport};
use crate::error::{MoveError, Result};
use crate::logging::{debug, log_with_tag};
use crate::message::{Message, HOSTNAME};
use crate::responder::Responder;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Line-oriented TCP transport
#[derive(Debug, Clone)]
pub struct TcpTransport {
    advertised_host: String,
}

impl TcpTransport {
    /// Advertises this machine's hostname
    pub fn new() -> Self {
        TcpTransport {
            advertised_host: HOSTNAME.clone(),
        }
    }

    /// Advertises `host` instead of the hostname (e.g. `127.0.0.1`)
    pub fn with_host(host: impl Into<String>) -> Self {
        TcpTransport {
            advertised_host: host.into(),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::new()
    }
}

fn resolve(address: &str) -> Result<SocketAddr> {
    let address = address.strip_prefix("tcp://").unwrap_or(address);
    address
        .to_socket_addrs()
        .map_err(|e| MoveError::Bus(format!("cannot resolve {}: {}", address, e)))?
        .next()
        .ok_or_else(|| MoveError::Bus(format!("no address for {}", address)))
}

struct TcpPublisher {
    address: String,
    clients: Arc<Mutex<Vec<TcpStream>>>,
    stop: Arc<AtomicBool>,
}

impl Publish for TcpPublisher {
    fn send(&self, msg: &Message) -> Result<()> {
        let line = format!("{}\n", msg.encode());
        let mut clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        clients.retain_mut(|client| client.write_all(line.as_bytes()).is_ok());
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

struct TcpSubscription {
    reader: BufReader<TcpStream>,
    topics: Vec<String>,
    pending: Vec<u8>,
}

impl MessageSource for TcpSubscription {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.reader.get_ref().set_read_timeout(Some(remaining))?;
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => return Err(MoveError::Bus("publisher closed the connection".into())),
                Ok(_) if self.pending.ends_with(b"\n") => {
                    let line = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    match Message::decode(&line) {
                        Ok(msg) if topic_matches(&self.topics, &msg.subject) => return Ok(Some(msg)),
                        Ok(_) => continue,
                        Err(e) => {
                            debug(&format!("Skipping undecodable publication: {}", e), None);
                            continue;
                        }
                    }
                }
                Ok(_) => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn accept_subscribers(listener: TcpListener, clients: Arc<Mutex<Vec<TcpStream>>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err()
                    || stream.set_write_timeout(Some(WRITE_TIMEOUT)).is_err()
                {
                    continue;
                }
                match clients.lock() {
                    Ok(mut guard) => guard.push(stream),
                    Err(poisoned) => poisoned.into_inner().push(stream),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                let _ = log_with_tag(&format!("Publisher accept failed: {}", e), Some("publisher"));
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

impl Transport for TcpTransport {
    fn publisher(&self, port: u16) -> Result<Arc<dyn Publish>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
            MoveError::Bus(format!("cannot bind publish port {}: {}", port, e))
        })?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let clients = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (thread_clients, thread_stop) = (clients.clone(), stop.clone());
        thread::Builder::new()
            .name(format!("publisher:{}", port))
            .spawn(move || accept_subscribers(listener, thread_clients, thread_stop))?;

        Ok(Arc::new(TcpPublisher {
            address: format!("{}:{}", self.advertised_host, port),
            clients,
            stop,
        }))
    }

    fn subscribe(&self, address: &str, topics: &[String]) -> Result<Box<dyn MessageSource>> {
        let addr = resolve(address)?;
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))
            .map_err(|e| MoveError::Bus(format!("cannot subscribe to {}: {}", address, e)))?;
        Ok(Box::new(TcpSubscription {
            reader: BufReader::new(stream),
            topics: topics.to_vec(),
            pending: Vec::new(),
        }))
    }

    fn request(&self, address: &str, msg: &Message, timeout: Duration) -> Result<Message> {
        let timed_out = || MoveError::RequestTimeout {
            address: address.to_string(),
        };
        let addr = resolve(address)?;
        let mut stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => timed_out(),
            _ => MoveError::Bus(format!("cannot reach {}: {}", address, e)),
        })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.write_all(format!("{}\n", msg.encode()).as_bytes())?;

        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => Err(MoveError::Bus(format!("{} closed the connection", address))),
            Ok(_) => Message::decode(&String::from_utf8_lossy(&line)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(timed_out())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn serve(&self, port: u16, handler: RequestHandler) -> Result<Box<dyn Service>> {
        Ok(Box::new(Responder::bind(port, &self.advertised_host, handler)?))
    }
}
