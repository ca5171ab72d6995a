//! Request-serving socket
//!
//! Every accepted connection gets its own thread, so a slow transfer never
//! holds up other requesters. Every line received is answered with exactly
//! one line: undecodable requests and handler panics become `error`
//! replies.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bus::{RequestHandler, Service};
use crate::error::{MoveError, Result};
use crate::logging::{debug, log_with_tag};
use crate::message::Message;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Produces the reply for one raw request line. Never fails.
pub fn answer(handler: &RequestHandler, raw: &str) -> Message {
    let request = match Message::decode(raw) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = log_with_tag(&format!("Rejecting malformed request: {}", e), Some("responder"));
            return Message::error_reply("/", e);
        }
    };

    match panic::catch_unwind(AssertUnwindSafe(|| handler(&request))) {
        Ok(reply) => reply,
        Err(_) => {
            let _ = log_with_tag(
                &format!("Handler failed on {} request", request.kind),
                Some("responder"),
            );
            Message::error_reply(&request.subject, "internal error while handling request")
        }
    }
}

/// TCP request server
pub struct Responder {
    address: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Responder {
    /// Binds `port` on all interfaces. A bind failure is returned to the
    /// caller (fatal at startup).
    pub fn bind(port: u16, advertised_host: &str, handler: RequestHandler) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
            MoveError::Bus(format!("cannot bind request port {}: {}", port, e))
        })?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let address = format!("{}:{}", advertised_host, port);
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let tag = format!("responder:{}", port);
        let handle = thread::Builder::new()
            .name(tag.clone())
            .spawn(move || accept_loop(listener, handler, thread_stop, tag))?;

        Ok(Responder {
            address,
            stop,
            handle: Some(handle),
        })
    }
}

fn accept_loop(listener: TcpListener, handler: RequestHandler, stop: Arc<AtomicBool>, tag: String) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug(&format!("Connection from {}", peer), Some(&tag));
                let handler = handler.clone();
                let stop = stop.clone();
                let tag = tag.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-conn", tag))
                    .spawn(move || serve_connection(stream, handler, stop, &tag));
                if let Err(e) = spawned {
                    let _ = log_with_tag(&format!("Cannot spawn connection thread: {}", e), None);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                let _ = log_with_tag(&format!("Accept failed: {}", e), Some(&tag));
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn serve_connection(stream: TcpStream, handler: RequestHandler, stop: Arc<AtomicBool>, tag: &str) {
    if stream.set_nonblocking(false).is_err() || stream.set_read_timeout(Some(IDLE_TIMEOUT)).is_err() {
        return;
    }
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    while !stop.load(Ordering::SeqCst) {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if line.trim().is_empty() {
                    continue;
                }
                let reply = answer(&handler, &line);
                let out = format!("{}\n", reply.encode());
                if let Err(e) = writer.write_all(out.as_bytes()) {
                    let _ = log_with_tag(&format!("Could not send reply: {}", e), Some(tag));
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

impl Service for Responder {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop();
    }
}
