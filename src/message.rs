//! Bus messages
//!
//! A message is a subject (a path-like topic), a type, the sender, a
//! timestamp and a JSON metadata mapping. On the wire it is one line:
//!
//! ```text
//! pytroll://<subject> <type> <sender> <time> v1.01 application/json <json>
//! ```

use chrono::{NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{MoveError, Result};

/// Ordered metadata carried by every message
pub type Metadata = serde_json::Map<String, Value>;

const MAGIC: &str = "pytroll://";
const VERSION: &str = "v1.01";
const MIME: &str = "application/json";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Name of this host, used as sender and for local URIs
pub static HOSTNAME: Lazy<String> = Lazy::new(|| {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
});

static SENDER: Lazy<String> = Lazy::new(|| {
    let user = std::env::var("USER").unwrap_or_else(|_| "trollmover".to_string());
    format!("{}@{}", user, HOSTNAME.as_str())
});

/// Message types understood by the roles
///
/// `push`, `ack`, `ping` and `info` double as request kinds when sent to a
/// Responder; `file`, `dataset`, `ack`, `pong`, `info` and `error` are the
/// possible replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    File,
    Dataset,
    Collection,
    Push,
    Ack,
    Beat,
    Ping,
    Pong,
    Info,
    Error,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::File => "file",
            MessageType::Dataset => "dataset",
            MessageType::Collection => "collection",
            MessageType::Push => "push",
            MessageType::Ack => "ack",
            MessageType::Beat => "beat",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Info => "info",
            MessageType::Error => "error",
            MessageType::Unknown => "unknown",
        }
    }

    /// Types that announce data (as opposed to control traffic)
    pub fn is_announcement(&self) -> bool {
        matches!(
            self,
            MessageType::File | MessageType::Dataset | MessageType::Collection
        )
    }
}

/// `dataset`, `collection` or `file`, depending on the shape of `data`
pub fn announcement_kind(data: &Metadata) -> MessageType {
    if data.contains_key("dataset") {
        MessageType::Dataset
    } else if data.contains_key("collection") {
        MessageType::Collection
    } else {
        MessageType::File
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = MoveError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "file" => MessageType::File,
            "dataset" => MessageType::Dataset,
            "collection" => MessageType::Collection,
            "push" => MessageType::Push,
            "ack" => MessageType::Ack,
            "beat" => MessageType::Beat,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "info" => MessageType::Info,
            "error" | "err" => MessageType::Error,
            "unknown" => MessageType::Unknown,
            other => {
                return Err(MoveError::InvalidMessage(format!(
                    "unknown message type '{}'",
                    other
                )))
            }
        })
    }
}

/// One bus message. Never mutated after it was sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub kind: MessageType,
    pub sender: String,
    pub time: NaiveDateTime,
    pub data: Metadata,
}

impl Message {
    pub fn new(subject: impl Into<String>, kind: MessageType, data: Metadata) -> Self {
        Message {
            subject: subject.into(),
            kind,
            sender: SENDER.clone(),
            time: Utc::now().naive_utc(),
            data,
        }
    }

    /// A reply on the same subject
    pub fn reply(&self, kind: MessageType, data: Metadata) -> Self {
        Message::new(self.subject.clone(), kind, data)
    }

    /// An `error` reply carrying a human readable reason
    pub fn error_reply(subject: &str, reason: impl fmt::Display) -> Self {
        let mut data = Metadata::new();
        data.insert("reason".into(), Value::String(reason.to_string()));
        Message::new(subject, MessageType::Error, data)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Every `uid` value found anywhere in the metadata
    pub fn uids(&self) -> Vec<String> {
        let mut out = Vec::new();
        extract(&self.data, "uid", &mut out);
        out
    }

    /// Every `uri` value found anywhere in the metadata
    pub fn uris(&self) -> Vec<String> {
        let mut out = Vec::new();
        extract(&self.data, "uri", &mut out);
        out
    }

    /// Identity used for deduplication and hot-spare bookkeeping
    ///
    /// Computed over the sorted uids so that the same file announced by
    /// several providers maps to one identity. Messages without uids fall
    /// back to subject and metadata.
    pub fn fingerprint(&self) -> String {
        let mut uids = self.uids();
        let mut hasher = Sha256::new();
        if uids.is_empty() {
            hasher.update(self.subject.as_bytes());
            hasher.update([0u8]);
            hasher.update(Value::Object(self.data.clone()).to_string().as_bytes());
        } else {
            uids.sort();
            for uid in &uids {
                hasher.update(uid.as_bytes());
                hasher.update([0u8]);
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Copies of the file descriptors (objects holding a `uid`)
    pub fn files(&self) -> Vec<Metadata> {
        let mut out = Vec::new();
        let mut data = self.data.clone();
        visit_files(&mut data, &mut |file: &mut Metadata| out.push(file.clone()));
        out
    }

    /// Applies `f` to every file descriptor (object holding a `uid`)
    pub fn for_each_file<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut Metadata),
    {
        visit_files(&mut self.data, &mut f);
    }

    /// Serialises to the single-line wire form
    pub fn encode(&self) -> String {
        format!(
            "{}{} {} {} {} {} {} {}",
            MAGIC,
            self.subject,
            self.kind,
            self.sender,
            self.time.format(TIME_FORMAT),
            VERSION,
            MIME,
            Value::Object(self.data.clone())
        )
    }

    /// Parses the wire form
    pub fn decode(raw: &str) -> Result<Message> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let rest = raw
            .strip_prefix(MAGIC)
            .ok_or_else(|| MoveError::InvalidMessage("missing pytroll:// header".into()))?;

        let mut parts = rest.splitn(7, ' ');
        let mut field = |name: &str| {
            parts
                .next()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| MoveError::InvalidMessage(format!("missing {}", name)))
        };

        let subject = field("subject")?.to_string();
        let kind: MessageType = field("type")?.parse()?;
        let sender = field("sender")?.to_string();
        let time_str = field("time")?;
        let time = NaiveDateTime::parse_from_str(time_str, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| MoveError::InvalidMessage(format!("bad time '{}': {}", time_str, e)))?;
        let version = field("version")?;
        if !version.starts_with('v') {
            return Err(MoveError::InvalidMessage(format!(
                "bad version '{}'",
                version
            )));
        }

        let data = match (parts.next(), parts.next()) {
            (None, _) => Metadata::new(),
            (Some(MIME), Some(json)) => match serde_json::from_str::<Value>(json)? {
                Value::Object(map) => map,
                _ => {
                    return Err(MoveError::InvalidMessage(
                        "metadata must be a JSON object".into(),
                    ))
                }
            },
            (Some(mime), _) => {
                return Err(MoveError::InvalidMessage(format!(
                    "unsupported payload type '{}'",
                    mime
                )))
            }
        };

        Ok(Message {
            subject,
            kind,
            sender,
            time,
            data,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn extract(map: &Metadata, key: &str, out: &mut Vec<String>) {
    for (k, v) in map {
        if k == key {
            if let Some(s) = v.as_str() {
                out.push(s.to_string());
            }
        }
        extract_value(v, key, out);
    }
}

fn extract_value(value: &Value, key: &str, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => extract(map, key, out),
        Value::Array(items) => {
            for item in items {
                extract_value(item, key, out);
            }
        }
        _ => {}
    }
}

/// Applies `f` to every object holding a `uid`, at any depth
pub fn visit_files<F>(map: &mut Metadata, f: &mut F)
where
    F: FnMut(&mut Metadata),
{
    if map.contains_key("uid") {
        f(map);
        return;
    }
    for value in map.values_mut() {
        visit_value(value, f);
    }
}

fn visit_value<F>(value: &mut Value, f: &mut F)
where
    F: FnMut(&mut Metadata),
{
    match value {
        Value::Object(map) => visit_files(map, f),
        Value::Array(items) => {
            for item in items {
                visit_value(item, f);
            }
        }
        _ => {}
    }
}
