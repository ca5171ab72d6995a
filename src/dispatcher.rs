//! Dispatcher role
//!
//! Receives announcements of local files and copies each file to every
//! target whose rules select it. Targets are independent: a failure on
//! one is logged and does not stop the others.

use chrono::{Local, TimeZone};
use rayon::prelude::*;
use serde_json::Value;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::bus::{Publish, Transport};
use crate::config::{ConnectionParams, DispatcherConfig, DispatcherOptions, TargetConfig};
use crate::error::{MoveError, Result};
use crate::executor::TransferExecutor;
use crate::listener::{Delivery, ListenerSet, ListenerSettings};
use crate::logging::{debug, log_with_tag};
use crate::message::{Message, MessageType, Metadata};
use crate::movers::MoverRegistry;
use crate::pattern::compose;
use crate::rules::apply_aliases;
use crate::uri::Destination;
use crate::Role;

const POLL: Duration = Duration::from_millis(200);
const TAG: &str = "dispatcher";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One `file` message per member of a `dataset` message
pub fn split_dataset(msg: &Message) -> Vec<Message> {
    match msg.kind {
        MessageType::File => vec![msg.clone()],
        MessageType::Dataset => {
            let mut common = msg.data.clone();
            let items = match common.remove("dataset") {
                Some(Value::Array(items)) => items,
                _ => return Vec::new(),
            };
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(file) => {
                        let mut data = common.clone();
                        for key in ["uid", "uri"] {
                            if let Some(value) = file.get(key) {
                                data.insert(key.to_string(), value.clone());
                            }
                        }
                        Some(Message::new(msg.subject.as_str(), MessageType::File, data))
                    }
                    _ => None,
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Local time of the last status change of `path`, in metadata format
fn creation_time(path: &Path) -> Option<String> {
    let meta = fs::metadata(path).ok()?;
    let time = Local.timestamp_opt(meta.ctime(), 0).single()?;
    Some(time.naive_local().format("%Y-%m-%dT%H:%M:%S").to_string())
}

/// Where one target wants a file
#[derive(Debug)]
pub struct Route {
    pub target: String,
    pub destination: Destination,
    pub params: ConnectionParams,
}

/// Resolves the destination of `msg` for one target
///
/// Conditions see the metadata after the target's aliases were applied.
/// The first dispatch config whose topics and conditions match wins; its
/// `host`, `directory`, `filepattern` and `connection_parameters` override
/// the target's. Returns `None` when no config matches.
pub fn route(name: &str, target: &TargetConfig, msg: &Message, source: &Path) -> Result<Option<Route>> {
    let mut data = apply_aliases(&msg.data, &target.aliases);
    let Some(rule) = target
        .dispatch_configs
        .iter()
        .find(|rule| rule.matches(&msg.subject, &data))
    else {
        return Ok(None);
    };

    if let Some(time) = creation_time(source) {
        data.insert("file_creation_time".into(), Value::String(time));
    }

    let host = rule.host.as_deref().unwrap_or(&target.host);
    let directory = rule
        .directory
        .as_deref()
        .or(target.directory.as_deref())
        .ok_or_else(|| MoveError::Config(format!("target '{}' has no directory", name)))?;
    let source_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filepattern = rule
        .filepattern
        .as_deref()
        .or(target.filepattern.as_deref())
        .unwrap_or(&source_name);
    let template = Path::new(directory).join(filepattern);
    let path = compose(&template.to_string_lossy(), &data)?;

    let destination = if host.is_empty() {
        Destination::parse(&path)?
    } else {
        Destination::parse(host)?.with_path(path)
    };
    let params = rule
        .connection_parameters
        .clone()
        .unwrap_or_else(|| target.connection_parameters.clone());
    Ok(Some(Route {
        target: name.to_string(),
        destination,
        params,
    }))
}

/// Result of one target's transfer
#[derive(Debug)]
pub struct Outcome {
    pub target: String,
    pub destination: String,
    pub result: Result<()>,
}

struct Core {
    executor: TransferExecutor,
    publisher: Option<Arc<dyn Publish>>,
    targets: Mutex<Arc<Vec<(String, TargetConfig)>>>,
}

impl Core {
    fn dispatch(&self, msg: &Message) -> Vec<Outcome> {
        split_dataset(msg)
            .iter()
            .flat_map(|file_msg| self.dispatch_file(file_msg))
            .collect()
    }

    fn dispatch_file(&self, msg: &Message) -> Vec<Outcome> {
        let Some(uri) = msg.get_str("uri") else {
            debug("Message without uri", Some(TAG));
            return Vec::new();
        };
        let source = match Destination::parse(uri) {
            Ok(src) if src.is_local() => PathBuf::from(src.path),
            Ok(src) => {
                let _ = log_with_tag(&format!("{} is on another host, not dispatching", src), Some(TAG));
                return Vec::new();
            }
            Err(e) => {
                let _ = log_with_tag(&e.to_string(), Some(TAG));
                return Vec::new();
            }
        };
        if !source.exists() {
            let _ = log_with_tag(
                &format!("Source file for dispatching does not exist: {}", source.display()),
                Some(TAG),
            );
        }

        let targets = lock(&self.targets).clone();
        let outcomes: Vec<Outcome> = targets
            .par_iter()
            .filter_map(|(name, target)| match route(name, target, msg, &source) {
                Ok(Some(route)) => {
                    debug(&format!("Dispatching {} to {}", source.display(), route.destination), Some(TAG));
                    let result = self.executor.transfer(&source, &route.destination, &route.params);
                    Some(Outcome {
                        target: route.target,
                        destination: route.destination.clean(),
                        result,
                    })
                }
                Ok(None) => None,
                Err(e) => Some(Outcome {
                    target: name.clone(),
                    destination: String::new(),
                    result: Err(e),
                }),
            })
            .collect();

        for outcome in &outcomes {
            match &outcome.result {
                Ok(()) => self.publish(msg, outcome, &targets),
                Err(e) => {
                    let _ = log_with_tag(
                        &format!("Could not dispatch to {}: {}", outcome.target, e),
                        Some(TAG),
                    );
                }
            }
        }
        if !outcomes.is_empty() && outcomes.iter().all(|o| o.result.is_ok()) {
            let _ = log_with_tag(&format!("Dispatched {}", source.display()), Some(TAG));
        }
        outcomes
    }

    /// Announces a delivered file on the target's `publish_topic`
    fn publish(&self, msg: &Message, outcome: &Outcome, targets: &[(String, TargetConfig)]) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        let Some((_, target)) = targets.iter().find(|(name, _)| *name == outcome.target) else {
            return;
        };
        let Some(topic) = &target.publish_topic else {
            let _ = log_with_tag(
                &format!("Publish topic not configured for '{}'", outcome.target),
                Some(TAG),
            );
            return;
        };
        let mut info: Metadata = msg.data.clone();
        let path = Destination::parse(&outcome.destination)
            .map(|d| d.path)
            .unwrap_or_else(|_| outcome.destination.clone());
        info.insert("uri".into(), Value::String(path));
        let result = compose(topic, &info)
            .and_then(|subject| publisher.send(&Message::new(subject, MessageType::File, info)));
        if let Err(e) = result {
            let _ = log_with_tag(&format!("Cannot publish for '{}': {}", outcome.target, e), Some(TAG));
        }
    }
}

pub struct Dispatcher {
    core: Arc<Core>,
    listeners: ListenerSet,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

fn run(core: Arc<Core>, rx: Receiver<Delivery>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL) {
            Ok((_, msg)) => {
                core.dispatch(&msg);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, registry: MoverRegistry, options: &DispatcherOptions) -> Result<Self> {
        let publisher = match options.publish_port {
            Some(port) => {
                let publisher = transport.publisher(port)?;
                let _ = log_with_tag(&format!("Publishing on {}", publisher.address()), Some(TAG));
                Some(publisher)
            }
            None => None,
        };
        let core = Arc::new(Core {
            executor: TransferExecutor::new(registry, TAG),
            publisher,
            targets: Mutex::new(Arc::new(Vec::new())),
        });
        let (tx, rx) = mpsc::channel();
        let listeners = ListenerSet::new(transport, tx, TAG);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let core = core.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(TAG.into())
                .spawn(move || run(core, rx, stop))?
        };
        Ok(Dispatcher {
            core,
            listeners,
            stop,
            worker: Some(worker),
        })
    }

    pub fn publish_address(&self) -> Option<String> {
        self.core.publisher.as_ref().map(|p| p.address())
    }

    /// Dispatches one message synchronously
    pub fn dispatch(&self, msg: &Message) -> Vec<Outcome> {
        self.core.dispatch(msg)
    }
}

impl Role for Dispatcher {
    type Options = DispatcherOptions;

    /// Targets are cheap to rebuild, so every reload replaces all of them;
    /// only listeners whose address or topics changed are restarted
    fn apply(&mut self, config: DispatcherConfig) -> Vec<MoveError> {
        let mut failures = Vec::new();
        let mut targets = Vec::new();
        for name in config.names() {
            match config.section::<TargetConfig>(name) {
                Ok(target) => targets.push((name.to_string(), target)),
                Err(e) => {
                    let err = MoveError::ConfigReload {
                        section: name.to_string(),
                        reason: e.to_string(),
                    };
                    let _ = log_with_tag(&err.to_string(), Some(TAG));
                    failures.push(err);
                }
            }
        }

        let mut topics: Vec<String> = targets
            .iter()
            .flat_map(|(_, t)| t.dispatch_configs.iter().flat_map(|r| r.topics.iter().cloned()))
            .collect();
        topics.sort();
        topics.dedup();
        let wanted = config
            .options
            .subscribe_addresses
            .iter()
            .map(|address| ListenerSettings {
                address: address.clone(),
                topics: topics.clone(),
                heartbeat: None,
            })
            .collect();

        *lock(&self.core.targets) = Arc::new(targets);
        self.listeners.refresh(wanted);
        failures
    }

    fn stop(&mut self) {
        self.listeners.stop();
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.core.executor.close_all();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        Role::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, MessageSource};
    use crate::executor::tests::CountingMover;
    use serde_json::json;
    use tempfile::tempdir;

    fn config(text: String) -> DispatcherConfig {
        DispatcherConfig::parse(&text).unwrap()
    }

    fn file_message(subject: &str, path: &Path, extra: Value) -> Message {
        let mut data = extra.as_object().cloned().unwrap_or_default();
        data.insert("uri".into(), json!(path.display().to_string()));
        data.insert(
            "uid".into(),
            json!(path.file_name().unwrap().to_string_lossy().to_string()),
        );
        Message::new(subject, MessageType::File, data)
    }

    fn fake_dispatcher(mover: Arc<CountingMover>, bus: &MemoryBus, options: &DispatcherOptions) -> Dispatcher {
        let mut registry = MoverRegistry::default();
        registry.register("ftp", mover);
        Dispatcher::new(Arc::new(bus.clone()), registry, options).unwrap()
    }

    #[test]
    fn test_selects_targets_by_rules() {
        let src = tempdir().unwrap();
        let path = src.path().join("viirs_npp_gs.tif");
        fs::write(&path, b"x").unwrap();
        let bus = MemoryBus::new();
        let mover = Arc::new(CountingMover::default());
        let cfg = config(
            r#"{
            "target1": {
                "host": "ftp://ftp.target1.com",
                "directory": "/input_data/{sensor}",
                "filepattern": "{platform_name}_{product}.{format}",
                "dispatch_configs": [{
                    "topics": ["/level2/viirs"],
                    "conditions": [{"product": ["green_snow", "true_color"], "sensor": "viirs",
                                    "except": {"platform_name": "NOAA-15"}}]
                }]
            },
            "target2": {
                "host": "ftp://ftp.target2.com",
                "directory": "/satellite",
                "aliases": {"platform_name": {"Suomi-NPP": "npp"}},
                "dispatch_configs": [{
                    "topics": ["/level2"],
                    "conditions": [{"sensor": "viirs", "except": {"platform_name": "npp"}}]
                }, {
                    "topics": ["/level2"],
                    "directory": "/npp/{platform_name}"
                }]
            }
        }"#
            .to_string(),
        );
        let mut dispatcher = fake_dispatcher(mover.clone(), &bus, &cfg.options);
        assert!(dispatcher.apply(cfg).is_empty());

        let msg = file_message(
            "/level2/viirs",
            &path,
            json!({"sensor": "viirs", "product": "green_snow", "platform_name": "Suomi-NPP", "format": "tif"}),
        );
        let outcomes = dispatcher.dispatch(&msg);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        let mut puts = mover.puts.lock().unwrap().clone();
        puts.sort();
        assert_eq!(
            puts,
            vec![
                "ftp://ftp.target1.com/input_data/viirs/Suomi-NPP_green_snow.tif".to_string(),
                "ftp://ftp.target2.com/npp/npp/viirs_npp_gs.tif".to_string(),
            ]
        );

        let overview = file_message("/level2/viirs", &path, json!({"sensor": "viirs", "product": "overview", "platform_name": "NOAA-20", "format": "tif"}));
        let outcomes = dispatcher.dispatch(&overview);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].target, "target2");
        assert_eq!(outcomes[0].destination, "ftp://ftp.target2.com/satellite/viirs_npp_gs.tif");

        let excepted = file_message("/level2/viirs", &path, json!({"sensor": "viirs", "product": "green_snow", "platform_name": "NOAA-15", "format": "tif"}));
        let outcomes = dispatcher.dispatch(&excepted);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].target, "target2");
        Role::stop(&mut dispatcher);
    }

    #[test]
    fn test_failed_target_does_not_stop_others() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let path = src.path().join("file.dat");
        fs::write(&path, b"payload").unwrap();
        let bus = MemoryBus::new();
        let mover = Arc::new(CountingMover {
            failing_hosts: vec!["down.example.com".to_string()],
            ..Default::default()
        });
        let cfg = config(format!(
            r#"{{
            "broken": {{"host": "ftp://down.example.com", "directory": "/in",
                        "dispatch_configs": [{{"topics": ["/data"]}}]}},
            "local": {{"directory": "{}/{{platform_name}}",
                       "dispatch_configs": [{{"topics": ["/data"]}}]}},
            "composition": {{"directory": "/x/{{missing_key}}",
                             "dispatch_configs": [{{"topics": ["/data"]}}]}}
        }}"#,
            out.path().display()
        ));
        let mut dispatcher = fake_dispatcher(mover, &bus, &cfg.options);
        assert!(dispatcher.apply(cfg).is_empty());

        let outcomes = dispatcher.dispatch(&file_message("/data/x", &path, json!({"platform_name": "metop"})));
        assert_eq!(outcomes.len(), 3);
        let local = outcomes.iter().find(|o| o.target == "local").unwrap();
        assert!(local.result.is_ok());
        assert_eq!(fs::read(out.path().join("metop").join("file.dat")).unwrap(), b"payload");
        let broken = outcomes.iter().find(|o| o.target == "broken").unwrap();
        assert!(matches!(broken.result, Err(MoveError::TransferFailure { .. })));
        let composition = outcomes.iter().find(|o| o.target == "composition").unwrap();
        assert!(matches!(composition.result, Err(MoveError::Template(_))));
        Role::stop(&mut dispatcher);
    }

    #[test]
    fn test_dataset_is_split_and_published() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let a = src.path().join("a.nc");
        let b = src.path().join("b.nc");
        fs::write(&a, b"A").unwrap();
        fs::write(&b, b"B").unwrap();

        let bus = MemoryBus::new();
        let upstream = bus.publisher(0).unwrap();
        let cfg = config(format!(
            r#"{{
            "subscribe_addresses": ["{}"],
            "publish_port": 0,
            "archive": {{"directory": "{}", "publish_topic": "/archived/{{platform_name}}",
                         "dispatch_configs": [{{"topics": ["/dataset"]}}]}}
        }}"#,
            upstream.address(),
            out.path().display()
        ));
        let mut dispatcher =
            Dispatcher::new(Arc::new(bus.clone()), MoverRegistry::default(), &cfg.options).unwrap();
        assert!(dispatcher.apply(cfg).is_empty());
        let mut reports = bus
            .subscribe(&dispatcher.publish_address().unwrap(), &["/archived".to_string()])
            .unwrap();
        thread::sleep(Duration::from_millis(300));

        let data = json!({
            "platform_name": "noaa20",
            "dataset": [
                {"uid": "a.nc", "uri": a.display().to_string()},
                {"uid": "b.nc", "uri": b.display().to_string()}
            ]
        });
        upstream
            .send(&Message::new("/dataset/l1b", MessageType::Dataset, data.as_object().unwrap().clone()))
            .unwrap();

        let mut uris = Vec::new();
        for _ in 0..2 {
            let report = reports.recv_timeout(Duration::from_secs(5)).unwrap().expect("no report");
            assert_eq!(report.subject, "/archived/noaa20");
            assert_eq!(report.kind, MessageType::File);
            uris.push(report.get_str("uri").unwrap().to_string());
        }
        uris.sort();
        assert_eq!(
            uris,
            vec![
                out.path().join("a.nc").display().to_string(),
                out.path().join("b.nc").display().to_string()
            ]
        );
        assert_eq!(fs::read(out.path().join("b.nc")).unwrap(), b"B");
        Role::stop(&mut dispatcher);
    }

    #[test]
    fn test_split_dataset_keeps_common_metadata() {
        let data = json!({"sensor": "avhrr", "dataset": [{"uid": "1", "uri": "/d/1"}, {"uid": "2", "uri": "/d/2"}]});
        let msg = Message::new("/t", MessageType::Dataset, data.as_object().unwrap().clone());
        let files = split_dataset(&msg);
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].data["uid"], "2");
        assert_eq!(files[1].data["sensor"], "avhrr");
        assert!(!files[0].data.contains_key("dataset"));

        let ack = Message::new("/t", MessageType::Ack, Metadata::new());
        assert!(split_dataset(&ack).is_empty());
    }
}
