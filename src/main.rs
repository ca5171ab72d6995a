use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use trollmover::bus::{TcpTransport, Transport};
use trollmover::cli::{parse_args, Args, RoleKind};
use trollmover::client::Client;
use trollmover::config::{ConfigWatch, RoleConfig};
use trollmover::dispatcher::Dispatcher;
use trollmover::mirror::Mirror;
use trollmover::movers::MoverRegistry;
use trollmover::server::Server;
use trollmover::shutdown::get_signal_type;
use trollmover::{
    install_signal_handlers, is_shutdown_requested, log, set_debug, set_log_file, take_reload_request,
    Result, Role,
};

const POLL: Duration = Duration::from_millis(500);

fn fail(message: &str) -> ! {
    let _ = log(message);
    eprintln!("{}", message);
    process::exit(1);
}

/// Reads the config, builds the role from its options and runs it
fn start<R, F>(args: &Args, build: F)
where
    R: Role,
    F: FnOnce(&mut R::Options) -> Result<R>,
{
    let mut config = RoleConfig::<R::Options>::load(&args.config_file)
        .unwrap_or_else(|e| fail(&format!("Cannot load configuration: {}", e)));
    let mut role = build(&mut config.options).unwrap_or_else(|e| fail(&format!("Cannot start {}: {}", args.role, e)));

    let failures = role.apply(config);
    if !failures.is_empty() {
        role.stop();
        fail(&format!("{} section(s) failed to start", failures.len()));
    }
    let _ = log(&format!("{} {} started", trollmover::PROGRAM_NAME, args.role));

    let mut watch = ConfigWatch::new(&args.config_file);
    while !is_shutdown_requested() {
        thread::sleep(POLL);
        // Both checks run so one reload consumes both triggers
        let signalled = take_reload_request();
        let modified = watch.changed();
        if !(signalled || modified) {
            continue;
        }
        match RoleConfig::<R::Options>::load(&args.config_file) {
            Ok(config) => {
                let _ = log("Reloading configuration");
                let failures = role.apply(config);
                for failure in &failures {
                    let _ = log(&failure.to_string());
                }
            }
            Err(e) => {
                let _ = log(&format!("Keeping the running configuration: {}", e));
            }
        }
    }

    match get_signal_type() {
        Some(1) => {
            let _ = log("Received SIGINT, stopping");
        }
        Some(_) => {
            let _ = log("Received SIGTERM, stopping");
        }
        None => {}
    }
    role.stop();
    let _ = log(&format!("{} {} stopped", trollmover::PROGRAM_NAME, args.role));
}

fn main() {
    let args = parse_args();
    if let Some(log_file) = &args.log_file {
        set_log_file(log_file);
    }
    set_debug(args.debug);

    if let Err(e) = install_signal_handlers() {
        fail(&format!("Cannot install signal handlers: {}", e));
    }

    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
    let publish_port = args.publish_port;
    match args.role {
        RoleKind::Server => start::<Server, _>(&args, |options| {
            if let Some(port) = publish_port {
                options.publish_port = port;
            }
            options.disable_backlog |= args.disable_backlog;
            Server::new(transport, MoverRegistry::default(), options)
        }),
        RoleKind::Client => start::<Client, _>(&args, |options| {
            if let Some(port) = publish_port {
                options.publish_port = port;
            }
            Client::new(transport, options)
        }),
        RoleKind::Mirror => start::<Mirror, _>(&args, |options| {
            if let Some(port) = publish_port {
                options.publish_port = port;
            }
            Mirror::new(transport, MoverRegistry::default(), options)
        }),
        RoleKind::Dispatcher => start::<Dispatcher, _>(&args, |options| {
            if publish_port.is_some() {
                options.publish_port = publish_port;
            }
            Dispatcher::new(transport, MoverRegistry::default(), options)
        }),
    }
}
