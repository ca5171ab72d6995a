use std::env;
use std::fmt;
use std::process;

/// Which role the process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Server,
    Client,
    Mirror,
    Dispatcher,
}

impl RoleKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "server" => Some(RoleKind::Server),
            "client" => Some(RoleKind::Client),
            "mirror" => Some(RoleKind::Mirror),
            "dispatcher" => Some(RoleKind::Dispatcher),
            _ => None,
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleKind::Server => "server",
            RoleKind::Client => "client",
            RoleKind::Mirror => "mirror",
            RoleKind::Dispatcher => "dispatcher",
        };
        f.write_str(name)
    }
}

/// Parsed command line
#[derive(Debug, Clone, PartialEq)]
pub struct Args {
    pub role: RoleKind,
    pub config_file: String,
    pub log_file: Option<String>,
    pub debug: bool,
    /// Overrides the `publish_port` of the configuration file
    pub publish_port: Option<u16>,
    pub disable_backlog: bool,
}

/// What the command line asks for
#[derive(Debug, PartialEq)]
pub enum Command {
    Run(Args),
    Help,
    Version,
}

/// Prints usage instructions for the program.
pub fn print_usage() {
    println!(
        "Usage: {} <server|client|mirror|dispatcher> [-h] [-v] [--debug] [-l logfile] [-p publish_port] [--disable-backlog] config_file",
        crate::PROGRAM_NAME
    );
}

/// Parses `args` (without the program name)
///
/// Errors carry the message to print before the usage line.
pub fn parse_from<I: IntoIterator<Item = String>>(args: I) -> Result<Command, String> {
    let mut role = None;
    let mut config_file = None;
    let mut log_file = None;
    let mut debug = false;
    let mut publish_port = None;
    let mut disable_backlog = false;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-v" | "--version" => return Ok(Command::Version),
            "--debug" => debug = true,
            "--disable-backlog" => disable_backlog = true,
            "-l" => {
                log_file = Some(args.next().ok_or("Missing log file argument")?);
            }
            "-p" => {
                let port = args.next().ok_or("Missing publish port argument")?;
                publish_port = Some(
                    port.parse::<u16>()
                        .map_err(|_| format!("Publish port must be a number from 0 to 65535, got {}", port))?,
                );
            }
            _ if arg.starts_with('-') => return Err(format!("Unknown option: {}", arg)),
            _ if role.is_none() => {
                role = Some(RoleKind::parse(&arg).ok_or_else(|| format!("Unknown role: {}", arg))?);
            }
            _ if config_file.is_none() => config_file = Some(arg),
            _ => return Err(format!("Unexpected argument: {}", arg)),
        }
    }

    let role = role.ok_or("Missing role argument")?;
    let config_file = config_file.ok_or("Missing config file argument")?;
    Ok(Command::Run(Args {
        role,
        config_file,
        log_file,
        debug,
        publish_port,
        disable_backlog,
    }))
}

/// Parses the process arguments, exiting on `-h`, `-v` and errors
pub fn parse_args() -> Args {
    match parse_from(env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            print_usage();
            process::exit(0);
        }
        Ok(Command::Version) => {
            println!("{} version {}", crate::PROGRAM_NAME, crate::PROGRAM_VERSION);
            process::exit(0);
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            print_usage();
            process::exit(1);
        }
    }
}
