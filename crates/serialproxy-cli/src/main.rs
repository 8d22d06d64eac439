//! Serial proxy daemon
//!
//! Exposes one serial device on a TCP port:
//! - Waits for the device to appear and reopens it after unplug or failure
//! - Forwards client bytes to the device and device bytes to clients
//!
//! Exit codes for argument errors: `1` after `-h`, `2` unknown option,
//! `3` missing device, `6` bad port number, `7` `-p` without a value.

use clap::error::ErrorKind;
use clap::{ArgAction, CommandFactory, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use serialproxy::{LifecycleManager, ProxyConfigBuilder, DEFAULT_LISTEN_PORT};

#[derive(Parser, Debug)]
#[command(name = "proxy")]
#[command(about = "Expose a serial device over TCP")]
#[command(disable_help_flag = true)]
struct Args {
    /// Serial device path or serialproxy://host:port
    #[arg(value_name = "SERIAL", required = true, num_args = 1..)]
    devices: Vec<String>,

    /// TCP listen port
    #[arg(
        short = 'p',
        value_name = "PORT",
        default_value_t = DEFAULT_LISTEN_PORT,
        allow_hyphen_values = true
    )]
    port: u16,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Print this page
    #[arg(short = 'h', action = ArgAction::SetTrue)]
    help: bool,
}

impl Args {
    /// Device to serve; the last one given wins
    fn device(&self) -> &str {
        self.devices.last().map(String::as_str).unwrap_or_default()
    }
}

/// Exit code for an argument error
fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::UnknownArgument => 2,
        ErrorKind::MissingRequiredArgument => 3,
        ErrorKind::ValueValidation => 6,
        ErrorKind::InvalidValue => 7,
        _ => 2,
    }
}

/// Whether `-h` comes before any malformed argument
///
/// Arguments are taken left to right, so `-x -h` is an unknown option and
/// `-p -h` is a bad port number.
fn help_requested<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let arg = arg.as_ref();
        match arg {
            "-h" => return true,
            "-p" => match args.next() {
                Some(value) if value.as_ref().parse::<u16>().is_ok() => {}
                _ => return false,
            },
            _ if arg.starts_with("-p") => {
                if arg[2..].parse::<u16>().is_err() {
                    return false;
                }
            }
            _ if arg.len() > 1 && arg.starts_with('-') => {
                if !arg[1..].chars().all(|c| c == 'v') {
                    return false;
                }
            }
            _ => {}
        }
    }
    false
}

/// Log filter for a verbosity level
fn filter_directives(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        2 => "info,serialproxy=trace,proxy=trace",
        _ => "trace",
    }
}

fn print_usage() {
    eprintln!("{}", Args::command().render_help());
}

fn init_logging(verbose: u8) -> anyhow::Result<()> {
    let filter = if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directives(verbose))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if help_requested(std::env::args().skip(1)) {
        print_usage();
        std::process::exit(1);
    }

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            eprintln!();
            print_usage();
            std::process::exit(exit_code(e.kind()));
        }
    };

    init_logging(args.verbose)?;

    if args.devices.len() > 1 {
        warn!(
            device = %args.device(),
            "Only one serial port can be served; using the last one"
        );
    }

    info!(serial = %args.device(), port = args.port, "Starting proxy");

    let config = ProxyConfigBuilder::new()
        .device(args.device())
        .listen_port(args.port)
        .build();

    let (manager, handle) = match LifecycleManager::from_config(config) {
        Ok(created) => created,
        Err(e) => {
            error!(error = %e, code = e.error_code(), "Cannot start proxy");
            return Err(e.into());
        }
    };
    let mut proxy = tokio::spawn(manager.run());

    tokio::select! {
        result = &mut proxy => {
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
        }
    }

    handle.shutdown().await?;
    proxy.await??;
    Ok(())
}
