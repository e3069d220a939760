use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use nat_probe::logging::init_logging;
use nat_probe::{Server, ServerError, ServiceFile};

/// Reply to device status messages after the interval each one asks for,
/// and record which replies made it back through the NAT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Service file (JSON). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the server's own log file, overriding the service file
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let service = match &args.config {
        Some(path) => match ServiceFile::load(path) {
            Ok(service) => service,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => ServiceFile::default(),
    };

    let log_dir = args.log_dir.or_else(|| service.server.log_dir.clone());
    match init_logging(log_dir.as_deref(), "nat_probe") {
        Ok((Some(path), _)) => info!("Logging to {path:?}, rotated daily"),
        Ok((None, _)) => {}
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    match run(service) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(service: ServiceFile) -> Result<(), ServerError> {
    let codec = service.codec()?;
    let handle = Server::with_codec(service.server, service.store, codec).run()?;
    handle.wait()
}
