//! Master process for the instrument network.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use plumelink::logging::init_logging;
use plumelink::netfile::write_network_file;
use plumelink::{Code, CommandSet, Devices, Instrument, InstrumentCtx, MockConfig};

#[derive(Parser, Debug)]
#[command(name = "plumelink-master", about = "Instrument master process", version)]
struct Args {
    /// JSON context file; defaults are used for anything it leaves out
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start continuous capture on every device
    #[arg(short, long, conflicts_with = "dark_capture")]
    continuous: bool,

    /// Run the dark sequences, then exit
    #[arg(short, long)]
    dark_capture: bool,

    /// Host software mock-ups of both cameras and the spectrometer
    #[arg(long)]
    mock: bool,

    /// Where to publish the listen address; defaults to `network.txt` in the op directory
    #[arg(long)]
    net_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut ctx = match &args.config {
        Some(path) => match InstrumentCtx::load(path) {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => InstrumentCtx::default(),
    };
    ctx.exit_when_dark_complete |= args.dark_capture;

    if let Err(e) = init_logging(&ctx) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let devices = if args.mock {
        Devices::Mock(MockConfig::default())
    } else {
        Devices::None
    };
    let instrument = match Instrument::start(&ctx, devices, None) {
        Ok(instrument) => instrument,
        Err(e) => {
            error!("Unable to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let net_file = args
        .net_file
        .unwrap_or_else(|| ctx.op_dir.join("network.txt"));
    if let Err(e) = write_network_file(&net_file, instrument.local_addr()) {
        error!("{e}");
    }

    if args.dark_capture {
        info!("Starting dark capture");
        instrument.command(
            CommandSet::new()
                .with(Code::DKC, true)
                .with(Code::DKS, true),
        );
    } else if args.continuous {
        info!("Starting continuous capture");
        instrument.command(
            CommandSet::new()
                .with(Code::STC, true)
                .with(Code::STS, true),
        );
    }

    let reason = instrument.wait();
    info!("Exiting with {reason:?}");
    ExitCode::from(reason.code())
}
