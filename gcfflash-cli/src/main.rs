//! gcfflash CLI - flash GCF firmware onto ConBee and RaspBee modules.

use std::fs;
use std::process;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use console::style;
use env_logger::Env;
use gcfflash::{Engine, Job, NativePlatform};
use log::debug;

/// gcfflash - firmware flasher for dresden elektronik Zigbee modules.
///
/// Drives a ConBee or RaspBee from its running application firmware into
/// the bootloader and uploads a GCF firmware image over the serial port.
///
/// Environment variables:
///   RUST_LOG    - log filter (error, warn, info, debug, trace)
#[derive(Parser)]
#[command(name = "gcfflash")]
#[command(author, version, about, long_about = None)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Force device reset without programming.
    #[arg(short = 'r')]
    reset: bool,

    /// Flash the given GCF firmware file.
    #[arg(short = 'f', value_name = "firmware")]
    firmware: Option<String>,

    /// Device path to use, e.g. /dev/ttyACM0 or /dev/ttyUSB0.
    #[arg(short = 'd', value_name = "device")]
    device: Option<String>,

    /// Connect and debug the serial protocol.
    #[arg(short = 'c')]
    connect: bool,

    /// Retry until the timeout (seconds) is reached.
    #[arg(
        short = 't',
        value_name = "timeout",
        value_parser = clap::value_parser!(u64).range(..=3600)
    )]
    timeout: Option<u64>,

    /// List devices.
    #[arg(short = 'l')]
    list: bool,

    /// Print help.
    #[arg(short = '?', action = clap::ArgAction::HelpShort, hide = true)]
    help_alias: Option<bool>,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{} {err:#}", style("error:").red().bold());
        process::exit(2);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    // Invoked without any task: behave like -h.
    if !cli.reset && !cli.connect && !cli.list && cli.firmware.is_none() {
        Cli::command().print_help()?;
        return Ok(());
    }

    // Fail fast on an unreadable firmware file; the engine would discover
    // it too, but without path context.
    if let Some(firmware) = &cli.firmware {
        fs::metadata(firmware)
            .with_context(|| format!("cannot read firmware file {firmware}"))?;
    }

    let job = Job {
        reset: cli.reset,
        connect: cli.connect,
        list: cli.list,
        firmware: cli.firmware,
        device: cli.device,
        timeout_secs: cli.timeout,
    };

    let mut engine = Engine::new(job);
    let mut platform = NativePlatform::new();

    let code = gcfflash::run(&mut engine, &mut platform);
    debug!("event loop finished, exit code {code}");

    if code != 0 {
        process::exit(code);
    }

    Ok(())
}
