use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

macro_rules! print_pack_status {
    ($bms:expr) => {{
        let status = $bms
            .get_pack_status()
            .await
            .with_context(|| "Cannot get pack status")?;
        if status.protection.any() {
            warn!("Active protections: {}", status.protection.active().join(", "));
        }
        println!("Pack status: {status:?}")
    }};
}
macro_rules! print_cell_voltages {
    ($bms:expr) => {
        println!(
            "Cell voltages: {:?}",
            $bms.get_cell_voltages()
                .await
                .with_context(|| "Cannot get cell voltages")?
        )
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let mut bms = jbdbms_lib::tokio_serial_async::JbdBms::open(&args.device, args.baud_rate)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    bms.set_timeout(args.timeout);
    bms.set_delay(args.delay);

    match args.command {
        CliCommands::Status => print_pack_status!(bms),
        CliCommands::CellVoltages => print_cell_voltages!(bms),
        CliCommands::All => {
            print_pack_status!(bms);
            print_cell_voltages!(bms);
        }
        CliCommands::Read { register } => println!(
            "{:?}",
            bms.request_id(register)
                .await
                .with_context(|| format!("Cannot read register {register:#04X}"))?
        ),
        CliCommands::Daemon {
            output,
            interval,
            metrics,
        } => daemon::run(bms, output, interval, metrics, args.retries).await?,
    }

    Ok(())
}
