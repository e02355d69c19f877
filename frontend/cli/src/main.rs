use bwflash_core::{flasher, link, Callbacks, Options};
use clap::Parser;
use indicatif::ProgressBar;
use std::{path::PathBuf, process::ExitCode};

/// Firmware flasher for Brightway and Leqi scooter motor controllers.
#[derive(Parser)]
#[command(name = "bwflash")]
struct Args {
    /// Firmware file (raw image or vendor bundle)
    fw_file: PathBuf,

    /// Serial port
    #[arg(long, default_value = link::DEFAULT_PORT)]
    port: String,

    /// Flash against the built-in device simulator instead of hardware
    #[arg(long)]
    simulation: bool,

    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

#[cfg(feature = "log")]
fn init_logger(debug: bool) -> slog::Logger {
    use slog::Drain;

    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator)
        .use_custom_timestamp(|_: &mut dyn std::io::Write| Ok(()))
        .build()
        .fuse();
    let drain = drain
        .filter_level(if debug {
            slog::Level::Trace
        } else {
            slog::Level::Info
        })
        .fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

fn run(args: &Args) -> Result<(), flasher::Error> {
    let bar = ProgressBar::new(100);

    let mut options = Options::new(args.port.clone());
    options.simulation = args.simulation;
    options.debug = args.debug;
    #[cfg(feature = "log")]
    {
        options.logger = init_logger(args.debug);
    }

    let log_bar = bar.clone();
    let status_bar = bar.clone();
    let progress_bar = bar.clone();
    options.callbacks = Callbacks::new()
        .on_log(move |message| log_bar.println(message))
        .on_status(move |message| status_bar.println(message))
        .on_progress(move |percent| progress_bar.set_position(percent as u64));

    let mut flasher = flasher::create(&args.fw_file, options)?;

    let info = flasher.info();
    bar.println(format!("Firmware: {} ({} bytes)", info.kind.name(), info.size));
    if let Some(signature) = &info.signature {
        bar.println(format!("Signature: {signature}"));
    }

    let result = flasher.run();
    bar.finish();
    result
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error}");
            ExitCode::FAILURE
        }
    }
}
