mod monitoring;

use clap::Parser;
use s1flash::{FlashOptions, Flasher};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(version, about = "cli for flashing Xperia phones in S1 boot mode", long_about = None)]
struct Args {
  /// Firmware directory to flash.
  #[arg(short, long)]
  dir: Option<PathBuf>,
  /// Test level: 0 flashes for real, 1 uploads but skips destructive
  /// commands, 100+ validates the directory without a device.
  #[arg(short, long, default_value_t = 1)]
  test: u32,
  /// Override both timeouts, in milliseconds.
  #[arg(short = 'T', long)]
  timeout: Option<u64>,
  /// Read timeout in milliseconds.
  #[arg(long, default_value_t = 4000)]
  rt: u64,
  /// Write timeout in milliseconds.
  #[arg(long, default_value_t = 4000)]
  wt: u64,
  /// Timeout for the final Sync command, in seconds.
  #[arg(short = 'S', long, default_value_t = 30)]
  sync: u64,
  /// Erase user data: also process files marked NOERASE in update.xml.
  #[arg(short, long = "eud")]
  eud: bool,
  /// Verbosity: 0 info, 1 debug.
  #[arg(short, long, default_value_t = 1)]
  verbose: u32,
}

fn main() -> ExitCode {
  let args = Args::parse();
  monitoring::init_logger(args.verbose > 0);

  let Some(dir) = args.dir else {
    tracing::error!("working directory not specified");
    return ExitCode::from(1);
  };
  if !dir.is_dir() {
    tracing::error!("working directory {:?} not found", dir);
    return ExitCode::from(1);
  }

  let (rt, wt) = match args.timeout {
    Some(timeout) => (timeout, timeout),
    None => (args.rt, args.wt),
  };
  tracing::info!("set read  timeout = {} ms", rt);
  tracing::info!("set write timeout = {} ms", wt);

  let opts = FlashOptions {
    test: args.test,
    read_timeout_ms: rt,
    write_timeout_ms: wt,
    sync_timeout_secs: args.sync,
    erase_user_data: args.eud,
  };

  match flash(dir, opts) {
    Ok(()) => {
      tracing::info!("done!");
      ExitCode::SUCCESS
    }
    Err(err) => {
      tracing::error!("==== CRITICAL ERROR ====");
      tracing::error!("failed to flash device: {}", err);
      tracing::error!("error detail: {:?}", err);
      ExitCode::from(2)
    }
  }
}

fn flash(dir: PathBuf, opts: FlashOptions) -> s1flash::Result<()> {
  let mut flasher = Flasher::from_directory(dir, opts, None)?;
  flasher.flash()
}
