use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mdflasher::firmware::SimConfig;
use mdflasher::ownership::RealOwner;
use mdflasher::transport::SimTransport;
use mdflasher::{CancelToken, Flashing, Reporter, Timing, Transport};

#[derive(Parser)]
#[command(
    name = "mdflasher",
    version,
    about = "Dump and program Mega Drive / Genesis cartridges with the FlashMaster MD dumper"
)]
struct Cli {
    /// Debug logging, and show every line the dumper prints
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this CDC-ACM serial port instead of claiming the USB interface
    #[arg(long, global = true, value_name = "PORT", conflicts_with = "simulate")]
    serial: Option<String>,

    /// Run against a simulated cartridge instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the dumper answers
    Connect,
    /// Read the flash chip manufacturer/device ID
    #[command(alias = "id")]
    CheckId,
    /// Reset the dumper's receive buffer
    #[command(alias = "clear")]
    ClearBuffer,
    /// Dump the cartridge ROM to a file
    ReadRom {
        path: String,
        /// Size in KB, 0 reads 4M and trims the padding
        #[arg(short, long, default_value_t = 0)]
        size: u32,
        /// Keep the file at exactly the requested size
        #[arg(short, long)]
        no_trim: bool,
    },
    /// Program a ROM image into an erased cartridge
    WriteRom {
        path: String,
        /// Only write the first KB of the image, 0 writes all of it
        #[arg(short, long, default_value_t = 0)]
        size: u32,
    },
    /// Dump the 32K save RAM to a file
    ReadSram { path: String },
    /// Restore the save RAM from a file
    WriteSram { path: String },
    /// Erase flash sectors covering a size, or the whole chip
    Erase {
        /// Size in KB, rounded up to a cartridge size; 0 erases everything
        #[arg(short, long, default_value_t = 0)]
        size: u32,
        /// Erase the whole chip and clear the save RAM
        #[arg(short, long)]
        full: bool,
    },
    /// Erase the sector containing a word address
    EraseSector {
        /// Word address, hex
        #[arg(value_parser = parse_hex)]
        address: u32,
    },
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("{}: {}", s, e))
}

/// Progress bar plus plain lines for messages.
#[derive(Default)]
struct CliReporter {
    bar: Option<ProgressBar>,
}

impl CliReporter {
    fn new_bar(total: u64) -> ProgressBar {
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    }
}

impl Reporter for CliReporter {
    fn on_progress(&mut self, done: u64, total: u64) {
        let bar = self.bar.get_or_insert_with(|| Self::new_bar(total));
        bar.set_length(total);
        bar.set_position(done);
        if done >= total {
            if let Some(bar) = self.bar.take() {
                bar.finish();
            }
        }
    }

    fn on_message(&mut self, text: &str, is_error: bool) {
        let print = || {
            if is_error {
                eprintln!("{}", text);
            } else {
                println!("{}", text);
            }
        };
        match &self.bar {
            Some(bar) => bar.suspend(print),
            None => print(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _ = simplelog::TermLogger::init(
        if cli.verbose {
            simplelog::LevelFilter::Debug
        } else {
            simplelog::LevelFilter::Info
        },
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Interrupted, stopping after the current chunk");
        handler_token.cancel();
    })?;

    if cli.simulate {
        log::info!("Using a simulated cartridge");
        let flashing = Flashing::new(SimTransport::new(SimConfig::default()))
            .with_timing(Timing::immediate());
        run(flashing, &cli, &cancel)
    } else if let Some(port) = cli.serial.as_deref() {
        run(Flashing::open_serial(Some(port))?, &cli, &cancel)
    } else {
        run(Flashing::open_usb()?, &cli, &cancel)
    }
}

fn run<T: Transport>(mut flashing: Flashing<T>, cli: &Cli, cancel: &CancelToken) -> Result<()> {
    flashing.set_verbose(cli.verbose);
    if let Some(owner) = RealOwner::from_sudo_env() {
        log::debug!("output files go to uid {} gid {}", owner.uid, owner.gid);
        flashing.set_finisher(Box::new(owner));
    }
    let reporter = &mut CliReporter::default();

    match &cli.command {
        Commands::Connect => flashing.connect(reporter)?,
        Commands::CheckId => match flashing.check_id(reporter)? {
            Some(id) => match id.chip() {
                Some(chip) => log::info!("Flash: {}", chip),
                None => log::warn!("Unknown flash ID 0x{}", id),
            },
            None => log::warn!("Dumper reported no flash ID"),
        },
        Commands::ClearBuffer => flashing.clear_buffer(reporter)?,
        Commands::ReadRom {
            path,
            size,
            no_trim,
        } => {
            flashing.read_rom(path, *size, *no_trim, reporter, cancel)?;
        }
        Commands::WriteRom { path, size } => {
            flashing.write_rom(path, *size, reporter, cancel)?;
        }
        Commands::ReadSram { path } => {
            flashing.read_sram(path, reporter, cancel)?;
        }
        Commands::WriteSram { path } => {
            flashing.write_sram(path, reporter, cancel)?;
        }
        Commands::Erase { size, full } => {
            let size_kb = if *full { 0 } else { *size };
            flashing.erase(size_kb, reporter)?;
        }
        Commands::EraseSector { address } => flashing.erase_sector(*address, reporter)?,
    }

    flashing.close();
    Ok(())
}
