#[macro_use]
extern crate log;

use std::convert::TryFrom;
use std::num::ParseIntError;
use std::path::PathBuf;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use structopt::StructOpt;

use simplelog::{Config, LevelFilter, SimpleLogger};

use stm32_rom_boot::linux::LinuxBootloader;
use stm32_rom_boot::{Erase, Options, MAX_CHUNK};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Show bootloader version, supported commands and chip ID
    Info,

    /// Read memory and print it as hex
    Read {
        /// Start address (0x prefix for hex)
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,

        /// Number of bytes to read
        #[structopt(parse(try_from_str = parse_u32))]
        length: u32,
    },

    /// Write a binary file to memory
    Write {
        /// Start address (0x prefix for hex)
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,

        /// Raw binary image
        file: PathBuf,

        /// Jump to the written image once complete
        #[structopt(long)]
        go: bool,
    },

    /// Erase flash, all of it unless pages are listed
    Erase {
        /// Use the extended (two byte) erase command
        #[structopt(long)]
        extended: bool,

        /// Pages to erase
        #[structopt(parse(try_from_str = parse_u16))]
        pages: Vec<u16>,
    },

    /// Jump to the application with its vector table at the provided address
    Go {
        #[structopt(parse(try_from_str = parse_u32))]
        address: u32,
    },
}

/// Parse decimal or 0x prefixed hex
fn parse_u32(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn parse_u16(s: &str) -> anyhow::Result<u16> {
    Ok(u16::try_from(parse_u32(s)?)?)
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port {} @ {} baud", o.port, o.baud);

    let mut p = LinuxBootloader::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("opening serial port {}", o.port))?;

    info!("Connecting to bootloader");

    p.sync().context("connecting to bootloader")?;

    info!("Bootloader connected!");

    match o.operation {
        Operation::Info => {
            let i = p.get().context("reading bootloader info")?;
            info!("Bootloader version: {}.{}", i.version >> 4, i.version & 0x0F);
            info!("Supported commands: {:02x?}", i.commands);

            let v = p.get_version().context("reading option bytes")?;
            info!("Option bytes: 0x{:02x} 0x{:02x}", v.option1, v.option2);

            let id = p.get_id().context("reading chip ID")?;
            info!("Chip ID: 0x{:04x}", id);
        }
        Operation::Read { address, length } => {
            let mut data = vec![0u8; length as usize];

            for (i, chunk) in data.chunks_mut(MAX_CHUNK).enumerate() {
                let a = address.wrapping_add((i * MAX_CHUNK) as u32);
                p.read_memory(a, chunk)
                    .with_context(|| format!("reading memory at 0x{:08x}", a))?;
            }

            for (i, line) in data.chunks(16).enumerate() {
                println!("{:08x}: {}", address as usize + i * 16, hex::encode(line));
            }
        }
        Operation::Write { address, file, go } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("reading image {}", file.display()))?;

            info!(
                "Writing {} to 0x{:08x}",
                bytefmt::format(data.len() as u64),
                address
            );

            let bar = ProgressBar::new(data.len() as u64);
            bar.set_style(
                ProgressStyle::default_bar().template("{bar:40} {bytes}/{total_bytes} ({eta})"),
            );

            p.write_bulk(address, &data, |n| bar.set_position(n as u64))
                .context("writing memory")?;

            bar.finish_with_message("done");

            if go {
                info!("Starting application at 0x{:08x}", address);
                p.go(address).context("starting application")?;
            }
        }
        Operation::Erase { extended, pages } => {
            let mode = match (extended, pages.is_empty()) {
                (false, true) => Erase::Global,
                (true, true) => Erase::ExtendedGlobal,
                (true, false) => Erase::ExtendedPages(pages),
                (false, false) => {
                    let pages = pages
                        .iter()
                        .map(|p| u8::try_from(*p))
                        .collect::<Result<Vec<_>, _>>()
                        .context("standard erase takes 8-bit page numbers, try --extended")?;
                    Erase::Pages(pages)
                }
            };

            info!("Erasing flash ({:?})", mode);
            p.erase(&mode).context("erasing flash")?;
        }
        Operation::Go { address } => {
            info!("Starting application at 0x{:08x}", address);
            p.go(address).context("starting application")?;
        }
    }

    info!("Done");

    Ok(())
}
