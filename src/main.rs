#![deny(unused_must_use)]

use std::num::ParseIntError;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dapwire::cmsisdap::tools::{list_probes, open_probe, ProbeSelector};
use dapwire::firmware::{FirmwareImage, FirmwareUpdater};
use dapwire::{Config, Session, WireProtocol};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Talk to CMSIS-DAP debug probes")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "DAPWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Probe to use, as VID:PID[:SERIAL].
    #[arg(long)]
    probe: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached probes.
    List,
    /// Show what the probe reports about itself.
    Info,
    /// Read target memory and print it as hex.
    Read {
        #[arg(value_parser = parse_u32)]
        address: u32,
        #[arg(value_parser = parse_u32)]
        len: u32,
        #[arg(long)]
        protocol: Option<WireProtocol>,
    },
    /// Replace the probe firmware.
    UpdateFirmware {
        image: PathBuf,
        /// Expected CRC-32 of the image.
        #[arg(long, value_parser = parse_u32)]
        checksum: Option<u32>,
    },
}

fn parse_u32(s: &str) -> Result<u32, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    let selector = match cli.probe.as_deref().or(config.probe.selector.as_deref()) {
        Some(s) => Some(s.parse::<ProbeSelector>()?),
        None => None,
    };
    let open = || open_probe(selector.as_ref(), config.probe.timeout());

    match cli.command {
        Command::List => {
            let probes = list_probes();
            if probes.is_empty() {
                println!("No CMSIS-DAP probes found");
            }
            for (i, probe) in probes.iter().enumerate() {
                println!("[{i}]: {probe}");
            }
        }
        Command::Info => {
            let mut session = Session::new(open()?, config.clone());
            print!("{}", session.probe_info()?);
            let caps = session.capabilities()?;
            println!("Packet size: {} x {}", caps.packet_size, caps.packet_count);
            println!("Protocols: {:?}", caps.protocols());
            println!("Multi-drop: {}", caps.multidrop);
            if let Some(size) = caps.swo_buffer_size {
                println!("SWO buffer: {} bytes", size);
            }
        }
        Command::Read { address, len, protocol } => {
            let mut session = Session::new(open()?, config.clone());
            let protocol = session.connect(protocol)?;
            tracing::info!("Connected over {}, DPIDR {:#010x}", protocol, session.idcode().unwrap_or(0));

            let data = session.read_memory(address, len as usize)?;
            for (i, line) in data.chunks(16).enumerate() {
                let bytes: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
                println!("{:08x}: {}", address as usize + 16 * i, bytes.join(" "));
            }
            session.disconnect()?;
        }
        Command::UpdateFirmware { image, checksum } => {
            let data = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let image = match checksum {
                Some(checksum) => FirmwareImage::with_checksum(data, checksum)?,
                None => FirmwareImage::new(data)?,
            };
            let mut updater = FirmwareUpdater::new(open()?, config.firmware.clone());
            updater.update(&image)?;
            println!("Firmware updated ({} bytes, CRC {:#010x})", image.data().len(), image.checksum());
        }
    }

    Ok(())
}
