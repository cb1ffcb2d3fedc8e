use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context};
use clap::Parser;
use pcidev::access::{
    PCI_HEADER_TYPE, PCI_HEADER_TYPE_BRIDGE, PCI_HEADER_TYPE_NORMAL, PCI_NUM_BARS,
    PCI_ROM_ADDRESS, PCI_ROM_ADDRESS1,
};
use pcidev::bar::bar_offset;
use pcidev::{
    classify_bar, BarInfo, BarKind, BarWidth, PciAccess, PciDevConfig, PciDevError, PciFilter,
    PciMatch, PciSession, SysfsPciAccess, TestStatus,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "pcidev-probe",
    version,
    about = "Resolve exactly one supported PCI device, show its BARs and optionally read a register through a mapped BAR."
)]
struct Args {
    /// Supported device as VVVV:DDDD (hex). Repeat to accept several devices.
    #[arg(long = "id", value_name = "VVVV:DDDD", required = true)]
    ids: Vec<DeviceId>,

    /// Only consider devices at this location ([[domain:]bus:]device[.function], hex).
    ///
    /// Falls back to `PCIDEV_PCI`.
    #[arg(long, value_name = "BB:DD.F")]
    pci: Option<String>,

    /// BAR mapped by --read (0-5)
    #[arg(long, default_value_t = 0)]
    bar: usize,

    /// Directory holding one entry per PCI function.
    ///
    /// Falls back to `PCIDEV_SYSFS_ROOT`, then `/sys/bus/pci/devices`.
    #[arg(long, value_name = "PATH")]
    sysfs_root: Option<PathBuf>,

    /// pci.ids database used for device names.
    ///
    /// Falls back to `PCIDEV_PCI_IDS`, then the usual distribution locations.
    #[arg(long, value_name = "PATH")]
    pci_ids: Option<PathBuf>,

    /// Map --bar and read the dword at this byte offset (decimal or 0x-prefixed hex)
    #[arg(long, value_name = "OFFSET", value_parser = parse_offset)]
    read: Option<usize>,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    #[arg(long, env = "PCIDEV_LOG", default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy)]
struct DeviceId {
    vendor: u16,
    device: u16,
}

impl FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vendor, device) = s
            .split_once(':')
            .ok_or_else(|| format!("expected VVVV:DDDD, got {s:?}"))?;
        let parse = |field: &str| {
            u16::from_str_radix(field, 16).map_err(|err| format!("invalid ID {field:?}: {err}"))
        };
        Ok(Self {
            vendor: parse(vendor)?,
            device: parse(device)?,
        })
    }
}

fn parse_offset(s: &str) -> Result<usize, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|err| format!("invalid offset {s:?}: {err}"))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).context("invalid --log-level")?)
        .with_writer(std::io::stderr)
        .init();

    run(args)
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = PciDevConfig::from_env().context("invalid PCIDEV_* environment")?;
    if let Some(root) = args.sysfs_root {
        config.sysfs_root = root;
    }
    if let Some(path) = args.pci_ids {
        config.pci_ids = Some(path);
    }
    if let Some(slot) = &args.pci {
        config.filter = Some(PciFilter::parse_slot(slot)?);
    }

    let matches: Vec<PciMatch<()>> = args
        .ids
        .iter()
        .map(|id| PciMatch::new(id.vendor, id.device, TestStatus::Ok, ()))
        .collect();

    let mut session: PciSession<SysfsPciAccess> = config.session();
    let access = config
        .open_access()
        .with_context(|| format!("scan {}", config.sysfs_root.display()))?;
    let mut dev = session.open_device(access, &matches, &config.resolve_options())?;

    println!(
        "{} {:04x}:{:04x} \"{}\"",
        dev.bdf(),
        dev.vendor_id(),
        dev.device_id(),
        dev.name()
    );

    let access = session.access()?;
    let header_type = access.read_config_u8(dev.bdf(), PCI_HEADER_TYPE)? & 0x7f;
    let (bar_count, rom_offset) = match header_type {
        PCI_HEADER_TYPE_NORMAL => (PCI_NUM_BARS, Some(PCI_ROM_ADDRESS)),
        PCI_HEADER_TYPE_BRIDGE => (2, Some(PCI_ROM_ADDRESS1)),
        other => {
            println!("header type 0x{other:02x}: BARs not decoded");
            (0, None)
        }
    };

    let mut index = 0;
    while index < bar_count {
        let offset = bar_offset(index)?;
        let step = match classify_bar(access, dev.bdf(), offset) {
            Ok(bar) => {
                println!("BAR{index}: {}", describe(&bar));
                if bar.width == BarWidth::Bits64 {
                    2
                } else {
                    1
                }
            }
            Err(err) => {
                println!("BAR{index}: {err}");
                if matches!(err, PciDevError::BarUnreachable { .. }) {
                    2
                } else {
                    1
                }
            }
        };
        index += step;
    }
    if let Some(offset) = rom_offset {
        let rom = classify_bar(access, dev.bdf(), offset)?;
        println!("ROM: {}", describe(&rom));
    }

    if let Some(offset) = args.read {
        tracing::debug!(bar = args.bar, "mapping BAR for register read at 0x{offset:x}");
        dev.map(args.bar)
            .with_context(|| format!("map BAR{} of {}", args.bar, dev.bdf()))?;
        let value = dev.read_u32(offset)?;
        println!("BAR{}[0x{offset:x}] = 0x{value:08x}", args.bar);
    }

    dev.close().context("restore device state")?;
    let report = session.shutdown();
    tracing::debug!(executed = report.executed, "session closed");
    if !report.is_clean() {
        bail!("{} of {} shutdown actions failed", report.failed, report.executed);
    }
    Ok(())
}

fn describe(bar: &BarInfo) -> String {
    let kind = match bar.kind {
        BarKind::Memory => "memory",
        BarKind::Io => "I/O",
        BarKind::Rom => "ROM",
        BarKind::Unknown => return "unknown".to_string(),
    };
    let width = match bar.width {
        BarWidth::Bits32 => "32-bit",
        BarWidth::Bits64 => "64-bit",
    };
    let prefetch = if bar.prefetchable { ", prefetchable" } else { "" };
    format!("{kind} {width} 0x{:x}{prefetch}", bar.address)
}
