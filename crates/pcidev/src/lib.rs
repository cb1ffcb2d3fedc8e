//! PCI device resolution, BAR mapping and rollback-safe register access for hardware
//! programmers.
//!
//! A programmer driver typically:
//!
//! 1. creates a [`PciSession`] (owner of the enumeration context and the shutdown registry),
//! 2. resolves exactly one supported device from a whitelist via [`PciSession::open_device`]
//!    (or [`PciSession::find_device`] when it only needs the enumerated record),
//! 3. maps a BAR with [`PciDevice::map`] and drives registers through the bounds-checked MMIO
//!    accessors,
//! 4. performs config-space writes through [`PciSession::write_config`], which records the
//!    previous value so [`PciSession::shutdown`] can restore it.
//!
//! The enumeration backend is abstracted by [`PciAccess`]. [`SysfsPciAccess`] talks to Linux
//! sysfs, [`MemoryPciAccess`] is an in-memory bus used by tests and dry runs.

pub mod access;
pub mod bar;
pub mod config;
pub mod device;
pub mod filter;
pub mod memory;
pub mod mmio;
pub mod resolve;
pub mod session;
pub mod shutdown;
pub mod sysfs;
pub mod undo;

mod error;
mod ids;

pub use access::{
    AccessWidth, PciAccess, PciCommand, PciDeviceInfo, PCI_COMMAND, PCI_HEADER_TYPE,
};
pub use bar::{classify_bar, BarInfo, BarKind, BarWidth};
pub use config::PciDevConfig;
pub use device::PciDevice;
pub use error::{PciDevError, Result};
pub use filter::PciFilter;
pub use memory::{ConfigWrite, MemoryDevice, MemoryPciAccess};
pub use mmio::MmioRegion;
pub use resolve::{DeviceEntry, PciMatch, TestStatus};
pub use session::{PciSession, ResolveOptions, DEFAULT_SYSFS_ROOT};
pub use shutdown::{ShutdownAction, ShutdownRegistry, ShutdownReport};
pub use sysfs::SysfsPciAccess;
pub use undo::{ConfigValue, UndoEntry};

/// PCI domain/bus/device/function locator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PciBdf {
    pub domain: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    /// Creates a BDF in PCI domain 0.
    ///
    /// The caller is responsible for ensuring the values are within the PCI ranges:
    /// device < 32, function < 8.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self::with_domain(0, bus, device, function)
    }

    pub const fn with_domain(domain: u32, bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain,
            bus,
            device,
            function,
        }
    }

    /// Parses the sysfs directory name form `dddd:bb:dd.f`. Domains wider than four digits (VMD
    /// domains start at `10000`) are accepted.
    pub fn parse_sysfs_name(name: &str) -> Option<Self> {
        let (domain, rest) = name.split_once(':')?;
        let (bus, rest) = rest.split_once(':')?;
        let (device, function) = rest.split_once('.')?;
        if !(4..=8).contains(&domain.len())
            || bus.len() != 2
            || device.len() != 2
            || function.len() != 1
        {
            return None;
        }

        let bdf = Self {
            domain: u32::from_str_radix(domain, 16).ok()?,
            bus: u8::from_str_radix(bus, 16).ok()?,
            device: u8::from_str_radix(device, 16).ok()?,
            function: u8::from_str_radix(function, 16).ok()?,
        };
        (bdf.device < 32 && bdf.function < 8).then_some(bdf)
    }

    /// Name of this function's directory below `/sys/bus/pci/devices`.
    pub fn sysfs_name(&self) -> String {
        format!(
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl core::fmt::Display for PciBdf {
    /// Formats as `bb:dd.f`, the form operators pass to the `pci=` parameter.
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

#[cfg(test)]
mod tests {
    use super::PciBdf;

    #[test]
    fn sysfs_name_roundtrip() {
        let bdf = PciBdf::with_domain(0x1, 0x3a, 0x1f, 0x7);
        assert_eq!(bdf.sysfs_name(), "0001:3a:1f.7");
        assert_eq!(PciBdf::parse_sysfs_name("0001:3a:1f.7"), Some(bdf));
    }

    #[test]
    fn sysfs_name_accepts_wide_domains() {
        let bdf = PciBdf::parse_sysfs_name("10000:e0:00.0").unwrap();
        assert_eq!(bdf, PciBdf::with_domain(0x1_0000, 0xe0, 0, 0));
        assert_eq!(bdf.sysfs_name(), "10000:e0:00.0");
        assert!(PciBdf::with_domain(0xffff, 0xff, 0x1f, 7) < bdf);
        assert_eq!(PciBdf::parse_sysfs_name("000:00:00.0"), None);
    }

    #[test]
    fn sysfs_name_rejects_out_of_range_fields() {
        assert_eq!(PciBdf::parse_sysfs_name("0000:00:20.0"), None);
        assert_eq!(PciBdf::parse_sysfs_name("0000:00:1f.8"), None);
        assert_eq!(PciBdf::parse_sysfs_name("0000:00:1f"), None);
        assert_eq!(PciBdf::parse_sysfs_name("pci0000:00"), None);
    }

    #[test]
    fn display_uses_operator_form() {
        assert_eq!(PciBdf::new(0, 0x1f, 2).to_string(), "00:1f.2");
    }

    #[test]
    fn ordering_is_domain_then_bus_device_function() {
        let mut bdfs = vec![
            PciBdf::with_domain(1, 0, 0, 0),
            PciBdf::new(0, 2, 1),
            PciBdf::new(0, 2, 0),
            PciBdf::new(0, 1, 7),
        ];
        bdfs.sort();
        assert_eq!(
            bdfs,
            vec![
                PciBdf::new(0, 1, 7),
                PciBdf::new(0, 2, 0),
                PciBdf::new(0, 2, 1),
                PciBdf::with_domain(1, 0, 0, 0),
            ]
        );
    }
}
