//! Interface to the device-enumeration / config-space collaborator.

use bitflags::bitflags;

use crate::{PciBdf, Result};

pub const PCI_VENDOR_ID: u16 = 0x00;
pub const PCI_DEVICE_ID: u16 = 0x02;
pub const PCI_COMMAND: u16 = 0x04;
pub const PCI_CLASS_REVISION: u16 = 0x08;
pub const PCI_HEADER_TYPE: u16 = 0x0E;
pub const PCI_BASE_ADDRESS_0: u16 = 0x10;
pub const PCI_BASE_ADDRESS_1: u16 = 0x14;
pub const PCI_BASE_ADDRESS_2: u16 = 0x18;
pub const PCI_BASE_ADDRESS_3: u16 = 0x1C;
pub const PCI_BASE_ADDRESS_4: u16 = 0x20;
pub const PCI_BASE_ADDRESS_5: u16 = 0x24;
/// Expansion ROM base for type 0 headers.
pub const PCI_ROM_ADDRESS: u16 = 0x30;
/// Expansion ROM base for type 1 (bridge) headers.
pub const PCI_ROM_ADDRESS1: u16 = 0x38;

pub const PCI_HEADER_TYPE_NORMAL: u8 = 0;
pub const PCI_HEADER_TYPE_BRIDGE: u8 = 1;
pub const PCI_HEADER_TYPE_CARDBUS: u8 = 2;
pub const PCI_HEADER_TYPE_MULTIFUNCTION: u8 = 0x80;

/// Number of standard BARs in a type 0 header.
pub const PCI_NUM_BARS: usize = 6;

bitflags! {
    /// Bits of the PCI command register this crate cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        const IO = 1 << 0;
        const MEMORY = 1 << 1;
        const MASTER = 1 << 2;
    }
}

/// Width of a config-space access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
    Long,
}

impl AccessWidth {
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Long => 4,
        }
    }
}

/// Snapshot of an enumerated device, as filled in by the collaborator at scan time.
///
/// Register writes change the live hardware only; code that needs fresh values must re-read
/// through [`PciAccess::read_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDeviceInfo {
    pub bdf: PciBdf,
    pub vendor_id: u16,
    pub device_id: u16,
    /// Class code in bits 23:0 (`class << 16 | subclass << 8 | prog_if`).
    pub class: u32,
    pub header_type: u8,
    pub command: u16,
    /// Raw BAR register values. For the high dword of a 64-bit BAR this holds the raw upper half.
    pub base_addr: [u64; PCI_NUM_BARS],
    /// Declared BAR sizes in bytes, 0 when the BAR is unimplemented.
    pub size: [u64; PCI_NUM_BARS],
    pub rom_base_addr: u64,
    pub rom_size: u64,
}

impl PciDeviceInfo {
    pub fn new(bdf: PciBdf, vendor_id: u16, device_id: u16) -> Self {
        Self {
            bdf,
            vendor_id,
            device_id,
            class: 0,
            header_type: PCI_HEADER_TYPE_NORMAL,
            command: 0,
            base_addr: [0; PCI_NUM_BARS],
            size: [0; PCI_NUM_BARS],
            rom_base_addr: 0,
            rom_size: 0,
        }
    }

    pub fn command_flags(&self) -> PciCommand {
        PciCommand::from_bits_truncate(self.command)
    }
}

/// Device enumeration and raw config-space access.
///
/// Implementations own the list of discovered devices. The core never rescans: `devices()` is
/// expected to return the same records, in bus order, for the lifetime of the context.
pub trait PciAccess {
    fn devices(&self) -> Vec<PciDeviceInfo>;

    fn device(&self, bdf: PciBdf) -> Option<PciDeviceInfo> {
        self.devices().into_iter().find(|dev| dev.bdf == bdf)
    }

    /// Reads `width` bytes of config space at `offset`, zero-extended to `u32`.
    fn read_config(&self, bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<u32>;

    /// Writes the low `width` bytes of `value` at `offset`.
    fn write_config(&mut self, bdf: PciBdf, offset: u16, width: AccessWidth, value: u32)
        -> Result<()>;

    /// Human-readable "vendor device" name from the ID database, if one is available.
    fn lookup_name(&self, _vendor_id: u16, _device_id: u16) -> Option<String> {
        None
    }

    fn read_config_u8(&self, bdf: PciBdf, offset: u16) -> Result<u8> {
        Ok(self.read_config(bdf, offset, AccessWidth::Byte)? as u8)
    }

    fn read_config_u16(&self, bdf: PciBdf, offset: u16) -> Result<u16> {
        Ok(self.read_config(bdf, offset, AccessWidth::Word)? as u16)
    }

    fn read_config_u32(&self, bdf: PciBdf, offset: u16) -> Result<u32> {
        self.read_config(bdf, offset, AccessWidth::Long)
    }
}

impl<A: PciAccess + ?Sized> PciAccess for Box<A> {
    fn devices(&self) -> Vec<PciDeviceInfo> {
        (**self).devices()
    }

    fn device(&self, bdf: PciBdf) -> Option<PciDeviceInfo> {
        (**self).device(bdf)
    }

    fn read_config(&self, bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<u32> {
        (**self).read_config(bdf, offset, width)
    }

    fn write_config(
        &mut self,
        bdf: PciBdf,
        offset: u16,
        width: AccessWidth,
        value: u32,
    ) -> Result<()> {
        (**self).write_config(bdf, offset, width, value)
    }

    fn lookup_name(&self, vendor_id: u16, device_id: u16) -> Option<String> {
        (**self).lookup_name(vendor_id, device_id)
    }
}
