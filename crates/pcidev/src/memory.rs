//! In-memory PCI bus implementing [`PciAccess`].
//!
//! Each function is a flat 256-byte type 0/1 config image plus declared BAR sizes. The bus is a
//! cheap shared handle: clones observe the same config images, which lets tests keep a handle
//! after giving one to a [`PciSession`](crate::PciSession) and inspect the result of rollbacks.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::access::{
    AccessWidth, PciAccess, PciDeviceInfo, PCI_BASE_ADDRESS_0, PCI_CLASS_REVISION, PCI_COMMAND,
    PCI_DEVICE_ID, PCI_HEADER_TYPE, PCI_NUM_BARS, PCI_ROM_ADDRESS, PCI_VENDOR_ID,
};
use crate::{PciBdf, PciDevError, Result};

const PCI_CONFIG_SPACE_SIZE: usize = 256;

/// A config-space write observed by [`MemoryPciAccess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigWrite {
    pub bdf: PciBdf,
    pub offset: u16,
    pub width: AccessWidth,
    pub value: u32,
}

/// Builder for one function's config image.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    bar_size: [u64; PCI_NUM_BARS],
    rom_size: u64,
    name: Option<String>,
}

impl MemoryDevice {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut dev = Self {
            bytes: [0u8; PCI_CONFIG_SPACE_SIZE],
            bar_size: [0; PCI_NUM_BARS],
            rom_size: 0,
            name: None,
        };
        dev.put(PCI_VENDOR_ID, &vendor_id.to_le_bytes());
        dev.put(PCI_DEVICE_ID, &device_id.to_le_bytes());
        dev
    }

    pub fn with_header_type(mut self, header_type: u8) -> Self {
        self.bytes[usize::from(PCI_HEADER_TYPE)] = header_type;
        self
    }

    pub fn with_command(mut self, command: u16) -> Self {
        self.put(PCI_COMMAND, &command.to_le_bytes());
        self
    }

    pub fn with_class(mut self, class: u8, subclass: u8, prog_if: u8) -> Self {
        self.bytes[0x09] = prog_if;
        self.bytes[0x0a] = subclass;
        self.bytes[0x0b] = class;
        self
    }

    /// Sets the raw register value and declared size of BAR `index`.
    pub fn with_bar(mut self, index: usize, raw: u32, size: u64) -> Self {
        self.bar_size[index] = size;
        self.with_bar_raw(index, raw)
    }

    /// Sets the raw register value of BAR `index` without declaring a size (e.g. the upper half
    /// of a 64-bit BAR).
    pub fn with_bar_raw(self, index: usize, raw: u32) -> Self {
        assert!(index < PCI_NUM_BARS, "BAR{index} out of range");
        self.with_config_u32(PCI_BASE_ADDRESS_0 + 4 * index as u16, raw)
    }

    pub fn with_rom(mut self, raw: u32, size: u64) -> Self {
        self.rom_size = size;
        self.with_config_u32(PCI_ROM_ADDRESS, raw)
    }

    pub fn with_config_u32(mut self, offset: u16, value: u32) -> Self {
        self.put(offset, &value.to_le_bytes());
        self
    }

    /// Name reported by [`PciAccess::lookup_name`].
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn put(&mut self, offset: u16, data: &[u8]) {
        let offset = usize::from(offset);
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn u16_at(&self, offset: u16) -> u16 {
        let offset = usize::from(offset);
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    fn u32_at(&self, offset: u16) -> u32 {
        let offset = usize::from(offset);
        u32::from_le_bytes([
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ])
    }

    fn info(&self, bdf: PciBdf) -> PciDeviceInfo {
        let mut info = PciDeviceInfo::new(bdf, self.u16_at(PCI_VENDOR_ID), self.u16_at(PCI_DEVICE_ID));
        info.class = self.u32_at(PCI_CLASS_REVISION) >> 8;
        info.header_type = self.bytes[usize::from(PCI_HEADER_TYPE)];
        info.command = self.u16_at(PCI_COMMAND);
        for index in 0..PCI_NUM_BARS {
            info.base_addr[index] = u64::from(self.u32_at(PCI_BASE_ADDRESS_0 + 4 * index as u16));
        }
        info.size = self.bar_size;
        info.rom_base_addr = u64::from(self.u32_at(PCI_ROM_ADDRESS));
        info.rom_size = self.rom_size;
        info
    }
}

#[derive(Default)]
struct MemoryBus {
    devices: BTreeMap<PciBdf, (PciDeviceInfo, MemoryDevice)>,
    writes: Vec<ConfigWrite>,
}

/// Shared handle to an in-memory PCI bus.
#[derive(Clone, Default)]
pub struct MemoryPciAccess {
    inner: Rc<RefCell<MemoryBus>>,
}

impl MemoryPciAccess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a function. The enumeration snapshot is taken now; later config writes do not
    /// update it.
    pub fn add_device(&self, bdf: PciBdf, device: MemoryDevice) {
        let info = device.info(bdf);
        let prev = self.inner.borrow_mut().devices.insert(bdf, (info, device));
        assert!(prev.is_none(), "duplicate PCI BDF {bdf:?}");
    }

    /// Removes a function, as if it had been hot-unplugged.
    pub fn remove_device(&self, bdf: PciBdf) -> bool {
        self.inner.borrow_mut().devices.remove(&bdf).is_some()
    }

    /// Every config write performed so far, oldest first.
    pub fn writes(&self) -> Vec<ConfigWrite> {
        self.inner.borrow().writes.clone()
    }

    /// Current live value of a config dword, bypassing the write journal.
    pub fn config_u32(&self, bdf: PciBdf, offset: u16) -> Option<u32> {
        self.inner
            .borrow()
            .devices
            .get(&bdf)
            .map(|(_, dev)| dev.u32_at(offset))
    }

    fn check_range(bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<usize> {
        let start = usize::from(offset);
        if start + width.bytes() > PCI_CONFIG_SPACE_SIZE {
            return Err(PciDevError::ConfigAccess {
                bdf,
                offset,
                reason: format!("{}-byte access past end of config space", width.bytes()),
            });
        }
        Ok(start)
    }
}

impl PciAccess for MemoryPciAccess {
    fn devices(&self) -> Vec<PciDeviceInfo> {
        self.inner
            .borrow()
            .devices
            .values()
            .map(|(info, _)| info.clone())
            .collect()
    }

    fn device(&self, bdf: PciBdf) -> Option<PciDeviceInfo> {
        self.inner.borrow().devices.get(&bdf).map(|(info, _)| info.clone())
    }

    fn read_config(&self, bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<u32> {
        let start = Self::check_range(bdf, offset, width)?;
        let bus = self.inner.borrow();
        let Some((_, dev)) = bus.devices.get(&bdf) else {
            // All-ones for a non-existent function (common convention).
            return Ok(u32::MAX >> (32 - 8 * width.bytes() as u32));
        };

        let mut value = 0u32;
        for i in 0..width.bytes() {
            value |= u32::from(dev.bytes[start + i]) << (8 * i);
        }
        Ok(value)
    }

    fn write_config(
        &mut self,
        bdf: PciBdf,
        offset: u16,
        width: AccessWidth,
        value: u32,
    ) -> Result<()> {
        let start = Self::check_range(bdf, offset, width)?;
        let mut bus = self.inner.borrow_mut();
        let Some((_, dev)) = bus.devices.get_mut(&bdf) else {
            return Err(PciDevError::DeviceGone(bdf));
        };

        for i in 0..width.bytes() {
            dev.bytes[start + i] = ((value >> (8 * i)) & 0xff) as u8;
        }
        bus.writes.push(ConfigWrite {
            bdf,
            offset,
            width,
            value,
        });
        Ok(())
    }

    fn lookup_name(&self, vendor_id: u16, device_id: u16) -> Option<String> {
        self.inner
            .borrow()
            .devices
            .values()
            .find(|(info, _)| info.vendor_id == vendor_id && info.device_id == device_id)
            .and_then(|(_, dev)| dev.name.clone())
    }
}
