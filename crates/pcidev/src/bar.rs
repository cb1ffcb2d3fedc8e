//! Base Address Register decoding.

use crate::access::{
    PciAccess, PciCommand, PCI_BASE_ADDRESS_0, PCI_BASE_ADDRESS_1, PCI_BASE_ADDRESS_5,
    PCI_COMMAND, PCI_HEADER_TYPE, PCI_HEADER_TYPE_BRIDGE, PCI_HEADER_TYPE_CARDBUS,
    PCI_HEADER_TYPE_MULTIFUNCTION, PCI_HEADER_TYPE_NORMAL, PCI_NUM_BARS, PCI_ROM_ADDRESS,
    PCI_ROM_ADDRESS1,
};
use crate::{PciBdf, PciDevError, Result};

const PCI_BASE_ADDRESS_SPACE_IO: u32 = 0x01;
const PCI_BASE_ADDRESS_MEM_TYPE_MASK: u32 = 0x06;
const PCI_BASE_ADDRESS_MEM_TYPE_32: u32 = 0x00;
const PCI_BASE_ADDRESS_MEM_TYPE_64: u32 = 0x04;
const PCI_BASE_ADDRESS_MEM_PREFETCH: u32 = 0x08;

const PCI_BASE_ADDRESS_MEM_MASK: u64 = !0x0f;
const PCI_BASE_ADDRESS_IO_MASK: u64 = !0x03;
const PCI_ROM_ADDRESS_MASK: u64 = !0x7ff;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BarKind {
    Memory,
    Io,
    Rom,
    Unknown,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BarWidth {
    Bits32,
    Bits64,
}

/// Decoded BAR with all flag bits masked out of `address`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BarInfo {
    pub kind: BarKind,
    pub width: BarWidth,
    pub prefetchable: bool,
    pub address: u64,
}

impl BarInfo {
    const fn unknown() -> Self {
        Self {
            kind: BarKind::Unknown,
            width: BarWidth::Bits32,
            prefetchable: false,
            address: 0,
        }
    }
}

/// Config-space offset of standard BAR `index` (0-5).
pub fn bar_offset(index: usize) -> Result<u16> {
    if index >= PCI_NUM_BARS {
        return Err(PciDevError::InvalidBar(index));
    }
    Ok(PCI_BASE_ADDRESS_0 + 4 * index as u16)
}

/// Decodes the BAR at config offset `offset` of `bdf`, reading live config space.
///
/// Fails with [`PciDevError::BarUnreachable`] when a 64-bit BAR is placed above 4 GiB and this
/// platform's pointers are narrower than 64 bits.
pub fn classify_bar<A: PciAccess + ?Sized>(access: &A, bdf: PciBdf, offset: u16) -> Result<BarInfo> {
    classify_bar_with_native_width(access, bdf, offset, usize::BITS)
}

pub(crate) fn classify_bar_with_native_width<A: PciAccess + ?Sized>(
    access: &A,
    bdf: PciBdf,
    offset: u16,
    native_bits: u32,
) -> Result<BarInfo> {
    let header_type = access.read_config_u8(bdf, PCI_HEADER_TYPE)? & !PCI_HEADER_TYPE_MULTIFUNCTION;
    tracing::trace!(%bdf, "PCI header type 0x{header_type:02x}");

    let raw = access.read_config_u32(bdf, offset)?;
    let kind = bar_kind(header_type, offset, raw);
    let command = PciCommand::from_bits_truncate(access.read_config_u16(bdf, PCI_COMMAND)?);

    let info = match kind {
        BarKind::Memory => {
            if !command.contains(PciCommand::MEMORY) {
                tracing::warn!(
                    %bdf,
                    "MEM BAR access requested, but device has MEM space accesses disabled"
                );
            }

            let prefetchable = raw & PCI_BASE_ADDRESS_MEM_PREFETCH != 0;
            let mem_type = raw & PCI_BASE_ADDRESS_MEM_TYPE_MASK;
            let width = match mem_type {
                PCI_BASE_ADDRESS_MEM_TYPE_64 => BarWidth::Bits64,
                PCI_BASE_ADDRESS_MEM_TYPE_32 => BarWidth::Bits32,
                _ => {
                    tracing::warn!(%bdf, "BAR at 0x{offset:02x} uses reserved memory type 0x{mem_type:x}");
                    BarWidth::Bits32
                }
            };
            tracing::debug!(
                %bdf,
                "requested BAR is of type MEM, {}bit, {}prefetchable",
                match (width, mem_type) {
                    (BarWidth::Bits64, _) => "64",
                    (_, PCI_BASE_ADDRESS_MEM_TYPE_32) => "32",
                    _ => "reserved",
                },
                if prefetchable { "" } else { "not " },
            );

            let mut address = u64::from(raw);
            if width == BarWidth::Bits64 {
                // A 64-bit BAR consumes the next dword as its upper half.
                let upper = access.read_config_u32(bdf, offset + 4)?;
                if upper != 0 {
                    if native_bits < u64::BITS {
                        tracing::error!(%bdf, "BAR at 0x{offset:02x} unreachable");
                        return Err(PciDevError::BarUnreachable {
                            bdf,
                            offset,
                            upper,
                            lower: raw,
                            native_bits,
                        });
                    }
                    address |= u64::from(upper) << 32;
                }
            }

            BarInfo {
                kind,
                width,
                prefetchable,
                address: address & PCI_BASE_ADDRESS_MEM_MASK,
            }
        }
        BarKind::Io => {
            tracing::debug!(%bdf, "requested BAR is of type I/O");
            if !command.contains(PciCommand::IO) {
                tracing::warn!(
                    %bdf,
                    "I/O BAR access requested, but device has I/O space accesses disabled"
                );
            }
            BarInfo {
                kind,
                width: BarWidth::Bits32,
                prefetchable: false,
                address: u64::from(raw) & PCI_BASE_ADDRESS_IO_MASK,
            }
        }
        BarKind::Rom => {
            tracing::debug!(%bdf, "requested BAR is of type ROM");
            if !command.contains(PciCommand::MEMORY) {
                tracing::warn!(
                    %bdf,
                    "ROM BAR access requested, but device has MEM space accesses disabled"
                );
            }
            BarInfo {
                kind,
                width: BarWidth::Bits32,
                prefetchable: false,
                address: u64::from(raw) & PCI_ROM_ADDRESS_MASK,
            }
        }
        BarKind::Unknown => {
            tracing::error!(%bdf, "BAR type unknown, please report a bug");
            BarInfo::unknown()
        }
    };

    Ok(info)
}

fn bar_kind(header_type: u8, offset: u16, raw: u32) -> BarKind {
    let space = if raw & PCI_BASE_ADDRESS_SPACE_IO != 0 {
        BarKind::Io
    } else {
        BarKind::Memory
    };

    match header_type {
        PCI_HEADER_TYPE_NORMAL => match offset {
            PCI_BASE_ADDRESS_0..=PCI_BASE_ADDRESS_5 if offset % 4 == 0 => space,
            PCI_ROM_ADDRESS => BarKind::Rom,
            _ => BarKind::Unknown,
        },
        PCI_HEADER_TYPE_BRIDGE => match offset {
            PCI_BASE_ADDRESS_0 | PCI_BASE_ADDRESS_1 => space,
            PCI_ROM_ADDRESS1 => BarKind::Rom,
            _ => BarKind::Unknown,
        },
        PCI_HEADER_TYPE_CARDBUS => BarKind::Unknown,
        other => {
            tracing::error!(
                "unknown PCI header type 0x{other:02x}, BAR type cannot be determined reliably"
            );
            BarKind::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryDevice, MemoryPciAccess};

    const BDF: PciBdf = PciBdf::new(0, 3, 0);

    fn bus_with(dev: MemoryDevice) -> MemoryPciAccess {
        let bus = MemoryPciAccess::new();
        bus.add_device(BDF, dev);
        bus
    }

    #[test]
    fn mem32_bar_masks_flag_bits() {
        let bus = bus_with(
            MemoryDevice::new(0x8086, 0x1234)
                .with_command(PciCommand::MEMORY.bits())
                .with_bar(0, 0xfebf_0008, 0x1000),
        );
        let info = classify_bar(&bus, BDF, PCI_BASE_ADDRESS_0).unwrap();
        assert_eq!(info.kind, BarKind::Memory);
        assert_eq!(info.width, BarWidth::Bits32);
        assert!(info.prefetchable);
        assert_eq!(info.address, 0xfebf_0000);
    }

    #[test]
    fn mem64_bar_merges_upper_dword() {
        let bus = bus_with(
            MemoryDevice::new(0x8086, 0x1234)
                .with_command(PciCommand::MEMORY.bits())
                .with_bar(2, 0xe000_000c, 0x10_0000)
                .with_bar_raw(3, 0x0000_0038),
        );
        let info = classify_bar_with_native_width(&bus, BDF, 0x18, 64).unwrap();
        assert_eq!(info.width, BarWidth::Bits64);
        assert_eq!(info.address, 0x38_e000_0000);
    }

    #[test]
    fn mem64_bar_with_zero_upper_is_representable_on_narrow_platforms() {
        let bus = bus_with(MemoryDevice::new(0x8086, 0x1234).with_bar(0, 0xd000_0004, 0x1000));
        let info = classify_bar_with_native_width(&bus, BDF, PCI_BASE_ADDRESS_0, 32).unwrap();
        assert_eq!(info.width, BarWidth::Bits64);
        assert_eq!(info.address, 0xd000_0000);
    }

    #[test]
    fn mem64_bar_above_4g_fails_on_narrow_platforms() {
        let bus = bus_with(
            MemoryDevice::new(0x8086, 0x1234)
                .with_bar(0, 0xd000_0004, 0x1000)
                .with_bar_raw(1, 0x1),
        );
        let err = classify_bar_with_native_width(&bus, BDF, PCI_BASE_ADDRESS_0, 32).unwrap_err();
        assert!(matches!(
            err,
            PciDevError::BarUnreachable {
                upper: 1,
                native_bits: 32,
                ..
            }
        ));
    }

    #[test]
    fn reserved_memory_type_is_treated_as_32bit() {
        let bus = bus_with(
            MemoryDevice::new(0x8086, 0x1234)
                .with_bar(0, 0xd000_0002, 0x1000)
                .with_bar_raw(1, 0xffff_ffff),
        );
        let info = classify_bar_with_native_width(&bus, BDF, PCI_BASE_ADDRESS_0, 32).unwrap();
        assert_eq!(info.width, BarWidth::Bits32);
        assert_eq!(info.address, 0xd000_0000);
    }

    #[test]
    fn io_bar_masks_low_two_bits() {
        let bus = bus_with(
            MemoryDevice::new(0x10ec, 0x8139)
                .with_command(PciCommand::IO.bits())
                .with_bar(1, 0xe001, 0x100),
        );
        let info = classify_bar(&bus, BDF, PCI_BASE_ADDRESS_1).unwrap();
        assert_eq!(info.kind, BarKind::Io);
        assert_eq!(info.address, 0xe000);
    }

    #[test]
    fn rom_bar_masks_enable_and_reserved_bits() {
        let bus = bus_with(MemoryDevice::new(0x1002, 0x68f9).with_rom(0xc000_0001, 0x2_0000));
        let info = classify_bar(&bus, BDF, PCI_ROM_ADDRESS).unwrap();
        assert_eq!(info.kind, BarKind::Rom);
        assert_eq!(info.address, 0xc000_0000);
    }

    #[test]
    fn bridge_only_decodes_two_bars_and_rom1() {
        let bus = bus_with(
            MemoryDevice::new(0x8086, 0x244e)
                .with_header_type(PCI_HEADER_TYPE_BRIDGE | PCI_HEADER_TYPE_MULTIFUNCTION)
                .with_bar(1, 0xf000_0000, 0x1000)
                .with_bar_raw(2, 0xf100_0000)
                .with_config_u32(PCI_ROM_ADDRESS1, 0xfff0_0001),
        );
        assert_eq!(
            classify_bar(&bus, BDF, PCI_BASE_ADDRESS_1).unwrap().kind,
            BarKind::Memory
        );
        assert_eq!(
            classify_bar(&bus, BDF, 0x18).unwrap(),
            BarInfo::unknown()
        );
        let rom = classify_bar(&bus, BDF, PCI_ROM_ADDRESS1).unwrap();
        assert_eq!(rom.kind, BarKind::Rom);
        assert_eq!(rom.address, 0xfff0_0000);
    }

    #[test]
    fn cardbus_and_unknown_headers_yield_unknown_with_zero_address() {
        for header in [PCI_HEADER_TYPE_CARDBUS, 0x7f] {
            let bus = bus_with(
                MemoryDevice::new(0x104c, 0xac56)
                    .with_header_type(header)
                    .with_bar(0, 0xf000_0000, 0x1000),
            );
            assert_eq!(
                classify_bar(&bus, BDF, PCI_BASE_ADDRESS_0).unwrap(),
                BarInfo::unknown()
            );
        }
    }

    #[test]
    fn non_bar_offset_is_unknown() {
        let bus = bus_with(MemoryDevice::new(0x8086, 0x1234).with_bar(0, 0xf000_0000, 0x1000));
        assert_eq!(classify_bar(&bus, BDF, 0x2c).unwrap(), BarInfo::unknown());
        assert_eq!(classify_bar(&bus, BDF, 0x12).unwrap(), BarInfo::unknown());
    }

    #[test]
    fn decoding_disabled_is_advisory_only() {
        let bus = bus_with(MemoryDevice::new(0x8086, 0x1234).with_bar(0, 0xf000_0000, 0x1000));
        let info = classify_bar(&bus, BDF, PCI_BASE_ADDRESS_0).unwrap();
        assert_eq!(info.address, 0xf000_0000);
    }

    #[test]
    fn bar_offset_rejects_index_past_bar5() {
        assert_eq!(bar_offset(0).unwrap(), 0x10);
        assert_eq!(bar_offset(5).unwrap(), 0x24);
        assert!(matches!(bar_offset(6), Err(PciDevError::InvalidBar(6))));
    }
}
