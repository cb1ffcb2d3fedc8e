//! Location filter for the `pci=` parameter.

use crate::{PciBdf, PciDevError, Result};

/// Slot filter in `[[domain:]bus:]device[.function]` form.
///
/// Fields are hexadecimal. An empty field or `*` matches anything, so `""` and `"*"` accept
/// every device and `"1f."` matches every function of device 0x1f on any bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PciFilter {
    pub domain: Option<u32>,
    pub bus: Option<u8>,
    pub device: Option<u8>,
    pub function: Option<u8>,
}

impl PciFilter {
    /// Filter that matches every device.
    pub const fn any() -> Self {
        Self {
            domain: None,
            bus: None,
            device: None,
            function: None,
        }
    }

    pub fn parse_slot(slot: &str) -> Result<Self> {
        let mut filter = Self::any();

        let (head, mid) = match slot.rsplit_once(':') {
            Some((head, mid)) => (Some(head), mid),
            None => (None, slot),
        };

        if let Some(head) = head {
            let bus = match head.split_once(':') {
                Some((domain, bus)) => {
                    filter.domain = parse_field(domain, 0x7fff_ffff, "Invalid domain number")?;
                    bus
                }
                None => head,
            };
            filter.bus = parse_field(bus, 0xff, "Invalid bus number")?.map(|v| v as u8);
        }

        let (device, function) = match mid.split_once('.') {
            Some((device, function)) => (device, Some(function)),
            None => (mid, None),
        };
        filter.device = parse_field(device, 0x1f, "Invalid slot number")?.map(|v| v as u8);
        if let Some(function) = function {
            filter.function = parse_field(function, 7, "Invalid function number")?.map(|v| v as u8);
        }

        Ok(filter)
    }

    pub fn matches(&self, bdf: PciBdf) -> bool {
        self.domain.map_or(true, |d| d == bdf.domain)
            && self.bus.map_or(true, |b| b == bdf.bus)
            && self.device.map_or(true, |d| d == bdf.device)
            && self.function.map_or(true, |f| f == bdf.function)
    }
}

impl core::str::FromStr for PciFilter {
    type Err = PciDevError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_slot(s)
    }
}

fn parse_field(field: &str, max: u32, err: &str) -> Result<Option<u32>> {
    if field.is_empty() || field == "*" {
        return Ok(None);
    }
    match u32::from_str_radix(field, 16) {
        Ok(v) if v <= max => Ok(Some(v)),
        _ => Err(PciDevError::InvalidFilter(format!("{err}: {field:?}"))),
    }
}
