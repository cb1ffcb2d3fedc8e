//! Minimal reader for the `pci.ids` vendor/device name database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{PciDevError, Result};

/// Locations distributions install `pci.ids` to, in lookup order.
pub(crate) const PCI_IDS_SEARCH_PATHS: &[&str] = &[
    "/usr/share/hwdata/pci.ids",
    "/usr/share/misc/pci.ids",
    "/usr/share/pci.ids",
    "/usr/share/pciids/pci.ids",
];

#[derive(Debug, Default)]
struct Vendor {
    name: String,
    devices: HashMap<u16, String>,
}

#[derive(Debug, Default)]
pub(crate) struct PciIds {
    vendors: HashMap<u16, Vendor>,
}

impl PciIds {
    /// Parses the vendor section. Subsystem lines and the class section that follows the vendors
    /// are ignored, as are lines that do not parse.
    pub(crate) fn parse(text: &str) -> Self {
        let mut ids = Self::default();
        let mut current: Option<u16> = None;

        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with("C ") {
                break;
            }

            if let Some(rest) = line.strip_prefix('\t') {
                if rest.starts_with('\t') {
                    continue;
                }
                let (Some(vendor), Some((id, name))) = (current, split_entry(rest)) else {
                    continue;
                };
                if let Some(vendor) = ids.vendors.get_mut(&vendor) {
                    vendor.devices.insert(id, name.to_string());
                }
            } else if let Some((id, name)) = split_entry(line) {
                ids.vendors.insert(
                    id,
                    Vendor {
                        name: name.to_string(),
                        devices: HashMap::new(),
                    },
                );
                current = Some(id);
            } else {
                current = None;
            }
        }

        ids
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| PciDevError::io("read", path, err))?;
        let ids = Self::parse(&text);
        tracing::debug!(path = %path.display(), vendors = ids.vendors.len(), "loaded pci.ids");
        Ok(ids)
    }

    /// Loads the first database found on the standard search paths.
    pub(crate) fn load_default() -> Option<Self> {
        let path = PCI_IDS_SEARCH_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())?;
        match Self::load(&path) {
            Ok(ids) => Some(ids),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable pci.ids");
                None
            }
        }
    }

    /// `"<vendor> <device>"`, or `"<vendor> Device <id>"` when only the vendor is known.
    pub(crate) fn lookup(&self, vendor_id: u16, device_id: u16) -> Option<String> {
        let vendor = self.vendors.get(&vendor_id)?;
        Some(match vendor.devices.get(&device_id) {
            Some(device) => format!("{} {device}", vendor.name),
            None => format!("{} Device {device_id:04x}", vendor.name),
        })
    }
}

fn split_entry(line: &str) -> Option<(u16, &str)> {
    let (id, name) = line.split_once(char::is_whitespace)?;
    if id.len() != 4 {
        return None;
    }
    let id = u16::from_str_radix(id, 16).ok()?;
    Some((id, name.trim()))
}
