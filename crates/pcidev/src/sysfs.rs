//! [`PciAccess`] backed by the Linux sysfs PCI tree.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::access::{
    AccessWidth, PciAccess, PciDeviceInfo, PCI_BASE_ADDRESS_0, PCI_CLASS_REVISION, PCI_COMMAND,
    PCI_DEVICE_ID, PCI_HEADER_TYPE, PCI_HEADER_TYPE_BRIDGE, PCI_NUM_BARS, PCI_ROM_ADDRESS,
    PCI_ROM_ADDRESS1, PCI_VENDOR_ID,
};
use crate::ids::PciIds;
use crate::{PciBdf, PciDevError, Result};

/// Bytes of config space every user can read from a sysfs `config` file.
const PCI_STD_HEADER_SIZE: usize = 64;

/// Enumeration snapshot of `/sys/bus/pci/devices` (or a tree laid out the same way).
///
/// The device list is read once by [`SysfsPciAccess::scan`]. Config accesses go straight to each
/// device's `config` file with positioned I/O.
#[derive(Debug)]
pub struct SysfsPciAccess {
    root: PathBuf,
    devices: Vec<PciDeviceInfo>,
    ids: Option<PciIds>,
}

impl SysfsPciAccess {
    /// Scans `root` for `dddd:bb:dd.f` entries and loads the system `pci.ids` if one is
    /// installed.
    pub fn scan(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let entries = fs::read_dir(&root).map_err(|err| PciDevError::io("read", &root, err))?;

        let mut devices = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PciDevError::io("read", &root, err))?;
            let name = entry.file_name();
            let Some(bdf) = name.to_str().and_then(PciBdf::parse_sysfs_name) else {
                continue;
            };

            match read_device(&entry.path(), bdf) {
                Ok(Some(info)) => devices.push(info),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(device = %bdf, error = %err, "skipping unreadable PCI device")
                }
            }
        }
        devices.sort_by_key(|dev| dev.bdf);
        tracing::debug!(root = %root.display(), count = devices.len(), "scanned PCI devices");

        Ok(Self {
            root,
            devices,
            ids: PciIds::load_default(),
        })
    }

    /// Replaces the name database with the one at `path`.
    pub fn with_pci_ids(mut self, path: &Path) -> Result<Self> {
        self.ids = Some(PciIds::load(path)?);
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn config_path(&self, bdf: PciBdf) -> PathBuf {
        self.root.join(bdf.sysfs_name()).join("config")
    }
}

impl PciAccess for SysfsPciAccess {
    fn devices(&self) -> Vec<PciDeviceInfo> {
        self.devices.clone()
    }

    fn device(&self, bdf: PciBdf) -> Option<PciDeviceInfo> {
        self.devices.iter().find(|dev| dev.bdf == bdf).cloned()
    }

    fn read_config(&self, bdf: PciBdf, offset: u16, width: AccessWidth) -> Result<u32> {
        let path = self.config_path(bdf);
        let file = fs::File::open(&path).map_err(|err| PciDevError::io("open", &path, err))?;

        let mut buf = [0u8; 4];
        let buf = &mut buf[..width.bytes()];
        let n = file
            .read_at(buf, u64::from(offset))
            .map_err(|err| PciDevError::io("read", &path, err))?;
        if n != buf.len() {
            return Err(PciDevError::ConfigAccess {
                bdf,
                offset,
                reason: format!("short read ({n} of {} bytes)", buf.len()),
            });
        }

        Ok(buf
            .iter()
            .rev()
            .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)))
    }

    fn write_config(
        &mut self,
        bdf: PciBdf,
        offset: u16,
        width: AccessWidth,
        value: u32,
    ) -> Result<()> {
        let path = self.config_path(bdf);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|err| PciDevError::io("open", &path, err))?;

        let bytes = value.to_le_bytes();
        file.write_all_at(&bytes[..width.bytes()], u64::from(offset))
            .map_err(|err| PciDevError::io("write", &path, err))
    }

    fn lookup_name(&self, vendor_id: u16, device_id: u16) -> Option<String> {
        self.ids.as_ref()?.lookup(vendor_id, device_id)
    }
}

/// Builds the enumeration record for one device directory. `None` for functions that do not
/// answer config reads.
fn read_device(dir: &Path, bdf: PciBdf) -> Result<Option<PciDeviceInfo>> {
    let config_path = dir.join("config");
    let config = fs::read(&config_path).map_err(|err| PciDevError::io("read", &config_path, err))?;
    if config.len() < PCI_STD_HEADER_SIZE {
        return Err(PciDevError::ConfigAccess {
            bdf,
            offset: 0,
            reason: format!("config space truncated to {} bytes", config.len()),
        });
    }

    let u16_at = |offset: u16| {
        let offset = usize::from(offset);
        u16::from_le_bytes([config[offset], config[offset + 1]])
    };
    let u32_at = |offset: u16| {
        let offset = usize::from(offset);
        u32::from_le_bytes([
            config[offset],
            config[offset + 1],
            config[offset + 2],
            config[offset + 3],
        ])
    };

    let vendor_id = u16_at(PCI_VENDOR_ID);
    if vendor_id == 0xffff {
        return Ok(None);
    }

    let mut info = PciDeviceInfo::new(bdf, vendor_id, u16_at(PCI_DEVICE_ID));
    info.class = u32_at(PCI_CLASS_REVISION) >> 8;
    info.header_type = config[usize::from(PCI_HEADER_TYPE)];
    info.command = u16_at(PCI_COMMAND);
    for (index, base) in info.base_addr.iter_mut().enumerate() {
        *base = u64::from(u32_at(PCI_BASE_ADDRESS_0 + 4 * index as u16));
    }
    info.rom_base_addr = u64::from(if info.header_type & 0x7f == PCI_HEADER_TYPE_BRIDGE {
        u32_at(PCI_ROM_ADDRESS1)
    } else {
        u32_at(PCI_ROM_ADDRESS)
    });

    let resource_path = dir.join("resource");
    match fs::read_to_string(&resource_path) {
        Ok(table) => {
            let sizes = parse_resource_table(&table);
            for (index, size) in sizes.iter().take(PCI_NUM_BARS).enumerate() {
                info.size[index] = *size;
            }
            if let Some(rom_size) = sizes.get(PCI_NUM_BARS) {
                info.rom_size = *rom_size;
            }
        }
        Err(err) => {
            tracing::debug!(device = %bdf, error = %err, "no resource table, BAR sizes unknown")
        }
    }

    Ok(Some(info))
}

/// Region sizes from a sysfs `resource` table (`start end flags` per line, hex).
fn parse_resource_table(table: &str) -> Vec<u64> {
    table
        .lines()
        .map(|line| {
            let mut fields = line.split_whitespace().map(parse_hex);
            match (fields.next().flatten(), fields.next().flatten()) {
                (Some(start), Some(end)) if end > start => end - start + 1,
                _ => 0,
            }
        })
        .collect()
}

fn parse_hex(field: &str) -> Option<u64> {
    let digits = field.strip_prefix("0x").unwrap_or(field);
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_device(root: &Path, name: &str, config: &[u8], resource: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config"), config).unwrap();
        if let Some(resource) = resource {
            fs::write(dir.join("resource"), resource).unwrap();
        }
    }

    fn config(vendor: u16, device: u16, header_type: u8) -> Vec<u8> {
        let mut config = vec![0u8; 256];
        config[0..2].copy_from_slice(&vendor.to_le_bytes());
        config[2..4].copy_from_slice(&device.to_le_bytes());
        config[4] = 0x06;
        config[0x0b] = 0x01;
        config[0x0a] = 0x06;
        config[0x0e] = header_type;
        config
    }

    #[test]
    fn resource_table_sizes() {
        let table = "\
0x00000000fe000000 0x00000000fe7fffff 0x0000000000040200
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x000000000000e000 0x000000000000e0ff 0x0000000000040101
";
        assert_eq!(parse_resource_table(table), vec![0x80_0000, 0, 0x100]);
    }

    #[test]
    fn scan_reads_identity_bars_and_sizes() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(0x8086, 0x2922, 0x80);
        cfg[0x24..0x28].copy_from_slice(&0xfebf_f000u32.to_le_bytes());
        write_device(
            root.path(),
            "0000:00:1f.2",
            &cfg,
            Some(
                "0x0 0x0 0x0\n0x0 0x0 0x0\n0x0 0x0 0x0\n0x0 0x0 0x0\n0x0 0x0 0x0\n\
                 0x00000000febff000 0x00000000febff7ff 0x0000000000040200\n",
            ),
        );
        write_device(root.path(), "0000:00:00.0", &config(0x8086, 0x29c0, 0), None);
        fs::create_dir(root.path().join("not-a-device")).unwrap();

        let access = SysfsPciAccess::scan(root.path()).unwrap();
        let devices = access.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].bdf, PciBdf::new(0, 0, 0));

        let ahci = &devices[1];
        assert_eq!((ahci.vendor_id, ahci.device_id), (0x8086, 0x2922));
        assert_eq!(ahci.class, 0x01_0600);
        assert_eq!(ahci.header_type, 0x80);
        assert_eq!(ahci.command, 0x0006);
        assert_eq!(ahci.base_addr[5], 0xfebf_f000);
        assert_eq!(ahci.size[5], 0x800);
    }

    #[test]
    fn config_reads_and_writes_use_positioned_io() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(0x1002, 0x4385, 0);
        cfg[0x40..0x44].copy_from_slice(&0x1122_3344u32.to_le_bytes());
        write_device(root.path(), "0000:00:14.0", &cfg, None);

        let mut access = SysfsPciAccess::scan(root.path()).unwrap();
        let bdf = PciBdf::new(0, 0x14, 0);
        assert_eq!(access.read_config_u32(bdf, 0x40).unwrap(), 0x1122_3344);
        assert_eq!(access.read_config_u16(bdf, 0x42).unwrap(), 0x1122);

        access
            .write_config(bdf, 0x41, AccessWidth::Byte, 0xaa)
            .unwrap();
        assert_eq!(access.read_config_u32(bdf, 0x40).unwrap(), 0x1122_aa44);
        assert_eq!(fs::read(root.path().join("0000:00:14.0/config")).unwrap().len(), 256);
    }

    #[test]
    fn scan_finds_devices_in_wide_domains() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(0x8086, 0x09ab, 0);
        cfg[0x40] = 0x7e;
        write_device(root.path(), "10000:e0:00.0", &cfg, None);
        write_device(root.path(), "0000:00:00.0", &config(0x8086, 0x29c0, 0), None);

        let access = SysfsPciAccess::scan(root.path()).unwrap();
        let devices = access.devices();
        assert_eq!(devices.len(), 2);
        let vmd = PciBdf::with_domain(0x1_0000, 0xe0, 0, 0);
        assert_eq!(devices[1].bdf, vmd);
        assert_eq!(devices[1].device_id, 0x09ab);
        assert_eq!(access.read_config_u8(vmd, 0x40).unwrap(), 0x7e);
    }

    #[test]
    fn short_config_read_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        write_device(root.path(), "0000:00:14.0", &config(0x1002, 0x4385, 0)[..64], None);

        let access = SysfsPciAccess::scan(root.path()).unwrap();
        let err = access
            .read_config(PciBdf::new(0, 0x14, 0), 0x40, AccessWidth::Long)
            .unwrap_err();
        assert!(matches!(err, PciDevError::ConfigAccess { offset: 0x40, .. }));
    }

    #[test]
    fn names_come_from_pci_ids() {
        let root = tempfile::tempdir().unwrap();
        let ids = root.path().join("pci.ids");
        fs::write(&ids, "1002  AMD\n\t4385  SMBus\n").unwrap();

        let access = SysfsPciAccess::scan(root.path())
            .unwrap()
            .with_pci_ids(&ids)
            .unwrap();
        assert_eq!(access.lookup_name(0x1002, 0x4385).as_deref(), Some("AMD SMBus"));
        assert_eq!(access.lookup_name(0x1234, 0x4385), None);
    }

    #[test]
    fn missing_root_reports_os_error() {
        let root = tempfile::tempdir().unwrap();
        let err = SysfsPciAccess::scan(root.path().join("missing")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
