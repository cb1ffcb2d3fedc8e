//! Resolved device handle: sysfs enable state and BAR mapping.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::access::{PciDeviceInfo, PCI_NUM_BARS};
use crate::mmio::MmioRegion;
use crate::{PciBdf, PciDevError, Result};

/// A device resolved by [`PciSession::open_device`](crate::PciSession::open_device).
///
/// The handle owns the BAR mapping and the enable state it changed. Dropping it (or calling
/// [`PciDevice::close`]) unmaps first and then restores the original enable state; a device that
/// was already enabled when it was opened is never disabled.
#[derive(Debug)]
pub struct PciDevice<T = ()> {
    name: String,
    info: PciDeviceInfo,
    sysfs_path: PathBuf,
    mmio: Option<MmioRegion>,
    enabled: bool,
    was_disabled: bool,
    closed: bool,
    private: T,
}

impl<T> PciDevice<T> {
    pub(crate) fn new(name: String, info: PciDeviceInfo, sysfs_path: PathBuf, private: T) -> Self {
        Self {
            name,
            info,
            sysfs_path,
            mmio: None,
            enabled: false,
            was_disabled: false,
            closed: false,
            private,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor_id(&self) -> u16 {
        self.info.vendor_id
    }

    pub fn device_id(&self) -> u16 {
        self.info.device_id
    }

    pub fn bdf(&self) -> PciBdf {
        self.info.bdf
    }

    /// Enumeration-time snapshot of the device.
    pub fn info(&self) -> &PciDeviceInfo {
        &self.info
    }

    /// The device's kernel resource directory.
    pub fn sysfs_path(&self) -> &Path {
        &self.sysfs_path
    }

    pub fn private(&self) -> &T {
        &self.private
    }

    pub fn private_mut(&mut self) -> &mut T {
        &mut self.private
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether this process found the device disabled and enabled it.
    pub fn was_disabled(&self) -> bool {
        self.was_disabled
    }

    pub fn mmio(&self) -> Option<&MmioRegion> {
        self.mmio.as_ref()
    }

    pub fn mmio_mut(&mut self) -> Option<&mut MmioRegion> {
        self.mmio.as_mut()
    }

    /// Length of the current mapping, 0 when nothing is mapped.
    pub fn mapped_len(&self) -> usize {
        self.mmio.as_ref().map_or(0, MmioRegion::len)
    }

    /// Sets the sysfs `enable` flag if it is clear, remembering that it has to be cleared again
    /// on teardown.
    pub fn enable(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        let path = self.sysfs_path.join("enable");
        let file = open_rw(&path)?;
        match read_flag(&file, &path)? {
            b'0' => {
                write_flag(&file, &path, b'1')?;
                self.was_disabled = true;
            }
            b'1' => {}
            other => return Err(invalid_flag(path, other)),
        }

        tracing::debug!(device = %self.info.bdf, was_disabled = self.was_disabled, "device enabled");
        self.enabled = true;
        Ok(())
    }

    /// Clears the sysfs `enable` flag, but only if [`PciDevice::enable`] set it.
    pub fn disable(&mut self) -> Result<()> {
        if !self.enabled || !self.was_disabled {
            return Ok(());
        }

        let path = self.sysfs_path.join("enable");
        let file = open_rw(&path)?;
        match read_flag(&file, &path)? {
            b'1' => write_flag(&file, &path, b'0')?,
            b'0' => {}
            other => return Err(invalid_flag(path, other)),
        }

        tracing::debug!(device = %self.info.bdf, "device disabled");
        self.enabled = false;
        Ok(())
    }

    /// Maps the whole of BAR `bar` (0-5) through `resource<bar>`. The resource file must be at
    /// least as long as the declared BAR size.
    ///
    /// Mapping again with an unchanged size is a no-op; a different declared size while a
    /// mapping is live is refused.
    pub fn map(&mut self, bar: usize) -> Result<()> {
        if bar >= PCI_NUM_BARS {
            tracing::error!(device = %self.info.bdf, "invalid BAR provided: {bar}");
            return Err(PciDevError::InvalidBar(bar));
        }

        let declared = self.info.size[bar];
        if let Some(mmio) = &self.mmio {
            if declared != mmio.len() as u64 {
                tracing::error!(
                    device = %self.info.bdf,
                    "already mapped BAR: 0x{:x} bytes @ {:p}",
                    mmio.len(),
                    mmio.as_ptr()
                );
                return Err(PciDevError::AlreadyMapped {
                    mapped: mmio.len(),
                    declared,
                });
            }
            return Ok(());
        }

        let len = usize::try_from(declared)
            .map_err(|_| PciDevError::UnmappableBar { bar, size: declared })?;
        let path = self.sysfs_path.join(format!("resource{bar}"));
        let file = open_rw(&path)?;
        let region = MmioRegion::map(&file, &path, len).map_err(|err| {
            tracing::error!(error = %err, "mapping {} failed", path.display());
            err
        })?;

        self.mmio = Some(region);
        Ok(())
    }

    pub fn unmap(&mut self) {
        self.mmio = None;
    }

    /// Unmaps and restores the enable state, reporting a failure to restore it.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        self.closed = true;
        self.unmap();
        self.disable()
    }

    fn region(&self) -> Result<&MmioRegion> {
        self.mmio.as_ref().ok_or(PciDevError::NotMapped)
    }

    fn region_mut(&mut self) -> Result<&mut MmioRegion> {
        self.mmio.as_mut().ok_or(PciDevError::NotMapped)
    }

    pub fn read_u8(&self, addr: usize) -> Result<u8> {
        self.region()?.read_u8(addr)
    }

    pub fn write_u8(&mut self, addr: usize, value: u8) -> Result<()> {
        self.region_mut()?.write_u8(addr, value)
    }

    pub fn mask_u8(&mut self, addr: usize, value: u8, mask: u8) -> Result<()> {
        self.region_mut()?.mask_u8(addr, value, mask)
    }

    pub fn read_u32(&self, addr: usize) -> Result<u32> {
        self.region()?.read_u32(addr)
    }

    pub fn write_u32(&mut self, addr: usize, value: u32) -> Result<()> {
        self.region_mut()?.write_u32(addr, value)
    }

    pub fn mask_u32(&mut self, addr: usize, value: u32, mask: u32) -> Result<()> {
        self.region_mut()?.mask_u32(addr, value, mask)
    }
}

impl<T> Drop for PciDevice<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.teardown() {
            tracing::error!(device = %self.info.bdf, error = %err, "device teardown failed");
        }
    }
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| {
            tracing::error!("failed to open {}: {err}", path.display());
            PciDevError::io("open", path, err)
        })
}

fn read_flag(file: &File, path: &Path) -> Result<u8> {
    let mut buf = [0u8; 1];
    match file.read_at(&mut buf, 0) {
        Ok(1) => Ok(buf[0]),
        Ok(_) => Err(PciDevError::io(
            "read",
            path,
            std::io::ErrorKind::UnexpectedEof.into(),
        )),
        Err(err) => {
            tracing::error!("failed to read {}: {err}", path.display());
            Err(PciDevError::io("read", path, err))
        }
    }
}

fn write_flag(file: &File, path: &Path, flag: u8) -> Result<()> {
    match file.write_at(&[flag], 0) {
        Ok(1) => Ok(()),
        Ok(_) => Err(PciDevError::io("write", path, std::io::ErrorKind::WriteZero.into())),
        Err(err) => {
            tracing::error!("failed to write {}: {err}", path.display());
            Err(PciDevError::io("write", path, err))
        }
    }
}

fn invalid_flag(path: PathBuf, value: u8) -> PciDevError {
    let value = char::from(value);
    tracing::error!("invalid value read from {}: {value:?}", path.display());
    PciDevError::InvalidEnableFlag { path, value }
}
