//! Scope that owns the enumeration context and the shutdown registry.

use std::path::{Path, PathBuf};

use crate::access::{AccessWidth, PciAccess, PciDeviceInfo};
use crate::bar::classify_bar;
use crate::device::PciDevice;
use crate::filter::PciFilter;
use crate::resolve::{select_unique, DeviceEntry, PciMatch};
use crate::shutdown::{ShutdownAction, ShutdownRegistry, ShutdownReport};
use crate::undo::{ConfigValue, UndoEntry};
use crate::{PciBdf, PciDevError, Result};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/bus/pci/devices";

/// Optional constraints applied while resolving a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Location filter, usually from the `pci=` programmer parameter.
    pub filter: Option<PciFilter>,
    /// BAR register offset that must decode to a non-zero address (`find_device` only).
    pub bar: Option<u16>,
}

impl ResolveOptions {
    pub fn with_filter(mut self, filter: PciFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_bar(mut self, offset: u16) -> Self {
        self.bar = Some(offset);
        self
    }
}

/// Owns at most one enumeration context plus every cleanup action registered against it.
///
/// Cleanup runs in reverse registration order, either through [`PciSession::shutdown`] or when
/// the session is dropped. Config writes made through [`PciSession::write_config`] are undone
/// there; resolved [`PciDevice`] handles are owned by the caller and tear themselves down.
pub struct PciSession<A: PciAccess> {
    access: Option<A>,
    registry: ShutdownRegistry,
    sysfs_root: PathBuf,
}

impl<A: PciAccess> Default for PciSession<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PciAccess> PciSession<A> {
    pub fn new() -> Self {
        Self::with_sysfs_root(DEFAULT_SYSFS_ROOT)
    }

    /// Session whose resolved devices live under `root` instead of `/sys/bus/pci/devices`.
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            access: None,
            registry: ShutdownRegistry::new(),
            sysfs_root: root.into(),
        }
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    pub fn is_initialized(&self) -> bool {
        self.access.is_some()
    }

    /// Installs the enumeration context and schedules its release.
    pub fn init_context(&mut self, access: A) -> Result<()> {
        if self.access.is_some() {
            tracing::error!(
                "tried to allocate a new PCI context, but there is still an old one; please \
                 report a bug"
            );
            return Err(PciDevError::ContextAlreadyInitialized);
        }

        self.registry.register(ShutdownAction::ReleaseContext);
        self.access = Some(access);
        Ok(())
    }

    /// Takes the context out of the session. Pending restore actions will be skipped.
    pub fn release_context(&mut self) -> Option<A> {
        self.access.take()
    }

    pub fn access(&self) -> Result<&A> {
        self.access.as_ref().ok_or(PciDevError::ContextNotInitialized)
    }

    pub fn access_mut(&mut self) -> Result<&mut A> {
        self.access.as_mut().ok_or(PciDevError::ContextNotInitialized)
    }

    /// Initializes the context with `access` and returns the one whitelisted device that
    /// passes `options`.
    ///
    /// With `options.bar` set, only devices whose BAR decodes to a non-zero address are counted;
    /// a BAR that cannot be classified counts as zero.
    pub fn find_device(
        &mut self,
        access: A,
        whitelist: &[DeviceEntry],
        options: &ResolveOptions,
    ) -> Result<PciDeviceInfo> {
        self.init_context(access)?;
        let access = self.access()?;
        let filter = options.filter.unwrap_or_default();

        let (dev, entry) =
            select_unique(&access.devices(), &filter, whitelist, |dev, _| match options.bar {
                None => true,
                Some(offset) => classify_bar(access, dev.bdf, offset)
                    .map(|bar| bar.address)
                    .unwrap_or(0)
                    != 0,
            })?;

        tracing::info!(
            "Found \"{} {}\" ({:04x}:{:04x}, BDF {})",
            entry.vendor_name,
            entry.device_name,
            dev.vendor_id,
            dev.device_id,
            dev.bdf
        );
        Ok(dev)
    }

    /// Initializes the context with `access`, resolves the one whitelisted device that passes
    /// `options.filter` and enables it.
    ///
    /// If enabling fails the handle is dropped before the error is returned, so nothing the
    /// failed enable touched is left behind.
    pub fn open_device<T: Clone>(
        &mut self,
        access: A,
        whitelist: &[PciMatch<T>],
        options: &ResolveOptions,
    ) -> Result<PciDevice<T>> {
        self.init_context(access)?;
        let access = self.access()?;
        let filter = options.filter.unwrap_or_default();

        let (dev, entry) = select_unique(&access.devices(), &filter, whitelist, |_, _| true)?;

        let name = access
            .lookup_name(dev.vendor_id, dev.device_id)
            .unwrap_or_else(|| "unknown".to_string());
        tracing::info!(
            "Detected {:04x}:{:04x}@{} \"{}\"",
            dev.vendor_id,
            dev.device_id,
            dev.bdf,
            name
        );

        let sysfs_path = self.sysfs_root.join(dev.bdf.sysfs_name());
        let mut device = PciDevice::new(name, dev, sysfs_path, entry.private.clone());
        device.enable()?;
        Ok(device)
    }

    /// Writes `value` to `register`, first scheduling a restore of the current contents at the
    /// same width.
    pub fn write_config(&mut self, bdf: PciBdf, register: u16, value: ConfigValue) -> Result<()> {
        let access = self
            .access
            .as_mut()
            .ok_or(PciDevError::ContextNotInitialized)?;

        let undo = UndoEntry::capture(&*access, bdf, register, value.width())?;
        self.registry.register(ShutdownAction::RestoreConfig(undo));
        access.write_config(bdf, register, value.width(), value.raw())
    }

    pub fn write_config_byte(&mut self, bdf: PciBdf, register: u16, value: u8) -> Result<()> {
        self.write_config(bdf, register, ConfigValue::Byte(value))
    }

    pub fn write_config_word(&mut self, bdf: PciBdf, register: u16, value: u16) -> Result<()> {
        self.write_config(bdf, register, ConfigValue::Word(value))
    }

    pub fn write_config_long(&mut self, bdf: PciBdf, register: u16, value: u32) -> Result<()> {
        self.write_config(bdf, register, ConfigValue::Long(value))
    }

    /// Reads through the context; a convenience for code that holds only the session.
    pub fn read_config(&self, bdf: PciBdf, register: u16, width: AccessWidth) -> Result<u32> {
        self.access()?.read_config(bdf, register, width)
    }

    pub fn register_callback(
        &mut self,
        name: &'static str,
        run: impl FnOnce() -> Result<()> + 'static,
    ) {
        self.registry.register_callback(name, run);
    }

    /// Number of cleanup actions still pending.
    pub fn pending_actions(&self) -> usize {
        self.registry.len()
    }

    /// Runs every registered action, last registered first. Failures are logged and counted;
    /// they never stop the remaining actions.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        while let Some(action) = self.registry.pop() {
            let result = match action {
                ShutdownAction::ReleaseContext => {
                    if self.access.take().is_none() {
                        tracing::debug!("PCI context already released");
                    }
                    Ok(())
                }
                ShutdownAction::RestoreConfig(entry) => entry.restore(self.access.as_mut()),
                ShutdownAction::Callback { name, run } => run().map_err(|err| {
                    tracing::error!(callback = name, error = %err, "shutdown callback failed");
                    err
                }),
            };

            report.executed += 1;
            if result.is_err() {
                report.failed += 1;
            }
        }

        tracing::debug!(
            executed = report.executed,
            failed = report.failed,
            "PCI session shut down"
        );
        report
    }
}

impl<A: PciAccess> Drop for PciSession<A> {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            self.shutdown();
        }
    }
}
