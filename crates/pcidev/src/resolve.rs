//! Whitelist matching and the exactly-one-device policy.

use crate::access::PciDeviceInfo;
use crate::filter::PciFilter;
use crate::{PciDevError, Result};

/// How well a supported device has been tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Ok,
    /// Not tested. Matching is unaffected, but operators are asked to report results.
    Untested,
    Bad,
    Deprecated,
    NotApplicable,
}

/// Whitelist entry with human-readable names, used by [`PciSession::find_device`].
///
/// [`PciSession::find_device`]: crate::PciSession::find_device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEntry {
    pub vendor_id: u16,
    pub device_id: u16,
    pub status: TestStatus,
    pub vendor_name: &'static str,
    pub device_name: &'static str,
}

impl DeviceEntry {
    /// All-zero terminator for tables ported from sentinel-terminated lists.
    pub const SENTINEL: Self = Self::new(0, 0, TestStatus::NotApplicable, "", "");

    pub const fn new(
        vendor_id: u16,
        device_id: u16,
        status: TestStatus,
        vendor_name: &'static str,
        device_name: &'static str,
    ) -> Self {
        Self {
            vendor_id,
            device_id,
            status,
            vendor_name,
            device_name,
        }
    }
}

/// Whitelist entry carrying per-device driver data, used by [`PciSession::open_device`].
///
/// `private` is cloned into the resolved [`PciDevice`](crate::PciDevice) so drivers supporting
/// many devices need not look the match up again.
///
/// [`PciSession::open_device`]: crate::PciSession::open_device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciMatch<T> {
    pub vendor_id: u16,
    pub device_id: u16,
    pub status: TestStatus,
    pub private: T,
}

impl<T> PciMatch<T> {
    pub const fn new(vendor_id: u16, device_id: u16, status: TestStatus, private: T) -> Self {
        Self {
            vendor_id,
            device_id,
            status,
            private,
        }
    }
}

pub(crate) trait WhitelistEntry {
    fn ids(&self) -> (u16, u16);
    fn status(&self) -> TestStatus;

    fn is_sentinel(&self) -> bool {
        self.ids().0 == 0
    }
}

impl WhitelistEntry for DeviceEntry {
    fn ids(&self) -> (u16, u16) {
        (self.vendor_id, self.device_id)
    }

    fn status(&self) -> TestStatus {
        self.status
    }
}

impl<T> WhitelistEntry for PciMatch<T> {
    fn ids(&self) -> (u16, u16) {
        (self.vendor_id, self.device_id)
    }

    fn status(&self) -> TestStatus {
        self.status
    }
}

fn lookup<'w, E: WhitelistEntry>(whitelist: &'w [E], dev: &PciDeviceInfo) -> Option<&'w E> {
    whitelist
        .iter()
        .take_while(|entry| !entry.is_sentinel())
        .find(|entry| entry.ids() == (dev.vendor_id, dev.device_id))
}

/// Returns the single device that passes `filter`, is on `whitelist` and is accepted by
/// `usable`.
pub(crate) fn select_unique<'w, E: WhitelistEntry>(
    devices: &[PciDeviceInfo],
    filter: &PciFilter,
    whitelist: &'w [E],
    mut usable: impl FnMut(&PciDeviceInfo, &E) -> bool,
) -> Result<(PciDeviceInfo, &'w E)> {
    let mut survivors = Vec::new();

    for dev in devices.iter().filter(|dev| filter.matches(dev.bdf)) {
        let Some(entry) = lookup(whitelist, dev) else {
            continue;
        };

        tracing::debug!(
            "found {:04x}:{:04x} at BDF {}",
            dev.vendor_id,
            dev.device_id,
            dev.bdf
        );
        if entry.status() == TestStatus::Untested {
            tracing::info!(
                "This PCI device ({:04x}:{:04x}) is UNTESTED. Please report whether it works \
                 for you, including the name of the device.",
                dev.vendor_id,
                dev.device_id
            );
        }

        if usable(dev, entry) {
            survivors.push((dev.clone(), entry));
        }
    }

    if survivors.len() > 1 {
        tracing::error!(
            count = survivors.len(),
            "multiple supported PCI devices found; use 'pci=bb:dd.f' to explicitly select the \
             card with the given BDF (PCI bus, device, function)"
        );
        return Err(PciDevError::MultipleDevicesFound {
            count: survivors.len(),
        });
    }

    survivors.pop().ok_or_else(|| {
        tracing::error!("no supported PCI device found");
        PciDevError::NoDeviceFound
    })
}
