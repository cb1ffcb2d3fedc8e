//! Restore records for config-space writes.

use crate::access::{AccessWidth, PciAccess};
use crate::{PciBdf, PciDevError, Result};

/// A config-space value tagged with its access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigValue {
    Byte(u8),
    Word(u16),
    Long(u32),
}

impl ConfigValue {
    pub const fn width(self) -> AccessWidth {
        match self {
            Self::Byte(_) => AccessWidth::Byte,
            Self::Word(_) => AccessWidth::Word,
            Self::Long(_) => AccessWidth::Long,
        }
    }

    pub const fn raw(self) -> u32 {
        match self {
            Self::Byte(v) => v as u32,
            Self::Word(v) => v as u32,
            Self::Long(v) => v,
        }
    }

    /// Truncates `raw` to `width`.
    pub const fn from_raw(width: AccessWidth, raw: u32) -> Self {
        match width {
            AccessWidth::Byte => Self::Byte(raw as u8),
            AccessWidth::Word => Self::Word(raw as u16),
            AccessWidth::Long => Self::Long(raw),
        }
    }
}

/// The value a register held before this process wrote to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoEntry {
    pub bdf: PciBdf,
    pub register: u16,
    pub previous: ConfigValue,
}

impl UndoEntry {
    /// Captures the current value of `register` at the width of the write about to happen.
    pub fn capture<A: PciAccess + ?Sized>(
        access: &A,
        bdf: PciBdf,
        register: u16,
        width: AccessWidth,
    ) -> Result<Self> {
        let raw = access.read_config(bdf, register, width)?;
        Ok(Self {
            bdf,
            register,
            previous: ConfigValue::from_raw(width, raw),
        })
    }

    /// Writes the captured value back with the same width.
    ///
    /// `access` is `None` once the enumeration context has been released; the entry is then
    /// meaningless and is reported as an error without touching anything.
    pub fn restore<A: PciAccess + ?Sized>(self, access: Option<&mut A>) -> Result<()> {
        let Some(access) = access else {
            tracing::error!(
                bdf = %self.bdf,
                "tried to undo PCI writes without a valid PCI context; please report a bug"
            );
            return Err(PciDevError::ContextNotInitialized);
        };
        if access.device(self.bdf).is_none() {
            tracing::error!(
                bdf = %self.bdf,
                "tried to undo PCI writes without a valid PCI device; please report a bug"
            );
            return Err(PciDevError::DeviceGone(self.bdf));
        }

        tracing::debug!(
            "restoring PCI config space for {} reg 0x{:02x}",
            self.bdf,
            self.register
        );
        access
            .write_config(
                self.bdf,
                self.register,
                self.previous.width(),
                self.previous.raw(),
            )
            .map_err(|err| {
                tracing::error!(
                    bdf = %self.bdf,
                    register = self.register,
                    error = %err,
                    "failed to restore PCI config space"
                );
                err
            })
    }
}
