use std::path::PathBuf;

use thiserror::Error;

use crate::PciBdf;

pub type Result<T> = std::result::Result<T, PciDevError>;

/// Unified error type for PCI device resolution, mapping and register access.
///
/// Configuration errors that indicate a broken invariant in the calling code carry a hint to
/// report a bug; resolution errors carry the remediation an operator can apply.
#[derive(Debug, Error)]
pub enum PciDevError {
    #[error("tried to allocate a new PCI context, but there is still an old one; please report a bug")]
    ContextAlreadyInitialized,

    #[error("no PCI context is initialized")]
    ContextNotInitialized,

    #[error("invalid BAR {0} (expected 0-5)")]
    InvalidBar(usize),

    #[error("invalid value read from {}: {value:?}", path.display())]
    InvalidEnableFlag { path: PathBuf, value: char },

    #[error("invalid PCI filter: {0}")]
    InvalidFilter(String),

    #[error("invalid programmer parameter: {0}")]
    InvalidParam(String),

    #[error("no supported PCI device found")]
    NoDeviceFound,

    #[error(
        "multiple supported PCI devices found ({count}); use 'pci=bb:dd.f' to explicitly select \
         the card with the given BDF (PCI bus, device, function)"
    )]
    MultipleDevicesFound { count: usize },

    #[error("BAR at 0x{offset:02x} of {bdf} is unreachable: 64-bit address 0x{upper:08x}_{lower:08x} does not fit a {native_bits}-bit pointer")]
    BarUnreachable {
        bdf: PciBdf,
        offset: u16,
        upper: u32,
        lower: u32,
        native_bits: u32,
    },

    #[error("BAR already mapped: 0x{mapped:x} bytes, device now declares 0x{declared:x} bytes")]
    AlreadyMapped { mapped: usize, declared: u64 },

    #[error("BAR {bar} size 0x{size:x} cannot be mapped")]
    UnmappableBar { bar: usize, size: u64 },

    #[error("no BAR is mapped")]
    NotMapped,

    #[error("MMIO access out of range: addr=0x{addr:x} len={len} size=0x{size:x}")]
    OutOfRange { addr: usize, len: usize, size: usize },

    #[error("misaligned MMIO access: addr=0x{addr:x} (expected multiple of {alignment})")]
    Misaligned { addr: usize, alignment: usize },

    #[error("PCI device {0} is no longer present")]
    DeviceGone(PciBdf),

    #[error("config space access to {bdf} at 0x{offset:02x} failed: {reason}")]
    ConfigAccess {
        bdf: PciBdf,
        offset: u16,
        reason: String,
    },

    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PciDevError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Underlying OS error code for [`PciDevError::Io`] failures.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}
