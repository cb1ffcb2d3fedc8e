//! Bounds-checked access to a memory-mapped BAR.
//!
//! MMIO writes are never rolled back automatically; programmer drivers are responsible for
//! restoring whatever device state they change through these accessors.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

use crate::{PciDevError, Result};

/// A shared read/write mapping of a device resource.
///
/// The mapping is released on drop. All accesses are volatile and bounds-checked; a failing
/// check never touches the mapping.
#[derive(Debug)]
pub struct MmioRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MmioRegion {
    /// Maps `len` bytes of `file` from offset 0 with `MAP_SHARED` and read/write protection.
    ///
    /// `len` must not exceed the file's length; pages past the end of the file fault on access.
    /// `path` is only used for error reporting.
    pub fn map(file: &File, path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(PciDevError::io(
                "map",
                path,
                std::io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        let file_len = file
            .metadata()
            .map_err(|err| PciDevError::io("stat", path, err))?
            .len();
        if len as u64 > file_len {
            tracing::error!(
                path = %path.display(),
                "requested 0x{len:x} bytes but the resource is only 0x{file_len:x} bytes"
            );
            return Err(PciDevError::io(
                "map",
                path,
                std::io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }

        // SAFETY: `file` is an open descriptor for the duration of the call, the length is
        // non-zero and within the file, and the kernel picks the address. The result is checked before use.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(PciDevError::io("map", path, std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            PciDevError::io("map", path, std::io::Error::from_raw_os_error(libc::EFAULT))
        })?;

        tracing::debug!(path = %path.display(), "mapped 0x{len:x} bytes at {ptr:p}");
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn read_u8(&self, addr: usize) -> Result<u8> {
        self.check(addr, 1)?;
        // SAFETY: `addr` is within the mapping (checked above).
        let value = unsafe { self.ptr.as_ptr().add(addr).read_volatile() };
        tracing::trace!("mmio read8 0x{addr:x} = 0x{value:02x}");
        Ok(value)
    }

    pub fn write_u8(&mut self, addr: usize, value: u8) -> Result<()> {
        self.check(addr, 1)?;
        tracing::trace!("mmio write8 0x{addr:x} = 0x{value:02x}");
        // SAFETY: `addr` is within the mapping (checked above).
        unsafe { self.ptr.as_ptr().add(addr).write_volatile(value) };
        Ok(())
    }

    /// Replaces the bits selected by `mask` with the corresponding bits of `value`.
    pub fn mask_u8(&mut self, addr: usize, value: u8, mask: u8) -> Result<()> {
        self.check(addr, 1)?;
        // SAFETY: `addr` is within the mapping (checked above).
        unsafe {
            let reg = self.ptr.as_ptr().add(addr);
            let old = reg.read_volatile();
            let new = (old & !mask) | (value & mask);
            tracing::trace!("mmio mask8 0x{addr:x}: 0x{old:02x} -> 0x{new:02x}");
            reg.write_volatile(new);
        }
        Ok(())
    }

    pub fn read_u32(&self, addr: usize) -> Result<u32> {
        self.check(addr, 4)?;
        // SAFETY: in bounds and 4-byte aligned relative to a page-aligned mapping.
        let value = unsafe { self.ptr.as_ptr().add(addr).cast::<u32>().read_volatile() };
        tracing::trace!("mmio read32 0x{addr:x} = 0x{value:08x}");
        Ok(value)
    }

    pub fn write_u32(&mut self, addr: usize, value: u32) -> Result<()> {
        self.check(addr, 4)?;
        tracing::trace!("mmio write32 0x{addr:x} = 0x{value:08x}");
        // SAFETY: in bounds and 4-byte aligned relative to a page-aligned mapping.
        unsafe { self.ptr.as_ptr().add(addr).cast::<u32>().write_volatile(value) };
        Ok(())
    }

    /// Read-modify-write of a 32-bit register: one volatile read, one volatile write.
    pub fn mask_u32(&mut self, addr: usize, value: u32, mask: u32) -> Result<()> {
        self.check(addr, 4)?;
        // SAFETY: in bounds and 4-byte aligned relative to a page-aligned mapping.
        unsafe {
            let reg = self.ptr.as_ptr().add(addr).cast::<u32>();
            let old = reg.read_volatile();
            let new = (old & !mask) | (value & mask);
            tracing::trace!("mmio mask32 0x{addr:x}: 0x{old:08x} -> 0x{new:08x}");
            reg.write_volatile(new);
        }
        Ok(())
    }

    fn check(&self, addr: usize, len: usize) -> Result<()> {
        if len > 1 && addr % len != 0 {
            return Err(PciDevError::Misaligned {
                addr,
                alignment: len,
            });
        }
        match addr.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(PciDevError::OutOfRange {
                addr,
                len,
                size: self.len,
            }),
        }
    }
}

impl Drop for MmioRegion {
    fn drop(&mut self) {
        tracing::debug!("unmapping 0x{:x} bytes at {:p}", self.len, self.ptr);
        // SAFETY: `ptr`/`len` are exactly what `mmap` returned and the region is only unmapped
        // here, once.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if rc != 0 {
            tracing::error!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}
