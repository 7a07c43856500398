// Copyright 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![deny(warnings)]

//! Host memory mappings and the guest-physical subregion table.

use log::{debug, warn};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;

use crate::common::{EpcErrorEnum, EpcResult};
use crate::new_epc_failure;

/// A host mapping of one backend's memory, bound to a kernel descriptor.
///
/// The mapping is exclusively owned; freeing it twice is a no-op.
#[derive(Debug)]
pub struct MappedRegion {
    /// Diagnostics-only name, derived from the owning backend's id.
    name: String,
    /// The mapping's host virtual address.
    mem_addr: u64,
    /// The mapping's size in bytes.
    mem_size: u64,
}

impl MappedRegion {
    /// Map `size` bytes backed by `fd`. Sharing, merging, dumping and
    /// read-ahead behavior are fixed by the caller at creation time.
    pub fn from_fd(
        name: &str,
        fd: RawFd,
        size: u64,
        share: bool,
        merge: bool,
        dump: bool,
        prealloc: bool,
    ) -> EpcResult<Self> {
        let flags = if share { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(new_epc_failure!(
                format!(
                    "Failed to map {} bytes for '{}': {}",
                    size,
                    name,
                    std::io::Error::last_os_error()
                ),
                EpcErrorEnum::MmapError
            ));
        }

        let region = MappedRegion {
            name: name.to_string(),
            mem_addr: addr as u64,
            mem_size: size,
        };

        // The madvise hints are advisory; a kernel built without the
        // relevant support reports EINVAL, which must not fail the mapping.
        if !merge {
            region.advise(libc::MADV_UNMERGEABLE, "MADV_UNMERGEABLE");
        }
        if !dump {
            region.advise(libc::MADV_DONTDUMP, "MADV_DONTDUMP");
        }
        if prealloc {
            region.advise(libc::MADV_WILLNEED, "MADV_WILLNEED");
        }

        debug!(
            "Mapped region '{}': {} bytes at {:#x}",
            region.name, region.mem_size, region.mem_addr
        );

        Ok(region)
    }

    /// Map `size` bytes of anonymous private memory.
    pub fn anonymous(name: &str, size: u64) -> EpcResult<Self> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(new_epc_failure!(
                format!(
                    "Failed to map {} anonymous bytes for '{}': {}",
                    size,
                    name,
                    std::io::Error::last_os_error()
                ),
                EpcErrorEnum::MmapError
            ));
        }

        Ok(MappedRegion {
            name: name.to_string(),
            mem_addr: addr as u64,
            mem_size: size,
        })
    }

    fn advise(&self, advice: libc::c_int, advice_name: &str) {
        let rc = unsafe {
            libc::madvise(
                self.mem_addr as *mut libc::c_void,
                self.mem_size as usize,
                advice,
            )
        };
        if rc < 0 {
            debug!(
                "madvise({}) not applied to region '{}': {}",
                advice_name,
                self.name,
                std::io::Error::last_os_error()
            );
        }
    }

    /// Free the mapping, if it has not been freed earlier.
    pub fn free(&mut self) -> EpcResult<()> {
        // Do nothing if the region has already been freed.
        if self.mem_addr == 0 {
            return Ok(());
        }

        let rc =
            unsafe { libc::munmap(self.mem_addr as *mut libc::c_void, self.mem_size as usize) };

        if rc < 0 {
            return Err(new_epc_failure!(
                format!("Failed to unmap region '{}'", self.name),
                EpcErrorEnum::MunmapError
            ));
        }

        // Set the address and length to 0 to avoid double-freeing.
        self.mem_addr = 0;
        self.mem_size = 0;

        Ok(())
    }

    /// Get the host virtual address of the mapping.
    pub fn mem_addr(&self) -> u64 {
        self.mem_addr
    }

    /// Get the size in bytes of the mapping.
    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    /// Get the diagnostics name of the mapping.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(err) = self.free() {
            warn!(
                "Leaked mapping '{}': {}",
                self.name,
                err.construct_error_message()
            );
        }
    }
}

/// The guest-physical subregion table spanning the whole EPC area.
///
/// An opaque placement table keyed by offset and size; the backing host
/// mappings stay with their owning backends.
#[derive(Debug)]
pub struct EpcAddressSpace {
    /// The table's advertised size in bytes.
    size: u64,
    /// Registered subregions, offset to size.
    subregions: BTreeMap<u64, u64>,
}

impl EpcAddressSpace {
    /// Create an empty table advertising `size` bytes.
    pub fn new(size: u64) -> Self {
        EpcAddressSpace {
            size,
            subregions: BTreeMap::new(),
        }
    }

    /// Register a subregion of `size` bytes at `offset`.
    ///
    /// Overlap with an existing subregion is an invariant violation of the
    /// placement logic, not a recoverable condition.
    pub fn add_subregion(&mut self, offset: u64, size: u64) -> EpcResult<()> {
        if self.overlaps(offset, size) {
            return Err(new_epc_failure!(
                format!(
                    "Subregion [{:#x}, +{:#x}) overlaps an existing placement",
                    offset, size
                ),
                EpcErrorEnum::UnspecifiedError
            ));
        }

        self.subregions.insert(offset, size);
        Ok(())
    }

    /// Remove the subregion registered at `offset`, returning its size.
    pub fn del_subregion(&mut self, offset: u64) -> EpcResult<u64> {
        self.subregions.remove(&offset).ok_or_else(|| {
            new_epc_failure!(
                format!("No subregion registered at offset {:#x}", offset),
                EpcErrorEnum::UnspecifiedError
            )
        })
    }

    /// Resize the table. Used once at machine-init finalization to shrink
    /// the maximum-sized table down to the committed total.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// The table's advertised size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The number of registered subregions.
    pub fn nr_subregions(&self) -> usize {
        self.subregions.len()
    }

    fn overlaps(&self, offset: u64, size: u64) -> bool {
        // Predecessor (or exact match) reaching into the new subregion.
        if let Some((prev_off, prev_size)) = self.subregions.range(..=offset).next_back() {
            if prev_off + prev_size > offset {
                return true;
            }
        }
        // Successor starting inside the new subregion.
        if let Some((next_off, _)) = self.subregions.range(offset..).next() {
            if offset + size > *next_off {
                return true;
            }
        }
        false
    }
}
