// Copyright 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![deny(warnings)]

//! Host memory backends.
//!
//! A backend owns one host mapping and, for the EPC variant, the kernel
//! handle backing it. Sections consume backends through the generic
//! [`HostMemoryBackend`] capability and never touch the kernel resource
//! directly.

use log::{debug, warn};
use serde::Deserialize;

use crate::common::{EpcErrorEnum, EpcResult};
use crate::epc_driver::{KernelResourceHandle, VirtEpcDevice};
use crate::memory_region::MappedRegion;
use crate::new_epc_failure;

/// Configuration for one EPC memory backend, as produced by the option
/// parsing front end.
#[derive(Debug, Clone, Deserialize)]
pub struct EpcBackendConfig {
    /// The backend object id, e.g. "mem1".
    pub id: String,
    /// The requested size in bytes.
    pub size_bytes: u64,
    /// Whether to ask the kernel to fault the instance in up front.
    #[serde(default)]
    pub prealloc: bool,
}

/// The capability every memory backend variant implements.
pub trait HostMemoryBackend {
    /// The backend object id.
    fn id(&self) -> &str;

    /// The configured size in bytes.
    fn size(&self) -> u64;

    /// Allocate the backing resource and its host mapping.
    fn alloc(&mut self) -> EpcResult<()>;

    /// The host mapping, once allocated.
    fn memory(&self) -> EpcResult<&MappedRegion>;

    /// Whether a section currently maps this backend.
    fn is_mapped(&self) -> bool;

    /// Mark or unmark this backend as mapped by a section.
    fn set_mapped(&mut self, mapped: bool);

    /// Tear down the backing resource and allocate it afresh.
    fn reset(&mut self) -> EpcResult<()>;
}

/// A memory backend carved out of the host's virtual EPC resource.
///
/// The mapping is always shared with the consumer, and never merged or
/// included in memory dumps.
pub struct EpcBackend {
    id: String,
    size: u64,
    share: bool,
    merge: bool,
    dump: bool,
    prealloc: bool,
    device: VirtEpcDevice,
    handle: Option<KernelResourceHandle>,
    region: Option<MappedRegion>,
    mapped: bool,
}

impl EpcBackend {
    /// Create an unallocated backend from its configuration and the probed
    /// acquisition device.
    pub fn new(config: &EpcBackendConfig, device: VirtEpcDevice) -> Self {
        EpcBackend {
            id: config.id.clone(),
            size: config.size_bytes,
            share: true,
            merge: false,
            dump: false,
            prealloc: config.prealloc,
            device,
            handle: None,
            region: None,
            mapped: false,
        }
    }

    /// Whether the backend currently owns a live kernel handle.
    pub fn is_allocated(&self) -> bool {
        self.handle.is_some()
    }
}

impl HostMemoryBackend for EpcBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn alloc(&mut self) -> EpcResult<()> {
        if self.size == 0 {
            return Err(new_epc_failure!(
                format!("Can't create EPC backend '{}' with size 0", self.id),
                EpcErrorEnum::SizeError
            ));
        }
        if self.region.is_some() {
            return Err(new_epc_failure!(
                format!("EPC backend '{}' is already allocated", self.id),
                EpcErrorEnum::UnspecifiedError
            ));
        }

        if self.size % page_size::get() as u64 != 0 {
            warn!(
                "EPC backend '{}' size {} is not page-aligned",
                self.id, self.size
            );
        }

        let handle = self.device.acquire(self.size)?;
        // The mapping either succeeds and the handle moves into the backend,
        // or the locally owned handle is closed on the error return. No
        // partial state survives a failure.
        let region = MappedRegion::from_fd(
            &self.id,
            handle.raw_fd()?,
            self.size,
            self.share,
            self.merge,
            self.dump,
            self.prealloc,
        )
        .map_err(|e| e.add_subaction(format!("Failed to map EPC backend '{}'", self.id)))?;

        self.handle = Some(handle);
        self.region = Some(region);

        debug!("Allocated EPC backend '{}' ({} bytes)", self.id, self.size);
        Ok(())
    }

    fn memory(&self) -> EpcResult<&MappedRegion> {
        self.region.as_ref().ok_or_else(|| {
            new_epc_failure!(
                format!("EPC backend '{}' is not allocated", self.id),
                EpcErrorEnum::ConfigError
            )
        })
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn set_mapped(&mut self, mapped: bool) {
        self.mapped = mapped;
    }

    fn reset(&mut self) -> EpcResult<()> {
        // Destroy-then-create is mandatory: the old instance's capacity must
        // be returned to the host before a new one is requested, and a
        // backend never holds two live handles.
        if let Some(mut region) = self.region.take() {
            region.free()?;
        }
        if let Some(mut handle) = self.handle.take() {
            handle.release();
        }

        self.alloc()
            .map_err(|e| e.add_subaction(format!("Failed to reset EPC backend '{}'", self.id)))
    }
}

/// A plain anonymous-memory backend, the generic variant of the capability.
pub struct RamBackend {
    id: String,
    size: u64,
    region: Option<MappedRegion>,
    mapped: bool,
}

impl RamBackend {
    /// Create an unallocated RAM backend.
    pub fn new(id: &str, size: u64) -> Self {
        RamBackend {
            id: id.to_string(),
            size,
            region: None,
            mapped: false,
        }
    }
}

impl HostMemoryBackend for RamBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn alloc(&mut self) -> EpcResult<()> {
        if self.size == 0 {
            return Err(new_epc_failure!(
                format!("Can't create RAM backend '{}' with size 0", self.id),
                EpcErrorEnum::SizeError
            ));
        }
        if self.region.is_none() {
            self.region = Some(MappedRegion::anonymous(&self.id, self.size)?);
        }
        Ok(())
    }

    fn memory(&self) -> EpcResult<&MappedRegion> {
        self.region.as_ref().ok_or_else(|| {
            new_epc_failure!(
                format!("RAM backend '{}' is not allocated", self.id),
                EpcErrorEnum::ConfigError
            )
        })
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn set_mapped(&mut self, mapped: bool) {
        self.mapped = mapped;
    }

    fn reset(&mut self) -> EpcResult<()> {
        if let Some(mut region) = self.region.take() {
            region.free()?;
        }
        self.alloc()
    }
}
