// Copyright 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![deny(warnings)]
#![allow(non_camel_case_types)]
// Without this, the ioctl wrappers fail to pass clippy due to unsafe generated code.
#![allow(clippy::missing_safety_doc)]

//! Module for acquiring SGX virtual EPC instances from the kernel.
//!
//! Two protocol generations are supported. On newer kernels every `open(2)`
//! of `/dev/sgx_vepc` yields a fresh virtual EPC instance whose size is
//! bound by the length of the caller's subsequent mapping. Older kernels
//! expose a control device, `/dev/sgx_virt`, which hands out per-instance
//! descriptors through the `SGX_VIRT_EPC_CREATE` ioctl. The protocol in use
//! is resolved exactly once, by probing at subsystem registration time, and
//! is never re-resolved per call.

use log::{debug, info};
use nix::ioctl_write_ptr;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::common::{EpcErrorEnum, EpcResult};
use crate::new_epc_failure;

/// Path corresponding to the per-instance virtual EPC device file.
pub const SGX_VEPC_PATH: &str = "/dev/sgx_vepc";

/// Path corresponding to the legacy virtual EPC control device file.
pub const SGX_VIRT_PATH: &str = "/dev/sgx_virt";

/// Magic number for the SGX IOCTL codes.
const SGX_MAGIC: u8 = 0xA4;

/// Parameter structure for the `SGX_VIRT_EPC_CREATE` ioctl.
///
/// The definition is duplicated from asm/sgx.h.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct sgx_virt_epc_create {
    /// Size, in bytes, of the virtual EPC.
    pub size: u64,
    /// File handle to the securityfs attribute file.
    pub attribute_fd: u64,
}

ioctl_write_ptr!(sgx_virt_epc_create_ioctl, SGX_MAGIC, 0x80, sgx_virt_epc_create);

/// The device paths used for probing and acquisition. Overridable so tests
/// can point the subsystem at stand-in nodes.
#[derive(Debug, Clone)]
pub struct EpcDevicePaths {
    /// Path to the per-instance device node (modern kernels).
    pub vepc: PathBuf,
    /// Path to the control device node (legacy kernels).
    pub virt: PathBuf,
}

impl Default for EpcDevicePaths {
    fn default() -> Self {
        EpcDevicePaths {
            vepc: PathBuf::from(SGX_VEPC_PATH),
            virt: PathBuf::from(SGX_VIRT_PATH),
        }
    }
}

/// The kernel protocol generation selected by probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpcProtocol {
    /// Per-instance device node; one open per instance.
    Vepc,
    /// Control-device ioctl which creates an anonymous instance.
    VirtCreate,
}

/// The probed acquisition strategy: one protocol, one device path, fixed for
/// the lifetime of the process.
#[derive(Debug, Clone)]
pub struct VirtEpcDevice {
    protocol: EpcProtocol,
    path: PathBuf,
}

impl VirtEpcDevice {
    /// Probe for kernel virtual EPC support. Returns `None` when neither
    /// protocol's device can be opened, in which case the subsystem must
    /// stay unregistered rather than fail at use time.
    pub fn probe(paths: &EpcDevicePaths) -> Option<Self> {
        if try_open(&paths.vepc).is_some() {
            debug!("Probed virtual EPC device {:?}", paths.vepc);
            return Some(VirtEpcDevice {
                protocol: EpcProtocol::Vepc,
                path: paths.vepc.clone(),
            });
        }

        if try_open(&paths.virt).is_some() {
            debug!("Probed legacy virtual EPC control device {:?}", paths.virt);
            return Some(VirtEpcDevice {
                protocol: EpcProtocol::VirtCreate,
                path: paths.virt.clone(),
            });
        }

        info!("No SGX virtual EPC support found, subsystem stays unregistered");
        None
    }

    /// The protocol generation this device resolved to.
    pub fn protocol(&self) -> EpcProtocol {
        self.protocol
    }

    /// Acquire a kernel handle backing `size` bytes of virtual EPC.
    pub fn acquire(&self, size: u64) -> EpcResult<KernelResourceHandle> {
        if size == 0 {
            return Err(new_epc_failure!(
                "Cannot acquire a virtual EPC instance of size 0",
                EpcErrorEnum::SizeError
            ));
        }

        let file = match self.protocol {
            EpcProtocol::Vepc => self.acquire_vepc()?,
            EpcProtocol::VirtCreate => self.acquire_virt_create(size)?,
        };

        debug!(
            "Acquired virtual EPC handle of {} bytes through {:?}",
            size, self.path
        );

        Ok(KernelResourceHandle {
            file: Some(file),
            size,
        })
    }

    /// Modern protocol: the opened node is itself the instance; its size is
    /// bound later by the mapping length.
    fn acquire_vepc(&self) -> EpcResult<File> {
        open_device(&self.path)
    }

    /// Legacy protocol: create an anonymous instance through the control
    /// device. The control descriptor lives only for the duration of the
    /// creation call.
    fn acquire_virt_create(&self, size: u64) -> EpcResult<File> {
        let control = open_device(&self.path)?;

        let params = sgx_virt_epc_create {
            size,
            // Never populated by the creation path; reserved for the
            // securityfs attribute file.
            attribute_fd: 0,
        };

        let fd = unsafe { sgx_virt_epc_create_ioctl(control.as_raw_fd(), &params) }.map_err(
            |err| {
                new_epc_failure!(
                    format!("SGX_VIRT_EPC_CREATE ioctl failed: {}", err),
                    EpcErrorEnum::CreationFailed
                )
                .add_info(vec![
                    self.path.to_str().unwrap_or("Invalid unicode device path"),
                ])
            },
        )?;
        // `control` is dropped here, closing the control descriptor whether
        // the creation call succeeded or not.

        Ok(unsafe { File::from_raw_fd(fd) })
    }
}

/// An exclusively owned handle to one live virtual EPC instance.
///
/// Not cloneable: the kernel resource must never be shared between backends.
/// Dropping the handle closes it.
#[derive(Debug)]
pub struct KernelResourceHandle {
    file: Option<File>,
    size: u64,
}

impl KernelResourceHandle {
    /// The raw descriptor backing the instance, if the handle is still open.
    pub fn raw_fd(&self) -> EpcResult<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd()).ok_or_else(|| {
            new_epc_failure!(
                "Virtual EPC handle has already been released",
                EpcErrorEnum::UnspecifiedError
            )
        })
    }

    /// The size, in bytes, the instance was acquired for.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Close the underlying descriptor. A no-op if already released.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            debug!("Releasing virtual EPC handle (fd {})", file.as_raw_fd());
        }
    }
}

/// Open a device node for reading and writing.
fn open_device(path: &Path) -> EpcResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| {
            new_epc_failure!(
                format!("Failed to open {:?}: {}", path, err),
                EpcErrorEnum::ResourceUnavailable
            )
            .add_info(vec![path.to_str().unwrap_or("Invalid unicode device path")])
        })
}

/// Check whether a device node can be opened; the probe descriptor is
/// closed immediately.
fn try_open(path: &Path) -> Option<File> {
    OpenOptions::new().read(true).write(true).open(path).ok()
}
