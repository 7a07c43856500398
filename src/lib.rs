// Copyright 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![deny(warnings)]

//! Virtual SGX EPC resource management.
//!
//! This crate manages the lifecycle of virtualized Enclave Page Cache (EPC)
//! memory on behalf of a hypervisor-style host process: it acquires
//! host-backed EPC blocks through the Linux SGX virtual EPC kernel
//! interface, maps them into a flat guest-physical region placed above the
//! machine's high memory, tracks the registered sections, and tears the
//! backing resource down and recreates it on a system reset without
//! disturbing the address map.
//!
//! The entry point is [`EpcMachine`]: probe for kernel support when the
//! process starts, configure backends and sections, run `init` at
//! machine-init time and `reset_all` on a system reset.

pub mod backend;
pub mod common;
pub mod epc_driver;
pub mod memory_region;
pub mod registry;
pub mod section;

pub use backend::{EpcBackend, EpcBackendConfig, HostMemoryBackend, RamBackend};
pub use common::{EpcErrorEnum, EpcFailure, EpcResult, ExitGracefully};
pub use epc_driver::{EpcDevicePaths, EpcProtocol, KernelResourceHandle, VirtEpcDevice};
pub use memory_region::{EpcAddressSpace, MappedRegion};
pub use registry::{EpcDescribeInfo, EpcMachine, EpcRegistry, EpcSectionInfo, EPC_HIGH_MEMORY_START};
pub use section::{EpcSection, EpcSectionConfig};
