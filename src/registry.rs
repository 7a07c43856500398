// Copyright 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![deny(warnings)]

//! The machine-level EPC placement authority.
//!
//! `EpcMachine` owns the backend table, the probed acquisition device and
//! the registry of realized sections. All placement state lives here and is
//! passed explicitly into the section lifecycle; nothing is process-global.
//! Every operation runs on the single control thread, in program order.

use log::{debug, info};
use serde::Serialize;

use crate::backend::{EpcBackend, EpcBackendConfig, HostMemoryBackend, RamBackend};
use crate::common::{EpcErrorEnum, EpcFailure, EpcResult};
use crate::epc_driver::{EpcDevicePaths, VirtEpcDevice};
use crate::memory_region::EpcAddressSpace;
use crate::new_epc_failure;
use crate::section::{self, EpcSection, EpcSectionConfig};

/// The first guest-physical address above the 4 GiB boundary. EPC sections
/// are placed above the machine's high memory, which starts here.
pub const EPC_HIGH_MEMORY_START: u64 = 0x1_0000_0000;

/// The registry of realized EPC sections and their placement bookkeeping.
#[derive(Debug)]
pub struct EpcRegistry {
    /// Base guest-physical address of the whole EPC area. Fixed at
    /// machine-init time.
    pub(crate) base: u64,
    /// Cumulative size of all placed sections.
    pub(crate) size: u64,
    /// Count of currently placed sections (reset-pass bookkeeping).
    pub(crate) nr_sections: usize,
    /// Count of sections ever realized.
    pub(crate) total_sections: usize,
    /// The section arena, indexed by registration order.
    pub(crate) sections: Vec<EpcSection>,
    /// The top-level subregion table spanning the EPC area.
    pub(crate) address_space: EpcAddressSpace,
}

impl EpcRegistry {
    fn new(base: u64) -> Self {
        EpcRegistry {
            base,
            size: 0,
            nr_sections: 0,
            total_sections: 0,
            sections: Vec::new(),
            address_space: EpcAddressSpace::new(u64::MAX),
        }
    }

    /// Base guest-physical address of the EPC area.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Cumulative committed size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The realized sections, in registration order.
    pub fn sections(&self) -> &[EpcSection] {
        &self.sections
    }
}

/// Introspection summary of the EPC subsystem.
#[derive(Serialize)]
pub struct EpcDescribeInfo {
    /// Whether kernel support was probed and the subsystem is active.
    #[serde(rename(serialize = "Enabled"))]
    pub enabled: bool,
    /// Total committed EPC size in bytes.
    #[serde(rename(serialize = "TotalSizeBytes"))]
    pub total_size_bytes: u64,
    /// Number of registered sections.
    #[serde(rename(serialize = "NumberOfSections"))]
    pub nr_sections: usize,
}

/// Introspection record for one registered section.
#[derive(Serialize)]
pub struct EpcSectionInfo {
    /// Position in registration order.
    #[serde(rename(serialize = "Index"))]
    pub index: usize,
    /// Guest-physical placement address.
    #[serde(rename(serialize = "Address"))]
    pub address: u64,
    /// Allocated size in bytes.
    #[serde(rename(serialize = "SizeBytes"))]
    pub size_bytes: u64,
}

/// The machine-scoped EPC subsystem context.
pub struct EpcMachine {
    /// The acquisition device resolved by probing, absent without kernel
    /// support.
    device: Option<VirtEpcDevice>,
    /// The memory backend table, indexed by configuration order.
    backends: Vec<Box<dyn HostMemoryBackend>>,
    /// Number of guest vCPUs instantiated so far.
    boot_cpus: u32,
    /// The placement registry, present once `init` has run on an enabled
    /// machine.
    registry: Option<EpcRegistry>,
}

impl EpcMachine {
    /// Create the machine context, probing for kernel support. Without
    /// support the subsystem stays invisible: sections are skipped and no
    /// allocation is ever attempted.
    pub fn new(paths: &EpcDevicePaths) -> Self {
        EpcMachine {
            device: VirtEpcDevice::probe(paths),
            backends: Vec::new(),
            boot_cpus: 0,
            registry: None,
        }
    }

    /// Whether the subsystem is active.
    pub fn enabled(&self) -> bool {
        self.device.is_some()
    }

    /// Register a configured EPC backend. Fails without kernel support.
    pub fn add_epc_backend(&mut self, config: &EpcBackendConfig) -> EpcResult<usize> {
        let device = self.device.as_ref().ok_or_else(|| {
            new_epc_failure!(
                "SGX virtual EPC is not supported on this system",
                EpcErrorEnum::ResourceUnavailable
            )
        })?;

        self.backends
            .push(Box::new(EpcBackend::new(config, device.clone())));
        Ok(self.backends.len() - 1)
    }

    /// Register a plain RAM backend.
    pub fn add_ram_backend(&mut self, id: &str, size: u64) -> usize {
        self.backends.push(Box::new(RamBackend::new(id, size)));
        self.backends.len() - 1
    }

    /// Initialize the EPC area at machine-init time and realize every
    /// configured section in configuration order.
    ///
    /// The base address is the first address above the machine's high
    /// memory. Address-space wraparound is fatal to startup; callers run
    /// this through `ExitGracefully`.
    pub fn init(
        &mut self,
        above_4g_mem_size: u64,
        sections: &[EpcSectionConfig],
    ) -> EpcResult<()> {
        if self.device.is_none() {
            info!("SGX virtual EPC unavailable, skipping EPC machine init");
            return Ok(());
        }

        let base = EPC_HIGH_MEMORY_START
            .checked_add(above_4g_mem_size)
            .ok_or_else(|| {
                new_epc_failure!(
                    "EPC base address exceeds the guest address space",
                    EpcErrorEnum::AddressSpaceOverflow
                )
            })?;

        self.registry = Some(EpcRegistry::new(base));

        for config in sections {
            self.realize_section(config)
                .map_err(|e| e.add_subaction("Failed to init EPC machine".to_string()))?;
        }

        let registry = self.registry.as_mut().ok_or_else(invariant_violation)?;
        if registry.base.checked_add(registry.size).is_none() {
            return Err(new_epc_failure!(
                format!(
                    "Size of all EPC sections ({:#x}) causes EPC to wrap",
                    registry.size
                ),
                EpcErrorEnum::AddressSpaceOverflow
            ));
        }

        // Shrink the maximum-sized table down to the committed total.
        registry.address_space.set_size(registry.size);

        info!(
            "EPC machine init complete: base {:#x}, {} sections, {} bytes",
            registry.base, registry.nr_sections, registry.size
        );
        Ok(())
    }

    /// Realize one section against the registry. Sections must be realized
    /// before any vCPU is instantiated.
    pub fn realize_section(&mut self, config: &EpcSectionConfig) -> EpcResult<()> {
        let memdev = self.resolve_backend(&config.memdev)?;
        let boot_cpus = self.boot_cpus;
        let registry = self.registry.as_mut().ok_or_else(|| {
            new_epc_failure!(
                format!(
                    "EPC machine is not initialized, can't realize section '{}'",
                    config.id
                ),
                EpcErrorEnum::ConfigError
            )
        })?;

        section::realize(
            registry,
            self.backends[memdev].as_mut(),
            config,
            memdev,
            boot_cpus,
        )
    }

    /// Reset one section. Part of a full reset pass; see [`Self::reset_all`]
    /// for the supported entry point.
    pub fn reset_section(&mut self, idx: usize) -> EpcResult<()> {
        let registry = self.registry.as_mut().ok_or_else(invariant_violation)?;
        let memdev = registry
            .sections
            .get(idx)
            .ok_or_else(|| {
                new_epc_failure!(
                    format!("No EPC section registered at index {}", idx),
                    EpcErrorEnum::SectionNotFound
                )
            })?
            .memdev();

        section::reset(registry, self.backends[memdev].as_mut(), idx)
    }

    /// Perform a full system reset pass: tear down and re-place every
    /// section, in registration order.
    ///
    /// This is the supported way to deliver a system reset. Resetting
    /// sections individually and out of order leaves the shared totals
    /// inconsistent until the pass completes.
    pub fn reset_all(&mut self) -> EpcResult<()> {
        let count = match self.registry.as_ref() {
            Some(registry) => registry.sections.len(),
            None => return Ok(()),
        };

        for idx in 0..count {
            self.reset_section(idx)
                .map_err(|e| e.add_subaction("Failed EPC reset pass".to_string()))?;
        }

        debug!("EPC reset pass complete ({} sections)", count);
        Ok(())
    }

    /// Unrealize one section at shutdown, detaching its backend without
    /// destroying the memory or the placement.
    pub fn unrealize_section(&mut self, idx: usize) -> EpcResult<()> {
        let registry = self.registry.as_ref().ok_or_else(invariant_violation)?;
        let memdev = registry
            .sections
            .get(idx)
            .ok_or_else(|| {
                new_epc_failure!(
                    format!("No EPC section registered at index {}", idx),
                    EpcErrorEnum::SectionNotFound
                )
            })?
            .memdev();

        section::unrealize(self.backends[memdev].as_mut());
        Ok(())
    }

    /// Look up the placement address and size of the section registered at
    /// `idx`.
    pub fn lookup_section(&self, idx: usize) -> EpcResult<(u64, u64)> {
        let registry = self.registry.as_ref().ok_or_else(|| {
            new_epc_failure!(
                format!("No EPC section registered at index {}", idx),
                EpcErrorEnum::SectionNotFound
            )
        })?;

        let epc_section = registry.sections.get(idx).ok_or_else(|| {
            new_epc_failure!(
                format!("No EPC section registered at index {}", idx),
                EpcErrorEnum::SectionNotFound
            )
        })?;

        Ok((
            epc_section.addr(),
            self.backends[epc_section.memdev()].size(),
        ))
    }

    /// Report whether the feature is active and the committed totals.
    pub fn describe(&self) -> EpcDescribeInfo {
        EpcDescribeInfo {
            enabled: self.enabled(),
            total_size_bytes: self.registry.as_ref().map_or(0, |r| r.size),
            nr_sections: self.registry.as_ref().map_or(0, |r| r.sections.len()),
        }
    }

    /// Report the registered sections in registration order.
    pub fn describe_sections(&self) -> Vec<EpcSectionInfo> {
        let registry = match self.registry.as_ref() {
            Some(registry) => registry,
            None => return Vec::new(),
        };

        registry
            .sections
            .iter()
            .enumerate()
            .map(|(index, epc_section)| EpcSectionInfo {
                index,
                address: epc_section.addr(),
                size_bytes: self.backends[epc_section.memdev()].size(),
            })
            .collect()
    }

    /// Render the describe summary as JSON for the monitor collaborator.
    pub fn describe_json(&self) -> EpcResult<String> {
        serde_json::to_string_pretty(&self.describe()).map_err(|err| {
            new_epc_failure!(
                format!("Failed to serialize EPC describe info: {}", err),
                EpcErrorEnum::UnspecifiedError
            )
        })
    }

    /// Record the instantiation of one guest vCPU. Section realization is
    /// rejected from the first call onwards.
    pub fn add_boot_cpu(&mut self) {
        self.boot_cpus += 1;
    }

    /// Number of guest vCPUs instantiated so far.
    pub fn boot_cpus(&self) -> u32 {
        self.boot_cpus
    }

    /// The placement registry, if machine init has run with kernel support
    /// present.
    pub fn registry(&self) -> Option<&EpcRegistry> {
        self.registry.as_ref()
    }

    fn resolve_backend(&self, memdev: &str) -> EpcResult<usize> {
        self.backends
            .iter()
            .position(|b| b.id() == memdev)
            .ok_or_else(|| {
                new_epc_failure!(
                    format!("'memdev' property is not set or unknown: {}", memdev),
                    EpcErrorEnum::ConfigError
                )
            })
    }
}

fn invariant_violation() -> EpcFailure {
    new_epc_failure!(
        "EPC registry is not initialized",
        EpcErrorEnum::UnspecifiedError
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::epc_driver::EpcDevicePaths;
    use std::fs::File;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn stand_in_paths(dir: &Path, with_device: bool) -> EpcDevicePaths {
        let paths = EpcDevicePaths {
            vepc: dir.join("sgx_vepc"),
            virt: dir.join("sgx_virt"),
        };
        if with_device {
            let node = File::create(&paths.vepc).unwrap();
            node.set_len(1 << 20).unwrap();
        }
        paths
    }

    fn machine_with_backends(sizes: &[u64]) -> (EpcMachine, TempDir) {
        let dir = tempdir().unwrap();
        let mut machine = EpcMachine::new(&stand_in_paths(dir.path(), true));
        for (i, size) in sizes.iter().enumerate() {
            machine
                .add_epc_backend(&EpcBackendConfig {
                    id: format!("mem{}", i),
                    size_bytes: *size,
                    prealloc: false,
                })
                .unwrap();
        }
        (machine, dir)
    }

    fn section_configs(count: usize) -> Vec<EpcSectionConfig> {
        (0..count)
            .map(|i| EpcSectionConfig {
                id: format!("epc{}", i),
                memdev: format!("mem{}", i),
            })
            .collect()
    }

    /// Tests contiguous placement: two sections of 4096 and 8192 bytes at
    /// base 0x100000000 land at 0x100000000 and 0x100001000 with a total of
    /// 12288 bytes.
    #[test]
    fn test_contiguous_placement() {
        let (mut machine, _dir) = machine_with_backends(&[4096, 8192]);
        machine.init(0, &section_configs(2)).unwrap();

        assert_eq!(machine.lookup_section(0).unwrap(), (0x1_0000_0000, 4096));
        assert_eq!(machine.lookup_section(1).unwrap(), (0x1_0000_1000, 8192));

        let info = machine.describe();
        assert!(info.enabled);
        assert_eq!(info.total_size_bytes, 12288);
        assert_eq!(info.nr_sections, 2);
    }

    /// Tests that the placement address of section i equals base plus the
    /// sum of the sizes of sections 0..i.
    #[test]
    fn test_placement_no_gaps() {
        let sizes = [4096u64, 16384, 8192, 4096];
        let (mut machine, _dir) = machine_with_backends(&sizes);
        machine.init(0x1000_0000, &section_configs(4)).unwrap();

        let base = machine.registry().unwrap().base();
        let mut expected = base;
        for (i, size) in sizes.iter().enumerate() {
            let (addr, got_size) = machine.lookup_section(i).unwrap();
            assert_eq!(addr, expected);
            assert_eq!(got_size, *size);
            expected += size;
        }
    }

    /// Tests that a section whose backend is already mapped fails with a
    /// conflict and does not mutate the registry bookkeeping.
    #[test]
    fn test_conflicting_memdev() {
        let (mut machine, _dir) = machine_with_backends(&[4096]);
        machine.init(0, &section_configs(1)).unwrap();

        let err = machine
            .realize_section(&EpcSectionConfig {
                id: "epc1".to_string(),
                memdev: "mem0".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.error_code, EpcErrorEnum::ConflictError);
        assert!(err.additional_info.contains(&"mem0".to_string()));

        let info = machine.describe();
        assert_eq!(info.total_size_bytes, 4096);
        assert_eq!(info.nr_sections, 1);
    }

    /// Tests that realizing after a vCPU exists is rejected as an ordering
    /// violation.
    #[test]
    fn test_realize_after_vcpu() {
        let (mut machine, _dir) = machine_with_backends(&[4096, 4096]);
        machine.init(0, &section_configs(1)).unwrap();

        machine.add_boot_cpu();
        let err = machine
            .realize_section(&EpcSectionConfig {
                id: "epc1".to_string(),
                memdev: "mem1".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.error_code, EpcErrorEnum::OrderingError);
        assert_eq!(machine.describe().nr_sections, 1);
    }

    /// Tests that an unknown memdev reference is a configuration error.
    #[test]
    fn test_unknown_memdev() {
        let (mut machine, _dir) = machine_with_backends(&[4096]);
        let err = machine
            .init(
                0,
                &[EpcSectionConfig {
                    id: "epc0".to_string(),
                    memdev: "nosuch".to_string(),
                }],
            )
            .unwrap_err();
        assert_eq!(err.error_code, EpcErrorEnum::ConfigError);
    }

    /// Tests that a full reset pass preserves every section's address and
    /// size and the committed total.
    #[test]
    fn test_reset_all_preserves_layout() {
        let (mut machine, _dir) = machine_with_backends(&[4096, 8192]);
        machine.init(0, &section_configs(2)).unwrap();

        let before: Vec<_> = (0..2).map(|i| machine.lookup_section(i).unwrap()).collect();
        for _ in 0..3 {
            machine.reset_all().unwrap();
        }
        let after: Vec<_> = (0..2).map(|i| machine.lookup_section(i).unwrap()).collect();

        assert_eq!(before, after);
        assert_eq!(machine.describe().total_size_bytes, 12288);
    }

    /// Tests that resetting section 0 alone re-places it at a freshly
    /// computed address without altering section 1's registered address or
    /// size.
    #[test]
    fn test_single_section_reset() {
        let (mut machine, _dir) = machine_with_backends(&[4096, 8192]);
        machine.init(0, &section_configs(2)).unwrap();

        let section1_before = machine.lookup_section(1).unwrap();
        machine.reset_section(0).unwrap();

        // Section 0 restarts the placement at the base address.
        assert_eq!(machine.lookup_section(0).unwrap(), (0x1_0000_0000, 4096));
        assert_eq!(machine.lookup_section(1).unwrap(), section1_before);
    }

    /// Tests that cumulative placement wrapping the address space aborts
    /// machine initialization.
    #[test]
    fn test_address_space_wraparound() {
        let (mut machine, _dir) = machine_with_backends(&[4096]);
        let err = machine
            .init(u64::MAX - EPC_HIGH_MEMORY_START, &section_configs(1))
            .unwrap_err();
        assert_eq!(err.error_code, EpcErrorEnum::AddressSpaceOverflow);
    }

    /// Tests that an absent capability probe leaves the subsystem invisible:
    /// no sections, not enabled, no backend allocation attempted.
    #[test]
    fn test_probe_absent_subsystem_invisible() {
        let dir = tempdir().unwrap();
        let mut machine = EpcMachine::new(&stand_in_paths(dir.path(), false));

        assert!(!machine.enabled());
        let err = machine
            .add_epc_backend(&EpcBackendConfig {
                id: "mem0".to_string(),
                size_bytes: 4096,
                prealloc: false,
            })
            .unwrap_err();
        assert_eq!(err.error_code, EpcErrorEnum::ResourceUnavailable);

        machine.init(0, &[]).unwrap();
        let info = machine.describe();
        assert!(!info.enabled);
        assert_eq!(info.nr_sections, 0);
        assert_eq!(info.total_size_bytes, 0);
        assert!(machine.lookup_section(0).is_err());
    }

    /// Tests that unrealize detaches the backend without withdrawing the
    /// placement, and that the backend becomes attachable again.
    #[test]
    fn test_unrealize_detaches_backend() {
        let (mut machine, _dir) = machine_with_backends(&[4096]);
        machine.init(0, &section_configs(1)).unwrap();

        machine.unrealize_section(0).unwrap();
        // Placement bookkeeping survives the detach.
        assert_eq!(machine.describe().total_size_bytes, 4096);
        assert_eq!(machine.lookup_section(0).unwrap().0, 0x1_0000_0000);
    }

    /// Tests section lookup failures for out-of-range indices.
    #[test]
    fn test_lookup_out_of_range() {
        let (mut machine, _dir) = machine_with_backends(&[4096]);
        machine.init(0, &section_configs(1)).unwrap();

        let err = machine.lookup_section(7).unwrap_err();
        assert_eq!(err.error_code, EpcErrorEnum::SectionNotFound);
        assert!(machine.reset_section(7).is_err());
        assert!(machine.unrealize_section(7).is_err());
    }

    /// Tests the JSON shape of the describe output.
    #[test]
    fn test_describe_json() {
        let (mut machine, _dir) = machine_with_backends(&[4096]);
        machine.init(0, &section_configs(1)).unwrap();

        let json = machine.describe_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["Enabled"], true);
        assert_eq!(value["TotalSizeBytes"], 4096);
        assert_eq!(value["NumberOfSections"], 1);

        let sections = machine.describe_sections();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].address, 0x1_0000_0000);
        assert_eq!(sections[0].size_bytes, 4096);
    }

    /// Tests that a RAM backend satisfies the generic memdev link of a
    /// section.
    #[test]
    fn test_section_over_ram_backend() {
        let dir = tempdir().unwrap();
        let mut machine = EpcMachine::new(&stand_in_paths(dir.path(), true));
        machine.add_ram_backend("ram0", 4096);

        machine
            .init(
                0,
                &[EpcSectionConfig {
                    id: "epc0".to_string(),
                    memdev: "ram0".to_string(),
                }],
            )
            .unwrap();
        assert_eq!(machine.lookup_section(0).unwrap(), (0x1_0000_0000, 4096));
    }
}
