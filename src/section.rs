// Copyright 2021 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
#![deny(warnings)]

//! EPC section devices and their lifecycle.
//!
//! A section is the guest-visible placement of one backend's memory inside
//! the machine's EPC area. Sections are realized strictly before any vCPU
//! exists, may be reset any number of times as part of a full system reset
//! pass, and are detached (not destroyed) at shutdown. Every operation runs
//! against the registry context; there is no ambient global state.

use log::{debug, warn};
use serde::Deserialize;

use crate::backend::HostMemoryBackend;
use crate::common::{EpcErrorEnum, EpcResult};
use crate::new_epc_failure;
use crate::registry::EpcRegistry;

/// Configuration for one EPC section, as produced by the option parsing
/// front end.
#[derive(Debug, Clone, Deserialize)]
pub struct EpcSectionConfig {
    /// The section device id, e.g. "epc0".
    pub id: String,
    /// The id of the memory backend object this section maps.
    pub memdev: String,
}

/// One realized EPC section.
#[derive(Debug)]
pub struct EpcSection {
    /// The section device id.
    id: String,
    /// Index of the linked backend in the machine's backend table. Set
    /// exactly once, at realize time.
    memdev: usize,
    /// The assigned guest-physical placement address.
    addr: u64,
}

impl EpcSection {
    /// The section device id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The linked backend's index in the machine's backend table.
    pub fn memdev(&self) -> usize {
        self.memdev
    }

    /// The current guest-physical placement address.
    pub fn addr(&self) -> u64 {
        self.addr
    }
}

/// Realize a section: verify the placement preconditions, allocate the
/// backend if needed, and place the section at the next contiguous address.
///
/// On failure the section is not registered and the registry bookkeeping is
/// untouched.
pub(crate) fn realize(
    registry: &mut EpcRegistry,
    backend: &mut dyn HostMemoryBackend,
    config: &EpcSectionConfig,
    memdev: usize,
    boot_cpus: u32,
) -> EpcResult<()> {
    if boot_cpus != 0 {
        return Err(new_epc_failure!(
            format!(
                "EPC section '{}' can't be created after vCPUs ({} already present)",
                config.id, boot_cpus
            ),
            EpcErrorEnum::OrderingError
        ));
    }

    if backend.is_mapped() {
        return Err(new_epc_failure!(
            format!("Can't use already busy memdev: {}", backend.id()),
            EpcErrorEnum::ConflictError
        )
        .add_info(vec![backend.id()]));
    }

    if backend.memory().is_err() {
        backend
            .alloc()
            .map_err(|e| e.add_subaction(format!("Failed to realize section '{}'", config.id)))?;
    }

    registry.sections.push(EpcSection {
        id: config.id.clone(),
        memdev,
        addr: 0,
    });

    let idx = registry.sections.len() - 1;
    if let Err(err) = place(registry, idx, backend) {
        // Leave no partial registration behind.
        registry.sections.pop();
        return Err(err.add_subaction(format!("Failed to place section '{}'", config.id)));
    }

    registry.total_sections += 1;
    debug!(
        "Realized EPC section '{}' at {:#x} ({} bytes)",
        config.id,
        registry.sections[idx].addr(),
        backend.size()
    );

    Ok(())
}

/// Reset one section as part of a system reset pass: withdraw its placement,
/// recreate the backend's resource, and re-place it at a freshly computed
/// address.
///
/// The registry totals are zeroed when the pass has withdrawn every realized
/// section; the pass must therefore reset all sections, in order, before any
/// section is re-placed out of turn. `EpcRegistry` documents the full-pass
/// entry point.
pub(crate) fn reset(
    registry: &mut EpcRegistry,
    backend: &mut dyn HostMemoryBackend,
    idx: usize,
) -> EpcResult<()> {
    del_subregion(registry, backend, idx)?;

    backend
        .reset()
        .map_err(|e| e.add_subaction(format!("Failed to reset section {}", idx)))?;

    place(registry, idx, backend)
}

/// Unrealize a section at shutdown: release the backend for reuse without
/// destroying its memory or withdrawing the placement.
pub(crate) fn unrealize(backend: &mut dyn HostMemoryBackend) {
    backend.set_mapped(false);
}

/// Withdraw a section's placement and clear its backend's mapped flag.
/// Zeroes the global totals once the last accounted section is withdrawn.
fn del_subregion(
    registry: &mut EpcRegistry,
    backend: &mut dyn HostMemoryBackend,
    idx: usize,
) -> EpcResult<()> {
    let offset = registry.sections[idx].addr.wrapping_sub(registry.base);
    registry.address_space.del_subregion(offset)?;
    backend.set_mapped(false);

    // Multiple sections; only zero the totals when the whole set has been
    // accounted for.
    if registry.total_sections == registry.nr_sections {
        registry.size = 0;
        registry.nr_sections = 0;
    } else if registry.nr_sections == 0 {
        warn!("EPC reset pass withdrew more sections than were registered");
    }

    Ok(())
}

/// Place a section at the next contiguous address and grow the totals.
fn place(
    registry: &mut EpcRegistry,
    idx: usize,
    backend: &mut dyn HostMemoryBackend,
) -> EpcResult<()> {
    let region_size = backend.memory()?.mem_size();
    let addr = registry.base.wrapping_add(registry.size);

    registry
        .address_space
        .add_subregion(addr.wrapping_sub(registry.base), region_size)?;
    backend.set_mapped(true);

    registry.sections[idx].addr = addr;
    registry.nr_sections += 1;
    registry.size += region_size;

    Ok(())
}
