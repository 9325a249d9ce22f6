// SPDX-License-Identifier: Apache-2.0

//! Guest memory table.
//!
//! The master describes guest RAM as up to [`MEM_REGIONS_MAX`] regions, each
//! backed by a shared fd. Every region is mapped read-write into this
//! process and recorded with its guest-physical base and its base in the
//! master's address space, so the table can translate both kinds of
//! addresses into local pointers. Lookups are linear; the table is tiny.

use std::fs::File;

use log::{debug, error, warn};
use vm_memory::{FileOffset, MmapRegion};

use crate::message::MEM_REGIONS_MAX;
use crate::{Error, Result};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Translation of guest-physical ranges into locally mapped addresses.
///
/// The virtqueue resolves descriptor payload addresses through this seam, so
/// it can be exercised against plain process memory in tests.
pub trait GpaTranslator {
    /// Translate `[gpa, gpa + len)` if it is fully covered by one region.
    /// A zero-length range never translates.
    fn gpa_range_to_hva(&self, gpa: u64, len: u32) -> Option<usize>;
}

struct GuestRegion {
    gpa: u64,
    uva: u64,
    pages: u32,
    mapping: MmapRegion,
}

impl GuestRegion {
    fn size(&self) -> u64 {
        u64::from(self.pages) << PAGE_SHIFT
    }

    fn hva(&self) -> usize {
        self.mapping.as_ptr() as usize
    }
}

/// Fixed-size table of mapped guest memory regions.
#[derive(Default)]
pub struct GuestMemoryMap {
    regions: [Option<GuestRegion>; MEM_REGIONS_MAX],
}

impl GuestMemoryMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Map a region described by the master into slot `index`.
    ///
    /// Takes ownership of `file`; the mapping keeps it alive and closes it
    /// on unmap. qemu resends unchanged tables when unrelated mappings
    /// change, so a slot already holding the same `(gpa, pages)` pair keeps
    /// its mapping and the duplicate fd is closed.
    pub fn map_region(
        &mut self,
        index: usize,
        gpa: u64,
        uva: u64,
        size: u64,
        offset: u64,
        file: File,
    ) -> Result<()> {
        if index >= MEM_REGIONS_MAX {
            error!("memory region index {} out of range", index);
            return Err(Error::InvalidParam);
        }
        if size == 0 || size % PAGE_SIZE != 0 || offset % PAGE_SIZE != 0 {
            error!(
                "memory region {} not page aligned: size {:#x} offset {:#x}",
                index, size, offset
            );
            return Err(Error::InvalidParam);
        }

        let pages = (size >> PAGE_SHIFT) as u32;
        if let Some(region) = &self.regions[index] {
            if region.gpa == gpa && region.pages == pages {
                // Identical region resent: keep the mapping, drop the dup fd.
                debug!("memory region {} resent unchanged, keeping mapping", index);
                return Ok(());
            }
            error!(
                "memory region {} already mapped at gpa {:#x}, refusing gpa {:#x}",
                index, region.gpa, gpa
            );
            return Err(Error::RegionBusy(index));
        }

        let mapping = MmapRegion::from_file(FileOffset::new(file, offset), size as usize)
            .map_err(|e| {
                error!("mmap of guest region {} failed: {}", index, e);
                Error::MmapFailed(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;

        let region = GuestRegion {
            gpa,
            uva,
            pages,
            mapping,
        };
        debug!(
            "guest region {} mapped at {:#x}: gpa {:#x} uva {:#x} pages {}",
            index,
            region.hva(),
            gpa,
            uva,
            pages
        );
        self.regions[index] = Some(region);
        Ok(())
    }

    /// Unmap one slot; dropping the mapping also closes the backing fd.
    pub fn unmap_region(&mut self, index: usize) {
        if index < MEM_REGIONS_MAX {
            if let Some(region) = self.regions[index].take() {
                debug!("guest region {} unmapped from {:#x}", index, region.hva());
            }
        }
    }

    pub fn unmap_all(&mut self) {
        for index in 0..MEM_REGIONS_MAX {
            self.unmap_region(index);
        }
    }

    pub fn is_mapped(&self, index: usize) -> bool {
        index < MEM_REGIONS_MAX && self.regions[index].is_some()
    }

    pub fn num_regions(&self) -> usize {
        self.regions.iter().filter(|r| r.is_some()).count()
    }

    /// Translate an address in the master's address space. Ring addresses in
    /// `SET_VRING_ADDR` arrive in this form.
    pub fn uva_to_hva(&self, uva: u64) -> Option<usize> {
        for region in self.regions.iter().flatten() {
            if uva >= region.uva && uva - region.uva < region.size() {
                return Some(region.hva() + (uva - region.uva) as usize);
            }
        }
        warn!("no mapping for master address {:#x}", uva);
        None
    }
}

impl GpaTranslator for GuestMemoryMap {
    fn gpa_range_to_hva(&self, gpa: u64, len: u32) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let last = gpa.checked_add(u64::from(len) - 1)?;
        for region in self.regions.iter().flatten() {
            if gpa >= region.gpa && gpa - region.gpa < region.size() {
                // Ranges spilling past the region are unsupported, even if
                // another region happens to continue where this one ends.
                if last - region.gpa >= region.size() {
                    return None;
                }
                return Some(region.hva() + (gpa - region.gpa) as usize);
            }
        }
        None
    }
}
