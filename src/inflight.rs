// SPDX-License-Identifier: Apache-2.0

//! Inflight tracking region.
//!
//! A shared memory area recording descriptor heads that were taken off a
//! queue but not yet completed, split into one fixed-size sub-region per
//! queue. After a reconnect the master hands the same area back via
//! `SET_INFLIGHT_FD`, letting the slave resubmit what was in flight. The
//! slave allocates the area on demand from an anonymous memfd.

use std::ffi::CString;
use std::fs::File;
use std::mem;
use std::os::unix::io::FromRawFd;

use log::{debug, error};
use vm_memory::{ByteValued, FileOffset, MmapRegion};

use crate::message::{InflightSplitDesc, InflightSplitRegion};
use crate::{Error, Result};

/// Bytes tracking a single queue of `queue_size` descriptors.
pub fn per_queue_size(queue_size: u16) -> u64 {
    (mem::size_of::<InflightSplitRegion>()
        + usize::from(queue_size) * mem::size_of::<InflightSplitDesc>()) as u64
}

/// The mapped inflight area, either freshly allocated or adopted from the
/// master. Dropping it unmaps the area and closes the backing fd.
pub struct InflightRegion {
    mapping: MmapRegion,
    queue_size: u16,
    num_queues: u16,
}

impl InflightRegion {
    /// Create, size and zero a new area for `num_queues` queues, writing a
    /// fresh header for each. Returns the region and the fd to transfer to
    /// the master.
    pub fn allocate(queue_size: u16, num_queues: u16) -> Result<(Self, File)> {
        if queue_size == 0 || num_queues == 0 {
            return Err(Error::InvalidParam);
        }
        let total = per_queue_size(queue_size) * u64::from(num_queues);

        let name = CString::new("vhost-inflight").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            let e = std::io::Error::last_os_error();
            error!("memfd_create for inflight region failed: {}", e);
            return Err(Error::MmapFailed(e));
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(total).map_err(Error::MmapFailed)?;

        let mapped = file.try_clone().map_err(Error::MmapFailed)?;
        let mapping = MmapRegion::from_file(FileOffset::new(mapped, 0), total as usize)
            .map_err(|e| Error::MmapFailed(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        unsafe { std::ptr::write_bytes(mapping.as_ptr(), 0, total as usize) };

        let region = InflightRegion {
            mapping,
            queue_size,
            num_queues,
        };
        for queue in 0..num_queues {
            region.write_queue_header(
                queue,
                &InflightSplitRegion {
                    features: 0,
                    version: 1,
                    desc_num: queue_size,
                    last_batch_head: 0,
                    used_idx: 0,
                },
            );
        }

        debug!(
            "allocated inflight region: {} queues of {} descriptors, {} bytes",
            num_queues, queue_size, total
        );
        Ok((region, file))
    }

    /// Adopt an area handed over by the master on `SET_INFLIGHT_FD`.
    pub fn from_fd(file: File, mmap_size: u64, queue_size: u16, num_queues: u16) -> Result<Self> {
        if mmap_size == 0 {
            return Err(Error::InvalidParam);
        }
        let mapping = MmapRegion::from_file(FileOffset::new(file, 0), mmap_size as usize)
            .map_err(|e| {
                error!("mmap of master inflight fd failed: {}", e);
                Error::MmapFailed(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        Ok(InflightRegion {
            mapping,
            queue_size,
            num_queues,
        })
    }

    pub fn size(&self) -> u64 {
        self.mapping.size() as u64
    }

    fn queue_offset(&self, queue: u16) -> Option<usize> {
        if queue < self.num_queues {
            Some(usize::from(queue) * per_queue_size(self.queue_size) as usize)
        } else {
            None
        }
    }

    fn write_queue_header(&self, queue: u16, header: &InflightSplitRegion) {
        if let Some(offset) = self.queue_offset(queue) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    header.as_slice().as_ptr(),
                    self.mapping.as_ptr().add(offset),
                    mem::size_of::<InflightSplitRegion>(),
                );
            }
        }
    }

    /// Copy out the header of one queue's sub-region.
    pub fn queue_header(&self, queue: u16) -> Option<InflightSplitRegion> {
        let offset = self.queue_offset(queue)?;
        let mut header = InflightSplitRegion::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mapping.as_ptr().add(offset),
                header.as_mut_slice().as_mut_ptr(),
                mem::size_of::<InflightSplitRegion>(),
            );
        }
        Some(header)
    }

    /// Copy out one descriptor slot of one queue's sub-region.
    pub fn desc_state(&self, queue: u16, slot: u16) -> Option<InflightSplitDesc> {
        if slot >= self.queue_size {
            return None;
        }
        let offset = self.queue_offset(queue)?
            + mem::size_of::<InflightSplitRegion>()
            + usize::from(slot) * mem::size_of::<InflightSplitDesc>();
        let mut desc = InflightSplitDesc::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mapping.as_ptr().add(offset),
                desc.as_mut_slice().as_mut_ptr(),
                mem::size_of::<InflightSplitDesc>(),
            );
        }
        Some(desc)
    }
}
