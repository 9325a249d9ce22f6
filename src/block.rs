// SPDX-License-Identifier: Apache-2.0

//! virtio-blk device type.
//!
//! Parses descriptor chains into block requests and hands them to the
//! request queue; the caller's I/O engine executes them and calls
//! [`BlockRequest::complete`], which publishes the used element and rings
//! the guest's completion doorbell.
//!
//! Message framing relies on `VIRTIO_F_ANY_LAYOUT` staying unnegotiated: a
//! 16-byte header buffer, data buffers for IN/OUT/GET_ID, and a one-byte
//! writable status buffer at the end of the chain.

use std::sync::{Arc, RwLock};

use log::{error, warn};
use virtio_bindings::virtio_blk::{
    VIRTIO_BLK_F_BLK_SIZE, VIRTIO_BLK_F_MQ, VIRTIO_BLK_F_RO, VIRTIO_BLK_F_SEG_MAX,
    VIRTIO_BLK_F_SIZE_MAX, VIRTIO_BLK_ID_BYTES, VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK,
    VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use virtio_bindings::virtio_config::VIRTIO_F_VERSION_1;
use vm_memory::ByteValued;

use crate::memory::GuestMemoryMap;
use crate::request_queue::RequestQueue;
use crate::vdev::VhostDevice;
use crate::vring::Vring;
use crate::virtqueue::{DescriptorChain, VringBuffer};
use crate::{Error, Result};

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
struct VirtioBlkReqHeader {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

unsafe impl ByteValued for VirtioBlkReqHeader {}

/// virtio-blk config space, exposed through `GET_CONFIG`.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtioBlkConfig {
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
    pub blk_size: u32,
    pub physical_block_exp: u8,
    pub alignment_offset: u8,
    pub min_io_size: u16,
    pub opt_io_size: u32,
    pub writeback: u8,
    pub unused0: u8,
    pub num_queues: u16,
}

unsafe impl ByteValued for VirtioBlkConfig {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockIoKind {
    Read,
    Write,
}

/// One guest block I/O, parsed and bounds-checked, waiting for the caller's
/// I/O engine. Consuming it with [`BlockRequest::complete`] reports the
/// outcome back to the guest.
pub struct BlockRequest {
    kind: BlockIoKind,
    first_sector: u64,
    num_sectors: u64,
    data: Vec<VringBuffer>,
    status: VringBuffer,
    head_index: u16,
    used_len: u32,
    vring: Arc<RwLock<Vring>>,
}

impl BlockRequest {
    pub fn kind(&self) -> BlockIoKind {
        self.kind
    }

    pub fn first_sector(&self) -> u64 {
        self.first_sector
    }

    pub fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    /// Scatter-gather list of the request, in guest order.
    pub fn data(&self) -> &[VringBuffer] {
        &self.data
    }

    /// Report the outcome to the guest: status byte, used element, doorbell.
    pub fn complete(self, result: std::io::Result<()>) {
        let (code, used_len) = match result {
            Ok(()) => (VIRTIO_BLK_S_OK as u8, self.used_len),
            Err(ref e) => {
                error!(
                    "{:?} of {} sectors at {} failed: {}",
                    self.kind, self.num_sectors, self.first_sector, e
                );
                (VIRTIO_BLK_S_IOERR as u8, 1)
            }
        };
        self.status.write_at(0, &[code]);

        let mut vring = self.vring.write().unwrap();
        vring.vq.add_used(self.head_index, used_len);
        vring.vq.notify();
    }
}

/// A block device served over vhost-user.
pub struct BlockDevice {
    config: VirtioBlkConfig,
    serial: String,
    num_sectors: u64,
    read_only: bool,
    num_queues: u16,
}

impl BlockDevice {
    /// `total_blocks` device blocks of `block_size` bytes each; `block_size`
    /// must be a multiple of the 512-byte virtio sector.
    pub fn new(
        serial: &str,
        total_blocks: u64,
        block_size: u32,
        num_queues: u16,
        read_only: bool,
    ) -> Result<Self> {
        if block_size == 0 || u64::from(block_size) % SECTOR_SIZE != 0 {
            error!(
                "block size {} is not a multiple of the {} byte sector",
                block_size, SECTOR_SIZE
            );
            return Err(Error::InvalidParam);
        }
        if num_queues == 0 {
            return Err(Error::InvalidParam);
        }

        let num_sectors = total_blocks * (u64::from(block_size) >> SECTOR_SHIFT);
        let config = VirtioBlkConfig {
            capacity: num_sectors,
            size_max: 65536,
            seg_max: 126,
            blk_size: block_size,
            min_io_size: 1,
            opt_io_size: 1,
            num_queues,
            ..Default::default()
        };

        Ok(BlockDevice {
            config,
            serial: serial.to_string(),
            num_sectors,
            read_only,
            num_queues,
        })
    }

    pub fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    fn commit(vring: &Arc<RwLock<Vring>>, head: u16, len: u32) {
        let mut vring = vring.write().unwrap();
        vring.vq.add_used(head, len);
        vring.vq.notify();
    }

    /// Drop a chain whose framing is unusable, without touching any buffer.
    fn abort_chain(vring: &Arc<RwLock<Vring>>, head: u16) {
        Self::commit(vring, head, 0);
    }

    /// Complete a chain with an error status.
    fn fail_chain(vring: &Arc<RwLock<Vring>>, head: u16, status: &VringBuffer, code: u8) {
        status.write_at(0, &[code]);
        Self::commit(vring, head, 1);
    }

    fn status_buffer(chain: &DescriptorChain) -> Option<&VringBuffer> {
        let status = chain.buffers.last()?;
        if status.len() == 1 && status.is_write_only() {
            Some(status)
        } else {
            None
        }
    }

    fn handle_io(
        &self,
        header: &VirtioBlkReqHeader,
        chain: &DescriptorChain,
        vring: &Arc<RwLock<Vring>>,
        rq: &RequestQueue,
    ) {
        let head = chain.head_index;
        if chain.buffers.len() < 3 {
            error!("block request with only {} buffers", chain.buffers.len());
            Self::abort_chain(vring, head);
            return;
        }
        let status = match Self::status_buffer(chain) {
            Some(s) => s.clone(),
            None => {
                error!("block request without a usable status buffer");
                Self::abort_chain(vring, head);
                return;
            }
        };

        let req_type = header.req_type;
        let kind = if req_type == VIRTIO_BLK_T_IN {
            BlockIoKind::Read
        } else {
            BlockIoKind::Write
        };
        if kind == BlockIoKind::Write && self.read_only {
            warn!("write request on read-only device");
            Self::fail_chain(vring, head, &status, VIRTIO_BLK_S_IOERR as u8);
            return;
        }

        let data = &chain.buffers[1..chain.buffers.len() - 1];
        let mut total_sectors = 0u64;
        let mut data_bytes = 0u64;
        for buf in data {
            if u64::from(buf.len()) % SECTOR_SIZE != 0 {
                error!("data buffer length {} not sector aligned", buf.len());
                Self::fail_chain(vring, head, &status, VIRTIO_BLK_S_IOERR as u8);
                return;
            }
            // Reads fill guest buffers, writes drain them; the chain must
            // agree on the direction of every data buffer.
            if (kind == BlockIoKind::Read) != buf.is_write_only() {
                error!("data buffer direction does not match request type");
                Self::fail_chain(vring, head, &status, VIRTIO_BLK_S_IOERR as u8);
                return;
            }
            total_sectors += u64::from(buf.len()) >> SECTOR_SHIFT;
            data_bytes += u64::from(buf.len());
        }

        if total_sectors == 0 {
            error!("zero-length block request");
            Self::fail_chain(vring, head, &status, VIRTIO_BLK_S_IOERR as u8);
            return;
        }

        let sector = header.sector;
        match sector.checked_add(total_sectors - 1) {
            Some(last) if last < self.num_sectors => {}
            _ => {
                error!(
                    "request beyond device end: sector {} count {}",
                    sector, total_sectors
                );
                Self::fail_chain(vring, head, &status, VIRTIO_BLK_S_IOERR as u8);
                return;
            }
        }

        let used_len = match kind {
            BlockIoKind::Read => data_bytes as u32 + 1,
            BlockIoKind::Write => 1,
        };
        rq.enqueue(BlockRequest {
            kind,
            first_sector: sector,
            num_sectors: total_sectors,
            data: data.to_vec(),
            status,
            head_index: head,
            used_len,
            vring: Arc::clone(vring),
        });
    }

    fn handle_get_id(&self, chain: &DescriptorChain, vring: &Arc<RwLock<Vring>>) {
        let head = chain.head_index;
        if chain.buffers.len() != 3 {
            error!("GET_ID request with {} buffers", chain.buffers.len());
            Self::abort_chain(vring, head);
            return;
        }
        let status = match Self::status_buffer(chain) {
            Some(s) => s.clone(),
            None => {
                Self::abort_chain(vring, head);
                return;
            }
        };

        let id_buf = &chain.buffers[1];
        if id_buf.len() as usize != VIRTIO_BLK_ID_BYTES as usize || !id_buf.is_write_only() {
            error!("bad GET_ID buffer (len {})", id_buf.len());
            Self::fail_chain(vring, head, &status, VIRTIO_BLK_S_IOERR as u8);
            return;
        }

        // Serial is padded with zeroes and silently truncated, no NUL needed.
        let mut id = [0u8; VIRTIO_BLK_ID_BYTES as usize];
        let serial = self.serial.as_bytes();
        let n = serial.len().min(id.len());
        id[..n].copy_from_slice(&serial[..n]);
        id_buf.write_at(0, &id);

        status.write_at(0, &[VIRTIO_BLK_S_OK as u8]);
        Self::commit(vring, head, VIRTIO_BLK_ID_BYTES + 1);
    }

    fn handle_chain(
        &self,
        chain: DescriptorChain,
        vring: &Arc<RwLock<Vring>>,
        rq: &RequestQueue,
    ) {
        let head = chain.head_index;
        let hdr_buf = match chain.buffers.first() {
            Some(b) => b,
            None => return,
        };

        let mut header = VirtioBlkReqHeader::default();
        if hdr_buf.len() as usize != std::mem::size_of::<VirtioBlkReqHeader>()
            || !hdr_buf.read_at(0, header.as_mut_slice())
        {
            error!("unreadable block request header (len {})", hdr_buf.len());
            Self::abort_chain(vring, head);
            return;
        }

        let req_type = header.req_type;
        match req_type {
            t if t == VIRTIO_BLK_T_IN || t == VIRTIO_BLK_T_OUT => {
                self.handle_io(&header, &chain, vring, rq)
            }
            t if t == VIRTIO_BLK_T_GET_ID => self.handle_get_id(&chain, vring),
            t => {
                warn!("unknown block request type {}", t);
                match Self::status_buffer(&chain) {
                    Some(status) => {
                        let status = status.clone();
                        Self::fail_chain(vring, head, &status, VIRTIO_BLK_S_UNSUPP as u8)
                    }
                    None => Self::abort_chain(vring, head),
                }
            }
        }
    }
}

impl VhostDevice for BlockDevice {
    fn features(&self) -> u64 {
        let mut features = (1u64 << VIRTIO_BLK_F_SIZE_MAX)
            | (1 << VIRTIO_BLK_F_SEG_MAX)
            | (1 << VIRTIO_BLK_F_BLK_SIZE)
            | (1 << VIRTIO_F_VERSION_1);
        if self.num_queues > 1 {
            features |= 1 << VIRTIO_BLK_F_MQ;
        }
        if self.read_only {
            features |= 1 << VIRTIO_BLK_F_RO;
        }
        features
    }

    fn get_config(&self, _offset: u32, size: u32) -> Vec<u8> {
        // Masters read from the start of the config space; the filling is
        // clamped to whatever fits the requested window.
        let config = self.config.as_slice();
        config[..config.len().min(size as usize)].to_vec()
    }

    fn dispatch_requests(
        &self,
        vring: &Arc<RwLock<Vring>>,
        mem: &Arc<RwLock<GuestMemoryMap>>,
        rq: &RequestQueue,
    ) -> Result<()> {
        loop {
            let chain = {
                let mut vring_guard = vring.write().unwrap();
                let mem_guard = mem.read().unwrap();
                vring_guard.vq.pop_chain(&*mem_guard)
            };
            match chain {
                Some(chain) => self.handle_chain(chain, vring, rq),
                None => return Ok(()),
            }
        }
    }
}
