// SPDX-License-Identifier: Apache-2.0

//! Wire format of the vhost-user protocol as seen by a backend server.
//!
//! Every message starts with a fixed 12-byte header followed by an optional
//! typed payload; file descriptors ride along as `SCM_RIGHTS` ancillary data.
//! See the vhost-user specification shipped with qemu for the field layouts.

use bitflags::bitflags;
use vm_memory::ByteValued;

/// Upper bound for the payload of a single message. Only `SET_MEM_TABLE` and
/// the config space accesses have variable size, and both fit comfortably.
pub const MAX_MSG_SIZE: usize = 0x1000;

/// Maximum number of file descriptors attached to one message.
pub const MAX_ATTACHED_FDS: usize = 8;

/// Maximum number of guest memory regions a master may install.
pub const MEM_REGIONS_MAX: usize = 8;

/// First valid offset of the virtio device configuration space.
pub const CONFIG_OFFSET: u32 = 0x100;

/// One past the last valid offset of the virtio device configuration space.
pub const CONFIG_SIZE: u32 = 0x1000;

/// Low bits of a vring fd payload select the vring index.
pub const VRING_IDX_MASK: u64 = 0xff;

/// Bit in a vring fd payload indicating that no fd was attached and the
/// master expects polling mode.
pub const VRING_NOFD_MASK: u64 = 0x100;

/// Requests flowing from the master to the slave.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum MasterReq {
    NOOP = 0,
    GET_FEATURES = 1,
    SET_FEATURES = 2,
    SET_OWNER = 3,
    RESET_OWNER = 4,
    SET_MEM_TABLE = 5,
    SET_LOG_BASE = 6,
    SET_LOG_FD = 7,
    SET_VRING_NUM = 8,
    SET_VRING_ADDR = 9,
    SET_VRING_BASE = 10,
    GET_VRING_BASE = 11,
    SET_VRING_KICK = 12,
    SET_VRING_CALL = 13,
    SET_VRING_ERR = 14,
    GET_PROTOCOL_FEATURES = 15,
    SET_PROTOCOL_FEATURES = 16,
    GET_QUEUE_NUM = 17,
    SET_VRING_ENABLE = 18,
    SEND_RARP = 19,
    NET_SET_MTU = 20,
    SET_SLAVE_REQ_FD = 21,
    IOTLB_MSG = 22,
    SET_VRING_ENDIAN = 23,
    GET_CONFIG = 24,
    SET_CONFIG = 25,
    CREATE_CRYPTO_SESSION = 26,
    CLOSE_CRYPTO_SESSION = 27,
    POSTCOPY_ADVISE = 28,
    POSTCOPY_LISTEN = 29,
    POSTCOPY_END = 30,
    GET_INFLIGHT_FD = 31,
    SET_INFLIGHT_FD = 32,
    MAX_CMD = 33,
}

impl MasterReq {
    /// Decode a request code from the raw header field.
    pub fn from_raw(code: u32) -> Option<MasterReq> {
        if code > MasterReq::NOOP as u32 && code < MasterReq::MAX_CMD as u32 {
            // Safe because the value was just range-checked against the
            // contiguous repr(u32) discriminants.
            Some(unsafe { std::mem::transmute::<u32, MasterReq>(code) })
        } else {
            None
        }
    }
}

bitflags! {
    /// Flag bits of the message header.
    pub struct VhostUserHeaderFlag: u32 {
        /// Bits[0..2] carry the protocol version, which must be 1.
        const VERSION = 0x3;
        /// The message is a reply.
        const REPLY = 0x4;
        /// The sender wants an acknowledgement reply (REPLY_ACK protocol).
        const NEED_REPLY = 0x8;
        /// All bits a conforming peer may set besides the version.
        const ALL_FLAGS = 0xc;
        /// Bits that must be zero.
        const RESERVED = !0xf;
    }
}

bitflags! {
    /// Transport feature bits defined by vhost-user on top of virtio.
    pub struct VhostUserVirtioFeatures: u64 {
        /// The peer understands `(GET|SET)_PROTOCOL_FEATURES`.
        const PROTOCOL_FEATURES = 0x4000_0000;
    }
}

bitflags! {
    /// Protocol feature bits negotiated via `(GET|SET)_PROTOCOL_FEATURES`.
    pub struct VhostUserProtocolFeatures: u64 {
        const MQ = 0x0000_0001;
        const LOG_SHMFD = 0x0000_0002;
        const RARP = 0x0000_0004;
        const REPLY_ACK = 0x0000_0008;
        const MTU = 0x0000_0010;
        const SLAVE_REQ = 0x0000_0020;
        const CROSS_ENDIAN = 0x0000_0040;
        const CRYPTO_SESSION = 0x0000_0080;
        const PAGEFAULT = 0x0000_0100;
        const CONFIG = 0x0000_0200;
    }
}

/// Syntactic validation of a message body; semantic checks (feature
/// dependencies, device state) belong to the protocol engine.
pub trait VhostUserMsgValidator {
    fn is_valid(&self) -> bool {
        true
    }
}

/// The fixed message header: request code, flags, payload size.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VhostUserMsgHeader {
    request: u32,
    flags: u32,
    size: u32,
}

/// Size of the wire header in bytes.
pub const MSG_HDR_SIZE: usize = std::mem::size_of::<VhostUserMsgHeader>();

impl VhostUserMsgHeader {
    /// Build a header, forcing the version field to 1.
    pub fn new(request: MasterReq, flags: u32, size: u32) -> Self {
        let flags = (flags & VhostUserHeaderFlag::ALL_FLAGS.bits()) | 0x1;
        VhostUserMsgHeader {
            request: request as u32,
            flags,
            size,
        }
    }

    pub fn code(&self) -> Option<MasterReq> {
        MasterReq::from_raw(self.request)
    }

    pub fn raw_code(&self) -> u32 {
        self.request
    }

    pub fn version(&self) -> u32 {
        self.flags & VhostUserHeaderFlag::VERSION.bits()
    }

    pub fn is_reply(&self) -> bool {
        self.flags & VhostUserHeaderFlag::REPLY.bits() != 0
    }

    pub fn need_reply(&self) -> bool {
        self.flags & VhostUserHeaderFlag::NEED_REPLY.bits() != 0
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

impl Default for VhostUserMsgHeader {
    fn default() -> Self {
        VhostUserMsgHeader {
            request: 0,
            flags: 0x1,
            size: 0,
        }
    }
}

unsafe impl ByteValued for VhostUserMsgHeader {}

impl VhostUserMsgValidator for VhostUserMsgHeader {
    fn is_valid(&self) -> bool {
        self.version() == 0x1
            && self.flags & VhostUserHeaderFlag::RESERVED.bits() == 0
            && self.size as usize <= MAX_MSG_SIZE
    }
}

/// A bare 64-bit payload, used by feature negotiation, vring fd messages and
/// REPLY_ACK status replies.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserU64 {
    pub value: u64,
}

impl VhostUserU64 {
    pub fn new(value: u64) -> Self {
        VhostUserU64 { value }
    }
}

unsafe impl ByteValued for VhostUserU64 {}

impl VhostUserMsgValidator for VhostUserU64 {}

/// Leading part of the `SET_MEM_TABLE` payload.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserMemory {
    pub num_regions: u32,
    pub padding: u32,
}

unsafe impl ByteValued for VhostUserMemory {}

impl VhostUserMsgValidator for VhostUserMemory {
    fn is_valid(&self) -> bool {
        self.padding == 0
            && self.num_regions >= 1
            && self.num_regions as usize <= MEM_REGIONS_MAX
    }
}

/// One guest memory region descriptor in the `SET_MEM_TABLE` payload.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserMemoryRegion {
    /// Guest physical base of the region.
    pub guest_phys_addr: u64,
    /// Region length in bytes.
    pub memory_size: u64,
    /// Base of the region in the master's address space.
    pub user_addr: u64,
    /// Offset into the attached fd where the region starts.
    pub mmap_offset: u64,
}

unsafe impl ByteValued for VhostUserMemoryRegion {}

impl VhostUserMsgValidator for VhostUserMemoryRegion {
    fn is_valid(&self) -> bool {
        let (gpa, size, uva, off) = (
            self.guest_phys_addr,
            self.memory_size,
            self.user_addr,
            self.mmap_offset,
        );
        size != 0
            && gpa.checked_add(size).is_some()
            && uva.checked_add(size).is_some()
            && off.checked_add(size).is_some()
    }
}

/// Index/value pair used by the `SET_VRING_{NUM,BASE,ENABLE}` and
/// `GET_VRING_BASE` payloads.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserVringState {
    pub index: u32,
    pub num: u32,
}

impl VhostUserVringState {
    pub fn new(index: u32, num: u32) -> Self {
        VhostUserVringState { index, num }
    }
}

unsafe impl ByteValued for VhostUserVringState {}

impl VhostUserMsgValidator for VhostUserVringState {}

/// Ring addresses for `SET_VRING_ADDR`. All addresses are virtual addresses
/// in the master's address space.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserVringAddr {
    pub index: u32,
    pub flags: u32,
    pub descriptor: u64,
    pub used: u64,
    pub available: u64,
    pub log: u64,
}

unsafe impl ByteValued for VhostUserVringAddr {}

impl VhostUserMsgValidator for VhostUserVringAddr {
    fn is_valid(&self) -> bool {
        // Ring alignment requirements from the virtio spec.
        self.descriptor & 0xf == 0 && self.available & 0x1 == 0 && self.used & 0x3 == 0
    }
}

/// Config space access descriptor for `GET_CONFIG`/`SET_CONFIG`, followed on
/// the wire by `size` payload bytes.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserConfig {
    pub offset: u32,
    pub size: u32,
    pub flags: u32,
}

impl VhostUserConfig {
    pub fn new(offset: u32, size: u32, flags: u32) -> Self {
        VhostUserConfig {
            offset,
            size,
            flags,
        }
    }
}

unsafe impl ByteValued for VhostUserConfig {}

impl VhostUserMsgValidator for VhostUserConfig {
    fn is_valid(&self) -> bool {
        let (offset, size) = (self.offset, self.size);
        offset >= CONFIG_OFFSET
            && offset < CONFIG_SIZE
            && size != 0
            && size <= CONFIG_SIZE - CONFIG_OFFSET
            && offset.checked_add(size).map_or(false, |end| end <= CONFIG_SIZE)
    }
}

/// Payload of `GET_INFLIGHT_FD` and `SET_INFLIGHT_FD`.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VhostUserInflight {
    /// Total size of the shared inflight area.
    pub mmap_size: u64,
    /// Offset of the usable area within the attached fd.
    pub mmap_offset: u64,
    /// Number of queues the area is divided into.
    pub num_queues: u16,
    /// Ring size of each queue.
    pub queue_size: u16,
}

unsafe impl ByteValued for VhostUserInflight {}

impl VhostUserMsgValidator for VhostUserInflight {}

/// Per-queue header inside the inflight shared memory area. Field widths are
/// fixed by the vhost-user inflight extension; the layout must stay stable
/// across reconnects of arbitrary masters.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InflightSplitRegion {
    pub features: u64,
    pub version: u16,
    pub desc_num: u16,
    pub last_batch_head: u16,
    pub used_idx: u16,
}

unsafe impl ByteValued for InflightSplitRegion {}

/// Per-descriptor tracking slot following the queue header.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct InflightSplitDesc {
    pub inflight: u8,
    pub padding: [u8; 5],
    pub next: u16,
    pub counter: u64,
}

unsafe impl ByteValued for InflightSplitDesc {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_code_bounds() {
        assert_eq!(MasterReq::from_raw(0), None);
        assert_eq!(MasterReq::from_raw(33), None);
        assert_eq!(MasterReq::from_raw(1), Some(MasterReq::GET_FEATURES));
        assert_eq!(MasterReq::from_raw(32), Some(MasterReq::SET_INFLIGHT_FD));
    }

    #[test]
    fn header_ops() {
        let hdr = VhostUserMsgHeader::new(MasterReq::GET_FEATURES, 0, 8);
        assert_eq!(hdr.code(), Some(MasterReq::GET_FEATURES));
        assert_eq!(hdr.version(), 0x1);
        assert_eq!(hdr.size(), 8);
        assert!(!hdr.is_reply());
        assert!(!hdr.need_reply());
        assert!(hdr.is_valid());

        let hdr = VhostUserMsgHeader::new(
            MasterReq::SET_VRING_NUM,
            VhostUserHeaderFlag::NEED_REPLY.bits(),
            8,
        );
        assert!(hdr.need_reply());
        assert!(hdr.is_valid());

        let hdr = VhostUserMsgHeader::new(MasterReq::GET_FEATURES, 0, 0x2000);
        assert!(!hdr.is_valid());

        // Header straight off the wire with a zero version.
        let raw = VhostUserMsgHeader {
            request: 1,
            flags: 0,
            size: 0,
        };
        assert!(!raw.is_valid());
    }

    #[test]
    fn header_layout() {
        assert_eq!(MSG_HDR_SIZE, 12);
        let hdr = VhostUserMsgHeader::new(MasterReq::SET_OWNER, 0, 0);
        let bytes = hdr.as_slice();
        assert_eq!(&bytes[0..4], &3u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &0u32.to_ne_bytes());
    }

    #[test]
    fn memory_payload_bounds() {
        let mut msg = VhostUserMemory {
            num_regions: 1,
            padding: 0,
        };
        assert!(msg.is_valid());
        msg.num_regions = MEM_REGIONS_MAX as u32;
        assert!(msg.is_valid());
        msg.num_regions += 1;
        assert!(!msg.is_valid());
        msg.num_regions = 0;
        assert!(!msg.is_valid());
        msg.num_regions = 1;
        msg.padding = 1;
        assert!(!msg.is_valid());
    }

    #[test]
    fn memory_region_overflow() {
        let mut region = VhostUserMemoryRegion {
            guest_phys_addr: 0,
            memory_size: 0x10000,
            user_addr: 0x7f00_0000_0000,
            mmap_offset: 0,
        };
        assert!(region.is_valid());
        region.guest_phys_addr = u64::MAX - 0xfff;
        assert!(!region.is_valid());
        region.guest_phys_addr = 0;
        region.memory_size = 0;
        assert!(!region.is_valid());
    }

    #[test]
    fn vring_addr_alignment() {
        let mut addr = VhostUserVringAddr::default();
        assert!(addr.is_valid());
        addr.descriptor = 0x8;
        assert!(!addr.is_valid());
        addr.descriptor = 0x10;
        addr.available = 0x1;
        assert!(!addr.is_valid());
        addr.available = 0x2;
        addr.used = 0x2;
        assert!(!addr.is_valid());
        addr.used = 0x4;
        assert!(addr.is_valid());
    }

    #[test]
    fn config_payload_bounds() {
        let mut cfg = VhostUserConfig::new(CONFIG_OFFSET, 8, 0);
        assert!(cfg.is_valid());
        cfg.size = 0;
        assert!(!cfg.is_valid());
        cfg.size = 8;
        cfg.offset = 0;
        assert!(!cfg.is_valid());
        cfg.offset = CONFIG_SIZE;
        assert!(!cfg.is_valid());
        cfg.offset = CONFIG_SIZE - 4;
        cfg.size = 8;
        assert!(!cfg.is_valid());
    }

    #[test]
    fn inflight_entry_sizes() {
        assert_eq!(std::mem::size_of::<InflightSplitRegion>(), 16);
        assert_eq!(std::mem::size_of::<InflightSplitDesc>(), 16);
        assert_eq!(std::mem::size_of::<VhostUserInflight>(), 20);
    }
}
