// SPDX-License-Identifier: Apache-2.0

//! Device instance and protocol engine.
//!
//! A [`Vdev`] serves one device over one listening socket and at most one
//! master connection at a time. All protocol handling runs on the vhost
//! event loop, which is the single writer of device state; request-queue
//! loops only read the vring and memory state published before a vring was
//! enabled.

use std::collections::HashMap;
use std::fs::File;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use vm_memory::ByteValued;
use vmm_sys_util::eventfd::EventFd;

use crate::connection::{Endpoint, Listener};
use crate::event::{vhost_loop, EventHandler};
use crate::inflight::InflightRegion;
use crate::memory::GuestMemoryMap;
use crate::message::*;
use crate::request_queue::RequestQueue;
use crate::vring::Vring;
use crate::{Error, Result};

/// Transport features every device offers on top of its own set.
fn default_features() -> u64 {
    VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits()
}

fn default_protocol_features() -> VhostUserProtocolFeatures {
    VhostUserProtocolFeatures::MQ
        | VhostUserProtocolFeatures::LOG_SHMFD
        | VhostUserProtocolFeatures::REPLY_ACK
        | VhostUserProtocolFeatures::CONFIG
}

fn has_protocol_features(features: u64) -> bool {
    features & VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits() != 0
}

/// Connection state of a served device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdevState {
    /// Listening socket exists but is not armed yet.
    Initialized,
    /// Waiting for a master to connect.
    Listening,
    /// A master owns the connection and negotiation may proceed.
    Connected,
}

/// Device-type operations a served device plugs into the engine.
pub trait VhostDevice: Send + Sync {
    /// Device feature bits, not including the vhost-user transport bits.
    fn features(&self) -> u64;

    /// Called once feature negotiation settles.
    fn acked_features(&self, _features: u64) {}

    /// Fill a `GET_CONFIG` read of `size` bytes at `offset`.
    fn get_config(&self, offset: u32, size: u32) -> Vec<u8>;

    /// Drain available descriptors of `vring` and enqueue the resulting
    /// requests on `rq`. Runs on the request-queue loop.
    fn dispatch_requests(
        &self,
        vring: &Arc<RwLock<Vring>>,
        mem: &Arc<RwLock<GuestMemoryMap>>,
        rq: &RequestQueue,
    ) -> Result<()>;
}

lazy_static! {
    /// Every live device in the process, keyed by its socket path.
    static ref DEVICES: Mutex<HashMap<PathBuf, Weak<Vdev>>> = Mutex::new(HashMap::new());
}

/// All live devices. Diagnostic surface; the registry itself only tracks
/// membership between `init_server` and `uninit`.
pub fn registered_devices() -> Vec<Arc<Vdev>> {
    DEVICES
        .lock()
        .unwrap()
        .values()
        .filter_map(Weak::upgrade)
        .collect()
}

struct VdevInner {
    state: VdevState,
    listener: Listener,
    endpoint: Option<Endpoint>,
    owned: bool,
    supported_features: u64,
    negotiated_features: u64,
    supported_protocol_features: VhostUserProtocolFeatures,
    negotiated_protocol_features: VhostUserProtocolFeatures,
    num_queues: u16,
    inflight: Option<InflightRegion>,
    dead: bool,
}

/// One served device.
pub struct Vdev {
    inner: Mutex<VdevInner>,
    device: Arc<dyn VhostDevice>,
    rq: Arc<RequestQueue>,
    mem: Arc<RwLock<GuestMemoryMap>>,
    vrings: Vec<Arc<RwLock<Vring>>>,
    max_queues: u16,
}

struct ListenerHandler {
    vdev: Arc<Vdev>,
}

impl EventHandler for ListenerHandler {
    fn readable(&self) -> Result<()> {
        self.vdev.accept_connection()
    }

    // EOF on the listening socket is meaningless.
    fn closed(&self) {}
}

struct ConnectionHandler {
    vdev: Arc<Vdev>,
}

impl EventHandler for ConnectionHandler {
    fn readable(&self) -> Result<()> {
        self.vdev.handle_connection_readable()
    }

    fn closed(&self) {
        self.vdev.handle_disconnect()
    }
}

struct VringKickHandler {
    vring: Arc<RwLock<Vring>>,
    device: Arc<dyn VhostDevice>,
    mem: Arc<RwLock<GuestMemoryMap>>,
    rq: Arc<RequestQueue>,
}

impl EventHandler for VringKickHandler {
    fn readable(&self) -> Result<()> {
        {
            let vring = self.vring.read().unwrap();
            // Clear the doorbell before draining the queue: a kick landing
            // during dispatch must leave the fd readable again.
            if let Some(kick) = &vring.kick {
                let _ = kick.read();
            }
            // The kick source is registered after enabling and detached
            // before disabling, so this cannot trigger.
            if !vring.enabled {
                warn!("kick on disabled vring {}", vring.id);
                return Ok(());
            }
        }
        self.device
            .dispatch_requests(&self.vring, &self.mem, &self.rq)
    }

    fn closed(&self) {
        warn!("kick fd hung up");
    }
}

impl Vdev {
    /// Create a device in server mode: listening socket bound, vrings
    /// zero-initialized, device registered and armed for connections.
    pub fn init_server<P: AsRef<Path>>(
        socket_path: P,
        device: Arc<dyn VhostDevice>,
        max_queues: u16,
        rq: Arc<RequestQueue>,
    ) -> Result<Arc<Vdev>> {
        if max_queues == 0 {
            return Err(Error::InvalidParam);
        }

        let listener = Listener::new(socket_path)?;
        let path = listener.path().to_path_buf();
        let supported_features = default_features() | device.features();

        let vdev = Arc::new(Vdev {
            inner: Mutex::new(VdevInner {
                state: VdevState::Initialized,
                listener,
                endpoint: None,
                owned: false,
                supported_features,
                negotiated_features: 0,
                supported_protocol_features: default_protocol_features(),
                negotiated_protocol_features: VhostUserProtocolFeatures::empty(),
                num_queues: max_queues,
                inflight: None,
                dead: false,
            }),
            device,
            rq,
            mem: Arc::new(RwLock::new(GuestMemoryMap::new())),
            vrings: (0..max_queues)
                .map(|id| Arc::new(RwLock::new(Vring::new(id))))
                .collect(),
            max_queues,
        });

        DEVICES
            .lock()
            .unwrap()
            .insert(path.clone(), Arc::downgrade(&vdev));

        let armed = {
            let mut inner = vdev.inner.lock().unwrap();
            vdev.change_state(&mut inner, VdevState::Listening)
        };
        if let Err(e) = armed {
            vdev.uninit();
            return Err(e);
        }

        info!("device serving on {:?}", path);
        Ok(vdev)
    }

    /// Tear the device down: detach every event source, disable and reset
    /// every vring, unmap guest memory, release the inflight region and drop
    /// out of the registry. Idempotent.
    pub fn uninit(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.dead {
            return;
        }
        inner.dead = true;

        if let Some(endpoint) = inner.endpoint.take() {
            vhost_loop().del_event(endpoint.as_raw_fd());
        }
        vhost_loop().del_event(inner.listener.as_raw_fd());

        for vring in &self.vrings {
            self.teardown_vring(vring);
        }
        self.mem.write().unwrap().unmap_all();
        inner.inflight = None;
        inner.state = VdevState::Initialized;

        DEVICES.lock().unwrap().remove(inner.listener.path());
        info!("device on {:?} uninitialized", inner.listener.path());
    }

    pub fn state(&self) -> VdevState {
        self.inner.lock().unwrap().state
    }

    pub fn is_owned(&self) -> bool {
        self.inner.lock().unwrap().owned
    }

    pub fn negotiated_features(&self) -> u64 {
        self.inner.lock().unwrap().negotiated_features
    }

    pub fn negotiated_protocol_features(&self) -> VhostUserProtocolFeatures {
        self.inner.lock().unwrap().negotiated_protocol_features
    }

    pub fn max_queues(&self) -> u16 {
        self.max_queues
    }

    pub fn memory(&self) -> Arc<RwLock<GuestMemoryMap>> {
        Arc::clone(&self.mem)
    }

    pub fn vring(&self, index: u16) -> Option<Arc<RwLock<Vring>>> {
        self.vrings.get(usize::from(index)).cloned()
    }

    pub fn request_queue(&self) -> &Arc<RequestQueue> {
        &self.rq
    }

    pub fn has_inflight(&self) -> bool {
        self.inner.lock().unwrap().inflight.is_some()
    }

    /// Drive a state transition, enforcing the permitted pairs. Any other
    /// pair is a programming error: it is reported and leaves the device
    /// untouched.
    fn change_state(self: &Arc<Self>, inner: &mut VdevInner, new: VdevState) -> Result<()> {
        match (inner.state, new) {
            (VdevState::Initialized, VdevState::Listening) => {
                vhost_loop()
                    .add_event(
                        inner.listener.as_raw_fd(),
                        Arc::new(ListenerHandler {
                            vdev: Arc::clone(self),
                        }),
                    )
                    .map_err(Error::Io)?;
            }
            (VdevState::Connected, VdevState::Listening) => {
                if let Some(endpoint) = inner.endpoint.take() {
                    vhost_loop().del_event(endpoint.as_raw_fd());
                    // Dropping the endpoint closes the connection socket.
                }
                self.mem.write().unwrap().unmap_all();
                inner.owned = false;
                for vring in &self.vrings {
                    self.teardown_vring(vring);
                }
                vhost_loop()
                    .add_event(
                        inner.listener.as_raw_fd(),
                        Arc::new(ListenerHandler {
                            vdev: Arc::clone(self),
                        }),
                    )
                    .map_err(Error::Io)?;
            }
            (VdevState::Listening, VdevState::Connected) => {
                let connfd = inner
                    .endpoint
                    .as_ref()
                    .map(|endpoint| endpoint.as_raw_fd())
                    .ok_or(Error::InvalidParam)?;
                vhost_loop()
                    .add_event(
                        connfd,
                        Arc::new(ConnectionHandler {
                            vdev: Arc::clone(self),
                        }),
                    )
                    .map_err(Error::Io)?;
                // Single-master policy: stop watching the listener while a
                // connection is up. The socket stays open.
                vhost_loop().del_event(inner.listener.as_raw_fd());
            }
            (from, to) => {
                error!("invalid device state transition {:?} -> {:?}", from, to);
                return Err(Error::InvalidStateTransition(from, to));
            }
        }

        debug!("device state {:?} -> {:?}", inner.state, new);
        inner.state = new;
        Ok(())
    }

    fn accept_connection(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.dead || inner.state != VdevState::Listening {
            return Ok(());
        }

        let stream = match inner.listener.accept()? {
            Some(stream) => stream,
            None => return Ok(()),
        };
        stream.set_nonblocking(true).map_err(Error::SocketError)?;

        inner.endpoint = Some(Endpoint::new(stream));
        if let Err(e) = self.change_state(&mut inner, VdevState::Connected) {
            inner.endpoint = None;
            return Err(e);
        }

        info!("master connected on {:?}", inner.listener.path());
        Ok(())
    }

    fn handle_disconnect(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.dead || inner.state != VdevState::Connected {
            return;
        }
        info!("master disconnected from {:?}", inner.listener.path());
        if let Err(e) = self.change_state(&mut inner, VdevState::Listening) {
            error!("failed to return to listening: {}", e);
        }
    }

    /// Decode and execute exactly one request off the connection. Errors
    /// returned here are framing or socket errors; handler failures are
    /// folded into the optional acknowledgement instead.
    fn handle_connection_readable(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.dead || inner.state != VdevState::Connected {
            return Ok(());
        }

        let endpoint = inner.endpoint.as_mut().ok_or(Error::Disconnected)?;
        let (hdr, fds) = endpoint.recv_header()?;
        let buf = endpoint.recv_payload(hdr.size() as usize)?;

        debug!("request {:?}, size {}", hdr.code(), hdr.size());

        let result = self.handle_request(&mut inner, &hdr, &buf, fds);
        if let Err(e) = &result {
            error!("request {:?} failed: {}", hdr.code(), e);
        }
        self.ack_request_if_needed(&mut inner, &hdr, &result)
    }

    fn handle_request(
        self: &Arc<Self>,
        inner: &mut VdevInner,
        hdr: &VhostUserMsgHeader,
        buf: &[u8],
        mut fds: Vec<File>,
    ) -> Result<()> {
        let code = match hdr.code() {
            Some(code) => code,
            None => {
                error!("unknown request code {}", hdr.raw_code());
                return Err(Error::InvalidParam);
            }
        };

        match code {
            MasterReq::GET_FEATURES => self.get_features(inner, hdr),
            MasterReq::SET_FEATURES => self.set_features(inner, buf),
            MasterReq::SET_OWNER => self.set_owner(inner),
            MasterReq::RESET_OWNER => Err(Error::NotSupported),
            MasterReq::GET_PROTOCOL_FEATURES => {
                let bits = inner.supported_protocol_features.bits();
                self.send_reply_u64(inner, hdr, bits)
            }
            MasterReq::SET_PROTOCOL_FEATURES => self.set_protocol_features(inner, buf),
            MasterReq::GET_CONFIG => self.get_config(inner, buf),
            MasterReq::SET_CONFIG => Err(Error::NotSupported),
            MasterReq::SET_MEM_TABLE => self.set_mem_table(inner, buf, fds),
            MasterReq::GET_QUEUE_NUM => self.send_reply_u64(inner, hdr, u64::from(self.max_queues)),
            MasterReq::SET_VRING_NUM => self.set_vring_num(inner, buf),
            MasterReq::SET_VRING_BASE => self.set_vring_base(inner, buf),
            MasterReq::GET_VRING_BASE => self.get_vring_base(inner, hdr, buf),
            MasterReq::SET_VRING_ADDR => self.set_vring_addr(inner, buf),
            MasterReq::SET_VRING_KICK => self.set_vring_kick(inner, buf, &mut fds),
            MasterReq::SET_VRING_CALL => self.set_vring_call(inner, buf, &mut fds),
            MasterReq::SET_VRING_ERR => self.set_vring_err(inner, buf, &mut fds),
            MasterReq::SET_VRING_ENABLE => self.set_vring_enable(inner, buf),
            MasterReq::GET_INFLIGHT_FD => self.get_inflight_fd(inner, buf),
            MasterReq::SET_INFLIGHT_FD => self.set_inflight_fd(inner, buf, &mut fds),
            _ => {
                warn!("request {:?} not supported", code);
                Err(Error::NotSupported)
            }
        }
    }

    /// REPLY_ACK policy: a negotiated and requested acknowledgement carries
    /// the handler status, except when the request's own reply already went
    /// out successfully.
    fn ack_request_if_needed(
        &self,
        inner: &mut VdevInner,
        hdr: &VhostUserMsgHeader,
        result: &Result<()>,
    ) -> Result<()> {
        if !inner
            .negotiated_protocol_features
            .contains(VhostUserProtocolFeatures::REPLY_ACK)
        {
            return Ok(());
        }
        if !hdr.need_reply() {
            return Ok(());
        }
        if result.is_ok() {
            if let Some(
                MasterReq::GET_FEATURES
                | MasterReq::GET_PROTOCOL_FEATURES
                | MasterReq::GET_CONFIG
                | MasterReq::GET_QUEUE_NUM
                | MasterReq::GET_VRING_BASE
                | MasterReq::GET_INFLIGHT_FD,
            ) = hdr.code()
            {
                return Ok(());
            }
        }

        let status = match result {
            Ok(()) => 0,
            Err(e) => u64::from(e.errno() as u32),
        };
        // A lost ack would leave the master waiting forever, so a send
        // failure here overrides the handler's own verdict.
        self.send_reply_u64(inner, hdr, status)
    }

    fn send_reply_u64(
        &self,
        inner: &mut VdevInner,
        req: &VhostUserMsgHeader,
        value: u64,
    ) -> Result<()> {
        let code = req.code().ok_or(Error::InvalidParam)?;
        let hdr = VhostUserMsgHeader::new(
            code,
            VhostUserHeaderFlag::REPLY.bits(),
            mem::size_of::<VhostUserU64>() as u32,
        );
        inner
            .endpoint
            .as_mut()
            .ok_or(Error::Disconnected)?
            .send_message(&hdr, Some(&VhostUserU64::new(value)), None, &[])
    }

    fn body<T: ByteValued + VhostUserMsgValidator>(buf: &[u8]) -> Result<T> {
        let msg = T::from_slice(buf).ok_or(Error::InvalidMessage)?;
        if !msg.is_valid() {
            return Err(Error::InvalidMessage);
        }
        Ok(*msg)
    }

    fn get_features(&self, inner: &mut VdevInner, hdr: &VhostUserMsgHeader) -> Result<()> {
        let supported = default_features() | self.device.features();
        inner.supported_features = supported;
        self.send_reply_u64(inner, hdr, supported)
    }

    fn set_features(&self, inner: &mut VdevInner, buf: &[u8]) -> Result<()> {
        let msg: VhostUserU64 = Self::body(buf)?;
        let requested = msg.value;
        let negotiated = requested & inner.supported_features;
        if requested & !inner.supported_features != 0 {
            warn!(
                "master requested unsupported features: supported {:#x} requested {:#x}, \
                 keeping {:#x}",
                inner.supported_features, requested, negotiated
            );
        }
        inner.negotiated_features = negotiated;
        self.device.acked_features(negotiated);
        Ok(())
    }

    fn set_owner(&self, inner: &mut VdevInner) -> Result<()> {
        // Ownership handover is not a thing; repeated claims are harmless.
        if inner.owned {
            warn!("master claimed an already owned device");
        }
        inner.owned = true;
        Ok(())
    }

    fn set_protocol_features(&self, inner: &mut VdevInner, buf: &[u8]) -> Result<()> {
        let msg: VhostUserU64 = Self::body(buf)?;
        let requested = msg.value;
        let clamped = VhostUserProtocolFeatures::from_bits_truncate(requested)
            & inner.supported_protocol_features;
        if requested != clamped.bits() {
            // The master ignored what GET_PROTOCOL_FEATURES told it. There
            // is no way to push back, so drop the excess and carry on.
            warn!(
                "master set protocol features {:#x}, supported {:#x}, keeping {:#x}",
                requested,
                inner.supported_protocol_features.bits(),
                clamped.bits()
            );
        }
        inner.negotiated_protocol_features = clamped;
        debug!("negotiated protocol features {:#x}", clamped.bits());
        Ok(())
    }

    fn get_config(&self, inner: &mut VdevInner, buf: &[u8]) -> Result<()> {
        let desc_len = mem::size_of::<VhostUserConfig>();
        if buf.len() < desc_len {
            return Err(Error::InvalidMessage);
        }
        let desc: VhostUserConfig = Self::body(&buf[..desc_len])?;
        if buf.len() - desc_len != desc.size as usize {
            return Err(Error::InvalidMessage);
        }

        let data = self.device.get_config(desc.offset, desc.size);
        // A filling shorter than requested reports size zero, which the
        // master reads as a config access failure.
        let reply_desc = if data.len() == desc.size as usize {
            VhostUserConfig::new(desc.offset, desc.size, desc.flags)
        } else {
            VhostUserConfig::new(desc.offset, 0, desc.flags)
        };
        let payload = if data.len() == desc.size as usize {
            data
        } else {
            Vec::new()
        };

        let reply_hdr = VhostUserMsgHeader::new(
            MasterReq::GET_CONFIG,
            VhostUserHeaderFlag::REPLY.bits(),
            (desc_len + payload.len()) as u32,
        );
        inner
            .endpoint
            .as_mut()
            .ok_or(Error::Disconnected)?
            .send_message(&reply_hdr, Some(&reply_desc), Some(&payload), &[])
    }

    fn set_mem_table(&self, _inner: &mut VdevInner, buf: &[u8], fds: Vec<File>) -> Result<()> {
        let lead_len = mem::size_of::<VhostUserMemory>();
        let region_len = mem::size_of::<VhostUserMemoryRegion>();
        if buf.len() < lead_len {
            return Err(Error::InvalidMessage);
        }
        let lead: VhostUserMemory = Self::body(&buf[..lead_len])?;
        let count = lead.num_regions as usize;
        if buf.len() != lead_len + count * region_len {
            return Err(Error::InvalidMessage);
        }
        if fds.len() != count {
            error!(
                "memory table with {} regions but {} fds",
                count,
                fds.len()
            );
            return Err(Error::InvalidMessage);
        }

        let mut regions = Vec::with_capacity(count);
        for index in 0..count {
            let offset = lead_len + index * region_len;
            regions.push(Self::body::<VhostUserMemoryRegion>(
                &buf[offset..offset + region_len],
            )?);
        }

        let mut mem_map = self.mem.write().unwrap();
        let mut fds = fds.into_iter();
        for (index, region) in regions.iter().enumerate() {
            let file = fds.next().unwrap();
            if let Err(e) = mem_map.map_region(
                index,
                region.guest_phys_addr,
                region.user_addr,
                region.memory_size,
                region.mmap_offset,
                file,
            ) {
                // Roll back to a clean table. The remaining fds are closed
                // when the iterator is dropped.
                mem_map.unmap_all();
                return Err(e);
            }
        }
        Ok(())
    }

    fn vring_arc(&self, inner: &VdevInner, index: u32) -> Result<Arc<RwLock<Vring>>> {
        if index >= u32::from(inner.num_queues) {
            error!(
                "vring index out of bounds ({} >= {})",
                index, inner.num_queues
            );
            return Err(Error::InvalidParam);
        }
        Ok(Arc::clone(&self.vrings[index as usize]))
    }

    fn vring_arc_not_enabled(&self, inner: &VdevInner, index: u32) -> Result<Arc<RwLock<Vring>>> {
        let vring = self.vring_arc(inner, index)?;
        if vring.read().unwrap().enabled {
            error!("vring {} is enabled", index);
            return Err(Error::InvalidParam);
        }
        Ok(vring)
    }

    fn set_vring_num(&self, inner: &mut VdevInner, buf: &[u8]) -> Result<()> {
        let msg: VhostUserVringState = Self::body(buf)?;
        let vring = self.vring_arc_not_enabled(inner, msg.index)?;
        vring.write().unwrap().client_info.num = msg.num as u16;
        Ok(())
    }

    fn set_vring_base(&self, inner: &mut VdevInner, buf: &[u8]) -> Result<()> {
        let msg: VhostUserVringState = Self::body(buf)?;
        let vring = self.vring_arc_not_enabled(inner, msg.index)?;
        vring.write().unwrap().client_info.base = msg.num as u16;
        Ok(())
    }

    fn get_vring_base(
        &self,
        inner: &mut VdevInner,
        hdr: &VhostUserMsgHeader,
        buf: &[u8],
    ) -> Result<()> {
        let msg: VhostUserVringState = Self::body(buf)?;
        let vring = self.vring_arc(inner, msg.index)?;
        let base = u64::from(vring.read().unwrap().vq.last_avail());

        // Without the protocol-features handshake there is no explicit
        // disable message; this request doubles as the stop signal.
        if !has_protocol_features(inner.negotiated_features) {
            self.vring_set_enabled(&vring, false)?;
        }

        self.send_reply_u64(inner, hdr, base)
    }

    fn set_vring_addr(&self, inner: &mut VdevInner, buf: &[u8]) -> Result<()> {
        let msg: VhostUserVringAddr = Self::body(buf)?;
        let index = msg.index;
        let vring = self.vring_arc_not_enabled(inner, index)?;

        let mem_map = self.mem.read().unwrap();
        let desc = mem_map.uva_to_hva(msg.descriptor);
        let used = mem_map.uva_to_hva(msg.used);
        let avail = mem_map.uva_to_hva(msg.available);
        drop(mem_map);

        match (desc, used, avail) {
            (Some(desc), Some(used), Some(avail)) => {
                let mut vring = vring.write().unwrap();
                vring.client_info.desc_addr = Some(desc);
                vring.client_info.used_addr = Some(used);
                vring.client_info.avail_addr = Some(avail);
                Ok(())
            }
            _ => {
                error!("vring {} ring addresses do not translate", index);
                Err(Error::InvalidParam)
            }
        }
    }

    /// Decode the shared payload of the vring fd messages: low bits carry
    /// the vring index, `VRING_NOFD_MASK` announces polling mode.
    fn vring_fd_request(buf: &[u8], fds: &mut Vec<File>) -> Result<(u32, File)> {
        let msg: VhostUserU64 = Self::body(buf)?;
        let value = msg.value;
        if value & VRING_NOFD_MASK != 0 {
            error!("vring polling mode is not supported");
            return Err(Error::NotSupported);
        }
        if fds.len() != 1 {
            error!("vring fd message carried {} fds", fds.len());
            return Err(Error::InvalidMessage);
        }
        Ok(((value & VRING_IDX_MASK) as u32, fds.remove(0)))
    }

    fn set_vring_kick(
        self: &Arc<Self>,
        inner: &mut VdevInner,
        buf: &[u8],
        fds: &mut Vec<File>,
    ) -> Result<()> {
        let (index, file) = Self::vring_fd_request(buf, fds)?;
        let vring = self.vring_arc(inner, index)?;
        vring.write().unwrap().kick =
            Some(unsafe { EventFd::from_raw_fd(file.into_raw_fd()) });

        // Legacy masters have no SET_VRING_ENABLE; the kick fd arriving is
        // the signal to start the ring.
        if !has_protocol_features(inner.negotiated_features) {
            return self.vring_set_enabled(&vring, true);
        }
        Ok(())
    }

    fn set_vring_call(
        &self,
        inner: &mut VdevInner,
        buf: &[u8],
        fds: &mut Vec<File>,
    ) -> Result<()> {
        let (index, file) = Self::vring_fd_request(buf, fds)?;
        let vring_arc = self.vring_arc(inner, index)?;
        let mut guard = vring_arc.write().unwrap();
        let vring = &mut *guard;
        vring.call = Some(unsafe { EventFd::from_raw_fd(file.into_raw_fd()) });
        if vring.enabled {
            // Completion target changes take effect immediately.
            let call = vring.call.as_ref().unwrap().try_clone().map_err(Error::Io)?;
            vring.vq.set_notify_fd(call);
        }
        Ok(())
    }

    fn set_vring_err(&self, inner: &mut VdevInner, buf: &[u8], fds: &mut Vec<File>) -> Result<()> {
        let (index, file) = Self::vring_fd_request(buf, fds)?;
        let vring = self.vring_arc(inner, index)?;
        vring.write().unwrap().err =
            Some(unsafe { EventFd::from_raw_fd(file.into_raw_fd()) });
        Ok(())
    }

    fn set_vring_enable(self: &Arc<Self>, inner: &mut VdevInner, buf: &[u8]) -> Result<()> {
        let msg: VhostUserVringState = Self::body(buf)?;
        let vring = self.vring_arc(inner, msg.index)?;
        self.vring_set_enabled(&vring, msg.num == 1)
    }

    /// Attach or release the virtqueue and the kick event source.
    fn vring_set_enabled(&self, vring_arc: &Arc<RwLock<Vring>>, enable: bool) -> Result<()> {
        let mut vring = vring_arc.write().unwrap();
        if vring.enabled == enable {
            warn!(
                "vring {} is already {}",
                vring.id,
                if enable { "enabled" } else { "disabled" }
            );
            return Ok(());
        }

        if enable {
            if !vring.can_enable() {
                error!("vring {} enabled before negotiation finished", vring.id);
                return Err(Error::InvalidParam);
            }
            let info = vring.client_info.clone();
            vring.vq.attach(
                info.desc_addr.unwrap(),
                info.avail_addr.unwrap(),
                info.used_addr.unwrap(),
                info.num,
                info.base,
            )?;

            let vring_mut = &mut *vring;
            if let Some(call) = &vring_mut.call {
                vring_mut
                    .vq
                    .set_notify_fd(call.try_clone().map_err(Error::Io)?);
            }

            let kick_fd = vring_mut.kick.as_ref().unwrap().as_raw_fd();
            let handler = Arc::new(VringKickHandler {
                vring: Arc::clone(vring_arc),
                device: Arc::clone(&self.device),
                mem: Arc::clone(&self.mem),
                rq: Arc::clone(&self.rq),
            });
            if let Err(e) = self.rq.attach_event(kick_fd, handler) {
                error!("failed to watch kick fd for vring {}: {}", vring_mut.id, e);
                vring_mut.vq.release();
                return Err(Error::Io(e));
            }

            vring_mut.enabled = true;
            debug!("vring {} enabled", vring_mut.id);
        } else {
            if let Some(kick) = &vring.kick {
                self.rq.detach_event(kick.as_raw_fd());
            }
            vring.vq.release();
            vring.enabled = false;
            debug!("vring {} disabled", vring.id);
        }
        Ok(())
    }

    /// Disable if needed, then drop every negotiated resource of the vring.
    fn teardown_vring(&self, vring_arc: &Arc<RwLock<Vring>>) {
        let enabled = vring_arc.read().unwrap().enabled;
        if enabled {
            if let Err(e) = self.vring_set_enabled(vring_arc, false) {
                error!("failed to disable vring: {}", e);
            }
        }
        vring_arc.write().unwrap().reset();
    }

    fn get_inflight_fd(&self, inner: &mut VdevInner, buf: &[u8]) -> Result<()> {
        let msg: VhostUserInflight = Self::body(buf)?;
        let (queue_size, num_queues) = (msg.queue_size, msg.num_queues);

        // A fresh request drops whatever region was installed before.
        inner.inflight = None;
        let (region, file) = InflightRegion::allocate(queue_size, num_queues)?;

        let reply = VhostUserInflight {
            mmap_size: region.size(),
            mmap_offset: 0,
            num_queues,
            queue_size,
        };
        let reply_hdr = VhostUserMsgHeader::new(
            MasterReq::GET_INFLIGHT_FD,
            VhostUserHeaderFlag::REPLY.bits(),
            mem::size_of::<VhostUserInflight>() as u32,
        );

        inner.inflight = Some(region);
        let sent = inner
            .endpoint
            .as_mut()
            .ok_or(Error::Disconnected)?
            .send_message(&reply_hdr, Some(&reply), None, &[file.as_raw_fd()]);
        if let Err(e) = sent {
            error!("failed to transfer inflight fd: {}", e);
            inner.inflight = None;
            return Err(e);
        }
        Ok(())
    }

    fn set_inflight_fd(
        &self,
        inner: &mut VdevInner,
        buf: &[u8],
        fds: &mut Vec<File>,
    ) -> Result<()> {
        let msg: VhostUserInflight = Self::body(buf)?;
        if fds.len() != 1 {
            error!("SET_INFLIGHT_FD carried {} fds", fds.len());
            return Err(Error::InvalidMessage);
        }

        inner.inflight = None;
        let region = InflightRegion::from_fd(
            fds.remove(0),
            msg.mmap_size,
            msg.queue_size,
            msg.num_queues,
        )?;
        inner.inflight = Some(region);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockDevice;
    use crate::event::start_vhost_event_loop;
    use crate::memory::GpaTranslator;
    use crate::virtqueue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
    use std::io::Write;
    use std::os::unix::io::RawFd;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};
    use virtio_bindings::virtio_blk::{VIRTIO_BLK_S_OK, VIRTIO_BLK_T_OUT};

    fn test_device() -> Arc<dyn VhostDevice> {
        Arc::new(BlockDevice::new("vdev-test", 32, 4096, 2, false).unwrap())
    }

    fn setup(name: &str) -> (tempfile::TempDir, Arc<Vdev>, Arc<RequestQueue>) {
        start_vhost_event_loop().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let rq = Arc::new(RequestQueue::new().unwrap());
        let vdev = Vdev::init_server(&path, test_device(), 2, Arc::clone(&rq)).unwrap();
        (dir, vdev, rq)
    }

    fn connect(vdev: &Arc<Vdev>) -> Endpoint {
        let path = {
            let inner = vdev.inner.lock().unwrap();
            inner.listener.path().to_path_buf()
        };
        Endpoint::new(UnixStream::connect(path).unwrap())
    }

    fn send(
        master: &mut Endpoint,
        req: MasterReq,
        flags: u32,
        body: &impl ByteValued,
        fds: &[RawFd],
    ) {
        let hdr = VhostUserMsgHeader::new(req, flags, mem::size_of_val(body) as u32);
        master.send_message(&hdr, Some(body), None, fds).unwrap();
    }

    fn send_bare(master: &mut Endpoint, req: MasterReq) {
        let hdr = VhostUserMsgHeader::new(req, 0, 0);
        master
            .send_message::<VhostUserU64>(&hdr, None, None, &[])
            .unwrap();
    }

    fn recv_u64(master: &mut Endpoint, expect: MasterReq) -> u64 {
        let (hdr, fds) = master.recv_header().unwrap();
        assert!(hdr.is_reply());
        assert_eq!(hdr.code(), Some(expect));
        assert!(fds.is_empty());
        let buf = master.recv_payload(hdr.size() as usize).unwrap();
        let msg = VhostUserU64::from_slice(&buf).unwrap();
        { msg.value }
    }

    /// Send a setter with NEED_REPLY and wait for the zero ack. Serves as a
    /// synchronization barrier with the vhost loop in tests.
    fn send_acked(master: &mut Endpoint, req: MasterReq, body: &impl ByteValued, fds: &[RawFd]) {
        send(
            master,
            req,
            VhostUserHeaderFlag::NEED_REPLY.bits(),
            body,
            fds,
        );
        assert_eq!(recv_u64(master, req), 0);
    }

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn handshake_and_reply_ack() {
        let (_dir, vdev, _rq) = setup("handshake.sock");
        let mut master = connect(&vdev);

        // S1: feature negotiation.
        send_bare(&mut master, MasterReq::GET_FEATURES);
        let features = recv_u64(&mut master, MasterReq::GET_FEATURES);
        assert_ne!(
            features & VhostUserVirtioFeatures::PROTOCOL_FEATURES.bits(),
            0
        );

        send(
            &mut master,
            MasterReq::SET_FEATURES,
            0,
            &VhostUserU64::new(features),
            &[],
        );
        send_bare(&mut master, MasterReq::SET_OWNER);

        send_bare(&mut master, MasterReq::GET_PROTOCOL_FEATURES);
        let proto = recv_u64(&mut master, MasterReq::GET_PROTOCOL_FEATURES);
        assert_eq!(proto, default_protocol_features().bits());

        send(
            &mut master,
            MasterReq::SET_PROTOCOL_FEATURES,
            0,
            &VhostUserU64::new(VhostUserProtocolFeatures::REPLY_ACK.bits()),
            &[],
        );

        // GET_QUEUE_NUM doubles as the sync point for the setters above.
        send_bare(&mut master, MasterReq::GET_QUEUE_NUM);
        assert_eq!(recv_u64(&mut master, MasterReq::GET_QUEUE_NUM), 2);

        assert!(vdev.is_owned());
        assert_eq!(vdev.negotiated_features(), features);
        assert_eq!(
            vdev.negotiated_protocol_features(),
            VhostUserProtocolFeatures::REPLY_ACK
        );
        assert_eq!(vdev.state(), VdevState::Connected);

        // S6: out-of-range vring index surfaces as an EINVAL ack.
        send(
            &mut master,
            MasterReq::SET_VRING_NUM,
            VhostUserHeaderFlag::NEED_REPLY.bits(),
            &VhostUserVringState::new(99, 256),
            &[],
        );
        assert_eq!(
            recv_u64(&mut master, MasterReq::SET_VRING_NUM),
            u64::from(libc::EINVAL as u32)
        );

        // Unsupported opcodes turn into ENOTSUP acks, never disconnects.
        send(
            &mut master,
            MasterReq::RESET_OWNER,
            VhostUserHeaderFlag::NEED_REPLY.bits(),
            &VhostUserU64::new(0),
            &[],
        );
        assert_eq!(
            recv_u64(&mut master, MasterReq::RESET_OWNER),
            u64::from(libc::ENOTSUP as u32)
        );
        assert_eq!(vdev.state(), VdevState::Connected);

        vdev.uninit();
    }

    #[test]
    fn surplus_feature_bits_are_dropped() {
        let (_dir, vdev, _rq) = setup("features.sock");
        let mut master = connect(&vdev);

        send_bare(&mut master, MasterReq::GET_FEATURES);
        let supported = recv_u64(&mut master, MasterReq::GET_FEATURES);

        send(
            &mut master,
            MasterReq::SET_FEATURES,
            0,
            &VhostUserU64::new(supported | (1 << 55)),
            &[],
        );
        send_bare(&mut master, MasterReq::GET_QUEUE_NUM);
        recv_u64(&mut master, MasterReq::GET_QUEUE_NUM);

        assert_eq!(vdev.negotiated_features(), supported);
        vdev.uninit();
    }

    #[test]
    fn config_space_read() {
        let (_dir, vdev, _rq) = setup("config.sock");
        let mut master = connect(&vdev);

        let desc = VhostUserConfig::new(CONFIG_OFFSET, 8, 0);
        let hdr = VhostUserMsgHeader::new(
            MasterReq::GET_CONFIG,
            0,
            (mem::size_of::<VhostUserConfig>() + 8) as u32,
        );
        master
            .send_message(&hdr, Some(&desc), Some(&[0u8; 8]), &[])
            .unwrap();

        let (rhdr, _) = master.recv_header().unwrap();
        assert!(rhdr.is_reply());
        assert_eq!(rhdr.code(), Some(MasterReq::GET_CONFIG));
        let buf = master.recv_payload(rhdr.size() as usize).unwrap();
        let rdesc = VhostUserConfig::from_slice(&buf[..mem::size_of::<VhostUserConfig>()]).unwrap();
        assert_eq!({ rdesc.size }, 8);
        assert_eq!(buf.len(), mem::size_of::<VhostUserConfig>() + 8);

        vdev.uninit();
    }

    #[test]
    fn inflight_region_transfer() {
        let (_dir, vdev, _rq) = setup("inflight.sock");
        let mut master = connect(&vdev);

        let ask = VhostUserInflight {
            mmap_size: 0,
            mmap_offset: 0,
            num_queues: 2,
            queue_size: 128,
        };
        send(&mut master, MasterReq::GET_INFLIGHT_FD, 0, &ask, &[]);

        let (rhdr, mut fds) = master.recv_header().unwrap();
        assert!(rhdr.is_reply());
        assert_eq!(fds.len(), 1);
        let buf = master.recv_payload(rhdr.size() as usize).unwrap();
        let reply = VhostUserInflight::from_slice(&buf).unwrap();
        let total = crate::inflight::per_queue_size(128) * 2;
        assert_eq!({ reply.mmap_size }, total);
        assert_eq!({ reply.mmap_offset }, 0);
        assert!(vdev.has_inflight());

        // Hand the same fd back the way a reconnecting master would.
        let file = fds.pop().unwrap();
        let set = VhostUserInflight {
            mmap_size: total,
            mmap_offset: 0,
            num_queues: 2,
            queue_size: 128,
        };
        let hdr = VhostUserMsgHeader::new(
            MasterReq::SET_INFLIGHT_FD,
            0,
            mem::size_of::<VhostUserInflight>() as u32,
        );
        master
            .send_message(&hdr, Some(&set), None, &[file.as_raw_fd()])
            .unwrap();

        send_bare(&mut master, MasterReq::GET_QUEUE_NUM);
        recv_u64(&mut master, MasterReq::GET_QUEUE_NUM);
        assert!(vdev.has_inflight());
        {
            let inner = vdev.inner.lock().unwrap();
            let region = inner.inflight.as_ref().unwrap();
            let header = region.queue_header(1).unwrap();
            assert_eq!(header.version, 1);
            assert_eq!(header.desc_num, 128);
        }

        vdev.uninit();
    }

    struct GuestLayout {
        base: usize,
        uva: u64,
    }

    const DESC_GPA: u64 = 0x0;
    const AVAIL_GPA: u64 = 0x1000;
    const USED_GPA: u64 = 0x2000;
    const HDR_GPA: u64 = 0x3000;
    const STATUS_GPA: u64 = 0x3100;
    const DATA_GPA: u64 = 0x4000;
    const QSIZE: u16 = 8;

    impl GuestLayout {
        unsafe fn write<T: Copy>(&self, gpa: u64, val: T) {
            std::ptr::write_volatile((self.base + gpa as usize) as *mut T, val)
        }

        unsafe fn read<T: Copy>(&self, gpa: u64) -> T {
            std::ptr::read_volatile((self.base + gpa as usize) as *const T)
        }

        fn write_desc(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
            let off = DESC_GPA + u64::from(index) * 16;
            unsafe {
                self.write(off, addr);
                self.write(off + 8, len);
                self.write(off + 12, flags);
                self.write(off + 14, next);
            }
        }

        fn push_avail(&self, head: u16) {
            unsafe {
                let idx: u16 = self.read(AVAIL_GPA + 2);
                self.write(AVAIL_GPA + 4 + u64::from(idx % QSIZE) * 2, head);
                self.write(AVAIL_GPA + 2, idx.wrapping_add(1));
            }
        }

        fn queue_write_request(&self) {
            unsafe {
                self.write(HDR_GPA, VIRTIO_BLK_T_OUT);
                self.write(HDR_GPA + 4, 0u32);
                self.write(HDR_GPA + 8, 0u64);
            }
            self.write_desc(0, HDR_GPA, 16, VIRTQ_DESC_F_NEXT, 1);
            self.write_desc(1, DATA_GPA, 512, VIRTQ_DESC_F_NEXT, 2);
            self.write_desc(2, STATUS_GPA, 1, VIRTQ_DESC_F_WRITE, 0);
            self.push_avail(0);
        }
    }

    /// Full bring-up over the socket: memory table, vring negotiation,
    /// explicit enable, kick-driven dispatch, completion, reconnect.
    #[test]
    fn vring_enable_dispatch_and_reconnect() {
        let (_dir, vdev, rq) = setup("datapath.sock");
        let mut master = connect(&vdev);

        send_bare(&mut master, MasterReq::GET_FEATURES);
        let features = recv_u64(&mut master, MasterReq::GET_FEATURES);
        send(
            &mut master,
            MasterReq::SET_FEATURES,
            0,
            &VhostUserU64::new(features),
            &[],
        );
        send_bare(&mut master, MasterReq::SET_OWNER);
        send_bare(&mut master, MasterReq::GET_PROTOCOL_FEATURES);
        recv_u64(&mut master, MasterReq::GET_PROTOCOL_FEATURES);
        send(
            &mut master,
            MasterReq::SET_PROTOCOL_FEATURES,
            0,
            &VhostUserU64::new(
                (VhostUserProtocolFeatures::REPLY_ACK | VhostUserProtocolFeatures::MQ).bits(),
            ),
            &[],
        );
        send_bare(&mut master, MasterReq::GET_QUEUE_NUM);
        recv_u64(&mut master, MasterReq::GET_QUEUE_NUM);

        // S2: one 64 KiB region at gpa 0.
        let mut backing = tempfile::tempfile().unwrap();
        backing.write_all(&[0u8; 64]).unwrap();
        backing.set_len(0x10000).unwrap();
        let uva = 0x7f80_0000_0000u64;
        let table = {
            let mut buf = Vec::new();
            buf.extend_from_slice(
                VhostUserMemory {
                    num_regions: 1,
                    padding: 0,
                }
                .as_slice(),
            );
            buf.extend_from_slice(
                VhostUserMemoryRegion {
                    guest_phys_addr: 0,
                    memory_size: 0x10000,
                    user_addr: uva,
                    mmap_offset: 0,
                }
                .as_slice(),
            );
            buf
        };
        let hdr = VhostUserMsgHeader::new(
            MasterReq::SET_MEM_TABLE,
            VhostUserHeaderFlag::NEED_REPLY.bits(),
            table.len() as u32,
        );
        master
            .send_message::<VhostUserU64>(&hdr, None, Some(&table), &[backing.as_raw_fd()])
            .unwrap();
        assert_eq!(recv_u64(&mut master, MasterReq::SET_MEM_TABLE), 0);

        let guest = {
            let mem = vdev.memory();
            let mem = mem.read().unwrap();
            assert_eq!(mem.num_regions(), 1);
            assert!(mem.gpa_range_to_hva(0x10000, 1).is_none());
            GuestLayout {
                base: mem.gpa_range_to_hva(0, 0x10000).unwrap(),
                uva,
            }
        };
        guest.queue_write_request();

        // S4: modern vring bring-up; nothing starts before the enable.
        send_acked(
            &mut master,
            MasterReq::SET_VRING_NUM,
            &VhostUserVringState::new(0, u32::from(QSIZE)),
            &[],
        );
        send_acked(
            &mut master,
            MasterReq::SET_VRING_BASE,
            &VhostUserVringState::new(0, 0),
            &[],
        );
        let addr = VhostUserVringAddr {
            index: 0,
            flags: 0,
            descriptor: guest.uva + DESC_GPA,
            used: guest.uva + USED_GPA,
            available: guest.uva + AVAIL_GPA,
            log: 0,
        };
        send_acked(&mut master, MasterReq::SET_VRING_ADDR, &addr, &[]);

        let kick = EventFd::new(0).unwrap();
        let call = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        send_acked(
            &mut master,
            MasterReq::SET_VRING_CALL,
            &VhostUserU64::new(0),
            &[call.as_raw_fd()],
        );
        send_acked(
            &mut master,
            MasterReq::SET_VRING_KICK,
            &VhostUserU64::new(0),
            &[kick.as_raw_fd()],
        );

        let vring = vdev.vring(0).unwrap();
        assert!(!vring.read().unwrap().enabled);

        send_acked(
            &mut master,
            MasterReq::SET_VRING_ENABLE,
            &VhostUserVringState::new(0, 1),
            &[],
        );
        assert!(vring.read().unwrap().enabled);
        let slave_kick_fd = vring.read().unwrap().kick.as_ref().unwrap().as_raw_fd();
        assert!(rq.has_event(slave_kick_fd));

        // Guest kick; the request-queue loop drains the ring.
        kick.write(1).unwrap();
        rq.run_once(5000).unwrap();

        let request = rq.dequeue().expect("no request dispatched");
        assert_eq!(request.first_sector(), 0);
        assert_eq!(request.num_sectors(), 1);
        request.complete(Ok(()));

        let status: u8 = unsafe { guest.read(STATUS_GPA) };
        assert_eq!(status, VIRTIO_BLK_S_OK as u8);
        let used_idx: u16 = unsafe { guest.read(USED_GPA + 2) };
        assert_eq!(used_idx, 1);
        assert_eq!(call.read().unwrap(), 1);

        // One chain was consumed.
        send(
            &mut master,
            MasterReq::GET_VRING_BASE,
            0,
            &VhostUserVringState::new(0, 0),
            &[],
        );
        assert_eq!(recv_u64(&mut master, MasterReq::GET_VRING_BASE), 1);
        // Protocol features negotiated: the ring stays enabled.
        assert!(vring.read().unwrap().enabled);

        // S5: master goes away, device returns to listening with a clean
        // slate and accepts a new master.
        drop(master);
        wait_for("return to listening", || {
            vdev.state() == VdevState::Listening
        });
        assert!(!vdev.is_owned());
        assert!(!vring.read().unwrap().enabled);
        assert!(vring.read().unwrap().kick.is_none());
        assert_eq!(vdev.memory().read().unwrap().num_regions(), 0);
        assert!(!rq.has_event(slave_kick_fd));

        let mut master = connect(&vdev);
        send_bare(&mut master, MasterReq::GET_FEATURES);
        assert_eq!(recv_u64(&mut master, MasterReq::GET_FEATURES), features);
        assert_eq!(vdev.state(), VdevState::Connected);

        vdev.uninit();
    }

    /// S3: without the protocol-features handshake the kick fd starts the
    /// ring and GET_VRING_BASE stops it.
    #[test]
    fn legacy_enable_on_kick() {
        let (_dir, vdev, _rq) = setup("legacy.sock");
        let mut master = connect(&vdev);

        send_bare(&mut master, MasterReq::GET_FEATURES);
        recv_u64(&mut master, MasterReq::GET_FEATURES);
        // Note: PROTOCOL_FEATURES deliberately not acked, but REPLY_ACK
        // cannot be used either, so getters are the only sync points.
        send(
            &mut master,
            MasterReq::SET_FEATURES,
            0,
            &VhostUserU64::new(0),
            &[],
        );
        send_bare(&mut master, MasterReq::SET_OWNER);

        let mut backing = tempfile::tempfile().unwrap();
        backing.write_all(&[0u8; 64]).unwrap();
        backing.set_len(0x10000).unwrap();
        let uva = 0x7f90_0000_0000u64;
        let mut table = Vec::new();
        table.extend_from_slice(
            VhostUserMemory {
                num_regions: 1,
                padding: 0,
            }
            .as_slice(),
        );
        table.extend_from_slice(
            VhostUserMemoryRegion {
                guest_phys_addr: 0,
                memory_size: 0x10000,
                user_addr: uva,
                mmap_offset: 0,
            }
            .as_slice(),
        );
        let hdr = VhostUserMsgHeader::new(MasterReq::SET_MEM_TABLE, 0, table.len() as u32);
        master
            .send_message::<VhostUserU64>(&hdr, None, Some(&table), &[backing.as_raw_fd()])
            .unwrap();

        send(
            &mut master,
            MasterReq::SET_VRING_NUM,
            0,
            &VhostUserVringState::new(0, u32::from(QSIZE)),
            &[],
        );
        send(
            &mut master,
            MasterReq::SET_VRING_BASE,
            0,
            &VhostUserVringState::new(0, 0),
            &[],
        );
        let addr = VhostUserVringAddr {
            index: 0,
            flags: 0,
            descriptor: uva + DESC_GPA,
            used: uva + USED_GPA,
            available: uva + AVAIL_GPA,
            log: 0,
        };
        send(&mut master, MasterReq::SET_VRING_ADDR, 0, &addr, &[]);

        let kick = EventFd::new(0).unwrap();
        let call = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        send(
            &mut master,
            MasterReq::SET_VRING_CALL,
            0,
            &VhostUserU64::new(0),
            &[call.as_raw_fd()],
        );
        send(
            &mut master,
            MasterReq::SET_VRING_KICK,
            0,
            &VhostUserU64::new(0),
            &[kick.as_raw_fd()],
        );

        let vring = vdev.vring(0).unwrap();
        wait_for("auto enable on kick", || vring.read().unwrap().enabled);

        // The stop path: GET_VRING_BASE disables the ring before replying.
        send(
            &mut master,
            MasterReq::GET_VRING_BASE,
            0,
            &VhostUserVringState::new(0, 0),
            &[],
        );
        assert_eq!(recv_u64(&mut master, MasterReq::GET_VRING_BASE), 0);
        assert!(!vring.read().unwrap().enabled);

        vdev.uninit();
    }

    #[test]
    fn polling_mode_refused() {
        let (_dir, vdev, _rq) = setup("nofd.sock");
        let mut master = connect(&vdev);

        send(
            &mut master,
            MasterReq::SET_PROTOCOL_FEATURES,
            0,
            &VhostUserU64::new(VhostUserProtocolFeatures::REPLY_ACK.bits()),
            &[],
        );
        send(
            &mut master,
            MasterReq::SET_VRING_KICK,
            VhostUserHeaderFlag::NEED_REPLY.bits(),
            &VhostUserU64::new(VRING_NOFD_MASK),
            &[],
        );
        assert_eq!(
            recv_u64(&mut master, MasterReq::SET_VRING_KICK),
            u64::from(libc::ENOTSUP as u32)
        );

        vdev.uninit();
    }

    #[test]
    fn state_machine_rejects_bad_transitions() {
        let (_dir, vdev, _rq) = setup("transitions.sock");
        assert_eq!(vdev.state(), VdevState::Listening);

        {
            let mut inner = vdev.inner.lock().unwrap();
            // Listening -> Initialized never happens.
            match vdev.change_state(&mut inner, VdevState::Initialized) {
                Err(Error::InvalidStateTransition(VdevState::Listening, VdevState::Initialized)) => {
                }
                other => panic!("unexpected result: {:?}", other),
            }
            assert_eq!(inner.state, VdevState::Listening);

            // Listening -> Listening is not a legal re-arm either.
            assert!(vdev.change_state(&mut inner, VdevState::Listening).is_err());
            assert_eq!(inner.state, VdevState::Listening);
        }

        vdev.uninit();
        // Uninit is idempotent.
        vdev.uninit();
    }

    #[test]
    fn registry_tracks_live_devices() {
        let (_dir, vdev, _rq) = setup("registry.sock");
        let path = vdev.inner.lock().unwrap().listener.path().to_path_buf();
        assert!(DEVICES.lock().unwrap().contains_key(&path));

        vdev.uninit();
        assert!(!DEVICES.lock().unwrap().contains_key(&path));
    }
}
