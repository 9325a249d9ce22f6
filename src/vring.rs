// SPDX-License-Identifier: Apache-2.0

//! Per-queue state of a served device.

use vmm_sys_util::eventfd::EventFd;

use crate::virtqueue::Virtqueue;

/// Ring parameters accumulated from the master across several messages.
///
/// `SET_VRING_{ADDR,NUM,BASE}` each fill in a piece; the collected state is
/// consumed when the vring is enabled. Addresses are stored already
/// translated into this process.
#[derive(Debug, Default, Clone)]
pub struct VringClientInfo {
    pub desc_addr: Option<usize>,
    pub avail_addr: Option<usize>,
    pub used_addr: Option<usize>,
    pub num: u16,
    pub base: u16,
    pub inflight_addr: Option<usize>,
}

/// One virtqueue of a device: negotiated client state, the eventfds handed
/// over by the master, and the attached queue.
pub struct Vring {
    /// Index of this vring within its device.
    pub id: u16,
    pub client_info: VringClientInfo,
    pub kick: Option<EventFd>,
    pub call: Option<EventFd>,
    pub err: Option<EventFd>,
    pub enabled: bool,
    pub vq: Virtqueue,
}

impl Vring {
    pub fn new(id: u16) -> Self {
        Vring {
            id,
            client_info: Default::default(),
            kick: None,
            call: None,
            err: None,
            enabled: false,
            vq: Virtqueue::new(),
        }
    }

    /// Whether everything needed to attach the queue has been negotiated.
    pub fn can_enable(&self) -> bool {
        self.client_info.desc_addr.is_some()
            && self.client_info.avail_addr.is_some()
            && self.client_info.used_addr.is_some()
            && self.client_info.num != 0
            && self.kick.is_some()
    }

    /// Drop all negotiated state and close the master's eventfds. The vring
    /// must already be disabled.
    pub(crate) fn reset(&mut self) {
        debug_assert!(!self.enabled);
        self.client_info = Default::default();
        self.kick = None;
        self.call = None;
        self.err = None;
        self.vq.release();
    }
}
