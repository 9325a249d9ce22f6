// SPDX-License-Identifier: Apache-2.0

//! The boundary between queue dispatch and the caller's I/O engine.
//!
//! A request queue owns an event loop that the caller drives from its own
//! threads. Enabling a vring registers the vring's kick fd here; each kick
//! drains the virtqueue and pushes the parsed requests onto the FIFO, where
//! the caller picks them up with [`RequestQueue::dequeue`] or
//! [`RequestQueue::wait_request`] and completes them at its leisure.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::block::BlockRequest;
use crate::event::{EventHandler, EventLoop};

pub struct RequestQueue {
    events: EventLoop,
    pending: Mutex<VecDeque<BlockRequest>>,
    avail: Condvar,
}

impl RequestQueue {
    pub fn new() -> std::io::Result<Self> {
        Ok(RequestQueue {
            events: EventLoop::new()?,
            pending: Mutex::new(VecDeque::new()),
            avail: Condvar::new(),
        })
    }

    /// Watch `fd` on this queue's event loop. Used by the protocol engine to
    /// register vring kick fds when a vring is enabled.
    pub fn attach_event(&self, fd: RawFd, handler: Arc<dyn EventHandler>) -> std::io::Result<()> {
        self.events.add_event(fd, handler)
    }

    /// Stop watching `fd`. Called when a vring is disabled or torn down.
    pub fn detach_event(&self, fd: RawFd) {
        self.events.del_event(fd)
    }

    pub(crate) fn has_event(&self, fd: RawFd) -> bool {
        self.events.has_event(fd)
    }

    /// Process events until [`RequestQueue::stop`] is called. Meant to run on
    /// a caller thread dedicated to this queue.
    pub fn run(&self) {
        self.events.run()
    }

    /// Process at most one batch of pending events.
    pub fn run_once(&self, timeout_ms: i32) -> std::io::Result<bool> {
        self.events.run_once(timeout_ms)
    }

    pub fn stop(&self) {
        self.events.stop()
    }

    /// Queue a request parsed off a vring. Called during kick dispatch.
    pub fn enqueue(&self, request: BlockRequest) {
        self.pending.lock().unwrap().push_back(request);
        self.avail.notify_one();
    }

    /// Take the oldest pending request, if any.
    pub fn dequeue(&self) -> Option<BlockRequest> {
        self.pending.lock().unwrap().pop_front()
    }

    /// Block until a request is available or the timeout elapses.
    pub fn wait_request(&self, timeout: Duration) -> Option<BlockRequest> {
        let mut pending = self.pending.lock().unwrap();
        loop {
            if let Some(request) = pending.pop_front() {
                return Some(request);
            }
            let (guard, result) = self.avail.wait_timeout(pending, timeout).unwrap();
            pending = guard;
            if result.timed_out() {
                return pending.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}
