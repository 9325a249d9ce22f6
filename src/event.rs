// SPDX-License-Identifier: Apache-2.0

//! Epoll-backed event dispatch.
//!
//! Two kinds of loops are built from the same primitive: the process-wide
//! vhost loop (one dedicated thread watching every device's listen or
//! connection socket) and per-request-queue loops driven from caller threads
//! watching vring kick fds.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use lazy_static::lazy_static;
use log::{debug, error, warn};
use vmm_sys_util::eventfd::EventFd;

/// Callbacks attached to one watched file descriptor.
///
/// `readable` runs when the fd has data; `closed` when the peer hung up. A
/// `readable` error is treated as loss of the underlying channel and is
/// followed by a `closed` call. Handlers on one loop run to completion
/// before the next event is dispatched, so a single fd never observes
/// overlapping callbacks.
pub trait EventHandler: Send + Sync {
    fn readable(&self) -> crate::Result<()>;

    fn closed(&self) {}
}

/// Token reserved for the loop's own wakeup eventfd.
const INTERRUPT_TOKEN: u64 = u64::MAX;

pub struct EventLoop {
    epoll_fd: RawFd,
    handlers: Mutex<HashMap<RawFd, Arc<dyn EventHandler>>>,
    interrupt: EventFd,
    exiting: AtomicBool,
}

impl EventLoop {
    pub fn new() -> std::io::Result<Self> {
        let epoll_fd = epoll::create(true)?;
        let interrupt = EventFd::new(libc::EFD_NONBLOCK)?;
        epoll::ctl(
            epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            interrupt.as_raw_fd(),
            epoll::Event::new(epoll::Events::EPOLLIN, INTERRUPT_TOKEN),
        )?;
        Ok(EventLoop {
            epoll_fd,
            handlers: Mutex::new(HashMap::new()),
            interrupt,
            exiting: AtomicBool::new(false),
        })
    }

    /// Start watching `fd`. The handler stays registered until `del_event`.
    pub fn add_event(&self, fd: RawFd, handler: Arc<dyn EventHandler>) -> std::io::Result<()> {
        let mut handlers = self.handlers.lock().unwrap();
        epoll::ctl(
            self.epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            fd,
            epoll::Event::new(epoll::Events::EPOLLIN, fd as u64),
        )?;
        handlers.insert(fd, handler);
        Ok(())
    }

    /// Stop watching `fd`. Safe to call for fds that were never added.
    pub fn del_event(&self, fd: RawFd) {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.remove(&fd).is_some() {
            let _ = epoll::ctl(
                self.epoll_fd,
                epoll::ControlOptions::EPOLL_CTL_DEL,
                fd,
                epoll::Event::new(epoll::Events::empty(), 0),
            );
        }
    }

    pub fn has_event(&self, fd: RawFd) -> bool {
        self.handlers.lock().unwrap().contains_key(&fd)
    }

    /// Wait for events once and dispatch them. Returns `false` once the loop
    /// has been told to stop.
    pub fn run_once(&self, timeout_ms: i32) -> std::io::Result<bool> {
        const EVENTS_LEN: usize = 32;
        let mut events = vec![epoll::Event::new(epoll::Events::empty(), 0); EVENTS_LEN];

        let num = match epoll::wait(self.epoll_fd, timeout_ms, &mut events[..]) {
            Ok(n) => n,
            // Interrupted waits are retried by the caller's loop.
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        for event in events.iter().take(num) {
            if event.data == INTERRUPT_TOKEN {
                while self.interrupt.read().is_ok() {}
                continue;
            }

            let fd = event.data as RawFd;
            let handler = match self.handlers.lock().unwrap().get(&fd) {
                Some(h) => Arc::clone(h),
                // Deleted by an earlier handler in this batch.
                None => continue,
            };

            let evset = epoll::Events::from_bits(event.events).unwrap_or(epoll::Events::empty());
            if evset.contains(epoll::Events::EPOLLIN) {
                if let Err(e) = handler.readable() {
                    error!("event handler failed on fd {}: {}", fd, e);
                    handler.closed();
                    continue;
                }
            }
            if evset.intersects(epoll::Events::EPOLLHUP | epoll::Events::EPOLLERR) {
                handler.closed();
            }
        }

        Ok(!self.exiting.load(Ordering::Acquire))
    }

    /// Dispatch events until `stop` is called.
    pub fn run(&self) {
        while !self.exiting.load(Ordering::Acquire) {
            if let Err(e) = self.run_once(-1) {
                error!("event loop wait failed: {}", e);
                break;
            }
        }
        debug!("event loop exiting");
    }

    /// Wake the loop up exactly once.
    pub fn interrupt(&self) {
        if let Err(e) = self.interrupt.write(1) {
            warn!("failed to interrupt event loop: {}", e);
        }
    }

    pub fn stop(&self) {
        self.exiting.store(true, Ordering::Release);
        self.interrupt();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

lazy_static! {
    static ref VHOST_LOOP: EventLoop =
        EventLoop::new().expect("failed to create the vhost event loop");
    static ref VHOST_THREAD: Mutex<Option<thread::JoinHandle<()>>> = Mutex::new(None);
}

/// The loop every device's listen and connection socket is registered with.
pub(crate) fn vhost_loop() -> &'static EventLoop {
    &VHOST_LOOP
}

/// Spawn the vhost event loop thread. Idempotent; must be called before any
/// device is put into server mode.
pub fn start_vhost_event_loop() -> std::io::Result<()> {
    let mut guard = VHOST_THREAD.lock().unwrap();
    if guard.is_some() {
        return Ok(());
    }
    let handle = thread::Builder::new()
        .name("vhost-events".to_string())
        .spawn(|| {
            // Control-plane work yields to request processing.
            unsafe { libc::nice(10) };
            VHOST_LOOP.run();
        })?;
    *guard = Some(handle);
    Ok(())
}

/// Stop the vhost event loop and join its thread. No further protocol
/// messages are serviced afterwards; in-flight handlers complete first.
pub fn stop_vhost_event_loop() {
    VHOST_LOOP.stop();
    if let Some(handle) = VHOST_THREAD.lock().unwrap().take() {
        if handle.join().is_err() {
            error!("vhost event loop thread panicked");
        }
    }
}

/// Wake the vhost event loop once without stopping it.
pub fn interrupt_vhost_event_loop() {
    VHOST_LOOP.interrupt();
}
