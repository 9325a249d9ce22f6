// SPDX-License-Identifier: Apache-2.0

//! vhost-user backend server library.
//!
//! A hypervisor (the master) delegates emulation of a virtio device to this
//! process (the slave) over a UNIX stream socket. The library owns the
//! protocol side of that arrangement: it listens for the master, negotiates
//! features, maps guest memory from passed file descriptors, attaches
//! virtqueues at negotiated addresses, and turns guest kicks into block
//! requests on a request queue the caller drains with its own I/O engine.
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use vhost_backend::{BlockDevice, RequestQueue, Vdev};
//!
//! vhost_backend::start_vhost_event_loop().unwrap();
//!
//! let rq = Arc::new(RequestQueue::new().unwrap());
//! let disk = Arc::new(BlockDevice::new("disk0", 1 << 20, 4096, 4, false).unwrap());
//! let vdev = Vdev::init_server("/tmp/vhost.sock", disk, 4, Arc::clone(&rq)).unwrap();
//!
//! // Caller-owned request loop: watch kicks, execute I/O, complete.
//! std::thread::spawn({
//!     let rq = Arc::clone(&rq);
//!     move || rq.run()
//! });
//! while let Some(request) = rq.wait_request(std::time::Duration::from_secs(1)) {
//!     request.complete(Ok(()));
//! }
//!
//! vdev.uninit();
//! vhost_backend::stop_vhost_event_loop();
//! ```
//!
//! Concurrency contract: the vhost event loop is the single writer of all
//! device state. Request-queue loops only read what the protocol engine
//! published before enabling a vring and will not revoke until after
//! disabling it.

use std::path::PathBuf;

use thiserror::Error;

pub mod block;
pub mod connection;
pub mod event;
pub mod inflight;
pub mod memory;
pub mod message;
pub mod request_queue;
pub mod vdev;
pub mod virtqueue;
pub mod vring;

pub use block::{BlockDevice, BlockIoKind, BlockRequest};
pub use connection::Listener;
pub use event::{
    interrupt_vhost_event_loop, start_vhost_event_loop, stop_vhost_event_loop, EventHandler,
    EventLoop,
};
pub use memory::{GpaTranslator, GuestMemoryMap};
pub use request_queue::RequestQueue;
pub use vdev::{registered_devices, Vdev, VdevState, VhostDevice};
pub use vring::Vring;

/// Errors of the protocol engine and its collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// A parameter or payload field is out of range for the device.
    #[error("invalid parameter")]
    InvalidParam,
    /// The operation is not implemented by this backend.
    #[error("operation not supported")]
    NotSupported,
    /// A syntactically broken message.
    #[error("invalid message")]
    InvalidMessage,
    /// Short read or write against the message framing.
    #[error("partial message")]
    PartialMessage,
    /// The peer closed the connection.
    #[error("peer disconnected")]
    Disconnected,
    /// More fds attached than the protocol permits.
    #[error("too many attached file descriptors")]
    TooManyFds,
    /// A memory slot already maps a different region.
    #[error("memory region slot {0} is busy")]
    RegionBusy(usize),
    /// A transition outside the device state machine.
    #[error("invalid device state transition {0:?} -> {1:?}")]
    InvalidStateTransition(VdevState, VdevState),
    /// The listen path exists and is not a socket.
    #[error("socket path {0:?} exists and is not a socket")]
    PathExists(PathBuf),
    /// The listen path does not fit in a UNIX socket address.
    #[error("socket path {0:?} is too long")]
    PathTooLong(PathBuf),
    /// Mapping shared memory failed.
    #[error("mmap failed: {0}")]
    MmapFailed(#[source] std::io::Error),
    /// Socket-level failure.
    #[error("socket error: {0}")]
    SocketError(#[source] std::io::Error),
    /// Other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The errno reported to the master through a REPLY_ACK status.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidParam
            | Error::InvalidMessage
            | Error::InvalidStateTransition(..)
            | Error::PathTooLong(_) => libc::EINVAL,
            Error::NotSupported => libc::ENOTSUP,
            Error::RegionBusy(_) => libc::EBUSY,
            Error::PathExists(_) => libc::EEXIST,
            Error::PartialMessage | Error::Disconnected | Error::TooManyFds => libc::EIO,
            Error::MmapFailed(e) | Error::SocketError(e) | Error::Io(e) => {
                e.raw_os_error().unwrap_or(libc::EIO)
            }
        }
    }
}

/// Result type used across the library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::InvalidParam.errno(), libc::EINVAL);
        assert_eq!(Error::NotSupported.errno(), libc::ENOTSUP);
        assert_eq!(Error::RegionBusy(3).errno(), libc::EBUSY);
        assert_eq!(Error::Disconnected.errno(), libc::EIO);
        assert_eq!(
            Error::Io(std::io::Error::from_raw_os_error(libc::EACCES)).errno(),
            libc::EACCES
        );
        assert_eq!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).errno(),
            libc::EIO
        );
    }
}
