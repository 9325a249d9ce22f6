// SPDX-License-Identifier: Apache-2.0

//! UNIX domain socket plumbing: the server listener and the per-connection
//! endpoint that frames vhost-user messages and carries `SCM_RIGHTS` fds.

use std::fs::File;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use libc::{c_void, cmsghdr, iovec, msghdr};
use log::error;
use vm_memory::ByteValued;

use crate::message::*;
use crate::{Error, Result};

const fn cmsg_align(len: usize) -> usize {
    (len + mem::size_of::<libc::c_long>() - 1) & !(mem::size_of::<libc::c_long>() - 1)
}

const fn cmsg_space(len: usize) -> usize {
    mem::size_of::<cmsghdr>() + cmsg_align(len)
}

const fn cmsg_data_len(len: usize) -> usize {
    mem::size_of::<cmsghdr>() + len
}

/// Control buffer large enough for `MAX_ATTACHED_FDS` descriptors.
const CMSG_CAPACITY: usize = cmsg_space(MAX_ATTACHED_FDS * mem::size_of::<RawFd>());

/// Listening socket for incoming master connections.
///
/// The socket file is created at construction and unlinked on drop. An
/// existing socket at the path is taken over (stale leftover from a previous
/// run); any other file type is refused.
pub struct Listener {
    sock: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        if path.as_os_str().as_bytes().len() >= addr.sun_path.len() {
            return Err(Error::PathTooLong(path));
        }

        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(&path).map_err(Error::SocketError)?;
            }
            Ok(_) => return Err(Error::PathExists(path)),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::SocketError(e)),
        }

        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(Error::SocketError(std::io::Error::last_os_error()));
        }
        // Owns the fd from here on, so error paths below close it.
        let sock = unsafe { UnixListener::from_raw_fd(fd) };

        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr
            .sun_path
            .iter_mut()
            .zip(path.as_os_str().as_bytes().iter())
        {
            *dst = *src as libc::c_char;
        }

        let ret = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::SocketError(std::io::Error::last_os_error()));
        }

        // Backlog of 1: a single master at a time is served.
        let ret = unsafe { libc::listen(sock.as_raw_fd(), 1) };
        if ret < 0 {
            return Err(Error::SocketError(std::io::Error::last_os_error()));
        }

        sock.set_nonblocking(true).map_err(Error::SocketError)?;

        Ok(Listener { sock, path })
    }

    /// Accept a pending connection, returning `None` if there is none.
    pub fn accept(&self) -> Result<Option<UnixStream>> {
        loop {
            match self.sock.accept() {
                Ok((stream, _addr)) => return Ok(Some(stream)),
                Err(e) => match e.kind() {
                    std::io::ErrorKind::WouldBlock => return Ok(None),
                    std::io::ErrorKind::ConnectionAborted => return Ok(None),
                    std::io::ErrorKind::Interrupted => continue,
                    _ => return Err(Error::SocketError(e)),
                },
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One accepted master connection.
///
/// Receive side follows the protocol's framing contract: a single `recvmsg`
/// obtains the 12-byte header together with any ancillary fds, then one
/// `read` obtains the payload announced by the header. Either call coming up
/// short is a framing error and the caller drops the connection.
pub struct Endpoint {
    sock: UnixStream,
}

impl Endpoint {
    pub fn new(sock: UnixStream) -> Self {
        Endpoint { sock }
    }

    /// Receive a message header plus attached file descriptors.
    ///
    /// Returned descriptors are owned `File`s: dropping one that a handler
    /// does not consume closes it.
    pub fn recv_header(&mut self) -> Result<(VhostUserMsgHeader, Vec<File>)> {
        let mut hdr = VhostUserMsgHeader::default();
        // Poisoned so that stale kernel data can never masquerade as a
        // valid control message.
        let mut control = [0xffu8; CMSG_CAPACITY];

        let mut iov = iovec {
            iov_base: hdr.as_mut_slice().as_mut_ptr() as *mut c_void,
            iov_len: MSG_HDR_SIZE,
        };
        let mut msg: msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = control.len() as _;

        let n = unsafe { libc::recvmsg(self.sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n < 0 {
            return Err(Error::SocketError(std::io::Error::last_os_error()));
        }
        if n == 0 {
            return Err(Error::Disconnected);
        }

        let fds = parse_scm_rights(&msg);
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            error!("too many fds attached to request, control data truncated");
            return Err(Error::TooManyFds);
        }
        if n as usize != MSG_HDR_SIZE {
            error!("short header read: {} of {} bytes", n, MSG_HDR_SIZE);
            return Err(Error::PartialMessage);
        }
        if !hdr.is_valid() {
            return Err(Error::InvalidMessage);
        }

        Ok((hdr, fds))
    }

    /// Receive the payload of a message whose header was just read.
    pub fn recv_payload(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        if len == 0 {
            return Ok(buf);
        }
        loop {
            match std::io::Read::read(&mut self.sock, &mut buf) {
                Ok(n) if n == len => return Ok(buf),
                Ok(n) => {
                    error!("short payload read: {} of {} bytes", n, len);
                    return Err(Error::PartialMessage);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // A header without its payload is a framing violation,
                    // not something to wait out.
                    return Err(Error::PartialMessage);
                }
                Err(e) => return Err(Error::SocketError(e)),
            }
        }
    }

    /// Send a message in one `sendmsg`: header, optional typed body, optional
    /// raw payload and optional fds.
    pub fn send_message<T: ByteValued>(
        &mut self,
        hdr: &VhostUserMsgHeader,
        body: Option<&T>,
        payload: Option<&[u8]>,
        fds: &[RawFd],
    ) -> Result<()> {
        if fds.len() > MAX_ATTACHED_FDS {
            return Err(Error::TooManyFds);
        }

        let mut iovs: [iovec; 3] = unsafe { mem::zeroed() };
        let mut niov = 0;
        let mut total = 0;
        let mut push = |buf: &[u8]| {
            iovs[niov] = iovec {
                iov_base: buf.as_ptr() as *mut c_void,
                iov_len: buf.len(),
            };
            niov += 1;
            total += buf.len();
        };
        push(hdr.as_slice());
        if let Some(body) = body {
            push(body.as_slice());
        }
        if let Some(payload) = payload {
            push(payload);
        }

        let mut control = [0u8; CMSG_CAPACITY];
        let mut msg: msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iovs.as_mut_ptr();
        msg.msg_iovlen = niov as _;
        if !fds.is_empty() {
            let space = cmsg_space(fds.len() * mem::size_of::<RawFd>());
            msg.msg_control = control.as_mut_ptr() as *mut c_void;
            msg.msg_controllen = space as _;
            let cmsg = cmsghdr {
                cmsg_len: cmsg_data_len(fds.len() * mem::size_of::<RawFd>()) as _,
                cmsg_level: libc::SOL_SOCKET,
                cmsg_type: libc::SCM_RIGHTS,
            };
            unsafe {
                std::ptr::write_unaligned(control.as_mut_ptr() as *mut cmsghdr, cmsg);
                std::ptr::copy_nonoverlapping(
                    fds.as_ptr(),
                    control.as_mut_ptr().add(mem::size_of::<cmsghdr>()) as *mut RawFd,
                    fds.len(),
                );
            }
        }

        let n = unsafe { libc::sendmsg(self.sock.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if n < 0 {
            return Err(Error::SocketError(std::io::Error::last_os_error()));
        }
        if n as usize != total {
            error!("short write: {} of {} bytes", n, total);
            return Err(Error::PartialMessage);
        }
        Ok(())
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

/// Collect `SCM_RIGHTS` descriptors out of the control area of a received
/// message. The control buffer was poisoned before `recvmsg`, so iteration
/// stops at the first header the kernel did not overwrite.
fn parse_scm_rights(msg: &msghdr) -> Vec<File> {
    let mut fds = Vec::new();
    let base = msg.msg_control as *const u8;
    let controllen = msg.msg_controllen as usize;
    let mut offset = 0;

    while offset + mem::size_of::<cmsghdr>() <= controllen {
        let cmsg = unsafe { std::ptr::read_unaligned(base.add(offset) as *const cmsghdr) };
        let cmsg_len = cmsg.cmsg_len as usize;
        if cmsg_len < mem::size_of::<cmsghdr>() || offset + cmsg_len > controllen {
            break;
        }
        if cmsg.cmsg_level == libc::SOL_SOCKET && cmsg.cmsg_type == libc::SCM_RIGHTS {
            let count = (cmsg_len - cmsg_data_len(0)) / mem::size_of::<RawFd>();
            for i in 0..count {
                let fd = unsafe {
                    std::ptr::read_unaligned(
                        base.add(offset + mem::size_of::<cmsghdr>() + i * mem::size_of::<RawFd>())
                            as *const RawFd,
                    )
                };
                fds.push(unsafe { File::from_raw_fd(fd) });
            }
            break;
        }
        offset += cmsg_align(cmsg_len);
    }

    fds
}
