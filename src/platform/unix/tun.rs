use crate::platform::unix::{Fd, InterruptEvent};
use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

/// The character device every TUN interface is created through.
const CLONE_DEVICE: &std::ffi::CStr = c"/dev/net/tun";

/// A non-blocking TUN descriptor whose blocking calls can be interrupted.
pub(crate) struct Tun {
    pub(crate) fd: Fd,
}

impl Tun {
    pub(crate) fn new(fd: Fd) -> Self {
        Self { fd }
    }
    /// Opens a fresh, not yet attached, queue of the clone device.
    pub(crate) fn open() -> io::Result<Self> {
        let fd = unsafe { libc::open(CLONE_DEVICE.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        Ok(Self::new(Fd::new(fd)?))
    }
    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.fd.set_nonblocking(nonblocking)
    }
    /// Receives one frame, blocking until one arrives or `event` fires.
    pub(crate) fn recv(&self, buf: &mut [u8], event: &InterruptEvent) -> io::Result<usize> {
        self.fd.read_interruptible(buf, event, None)
    }
    /// Sends one frame, blocking until the queue has room or `event` fires.
    pub(crate) fn send(&self, buf: &[u8], event: &InterruptEvent) -> io::Result<usize> {
        self.fd.write_interruptible(buf, event)
    }
}

impl AsRawFd for Tun {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Tun {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}
