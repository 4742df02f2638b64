use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

/// An owned POSIX file descriptor, closed on drop.
pub(crate) struct Fd {
    pub(crate) inner: RawFd,
}

impl Fd {
    pub(crate) fn new(value: RawFd) -> io::Result<Self> {
        if value < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { Self::new_unchecked(value) })
    }
    /// # Safety
    /// `value` must be an open descriptor that nothing else closes.
    pub(crate) unsafe fn new_unchecked(value: RawFd) -> Self {
        Fd { inner: value }
    }
    /// Enable non-blocking mode
    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut nonblocking = nonblocking as libc::c_int;
        match unsafe { libc::ioctl(self.as_raw_fd(), libc::FIONBIO, &mut nonblocking) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    #[inline]
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.as_raw_fd();
        let amount = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if amount < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(amount as usize)
    }

    #[inline]
    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.as_raw_fd();
        let amount = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
        if amount < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(amount as usize)
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(mut self) -> RawFd {
        let fd = self.inner;
        self.inner = -1;
        fd
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.inner >= 0 {
            unsafe { libc::close(self.inner) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_descriptor_is_an_error() {
        assert!(Fd::new(-1).is_err());
    }

    #[test]
    fn into_raw_fd_releases_ownership() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let read = Fd::new(fds[0]).unwrap();
        let write = Fd::new(fds[1]).unwrap();
        let raw = write.into_raw_fd();
        // still open after the wrapper is gone
        assert_eq!(unsafe { libc::write(raw, b"x".as_ptr() as *const _, 1) }, 1);
        let mut buf = [0u8; 1];
        assert_eq!(read.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf, b"x");
        unsafe { libc::close(raw) };
    }
}
