pub(crate) mod unix;

pub(crate) mod linux;
pub use self::linux::*;

use crate::error::Result;
use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

/// A transparent wrapper around DeviceImpl, providing synchronous batched I/O.
///
/// Reads and writes block the calling thread. They may be issued from
/// different threads at the same time; [`SyncDevice::close`] wakes both.
#[repr(transparent)]
pub struct SyncDevice(pub(crate) DeviceImpl);

impl SyncDevice {
    /// Creates an unmonitored SyncDevice from a raw TUN file descriptor and
    /// negotiates offloads on it.
    ///
    /// The descriptor is switched to non-blocking mode. No link listeners are
    /// started, so [`SyncDevice::events`] only reports the channel closing.
    ///
    /// # Safety
    /// - The file descriptor (`fd`) must be an owned file descriptor.
    /// - It must be valid, open, and attached to a TUN interface.
    pub unsafe fn from_fd(fd: RawFd) -> Result<Self> {
        Ok(SyncDevice(DeviceImpl::from_fd(fd, detect())?))
    }
    /// [`SyncDevice::from_fd`] with a specific checksum engine.
    ///
    /// # Safety
    /// Same requirements as [`SyncDevice::from_fd`].
    pub unsafe fn from_fd_with_engine(
        fd: RawFd,
        engine: &'static dyn ChecksumEngine,
    ) -> Result<Self> {
        Ok(SyncDevice(DeviceImpl::from_fd(fd, engine)?))
    }
}

impl Deref for SyncDevice {
    type Target = DeviceImpl;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRawFd for SyncDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for SyncDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.as_raw_fd()) }
    }
}

#[cfg(test)]
mod test {
    use crate::{DeviceBuilder, Error};

    #[test]
    #[ignore = "requires CAP_NET_ADMIN"]
    fn create() {
        let dev = DeviceBuilder::new()
            .name("tunoff6")
            .mtu(1400)
            .build_sync()
            .unwrap();

        assert_eq!(1400, dev.mtu().unwrap());
        assert_eq!("tunoff6", dev.name().unwrap());
        assert!(dev.if_index().unwrap() > 0);
        dev.set_mtu(1280).unwrap();
        assert_eq!(1280, dev.mtu().unwrap());

        dev.close().unwrap();
        dev.close().unwrap();
        let mut bufs = [vec![0u8; 1500]];
        let mut sizes = [0usize; 1];
        assert!(matches!(dev.read(&mut bufs, &mut sizes, 10), Err(Error::Closed)));
    }
}
