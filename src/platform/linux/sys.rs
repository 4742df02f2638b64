use crate::platform::unix::Fd;
use libc::{c_char, c_int, ifreq};
use nix::{ioctl_read, ioctl_read_bad, ioctl_write_ptr, ioctl_write_ptr_bad};
use std::os::fd::RawFd;
use std::{io, mem, ptr};

ioctl_read_bad!(siocgifmtu, 0x8921, ifreq);
ioctl_write_ptr_bad!(siocsifmtu, 0x8922, ifreq);
ioctl_read_bad!(siocgifindex, 0x8933, ifreq);

ioctl_read!(tungetiff, b'T', 210, c_int);

ioctl_write_ptr!(tunsetiff, b'T', 202, c_int);
ioctl_write_ptr!(tunsetoffload, b'T', 208, c_int);

/// TCP offloads, present since Linux 2.6. Required once `IFF_VNET_HDR` is set.
pub(crate) const TUN_TCP_OFFLOADS: libc::c_uint = libc::TUN_F_CSUM | libc::TUN_F_TSO4 | libc::TUN_F_TSO6;
/// UDP segmentation offload, added in Linux 6.2.
pub(crate) const TUN_UDP_OFFLOADS: libc::c_uint = libc::TUN_F_USO4 | libc::TUN_F_USO6;

/// An `AF_INET` datagram socket for interface ioctls.
pub(crate) fn ctl() -> io::Result<Fd> {
    Fd::new(unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) })
}

/// A zeroed request carrying `name`, which must be shorter than `IFNAMSIZ`.
pub(crate) unsafe fn request(name: &str) -> ifreq {
    let mut req: ifreq = mem::zeroed();
    ptr::copy_nonoverlapping(
        name.as_ptr() as *const c_char,
        req.ifr_name.as_mut_ptr(),
        name.len().min(libc::IFNAMSIZ - 1),
    );
    req
}

/// The interface name a TUN descriptor is attached to.
pub(crate) unsafe fn name(fd: RawFd) -> io::Result<String> {
    let mut req: ifreq = mem::zeroed();
    tungetiff(fd, &mut req as *mut _ as *mut _)?;
    let c_str = std::ffi::CStr::from_ptr(req.ifr_name.as_ptr() as *const c_char);
    Ok(c_str.to_string_lossy().into_owned())
}

/// The `ifr_flags` a TUN descriptor was attached with.
pub(crate) unsafe fn flags(fd: RawFd) -> io::Result<libc::c_short> {
    let mut req: ifreq = mem::zeroed();
    tungetiff(fd, &mut req as *mut _ as *mut _)?;
    Ok(req.ifr_ifru.ifru_flags)
}

pub(crate) unsafe fn set_offload(fd: RawFd, offloads: libc::c_uint) -> io::Result<()> {
    tunsetoffload(fd, offloads as _)?;
    Ok(())
}
