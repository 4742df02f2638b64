use crate::platform::unix::{Fd, InterruptEvent};
use byteorder::{ByteOrder, NativeEndian};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A change in the state of the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Up,
    Down,
    MtuUpdate,
}

const NLMSG_HDR_LEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const NLMSG_DONE: u16 = libc::NLMSG_DONE as u16;
const RTM_NEWLINK: u16 = libc::RTM_NEWLINK as u16;

const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Appends the events a batch of rtnetlink messages implies for the
/// interface with `index`.
///
/// Only `RTM_NEWLINK` messages are considered; `Down` is reported only once
/// the same batch has shown the link running.
pub(crate) fn parse_link_events(msg: &[u8], index: i32, out: &mut Vec<Event>) {
    let mut was_ever_up = false;
    let mut remain = msg;
    while remain.len() >= NLMSG_HDR_LEN {
        let msg_len = NativeEndian::read_u32(&remain[0..4]) as usize;
        let msg_type = NativeEndian::read_u16(&remain[4..6]);
        if msg_len < NLMSG_HDR_LEN || msg_len > remain.len() {
            break;
        }
        match msg_type {
            NLMSG_DONE => break,
            RTM_NEWLINK if msg_len >= NLMSG_HDR_LEN + IFINFOMSG_LEN => {
                let info = &remain[NLMSG_HDR_LEN..];
                let if_index = NativeEndian::read_i32(&info[4..8]);
                let flags = NativeEndian::read_u32(&info[8..12]);
                remain = &remain[msg_len..];
                if if_index != index {
                    continue;
                }
                if flags & libc::IFF_RUNNING as u32 != 0 {
                    out.push(Event::Up);
                    was_ever_up = true;
                } else if was_ever_up {
                    out.push(Event::Down);
                }
                out.push(Event::MtuUpdate);
            }
            _ => remain = &remain[msg_len..],
        }
    }
}

fn netlink_socket() -> io::Result<Fd> {
    let fd = Fd::new(unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    })?;
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = (libc::RTMGRP_LINK | libc::RTMGRP_IPV4_IFADDR | libc::RTMGRP_IPV6_IFADDR) as u32;
    let rs = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rs < 0 {
        return Err(io::Error::last_os_error());
    }
    fd.set_nonblocking(true)?;
    Ok(fd)
}

fn netlink_listener(
    sock: Fd,
    index: i32,
    shutdown: Arc<InterruptEvent>,
    events: Sender<Event>,
    errors: Sender<io::Error>,
) {
    log::debug!("netlink listener started for index {index}");
    let mut msg = vec![0u8; 1 << 16];
    let mut batch = Vec::new();
    loop {
        let n = match sock.read_interruptible(&mut msg, &shutdown, None) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted && shutdown.is_trigger() => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("failed to receive netlink message: {e}");
                let _ = errors.send(e);
                break;
            }
        };
        if shutdown.is_trigger() {
            break;
        }
        batch.clear();
        parse_link_events(&msg[..n], index, &mut batch);
        for event in batch.drain(..) {
            let _ = events.send(event);
        }
    }
    log::debug!("netlink listener stopped");
}

/// Probes the link state with zero-length writes, which also works when the
/// interface was moved to another network namespace.
fn hack_listener(tun: Fd, shutdown: Arc<InterruptEvent>, events: Sender<Event>) {
    log::debug!("link probe started");
    let mut last = None;
    loop {
        let state = match tun.write(&[]) {
            // an up interface accepts the write but rejects the empty packet
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Event::Up,
            // a down one refuses any I/O
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Event::Down,
            _ => break,
        };
        if last != Some(state) {
            let _ = events.send(state);
            last = Some(state);
        }
        match shutdown.wait(PROBE_INTERVAL) {
            Ok(false) => {}
            _ => break,
        }
    }
    log::debug!("link probe stopped");
}

/// Starts the netlink listener and the link probe for the interface behind
/// `tun_fd`. Both exit once `shutdown` fires.
pub(crate) fn spawn_listeners(
    tun_fd: RawFd,
    index: i32,
    shutdown: &Arc<InterruptEvent>,
    events: Sender<Event>,
    errors: Sender<io::Error>,
) -> io::Result<Vec<JoinHandle<()>>> {
    let sock = netlink_socket()?;
    let probe = Fd::new(unsafe { libc::fcntl(tun_fd, libc::F_DUPFD_CLOEXEC, 0) })?;

    let mut handles = Vec::with_capacity(2);
    let netlink_shutdown = shutdown.clone();
    let netlink_events = events.clone();
    handles.push(
        std::thread::Builder::new()
            .name("tun-netlink".into())
            .spawn(move || netlink_listener(sock, index, netlink_shutdown, netlink_events, errors))?,
    );
    let probe_shutdown = shutdown.clone();
    let spawned = std::thread::Builder::new()
        .name("tun-probe".into())
        .spawn(move || hack_listener(probe, probe_shutdown, events));
    match spawned {
        Ok(handle) => handles.push(handle),
        Err(e) => {
            shutdown.trigger()?;
            for handle in handles {
                let _ = handle.join();
            }
            return Err(e);
        }
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn newlink(index: i32, flags: u32) -> Vec<u8> {
        let mut msg = vec![0u8; NLMSG_HDR_LEN + IFINFOMSG_LEN];
        let len = msg.len() as u32;
        NativeEndian::write_u32(&mut msg[0..4], len);
        NativeEndian::write_u16(&mut msg[4..6], RTM_NEWLINK);
        NativeEndian::write_i32(&mut msg[NLMSG_HDR_LEN + 4..NLMSG_HDR_LEN + 8], index);
        NativeEndian::write_u32(&mut msg[NLMSG_HDR_LEN + 8..NLMSG_HDR_LEN + 12], flags);
        msg
    }

    fn done() -> Vec<u8> {
        let mut msg = vec![0u8; NLMSG_HDR_LEN];
        NativeEndian::write_u32(&mut msg[0..4], NLMSG_HDR_LEN as u32);
        NativeEndian::write_u16(&mut msg[4..6], NLMSG_DONE);
        msg
    }

    const RUNNING: u32 = libc::IFF_RUNNING as u32;

    #[test]
    fn up_then_down() {
        let mut msg = newlink(7, RUNNING);
        msg.extend(newlink(7, 0));
        let mut out = Vec::new();
        parse_link_events(&msg, 7, &mut out);
        assert_eq!(
            out,
            [Event::Up, Event::MtuUpdate, Event::Down, Event::MtuUpdate]
        );
    }

    #[test]
    fn down_needs_a_prior_up() {
        let mut out = Vec::new();
        parse_link_events(&newlink(7, 0), 7, &mut out);
        assert_eq!(out, [Event::MtuUpdate]);
    }

    #[test]
    fn other_interfaces_and_done() {
        let mut msg = newlink(3, RUNNING);
        msg.extend(done());
        msg.extend(newlink(7, RUNNING));
        let mut out = Vec::new();
        parse_link_events(&msg, 7, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn truncated_messages_are_ignored() {
        let mut msg = newlink(7, RUNNING);
        // claims more than was received
        NativeEndian::write_u32(&mut msg[0..4], 64);
        let mut out = Vec::new();
        parse_link_events(&msg, 7, &mut out);
        parse_link_events(&msg[..10], 7, &mut out);
        assert!(out.is_empty());
    }
}
