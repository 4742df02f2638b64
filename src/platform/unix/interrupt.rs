use crate::platform::unix::Fd;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Mutex;
use std::time::Duration;

impl Fd {
    /// Reads once the descriptor is readable. Fails with
    /// `ErrorKind::Interrupted` when `event` fires first.
    pub(crate) fn read_interruptible(
        &self,
        buf: &mut [u8],
        event: &InterruptEvent,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        loop {
            self.wait_readable_interruptible(event, timeout)?;
            return match self.read(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    continue;
                }
                rs => rs,
            };
        }
    }
    pub(crate) fn write_interruptible(
        &self,
        buf: &[u8],
        event: &InterruptEvent,
    ) -> io::Result<usize> {
        loop {
            self.wait_writable_interruptible(event)?;
            return match self.write(buf) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    continue;
                }
                rs => rs,
            };
        }
    }
    pub(crate) fn wait_readable_interruptible(
        &self,
        interrupted_event: &InterruptEvent,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        self.wait_interruptible(libc::POLLIN, interrupted_event, timeout)
    }
    pub(crate) fn wait_writable_interruptible(
        &self,
        interrupted_event: &InterruptEvent,
    ) -> io::Result<()> {
        self.wait_interruptible(libc::POLLOUT, interrupted_event, None)
    }
    fn wait_interruptible(
        &self,
        events: libc::c_short,
        interrupted_event: &InterruptEvent,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let mut fds = [
            libc::pollfd {
                fd: self.as_raw_fd(),
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: interrupted_event.as_event_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let result = poll(&mut fds, timeout)?;
        if result == 0 {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        // the interrupt wins over readiness, so close is observed promptly
        if fds[1].revents & libc::POLLIN != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "trigger interrupt",
            ));
        }
        if fds[0].revents & events != 0 {
            return Ok(());
        }
        if fds[0].revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADFD));
        }
        Err(io::Error::other("fd error"))
    }
}

fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<libc::c_int> {
    loop {
        let result = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout
                    .map(|t| t.as_millis().min(i32::MAX as _) as _)
                    .unwrap_or(-1),
            )
        };
        if result == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(result);
    }
}

/// A pipe-backed, one-shot wake-up signal.
///
/// Once triggered it stays readable, so every current and future waiter
/// observes it.
pub(crate) struct InterruptEvent {
    state: Mutex<bool>,
    read_fd: Fd,
    write_fd: Fd,
}

impl InterruptEvent {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [0; 2];

        unsafe {
            if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) == -1 {
                return Err(io::Error::last_os_error());
            }
            let read_fd = Fd::new_unchecked(fds[0]);
            let write_fd = Fd::new_unchecked(fds[1]);
            write_fd.set_nonblocking(true)?;
            read_fd.set_nonblocking(true)?;
            Ok(Self {
                state: Mutex::new(false),
                read_fd,
                write_fd,
            })
        }
    }
    pub(crate) fn trigger(&self) -> io::Result<()> {
        let mut guard = self.state.lock().unwrap();
        if *guard {
            return Ok(());
        }
        *guard = true;
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match self.write_fd.write(&buf) {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(()),
        }
    }
    pub(crate) fn is_trigger(&self) -> bool {
        *self.state.lock().unwrap()
    }
    /// Sleeps for up to `timeout`. Returns `true` if the event fired.
    pub(crate) fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [libc::pollfd {
            fd: self.as_event_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        poll(&mut fds, Some(timeout))?;
        Ok(self.is_trigger())
    }
    fn as_event_fd(&self) -> libc::c_int {
        self.read_fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn pipe() -> (Fd, Fd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (Fd::new(fds[0]).unwrap(), Fd::new(fds[1]).unwrap())
    }

    #[test]
    fn wait_times_out_without_trigger() {
        let event = InterruptEvent::new().unwrap();
        let start = Instant::now();
        assert!(!event.wait(Duration::from_millis(20)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn trigger_wakes_blocked_reader() {
        let (read, _write) = pipe();
        read.set_nonblocking(true).unwrap();
        let event = Arc::new(InterruptEvent::new().unwrap());
        let trigger = event.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.trigger().unwrap();
        });
        let mut buf = [0u8; 16];
        let err = read.read_interruptible(&mut buf, &event, None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        handle.join().unwrap();

        // stays triggered
        assert!(event.is_trigger());
        assert!(event.wait(Duration::from_secs(5)).unwrap());
        event.trigger().unwrap();
    }

    #[test]
    fn readable_data_is_returned() {
        let (read, write) = pipe();
        read.set_nonblocking(true).unwrap();
        let event = InterruptEvent::new().unwrap();
        write.write(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = read
            .read_interruptible(&mut buf, &event, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(&buf[..n], b"ping");

        let err = read
            .read_interruptible(&mut buf, &event, Some(Duration::from_millis(10)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
