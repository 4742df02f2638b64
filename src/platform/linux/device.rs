use crate::builder::DeviceConfig;
use crate::error::{Error, Result};
use crate::platform::linux::checksum::{self, ChecksumEngine};
use crate::platform::linux::event::{spawn_listeners, Event};
use crate::platform::linux::gro::{handle_gro_with, ExpandBuffer, GROTable, GroFlags};
use crate::platform::linux::offload::{handle_virtio_read, IDEAL_BATCH_SIZE, VIRTIO_NET_HDR_LEN};
use crate::platform::linux::sys::{self, *};
use crate::platform::unix::{Fd, InterruptEvent, Tun};
use libc::{c_short, IFF_MULTI_QUEUE, IFF_NO_PI, IFF_TUN, IFF_VNET_HDR};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

/// Read-path state, owned by the read lock.
struct ReadState {
    /// Stages one virtio-header-prefixed frame before it is split.
    buf: Vec<u8>,
    /// Failures of the netlink listener, handed to the next reader.
    errors: Receiver<io::Error>,
}

/// Write-path state, owned by the write lock.
struct WriteState {
    table: GROTable,
    gro: GroFlags,
}

/// A TUN device using the TUN/TAP Linux driver, with virtio-net offloads
/// when the kernel grants them.
///
/// `read` and `write` are each single-flight: concurrent reads serialize,
/// concurrent writes serialize, but a read never blocks a write.
pub struct DeviceImpl {
    pub(crate) tun: Tun,
    /// Fixed at creation.
    vnet_hdr: bool,
    batch_size: usize,
    engine: &'static dyn ChecksumEngine,
    name: OnceLock<String>,
    read_state: Mutex<ReadState>,
    write_state: Mutex<WriteState>,
    events: Mutex<Option<Receiver<Event>>>,
    /// Dropped on close so the event channel disconnects.
    event_tx: Mutex<Option<Sender<Event>>>,
    error_tx: Sender<io::Error>,
    shutdown: Arc<InterruptEvent>,
    closed: AtomicBool,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceImpl {
    /// Create a new TUN interface for the given configuration.
    pub(crate) fn new(config: DeviceConfig) -> Result<Self> {
        let tun = Tun::open()?;
        unsafe {
            let mut req = sys::request(config.name.as_deref().unwrap_or(""));
            let flags = IFF_TUN
                | IFF_NO_PI
                | if config.offload { IFF_VNET_HDR } else { 0 }
                | if config.multi_queue { IFF_MULTI_QUEUE } else { 0 };
            req.ifr_ifru.ifru_flags = flags as c_short;
            tunsetiff(tun.as_raw_fd(), &req as *const libc::ifreq as *const _)
                .map_err(io::Error::from)?;
        }

        let engine = config.engine.unwrap_or_else(checksum::detect);
        let device = Self::from_tun(tun, engine)?;
        if let Some(mtu) = config.mtu {
            device.set_mtu(mtu)?;
        }
        if config.monitor {
            device.start_listeners()?;
        }
        Ok(device)
    }

    /// # Safety
    /// The fd passed in must be an owned TUN file descriptor; in particular,
    /// it must be open and attached to an interface.
    pub(crate) unsafe fn from_fd(fd: RawFd, engine: &'static dyn ChecksumEngine) -> Result<Self> {
        Self::from_tun(Tun::new(Fd::new_unchecked(fd)), engine)
    }

    fn from_tun(tun: Tun, engine: &'static dyn ChecksumEngine) -> Result<Self> {
        tun.set_nonblocking(true)?;
        let (vnet_hdr, batch_size, gro) = negotiate_offloads(tun.as_raw_fd())?;
        let (event_tx, event_rx) = mpsc::channel();
        let (error_tx, error_rx) = mpsc::channel();
        let buf_len = if vnet_hdr {
            VIRTIO_NET_HDR_LEN + u16::MAX as usize
        } else {
            0
        };
        Ok(DeviceImpl {
            tun,
            vnet_hdr,
            batch_size,
            engine,
            name: OnceLock::new(),
            read_state: Mutex::new(ReadState {
                buf: vec![0; buf_len],
                errors: error_rx,
            }),
            write_state: Mutex::new(WriteState {
                table: GROTable::new(),
                gro,
            }),
            events: Mutex::new(Some(event_rx)),
            event_tx: Mutex::new(Some(event_tx)),
            error_tx,
            shutdown: Arc::new(InterruptEvent::new()?),
            closed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        })
    }

    fn start_listeners(&self) -> Result<()> {
        let index = self.if_index()? as i32;
        let Some(events) = self.event_tx.lock().unwrap().clone() else {
            return Err(Error::Closed);
        };
        let handles = spawn_listeners(
            self.tun.as_raw_fd(),
            index,
            &self.shutdown,
            events,
            self.error_tx.clone(),
        )?;
        self.listeners.lock().unwrap().extend(handles);
        Ok(())
    }

    /// Reads one frame from the kernel and expands it into `bufs`, leaving
    /// `offset` bytes free at the front of each. `sizes[i]` receives the
    /// length of the packet in `bufs[i]`.
    ///
    /// Returns the number of packets produced. Without virtio headers that is
    /// always one.
    pub fn read<B: AsRef<[u8]> + AsMut<[u8]>>(
        &self,
        bufs: &mut [B],
        sizes: &mut [usize],
        offset: usize,
    ) -> Result<usize> {
        if bufs.is_empty() || sizes.len() < bufs.len() {
            return Err(Error::InvalidBuffers("bufs is empty or sizes is shorter than bufs"));
        }
        let mut state = self.read_state.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if let Ok(err) = state.errors.try_recv() {
            return Err(Error::Io(err));
        }
        if self.vnet_hdr {
            let n = self
                .tun
                .recv(&mut state.buf, &self.shutdown)
                .map_err(|e| self.io_error(e))?;
            handle_virtio_read(self.engine, &mut state.buf[..n], bufs, sizes, offset)
        } else {
            if offset > bufs[0].as_ref().len() {
                return Err(Error::InvalidOffset(offset));
            }
            let n = self
                .tun
                .recv(&mut bufs[0].as_mut()[offset..], &self.shutdown)
                .map_err(|e| self.io_error(e))?;
            sizes[0] = n;
            Ok(1)
        }
    }

    /// Writes the packets in `bufs[i][offset..]` to the kernel, coalescing
    /// runs of the same TCP or UDP flow first when virtio headers are in use.
    ///
    /// With virtio headers `offset` must be at least [`VIRTIO_NET_HDR_LEN`];
    /// the header is written into the bytes just before the packet. Returns
    /// the number of packets of `bufs` that reached the kernel, counting those
    /// coalesced into a larger frame. Frames that fail are collected into
    /// [`Error::Write`] after every frame has been attempted.
    pub fn write<B: ExpandBuffer>(&self, bufs: &mut [B], offset: usize) -> Result<usize> {
        let mut guard = self.write_state.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let state = &mut *guard;
        state.table.reset();
        let rs = self.write_batch(state, bufs, offset);
        state.table.reset();
        rs
    }

    fn write_batch<B: ExpandBuffer>(
        &self,
        state: &mut WriteState,
        bufs: &mut [B],
        mut offset: usize,
    ) -> Result<usize> {
        if self.vnet_hdr {
            handle_gro_with(self.engine, bufs, offset, &mut state.table, state.gro)?;
            offset -= VIRTIO_NET_HDR_LEN;
        } else {
            for (i, buf) in bufs.iter().enumerate() {
                if offset > buf.as_ref().len() {
                    return Err(Error::InvalidOffset(offset));
                }
                state.table.to_write.push(i);
            }
        }

        let mut written = 0;
        let mut errors = Vec::new();
        for &i in state.table.to_write() {
            match self.tun.send(&bufs[i].as_ref()[offset..], &self.shutdown) {
                Ok(_) => written += state.table.packets_in(i),
                Err(e) => match self.io_error(e) {
                    Error::Closed => return Err(Error::Closed),
                    Error::Io(e) => {
                        log::debug!("failed to write frame {i}: {e}");
                        errors.push(e);
                    }
                    other => return Err(other),
                },
            }
        }
        if errors.is_empty() {
            Ok(written)
        } else {
            Err(Error::Write { written, errors })
        }
    }

    fn io_error(&self, err: io::Error) -> Error {
        if err.kind() == io::ErrorKind::Interrupted && self.shutdown.is_trigger() {
            return Error::Closed;
        }
        Error::from_fd_error(err)
    }

    /// The interface name, cached after the first successful lookup.
    pub fn name(&self) -> Result<String> {
        if let Some(name) = self.name.get() {
            return Ok(name.clone());
        }
        let name = unsafe { sys::name(self.tun.as_raw_fd())? };
        Ok(self.name.get_or_init(|| name).clone())
    }

    pub fn mtu(&self) -> Result<u16> {
        unsafe {
            let mut req = sys::request(&self.name()?);
            siocgifmtu(ctl()?.as_raw_fd(), &mut req).map_err(io::Error::from)?;
            req.ifr_ifru
                .ifru_mtu
                .try_into()
                .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}"))))
        }
    }

    pub fn set_mtu(&self, value: u16) -> Result<()> {
        unsafe {
            let mut req = sys::request(&self.name()?);
            req.ifr_ifru.ifru_mtu = value as i32;
            siocsifmtu(ctl()?.as_raw_fd(), &req).map_err(io::Error::from)?;
        }
        Ok(())
    }

    pub fn if_index(&self) -> Result<u32> {
        unsafe {
            let mut req = sys::request(&self.name()?);
            siocgifindex(ctl()?.as_raw_fd(), &mut req).map_err(io::Error::from)?;
            Ok(req.ifr_ifru.ifru_ifindex as u32)
        }
    }

    /// Takes the receiving end of the event channel. Only the first call gets
    /// it; the channel disconnects once the device is closed.
    pub fn events(&self) -> Option<Receiver<Event>> {
        self.events.lock().unwrap().take()
    }

    /// The largest number of packets a single `read` produces or `write`
    /// should be given.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether frames carry a virtio-net header.
    pub fn vnet_hdr(&self) -> bool {
        self.vnet_hdr
    }

    /// Whether UDP frames are coalesced on write.
    pub fn udp_gro(&self) -> bool {
        self.vnet_hdr && self.write_state.lock().unwrap().gro.can_udp_gro()
    }

    /// Whether TCP frames are coalesced on write.
    pub fn tcp_gro(&self) -> bool {
        self.vnet_hdr && self.write_state.lock().unwrap().gro.can_tcp_gro()
    }

    pub fn disable_tcp_gro(&self) {
        self.write_state.lock().unwrap().gro |= GroFlags::TCP_DISABLED;
    }

    pub fn disable_udp_gro(&self) {
        self.write_state.lock().unwrap().gro |= GroFlags::UDP_DISABLED;
    }

    pub fn checksum_engine(&self) -> &'static dyn ChecksumEngine {
        self.engine
    }

    /// Stops the event listeners and wakes blocked readers and writers, which
    /// return [`Error::Closed`]. Only the first call has an effect.
    ///
    /// The descriptor itself is released when the device is dropped.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let rs = self.shutdown.trigger();
        for handle in self.listeners.lock().unwrap().drain(..) {
            if handle.join().is_err() {
                log::warn!("event listener panicked");
            }
        }
        self.event_tx.lock().unwrap().take();
        rs?;
        Ok(())
    }
}

/// Reads back the flags the descriptor was attached with and enables the
/// matching offloads.
///
/// Returns whether frames carry a virtio header, the batch size, and the GRO
/// kinds that must stay off.
fn negotiate_offloads(fd: RawFd) -> Result<(bool, usize, GroFlags)> {
    let flags = unsafe { sys::flags(fd)? };
    if flags & IFF_VNET_HDR as c_short == 0 {
        return Ok((false, 1, GroFlags::empty()));
    }
    unsafe { sys::set_offload(fd, TUN_TCP_OFFLOADS)? };
    log::debug!("tcp offload enabled");

    let mut gro = GroFlags::empty();
    if let Err(e) = unsafe { sys::set_offload(fd, TUN_TCP_OFFLOADS | TUN_UDP_OFFLOADS) } {
        log::debug!("udp offload unsupported, udp gro disabled: {e}");
        gro |= GroFlags::UDP_DISABLED;
    }
    Ok((true, IDEAL_BATCH_SIZE, gro))
}

impl Drop for DeviceImpl {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to close device: {e}");
        }
    }
}

impl AsRawFd for DeviceImpl {
    fn as_raw_fd(&self) -> RawFd {
        self.tun.as_raw_fd()
    }
}

impl AsFd for DeviceImpl {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.as_raw_fd()) }
    }
}
