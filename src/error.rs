use std::io;

/// Errors produced by the offload engine and the device read/write path.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("end of checksum offset ({csum_end}) exceeds packet length ({len})")]
    ChecksumOffsetOutOfRange { csum_end: usize, len: usize },
    #[error("length of packet ({len}) < GSO hdr_len ({hdr_len})")]
    HeaderLenExceedsPacket { len: usize, hdr_len: u16 },
    #[error("GSO hdr_len ({hdr_len}) < GSO csum_start ({csum_start})")]
    HeaderLenBeforeCsumStart { hdr_len: u16, csum_start: u16 },
    #[error("end of checksum offset ({csum_end}) exceeds header length ({hdr_len})")]
    ChecksumOffsetOutsideHeader { csum_end: usize, hdr_len: u16 },
    #[error("packet is too short: {len} bytes, need at least {need}")]
    PacketTooShort { len: usize, need: usize },
    #[error("{header} header is too short: {len} bytes, need at least {need}")]
    HeaderTooShort {
        header: &'static str,
        len: usize,
        need: usize,
    },
    #[error("GSO size is zero for a segmented packet")]
    ZeroGsoSize,
    #[error("ip header version: {version}, GSO type: {gso_type}")]
    IpVersionMismatch {
        version: u8,
        gso_type: crate::GsoType,
    },
    #[error("invalid ip header version: {0}")]
    InvalidIpVersion(u8),
    #[error("tcp header len is invalid: {0}")]
    InvalidTcpHeaderLen(u16),
    #[error("unsupported virtio GSO type: {0}")]
    UnsupportedGsoType(u8),
    #[error("length of packet ({len}) exceeds output element length ({capacity})")]
    OutputTooSmall { len: usize, capacity: usize },
    #[error("invalid buffers: {0}")]
    InvalidBuffers(&'static str),
    #[error("invalid offset {0}")]
    InvalidOffset(usize),
    #[error("invalid device name: {0}")]
    InvalidName(String),
    /// The output buffers ran out before the input was consumed. `written`
    /// segments at the front of the output are complete and valid.
    #[error("too many segments, {written} written")]
    TooManySegments { written: usize },
    #[error("device closed")]
    Closed,
    /// Some frames of a batched write failed; the rest were delivered.
    #[error("{} of the frames failed to write, {written} packets written", errors.len())]
    Write {
        written: usize,
        errors: Vec<io::Error>,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps a raw descriptor error, folding the "descriptor went away" cases
    /// into [`Error::Closed`].
    pub(crate) fn from_fd_error(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EBADFD) => Error::Closed,
            _ => Error::Io(err),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::Closed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            Error::TooManySegments { .. } | Error::Write { .. } => io::Error::other(err),
            Error::InvalidBuffers(_) | Error::InvalidOffset(_) | Error::InvalidName(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            _ => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
