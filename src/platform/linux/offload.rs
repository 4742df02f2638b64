/*!
# Segmentation offload

When a TUN device is opened with `IFF_VNET_HDR`, every frame exchanged with the
kernel is prefixed by a [`VirtioNetHdr`]. On the read side the kernel may hand
over one TCP or UDP "superpacket" of up to 64KiB together with the metadata
needed to cut it into wire-sized segments; [`gso_split`] performs that cut,
rewriting the per-segment IP and transport headers and checksums.

The inverse direction, coalescing small packets before they are written to the
kernel, lives in the GRO module ([`handle_gro`](crate::handle_gro)).

## References

- [Linux virtio_net.h](https://github.com/torvalds/linux/blob/master/include/uapi/linux/virtio_net.h)
*/

use crate::error::{Error, Result};
use crate::platform::linux::checksum::{self, pseudo_header_checksum, ChecksumEngine};
use byteorder::{BigEndian, ByteOrder, NativeEndian};
use std::fmt;

/// GSO type: Not a GSO frame (normal packet).
pub const VIRTIO_NET_HDR_GSO_NONE: u8 = 0;

/// Flag: Use csum_start and csum_offset fields for checksum calculation.
///
/// The value at `csum_start + csum_offset` is a partial checksum, the
/// pseudo-header sum, that still has to be folded with the transport header
/// and payload.
pub const VIRTIO_NET_HDR_F_NEEDS_CSUM: u8 = 1;

/// GSO type: IPv4 TCP segmentation (TSO).
pub const VIRTIO_NET_HDR_GSO_TCPV4: u8 = 1;

/// GSO type: IPv6 TCP segmentation (TSO).
pub const VIRTIO_NET_HDR_GSO_TCPV6: u8 = 4;

/// GSO type: UDP segmentation for IPv4 and IPv6 (USO).
pub const VIRTIO_NET_HDR_GSO_UDP_L4: u8 = 5;

/// Recommended number of packets per batched read or write.
///
/// A vnet-header device reports this as its [batch size](crate::SyncDevice::batch_size);
/// plain devices report 1.
pub const IDEAL_BATCH_SIZE: usize = 128;

pub(crate) const TCP_FLAGS_OFFSET: usize = 13;

pub(crate) const TCP_FLAG_FIN: u8 = 0x01;
pub(crate) const TCP_FLAG_PSH: u8 = 0x08;
pub(crate) const TCP_FLAG_ACK: u8 = 0x10;

pub(crate) const IPV4_SRC_ADDR_OFFSET: usize = 12;
pub(crate) const IPV6_SRC_ADDR_OFFSET: usize = 8;

pub(crate) const IPPROTO_TCP: u8 = 6;
pub(crate) const IPPROTO_UDP: u8 = 17;

pub(crate) const IPV4_MIN_HEADER_LEN: usize = 20;
pub(crate) const IPV6_HEADER_LEN: usize = 40;
pub(crate) const TCP_MIN_HEADER_LEN: usize = 20;
pub(crate) const TCP_MAX_HEADER_LEN: usize = 60;
pub(crate) const UDP_H_LEN: usize = 8;

/// The kind of segmentation a packet asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GsoType {
    /// A single packet, possibly still needing its transport checksum.
    #[default]
    None,
    TcpV4,
    TcpV6,
    /// UDP over either IP version.
    UdpL4,
}

impl GsoType {
    /// The `gso_type` discriminant used in [`VirtioNetHdr`].
    pub fn to_virtio(self) -> u8 {
        match self {
            GsoType::None => VIRTIO_NET_HDR_GSO_NONE,
            GsoType::TcpV4 => VIRTIO_NET_HDR_GSO_TCPV4,
            GsoType::TcpV6 => VIRTIO_NET_HDR_GSO_TCPV6,
            GsoType::UdpL4 => VIRTIO_NET_HDR_GSO_UDP_L4,
        }
    }

    fn is_tcp(self) -> bool {
        matches!(self, GsoType::TcpV4 | GsoType::TcpV6)
    }
}

impl TryFrom<u8> for GsoType {
    type Error = Error;

    /// Any value other than the four known discriminants, including ones
    /// carrying the ECN bit, is rejected.
    fn try_from(value: u8) -> Result<Self> {
        match value {
            VIRTIO_NET_HDR_GSO_NONE => Ok(GsoType::None),
            VIRTIO_NET_HDR_GSO_TCPV4 => Ok(GsoType::TcpV4),
            VIRTIO_NET_HDR_GSO_TCPV6 => Ok(GsoType::TcpV6),
            VIRTIO_NET_HDR_GSO_UDP_L4 => Ok(GsoType::UdpL4),
            other => Err(Error::UnsupportedGsoType(other)),
        }
    }
}

impl fmt::Display for GsoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GsoType::None => "none",
            GsoType::TcpV4 => "tcpv4",
            GsoType::TcpV6 => "tcpv6",
            GsoType::UdpL4 => "udp_l4",
        };
        f.write_str(name)
    }
}

/// Segmentation metadata for one packet, independent of its wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GsoOptions {
    pub gso_type: GsoType,
    /// Sum of the L3 and L4 header lengths of every produced segment. May be
    /// zero when `gso_type` is [`GsoType::None`].
    pub hdr_len: u16,
    /// Start of the transport header, i.e. the IP header length.
    pub csum_start: u16,
    /// Offset from `csum_start` of the 2-byte transport checksum.
    pub csum_offset: u16,
    /// Payload bytes per segment, excluding `hdr_len`. The tail segment may be
    /// shorter.
    pub gso_size: u16,
    /// Only meaningful with [`GsoType::None`]: the checksum field holds the
    /// pseudo-header sum and must be finalized.
    pub needs_csum: bool,
}

/// The `virtio_net_hdr` prefix of every frame on a vnet-header TUN device.
///
/// All multi-byte fields are in host byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioNetHdr {
    // #define VIRTIO_NET_HDR_F_NEEDS_CSUM	1	/* Use csum_start, csum_offset */
    // #define VIRTIO_NET_HDR_F_DATA_VALID	2	/* Csum is valid */
    pub flags: u8,
    pub gso_type: u8,
    // Ethernet + IP + tcp/udp hdrs
    pub hdr_len: u16,
    // Bytes to append to hdr_len per frame
    pub gso_size: u16,
    pub csum_start: u16,
    pub csum_offset: u16,
}

/// Size of the virtio network header in bytes.
pub const VIRTIO_NET_HDR_LEN: usize = std::mem::size_of::<VirtioNetHdr>();

impl VirtioNetHdr {
    /// Reads a header from the first [`VIRTIO_NET_HDR_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<VirtioNetHdr> {
        if buf.len() < VIRTIO_NET_HDR_LEN {
            return Err(Error::PacketTooShort {
                len: buf.len(),
                need: VIRTIO_NET_HDR_LEN,
            });
        }
        Ok(VirtioNetHdr {
            flags: buf[0],
            gso_type: buf[1],
            hdr_len: NativeEndian::read_u16(&buf[2..4]),
            gso_size: NativeEndian::read_u16(&buf[4..6]),
            csum_start: NativeEndian::read_u16(&buf[6..8]),
            csum_offset: NativeEndian::read_u16(&buf[8..10]),
        })
    }

    /// Writes this header into the first [`VIRTIO_NET_HDR_LEN`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < VIRTIO_NET_HDR_LEN {
            return Err(Error::PacketTooShort {
                len: buf.len(),
                need: VIRTIO_NET_HDR_LEN,
            });
        }
        buf[0] = self.flags;
        buf[1] = self.gso_type;
        NativeEndian::write_u16(&mut buf[2..4], self.hdr_len);
        NativeEndian::write_u16(&mut buf[4..6], self.gso_size);
        NativeEndian::write_u16(&mut buf[6..8], self.csum_start);
        NativeEndian::write_u16(&mut buf[8..10], self.csum_offset);
        Ok(())
    }

    pub fn to_gso_options(&self) -> Result<GsoOptions> {
        Ok(GsoOptions {
            gso_type: GsoType::try_from(self.gso_type)?,
            hdr_len: self.hdr_len,
            csum_start: self.csum_start,
            csum_offset: self.csum_offset,
            gso_size: self.gso_size,
            needs_csum: self.flags & VIRTIO_NET_HDR_F_NEEDS_CSUM != 0,
        })
    }
}

impl From<GsoOptions> for VirtioNetHdr {
    fn from(options: GsoOptions) -> Self {
        VirtioNetHdr {
            flags: if options.needs_csum {
                VIRTIO_NET_HDR_F_NEEDS_CSUM
            } else {
                0
            },
            gso_type: options.gso_type.to_virtio(),
            hdr_len: options.hdr_len,
            gso_size: options.gso_size,
            csum_start: options.csum_start,
            csum_offset: options.csum_offset,
        }
    }
}

/// Splits `input` into `out_bufs[i][out_offset..]`, recording each segment's
/// length in `sizes[i]`, and returns the number of segments produced.
///
/// [`GsoType::None`], or a payload shorter than one `gso_size`, yields a single
/// copy of `input` whose transport checksum is finalized first when
/// `needs_csum` is set. This mutates `input` in place.
///
/// Otherwise each segment gets a copy of the IP and transport headers with
/// the IPv4 total length, ID and header checksum (or the IPv6 payload length),
/// the TCP sequence number and FIN/PSH flags (or the UDP length), and the
/// transport checksum rewritten.
///
/// # Errors
/// Malformed options and output buffers too small for their segment are
/// rejected before anything is written. When the input
/// needs more segments than `out_bufs` holds, [`Error::TooManySegments`]
/// reports how many leading segments were completely written; that count is
/// always `out_bufs.len() - 1`.
pub fn gso_split<B: AsRef<[u8]> + AsMut<[u8]>>(
    input: &mut [u8],
    options: GsoOptions,
    out_bufs: &mut [B],
    sizes: &mut [usize],
    out_offset: usize,
) -> Result<usize> {
    gso_split_with(
        checksum::detect(),
        input,
        options,
        out_bufs,
        sizes,
        out_offset,
    )
}

/// [`gso_split`] with an explicit checksum engine.
pub fn gso_split_with<B: AsRef<[u8]> + AsMut<[u8]>>(
    engine: &dyn ChecksumEngine,
    input: &mut [u8],
    options: GsoOptions,
    out_bufs: &mut [B],
    sizes: &mut [usize],
    out_offset: usize,
) -> Result<usize> {
    if out_bufs.is_empty() {
        return Err(Error::InvalidBuffers("no output buffers"));
    }
    if sizes.len() < out_bufs.len() {
        return Err(Error::InvalidBuffers("sizes is shorter than bufs"));
    }
    let len = input.len();
    let csum_start = options.csum_start as usize;
    let hdr_len = options.hdr_len as usize;
    let csum_at = csum_start + options.csum_offset as usize;
    if csum_at + 1 >= len {
        return Err(Error::ChecksumOffsetOutOfRange {
            csum_end: csum_at + 1,
            len,
        });
    }
    if len < hdr_len {
        return Err(Error::HeaderLenExceedsPacket {
            len,
            hdr_len: options.hdr_len,
        });
    }

    let payload_len = len - hdr_len;
    if options.gso_type == GsoType::None || payload_len < options.gso_size as usize {
        let capacity = out_bufs[0].as_ref().len().saturating_sub(out_offset);
        if len > capacity {
            return Err(Error::OutputTooSmall { len, capacity });
        }
        if options.needs_csum {
            // The value already in the field is the pseudo-header sum.
            let initial = BigEndian::read_u16(&input[csum_at..]);
            input[csum_at] = 0;
            input[csum_at + 1] = 0;
            let csum = !engine.checksum(&input[csum_start..], initial);
            BigEndian::write_u16(&mut input[csum_at..], csum);
        }
        out_bufs[0].as_mut()[out_offset..out_offset + len].copy_from_slice(input);
        sizes[0] = len;
        return Ok(1);
    }

    if options.gso_size == 0 {
        return Err(Error::ZeroGsoSize);
    }
    if options.hdr_len < options.csum_start {
        return Err(Error::HeaderLenBeforeCsumStart {
            hdr_len: options.hdr_len,
            csum_start: options.csum_start,
        });
    }
    if csum_at + 2 > hdr_len {
        return Err(Error::ChecksumOffsetOutsideHeader {
            csum_end: csum_at + 1,
            hdr_len: options.hdr_len,
        });
    }

    let ip_version = input[0] >> 4;
    let (src_addr_offset, addr_len, min_iph_len) = match ip_version {
        4 => {
            if options.gso_type != GsoType::TcpV4 && options.gso_type != GsoType::UdpL4 {
                return Err(Error::IpVersionMismatch {
                    version: ip_version,
                    gso_type: options.gso_type,
                });
            }
            (IPV4_SRC_ADDR_OFFSET, 4, IPV4_MIN_HEADER_LEN)
        }
        6 => {
            if options.gso_type != GsoType::TcpV6 && options.gso_type != GsoType::UdpL4 {
                return Err(Error::IpVersionMismatch {
                    version: ip_version,
                    gso_type: options.gso_type,
                });
            }
            (IPV6_SRC_ADDR_OFFSET, 16, IPV6_HEADER_LEN)
        }
        version => return Err(Error::InvalidIpVersion(version)),
    };
    if len < min_iph_len {
        return Err(Error::PacketTooShort {
            len,
            need: min_iph_len,
        });
    }
    if csum_start < min_iph_len {
        return Err(Error::HeaderTooShort {
            header: "ip",
            len: csum_start,
            need: min_iph_len,
        });
    }

    let is_tcp = options.gso_type.is_tcp();
    let (protocol, min_transport_len) = if is_tcp {
        (IPPROTO_TCP, TCP_MIN_HEADER_LEN)
    } else {
        (IPPROTO_UDP, UDP_H_LEN)
    };
    if len < csum_start + min_transport_len {
        return Err(Error::PacketTooShort {
            len,
            need: csum_start + min_transport_len,
        });
    }
    let transport_header_len = hdr_len - csum_start;
    if transport_header_len < min_transport_len {
        return Err(Error::HeaderTooShort {
            header: if is_tcp { "tcp" } else { "udp" },
            len: transport_header_len,
            need: min_transport_len,
        });
    }
    let first_tcp_seq = if is_tcp {
        BigEndian::read_u32(&input[csum_start + 4..])
    } else {
        0
    };

    let input = &*input;
    let src_addr = &input[src_addr_offset..src_addr_offset + addr_len];
    let dst_addr = &input[src_addr_offset + addr_len..src_addr_offset + 2 * addr_len];
    let gso_size = options.gso_size as usize;
    // every segment but the last has the same length
    let full_segment_psum = pseudo_header_checksum(
        protocol,
        src_addr,
        dst_addr,
        (transport_header_len + gso_size) as u16,
    );

    // Every slot that will be filled must hold its segment before any is.
    let segments = payload_len.div_ceil(gso_size);
    for slot in 0..segments.min(out_bufs.len()) {
        if slot == out_bufs.len() - 1 && slot != segments - 1 {
            break;
        }
        let total_len = hdr_len + (payload_len - slot * gso_size).min(gso_size);
        let capacity = out_bufs[slot].as_ref().len().saturating_sub(out_offset);
        if total_len > capacity {
            return Err(Error::OutputTooSmall {
                len: total_len,
                capacity,
            });
        }
    }

    let mut next_segment_data_at = hdr_len;
    let mut i = 0;
    while next_segment_data_at < len {
        let next_segment_end = (next_segment_data_at + gso_size).min(len);
        let is_last = next_segment_end == len;
        if i == out_bufs.len() - 1 && !is_last {
            return Err(Error::TooManySegments { written: i });
        }
        let segment_data_len = next_segment_end - next_segment_data_at;
        let total_len = hdr_len + segment_data_len;
        let out = &mut out_bufs[i].as_mut()[out_offset..out_offset + total_len];

        out[..csum_start].copy_from_slice(&input[..csum_start]);
        if ip_version == 4 {
            // IPv4 carries an ID, a total length and a header checksum per packet.
            if i > 0 {
                let id = BigEndian::read_u16(&out[4..]).wrapping_add(i as u16);
                BigEndian::write_u16(&mut out[4..6], id);
            }
            out[10] = 0;
            out[11] = 0;
            BigEndian::write_u16(&mut out[2..4], total_len as u16);
            let ipv4_csum = !engine.checksum(&out[..csum_start], 0);
            BigEndian::write_u16(&mut out[10..12], ipv4_csum);
        } else {
            // Extension headers, if any, count towards the payload length.
            BigEndian::write_u16(&mut out[4..6], (total_len - csum_start) as u16);
        }

        out[csum_start..hdr_len].copy_from_slice(&input[csum_start..hdr_len]);
        if is_tcp {
            let seq = first_tcp_seq.wrapping_add((gso_size as u32).wrapping_mul(i as u32));
            BigEndian::write_u32(&mut out[csum_start + 4..csum_start + 8], seq);
            if !is_last {
                // FIN and PSH belong on the final segment only
                out[csum_start + TCP_FLAGS_OFFSET] &= !(TCP_FLAG_FIN | TCP_FLAG_PSH);
            }
        } else {
            let udp_len = (transport_header_len + segment_data_len) as u16;
            BigEndian::write_u16(&mut out[csum_start + 4..csum_start + 6], udp_len);
        }

        out[hdr_len..].copy_from_slice(&input[next_segment_data_at..next_segment_end]);

        out[csum_at] = 0;
        out[csum_at + 1] = 0;
        let psum = if segment_data_len == gso_size {
            full_segment_psum
        } else {
            pseudo_header_checksum(
                protocol,
                src_addr,
                dst_addr,
                (transport_header_len + segment_data_len) as u16,
            )
        };
        let transport_csum = !engine.checksum(&out[csum_start..], psum);
        BigEndian::write_u16(&mut out[csum_at..csum_at + 2], transport_csum);

        sizes[i] = total_len;
        next_segment_data_at += gso_size;
        i += 1;
    }

    Ok(i)
}

/// Expands one frame read from a vnet-header device, `input` being the
/// virtio header followed by the packet, into `bufs`.
///
/// The kernel's `hdr_len` is not trusted: on the forwarding path it may cover
/// the whole first packet. It is recomputed from `csum_start` plus the real
/// transport header length.
pub(crate) fn handle_virtio_read<B: AsRef<[u8]> + AsMut<[u8]>>(
    engine: &dyn ChecksumEngine,
    input: &mut [u8],
    bufs: &mut [B],
    sizes: &mut [usize],
    offset: usize,
) -> Result<usize> {
    if input.len() <= VIRTIO_NET_HDR_LEN {
        return Err(Error::PacketTooShort {
            len: input.len(),
            need: VIRTIO_NET_HDR_LEN + 1,
        });
    }
    let hdr = VirtioNetHdr::decode(input)?;
    let input = &mut input[VIRTIO_NET_HDR_LEN..];
    let mut options = hdr.to_gso_options()?;

    match options.gso_type {
        GsoType::None => {}
        GsoType::UdpL4 => options.hdr_len = options.csum_start.saturating_add(UDP_H_LEN as u16),
        GsoType::TcpV4 | GsoType::TcpV6 => {
            let data_offset_at = options.csum_start as usize + 12;
            if input.len() <= data_offset_at {
                return Err(Error::PacketTooShort {
                    len: input.len(),
                    need: data_offset_at + 1,
                });
            }
            let tcp_h_len = ((input[data_offset_at] >> 4) as u16) * 4;
            if !(TCP_MIN_HEADER_LEN..=TCP_MAX_HEADER_LEN).contains(&(tcp_h_len as usize)) {
                return Err(Error::InvalidTcpHeaderLen(tcp_h_len));
            }
            options.hdr_len = options.csum_start.saturating_add(tcp_h_len);
        }
    }

    gso_split_with(engine, input, options, bufs, sizes, offset)
}
