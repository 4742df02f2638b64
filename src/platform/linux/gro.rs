/*!
# Generic receive offload

Before a batch of packets is written to a vnet-header TUN device, adjacent
segments of the same TCP or UDP flow are coalesced into one large frame that
the kernel can later re-segment. Each written frame carries a
[`VirtioNetHdr`]: coalesced frames describe their segmentation, everything
else gets a zeroed header.

Coalescing never reorders packets within a flow and never drops one; a packet
that cannot be merged is written as-is.
*/

use crate::error::{Error, Result};
use crate::platform::linux::checksum::{self, pseudo_header_checksum, ChecksumEngine};
use crate::platform::linux::offload::{
    VirtioNetHdr, IDEAL_BATCH_SIZE, IPPROTO_TCP, IPPROTO_UDP, IPV4_SRC_ADDR_OFFSET,
    IPV6_HEADER_LEN, IPV6_SRC_ADDR_OFFSET, TCP_FLAGS_OFFSET, TCP_FLAG_ACK, TCP_FLAG_PSH,
    UDP_H_LEN, VIRTIO_NET_HDR_F_NEEDS_CSUM, VIRTIO_NET_HDR_GSO_TCPV4,
    VIRTIO_NET_HDR_GSO_TCPV6, VIRTIO_NET_HDR_GSO_UDP_L4, VIRTIO_NET_HDR_LEN,
};
use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use std::collections::HashMap;

const IPV4_FLAG_MORE_FRAGMENTS: u8 = 0x20;

bitflags::bitflags! {
    /// Coalescing kinds switched off for a device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GroFlags: u8 {
        const TCP_DISABLED = 1;
        const UDP_DISABLED = 1 << 1;
    }
}

impl GroFlags {
    pub fn can_tcp_gro(self) -> bool {
        !self.contains(GroFlags::TCP_DISABLED)
    }
    pub fn can_udp_gro(self) -> bool {
        !self.contains(GroFlags::UDP_DISABLED)
    }
}

/// A buffer that can grow in place while packets are coalesced into it.
///
/// Coalescing only appends within the existing capacity; a buffer without
/// spare capacity is simply never merged into.
pub trait ExpandBuffer: AsRef<[u8]> + AsMut<[u8]> {
    fn buf_capacity(&self) -> usize;
    fn buf_resize(&mut self, new_len: usize, value: u8);
    fn buf_extend_from_slice(&mut self, src: &[u8]);
}

impl ExpandBuffer for BytesMut {
    fn buf_capacity(&self) -> usize {
        self.capacity()
    }
    fn buf_resize(&mut self, new_len: usize, value: u8) {
        self.resize(new_len, value)
    }
    fn buf_extend_from_slice(&mut self, extend: &[u8]) {
        self.extend_from_slice(extend)
    }
}

impl ExpandBuffer for &mut BytesMut {
    fn buf_capacity(&self) -> usize {
        self.capacity()
    }
    fn buf_resize(&mut self, new_len: usize, value: u8) {
        self.resize(new_len, value)
    }
    fn buf_extend_from_slice(&mut self, extend: &[u8]) {
        self.extend_from_slice(extend)
    }
}

impl ExpandBuffer for Vec<u8> {
    fn buf_capacity(&self) -> usize {
        self.capacity()
    }
    fn buf_resize(&mut self, new_len: usize, value: u8) {
        self.resize(new_len, value)
    }
    fn buf_extend_from_slice(&mut self, extend: &[u8]) {
        self.extend_from_slice(extend)
    }
}

impl ExpandBuffer for &mut Vec<u8> {
    fn buf_capacity(&self) -> usize {
        self.capacity()
    }
    fn buf_resize(&mut self, new_len: usize, value: u8) {
        self.resize(new_len, value)
    }
    fn buf_extend_from_slice(&mut self, extend: &[u8]) {
        self.extend_from_slice(extend)
    }
}

/// Returns mutable references to two distinct elements.
fn pair_mut<B>(bufs: &mut [B], a: usize, b: usize) -> (&mut B, &mut B) {
    debug_assert_ne!(a, b);
    if a < b {
        let (head, tail) = bufs.split_at_mut(b);
        (&mut head[a], &mut tail[0])
    } else {
        let (head, tail) = bufs.split_at_mut(a);
        (&mut tail[0], &mut head[b])
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
struct TcpFlowKey {
    src_addr: [u8; 16],
    dst_addr: [u8; 16],
    src_port: u16,
    dst_port: u16,
    rx_ack: u32, // varying ack values should not be coalesced. Treat them as separate flows.
    is_v6: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
struct UdpFlowKey {
    src_addr: [u8; 16],
    dst_addr: [u8; 16],
    src_port: u16,
    dst_port: u16,
    is_v6: bool,
}

fn flow_addrs(pkt: &[u8], is_v6: bool) -> ([u8; 16], [u8; 16]) {
    let (src_at, addr_len) = addr_layout(is_v6);
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src[..addr_len].copy_from_slice(&pkt[src_at..src_at + addr_len]);
    dst[..addr_len].copy_from_slice(&pkt[src_at + addr_len..src_at + 2 * addr_len]);
    (src, dst)
}

fn addr_layout(is_v6: bool) -> (usize, usize) {
    if is_v6 {
        (IPV6_SRC_ADDR_OFFSET, 16)
    } else {
        (IPV4_SRC_ADDR_OFFSET, 4)
    }
}

/// Bookkeeping for one TCP packet while a batch is evaluated.
#[derive(Debug, Clone, Copy)]
struct TcpGroItem {
    key: TcpFlowKey,
    sent_seq: u32,   // the sequence number
    bufs_index: u16, // the index into the original bufs slice
    num_merged: u16, // the number of packets merged into this item
    gso_size: u16,   // payload size
    iph_len: u8,     // ip header len
    tcph_len: u8,    // tcp header len
    psh_set: bool,   // psh flag is set
}

/// Bookkeeping for one UDP packet while a batch is evaluated.
#[derive(Debug, Clone, Copy)]
struct UdpGroItem {
    key: UdpFlowKey,
    bufs_index: u16,
    num_merged: u16,
    gso_size: u16,
    iph_len: u8,
    // a false value DOES NOT imply valid, just unknown
    csum_known_invalid: bool,
}

/// The parsed view of the TCP packet under evaluation.
struct TcpCandidate {
    key: TcpFlowKey,
    iph_len: u8,
    tcph_len: u8,
    seq: u32,
    psh_set: bool,
    gso_size: u16,
}

/// TCP flows seen in the current batch.
pub struct TcpGroTable {
    items_by_flow: HashMap<TcpFlowKey, Vec<TcpGroItem>>,
    items_pool: Vec<Vec<TcpGroItem>>,
}

impl Default for TcpGroTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpGroTable {
    pub fn new() -> Self {
        let mut items_pool = Vec::with_capacity(IDEAL_BATCH_SIZE);
        for _ in 0..IDEAL_BATCH_SIZE {
            items_pool.push(Vec::with_capacity(IDEAL_BATCH_SIZE));
        }
        TcpGroTable {
            items_by_flow: HashMap::with_capacity(IDEAL_BATCH_SIZE),
            items_pool,
        }
    }

    /// Returns the items of the candidate's flow, or records the candidate as
    /// the first item of a new flow and returns `None`.
    fn lookup_or_insert(
        &mut self,
        candidate: &TcpCandidate,
        bufs_index: usize,
    ) -> Option<&mut Vec<TcpGroItem>> {
        if self.items_by_flow.contains_key(&candidate.key) {
            return self.items_by_flow.get_mut(&candidate.key);
        }
        self.insert(candidate, bufs_index);
        None
    }

    fn insert(&mut self, candidate: &TcpCandidate, bufs_index: usize) {
        let item = TcpGroItem {
            key: candidate.key,
            sent_seq: candidate.seq,
            bufs_index: bufs_index as u16,
            num_merged: 0,
            gso_size: candidate.gso_size,
            iph_len: candidate.iph_len,
            tcph_len: candidate.tcph_len,
            psh_set: candidate.psh_set,
        };
        let pool = &mut self.items_pool;
        self.items_by_flow
            .entry(candidate.key)
            .or_insert_with(|| pool.pop().unwrap_or_default())
            .push(item);
    }

    fn reset(&mut self) {
        for (_key, mut items) in self.items_by_flow.drain() {
            items.clear();
            self.items_pool.push(items);
        }
    }
}

/// UDP flows seen in the current batch.
pub struct UdpGroTable {
    items_by_flow: HashMap<UdpFlowKey, Vec<UdpGroItem>>,
    items_pool: Vec<Vec<UdpGroItem>>,
}

impl Default for UdpGroTable {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpGroTable {
    pub fn new() -> Self {
        let mut items_pool = Vec::with_capacity(IDEAL_BATCH_SIZE);
        for _ in 0..IDEAL_BATCH_SIZE {
            items_pool.push(Vec::with_capacity(IDEAL_BATCH_SIZE));
        }
        UdpGroTable {
            items_by_flow: HashMap::with_capacity(IDEAL_BATCH_SIZE),
            items_pool,
        }
    }

    fn insert(
        &mut self,
        key: UdpFlowKey,
        iph_len: u8,
        gso_size: u16,
        bufs_index: usize,
        csum_known_invalid: bool,
    ) {
        let item = UdpGroItem {
            key,
            bufs_index: bufs_index as u16,
            num_merged: 0,
            gso_size,
            iph_len,
            csum_known_invalid,
        };
        let pool = &mut self.items_pool;
        self.items_by_flow
            .entry(key)
            .or_insert_with(|| pool.pop().unwrap_or_default())
            .push(item);
    }

    fn reset(&mut self) {
        for (_key, mut items) in self.items_by_flow.drain() {
            items.clear();
            self.items_pool.push(items);
        }
    }
}

/// Per-batch coalescing state, reused across writes.
///
/// The tables only hold indices into the batch being evaluated; they are
/// cleared by [`GROTable::reset`] once the batch is written.
pub struct GROTable {
    pub(crate) to_write: Vec<usize>,
    // caller packets carried by each buffer of the batch
    packets: Vec<usize>,
    pub(crate) tcp_gro_table: TcpGroTable,
    pub(crate) udp_gro_table: UdpGroTable,
}

impl Default for GROTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GROTable {
    pub fn new() -> GROTable {
        GROTable {
            to_write: Vec::with_capacity(IDEAL_BATCH_SIZE),
            packets: Vec::with_capacity(IDEAL_BATCH_SIZE),
            tcp_gro_table: TcpGroTable::new(),
            udp_gro_table: UdpGroTable::new(),
        }
    }

    /// Indices into the last evaluated batch of the frames to hand to the
    /// kernel, in order.
    pub fn to_write(&self) -> &[usize] {
        &self.to_write
    }

    /// The number of caller packets carried by frame `index` of the last
    /// evaluated batch: one, plus every packet coalesced into it.
    pub fn packets_in(&self, index: usize) -> usize {
        self.packets.get(index).copied().unwrap_or(1)
    }

    fn count_packets(&mut self, batch_len: usize) {
        self.packets.clear();
        self.packets.resize(batch_len, 1);
        for item in self.tcp_gro_table.items_by_flow.values().flatten() {
            self.packets[item.bufs_index as usize] += item.num_merged as usize;
        }
        for item in self.udp_gro_table.items_by_flow.values().flatten() {
            self.packets[item.bufs_index as usize] += item.num_merged as usize;
        }
    }

    pub fn reset(&mut self) {
        self.to_write.clear();
        self.packets.clear();
        self.tcp_gro_table.reset();
        self.udp_gro_table.reset();
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum CanCoalesce {
    Prepend,
    Unavailable,
    Append,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum CoalesceResult {
    InsufficientCap,
    PshEnding,
    ItemInvalidCsum,
    PktInvalidCsum,
    Success,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum GroResult {
    Noop,
    TableInsert,
    Coalesced,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum GroCandidate {
    NotGro,
    Tcp4,
    Tcp6,
    Udp4,
    Udp6,
}

/// Whether the IP headers of two packets agree on every field that must be
/// equal for them to be merged.
fn ip_headers_can_coalesce(pkt_a: &[u8], pkt_b: &[u8]) -> bool {
    if pkt_a.len() < 9 || pkt_b.len() < 9 {
        return false;
    }
    if pkt_a[0] >> 4 == 6 {
        if pkt_a[0] != pkt_b[0] || pkt_a[1] >> 4 != pkt_b[1] >> 4 {
            // cannot coalesce with unequal Traffic class values
            return false;
        }
        if pkt_a[7] != pkt_b[7] {
            // cannot coalesce with unequal Hop limit values
            return false;
        }
    } else {
        if pkt_a[1] != pkt_b[1] {
            // cannot coalesce with unequal ToS values
            return false;
        }
        if pkt_a[6] >> 5 != pkt_b[6] >> 5 {
            // cannot coalesce with unequal DF or reserved bits. MF is checked
            // further up the stack.
            return false;
        }
        if pkt_a[8] != pkt_b[8] {
            // cannot coalesce with unequal TTL values
            return false;
        }
    }
    true
}

fn checksum_valid(
    engine: &dyn ChecksumEngine,
    pkt: &[u8],
    iph_len: u8,
    proto: u8,
    is_v6: bool,
) -> bool {
    let (src_at, addr_len) = addr_layout(is_v6);
    let iph_len = iph_len as usize;
    let psum = pseudo_header_checksum(
        proto,
        &pkt[src_at..src_at + addr_len],
        &pkt[src_at + addr_len..src_at + 2 * addr_len],
        (pkt.len() - iph_len) as u16,
    );
    !engine.checksum(&pkt[iph_len..], psum) == 0
}

fn packet_is_gro_candidate(b: &[u8], gro: GroFlags) -> GroCandidate {
    if b.len() < 28 {
        return GroCandidate::NotGro;
    }
    if b[0] >> 4 == 4 {
        if b[0] & 0x0f != 5 {
            // IPv4 packets w/IP options do not coalesce
            return GroCandidate::NotGro;
        }
        match b[9] {
            IPPROTO_TCP if b.len() >= 40 && gro.can_tcp_gro() => return GroCandidate::Tcp4,
            IPPROTO_UDP if gro.can_udp_gro() => return GroCandidate::Udp4,
            _ => {}
        }
    } else if b[0] >> 4 == 6 {
        match b[6] {
            IPPROTO_TCP if b.len() >= 60 && gro.can_tcp_gro() => return GroCandidate::Tcp6,
            IPPROTO_UDP if b.len() >= 48 && gro.can_udp_gro() => return GroCandidate::Udp6,
            _ => {}
        }
    }
    GroCandidate::NotGro
}

/// Checks the IP length field against the buffer and returns the IP header
/// length, or `None` when the packet is not usable for GRO.
fn ip_header_len(pkt: &[u8], is_v6: bool) -> Option<usize> {
    if pkt.len() > u16::MAX as usize {
        // A valid IPv4 or IPv6 packet will never exceed this.
        return None;
    }
    if is_v6 {
        let iph_len = 40;
        let payload_len = BigEndian::read_u16(&pkt[4..6]) as usize;
        if payload_len != pkt.len() - iph_len {
            return None;
        }
        Some(iph_len)
    } else {
        let total_len = BigEndian::read_u16(&pkt[2..4]) as usize;
        if total_len != pkt.len() {
            return None;
        }
        if pkt[6] & IPV4_FLAG_MORE_FRAGMENTS != 0 || pkt[6] << 3 != 0 || pkt[7] != 0 {
            // no GRO support for fragmented segments for now
            return None;
        }
        Some(((pkt[0] & 0x0f) * 4) as usize)
    }
}

fn parse_tcp(pkt: &[u8], is_v6: bool) -> Option<TcpCandidate> {
    let iph_len = ip_header_len(pkt, is_v6)?;
    if pkt.len() < iph_len + 13 {
        return None;
    }
    let tcph_len = ((pkt[iph_len + 12] >> 4) * 4) as usize;
    if !(20..=60).contains(&tcph_len) || pkt.len() < iph_len + tcph_len {
        return None;
    }

    // not a candidate if any non-ACK flags (except PSH+ACK) are set
    let tcp_flags = pkt[iph_len + TCP_FLAGS_OFFSET];
    let psh_set = match tcp_flags {
        TCP_FLAG_ACK => false,
        f if f == TCP_FLAG_ACK | TCP_FLAG_PSH => true,
        _ => return None,
    };

    let gso_size = pkt.len() - tcph_len - iph_len;
    // not a candidate if payload len is 0
    if gso_size < 1 {
        return None;
    }

    let (src_addr, dst_addr) = flow_addrs(pkt, is_v6);
    Some(TcpCandidate {
        key: TcpFlowKey {
            src_addr,
            dst_addr,
            src_port: BigEndian::read_u16(&pkt[iph_len..]),
            dst_port: BigEndian::read_u16(&pkt[iph_len + 2..]),
            rx_ack: BigEndian::read_u32(&pkt[iph_len + 8..]),
            is_v6,
        },
        iph_len: iph_len as u8,
        tcph_len: tcph_len as u8,
        seq: BigEndian::read_u32(&pkt[iph_len + 4..]),
        psh_set,
        gso_size: gso_size as u16,
    })
}

/// Evaluates whether the candidate at `pkt_i` can be merged with `item`.
/// The checks match the kernel's GRO self tests in
/// tools/testing/selftests/net/gro.c.
fn tcp_packets_can_coalesce<B: ExpandBuffer>(
    bufs: &[B],
    offset: usize,
    pkt_i: usize,
    candidate: &TcpCandidate,
    item: &TcpGroItem,
) -> CanCoalesce {
    let pkt = &bufs[pkt_i].as_ref()[offset..];
    let pkt_target = &bufs[item.bufs_index as usize].as_ref()[offset..];
    let iph_len = candidate.iph_len as usize;
    let tcph_len = candidate.tcph_len as usize;

    if candidate.tcph_len != item.tcph_len {
        // cannot coalesce with unequal tcp options len
        return CanCoalesce::Unavailable;
    }
    let target_iph_len = item.iph_len as usize;
    if tcph_len > 20
        && pkt[iph_len + 20..iph_len + tcph_len]
            != pkt_target[target_iph_len + 20..target_iph_len + tcph_len]
    {
        // cannot coalesce with unequal tcp options
        return CanCoalesce::Unavailable;
    }
    if !ip_headers_can_coalesce(pkt, pkt_target) {
        return CanCoalesce::Unavailable;
    }

    // seq adjacency
    let lhs_len = item.gso_size as u32 * (item.num_merged as u32 + 1);
    if candidate.seq == item.sent_seq.wrapping_add(lhs_len) {
        // pkt aligns following item from a seq num perspective
        if item.psh_set {
            // PSH can only be set on the final segment in a reassembled group.
            return CanCoalesce::Unavailable;
        }
        if pkt_target[iph_len + tcph_len..].len() % item.gso_size as usize != 0 {
            // A smaller than gso_size packet has been appended previously.
            // Nothing can come after a smaller packet on the end.
            return CanCoalesce::Unavailable;
        }
        if candidate.gso_size > item.gso_size {
            // We cannot have a larger packet following a smaller one.
            return CanCoalesce::Unavailable;
        }
        return CanCoalesce::Append;
    }
    if candidate
        .seq
        .wrapping_add(candidate.gso_size as u32)
        == item.sent_seq
    {
        // pkt aligns in front of item from a seq num perspective
        if candidate.psh_set {
            // PSH can only be set on the final segment in a reassembled group.
            return CanCoalesce::Unavailable;
        }
        if candidate.gso_size < item.gso_size {
            // We cannot have a larger packet following a smaller one.
            return CanCoalesce::Unavailable;
        }
        if candidate.gso_size > item.gso_size && item.num_merged > 0 {
            // There's at least one previous merge, and we're larger than all
            // previous. This would put multiple smaller packets on the end.
            return CanCoalesce::Unavailable;
        }
        return CanCoalesce::Prepend;
    }
    CanCoalesce::Unavailable
}

/// Whether a merged packet of `coalesced_len` bytes no longer fits the 16-bit
/// IPv4 total length, or the IPv6 payload length.
fn exceeds_length_fields(coalesced_len: usize, is_v6: bool) -> bool {
    let limit = if is_v6 {
        u16::MAX as usize + IPV6_HEADER_LEN
    } else {
        u16::MAX as usize
    };
    coalesced_len > limit
}

/// Merges the candidate at `pkt_i` into `item`. A prepend swaps the two
/// buffers so the merged frame stays at the index already queued for writing.
fn coalesce_tcp_packets<B: ExpandBuffer>(
    engine: &dyn ChecksumEngine,
    mode: CanCoalesce,
    bufs: &mut [B],
    offset: usize,
    pkt_i: usize,
    candidate: &TcpCandidate,
    item: &mut TcpGroItem,
) -> CoalesceResult {
    let item_i = item.bufs_index as usize;
    let is_v6 = item.key.is_v6;
    let headers_len = (item.iph_len + item.tcph_len) as usize;
    let pkt_len = bufs[pkt_i].as_ref().len() - offset;
    let coalesced_len = bufs[item_i].as_ref().len() - offset + pkt_len - headers_len;
    if exceeds_length_fields(coalesced_len, is_v6) {
        return CoalesceResult::InsufficientCap;
    }

    if mode == CanCoalesce::Prepend {
        if bufs[pkt_i].buf_capacity() < 2 * offset + coalesced_len {
            // We don't want to allocate a new underlying array if capacity is
            // too small.
            return CoalesceResult::InsufficientCap;
        }
        if candidate.psh_set {
            return CoalesceResult::PshEnding;
        }
        if item.num_merged == 0
            && !checksum_valid(
                engine,
                &bufs[item_i].as_ref()[offset..],
                item.iph_len,
                IPPROTO_TCP,
                is_v6,
            )
        {
            return CoalesceResult::ItemInvalidCsum;
        }
        if !checksum_valid(
            engine,
            &bufs[pkt_i].as_ref()[offset..],
            item.iph_len,
            IPPROTO_TCP,
            is_v6,
        ) {
            return CoalesceResult::PktInvalidCsum;
        }
        item.sent_seq = candidate.seq;
        let (pkt_buf, item_buf) = pair_mut(bufs, pkt_i, item_i);
        pkt_buf.buf_extend_from_slice(&item_buf.as_ref()[offset + headers_len..]);
        bufs.swap(item_i, pkt_i);
    } else {
        if bufs[item_i].buf_capacity() < 2 * offset + coalesced_len {
            return CoalesceResult::InsufficientCap;
        }
        if item.num_merged == 0
            && !checksum_valid(
                engine,
                &bufs[item_i].as_ref()[offset..],
                item.iph_len,
                IPPROTO_TCP,
                is_v6,
            )
        {
            return CoalesceResult::ItemInvalidCsum;
        }
        if !checksum_valid(
            engine,
            &bufs[pkt_i].as_ref()[offset..],
            item.iph_len,
            IPPROTO_TCP,
            is_v6,
        ) {
            return CoalesceResult::PktInvalidCsum;
        }
        let (item_buf, pkt_buf) = pair_mut(bufs, item_i, pkt_i);
        if candidate.psh_set {
            // We are appending a segment with PSH set.
            item.psh_set = true;
            item_buf.as_mut()[offset + item.iph_len as usize + TCP_FLAGS_OFFSET] |= TCP_FLAG_PSH;
        }
        item_buf.buf_extend_from_slice(&pkt_buf.as_ref()[offset + headers_len..]);
    }

    if candidate.gso_size > item.gso_size {
        item.gso_size = candidate.gso_size;
    }
    item.num_merged += 1;
    CoalesceResult::Success
}

fn tcp_gro<B: ExpandBuffer>(
    engine: &dyn ChecksumEngine,
    bufs: &mut [B],
    offset: usize,
    pkt_i: usize,
    table: &mut TcpGroTable,
    is_v6: bool,
) -> GroResult {
    let Some(candidate) = parse_tcp(&bufs[pkt_i].as_ref()[offset..], is_v6) else {
        return GroResult::Noop;
    };
    let Some(items) = table.lookup_or_insert(&candidate, pkt_i) else {
        return GroResult::TableInsert;
    };

    // Packets usually arrive in order, so the newest item is the likeliest
    // match. Iterating backwards also lets an item with a bad checksum be
    // removed in place. Once stored, an item is never compared against other
    // items of its flow.
    for i in (0..items.len()).rev() {
        let item = &mut items[i];
        let can = tcp_packets_can_coalesce(bufs, offset, pkt_i, &candidate, item);
        if can == CanCoalesce::Unavailable {
            continue;
        }
        match coalesce_tcp_packets(engine, can, bufs, offset, pkt_i, &candidate, item) {
            CoalesceResult::Success => return GroResult::Coalesced,
            CoalesceResult::ItemInvalidCsum => {
                // still written, as a plain packet
                let idx = items.remove(i).bufs_index as usize;
                bufs[idx].as_mut()[offset - VIRTIO_NET_HDR_LEN..offset].fill(0);
            }
            // no point in inserting an item that we can't coalesce
            CoalesceResult::PktInvalidCsum => return GroResult::Noop,
            CoalesceResult::InsufficientCap | CoalesceResult::PshEnding => {}
        }
    }

    // failed to coalesce with any other packets; store the item in the flow
    table.insert(&candidate, pkt_i);
    GroResult::TableInsert
}

fn udp_gro<B: ExpandBuffer>(
    engine: &dyn ChecksumEngine,
    bufs: &mut [B],
    offset: usize,
    pkt_i: usize,
    table: &mut UdpGroTable,
    is_v6: bool,
) -> GroResult {
    let pkt = &bufs[pkt_i].as_ref()[offset..];
    let Some(iph_len) = ip_header_len(pkt, is_v6) else {
        return GroResult::Noop;
    };
    if pkt.len() < iph_len + UDP_H_LEN {
        return GroResult::Noop;
    }
    let gso_size = pkt.len() - UDP_H_LEN - iph_len;
    if gso_size < 1 {
        return GroResult::Noop;
    }
    let gso_size = gso_size as u16;
    let (src_addr, dst_addr) = flow_addrs(pkt, is_v6);
    let key = UdpFlowKey {
        src_addr,
        dst_addr,
        src_port: BigEndian::read_u16(&pkt[iph_len..]),
        dst_port: BigEndian::read_u16(&pkt[iph_len + 2..]),
        is_v6,
    };

    let mut pkt_csum_known_invalid = false;
    if let Some(item) = table
        .items_by_flow
        .get_mut(&key)
        .and_then(|items| items.last_mut())
    {
        // Only the last item is considered so a flow is never reordered.
        if udp_packets_can_coalesce(bufs, offset, pkt_i, iph_len, gso_size, item) {
            match coalesce_udp_packets(engine, bufs, offset, pkt_i, item) {
                CoalesceResult::Success => return GroResult::Coalesced,
                // A new item is stored and the old one is never revisited.
                CoalesceResult::ItemInvalidCsum => {}
                // Store the packet but remember not to check it again.
                CoalesceResult::PktInvalidCsum => pkt_csum_known_invalid = true,
                CoalesceResult::InsufficientCap | CoalesceResult::PshEnding => {}
            }
        }
    }

    table.insert(key, iph_len as u8, gso_size, pkt_i, pkt_csum_known_invalid);
    GroResult::TableInsert
}

fn udp_packets_can_coalesce<B: ExpandBuffer>(
    bufs: &[B],
    offset: usize,
    pkt_i: usize,
    iph_len: usize,
    gso_size: u16,
    item: &UdpGroItem,
) -> bool {
    let pkt = &bufs[pkt_i].as_ref()[offset..];
    let pkt_target = &bufs[item.bufs_index as usize].as_ref()[offset..];
    if !ip_headers_can_coalesce(pkt, pkt_target) {
        return false;
    }
    if pkt_target[iph_len + UDP_H_LEN..].len() % item.gso_size as usize != 0 {
        // A smaller than gso_size packet has been appended previously.
        // Nothing can come after a smaller packet on the end.
        return false;
    }
    // We cannot have a larger packet following a smaller one.
    gso_size <= item.gso_size
}

fn coalesce_udp_packets<B: ExpandBuffer>(
    engine: &dyn ChecksumEngine,
    bufs: &mut [B],
    offset: usize,
    pkt_i: usize,
    item: &mut UdpGroItem,
) -> CoalesceResult {
    let item_i = item.bufs_index as usize;
    let is_v6 = item.key.is_v6;
    let headers_len = item.iph_len as usize + UDP_H_LEN;
    let pkt_len = bufs[pkt_i].as_ref().len() - offset;
    let coalesced_len = bufs[item_i].as_ref().len() - offset + pkt_len - headers_len;
    if exceeds_length_fields(coalesced_len, is_v6)
        || bufs[item_i].buf_capacity() < 2 * offset + coalesced_len
    {
        return CoalesceResult::InsufficientCap;
    }
    if item.num_merged == 0
        && (item.csum_known_invalid
            || !checksum_valid(
                engine,
                &bufs[item_i].as_ref()[offset..],
                item.iph_len,
                IPPROTO_UDP,
                is_v6,
            ))
    {
        return CoalesceResult::ItemInvalidCsum;
    }
    if !checksum_valid(
        engine,
        &bufs[pkt_i].as_ref()[offset..],
        item.iph_len,
        IPPROTO_UDP,
        is_v6,
    ) {
        return CoalesceResult::PktInvalidCsum;
    }
    let (item_buf, pkt_buf) = pair_mut(bufs, item_i, pkt_i);
    item_buf.buf_extend_from_slice(&pkt_buf.as_ref()[offset + headers_len..]);
    item.num_merged += 1;
    CoalesceResult::Success
}

/// Rewrites the IP length fields of a merged frame, recomputes the IPv4
/// header checksum and stores the pseudo-header sum at the transport checksum
/// offset, where the kernel completes it.
fn finish_coalesced(
    engine: &dyn ChecksumEngine,
    buf: &mut [u8],
    offset: usize,
    hdr: &VirtioNetHdr,
    iph_len: usize,
    proto: u8,
    is_v6: bool,
) -> Result<()> {
    let pkt_len = buf.len() - offset;
    let transport_len = (pkt_len - iph_len) as u16;
    let psum = {
        let pkt = &buf[offset..];
        let (src_at, addr_len) = addr_layout(is_v6);
        pseudo_header_checksum(
            proto,
            &pkt[src_at..src_at + addr_len],
            &pkt[src_at + addr_len..src_at + 2 * addr_len],
            transport_len,
        )
    };

    hdr.encode(&mut buf[offset - VIRTIO_NET_HDR_LEN..offset])?;
    let pkt = &mut buf[offset..];
    if is_v6 {
        BigEndian::write_u16(&mut pkt[4..6], transport_len);
    } else {
        pkt[10] = 0;
        pkt[11] = 0;
        BigEndian::write_u16(&mut pkt[2..4], pkt_len as u16);
        let iph_csum = !engine.checksum(&pkt[..iph_len], 0);
        BigEndian::write_u16(&mut pkt[10..12], iph_csum);
    }
    if proto == IPPROTO_UDP {
        BigEndian::write_u16(&mut pkt[iph_len + 4..iph_len + 6], transport_len);
    }
    let csum_at = (hdr.csum_start + hdr.csum_offset) as usize;
    BigEndian::write_u16(&mut pkt[csum_at..csum_at + 2], psum);
    Ok(())
}

fn apply_tcp_coalesce_accounting<B: ExpandBuffer>(
    engine: &dyn ChecksumEngine,
    bufs: &mut [B],
    offset: usize,
    table: &TcpGroTable,
) -> Result<()> {
    for item in table.items_by_flow.values().flatten() {
        let buf = bufs[item.bufs_index as usize].as_mut();
        if item.num_merged == 0 {
            VirtioNetHdr::default().encode(&mut buf[offset - VIRTIO_NET_HDR_LEN..offset])?;
            continue;
        }
        let hdr = VirtioNetHdr {
            flags: VIRTIO_NET_HDR_F_NEEDS_CSUM,
            gso_type: if item.key.is_v6 {
                VIRTIO_NET_HDR_GSO_TCPV6
            } else {
                VIRTIO_NET_HDR_GSO_TCPV4
            },
            hdr_len: (item.iph_len + item.tcph_len) as u16,
            gso_size: item.gso_size,
            csum_start: item.iph_len as u16,
            csum_offset: 16,
        };
        finish_coalesced(
            engine,
            buf,
            offset,
            &hdr,
            item.iph_len as usize,
            IPPROTO_TCP,
            item.key.is_v6,
        )?;
    }
    Ok(())
}

fn apply_udp_coalesce_accounting<B: ExpandBuffer>(
    engine: &dyn ChecksumEngine,
    bufs: &mut [B],
    offset: usize,
    table: &UdpGroTable,
) -> Result<()> {
    for item in table.items_by_flow.values().flatten() {
        let buf = bufs[item.bufs_index as usize].as_mut();
        if item.num_merged == 0 {
            VirtioNetHdr::default().encode(&mut buf[offset - VIRTIO_NET_HDR_LEN..offset])?;
            continue;
        }
        let hdr = VirtioNetHdr {
            // this turns into CHECKSUM_PARTIAL in the skb
            flags: VIRTIO_NET_HDR_F_NEEDS_CSUM,
            gso_type: VIRTIO_NET_HDR_GSO_UDP_L4,
            hdr_len: item.iph_len as u16 + UDP_H_LEN as u16,
            gso_size: item.gso_size,
            csum_start: item.iph_len as u16,
            csum_offset: 6,
        };
        finish_coalesced(
            engine,
            buf,
            offset,
            &hdr,
            item.iph_len as usize,
            IPPROTO_UDP,
            item.key.is_v6,
        )?;
    }
    Ok(())
}

/// Coalesces the packets in `bufs[..][offset..]` and prepares every frame for
/// a vnet-header write.
///
/// `offset` must leave room for a [`VirtioNetHdr`] in front of each packet;
/// the header is written at `offset - VIRTIO_NET_HDR_LEN`. Afterwards
/// [`GROTable::to_write`] lists the frames to write, in their original order;
/// packets merged into an earlier frame are left out. Call
/// [`GROTable::reset`] before evaluating the next batch.
pub fn handle_gro<B: ExpandBuffer>(
    bufs: &mut [B],
    offset: usize,
    table: &mut GROTable,
    gro: GroFlags,
) -> Result<()> {
    handle_gro_with(checksum::detect(), bufs, offset, table, gro)
}

/// [`handle_gro`] with an explicit checksum engine.
pub fn handle_gro_with<B: ExpandBuffer>(
    engine: &dyn ChecksumEngine,
    bufs: &mut [B],
    offset: usize,
    table: &mut GROTable,
    gro: GroFlags,
) -> Result<()> {
    for i in 0..bufs.len() {
        if offset < VIRTIO_NET_HDR_LEN || offset >= bufs[i].as_ref().len() {
            return Err(Error::InvalidOffset(offset));
        }
        let result = match packet_is_gro_candidate(&bufs[i].as_ref()[offset..], gro) {
            GroCandidate::Tcp4 => {
                tcp_gro(engine, bufs, offset, i, &mut table.tcp_gro_table, false)
            }
            GroCandidate::Tcp6 => tcp_gro(engine, bufs, offset, i, &mut table.tcp_gro_table, true),
            GroCandidate::Udp4 => {
                udp_gro(engine, bufs, offset, i, &mut table.udp_gro_table, false)
            }
            GroCandidate::Udp6 => udp_gro(engine, bufs, offset, i, &mut table.udp_gro_table, true),
            GroCandidate::NotGro => GroResult::Noop,
        };
        match result {
            GroResult::Noop => {
                VirtioNetHdr::default()
                    .encode(&mut bufs[i].as_mut()[offset - VIRTIO_NET_HDR_LEN..offset])?;
                table.to_write.push(i);
            }
            GroResult::TableInsert => table.to_write.push(i),
            GroResult::Coalesced => {}
        }
    }

    let tcp = apply_tcp_coalesce_accounting(engine, bufs, offset, &table.tcp_gro_table);
    let udp = apply_udp_coalesce_accounting(engine, bufs, offset, &table.udp_gro_table);
    tcp?;
    udp?;
    table.count_packets(bufs.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_gate_candidates() {
        let mut tcp4 = vec![0u8; 40];
        tcp4[0] = 0x45;
        tcp4[9] = IPPROTO_TCP;
        let mut udp4 = tcp4.clone();
        udp4[9] = IPPROTO_UDP;

        assert_eq!(
            packet_is_gro_candidate(&tcp4, GroFlags::empty()),
            GroCandidate::Tcp4
        );
        assert_eq!(
            packet_is_gro_candidate(&tcp4, GroFlags::TCP_DISABLED),
            GroCandidate::NotGro
        );
        assert_eq!(
            packet_is_gro_candidate(&udp4, GroFlags::TCP_DISABLED),
            GroCandidate::Udp4
        );
        assert_eq!(
            packet_is_gro_candidate(&udp4, GroFlags::UDP_DISABLED),
            GroCandidate::NotGro
        );

        // IPv4 options
        tcp4[0] = 0x46;
        assert_eq!(
            packet_is_gro_candidate(&tcp4, GroFlags::empty()),
            GroCandidate::NotGro
        );
        assert_eq!(
            packet_is_gro_candidate(&tcp4[..20], GroFlags::empty()),
            GroCandidate::NotGro
        );
    }

    #[test]
    fn ip_header_mismatch_blocks_coalescing() {
        let mut a = vec![0u8; 20];
        a[0] = 0x45;
        a[8] = 64;
        let mut b = a.clone();
        assert!(ip_headers_can_coalesce(&a, &b));
        b[8] = 63;
        assert!(!ip_headers_can_coalesce(&a, &b));
        b[8] = 64;
        b[1] = 0x10;
        assert!(!ip_headers_can_coalesce(&a, &b));
        b[1] = 0;
        // DF differs
        b[6] = 0x40;
        assert!(!ip_headers_can_coalesce(&a, &b));
    }

    #[test]
    fn pair_mut_either_order() {
        let mut v = vec![1, 2, 3, 4];
        let (a, b) = pair_mut(&mut v, 3, 1);
        std::mem::swap(a, b);
        assert_eq!(v, [1, 4, 3, 2]);
        let (a, b) = pair_mut(&mut v, 0, 2);
        *a += 10;
        *b += 20;
        assert_eq!(v, [11, 4, 23, 2]);
    }

    #[test]
    fn bad_offset_is_rejected() {
        let mut bufs = vec![vec![0u8; 60]];
        let mut table = GROTable::new();
        let err = handle_gro(&mut bufs, 4, &mut table, GroFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::InvalidOffset(4)));
        let err = handle_gro(&mut bufs, 60, &mut table, GroFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::InvalidOffset(60)));
    }
}
