/*!
RFC 1071 internet checksum.

Every engine returns the folded one's-complement sum of `data` plus `initial`,
*not* complemented. Callers complement with `!` when finalizing a header field
and keep the plain value when chaining a partial sum into a later call.

The generic engines sum the buffer in host byte order with add-with-carry and
swap the result back on little-endian hosts. One's-complement addition is byte
order independent, so this yields the same value as summing big-endian 16-bit
words directly.
*/

use std::fmt;
use std::sync::OnceLock;

/// A strategy for computing the internet checksum.
///
/// All implementations must return bit-identical results; they differ only in
/// speed. Tests pin a specific engine, production code uses [`detect`].
pub trait ChecksumEngine: Send + Sync + fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;
    /// Sums `data` seeded with `initial` and folds the result to 16 bits.
    fn checksum(&self, data: &[u8], initial: u16) -> u16;
}

/// Portable engine using 64-bit words.
#[derive(Debug, Clone, Copy, Default)]
pub struct Generic64;

/// Portable engine using 32-bit words, for narrow targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Generic32;

#[inline(always)]
fn add64(a: u64, b: u64, carry: u64) -> (u64, u64) {
    let (sum, c1) = a.overflowing_add(b);
    let (sum, c2) = sum.overflowing_add(carry);
    (sum, (c1 | c2) as u64)
}

#[inline(always)]
fn add32(a: u32, b: u32, carry: u32) -> (u32, u32) {
    let (sum, c1) = a.overflowing_add(b);
    let (sum, c2) = sum.overflowing_add(carry);
    (sum, (c1 | c2) as u32)
}

#[inline(always)]
fn ne_u64(b: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&b[..8]);
    u64::from_ne_bytes(word)
}

#[inline(always)]
fn ne_u32(b: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&b[..4]);
    u32::from_ne_bytes(word)
}

#[inline(always)]
fn ne_u16(b: &[u8]) -> u16 {
    u16::from_ne_bytes([b[0], b[1]])
}

/// The value a trailing odd byte contributes, in host order.
#[inline(always)]
fn odd_byte(byte: u8) -> u16 {
    u16::from_ne_bytes([byte, 0])
}

/// Folds a 64-bit accumulator and its pending carry down to 16 bits.
pub fn fold64(unfolded: u64, carry: u64) -> u16 {
    let (sum, carry) = add32((unfolded >> 32) as u32, unfolded as u32, carry as u32);
    // sum + carry cannot exceed 0x1_fffe here, so one more fold is enough
    let sum = (sum >> 16) + (sum & 0xffff) + carry;
    let sum = (sum >> 16) + (sum & 0xffff);
    sum as u16
}

/// Folds a 32-bit accumulator and its pending carry down to 16 bits.
pub fn fold32(unfolded: u32, carry: u32) -> u16 {
    let sum = (unfolded >> 16) + (unfolded & 0xffff) + carry;
    let sum = (sum >> 16) + (sum & 0xffff);
    let sum = (sum >> 16) + (sum & 0xffff);
    sum as u16
}

impl ChecksumEngine for Generic64 {
    fn name(&self) -> &'static str {
        "generic64"
    }

    fn checksum(&self, mut b: &[u8], initial: u16) -> u16 {
        let mut ac = initial.to_be() as u64;
        let mut carry = 0u64;

        while b.len() >= 128 {
            for chunk in b[..128].chunks_exact(8) {
                (ac, carry) = add64(ac, ne_u64(chunk), carry);
            }
            b = &b[128..];
        }
        for width in [64, 32, 16, 8] {
            if b.len() >= width {
                for chunk in b[..width].chunks_exact(8) {
                    (ac, carry) = add64(ac, ne_u64(chunk), carry);
                }
                b = &b[width..];
            }
        }
        if b.len() >= 4 {
            (ac, carry) = add64(ac, ne_u32(b) as u64, carry);
            b = &b[4..];
        }
        if b.len() >= 2 {
            (ac, carry) = add64(ac, ne_u16(b) as u64, carry);
            b = &b[2..];
        }
        if let Some(&byte) = b.first() {
            (ac, carry) = add64(ac, odd_byte(byte) as u64, carry);
        }

        u16::from_be(fold64(ac, carry))
    }
}

impl ChecksumEngine for Generic32 {
    fn name(&self) -> &'static str {
        "generic32"
    }

    fn checksum(&self, mut b: &[u8], initial: u16) -> u16 {
        let mut ac = initial.to_be() as u32;
        let mut carry = 0u32;

        while b.len() >= 64 {
            for chunk in b[..64].chunks_exact(4) {
                (ac, carry) = add32(ac, ne_u32(chunk), carry);
            }
            b = &b[64..];
        }
        for width in [32, 16, 8, 4] {
            if b.len() >= width {
                for chunk in b[..width].chunks_exact(4) {
                    (ac, carry) = add32(ac, ne_u32(chunk), carry);
                }
                b = &b[width..];
            }
        }
        if b.len() >= 2 {
            (ac, carry) = add32(ac, ne_u16(b) as u32, carry);
            b = &b[2..];
        }
        if let Some(&byte) = b.first() {
            (ac, carry) = add32(ac, odd_byte(byte) as u32, carry);
        }

        u16::from_be(fold32(ac, carry))
    }
}

/// Accumulates big-endian 32-bit words into a wide sum. Shared tail of the
/// vector engines.
#[cfg(target_arch = "x86_64")]
fn accumulate_be_words(mut b: &[u8], initial: u64) -> u64 {
    use byteorder::{BigEndian, ByteOrder};

    let mut accumulator = initial;
    while b.len() >= 4 {
        accumulator += BigEndian::read_u32(&b[0..4]) as u64;
        b = &b[4..];
    }
    if b.len() >= 2 {
        accumulator += BigEndian::read_u16(&b[0..2]) as u64;
        b = &b[2..];
    }
    if let Some(&byte) = b.first() {
        accumulator += (byte as u64) << 8;
    }
    accumulator
}

#[cfg(target_arch = "x86_64")]
fn fold_wide(mut accumulator: u64) -> u16 {
    while accumulator > 0xffff {
        accumulator = (accumulator >> 16) + (accumulator & 0xffff);
    }
    accumulator as u16
}

/// AVX2 engine. Only obtainable through [`Avx2::new`] on CPUs with AVX2.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub struct Avx2(());

#[cfg(target_arch = "x86_64")]
impl Avx2 {
    pub fn new() -> Option<Self> {
        is_x86_feature_detected!("avx2").then_some(Avx2(()))
    }
}

/// SSE4.1 engine. Only obtainable through [`Sse41::new`] on CPUs with SSE4.1.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub struct Sse41(());

#[cfg(target_arch = "x86_64")]
impl Sse41 {
    pub fn new() -> Option<Self> {
        is_x86_feature_detected!("sse4.1").then_some(Sse41(()))
    }
}

/// # Safety
/// Caller must ensure this function is called only on CPUs that support AVX2.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn sum_avx2(mut b: &[u8], initial: u64) -> u64 {
    use std::arch::x86_64::*;

    const CHUNK_SIZE: usize = 32;
    let mut accumulator = initial;

    if b.len() >= CHUNK_SIZE {
        // four 64-bit lanes of partial sums
        let mut sums = _mm256_setzero_si256();
        // byte-swap each 32-bit word from network order
        let shuffle_mask = _mm256_set_epi8(
            12, 13, 14, 15, 8, 9, 10, 11, 4, 5, 6, 7, 0, 1, 2, 3, 12, 13, 14, 15, 8, 9, 10, 11, 4,
            5, 6, 7, 0, 1, 2, 3,
        );
        while b.len() >= CHUNK_SIZE {
            let data = _mm256_loadu_si256(b.as_ptr() as *const __m256i);
            let swapped = _mm256_shuffle_epi8(data, shuffle_mask);
            let lower = _mm256_cvtepu32_epi64(_mm256_extracti128_si256(swapped, 0));
            let upper = _mm256_cvtepu32_epi64(_mm256_extracti128_si256(swapped, 1));
            sums = _mm256_add_epi64(sums, lower);
            sums = _mm256_add_epi64(sums, upper);
            b = &b[CHUNK_SIZE..];
        }
        accumulator += _mm256_extract_epi64(sums, 0) as u64;
        accumulator += _mm256_extract_epi64(sums, 1) as u64;
        accumulator += _mm256_extract_epi64(sums, 2) as u64;
        accumulator += _mm256_extract_epi64(sums, 3) as u64;
    }

    accumulate_be_words(b, accumulator)
}

/// # Safety
/// Caller must ensure this function is called only on CPUs that support SSE4.1.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.1")]
unsafe fn sum_sse41(mut b: &[u8], initial: u64) -> u64 {
    use std::arch::x86_64::*;

    const CHUNK_SIZE: usize = 16;
    let mut accumulator = initial;

    if b.len() >= CHUNK_SIZE {
        let mut sums = _mm_setzero_si128();
        let shuffle_mask = _mm_set_epi8(12, 13, 14, 15, 8, 9, 10, 11, 4, 5, 6, 7, 0, 1, 2, 3);
        while b.len() >= CHUNK_SIZE {
            let data = _mm_loadu_si128(b.as_ptr() as *const __m128i);
            let swapped = _mm_shuffle_epi8(data, shuffle_mask);
            sums = _mm_add_epi64(sums, _mm_cvtepu32_epi64(swapped));
            sums = _mm_add_epi64(sums, _mm_cvtepu32_epi64(_mm_bsrli_si128(swapped, 8)));
            b = &b[CHUNK_SIZE..];
        }
        accumulator += _mm_cvtsi128_si64(sums) as u64;
        accumulator += _mm_extract_epi64(sums, 1) as u64;
    }

    accumulate_be_words(b, accumulator)
}

#[cfg(target_arch = "x86_64")]
impl ChecksumEngine for Avx2 {
    fn name(&self) -> &'static str {
        "avx2"
    }

    fn checksum(&self, data: &[u8], initial: u16) -> u16 {
        // SAFETY: an `Avx2` value only exists after AVX2 was detected.
        fold_wide(unsafe { sum_avx2(data, initial as u64) })
    }
}

#[cfg(target_arch = "x86_64")]
impl ChecksumEngine for Sse41 {
    fn name(&self) -> &'static str {
        "sse4.1"
    }

    fn checksum(&self, data: &[u8], initial: u16) -> u16 {
        // SAFETY: an `Sse41` value only exists after SSE4.1 was detected.
        fold_wide(unsafe { sum_sse41(data, initial as u64) })
    }
}

static ENGINE: OnceLock<Box<dyn ChecksumEngine>> = OnceLock::new();

fn select() -> Box<dyn ChecksumEngine> {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(engine) = Avx2::new() {
            return Box::new(engine);
        }
        if let Some(engine) = Sse41::new() {
            return Box::new(engine);
        }
    }
    if cfg!(target_pointer_width = "64") {
        Box::new(Generic64)
    } else {
        Box::new(Generic32)
    }
}

/// Returns the fastest engine for this CPU.
///
/// The choice is made on first use and never changes for the life of the
/// process. Code that needs a particular engine passes it explicitly instead.
pub fn detect() -> &'static dyn ChecksumEngine {
    ENGINE
        .get_or_init(|| {
            let engine = select();
            log::debug!("checksum engine: {}", engine.name());
            engine
        })
        .as_ref()
}

/// [`ChecksumEngine::checksum`] on the [detected](detect) engine.
#[inline]
pub fn checksum(data: &[u8], initial: u16) -> u16 {
    detect().checksum(data, initial)
}

fn addr_partial_checksum(addr: &[u8], sum: u64, carry: u64) -> (u64, u64) {
    match addr.len() {
        4 => add64(sum, ne_u32(addr) as u64, carry),
        16 => {
            let (sum, carry) = add64(sum, ne_u64(addr), carry);
            add64(sum, ne_u64(&addr[8..]), carry)
        }
        n => panic!("bad addr length: {n}"),
    }
}

/// Partial checksum of the TCP/UDP pseudo-header (RFC 793 / RFC 8200).
///
/// The result is uncomplemented and meant as the `initial` seed of a later
/// [`checksum`] over the transport header and payload.
///
/// # Panics
/// When the addresses are not both 4 or both 16 bytes long.
pub fn pseudo_header_checksum(protocol: u8, src_addr: &[u8], dst_addr: &[u8], total_len: u16) -> u16 {
    assert_eq!(
        src_addr.len(),
        dst_addr.len(),
        "pseudo-header address families differ"
    );
    // total_len and protocol as they sit in memory: {len_hi, len_lo} and {0, protocol}
    let sum = total_len.to_be() as u64 + u16::from_ne_bytes([0, protocol]) as u64;
    let (sum, carry) = addr_partial_checksum(src_addr, sum, 0);
    let (sum, carry) = addr_partial_checksum(dst_addr, sum, carry);
    u16::from_be(fold64(sum, carry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore, SeedableRng};

    /// RFC 1071 one 16-bit word at a time.
    fn reference(data: &[u8], initial: u16) -> u16 {
        let mut sum = initial as u32;
        let mut words = data.chunks_exact(2);
        for w in &mut words {
            sum += u16::from_be_bytes([w[0], w[1]]) as u32;
        }
        if let [last] = words.remainder() {
            sum += (*last as u32) << 8;
        }
        while sum > 0xffff {
            sum = (sum >> 16) + (sum & 0xffff);
        }
        sum as u16
    }

    fn engines() -> Vec<&'static dyn ChecksumEngine> {
        let mut engines: Vec<&'static dyn ChecksumEngine> = vec![&Generic64, &Generic32];
        #[cfg(target_arch = "x86_64")]
        {
            if let Some(engine) = Avx2::new() {
                engines.push(Box::leak(Box::new(engine)));
            }
            if let Some(engine) = Sse41::new() {
                engines.push(Box::leak(Box::new(engine)));
            }
        }
        engines.push(detect());
        engines
    }

    #[test]
    fn every_length_matches_reference() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x1071);
        let mut buf = vec![0u8; 300];
        rng.fill_bytes(&mut buf);
        for engine in engines() {
            for len in 0..=buf.len() {
                for initial in [0u16, 1, 0x00ff, 0xff00, 0xfffe, 0xffff, rng.random()] {
                    assert_eq!(
                        engine.checksum(&buf[..len], initial),
                        reference(&buf[..len], initial),
                        "engine {} len {len} initial {initial:#06x}",
                        engine.name()
                    );
                }
            }
        }
    }

    #[test]
    fn chunk_boundaries_with_saturated_bytes() {
        // all-0xff input drives every carry path
        let buf = [0xffu8; 260];
        let lengths = [
            0, 1, 2, 3, 4, 7, 8, 15, 16, 31, 32, 63, 64, 127, 128, 129, 255, 256, 260,
        ];
        for engine in engines() {
            for len in lengths {
                assert_eq!(
                    engine.checksum(&buf[..len], 0xffff),
                    reference(&buf[..len], 0xffff),
                    "engine {} len {len}",
                    engine.name()
                );
            }
        }
    }

    #[test]
    fn engines_agree_on_random_buffers() {
        let mut rng = rand::rng();
        let engines = engines();
        let mut buf = vec![0u8; 4096];
        for _ in 0..10_000 {
            let len = rng.random_range(0..buf.len());
            rng.fill_bytes(&mut buf[..len]);
            let initial: u16 = rng.random();
            let want = Generic64.checksum(&buf[..len], initial);
            for engine in &engines {
                assert_eq!(engine.checksum(&buf[..len], initial), want, "{}", engine.name());
            }
        }
    }

    #[test]
    fn rfc1071_example() {
        // RFC 1071 section 3 worked example
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data, 0), 0xddf2);
        assert_eq!(!checksum(&data, 0), 0x220d);
    }

    #[test]
    fn fold_end_around_carry() {
        assert_eq!(fold64(0, 0), 0);
        assert_eq!(fold64(0xffff_ffff_ffff_ffff, 0), 0xffff);
        assert_eq!(fold64(0xffff_ffff_0000_0000, 1), 1);
        assert_eq!(fold64(0x0000_0001_0000_0000, 0), 1);
        assert_eq!(fold32(0xffff_ffff, 0), 0xffff);
        assert_eq!(fold32(0x0001_0000, 0), 1);
    }

    fn pseudo_reference(protocol: u8, src: &[u8], dst: &[u8], len: u16) -> u16 {
        let mut header = Vec::new();
        header.extend_from_slice(src);
        header.extend_from_slice(dst);
        header.extend_from_slice(&[0, protocol]);
        header.extend_from_slice(&len.to_be_bytes());
        reference(&header, 0)
    }

    #[test]
    fn pseudo_header_matches_hand_sum() {
        let v4 = ([192u8, 168, 1, 10], [10u8, 0, 0, 255]);
        let v6 = (
            [
                0xfd, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xab, 0x01,
            ],
            [
                0x20, 0x01, 0x0d, 0xb8, 0xff, 0xff, 0, 0, 0, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef,
            ],
        );
        for protocol in [6u8, 17] {
            for len in [0u16, 8, 20, 1480, 0xffff] {
                assert_eq!(
                    pseudo_header_checksum(protocol, &v4.0, &v4.1, len),
                    pseudo_reference(protocol, &v4.0, &v4.1, len)
                );
                assert_eq!(
                    pseudo_header_checksum(protocol, &v6.0, &v6.1, len),
                    pseudo_reference(protocol, &v6.0, &v6.1, len)
                );
            }
        }
    }

    #[test]
    fn pseudo_header_known_value() {
        // 10.0.0.1 -> 10.0.0.2, TCP, 20 bytes:
        // 0x0a00 + 0x0001 + 0x0a00 + 0x0002 + 0x0006 + 0x0014 = 0x141d
        assert_eq!(
            pseudo_header_checksum(6, &[10, 0, 0, 1], &[10, 0, 0, 2], 20),
            0x141d
        );
    }

    #[test]
    #[should_panic(expected = "bad addr length")]
    fn pseudo_header_rejects_bad_length() {
        pseudo_header_checksum(6, &[1, 2, 3], &[4, 5, 6], 20);
    }

    #[test]
    #[should_panic(expected = "address families differ")]
    fn pseudo_header_rejects_mixed_families() {
        pseudo_header_checksum(17, &[1, 2, 3, 4], &[0; 16], 20);
    }
}
