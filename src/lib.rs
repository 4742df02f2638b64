#![cfg_attr(docsrs, feature(doc_cfg))]

/*!
# tun-offload: Linux TUN with virtio-net offloads

A Linux TUN device that moves packets in batches and lets the kernel skip most
per-packet work. When the interface is opened with `IFF_VNET_HDR`, each frame
exchanged with the kernel is prefixed by a `virtio_net_hdr`:

- **Reads**: the kernel hands over one large TCP or UDP "super-packet" plus
  segmentation metadata. It is split in software into wire-sized packets with
  correct IPv4 header and transport checksums ([`gso_split`]).
- **Writes**: consecutive packets of the same TCP or UDP flow are coalesced
  into one frame before it is written ([`handle_gro`]), the inverse of the read
  path.
- **Checksums**: RFC 1071 internet checksums through a [`ChecksumEngine`]
  chosen once per process for the running CPU ([`detect`]), with scalar
  fallbacks that are always available.

The segmentation and checksum routines are plain functions over byte slices
and can be used without a device.

## Quick Start

```no_run
use tun_offload::{DeviceBuilder, VIRTIO_NET_HDR_LEN};

let dev = DeviceBuilder::new().name("tun0").mtu(1420).build_sync()?;

let offset = VIRTIO_NET_HDR_LEN;
let mut bufs = vec![vec![0u8; offset + 65535]; dev.batch_size()];
let mut sizes = vec![0usize; dev.batch_size()];
loop {
    let n = dev.read(&mut bufs, &mut sizes, offset)?;
    for (buf, size) in bufs.iter().zip(&sizes).take(n) {
        println!("packet: {:?}", &buf[offset..offset + size]);
    }
}
# Ok::<(), tun_offload::Error>(())
```

## Segmenting without a device

```
use tun_offload::{gso_split, GsoOptions};

# let mut packet = vec![0x45u8; 60];
let options = GsoOptions::default();
let mut out = vec![vec![0u8; 1500]; 4];
let mut sizes = vec![0usize; 4];
let n = gso_split(&mut packet, options, &mut out, &mut sizes, 0)?;
assert_eq!(n, 1);
assert_eq!(sizes[0], 60);
# Ok::<(), tun_offload::Error>(())
```

## Events

Unless monitoring is switched off, two background threads watch the link:
an rtnetlink listener and a once-per-second probe that also works across
network namespaces. Their [`Event`]s arrive on the channel returned by
[`DeviceImpl::events`]. [`DeviceImpl::close`] stops both and wakes any
blocked `read` or `write`, which then return [`Error::Closed`].

## Error Handling

Everything returns [`Result`] with the crate's [`Error`]. Validation errors
leave the output untouched; [`Error::TooManySegments`] reports how many
segments at the front of the output are complete. `Error` converts into
`std::io::Error` for callers that work in `io::Result`.
*/

#[cfg(not(target_os = "linux"))]
compile_error!("tun-offload only supports Linux");

mod builder;
mod error;
mod platform;

pub use crate::builder::*;
pub use crate::error::{Error, Result};
pub use crate::platform::*;
