mod sys;

pub(crate) mod checksum;
mod device;
mod event;
pub(crate) mod gro;
pub(crate) mod offload;

pub use checksum::{
    checksum, detect, fold32, fold64, pseudo_header_checksum, ChecksumEngine, Generic32, Generic64,
};
#[cfg(target_arch = "x86_64")]
pub use checksum::{Avx2, Sse41};
pub use device::DeviceImpl;
pub use event::Event;
pub use gro::{handle_gro, handle_gro_with, ExpandBuffer, GROTable, GroFlags};
pub use offload::{
    gso_split, gso_split_with, GsoOptions, GsoType, VirtioNetHdr, IDEAL_BATCH_SIZE,
    VIRTIO_NET_HDR_F_NEEDS_CSUM, VIRTIO_NET_HDR_GSO_NONE, VIRTIO_NET_HDR_GSO_TCPV4,
    VIRTIO_NET_HDR_GSO_TCPV6, VIRTIO_NET_HDR_GSO_UDP_L4, VIRTIO_NET_HDR_LEN,
};
