/*!
# Device Builder Module

This module provides the [`DeviceBuilder`] struct for configuring and creating TUN interfaces.

## Overview

The builder collects every parameter before the device is created:
- Device name
- MTU (Maximum Transmission Unit)
- Virtio-net offload (GSO/GRO and checksum offload)
- Multi-queue
- Link event monitoring
- The checksum engine used for segmentation and coalescing

## Basic Usage

```no_run
use tun_offload::DeviceBuilder;

let dev = DeviceBuilder::new()
    .name("tun0")
    .mtu(1400)
    .build_sync()?;
# Ok::<(), tun_offload::Error>(())
```

## Offload

Offload is on by default. The kernel decides what it grants: TCP segmentation
offload is required once virtio headers are negotiated, UDP segmentation
offload (Linux 6.2+) is optional and UDP coalescing is turned off without it.

```no_run
use tun_offload::{DeviceBuilder, Generic64};

static ENGINE: Generic64 = Generic64;

let dev = DeviceBuilder::new()
    .offload(true)
    .monitor(false)
    .checksum_engine(&ENGINE)
    .build_sync()?;
assert!(dev.batch_size() >= 1);
# Ok::<(), tun_offload::Error>(())
```
*/

use crate::error::{Error, Result};
use crate::platform::linux::checksum::ChecksumEngine;
use crate::platform::{DeviceImpl, SyncDevice};

/// Everything `DeviceImpl::new` needs, resolved from a [`DeviceBuilder`].
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceConfig {
    /// The name of the device/interface.
    pub(crate) name: Option<String>,
    pub(crate) mtu: Option<u16>,
    /// Request `IFF_VNET_HDR`.
    pub(crate) offload: bool,
    pub(crate) multi_queue: bool,
    /// Start the netlink listener and the link probe.
    pub(crate) monitor: bool,
    pub(crate) engine: Option<&'static dyn ChecksumEngine>,
}

/// A builder for configuring a TUN interface.
///
/// # Example
///
/// ```no_run
/// use tun_offload::DeviceBuilder;
///
/// let dev = DeviceBuilder::new().name("tun7").mtu(1420).build_sync()?;
/// println!("{} has index {}", dev.name()?, dev.if_index()?);
/// # Ok::<(), tun_offload::Error>(())
/// ```
#[derive(Clone)]
pub struct DeviceBuilder {
    dev_name: Option<String>,
    mtu: Option<u16>,
    offload: bool,
    multi_queue: bool,
    monitor: bool,
    engine: Option<&'static dyn ChecksumEngine>,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        DeviceBuilder {
            dev_name: None,
            mtu: None,
            offload: true,
            multi_queue: false,
            monitor: true,
            engine: None,
        }
    }
}

impl DeviceBuilder {
    /// Creates a new DeviceBuilder instance with default settings.
    pub fn new() -> Self {
        Self::default()
    }
    /// Sets the device name. The kernel picks `tunN` when no name is given.
    pub fn name<S: Into<String>>(mut self, dev_name: S) -> Self {
        self.dev_name = Some(dev_name.into());
        self
    }
    /// Sets the device MTU (Maximum Transmission Unit).
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }
    /// Requests virtio-net headers, which enable segmentation offload on
    /// read and coalescing on write. Defaults to `true`.
    pub fn offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }
    /// Enables multi-queue support.
    pub fn multi_queue(mut self, multi_queue: bool) -> Self {
        self.multi_queue = multi_queue;
        self
    }
    /// Starts the link listeners that feed [`SyncDevice::events`].
    /// Defaults to `true`.
    pub fn monitor(mut self, monitor: bool) -> Self {
        self.monitor = monitor;
        self
    }
    /// Uses `engine` for every checksum the device computes instead of the
    /// fastest one the CPU supports.
    pub fn checksum_engine(mut self, engine: &'static dyn ChecksumEngine) -> Self {
        self.engine = Some(engine);
        self
    }
    pub(crate) fn build_config(&self) -> Result<DeviceConfig> {
        if let Some(name) = &self.dev_name {
            if name.len() >= libc::IFNAMSIZ || name.contains('\0') {
                return Err(Error::InvalidName(name.clone()));
            }
        }
        Ok(DeviceConfig {
            name: self.dev_name.clone(),
            mtu: self.mtu,
            offload: self.offload,
            multi_queue: self.multi_queue,
            monitor: self.monitor,
            engine: self.engine,
        })
    }
    /// Builds a synchronous device instance.
    pub fn build_sync(self) -> Result<SyncDevice> {
        let device = DeviceImpl::new(self.build_config()?)?;
        Ok(SyncDevice(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::linux::checksum::Generic32;

    #[test]
    fn defaults() {
        let config = DeviceBuilder::new().build_config().unwrap();
        assert!(config.name.is_none());
        assert!(config.mtu.is_none());
        assert!(config.offload);
        assert!(config.monitor);
        assert!(!config.multi_queue);
        assert!(config.engine.is_none());
    }

    #[test]
    fn options_are_carried() {
        static ENGINE: Generic32 = Generic32;
        let config = DeviceBuilder::new()
            .name("wg0")
            .mtu(1420)
            .offload(false)
            .multi_queue(true)
            .monitor(false)
            .checksum_engine(&ENGINE)
            .build_config()
            .unwrap();
        assert_eq!(config.name.as_deref(), Some("wg0"));
        assert_eq!(config.mtu, Some(1420));
        assert!(!config.offload);
        assert!(config.multi_queue);
        assert!(!config.monitor);
        assert_eq!(config.engine.map(|e| e.name()), Some(ENGINE.name()));
    }

    #[test]
    fn long_names_are_rejected() {
        let max = "a".repeat(libc::IFNAMSIZ - 1);
        assert!(DeviceBuilder::new().name(max).build_config().is_ok());

        let too_long = "a".repeat(libc::IFNAMSIZ);
        let err = DeviceBuilder::new()
            .name(too_long.clone())
            .build_config()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidName(name) if name == too_long));

        let err = DeviceBuilder::new().name("tun\0x").build_config().unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));
    }
}
