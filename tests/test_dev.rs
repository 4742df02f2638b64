use std::sync::Arc;
use std::time::Duration;

use tun_offload::{DeviceBuilder, Error, Event, IDEAL_BATCH_SIZE, VIRTIO_NET_HDR_LEN};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
#[ignore = "requires CAP_NET_ADMIN"]
fn offload_is_negotiated() {
    init_logger();
    let device = DeviceBuilder::new()
        .name("tunoff0")
        .mtu(1420)
        .monitor(false)
        .build_sync()
        .unwrap();
    assert!(device.vnet_hdr());
    assert!(device.tcp_gro());
    assert_eq!(device.batch_size(), IDEAL_BATCH_SIZE);
    assert_eq!(device.mtu().unwrap(), 1420);
    assert_eq!(device.name().unwrap(), "tunoff0");

    device.disable_tcp_gro();
    device.disable_udp_gro();
    assert!(!device.tcp_gro());
    assert!(!device.udp_gro());
}

#[test]
#[ignore = "requires CAP_NET_ADMIN"]
fn without_offload_batch_is_one() {
    init_logger();
    let device = DeviceBuilder::new()
        .offload(false)
        .monitor(false)
        .build_sync()
        .unwrap();
    assert!(!device.vnet_hdr());
    assert_eq!(device.batch_size(), 1);
    assert!(device.name().unwrap().starts_with("tun"));
}

#[test]
#[ignore = "requires CAP_NET_ADMIN"]
fn close_wakes_reader() {
    init_logger();
    let device = Arc::new(
        DeviceBuilder::new()
            .name("tunoff1")
            .build_sync()
            .unwrap(),
    );
    let events = device.events().unwrap();
    assert!(device.events().is_none());

    let reader = device.clone();
    let handle = std::thread::spawn(move || {
        let mut bufs = vec![vec![0u8; VIRTIO_NET_HDR_LEN + 65535]; IDEAL_BATCH_SIZE];
        let mut sizes = vec![0usize; IDEAL_BATCH_SIZE];
        loop {
            match reader.read(&mut bufs, &mut sizes, VIRTIO_NET_HDR_LEN) {
                Ok(_) => continue,
                Err(e) => return e,
            }
        }
    });

    std::thread::sleep(Duration::from_millis(200));
    device.close().unwrap();
    let err = handle.join().unwrap();
    assert!(matches!(err, Error::Closed), "{err:?}");

    let mut bufs = [vec![0u8; 128]];
    assert!(matches!(
        device.write(&mut bufs, VIRTIO_NET_HDR_LEN),
        Err(Error::Closed)
    ));

    // the listeners are gone, so the channel drains and disconnects
    let seen: Vec<Event> = events.iter().collect();
    assert!(seen.iter().all(|e| matches!(e, Event::Up | Event::Down | Event::MtuUpdate)));
}

#[test]
#[ignore = "requires CAP_NET_ADMIN"]
fn mtu_change_is_reported() {
    init_logger();
    let device = DeviceBuilder::new().name("tunoff2").build_sync().unwrap();
    let events = device.events().unwrap();
    device.set_mtu(1300).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        match events.recv_timeout(remaining) {
            Ok(Event::MtuUpdate) => break,
            Ok(_) => continue,
            Err(e) => panic!("no MTU event: {e}"),
        }
    }
    assert_eq!(device.mtu().unwrap(), 1300);
}
