#![cfg(any(target_os = "linux", target_os = "android"))]

use std::net::IpAddr;
use std::sync::mpsc;

use evio::net::{UdpSocket, UdpSocketParam};

mod util;
use util::{new_loop, recv};

#[test]
fn datagram_round_trip_with_packet_info() {
    let io_loop = new_loop();

    let (packet_tx, packet_rx) = mpsc::channel();
    let receiver = UdpSocket::create(
        UdpSocketParam {
            bind_address: Some("127.0.0.1:0".parse().unwrap()),
            packet_info: true,
            on_receive: Some(Box::new(move |packet| {
                let _ = packet_tx.send((packet.source, packet.data.to_vec(), packet.info));
            })),
            ..UdpSocketParam::default()
        },
        Some(&io_loop),
    )
    .expect("unable to create receiver");
    let receiver_addr = receiver.local_addr().expect("no receiver address");

    let sender = UdpSocket::create(
        UdpSocketParam {
            bind_address: Some("127.0.0.1:0".parse().unwrap()),
            ..UdpSocketParam::default()
        },
        Some(&io_loop),
    )
    .expect("unable to create sender");
    let sender_addr = sender.local_addr().expect("no sender address");

    let sent = sender
        .send_to(&receiver_addr, b"datagram")
        .expect("send failed");
    assert_eq!(sent, 8);

    let (source, data, info) = recv(&packet_rx, "datagram");
    assert_eq!(source, sender_addr);
    assert_eq!(data, b"datagram");
    let info = info.expect("packet info missing");
    assert_eq!(info.destination, "127.0.0.1".parse::<IpAddr>().unwrap());
    assert_ne!(info.interface_index, 0);

    io_loop.release();
}

#[test]
fn send_with_explicit_interface_and_source() {
    let io_loop = new_loop();

    let (packet_tx, packet_rx) = mpsc::channel();
    let receiver = UdpSocket::create(
        UdpSocketParam {
            bind_address: Some("127.0.0.1:0".parse().unwrap()),
            packet_info: true,
            on_receive: Some(Box::new(move |packet| {
                let _ = packet_tx.send((packet.data.to_vec(), packet.info));
            })),
            ..UdpSocketParam::default()
        },
        Some(&io_loop),
    )
    .expect("unable to create receiver");
    let receiver_addr = receiver.local_addr().expect("no receiver address");

    let sender = UdpSocket::create(
        UdpSocketParam {
            bind_address: Some("127.0.0.1:0".parse().unwrap()),
            ..UdpSocketParam::default()
        },
        Some(&io_loop),
    )
    .expect("unable to create sender");

    let loopback_index = unsafe { libc::if_nametoindex(b"lo\0".as_ptr() as *const _) };
    let sent = sender
        .send_to_with_info(
            loopback_index,
            Some("127.0.0.1".parse().unwrap()),
            &receiver_addr,
            b"pinned",
        )
        .expect("send_to_with_info failed");
    assert_eq!(sent, 6);

    let (data, info) = recv(&packet_rx, "datagram");
    assert_eq!(data, b"pinned");
    let info = info.expect("packet info missing");
    assert_eq!(info.destination, "127.0.0.1".parse::<IpAddr>().unwrap());
    if loopback_index != 0 {
        assert_eq!(info.interface_index, loopback_index);
    }

    io_loop.release();
}

#[test]
fn receiver_without_packet_info_sees_plain_datagrams() {
    let io_loop = new_loop();

    let (packet_tx, packet_rx) = mpsc::channel();
    let receiver = UdpSocket::create(
        UdpSocketParam {
            bind_address: Some("127.0.0.1:0".parse().unwrap()),
            on_receive: Some(Box::new(move |packet| {
                let _ = packet_tx.send((packet.data.to_vec(), packet.info));
            })),
            ..UdpSocketParam::default()
        },
        Some(&io_loop),
    )
    .expect("unable to create receiver");
    let receiver_addr = receiver.local_addr().expect("no receiver address");

    let sender = UdpSocket::create(UdpSocketParam::default(), Some(&io_loop))
        .expect("unable to create sender");
    sender.send_to(&receiver_addr, b"plain").expect("send failed");

    let (data, info) = recv(&packet_rx, "datagram");
    assert_eq!(data, b"plain");
    assert!(info.is_none());

    io_loop.release();
}
