//! # Real UDP loopback
//!
//! Client and server transports on 127.0.0.1 with the system clock.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use ferry_transport::{DeliveryGuarantee, NetworkEvent, Transport, TransportConfig, TransportState};

fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .unwrap()
}

#[test]
fn ping_pong_over_loopback() {
    let mut config = TransportConfig::default();
    config.set_connection_data("127.0.0.1", free_port(), None);

    let mut server = Transport::new(config.clone());
    let mut client = Transport::new(config);
    server.start_server().unwrap();
    client.start_client().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut pinged = false;
    let mut pong = None;
    while Instant::now() < deadline && pong.is_none() {
        client.update();
        server.update();

        while let Some(ev) = server.poll_event() {
            if let NetworkEvent::Data(id, payload) = ev.event {
                assert_eq!(payload.as_ref(), b"ping");
                server
                    .send(id, b"pong", DeliveryGuarantee::ReliableSequenced)
                    .unwrap();
            }
        }
        while let Some(ev) = client.poll_event() {
            if let NetworkEvent::Data(_, payload) = ev.event {
                pong = Some(payload);
            }
        }
        if !pinged && client.state() == TransportState::Connected {
            let server_id = client.server_connection().unwrap();
            client
                .send(server_id, b"ping", DeliveryGuarantee::ReliableSequenced)
                .unwrap();
            pinged = true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(pong.as_deref(), Some(&b"pong"[..]));
    client.shutdown();
    server.shutdown();
}
