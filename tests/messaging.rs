//! End-to-end messaging between messengers over loopback TCP.

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use simple_messenger::{EntityName, EntityType, Message, Policy, SocketState};

mod common;
use common::{numbered, start_messenger, stop, test_config, wait_until};

const MSG_TEST: u16 = 100;

#[tokio::test]
async fn delivers_in_order_to_peer() {
    let (server, server_rec) = start_messenger(
        EntityName::osd(0),
        test_config(),
        &[(EntityType::Client, Policy::stateful_server())],
    )
    .await;
    let (client, client_rec) = start_messenger(
        EntityName::client(1),
        test_config(),
        &[(EntityType::Osd, Policy::lossless_client())],
    )
    .await;

    for tid in 1..=50 {
        client
            .send_message(numbered(MSG_TEST, tid), &server.my_inst())
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || server_rec.count() == 50).await);
    assert_eq!(server_rec.tids(), (1..=50).collect::<Vec<_>>());
    {
        let messages = server_rec.messages.lock().unwrap();
        assert_eq!(messages[9].data.as_ref(), b"payload-10");
        let con = messages[0].connection.as_ref().unwrap();
        assert_eq!(con.peer_addr(), client.my_addr());
        assert_eq!(con.peer_type(), Some(EntityType::Client));
    }
    assert!(wait_until(Duration::from_secs(2), || {
        client_rec.connects.load(Ordering::SeqCst) == 1
            && server_rec.accepts.load(Ordering::SeqCst) == 1
    })
    .await);

    let status = server.status();
    let open: Vec<_> = status
        .sockets
        .iter()
        .filter(|s| s.state == SocketState::Open)
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].in_seq, 50);

    stop(client).await;
    stop(server).await;
}

#[tokio::test]
async fn replies_travel_on_the_same_connection() {
    let (server, server_rec) = start_messenger(
        EntityName::osd(0),
        test_config(),
        &[(EntityType::Client, Policy::stateful_server())],
    )
    .await;
    let (client, client_rec) = start_messenger(
        EntityName::client(1),
        test_config(),
        &[(EntityType::Osd, Policy::lossless_client())],
    )
    .await;

    let con = client.get_connection(&server.my_inst()).unwrap();
    assert_eq!(con.peer_addr(), server.my_addr());
    con.send_message(numbered(MSG_TEST, 1)).unwrap();

    assert!(wait_until(Duration::from_secs(5), || server_rec.count() == 1).await);
    let back = server_rec.last_connection().unwrap();
    back.send_message(numbered(MSG_TEST + 1, 1)).unwrap();

    assert!(wait_until(Duration::from_secs(5), || client_rec.count() == 1).await);
    assert_eq!(client_rec.messages.lock().unwrap()[0].msg_type, MSG_TEST + 1);

    // a second lookup finds the existing session
    let again = client.get_connection(&server.my_inst()).unwrap();
    assert_eq!(again.id(), con.id());

    stop(client).await;
    stop(server).await;
}

#[tokio::test]
async fn loopback_delivers_locally() {
    let (msgr, rec) = start_messenger(EntityName::osd(3), test_config(), &[]).await;

    msgr.send_message(numbered(MSG_TEST, 1), &msgr.my_inst())
        .unwrap();
    let lo = msgr.get_loopback_connection();
    assert!(lo.is_loopback());
    lo.send_message(numbered(MSG_TEST, 2)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || rec.count() == 2).await);
    assert_eq!(rec.tids(), vec![1, 2]);
    let con = rec.last_connection().unwrap();
    assert!(con.is_loopback());
    assert!(msgr.status().sockets.is_empty());

    stop(msgr).await;
}

#[tokio::test]
async fn posted_buffer_receives_data() {
    let (server, server_rec) = start_messenger(
        EntityName::osd(0),
        test_config(),
        &[(EntityType::Client, Policy::stateful_server())],
    )
    .await;
    let (client, _client_rec) = start_messenger(
        EntityName::client(1),
        test_config(),
        &[(EntityType::Osd, Policy::lossless_client())],
    )
    .await;

    let con = client.get_connection(&server.my_inst()).unwrap();
    con.send_message(numbered(MSG_TEST, 1)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || server_rec.count() == 1).await);

    let incoming = server_rec.last_connection().unwrap();
    incoming.post_rx_buffer(42, BytesMut::with_capacity(4096));
    incoming.post_rx_buffer(43, BytesMut::with_capacity(4));

    let big = vec![7u8; 3000];
    con.send_message(Message::new(MSG_TEST).with_tid(42).with_data(big.clone()))
        .unwrap();
    con.send_message(Message::new(MSG_TEST).with_tid(43).with_data(big.clone()))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || server_rec.count() == 3).await);

    {
        let messages = server_rec.messages.lock().unwrap();
        assert_eq!(messages[1].data.as_ref(), &big[..]);
        assert_eq!(messages[2].data.as_ref(), &big[..]);
    }
    // the large enough buffer was consumed, the small one left alone
    assert!(incoming.revoke_rx_buffer(42).is_none());
    assert!(incoming.revoke_rx_buffer(43).is_some());

    stop(client).await;
    stop(server).await;
}

#[tokio::test]
async fn keepalive_is_acknowledged() {
    let (server, _server_rec) = start_messenger(
        EntityName::osd(0),
        test_config(),
        &[(EntityType::Client, Policy::stateful_server())],
    )
    .await;
    let (client, client_rec) = start_messenger(
        EntityName::client(1),
        test_config(),
        &[(EntityType::Osd, Policy::lossless_client())],
    )
    .await;

    let con = client.get_connection(&server.my_inst()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        client_rec.connects.load(Ordering::SeqCst) == 1
    })
    .await);
    assert!(con.last_keepalive_ack().is_none());

    con.send_keepalive().unwrap();
    assert!(wait_until(Duration::from_secs(5), || con.last_keepalive_ack().is_some()).await);

    stop(client).await;
    stop(server).await;
}

#[tokio::test]
async fn data_crc_can_be_disabled_by_sender() {
    let (server, server_rec) = start_messenger(
        EntityName::osd(0),
        test_config(),
        &[(EntityType::Client, Policy::stateful_server())],
    )
    .await;
    let mut config = test_config();
    config.wire.crc_data = false;
    let (client, _client_rec) = start_messenger(
        EntityName::client(1),
        config,
        &[(EntityType::Osd, Policy::lossless_client())],
    )
    .await;

    for tid in 1..=5 {
        client
            .send_message(numbered(MSG_TEST, tid), &server.my_inst())
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || server_rec.count() == 5).await);

    stop(client).await;
    stop(server).await;
}

#[tokio::test]
async fn refused_connect_is_reported() {
    let (client, client_rec) = start_messenger(
        EntityName::client(1),
        test_config(),
        &[(EntityType::Osd, Policy::lossy_client())],
    )
    .await;

    // bind and drop to get a port nobody listens on
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let dest = simple_messenger::EntityInst::new(
        EntityName::osd(9),
        simple_messenger::EntityAddr::new(port, 1),
    );
    client.send_message(numbered(MSG_TEST, 1), &dest).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        client_rec.refused.load(Ordering::SeqCst) >= 1
    })
    .await);

    stop(client).await;
}

#[tokio::test]
async fn shutdown_closes_sessions_and_rejects_sends() {
    let (server, server_rec) = start_messenger(
        EntityName::osd(0),
        test_config(),
        &[(EntityType::Client, Policy::stateful_server())],
    )
    .await;
    let (client, _client_rec) = start_messenger(
        EntityName::client(1),
        test_config(),
        &[(EntityType::Osd, Policy::lossless_client())],
    )
    .await;

    client
        .send_message(numbered(MSG_TEST, 1), &server.my_inst())
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || server_rec.count() == 1).await);

    let server_inst = server.my_inst();
    stop(server).await;

    client.shutdown();
    assert!(client
        .send_message(numbered(MSG_TEST, 2), &server_inst)
        .is_err());
    common::with_timeout(Duration::from_secs(10), client.wait()).await;
    assert!(client.status().sockets.is_empty());
}
