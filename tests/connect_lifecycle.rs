use std::sync::Arc;
use std::time::Duration;

use rtbus::client::Client;
use rtbus::core::config::Config;
use rtbus::protocol::codec_for_url;
use rtbus::session::{ConnectEvent, DisconnectEvent, SessionEvents};
use rtbus::testing::{
    BrokerConnection, FixedDelay, MockBroker, MockPoster, MockTransport, command_id,
    command_method, frame_commands,
};
use rtbus::Status;
use sonic_rs::JsonValueTrait;
use tokio::sync::mpsc;

fn spawn_client(
    config: Config,
    events: SessionEvents,
) -> (Client<MockTransport>, MockBroker) {
    let (transport, broker) = MockTransport::pair();
    let client = Client::with_parts(
        "ws://mock",
        config,
        events,
        transport,
        codec_for_url("ws://mock"),
        Arc::new(MockPoster::unreachable()),
        Some(Box::new(FixedDelay(Duration::from_millis(20)))),
    );
    (client, broker)
}

async fn greet(conn: &mut BrokerConnection) {
    let frame = conn.recv().await.expect("connect frame");
    let commands = frame_commands(&frame);
    assert_eq!(command_method(&commands[0]), "connect");
    conn.send_text(format!(
        "{{\"id\":{},\"result\":{{\"client\":\"c\"}}}}",
        command_id(&commands[0])
    ));
}

async fn wait_status(client: &Client<MockTransport>, status: Status) {
    for _ in 0..100 {
        if client.state().await.expect("state").status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for status {status:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_event_carries_client_transport_and_latency() {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ConnectEvent>();
    let events = SessionEvents::new().on_connect(move |event| {
        let _ = conn_tx.send(event);
    });
    let (client, mut broker) = spawn_client(Config::default(), events);
    client.connect().await.expect("connect accepted");
    client.connect().await.expect("connect is idempotent");

    let mut conn = broker.accept().await;
    greet(&mut conn).await;

    let event = conn_rx.recv().await.expect("connect event");
    assert_eq!(event.client, "c");
    assert_eq!(event.transport, "mock");
    wait_status(&client, Status::Connected).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batched_commands_flush_as_one_frame_in_insertion_order() {
    let (client, mut broker) = spawn_client(Config::default(), SessionEvents::default());
    client.connect().await.expect("connect accepted");
    let mut conn = broker.accept().await;
    greet(&mut conn).await;
    wait_status(&client, Status::Connected).await;

    client.start_batching().await.expect("start batching");
    for n in 1..=3 {
        client
            .send(sonic_rs::from_str(&format!("{{\"n\":{n}}}")).unwrap())
            .await
            .expect("send accepted");
    }
    client.flush().await.expect("flush accepted");
    // Flushing again with an empty queue is a no-op.
    client.flush().await.expect("empty flush accepted");
    client.stop_batching(false).await.expect("stop batching");

    let frame = conn.recv().await.expect("batched frame");
    let commands = frame_commands(&frame);
    assert_eq!(commands.len(), 3, "one frame for the whole batch");
    for (index, command) in commands.iter().enumerate() {
        assert_eq!(command_method(command), "send");
        assert_eq!(
            command
                .get("params")
                .and_then(|p| p.get("data"))
                .and_then(|d| d.get("n"))
                .and_then(|v| v.as_u64()),
            Some(index as u64 + 1)
        );
    }
    assert!(
        conn.recv_timeout(Duration::from_millis(100)).await.is_none(),
        "no extra frames after the batch"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_event_fires_once_per_episode() {
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel::<DisconnectEvent>();
    let events = SessionEvents::new().on_disconnect(move |event| {
        let _ = disc_tx.send(event);
    });
    let (client, mut broker) = spawn_client(Config::default(), events);
    client.connect().await.expect("connect accepted");
    let mut conn = broker.accept().await;
    greet(&mut conn).await;
    wait_status(&client, Status::Connected).await;

    conn.close("flaky network");
    let disconnect = disc_rx.recv().await.expect("disconnect event");
    assert_eq!(disconnect.reason, "flaky network");
    assert!(disconnect.reconnect);

    // The outage continues across another transport loss before the session
    // is back; no second event for the same episode.
    let mut conn = broker.accept().await;
    let _ = conn.recv().await.expect("connect frame");
    conn.close("still flaky");

    let mut conn = broker.accept().await;
    greet(&mut conn).await;
    wait_status(&client, Status::Connected).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(100), disc_rx.recv())
            .await
            .is_err(),
        "one disconnect event per episode"
    );

    // A fresh episode emits again; user disconnect is terminal and idempotent.
    client.disconnect().await.expect("disconnect accepted");
    client.disconnect().await.expect("disconnect is idempotent");
    let disconnect = disc_rx.recv().await.expect("second episode event");
    assert_eq!(disconnect.reason, "client");
    assert!(!disconnect.reconnect);
    wait_status(&client, Status::Disconnected).await;
    assert!(
        broker.accept_timeout(Duration::from_millis(150)).await.is_none(),
        "no reconnect after user disconnect"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_reason_json_controls_reconnect() {
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel::<DisconnectEvent>();
    let events = SessionEvents::new().on_disconnect(move |event| {
        let _ = disc_tx.send(event);
    });
    let (client, mut broker) = spawn_client(Config::default(), events);
    client.connect().await.expect("connect accepted");
    let mut conn = broker.accept().await;
    greet(&mut conn).await;
    wait_status(&client, Status::Connected).await;

    conn.close("{\"reason\": \"shutting down\", \"reconnect\": false}");
    let disconnect = disc_rx.recv().await.expect("disconnect event");
    assert_eq!(disconnect.reason, "shutting down");
    assert!(!disconnect.reconnect);
    wait_status(&client, Status::Disconnected).await;
    assert!(
        broker.accept_timeout(Duration::from_millis(150)).await.is_none(),
        "server vetoed reconnection"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_before_connect_subscribes_on_connect() {
    let (client, mut broker) = spawn_client(Config::default(), SessionEvents::default());

    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<bool>();
    let subscription = client
        .subscribe(
            "lobby",
            rtbus::SubscriptionEvents::new().on_subscribe(move |_, recovered| {
                let _ = sub_tx.send(recovered);
            }),
        )
        .await
        .expect("subscribe registered while disconnected");
    assert_eq!(subscription.channel(), "lobby");
    assert!(client.get_sub("lobby").await.expect("get_sub").is_some());
    assert!(client.get_sub("other").await.expect("get_sub").is_none());

    client.connect().await.expect("connect accepted");
    let mut conn = broker.accept().await;
    greet(&mut conn).await;

    let frame = conn.recv().await.expect("subscribe frame");
    let commands = frame_commands(&frame);
    assert_eq!(command_method(&commands[0]), "subscribe");
    conn.send_text(format!("{{\"id\":{},\"result\":{{}}}}", command_id(&commands[0])));
    assert_eq!(sub_rx.recv().await, Some(false));

    // User unsubscribe sends UNSUBSCRIBE and clears the resubscribe flag.
    subscription.unsubscribe().await.expect("unsubscribe accepted");
    let frame = conn.recv().await.expect("unsubscribe frame");
    let commands = frame_commands(&frame);
    assert_eq!(command_method(&commands[0]), "unsubscribe");
    assert_eq!(
        commands[0]
            .get("params")
            .and_then(|p| p.get("channel"))
            .and_then(|v| v.as_str()),
        Some("lobby")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_channel_names_are_rejected() {
    let (client, _broker) = spawn_client(Config::default(), SessionEvents::default());
    let err = client
        .subscribe("", rtbus::SubscriptionEvents::new())
        .await
        .expect_err("empty channel must be rejected");
    assert!(matches!(err, rtbus::ClientError::BadChannel(_)));
}
