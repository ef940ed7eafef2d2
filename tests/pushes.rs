use std::sync::Arc;
use std::time::Duration;

use rtbus::client::Client;
use rtbus::core::config::Config;
use rtbus::protocol::codec_for_url;
use rtbus::session::SessionEvents;
use rtbus::testing::{
    BrokerConnection, FixedDelay, MockBroker, MockPoster, MockTransport, command_id,
    command_method, frame_commands,
};
use rtbus::{Status, SubscriptionEvents};
use sonic_rs::JsonValueTrait;
use tokio::sync::mpsc;

fn spawn_client(events: SessionEvents) -> (Client<MockTransport>, MockBroker) {
    let (transport, broker) = MockTransport::pair();
    let client = Client::with_parts(
        "ws://mock",
        Config::default(),
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

async fn subscribe_ok(
    client: &Client<MockTransport>,
    conn: &mut BrokerConnection,
    channel: &str,
    events: SubscriptionEvents,
) -> rtbus::Subscription<MockTransport> {
    let subscription = client
        .subscribe(channel, events)
        .await
        .expect("subscribe accepted");
    let frame = conn.recv().await.expect("subscribe frame");
    let commands = frame_commands(&frame);
    assert_eq!(command_method(&commands[0]), "subscribe");
    conn.send_text(format!("{{\"id\":{},\"result\":{{}}}}", command_id(&commands[0])));
    subscription
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_leave_and_server_unsub_route_to_the_subscription() {
    let (client, mut broker) = spawn_client(SessionEvents::default());
    client.connect().await.expect("connect accepted");
    let mut conn = broker.accept().await;
    greet(&mut conn).await;
    wait_status(&client, Status::Connected).await;

    #[derive(Debug, PartialEq)]
    enum Ev {
        Join(String),
        Leave(String),
        Unsubscribed,
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<Ev>();
    let join_tx = tx.clone();
    let leave_tx = tx.clone();
    let events = SubscriptionEvents::new()
        .on_join(move |_, info| {
            let _ = join_tx.send(Ev::Join(info.user));
        })
        .on_leave(move |_, info| {
            let _ = leave_tx.send(Ev::Leave(info.user));
        })
        .on_unsubscribe(move |_| {
            let _ = tx.send(Ev::Unsubscribed);
        });
    subscribe_ok(&client, &mut conn, "room", events).await;

    conn.send_text(
        "{\"result\":{\"type\":1,\"channel\":\"room\",\"data\":{\"user\":\"alice\",\"client\":\"a1\"}}}",
    );
    conn.send_text(
        "{\"result\":{\"type\":2,\"channel\":\"room\",\"data\":{\"user\":\"alice\",\"client\":\"a1\"}}}",
    );
    conn.send_text("{\"result\":{\"type\":3,\"channel\":\"room\",\"data\":{}}}");

    assert_eq!(rx.recv().await, Some(Ev::Join("alice".to_string())));
    assert_eq!(rx.recv().await, Some(Ev::Leave("alice".to_string())));
    assert_eq!(rx.recv().await, Some(Ev::Unsubscribed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn channelless_message_pushes_reach_the_session_handler() {
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<sonic_rs::Value>();
    let events = SessionEvents::new().on_message(move |data| {
        let _ = msg_tx.send(data);
    });
    let (client, mut broker) = spawn_client(events);
    client.connect().await.expect("connect accepted");
    let mut conn = broker.accept().await;
    greet(&mut conn).await;
    wait_status(&client, Status::Connected).await;

    conn.send_text("{\"result\":{\"type\":4,\"channel\":\"\",\"data\":{\"hello\":\"world\"}}}");
    let message = msg_rx.recv().await.expect("message event");
    assert_eq!(message.get("hello").and_then(|v| v.as_str()), Some("world"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_presence_and_history_round_trip() {
    let (client, mut broker) = spawn_client(SessionEvents::default());
    client.connect().await.expect("connect accepted");
    let mut conn = broker.accept().await;
    greet(&mut conn).await;
    wait_status(&client, Status::Connected).await;

    let subscription = subscribe_ok(
        &client,
        &mut conn,
        "board",
        SubscriptionEvents::new(),
    )
    .await;

    let publish_task = tokio::spawn({
        let subscription = subscription.clone();
        async move {
            subscription
                .publish(sonic_rs::from_str("{\"move\":\"e4\"}").unwrap())
                .await
        }
    });
    let frame = conn.recv().await.expect("publish frame");
    let commands = frame_commands(&frame);
    assert_eq!(command_method(&commands[0]), "publish");
    assert_eq!(
        commands[0]
            .get("params")
            .and_then(|p| p.get("channel"))
            .and_then(|v| v.as_str()),
        Some("board")
    );
    conn.send_text(format!("{{\"id\":{},\"result\":{{}}}}", command_id(&commands[0])));
    publish_task.await.expect("join").expect("publish ok");

    let presence_task = tokio::spawn({
        let subscription = subscription.clone();
        async move { subscription.presence().await }
    });
    let frame = conn.recv().await.expect("presence frame");
    let commands = frame_commands(&frame);
    assert_eq!(command_method(&commands[0]), "presence");
    conn.send_text(format!(
        "{{\"id\":{},\"result\":{{\"data\":{{\"a1\":{{\"user\":\"alice\",\"client\":\"a1\"}}}}}}}}",
        command_id(&commands[0])
    ));
    let presence = presence_task.await.expect("join").expect("presence ok");
    assert_eq!(presence.data.len(), 1);
    assert_eq!(presence.data.get("a1").expect("member").user, "alice");

    let history_task = tokio::spawn({
        let subscription = subscription.clone();
        async move { subscription.history().await }
    });
    let frame = conn.recv().await.expect("history frame");
    let commands = frame_commands(&frame);
    assert_eq!(command_method(&commands[0]), "history");
    conn.send_text(format!(
        "{{\"id\":{},\"result\":{{\"data\":[{{\"uid\":\"u1\",\"data\":{{}}}},{{\"uid\":\"u2\",\"data\":{{}}}}]}}}}",
        command_id(&commands[0])
    ));
    let history = history_task.await.expect("join").expect("history ok");
    assert_eq!(history.data.len(), 2);
    assert_eq!(history.data[0].uid, "u1");
}
