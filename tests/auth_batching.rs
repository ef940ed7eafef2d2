use std::sync::Arc;
use std::time::Duration;

use rtbus::client::Client;
use rtbus::core::config::Config;
use rtbus::protocol::codec_for_url;
use rtbus::session::SessionEvents;
use rtbus::testing::{
    FixedDelay, MockBroker, MockPoster, MockTransport, command_id, command_method, frame_commands,
};
use rtbus::{ClientError, Status, SubscriptionEvents};
use sonic_rs::JsonValueTrait;
use tokio::sync::mpsc;

fn spawn_client(poster: MockPoster) -> (Client<MockTransport>, MockBroker) {
    let (transport, broker) = MockTransport::pair();
    let client = Client::with_parts(
        "ws://mock",
        Config::default(),
        SessionEvents::default(),
        transport,
        codec_for_url("ws://mock"),
        Arc::new(poster),
        Some(Box::new(FixedDelay(Duration::from_millis(20)))),
    );
    (client, broker)
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
async fn private_subscribes_share_one_auth_post_and_one_frame() {
    let poster = MockPoster::new(|url, _| {
        assert_eq!(url, "/centrifuge/auth");
        Ok(sonic_rs::from_str(
            "{\"$news\":{\"info\":{\"role\":\"reader\"},\"sign\":\"s1\"},\"$chat\":{\"sign\":\"s2\"}}",
        )
        .unwrap())
    });
    let (client, mut broker) = spawn_client(poster.clone());
    client.connect().await.expect("connect accepted");

    let mut conn = broker.accept().await;
    let frame = conn.recv().await.expect("connect frame");
    let connect_id = command_id(&frame_commands(&frame)[0]);
    conn.send_text(format!("{{\"id\":{connect_id},\"result\":{{\"client\":\"cid-9\"}}}}"));
    wait_status(&client, Status::Connected).await;

    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
    client.start_auth_batching().await.expect("start auth batching");
    for channel in ["$news", "$chat"] {
        let tx = sub_tx.clone();
        client
            .subscribe(
                channel,
                SubscriptionEvents::new()
                    .on_subscribe(move |channel, _recovered| {
                        let _ = tx.send(channel.to_string());
                    }),
            )
            .await
            .expect("subscribe accepted");
    }
    client.stop_auth_batching().await.expect("stop auth batching");

    // Exactly one frame carrying both SUBSCRIBE commands, in subscribe order.
    let frame = conn.recv().await.expect("subscribe frame");
    let commands = frame_commands(&frame);
    assert_eq!(commands.len(), 2, "both subscribes share one frame");
    for (command, (channel, sign)) in commands.iter().zip([("$news", "s1"), ("$chat", "s2")]) {
        assert_eq!(command_method(command), "subscribe");
        let params = command.get("params").expect("params");
        assert_eq!(params.get("channel").and_then(|v| v.as_str()), Some(channel));
        assert_eq!(params.get("client").and_then(|v| v.as_str()), Some("cid-9"));
        assert_eq!(params.get("sign").and_then(|v| v.as_str()), Some(sign));
        conn.send_text(format!("{{\"id\":{},\"result\":{{}}}}", command_id(command)));
    }

    let mut subscribed = vec![
        sub_rx.recv().await.expect("first subscribe event"),
        sub_rx.recv().await.expect("second subscribe event"),
    ];
    subscribed.sort();
    assert_eq!(subscribed, vec!["$chat".to_string(), "$news".to_string()]);

    // Exactly one authorization POST with both channels.
    let requests = poster.requests();
    assert_eq!(requests.len(), 1);
    let body = &requests[0].body;
    assert_eq!(body.get("client").and_then(|v| v.as_str()), Some("cid-9"));
    let channels: Vec<String> = sonic_rs::from_str(
        &sonic_rs::to_string(body.get("channels").expect("channels")).unwrap(),
    )
    .unwrap();
    assert_eq!(channels, vec!["$news".to_string(), "$chat".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_grants_fail_only_their_channel() {
    let poster = MockPoster::new(|_, _| {
        Ok(sonic_rs::from_str("{\"$ok\":{\"sign\":\"s\"},\"$denied\":{\"status\":403}}").unwrap())
    });
    let (client, mut broker) = spawn_client(poster);
    client.connect().await.expect("connect accepted");

    let mut conn = broker.accept().await;
    let frame = conn.recv().await.expect("connect frame");
    let connect_id = command_id(&frame_commands(&frame)[0]);
    conn.send_text(format!("{{\"id\":{connect_id},\"result\":{{\"client\":\"c\"}}}}"));
    wait_status(&client, Status::Connected).await;

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    client.start_auth_batching().await.expect("start auth batching");
    for channel in ["$ok", "$denied", "$absent"] {
        let tx = err_tx.clone();
        client
            .subscribe(
                channel,
                SubscriptionEvents::new().on_error(move |channel, error| {
                    let _ = tx.send((channel.to_string(), error.clone()));
                }),
            )
            .await
            .expect("subscribe accepted");
    }
    client.stop_auth_batching().await.expect("stop auth batching");

    // Only the granted channel produces a SUBSCRIBE command.
    let frame = conn.recv().await.expect("subscribe frame");
    let commands = frame_commands(&frame);
    assert_eq!(commands.len(), 1);
    assert_eq!(
        commands[0]
            .get("params")
            .and_then(|p| p.get("channel"))
            .and_then(|v| v.as_str()),
        Some("$ok")
    );

    let mut failed = vec![
        err_rx.recv().await.expect("first error"),
        err_rx.recv().await.expect("second error"),
    ];
    failed.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(failed[0].0, "$absent");
    assert_eq!(failed[1].0, "$denied");
    for (_, error) in failed {
        assert_eq!(error, ClientError::AuthorizationFailed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_request_failure_fails_every_batched_channel() {
    let poster = MockPoster::new(|_, _| Err(ClientError::Http("boom".to_string())));
    let (client, mut broker) = spawn_client(poster);
    client.connect().await.expect("connect accepted");

    let mut conn = broker.accept().await;
    let frame = conn.recv().await.expect("connect frame");
    let connect_id = command_id(&frame_commands(&frame)[0]);
    conn.send_text(format!("{{\"id\":{connect_id},\"result\":{{\"client\":\"c\"}}}}"));
    wait_status(&client, Status::Connected).await;

    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    client.start_auth_batching().await.expect("start auth batching");
    for channel in ["$a", "$b"] {
        let tx = err_tx.clone();
        client
            .subscribe(
                channel,
                SubscriptionEvents::new().on_error(move |channel, error| {
                    let _ = tx.send((channel.to_string(), error.clone()));
                }),
            )
            .await
            .expect("subscribe accepted");
    }
    client.stop_auth_batching().await.expect("stop auth batching");

    for _ in 0..2 {
        let (_, error) = err_rx.recv().await.expect("error event");
        assert_eq!(error, ClientError::AuthorizationFailed);
        assert_eq!(error.to_string(), "authorization request failed");
    }
}
