use std::time::{Duration, Instant};

use lbros_zmq::{Config, Payload, RemoteHost, SocketPattern, SubscriberCallback, ZmqClient};
use serde_json::json;
use tokio::{sync::mpsc, time::timeout};
use uuid::Uuid;

fn client() -> ZmqClient {
    let mut config = Config::default();
    config.network.connectivity_check_enabled = false;
    config.zmq.linger_time = 0;
    ZmqClient::new(config).unwrap()
}

fn inproc() -> String {
    format!("inproc://{}", Uuid::new_v4())
}

fn channel_callback() -> (SubscriberCallback, mpsc::UnboundedReceiver<(String, Payload)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = SubscriberCallback::with_topic(move |topic, payload| {
        tx.send((topic, payload))?;
        Ok(())
    });
    (callback, rx)
}

#[tokio::test]
async fn publish_subscribe_delivers_hello_world_exactly_once() {
    let client = client();
    client
        .create_publish_server(Some("tcp://*:5556"), None)
        .unwrap();
    client
        .create_subscribe_client(Some("tcp://127.0.0.1:5556"), None, &["news".to_string()])
        .unwrap();

    let (callback, mut rx) = channel_callback();
    client.start_subscriber_loop("sub_client", callback).unwrap();

    // PUB drops messages until the subscription has propagated.
    tokio::time::sleep(Duration::from_millis(500)).await;

    client
        .send_frames(
            "pub_server",
            vec![
                b"news".to_vec(),
                11u32.to_le_bytes().to_vec(),
                b"hello world".to_vec(),
            ],
        )
        .unwrap();

    let (topic, payload) = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "news");
    assert_eq!(payload, Payload::Text("hello world".into()));

    assert!(timeout(Duration::from_millis(300), rx.recv()).await.is_err());

    let report = client.stop().await;
    assert_eq!(report.abandoned, 0);
}

#[tokio::test]
async fn subscriber_filters_other_topics() {
    let client = client();
    let endpoint = inproc();
    client
        .create_publish_server(Some(&endpoint), None)
        .unwrap();
    client
        .create_subscribe_client(Some(&endpoint), None, &["/odom".to_string()])
        .unwrap();

    let (callback, mut rx) = channel_callback();
    client.start_subscriber_loop("sub_client", callback).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.publish_frames("pub_server", "/chatter", "ignored").unwrap();
    client
        .publish_frames("pub_server", "/odom", json!({"x": 1.5}))
        .unwrap();

    let (topic, payload) = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "/odom");
    assert_eq!(payload, Payload::Json(json!({"x": 1.5})));

    client.stop().await;
}

#[tokio::test]
async fn publish_loop_reflects_content_updates() {
    let client = client();
    let endpoint = inproc();
    client
        .create_publish_server(Some(&endpoint), None)
        .unwrap();
    client
        .create_subscribe_client(Some(&endpoint), None, &["/chatter".to_string()])
        .unwrap();
    client
        .add_publish_topic("chatter", "/chatter", "v1", 20.0)
        .unwrap();

    let (callback, mut rx) = channel_callback();
    client.start_subscriber_loop("sub_client", callback).unwrap();
    client.start_publish_loop("pub_server", "chatter").unwrap();

    let (topic, first) = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "/chatter");
    assert_eq!(first, Payload::Text("v1".into()));

    client.update_publish_content("chatter", "v2").unwrap();

    let mut seen_v2 = false;
    let mut after_v2 = 0;
    while after_v2 < 3 {
        let (_, payload) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if seen_v2 {
            assert_eq!(payload, Payload::Text("v2".into()));
            after_v2 += 1;
        } else {
            seen_v2 = payload == Payload::Text("v2".into());
        }
    }

    client.stop().await;
}

#[tokio::test]
async fn request_reply_times_out_and_restores_receive_timeout() {
    let client = client();
    let endpoint = inproc();
    client
        .create_reply_server(Some(&endpoint), None)
        .unwrap();
    client
        .create_request_client(Some(&endpoint), None)
        .unwrap();

    let started = Instant::now();
    let reply = client
        .request_reply("req_client", "ping", Duration::from_secs(1))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(reply.is_none());
    assert!(elapsed >= Duration::from_millis(900), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");
    assert_eq!(
        client.socket("req_client").unwrap().recv_timeout_ms().unwrap(),
        5000
    );

    // The socket stays usable once the server starts answering.
    client
        .start_server_loop("rep_server", lbros_zmq::loops::default_handler())
        .unwrap();
    let reply = client
        .request_reply("req_client", json!({"seq": 2}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(
        reply,
        Some(Payload::Json(json!({"status": "ok", "echo": {"seq": 2}})))
    );

    client.stop().await;
}

#[tokio::test]
async fn remote_subscriber_connects_and_starts_loop() {
    let client = client();
    client
        .update_config("network", "connectivity_check_enabled", json!(true))
        .unwrap();
    client
        .create_publish_server(Some("tcp://127.0.0.1:5792"), None)
        .unwrap();

    let remote = RemoteHost::new("127.0.0.1", 5792, SocketPattern::Subscribe).topics(["/status"]);
    let handle = client.connect_to_remote_host(&remote).await.unwrap();

    assert_eq!(handle.name(), "sub_remote");
    assert_eq!(handle.endpoint().as_deref(), Some("tcp://127.0.0.1:5792"));
    assert_eq!(client.status().loops, 1);
    assert_eq!(
        client.get_config_value("zmq", "port").unwrap(),
        Some(json!(5792))
    );

    client.stop().await;
}

#[tokio::test]
async fn connect_to_multiple_hosts_reports_each_host() {
    let client = client();
    let hosts = [
        RemoteHost::new("127.0.0.1", 5793, SocketPattern::Push),
        RemoteHost::new("127.0.0.1", 5794, SocketPattern::Publish),
    ];

    let results = client.connect_to_multiple_hosts(&hosts).await;

    assert_eq!(
        results,
        vec![
            ("127.0.0.1:5793".to_string(), true),
            ("127.0.0.1:5794".to_string(), false),
        ]
    );
    assert_eq!(client.socket_names(), vec!["push_remote".to_string()]);

    client.stop().await;
}
