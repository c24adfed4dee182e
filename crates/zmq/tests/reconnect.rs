use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use lbros_zmq::{Config, ConnectionState, PatternConfig, PatternKind, ZmqClient};

fn config(max_attempts: u32, interval: f64, endpoint: &str) -> Config {
    let mut config = Config::default();
    config.network.connectivity_check_enabled = false;
    config.zmq.linger_time = 0;
    config.zmq.reconnect_interval = interval;
    config.zmq.max_reconnect_attempts = max_attempts;
    config.patterns = vec![PatternConfig {
        endpoint: Some(endpoint.to_string()),
        ..PatternConfig::new("service", PatternKind::RepServer)
    }];
    config
}

fn blocker(endpoint: &str) -> ZmqClient {
    let mut config = Config::default();
    config.network.connectivity_check_enabled = false;
    config.zmq.linger_time = 0;
    let client = ZmqClient::new(config).unwrap();
    client
        .create_pull_server(Some(endpoint), Some("blocker"))
        .unwrap();
    client
}

#[tokio::test]
async fn start_fails_after_exactly_max_reconnect_attempts() {
    let endpoint = "tcp://127.0.0.1:5795";
    let _blocker = blocker(endpoint);
    let client = ZmqClient::new(config(3, 0.1, endpoint)).unwrap();

    let mut states = client.state();
    let seen = tokio::spawn(async move {
        let mut retries = 0;
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match state {
                ConnectionState::Reconnecting(_) => retries += 1,
                ConnectionState::Failed(_) => break,
                _ => {}
            }
        }
        retries
    });

    let started = Instant::now();
    assert!(!client.start().await);
    let elapsed = started.elapsed();

    assert_eq!(client.reconnect_attempts(), 3);
    assert!(elapsed >= Duration::from_millis(300), "gave up after {elapsed:?}");
    assert!(!client.is_running());
    assert!(client.connection_state().is_terminal());
    assert!(client.socket_names().is_empty());
    assert_eq!(seen.await.unwrap(), 3);
}

#[tokio::test]
async fn start_without_auto_reconnect_fails_once() {
    let endpoint = "tcp://127.0.0.1:5796";
    let _blocker = blocker(endpoint);
    let mut config = config(3, 0.1, endpoint);
    config.zmq.auto_reconnect = false;
    let client = ZmqClient::new(config).unwrap();

    let started = Instant::now();
    assert!(!client.start().await);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(client.reconnect_attempts(), 0);
}

#[tokio::test]
async fn start_recovers_once_endpoint_is_released() {
    let endpoint = "tcp://127.0.0.1:5797";
    let blocker = Arc::new(blocker(endpoint));
    let client = ZmqClient::new(config(20, 0.1, endpoint)).unwrap();

    let releaser = Arc::clone(&blocker);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        releaser.close_socket("blocker").await.unwrap();
    });

    assert!(client.start().await);
    assert!(client.is_running());
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(client.socket_names(), vec!["service".to_string()]);

    client.stop().await;
    assert_eq!(client.connection_state(), ConnectionState::Idle);
}
