//! Integration tests against a live Asterisk instance.
//!
//! These tests need a manager account on the target PBX. Defaults match a
//! local test box; override with AMI_HOST, AMI_PORT, AMI_USER, AMI_SECRET.
//! Run with: cargo test --test live_asterisk -- --ignored

use std::sync::Arc;
use std::time::Duration;

use asterisk_ami_tokio::queue::QueueMonitorConfig;
use asterisk_ami_tokio::{
    AmiAction, AmiClient, AmiConnectOptions, AmiEventType, CallControl, HealthConfig, HealthMonitor,
    HealthStatus, QueueMonitor,
};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

async fn connect() -> AmiClient {
    let port = env_or("AMI_PORT", "5038")
        .parse()
        .expect("AMI_PORT must be a port number");
    let mut options = AmiConnectOptions::new(
        env_or("AMI_HOST", "127.0.0.1"),
        port,
        env_or("AMI_USER", "admin"),
        env_or("AMI_SECRET", "admin"),
    );
    options.command_timeout = Duration::from_secs(10);
    AmiClient::connect(options)
        .await
        .expect("failed to connect to Asterisk")
}

#[tokio::test]
#[ignore]
async fn live_connect_and_core_settings() {
    let client = connect().await;
    assert!(client.is_ready());

    let settings = client
        .execute_ok(AmiAction::new("CoreSettings"))
        .await
        .unwrap();
    assert!(
        settings
            .header("AsteriskVersion")
            .is_some(),
        "CoreSettings without AsteriskVersion: {:?}",
        settings
    );

    client
        .shutdown()
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn live_active_channels_list() {
    let client = connect().await;
    let calls = CallControl::new(client.clone());

    let channels = calls
        .active_channels()
        .await
        .unwrap();
    for channel in &channels {
        assert!(!channel
            .channel
            .is_empty());
    }
    assert_eq!(client.pending_actions(), 0);
}

#[tokio::test]
#[ignore]
async fn live_user_event_round_trip() {
    let client = connect().await;
    let mut events = client.event_stream(AmiEventType::UserEvent);

    client
        .execute_ok(AmiAction::new("UserEvent").param("UserEvent", "AmiTokioLiveTest"))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timeout waiting for UserEvent")
        .expect("stream closed")
        .expect("event error");
    assert_eq!(event.header("UserEvent"), Some("AmiTokioLiveTest"));
}

#[tokio::test]
#[ignore]
async fn live_queue_refresh() {
    let client = connect().await;
    let monitor = Arc::new(QueueMonitor::new(client, QueueMonitorConfig::default()));

    let snapshots = monitor
        .refresh(None)
        .await
        .unwrap();
    for snapshot in &snapshots {
        assert!(!monitor.is_stale(&snapshot.name));
        assert!(monitor
            .summary(&snapshot.name)
            .is_some());
    }
}

#[tokio::test]
#[ignore]
async fn live_health_report() {
    let client = connect().await;
    let report = HealthMonitor::new(client, HealthConfig::default())
        .full_report()
        .await;

    assert_eq!(report.connection.status, HealthStatus::Healthy);
    assert!(report
        .connection
        .response_time_ms
        .is_some());
    assert!(report
        .system
        .is_some());
}
