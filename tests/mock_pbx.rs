//! Client tests against a scripted in-process manager socket.
//!
//! The mock speaks just enough AMI for each test: greeting, Login, and a
//! fixed reply per action name.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use asterisk_ami_tokio::queue::QueueMonitorConfig;
use asterisk_ami_tokio::{
    AmiAction, AmiClient, AmiConnectOptions, AmiError, AmiEvent, AmiEventType, CallControl,
    ConnectionState, DisconnectReason, EventFilter, HealthConfig, HealthMonitor, HealthStatus,
    QueueMonitor,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

const SECRET: &str = "s3cret";
const WAIT: Duration = Duration::from_secs(5);
/// Login as this user succeeds, then the mock hangs up.
const DROP_AFTER_LOGIN: &str = "drop-after-login";
/// Delay before the mock answers `SlowPing`.
const SLOW_REPLY: Duration = Duration::from_millis(300);

struct Block(Vec<(String, String)>);

impl Block {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

enum Reply {
    Write(String),
    WriteThenClose(String),
    Delayed(Duration, String),
    Close,
}

fn frame(pairs: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (k, v) in pairs {
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

fn success(id: &str, message: &str) -> String {
    frame(&[("Response", "Success"), ("ActionID", id), ("Message", message)])
}

fn error(id: &str, message: &str) -> String {
    frame(&[("Response", "Error"), ("ActionID", id), ("Message", message)])
}

fn list(id: &str, records: Vec<String>, complete: &str) -> String {
    let mut out = frame(&[
        ("Response", "Success"),
        ("ActionID", id),
        ("EventList", "start"),
        ("Message", "Events will follow"),
    ]);
    let count = records.len();
    for record in records {
        out.push_str(&record);
    }
    out.push_str(&frame(&[
        ("Event", complete),
        ("ActionID", id),
        ("EventList", "Complete"),
        ("ListItems", &count.to_string()),
    ]));
    out
}

fn script(action: &Block) -> Reply {
    let id = action
        .get("ActionID")
        .unwrap_or_default();
    let name = action
        .get("Action")
        .unwrap_or_default();
    let reply = match name {
        "Login" if action.get("Username") == Some(DROP_AFTER_LOGIN) => {
            return Reply::WriteThenClose(success(id, "Authentication accepted"))
        }
        "Login" if action.get("Secret") == Some(SECRET) => success(id, "Authentication accepted"),
        "Login" => error(id, "Authentication failed"),
        "Logoff" => {
            return Reply::Write(frame(&[
                ("Response", "Goodbye"),
                ("ActionID", id),
                ("Message", "Thanks for all the fish."),
            ]))
        }
        "Ping" => frame(&[("Response", "Success"), ("ActionID", id), ("Ping", "Pong")]),
        "SlowPing" => {
            return Reply::Delayed(
                SLOW_REPLY,
                frame(&[("Response", "Success"), ("ActionID", id), ("Ping", "Pong")]),
            )
        }
        "TestDisconnect" => return Reply::Close,
        "CoreShowChannels" => {
            let records = (1..=5)
                .map(|i| {
                    frame(&[
                        ("Event", "CoreShowChannel"),
                        ("ActionID", id),
                        ("Channel", &format!("PJSIP/10{}-0000000{}", i, i)),
                        ("Uniqueid", &format!("1700000000.{}", i)),
                        ("ChannelStateDesc", "Up"),
                        ("CallerIDNum", &format!("10{}", i)),
                        ("Duration", "00:00:42"),
                    ])
                })
                .collect();
            list(id, records, "CoreShowChannelsComplete")
        }
        "Originate" if action.get("Exten").is_some() => success(id, "Originate successfully queued"),
        "Originate" => error(id, "Exten not specified"),
        "Hangup" if action.get("Channel") == Some("PJSIP/missing") => error(id, "No such channel"),
        "Hangup" => success(id, "Channel Hungup"),
        "Park" => {
            let channel = action
                .get("Channel")
                .unwrap_or_default();
            let mut out = success(id, "Park successful");
            out.push_str(&frame(&[
                ("Event", "ParkedCall"),
                ("ParkeeChannel", channel),
                ("ParkingSpace", "701"),
                ("ParkingLot", "default"),
            ]));
            out
        }
        "UserEvent" => {
            let user_event = action
                .get("UserEvent")
                .unwrap_or_default();
            let mut out = success(id, "Event Sent");
            out.push_str(&frame(&[
                ("Event", "UserEvent"),
                ("Privilege", "user,all"),
                ("UserEvent", user_event),
            ]));
            out
        }
        "QueueStatus" => list(
            id,
            vec![
                frame(&[
                    ("Event", "QueueParams"),
                    ("ActionID", id),
                    ("Queue", "support"),
                    ("Strategy", "ringall"),
                    ("Calls", "1"),
                    ("Holdtime", "12"),
                    ("TalkTime", "90"),
                    ("Completed", "4"),
                    ("Abandoned", "1"),
                    ("ServiceLevel", "60"),
                    ("ServicelevelPerf", "80.0"),
                    ("Weight", "0"),
                ]),
                frame(&[
                    ("Event", "QueueMember"),
                    ("ActionID", id),
                    ("Queue", "support"),
                    ("Name", "Alice"),
                    ("Location", "PJSIP/101"),
                    ("StateInterface", "PJSIP/101"),
                    ("Status", "1"),
                    ("Paused", "0"),
                    ("InCall", "0"),
                    ("CallsTaken", "3"),
                    ("Penalty", "0"),
                ]),
                frame(&[
                    ("Event", "QueueEntry"),
                    ("ActionID", id),
                    ("Queue", "support"),
                    ("Position", "1"),
                    ("Channel", "PJSIP/555-00000001"),
                    ("Uniqueid", "1700000001.1"),
                    ("CallerIDNum", "555"),
                    ("Wait", "30"),
                ]),
            ],
            "QueueStatusComplete",
        ),
        "CoreSettings" => frame(&[
            ("Response", "Success"),
            ("ActionID", id),
            ("AMIversion", "5.0.1"),
            ("AsteriskVersion", "18.20.0"),
            ("SystemName", "pbx-test"),
        ]),
        "CoreStatus" => frame(&[
            ("Response", "Success"),
            ("ActionID", id),
            ("CoreStartupDate", "2024-01-01"),
            ("CoreStartupTime", "10:00:00"),
            ("CoreCurrentCalls", "2"),
        ]),
        "SIPpeers" => list(
            id,
            vec![
                frame(&[
                    ("Event", "PeerEntry"),
                    ("ActionID", id),
                    ("ObjectName", "101"),
                    ("Status", "OK (5 ms)"),
                ]),
                frame(&[
                    ("Event", "PeerEntry"),
                    ("ActionID", id),
                    ("ObjectName", "102"),
                    ("Status", "UNREACHABLE"),
                ]),
            ],
            "PeerlistComplete",
        ),
        _ => error(id, "Invalid/unknown command"),
    };
    Reply::Write(reply)
}

async fn read_block(reader: &mut BufReader<OwnedReadHalf>) -> Option<Block> {
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .ok()?;
        if n == 0 {
            return None;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if headers.is_empty() {
                continue;
            }
            return Some(Block(headers));
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.push((
                k.trim()
                    .to_string(),
                v.trim()
                    .to_string(),
            ));
        }
    }
}

async fn serve_session(stream: TcpStream) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    if write
        .write_all(b"Asterisk Call Manager/5.0.1\r\n")
        .await
        .is_err()
    {
        return;
    }
    while let Some(action) = read_block(&mut reader).await {
        let out = match script(&action) {
            Reply::Write(out) => out,
            Reply::Delayed(delay, out) => {
                tokio::time::sleep(delay).await;
                out
            }
            Reply::WriteThenClose(out) => {
                let _ = write
                    .write_all(out.as_bytes())
                    .await;
                return;
            }
            Reply::Close => return,
        };
        if write
            .write_all(out.as_bytes())
            .await
            .is_err()
        {
            return;
        }
    }
}

struct MockPbx {
    addr: SocketAddr,
    sessions: Arc<AtomicUsize>,
}

impl MockPbx {
    /// Accept up to `max_sessions` connections, then stop listening.
    async fn start(max_sessions: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener
            .local_addr()
            .unwrap();
        let sessions = Arc::new(AtomicUsize::new(0));
        let counter = sessions.clone();
        tokio::spawn(async move {
            for _ in 0..max_sessions {
                let Ok((stream, _)) = listener
                    .accept()
                    .await
                else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_session(stream));
            }
        });
        Self { addr, sessions }
    }

    fn options(&self, secret: &str) -> AmiConnectOptions {
        let mut options = AmiConnectOptions::new("127.0.0.1", self.addr.port(), "crm", secret);
        options.connect_timeout = Duration::from_secs(2);
        options.command_timeout = Duration::from_secs(2);
        options.reconnect_initial_delay = Duration::from_millis(50);
        options.reconnect_max_delay = Duration::from_millis(200);
        options
    }

    async fn connect(&self) -> AmiClient {
        AmiClient::connect(self.options(SECRET))
            .await
            .expect("mock login should succeed")
    }

    fn sessions(&self) -> usize {
        self.sessions
            .load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn login_and_ping() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;
    assert_eq!(client.state(), ConnectionState::Ready);
    assert!(client
        .greeting()
        .unwrap()
        .starts_with("Asterisk Call Manager/"));

    let pong = client
        .execute_ok(AmiAction::new("Ping"))
        .await
        .unwrap();
    assert_eq!(pong.header("Ping"), Some("Pong"));
    assert_eq!(client.pending_actions(), 0);

    client
        .shutdown()
        .await
        .unwrap();
}

#[tokio::test]
async fn bad_secret_is_rejected() {
    let pbx = MockPbx::start(1).await;
    let err = AmiClient::connect(pbx.options("wrong"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, AmiError::AuthFailed { ref reason } if reason == "Authentication failed"),
        "unexpected error: {:?}",
        err
    );
}

#[tokio::test]
async fn list_response_collects_every_record() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;
    let calls = CallControl::new(client.clone());

    let channels = calls
        .active_channels()
        .await
        .unwrap();
    assert_eq!(channels.len(), 5);
    assert_eq!(channels[0].channel, "PJSIP/101-00000001");
    assert_eq!(channels[4].caller_id_num.as_deref(), Some("105"));
    assert_eq!(channels[0].state.as_deref(), Some("Up"));
    assert_eq!(client.pending_actions(), 0);
}

#[tokio::test]
async fn concurrent_actions_resolve_independently() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;

    let (a, b, c) = tokio::join!(
        client.execute(AmiAction::new("Ping")),
        client.execute(AmiAction::new("CoreShowChannels")),
        client.execute(AmiAction::new("Ping")),
    );
    assert_eq!(a.unwrap().header("Ping"), Some("Pong"));
    assert_eq!(
        b.unwrap()
            .events()
            .len(),
        5
    );
    assert_eq!(c.unwrap().header("Ping"), Some("Pong"));
}

#[tokio::test]
async fn list_records_are_not_published() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;
    let mut events = client.event_stream(EventFilter::All);

    client
        .execute_ok(AmiAction::new("CoreShowChannels"))
        .await
        .unwrap();
    client
        .execute_ok(AmiAction::new("UserEvent").param("UserEvent", "CrmSync"))
        .await
        .unwrap();

    let first = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no event published")
        .unwrap()
        .unwrap();
    assert_eq!(first.event_type(), Some(AmiEventType::UserEvent));
    assert_eq!(first.header("UserEvent"), Some("CrmSync"));
}

#[tokio::test]
async fn typed_event_stream_filters() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;
    let mut parked = client.event_stream(AmiEventType::ParkedCall);
    let mut user = client.event_stream(AmiEventType::UserEvent);

    client
        .execute_ok(AmiAction::new("UserEvent").param("UserEvent", "One"))
        .await
        .unwrap();

    let event = tokio::time::timeout(WAIT, user.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.header("UserEvent"), Some("One"));
    assert!(
        tokio::time::timeout(Duration::from_millis(100), parked.recv())
            .await
            .is_err(),
        "ParkedCall stream must not see UserEvent"
    );
}

#[tokio::test]
async fn call_control_round_trips() {
    let pbx = MockPbx::start(1).await;
    let calls = CallControl::new(
        pbx.connect()
            .await,
    );

    let originated = calls
        .originate("PJSIP/101", "5551234", "from-internal", Some("CRM <100>"))
        .await
        .unwrap();
    assert_eq!(
        originated
            .message
            .as_deref(),
        Some("Originate successfully queued")
    );

    calls
        .hangup("PJSIP/101-00000001")
        .await
        .unwrap();
    let err = calls
        .hangup("PJSIP/missing")
        .await
        .unwrap_err();
    assert!(
        matches!(err, AmiError::CommandRejected { ref message } if message == "No such channel"),
        "unexpected error: {:?}",
        err
    );

    let parked = calls
        .park("PJSIP/101-00000001", None, None)
        .await
        .unwrap();
    assert_eq!(parked.parking_space.as_deref(), Some("701"));
    assert_eq!(parked.parking_lot.as_deref(), Some("default"));
}

#[tokio::test]
async fn dropped_connection_fails_pending_and_reconnects() {
    let pbx = MockPbx::start(2).await;
    let client = pbx
        .connect()
        .await;

    let err = client
        .execute(AmiAction::new("TestDisconnect"))
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::ConnectionLost), "unexpected error: {:?}", err);

    tokio::time::timeout(WAIT, async {
        while pbx.sessions() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client never reconnected");
    client
        .wait_ready(WAIT)
        .await
        .unwrap();

    assert_eq!(
        client.last_disconnect_reason(),
        Some(DisconnectReason::ConnectionClosed)
    );
    let pong = client
        .execute_ok(AmiAction::new("Ping"))
        .await
        .unwrap();
    assert_eq!(pong.header("Ping"), Some("Pong"));
}

#[tokio::test]
async fn actions_fail_fast_while_disconnected() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;
    let mut state = client.state_watch();

    let _ = client
        .execute(AmiAction::new("TestDisconnect"))
        .await;
    tokio::time::timeout(WAIT, state.wait_for(|s| *s != ConnectionState::Ready))
        .await
        .unwrap()
        .unwrap();

    let err = client
        .execute(AmiAction::new("Ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::ConnectionLost), "unexpected error: {:?}", err);

    client
        .shutdown()
        .await
        .unwrap();
    let err = client
        .execute(AmiAction::new("Ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::NotConnected), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn queue_monitor_refresh_and_events() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;
    let monitor = QueueMonitor::new(client, QueueMonitorConfig::default());

    let snapshots = monitor
        .refresh(None)
        .await
        .unwrap();
    assert_eq!(snapshots.len(), 1);
    let support = monitor
        .snapshot("support")
        .unwrap();
    assert_eq!(support.hold_time, 12);
    assert_eq!(support.members.len(), 1);
    assert_eq!(support.callers.len(), 1);
    assert!(!monitor.is_stale("support"));

    let summary = monitor
        .summary("support")
        .unwrap();
    assert_eq!(summary.calls_waiting, 1);
    assert_eq!(summary.available_agents, 1);
    assert_eq!(summary.busy_agents, 0);

    let join = AmiEvent::new("QueueCallerJoin")
        .with_header("Queue", "support")
        .with_header("Channel", "PJSIP/556-00000002")
        .with_header("Uniqueid", "1700000002.2")
        .with_header("CallerIDNum", "556")
        .with_header("Position", "2");
    assert!(monitor
        .on_event(&join)
        .await
        .unwrap());
    assert_eq!(
        monitor
            .summary("support")
            .unwrap()
            .calls_waiting,
        2
    );
    assert!(monitor
        .alerts()
        .is_empty());
}

#[tokio::test]
async fn health_report_against_mock() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;
    let health = HealthMonitor::new(client, HealthConfig::default());

    let report = health
        .full_report()
        .await;
    assert_eq!(report.connection.status, HealthStatus::Healthy);
    let channels = report
        .channels
        .unwrap();
    assert_eq!(channels.active_channels, 5);
    assert_eq!(channels.peers.total, 2);
    assert_eq!(channels.peers.online, 1);
    assert_eq!(channels.peers.offline, 1);
    // 50% online sits exactly on the degraded threshold
    assert_eq!(channels.status, HealthStatus::Degraded);
    assert_eq!(report.status, HealthStatus::Degraded);

    let system = report
        .system
        .unwrap();
    assert_eq!(system.version.as_deref(), Some("18.20.0"));
    assert_eq!(system.system_name.as_deref(), Some("pbx-test"));
    assert_eq!(system.startup.as_deref(), Some("2024-01-01 10:00:00"));
    assert_eq!(system.current_calls, 2);
}

#[tokio::test]
async fn health_report_without_connection_is_unhealthy() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;
    client
        .shutdown()
        .await
        .unwrap();

    let report = HealthMonitor::new(client, HealthConfig::default())
        .full_report()
        .await;
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert!(report
        .connection
        .error
        .is_some());
    assert!(report
        .channels
        .is_none());
}

#[tokio::test]
async fn session_dropped_right_after_login_ends_disconnected() {
    let pbx = MockPbx::start(1).await;
    let mut options = pbx.options(SECRET);
    options.username = DROP_AFTER_LOGIN.to_string();
    let client = AmiClient::connect(options)
        .await
        .expect("login itself succeeds");
    let mut state = client.state_watch();

    tokio::time::timeout(WAIT, state.wait_for(|s| *s != ConnectionState::Ready))
        .await
        .expect("client stuck in Ready after the socket closed")
        .unwrap();
    assert_eq!(
        client.last_disconnect_reason(),
        Some(DisconnectReason::ConnectionClosed)
    );
    let err = client
        .execute(AmiAction::new("Ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::ConnectionLost), "unexpected error: {:?}", err);

    client
        .shutdown()
        .await
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn timed_out_action_is_forgotten() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;
    let mut events = client.event_stream(EventFilter::All);

    let err = client
        .execute(AmiAction::new("SlowPing").timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, AmiError::Timeout { timeout_ms: 50 }),
        "unexpected error: {:?}",
        err
    );
    assert_eq!(client.pending_actions(), 0);

    // Answered after the late SlowPing reply, which must be dropped
    let pong = client
        .execute_ok(AmiAction::new("Ping"))
        .await
        .unwrap();
    assert_eq!(pong.header("Ping"), Some("Pong"));
    assert_eq!(client.pending_actions(), 0);
    assert!(client.is_ready());
    assert!(
        tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err(),
        "late response leaked to event subscribers"
    );
}

#[tokio::test]
async fn shutdown_stops_background_monitors() {
    let pbx = MockPbx::start(1).await;
    let client = pbx
        .connect()
        .await;

    let queues = Arc::new(QueueMonitor::new(
        client.clone(),
        QueueMonitorConfig {
            alert_interval: Duration::ZERO,
            ..QueueMonitorConfig::default()
        },
    ));
    let queue_task = queues.spawn();
    let health = Arc::new(
        HealthMonitor::new(client.clone(), HealthConfig::default()).with_queue_monitor(queues.clone()),
    );
    let (mut reports, health_task) = health.spawn(Duration::ZERO);

    tokio::time::timeout(WAIT, reports.wait_for(|r| r.is_some()))
        .await
        .expect("no health report produced")
        .unwrap();

    client
        .shutdown()
        .await
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client.is_shutdown());

    tokio::time::timeout(WAIT, queue_task)
        .await
        .expect("queue monitor kept running after shutdown")
        .unwrap();
    tokio::time::timeout(WAIT, health_task)
        .await
        .expect("health monitor kept running after shutdown")
        .unwrap();

    let err = client
        .execute(AmiAction::new("Ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::NotConnected), "unexpected error: {:?}", err);
}
