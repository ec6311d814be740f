//! Asterisk Manager Interface (AMI) client and CRM telephony bridge
//!
//! This crate provides an async client for the Asterisk Manager Interface
//! plus the pieces a CRM needs on top of it: call control, live queue state,
//! PBX health checks, and an HTTP ingress for telephony-provider webhooks.
//!
//! # Architecture
//!
//! - [`AmiClient`] (Clone + Send) owns one manager connection. Actions are
//!   correlated by `ActionID`, so any number may be in flight at once; list
//!   queries resolve once with every record.
//! - A background reader task parses the socket and routes responses to
//!   their waiters and events to subscribers, each on its own bounded queue.
//! - With `auto_reconnect`, a supervisor re-establishes dropped connections
//!   with exponential backoff; calls made meanwhile fail fast.
//! - [`CallControl`], [`QueueMonitor`] and [`HealthMonitor`] are thin
//!   layers over a shared client.
//! - [`webhook`] is independent of the manager connection.
//!
//! # Examples
//!
//! ## Connect and run an action
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiAction, AmiClient, AmiConnectOptions, AmiError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let client = AmiClient::connect(AmiConnectOptions::new("127.0.0.1", 5038, "crm", "secret")).await?;
//!
//!     let settings = client.execute_ok(AmiAction::new("CoreSettings")).await?;
//!     println!("Asterisk {}", settings.header("AsteriskVersion").unwrap_or("?"));
//!
//!     let channels = client.execute_ok(AmiAction::new("CoreShowChannels")).await?;
//!     println!("{} active channels", channels.events_named("CoreShowChannel").count());
//!     Ok(())
//! }
//! ```
//!
//! ## Call control
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiClient, AmiConnectOptions, CallControl, SpyMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AmiClient::connect(AmiConnectOptions::new("127.0.0.1", 5038, "crm", "secret")).await?;
//!     let calls = CallControl::new(client);
//!
//!     calls.originate("PJSIP/101", "5551234", "from-internal", Some("CRM <100>")).await?;
//!     calls.spy("PJSIP/200", "PJSIP/101", SpyMode::Whisper).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Events
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiClient, AmiConnectOptions, AmiEventType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AmiClient::connect(AmiConnectOptions::new("127.0.0.1", 5038, "crm", "secret")).await?;
//!
//!     let mut hangups = client.event_stream(AmiEventType::Hangup);
//!     while let Some(Ok(event)) = hangups.recv().await {
//!         println!("{} hung up ({:?})", event.channel().unwrap_or("?"), event.header("Cause-txt"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Command builders
//!
//! Typed builders validate their fields before anything reaches the wire:
//!
//! ```rust
//! use asterisk_ami_tokio::{AmiCommand, Originate};
//! use std::time::Duration;
//!
//! let action = Originate::to_extension("PJSIP/101", "200", "from-internal")
//!     .caller_id("Sales <100>")
//!     .ring_timeout(Duration::from_secs(20))
//!     .variable("CRM_DEAL", "42")
//!     .to_action()
//!     .unwrap();
//! assert_eq!(action.get_param("Exten"), Some("200"));
//! assert_eq!(action.get_param("Timeout"), Some("20000"));
//! ```

#[macro_use]
mod macros;

pub mod action;
pub mod call_control;
pub mod commands;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod headers;
pub mod health;
pub mod queue;
pub mod reconnect;
pub mod webhook;

pub(crate) mod buffer;
pub(crate) mod correlator;
pub(crate) mod protocol;

pub use action::{AmiAction, AmiResponse, ResponseStatus};
pub use call_control::{ActiveChannel, CallControl, OriginateResult, ParkResult};
pub use commands::{
    AmiCommand, Bridge, ChanSpy, ChannelStatus, CoreShowChannels, Hangup, Originate,
    OriginateTarget, Park, PlayDtmf, QueueAdd, QueuePause, QueuePenalty, QueueReload, QueueRemove,
    QueueStatus, Redirect, SpyMode,
};
pub use config::{BridgeConfig, ConfigError};
pub use connection::{
    AmiClient, AmiConnectOptions, AmiEventStream, ConnectionState, DisconnectReason, Subscription,
};
pub use constants::{DEFAULT_AMI_PORT, DEFAULT_AMI_TLS_PORT};
pub use error::{AmiError, AmiResult};
pub use event::{AmiEvent, AmiEventType, EventFilter};
pub use headers::{AmiHeader, AmiHeaders};
pub use health::{HealthConfig, HealthMonitor, HealthReport, HealthStatus, PeerListing};
pub use queue::{
    AlertSink, QueueAlert, QueueAlertKind, QueueMonitor, QueueMonitorConfig, QueueSnapshot,
    QueueSummary,
};
pub use reconnect::Backoff;
pub use webhook::{CrmSink, NormalizedCallEvent, WebhookError, WebhookIngress};
