//! Call control: originate, hangup, transfer, park, spy
//!
//! Thin typed layer over [`AmiClient::execute`]. Required parameters are
//! validated before anything is sent; a non-success response becomes
//! [`AmiError::CommandRejected`]. Nothing here retries: an originate that
//! timed out may still have been placed by the PBX.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    action::AmiResponse,
    commands::{
        AmiCommand, Bridge, ChanSpy, ChannelStatus, CoreShowChannels, Hangup, Originate, Park,
        PlayDtmf, Redirect, SpyMode,
    },
    connection::AmiClient,
    error::AmiResult,
    event::{AmiEvent, AmiEventType},
    headers::AmiHeader,
};

/// How long [`CallControl::park`] waits for the `ParkedCall` event that
/// carries the assigned space.
const PARKED_EVENT_WAIT: Duration = Duration::from_secs(2);

/// Acknowledgment of an originate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginateResult {
    pub action_id: Option<String>,
    /// PBX message, e.g. `Originate successfully queued`.
    pub message: Option<String>,
}

impl OriginateResult {
    fn from_response(response: &AmiResponse) -> Self {
        Self {
            action_id: response
                .action_id()
                .map(str::to_string),
            message: response
                .message()
                .map(str::to_string),
        }
    }
}

/// Outcome of a park request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParkResult {
    /// Assigned space, when the `ParkedCall` event arrived in time.
    pub parking_space: Option<String>,
    pub parking_lot: Option<String>,
    pub message: Option<String>,
}

/// One `CoreShowChannel` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveChannel {
    pub channel: String,
    pub unique_id: Option<String>,
    pub linked_id: Option<String>,
    pub context: Option<String>,
    pub exten: Option<String>,
    pub state: Option<String>,
    pub caller_id_num: Option<String>,
    pub caller_id_name: Option<String>,
    pub application: Option<String>,
    /// `HH:MM:SS` as reported by the PBX.
    pub duration: Option<String>,
}

impl ActiveChannel {
    pub fn from_event(event: &AmiEvent) -> Option<Self> {
        let owned = |h: AmiHeader| {
            event
                .header(h)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            channel: owned(AmiHeader::Channel)?,
            unique_id: owned(AmiHeader::Uniqueid),
            linked_id: owned(AmiHeader::Linkedid),
            context: owned(AmiHeader::Context),
            exten: owned(AmiHeader::Exten),
            state: event
                .header("ChannelStateDesc")
                .map(str::to_string),
            caller_id_num: owned(AmiHeader::CallerIdNum),
            caller_id_name: owned(AmiHeader::CallerIdName),
            application: owned(AmiHeader::Application),
            duration: owned(AmiHeader::Duration),
        })
    }
}

/// `true` when a `ParkedCall` event belongs to `channel`.
///
/// Asterisk 12+ names the parked leg `ParkeeChannel`; older builds use
/// `Channel`.
fn parked_event_matches(event: &AmiEvent, channel: &str) -> bool {
    event
        .header("ParkeeChannel")
        .or_else(|| event.channel())
        .is_some_and(|c| c == channel)
}

/// Call-control operations over a shared [`AmiClient`].
#[derive(Debug, Clone)]
pub struct CallControl {
    client: AmiClient,
}

impl CallControl {
    pub fn new(client: AmiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &AmiClient {
        &self.client
    }

    async fn run(&self, command: &impl AmiCommand) -> AmiResult<AmiResponse> {
        let action = command.to_action()?;
        self.client
            .execute_ok(action)
            .await
    }

    /// Place a call from `channel` to `destination` in `context`.
    pub async fn originate(
        &self,
        channel: &str,
        destination: &str,
        context: &str,
        caller_id: Option<&str>,
    ) -> AmiResult<OriginateResult> {
        let mut command = Originate::to_extension(channel, destination, context);
        if let Some(caller_id) = caller_id {
            command = command.caller_id(caller_id);
        }
        self.originate_with(command)
            .await
    }

    /// Originate with full control over variables, timeout and target.
    pub async fn originate_with(&self, command: Originate) -> AmiResult<OriginateResult> {
        let response = self
            .run(&command)
            .await?;
        info!("Originate from {} accepted", command.channel);
        Ok(OriginateResult::from_response(&response))
    }

    pub async fn hangup(&self, channel: &str) -> AmiResult<()> {
        self.run(&Hangup::new(channel))
            .await?;
        info!("Hangup sent for {}", channel);
        Ok(())
    }

    pub async fn hangup_with_cause(&self, channel: &str, cause: u32) -> AmiResult<()> {
        self.run(&Hangup::new(channel).cause(cause))
            .await?;
        Ok(())
    }

    /// Blind transfer via `Redirect`.
    pub async fn transfer(&self, channel: &str, destination: &str, context: &str) -> AmiResult<()> {
        self.run(&Redirect::new(channel, destination, context))
            .await?;
        info!("Transferred {} to {}@{}", channel, destination, context);
        Ok(())
    }

    /// Park `channel`. The parking space is taken from the `ParkedCall`
    /// event that follows a successful response.
    pub async fn park(
        &self,
        channel: &str,
        lot: Option<&str>,
        timeout: Option<Duration>,
    ) -> AmiResult<ParkResult> {
        let mut command = Park::new(channel);
        if let Some(lot) = lot {
            command = command.parking_lot(lot);
        }
        if let Some(timeout) = timeout {
            command = command.timeout(timeout);
        }
        let action = command.to_action()?;

        // Subscribe before sending so the event can't slip past
        let mut parked = self
            .client
            .event_stream(AmiEventType::ParkedCall);
        let response = self
            .client
            .execute_ok(action)
            .await?;

        let wait = async {
            while let Some(item) = parked
                .recv()
                .await
            {
                if let Ok(event) = item {
                    if parked_event_matches(&event, channel) {
                        return Some(event);
                    }
                }
            }
            None
        };
        let event = tokio::time::timeout(PARKED_EVENT_WAIT, wait)
            .await
            .ok()
            .flatten();
        if event.is_none() {
            debug!("No ParkedCall event for {} within {:?}", channel, PARKED_EVENT_WAIT);
        }

        Ok(ParkResult {
            parking_space: event
                .as_ref()
                .and_then(|e| e.header(AmiHeader::ParkingSpace))
                .map(str::to_string),
            parking_lot: event
                .as_ref()
                .and_then(|e| e.header(AmiHeader::ParkingLot))
                .map(str::to_string)
                .or_else(|| lot.map(str::to_string)),
            message: response
                .message()
                .map(str::to_string),
        })
    }

    /// Connect `observer` to `target` through `ChanSpy`.
    pub async fn spy(
        &self,
        observer: &str,
        target: &str,
        mode: SpyMode,
    ) -> AmiResult<OriginateResult> {
        let response = self
            .run(&ChanSpy::new(observer, target, mode))
            .await?;
        info!("Spy on {} by {} ({:?})", target, observer, mode);
        Ok(OriginateResult::from_response(&response))
    }

    pub async fn bridge(&self, channel1: &str, channel2: &str) -> AmiResult<()> {
        self.run(&Bridge::new(channel1, channel2))
            .await?;
        Ok(())
    }

    pub async fn send_dtmf(&self, channel: &str, digit: char, duration: Duration) -> AmiResult<()> {
        self.run(&PlayDtmf::new(channel, digit).duration(duration))
            .await?;
        Ok(())
    }

    /// `Status` records for one channel.
    pub async fn channel_status(&self, channel: &str) -> AmiResult<Vec<AmiEvent>> {
        let response = self
            .run(&ChannelStatus {
                channel: Some(channel.to_string()),
            })
            .await?;
        Ok(response
            .events()
            .to_vec())
    }

    /// Every active channel (`CoreShowChannels`).
    pub async fn active_channels(&self) -> AmiResult<Vec<ActiveChannel>> {
        let response = self
            .run(&CoreShowChannels)
            .await?;
        Ok(response
            .events_named("CoreShowChannel")
            .filter_map(ActiveChannel::from_event)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_channel_from_record() {
        let event = AmiEvent::new("CoreShowChannel")
            .with_header("Channel", "PJSIP/101-00000007")
            .with_header("Uniqueid", "1700000000.7")
            .with_header("Context", "from-internal")
            .with_header("Exten", "200")
            .with_header("ChannelStateDesc", "Up")
            .with_header("CallerIDNum", "101")
            .with_header("CallerIDName", "")
            .with_header("Duration", "00:01:12");
        let channel = ActiveChannel::from_event(&event).unwrap();
        assert_eq!(channel.channel, "PJSIP/101-00000007");
        assert_eq!(channel.state.as_deref(), Some("Up"));
        assert_eq!(channel.caller_id_name, None);
        assert_eq!(channel.duration.as_deref(), Some("00:01:12"));

        assert!(ActiveChannel::from_event(&AmiEvent::new("CoreShowChannel")).is_none());
    }

    #[test]
    fn parked_event_matching() {
        let modern = AmiEvent::new("ParkedCall").with_header("ParkeeChannel", "SIP/100-01");
        let legacy = AmiEvent::new("ParkedCall").with_header("Channel", "SIP/100-01");
        assert!(parked_event_matches(&modern, "SIP/100-01"));
        assert!(parked_event_matches(&legacy, "SIP/100-01"));
        assert!(!parked_event_matches(&modern, "SIP/200-02"));
    }
}
