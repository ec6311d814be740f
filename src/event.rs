//! AMI event types and structures

use crate::constants::{HEADER_ACTION_ID, HEADER_EVENT, HEADER_EVENT_LIST, EVENT_LIST_COMPLETE};
use crate::headers::{AmiHeader, AmiHeaders};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Generates `AmiEventType` enum with `Display`, `FromStr`, and `parse_event_type`.
macro_rules! ami_event_types {
    (
        $(
            $(#[$attr:meta])*
            $variant:ident => $wire:literal
        ),+ $(,)?
    ) => {
        /// Asterisk manager events the bridge understands.
        ///
        /// Variant names follow the wire names (`QueueCallerJoin` =
        /// `QueueCallerJoin`). Events outside this list are still delivered,
        /// with [`AmiEvent::event_type`] returning `None`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[non_exhaustive]
        #[allow(missing_docs)]
        pub enum AmiEventType {
            $(
                $(#[$attr])*
                $variant,
            )+
        }

        impl fmt::Display for AmiEventType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $( AmiEventType::$variant => $wire, )+
                };
                f.write_str(name)
            }
        }

        impl AmiEventType {
            /// Parse event type from wire name (case-insensitive).
            pub fn parse_event_type(s: &str) -> Option<Self> {
                $(
                    if s.eq_ignore_ascii_case($wire) {
                        return Some(AmiEventType::$variant);
                    }
                )+
                None
            }
        }

        impl FromStr for AmiEventType {
            type Err = ParseEventTypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse_event_type(s).ok_or_else(|| ParseEventTypeError(s.to_string()))
            }
        }
    };
}

ami_event_types! {
    // Queue state
    QueueCallerJoin => "QueueCallerJoin",
    QueueCallerLeave => "QueueCallerLeave",
    QueueCallerAbandon => "QueueCallerAbandon",
    QueueMemberStatus => "QueueMemberStatus",
    QueueMemberAdded => "QueueMemberAdded",
    QueueMemberRemoved => "QueueMemberRemoved",
    /// Asterisk 13+ name.
    QueueMemberPause => "QueueMemberPause",
    /// Asterisk 11 name.
    QueueMemberPaused => "QueueMemberPaused",
    QueueMemberPenalty => "QueueMemberPenalty",
    AgentCalled => "AgentCalled",
    AgentConnect => "AgentConnect",
    AgentComplete => "AgentComplete",
    AgentRingNoAnswer => "AgentRingNoAnswer",
    // QueueStatus list records
    QueueParams => "QueueParams",
    QueueMember => "QueueMember",
    QueueEntry => "QueueEntry",
    QueueStatusComplete => "QueueStatusComplete",
    // Channel and peer listings
    CoreShowChannel => "CoreShowChannel",
    CoreShowChannelsComplete => "CoreShowChannelsComplete",
    PeerEntry => "PeerEntry",
    PeerlistComplete => "PeerlistComplete",
    EndpointList => "EndpointList",
    EndpointListComplete => "EndpointListComplete",
    Status => "Status",
    StatusComplete => "StatusComplete",
    // Call lifecycle
    Newchannel => "Newchannel",
    Newstate => "Newstate",
    Hangup => "Hangup",
    DialBegin => "DialBegin",
    DialEnd => "DialEnd",
    BridgeEnter => "BridgeEnter",
    BridgeLeave => "BridgeLeave",
    ParkedCall => "ParkedCall",
    UnParkedCall => "UnParkedCall",
    ParkedCallTimeOut => "ParkedCallTimeOut",
    ChanSpyStart => "ChanSpyStart",
    ChanSpyStop => "ChanSpyStop",
    OriginateResponse => "OriginateResponse",
    VarSet => "VarSet",
    UserEvent => "UserEvent",
    // System
    FullyBooted => "FullyBooted",
    Shutdown => "Shutdown",
    Reload => "Reload",
    PeerStatus => "PeerStatus",
    ContactStatus => "ContactStatus",
}

/// Error returned when parsing an unknown event type string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventTypeError(pub String);

impl fmt::Display for ParseEventTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventTypeError {}

/// AMI event: the `Event` name plus every header of the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiEvent {
    name: String,
    event_type: Option<AmiEventType>,
    headers: AmiHeaders,
}

impl AmiEvent {
    /// Create an event with the given wire name and no headers.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut headers = AmiHeaders::new();
        headers.push(HEADER_EVENT, name.clone());
        Self {
            event_type: AmiEventType::parse_event_type(&name),
            name,
            headers,
        }
    }

    /// Build an event from a parsed header block. Returns `None` when the
    /// block has no `Event` header.
    pub fn from_headers(headers: AmiHeaders) -> Option<Self> {
        let name = headers
            .get(HEADER_EVENT)?
            .to_string();
        Some(Self {
            event_type: AmiEventType::parse_event_type(&name),
            name,
            headers,
        })
    }

    /// Builder-style header setter, handy for tests and synthetic events.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .set(name, value);
        self
    }

    /// Raw event name as sent by the PBX.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parsed event type, if recognized.
    pub fn event_type(&self) -> Option<AmiEventType> {
        self.event_type
    }

    /// Look up a header (case-insensitive).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name)
    }

    /// Header parsed into any `FromStr` type; `None` when absent or malformed.
    pub fn header_as<T: FromStr>(&self, name: impl AsRef<str>) -> Option<T> {
        self.header(name)?
            .trim()
            .parse()
            .ok()
    }

    /// All headers of the block.
    pub fn headers(&self) -> &AmiHeaders {
        &self.headers
    }

    /// `ActionID` for list records belonging to a pending action.
    pub fn action_id(&self) -> Option<&str> {
        self.header(HEADER_ACTION_ID)
    }

    /// `true` when this event closes a multi-part list response.
    pub fn is_list_complete(&self) -> bool {
        self.header(HEADER_EVENT_LIST)
            .is_some_and(|v| v.eq_ignore_ascii_case(EVENT_LIST_COMPLETE))
    }

    /// `Queue` header.
    pub fn queue(&self) -> Option<&str> {
        self.header(AmiHeader::Queue)
    }

    /// `Channel` header.
    pub fn channel(&self) -> Option<&str> {
        self.header(AmiHeader::Channel)
    }

    /// `Uniqueid` header.
    pub fn unique_id(&self) -> Option<&str> {
        self.header(AmiHeader::Uniqueid)
    }
}

/// Selects which events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Every event.
    All,
    /// Events whose name matches (case-insensitive).
    Named(String),
}

impl EventFilter {
    pub fn named(name: impl Into<String>) -> Self {
        EventFilter::Named(name.into())
    }

    pub fn matches(&self, event: &AmiEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Named(name) => name.eq_ignore_ascii_case(event.name()),
        }
    }
}

impl From<AmiEventType> for EventFilter {
    fn from(event_type: AmiEventType) -> Self {
        EventFilter::Named(event_type.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_event_type_case_insensitive() {
        assert_eq!(
            AmiEventType::parse_event_type("queuecallerjoin"),
            Some(AmiEventType::QueueCallerJoin)
        );
        assert_eq!(
            "PeerEntry".parse::<AmiEventType>(),
            Ok(AmiEventType::PeerEntry)
        );
        assert!("NotAnEvent"
            .parse::<AmiEventType>()
            .is_err());
    }

    #[test]
    fn from_headers_requires_event_name() {
        let headers: AmiHeaders = [("Response", "Success")]
            .into_iter()
            .collect();
        assert!(AmiEvent::from_headers(headers).is_none());

        let headers: AmiHeaders = [("Event", "Hangup"), ("Channel", "SIP/100-0001")]
            .into_iter()
            .collect();
        let event = AmiEvent::from_headers(headers).unwrap();
        assert_eq!(event.event_type(), Some(AmiEventType::Hangup));
        assert_eq!(event.channel(), Some("SIP/100-0001"));
    }

    #[test]
    fn unknown_event_keeps_raw_name() {
        let event = AmiEvent::new("MixMonitorStart");
        assert_eq!(event.event_type(), None);
        assert_eq!(event.name(), "MixMonitorStart");
        assert_eq!(event.header("Event"), Some("MixMonitorStart"));
    }

    #[test]
    fn header_as_parses_numbers() {
        let event = AmiEvent::new("QueueEntry")
            .with_header("Wait", " 42 ")
            .with_header("Position", "x");
        assert_eq!(event.header_as::<u64>("Wait"), Some(42));
        assert_eq!(event.header_as::<u32>("Position"), None);
    }

    #[test]
    fn list_complete_detection() {
        let done = AmiEvent::new("QueueStatusComplete").with_header("EventList", "Complete");
        let record = AmiEvent::new("QueueMember");
        assert!(done.is_list_complete());
        assert!(!record.is_list_complete());
    }

    #[test]
    fn filter_matching() {
        let event = AmiEvent::new("QueueCallerJoin");
        assert!(EventFilter::All.matches(&event));
        assert!(EventFilter::from(AmiEventType::QueueCallerJoin).matches(&event));
        assert!(EventFilter::named("queuecallerjoin").matches(&event));
        assert!(!EventFilter::named("Hangup").matches(&event));
    }
}
