//! Typed header names for AMI responses, list records and events.

use serde::{Deserialize, Serialize};

/// Error returned when parsing an unrecognized header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAmiHeaderError(pub String);

impl std::fmt::Display for ParseAmiHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown AMI header: {}", self.0)
    }
}

impl std::error::Error for ParseAmiHeaderError {}

define_header_enum! {
    error_type: ParseAmiHeaderError,
    /// Payload header names used by the queue, call-control and health
    /// layers.
    ///
    /// Framing headers (`Action`, `ActionID`, `Response`, `Event`,
    /// `EventList`) live in [`constants`](crate::constants). Use with
    /// [`AmiEvent::header()`](crate::AmiEvent::header) or
    /// [`AmiResponse::header()`](crate::AmiResponse::header).
    pub enum AmiHeader {
        Message => "Message",
        Privilege => "Privilege",
        Queue => "Queue",
        Interface => "Interface",
        StateInterface => "StateInterface",
        MemberName => "MemberName",
        Name => "Name",
        Location => "Location",
        Membership => "Membership",
        Penalty => "Penalty",
        CallsTaken => "CallsTaken",
        LastCall => "LastCall",
        InCall => "InCall",
        Status => "Status",
        Paused => "Paused",
        PausedReason => "PausedReason",
        Position => "Position",
        Wait => "Wait",
        Count => "Count",
        HoldTime => "HoldTime",
        TalkTime => "TalkTime",
        Member => "Member",
        Strategy => "Strategy",
        Calls => "Calls",
        Max => "Max",
        Completed => "Completed",
        Abandoned => "Abandoned",
        ServiceLevel => "ServiceLevel",
        ServiceLevelPerf => "ServicelevelPerf",
        Weight => "Weight",
        Channel => "Channel",
        Uniqueid => "Uniqueid",
        Linkedid => "Linkedid",
        CallerIdNum => "CallerIDNum",
        CallerIdName => "CallerIDName",
        ConnectedLineNum => "ConnectedLineNum",
        Exten => "Exten",
        Context => "Context",
        Priority => "Priority",
        Application => "Application",
        Duration => "Duration",
        ParkingSpace => "ParkingSpace",
        ParkingLot => "Parkinglot",
        Reason => "Reason",
        Cause => "Cause",
        CauseTxt => "Cause-txt",
        ObjectName => "ObjectName",
        DeviceState => "DeviceState",
        ListItems => "ListItems",
        AsteriskVersion => "AsteriskVersion",
        SystemName => "SystemName",
        CoreStartupDate => "CoreStartupDate",
        CoreStartupTime => "CoreStartupTime",
        CoreReloadTime => "CoreReloadTime",
        CoreCurrentCalls => "CoreCurrentCalls",
    }
}

/// Ordered header list of one AMI block.
///
/// AMI allows repeated keys (`Variable`, `ChanVariable`, `Output`) and
/// clients differ in key casing, so lookups are case-insensitive and return
/// the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AmiHeaders(Vec<(String, String)>);

impl AmiHeaders {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.get(name)
            .is_some()
    }

    /// Append a header, keeping earlier values with the same key.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0
            .push((name.into(), value.into()));
    }

    /// Replace the first value for `name`, or append it.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .0
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self
                .0
                .push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.0
            .is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AmiHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_wire_spelling() {
        assert_eq!(AmiHeader::CallerIdNum.to_string(), "CallerIDNum");
        assert_eq!(AmiHeader::ServiceLevelPerf.to_string(), "ServicelevelPerf");
        assert_eq!(AmiHeader::ParkingLot.to_string(), "Parkinglot");
    }

    #[test]
    fn as_ref_str() {
        let h: &str = AmiHeader::Queue.as_ref();
        assert_eq!(h, "Queue");
    }

    #[test]
    fn from_str_case_insensitive() {
        assert_eq!("CALLERIDNUM".parse::<AmiHeader>(), Ok(AmiHeader::CallerIdNum));
        assert_eq!("parkinglot".parse::<AmiHeader>(), Ok(AmiHeader::ParkingLot));
    }

    #[test]
    fn from_str_unknown() {
        let err = "X-Custom-Not-In-Enum".parse::<AmiHeader>();
        assert_eq!(
            err.unwrap_err()
                .to_string(),
            "unknown AMI header: X-Custom-Not-In-Enum"
        );
    }

    #[test]
    fn headers_lookup_is_case_insensitive() {
        let headers: AmiHeaders = [("ActionID", "7"), ("Variable", "a=1"), ("Variable", "b=2")]
            .into_iter()
            .collect();
        assert_eq!(headers.get("actionid"), Some("7"));
        assert_eq!(
            headers
                .get_all("variable")
                .collect::<Vec<_>>(),
            vec!["a=1", "b=2"]
        );
        assert!(!headers.contains("Event"));
    }

    #[test]
    fn headers_set_replaces_first() {
        let mut headers = AmiHeaders::new();
        headers.push("Status", "1");
        headers.set("status", "2");
        assert_eq!(headers.get(AmiHeader::Status), Some("2"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn from_str_round_trip_all_variants() {
        for v in AmiHeader::ALL {
            let wire = v.to_string();
            let parsed: AmiHeader = wire
                .parse()
                .unwrap();
            assert_eq!(parsed, *v, "round-trip failed for {wire}");
        }
    }
}
