//! Actions and their correlated responses

use crate::{
    constants::{HEADER_ACTION, HEADER_ACTION_ID, HEADER_MESSAGE, HEADER_RESPONSE, LINE_TERMINATOR},
    error::{AmiError, AmiResult},
    event::AmiEvent,
    headers::AmiHeaders,
};
use std::fmt;
use std::time::Duration;

/// Validate that a user-provided string contains no newline characters.
///
/// AMI frames are line-delimited; embedded newlines would allow injection
/// of arbitrary headers or whole actions.
pub(crate) fn validate_no_newlines(s: &str, context: &str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AmiError::invalid_argument(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// Parameter keys whose values never reach the logs.
const SECRET_KEYS: &[&str] = &["Secret", "Key"];

/// Outgoing manager command.
///
/// ```
/// use asterisk_ami_tokio::AmiAction;
/// use std::time::Duration;
///
/// let action = AmiAction::new("Hangup")
///     .param("Channel", "PJSIP/100-00000001")
///     .timeout(Duration::from_secs(2));
/// let wire = action.to_wire_format("42").unwrap();
/// assert_eq!(wire, "Action: Hangup\r\nActionID: 42\r\nChannel: PJSIP/100-00000001\r\n\r\n");
/// ```
#[derive(Clone)]
pub struct AmiAction {
    name: String,
    params: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl AmiAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            timeout: None,
        }
    }

    /// Append a parameter. Repeated keys (e.g. `Variable`) are kept in order.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .push((key.into(), value.into()));
        self
    }

    /// Append a parameter only when `value` is `Some`.
    pub fn param_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.param(key, v),
            None => self,
        }
    }

    /// Per-action response deadline, overriding the client default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// First value for a parameter key (case-insensitive).
    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Validate all user-supplied fields, then convert to wire format.
    ///
    /// Caller-supplied `ActionID` parameters are dropped; the correlator owns
    /// identifiers.
    pub fn to_wire_format(&self, action_id: &str) -> AmiResult<String> {
        use std::fmt::Write;

        if self
            .name
            .trim()
            .is_empty()
        {
            return Err(AmiError::invalid_argument("action name must not be empty"));
        }
        validate_no_newlines(&self.name, "action name")?;
        validate_no_newlines(action_id, "action id")?;

        let mut out = String::with_capacity(64 + self.params.len() * 32);
        let _ = write!(out, "{}: {}{}", HEADER_ACTION, self.name, LINE_TERMINATOR);
        let _ = write!(out, "{}: {}{}", HEADER_ACTION_ID, action_id, LINE_TERMINATOR);
        for (key, value) in &self.params {
            validate_no_newlines(key, "parameter name")?;
            validate_no_newlines(value, "parameter value")?;
            if key.contains(':') || key.trim().is_empty() {
                return Err(AmiError::invalid_argument(format!(
                    "invalid parameter name '{}'",
                    key
                )));
            }
            if key.eq_ignore_ascii_case(HEADER_ACTION_ID) {
                continue;
            }
            let _ = write!(out, "{}: {}{}", key, value, LINE_TERMINATOR);
        }
        out.push_str(LINE_TERMINATOR);
        Ok(out)
    }
}

impl fmt::Debug for AmiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<(&str, &str)> = self
            .params
            .iter()
            .map(|(k, v)| {
                if SECRET_KEYS
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(k))
                {
                    (k.as_str(), "[REDACTED]")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("AmiAction")
            .field("name", &self.name)
            .field("params", &params)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// `Response:` header classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseStatus {
    /// `Success`
    Success,
    /// `Error`
    Error,
    /// `Follows` (legacy `Command` output).
    Follows,
    /// `Goodbye`, sent in reply to `Logoff`.
    Goodbye,
    /// Anything else.
    Other,
}

impl ResponseStatus {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("Success") => ResponseStatus::Success,
            Some(v) if v.eq_ignore_ascii_case("Error") => ResponseStatus::Error,
            Some(v) if v.eq_ignore_ascii_case("Follows") => ResponseStatus::Follows,
            Some(v) if v.eq_ignore_ascii_case("Goodbye") => ResponseStatus::Goodbye,
            _ => ResponseStatus::Other,
        }
    }
}

/// Response correlated to one action.
///
/// For list queries (`QueueStatus`, `CoreShowChannels`, `SIPpeers`, …) the
/// records between `EventList: start` and `EventList: Complete` are
/// collected in [`events`](Self::events); the completion event itself is
/// kept separately.
#[derive(Debug, Clone, PartialEq)]
pub struct AmiResponse {
    headers: AmiHeaders,
    status: ResponseStatus,
    events: Vec<AmiEvent>,
    complete: Option<AmiEvent>,
}

impl AmiResponse {
    /// `ResponseStatus` is derived from the `Response` header.
    pub fn new(headers: AmiHeaders) -> Self {
        let status = ResponseStatus::from_header(headers.get(HEADER_RESPONSE));
        Self {
            headers,
            status,
            events: Vec::new(),
            complete: None,
        }
    }

    pub(crate) fn with_events(mut self, events: Vec<AmiEvent>, complete: Option<AmiEvent>) -> Self {
        self.events = events;
        self.complete = complete;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success || self.status == ResponseStatus::Follows
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// Look up a response header (case-insensitive).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name)
    }

    pub fn headers(&self) -> &AmiHeaders {
        &self.headers
    }

    /// `Message` header (e.g. `Originate successfully queued`).
    pub fn message(&self) -> Option<&str> {
        self.headers
            .get(HEADER_MESSAGE)
    }

    pub fn action_id(&self) -> Option<&str> {
        self.headers
            .get(HEADER_ACTION_ID)
    }

    /// List records of a multi-part response, in arrival order.
    pub fn events(&self) -> &[AmiEvent] {
        &self.events
    }

    /// List records whose event name matches.
    pub fn events_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a AmiEvent> + 'a {
        self.events
            .iter()
            .filter(move |e| e.name().eq_ignore_ascii_case(name))
    }

    /// The completion event that closed a list response.
    pub fn list_complete(&self) -> Option<&AmiEvent> {
        self.complete
            .as_ref()
    }

    /// Convert to result based on success status.
    ///
    /// ```
    /// # use asterisk_ami_tokio::{AmiResponse, AmiError};
    /// let headers = [("Response", "Error"), ("Message", "No such channel")]
    ///     .into_iter()
    ///     .collect();
    /// let err = AmiResponse::new(headers).into_result().unwrap_err();
    /// assert!(matches!(err, AmiError::CommandRejected { .. }));
    /// ```
    pub fn into_result(self) -> AmiResult<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let message = self
            .message()
            .or_else(|| self.header(HEADER_RESPONSE))
            .unwrap_or("no message")
            .to_string();
        Err(AmiError::CommandRejected { message })
    }
}
