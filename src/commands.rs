//! Typed builders for the manager actions the bridge issues
//!
//! Each builder validates its required fields in [`AmiCommand::to_action`]
//! so nothing malformed reaches the wire.

use std::time::Duration;

use crate::{
    action::AmiAction,
    error::{AmiError, AmiResult},
};

/// A typed manager action.
pub trait AmiCommand {
    /// Validate and convert into a wire-level action.
    fn to_action(&self) -> AmiResult<AmiAction>;
}

impl AmiCommand for AmiAction {
    fn to_action(&self) -> AmiResult<AmiAction> {
        Ok(self.clone())
    }
}

fn require(value: &str, field: &str) -> AmiResult<()> {
    if value
        .trim()
        .is_empty()
    {
        return Err(AmiError::invalid_argument(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}

fn bool_param(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Dialplan context used when none is given.
pub const DEFAULT_CONTEXT: &str = "from-internal";

/// Where an originated channel is connected once answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginateTarget {
    /// `Exten` / `Context` / `Priority`
    Extension {
        exten: String,
        context: String,
        priority: u32,
    },
    /// `Application` / `Data`
    Application { application: String, data: String },
}

/// `Originate`: place a call from `channel`.
#[derive(Debug, Clone)]
pub struct Originate {
    pub channel: String,
    pub target: OriginateTarget,
    pub caller_id: Option<String>,
    /// Ring timeout sent to the PBX (`Timeout`, milliseconds on the wire).
    pub ring_timeout: Duration,
    pub variables: Vec<(String, String)>,
    pub account: Option<String>,
    /// Return as soon as the PBX has queued the call.
    pub async_mode: bool,
}

impl Originate {
    pub fn to_extension(
        channel: impl Into<String>,
        exten: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self::new(
            channel,
            OriginateTarget::Extension {
                exten: exten.into(),
                context: context.into(),
                priority: 1,
            },
        )
    }

    pub fn to_application(
        channel: impl Into<String>,
        application: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self::new(
            channel,
            OriginateTarget::Application {
                application: application.into(),
                data: data.into(),
            },
        )
    }

    fn new(channel: impl Into<String>, target: OriginateTarget) -> Self {
        Self {
            channel: channel.into(),
            target,
            caller_id: None,
            ring_timeout: Duration::from_secs(30),
            variables: Vec::new(),
            account: None,
            async_mode: true,
        }
    }

    pub fn caller_id(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    pub fn ring_timeout(mut self, ring_timeout: Duration) -> Self {
        self.ring_timeout = ring_timeout;
        self
    }

    /// Channel variable set on the new channel (`Variable: key=value`).
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables
            .push((key.into(), value.into()));
        self
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }
}

impl AmiCommand for Originate {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.channel, "channel")?;
        let mut action = AmiAction::new("Originate").param("Channel", self.channel.as_str());
        action = match &self.target {
            OriginateTarget::Extension {
                exten,
                context,
                priority,
            } => {
                require(exten, "destination")?;
                require(context, "context")?;
                action
                    .param("Exten", exten.as_str())
                    .param("Context", context.as_str())
                    .param("Priority", priority.to_string())
            }
            OriginateTarget::Application { application, data } => {
                require(application, "application")?;
                action
                    .param("Application", application.as_str())
                    .param("Data", data.as_str())
            }
        };
        action = action
            .param(
                "Timeout",
                self.ring_timeout
                    .as_millis()
                    .to_string(),
            )
            .param("Async", bool_param(self.async_mode))
            .param_opt("CallerID", self.caller_id.as_deref())
            .param_opt("Account", self.account.as_deref());
        for (key, value) in &self.variables {
            require(key, "variable name")?;
            action = action.param("Variable", format!("{}={}", key, value));
        }
        if !self.async_mode {
            // Synchronous originate answers only after the ring timeout
            action = action.timeout(self.ring_timeout + Duration::from_secs(5));
        }
        Ok(action)
    }
}

/// `Hangup`
#[derive(Debug, Clone)]
pub struct Hangup {
    pub channel: String,
    /// Q.850 cause code.
    pub cause: Option<u32>,
}

impl Hangup {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            cause: None,
        }
    }

    pub fn cause(mut self, cause: u32) -> Self {
        self.cause = Some(cause);
        self
    }
}

impl AmiCommand for Hangup {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.channel, "channel")?;
        Ok(AmiAction::new("Hangup")
            .param("Channel", self.channel.as_str())
            .param_opt("Cause", self.cause.map(|c| c.to_string())))
    }
}

/// `Redirect`: blind transfer to a dialplan location.
#[derive(Debug, Clone)]
pub struct Redirect {
    pub channel: String,
    pub exten: String,
    pub context: String,
    pub priority: u32,
    /// Second leg redirected along with the first.
    pub extra_channel: Option<String>,
}

impl Redirect {
    pub fn new(
        channel: impl Into<String>,
        exten: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            exten: exten.into(),
            context: context.into(),
            priority: 1,
            extra_channel: None,
        }
    }

    pub fn extra_channel(mut self, channel: impl Into<String>) -> Self {
        self.extra_channel = Some(channel.into());
        self
    }
}

impl AmiCommand for Redirect {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.channel, "channel")?;
        require(&self.exten, "destination")?;
        require(&self.context, "context")?;
        Ok(AmiAction::new("Redirect")
            .param("Channel", self.channel.as_str())
            .param_opt("ExtraChannel", self.extra_channel.as_deref())
            .param("Exten", self.exten.as_str())
            .param("Context", self.context.as_str())
            .param("Priority", self.priority.to_string()))
    }
}

/// `Park`
#[derive(Debug, Clone)]
pub struct Park {
    pub channel: String,
    pub parking_lot: Option<String>,
    /// How long the call stays parked before returning (`Timeout`, ms on
    /// the wire).
    pub timeout: Option<Duration>,
    /// Channel the parked call returns to on timeout.
    pub timeout_channel: Option<String>,
}

impl Park {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            parking_lot: None,
            timeout: None,
            timeout_channel: None,
        }
    }

    pub fn parking_lot(mut self, lot: impl Into<String>) -> Self {
        self.parking_lot = Some(lot.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl AmiCommand for Park {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.channel, "channel")?;
        Ok(AmiAction::new("Park")
            .param("Channel", self.channel.as_str())
            .param_opt("TimeoutChannel", self.timeout_channel.as_deref())
            .param_opt("Parkinglot", self.parking_lot.as_deref())
            .param_opt(
                "Timeout",
                self.timeout
                    .map(|t| {
                        t.as_millis()
                            .to_string()
                    }),
            ))
    }
}

/// Supervisor participation in a monitored call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpyMode {
    /// Hear both parties, speak to nobody.
    Listen,
    /// Speak to the monitored agent only.
    Whisper,
    /// Speak to both parties.
    Barge,
}

impl SpyMode {
    /// `ChanSpy` option letter; listening is the default.
    pub fn option(&self) -> &'static str {
        match self {
            SpyMode::Listen => "",
            SpyMode::Whisper => "w",
            SpyMode::Barge => "B",
        }
    }
}

impl std::str::FromStr for SpyMode {
    type Err = AmiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "listen" => Ok(SpyMode::Listen),
            "whisper" => Ok(SpyMode::Whisper),
            "barge" => Ok(SpyMode::Barge),
            other => Err(AmiError::invalid_argument(format!(
                "unknown spy mode '{}'",
                other
            ))),
        }
    }
}

/// Originate the supervisor's phone into `ChanSpy` on the target channel.
#[derive(Debug, Clone)]
pub struct ChanSpy {
    pub observer: String,
    pub target: String,
    pub mode: SpyMode,
}

impl ChanSpy {
    pub fn new(observer: impl Into<String>, target: impl Into<String>, mode: SpyMode) -> Self {
        Self {
            observer: observer.into(),
            target: target.into(),
            mode,
        }
    }
}

impl AmiCommand for ChanSpy {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.observer, "observer channel")?;
        require(&self.target, "target channel")?;
        if self
            .target
            .contains(',')
        {
            return Err(AmiError::invalid_argument(
                "target channel must not contain ','",
            ));
        }
        Originate::to_application(
            self.observer
                .as_str(),
            "ChanSpy",
            format!("{},q{}", self.target, self.mode.option()),
        )
        .to_action()
    }
}

/// `Bridge`: connect two existing channels.
#[derive(Debug, Clone)]
pub struct Bridge {
    pub channel1: String,
    pub channel2: String,
    /// Play a courtesy tone to `channel2`.
    pub tone: bool,
}

impl Bridge {
    pub fn new(channel1: impl Into<String>, channel2: impl Into<String>) -> Self {
        Self {
            channel1: channel1.into(),
            channel2: channel2.into(),
            tone: false,
        }
    }
}

impl AmiCommand for Bridge {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.channel1, "channel1")?;
        require(&self.channel2, "channel2")?;
        Ok(AmiAction::new("Bridge")
            .param("Channel1", self.channel1.as_str())
            .param("Channel2", self.channel2.as_str())
            .param("Tone", if self.tone { "yes" } else { "no" }))
    }
}

/// `PlayDTMF`
#[derive(Debug, Clone)]
pub struct PlayDtmf {
    pub channel: String,
    pub digit: char,
    pub duration: Duration,
}

impl PlayDtmf {
    pub fn new(channel: impl Into<String>, digit: char) -> Self {
        Self {
            channel: channel.into(),
            digit,
            duration: Duration::from_millis(100),
        }
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

impl AmiCommand for PlayDtmf {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.channel, "channel")?;
        let digit = self
            .digit
            .to_ascii_uppercase();
        if !(digit.is_ascii_digit() || matches!(digit, '*' | '#' | 'A'..='D')) {
            return Err(AmiError::invalid_argument(format!(
                "invalid DTMF digit '{}'",
                self.digit
            )));
        }
        Ok(AmiAction::new("PlayDTMF")
            .param("Channel", self.channel.as_str())
            .param("Digit", digit.to_string())
            .param(
                "Duration",
                self.duration
                    .as_millis()
                    .to_string(),
            ))
    }
}

/// `Status`: list records (`Status` events) for one or all channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelStatus {
    pub channel: Option<String>,
}

impl AmiCommand for ChannelStatus {
    fn to_action(&self) -> AmiResult<AmiAction> {
        Ok(AmiAction::new("Status").param_opt("Channel", self.channel.as_deref()))
    }
}

/// `CoreShowChannels`: one `CoreShowChannel` record per active channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreShowChannels;

impl AmiCommand for CoreShowChannels {
    fn to_action(&self) -> AmiResult<AmiAction> {
        Ok(AmiAction::new("CoreShowChannels"))
    }
}

/// `QueueStatus`: `QueueParams`, `QueueMember` and `QueueEntry` records.
#[derive(Debug, Clone, Default)]
pub struct QueueStatus {
    pub queue: Option<String>,
    pub member: Option<String>,
}

impl QueueStatus {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            queue: Some(name.into()),
            member: None,
        }
    }
}

impl AmiCommand for QueueStatus {
    fn to_action(&self) -> AmiResult<AmiAction> {
        Ok(AmiAction::new("QueueStatus")
            .param_opt("Queue", self.queue.as_deref())
            .param_opt("Member", self.member.as_deref()))
    }
}

/// `QueueAdd`
#[derive(Debug, Clone)]
pub struct QueueAdd {
    pub queue: String,
    pub interface: String,
    pub member_name: Option<String>,
    pub state_interface: Option<String>,
    pub penalty: u32,
    pub paused: bool,
}

impl QueueAdd {
    pub fn new(queue: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            interface: interface.into(),
            member_name: None,
            state_interface: None,
            penalty: 0,
            paused: false,
        }
    }

    pub fn member_name(mut self, name: impl Into<String>) -> Self {
        self.member_name = Some(name.into());
        self
    }

    pub fn penalty(mut self, penalty: u32) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }
}

impl AmiCommand for QueueAdd {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.queue, "queue")?;
        require(&self.interface, "interface")?;
        Ok(AmiAction::new("QueueAdd")
            .param("Queue", self.queue.as_str())
            .param("Interface", self.interface.as_str())
            .param("Penalty", self.penalty.to_string())
            .param("Paused", bool_param(self.paused))
            .param_opt("MemberName", self.member_name.as_deref())
            .param_opt("StateInterface", self.state_interface.as_deref()))
    }
}

/// `QueueRemove`
#[derive(Debug, Clone)]
pub struct QueueRemove {
    pub queue: String,
    pub interface: String,
}

impl AmiCommand for QueueRemove {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.queue, "queue")?;
        require(&self.interface, "interface")?;
        Ok(AmiAction::new("QueueRemove")
            .param("Queue", self.queue.as_str())
            .param("Interface", self.interface.as_str()))
    }
}

/// `QueuePause`; without a queue the member is paused everywhere.
#[derive(Debug, Clone)]
pub struct QueuePause {
    pub queue: Option<String>,
    pub interface: String,
    pub paused: bool,
    pub reason: Option<String>,
}

impl AmiCommand for QueuePause {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.interface, "interface")?;
        Ok(AmiAction::new("QueuePause")
            .param("Interface", self.interface.as_str())
            .param("Paused", bool_param(self.paused))
            .param_opt("Queue", self.queue.as_deref())
            .param_opt("Reason", self.reason.as_deref()))
    }
}

/// `QueuePenalty`
#[derive(Debug, Clone)]
pub struct QueuePenalty {
    pub queue: Option<String>,
    pub interface: String,
    pub penalty: u32,
}

impl AmiCommand for QueuePenalty {
    fn to_action(&self) -> AmiResult<AmiAction> {
        require(&self.interface, "interface")?;
        Ok(AmiAction::new("QueuePenalty")
            .param("Interface", self.interface.as_str())
            .param("Penalty", self.penalty.to_string())
            .param_opt("Queue", self.queue.as_deref()))
    }
}

/// `QueueReload`; without a queue every queue is reloaded.
#[derive(Debug, Clone, Default)]
pub struct QueueReload {
    pub queue: Option<String>,
    pub members: bool,
    pub rules: bool,
    pub parameters: bool,
}

impl AmiCommand for QueueReload {
    fn to_action(&self) -> AmiResult<AmiAction> {
        let yes_no = |v: bool| if v { "yes" } else { "no" };
        Ok(AmiAction::new("QueueReload")
            .param_opt("Queue", self.queue.as_deref())
            .param("Members", yes_no(self.members))
            .param("Rules", yes_no(self.rules))
            .param("Parameters", yes_no(self.parameters)))
    }
}
