//! Protocol constants and configuration values

/// Default Asterisk Manager Interface port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Default AMI-over-TLS port
pub const DEFAULT_AMI_TLS_PORT: u16 = 5039;

/// Socket buffer size for reading from TCP stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Buffer allocation size (64KB) - used for both initial allocation and growth increments
pub const BUF_CHUNK: usize = 64 * 1024;

/// Maximum single message block size (1MB).
/// The largest legitimate blocks are `Command` action outputs.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum total buffer size (4MB) - safety limit to prevent runaway memory
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Protocol message terminators
pub const BLOCK_TERMINATOR: &str = "\r\n\r\n";
/// Some PBX builds and proxies emit bare `\n` line endings.
pub const BARE_BLOCK_TERMINATOR: &str = "\n\n";
pub const LINE_TERMINATOR: &str = "\r\n";

/// Prefix of the single greeting line sent right after TCP connect
pub const GREETING_PREFIX: &str = "Asterisk Call Manager";

/// Framing header names
pub const HEADER_ACTION: &str = "Action";
pub const HEADER_ACTION_ID: &str = "ActionID";
pub const HEADER_RESPONSE: &str = "Response";
pub const HEADER_EVENT: &str = "Event";
pub const HEADER_MESSAGE: &str = "Message";
pub const HEADER_EVENT_LIST: &str = "EventList";

/// `EventList` header values
pub const EVENT_LIST_START: &str = "start";
pub const EVENT_LIST_COMPLETE: &str = "Complete";

/// TCP connect timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Login handshake timeout in milliseconds
pub const DEFAULT_LOGIN_TIMEOUT_MS: u64 = 5000;

/// Default command timeout in milliseconds
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;

/// Event classes requested at login
pub const DEFAULT_EVENT_MASK: &str = "call,agent,system";

/// Maximum number of queued events per subscription before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;

/// Reconnect backoff bounds in milliseconds
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;
