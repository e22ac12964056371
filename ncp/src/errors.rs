use thiserror::Error;

/// The error taxonomy surfaced to application code.
///
/// Every variant here is stream-fatal or request-local in the sense of the connection's
/// error-handling policy: fatal variants end the connection, `Command` affects only the
/// `Response` that was waiting on the carrying field.
#[derive(Debug, Error)]
pub enum NcpError {
	#[error("network error: {0}")]
	Network(#[from] std::io::Error),

	#[error("network operation timed out")]
	NetworkTimeout,

	#[error("connection closed")]
	ConnectionClosed,

	#[error("malformed packet: {0}")]
	Decode(String),

	#[error("command error in {packet_type} {field_name} (code {code:?}): {detail:?}")]
	Command {
		packet_type: String,
		field_name: String,
		field_id: u32,
		detail: Option<String>,
		code: Option<i32>,
	},

	#[error("tunnel authentication failed")]
	Authentication,
}

pub type Result<T> = std::result::Result<T, NcpError>;

/// A recoverable decode condition: the packet was still parsed, but something in it deviated
/// from the canonical wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeWarning {
	/// The value's type code is not one this implementation knows how to interpret. The value
	/// is still delivered as `Value::Unknown`.
	UnknownType(u8),
	/// The known "garbled NCP packet" quirk: a literal embedded footer sequence appeared in the
	/// middle of a field's parameter list.
	EmbeddedFooter,
}

/// A field carried an `ERRO`/`ERRC` pair that `auto_warn` policy chose to surface rather than
/// raise, or a `WARN`/`WARC` pair under `auto_warn`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandWarning {
	pub packet_type: String,
	pub field_name: String,
	pub field_id: u32,
	pub detail: Option<String>,
	pub code: Option<i32>,
}

/// What to do with a recoverable condition (`DecodeWarning`/`CommandWarning`).
///
/// Corresponds to spec.md §7's "production code may elect to convert warnings to errors" —
/// realized here as an explicit policy consulted at the two warning call sites instead of a
/// process-wide warning registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarningPolicy {
	/// Log the warning via the `log` facade and continue (the default).
	#[default]
	Log,
	/// Turn the warning into a hard error.
	Escalate,
}
