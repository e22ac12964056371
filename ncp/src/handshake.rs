//! LINK handshake (C5): server-side HELO→CCRE→SCAR→CARE→SCON and the client-side mirror
//! (spec.md §4.5). Runs before the connection is handed to application code, against a caller
//! supplied deadline rather than the (not yet negotiated) per-`recv()` timeout.

use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::errors::Result;
use crate::values::Value;

const MIN_TIMEOUT: u64 = 5;
const MAX_TIMEOUT: u64 = 60;

/// Clamps a requested timeout (seconds) to `[5, 60]`, leaving `0` ("legacy") untouched. Returns
/// the effective value and whether it was altered, so the caller can warn on clamping.
fn clamp_timeout(requested: u64) -> (u64, bool) {
	if requested == 0 {
		return (0, false);
	}

	let clamped = requested.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
	(clamped, clamped != requested)
}

fn read_link_seconds(field: &crate::packet::Field) -> u64 {
	match field.get("LINK") {
		Some(Value::I32(v)) => (*v).max(0) as u64,
		Some(Value::U32(v)) => *v as u64,
		Some(Value::I64(v)) => (*v).max(0) as u64,
		Some(Value::U64(v)) => *v,
		_ => 0,
	}
}

/// `0` negotiated timeout means legacy mode — no receive timeout, unconditional 3s keep-alives.
fn negotiated_duration(effective_secs: u64) -> Option<Duration> {
	if effective_secs == 0 {
		None
	} else {
		Some(Duration::from_secs(effective_secs))
	}
}

/// Runs the server side of the handshake against an already-accepted, not-yet-open connection.
/// Returns the negotiated timeout (`None` in legacy mode) for the caller to arm the keep-alive
/// scheduler with.
pub(crate) fn server_handshake(conn: &mut Connection, deadline: Instant) -> Result<Option<Duration>> {
	conn.send_packet("LINK", vec![("HELO".to_string(), vec![])])?;

	let ccre = conn.recv_field_within("LINK", "CCRE", Some(deadline))?;
	let requested = read_link_seconds(&ccre);

	let (effective, clamped) = clamp_timeout(requested);
	if clamped {
		log::warn!("clamping client-requested handshake timeout {requested}s to {effective}s");
	}

	conn.send_packet("LINK", vec![("SCAR".to_string(), vec![("LINK".to_string(), Value::U32(effective as u32))])])?;

	let _care = conn.recv_field_within("LINK", "CARE", Some(deadline))?;

	conn.send_packet("LINK", vec![("SCON".to_string(), vec![])])?;

	Ok(negotiated_duration(effective))
}

/// Runs the client side of the handshake, requesting `requested_timeout` (`Duration::ZERO` for
/// legacy mode). Returns the timeout the server actually negotiated.
pub(crate) fn client_handshake(conn: &mut Connection, hostname: &str, requested_timeout: Duration, deadline: Instant) -> Result<Option<Duration>> {
	let _helo = conn.recv_field_within("LINK", "HELO", Some(deadline))?;

	let requested_secs = requested_timeout.as_secs();
	conn.send_packet(
		"LINK",
		vec![("CCRE".to_string(), vec![("CIW".to_string(), Value::String(hostname.to_string())), ("LINK".to_string(), Value::U32(requested_secs as u32))])],
	)?;

	let scar = conn.recv_field_within("LINK", "SCAR", Some(deadline))?;
	let effective = read_link_seconds(&scar);

	if effective != requested_secs {
		log::warn!("server negotiated handshake timeout {effective}s (requested {requested_secs}s)");
	}

	conn.send_packet("LINK", vec![("CARE".to_string(), vec![("CAR".to_string(), Value::String(hostname.to_string()))])])?;

	let _scon = conn.recv_field_within("LINK", "SCON", Some(deadline))?;

	Ok(negotiated_duration(effective))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clamps_requested_timeout_into_range() {
		assert_eq!(clamp_timeout(9999), (MAX_TIMEOUT, true));
		assert_eq!(clamp_timeout(1), (MIN_TIMEOUT, true));
		assert_eq!(clamp_timeout(30), (30, false));
	}

	#[test]
	fn zero_requested_timeout_stays_legacy() {
		assert_eq!(clamp_timeout(0), (0, false));
		assert_eq!(negotiated_duration(0), None);
	}

	#[test]
	fn nonzero_effective_timeout_becomes_a_duration() {
		assert_eq!(negotiated_duration(39), Some(Duration::from_secs(39)));
	}
}
