//! HTTP-CONNECT tunnel (C6): the optional proxy preamble that precedes the NCP conversation,
//! carrying Basic auth. Runs over the raw, still-blocking stream before the socket is handed to
//! the reactor (and before any TLS wrapping), so these functions are generic over `Read + Write`
//! rather than tied to `TcpStream` — this is also what lets the unit tests below drive them over
//! an in-memory duplex pipe instead of a live socket.

use std::io::{Read, Write};

use base64::Engine;

use crate::errors::{NcpError, Result};

const TUNNEL_URI: &str = "ncp.service";

/// Client side: writes the `CONNECT` request (with optional Proxy-Authorization) and
/// interprets the response status line (spec.md §4.6).
pub(crate) fn client_connect_tunnel<S: Read + Write>(stream: &mut S, credentials: Option<(&str, &str)>) -> Result<()> {
	write!(stream, "CONNECT {TUNNEL_URI} HTTP/1.1\r\n").map_err(NcpError::Network)?;

	if let Some((username, password)) = credentials {
		let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
		write!(stream, "Proxy-Authorization: Basic {encoded}\r\n").map_err(NcpError::Network)?;
	}

	write!(stream, "\r\n").map_err(NcpError::Network)?;

	let head = read_http_head(stream)?;
	let status = parse_status_line(&head)?;

	match status {
		200 => Ok(()),
		401 => Err(NcpError::Authentication),
		other => Err(NcpError::Network(std::io::Error::other(format!("tunnel rejected with HTTP status {other}")))),
	}
}

/// Server side: reads one request line, validates method and target, and runs the authenticator
/// when one is configured (spec.md §4.6).
pub(crate) fn server_accept_tunnel<S: Read + Write>(stream: &mut S, authenticate: Option<&dyn Fn(&str, &str) -> bool>) -> Result<()> {
	let head = read_http_head(stream)?;
	let mut lines = head.split("\r\n");

	let request_line = lines.next().unwrap_or("");
	let mut parts = request_line.split_whitespace();
	let method = parts.next().unwrap_or("");
	let uri = parts.next().unwrap_or("");

	if method != "CONNECT" {
		write_status(stream, 405, "Method Not Allowed")?;
		return Err(NcpError::Decode(format!("tunnel request used method {method}")));
	}

	if uri != TUNNEL_URI {
		write_status(stream, 403, "Forbidden")?;
		return Err(NcpError::Decode(format!("tunnel request targeted {uri}")));
	}

	if let Some(verify) = authenticate {
		let credentials = lines.find_map(|line| line.strip_prefix("Proxy-Authorization: Basic ")).and_then(decode_basic);

		let authorized = match &credentials {
			Some((user, pass)) => verify(user, pass),
			None => false,
		};

		if !authorized {
			write!(stream, "HTTP/1.1 401 Unauthorized\r\nProxy-Authenticate: Basic realm=\"ncp\"\r\n\r\n").map_err(NcpError::Network)?;
			return Err(NcpError::Authentication);
		}
	}

	write_status(stream, 200, "OK")
}

fn write_status<S: Write>(stream: &mut S, code: u16, reason: &str) -> Result<()> {
	write!(stream, "HTTP/1.1 {code} {reason}\r\n\r\n").map_err(NcpError::Network)
}

fn decode_basic(encoded: &str) -> Option<(String, String)> {
	let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
	let text = String::from_utf8(bytes).ok()?;
	let (user, pass) = text.split_once(':')?;
	Some((user.to_string(), pass.to_string()))
}

fn read_http_head<S: Read>(stream: &mut S) -> Result<String> {
	let mut buf = Vec::new();
	let mut byte = [0u8; 1];

	loop {
		let n = stream.read(&mut byte).map_err(NcpError::Network)?;
		if n == 0 {
			return Err(NcpError::Network(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "tunnel peer closed before headers completed")));
		}

		buf.push(byte[0]);
		if buf.len() >= 4 && buf[buf.len() - 4..] == *b"\r\n\r\n" {
			break;
		}
	}

	Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_status_line(head: &str) -> Result<u16> {
	let line = head.lines().next().ok_or_else(|| NcpError::Decode("empty tunnel response".to_string()))?;
	line.split_whitespace().nth(1).and_then(|s| s.parse().ok()).ok_or_else(|| NcpError::Decode(format!("malformed tunnel status line: {line}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::VecDeque;

	/// A minimal in-memory duplex pipe: writes to one end are readable from the other.
	struct Pipe {
		inbound: VecDeque<u8>,
		outbound: VecDeque<u8>,
	}

	impl Read for Pipe {
		fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
			let n = self.inbound.len().min(buf.len());
			for slot in buf.iter_mut().take(n) {
				*slot = self.inbound.pop_front().unwrap();
			}
			Ok(n)
		}
	}

	impl Write for Pipe {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.outbound.extend(buf);
			Ok(buf.len())
		}
		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	#[test]
	fn client_accepts_200_response() {
		let mut pipe = Pipe { inbound: b"HTTP/1.1 200 OK\r\n\r\n".iter().copied().collect(), outbound: VecDeque::new() };
		assert!(client_connect_tunnel(&mut pipe, None).is_ok());
		assert!(String::from_utf8(pipe.outbound.into()).unwrap().starts_with("CONNECT ncp.service HTTP/1.1\r\n"));
	}

	#[test]
	fn client_maps_401_to_authentication_error() {
		let mut pipe = Pipe { inbound: b"HTTP/1.1 401 Unauthorized\r\n\r\n".iter().copied().collect(), outbound: VecDeque::new() };
		assert!(matches!(client_connect_tunnel(&mut pipe, Some(("bob", "wrong"))), Err(NcpError::Authentication)));
	}

	#[test]
	fn server_rejects_non_connect_method() {
		let mut pipe = Pipe { inbound: b"GET ncp.service HTTP/1.1\r\n\r\n".iter().copied().collect(), outbound: VecDeque::new() };
		assert!(server_accept_tunnel(&mut pipe, None).is_err());
		assert!(String::from_utf8(pipe.outbound.into()).unwrap().starts_with("HTTP/1.1 405"));
	}

	#[test]
	fn server_rejects_wrong_uri() {
		let mut pipe = Pipe { inbound: b"CONNECT somewhere.else HTTP/1.1\r\n\r\n".iter().copied().collect(), outbound: VecDeque::new() };
		assert!(server_accept_tunnel(&mut pipe, None).is_err());
		assert!(String::from_utf8(pipe.outbound.into()).unwrap().starts_with("HTTP/1.1 403"));
	}

	#[test]
	fn server_accepts_valid_basic_auth() {
		let encoded = base64::engine::general_purpose::STANDARD.encode("bob:secret");
		let request = format!("CONNECT ncp.service HTTP/1.1\r\nProxy-Authorization: Basic {encoded}\r\n\r\n");
		let mut pipe = Pipe { inbound: request.bytes().collect(), outbound: VecDeque::new() };

		let verify = |user: &str, pass: &str| user == "bob" && pass == "secret";
		assert!(server_accept_tunnel(&mut pipe, Some(&verify)).is_ok());
		assert!(String::from_utf8(pipe.outbound.into()).unwrap().starts_with("HTTP/1.1 200"));
	}

	#[test]
	fn server_rejects_wrong_basic_auth() {
		let encoded = base64::engine::general_purpose::STANDARD.encode("bob:wrong");
		let request = format!("CONNECT ncp.service HTTP/1.1\r\nProxy-Authorization: Basic {encoded}\r\n\r\n");
		let mut pipe = Pipe { inbound: request.bytes().collect(), outbound: VecDeque::new() };

		let verify = |user: &str, pass: &str| user == "bob" && pass == "secret";
		assert!(matches!(server_accept_tunnel(&mut pipe, Some(&verify)), Err(NcpError::Authentication)));
		assert!(String::from_utf8(pipe.outbound.into()).unwrap().starts_with("HTTP/1.1 401"));
	}
}
