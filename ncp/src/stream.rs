//! Framed stream reader (C3): reassembles the byte chunks the reactor delivers into whole
//! packets, one continuation step at a time, without ever guessing how much to buffer ahead.

use std::collections::VecDeque;

use crate::errors::{DecodeWarning, Result};
use crate::packet::{self, Header, Packet, HEADER_SIZE};

enum Phase {
	/// Waiting for the next `HEADER_SIZE` bytes.
	Header,
	/// Header decoded; waiting for `remaining` more bytes to complete the body.
	Body { remaining: usize, header: Header },
}

/// An incremental byte accumulator fed by the reactor's chunk delivery. Holds exactly one of
/// {need `HEADER_SIZE` more bytes, need `remaining` more bytes} at a time, mirroring the
/// continuation-passing decode contract without a blocking `read_exact`.
pub struct FramedReader {
	buf: VecDeque<u8>,
	phase: Phase,
}

impl FramedReader {
	pub fn new() -> Self {
		Self { buf: VecDeque::new(), phase: Phase::Header }
	}

	/// Appends newly-received bytes.
	pub fn feed(&mut self, chunk: &[u8]) {
		self.buf.extend(chunk);
	}

	/// Decodes as many complete packets as are currently buffered. Stops (without erroring) when
	/// the buffer runs out mid-packet; a fatal decode error poisons the reader for good, since
	/// the stream is no longer framed correctly from that point on.
	pub fn drain(&mut self) -> Result<Vec<(Packet, Vec<DecodeWarning>)>> {
		let mut out = Vec::new();
		while let Some(decoded) = self.try_decode()? {
			out.push(decoded);
		}
		Ok(out)
	}

	fn try_decode(&mut self) -> Result<Option<(Packet, Vec<DecodeWarning>)>> {
		loop {
			match &self.phase {
				Phase::Header => {
					if self.buf.len() < HEADER_SIZE {
						return Ok(None);
					}

					let header_buf: Vec<u8> = self.buf.drain(..HEADER_SIZE).collect();
					let header_buf: [u8; HEADER_SIZE] = header_buf.try_into().unwrap();
					let (remaining, header) = packet::decode_header(&header_buf)?;
					self.phase = Phase::Body { remaining, header };
				}
				Phase::Body { remaining, .. } => {
					if self.buf.len() < *remaining {
						return Ok(None);
					}

					let Phase::Body { remaining, header } = std::mem::replace(&mut self.phase, Phase::Header) else {
						unreachable!()
					};
					let body: Vec<u8> = self.buf.drain(..remaining).collect();
					return Ok(Some(packet::decode_body(header, &body)?));
				}
			}
		}
	}
}

impl Default for FramedReader {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::time::UNIX_EPOCH;

	use super::*;
	use crate::packet::{encode_packet, Field};

	#[test]
	fn reassembles_a_packet_fed_in_arbitrary_chunks() {
		let encoded = encode_packet("TEST", 1, UNIX_EPOCH, [0; 4], &[Field::new("FOO", 1)]);

		let mut reader = FramedReader::new();
		for byte in &encoded {
			reader.feed(std::slice::from_ref(byte));
		}

		let decoded = reader.drain().unwrap();
		assert_eq!(decoded.len(), 1);
		assert_eq!(decoded[0].0.packet_type, "TEST");
	}

	#[test]
	fn decodes_several_back_to_back_packets_in_one_feed() {
		let mut buf = Vec::new();
		buf.extend(encode_packet("AAAA", 1, UNIX_EPOCH, [0; 4], &[]));
		buf.extend(encode_packet("BBBB", 2, UNIX_EPOCH, [0; 4], &[]));

		let mut reader = FramedReader::new();
		reader.feed(&buf);

		let decoded = reader.drain().unwrap();
		assert_eq!(decoded.len(), 2);
		assert_eq!(decoded[0].0.packet_type, "AAAA");
		assert_eq!(decoded[1].0.packet_type, "BBBB");
	}
}
