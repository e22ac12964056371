//! Packet codec (C2): the full packet structure, encoded/decoded as a continuation-passing
//! two-phase operation so the stream reader never has to guess how much to buffer.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errors::{DecodeWarning, NcpError, Result};
use crate::values::Value;

pub const HEADER_SIZE: usize = 32;
pub const FIELD_HEADER_SIZE: usize = 12;
pub const PARAM_HEADER_SIZE: usize = 8;
pub const FOOTER_SIZE: usize = 8;

const HEADER_MAGIC: [u8; 4] = [0xdd, 0xcc, 0xbb, 0xaa];
const FOOTER_MAGIC: [u8; 4] = [0xaa, 0xbb, 0xcc, 0xdd];
const FORMAT_VERSION: u32 = 1;

/// The literal bytes of a spurious embedded footer some remote implementations emit mid-body
/// (ncplib's "Axis nodes" quirk). Tolerated, not fatal.
const EMBEDDED_FOOTER: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0xaa, 0xbb, 0xcc, 0xdd];

/// A named, id-tagged bundle of parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
	pub name: String,
	pub id: u32,
	pub params: Vec<(String, Value)>,
}

impl Field {
	pub fn new(name: impl Into<String>, id: u32) -> Self {
		Self { name: name.into(), id, params: Vec::new() }
	}

	pub fn param(mut self, name: impl Into<String>, value: Value) -> Self {
		self.params.push((name.into(), value));
		self
	}

	pub fn get(&self, name: &str) -> Option<&Value> {
		self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
	}
}

/// The framed unit of transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
	pub packet_type: String,
	pub id: u32,
	pub timestamp: SystemTime,
	pub info: [u8; 4],
	pub fields: Vec<Field>,
}

fn encode_identifier(name: &str) -> [u8; 4] {
	let mut buf = [0x20u8; 4];
	let bytes = name.as_bytes();
	let n = bytes.len().min(4);
	buf[..n].copy_from_slice(&bytes[..n]);
	buf
}

fn decode_identifier(buf: &[u8]) -> String {
	let trimmed = buf.iter().rposition(|&b| b != 0 && b != b' ').map(|i| i + 1).unwrap_or(0);
	String::from_utf8_lossy(&buf[..trimmed]).into_owned()
}

fn pad_len(len: usize) -> usize {
	(4 - len % 4) % 4
}

/// Encodes a complete packet. Computed in two passes: fields are serialized first so their total
/// length is known, then the header's size word is backfilled.
pub fn encode_packet(packet_type: &str, id: u32, timestamp: SystemTime, info: [u8; 4], fields: &[Field]) -> Vec<u8> {
	let mut body = Vec::new();

	for field in fields {
		let field_offset = body.len();
		body.extend_from_slice(&encode_identifier(&field.name));
		body.extend_from_slice(&[0, 0, 0]); // size placeholder
		body.push(0); // reserved
		body.extend_from_slice(&field.id.to_le_bytes());

		for (name, value) in &field.params {
			let (type_id, encoded) = value.encode();
			let param_size = PARAM_HEADER_SIZE + encoded.len();
			let padding = pad_len(param_size);
			let size_words = ((param_size + padding) / 4) as u32;

			body.extend_from_slice(&encode_identifier(name));
			body.extend_from_slice(&size_words.to_le_bytes()[..3]);
			body.push(type_id);
			body.extend_from_slice(&encoded);
			body.extend(std::iter::repeat(0u8).take(padding));
		}

		let field_size_words = ((body.len() - field_offset) / 4) as u32;
		body[field_offset + 4..field_offset + 7].copy_from_slice(&field_size_words.to_le_bytes()[..3]);
	}

	let duration = timestamp.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
	let total_size_words = ((HEADER_SIZE + body.len() + FOOTER_SIZE) / 4) as u32;

	let mut buf = Vec::with_capacity(HEADER_SIZE + body.len() + FOOTER_SIZE);
	buf.extend_from_slice(&HEADER_MAGIC);
	buf.extend_from_slice(&encode_identifier(packet_type));
	buf.extend_from_slice(&total_size_words.to_le_bytes());
	buf.extend_from_slice(&id.to_le_bytes());
	buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
	buf.extend_from_slice(&(duration.as_secs() as u32).to_le_bytes());
	buf.extend_from_slice(&duration.subsec_nanos().to_le_bytes());
	buf.extend_from_slice(&info);
	buf.extend_from_slice(&body);
	buf.extend_from_slice(&[0, 0, 0, 0]); // checksum, unused
	buf.extend_from_slice(&FOOTER_MAGIC);

	buf
}

/// The result of decoding the fixed-size header: how many more bytes the body holds, and the
/// continuation needed to finish decoding once they arrive.
pub struct Header {
	packet_type: String,
	id: u32,
	timestamp: SystemTime,
	info: [u8; 4],
}

/// Phase one: validate the header and return the number of remaining body bytes plus a
/// continuation that finishes the decode once those bytes are available.
pub fn decode_header(buf: &[u8; HEADER_SIZE]) -> Result<(usize, Header)> {
	if buf[0..4] != HEADER_MAGIC {
		return Err(NcpError::Decode(format!("invalid packet header magic {:02x?}", &buf[0..4])));
	}

	let packet_type = decode_identifier(&buf[4..8]);
	let size_words = u32::from_le_bytes(buf[8..12].try_into().unwrap());
	let id = u32::from_le_bytes(buf[12..16].try_into().unwrap());
	let format = u32::from_le_bytes(buf[16..20].try_into().unwrap());
	let secs = u32::from_le_bytes(buf[20..24].try_into().unwrap());
	let nanos = u32::from_le_bytes(buf[24..28].try_into().unwrap());
	let mut info = [0u8; 4];
	info.copy_from_slice(&buf[28..32]);

	if format != FORMAT_VERSION {
		return Err(NcpError::Decode(format!("unknown packet format {format}")));
	}

	let size = (size_words as usize) * 4;
	if size < HEADER_SIZE + FOOTER_SIZE {
		return Err(NcpError::Decode(format!("packet size {size} too small for header and footer")));
	}

	let timestamp = UNIX_EPOCH + Duration::new(secs as u64, nanos);
	let remaining = size - HEADER_SIZE;

	Ok((remaining, Header { packet_type, id, timestamp, info }))
}

/// Phase two: given the body bytes (exactly the length returned by `decode_header`), decode the
/// fields and validate the footer.
pub fn decode_body(header: Header, body: &[u8]) -> Result<(Packet, Vec<DecodeWarning>)> {
	if body.len() < FOOTER_SIZE {
		return Err(NcpError::Decode("packet body shorter than its footer".to_string()));
	}

	let field_limit = body.len() - FOOTER_SIZE;
	let footer = &body[field_limit..];
	if footer[4..8] != FOOTER_MAGIC {
		return Err(NcpError::Decode(format!("invalid packet footer magic {:02x?}", &footer[4..8])));
	}

	let mut warnings = Vec::new();
	let mut fields = Vec::new();
	let mut offset = 0;

	while offset < field_limit {
		if offset + FIELD_HEADER_SIZE > field_limit {
			return Err(NcpError::Decode(format!("field header overflow by {} bytes", offset + FIELD_HEADER_SIZE - field_limit)));
		}

		let name = decode_identifier(&body[offset..offset + 4]);
		let mut size_bytes = [0u8; 4];
		size_bytes[..3].copy_from_slice(&body[offset + 4..offset + 7]);
		let field_size = (u32::from_le_bytes(size_bytes) as usize) * 4;
		let id = u32::from_le_bytes(body[offset + 8..offset + 12].try_into().unwrap());

		let param_limit = offset + field_size;
		if param_limit > field_limit {
			return Err(NcpError::Decode(format!("field overflow by {} bytes", param_limit - field_limit)));
		}

		offset += FIELD_HEADER_SIZE;
		let mut params = Vec::new();

		while offset < param_limit {
			if body[offset..].len() >= 8 && body[offset..offset + 8] == EMBEDDED_FOOTER {
				warnings.push(DecodeWarning::EmbeddedFooter);
				offset += 8;
				continue;
			}

			if offset + PARAM_HEADER_SIZE > param_limit {
				return Err(NcpError::Decode(format!("parameter header overflow by {} bytes", offset + PARAM_HEADER_SIZE - param_limit)));
			}

			let param_name = decode_identifier(&body[offset..offset + 4]);
			let mut param_size_bytes = [0u8; 4];
			param_size_bytes[..3].copy_from_slice(&body[offset + 4..offset + 7]);
			let param_size = (u32::from_le_bytes(param_size_bytes) as usize) * 4;
			let type_id = body[offset + 7];

			let param_end = offset + param_size;
			if param_end > param_limit {
				return Err(NcpError::Decode(format!("parameter overflow by {} bytes", param_end - param_limit)));
			}

			let value_bytes = &body[offset + PARAM_HEADER_SIZE..param_end];
			let (value, warning) = Value::decode(type_id, value_bytes);
			if let Some(w) = warning {
				warnings.push(w);
			}

			params.push((param_name, value));
			offset = param_end;
		}

		fields.push(Field { name, id, params });
	}

	Ok((
		Packet { packet_type: header.packet_type, id: header.id, timestamp: header.timestamp, info: header.info, fields },
		warnings,
	))
}

/// Convenience wrapper over `decode_header`/`decode_body` for callers holding the full packet
/// bytes already (tests, known-vector fixtures).
pub fn decode_packet(buf: &[u8]) -> Result<(Packet, Vec<DecodeWarning>)> {
	let header_buf: [u8; HEADER_SIZE] = buf.get(..HEADER_SIZE).ok_or_else(|| NcpError::Decode("packet shorter than header".to_string()))?.try_into().unwrap();
	let (remaining, header) = decode_header(&header_buf)?;
	let body = buf.get(HEADER_SIZE..HEADER_SIZE + remaining).ok_or_else(|| NcpError::Decode("packet shorter than declared size".to_string()))?;
	decode_body(header, body)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_fields() -> Vec<Field> {
		vec![Field::new("FOO", 1).param("BAR", Value::String("baz".to_string())).param("NUM", Value::I32(-7))]
	}

	#[test]
	fn round_trips_a_packet() {
		let ts = UNIX_EPOCH + Duration::new(1_700_000_000, 123_000);
		let encoded = encode_packet("TEST", 42, ts, *b"CLID", &sample_fields());

		assert_eq!(encoded.len() % 4, 0);

		let size_word = u32::from_le_bytes(encoded[8..12].try_into().unwrap());
		assert_eq!(size_word as usize * 4, encoded.len());

		let (packet, warnings) = decode_packet(&encoded).unwrap();
		assert!(warnings.is_empty());
		assert_eq!(packet.packet_type, "TEST");
		assert_eq!(packet.id, 42);
		assert_eq!(packet.info, *b"CLID");
		assert_eq!(packet.fields, sample_fields());
	}

	#[test]
	fn rejects_corrupt_header_magic() {
		let mut encoded = encode_packet("TEST", 1, UNIX_EPOCH, [0; 4], &[]);
		encoded[0] = 0;
		assert!(matches!(decode_packet(&encoded), Err(NcpError::Decode(_))));
	}

	#[test]
	fn rejects_corrupt_footer_magic() {
		let mut encoded = encode_packet("TEST", 1, UNIX_EPOCH, [0; 4], &[]);
		let last = encoded.len() - 1;
		encoded[last] = 0;
		assert!(matches!(decode_packet(&encoded), Err(NcpError::Decode(_))));
	}

	#[test]
	fn rejects_unknown_format_version() {
		let mut encoded = encode_packet("TEST", 1, UNIX_EPOCH, [0; 4], &[]);
		encoded[16..20].copy_from_slice(&2u32.to_le_bytes());
		assert!(matches!(decode_packet(&encoded), Err(NcpError::Decode(_))));
	}

	#[test]
	fn rejects_parameter_size_exceeding_field() {
		let mut encoded = encode_packet("TEST", 1, UNIX_EPOCH, [0; 4], &sample_fields());
		// Bloat the first parameter's declared size word so it overruns its field.
		encoded[HEADER_SIZE + FIELD_HEADER_SIZE + 4] = 0xff;
		assert!(matches!(decode_packet(&encoded), Err(NcpError::Decode(_))));
	}

	#[test]
	fn tolerates_embedded_footer_quirk() {
		let mut encoded = encode_packet("TEST", 1, UNIX_EPOCH, [0; 4], &sample_fields());
		let footer_offset = encoded.len() - FOOTER_SIZE;

		// Splice the quirk sequence into the middle of the field body and grow the declared
		// sizes to account for it.
		let field_offset = HEADER_SIZE;
		encoded.splice(footer_offset..footer_offset, EMBEDDED_FOOTER.iter().copied());

		let new_field_size_words = ((encoded.len() - FOOTER_SIZE - field_offset) / 4) as u32;
		encoded[field_offset + 4..field_offset + 7].copy_from_slice(&new_field_size_words.to_le_bytes()[..3]);
		let new_total_words = (encoded.len() / 4) as u32;
		encoded[8..12].copy_from_slice(&new_total_words.to_le_bytes());

		let (packet, warnings) = decode_packet(&encoded).unwrap();
		assert_eq!(warnings, vec![DecodeWarning::EmbeddedFooter]);
		assert_eq!(packet.fields, sample_fields());
	}

	#[test]
	fn unknown_type_code_decodes_with_warning() {
		let fields = vec![Field::new("FOO", 1).param("BAR", Value::Raw(vec![1, 2, 3, 4]))];
		let mut encoded = encode_packet("TEST", 1, UNIX_EPOCH, [0; 4], &fields);
		// The raw type code lives at the byte right after the param's 3-byte size field.
		let type_code_offset = HEADER_SIZE + FIELD_HEADER_SIZE + 7;
		encoded[type_code_offset] = 0x7f;

		let (packet, warnings) = decode_packet(&encoded).unwrap();
		assert_eq!(warnings, vec![DecodeWarning::UnknownType(0x7f)]);
		assert_eq!(packet.fields[0].get("BAR"), Some(&Value::Unknown(0x7f, vec![1, 2, 3, 4])));
	}
}
