//! Typed parameter values (C1): conversion between in-memory `Value`s and their wire byte form.

use crate::errors::DecodeWarning;

pub const TYPE_I32: u8 = 0x00;
pub const TYPE_U32: u8 = 0x01;
pub const TYPE_STRING: u8 = 0x02;
pub const TYPE_I64: u8 = 0x03;
pub const TYPE_U64: u8 = 0x04;
pub const TYPE_F32: u8 = 0x05;
pub const TYPE_F64: u8 = 0x06;
pub const TYPE_RAW: u8 = 0x80;
pub const TYPE_ARRAY_U8: u8 = 0x81;
pub const TYPE_ARRAY_U16: u8 = 0x82;
pub const TYPE_ARRAY_U32: u8 = 0x83;
pub const TYPE_ARRAY_I8: u8 = 0x84;
pub const TYPE_ARRAY_I16: u8 = 0x85;
pub const TYPE_ARRAY_I32: u8 = 0x86;
pub const TYPE_ARRAY_U64: u8 = 0x87;
pub const TYPE_ARRAY_I64: u8 = 0x88;
pub const TYPE_ARRAY_F32: u8 = 0x89;
pub const TYPE_ARRAY_F64: u8 = 0x8a;

/// A parameter value. The signed/unsigned distinction is carried as a tagged variant rather than
/// folded into a single wide integer type, since most in-memory integer representations cannot
/// otherwise survive an encode/decode round-trip (spec.md §9).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	I32(i32),
	U32(u32),
	I64(i64),
	U64(u64),
	F32(f32),
	F64(f64),
	String(String),
	Raw(Vec<u8>),
	ArrayU8(Vec<u8>),
	ArrayU16(Vec<u16>),
	ArrayU32(Vec<u32>),
	ArrayI8(Vec<i8>),
	ArrayI16(Vec<i16>),
	ArrayI32(Vec<i32>),
	ArrayU64(Vec<u64>),
	ArrayI64(Vec<i64>),
	ArrayF32(Vec<f32>),
	ArrayF64(Vec<f64>),
	/// An unrecognised type code, preserved verbatim so the caller can inspect or re-emit it.
	Unknown(u8, Vec<u8>),
}

macro_rules! encode_array {
	($values:expr, $elem:ty) => {{
		let mut buf = Vec::with_capacity($values.len() * std::mem::size_of::<$elem>());
		for v in $values {
			buf.extend_from_slice(&v.to_le_bytes());
		}
		buf
	}};
}

macro_rules! decode_array {
	($bytes:expr, $elem:ty, $variant:ident) => {{
		let size = std::mem::size_of::<$elem>();
		Value::$variant($bytes.chunks_exact(size).map(|c| <$elem>::from_le_bytes(c.try_into().unwrap())).collect())
	}};
}

impl Value {
	/// Encodes this value, returning its type code and encoded (unpadded) bytes.
	pub fn encode(&self) -> (u8, Vec<u8>) {
		match self {
			Value::I32(v) => (TYPE_I32, v.to_le_bytes().to_vec()),
			Value::U32(v) => (TYPE_U32, v.to_le_bytes().to_vec()),
			Value::I64(v) => (TYPE_I64, v.to_le_bytes().to_vec()),
			Value::U64(v) => (TYPE_U64, v.to_le_bytes().to_vec()),
			Value::F32(v) => (TYPE_F32, v.to_le_bytes().to_vec()),
			Value::F64(v) => (TYPE_F64, v.to_le_bytes().to_vec()),
			Value::String(s) => {
				let mut buf = s.as_bytes().to_vec();
				buf.push(0);
				(TYPE_STRING, buf)
			}
			Value::Raw(b) => (TYPE_RAW, b.clone()),
			Value::ArrayU8(v) => (TYPE_ARRAY_U8, v.clone()),
			Value::ArrayI8(v) => (TYPE_ARRAY_I8, v.iter().map(|&b| b as u8).collect()),
			Value::ArrayU16(v) => (TYPE_ARRAY_U16, encode_array!(v, u16)),
			Value::ArrayI16(v) => (TYPE_ARRAY_I16, encode_array!(v, i16)),
			Value::ArrayU32(v) => (TYPE_ARRAY_U32, encode_array!(v, u32)),
			Value::ArrayI32(v) => (TYPE_ARRAY_I32, encode_array!(v, i32)),
			Value::ArrayU64(v) => (TYPE_ARRAY_U64, encode_array!(v, u64)),
			Value::ArrayI64(v) => (TYPE_ARRAY_I64, encode_array!(v, i64)),
			Value::ArrayF32(v) => (TYPE_ARRAY_F32, encode_array!(v, f32)),
			Value::ArrayF64(v) => (TYPE_ARRAY_F64, encode_array!(v, f64)),
			Value::Unknown(code, b) => (*code, b.clone()),
		}
	}

	/// Decodes a value from its type code and raw (unpadded) bytes. Returns a `DecodeWarning`
	/// alongside the value for the unknown-type-code case; the value is always produced (never
	/// a hard error), since an unrecognised type is recoverable per spec.md §4.1.
	pub fn decode(type_id: u8, bytes: &[u8]) -> (Value, Option<DecodeWarning>) {
		match type_id {
			TYPE_I32 => (Value::I32(i32::from_le_bytes(pad4(bytes))), None),
			TYPE_U32 => (Value::U32(u32::from_le_bytes(pad4(bytes))), None),
			TYPE_I64 => (Value::I64(i64::from_le_bytes(pad8(bytes))), None),
			TYPE_U64 => (Value::U64(u64::from_le_bytes(pad8(bytes))), None),
			TYPE_F32 => (Value::F32(f32::from_le_bytes(pad4(bytes))), None),
			TYPE_F64 => (Value::F64(f64::from_le_bytes(pad8(bytes))), None),
			TYPE_STRING => {
				let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
				(Value::String(String::from_utf8_lossy(&bytes[..end]).into_owned()), None)
			}
			TYPE_RAW => (Value::Raw(bytes.to_vec()), None),
			TYPE_ARRAY_U8 => (Value::ArrayU8(bytes.to_vec()), None),
			TYPE_ARRAY_I8 => (Value::ArrayI8(bytes.iter().map(|&b| b as i8).collect()), None),
			TYPE_ARRAY_U16 => (decode_array!(bytes, u16, ArrayU16), None),
			TYPE_ARRAY_I16 => (decode_array!(bytes, i16, ArrayI16), None),
			TYPE_ARRAY_U32 => (decode_array!(bytes, u32, ArrayU32), None),
			TYPE_ARRAY_I32 => (decode_array!(bytes, i32, ArrayI32), None),
			TYPE_ARRAY_U64 => (decode_array!(bytes, u64, ArrayU64), None),
			TYPE_ARRAY_I64 => (decode_array!(bytes, i64, ArrayI64), None),
			TYPE_ARRAY_F32 => (decode_array!(bytes, f32, ArrayF32), None),
			TYPE_ARRAY_F64 => (decode_array!(bytes, f64, ArrayF64), None),
			other => (Value::Unknown(other, bytes.to_vec()), Some(DecodeWarning::UnknownType(other))),
		}
	}
}

fn pad4(bytes: &[u8]) -> [u8; 4] {
	let mut out = [0u8; 4];
	let n = bytes.len().min(4);
	out[..n].copy_from_slice(&bytes[..n]);
	out
}

fn pad8(bytes: &[u8]) -> [u8; 8] {
	let mut out = [0u8; 8];
	let n = bytes.len().min(8);
	out[..n].copy_from_slice(&bytes[..n]);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip(v: Value) {
		let (code, bytes) = v.encode();
		let (decoded, warning) = Value::decode(code, &bytes);
		assert_eq!(decoded, v);
		assert_eq!(warning, None);
	}

	#[test]
	fn round_trips_scalars() {
		round_trip(Value::I32(-42));
		round_trip(Value::U32(42));
		round_trip(Value::I64(-(1i64 << 40)));
		round_trip(Value::U64(1u64 << 40));
		round_trip(Value::F32(1.5));
		round_trip(Value::F64(-2.25));
	}

	#[test]
	fn round_trips_string() {
		round_trip(Value::String("hello".to_string()));
	}

	#[test]
	fn string_decodes_up_to_first_nul() {
		let (decoded, _) = Value::decode(TYPE_STRING, b"abc\0garbage");
		assert_eq!(decoded, Value::String("abc".to_string()));
	}

	#[test]
	fn round_trips_raw_and_arrays() {
		round_trip(Value::Raw(vec![1, 2, 3]));
		round_trip(Value::ArrayU8(vec![1, 2, 3]));
		round_trip(Value::ArrayI16(vec![-1, 2, -3]));
		round_trip(Value::ArrayI16((0..2048).map(|i| (i % 7) as i16).collect()));
	}

	#[test]
	fn unknown_type_code_yields_warning_and_raw_bytes() {
		let (decoded, warning) = Value::decode(0x7f, &[1, 2, 3, 4]);
		assert_eq!(decoded, Value::Unknown(0x7f, vec![1, 2, 3, 4]));
		assert_eq!(warning, Some(DecodeWarning::UnknownType(0x7f)));
	}
}
