use super::*;

/// Upper bound on the encoded length of a `u64` varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Longest string or blob payload stored inline in an encoded value. Longer
/// payloads are cut to this many bytes when packed.
pub const MAX_INLINE_BYTES: usize = 20;

/// Upper bound on the encoded length of any tagged value: tag byte, length
/// byte and an inline payload.
pub const MAX_TAGGED_VALUE_LEN: usize = 2 + MAX_INLINE_BYTES;

const TAG_EMPTY: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_DOUBLE: u8 = 4;
const TAG_ID: u8 = 5;
const TAG_STR: u8 = 6;
const TAG_BLOB: u8 = 7;

/// A self-describing scalar attached to a snapshot or context node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Variant {
  #[default]
  Empty,
  Bool(bool),
  Int(i64),
  UInt(u64),
  Double(f64),
  Id(NodeId),
  Str(String),
  Blob(Vec<u8>),
}

impl Variant {
  #[must_use]
  pub fn as_id(&self) -> Option<NodeId> {
    match self {
      Self::Id(id) | Self::UInt(id) => Some(*id),
      _ => None,
    }
  }

  /// Whether packing this value drops part of its payload.
  #[must_use]
  pub fn exceeds_inline(&self) -> bool {
    match self {
      Self::Str(value) => value.len() > MAX_INLINE_BYTES,
      Self::Blob(value) => value.len() > MAX_INLINE_BYTES,
      _ => false,
    }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    matches!(self, Self::Empty)
  }
}

impl From<bool> for Variant {
  fn from(value: bool) -> Self {
    Self::Bool(value)
  }
}

impl From<i64> for Variant {
  fn from(value: i64) -> Self {
    Self::Int(value)
  }
}

impl From<u64> for Variant {
  fn from(value: u64) -> Self {
    Self::UInt(value)
  }
}

impl From<f64> for Variant {
  fn from(value: f64) -> Self {
    Self::Double(value)
  }
}

impl From<&str> for Variant {
  fn from(value: &str) -> Self {
    Self::Str(value.to_string())
  }
}

impl From<String> for Variant {
  fn from(value: String) -> Self {
    Self::Str(value)
  }
}

impl From<Vec<u8>> for Variant {
  fn from(value: Vec<u8>) -> Self {
    Self::Blob(value)
  }
}

/// Append `value` as a base-128 varint, least significant group first.
/// Returns the number of bytes written.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) -> usize {
  let start = out.len();

  while value >= 0x80 {
    out.push((value as u8 & 0x7f) | 0x80);
    value >>= 7;
  }

  out.push(value as u8);

  out.len() - start
}

/// Read a varint starting at `cursor` and advance the cursor past it.
///
/// # Errors
///
/// Returns `TraceError::MalformedEncoding` if the input ends before the varint
/// terminates or the encoded value does not fit in 64 bits.
pub fn decode_varint(
  buf: &[u8],
  cursor: &mut usize,
) -> Result<u64, TraceError> {
  let start = *cursor;
  let mut value = 0u64;

  for index in 0..MAX_VARINT_LEN {
    let Some(&byte) = buf.get(start + index) else {
      return Err(TraceError::malformed(start, "truncated varint"));
    };

    let payload = u64::from(byte & 0x7f);

    if index == MAX_VARINT_LEN - 1 && payload > 1 {
      return Err(TraceError::malformed(start, "varint overflows u64"));
    }

    value |= payload << (7 * index);

    if byte & 0x80 == 0 {
      *cursor = start + index + 1;
      return Ok(value);
    }
  }

  Err(TraceError::malformed(start, "varint longer than 10 bytes"))
}

/// Append a tagged value. String and blob payloads longer than
/// `MAX_INLINE_BYTES` are cut; strings on a UTF-8 boundary.
pub fn encode_tagged_value(value: &Variant, out: &mut Vec<u8>) -> usize {
  let start = out.len();

  match value {
    Variant::Empty => out.push(TAG_EMPTY),
    Variant::Bool(flag) => out.extend_from_slice(&[TAG_BOOL, u8::from(*flag)]),
    Variant::Int(int) => {
      out.push(TAG_INT);
      encode_varint(zigzag(*int), out);
    }
    Variant::UInt(uint) => {
      out.push(TAG_UINT);
      encode_varint(*uint, out);
    }
    Variant::Double(double) => {
      out.push(TAG_DOUBLE);
      out.extend_from_slice(&double.to_le_bytes());
    }
    Variant::Id(id) => {
      out.push(TAG_ID);
      encode_varint(*id, out);
    }
    Variant::Str(text) => {
      out.push(TAG_STR);
      encode_bytes(inline_str(text).as_bytes(), out);
    }
    Variant::Blob(bytes) => {
      out.push(TAG_BLOB);
      encode_bytes(&bytes[..bytes.len().min(MAX_INLINE_BYTES)], out);
    }
  }

  out.len() - start
}

/// Read a tagged value starting at `cursor` and advance the cursor past it.
///
/// # Errors
///
/// Returns `TraceError::MalformedEncoding` for an unknown tag, a truncated
/// payload, or a string payload that is not valid UTF-8.
pub fn decode_tagged_value(
  buf: &[u8],
  cursor: &mut usize,
) -> Result<Variant, TraceError> {
  let start = *cursor;

  let Some(&tag) = buf.get(start) else {
    return Err(TraceError::malformed(start, "missing value tag"));
  };

  *cursor = start + 1;

  let value = match tag {
    TAG_EMPTY => Variant::Empty,
    TAG_BOOL => match take(buf, cursor, 1)? {
      [0] => Variant::Bool(false),
      [1] => Variant::Bool(true),
      _ => return Err(TraceError::malformed(start, "invalid bool payload")),
    },
    TAG_INT => Variant::Int(unzigzag(decode_varint(buf, cursor)?)),
    TAG_UINT => Variant::UInt(decode_varint(buf, cursor)?),
    TAG_DOUBLE => {
      let mut bytes = [0u8; 8];
      bytes.copy_from_slice(take(buf, cursor, 8)?);
      Variant::Double(f64::from_le_bytes(bytes))
    }
    TAG_ID => Variant::Id(decode_varint(buf, cursor)?),
    TAG_STR => {
      let bytes = decode_bytes(buf, cursor)?;
      let text = std::str::from_utf8(bytes)
        .map_err(|_| TraceError::malformed(start, "string is not utf-8"))?;
      Variant::Str(text.to_string())
    }
    TAG_BLOB => Variant::Blob(decode_bytes(buf, cursor)?.to_vec()),
    _ => return Err(TraceError::malformed(start, "unknown value tag")),
  };

  Ok(value)
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
  encode_varint(bytes.len() as u64, out);
  out.extend_from_slice(bytes);
}

fn decode_bytes<'a>(
  buf: &'a [u8],
  cursor: &mut usize,
) -> Result<&'a [u8], TraceError> {
  let start = *cursor;
  let len = decode_varint(buf, cursor)?;

  if len > MAX_INLINE_BYTES as u64 {
    return Err(TraceError::malformed(start, "inline payload too long"));
  }

  take(buf, cursor, len as usize)
}

fn take<'a>(
  buf: &'a [u8],
  cursor: &mut usize,
  len: usize,
) -> Result<&'a [u8], TraceError> {
  let start = *cursor;

  let bytes = start
    .checked_add(len)
    .and_then(|end| buf.get(start..end))
    .ok_or_else(|| TraceError::malformed(start, "truncated payload"))?;

  *cursor = start + len;

  Ok(bytes)
}

fn inline_str(text: &str) -> &str {
  if text.len() <= MAX_INLINE_BYTES {
    return text;
  }

  let mut end = MAX_INLINE_BYTES;

  while !text.is_char_boundary(end) {
    end -= 1;
  }

  &text[..end]
}

fn zigzag(value: i64) -> u64 {
  ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
  ((value >> 1) as i64) ^ -((value & 1) as i64)
}
