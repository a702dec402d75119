use super::*;

/// Errors raised while packing or unpacking snapshot records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
  /// An encoded varint or tagged value was truncated or otherwise invalid.
  MalformedEncoding { offset: usize, reason: &'static str },
  /// A snapshot was saved into a chunk that could not admit it.
  OutOfCapacity { required: usize, available: usize },
}

impl TraceError {
  pub(crate) fn malformed(offset: usize, reason: &'static str) -> Self {
    Self::MalformedEncoding { offset, reason }
  }
}

impl Display for TraceError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::MalformedEncoding { offset, reason } => {
        write!(f, "malformed encoding at byte {offset}: {reason}")
      }
      Self::OutOfCapacity {
        required,
        available,
      } => write!(
        f,
        "snapshot needs up to {required} bytes but only {available} remain"
      ),
    }
  }
}

impl std::error::Error for TraceError {}

/// Errors reported by a record sink.
#[derive(Debug)]
pub enum SinkError {
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for SinkError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error while writing record: {err}"),
      Self::Json(err) => write!(f, "failed to encode record as json: {err}"),
    }
  }
}

impl std::error::Error for SinkError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for SinkError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for SinkError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}
