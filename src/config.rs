use super::*;

/// What a buffer does when its current chunk cannot admit a snapshot.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum BufferPolicy {
  /// Chain a fresh chunk in front of the full one.
  #[default]
  Grow,
  /// Flush the buffer to the sink, then retry.
  Flush,
  /// Drop the snapshot and count it.
  Stop,
}

impl FromStr for BufferPolicy {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value.trim().to_ascii_lowercase().as_str() {
      "grow" => Ok(Self::Grow),
      "flush" => Ok(Self::Flush),
      "stop" => Ok(Self::Stop),
      other => Err(format!(
        "unknown buffer policy `{other}` (expected grow, flush or stop)"
      )),
    }
  }
}

impl Display for BufferPolicy {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Grow => "grow",
      Self::Flush => "flush",
      Self::Stop => "stop",
    })
  }
}

/// Controls how snapshots are buffered before they are flushed.
#[derive(Debug, Clone)]
pub struct TraceConfig {
  /// Policy applied when the current chunk is full.
  pub buffer_policy: BufferPolicy,
  /// Capacity of each chunk, expressed in bytes.
  pub chunk_size: usize,
  /// Upper bound on chunks per writer under `BufferPolicy::Grow`.
  pub max_chunks: Option<usize>,
  /// Keep the written-node cache across flushes of the same output stream.
  pub retain_node_cache: bool,
  /// Whether to record snapshots immediately once constructed.
  pub start_enabled: bool,
}

impl Default for TraceConfig {
  fn default() -> Self {
    Self {
      buffer_policy: BufferPolicy::Grow,
      chunk_size: 2 * 1024 * 1024,
      max_chunks: None,
      retain_node_cache: true,
      start_enabled: true,
    }
  }
}

impl TraceConfig {
  /// Explicitly disable recording at start-up.
  #[must_use]
  pub fn disabled(mut self) -> Self {
    self.start_enabled = false;
    self
  }

  #[must_use]
  pub fn with_buffer_policy(mut self, policy: BufferPolicy) -> Self {
    self.buffer_policy = policy;
    self
  }

  #[must_use]
  pub fn with_chunk_size(mut self, bytes: usize) -> Self {
    self.chunk_size = bytes;
    self
  }

  #[must_use]
  pub fn with_max_chunks(mut self, chunks: usize) -> Self {
    self.max_chunks = Some(chunks.max(1));
    self
  }
}
