use super::*;

/// Result of offering a snapshot to a `TraceBuffer`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PushOutcome {
  /// The snapshot was dropped; it could not be admitted under the policy.
  Dropped,
  /// The buffer must be flushed before this snapshot can be saved.
  FlushPending,
  /// The snapshot was saved into a freshly chained chunk.
  Grew,
  /// The snapshot had no entries and was ignored.
  Ignored,
  /// The snapshot was saved into the current chunk.
  Saved,
}

/// Chunk chain owned by a single writer.
///
/// The head chunk is always the one being written; when it fills up under
/// `BufferPolicy::Grow` a fresh chunk takes its place and the old chain is
/// appended behind it.
#[derive(Debug)]
pub struct TraceBuffer {
  chunk_size: usize,
  chunks: Chunk,
  dropped: u64,
  max_chunks: Option<usize>,
  policy: BufferPolicy,
  saved: u64,
  truncated: u64,
  warned_truncation: bool,
}

impl TraceBuffer {
  /// Number of snapshots dropped since the buffer was created.
  #[must_use]
  pub fn dropped(&self) -> u64 {
    self.dropped
  }

  /// Write every buffered record to `sink` and release all but one chunk.
  pub fn flush(
    &mut self,
    tree: &dyn ContextTree,
    sink: &mut dyn RecordSink,
    cache: &mut NodeCache,
  ) -> FlushReport {
    self.chunks.flush(tree, sink, cache)
  }

  #[must_use]
  pub fn info(&self) -> UsageInfo {
    self.chunks.info()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.record_count() == 0
  }

  #[must_use]
  pub fn new(config: &TraceConfig) -> Self {
    Self {
      chunk_size: config.chunk_size,
      chunks: Chunk::new(config.chunk_size),
      dropped: 0,
      max_chunks: config.max_chunks,
      policy: config.buffer_policy,
      saved: 0,
      truncated: 0,
      warned_truncation: false,
    }
  }

  /// Offer `snapshot` to the buffer, applying the configured policy when the
  /// current chunk is full.
  ///
  /// # Errors
  ///
  /// Returns an error if an admitted snapshot could not be encoded.
  pub fn push(
    &mut self,
    snapshot: &Snapshot,
  ) -> Result<PushOutcome, TraceError> {
    if snapshot.is_empty() {
      return Ok(PushOutcome::Ignored);
    }

    if self.chunks.fits(snapshot) {
      self.save(snapshot)?;
      return Ok(PushOutcome::Saved);
    }

    let size = Chunk::estimated_size(snapshot);

    if size >= self.chunk_size {
      warn!(
        size,
        chunk_size = self.chunk_size,
        "snapshot cannot fit in an empty chunk"
      );
      return Ok(self.drop_snapshot());
    }

    match self.policy {
      BufferPolicy::Grow => {
        let chunk_count = self.chunks.chain_len();

        if self.max_chunks.is_some_and(|max| chunk_count >= max) {
          return Ok(self.drop_snapshot());
        }

        let full = mem::replace(&mut self.chunks, Chunk::new(self.chunk_size));
        self.chunks.append(full);

        debug!(chunks = chunk_count + 1, "trace buffer grew");

        self.save(snapshot)?;
        Ok(PushOutcome::Grew)
      }
      BufferPolicy::Flush => Ok(PushOutcome::FlushPending),
      BufferPolicy::Stop => Ok(self.drop_snapshot()),
    }
  }

  /// Number of records currently buffered across the chain.
  #[must_use]
  pub fn record_count(&self) -> usize {
    iter::successors(Some(&self.chunks), |chunk| chunk.next())
      .map(Chunk::record_count)
      .sum()
  }

  /// Number of snapshots saved since the buffer was created.
  #[must_use]
  pub fn saved(&self) -> u64 {
    self.saved
  }

  /// Number of entries and values cut by per-record limits.
  #[must_use]
  pub fn truncated(&self) -> u64 {
    self.truncated
  }

  fn drop_snapshot(&mut self) -> PushOutcome {
    self.dropped = self.dropped.saturating_add(1);
    PushOutcome::Dropped
  }

  fn save(&mut self, snapshot: &Snapshot) -> Result<(), TraceError> {
    let info = self.chunks.save_snapshot(snapshot)?;

    self.saved = self.saved.saturating_add(1);

    if info.truncated > 0 {
      self.truncated = self.truncated.saturating_add(info.truncated as u64);

      if !self.warned_truncation {
        self.warned_truncation = true;
        warn!(
          dropped = info.truncated,
          limit = SNAP_MAX,
          "snapshot exceeded per-record limits and was truncated"
        );
      }
    }

    Ok(())
  }
}
