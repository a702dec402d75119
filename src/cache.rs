use super::*;

/// Identifiers of context nodes that were already written to a sink.
///
/// The cache is owned by whoever drives a flush, so its scope (one flush or
/// the whole output stream) is the caller's choice. Flushing only ever inserts.
#[derive(Debug, Default, Clone)]
pub struct NodeCache {
  written: HashSet<NodeId, BuildNoHashHasher<NodeId>>,
}

impl NodeCache {
  pub fn clear(&mut self) {
    self.written.clear();
  }

  #[must_use]
  pub fn contains(&self, id: NodeId) -> bool {
    self.written.contains(&id)
  }

  /// Returns `true` if `id` was not yet present.
  pub fn insert(&mut self, id: NodeId) -> bool {
    self.written.insert(id)
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.written.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.written.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }
}

/// Forwards records to a sink, dropping node records whose id is already
/// cached and caching the ones the sink accepted.
pub(crate) struct PathWriter<'a> {
  cache: &'a mut NodeCache,
  sink: &'a mut dyn RecordSink,
}

impl<'a> PathWriter<'a> {
  pub(crate) fn new(
    cache: &'a mut NodeCache,
    sink: &'a mut dyn RecordSink,
  ) -> Self {
    Self { cache, sink }
  }
}

impl RecordSink for PathWriter<'_> {
  fn write_record(&mut self, record: &Record<'_>) -> Result<(), SinkError> {
    let RecordDescriptor::Node(id) = record.descriptor else {
      return self.sink.write_record(record);
    };

    if self.cache.contains(id) {
      return Ok(());
    }

    self.sink.write_record(record)?;
    self.cache.insert(id);

    Ok(())
  }
}
