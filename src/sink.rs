use super::*;

/// Shape of a record handed to a sink.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordDescriptor {
  /// A single context node; the node group holds its parent, if any.
  Node(NodeId),
  /// One buffered snapshot.
  Snapshot,
}

/// Borrowed view of one record: three parallel groups of node ids, attribute
/// ids and values. Attributes and values always have equal length.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Record<'a> {
  pub descriptor: RecordDescriptor,
  pub nodes: &'a [NodeId],
  pub attributes: &'a [NodeId],
  pub values: &'a [Variant],
}

impl<'a> Record<'a> {
  #[must_use]
  pub fn group_counts(&self) -> [usize; 3] {
    [self.nodes.len(), self.attributes.len(), self.values.len()]
  }

  #[must_use]
  pub fn node(node: &'a ContextNode) -> Self {
    Self {
      descriptor: RecordDescriptor::Node(node.id),
      nodes: node.parent.as_slice(),
      attributes: std::slice::from_ref(&node.attribute),
      values: std::slice::from_ref(&node.value),
    }
  }

  #[must_use]
  pub fn snapshot(
    nodes: &'a [NodeId],
    attributes: &'a [NodeId],
    values: &'a [Variant],
  ) -> Self {
    Self {
      descriptor: RecordDescriptor::Snapshot,
      nodes,
      attributes,
      values,
    }
  }

  #[must_use]
  pub fn to_owned_record(&self) -> OwnedRecord {
    OwnedRecord {
      descriptor: self.descriptor,
      nodes: self.nodes.to_vec(),
      attributes: self.attributes.to_vec(),
      values: self.values.to_vec(),
    }
  }
}

/// Owned copy of a `Record`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OwnedRecord {
  pub descriptor: RecordDescriptor,
  pub nodes: Vec<NodeId>,
  pub attributes: Vec<NodeId>,
  pub values: Vec<Variant>,
}

/// Destination for flushed node and snapshot records.
pub trait RecordSink {
  /// # Errors
  ///
  /// Returns a `SinkError` if the record cannot be encoded or persisted.
  fn write_record(&mut self, record: &Record<'_>) -> Result<(), SinkError>;

  /// # Errors
  ///
  /// Returns a `SinkError` if buffered output cannot be persisted.
  fn flush(&mut self) -> Result<(), SinkError> {
    Ok(())
  }
}

impl<F> RecordSink for F
where
  F: FnMut(&Record<'_>) -> Result<(), SinkError>,
{
  fn write_record(&mut self, record: &Record<'_>) -> Result<(), SinkError> {
    self(record)
  }
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordCollector {
  records: Vec<OwnedRecord>,
}

impl RecordSink for RecordCollector {
  fn write_record(&mut self, record: &Record<'_>) -> Result<(), SinkError> {
    self.records.push(record.to_owned_record());
    Ok(())
  }
}

impl RecordCollector {
  pub fn into_records(self) -> Vec<OwnedRecord> {
    self.records
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Identifiers of every node record, in emission order.
  #[must_use]
  pub fn node_ids(&self) -> Vec<NodeId> {
    self
      .records
      .iter()
      .filter_map(|record| match record.descriptor {
        RecordDescriptor::Node(id) => Some(id),
        RecordDescriptor::Snapshot => None,
      })
      .collect()
  }

  #[must_use]
  pub fn records(&self) -> &[OwnedRecord] {
    &self.records
  }

  #[must_use]
  pub fn snapshots(&self) -> Vec<&OwnedRecord> {
    self
      .records
      .iter()
      .filter(|record| record.descriptor == RecordDescriptor::Snapshot)
      .collect()
  }
}

/// Cloneable handle that lets several owners write into one sink.
#[derive(Debug, Default)]
pub struct SharedSink<S> {
  inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedSink<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: RecordSink> RecordSink for SharedSink<S> {
  fn write_record(&mut self, record: &Record<'_>) -> Result<(), SinkError> {
    self.lock().write_record(record)
  }

  fn flush(&mut self) -> Result<(), SinkError> {
    self.lock().flush()
  }
}

impl<S> SharedSink<S> {
  /// Lock the wrapped sink, recovering it if a writer panicked.
  pub fn lock(&self) -> MutexGuard<'_, S> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  pub fn new(sink: S) -> Self {
    Self {
      inner: Arc::new(Mutex::new(sink)),
    }
  }
}

/// JSON lines sink that writes one JSON object per record.
pub struct JsonLinesSink<W: Write> {
  writer: W,
}

impl<W: Write> RecordSink for JsonLinesSink<W> {
  fn write_record(&mut self, record: &Record<'_>) -> Result<(), SinkError> {
    serde_json::to_writer(&mut self.writer, record)?;
    self.writer.write_all(b"\n")?;
    Ok(())
  }

  fn flush(&mut self) -> Result<(), SinkError> {
    self.writer.flush()?;
    Ok(())
  }
}

impl<W: Write> JsonLinesSink<W> {
  pub fn into_inner(self) -> W {
    self.writer
  }

  pub fn new(writer: W) -> Self {
    Self { writer }
  }
}
