use super::*;

/// Most context nodes, and most immediate entries, kept per snapshot record.
pub const SNAP_MAX: usize = 80;

// Worst-case sizes used by the admission test: both count varints with
// margin, one node id varint, and one attribute id varint plus tagged value.
const COUNT_BYTES: usize = 20;
const NODE_BYTES: usize = MAX_VARINT_LEN;
const IMMEDIATE_BYTES: usize = MAX_VARINT_LEN + MAX_TAGGED_VALUE_LEN;

/// Memory usage aggregated over a chunk chain.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct UsageInfo {
  pub chunk_count: usize,
  pub reserved_bytes: usize,
  pub used_bytes: usize,
}

impl UsageInfo {
  pub fn merge(&mut self, other: UsageInfo) {
    self.chunk_count += other.chunk_count;
    self.reserved_bytes += other.reserved_bytes;
    self.used_bytes += other.used_bytes;
  }
}

/// What a flush wrote, and what it had to skip.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct FlushReport {
  /// Chunks whose remaining records were discarded after a decode error.
  pub malformed_chunks: usize,
  /// Snapshot records decoded and handed to the sink.
  pub records: usize,
  /// Sink calls that returned an error.
  pub sink_errors: usize,
  /// Referenced node ids the context tree could not resolve.
  pub unresolved_nodes: usize,
}

impl FlushReport {
  pub fn merge(&mut self, other: FlushReport) {
    self.malformed_chunks += other.malformed_chunks;
    self.records += other.records;
    self.sink_errors += other.sink_errors;
    self.unresolved_nodes += other.unresolved_nodes;
  }
}

/// Result of a successful `Chunk::save_snapshot`.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SaveInfo {
  /// Bytes appended to the chunk.
  pub bytes: usize,
  /// Entries dropped or values cut to fit the per-record limits.
  pub truncated: usize,
}

/// Fixed-capacity buffer of encoded snapshot records, optionally chained to
/// further chunks.
///
/// Each record is laid out as
/// `[n_nodes][n_attrs][node ids..][attribute ids..][tagged values..]`, with
/// counts and ids as varints. A chunk has a single writer; callers serialize
/// access to a chain themselves.
#[derive(Debug)]
pub struct Chunk {
  capacity: usize,
  data: Vec<u8>,
  next: Option<Box<Chunk>>,
  record_count: usize,
}

impl Drop for Chunk {
  fn drop(&mut self) {
    let mut next = self.next.take();

    while let Some(mut chunk) = next {
      next = chunk.next.take();
    }
  }
}

impl Chunk {
  /// Attach `chunk` (and anything chained behind it) to the end of this chain.
  pub fn append(&mut self, chunk: Chunk) {
    let mut slot = &mut self.next;

    while let Some(next) = slot {
      slot = &mut next.next;
    }

    *slot = Some(Box::new(chunk));
  }

  #[must_use]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  fn chain(&self) -> impl Iterator<Item = &Chunk> {
    iter::successors(Some(self), |chunk| chunk.next.as_deref())
  }

  /// Number of chunks in the chain starting here.
  #[must_use]
  pub fn chain_len(&self) -> usize {
    self.chain().count()
  }

  /// Worst-case encoded size of `snapshot`, computed without encoding it.
  #[must_use]
  pub fn estimated_size(snapshot: &Snapshot) -> usize {
    COUNT_BYTES
      + NODE_BYTES * snapshot.n_nodes().min(SNAP_MAX)
      + IMMEDIATE_BYTES * snapshot.n_immediate().min(SNAP_MAX)
  }

  /// Conservative admission test: `true` if `snapshot` is guaranteed to fit
  /// in the remaining space of this chunk.
  #[must_use]
  pub fn fits(&self, snapshot: &Snapshot) -> bool {
    self.position() + Self::estimated_size(snapshot) < self.capacity
  }

  /// Decode every record in the chain, write context paths not yet in
  /// `cache` and one snapshot record per buffered snapshot to `sink`.
  ///
  /// Afterwards this chunk is reset and every chained chunk is released.
  /// A decode error discards the rest of the affected chunk only.
  pub fn flush(
    &mut self,
    tree: &dyn ContextTree,
    sink: &mut dyn RecordSink,
    cache: &mut NodeCache,
  ) -> FlushReport {
    let mut report = FlushReport::default();
    let mut scratch = RecordScratch::default();

    self.flush_local(tree, sink, cache, &mut scratch, &mut report);

    let mut next = self.next.take();

    while let Some(mut chunk) = next {
      chunk.flush_local(tree, sink, cache, &mut scratch, &mut report);
      next = chunk.next.take();
    }

    report
  }

  fn flush_local(
    &mut self,
    tree: &dyn ContextTree,
    sink: &mut dyn RecordSink,
    cache: &mut NodeCache,
    scratch: &mut RecordScratch,
    report: &mut FlushReport,
  ) {
    let mut cursor = 0;

    for index in 0..self.record_count {
      if let Err(err) = scratch.decode(&self.data, &mut cursor) {
        error!(
          record = index,
          records = self.record_count,
          %err,
          "discarding corrupted trace chunk"
        );
        report.malformed_chunks += 1;
        break;
      }

      for &id in scratch.nodes.iter().chain(&scratch.attributes) {
        write_context_path(id, tree, sink, cache, report);
      }

      let record =
        Record::snapshot(&scratch.nodes, &scratch.attributes, &scratch.values);

      if let Err(err) = sink.write_record(&record) {
        warn!(%err, "failed to write snapshot record");
        report.sink_errors += 1;
      }

      report.records += 1;
    }

    self.reset();
  }

  #[must_use]
  pub fn has_next(&self) -> bool {
    self.next.is_some()
  }

  /// Usage aggregated over the chain starting here.
  #[must_use]
  pub fn info(&self) -> UsageInfo {
    self.chain().fold(UsageInfo::default(), |mut info, chunk| {
      info.chunk_count += 1;
      info.reserved_bytes += chunk.capacity;
      info.used_bytes += chunk.position();
      info
    })
  }

  #[must_use]
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      data: Vec::with_capacity(capacity),
      next: None,
      record_count: 0,
    }
  }

  #[must_use]
  pub fn next(&self) -> Option<&Chunk> {
    self.next.as_deref()
  }

  /// Bytes written so far.
  #[must_use]
  pub fn position(&self) -> usize {
    self.data.len()
  }

  #[must_use]
  pub fn record_count(&self) -> usize {
    self.record_count
  }

  /// Drop all records of this chunk. Chained chunks are left alone.
  pub fn reset(&mut self) {
    self.data.clear();
    self.record_count = 0;
  }

  /// Encode `snapshot` at the end of this chunk.
  ///
  /// Nodes and immediate entries past `SNAP_MAX` are dropped, and string or
  /// blob values are cut to `MAX_INLINE_BYTES`; the returned `SaveInfo`
  /// counts both. A snapshot without entries records nothing.
  ///
  /// # Errors
  ///
  /// Returns `TraceError::OutOfCapacity` if `fits` would reject `snapshot`.
  pub fn save_snapshot(
    &mut self,
    snapshot: &Snapshot,
  ) -> Result<SaveInfo, TraceError> {
    if snapshot.is_empty() {
      return Ok(SaveInfo::default());
    }

    if !self.fits(snapshot) {
      return Err(TraceError::OutOfCapacity {
        required: Self::estimated_size(snapshot),
        available: self.capacity.saturating_sub(self.position()),
      });
    }

    let n_nodes = snapshot.n_nodes().min(SNAP_MAX);
    let n_immediate = snapshot.n_immediate().min(SNAP_MAX);

    let mut truncated = (snapshot.n_nodes() - n_nodes)
      + (snapshot.n_immediate() - n_immediate);

    let start = self.position();

    encode_varint(n_nodes as u64, &mut self.data);
    encode_varint(n_immediate as u64, &mut self.data);

    for &id in &snapshot.nodes()[..n_nodes] {
      encode_varint(id, &mut self.data);
    }

    for &attribute in &snapshot.attributes()[..n_immediate] {
      encode_varint(attribute, &mut self.data);
    }

    for value in &snapshot.values()[..n_immediate] {
      if value.exceeds_inline() {
        truncated += 1;
      }
      encode_tagged_value(value, &mut self.data);
    }

    self.record_count += 1;

    Ok(SaveInfo {
      bytes: self.position() - start,
      truncated,
    })
  }
}

fn write_context_path(
  id: NodeId,
  tree: &dyn ContextTree,
  sink: &mut dyn RecordSink,
  cache: &mut NodeCache,
  report: &mut FlushReport,
) {
  if cache.contains(id) {
    return;
  }

  let Some(node) = tree.node(id) else {
    debug!(node = id, "skipping unresolved context node");
    report.unresolved_nodes += 1;
    cache.insert(id);
    return;
  };

  // A failed write leaves the id uncached so a later flush retries it.
  let mut writer = PathWriter::new(cache, sink);

  match tree.write_path(&node, &mut writer) {
    Ok(()) => {
      cache.insert(id);
    }
    Err(err) => {
      warn!(node = id, %err, "failed to write context path");
      report.sink_errors += 1;
    }
  }
}

/// Decode buffers reused across records of one flush.
#[derive(Debug, Default)]
struct RecordScratch {
  attributes: Vec<NodeId>,
  nodes: Vec<NodeId>,
  values: Vec<Variant>,
}

impl RecordScratch {
  fn decode(
    &mut self,
    data: &[u8],
    cursor: &mut usize,
  ) -> Result<(), TraceError> {
    self.attributes.clear();
    self.nodes.clear();
    self.values.clear();

    let n_nodes = clamp_count(decode_varint(data, cursor)?);
    let n_attrs = clamp_count(decode_varint(data, cursor)?);

    for _ in 0..n_nodes {
      self.nodes.push(decode_varint(data, cursor)?);
    }

    for _ in 0..n_attrs {
      self.attributes.push(decode_varint(data, cursor)?);
    }

    for _ in 0..n_attrs {
      self.values.push(decode_tagged_value(data, cursor)?);
    }

    Ok(())
  }
}

fn clamp_count(count: u64) -> usize {
  count.min(SNAP_MAX as u64) as usize
}

#[cfg(test)]
mod tests {
  use super::*;

  fn roots(ids: &[NodeId]) -> ContextRegistry {
    let registry = ContextRegistry::new();
    for &id in ids {
      registry.insert(ContextNode::new(id, 0, Variant::Id(id)));
    }
    registry
  }

  fn closed_sink(_: &Record<'_>) -> Result<(), SinkError> {
    Err(SinkError::Io(io::Error::other("closed")))
  }

  struct RefuseNode {
    failures: usize,
    id: NodeId,
  }

  impl RecordSink for RefuseNode {
    fn write_record(&mut self, record: &Record<'_>) -> Result<(), SinkError> {
      if record.descriptor == RecordDescriptor::Node(self.id) {
        self.failures += 1;
        return Err(SinkError::Io(io::Error::other("busy")));
      }
      Ok(())
    }
  }

  fn flush_all(
    chunk: &mut Chunk,
    tree: &dyn ContextTree,
  ) -> (FlushReport, RecordCollector) {
    let mut sink = RecordCollector::new();
    let mut cache = NodeCache::new();
    let report = chunk.flush(tree, &mut sink, &mut cache);
    (report, sink)
  }

  #[test]
  fn saves_and_flushes_single_snapshot() {
    let tree = roots(&[2, 3, 5, 9, 12]);
    let mut chunk = Chunk::new(1024);

    let snapshot = Snapshot::new()
      .node(5)
      .node(9)
      .node(12)
      .immediate(2, 7i64)
      .immediate(3, "x");

    assert!(chunk.fits(&snapshot));
    chunk.save_snapshot(&snapshot).expect("save");
    assert_eq!(chunk.record_count(), 1);
    assert!(chunk.position() > 0);

    let (report, sink) = flush_all(&mut chunk, &tree);

    assert_eq!(report.records, 1);
    assert_eq!(sink.node_ids(), vec![5, 9, 12, 2, 3]);

    let snapshots = sink.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].nodes, vec![5, 9, 12]);
    assert_eq!(snapshots[0].attributes, vec![2, 3]);
    assert_eq!(snapshots[0].values, vec![Variant::Int(7), Variant::from("x")]);
    assert_eq!(chunk.record_count(), 0);
    assert_eq!(chunk.position(), 0);
  }

  #[test]
  fn round_trips_every_value_type() {
    let tree = ContextRegistry::new();
    let mut chunk = Chunk::new(4096);

    let values = vec![
      Variant::Empty,
      Variant::Bool(false),
      Variant::Int(-1),
      Variant::UInt(1 << 40),
      Variant::Double(3.5),
      Variant::Id(77),
      Variant::from("region"),
      Variant::from(vec![1u8, 2, 3]),
    ];

    let mut snapshot = Snapshot::new().node(u64::MAX).node(0);
    for (attribute, value) in values.iter().enumerate() {
      snapshot.push_immediate(100 + attribute as u64, value.clone());
    }

    let saved = chunk.save_snapshot(&snapshot).expect("save");
    assert_eq!(saved.truncated, 0);
    assert!(saved.bytes <= Chunk::estimated_size(&snapshot));

    let (_, sink) = flush_all(&mut chunk, &tree);
    let record = sink.snapshots()[0].clone();

    assert_eq!(record.nodes, snapshot.nodes());
    assert_eq!(record.attributes, snapshot.attributes());
    assert_eq!(record.values, values);
  }

  #[test]
  fn truncates_nodes_past_cap() {
    let tree = ContextRegistry::new();
    let mut chunk = Chunk::new(64 * 1024);

    let mut snapshot = Snapshot::new();
    for id in 0..(SNAP_MAX as u64 + 5) {
      snapshot.push_node(id);
    }

    let saved = chunk.save_snapshot(&snapshot).expect("save");
    assert_eq!(saved.truncated, 5);

    let (report, sink) = flush_all(&mut chunk, &tree);
    let record = sink.snapshots()[0].clone();

    assert_eq!(record.nodes, (0..SNAP_MAX as u64).collect::<Vec<_>>());
    assert_eq!(report.unresolved_nodes, SNAP_MAX);
  }

  #[test]
  fn admitted_snapshots_never_exceed_capacity() {
    let mut chunk = Chunk::new(8 * 1024);

    let mut worst = Snapshot::with_capacity(SNAP_MAX, SNAP_MAX);
    for _ in 0..SNAP_MAX {
      worst.push_node(u64::MAX);
      worst.push_immediate(u64::MAX, "a string longer than twenty bytes");
    }

    let mut saved = 0;
    while chunk.fits(&worst) {
      let info = chunk.save_snapshot(&worst).expect("save");
      assert!(info.bytes <= Chunk::estimated_size(&worst));
      assert!(chunk.position() <= chunk.capacity());
      saved += 1;
    }

    assert!(saved > 0);
    assert_eq!(chunk.record_count(), saved);
  }

  #[test]
  fn rejects_save_without_room() {
    let mut chunk = Chunk::new(32);
    let snapshot = Snapshot::new().node(1).immediate(2, 3i64);

    assert!(!chunk.fits(&snapshot));

    let err = chunk.save_snapshot(&snapshot).unwrap_err();

    assert_eq!(
      err,
      TraceError::OutOfCapacity {
        required: 62,
        available: 32
      }
    );
    assert_eq!(chunk.position(), 0);
    assert_eq!(chunk.record_count(), 0);
  }

  #[test]
  fn admission_is_conservative() {
    let snapshot = Snapshot::new().node(1);
    let mut chunk = Chunk::new(Chunk::estimated_size(&snapshot));

    // The record needs three bytes but the estimate does not fit.
    assert!(!chunk.fits(&snapshot));
    assert!(chunk.save_snapshot(&snapshot).is_err());
  }

  #[test]
  fn empty_snapshot_is_not_recorded() {
    let mut chunk = Chunk::new(8);

    let saved = chunk.save_snapshot(&Snapshot::new()).expect("no-op");

    assert_eq!(saved, SaveInfo::default());
    assert_eq!(chunk.record_count(), 0);
  }

  #[test]
  fn shared_nodes_are_written_once() {
    let tree = roots(&[4]);
    let mut chunk = Chunk::new(1024);

    chunk.save_snapshot(&Snapshot::new().node(4)).expect("first");
    chunk
      .save_snapshot(&Snapshot::new().node(4).immediate(4, 1i64))
      .expect("second");

    let (report, sink) = flush_all(&mut chunk, &tree);

    assert_eq!(report.records, 2);
    assert_eq!(sink.node_ids(), vec![4]);
    assert_eq!(sink.snapshots().len(), 2);
  }

  #[test]
  fn ancestors_are_written_before_nodes() {
    let tree = ContextRegistry::new();
    tree.insert(ContextNode::new(1, 0, "main"));
    tree.insert(ContextNode::new(2, 0, "solve").parent(1));
    tree.insert(ContextNode::new(3, 0, "io").parent(1));

    let mut chunk = Chunk::new(1024);
    chunk
      .save_snapshot(&Snapshot::new().node(2).node(3))
      .expect("save");

    let (_, sink) = flush_all(&mut chunk, &tree);

    assert_eq!(sink.node_ids(), vec![1, 2, 3]);
  }

  #[test]
  fn cache_spans_flushes_when_reused() {
    let tree = roots(&[8]);
    let mut cache = NodeCache::new();
    let mut sink = RecordCollector::new();
    let mut chunk = Chunk::new(256);

    for _ in 0..2 {
      chunk.save_snapshot(&Snapshot::new().node(8)).expect("save");
      chunk.flush(&tree, &mut sink, &mut cache);
    }

    assert_eq!(sink.node_ids(), vec![8]);
    assert_eq!(sink.snapshots().len(), 2);
  }

  #[test]
  fn unresolved_nodes_are_not_retried() {
    let tree = ContextRegistry::new();
    let mut chunk = Chunk::new(1024);

    chunk.save_snapshot(&Snapshot::new().node(42)).expect("first");
    chunk.save_snapshot(&Snapshot::new().node(42)).expect("second");

    let mut sink = RecordCollector::new();
    let mut cache = NodeCache::new();
    let report = chunk.flush(&tree, &mut sink, &mut cache);

    assert_eq!(report.unresolved_nodes, 1);
    assert!(cache.contains(42));
    assert!(sink.node_ids().is_empty());
    assert_eq!(sink.snapshots().len(), 2);
  }

  #[test]
  fn flush_consumes_whole_chain() {
    let tree = ContextRegistry::new();
    let mut head = Chunk::new(256);
    head.save_snapshot(&Snapshot::new().node(1)).expect("head");

    for records in [2, 3] {
      let mut chunk = Chunk::new(256);
      for _ in 0..records {
        chunk.save_snapshot(&Snapshot::new().node(1)).expect("tail");
      }
      head.append(chunk);
    }

    assert_eq!(head.chain_len(), 3);

    let (report, sink) = flush_all(&mut head, &tree);

    assert_eq!(report.records, 6);
    assert_eq!(sink.snapshots().len(), 6);
    assert_eq!(head.record_count(), 0);
    assert!(!head.has_next());
  }

  #[test]
  fn corrupted_chunk_does_not_stop_chain() {
    let tree = ContextRegistry::new();
    let mut head = Chunk::new(256);
    head.save_snapshot(&Snapshot::new().node(1)).expect("head");
    head.save_snapshot(&Snapshot::new().node(2)).expect("head");
    head.data.truncate(head.data.len() - 1);
    head.data.push(0x80);

    let mut tail = Chunk::new(256);
    tail.save_snapshot(&Snapshot::new().node(3)).expect("tail");
    head.append(tail);

    let (report, sink) = flush_all(&mut head, &tree);

    assert_eq!(report.malformed_chunks, 1);
    assert_eq!(report.records, 2);
    assert_eq!(sink.snapshots()[1].nodes, vec![3]);
    assert_eq!(head.record_count(), 0);
  }

  #[test]
  fn sink_errors_are_counted_not_fatal() {
    let tree = roots(&[1]);
    let mut chunk = Chunk::new(256);
    chunk.save_snapshot(&Snapshot::new().node(1)).expect("save");

    let mut sink = closed_sink;
    let mut cache = NodeCache::new();
    let report = chunk.flush(&tree, &mut sink, &mut cache);

    assert_eq!(report.records, 1);
    assert_eq!(report.sink_errors, 2);
    assert!(!cache.contains(1));
  }

  #[test]
  fn failed_path_writes_are_retried_next_flush() {
    let tree = ContextRegistry::new();
    tree.insert(ContextNode::new(1, 0, "main"));
    tree.insert(ContextNode::new(2, 0, "solve").parent(1));

    let mut cache = NodeCache::new();
    let mut chunk = Chunk::new(256);
    chunk.save_snapshot(&Snapshot::new().node(2)).expect("save");

    let mut refuse_root = RefuseNode { id: 1, failures: 0 };
    let report = chunk.flush(&tree, &mut refuse_root, &mut cache);

    assert_eq!(refuse_root.failures, 1);
    assert_eq!(report.sink_errors, 1);
    assert!(!cache.contains(1));
    assert!(!cache.contains(2));

    chunk.save_snapshot(&Snapshot::new().node(2)).expect("save again");

    let mut sink = RecordCollector::new();
    let report = chunk.flush(&tree, &mut sink, &mut cache);

    assert_eq!(report.sink_errors, 0);
    assert_eq!(sink.node_ids(), vec![1, 2]);
    assert!(cache.contains(1) && cache.contains(2));
  }

  #[test]
  fn decoded_node_counts_are_clamped() {
    let tree = ContextRegistry::new();
    let mut chunk = Chunk::new(1024);

    encode_varint(100, &mut chunk.data);
    encode_varint(0, &mut chunk.data);
    for id in 0..100 {
      encode_varint(id, &mut chunk.data);
    }
    chunk.record_count = 1;

    let (report, sink) = flush_all(&mut chunk, &tree);
    let snapshots = sink.snapshots();

    assert_eq!(report.records, 1);
    assert_eq!(report.malformed_chunks, 0);
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].nodes, (0..SNAP_MAX as u64).collect::<Vec<_>>());
  }

  #[test]
  fn truncates_immediates_past_cap() {
    let tree = ContextRegistry::new();
    let mut chunk = Chunk::new(64 * 1024);

    let mut snapshot = Snapshot::new();
    for attribute in 0..(SNAP_MAX as u64 + 10) {
      snapshot.push_immediate(attribute, attribute);
    }

    let saved = chunk.save_snapshot(&snapshot).expect("save");
    assert_eq!(saved.truncated, 10);

    let (_, sink) = flush_all(&mut chunk, &tree);
    let record = sink.snapshots()[0].clone();

    assert_eq!(record.attributes, (0..SNAP_MAX as u64).collect::<Vec<_>>());
    assert_eq!(record.values.len(), SNAP_MAX);
    assert_eq!(record.values[SNAP_MAX - 1], Variant::UInt(SNAP_MAX as u64 - 1));
  }

  #[test]
  fn info_aggregates_chain() {
    let mut head = Chunk::new(128);
    head.save_snapshot(&Snapshot::new().node(1)).expect("save");
    head.append(Chunk::new(256));
    head.append(Chunk::new(512));

    let info = head.info();

    assert_eq!(
      info,
      UsageInfo {
        chunk_count: 3,
        reserved_bytes: 896,
        used_bytes: 3,
      }
    );
  }

  #[test]
  fn reset_keeps_successors() {
    let mut head = Chunk::new(128);
    head.save_snapshot(&Snapshot::new().node(1)).expect("save");
    head.append(Chunk::new(128));

    head.reset();

    assert_eq!(head.position(), 0);
    assert_eq!(head.record_count(), 0);
    assert!(head.has_next());
  }

  #[test]
  fn long_chains_drop_without_recursion() {
    let mut head = Chunk::new(1);

    for _ in 0..200_000 {
      let mut chunk = Chunk::new(1);
      chunk.append(head);
      head = chunk;
    }

    assert_eq!(head.info().chunk_count, 200_001);
    drop(head);
  }
}
