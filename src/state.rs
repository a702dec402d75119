use super::*;

/// Builder that customizes `TraceConfig` before wiring up a `Tracer`.
#[derive(Debug, Default)]
pub struct TracerBuilder {
  config: TraceConfig,
}

impl TracerBuilder {
  #[must_use]
  pub fn buffer_policy(mut self, policy: BufferPolicy) -> Self {
    self.config.buffer_policy = policy;
    self
  }

  #[must_use]
  pub fn chunk_size(mut self, bytes: usize) -> Self {
    self.config.chunk_size = bytes;
    self
  }

  #[must_use]
  pub fn finish<S>(
    self,
    tree: Arc<dyn ContextTree + Send + Sync>,
    sink: S,
  ) -> Tracer
  where
    S: RecordSink + Send + 'static,
  {
    Tracer::with_config(self.config, tree, sink)
  }

  #[must_use]
  pub fn max_chunks(mut self, chunks: usize) -> Self {
    self.config = self.config.with_max_chunks(chunks);
    self
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      config: TraceConfig::default(),
    }
  }

  #[must_use]
  pub fn retain_node_cache(mut self, retain: bool) -> Self {
    self.config.retain_node_cache = retain;
    self
  }

  #[must_use]
  pub fn start_enabled(mut self, enabled: bool) -> Self {
    self.config.start_enabled = enabled;
    self
  }

  #[must_use]
  pub fn with_config(mut self, config: TraceConfig) -> Self {
    self.config = config;
    self
  }
}

struct TracerInner {
  buffers: DashMap<ThreadId, TraceBuffer>,
  cache: Mutex<NodeCache>,
  config: TraceConfig,
  dropped: AtomicU64,
  enabled: AtomicBool,
  sink: Mutex<Box<dyn RecordSink + Send>>,
  tree: Arc<dyn ContextTree + Send + Sync>,
}

impl fmt::Debug for TracerInner {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("TracerInner")
      .field("buffers", &self.buffers.len())
      .field("config", &self.config)
      .field("dropped", &self.dropped)
      .field("enabled", &self.enabled)
      .finish_non_exhaustive()
  }
}

/// Entry point for recording snapshots and flushing them to a sink.
///
/// Every recording thread gets its own `TraceBuffer`, so writers never share
/// a chunk chain. A flush walks all buffers with one written-node cache and
/// then releases the buffers it emptied; a thread's next `record` starts a
/// fresh one.
#[derive(Clone, Debug)]
pub struct Tracer {
  inner: Arc<TracerInner>,
}

impl Tracer {
  #[must_use]
  pub fn builder() -> TracerBuilder {
    TracerBuilder::new()
  }

  #[must_use]
  pub fn config(&self) -> &TraceConfig {
    &self.inner.config
  }

  pub fn disable(&self) {
    self.inner.enabled.store(false, Ordering::Release);
  }

  /// Snapshots dropped by all buffers so far.
  #[must_use]
  pub fn dropped(&self) -> u64 {
    let live: u64 = self
      .inner
      .buffers
      .iter()
      .map(|entry| entry.value().dropped())
      .sum();

    self.inner.dropped.load(Ordering::Relaxed) + live
  }

  pub fn enable(&self) {
    self.inner.enabled.store(true, Ordering::Release);
  }

  #[must_use]
  pub fn enabled(&self) -> bool {
    self.inner.enabled.load(Ordering::Acquire)
  }

  fn end_pass(&self) {
    if !self.inner.config.retain_node_cache {
      lock(&self.inner.cache).clear();
    }
  }

  /// Write every buffered snapshot of every thread to the sink.
  pub fn flush(&self) -> FlushReport {
    let mut report = FlushReport::default();
    let mut usage = UsageInfo::default();

    for mut entry in self.inner.buffers.iter_mut() {
      usage.merge(entry.value().info());
      report.merge(self.flush_buffer(entry.value_mut()));
    }

    self.release_empty_buffers();

    if let Err(err) = lock(&self.inner.sink).flush() {
      warn!(%err, "failed to flush record sink");
      report.sink_errors += 1;
    }

    self.end_pass();

    debug!(
      records = report.records,
      chunks = usage.chunk_count,
      reserved = usage.reserved_bytes,
      used = usage.used_bytes,
      "flushed trace buffers"
    );

    report
  }

  fn flush_buffer(&self, buffer: &mut TraceBuffer) -> FlushReport {
    let mut cache = lock(&self.inner.cache);
    let mut sink = lock(&self.inner.sink);

    buffer.flush(self.inner.tree.as_ref(), &mut **sink, &mut cache)
  }

  #[must_use]
  pub fn new<S>(tree: Arc<dyn ContextTree + Send + Sync>, sink: S) -> Self
  where
    S: RecordSink + Send + 'static,
  {
    Self::with_config(TraceConfig::default(), tree, sink)
  }

  /// Offer a snapshot to the calling thread's buffer.
  ///
  /// Under `BufferPolicy::Flush` a full buffer is written to the sink before
  /// the snapshot is saved.
  ///
  /// # Errors
  ///
  /// Returns an error if an admitted snapshot could not be encoded.
  pub fn record(&self, snapshot: &Snapshot) -> Result<PushOutcome, TraceError> {
    if !self.enabled() {
      return Ok(PushOutcome::Ignored);
    }

    let mut buffer = self
      .inner
      .buffers
      .entry(thread::current().id())
      .or_insert_with(|| TraceBuffer::new(&self.inner.config));

    match buffer.push(snapshot)? {
      PushOutcome::FlushPending => {
        let report = self.flush_buffer(&mut buffer);
        self.end_pass();

        debug!(records = report.records, "flushed full trace buffer");

        buffer.push(snapshot)
      }
      outcome => Ok(outcome),
    }
  }

  /// Drop every buffer holding no records, keeping its drop count.
  fn release_empty_buffers(&self) {
    let before = self.inner.buffers.len();

    self.inner.buffers.retain(|_, buffer| {
      if !buffer.is_empty() {
        return true;
      }

      self
        .inner
        .dropped
        .fetch_add(buffer.dropped(), Ordering::Relaxed);

      false
    });

    debug!(
      released = before.saturating_sub(self.inner.buffers.len()),
      "released empty trace buffers"
    );
  }

  /// Discard every buffered snapshot and drop count without writing them.
  pub fn reset(&self) {
    self.inner.buffers.clear();
    self.inner.dropped.store(0, Ordering::Relaxed);

    lock(&self.inner.cache).clear();
  }

  /// Memory reserved and used by all buffers.
  #[must_use]
  pub fn usage(&self) -> UsageInfo {
    let mut usage = UsageInfo::default();

    for entry in self.inner.buffers.iter() {
      usage.merge(entry.value().info());
    }

    usage
  }

  #[must_use]
  pub fn with_config<S>(
    config: TraceConfig,
    tree: Arc<dyn ContextTree + Send + Sync>,
    sink: S,
  ) -> Self
  where
    S: RecordSink + Send + 'static,
  {
    let enabled = AtomicBool::new(config.start_enabled);

    let inner = TracerInner {
      buffers: DashMap::new(),
      cache: Mutex::new(NodeCache::new()),
      config,
      dropped: AtomicU64::new(0),
      enabled,
      sink: Mutex::new(Box::new(sink)),
      tree,
    };

    Self {
      inner: Arc::new(inner),
    }
  }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}
