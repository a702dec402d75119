use {
  snaptrace::{
    BufferPolicy, ContextRegistry, ContextTree, JsonLinesSink, Snapshot,
    Tracer,
  },
  std::{io, sync::Arc},
  tracing_subscriber::EnvFilter,
};

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .with_writer(io::stderr)
    .init();

  let registry = Arc::new(ContextRegistry::new());

  let function = registry.create_node(0, "function", None);
  let iteration = registry.create_node(0, "iteration", None);
  let main = registry.create_node(function, "main", None);
  let solve = registry.create_node(function, "solve", Some(main));

  let tree: Arc<dyn ContextTree + Send + Sync> = registry.clone();

  let tracer = Tracer::builder()
    .chunk_size(256)
    .buffer_policy(BufferPolicy::Grow)
    .finish(tree, JsonLinesSink::new(io::stdout()));

  for step in 0..8i64 {
    let snapshot = Snapshot::new()
      .node(solve)
      .immediate(iteration, step)
      .immediate(function, "solve");

    if let Err(err) = tracer.record(&snapshot) {
      eprintln!("failed to record snapshot: {err}");
    }
  }

  let usage = tracer.usage();
  let report = tracer.flush();

  eprintln!("=== demo trace ===");
  eprintln!(
    "chunks={} reserved={}B used={}B",
    usage.chunk_count, usage.reserved_bytes, usage.used_bytes
  );
  eprintln!(
    "records={} dropped={} sink errors={}",
    report.records,
    tracer.dropped(),
    report.sink_errors
  );
}
