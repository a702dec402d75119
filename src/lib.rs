//! Core library entry point for the snapshot trace buffer.
//!
//! Snapshots of the current annotation context are packed into fixed-capacity
//! chunks on the hot path, then decoded, deduplicated and handed to a record
//! sink when the owning buffer is flushed.

mod buffer;
mod cache;
mod chunk;
mod codec;
mod config;
mod context;
mod error;
mod sink;
mod snapshot;
mod state;

use {
  cache::PathWriter,
  dashmap::DashMap,
  nohash_hasher::BuildNoHashHasher,
  serde::Serialize,
  std::{
    collections::HashSet,
    fmt::{self, Display, Formatter},
    io::{self, Write},
    iter, mem,
    str::FromStr,
    sync::{
      Arc, Mutex, MutexGuard,
      atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
  },
  tracing::{debug, error, warn},
};

pub use {
  buffer::{PushOutcome, TraceBuffer},
  cache::NodeCache,
  chunk::{Chunk, FlushReport, SNAP_MAX, SaveInfo, UsageInfo},
  codec::{
    MAX_INLINE_BYTES, MAX_TAGGED_VALUE_LEN, MAX_VARINT_LEN, Variant,
    decode_tagged_value, decode_varint, encode_tagged_value, encode_varint,
  },
  config::{BufferPolicy, TraceConfig},
  context::{ContextNode, ContextRegistry, ContextTree, NodeId},
  error::{SinkError, TraceError},
  sink::{
    JsonLinesSink, OwnedRecord, Record, RecordCollector, RecordDescriptor,
    RecordSink, SharedSink,
  },
  snapshot::Snapshot,
  state::{Tracer, TracerBuilder},
};
