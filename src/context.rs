use super::*;

/// Process-unique identifier of a context tree node.
pub type NodeId = u64;

/// Ancestor walks stop after this many hops so a corrupt tree cannot loop.
const MAX_PATH_DEPTH: usize = 4096;

/// One annotation scope in the context tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextNode {
  pub attribute: NodeId,
  pub id: NodeId,
  pub parent: Option<NodeId>,
  pub value: Variant,
}

impl ContextNode {
  #[must_use]
  pub fn new(id: NodeId, attribute: NodeId, value: impl Into<Variant>) -> Self {
    Self {
      attribute,
      id,
      parent: None,
      value: value.into(),
    }
  }

  #[must_use]
  pub fn parent(mut self, parent: NodeId) -> Self {
    self.parent = Some(parent);
    self
  }
}

/// Read access to the context tree owned by the surrounding runtime.
pub trait ContextTree {
  /// Look up a node by identifier.
  fn node(&self, id: NodeId) -> Option<Arc<ContextNode>>;

  /// Emit `node` and every ancestor to `sink`, root first.
  ///
  /// # Errors
  ///
  /// Returns the first error reported by the sink.
  fn write_path(
    &self,
    node: &ContextNode,
    sink: &mut dyn RecordSink,
  ) -> Result<(), SinkError> {
    let mut ancestors = Vec::new();
    let mut parent = node.parent;

    while let Some(id) = parent {
      if ancestors.len() >= MAX_PATH_DEPTH {
        warn!(node = node.id, "context path exceeds {MAX_PATH_DEPTH} levels");
        break;
      }

      let Some(ancestor) = self.node(id) else {
        break;
      };

      parent = ancestor.parent;
      ancestors.push(ancestor);
    }

    for ancestor in ancestors.iter().rev() {
      sink.write_record(&Record::node(ancestor))?;
    }

    sink.write_record(&Record::node(node))
  }
}

impl<T: ContextTree + ?Sized> ContextTree for Arc<T> {
  fn node(&self, id: NodeId) -> Option<Arc<ContextNode>> {
    (**self).node(id)
  }

  fn write_path(
    &self,
    node: &ContextNode,
    sink: &mut dyn RecordSink,
  ) -> Result<(), SinkError> {
    (**self).write_path(node, sink)
  }
}

/// Concurrent in-memory context tree.
#[derive(Debug)]
pub struct ContextRegistry {
  next_id: AtomicU64,
  nodes: DashMap<NodeId, Arc<ContextNode>, BuildNoHashHasher<NodeId>>,
}

impl Default for ContextRegistry {
  fn default() -> Self {
    Self {
      next_id: AtomicU64::new(1),
      nodes: DashMap::default(),
    }
  }
}

impl ContextTree for ContextRegistry {
  fn node(&self, id: NodeId) -> Option<Arc<ContextNode>> {
    self.nodes.get(&id).map(|entry| Arc::clone(entry.value()))
  }
}

impl ContextRegistry {
  /// Allocate a fresh identifier and register a node under it.
  pub fn create_node(
    &self,
    attribute: NodeId,
    value: impl Into<Variant>,
    parent: Option<NodeId>,
  ) -> NodeId {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);

    self.nodes.insert(
      id,
      Arc::new(ContextNode {
        attribute,
        id,
        parent,
        value: value.into(),
      }),
    );

    id
  }

  /// Register a node under its own identifier, replacing any previous node.
  ///
  /// Used to plumb identifiers assigned outside of this registry.
  pub fn insert(&self, node: ContextNode) {
    let id = node.id;

    self.next_id.fetch_max(id.saturating_add(1), Ordering::Relaxed);
    self.nodes.insert(id, Arc::new(node));
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn remove(&self, id: NodeId) -> Option<Arc<ContextNode>> {
    self.nodes.remove(&id).map(|(_, node)| node)
  }
}
