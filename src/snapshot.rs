use super::*;

/// One measurement instant: context node references plus immediate
/// attribute/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
  attributes: Vec<NodeId>,
  nodes: Vec<NodeId>,
  values: Vec<Variant>,
}

impl Snapshot {
  #[must_use]
  pub fn attributes(&self) -> &[NodeId] {
    &self.attributes
  }

  /// Attach an immediate attribute/value pair.
  #[must_use]
  pub fn immediate(
    mut self,
    attribute: NodeId,
    value: impl Into<Variant>,
  ) -> Self {
    self.push_immediate(attribute, value);
    self
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty() && self.attributes.is_empty()
  }

  #[must_use]
  pub fn n_immediate(&self) -> usize {
    self.attributes.len()
  }

  #[must_use]
  pub fn n_nodes(&self) -> usize {
    self.nodes.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Reference a context tree node.
  #[must_use]
  pub fn node(mut self, id: NodeId) -> Self {
    self.nodes.push(id);
    self
  }

  #[must_use]
  pub fn nodes(&self) -> &[NodeId] {
    &self.nodes
  }

  pub fn push_immediate(
    &mut self,
    attribute: NodeId,
    value: impl Into<Variant>,
  ) {
    self.attributes.push(attribute);
    self.values.push(value.into());
  }

  pub fn push_node(&mut self, id: NodeId) {
    self.nodes.push(id);
  }

  #[must_use]
  pub fn values(&self) -> &[Variant] {
    &self.values
  }

  #[must_use]
  pub fn with_capacity(nodes: usize, immediate: usize) -> Self {
    Self {
      attributes: Vec::with_capacity(immediate),
      nodes: Vec::with_capacity(nodes),
      values: Vec::with_capacity(immediate),
    }
  }
}
