//! The operator arena with topological ordering and validation.

use std::collections::BTreeSet;
use std::fmt;

use fxhash::FxHashMap;
use smallvec::SmallVec;

use super::error::PlanError;
use super::operator::{LogicalOperator, OperatorKind, OperatorNode};
use super::OperatorId;
use crate::types::SchemaRef;

/// Arena of operator nodes keyed by id.
///
/// The plan owns every node; edges are id lists on both endpoints.
#[derive(Clone, Default)]
pub struct QueryPlan {
    nodes: FxHashMap<OperatorId, OperatorNode>,
}

impl fmt::Debug for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("QueryPlan")
            .field("node_count", &self.nodes.len())
            .field("operators", &ids)
            .finish()
    }
}

impl QueryPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node without edges.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DuplicateOperator`] if `id` is taken.
    pub fn add_operator(
        &mut self,
        id: OperatorId,
        kind: OperatorKind,
        input_schemas: Vec<SchemaRef>,
        output_schema: SchemaRef,
    ) -> Result<OperatorId, PlanError> {
        if self.nodes.contains_key(&id) {
            return Err(PlanError::DuplicateOperator(id));
        }
        self.nodes.insert(
            id,
            OperatorNode {
                id,
                kind,
                input_schemas: input_schemas.into(),
                output_schema,
                predecessors: SmallVec::new(),
                successors: SmallVec::new(),
            },
        );
        Ok(id)
    }

    /// Adds an edge `from -> to`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::OperatorNotFound`] for unknown ids and
    /// [`PlanError::CycleDetected`] for a self-loop.
    pub fn connect(&mut self, from: OperatorId, to: OperatorId) -> Result<(), PlanError> {
        if from == to {
            return Err(PlanError::CycleDetected(from));
        }
        if !self.nodes.contains_key(&to) {
            return Err(PlanError::OperatorNotFound(to));
        }
        self.node_mut(from)?.successors.push(to);
        self.node_mut(to)?.predecessors.push(from);
        Ok(())
    }

    /// Installs a new payload and schemas under an existing id, keeping edges.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::OperatorNotFound`] if `id` is unknown.
    pub fn replace_operator(
        &mut self,
        id: OperatorId,
        kind: OperatorKind,
        input_schemas: Vec<SchemaRef>,
        output_schema: SchemaRef,
    ) -> Result<(), PlanError> {
        let old = self.nodes.remove(&id).ok_or(PlanError::OperatorNotFound(id))?;
        self.nodes.insert(
            id,
            OperatorNode {
                id,
                kind,
                input_schemas: input_schemas.into(),
                output_schema,
                predecessors: old.predecessors,
                successors: old.successors,
            },
        );
        Ok(())
    }

    /// Splices a new node onto the edge `pred -> target`.
    ///
    /// The new node reads `pred`'s output and replaces `pred` at the same
    /// position in `target`'s predecessor list, so input order is kept.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::OperatorNotFound`] if either endpoint or the edge
    /// is missing, or [`PlanError::DuplicateOperator`] if `id` is taken.
    pub fn insert_between(
        &mut self,
        pred: OperatorId,
        target: OperatorId,
        id: OperatorId,
        kind: OperatorKind,
        output_schema: SchemaRef,
    ) -> Result<(), PlanError> {
        if self.nodes.contains_key(&id) {
            return Err(PlanError::DuplicateOperator(id));
        }
        let pred_schema = self.node_ref(pred)?.output_schema.clone();
        let target_node = self.node_mut(target)?;
        let pos = target_node
            .predecessors
            .iter()
            .position(|p| *p == pred)
            .ok_or(PlanError::OperatorNotFound(pred))?;
        target_node.predecessors[pos] = id;
        if let Some(schema) = target_node.input_schemas.get_mut(pos) {
            *schema = output_schema.clone();
        }
        let pred_node = self.node_mut(pred)?;
        if let Some(succ) = pred_node.successors.iter_mut().find(|s| **s == target) {
            *succ = id;
        }
        self.nodes.insert(
            id,
            OperatorNode {
                id,
                kind,
                input_schemas: SmallVec::from_elem(pred_schema, 1),
                output_schema,
                predecessors: SmallVec::from_elem(pred, 1),
                successors: SmallVec::from_elem(target, 1),
            },
        );
        Ok(())
    }

    fn node_ref(&self, id: OperatorId) -> Result<&OperatorNode, PlanError> {
        self.nodes.get(&id).ok_or(PlanError::OperatorNotFound(id))
    }

    fn node_mut(&mut self, id: OperatorId) -> Result<&mut OperatorNode, PlanError> {
        self.nodes.get_mut(&id).ok_or(PlanError::OperatorNotFound(id))
    }

    // ---- Accessors ----

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, id: OperatorId) -> Option<&OperatorNode> {
        self.nodes.get(&id)
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the plan has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &OperatorNode> {
        self.nodes.values()
    }

    /// Operators without predecessors, sorted by id.
    #[must_use]
    pub fn sources(&self) -> Vec<OperatorId> {
        self.sorted_ids(|n| n.predecessors.is_empty())
    }

    /// Operators without successors, sorted by id.
    #[must_use]
    pub fn sinks(&self) -> Vec<OperatorId> {
        self.sorted_ids(|n| n.successors.is_empty())
    }

    fn sorted_ids(&self, pred: impl Fn(&OperatorNode) -> bool) -> Vec<OperatorId> {
        let mut ids: Vec<_> = self.nodes.values().filter(|n| pred(n)).map(|n| n.id).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns `true` once no logical operator remains.
    #[must_use]
    pub fn is_lowered(&self) -> bool {
        self.nodes
            .values()
            .all(|n| matches!(n.kind, OperatorKind::Physical(_)))
    }

    // ---- Ordering and validation ----

    /// Topological order, dependencies first, ties broken by smallest id.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::CycleDetected`] naming an operator on a cycle.
    pub fn topological_order(&self) -> Result<Vec<OperatorId>, PlanError> {
        let mut in_degree: FxHashMap<OperatorId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id, n.predecessors.len()))
            .collect();

        let mut ready: BTreeSet<OperatorId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for succ in &self.nodes[&id].successors {
                if let Some(deg) = in_degree.get_mut(succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(*succ);
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(id, _)| *id)
                .min()
                .unwrap_or(OperatorId(0));
            return Err(PlanError::CycleDetected(stuck));
        }
        Ok(order)
    }

    /// Validates structure and binary-operator schemas.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::EmptyPlan`], [`PlanError::CycleDetected`],
    /// [`PlanError::DisconnectedOperator`] or [`PlanError::SchemaMismatch`].
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.nodes.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        self.check_edges()?;
        self.topological_order()?;
        self.check_connected()?;
        self.check_schemas()?;
        Ok(())
    }

    /// Every edge must be recorded on both endpoints.
    fn check_edges(&self) -> Result<(), PlanError> {
        for node in self.nodes.values() {
            for succ in &node.successors {
                let target = self.node_ref(*succ)?;
                if !target.predecessors.contains(&node.id) {
                    return Err(PlanError::OperatorNotFound(node.id));
                }
            }
            for pred in &node.predecessors {
                self.node_ref(*pred)?;
            }
        }
        Ok(())
    }

    fn check_connected(&self) -> Result<(), PlanError> {
        for node in self.nodes.values() {
            let disconnected = |reason| PlanError::DisconnectedOperator {
                id: node.id,
                name: node.name(),
                reason,
            };
            if node.kind.is_source() {
                if !node.predecessors.is_empty() {
                    return Err(disconnected("source has an upstream operator"));
                }
            } else if node.predecessors.is_empty() {
                return Err(disconnected("no upstream operator"));
            }
            if node.kind.is_sink() {
                if !node.successors.is_empty() {
                    return Err(disconnected("sink has a downstream operator"));
                }
            } else if node.successors.is_empty() {
                return Err(disconnected("no downstream operator"));
            }
        }
        Ok(())
    }

    /// Unions must see merge-compatible inputs.
    fn check_schemas(&self) -> Result<(), PlanError> {
        for node in self.nodes.values() {
            let is_union = matches!(
                node.kind,
                OperatorKind::Logical(LogicalOperator::Union)
                    | OperatorKind::Physical(super::PhysicalOperator::Multiplex)
            );
            if !is_union {
                continue;
            }
            let mut inputs = node.input_schemas.iter();
            if let Some(first) = inputs.next() {
                let mut merged = (**first).clone();
                for schema in inputs {
                    merged = merged.union_merge(schema).map_err(|e| PlanError::SchemaMismatch {
                        operator: node.id,
                        reason: e.to_string(),
                    })?;
                }
            }
        }
        Ok(())
    }
}
