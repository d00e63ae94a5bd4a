use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::OperatorId;
use crate::expr::Expr;
use crate::sink::SinkDescriptor;
use crate::types::SchemaRef;
use crate::window::{JoinDefinition, JoinSide, WatermarkStrategy, WindowDefinition};

/// A named stream entering the plan.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    /// Logical stream name.
    pub name: String,
    /// Record schema.
    pub schema: SchemaRef,
}

/// Operators as written by the query author.
#[derive(Debug, Clone)]
pub enum LogicalOperator {
    /// Reads a stream.
    Source(SourceDescriptor),
    /// Keeps records for which the predicate holds.
    Filter {
        /// Boolean predicate.
        predicate: Expr,
    },
    /// Assigns (or appends) a field computed from an expression.
    Map {
        /// Target field.
        field: String,
        /// Value expression.
        expr: Expr,
    },
    /// Keeps a subset of fields, in order.
    Project {
        /// Retained fields.
        fields: Vec<String>,
    },
    /// Declares the grouping keys of the following window.
    KeyBy {
        /// Key fields.
        keys: Vec<String>,
    },
    /// Derives watermarks from the stream.
    WatermarkAssigner(WatermarkStrategy),
    /// Windowed aggregation.
    Window(Arc<WindowDefinition>),
    /// Windowed equi-join of two inputs (left, right).
    Join(Arc<JoinDefinition>),
    /// Merges several inputs with compatible schemas.
    Union,
    /// Writes results out.
    Sink(SinkDescriptor),
    /// Opaque extension operator; the default provider cannot lower it.
    Custom {
        /// Extension name.
        name: String,
    },
}

/// Executable operators produced by lowering.
#[derive(Debug, Clone)]
pub enum PhysicalOperator {
    /// Entry point for source buffers.
    Scan {
        /// Logical stream name.
        source: String,
    },
    /// Predicate filter.
    Filter {
        /// Boolean predicate.
        predicate: Expr,
    },
    /// Field assignment.
    Map {
        /// Target field.
        field: String,
        /// Value expression.
        expr: Expr,
    },
    /// Field projection.
    Project {
        /// Retained fields.
        fields: Vec<String>,
    },
    /// Key declaration; records pass through unchanged.
    KeyBy {
        /// Key fields.
        keys: Vec<String>,
    },
    /// Stamps buffers with a watermark derived from their records.
    WatermarkAssignment(WatermarkStrategy),
    /// Inserts records into worker-local slice stores.
    SlicePreAggregation {
        /// Logical window id, shared with the matching [`PhysicalOperator::WindowSink`].
        handler: OperatorId,
        /// Window definition.
        definition: Arc<WindowDefinition>,
    },
    /// Emits triggered window results.
    WindowSink {
        /// Logical window id.
        handler: OperatorId,
        /// Window definition.
        definition: Arc<WindowDefinition>,
    },
    /// Buffers one join input.
    JoinBuild {
        /// Logical join id, shared with the matching [`PhysicalOperator::JoinSink`].
        handler: OperatorId,
        /// Which input this side buffers.
        side: JoinSide,
        /// Join definition.
        definition: Arc<JoinDefinition>,
    },
    /// Emits triggered join matches.
    JoinSink {
        /// Logical join id.
        handler: OperatorId,
        /// Join definition, including the key expressions.
        definition: Arc<JoinDefinition>,
    },
    /// Merges several inputs into one stream.
    Multiplex,
    /// Writes results out.
    Sink(SinkDescriptor),
}

impl PhysicalOperator {
    /// Returns `true` for operators whose state spans many buffers.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::SlicePreAggregation { .. }
                | Self::WindowSink { .. }
                | Self::JoinBuild { .. }
                | Self::JoinSink { .. }
                | Self::Sink(_)
        )
    }

    /// Returns `true` for operators that consume a stream without
    /// forwarding it record by record.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SlicePreAggregation { .. } | Self::JoinBuild { .. } | Self::Sink(_)
        )
    }

    /// Returns `true` for record-at-a-time operators that fit into a fused chain.
    #[must_use]
    pub fn is_stateless(&self) -> bool {
        matches!(
            self,
            Self::Filter { .. }
                | Self::Map { .. }
                | Self::Project { .. }
                | Self::KeyBy { .. }
                | Self::WatermarkAssignment(_)
        )
    }

    /// Short kind name for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan { .. } => "Scan",
            Self::Filter { .. } => "Filter",
            Self::Map { .. } => "Map",
            Self::Project { .. } => "Project",
            Self::KeyBy { .. } => "KeyBy",
            Self::WatermarkAssignment(_) => "WatermarkAssignment",
            Self::SlicePreAggregation { .. } => "SlicePreAggregation",
            Self::WindowSink { .. } => "WindowSink",
            Self::JoinBuild { .. } => "JoinBuild",
            Self::JoinSink { .. } => "JoinSink",
            Self::Multiplex => "Multiplex",
            Self::Sink(_) => "Sink",
        }
    }
}

impl LogicalOperator {
    /// Short kind name for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Source(_) => "Source",
            Self::Filter { .. } => "Filter",
            Self::Map { .. } => "Map",
            Self::Project { .. } => "Project",
            Self::KeyBy { .. } => "KeyBy",
            Self::WatermarkAssigner(_) => "WatermarkAssigner",
            Self::Window(_) => "Window",
            Self::Join(_) => "Join",
            Self::Union => "Union",
            Self::Sink(_) => "Sink",
            Self::Custom { .. } => "Custom",
        }
    }
}

/// Logical or physical payload of a node.
#[derive(Debug, Clone)]
pub enum OperatorKind {
    /// Not yet lowered.
    Logical(LogicalOperator),
    /// Lowered.
    Physical(PhysicalOperator),
}

impl OperatorKind {
    /// Short kind name for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Logical(op) => op.name(),
            Self::Physical(op) => op.name(),
        }
    }

    /// Returns `true` for sources and scans.
    #[must_use]
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            Self::Logical(LogicalOperator::Source(_)) | Self::Physical(PhysicalOperator::Scan { .. })
        )
    }

    /// Returns `true` for sinks.
    #[must_use]
    pub fn is_sink(&self) -> bool {
        matches!(
            self,
            Self::Logical(LogicalOperator::Sink(_)) | Self::Physical(PhysicalOperator::Sink(_))
        )
    }

    /// The physical operator, if lowered.
    #[must_use]
    pub fn as_physical(&self) -> Option<&PhysicalOperator> {
        match self {
            Self::Physical(op) => Some(op),
            Self::Logical(_) => None,
        }
    }
}

/// A node of a [`QueryPlan`](super::QueryPlan).
///
/// The payload and schemas never change after construction; rewrites
/// install a new node under the same id. Only the plan edits edge lists.
#[derive(Debug, Clone)]
pub struct OperatorNode {
    pub(crate) id: OperatorId,
    pub(crate) kind: OperatorKind,
    /// One entry per predecessor, in predecessor order.
    pub(crate) input_schemas: SmallVec<[SchemaRef; 2]>,
    pub(crate) output_schema: SchemaRef,
    pub(crate) predecessors: SmallVec<[OperatorId; 2]>,
    pub(crate) successors: SmallVec<[OperatorId; 2]>,
}

impl OperatorNode {
    /// Operator id.
    #[must_use]
    pub fn id(&self) -> OperatorId {
        self.id
    }

    /// Operator payload.
    #[must_use]
    pub fn kind(&self) -> &OperatorKind {
        &self.kind
    }

    /// Input schemas, one per predecessor.
    #[must_use]
    pub fn input_schemas(&self) -> &[SchemaRef] {
        &self.input_schemas
    }

    /// Output schema.
    #[must_use]
    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    /// Upstream operators.
    #[must_use]
    pub fn predecessors(&self) -> &[OperatorId] {
        &self.predecessors
    }

    /// Downstream operators.
    #[must_use]
    pub fn successors(&self) -> &[OperatorId] {
        &self.successors
    }

    /// Short kind name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

impl fmt::Display for OperatorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} -> {}", self.name(), self.id.0, self.output_schema)
    }
}
