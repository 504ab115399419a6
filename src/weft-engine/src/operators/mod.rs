//! Query operators.
//!
//! An operator tree is built from statically typed structs. Opening it
//! produces a [`QueryResults`] tree; handing a recipient to the root results
//! makes every operator wrap its child's partitioned stream in turn.
//!
//! Most operators are expressed as a [`UnaryOperator`] or [`BinaryOperator`]
//! carrying only their per-partition logic; [`UnaryQueryOperator`] and
//! [`BinaryQueryOperator`] supply the open/recipient plumbing.

mod aggregate;
mod concat;
mod default_if_empty;
mod element;
mod group_by;
mod join;
mod order_by;
mod ordering;
mod reverse;
mod select;
mod set;
mod take_skip;
mod take_while;
mod zip;

use std::sync::Arc;

use common_display::ExplainNode;
use common_error::QueryResult;
use weft_core::{OrderKey, OrdinalIndexState};

use crate::settings::QuerySettings;
use crate::stream::{IndexedSource, PartitionedStream, PartitionedStreamRecipient, QueryResults};

pub use aggregate::{
    AggregateOperator, AnyOperator, Average, Comparable, Count, Fold, Max, Min, PartialAggregate,
    Reduce, Sum, Summable,
};
pub use concat::ConcatOperator;
pub use default_if_empty::DefaultIfEmptyOperator;
pub use element::{ElementAtOperator, FirstOrLastOperator};
pub use group_by::{GroupByOperator, Grouping};
pub use join::{GroupJoinOperator, JoinOperator};
pub use order_by::OrderByOperator;
pub use ordering::OrderingOperator;
pub use reverse::ReverseOperator;
pub use select::{SelectOperator, WhereOperator};
pub use set::{DistinctOperator, SetOperator};
pub use take_skip::TakeOrSkipOperator;
pub use take_while::TakeOrSkipWhileOperator;
pub use zip::ZipOperator;

/// A node of an operator tree.
pub trait QueryOperator: Send + Sync {
    /// Element type produced.
    type Output: Send + 'static;
    /// Opened form.
    type Results: QueryResults<Self::Output>;

    /// Open this operator and its children for one execution.
    fn open(&self, settings: &QuerySettings, prefer_striping: bool) -> QueryResult<Self::Results>;

    /// Positional guarantee of the output keys.
    fn ordinal_index_state(&self) -> OrdinalIndexState;

    /// Whether running this tree in parallel is likely slower than running
    /// it on one partition.
    fn limits_parallelism(&self) -> bool;

    /// Whether the output order is observable.
    fn output_ordered(&self) -> bool;

    /// Describe the tree.
    fn explain(&self) -> ExplainNode;
}

impl<C: QueryOperator> QueryOperator for &C {
    type Output = C::Output;
    type Results = C::Results;

    fn open(&self, settings: &QuerySettings, prefer_striping: bool) -> QueryResult<Self::Results> {
        (**self).open(settings, prefer_striping)
    }

    fn ordinal_index_state(&self) -> OrdinalIndexState {
        (**self).ordinal_index_state()
    }

    fn limits_parallelism(&self) -> bool {
        (**self).limits_parallelism()
    }

    fn output_ordered(&self) -> bool {
        (**self).output_ordered()
    }

    fn explain(&self) -> ExplainNode {
        (**self).explain()
    }
}

// ============================================================================
// Unary operators
// ============================================================================

/// Per-partition logic of an operator with one input.
pub trait UnaryOperator: Send + Sync + 'static {
    /// Input element type.
    type Input: Send + 'static;
    /// Output element type.
    type Output: Send + 'static;

    /// Display name.
    fn name(&self) -> &'static str;

    /// Output state for a given input state.
    ///
    /// Must match the state of the stream `wrap_partitioned_stream` builds,
    /// including any premature merge it performs.
    fn output_state(&self, input: OrdinalIndexState) -> OrdinalIndexState;

    /// Whether this operator makes parallel execution unprofitable.
    fn limits_parallelism(&self, _input: OrdinalIndexState, _ordered: bool) -> bool {
        false
    }

    /// Whether the output order is observable given the input's.
    fn output_ordered(&self, input_ordered: bool) -> bool {
        input_ordered
    }

    /// Whether the input should be striped rather than split into
    /// contiguous ranges, given what the consumer asked for.
    fn prefer_striping(&self, requested: bool) -> bool {
        requested
    }

    /// Add operator-specific details to the explain node.
    fn explain_details(&self, node: ExplainNode) -> ExplainNode {
        node
    }

    /// Random access through this operator, when supported.
    fn indexed(
        &self,
        _child: Arc<dyn IndexedSource<Self::Input>>,
    ) -> Option<Arc<dyn IndexedSource<Self::Output>>> {
        None
    }

    /// Wrap the input stream's partitions and hand the result to `recipient`.
    fn wrap_partitioned_stream<K, R>(
        &self,
        input: PartitionedStream<Self::Input, K>,
        recipient: R,
        ordered: bool,
        settings: &QuerySettings,
    ) -> QueryResult<R::Output>
    where
        K: OrderKey,
        R: PartitionedStreamRecipient<Self::Output>;
}

/// Operator node with one child and [`UnaryOperator`] logic.
#[derive(Debug)]
pub struct UnaryQueryOperator<C, L> {
    child: C,
    logic: Arc<L>,
}

impl<C, L> UnaryQueryOperator<C, L> {
    /// Create the node.
    pub fn new(child: C, logic: L) -> Self {
        Self {
            child,
            logic: Arc::new(logic),
        }
    }

    /// The child operator.
    pub const fn child(&self) -> &C {
        &self.child
    }
}

impl<C, L> QueryOperator for UnaryQueryOperator<C, L>
where
    C: QueryOperator,
    L: UnaryOperator<Input = C::Output>,
{
    type Output = L::Output;
    type Results = UnaryQueryResults<C::Results, L>;

    fn open(&self, settings: &QuerySettings, prefer_striping: bool) -> QueryResult<Self::Results> {
        let child = self
            .child
            .open(settings, self.logic.prefer_striping(prefer_striping))?;
        Ok(UnaryQueryResults {
            child,
            logic: Arc::clone(&self.logic),
            ordered: self.child.output_ordered(),
            settings: settings.clone(),
        })
    }

    fn ordinal_index_state(&self) -> OrdinalIndexState {
        self.logic.output_state(self.child.ordinal_index_state())
    }

    fn limits_parallelism(&self) -> bool {
        self.child.limits_parallelism()
            || self
                .logic
                .limits_parallelism(self.child.ordinal_index_state(), self.child.output_ordered())
    }

    fn output_ordered(&self) -> bool {
        self.logic.output_ordered(self.child.output_ordered())
    }

    fn explain(&self) -> ExplainNode {
        let node = ExplainNode::new(self.logic.name())
            .with_detail("ordinal", self.ordinal_index_state());
        self.logic
            .explain_details(node)
            .with_child(self.child.explain())
    }
}

/// Opened [`UnaryQueryOperator`].
pub struct UnaryQueryResults<R, L> {
    child: R,
    logic: Arc<L>,
    ordered: bool,
    settings: QuerySettings,
}

impl<R, L> QueryResults<L::Output> for UnaryQueryResults<R, L>
where
    L: UnaryOperator,
    R: QueryResults<L::Input>,
{
    fn give_partitioned_stream<Rc: PartitionedStreamRecipient<L::Output>>(
        self,
        recipient: Rc,
    ) -> QueryResult<Rc::Output> {
        self.child.give_partitioned_stream(UnaryChildRecipient {
            logic: self.logic,
            outer: recipient,
            ordered: self.ordered,
            settings: self.settings,
        })
    }

    fn indexed(&self) -> Option<Arc<dyn IndexedSource<L::Output>>> {
        self.child
            .indexed()
            .and_then(|child| self.logic.indexed(child))
    }
}

struct UnaryChildRecipient<L, Rc> {
    logic: Arc<L>,
    outer: Rc,
    ordered: bool,
    settings: QuerySettings,
}

impl<L, Rc> PartitionedStreamRecipient<L::Input> for UnaryChildRecipient<L, Rc>
where
    L: UnaryOperator,
    Rc: PartitionedStreamRecipient<L::Output>,
{
    type Output = Rc::Output;

    fn receive<K: OrderKey>(self, stream: PartitionedStream<L::Input, K>) -> QueryResult<Rc::Output> {
        self.logic
            .wrap_partitioned_stream(stream, self.outer, self.ordered, &self.settings)
    }
}

// ============================================================================
// Binary operators
// ============================================================================

/// Per-partition logic of an operator with two inputs.
pub trait BinaryOperator: Send + Sync + 'static {
    /// Left input element type.
    type Left: Send + 'static;
    /// Right input element type.
    type Right: Send + 'static;
    /// Output element type.
    type Output: Send + 'static;

    /// Display name.
    fn name(&self) -> &'static str;

    /// Output state for the given input states.
    fn output_state(&self, left: OrdinalIndexState, right: OrdinalIndexState)
    -> OrdinalIndexState;

    /// Whether this operator makes parallel execution unprofitable.
    fn limits_parallelism(
        &self,
        _left: OrdinalIndexState,
        _right: OrdinalIndexState,
        _ordered: bool,
    ) -> bool {
        false
    }

    /// Wrap both input streams and hand the result to `recipient`.
    fn wrap_partitioned_streams<KL, KR, R>(
        &self,
        left: PartitionedStream<Self::Left, KL>,
        right: PartitionedStream<Self::Right, KR>,
        recipient: R,
        ordered: bool,
        settings: &QuerySettings,
    ) -> QueryResult<R::Output>
    where
        KL: OrderKey,
        KR: OrderKey,
        R: PartitionedStreamRecipient<Self::Output>;
}

/// Operator node with two children and [`BinaryOperator`] logic.
#[derive(Debug)]
pub struct BinaryQueryOperator<A, B, L> {
    left: A,
    right: B,
    logic: Arc<L>,
}

impl<A, B, L> BinaryQueryOperator<A, B, L> {
    /// Create the node.
    pub fn new(left: A, right: B, logic: L) -> Self {
        Self {
            left,
            right,
            logic: Arc::new(logic),
        }
    }
}

impl<A, B, L> QueryOperator for BinaryQueryOperator<A, B, L>
where
    A: QueryOperator,
    B: QueryOperator,
    L: BinaryOperator<Left = A::Output, Right = B::Output>,
{
    type Output = L::Output;
    type Results = BinaryQueryResults<A::Results, B::Results, L>;

    fn open(&self, settings: &QuerySettings, prefer_striping: bool) -> QueryResult<Self::Results> {
        let left = self.left.open(settings, prefer_striping)?;
        let right = self.right.open(settings, prefer_striping)?;
        Ok(BinaryQueryResults {
            left,
            right,
            logic: Arc::clone(&self.logic),
            ordered: self.output_ordered(),
            settings: settings.clone(),
        })
    }

    fn ordinal_index_state(&self) -> OrdinalIndexState {
        self.logic.output_state(
            self.left.ordinal_index_state(),
            self.right.ordinal_index_state(),
        )
    }

    fn limits_parallelism(&self) -> bool {
        self.left.limits_parallelism()
            || self.right.limits_parallelism()
            || self.logic.limits_parallelism(
                self.left.ordinal_index_state(),
                self.right.ordinal_index_state(),
                self.output_ordered(),
            )
    }

    fn output_ordered(&self) -> bool {
        self.left.output_ordered() || self.right.output_ordered()
    }

    fn explain(&self) -> ExplainNode {
        ExplainNode::new(self.logic.name())
            .with_detail("ordinal", self.ordinal_index_state())
            .with_child(self.left.explain())
            .with_child(self.right.explain())
    }
}

/// Opened [`BinaryQueryOperator`].
pub struct BinaryQueryResults<RA, RB, L> {
    left: RA,
    right: RB,
    logic: Arc<L>,
    ordered: bool,
    settings: QuerySettings,
}

impl<RA, RB, L> QueryResults<L::Output> for BinaryQueryResults<RA, RB, L>
where
    L: BinaryOperator,
    RA: QueryResults<L::Left>,
    RB: QueryResults<L::Right>,
{
    fn give_partitioned_stream<Rc: PartitionedStreamRecipient<L::Output>>(
        self,
        recipient: Rc,
    ) -> QueryResult<Rc::Output> {
        self.left.give_partitioned_stream(LeftChildRecipient {
            right: self.right,
            logic: self.logic,
            outer: recipient,
            ordered: self.ordered,
            settings: self.settings,
        })
    }
}

struct LeftChildRecipient<RB, L, Rc> {
    right: RB,
    logic: Arc<L>,
    outer: Rc,
    ordered: bool,
    settings: QuerySettings,
}

impl<RB, L, Rc> PartitionedStreamRecipient<L::Left> for LeftChildRecipient<RB, L, Rc>
where
    L: BinaryOperator,
    RB: QueryResults<L::Right>,
    Rc: PartitionedStreamRecipient<L::Output>,
{
    type Output = Rc::Output;

    fn receive<KL: OrderKey>(self, left: PartitionedStream<L::Left, KL>) -> QueryResult<Rc::Output> {
        self.right.give_partitioned_stream(RightChildRecipient {
            left,
            logic: self.logic,
            outer: self.outer,
            ordered: self.ordered,
            settings: self.settings,
        })
    }
}

struct RightChildRecipient<T, KL, L, Rc> {
    left: PartitionedStream<T, KL>,
    logic: Arc<L>,
    outer: Rc,
    ordered: bool,
    settings: QuerySettings,
}

impl<T, KL, L, Rc> PartitionedStreamRecipient<L::Right> for RightChildRecipient<T, KL, L, Rc>
where
    KL: OrderKey,
    L: BinaryOperator<Left = T>,
    Rc: PartitionedStreamRecipient<L::Output>,
{
    type Output = Rc::Output;

    fn receive<KR: OrderKey>(
        self,
        right: PartitionedStream<L::Right, KR>,
    ) -> QueryResult<Rc::Output> {
        self.logic.wrap_partitioned_streams(
            self.left,
            right,
            self.outer,
            self.ordered,
            &self.settings,
        )
    }
}
