//! Execution of plan arenas.
//!
//! The [`Evaluator`] walks a plan bottom-up, consults the shared result
//! cache, and dispatches to the per-operator compute functions. Operators
//! may honor a laziness request by returning block streams; returning a
//! materialized result instead is always legal. A `limit_hint` is threaded
//! down for operators that support native limits (index scan, cartesian
//! product); results computed under a hint are never cached.

mod blockwise;
mod cartesian;
mod filter;
mod group_by;
mod joins;
mod modifiers;
mod scan;
mod sort;
mod text;
mod transitive;
mod union;

use std::sync::Arc;

use rdf_model::LocalVocab;
use tracing::trace;

use crate::arena::{OpHandle, OpNode, PlanArena};
use crate::context::QueryContext;
use crate::error::EngineResult;
use crate::idtable::IdTable;
use crate::operator::Operator;
use crate::result::{cache_during_consumption, MaterializedResult, QueryResult};

/// Rows per lazy block, unless a logical unit straddles the boundary.
pub(crate) const CHUNK_SIZE: usize = 1 << 20;

pub struct Evaluator<'a> {
    pub arena: &'a PlanArena,
    pub ctx: &'a QueryContext,
}

impl<'a> Evaluator<'a> {
    pub fn new(arena: &'a PlanArena, ctx: &'a QueryContext) -> Evaluator<'a> {
        Evaluator { arena, ctx }
    }

    pub fn node(&self, handle: OpHandle) -> &'a OpNode {
        self.arena.node(handle)
    }

    /// Evaluate a subtree. `limit_hint` is a native row limit (offset zero)
    /// for operators that support it; others ignore it.
    pub fn evaluate(
        &self,
        handle: OpHandle,
        request_lazy: bool,
        limit_hint: Option<usize>,
    ) -> EngineResult<QueryResult> {
        let node = self.node(handle);
        self.ctx.cancellation.check("query execution")?;

        let cacheable = limit_hint.is_none() && is_cacheable(&node.op);
        if cacheable {
            if let Some(hit) = self.ctx.cache.lookup(&node.cache_key) {
                trace!(op = node.op.descriptor(), "cache hit");
                return Ok(QueryResult::from_cached(hit));
            }
        }

        let result = self.compute(handle, node, request_lazy, limit_hint)?;

        if !cacheable {
            return Ok(result);
        }
        match result {
            QueryResult::Materialized(materialized) => {
                self.ctx
                    .cache
                    .insert(node.cache_key.clone(), materialized.clone());
                Ok(QueryResult::Materialized(materialized))
            }
            QueryResult::Lazy(mut lazy) => {
                // Mirror the stream into the cache while it is consumed.
                let sorted_by = lazy.sorted_by().to_vec();
                let stream = lazy.take_stream()?;
                let cache = Arc::clone(&self.ctx.cache);
                let key = node.cache_key.clone();
                let wrapped = cache_during_consumption(
                    stream,
                    sorted_by.clone(),
                    self.ctx.memory.clone(),
                    Arc::clone(&self.ctx.cancellation),
                    move |materialized| cache.insert(key.clone(), materialized),
                );
                Ok(QueryResult::Lazy(crate::result::LazyResult::new(
                    sorted_by, wrapped,
                )))
            }
        }
    }

    fn compute(
        &self,
        handle: OpHandle,
        node: &OpNode,
        request_lazy: bool,
        limit_hint: Option<usize>,
    ) -> EngineResult<QueryResult> {
        if node.known_empty {
            let table = IdTable::new(node.width(), self.ctx.memory.clone());
            return Ok(QueryResult::materialized(
                table,
                node.sorted_on.clone(),
                LocalVocab::new(),
            ));
        }
        match &node.op {
            Operator::IndexScan(op) => scan::compute(self, node, op, request_lazy, limit_hint),
            Operator::Join(op) => joins::compute_join(self, handle, node, op, request_lazy),
            Operator::MultiColumnJoin(op) => {
                joins::compute_multi_column_join(self, handle, node, op)
            }
            Operator::OptionalJoin(op) => joins::compute_optional_join(self, handle, node, op),
            Operator::Minus(op) => joins::compute_minus(self, handle, node, op, request_lazy),
            Operator::CartesianProduct => {
                cartesian::compute(self, handle, node, request_lazy, limit_hint)
            }
            Operator::TransitivePath(op) => transitive::compute(self, handle, node, op),
            Operator::Sort(op) => sort::compute_sort(self, handle, node, op),
            Operator::OrderBy(op) => sort::compute_order_by(self, handle, node, op),
            Operator::Distinct(op) => sort::compute_distinct(self, handle, node, op, request_lazy),
            Operator::Filter(op) => filter::compute_filter(self, handle, node, op, request_lazy),
            Operator::Bind(op) => filter::compute_bind(self, handle, node, op, request_lazy),
            Operator::GroupBy(op) => group_by::compute(self, handle, node, op),
            Operator::Union(op) => union::compute_union(self, handle, node, op, request_lazy),
            Operator::Values(op) => union::compute_values(self, node, op),
            Operator::WordScan(op) => text::compute_word_scan(self, node, op),
            Operator::EntityScan(op) => text::compute_entity_scan(self, node, op),
            Operator::TextLimit(op) => text::compute_text_limit(self, handle, node, op),
            Operator::LimitOffset(op) => {
                modifiers::compute_limit_offset(self, handle, node, op, request_lazy)
            }
            Operator::HasPredicateScan(op) => modifiers::compute_has_predicate_scan(self, node, op),
            Operator::CountPredicates(op) => {
                modifiers::compute_count_predicates(self, handle, node, op)
            }
            Operator::NeutralElement => {
                let mut table = IdTable::new(0, self.ctx.memory.clone());
                table.push_row(&[])?;
                Ok(QueryResult::materialized(
                    table,
                    Vec::new(),
                    LocalVocab::new(),
                ))
            }
        }
    }

    /// Evaluate a subtree fully materialized.
    pub fn materialize(
        &self,
        handle: OpHandle,
        limit_hint: Option<usize>,
    ) -> EngineResult<MaterializedResult> {
        self.evaluate(handle, false, limit_hint)?
            .into_materialized(&self.ctx.memory)
    }
}

fn is_cacheable(op: &Operator) -> bool {
    !matches!(op, Operator::Values(_) | Operator::NeutralElement)
}
