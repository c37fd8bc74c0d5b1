//! SPARQL query planning and execution over a permutation-indexed store.
//!
//! The crate takes an already-parsed query ([`ParsedQuery`]), turns it into
//! a physical execution tree of relational operators, and executes it with
//! bounded memory, cooperative cancellation, streaming intermediate results
//! where profitable, and a shared result cache.
//!
//! ```
//! use std::sync::Arc;
//! use engine::{GraphPattern, ParsedQuery, QueryEngine, TriplePattern};
//!
//! let mut builder = index::IndexBuilder::default();
//! builder.add("<s>", "<p>", "<o>").unwrap();
//! let engine = QueryEngine::new(Arc::new(builder.build().unwrap()));
//!
//! let query = ParsedQuery::select(GraphPattern::basic(vec![
//!     TriplePattern::parse("?x", "<p>", "?y"),
//! ]));
//! let (plan, result) = engine.execute(&query).unwrap();
//! assert_eq!(plan.selected.len(), 2);
//! assert_eq!(result.table.num_rows(), 1);
//! ```

mod arena;
mod cache;
mod cancellation;
mod context;
mod error;
mod exec;
mod export;
mod expression;
mod idtable;
mod join;
mod memory;
mod merge;
mod operator;
mod params;
mod parsed_query;
mod planner;
mod result;
mod variable;

pub use arena::{OpHandle, OpNode, PlanArena};
pub use cache::QueryCache;
pub use cancellation::{CancellationHandle, CancellationTicker, CHECK_INTERVAL};
pub use context::QueryContext;
pub use error::{CancelReason, EngineResult, QueryError};
pub use exec::Evaluator;
pub use export::{error_body, export_result, id_to_term, ExportFormat};
pub use expression::{AggregateOp, ArithOp, EvalContext, Expression, RelOp, TriBool};
pub use idtable::{ColumnIndex, IdTable, IdTableView};
pub use memory::MemoryLimit;
pub use merge::{parallel_multiway_merge, BlockIter};
pub use operator::Operator;
pub use params::RuntimeParameters;
pub use parsed_query::{
    DatasetClause, GraphPattern, OrderKey, ParsedQuery, PredicatePattern, PropertyPath,
    QueryKind, TextLimitClause, TriplePattern, VarOrTerm,
};
pub use planner::{ExecutionPlan, QueryPlanner, SubtreePlan, TripleGraph};
pub use result::{
    cache_during_consumption, callback_to_stream, Block, BlockStream, LazyResult,
    MaterializedResult, QueryResult, VocabAccumulator,
};
pub use variable::{UndefStatus, Variable, VariableMap};

use std::sync::Arc;
use std::time::Instant;

/// High-level facade: plan, execute and export queries against one index.
pub struct QueryEngine {
    ctx: QueryContext,
}

impl QueryEngine {
    pub fn new(index: Arc<index::Index>) -> QueryEngine {
        QueryEngine {
            ctx: QueryContext::new(index),
        }
    }

    pub fn with_context(ctx: QueryContext) -> QueryEngine {
        QueryEngine { ctx }
    }

    pub fn context(&self) -> &QueryContext {
        &self.ctx
    }

    /// Plan and fully execute one query with a fresh per-query context.
    pub fn execute(&self, query: &ParsedQuery) -> EngineResult<(ExecutionPlan, MaterializedResult)> {
        let ctx = self.ctx.fork_for_query();
        Self::execute_in(&ctx, query)
    }

    /// Like [`QueryEngine::execute`], but with an explicit context (for
    /// timeouts, memory limits or manual cancellation).
    pub fn execute_in(
        ctx: &QueryContext,
        query: &ParsedQuery,
    ) -> EngineResult<(ExecutionPlan, MaterializedResult)> {
        let plan = QueryPlanner::new(ctx).plan(query)?;
        let evaluator = Evaluator::new(&plan.arena, ctx);
        let result = evaluator
            .evaluate(plan.root, false, None)?
            .into_materialized(&ctx.memory)?;
        Ok((plan, result))
    }

    /// Execute and serialize in one step.
    pub fn execute_and_export(
        &self,
        query: &ParsedQuery,
        format: ExportFormat,
    ) -> EngineResult<Vec<u8>> {
        let ctx = self.ctx.fork_for_query();
        let started = Instant::now();
        let (plan, result) = Self::execute_in(&ctx, query)?;
        export_result(
            format,
            &ctx.index,
            &plan,
            &result,
            ctx.params.sparql_results_json_with_time,
            Some(started.elapsed()),
        )
    }
}
