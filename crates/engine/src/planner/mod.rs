//! The query planner: from a [`ParsedQuery`] to an executable plan arena.
//!
//! Planning proceeds in stages: the group graph pattern becomes a triple
//! graph of at most 64 bitset-indexed nodes; every node is seeded with
//! candidate index scans (one per useful permutation); connected components
//! are planned independently with dynamic programming, falling back to
//! greedy pairing when the estimated number of connected subgraphs exceeds
//! the planning budget; filters and text limits are placed as soon as their
//! variables are covered; components combine through a cartesian product;
//! the top-level solution modifiers wrap the root.

mod candidates;
mod seeds;
mod triple_graph;

pub use candidates::{PlanType, SubtreePlan, TextLimitSpec};
pub use triple_graph::TripleGraph;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::arena::{OpHandle, PlanArena};
use crate::context::QueryContext;
use crate::error::{EngineResult, QueryError};
use crate::expression::{AggregateOp, Expression};
use crate::operator::{
    AggregateSpec, BindOp, CountPredicatesOp, DistinctOp, GroupByOp, LimitOffsetOp, Operator,
    OrderByOp, UnionOp, ValuesOp,
};
use crate::parsed_query::{
    GraphPattern, ParsedQuery, PredicatePattern, QueryKind, TriplePattern, VarOrTerm,
};
use crate::variable::Variable;

use candidates::{
    apply_filters, apply_text_limits, cheapest, create_join_candidates, merge_rows, prune,
};
use seeds::{NodeKind, PlannerNode, QL_CONTAINS_ENTITY, QL_CONTAINS_WORD, QL_HAS_PREDICATE};
use triple_graph::{count_connected_subgraphs, CountGraphNode};

/// The planner's output: an immutable arena, its root handle and the
/// projection/shape information the export layer needs.
#[derive(Debug)]
pub struct ExecutionPlan {
    pub arena: PlanArena,
    pub root: OpHandle,
    /// Output variables in SELECT order (internal variables filtered out).
    pub selected: Vec<Variable>,
    pub construct: Option<Vec<TriplePattern>>,
    pub is_ask: bool,
}

pub struct QueryPlanner<'a> {
    ctx: &'a QueryContext,
    arena: PlanArena,
    fresh_counter: usize,
}

/// Baseline row count that a `Sort` is assumed to handle comfortably; the
/// `sort-estimate-cancellation-factor` scales it.
const SORT_ESTIMATE_BASE_ROWS: f64 = 1e8;

impl<'a> QueryPlanner<'a> {
    pub fn new(ctx: &'a QueryContext) -> QueryPlanner<'a> {
        let max_sort_rows =
            (ctx.params.sort_estimate_cancellation_factor * SORT_ESTIMATE_BASE_ROWS) as u64;
        QueryPlanner {
            ctx,
            arena: PlanArena::new(std::sync::Arc::clone(&ctx.index))
                .with_max_sort_rows(max_sort_rows.max(1)),
            fresh_counter: 0,
        }
    }

    pub fn plan(mut self, query: &ParsedQuery) -> EngineResult<ExecutionPlan> {
        let result = self.plan_impl(query);
        // Cancellation during planning is tagged with the planning phase.
        result.map_err(|e| e.with_phase("query planning"))
    }

    fn plan_impl(&mut self, query: &ParsedQuery) -> EngineResult<ExecutionPlan> {
        if !query.datasets.is_empty() {
            return Err(QueryError::UnsupportedFeature(
                "FROM and FROM NAMED clauses are not supported by this index".into(),
            ));
        }
        self.ctx.cancellation.check("query planning")?;

        let mut root = if let Some(trick) = check_pattern_trick(query) {
            self.plan_pattern_trick(query, &trick)?
        } else {
            let mut row = self.plan_pattern(&query.root, query.text_limit.as_ref())?;
            let best = cheapest(&self.arena, &row, self.ctx.test_mode).ok_or_else(|| {
                QueryError::ContractViolation("planning produced no candidates".into())
            })?;
            let plan = normalize_lonely_plan(&mut self.arena, row.swap_remove(best))?;
            let handle = plan.handle;
            self.apply_group_by_and_having(query, handle)?
        };

        // DISTINCT over the selected columns needs the rows sorted by them.
        if query.distinct {
            let selected_cols = self.selected_columns(query, root)?;
            let sorted = candidates::sorted_by(&mut self.arena, root, &selected_cols)?;
            root = self.arena.push(
                Operator::Distinct(DistinctOp {
                    keep_cols: selected_cols,
                }),
                &[sorted],
            )?;
        }

        if !query.order_by.is_empty() {
            let keys: Vec<(usize, bool)> = query
                .order_by
                .iter()
                .map(|key| {
                    self.arena
                        .node(root)
                        .var_map
                        .column_of(&key.variable)
                        .map(|c| (c, key.descending))
                        .ok_or_else(|| {
                            QueryError::UnsupportedFeature(format!(
                                "ORDER BY variable {} is not bound",
                                key.variable
                            ))
                        })
                })
                .collect::<EngineResult<_>>()?;
            root = self
                .arena
                .push(Operator::OrderBy(OrderByOp { keys }), &[root])?;
        }

        let is_ask = matches!(query.kind, QueryKind::Ask);
        let (limit, offset) = if is_ask {
            (Some(1), 0)
        } else {
            (query.limit, query.offset)
        };
        if limit.is_some() || offset != 0 {
            root = self.arena.push(
                Operator::LimitOffset(LimitOffsetOp { limit, offset }),
                &[root],
            )?;
        }

        let selected = self.selected_variables(query, root);
        let construct = match &query.kind {
            QueryKind::Construct(template) => Some(template.clone()),
            _ => None,
        };
        debug!(
            cost = self.arena.node(root).cost_estimate,
            size = self.arena.node(root).size_estimate,
            "query planning finished"
        );
        Ok(ExecutionPlan {
            arena: std::mem::replace(
                &mut self.arena,
                PlanArena::new(std::sync::Arc::clone(&self.ctx.index)),
            ),
            root,
            selected,
            construct,
            is_ask,
        })
    }

    // -----------------------------------------------------------------------
    // Graph pattern planning
    // -----------------------------------------------------------------------

    fn plan_pattern(
        &mut self,
        pattern: &GraphPattern,
        text_limit: Option<&crate::parsed_query::TextLimitClause>,
    ) -> EngineResult<Vec<SubtreePlan>> {
        match pattern {
            GraphPattern::Group(elements) => self.plan_group(elements, text_limit),
            other => self.plan_group(std::slice::from_ref(other), text_limit),
        }
    }

    fn plan_group(
        &mut self,
        elements: &[GraphPattern],
        text_limit: Option<&crate::parsed_query::TextLimitClause>,
    ) -> EngineResult<Vec<SubtreePlan>> {
        self.ctx.cancellation.check("query planning")?;
        let mut triples: Vec<TriplePattern> = Vec::new();
        let mut filters: Vec<Expression> = Vec::new();
        let mut binds: Vec<BindOp> = Vec::new();
        let mut child_nodes: Vec<NodeKind> = Vec::new();

        for element in elements {
            match element {
                GraphPattern::Basic { triples: t } => triples.extend(t.iter().cloned()),
                GraphPattern::Filter(expression) => filters.push(expression.clone()),
                GraphPattern::Bind {
                    expression,
                    variable,
                } => binds.push(BindOp {
                    expression: expression.clone(),
                    variable: variable.clone(),
                }),
                GraphPattern::Group(inner) => {
                    let candidates = self.plan_group(inner, None)?;
                    child_nodes.push(NodeKind::Child {
                        candidates,
                        plan_type: PlanType::Basic,
                    });
                }
                GraphPattern::Optional(inner) => {
                    let candidates = self.plan_pattern(inner, None)?;
                    child_nodes.push(NodeKind::Child {
                        candidates,
                        plan_type: PlanType::Optional,
                    });
                }
                GraphPattern::Minus(inner) => {
                    let candidates = self.plan_pattern(inner, None)?;
                    child_nodes.push(NodeKind::Child {
                        candidates,
                        plan_type: PlanType::Minus,
                    });
                }
                GraphPattern::Union(left, right) => {
                    let plan = self.plan_union(left, right)?;
                    child_nodes.push(NodeKind::Child {
                        candidates: vec![plan],
                        plan_type: PlanType::Basic,
                    });
                }
                GraphPattern::Values { variables, rows } => {
                    let handle = self.arena.push(
                        Operator::Values(ValuesOp {
                            variables: variables.clone(),
                            rows: rows.clone(),
                        }),
                        &[],
                    )?;
                    child_nodes.push(NodeKind::Child {
                        candidates: vec![SubtreePlan::seed(handle, 0)],
                        plan_type: PlanType::Basic,
                    });
                }
                GraphPattern::Subquery(inner) => {
                    let handle = self.plan_subquery(inner)?;
                    child_nodes.push(NodeKind::Child {
                        candidates: vec![SubtreePlan::seed(handle, 0)],
                        plan_type: PlanType::Basic,
                    });
                }
                GraphPattern::Service {
                    silent,
                    endpoint,
                    pattern: _,
                } => {
                    if !*silent {
                        return Err(QueryError::RemoteEndpoint(format!(
                            "SERVICE endpoint {endpoint} is not reachable"
                        )));
                    }
                    // SILENT failure: the neutral element.
                    let handle = self.arena.push(Operator::NeutralElement, &[])?;
                    child_nodes.push(NodeKind::Child {
                        candidates: vec![SubtreePlan::seed(handle, 0)],
                        plan_type: PlanType::Basic,
                    });
                }
            }
        }

        // Repeated variables inside one triple become a fresh variable plus
        // an equality filter before planning.
        rewrite_self_joins(&mut triples, &mut filters, &mut self.fresh_counter);

        let (plain, transitive, union_patterns) =
            seeds::rewrite_property_paths(triples, &mut self.fresh_counter)?;
        for union in union_patterns {
            let candidates = self.plan_pattern(&union, None)?;
            child_nodes.push(NodeKind::Child {
                candidates,
                plan_type: PlanType::Basic,
            });
        }

        // Build the node list: triples (splitting off the magic predicates),
        // transitive paths, then child patterns.
        let mut nodes: Vec<PlannerNode> = Vec::new();
        for triple in plain {
            let kind = classify_triple(triple)?;
            nodes.push(PlannerNode {
                vars: Vec::new(),
                kind,
            });
        }
        for path in transitive {
            nodes.push(PlannerNode {
                vars: Vec::new(),
                kind: NodeKind::Transitive(path),
            });
        }
        for kind in child_nodes {
            nodes.push(PlannerNode {
                vars: Vec::new(),
                kind,
            });
        }
        for node in &mut nodes {
            node.vars = seeds::node_variables(&self.arena, &node.kind);
        }

        if nodes.is_empty() {
            // A group of only BINDs and FILTERs starts from the neutral
            // element.
            let handle = self.arena.push(Operator::NeutralElement, &[])?;
            let mut row = vec![SubtreePlan::seed(handle, 0)];
            self.apply_binds_and_filters(&mut row, &binds, &filters)?;
            return Ok(row);
        }

        let graph = TripleGraph::new(nodes.iter().map(|n| n.vars.clone()).collect())?;
        let text_specs = build_text_limit_specs(&nodes);

        // Seed plans per node.
        let mut seeds_by_node: Vec<Vec<SubtreePlan>> = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let mut row = seeds::seeds_for_node(&mut self.arena, i, &node.kind)?;
            prune(&self.arena, &mut row, self.ctx.test_mode);
            seeds_by_node.push(row);
        }

        // Plan each connected component independently.
        let component_of = graph.connected_components();
        let num_components = component_of.iter().copied().max().map_or(0, |m| m + 1);
        let mut component_rows: Vec<Vec<SubtreePlan>> = Vec::new();
        for component in 0..num_components {
            let members: Vec<usize> = (0..nodes.len())
                .filter(|&i| component_of[i] == component)
                .collect();
            let seeds: Vec<SubtreePlan> = members
                .iter()
                .flat_map(|&i| seeds_by_node[i].iter().copied())
                .collect();
            let row = self.plan_component(
                &graph,
                &members,
                seeds,
                &filters,
                &text_specs,
                text_limit,
            )?;
            component_rows.push(row);
        }

        let mut row = self.combine_components(component_rows)?;
        for plan in &mut row {
            *plan = normalize_lonely_plan(&mut self.arena, *plan)?;
        }
        self.apply_binds_and_filters(&mut row, &binds, &filters)?;
        if let Some(clause) = text_limit {
            apply_text_limits(&mut self.arena, &mut row, &text_specs, clause.limit, true)?;
        }
        prune(&self.arena, &mut row, self.ctx.test_mode);
        Ok(row)
    }

    /// DP within budget, greedy beyond it.
    fn plan_component(
        &mut self,
        graph: &TripleGraph,
        members: &[usize],
        mut seeds: Vec<SubtreePlan>,
        filters: &[Expression],
        text_specs: &[TextLimitSpec],
        text_limit: Option<&crate::parsed_query::TextLimitClause>,
    ) -> EngineResult<Vec<SubtreePlan>> {
        let limit = text_limit.map(|c| c.limit);
        let apply_all = |arena: &mut PlanArena,
                         row: &mut Vec<SubtreePlan>,
                         replace: bool|
         -> EngineResult<()> {
            apply_filters(arena, row, filters, replace)?;
            if let Some(limit) = limit {
                apply_text_limits(arena, row, text_specs, limit, replace)?;
            }
            Ok(())
        };

        if members.len() == 1 {
            apply_all(&mut self.arena, &mut seeds, true)?;
            prune(&self.arena, &mut seeds, self.ctx.test_mode);
            return Ok(seeds);
        }

        // Estimate the DP effort by counting connected subgraphs of the
        // component's join graph.
        let count_graph: Vec<CountGraphNode> = members
            .iter()
            .map(|&i| {
                let mut neighbors = 0u64;
                for &n in graph.neighbors(i) {
                    if let Some(pos) = members.iter().position(|&m| m == n) {
                        neighbors |= 1u64 << pos;
                    }
                }
                CountGraphNode { neighbors }
            })
            .collect();
        let budget = self.ctx.params.query_planning_budget;
        let use_greedy = count_connected_subgraphs(&count_graph, budget) > budget;

        if use_greedy {
            info!("using the greedy query planner for a large connected component");
            return self.greedy_component(seeds, apply_all);
        }

        // dp[k-1]: the best plans covering exactly k nodes.
        let num_nodes = members.len();
        let mut dp: Vec<Vec<SubtreePlan>> = Vec::with_capacity(num_nodes);
        apply_all(&mut self.arena, &mut seeds, false)?;
        prune(&self.arena, &mut seeds, self.ctx.test_mode);
        dp.push(seeds);
        for k in 2..=num_nodes {
            self.ctx.cancellation.check("query planning")?;
            let mut row = Vec::new();
            for i in 1..=k / 2 {
                let merged = merge_rows(
                    &mut self.arena,
                    &dp[i - 1].clone(),
                    &dp[k - i - 1].clone(),
                    self.ctx.test_mode,
                )?;
                row.extend(merged);
                apply_all(&mut self.arena, &mut row, false)?;
            }
            prune(&self.arena, &mut row, self.ctx.test_mode);
            if row.is_empty() {
                return Err(QueryError::ContractViolation(
                    "dynamic programming produced an empty row for a connected component".into(),
                ));
            }
            dp.push(row);
        }
        let mut result = dp.pop().unwrap_or_default();
        apply_all(&mut self.arena, &mut result, true)?;
        prune(&self.arena, &mut result, self.ctx.test_mode);
        Ok(result)
    }

    fn greedy_component(
        &mut self,
        mut plans: Vec<SubtreePlan>,
        mut apply_all: impl FnMut(&mut PlanArena, &mut Vec<SubtreePlan>, bool) -> EngineResult<()>,
    ) -> EngineResult<Vec<SubtreePlan>> {
        apply_all(&mut self.arena, &mut plans, true)?;
        prune(&self.arena, &mut plans, self.ctx.test_mode);
        loop {
            self.ctx.cancellation.check("query planning")?;
            let covered: u64 = plans.iter().fold(0, |acc, p| acc | p.nodes);
            if plans
                .iter()
                .any(|p| p.nodes == covered)
            {
                break;
            }
            // Combine the currently cheapest eligible pair.
            let mut best: Option<SubtreePlan> = None;
            for i in 0..plans.len() {
                for j in 0..plans.len() {
                    if i == j {
                        continue;
                    }
                    let mut cands = create_join_candidates(
                        &mut self.arena,
                        &plans[i],
                        &plans[j],
                        self.ctx.test_mode,
                    )?;
                    apply_all(&mut self.arena, &mut cands, true)?;
                    for cand in cands {
                        let better = match &best {
                            None => true,
                            Some(current) => {
                                self.arena.node(cand.handle).cost_estimate
                                    < self.arena.node(current.handle).cost_estimate
                            }
                        };
                        if better {
                            best = Some(cand);
                        }
                    }
                }
            }
            let Some(best) = best else {
                return Err(QueryError::ContractViolation(
                    "greedy planning could not combine a connected component".into(),
                ));
            };
            plans.retain(|p| (p.nodes & best.nodes) == 0);
            plans.push(best);
        }
        prune(&self.arena, &mut plans, self.ctx.test_mode);
        Ok(plans)
    }

    /// Combine the per-component rows; more than one component means a
    /// cartesian product over the cheapest plan of each.
    fn combine_components(
        &mut self,
        mut rows: Vec<Vec<SubtreePlan>>,
    ) -> EngineResult<Vec<SubtreePlan>> {
        if rows.len() == 1 {
            return Ok(rows.pop().unwrap_or_default());
        }
        let mut children = Vec::new();
        let mut nodes = 0u64;
        let mut filter_mask = 0u64;
        let mut text_mask = 0u64;
        for row in &mut rows {
            let best = cheapest(&self.arena, row, self.ctx.test_mode).ok_or_else(|| {
                QueryError::ContractViolation("empty component row".into())
            })?;
            let plan = normalize_lonely_plan(&mut self.arena, row.swap_remove(best))?;
            nodes |= plan.nodes;
            filter_mask |= plan.filters;
            text_mask |= plan.text_limits;
            children.push(plan.handle);
        }
        let handle = self.arena.push(Operator::CartesianProduct, &children)?;
        Ok(vec![SubtreePlan {
            handle,
            nodes,
            filters: filter_mask,
            text_limits: text_mask,
            plan_type: PlanType::Basic,
        }])
    }

    fn apply_binds_and_filters(
        &mut self,
        row: &mut Vec<SubtreePlan>,
        binds: &[BindOp],
        filters: &[Expression],
    ) -> EngineResult<()> {
        apply_filters(&mut self.arena, row, filters, true)?;
        for bind in binds {
            for plan in row.iter_mut() {
                let handle = self
                    .arena
                    .push(Operator::Bind(bind.clone()), &[plan.handle])?;
                plan.handle = handle;
            }
            apply_filters(&mut self.arena, row, filters, true)?;
        }
        // Filters whose variables never became bound still apply: their
        // expressions evaluate to Undef and drop every row.
        for plan in row.iter_mut() {
            for (i, filter) in filters.iter().enumerate() {
                if (plan.filters >> i) & 1 == 0 {
                    let handle = self.arena.push(
                        Operator::Filter(crate::operator::FilterOp {
                            expression: filter.clone(),
                        }),
                        &[plan.handle],
                    )?;
                    plan.handle = handle;
                    plan.filters |= 1u64 << i;
                }
            }
        }
        Ok(())
    }

    fn plan_union(
        &mut self,
        left: &GraphPattern,
        right: &GraphPattern,
    ) -> EngineResult<SubtreePlan> {
        let mut left_row = self.plan_pattern(left, None)?;
        let mut right_row = self.plan_pattern(right, None)?;
        let l = cheapest(&self.arena, &left_row, self.ctx.test_mode)
            .ok_or_else(|| QueryError::ContractViolation("empty union branch".into()))?;
        let r = cheapest(&self.arena, &right_row, self.ctx.test_mode)
            .ok_or_else(|| QueryError::ContractViolation("empty union branch".into()))?;
        let left_plan = normalize_lonely_plan(&mut self.arena, left_row.swap_remove(l))?;
        let right_plan = normalize_lonely_plan(&mut self.arena, right_row.swap_remove(r))?;

        // Output columns: the left branch's variables, then the variables
        // only the right branch binds.
        let left_vars: Vec<Variable> = self
            .arena
            .node(left_plan.handle)
            .var_map
            .variables()
            .cloned()
            .collect();
        let right_vars: Vec<Variable> = self
            .arena
            .node(right_plan.handle)
            .var_map
            .variables()
            .cloned()
            .collect();
        let mut origins = Vec::new();
        for (i, variable) in left_vars.iter().enumerate() {
            origins.push([
                Some(i),
                self.arena
                    .node(right_plan.handle)
                    .var_map
                    .column_of(variable),
            ]);
        }
        for (i, variable) in right_vars.iter().enumerate() {
            if !left_vars.contains(variable) {
                origins.push([None, Some(i)]);
            }
        }
        let handle = self.arena.push(
            Operator::Union(UnionOp {
                column_origins: origins,
            }),
            &[left_plan.handle, right_plan.handle],
        )?;
        Ok(SubtreePlan {
            handle,
            nodes: 0,
            // Branch-internal filters are already part of the branch plans.
            filters: 0,
            text_limits: 0,
            plan_type: PlanType::Basic,
        })
    }

    fn plan_subquery(&mut self, inner: &ParsedQuery) -> EngineResult<OpHandle> {
        // Non-selected variables of the subquery are invisible outside; they
        // are renamed to fresh internal names so they cannot capture.
        let renamed = rename_hidden_variables(inner, &mut self.fresh_counter);
        let mut row = self.plan_pattern(&renamed.root, renamed.text_limit.as_ref())?;
        let best = cheapest(&self.arena, &row, self.ctx.test_mode)
            .ok_or_else(|| QueryError::ContractViolation("empty subquery plan".into()))?;
        let plan = normalize_lonely_plan(&mut self.arena, row.swap_remove(best))?;
        let mut handle = self.apply_group_by_and_having(&renamed, plan.handle)?;
        if renamed.distinct {
            let cols = self.selected_columns(&renamed, handle)?;
            let sorted = candidates::sorted_by(&mut self.arena, handle, &cols)?;
            handle = self
                .arena
                .push(Operator::Distinct(DistinctOp { keep_cols: cols }), &[sorted])?;
        }
        if !renamed.order_by.is_empty() {
            let keys: Vec<(usize, bool)> = renamed
                .order_by
                .iter()
                .filter_map(|key| {
                    self.arena
                        .node(handle)
                        .var_map
                        .column_of(&key.variable)
                        .map(|c| (c, key.descending))
                })
                .collect();
            if !keys.is_empty() {
                handle = self
                    .arena
                    .push(Operator::OrderBy(OrderByOp { keys }), &[handle])?;
            }
        }
        if renamed.limit.is_some() || renamed.offset != 0 {
            handle = self.arena.push(
                Operator::LimitOffset(LimitOffsetOp {
                    limit: renamed.limit,
                    offset: renamed.offset,
                }),
                &[handle],
            )?;
        }
        Ok(handle)
    }

    // -----------------------------------------------------------------------
    // Top-level modifiers
    // -----------------------------------------------------------------------

    fn apply_group_by_and_having(
        &mut self,
        query: &ParsedQuery,
        handle: OpHandle,
    ) -> EngineResult<OpHandle> {
        let aliases: &[(Expression, Variable)] = match &query.kind {
            QueryKind::Select { aliases, .. } => aliases.as_slice(),
            _ => &[],
        };
        let has_aggregates = !query.group_by.is_empty()
            || aliases.iter().any(|(e, _)| e.contains_aggregate())
            || !query.having.is_empty();
        if !has_aggregates {
            // Plain aliases become BIND columns.
            let mut current = handle;
            for (expression, variable) in aliases {
                current = self.arena.push(
                    Operator::Bind(BindOp {
                        expression: expression.clone(),
                        variable: variable.clone(),
                    }),
                    &[current],
                )?;
            }
            return Ok(current);
        }

        let group_cols: Vec<usize> = query
            .group_by
            .iter()
            .map(|variable| {
                self.arena
                    .node(handle)
                    .var_map
                    .column_of(variable)
                    .ok_or_else(|| {
                        QueryError::UnsupportedFeature(format!(
                            "GROUP BY variable {variable} is not bound in the pattern"
                        ))
                    })
            })
            .collect::<EngineResult<_>>()?;

        let mut aggregates: Vec<AggregateSpec> = Vec::new();
        for (expression, variable) in aliases {
            aggregates.push(AggregateSpec {
                expression: expression.clone(),
                output: variable.clone(),
            });
        }
        // HAVING clauses mentioning aggregates get hidden aggregate columns
        // and then filter on those.
        let mut having_filters = Vec::new();
        for having in &query.having {
            let rewritten =
                extract_aggregates(having.clone(), &mut aggregates, &mut self.fresh_counter);
            having_filters.push(rewritten);
        }

        let sorted = candidates::sorted_by(&mut self.arena, handle, &group_cols)?;
        let mut current = self.arena.push(
            Operator::GroupBy(GroupByOp {
                group_cols,
                aggregates,
            }),
            &[sorted],
        )?;
        for filter in having_filters {
            current = self.arena.push(
                Operator::Filter(crate::operator::FilterOp { expression: filter }),
                &[current],
            )?;
        }
        Ok(current)
    }

    fn plan_pattern_trick(
        &mut self,
        query: &ParsedQuery,
        trick: &PatternTrick,
    ) -> EngineResult<OpHandle> {
        info!("pattern trick active: counting predicates from the pattern data");
        let remainder = remove_trick_triple(&query.root, trick);
        let count_op = CountPredicatesOp {
            subject_col: None,
            predicate_var: trick.predicate.clone(),
            count_var: trick.count_var.clone(),
        };
        match remainder {
            None => self
                .arena
                .push(Operator::CountPredicates(count_op), &[]),
            Some(rest) => {
                let mut row = self.plan_pattern(&rest, None)?;
                let best = cheapest(&self.arena, &row, self.ctx.test_mode).ok_or_else(|| {
                    QueryError::ContractViolation("empty pattern-trick remainder".into())
                })?;
                let plan = normalize_lonely_plan(&mut self.arena, row.swap_remove(best))?;
                let subject_col = self
                    .arena
                    .node(plan.handle)
                    .var_map
                    .column_of(&trick.subject)
                    .ok_or_else(|| {
                        QueryError::ContractViolation(
                            "pattern-trick subject is unbound in the remainder".into(),
                        )
                    })?;
                self.arena.push(
                    Operator::CountPredicates(CountPredicatesOp {
                        subject_col: Some(subject_col),
                        ..count_op
                    }),
                    &[plan.handle],
                )
            }
        }
    }

    fn selected_variables(&self, query: &ParsedQuery, root: OpHandle) -> Vec<Variable> {
        match &query.kind {
            QueryKind::Select { variables, aliases } if !variables.is_empty() => {
                let mut selected = variables.clone();
                for (_, alias) in aliases {
                    if !selected.contains(alias) {
                        selected.push(alias.clone());
                    }
                }
                selected
            }
            _ => self
                .arena
                .node(root)
                .var_map
                .variables()
                .filter(|v| !v.name().starts_with('_') && !v.name().starts_with("ql_"))
                .cloned()
                .collect(),
        }
    }

    fn selected_columns(&self, query: &ParsedQuery, root: OpHandle) -> EngineResult<Vec<usize>> {
        let selected = self.selected_variables(query, root);
        selected
            .iter()
            .map(|variable| {
                self.arena
                    .node(root)
                    .var_map
                    .column_of(variable)
                    .ok_or_else(|| {
                        QueryError::UnsupportedFeature(format!(
                            "selected variable {variable} is not bound"
                        ))
                    })
            })
            .collect()
    }
}

/// A plan that never joined keeps semantics of composition with the unit
/// table: a lonely OPTIONAL is its own result, a lonely MINUS removes
/// nothing from the unit solution.
fn normalize_lonely_plan(
    arena: &mut PlanArena,
    mut plan: SubtreePlan,
) -> EngineResult<SubtreePlan> {
    match plan.plan_type {
        PlanType::Basic => Ok(plan),
        PlanType::Optional => {
            plan.plan_type = PlanType::Basic;
            Ok(plan)
        }
        PlanType::Minus => {
            let handle = arena.push(Operator::NeutralElement, &[])?;
            Ok(SubtreePlan {
                handle,
                nodes: plan.nodes,
                filters: plan.filters,
                text_limits: plan.text_limits,
                plan_type: PlanType::Basic,
            })
        }
    }
}

fn rewrite_self_joins(
    triples: &mut [TriplePattern],
    filters: &mut Vec<Expression>,
    counter: &mut usize,
) {
    fn freshen(
        original: &Variable,
        filters: &mut Vec<Expression>,
        counter: &mut usize,
    ) -> Variable {
        let fresh = Variable::new(format!("_self_{counter}"));
        *counter += 1;
        filters.push(Expression::eq(
            Expression::Var(original.clone()),
            Expression::Var(fresh.clone()),
        ));
        fresh
    }
    for triple in triples.iter_mut() {
        let mut seen: Vec<Variable> = Vec::new();
        if let VarOrTerm::Var(v) = &triple.subject {
            seen.push(v.clone());
        }
        let predicate_replacement = match &triple.predicate {
            PredicatePattern::Var(v) if seen.contains(v) => Some(freshen(v, filters, counter)),
            PredicatePattern::Var(v) => {
                seen.push(v.clone());
                None
            }
            _ => None,
        };
        if let Some(fresh) = predicate_replacement {
            triple.predicate = PredicatePattern::Var(fresh);
        }
        let object_replacement = match &triple.object {
            VarOrTerm::Var(v) if seen.contains(v) => Some(freshen(v, filters, counter)),
            _ => None,
        };
        if let Some(fresh) = object_replacement {
            triple.object = VarOrTerm::Var(fresh);
        }
    }
}

fn classify_triple(triple: TriplePattern) -> EngineResult<NodeKind> {
    let magic = match &triple.predicate {
        PredicatePattern::Term(rdf_model::Term::Iri(iri)) => Some(iri.as_str()),
        _ => None,
    };
    match magic {
        Some(QL_HAS_PREDICATE) => Ok(NodeKind::HasPredicate {
            subject: triple.subject,
            object: triple.object,
        }),
        Some(QL_CONTAINS_WORD) => {
            let VarOrTerm::Var(record) = triple.subject else {
                return Err(QueryError::UnsupportedFeature(
                    "ql:contains-word needs a variable subject".into(),
                ));
            };
            let VarOrTerm::Term(rdf_model::Term::Literal { lexical, .. }) = triple.object else {
                return Err(QueryError::UnsupportedFeature(
                    "ql:contains-word needs a literal object".into(),
                ));
            };
            Ok(NodeKind::Word {
                record,
                words: lexical,
            })
        }
        Some(QL_CONTAINS_ENTITY) => {
            let VarOrTerm::Var(record) = triple.subject else {
                return Err(QueryError::UnsupportedFeature(
                    "ql:contains-entity needs a variable subject".into(),
                ));
            };
            let score = Variable::new(format!(
                "ql_score_{}_{}",
                record.name(),
                match &triple.object {
                    VarOrTerm::Var(v) => v.name().to_string(),
                    VarOrTerm::Term(t) => format!("fixed_{:x}", fxhash_str(&t.to_string())),
                }
            ));
            Ok(NodeKind::Entity {
                record,
                entity: triple.object,
                score,
            })
        }
        _ => Ok(NodeKind::Triple(triple)),
    }
}

fn fxhash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Entity/score columns per text-record variable, plus the mask of nodes
/// that must be part of a plan before the text limit may wrap it.
fn build_text_limit_specs(nodes: &[PlannerNode]) -> Vec<TextLimitSpec> {
    let mut by_record: FxHashMap<Variable, TextLimitSpec> = FxHashMap::default();
    for node in nodes {
        if let NodeKind::Entity {
            record,
            entity,
            score,
        } = &node.kind
        {
            let spec = by_record
                .entry(record.clone())
                .or_insert_with(|| TextLimitSpec {
                    record_var: record.clone(),
                    entity_vars: Vec::new(),
                    score_vars: Vec::new(),
                    must_finish: 0,
                });
            if let VarOrTerm::Var(v) = entity {
                if !spec.entity_vars.contains(v) {
                    spec.entity_vars.push(v.clone());
                }
            }
            spec.score_vars.push(score.clone());
        }
    }
    for (i, node) in nodes.iter().enumerate() {
        for spec in by_record.values_mut() {
            if node.vars.contains(&spec.record_var) {
                spec.must_finish |= 1u64 << i;
            }
        }
    }
    let mut specs: Vec<TextLimitSpec> = by_record.into_values().collect();
    specs.sort_by(|a, b| a.record_var.cmp(&b.record_var));
    specs
}

// ---------------------------------------------------------------------------
// Pattern trick detection
// ---------------------------------------------------------------------------

struct PatternTrick {
    subject: Variable,
    predicate: Variable,
    count_var: Variable,
}

/// The rewrite applies iff the single GROUP BY variable is the object of
/// exactly one `ql:has-predicate` triple, that variable occurs nowhere
/// else, and the only alias is a COUNT over the triple's subject.
fn check_pattern_trick(query: &ParsedQuery) -> Option<PatternTrick> {
    if query.group_by.len() != 1 {
        return None;
    }
    let predicate = query.group_by[0].clone();
    let QueryKind::Select { aliases, .. } = &query.kind else {
        return None;
    };
    if aliases.len() != 1 {
        return None;
    }
    let (alias_expr, count_var) = &aliases[0];
    let Expression::Aggregate {
        op: AggregateOp::Count,
        expr,
        ..
    } = alias_expr
    else {
        return None;
    };
    let counted = match expr.as_deref() {
        Some(Expression::Var(v)) => Some(v.clone()),
        _ => None,
    };

    // Find the single has-predicate triple with the group variable as its
    // object.
    let mut found: Option<(Variable, Variable)> = None;
    let mut other_occurrences = 0usize;
    visit_triples(&query.root, &mut |triple| {
        let is_trick = matches!(
            (&triple.predicate, &triple.object),
            (PredicatePattern::Term(rdf_model::Term::Iri(iri)), VarOrTerm::Var(object))
                if iri == QL_HAS_PREDICATE && *object == predicate
        );
        if is_trick {
            if let (VarOrTerm::Var(subject), VarOrTerm::Var(object)) =
                (&triple.subject, &triple.object)
            {
                if found.is_none() {
                    found = Some((subject.clone(), object.clone()));
                    return;
                }
            }
            other_occurrences += 1;
        } else {
            let uses = |position: &VarOrTerm| matches!(position, VarOrTerm::Var(v) if *v == predicate);
            let pred_uses =
                matches!(&triple.predicate, PredicatePattern::Var(v) if *v == predicate);
            if uses(&triple.subject) || pred_uses || uses(&triple.object) {
                other_occurrences += 1;
            }
        }
    });
    let (subject, _) = found?;
    if other_occurrences > 0 {
        return None;
    }
    if let Some(counted) = &counted {
        if *counted != subject {
            return None;
        }
    }
    Some(PatternTrick {
        subject,
        predicate,
        count_var: count_var.clone(),
    })
}

fn visit_triples(pattern: &GraphPattern, visit: &mut impl FnMut(&TriplePattern)) {
    match pattern {
        GraphPattern::Basic { triples } => triples.iter().for_each(&mut *visit),
        GraphPattern::Group(elements) => {
            for element in elements {
                visit_triples(element, visit);
            }
        }
        GraphPattern::Optional(inner) | GraphPattern::Minus(inner) => {
            visit_triples(inner, visit)
        }
        GraphPattern::Union(a, b) => {
            visit_triples(a, visit);
            visit_triples(b, visit);
        }
        GraphPattern::Subquery(inner) => visit_triples(&inner.root, visit),
        GraphPattern::Service { pattern, .. } => visit_triples(pattern, visit),
        GraphPattern::Filter(_) | GraphPattern::Values { .. } | GraphPattern::Bind { .. } => {}
    }
}

/// Remove the trick triple; `None` when nothing else remains.
fn remove_trick_triple(pattern: &GraphPattern, trick: &PatternTrick) -> Option<GraphPattern> {
    let is_trick = |triple: &TriplePattern| {
        matches!(
            (&triple.subject, &triple.predicate, &triple.object),
            (VarOrTerm::Var(s), PredicatePattern::Term(rdf_model::Term::Iri(iri)), VarOrTerm::Var(o))
                if iri == QL_HAS_PREDICATE && *s == trick.subject && *o == trick.predicate
        )
    };
    match pattern {
        GraphPattern::Basic { triples } => {
            let remaining: Vec<TriplePattern> = triples
                .iter()
                .filter(|t| !is_trick(t))
                .cloned()
                .collect();
            (!remaining.is_empty()).then(|| GraphPattern::Basic { triples: remaining })
        }
        GraphPattern::Group(elements) => {
            let remaining: Vec<GraphPattern> = elements
                .iter()
                .filter_map(|element| remove_trick_triple(element, trick))
                .collect();
            (!remaining.is_empty()).then(|| GraphPattern::Group(remaining))
        }
        other => Some(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// HAVING rewriting and subquery variable hiding
// ---------------------------------------------------------------------------

/// Replace every aggregate subexpression by a hidden output column of the
/// group-by, collecting the necessary aggregate specs.
fn extract_aggregates(
    expression: Expression,
    aggregates: &mut Vec<AggregateSpec>,
    counter: &mut usize,
) -> Expression {
    if matches!(expression, Expression::Aggregate { .. }) {
        let hidden = Variable::new(format!("_having_{counter}"));
        *counter += 1;
        aggregates.push(AggregateSpec {
            expression,
            output: hidden.clone(),
        });
        return Expression::Var(hidden);
    }
    match expression {
        Expression::And(a, b) => Expression::And(
            Box::new(extract_aggregates(*a, aggregates, counter)),
            Box::new(extract_aggregates(*b, aggregates, counter)),
        ),
        Expression::Or(a, b) => Expression::Or(
            Box::new(extract_aggregates(*a, aggregates, counter)),
            Box::new(extract_aggregates(*b, aggregates, counter)),
        ),
        Expression::Not(e) => {
            Expression::Not(Box::new(extract_aggregates(*e, aggregates, counter)))
        }
        Expression::Relational { op, left, right } => Expression::Relational {
            op,
            left: Box::new(extract_aggregates(*left, aggregates, counter)),
            right: Box::new(extract_aggregates(*right, aggregates, counter)),
        },
        Expression::Arithmetic { op, left, right } => Expression::Arithmetic {
            op,
            left: Box::new(extract_aggregates(*left, aggregates, counter)),
            right: Box::new(extract_aggregates(*right, aggregates, counter)),
        },
        other => other,
    }
}

/// Rename all variables of a subquery that it does not select, making them
/// invisible to the outer query.
fn rename_hidden_variables(query: &ParsedQuery, counter: &mut usize) -> ParsedQuery {
    let visible: Vec<Variable> = match &query.kind {
        QueryKind::Select { variables, aliases } if !variables.is_empty() => {
            let mut visible = variables.clone();
            visible.extend(aliases.iter().map(|(_, v)| v.clone()));
            visible
        }
        // SELECT * hides nothing.
        _ => return query.clone(),
    };
    let mut mapping: FxHashMap<Variable, Variable> = FxHashMap::default();
    let mut renamed = query.clone();
    rename_in_pattern(&mut renamed.root, &visible, &mut mapping, counter);
    for having in &mut renamed.having {
        rename_in_expression(having, &visible, &mut mapping, counter);
    }
    if let QueryKind::Select { aliases, .. } = &mut renamed.kind {
        for (expression, _) in aliases {
            rename_in_expression(expression, &visible, &mut mapping, counter);
        }
    }
    for variable in &mut renamed.group_by {
        rename_var(variable, &visible, &mut mapping, counter);
    }
    renamed
}

fn rename_var(
    variable: &mut Variable,
    visible: &[Variable],
    mapping: &mut FxHashMap<Variable, Variable>,
    counter: &mut usize,
) {
    if visible.contains(variable) {
        return;
    }
    let renamed = mapping.entry(variable.clone()).or_insert_with(|| {
        let fresh = Variable::new(format!("_subq_{counter}_{}", variable.name()));
        *counter += 1;
        fresh
    });
    *variable = renamed.clone();
}

fn rename_in_pattern(
    pattern: &mut GraphPattern,
    visible: &[Variable],
    mapping: &mut FxHashMap<Variable, Variable>,
    counter: &mut usize,
) {
    match pattern {
        GraphPattern::Basic { triples } => {
            for triple in triples {
                if let VarOrTerm::Var(v) = &mut triple.subject {
                    rename_var(v, visible, mapping, counter);
                }
                if let PredicatePattern::Var(v) = &mut triple.predicate {
                    rename_var(v, visible, mapping, counter);
                }
                if let VarOrTerm::Var(v) = &mut triple.object {
                    rename_var(v, visible, mapping, counter);
                }
            }
        }
        GraphPattern::Group(elements) => {
            for element in elements {
                rename_in_pattern(element, visible, mapping, counter);
            }
        }
        GraphPattern::Optional(inner)
        | GraphPattern::Minus(inner)
        | GraphPattern::Service { pattern: inner, .. } => {
            rename_in_pattern(inner, visible, mapping, counter)
        }
        GraphPattern::Union(a, b) => {
            rename_in_pattern(a, visible, mapping, counter);
            rename_in_pattern(b, visible, mapping, counter);
        }
        GraphPattern::Filter(expression) => {
            rename_in_expression(expression, visible, mapping, counter)
        }
        GraphPattern::Bind {
            expression,
            variable,
        } => {
            rename_in_expression(expression, visible, mapping, counter);
            rename_var(variable, visible, mapping, counter);
        }
        GraphPattern::Values { variables, .. } => {
            for variable in variables {
                rename_var(variable, visible, mapping, counter);
            }
        }
        // Nested subqueries manage their own hiding when planned.
        GraphPattern::Subquery(_) => {}
    }
}

fn rename_in_expression(
    expression: &mut Expression,
    visible: &[Variable],
    mapping: &mut FxHashMap<Variable, Variable>,
    counter: &mut usize,
) {
    match expression {
        Expression::Var(v) | Expression::Bound(v) => rename_var(v, visible, mapping, counter),
        Expression::And(a, b)
        | Expression::Or(a, b)
        | Expression::Relational { left: a, right: b, .. }
        | Expression::Arithmetic { left: a, right: b, .. } => {
            rename_in_expression(a, visible, mapping, counter);
            rename_in_expression(b, visible, mapping, counter);
        }
        Expression::Not(e) | Expression::Neg(e) | Expression::Lang(e) | Expression::Str(e) => {
            rename_in_expression(e, visible, mapping, counter)
        }
        Expression::In { left, values } => {
            rename_in_expression(left, visible, mapping, counter);
            for value in values {
                rename_in_expression(value, visible, mapping, counter);
            }
        }
        Expression::Aggregate { expr, .. } => {
            if let Some(expr) = expr {
                rename_in_expression(expr, visible, mapping, counter);
            }
        }
        Expression::Constant(_)
        | Expression::Bool(_)
        | Expression::Int(_)
        | Expression::Double(_) => {}
    }
}
