//! Property-style tests of the operator contracts: sort order, join
//! commutativity of the result multiset, lazy/materialized equivalence and
//! limit/offset composition.

use std::sync::Arc;

use engine::{
    Evaluator, GraphPattern, OpHandle, Operator, ParsedQuery, PlanArena, QueryContext,
    QueryEngine, QueryPlanner, TriplePattern,
};
use index::{IndexBuilder, IndexConfig};
use proptest::prelude::*;

fn context_with_edges(edges: &[(u8, u8)]) -> QueryContext {
    let mut builder = IndexBuilder::new(IndexConfig {
        block_size: 3,
        ..IndexConfig::default()
    });
    for &(from, to) in edges {
        builder
            .add(
                &format!("<n{from}>"),
                "<edge>",
                &format!("<n{to}>"),
            )
            .unwrap();
    }
    // A second relation over the same nodes for joins.
    for &(from, to) in edges {
        builder
            .add(
                &format!("<n{to}>"),
                "<back>",
                &format!("<n{from}>"),
            )
            .unwrap();
    }
    QueryContext::new(Arc::new(builder.build().unwrap())).in_test_mode()
}

fn join_query(left_first: bool) -> ParsedQuery {
    let a = TriplePattern::parse("?x", "<edge>", "?y");
    let b = TriplePattern::parse("?y", "<back>", "?z");
    let triples = if left_first { vec![a, b] } else { vec![b, a] };
    ParsedQuery::select(GraphPattern::basic(triples))
}

fn sorted_rows(ctx: &QueryContext, query: &ParsedQuery) -> Vec<Vec<String>> {
    let engine = QueryEngine::with_context(ctx.clone());
    let (plan, result) = engine.execute(query).unwrap();
    let var_map = &plan.arena.node(plan.root).var_map;
    let mut names: Vec<&engine::Variable> = var_map.variables().collect();
    names.sort();
    let mut rows: Vec<Vec<String>> = (0..result.table.num_rows())
        .map(|row| {
            names
                .iter()
                .map(|v| {
                    let col = var_map.column_of(v).unwrap();
                    format!("{:?}", result.table.at(row, col))
                })
                .collect()
        })
        .collect();
    rows.sort();
    rows
}

/// Every operator output is lex-sorted by its declared sort columns.
fn assert_sort_contract(arena: &PlanArena, handle: OpHandle, ctx: &QueryContext) {
    let evaluator = Evaluator::new(arena, ctx);
    let node = arena.node(handle);
    if !matches!(node.op, Operator::IndexScan(_) | Operator::NeutralElement) {
        for &child in node.children.iter() {
            assert_sort_contract(arena, child, ctx);
        }
    }
    let result = evaluator.materialize(handle, None).unwrap();
    assert!(
        result.table.is_sorted_by(&result.sorted_by),
        "operator {} violated its sort contract",
        node.op.descriptor()
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn join_result_is_commutative(
        edges in prop::collection::vec((0u8..6, 0u8..6), 1..12)
    ) {
        let ctx = context_with_edges(&edges);
        let ab = sorted_rows(&ctx, &join_query(true));
        let ba = sorted_rows(&ctx, &join_query(false));
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn lazy_equals_materialized(
        edges in prop::collection::vec((0u8..5, 0u8..5), 1..10)
    ) {
        let ctx = context_with_edges(&edges);
        let plan = QueryPlanner::new(&ctx).plan(&join_query(true)).unwrap();
        let evaluator = Evaluator::new(&plan.arena, &ctx);
        let lazy = evaluator
            .evaluate(plan.root, true, None)
            .unwrap()
            .into_materialized(&ctx.memory)
            .unwrap();
        let ctx2 = ctx.fork_for_query();
        ctx2.cache.clear_unpinned();
        let evaluator = Evaluator::new(&plan.arena, &ctx2);
        let materialized = evaluator.materialize(plan.root, None).unwrap();
        prop_assert_eq!(lazy.table.num_rows(), materialized.table.num_rows());
        for row in 0..lazy.table.num_rows() {
            prop_assert_eq!(lazy.table.row_vec(row), materialized.table.row_vec(row));
        }
    }

    #[test]
    fn sort_contract_holds_for_whole_tree(
        edges in prop::collection::vec((0u8..5, 0u8..5), 1..10)
    ) {
        let ctx = context_with_edges(&edges);
        let plan = QueryPlanner::new(&ctx).plan(&join_query(true)).unwrap();
        assert_sort_contract(&plan.arena, plan.root, &ctx);
    }
}

#[test]
fn limit_offset_composition() {
    let edges: Vec<(u8, u8)> = (0..8).map(|i| (i, (i + 1) % 8)).collect();
    let ctx = context_with_edges(&edges);
    let base = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "?x", "<edge>", "?y",
    )]));
    let engine = QueryEngine::with_context(ctx);

    // apply(apply(r, limit, o1), limit, o2) == apply(r, limit, o1 + o2)
    let composed = {
        let inner = base.clone().with_limit(5).with_offset(2);
        let query = ParsedQuery::select(GraphPattern::Subquery(Box::new(inner)))
            .with_limit(5)
            .with_offset(1);
        engine.execute(&query).unwrap().1
    };
    let direct = engine
        .execute(&base.clone().with_limit(4).with_offset(3))
        .unwrap()
        .1;
    assert_eq!(composed.table.num_rows(), direct.table.num_rows());

    // Applying the same limit twice is a no-op.
    let once = engine.execute(&base.clone().with_limit(3)).unwrap().1;
    let twice = {
        let inner = base.clone().with_limit(3);
        let query =
            ParsedQuery::select(GraphPattern::Subquery(Box::new(inner))).with_limit(3);
        engine.execute(&query).unwrap().1
    };
    assert_eq!(once.table.num_rows(), twice.table.num_rows());
}

#[test]
fn undef_join_takes_defined_value() {
    // A VALUES row with UNDEF in the join column matches every row of the
    // other side, and the output carries the defined value.
    let ctx = context_with_edges(&[(0, 1), (2, 3)]);
    let query = ParsedQuery::select(GraphPattern::Group(vec![
        GraphPattern::basic(vec![TriplePattern::parse("?x", "<edge>", "?y")]),
        GraphPattern::Values {
            variables: vec![engine::Variable::new("x"), engine::Variable::new("tag")],
            rows: vec![vec![None, Some(rdf_model::Term::literal("wild"))]],
        },
    ]));
    let engine = QueryEngine::with_context(ctx);
    let (plan, result) = engine.execute(&query).unwrap();
    // Both edge rows match the single UNDEF row.
    assert_eq!(result.table.num_rows(), 2);
    let var_map = &plan.arena.node(plan.root).var_map;
    let x = var_map.column_of(&engine::Variable::new("x")).unwrap();
    for row in 0..result.table.num_rows() {
        assert!(!result.table.at(row, x).is_undefined());
    }
}
