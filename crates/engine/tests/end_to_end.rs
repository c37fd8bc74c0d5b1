//! End-to-end query execution over the small shared knowledge graph:
//!
//! ```text
//! <s>  <p>  <c> .
//! <s>  <p>  <c2> .
//! <s>  <p2> <c> .
//! <s2> <p2> <c2> .
//! ```

use std::sync::Arc;

use engine::{
    Expression, GraphPattern, MaterializedResult, ParsedQuery, QueryEngine, TriplePattern,
};
use index::{IndexBuilder, IndexConfig};
use rdf_model::Term;

fn engine() -> QueryEngine {
    let mut builder = IndexBuilder::new(IndexConfig {
        block_size: 2,
        ..IndexConfig::default()
    });
    builder.add("<s>", "<p>", "<c>").unwrap();
    builder.add("<s>", "<p>", "<c2>").unwrap();
    builder.add("<s>", "<p2>", "<c>").unwrap();
    builder.add("<s2>", "<p2>", "<c2>").unwrap();
    QueryEngine::with_context(
        engine::QueryContext::new(Arc::new(builder.build().unwrap())).in_test_mode(),
    )
}

fn terms_of(
    engine: &QueryEngine,
    result: &MaterializedResult,
    plan: &engine::ExecutionPlan,
) -> Vec<Vec<Option<String>>> {
    let var_map = &plan.arena.node(plan.root).var_map;
    let columns: Vec<usize> = plan
        .selected
        .iter()
        .filter_map(|v| var_map.column_of(v))
        .collect();
    (0..result.table.num_rows())
        .map(|row| {
            columns
                .iter()
                .map(|&c| {
                    let id = result.table.at(row, c);
                    if id.is_undefined() {
                        None
                    } else {
                        engine::id_to_term(&engine.context().index, &result.vocab, id)
                            .map(|t| t.to_string())
                    }
                })
                .collect()
        })
        .collect()
}

#[test]
fn single_variable_scan() {
    let engine = engine();
    // SELECT ?x WHERE { ?x <p> <c> }
    let query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "?x", "<p>", "<c>",
    )]))
    .with_variables(&["x"]);
    let (plan, result) = engine.execute(&query).unwrap();
    assert_eq!(
        terms_of(&engine, &result, &plan),
        vec![vec![Some("<s>".to_string())]]
    );
}

#[test]
fn two_join_star_is_empty() {
    let engine = engine();
    // SELECT ?x ?y ?z WHERE { ?x <p> ?y . ?y <p2> ?z }
    let query = ParsedQuery::select(GraphPattern::basic(vec![
        TriplePattern::parse("?x", "<p>", "?y"),
        TriplePattern::parse("?y", "<p2>", "?z"),
    ]));
    let (_, result) = engine.execute(&query).unwrap();
    assert_eq!(result.table.num_rows(), 0);
}

#[test]
fn cartesian_product_of_disjoint_components() {
    let engine = engine();
    // SELECT ?a ?b WHERE { ?a <p> <c> . ?b <p2> <c2> }
    let query = ParsedQuery::select(GraphPattern::basic(vec![
        TriplePattern::parse("?a", "<p>", "<c>"),
        TriplePattern::parse("?b", "<p2>", "<c2>"),
    ]))
    .with_variables(&["a", "b"]);
    let (plan, result) = engine.execute(&query).unwrap();
    let mut rows = terms_of(&engine, &result, &plan);
    rows.sort();
    // ?a = <s>; ?b in {<s>, <s2>}.
    assert_eq!(
        rows,
        vec![
            vec![Some("<s>".to_string()), Some("<s>".to_string())],
            vec![Some("<s>".to_string()), Some("<s2>".to_string())],
        ]
    );
}

#[test]
fn optional_with_unbound_right_side() {
    let engine = engine();
    // SELECT ?x ?y WHERE { ?x <p> <c> OPTIONAL { ?x <absent> ?y } }
    let query = ParsedQuery::select(GraphPattern::Group(vec![
        GraphPattern::basic(vec![TriplePattern::parse("?x", "<p>", "<c>")]),
        GraphPattern::Optional(Box::new(GraphPattern::basic(vec![TriplePattern::parse(
            "?x", "<absent>", "?y",
        )]))),
    ]))
    .with_variables(&["x", "y"]);
    let (plan, result) = engine.execute(&query).unwrap();
    assert_eq!(
        terms_of(&engine, &result, &plan),
        vec![vec![Some("<s>".to_string()), None]]
    );
}

#[test]
fn minus_removes_matching_row() {
    let engine = engine();
    // SELECT ?x WHERE { ?x <p> ?y MINUS { ?x <p> <c2> } }
    // <s> <p> <c2> exists, so every ?x = <s> row is removed.
    let query = ParsedQuery::select(GraphPattern::Group(vec![
        GraphPattern::basic(vec![TriplePattern::parse("?x", "<p>", "?y")]),
        GraphPattern::Minus(Box::new(GraphPattern::basic(vec![TriplePattern::parse(
            "?x", "<p>", "<c2>",
        )]))),
    ]))
    .with_variables(&["x"]);
    let (_, result) = engine.execute(&query).unwrap();
    assert_eq!(result.table.num_rows(), 0);
}

#[test]
fn order_by_with_limit_and_offset() {
    let engine = engine();
    // SELECT ?x WHERE { ?x ?p ?o } ORDER BY ?x LIMIT 1 OFFSET 1
    // Distinct subjects in order: <s>, <s2>; with duplicates the second
    // solution row is still bound to <s>; deduplicate via DISTINCT to get
    // the deduplicated shape.
    let query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "?x", "?p", "?o",
    )]))
    .with_variables(&["x"])
    .with_distinct()
    .with_order_by("x", false)
    .with_limit(1)
    .with_offset(1);
    let (plan, result) = engine.execute(&query).unwrap();
    assert_eq!(
        terms_of(&engine, &result, &plan),
        vec![vec![Some("<s2>".to_string())]]
    );
}

#[test]
fn union_harmonizes_columns() {
    let engine = engine();
    let query = ParsedQuery::select(GraphPattern::Union(
        Box::new(GraphPattern::basic(vec![TriplePattern::parse(
            "?x", "<p>", "?y",
        )])),
        Box::new(GraphPattern::basic(vec![TriplePattern::parse(
            "?x", "<p2>", "?z",
        )])),
    ));
    let (_, result) = engine.execute(&query).unwrap();
    // 2 rows from <p>, 2 rows from <p2>; ?z unbound in the left rows.
    assert_eq!(result.table.num_rows(), 4);
    assert_eq!(result.table.num_columns(), 3);
}

#[test]
fn filter_drops_rows_three_valued() {
    let engine = engine();
    // FILTER(?y = <c>) keeps exactly the <c> rows of ?x <p> ?y.
    let query = ParsedQuery::select(GraphPattern::Group(vec![
        GraphPattern::basic(vec![TriplePattern::parse("?x", "<p>", "?y")]),
        GraphPattern::Filter(Expression::eq(
            Expression::var("y"),
            Expression::Constant(Term::iri("c")),
        )),
    ]));
    let (_, result) = engine.execute(&query).unwrap();
    assert_eq!(result.table.num_rows(), 1);
}

#[test]
fn values_join_with_pattern() {
    let engine = engine();
    let query = ParsedQuery::select(GraphPattern::Group(vec![
        GraphPattern::basic(vec![TriplePattern::parse("?x", "<p2>", "?y")]),
        GraphPattern::Values {
            variables: vec![engine::Variable::new("x")],
            rows: vec![vec![Some(Term::iri("s2"))]],
        },
    ]))
    .with_variables(&["x", "y"]);
    let (plan, result) = engine.execute(&query).unwrap();
    assert_eq!(
        terms_of(&engine, &result, &plan),
        vec![vec![Some("<s2>".to_string()), Some("<c2>".to_string())]]
    );
}

#[test]
fn group_by_counts_per_key() {
    let engine = engine();
    // SELECT ?x (COUNT(?y) AS ?n) WHERE { ?x <p> ?y } GROUP BY ?x
    let mut query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "?x", "<p>", "?y",
    )]))
    .with_group_by(&["x"]);
    if let engine::QueryKind::Select { variables, aliases } = &mut query.kind {
        *variables = vec![engine::Variable::new("x")];
        aliases.push((
            Expression::aggregate(engine::AggregateOp::Count, Expression::var("y")),
            engine::Variable::new("n"),
        ));
    }
    let (plan, result) = engine.execute(&query).unwrap();
    let rows = terms_of(&engine, &result, &plan);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], Some("<s>".to_string()));
    assert_eq!(
        rows[0][1],
        Some("\"2\"^^<http://www.w3.org/2001/XMLSchema#integer>".to_string())
    );
}

#[test]
fn ask_query_reports_existence() {
    let engine = engine();
    let mut query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "<s>", "<p>", "<c>",
    )]));
    query.kind = engine::QueryKind::Ask;
    let (plan, result) = engine.execute(&query).unwrap();
    assert!(plan.is_ask);
    assert_eq!(result.table.num_rows(), 1);

    let mut absent = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "<s2>", "<p>", "<c>",
    )]));
    absent.kind = engine::QueryKind::Ask;
    let (_, result) = engine.execute(&absent).unwrap();
    assert_eq!(result.table.num_rows(), 0);
}

#[test]
fn transitive_path_one_or_more() {
    let mut builder = IndexBuilder::default();
    builder.add("<a>", "<edge>", "<b>").unwrap();
    builder.add("<b>", "<edge>", "<c>").unwrap();
    let engine = QueryEngine::new(Arc::new(builder.build().unwrap()));
    // SELECT ?y WHERE { <a> <edge>+ ?y }
    let query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::new(
        engine::VarOrTerm::Term(Term::iri("a")),
        engine::PredicatePattern::Path(engine::PropertyPath::OneOrMore(Box::new(
            engine::PropertyPath::Iri(Term::iri("edge")),
        ))),
        engine::VarOrTerm::var("y"),
    )]));
    let (_, result) = engine.execute(&query).unwrap();
    // <a> reaches <b> and <c>.
    assert_eq!(result.table.num_rows(), 2);
}

#[test]
fn export_formats_smoke() {
    let engine = engine();
    let query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "?x", "<p>", "<c>",
    )]))
    .with_variables(&["x"]);

    let tsv = engine
        .execute_and_export(&query, engine::ExportFormat::Tsv)
        .unwrap();
    assert_eq!(String::from_utf8(tsv).unwrap(), "?x\n<s>\n");

    let csv = engine
        .execute_and_export(&query, engine::ExportFormat::Csv)
        .unwrap();
    assert_eq!(String::from_utf8(csv).unwrap(), "x\r\ns\r\n");

    let json = engine
        .execute_and_export(&query, engine::ExportFormat::SparqlJson)
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
    assert_eq!(parsed["head"]["vars"][0], "x");
    assert_eq!(
        parsed["results"]["bindings"][0]["x"]["value"],
        "s"
    );

    let xml = engine
        .execute_and_export(&query, engine::ExportFormat::SparqlXml)
        .unwrap();
    let xml = String::from_utf8(xml).unwrap();
    assert!(xml.contains("<uri>s</uri>"));

    let binary = engine
        .execute_and_export(&query, engine::ExportFormat::Binary)
        .unwrap();
    assert_eq!(binary.len(), 8);
}

#[test]
fn construct_exports_turtle() {
    let engine = engine();
    let mut query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "?x", "<p>", "<c>",
    )]));
    query.kind = engine::QueryKind::Construct(vec![TriplePattern::parse(
        "?x",
        "<derived>",
        "<c>",
    )]);
    let turtle = engine
        .execute_and_export(&query, engine::ExportFormat::Turtle)
        .unwrap();
    assert_eq!(
        String::from_utf8(turtle).unwrap(),
        "<s> <derived> <c> .\n"
    );
}

#[test]
fn cancellation_aborts_query() {
    let engine = engine();
    let ctx = engine.context().fork_for_query();
    ctx.cancellation.cancel();
    let query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "?x", "?p", "?o",
    )]));
    let error = QueryEngine::execute_in(&ctx, &query).unwrap_err();
    assert!(matches!(error, engine::QueryError::Cancelled { .. }));
}

#[test]
fn memory_limit_aborts_query() {
    let engine = engine();
    let ctx = engine.context().fork_for_query().with_memory_limit(16);
    let query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "?x", "?p", "?o",
    )]));
    let error = QueryEngine::execute_in(&ctx, &query).unwrap_err();
    assert!(matches!(
        error,
        engine::QueryError::MemoryLimitExceeded { .. }
    ));
}

#[test]
fn repeated_query_hits_the_cache() {
    let engine = engine();
    let query = ParsedQuery::select(GraphPattern::basic(vec![TriplePattern::parse(
        "?x", "<p>", "?y",
    )]));
    let (_, first) = engine.execute(&query).unwrap();
    let (_, second) = engine.execute(&query).unwrap();
    assert_eq!(first.table.num_rows(), second.table.num_rows());
    assert!(engine.context().cache.num_entries() > 0);
}
