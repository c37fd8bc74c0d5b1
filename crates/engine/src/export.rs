//! Result export at the system boundary.
//!
//! Seven formats selected by media type (or an explicit `action`): TSV and
//! CSV per the W3C conventions, Turtle for CONSTRUCT, the W3C SPARQL results
//! JSON and XML, the engine's own JSON format with runtime information, and
//! raw little-endian id tuples.

use std::time::Duration;

use itertools::Itertools;
use rdf_model::{Id, LocalVocab, Tag, Term};
use serde_json::json;

use crate::arena::{OpHandle, PlanArena};
use crate::error::{EngineResult, QueryError};
use crate::planner::ExecutionPlan;
use crate::result::MaterializedResult;
use crate::variable::Variable;
use index::Index;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Tsv,
    Csv,
    Turtle,
    SparqlJson,
    EngineJson,
    SparqlXml,
    Binary,
}

impl ExportFormat {
    pub fn from_media_type(media_type: &str) -> Option<ExportFormat> {
        match media_type.split(';').next().map(str::trim) {
            Some("text/tab-separated-values") => Some(ExportFormat::Tsv),
            Some("text/csv") => Some(ExportFormat::Csv),
            Some("text/turtle") => Some(ExportFormat::Turtle),
            Some("application/sparql-results+json") => Some(ExportFormat::SparqlJson),
            Some("application/hexad-results+json") => Some(ExportFormat::EngineJson),
            Some("application/sparql-results+xml") => Some(ExportFormat::SparqlXml),
            Some("application/octet-stream") => Some(ExportFormat::Binary),
            _ => None,
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            ExportFormat::Tsv => "text/tab-separated-values",
            ExportFormat::Csv => "text/csv",
            ExportFormat::Turtle => "text/turtle",
            ExportFormat::SparqlJson => "application/sparql-results+json",
            ExportFormat::EngineJson => "application/hexad-results+json",
            ExportFormat::SparqlXml => "application/sparql-results+xml",
            ExportFormat::Binary => "application/octet-stream",
        }
    }
}

/// Resolve an id to its term, consulting the query's local vocabulary for
/// `LocalVocabIndex` ids.
pub fn id_to_term(index: &Index, vocab: &LocalVocab, id: Id) -> Option<Term> {
    match id.tag() {
        Tag::LocalVocabIndex => Term::parse(vocab.word_for_id(id)?).ok(),
        Tag::TextRecordIndex => Some(Term::literal(format!(
            "text-record-{}",
            id.payload()
        ))),
        _ => index.id_to_term(id),
    }
}

struct Output<'a> {
    index: &'a Index,
    result: &'a MaterializedResult,
    /// (variable, column) pairs in output order.
    columns: Vec<(Variable, usize)>,
}

impl Output<'_> {
    fn term_at(&self, row: usize, output_col: usize) -> Option<Term> {
        let id = self.result.table.at(row, self.columns[output_col].1);
        if id.is_undefined() {
            return None;
        }
        id_to_term(self.index, &self.result.vocab, id)
    }
}

fn output<'a>(
    index: &'a Index,
    plan: &ExecutionPlan,
    result: &'a MaterializedResult,
) -> EngineResult<Output<'a>> {
    let var_map = &plan.arena.node(plan.root).var_map;
    let columns = plan
        .selected
        .iter()
        .map(|variable| {
            var_map
                .column_of(variable)
                .map(|c| (variable.clone(), c))
                .ok_or_else(|| {
                    QueryError::Export(format!("selected variable {variable} has no column"))
                })
        })
        .collect::<EngineResult<_>>()?;
    Ok(Output {
        index,
        result,
        columns,
    })
}

/// Export a materialized result in the chosen format.
pub fn export_result(
    format: ExportFormat,
    index: &Index,
    plan: &ExecutionPlan,
    result: &MaterializedResult,
    with_time: bool,
    elapsed: Option<Duration>,
) -> EngineResult<Vec<u8>> {
    if plan.construct.is_some()
        && matches!(
            format,
            ExportFormat::SparqlXml | ExportFormat::Binary | ExportFormat::SparqlJson
        )
    {
        return Err(QueryError::Export(format!(
            "{} cannot serialize CONSTRUCT results",
            format.media_type()
        )));
    }
    match format {
        ExportFormat::Tsv => export_tsv(index, plan, result),
        ExportFormat::Csv => export_csv(index, plan, result),
        ExportFormat::Turtle => export_turtle(index, plan, result),
        ExportFormat::SparqlJson => export_sparql_json(index, plan, result),
        ExportFormat::EngineJson => export_engine_json(index, plan, result, with_time, elapsed),
        ExportFormat::SparqlXml => export_sparql_xml(index, plan, result),
        ExportFormat::Binary => export_binary(plan, result),
    }
}

/// The JSON error body of a failed query.
pub fn error_body(error: &QueryError, query_description: &str, phase: &str) -> Vec<u8> {
    serde_json::to_vec_pretty(&json!({
        "kind": error.kind(),
        "message": error.to_string(),
        "query": query_description,
        "phase": phase,
    }))
    .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Text formats
// ---------------------------------------------------------------------------

fn export_tsv(
    index: &Index,
    plan: &ExecutionPlan,
    result: &MaterializedResult,
) -> EngineResult<Vec<u8>> {
    let out = output(index, plan, result)?;
    let mut buffer = String::new();
    buffer.push_str(&out.columns.iter().map(|(v, _)| v.to_string()).join("\t"));
    buffer.push('\n');
    for row in 0..result.table.num_rows() {
        let line = (0..out.columns.len())
            .map(|c| {
                out.term_at(row, c)
                    .map(|t| t.to_string())
                    .unwrap_or_default()
            })
            .join("\t");
        buffer.push_str(&line);
        buffer.push('\n');
    }
    Ok(buffer.into_bytes())
}

fn csv_quote(field: &str) -> String {
    if field.contains(['"', ',', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn csv_value(term: Option<Term>) -> String {
    match term {
        None => String::new(),
        Some(Term::Iri(iri)) => csv_quote(&iri),
        Some(Term::Literal { lexical, .. }) => csv_quote(&lexical),
        Some(Term::BlankNode(label)) => csv_quote(&format!("_:{label}")),
    }
}

fn export_csv(
    index: &Index,
    plan: &ExecutionPlan,
    result: &MaterializedResult,
) -> EngineResult<Vec<u8>> {
    let out = output(index, plan, result)?;
    let mut buffer = String::new();
    buffer.push_str(&out.columns.iter().map(|(v, _)| csv_quote(v.name())).join(","));
    buffer.push_str("\r\n");
    for row in 0..result.table.num_rows() {
        let line = (0..out.columns.len())
            .map(|c| csv_value(out.term_at(row, c)))
            .join(",");
        buffer.push_str(&line);
        buffer.push_str("\r\n");
    }
    Ok(buffer.into_bytes())
}

fn export_turtle(
    index: &Index,
    plan: &ExecutionPlan,
    result: &MaterializedResult,
) -> EngineResult<Vec<u8>> {
    let template = plan.construct.as_ref().ok_or_else(|| {
        QueryError::Export("text/turtle is only available for CONSTRUCT queries".into())
    })?;
    let var_map = &plan.arena.node(plan.root).var_map;
    let mut buffer = String::new();
    for row in 0..result.table.num_rows() {
        for triple in template {
            let resolve = |position: &crate::parsed_query::VarOrTerm| -> Option<Term> {
                match position {
                    crate::parsed_query::VarOrTerm::Term(term) => Some(term.clone()),
                    crate::parsed_query::VarOrTerm::Var(variable) => {
                        let column = var_map.column_of(variable)?;
                        let id = result.table.at(row, column);
                        if id.is_undefined() {
                            return None;
                        }
                        id_to_term(index, &result.vocab, id)
                    }
                }
            };
            let predicate = match &triple.predicate {
                crate::parsed_query::PredicatePattern::Term(term) => Some(term.clone()),
                crate::parsed_query::PredicatePattern::Var(variable) => var_map
                    .column_of(variable)
                    .map(|column| result.table.at(row, column))
                    .filter(|id| !id.is_undefined())
                    .and_then(|id| id_to_term(index, &result.vocab, id)),
                crate::parsed_query::PredicatePattern::Path(_) => None,
            };
            if let (Some(s), Some(p), Some(o)) =
                (resolve(&triple.subject), predicate, resolve(&triple.object))
            {
                buffer.push_str(&format!("{s} {p} {o} .\n"));
            }
        }
    }
    Ok(buffer.into_bytes())
}

// ---------------------------------------------------------------------------
// JSON formats
// ---------------------------------------------------------------------------

fn json_binding(term: &Term) -> serde_json::Value {
    match term {
        Term::Iri(iri) => json!({"type": "uri", "value": iri}),
        Term::Literal {
            lexical,
            language: Some(lang),
            ..
        } => json!({"type": "literal", "value": lexical, "xml:lang": lang}),
        Term::Literal {
            lexical,
            datatype: Some(datatype),
            ..
        } => json!({"type": "literal", "value": lexical, "datatype": datatype}),
        Term::Literal { lexical, .. } => json!({"type": "literal", "value": lexical}),
        Term::BlankNode(label) => json!({"type": "bnode", "value": label}),
    }
}

fn export_sparql_json(
    index: &Index,
    plan: &ExecutionPlan,
    result: &MaterializedResult,
) -> EngineResult<Vec<u8>> {
    if plan.is_ask {
        let body = json!({
            "head": {},
            "boolean": !result.table.is_empty(),
        });
        return serde_json::to_vec_pretty(&body)
            .map_err(|e| QueryError::Export(e.to_string()));
    }
    let out = output(index, plan, result)?;
    let vars: Vec<&str> = out.columns.iter().map(|(v, _)| v.name()).collect();
    let mut bindings = Vec::with_capacity(result.table.num_rows());
    for row in 0..result.table.num_rows() {
        let mut binding = serde_json::Map::new();
        for (c, (variable, _)) in out.columns.iter().enumerate() {
            if let Some(term) = out.term_at(row, c) {
                binding.insert(variable.name().to_string(), json_binding(&term));
            }
        }
        bindings.push(serde_json::Value::Object(binding));
    }
    let body = json!({
        "head": {"vars": vars},
        "results": {"bindings": bindings},
    });
    serde_json::to_vec_pretty(&body).map_err(|e| QueryError::Export(e.to_string()))
}

/// The runtime-information tree: one JSON node per operator.
fn runtime_information(arena: &PlanArena, handle: OpHandle) -> serde_json::Value {
    let node = arena.node(handle);
    let children: Vec<serde_json::Value> = node
        .children
        .iter()
        .map(|&child| runtime_information(arena, child))
        .collect();
    json!({
        "description": node.op.descriptor(),
        "result_cols": node.width(),
        "size_estimate": node.size_estimate,
        "cost_estimate": node.cost_estimate,
        "children": children,
    })
}

fn export_engine_json(
    index: &Index,
    plan: &ExecutionPlan,
    result: &MaterializedResult,
    with_time: bool,
    elapsed: Option<Duration>,
) -> EngineResult<Vec<u8>> {
    let out = output(index, plan, result)?;
    let vars: Vec<String> = out.columns.iter().map(|(v, _)| v.to_string()).collect();
    let mut rows = Vec::with_capacity(result.table.num_rows());
    for row in 0..result.table.num_rows() {
        let fields: Vec<serde_json::Value> = (0..out.columns.len())
            .map(|c| match out.term_at(row, c) {
                Some(term) => json!(term.to_string()),
                None => serde_json::Value::Null,
            })
            .collect();
        rows.push(serde_json::Value::Array(fields));
    }
    let mut body = json!({
        "status": "OK",
        "selected": vars,
        "resultsize": result.table.num_rows(),
        "res": rows,
        "runtimeInformation": runtime_information(&plan.arena, plan.root),
    });
    if with_time {
        if let Some(elapsed) = elapsed {
            body["time"] = json!({
                "total": format!("{}ms", elapsed.as_millis()),
            });
        }
    }
    serde_json::to_vec_pretty(&body).map_err(|e| QueryError::Export(e.to_string()))
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn export_sparql_xml(
    index: &Index,
    plan: &ExecutionPlan,
    result: &MaterializedResult,
) -> EngineResult<Vec<u8>> {
    if plan.construct.is_some() {
        return Err(QueryError::Export(
            "application/sparql-results+xml cannot serialize CONSTRUCT results".into(),
        ));
    }
    let mut buffer = String::from(
        "<?xml version=\"1.0\"?>\n<sparql xmlns=\"http://www.w3.org/2005/sparql-results#\">\n",
    );
    if plan.is_ask {
        buffer.push_str("  <head/>\n");
        buffer.push_str(&format!(
            "  <boolean>{}</boolean>\n",
            !result.table.is_empty()
        ));
        buffer.push_str("</sparql>\n");
        return Ok(buffer.into_bytes());
    }
    let out = output(index, plan, result)?;
    buffer.push_str("  <head>\n");
    for (variable, _) in &out.columns {
        buffer.push_str(&format!(
            "    <variable name=\"{}\"/>\n",
            xml_escape(variable.name())
        ));
    }
    buffer.push_str("  </head>\n  <results>\n");
    for row in 0..result.table.num_rows() {
        buffer.push_str("    <result>\n");
        for (c, (variable, _)) in out.columns.iter().enumerate() {
            let Some(term) = out.term_at(row, c) else {
                continue;
            };
            let name = xml_escape(variable.name());
            let element = match term {
                Term::Iri(iri) => format!("<uri>{}</uri>", xml_escape(&iri)),
                Term::Literal {
                    lexical,
                    language: Some(lang),
                    ..
                } => format!(
                    "<literal xml:lang=\"{}\">{}</literal>",
                    xml_escape(&lang),
                    xml_escape(&lexical)
                ),
                Term::Literal {
                    lexical,
                    datatype: Some(datatype),
                    ..
                } => format!(
                    "<literal datatype=\"{}\">{}</literal>",
                    xml_escape(&datatype),
                    xml_escape(&lexical)
                ),
                Term::Literal { lexical, .. } => {
                    format!("<literal>{}</literal>", xml_escape(&lexical))
                }
                Term::BlankNode(label) => format!("<bnode>{}</bnode>", xml_escape(&label)),
            };
            buffer.push_str(&format!(
                "      <binding name=\"{name}\">{element}</binding>\n"
            ));
        }
        buffer.push_str("    </result>\n");
    }
    buffer.push_str("  </results>\n</sparql>\n");
    Ok(buffer.into_bytes())
}

// ---------------------------------------------------------------------------
// Binary
// ---------------------------------------------------------------------------

fn export_binary(plan: &ExecutionPlan, result: &MaterializedResult) -> EngineResult<Vec<u8>> {
    if plan.construct.is_some() || plan.is_ask {
        return Err(QueryError::Export(
            "application/octet-stream is only available for SELECT queries".into(),
        ));
    }
    let var_map = &plan.arena.node(plan.root).var_map;
    let columns: Vec<usize> = plan
        .selected
        .iter()
        .filter_map(|variable| var_map.column_of(variable))
        .collect();
    let mut buffer = Vec::with_capacity(result.table.num_rows() * columns.len() * 8);
    for row in 0..result.table.num_rows() {
        for &column in &columns {
            buffer.extend_from_slice(&result.table.at(row, column).to_bits().to_le_bytes());
        }
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_roundtrip() {
        for format in [
            ExportFormat::Tsv,
            ExportFormat::Csv,
            ExportFormat::Turtle,
            ExportFormat::SparqlJson,
            ExportFormat::EngineJson,
            ExportFormat::SparqlXml,
            ExportFormat::Binary,
        ] {
            assert_eq!(ExportFormat::from_media_type(format.media_type()), Some(format));
        }
        assert_eq!(
            ExportFormat::from_media_type("text/csv; charset=utf-8"),
            Some(ExportFormat::Csv)
        );
        assert_eq!(ExportFormat::from_media_type("text/html"), None);
    }

    #[test]
    fn csv_quoting_follows_rfc_4180() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("with,comma"), "\"with,comma\"");
        assert_eq!(csv_quote("with\"quote"), "\"with\"\"quote\"");
    }

    #[test]
    fn xml_escaping() {
        assert_eq!(xml_escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
