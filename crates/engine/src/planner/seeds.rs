//! Seed-plan generation: triple-graph nodes become candidate index scans,
//! text scans, transitive paths and has-predicate scans.

use rdf_model::{Id, Term};

use crate::arena::PlanArena;
use crate::error::{EngineResult, QueryError};
use crate::operator::{
    Endpoint, EntityScanOp, FilterOp, HasPredicateScanOp, IndexScanOp, JoinOp, Operator,
    TransitivePathOp, ValuesOp, WordScanOp,
};
use crate::parsed_query::{PredicatePattern, PropertyPath, TriplePattern, VarOrTerm};
use crate::variable::Variable;

use super::candidates::{PlanType, SubtreePlan};

/// Magic predicate answering "which predicates does this subject have".
pub const QL_HAS_PREDICATE: &str = "ql:has-predicate";
/// Magic predicate connecting a text record to a word occurrence.
pub const QL_CONTAINS_WORD: &str = "ql:contains-word";
/// Magic predicate connecting a text record to a mentioned entity.
pub const QL_CONTAINS_ENTITY: &str = "ql:contains-entity";

/// A `*`/`+`/`?` path pattern after property-path rewriting.
#[derive(Debug, Clone)]
pub struct TransitiveTriple {
    pub subject: VarOrTerm,
    pub predicate: Term,
    pub object: VarOrTerm,
    pub min: u64,
    pub max: u64,
}

/// One triple-graph node awaiting seed plans.
#[derive(Debug)]
pub enum NodeKind {
    Triple(TriplePattern),
    Transitive(TransitiveTriple),
    Word {
        record: Variable,
        words: String,
    },
    Entity {
        record: Variable,
        entity: VarOrTerm,
        score: Variable,
    },
    HasPredicate {
        subject: VarOrTerm,
        object: VarOrTerm,
    },
    /// An already-planned child graph pattern.
    Child {
        candidates: Vec<SubtreePlan>,
        plan_type: PlanType,
    },
}

#[derive(Debug)]
pub struct PlannerNode {
    pub kind: NodeKind,
    pub vars: Vec<Variable>,
}

/// Rewrite property paths into plain triples, transitive triples and UNION
/// subpatterns with fresh intermediate variables.
pub fn rewrite_property_paths(
    triples: Vec<TriplePattern>,
    fresh_counter: &mut usize,
) -> EngineResult<(
    Vec<TriplePattern>,
    Vec<TransitiveTriple>,
    Vec<crate::parsed_query::GraphPattern>,
)> {
    let mut plain = Vec::new();
    let mut transitive = Vec::new();
    let mut unions = Vec::new();
    for triple in triples {
        rewrite_one(triple, fresh_counter, &mut plain, &mut transitive, &mut unions)?;
    }
    Ok((plain, transitive, unions))
}

fn fresh_var(counter: &mut usize) -> Variable {
    let variable = Variable::new(format!("_path_{counter}"));
    *counter += 1;
    variable
}

fn rewrite_one(
    triple: TriplePattern,
    counter: &mut usize,
    plain: &mut Vec<TriplePattern>,
    transitive: &mut Vec<TransitiveTriple>,
    unions: &mut Vec<crate::parsed_query::GraphPattern>,
) -> EngineResult<()> {
    let TriplePattern {
        subject,
        predicate,
        object,
    } = triple;
    let path = match predicate {
        PredicatePattern::Var(_) | PredicatePattern::Term(_) => {
            plain.push(TriplePattern {
                subject,
                predicate,
                object,
            });
            return Ok(());
        }
        PredicatePattern::Path(path) => path,
    };
    rewrite_path(subject, path, object, counter, plain, transitive, unions)
}

fn rewrite_path(
    subject: VarOrTerm,
    path: PropertyPath,
    object: VarOrTerm,
    counter: &mut usize,
    plain: &mut Vec<TriplePattern>,
    transitive: &mut Vec<TransitiveTriple>,
    unions: &mut Vec<crate::parsed_query::GraphPattern>,
) -> EngineResult<()> {
    match path {
        PropertyPath::Iri(term) => {
            plain.push(TriplePattern {
                subject,
                predicate: PredicatePattern::Term(term),
                object,
            });
            Ok(())
        }
        PropertyPath::Inverse(inner) => {
            rewrite_path(object, *inner, subject, counter, plain, transitive, unions)
        }
        PropertyPath::Sequence(parts) => {
            // `a/b/c` chains through fresh intermediate variables.
            let mut current = subject;
            let count = parts.len();
            for (i, part) in parts.into_iter().enumerate() {
                let next = if i + 1 == count {
                    object.clone()
                } else {
                    VarOrTerm::Var(fresh_var(counter))
                };
                rewrite_path(
                    current,
                    part,
                    next.clone(),
                    counter,
                    plain,
                    transitive,
                    unions,
                )?;
                current = next;
            }
            Ok(())
        }
        PropertyPath::Alternative(parts) => {
            // `a|b` becomes a UNION subpattern.
            let branches: Vec<crate::parsed_query::GraphPattern> = parts
                .into_iter()
                .map(|part| {
                    crate::parsed_query::GraphPattern::Basic {
                        triples: vec![TriplePattern {
                            subject: subject.clone(),
                            predicate: PredicatePattern::Path(part),
                            object: object.clone(),
                        }],
                    }
                })
                .collect();
            let union = branches
                .into_iter()
                .reduce(|a, b| {
                    crate::parsed_query::GraphPattern::Union(Box::new(a), Box::new(b))
                })
                .ok_or_else(|| {
                    QueryError::ContractViolation("empty path alternative".into())
                })?;
            unions.push(union);
            Ok(())
        }
        PropertyPath::ZeroOrMore(inner) => {
            push_transitive(subject, *inner, object, 0, u64::MAX, transitive)
        }
        PropertyPath::OneOrMore(inner) => {
            push_transitive(subject, *inner, object, 1, u64::MAX, transitive)
        }
        PropertyPath::ZeroOrOne(inner) => {
            push_transitive(subject, *inner, object, 0, 1, transitive)
        }
    }
}

fn push_transitive(
    subject: VarOrTerm,
    inner: PropertyPath,
    object: VarOrTerm,
    min: u64,
    max: u64,
    transitive: &mut Vec<TransitiveTriple>,
) -> EngineResult<()> {
    match inner {
        PropertyPath::Iri(predicate) => {
            transitive.push(TransitiveTriple {
                subject,
                predicate,
                object,
                min,
                max,
            });
            Ok(())
        }
        PropertyPath::Inverse(inner) => {
            push_transitive(object, *inner, subject, min, max, transitive)
        }
        other => Err(QueryError::UnsupportedFeature(format!(
            "Transitive closure over complex paths is not supported: {other:?}"
        ))),
    }
}

/// Variables of one node, in a fixed position order.
pub fn node_variables(arena: &PlanArena, kind: &NodeKind) -> Vec<Variable> {
    let mut vars = Vec::new();
    let mut push = |v: &Variable| {
        if !vars.contains(v) {
            vars.push(v.clone());
        }
    };
    match kind {
        NodeKind::Triple(triple) => {
            if let VarOrTerm::Var(v) = &triple.subject {
                push(v);
            }
            if let PredicatePattern::Var(v) = &triple.predicate {
                push(v);
            }
            if let VarOrTerm::Var(v) = &triple.object {
                push(v);
            }
        }
        NodeKind::Transitive(path) => {
            if let VarOrTerm::Var(v) = &path.subject {
                push(v);
            }
            if let VarOrTerm::Var(v) = &path.object {
                push(v);
            }
        }
        NodeKind::Word { record, .. } => push(record),
        NodeKind::Entity {
            record,
            entity,
            score,
        } => {
            push(record);
            if let VarOrTerm::Var(v) = entity {
                push(v);
            }
            push(score);
        }
        NodeKind::HasPredicate { subject, object } => {
            if let VarOrTerm::Var(v) = subject {
                push(v);
            }
            if let VarOrTerm::Var(v) = object {
                push(v);
            }
        }
        NodeKind::Child { candidates, .. } => {
            if let Some(first) = candidates.first() {
                for variable in arena.node(first.handle).var_map.variables() {
                    push(variable);
                }
            }
        }
    }
    vars
}

/// Produce every seed plan of one node.
pub fn seeds_for_node(
    arena: &mut PlanArena,
    node_index: usize,
    kind: &NodeKind,
) -> EngineResult<Vec<SubtreePlan>> {
    match kind {
        NodeKind::Triple(triple) => triple_seeds(arena, node_index, triple),
        NodeKind::Transitive(path) => transitive_seed(arena, node_index, path),
        NodeKind::Word { record, words } => word_seed(arena, node_index, record, words),
        NodeKind::Entity {
            record,
            entity,
            score,
        } => entity_seed(arena, node_index, record, entity, score),
        NodeKind::HasPredicate { subject, object } => {
            has_predicate_seed(arena, node_index, subject, object)
        }
        NodeKind::Child {
            candidates,
            plan_type,
        } => Ok(candidates
            .iter()
            .map(|plan| {
                // Filter and text-limit masks are namespaced per group; the
                // child's own filters are already applied inside its plan.
                SubtreePlan {
                    handle: plan.handle,
                    nodes: 1u64 << node_index,
                    filters: 0,
                    text_limits: 0,
                    plan_type: *plan_type,
                }
            })
            .collect()),
    }
}

fn resolve(arena: &PlanArena, term: &Term) -> (Option<Id>, bool) {
    match arena.index().get_id(term) {
        Some(id) => (Some(id), false),
        None => (None, true),
    }
}

fn triple_seeds(
    arena: &mut PlanArena,
    node_index: usize,
    triple: &TriplePattern,
) -> EngineResult<Vec<SubtreePlan>> {
    let mut fixed: [Option<Id>; 3] = [None, None, None];
    let mut variables: [Option<Variable>; 3] = [None, None, None];
    let mut term_unknown = false;

    let mut assign = |pos: usize,
                      var: Option<&Variable>,
                      term: Option<&Term>,
                      fixed: &mut [Option<Id>; 3],
                      variables: &mut [Option<Variable>; 3],
                      term_unknown: &mut bool,
                      arena: &PlanArena| {
        match (var, term) {
            (Some(v), _) => variables[pos] = Some(v.clone()),
            (_, Some(t)) => {
                let (id, unknown) = resolve(arena, t);
                fixed[pos] = Some(id.unwrap_or(Id::UNDEFINED));
                *term_unknown |= unknown;
            }
            _ => {}
        }
    };
    match &triple.subject {
        VarOrTerm::Var(v) => assign(0, Some(v), None, &mut fixed, &mut variables, &mut term_unknown, arena),
        VarOrTerm::Term(t) => assign(0, None, Some(t), &mut fixed, &mut variables, &mut term_unknown, arena),
    }
    match &triple.predicate {
        PredicatePattern::Var(v) => {
            assign(1, Some(v), None, &mut fixed, &mut variables, &mut term_unknown, arena)
        }
        PredicatePattern::Term(t) => {
            assign(1, None, Some(t), &mut fixed, &mut variables, &mut term_unknown, arena)
        }
        PredicatePattern::Path(_) => {
            return Err(QueryError::ContractViolation(
                "property path survived rewriting".into(),
            ))
        }
    }
    match &triple.object {
        VarOrTerm::Var(v) => assign(2, Some(v), None, &mut fixed, &mut variables, &mut term_unknown, arena),
        VarOrTerm::Term(t) => assign(2, None, Some(t), &mut fixed, &mut variables, &mut term_unknown, arena),
    }

    let bound: Vec<usize> = (0..3).filter(|&p| fixed[p].is_some()).collect();
    let mut seeds = Vec::new();
    for permutation in index::Permutation::all() {
        if !arena.index().permutation_enabled(permutation) {
            continue;
        }
        let order = permutation.key_order();
        // The bound positions must occupy a prefix of the key order.
        let prefix_ok = bound.len() <= 3
            && order[..bound.len()]
                .iter()
                .all(|pos| bound.contains(pos));
        if !prefix_ok {
            continue;
        }
        let scan = IndexScanOp {
            permutation,
            fixed,
            variables: variables.clone(),
            term_unknown,
        };
        let handle = arena.push(Operator::IndexScan(scan), &[])?;
        seeds.push(SubtreePlan::seed(handle, node_index));
        if bound.len() == 3 {
            // All permutations are equivalent for a fully bound triple.
            break;
        }
    }
    if seeds.is_empty() {
        return Err(QueryError::UnsupportedFeature(format!(
            "No enabled permutation supports the triple pattern {:?} \
             (a reduced index only answers patterns with a fixed predicate)",
            triple
        )));
    }
    Ok(seeds)
}

fn transitive_seed(
    arena: &mut PlanArena,
    node_index: usize,
    path: &TransitiveTriple,
) -> EngineResult<Vec<SubtreePlan>> {
    let endpoint = |arena: &PlanArena, position: &VarOrTerm| -> (Endpoint, bool) {
        match position {
            VarOrTerm::Var(v) => (Endpoint::Var(v.clone()), false),
            VarOrTerm::Term(t) => match arena.index().get_id(t) {
                Some(id) => (Endpoint::Fixed(id), false),
                None => (Endpoint::Fixed(Id::UNDEFINED), true),
            },
        }
    };
    let (predicate_id, predicate_unknown) = resolve(arena, &path.predicate);
    let (left, left_unknown) = endpoint(arena, &path.subject);
    let (right, right_unknown) = endpoint(arena, &path.object);
    if predicate_unknown || left_unknown || right_unknown {
        // An unresolvable term makes the closure empty; seed an empty
        // VALUES placeholder with the path's variables.
        let variables: Vec<Variable> = [&path.subject, &path.object]
            .iter()
            .filter_map(|p| match p {
                VarOrTerm::Var(v) => Some(v.clone()),
                VarOrTerm::Term(_) => None,
            })
            .collect();
        let handle = arena.push(
            Operator::Values(ValuesOp {
                variables,
                rows: Vec::new(),
            }),
            &[],
        )?;
        return Ok(vec![SubtreePlan::seed(handle, node_index)]);
    }

    // The edge relation: all (subject, object) pairs of the predicate.
    let edges = arena.push(
        Operator::IndexScan(IndexScanOp {
            permutation: index::Permutation::Pso,
            fixed: [None, predicate_id, None],
            variables: [
                Some(Variable::new(format!("_tp_start_{node_index}"))),
                None,
                Some(Variable::new(format!("_tp_end_{node_index}"))),
            ],
            term_unknown: false,
        }),
        &[],
    )?;
    let handle = arena.push(
        Operator::TransitivePath(TransitivePathOp {
            min: path.min,
            max: path.max,
            left,
            right,
            bound: None,
            bound_join_col: 0,
        }),
        &[edges],
    )?;
    Ok(vec![SubtreePlan::seed(handle, node_index)])
}

fn word_seed(
    arena: &mut PlanArena,
    node_index: usize,
    record: &Variable,
    words: &str,
) -> EngineResult<Vec<SubtreePlan>> {
    let mut current: Option<crate::arena::OpHandle> = None;
    for word in words.split_whitespace() {
        let match_var = word.strip_suffix('*').map(|prefix| {
            Variable::new(format!("ql_matchingword_{}_{}", record.name(), prefix))
        });
        let scan = arena.push(
            Operator::WordScan(WordScanOp {
                word: word.to_string(),
                record_var: record.clone(),
                match_var,
            }),
            &[],
        )?;
        current = Some(match current {
            None => scan,
            // Multiple words of one text clause join on the record column.
            Some(previous) => arena.push(
                Operator::Join(JoinOp { join_cols: [0, 0] }),
                &[previous, scan],
            )?,
        });
    }
    let handle = current.ok_or_else(|| {
        QueryError::UnsupportedFeature("empty word list in text clause".into())
    })?;
    Ok(vec![SubtreePlan::seed(handle, node_index)])
}

fn entity_seed(
    arena: &mut PlanArena,
    node_index: usize,
    record: &Variable,
    entity: &VarOrTerm,
    score: &Variable,
) -> EngineResult<Vec<SubtreePlan>> {
    let entity = match entity {
        VarOrTerm::Var(v) => Endpoint::Var(v.clone()),
        VarOrTerm::Term(t) => Endpoint::Fixed(
            arena
                .index()
                .get_id(t)
                .unwrap_or(Id::UNDEFINED),
        ),
    };
    let handle = arena.push(
        Operator::EntityScan(EntityScanOp {
            record_var: record.clone(),
            entity,
            score_var: score.clone(),
        }),
        &[],
    )?;
    Ok(vec![SubtreePlan::seed(handle, node_index)])
}

fn has_predicate_seed(
    arena: &mut PlanArena,
    node_index: usize,
    subject: &VarOrTerm,
    object: &VarOrTerm,
) -> EngineResult<Vec<SubtreePlan>> {
    let handle = match (subject, object) {
        (VarOrTerm::Var(s), VarOrTerm::Var(o)) => arena.push(
            Operator::HasPredicateScan(HasPredicateScanOp {
                subject: None,
                subject_var: Some(s.clone()),
                child_subject_col: None,
                predicate_var: o.clone(),
            }),
            &[],
        )?,
        (VarOrTerm::Term(s), VarOrTerm::Var(o)) => {
            let subject_id = arena.index().get_id(s).unwrap_or(Id::UNDEFINED);
            arena.push(
                Operator::HasPredicateScan(HasPredicateScanOp {
                    subject: Some(subject_id),
                    subject_var: None,
                    child_subject_col: None,
                    predicate_var: o.clone(),
                }),
                &[],
            )?
        }
        (subject, VarOrTerm::Term(predicate)) => {
            // Fixed predicate: scan all subjects and filter on the hidden
            // predicate column.
            let hidden = Variable::new(format!("_haspred_{node_index}"));
            let (subject_var, subject_id) = match subject {
                VarOrTerm::Var(v) => (Some(v.clone()), None),
                VarOrTerm::Term(t) => {
                    (None, Some(arena.index().get_id(t).unwrap_or(Id::UNDEFINED)))
                }
            };
            let scan = arena.push(
                Operator::HasPredicateScan(HasPredicateScanOp {
                    subject: subject_id,
                    subject_var,
                    child_subject_col: None,
                    predicate_var: hidden.clone(),
                }),
                &[],
            )?;
            arena.push(
                Operator::Filter(FilterOp {
                    expression: crate::expression::Expression::eq(
                        crate::expression::Expression::Var(hidden),
                        crate::expression::Expression::Constant(predicate.clone()),
                    ),
                }),
                &[scan],
            )?
        }
    };
    Ok(vec![SubtreePlan::seed(handle, node_index)])
}
