//! The already-parsed query shape consumed by the planner.
//!
//! The SPARQL parser is an external collaborator; tests and frontends build
//! these structures directly. The shapes mirror the SPARQL algebra closely:
//! a tree of graph patterns plus the top-level solution modifiers.

use rdf_model::Term;

use crate::expression::Expression;
use crate::variable::Variable;

/// A triple-pattern position: either a variable or a fixed term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarOrTerm {
    Var(Variable),
    Term(Term),
}

impl VarOrTerm {
    pub fn var(name: &str) -> VarOrTerm {
        VarOrTerm::Var(Variable::new(name))
    }

    pub fn iri(iri: &str) -> VarOrTerm {
        VarOrTerm::Term(Term::iri(iri))
    }

    pub fn as_var(&self) -> Option<&Variable> {
        match self {
            VarOrTerm::Var(v) => Some(v),
            VarOrTerm::Term(_) => None,
        }
    }
}

/// A SPARQL 1.1 property path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyPath {
    Iri(Term),
    Inverse(Box<PropertyPath>),
    Sequence(Vec<PropertyPath>),
    Alternative(Vec<PropertyPath>),
    ZeroOrMore(Box<PropertyPath>),
    OneOrMore(Box<PropertyPath>),
    ZeroOrOne(Box<PropertyPath>),
}

/// The predicate position of a triple pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredicatePattern {
    Var(Variable),
    Term(Term),
    Path(PropertyPath),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriplePattern {
    pub subject: VarOrTerm,
    pub predicate: PredicatePattern,
    pub object: VarOrTerm,
}

impl TriplePattern {
    pub fn new(subject: VarOrTerm, predicate: PredicatePattern, object: VarOrTerm) -> Self {
        TriplePattern {
            subject,
            predicate,
            object,
        }
    }

    /// Convenience constructor from lexical forms; `?name` makes a variable.
    pub fn parse(subject: &str, predicate: &str, object: &str) -> TriplePattern {
        let pos = |s: &str| {
            if let Some(name) = s.strip_prefix('?') {
                VarOrTerm::Var(Variable::new(name))
            } else {
                VarOrTerm::Term(Term::parse(s).expect("valid term in test pattern"))
            }
        };
        let predicate = if let Some(name) = predicate.strip_prefix('?') {
            PredicatePattern::Var(Variable::new(name))
        } else {
            PredicatePattern::Term(Term::parse(predicate).expect("valid term in test pattern"))
        };
        TriplePattern {
            subject: pos(subject),
            predicate,
            object: pos(object),
        }
    }
}

/// One element of a group graph pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphPattern {
    /// A basic graph pattern: a conjunction of triple patterns.
    Basic { triples: Vec<TriplePattern> },
    /// Juxtaposition of child patterns (the `{ A . B }` group).
    Group(Vec<GraphPattern>),
    Optional(Box<GraphPattern>),
    Union(Box<GraphPattern>, Box<GraphPattern>),
    Minus(Box<GraphPattern>),
    Filter(Expression),
    Values {
        variables: Vec<Variable>,
        rows: Vec<Vec<Option<Term>>>,
    },
    Bind {
        expression: Expression,
        variable: Variable,
    },
    Subquery(Box<ParsedQuery>),
    Service {
        silent: bool,
        endpoint: Term,
        pattern: Box<GraphPattern>,
    },
}

impl GraphPattern {
    pub fn basic(triples: Vec<TriplePattern>) -> GraphPattern {
        GraphPattern::Basic { triples }
    }
}

/// SELECT / CONSTRUCT / ASK head.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    Select {
        /// Empty means `SELECT *`.
        variables: Vec<Variable>,
        /// `(expression AS ?alias)` entries, evaluated after grouping.
        aliases: Vec<(Expression, Variable)>,
    },
    Construct(Vec<TriplePattern>),
    Ask,
}

/// FROM / FROM NAMED clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetClause {
    pub named: bool,
    pub graph: Term,
}

/// One ORDER BY key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub variable: Variable,
    pub descending: bool,
}

/// The TEXTLIMIT directive: keep the best `n` text records per entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextLimitClause {
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub root: GraphPattern,
    pub kind: QueryKind,
    pub group_by: Vec<Variable>,
    pub having: Vec<Expression>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<u64>,
    pub offset: u64,
    pub distinct: bool,
    pub text_limit: Option<TextLimitClause>,
    pub datasets: Vec<DatasetClause>,
}

impl ParsedQuery {
    /// A plain `SELECT * WHERE { ... }` skeleton.
    pub fn select(root: GraphPattern) -> ParsedQuery {
        ParsedQuery {
            root,
            kind: QueryKind::Select {
                variables: Vec::new(),
                aliases: Vec::new(),
            },
            group_by: Vec::new(),
            having: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            distinct: false,
            text_limit: None,
            datasets: Vec::new(),
        }
    }

    pub fn with_variables(mut self, names: &[&str]) -> ParsedQuery {
        if let QueryKind::Select { variables, .. } = &mut self.kind {
            *variables = names.iter().map(|n| Variable::new(*n)).collect();
        }
        self
    }

    pub fn with_limit(mut self, limit: u64) -> ParsedQuery {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> ParsedQuery {
        self.offset = offset;
        self
    }

    pub fn with_order_by(mut self, variable: &str, descending: bool) -> ParsedQuery {
        self.order_by.push(OrderKey {
            variable: Variable::new(variable),
            descending,
        });
        self
    }

    pub fn with_distinct(mut self) -> ParsedQuery {
        self.distinct = true;
        self
    }

    pub fn with_group_by(mut self, names: &[&str]) -> ParsedQuery {
        self.group_by = names.iter().map(|n| Variable::new(*n)).collect();
        self
    }
}
