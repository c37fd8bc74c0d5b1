//! SPARQL expressions with three-valued evaluation.
//!
//! Every boolean result is a [`TriBool`]: `Undef` arises from unbound
//! variables, incomparable values and evaluation errors. A filter keeps a
//! row only on `True`; `False` and `Undef` both drop it. Only a MINUS match
//! that holds solely because both sides are `Undef` is treated specially
//! (by the minus operator, not here).

use std::cmp::Ordering;
use std::fmt;

use rdf_model::{Id, LocalVocab, Tag, Term};

use crate::idtable::IdTable;
use crate::variable::{Variable, VariableMap};

/// Three-valued boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriBool {
    True,
    False,
    Undef,
}

impl TriBool {
    pub fn from_bool(value: bool) -> TriBool {
        if value {
            TriBool::True
        } else {
            TriBool::False
        }
    }

    pub fn is_true(self) -> bool {
        self == TriBool::True
    }

    pub fn and(self, other: TriBool) -> TriBool {
        match (self, other) {
            (TriBool::False, _) | (_, TriBool::False) => TriBool::False,
            (TriBool::True, TriBool::True) => TriBool::True,
            _ => TriBool::Undef,
        }
    }

    pub fn or(self, other: TriBool) -> TriBool {
        match (self, other) {
            (TriBool::True, _) | (_, TriBool::True) => TriBool::True,
            (TriBool::False, TriBool::False) => TriBool::False,
            _ => TriBool::Undef,
        }
    }

    pub fn not(self) -> TriBool {
        match self {
            TriBool::True => TriBool::False,
            TriBool::False => TriBool::True,
            TriBool::Undef => TriBool::Undef,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelOp {
    pub fn matches(self, ordering: Ordering) -> bool {
        match self {
            RelOp::Eq => ordering == Ordering::Equal,
            RelOp::Ne => ordering != Ordering::Equal,
            RelOp::Lt => ordering == Ordering::Less,
            RelOp::Le => ordering != Ordering::Greater,
            RelOp::Gt => ordering == Ordering::Greater,
            RelOp::Ge => ordering != Ordering::Less,
        }
    }

    /// The operator with its sides swapped (`a < b` == `b > a`).
    pub fn flipped(self) -> RelOp {
        match self {
            RelOp::Lt => RelOp::Gt,
            RelOp::Le => RelOp::Ge,
            RelOp::Gt => RelOp::Lt,
            RelOp::Ge => RelOp::Le,
            same => same,
        }
    }
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelOp::Eq => "=",
            RelOp::Ne => "!=",
            RelOp::Lt => "<",
            RelOp::Le => "<=",
            RelOp::Gt => ">",
            RelOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Sample,
    GroupConcat,
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateOp::Count => "COUNT",
            AggregateOp::Sum => "SUM",
            AggregateOp::Avg => "AVG",
            AggregateOp::Min => "MIN",
            AggregateOp::Max => "MAX",
            AggregateOp::Sample => "SAMPLE",
            AggregateOp::GroupConcat => "GROUP_CONCAT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Var(Variable),
    Constant(Term),
    Bool(bool),
    Int(i64),
    Double(f64),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Relational {
        op: RelOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    In {
        left: Box<Expression>,
        values: Vec<Expression>,
    },
    Arithmetic {
        op: ArithOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Neg(Box<Expression>),
    Bound(Variable),
    Lang(Box<Expression>),
    Str(Box<Expression>),
    Aggregate {
        op: AggregateOp,
        distinct: bool,
        /// `None` is `COUNT(*)`.
        expr: Option<Box<Expression>>,
        /// GROUP_CONCAT separator, default `" "`.
        separator: Option<String>,
    },
}

impl Expression {
    pub fn var(name: &str) -> Expression {
        Expression::Var(Variable::new(name))
    }

    pub fn relational(op: RelOp, left: Expression, right: Expression) -> Expression {
        Expression::Relational {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expression, right: Expression) -> Expression {
        Expression::relational(RelOp::Eq, left, right)
    }

    pub fn count_star() -> Expression {
        Expression::Aggregate {
            op: AggregateOp::Count,
            distinct: false,
            expr: None,
            separator: None,
        }
    }

    pub fn aggregate(op: AggregateOp, inner: Expression) -> Expression {
        Expression::Aggregate {
            op,
            distinct: false,
            expr: Some(Box::new(inner)),
            separator: None,
        }
    }

    /// All variables referenced anywhere in the expression.
    pub fn variables(&self) -> Vec<&Variable> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a Variable>) {
        match self {
            Expression::Var(v) | Expression::Bound(v) => {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
            Expression::Constant(_)
            | Expression::Bool(_)
            | Expression::Int(_)
            | Expression::Double(_) => {}
            Expression::And(a, b)
            | Expression::Or(a, b)
            | Expression::Relational { left: a, right: b, .. }
            | Expression::Arithmetic { left: a, right: b, .. } => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
            Expression::Not(e) | Expression::Neg(e) | Expression::Lang(e) | Expression::Str(e) => {
                e.collect_variables(out)
            }
            Expression::In { left, values } => {
                left.collect_variables(out);
                for value in values {
                    value.collect_variables(out);
                }
            }
            Expression::Aggregate { expr, .. } => {
                if let Some(expr) = expr {
                    expr.collect_variables(out);
                }
            }
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expression::Aggregate { .. } => true,
            Expression::Var(_)
            | Expression::Bound(_)
            | Expression::Constant(_)
            | Expression::Bool(_)
            | Expression::Int(_)
            | Expression::Double(_) => false,
            Expression::And(a, b)
            | Expression::Or(a, b)
            | Expression::Relational { left: a, right: b, .. }
            | Expression::Arithmetic { left: a, right: b, .. } => {
                a.contains_aggregate() || b.contains_aggregate()
            }
            Expression::Not(e) | Expression::Neg(e) | Expression::Lang(e) | Expression::Str(e) => {
                e.contains_aggregate()
            }
            Expression::In { left, values } => {
                left.contains_aggregate() || values.iter().any(Expression::contains_aggregate)
            }
        }
    }

    /// Recognize `LANG(?x) = "tag"` (either operand order).
    pub fn as_lang_filter(&self) -> Option<(&Variable, &str)> {
        let Expression::Relational {
            op: RelOp::Eq,
            left,
            right,
        } = self
        else {
            return None;
        };
        fn lang_of(e: &Expression) -> Option<&Variable> {
            match e {
                Expression::Lang(inner) => match &**inner {
                    Expression::Var(v) => Some(v),
                    _ => None,
                },
                _ => None,
            }
        }
        fn tag_of(e: &Expression) -> Option<&str> {
            match e {
                Expression::Constant(Term::Literal {
                    lexical,
                    language: None,
                    datatype: None,
                }) => Some(lexical.as_str()),
                _ => None,
            }
        }
        if let (Some(var), Some(tag)) = (lang_of(left), tag_of(right)) {
            return Some((var, tag));
        }
        if let (Some(var), Some(tag)) = (lang_of(right), tag_of(left)) {
            return Some((var, tag));
        }
        None
    }

    /// Recognize `?x <op> constant` (or flipped), the shape eligible for the
    /// binary-search evaluation over a sorted column.
    pub fn as_prefix_range_filter(&self) -> Option<(&Variable, RelOp, &Expression)> {
        let Expression::Relational { op, left, right } = self else {
            return None;
        };
        let is_const = |e: &Expression| {
            matches!(
                e,
                Expression::Constant(_)
                    | Expression::Bool(_)
                    | Expression::Int(_)
                    | Expression::Double(_)
            )
        };
        match (&**left, &**right) {
            (Expression::Var(v), rhs) if is_const(rhs) => Some((v, *op, rhs)),
            (lhs, Expression::Var(v)) if is_const(lhs) => Some((v, op.flipped(), lhs)),
            _ => None,
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Var(v) => write!(f, "{v}"),
            Expression::Constant(t) => write!(f, "{t}"),
            Expression::Bool(b) => write!(f, "{b}"),
            Expression::Int(i) => write!(f, "{i}"),
            Expression::Double(d) => write!(f, "{d}"),
            Expression::And(a, b) => write!(f, "({a} && {b})"),
            Expression::Or(a, b) => write!(f, "({a} || {b})"),
            Expression::Not(e) => write!(f, "!({e})"),
            Expression::Relational { op, left, right } => write!(f, "({left} {op} {right})"),
            Expression::In { left, values } => {
                write!(f, "({left} IN (")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "))")
            }
            Expression::Arithmetic { op, left, right } => write!(f, "({left} {op} {right})"),
            Expression::Neg(e) => write!(f, "-({e})"),
            Expression::Bound(v) => write!(f, "BOUND({v})"),
            Expression::Lang(e) => write!(f, "LANG({e})"),
            Expression::Str(e) => write!(f, "STR({e})"),
            Expression::Aggregate {
                op,
                distinct,
                expr,
                separator,
            } => {
                write!(f, "{op}(")?;
                if *distinct {
                    write!(f, "DISTINCT ")?;
                }
                match expr {
                    Some(expr) => write!(f, "{expr}")?,
                    None => write!(f, "*")?,
                }
                if let Some(sep) = separator {
                    write!(f, "; SEPARATOR={sep:?}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Everything an expression needs to look at one row.
pub struct EvalContext<'a> {
    pub table: &'a IdTable,
    pub var_map: &'a VariableMap,
    pub index: &'a index::Index,
    pub vocab: &'a LocalVocab,
}

impl EvalContext<'_> {
    fn id_of(&self, variable: &Variable, row: usize) -> Id {
        match self.var_map.column_of(variable) {
            Some(column) => self.table.at(row, column),
            None => Id::UNDEFINED,
        }
    }

    /// Resolve a stringy id to its term.
    pub fn term_of(&self, id: Id) -> Option<Term> {
        match id.tag() {
            Tag::LocalVocabIndex => Term::parse(self.vocab.word_for_id(id)?).ok(),
            _ => self.index.id_to_term(id),
        }
    }

    /// Semantic comparison that also resolves vocabulary strings: two ids of
    /// string-bearing tags compare by their lexical form.
    pub fn compare(&self, a: Id, b: Id) -> Option<Ordering> {
        let stringy = |id: Id| matches!(id.tag(), Tag::VocabIndex | Tag::LocalVocabIndex);
        if stringy(a) && stringy(b) && a.tag() != b.tag() {
            let ta = self.term_of(a)?;
            let tb = self.term_of(b)?;
            return Some(ta.to_string().cmp(&tb.to_string()));
        }
        a.compare_values(b)
    }
}

impl Expression {
    /// Evaluate to an [`Id`]; unbound variables, type errors and
    /// incomparabilities all yield `Undefined`. String-producing builtins
    /// intern into `out_vocab`.
    pub fn evaluate(&self, ctx: &EvalContext<'_>, row: usize, out_vocab: &mut LocalVocab) -> Id {
        match self {
            Expression::Var(v) => ctx.id_of(v, row),
            Expression::Bool(b) => Id::bool(*b),
            Expression::Int(i) => Id::int(*i).unwrap_or(Id::UNDEFINED),
            Expression::Double(d) => Id::double(*d),
            Expression::Constant(term) => term
                .value_id()
                .or_else(|| ctx.index.get_id(term))
                .unwrap_or_else(|| out_vocab.get_or_add(&term.to_string())),
            Expression::Bound(v) => Id::bool(!ctx.id_of(v, row).is_undefined()),
            Expression::And(..) | Expression::Or(..) | Expression::Not(..) => {
                match self.evaluate_bool(ctx, row, out_vocab) {
                    TriBool::True => Id::bool(true),
                    TriBool::False => Id::bool(false),
                    TriBool::Undef => Id::UNDEFINED,
                }
            }
            Expression::Relational { .. } | Expression::In { .. } => {
                match self.evaluate_bool(ctx, row, out_vocab) {
                    TriBool::True => Id::bool(true),
                    TriBool::False => Id::bool(false),
                    TriBool::Undef => Id::UNDEFINED,
                }
            }
            Expression::Arithmetic { op, left, right } => {
                let a = left.evaluate(ctx, row, out_vocab);
                let b = right.evaluate(ctx, row, out_vocab);
                arithmetic(*op, a, b)
            }
            Expression::Neg(e) => {
                let v = e.evaluate(ctx, row, out_vocab);
                match (v.as_int(), v.as_double()) {
                    (Some(i), _) => Id::int(-i).unwrap_or(Id::UNDEFINED),
                    (_, Some(d)) => Id::double(-d),
                    _ => Id::UNDEFINED,
                }
            }
            Expression::Lang(e) => {
                let id = e.evaluate(ctx, row, out_vocab);
                match ctx.term_of(id) {
                    Some(term) => {
                        let tag = term.language().unwrap_or("");
                        out_vocab.get_or_add(&Term::literal(tag).to_string())
                    }
                    None => Id::UNDEFINED,
                }
            }
            Expression::Str(e) => {
                let id = e.evaluate(ctx, row, out_vocab);
                match ctx.term_of(id) {
                    Some(Term::Iri(iri)) => out_vocab.get_or_add(&Term::literal(iri).to_string()),
                    Some(Term::Literal { lexical, .. }) => {
                        out_vocab.get_or_add(&Term::literal(lexical).to_string())
                    }
                    _ => Id::UNDEFINED,
                }
            }
            // Aggregates are folded by the group-by operator, never here.
            Expression::Aggregate { .. } => Id::UNDEFINED,
        }
    }

    /// Evaluate under the effective-boolean-value rules.
    pub fn evaluate_bool(
        &self,
        ctx: &EvalContext<'_>,
        row: usize,
        out_vocab: &mut LocalVocab,
    ) -> TriBool {
        match self {
            Expression::And(a, b) => a
                .evaluate_bool(ctx, row, out_vocab)
                .and(b.evaluate_bool(ctx, row, out_vocab)),
            Expression::Or(a, b) => a
                .evaluate_bool(ctx, row, out_vocab)
                .or(b.evaluate_bool(ctx, row, out_vocab)),
            Expression::Not(e) => e.evaluate_bool(ctx, row, out_vocab).not(),
            Expression::Relational { op, left, right } => {
                let a = left.evaluate(ctx, row, out_vocab);
                let b = right.evaluate(ctx, row, out_vocab);
                match ctx.compare(a, b) {
                    Some(ordering) => TriBool::from_bool(op.matches(ordering)),
                    None => TriBool::Undef,
                }
            }
            Expression::In { left, values } => {
                let needle = left.evaluate(ctx, row, out_vocab);
                let mut any_undef = false;
                for value in values {
                    let candidate = value.evaluate(ctx, row, out_vocab);
                    match ctx.compare(needle, candidate) {
                        Some(Ordering::Equal) => return TriBool::True,
                        Some(_) => {}
                        None => any_undef = true,
                    }
                }
                if any_undef {
                    TriBool::Undef
                } else {
                    TriBool::False
                }
            }
            other => effective_boolean_value(other.evaluate(ctx, row, out_vocab), ctx),
        }
    }
}

/// SPARQL effective boolean value of an already-computed id.
pub fn effective_boolean_value(id: Id, ctx: &EvalContext<'_>) -> TriBool {
    match id.tag() {
        Tag::Undefined => TriBool::Undef,
        Tag::Bool => TriBool::from_bool(id.as_bool().unwrap_or(false)),
        Tag::Int => TriBool::from_bool(id.as_int() != Some(0)),
        Tag::Double => TriBool::from_bool(id.as_double().is_some_and(|d| d != 0.0 && !d.is_nan())),
        Tag::VocabIndex | Tag::LocalVocabIndex => match ctx.term_of(id) {
            Some(Term::Literal { lexical, .. }) => TriBool::from_bool(!lexical.is_empty()),
            _ => TriBool::Undef,
        },
        _ => TriBool::Undef,
    }
}

fn arithmetic(op: ArithOp, a: Id, b: Id) -> Id {
    // Integer arithmetic stays integral except for division.
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return match op {
            ArithOp::Add => Id::int(x.saturating_add(y)).unwrap_or(Id::UNDEFINED),
            ArithOp::Sub => Id::int(x.saturating_sub(y)).unwrap_or(Id::UNDEFINED),
            ArithOp::Mul => Id::int(x.saturating_mul(y)).unwrap_or(Id::UNDEFINED),
            ArithOp::Div => {
                if y == 0 {
                    Id::UNDEFINED
                } else {
                    Id::double(x as f64 / y as f64)
                }
            }
        };
    }
    match (a.as_numeric(), b.as_numeric()) {
        (Some(x), Some(y)) => match op {
            ArithOp::Add => Id::double(x + y),
            ArithOp::Sub => Id::double(x - y),
            ArithOp::Mul => Id::double(x * y),
            ArithOp::Div => {
                if y == 0.0 {
                    Id::UNDEFINED
                } else {
                    Id::double(x / y)
                }
            }
        },
        _ => Id::UNDEFINED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLimit;
    use crate::variable::UndefStatus;

    fn context() -> (IdTable, VariableMap, index::Index) {
        let mut table = IdTable::new(2, MemoryLimit::unlimited());
        table
            .push_row(&[Id::int(3).unwrap(), Id::UNDEFINED])
            .unwrap();
        let mut map = VariableMap::new();
        map.push(Variable::new("x"), UndefStatus::AlwaysDefined);
        map.push(Variable::new("y"), UndefStatus::PossiblyUndef);
        let index = index::IndexBuilder::default().build().unwrap();
        (table, map, index)
    }

    #[test]
    fn relational_three_valued() {
        let (table, var_map, index) = context();
        let vocab = LocalVocab::new();
        let ctx = EvalContext {
            table: &table,
            var_map: &var_map,
            index: &index,
            vocab: &vocab,
        };
        let mut out = LocalVocab::new();
        let lt = Expression::relational(RelOp::Lt, Expression::var("x"), Expression::Int(5));
        assert_eq!(lt.evaluate_bool(&ctx, 0, &mut out), TriBool::True);
        let gt = Expression::relational(RelOp::Gt, Expression::var("x"), Expression::Int(5));
        assert_eq!(gt.evaluate_bool(&ctx, 0, &mut out), TriBool::False);
        // Comparison against an unbound variable is Undef, not false.
        let undef = Expression::eq(Expression::var("y"), Expression::Int(5));
        assert_eq!(undef.evaluate_bool(&ctx, 0, &mut out), TriBool::Undef);
        // ... and negation keeps it Undef.
        let not = Expression::Not(Box::new(undef));
        assert_eq!(not.evaluate_bool(&ctx, 0, &mut out), TriBool::Undef);
    }

    #[test]
    fn bound_and_arithmetic() {
        let (table, var_map, index) = context();
        let vocab = LocalVocab::new();
        let ctx = EvalContext {
            table: &table,
            var_map: &var_map,
            index: &index,
            vocab: &vocab,
        };
        let mut out = LocalVocab::new();
        assert_eq!(
            Expression::Bound(Variable::new("x")).evaluate(&ctx, 0, &mut out),
            Id::bool(true)
        );
        assert_eq!(
            Expression::Bound(Variable::new("y")).evaluate(&ctx, 0, &mut out),
            Id::bool(false)
        );
        let sum = Expression::Arithmetic {
            op: ArithOp::Add,
            left: Box::new(Expression::var("x")),
            right: Box::new(Expression::Int(4)),
        };
        assert_eq!(sum.evaluate(&ctx, 0, &mut out).as_int(), Some(7));
        let div0 = Expression::Arithmetic {
            op: ArithOp::Div,
            left: Box::new(Expression::Int(1)),
            right: Box::new(Expression::Int(0)),
        };
        assert!(div0.evaluate(&ctx, 0, &mut out).is_undefined());
    }

    #[test]
    fn lang_filter_recognition() {
        let expr = Expression::eq(
            Expression::Lang(Box::new(Expression::var("x"))),
            Expression::Constant(Term::literal("de")),
        );
        let (var, tag) = expr.as_lang_filter().unwrap();
        assert_eq!(var, &Variable::new("x"));
        assert_eq!(tag, "de");
        assert!(Expression::eq(Expression::var("x"), Expression::Int(1))
            .as_lang_filter()
            .is_none());
    }

    #[test]
    fn prefix_range_filter_recognition() {
        let expr = Expression::relational(RelOp::Lt, Expression::Int(5), Expression::var("x"));
        let (var, op, _) = expr.as_prefix_range_filter().unwrap();
        assert_eq!(var, &Variable::new("x"));
        // `5 < ?x` is `?x > 5`.
        assert_eq!(op, RelOp::Gt);
    }
}
