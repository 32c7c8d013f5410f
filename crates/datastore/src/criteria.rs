//! Search criteria and their compilation to a WHERE expression.
//!
//! Criteria are a list of groups.  Conditions within a group are ANDed together and the groups are ORed, so
//! `[[a, b], [c]]` means `(a AND b) OR (c)`.  Groups may also carry two directives which aren't predicates at all:
//! `limit by` and `order by`.  [Criteria::split] pulls those out; only the remaining conditions are compiled.
//!
//! Parameters are bound as placeholders unless the caller explicitly passes [Param::Raw], which is spliced into the
//! statement text verbatim.  Raw parameters are the one place SQL injection is possible: they must only ever come
//! from trusted code, never from user input.
use std::str::FromStr;

use itertools::Itertools;

use crate::errors::{Error, Result};
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    IsNull,
    NotNull,
    In,
    NotIn,
    Like,
    NotLike,
}

impl Operator {
    pub fn sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::IsNull => "IS NULL",
            Operator::NotNull => "IS NOT NULL",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
        }
    }

    /// Null checks are the only operators without a right-hand side.
    pub fn takes_param(&self) -> bool {
        !matches!(self, Operator::IsNull | Operator::NotNull)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "lt" => Operator::Lt,
            "ge" => Operator::Ge,
            "le" => Operator::Le,
            "isnull" => Operator::IsNull,
            "notnull" => Operator::NotNull,
            "in" => Operator::In,
            "notin" => Operator::NotIn,
            "like" => Operator::Like,
            "notlike" => Operator::NotLike,
            _ => return Err(Error::InvalidCriteria(format!("unknown operator {}", s))),
        })
    }
}

/// The right-hand side of a condition.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    None,
    Value(Value),
    List(Vec<Value>),
    /// Caller-trusted SQL, spliced in unescaped.  For `in`/`notin` this is typically a subselect.
    Raw(String),
}

impl From<Value> for Param {
    fn from(v: Value) -> Param {
        Param::Value(v)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: Operator,
    pub param: Param,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    Condition(Condition),
    LimitBy { offset: u64, count: u64 },
    OrderBy(Vec<String>),
}

/// Conditions which must all hold.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Group {
    terms: Vec<Term>,
}

impl Group {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cond(mut self, column: impl Into<String>, op: Operator, param: Param) -> Self {
        self.terms.push(Term::Condition(Condition {
            column: column.into(),
            op,
            param,
        }));
        self
    }

    /// Add a condition with the operator given by name (`"eq"`, `"notin"`, ...).
    pub fn parse(self, column: impl Into<String>, op: &str, param: impl Into<Value>) -> Result<Self> {
        let op: Operator = op.parse()?;
        let param = if op.takes_param() {
            Param::Value(param.into())
        } else {
            Param::None
        };
        Ok(self.cond(column, op, param))
    }

    pub fn eq(self, column: impl Into<String>, v: impl Into<Value>) -> Self {
        self.cond(column, Operator::Eq, Param::Value(v.into()))
    }

    pub fn ne(self, column: impl Into<String>, v: impl Into<Value>) -> Self {
        self.cond(column, Operator::Ne, Param::Value(v.into()))
    }

    pub fn gt(self, column: impl Into<String>, v: impl Into<Value>) -> Self {
        self.cond(column, Operator::Gt, Param::Value(v.into()))
    }

    pub fn lt(self, column: impl Into<String>, v: impl Into<Value>) -> Self {
        self.cond(column, Operator::Lt, Param::Value(v.into()))
    }

    pub fn ge(self, column: impl Into<String>, v: impl Into<Value>) -> Self {
        self.cond(column, Operator::Ge, Param::Value(v.into()))
    }

    pub fn le(self, column: impl Into<String>, v: impl Into<Value>) -> Self {
        self.cond(column, Operator::Le, Param::Value(v.into()))
    }

    pub fn like(self, column: impl Into<String>, v: impl Into<Value>) -> Self {
        self.cond(column, Operator::Like, Param::Value(v.into()))
    }

    pub fn not_like(self, column: impl Into<String>, v: impl Into<Value>) -> Self {
        self.cond(column, Operator::NotLike, Param::Value(v.into()))
    }

    pub fn is_null(self, column: impl Into<String>) -> Self {
        self.cond(column, Operator::IsNull, Param::None)
    }

    pub fn not_null(self, column: impl Into<String>) -> Self {
        self.cond(column, Operator::NotNull, Param::None)
    }

    pub fn is_in<V: Into<Value>>(self, column: impl Into<String>, vs: impl IntoIterator<Item = V>) -> Self {
        let list = vs.into_iter().map(Into::into).collect();
        self.cond(column, Operator::In, Param::List(list))
    }

    pub fn not_in<V: Into<Value>>(self, column: impl Into<String>, vs: impl IntoIterator<Item = V>) -> Self {
        let list = vs.into_iter().map(Into::into).collect();
        self.cond(column, Operator::NotIn, Param::List(list))
    }

    /// A condition whose right-hand side is trusted SQL, e.g. `raw("id", Operator::In, "SELECT id FROM t")`.
    pub fn raw(self, column: impl Into<String>, op: Operator, sql: impl Into<String>) -> Self {
        self.cond(column, op, Param::Raw(sql.into()))
    }

    pub fn limit_by(mut self, offset: u64, count: u64) -> Self {
        self.terms.push(Term::LimitBy { offset, count });
        self
    }

    pub fn order_by<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.terms
            .push(Term::OrderBy(columns.into_iter().map(Into::into).collect()));
        self
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }
}

/// Groups of conditions, any of which may hold.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Criteria {
    groups: Vec<Group>,
}

/// The out-of-band parts of some criteria.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directives {
    /// `(offset, count)`.  If more than one group asks for a limit, the last one wins.
    pub limit: Option<(u64, u64)>,
    pub order_by: Vec<String>,
}

impl Criteria {
    /// Criteria matching everything.
    pub fn new() -> Self {
        Default::default()
    }

    pub fn or(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.terms.is_empty())
    }

    /// Separate the predicates from the directives.  Groups left with no conditions are dropped.
    pub fn split(&self) -> (Vec<Vec<&Condition>>, Directives) {
        let mut directives = Directives::default();
        let mut groups = vec![];

        for g in self.groups.iter() {
            let mut conds = vec![];
            for t in g.terms.iter() {
                match t {
                    Term::Condition(c) => conds.push(c),
                    Term::LimitBy { offset, count } => directives.limit = Some((*offset, *count)),
                    Term::OrderBy(cols) => directives.order_by.extend(cols.iter().cloned()),
                }
            }
            if !conds.is_empty() {
                groups.push(conds);
            }
        }

        (groups, directives)
    }
}

impl From<Group> for Criteria {
    fn from(g: Group) -> Criteria {
        Criteria::new().or(g)
    }
}

/// A compiled WHERE expression (without the `WHERE`).
#[derive(Clone, Debug, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub params: Vec<Value>,
    group_count: usize,
}

impl Compiled {
    /// The expression, parenthesized if it is an OR of several groups, for ANDing onto other predicates.
    pub fn as_conjunct(&self) -> String {
        if self.group_count > 1 {
            format!("({})", self.sql)
        } else {
            self.sql.clone()
        }
    }
}

fn render_condition(
    cond: &Condition,
    namer: &mut impl FnMut(&str) -> Result<String>,
    params: &mut Vec<Value>,
) -> Result<String> {
    let column = namer(&cond.column)?;
    let op = cond.op;

    if !op.takes_param() {
        return Ok(format!("{} {}", column, op.sql()));
    }

    let missing = || {
        Error::InvalidCriteria(format!(
            "{} {} needs a parameter",
            cond.column,
            op.sql()
        ))
    };

    match (&cond.param, op.is_set()) {
        (Param::Raw(sql), true) => Ok(format!("{} {} ({})", column, op.sql(), sql)),
        (Param::Raw(sql), false) => Ok(format!("{} {} {}", column, op.sql(), sql)),
        (Param::List(vs), true) => {
            if vs.is_empty() {
                // `IN ()` isn't valid SQL.  Nothing is in the empty set; everything is outside it.
                let always = if op == Operator::In { "1 = 0" } else { "1 = 1" };
                return Ok(always.to_string());
            }
            params.extend(vs.iter().cloned());
            Ok(format!(
                "{} {} ({})",
                column,
                op.sql(),
                std::iter::repeat("?").take(vs.len()).join(", ")
            ))
        }
        (Param::Value(v), true) => {
            params.push(v.clone());
            Ok(format!("{} {} (?)", column, op.sql()))
        }
        (Param::Value(v), false) => {
            params.push(v.clone());
            Ok(format!("{} {} ?", column, op.sql()))
        }
        (Param::List(_), false) => Err(Error::InvalidCriteria(format!(
            "{} {} takes a single value, not a list",
            cond.column,
            op.sql()
        ))),
        (Param::None, _) => Err(missing()),
    }
}

/// Compile conditions into a parameterized boolean expression.
///
/// `namer` maps a column reference as the caller wrote it to the text to use in SQL, failing for unknown columns.
/// Returns `None` when there are no conditions, in which case no WHERE clause should be emitted at all.
pub fn compile(
    groups: &[Vec<&Condition>],
    mut namer: impl FnMut(&str) -> Result<String>,
) -> Result<Option<Compiled>> {
    if groups.is_empty() {
        return Ok(None);
    }

    let mut params = vec![];
    let wrap_all = groups.len() > 1;
    let mut rendered = vec![];

    for g in groups.iter() {
        let terms = g
            .iter()
            .map(|c| render_condition(c, &mut namer, &mut params))
            .collect::<Result<Vec<_>>>()?;
        let joined = terms.join(" AND ");
        if wrap_all || terms.len() > 1 {
            rendered.push(format!("({})", joined));
        } else {
            rendered.push(joined);
        }
    }

    Ok(Some(Compiled {
        sql: rendered.join(" OR "),
        params,
        group_count: groups.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn ident(c: &str) -> Result<String> {
        Ok(c.to_string())
    }

    fn compile_criteria(c: &Criteria) -> Option<Compiled> {
        let (groups, _) = c.split();
        compile(&groups, ident).unwrap()
    }

    #[test]
    fn empty_criteria_has_no_where() {
        assert_eq!(compile_criteria(&Criteria::new()), None);
        // A group holding only directives is no predicate either.
        let c = Criteria::new().or(Group::new().limit_by(0, 10));
        assert_eq!(compile_criteria(&c), None);
    }

    #[test]
    fn single_condition_is_bare() {
        let c = Criteria::from(Group::new().eq("id", 5));
        let compiled = compile_criteria(&c).unwrap();
        assert_eq!(compiled.sql, "id = ?");
        assert_eq!(compiled.params, vec![Value::Integer(5)]);
        assert_eq!(compiled.as_conjunct(), "id = ?");
    }

    #[test]
    fn groups_and_or() {
        let c = Criteria::new()
            .or(Group::new().ge("id", 5).le("id", 10))
            .or(Group::new().is_null("val"));
        let compiled = compile_criteria(&c).unwrap();
        assert_eq!(compiled.sql, "(id >= ? AND id <= ?) OR (val IS NULL)");
        assert_eq!(compiled.params.len(), 2);
        assert_eq!(
            compiled.as_conjunct(),
            "((id >= ? AND id <= ?) OR (val IS NULL))"
        );
    }

    #[test]
    fn sets_and_raw() {
        let c = Criteria::from(
            Group::new()
                .is_in("id", [1, 2, 3])
                .not_in("id", Vec::<i64>::new())
                .raw("owner", Operator::In, "SELECT id FROM owners")
                .raw("created", Operator::Lt, "CURRENT_TIMESTAMP")
                .not_like("name", "%x%"),
        );
        let compiled = compile_criteria(&c).unwrap();
        assert_eq!(
            compiled.sql,
            "(id IN (?, ?, ?) AND 1 = 1 AND owner IN (SELECT id FROM owners) AND created < CURRENT_TIMESTAMP AND name NOT LIKE ?)"
        );
        assert_eq!(compiled.params.len(), 4);
    }

    #[test]
    fn directives_are_stripped() {
        let c = Criteria::new()
            .or(Group::new().eq("a", 1).order_by(["a", "b DESC"]))
            .or(Group::new().limit_by(10, 5).eq("b", 2).limit_by(20, 5));
        let (groups, directives) = c.split();
        assert_eq!(groups.len(), 2);
        assert_eq!(directives.limit, Some((20, 5)));
        assert_eq!(directives.order_by, vec!["a".to_string(), "b DESC".to_string()]);
    }

    #[test]
    fn missing_and_misplaced_params() {
        let c = Criteria::from(Group::new().cond("a", Operator::Eq, Param::None));
        let (groups, _) = c.split();
        assert!(matches!(compile(&groups, ident), Err(Error::InvalidCriteria(_))));

        let c = Criteria::from(Group::new().cond("a", Operator::Gt, Param::List(vec![1.into()])));
        let (groups, _) = c.split();
        assert!(compile(&groups, ident).is_err());
    }

    #[test]
    fn namer_errors_propagate() {
        let c = Criteria::from(Group::new().eq("nope", 1));
        let (groups, _) = c.split();
        let res = compile(&groups, |c| {
            Err(Error::UnknownColumn {
                table: "t".into(),
                column: c.into(),
            })
        });
        assert!(matches!(res, Err(Error::UnknownColumn { .. })));
    }

    #[test]
    fn operator_names() {
        assert_eq!("notin".parse::<Operator>().unwrap(), Operator::NotIn);
        assert_eq!("GE".parse::<Operator>().unwrap(), Operator::Ge);
        assert!("between".parse::<Operator>().is_err());
        let g = Group::new().parse("id", "ge", 5).unwrap();
        assert_eq!(g.terms().len(), 1);
    }

    /// A condition with a well-formed parameter for its operator.  Sets get 1 to 4 elements.
    fn condition() -> impl Strategy<Value = (Operator, usize)> {
        (any::<Operator>(), 1..5usize)
    }

    fn build(op: Operator, k: usize) -> Condition {
        let param = if !op.takes_param() {
            Param::None
        } else if op.is_set() {
            Param::List((0..k as i64).map(Value::Integer).collect())
        } else {
            Param::Value(Value::Integer(k as i64))
        };
        Condition {
            column: "c".into(),
            op,
            param,
        }
    }

    proptest! {
        #[test]
        fn term_and_param_counts(shape in prop::collection::vec(prop::collection::vec(condition(), 1..5), 1..5)) {
            let conds = shape
                .iter()
                .map(|g| g.iter().map(|(op, k)| build(*op, *k)).collect::<Vec<_>>())
                .collect::<Vec<_>>();
            let groups = conds.iter().map(|g| g.iter().collect::<Vec<_>>()).collect::<Vec<_>>();
            let compiled = compile(&groups, ident).unwrap().unwrap();

            let total_terms: usize = shape.iter().map(|g| g.len()).sum();
            let separators = compiled.sql.matches(" AND ").count() + compiled.sql.matches(" OR ").count();
            prop_assert_eq!(separators + 1, total_terms);

            let expected_params: usize = shape
                .iter()
                .flatten()
                .map(|(op, k)| if !op.takes_param() { 0 } else if op.is_set() { *k } else { 1 })
                .sum();
            prop_assert_eq!(compiled.params.len(), expected_params);
            prop_assert_eq!(compiled.sql.matches('?').count(), expected_params);
        }

        #[test]
        fn set_placeholders_match_size(k in 1..50usize) {
            let cond = build(Operator::In, k);
            let compiled = compile(&[vec![&cond]], ident).unwrap().unwrap();
            prop_assert_eq!(compiled.sql.matches('?').count(), k);
        }
    }
}
