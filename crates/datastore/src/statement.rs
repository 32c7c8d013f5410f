//! Statement synthesis.
//!
//! Everything here is pure: descriptors and criteria go in, SQL text and the parameters to bind come out.  Nothing
//! touches storage.  Statements are rendered from tera templates, one per statement shape; column lists, FROM lists
//! and predicates are assembled in Rust and handed to the template as plain strings.
use itertools::Itertools;
use log::*;

use crate::criteria::{compile, Criteria, Directives};
use crate::descriptor::TableDescriptor;
use crate::errors::{Error, Result};
use crate::join::JoinPlan;
use crate::value::Value;

/// SQL text plus the values for its placeholders, in order.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// The right-hand side of an inserted column.
#[derive(Clone, Debug, PartialEq)]
pub enum InsertValue {
    Bind(Value),
    /// Trusted SQL from the table definition, e.g. a sequence's nextval.
    Literal(String),
}

const SELECT_TEMPLATE: &str = r#"SELECT {{ columns | join(sep=", ") }} FROM {{ from }}{% if where_clause %} WHERE {{ where_clause }}{% endif %}{% if group_by %} GROUP BY {{ group_by }}{% endif %}{% if order_by %} ORDER BY {{ order_by | join(sep=", ") }}{% endif %}{% if limit %} {{ limit }}{% endif %}"#;

const COUNT_TEMPLATE: &str = r#"{% if group_by %}SELECT COUNT(*) FROM (SELECT {{ group_by }} FROM {{ from }}{% if where_clause %} WHERE {{ where_clause }}{% endif %} GROUP BY {{ group_by }}) AS grouped{% else %}SELECT COUNT(*) FROM {{ from }}{% if where_clause %} WHERE {{ where_clause }}{% endif %}{% endif %}"#;

const INSERT_TEMPLATE: &str = r#"INSERT INTO {{ table }}{% if columns %} ({{ columns | join(sep=", ") }}) VALUES {% for row in rows %}({{ row | join(sep=", ") }}){% if not loop.last %}, {% endif %}{% endfor %}{% else %} DEFAULT VALUES{% endif %}"#;

const UPDATE_TEMPLATE: &str = r#"UPDATE {{ table }} SET {% for c in columns %}{{ c }} = ?{% if not loop.last %}, {% endif %}{% endfor %} WHERE {{ where_clause }}"#;

const DELETE_TEMPLATE: &str = r#"DELETE FROM {{ table }}{% if where_clause %} WHERE {{ where_clause }}{% endif %}"#;

fn render(template: &str, context: &tera::Context, params: Vec<Value>) -> Result<Statement> {
    let sql = tera::Tera::one_off(template, context, false)?;
    debug!("Statement: {} ({} params)", sql, params.len());
    Ok(Statement { sql, params })
}

/// Namer for criteria against a single table: names and aliases map to the SQL column name.
fn table_namer(table: &TableDescriptor) -> impl Fn(&str) -> Result<String> + '_ {
    move |c| Ok(table.column(c)?.get_name().to_string())
}

fn join_namer(plan: &JoinPlan) -> impl Fn(&str) -> Result<String> + '_ {
    move |c| Ok(plan.qualified(plan.resolve(c)?))
}

/// Render ORDER BY entries.  Each is a column reference, optionally followed by `ASC` or `DESC`.
fn order_by(entries: &[String], namer: impl Fn(&str) -> Result<String>) -> Result<Vec<String>> {
    entries
        .iter()
        .map(|e| {
            let e = e.trim();
            let (col, dir) = match e.rsplit_once(char::is_whitespace) {
                Some((c, d)) if d.eq_ignore_ascii_case("asc") || d.eq_ignore_ascii_case("desc") => {
                    (c.trim_end(), Some(d.to_ascii_uppercase()))
                }
                _ => (e, None),
            };
            let named = namer(col)?;
            Ok(match dir {
                Some(d) => format!("{} {}", named, d),
                None => named,
            })
        })
        .collect()
}

/// Substitute `%offset%` and `%count%` into the schema's limit template.
pub fn limit_clause(template: &str, offset: u64, count: u64) -> String {
    template
        .replace("%offset%", &offset.to_string())
        .replace("%count%", &count.to_string())
}

/// The parts shared by SELECT and COUNT.
struct Filter {
    where_clause: String,
    params: Vec<Value>,
    directives: Directives,
}

fn filter(
    criteria: &Criteria,
    namer: impl Fn(&str) -> Result<String>,
    extra: Vec<String>,
) -> Result<Filter> {
    let (groups, directives) = criteria.split();
    let compiled = compile(&groups, &namer)?;

    let (mut conjuncts, params) = match compiled {
        // Nothing else to AND onto, so no parentheses are needed around an OR.
        Some(c) if extra.is_empty() => (vec![c.sql], c.params),
        Some(c) => (vec![c.as_conjunct()], c.params),
        None => (vec![], vec![]),
    };
    conjuncts.extend(extra);

    Ok(Filter {
        where_clause: conjuncts.join(" AND "),
        params,
        directives,
    })
}

fn select_context(
    columns: Vec<String>,
    from: String,
    filter: &Filter,
    group_by: Option<&str>,
    order: Vec<String>,
    limit_template: &str,
) -> tera::Context {
    let mut context = tera::Context::new();
    context.insert("columns", &columns);
    context.insert("from", &from);
    context.insert("where_clause", &filter.where_clause);
    context.insert("group_by", group_by.unwrap_or(""));
    context.insert("order_by", &order);
    let limit = filter
        .directives
        .limit
        .map(|(offset, count)| limit_clause(limit_template, offset, count))
        .unwrap_or_default();
    context.insert("limit", &limit);
    context
}

/// `name AS alias` for every column of the table.
pub fn table_select_columns(table: &TableDescriptor) -> Vec<String> {
    table
        .iter_columns()
        .map(|c| format!("{} AS {}", c.get_name(), c.get_alias()))
        .collect()
}

pub fn select_table(
    table: &TableDescriptor,
    criteria: &Criteria,
    limit_template: &str,
) -> Result<Statement> {
    let f = filter(criteria, table_namer(table), vec![])?;
    let order = order_by(&f.directives.order_by, table_namer(table))?;
    let context = select_context(
        table_select_columns(table),
        table.from_clause(),
        &f,
        table.group_by().map(|c| c.get_name()),
        order,
        limit_template,
    );
    render(SELECT_TEMPLATE, &context, f.params)
}

pub fn select_join(plan: &JoinPlan, criteria: &Criteria, limit_template: &str) -> Result<Statement> {
    let f = filter(criteria, join_namer(plan), plan.equalities())?;
    let order = order_by(&f.directives.order_by, join_namer(plan))?;
    let columns = plan
        .column_refs()
        .map(|r| format!("{} AS {}", plan.qualified(r), plan.long_name(r)))
        .collect();
    let context = select_context(columns, plan.from_clause(), &f, None, order, limit_template);
    render(SELECT_TEMPLATE, &context, f.params)
}

fn count_context(from: String, filter: &Filter, group_by: Option<&str>) -> tera::Context {
    let mut context = tera::Context::new();
    context.insert("from", &from);
    context.insert("where_clause", &filter.where_clause);
    context.insert("group_by", group_by.unwrap_or(""));
    context
}

/// Count matching rows, or matching groups if the table groups.  Directives are ignored.
pub fn count_table(table: &TableDescriptor, criteria: &Criteria) -> Result<Statement> {
    let f = filter(criteria, table_namer(table), vec![])?;
    let context = count_context(table.from_clause(), &f, table.group_by().map(|c| c.get_name()));
    render(COUNT_TEMPLATE, &context, f.params)
}

pub fn count_join(plan: &JoinPlan, criteria: &Criteria) -> Result<Statement> {
    let f = filter(criteria, join_namer(plan), plan.equalities())?;
    let context = count_context(plan.from_clause(), &f, None);
    render(COUNT_TEMPLATE, &context, f.params)
}

/// Insert one row.  `values` pairs column indices with what to insert; unlisted columns are left to the database.
pub fn insert(table: &TableDescriptor, values: &[(usize, InsertValue)]) -> Result<Statement> {
    table.check_writable()?;

    let mut params = vec![];
    let mut columns = vec![];
    let mut row = vec![];
    for (idx, v) in values.iter() {
        columns.push(table.column_at(*idx).get_name().to_string());
        match v {
            InsertValue::Bind(v) => {
                params.push(v.clone());
                row.push("?".to_string());
            }
            InsertValue::Literal(l) => row.push(l.clone()),
        }
    }

    let mut context = tera::Context::new();
    context.insert("table", table.get_name());
    context.insert("columns", &columns);
    context.insert("rows", &vec![row]);
    render(INSERT_TEMPLATE, &context, params)
}

/// Insert many rows in one statement.  No validation happens here.
pub fn bulk_insert(table: &TableDescriptor, columns: &[usize], rows: &[Vec<Value>]) -> Result<Statement> {
    table.check_writable()?;
    if columns.is_empty() {
        return Err(Error::InvalidDefinition(
            "A bulk insert needs at least one column".into(),
        ));
    }

    let mut params = Vec::with_capacity(columns.len() * rows.len());
    for r in rows.iter() {
        if r.len() != columns.len() {
            return Err(Error::ArityMismatch {
                expected: columns.len(),
                got: r.len(),
            });
        }
        params.extend(r.iter().cloned());
    }

    let placeholders = vec!["?"; columns.len()];
    let mut context = tera::Context::new();
    context.insert("table", table.get_name());
    context.insert(
        "columns",
        &columns
            .iter()
            .map(|i| table.column_at(*i).get_name())
            .collect::<Vec<_>>(),
    );
    context.insert("rows", &vec![placeholders; rows.len()]);
    render(INSERT_TEMPLATE, &context, params)
}

/// `col = ?` for each pinned column, or `col IS NULL` for null values, ANDed.
fn pin_clause(table: &TableDescriptor, pin: &[(usize, Value)], params: &mut Vec<Value>) -> String {
    pin.iter()
        .map(|(idx, v)| {
            let name = table.column_at(*idx).get_name();
            if v.is_null() {
                format!("{} IS NULL", name)
            } else {
                params.push(v.clone());
                format!("{} = ?", name)
            }
        })
        .join(" AND ")
}

/// The columns and values identifying one row: the primary key if all of it is known, else the first unique key
/// that is, else the primary key anyway, else every column.
pub fn row_pin(table: &TableDescriptor, values: &[Value]) -> Vec<(usize, Value)> {
    let known = |key: &[usize]| !key.is_empty() && key.iter().all(|i| !values[*i].is_null());
    let pin = |key: &[usize]| -> Vec<(usize, Value)> { key.iter().map(|i| (*i, values[*i].clone())).collect() };

    let pk = table.primary_key();
    if known(pk) {
        return pin(pk);
    }
    if let Some(uk) = table.unique_keys().iter().find(|k| known(k.as_slice())) {
        return pin(uk);
    }
    if pk.is_empty() {
        values.iter().cloned().enumerate().collect()
    } else {
        pin(pk)
    }
}

/// Update `changes` in the single row identified by `pin`.
pub fn update(
    table: &TableDescriptor,
    changes: &[(usize, Value)],
    pin: &[(usize, Value)],
) -> Result<Statement> {
    table.check_writable()?;
    if changes.is_empty() || pin.is_empty() {
        return Err(Error::InvalidDefinition(format!(
            "{}: an update needs changed columns and a row to pin",
            table.display_name()
        )));
    }

    let mut params = changes.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>();
    let where_clause = pin_clause(table, pin, &mut params);

    let mut context = tera::Context::new();
    context.insert("table", table.get_name());
    context.insert(
        "columns",
        &changes
            .iter()
            .map(|(i, _)| table.column_at(*i).get_name())
            .collect::<Vec<_>>(),
    );
    context.insert("where_clause", &where_clause);
    render(UPDATE_TEMPLATE, &context, params)
}

/// Delete rows matching `criteria`.  Directives are ignored; empty criteria deletes everything.
pub fn delete_where(table: &TableDescriptor, criteria: &Criteria) -> Result<Statement> {
    table.check_writable()?;
    let f = filter(criteria, table_namer(table), vec![])?;
    let mut context = tera::Context::new();
    context.insert("table", table.get_name());
    context.insert("where_clause", &f.where_clause);
    render(DELETE_TEMPLATE, &context, f.params)
}

/// Delete the single row identified by `pin`.
pub fn delete_pinned(table: &TableDescriptor, pin: &[(usize, Value)]) -> Result<Statement> {
    table.check_writable()?;
    if pin.is_empty() {
        return Err(Error::InvalidDefinition(format!(
            "{}: refusing to delete without a row to pin",
            table.display_name()
        )));
    }
    let mut params = vec![];
    let where_clause = pin_clause(table, pin, &mut params);
    let mut context = tera::Context::new();
    context.insert("table", table.get_name());
    context.insert("where_clause", &where_clause);
    render(DELETE_TEMPLATE, &context, params)
}
