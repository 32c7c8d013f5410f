//! Descriptions of tables, columns, and joins.
//!
//! A table has an SQL name, an optional display alias, and an ordered list of columns.  Each column likewise has an
//! SQL name and an alias (defaulting to the name); within a table, every name and alias resolves to exactly one
//! column.  Key columns are stored as column indices, so by the time a descriptor is built every key reference has
//! been normalized to its canonical column.
//!
//! Joins are only described here.  Turning a [JoinDescriptor] into something statements can be built from is the job
//! of [crate::join].
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::value::Value;

/// Semantic type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnType {
    /// A number which may not be null.
    Number,
    /// Anything non-null.
    String,
    /// A number, or null.
    NullableNumber,
    /// Anything at all.
    NullableString,
}

impl ColumnType {
    pub fn is_nullable(&self) -> bool {
        matches!(self, ColumnType::NullableNumber | ColumnType::NullableString)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Number | ColumnType::NullableNumber)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ColumnType::Number => "a number",
            ColumnType::String => "a non-null value",
            ColumnType::NullableNumber => "a number or null",
            ColumnType::NullableString => "anything",
        }
    }
}

impl Default for ColumnType {
    fn default() -> Self {
        ColumnType::NullableString
    }
}

/// What a custom rule gets to look at besides the proposed value.
pub struct RuleContext<'a> {
    pub table: &'a TableDescriptor,
    /// Current values of the row, aligned with the table's columns.  Unset columns are null.
    pub values: &'a [Value],
}

impl<'a> RuleContext<'a> {
    /// Look up another column of the row being validated.
    pub fn get(&self, column: &str) -> Option<&'a Value> {
        let idx = self.table.column_index(column).ok()?;
        self.values.get(idx)
    }
}

type RuleFn = dyn Fn(&RuleContext<'_>, &Value, &str) -> bool + Send + Sync;

/// A custom validation rule: called with the context, the proposed value, and the column name.  Returning false rejects
/// the value.
#[derive(Clone)]
pub struct Rule(Arc<RuleFn>);

impl Rule {
    pub fn new(f: impl Fn(&RuleContext<'_>, &Value, &str) -> bool + Send + Sync + 'static) -> Self {
        Rule(Arc::new(f))
    }

    pub fn check(&self, ctx: &RuleContext<'_>, value: &Value, column: &str) -> bool {
        (self.0)(ctx, value, column)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rule(..)")
    }
}

/// A column in a table.
#[derive(Clone, Debug)]
pub struct ColumnDescriptor {
    name: String,
    alias: String,
    column_type: ColumnType,
    pattern: Option<regex::Regex>,
    rule: Option<Rule>,
}

impl ColumnDescriptor {
    pub fn new(name: String, column_type: ColumnType) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidDefinition(
                "Column names may not be empty".into(),
            ));
        }

        Ok(Self {
            alias: name.clone(),
            name,
            column_type,
            pattern: None,
            rule: None,
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_alias(&self) -> &str {
        &self.alias
    }

    pub fn get_column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn get_pattern(&self) -> Option<&regex::Regex> {
        self.pattern.as_ref()
    }

    pub fn get_rule(&self) -> Option<&Rule> {
        self.rule.as_ref()
    }

    pub fn set_alias(&mut self, alias: impl Into<String>) -> &mut Self {
        self.alias = alias.into();
        self
    }

    pub fn set_pattern(&mut self, pattern: &str) -> Result<&mut Self> {
        let re = regex::Regex::new(pattern).map_err(|e| {
            Error::InvalidDefinition(format!("{}: bad pattern {}: {}", self.name, pattern, e))
        })?;
        self.pattern = Some(re);
        Ok(self)
    }

    pub fn set_rule(&mut self, rule: Rule) -> &mut Self {
        self.rule = Some(rule);
        self
    }
}

/// Description of a table.
#[derive(Clone, Debug)]
pub struct TableDescriptor {
    name: String,
    alias: Option<String>,
    columns: Vec<ColumnDescriptor>,
    /// Names and aliases, both mapping to the column's index.
    lookup: HashMap<String, usize>,
    primary_key: Vec<usize>,
    unique_keys: Vec<Vec<usize>>,
    group_by: Option<usize>,
    join_clause: Option<String>,
    for_null_primary: Option<String>,
    select_null_primary: Option<String>,
}

impl TableDescriptor {
    /// The SQL name of the table.
    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The alias if there is one, otherwise the SQL name.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn iter_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_at(&self, index: usize) -> &ColumnDescriptor {
        &self.columns[index]
    }

    /// Resolve a column name or alias to its index.
    pub fn column_index(&self, name_or_alias: &str) -> Result<usize> {
        self.lookup
            .get(name_or_alias)
            .copied()
            .ok_or_else(|| Error::UnknownColumn {
                table: self.display_name().to_string(),
                column: name_or_alias.to_string(),
            })
    }

    pub fn column(&self, name_or_alias: &str) -> Result<&ColumnDescriptor> {
        Ok(&self.columns[self.column_index(name_or_alias)?])
    }

    /// Indices of the primary key columns, in key order.
    pub fn primary_key(&self) -> &[usize] {
        &self.primary_key
    }

    pub fn unique_keys(&self) -> &[Vec<usize>] {
        &self.unique_keys
    }

    pub fn group_by(&self) -> Option<&ColumnDescriptor> {
        self.group_by.map(|i| &self.columns[i])
    }

    pub fn join_clause(&self) -> Option<&str> {
        self.join_clause.as_deref()
    }

    pub fn for_null_primary(&self) -> Option<&str> {
        self.for_null_primary.as_deref()
    }

    pub fn select_null_primary(&self) -> Option<&str> {
        self.select_null_primary.as_deref()
    }

    /// Tables built over a literal join clause can be read but not written.
    pub fn is_view(&self) -> bool {
        self.join_clause.is_some()
    }

    /// Fail with [Error::ReadOnlyView] if this table can't be written.
    pub fn check_writable(&self) -> Result<()> {
        if self.is_view() {
            return Err(Error::ReadOnlyView(self.display_name().to_string()));
        }
        Ok(())
    }

    /// The text to put after `FROM`.
    pub fn from_clause(&self) -> String {
        match &self.join_clause {
            Some(j) => format!("{} {}", self.name, j),
            None => self.name.clone(),
        }
    }
}

/// A helper to build tables.
pub struct TableBuilder {
    name: String,
    alias: Option<String>,
    columns: Vec<ColumnDescriptor>,
    primary_key: Vec<String>,
    unique_keys: Vec<Vec<String>>,
    group_by: Option<String>,
    join_clause: Option<String>,
    for_null_primary: Option<String>,
    select_null_primary: Option<String>,
}

impl TableBuilder {
    pub fn new(name: String) -> Self {
        Self {
            name,
            alias: None,
            columns: vec![],
            primary_key: vec![],
            unique_keys: vec![],
            group_by: None,
            join_clause: None,
            for_null_primary: None,
            select_null_primary: None,
        }
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.columns.iter().map(|x| x.get_name()).any(|x| x == name) {
            return Err(Error::InvalidDefinition(format!(
                "{}: duplicate column {}",
                self.name, name
            )));
        }
        Ok(())
    }

    pub fn add_column(&mut self, name: String, column_type: ColumnType) -> Result<&mut ColumnDescriptor> {
        self.check_name(&name)?;
        let idx = self.columns.len();
        self.columns.push(ColumnDescriptor::new(name, column_type)?);
        Ok(&mut self.columns[idx])
    }

    pub fn add_number_column(&mut self, name: String) -> Result<&mut ColumnDescriptor> {
        self.add_column(name, ColumnType::Number)
    }

    pub fn add_string_column(&mut self, name: String) -> Result<&mut ColumnDescriptor> {
        self.add_column(name, ColumnType::String)
    }

    pub fn add_nullable_number_column(&mut self, name: String) -> Result<&mut ColumnDescriptor> {
        self.add_column(name, ColumnType::NullableNumber)
    }

    pub fn add_nullable_string_column(&mut self, name: String) -> Result<&mut ColumnDescriptor> {
        self.add_column(name, ColumnType::NullableString)
    }

    pub fn set_alias(&mut self, alias: impl Into<String>) -> &mut Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn set_primary_key<S: Into<String>>(&mut self, columns: impl IntoIterator<Item = S>) -> &mut Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn add_unique_key<S: Into<String>>(&mut self, columns: impl IntoIterator<Item = S>) -> &mut Self {
        self.unique_keys
            .push(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn set_group_by(&mut self, column: impl Into<String>) -> &mut Self {
        self.group_by = Some(column.into());
        self
    }

    pub fn set_join_clause(&mut self, clause: impl Into<String>) -> &mut Self {
        self.join_clause = Some(clause.into());
        self
    }

    pub fn set_for_null_primary(&mut self, expr: impl Into<String>) -> &mut Self {
        self.for_null_primary = Some(expr.into());
        self
    }

    pub fn set_select_null_primary(&mut self, query: impl Into<String>) -> &mut Self {
        self.select_null_primary = Some(query.into());
        self
    }

    /// Resolve a key column, adding it with the default type if the table doesn't declare it.
    fn key_column(&mut self, lookup: &mut HashMap<String, usize>, name: &str) -> Result<usize> {
        if let Some(i) = lookup.get(name) {
            return Ok(*i);
        }

        self.columns
            .push(ColumnDescriptor::new(name.to_string(), ColumnType::default())?);
        let idx = self.columns.len() - 1;
        lookup.insert(name.to_string(), idx);
        Ok(idx)
    }

    pub fn build(mut self) -> Result<TableDescriptor> {
        if self.name.is_empty() {
            return Err(Error::InvalidDefinition("Table names may not be empty".into()));
        }

        let mut lookup: HashMap<String, usize> = Default::default();
        for (i, c) in self.columns.iter().enumerate() {
            for key in [c.get_name(), c.get_alias()] {
                match lookup.insert(key.to_string(), i) {
                    Some(prev) if prev != i => {
                        return Err(Error::InvalidDefinition(format!(
                            "{}: {} names more than one column",
                            self.name, key
                        )));
                    }
                    _ => {}
                }
            }
        }

        let pk_names = std::mem::take(&mut self.primary_key);
        let mut primary_key = vec![];
        for n in pk_names.iter() {
            let idx = self.key_column(&mut lookup, n)?;
            if primary_key.contains(&idx) {
                return Err(Error::InvalidDefinition(format!(
                    "{}: {} appears twice in the primary key",
                    self.name, n
                )));
            }
            primary_key.push(idx);
        }

        let uk_names = std::mem::take(&mut self.unique_keys);
        let mut unique_keys = vec![];
        for key in uk_names.iter() {
            let mut resolved = vec![];
            for n in key.iter() {
                resolved.push(self.key_column(&mut lookup, n)?);
            }
            unique_keys.push(resolved);
        }

        let group_by = match self.group_by.as_deref() {
            Some(g) => Some(*lookup.get(g).ok_or_else(|| Error::UnknownColumn {
                table: self.name.clone(),
                column: g.to_string(),
            })?),
            None => None,
        };

        Ok(TableDescriptor {
            name: self.name,
            alias: self.alias,
            columns: self.columns,
            lookup,
            primary_key,
            unique_keys,
            group_by,
            join_clause: self.join_clause,
            for_null_primary: self.for_null_primary,
            select_null_primary: self.select_null_primary,
        })
    }
}

/// One secondary table of a join.
#[derive(Clone, Debug)]
pub struct JoinLink {
    /// The table being linked in.
    pub table: String,
    /// `(source column, target column)` pairs.  Source columns belong to the join's primary table, or to
    /// `on_secondary` if set.
    pub on: Vec<(String, String)>,
    /// An already-linked table to use as the source side of this link.
    pub on_secondary: Option<String>,
}

/// Description of a join between tables of one schema.
#[derive(Clone, Debug)]
pub struct JoinDescriptor {
    name: String,
    primary: String,
    tables: Vec<String>,
    links: Vec<JoinLink>,
}

impl JoinDescriptor {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_primary(&self) -> &str {
        &self.primary
    }

    pub fn iter_links(&self) -> impl Iterator<Item = &JoinLink> {
        self.links.iter()
    }

    /// Every table the join mentions: the primary, the declared members, link targets, and on_secondary sources, in
    /// first-mention order.
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut ret: Vec<&str> = vec![&self.primary];
        let mentions = self.tables.iter().map(|x| x.as_str()).chain(
            self.links
                .iter()
                .flat_map(|l| l.on_secondary.as_deref().into_iter().chain([l.table.as_str()])),
        );
        for t in mentions {
            if !ret.contains(&t) {
                ret.push(t);
            }
        }
        ret
    }
}

/// A helper to build joins.
pub struct JoinBuilder {
    name: String,
    primary: String,
    tables: Vec<String>,
    links: Vec<JoinLink>,
}

impl JoinBuilder {
    pub fn new(name: String, primary: String) -> Self {
        Self {
            name,
            primary,
            tables: vec![],
            links: vec![],
        }
    }

    /// Declare a member table.  Declared tables which no link reaches make the join fail to resolve.
    pub fn add_table(&mut self, table: impl Into<String>) -> &mut Self {
        self.tables.push(table.into());
        self
    }

    /// Link `table` to the primary table on `source = target` column pairs.
    pub fn link(&mut self, table: impl Into<String>, on: &[(&str, &str)]) -> &mut Self {
        self.push_link(table.into(), on, None)
    }

    /// Link `table` to the already-linked `secondary` on `source = target` column pairs.
    pub fn link_on_secondary(
        &mut self,
        secondary: impl Into<String>,
        table: impl Into<String>,
        on: &[(&str, &str)],
    ) -> &mut Self {
        self.push_link(table.into(), on, Some(secondary.into()))
    }

    pub fn push_link(
        &mut self,
        table: String,
        on: &[(&str, &str)],
        on_secondary: Option<String>,
    ) -> &mut Self {
        self.links.push(JoinLink {
            table,
            on: on
                .iter()
                .map(|(s, t)| (s.to_string(), t.to_string()))
                .collect(),
            on_secondary,
        });
        self
    }

    pub fn build(self) -> Result<JoinDescriptor> {
        if self.name.is_empty() {
            return Err(Error::InvalidDefinition("Join names may not be empty".into()));
        }
        if let Some(l) = self.links.iter().find(|l| l.on.is_empty()) {
            return Err(Error::InvalidDefinition(format!(
                "{}: link to {} has no column pairs",
                self.name, l.table
            )));
        }

        Ok(JoinDescriptor {
            name: self.name,
            primary: self.primary,
            tables: self.tables,
            links: self.links,
        })
    }
}

/// Everything needed to register a schema.
#[derive(Clone, Debug)]
pub struct SchemaDescriptor {
    name: String,
    limit_template: String,
    tables: Vec<TableDescriptor>,
    joins: Vec<JoinDescriptor>,
    table_aliases: Vec<(String, String)>,
}

pub const DEFAULT_LIMIT_TEMPLATE: &str = "LIMIT %count% OFFSET %offset%";

impl SchemaDescriptor {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_limit_template(&self) -> &str {
        &self.limit_template
    }

    pub fn iter_tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.iter()
    }

    pub fn iter_joins(&self) -> impl Iterator<Item = &JoinDescriptor> {
        self.joins.iter()
    }

    /// `(alias, table)` pairs.
    pub fn iter_table_aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.table_aliases
            .iter()
            .map(|(a, t)| (a.as_str(), t.as_str()))
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        String,
        Vec<TableDescriptor>,
        Vec<JoinDescriptor>,
        Vec<(String, String)>,
    ) {
        (
            self.name,
            self.limit_template,
            self.tables,
            self.joins,
            self.table_aliases,
        )
    }
}

/// A helper to build schemas.
pub struct SchemaBuilder {
    name: String,
    limit_template: String,
    tables: Vec<TableDescriptor>,
    joins: Vec<JoinDescriptor>,
    table_aliases: Vec<(String, String)>,
}

impl SchemaBuilder {
    pub fn new(name: String) -> Self {
        Self {
            name,
            limit_template: DEFAULT_LIMIT_TEMPLATE.to_string(),
            tables: vec![],
            joins: vec![],
            table_aliases: vec![],
        }
    }

    /// Set the limit clause template.  `%offset%` and `%count%` are replaced when a search asks for a limit.
    pub fn set_limit_template(&mut self, template: impl Into<String>) -> &mut Self {
        self.limit_template = template.into();
        self
    }

    pub fn add_table(
        &mut self,
        name: String,
        build: impl FnOnce(&mut TableBuilder) -> Result<()>,
    ) -> Result<()> {
        let mut tb = TableBuilder::new(name);
        build(&mut tb)?;
        self.tables.push(tb.build()?);
        Ok(())
    }

    pub fn add_join(
        &mut self,
        name: String,
        primary: String,
        build: impl FnOnce(&mut JoinBuilder) -> Result<()>,
    ) -> Result<()> {
        let mut jb = JoinBuilder::new(name, primary);
        build(&mut jb)?;
        self.joins.push(jb.build()?);
        Ok(())
    }

    pub fn add_table_alias(&mut self, alias: String, table: String) -> &mut Self {
        self.table_aliases.push((alias, table));
        self
    }

    pub fn build(self) -> Result<SchemaDescriptor> {
        if self.name.is_empty() {
            return Err(Error::InvalidDefinition("Schema names may not be empty".into()));
        }

        Ok(SchemaDescriptor {
            name: self.name,
            limit_template: self.limit_template,
            tables: self.tables,
            joins: self.joins,
            table_aliases: self.table_aliases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_table() -> TableDescriptor {
        let mut tb = TableBuilder::new("people".into());
        tb.add_number_column("person_id".into())
            .unwrap()
            .set_alias("id");
        tb.add_string_column("full_name".into()).unwrap();
        tb.set_primary_key(["id"]).add_unique_key(["email"]);
        tb.build().unwrap()
    }

    #[test]
    fn aliases_resolve_to_one_column() {
        let t = build_table();
        assert_eq!(t.column_index("id").unwrap(), 0);
        assert_eq!(t.column_index("person_id").unwrap(), 0);
        assert_eq!(t.column("full_name").unwrap().get_alias(), "full_name");
        assert!(matches!(
            t.column_index("nope"),
            Err(Error::UnknownColumn { .. })
        ));
    }

    #[test]
    fn keys_are_normalized_and_auto_added() {
        let t = build_table();
        assert_eq!(t.primary_key(), &[0]);
        // email wasn't declared, so it got added with the default type.
        let email = t.column("email").unwrap();
        assert_eq!(email.get_column_type(), ColumnType::NullableString);
        assert_eq!(t.unique_keys(), &[vec![2]]);
    }

    #[test]
    fn alias_collisions_are_rejected() {
        let mut tb = TableBuilder::new("t".into());
        tb.add_number_column("a".into()).unwrap();
        tb.add_number_column("b".into()).unwrap().set_alias("a");
        assert!(matches!(tb.build(), Err(Error::InvalidDefinition(_))));
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let mut tb = TableBuilder::new("t".into());
        tb.add_number_column("a".into()).unwrap();
        assert!(tb.add_string_column("a".into()).is_err());
    }

    #[test]
    fn views_are_read_only() {
        let mut tb = TableBuilder::new("a".into());
        tb.set_join_clause("JOIN b ON a.id = b.a_id");
        let t = tb.build().unwrap();
        assert_eq!(t.from_clause(), "a JOIN b ON a.id = b.a_id");
        assert!(matches!(t.check_writable(), Err(Error::ReadOnlyView(_))));
    }

    #[test]
    fn join_mentions() {
        let mut jb = JoinBuilder::new("j".into(), "tab4".into());
        jb.link("tab3", &[("tab3_ref", "tab3_id")])
            .link_on_secondary("tab3", "tab1", &[("tab1_ref", "tab1_id")])
            .add_table("tab9");
        let j = jb.build().unwrap();
        assert_eq!(j.referenced_tables(), vec!["tab4", "tab9", "tab3", "tab1"]);
    }
}
