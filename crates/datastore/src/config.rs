//! Declarative schema definitions.
//!
//! A schema can be written out as JSON and turned into a [SchemaDescriptor]:
//!
//! ```json
//! {
//!     "name": "shop",
//!     "tables": [
//!         {
//!             "name": "customers",
//!             "columns": [
//!                 { "name": "customer_id", "alias": "id", "type": "number" },
//!                 { "name": "email", "type": "string", "pattern": "^[^@]+@[^@]+$" }
//!             ],
//!             "primary_key": ["customer_id"]
//!         }
//!     ],
//!     "joins": [
//!         { "name": "orders_full", "primary": "orders", "links": [{ "table": "customers", "on": { "customer": "customer_id" } }] }
//!     ]
//! }
//! ```
//!
//! Custom rules can't be written in JSON, so columns name them and [SchemaConfig::build] looks the names up in a
//! [RuleSet].
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use crate::descriptor::{ColumnType, JoinBuilder, Rule, SchemaBuilder, SchemaDescriptor, TableBuilder};
use crate::errors::{Error, Result};

/// Named custom rules available to declarative schemas.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    rules: HashMap<String, Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, name: impl Into<String>, rule: Rule) -> &mut Self {
        self.rules.insert(name.into(), rule);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(rename = "type", default)]
    pub column_type: ColumnType,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Name of a rule in the [RuleSet] passed to [SchemaConfig::build].
    #[serde(default)]
    pub rule: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub unique_keys: Vec<Vec<String>>,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub join_clause: Option<String>,
    #[serde(default)]
    pub for_null_primary: Option<String>,
    #[serde(default)]
    pub select_null_primary: Option<String>,
}

/// Read a JSON object as its key/value pairs, keeping the order they were written in.
fn ordered_pairs<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<(String, String)>, D::Error> {
    struct PairsVisitor;

    impl<'de> Visitor<'de> for PairsVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an object mapping source columns to target columns")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut ret = vec![];
            while let Some(pair) = map.next_entry::<String, String>()? {
                ret.push(pair);
            }
            Ok(ret)
        }
    }

    deserializer.deserialize_map(PairsVisitor)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    pub table: String,
    /// Source column to target column, in declaration order.
    #[serde(deserialize_with = "ordered_pairs")]
    pub on: Vec<(String, String)>,
    #[serde(default)]
    pub on_secondary: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinConfig {
    pub name: String,
    pub primary: String,
    /// Declared members.  If given, every one must be reached by a link.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaConfig {
    pub name: String,
    #[serde(default)]
    pub limit_template: Option<String>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
    #[serde(default)]
    pub joins: Vec<JoinConfig>,
    /// Alias to table name.
    #[serde(default)]
    pub table_aliases: BTreeMap<String, String>,
}

impl SchemaConfig {
    pub fn from_json(text: &str) -> Result<SchemaConfig> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn build(&self, rules: &RuleSet) -> Result<SchemaDescriptor> {
        let mut builder = SchemaBuilder::new(self.name.clone());
        if let Some(t) = self.limit_template.as_ref() {
            builder.set_limit_template(t.clone());
        }
        for t in self.tables.iter() {
            builder.add_table(t.name.clone(), |tb| t.apply(tb, rules))?;
        }
        for (alias, table) in self.table_aliases.iter() {
            builder.add_table_alias(alias.clone(), table.clone());
        }
        for j in self.joins.iter() {
            builder.add_join(j.name.clone(), j.primary.clone(), |jb| {
                j.apply(jb);
                Ok(())
            })?;
        }
        builder.build()
    }
}

impl TableConfig {
    fn apply(&self, tb: &mut TableBuilder, rules: &RuleSet) -> Result<()> {
        for c in self.columns.iter() {
            let col = tb.add_column(c.name.clone(), c.column_type)?;
            if let Some(a) = c.alias.as_ref() {
                col.set_alias(a.clone());
            }
            if let Some(p) = c.pattern.as_ref() {
                col.set_pattern(p)?;
            }
            if let Some(r) = c.rule.as_ref() {
                let rule = rules.get(r).ok_or_else(|| {
                    Error::InvalidDefinition(format!("{}.{}: unknown rule {}", self.name, c.name, r))
                })?;
                col.set_rule(rule.clone());
            }
        }

        if let Some(a) = self.alias.as_ref() {
            tb.set_alias(a.clone());
        }
        tb.set_primary_key(self.primary_key.iter().cloned());
        for k in self.unique_keys.iter() {
            tb.add_unique_key(k.iter().cloned());
        }
        if let Some(g) = self.group_by.as_ref() {
            tb.set_group_by(g.clone());
        }
        if let Some(j) = self.join_clause.as_ref() {
            tb.set_join_clause(j.clone());
        }
        if let Some(f) = self.for_null_primary.as_ref() {
            tb.set_for_null_primary(f.clone());
        }
        if let Some(s) = self.select_null_primary.as_ref() {
            tb.set_select_null_primary(s.clone());
        }
        Ok(())
    }
}

impl JoinConfig {
    fn apply(&self, jb: &mut JoinBuilder) {
        for t in self.tables.iter() {
            jb.add_table(t.clone());
        }
        for l in self.links.iter() {
            let on = l
                .on
                .iter()
                .map(|(s, t)| (s.as_str(), t.as_str()))
                .collect::<Vec<_>>();
            jb.push_link(l.table.clone(), &on, l.on_secondary.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::value::Value;

    const SHOP: &str = r#"{
        "name": "shop",
        "limit_template": "LIMIT %offset%, %count%",
        "tables": [
            {
                "name": "customers",
                "alias": "customer",
                "columns": [
                    { "name": "customer_id", "alias": "id", "type": "number" },
                    { "name": "email", "type": "string", "pattern": "^[^@]+@[^@]+$" },
                    { "name": "age", "type": "nullable-number", "rule": "adult" },
                    { "name": "notes" }
                ],
                "primary_key": ["customer_id"],
                "unique_keys": [["email"]],
                "for_null_primary": "NULL",
                "select_null_primary": "SELECT last_insert_rowid()"
            },
            {
                "name": "orders",
                "columns": [
                    { "name": "order_id", "type": "number" },
                    { "name": "customer", "type": "number" }
                ],
                "primary_key": ["order_id"]
            }
        ],
        "table_aliases": { "buyers": "customers" },
        "joins": [
            {
                "name": "orders_full",
                "primary": "orders",
                "links": [{ "table": "customers", "on": { "customer": "customer_id" } }]
            }
        ]
    }"#;

    fn rules() -> RuleSet {
        let mut rules = RuleSet::new();
        rules.add(
            "adult",
            Rule::new(|_, v, _| v.is_null() || v.as_i64().map(|a| a >= 18).unwrap_or(false)),
        );
        rules
    }

    #[test]
    fn parses_and_builds() {
        let config = SchemaConfig::from_json(SHOP).unwrap();
        let schema = config.build(&rules()).unwrap();
        assert_eq!(schema.get_name(), "shop");
        assert_eq!(schema.get_limit_template(), "LIMIT %offset%, %count%");

        let customers = schema.iter_tables().next().unwrap();
        assert_eq!(customers.display_name(), "customer");
        assert_eq!(customers.column("id").unwrap().get_name(), "customer_id");
        assert_eq!(
            customers.column("notes").unwrap().get_column_type(),
            ColumnType::NullableString
        );
        assert!(customers.column("email").unwrap().get_pattern().is_some());
        assert_eq!(customers.primary_key(), &[0]);
        assert_eq!(customers.unique_keys(), &[vec![1]]);

        let rule = customers.column("age").unwrap().get_rule().unwrap();
        let ctx = crate::descriptor::RuleContext {
            table: customers,
            values: &[],
        };
        assert!(rule.check(&ctx, &Value::from(30), "age"));
        assert!(!rule.check(&ctx, &Value::from(3), "age"));

        assert_eq!(
            schema.iter_table_aliases().collect::<Vec<_>>(),
            vec![("buyers", "customers")]
        );
        assert_eq!(schema.iter_joins().count(), 1);
    }

    #[test]
    fn link_pairs_keep_their_order() {
        let config = SchemaConfig::from_json(
            r#"{
                "name": "s",
                "joins": [{ "name": "j", "primary": "a", "links": [{ "table": "b", "on": { "z_ref": "z", "a_ref": "a" } }] }]
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.joins[0].links[0].on,
            vec![("z_ref".to_string(), "z".to_string()), ("a_ref".to_string(), "a".to_string())]
        );

        let schema = config.build(&RuleSet::new()).unwrap();
        let link = schema.iter_joins().next().unwrap().iter_links().next().unwrap();
        assert_eq!(link.on[0].0, "z_ref");
    }

    #[test]
    fn unknown_rules_fail() {
        let config = SchemaConfig::from_json(SHOP).unwrap();
        assert!(matches!(
            config.build(&RuleSet::new()),
            Err(Error::InvalidDefinition(_))
        ));
    }

    #[test]
    fn bad_json_fails() {
        assert!(matches!(
            SchemaConfig::from_json(r#"{"name": "x", "tables": [{"name": "t", "columns": [{"name": "c", "type": "bogus"}]}]}"#),
            Err(Error::Config(_))
        ));
        assert!(SchemaConfig::from_json(r#"{"tables": []}"#).is_err());
    }
}
