//! Join resolution.
//!
//! A join starts from its primary table.  Links are walked in declaration order; each one adds a target table and
//! the equalities tying it to the table it hangs off (the primary, or an `on_secondary` table that an earlier link
//! already brought in).  Once every link has been walked, every table the join mentions must have been reached.
//!
//! The resulting [JoinPlan] is what statements are built from: the FROM list, the equalities to AND onto every WHERE,
//! and the column namespace.  Inside a join a column may be named:
//!
//! - by its short name or alias, if no other member table has a column of that name;
//! - as `table_column`, which is also the name it is selected under;
//! - as `table.column`.
use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use log::*;

use crate::descriptor::{JoinDescriptor, TableDescriptor};
use crate::errors::{Error, Result};

/// A table taking part in a join, under the name the join refers to it by.
#[derive(Clone, Debug)]
pub struct JoinMember {
    name: String,
    table: Arc<TableDescriptor>,
}

impl JoinMember {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_table(&self) -> &Arc<TableDescriptor> {
        &self.table
    }

    /// `sql_name AS name`, or just the name if they agree.
    fn from_item(&self) -> String {
        if self.table.get_name() == self.name {
            self.name.clone()
        } else {
            format!("{} AS {}", self.table.get_name(), self.name)
        }
    }
}

/// A column of a join: which member, and which column of that member's table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub member: usize,
    pub column: usize,
}

/// A resolved link: `source.pairs[i].0 = target.pairs[i].1`, as column indices.
#[derive(Clone, Debug)]
pub struct ResolvedLink {
    pub source: usize,
    pub target: usize,
    pub pairs: Vec<(usize, usize)>,
}

#[derive(Clone, Debug, Default)]
struct Namespace {
    qualified: HashMap<String, ColumnRef>,
    long: HashMap<String, ColumnRef>,
    /// `None` marks a short name more than one member uses.
    short: HashMap<String, Option<ColumnRef>>,
}

impl Namespace {
    fn add_short(&mut self, name: &str, r: ColumnRef) {
        self.short
            .entry(name.to_string())
            .and_modify(|e| {
                if *e != Some(r) {
                    *e = None;
                }
            })
            .or_insert(Some(r));
    }
}

#[derive(Clone, Debug)]
pub struct JoinPlan {
    name: String,
    members: Vec<JoinMember>,
    links: Vec<ResolvedLink>,
    namespace: Namespace,
}

/// Resolve a join against the tables of a schema.
///
/// `lookup_table` maps a name used in the join to a table, as the schema would.
pub fn resolve(
    join: &JoinDescriptor,
    lookup_table: impl Fn(&str) -> Result<Arc<TableDescriptor>>,
) -> Result<JoinPlan> {
    let join_name = join.get_name();
    // Views carry their own FROM fragment and pre-qualified columns, which can't be re-qualified per member.
    let member = |name: &str| -> Result<JoinMember> {
        let table = lookup_table(name)?;
        if table.is_view() {
            return Err(Error::InvalidDefinition(format!(
                "join {}: {} is a view and can't be joined",
                join_name, name
            )));
        }
        Ok(JoinMember {
            name: name.to_string(),
            table,
        })
    };

    let mut members = vec![member(join.get_primary())?];
    let mut links = vec![];

    for link in join.iter_links() {
        let source_name = link.on_secondary.as_deref().unwrap_or(join.get_primary());
        let source = members
            .iter()
            .position(|m| m.name == source_name)
            .ok_or_else(|| Error::UnresolvedSecondaryReference {
                join: join_name.to_string(),
                reference: source_name.to_string(),
            })?;

        let target = match members.iter().position(|m| m.name == link.table) {
            Some(t) => t,
            None => {
                members.push(member(&link.table)?);
                members.len() - 1
            }
        };

        let mut pairs = vec![];
        for (s, t) in link.on.iter() {
            pairs.push((
                members[source].table.column_index(s)?,
                members[target].table.column_index(t)?,
            ));
        }
        trace!(
            "Join {}: {} reached from {} on {}",
            join_name,
            link.table,
            source_name,
            link.on.iter().map(|(s, t)| format!("{}={}", s, t)).join(", ")
        );
        links.push(ResolvedLink {
            source,
            target,
            pairs,
        });
    }

    let unreachable = join
        .referenced_tables()
        .into_iter()
        .filter(|t| !members.iter().any(|m| m.name == *t))
        .map(|t| t.to_string())
        .collect::<Vec<_>>();
    if !unreachable.is_empty() {
        return Err(Error::DisconnectedJoin {
            join: join_name.to_string(),
            unreachable,
        });
    }

    let mut namespace = Namespace::default();
    for (mi, m) in members.iter().enumerate() {
        for (ci, c) in m.table.iter_columns().enumerate() {
            let r = ColumnRef {
                member: mi,
                column: ci,
            };
            for n in [c.get_alias(), c.get_name()].into_iter().dedup() {
                namespace.qualified.insert(format!("{}.{}", m.name, n), r);
                namespace.long.insert(format!("{}_{}", m.name, n), r);
                namespace.add_short(n, r);
            }
        }
    }

    debug!(
        "Resolved join {} over {}",
        join_name,
        members.iter().map(|m| m.name.as_str()).join(", ")
    );

    Ok(JoinPlan {
        name: join_name.to_string(),
        members,
        links,
        namespace,
    })
}

impl JoinPlan {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[JoinMember] {
        &self.members
    }

    pub fn member(&self, index: usize) -> &JoinMember {
        &self.members[index]
    }

    /// The primary table is always member 0.
    pub fn primary(&self) -> &JoinMember {
        &self.members[0]
    }

    pub fn links(&self) -> &[ResolvedLink] {
        &self.links
    }

    /// Comma-separated FROM list.
    pub fn from_clause(&self) -> String {
        self.members.iter().map(|m| m.from_item()).join(", ")
    }

    /// `a.x = b.y` for every linked column pair, in link order.
    pub fn equalities(&self) -> Vec<String> {
        self.links
            .iter()
            .flat_map(|l| {
                l.pairs.iter().map(move |(s, t)| {
                    format!(
                        "{} = {}",
                        self.qualified(ColumnRef {
                            member: l.source,
                            column: *s
                        }),
                        self.qualified(ColumnRef {
                            member: l.target,
                            column: *t
                        })
                    )
                })
            })
            .collect()
    }

    /// Map a column name in any of the accepted forms to the column it names.
    pub fn resolve(&self, name: &str) -> Result<ColumnRef> {
        if let Some(r) = self.namespace.qualified.get(name) {
            return Ok(*r);
        }
        match self.namespace.short.get(name) {
            Some(Some(r)) => return Ok(*r),
            Some(None) => {
                return self.namespace.long.get(name).copied().ok_or_else(|| {
                    Error::AmbiguousColumn {
                        join: self.name.clone(),
                        column: name.to_string(),
                    }
                })
            }
            None => {}
        }
        self.namespace
            .long
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    /// `member.sql_column`.
    pub fn qualified(&self, r: ColumnRef) -> String {
        let m = &self.members[r.member];
        format!("{}.{}", m.name, m.table.column_at(r.column).get_name())
    }

    /// `member_alias`, the name a column is selected under.
    pub fn long_name(&self, r: ColumnRef) -> String {
        let m = &self.members[r.member];
        format!("{}_{}", m.name, m.table.column_at(r.column).get_alias())
    }

    /// Every column of every member, members in plan order.
    pub fn column_refs(&self) -> impl Iterator<Item = ColumnRef> + '_ {
        self.members.iter().enumerate().flat_map(|(mi, m)| {
            (0..m.table.column_count()).map(move |ci| ColumnRef {
                member: mi,
                column: ci,
            })
        })
    }

    /// Check that rows can be inserted through this join, returning the member order to insert in.
    ///
    /// Every link target must be generating its own primary key, and the link must be on exactly that key, so that
    /// the target can be inserted first and its new key copied into the source.  Targets come before sources.
    pub fn insert_order(&self) -> Result<Vec<usize>> {
        let not_insertable = |reason: String| Error::JoinNotInsertable {
            join: self.name.clone(),
            reason,
        };

        for m in self.members.iter() {
            m.table.check_writable()?;
        }

        for l in self.links.iter() {
            let target = &self.members[l.target];
            let mut linked = l.pairs.iter().map(|(_, t)| *t).collect::<Vec<_>>();
            let mut pk = target.table.primary_key().to_vec();
            linked.sort_unstable();
            pk.sort_unstable();
            if pk.is_empty() || linked != pk {
                return Err(not_insertable(format!(
                    "{} is not linked on its primary key",
                    target.name
                )));
            }
            if target.table.select_null_primary().is_none() {
                return Err(not_insertable(format!(
                    "{} doesn't generate its primary key",
                    target.name
                )));
            }
        }

        // Kahn's algorithm over source -> target edges, emitting targets first.
        let n = self.members.len();
        let mut pending_targets = vec![0usize; n];
        for l in self.links.iter() {
            if l.source == l.target {
                return Err(not_insertable(format!(
                    "{} is linked to itself",
                    self.members[l.source].name
                )));
            }
            pending_targets[l.source] += 1;
        }

        let mut order = vec![];
        let mut ready = (0..n)
            .filter(|i| pending_targets[*i] == 0)
            .collect::<Vec<_>>();
        while let Some(m) = ready.pop() {
            order.push(m);
            for l in self.links.iter().filter(|l| l.target == m) {
                pending_targets[l.source] -= 1;
                if pending_targets[l.source] == 0 {
                    ready.push(l.source);
                }
            }
        }

        if order.len() != n {
            return Err(not_insertable("the links form a cycle".into()));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::descriptor::{JoinBuilder, TableBuilder};

    /// tab1..tab4 from the classic four-table example: tab4 points at tab3 and tab2, tab3 points at tab1.
    fn tables() -> HashMap<String, Arc<TableDescriptor>> {
        let mut ret = HashMap::new();
        let specs: [(&str, &[&str]); 4] = [
            ("tab1", &["tab1_id", "name"]),
            ("tab2", &["tab2_id", "name"]),
            ("tab3", &["tab3_id", "tab1_ref", "name"]),
            ("tab4", &["tab4_id", "tab3_ref", "tab2_ref", "name"]),
        ];
        for (name, cols) in specs {
            let mut tb = TableBuilder::new(name.into());
            for c in cols.iter() {
                tb.add_nullable_number_column(c.to_string()).unwrap();
            }
            tb.set_primary_key([cols[0]])
                .set_select_null_primary("SELECT last_insert_rowid()");
            ret.insert(name.to_string(), Arc::new(tb.build().unwrap()));
        }
        ret
    }

    fn lookup(
        tables: &HashMap<String, Arc<TableDescriptor>>,
    ) -> impl Fn(&str) -> Result<Arc<TableDescriptor>> + '_ {
        move |name| {
            tables.get(name).cloned().ok_or_else(|| Error::UnknownTable {
                schema: "test".into(),
                table: name.into(),
            })
        }
    }

    fn four_way() -> JoinDescriptor {
        let mut jb = JoinBuilder::new("four".into(), "tab4".into());
        jb.link("tab3", &[("tab3_ref", "tab3_id")])
            .link("tab2", &[("tab2_ref", "tab2_id")])
            .link_on_secondary("tab3", "tab1", &[("tab1_ref", "tab1_id")]);
        jb.build().unwrap()
    }

    #[test]
    fn views_cannot_be_joined() {
        let mut tables = tables();
        let mut tb = TableBuilder::new("a".into());
        tb.add_number_column("a.id".into()).unwrap().set_alias("id");
        tb.add_string_column("b.label".into()).unwrap().set_alias("label");
        tb.set_join_clause("JOIN b ON a.id = b.a_id");
        tables.insert("a".into(), Arc::new(tb.build().unwrap()));

        let mut jb = JoinBuilder::new("as_primary".into(), "a".into());
        jb.link("tab1", &[("id", "tab1_id")]);
        assert!(matches!(
            resolve(&jb.build().unwrap(), lookup(&tables)),
            Err(Error::InvalidDefinition(_))
        ));

        let mut jb = JoinBuilder::new("as_target".into(), "tab1".into());
        jb.link("a", &[("tab1_id", "id")]);
        assert!(matches!(
            resolve(&jb.build().unwrap(), lookup(&tables)),
            Err(Error::InvalidDefinition(_))
        ));
    }

    #[test]
    fn four_way_join_resolves() {
        let t = tables();
        let plan = resolve(&four_way(), lookup(&t)).unwrap();
        assert_eq!(plan.from_clause(), "tab4, tab3, tab2, tab1");
        assert_eq!(
            plan.equalities(),
            vec![
                "tab4.tab3_ref = tab3.tab3_id",
                "tab4.tab2_ref = tab2.tab2_id",
                "tab3.tab1_ref = tab1.tab1_id",
            ]
        );
    }

    #[test]
    fn name_resolution() {
        let t = tables();
        let plan = resolve(&four_way(), lookup(&t)).unwrap();

        let r = plan.resolve("tab1_ref").unwrap();
        assert_eq!(plan.qualified(r), "tab3.tab1_ref");
        assert_eq!(plan.long_name(r), "tab3_tab1_ref");

        // Every table has a name column, so the short form is ambiguous.
        assert!(matches!(
            plan.resolve("name"),
            Err(Error::AmbiguousColumn { .. })
        ));
        let r = plan.resolve("tab2_name").unwrap();
        assert_eq!(plan.qualified(r), "tab2.name");
        let r = plan.resolve("tab1.name").unwrap();
        assert_eq!(plan.qualified(r), "tab1.name");

        assert!(matches!(
            plan.resolve("bogus"),
            Err(Error::UnknownColumn { .. })
        ));
    }

    #[test]
    fn secondary_must_come_first() {
        let t = tables();
        let mut jb = JoinBuilder::new("bad".into(), "tab4".into());
        jb.link_on_secondary("tab3", "tab1", &[("tab1_ref", "tab1_id")])
            .link("tab3", &[("tab3_ref", "tab3_id")]);
        let res = resolve(&jb.build().unwrap(), lookup(&t));
        assert!(matches!(
            res,
            Err(Error::UnresolvedSecondaryReference { .. })
        ));
    }

    #[test]
    fn declared_but_unlinked_table_is_disconnected() {
        let t = tables();
        let mut jb = JoinBuilder::new("partial".into(), "tab4".into());
        jb.add_table("tab3")
            .add_table("tab2")
            .link("tab3", &[("tab3_ref", "tab3_id")]);
        match resolve(&jb.build().unwrap(), lookup(&t)) {
            Err(Error::DisconnectedJoin { unreachable, .. }) => {
                assert_eq!(unreachable, vec!["tab2".to_string()])
            }
            x => panic!("Expected a disconnected join, got {:?}", x),
        }
    }

    #[test]
    fn unknown_link_column() {
        let t = tables();
        let mut jb = JoinBuilder::new("j".into(), "tab4".into());
        jb.link("tab3", &[("nope", "tab3_id")]);
        assert!(matches!(
            resolve(&jb.build().unwrap(), lookup(&t)),
            Err(Error::UnknownColumn { .. })
        ));
    }

    #[test]
    fn aliased_members() {
        let mut t = tables();
        let tab1 = t["tab1"].clone();
        t.insert("parent".into(), tab1.clone());
        t.insert("child".into(), tab1);
        let mut jb = JoinBuilder::new("self".into(), "child".into());
        jb.link("parent", &[("name", "tab1_id")]);
        let plan = resolve(&jb.build().unwrap(), lookup(&t)).unwrap();
        assert_eq!(plan.from_clause(), "tab1 AS child, tab1 AS parent");
        assert_eq!(plan.equalities(), vec!["child.name = parent.tab1_id"]);
    }

    #[test]
    fn insert_order_puts_targets_first() {
        let t = tables();
        let plan = resolve(&four_way(), lookup(&t)).unwrap();
        let order = plan.insert_order().unwrap();
        let pos = |name: &str| {
            order
                .iter()
                .position(|m| plan.member(*m).get_name() == name)
                .unwrap()
        };
        assert!(pos("tab1") < pos("tab3"));
        assert!(pos("tab3") < pos("tab4"));
        assert!(pos("tab2") < pos("tab4"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn links_off_the_key_are_not_insertable() {
        let t = tables();
        let mut jb = JoinBuilder::new("j".into(), "tab4".into());
        jb.link("tab3", &[("tab3_ref", "tab1_ref")]);
        let plan = resolve(&jb.build().unwrap(), lookup(&t)).unwrap();
        assert!(matches!(
            plan.insert_order(),
            Err(Error::JoinNotInsertable { .. })
        ));
    }

    proptest! {
        /// Links straight off the primary are independent of each other, so their order can't matter.
        #[test]
        fn link_order_does_not_change_reachability(
            linked in prop::sample::subsequence(vec!["tab1", "tab2", "tab3"], 0..=3)
                .prop_flat_map(|v| Just(v).prop_shuffle()),
        ) {
            let t = tables();
            let build = |targets: &[&str]| {
                let mut jb = JoinBuilder::new("j".into(), "tab4".into());
                jb.add_table("tab1").add_table("tab2").add_table("tab3");
                for target in targets {
                    jb.link(*target, &[("name", "name")]);
                }
                jb.build().unwrap()
            };
            let mut reversed = linked.clone();
            reversed.reverse();

            let a = resolve(&build(&linked), lookup(&t)).is_ok();
            let b = resolve(&build(&reversed), lookup(&t)).is_ok();
            prop_assert_eq!(a, b);
            prop_assert_eq!(a, linked.len() == 3);
        }
    }
}
