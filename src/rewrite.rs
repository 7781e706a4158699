//! The top-down pass.
//!
//! Given the set its parent requires, a node intersects it with what it
//! can produce, fixes one onion/level/key, and emits its ciphertext form.
//! Children are rewritten at the choices recorded by gather, so both passes
//! agree. A column whose onion is above the chosen level cannot be used
//! yet: rewriting stops with [`Error::OnionAdjust`].

use tracing::debug;

use crate::adjust::OnionAdjustment;
use crate::analysis::Analysis;
use crate::crypto::{EncLayer, HomLayer, SearchLayer};
use crate::enc_set::{EncSet, FieldRef, Olk};
use crate::encoding::Value;
use crate::error::{test_unexpected_security_level, Error, Result};
use crate::expr::{ColumnRef, Id, Language, RecExpr, SqlArena, SqlExpr};
use crate::onions::{Onion, SecLevel};
use crate::rewrite_plan::RewritePlan;
use crate::schema::OnionMeta;

#[derive(Clone, Debug, PartialEq)]
pub struct Rewritten {
    pub sql: String,
    pub olk: Olk,
}

/// Encrypts `v` through the layers of `om` up to and including `level`.
pub fn encrypt_to_level(om: &OnionMeta, v: &Value, level: SecLevel, salt: u64) -> Result<Value> {
    let mut v = v.clone();
    if level == SecLevel::PlainVal {
        return Ok(v);
    }
    for layer in om.layers() {
        v = layer.encrypt(&v, salt)?;
        if layer.level() == level {
            return Ok(v);
        }
    }
    Err(Error::unexpected_security_level(om.onion, level, om.level()))
}

/// Writes `column` the way the server knows it.
pub fn qualified(qualifier: Option<&str>, column: &str) -> String {
    match qualifier {
        Some(q) => format!("{q}.{column}"),
        None => column.to_string(),
    }
}

fn onion_of<'a>(a: &'a Analysis, key: &FieldRef, onion: Onion) -> Result<&'a OnionMeta> {
    a.get_field(key)?
        .onion(onion)
        .ok_or_else(|| Error::identifier_not_found(format!("{key} {onion}")))
}

fn hom_layer<'a>(a: &'a Analysis, olk: &Olk) -> Result<&'a HomLayer> {
    let key = keyed(olk)?;
    onion_of(a, key, Onion::Agg)?
        .layers()
        .into_iter()
        .find_map(|l| match l {
            EncLayer::Hom(h) => Some(h.as_ref()),
            _ => None,
        })
        .ok_or_else(|| Error::text(format!("{key} has no homomorphic layer")))
}

fn modulus(h: &HomLayer) -> String {
    Value::Blob(h.public_modulus().to_be_bytes().to_vec()).to_sql()
}

#[track_caller]
fn keyed(olk: &Olk) -> Result<&FieldRef> {
    olk.key
        .as_ref()
        .ok_or_else(|| Error::text(format!("{olk} is not bound to a field")))
}

fn constant(a: &mut Analysis, value: Value, olk: &Olk) -> Result<String> {
    if olk.is_plain() {
        return Ok(value.to_sql());
    }
    let key = keyed(olk)?;
    let salt = a.salt_for(key);
    let om = onion_of(a, key, olk.onion)?;
    Ok(encrypt_to_level(om, &value, olk.level, salt)?.to_sql())
}

fn column(a: &Analysis, c: &ColumnRef, olk: &Olk) -> Result<String> {
    let resolved = a.resolve_column(c)?;
    let om = onion_of(a, &resolved.field, olk.onion)?;
    let current = om.level();
    if current > olk.level {
        return Err(Error::OnionAdjust(OnionAdjustment {
            field: resolved.field,
            onion: olk.onion,
            to_level: olk.level,
        }));
    }
    test_unexpected_security_level(olk.onion, olk.level, current)?;
    Ok(qualified(resolved.qualifier.as_deref(), &om.anon_name))
}

fn child(a: &mut Analysis, expr: &RecExpr, plan: &RewritePlan, c: Id) -> Result<String> {
    let olk = plan
        .child_olk(c)
        .ok_or_else(|| Error::text(format!("no rewrite choice recorded for {}", expr.to_sql(c))))?;
    let sql = rewrite(a, expr, c, &EncSet::from_olk(olk))?.sql;
    Ok(if expr[c].is_connective() { format!("({sql})") } else { sql })
}

fn search(a: &mut Analysis, expr: &RecExpr, plan: &RewritePlan, l: Id, r: Id) -> Result<String> {
    let l_olk = plan
        .child_olk(l)
        .ok_or_else(|| Error::text("no rewrite choice recorded for LIKE"))?;
    if l_olk.onion != Onion::Swp {
        return Ok(format!("{} LIKE {}", child(a, expr, plan, l)?, child(a, expr, plan, r)?));
    }
    let SqlExpr::Text(pattern) = &expr[r] else {
        return Err(Error::text(format!("LIKE pattern {} must be a string", expr.to_sql(r))));
    };
    let keyword = SearchLayer::keyword(pattern)?;
    let token = onion_of(a, keyed(l_olk)?, Onion::Swp)?
        .layers()
        .into_iter()
        .find_map(|layer| match layer {
            EncLayer::Search(s) => Some(s.token(&keyword)),
            _ => None,
        })
        .ok_or_else(|| Error::text("search onion has no search layer"))??;
    let column = child(a, expr, plan, l)?;
    Ok(format!("cdb_search({column}, {})", Value::Blob(token).to_sql()))
}

/// Rewrites the subtree rooted at `id` so that it produces one of `req`.
pub fn rewrite(a: &mut Analysis, expr: &RecExpr, id: Id, req: &EncSet) -> Result<Rewritten> {
    let plan = a.plan(id)?.clone();
    let solution = plan.es_out.intersect(req);
    let olk = solution
        .choose_one()
        .map_err(|_| Error::no_available_enc_set(expr.to_sql(id), req, plan.reason.clone()))?;

    let sql = match &expr[id] {
        SqlExpr::True => "TRUE".to_string(),
        SqlExpr::False => "FALSE".to_string(),
        SqlExpr::Null => "NULL".to_string(),
        SqlExpr::Int(i) => constant(a, Value::Int(*i), &olk)?,
        SqlExpr::Text(s) => constant(a, Value::Text(s.clone()), &olk)?,
        SqlExpr::Column(c) => column(a, c, &olk)?,
        SqlExpr::CountStar => "COUNT(*)".to_string(),
        SqlExpr::Not(c) => format!("NOT {}", child(a, expr, &plan, *c)?),
        SqlExpr::IsNull(c) => format!("{} IS NULL", child(a, expr, &plan, *c)?),
        SqlExpr::Count(c) => format!("COUNT({})", child(a, expr, &plan, *c)?),
        SqlExpr::CountDistinct(c) => format!("COUNT(DISTINCT {})", child(a, expr, &plan, *c)?),
        SqlExpr::Min(c) => format!("MIN({})", child(a, expr, &plan, *c)?),
        SqlExpr::Max(c) => format!("MAX({})", child(a, expr, &plan, *c)?),
        SqlExpr::Sum(c) if olk.onion == Onion::Agg => {
            let n2 = modulus(hom_layer(a, &olk)?);
            format!("cdb_hom_sum({}, {n2})", child(a, expr, &plan, *c)?)
        }
        SqlExpr::Sum(c) => format!("SUM({})", child(a, expr, &plan, *c)?),
        SqlExpr::Plus([l, r]) if olk.onion == Onion::Agg => {
            let n2 = modulus(hom_layer(a, &olk)?);
            let (l, r) = (child(a, expr, &plan, *l)?, child(a, expr, &plan, *r)?);
            format!("cdb_hom_add({l}, {r}, {n2})")
        }
        SqlExpr::Like([l, r]) => search(a, expr, &plan, *l, *r)?,
        SqlExpr::InList(c) => {
            let mut items = Vec::with_capacity(c.len());
            for i in c.iter() {
                items.push(child(a, expr, &plan, *i)?);
            }
            format!("{} IN ({})", items[0], items[1..].join(", "))
        }
        node => {
            let [l, r] = [node.children()[0], node.children()[1]];
            let op = node
                .operator()
                .ok_or_else(|| Error::text(format!("no operator for {}", expr.to_sql(id))))?;
            let (l, r) = (child(a, expr, &plan, l)?, child(a, expr, &plan, r)?);
            format!("{l} {op} {r}")
        }
    };
    debug!(item = %expr.to_sql(id), %olk, "rewritten");
    Ok(Rewritten { sql, olk })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::analysis::tests::emp_schema;
    use crate::gather::gather;
    use crate::onions::{FieldType, OnionLayout};
    use crate::schema::tests::MASTER;
    use crate::schema::{AnyMeta, DatabaseMeta, FieldMeta, MetaKey, MetaPath, SchemaInfo, TableMeta};

    /// `id` peeled to DET and OPE, `salary` with an order onion only.
    fn peeled_schema() -> SchemaInfo {
        use SecLevel::*;
        let mut table = TableMeta::new("emp", true);
        let id = FieldMeta::with_onions(
            "id",
            FieldType::Int,
            OnionLayout::Num,
            &[(Onion::Det, vec![DetJoin, Det]), (Onion::Ord, vec![Ope])],
            table.lease_uniq(),
            &MASTER,
        )
        .unwrap();
        let salary = FieldMeta::with_onions(
            "salary",
            FieldType::Int,
            OnionLayout::Num,
            &[(Onion::Ord, vec![Ope])],
            table.lease_uniq(),
            &MASTER,
        )
        .unwrap();
        table.add_field(id).unwrap();
        table.add_field(salary).unwrap();
        let mut schema = SchemaInfo::new();
        schema
            .node_mut(&MetaPath::root())
            .unwrap()
            .add(MetaKey::identity("db"), AnyMeta::Database(DatabaseMeta::new("db")))
            .unwrap();
        schema
            .node_mut(&MetaPath::database("db"))
            .unwrap()
            .add(MetaKey::identity("emp"), AnyMeta::Table(table))
            .unwrap();
        schema
    }

    fn analysis(schema: SchemaInfo) -> Analysis {
        let mut a = Analysis::new(Arc::new(schema), "db");
        a.add_table("emp", None).unwrap();
        a
    }

    fn predicate(e: &mut RecExpr, field: &str, value: i64) -> Id {
        let c = e.add(SqlExpr::Column(ColumnRef::new(None, field)));
        let v = e.add(SqlExpr::Int(value));
        e.add(SqlExpr::Eq([c, v]))
    }

    #[test]
    fn equality_on_a_peeled_field() {
        let schema = peeled_schema();
        let id = FieldRef::new("db", "emp", "id");
        let om = schema.get_field(&id).unwrap().onion(Onion::Det).unwrap().clone();
        let mut a = analysis(schema);
        let mut e = RecExpr::default();
        let root = predicate(&mut e, "id", 5);
        gather(&mut a, &e, root).unwrap();
        let out = rewrite(&mut a, &e, root, &EncSet::plain()).unwrap();
        let expected = encrypt_to_level(&om, &Value::Int(5), SecLevel::Det, 0).unwrap();
        assert_eq!(out.sql, format!("{} = {}", om.anon_name, expected.to_sql()));
        assert!(out.olk.is_plain());
    }

    #[test]
    fn equality_without_an_equality_onion() {
        let mut a = analysis(peeled_schema());
        let mut e = RecExpr::default();
        let root = predicate(&mut e, "salary", 5);
        assert!(matches!(
            gather(&mut a, &e, root),
            Err(Error::NoAvailableEncSet { .. })
        ));
    }

    #[test]
    fn equality_above_det_asks_for_an_adjustment() {
        let mut a = analysis(emp_schema());
        let mut e = RecExpr::default();
        let root = predicate(&mut e, "id", 5);
        gather(&mut a, &e, root).unwrap();
        match rewrite(&mut a, &e, root, &EncSet::plain()) {
            Err(Error::OnionAdjust(adj)) => {
                assert_eq!(adj.field, FieldRef::new("db", "emp", "id"));
                assert_eq!((adj.onion, adj.to_level), (Onion::Det, SecLevel::Det));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rewriting_twice_gives_the_same_text() {
        let mut a = analysis(peeled_schema());
        let mut e = RecExpr::default();
        let c = e.add(SqlExpr::Column(ColumnRef::new(None, "salary")));
        let v = e.add(SqlExpr::Int(-40));
        let lt = e.add(SqlExpr::Lt([c, v]));
        let root = predicate(&mut e, "id", 7);
        let and = e.add(SqlExpr::And([lt, root]));
        gather(&mut a, &e, and).unwrap();
        let first = rewrite(&mut a, &e, and, &EncSet::plain()).unwrap();
        let second = rewrite(&mut a, &e, and, &EncSet::plain()).unwrap();
        assert_eq!(first, second);
        assert!(first.sql.contains(" < "));
        assert!(first.sql.contains(" AND "));
    }

    #[test]
    fn projection_prefers_det() {
        let mut a = analysis(emp_schema());
        let mut e = RecExpr::default();
        let c = e.add(SqlExpr::Column(ColumnRef::new(None, "salary")));
        gather(&mut a, &e, c).unwrap();
        let out = rewrite(&mut a, &e, c, &EncSet::full()).unwrap();
        assert_eq!((out.olk.onion, out.olk.level), (Onion::Det, SecLevel::Rnd));
    }

    #[test]
    fn homomorphic_sum_and_search() {
        let mut a = analysis(emp_schema());
        let mut e = RecExpr::default();
        let s = e.add(SqlExpr::Column(ColumnRef::new(None, "salary")));
        let sum = e.add(SqlExpr::Sum(s));
        gather(&mut a, &e, sum).unwrap();
        let out = rewrite(&mut a, &e, sum, &EncSet::full()).unwrap();
        assert!(out.sql.starts_with("cdb_hom_sum("));
        assert_eq!(out.olk.onion, Onion::Agg);

        let n = e.add(SqlExpr::Column(ColumnRef::new(None, "name")));
        let p = e.add(SqlExpr::Text("%Bob%".into()));
        let like = e.add(SqlExpr::Like([n, p]));
        gather(&mut a, &e, like).unwrap();
        let out = rewrite(&mut a, &e, like, &EncSet::plain()).unwrap();
        assert!(out.sql.starts_with("cdb_search("));
        assert!(out.sql.contains("X'"));
    }

    #[test]
    fn comparison_cannot_be_projected_encrypted() {
        let mut a = analysis(peeled_schema());
        let mut e = RecExpr::default();
        let root = predicate(&mut e, "id", 1);
        gather(&mut a, &e, root).unwrap();
        let det_only = EncSet::new([(Onion::Det, SecLevel::Det, None)]);
        assert!(matches!(
            rewrite(&mut a, &e, root, &det_only),
            Err(Error::NoAvailableEncSet { .. })
        ));
    }
}
