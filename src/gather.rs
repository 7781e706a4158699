//! The bottom-up pass.
//!
//! For every node, computes the [`EncSet`] it can be produced at and records
//! a [`RewritePlan`] saying at which onion and level its children are to be
//! rewritten. Operators intersect what their children can produce with
//! what they require; an empty intersection fails the whole statement.

use tracing::debug;

use crate::analysis::Analysis;
use crate::enc_set::{merge_complete_olk, EncSet, Olk};
use crate::error::{Error, Result};
use crate::expr::{Id, RecExpr, SqlArena, SqlExpr};
use crate::onions::FieldType;
use crate::rewrite_plan::{Reason, RewritePlan};

/// Gathers the subtree rooted at `id` and returns the root's output set.
pub fn gather(a: &mut Analysis, expr: &RecExpr, id: Id) -> Result<EncSet> {
    let node = expr.node(id)?;
    let item = expr.to_sql(id);
    let plan = match node {
        SqlExpr::Null => RewritePlan::leaf(EncSet::full(), Reason::new(&item, "null", EncSet::full())),
        SqlExpr::True | SqlExpr::False => {
            RewritePlan::leaf(EncSet::plain(), Reason::new(&item, "boolean", EncSet::plain()))
        }
        SqlExpr::Int(_) => RewritePlan::leaf(EncSet::full_int(), Reason::new(&item, "constant", EncSet::full_int())),
        SqlExpr::Text(_) => RewritePlan::leaf(EncSet::full_str(), Reason::new(&item, "constant", EncSet::full_str())),
        SqlExpr::Column(c) => {
            let resolved = a.resolve_column(c)?;
            let es = a.get_field(&resolved.field)?.enc_set(&resolved.field);
            RewritePlan::leaf(es.clone(), Reason::new(&item, "field", es))
        }
        SqlExpr::CountStar => {
            RewritePlan::leaf(EncSet::plain(), Reason::new(&item, "count(*)", EncSet::plain()))
        }

        SqlExpr::Eq([l, r]) | SqlExpr::NotEq([l, r]) => equality(a, expr, &item, *l, *r)?,
        SqlExpr::Lt(c) | SqlExpr::LtEq(c) | SqlExpr::Gt(c) | SqlExpr::GtEq(c) => {
            same_olk(a, expr, &item, c, &EncSet::order(), EncSet::plain(), "order")?
        }
        SqlExpr::And(c) | SqlExpr::Or(c) => {
            same_olk(a, expr, &item, c, &EncSet::plain(), EncSet::plain(), "connective")?
        }
        SqlExpr::Not(c) => same_olk(a, expr, &item, &[*c], &EncSet::plain(), EncSet::plain(), "negation")?,
        SqlExpr::Minus(c) | SqlExpr::Multiply(c) => {
            same_olk(a, expr, &item, c, &EncSet::plain(), EncSet::plain(), "arithmetic")?
        }
        SqlExpr::Plus([l, r]) => addition(a, expr, &item, *l, *r)?,
        SqlExpr::Like(c) => same_olk(a, expr, &item, c, &EncSet::search(), EncSet::plain(), "like")?,
        SqlExpr::InList(c) => same_olk(a, expr, &item, c, &EncSet::equality(), EncSet::plain(), "in list")?,
        SqlExpr::IsNull(c) | SqlExpr::Count(c) => {
            same_olk(a, expr, &item, &[*c], &EncSet::full(), EncSet::plain(), "any onion")?
        }
        SqlExpr::CountDistinct(c) => {
            same_olk(a, expr, &item, &[*c], &EncSet::equality(), EncSet::plain(), "count distinct")?
        }
        SqlExpr::Sum(c) => pass_through(a, expr, &item, *c, &EncSet::addition(), "sum")?,
        SqlExpr::Min(c) | SqlExpr::Max(c) if text_valued(a, expr, *c)? => {
            pass_through(a, expr, &item, *c, &EncSet::plain(), "min/max of text")?
        }
        SqlExpr::Min(c) | SqlExpr::Max(c) => pass_through(a, expr, &item, *c, &EncSet::order(), "min/max")?,
    };
    debug!(%item, es_out = %plan.es_out, "gathered");
    let es_out = plan.es_out.clone();
    a.record_plan(id, plan)?;
    Ok(es_out)
}

/// Whether `id` yields a string. Order-preserving ciphertexts of strings
/// cannot be decrypted, so anything returning them needs the plaintext.
fn text_valued(a: &Analysis, expr: &RecExpr, id: Id) -> Result<bool> {
    Ok(match expr.node(id)? {
        SqlExpr::Text(_) => true,
        SqlExpr::Column(c) => {
            let resolved = a.resolve_column(c)?;
            a.get_field(&resolved.field)?.field_type == FieldType::Str
        }
        _ => false,
    })
}

/// Gathers `child` and intersects its output with `required`.
fn require(a: &mut Analysis, expr: &RecExpr, item: &str, child: Id, required: &EncSet) -> Result<(EncSet, Reason)> {
    let es = gather(a, expr, child)?;
    let reason = a.plan(child)?.reason.clone();
    let out = es.intersect(required);
    if !out.available() {
        return Err(Error::no_available_enc_set(
            item,
            required,
            Reason::new(item, "child cannot satisfy the operator", out).with_child(reason),
        ));
    }
    Ok((out, reason))
}

/// All children rewritten at one onion and level, chosen from what every
/// child can produce under `required`.
fn same_olk(
    a: &mut Analysis,
    expr: &RecExpr,
    item: &str,
    children: &[Id],
    required: &EncSet,
    es_out: EncSet,
    why: &str,
) -> Result<RewritePlan> {
    let mut common = required.clone();
    let mut reason = Reason::new(item, why, es_out.clone());
    for child in children {
        let (es, child_reason) = require(a, expr, item, *child, required)?;
        common = common.intersect(&es);
        reason = reason.with_child(child_reason);
    }
    if !common.available() {
        return Err(Error::no_available_enc_set(item, required, reason));
    }
    let olk = common.choose_one()?;
    Ok(RewritePlan::one_olk(es_out, reason, olk, children.to_vec()))
}

/// Aggregates whose result is encrypted like their argument.
fn pass_through(a: &mut Analysis, expr: &RecExpr, item: &str, child: Id, required: &EncSet, why: &str) -> Result<RewritePlan> {
    let (es, child_reason) = require(a, expr, item, child, required)?;
    let olk = es.choose_one()?;
    let es_out = EncSet::from_olk(&olk);
    let reason = Reason::new(item, why, es_out.clone()).with_child(child_reason);
    Ok(RewritePlan::one_olk(es_out, reason, olk, vec![child]))
}

/// Equality either compares both sides under one key, or, between two
/// fields, compares their join-level ciphertexts each under its own key.
fn equality(a: &mut Analysis, expr: &RecExpr, item: &str, l: Id, r: Id) -> Result<RewritePlan> {
    let eq = EncSet::equality();
    let (l_es, l_reason) = require(a, expr, item, l, &eq)?;
    let (r_es, r_reason) = require(a, expr, item, r, &eq)?;
    let reason = Reason::new(item, "equality", EncSet::plain())
        .with_child(l_reason)
        .with_child(r_reason);

    let both = l_es.intersect(&r_es);
    if both.available() {
        let olk = both.choose_one()?;
        return Ok(RewritePlan::one_olk(EncSet::plain(), reason, olk, vec![l, r]));
    }

    let join = EncSet::join();
    let l_join = l_es.without_keys().intersect(&join);
    let r_join = r_es.without_keys().intersect(&join);
    let common = l_join.intersect(&r_join);
    let Some(choice) = common.iter().next() else {
        return Err(Error::no_available_enc_set(item, &join, reason));
    };
    let keyed = |es: &EncSet| {
        let key = es.get(choice.onion).and_then(|(_, k)| k.cloned());
        Olk::new(choice.onion, choice.level, key)
    };
    let (l_olk, r_olk) = (keyed(&l_es), keyed(&r_es));
    if !choice.is_plain() && (l_olk.key.is_none() || r_olk.key.is_none()) {
        return Err(Error::no_available_enc_set(item, &join, reason));
    }
    Ok(RewritePlan::per_child(EncSet::plain(), reason, vec![(l, l_olk), (r, r_olk)]))
}

/// Both sides must agree on one onion and level; their keys are merged.
fn addition(a: &mut Analysis, expr: &RecExpr, item: &str, l: Id, r: Id) -> Result<RewritePlan> {
    let add = EncSet::addition();
    let (l_es, l_reason) = require(a, expr, item, l, &add)?;
    let (r_es, r_reason) = require(a, expr, item, r, &add)?;
    let reason = Reason::new(item, "addition", EncSet::empty())
        .with_child(l_reason)
        .with_child(r_reason);
    let common = l_es.without_keys().intersect(&r_es.without_keys());
    let Some(choice) = common.iter().next() else {
        return Err(Error::no_available_enc_set(item, &add, reason));
    };
    let keyed = |es: &EncSet| {
        let key = es.get(choice.onion).and_then(|(_, k)| k.cloned());
        Olk::new(choice.onion, choice.level, key)
    };
    let olk = merge_complete_olk(&keyed(&l_es), &keyed(&r_es))?;
    if !olk.is_plain() && olk.key.is_none() {
        return Err(Error::no_available_enc_set(item, &add, reason));
    }
    let es_out = EncSet::from_olk(&olk);
    let reason = Reason { es: es_out.clone(), ..reason };
    Ok(RewritePlan::one_olk(es_out, reason, olk, vec![l, r]))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::analysis::tests::emp_schema;
    use crate::enc_set::FieldRef;
    use crate::expr::ColumnRef;
    use crate::onions::{Onion, SecLevel};
    use crate::rewrite_plan::PlanKind;

    fn analysis() -> Analysis {
        let mut a = Analysis::new(Arc::new(emp_schema()), "db");
        a.add_table("emp", None).unwrap();
        a
    }

    fn col(e: &mut RecExpr, name: &str) -> Id {
        e.add(SqlExpr::Column(ColumnRef::new(None, name)))
    }

    #[test]
    fn equality_with_a_constant_uses_det() {
        let mut a = analysis();
        let mut e = RecExpr::default();
        let id = col(&mut e, "id");
        let five = e.add(SqlExpr::Int(5));
        let eq = e.add(SqlExpr::Eq([id, five]));
        assert_eq!(gather(&mut a, &e, eq).unwrap(), EncSet::plain());
        let plan = a.plan(eq).unwrap();
        let olk = plan.child_olk(five).unwrap();
        assert_eq!((olk.onion, olk.level), (Onion::Det, SecLevel::Det));
        assert_eq!(olk.key, Some(FieldRef::new("db", "emp", "id")));
    }

    #[test]
    fn self_join_compares_join_ciphertexts() {
        let mut a = Analysis::new(Arc::new(emp_schema()), "db");
        a.add_table("emp", Some("x")).unwrap();
        a.add_table("emp", Some("y")).unwrap();
        let mut e = RecExpr::default();
        let l = e.add(SqlExpr::Column(ColumnRef::new(Some("x"), "id")));
        let r = e.add(SqlExpr::Column(ColumnRef::new(Some("y"), "salary")));
        let eq = e.add(SqlExpr::Eq([l, r]));
        gather(&mut a, &e, eq).unwrap();
        let plan = a.plan(eq).unwrap();
        assert!(matches!(plan.kind, PlanKind::PerChildOlk(_)));
        let l_olk = plan.child_olk(l).unwrap();
        let r_olk = plan.child_olk(r).unwrap();
        assert_eq!(l_olk.level, SecLevel::DetJoin);
        assert_eq!(l_olk.key.as_ref().unwrap().field, "id");
        assert_eq!(r_olk.key.as_ref().unwrap().field, "salary");
    }

    #[test]
    fn ordering_between_fields_is_rejected() {
        let mut a = analysis();
        let mut e = RecExpr::default();
        let l = col(&mut e, "id");
        let r = col(&mut e, "salary");
        let lt = e.add(SqlExpr::Lt([l, r]));
        assert!(matches!(gather(&mut a, &e, lt), Err(Error::NoAvailableEncSet { .. })));
    }

    #[test]
    fn sum_is_homomorphic() {
        let mut a = analysis();
        let mut e = RecExpr::default();
        let s = col(&mut e, "salary");
        let sum = e.add(SqlExpr::Sum(s));
        let out = gather(&mut a, &e, sum).unwrap();
        assert_eq!(out.get(Onion::Agg).map(|(l, _)| l), Some(SecLevel::Hom));
        let name = col(&mut e, "name");
        let bad = e.add(SqlExpr::Sum(name));
        assert!(gather(&mut a, &e, bad).is_err());
    }

    #[test]
    fn adding_two_fields_needs_one_key() {
        let mut a = analysis();
        let mut e = RecExpr::default();
        let l = col(&mut e, "id");
        let r = col(&mut e, "salary");
        let plus = e.add(SqlExpr::Plus([l, r]));
        assert!(gather(&mut a, &e, plus).is_err());

        let mut a = analysis();
        let mut e = RecExpr::default();
        let l = col(&mut e, "salary");
        let one = e.add(SqlExpr::Int(1));
        let plus = e.add(SqlExpr::Plus([l, one]));
        let out = gather(&mut a, &e, plus).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out.get(Onion::Agg).map(|(l, _)| l), Some(SecLevel::Hom));
    }

    #[test]
    fn min_and_max_of_text_need_plaintext() {
        let mut a = analysis();
        let mut e = RecExpr::default();
        let name = col(&mut e, "name");
        let max = e.add(SqlExpr::Max(name));
        match gather(&mut a, &e, max) {
            Err(Error::NoAvailableEncSet { item, .. }) => assert_eq!(item, "MAX(name)"),
            other => panic!("unexpected {other:?}"),
        }

        let mut a = analysis();
        let mut e = RecExpr::default();
        let salary = col(&mut e, "salary");
        let min = e.add(SqlExpr::Min(salary));
        let out = gather(&mut a, &e, min).unwrap();
        assert_eq!(out.get(Onion::Ord).map(|(l, _)| l), Some(SecLevel::Ope));
    }

    #[test]
    fn like_uses_search() {
        let mut a = analysis();
        let mut e = RecExpr::default();
        let name = col(&mut e, "name");
        let pat = e.add(SqlExpr::Text("%bob%".into()));
        let like = e.add(SqlExpr::Like([name, pat]));
        gather(&mut a, &e, like).unwrap();
        assert_eq!(a.plan(like).unwrap().child_olk(name).unwrap().onion, Onion::Swp);
    }

    #[test]
    fn nodes_are_gathered_once() {
        let mut a = analysis();
        let mut e = RecExpr::default();
        let id = col(&mut e, "id");
        gather(&mut a, &e, id).unwrap();
        assert!(gather(&mut a, &e, id).is_err());
    }

    #[test]
    fn reasons_mirror_the_tree() {
        let mut a = analysis();
        let mut e = RecExpr::default();
        let s = col(&mut e, "salary");
        let t = e.add(SqlExpr::Text("x".into()));
        let like = e.add(SqlExpr::Like([s, t]));
        match gather(&mut a, &e, like) {
            Err(Error::NoAvailableEncSet { reason, .. }) => {
                assert_eq!(reason.children.len(), 1);
                assert!(reason.to_string().contains("salary"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
