//! Predicate simplification run before gather.
//!
//! The expression is put in an e-graph and the rules below are run over it
//! with `egg`. All of them hold under SQL's three-valued logic, so unlike
//! boolean algebra there is no excluded middle: `x AND NOT x` is `NULL`
//! when `x` is.
//!
//! Fewer `NOT` nodes means fewer places where the planner has to force a
//! plaintext result, and folded constants never reach the server.

use egg::{rewrite as rw, *};

use crate::expr::{RecExpr, SqlArena, SqlExpr};

/// Returns a vector containing all the rewrite rules for `SqlExpr`.
pub fn rules() -> Vec<Rewrite> {
    let mut rules: Vec<Rewrite> = vec![];
    // not rules
    rules.push(rw!("not-true"; "(NOT TRUE)" => "FALSE"));
    rules.push(rw!("not-false"; "(NOT FALSE)" => "TRUE"));
    rules.push(rw!("double-negation"; "(NOT (NOT ?x))" => "?x"));
    // and rules
    rules.push(rw!("and-false"; "(AND ?x FALSE)" => "FALSE"));
    rules.push(rw!("false-and"; "(AND FALSE ?x)" => "FALSE"));
    rules.push(rw!("and-true"; "(AND ?x TRUE)" => "?x"));
    rules.push(rw!("true-and"; "(AND TRUE ?x)" => "?x"));
    // or rules
    rules.push(rw!("or-true"; "(OR ?x TRUE)" => "TRUE"));
    rules.push(rw!("true-or"; "(OR TRUE ?x)" => "TRUE"));
    rules.push(rw!("or-false"; "(OR ?x FALSE)" => "?x"));
    rules.push(rw!("false-or"; "(OR FALSE ?x)" => "?x"));
    rules.push(rw!("de-morgan-and"; "(NOT (AND ?x ?y))" => "(OR (NOT ?x) (NOT ?y))"));
    rules.push(rw!("de-morgan-or"; "(NOT (OR ?x ?y))" => "(AND (NOT ?x) (NOT ?y))"));
    // comparison rules
    rules.push(rw!("not-eq"; "(NOT (= ?x ?y))" => "(<> ?x ?y)"));
    rules.push(rw!("not-neq"; "(NOT (<> ?x ?y))" => "(= ?x ?y)"));
    rules.push(rw!("not-lt"; "(NOT (< ?x ?y))" => "(>= ?x ?y)"));
    rules.push(rw!("not-geq"; "(NOT (>= ?x ?y))" => "(< ?x ?y)"));
    rules.push(rw!("not-gt"; "(NOT (> ?x ?y))" => "(<= ?x ?y)"));
    rules.push(rw!("not-leq"; "(NOT (<= ?x ?y))" => "(> ?x ?y)"));

    rules
}

/// A constant an e-class is known to evaluate to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constant {
    Bool(bool),
    Int(i64),
}

impl Constant {
    fn node(self) -> SqlExpr {
        match self {
            Constant::Bool(true) => SqlExpr::True,
            Constant::Bool(false) => SqlExpr::False,
            Constant::Int(i) => SqlExpr::Int(i),
        }
    }
}

/// Folds boolean connectives over constants and integer arithmetic that
/// does not overflow.
#[derive(Default)]
pub struct ConstantFold;
impl Analysis<SqlExpr> for ConstantFold {
    type Data = Option<Constant>;

    fn make(egraph: &EGraph, enode: &SqlExpr) -> Self::Data {
        let x = |i: &Id| egraph[*i].data;
        let b = |i: &Id| match x(i) {
            Some(Constant::Bool(b)) => Some(b),
            _ => None,
        };
        let n = |i: &Id| match x(i) {
            Some(Constant::Int(n)) => Some(n),
            _ => None,
        };
        Some(match enode {
            SqlExpr::True => Constant::Bool(true),
            SqlExpr::False => Constant::Bool(false),
            SqlExpr::Int(i) => Constant::Int(*i),
            SqlExpr::Not(c) => Constant::Bool(!b(c)?),
            SqlExpr::And([l, r]) => match (b(l), b(r)) {
                (Some(false), _) | (_, Some(false)) => Constant::Bool(false),
                (Some(true), Some(true)) => Constant::Bool(true),
                _ => return None,
            },
            SqlExpr::Or([l, r]) => match (b(l), b(r)) {
                (Some(true), _) | (_, Some(true)) => Constant::Bool(true),
                (Some(false), Some(false)) => Constant::Bool(false),
                _ => return None,
            },
            SqlExpr::Plus([l, r]) => Constant::Int(n(l)?.checked_add(n(r)?)?),
            SqlExpr::Minus([l, r]) => Constant::Int(n(l)?.checked_sub(n(r)?)?),
            SqlExpr::Multiply([l, r]) => Constant::Int(n(l)?.checked_mul(n(r)?)?),
            _ => return None,
        })
    }

    fn merge(&mut self, to: &mut Self::Data, from: Self::Data) -> DidMerge {
        merge_option(to, from, |a, b| {
            debug_assert_eq!(*a, b, "Merged non-equal constants");
            DidMerge(false, false)
        })
    }

    fn modify(egraph: &mut EGraph, id: Id) {
        if let Some(c) = egraph[id].data {
            let added = egraph.add(c.node());
            egraph.union(id, added);
            egraph[id].nodes.retain(|n| n.is_leaf());
        }
    }
}

pub type EGraph = egg::EGraph<SqlExpr, ConstantFold>;
pub type Rewrite = egg::Rewrite<SqlExpr, ConstantFold>;

/// Defines the cost function to minimize.
///
/// + leaves cost nothing,
/// + `NOT` costs more than any comparison, as it can only be evaluated
///   over a plaintext result,
/// + every other operator costs `1.0`.
struct CostFn;
impl CostFunction<SqlExpr> for CostFn {
    type Cost = f64;
    fn cost<C>(&mut self, enode: &SqlExpr, mut costs: C) -> Self::Cost
    where
        C: FnMut(Id) -> Self::Cost,
    {
        let op_cost = match enode {
            node if node.is_leaf() => 0.0,
            SqlExpr::Not(_) => 10.0,
            _ => 1.0,
        };
        enode.fold(op_cost, |sum, id| sum + costs(id))
    }
}

/// Simplifies the subtree rooted at `root` of `src`, copies the result into
/// `dst` and returns the id of the new root.
pub fn simplify(src: &RecExpr, root: Id, dst: &mut RecExpr) -> Id {
    let mut expr = RecExpr::default();
    let root = expr.graft(src, root);
    // the subtree only: `with_expr` makes the last node the root
    debug_assert_eq!(usize::from(root) + 1, expr.as_ref().len());

    // simplify the expression using a Runner, which creates an e-graph with
    // the given expression and runs the given rules over it
    let runner = Runner::<SqlExpr, ConstantFold, ()>::default()
        .with_expr(&expr)
        .run(&rules());

    // the Runner knows which e-class the expression given with `with_expr` is in
    let root = runner.roots[0];

    // use an Extractor to pick the best element, then unshare it
    let extractor = Extractor::new(&runner.egraph, CostFn);
    let (_, best) = extractor.find_best(root);
    let best_root = Id::from(best.as_ref().len() - 1);
    dst.graft(&best, best_root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ColumnRef;

    fn column(e: &mut RecExpr, name: &str) -> Id {
        e.add(SqlExpr::Column(ColumnRef::new(None, name)))
    }

    fn run(src: &RecExpr, root: Id) -> String {
        let mut dst = RecExpr::default();
        let id = simplify(src, root, &mut dst);
        dst.to_sql(id)
    }

    #[test]
    fn double_negation() {
        let mut e = RecExpr::default();
        let x = column(&mut e, "x");
        let null = e.add(SqlExpr::IsNull(x));
        let n1 = e.add(SqlExpr::Not(null));
        let n2 = e.add(SqlExpr::Not(n1));
        assert_eq!(run(&e, n2), "x IS NULL");
    }

    #[test]
    fn not_of_comparison_is_complement() {
        let mut e = RecExpr::default();
        let x = column(&mut e, "x");
        let five = e.add(SqlExpr::Int(5));
        let lt = e.add(SqlExpr::Lt([x, five]));
        let not = e.add(SqlExpr::Not(lt));
        assert_eq!(run(&e, not), "x >= 5");
    }

    #[test]
    fn de_morgan_pushes_negation_into_comparisons() {
        let mut e = RecExpr::default();
        let x = column(&mut e, "x");
        let one = e.add(SqlExpr::Int(1));
        let eq = e.add(SqlExpr::Eq([x, one]));
        let y = column(&mut e, "y");
        let two = e.add(SqlExpr::Int(2));
        let gt = e.add(SqlExpr::Gt([y, two]));
        let or = e.add(SqlExpr::Or([eq, gt]));
        let not = e.add(SqlExpr::Not(or));
        assert_eq!(run(&e, not), "x <> 1 AND y <= 2");
    }

    #[test]
    fn constants_fold_away() {
        let mut e = RecExpr::default();
        let x = column(&mut e, "x");
        let one = e.add(SqlExpr::Int(1));
        let eq = e.add(SqlExpr::Eq([x, one]));
        let t = e.add(SqlExpr::True);
        let and = e.add(SqlExpr::And([eq, t]));
        let f = e.add(SqlExpr::False);
        let or = e.add(SqlExpr::Or([f, and]));
        assert_eq!(run(&e, or), "x = 1");

        let mut dst = RecExpr::default();
        let f2 = e.add(SqlExpr::False);
        let dead = e.add(SqlExpr::And([eq, f2]));
        let id = simplify(&e, dead, &mut dst);
        assert_eq!(dst[id], SqlExpr::False);
        assert_eq!(dst.as_ref().len(), 1);
    }

    #[test]
    fn integer_arithmetic_folds() {
        let mut e = RecExpr::default();
        let x = column(&mut e, "salary");
        let a = e.add(SqlExpr::Int(2));
        let b = e.add(SqlExpr::Int(3));
        let product = e.add(SqlExpr::Multiply([a, b]));
        let gt = e.add(SqlExpr::Gt([x, product]));
        assert_eq!(run(&e, gt), "salary > 6");

        let mut e = RecExpr::default();
        let big = e.add(SqlExpr::Int(i64::MAX));
        let one = e.add(SqlExpr::Int(1));
        let overflow = e.add(SqlExpr::Plus([big, one]));
        assert_eq!(run(&e, overflow), format!("{} + 1", i64::MAX));
    }

    #[test]
    fn excluded_middle_is_not_assumed() {
        let mut e = RecExpr::default();
        let x = column(&mut e, "x");
        let null = e.add(SqlExpr::Null);
        let eq = e.add(SqlExpr::Eq([x, null]));
        let x2 = column(&mut e, "x");
        let null2 = e.add(SqlExpr::Null);
        let neq = e.add(SqlExpr::Eq([x2, null2]));
        let not = e.add(SqlExpr::Not(neq));
        let and = e.add(SqlExpr::And([eq, not]));
        assert_eq!(run(&e, and), "x = NULL AND x <> NULL");
    }

    #[test]
    fn shared_subexpressions_come_back_unshared() {
        let mut e = RecExpr::default();
        let x = column(&mut e, "x");
        let one = e.add(SqlExpr::Int(1));
        let l = e.add(SqlExpr::Eq([x, one]));
        let x2 = column(&mut e, "x");
        let one2 = e.add(SqlExpr::Int(1));
        let r = e.add(SqlExpr::Eq([x2, one2]));
        let or = e.add(SqlExpr::Or([l, r]));
        let mut dst = RecExpr::default();
        let root = simplify(&e, or, &mut dst);
        let SqlExpr::Or([l, r]) = dst[root] else {
            panic!("expected OR, got {}", dst.to_sql(root))
        };
        assert_ne!(dst[l].children()[0], dst[r].children()[0]);
    }

    #[test]
    fn not_over_like_is_kept() {
        let mut e = RecExpr::default();
        let x = column(&mut e, "name");
        let p = e.add(SqlExpr::Text("%bob%".into()));
        let like = e.add(SqlExpr::Like([x, p]));
        let not = e.add(SqlExpr::Not(like));
        assert_eq!(run(&e, not), "NOT name LIKE '%bob%'");
    }
}
