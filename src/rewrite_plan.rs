//! Output of the gather pass for one expression node.

use std::fmt;

use crate::enc_set::{EncSet, Olk};
use crate::expr::Id;

/// Why a node ended up with the `EncSet` it has.
///
/// Mirrors the expression tree; only used in diagnostics.
#[derive(Clone, Debug, PartialEq)]
pub struct Reason {
    pub item: String,
    pub why: String,
    pub es: EncSet,
    pub children: Vec<Reason>,
}

impl Reason {
    pub fn new(item: impl Into<String>, why: impl Into<String>, es: EncSet) -> Self {
        Self {
            item: item.into(),
            why: why.into(),
            es,
            children: Vec::new(),
        }
    }

    pub fn leaf(why: impl Into<String>, es: EncSet) -> Self {
        Self::new("", why, es)
    }

    pub fn with_child(mut self, child: Reason) -> Self {
        self.children.push(child);
        self
    }

    fn to_string_lines(&self) -> Vec<String> {
        let mut result = vec![format!("{} [{}] {}", self.item, self.why, self.es)];
        for child in &self.children {
            result.extend(child.to_string_lines().into_iter().map(|s| format!("  {s}")));
        }
        result
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_lines().join("\n"))
    }
}

/// How the children of a node are to be rewritten.
#[derive(Clone, Debug, PartialEq)]
pub enum PlanKind {
    /// Constants and column references.
    Leaf,
    /// Every child is rewritten at the same onion and level.
    OneOlk { olk: Olk, children: Vec<Id> },
    /// Each child carries its own choice, e.g. the two sides of a join
    /// predicate, each under its own field key.
    PerChildOlk(Vec<(Id, Olk)>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RewritePlan {
    pub es_out: EncSet,
    pub reason: Reason,
    pub kind: PlanKind,
}

impl RewritePlan {
    pub fn leaf(es_out: EncSet, reason: Reason) -> Self {
        Self {
            es_out,
            reason,
            kind: PlanKind::Leaf,
        }
    }

    pub fn one_olk(es_out: EncSet, reason: Reason, olk: Olk, children: Vec<Id>) -> Self {
        Self {
            es_out,
            reason,
            kind: PlanKind::OneOlk { olk, children },
        }
    }

    pub fn per_child(es_out: EncSet, reason: Reason, children: Vec<(Id, Olk)>) -> Self {
        Self {
            es_out,
            reason,
            kind: PlanKind::PerChildOlk(children),
        }
    }

    /// The onion/level/key a given child must be rewritten at.
    pub fn child_olk(&self, child: Id) -> Option<&Olk> {
        match &self.kind {
            PlanKind::Leaf => None,
            PlanKind::OneOlk { olk, children } => children.contains(&child).then_some(olk),
            PlanKind::PerChildOlk(children) => {
                children.iter().find(|(id, _)| *id == child).map(|(_, olk)| olk)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onions::{Onion, SecLevel};

    #[test]
    fn reason_prints_as_indented_tree() {
        let reason = Reason::new("id = 5", "equality", EncSet::equality())
            .with_child(Reason::new("id", "field", EncSet::empty()))
            .with_child(Reason::new("5", "constant", EncSet::plain()));
        let text = reason.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id = 5 [equality]"));
        assert!(lines[1].starts_with("  id [field] {}"));
    }

    #[test]
    fn child_olk_lookup() {
        let det = Olk::new(Onion::Det, SecLevel::Det, None);
        let one = RewritePlan::one_olk(
            EncSet::plain(),
            Reason::leaf("", EncSet::plain()),
            det.clone(),
            vec![Id::from(0), Id::from(1)],
        );
        assert_eq!(one.child_olk(Id::from(1)), Some(&det));
        assert_eq!(one.child_olk(Id::from(2)), None);

        let per = RewritePlan::per_child(
            EncSet::plain(),
            Reason::leaf("", EncSet::plain()),
            vec![(Id::from(3), Olk::plain())],
        );
        assert_eq!(per.child_olk(Id::from(3)), Some(&Olk::plain()));
    }
}
