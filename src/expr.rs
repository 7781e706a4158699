//! Expression arena.
//!
//! Expressions of one statement live in an `egg` [`RecExpr`] of [`SqlExpr`]
//! nodes whose children are referenced by [`Id`]. A node is always added
//! after its children, so the last node of a subtree is its root. The
//! planner keeps nodes unshared: every occurrence of a subexpression gets
//! its own id, which keeps the per-node plan cache well defined. Arenas
//! coming out of `egg`'s extractor are hash-consed, so they are copied back
//! with [`SqlArena::graft`] before planning.

use std::fmt;
use std::str::FromStr;

pub use egg::{Id, Language};
use egg::define_language;

use crate::error::{Error, Result};

/// A possibly qualified column reference, as written in the query.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: Option<&str>, column: &str) -> Self {
        Self {
            table: table.map(String::from),
            column: column.to_string(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(t) => write!(f, "{t}.{}", self.column),
            None => f.write_str(&self.column),
        }
    }
}

impl FromStr for ColumnRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let valid = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_');
        match s.split_once('.') {
            Some((t, c)) if valid(t) && valid(c) => Ok(ColumnRef::new(Some(t), c)),
            None if valid(s) && !s.starts_with(|c: char| c.is_ascii_digit()) => Ok(ColumnRef::new(None, s)),
            _ => Err(Error::text(format!("not a column reference: {s}"))),
        }
    }
}

define_language! {
    /// One node of the expression arena. `IN` holds the tested expression
    /// followed by the list members.
    pub enum SqlExpr {
        "TRUE" = True,
        "FALSE" = False,
        "NULL" = Null,

        "AND" = And([Id; 2]),
        "OR" = Or([Id; 2]),
        "NOT" = Not(Id),

        "=" = Eq([Id; 2]),
        "<>" = NotEq([Id; 2]),
        "<" = Lt([Id; 2]),
        "<=" = LtEq([Id; 2]),
        ">" = Gt([Id; 2]),
        ">=" = GtEq([Id; 2]),

        "+" = Plus([Id; 2]),
        "-" = Minus([Id; 2]),
        "*" = Multiply([Id; 2]),

        "LIKE" = Like([Id; 2]),
        "is-null" = IsNull(Id),
        "IN" = InList(Box<[Id]>),

        "count-star" = CountStar,
        "COUNT" = Count(Id),
        "count-distinct" = CountDistinct(Id),
        "SUM" = Sum(Id),
        "MIN" = Min(Id),
        "MAX" = Max(Id),

        Int(i64),
        Column(ColumnRef),
        Text(String),
    }
}

impl SqlExpr {
    /// SQL spelling of binary operators.
    pub fn operator(&self) -> Option<&'static str> {
        Some(match self {
            SqlExpr::And(_) => "AND",
            SqlExpr::Or(_) => "OR",
            SqlExpr::Eq(_) => "=",
            SqlExpr::NotEq(_) => "<>",
            SqlExpr::Lt(_) => "<",
            SqlExpr::LtEq(_) => "<=",
            SqlExpr::Gt(_) => ">",
            SqlExpr::GtEq(_) => ">=",
            SqlExpr::Plus(_) => "+",
            SqlExpr::Minus(_) => "-",
            SqlExpr::Multiply(_) => "*",
            SqlExpr::Like(_) => "LIKE",
            _ => return None,
        })
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            SqlExpr::CountStar
                | SqlExpr::Count(_)
                | SqlExpr::CountDistinct(_)
                | SqlExpr::Sum(_)
                | SqlExpr::Min(_)
                | SqlExpr::Max(_)
        )
    }

    pub fn is_connective(&self) -> bool {
        matches!(self, SqlExpr::And(_) | SqlExpr::Or(_))
    }
}

/// Flat storage for the expressions of one statement.
pub type RecExpr = egg::RecExpr<SqlExpr>;

/// What the planner needs from an arena on top of `egg`'s `RecExpr`.
pub trait SqlArena {
    /// Checked lookup of a node.
    fn node(&self, id: Id) -> Result<&SqlExpr>;

    /// Copies the subtree rooted at `id` of `src` into `self`, giving every
    /// occurrence of a shared subexpression its own id.
    fn graft(&mut self, src: &RecExpr, id: Id) -> Id;

    /// Renders the subtree rooted at `id` as plaintext SQL.
    fn to_sql(&self, id: Id) -> String;
}

impl SqlArena for RecExpr {
    fn node(&self, id: Id) -> Result<&SqlExpr> {
        self.as_ref()
            .get(usize::from(id))
            .ok_or_else(|| Error::text(format!("expression {id} is not in the arena")))
    }

    fn graft(&mut self, src: &RecExpr, id: Id) -> Id {
        let node = src[id].clone().map_children(|c| self.graft(src, c));
        self.add(node)
    }

    fn to_sql(&self, id: Id) -> String {
        let child = |c: Id| {
            let s = self.to_sql(c);
            if self[c].is_connective() {
                format!("({s})")
            } else {
                s
            }
        };
        match &self[id] {
            SqlExpr::True => "TRUE".into(),
            SqlExpr::False => "FALSE".into(),
            SqlExpr::Null => "NULL".into(),
            SqlExpr::Int(i) => i.to_string(),
            SqlExpr::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlExpr::Column(c) => c.to_string(),
            SqlExpr::Not(c) => format!("NOT {}", child(*c)),
            SqlExpr::IsNull(c) => format!("{} IS NULL", child(*c)),
            SqlExpr::InList(c) => {
                let list: Vec<String> = c[1..].iter().map(|i| self.to_sql(*i)).collect();
                format!("{} IN ({})", child(c[0]), list.join(", "))
            }
            SqlExpr::CountStar => "COUNT(*)".into(),
            SqlExpr::Count(c) => format!("COUNT({})", self.to_sql(*c)),
            SqlExpr::CountDistinct(c) => format!("COUNT(DISTINCT {})", self.to_sql(*c)),
            SqlExpr::Sum(c) => format!("SUM({})", self.to_sql(*c)),
            SqlExpr::Min(c) => format!("MIN({})", self.to_sql(*c)),
            SqlExpr::Max(c) => format!("MAX({})", self.to_sql(*c)),
            node => {
                let [l, r] = [node.children()[0], node.children()[1]];
                let op = node.operator().unwrap_or("?");
                format!("{} {op} {}", child(l), child(r))
            }
        }
    }
}
