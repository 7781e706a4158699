//! Query parsing.
//!
//! Statements are parsed with `sqlparser`'s MySQL dialect. Expressions are
//! then copied into a [`RecExpr`], keeping only what the planner looks at:
//! node kind, children, and for column references the qualifier and name.

use std::fs::read_to_string;
use std::io::Read;
use std::path::Path;

use sqlparser::ast::{
    BinaryOperator, Expr, Function, FunctionArg, FunctionArgExpr, Ident, Statement, UnaryOperator, Value,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::error::{test_bad_item_argument_count, Error, Result};
use crate::expr::{ColumnRef, Id, RecExpr, SqlExpr};

/// Coarse statement classes, deciding how a statement is logged and run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    /// Statements changing the schema; their deltas are logged as DDL.
    Ddl,
    Transaction,
}

pub fn classify(statement: &Statement) -> Result<StatementKind> {
    Ok(match statement {
        Statement::Query(_) => StatementKind::Select,
        Statement::Insert { .. } => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateDatabase { .. }
        | Statement::AlterTable { .. }
        | Statement::Drop { .. } => StatementKind::Ddl,
        Statement::StartTransaction { .. } | Statement::Commit { .. } | Statement::Rollback { .. } => {
            StatementKind::Transaction
        }
        other => return Err(Error::text(format!("unsupported statement: {other}"))),
    })
}

pub fn parse_statements(sql: &str) -> Result<Vec<Statement>> {
    Ok(Parser::parse_sql(&MySqlDialect {}, sql)?)
}

/// Reads statements from a file, or from standard input if `path` is `-`.
pub fn load_statements(path: &Path) -> Result<Vec<Statement>> {
    let text = if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        text
    } else {
        read_to_string(path)?
    };
    parse_statements(&text)
}

fn column(idents: &[Ident]) -> Result<SqlExpr> {
    match idents {
        [c] => Ok(SqlExpr::Column(ColumnRef::new(None, &c.value))),
        [t, c] => Ok(SqlExpr::Column(ColumnRef::new(Some(&t.value), &c.value))),
        [_, t, c] => Ok(SqlExpr::Column(ColumnRef::new(Some(&t.value), &c.value))),
        _ => Err(Error::text(format!(
            "unsupported identifier {}",
            idents.iter().map(|i| i.value.as_str()).collect::<Vec<_>>().join(".")
        ))),
    }
}

/// Parses a literal. `negate` applies a leading minus sign.
pub fn literal(value: &Value, negate: bool) -> Result<SqlExpr> {
    match value {
        Value::Number(n, _) => {
            let i: i64 = n
                .parse()
                .map_err(|_| Error::text(format!("unsupported number literal {n}")))?;
            Ok(SqlExpr::Int(if negate { -i } else { i }))
        }
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) if !negate => Ok(SqlExpr::Text(s.clone())),
        Value::Boolean(b) if !negate => Ok(if *b { SqlExpr::True } else { SqlExpr::False }),
        Value::Null if !negate => Ok(SqlExpr::Null),
        other => Err(Error::text(format!("unsupported literal {other}"))),
    }
}

/// Adds a parsed expression to the arena and returns its root.
pub fn add_sql(acc: &mut RecExpr, expr: &Expr) -> Result<Id> {
    let node = match expr {
        Expr::Nested(e) => return add_sql(acc, e),
        Expr::Identifier(i) => column(std::slice::from_ref(i))?,
        Expr::CompoundIdentifier(idents) => column(idents)?,
        Expr::Value(v) => literal(v, false)?,
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(v) => literal(v, true)?,
            other => return Err(Error::text(format!("unsupported negation of {other}"))),
        },
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => SqlExpr::Not(add_sql(acc, expr)?),
        Expr::BinaryOp { left, op, right } => {
            let c = [add_sql(acc, left)?, add_sql(acc, right)?];
            match op {
                BinaryOperator::And => SqlExpr::And(c),
                BinaryOperator::Or => SqlExpr::Or(c),
                BinaryOperator::Eq => SqlExpr::Eq(c),
                BinaryOperator::NotEq => SqlExpr::NotEq(c),
                BinaryOperator::Lt => SqlExpr::Lt(c),
                BinaryOperator::LtEq => SqlExpr::LtEq(c),
                BinaryOperator::Gt => SqlExpr::Gt(c),
                BinaryOperator::GtEq => SqlExpr::GtEq(c),
                BinaryOperator::Plus => SqlExpr::Plus(c),
                BinaryOperator::Minus => SqlExpr::Minus(c),
                BinaryOperator::Multiply => SqlExpr::Multiply(c),
                other => return Err(Error::text(format!("unsupported operator {other}"))),
            }
        }
        Expr::Like {
            negated,
            expr,
            pattern,
            escape_char: None,
        } => {
            let like = SqlExpr::Like([add_sql(acc, expr)?, add_sql(acc, pattern)?]);
            return Ok(maybe_not(acc, like, *negated));
        }
        Expr::IsNull(e) => SqlExpr::IsNull(add_sql(acc, e)?),
        Expr::IsNotNull(e) => {
            let is_null = SqlExpr::IsNull(add_sql(acc, e)?);
            return Ok(maybe_not(acc, is_null, true));
        }
        Expr::InList { expr, list, negated } => {
            let mut c = vec![add_sql(acc, expr)?];
            for item in list {
                c.push(add_sql(acc, item)?);
            }
            return Ok(maybe_not(acc, SqlExpr::InList(c.into_boxed_slice()), *negated));
        }
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let lower = SqlExpr::GtEq([add_sql(acc, expr)?, add_sql(acc, low)?]);
            let lower = acc.add(lower);
            let upper = SqlExpr::LtEq([add_sql(acc, expr)?, add_sql(acc, high)?]);
            let upper = acc.add(upper);
            return Ok(maybe_not(acc, SqlExpr::And([lower, upper]), *negated));
        }
        Expr::Function(f) => function(acc, f)?,
        other => return Err(Error::text(format!("unsupported expression {other}"))),
    };
    Ok(acc.add(node))
}

fn maybe_not(acc: &mut RecExpr, node: SqlExpr, negated: bool) -> Id {
    let id = acc.add(node);
    if negated {
        acc.add(SqlExpr::Not(id))
    } else {
        id
    }
}

fn function(acc: &mut RecExpr, f: &Function) -> Result<SqlExpr> {
    let name = f.name.to_string().to_uppercase();
    let args: Vec<&FunctionArgExpr> = f
        .args
        .iter()
        .map(|a| match a {
            FunctionArg::Unnamed(arg) | FunctionArg::Named { arg, .. } => arg,
        })
        .collect();
    if name == "COUNT" && matches!(args.as_slice(), [FunctionArgExpr::Wildcard]) {
        return Ok(SqlExpr::CountStar);
    }
    test_bad_item_argument_count(&name, 1, args.len())?;
    let arg = match args[0] {
        FunctionArgExpr::Expr(e) => add_sql(acc, e)?,
        other => return Err(Error::text(format!("unsupported argument {other} of {name}"))),
    };
    Ok(match (name.as_str(), f.distinct) {
        ("COUNT", false) => SqlExpr::Count(arg),
        ("COUNT", true) => SqlExpr::CountDistinct(arg),
        ("SUM", false) => SqlExpr::Sum(arg),
        ("MIN", _) => SqlExpr::Min(arg),
        ("MAX", _) => SqlExpr::Max(arg),
        _ => return Err(Error::text(format!("unsupported function {name}"))),
    })
}
