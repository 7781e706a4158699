//! Whole-statement rewriting.
//!
//! Each statement is rewritten against one snapshot of the metadata tree.
//! Expressions go through gather and rewrite; what surrounds them (table
//! names, column lists, DDL) is mapped to the anonymized names here.
//! Schema changes are not applied: they come back as deltas, to be logged
//! and applied once the live statements have run.

use std::sync::Arc;

use rand::Rng;
use rayon::prelude::*;
use sqlparser::ast::{
    AlterTableOperation, ColumnDef, ColumnOption, ColumnOptionDef, Expr, GroupByExpr, Ident, JoinConstraint,
    JoinOperator, ObjectName, ObjectType, Query, Select, SelectItem, SetExpr, Statement, TableConstraint, TableFactor,
    TableWithJoins, UnaryOperator,
};
use tracing::debug;

use crate::analysis::{Analysis, ReturnField, ReturnMeta};
use crate::config::ProxyConfig;
use crate::delta::Delta;
use crate::enc_set::{EncSet, FieldRef, Olk};
use crate::encoding::Value;
use crate::error::{Error, Result};
use crate::expr::{ColumnRef, Id, RecExpr, SqlExpr};
use crate::gather::gather;
use crate::onions::{FieldType, Onion, SecLevel, SecurityRating};
use crate::query::{add_sql, classify, literal, StatementKind};
use crate::rewrite::{encrypt_to_level, qualified, rewrite, Rewritten};
use crate::schema::{AnyMeta, DatabaseMeta, FieldMeta, MetaKey, MetaPath, OnionMeta, SchemaInfo, TableMeta};
use crate::simplify::simplify;
use crate::store::NodeKind;

/// Statement-independent inputs of a rewrite.
pub struct StatementContext<'a> {
    pub schema: Arc<SchemaInfo>,
    pub db: &'a str,
    pub config: &'a ProxyConfig,
}

/// What to run on the server for one client statement.
#[derive(Clone, Debug, PartialEq)]
pub struct RewrittenStatement {
    pub kind: StatementKind,
    /// Live statements, in order. Rows come from the last one.
    pub queries: Vec<String>,
    /// How to decrypt the rows, for queries returning them.
    pub rmeta: Option<ReturnMeta>,
    pub deltas: Vec<Delta>,
}

impl RewrittenStatement {
    fn plain(kind: StatementKind, queries: Vec<String>) -> Self {
        Self {
            kind,
            queries,
            rmeta: None,
            deltas: Vec::new(),
        }
    }
}

/// A DDL statement carrying the schema changes recorded in `a`.
fn ddl(queries: Vec<String>, a: &mut Analysis) -> RewrittenStatement {
    RewrittenStatement {
        kind: StatementKind::Ddl,
        queries,
        rmeta: None,
        deltas: a.take_deltas(),
    }
}

fn unsupported(what: impl std::fmt::Display) -> Error {
    Error::text(format!("unsupported: {what}"))
}

fn object_name(name: &ObjectName) -> Result<String> {
    name.0
        .last()
        .map(|i| i.value.clone())
        .ok_or_else(|| Error::text("empty object name"))
}

fn is_literal(expr: &Expr) -> bool {
    match expr {
        Expr::Value(_) => true,
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => matches!(expr.as_ref(), Expr::Value(_)),
        _ => false,
    }
}

/// Plaintext value of a literal cell.
fn cell_value(expr: &Expr) -> Result<Value> {
    let node = match expr {
        Expr::Value(v) => literal(v, false)?,
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match expr.as_ref() {
            Expr::Value(v) => literal(v, true)?,
            other => return Err(unsupported(format!("value -{other}"))),
        },
        other => return Err(unsupported(format!("value {other}"))),
    };
    Ok(match node {
        SqlExpr::Int(i) => Value::Int(i),
        SqlExpr::Text(s) => Value::Text(s),
        SqlExpr::True => Value::Int(1),
        SqlExpr::False => Value::Int(0),
        _ => Value::Null,
    })
}

fn coerce(value: &Value, field: &FieldMeta) -> Result<Value> {
    match (field.field_type, value) {
        (FieldType::Int, Value::Text(s)) => Value::parse(s, FieldType::Int),
        (FieldType::Str, Value::Int(i)) => Ok(Value::Text(i.to_string())),
        (_, v) => Ok(v.clone()),
    }
}

/// Server columns of a field: one per onion, then the salt.
fn field_columns(field: &FieldMeta) -> Vec<String> {
    let mut columns: Vec<String> = field.ordered_onions().iter().map(|om| om.anon_name.clone()).collect();
    if field.has_salt {
        columns.push(field.salt_name.clone());
    }
    columns
}

/// `value` in every onion of `field` at its current level, then the salt.
fn encrypt_cell(field: &FieldMeta, value: &Value, salt: u64) -> Result<Vec<String>> {
    let value = coerce(value, field)?;
    let mut cells = Vec::new();
    for om in field.ordered_onions() {
        cells.push(encrypt_to_level(om, &value, om.level(), salt)?.to_sql());
    }
    if field.has_salt {
        cells.push(Value::UInt(salt).to_sql());
    }
    Ok(cells)
}

/// Column definitions of a field. `nullability` is appended to every onion
/// column, `options` to plain columns only.
fn column_defs(field: &FieldMeta, nullability: &str, options: &str) -> Vec<String> {
    let mut defs: Vec<String> = field
        .ordered_onions()
        .iter()
        .map(|om| match om.layers().last() {
            Some(layer) => format!("{} {}{nullability}", om.anon_name, layer.column_type()),
            None => format!(
                "{} {}{nullability}{options}",
                om.anon_name,
                field.field_type.plain_column_type()
            ),
        })
        .collect();
    if field.has_salt {
        defs.push(format!("{} BIGINT UNSIGNED", field.salt_name));
    }
    defs
}

fn field_type_of(column: &ColumnDef) -> Result<FieldType> {
    let name = column.data_type.to_string().to_uppercase();
    if ["INT", "BOOL", "SERIAL"].iter().any(|t| name.contains(t)) {
        Ok(FieldType::Int)
    } else if ["CHAR", "TEXT", "BLOB", "BINARY"].iter().any(|t| name.contains(t)) {
        Ok(FieldType::Str)
    } else {
        Err(unsupported(format!("column type {name} of {}", column.name.value)))
    }
}

fn is_auto_increment(options: &[ColumnOptionDef]) -> bool {
    options
        .iter()
        .any(|o| o.option.to_string().to_uppercase().contains("AUTO_INCREMENT"))
}

/// Builds the metadata of a new field, its column definitions and the keys
/// declared among its column options.
fn new_field(
    column: &ColumnDef,
    table: &mut TableMeta,
    config: &ProxyConfig,
) -> Result<(FieldMeta, Vec<String>, Vec<KeyKind>)> {
    let field_type = field_type_of(column)?;
    let rating = if is_auto_increment(&column.options) {
        SecurityRating::Plain
    } else {
        config.default_rating
    };
    let uniq = table.lease_uniq();
    let field = FieldMeta::new(&column.name.value, field_type, rating, uniq, &config.master_key)?;

    let (mut nullability, mut options, mut keys) = (String::new(), String::new(), Vec::new());
    for def in &column.options {
        match &def.option {
            ColumnOption::Unique { is_primary: true, .. } => keys.push(KeyKind::Primary),
            ColumnOption::Unique { .. } => keys.push(KeyKind::Unique),
            ColumnOption::Null | ColumnOption::NotNull => nullability.push_str(&format!(" {}", def.option)),
            other if field.is_plain() => options.push_str(&format!(" {other}")),
            other => {
                return Err(unsupported(format!(
                    "{other} on encrypted column {}",
                    column.name.value
                )))
            }
        }
    }
    let defs = column_defs(&field, &nullability, &options);
    Ok((field, defs, keys))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyKind {
    Primary,
    Unique,
    Index,
}

/// The onion keys are built over. Order comes first so that range scans
/// can use the index.
fn key_onion(field: &FieldMeta) -> Result<&OnionMeta> {
    [Onion::Ord, Onion::Det, Onion::Plain]
        .into_iter()
        .find_map(|o| field.onion(o))
        .ok_or_else(|| Error::text(format!("{} has no onion that can be indexed", field.name)))
}

/// Anonymous names of the onions a key over `columns` is built on.
fn key_onions(table: &TableMeta, columns: &[Ident]) -> Result<String> {
    let onions = columns
        .iter()
        .map(|c| {
            let field = table.field(&c.value).ok_or_else(|| Error::identifier_not_found(&c.value))?;
            Ok(key_onion(field)?.anon_name.clone())
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(onions.join(", "))
}

/// Anonymous name of a key. Unnamed keys are named after their first column.
fn key_name(table: &TableMeta, name: Option<&Ident>, columns: &[Ident]) -> Result<String> {
    let name = name
        .or(columns.first())
        .ok_or_else(|| Error::text("a key needs at least one column"))?;
    Ok(table.index_anon_name(&name.value))
}

fn key_def(table: &TableMeta, kind: KeyKind, name: Option<&Ident>, columns: &[Ident]) -> Result<String> {
    let onions = key_onions(table, columns)?;
    let index = key_name(table, name, columns)?;
    Ok(match kind {
        KeyKind::Primary => format!("PRIMARY KEY ({onions})"),
        KeyKind::Unique => format!("UNIQUE KEY {index} ({onions})"),
        KeyKind::Index => format!("INDEX {index} ({onions})"),
    })
}

fn table_key(table: &TableMeta, constraint: &TableConstraint) -> Result<String> {
    match constraint {
        TableConstraint::Unique {
            name,
            columns,
            is_primary,
            ..
        } => {
            let kind = if *is_primary { KeyKind::Primary } else { KeyKind::Unique };
            key_def(table, kind, name.as_ref(), columns)
        }
        TableConstraint::Index { name, columns, .. } => key_def(table, KeyKind::Index, name.as_ref(), columns),
        other => Err(unsupported(format!("constraint {other}"))),
    }
}

/// Rewriting state of one DML statement.
struct Planner<'a> {
    a: Analysis,
    e: RecExpr,
    ctx: &'a StatementContext<'a>,
    /// Tables of the FROM clause with their aliases, in order.
    from: Vec<(String, Option<String>)>,
}

impl<'a> Planner<'a> {
    fn new(ctx: &'a StatementContext<'a>) -> Self {
        Self {
            a: Analysis::new(ctx.schema.clone(), ctx.db),
            e: RecExpr::default(),
            ctx,
            from: Vec::new(),
        }
    }

    fn add(&mut self, expr: &Expr) -> Result<Id> {
        if self.ctx.config.simplify_predicates {
            let mut raw = RecExpr::default();
            let root = add_sql(&mut raw, expr)?;
            Ok(simplify(&raw, root, &mut self.e))
        } else {
            add_sql(&mut self.e, expr)
        }
    }

    fn node(&mut self, id: Id, req: &EncSet) -> Result<Rewritten> {
        gather(&mut self.a, &self.e, id)?;
        rewrite(&mut self.a, &self.e, id, req)
    }

    fn clause(&mut self, expr: &Expr, req: &EncSet) -> Result<Rewritten> {
        let id = self.add(expr)?;
        self.node(id, req)
    }

    /// Registers a table of the FROM clause and returns its server form.
    fn table_factor(&mut self, factor: &TableFactor) -> Result<String> {
        let TableFactor::Table { name, alias, .. } = factor else {
            return Err(unsupported(format!("table factor {factor}")));
        };
        let table = object_name(name)?;
        let alias = alias.as_ref().map(|a| a.name.value.clone());
        self.a.add_table(&table, alias.as_deref())?;
        let anon = self.a.get_table(&table)?.anon_name.clone();
        let sql = match &alias {
            Some(alias) => format!("{anon} AS {alias}"),
            None => anon,
        };
        self.from.push((table, alias));
        Ok(sql)
    }

    fn from_clause(&mut self, from: &[TableWithJoins]) -> Result<String> {
        let mut factors = Vec::new();
        for twj in from {
            factors.push(self.table_factor(&twj.relation)?);
            for join in &twj.joins {
                factors.push(self.table_factor(&join.relation)?);
            }
        }
        let mut factors = factors.into_iter();
        let mut items = Vec::new();
        for twj in from {
            let mut item = factors.next().unwrap_or_default();
            for join in &twj.joins {
                let factor = factors.next().unwrap_or_default();
                let (keyword, constraint) = match &join.join_operator {
                    JoinOperator::Inner(c) => ("JOIN", Some(c)),
                    JoinOperator::LeftOuter(c) => ("LEFT JOIN", Some(c)),
                    JoinOperator::CrossJoin => ("CROSS JOIN", None),
                    other => return Err(unsupported(format!("join {other:?}"))),
                };
                item.push_str(&format!(" {keyword} {factor}"));
                match constraint {
                    Some(JoinConstraint::On(on)) => {
                        let on = self.clause(on, &EncSet::plain())?.sql;
                        item.push_str(&format!(" ON {on}"));
                    }
                    Some(JoinConstraint::None) | None => {}
                    Some(other) => return Err(unsupported(format!("join constraint {other:?}"))),
                }
            }
            items.push(item);
        }
        Ok(items.join(", "))
    }

    /// Rewrites one projected expression and records how to decrypt it.
    fn project(&mut self, id: Id, called: String, req: &EncSet) -> Result<String> {
        let out = self.node(id, req)?;
        let pos = self.a.next_pos();
        let salt = match (&self.e[id], &out.olk.key) {
            (SqlExpr::Column(c), Some(key)) if out.olk.level == SecLevel::Rnd => {
                let field = self.a.get_field(key)?;
                let qualifier = self.a.resolve_column(c)?.qualifier;
                Some((field.salt_name.clone(), qualified(qualifier.as_deref(), &field.salt_name)))
            }
            _ => None,
        };
        self.a.rmeta.fields.push(ReturnField {
            is_salt: false,
            field_called: called,
            olk: out.olk.clone(),
            field: out.olk.key.clone(),
            salt_pos: salt.as_ref().map(|_| pos + 1),
        });
        let mut sql = out.sql;
        if let Some((salt_name, salt_sql)) = salt {
            self.a.next_pos();
            self.a.rmeta.fields.push(ReturnField {
                is_salt: true,
                field_called: salt_name,
                olk: Olk::plain(),
                field: out.olk.key,
                salt_pos: None,
            });
            sql = format!("{sql}, {salt_sql}");
        }
        Ok(sql)
    }

    fn wildcard(&mut self, only: Option<&str>, req: &EncSet) -> Result<Vec<String>> {
        let mut columns = Vec::new();
        for (table, alias) in &self.from {
            let name = alias.as_deref().unwrap_or(table);
            if only.is_some_and(|o| o != name) {
                continue;
            }
            for field in self.a.get_table(table)?.ordered_fields() {
                columns.push((name.to_string(), field.name.clone()));
            }
        }
        if columns.is_empty() {
            return Err(Error::identifier_not_found(only.map_or("*".to_string(), |o| format!("{o}.*"))));
        }
        let mut out = Vec::new();
        for (qualifier, field) in columns {
            let id = self.e.add(SqlExpr::Column(ColumnRef::new(Some(&qualifier), &field)));
            out.push(self.project(id, field, req)?);
        }
        Ok(out)
    }

    fn select(mut self, query: &Query) -> Result<RewrittenStatement> {
        if query.with.is_some() {
            return Err(unsupported("WITH"));
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(unsupported(format!("query body {}", query.body)));
        };
        let Select {
            distinct,
            projection,
            from,
            selection,
            group_by,
            having,
            ..
        } = select.as_ref();

        let from = self.from_clause(from)?;
        // DISTINCT compares the projected values on the server.
        let req = if distinct.is_some() {
            EncSet::equality()
        } else {
            EncSet::full()
        };
        let mut items = Vec::new();
        for item in projection {
            match item {
                SelectItem::Wildcard(_) => items.extend(self.wildcard(None, &req)?),
                SelectItem::QualifiedWildcard(name, _) => {
                    let name = object_name(name)?;
                    items.extend(self.wildcard(Some(&name), &req)?)
                }
                SelectItem::UnnamedExpr(expr) => {
                    let id = add_sql(&mut self.e, expr)?;
                    items.push(self.project(id, expr.to_string(), &req)?);
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    let id = add_sql(&mut self.e, expr)?;
                    items.push(self.project(id, alias.value.clone(), &req)?);
                }
            }
        }

        let mut sql = format!(
            "SELECT {}{}",
            if distinct.is_some() { "DISTINCT " } else { "" },
            items.join(", ")
        );
        if !from.is_empty() {
            sql.push_str(&format!(" FROM {from}"));
        }
        if let Some(selection) = selection {
            sql.push_str(&format!(" WHERE {}", self.clause(selection, &EncSet::plain())?.sql));
        }
        let GroupByExpr::Expressions(group_by) = group_by else {
            return Err(unsupported("GROUP BY ALL"));
        };
        if !group_by.is_empty() {
            let mut keys = Vec::new();
            for expr in group_by {
                keys.push(self.clause(expr, &EncSet::equality())?.sql);
            }
            sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
        }
        if let Some(having) = having {
            sql.push_str(&format!(" HAVING {}", self.clause(having, &EncSet::plain())?.sql));
        }
        if !query.order_by.is_empty() {
            let mut keys = Vec::new();
            for o in &query.order_by {
                let key = self.clause(&o.expr, &EncSet::order())?.sql;
                keys.push(match o.asc {
                    Some(true) => format!("{key} ASC"),
                    Some(false) => format!("{key} DESC"),
                    None => key,
                });
            }
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        if let Some(limit) = &query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = &query.offset {
            sql.push_str(&format!(" OFFSET {}", offset.value));
        }
        let deltas = self.a.take_deltas();
        Ok(RewrittenStatement {
            kind: StatementKind::Select,
            queries: vec![sql],
            rmeta: Some(self.a.rmeta),
            deltas,
        })
    }

    fn insert(self, table_name: &ObjectName, columns: &[sqlparser::ast::Ident], source: &Query) -> Result<RewrittenStatement> {
        let name = object_name(table_name)?;
        let table = self.a.get_table(&name)?;
        let fields: Vec<&FieldMeta> = if columns.is_empty() {
            table.ordered_fields()
        } else {
            columns
                .iter()
                .map(|c| table.field(&c.value).ok_or_else(|| Error::identifier_not_found(&c.value)))
                .collect::<Result<_>>()?
        };
        let SetExpr::Values(values) = source.body.as_ref() else {
            return Err(unsupported(format!("INSERT source {}", source.body)));
        };

        let mut rows = Vec::with_capacity(values.rows.len());
        let mut rng = rand::thread_rng();
        for row in &values.rows {
            if row.len() != fields.len() {
                return Err(Error::bad_item_argument_count("INSERT row", fields.len(), row.len()));
            }
            let row: Vec<(Value, u64)> = row
                .iter()
                .map(|cell| Ok((cell_value(cell)?, rng.gen())))
                .collect::<Result<_>>()?;
            rows.push(row);
        }
        let encrypted: Vec<String> = rows
            .par_iter()
            .map(|row| {
                let mut cells = Vec::new();
                for (field, (value, salt)) in fields.iter().zip(row) {
                    cells.extend(encrypt_cell(field, value, *salt)?);
                }
                Ok(format!("({})", cells.join(", ")))
            })
            .collect::<Result<_>>()?;

        let columns: Vec<String> = fields.iter().flat_map(|f| field_columns(f)).collect();
        debug!(table = %name, rows = encrypted.len(), "insert encrypted");
        Ok(RewrittenStatement::plain(
            StatementKind::Insert,
            vec![format!(
                "INSERT INTO {} ({}) VALUES {}",
                table.anon_name,
                columns.join(", "),
                encrypted.join(", ")
            )],
        ))
    }

    fn update(
        mut self,
        table: &TableWithJoins,
        assignments: &[sqlparser::ast::Assignment],
        selection: Option<&Expr>,
    ) -> Result<RewrittenStatement> {
        if !table.joins.is_empty() {
            return Err(unsupported("UPDATE with joins"));
        }
        let target = self.table_factor(&table.relation)?;
        let name = self.from[0].0.clone();
        let mut sets = Vec::new();
        for assignment in assignments {
            let column = assignment
                .id
                .last()
                .ok_or_else(|| Error::text("empty assignment target"))?;
            let key = FieldRef::new(self.ctx.db, &name, &column.value);
            let field = self.a.get_field(&key)?.clone();
            if is_literal(&assignment.value) {
                let value = cell_value(&assignment.value)?;
                let salt = self.a.salt_for(&key);
                let cells = encrypt_cell(&field, &value, salt)?;
                for (c, v) in field_columns(&field).into_iter().zip(cells) {
                    sets.push(format!("{c} = {v}"));
                }
            } else if field.is_plain() {
                let value = self.clause(&assignment.value, &EncSet::plain())?.sql;
                for c in field_columns(&field) {
                    sets.push(format!("{c} = {value}"));
                }
            } else {
                return Err(unsupported(format!(
                    "computed assignment to the encrypted field {}",
                    column.value
                )));
            }
        }
        let mut sql = format!("UPDATE {target} SET {}", sets.join(", "));
        if let Some(selection) = selection {
            sql.push_str(&format!(" WHERE {}", self.clause(selection, &EncSet::plain())?.sql));
        }
        Ok(RewrittenStatement::plain(StatementKind::Update, vec![sql]))
    }

    fn delete(mut self, from: &[TableWithJoins], selection: Option<&Expr>) -> Result<RewrittenStatement> {
        let [table] = from else {
            return Err(unsupported("DELETE from several tables"));
        };
        if !table.joins.is_empty() {
            return Err(unsupported("DELETE with joins"));
        }
        let target = self.table_factor(&table.relation)?;
        let mut sql = format!("DELETE FROM {target}");
        if let Some(selection) = selection {
            sql.push_str(&format!(" WHERE {}", self.clause(selection, &EncSet::plain())?.sql));
        }
        Ok(RewrittenStatement::plain(StatementKind::Delete, vec![sql]))
    }
}

fn create_table(
    ctx: &StatementContext,
    name: &ObjectName,
    columns: &[ColumnDef],
    constraints: &[TableConstraint],
    if_not_exists: bool,
) -> Result<RewrittenStatement> {
    let name = object_name(name)?;
    let db = ctx.schema.database(ctx.db).ok_or_else(|| Error::identifier_not_found(ctx.db))?;
    if db.table(&name).is_some() {
        if if_not_exists {
            return Ok(RewrittenStatement::plain(StatementKind::Ddl, Vec::new()));
        }
        return Err(Error::text(format!("table {name} already exists")));
    }
    let mut table = TableMeta::new(&name, false);
    let mut defs = Vec::new();
    let mut column_keys = Vec::new();
    for column in columns {
        let (field, field_defs, keys) = new_field(column, &mut table, ctx.config)?;
        table.has_sensitive |= !field.is_plain();
        table.add_field(field)?;
        defs.extend(field_defs);
        column_keys.extend(keys.into_iter().map(|kind| (kind, column.name.clone())));
    }
    for (kind, column) in &column_keys {
        defs.push(key_def(&table, *kind, None, std::slice::from_ref(column))?);
    }
    for constraint in constraints {
        defs.push(table_key(&table, constraint)?);
    }
    let sql = format!("CREATE TABLE {} ({})", table.anon_name, defs.join(", "));
    let mut a = Analysis::new(ctx.schema.clone(), ctx.db);
    a.add_delta(Delta::Create {
        parent: MetaPath::database(ctx.db),
        key: MetaKey::identity(&name),
        meta: AnyMeta::Table(table),
    });
    Ok(ddl(vec![sql], &mut a))
}

fn drop_tables(ctx: &StatementContext, names: &[ObjectName], if_exists: bool) -> Result<RewrittenStatement> {
    let mut queries = Vec::new();
    let mut a = Analysis::new(ctx.schema.clone(), ctx.db);
    for name in names {
        let name = object_name(name)?;
        let Some(table) = ctx.schema.table(ctx.db, &name) else {
            if if_exists {
                continue;
            }
            return Err(Error::identifier_not_found(&name));
        };
        queries.push(format!("DROP TABLE {}", table.anon_name));
        a.add_delta(Delta::Delete {
            parent: MetaPath::database(ctx.db),
            key: MetaKey::identity(&name),
            kind: NodeKind::Table,
        });
    }
    Ok(ddl(queries, &mut a))
}

fn alter_table(ctx: &StatementContext, name: &ObjectName, operations: &[AlterTableOperation]) -> Result<RewrittenStatement> {
    let name = object_name(name)?;
    let mut table = ctx.schema.get_table(ctx.db, &name)?.clone();
    let table_path = MetaPath::table(ctx.db, &name);
    let mut changes = Vec::new();
    let mut a = Analysis::new(ctx.schema.clone(), ctx.db);
    let mut counter_changed = false;
    for operation in operations {
        match operation {
            AlterTableOperation::AddColumn { column_def, .. } => {
                if table.field(&column_def.name.value).is_some() {
                    return Err(Error::text(format!("column {} already exists", column_def.name.value)));
                }
                let (field, defs, keys) = new_field(column_def, &mut table, ctx.config)?;
                counter_changed = true;
                table.has_sensitive |= !field.is_plain();
                changes.extend(defs.into_iter().map(|d| format!("ADD COLUMN {d}")));
                a.add_delta(Delta::Create {
                    parent: table_path.clone(),
                    key: MetaKey::identity(&field.name),
                    meta: AnyMeta::Field(field.clone()),
                });
                table.add_field(field)?;
                for kind in keys {
                    let key = key_def(&table, kind, None, std::slice::from_ref(&column_def.name))?;
                    changes.push(format!("ADD {key}"));
                }
            }
            AlterTableOperation::AddConstraint(constraint) => {
                changes.push(format!("ADD {}", table_key(&table, constraint)?));
            }
            // sqlparser reads MySQL's `DROP INDEX i` as a column drop, so
            // keys are dropped by name through `DROP CONSTRAINT`.
            AlterTableOperation::DropConstraint { name: index, .. } => {
                changes.push(format!("DROP INDEX {}", table.index_anon_name(&index.value)));
            }
            AlterTableOperation::DropPrimaryKey => changes.push("DROP PRIMARY KEY".to_string()),
            AlterTableOperation::DropColumn { column_name, .. } => {
                let field = table
                    .field(&column_name.value)
                    .ok_or_else(|| Error::identifier_not_found(&column_name.value))?;
                changes.extend(field_columns(field).into_iter().map(|c| format!("DROP COLUMN {c}")));
                a.add_delta(Delta::Delete {
                    parent: table_path.clone(),
                    key: MetaKey::identity(&column_name.value),
                    kind: NodeKind::Field,
                });
            }
            other => return Err(unsupported(format!("ALTER TABLE {other}"))),
        }
    }
    let mut deltas = a.take_deltas();
    if counter_changed {
        // The leased counter must be persisted before the new fields.
        deltas.insert(
            0,
            Delta::Replace {
                parent: MetaPath::database(ctx.db),
                key: MetaKey::identity(&name),
                meta: AnyMeta::Table(table.clone()),
            },
        );
    }
    Ok(RewrittenStatement {
        kind: StatementKind::Ddl,
        queries: vec![format!("ALTER TABLE {} {}", table.anon_name, changes.join(", "))],
        rmeta: None,
        deltas,
    })
}

fn create_index(
    ctx: &StatementContext,
    name: Option<&ObjectName>,
    table: &ObjectName,
    columns: &[Expr],
    unique: bool,
) -> Result<RewrittenStatement> {
    let table = ctx.schema.get_table(ctx.db, &object_name(table)?)?;
    let columns = columns
        .iter()
        .map(|c| match c {
            Expr::Identifier(i) => Ok(i.clone()),
            Expr::CompoundIdentifier(idents) => idents.last().cloned().ok_or_else(|| Error::text("empty column")),
            other => Err(unsupported(format!("index on {other}"))),
        })
        .collect::<Result<Vec<_>>>()?;
    let name = name.map(object_name).transpose()?.map(Ident::new);
    let index = key_name(table, name.as_ref(), &columns)?;
    let onions = key_onions(table, &columns)?;
    let unique = if unique { "UNIQUE " } else { "" };
    let sql = format!("CREATE {unique}INDEX {index} ON {} ({onions})", table.anon_name);
    Ok(RewrittenStatement::plain(StatementKind::Ddl, vec![sql]))
}

/// `DROP INDEX <table>.<index>`, the spelling sqlparser accepts for an
/// index of a given table.
fn drop_indexes(ctx: &StatementContext, names: &[ObjectName], if_exists: bool) -> Result<RewrittenStatement> {
    let mut queries = Vec::new();
    for name in names {
        let [.., table, index] = name.0.as_slice() else {
            return Err(Error::text(format!("DROP INDEX {name} needs the table: DROP INDEX <table>.{name}")));
        };
        let Some(table) = ctx.schema.table(ctx.db, &table.value) else {
            if if_exists {
                continue;
            }
            return Err(Error::identifier_not_found(&table.value));
        };
        queries.push(format!(
            "DROP INDEX {} ON {}",
            table.index_anon_name(&index.value),
            table.anon_name
        ));
    }
    Ok(RewrittenStatement::plain(StatementKind::Ddl, queries))
}

fn create_database(ctx: &StatementContext, name: &ObjectName, if_not_exists: bool) -> Result<RewrittenStatement> {
    let name = object_name(name)?;
    if ctx.schema.database(&name).is_some() {
        if if_not_exists {
            return Ok(RewrittenStatement::plain(StatementKind::Ddl, Vec::new()));
        }
        return Err(Error::text(format!("database {name} already exists")));
    }
    let mut a = Analysis::new(ctx.schema.clone(), ctx.db);
    a.add_delta(Delta::Create {
        parent: MetaPath::root(),
        key: MetaKey::identity(&name),
        meta: AnyMeta::Database(DatabaseMeta::new(&name)),
    });
    Ok(ddl(vec![format!("CREATE DATABASE IF NOT EXISTS {name}")], &mut a))
}

/// Rewrites one client statement.
pub fn rewrite_statement(ctx: &StatementContext, statement: &Statement) -> Result<RewrittenStatement> {
    let kind = classify(statement)?;
    let planner = Planner::new(ctx);
    let rewritten = match statement {
        Statement::Query(query) => planner.select(query)?,
        Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => {
            let source = source.as_ref().ok_or_else(|| unsupported("INSERT without VALUES"))?;
            planner.insert(table_name, columns, source)?
        }
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => planner.update(table, assignments, selection.as_ref())?,
        Statement::Delete { from, selection, .. } => planner.delete(from, selection.as_ref())?,
        Statement::CreateTable {
            name,
            columns,
            constraints,
            if_not_exists,
            ..
        } => create_table(ctx, name, columns, constraints, *if_not_exists)?,
        Statement::Drop {
            object_type: ObjectType::Table,
            names,
            if_exists,
            ..
        } => drop_tables(ctx, names, *if_exists)?,
        Statement::Drop {
            object_type: ObjectType::Index,
            names,
            if_exists,
            ..
        } => drop_indexes(ctx, names, *if_exists)?,
        Statement::AlterTable { name, operations, .. } => alter_table(ctx, name, operations)?,
        Statement::CreateIndex {
            name,
            table_name,
            columns,
            unique,
            ..
        } => {
            let columns: Vec<Expr> = columns.iter().map(|c| c.expr.clone()).collect();
            create_index(ctx, name.as_ref(), table_name, &columns, *unique)?
        }
        Statement::CreateDatabase {
            db_name, if_not_exists, ..
        } => create_database(ctx, db_name, *if_not_exists)?,
        _ if kind == StatementKind::Transaction => RewrittenStatement::plain(kind, vec![statement.to_string()]),
        other => return Err(unsupported(other)),
    };
    debug!(%statement, queries = ?rewritten.queries, "statement rewritten");
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::emp_schema;
    use crate::query::parse_statements;
    use crate::schema::tests::MASTER;

    fn config() -> ProxyConfig {
        ProxyConfig::with_master_key(MASTER)
    }

    fn run(schema: &SchemaInfo, config: &ProxyConfig, sql: &str) -> Result<RewrittenStatement> {
        let ctx = StatementContext {
            schema: Arc::new(schema.clone()),
            db: "db",
            config,
        };
        rewrite_statement(&ctx, &parse_statements(sql)?[0])
    }

    fn anon(schema: &SchemaInfo, field: &str, onion: Onion) -> String {
        schema
            .get_field(&FieldRef::new("db", "emp", field))
            .unwrap()
            .onion(onion)
            .unwrap()
            .anon_name
            .clone()
    }

    #[test]
    fn select_star_adds_salt_columns() {
        let schema = emp_schema();
        let out = run(&schema, &config(), "SELECT * FROM emp").unwrap();
        let rmeta = out.rmeta.unwrap();
        assert_eq!(rmeta.visible_names(), vec!["id", "name", "salary"]);
        assert_eq!(rmeta.fields.len(), 6);
        assert!(rmeta.fields[1].is_salt);
        assert_eq!(rmeta.fields[0].salt_pos, Some(1));
        let table = schema.table("db", "emp").unwrap();
        assert!(out.queries[0].ends_with(&format!("FROM {}", table.anon_name)));
        assert!(out.queries[0].contains(&anon(&schema, "id", Onion::Det)));
    }

    #[test]
    fn where_clause_needs_an_adjustment() {
        let schema = emp_schema();
        let err = run(&schema, &config(), "SELECT name FROM emp WHERE salary > 10").unwrap_err();
        let Error::OnionAdjust(adj) = err else {
            panic!("unexpected {err}")
        };
        assert_eq!((adj.onion, adj.to_level), (Onion::Ord, SecLevel::Ope));
    }

    #[test]
    fn aggregates_and_clauses() {
        let schema = emp_schema();
        let out = run(
            &schema,
            &config(),
            "SELECT COUNT(*), SUM(salary) AS total FROM emp e LIMIT 5 OFFSET 2",
        )
        .unwrap();
        let sql = &out.queries[0];
        assert!(sql.starts_with("SELECT COUNT(*), cdb_hom_sum("));
        assert!(sql.contains(" AS e LIMIT 5 OFFSET 2"));
        let rmeta = out.rmeta.unwrap();
        assert_eq!(rmeta.visible_names(), vec!["COUNT(*)", "total"]);
        assert!(rmeta.fields[0].olk.is_plain());
        assert_eq!(rmeta.fields[1].olk.onion, Onion::Agg);
    }

    #[test]
    fn insert_encrypts_every_onion() {
        let schema = emp_schema();
        let out = run(&schema, &config(), "INSERT INTO emp (id, name) VALUES (1, 'Alice'), (2, NULL)").unwrap();
        let sql = &out.queries[0];
        // id: 3 onions + salt, name: 3 onions + salt
        let columns = sql.split(") VALUES").next().unwrap();
        assert_eq!(columns.matches(", ").count(), 7);
        assert!(!sql.contains("Alice"));
        assert!(sql.contains("NULL"));
        assert!(run(&schema, &config(), "INSERT INTO emp (id) VALUES (1, 2)").is_err());
    }

    #[test]
    fn update_and_delete() {
        let schema = emp_schema();
        let out = run(&schema, &config(), "UPDATE emp SET name = 'Bob'").unwrap();
        assert_eq!(out.queries[0].matches(" = ").count(), 4);
        assert!(run(&schema, &config(), "UPDATE emp SET salary = salary + 1").is_err());
        let out = run(&schema, &config(), "DELETE FROM emp WHERE TRUE OR id = 1").unwrap();
        assert!(out.queries[0].ends_with(" WHERE TRUE"));
    }

    #[test]
    fn create_table_keeps_auto_increment_plain() {
        let schema = emp_schema();
        let out = run(
            &schema,
            &config(),
            "CREATE TABLE dept (id INT AUTO_INCREMENT PRIMARY KEY, title VARCHAR(20))",
        )
        .unwrap();
        let [Delta::Create { meta: AnyMeta::Table(t), .. }] = out.deltas.as_slice() else {
            panic!("expected one table")
        };
        assert!(t.field("id").unwrap().is_plain());
        assert!(!t.field("title").unwrap().is_plain());
        assert!(t.has_sensitive);
        let plain_id = &t.field("id").unwrap().ordered_onions()[0].anon_name;
        let sql = &out.queries[0];
        assert!(sql.contains(&format!("{plain_id} BIGINT AUTO_INCREMENT,")));
        assert!(sql.ends_with(&format!("PRIMARY KEY ({plain_id}))")));
        assert!(sql.starts_with(&format!("CREATE TABLE {} (", t.anon_name)));
        assert!(run(&schema, &config(), "CREATE TABLE emp (a INT)").is_err());
        assert!(run(&schema, &config(), "CREATE TABLE IF NOT EXISTS emp (a INT)")
            .unwrap()
            .queries
            .is_empty());
    }

    #[test]
    fn plain_rating_is_honoured() {
        let schema = emp_schema();
        let config = ProxyConfig {
            default_rating: SecurityRating::Plain,
            ..config()
        };
        let out = run(&schema, &config, "CREATE TABLE t (a INT, b TEXT)").unwrap();
        let [Delta::Create { meta: AnyMeta::Table(t), .. }] = out.deltas.as_slice() else {
            panic!("expected one table")
        };
        assert!(!t.has_sensitive);
        let plain = |f: &str| t.field(f).unwrap().ordered_onions()[0].anon_name.clone();
        assert_eq!(
            out.queries[0],
            format!("CREATE TABLE {} ({} BIGINT, {} TEXT)", t.anon_name, plain("a"), plain("b"))
        );
    }

    #[test]
    fn alter_and_drop() {
        let schema = emp_schema();
        let out = run(&schema, &config(), "ALTER TABLE emp ADD COLUMN age INT").unwrap();
        assert_eq!(out.deltas.len(), 2);
        assert!(matches!(out.deltas[0], Delta::Replace { .. }));
        assert_eq!(out.queries[0].matches("ADD COLUMN").count(), 4);
        let out = run(&schema, &config(), "ALTER TABLE emp DROP COLUMN name").unwrap();
        assert_eq!(out.queries[0].matches("DROP COLUMN").count(), 4);
        let out = run(&schema, &config(), "DROP TABLE emp").unwrap();
        assert!(matches!(out.deltas[0], Delta::Delete { kind: NodeKind::Table, .. }));
        assert!(run(&schema, &config(), "DROP TABLE nope").is_err());
        assert!(run(&schema, &config(), "DROP TABLE IF EXISTS nope").unwrap().queries.is_empty());
    }

    #[test]
    fn index_prefers_the_order_onion() {
        let schema = emp_schema();
        let out = run(&schema, &config(), "CREATE INDEX by_salary ON emp (salary)").unwrap();
        let table = schema.table("db", "emp").unwrap();
        assert_eq!(
            out.queries[0],
            format!(
                "CREATE INDEX {} ON {} ({})",
                table.index_anon_name("by_salary"),
                table.anon_name,
                anon(&schema, "salary", Onion::Ord)
            )
        );
        let out = run(&schema, &config(), "CREATE UNIQUE INDEX by_name ON emp (name, id)").unwrap();
        assert!(out.queries[0].starts_with(&format!("CREATE UNIQUE INDEX {} ON", table.index_anon_name("by_name"))));
        assert!(out.queries[0].ends_with(&format!(
            "({}, {})",
            anon(&schema, "name", Onion::Ord),
            anon(&schema, "id", Onion::Ord)
        )));
        assert!(run(&schema, &config(), "CREATE INDEX i ON emp (age)").is_err());
    }

    #[test]
    fn create_table_moves_keys_onto_order_onions() {
        let schema = emp_schema();
        let out = run(
            &schema,
            &config(),
            "CREATE TABLE acct (id INT NOT NULL PRIMARY KEY, email TEXT UNIQUE, \
             owner VARCHAR(20) NOT NULL, INDEX by_owner (owner, id))",
        )
        .unwrap();
        let [Delta::Create { meta: AnyMeta::Table(t), .. }] = out.deltas.as_slice() else {
            panic!("expected one table")
        };
        let ord = |f: &str| t.field(f).unwrap().onion(Onion::Ord).unwrap().anon_name.clone();
        let sql = &out.queries[0];
        assert!(sql.contains(&format!("PRIMARY KEY ({})", ord("id"))));
        assert!(sql.contains(&format!("UNIQUE KEY {} ({})", t.index_anon_name("email"), ord("email"))));
        assert!(sql.contains(&format!("INDEX {} ({}, {})", t.index_anon_name("by_owner"), ord("owner"), ord("id"))));
        // NOT NULL lands on every onion of the column, never on the salt
        let owner = t.field("owner").unwrap();
        for om in owner.ordered_onions() {
            assert!(sql.contains(&format!("{} {} NOT NULL", om.anon_name, om.layers().last().unwrap().column_type())));
        }
        assert!(!sql.contains(&format!("{} BIGINT UNSIGNED NOT NULL", owner.salt_name)));
        assert_eq!(sql.matches("NOT NULL").count(), 6);

        let err = run(&schema, &config(), "CREATE TABLE t (a INT DEFAULT 3)").unwrap_err();
        assert!(err.to_string().contains("unsupported"));
        let err = run(&schema, &config(), "CREATE TABLE t (a INT, CHECK (a > 0))").unwrap_err();
        assert!(err.to_string().contains("unsupported"));
        assert!(run(&schema, &config(), "CREATE TABLE t (a INT, PRIMARY KEY (b))").is_err());
    }

    #[test]
    fn alter_table_adds_and_drops_keys() {
        let schema = emp_schema();
        let table = schema.table("db", "emp").unwrap();
        let out = run(&schema, &config(), "ALTER TABLE emp ADD INDEX by_name (name)").unwrap();
        assert_eq!(
            out.queries[0],
            format!(
                "ALTER TABLE {} ADD INDEX {} ({})",
                table.anon_name,
                table.index_anon_name("by_name"),
                anon(&schema, "name", Onion::Ord)
            )
        );
        assert!(out.deltas.is_empty());
        let out = run(&schema, &config(), "ALTER TABLE emp ADD CONSTRAINT by_id UNIQUE (id)").unwrap();
        assert!(out.queries[0].ends_with(&format!(
            "ADD UNIQUE KEY {} ({})",
            table.index_anon_name("by_id"),
            anon(&schema, "id", Onion::Ord)
        )));
        let out = run(&schema, &config(), "ALTER TABLE emp DROP CONSTRAINT by_name").unwrap();
        assert_eq!(
            out.queries[0],
            format!("ALTER TABLE {} DROP INDEX {}", table.anon_name, table.index_anon_name("by_name"))
        );
        let out = run(&schema, &config(), "ALTER TABLE emp ADD COLUMN code INT UNIQUE").unwrap();
        assert!(out.queries[0].contains(&format!("ADD UNIQUE KEY {}", table.index_anon_name("code"))));
        let out = run(&schema, &config(), "ALTER TABLE emp DROP PRIMARY KEY").unwrap();
        assert!(out.queries[0].ends_with("DROP PRIMARY KEY"));
    }

    #[test]
    fn drop_index_names_its_table() {
        let schema = emp_schema();
        let table = schema.table("db", "emp").unwrap();
        let out = run(&schema, &config(), "DROP INDEX emp.by_salary").unwrap();
        assert_eq!(
            out.queries,
            vec![format!(
                "DROP INDEX {} ON {}",
                table.index_anon_name("by_salary"),
                table.anon_name
            )]
        );
        assert!(out.deltas.is_empty());
        assert!(run(&schema, &config(), "DROP INDEX by_salary").is_err());
        assert!(run(&schema, &config(), "DROP INDEX nope.by_salary").is_err());
        assert!(run(&schema, &config(), "DROP INDEX IF EXISTS nope.by_salary")
            .unwrap()
            .queries
            .is_empty());
    }

    #[test]
    fn databases_and_transactions() {
        let schema = emp_schema();
        let out = run(&schema, &config(), "CREATE DATABASE shop").unwrap();
        assert_eq!(out.deltas.len(), 1);
        assert!(run(&schema, &config(), "CREATE DATABASE db").is_err());
        let out = run(&schema, &config(), "COMMIT").unwrap();
        assert_eq!(out.queries, vec!["COMMIT".to_string()]);
        assert_eq!(out.kind, StatementKind::Transaction);
    }
}
