//! Per-statement state shared by the gather and rewrite passes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::Rng;

use crate::delta::Delta;
use crate::enc_set::{FieldRef, Olk};
use crate::error::{test_identifier_not_found, Error, Result};
use crate::expr::{ColumnRef, Id};
use crate::rewrite_plan::RewritePlan;
use crate::schema::{FieldMeta, SchemaInfo, TableMeta};

/// One column of the rewritten result set.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnField {
    pub is_salt: bool,
    /// Name the client sees.
    pub field_called: String,
    /// How the column is encrypted; plain for computed plaintext values.
    pub olk: Olk,
    /// The field whose layers must be peeled, if any.
    pub field: Option<FieldRef>,
    /// Position of the salt column of this field in the result.
    pub salt_pos: Option<usize>,
}

/// How to turn the rows of a rewritten query back into plaintext.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReturnMeta {
    pub fields: Vec<ReturnField>,
}

impl ReturnMeta {
    /// Names of the columns the client gets, salts excluded.
    pub fn visible_names(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| !f.is_salt)
            .map(|f| f.field_called.as_str())
            .collect()
    }
}

/// A table of the FROM clause.
#[derive(Clone, Debug, PartialEq)]
struct FromTable {
    table: String,
    alias: Option<String>,
}

/// Column reference resolved against the FROM clause.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedColumn {
    pub field: FieldRef,
    /// Qualifier to write in front of the server column, if any.
    pub qualifier: Option<String>,
}

pub struct Analysis {
    pub db: String,
    schema: Arc<SchemaInfo>,
    from: Vec<FromTable>,
    plans: HashMap<Id, RewritePlan>,
    salts: BTreeMap<FieldRef, u64>,
    pos: usize,
    pub rmeta: ReturnMeta,
    /// Schema changes of the statement, in the order they are applied.
    deltas: Vec<Delta>,
}

impl Analysis {
    pub fn new(schema: Arc<SchemaInfo>, db: &str) -> Self {
        Self {
            db: db.to_string(),
            schema,
            from: Vec::new(),
            plans: HashMap::new(),
            salts: BTreeMap::new(),
            pos: 0,
            rmeta: ReturnMeta::default(),
            deltas: Vec::new(),
        }
    }

    pub fn schema(&self) -> &SchemaInfo {
        &self.schema
    }

    /// Adds a table of the FROM clause.
    pub fn add_table(&mut self, table: &str, alias: Option<&str>) -> Result<()> {
        self.get_table(table)?;
        let name = alias.unwrap_or(table);
        if self
            .from
            .iter()
            .any(|t| t.alias.as_deref().unwrap_or(t.table.as_str()) == name)
        {
            return Err(Error::text(format!("table name or alias `{name}` is used twice")));
        }
        self.from.push(FromTable {
            table: table.to_string(),
            alias: alias.map(String::from),
        });
        Ok(())
    }

    /// The real table behind a name used in the statement.
    #[track_caller]
    pub fn unalias(&self, name: &str) -> Result<&str> {
        let found = self
            .from
            .iter()
            .find(|t| t.alias.as_deref() == Some(name))
            .or_else(|| self.from.iter().find(|t| t.alias.is_none() && t.table == name))
            .map(|t| t.table.as_str());
        test_identifier_not_found(found, name)
    }

    #[track_caller]
    pub fn get_table(&self, table: &str) -> Result<&TableMeta> {
        self.schema.get_table(&self.db, table)
    }

    #[track_caller]
    pub fn get_field(&self, field: &FieldRef) -> Result<&FieldMeta> {
        self.schema.get_field(field)
    }

    /// Finds the field a column reference denotes.
    pub fn resolve_column(&self, column: &ColumnRef) -> Result<ResolvedColumn> {
        if let Some(name) = &column.table {
            let table = self.unalias(name)?;
            let field = FieldRef::new(&self.db, table, &column.column);
            self.get_field(&field)?;
            let qualifier = if table == name {
                self.get_table(table)?.anon_name.clone()
            } else {
                name.clone()
            };
            return Ok(ResolvedColumn {
                field,
                qualifier: Some(qualifier),
            });
        }
        let mut candidates = self.from.iter().filter(|t| {
            self.schema
                .table(&self.db, &t.table)
                .is_some_and(|tm| tm.field(&column.column).is_some())
        });
        let first = candidates.next();
        if candidates.next().is_some() {
            return Err(Error::text(format!("column `{}` is ambiguous", column.column)));
        }
        let table = test_identifier_not_found(first, &column.column)?;
        Ok(ResolvedColumn {
            field: FieldRef::new(&self.db, &table.table, &column.column),
            qualifier: None,
        })
    }

    /// Records the plan of a node. Each node is gathered once.
    #[track_caller]
    pub fn record_plan(&mut self, id: Id, plan: RewritePlan) -> Result<()> {
        if self.plans.contains_key(&id) {
            return Err(Error::text(format!("expression {id} was already analyzed")));
        }
        self.plans.insert(id, plan);
        Ok(())
    }

    #[track_caller]
    pub fn plan(&self, id: Id) -> Result<&RewritePlan> {
        self.plans
            .get(&id)
            .ok_or_else(|| Error::text(format!("expression {id} has not been analyzed")))
    }

    /// Salt used for constants encrypted under `field`'s keys. Drawn once
    /// per statement.
    pub fn salt_for(&mut self, field: &FieldRef) -> u64 {
        *self
            .salts
            .entry(field.clone())
            .or_insert_with(|| rand::thread_rng().gen())
    }

    pub fn add_delta(&mut self, delta: Delta) {
        self.deltas.push(delta);
    }

    /// Hands the pending schema changes over, leaving none behind.
    pub fn take_deltas(&mut self) -> Vec<Delta> {
        std::mem::take(&mut self.deltas)
    }

    /// Position of the next column of the rewritten result set.
    pub fn next_pos(&mut self) -> usize {
        self.pos += 1;
        self.pos - 1
    }
}
