//! The proxy: rewrites client statements, runs them on the live database and
//! decrypts what comes back.
//!
//! Each statement is planned against an `Arc` snapshot of the metadata tree.
//! When planning stops on an onion adjustment, the adjustment runs under a
//! per-onion lock and the statement is planned again. Schema changes are
//! logged in the completion log before the live statements run and applied
//! to the tree afterwards, so [`Proxy::recover`] can finish or discard them
//! after a crash.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sqlparser::ast::Statement;
use tracing::{debug, info, warn};

use crate::adjust::OnionAdjustment;
use crate::analysis::ReturnMeta;
use crate::config::ProxyConfig;
use crate::delta::{delta_output_after_query, delta_output_before_query, read_deltas, Delta};
use crate::enc_set::FieldRef;
use crate::encoding::Value;
use crate::error::{Error, Result};
use crate::onions::Onion;
use crate::query::parse_statements;
use crate::schema::SchemaInfo;
use crate::statements::{rewrite_statement, RewrittenStatement, StatementContext};
use crate::store::{pdb_ddl, CompletionRecord, CompletionState, CompletionType, MetaStore};

pub type Row = Vec<Value>;

/// The live database holding the ciphertexts.
pub trait Connection: Send {
    fn execute(&mut self, sql: &str) -> Result<Vec<Row>>;
}

/// Connection that records statements instead of running them.
///
/// Statements containing a `fail_on` pattern fail; statements containing a
/// pattern given to `add_rows` return those rows, the first match winning.
#[derive(Debug, Default)]
pub struct RecordingConnection {
    statements: Vec<String>,
    fail_on: Vec<String>,
    rows: Vec<(String, Vec<Row>)>,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&mut self, pattern: &str) {
        self.fail_on.push(pattern.to_string());
    }

    pub fn add_rows(&mut self, pattern: &str, rows: Vec<Row>) {
        self.rows.push((pattern.to_string(), rows));
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn take_statements(&mut self) -> Vec<String> {
        std::mem::take(&mut self.statements)
    }
}

impl Connection for RecordingConnection {
    fn execute(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.statements.push(sql.to_string());
        if self.fail_on.iter().any(|p| sql.contains(p.as_str())) {
            return Err(Error::Connection(format!("statement refused: {sql}")));
        }
        Ok(self
            .rows
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }
}

/// Versioned snapshots of the metadata tree.
#[derive(Debug)]
pub struct SchemaCache {
    inner: RwLock<(Arc<SchemaInfo>, u64)>,
}

impl SchemaCache {
    pub fn new(schema: SchemaInfo) -> Self {
        Self {
            inner: RwLock::new((Arc::new(schema), 0)),
        }
    }

    pub fn snapshot(&self) -> Arc<SchemaInfo> {
        self.inner.read().0.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().1
    }

    /// Applies the deltas of completion `id` to a copy of the tree and
    /// publishes the copy. Readers keep their old snapshot.
    ///
    /// When the deltas cannot be applied the tree is read again from the
    /// store, so the cache never runs ahead of the metadata. The error is
    /// still returned.
    pub fn apply(&self, store: &mut dyn MetaStore, id: u64, deltas: &[Delta]) -> Result<()> {
        let mut guard = self.inner.write();
        let mut schema = guard.0.as_ref().clone();
        let version = guard.1 + 1;
        if let Err(e) = delta_output_after_query(&mut schema, store, id, deltas) {
            let loaded: Vec<String> = guard
                .0
                .databases()
                .filter(|d| d.db_id.is_some() && d.is_loaded())
                .map(|d| d.name.clone())
                .collect();
            let mut reloaded = SchemaInfo::load(&*store)?;
            for db in &loaded {
                reloaded.load_database(&*store, db)?;
            }
            *guard = (Arc::new(reloaded), version);
            warn!(completion_id = id, version, error = %e, "schema reloaded from the store");
            return Err(e);
        }
        *guard = (Arc::new(schema), version);
        info!(completion_id = id, version, "schema updated");
        Ok(())
    }

    /// Reads the tables of `db` into the cache on first use.
    pub fn load_database(&self, store: &dyn MetaStore, db: &str) -> Result<()> {
        if self.inner.read().0.database(db).map_or(true, |d| d.is_loaded()) {
            return Ok(());
        }
        let mut guard = self.inner.write();
        let mut schema = guard.0.as_ref().clone();
        if schema.load_database(store, db)? {
            guard.0 = Arc::new(schema);
        }
        Ok(())
    }
}

/// Decrypted result of one statement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Outcome of [`Proxy::recover`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecoveryReport {
    pub rolled_forward: Vec<u64>,
    pub failed: Vec<u64>,
}

fn salt_of(value: &Value) -> Result<u64> {
    match value {
        Value::UInt(u) => Ok(*u),
        Value::Int(i) => Ok(*i as u64),
        Value::Null => Ok(0),
        other => Err(Error::Crypto(format!("{other} is not a salt"))),
    }
}

/// Turns rows of a rewritten query back into plaintext. Salt columns are
/// dropped.
pub fn decrypt_rows(schema: &SchemaInfo, rmeta: &ReturnMeta, rows: Vec<Row>) -> Result<Vec<Row>> {
    rows.into_iter()
        .map(|row| {
            if row.len() != rmeta.fields.len() {
                return Err(Error::bad_item_argument_count(
                    "result row",
                    rmeta.fields.len(),
                    row.len(),
                ));
            }
            let mut out = Vec::with_capacity(row.len());
            for (rf, value) in rmeta.fields.iter().zip(&row) {
                if rf.is_salt {
                    continue;
                }
                let Some(key) = rf.field.as_ref().filter(|_| !rf.olk.is_plain()) else {
                    out.push(value.clone());
                    continue;
                };
                let field = schema.get_field(key)?;
                let om = field
                    .onion(rf.olk.onion)
                    .ok_or_else(|| Error::identifier_not_found(format!("{key} {}", rf.olk.onion)))?;
                let salt = match rf.salt_pos {
                    Some(pos) => salt_of(&row[pos])?,
                    None => 0,
                };
                let mut v = value.clone();
                for layer in om.layers().into_iter().rev().filter(|l| l.level() <= rf.olk.level) {
                    v = layer.decrypt(&v, salt)?;
                }
                out.push(v.into_plain(field.field_type)?);
            }
            Ok(out)
        })
        .collect()
}

pub struct Proxy<C> {
    config: ProxyConfig,
    conn: Mutex<C>,
    store: Mutex<Box<dyn MetaStore>>,
    cache: SchemaCache,
    onion_locks: Mutex<HashMap<(FieldRef, Onion), Arc<Mutex<()>>>>,
}

impl<C: Connection> Proxy<C> {
    /// Loads the metadata tree from `store`.
    pub fn new(config: ProxyConfig, conn: C, store: Box<dyn MetaStore>) -> Result<Self> {
        let schema = SchemaInfo::load(store.as_ref())?;
        Ok(Self {
            config,
            conn: Mutex::new(conn),
            store: Mutex::new(store),
            cache: SchemaCache::new(schema),
            onion_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn schema(&self) -> Arc<SchemaInfo> {
        self.cache.snapshot()
    }

    pub fn schema_version(&self) -> u64 {
        self.cache.version()
    }

    pub fn completions(&self) -> Result<Vec<CompletionRecord>> {
        self.store.lock().completions()
    }

    pub fn with_connection<T>(&self, f: impl FnOnce(&mut C) -> T) -> T {
        f(&mut self.conn.lock())
    }

    /// Creates the metadata tables, the completion table and the default
    /// database.
    pub fn bootstrap(&self) -> Result<()> {
        {
            let mut conn = self.conn.lock();
            for statement in pdb_ddl() {
                conn.execute(&statement)?;
            }
            conn.execute(&self.config.completion_table_ddl())?;
        }
        self.execute(&format!("CREATE DATABASE IF NOT EXISTS {}", self.config.default_db))?;
        Ok(())
    }

    /// Runs every statement of `sql`.
    pub fn execute(&self, sql: &str) -> Result<Vec<QueryResult>> {
        parse_statements(sql)?
            .iter()
            .map(|s| self.execute_statement(s))
            .collect()
    }

    pub fn execute_statement(&self, statement: &Statement) -> Result<QueryResult> {
        self.cache
            .load_database(self.store.lock().as_ref(), &self.config.default_db)?;
        let mut adjustments = 0;
        loop {
            let ctx = StatementContext {
                schema: self.cache.snapshot(),
                db: &self.config.default_db,
                config: &self.config,
            };
            match rewrite_statement(&ctx, statement) {
                Ok(rewritten) => return self.run(&ctx.schema, rewritten),
                Err(Error::OnionAdjust(adjustment)) => {
                    adjustments += 1;
                    if adjustments > self.config.max_adjust_attempts {
                        return Err(Error::text(format!(
                            "`{statement}` still needs {adjustment} after {} adjustments",
                            self.config.max_adjust_attempts
                        )));
                    }
                    self.adjust(&adjustment)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn onion_lock(&self, adjustment: &OnionAdjustment) -> Arc<Mutex<()>> {
        self.onion_locks
            .lock()
            .entry((adjustment.field.clone(), adjustment.onion))
            .or_default()
            .clone()
    }

    /// Lowers one onion, unless another statement already did.
    pub fn adjust(&self, adjustment: &OnionAdjustment) -> Result<()> {
        let lock = self.onion_lock(adjustment);
        let _guard = lock.lock();
        let Some(plan) = adjustment.plan(&self.cache.snapshot())? else {
            debug!(%adjustment, "already adjusted");
            return Ok(());
        };
        info!(%adjustment, "adjusting onion");
        let mut store = self.store.lock();
        let id = delta_output_before_query(store.as_mut(), CompletionType::AdjustOnion, &plan.query(), &plan.deltas)?;
        if let Err(e) = self.run_live(&plan.transaction(&self.config.completion_table, id)) {
            store.set_completion_state(id, CompletionState::Failed)?;
            return Err(e);
        }
        self.cache.apply(store.as_mut(), id, &plan.deltas)
    }

    /// Runs live statements that change the schema. On failure the
    /// transaction is rolled back.
    fn run_live(&self, statements: &[String]) -> Result<()> {
        let mut conn = self.conn.lock();
        for statement in statements {
            if let Err(e) = conn.execute(statement) {
                warn!(%statement, error = %e, "live statement failed");
                if let Err(rollback) = conn.execute("ROLLBACK") {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(Error::LiveSchemaMutation {
                    statement: statement.clone(),
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn run(&self, schema: &SchemaInfo, rewritten: RewrittenStatement) -> Result<QueryResult> {
        if !rewritten.deltas.is_empty() {
            let mut store = self.store.lock();
            let query = rewritten.queries.join("; ");
            let id = delta_output_before_query(store.as_mut(), CompletionType::Ddl, &query, &rewritten.deltas)?;
            let mut live = rewritten.queries;
            live.push(format!(
                "INSERT INTO {} (completion_id) VALUES ({id})",
                self.config.completion_table
            ));
            if let Err(e) = self.run_live(&live) {
                store.set_completion_state(id, CompletionState::Failed)?;
                return Err(e);
            }
            self.cache.apply(store.as_mut(), id, &rewritten.deltas)?;
            return Ok(QueryResult::default());
        }

        let mut rows = Vec::new();
        {
            let mut conn = self.conn.lock();
            for query in &rewritten.queries {
                rows = conn.execute(query)?;
            }
        }
        match &rewritten.rmeta {
            Some(rmeta) => Ok(QueryResult {
                columns: rmeta.visible_names().into_iter().map(String::from).collect(),
                rows: decrypt_rows(schema, rmeta, rows)?,
            }),
            None => Ok(QueryResult::default()),
        }
    }

    /// Finishes the schema changes interrupted by a crash. Pending records
    /// whose id made it into the remote completion table are applied; the
    /// others, and those whose deltas no longer apply, are marked failed.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut store = self.store.lock();
        let pending: Vec<CompletionRecord> = store
            .completions()?
            .into_iter()
            .filter(|c| c.state == CompletionState::Pending)
            .collect();
        let mut report = RecoveryReport::default();
        if pending.is_empty() {
            return Ok(report);
        }
        let rows = self
            .conn
            .lock()
            .execute(&format!("SELECT completion_id FROM {}", self.config.completion_table))?;
        let mut done = HashSet::new();
        for row in &rows {
            match row.first() {
                Some(Value::UInt(id)) => done.insert(*id),
                Some(Value::Int(id)) if *id >= 0 => done.insert(*id as u64),
                Some(Value::Text(id)) => done.insert(
                    id.parse()
                        .map_err(|_| Error::text(format!("bad completion id `{id}`")))?,
                ),
                other => return Err(Error::text(format!("bad completion row {other:?}"))),
            };
        }
        for record in pending {
            if done.contains(&record.id) {
                let deltas = read_deltas(&record.deltas)?;
                if let Err(e) = self.cache.apply(store.as_mut(), record.id, &deltas) {
                    store.set_completion_state(record.id, CompletionState::Failed)?;
                    warn!(completion_id = record.id, error = %e, "could not roll forward");
                    report.failed.push(record.id);
                    continue;
                }
                info!(completion_id = record.id, kind = %record.kind, "rolled forward");
                report.rolled_forward.push(record.id);
            } else {
                store.set_completion_state(record.id, CompletionState::Failed)?;
                warn!(completion_id = record.id, query = %record.query, "never completed");
                report.failed.push(record.id);
            }
        }
        Ok(report)
    }
}
