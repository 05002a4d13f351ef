//! Bulk copy of every table from one environment file into another.
//!
//! The source file is attached read-only to a connection on the target and
//! the target is made to mirror it. Target objects the source lacks, or
//! whose DDL differs from the source, are dropped. Missing tables are
//! created from the source DDL and every table is refilled with the source
//! rows. Indexes, views and triggers are recreated from the source once the
//! rows are in. All of it commits as one transaction.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::sql::{quote_ident, quote_literal};

/// Schema alias the source file is attached under.
const SOURCE_SCHEMA: &str = "source";

/// Rows copied into one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCopy {
    /// Table name.
    pub table: String,
    /// Rows inserted.
    pub rows: usize,
}

/// What a bulk copy did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    /// Per-table row counts, in table-name order.
    pub tables: Vec<TableCopy>,
    /// Tables created on the target from source DDL.
    pub created_tables: usize,
    /// Target objects dropped because the source lacks them or defines them differently.
    pub dropped_objects: usize,
    /// Indexes, views and triggers recreated from the source.
    pub created_objects: usize,
    /// AUTOINCREMENT counters carried over.
    pub sequences: usize,
}

impl CopyReport {
    /// Total rows copied.
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

/// `(type, name, sql)` of one schema object.
type SchemaObject = (String, String, String);

/// Copy every table of the database at `source` into `conn`.
pub fn copy_all_tables(conn: &mut Connection, source: &Path) -> Result<CopyReport> {
    conn.execute(
        &format!("ATTACH DATABASE ?1 AS {}", SOURCE_SCHEMA),
        params![read_only_uri(source)],
    )?;
    // Foreign keys can only be toggled outside a transaction.
    conn.pragma_update(None, "foreign_keys", false)?;

    let copied = copy_attached(conn);

    let restored = conn.pragma_update(None, "foreign_keys", true);
    let detached = conn.execute_batch(&format!("DETACH DATABASE {}", SOURCE_SCHEMA));

    let report = copied?;
    restored?;
    detached?;

    info!(
        source = %source.display(),
        tables = report.tables.len(),
        rows = report.total_rows(),
        created_tables = report.created_tables,
        dropped_objects = report.dropped_objects,
        created_objects = report.created_objects,
        sequences = report.sequences,
        "tables copied"
    );
    Ok(report)
}

fn copy_attached(conn: &mut Connection) -> Result<CopyReport> {
    let tx = conn.transaction()?;
    let mut report = CopyReport::default();

    let source_objects = schema_objects(&tx, SOURCE_SCHEMA, &["table", "index", "view", "trigger"])?;
    let differs = |kind: &str, name: &str, sql: &str| {
        !source_objects
            .iter()
            .any(|(k, n, s)| k == kind && n == name && s == sql)
    };

    // Triggers would fire on the copied rows and views may reference
    // dropped tables; both come back from the source at the end.
    for (kind, name, sql) in schema_objects(&tx, "main", &["trigger", "view"])? {
        drop_object(&tx, &kind, &name)?;
        if differs(&kind, &name, &sql) {
            report.dropped_objects += 1;
        }
    }
    // Indexes first: dropping a table takes its indexes with it.
    for (kind, name, sql) in schema_objects(&tx, "main", &["index", "table"])? {
        if differs(&kind, &name, &sql) && object_exists(&tx, "main", &kind, &name)? {
            drop_object(&tx, &kind, &name)?;
            report.dropped_objects += 1;
            debug!(kind = %kind, name = %name, "dropped object missing from source");
        }
    }

    for (_, table, ddl) in source_objects.iter().filter(|(kind, ..)| kind == "table") {
        if !object_exists(&tx, "main", "table", table)? {
            tx.execute_batch(ddl)?;
            report.created_tables += 1;
            debug!(table = %table, "created table from source");
        }

        let column_list = columns(&tx, SOURCE_SCHEMA, table)?
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let quoted = quote_ident(table);
        tx.execute(&format!("DELETE FROM main.{}", quoted), [])?;
        let rows = tx.execute(
            &format!(
                "INSERT INTO main.{table} ({cols}) SELECT {cols} FROM {schema}.{table}",
                table = quoted,
                cols = column_list,
                schema = SOURCE_SCHEMA
            ),
            [],
        )?;
        report.tables.push(TableCopy {
            table: table.clone(),
            rows,
        });
    }

    report.sequences = copy_sequences(&tx)?;

    for kind in ["index", "view", "trigger"] {
        for (_, name, sql) in source_objects.iter().filter(|(k, ..)| k == kind) {
            if !object_exists(&tx, "main", kind, name)? {
                tx.execute_batch(sql)?;
                report.created_objects += 1;
                debug!(kind = %kind, name = %name, "recreated object from source");
            }
        }
    }

    tx.commit()?;
    Ok(report)
}

/// Replace the target's AUTOINCREMENT counters with the source's so ids
/// freed on the source are not handed out again.
fn copy_sequences(tx: &Transaction<'_>) -> Result<usize> {
    if !object_exists(tx, SOURCE_SCHEMA, "table", "sqlite_sequence")? {
        return Ok(0);
    }
    tx.execute("DELETE FROM main.sqlite_sequence", [])?;
    let copied = tx.execute(
        &format!(
            "INSERT INTO main.sqlite_sequence (name, seq) SELECT name, seq FROM {}.sqlite_sequence",
            SOURCE_SCHEMA
        ),
        [],
    )?;
    Ok(copied)
}

/// User objects of the given types in `schema`, tables before indexes
/// before views before triggers.
fn schema_objects(tx: &Transaction<'_>, schema: &str, kinds: &[&str]) -> Result<Vec<SchemaObject>> {
    let kinds = kinds.iter().map(|k| quote_literal(k)).collect::<Vec<_>>().join(", ");
    let mut stmt = tx.prepare(&format!(
        "SELECT type, name, sql FROM {}.sqlite_master \
         WHERE type IN ({}) AND sql IS NOT NULL AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
         ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 WHEN 'view' THEN 2 ELSE 3 END, name",
        schema, kinds
    ))?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn object_exists(tx: &Transaction<'_>, schema: &str, kind: &str, name: &str) -> Result<bool> {
    let found = tx
        .query_row(
            &format!("SELECT 1 FROM {}.sqlite_master WHERE type = ?1 AND name = ?2", schema),
            params![kind, name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn drop_object(tx: &Transaction<'_>, kind: &str, name: &str) -> Result<()> {
    tx.execute_batch(&format!("DROP {} main.{}", kind.to_ascii_uppercase(), quote_ident(name)))?;
    Ok(())
}

/// Names of the insertable columns of `table`.
fn columns(tx: &Transaction<'_>, schema: &str, table: &str) -> Result<Vec<String>> {
    let mut stmt = tx.prepare(&format!("PRAGMA {}.table_info({})", schema, quote_literal(table)))?;
    let rows = stmt.query_map([], |row| row.get(1))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Read-only `file:` URI for attaching `path`.
fn read_only_uri(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut escaped = String::with_capacity(raw.len() + 16);
    for c in raw.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '?' => escaped.push_str("%3f"),
            '#' => escaped.push_str("%23"),
            _ => escaped.push(c),
        }
    }
    format!("file:{}?mode=ro", escaped)
}
