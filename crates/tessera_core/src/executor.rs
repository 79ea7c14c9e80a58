use crate::adapter::{ExecResult, Row, Rows};
use crate::connection::{ShardBackend, TableConnection};
use crate::debug;
use crate::error::{join_errors, ShardError};
use crate::query::{DeleteQuery, InsertQuery, ParsedQuery, QueryBase, QueryKind};
use crate::transaction::TxState;
use crate::value::Value;
use log::warn;
use std::sync::Arc;

/// Execute a mutating statement against its shard(s).
pub(crate) fn exec(
    conn: &Arc<TableConnection>,
    parsed: ParsedQuery,
    mut tx: Option<&mut TxState>,
) -> Result<ExecResult, ShardError> {
    match parsed {
        ParsedQuery::Insert(insert) => exec_insert(conn, insert, tx),
        ParsedQuery::Delete(delete) => exec_delete(conn, delete, tx),
        ParsedQuery::Other(base) => match base.kind {
            QueryKind::Update => exec_update(conn, base, tx),
            QueryKind::CreateTable | QueryKind::Drop | QueryKind::Truncate => {
                exec_broadcast(conn, base, tx.as_deref_mut())
            }
            QueryKind::Select | QueryKind::Show => Err(ShardError::unsupported(
                "read statements must go through query",
            )),
            QueryKind::Insert | QueryKind::Delete => {
                Err(ShardError::unsupported("statement was not specialized"))
            }
        },
    }
}

/// Execute a read statement against its shard(s).
pub(crate) fn query(
    conn: &Arc<TableConnection>,
    parsed: ParsedQuery,
    tx: Option<&mut TxState>,
) -> Result<Rows, ShardError> {
    let base = match parsed {
        ParsedQuery::Other(base) if base.kind == QueryKind::Select => base,
        ParsedQuery::Other(base) if base.kind == QueryKind::Show => {
            return query_show(conn, base);
        }
        other => {
            return Err(ShardError::unsupported(format!(
                "{:?} statements must go through exec",
                other.kind()
            )))
        }
    };
    query_select(conn, base, tx)
}

/// Execute a read statement expected to yield at most one row.
///
/// A SELECT against a sharded table with an unresolved shard key yields a
/// null row instead of scattering.
pub(crate) fn query_row(
    conn: &Arc<TableConnection>,
    parsed: ParsedQuery,
    tx: Option<&mut TxState>,
) -> Result<Option<Row>, ShardError> {
    if conn.is_shard() && parsed.kind() == QueryKind::Select && parsed.shard_key().is_none() {
        warn!(
            "[ROUTE] query_row on table {} without a shard key returns a null row",
            conn.table()
        );
        return Ok(None);
    }
    let rows = query(conn, parsed, tx)?;
    Ok(rows.rows.into_iter().next())
}

fn exec_on(
    conn: &Arc<TableConnection>,
    shard: &ShardBackend,
    tx: Option<&mut TxState>,
    sql: &str,
    args: &[Value],
) -> Result<ExecResult, ShardError> {
    debug::trace_route(conn.table(), &shard.name, sql);
    match tx {
        Some(state) => state.handle_for(conn, shard)?.exec(sql, args),
        None => shard.connection.exec(sql, args),
    }
}

fn query_on(
    conn: &Arc<TableConnection>,
    shard: &ShardBackend,
    tx: Option<&mut TxState>,
    base: &QueryBase,
) -> Result<Rows, ShardError> {
    debug::trace_route(conn.table(), &shard.name, &base.text);
    match tx {
        Some(state) => {
            let rows = state.handle_for(conn, shard)?.query(&base.text, &base.args)?;
            state.log_read(base.text.clone(), base.args.clone());
            Ok(rows)
        }
        None => shard.connection.query(&base.text, &base.args),
    }
}

fn query_select(
    conn: &Arc<TableConnection>,
    base: QueryBase,
    mut tx: Option<&mut TxState>,
) -> Result<Rows, ShardError> {
    if !conn.is_shard() {
        return query_on(conn, conn.single()?, tx.as_deref_mut(), &base);
    }

    match base.shard_key {
        Some(key) => {
            let shard = conn.shard_for_key(key)?;
            query_on(conn, shard, tx.as_deref_mut(), &base)
        }
        None => {
            // Scatter: every shard, concatenated in shard order, with no
            // merge, sort, limit, or aggregation. Always runs outside the
            // enclosing transaction.
            warn!(
                "[ROUTE] scatter query on table {}: per-shard results are concatenated unmerged",
                conn.table()
            );
            let mut all = Rows::empty();
            for shard in conn.shards() {
                all.extend(query_on(conn, shard, None, &base)?);
            }
            Ok(all)
        }
    }
}

fn query_show(conn: &Arc<TableConnection>, base: QueryBase) -> Result<Rows, ShardError> {
    let mut first = None;
    let mut errors = Vec::new();
    for shard in conn.shards() {
        match query_on(conn, shard, None, &base) {
            Ok(rows) if first.is_none() => first = Some(rows),
            Ok(_) => {}
            Err(e) => errors.push(e),
        }
    }
    match first {
        Some(rows) => {
            if !errors.is_empty() {
                warn!(
                    "[BROADCAST] SHOW on table {} failed on {} shard(s)",
                    conn.table(),
                    errors.len()
                );
            }
            Ok(rows)
        }
        None => join_errors(errors).map(|_| Rows::empty()),
    }
}

fn exec_insert(
    conn: &Arc<TableConnection>,
    mut insert: InsertQuery,
    mut tx: Option<&mut TxState>,
) -> Result<ExecResult, ShardError> {
    let uses_sequencer = insert.needs_sequencer();
    if uses_sequencer {
        let sequencer = conn.sequencer().ok_or_else(|| {
            ShardError::invalid_config(format!(
                "table {} has a shard column but no sequencer",
                conn.table()
            ))
        })?;
        let id = conn
            .adapter()
            .next_sequence_id(sequencer.as_ref(), conn.table())?;
        insert.set_next_sequence_id(id);
    }

    let sql = insert.to_sql()?;
    let shard = if conn.is_shard() {
        let key = insert_routing_key(conn, &insert)?;
        conn.shard_for_key(key)?
    } else {
        conn.single()?
    };

    let driver_result = exec_on(conn, shard, tx.as_deref_mut(), &sql, &[])?;
    let result = if uses_sequencer {
        ExecResult::new(
            insert.next_sequence_id.unwrap_or(driver_result.last_insert_id),
            1,
        )
    } else {
        driver_result
    };

    if let Some(state) = tx.as_deref_mut() {
        state.log_write(
            shard.dsn.clone(),
            insert.base.text.clone(),
            insert.base.args.clone(),
            result.last_insert_id,
        );
    }
    Ok(result)
}

/// The value routed through the sharding algorithm for an INSERT: the
/// freshly allocated id when the sequencer column doubles as the shard key,
/// the bound shard-key value otherwise.
fn insert_routing_key(
    conn: &Arc<TableConnection>,
    insert: &InsertQuery,
) -> Result<i64, ShardError> {
    let shard_column = conn.shard_column();
    let key_column = conn.shard_key_column();
    if shard_column.is_some() && shard_column == key_column {
        if let Some(id) = insert.next_sequence_id {
            return Ok(id);
        }
    }
    insert.base.shard_key.ok_or(ShardError::ShardingKeyMissing)
}

fn exec_update(
    conn: &Arc<TableConnection>,
    base: QueryBase,
    mut tx: Option<&mut TxState>,
) -> Result<ExecResult, ShardError> {
    if !conn.is_shard() {
        return exec_and_log(conn, conn.single()?, tx.as_deref_mut(), &base);
    }
    let key = base.shard_key.ok_or(ShardError::ShardingKeyMissing)?;
    let shard = conn.shard_for_key(key)?;
    exec_and_log(conn, shard, tx.as_deref_mut(), &base)
}

fn exec_delete(
    conn: &Arc<TableConnection>,
    delete: DeleteQuery,
    mut tx: Option<&mut TxState>,
) -> Result<ExecResult, ShardError> {
    if !conn.is_shard() {
        return exec_and_log(conn, conn.single()?, tx.as_deref_mut(), &delete.base);
    }

    if let Some(key) = delete.base.shard_key {
        let shard = conn.shard_for_key(key)?;
        return exec_and_log(conn, shard, tx.as_deref_mut(), &delete.base);
    }

    if delete.is_all_shards_delete {
        return Err(ShardError::NotSupported(
            "DELETE with conditions but no shard key is not implemented".to_string(),
        ));
    }

    debug_assert!(delete.is_delete_table);
    exec_broadcast(conn, delete.base, tx.as_deref_mut())
}

fn exec_broadcast(
    conn: &Arc<TableConnection>,
    base: QueryBase,
    mut tx: Option<&mut TxState>,
) -> Result<ExecResult, ShardError> {
    let mut total = ExecResult::default();
    let mut errors = Vec::new();
    let mut succeeded = 0usize;
    for shard in conn.shards() {
        match exec_and_log(conn, shard, tx.as_deref_mut(), &base) {
            Ok(result) => {
                total.rows_affected += result.rows_affected;
                succeeded += 1;
            }
            Err(e) => errors.push(e),
        }
    }
    if !errors.is_empty() {
        warn!(
            "[BROADCAST] {:?} on table {} succeeded on {succeeded} of {} shard(s)",
            base.kind,
            conn.table(),
            conn.shards().len()
        );
        return join_errors(errors).map(|_| total);
    }
    Ok(total)
}

fn exec_and_log(
    conn: &Arc<TableConnection>,
    shard: &ShardBackend,
    mut tx: Option<&mut TxState>,
    base: &QueryBase,
) -> Result<ExecResult, ShardError> {
    let result = exec_on(conn, shard, tx.as_deref_mut(), &base.text, &base.args)?;
    if let Some(state) = tx {
        state.log_write(
            shard.dsn.clone(),
            base.text.clone(),
            base.args.clone(),
            result.last_insert_id,
        );
    }
    Ok(result)
}
