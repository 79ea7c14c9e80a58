//! Recovery protocol: deterministic re-execution of captured writes.
//!
//! After a critical commit failure the application holds the failed
//! [`WriteQuery`] entries. For each one it can check whether the write
//! already landed ([`Database::is_already_committed_query_log`]) and replay
//! it if not ([`Database::exec_with_query_log`]), restoring cross-shard
//! consistency with at-most-once semantics given idempotent keys.

use crate::adapter::ExecResult;
use crate::database::Database;
use crate::error::ShardError;
use crate::executor;
use crate::parser::{expr_literal, placeholder_index};
use crate::query::{ParsedQuery, QueryKind};
use crate::transaction::WriteQuery;
use crate::value::Value;
use sqlparser::ast::{AssignmentTarget, BinaryOperator, Expr, Statement};

impl Database {
    /// Re-parse a captured write. For an INSERT with a known
    /// `last_insert_id`, the id is injected back into the syntax tree —
    /// replacing the existing shard-column value or prepending the column —
    /// so re-execution reproduces the original row and suppresses sequencer
    /// allocation.
    pub fn parsed_query_from_log(&self, entry: &WriteQuery) -> Result<ParsedQuery, ShardError> {
        let mut parsed = self.parser().parse(&entry.query, &entry.args)?;
        if let ParsedQuery::Insert(insert) = &mut parsed {
            if entry.last_insert_id != 0 {
                let table = insert.base.table.clone();
                let shard_column = self
                    .manager()
                    .shard_column(&table)
                    .unwrap_or_else(|| "id".to_string());
                insert.set_assigned_id(&shard_column, entry.last_insert_id)?;
                let key_column = self.manager().shard_key_column(&table);
                if key_column.as_deref() == Some(shard_column.as_str()) {
                    insert.base.shard_key = Some(entry.last_insert_id);
                }
            }
        }
        Ok(parsed)
    }

    /// Synthesize `SELECT COUNT(*) FROM <table> WHERE <equality conjunction
    /// of all known columns>` for a captured INSERT, UPDATE, or DELETE.
    pub fn to_count_query(&self, parsed: &ParsedQuery) -> Result<String, ShardError> {
        let pairs = match parsed {
            ParsedQuery::Insert(insert) => insert.column_literals()?,
            ParsedQuery::Delete(delete) => {
                selection_pairs(&delete.base.statement, &delete.base.args)?
            }
            ParsedQuery::Other(base) if base.kind == QueryKind::Update => {
                let mut pairs = assignment_pairs(&base.statement, &base.args)?;
                pairs.extend(selection_pairs(&base.statement, &base.args)?);
                pairs
            }
            other => {
                return Err(ShardError::unsupported(format!(
                    "count query synthesis is only defined for writes, got {:?}",
                    other.kind()
                )))
            }
        };

        let table = parsed.table();
        if pairs.is_empty() {
            return Ok(format!("SELECT COUNT(*) FROM {table}"));
        }
        let conjunction = pairs
            .iter()
            .map(|(column, literal)| format!("{column} = {literal}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        Ok(format!("SELECT COUNT(*) FROM {table} WHERE {conjunction}"))
    }

    /// Whether a captured write is already visible on its shard: `count >
    /// 0` for INSERT/UPDATE, `count == 0` for DELETE.
    pub fn is_already_committed_query_log(
        &self,
        entry: &WriteQuery,
    ) -> Result<bool, ShardError> {
        let parsed = self.parsed_query_from_log(entry)?;
        let kind = parsed.kind();
        let count_sql = self.to_count_query(&parsed)?;
        let rows = self.query(&count_sql, &[])?;
        let count = rows.scalar_i64().unwrap_or(0);
        match kind {
            QueryKind::Insert | QueryKind::Update => Ok(count > 0),
            QueryKind::Delete => Ok(count == 0),
            other => Err(ShardError::unsupported(format!(
                "idempotence check is only defined for writes, got {other:?}"
            ))),
        }
    }

    /// Re-execute a captured write through the same routing path as the
    /// original call.
    pub fn exec_with_query_log(&self, entry: &WriteQuery) -> Result<ExecResult, ShardError> {
        let parsed = self.parsed_query_from_log(entry)?;
        let conn = self.manager().connection_by_table(parsed.table())?;
        executor::exec(&conn, parsed, None)
    }
}

/// `(column, literal)` pairs of a SET clause, with placeholders resolved
/// through the bound arguments.
fn assignment_pairs(
    statement: &Statement,
    args: &[Value],
) -> Result<Vec<(String, String)>, ShardError> {
    let Statement::Update { assignments, .. } = statement else {
        return Err(ShardError::unsupported("not an UPDATE statement"));
    };
    let mut pairs = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let AssignmentTarget::ColumnName(name) = &assignment.target else {
            return Err(ShardError::unsupported(
                "tuple assignment targets are not supported",
            ));
        };
        let column = name
            .0
            .last()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| ShardError::unsupported("empty assignment target"))?;
        pairs.push((column, resolved_literal(&assignment.value, args)?));
    }
    Ok(pairs)
}

/// `(column, literal)` pairs of a WHERE equality conjunction.
fn selection_pairs(
    statement: &Statement,
    args: &[Value],
) -> Result<Vec<(String, String)>, ShardError> {
    let selection = match statement {
        Statement::Update { selection, .. } => selection.as_ref(),
        Statement::Delete(del) => del.selection.as_ref(),
        _ => None,
    };
    let mut pairs = Vec::new();
    if let Some(expr) = selection {
        collect_equality_pairs(expr, args, &mut pairs)?;
    }
    Ok(pairs)
}

fn collect_equality_pairs(
    expr: &Expr,
    args: &[Value],
    pairs: &mut Vec<(String, String)>,
) -> Result<(), ShardError> {
    match expr {
        Expr::Nested(inner) => collect_equality_pairs(inner, args, pairs),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_equality_pairs(left, args, pairs)?;
            collect_equality_pairs(right, args, pairs)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let column = match left.as_ref() {
                Expr::Identifier(ident) => ident.value.clone(),
                Expr::CompoundIdentifier(parts) => parts
                    .last()
                    .map(|ident| ident.value.clone())
                    .ok_or_else(|| ShardError::unsupported("empty column reference"))?,
                _ => return Ok(()),
            };
            pairs.push((column, resolved_literal(right, args)?));
            Ok(())
        }
        _ => Ok(()),
    }
}

fn resolved_literal(expr: &Expr, args: &[Value]) -> Result<String, ShardError> {
    // Placeholders resolve to the captured argument; everything else keeps
    // its source rendering.
    if let Expr::Value(sqlparser::ast::Value::Placeholder(p)) = expr {
        if placeholder_index(p).is_none() {
            return Err(ShardError::unsupported(format!(
                "unrecognized placeholder {p}"
            )));
        }
    }
    expr_literal(expr, args)
}
