use crate::error::ShardError;
use crate::value::Value;
use sqlparser::ast::{Expr, Ident, SetExpr, Statement, Value as AstValue};

/// Statement kind recognized by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    Drop,
    Truncate,
    Show,
}

impl QueryKind {
    /// Whether statements of this kind mutate backend state (and therefore
    /// land in the transaction write log).
    pub fn is_write(&self) -> bool {
        !matches!(self, QueryKind::Select | QueryKind::Show)
    }
}

/// Common fields of every parsed statement.
///
/// `text` is the normalized statement with `?` placeholders, which is what
/// reaches the backend for everything except INSERT (INSERT re-serializes
/// the syntax tree after value providers fire). The syntax tree carries the
/// renumbered `:vN` placeholder form used for shard-key analysis.
#[derive(Debug, Clone)]
pub struct QueryBase {
    pub text: String,
    pub args: Vec<Value>,
    pub kind: QueryKind,
    pub table: String,
    /// Resolved shard-key identifier; `None` until resolved.
    pub shard_key: Option<i64>,
    /// 1-based argument index of the shard-key placeholder, 0 when the key
    /// was not bound through a placeholder.
    pub shard_key_placeholder: usize,
    pub(crate) statement: Statement,
}

impl QueryBase {
    pub fn statement(&self) -> &Statement {
        &self.statement
    }
}

/// Deferred producer of the literal emitted for one INSERT column.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueProvider {
    /// Emit the sequencer-assigned id as a numeric literal.
    SequencerId,
    /// Emit the bound argument converted to a SQL literal.
    Bound(Value),
}

/// A parsed INSERT with per-column value providers.
#[derive(Debug, Clone)]
pub struct InsertQuery {
    pub base: QueryBase,
    pub columns: Vec<String>,
    /// Parallel to `columns`; `None` keeps the literal already present in
    /// the statement.
    pub(crate) providers: Vec<Option<ValueProvider>>,
    /// Sequencer-assigned id, set by the executor before serialization.
    pub next_sequence_id: Option<i64>,
}

impl InsertQuery {
    /// Whether a sequencer allocation is still required. An explicit id in
    /// the shard column (the replay path) suppresses allocation.
    pub fn needs_sequencer(&self) -> bool {
        self.providers
            .iter()
            .any(|p| matches!(p, Some(ValueProvider::SequencerId)))
    }

    pub fn set_next_sequence_id(&mut self, id: i64) {
        self.next_sequence_id = Some(id);
    }

    /// Force an explicit id for `column`, replacing its existing value when
    /// the column is present or prepending the column when it is not.
    /// Replay uses this to reproduce the original row.
    pub fn set_assigned_id(&mut self, column: &str, id: i64) -> Result<(), ShardError> {
        if let Some(idx) = self.columns.iter().position(|c| c == column) {
            self.providers[idx] = Some(ValueProvider::Bound(Value::Int(id)));
            return Ok(());
        }

        let Statement::Insert(ins) = &mut self.base.statement else {
            return Err(ShardError::unsupported("not an INSERT statement"));
        };
        let row = values_row_mut(ins)?;
        row.insert(0, Expr::Value(AstValue::Null));
        ins.columns.insert(0, Ident::new(column));
        self.columns.insert(0, column.to_string());
        self.providers
            .insert(0, Some(ValueProvider::Bound(Value::Int(id))));
        Ok(())
    }

    /// Re-serialize the syntax tree with every value provider applied. This
    /// is the text actually dispatched to the backend.
    pub fn to_sql(&self) -> Result<String, ShardError> {
        let mut statement = self.base.statement.clone();
        let Statement::Insert(ins) = &mut statement else {
            return Err(ShardError::unsupported("not an INSERT statement"));
        };
        let row = values_row_mut(ins)?;
        if row.len() != self.providers.len() {
            return Err(ShardError::unsupported(
                "INSERT column list and value list differ in length",
            ));
        }
        for (slot, provider) in row.iter_mut().zip(&self.providers) {
            match provider {
                None => {}
                Some(ValueProvider::SequencerId) => {
                    let id = self.next_sequence_id.ok_or_else(|| {
                        ShardError::backend("sequencer id was not allocated before dispatch")
                    })?;
                    *slot = Expr::Value(AstValue::Number(id.to_string(), false));
                }
                Some(ValueProvider::Bound(value)) => {
                    *slot = value_to_expr(value);
                }
            }
        }
        Ok(statement.to_string())
    }

    /// Final literal of each column, for count-query synthesis. Columns
    /// whose statement literal is kept verbatim resolve through `args`.
    pub(crate) fn column_literals(&self) -> Result<Vec<(String, String)>, ShardError> {
        let Statement::Insert(ins) = &self.base.statement else {
            return Err(ShardError::unsupported("not an INSERT statement"));
        };
        let row = values_row(ins)?;
        let mut pairs = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let literal = match &self.providers[i] {
                Some(ValueProvider::SequencerId) => self
                    .next_sequence_id
                    .ok_or_else(|| {
                        ShardError::backend("sequencer id was not allocated before dispatch")
                    })?
                    .to_string(),
                Some(ValueProvider::Bound(value)) => value.to_literal(),
                None => crate::parser::expr_literal(&row[i], &self.base.args)?,
            };
            pairs.push((column.clone(), literal));
        }
        Ok(pairs)
    }
}

/// A parsed DELETE with its routing flags.
#[derive(Debug, Clone)]
pub struct DeleteQuery {
    pub base: QueryBase,
    /// No WHERE/ORDER/LIMIT and no shard key: broadcast to every shard.
    pub is_delete_table: bool,
    /// Some WHERE/ORDER/LIMIT but no shard key: deliberately unimplemented.
    pub is_all_shards_delete: bool,
}

/// A statement parsed and classified by the router.
#[derive(Debug, Clone)]
pub enum ParsedQuery {
    Insert(InsertQuery),
    Delete(DeleteQuery),
    Other(QueryBase),
}

impl ParsedQuery {
    pub fn base(&self) -> &QueryBase {
        match self {
            ParsedQuery::Insert(q) => &q.base,
            ParsedQuery::Delete(q) => &q.base,
            ParsedQuery::Other(q) => q,
        }
    }

    pub fn base_mut(&mut self) -> &mut QueryBase {
        match self {
            ParsedQuery::Insert(q) => &mut q.base,
            ParsedQuery::Delete(q) => &mut q.base,
            ParsedQuery::Other(q) => q,
        }
    }

    pub fn kind(&self) -> QueryKind {
        self.base().kind
    }

    pub fn table(&self) -> &str {
        &self.base().table
    }

    pub fn shard_key(&self) -> Option<i64> {
        self.base().shard_key
    }
}

/// Convert a bound value into a syntax-tree literal. Booleans become `1`/`0`
/// and timestamps the `YYYY-MM-DD HH:MM:SS` form, matching the literal
/// rendering rules of the INSERT value providers.
pub(crate) fn value_to_expr(value: &Value) -> Expr {
    match value {
        Value::Null => Expr::Value(AstValue::Null),
        Value::Bool(b) => Expr::Value(AstValue::Number(
            if *b { "1" } else { "0" }.to_string(),
            false,
        )),
        Value::Int(i) => Expr::Value(AstValue::Number(i.to_string(), false)),
        Value::UInt(u) => Expr::Value(AstValue::Number(u.to_string(), false)),
        Value::Float(f) => Expr::Value(AstValue::Number(f.to_string(), false)),
        Value::Text(s) => Expr::Value(AstValue::SingleQuotedString(s.clone())),
        Value::Bytes(b) => Expr::Value(AstValue::SingleQuotedString(
            String::from_utf8_lossy(b).into_owned(),
        )),
        Value::DateTime(dt) => Expr::Value(AstValue::SingleQuotedString(
            dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        )),
    }
}

fn values_row(ins: &sqlparser::ast::Insert) -> Result<&Vec<Expr>, ShardError> {
    let source = ins
        .source
        .as_ref()
        .ok_or_else(|| ShardError::unsupported("INSERT without a VALUES clause"))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(ShardError::unsupported("INSERT source is not a VALUES list"));
    };
    match values.rows.len() {
        1 => Ok(&values.rows[0]),
        _ => Err(ShardError::unsupported(
            "multi-row INSERT is not supported",
        )),
    }
}

fn values_row_mut(ins: &mut sqlparser::ast::Insert) -> Result<&mut Vec<Expr>, ShardError> {
    let source = ins
        .source
        .as_mut()
        .ok_or_else(|| ShardError::unsupported("INSERT without a VALUES clause"))?;
    let SetExpr::Values(values) = source.body.as_mut() else {
        return Err(ShardError::unsupported("INSERT source is not a VALUES list"));
    };
    match values.rows.len() {
        1 => Ok(&mut values.rows[0]),
        _ => Err(ShardError::unsupported(
            "multi-row INSERT is not supported",
        )),
    }
}
