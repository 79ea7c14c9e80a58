use crate::config::Config;
use crate::error::ShardError;
use crate::query::{
    DeleteQuery, InsertQuery, ParsedQuery, QueryBase, QueryKind, ValueProvider,
};
use crate::value::Value;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    BinaryOperator, Expr, FromTable, ObjectName, ObjectType, Query, SelectItem, SetExpr,
    Statement, TableFactor, Value as AstValue,
};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, SQLiteDialect};
use sqlparser::parser::Parser as SqlParser;
use std::sync::Arc;

static ENGINE_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*engine\s*=\s*\w+").expect("static regex"));
static CHARSET_CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(default\s+)?(charset|character\s+set)\s*=\s*\w+").expect("static regex")
});
static AUTOINCREMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bautoincrement\b").expect("static regex"));

/// Statement parser: normalizes dialect differences, classifies the
/// statement, and extracts the shard-key value for the target table.
#[derive(Clone)]
pub struct Parser {
    config: Arc<Config>,
}

impl Parser {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Syntax-check a statement without binding arguments. Preparation
    /// uses this; shard-key resolution happens at execution time when the
    /// arguments are known.
    pub(crate) fn check(&self, text: &str) -> Result<(), ShardError> {
        let normalized = normalize(text);
        let statement = parse_single_statement(&normalized)?;
        reject_unsupported(&statement)?;
        classify(&statement).map(|_| ())
    }

    /// Parse one statement. `args` are the values bound to its `?`
    /// placeholders, in order.
    pub fn parse(&self, text: &str, args: &[Value]) -> Result<ParsedQuery, ShardError> {
        let normalized = normalize(text);
        let mut statement = parse_single_statement(&normalized)?;
        renumber_placeholders(&mut statement);
        reject_unsupported(&statement)?;

        let (kind, table) = classify(&statement)?;
        let table_config = self.config.table(&table);
        let shard_column = table_config.and_then(|t| t.shard_column()).map(str::to_owned);
        let shard_key_column = table_config
            .and_then(|t| t.shard_key_column())
            .map(str::to_owned);

        let mut base = QueryBase {
            text: normalized,
            args: args.to_vec(),
            kind,
            table,
            shard_key: None,
            shard_key_placeholder: 0,
            statement,
        };

        if kind == QueryKind::Insert {
            return self
                .specialize_insert(base, shard_column.as_deref(), shard_key_column.as_deref())
                .map(ParsedQuery::Insert);
        }

        if let Some(key_column) = shard_key_column.as_deref() {
            if let Some(selection) = statement_selection(&base.statement) {
                let found = find_shard_key(selection, key_column, args)?;
                base.shard_key = found.key;
                base.shard_key_placeholder = found.placeholder;
            }
        }

        if kind == QueryKind::Delete {
            let (has_where, has_order, has_limit) = delete_qualifiers(&base.statement)?;
            let qualified = has_where || has_order || has_limit;
            let keyless = base.shard_key.is_none();
            return Ok(ParsedQuery::Delete(DeleteQuery {
                is_delete_table: keyless && !qualified,
                is_all_shards_delete: keyless && qualified,
                base,
            }));
        }

        Ok(ParsedQuery::Other(base))
    }

    fn specialize_insert(
        &self,
        mut base: QueryBase,
        shard_column: Option<&str>,
        shard_key_column: Option<&str>,
    ) -> Result<InsertQuery, ShardError> {
        let Statement::Insert(ins) = &base.statement else {
            return Err(ShardError::unsupported("not an INSERT statement"));
        };
        if ins.columns.is_empty() {
            return Err(ShardError::unsupported(
                "INSERT without an explicit column list is not supported",
            ));
        }
        let columns: Vec<String> = ins.columns.iter().map(|c| c.value.clone()).collect();
        let row = insert_values_row(ins)?;
        if row.len() != columns.len() {
            return Err(ShardError::unsupported(
                "INSERT column list and value list differ in length",
            ));
        }

        let mut providers: Vec<Option<ValueProvider>> = Vec::with_capacity(columns.len());
        let mut shard_key = None;
        let mut shard_key_placeholder = 0;

        for (column, expr) in columns.iter().zip(row) {
            let is_shard_column = shard_column.is_some_and(|c| column.eq_ignore_ascii_case(c));
            let is_key_column = shard_key_column.is_some_and(|c| column.eq_ignore_ascii_case(c));

            let provider = match expr {
                Expr::Value(AstValue::Placeholder(p)) => {
                    let index = placeholder_index(p).ok_or_else(|| {
                        ShardError::unsupported(format!("unrecognized placeholder {p}"))
                    })?;
                    let arg = base.args.get(index - 1).cloned().ok_or_else(|| {
                        ShardError::unsupported(format!(
                            "placeholder :v{index} has no bound argument"
                        ))
                    })?;
                    if arg.is_null() {
                        if is_shard_column {
                            // The sequencer fills this slot at dispatch time.
                            Some(ValueProvider::SequencerId)
                        } else if is_key_column {
                            return Err(ShardError::ShardingKeyNull);
                        } else {
                            Some(ValueProvider::Bound(Value::Null))
                        }
                    } else {
                        if is_key_column {
                            if let Some(key) = arg.as_shard_key() {
                                shard_key = Some(key);
                                shard_key_placeholder = index;
                            }
                        }
                        Some(ValueProvider::Bound(arg))
                    }
                }
                Expr::Value(AstValue::Null) if is_shard_column => {
                    Some(ValueProvider::SequencerId)
                }
                Expr::Value(AstValue::Number(n, _)) => {
                    if is_key_column {
                        shard_key = n.parse::<i64>().ok();
                    }
                    None
                }
                _ => None,
            };
            providers.push(provider);
        }

        base.shard_key = shard_key;
        base.shard_key_placeholder = shard_key_placeholder;
        Ok(InsertQuery {
            base,
            columns,
            providers,
            next_sequence_id: None,
        })
    }
}

/// Reconcile dialect differences before parsing: fold double quotes to
/// backticks (outside string literals), drop trailing semicolons, lowercase
/// `AUTOINCREMENT`, and strip `ENGINE=`/`CHARSET=` table options.
pub(crate) fn normalize(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    let mut in_string = false;
    for ch in text.chars() {
        match ch {
            '\'' => {
                in_string = !in_string;
                folded.push(ch);
            }
            '"' if !in_string => folded.push('`'),
            _ => folded.push(ch),
        }
    }

    let stripped = ENGINE_CLAUSE.replace_all(&folded, "");
    let stripped = CHARSET_CLAUSE.replace_all(&stripped, "");
    let lowered = AUTOINCREMENT.replace_all(&stripped, "autoincrement");
    lowered.trim().trim_end_matches(';').trim_end().to_string()
}

fn parse_single_statement(sql: &str) -> Result<Statement, ShardError> {
    let dialects: [&dyn Dialect; 3] = [&MySqlDialect {}, &SQLiteDialect {}, &GenericDialect {}];
    let mut last_error = None;
    for dialect in dialects {
        match SqlParser::parse_sql(dialect, sql) {
            Ok(mut statements) => {
                if statements.len() != 1 {
                    return Err(ShardError::unsupported(
                        "expected exactly one statement",
                    ));
                }
                return Ok(statements.remove(0));
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(ShardError::unsupported(format!(
        "parse error: {}",
        last_error.expect("at least one dialect attempted")
    )))
}

/// 1-based argument index of a `:vN` placeholder.
pub(crate) fn placeholder_index(placeholder: &str) -> Option<usize> {
    placeholder
        .strip_prefix(":v")
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
}

/// Rewrite anonymous `?` placeholders to the internal 1-based `:vN` form,
/// numbering them in source order. Explicit `:vN` placeholders keep their
/// index and advance the counter.
fn renumber_placeholders(statement: &mut Statement) {
    let mut next = 0usize;
    visit_exprs_mut(statement, &mut |expr| {
        if let Expr::Value(AstValue::Placeholder(p)) = expr {
            if p.as_str() == "?" {
                next += 1;
                *p = format!(":v{next}");
            } else if let Some(n) = placeholder_index(p) {
                next = n;
            }
        }
    });
}

fn visit_exprs_mut(statement: &mut Statement, f: &mut impl FnMut(&mut Expr)) {
    match statement {
        Statement::Query(q) => visit_query_mut(q, f),
        Statement::Insert(ins) => {
            if let Some(source) = ins.source.as_mut() {
                visit_query_mut(source, f);
            }
        }
        Statement::Update {
            assignments,
            selection,
            ..
        } => {
            for assignment in assignments {
                visit_expr_mut(&mut assignment.value, f);
            }
            if let Some(selection) = selection {
                visit_expr_mut(selection, f);
            }
        }
        Statement::Delete(del) => {
            if let Some(selection) = del.selection.as_mut() {
                visit_expr_mut(selection, f);
            }
            for order in &mut del.order_by {
                visit_expr_mut(&mut order.expr, f);
            }
            if let Some(limit) = del.limit.as_mut() {
                visit_expr_mut(limit, f);
            }
        }
        _ => {}
    }
}

fn visit_query_mut(query: &mut Query, f: &mut impl FnMut(&mut Expr)) {
    match query.body.as_mut() {
        SetExpr::Select(select) => {
            for item in &mut select.projection {
                match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                        visit_expr_mut(expr, f)
                    }
                    _ => {}
                }
            }
            if let Some(selection) = select.selection.as_mut() {
                visit_expr_mut(selection, f);
            }
        }
        SetExpr::Values(values) => {
            for row in &mut values.rows {
                for expr in row {
                    visit_expr_mut(expr, f);
                }
            }
        }
        _ => {}
    }
    if let Some(order_by) = query.order_by.as_mut() {
        for order in &mut order_by.exprs {
            visit_expr_mut(&mut order.expr, f);
        }
    }
    if let Some(limit) = query.limit.as_mut() {
        visit_expr_mut(limit, f);
    }
}

fn visit_expr_mut(expr: &mut Expr, f: &mut impl FnMut(&mut Expr)) {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            visit_expr_mut(left, f);
            visit_expr_mut(right, f);
        }
        Expr::UnaryOp { expr: inner, .. } | Expr::Nested(inner) => visit_expr_mut(inner, f),
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => visit_expr_mut(inner, f),
        Expr::Between {
            expr: inner,
            low,
            high,
            ..
        } => {
            visit_expr_mut(inner, f);
            visit_expr_mut(low, f);
            visit_expr_mut(high, f);
        }
        Expr::InList {
            expr: inner, list, ..
        } => {
            visit_expr_mut(inner, f);
            for item in list {
                visit_expr_mut(item, f);
            }
        }
        _ => f(expr),
    }
}

/// Reject statements the router cannot route soundly.
fn reject_unsupported(statement: &Statement) -> Result<(), ShardError> {
    match statement {
        Statement::Query(q) => reject_unsupported_query(q),
        Statement::Insert(ins) => match ins.source.as_ref() {
            Some(source) => match source.body.as_ref() {
                SetExpr::Values(_) => Ok(()),
                _ => Err(ShardError::unsupported(
                    "INSERT ... SELECT is not supported",
                )),
            },
            None => Err(ShardError::unsupported(
                "INSERT without a VALUES clause is not supported",
            )),
        },
        Statement::Update {
            table, selection, ..
        } => {
            if !table.joins.is_empty() {
                return Err(ShardError::unsupported("JOIN is not supported"));
            }
            check_no_subquery(selection.as_ref())
        }
        Statement::Delete(del) => {
            let tables = delete_tables(del);
            if tables.iter().any(|t| !t.joins.is_empty()) {
                return Err(ShardError::unsupported("JOIN is not supported"));
            }
            check_no_subquery(del.selection.as_ref())
        }
        _ => Ok(()),
    }
}

fn reject_unsupported_query(query: &Query) -> Result<(), ShardError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(ShardError::unsupported(
            "set operations and non-SELECT query bodies are not supported",
        ));
    };
    if select.from.len() > 1 || select.from.iter().any(|f| !f.joins.is_empty()) {
        return Err(ShardError::unsupported("JOIN is not supported"));
    }
    for from in &select.from {
        if matches!(from.relation, TableFactor::Derived { .. }) {
            return Err(ShardError::unsupported("subquery is not supported"));
        }
    }
    for item in &select.projection {
        if let SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } = item {
            if contains_subquery(expr) {
                return Err(ShardError::unsupported("subquery is not supported"));
            }
        }
    }
    check_no_subquery(select.selection.as_ref())
}

fn check_no_subquery(selection: Option<&Expr>) -> Result<(), ShardError> {
    match selection {
        Some(expr) if contains_subquery(expr) => {
            Err(ShardError::unsupported("subquery is not supported"))
        }
        _ => Ok(()),
    }
}

fn contains_subquery(expr: &Expr) -> bool {
    match expr {
        Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. } => true,
        Expr::BinaryOp { left, right, .. } => contains_subquery(left) || contains_subquery(right),
        Expr::UnaryOp { expr: inner, .. } | Expr::Nested(inner) => contains_subquery(inner),
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => contains_subquery(inner),
        Expr::Between {
            expr: inner,
            low,
            high,
            ..
        } => contains_subquery(inner) || contains_subquery(low) || contains_subquery(high),
        Expr::InList {
            expr: inner, list, ..
        } => contains_subquery(inner) || list.iter().any(contains_subquery),
        _ => false,
    }
}

fn classify(statement: &Statement) -> Result<(QueryKind, String), ShardError> {
    match statement {
        Statement::Query(q) => Ok((QueryKind::Select, query_table_name(q)?)),
        Statement::Insert(ins) => Ok((QueryKind::Insert, object_name(&ins.table_name)?)),
        Statement::Update { table, .. } => {
            Ok((QueryKind::Update, table_factor_name(&table.relation)?))
        }
        Statement::Delete(del) => {
            let tables = delete_tables(del);
            let first = tables
                .first()
                .ok_or_else(|| ShardError::unsupported("DELETE without a target table"))?;
            Ok((QueryKind::Delete, table_factor_name(&first.relation)?))
        }
        Statement::CreateTable(ct) => Ok((QueryKind::CreateTable, object_name(&ct.name)?)),
        Statement::Drop {
            object_type, names, ..
        } => {
            if *object_type != ObjectType::Table {
                return Err(ShardError::unsupported("only DROP TABLE is supported"));
            }
            let name = names
                .first()
                .ok_or_else(|| ShardError::unsupported("DROP without a target table"))?;
            Ok((QueryKind::Drop, object_name(name)?))
        }
        Statement::Truncate { table_name, .. } => {
            Ok((QueryKind::Truncate, object_name(table_name)?))
        }
        Statement::ShowColumns { table_name, .. } => {
            Ok((QueryKind::Show, object_name(table_name)?))
        }
        other => Err(ShardError::unsupported(format!(
            "unsupported statement: {other}"
        ))),
    }
}

fn delete_qualifiers(statement: &Statement) -> Result<(bool, bool, bool), ShardError> {
    let Statement::Delete(del) = statement else {
        return Err(ShardError::unsupported("not a DELETE statement"));
    };
    Ok((
        del.selection.is_some(),
        !del.order_by.is_empty(),
        del.limit.is_some(),
    ))
}

fn delete_tables(del: &sqlparser::ast::Delete) -> &[sqlparser::ast::TableWithJoins] {
    match &del.from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    }
}

fn query_table_name(query: &Query) -> Result<String, ShardError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(ShardError::unsupported(
            "set operations and non-SELECT query bodies are not supported",
        ));
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| ShardError::unsupported("SELECT without a FROM clause"))?;
    table_factor_name(&from.relation)
}

fn table_factor_name(factor: &TableFactor) -> Result<String, ShardError> {
    match factor {
        TableFactor::Table { name, .. } => object_name(name),
        _ => Err(ShardError::unsupported("unsupported table reference")),
    }
}

fn object_name(name: &ObjectName) -> Result<String, ShardError> {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .ok_or_else(|| ShardError::unsupported("empty table name"))
}

fn statement_selection(statement: &Statement) -> Option<&Expr> {
    match statement {
        Statement::Query(q) => match q.body.as_ref() {
            SetExpr::Select(select) => select.selection.as_ref(),
            _ => None,
        },
        Statement::Update { selection, .. } => selection.as_ref(),
        Statement::Delete(del) => del.selection.as_ref(),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct FoundKey {
    key: Option<i64>,
    placeholder: usize,
}

/// Walk a WHERE/AND tree looking for `<key_column> = <value>`, resolving a
/// bound placeholder through `args`.
fn find_shard_key(expr: &Expr, key_column: &str, args: &[Value]) -> Result<FoundKey, ShardError> {
    match expr {
        Expr::Nested(inner) => find_shard_key(inner, key_column, args),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let found = find_shard_key(left, key_column, args)?;
            if found.key.is_some() {
                return Ok(found);
            }
            find_shard_key(right, key_column, args)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            if !ident_matches(left, key_column) {
                return Ok(FoundKey::default());
            }
            match right.as_ref() {
                Expr::Value(AstValue::Number(n, _)) => Ok(FoundKey {
                    key: n.parse::<i64>().ok(),
                    placeholder: 0,
                }),
                Expr::Value(AstValue::Placeholder(p)) => {
                    let index = placeholder_index(p).ok_or_else(|| {
                        ShardError::unsupported(format!("unrecognized placeholder {p}"))
                    })?;
                    let arg = args.get(index - 1).ok_or_else(|| {
                        ShardError::unsupported(format!(
                            "placeholder :v{index} has no bound argument"
                        ))
                    })?;
                    if arg.is_null() {
                        return Err(ShardError::ShardingKeyNull);
                    }
                    Ok(FoundKey {
                        key: arg.as_shard_key(),
                        placeholder: index,
                    })
                }
                _ => Ok(FoundKey::default()),
            }
        }
        _ => Ok(FoundKey::default()),
    }
}

fn ident_matches(expr: &Expr, column: &str) -> bool {
    match expr {
        Expr::Identifier(ident) => ident.value.eq_ignore_ascii_case(column),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .is_some_and(|ident| ident.value.eq_ignore_ascii_case(column)),
        _ => false,
    }
}

fn insert_values_row(ins: &sqlparser::ast::Insert) -> Result<&Vec<Expr>, ShardError> {
    let source = ins
        .source
        .as_ref()
        .ok_or_else(|| ShardError::unsupported("INSERT without a VALUES clause"))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(ShardError::unsupported("INSERT source is not a VALUES list"));
    };
    match values.rows.len() {
        1 => Ok(&values.rows[0]),
        _ => Err(ShardError::unsupported("multi-row INSERT is not supported")),
    }
}

/// Render an expression as a SQL literal, resolving `:vN` placeholders
/// through the bound arguments. Used by count-query synthesis.
pub(crate) fn expr_literal(expr: &Expr, args: &[Value]) -> Result<String, ShardError> {
    match expr {
        Expr::Value(AstValue::Placeholder(p)) => {
            let index = placeholder_index(p)
                .ok_or_else(|| ShardError::unsupported(format!("unrecognized placeholder {p}")))?;
            let arg = args.get(index - 1).ok_or_else(|| {
                ShardError::unsupported(format!("placeholder :v{index} has no bound argument"))
            })?;
            Ok(arg.to_literal())
        }
        _ => Ok(expr.to_string()),
    }
}
