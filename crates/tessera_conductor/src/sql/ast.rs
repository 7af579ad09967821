//! Statement AST and deterministic SQL rendering.
//!
//! The statement kinds are a closed set: adding one is a compile-time
//! change and every consumer matches exhaustively. Each node renders back
//! to SQL through `Display`; the planner relies on that when it sends
//! rewritten statements to shards. Placeholders carry the zero-based
//! parameter index assigned at parse time; rewrites append new
//! placeholders but never renumber existing ones.

use std::fmt;

/// One parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    CreateTable(CreateTableStatement),
    CreateIndex(CreateIndexStatement),
    DropTable(DropTableStatement),
    DropIndex(DropIndexStatement),
    AlterTable(AlterTableStatement),
    Pragma(PragmaStatement),
}

impl Statement {
    /// Table the statement operates on, when it names one.
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Statement::Select(s) => s.from.as_ref().map(|t| t.name.as_str()),
            Statement::Insert(s) => Some(&s.table),
            Statement::Update(s) => Some(&s.table),
            Statement::Delete(s) => Some(&s.table),
            Statement::CreateTable(s) => Some(&s.name),
            Statement::CreateIndex(s) => Some(&s.table),
            Statement::DropTable(s) => Some(&s.name),
            Statement::DropIndex(_) => None,
            Statement::AlterTable(s) => Some(&s.table),
            Statement::Pragma(_) => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Insert(_) => "INSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
            Statement::CreateTable(_) => "CREATE TABLE",
            Statement::CreateIndex(_) => "CREATE INDEX",
            Statement::DropTable(_) => "DROP TABLE",
            Statement::DropIndex(_) => "DROP INDEX",
            Statement::AlterTable(_) => "ALTER TABLE",
            Statement::Pragma(_) => "PRAGMA",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

impl SelectStatement {
    /// A bare `SELECT <items> FROM <table>` skeleton.
    pub fn simple(table: &str, items: Vec<SelectItem>) -> Self {
        Self {
            distinct: false,
            items,
            from: Some(TableRef {
                name: table.to_string(),
                alias: None,
            }),
            joins: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    QualifiedWildcard(String),
    Expr { expr: Expr, alias: Option<String> },
}

impl SelectItem {
    pub fn column(name: &str) -> Self {
        SelectItem::Expr {
            expr: Expr::column(name),
            alias: None,
        }
    }

    /// Result-column name this item produces: the alias, a plain column's
    /// name, or the rendered expression text (which is also what SQLite
    /// names the column, since shards execute our rendering).
    pub fn output_name(&self) -> Option<String> {
        match self {
            SelectItem::Wildcard | SelectItem::QualifiedWildcard(_) => None,
            SelectItem::Expr { expr, alias } => Some(match alias {
                Some(alias) => alias.clone(),
                None => match expr {
                    Expr::Column(col) => col.column.clone(),
                    other => other.to_string(),
                },
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Outer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub where_clause: Option<Expr>,
    pub returning: Option<Vec<SelectItem>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStatement {
    pub table: String,
    pub where_clause: Option<Expr>,
    pub returning: Option<Vec<SelectItem>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStatement {
    pub if_not_exists: bool,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub constraints: Vec<TableConstraint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: Option<String>,
    pub constraints: Vec<ColumnConstraint>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConstraint {
    PrimaryKey,
    NotNull,
    Unique,
    Default(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableConstraint {
    PrimaryKey(Vec<String>),
    Unique(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStatement {
    pub unique: bool,
    pub if_not_exists: bool,
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropTableStatement {
    pub if_exists: bool,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropIndexStatement {
    pub if_exists: bool,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterAction {
    AddColumn(ColumnDef),
    RenameTo(String),
    RenameColumn { old: String, new: String },
    DropColumn(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlterTableStatement {
    pub table: String,
    pub action: AlterAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PragmaValue {
    Assign(Expr),
    Call(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PragmaStatement {
    pub name: String,
    pub value: Option<PragmaValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Like => "LIKE",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// `?` with its zero-based source parameter index.
    Placeholder { index: usize },
    Column(ColumnRef),
    Function {
        name: String,
        args: Vec<Expr>,
        star: bool,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<SelectStatement>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_branch: Option<Box<Expr>>,
    },
    Subquery(Box<SelectStatement>),
    Grouping(Box<Expr>),
}

impl Expr {
    pub fn column(name: &str) -> Self {
        Expr::Column(ColumnRef {
            table: None,
            column: name.to_string(),
        })
    }

    pub fn equals(left: Expr, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op: BinaryOp::Eq,
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op: BinaryOp::And,
            right: Box::new(right),
        }
    }
}

/// Collects placeholder indices in render order. The executor projects the
/// caller's parameter vector through this to build per-shard params.
pub fn placeholder_indices(statement: &Statement) -> Vec<usize> {
    let mut out = Vec::new();
    walk_statement(statement, &mut out);
    out
}

fn walk_statement(statement: &Statement, out: &mut Vec<usize>) {
    match statement {
        Statement::Select(s) => walk_select(s, out),
        Statement::Insert(s) => {
            for row in &s.rows {
                for expr in row {
                    walk_expr(expr, out);
                }
            }
        }
        Statement::Update(s) => {
            for (_, expr) in &s.assignments {
                walk_expr(expr, out);
            }
            if let Some(expr) = &s.where_clause {
                walk_expr(expr, out);
            }
            if let Some(items) = &s.returning {
                walk_items(items, out);
            }
        }
        Statement::Delete(s) => {
            if let Some(expr) = &s.where_clause {
                walk_expr(expr, out);
            }
            if let Some(items) = &s.returning {
                walk_items(items, out);
            }
        }
        Statement::CreateTable(s) => {
            for column in &s.columns {
                for constraint in &column.constraints {
                    if let ColumnConstraint::Default(expr) = constraint {
                        walk_expr(expr, out);
                    }
                }
            }
        }
        Statement::Pragma(s) => match &s.value {
            Some(PragmaValue::Assign(expr)) => walk_expr(expr, out),
            Some(PragmaValue::Call(args)) => {
                for expr in args {
                    walk_expr(expr, out);
                }
            }
            None => {}
        },
        Statement::CreateIndex(_)
        | Statement::DropTable(_)
        | Statement::DropIndex(_)
        | Statement::AlterTable(_) => {}
    }
}

fn walk_select(select: &SelectStatement, out: &mut Vec<usize>) {
    walk_items(&select.items, out);
    for join in &select.joins {
        if let Some(expr) = &join.on {
            walk_expr(expr, out);
        }
    }
    if let Some(expr) = &select.where_clause {
        walk_expr(expr, out);
    }
    for expr in &select.group_by {
        walk_expr(expr, out);
    }
    if let Some(expr) = &select.having {
        walk_expr(expr, out);
    }
    for item in &select.order_by {
        walk_expr(&item.expr, out);
    }
    if let Some(expr) = &select.limit {
        walk_expr(expr, out);
    }
    if let Some(expr) = &select.offset {
        walk_expr(expr, out);
    }
}

fn walk_items(items: &[SelectItem], out: &mut Vec<usize>) {
    for item in items {
        if let SelectItem::Expr { expr, .. } = item {
            walk_expr(expr, out);
        }
    }
}

fn walk_expr(expr: &Expr, out: &mut Vec<usize>) {
    match expr {
        Expr::Placeholder { index } => out.push(*index),
        Expr::Literal(_) | Expr::Column(_) => {}
        Expr::Function { args, .. } => {
            for arg in args {
                walk_expr(arg, out);
            }
        }
        Expr::Unary { expr, .. } | Expr::Grouping(expr) => walk_expr(expr, out),
        Expr::Binary { left, right, .. } => {
            walk_expr(left, out);
            walk_expr(right, out);
        }
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, out);
            for item in list {
                walk_expr(item, out);
            }
        }
        Expr::InSubquery { expr, subquery, .. } => {
            walk_expr(expr, out);
            walk_select(subquery, out);
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, out);
            walk_expr(low, out);
            walk_expr(high, out);
        }
        Expr::IsNull { expr, .. } => walk_expr(expr, out),
        Expr::Case {
            operand,
            branches,
            else_branch,
        } => {
            if let Some(operand) = operand {
                walk_expr(operand, out);
            }
            for (when, then) in branches {
                walk_expr(when, out);
                walk_expr(then, out);
            }
            if let Some(else_branch) = else_branch {
                walk_expr(else_branch, out);
            }
        }
        Expr::Subquery(subquery) => walk_select(subquery, out),
    }
}

/// Column names a statement references, used as result-cache dependency
/// sets. Qualifiers are dropped; only the bare column name matters.
pub fn referenced_columns(statement: &Statement) -> std::collections::BTreeSet<String> {
    struct Collector(std::collections::BTreeSet<String>);
    impl Collector {
        fn statement(&mut self, statement: &Statement) {
            match statement {
                Statement::Select(s) => self.select(s),
                Statement::Insert(s) => {
                    self.0.extend(s.columns.iter().cloned());
                }
                Statement::Update(s) => {
                    for (column, expr) in &s.assignments {
                        self.0.insert(column.clone());
                        self.expr(expr);
                    }
                    if let Some(expr) = &s.where_clause {
                        self.expr(expr);
                    }
                }
                Statement::Delete(s) => {
                    if let Some(expr) = &s.where_clause {
                        self.expr(expr);
                    }
                }
                _ => {}
            }
        }

        fn select(&mut self, select: &SelectStatement) {
            for item in &select.items {
                if let SelectItem::Expr { expr, .. } = item {
                    self.expr(expr);
                }
            }
            for join in &select.joins {
                if let Some(expr) = &join.on {
                    self.expr(expr);
                }
            }
            if let Some(expr) = &select.where_clause {
                self.expr(expr);
            }
            for expr in &select.group_by {
                self.expr(expr);
            }
            if let Some(expr) = &select.having {
                self.expr(expr);
            }
            for item in &select.order_by {
                self.expr(&item.expr);
            }
        }

        fn expr(&mut self, expr: &Expr) {
            match expr {
                Expr::Column(column) => {
                    self.0.insert(column.column.clone());
                }
                Expr::Literal(_) | Expr::Placeholder { .. } => {}
                Expr::Function { args, .. } => args.iter().for_each(|a| self.expr(a)),
                Expr::Unary { expr, .. } | Expr::Grouping(expr) => self.expr(expr),
                Expr::Binary { left, right, .. } => {
                    self.expr(left);
                    self.expr(right);
                }
                Expr::InList { expr, list, .. } => {
                    self.expr(expr);
                    list.iter().for_each(|e| self.expr(e));
                }
                Expr::InSubquery { expr, subquery, .. } => {
                    self.expr(expr);
                    self.select(subquery);
                }
                Expr::Between {
                    expr, low, high, ..
                } => {
                    self.expr(expr);
                    self.expr(low);
                    self.expr(high);
                }
                Expr::IsNull { expr, .. } => self.expr(expr),
                Expr::Case {
                    operand,
                    branches,
                    else_branch,
                } => {
                    if let Some(operand) = operand {
                        self.expr(operand);
                    }
                    for (when, then) in branches {
                        self.expr(when);
                        self.expr(then);
                    }
                    if let Some(else_branch) = else_branch {
                        self.expr(else_branch);
                    }
                }
                Expr::Subquery(subquery) => self.select(subquery),
            }
        }
    }

    let mut collector = Collector(std::collections::BTreeSet::new());
    collector.statement(statement);
    collector.0
}

/// Quotes an identifier only when it cannot stand bare.
fn render_ident(name: &str) -> String {
    let simple = !name.is_empty()
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("\"{name}\"")
    }
}

fn render_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn join_rendered<T: fmt::Display>(items: &[T], separator: &str) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "NULL"),
            Literal::Boolean(true) => write!(f, "TRUE"),
            Literal::Boolean(false) => write!(f, "FALSE"),
            Literal::Integer(v) => write!(f, "{v}"),
            Literal::Real(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 {
                    write!(f, "{}.0", *v as i64)
                } else {
                    write!(f, "{v}")
                }
            }
            Literal::String(v) => write!(f, "{}", render_string(v)),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", render_ident(table), render_ident(&self.column)),
            None => write!(f, "{}", render_ident(&self.column)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(literal) => write!(f, "{literal}"),
            Expr::Placeholder { .. } => write!(f, "?"),
            Expr::Column(column) => write!(f, "{column}"),
            Expr::Function { name, args, star } => {
                if *star {
                    write!(f, "{name}(*)")
                } else {
                    write!(f, "{name}({})", join_rendered(args, ", "))
                }
            }
            Expr::Unary { op, expr } => match op {
                UnaryOp::Negate => write!(f, "-{expr}"),
                UnaryOp::Not => write!(f, "NOT {expr}"),
            },
            Expr::Binary { left, op, right } => {
                write!(f, "{left} {} {right}", op.as_str())
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{expr} {not}IN ({})", join_rendered(list, ", "))
            }
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{expr} {not}IN ({subquery})")
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{expr} {not}BETWEEN {low} AND {high}")
            }
            Expr::IsNull { expr, negated } => {
                if *negated {
                    write!(f, "{expr} IS NOT NULL")
                } else {
                    write!(f, "{expr} IS NULL")
                }
            }
            Expr::Case {
                operand,
                branches,
                else_branch,
            } => {
                write!(f, "CASE")?;
                if let Some(operand) = operand {
                    write!(f, " {operand}")?;
                }
                for (when, then) in branches {
                    write!(f, " WHEN {when} THEN {then}")?;
                }
                if let Some(else_branch) = else_branch {
                    write!(f, " ELSE {else_branch}")?;
                }
                write!(f, " END")
            }
            Expr::Subquery(subquery) => write!(f, "({subquery})"),
            Expr::Grouping(expr) => write!(f, "({expr})"),
        }
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::Wildcard => write!(f, "*"),
            SelectItem::QualifiedWildcard(table) => write!(f, "{}.*", render_ident(table)),
            SelectItem::Expr { expr, alias } => match alias {
                Some(alias) => write!(f, "{expr} AS {}", render_ident(alias)),
                None => write!(f, "{expr}"),
            },
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.alias {
            Some(alias) => write!(f, "{} AS {}", render_ident(&self.name), render_ident(alias)),
            None => write!(f, "{}", render_ident(&self.name)),
        }
    }
}

impl fmt::Display for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Outer => "OUTER JOIN",
        };
        write!(f, "{kind} {}", self.table)?;
        if let Some(on) = &self.on {
            write!(f, " ON {on}")?;
        }
        Ok(())
    }
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        write!(f, "{}", join_rendered(&self.items, ", "))?;
        if let Some(from) = &self.from {
            write!(f, " FROM {from}")?;
        }
        for join in &self.joins {
            write!(f, " {join}")?;
        }
        if let Some(where_clause) = &self.where_clause {
            write!(f, " WHERE {where_clause}")?;
        }
        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", join_rendered(&self.group_by, ", "))?;
        }
        if let Some(having) = &self.having {
            write!(f, " HAVING {having}")?;
        }
        if !self.order_by.is_empty() {
            let rendered: Vec<String> = self
                .order_by
                .iter()
                .map(|item| {
                    if item.descending {
                        format!("{} DESC", item.expr)
                    } else {
                        item.expr.to_string()
                    }
                })
                .collect();
            write!(f, " ORDER BY {}", rendered.join(", "))?;
        }
        if let Some(limit) = &self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}

impl fmt::Display for InsertStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "INSERT INTO {}", render_ident(&self.table))?;
        if !self.columns.is_empty() {
            let columns: Vec<String> = self.columns.iter().map(|c| render_ident(c)).collect();
            write!(f, " ({})", columns.join(", "))?;
        }
        write!(f, " VALUES ")?;
        let rows: Vec<String> = self
            .rows
            .iter()
            .map(|row| format!("({})", join_rendered(row, ", ")))
            .collect();
        write!(f, "{}", rows.join(", "))
    }
}

impl fmt::Display for UpdateStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let assignments: Vec<String> = self
            .assignments
            .iter()
            .map(|(column, expr)| format!("{} = {expr}", render_ident(column)))
            .collect();
        write!(
            f,
            "UPDATE {} SET {}",
            render_ident(&self.table),
            assignments.join(", ")
        )?;
        if let Some(where_clause) = &self.where_clause {
            write!(f, " WHERE {where_clause}")?;
        }
        if let Some(returning) = &self.returning {
            write!(f, " RETURNING {}", join_rendered(returning, ", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for DeleteStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DELETE FROM {}", render_ident(&self.table))?;
        if let Some(where_clause) = &self.where_clause {
            write!(f, " WHERE {where_clause}")?;
        }
        if let Some(returning) = &self.returning {
            write!(f, " RETURNING {}", join_rendered(returning, ", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", render_ident(&self.name))?;
        if let Some(data_type) = &self.data_type {
            write!(f, " {data_type}")?;
        }
        for constraint in &self.constraints {
            match constraint {
                ColumnConstraint::PrimaryKey => write!(f, " PRIMARY KEY")?,
                ColumnConstraint::NotNull => write!(f, " NOT NULL")?,
                ColumnConstraint::Unique => write!(f, " UNIQUE")?,
                ColumnConstraint::Default(expr) => write!(f, " DEFAULT {expr}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for TableConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, columns) = match self {
            TableConstraint::PrimaryKey(columns) => ("PRIMARY KEY", columns),
            TableConstraint::Unique(columns) => ("UNIQUE", columns),
        };
        let rendered: Vec<String> = columns.iter().map(|c| render_ident(c)).collect();
        write!(f, "{label} ({})", rendered.join(", "))
    }
}

impl fmt::Display for CreateTableStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CREATE TABLE ")?;
        if self.if_not_exists {
            write!(f, "IF NOT EXISTS ")?;
        }
        write!(f, "{} (", render_ident(&self.name))?;
        let mut parts: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        parts.extend(self.constraints.iter().map(|c| c.to_string()));
        write!(f, "{})", parts.join(", "))
    }
}

impl fmt::Display for CreateIndexStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CREATE ")?;
        if self.unique {
            write!(f, "UNIQUE ")?;
        }
        write!(f, "INDEX ")?;
        if self.if_not_exists {
            write!(f, "IF NOT EXISTS ")?;
        }
        let columns: Vec<String> = self.columns.iter().map(|c| render_ident(c)).collect();
        write!(
            f,
            "{} ON {} ({})",
            render_ident(&self.name),
            render_ident(&self.table),
            columns.join(", ")
        )
    }
}

impl fmt::Display for DropTableStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DROP TABLE ")?;
        if self.if_exists {
            write!(f, "IF EXISTS ")?;
        }
        write!(f, "{}", render_ident(&self.name))
    }
}

impl fmt::Display for DropIndexStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DROP INDEX ")?;
        if self.if_exists {
            write!(f, "IF EXISTS ")?;
        }
        write!(f, "{}", render_ident(&self.name))
    }
}

impl fmt::Display for AlterTableStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ALTER TABLE {} ", render_ident(&self.table))?;
        match &self.action {
            AlterAction::AddColumn(column) => write!(f, "ADD COLUMN {column}"),
            AlterAction::RenameTo(new_name) => {
                write!(f, "RENAME TO {}", render_ident(new_name))
            }
            AlterAction::RenameColumn { old, new } => write!(
                f,
                "RENAME COLUMN {} TO {}",
                render_ident(old),
                render_ident(new)
            ),
            AlterAction::DropColumn(column) => {
                write!(f, "DROP COLUMN {}", render_ident(column))
            }
        }
    }
}

impl fmt::Display for PragmaStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PRAGMA {}", render_ident(&self.name))?;
        match &self.value {
            Some(PragmaValue::Assign(expr)) => write!(f, " = {expr}"),
            Some(PragmaValue::Call(args)) => write!(f, "({})", join_rendered(args, ", ")),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select(s) => write!(f, "{s}"),
            Statement::Insert(s) => write!(f, "{s}"),
            Statement::Update(s) => write!(f, "{s}"),
            Statement::Delete(s) => write!(f, "{s}"),
            Statement::CreateTable(s) => write!(f, "{s}"),
            Statement::CreateIndex(s) => write!(f, "{s}"),
            Statement::DropTable(s) => write!(f, "{s}"),
            Statement::DropIndex(s) => write!(f, "{s}"),
            Statement::AlterTable(s) => write!(f, "{s}"),
            Statement::Pragma(s) => write!(f, "{s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_placeholders_without_renumbering() {
        let expr = Expr::and(
            Expr::equals(Expr::column("a"), Expr::Placeholder { index: 1 }),
            Expr::equals(Expr::column("b"), Expr::Placeholder { index: 0 }),
        );
        assert_eq!(expr.to_string(), "a = ? AND b = ?");
    }

    #[test]
    fn placeholder_indices_follow_render_order() {
        let statement = Statement::Update(UpdateStatement {
            table: "users".to_string(),
            assignments: vec![("email".to_string(), Expr::Placeholder { index: 0 })],
            where_clause: Some(Expr::equals(
                Expr::column("id"),
                Expr::Placeholder { index: 1 },
            )),
            returning: None,
        });
        assert_eq!(placeholder_indices(&statement), vec![0, 1]);
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(render_ident("users"), "users");
        assert_eq!(render_ident("_virtualShard"), "_virtualShard");
        assert_eq!(render_ident("weird name"), "\"weird name\"");
        assert_eq!(render_ident("1st"), "\"1st\"");
    }

    #[test]
    fn renders_case_and_between() {
        let expr = Expr::Case {
            operand: None,
            branches: vec![(
                Expr::Between {
                    expr: Box::new(Expr::column("age")),
                    low: Box::new(Expr::Literal(Literal::Integer(18))),
                    high: Box::new(Expr::Literal(Literal::Integer(65))),
                    negated: false,
                },
                Expr::Literal(Literal::String("adult".to_string())),
            )],
            else_branch: Some(Box::new(Expr::Literal(Literal::String(
                "other".to_string(),
            )))),
        };
        assert_eq!(
            expr.to_string(),
            "CASE WHEN age BETWEEN 18 AND 65 THEN 'adult' ELSE 'other' END"
        );
    }
}
