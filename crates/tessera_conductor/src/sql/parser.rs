//! Recursive-descent parser for the routed SQL dialect.
//!
//! The parser is strict about statement shapes: every deviation surfaces a
//! [`ParserError`] carrying the offending token and what was expected.
//! Placeholders are numbered in source order starting at zero; the index is
//! stored on the node and survives later rewrites untouched.

use thiserror::Error;

use super::ast::*;
use super::lexer::{tokenize, Token, TokenKind, TokenizerError};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("expected {expected}, found {found} at offset {position}")]
pub struct ParserError {
    pub expected: String,
    pub found: String,
    pub position: usize,
}

/// Tokenizes and parses one statement.
pub fn parse_statement(sql: &str) -> Result<Statement, ParseFailure> {
    let tokens = tokenize(sql)?;
    let mut parser = Parser::new(tokens);
    let statement = parser.statement()?;
    parser.finish()?;
    Ok(statement)
}

/// Either stage of front-end failure, kept distinct for the error taxonomy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseFailure {
    #[error(transparent)]
    Tokenize(#[from] TokenizerError),
    #[error(transparent)]
    Parse(#[from] ParserError),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    next_param: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            next_param: 0,
        }
    }

    fn statement(&mut self) -> Result<Statement, ParserError> {
        let first = self.peek().cloned();
        match first {
            Some(t) if t.is_keyword("SELECT") => Ok(Statement::Select(self.select()?)),
            Some(t) if t.is_keyword("INSERT") => self.insert(),
            Some(t) if t.is_keyword("UPDATE") => self.update(),
            Some(t) if t.is_keyword("DELETE") => self.delete(),
            Some(t) if t.is_keyword("CREATE") => self.create(),
            Some(t) if t.is_keyword("DROP") => self.drop(),
            Some(t) if t.is_keyword("ALTER") => self.alter(),
            Some(t) if t.is_keyword("PRAGMA") => self.pragma(),
            _ => Err(self.error_here("a statement keyword")),
        }
    }

    fn finish(&mut self) -> Result<(), ParserError> {
        self.eat_punct(";");
        if self.pos < self.tokens.len() {
            return Err(self.error_here("end of statement"));
        }
        Ok(())
    }

    // ---- statements ----------------------------------------------------

    fn select(&mut self) -> Result<SelectStatement, ParserError> {
        self.expect_keyword("SELECT")?;
        let distinct = self.eat_keyword("DISTINCT");
        let items = self.select_items()?;

        let mut from = None;
        let mut joins = Vec::new();
        if self.eat_keyword("FROM") {
            from = Some(self.table_ref()?);
            loop {
                let kind = if self.eat_keyword("JOIN") || self.eat_keyword2("INNER", "JOIN") {
                    JoinKind::Inner
                } else if self.peek_keyword("LEFT") {
                    self.expect_keyword("LEFT")?;
                    self.eat_keyword("OUTER");
                    self.expect_keyword("JOIN")?;
                    JoinKind::Left
                } else if self.peek_keyword("RIGHT") {
                    self.expect_keyword("RIGHT")?;
                    self.eat_keyword("OUTER");
                    self.expect_keyword("JOIN")?;
                    JoinKind::Right
                } else if self.eat_keyword2("OUTER", "JOIN") {
                    JoinKind::Outer
                } else {
                    break;
                };
                let table = self.table_ref()?;
                let on = if self.eat_keyword("ON") {
                    Some(self.expr()?)
                } else {
                    None
                };
                joins.push(Join { kind, table, on });
            }
        }

        let where_clause = if self.eat_keyword("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.eat_keyword("GROUP") {
            self.expect_keyword("BY")?;
            loop {
                group_by.push(self.expr()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
        }

        let having = if self.eat_keyword("HAVING") {
            Some(self.expr()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let expr = self.expr()?;
                let descending = if self.eat_keyword("DESC") {
                    true
                } else {
                    self.eat_keyword("ASC");
                    false
                };
                order_by.push(OrderItem { expr, descending });
                if !self.eat_punct(",") {
                    break;
                }
            }
        }

        let limit = if self.eat_keyword("LIMIT") {
            Some(self.expr()?)
        } else {
            None
        };
        let offset = if self.eat_keyword("OFFSET") {
            Some(self.expr()?)
        } else {
            None
        };

        Ok(SelectStatement {
            distinct,
            items,
            from,
            joins,
            where_clause,
            group_by,
            having,
            order_by,
            limit,
            offset,
        })
    }

    fn select_items(&mut self) -> Result<Vec<SelectItem>, ParserError> {
        let mut items = Vec::new();
        loop {
            items.push(self.select_item()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(items)
    }

    fn select_item(&mut self) -> Result<SelectItem, ParserError> {
        if self.eat_operator("*") {
            return Ok(SelectItem::Wildcard);
        }
        // `t.*`: an identifier, a dot, a star
        if self.peek_is(TokenKind::Identifier)
            && self.peek_at(1).is_some_and(|t| t.is_operator("."))
            && self.peek_at(2).is_some_and(|t| t.is_operator("*"))
        {
            let table = self.expect_identifier("table name")?;
            self.expect_operator(".")?;
            self.expect_operator("*")?;
            return Ok(SelectItem::QualifiedWildcard(table));
        }
        let expr = self.expr()?;
        let alias = if self.eat_keyword("AS") {
            Some(self.expect_identifier("column alias")?)
        } else {
            None
        };
        Ok(SelectItem::Expr { expr, alias })
    }

    fn table_ref(&mut self) -> Result<TableRef, ParserError> {
        let name = self.expect_identifier("table name")?;
        let alias = if self.eat_keyword("AS") {
            Some(self.expect_identifier("table alias")?)
        } else if self.peek_is(TokenKind::Identifier) {
            Some(self.expect_identifier("table alias")?)
        } else {
            None
        };
        Ok(TableRef { name, alias })
    }

    fn insert(&mut self) -> Result<Statement, ParserError> {
        self.expect_keyword("INSERT")?;
        self.expect_keyword("INTO")?;
        let table = self.expect_identifier("table name")?;

        let mut columns = Vec::new();
        if self.eat_punct("(") {
            loop {
                columns.push(self.expect_identifier("column name")?);
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_punct(")")?;
        }

        self.expect_keyword("VALUES")?;
        let mut rows = Vec::new();
        loop {
            self.expect_punct("(")?;
            let mut row = Vec::new();
            loop {
                row.push(self.expr()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_punct(")")?;
            rows.push(row);
            if !self.eat_punct(",") {
                break;
            }
        }

        Ok(Statement::Insert(InsertStatement {
            table,
            columns,
            rows,
        }))
    }

    fn update(&mut self) -> Result<Statement, ParserError> {
        self.expect_keyword("UPDATE")?;
        let table = self.expect_identifier("table name")?;
        self.expect_keyword("SET")?;
        let mut assignments = Vec::new();
        loop {
            let column = self.expect_identifier("column name")?;
            self.expect_operator("=")?;
            let value = self.expr()?;
            assignments.push((column, value));
            if !self.eat_punct(",") {
                break;
            }
        }
        let where_clause = if self.eat_keyword("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };
        let returning = if self.eat_keyword("RETURNING") {
            Some(self.select_items()?)
        } else {
            None
        };
        Ok(Statement::Update(UpdateStatement {
            table,
            assignments,
            where_clause,
            returning,
        }))
    }

    fn delete(&mut self) -> Result<Statement, ParserError> {
        self.expect_keyword("DELETE")?;
        self.expect_keyword("FROM")?;
        let table = self.expect_identifier("table name")?;
        let where_clause = if self.eat_keyword("WHERE") {
            Some(self.expr()?)
        } else {
            None
        };
        let returning = if self.eat_keyword("RETURNING") {
            Some(self.select_items()?)
        } else {
            None
        };
        Ok(Statement::Delete(DeleteStatement {
            table,
            where_clause,
            returning,
        }))
    }

    fn create(&mut self) -> Result<Statement, ParserError> {
        self.expect_keyword("CREATE")?;
        if self.eat_keyword("UNIQUE") {
            self.expect_keyword("INDEX")?;
            return self.create_index(true);
        }
        if self.eat_keyword("INDEX") {
            return self.create_index(false);
        }
        self.expect_keyword("TABLE")?;
        self.create_table()
    }

    fn create_index(&mut self, unique: bool) -> Result<Statement, ParserError> {
        let if_not_exists = self.if_not_exists()?;
        let name = self.expect_identifier("index name")?;
        self.expect_keyword("ON")?;
        let table = self.expect_identifier("table name")?;
        self.expect_punct("(")?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.expect_identifier("column name")?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(Statement::CreateIndex(CreateIndexStatement {
            unique,
            if_not_exists,
            name,
            table,
            columns,
        }))
    }

    fn create_table(&mut self) -> Result<Statement, ParserError> {
        let if_not_exists = self.if_not_exists()?;
        let name = self.expect_identifier("table name")?;
        self.expect_punct("(")?;
        let mut columns = Vec::new();
        let mut constraints = Vec::new();
        loop {
            if self.peek_keyword("PRIMARY") || self.peek_keyword("UNIQUE") {
                constraints.push(self.table_constraint()?);
            } else {
                columns.push(self.column_def()?);
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(Statement::CreateTable(CreateTableStatement {
            if_not_exists,
            name,
            columns,
            constraints,
        }))
    }

    fn table_constraint(&mut self) -> Result<TableConstraint, ParserError> {
        if self.eat_keyword("PRIMARY") {
            self.expect_keyword("KEY")?;
            Ok(TableConstraint::PrimaryKey(self.column_name_list()?))
        } else {
            self.expect_keyword("UNIQUE")?;
            Ok(TableConstraint::Unique(self.column_name_list()?))
        }
    }

    fn column_name_list(&mut self) -> Result<Vec<String>, ParserError> {
        self.expect_punct("(")?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.expect_identifier("column name")?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(columns)
    }

    fn column_def(&mut self) -> Result<ColumnDef, ParserError> {
        let name = self.expect_identifier("column name")?;
        // The lexer classifies a word in type position as a keyword.
        let data_type = if self.peek_is(TokenKind::Keyword)
            && !self.peek_column_constraint()
        {
            let mut data_type = self.advance().text.to_ascii_uppercase();
            // length arguments like VARCHAR(255)
            if self.eat_punct("(") {
                let mut args = Vec::new();
                loop {
                    let token = self.expect_kind(TokenKind::Number, "type length")?;
                    args.push(token.text);
                    if !self.eat_punct(",") {
                        break;
                    }
                }
                self.expect_punct(")")?;
                data_type = format!("{data_type}({})", args.join(", "));
            }
            Some(data_type)
        } else {
            None
        };

        let mut constraints = Vec::new();
        loop {
            if self.eat_keyword("PRIMARY") {
                self.expect_keyword("KEY")?;
                self.eat_keyword("AUTOINCREMENT");
                constraints.push(ColumnConstraint::PrimaryKey);
            } else if self.eat_keyword("NOT") {
                self.expect_keyword("NULL")?;
                constraints.push(ColumnConstraint::NotNull);
            } else if self.eat_keyword("UNIQUE") {
                constraints.push(ColumnConstraint::Unique);
            } else if self.eat_keyword("DEFAULT") {
                constraints.push(ColumnConstraint::Default(self.unary()?));
            } else {
                break;
            }
        }
        Ok(ColumnDef {
            name,
            data_type,
            constraints,
        })
    }

    fn peek_column_constraint(&self) -> bool {
        self.peek().is_some_and(|t| {
            t.is_keyword("PRIMARY")
                || t.is_keyword("NOT")
                || t.is_keyword("UNIQUE")
                || t.is_keyword("DEFAULT")
        })
    }

    fn drop(&mut self) -> Result<Statement, ParserError> {
        self.expect_keyword("DROP")?;
        if self.eat_keyword("INDEX") {
            let if_exists = self.if_exists()?;
            let name = self.expect_identifier("index name")?;
            return Ok(Statement::DropIndex(DropIndexStatement { if_exists, name }));
        }
        self.expect_keyword("TABLE")?;
        let if_exists = self.if_exists()?;
        let name = self.expect_identifier("table name")?;
        Ok(Statement::DropTable(DropTableStatement { if_exists, name }))
    }

    fn alter(&mut self) -> Result<Statement, ParserError> {
        self.expect_keyword("ALTER")?;
        self.expect_keyword("TABLE")?;
        let table = self.expect_identifier("table name")?;
        let action = if self.eat_keyword("ADD") {
            self.eat_keyword("COLUMN");
            AlterAction::AddColumn(self.column_def()?)
        } else if self.eat_keyword("RENAME") {
            if self.eat_keyword("COLUMN") {
                let old = self.expect_identifier("column name")?;
                self.expect_keyword("TO")?;
                let new = self.expect_identifier("column name")?;
                AlterAction::RenameColumn { old, new }
            } else {
                self.expect_keyword("TO")?;
                AlterAction::RenameTo(self.expect_identifier("table name")?)
            }
        } else if self.eat_keyword("DROP") {
            self.expect_keyword("COLUMN")?;
            AlterAction::DropColumn(self.expect_identifier("column name")?)
        } else {
            return Err(self.error_here("ADD, RENAME or DROP"));
        };
        Ok(Statement::AlterTable(AlterTableStatement { table, action }))
    }

    fn pragma(&mut self) -> Result<Statement, ParserError> {
        self.expect_keyword("PRAGMA")?;
        let name = self.expect_identifier("pragma name")?;
        let value = if self.eat_operator("=") {
            Some(PragmaValue::Assign(self.unary()?))
        } else if self.eat_punct("(") {
            let mut args = Vec::new();
            loop {
                args.push(self.unary()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_punct(")")?;
            Some(PragmaValue::Call(args))
        } else {
            None
        };
        Ok(Statement::Pragma(PragmaStatement { name, value }))
    }

    fn if_not_exists(&mut self) -> Result<bool, ParserError> {
        if self.eat_keyword("IF") {
            self.expect_keyword("NOT")?;
            self.expect_keyword("EXISTS")?;
            return Ok(true);
        }
        Ok(false)
    }

    fn if_exists(&mut self) -> Result<bool, ParserError> {
        if self.eat_keyword("IF") {
            self.expect_keyword("EXISTS")?;
            return Ok(true);
        }
        Ok(false)
    }

    // ---- expressions ---------------------------------------------------

    fn expr(&mut self) -> Result<Expr, ParserError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ParserError> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("OR") {
            let right = self.and_expr()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ParserError> {
        let mut left = self.predicate()?;
        while self.eat_keyword("AND") {
            let right = self.predicate()?;
            left = Expr::Binary {
                left: Box::new(left),
                op: BinaryOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn predicate(&mut self) -> Result<Expr, ParserError> {
        let mut expr = self.additive()?;
        loop {
            if self.eat_keyword("IS") {
                let negated = self.eat_keyword("NOT");
                self.expect_keyword("NULL")?;
                expr = Expr::IsNull {
                    expr: Box::new(expr),
                    negated,
                };
                continue;
            }

            let negated = if self.peek_keyword("NOT")
                && self
                    .peek_at(1)
                    .is_some_and(|t| t.is_keyword("IN") || t.is_keyword("BETWEEN") || t.is_keyword("LIKE"))
            {
                self.expect_keyword("NOT")?;
                true
            } else {
                false
            };

            if self.eat_keyword("IN") {
                self.expect_punct("(")?;
                if self.peek_keyword("SELECT") {
                    let subquery = self.select()?;
                    self.expect_punct(")")?;
                    expr = Expr::InSubquery {
                        expr: Box::new(expr),
                        subquery: Box::new(subquery),
                        negated,
                    };
                } else {
                    let mut list = Vec::new();
                    loop {
                        list.push(self.additive()?);
                        if !self.eat_punct(",") {
                            break;
                        }
                    }
                    self.expect_punct(")")?;
                    expr = Expr::InList {
                        expr: Box::new(expr),
                        list,
                        negated,
                    };
                }
                continue;
            }

            if self.eat_keyword("BETWEEN") {
                let low = self.additive()?;
                self.expect_keyword("AND")?;
                let high = self.additive()?;
                expr = Expr::Between {
                    expr: Box::new(expr),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                };
                continue;
            }

            if self.eat_keyword("LIKE") {
                let pattern = self.additive()?;
                expr = Expr::Binary {
                    left: Box::new(expr),
                    op: BinaryOp::Like,
                    right: Box::new(pattern),
                };
                if negated {
                    expr = Expr::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(expr),
                    };
                }
                continue;
            }

            if negated {
                return Err(self.error_here("IN, BETWEEN or LIKE after NOT"));
            }

            if let Some(op) = self.comparison_op() {
                let right = self.additive()?;
                expr = Expr::Binary {
                    left: Box::new(expr),
                    op,
                    right: Box::new(right),
                };
                continue;
            }

            return Ok(expr);
        }
    }

    fn comparison_op(&mut self) -> Option<BinaryOp> {
        let text = self.peek().filter(|t| t.kind == TokenKind::Operator)?.text.clone();
        let op = match text.as_str() {
            "=" => BinaryOp::Eq,
            "!=" | "<>" => BinaryOp::NotEq,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::LtEq,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::GtEq,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn additive(&mut self) -> Result<Expr, ParserError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = if self.eat_operator("+") {
                BinaryOp::Plus
            } else if self.eat_operator("-") {
                BinaryOp::Minus
            } else {
                return Ok(left);
            };
            let right = self.multiplicative()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParserError> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat_operator("*") {
                BinaryOp::Multiply
            } else if self.eat_operator("/") {
                BinaryOp::Divide
            } else {
                return Ok(left);
            };
            let right = self.unary()?;
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ParserError> {
        if self.eat_operator("-") {
            let expr = self.unary()?;
            // Fold the sign into numeric literals so `-1` routes and
            // renders as a plain literal.
            return Ok(match expr {
                Expr::Literal(Literal::Integer(v)) => Expr::Literal(Literal::Integer(-v)),
                Expr::Literal(Literal::Real(v)) => Expr::Literal(Literal::Real(-v)),
                other => Expr::Unary {
                    op: UnaryOp::Negate,
                    expr: Box::new(other),
                },
            });
        }
        if self.eat_operator("+") {
            return self.unary();
        }
        if self.eat_keyword("NOT") {
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParserError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error_here("an expression"));
        };

        match token.kind {
            TokenKind::Number => {
                self.advance();
                Ok(Expr::Literal(parse_number(&token.text)))
            }
            TokenKind::String => {
                self.advance();
                Ok(Expr::Literal(Literal::String(token.text)))
            }
            TokenKind::Placeholder => {
                self.advance();
                let index = self.next_param;
                self.next_param += 1;
                Ok(Expr::Placeholder { index })
            }
            TokenKind::Keyword if token.is_keyword("NULL") => {
                self.advance();
                Ok(Expr::Literal(Literal::Null))
            }
            TokenKind::Keyword if token.is_keyword("TRUE") => {
                self.advance();
                Ok(Expr::Literal(Literal::Boolean(true)))
            }
            TokenKind::Keyword if token.is_keyword("FALSE") => {
                self.advance();
                Ok(Expr::Literal(Literal::Boolean(false)))
            }
            TokenKind::Keyword if token.is_keyword("CASE") => self.case_expr(),
            TokenKind::Function => {
                self.advance();
                self.function_call(token.text)
            }
            TokenKind::Identifier => {
                self.advance();
                // Unknown names in call position still parse as calls.
                if self.peek_punct("(") {
                    return self.function_call(token.text);
                }
                if self.eat_operator(".") {
                    let column = self.expect_identifier("column name")?;
                    // Identifiers carry at most one qualifier.
                    if self.peek().is_some_and(|t| t.is_operator(".")) {
                        return Err(self.error_here("an unqualified column after one dot"));
                    }
                    return Ok(Expr::Column(ColumnRef {
                        table: Some(token.text),
                        column,
                    }));
                }
                Ok(Expr::Column(ColumnRef {
                    table: None,
                    column: token.text,
                }))
            }
            TokenKind::Punctuation if token.text == "(" => {
                self.advance();
                if self.peek_keyword("SELECT") {
                    let subquery = self.select()?;
                    self.expect_punct(")")?;
                    return Ok(Expr::Subquery(Box::new(subquery)));
                }
                let inner = self.expr()?;
                self.expect_punct(")")?;
                Ok(Expr::Grouping(Box::new(inner)))
            }
            _ => Err(self.error_here("an expression")),
        }
    }

    fn function_call(&mut self, name: String) -> Result<Expr, ParserError> {
        self.expect_punct("(")?;
        if self.eat_operator("*") {
            self.expect_punct(")")?;
            return Ok(Expr::Function {
                name,
                args: Vec::new(),
                star: true,
            });
        }
        let mut args = Vec::new();
        if !self.eat_punct(")") {
            loop {
                args.push(self.expr()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
            self.expect_punct(")")?;
        }
        Ok(Expr::Function {
            name,
            args,
            star: false,
        })
    }

    fn case_expr(&mut self) -> Result<Expr, ParserError> {
        self.expect_keyword("CASE")?;
        let operand = if self.peek_keyword("WHEN") {
            None
        } else {
            Some(Box::new(self.expr()?))
        };
        let mut branches = Vec::new();
        while self.eat_keyword("WHEN") {
            let when = self.expr()?;
            self.expect_keyword("THEN")?;
            let then = self.expr()?;
            branches.push((when, then));
        }
        if branches.is_empty() {
            return Err(self.error_here("WHEN"));
        }
        let else_branch = if self.eat_keyword("ELSE") {
            Some(Box::new(self.expr()?))
        } else {
            None
        };
        self.expect_keyword("END")?;
        Ok(Expr::Case {
            operand,
            branches,
            else_branch,
        })
    }

    // ---- token plumbing ------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn peek_is(&self, kind: TokenKind) -> bool {
        self.peek().is_some_and(|t| t.kind == kind)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(keyword))
    }

    fn peek_punct(&self, punct: &str) -> bool {
        self.peek()
            .is_some_and(|t| t.kind == TokenKind::Punctuation && t.text == punct)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        self.pos += 1;
        token
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consumes a two-keyword sequence only when both are present.
    fn eat_keyword2(&mut self, first: &str, second: &str) -> bool {
        if self.peek_keyword(first) && self.peek_at(1).is_some_and(|t| t.is_keyword(second)) {
            self.pos += 2;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), ParserError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error_here(keyword))
        }
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.peek_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), ParserError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error_here(&format!("'{punct}'")))
        }
    }

    fn eat_operator(&mut self, op: &str) -> bool {
        if self
            .peek()
            .is_some_and(|t| t.kind == TokenKind::Operator && t.text == op)
        {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_operator(&mut self, op: &str) -> Result<(), ParserError> {
        if self.eat_operator(op) {
            Ok(())
        } else {
            Err(self.error_here(&format!("'{op}'")))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String, ParserError> {
        if self.peek_is(TokenKind::Identifier) {
            Ok(self.advance().text)
        } else {
            Err(self.error_here(what))
        }
    }

    fn expect_kind(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParserError> {
        if self.peek_is(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(what))
        }
    }

    fn error_here(&self, expected: &str) -> ParserError {
        match self.peek() {
            Some(token) => ParserError {
                expected: expected.to_string(),
                found: format!("'{}'", token.text),
                position: token.start,
            },
            None => ParserError {
                expected: expected.to_string(),
                found: "end of input".to_string(),
                position: self.tokens.last().map(|t| t.end).unwrap_or(0),
            },
        }
    }
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text.eq_ignore_ascii_case(keyword)
    }

    fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.text == op
    }
}

fn parse_number(text: &str) -> Literal {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        if let Ok(v) = i64::from_str_radix(hex, 16) {
            return Literal::Integer(v);
        }
    }
    if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        if let Ok(v) = i64::from_str_radix(bin, 2) {
            return Literal::Integer(v);
        }
    }
    if !text.contains(['.', 'e', 'E']) {
        if let Ok(v) = text.parse::<i64>() {
            return Literal::Integer(v);
        }
    }
    Literal::Real(text.parse::<f64>().unwrap_or(0.0))
}
