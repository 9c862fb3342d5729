//! Schema requests in text form.
//!
//! ```text
//! create <t> <schema> | ensure <t> <schema> | drop <t> | rename <t> to <t>
//! alter <t> create <partial> | alter <t> drop <partial>
//! alter <t> rename <c> to <c> {, <c> to <c>}
//! schema := '(' [col {',' col}] ')' {index}
//! index  := (key | index [unique]) '(' [cols] ')'
//!           [in <t> ['(' cols ')'] [cascade [update|delete]]]
//! ```
//!
//! Keywords are case-insensitive and only reserved where the grammar
//! expects them, so `key` is a valid column name.

use crate::catalog::{CascadeMode, ForeignKey};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::schema::TableBuilder;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub columns: Vec<String>,
    pub is_key: bool,
    pub unique: bool,
    pub fkey: Option<ForeignKey>,
}

/// Columns and indexes named by a request. Columns may include `-`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSpec {
    pub columns: Vec<String>,
    pub indexes: Vec<IndexSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create { table: String, schema: SchemaSpec },
    Ensure { table: String, schema: SchemaSpec },
    Drop { table: String },
    Rename { from: String, to: String },
    AlterCreate { table: String, schema: SchemaSpec },
    AlterDrop { table: String, schema: SchemaSpec },
    AlterRename { table: String, renames: Vec<(String, String)> },
}

impl Request {
    pub fn parse(text: &str) -> Result<Request> {
        let tokens = Lexer::new(text).tokens()?;
        let mut parser = Parser::new(tokens);
        let request = parser.request()?;
        parser.expect_eof()?;
        Ok(request)
    }

    /// Parses and applies a request.
    pub fn execute(db: &Database, text: &str) -> Result<()> {
        let request = Self::parse(text)?;
        tracing::debug!(request = text, "executing schema request");
        request.apply(db)
    }

    pub fn apply(&self, db: &Database) -> Result<()> {
        match self {
            Request::Create { table, schema } => {
                add_schema(db.create_table(table)?, schema)?.finish()
            }
            Request::Ensure { table, schema } => {
                add_schema(db.ensure_table(table)?, schema)?.finish()
            }
            Request::Drop { table } => db.drop_table(table),
            Request::Rename { from, to } => db.rename_table(from, to),
            Request::AlterCreate { table, schema } => {
                add_schema(db.alter_table(table)?, schema)?.finish()
            }
            Request::AlterDrop { table, schema } => {
                let mut builder = db.alter_table(table)?;
                for index in &schema.indexes {
                    builder = builder.drop_index(&index.columns.join(","))?;
                }
                for column in &schema.columns {
                    builder = builder.drop_column(column)?;
                }
                builder.finish()
            }
            Request::AlterRename { table, renames } => {
                let mut builder = db.alter_table(table)?;
                for (from, to) in renames {
                    builder = builder.rename_column(from, to)?;
                }
                builder.finish()
            }
        }
    }
}

fn add_schema(mut builder: TableBuilder, schema: &SchemaSpec) -> Result<TableBuilder> {
    for column in &schema.columns {
        builder = builder.add_column(column)?;
    }
    for index in &schema.indexes {
        builder = builder.add_index(
            &index.columns.join(","),
            index.is_key,
            index.unique,
            index.fkey.clone(),
        )?;
    }
    Ok(builder)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Symbol(char),
    Eof,
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn tokens(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let eof = token == Token::Eof;
            tokens.push(token);
            if eof {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn next_token(&mut self) -> Result<Token> {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
        let Some(ch) = self.peek() else {
            return Ok(Token::Eof);
        };
        if ch.is_alphanumeric() || ch == '_' {
            let start = self.pos;
            while let Some(c) = self.peek().filter(|c| c.is_alphanumeric() || *c == '_') {
                self.pos += c.len_utf8();
            }
            // rule and flag columns: total?, name!
            if let Some(c) = self.peek().filter(|c| *c == '?' || *c == '!') {
                self.pos += c.len_utf8();
            }
            return Ok(Token::Word(self.input[start..self.pos].to_string()));
        }
        self.pos += ch.len_utf8();
        match ch {
            '(' | ')' | ',' | '-' => Ok(Token::Symbol(ch)),
            _ => Err(Error::Parse(format!(
                "unexpected '{}' at {}",
                ch,
                self.pos - ch.len_utf8()
            ))),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.current(), Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", keyword)))
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if *self.current() == Token::Symbol(symbol) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<()> {
        if self.eat_symbol(symbol) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", symbol)))
        }
    }

    fn expect_eof(&self) -> Result<()> {
        match self.current() {
            Token::Eof => Ok(()),
            _ => Err(self.error("unexpected trailing input")),
        }
    }

    fn name(&mut self) -> Result<String> {
        match self.current().clone() {
            Token::Word(word) => {
                self.advance();
                Ok(word)
            }
            _ => Err(self.error("expected a name")),
        }
    }

    fn error(&self, msg: &str) -> Error {
        let found = match self.current() {
            Token::Word(w) => w.clone(),
            Token::Symbol(c) => c.to_string(),
            Token::Eof => "end of input".to_string(),
        };
        Error::Parse(format!("{}, found {}", msg, found))
    }

    fn request(&mut self) -> Result<Request> {
        if self.eat_keyword("create") {
            let table = self.name()?;
            let schema = self.schema(true)?;
            Ok(Request::Create { table, schema })
        } else if self.eat_keyword("ensure") {
            let table = self.name()?;
            let schema = self.schema(false)?;
            Ok(Request::Ensure { table, schema })
        } else if self.eat_keyword("drop") {
            Ok(Request::Drop { table: self.name()? })
        } else if self.eat_keyword("rename") {
            let from = self.name()?;
            self.expect_keyword("to")?;
            let to = self.name()?;
            Ok(Request::Rename { from, to })
        } else if self.eat_keyword("alter") {
            self.alter()
        } else {
            Err(self.error("expected create, ensure, drop, rename or alter"))
        }
    }

    fn alter(&mut self) -> Result<Request> {
        let table = self.name()?;
        if self.eat_keyword("create") {
            let schema = self.schema(false)?;
            Ok(Request::AlterCreate { table, schema })
        } else if self.eat_keyword("drop") {
            let schema = self.schema(false)?;
            Ok(Request::AlterDrop { table, schema })
        } else if self.eat_keyword("rename") {
            let mut renames = Vec::new();
            loop {
                let from = self.name()?;
                self.expect_keyword("to")?;
                let to = self.name()?;
                renames.push((from, to));
                if !self.eat_symbol(',') {
                    break;
                }
            }
            Ok(Request::AlterRename { table, renames })
        } else {
            Err(self.error("expected create, drop or rename"))
        }
    }

    /// A schema. Partial schemas may omit the column list.
    fn schema(&mut self, full: bool) -> Result<SchemaSpec> {
        let mut schema = SchemaSpec::default();
        if full || *self.current() == Token::Symbol('(') {
            schema.columns = self.column_list(true)?;
        }
        while self.is_keyword("key") || self.is_keyword("index") {
            schema.indexes.push(self.index()?);
        }
        Ok(schema)
    }

    fn column_list(&mut self, placeholders: bool) -> Result<Vec<String>> {
        self.expect_symbol('(')?;
        let mut columns = Vec::new();
        if self.eat_symbol(')') {
            return Ok(columns);
        }
        loop {
            if placeholders && self.eat_symbol('-') {
                columns.push("-".to_string());
            } else {
                columns.push(self.name()?);
            }
            if self.eat_symbol(')') {
                return Ok(columns);
            }
            self.expect_symbol(',')?;
        }
    }

    fn index(&mut self) -> Result<IndexSpec> {
        let is_key = self.eat_keyword("key");
        if !is_key {
            self.expect_keyword("index")?;
        }
        let unique = !is_key && self.eat_keyword("unique");
        let columns = self.column_list(false)?;
        let fkey = if self.eat_keyword("in") {
            let table = self.name()?;
            let columns = if *self.current() == Token::Symbol('(') {
                self.column_list(false)?
            } else {
                Vec::new()
            };
            let mode = if self.eat_keyword("cascade") {
                if self.eat_keyword("update") {
                    CascadeMode::CascadeUpdates
                } else if self.eat_keyword("delete") {
                    CascadeMode::CascadeDeletes
                } else {
                    CascadeMode::Cascade
                }
            } else {
                CascadeMode::Block
            };
            Some(ForeignKey {
                table,
                columns,
                mode,
            })
        } else {
            None
        };
        Ok(IndexSpec {
            columns,
            is_key,
            unique,
            fkey,
        })
    }
}
