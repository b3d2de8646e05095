//! In-memory PostgreSQL server for integration tests.
//!
//! [`FakeServer`] hands out [`FakeTransport`]s that speak the real wire
//! protocol. Each transport is one backend session; queries are executed
//! as soon as the client writes them and the responses wait in the
//! session's output buffer until the client reads them.
//!
//! The SQL dialect covers what the tests and the driver issue: simple
//! tables, literals and a few functions, transaction control, cursors
//! (DECLARE/FETCH/MOVE/CLOSE), LISTEN/NOTIFY, large objects, SET/RESET and
//! `DO` blocks raising a notice.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, ErrorKind};
use std::os::fd::RawFd;
use std::rc::Rc;

use pgcursor::protocol::codec::MessageBuilder;
use pgcursor::protocol::types::{Oid, oid};
use pgcursor::{Connection, Opts, Transport, wait_select};

const VOID: Oid = 2278;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Int(i64),
    Int8(i64),
    Oid(u32),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    Void,
}

impl Value {
    fn type_oid(&self) -> Oid {
        match self {
            Value::Null | Value::Text(_) => oid::TEXT,
            Value::Int(_) => oid::INT4,
            Value::Int8(_) => oid::INT8,
            Value::Oid(_) => oid::OID,
            Value::Bool(_) => oid::BOOL,
            Value::Bytes(_) => oid::BYTEA,
            Value::Void => VOID,
        }
    }

    fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(n) | Value::Int8(n) => Some(n.to_string()),
            Value::Oid(n) => Some(n.to_string()),
            Value::Bool(b) => Some(if *b { "t" } else { "f" }.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Bytes(b) => Some(format!("\\x{}", hex::encode(b))),
            Value::Void => Some(String::new()),
        }
    }

    fn as_int(&self) -> Result<i64, SqlError> {
        match self {
            Value::Int(n) | Value::Int8(n) => Ok(*n),
            Value::Oid(n) => Ok(i64::from(*n)),
            Value::Text(s) => s
                .parse()
                .map_err(|_| {
                    SqlError::new(
                        "22P02",
                        format!("invalid input syntax for type integer: \"{}\"", s),
                    )
                }),
            other => Err(SqlError::new("42804", format!("expected an integer, got {:?}", other))),
        }
    }

    fn coerce(self, type_oid: Oid) -> Value {
        match (self, type_oid) {
            (Value::Int(n), oid::INT8) => Value::Int8(n),
            (Value::Int8(n), oid::INT4) => Value::Int(n),
            (Value::Int(n) | Value::Int8(n), oid::TEXT) => Value::Text(n.to_string()),
            (Value::Text(s), oid::INT4) => s.parse().map_or(Value::Text(s), Value::Int),
            (v, _) => v,
        }
    }

    fn sort_key(&self) -> (i64, String) {
        match self {
            Value::Int(n) | Value::Int8(n) => (*n, String::new()),
            other => (0, other.to_text().unwrap_or_default()),
        }
    }
}

#[derive(Debug)]
struct SqlError {
    severity: &'static str,
    code: &'static str,
    message: String,
    hint: Option<&'static str>,
}

impl SqlError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR",
            code,
            message: message.into(),
            hint: None,
        }
    }

    fn syntax(near: impl std::fmt::Debug) -> Self {
        Self::new("42601", format!("syntax error at or near {:?}", near))
    }
}

#[derive(Debug, Clone, Default)]
struct ResultSet {
    columns: Vec<(String, Oid)>,
    rows: Vec<Vec<Value>>,
}

enum Outcome {
    Rows(ResultSet, String),
    Command(String),
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<(String, Oid)>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    fn column_index(&self, name: &str) -> Result<usize, SqlError> {
        self.columns
            .iter()
            .position(|(c, _)| c == name)
            .ok_or_else(|| SqlError::new("42703", format!("column \"{}\" does not exist", name)))
    }
}

#[derive(Debug)]
struct FakeCursor {
    result: ResultSet,
    /// Current row, 1-based; 0 is before the first row, len + 1 after the last.
    pos: usize,
    hold: bool,
    scroll: Option<bool>,
    declared_in_open_tx: bool,
}

// === Tokenizer ===

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Ident(String),
    Num(i64),
    Str(String),
    Dollar(String),
    Sym(char),
    Cast,
}

fn tokenize(sql: &str) -> Result<Vec<Tok>, SqlError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '\'' || ((c == 'e' || c == 'E') && chars.get(i + 1) == Some(&'\'')) {
            let escapes = c != '\'';
            i += if escapes { 2 } else { 1 };
            let mut s = String::new();
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(SqlError::new("42601", "unterminated quoted string"));
                };
                i += 1;
                if ch == '\'' {
                    if chars.get(i) == Some(&'\'') {
                        s.push('\'');
                        i += 1;
                    } else {
                        break;
                    }
                } else if ch == '\\' && escapes {
                    if let Some(&next) = chars.get(i) {
                        s.push(next);
                        i += 1;
                    }
                } else {
                    s.push(ch);
                }
            }
            toks.push(Tok::Str(s));
        } else if c == '"' {
            i += 1;
            let mut s = String::new();
            loop {
                let Some(&ch) = chars.get(i) else {
                    return Err(SqlError::new("42601", "unterminated quoted identifier"));
                };
                i += 1;
                if ch == '"' {
                    if chars.get(i) == Some(&'"') {
                        s.push('"');
                        i += 1;
                    } else {
                        break;
                    }
                } else {
                    s.push(ch);
                }
            }
            toks.push(Tok::Ident(s));
        } else if c == '$' && chars.get(i + 1) == Some(&'$') {
            i += 2;
            let start = i;
            while i + 1 < chars.len() && !(chars[i] == '$' && chars[i + 1] == '$') {
                i += 1;
            }
            toks.push(Tok::Dollar(chars[start..i].iter().collect()));
            i += 2;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse()
                .map_err(|_| {
                    SqlError::new("22003", format!("value \"{}\" is out of range", text))
                })?;
            toks.push(Tok::Num(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            toks.push(Tok::Word(chars[start..i].iter().collect::<String>().to_lowercase()));
        } else if c == ':' && chars.get(i + 1) == Some(&':') {
            toks.push(Tok::Cast);
            i += 2;
        } else {
            toks.push(Tok::Sym(c));
            i += 1;
        }
    }
    Ok(toks)
}

struct Parser<'t> {
    toks: &'t [Tok],
    i: usize,
}

impl<'t> Parser<'t> {
    fn new(toks: &'t [Tok]) -> Self {
        Self { toks, i: 0 }
    }

    fn peek(&self) -> Option<&'t Tok> {
        self.toks.get(self.i)
    }

    fn next(&mut self) -> Option<&'t Tok> {
        let t = self.toks.get(self.i);
        self.i += 1;
        t
    }

    fn at_end(&self) -> bool {
        self.i >= self.toks.len()
    }

    fn peek_word(&self, w: &str) -> bool {
        matches!(self.peek(), Some(Tok::Word(x)) if x == w)
    }

    fn eat_word(&mut self, w: &str) -> bool {
        if self.peek_word(w) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, w: &str) -> Result<(), SqlError> {
        if self.eat_word(w) {
            Ok(())
        } else {
            Err(SqlError::syntax(self.peek()))
        }
    }

    fn eat_sym(&mut self, c: char) -> bool {
        if self.peek() == Some(&Tok::Sym(c)) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, c: char) -> Result<(), SqlError> {
        if self.eat_sym(c) {
            Ok(())
        } else {
            Err(SqlError::syntax(self.peek()))
        }
    }

    fn word(&mut self) -> Result<String, SqlError> {
        match self.next() {
            Some(Tok::Word(w)) => Ok(w.clone()),
            other => Err(SqlError::syntax(other)),
        }
    }

    fn ident(&mut self) -> Result<String, SqlError> {
        match self.next() {
            Some(Tok::Word(w) | Tok::Ident(w)) => Ok(w.clone()),
            other => Err(SqlError::syntax(other)),
        }
    }

    /// Table name, dropping a schema qualifier.
    fn table_name(&mut self) -> Result<String, SqlError> {
        let mut name = self.ident()?;
        while self.eat_sym('.') {
            name = self.ident()?;
        }
        Ok(name)
    }

    fn int(&mut self) -> Result<i64, SqlError> {
        let negative = self.eat_sym('-');
        match self.next() {
            Some(Tok::Num(n)) => Ok(if negative { -n } else { *n }),
            other => Err(SqlError::syntax(other)),
        }
    }

    fn expr(&mut self) -> Result<Expr, SqlError> {
        let expr = match self.next() {
            Some(Tok::Num(n)) => Expr::Lit(int_value(*n)),
            Some(Tok::Sym('-')) => match self.next() {
                Some(Tok::Num(n)) => Expr::Lit(int_value(-n)),
                other => return Err(SqlError::syntax(other)),
            },
            Some(Tok::Str(s)) => Expr::Lit(Value::Text(s.clone())),
            Some(Tok::Sym('*')) => Expr::Star,
            Some(Tok::Word(w)) if w == "null" => Expr::Lit(Value::Null),
            Some(Tok::Word(w)) if w == "true" => Expr::Lit(Value::Bool(true)),
            Some(Tok::Word(w)) if w == "false" => Expr::Lit(Value::Bool(false)),
            Some(Tok::Word(w) | Tok::Ident(w)) => {
                let name = w.clone();
                if self.eat_sym('(') {
                    let mut args = Vec::new();
                    if !self.eat_sym(')') {
                        loop {
                            args.push(self.expr()?);
                            if self.eat_sym(')') {
                                break;
                            }
                            self.expect_sym(',')?;
                        }
                    }
                    Expr::Call(name, args)
                } else if self.eat_sym('.') {
                    Expr::Col(self.ident()?)
                } else {
                    Expr::Col(name)
                }
            }
            other => return Err(SqlError::syntax(other)),
        };
        if self.peek() == Some(&Tok::Cast) {
            self.i += 1;
            let ty = self.word()?;
            return Ok(Expr::Cast(Box::new(expr), ty));
        }
        Ok(expr)
    }
}

/// Big-endian length prefix of a message.
fn be_len(b: &[u8]) -> usize {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
}

fn int_value(n: i64) -> Value {
    if i32::try_from(n).is_ok() {
        Value::Int(n)
    } else {
        Value::Int8(n)
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Col(String),
    Call(String, Vec<Expr>),
    Cast(Box<Expr>, String),
    Star,
}

impl Expr {
    fn column_name(&self) -> String {
        match self {
            Expr::Col(c) => c.clone(),
            Expr::Call(f, _) => f.clone(),
            Expr::Cast(inner, _) => inner.column_name(),
            Expr::Lit(_) | Expr::Star => "?column?".into(),
        }
    }
}

fn type_oid_of(name: &str) -> Oid {
    match name {
        "int" | "integer" | "int4" | "serial" | "smallint" | "int2" => oid::INT4,
        "bigint" | "int8" | "bigserial" => oid::INT8,
        "bool" | "boolean" => oid::BOOL,
        "bytea" => oid::BYTEA,
        _ => oid::TEXT,
    }
}

// === Sessions ===

#[derive(Debug, Default)]
struct Session {
    pid: u32,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    started: bool,
    closed: bool,
    terminated: bool,
    nonblocking: bool,
    stall_reads: usize,
    stall_writes: usize,
    interleave: bool,
    stalled_last: bool,
    read_chunk: Option<usize>,
    in_tx: bool,
    failed: bool,
    tx_isolation: Option<String>,
    cursors: HashMap<String, FakeCursor>,
    listening: HashSet<String>,
    pending_notifies: Vec<(u32, String, String)>,
    lo_fds: HashMap<i64, (u32, usize)>,
    next_fd: i64,
    params: HashMap<String, String>,
    startup_encoding: String,
    log: Vec<String>,
}

impl Session {
    fn send(&mut self, type_byte: u8, build: impl FnOnce(&mut MessageBuilder<'_>)) {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::new(&mut buf, type_byte);
        build(&mut msg);
        msg.finish();
        self.outbound.extend_from_slice(&buf);
    }

    fn send_fields(
        &mut self,
        type_byte: u8,
        severity: &str,
        code: &str,
        message: &str,
        hint: Option<&str>,
    ) {
        self.send(type_byte, |m| {
            m.write_u8(b'S');
            m.write_cstr(severity);
            m.write_u8(b'V');
            m.write_cstr(severity);
            m.write_u8(b'C');
            m.write_cstr(code);
            m.write_u8(b'M');
            m.write_cstr(message);
            if let Some(hint) = hint {
                m.write_u8(b'H');
                m.write_cstr(hint);
            }
            m.write_u8(0);
        });
    }

    fn send_error(&mut self, err: &SqlError) {
        self.send_fields(b'E', err.severity, err.code, &err.message, err.hint);
    }

    fn notice(&mut self, severity: &str, code: &str, message: &str) {
        self.send_fields(b'N', severity, code, message, None);
    }

    fn send_parameter(&mut self, name: &str, value: &str) {
        self.send(b'S', |m| {
            m.write_cstr(name);
            m.write_cstr(value);
        });
    }

    fn send_notification(&mut self, pid: u32, channel: &str, payload: &str) {
        self.send(b'A', |m| {
            m.write_u32(pid);
            m.write_cstr(channel);
            m.write_cstr(payload);
        });
    }

    fn send_ready(&mut self) {
        let status = match (self.in_tx, self.failed) {
            (_, true) => b'E',
            (true, false) => b'T',
            (false, false) => b'I',
        };
        self.send(b'Z', |m| m.write_u8(status));
    }

    fn send_rows(&mut self, rs: &ResultSet, tag: &str) {
        self.send(b'T', |m| {
            m.write_i16(i16::try_from(rs.columns.len()).unwrap_or(i16::MAX));
            for (name, type_oid) in &rs.columns {
                m.write_cstr(name);
                m.write_u32(0);
                m.write_i16(0);
                m.write_u32(*type_oid);
                m.write_i16(-1);
                m.write_i32(-1);
                m.write_i16(0);
            }
        });
        for row in &rs.rows {
            self.send(b'D', |m| {
                m.write_i16(i16::try_from(row.len()).unwrap_or(i16::MAX));
                for value in row {
                    match value.to_text() {
                        Some(text) => {
                            m.write_i32(i32::try_from(text.len()).unwrap_or(i32::MAX));
                            m.write_bytes(text.as_bytes());
                        }
                        None => m.write_i32(-1),
                    }
                }
            });
        }
        self.send_complete(tag);
    }

    fn send_complete(&mut self, tag: &str) {
        self.send(b'C', |m| m.write_cstr(tag));
    }

    fn terminate(&mut self) {
        if self.terminated || self.closed {
            return;
        }
        self.send_fields(
            b'E',
            "FATAL",
            "57P01",
            "terminating connection due to administrator command",
            None,
        );
        self.terminated = true;
    }

    fn end_transaction(&mut self, committed: bool) {
        self.in_tx = false;
        self.failed = false;
        self.tx_isolation = None;
        self.cursors
            .retain(|_, c| c.hold && (committed || !c.declared_in_open_tx));
        for cursor in self.cursors.values_mut() {
            cursor.declared_in_open_tx = false;
        }
        self.lo_fds.clear();
        if !committed {
            self.pending_notifies.clear();
        }
    }

    fn flush_notifies(&mut self) {
        for (pid, channel, payload) in std::mem::take(&mut self.pending_notifies) {
            self.send_notification(pid, &channel, &payload);
        }
    }
}

#[derive(Debug, Default)]
struct Cluster {
    next_pid: u32,
    next_oid: u32,
    tables: HashMap<String, Table>,
    large_objects: BTreeMap<u32, Vec<u8>>,
    sessions: HashMap<u32, Session>,
}

impl Cluster {
    fn process(&mut self, s: &mut Session) {
        loop {
            if !s.started {
                let Some(len) = s.inbound.get(..4).map(be_len) else {
                    return;
                };
                if s.inbound.len() < len {
                    return;
                }
                let body: Vec<u8> = s.inbound.drain(..len).skip(8).collect();
                let mut parts = body
                    .split(|b| *b == 0)
                    .map(|p| String::from_utf8_lossy(p).into_owned());
                while let (Some(k), Some(v)) = (parts.next(), parts.next()) {
                    if k.is_empty() {
                        break;
                    }
                    s.params.insert(k, v);
                }
                s.started = true;
                let encoding = s
                    .params
                    .get("client_encoding")
                    .cloned()
                    .unwrap_or_else(|| "UTF8".into())
                    .to_uppercase();
                s.startup_encoding = encoding.clone();
                s.params.insert("client_encoding".into(), encoding.clone());
                s.send(b'R', |m| m.write_i32(0));
                s.send_parameter("server_version", "16.4");
                s.send_parameter("client_encoding", &encoding);
                s.send_parameter("standard_conforming_strings", "on");
                let pid = s.pid;
                s.send(b'K', |m| {
                    m.write_u32(pid);
                    m.write_u32(0x5eed);
                });
                s.send_ready();
                continue;
            }

            let Some(len) = s.inbound.get(1..5).map(be_len) else {
                return;
            };
            if s.inbound.len() < 1 + len {
                return;
            }
            let message: Vec<u8> = s.inbound.drain(..1 + len).collect();
            match message[0] {
                b'Q' => {
                    let body = &message[5..];
                    let sql = String::from_utf8_lossy(&body[..body.len().saturating_sub(1)])
                        .into_owned();
                    s.log.push(sql.clone());
                    self.simple_query(s, &sql);
                }
                b'X' => {
                    s.closed = true;
                    s.inbound.clear();
                    return;
                }
                b'f' => {}
                other => {
                    s.send_error(&SqlError::new(
                        "08P01",
                        format!("unexpected message '{}'", other as char),
                    ));
                    s.send_ready();
                }
            }
        }
    }

    fn simple_query(&mut self, s: &mut Session, sql: &str) {
        let toks = match tokenize(sql) {
            Ok(toks) => toks,
            Err(e) => {
                s.send_error(&e);
                s.send_ready();
                return;
            }
        };
        let statements: Vec<&[Tok]> = toks
            .split(|t| *t == Tok::Sym(';'))
            .filter(|st| !st.is_empty())
            .collect();
        if statements.is_empty() {
            s.send(b'I', |_| {});
            s.send_ready();
            return;
        }
        for st in statements {
            match self.execute(s, st) {
                Ok(Outcome::Rows(rs, tag)) => s.send_rows(&rs, &tag),
                Ok(Outcome::Command(tag)) => s.send_complete(&tag),
                Err(e) => {
                    if s.in_tx {
                        s.failed = true;
                    }
                    s.send_error(&e);
                    break;
                }
            }
            if !s.in_tx {
                s.flush_notifies();
                s.lo_fds.clear();
            }
        }
        s.send_ready();
    }

    fn execute(&mut self, s: &mut Session, toks: &[Tok]) -> Result<Outcome, SqlError> {
        let mut p = Parser::new(toks);
        let kw = p.word()?;
        if s.failed && !matches!(kw.as_str(), "commit" | "end" | "rollback" | "abort") {
            return Err(SqlError::new(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }
        match kw.as_str() {
            "begin" | "start" => {
                p.eat_word("transaction");
                if s.in_tx {
                    s.notice("WARNING", "25001", "there is already a transaction in progress");
                } else {
                    s.in_tx = true;
                    if p.eat_word("isolation") {
                        p.expect_word("level")?;
                        let mut level = Vec::new();
                        while let Some(Tok::Word(w)) = p.next() {
                            level.push(w.clone());
                        }
                        s.tx_isolation = Some(level.join(" "));
                    }
                }
                Ok(Outcome::Command("BEGIN".into()))
            }
            "commit" | "end" => {
                let tag = if s.failed { "ROLLBACK" } else { "COMMIT" };
                if !s.in_tx {
                    s.notice("WARNING", "25P01", "there is no transaction in progress");
                }
                let committed = !s.failed;
                s.end_transaction(committed);
                Ok(Outcome::Command(tag.into()))
            }
            "rollback" | "abort" => {
                if !s.in_tx {
                    s.notice("WARNING", "25P01", "there is no transaction in progress");
                }
                s.end_transaction(false);
                Ok(Outcome::Command("ROLLBACK".into()))
            }
            "select" => {
                let rs = self.select(s, &mut p)?;
                let tag = format!("SELECT {}", rs.rows.len());
                Ok(Outcome::Rows(rs, tag))
            }
            "show" => {
                let name = p.ident()?;
                let value = if name == "transaction_isolation" {
                    s.tx_isolation.clone().unwrap_or_else(|| "read committed".into())
                } else {
                    s.params.get(&name).cloned().unwrap_or_default()
                };
                let rs = ResultSet {
                    columns: vec![(name, oid::TEXT)],
                    rows: vec![vec![Value::Text(value)]],
                };
                Ok(Outcome::Rows(rs, "SHOW".into()))
            }
            "create" => self.create_table(&mut p),
            "drop" => {
                p.expect_word("table")?;
                let if_exists = p.eat_word("if") && p.eat_word("exists");
                let name = p.table_name()?;
                if self.tables.remove(&name).is_none() && !if_exists {
                    return Err(SqlError::new(
                        "42P01",
                        format!("table \"{}\" does not exist", name),
                    ));
                }
                Ok(Outcome::Command("DROP TABLE".into()))
            }
            "insert" => self.insert(s, &mut p),
            "update" => self.update(s, &mut p),
            "delete" => self.delete(s, &mut p),
            "declare" => self.declare(s, &mut p),
            "fetch" => fetch(s, &mut p),
            "move" => move_cursor(s, &mut p),
            "close" => {
                if p.eat_word("all") {
                    s.cursors.clear();
                } else {
                    let name = p.ident()?;
                    if s.cursors.remove(&name).is_none() {
                        return Err(SqlError::new(
                            "34000",
                            format!("cursor \"{}\" does not exist", name),
                        ));
                    }
                }
                Ok(Outcome::Command("CLOSE CURSOR".into()))
            }
            "listen" => {
                let channel = p.ident()?;
                s.listening.insert(channel);
                Ok(Outcome::Command("LISTEN".into()))
            }
            "unlisten" => {
                if p.eat_sym('*') {
                    s.listening.clear();
                } else {
                    let channel = p.ident()?;
                    s.listening.remove(&channel);
                }
                Ok(Outcome::Command("UNLISTEN".into()))
            }
            "notify" => {
                let channel = p.ident()?;
                let payload = if p.eat_sym(',') {
                    match p.next() {
                        Some(Tok::Str(text)) => text.clone(),
                        other => return Err(SqlError::syntax(other)),
                    }
                } else {
                    String::new()
                };
                self.notify(s, &channel, &payload);
                Ok(Outcome::Command("NOTIFY".into()))
            }
            "set" => set(s, &mut p),
            "reset" => {
                p.expect_word("all")?;
                let startup = s.startup_encoding.clone();
                if s.params.get("client_encoding") != Some(&startup) {
                    s.params.insert("client_encoding".into(), startup.clone());
                    s.send_parameter("client_encoding", &startup);
                }
                Ok(Outcome::Command("RESET".into()))
            }
            "do" => {
                let Some(Tok::Dollar(body)) = p.next() else {
                    return Err(SqlError::syntax("do"));
                };
                let lower = body.to_lowercase();
                if let Some(at) = lower.find("raise notice '") {
                    let rest = &body[at + "raise notice '".len()..];
                    let message = rest.split('\'').next().unwrap_or_default().to_string();
                    s.notice("NOTICE", "00000", &message);
                }
                Ok(Outcome::Command("DO".into()))
            }
            other => Err(SqlError::syntax(other)),
        }
    }

    fn notify(&mut self, s: &mut Session, channel: &str, payload: &str) {
        let sender = s.pid;
        if s.listening.contains(channel) {
            s.pending_notifies
                .push((sender, channel.to_string(), payload.to_string()));
        }
        for other in self.sessions.values_mut() {
            if other.listening.contains(channel) && !other.closed && !other.terminated {
                other.send_notification(sender, channel, payload);
            }
        }
    }

    fn create_table(&mut self, p: &mut Parser<'_>) -> Result<Outcome, SqlError> {
        if !p.eat_word("temp") {
            p.eat_word("temporary");
        }
        p.expect_word("table")?;
        let if_not_exists = p.eat_word("if") && p.eat_word("not") && p.eat_word("exists");
        let name = p.table_name()?;
        p.expect_sym('(')?;
        let mut columns = Vec::new();
        loop {
            let column = p.ident()?;
            let ty = p.word()?;
            columns.push((column, type_oid_of(&ty)));
            let mut depth = 0;
            loop {
                match p.peek() {
                    Some(Tok::Sym('(')) => depth += 1,
                    Some(Tok::Sym(')')) if depth > 0 => depth -= 1,
                    Some(Tok::Sym(')' | ',')) | None => break,
                    _ => {}
                }
                p.i += 1;
            }
            if p.eat_sym(')') {
                break;
            }
            p.expect_sym(',')?;
        }
        if self.tables.contains_key(&name) {
            if if_not_exists {
                return Ok(Outcome::Command("CREATE TABLE".into()));
            }
            return Err(SqlError::new("42P07", format!("relation \"{}\" already exists", name)));
        }
        self.tables.insert(name, Table { columns, rows: Vec::new() });
        Ok(Outcome::Command("CREATE TABLE".into()))
    }

    fn table(&self, name: &str) -> Result<&Table, SqlError> {
        self.tables
            .get(name)
            .ok_or_else(|| SqlError::new("42P01", format!("relation \"{}\" does not exist", name)))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, SqlError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| SqlError::new("42P01", format!("relation \"{}\" does not exist", name)))
    }

    fn insert(&mut self, s: &mut Session, p: &mut Parser<'_>) -> Result<Outcome, SqlError> {
        p.expect_word("into")?;
        let name = p.table_name()?;
        let table_columns = self.table(&name)?.columns.clone();
        let mut targets: Vec<usize> = (0..table_columns.len()).collect();
        if p.eat_sym('(') {
            targets.clear();
            loop {
                let column = p.ident()?;
                let idx = table_columns
                    .iter()
                    .position(|(c, _)| *c == column)
                    .ok_or_else(|| {
                        SqlError::new("42703", format!("column \"{}\" does not exist", column))
                    })?;
                targets.push(idx);
                if p.eat_sym(')') {
                    break;
                }
                p.expect_sym(',')?;
            }
        }
        p.expect_word("values")?;
        let mut new_rows = Vec::new();
        loop {
            p.expect_sym('(')?;
            let mut row = vec![Value::Null; table_columns.len()];
            for (n, idx) in targets.iter().enumerate() {
                if n > 0 {
                    p.expect_sym(',')?;
                }
                let value = self.eval(s, &p.expr()?, None)?;
                row[*idx] = value.coerce(table_columns[*idx].1);
            }
            p.expect_sym(')')?;
            new_rows.push(row);
            if !p.eat_sym(',') {
                break;
            }
        }
        let count = new_rows.len();
        self.table_mut(&name)?.rows.extend(new_rows);
        Ok(Outcome::Command(format!("INSERT 0 {}", count)))
    }

    /// Parse an optional `WHERE column = expr`.
    fn filter(
        &mut self,
        s: &mut Session,
        p: &mut Parser<'_>,
        table: &Table,
    ) -> Result<Option<(usize, Value)>, SqlError> {
        if !p.eat_word("where") {
            return Ok(None);
        }
        let column = p.ident()?;
        let idx = table.column_index(&column)?;
        p.expect_sym('=')?;
        let value = self.eval(s, &p.expr()?, None)?.coerce(table.columns[idx].1);
        Ok(Some((idx, value)))
    }

    fn update(&mut self, s: &mut Session, p: &mut Parser<'_>) -> Result<Outcome, SqlError> {
        let name = p.table_name()?;
        let table = self.table(&name)?.clone();
        p.expect_word("set")?;
        let mut assignments = Vec::new();
        loop {
            let column = p.ident()?;
            let idx = table.column_index(&column)?;
            p.expect_sym('=')?;
            let value = self.eval(s, &p.expr()?, None)?.coerce(table.columns[idx].1);
            assignments.push((idx, value));
            if !p.eat_sym(',') {
                break;
            }
        }
        let filter = self.filter(s, p, &table)?;
        let mut count = 0;
        for row in &mut self.table_mut(&name)?.rows {
            if filter.as_ref().is_none_or(|(idx, v)| row[*idx] == *v) {
                for (idx, value) in &assignments {
                    row[*idx] = value.clone();
                }
                count += 1;
            }
        }
        Ok(Outcome::Command(format!("UPDATE {}", count)))
    }

    fn delete(&mut self, s: &mut Session, p: &mut Parser<'_>) -> Result<Outcome, SqlError> {
        p.expect_word("from")?;
        let name = p.table_name()?;
        let table = self.table(&name)?.clone();
        let filter = self.filter(s, p, &table)?;
        let rows = &mut self.table_mut(&name)?.rows;
        let before = rows.len();
        rows.retain(|row| !filter.as_ref().is_none_or(|(idx, v)| row[*idx] == *v));
        Ok(Outcome::Command(format!("DELETE {}", before - rows.len())))
    }

    fn declare(&mut self, s: &mut Session, p: &mut Parser<'_>) -> Result<Outcome, SqlError> {
        let name = p.ident()?;
        let mut scroll = None;
        loop {
            if p.eat_word("binary") || p.eat_word("insensitive") {
                continue;
            }
            if p.eat_word("no") {
                p.expect_word("scroll")?;
                scroll = Some(false);
            } else if p.eat_word("scroll") {
                scroll = Some(true);
            } else {
                break;
            }
        }
        p.expect_word("cursor")?;
        let mut hold = false;
        if p.eat_word("with") {
            p.expect_word("hold")?;
            hold = true;
        } else if p.eat_word("without") {
            p.expect_word("hold")?;
        }
        p.expect_word("for")?;
        p.expect_word("select")?;
        let result = self.select(s, p)?;
        if !hold && !s.in_tx {
            return Err(SqlError::new(
                "25P01",
                "DECLARE CURSOR can only be used in transaction blocks",
            ));
        }
        if s.cursors.contains_key(&name) {
            return Err(SqlError::new("42P03", format!("cursor \"{}\" already exists", name)));
        }
        s.cursors.insert(
            name,
            FakeCursor {
                result,
                pos: 0,
                hold,
                scroll,
                declared_in_open_tx: s.in_tx,
            },
        );
        Ok(Outcome::Command("DECLARE CURSOR".into()))
    }

    fn select(&mut self, s: &mut Session, p: &mut Parser<'_>) -> Result<ResultSet, SqlError> {
        let mut items = Vec::new();
        loop {
            let expr = p.expr()?;
            let alias = if p.eat_word("as") { Some(p.ident()?) } else { None };
            items.push((expr, alias));
            if !p.eat_sym(',') {
                break;
            }
        }

        if !p.eat_word("from") {
            return self.select_values(s, &items);
        }

        let name = p.table_name()?;
        let table = if name == "pg_cursors" {
            Table {
                columns: vec![("name".into(), oid::TEXT), ("is_holdable".into(), oid::BOOL)],
                rows: s
                    .cursors
                    .iter()
                    .map(|(n, c)| vec![Value::Text(n.clone()), Value::Bool(c.hold)])
                    .collect(),
            }
        } else {
            self.table(&name)?.clone()
        };
        let filter = self.filter(s, p, &table)?;
        let mut rows: Vec<&Vec<Value>> = table
            .rows
            .iter()
            .filter(|row| filter.as_ref().is_none_or(|(idx, v)| row[*idx] == *v))
            .collect();
        if p.eat_word("order") {
            p.expect_word("by")?;
            let idx = table.column_index(&p.ident()?)?;
            rows.sort_by_key(|row| row[idx].sort_key());
            if p.eat_word("desc") {
                rows.reverse();
            } else {
                p.eat_word("asc");
            }
        }
        if !p.at_end() {
            return Err(SqlError::syntax(p.peek()));
        }

        let mut columns = Vec::new();
        for (expr, alias) in &items {
            match expr {
                Expr::Star => columns.extend(table.columns.iter().cloned()),
                Expr::Col(c) => {
                    let idx = table.column_index(c)?;
                    let name = alias.clone().unwrap_or_else(|| c.clone());
                    columns.push((name, table.columns[idx].1));
                }
                other => {
                    let sample = self.eval(s, other, None)?;
                    let name = alias.clone().unwrap_or_else(|| other.column_name());
                    columns.push((name, sample.type_oid()));
                }
            }
        }
        let mut out = Vec::new();
        for row in rows {
            let mut values = Vec::new();
            for (expr, _) in &items {
                match expr {
                    Expr::Star => values.extend(row.iter().cloned()),
                    other => values.push(self.eval(s, other, Some((&table, row)))?),
                }
            }
            out.push(values);
        }
        Ok(ResultSet { columns, rows: out })
    }

    fn select_values(
        &mut self,
        s: &mut Session,
        items: &[(Expr, Option<String>)],
    ) -> Result<ResultSet, SqlError> {
        if let [(Expr::Call(f, args), alias)] = items
            && f == "generate_series"
        {
            let [start, stop] = args.as_slice() else {
                return Err(SqlError::new("42883", "function generate_series does not exist"));
            };
            let start = self.eval(s, start, None)?.as_int()?;
            let stop = self.eval(s, stop, None)?.as_int()?;
            return Ok(ResultSet {
                columns: vec![(alias.clone().unwrap_or_else(|| f.clone()), oid::INT4)],
                rows: (start..=stop).map(|n| vec![Value::Int(n)]).collect(),
            });
        }
        let mut columns = Vec::new();
        let mut row = Vec::new();
        for (expr, alias) in items {
            let value = self.eval(s, expr, None)?;
            columns.push((alias.clone().unwrap_or_else(|| expr.column_name()), value.type_oid()));
            row.push(value);
        }
        Ok(ResultSet {
            columns,
            rows: vec![row],
        })
    }

    fn eval(
        &mut self,
        s: &mut Session,
        expr: &Expr,
        row: Option<(&Table, &Vec<Value>)>,
    ) -> Result<Value, SqlError> {
        match expr {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Col(c) => match row {
                Some((table, values)) => Ok(values[table.column_index(c)?].clone()),
                None => Err(SqlError::new("42703", format!("column \"{}\" does not exist", c))),
            },
            Expr::Star => Err(SqlError::syntax("*")),
            Expr::Cast(inner, ty) => {
                let value = self.eval(s, inner, row)?;
                Ok(match (value, ty.as_str()) {
                    (Value::Text(t), "bytea") => match t.strip_prefix("\\x") {
                        Some(digits) => Value::Bytes(
                            hex::decode(digits).map_err(|e| SqlError::new("22P02", e.to_string()))?,
                        ),
                        None => Value::Bytes(t.into_bytes()),
                    },
                    (v, "int8" | "bigint") => Value::Int8(v.as_int()?),
                    (v, "int4" | "int" | "integer") => Value::Int(v.as_int()?),
                    (v, "text") => v.to_text().map_or(Value::Null, Value::Text),
                    (v, _) => v,
                })
            }
            Expr::Call(f, args) => {
                let mut values = Vec::new();
                for arg in args {
                    values.push(self.eval(s, arg, row)?);
                }
                self.call(s, f, values)
            }
        }
    }

    fn call(&mut self, s: &mut Session, f: &str, args: Vec<Value>) -> Result<Value, SqlError> {
        let int_arg = |n: usize| -> Result<i64, SqlError> {
            args.get(n)
                .ok_or_else(|| SqlError::new("42883", format!("function {} does not exist", f)))?
                .as_int()
        };
        let fd_entry = |s: &mut Session, fd: i64| -> Result<(u32, usize), SqlError> {
            s.lo_fds
                .get(&fd)
                .copied()
                .ok_or_else(|| {
                    SqlError::new("42704", format!("invalid large-object descriptor: {}", fd))
                })
        };
        match f {
            "repeat" => {
                let text = args.first().and_then(Value::to_text).unwrap_or_default();
                let times = usize::try_from(int_arg(1)?).unwrap_or(0);
                Ok(Value::Text(text.repeat(times)))
            }
            "pg_backend_pid" => Ok(Value::Int(i64::from(s.pid))),
            "pg_sleep" => Ok(Value::Void),
            "pg_terminate_backend" => {
                let pid = u32::try_from(int_arg(0)?).unwrap_or(0);
                match self.sessions.get_mut(&pid) {
                    Some(victim) => {
                        victim.terminate();
                        Ok(Value::Bool(true))
                    }
                    None => {
                        let message =
                            format!("PID {} is not a PostgreSQL backend process", pid);
                        s.notice("WARNING", "01000", &message);
                        Ok(Value::Bool(false))
                    }
                }
            }
            "lo_creat" => {
                self.next_oid += 1;
                let new_oid = 16384 + self.next_oid;
                self.large_objects.insert(new_oid, Vec::new());
                Ok(Value::Oid(new_oid))
            }
            "lo_open" => {
                let lo = u32::try_from(int_arg(0)?).unwrap_or(0);
                if !self.large_objects.contains_key(&lo) {
                    return Err(SqlError::new(
                        "42704",
                        format!("large object {} does not exist", lo),
                    ));
                }
                s.next_fd += 1;
                let fd = s.next_fd - 1;
                s.lo_fds.insert(fd, (lo, 0));
                Ok(Value::Int(fd))
            }
            "loread" => {
                let fd = int_arg(0)?;
                let (lo, pos) = fd_entry(s, fd)?;
                let len = usize::try_from(int_arg(1)?).unwrap_or(0);
                let data = self.large_objects.get(&lo).cloned().unwrap_or_default();
                let end = pos.saturating_add(len).min(data.len());
                let chunk = data.get(pos.min(end)..end).unwrap_or_default().to_vec();
                s.lo_fds.insert(fd, (lo, pos + chunk.len()));
                Ok(Value::Bytes(chunk))
            }
            "lowrite" => {
                let fd = int_arg(0)?;
                let (lo, pos) = fd_entry(s, fd)?;
                let Some(Value::Bytes(bytes)) = args.get(1) else {
                    return Err(SqlError::new(
                        "42883",
                        "function lowrite(integer, text) does not exist",
                    ));
                };
                let data = self.large_objects.entry(lo).or_default();
                if data.len() < pos + bytes.len() {
                    data.resize(pos + bytes.len(), 0);
                }
                data[pos..pos + bytes.len()].copy_from_slice(bytes);
                s.lo_fds.insert(fd, (lo, pos + bytes.len()));
                Ok(Value::Int(i64::try_from(bytes.len()).unwrap_or(i64::MAX)))
            }
            "lo_lseek64" | "lo_lseek" => {
                let fd = int_arg(0)?;
                let (lo, pos) = fd_entry(s, fd)?;
                let offset = int_arg(1)?;
                let size = self.large_objects.get(&lo).map_or(0, Vec::len);
                let base = match int_arg(2)? {
                    0 => 0,
                    1 => i64::try_from(pos).unwrap_or(0),
                    _ => i64::try_from(size).unwrap_or(0),
                };
                let new_pos = usize::try_from(base + offset)
                    .map_err(|_| SqlError::new("22023", "invalid seek offset"))?;
                s.lo_fds.insert(fd, (lo, new_pos));
                Ok(Value::Int8(i64::try_from(new_pos).unwrap_or(i64::MAX)))
            }
            "lo_tell64" | "lo_tell" => {
                let (_, pos) = fd_entry(s, int_arg(0)?)?;
                Ok(Value::Int8(i64::try_from(pos).unwrap_or(i64::MAX)))
            }
            "lo_close" => {
                let fd = int_arg(0)?;
                fd_entry(s, fd)?;
                s.lo_fds.remove(&fd);
                Ok(Value::Int(0))
            }
            "lo_unlink" => {
                let lo = u32::try_from(int_arg(0)?).unwrap_or(0);
                if self.large_objects.remove(&lo).is_none() {
                    return Err(SqlError::new(
                        "42704",
                        format!("large object {} does not exist", lo),
                    ));
                }
                Ok(Value::Int(1))
            }
            other => Err(SqlError::new("42883", format!("function {} does not exist", other))),
        }
    }
}

fn fetch(s: &mut Session, p: &mut Parser<'_>) -> Result<Outcome, SqlError> {
    p.eat_word("forward");
    let count = if p.eat_word("all") {
        usize::MAX
    } else if p.eat_word("next") {
        1
    } else {
        usize::try_from(p.int()?).unwrap_or(0)
    };
    if !p.eat_word("from") {
        p.eat_word("in");
    }
    let name = p.ident()?;
    let cursor = s
        .cursors
        .get_mut(&name)
        .ok_or_else(|| SqlError::new("34000", format!("cursor \"{}\" does not exist", name)))?;
    let len = cursor.result.rows.len();
    let start = cursor.pos.min(len);
    let end = start.saturating_add(count).min(len);
    let rows = cursor.result.rows[start..end].to_vec();
    cursor.pos = if cursor.pos.saturating_add(count) > len {
        len + 1
    } else {
        cursor.pos + rows.len()
    };
    let tag = format!("FETCH {}", rows.len());
    Ok(Outcome::Rows(
        ResultSet {
            columns: cursor.result.columns.clone(),
            rows,
        },
        tag,
    ))
}

fn move_cursor(s: &mut Session, p: &mut Parser<'_>) -> Result<Outcome, SqlError> {
    let absolute = if p.eat_word("absolute") {
        true
    } else {
        p.eat_word("relative");
        false
    };
    let value = p.int()?;
    if !p.eat_word("in") {
        p.eat_word("from");
    }
    let name = p.ident()?;
    let cursor = s
        .cursors
        .get_mut(&name)
        .ok_or_else(|| SqlError::new("34000", format!("cursor \"{}\" does not exist", name)))?;
    let len = i64::try_from(cursor.result.rows.len()).unwrap_or(i64::MAX);
    let pos = i64::try_from(cursor.pos).unwrap_or(i64::MAX);
    let target = match (absolute, value) {
        (true, v) if v >= 0 => v,
        (true, v) => len + 1 + v,
        (false, v) => pos + v,
    };
    if target < pos && cursor.scroll == Some(false) {
        return Err(SqlError {
            hint: Some("Declare it with SCROLL option to enable backward scan."),
            ..SqlError::new("55000", "cursor can only scan forward")
        });
    }
    let target = target.clamp(0, len + 1);
    cursor.pos = usize::try_from(target).unwrap_or(0);
    let moved = if (1..=len).contains(&target) { 1 } else { 0 };
    Ok(Outcome::Command(format!("MOVE {}", moved)))
}

fn set(s: &mut Session, p: &mut Parser<'_>) -> Result<Outcome, SqlError> {
    if !p.eat_word("session") {
        p.eat_word("local");
    }
    if p.eat_word("authorization") {
        p.expect_word("default")?;
        return Ok(Outcome::Command("SET".into()));
    }
    let name = p.ident()?;
    if !p.eat_sym('=') {
        p.expect_word("to")?;
    }
    let value = match p.next() {
        Some(Tok::Str(v) | Tok::Word(v) | Tok::Ident(v)) => v.clone(),
        Some(Tok::Num(n)) => n.to_string(),
        other => return Err(SqlError::syntax(other)),
    };
    if name == "client_encoding" {
        let canonical = value.to_uppercase().replace(['-', '_'], "");
        let canonical = match canonical.as_str() {
            "UTF8" | "UNICODE" => "UTF8",
            "LATIN1" => "LATIN1",
            "LATIN9" => "LATIN9",
            "SQLASCII" => "SQL_ASCII",
            "WIN1252" => "WIN1252",
            "EUCJP" => "EUC_JP",
            _ => {
                return Err(SqlError::new(
                    "22023",
                    format!("invalid value for parameter \"client_encoding\": \"{}\"", value),
                ));
            }
        };
        s.params.insert(name.clone(), canonical.to_string());
        s.send_parameter("client_encoding", canonical);
    } else {
        s.params.insert(name, value);
    }
    Ok(Outcome::Command("SET".into()))
}

// === Transport ===

/// One backend session of a [`FakeServer`].
pub struct FakeTransport {
    cluster: Rc<RefCell<Cluster>>,
    pid: u32,
}

impl FakeTransport {
    fn with_session<R>(&self, f: impl FnOnce(&mut Cluster, &mut Session) -> R) -> R {
        let mut cluster = self.cluster.borrow_mut();
        let mut session = cluster.sessions.remove(&self.pid).unwrap_or_default();
        let out = f(&mut cluster, &mut session);
        cluster.sessions.insert(self.pid, session);
        out
    }
}

impl Transport for FakeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_session(|_, s| {
            if s.nonblocking {
                if s.stall_reads > 0 {
                    s.stall_reads -= 1;
                    return Err(ErrorKind::WouldBlock.into());
                }
                if s.interleave {
                    s.stalled_last = !s.stalled_last;
                    if s.stalled_last {
                        return Err(ErrorKind::WouldBlock.into());
                    }
                }
            }
            if s.outbound.is_empty() {
                if s.terminated || s.closed {
                    return Ok(0);
                }
                if s.nonblocking {
                    return Err(ErrorKind::WouldBlock.into());
                }
                return Err(io::Error::other("blocking read with nothing to send"));
            }
            let n = buf
                .len()
                .min(s.outbound.len())
                .min(s.read_chunk.unwrap_or(usize::MAX));
            buf[..n].copy_from_slice(&s.outbound[..n]);
            s.outbound.drain(..n);
            Ok(n)
        })
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_session(|cluster, s| {
            if s.nonblocking && s.stall_writes > 0 {
                s.stall_writes -= 1;
                return Err(ErrorKind::WouldBlock.into());
            }
            if !s.terminated && !s.closed {
                s.inbound.extend_from_slice(buf);
                cluster.process(s);
            }
            Ok(buf.len())
        })
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.with_session(|_, s| s.nonblocking = nonblocking);
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        -1
    }
}

/// Shared handle on the fake cluster.
#[derive(Clone, Default)]
pub struct FakeServer {
    cluster: Rc<RefCell<Cluster>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new backend session.
    pub fn transport(&self) -> FakeTransport {
        let mut cluster = self.cluster.borrow_mut();
        cluster.next_pid += 1;
        let pid = 4000 + cluster.next_pid;
        cluster.sessions.insert(
            pid,
            Session {
                pid,
                next_fd: 1,
                ..Session::default()
            },
        );
        FakeTransport {
            cluster: Rc::clone(&self.cluster),
            pid,
        }
    }

    /// Connect with options given as a URL query string, e.g. `"autocommit=1"`.
    pub fn connect_with_params(&self, params: &str) -> Connection<FakeTransport> {
        let url = format!("postgres://tester@fake/test?{}", params);
        let opts = Opts::try_from(url.as_str()).unwrap();
        Connection::with_transport(self.transport(), opts).unwrap()
    }

    /// Synchronous connection, autocommit off.
    pub fn connect(&self) -> Connection<FakeTransport> {
        self.connect_with_params("")
    }

    /// Synchronous connection in autocommit.
    pub fn connect_autocommit(&self) -> Connection<FakeTransport> {
        self.connect_with_params("autocommit=1")
    }

    /// Asynchronous connection, handshake completed.
    pub fn connect_async(&self) -> Connection<FakeTransport> {
        let mut conn = self.connect_with_params("async=1");
        wait_select(&mut conn).unwrap();
        conn
    }

    fn session<R>(&self, pid: u32, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut cluster = self.cluster.borrow_mut();
        f(cluster.sessions.get_mut(&pid).expect("unknown backend pid"))
    }

    /// Terminate a backend as `pg_terminate_backend` would.
    pub fn terminate(&self, pid: u32) {
        self.session(pid, Session::terminate);
    }

    /// Send a notification from an outside backend.
    pub fn notify(&self, channel: &str, payload: &str) {
        let mut cluster = self.cluster.borrow_mut();
        for s in cluster.sessions.values_mut() {
            if s.listening.contains(channel) {
                s.send_notification(1, channel, payload);
            }
        }
    }

    /// Make the next `n` non-blocking reads of `pid` would-block.
    pub fn stall_reads(&self, pid: u32, n: usize) {
        self.session(pid, |s| s.stall_reads = n);
    }

    /// Make the next `n` non-blocking writes of `pid` would-block.
    pub fn stall_writes(&self, pid: u32, n: usize) {
        self.session(pid, |s| s.stall_writes = n);
    }

    /// Alternate would-block and data on every non-blocking read.
    pub fn interleave_reads(&self, pid: u32) {
        self.session(pid, |s| s.interleave = true);
    }

    /// Deliver at most `n` bytes per read.
    pub fn read_chunk(&self, pid: u32, n: usize) {
        self.session(pid, |s| s.read_chunk = Some(n));
    }

    /// Queries received by `pid`, in order.
    pub fn queries(&self, pid: u32) -> Vec<String> {
        self.session(pid, |s| s.log.clone())
    }

    /// Forget the query log of `pid`.
    pub fn clear_queries(&self, pid: u32) {
        self.session(pid, |s| s.log.clear());
    }

    /// Whether `pid` has a server-side cursor called `name`.
    pub fn has_cursor(&self, pid: u32, name: &str) -> bool {
        self.session(pid, |s| s.cursors.contains_key(name))
    }

    /// Whether `pid` received Terminate.
    pub fn is_closed(&self, pid: u32) -> bool {
        self.session(pid, |s| s.closed)
    }

    /// Content of large object `oid`.
    pub fn large_object(&self, lo: u32) -> Option<Vec<u8>> {
        self.cluster.borrow().large_objects.get(&lo).cloned()
    }
}

/// Backend pid of a connection.
pub fn pid(conn: &Connection<FakeTransport>) -> u32 {
    conn.backend_pid().unwrap()
}

/// First column of every row as i32.
pub fn ints(rows: &[pgcursor::Row]) -> Vec<i32> {
    rows.iter().map(|r| r.get::<i32>(0).unwrap()).collect()
}
