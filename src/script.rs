//! Shell-style statement grammar.
//!
//! Splits section text into top-level statements by balanced-delimiter scanning and parses
//! each statement into a call chain (`db.col.method(args)...`) or a `var` binding.
//! Function literals are captured as opaque source text and never interpreted here.

/// An argument value as written in a fixture.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// Integer literal; stored as a 32-bit integer when it fits.
    Int(i64),
    /// `NumberLong(...)`, always stored as a 64-bit integer.
    Long(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    /// Object literal, fields in the order they were written.
    Object(Vec<(String, Value)>),
    /// `ObjectId("<hex>")`; `None` asks for a fresh identifier.
    ObjectId(Option<String>),
    Date(DateArg),
    Regex { pattern: String, flags: String },
    /// Source text of a `function (...) {...}` literal.
    Function(String),
    /// Reference to a `var` binding.
    Ident(String),
}

/// Argument of a `new Date(...)` / `ISODate(...)` literal.
#[derive(Debug, Clone, PartialEq)]
pub enum DateArg {
    Now,
    Text(String),
    Millis(i64),
}

/// One link of a call chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// `.name` or `['name']`
    Property(String),
    /// `.name(args)`
    Call { method: String, args: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `root.step.step(...)...`, evaluated left to right.
    Chain { root: String, steps: Vec<Step> },
    /// `var name = value`
    Bind { name: String, value: Value },
}

/// A parsed statement together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub expr: Expr,
    pub source: String,
    pub line: usize,
}

impl Statement {
    /// The collection this statement targets, when it is a `db.<name>` or
    /// `db.getCollection('<name>')` chain.
    pub fn collection(&self) -> Option<&str> {
        let Expr::Chain { root, steps } = &self.expr else {
            return None;
        };
        if root != "db" {
            return None;
        }
        match steps.first()? {
            Step::Property(name) => Some(name),
            Step::Call { method, args } if method == "getCollection" => match args.first() {
                Some(Value::String(name)) => Some(name),
                _ => None,
            },
            Step::Call { .. } => None,
        }
    }

    /// The new name given by a `renameCollection('<name>')` call.
    pub fn rename_target(&self) -> Option<&str> {
        let Expr::Chain { steps, .. } = &self.expr else {
            return None;
        };
        steps.iter().find_map(|step| match step {
            Step::Call { method, args } if method == "renameCollection" => match args.first() {
                Some(Value::String(name)) => Some(name.as_str()),
                _ => None,
            },
            _ => None,
        })
    }

    /// The first method called on the target collection.
    pub fn method(&self) -> Option<&str> {
        let Expr::Chain { steps, .. } = &self.expr else {
            return None;
        };
        steps.iter().skip(1).find_map(|step| match step {
            Step::Call { method, .. } => Some(method.as_str()),
            Step::Property(_) => None,
        })
    }
}

/// A grammar error, positioned by fixture line.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}: {message} (near `{excerpt}`)")]
pub struct ScriptError {
    pub message: String,
    pub line: usize,
    pub excerpt: String,
}

/// Statement text cut out of a section, not yet parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStatement {
    pub text: String,
    pub line: usize,
}

const EXCERPT_LEN: usize = 60;

fn excerpt(text: &str) -> String {
    let line = text.trim_start().lines().next().unwrap_or("");
    if line.chars().count() > EXCERPT_LEN {
        let cut: String = line.chars().take(EXCERPT_LEN).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

/// Split section text into statements.
///
/// `first_line` is the fixture line the text starts on. A statement ends at a top-level `;`
/// or at a top-level line break once it is complete, unless the next line continues the
/// chain with a leading `.`.
pub fn split_statements(text: &str, first_line: usize) -> Result<Vec<RawStatement>, ScriptError> {
    let bytes = text.as_bytes();
    let mut statements = Vec::new();
    let mut open: Vec<(u8, usize, usize)> = Vec::new();
    let mut line = first_line;
    let mut start: Option<(usize, usize)> = None;
    let mut last_significant: Option<u8> = None;
    let mut i = 0;

    let mut flush = |start: &mut Option<(usize, usize)>, end: usize| {
        if let Some((from, from_line)) = start.take() {
            let stmt = text[from..end].trim().trim_end_matches(';').trim_end();
            if !stmt.is_empty() {
                statements.push(RawStatement {
                    text: stmt.to_string(),
                    line: from_line,
                });
            }
        }
    };

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\n' => {
                if open.is_empty()
                    && start.is_some()
                    && !last_significant.is_some_and(is_continuation)
                    && next_significant(bytes, i + 1) != Some(b'.')
                {
                    flush(&mut start, i);
                    last_significant = None;
                }
                line += 1;
                i += 1;
                continue;
            }
            b if b.is_ascii_whitespace() => {
                i += 1;
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let from_line = line;
                i += 2;
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(ScriptError {
                                message: "unterminated block comment".to_string(),
                                line: from_line,
                                excerpt: excerpt(&text[i.min(text.len())..]),
                            });
                        }
                        Some(b'*') if bytes.get(i + 1) == Some(&b'/') => {
                            i += 2;
                            break;
                        }
                        Some(b'\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
                continue;
            }
            _ => {}
        }

        if start.is_none() {
            start = Some((i, line));
        }

        match b {
            b'"' | b'\'' | b'`' => {
                let from_line = line;
                i = skip_quoted(bytes, i, &mut line).ok_or_else(|| ScriptError {
                    message: "unterminated string literal".to_string(),
                    line: from_line,
                    excerpt: excerpt(&text[start.map_or(0, |s| s.0)..]),
                })?;
                last_significant = Some(b);
                continue;
            }
            b'/' if last_significant.is_none() || starts_regex(bytes, i) => {
                i = skip_regex(bytes, i).ok_or_else(|| ScriptError {
                    message: "unterminated regular expression".to_string(),
                    line,
                    excerpt: excerpt(&text[start.map_or(0, |s| s.0)..]),
                })?;
                last_significant = Some(b'/');
                continue;
            }
            b'(' | b'{' | b'[' => open.push((b, line, i)),
            b')' | b'}' | b']' => {
                let expected = match b {
                    b')' => b'(',
                    b'}' => b'{',
                    _ => b'[',
                };
                match open.pop() {
                    Some((opener, _, _)) if opener == expected => {}
                    _ => {
                        return Err(ScriptError {
                            message: format!("unbalanced '{}'", b as char),
                            line,
                            excerpt: excerpt(&text[start.map_or(0, |s| s.0)..]),
                        });
                    }
                }
            }
            b';' if open.is_empty() => {
                flush(&mut start, i);
                last_significant = None;
                i += 1;
                continue;
            }
            _ => {}
        }
        last_significant = Some(b);
        i += 1;
    }

    if let Some((opener, opener_line, at)) = open.pop() {
        return Err(ScriptError {
            message: format!("unterminated '{}'", opener as char),
            line: opener_line,
            excerpt: excerpt(&text[start.map_or(at, |s| s.0)..]),
        });
    }
    flush(&mut start, text.len());
    Ok(statements)
}

fn is_continuation(b: u8) -> bool {
    matches!(b, b'.' | b',' | b'=' | b'(' | b':' | b'+' | b'&' | b'|')
}

fn regex_may_follow(b: u8) -> bool {
    matches!(
        b,
        b'(' | b',' | b'=' | b':' | b'[' | b'!' | b'&' | b'|' | b'?' | b'{' | b'}' | b';'
    )
}

/// Whether the `/` at `i` opens a regex literal rather than dividing.
fn starts_regex(bytes: &[u8], i: usize) -> bool {
    let mut end = i;
    while end > 0 && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    let mut word = end;
    while word > 0 && (bytes[word - 1].is_ascii_alphanumeric() || matches!(bytes[word - 1], b'_' | b'$')) {
        word -= 1;
    }
    if word < end {
        return matches!(
            &bytes[word..end],
            b"return" | b"typeof" | b"case" | b"in" | b"of" | b"delete" | b"void" | b"throw"
                | b"new" | b"else" | b"do"
        );
    }
    end == 0 || regex_may_follow(bytes[end - 1])
}

fn next_significant(bytes: &[u8], mut i: usize) -> Option<u8> {
    while i < bytes.len() {
        if !bytes[i].is_ascii_whitespace() {
            return Some(bytes[i]);
        }
        i += 1;
    }
    None
}

/// Skip a quoted string starting at `i`; returns the index after the closing quote.
fn skip_quoted(bytes: &[u8], i: usize, line: &mut usize) -> Option<usize> {
    let quote = bytes[i];
    let mut j = i + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 1,
            b'\n' if quote != b'`' => return None,
            b'\n' => *line += 1,
            b if b == quote => return Some(j + 1),
            _ => {}
        }
        j += 1;
    }
    None
}

/// Skip a `/pattern/flags` literal starting at `i`.
fn skip_regex(bytes: &[u8], i: usize) -> Option<usize> {
    let mut j = i + 1;
    let mut in_class = false;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 1,
            b'\n' => return None,
            b'[' => in_class = true,
            b']' => in_class = false,
            b'/' if !in_class => {
                j += 1;
                while j < bytes.len() && bytes[j].is_ascii_alphabetic() {
                    j += 1;
                }
                return Some(j);
            }
            _ => {}
        }
        j += 1;
    }
    None
}

/// Parse one statement produced by [`split_statements`].
pub fn parse_statement(raw: &RawStatement) -> Result<Statement, ScriptError> {
    let mut parser = Parser {
        src: &raw.text,
        pos: 0,
        base_line: raw.line,
    };
    let expr = parser.statement()?;
    Ok(Statement {
        expr,
        source: raw.text.clone(),
        line: raw.line,
    })
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    base_line: usize,
}

impl<'a> Parser<'a> {
    fn bytes(&self) -> &'a [u8] {
        self.src.as_bytes()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes().get(self.pos).copied()
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        let consumed = &self.src[..self.pos.min(self.src.len())];
        ScriptError {
            message: message.into(),
            line: self.base_line + consumed.matches('\n').count(),
            excerpt: excerpt(&self.src[self.pos.min(self.src.len())..]),
        }
    }

    fn skip_ws(&mut self) {
        let bytes = self.bytes();
        while self.pos < bytes.len() {
            match bytes[self.pos] {
                b if b.is_ascii_whitespace() => self.pos += 1,
                b'/' if bytes.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < bytes.len() && bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if bytes.get(self.pos + 1) == Some(&b'*') => {
                    self.pos += 2;
                    while self.pos < bytes.len()
                        && !(bytes[self.pos] == b'*' && bytes.get(self.pos + 1) == Some(&b'/'))
                    {
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(bytes.len());
                }
                _ => break,
            }
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        self.skip_ws();
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), ScriptError> {
        if self.eat(b) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", b as char)))
        }
    }

    fn ident(&mut self) -> Option<&'a str> {
        self.skip_ws();
        let bytes = self.bytes();
        let start = self.pos;
        let first = *bytes.get(start)?;
        if !(first.is_ascii_alphabetic() || first == b'_' || first == b'$') {
            return None;
        }
        let mut end = start + 1;
        while end < bytes.len()
            && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_' || bytes[end] == b'$')
        {
            end += 1;
        }
        self.pos = end;
        let src = self.src;
        Some(&src[start..end])
    }

    fn statement(&mut self) -> Result<Expr, ScriptError> {
        let head = self
            .ident()
            .ok_or_else(|| self.error("expected an identifier"))?;

        if head == "use" {
            self.skip_ws();
            if self.peek().is_some_and(|b| b.is_ascii_alphabetic() || b == b'_') {
                return Err(self.error(
                    "`use <database>` is not supported; fixtures run against the configured database",
                ));
            }
        }

        let expr = if matches!(head, "var" | "let" | "const") {
            let name = self
                .ident()
                .ok_or_else(|| self.error("expected a variable name"))?
                .to_string();
            self.expect(b'=')?;
            let value = self.value()?;
            Expr::Bind { name, value }
        } else {
            self.chain(head.to_string())?
        };

        self.eat(b';');
        self.skip_ws();
        if self.pos < self.src.len() {
            return Err(self.error("unexpected input after statement"));
        }
        Ok(expr)
    }

    fn chain(&mut self, root: String) -> Result<Expr, ScriptError> {
        let mut steps = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'.') => {
                    self.pos += 1;
                    let name = self
                        .ident()
                        .ok_or_else(|| self.error("expected a property name after '.'"))?;
                    steps.push(Step::Property(name.to_string()));
                }
                Some(b'[') => {
                    self.pos += 1;
                    let name = match self.value()? {
                        Value::String(s) => s,
                        _ => return Err(self.error("expected a string inside '[...]'")),
                    };
                    self.expect(b']')?;
                    steps.push(Step::Property(name));
                }
                Some(b'(') => {
                    let method = match steps.pop() {
                        Some(Step::Property(name)) => name,
                        _ => return Err(self.error(format!("cannot call `{root}` directly"))),
                    };
                    let args = self.arguments()?;
                    steps.push(Step::Call { method, args });
                }
                _ => break,
            }
        }
        if !steps.iter().any(|s| matches!(s, Step::Call { .. })) {
            return Err(self.error("statement is not a method call"));
        }
        Ok(Expr::Chain { root, steps })
    }

    fn arguments(&mut self) -> Result<Vec<Value>, ScriptError> {
        self.expect(b'(')?;
        let mut args = Vec::new();
        loop {
            if self.eat(b')') {
                return Ok(args);
            }
            args.push(self.value()?);
            if !self.eat(b',') {
                self.expect(b')')?;
                return Ok(args);
            }
        }
    }

    fn value(&mut self) -> Result<Value, ScriptError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("expected a value")),
            Some(b'{') => self.object(),
            Some(b'[') => self.array(),
            Some(b'"' | b'\'' | b'`') => Ok(Value::String(self.string()?)),
            Some(b'/') => self.regex(),
            Some(b) if b == b'-' || b == b'+' || b == b'.' || b.is_ascii_digit() => self.number(),
            Some(_) => {
                let start = self.pos;
                let word = self.ident().ok_or_else(|| self.error("unexpected character"))?;
                match word {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "null" | "undefined" => Ok(Value::Null),
                    "NaN" => Ok(Value::Double(f64::NAN)),
                    "Infinity" => Ok(Value::Double(f64::INFINITY)),
                    "function" => self.function(start),
                    "new" => {
                        let name = self
                            .ident()
                            .ok_or_else(|| self.error("expected a constructor after `new`"))?;
                        self.constructor(name)
                    }
                    "ObjectId" | "ISODate" | "Date" | "NumberInt" | "NumberLong" => {
                        self.constructor(word)
                    }
                    _ => {
                        self.skip_ws();
                        if matches!(self.peek(), Some(b'.' | b'(')) {
                            return Err(self.error(format!("unsupported expression `{word}`")));
                        }
                        Ok(Value::Ident(word.to_string()))
                    }
                }
            }
        }
    }

    fn object(&mut self) -> Result<Value, ScriptError> {
        self.expect(b'{')?;
        let mut fields = Vec::new();
        loop {
            if self.eat(b'}') {
                return Ok(Value::Object(fields));
            }
            self.skip_ws();
            let key = match self.peek() {
                Some(b'"' | b'\'') => self.string()?,
                Some(b) if b.is_ascii_digit() => match self.number()? {
                    Value::Int(n) | Value::Long(n) => n.to_string(),
                    Value::Double(f) => f.to_string(),
                    _ => return Err(self.error("invalid object key")),
                },
                _ => self
                    .ident()
                    .ok_or_else(|| self.error("expected an object key"))?
                    .to_string(),
            };
            self.expect(b':')?;
            let value = self.value()?;
            fields.push((key, value));
            if !self.eat(b',') {
                self.expect(b'}')?;
                return Ok(Value::Object(fields));
            }
        }
    }

    fn array(&mut self) -> Result<Value, ScriptError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        loop {
            if self.eat(b']') {
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            if !self.eat(b',') {
                self.expect(b']')?;
                return Ok(Value::Array(items));
            }
        }
    }

    fn string(&mut self) -> Result<String, ScriptError> {
        self.skip_ws();
        let quote = self.peek().ok_or_else(|| self.error("expected a string"))? as char;
        let src = self.src;
        let mut out = String::new();
        let mut chars = src[self.pos + 1..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '\\' => {
                    let (_, escaped) = chars
                        .next()
                        .ok_or_else(|| self.error("unterminated string literal"))?;
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'b' => out.push('\u{8}'),
                        'f' => out.push('\u{c}'),
                        '0' => out.push('\0'),
                        'u' => {
                            let hex: String = chars.by_ref().take(4).map(|(_, c)| c).collect();
                            let code = u32::from_str_radix(&hex, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("invalid \\u escape"))?;
                            out.push(code);
                        }
                        'x' => {
                            let hex: String = chars.by_ref().take(2).map(|(_, c)| c).collect();
                            let code = u32::from_str_radix(&hex, 16)
                                .ok()
                                .and_then(char::from_u32)
                                .ok_or_else(|| self.error("invalid \\x escape"))?;
                            out.push(code);
                        }
                        '\n' => {}
                        other => out.push(other),
                    }
                }
                c if c == quote => {
                    self.pos += 1 + offset + c.len_utf8();
                    return Ok(out);
                }
                c => out.push(c),
            }
        }
        Err(self.error("unterminated string literal"))
    }

    fn number(&mut self) -> Result<Value, ScriptError> {
        self.skip_ws();
        let bytes = self.bytes();
        let start = self.pos;
        let mut end = start;
        if matches!(bytes.get(end), Some(b'-' | b'+')) {
            end += 1;
        }
        let digits_start = end;
        if bytes.get(end) == Some(&b'0') && matches!(bytes.get(end + 1), Some(b'x' | b'X')) {
            end += 2;
            let hex_start = end;
            while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
                end += 1;
            }
            let n = i64::from_str_radix(&self.src[hex_start..end], 16)
                .map_err(|_| self.error("invalid hexadecimal literal"))?;
            self.pos = end;
            let negative = bytes[start] == b'-';
            return Ok(Value::Int(if negative { -n } else { n }));
        }
        let mut fractional = false;
        while end < bytes.len() {
            match bytes[end] {
                b'0'..=b'9' => {}
                b'.' => fractional = true,
                b'e' | b'E' => {
                    fractional = true;
                    if matches!(bytes.get(end + 1), Some(b'-' | b'+')) {
                        end += 1;
                    }
                }
                _ => break,
            }
            end += 1;
        }
        if end == digits_start {
            return Err(self.error("expected a number"));
        }
        let text = &self.src[start..end];
        self.pos = end;
        if !fractional && let Ok(n) = text.parse::<i64>() {
            return Ok(Value::Int(n));
        }
        text.parse::<f64>()
            .map(Value::Double)
            .map_err(|_| self.error(format!("invalid number `{text}`")))
    }

    fn regex(&mut self) -> Result<Value, ScriptError> {
        let start = self.pos;
        let end = skip_regex(self.bytes(), start)
            .ok_or_else(|| self.error("unterminated regular expression"))?;
        let literal = &self.src[start + 1..end];
        let close = literal.rfind('/').unwrap_or(literal.len());
        self.pos = end;
        let mut flags: Vec<char> = literal[close + 1..].chars().collect();
        flags.sort_unstable();
        Ok(Value::Regex {
            pattern: literal[..close].to_string(),
            flags: flags.into_iter().collect(),
        })
    }

    /// Capture `function name?(params) { body }` verbatim, starting at `start`.
    fn function(&mut self, start: usize) -> Result<Value, ScriptError> {
        let bytes = self.bytes();
        let mut i = self.pos;
        while i < bytes.len() && bytes[i] != b'{' {
            i += 1;
        }
        let mut depth = 0usize;
        let mut line = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos = i + 1;
                        return Ok(Value::Function(self.src[start..=i].to_string()));
                    }
                }
                b'"' | b'\'' | b'`' => {
                    i = skip_quoted(bytes, i, &mut line)
                        .ok_or_else(|| self.error("unterminated string in function body"))?;
                    continue;
                }
                b'/' if bytes.get(i + 1) == Some(&b'/') => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                    continue;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    let close = self.src[i + 2..]
                        .find("*/")
                        .ok_or_else(|| self.error("unterminated comment in function body"))?;
                    i += close + 4;
                    continue;
                }
                b'/' if starts_regex(bytes, i) => {
                    i = skip_regex(bytes, i)
                        .ok_or_else(|| self.error("unterminated regular expression in function body"))?;
                    continue;
                }
                _ => {}
            }
            i += 1;
        }
        Err(self.error("unterminated function literal"))
    }

    fn constructor(&mut self, name: &str) -> Result<Value, ScriptError> {
        self.skip_ws();
        let args = if self.peek() == Some(b'(') {
            self.arguments()?
        } else {
            Vec::new()
        };
        let mut args = args.into_iter();
        let first = args.next();
        if args.next().is_some() {
            return Err(self.error(format!("`{name}` takes at most one argument")));
        }
        match (name, first) {
            ("ObjectId", None) => Ok(Value::ObjectId(None)),
            ("ObjectId", Some(Value::String(hex))) => Ok(Value::ObjectId(Some(hex))),
            ("Date" | "ISODate", None) => Ok(Value::Date(DateArg::Now)),
            ("Date" | "ISODate", Some(Value::String(text))) => Ok(Value::Date(DateArg::Text(text))),
            ("Date", Some(Value::Int(ms))) => Ok(Value::Date(DateArg::Millis(ms))),
            ("NumberInt", Some(Value::Int(n))) => Ok(Value::Int(n)),
            ("NumberInt", Some(Value::String(s))) => s
                .trim()
                .parse::<i32>()
                .map(|n| Value::Int(n.into()))
                .map_err(|_| self.error(format!("invalid NumberInt `{s}`"))),
            ("NumberLong", Some(Value::Int(n))) => Ok(Value::Long(n)),
            ("NumberLong", Some(Value::String(s))) => s
                .trim()
                .parse::<i64>()
                .map(Value::Long)
                .map_err(|_| self.error(format!("invalid NumberLong `{s}`"))),
            (name, _) => Err(self.error(format!("unsupported arguments for `{name}`"))),
        }
    }
}
