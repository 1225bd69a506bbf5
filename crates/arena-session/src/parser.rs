use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

const ACTION_PREFIX: &str = "action:";
const FENCE: &str = "```";
const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty action")]
    Empty,
    #[error("expected an api call such as submit(...), got '{0}'")]
    NotACall(String),
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
}

/// Structured form of a free-text action.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAction {
    pub api_name: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl ParsedAction {
    pub fn is_submit(&self) -> bool {
        self.api_name == "submit"
    }

    /// The submission payload: first positional argument, if any.
    pub fn solution(&self) -> Option<&Value> {
        self.args.first()
    }
}

/// Turns agent output into a [`ParsedAction`].
///
/// Accepts an optional `Action:` prefix and, when present, reads the first
/// fenced code block. Arguments use Python literal syntax.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmissionParser;

impl SubmissionParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, raw: &str) -> Result<ParsedAction, ParseError> {
        let body = extract_call_text(raw);
        if body.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut cursor = Cursor::new(body);
        let api_name = cursor.identifier();
        if api_name.is_empty() {
            return Err(ParseError::NotACall(first_line(body)));
        }
        cursor.skip_ws();
        if !cursor.eat('(') {
            return Err(ParseError::NotACall(first_line(body)));
        }
        let (args, kwargs) = cursor.call_arguments()?;
        cursor.skip_ws();
        if !cursor.at_end() {
            return Err(cursor.error("unexpected text after the closing parenthesis"));
        }
        Ok(ParsedAction {
            api_name,
            args,
            kwargs,
        })
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().trim().to_string()
}

fn extract_call_text(raw: &str) -> &str {
    let mut text = raw.trim();
    if text.len() >= ACTION_PREFIX.len()
        && text.is_char_boundary(ACTION_PREFIX.len())
        && text[..ACTION_PREFIX.len()].eq_ignore_ascii_case(ACTION_PREFIX)
    {
        text = text[ACTION_PREFIX.len()..].trim_start();
    }
    let Some(start) = text.find(FENCE) else {
        return text;
    };
    let after_open = &text[start + FENCE.len()..];
    let block = match after_open.find(FENCE) {
        Some(end) => &after_open[..end],
        None => after_open,
    };
    // A bare word on the opening line is a language tag.
    match block.split_once('\n') {
        Some((tag, rest)) if is_language_tag(tag) => rest.trim(),
        _ => block.trim(),
    }
}

fn is_language_tag(tag: &str) -> bool {
    let tag = tag.trim();
    !tag.contains('(') && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            depth: 0,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::Syntax {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            let ok = if self.pos == start {
                c.is_ascii_alphabetic() || c == '_'
            } else {
                c.is_ascii_alphanumeric() || c == '_' || c == '.'
            };
            if !ok {
                break;
            }
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }

    fn call_arguments(&mut self) -> Result<(Vec<Value>, BTreeMap<String, Value>), ParseError> {
        let mut args = Vec::new();
        let mut kwargs = BTreeMap::new();
        loop {
            self.skip_ws();
            if self.eat(')') {
                return Ok((args, kwargs));
            }
            if let Some(name) = self.keyword_name() {
                let value = self.literal()?;
                if kwargs.insert(name.clone(), value).is_some() {
                    return Err(self.error(format!("keyword argument '{}' repeated", name)));
                }
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.literal()?);
            }
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            if self.eat(')') {
                return Ok((args, kwargs));
            }
            return Err(self.error("expected ',' or ')'"));
        }
    }

    /// Consumes `name =` if present; otherwise leaves the cursor untouched.
    fn keyword_name(&mut self) -> Option<String> {
        let start = self.pos;
        let name = self.identifier();
        if !name.is_empty() && !name.contains('.') {
            self.skip_ws();
            if self.peek() == Some('=') && !self.rest().starts_with("==") {
                self.bump();
                return Some(name);
            }
        }
        self.pos = start;
        None
    }

    fn literal(&mut self) -> Result<Value, ParseError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("expected a value")),
            Some('"') | Some('\'') => self.string().map(Value::String),
            Some(open @ ('[' | '(' | '{')) => {
                if self.depth >= MAX_NESTING {
                    return Err(self.error("nesting too deep"));
                }
                self.bump();
                self.depth += 1;
                let value = match open {
                    '[' => self.sequence(']').map(Value::Array),
                    '(' => self.sequence(')').map(Value::Array),
                    _ => self.brace(),
                };
                self.depth -= 1;
                value
            }
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let start = self.pos;
                match self.identifier().as_str() {
                    "True" | "true" => Ok(Value::Bool(true)),
                    "False" | "false" => Ok(Value::Bool(false)),
                    "None" | "null" => Ok(Value::Null),
                    other => {
                        self.pos = start;
                        Err(self.error(format!("unsupported name '{}'", other)))
                    }
                }
            }
            Some(c) => Err(self.error(format!("unexpected character '{}'", c))),
        }
    }

    fn sequence(&mut self, close: char) -> Result<Vec<Value>, ParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.literal()?);
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            if self.eat(close) {
                return Ok(items);
            }
            return Err(self.error(format!("expected ',' or '{}'", close)));
        }
    }

    /// `{}` is an empty dict; `{a, b}` is a set, rendered as a list.
    fn brace(&mut self) -> Result<Value, ParseError> {
        self.skip_ws();
        if self.eat('}') {
            return Ok(Value::Object(Map::new()));
        }
        let first = self.literal()?;
        self.skip_ws();
        if !self.eat(':') {
            let mut items = vec![first];
            loop {
                self.skip_ws();
                if self.eat('}') {
                    break;
                }
                if !self.eat(',') {
                    return Err(self.error("expected ',' or '}'"));
                }
                self.skip_ws();
                if self.eat('}') {
                    break;
                }
                items.push(self.literal()?);
            }
            let mut unique: Vec<Value> = Vec::with_capacity(items.len());
            for item in items {
                if !unique.contains(&item) {
                    unique.push(item);
                }
            }
            return Ok(Value::Array(unique));
        }
        let mut map = Map::new();
        let mut key = first;
        loop {
            let value = self.literal()?;
            map.insert(dict_key(key).map_err(|m| self.error(m))?, value);
            self.skip_ws();
            if self.eat('}') {
                return Ok(Value::Object(map));
            }
            if !self.eat(',') {
                return Err(self.error("expected ',' or '}'"));
            }
            self.skip_ws();
            if self.eat('}') {
                return Ok(Value::Object(map));
            }
            key = self.literal()?;
            self.skip_ws();
            if !self.eat(':') {
                return Err(self.error("expected ':' in dict"));
            }
        }
    }

    fn string(&mut self) -> Result<String, ParseError> {
        let quote = self.bump().ok_or_else(|| self.error("expected a string"))?;
        let triple: String = std::iter::repeat(quote).take(3).collect();
        let is_triple = self.rest().starts_with(&triple[1..]);
        if is_triple {
            self.pos += 2 * quote.len_utf8();
        }
        let mut out = String::new();
        loop {
            if is_triple && self.rest().starts_with(&triple) {
                self.pos += triple.len();
                return Ok(out);
            }
            let c = self
                .bump()
                .ok_or_else(|| self.error("unterminated string literal"))?;
            match c {
                c if c == quote && !is_triple => return Ok(out),
                '\\' => out.push(self.escape()?),
                '\n' if !is_triple => return Err(self.error("newline in string literal")),
                c => out.push(c),
            }
        }
    }

    fn escape(&mut self) -> Result<char, ParseError> {
        let c = self
            .bump()
            .ok_or_else(|| self.error("dangling escape in string literal"))?;
        Ok(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            'u' => {
                let hex: String = self.rest().chars().take(4).collect();
                if hex.len() != 4 {
                    return Err(self.error("truncated \\u escape"));
                }
                let code = u32::from_str_radix(&hex, 16)
                    .map_err(|_| self.error(format!("invalid \\u escape '{}'", hex)))?;
                self.pos += 4;
                char::from_u32(code).ok_or_else(|| self.error("invalid unicode scalar"))?
            }
            other => other,
        })
    }

    fn number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            let allowed = c.is_ascii_digit()
                || c == '.'
                || c == '_'
                || matches!(c, 'e' | 'E')
                || (matches!(c, '-' | '+')
                    && (self.pos == start
                        || matches!(self.src[..self.pos].chars().last(), Some('e' | 'E'))));
            if !allowed {
                break;
            }
            self.bump();
        }
        let text: String = self.src[start..self.pos].chars().filter(|c| *c != '_').collect();
        let text = text.strip_prefix('+').unwrap_or(&text);
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Value::Number(int.into()));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| ParseError::Syntax {
                offset: start,
                message: format!("invalid number '{}'", text),
            })
    }
}

fn dict_key(key: Value) -> Result<String, String> {
    match key {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(if b { "True" } else { "False" }.to_string()),
        other => Err(format!("unsupported dict key {}", other)),
    }
}
