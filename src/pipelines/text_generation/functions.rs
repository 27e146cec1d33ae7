//! Function definitions offered to the model and the calls it answers with.
//!
//! Gorilla OpenFunctions replies to a `<<function>>` prompt with Python call
//! syntax, e.g. `get_weather(city="Paris", days=3), convert(1.5, to=['EUR'])`,
//! optionally prefixed by `<<function>>`. [`parse_function_calls`] turns that
//! into structured [`FunctionCall`]s with JSON arguments.

use crate::core::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

const FUNCTION_MARKER: &str = "<<function>>";

/// A function the model may decide to call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

impl Function {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A call emitted by the model. Positional arguments are keyed `arg0`, `arg1`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Output of a function-calling completion.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCompletion {
    /// The raw reply.
    pub text: String,
    /// Calls parsed from the reply; empty when the model answered in prose.
    pub calls: Vec<FunctionCall>,
}

/// Parse every call in a model reply.
///
/// A reply that does not start with `name(` is prose and yields no calls, and
/// prose after the last call ends the list. A segment that starts like a call
/// but does not parse is an error.
pub fn parse_function_calls(text: &str) -> anyhow::Result<Vec<FunctionCall>> {
    let mut parser = CallParser::new(text);
    let mut calls = Vec::new();
    loop {
        parser.skip_separators();
        if parser.at_end() || !parser.looks_like_call() {
            break;
        }
        calls.push(parser.call()?);
    }
    Ok(calls)
}

struct CallParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> CallParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> anyhow::Error {
        PipelineError::FunctionCallParse {
            position: self.pos,
            reason: reason.into(),
        }
        .into()
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

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    /// Whitespace, commas, semicolons and the `<<function>>` marker between calls.
    fn skip_separators(&mut self) {
        loop {
            self.skip_whitespace();
            if self.rest().starts_with(FUNCTION_MARKER) {
                self.pos += FUNCTION_MARKER.len();
            } else if matches!(self.peek(), Some(',') | Some(';')) {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, expected: char) -> anyhow::Result<()> {
        self.skip_whitespace();
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(format!("expected '{expected}', found '{c}'"))),
            None => Err(self.error(format!("expected '{expected}', found end of input"))),
        }
    }

    fn looks_like_call(&self) -> bool {
        let mut lookahead = CallParser {
            src: self.src,
            pos: self.pos,
        };
        lookahead.dotted_identifier().is_some() && lookahead.peek() == Some('(')
    }

    fn identifier(&mut self) -> Option<&'a str> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_alphabetic() || c == '_' => {
                self.bump();
            }
            _ => return None,
        }
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.bump();
        }
        Some(&self.src[start..self.pos])
    }

    fn dotted_identifier(&mut self) -> Option<&'a str> {
        let start = self.pos;
        self.identifier()?;
        while self.peek() == Some('.') {
            let before_dot = self.pos;
            self.bump();
            if self.identifier().is_none() {
                self.pos = before_dot;
                break;
            }
        }
        Some(&self.src[start..self.pos])
    }

    fn call(&mut self) -> anyhow::Result<FunctionCall> {
        let name = self
            .dotted_identifier()
            .ok_or_else(|| self.error("expected a function name"))?
            .to_string();
        self.expect('(')?;

        let mut arguments = Map::new();
        let mut positional = 0;
        loop {
            self.skip_whitespace();
            if self.peek() == Some(')') {
                self.bump();
                break;
            }

            let checkpoint = self.pos;
            let keyword = match self.identifier() {
                Some(key) => {
                    self.skip_whitespace();
                    if self.peek() == Some('=') && !self.rest().starts_with("==") {
                        self.bump();
                        Some(key.to_string())
                    } else {
                        self.pos = checkpoint;
                        None
                    }
                }
                None => None,
            };

            let value = self.value()?;
            let key = keyword.unwrap_or_else(|| {
                let key = format!("arg{positional}");
                positional += 1;
                key
            });
            arguments.insert(key, value);

            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some(')') => break,
                Some(c) => return Err(self.error(format!("unexpected '{c}' in argument list"))),
                None => return Err(self.error("unterminated argument list")),
            }
        }

        Ok(FunctionCall { name, arguments })
    }

    fn value(&mut self) -> anyhow::Result<Value> {
        self.skip_whitespace();
        match self.peek() {
            Some('"') | Some('\'') => self.string().map(Value::String),
            Some('[') => self.sequence('[', ']'),
            Some('(') => self.sequence('(', ')'),
            Some('{') => self.dict(),
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_alphabetic() || c == '_' => {
                let word = self
                    .dotted_identifier()
                    .ok_or_else(|| self.error("expected a value"))?;
                Ok(match word {
                    "True" | "true" => Value::Bool(true),
                    "False" | "false" => Value::Bool(false),
                    "None" | "null" => Value::Null,
                    other => Value::String(other.to_string()),
                })
            }
            Some(c) => Err(self.error(format!("unexpected '{c}' where a value was expected"))),
            None => Err(self.error("expected a value, found end of input")),
        }
    }

    fn string(&mut self) -> anyhow::Result<String> {
        let quote = self.bump().ok_or_else(|| self.error("expected a string"))?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string literal")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape sequence")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> anyhow::Result<Value> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.bump();
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '_'))
        {
            let c = self.bump();
            if matches!(c, Some('e') | Some('E')) && matches!(self.peek(), Some('-') | Some('+')) {
                self.bump();
            }
        }
        let literal = self.src[start..self.pos].replace('_', "");

        if let Ok(int) = literal.parse::<i64>() {
            return Ok(Value::Number(int.into()));
        }
        literal
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| self.error(format!("invalid number '{literal}'")))
    }

    fn sequence(&mut self, open: char, close: char) -> anyhow::Result<Value> {
        self.expect(open)?;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some(c) if c == close => return Ok(Value::Array(items)),
                Some(c) => return Err(self.error(format!("unexpected '{c}' in sequence"))),
                None => return Err(self.error(format!("missing closing '{close}'"))),
            }
        }
    }

    fn dict(&mut self) -> anyhow::Result<Value> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(s) => s,
                other => other.to_string(),
            };
            self.expect(':')?;
            let value = self.value()?;
            map.insert(key, value);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Value::Object(map)),
                Some(c) => return Err(self.error(format!("unexpected '{c}' in dict"))),
                None => return Err(self.error("missing closing '}'")),
            }
        }
    }
}
