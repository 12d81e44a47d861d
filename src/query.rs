//! A small jq-compatible query language used by datasets to pull values out
//! of API responses.
//!
//! Supported: identity `.`, field access (`.a`, `."a b"`, `.["a b"]`), array
//! indexing (`.[0]`, `.[-1]`), iteration (`.[]`), pipes, parentheses, object
//! construction (`{a: .x, "b c": .y, d}`) and scalar literals. Every
//! expression produces a stream of values; object construction takes the
//! cartesian product of its field streams, as jq does.

use serde_json::{Map, Value};

use crate::error::AnnotatorError;

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    root: Pipeline,
}

#[derive(Debug, Clone, PartialEq)]
struct Pipeline(Vec<Term>);

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Path(Vec<Step>),
    Object(Vec<(String, Pipeline)>),
    Literal(Value),
    Group(Pipeline),
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Field(String),
    Index(i64),
    Iterate,
}

impl Query {
    pub fn parse(source: &str) -> Result<Self, AnnotatorError> {
        let mut parser = Parser::new(source);
        let root = parser.pipeline()?;
        parser.skip_ws();
        if parser.peek().is_some() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self { root })
    }

    pub fn evaluate(&self, input: &Value) -> Result<Vec<Value>, AnnotatorError> {
        self.root.evaluate(input)
    }
}

impl Pipeline {
    fn evaluate(&self, input: &Value) -> Result<Vec<Value>, AnnotatorError> {
        let mut current = vec![input.clone()];
        for term in &self.0 {
            let mut next = Vec::new();
            for value in &current {
                next.extend(term.evaluate(value)?);
            }
            current = next;
        }
        Ok(current)
    }
}

impl Term {
    fn evaluate(&self, input: &Value) -> Result<Vec<Value>, AnnotatorError> {
        match self {
            Term::Path(steps) => {
                let mut current = vec![input.clone()];
                for step in steps {
                    let mut next = Vec::new();
                    for value in &current {
                        next.extend(step.apply(value)?);
                    }
                    current = next;
                }
                Ok(current)
            }
            Term::Object(fields) => {
                let mut objects = vec![Map::new()];
                for (key, pipeline) in fields {
                    let values = pipeline.evaluate(input)?;
                    let mut expanded = Vec::with_capacity(objects.len() * values.len());
                    for object in &objects {
                        for value in &values {
                            let mut object = object.clone();
                            object.insert(key.clone(), value.clone());
                            expanded.push(object);
                        }
                    }
                    objects = expanded;
                }
                Ok(objects.into_iter().map(Value::Object).collect())
            }
            Term::Literal(value) => Ok(vec![value.clone()]),
            Term::Group(pipeline) => pipeline.evaluate(input),
        }
    }
}

impl Step {
    fn apply(&self, value: &Value) -> Result<Vec<Value>, AnnotatorError> {
        match (self, value) {
            (Step::Field(name), Value::Object(map)) => {
                Ok(vec![map.get(name).cloned().unwrap_or(Value::Null)])
            }
            (Step::Field(_) | Step::Index(_), Value::Null) => Ok(vec![Value::Null]),
            (Step::Index(index), Value::Array(items)) => {
                let position = if *index < 0 {
                    items.len() as i64 + index
                } else {
                    *index
                };
                let item = usize::try_from(position)
                    .ok()
                    .and_then(|position| items.get(position))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(vec![item])
            }
            (Step::Iterate, Value::Array(items)) => Ok(items.clone()),
            (Step::Iterate, Value::Object(map)) => Ok(map.values().cloned().collect()),
            (Step::Field(name), other) => Err(AnnotatorError::QueryEval(format!(
                "cannot index {} with \"{name}\"",
                type_name(other)
            ))),
            (Step::Index(index), other) => Err(AnnotatorError::QueryEval(format!(
                "cannot index {} with number {index}",
                type_name(other)
            ))),
            (Step::Iterate, other) => Err(AnnotatorError::QueryEval(format!(
                "cannot iterate over {}",
                type_name(other)
            ))),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: &str) -> AnnotatorError {
        AnnotatorError::QueryParse {
            query: self.source.to_string(),
            message: format!("{message} at offset {}", self.pos),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn pipeline(&mut self) -> Result<Pipeline, AnnotatorError> {
        let mut terms = vec![self.term()?];
        while self.eat('|') {
            terms.push(self.term()?);
        }
        Ok(Pipeline(terms))
    }

    fn term(&mut self) -> Result<Term, AnnotatorError> {
        self.skip_ws();
        match self.peek() {
            Some('.') => self.path().map(Term::Path),
            Some('{') => self.object(),
            Some('(') => {
                self.pos += 1;
                let inner = self.pipeline()?;
                if !self.eat(')') {
                    return Err(self.error("expected `)`"));
                }
                Ok(Term::Group(inner))
            }
            Some('"') => Ok(Term::Literal(Value::String(self.string()?))),
            Some(ch) if ch == '-' || ch.is_ascii_digit() => self.number().map(Term::Literal),
            Some(ch) if is_ident_start(ch) => match self.ident().as_str() {
                "null" => Ok(Term::Literal(Value::Null)),
                "true" => Ok(Term::Literal(Value::Bool(true))),
                "false" => Ok(Term::Literal(Value::Bool(false))),
                other => Err(self.error(&format!("unknown keyword `{other}`"))),
            },
            Some(ch) => Err(self.error(&format!("unexpected character `{ch}`"))),
            None => Err(self.error("unexpected end of query")),
        }
    }

    fn path(&mut self) -> Result<Vec<Step>, AnnotatorError> {
        let mut steps = Vec::new();
        self.pos += 1;
        match self.peek() {
            Some('"') => steps.push(Step::Field(self.string()?)),
            Some(ch) if is_ident_start(ch) => steps.push(Step::Field(self.ident())),
            _ => {}
        }
        loop {
            match self.peek() {
                Some('[') => steps.push(self.bracket()?),
                Some('.') => {
                    let next = self.chars.get(self.pos + 1).copied();
                    match next {
                        Some('"') => {
                            self.pos += 1;
                            steps.push(Step::Field(self.string()?));
                        }
                        Some('[') => self.pos += 1,
                        Some(ch) if is_ident_start(ch) => {
                            self.pos += 1;
                            steps.push(Step::Field(self.ident()));
                        }
                        _ => break,
                    }
                }
                _ => break,
            }
        }
        Ok(steps)
    }

    fn bracket(&mut self) -> Result<Step, AnnotatorError> {
        self.pos += 1;
        self.skip_ws();
        let step = match self.peek() {
            Some(']') => Step::Iterate,
            Some('"') => Step::Field(self.string()?),
            Some(ch) if ch == '-' || ch.is_ascii_digit() => Step::Index(self.integer()?),
            _ => return Err(self.error("expected `]`, a string or an integer")),
        };
        if !self.eat(']') {
            return Err(self.error("expected `]`"));
        }
        Ok(step)
    }

    fn object(&mut self) -> Result<Term, AnnotatorError> {
        self.pos += 1;
        let mut fields = Vec::new();
        if self.eat('}') {
            return Ok(Term::Object(fields));
        }
        loop {
            self.skip_ws();
            let key = match self.peek() {
                Some('"') => self.string()?,
                Some(ch) if is_ident_start(ch) => self.ident(),
                _ => return Err(self.error("expected object key")),
            };
            let value = if self.eat(':') {
                self.pipeline()?
            } else {
                Pipeline(vec![Term::Path(vec![Step::Field(key.clone())])])
            };
            fields.push((key, value));
            if self.eat(',') {
                continue;
            }
            if self.eat('}') {
                break;
            }
            return Err(self.error("expected `,` or `}`"));
        }
        Ok(Term::Object(fields))
    }

    fn string(&mut self) -> Result<String, AnnotatorError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some('\\') => {
                    self.pos += 1;
                    let escaped = match self.peek() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some(ch) => ch,
                        None => return Err(self.error("unterminated escape")),
                    };
                    out.push(escaped);
                    self.pos += 1;
                }
                Some(ch) => {
                    out.push(ch);
                    self.pos += 1;
                }
            }
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn digits(&mut self) -> String {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self
            .peek()
            .is_some_and(|ch| ch.is_ascii_digit() || ch == '.')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn integer(&mut self) -> Result<i64, AnnotatorError> {
        let text = self.digits();
        text.parse()
            .map_err(|_| self.error(&format!("invalid index `{text}`")))
    }

    fn number(&mut self) -> Result<Value, AnnotatorError> {
        let text = self.digits();
        match serde_json::from_str::<Value>(&text) {
            Ok(value @ Value::Number(_)) => Ok(value),
            _ => Err(self.error(&format!("invalid number `{text}`"))),
        }
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}
