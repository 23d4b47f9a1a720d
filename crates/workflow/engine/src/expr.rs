//! Boolean expressions for `when` guards and hook conditions
//!
//! Evaluation is a pure function of the expression and a flat variable
//! environment. The built-in evaluator understands `&&`, `||`, `!`,
//! parentheses and the comparisons `== != < <= > >=`. Bare words resolve
//! against the environment and otherwise stand for themselves, so a guard
//! that was already substituted (`heads == heads`) evaluates the same way
//! as one that names variables (`steps.flip.outputs.result == heads`).

use crate::substitute::Params;
use crate::{EngineError, EngineResult};

/// Evaluates guard expressions
pub trait ExpressionEvaluator: Send + Sync {
    fn eval_bool(&self, expression: &str, env: &Params) -> EngineResult<bool>;
}

/// Built-in evaluator
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleEvaluator;

impl ExpressionEvaluator for SimpleEvaluator {
    fn eval_bool(&self, expression: &str, env: &Params) -> EngineResult<bool> {
        let fail = |reason: String| EngineError::Expression {
            expression: expression.to_string(),
            reason,
        };
        let tokens = tokenize(expression).map_err(fail)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            env,
        };
        let value = parser.or().map_err(fail)?;
        if parser.pos != tokens.len() {
            return Err(fail(format!("unexpected token at position {}", parser.pos)));
        }
        value.truthy().map_err(fail)
    }
}

// ── Tokens ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Op(&'static str),
    Open,
    Close,
}

const OPERATORS: [&str; 9] = ["&&", "||", "==", "!=", "<=", ">=", "<", ">", "!"];

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' || c == ')' {
            tokens.push(if c == '(' { Token::Open } else { Token::Close });
            i += 1;
            continue;
        }
        if c == '"' || c == '\'' {
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|&ch| ch == c)
                .map(|p| start + p)
                .ok_or_else(|| "unterminated string".to_string())?;
            tokens.push(Token::Quoted(chars[start..end].iter().collect()));
            i = end + 1;
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        if let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            tokens.push(Token::Op(*op));
            i += op.len();
            continue;
        }
        let start = i;
        while i < chars.len()
            && !chars[i].is_whitespace()
            && !"()<>=!&|\"'".contains(chars[i])
        {
            i += 1;
        }
        if start == i {
            return Err(format!("unexpected character '{}'", c));
        }
        tokens.push(Token::Word(chars[start..i].iter().collect()));
    }
    Ok(tokens)
}

// ── Parser ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Value {
    Bool(bool),
    Text(String),
}

impl Value {
    fn truthy(&self) -> Result<bool, String> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Text(t) => match t.as_str() {
                "true" => Ok(true),
                "false" | "" => Ok(false),
                other => Err(format!("'{}' is not a boolean", other)),
            },
        }
    }

    fn text(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Text(t) => t.clone(),
        }
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    env: &'a Params,
}

impl Parser<'_> {
    fn peek_op(&self, op: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Op(o)) if *o == op)
    }

    fn or(&mut self) -> Result<Value, String> {
        let mut left = self.and()?;
        while self.peek_op("||") {
            self.pos += 1;
            let right = self.and()?;
            left = Value::Bool(left.truthy()? || right.truthy()?);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value, String> {
        let mut left = self.unary()?;
        while self.peek_op("&&") {
            self.pos += 1;
            let right = self.unary()?;
            left = Value::Bool(left.truthy()? && right.truthy()?);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, String> {
        if self.peek_op("!") {
            self.pos += 1;
            let inner = self.unary()?;
            return Ok(Value::Bool(!inner.truthy()?));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, String> {
        let left = self.atom()?;
        let op = match self.tokens.get(self.pos) {
            Some(Token::Op(op)) if matches!(*op, "==" | "!=" | "<" | "<=" | ">" | ">=") => *op,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.atom()?;
        let (l, r) = (left.text(), right.text());
        let result = match op {
            "==" => l == r,
            "!=" => l != r,
            _ => {
                let (a, b) = match (l.parse::<f64>(), r.parse::<f64>()) {
                    (Ok(a), Ok(b)) => (a, b),
                    _ => return Err(format!("cannot compare '{}' {} '{}'", l, op, r)),
                };
                match op {
                    "<" => a < b,
                    "<=" => a <= b,
                    ">" => a > b,
                    _ => a >= b,
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn atom(&mut self) -> Result<Value, String> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;
        match token {
            Token::Open => {
                let inner = self.or()?;
                if self.tokens.get(self.pos) != Some(&Token::Close) {
                    return Err("missing ')'".to_string());
                }
                self.pos += 1;
                Ok(inner)
            }
            Token::Quoted(text) => Ok(Value::Text(text)),
            Token::Word(word) => Ok(Value::Text(
                self.env.get(&word).cloned().unwrap_or(word),
            )),
            Token::Close | Token::Op(_) => Err(format!("unexpected token {:?}", token)),
        }
    }
}
