//! Condition expressions for step guards and trigger conditions.
//!
//! Grammar:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | operand ( cmp operand )?
//! cmp     := "==" | "===" | "!=" | "!==" | "<" | "<=" | ">" | ">="
//! operand := string | number | true | false | null | path
//! ```
//!
//! Paths are dotted lookups into the [`ExecutionContext`]; a missing path
//! is `null`. Examples:
//!
//! ```text
//! severity === "critical"
//! enrich.score >= 80 && !(asset.tags.0 == 'lab')
//! event.data.confirmed
//! ```

use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

use super::context::ExecutionContext;

/// Maximum nesting of `!` and parentheses.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Errors raised while parsing or evaluating a condition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,

    #[error("unexpected character '{ch}' at position {position}")]
    UnexpectedChar { ch: char, position: usize },

    #[error("unterminated string starting at position {0}")]
    UnterminatedString(usize),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected token '{found}' at position {position}")]
    UnexpectedToken { found: String, position: usize },

    #[error("unexpected end of condition")]
    UnexpectedEnd,

    #[error("condition nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("cannot compare {left} {op} {right}")]
    TypeMismatch {
        left: String,
        op: CompareOp,
        right: String,
    },
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    StrictEq,
    Ne,
    StrictNe,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::StrictEq => "===",
            CompareOp::Ne => "!=",
            CompareOp::StrictNe => "!==",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A leaf value in an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(String),
}

impl Operand {
    fn resolve(&self, context: &ExecutionContext) -> Value {
        match self {
            Operand::Literal(value) => value.clone(),
            Operand::Path(path) => context.get(path).cloned().unwrap_or(Value::Null),
        }
    }
}

/// Parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    /// Bare operand, tested for truthiness.
    Truthy(Operand),
}

impl Expr {
    /// Evaluates the expression. `||` and `&&` short-circuit.
    pub fn evaluate(&self, context: &ExecutionContext) -> Result<bool, ConditionError> {
        match self {
            Expr::Or(terms) => {
                for term in terms {
                    if term.evaluate(context)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::And(terms) => {
                for term in terms {
                    if !term.evaluate(context)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Not(inner) => Ok(!inner.evaluate(context)?),
            Expr::Compare { left, op, right } => {
                compare(&left.resolve(context), *op, &right.resolve(context))
            }
            Expr::Truthy(operand) => Ok(is_truthy(&operand.resolve(context))),
        }
    }
}

/// Parses `expr` without evaluating it.
pub fn parse(expr: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(expr)?;
    if tokens.is_empty() {
        return Err(ConditionError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let parsed = parser.parse_or()?;
    match parser.peek() {
        None => Ok(parsed),
        Some((position, token)) => Err(ConditionError::UnexpectedToken {
            found: token.to_string(),
            position: *position,
        }),
    }
}

/// Evaluates condition strings against an execution context.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluates `expr`; any parse or evaluation error yields `false`.
    pub fn evaluate(expr: &str, context: &ExecutionContext) -> bool {
        Self::try_evaluate(expr, context).unwrap_or(false)
    }

    /// Evaluates `expr`, surfacing errors.
    pub fn try_evaluate(expr: &str, context: &ExecutionContext) -> Result<bool, ConditionError> {
        parse(expr)?.evaluate(context)
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, ConditionError> {
    match op {
        CompareOp::Eq => Ok(loose_eq(left, right)),
        CompareOp::StrictEq => Ok(strict_eq(left, right)),
        CompareOp::Ne => Ok(!loose_eq(left, right)),
        CompareOp::StrictNe => Ok(!strict_eq(left, right)),
        CompareOp::Lt => order(left, op, right).map(Ordering::is_lt),
        CompareOp::Lte => order(left, op, right).map(Ordering::is_le),
        CompareOp::Gt => order(left, op, right).map(Ordering::is_gt),
        CompareOp::Gte => order(left, op, right).map(Ordering::is_ge),
    }
}

/// JSON equality, except that a number and a numeric string compare by
/// value.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => a == b,
            _ => left == right,
        },
        _ => left == right,
    }
}

/// JSON equality without coercion. Numbers still compare by value, so
/// `87 === 87.0`.
fn strict_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => left == right,
    }
}

fn order(left: &Value, op: CompareOp, right: &Value) -> Result<Ordering, ConditionError> {
    if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
        if let Some(ordering) = a.partial_cmp(&b) {
            return Ok(ordering);
        }
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ConditionError::TypeMismatch {
            left: type_name(left).to_string(),
            op,
            right: type_name(right).to_string(),
        }),
    }
}

/// Numbers, and strings that parse as numbers.
fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Cmp(CompareOp),
    Str(String),
    Num(Value),
    True,
    False,
    Null,
    Path(String),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Not => f.write_str("!"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Cmp(op) => f.write_str(op.as_str()),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Num(n) => write!(f, "{}", n),
            Token::True => f.write_str("true"),
            Token::False => f.write_str("false"),
            Token::Null => f.write_str("null"),
            Token::Path(p) => f.write_str(p),
        }
    }
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let next = chars.get(i + 1).copied();
        let next2 = chars.get(i + 2).copied();

        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => {
                i += 1;
                Token::LParen
            }
            ')' => {
                i += 1;
                Token::RParen
            }
            '&' if next == Some('&') => {
                i += 2;
                Token::And
            }
            '|' if next == Some('|') => {
                i += 2;
                Token::Or
            }
            '=' if next == Some('=') => {
                if next2 == Some('=') {
                    i += 3;
                    Token::Cmp(CompareOp::StrictEq)
                } else {
                    i += 2;
                    Token::Cmp(CompareOp::Eq)
                }
            }
            '!' if next == Some('=') => {
                if next2 == Some('=') {
                    i += 3;
                    Token::Cmp(CompareOp::StrictNe)
                } else {
                    i += 2;
                    Token::Cmp(CompareOp::Ne)
                }
            }
            '!' => {
                i += 1;
                Token::Not
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                i += if or_equal { 2 } else { 1 };
                Token::Cmp(match (c, or_equal) {
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Lte,
                    ('>', false) => CompareOp::Gt,
                    _ => CompareOp::Gte,
                })
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ConditionError::UnterminatedString(start)),
                        Some('\\') if chars.get(i + 1).is_some() => {
                            value.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                Token::Str(value)
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                Token::Num(parse_number(&text)?)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while i < chars.len() && is_path_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => {
                        if word.ends_with('.') || word.contains("..") {
                            return Err(ConditionError::UnexpectedToken {
                                found: word,
                                position: start,
                            });
                        }
                        Token::Path(word)
                    }
                }
            }
            other => {
                return Err(ConditionError::UnexpectedChar {
                    ch: other,
                    position: start,
                })
            }
        };

        tokens.push((start, token));
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Value, ConditionError> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::from(n));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| ConditionError::InvalidNumber(text.to_string()))
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if matches!(self.peek(), Some((_, t)) if t == expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat(&Token::And) {
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        })
    }

    fn descend(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ConditionError::TooDeep(MAX_NESTING_DEPTH));
        }
        Ok(())
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::LParen) {
            self.descend()?;
            let inner = self.parse_or()?;
            self.depth -= 1;
            return match self.next() {
                Some((_, Token::RParen)) => Ok(inner),
                Some((position, token)) => Err(ConditionError::UnexpectedToken {
                    found: token.to_string(),
                    position,
                }),
                None => Err(ConditionError::UnexpectedEnd),
            };
        }

        let left = self.parse_operand()?;
        if let Some((_, Token::Cmp(op))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare { left, op, right });
        }
        Ok(Expr::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand, ConditionError> {
        match self.next() {
            Some((_, Token::Str(s))) => Ok(Operand::Literal(Value::String(s))),
            Some((_, Token::Num(n))) => Ok(Operand::Literal(n)),
            Some((_, Token::True)) => Ok(Operand::Literal(Value::Bool(true))),
            Some((_, Token::False)) => Ok(Operand::Literal(Value::Bool(false))),
            Some((_, Token::Null)) => Ok(Operand::Literal(Value::Null)),
            Some((_, Token::Path(p))) => Ok(Operand::Path(p)),
            Some((position, token)) => Err(ConditionError::UnexpectedToken {
                found: token.to_string(),
                position,
            }),
            None => Err(ConditionError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::from_value(json!({
            "severity": "critical",
            "hostname": "ws01",
            "score": 87,
            "score_str": "87",
            "ratio": 0.25,
            "confirmed": true,
            "empty": "",
            "zero": 0,
            "owner": null,
            "tags": ["edr", "lab"],
            "asset": {"os": "windows", "criticality": "high"},
        }))
    }

    fn eval(expr: &str) -> bool {
        ConditionEvaluator::evaluate(expr, &ctx())
    }

    // ========================================================================
    // Comparisons
    // ========================================================================

    #[test]
    fn test_string_equality() {
        assert!(eval("severity == 'critical'"));
        assert!(eval("severity === \"critical\""));
        assert!(!eval("severity === \"low\""));
        assert!(eval("severity != 'low'"));
        assert!(eval("severity !== 'low'"));
    }

    #[test]
    fn test_numeric_equality_with_coercion() {
        assert!(eval("score == 87"));
        assert!(eval("score == '87'"));
        assert!(eval("score_str == 87"));
        assert!(eval("score === 87.0"));
        assert!(!eval("score == 88"));
    }

    #[test]
    fn test_strict_equality_compares_types() {
        assert!(!eval("score_str === 87"));
        assert!(eval("score_str !== 87"));
        assert!(!eval("score === '87'"));
        assert!(eval("score_str === '87'"));
        assert!(eval("owner === null"));
        assert!(!eval("zero === false"));
        assert!(eval("zero !== false"));
    }

    #[test]
    fn test_ordering() {
        assert!(eval("score > 80"));
        assert!(eval("score >= 87"));
        assert!(eval("score < 100"));
        assert!(eval("score_str <= 87"));
        assert!(eval("ratio < 0.5"));
        assert!(eval("-1 < ratio"));
        assert!(eval("hostname > 'ws00'"));
        assert!(!eval("hostname < 'ws00'"));
    }

    #[test]
    fn test_ordering_type_mismatch() {
        let err = ConditionEvaluator::try_evaluate("confirmed > 1", &ctx()).unwrap_err();
        assert!(matches!(err, ConditionError::TypeMismatch { .. }));
        assert!(!eval("owner < 3"));
        assert!(!eval("tags > 'a'"));
    }

    #[test]
    fn test_missing_path_is_null() {
        assert!(eval("missing == null"));
        assert!(eval("asset.location == null"));
        assert!(eval("owner == null"));
        assert!(!eval("missing"));
    }

    #[test]
    fn test_nested_and_indexed_paths() {
        assert!(eval("asset.os == 'windows'"));
        assert!(eval("tags.1 == 'lab'"));
        assert!(!eval("tags.5 == 'lab'"));
    }

    // ========================================================================
    // Logic
    // ========================================================================

    #[test]
    fn test_boolean_operators_and_precedence() {
        assert!(eval("severity == 'critical' && score > 50"));
        assert!(!eval("severity == 'critical' && score > 90"));
        assert!(eval("severity == 'low' || score > 50"));
        // && binds tighter than ||
        assert!(eval("severity == 'low' && score > 90 || confirmed"));
        assert!(!eval("severity == 'low' && (score > 90 || confirmed)"));
    }

    #[test]
    fn test_negation() {
        assert!(eval("!empty"));
        assert!(eval("!!confirmed"));
        assert!(eval("!(asset.os == 'linux')"));
        assert!(!eval("!confirmed"));
    }

    #[test]
    fn test_truthiness() {
        assert!(eval("confirmed"));
        assert!(eval("hostname"));
        assert!(eval("score"));
        assert!(eval("tags"));
        assert!(!eval("empty"));
        assert!(!eval("zero"));
        assert!(!eval("owner"));
        assert!(eval("true"));
        assert!(!eval("false"));
    }

    #[test]
    fn test_short_circuit_skips_type_errors() {
        assert!(eval("confirmed || confirmed > 1"));
        assert!(!eval("!confirmed && confirmed > 1"));
    }

    // ========================================================================
    // Parsing
    // ========================================================================

    #[test]
    fn test_string_escapes() {
        let context = ExecutionContext::from_value(json!({"quote": "it's"}));
        assert!(ConditionEvaluator::evaluate(r"quote == 'it\'s'", &context));
        assert!(ConditionEvaluator::evaluate("quote == \"it's\"", &context));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("   "), Err(ConditionError::Empty));
        assert_eq!(parse("severity =="), Err(ConditionError::UnexpectedEnd));
        assert!(matches!(
            parse("(severity == 'x'"),
            Err(ConditionError::UnexpectedEnd)
        ));
        assert!(matches!(
            parse("severity = 'x'"),
            Err(ConditionError::UnexpectedChar { ch: '=', .. })
        ));
        assert!(matches!(
            parse("'open"),
            Err(ConditionError::UnterminatedString(0))
        ));
        assert!(matches!(
            parse("a == b c"),
            Err(ConditionError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse("a == 1.2.3"),
            Err(ConditionError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse("asset..os"),
            Err(ConditionError::UnexpectedToken { .. })
        ));
    }

    #[test]
    fn test_nesting_depth_limit() {
        let nots = format!("{}confirmed", "!".repeat(500_000));
        assert_eq!(parse(&nots), Err(ConditionError::TooDeep(MAX_NESTING_DEPTH)));
        assert!(!eval(&nots));

        let parens = format!("{}confirmed", "(".repeat(500_000));
        assert_eq!(parse(&parens), Err(ConditionError::TooDeep(MAX_NESTING_DEPTH)));

        let at_limit = format!(
            "{}confirmed{}",
            "(".repeat(MAX_NESTING_DEPTH),
            ")".repeat(MAX_NESTING_DEPTH)
        );
        assert!(eval(&at_limit));
        assert!(eval(&format!("{}confirmed", "!!".repeat(MAX_NESTING_DEPTH / 2))));
    }

    #[test]
    fn test_parse_errors_evaluate_false() {
        assert!(!eval("severity =="));
        assert!(!eval("&& confirmed"));
        assert!(!eval("x ~ y"));
    }

    #[test]
    fn test_parse_shape() {
        let parsed = parse("a == 1 || !b && c").unwrap();
        assert_eq!(
            parsed,
            Expr::Or(vec![
                Expr::Compare {
                    left: Operand::Path("a".into()),
                    op: CompareOp::Eq,
                    right: Operand::Literal(json!(1)),
                },
                Expr::And(vec![
                    Expr::Not(Box::new(Expr::Truthy(Operand::Path("b".into())))),
                    Expr::Truthy(Operand::Path("c".into())),
                ]),
            ])
        );
    }
}
