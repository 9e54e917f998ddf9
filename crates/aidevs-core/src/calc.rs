// Arithmetic expression evaluation for calibration data ("12 + 7").

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CalcError {
    #[error("unexpected token {token:?} at position {pos}")]
    UnexpectedToken { token: char, pos: usize },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("division by zero")]
    DivisionByZero,
}

static ARITHMETIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[\d\s+\-*/()]+\s*$").expect("static arithmetic pattern"));

/// True when `s` contains only digits, whitespace, operators and parentheses.
pub fn looks_like_arithmetic(s: &str) -> bool {
    ARITHMETIC.is_match(s)
}

/// Evaluate `+ - * /` with parentheses and unary minus. Division is exact
/// (`7 / 2` is `3.5`).
pub fn evaluate(expr: &str) -> Result<f64, CalcError> {
    let mut parser = Parser {
        chars: expr.char_indices().collect(),
        pos: 0,
    };
    let value = parser.expression()?;
    match parser.peek() {
        None => Ok(value),
        Some((pos, token)) => Err(CalcError::UnexpectedToken { token, pos }),
    }
}

/// Render a result the way a JSON answer expects it: integral values as
/// integers, the rest as floats.
pub fn to_json_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

struct Parser {
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser {
    /// Next non-whitespace character.
    fn peek(&mut self) -> Option<(usize, char)> {
        while self.chars.get(self.pos).is_some_and(|(_, c)| c.is_whitespace()) {
            self.pos += 1;
        }
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        let next = self.peek();
        self.pos += 1;
        next
    }

    // expression := term (('+' | '-') term)*
    fn expression(&mut self) -> Result<f64, CalcError> {
        let mut value = self.term()?;
        while let Some((_, op @ ('+' | '-'))) = self.peek() {
            self.bump();
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    // term := factor (('*' | '/') factor)*
    fn term(&mut self) -> Result<f64, CalcError> {
        let mut value = self.factor()?;
        while let Some((_, op @ ('*' | '/'))) = self.peek() {
            self.bump();
            let rhs = self.factor()?;
            if op == '*' {
                value *= rhs;
            } else {
                if rhs == 0.0 {
                    return Err(CalcError::DivisionByZero);
                }
                value /= rhs;
            }
        }
        Ok(value)
    }

    // factor := '-' factor | '(' expression ')' | number
    fn factor(&mut self) -> Result<f64, CalcError> {
        match self.peek() {
            None => Err(CalcError::UnexpectedEnd),
            Some((_, '-')) => {
                self.bump();
                Ok(-self.factor()?)
            }
            Some((_, '+')) => {
                self.bump();
                self.factor()
            }
            Some((_, '(')) => {
                self.bump();
                let value = self.expression()?;
                match self.bump() {
                    Some((_, ')')) => Ok(value),
                    Some((pos, token)) => Err(CalcError::UnexpectedToken { token, pos }),
                    None => Err(CalcError::UnexpectedEnd),
                }
            }
            Some((_, c)) if c.is_ascii_digit() => {
                let mut value = 0.0;
                // Digits must be contiguous, so read raw characters here.
                while let Some(&(_, d)) = self
                    .chars
                    .get(self.pos)
                    .filter(|(_, d)| d.is_ascii_digit())
                {
                    self.pos += 1;
                    value = value * 10.0 + f64::from(d as u8 - b'0');
                }
                Ok(value)
            }
            Some((pos, token)) => Err(CalcError::UnexpectedToken { token, pos }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn simple_sums() {
        assert_eq!(evaluate("45 + 86").unwrap(), 131.0);
        assert_eq!(evaluate("  3+4 ").unwrap(), 7.0);
    }

    #[test]
    fn precedence_and_parentheses() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("-(4 - 10) / 4").unwrap(), 1.5);
    }

    #[test]
    fn errors() {
        assert_eq!(evaluate("1 / (2 - 2)"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("1 +"), Err(CalcError::UnexpectedEnd));
        assert_eq!(evaluate("(1 + 2"), Err(CalcError::UnexpectedEnd));
        assert!(matches!(
            evaluate("1 2"),
            Err(CalcError::UnexpectedToken { token: '2', .. })
        ));
    }

    #[test]
    fn arithmetic_detection() {
        assert!(looks_like_arithmetic("12 + 7"));
        assert!(looks_like_arithmetic("(1+2)*3"));
        assert!(!looks_like_arithmetic("What is the capital of Poland?"));
        assert!(!looks_like_arithmetic(""));
    }

    #[test]
    fn json_numbers() {
        assert_eq!(to_json_number(131.0), json!(131));
        assert_eq!(to_json_number(1.5), json!(1.5));
        assert_eq!(to_json_number(-4.0), json!(-4));
    }
}
