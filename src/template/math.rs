//! Arithmetic for the `math` filter.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr    = term (('+' | '-') term)*
//! term    = unary (('*' | '/' | '%') unary)*
//! unary   = ('-' | '+') unary | power
//! power   = primary ('^' unary)?
//! primary = number | '(' expr ')'
//! ```

use thiserror::Error;

/// Maximum parenthesis and sign nesting
const MAX_NESTING: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum MathError {
    #[error("Unexpected character '{0}'")]
    UnexpectedChar(char),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Expression nested too deeply")]
    TooDeep,

    #[error("Result is not a finite number")]
    NotFinite,
}

/// Evaluate an arithmetic expression.
pub fn evaluate(expr: &str) -> Result<f64, MathError> {
    let mut parser = MathParser {
        chars: expr.chars().filter(|c| !c.is_whitespace()).collect(),
        pos: 0,
        depth: 0,
    };

    let value = parser.expr()?;
    if let Some(&c) = parser.chars.get(parser.pos) {
        return Err(MathError::UnexpectedChar(c));
    }
    if !value.is_finite() {
        return Err(MathError::NotFinite);
    }
    Ok(value)
}

struct MathParser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl MathParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn descend(&mut self) -> Result<(), MathError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(MathError::TooDeep);
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<f64, MathError> {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, MathError> {
        let mut value = self.unary()?;
        while let Some(op @ ('*' | '/' | '%')) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                '*' => value * rhs,
                '/' => value / rhs,
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64, MathError> {
        match self.peek() {
            Some(sign @ ('-' | '+')) => {
                self.pos += 1;
                self.descend()?;
                let value = self.unary()?;
                self.depth -= 1;
                Ok(if sign == '-' { -value } else { value })
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, MathError> {
        let base = self.primary()?;
        if self.peek() == Some('^') {
            self.pos += 1;
            self.descend()?;
            let exponent = self.unary()?;
            self.depth -= 1;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, MathError> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                self.descend()?;
                let value = self.expr()?;
                self.depth -= 1;
                match self.peek() {
                    Some(')') => {
                        self.pos += 1;
                        Ok(value)
                    }
                    Some(c) => Err(MathError::UnexpectedChar(c)),
                    None => Err(MathError::UnexpectedEnd),
                }
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| c.is_ascii_digit() || c == '.')
                {
                    self.pos += 1;
                }
                let text: String = self.chars[start..self.pos].iter().collect();
                text.parse::<f64>()
                    .map_err(|_| MathError::InvalidNumber(text))
            }
            Some(c) => Err(MathError::UnexpectedChar(c)),
            None => Err(MathError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        assert_eq!(evaluate("1 + 2 * 3"), Ok(7.0));
        assert_eq!(evaluate("(1+2)*3"), Ok(9.0));
        assert_eq!(evaluate("10 % 4 + 2^3"), Ok(10.0));
        assert_eq!(evaluate("2^3^2"), Ok(512.0));
    }

    #[test]
    fn test_unary_minus() {
        assert_eq!(evaluate("-3 + 5"), Ok(2.0));
        assert_eq!(evaluate("-(2*3)"), Ok(-6.0));
        assert_eq!(evaluate("-2^2"), Ok(-4.0));
        assert_eq!(evaluate("4 * -2"), Ok(-8.0));
    }

    #[test]
    fn test_decimals() {
        assert_eq!(evaluate("1.5 * 2"), Ok(3.0));
        assert_eq!(evaluate("7 / 2"), Ok(3.5));
    }

    #[test]
    fn test_errors() {
        assert_eq!(evaluate("1 / 0"), Err(MathError::NotFinite));
        assert_eq!(evaluate("2 +"), Err(MathError::UnexpectedEnd));
        assert_eq!(evaluate("(1 + 2"), Err(MathError::UnexpectedEnd));
        assert_eq!(evaluate("2 x 3"), Err(MathError::UnexpectedChar('x')));
        assert!(matches!(evaluate("1.2.3"), Err(MathError::InvalidNumber(_))));
        assert_eq!(evaluate(""), Err(MathError::UnexpectedEnd));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(evaluate(&deep), Err(MathError::TooDeep));
    }
}
