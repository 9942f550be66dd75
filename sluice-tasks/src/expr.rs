//! Tiny arithmetic-expression-to-OpenCL translator.
//!
//! Expressions range over `x` and `y`, the four basic operators,
//! parentheses, numeric literals and single-argument function calls.
//! The output is a kernel over `__global float *x, *y, *out` indexed by
//! the two global ids.
//!
//! A unary sign is emitted as the two-character literal `+-`, matching
//! the historical behavior of this translator; do not "fix" it without
//! adjusting the tests.

use std::fmt::Write;

use sluice_core::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Symbol {
    LParen,
    RParen,
    Float(f32),
    Integer(i32),
    IdentX,
    IdentY,
    Add,
    Sub,
    Mul,
    Div,
    Func(String),
    End,
}

fn bad_expression(reason: String) -> Error {
    Error::ConfigInvalid {
        option: "expression".into(),
        reason,
    }
}

fn tokenize(input: &str) -> Result<Vec<Symbol>> {
    let mut symbols = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                symbols.push(Symbol::LParen);
            }
            ')' => {
                chars.next();
                symbols.push(Symbol::RParen);
            }
            '+' => {
                chars.next();
                symbols.push(Symbol::Add);
            }
            '-' => {
                chars.next();
                symbols.push(Symbol::Sub);
            }
            '*' => {
                chars.next();
                symbols.push(Symbol::Mul);
            }
            '/' => {
                chars.next();
                symbols.push(Symbol::Div);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut text = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        chars.next();
                    } else if c == '.' && !is_float {
                        is_float = true;
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if is_float {
                    let value = text
                        .parse::<f32>()
                        .map_err(|_| bad_expression(format!("bad literal `{}`", text)))?;
                    symbols.push(Symbol::Float(value));
                } else {
                    let value = text
                        .parse::<i32>()
                        .map_err(|_| bad_expression(format!("bad literal `{}`", text)))?;
                    symbols.push(Symbol::Integer(value));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match name.as_str() {
                    "x" => symbols.push(Symbol::IdentX),
                    "y" => symbols.push(Symbol::IdentY),
                    _ => symbols.push(Symbol::Func(name)),
                }
            }
            other => return Err(bad_expression(format!("unexpected character `{}`", other))),
        }
    }
    symbols.push(Symbol::End);
    Ok(symbols)
}

struct Emitter<'a> {
    symbols: &'a [Symbol],
    position: usize,
    kernel: String,
}

impl<'a> Emitter<'a> {
    fn current(&self) -> &Symbol {
        &self.symbols[self.position.min(self.symbols.len() - 1)]
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn accept(&mut self, symbol: &Symbol) -> bool {
        if self.current() == symbol {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, symbol: &Symbol) -> Result<()> {
        if self.accept(symbol) {
            Ok(())
        } else {
            Err(bad_expression(format!(
                "expected {:?}, found {:?}",
                symbol,
                self.current()
            )))
        }
    }

    fn term(&mut self) -> Result<()> {
        match self.current().clone() {
            Symbol::Integer(value) => {
                let _ = write!(self.kernel, "{}", value);
                self.advance();
            }
            Symbol::Float(value) => {
                let _ = write!(self.kernel, "{:.6}", value);
                self.advance();
            }
            Symbol::IdentX => {
                self.kernel.push_str("x[idx]");
                self.advance();
            }
            Symbol::IdentY => {
                self.kernel.push_str("y[idx]");
                self.advance();
            }
            other => {
                return Err(bad_expression(format!(
                    "expected number or identifier, found {:?}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<()> {
        match self.current().clone() {
            Symbol::LParen => {
                self.advance();
                self.kernel.push('(');
                self.expression()?;
                self.expect(&Symbol::RParen)?;
                self.kernel.push(')');
                Ok(())
            }
            Symbol::Func(name) => {
                self.advance();
                let _ = write!(self.kernel, " {}", name);
                self.expect(&Symbol::LParen)?;
                self.kernel.push('(');
                self.expression()?;
                self.expect(&Symbol::RParen)?;
                self.kernel.push(')');
                Ok(())
            }
            Symbol::Add | Symbol::Sub => {
                // Unary sign, folded verbatim.
                self.kernel.push_str("+-");
                self.advance();
                self.expression()
            }
            Symbol::End => Ok(()),
            _ => {
                self.term()?;
                let op = match self.current() {
                    Symbol::Add => "+",
                    Symbol::Sub => "-",
                    Symbol::Mul => "*",
                    Symbol::Div => "/",
                    _ => return Ok(()),
                };
                self.kernel.push_str(op);
                self.advance();
                self.expression()
            }
        }
    }
}

/// Translate `expr` into OpenCL kernel source.
pub fn parse_expression(expr: &str) -> Result<String> {
    let symbols = tokenize(expr)?;
    let mut emitter = Emitter {
        symbols: &symbols,
        position: 0,
        kernel: String::from(
            "__kernel void binary_expr_kernel(__global float *x, __global float *y, \
             __global float *out)\n {\n\
             int idx = get_global_id(1)*get_global_size(0)+get_global_id(0);\n\
             out[idx] = ",
        ),
    };
    emitter.expression()?;
    emitter.kernel.push_str(";\n}");
    Ok(emitter.kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(kernel: &str) -> &str {
        let start = kernel.find("out[idx] = ").unwrap() + "out[idx] = ".len();
        &kernel[start..kernel.len() - ";\n}".len()]
    }

    #[test]
    fn emits_indexed_identifiers() {
        let kernel = parse_expression("x + y").unwrap();
        assert_eq!(body(&kernel), "x[idx]+y[idx]");
    }

    #[test]
    fn formats_literals() {
        let kernel = parse_expression("2.5 * x").unwrap();
        assert_eq!(body(&kernel), "2.500000*x[idx]");
        let kernel = parse_expression("3 / y").unwrap();
        assert_eq!(body(&kernel), "3/y[idx]");
    }

    #[test]
    fn parenthesized_function_calls() {
        let kernel = parse_expression("sin(x) * 2").unwrap();
        assert_eq!(body(&kernel), " sin(x[idx])*2");
        let kernel = parse_expression("(x + y) / 2").unwrap();
        assert_eq!(body(&kernel), "(x[idx]+y[idx])/2");
    }

    #[test]
    fn unary_sign_folds_to_plus_minus() {
        let kernel = parse_expression("-x").unwrap();
        assert_eq!(body(&kernel), "+-x[idx]");
        let kernel = parse_expression("+y").unwrap();
        assert_eq!(body(&kernel), "+-y[idx]");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_expression("x @ y").is_err());
        assert!(parse_expression("sin x").is_err());
        assert!(parse_expression("(x").is_err());
    }
}
