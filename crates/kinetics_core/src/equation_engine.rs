use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes the positional argument at this index onto the stack.
    LoadArg(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    /// Pops top value (a), pushes f(a).
    Unary(UnaryFn),
    /// Pops top two values (b, a), pushes f(a, b).
    Binary(BinaryFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
    Tanh,
}

impl UnaryFn {
    fn lookup(name: &str) -> Option<Self> {
        let f = match name {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "exp" => Self::Exp,
            "ln" | "log" => Self::Ln,
            "log10" => Self::Log10,
            "sqrt" => Self::Sqrt,
            "abs" => Self::Abs,
            "tanh" => Self::Tanh,
            _ => return None,
        };
        Some(f)
    }

    fn apply(self, a: f64) -> f64 {
        match self {
            Self::Sin => a.sin(),
            Self::Cos => a.cos(),
            Self::Tan => a.tan(),
            Self::Exp => a.exp(),
            Self::Ln => a.ln(),
            Self::Log10 => a.log10(),
            Self::Sqrt => a.sqrt(),
            Self::Abs => a.abs(),
            Self::Tanh => a.tanh(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFn {
    Min,
    Max,
}

impl BinaryFn {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            _ => None,
        }
    }

    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stack-based Virtual Machine for evaluating formulas.
///
/// The VM is stateless; `execute` takes the positional arguments and a
/// reusable stack buffer so the hot path never allocates once the buffer
/// has grown to the formula's depth.
pub struct VM;

impl VM {
    pub fn execute(bytecode: &Bytecode, args: &[f64], stack: &mut Vec<f64>) -> f64 {
        stack.clear();

        // Compiled bytecode is always balanced, the NaN fallbacks never fire.
        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(val),
                OpCode::LoadArg(idx) => stack.push(args[idx]),
                OpCode::Neg => {
                    let a = stack.pop().unwrap_or(f64::NAN);
                    stack.push(-a);
                }
                OpCode::Unary(f) => {
                    let a = stack.pop().unwrap_or(f64::NAN);
                    stack.push(f.apply(a));
                }
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Pow
                | OpCode::Binary(_) => {
                    let b = stack.pop().unwrap_or(f64::NAN);
                    let a = stack.pop().unwrap_or(f64::NAN);
                    let value = match *op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        OpCode::Pow => a.powf(b),
                        OpCode::Binary(f) => f.apply(a, b),
                        _ => f64::NAN,
                    };
                    stack.push(value);
                }
            }
        }

        stack.pop().unwrap_or(0.0)
    }
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Negate(Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves names to the position of the matching function parameter.
pub struct Compiler {
    pub arg_map: HashMap<String, usize>,
}

impl Compiler {
    pub fn new(arg_names: &[String]) -> Self {
        let arg_map = arg_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self { arg_map }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, String> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), String> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => match self.arg_map.get(name) {
                Some(&idx) => ops.push(OpCode::LoadArg(idx)),
                None => return Err(format!("Unknown symbol: {name}")),
            },
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                let code = match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => return Err(format!("Unknown binary operator: {op}")),
                };
                ops.push(code);
            }
            Expr::Negate(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, args) => {
                for arg in args {
                    self.compile_recursive(arg, ops)?;
                }
                let code = match args.len() {
                    1 => UnaryFn::lookup(func).map(OpCode::Unary),
                    2 => BinaryFn::lookup(func).map(OpCode::Binary),
                    _ => None,
                };
                match code {
                    Some(code) => ops.push(code),
                    None => {
                        return Err(format!(
                            "Unknown function: {func} with {} argument(s)",
                            args.len()
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}

// --- Simple Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("Unexpected trailing token: {token:?}")),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Comma,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign = (d == '+' || d == '-') && num_str.ends_with(['e', 'E']);
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("Invalid number literal: {num_str}"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                ',' => Token::Comma,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => return Err(format!("Unexpected character: {c}")),
            };
            tokens.push(token);
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<(), String> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err("Expected ')'".to_string()),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_product()?;

        loop {
            let op = match self.peek() {
                Some(Token::Plus) => '+',
                Some(Token::Minus) => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Some(Token::Star) => '*',
                Some(Token::Slash) => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Unary minus binds looser than `^`, so `-x^2` is `-(x^2)`.
    fn parse_unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Negate(Box::new(expr)));
        }
        self.parse_power()
    }

    // Right associative: `a^b^c` is `a^(b^c)`.
    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let mut args = vec![self.parse_expression()?];
                    while let Some(Token::Comma) = self.peek() {
                        self.consume();
                        args.push(self.parse_expression()?);
                    }
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(format!("Unexpected token: {token:?}")),
            None => Err("Unexpected end of expression".to_string()),
        }
    }
}

/// Parses and compiles `source` against the ordered parameter names.
pub fn compile_formula(arg_names: &[String], source: &str) -> Result<Bytecode, String> {
    let expr = parse(source)?;
    Compiler::new(arg_names).compile(&expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(params: &[&str], source: &str, args: &[f64]) -> f64 {
        let names: Vec<String> = params.iter().map(|s| s.to_string()).collect();
        let code = compile_formula(&names, source).expect("formula should compile");
        let mut stack = Vec::new();
        VM::execute(&code, args, &mut stack)
    }

    #[test]
    fn respects_precedence_and_associativity() {
        assert_eq!(eval(&["a", "b"], "a + b * 2", &[1.0, 3.0]), 7.0);
        assert_eq!(eval(&["x"], "-x^2", &[3.0]), -9.0);
        assert_eq!(eval(&[], "2^3^2", &[]), 512.0);
        assert_eq!(eval(&["a"], "(a - 1) / 4", &[9.0]), 2.0);
    }

    #[test]
    fn supports_functions_and_scientific_literals() {
        assert!((eval(&["x"], "exp(ln(x))", &[2.5]) - 2.5).abs() < 1e-12);
        assert_eq!(eval(&["a", "b"], "max(a, b) - min(a, b)", &[2.0, 5.0]), 3.0);
        assert_eq!(eval(&[], "1.5e-3 * 2E+3", &[]), 3.0);
    }

    #[test]
    fn unknown_symbols_and_functions_are_rejected() {
        let names = vec!["x".to_string()];
        let err = compile_formula(&names, "x + missing").expect_err("unknown symbol");
        assert!(err.to_lowercase().contains("unknown"), "unexpected error: {err}");
        assert!(compile_formula(&names, "foo(x)").is_err());
        assert!(compile_formula(&names, "x +").is_err());
        assert!(compile_formula(&names, "x $ 2").is_err());
        assert!(compile_formula(&names, "x 2").is_err());
    }
}
