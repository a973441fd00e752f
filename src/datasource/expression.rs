//! Lenguaje cerrado para las expresiones generadoras (`funcBody`) de las claves sintéticas.
//!
//! En lugar de ejecutar código arbitrario se interpreta un subconjunto mínimo:
//! declaraciones `var/let/const`, asignaciones, `if/else`, `return`, aritmética,
//! comparaciones, operadores lógicos, ternario y un conjunto fijo de funciones
//! matemáticas (con o sin prefijo `Math.`). La única variable ligada es `prevValue`.
//! No hay bucles; un presupuesto de pasos acota cualquier evaluación.


use std::collections::HashMap;
use rand::Rng;
use thiserror::Error;
use crate::config::datasource::{EXPRESSION_MAX_DEPTH, EXPRESSION_MAX_SOURCE_LEN, EXPRESSION_STEP_BUDGET, MOCK_AMPLITUDE};


#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("error de sintaxis: {0}")]
    Syntax(String),

    #[error("identificador desconocido: {0}")]
    UnknownIdentifier(String),

    #[error("función desconocida: {0}")]
    UnknownFunction(String),

    #[error("{name} espera {expected} argumentos")]
    Arity { name: String, expected: usize },

    #[error("la expresión no devuelve ningún valor")]
    MissingReturn,

    #[error("resultado no finito")]
    NonFinite,

    #[error("presupuesto de evaluación agotado")]
    BudgetExceeded,
}


#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Punct(&'static str),
}


const PUNCTS: [&str; 26] = [
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||",
    "+", "-", "*", "/", "%", "(", ")", "{", "}", ";", ",", "?", ":", "!", "<", ">", "=", ".",
];


fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut rest = src;

    'outer: while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
            continue;
        }
        if let Some(comment) = rest.strip_prefix("//") {
            rest = comment.find('\n').map_or("", |end| &comment[end..]);
            continue;
        }
        if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.find("*/").map_or("", |end| &comment[end + 2..]);
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && rest[1..].starts_with(|d: char| d.is_ascii_digit())) {
            let len = number_len(rest);
            let value = rest[..len]
                .parse::<f64>()
                .map_err(|_| ExprError::Syntax(format!("número inválido {}", &rest[..len])))?;
            tokens.push(Token::Num(value));
            rest = &rest[len..];
            continue;
        }
        if c.is_alphabetic() || c == '_' || c == '$' {
            let len = rest
                .find(|ch: char| !(ch.is_alphanumeric() || ch == '_' || ch == '$'))
                .unwrap_or(rest.len());
            tokens.push(Token::Ident(rest[..len].to_string()));
            rest = &rest[len..];
            continue;
        }
        for punct in PUNCTS {
            if let Some(tail) = rest.strip_prefix(punct) {
                tokens.push(Token::Punct(punct));
                rest = tail;
                continue 'outer;
            }
        }
        return Err(ExprError::Syntax(format!("carácter inesperado '{c}'")));
    }

    Ok(tokens)
}


fn number_len(src: &str) -> usize {
    let bytes = src.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() && (bytes[idx].is_ascii_digit() || bytes[idx] == b'.') {
        idx += 1;
    }
    if idx < bytes.len() && (bytes[idx] == b'e' || bytes[idx] == b'E') {
        let mut exp = idx + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            idx = exp;
            while idx < bytes.len() && bytes[idx].is_ascii_digit() {
                idx += 1;
            }
        }
    }
    idx
}


#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add, Sub, Mul, Div, Rem,
    Lt, Gt, Le, Ge, Eq, Ne,
    And, Or,
}


#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}


#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Declare(String, Expr),
    Assign(String, Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    Return(Expr),
    Expr(Expr),
}


struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}


impl Parser {

    /// Ejecuta `parse` un nivel más adentro, con el anidamiento acotado.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, ExprError>) -> Result<T, ExprError> {
        if self.depth >= EXPRESSION_MAX_DEPTH {
            return Err(ExprError::Syntax("anidamiento excesivo".to_string()));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn is_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), Some(Token::Punct(p)) if *p == punct)
    }

    fn eat(&mut self, punct: &str) -> bool {
        if self.is_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &str) -> Result<(), ExprError> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(ExprError::Syntax(format!("se esperaba '{punct}'")))
        }
    }

    fn ident(&mut self) -> Result<String, ExprError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            _ => Err(ExprError::Syntax("se esperaba un identificador".to_string())),
        }
    }

    fn statements_until_end(&mut self) -> Result<Vec<Stmt>, ExprError> {
        let mut body = Vec::new();
        while self.peek().is_some() {
            if self.eat(";") {
                continue;
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ExprError> {
        if self.eat("{") {
            let mut body = Vec::new();
            while !self.eat("}") {
                if self.peek().is_none() {
                    return Err(ExprError::Syntax("bloque sin cerrar".to_string()));
                }
                if self.eat(";") {
                    continue;
                }
                body.push(self.statement()?);
            }
            Ok(body)
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn end_statement(&mut self) -> Result<(), ExprError> {
        if self.eat(";") || self.peek().is_none() || self.is_punct("}") {
            Ok(())
        } else {
            Err(ExprError::Syntax("se esperaba ';'".to_string()))
        }
    }

    fn statement(&mut self) -> Result<Stmt, ExprError> {
        self.nested(Self::statement_inner)
    }

    fn statement_inner(&mut self) -> Result<Stmt, ExprError> {
        let keyword = match self.peek() {
            Some(Token::Ident(name)) => Some(name.clone()),
            _ => None,
        };

        let stmt = match keyword.as_deref() {
            Some("var") | Some("let") | Some("const") => {
                self.pos += 1;
                let name = self.ident()?;
                self.expect("=")?;
                let value = self.expression()?;
                self.end_statement()?;
                Stmt::Declare(name, value)
            }
            Some("return") => {
                self.pos += 1;
                let value = self.expression()?;
                self.end_statement()?;
                Stmt::Return(value)
            }
            Some("if") => {
                self.pos += 1;
                self.expect("(")?;
                let cond = self.expression()?;
                self.expect(")")?;
                let then = self.block()?;
                let otherwise = if matches!(self.peek(), Some(Token::Ident(k)) if k == "else") {
                    self.pos += 1;
                    self.block()?
                } else {
                    Vec::new()
                };
                Stmt::If(cond, then, otherwise)
            }
            Some(_) if matches!(self.peek_at(1), Some(Token::Punct("="))) => {
                let name = self.ident()?;
                self.pos += 1;
                let value = self.expression()?;
                self.end_statement()?;
                Stmt::Assign(name, value)
            }
            _ => {
                let value = self.expression()?;
                self.end_statement()?;
                Stmt::Expr(value)
            }
        };
        Ok(stmt)
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> Result<Expr, ExprError> {
        let cond = self.binary(0)?;
        if self.eat("?") {
            let then = self.expression()?;
            self.expect(":")?;
            let otherwise = self.expression()?;
            return Ok(Expr::Cond(Box::new(cond), Box::new(then), Box::new(otherwise)));
        }
        Ok(cond)
    }

    /// Operadores binarios por nivel de precedencia (menor a mayor).
    fn binary(&mut self, level: usize) -> Result<Expr, ExprError> {
        const LEVELS: [&[(&str, BinOp)]; 5] = [
            &[("||", BinOp::Or)],
            &[("&&", BinOp::And)],
            &[("===", BinOp::Eq), ("!==", BinOp::Ne), ("==", BinOp::Eq), ("!=", BinOp::Ne)],
            &[("<=", BinOp::Le), (">=", BinOp::Ge), ("<", BinOp::Lt), (">", BinOp::Gt)],
            &[("+", BinOp::Add), ("-", BinOp::Sub)],
        ];

        if level == LEVELS.len() {
            return self.term();
        }

        let mut lhs = self.binary(level + 1)?;
        'scan: loop {
            for (punct, op) in LEVELS[level] {
                if self.eat(punct) {
                    let rhs = self.binary(level + 1)?;
                    lhs = Expr::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'scan;
                }
            }
            return Ok(lhs);
        }
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat("*") {
                BinOp::Mul
            } else if self.eat("/") {
                BinOp::Div
            } else if self.eat("%") {
                BinOp::Rem
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat("-") {
            return Ok(Expr::Neg(Box::new(self.nested(Self::unary)?)));
        }
        if self.eat("+") {
            return self.nested(Self::unary);
        }
        if self.eat("!") {
            return Ok(Expr::Not(Box::new(self.nested(Self::unary)?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Num(value)) => Ok(Expr::Num(value)),
            Some(Token::Punct("(")) => {
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(Token::Ident(first)) => {
                let mut name = first;
                while self.eat(".") {
                    name.push('.');
                    name.push_str(&self.ident()?);
                }
                match name.as_str() {
                    "true" => return Ok(Expr::Num(1.0)),
                    "false" => return Ok(Expr::Num(0.0)),
                    _ => {}
                }
                if self.eat("(") {
                    let mut args = Vec::new();
                    if !self.eat(")") {
                        loop {
                            args.push(self.expression()?);
                            if self.eat(")") {
                                break;
                            }
                            self.expect(",")?;
                        }
                    }
                    return Ok(Expr::Call(name, args));
                }
                Ok(Expr::Var(name))
            }
            other => Err(ExprError::Syntax(format!("token inesperado {other:?}"))),
        }
    }
}


/// Programa generador ya analizado, reutilizable para toda una serie.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    body: Vec<Stmt>,
}


enum Flow {
    Next,
    Return(f64),
}


struct Eval<'a, R: Rng> {
    vars: HashMap<String, f64>,
    rng: &'a mut R,
    steps: usize,
}


impl Program {

    pub fn parse(src: &str) -> Result<Program, ExprError> {
        if src.len() > EXPRESSION_MAX_SOURCE_LEN {
            return Err(ExprError::Syntax(format!("expresión de {} bytes, máximo {}", src.len(), EXPRESSION_MAX_SOURCE_LEN)));
        }
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0, depth: 0 };
        let body = parser.statements_until_end()?;
        if body.is_empty() {
            return Err(ExprError::MissingReturn);
        }
        Ok(Program { body })
    }

    /// Evalúa el programa con `prevValue` ligado al valor anterior de la serie.
    pub fn eval<R: Rng>(&self, prev_value: f64, rng: &mut R) -> Result<f64, ExprError> {
        let mut eval = Eval {
            vars: HashMap::from([("prevValue".to_string(), prev_value)]),
            rng,
            steps: 0,
        };

        if let [Stmt::Expr(expr)] = self.body.as_slice() {
            return finite(eval.expr(expr)?);
        }

        match eval.block(&self.body)? {
            Flow::Return(value) => finite(value),
            Flow::Next => Err(ExprError::MissingReturn),
        }
    }
}


fn finite(value: f64) -> Result<f64, ExprError> {
    if value.is_finite() { Ok(value) } else { Err(ExprError::NonFinite) }
}


fn truthy(value: f64) -> bool {
    value != 0.0 && !value.is_nan()
}


fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}


impl<R: Rng> Eval<'_, R> {

    fn step(&mut self) -> Result<(), ExprError> {
        self.steps += 1;
        if self.steps > EXPRESSION_STEP_BUDGET {
            return Err(ExprError::BudgetExceeded);
        }
        Ok(())
    }

    fn block(&mut self, body: &[Stmt]) -> Result<Flow, ExprError> {
        for stmt in body {
            self.step()?;
            match stmt {
                Stmt::Declare(name, expr) | Stmt::Assign(name, expr) => {
                    let value = self.expr(expr)?;
                    self.vars.insert(name.clone(), value);
                }
                Stmt::If(cond, then, otherwise) => {
                    let branch = if truthy(self.expr(cond)?) { then } else { otherwise };
                    if let Flow::Return(value) = self.block(branch)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Stmt::Return(expr) => return Ok(Flow::Return(self.expr(expr)?)),
                Stmt::Expr(expr) => {
                    self.expr(expr)?;
                }
            }
        }
        Ok(Flow::Next)
    }

    fn expr(&mut self, expr: &Expr) -> Result<f64, ExprError> {
        self.step()?;
        let value = match expr {
            Expr::Num(value) => *value,
            Expr::Var(name) => match name.as_str() {
                "Math.PI" => std::f64::consts::PI,
                "Math.E" => std::f64::consts::E,
                _ => *self
                    .vars
                    .get(name)
                    .ok_or_else(|| ExprError::UnknownIdentifier(name.clone()))?,
            },
            Expr::Neg(inner) => -self.expr(inner)?,
            Expr::Not(inner) => flag(!truthy(self.expr(inner)?)),
            Expr::Binary(BinOp::And, lhs, rhs) => {
                let left = self.expr(lhs)?;
                if truthy(left) { self.expr(rhs)? } else { left }
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                let left = self.expr(lhs)?;
                if truthy(left) { left } else { self.expr(rhs)? }
            }
            Expr::Binary(op, lhs, rhs) => {
                let (a, b) = (self.expr(lhs)?, self.expr(rhs)?);
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Rem => a % b,
                    BinOp::Lt => flag(a < b),
                    BinOp::Gt => flag(a > b),
                    BinOp::Le => flag(a <= b),
                    BinOp::Ge => flag(a >= b),
                    BinOp::Eq => flag(a == b),
                    BinOp::Ne => flag(a != b),
                    BinOp::And | BinOp::Or => unreachable!("evaluados con cortocircuito"),
                }
            }
            Expr::Cond(cond, then, otherwise) => {
                if truthy(self.expr(cond)?) { self.expr(then)? } else { self.expr(otherwise)? }
            }
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.expr(arg)?);
                }
                self.call(name, &values)?
            }
        };
        Ok(value)
    }

    fn call(&mut self, name: &str, args: &[f64]) -> Result<f64, ExprError> {
        let func = name.strip_prefix("Math.").unwrap_or(name);

        let arity = |expected: usize| -> Result<(), ExprError> {
            if args.len() == expected {
                Ok(())
            } else {
                Err(ExprError::Arity { name: func.to_string(), expected })
            }
        };

        let value = match func {
            "random" => {
                arity(0)?;
                self.rng.gen_range(0.0..1.0)
            }
            "min" | "max" => {
                if args.is_empty() {
                    return Err(ExprError::Arity { name: func.to_string(), expected: 1 });
                }
                let pick: fn(f64, f64) -> f64 = if func == "min" { f64::min } else { f64::max };
                args.iter().copied().fold(args[0], pick)
            }
            "pow" => {
                arity(2)?;
                args[0].powf(args[1])
            }
            "abs" | "sin" | "cos" | "tan" | "sqrt" | "floor" | "ceil" | "round" | "exp" | "log" => {
                arity(1)?;
                let x = args[0];
                match func {
                    "abs" => x.abs(),
                    "sin" => x.sin(),
                    "cos" => x.cos(),
                    "tan" => x.tan(),
                    "sqrt" => x.sqrt(),
                    "floor" => x.floor(),
                    "ceil" => x.ceil(),
                    "round" => (x + 0.5).floor(),
                    "exp" => x.exp(),
                    _ => x.ln(),
                }
            }
            _ => return Err(ExprError::UnknownFunction(name.to_string())),
        };
        Ok(value)
    }
}


/// Valor aleatorio uniforme centrado en cero.
pub fn random_value<R: Rng>(rng: &mut R) -> f64 {
    rng.gen_range(-MOCK_AMPLITUDE..MOCK_AMPLITUDE)
}
