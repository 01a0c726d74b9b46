//! Noise expression sandbox.
//!
//! User formulas are never turned into executable code.  A formula goes
//! through two cheap gates (character whitelist, banned-token scan), is then
//! tokenized and parsed into an [`Ast`], and finally evaluated by a small
//! interpreter.  The same tree is lowered to WGSL for the coordinate kernel,
//! so the CPU and GPU paths share one validated representation.
//!
//! # Syntax
//!
//! ```text
//! x, y, distance           // inputs; distance = hypot(x, y)
//! pi, e                    // constants
//! a + b  a - b  a * b  a / b  a % b   // % is a floored modulo
//! a ^ b                    // power, right associative
//! -a  (a)  f(a, b, ...)    // -a ^ b is -(a ^ b); a ^ -b is allowed
//! ```

use std::f64::consts::{E, PI};
use std::fmt::Write as _;

use crate::error::PipelineError;

/// Longest accepted formula, in bytes.
pub const MAX_SOURCE_LEN: usize = 1024;
/// Deepest accepted nesting of unary / parenthesised / call sub-expressions.
pub const MAX_DEPTH: usize = 64;

// ============================================================================
// Vocabulary
// ============================================================================

/// A function callable from a formula.
#[derive(Debug)]
pub struct Builtin {
    pub name: &'static str,
    pub arity: usize,
    eval: fn(&[f64]) -> f64,
    /// WGSL callee; helpers prefixed `nf_` live in [`WGSL_PRELUDE`].
    wgsl: &'static str,
}

fn floor_mod(a: f64, b: f64) -> f64 {
    a - b * (a / b).floor()
}

// Matches WGSL `sign`, which yields 0 for 0.
fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn smoothstep(e0: f64, e1: f64, v: f64) -> f64 {
    let t = ((v - e0) / (e1 - e0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

macro_rules! builtin {
    ($name:literal, $wgsl:literal, |$a:ident| $body:expr) => {
        Builtin {
            name: $name,
            arity: 1,
            eval: |args| {
                let $a = args[0];
                $body
            },
            wgsl: $wgsl,
        }
    };
    ($name:literal, $wgsl:literal, |$a:ident, $b:ident| $body:expr) => {
        Builtin {
            name: $name,
            arity: 2,
            eval: |args| {
                let ($a, $b) = (args[0], args[1]);
                $body
            },
            wgsl: $wgsl,
        }
    };
    ($name:literal, $wgsl:literal, |$a:ident, $b:ident, $c:ident| $body:expr) => {
        Builtin {
            name: $name,
            arity: 3,
            eval: |args| {
                let ($a, $b, $c) = (args[0], args[1], args[2]);
                $body
            },
            wgsl: $wgsl,
        }
    };
}

/// The complete function vocabulary.  Nothing outside this table can be called.
pub static BUILTINS: &[Builtin] = &[
    builtin!("sin", "sin", |a| a.sin()),
    builtin!("cos", "cos", |a| a.cos()),
    builtin!("tan", "tan", |a| a.tan()),
    builtin!("asin", "nf_asin", |a| a.asin()),
    builtin!("acos", "nf_acos", |a| a.acos()),
    builtin!("atan", "atan", |a| a.atan()),
    builtin!("atan2", "atan2", |a, b| a.atan2(b)),
    builtin!("sinh", "sinh", |a| a.sinh()),
    builtin!("cosh", "cosh", |a| a.cosh()),
    builtin!("tanh", "tanh", |a| a.tanh()),
    builtin!("exp", "exp", |a| a.exp()),
    builtin!("log", "nf_log", |a| a.ln()),
    builtin!("log2", "nf_log2", |a| a.log2()),
    builtin!("log10", "nf_log10", |a| a.log10()),
    builtin!("sqrt", "nf_sqrt", |a| a.sqrt()),
    builtin!("cbrt", "nf_cbrt", |a| a.cbrt()),
    builtin!("abs", "abs", |a| a.abs()),
    builtin!("floor", "floor", |a| a.floor()),
    builtin!("ceil", "ceil", |a| a.ceil()),
    builtin!("round", "nf_round", |a| a.round()),
    builtin!("fract", "fract", |a| a - a.floor()),
    builtin!("sign", "sign", |a| sign(a)),
    builtin!("min", "min", |a, b| a.min(b)),
    builtin!("max", "max", |a, b| a.max(b)),
    builtin!("pow", "nf_pow", |a, b| a.powf(b)),
    builtin!("mod", "nf_mod", |a, b| floor_mod(a, b)),
    builtin!("hypot", "nf_hypot", |a, b| a.hypot(b)),
    builtin!("step", "step", |a, b| if b < a { 0.0 } else { 1.0 }),
    builtin!("clamp", "nf_clamp", |v, lo, hi| v.max(lo).min(hi)),
    builtin!("mix", "mix", |a, b, t| a + (b - a) * t),
    builtin!("smoothstep", "nf_smoothstep", |a, b, v| smoothstep(a, b, v)),
];

const VARIABLES: &[&str] = &["x", "y", "distance"];
const CONSTANTS: &[&str] = &["pi", "e"];

/// Substrings that never belong in a formula.  Most cannot get past the
/// character whitelist anyway; the scan is the second, independent gate.
const BANNED_TOKENS: &[&str] = &[
    "import",
    "require",
    "eval",
    "function",
    "constructor",
    "prototype",
    "__proto__",
    "globalthis",
    "global",
    "window",
    "document",
    "process",
    "self",
    "this",
    "new",
    "return",
    "while",
    "for",
    "do",
    "if",
    "else",
    "fetch",
    "=>",
    ";",
    "{",
    "}",
    "[",
    "]",
    "=",
    "\"",
    "'",
    "`",
];

const OPERATOR_CHARS: &str = "+-*/%^(),.";

pub fn lookup_builtin(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

fn is_allowed_char(c: char) -> bool {
    if c.is_ascii_digit() || c == ' ' || c == '\t' || c == '\n' || c == '\r' {
        return true;
    }
    if OPERATOR_CHARS.contains(c) {
        return true;
    }
    c.is_ascii_lowercase()
        && (VARIABLES.iter().any(|v| v.contains(c))
            || CONSTANTS.iter().any(|k| k.contains(c))
            || BUILTINS.iter().any(|b| b.name.contains(c)))
}

/// Gate 1: every character must come from the formula alphabet.
fn check_alphabet(source: &str) -> Result<(), PipelineError> {
    if let Some((pos, c)) = source.char_indices().find(|&(_, c)| !is_allowed_char(c)) {
        return Err(PipelineError::invalid_expression(
            format!("character {:?} is not allowed", c),
            Some(pos),
        ));
    }
    Ok(())
}

/// Gate 2: reject known escape-hatch tokens regardless of alphabet.
fn check_banned(source: &str) -> Result<(), PipelineError> {
    let lower = source.to_ascii_lowercase();
    for token in BANNED_TOKENS {
        if let Some(pos) = lower.find(token) {
            return Err(PipelineError::invalid_expression(
                format!("banned token {:?}", token),
                Some(pos),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
    Eof,
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek_char()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().is_some_and(|c| c.is_ascii_whitespace()) {
            self.bump();
        }
    }

    fn read_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek_char().is_some_and(&pred) {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    /// Returns the token and the byte offset it started at.
    fn next_token(&mut self) -> Result<(Token, usize), PipelineError> {
        self.skip_whitespace();
        let start = self.pos;
        let Some(c) = self.peek_char() else {
            return Ok((Token::Eof, start));
        };

        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '^' => Some(Token::Caret),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(tok) = single {
            self.bump();
            return Ok((tok, start));
        }

        if c.is_ascii_digit() || c == '.' {
            let text = self.read_while(|c| c.is_ascii_digit() || c == '.');
            return text
                .parse::<f64>()
                .map(|n| (Token::Number(n), start))
                .map_err(|_| {
                    PipelineError::invalid_expression(format!("invalid number {:?}", text), Some(start))
                });
        }

        if c.is_ascii_alphabetic() {
            let text = self.read_while(|c| c.is_ascii_alphanumeric());
            return Ok((Token::Ident(text.to_string()), start));
        }

        Err(PipelineError::invalid_expression(
            format!("unexpected character {:?}", c),
            Some(start),
        ))
    }
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Var {
    X,
    Y,
    Distance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

/// Parsed formula.  Calls are resolved against [`BUILTINS`] at parse time.
#[derive(Debug, Clone)]
pub enum Ast {
    Num(f64),
    Var(Var),
    Neg(Box<Ast>),
    BinOp(BinOp, Box<Ast>, Box<Ast>),
    Call(&'static Builtin, Vec<Ast>),
}

// ============================================================================
// Parser
// ============================================================================

struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    current_pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Result<Self, PipelineError> {
        let mut lexer = Lexer::new(input);
        let (current, current_pos) = lexer.next_token()?;
        Ok(Self {
            lexer,
            current,
            current_pos,
            depth: 0,
        })
    }

    fn advance(&mut self) -> Result<(), PipelineError> {
        let (tok, pos) = self.lexer.next_token()?;
        self.current = tok;
        self.current_pos = pos;
        Ok(())
    }

    fn error(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::invalid_expression(message, Some(self.current_pos))
    }

    fn unexpected(&self) -> PipelineError {
        match &self.current {
            Token::Eof => self.error("unexpected end of expression"),
            tok => self.error(format!("unexpected token {:?}", tok)),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), PipelineError> {
        if self.current == expected {
            self.advance()
        } else {
            Err(self.unexpected())
        }
    }

    fn enter(&mut self) -> Result<(), PipelineError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!("expression nested deeper than {}", MAX_DEPTH)));
        }
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Ast, PipelineError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.current {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_term()?;
            left = Ast::BinOp(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Ast, PipelineError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance()?;
            let right = self.parse_unary()?;
            left = Ast::BinOp(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // Binds tighter than unary minus on its left, so `-2 ^ 2` is -4.
    fn parse_power(&mut self) -> Result<Ast, PipelineError> {
        let base = self.parse_primary()?;
        if self.current == Token::Caret {
            self.advance()?;
            self.enter()?;
            let exp = self.parse_unary()?;
            self.depth -= 1;
            Ok(Ast::BinOp(BinOp::Pow, Box::new(base), Box::new(exp)))
        } else {
            Ok(base)
        }
    }

    fn parse_unary(&mut self) -> Result<Ast, PipelineError> {
        if self.current == Token::Minus {
            self.advance()?;
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            Ok(Ast::Neg(Box::new(inner)))
        } else {
            self.parse_power()
        }
    }

    fn parse_primary(&mut self) -> Result<Ast, PipelineError> {
        match &self.current {
            Token::Number(n) => {
                let n = *n;
                // The GPU kernel works in f32; a literal it cannot hold would diverge.
                if !(n as f32).is_finite() {
                    return Err(self.error("number is too large"));
                }
                self.advance()?;
                Ok(Ast::Num(n))
            }
            Token::Ident(name) => {
                let name = name.clone();
                let name_pos = self.current_pos;
                self.advance()?;
                if self.current == Token::LParen {
                    return self.parse_call(&name, name_pos);
                }
                match name.as_str() {
                    "x" => Ok(Ast::Var(Var::X)),
                    "y" => Ok(Ast::Var(Var::Y)),
                    "distance" => Ok(Ast::Var(Var::Distance)),
                    "pi" => Ok(Ast::Num(PI)),
                    "e" => Ok(Ast::Num(E)),
                    _ => Err(PipelineError::invalid_expression(
                        format!("unknown variable {:?}", name),
                        Some(name_pos),
                    )),
                }
            }
            Token::LParen => {
                self.advance()?;
                self.enter()?;
                let inner = self.parse_expr()?;
                self.depth -= 1;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_call(&mut self, name: &str, name_pos: usize) -> Result<Ast, PipelineError> {
        let func = lookup_builtin(name).ok_or_else(|| {
            PipelineError::invalid_expression(format!("unknown function {:?}", name), Some(name_pos))
        })?;
        self.advance()?; // '('
        self.enter()?;
        let mut args = Vec::with_capacity(func.arity);
        if self.current != Token::RParen {
            args.push(self.parse_expr()?);
            while self.current == Token::Comma {
                self.advance()?;
                args.push(self.parse_expr()?);
            }
        }
        self.expect(Token::RParen)?;
        self.depth -= 1;
        if args.len() != func.arity {
            return Err(PipelineError::invalid_expression(
                format!(
                    "function {:?} expects {} argument(s), got {}",
                    name,
                    func.arity,
                    args.len()
                ),
                Some(name_pos),
            ));
        }
        Ok(Ast::Call(func, args))
    }
}

// ============================================================================
// Compiled noise function
// ============================================================================

/// A validated, parsed formula over `x`, `y` (and `distance`).
///
/// Evaluation is a pure tree walk: same inputs, same bits out.
#[derive(Debug, Clone)]
pub struct NoiseFn {
    source: String,
    ast: Ast,
}

/// Validate and parse `source`.  Fails before any evaluation can happen.
pub fn compile(source: &str) -> Result<NoiseFn, PipelineError> {
    if source.len() > MAX_SOURCE_LEN {
        return Err(PipelineError::invalid_expression(
            format!("expression longer than {} bytes", MAX_SOURCE_LEN),
            None,
        ));
    }
    if source.trim().is_empty() {
        return Err(PipelineError::invalid_expression("expression is empty", None));
    }
    check_alphabet(source)?;
    check_banned(source)?;

    let mut parser = Parser::new(source)?;
    let ast = parser.parse_expr()?;
    if parser.current != Token::Eof {
        return Err(parser.unexpected());
    }
    Ok(NoiseFn {
        source: source.to_string(),
        ast,
    })
}

impl NoiseFn {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Ast {
        &self.ast
    }

    /// Evaluate; NaN and infinities become `0.0`.
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        let v = self.eval_raw(x, y);
        if v.is_finite() { v } else { 0.0 }
    }

    /// Evaluate without coercing non-finite results.
    pub fn eval_raw(&self, x: f64, y: f64) -> f64 {
        eval_ast(&self.ast, x, y)
    }

    /// Lower to a WGSL function `noise_fn(x: f32, y: f32) -> f32`.
    ///
    /// Like [`NoiseFn::eval_raw`] the result is not coerced; the kernel tests
    /// it with `nf_is_finite`.  Requires [`WGSL_PRELUDE`] in the same module.
    pub fn to_wgsl(&self) -> String {
        let mut body = String::new();
        lower_wgsl(&self.ast, &mut body);
        format!(
            "fn noise_fn(v_x: f32, v_y: f32) -> f32 {{\n    \
             let v_distance = sqrt(v_x * v_x + v_y * v_y);\n    \
             return {};\n}}\n",
            body
        )
    }
}

fn eval_ast(ast: &Ast, x: f64, y: f64) -> f64 {
    match ast {
        Ast::Num(n) => *n,
        Ast::Var(Var::X) => x,
        Ast::Var(Var::Y) => y,
        Ast::Var(Var::Distance) => x.hypot(y),
        Ast::Neg(inner) => -eval_ast(inner, x, y),
        Ast::BinOp(op, l, r) => {
            let l = eval_ast(l, x, y);
            let r = eval_ast(r, x, y);
            match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                BinOp::Mul => l * r,
                BinOp::Div => l / r,
                BinOp::Mod => floor_mod(l, r),
                BinOp::Pow => l.powf(r),
            }
        }
        Ast::Call(func, args) => {
            let mut values = [0.0f64; 3];
            for (slot, arg) in values.iter_mut().zip(args) {
                *slot = eval_ast(arg, x, y);
            }
            (func.eval)(&values[..args.len()])
        }
    }
}

/// Helpers the lowered formula may call.  Semantics mirror the interpreter
/// (Rust `f64`): WGSL leaves `pow`, `log`, `sqrt`, `asin`, `acos`, `clamp`
/// and `smoothstep` undefined outside their domains, so every call with a
/// domain edge goes through an `nf_` wrapper that produces the same NaN or
/// infinity the CPU does.
pub const WGSL_PRELUDE: &str = r#"
fn nf_is_finite(v: f32) -> bool {
    return v == v && abs(v) <= 3.4028234e38;
}

fn nf_nan() -> f32 {
    return bitcast<f32>(0x7fc00000u);
}

fn nf_inf() -> f32 {
    return bitcast<f32>(0x7f800000u);
}

fn nf_pow(a: f32, b: f32) -> f32 {
    if b == 0.0 {
        return 1.0;
    }
    if a == 0.0 {
        return select(nf_inf(), 0.0, b > 0.0);
    }
    let m = pow(abs(a), b);
    if a > 0.0 {
        return m;
    }
    if a != a || floor(b) != b {
        return nf_nan();
    }
    return select(m, -m, nf_mod(b, 2.0) == 1.0);
}

fn nf_sqrt(v: f32) -> f32 {
    if v < 0.0 {
        return nf_nan();
    }
    return sqrt(v);
}

fn nf_log(v: f32) -> f32 {
    if v < 0.0 {
        return nf_nan();
    }
    if v == 0.0 {
        return -nf_inf();
    }
    return log(v);
}

fn nf_log2(v: f32) -> f32 {
    if v < 0.0 {
        return nf_nan();
    }
    if v == 0.0 {
        return -nf_inf();
    }
    return log2(v);
}

fn nf_asin(v: f32) -> f32 {
    if abs(v) > 1.0 {
        return nf_nan();
    }
    return asin(v);
}

fn nf_acos(v: f32) -> f32 {
    if abs(v) > 1.0 {
        return nf_nan();
    }
    return acos(v);
}

fn nf_clamp(v: f32, lo: f32, hi: f32) -> f32 {
    return min(max(v, lo), hi);
}

fn nf_smoothstep(e0: f32, e1: f32, v: f32) -> f32 {
    let span = e1 - e0;
    var t: f32;
    if span == 0.0 {
        if v == e0 {
            return nf_nan();
        }
        t = select(0.0, 1.0, v > e0);
    } else {
        t = clamp((v - e0) / span, 0.0, 1.0);
    }
    return t * t * (3.0 - 2.0 * t);
}

fn nf_mod(a: f32, b: f32) -> f32 {
    return a - b * floor(a / b);
}

fn nf_round(v: f32) -> f32 {
    return sign(v) * floor(abs(v) + 0.5);
}

fn nf_cbrt(v: f32) -> f32 {
    if v == 0.0 {
        return 0.0;
    }
    return sign(v) * pow(abs(v), 1.0 / 3.0);
}

fn nf_log10(v: f32) -> f32 {
    return nf_log(v) * 0.4342944819;
}

fn nf_hypot(a: f32, b: f32) -> f32 {
    return sqrt(a * a + b * b);
}
"#;

// `compile` rejects literals outside the f32 range.
fn wgsl_number(n: f64) -> String {
    let f = n as f32;
    let text = format!("{:?}", f);
    if text.contains('.') || text.contains('e') {
        text
    } else {
        format!("{}.0", text)
    }
}

fn lower_wgsl(ast: &Ast, out: &mut String) {
    match ast {
        Ast::Num(n) => out.push_str(&wgsl_number(*n)),
        Ast::Var(Var::X) => out.push_str("v_x"),
        Ast::Var(Var::Y) => out.push_str("v_y"),
        Ast::Var(Var::Distance) => out.push_str("v_distance"),
        Ast::Neg(inner) => {
            out.push_str("(-");
            lower_wgsl(inner, out);
            out.push(')');
        }
        Ast::BinOp(op, l, r) => {
            let callee = match op {
                BinOp::Mod => Some("nf_mod"),
                BinOp::Pow => Some("nf_pow"),
                _ => None,
            };
            if let Some(callee) = callee {
                let _ = write!(out, "{}(", callee);
                lower_wgsl(l, out);
                out.push_str(", ");
                lower_wgsl(r, out);
                out.push(')');
                return;
            }
            let sym = match op {
                BinOp::Add => " + ",
                BinOp::Sub => " - ",
                BinOp::Mul => " * ",
                _ => " / ",
            };
            out.push('(');
            lower_wgsl(l, out);
            out.push_str(sym);
            lower_wgsl(r, out);
            out.push(')');
        }
        Ast::Call(func, args) => {
            out.push_str(func.wgsl);
            out.push('(');
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                lower_wgsl(arg, out);
            }
            out.push(')');
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
