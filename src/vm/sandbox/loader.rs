//! 模块源码解析
//!
//! 每行一条声明：
//!
//! ```text
//! # 注释
//! import "host" for Promise, Timer
//! class Game
//! foreign class Buffer
//! foreign static Storage.load_(_)
//! foreign Buffer.count
//! var p = Promise.new()
//! call Timer.sleep_(10, p)
//! print p.state
//! abort "message"
//! ```
//!
//! 表达式只有字面量、变量和调用（`recv.name`、`recv.name(args)`、`recv.name = value`）。

use crate::bindings::registry::{ClassKey, MethodKey, ModuleDecls};
use crate::core::error::{ScriptError, ScriptResult};
use crate::vm::signature_arity;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Var(String),
    Call {
        receiver: Box<Expr>,
        name: String,
        /// `None` 表示 getter
        args: Option<Vec<Expr>>,
    },
    Setter {
        receiver: Box<Expr>,
        name: String,
        value: Box<Expr>,
    },
}

impl Expr {
    /// 调用表达式对应的方法签名
    pub fn signature(name: &str, args: Option<&[Expr]>) -> String {
        match args {
            None => name.to_string(),
            Some(args) => format!("{}({})", name, vec!["_"; args.len()].join(",")),
        }
    }

    fn visit_vars<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Literal(_) => {}
            Self::Var(name) => out.push(name),
            Self::Call { receiver, args, .. } => {
                receiver.visit_vars(out);
                for arg in args.iter().flatten() {
                    arg.visit_vars(out);
                }
            }
            Self::Setter {
                receiver, value, ..
            } => {
                receiver.visit_vars(out);
                value.visit_vars(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Import {
        module: String,
        names: Vec<String>,
    },
    Class(String),
    ForeignClass(String),
    Foreign {
        class: String,
        is_static: bool,
        signature: String,
    },
    Var {
        name: String,
        value: Expr,
    },
    Call(Expr),
    Print(Expr),
    Abort(Expr),
}

impl Stmt {
    /// 语句读取的变量
    pub fn referenced_vars(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match self {
            Self::Var { value: expr, .. } | Self::Call(expr) | Self::Print(expr) | Self::Abort(expr) => {
                expr.visit_vars(&mut out)
            }
            Self::Foreign { class, .. } => out.push(class),
            _ => {}
        }
        out
    }

    /// 语句定义的模块变量
    pub fn defined_vars(&self) -> Vec<&str> {
        match self {
            Self::Import { names, .. } => names.iter().map(String::as_str).collect(),
            Self::Class(name) | Self::ForeignClass(name) | Self::Var { name, .. } => vec![name],
            _ => Vec::new(),
        }
    }
}

/// 带行号的语句
#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub number: u32,
    pub stmt: Stmt,
}

/// 解析整个模块
pub fn parse(module: &str, source: &str) -> ScriptResult<Vec<Line>> {
    let mut lines = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let number = index as u32 + 1;
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let stmt = parse_stmt(text).map_err(|message| ScriptError::Compilation {
            module: module.to_string(),
            line: number,
            message,
        })?;
        lines.push(Line { number, stmt });
    }
    Ok(lines)
}

/// 收集模块声明的外部类与外部方法
pub fn declarations(module: &str, source: &str) -> ScriptResult<ModuleDecls> {
    Ok(declarations_of(module, &parse(module, source)?))
}

pub fn declarations_of(module: &str, lines: &[Line]) -> ModuleDecls {
    let mut decls = ModuleDecls::new(module);
    for line in lines {
        match &line.stmt {
            Stmt::ForeignClass(class) => decls.classes.push(ClassKey::new(module, class)),
            Stmt::Foreign {
                class,
                is_static,
                signature,
            } => decls
                .methods
                .push(MethodKey::new(module, class, *is_static, signature)),
            _ => {}
        }
    }
    decls
}

fn parse_stmt(text: &str) -> Result<Stmt, String> {
    let (keyword, rest) = match text.find(char::is_whitespace) {
        Some(pos) => (&text[..pos], text[pos..].trim()),
        None => (text, ""),
    };

    match keyword {
        "import" => parse_import(rest),
        "class" => Ok(Stmt::Class(parse_name(rest)?)),
        "foreign" => parse_foreign(rest),
        "var" => {
            let (name, value) = rest
                .split_once('=')
                .ok_or_else(|| "expected '=' after variable name".to_string())?;
            Ok(Stmt::Var {
                name: parse_name(name.trim())?,
                value: parse_expr(value)?,
            })
        }
        "call" => Ok(Stmt::Call(parse_expr(rest)?)),
        "print" => Ok(Stmt::Print(parse_expr(rest)?)),
        "abort" => Ok(Stmt::Abort(parse_expr(rest)?)),
        other => Err(format!("unexpected statement '{}'", other)),
    }
}

fn parse_name(text: &str) -> Result<String, String> {
    let valid = !text.is_empty()
        && !text.starts_with(|c: char| c.is_ascii_digit())
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid && !is_keyword(text) {
        Ok(text.to_string())
    } else {
        Err(format!("expected a name, found '{}'", text))
    }
}

fn is_keyword(text: &str) -> bool {
    matches!(
        text,
        "null" | "true" | "false" | "nan" | "infinity" | "var" | "class" | "foreign" | "static" | "import" | "for"
    )
}

fn parse_import(rest: &str) -> Result<Stmt, String> {
    let mut tokens = Lexer::new(rest).tokenize()?.into_iter();
    let module = match tokens.next() {
        Some(Token::Str(module)) => module,
        _ => return Err("expected a module name string after 'import'".to_string()),
    };
    let mut names = Vec::new();
    match tokens.next() {
        None => {}
        Some(Token::Ident(word)) if word == "for" => loop {
            match tokens.next() {
                Some(Token::Ident(name)) if !is_keyword(&name) => names.push(name),
                _ => return Err("expected a variable name to import".to_string()),
            }
            match tokens.next() {
                None => break,
                Some(Token::Comma) => continue,
                _ => return Err("expected ',' between imported names".to_string()),
            }
        },
        _ => return Err("expected 'for' after module name".to_string()),
    }
    Ok(Stmt::Import { module, names })
}

fn parse_foreign(rest: &str) -> Result<Stmt, String> {
    if let Some(name) = rest.strip_prefix("class ") {
        return Ok(Stmt::ForeignClass(parse_name(name.trim())?));
    }
    let (is_static, decl) = match rest.strip_prefix("static ") {
        Some(decl) => (true, decl.trim()),
        None => (false, rest),
    };
    let (class, signature) = decl
        .split_once('.')
        .ok_or_else(|| format!("expected 'Class.signature', found '{}'", decl))?;
    let signature = signature.trim();
    signature_arity(signature).map_err(|e| e.to_string())?;
    Ok(Stmt::Foreign {
        class: parse_name(class.trim())?,
        is_static,
        signature: signature.to_string(),
    })
}

/// 解析单个表达式
pub fn parse_expr(text: &str) -> Result<Expr, String> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("unexpected {:?} after expression", token)),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Num(f64),
    Str(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Eq,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.chars.peek() {
            match c {
                ' ' | '\t' => {
                    self.chars.next();
                }
                '.' => {
                    self.chars.next();
                    tokens.push(Token::Dot);
                }
                ',' => {
                    self.chars.next();
                    tokens.push(Token::Comma);
                }
                '(' => {
                    self.chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    tokens.push(Token::RParen);
                }
                '=' => {
                    self.chars.next();
                    tokens.push(Token::Eq);
                }
                '"' => {
                    self.chars.next();
                    tokens.push(Token::Str(self.string()?));
                }
                c if c == '-' || c.is_ascii_digit() => tokens.push(Token::Num(self.number()?)),
                c if c.is_ascii_alphabetic() || c == '_' => tokens.push(Token::Ident(self.ident())),
                other => return Err(format!("unexpected character '{}'", other)),
            }
        }
        Ok(tokens)
    }

    fn string(&mut self) -> Result<String, String> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err("unterminated string".to_string()),
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('0') => out.push('\0'),
                    other => return Err(format!("invalid escape {:?}", other)),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<f64, String> {
        let mut text = String::new();
        if self.chars.peek() == Some(&'-') {
            text.push('-');
            self.chars.next();
        }
        while let Some(&c) = self.chars.peek() {
            let exponent_sign = (c == '-' || c == '+') && text.ends_with(['e', 'E']);
            if c.is_ascii_alphanumeric() || exponent_sign || (c == '.' && !text.contains('.')) {
                // `1.foo` 是对数字的调用
                if c == '.' {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    if !ahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                        break;
                    }
                }
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        match text.as_str() {
            "-infinity" => Ok(f64::NEG_INFINITY),
            _ => text
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .ok_or_else(|| format!("invalid number literal '{}'", text)),
        }
    }

    fn ident(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                out.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        out
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(format!("expected {:?}, found {:?}", expected, other)),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        while self.peek() == Some(&Token::Dot) {
            self.next();
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                other => return Err(format!("expected a method name, found {:?}", other)),
            };
            match self.peek() {
                Some(Token::LParen) => {
                    self.next();
                    let args = self.args()?;
                    expr = Expr::Call {
                        receiver: Box::new(expr),
                        name,
                        args: Some(args),
                    };
                }
                Some(Token::Eq) => {
                    self.next();
                    let value = self.expr()?;
                    return Ok(Expr::Setter {
                        receiver: Box::new(expr),
                        name,
                        value: Box::new(value),
                    });
                }
                _ => {
                    expr = Expr::Call {
                        receiver: Box::new(expr),
                        name,
                        args: None,
                    };
                }
            }
        }
        Ok(expr)
    }

    fn args(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => return Err(format!("expected ',' or ')', found {:?}", other)),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(Literal::Num(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Literal::Str(s))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "null" => Expr::Literal(Literal::Null),
                "true" => Expr::Literal(Literal::Bool(true)),
                "false" => Expr::Literal(Literal::Bool(false)),
                "nan" => Expr::Literal(Literal::Num(f64::NAN)),
                "infinity" => Expr::Literal(Literal::Num(f64::INFINITY)),
                _ => Expr::Var(word),
            }),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(token) => Err(format!("unexpected {:?}", token)),
            None => Err("expected an expression".to_string()),
        }
    }
}
