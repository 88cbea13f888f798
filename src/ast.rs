//! Input AST for the backend
//!
//! Produced by an external C-subset frontend and handed over either in memory
//! or as JSON. Node kinds are tagged with a `kind` field in JSON:
//!
//! ```json
//! {"kind": "return", "value": {"kind": "int_literal", "value": 42}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// A whole translation unit: every function the program has
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TranslationUnit {
    pub functions: Vec<FunctionDef>,
}

impl TranslationUnit {
    pub fn new(functions: Vec<FunctionDef>) -> Self {
        Self { functions }
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub span: Span,
}

impl FunctionDef {
    pub fn new(name: impl Into<String>, params: &[&str], body: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            params: params.iter().map(|p| Param::new(*p)).collect(),
            body,
            span: Span::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub span: Span,
}

impl Param {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            span: Span::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Stmt {
    Expr {
        expr: Expr,
    },
    /// `int name = init;`
    Decl {
        name: String,
        init: Option<Expr>,
        #[serde(default)]
        span: Span,
    },
    Block {
        stmts: Vec<Stmt>,
    },
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Return {
        value: Option<Expr>,
        #[serde(default)]
        span: Span,
    },
    Break {
        #[serde(default)]
        span: Span,
    },
    Continue {
        #[serde(default)]
        span: Span,
    },
}

impl Stmt {
    pub fn expr(expr: Expr) -> Stmt {
        Stmt::Expr { expr }
    }

    pub fn decl(name: impl Into<String>, init: Option<Expr>) -> Stmt {
        Stmt::Decl {
            name: name.into(),
            init,
            span: Span::default(),
        }
    }

    pub fn block(stmts: Vec<Stmt>) -> Stmt {
        Stmt::Block { stmts }
    }

    pub fn if_(cond: Expr, then_branch: Stmt, else_branch: Option<Stmt>) -> Stmt {
        Stmt::If {
            cond,
            then_branch: Box::new(then_branch),
            else_branch: else_branch.map(Box::new),
        }
    }

    pub fn while_(cond: Expr, body: Stmt) -> Stmt {
        Stmt::While {
            cond,
            body: Box::new(body),
        }
    }

    pub fn for_(init: Option<Stmt>, cond: Option<Expr>, step: Option<Expr>, body: Stmt) -> Stmt {
        Stmt::For {
            init: init.map(Box::new),
            cond,
            step,
            body: Box::new(body),
        }
    }

    pub fn ret(value: Expr) -> Stmt {
        Stmt::Return {
            value: Some(value),
            span: Span::default(),
        }
    }

    pub fn ret_void() -> Stmt {
        Stmt::Return {
            value: None,
            span: Span::default(),
        }
    }

    pub fn break_() -> Stmt {
        Stmt::Break {
            span: Span::default(),
        }
    }

    pub fn continue_() -> Stmt {
        Stmt::Continue {
            span: Span::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    IntLiteral {
        value: i64,
    },
    Ident {
        name: String,
        #[serde(default)]
        span: Span,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        #[serde(default)]
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        #[serde(default)]
        span: Span,
    },
    /// `name = value`; evaluates to the stored value
    Assign {
        name: String,
        value: Box<Expr>,
        #[serde(default)]
        span: Span,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
        #[serde(default)]
        span: Span,
    },
}

impl Expr {
    pub fn int(value: i64) -> Expr {
        Expr::IntLiteral { value }
    }

    pub fn ident(name: impl Into<String>) -> Expr {
        Expr::Ident {
            name: name.into(),
            span: Span::default(),
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            span: Span::default(),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Expr::Unary {
            op,
            operand: Box::new(operand),
            span: Span::default(),
        }
    }

    pub fn assign(name: impl Into<String>, value: Expr) -> Expr {
        Expr::Assign {
            name: name.into(),
            value: Box::new(value),
            span: Span::default(),
        }
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: callee.into(),
            args,
            span: Span::default(),
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Expr::IntLiteral { .. } => None,
            Expr::Ident { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Assign { span, .. }
            | Expr::Call { span, .. } => Some(*span),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    LogicalAnd,
    LogicalOr,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::LogicalAnd => "&&",
            BinaryOp::LogicalOr => "||",
        };
        write!(f, "{}", op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    /// Logical `!`
    Not,
    /// Bitwise `~`
    BitNot,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
        };
        write!(f, "{}", op)
    }
}

/// Source position (1-based); `0:0` when unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_input_shape() {
        let json = r#"{
            "functions": [{
                "name": "main",
                "body": [
                    {"kind": "decl", "name": "x", "init": {"kind": "int_literal", "value": 2}},
                    {"kind": "return", "value": {
                        "kind": "binary", "op": "mul",
                        "lhs": {"kind": "ident", "name": "x", "span": {"line": 3, "column": 12}},
                        "rhs": {"kind": "int_literal", "value": 21}
                    }}
                ]
            }]
        }"#;
        let unit: TranslationUnit = serde_json::from_str(json).unwrap();
        let main = unit.function("main").unwrap();
        assert!(main.params.is_empty());
        assert_eq!(
            main.body[1],
            Stmt::Return {
                value: Some(Expr::Binary {
                    op: BinaryOp::Mul,
                    lhs: Box::new(Expr::Ident {
                        name: "x".into(),
                        span: Span::new(3, 12),
                    }),
                    rhs: Box::new(Expr::int(21)),
                    span: Span::default(),
                }),
                span: Span::default(),
            }
        );
    }

    #[test]
    fn test_builders_match_json() {
        let built = TranslationUnit::new(vec![FunctionDef::new(
            "main",
            &[],
            vec![Stmt::while_(
                Expr::binary(BinaryOp::Lt, Expr::ident("i"), Expr::int(5)),
                Stmt::block(vec![Stmt::break_()]),
            )],
        )]);
        let json = serde_json::to_string(&built).unwrap();
        assert!(json.contains(r#""kind":"while""#));
        assert!(json.contains(r#""op":"lt""#));
        let back: TranslationUnit = serde_json::from_str(&json).unwrap();
        assert_eq!(back, built);
    }

    #[test]
    fn test_operator_display() {
        assert_eq!(BinaryOp::Shl.to_string(), "<<");
        assert_eq!(BinaryOp::LogicalOr.to_string(), "||");
        assert_eq!(UnaryOp::BitNot.to_string(), "~");
        assert_eq!(Span::new(4, 2).to_string(), "4:2");
    }
}
