//! Árbol sintáctico.
//!
//! El parser construye el árbol con tipos sin resolver (`Type::Void`),
//! excepto donde la sintaxis misma determina el tipo (casts y `sizeof`
//! de un tipo). El análisis semántico completa los tipos en sitio.
//!
//! Todo nodo es dueño exclusivo de sus hijos. `Clone` produce copias
//! profundas; esto se utiliza al reutilizar constantes de enum y al
//! desazucarar asignaciones compuestas.

use crate::{lex::Identifier, source::Location, types::Type};

/// Índice de una variable local dentro de [`Function::locals`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VarId(pub usize);

#[derive(Debug)]
pub struct Program {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,

    /// Literales de cadena únicos, sin terminador. El índice de cada
    /// uno determina su etiqueta.
    pub strings: Vec<Vec<u8>>,

    /// Inicio del archivo principal.
    pub location: Location,
}

#[derive(Debug)]
pub struct Function {
    pub name: Identifier,
    pub ret: Type,
    pub params: Vec<VarId>,
    pub locals: Vec<Var>,

    /// `None` para prototipos.
    pub body: Option<Stmt>,

    /// Bytes de pila para locales, múltiplo de 16.
    pub stack_size: u32,

    pub is_static: bool,
    pub is_variadic: bool,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub struct Var {
    pub name: Identifier,
    pub ty: Type,

    /// Distancia hacia abajo desde `rbp`.
    pub offset: u32,

    pub location: Location,
}

#[derive(Debug)]
pub struct Global {
    pub name: Identifier,
    pub ty: Type,
    pub init: Option<Initializer>,
    pub is_extern: bool,
    pub is_static: bool,
    pub location: Location,
}

/// Imagen inicial de una global.
#[derive(Debug, Clone, Default)]
pub struct Initializer {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

/// Dirección de un símbolo de 8 bytes dentro de una imagen inicial.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub offset: u32,
    pub symbol: String,
    pub addend: i64,
}

/// Etiqueta de un literal de cadena.
pub fn string_label(index: usize) -> String {
    format!(".L.str.{}", index)
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Expr(Expr),
    Return(Option<Expr>),

    If {
        cond: Expr,
        then: Box<Stmt>,
        els: Option<Box<Stmt>>,
    },

    While {
        cond: Expr,
        body: Box<Stmt>,
    },

    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
    },

    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },

    /// `cases` se llena durante análisis semántico.
    Switch {
        cond: Expr,
        body: Box<Stmt>,
        cases: Vec<CaseLabel>,
    },

    Case {
        value: i64,
        label: Option<u32>,
        body: Box<Stmt>,
    },

    Default {
        label: Option<u32>,
        body: Box<Stmt>,
    },

    Break,
    Continue,
    Block(Vec<Stmt>),
    Null,
}

/// Un `case` o `default` registrado en su `switch`.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseLabel {
    /// `None` para `default`.
    pub value: Option<i64>,
    pub label: u32,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Num(i64),
    Str(usize),
    Local(VarId),
    Global(Identifier),

    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,

        /// Ya se escaló un operando por aritmética de punteros.
        scaled: bool,
    },

    Assign {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    Comma(Box<Expr>, Box<Expr>),

    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Box<Expr>,
    },

    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },

    Addr(Box<Expr>),
    Deref(Box<Expr>),

    Member {
        expr: Box<Expr>,
        name: Identifier,
        offset: u32,
    },

    Call {
        name: Identifier,
        args: Vec<Expr>,
    },

    Cast {
        to: Type,
        expr: Box<Expr>,
    },

    Sizeof(Box<Expr>),

    /// `x++` (`op` es `Add`) o `x--` (`Sub`). El análisis semántico lo
    /// reemplaza por asignaciones y un cast al tipo de `x`.
    Postfix {
        op: BinOp,
        expr: Box<Expr>,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    LogAnd,
    LogOr,
}

impl BinOp {
    /// Operadores cuyo resultado es siempre 0 o 1.
    pub fn is_boolean(self) -> bool {
        use BinOp::*;
        matches!(self, Eq | Ne | Lt | Le | LogAnd | LogOr)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

impl Expr {
    /// Un nodo sin tipo resuelto.
    pub fn new(kind: ExprKind, location: Location) -> Self {
        Expr {
            kind,
            ty: Type::Void,
            location,
        }
    }

    pub fn typed(kind: ExprKind, ty: Type, location: Location) -> Self {
        Expr { kind, ty, location }
    }

    pub fn num(value: i64, location: Location) -> Self {
        Expr::new(ExprKind::Num(value), location)
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        let location = Location::span(lhs.location.clone(), &rhs.location);
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                scaled: false,
            },
            location,
        )
    }

    pub fn assign(lhs: Expr, rhs: Expr) -> Self {
        let location = Location::span(lhs.location.clone(), &rhs.location);
        Expr::new(
            ExprKind::Assign {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            location,
        )
    }

    pub fn comma(lhs: Expr, rhs: Expr) -> Self {
        let location = Location::span(lhs.location.clone(), &rhs.location);
        Expr::new(ExprKind::Comma(Box::new(lhs), Box::new(rhs)), location)
    }

    pub fn deref(expr: Expr) -> Self {
        let location = expr.location.clone();
        Expr::new(ExprKind::Deref(Box::new(expr)), location)
    }

    /// Expresiones que designan un objeto en memoria.
    pub fn is_lvalue(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Local(_) | ExprKind::Global(_) | ExprKind::Deref(_) | ExprKind::Member { .. }
        )
    }
}

impl Stmt {
    pub fn new(kind: StmtKind, location: Location) -> Self {
        Stmt { kind, location }
    }
}
