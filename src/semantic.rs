//! Análisis semántico.
//!
//! Recorre el AST completando en sitio el tipo de cada expresión,
//! reescribe aritmética de punteros en términos de aritmética entera y
//! dispone el stack frame de cada función. Un segundo recorrido sobre un
//! árbol ya anotado no altera ningún tipo.

use crate::{
    ast::{BinOp, CaseLabel, Expr, ExprKind, Function, Program, Stmt, StmtKind, UnOp, Var},
    arch::x86_64::Arg,
    lex::Identifier,
    source::{Located, Location},
    types::{align_to, Type, MAX_OBJECT_SIZE},
};

use std::collections::HashMap;
use thiserror::Error;

pub type Semantic<T> = Result<T, Located<SemanticError>>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SemanticError {
    #[error("Type mismatch: invalid operands `{0}` and `{1}`")]
    InvalidOperands(Type, Type),

    #[error("Type mismatch: invalid operand `{0}`")]
    InvalidOperand(Type),

    #[error("Type mismatch: cannot assign `{1}` to `{0}`")]
    IncompatibleAssignment(Type, Type),

    #[error("Expression is not assignable")]
    NotAssignable,

    #[error("Cannot take the address of this expression")]
    NotAddressable,

    #[error("Cannot dereference `{0}`")]
    NotPointer(Type),

    #[error("Type `{0}` has no field named `{1}`")]
    NoSuchField(Type, Identifier),

    #[error("Expression has incomplete type `{0}`")]
    IncompleteType(Type),

    #[error("Void value not ignored as it ought to be")]
    VoidValue,

    #[error("Cannot cast `{0}` to `{1}`")]
    InvalidCast(Type, Type),

    #[error("Symbol `{0}` is undefined")]
    Undefined(Identifier),

    #[error("Function `{0}` is undefined")]
    UndefinedFunction(Identifier),

    #[error("Function `{name}` expects {expected} arguments, found {found}")]
    ArityMismatch {
        name: Identifier,
        expected: usize,
        found: usize,
    },

    #[error("At most {} arguments are supported, found {0}", Arg::MAX_ARGS)]
    TooManyArguments(usize),

    #[error("At most {} parameters are supported, found {0}", Arg::MAX_ARGS)]
    TooManyParameters(usize),

    #[error("Structs cannot be passed or returned by value")]
    StructByValue,

    #[error("Duplicate case value `{0}`")]
    DuplicateCase(i64),

    #[error("Multiple default labels in one switch")]
    DuplicateDefault,

    #[error("Case label not within a switch statement")]
    StrayCase,

    #[error("`break` statement not within a loop or switch")]
    StrayBreak,

    #[error("`continue` statement not within a loop")]
    StrayContinue,

    #[error("Stack frame of `{0}` exceeds {} bytes", MAX_OBJECT_SIZE)]
    FrameTooLarge(Identifier),
}

/// Anota tipos y dispone stack frames en todo el programa.
///
/// Con `implicit_decls`, una llamada a una función no declarada se
/// asume de tipo `int` en vez de fallar.
pub fn analyze(program: &mut Program, implicit_decls: bool) -> Semantic<()> {
    let mut scope = GlobalScope {
        functions: HashMap::new(),
        globals: program
            .globals
            .iter()
            .map(|global| (global.name.clone(), global.ty.clone()))
            .collect(),

        strings: program.strings.iter().map(Vec::len).collect(),
        implicit_decls,
    };

    for function in &mut program.functions {
        // Registrar antes del cuerpo permite recursión
        scope.functions.insert(
            function.name.clone(),
            Signature {
                ret: function.ret.clone(),
                params: function.params.len(),
                is_variadic: function.is_variadic,
            },
        );

        scope.function(function)?;
    }

    Ok(())
}

struct Signature {
    ret: Type,
    params: usize,
    is_variadic: bool,
}

struct GlobalScope {
    functions: HashMap<Identifier, Signature>,
    globals: HashMap<Identifier, Type>,

    /// Longitud de cada literal de cadena.
    strings: Vec<usize>,

    implicit_decls: bool,
}

impl GlobalScope {
    fn function(&self, function: &mut Function) -> Semantic<()> {
        let location = function.location.clone();

        if function.params.len() > Arg::MAX_ARGS {
            let error = SemanticError::TooManyParameters(function.params.len());
            return Err(Located::at(error, location));
        }

        let by_value = function.ret.is_struct()
            || function
                .params
                .iter()
                .any(|param| function.locals[param.0].ty.is_struct());

        if by_value {
            return Err(Located::at(SemanticError::StructByValue, location));
        }

        layout_frame(function)?;

        let body = match &mut function.body {
            Some(body) => body,
            None => return Ok(()),
        };

        let mut walker = Walker {
            scope: self,
            locals: &function.locals,
            switches: Vec::new(),
            next_label: 0,
            loops: 0,
            breakables: 0,
        };

        walker.stmt(body)?;
        log::debug!(
            "function `{}`: frame of {} bytes",
            function.name,
            function.stack_size
        );

        Ok(())
    }
}

/// Asigna a cada local su distancia desde `rbp`, alineada a su tipo.
fn layout_frame(function: &mut Function) -> Semantic<()> {
    let mut offset: u32 = 0;
    for var in &mut function.locals {
        offset = match offset.checked_add(var.ty.size()) {
            Some(end) if end <= MAX_OBJECT_SIZE - 16 => align_to(end, var.ty.align()),
            _ => {
                let error = SemanticError::FrameTooLarge(function.name.clone());
                return Err(Located::at(error, function.location.clone()));
            }
        };

        var.offset = offset;
    }

    function.stack_size = align_to(offset, 16);
    Ok(())
}

struct Walker<'a> {
    scope: &'a GlobalScope,
    locals: &'a [Var],

    /// Casos encontrados en cada `switch` activo, de afuera hacia adentro.
    switches: Vec<Vec<CaseLabel>>,

    next_label: u32,
    loops: u32,

    /// Ciclos y `switch` que encierran al punto actual.
    breakables: u32,
}

impl Walker<'_> {
    fn stmt(&mut self, stmt: &mut Stmt) -> Semantic<()> {
        let location = &stmt.location;

        match &mut stmt.kind {
            StmtKind::Expr(expr) => self.expr(expr),

            StmtKind::Return(value) => match value {
                Some(value) => {
                    self.expr(value)?;

                    let error = match &value.ty {
                        Type::Void => SemanticError::VoidValue,
                        Type::Struct(_) => SemanticError::StructByValue,
                        _ => return Ok(()),
                    };

                    Err(Located::at(error, value.location.clone()))
                }

                None => Ok(()),
            },

            StmtKind::If { cond, then, els } => {
                self.condition(cond)?;
                self.stmt(then)?;

                match els {
                    Some(els) => self.stmt(els),
                    None => Ok(()),
                }
            }

            StmtKind::While { cond, body } | StmtKind::DoWhile { body, cond } => {
                self.condition(cond)?;
                self.looped(body)
            }

            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }

                if let Some(cond) = cond {
                    self.condition(cond)?;
                }

                if let Some(step) = step {
                    self.expr(step)?;
                }

                self.looped(body)
            }

            StmtKind::Switch { cond, body, cases } => {
                self.condition(cond)?;

                self.switches.push(Vec::new());
                self.breakables += 1;
                let result = self.stmt(body);
                self.breakables -= 1;

                let collected = self.switches.pop().unwrap_or_default();
                result?;

                *cases = collected;
                Ok(())
            }

            StmtKind::Case { value, label, body } => {
                let case = CaseLabel {
                    value: Some(*value),
                    label: self.label(label),
                };

                self.register_case(case, location)?;
                self.stmt(body)
            }

            StmtKind::Default { label, body } => {
                let case = CaseLabel {
                    value: None,
                    label: self.label(label),
                };

                self.register_case(case, location)?;
                self.stmt(body)
            }

            StmtKind::Break if self.breakables == 0 => {
                Err(Located::at(SemanticError::StrayBreak, location.clone()))
            }

            StmtKind::Continue if self.loops == 0 => {
                Err(Located::at(SemanticError::StrayContinue, location.clone()))
            }

            StmtKind::Block(stmts) => stmts.iter_mut().try_for_each(|stmt| self.stmt(stmt)),
            StmtKind::Break | StmtKind::Continue | StmtKind::Null => Ok(()),
        }
    }

    fn looped(&mut self, body: &mut Stmt) -> Semantic<()> {
        self.loops += 1;
        self.breakables += 1;
        let result = self.stmt(body);
        self.loops -= 1;
        self.breakables -= 1;

        result
    }

    /// Etiqueta de un `case`; se conserva si ya fue asignada.
    fn label(&mut self, label: &mut Option<u32>) -> u32 {
        match label {
            Some(label) => {
                self.next_label = self.next_label.max(*label + 1);
                *label
            }

            None => {
                let id = self.next_label;
                self.next_label += 1;
                *label = Some(id);

                id
            }
        }
    }

    fn register_case(&mut self, case: CaseLabel, location: &Location) -> Semantic<()> {
        let switch = match self.switches.last_mut() {
            Some(switch) => switch,
            None => return Err(Located::at(SemanticError::StrayCase, location.clone())),
        };

        if switch.iter().any(|other| other.value == case.value) {
            let error = match case.value {
                Some(value) => SemanticError::DuplicateCase(value),
                None => SemanticError::DuplicateDefault,
            };

            return Err(Located::at(error, location.clone()));
        }

        switch.push(case);
        Ok(())
    }

    /// Una expresión evaluada por su valor de verdad.
    fn condition(&mut self, cond: &mut Expr) -> Semantic<()> {
        self.expr(cond)?;
        scalar(cond)
    }

    fn expr(&mut self, expr: &mut Expr) -> Semantic<()> {
        match expr.kind {
            ExprKind::Binary { .. } => return self.binary(expr),
            ExprKind::Postfix { .. } => return self.postfix(expr),
            _ => (),
        }

        let location = expr.location.clone();
        let fail = |error| Err(Located::at(error, location.clone()));

        let mut folded = None;
        let ty = match &mut expr.kind {
            ExprKind::Num(value) => match expr.ty {
                Type::Void if i32::try_from(*value).is_ok() => Type::Int,
                Type::Void => Type::Long,
                ref ty => ty.clone(),
            },

            ExprKind::Str(index) => {
                let length = self.scope.strings.get(*index).copied().unwrap_or(0);
                Type::Char.array_of(length as u32 + 1)
            }

            ExprKind::Local(id) => self.locals[id.0].ty.clone(),

            ExprKind::Global(name) => match self.scope.globals.get(&*name) {
                Some(ty) => ty.clone(),
                None => return fail(SemanticError::Undefined(name.clone())),
            },

            ExprKind::Assign { lhs, rhs } => {
                self.expr(lhs)?;
                self.expr(rhs)?;

                if !lhs.is_lvalue() || lhs.ty.is_aggregate() {
                    return fail(SemanticError::NotAssignable);
                } else if rhs.ty.is_void() {
                    return fail(SemanticError::VoidValue);
                } else if lhs.ty.is_struct() || rhs.ty.is_struct() {
                    let error = SemanticError::IncompatibleAssignment(lhs.ty.clone(), rhs.ty.clone());
                    return fail(error);
                }

                // El valor es el que quedó almacenado
                lhs.ty.clone()
            }

            ExprKind::Comma(lhs, rhs) => {
                self.expr(lhs)?;
                self.expr(rhs)?;

                rhs.ty.decay()
            }

            ExprKind::Cond { cond, then, els } => {
                self.condition(cond)?;
                self.expr(then)?;
                self.expr(els)?;

                match (&then.ty, &els.ty) {
                    (Type::Void, Type::Void) => Type::Void,
                    (then, els) if then.is_pointer() || els.is_pointer() => {
                        let (pointer, other) = if then.is_pointer() { (then, els) } else { (els, then) };
                        if !other.is_integer() && !other.is_pointer() {
                            return fail(SemanticError::InvalidOperand(other.clone()));
                        }

                        pointer.decay()
                    }

                    (then, els) if then.is_integer() && els.is_integer() => wider(then, els),
                    (then, els) => {
                        return fail(SemanticError::InvalidOperands(then.clone(), els.clone()))
                    }
                }
            }

            ExprKind::Unary { op, expr: operand } => {
                self.expr(operand)?;
                match op {
                    UnOp::Not => {
                        scalar(operand)?;
                        Type::Int
                    }

                    UnOp::Neg | UnOp::BitNot if operand.ty.is_integer() => operand.ty.promote(),
                    UnOp::Neg | UnOp::BitNot => {
                        return fail(SemanticError::InvalidOperand(operand.ty.clone()))
                    }
                }
            }

            ExprKind::Addr(operand) => {
                self.expr(operand)?;
                if !operand.is_lvalue() {
                    return fail(SemanticError::NotAddressable);
                }

                operand.ty.clone().pointer_to()
            }

            ExprKind::Deref(operand) => {
                self.expr(operand)?;
                match operand.ty.pointee() {
                    Some(pointee) if !pointee.is_void() => pointee.clone(),
                    _ => return fail(SemanticError::NotPointer(operand.ty.clone())),
                }
            }

            ExprKind::Member {
                expr: aggregate,
                name,
                offset,
            } => {
                self.expr(aggregate)?;

                let field = match &aggregate.ty {
                    Type::Struct(ty) => ty.field(name.as_ref()),
                    _ => None,
                };

                match field {
                    Some(field) => {
                        *offset = field.offset;
                        field.ty
                    }

                    None => {
                        let error = SemanticError::NoSuchField(aggregate.ty.clone(), name.clone());
                        return fail(error);
                    }
                }
            }

            ExprKind::Call { name, args } => {
                for arg in args.iter_mut() {
                    self.expr(arg)?;
                    if arg.ty.is_struct() {
                        return Err(Located::at(SemanticError::StructByValue, arg.location.clone()));
                    } else if arg.ty.is_void() {
                        return Err(Located::at(SemanticError::VoidValue, arg.location.clone()));
                    }
                }

                if args.len() > Arg::MAX_ARGS {
                    return fail(SemanticError::TooManyArguments(args.len()));
                }

                match self.scope.functions.get(&*name) {
                    Some(signature) => {
                        let arity_ok = if signature.is_variadic {
                            args.len() >= signature.params
                        } else {
                            args.len() == signature.params
                        };

                        if !arity_ok {
                            return fail(SemanticError::ArityMismatch {
                                name: name.clone(),
                                expected: signature.params,
                                found: args.len(),
                            });
                        }

                        signature.ret.clone()
                    }

                    None if self.scope.implicit_decls => {
                        log::warn!("{}: implicit declaration of function `{}`", location, name);
                        Type::Int
                    }

                    None => return fail(SemanticError::UndefinedFunction(name.clone())),
                }
            }

            ExprKind::Cast { to, expr: operand } => {
                self.expr(operand)?;
                if to.is_aggregate() || operand.ty.is_struct() {
                    return fail(SemanticError::InvalidCast(operand.ty.clone(), to.clone()));
                }

                to.clone()
            }

            ExprKind::Sizeof(operand) => {
                self.expr(operand)?;
                if !operand.ty.is_complete() {
                    return fail(SemanticError::IncompleteType(operand.ty.clone()));
                }

                folded = Some(operand.ty.size() as i64);
                Type::Long
            }

            ExprKind::Binary { .. } | ExprKind::Postfix { .. } => unreachable!(),
        };

        match folded {
            Some(size) => *expr = Expr::typed(ExprKind::Num(size), ty, location),
            None => expr.ty = ty,
        }

        Ok(())
    }

    fn binary(&mut self, expr: &mut Expr) -> Semantic<()> {
        let location = expr.location.clone();
        let (op, lhs, rhs, scaled) = match &mut expr.kind {
            ExprKind::Binary {
                op,
                lhs,
                rhs,
                scaled,
            } => (*op, lhs, rhs, scaled),

            _ => return Ok(()),
        };

        self.expr(lhs)?;
        self.expr(rhs)?;
        operand(lhs)?;
        operand(rhs)?;

        let invalid = || {
            let error = SemanticError::InvalidOperands(lhs.ty.clone(), rhs.ty.clone());
            Err(Located::at(error, location.clone()))
        };

        let (left_pointer, right_pointer) = (lhs.ty.is_pointer(), rhs.ty.is_pointer());
        let additive = matches!(op, BinOp::Add | BinOp::Sub);

        if !additive || !(left_pointer || right_pointer) {
            expr.ty = match op {
                _ if op.is_boolean() => Type::Int,
                BinOp::Shl | BinOp::Shr => lhs.ty.promote(),
                _ => wider(&lhs.ty, &rhs.ty),
            };

            return Ok(());
        }

        let ty = match (op, left_pointer, right_pointer) {
            (BinOp::Add, true, true) | (BinOp::Sub, false, true) => return invalid(),
            (BinOp::Sub, true, true) => Type::Long,
            (_, true, false) => lhs.ty.decay(),
            _ => rhs.ty.decay(),
        };

        // Tamaño del elemento al que apunta el operando puntero
        let pointer = if left_pointer { &lhs.ty } else { &rhs.ty };
        let element = match pointer.pointee() {
            Some(Type::Void) => 1,
            Some(pointee) if pointee.is_complete() => pointee.size(),
            _ => return Err(Located::at(SemanticError::IncompleteType(pointer.clone()), location)),
        };

        let difference = left_pointer && right_pointer;
        let first_walk = !*scaled;
        if first_walk {
            *scaled = true;

            if !difference {
                let offset = if left_pointer { rhs } else { lhs };
                self.scale(offset, element)?;
            }
        }

        expr.ty = ty;

        if difference && first_walk {
            // `p - q` cuenta elementos, no bytes
            let bytes = std::mem::replace(expr, Expr::num(0, location.clone()));
            let size = Expr::typed(ExprKind::Num(element as i64), Type::Long, location.clone());

            let kind = ExprKind::Binary {
                op: BinOp::Div,
                lhs: Box::new(bytes),
                rhs: Box::new(size),
                scaled: false,
            };

            *expr = Expr::typed(kind, Type::Long, location);
        }

        Ok(())
    }

    /// `x++` es `(x = x + 1, (T)(x - 1))`, donde `T` es el tipo de `x`.
    /// El cast recupera el valor anterior aun si el almacenamiento
    /// truncó el nuevo.
    fn postfix(&mut self, expr: &mut Expr) -> Semantic<()> {
        let location = expr.location.clone();
        let (op, target) = match &mut expr.kind {
            ExprKind::Postfix { op, expr: target } => {
                let target = std::mem::replace(target.as_mut(), Expr::num(0, location.clone()));
                (*op, target)
            }

            _ => return Ok(()),
        };

        let mut typed = target.clone();
        self.expr(&mut typed)?;

        let undo = if op == BinOp::Add { BinOp::Sub } else { BinOp::Add };
        let one = || Expr::num(1, location.clone());

        let update = Expr::assign(target.clone(), Expr::binary(op, target.clone(), one()));
        let previous = ExprKind::Cast {
            to: typed.ty,
            expr: Box::new(Expr::binary(undo, target, one())),
        };

        *expr = Expr::comma(update, Expr::new(previous, location));
        self.expr(expr)
    }

    /// Reemplaza `offset` por `offset * size`.
    fn scale(&mut self, offset: &mut Box<Expr>, size: u32) -> Semantic<()> {
        if size == 1 {
            return Ok(());
        }

        let location = offset.location.clone();
        let factor = Expr::typed(ExprKind::Num(size as i64), Type::Long, location.clone());
        let original = std::mem::replace(offset.as_mut(), Expr::num(0, location));

        **offset = Expr::binary(BinOp::Mul, original, factor);
        self.expr(offset)
    }
}

/// El tipo más ancho entre dos operandos; en empate gana el izquierdo.
fn wider(lhs: &Type, rhs: &Type) -> Type {
    if rhs.size() > lhs.size() {
        rhs.promote()
    } else {
        lhs.promote()
    }
}

/// Operandos válidos para operadores aritméticos y de comparación.
fn operand(expr: &Expr) -> Semantic<()> {
    match &expr.ty {
        ty if ty.is_integer() || ty.is_pointer() => Ok(()),
        Type::Void => Err(Located::at(SemanticError::VoidValue, expr.location.clone())),
        ty => Err(Located::at(
            SemanticError::InvalidOperand(ty.clone()),
            expr.location.clone(),
        )),
    }
}

fn scalar(expr: &Expr) -> Semantic<()> {
    operand(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lex::Lexer, parse::parse, source::Source};
    use std::rc::Rc;

    fn analyze_text(text: &str, implicit_decls: bool) -> Semantic<Program> {
        let source = Source::new("test.c", text);
        let tokens = Lexer::new(Rc::clone(&source)).tokenize().unwrap();
        let mut program = parse(&source, &tokens).unwrap();

        analyze(&mut program, implicit_decls)?;
        Ok(program)
    }

    fn program(text: &str) -> Program {
        analyze_text(text, false).expect("analysis failed")
    }

    fn fail(text: &str) -> SemanticError {
        analyze_text(text, false)
            .expect_err("analysis should fail")
            .into_inner()
    }

    fn returned(program: &Program) -> &Expr {
        let body = program.functions.last().and_then(|f| f.body.as_ref()).unwrap();
        match &body.kind {
            StmtKind::Block(stmts) => match &stmts.last().unwrap().kind {
                StmtKind::Return(Some(expr)) => expr,
                other => panic!("{:?}", other),
            },

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn widest_operand_wins() {
        let cases = [
            ("char a; long b; return a + b;", Type::Long),
            ("long a; char b; return a * b;", Type::Long),
            ("char a; char b; return a - b;", Type::Int),
            ("int a; long b; return a < b;", Type::Int),
            ("char a; return -a;", Type::Int),
            ("long a; return a << 2;", Type::Long),
        ];

        for (body, expected) in cases.iter() {
            let program = program(&format!("int main() {{ {} }}", body));
            assert_eq!(returned(&program).ty, *expected, "{}", body);
        }
    }

    #[test]
    fn pointer_arithmetic_is_scaled() {
        let program = program("int main() { long *p; return *(p + 2); }");

        match &returned(&program).kind {
            ExprKind::Deref(inner) => {
                assert_eq!(inner.ty, Type::Long.pointer_to());
                match &inner.kind {
                    ExprKind::Binary { rhs, scaled, .. } => {
                        assert!(*scaled);
                        match &rhs.kind {
                            ExprKind::Binary { op: BinOp::Mul, rhs, .. } => {
                                assert!(matches!(rhs.kind, ExprKind::Num(8)))
                            }

                            other => panic!("{:?}", other),
                        }
                    }

                    other => panic!("{:?}", other),
                }
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn array_operand_decays_without_mutation() {
        let program = program("int main() { int a[3]; return a + 1 == a; }");
        let main = &program.functions[0];

        assert_eq!(main.locals[0].ty, Type::Int.array_of(3));
        match &returned(&program).kind {
            ExprKind::Binary { lhs, .. } => assert_eq!(lhs.ty, Type::Int.pointer_to()),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn pointer_difference_counts_elements() {
        let program = program("int main() { int a[4]; return &a[3] - &a[1]; }");
        let expr = returned(&program);

        assert_eq!(expr.ty, Type::Long);
        match &expr.kind {
            ExprKind::Binary { op: BinOp::Div, rhs, .. } => {
                assert!(matches!(rhs.kind, ExprKind::Num(4)))
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn reanalysis_is_idempotent() {
        let text = "struct pair { char c; long l; };
                    int f(int x);
                    int f(int x) { return x; }
                    int main() {
                        int a[3]; int *p; struct pair s; char c;
                        p = a + 1;
                        s.l = sizeof s + (p - a) + sizeof(a[0]);
                        switch (c) { case 1: break; default: c = f(2); }
                        p++; c--;
                        return p[0] ? *p : c;
                    }";

        let mut program = program(text);
        let before = format!("{:?}", program.functions);

        analyze(&mut program, false).unwrap();
        assert_eq!(format!("{:?}", program.functions), before);
    }

    #[test]
    fn members_and_sizeof() {
        let program = program("struct pair { int x; int y; }; int main() { struct pair p; return p.y + sizeof p; }");

        match &returned(&program).kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                assert!(matches!(lhs.kind, ExprKind::Member { offset: 4, .. }));
                assert!(matches!(rhs.kind, ExprKind::Num(8)));
                assert_eq!(rhs.ty, Type::Long);
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn frame_layout() {
        let program = program("int main() { char c; int i; long l; char s[3]; return 0; }");
        let main = &program.functions[0];

        let offsets: Vec<_> = main.locals.iter().map(|var| var.offset).collect();
        assert_eq!(offsets, vec![1, 8, 16, 19]);
        assert_eq!(main.stack_size, 32);
    }

    #[test]
    fn assignment_yields_stored_type() {
        let narrow = program("int main() { char c; return c = 300; }");
        assert_eq!(returned(&narrow).ty, Type::Char);

        let chained = program("int main() { long x; char c; return x = c = 1; }");
        match &returned(&chained).kind {
            ExprKind::Assign { rhs, .. } => assert_eq!(rhs.ty, Type::Char),
            other => panic!("{:?}", other),
        }

        assert_eq!(returned(&chained).ty, Type::Long);
    }

    #[test]
    fn postfix_recovers_previous_value() {
        let character = program("int main() { char c; return c++; }");
        let expr = returned(&character);

        assert_eq!(expr.ty, Type::Char);
        match &expr.kind {
            ExprKind::Comma(update, previous) => {
                assert!(matches!(update.kind, ExprKind::Assign { .. }));
                match &previous.kind {
                    ExprKind::Cast { to: Type::Char, expr } => {
                        assert!(matches!(expr.kind, ExprKind::Binary { op: BinOp::Sub, .. }))
                    }

                    other => panic!("{:?}", other),
                }
            }

            other => panic!("{:?}", other),
        }

        // El puntero se desplaza por elementos en ambos sentidos
        let pointer = program("int main() { long *p; p--; return 0; }");
        let body = pointer.functions[0].body.as_ref().unwrap();
        let text = format!("{:?}", body);
        assert_eq!(text.matches("Num(8)").count(), 2, "{}", text);
    }

    #[test]
    fn switch_cases_are_collected() {
        let program = program("int main() { int x; switch (x) { case 1: case 2: break; default: break; } return 0; }");

        let body = program.functions[0].body.as_ref().unwrap();
        let switch = match &body.kind {
            StmtKind::Block(stmts) => &stmts[0].kind,
            other => panic!("{:?}", other),
        };

        match switch {
            StmtKind::Switch { cases, .. } => {
                let values: Vec<_> = cases.iter().map(|case| case.value).collect();
                let labels: Vec<_> = cases.iter().map(|case| case.label).collect();

                assert_eq!(values, vec![Some(1), Some(2), None]);
                assert_eq!(labels, vec![0, 1, 2]);
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn calls() {
        program("int f(int a, int b) { return a + b; } int main() { return f(1, 2); }");
        program("int printf(char *fmt, ...); int main() { return printf(\"%d\", 1, 2); }");
        program("int fib(int n) { return n < 2 ? 1 : fib(n - 1) + fib(n - 2); }");

        assert!(matches!(
            fail("int f(int a); int main() { return f(); }"),
            SemanticError::ArityMismatch { expected: 1, found: 0, .. }
        ));

        assert!(matches!(fail("int main() { return g(); }"), SemanticError::UndefinedFunction(_)));
        assert!(analyze_text("int main() { return g(); }", true).is_ok());

        assert!(matches!(
            fail("int f(); int main() { return f(1, 2, 3, 4, 5, 6, 7); }"),
            SemanticError::TooManyArguments(7)
        ));
    }

    #[test]
    fn errors() {
        let cases: &[(&str, fn(&SemanticError) -> bool)] = &[
            ("struct s { int a; }; int main() { struct s x; return x + 1; }", |e| {
                matches!(e, SemanticError::InvalidOperand(_))
            }),
            ("int main() { return 1 = 2; }", |e| matches!(e, SemanticError::NotAssignable)),
            ("int main() { int a[2]; int b[2]; a = b; }", |e| {
                matches!(e, SemanticError::NotAssignable)
            }),
            ("int main() { int x; return *x; }", |e| matches!(e, SemanticError::NotPointer(_))),
            ("int main() { int *p; int *q; return p + q; }", |e| {
                matches!(e, SemanticError::InvalidOperands(..))
            }),
            ("struct s { int a; }; int main() { struct s x; return x.b; }", |e| {
                matches!(e, SemanticError::NoSuchField(..))
            }),
            ("int main() { break; }", |e| matches!(e, SemanticError::StrayBreak)),
            ("int main() { switch (1) { continue; } }", |e| {
                matches!(e, SemanticError::StrayContinue)
            }),
            ("int main() { case 1: return 0; }", |e| matches!(e, SemanticError::StrayCase)),
            ("int main() { switch (1) { case 1: case 1: ; } }", |e| {
                matches!(e, SemanticError::DuplicateCase(1))
            }),
            ("int main() { switch (1) { default: default: ; } }", |e| {
                matches!(e, SemanticError::DuplicateDefault)
            }),
            ("void f(); int main() { return f(); }", |e| matches!(e, SemanticError::VoidValue)),
            ("struct s { int a; }; int main() { struct s v; int *p; return *(1 ? p : v); }", |e| {
                matches!(e, SemanticError::InvalidOperand(Type::Struct(_)))
            }),
            ("int main() { int *p; return *(1 ? (void) 0 : p); }", |e| {
                matches!(e, SemanticError::InvalidOperand(Type::Void))
            }),
            ("struct s { int a; }; int main() { struct s v; v++; }", |e| {
                matches!(e, SemanticError::InvalidOperand(_))
            }),
            ("int main() { long a[200000000]; long b[200000000]; return 0; }", |e| {
                matches!(e, SemanticError::FrameTooLarge(_))
            }),
        ];

        for (text, check) in cases {
            let error = fail(text);
            assert!(check(&error), "{}: {:?}", text, error);
        }
    }
}
