//! Emisión por evaluación en pila.
//!
//! Recorre directamente el AST tipado. Toda expresión deja su valor en
//! `rax`; los operandos pendientes se guardan con `push` y se recuperan
//! con `pop`. La cantidad de valores apilados se lleva en `depth` para
//! poder alinear `rsp` a 16 bytes antes de cada `call`.

use super::local_label;
use crate::{
    arch::x86_64::{alignment_for, ptr_size, Arg, Reg, Scratch},
    ast::{BinOp, Expr, ExprKind, Function, Stmt, StmtKind, UnOp},
    ir::Width,
    types::Type,
};

use std::io::{self, Write};

pub fn emit<W: Write>(output: &mut W, function: &Function, body: &Stmt) -> io::Result<()> {
    let mut emitter = Emitter {
        output,
        function,
        depth: 0,
        next_id: 0,
        breaks: Vec::new(),
        continues: Vec::new(),
    };

    emitter.prologue()?;
    emitter.stmt(body)?;

    // Caer al final de la función retorna cero
    emit!(emitter, "mov", "rax, 0")?;
    emitter.epilogue()
}

struct Emitter<'a, W> {
    output: &'a mut W,
    function: &'a Function,

    /// Valores de 8 bytes apilados por encima del frame.
    depth: usize,

    next_id: u32,
    breaks: Vec<String>,
    continues: Vec<String>,
}

impl<W: Write> Emitter<'_, W> {
    fn output(&mut self) -> &mut W {
        self.output
    }

    fn prologue(&mut self) -> io::Result<()> {
        emit!(self, "push", "rbp")?;
        emit!(self, "mov", "rbp, rsp")?;

        let stack_size = self.function.stack_size;
        if stack_size > 0 {
            emit!(self, "sub", "rsp, {}", stack_size)?;
        }

        // Se copian argumentos de registros a locales
        let function = self.function;
        for (&param, arg) in function.params.iter().zip(Arg::sequence()) {
            let var = &function.locals[param.0];
            let width = Width::of(&var.ty);

            emit!(
                self,
                "mov",
                "{} [rbp - {}], {}",
                ptr_size(width),
                var.offset,
                arg.name(width)
            )?;
        }

        Ok(())
    }

    fn epilogue(&mut self) -> io::Result<()> {
        let label = self.return_label();
        writeln!(self.output, "{}:", label)?;

        emit!(self, "leave")?;
        emit!(self, "ret")
    }

    fn stmt(&mut self, stmt: &Stmt) -> io::Result<()> {
        match &stmt.kind {
            StmtKind::Expr(expr) => self.expr(expr)?,

            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value)?;
                }

                let label = self.return_label();
                emit!(self, "jmp", "{}", label)?;
            }

            StmtKind::If { cond, then, els } => {
                let id = self.next_id();
                let (else_label, end_label) = (self.label("else", id), self.label("end", id));

                self.expr(cond)?;
                emit!(self, "cmp", "rax, 0")?;
                emit!(self, "je", "{}", else_label)?;

                self.stmt(then)?;
                emit!(self, "jmp", "{}", end_label)?;

                writeln!(self.output, "{}:", else_label)?;
                if let Some(els) = els {
                    self.stmt(els)?;
                }

                writeln!(self.output, "{}:", end_label)?;
            }

            StmtKind::While { cond, body } => {
                let id = self.next_id();
                let (begin, end) = (self.label("begin", id), self.label("end", id));

                writeln!(self.output, "{}:", begin)?;
                self.expr(cond)?;
                emit!(self, "cmp", "rax, 0")?;
                emit!(self, "je", "{}", end)?;

                self.looped(body, &end, &begin)?;
                emit!(self, "jmp", "{}", begin)?;
                writeln!(self.output, "{}:", end)?;
            }

            StmtKind::DoWhile { body, cond } => {
                let id = self.next_id();
                let begin = self.label("begin", id);
                let (next, end) = (self.label("next", id), self.label("end", id));

                writeln!(self.output, "{}:", begin)?;
                self.looped(body, &end, &next)?;

                writeln!(self.output, "{}:", next)?;
                self.expr(cond)?;
                emit!(self, "cmp", "rax, 0")?;
                emit!(self, "jne", "{}", begin)?;
                writeln!(self.output, "{}:", end)?;
            }

            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                let id = self.next_id();
                let begin = self.label("begin", id);
                let (next, end) = (self.label("next", id), self.label("end", id));

                if let Some(init) = init {
                    self.stmt(init)?;
                }

                writeln!(self.output, "{}:", begin)?;
                if let Some(cond) = cond {
                    self.expr(cond)?;
                    emit!(self, "cmp", "rax, 0")?;
                    emit!(self, "je", "{}", end)?;
                }

                self.looped(body, &end, &next)?;

                writeln!(self.output, "{}:", next)?;
                if let Some(step) = step {
                    self.expr(step)?;
                }

                emit!(self, "jmp", "{}", begin)?;
                writeln!(self.output, "{}:", end)?;
            }

            StmtKind::Switch { cond, body, cases } => {
                let id = self.next_id();
                let end = self.label("end", id);

                self.expr(cond)?;

                let mut fallback = end.clone();
                for case in cases {
                    let target = self.case_label(case.label);
                    match case.value {
                        Some(value) => {
                            emit!(self, "mov", "rdi, {}", value)?;
                            emit!(self, "cmp", "rax, rdi")?;
                            emit!(self, "je", "{}", target)?;
                        }

                        None => fallback = target,
                    }
                }

                emit!(self, "jmp", "{}", fallback)?;

                self.breaks.push(end.clone());
                self.stmt(body)?;
                self.breaks.pop();

                writeln!(self.output, "{}:", end)?;
            }

            StmtKind::Case { label, body, .. } | StmtKind::Default { label, body } => {
                if let Some(label) = label {
                    let label = self.case_label(*label);
                    writeln!(self.output, "{}:", label)?;
                }

                self.stmt(body)?;
            }

            StmtKind::Break => {
                if let Some(target) = self.breaks.last().cloned() {
                    emit!(self, "jmp", "{}", target)?;
                }
            }

            StmtKind::Continue => {
                if let Some(target) = self.continues.last().cloned() {
                    emit!(self, "jmp", "{}", target)?;
                }
            }

            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    self.stmt(stmt)?;
                }
            }

            StmtKind::Null => (),
        }

        debug_assert_eq!(self.depth, 0, "unbalanced stack after statement");
        Ok(())
    }

    fn looped(&mut self, body: &Stmt, end: &str, next: &str) -> io::Result<()> {
        self.breaks.push(end.to_owned());
        self.continues.push(next.to_owned());

        self.stmt(body)?;

        self.breaks.pop();
        self.continues.pop();
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> io::Result<()> {
        match &expr.kind {
            ExprKind::Num(value) => emit!(self, "mov", "rax, {}", value),

            ExprKind::Str(_)
            | ExprKind::Local(_)
            | ExprKind::Global(_)
            | ExprKind::Deref(_)
            | ExprKind::Member { .. } => {
                self.addr(expr)?;
                self.load(&expr.ty)
            }

            ExprKind::Binary {
                op: op @ (BinOp::LogAnd | BinOp::LogOr),
                lhs,
                rhs,
                ..
            } => self.logical(*op, lhs, rhs),

            ExprKind::Binary { op, lhs, rhs, .. } => {
                self.expr(lhs)?;
                self.push(Scratch::Rax)?;
                self.expr(rhs)?;
                emit!(self, "mov", "rdi, rax")?;
                self.pop(Scratch::Rax)?;

                let width = if op.is_boolean() {
                    Width::Qword
                } else {
                    Width::arithmetic(&expr.ty)
                };

                self.binary(*op, width)
            }

            ExprKind::Assign { lhs, rhs } => {
                self.addr(lhs)?;
                self.push(Scratch::Rax)?;
                self.expr(rhs)?;
                self.store(&lhs.ty)?;
                self.extend(Width::of(&lhs.ty))
            }

            ExprKind::Comma(lhs, rhs) => {
                self.expr(lhs)?;
                self.expr(rhs)
            }

            ExprKind::Cond { cond, then, els } => {
                let id = self.next_id();
                let (else_label, end_label) = (self.label("else", id), self.label("end", id));

                self.expr(cond)?;
                emit!(self, "cmp", "rax, 0")?;
                emit!(self, "je", "{}", else_label)?;

                self.expr(then)?;
                emit!(self, "jmp", "{}", end_label)?;

                writeln!(self.output, "{}:", else_label)?;
                self.expr(els)?;
                writeln!(self.output, "{}:", end_label)
            }

            ExprKind::Unary { op, expr: operand } => {
                self.expr(operand)?;

                let width = Width::arithmetic(&expr.ty);
                match op {
                    UnOp::Neg => emit!(self, "neg", "{}", Scratch::Rax.name(width))?,
                    UnOp::BitNot => emit!(self, "not", "{}", Scratch::Rax.name(width))?,
                    UnOp::Not => {
                        emit!(self, "cmp", "rax, 0")?;
                        emit!(self, "sete", "al")?;
                        return emit!(self, "movzx", "rax, al");
                    }
                }

                self.extend(width)
            }

            ExprKind::Addr(operand) => self.addr(operand),

            ExprKind::Call { name, args } => {
                for arg in args {
                    self.expr(arg)?;
                    self.push(Scratch::Rax)?;
                }

                for arg in Arg::sequence().take(args.len()).collect::<Vec<_>>().into_iter().rev() {
                    emit!(self, "pop", "{}", arg)?;
                    self.depth -= 1;
                }

                // Alineamiento de 16 bytes en el punto de llamada
                self.push(Reg::R10)?;
                self.push(Reg::R11)?;

                let padding = alignment_for(self.depth) * 8;
                if padding > 0 {
                    emit!(self, "sub", "rsp, {}", padding)?;
                }

                emit!(self, "mov", "eax, 0")?;
                emit!(self, "call", "{}", name)?;

                if padding > 0 {
                    emit!(self, "add", "rsp, {}", padding)?;
                }

                self.pop(Reg::R11)?;
                self.pop(Reg::R10)?;

                self.extend(Width::of(&expr.ty))
            }

            ExprKind::Cast { to, expr: operand } => {
                self.expr(operand)?;
                match to {
                    Type::Char | Type::Int => self.extend(Width::of(to)),
                    _ => Ok(()),
                }
            }

            ExprKind::Sizeof(operand) => emit!(self, "mov", "rax, {}", operand.ty.size()),

            // Desazucarado durante el análisis semántico
            ExprKind::Postfix { .. } => unreachable!(),
        }
    }

    /// `rax` <- `rax` op `rdi`.
    fn binary(&mut self, op: BinOp, width: Width) -> io::Result<()> {
        use BinOp::*;

        let (rax, rdi) = (Scratch::Rax.name(width), Scratch::Rdi.name(width));
        let opcode = match op {
            Add => "add",
            Sub => "sub",
            Mul => "imul",
            BitAnd => "and",
            BitOr => "or",
            BitXor => "xor",

            Div | Mod => {
                emit!(self, if width == Width::Qword { "cqo" } else { "cdq" })?;
                emit!(self, "idiv", "{}", rdi)?;
                if op == Mod {
                    emit!(self, "mov", "rax, rdx")?;
                }

                return self.extend(width);
            }

            Shl | Shr => {
                emit!(self, "mov", "rcx, rdi")?;
                emit!(self, if op == Shl { "shl" } else { "sar" }, "{}, cl", rax)?;
                return self.extend(width);
            }

            Eq | Ne | Lt | Le => {
                let set = match op {
                    Eq => "sete",
                    Ne => "setne",
                    Lt => "setl",
                    _ => "setle",
                };

                emit!(self, "cmp", "{}, {}", rax, rdi)?;
                emit!(self, set, "al")?;
                return emit!(self, "movzx", "rax, al");
            }

            // Con cortocircuito en `logical()`
            LogAnd | LogOr => unreachable!(),
        };

        emit!(self, opcode, "{}, {}", rax, rdi)?;
        self.extend(width)
    }

    /// `&&` y `||` con cortocircuito.
    fn logical(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> io::Result<()> {
        let id = self.next_id();
        let (short, end) = (self.label("short", id), self.label("end", id));

        // `&&` termina en el primer falso, `||` en el primer verdadero
        let (jump, short_value) = match op {
            BinOp::LogAnd => ("je", 0),
            _ => ("jne", 1),
        };

        for operand in [lhs, rhs] {
            self.expr(operand)?;
            emit!(self, "cmp", "rax, 0")?;
            emit!(self, jump, "{}", short)?;
        }

        emit!(self, "mov", "rax, {}", 1 - short_value)?;
        emit!(self, "jmp", "{}", end)?;

        writeln!(self.output, "{}:", short)?;
        emit!(self, "mov", "rax, {}", short_value)?;
        writeln!(self.output, "{}:", end)
    }

    /// Calcula en `rax` la dirección de un lvalue.
    fn addr(&mut self, expr: &Expr) -> io::Result<()> {
        match &expr.kind {
            ExprKind::Local(id) => {
                let offset = self.function.locals[id.0].offset;
                emit!(self, "lea", "rax, [rbp - {}]", offset)
            }

            ExprKind::Global(name) => emit!(self, "lea", "rax, [rip + {}]", name),

            ExprKind::Str(index) => {
                let label = crate::ast::string_label(*index);
                emit!(self, "lea", "rax, [rip + {}]", label)
            }

            ExprKind::Deref(pointer) => self.expr(pointer),

            ExprKind::Member {
                expr: aggregate,
                offset,
                ..
            } => {
                self.addr(aggregate)?;
                if *offset > 0 {
                    emit!(self, "add", "rax, {}", offset)?;
                }

                Ok(())
            }

            ExprKind::Comma(lhs, rhs) => {
                self.expr(lhs)?;
                self.addr(rhs)
            }

            _ => self.expr(expr),
        }
    }

    fn load(&mut self, ty: &Type) -> io::Result<()> {
        if ty.is_aggregate() {
            return Ok(());
        }

        let width = Width::of(ty);
        let opcode = match width {
            Width::Byte => "movsx",
            Width::Dword => "movsxd",
            Width::Qword => "mov",
        };

        emit!(self, opcode, "rax, {} [rax]", ptr_size(width))
    }

    /// Guarda `rax` en la dirección al tope de la pila.
    fn store(&mut self, ty: &Type) -> io::Result<()> {
        let width = Width::of(ty);

        self.pop(Scratch::Rdi)?;
        emit!(self, "mov", "{} [rdi], {}", ptr_size(width), Scratch::Rax.name(width))
    }

    /// Extiende el signo de `rax` desde `width`.
    fn extend(&mut self, width: Width) -> io::Result<()> {
        match width {
            Width::Byte => emit!(self, "movsx", "rax, al"),
            Width::Dword => emit!(self, "movsxd", "rax, eax"),
            Width::Qword => Ok(()),
        }
    }

    fn push(&mut self, reg: impl std::fmt::Display) -> io::Result<()> {
        self.depth += 1;
        emit!(self, "push", "{}", reg)
    }

    fn pop(&mut self, reg: impl std::fmt::Display) -> io::Result<()> {
        self.depth -= 1;
        emit!(self, "pop", "{}", reg)
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;

        id
    }

    fn label(&self, kind: &str, id: u32) -> String {
        local_label(self.function.name.as_ref(), format_args!("{}.{}", kind, id))
    }

    fn case_label(&self, label: u32) -> String {
        local_label(self.function.name.as_ref(), format_args!("case.{}", label))
    }

    fn return_label(&self) -> String {
        local_label(self.function.name.as_ref(), "return")
    }
}

#[cfg(test)]
mod tests {
    use crate::{codegen::emit_stack, lex::Lexer, parse::parse, semantic::analyze, source::Source};
    use std::rc::Rc;

    fn compile(text: &str) -> String {
        let source = Source::new("test.c", text);
        let tokens = Lexer::new(Rc::clone(&source)).tokenize().unwrap();
        let mut program = parse(&source, &tokens).unwrap();

        analyze(&mut program, false).unwrap();
        String::from_utf8(emit_stack(&program).unwrap()).unwrap()
    }

    #[test]
    fn pushes_and_pops_balance() {
        let asm = compile(
            "int f(int a, int b) { return a * (b - 1) + f(a, b) / 2; }
             int main() { int x; x = 1; while (x < 10) x = x + 1; return x && f(x, 2) || 0; }",
        );

        let pushes = asm.lines().filter(|line| line.starts_with("\tpush ")).count();
        let pops = asm.lines().filter(|line| line.starts_with("\tpop ")).count();

        // `push rbp` se revierte con `leave`
        assert_eq!(pushes, pops + 2, "{}", asm);
    }

    #[test]
    fn parameters_are_stored_by_width() {
        let asm = compile("long f(char c, int i, long l) { return c + i + l; }");

        assert!(asm.contains("\tmov     byte ptr [rbp - 1], dil\n"), "{}", asm);
        assert!(asm.contains("\tmov     dword ptr [rbp - 8], esi\n"), "{}", asm);
        assert!(asm.contains("\tmov     qword ptr [rbp - 16], rdx\n"), "{}", asm);
    }

    #[test]
    fn calls_are_aligned() {
        let asm = compile("int g(int x); int f(int a, int b); int main() { return f(1, g(2)); }");

        // Al llamar a `g` hay un argumento de `f` pendiente en la pila
        let inner = asm.find("\tcall    g\n").unwrap();
        assert!(asm[..inner].ends_with("\tsub     rsp, 8\n\tmov     eax, 0\n"), "{}", asm);

        let outer = asm.find("\tcall    f\n").unwrap();
        assert!(asm[..outer].ends_with("\tpush    r11\n\tmov     eax, 0\n"), "{}", asm);
    }

    #[test]
    fn switch_dispatch() {
        let asm = compile(
            "int main() { int x; x = 2;
                switch (x) { case 1: return 10; case 2: return 20; default: return 30; } }",
        );

        assert!(asm.contains("\tmov     rdi, 2\n\tcmp     rax, rdi\n\tje      .Lmain.case."), "{}", asm);
        assert_eq!(asm.matches("\tje      .Lmain.case.").count(), 2, "{}", asm);
    }
}
