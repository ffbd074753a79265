//! Generación de IR a partir del AST anotado.
//!
//! Cada subexpresión produce un registro virtual nuevo y cada operador
//! una instrucción. Los bloques se abren de forma perezosa: toda
//! instrucción emitida después de un terminador abre un bloque nuevo
//! (inalcanzable) y todo bloque que termina sin salto cae al siguiente
//! por medio de un `Jump` explícito.

use super::{Block, BlockId, Function, Instruction, VReg, Width};
use crate::{
    ast::{self, string_label, BinOp, Expr, ExprKind, Stmt, StmtKind, UnOp},
    types::Type,
};

use std::collections::HashMap;

/// Genera IR para toda función con cuerpo.
pub fn lower(program: &ast::Program) -> Vec<Function> {
    program
        .functions
        .iter()
        .filter_map(|function| {
            let body = function.body.as_ref()?;
            Some(Lowering::new(function).run(body))
        })
        .collect()
}

struct Lowering<'a> {
    function: &'a ast::Function,
    blocks: Vec<Block>,
    terminated: bool,
    next_vreg: u32,
    next_block: u32,

    /// Destinos de `break` y `continue` en los ciclos activos.
    breaks: Vec<BlockId>,
    continues: Vec<BlockId>,

    /// Bloque de cada etiqueta `case` en la función.
    cases: HashMap<u32, BlockId>,
}

impl<'a> Lowering<'a> {
    fn new(function: &'a ast::Function) -> Self {
        Lowering {
            function,
            blocks: Vec::new(),
            terminated: true,
            next_vreg: 0,
            next_block: 0,
            breaks: Vec::new(),
            continues: Vec::new(),
            cases: HashMap::new(),
        }
    }

    fn run(mut self, body: &Stmt) -> Function {
        let entry = self.new_block();
        self.start(entry);

        // Los parámetros llegan en registros y se copian a su slot
        let mut params = Vec::new();
        let mut pins = Vec::new();

        for (index, &id) in self.function.params.iter().enumerate() {
            let var = &self.function.locals[id.0];
            let param = self.vreg();
            params.push(param);
            pins.push((param, index));

            let addr = self.vreg();
            self.emit(Instruction::LocalAddr {
                dst: addr,
                offset: var.offset,
            });

            self.emit(Instruction::Store {
                width: Width::of(&var.ty),
                addr,
                src: param,
            });
        }

        self.stmt(body);

        // Caer al final de la función retorna cero
        if !self.terminated {
            let zero = self.imm(0);
            self.emit(Instruction::Return(Some(zero)));
        }

        log::debug!(
            "lowered `{}` into {} blocks, {} virtual registers",
            self.function.name,
            self.blocks.len(),
            self.next_vreg
        );

        Function {
            name: self.function.name.clone(),
            params,
            blocks: self.blocks,
            pins,
            stack_size: self.function.stack_size,
            is_static: self.function.is_static,
            location: self.function.location.clone(),
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.expr(expr);
            }

            StmtKind::Return(value) => {
                let value = value.as_ref().map(|value| self.expr(value));
                self.emit(Instruction::Return(value));
            }

            StmtKind::If { cond, then, els } => {
                let (then_block, join) = (self.new_block(), self.new_block());
                let else_block = match els {
                    Some(_) => self.new_block(),
                    None => join,
                };

                let cond = self.expr(cond);
                self.emit(Instruction::Branch {
                    cond,
                    then: then_block,
                    els: else_block,
                });

                self.start(then_block);
                self.stmt(then);

                if let Some(els) = els {
                    self.emit(Instruction::Jump(join));
                    self.start(else_block);
                    self.stmt(els);
                }

                self.start(join);
            }

            StmtKind::While { cond, body } => {
                let (head, start, exit) = (self.new_block(), self.new_block(), self.new_block());

                self.start(head);
                let cond = self.expr(cond);
                self.emit(Instruction::Branch {
                    cond,
                    then: start,
                    els: exit,
                });

                self.start(start);
                self.looped(body, exit, head);
                self.emit(Instruction::Jump(head));

                self.start(exit);
            }

            StmtKind::DoWhile { body, cond } => {
                let (start, next, exit) = (self.new_block(), self.new_block(), self.new_block());

                self.start(start);
                self.looped(body, exit, next);

                self.start(next);
                let cond = self.expr(cond);
                self.emit(Instruction::Branch {
                    cond,
                    then: start,
                    els: exit,
                });

                self.start(exit);
            }

            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init);
                }

                let head = self.new_block();
                let start = self.new_block();
                let next = self.new_block();
                let exit = self.new_block();

                self.start(head);
                if let Some(cond) = cond {
                    let cond = self.expr(cond);
                    self.emit(Instruction::Branch {
                        cond,
                        then: start,
                        els: exit,
                    });
                }

                self.start(start);
                self.looped(body, exit, next);

                self.start(next);
                if let Some(step) = step {
                    self.expr(step);
                }

                self.emit(Instruction::Jump(head));
                self.start(exit);
            }

            StmtKind::Switch { cond, body, cases } => {
                let value = self.expr(cond);
                let exit = self.new_block();
                let mut fallback = exit;

                for case in cases {
                    let target = self.new_block();
                    self.cases.insert(case.label, target);

                    let constant = match case.value {
                        Some(constant) => constant,
                        None => {
                            fallback = target;
                            continue;
                        }
                    };

                    let constant = self.imm(constant);
                    let matches = self.vreg();
                    self.emit(Instruction::Binary {
                        op: BinOp::Eq,
                        width: Width::Qword,
                        dst: matches,
                        lhs: value,
                        rhs: constant,
                    });

                    let next = self.new_block();
                    self.emit(Instruction::Branch {
                        cond: matches,
                        then: target,
                        els: next,
                    });

                    self.start(next);
                }

                self.emit(Instruction::Jump(fallback));

                self.breaks.push(exit);
                self.stmt(body);
                self.breaks.pop();

                self.start(exit);
            }

            StmtKind::Case { label, body, .. } | StmtKind::Default { label, body } => {
                let target = label.and_then(|label| self.cases.get(&label).copied());
                if let Some(target) = target {
                    self.start(target);
                }

                self.stmt(body);
            }

            StmtKind::Break => {
                if let Some(&target) = self.breaks.last() {
                    self.emit(Instruction::Jump(target));
                }
            }

            StmtKind::Continue => {
                if let Some(&target) = self.continues.last() {
                    self.emit(Instruction::Jump(target));
                }
            }

            StmtKind::Block(stmts) => stmts.iter().for_each(|stmt| self.stmt(stmt)),
            StmtKind::Null => (),
        }
    }

    fn looped(&mut self, body: &Stmt, exit: BlockId, next: BlockId) {
        self.breaks.push(exit);
        self.continues.push(next);

        self.stmt(body);

        self.breaks.pop();
        self.continues.pop();
    }

    fn expr(&mut self, expr: &Expr) -> VReg {
        match &expr.kind {
            ExprKind::Num(value) => self.imm(*value),

            ExprKind::Str(_)
            | ExprKind::Local(_)
            | ExprKind::Global(_)
            | ExprKind::Deref(_)
            | ExprKind::Member { .. } => {
                let addr = self.addr(expr);
                self.load(addr, &expr.ty)
            }

            ExprKind::Binary {
                op: op @ (BinOp::LogAnd | BinOp::LogOr),
                lhs,
                rhs,
                ..
            } => self.logical(*op, lhs, rhs),

            ExprKind::Binary { op, lhs, rhs, .. } => {
                let lhs = self.expr(lhs);
                let rhs = self.expr(rhs);

                // Los operandos ya están extendidos a 64 bits
                let width = if op.is_boolean() {
                    Width::Qword
                } else {
                    Width::arithmetic(&expr.ty)
                };

                let dst = self.vreg();
                self.emit(Instruction::Binary {
                    op: *op,
                    width,
                    dst,
                    lhs,
                    rhs,
                });

                dst
            }

            ExprKind::Assign { lhs, rhs } => {
                let addr = self.addr(lhs);
                let value = self.expr(rhs);
                let width = Width::of(&lhs.ty);

                self.emit(Instruction::Store {
                    width,
                    addr,
                    src: value,
                });

                // Se lee de vuelta lo que cabe en el destino
                if width == Width::Qword {
                    return value;
                }

                let dst = self.vreg();
                self.emit(Instruction::Cast {
                    width,
                    dst,
                    src: value,
                });

                dst
            }

            ExprKind::Comma(lhs, rhs) => {
                self.expr(lhs);
                self.expr(rhs)
            }

            ExprKind::Cond { cond, then, els } => {
                let result = self.vreg();
                let then_block = self.new_block();
                let else_block = self.new_block();
                let join = self.new_block();

                let cond = self.expr(cond);
                self.emit(Instruction::Branch {
                    cond,
                    then: then_block,
                    els: else_block,
                });

                for (block, value) in [(then_block, then), (else_block, els)] {
                    self.start(block);
                    let src = self.expr(value);

                    self.emit(Instruction::Mov { dst: result, src });
                    self.emit(Instruction::Jump(join));
                }

                self.start(join);
                result
            }

            ExprKind::Unary { op, expr: operand } => {
                let src = self.expr(operand);
                let dst = self.vreg();

                self.emit(Instruction::Unary {
                    op: *op,
                    width: match op {
                        UnOp::Not => Width::Qword,
                        _ => Width::arithmetic(&expr.ty),
                    },
                    dst,
                    src,
                });

                dst
            }

            ExprKind::Addr(operand) => self.addr(operand),

            ExprKind::Call { name, args } => {
                let args = args.iter().map(|arg| self.expr(arg)).collect();
                let dst = self.vreg();

                self.emit(Instruction::Call {
                    dst,
                    name: name.clone(),
                    args,
                    width: Width::of(&expr.ty),
                });

                dst
            }

            ExprKind::Cast { to, expr: operand } => {
                let src = self.expr(operand);
                match to {
                    Type::Char | Type::Int => {
                        let dst = self.vreg();
                        self.emit(Instruction::Cast {
                            width: Width::of(to),
                            dst,
                            src,
                        });

                        dst
                    }

                    _ => src,
                }
            }

            ExprKind::Sizeof(operand) => self.imm(operand.ty.size() as i64),

            ExprKind::Postfix { .. } => unreachable!(),
        }
    }

    /// `&&` y `||` con cortocircuito.
    fn logical(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> VReg {
        let result = self.vreg();
        let right = self.new_block();
        let short = self.new_block();
        let join = self.new_block();

        let lhs = self.expr(lhs);
        let (then, els, short_value) = match op {
            BinOp::LogAnd => (right, short, 0),
            _ => (short, right, 1),
        };

        self.emit(Instruction::Branch {
            cond: lhs,
            then,
            els,
        });

        self.start(right);
        let rhs = self.expr(rhs);
        let zero = self.imm(0);

        self.emit(Instruction::Binary {
            op: BinOp::Ne,
            width: Width::Qword,
            dst: result,
            lhs: rhs,
            rhs: zero,
        });

        self.emit(Instruction::Jump(join));

        self.start(short);
        self.emit(Instruction::Imm {
            dst: result,
            value: short_value,
        });

        self.start(join);
        result
    }

    fn addr(&mut self, expr: &Expr) -> VReg {
        match &expr.kind {
            ExprKind::Local(id) => {
                let dst = self.vreg();
                self.emit(Instruction::LocalAddr {
                    dst,
                    offset: self.function.locals[id.0].offset,
                });

                dst
            }

            ExprKind::Global(name) => self.label(name.to_string()),
            ExprKind::Str(index) => self.label(string_label(*index)),
            ExprKind::Deref(pointer) => self.expr(pointer),

            ExprKind::Member {
                expr: aggregate,
                offset,
                ..
            } => {
                let base = self.addr(aggregate);
                if *offset == 0 {
                    return base;
                }

                let offset = self.imm(*offset as i64);
                let dst = self.vreg();
                self.emit(Instruction::Binary {
                    op: BinOp::Add,
                    width: Width::Qword,
                    dst,
                    lhs: base,
                    rhs: offset,
                });

                dst
            }

            ExprKind::Comma(lhs, rhs) => {
                self.expr(lhs);
                self.addr(rhs)
            }

            // Agregados sin nombre se evalúan a su propia dirección
            _ => self.expr(expr),
        }
    }

    /// Arreglos y structs se representan por su dirección.
    fn load(&mut self, addr: VReg, ty: &Type) -> VReg {
        if ty.is_aggregate() {
            return addr;
        }

        let dst = self.vreg();
        self.emit(Instruction::Load {
            width: Width::of(ty),
            dst,
            addr,
        });

        dst
    }

    fn label(&mut self, symbol: String) -> VReg {
        let dst = self.vreg();
        self.emit(Instruction::Label { dst, symbol });

        dst
    }

    fn imm(&mut self, value: i64) -> VReg {
        let dst = self.vreg();
        self.emit(Instruction::Imm { dst, value });

        dst
    }

    fn vreg(&mut self) -> VReg {
        let vreg = VReg(self.next_vreg);
        self.next_vreg += 1;

        vreg
    }

    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;

        id
    }

    /// Abre un bloque nuevo; el bloque anterior cae a este si no terminó.
    fn start(&mut self, id: BlockId) {
        if !self.terminated {
            self.emit(Instruction::Jump(id));
        }

        self.blocks.push(Block {
            id,
            instructions: Vec::new(),
        });

        self.terminated = false;
    }

    fn emit(&mut self, instruction: Instruction) {
        if self.terminated {
            let unreachable = self.new_block();
            self.start(unreachable);
        }

        self.terminated = instruction.is_terminator();
        if let Some(block) = self.blocks.last_mut() {
            block.instructions.push(instruction);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lex::Lexer, parse::parse, semantic::analyze, source::Source};
    use std::rc::Rc;

    fn lower_text(text: &str) -> Vec<Function> {
        let source = Source::new("test.c", text);
        let tokens = Lexer::new(Rc::clone(&source)).tokenize().unwrap();
        let mut program = parse(&source, &tokens).unwrap();

        analyze(&mut program, false).unwrap();
        lower(&program)
    }

    #[test]
    fn every_block_ends_in_terminator() {
        let text = "int f(int n) {
                        int s; s = 0;
                        for (int i = 0; i < n; i++) { if (i % 2) continue; s += i; }
                        while (s > 100) s = s - 1;
                        do s++; while (s < 3);
                        switch (s) { case 1: return 1; default: break; }
                        return s && n || !s ? s : -n;
                    }";

        for function in lower_text(text) {
            for block in &function.blocks {
                let last = block.instructions.last().expect("empty block");
                assert!(last.is_terminator(), "{}", function);

                let early = &block.instructions[..block.instructions.len() - 1];
                assert!(early.iter().all(|i| !i.is_terminator()), "{}", function);
            }
        }
    }

    #[test]
    fn params_are_pinned_and_spilled() {
        let functions = lower_text("int add(int a, char b) { return a + b; }");
        let add = &functions[0];

        assert_eq!(add.params.len(), 2);
        assert_eq!(add.pin(add.params[0]), Some(0));
        assert_eq!(add.pin(add.params[1]), Some(1));

        let stores: Vec<_> = add.blocks[0]
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Store { width, src, .. } => Some((*width, *src)),
                _ => None,
            })
            .collect();

        assert_eq!(
            stores,
            vec![(Width::Dword, add.params[0]), (Width::Byte, add.params[1])]
        );
    }

    #[test]
    fn falling_off_returns_zero() {
        let functions = lower_text("void f() { }");
        let text = functions[0].to_string();

        assert!(text.contains("= imm 0"), "{}", text);
        assert!(text.contains("ret %"), "{}", text);
    }

    #[test]
    fn widths_follow_types() {
        let functions = lower_text("long f(long a, char *p) { return a * 2 + *p + (a < 0); }");
        let text = functions[0].to_string();

        assert!(text.contains("mul.q"), "{}", text);
        assert!(text.contains("load.b"), "{}", text);
        assert!(text.contains("lt.q"), "{}", text);
    }

    #[test]
    fn dump_format() {
        let functions = lower_text("int main() { return 5; }");
        let expected = "function main():\n.B0:\n\t%0 = imm 5\n\tret %0\n";

        assert_eq!(functions[0].to_string(), expected);
    }
}
