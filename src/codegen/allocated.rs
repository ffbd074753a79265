//! Emisión de IR con registros asignados.
//!
//! Todo valor en un registro del banco se mantiene extendido en signo a
//! 64 bits. Las operaciones de 32 bits se realizan sobre `rax` y se
//! extienden de vuelta con `movsxd` al escribir el destino.

use super::{local_label, regs::Allocation};
use crate::{
    arch::x86_64::{alignment_for, ptr_size, Arg, Reg, Scratch},
    ast::{BinOp, UnOp},
    ir::{BlockId, Function, Instruction, VReg, Width},
};

use std::io::{self, Write};

pub fn emit<W: Write>(
    output: &mut W,
    function: &Function,
    allocation: &Allocation<Reg>,
) -> io::Result<()> {
    let saved = allocation
        .used()
        .iter()
        .copied()
        .filter(|reg| reg.is_callee_saved())
        .collect::<Vec<_>>();

    let mut emitter = Emitter {
        output,
        function,
        allocation,
        saved,
        next: None,
    };

    emitter.prologue()?;

    let blocks = &function.blocks;
    for (index, block) in blocks.iter().enumerate() {
        emitter.next = blocks.get(index + 1).map(|next| next.id);

        let label = emitter.block_label(block.id);
        writeln!(emitter.output, "{}:", label)?;
        for instruction in &block.instructions {
            emitter.instruction(instruction)?;
        }
    }

    emitter.epilogue()
}

struct Emitter<'a, W> {
    output: &'a mut W,
    function: &'a Function,
    allocation: &'a Allocation<Reg>,

    /// Registros callee-saved que deben preservarse.
    saved: Vec<Reg>,

    /// Bloque que sigue inmediatamente al actual.
    next: Option<BlockId>,
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

        for reg in self.saved.clone() {
            emit!(self, "push", "{}", reg)?;
        }

        if alignment_for(self.saved.len()) > 0 {
            emit!(self, "sub", "rsp, 8")?;
        }

        // Los parámetros pasan de registros de argumentos a sus registros asignados
        for (&param, arg) in self.function.params.iter().zip(Arg::sequence()) {
            let reg = self.reg(param)?;
            emit!(self, "mov", "{}, {}", reg, arg)?;
        }

        Ok(())
    }

    fn epilogue(&mut self) -> io::Result<()> {
        let label = self.return_label();
        writeln!(self.output, "{}:", label)?;

        if alignment_for(self.saved.len()) > 0 {
            emit!(self, "add", "rsp, 8")?;
        }

        for reg in self.saved.clone().into_iter().rev() {
            emit!(self, "pop", "{}", reg)?;
        }

        emit!(self, "leave")?;
        emit!(self, "ret")
    }

    fn instruction(&mut self, instruction: &Instruction) -> io::Result<()> {
        use Instruction::*;

        match instruction {
            Imm { dst, value } => {
                let dst = self.reg(*dst)?;
                emit!(self, "mov", "{}, {}", dst, value)
            }

            Label { dst, symbol } => {
                let dst = self.reg(*dst)?;
                emit!(self, "lea", "{}, [rip + {}]", dst, symbol)
            }

            LocalAddr { dst, offset } => {
                let dst = self.reg(*dst)?;
                emit!(self, "lea", "{}, [rbp - {}]", dst, offset)
            }

            Mov { dst, src } => {
                let (dst, src) = (self.reg(*dst)?, self.reg(*src)?);
                if dst != src {
                    emit!(self, "mov", "{}, {}", dst, src)?;
                }

                Ok(())
            }

            Binary {
                op,
                width,
                dst,
                lhs,
                rhs,
            } => self.binary(*op, *width, *dst, *lhs, *rhs),

            Unary {
                op,
                width,
                dst,
                src,
            } => self.unary(*op, *width, *dst, *src),

            Cast { width, dst, src } => {
                let (dst, src) = (self.reg(*dst)?, self.reg(*src)?);
                match width {
                    Width::Byte => emit!(self, "movsx", "{}, {}", dst, src.name(Width::Byte)),
                    Width::Dword => emit!(self, "movsxd", "{}, {}", dst, src.name(Width::Dword)),
                    Width::Qword if dst != src => emit!(self, "mov", "{}, {}", dst, src),
                    Width::Qword => Ok(()),
                }
            }

            Load { width, dst, addr } => {
                let (dst, addr) = (self.reg(*dst)?, self.reg(*addr)?);
                let opcode = match width {
                    Width::Byte => "movsx",
                    Width::Dword => "movsxd",
                    Width::Qword => "mov",
                };

                emit!(self, opcode, "{}, {} [{}]", dst, ptr_size(*width), addr)
            }

            Store { width, addr, src } => {
                let (addr, src) = (self.reg(*addr)?, self.reg(*src)?);
                emit!(self, "mov", "{} [{}], {}", ptr_size(*width), addr, src.name(*width))
            }

            Call {
                dst,
                name,
                args,
                width,
            } => {
                emit!(self, "push", "{}", Reg::R10)?;
                emit!(self, "push", "{}", Reg::R11)?;

                for (&arg, register) in args.iter().zip(Arg::sequence()) {
                    let arg = self.reg(arg)?;
                    emit!(self, "mov", "{}, {}", register, arg)?;
                }

                // Cantidad de registros vectoriales para funciones variádicas
                emit!(self, "mov", "eax, 0")?;
                emit!(self, "call", "{}", name)?;

                emit!(self, "pop", "{}", Reg::R11)?;
                emit!(self, "pop", "{}", Reg::R10)?;

                let dst = self.reg(*dst)?;
                self.extend(dst, *width)
            }

            Branch { cond, then, els } => {
                let cond = self.reg(*cond)?;
                emit!(self, "cmp", "{}, 0", cond)?;

                if self.next == Some(*then) {
                    let target = self.block_label(*els);
                    emit!(self, "je", "{}", target)
                } else {
                    let target = self.block_label(*then);
                    emit!(self, "jne", "{}", target)?;
                    self.jump(*els)
                }
            }

            Jump(target) => self.jump(*target),

            Return(value) => {
                if let Some(value) = value {
                    let value = self.reg(*value)?;
                    emit!(self, "mov", "rax, {}", value)?;
                }

                let target = self.return_label();
                emit!(self, "jmp", "{}", target)
            }
        }
    }

    fn binary(&mut self, op: BinOp, width: Width, dst: VReg, lhs: VReg, rhs: VReg) -> io::Result<()> {
        use BinOp::*;

        let (dst, lhs, rhs) = (self.reg(dst)?, self.reg(lhs)?, self.reg(rhs)?);
        let (rax, rhs_w) = (Scratch::Rax.name(width), rhs.name(width));

        let opcode = match op {
            Add => "add",
            Sub => "sub",
            Mul => "imul",
            BitAnd => "and",
            BitOr => "or",
            BitXor => "xor",

            Div | Mod => {
                emit!(self, "mov", "rax, {}", lhs)?;
                emit!(self, if width == Width::Qword { "cqo" } else { "cdq" })?;
                emit!(self, "idiv", "{}", rhs_w)?;

                let result = if op == Div { Scratch::Rax } else { Scratch::Rdx };
                return self.extend_from(dst, result, width);
            }

            Shl | Shr => {
                emit!(self, "mov", "rax, {}", lhs)?;
                emit!(self, "mov", "rcx, {}", rhs)?;
                emit!(self, if op == Shl { "shl" } else { "sar" }, "{}, cl", rax)?;

                return self.extend(dst, width);
            }

            Eq | Ne | Lt | Le => {
                let set = match op {
                    Eq => "sete",
                    Ne => "setne",
                    Lt => "setl",
                    _ => "setle",
                };

                emit!(self, "cmp", "{}, {}", lhs.name(width), rhs_w)?;
                emit!(self, set, "al")?;
                return emit!(self, "movzx", "{}, al", dst);
            }

            LogAnd | LogOr => {
                emit!(self, "cmp", "{}, 0", lhs)?;
                emit!(self, "setne", "al")?;
                emit!(self, "cmp", "{}, 0", rhs)?;
                emit!(self, "setne", "cl")?;
                emit!(self, if op == LogAnd { "and" } else { "or" }, "al, cl")?;
                return emit!(self, "movzx", "{}, al", dst);
            }
        };

        emit!(self, "mov", "rax, {}", lhs)?;
        emit!(self, opcode, "{}, {}", rax, rhs_w)?;
        self.extend(dst, width)
    }

    fn unary(&mut self, op: UnOp, width: Width, dst: VReg, src: VReg) -> io::Result<()> {
        let (dst, src) = (self.reg(dst)?, self.reg(src)?);

        match op {
            UnOp::Not => {
                emit!(self, "cmp", "{}, 0", src)?;
                emit!(self, "sete", "al")?;
                emit!(self, "movzx", "{}, al", dst)
            }

            UnOp::Neg | UnOp::BitNot => {
                let opcode = if op == UnOp::Neg { "neg" } else { "not" };

                emit!(self, "mov", "rax, {}", src)?;
                emit!(self, opcode, "{}", Scratch::Rax.name(width))?;
                self.extend(dst, width)
            }
        }
    }

    /// Copia `rax` a `dst` extendiendo el signo desde `width`.
    fn extend(&mut self, dst: Reg, width: Width) -> io::Result<()> {
        self.extend_from(dst, Scratch::Rax, width)
    }

    fn extend_from(&mut self, dst: Reg, src: Scratch, width: Width) -> io::Result<()> {
        match width {
            Width::Byte => emit!(self, "movsx", "{}, {}", dst, src.name(Width::Byte)),
            Width::Dword => emit!(self, "movsxd", "{}, {}", dst, src.name(Width::Dword)),
            Width::Qword => emit!(self, "mov", "{}, {}", dst, src),
        }
    }

    fn jump(&mut self, target: BlockId) -> io::Result<()> {
        if self.next == Some(target) {
            return Ok(());
        }

        let target = self.block_label(target);
        emit!(self, "jmp", "{}", target)
    }

    fn reg(&self, vreg: VReg) -> io::Result<Reg> {
        self.allocation.get(vreg).ok_or_else(|| {
            let message = format!("{} in `{}` has no register", vreg, self.function.name);
            io::Error::new(io::ErrorKind::Other, message)
        })
    }

    fn block_label(&self, id: BlockId) -> String {
        local_label(self.function.name.as_ref(), id.0)
    }

    fn return_label(&self) -> String {
        local_label(self.function.name.as_ref(), "return")
    }
}
