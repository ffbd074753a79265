//! Representación intermedia.
//!
//! Cada función se reduce a una lista lineal de bloques básicos cuyas
//! instrucciones operan sobre registros virtuales ([`VReg`]) ilimitados.
//! Las variables viven en el stack frame; un registro virtual solo
//! transporta el resultado de una subexpresión y nunca sobrevive a un
//! salto hacia atrás. Esto permite que el asignador lineal en
//! [`crate::codegen::regs`] calcule intervalos de vida sobre el orden
//! textual de las instrucciones.

use crate::{
    ast::{BinOp, UnOp},
    lex::Identifier,
    source::Location,
    types::Type,
};

use std::fmt::{self, Display};

mod lower;

pub use lower::lower;

/// Registro virtual.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VReg(pub u32);

/// Identificador de bloque básico, único dentro de su función.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Ancho de operando.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Width {
    Byte,
    Dword,
    Qword,
}

impl Width {
    /// Ancho de un valor almacenado con el tipo indicado.
    pub fn of(ty: &Type) -> Width {
        match ty {
            Type::Char => Width::Byte,
            Type::Int => Width::Dword,
            _ => Width::Qword,
        }
    }

    /// Ancho de una operación aritmética; nunca menor a 32 bits.
    pub fn arithmetic(ty: &Type) -> Width {
        match Width::of(ty) {
            Width::Byte => Width::Dword,
            width => width,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Instruction {
    Imm {
        dst: VReg,
        value: i64,
    },

    /// Dirección de un símbolo.
    Label {
        dst: VReg,
        symbol: String,
    },

    /// Dirección de una variable local.
    LocalAddr {
        dst: VReg,
        offset: u32,
    },

    Mov {
        dst: VReg,
        src: VReg,
    },

    Binary {
        op: BinOp,
        width: Width,
        dst: VReg,
        lhs: VReg,
        rhs: VReg,
    },

    Unary {
        op: UnOp,
        width: Width,
        dst: VReg,
        src: VReg,
    },

    /// Trunca a `width` y extiende el signo de vuelta a 64 bits.
    Cast {
        width: Width,
        dst: VReg,
        src: VReg,
    },

    Load {
        width: Width,
        dst: VReg,
        addr: VReg,
    },

    Store {
        width: Width,
        addr: VReg,
        src: VReg,
    },

    Call {
        dst: VReg,
        name: Identifier,
        args: Vec<VReg>,
        width: Width,
    },

    Branch {
        cond: VReg,
        then: BlockId,
        els: BlockId,
    },

    Jump(BlockId),
    Return(Option<VReg>),
}

impl Instruction {
    /// Registro escrito por la instrucción, si existe.
    pub fn def(&self) -> Option<VReg> {
        use Instruction::*;

        match self {
            Imm { dst, .. }
            | Label { dst, .. }
            | LocalAddr { dst, .. }
            | Mov { dst, .. }
            | Binary { dst, .. }
            | Unary { dst, .. }
            | Cast { dst, .. }
            | Load { dst, .. }
            | Call { dst, .. } => Some(*dst),

            Store { .. } | Branch { .. } | Jump(_) | Return(_) => None,
        }
    }

    /// Registros leídos por la instrucción.
    pub fn uses(&self) -> Vec<VReg> {
        use Instruction::*;

        match self {
            Imm { .. } | Label { .. } | LocalAddr { .. } | Jump(_) | Return(None) => Vec::new(),
            Mov { src, .. } | Unary { src, .. } | Cast { src, .. } => vec![*src],
            Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Load { addr, .. } => vec![*addr],
            Store { addr, src, .. } => vec![*addr, *src],
            Call { args, .. } => args.clone(),
            Branch { cond, .. } => vec![*cond],
            Return(Some(value)) => vec![*value],
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Branch { .. } | Instruction::Jump(_) | Instruction::Return(_)
        )
    }
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug)]
pub struct Function {
    pub name: Identifier,

    /// Un registro por parámetro, en orden.
    pub params: Vec<VReg>,

    pub blocks: Vec<Block>,

    /// Registros que deben ocupar un registro físico específico,
    /// indicado por su índice en el banco de asignación.
    pub pins: Vec<(VReg, usize)>,

    pub stack_size: u32,
    pub is_static: bool,
    pub location: Location,
}

impl Function {
    pub fn pin(&self, vreg: VReg) -> Option<usize> {
        self.pins
            .iter()
            .find(|(pinned, _)| *pinned == vreg)
            .map(|&(_, index)| index)
    }
}

impl Display for VReg {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "%{}", self.0)
    }
}

impl Display for BlockId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, ".B{}", self.0)
    }
}

impl Display for Width {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self {
            Width::Byte => "b",
            Width::Dword => "d",
            Width::Qword => "q",
        };

        fmt.write_str(suffix)
    }
}

impl Display for Instruction {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;

        let lower = |op: &dyn fmt::Debug| format!("{:?}", op).to_lowercase();

        match self {
            Imm { dst, value } => write!(fmt, "{} = imm {}", dst, value),
            Label { dst, symbol } => write!(fmt, "{} = label {}", dst, symbol),
            LocalAddr { dst, offset } => write!(fmt, "{} = local -{}", dst, offset),
            Mov { dst, src } => write!(fmt, "{} = mov {}", dst, src),

            Binary {
                op,
                width,
                dst,
                lhs,
                rhs,
            } => write!(fmt, "{} = {}.{} {}, {}", dst, lower(op), width, lhs, rhs),

            Unary {
                op,
                width,
                dst,
                src,
            } => write!(fmt, "{} = {}.{} {}", dst, lower(op), width, src),

            Cast { width, dst, src } => write!(fmt, "{} = cast.{} {}", dst, width, src),
            Load { width, dst, addr } => write!(fmt, "{} = load.{} [{}]", dst, width, addr),
            Store { width, addr, src } => write!(fmt, "store.{} [{}], {}", width, addr, src),

            Call {
                dst,
                name,
                args,
                width,
            } => {
                write!(fmt, "{} = call.{} {}(", dst, width, name)?;
                for (i, arg) in args.iter().enumerate() {
                    let separator = if i > 0 { ", " } else { "" };
                    write!(fmt, "{}{}", separator, arg)?;
                }

                fmt.write_str(")")
            }

            Branch { cond, then, els } => write!(fmt, "br {}, {}, {}", cond, then, els),
            Jump(target) => write!(fmt, "jmp {}", target),
            Return(Some(value)) => write!(fmt, "ret {}", value),
            Return(None) => fmt.write_str("ret"),
        }
    }
}

impl Display for Function {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "function {}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            let separator = if i > 0 { ", " } else { "" };
            write!(fmt, "{}{}", separator, param)?;
        }

        writeln!(fmt, "):")?;
        for block in &self.blocks {
            writeln!(fmt, "{}:", block.id)?;
            for instruction in &block.instructions {
                writeln!(fmt, "\t{}", instruction)?;
            }
        }

        Ok(())
    }
}
