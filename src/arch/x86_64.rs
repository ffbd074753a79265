use crate::ir::Width;
use std::fmt;

/// Registros que reparte el asignador.
///
/// `r10` y `r11` son caller-saved y se preservan alrededor de cada
/// llamada; el resto son callee-saved y se preservan en el prólogo de
/// las funciones que los usan. `rax`, `rcx`, `rdx` y los registros de
/// argumentos quedan libres como temporales del emisor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reg {
    R10,
    R11,
    Rbx,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    pub fn name(self, width: Width) -> &'static str {
        use Reg::*;

        let names = match self {
            R10 => ["r10b", "r10d", "r10"],
            R11 => ["r11b", "r11d", "r11"],
            Rbx => ["bl", "ebx", "rbx"],
            R12 => ["r12b", "r12d", "r12"],
            R13 => ["r13b", "r13d", "r13"],
            R14 => ["r14b", "r14d", "r14"],
            R15 => ["r15b", "r15d", "r15"],
        };

        sized(width, names)
    }

    pub fn is_callee_saved(self) -> bool {
        !matches!(self, Reg::R10 | Reg::R11)
    }
}

impl super::Register for Reg {
    const FILE: &'static [Self] = {
        use Reg::*;
        &[R10, R11, Rbx, R12, R13, R14, R15]
    };
}

/// Registros de argumentos enteros.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    Rdi,
    Rsi,
    Rdx,
    Rcx,
    R8,
    R9,
}

impl Arg {
    /* La ABI indica que se coloquen los primeros 6 argumentos en los registros %rdi, %rsi, %rdx, %rcx,
     * %r8 y %r9. Los argumentos en stack no se soportan.
     */
    pub const MAX_ARGS: usize = 6;

    pub fn sequence() -> impl Iterator<Item = Arg> {
        use Arg::*;

        std::iter::successors(Some(Rdi), |last| match last {
            Rdi => Some(Rsi),
            Rsi => Some(Rdx),
            Rdx => Some(Rcx),
            Rcx => Some(R8),
            R8 => Some(R9),
            R9 => None,
        })
    }

    pub fn name(self, width: Width) -> &'static str {
        use Arg::*;

        let names = match self {
            Rdi => ["dil", "edi", "rdi"],
            Rsi => ["sil", "esi", "rsi"],
            Rdx => ["dl", "edx", "rdx"],
            Rcx => ["cl", "ecx", "rcx"],
            R8 => ["r8b", "r8d", "r8"],
            R9 => ["r9b", "r9d", "r9"],
        };

        sized(width, names)
    }
}

/// Temporales de los emisores, fuera del banco del asignador.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scratch {
    Rax,
    Rcx,
    Rdx,
    Rdi,
}

impl Scratch {
    pub fn name(self, width: Width) -> &'static str {
        use Scratch::*;

        let names = match self {
            Rax => ["al", "eax", "rax"],
            Rcx => ["cl", "ecx", "rcx"],
            Rdx => ["dl", "edx", "rdx"],
            Rdi => ["dil", "edi", "rdi"],
        };

        sized(width, names)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name(Width::Qword))
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name(Width::Qword))
    }
}

impl fmt::Display for Scratch {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name(Width::Qword))
    }
}

/// Relleno para mantener `rsp` alineado a 16 bytes tras `pushed`
/// valores de 8 bytes.
pub fn alignment_for(pushed: usize) -> usize {
    pushed % 2
}

/// Directiva de datos y tamaño de un operando en memoria.
pub fn ptr_size(width: Width) -> &'static str {
    match width {
        Width::Byte => "byte ptr",
        Width::Dword => "dword ptr",
        Width::Qword => "qword ptr",
    }
}

fn sized(width: Width, [byte, dword, qword]: [&'static str; 3]) -> &'static str {
    match width {
        Width::Byte => byte,
        Width::Dword => dword,
        Width::Qword => qword,
    }
}
