//! Generación de código ensamblador.
//!
//! Existen dos emisores. [`emit_stack()`] recorre el AST tipado y evalúa
//! toda subexpresión sobre la pila de máquina. [`emit_allocated()`]
//! traduce la IR de [`crate::ir`] con los registros que reparte el
//! asignador lineal de [`regs`]. Ambos comparten la disposición de
//! secciones: datos inicializados y literales de cadena, `.bss` y
//! finalmente `.text`. La salida utiliza sintaxis Intel de GNU as.

use crate::{
    arch::x86_64::Reg,
    ast::{string_label, Global, Program},
    ir::{self, VReg},
    source::{Located, Location},
};

use std::io::{self, Write};
use thiserror::Error;

mod allocated;
mod stack;

pub mod regs;

/// Un error de generación de código.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("I/O error")]
    Io(#[from] io::Error),

    /// Hay más valores vivos que registros en el banco. No existe
    /// spilling hacia memoria.
    #[error("Register exhaustion: {live} values are live at once, but only {available} registers exist")]
    RegisterExhaustion { live: usize, available: usize },

    #[error("Value {vreg} must live in register #{register}, which is taken")]
    PinClash { vreg: VReg, register: usize },
}

pub type Codegen<T> = Result<T, Located<CodegenError>>;

/// Emite el programa completo con el emisor de pila.
pub fn emit_stack(program: &Program) -> Codegen<Vec<u8>> {
    let mut output = Vec::new();
    let io = |error| Located::at(CodegenError::Io(error), program.location.clone());

    emit_data(&mut output, program).map_err(io)?;
    for function in &program.functions {
        if let Some(body) = &function.body {
            function_label(&mut output, function.name.as_ref(), function.is_static).map_err(io)?;
            stack::emit(&mut output, function, body).map_err(io)?;
        }
    }

    Ok(output)
}

/// Emite el programa completo a partir de su IR.
pub fn emit_allocated(program: &Program, functions: &[ir::Function]) -> Codegen<Vec<u8>> {
    let mut output = Vec::new();
    let io = |location: &Location| {
        let location = location.clone();
        move |error| Located::at(CodegenError::Io(error), location)
    };

    emit_data(&mut output, program).map_err(io(&program.location))?;
    for function in functions {
        let allocation = regs::allocate::<Reg>(function)?;

        function_label(&mut output, function.name.as_ref(), function.is_static)
            .and_then(|()| allocated::emit(&mut output, function, &allocation))
            .map_err(io(&function.location))?;
    }

    Ok(output)
}

/// Secciones de datos, `.bss` y el inicio de `.text`.
fn emit_data<W: Write>(output: &mut W, program: &Program) -> io::Result<()> {
    writeln!(output, "\t.intel_syntax noprefix")?;
    writeln!(output, "\t.data")?;

    for (index, string) in program.strings.iter().enumerate() {
        writeln!(output, "{}:", string_label(index))?;
        write_bytes(output, string.iter().copied().chain(std::iter::once(0)))?;
    }

    let stored = program.globals.iter().filter(|global| !global.is_extern);
    let (initialized, zeroed): (Vec<&Global>, Vec<&Global>) =
        stored.partition(|global| global.init.is_some());

    for global in initialized {
        global_label(output, global)?;
        if let Some(init) = &global.init {
            let mut relocations = init.relocations.iter().collect::<Vec<_>>();
            relocations.sort_by_key(|relocation| relocation.offset);

            let mut cursor = 0;
            for relocation in relocations {
                let offset = relocation.offset as usize;
                write_bytes(output, init.bytes[cursor..offset].iter().copied())?;

                match relocation.addend {
                    0 => writeln!(output, "\t.quad {}", relocation.symbol)?,
                    addend => writeln!(output, "\t.quad {}{:+}", relocation.symbol, addend)?,
                }

                cursor = offset + 8;
            }

            write_bytes(output, init.bytes[cursor.min(init.bytes.len())..].iter().copied())?;
        }
    }

    writeln!(output, "\t.bss")?;
    for global in zeroed {
        global_label(output, global)?;
        writeln!(output, "\t.zero {}", global.ty.size())?;
    }

    writeln!(output, "\t.text")
}

fn global_label<W: Write>(output: &mut W, global: &Global) -> io::Result<()> {
    if !global.is_static {
        writeln!(output, "\t.globl {}", global.name)?;
    }

    writeln!(output, "\t.align {}", global.ty.align().max(1))?;
    writeln!(output, "{}:", global.name)
}

fn function_label<W: Write>(output: &mut W, name: &str, is_static: bool) -> io::Result<()> {
    if !is_static {
        writeln!(output, "\t.globl {}", name)?;
    }

    writeln!(output, "{}:", name)
}

/// Escribe bytes crudos en líneas `.byte` de a lo sumo 16 elementos.
fn write_bytes<W, I>(output: &mut W, bytes: I) -> io::Result<()>
where
    W: Write,
    I: Iterator<Item = u8>,
{
    let bytes = bytes.collect::<Vec<_>>();
    for chunk in bytes.chunks(16) {
        let line = chunk
            .iter()
            .map(|byte| byte.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        writeln!(output, "\t.byte {}", line)?;
    }

    Ok(())
}

/// Etiqueta local de una función.
fn local_label(function: &str, label: impl std::fmt::Display) -> String {
    format!(".L{}.{}", function, label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lex::Lexer, parse::parse, semantic::analyze, source::Source};
    use std::rc::Rc;

    fn program(text: &str) -> Program {
        let source = Source::new("test.c", text);
        let tokens = Lexer::new(Rc::clone(&source)).tokenize().unwrap();
        let mut program = parse(&source, &tokens).unwrap();

        analyze(&mut program, false).unwrap();
        program
    }

    fn data(text: &str) -> String {
        let mut output = Vec::new();
        emit_data(&mut output, &program(text)).unwrap();

        String::from_utf8(output).unwrap()
    }

    #[test]
    fn sections_in_order() {
        let asm = data("int x = 3; int y; char *s = \"hi\";");

        let data = asm.find("\t.data").unwrap();
        let bss = asm.find("\t.bss").unwrap();
        let text = asm.find("\t.text").unwrap();
        assert!(data < bss && bss < text);

        assert!(asm.contains(".L.str.0:\n\t.byte 104, 105, 0\n"), "{}", asm);
        assert!(asm.contains("x:\n\t.byte 3, 0, 0, 0\n"), "{}", asm);
        assert!(asm.contains("s:\n\t.quad .L.str.0\n"), "{}", asm);
        assert!(asm[bss..].contains("y:\n\t.zero 4\n"), "{}", asm);
    }

    #[test]
    fn static_and_extern_globals() {
        let asm = data("static int hidden; extern int elsewhere; int shown;");

        assert!(!asm.contains(".globl hidden"), "{}", asm);
        assert!(asm.contains("hidden:"), "{}", asm);
        assert!(!asm.contains("elsewhere"), "{}", asm);
        assert!(asm.contains(".globl shown"), "{}", asm);
    }

    #[test]
    fn relocation_addend() {
        let asm = data("int a[4]; int *p = &a[2];");
        assert!(asm.contains("p:\n\t.quad a+8\n"), "{}", asm);
    }

    #[test]
    fn static_functions_are_local() {
        let program = program("static int f() { return 1; } int main() { return f(); }");
        let asm = String::from_utf8(emit_stack(&program).unwrap()).unwrap();

        assert!(!asm.contains(".globl f\n"), "{}", asm);
        assert!(asm.contains(".globl main\n"), "{}", asm);
    }
}
