//! Compilador de un subconjunto de C hacia ensamblador x86-64.
//!
//! # Front end
//! Cada programa deriva de un único archivo de código fuente.
//! Este archivo se somete primero a análisis léxico en [`lex`], de
//! lo cual se obtiene un flujo de tokens. El preprocesador en
//! [`preprocess`] expande macros e incluye otros archivos sobre ese
//! mismo flujo. Los tokens se disponen en un AST por medio de análisis
//! sintáctico en [`parse`] y el árbol se completa con tipos durante
//! el análisis semántico en [`semantic`].
//!
//! # Back end
//! Existen dos emisores, seleccionados por [`config::Backend`]. El
//! emisor de pila recorre el AST directamente. El emisor por registros
//! reduce cada función a la representación intermedia de [`ir`] y
//! reparte registros físicos por linear scan antes de emitir. Ambos
//! producen ensamblador en sintaxis Intel, el cual [`link`] puede
//! ensamblar y enlazar por medio del compilador de C del sistema.

#[macro_use]
mod macros;

pub mod ast;
pub mod config;
pub mod error;
pub mod ir;
pub mod lex;
pub mod link;
pub mod parse;
pub mod preprocess;
pub mod semantic;
pub mod source;
pub mod types;

mod arch;
mod codegen;

pub use codegen::CodegenError;

use crate::{
    config::{Backend, Config, DumpFlags},
    error::Diagnostics,
    lex::{Lexer, Token},
    preprocess::PreprocessorError,
    source::{Located, Source},
};

use std::rc::Rc;

/// Compila un archivo fuente completo hasta ensamblador.
///
/// El primer error de cualquier fase detiene la compilación. Nunca se
/// produce salida parcial.
pub fn compile(source: Rc<Source>, config: &Config) -> Result<Vec<u8>, Diagnostics> {
    let tokens = Lexer::new(Rc::clone(&source))
        .tokenize()
        .map_err(|error| Diagnostics::from(error).kind("Lexical error"))?;

    if config.dump.contains(DumpFlags::TOKENS) {
        dump_tokens(&tokens);
    }

    let tokens = preprocess::preprocess(tokens, &config.include_dir).map_err(|error| {
        let kind = match error.val() {
            PreprocessorError::Lexer(_) => "Lexical error",
            _ => "Preprocessor error",
        };

        Diagnostics::from(error).kind(kind)
    })?;

    if config.dump.contains(DumpFlags::PREPROCESSED) {
        dump_tokens(&tokens);
    }

    let mut program = parse::parse(&source, &tokens)
        .map_err(|error| Diagnostics::from(error).kind("Syntax error"))?;

    semantic::analyze(&mut program, config.implicit_decls)
        .map_err(|error| Diagnostics::from(error).kind("Semantic error"))?;

    if config.dump.contains(DumpFlags::AST) {
        eprintln!("{:#?}", program);
    }

    let output = match config.backend {
        Backend::Stack => codegen::emit_stack(&program),
        Backend::Ir => {
            let functions = ir::lower(&program);
            if config.dump.contains(DumpFlags::IR) {
                functions.iter().for_each(|function| eprint!("{}", function));
            }

            codegen::emit_allocated(&program, &functions)
        }
    };

    output.map_err(|error| Diagnostics::from(error).kind("Code generation error"))
}

fn dump_tokens(tokens: &[Located<Token>]) {
    for token in tokens {
        eprintln!("{}\t{}", token.location(), token.val().spelling());
    }
}
