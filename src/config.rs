//! Configuración de una compilación.

use bitflags::bitflags;
use std::{path::PathBuf, str::FromStr};
use thiserror::Error;

/// Opciones que controlan una invocación de [`crate::compile()`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Directorio en el que se resuelven los `#include "..."`.
    pub include_dir: PathBuf,

    pub backend: Backend,

    /// Llamar a funciones no declaradas es válido y se asume que
    /// retornan `int`.
    pub implicit_decls: bool,

    pub dump: DumpFlags,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            include_dir: PathBuf::from("./include"),
            backend: Backend::default(),
            implicit_decls: false,
            dump: DumpFlags::empty(),
        }
    }
}

/// Emisor de código.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Evaluación de expresiones sobre la pila de máquina.
    Stack,

    /// Generación de IR y asignación de registros.
    Ir,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Ir
    }
}

#[derive(Error, Debug)]
#[error("Unknown backend `{0}`, expected `stack` or `ir`")]
pub struct UnknownBackend(String);

impl FromStr for Backend {
    type Err = UnknownBackend;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        match string {
            "stack" => Ok(Backend::Stack),
            "ir" => Ok(Backend::Ir),
            _ => Err(UnknownBackend(string.to_owned())),
        }
    }
}

bitflags! {
    /// Volcados de diagnóstico hacia stderr.
    ///
    /// Ninguno de ellos altera el ensamblador emitido.
    pub struct DumpFlags: u32 {
        /// Tokens tal como salen del lexer.
        const TOKENS = 0x01;

        /// Tokens luego de preprocesar.
        const PREPROCESSED = 0x02;

        /// AST con tipos resueltos.
        const AST = 0x04;

        /// IR de cada función.
        const IR = 0x08;
    }
}
