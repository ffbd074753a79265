//! Detalles específicos de la arquitectura objetivo.
//!
//! El único objetivo es x86-64 bajo la ABI System V. Los emisores en
//! [`crate::codegen`] obtienen de aquí los nombres de registros, la
//! secuencia de registros de argumentos y el banco de registros que
//! reparte el asignador lineal.

use std::fmt::Debug;

pub mod x86_64;

/// Registro de procesador asignable.
pub trait Register: Copy + Eq + Debug + 'static {
    /// Banco de registros disponibles para el asignador, en orden de
    /// preferencia. El índice de un registro en este banco es el que
    /// utilizan los pines de [`crate::ir::Function`].
    const FILE: &'static [Self];
}
