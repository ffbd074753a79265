//! Construcción de ejecutables.
//!
//! Una vez que se ha emitido código ensamblador, este debe ser
//! ensamblado y enlazado contra la biblioteca de C del sistema para
//! producir un binario ejecutable. Ambas operaciones se delegan al
//! driver `cc`.

use std::{
    io::BufWriter,
    path::Path,
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
};

use bitflags::bitflags;
use thiserror::Error;

/// Comando que ensambla y enlaza.
const DRIVER: &str = "cc";

bitflags! {
    /// Opciones a aplicar durante el enlazado.
    pub struct LinkOptions: u32 {
        /// Remover símbolos de depuración del ejecutable final.
        const STRIP = 0x01;

        /// Enlazar estáticamente.
        const STATIC = 0x02;
    }
}

/// Un error de ensamblado o enlazado.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LinkerError {
    /// Ocurrió un evento de error de E/S durante la invocación
    /// de comandos externos.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// El enlazador inició su ejecución, pero falló en enlazar.
    #[error("Linker exited with status code {0:?}")]
    Failed(ExitStatus),
}

/// Instancia del enlazador para un ejecutable definido.
pub struct Linker {
    child: Child,
    stdin: BufWriter<ChildStdin>,
}

impl Linker {
    /// Inicia una instancia del enlazador.
    ///
    /// El enlazador tratará de emitir un ejecutable y escribirlo a
    /// la ruta indicada por `output`.
    pub fn spawn<O>(output: &O, opts: LinkOptions) -> Result<Self, LinkerError>
    where
        O: AsRef<Path>,
    {
        // Para ensamblar el código generado se hace pipe del mismo al stdin del driver
        let mut command = Command::new(DRIVER);
        command
            .arg("-o")
            .arg(output.as_ref())
            .args(&["-xassembler", "-"])
            .stdin(Stdio::piped());

        if opts.contains(LinkOptions::STRIP) {
            command.arg("-s");
        }

        if opts.contains(LinkOptions::STATIC) {
            command.arg("-static");
        }

        log::debug!("spawning {:?}", command);

        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "linker stdin is not piped")
        })?;

        Ok(Linker {
            child,
            stdin: BufWriter::new(stdin),
        })
    }

    /// Obtiene la entrada estándar del proceso que espera recibir ensamblador.
    pub fn stdin(&mut self) -> &mut BufWriter<ChildStdin> {
        &mut self.stdin
    }

    /// Indica el fin del flujo de código y finaliza el enlazado.
    pub fn finish(mut self) -> Result<(), LinkerError> {
        self.stdin.into_inner().map_err(|error| error.into_error())?;

        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(LinkerError::Failed(status))
        }
    }
}
