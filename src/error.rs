//! Reporte de errores.
//!
//! Toda fase del compilador falla con un error ubicado ([`Located`]).
//! [`Diagnostics`] toma el primer error encontrado y lo dispone en
//! forma legible, señalando la línea y columnas exactas del token que
//! lo originó.

use crate::source::{Located, Location};
use std::{
    error::Error,
    fmt::{self, Debug, Display},
};

mod sealed {
    pub trait Sealed {}
}

pub trait LocatedError: sealed::Sealed {
    fn source(&self) -> &dyn Error;
    fn location(&self) -> &Location;
}

pub struct Diagnostics {
    kind: &'static str,
    errors: Vec<Box<dyn 'static + LocatedError>>,
}

impl Diagnostics {
    pub fn kind(self, kind: &'static str) -> Self {
        Diagnostics { kind, ..self }
    }

    /// Mensaje del primer error, sin ubicación.
    pub fn message(&self) -> Option<String> {
        self.errors.first().map(|error| error.source().to_string())
    }

    /// Ubicación del primer error.
    pub fn first_location(&self) -> Option<&Location> {
        self.errors.first().map(|error| error.location())
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics {
            kind: "error",
            errors: Default::default(),
        }
    }
}

impl<E: 'static + LocatedError> From<E> for Diagnostics {
    fn from(error: E) -> Self {
        Diagnostics {
            errors: vec![Box::new(error)],
            ..Default::default()
        }
    }
}

impl Display for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Diagnostics { kind, errors } = self;

        if errors.is_empty() {
            return writeln!(fmt, "No errors were reported");
        }

        for error in errors {
            writeln!(fmt, "{}: {}", kind, error.source())?;

            let location = error.location();
            writeln!(fmt, " --> {}", location)?;

            let (start, end) = (location.start_position(), location.end());
            let digits = end.line().to_string().chars().count();
            writeln!(fmt, "{:digits$} |", "", digits = digits)?;

            for line_number in start.line()..=end.line().max(start.line()) {
                location.source().with_line(line_number, |line| {
                    writeln!(fmt, "{:>digits$} | {}", line_number, line, digits = digits)
                })?
            }

            // Tokens de varias líneas solo se subrayan en su primera columna
            let (from, to) = if start.line() == end.line() {
                (start.column(), end.column().max(start.column() + 1) - 1)
            } else {
                (start.column(), start.column())
            };

            let skip = (from - 1) as usize;
            let highlight = (to - from + 1) as usize;

            writeln!(
                fmt,
                "{:digits$} | {:skip$}{:^<highlight$}",
                "",
                "",
                "",
                digits = digits,
                skip = skip,
                highlight = highlight
            )?;

            writeln!(fmt)?;
        }

        let error_or_errors = if errors.len() == 1 { "error" } else { "errors" };
        writeln!(
            fmt,
            "Build failed with {} {}",
            errors.len(),
            error_or_errors
        )
    }
}

impl Debug for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, fmt)
    }
}

impl Error for Diagnostics {}

impl<E: Error> sealed::Sealed for Located<E> {}

impl<E: Error> LocatedError for Located<E> {
    fn source(&self) -> &dyn Error {
        self.as_ref()
    }

    fn location(&self) -> &Location {
        Located::location(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Position, Source};
    use std::rc::Rc;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("Bad thing")]
    struct BadThing;

    #[test]
    fn renders_caret_under_token() {
        let source = Source::new("t.c", "int main() {\n  return @;\n}\n");
        let location = Location::new(
            Rc::clone(&source),
            Position::new(2, 10)..Position::new(2, 11),
        );

        let rendered = Diagnostics::from(Located::at(BadThing, location))
            .kind("Lexical error")
            .to_string();

        let expected = "Lexical error: Bad thing\n \
                        --> t.c:2:10\n  \
                        |\n\
                        2 |   return @;\n  \
                        |          ^\n\n\
                        Build failed with 1 error\n";

        assert_eq!(rendered, expected);
    }
}
