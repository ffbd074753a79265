//! Análisis léxico.
//!
//! # Tokenization
//! Esta es la primera fase del compilador. Descompone el texto de un
//! [`Source`] en unidades léxicas denominadas tokens. Los espacios
//! en blanco y los comentarios se descartan durante esta operación. Cada
//! token emitido esta asociado a una ubicación en el código fuente original,
//! lo cual permite rastrear errores en tanto los mismos como constructos
//! más elevados de fases posteriores.
//!
//! # Contenido de un token
//! Operadores, puntuación y palabras clave se identifican por el hecho de
//! lo que son y no incluyen lexemas. Los identificadores sí incluyen su
//! lexema original. Las constantes literales (enteras, de carácter y
//! cadenas) se resuelven a sus valores en vez de preservar sus lexemas.
//!
//! # Inicio de línea
//! Cada token lleva una marca que indica si es el primero de su línea.
//! El preprocesador depende de esto para reconocer directivas y para
//! determinar dónde termina el cuerpo de un `#define`.
//!
//! # Errores
//! Todo error léxico es fatal: el lexer se detiene en el primero.

use crate::source::{Located, Location, Position, Source};
use std::{
    fmt::{self, Display},
    rc::Rc,
    str::FromStr,
};

use thiserror::Error;

/// Error de escaneo.
#[non_exhaustive]
#[derive(Error, Debug, PartialEq)]
pub enum LexerError {
    /// Carácter desconocido o inesperado en el flujo de entrada.
    #[error("Bad character {0:?} in input stream")]
    BadChar(char),

    /// Una cadena no se cerró antes del fin de línea.
    #[error("Unterminated string literal")]
    UnterminatedString,

    /// Un literal de carácter no se cerró.
    #[error("Unterminated character literal")]
    UnterminatedChar,

    /// Un comentario `/*` no encontró su `*/`.
    #[error("Unterminated comment")]
    UnterminatedComment,

    /// Secuencia de escape desconocida.
    #[error("Unknown escape sequence '\\{0}'")]
    BadEscape(char),

    /// Un literal de carácter vacío, `''`.
    #[error("Empty character literal")]
    EmptyChar,

    /// Una constante entera se encuentra fuera de rango.
    #[error("Integer literal overflow, valid range is [0, {}]", i64::MAX)]
    IntOverflow,
}

/// Un identificador.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(Rc<str>);

impl Identifier {
    pub fn new(name: &str) -> Self {
        Identifier(Rc::from(name))
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Identifier::new(name)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Identifier {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// Objeto resultante del análisis léxico.
///
/// Un token contiene suficiente información para describir completamente
/// a una entidad léxica en el programa fuente.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,

    /// Verdadero si ningún otro token precede a este en su línea.
    pub bol: bool,
}

impl Token {
    pub fn new(kind: TokenKind, bol: bool) -> Self {
        Token { kind, bol }
    }

    pub fn is(&self, punct: Punct) -> bool {
        self.kind == TokenKind::Punct(punct)
    }

    pub fn is_keyword(&self, keyword: Keyword) -> bool {
        self.kind == TokenKind::Keyword(keyword)
    }

    pub fn id(&self) -> Option<&Identifier> {
        match &self.kind {
            TokenKind::Id(id) => Some(id),
            _ => None,
        }
    }

    /// Texto que reproduce al token en código fuente.
    pub fn spelling(&self) -> String {
        match &self.kind {
            TokenKind::Id(id) => id.to_string(),
            TokenKind::Keyword(keyword) => keyword.to_string(),
            TokenKind::Int(value) => value.to_string(),
            TokenKind::Str(bytes) => format!("\"{}\"", String::from_utf8_lossy(bytes)),
            TokenKind::Punct(punct) => punct.spelling().to_owned(),
        }
    }
}

impl Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(fmt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Identificador.
    Id(Identifier),

    /// Palabra clave.
    Keyword(Keyword),

    /// Literal entero o de carácter.
    Int(i64),

    /// Literal de cadena, ya decodificado y sin terminador nulo.
    Str(Rc<[u8]>),

    /// Operador o signo de puntuación.
    Punct(Punct),
}

impl Display for TokenKind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TokenKind::*;

        match self {
            Id(id) => write!(fmt, "identifier `{}`", id),
            Keyword(keyword) => write!(fmt, "keyword `{}`", keyword),
            Int(integer) => write!(fmt, "literal `{}`", integer),
            Str(bytes) => write!(fmt, "string literal {:?}", String::from_utf8_lossy(bytes)),
            Punct(punct) => write!(fmt, "`{}`", punct.spelling()),
        }
    }
}

/// Una palabra clave.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    Char,
    Int,
    Long,
    Void,
    Struct,
    Enum,
    Typedef,
    Sizeof,
    Alignof,
    If,
    Else,
    While,
    Do,
    For,
    Switch,
    Case,
    Default,
    Break,
    Continue,
    Return,
    Extern,
    Static,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("char",     Keyword::Char),
    ("int",      Keyword::Int),
    ("long",     Keyword::Long),
    ("void",     Keyword::Void),
    ("struct",   Keyword::Struct),
    ("enum",     Keyword::Enum),
    ("typedef",  Keyword::Typedef),
    ("sizeof",   Keyword::Sizeof),
    ("_Alignof", Keyword::Alignof),
    ("if",       Keyword::If),
    ("else",     Keyword::Else),
    ("while",    Keyword::While),
    ("do",       Keyword::Do),
    ("for",      Keyword::For),
    ("switch",   Keyword::Switch),
    ("case",     Keyword::Case),
    ("default",  Keyword::Default),
    ("break",    Keyword::Break),
    ("continue", Keyword::Continue),
    ("return",   Keyword::Return),
    ("extern",   Keyword::Extern),
    ("static",   Keyword::Static),
];

impl Display for Keyword {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, _) = KEYWORDS
            .iter()
            .find(|(_, keyword)| keyword == self)
            .ok_or(fmt::Error)?;

        fmt.write_str(name)
    }
}

impl FromStr for Keyword {
    type Err = ();

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        KEYWORDS
            .iter()
            .find(|&&(name, _)| name == string)
            .map(|&(_, keyword)| keyword)
            .ok_or(())
    }
}

/// Operadores y signos de puntuación.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Punct {
    Ellipsis,
    ShlAssign,
    ShrAssign,
    Arrow,
    Inc,
    Dec,
    Shl,
    Shr,
    Le,
    Ge,
    Eq,
    Ne,
    AndAnd,
    OrOr,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Lt,
    Gt,
    Assign,
    OpenParen,
    CloseParen,
    OpenCurly,
    CloseCurly,
    OpenSquare,
    CloseSquare,
    Semicolon,
    Comma,
    Period,
    Question,
    Colon,
    Hash,
}

/// Tabla de puntuación, ordenada de la más larga a la más corta para
/// que la primera coincidencia sea también la más larga.
const PUNCTUATORS: &[(&str, Punct)] = &[
    ("...", Punct::Ellipsis),
    ("<<=", Punct::ShlAssign),
    (">>=", Punct::ShrAssign),
    ("->",  Punct::Arrow),
    ("++",  Punct::Inc),
    ("--",  Punct::Dec),
    ("<<",  Punct::Shl),
    (">>",  Punct::Shr),
    ("<=",  Punct::Le),
    (">=",  Punct::Ge),
    ("==",  Punct::Eq),
    ("!=",  Punct::Ne),
    ("&&",  Punct::AndAnd),
    ("||",  Punct::OrOr),
    ("+=",  Punct::AddAssign),
    ("-=",  Punct::SubAssign),
    ("*=",  Punct::MulAssign),
    ("/=",  Punct::DivAssign),
    ("%=",  Punct::ModAssign),
    ("&=",  Punct::AndAssign),
    ("|=",  Punct::OrAssign),
    ("^=",  Punct::XorAssign),
    ("+",   Punct::Plus),
    ("-",   Punct::Minus),
    ("*",   Punct::Star),
    ("/",   Punct::Slash),
    ("%",   Punct::Percent),
    ("&",   Punct::Amp),
    ("|",   Punct::Pipe),
    ("^",   Punct::Caret),
    ("~",   Punct::Tilde),
    ("!",   Punct::Bang),
    ("<",   Punct::Lt),
    (">",   Punct::Gt),
    ("=",   Punct::Assign),
    ("(",   Punct::OpenParen),
    (")",   Punct::CloseParen),
    ("{",   Punct::OpenCurly),
    ("}",   Punct::CloseCurly),
    ("[",   Punct::OpenSquare),
    ("]",   Punct::CloseSquare),
    (";",   Punct::Semicolon),
    (",",   Punct::Comma),
    (".",   Punct::Period),
    ("?",   Punct::Question),
    (":",   Punct::Colon),
    ("#",   Punct::Hash),
];

impl Punct {
    pub fn spelling(self) -> &'static str {
        PUNCTUATORS
            .iter()
            .find(|&&(_, punct)| punct == self)
            .map(|&(spelling, _)| spelling)
            .unwrap_or("?")
    }
}

/// Escáner de un archivo fuente.
///
/// El lexer recorre el texto una única vez de izquierda a derecha,
/// llevando la posición línea-columna de cada byte y la marca de
/// inicio de línea pendiente para el siguiente token.
pub struct Lexer {
    source: Rc<Source>,
    offset: usize,
    position: Position,
    bol: bool,
}

impl Lexer {
    /// Crea un lexer en estado inicial a partir de un archivo.
    pub fn new(source: Rc<Source>) -> Self {
        Lexer {
            source,
            offset: 0,
            position: Position::default(),
            bol: true,
        }
    }

    /// Reduce la entrada a una secuencia de tokens, o al primer error.
    pub fn tokenize(self) -> Result<Vec<Located<Token>>, Located<LexerError>> {
        let name = self.source.name().to_owned();
        let tokens = self.collect::<Result<Vec<_>, _>>()?;

        log::debug!("{}: {} tokens", name, tokens.len());
        Ok(tokens)
    }

    fn rest(&self) -> &[u8] {
        &self.source.text().as_bytes()[self.offset..]
    }

    fn peek(&self) -> Option<u8> {
        self.rest().first().copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.rest().get(ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.offset += 1;

        self.position = match byte {
            b'\n' => self.position.newline(),
            _ => self.position.advance(),
        };

        Some(byte)
    }

    fn here(&self) -> Location {
        Location::new(
            Rc::clone(&self.source),
            self.position..self.position.advance(),
        )
    }

    /// Descarta espacios en blanco y comentarios.
    fn skip_trivia(&mut self) -> Result<(), Located<LexerError>> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(b'\n'), _) | (Some(b'\r'), _) => {
                    self.bol = true;
                    self.bump();
                }

                (Some(c), _) if c.is_ascii_whitespace() => {
                    self.bump();
                }

                (Some(b'/'), Some(b'/')) => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.bump();
                    }
                }

                (Some(b'/'), Some(b'*')) => {
                    let start = self.here();
                    self.bump();
                    self.bump();

                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (None, _) => {
                                return Err(Located::at(LexerError::UnterminatedComment, start))
                            }

                            (Some(b'*'), Some(b'/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }

                            (Some(c), _) => {
                                if c == b'\n' || c == b'\r' {
                                    self.bol = true;
                                }

                                self.bump();
                            }
                        }
                    }
                }

                _ => return Ok(()),
            }
        }
    }

    /// Intenta construir un siguiente token.
    fn lex(&mut self) -> Result<Option<TokenKind>, LexerError> {
        let c = match self.peek() {
            None => return Ok(None),
            Some(c) => c,
        };

        let kind = match c {
            b'0'..=b'9' => self.integer()?,
            b'"' => self.string()?,
            b'\'' => self.character()?,
            c if c.is_ascii_alphabetic() || c == b'_' => self.word(),
            _ => match self.punctuator() {
                Some(punct) => TokenKind::Punct(punct),
                None => {
                    let bad = self.source.text()[self.offset..]
                        .chars()
                        .next()
                        .unwrap_or(c as char);

                    return Err(LexerError::BadChar(bad));
                }
            },
        };

        Ok(Some(kind))
    }

    fn integer(&mut self) -> Result<TokenKind, LexerError> {
        let mut value: i64 = 0;
        while let Some(digit @ b'0'..=b'9') = self.peek() {
            self.bump();

            value = value
                .checked_mul(10)
                .and_then(|n| n.checked_add((digit - b'0') as i64))
                .ok_or(LexerError::IntOverflow)?;
        }

        // Sufijo `L`, sin efecto
        if let Some(b'l') | Some(b'L') = self.peek() {
            self.bump();
        }

        match self.peek() {
            Some(c) if is_word_char(c) => Err(LexerError::BadChar(c as char)),
            _ => Ok(TokenKind::Int(value)),
        }
    }

    fn string(&mut self) -> Result<TokenKind, LexerError> {
        self.bump();

        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\n') | Some(b'\r') => return Err(LexerError::UnterminatedString),
                Some(b'"') => {
                    self.bump();
                    break;
                }

                Some(b'\\') => {
                    self.bump();
                    bytes.push(self.escape(LexerError::UnterminatedString)?);
                }

                Some(c) => {
                    self.bump();
                    bytes.push(c);
                }
            }
        }

        Ok(TokenKind::Str(Rc::from(bytes)))
    }

    fn character(&mut self) -> Result<TokenKind, LexerError> {
        self.bump();

        let value = match self.peek() {
            None | Some(b'\n') | Some(b'\r') => return Err(LexerError::UnterminatedChar),
            Some(b'\'') => return Err(LexerError::EmptyChar),
            Some(b'\\') => {
                self.bump();
                self.escape(LexerError::UnterminatedChar)?
            }

            Some(c) => {
                self.bump();
                c
            }
        };

        match self.bump() {
            Some(b'\'') => Ok(TokenKind::Int(value as i8 as i64)),
            _ => Err(LexerError::UnterminatedChar),
        }
    }

    fn escape(&mut self, unterminated: LexerError) -> Result<u8, LexerError> {
        let c = self.bump().ok_or(unterminated)?;
        let byte = match c {
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'v' => 0x0b,
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'0' => 0,
            _ => return Err(LexerError::BadEscape(c as char)),
        };

        Ok(byte)
    }

    fn word(&mut self) -> TokenKind {
        let start = self.offset;
        while self.peek().map_or(false, is_word_char) {
            self.bump();
        }

        let word = &self.source.text()[start..self.offset];
        match Keyword::from_str(word) {
            Ok(keyword) => TokenKind::Keyword(keyword),
            Err(()) => TokenKind::Id(Identifier::new(word)),
        }
    }

    fn punctuator(&mut self) -> Option<Punct> {
        let rest = self.rest();
        let &(spelling, punct) = PUNCTUATORS
            .iter()
            .find(|(spelling, _)| rest.starts_with(spelling.as_bytes()))?;

        for _ in 0..spelling.len() {
            self.bump();
        }

        Some(punct)
    }
}

impl Iterator for Lexer {
    type Item = Result<Located<Token>, Located<LexerError>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(error) = self.skip_trivia() {
            self.offset = self.source.text().len();
            return Some(Err(error));
        }

        let start = self.position;
        let from = self.here();

        match self.lex() {
            Ok(None) => None,
            Ok(Some(kind)) => {
                let bol = std::mem::replace(&mut self.bol, false);
                let location = Location::new(Rc::clone(&self.source), start..self.position);

                Some(Ok(Located::at(Token::new(kind, bol), location)))
            }

            Err(error) => {
                // Los errores son fatales, no se emiten más tokens
                self.offset = self.source.text().len();
                Some(Err(Located::at(error, from)))
            }
        }
    }
}

/// Determina si un carácter puede pertenecer a un identificador.
fn is_word_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}
