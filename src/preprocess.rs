//! Preprocesador.
//!
//! Segunda pasada sobre el flujo de tokens. Interpreta las directivas
//! `#define`, `#undef`, `#include`, `#ifdef`, `#ifndef` y `#endif`, y
//! expande usos de macros. La salida es un flujo plano de tokens sin
//! directivas.
//!
//! # Expansión
//! El uso de una macro se sustituye por una copia de su cuerpo, la cual
//! se reinserta al frente de la entrada para ser examinada de nuevo. Esto
//! permite que una macro invoque a otra. Para macros con parámetros, los
//! argumentos se ligan como macros sin parámetros en un entorno local que
//! encadena al entorno global; el cuerpo se expande completamente en ese
//! entorno, el cual se descarta antes de reinsertar el resultado.
//!
//! La sustitución no es higiénica: un argumento que menciona a un
//! parámetro de la misma macro se vuelve a sustituir. Una macro que se
//! invoca a sí misma nunca termina de expandirse; esta condición se
//! detecta por profundidad ([`MAX_EXPANSION_DEPTH`]) y se reporta como
//! error en vez de agotar la pila.

use crate::{
    lex::{Identifier, Lexer, LexerError, Punct, Token, TokenKind},
    source::{Located, Location, Source},
};

use std::{
    collections::{HashMap, VecDeque},
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

/// Profundidad máxima de expansiones anidadas o de `#include`.
pub const MAX_EXPANSION_DEPTH: u32 = 256;

/// Error de preprocesamiento.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PreprocessorError {
    #[error(transparent)]
    Lexer(#[from] LexerError),

    #[error("Failed to read include file `{}`: {1}", .0.display())]
    Include(PathBuf, #[source] io::Error),

    #[error("Expected a macro name")]
    ExpectedMacroName,

    #[error("Expected a parameter name or `)` in macro parameter list")]
    BadParameterList,

    #[error("Expected \"file\" or <file> after #include")]
    ExpectedIncludePath,

    #[error("Unknown preprocessor directive `{0}`")]
    UnknownDirective(String),

    #[error("Unterminated conditional, missing #endif")]
    MissingEndif,

    #[error("#endif without #ifdef or #ifndef")]
    StrayEndif,

    #[error("Macro `{name}` expects {expected} arguments, {found} were given")]
    ArgumentCount {
        name: Identifier,
        expected: usize,
        found: usize,
    },

    #[error("Unterminated argument list for macro `{0}`")]
    UnterminatedCall(Identifier),

    #[error("Expansion of `{0}` exceeds the nesting limit, the macro or include is probably recursive")]
    RecursionLimit(Identifier),
}

pub type Preprocess<T> = Result<T, Located<PreprocessorError>>;

/// Definición de macro.
#[derive(Debug, Clone)]
pub enum Macro {
    /// `#define NAME tokens`
    Object(Vec<Located<Token>>),

    /// `#define NAME(params) tokens`
    Function {
        params: Vec<Identifier>,
        body: Vec<Located<Token>>,
    },
}

impl Macro {
    /// Produce una copia independiente del cuerpo para un sitio de uso.
    ///
    /// La copia no comparte estado mutable con la definición ni con
    /// copias anteriores: modificar un token expandido nunca se observa
    /// en otra expansión de la misma macro.
    pub fn instantiate(&self) -> Vec<Located<Token>> {
        match self {
            Macro::Object(body) | Macro::Function { body, .. } => body.to_vec(),
        }
    }
}

/// Entorno de macros.
///
/// Los entornos se encadenan: una búsqueda comienza en el entorno más
/// reciente y continúa hacia `outer`. Los parámetros de una macro viven
/// en un entorno local que sombrea al global únicamente durante la
/// expansión del cuerpo.
pub struct MacroEnv<'a> {
    outer: Option<&'a MacroEnv<'a>>,
    macros: HashMap<Identifier, Macro>,
}

impl<'a> MacroEnv<'a> {
    pub fn global() -> MacroEnv<'static> {
        MacroEnv {
            outer: None,
            macros: HashMap::new(),
        }
    }

    fn local(outer: &'a MacroEnv<'a>) -> Self {
        MacroEnv {
            outer: Some(outer),
            macros: HashMap::new(),
        }
    }

    pub fn lookup(&self, name: &Identifier) -> Option<&Macro> {
        self.macros
            .get(name)
            .or_else(|| self.outer.and_then(|outer| outer.lookup(name)))
    }

    pub fn define(&mut self, name: Identifier, definition: Macro) {
        if self.macros.insert(name.clone(), definition).is_some() {
            log::debug!("macro `{}` redefined", name);
        }
    }

    fn undefine(&mut self, name: &Identifier) {
        self.macros.remove(name);
    }
}

/// Un token pendiente junto con su profundidad de expansión.
type Pending = VecDeque<(Located<Token>, u32)>;

/// Expande directivas y macros de un flujo completo de tokens.
pub fn preprocess(
    tokens: Vec<Located<Token>>,
    include_dir: &Path,
) -> Preprocess<Vec<Located<Token>>> {
    let mut preprocessor = Preprocessor {
        include_dir,
        globals: MacroEnv::global(),
        conditionals: Vec::new(),
    };

    let tokens = preprocessor.run(tokens.into_iter().map(|token| (token, 0)).collect())?;
    log::debug!("{} tokens after preprocessing", tokens.len());

    Ok(tokens)
}

struct Preprocessor<'p> {
    include_dir: &'p Path,
    globals: MacroEnv<'static>,

    /// `#ifdef`/`#ifndef` abiertos cuya condición fue verdadera.
    conditionals: Vec<Location>,
}

impl Preprocessor<'_> {
    fn run(&mut self, mut input: Pending) -> Preprocess<Vec<Located<Token>>> {
        let mut output = Vec::new();

        while let Some((token, depth)) = input.pop_front() {
            if token.val().is(Punct::Hash) && token.val().bol {
                self.directive(token.location().clone(), depth, &mut input)?;
                continue;
            }

            match expand_use(&self.globals, &token, depth, &mut input)? {
                Some(expansion) => splice(&mut input, expansion, depth + 1),
                None => output.push(token),
            }
        }

        match self.conditionals.pop() {
            Some(location) => Err(Located::at(PreprocessorError::MissingEndif, location)),
            None => Ok(output),
        }
    }

    fn directive(&mut self, hash: Location, depth: u32, input: &mut Pending) -> Preprocess<()> {
        let mut line = take_line(input).into_iter();
        let (location, name) = match line.next() {
            // `#` por sí solo es una directiva nula
            None => return Ok(()),
            Some(name) => name.split(),
        };

        let name = match &name.kind {
            TokenKind::Id(id) => id.as_ref().to_owned(),
            TokenKind::Keyword(keyword) => keyword.to_string(),
            _ => {
                let error = PreprocessorError::UnknownDirective(name.spelling());
                return Err(Located::at(error, location));
            }
        };

        match name.as_str() {
            "define" => self.define(hash, line.collect()),

            "undef" => {
                let name = macro_name(&hash, line.next())?;
                self.globals.undefine(&name);
                Ok(())
            }

            "include" => {
                let path = include_path(&hash, line.collect())?;
                if depth >= MAX_EXPANSION_DEPTH {
                    let name = Identifier::new(&path.display().to_string());
                    return Err(Located::at(PreprocessorError::RecursionLimit(name), hash));
                }

                let tokens = self.include(&path, &hash)?;
                splice(input, tokens, depth + 1);
                Ok(())
            }

            "ifdef" | "ifndef" => {
                let condition = self.globals.lookup(&macro_name(&hash, line.next())?).is_some();
                let condition = if name == "ifdef" { condition } else { !condition };

                if condition {
                    self.conditionals.push(hash);
                    Ok(())
                } else {
                    skip_conditional(input, hash)
                }
            }

            "endif" => match self.conditionals.pop() {
                Some(_) => Ok(()),
                None => Err(Located::at(PreprocessorError::StrayEndif, hash)),
            },

            _ => Err(Located::at(PreprocessorError::UnknownDirective(name), location)),
        }
    }

    fn define(&mut self, hash: Location, line: Vec<Located<Token>>) -> Preprocess<()> {
        let mut line = line.into_iter().peekable();
        let name = macro_name(&hash, line.next())?;

        let is_function = line
            .peek()
            .map_or(false, |token| token.val().is(Punct::OpenParen));

        let definition = if is_function {
            line.next();

            let mut params = Vec::new();
            let closed_early = line
                .peek()
                .map_or(false, |token| token.val().is(Punct::CloseParen));

            if closed_early {
                line.next();
            } else {
                loop {
                    let (location, param) = match line.next() {
                        Some(param) => param.split(),
                        None => return Err(Located::at(PreprocessorError::BadParameterList, hash)),
                    };

                    match param.id() {
                        Some(param) => params.push(param.clone()),
                        None => return Err(Located::at(PreprocessorError::BadParameterList, location)),
                    }

                    match line.next().map(Located::split) {
                        Some((_, token)) if token.is(Punct::Comma) => continue,
                        Some((_, token)) if token.is(Punct::CloseParen) => break,
                        Some((location, _)) => {
                            return Err(Located::at(PreprocessorError::BadParameterList, location))
                        }

                        None => return Err(Located::at(PreprocessorError::BadParameterList, hash)),
                    }
                }
            }

            Macro::Function {
                params,
                body: line.collect(),
            }
        } else {
            Macro::Object(line.collect())
        };

        log::debug!("#define {}", name);
        self.globals.define(name, definition);

        Ok(())
    }

    fn include(&self, path: &Path, hash: &Location) -> Preprocess<Vec<Located<Token>>> {
        let full_path = self.include_dir.join(path);
        let source = Source::load(&full_path).map_err(|error| {
            Located::at(PreprocessorError::Include(full_path.clone(), error), hash.clone())
        })?;

        log::debug!("#include {}", full_path.display());
        Lexer::new(source)
            .tokenize()
            .map_err(|error| error.map(PreprocessorError::from))
    }
}

/// Intenta expandir un uso de macro.
///
/// Retorna `None` si el token no es el nombre de una macro visible en
/// `env`, o si se trata de una macro con parámetros que no es seguida
/// por `(`. Para macros con parámetros se consumen de `input` los
/// argumentos de la invocación.
fn expand_use(
    env: &MacroEnv<'_>,
    token: &Located<Token>,
    depth: u32,
    input: &mut Pending,
) -> Preprocess<Option<Vec<Located<Token>>>> {
    let name = match token.val().id() {
        Some(name) => name,
        None => return Ok(None),
    };

    let definition = match env.lookup(name) {
        Some(definition) => definition,
        None => return Ok(None),
    };

    if depth >= MAX_EXPANSION_DEPTH {
        let error = PreprocessorError::RecursionLimit(name.clone());
        return Err(Located::at(error, token.location().clone()));
    }

    let params = match definition {
        Macro::Object(_) => return Ok(Some(definition.instantiate())),
        Macro::Function { params, .. } => params,
    };

    let invoked = input
        .front()
        .map_or(false, |(next, _)| next.val().is(Punct::OpenParen));

    if !invoked {
        return Ok(None);
    }

    input.pop_front();
    let mut args = collect_args(name, token.location(), input)?;

    // `F()` es una invocación sin argumentos, no con uno vacío
    if params.is_empty() && args.len() == 1 && args[0].is_empty() {
        args.clear();
    }

    if args.len() != params.len() {
        let error = PreprocessorError::ArgumentCount {
            name: name.clone(),
            expected: params.len(),
            found: args.len(),
        };

        return Err(Located::at(error, token.location().clone()));
    }

    let mut local = MacroEnv::local(env);
    for (param, arg) in params.iter().zip(args) {
        local.define(param.clone(), Macro::Object(arg));
    }

    expand_all(&local, definition.instantiate(), depth + 1).map(Some)
}

/// Expande completamente una secuencia aislada de tokens.
fn expand_all(
    env: &MacroEnv<'_>,
    tokens: Vec<Located<Token>>,
    depth: u32,
) -> Preprocess<Vec<Located<Token>>> {
    let mut input: Pending = tokens.into_iter().map(|token| (token, depth)).collect();
    let mut output = Vec::new();

    while let Some((token, depth)) = input.pop_front() {
        match expand_use(env, &token, depth, &mut input)? {
            Some(expansion) => splice(&mut input, expansion, depth + 1),
            None => output.push(token),
        }
    }

    Ok(output)
}

/// Separa los argumentos de una invocación, ya consumido el `(` inicial.
///
/// Las comas dentro de paréntesis anidados no separan argumentos.
fn collect_args(
    name: &Identifier,
    location: &Location,
    input: &mut Pending,
) -> Preprocess<Vec<Vec<Located<Token>>>> {
    let mut args = vec![Vec::new()];
    let mut nesting = 0;

    loop {
        let (token, _) = input.pop_front().ok_or_else(|| {
            Located::at(
                PreprocessorError::UnterminatedCall(name.clone()),
                location.clone(),
            )
        })?;

        if nesting == 0 && token.val().is(Punct::CloseParen) {
            break Ok(args);
        } else if nesting == 0 && token.val().is(Punct::Comma) {
            args.push(Vec::new());
            continue;
        }

        if token.val().is(Punct::OpenParen) {
            nesting += 1;
        } else if token.val().is(Punct::CloseParen) {
            nesting -= 1;
        }

        if let Some(arg) = args.last_mut() {
            arg.push(token);
        }
    }
}

/// Reinserta tokens al frente de la entrada, preservando su orden.
fn splice(input: &mut Pending, tokens: Vec<Located<Token>>, depth: u32) {
    for token in tokens.into_iter().rev() {
        input.push_front((token, depth));
    }
}

/// Extrae todos los tokens restantes de la línea actual.
fn take_line(input: &mut Pending) -> Vec<Located<Token>> {
    let mut line = Vec::new();
    while input.front().map_or(false, |(token, _)| !token.val().bol) {
        if let Some((token, _)) = input.pop_front() {
            line.push(token);
        }
    }

    line
}

fn macro_name(hash: &Location, token: Option<Located<Token>>) -> Preprocess<Identifier> {
    match token {
        Some(token) => match token.val().id() {
            Some(name) => Ok(name.clone()),
            None => Err(Located::at(
                PreprocessorError::ExpectedMacroName,
                token.location().clone(),
            )),
        },

        None => Err(Located::at(PreprocessorError::ExpectedMacroName, hash.clone())),
    }
}

/// Reconstruye la ruta de `#include "ruta"` o `#include <ruta>`.
fn include_path(hash: &Location, line: Vec<Located<Token>>) -> Preprocess<PathBuf> {
    let expected = || Located::at(PreprocessorError::ExpectedIncludePath, hash.clone());

    let mut line = line.into_iter();
    let first = line.next().ok_or_else(expected)?.into_inner();

    match first.kind {
        TokenKind::Str(bytes) => Ok(PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())),

        TokenKind::Punct(Punct::Lt) => {
            let mut path = String::new();
            for token in line {
                if token.val().is(Punct::Gt) {
                    return Ok(PathBuf::from(path));
                }

                path.push_str(&token.val().spelling());
            }

            Err(expected())
        }

        _ => Err(expected()),
    }
}

/// Descarta tokens hasta el primer `#endif`, inclusive.
///
/// Los condicionales no se anidan: el primer `#endif` termina el salto.
fn skip_conditional(input: &mut Pending, hash: Location) -> Preprocess<()> {
    while let Some((token, _)) = input.pop_front() {
        let is_endif = token.val().is(Punct::Hash)
            && token.val().bol
            && input.front().map_or(false, |(next, _)| {
                !next.val().bol && next.val().id().map_or(false, |id| id.as_ref() == "endif")
            });

        if is_endif {
            take_line(input);
            return Ok(());
        }
    }

    Err(Located::at(PreprocessorError::MissingEndif, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, process};

    fn run(text: &str, include_dir: &Path) -> Preprocess<Vec<Located<Token>>> {
        let tokens = Lexer::new(Source::new("test.c", text)).tokenize().unwrap();
        preprocess(tokens, include_dir)
    }

    fn expand(text: &str) -> String {
        run(text, Path::new("include"))
            .expect("preprocessing failed")
            .iter()
            .map(|token| token.val().spelling())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn fail(text: &str) -> PreprocessorError {
        run(text, Path::new("include"))
            .expect_err("preprocessing should fail")
            .into_inner()
    }

    #[test]
    fn object_like() {
        assert_eq!(expand("#define N 3
int a[N];"), "int a [ 3 ] ;");
    }

    #[test]
    fn macro_calls_macro() {
        let text = "#define A B + 1
#define B 2
A";
        assert_eq!(expand(text), "2 + 1");
    }

    #[test]
    fn function_like_literal_splice() {
        let text = "#define SQ(x) ((x)*(x))
SQ(3+1)";
        assert_eq!(expand(text), "( ( 3 + 1 ) * ( 3 + 1 ) )");
    }

    #[test]
    fn function_like_multiple_args() {
        let text = "#define ADD(a, b) a + b
ADD(f(1, 2), 3)";
        assert_eq!(expand(text), "f ( 1 , 2 ) + 3");
    }

    #[test]
    fn function_like_without_call() {
        assert_eq!(expand("#define F(x) x
F + 1"), "F + 1");
        assert_eq!(expand("#define G() 5
G()"), "5");
    }

    #[test]
    fn params_do_not_leak() {
        let text = "#define F(x) x
F(1) x";
        assert_eq!(expand(text), "1 x");
    }

    #[test]
    fn substitution_is_not_hygienic() {
        let text = "#define F(x, y) x + y
F(y, 2)";
        assert_eq!(expand(text), "2 + 2");
    }

    #[test]
    fn macro_producing_call() {
        let text = "#define G(x) x * 2
#define F G
F(4)";
        assert_eq!(expand(text), "4 * 2");
    }

    #[test]
    fn body_ends_at_line() {
        let text = "#define A 1
2 A";
        assert_eq!(expand(text), "2 1");
    }

    #[test]
    fn redefinition_shadows() {
        assert_eq!(expand("#define A 1
#define A 2
A"), "2");
        assert_eq!(expand("#define A 1
#undef A
A"), "A");
    }

    #[test]
    fn conditionals() {
        let text = "#define X
#ifdef X
1
#endif
#ifndef X
2
#endif
3";
        assert_eq!(expand(text), "1 3");
        assert_eq!(expand("#ifdef Y
int
#endif
char"), "char");
    }

    #[test]
    fn expansions_are_independent() {
        let mut tokens = run("#define ONE 1
ONE ONE", Path::new("include")).unwrap();
        assert_eq!(tokens.len(), 2);

        tokens[0].val_mut().kind = TokenKind::Int(5);
        assert_eq!(tokens[1].val().kind, TokenKind::Int(1));

        let definition = Macro::Object(tokens.clone());
        let mut first = definition.instantiate();
        let second = definition.instantiate();

        first[0].val_mut().kind = TokenKind::Int(9);
        assert_eq!(second[0].val().kind, TokenKind::Int(5));
    }

    #[test]
    fn errors() {
        assert!(matches!(fail("#ifdef X
1"), PreprocessorError::MissingEndif));
        assert!(matches!(fail("#endif"), PreprocessorError::StrayEndif));
        assert!(matches!(fail("#pragma once"), PreprocessorError::UnknownDirective(_)));
        assert!(matches!(fail("#define 3"), PreprocessorError::ExpectedMacroName));
        assert!(matches!(fail("#define F(1) x"), PreprocessorError::BadParameterList));
        assert!(matches!(
            fail("#define F(a, b) a
F(1)"),
            PreprocessorError::ArgumentCount { expected: 2, found: 1, .. }
        ));
        assert!(matches!(fail("#define F(a) a
F(1"), PreprocessorError::UnterminatedCall(_)));
        assert!(matches!(fail("#define A A
A"), PreprocessorError::RecursionLimit(_)));
        assert!(matches!(fail("#include \"nope.h\""), PreprocessorError::Include(..)));
    }

    #[test]
    fn include_files() {
        let dir = std::env::temp_dir().join(format!("ccx-include-{}", process::id()));
        fs::create_dir_all(dir.join("sys")).unwrap();
        fs::write(dir.join("defs.h"), "#define SEVEN 7\nint seven;\n").unwrap();
        fs::write(dir.join("sys").join("x.h"), "#define EIGHT 8\n").unwrap();

        let text = "#include \"defs.h\"\n#include <sys/x.h>\nSEVEN EIGHT";
        let tokens: Vec<_> = run(text, &dir)
            .unwrap()
            .iter()
            .map(|token| token.val().spelling())
            .collect();

        fs::remove_dir_all(&dir).ok();
        assert_eq!(tokens, vec!["int", "seven", ";", "7", "8"]);
    }
}
