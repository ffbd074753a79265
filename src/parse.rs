//! Análisis sintáctico.
//!
//! Parser de descenso recursivo sobre el flujo de tokens ya
//! preprocesado. Las tablas de símbolos se mantienen durante el
//! análisis, ya que C no puede analizarse sin saber cuáles
//! identificadores nombran tipos (`typedef`).
//!
//! # Ámbitos
//! Variables locales, typedefs y tags de struct se declaran en pilas que
//! se truncan al salir de cada bloque, de manera que una declaración
//! interna sombrea a una externa únicamente dentro de su bloque. Las
//! globales, funciones y constantes de enum viven durante todo el
//! programa.
//!
//! # Desazúcar
//! Varias construcciones se reescriben en términos de otras durante el
//! análisis: `a[i]` es `*(a + i)`, `p->f` es `(*p).f`, `a op= b` es
//! `a = a op b` (evaluando `a` dos veces), `++x` es `x = x + 1` y los
//! inicializadores de locales se convierten en una cadena de
//! asignaciones. `x++` se conserva como nodo propio hasta el análisis
//! semántico.

use crate::{
    ast::{
        string_label, BinOp, ExprKind, Expr, Function, Global, Initializer, Program,
        Relocation, Stmt, StmtKind, UnOp, Var, VarId,
    },
    lex::{Identifier, Keyword, Punct, Token, TokenKind},
    source::{Located, Location, Source},
    types::{Layout, StructType, Type, MAX_OBJECT_SIZE},
};

use std::{iter, rc::Rc};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: TokenKind },

    #[error("Abrupt end of program")]
    UnexpectedEof,

    #[error("Expected identifier, found {0}")]
    ExpectedId(TokenKind),

    #[error("Expected a type name")]
    ExpectedType,

    #[error("Expected an expression, found {0}")]
    ExpectedExpr(TokenKind),

    #[error("Symbol `{0}` is undefined")]
    Undefined(Identifier),

    #[error("Redefinition of `struct {0}`")]
    TagRedefinition(Identifier),

    #[error("`{0}` has incomplete type `{1}`")]
    IncompleteType(Identifier, Type),

    #[error("Expression is not a compile-time constant")]
    NotConstant,

    #[error("Division by zero in constant expression")]
    DivisionByZero,

    #[error("Invalid initializer for type `{0}`")]
    BadInitializer(Type),

    #[error("Redefinition of `{0}`")]
    Redefinition(Identifier),

    #[error("Array length must be positive, found {0}")]
    BadArrayLength(i64),

    #[error("Object is too large, the limit is {} bytes", MAX_OBJECT_SIZE)]
    TooLarge,

    #[error("Redefinition of function `{0}`")]
    FunctionRedefinition(Identifier),

    #[error("Unsupported construct: {0}")]
    Unsupported(&'static str),
}

pub type Parse<T> = Result<T, Located<ParserError>>;

/// Construye el programa a partir del flujo preprocesado de `source`.
pub fn parse(source: &Rc<Source>, tokens: &[Located<Token>]) -> Parse<Program> {
    let start = Location::start(source);
    let mut parser = Parser {
        tokens,
        cursor: 0,
        last_known: start.clone(),
        scope: Scope::default(),
        locals: Vec::new(),
        enums: Vec::new(),
        globals: Vec::new(),
        functions: Vec::new(),
        strings: Vec::new(),
    };

    while parser.peek().is_some() {
        parser.top_level()?;
    }

    log::debug!(
        "parsed {} functions, {} globals, {} strings",
        parser.functions.len(),
        parser.globals.len(),
        parser.strings.len()
    );

    Ok(Program {
        functions: parser.functions,
        globals: parser.globals,
        strings: parser.strings,
        location: start,
    })
}

/// Declaraciones visibles en el bloque actual y sus bloques externos.
#[derive(Default)]
struct Scope {
    locals: Vec<(Identifier, VarId)>,
    typedefs: Vec<(Identifier, Type)>,
    tags: Vec<(Identifier, Type)>,

    /// Primer tag declarado en el bloque actual.
    tag_floor: usize,
}

struct DeclSpec {
    ty: Type,
    is_typedef: bool,
    is_extern: bool,
    is_static: bool,
}

/// Inicializador antes de conocer su destino final.
enum Init {
    Expr(Expr),
    List(Vec<Init>, Location),
    Str(Vec<u8>, Location),
}

impl Init {
    fn location(&self) -> &Location {
        match self {
            Init::Expr(expr) => &expr.location,
            Init::List(_, location) | Init::Str(_, location) => location,
        }
    }
}

/// Operadores binarios por nivel de precedencia, de menor a mayor.
/// `>` y `>=` se reescriben como `<` y `<=` con operandos invertidos.
const LEVELS: &[&[(Punct, BinOp, bool)]] = &[
    &[(Punct::OrOr, BinOp::LogOr, false)],
    &[(Punct::AndAnd, BinOp::LogAnd, false)],
    &[(Punct::Pipe, BinOp::BitOr, false)],
    &[(Punct::Caret, BinOp::BitXor, false)],
    &[(Punct::Amp, BinOp::BitAnd, false)],
    &[(Punct::Eq, BinOp::Eq, false), (Punct::Ne, BinOp::Ne, false)],
    &[
        (Punct::Lt, BinOp::Lt, false),
        (Punct::Le, BinOp::Le, false),
        (Punct::Gt, BinOp::Lt, true),
        (Punct::Ge, BinOp::Le, true),
    ],
    &[(Punct::Shl, BinOp::Shl, false), (Punct::Shr, BinOp::Shr, false)],
    &[(Punct::Plus, BinOp::Add, false), (Punct::Minus, BinOp::Sub, false)],
    &[
        (Punct::Star, BinOp::Mul, false),
        (Punct::Slash, BinOp::Div, false),
        (Punct::Percent, BinOp::Mod, false),
    ],
];

const ASSIGNMENTS: &[(Punct, Option<BinOp>)] = &[
    (Punct::Assign, None),
    (Punct::AddAssign, Some(BinOp::Add)),
    (Punct::SubAssign, Some(BinOp::Sub)),
    (Punct::MulAssign, Some(BinOp::Mul)),
    (Punct::DivAssign, Some(BinOp::Div)),
    (Punct::ModAssign, Some(BinOp::Mod)),
    (Punct::AndAssign, Some(BinOp::BitAnd)),
    (Punct::OrAssign, Some(BinOp::BitOr)),
    (Punct::XorAssign, Some(BinOp::BitXor)),
    (Punct::ShlAssign, Some(BinOp::Shl)),
    (Punct::ShrAssign, Some(BinOp::Shr)),
];

struct Parser<'t> {
    tokens: &'t [Located<Token>],
    cursor: usize,
    last_known: Location,
    scope: Scope,

    /// Locales de la función en construcción.
    locals: Vec<Var>,

    enums: Vec<(Identifier, Expr)>,
    globals: Vec<Global>,
    functions: Vec<Function>,
    strings: Vec<Vec<u8>>,
}

impl<'t> Parser<'t> {
    fn top_level(&mut self) -> Parse<()> {
        let spec = self.declspec()?;
        if spec.is_typedef {
            return self.typedef(spec.ty);
        } else if self.eat(Punct::Semicolon) {
            return Ok(());
        }

        // Funciones y globales comparten el prefijo `tipo *nombre`
        let mut first = true;
        loop {
            let ty = self.pointers(spec.ty.clone());
            let name = self.id()?;

            if first && self.peek_is(Punct::OpenParen) {
                return self.function(&spec, ty, name);
            }

            first = false;
            let ty = self.type_suffix(ty)?;
            self.global_variable(&spec, name, ty)?;

            if !self.eat(Punct::Comma) {
                return self.expect(Punct::Semicolon);
            }
        }
    }

    fn function(&mut self, spec: &DeclSpec, ret: Type, name: Located<Identifier>) -> Parse<()> {
        let (location, name) = name.split();
        self.locals.clear();

        self.scoped(|this| {
            this.expect(Punct::OpenParen)?;
            let (params, is_variadic) = this.parameters()?;

            let body = if this.eat(Punct::Semicolon) {
                None
            } else {
                let defined = this
                    .functions
                    .iter()
                    .any(|other| other.name == name && other.body.is_some());

                if defined {
                    return Err(Located::at(ParserError::FunctionRedefinition(name), location));
                }

                Some(this.compound()?)
            };

            log::debug!("function `{}` ({} locals)", name, this.locals.len());
            this.functions.push(Function {
                name,
                ret,
                params,
                locals: std::mem::take(&mut this.locals),
                body,
                stack_size: 0,
                is_static: spec.is_static,
                is_variadic,
                location,
            });

            Ok(())
        })
    }

    fn parameters(&mut self) -> Parse<(Vec<VarId>, bool)> {
        let mut params = Vec::new();

        let void_list = self.peek().map_or(false, |token| token.is_keyword(Keyword::Void))
            && self.peek_at(1).map_or(false, |token| token.is(Punct::CloseParen));

        if void_list {
            self.advance();
            self.advance();
            return Ok((params, false));
        } else if self.eat(Punct::CloseParen) {
            return Ok((params, false));
        }

        loop {
            if self.eat(Punct::Ellipsis) {
                self.expect(Punct::CloseParen)?;
                return Ok((params, true));
            }

            let spec = self.declspec()?;
            let ty = self.pointers(spec.ty);

            // Los prototipos pueden omitir nombres de parámetros
            let name = match self.peek().map(|token| &token.kind) {
                Some(TokenKind::Id(_)) => self.id()?,
                _ => Located::at(Identifier::new(""), self.here()),
            };

            let ty = self.type_suffix(ty)?;
            params.push(self.declare_local(name, ty.decay()));

            if !self.eat(Punct::Comma) {
                self.expect(Punct::CloseParen)?;
                return Ok((params, false));
            }
        }
    }

    fn global_variable(
        &mut self,
        spec: &DeclSpec,
        name: Located<Identifier>,
        ty: Type,
    ) -> Parse<()> {
        let (location, name) = name.split();

        let init = if self.eat(Punct::Assign) {
            Some(self.initializer(&ty)?)
        } else {
            None
        };

        let ty = infer_length(ty, init.as_ref())?;
        if !spec.is_extern && !ty.is_complete() {
            return Err(Located::at(ParserError::IncompleteType(name, ty), location));
        }

        let init = match init {
            Some(init) => {
                let mut image = Initializer {
                    bytes: vec![0; ty.size() as usize],
                    relocations: Vec::new(),
                };

                self.global_initializer(&mut image, 0, &ty, init)?;
                Some(image)
            }

            None => None,
        };

        self.define_global(Global {
            name,
            ty,
            init,
            is_extern: spec.is_extern,
            is_static: spec.is_static,
            location,
        })
    }

    /// Combina declaraciones repetidas de una misma global.
    fn define_global(&mut self, global: Global) -> Parse<()> {
        let existing = match self.globals.iter_mut().find(|other| other.name == global.name) {
            Some(existing) => existing,
            None => {
                self.globals.push(global);
                return Ok(());
            }
        };

        if global.is_extern {
            return Ok(());
        } else if existing.init.is_some() && global.init.is_some() {
            return Err(Located::at(
                ParserError::Redefinition(global.name),
                global.location,
            ));
        }

        if existing.is_extern || global.init.is_some() {
            *existing = global;
        }

        Ok(())
    }

    fn typedef(&mut self, base: Type) -> Parse<()> {
        if self.eat(Punct::Semicolon) {
            return Ok(());
        }

        loop {
            let (name, ty) = self.declarator(base.clone())?;
            self.scope.typedefs.push((name.into_inner(), ty));

            if !self.eat(Punct::Comma) {
                return self.expect(Punct::Semicolon);
            }
        }
    }

    fn declspec(&mut self) -> Parse<DeclSpec> {
        let start = self.here();
        let mut spec = DeclSpec {
            ty: Type::Void,
            is_typedef: false,
            is_extern: false,
            is_static: false,
        };

        let mut base = None;
        let (mut longs, mut ints) = (0, 0);

        loop {
            let keyword = match self.peek().map(|token| &token.kind) {
                Some(TokenKind::Keyword(keyword)) => *keyword,

                Some(TokenKind::Id(name)) if base.is_none() && longs + ints == 0 => {
                    match self.lookup_typedef(name) {
                        Some(ty) => {
                            self.advance();
                            base = Some(ty);
                            continue;
                        }

                        None => break,
                    }
                }

                _ => break,
            };

            match keyword {
                Keyword::Typedef => spec.is_typedef = true,
                Keyword::Extern => spec.is_extern = true,
                Keyword::Static => spec.is_static = true,
                Keyword::Long => longs += 1,
                Keyword::Int => ints += 1,
                Keyword::Char if base.is_none() => base = Some(Type::Char),
                Keyword::Void if base.is_none() => base = Some(Type::Void),

                Keyword::Struct if base.is_none() => {
                    self.advance();
                    base = Some(self.struct_decl()?);
                    continue;
                }

                Keyword::Enum if base.is_none() => {
                    self.advance();
                    base = Some(self.enum_decl()?);
                    continue;
                }

                _ => break,
            }

            self.advance();
        }

        spec.ty = match (base, longs, ints) {
            (Some(ty), 0, 0) => ty,
            (None, 0, 0) => return Err(Located::at(ParserError::ExpectedType, start)),
            (None, 0, _) => Type::Int,
            (None, _, _) => Type::Long,
            (Some(_), _, _) => return Err(Located::at(ParserError::ExpectedType, start)),
        };

        Ok(spec)
    }

    fn struct_decl(&mut self) -> Parse<Type> {
        let start = self.last_known.clone();
        let tag = match self.peek().map(|token| &token.kind) {
            Some(TokenKind::Id(_)) => Some(self.id()?),
            _ => None,
        };

        if !self.peek_is(Punct::OpenCurly) {
            let tag = match tag {
                Some(tag) => tag,
                None => return self.unexpected("`{` or a struct tag"),
            };

            if let Some(ty) = self.lookup_tag(tag.val(), 0) {
                return Ok(ty);
            }

            // Declaración adelantada
            let ty = Type::Struct(StructType::new(Some(tag.val().clone())));
            self.scope.tags.push((tag.into_inner(), ty.clone()));
            return Ok(ty);
        }

        self.advance();

        // El tag se registra antes de los campos para permitir autorreferencias
        let aggregate = match &tag {
            Some(tag) => match self.lookup_tag(tag.val(), self.scope.tag_floor) {
                Some(Type::Struct(existing)) if existing.is_complete() => {
                    let error = ParserError::TagRedefinition(tag.val().clone());
                    return Err(Located::at(error, tag.location().clone()));
                }

                Some(Type::Struct(existing)) => existing,

                _ => {
                    let aggregate = StructType::new(Some(tag.val().clone()));
                    let ty = Type::Struct(Rc::clone(&aggregate));
                    self.scope.tags.push((tag.val().clone(), ty));

                    aggregate
                }
            },

            None => StructType::new(None),
        };

        let mut members = Vec::new();
        while !self.eat(Punct::CloseCurly) {
            let spec = self.declspec()?;

            loop {
                let (name, ty) = self.declarator(spec.ty.clone())?;
                if !ty.is_complete() {
                    let (location, name) = name.split();
                    return Err(Located::at(ParserError::IncompleteType(name, ty), location));
                }

                members.push((name.into_inner(), ty));
                if !self.eat(Punct::Comma) {
                    break;
                }
            }

            self.expect(Punct::Semicolon)?;
        }

        let layout = Layout::compute(members)
            .ok_or_else(|| Located::at(ParserError::TooLarge, self.span_from(start)))?;

        aggregate.complete(layout);
        Ok(Type::Struct(aggregate))
    }

    fn enum_decl(&mut self) -> Parse<Type> {
        let tag = match self.peek().map(|token| &token.kind) {
            Some(TokenKind::Id(_)) => Some(self.id()?),
            _ => None,
        };

        if !self.eat(Punct::OpenCurly) {
            return match tag {
                Some(_) => Ok(Type::Int),
                None => self.unexpected("`{` or an enum tag"),
            };
        }

        let mut value = 0;
        loop {
            let (location, name) = self.id()?.split();
            if self.eat(Punct::Assign) {
                let expr = self.conditional()?;
                value = self.eval(&expr)?;
            }

            let constant = Expr::typed(ExprKind::Num(value), Type::Int, location);
            self.enums.push((name, constant));
            value += 1;

            if !self.eat(Punct::Comma) {
                self.expect(Punct::CloseCurly)?;
                break;
            } else if self.eat(Punct::CloseCurly) {
                break;
            }
        }

        if let Some(tag) = tag {
            self.scope.tags.push((tag.into_inner(), Type::Int));
        }

        Ok(Type::Int)
    }

    fn pointers(&mut self, mut ty: Type) -> Type {
        while self.eat(Punct::Star) {
            ty = ty.pointer_to();
        }

        ty
    }

    /// Sufijos `[N]`, de derecha a izquierda: `int a[2][3]` es un
    /// arreglo de dos arreglos de tres enteros.
    fn type_suffix(&mut self, ty: Type) -> Parse<Type> {
        if !self.eat(Punct::OpenSquare) {
            return Ok(ty);
        }

        let start = self.here();
        let length = if self.peek_is(Punct::CloseSquare) {
            0
        } else {
            let expr = self.conditional()?;
            match self.eval(&expr)? {
                length if length > 0 && length <= u32::MAX as i64 => length as u32,
                length => {
                    let error = ParserError::BadArrayLength(length);
                    return Err(Located::at(error, expr.location));
                }
            }
        };

        self.expect(Punct::CloseSquare)?;
        let element = self.type_suffix(ty)?;

        element
            .checked_array_of(length)
            .ok_or_else(|| Located::at(ParserError::TooLarge, self.span_from(start)))
    }

    fn declarator(&mut self, base: Type) -> Parse<(Located<Identifier>, Type)> {
        let ty = self.pointers(base);
        let name = self.id()?;
        let ty = self.type_suffix(ty)?;

        Ok((name, ty))
    }

    /// Un tipo sin nombre, como en casts y `sizeof`.
    fn type_name(&mut self) -> Parse<Type> {
        let spec = self.declspec()?;
        let ty = self.pointers(spec.ty);

        self.type_suffix(ty)
    }

    fn compound(&mut self) -> Parse<Stmt> {
        self.expect(Punct::OpenCurly)?;
        let start = self.last_known.clone();

        self.scoped(|this| {
            let mut stmts = Vec::new();
            while !this.eat(Punct::CloseCurly) {
                if this.is_typename(0) {
                    this.declaration(&mut stmts)?;
                } else {
                    stmts.push(this.statement()?);
                }
            }

            Ok(Stmt::new(StmtKind::Block(stmts), this.span_from(start)))
        })
    }

    fn declaration(&mut self, out: &mut Vec<Stmt>) -> Parse<()> {
        let start = self.here();
        let spec = self.declspec()?;

        if spec.is_typedef {
            return self.typedef(spec.ty);
        } else if spec.is_static || spec.is_extern {
            return Err(Located::at(
                ParserError::Unsupported("storage class on a local variable"),
                start,
            ));
        } else if self.eat(Punct::Semicolon) {
            return Ok(());
        }

        loop {
            let (name, ty) = self.declarator(spec.ty.clone())?;
            let init = if self.eat(Punct::Assign) {
                Some(self.initializer(&ty)?)
            } else {
                None
            };

            let ty = infer_length(ty, init.as_ref())?;
            if !ty.is_complete() {
                let (location, name) = name.split();
                return Err(Located::at(ParserError::IncompleteType(name, ty), location));
            }

            let location = name.location().clone();
            let var = self.declare_local(name, ty.clone());

            if let Some(init) = init {
                let target = Expr::new(ExprKind::Local(var), location.clone());

                let mut assignments = Vec::new();
                self.assign_initializer(target, &ty, Some(init), &mut assignments)?;

                if let Some(chain) = assignments.into_iter().reduce(Expr::comma) {
                    out.push(Stmt::new(StmtKind::Expr(chain), location));
                }
            }

            if !self.eat(Punct::Comma) {
                return self.expect(Punct::Semicolon);
            }
        }
    }

    fn declare_local(&mut self, name: Located<Identifier>, ty: Type) -> VarId {
        let (location, name) = name.split();
        let id = VarId(self.locals.len());

        self.locals.push(Var {
            name: name.clone(),
            ty,
            offset: 0,
            location,
        });

        self.scope.locals.push((name, id));
        id
    }

    fn initializer(&mut self, ty: &Type) -> Parse<Init> {
        if self.eat(Punct::OpenCurly) {
            let start = self.last_known.clone();

            let mut items = Vec::new();
            while !self.eat(Punct::CloseCurly) {
                let member = member_type(ty, items.len());
                items.push(self.initializer(&member)?);

                if !self.eat(Punct::Comma) {
                    self.expect(Punct::CloseCurly)?;
                    break;
                }
            }

            return Ok(Init::List(items, self.span_from(start)));
        }

        let is_string = matches!(self.peek().map(|token| &token.kind), Some(TokenKind::Str(_)));
        match ty {
            Type::Array(element, _) if is_string && **element == Type::Char => {
                let (location, bytes) = self.string_literal()?;
                Ok(Init::Str(bytes, location))
            }

            _ => Ok(Init::Expr(self.assign()?)),
        }
    }

    /// Desazúcar de un inicializador local a asignaciones individuales.
    ///
    /// Los elementos y campos que no se mencionan se inicializan en cero.
    fn assign_initializer(
        &self,
        target: Expr,
        ty: &Type,
        init: Option<Init>,
        out: &mut Vec<Expr>,
    ) -> Parse<()> {
        let location = target.location.clone();
        let bad_initializer = |init: &Init| {
            Err(Located::at(
                ParserError::BadInitializer(ty.clone()),
                init.location().clone(),
            ))
        };

        match (ty, init) {
            (Type::Array(element, length), Some(Init::List(items, list_location))) => {
                if items.len() > *length as usize {
                    return bad_initializer(&Init::List(items, list_location));
                }

                let mut items = items.into_iter();
                for index in 0..*length {
                    let target = element_at(target.clone(), index);
                    self.assign_initializer(target, element, items.next(), out)?;
                }
            }

            (Type::Array(_, length), Some(Init::Str(bytes, string_location))) => {
                if bytes.len() > *length as usize {
                    return bad_initializer(&Init::Str(bytes, string_location));
                }

                for index in 0..*length {
                    let byte = bytes.get(index as usize).map_or(0, |&byte| byte as i8 as i64);
                    let value = Expr::num(byte, location.clone());

                    out.push(Expr::assign(element_at(target.clone(), index), value));
                }
            }

            (Type::Array(element, length), None) => {
                for index in 0..*length {
                    let target = element_at(target.clone(), index);
                    self.assign_initializer(target, element, None, out)?;
                }
            }

            (Type::Struct(aggregate), Some(Init::List(items, list_location))) => {
                let fields = aggregate.fields();
                if items.len() > fields.len() {
                    return bad_initializer(&Init::List(items, list_location));
                }

                let items = items.into_iter().map(Some).chain(iter::repeat_with(|| None));
                for (field, item) in fields.into_iter().zip(items) {
                    let target = member_of(target.clone(), field.name);
                    self.assign_initializer(target, &field.ty, item, out)?;
                }
            }

            (Type::Struct(aggregate), None) => {
                for field in aggregate.fields() {
                    let target = member_of(target.clone(), field.name);
                    self.assign_initializer(target, &field.ty, None, out)?;
                }
            }

            (ty, Some(Init::List(items, list_location))) if !ty.is_aggregate() => {
                if items.len() > 1 {
                    return bad_initializer(&Init::List(items, list_location));
                }

                let first = items.into_iter().next();
                self.assign_initializer(target, ty, first, out)?;
            }

            (ty, Some(Init::Expr(value))) if !ty.is_aggregate() => {
                out.push(Expr::assign(target, value));
            }

            (ty, None) if !ty.is_aggregate() => {
                out.push(Expr::assign(target, Expr::num(0, location)));
            }

            (_, Some(init)) => return bad_initializer(&init),
            (_, None) => (),
        }

        Ok(())
    }

    /// Escribe un inicializador global en su imagen de bytes.
    fn global_initializer(
        &self,
        image: &mut Initializer,
        offset: u32,
        ty: &Type,
        init: Init,
    ) -> Parse<()> {
        let bad_initializer = |init: &Init| {
            Err(Located::at(
                ParserError::BadInitializer(ty.clone()),
                init.location().clone(),
            ))
        };

        match (ty, init) {
            (Type::Array(element, length), Init::List(items, location)) => {
                if items.len() > *length as usize {
                    return bad_initializer(&Init::List(items, location));
                }

                for (index, item) in items.into_iter().enumerate() {
                    let offset = offset + index as u32 * element.size();
                    self.global_initializer(image, offset, element, item)?;
                }
            }

            (Type::Array(_, length), Init::Str(bytes, location)) => {
                if bytes.len() > *length as usize {
                    return bad_initializer(&Init::Str(bytes, location));
                }

                let start = offset as usize;
                image.bytes[start..start + bytes.len()].copy_from_slice(&bytes);
            }

            (Type::Struct(aggregate), Init::List(items, location)) => {
                let fields = aggregate.fields();
                if items.len() > fields.len() {
                    return bad_initializer(&Init::List(items, location));
                }

                for (field, item) in fields.iter().zip(items) {
                    self.global_initializer(image, offset + field.offset, &field.ty, item)?;
                }
            }

            (ty, Init::List(items, location)) if !ty.is_aggregate() => {
                if items.len() > 1 {
                    return bad_initializer(&Init::List(items, location));
                }

                if let Some(first) = items.into_iter().next() {
                    self.global_initializer(image, offset, ty, first)?;
                }
            }

            (ty, Init::Expr(expr)) if !ty.is_aggregate() => {
                let (value, symbol) = self.eval_address(&expr)?;

                match symbol {
                    Some(_) if ty.size() != 8 => {
                        return Err(Located::at(ParserError::NotConstant, expr.location))
                    }

                    Some(symbol) => image.relocations.push(Relocation {
                        offset,
                        symbol,
                        addend: value,
                    }),

                    None => {
                        let (start, size) = (offset as usize, ty.size() as usize);
                        image.bytes[start..start + size]
                            .copy_from_slice(&value.to_le_bytes()[..size]);
                    }
                }
            }

            (_, init) => return bad_initializer(&init),
        }

        Ok(())
    }

    fn statement(&mut self) -> Parse<Stmt> {
        let start = self.here();
        let keyword = match self.peek().map(|token| &token.kind) {
            Some(TokenKind::Keyword(keyword)) => Some(*keyword),
            Some(TokenKind::Punct(Punct::OpenCurly)) => return self.compound(),
            _ => None,
        };

        let kind = match keyword {
            Some(Keyword::Return) => {
                self.advance();
                if self.eat(Punct::Semicolon) {
                    StmtKind::Return(None)
                } else {
                    let value = self.expr()?;
                    self.expect(Punct::Semicolon)?;
                    StmtKind::Return(Some(value))
                }
            }

            Some(Keyword::If) => {
                self.advance();
                let cond = self.parenthesized()?;
                let then = Box::new(self.statement()?);

                let els = if self.eat_keyword(Keyword::Else) {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };

                StmtKind::If { cond, then, els }
            }

            Some(Keyword::While) => {
                self.advance();
                let cond = self.parenthesized()?;
                let body = Box::new(self.statement()?);

                StmtKind::While { cond, body }
            }

            Some(Keyword::Do) => {
                self.advance();
                let body = Box::new(self.statement()?);

                self.expect_keyword(Keyword::While)?;
                let cond = self.parenthesized()?;
                self.expect(Punct::Semicolon)?;

                StmtKind::DoWhile { body, cond }
            }

            Some(Keyword::For) => return self.for_statement(),

            Some(Keyword::Switch) => {
                self.advance();
                let cond = self.parenthesized()?;
                let body = Box::new(self.statement()?);

                StmtKind::Switch {
                    cond,
                    body,
                    cases: Vec::new(),
                }
            }

            Some(Keyword::Case) => {
                self.advance();
                let value = self.conditional()?;
                let value = self.eval(&value)?;

                self.expect(Punct::Colon)?;
                let body = Box::new(self.statement()?);

                StmtKind::Case {
                    value,
                    label: None,
                    body,
                }
            }

            Some(Keyword::Default) => {
                self.advance();
                self.expect(Punct::Colon)?;
                let body = Box::new(self.statement()?);

                StmtKind::Default { label: None, body }
            }

            Some(Keyword::Break) => {
                self.advance();
                self.expect(Punct::Semicolon)?;
                StmtKind::Break
            }

            Some(Keyword::Continue) => {
                self.advance();
                self.expect(Punct::Semicolon)?;
                StmtKind::Continue
            }

            _ if self.eat(Punct::Semicolon) => StmtKind::Null,

            _ => {
                let expr = self.expr()?;
                self.expect(Punct::Semicolon)?;
                StmtKind::Expr(expr)
            }
        };

        Ok(Stmt::new(kind, self.span_from(start)))
    }

    fn for_statement(&mut self) -> Parse<Stmt> {
        let start = self.here();
        self.advance();
        self.expect(Punct::OpenParen)?;

        // Las declaraciones en `init` son visibles solo dentro del ciclo
        self.scoped(|this| {
            let init_start = this.here();
            let init = if this.is_typename(0) {
                let mut stmts = Vec::new();
                this.declaration(&mut stmts)?;

                Some(Stmt::new(StmtKind::Block(stmts), init_start))
            } else if this.eat(Punct::Semicolon) {
                None
            } else {
                let expr = this.expr()?;
                this.expect(Punct::Semicolon)?;

                Some(Stmt::new(StmtKind::Expr(expr), init_start))
            };

            let cond = if this.peek_is(Punct::Semicolon) {
                None
            } else {
                Some(this.expr()?)
            };

            this.expect(Punct::Semicolon)?;
            let step = if this.peek_is(Punct::CloseParen) {
                None
            } else {
                Some(this.expr()?)
            };

            this.expect(Punct::CloseParen)?;
            let body = Box::new(this.statement()?);

            let kind = StmtKind::For {
                init: init.map(Box::new),
                cond,
                step,
                body,
            };

            Ok(Stmt::new(kind, this.span_from(start)))
        })
    }

    fn parenthesized(&mut self) -> Parse<Expr> {
        self.expect(Punct::OpenParen)?;
        let expr = self.expr()?;
        self.expect(Punct::CloseParen)?;

        Ok(expr)
    }

    fn expr(&mut self) -> Parse<Expr> {
        let mut expr = self.assign()?;
        while self.eat(Punct::Comma) {
            let rhs = self.assign()?;
            expr = Expr::comma(expr, rhs);
        }

        Ok(expr)
    }

    fn assign(&mut self) -> Parse<Expr> {
        let lhs = self.conditional()?;

        let op = ASSIGNMENTS
            .iter()
            .find(|(punct, _)| self.peek_is(*punct))
            .map(|&(_, op)| op);

        let op = match op {
            Some(op) => op,
            None => return Ok(lhs),
        };

        self.advance();
        let rhs = self.assign()?;

        Ok(match op {
            None => Expr::assign(lhs, rhs),
            Some(op) => Expr::assign(lhs.clone(), Expr::binary(op, lhs, rhs)),
        })
    }

    fn conditional(&mut self) -> Parse<Expr> {
        let cond = self.binary(0)?;
        if !self.eat(Punct::Question) {
            return Ok(cond);
        }

        let then = self.expr()?;
        self.expect(Punct::Colon)?;
        let els = self.conditional()?;

        let location = Location::span(cond.location.clone(), &els.location);
        let kind = ExprKind::Cond {
            cond: Box::new(cond),
            then: Box::new(then),
            els: Box::new(els),
        };

        Ok(Expr::new(kind, location))
    }

    fn binary(&mut self, level: usize) -> Parse<Expr> {
        let operand = |this: &mut Self| {
            if level + 1 < LEVELS.len() {
                this.binary(level + 1)
            } else {
                this.cast()
            }
        };

        let mut lhs = operand(self)?;

        'operators: loop {
            for &(punct, op, swap) in LEVELS[level] {
                if self.eat(punct) {
                    let rhs = operand(self)?;
                    lhs = if swap {
                        Expr::binary(op, rhs, lhs)
                    } else {
                        Expr::binary(op, lhs, rhs)
                    };

                    continue 'operators;
                }
            }

            break Ok(lhs);
        }
    }

    fn cast(&mut self) -> Parse<Expr> {
        if !(self.peek_is(Punct::OpenParen) && self.is_typename(1)) {
            return self.unary();
        }

        let start = self.here();
        self.advance();

        let to = self.type_name()?;
        self.expect(Punct::CloseParen)?;

        let expr = self.cast()?;
        let location = Location::span(start, &expr.location);
        let kind = ExprKind::Cast {
            to,
            expr: Box::new(expr),
        };

        Ok(Expr::new(kind, location))
    }

    fn unary(&mut self) -> Parse<Expr> {
        let start = self.here();
        let kind = match self.peek().map(|token| &token.kind) {
            Some(TokenKind::Punct(punct)) => *punct,

            Some(TokenKind::Keyword(Keyword::Sizeof)) => {
                self.advance();
                if self.peek_is(Punct::OpenParen) && self.is_typename(1) {
                    self.advance();
                    let ty = self.type_name()?;
                    self.expect(Punct::CloseParen)?;

                    if !ty.is_complete() {
                        let error = ParserError::IncompleteType(Identifier::new("sizeof"), ty);
                        return Err(Located::at(error, start));
                    }

                    let size = ExprKind::Num(ty.size() as i64);
                    return Ok(Expr::typed(size, Type::Long, self.span_from(start)));
                }

                let expr = self.unary()?;
                let location = self.span_from(start);

                return Ok(Expr::new(ExprKind::Sizeof(Box::new(expr)), location));
            }

            Some(TokenKind::Keyword(Keyword::Alignof)) => {
                self.advance();
                self.expect(Punct::OpenParen)?;
                let ty = self.type_name()?;
                self.expect(Punct::CloseParen)?;

                let align = ExprKind::Num(ty.align() as i64);
                return Ok(Expr::typed(align, Type::Long, self.span_from(start)));
            }

            _ => return self.postfix(),
        };

        let unary = |op, expr| ExprKind::Unary {
            op,
            expr: Box::new(expr),
        };

        let kind = match kind {
            Punct::Plus => {
                self.advance();
                return self.cast();
            }

            Punct::Minus => {
                self.advance();
                unary(UnOp::Neg, self.cast()?)
            }

            Punct::Bang => {
                self.advance();
                unary(UnOp::Not, self.cast()?)
            }

            Punct::Tilde => {
                self.advance();
                unary(UnOp::BitNot, self.cast()?)
            }

            Punct::Amp => {
                self.advance();
                ExprKind::Addr(Box::new(self.cast()?))
            }

            Punct::Star => {
                self.advance();
                ExprKind::Deref(Box::new(self.cast()?))
            }

            Punct::Inc | Punct::Dec => {
                self.advance();
                let op = if kind == Punct::Inc { BinOp::Add } else { BinOp::Sub };

                let target = self.unary()?;
                let one = Expr::num(1, target.location.clone());

                return Ok(Expr::assign(target.clone(), Expr::binary(op, target, one)));
            }

            _ => return self.postfix(),
        };

        Ok(Expr::new(kind, self.span_from(start)))
    }

    fn postfix(&mut self) -> Parse<Expr> {
        let mut expr = self.primary()?;

        loop {
            if self.eat(Punct::OpenSquare) {
                let index = self.expr()?;
                self.expect(Punct::CloseSquare)?;

                let location = self.span_from(expr.location.clone());
                expr = Expr::deref(Expr::binary(BinOp::Add, expr, index));
                expr.location = location;
            } else if self.eat(Punct::Period) {
                let name = self.id()?.into_inner();
                expr = member_of(expr, name);
                expr.location = self.span_from(expr.location.clone());
            } else if self.eat(Punct::Arrow) {
                let name = self.id()?.into_inner();
                expr = member_of(Expr::deref(expr), name);
                expr.location = self.span_from(expr.location.clone());
            } else if self.peek_is(Punct::Inc) || self.peek_is(Punct::Dec) {
                let op = if self.eat(Punct::Inc) {
                    BinOp::Add
                } else {
                    self.advance();
                    BinOp::Sub
                };

                // Se desazucara durante el análisis semántico, cuando ya
                // se conoce el tipo del operando
                let location = self.span_from(expr.location.clone());
                let kind = ExprKind::Postfix {
                    op,
                    expr: Box::new(expr),
                };

                expr = Expr::new(kind, location);
            } else {
                break Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Parse<Expr> {
        if let Some(TokenKind::Str(_)) = self.peek().map(|token| &token.kind) {
            let (location, bytes) = self.string_literal()?;
            let index = self.intern(bytes);

            return Ok(Expr::new(ExprKind::Str(index), location));
        }

        let (location, token) = self.next()?.split();
        match token.kind {
            TokenKind::Punct(Punct::OpenParen) => {
                let expr = self.expr()?;
                self.expect(Punct::CloseParen)?;

                Ok(expr)
            }

            TokenKind::Int(value) => Ok(Expr::num(value, location)),

            TokenKind::Id(name) if self.peek_is(Punct::OpenParen) => {
                self.advance();

                let mut args = Vec::new();
                if !self.eat(Punct::CloseParen) {
                    loop {
                        args.push(self.assign()?);
                        if !self.eat(Punct::Comma) {
                            self.expect(Punct::CloseParen)?;
                            break;
                        }
                    }
                }

                let location = self.span_from(location);
                Ok(Expr::new(ExprKind::Call { name, args }, location))
            }

            TokenKind::Id(name) => match self.lookup_var(&name, &location) {
                Some(expr) => Ok(expr),
                None => Err(Located::at(ParserError::Undefined(name), location)),
            },

            found => Err(Located::at(ParserError::ExpectedExpr(found), location)),
        }
    }

    /// Literales de cadena adyacentes se concatenan.
    fn string_literal(&mut self) -> Parse<(Location, Vec<u8>)> {
        let start = self.here();
        let mut bytes = Vec::new();

        while let Some(TokenKind::Str(part)) = self.peek().map(|token| &token.kind) {
            bytes.extend_from_slice(part);
            self.advance();
        }

        Ok((self.span_from(start), bytes))
    }

    fn intern(&mut self, bytes: Vec<u8>) -> usize {
        match self.strings.iter().position(|string| *string == bytes) {
            Some(index) => index,
            None => {
                self.strings.push(bytes);
                self.strings.len() - 1
            }
        }
    }

    /// Resuelve un identificador: locales, luego globales, luego
    /// constantes de enum. Las constantes se copian en cada uso.
    fn lookup_var(&self, name: &Identifier, location: &Location) -> Option<Expr> {
        let local = self.scope.locals.iter().rev().find(|(local, _)| local == name);
        if let Some(&(_, id)) = local {
            return Some(Expr::new(ExprKind::Local(id), location.clone()));
        }

        if self.globals.iter().any(|global| global.name == *name) {
            return Some(Expr::new(ExprKind::Global(name.clone()), location.clone()));
        }

        self.enums
            .iter()
            .rev()
            .find(|(constant, _)| constant == name)
            .map(|(_, constant)| Expr {
                location: location.clone(),
                ..constant.clone()
            })
    }

    fn lookup_typedef(&self, name: &Identifier) -> Option<Type> {
        // Una variable local sombrea al typedef del mismo nombre
        if self.scope.locals.iter().any(|(local, _)| local == name) {
            return None;
        }

        self.scope
            .typedefs
            .iter()
            .rev()
            .find(|(typedef, _)| typedef == name)
            .map(|(_, ty)| ty.clone())
    }

    /// Busca un tag a partir del índice `floor` de la pila de tags.
    fn lookup_tag(&self, name: &Identifier, floor: usize) -> Option<Type> {
        self.scope.tags[floor..]
            .iter()
            .rev()
            .find(|(tag, _)| tag == name)
            .map(|(_, ty)| ty.clone())
    }

    fn is_typename(&self, ahead: usize) -> bool {
        match self.peek_at(ahead).map(|token| &token.kind) {
            Some(TokenKind::Keyword(keyword)) => matches!(
                keyword,
                Keyword::Void
                    | Keyword::Char
                    | Keyword::Int
                    | Keyword::Long
                    | Keyword::Struct
                    | Keyword::Enum
                    | Keyword::Typedef
                    | Keyword::Extern
                    | Keyword::Static
            ),

            Some(TokenKind::Id(name)) => self.lookup_typedef(name).is_some(),
            _ => false,
        }
    }

    /// Evalúa una expresión constante entera.
    fn eval(&self, expr: &Expr) -> Parse<i64> {
        use ExprKind::*;

        let value = match &expr.kind {
            Num(value) => *value,

            Binary { op, lhs, rhs, .. } => {
                let lhs = self.eval(lhs)?;
                match op {
                    BinOp::LogAnd => return Ok((lhs != 0 && self.eval(rhs)? != 0) as i64),
                    BinOp::LogOr => return Ok((lhs != 0 || self.eval(rhs)? != 0) as i64),
                    _ => (),
                }

                let rhs = self.eval(rhs)?;
                match op {
                    BinOp::Div | BinOp::Mod if rhs == 0 => {
                        let location = expr.location.clone();
                        return Err(Located::at(ParserError::DivisionByZero, location));
                    }

                    BinOp::Add => lhs.wrapping_add(rhs),
                    BinOp::Sub => lhs.wrapping_sub(rhs),
                    BinOp::Mul => lhs.wrapping_mul(rhs),
                    BinOp::Div => lhs.wrapping_div(rhs),
                    BinOp::Mod => lhs.wrapping_rem(rhs),
                    BinOp::BitAnd => lhs & rhs,
                    BinOp::BitOr => lhs | rhs,
                    BinOp::BitXor => lhs ^ rhs,
                    BinOp::Shl => lhs.wrapping_shl(rhs as u32),
                    BinOp::Shr => lhs.wrapping_shr(rhs as u32),
                    BinOp::Eq => (lhs == rhs) as i64,
                    BinOp::Ne => (lhs != rhs) as i64,
                    BinOp::Lt => (lhs < rhs) as i64,
                    BinOp::Le => (lhs <= rhs) as i64,
                    BinOp::LogAnd | BinOp::LogOr => unreachable!(),
                }
            }

            Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnOp::Neg => value.wrapping_neg(),
                    UnOp::Not => (value == 0) as i64,
                    UnOp::BitNot => !value,
                }
            }

            Cond { cond, then, els } => {
                if self.eval(cond)? != 0 {
                    self.eval(then)?
                } else {
                    self.eval(els)?
                }
            }

            Comma(_, rhs) => self.eval(rhs)?,

            Cast { to, expr } => {
                let value = self.eval(expr)?;
                match to {
                    Type::Char => value as i8 as i64,
                    Type::Int => value as i32 as i64,
                    _ => value,
                }
            }

            _ => return Err(Located::at(ParserError::NotConstant, expr.location.clone())),
        };

        Ok(value)
    }

    /// Evalúa una constante que puede ser una dirección más un
    /// desplazamiento, como en `char *p = "texto" + 1`.
    fn eval_address(&self, expr: &Expr) -> Parse<(i64, Option<String>)> {
        match &expr.kind {
            ExprKind::Str(index) => Ok((0, Some(string_label(*index)))),

            ExprKind::Addr(inner) => match &inner.kind {
                ExprKind::Global(name) => Ok((0, Some(name.to_string()))),
                ExprKind::Deref(pointer) => self.eval_address(pointer),
                _ => Err(Located::at(ParserError::NotConstant, expr.location.clone())),
            },

            ExprKind::Global(name) if self.global_type(name).map_or(false, |ty| ty.is_aggregate()) => {
                Ok((0, Some(name.to_string())))
            }

            ExprKind::Cast { expr, .. } => self.eval_address(expr),

            ExprKind::Binary {
                op: op @ (BinOp::Add | BinOp::Sub),
                lhs,
                rhs,
                ..
            } => match self.eval_address(lhs)? {
                (base, Some(symbol)) => {
                    let offset = self.eval(rhs)? * self.pointee_size(lhs) as i64;
                    let value = if *op == BinOp::Add { base + offset } else { base - offset };

                    Ok((value, Some(symbol)))
                }

                (_, None) => Ok((self.eval(expr)?, None)),
            },

            _ => Ok((self.eval(expr)?, None)),
        }
    }

    fn pointee_size(&self, expr: &Expr) -> u32 {
        let ty = match &expr.kind {
            ExprKind::Global(name) => self.global_type(name),
            ExprKind::Addr(inner) => match &inner.kind {
                ExprKind::Global(name) => self.global_type(name).map(Type::pointer_to),
                _ => None,
            },

            ExprKind::Cast { to, .. } => Some(to.clone()),
            _ => None,
        };

        ty.as_ref()
            .and_then(Type::pointee)
            .map_or(1, Type::size)
    }

    fn global_type(&self, name: &Identifier) -> Option<Type> {
        self.globals
            .iter()
            .find(|global| global.name == *name)
            .map(|global| global.ty.clone())
    }

    fn scoped<T, F>(&mut self, rule: F) -> Parse<T>
    where
        F: FnOnce(&mut Self) -> Parse<T>,
    {
        let locals = self.scope.locals.len();
        let typedefs = self.scope.typedefs.len();
        let tags = self.scope.tags.len();
        let tag_floor = std::mem::replace(&mut self.scope.tag_floor, tags);

        let result = rule(self);

        self.scope.locals.truncate(locals);
        self.scope.typedefs.truncate(typedefs);
        self.scope.tags.truncate(tags);
        self.scope.tag_floor = tag_floor;

        result
    }

    fn peek(&self) -> Option<&'t Token> {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> Option<&'t Token> {
        self.tokens.get(self.cursor + ahead).map(Located::val)
    }

    fn peek_is(&self, punct: Punct) -> bool {
        self.peek().map_or(false, |token| token.is(punct))
    }

    fn advance(&mut self) {
        if let Some(token) = self.tokens.get(self.cursor) {
            self.last_known = token.location().clone();
            self.cursor += 1;
        }
    }

    fn eat(&mut self, punct: Punct) -> bool {
        let found = self.peek_is(punct);
        if found {
            self.advance();
        }

        found
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        let found = self.peek().map_or(false, |token| token.is_keyword(keyword));
        if found {
            self.advance();
        }

        found
    }

    fn expect(&mut self, punct: Punct) -> Parse<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            self.unexpected(&format!("`{}`", punct.spelling()))
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Parse<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            self.unexpected(&format!("`{}`", keyword))
        }
    }

    fn id(&mut self) -> Parse<Located<Identifier>> {
        let (location, token) = self.next()?.split();
        match token.kind {
            TokenKind::Id(id) => Ok(Located::at(id, location)),
            found => Err(Located::at(ParserError::ExpectedId(found), location)),
        }
    }

    fn next(&mut self) -> Parse<Located<Token>> {
        match self.tokens.get(self.cursor) {
            Some(token) => {
                self.advance();
                Ok(token.clone())
            }

            None => self.fail(ParserError::UnexpectedEof),
        }
    }

    /// Falla en el siguiente token, el cual no es `expected`.
    fn unexpected<T>(&self, expected: &str) -> Parse<T> {
        match self.tokens.get(self.cursor) {
            Some(token) => Err(Located::at(
                ParserError::UnexpectedToken {
                    expected: expected.to_owned(),
                    found: token.val().kind.clone(),
                },
                token.location().clone(),
            )),

            None => self.fail(ParserError::UnexpectedEof),
        }
    }

    /// Ubicación del siguiente token, o del último si no quedan más.
    fn here(&self) -> Location {
        self.tokens
            .get(self.cursor)
            .map_or_else(|| self.last_known.clone(), |token| token.location().clone())
    }

    fn span_from(&self, start: Location) -> Location {
        Location::span(start, &self.last_known)
    }

    fn fail<T>(&self, error: ParserError) -> Parse<T> {
        Err(Located::at(error, self.last_known.clone()))
    }
}

/// Completa la longitud de `T x[] = ...` a partir del inicializador.
fn infer_length(ty: Type, init: Option<&Init>) -> Parse<Type> {
    let (element, length, location) = match (ty, init) {
        (Type::Array(element, 0), Some(Init::List(items, location))) => {
            (element, items.len(), location)
        }

        (Type::Array(element, 0), Some(Init::Str(bytes, location))) => {
            (element, bytes.len() + 1, location)
        }

        (ty, _) => return Ok(ty),
    };

    let element = *element;
    u32::try_from(length)
        .ok()
        .and_then(|length| element.checked_array_of(length))
        .ok_or_else(|| Located::at(ParserError::TooLarge, location.clone()))
}

/// Tipo del elemento `index` de un inicializador entre llaves.
fn member_type(ty: &Type, index: usize) -> Type {
    match ty {
        Type::Array(element, _) => (**element).clone(),
        Type::Struct(aggregate) => aggregate
            .fields()
            .get(index)
            .map_or(Type::Void, |field| field.ty.clone()),

        other => other.clone(),
    }
}

fn element_at(array: Expr, index: u32) -> Expr {
    let index = Expr::num(index as i64, array.location.clone());
    Expr::deref(Expr::binary(BinOp::Add, array, index))
}

fn member_of(aggregate: Expr, name: Identifier) -> Expr {
    let location = aggregate.location.clone();
    let kind = ExprKind::Member {
        expr: Box::new(aggregate),
        name,
        offset: 0,
    };

    Expr::new(kind, location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::Lexer;

    fn parse_text(text: &str) -> Parse<Program> {
        let source = Source::new("test.c", text);
        let tokens = Lexer::new(Rc::clone(&source)).tokenize().unwrap();

        parse(&source, &tokens)
    }

    fn program(text: &str) -> Program {
        parse_text(text).expect("parsing failed")
    }

    fn fail(text: &str) -> ParserError {
        parse_text(text).expect_err("parsing should fail").into_inner()
    }

    fn body(function: &Function) -> &[Stmt] {
        match &function.body.as_ref().expect("no body").kind {
            StmtKind::Block(stmts) => stmts,
            _ => panic!("body is not a block"),
        }
    }

    fn returned(function: &Function) -> &Expr {
        let last = body(function).last().expect("empty body");
        match &last.kind {
            StmtKind::Return(Some(expr)) => expr,
            other => panic!("expected return, found {:?}", other),
        }
    }

    #[test]
    fn precedence() {
        let program = program("int main() { return 1 + 2 * 3 < 4 == 0; }");
        let expr = returned(&program.functions[0]);

        let (lhs, rhs) = match &expr.kind {
            ExprKind::Binary { op: BinOp::Eq, lhs, rhs, .. } => (lhs, rhs),
            other => panic!("{:?}", other),
        };

        assert!(matches!(rhs.kind, ExprKind::Num(0)));
        match &lhs.kind {
            ExprKind::Binary { op: BinOp::Lt, lhs, .. } => match &lhs.kind {
                ExprKind::Binary { op: BinOp::Add, rhs, .. } => {
                    assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Mul, .. }))
                }

                other => panic!("{:?}", other),
            },

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn greater_swaps_operands() {
        let program = program("int main() { int a; int b; return a > b; }");
        match &returned(&program.functions[0]).kind {
            ExprKind::Binary { op: BinOp::Lt, lhs, rhs, .. } => {
                assert!(matches!(lhs.kind, ExprKind::Local(VarId(1))));
                assert!(matches!(rhs.kind, ExprKind::Local(VarId(0))));
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn cast_versus_parenthesis() {
        let program = program("typedef long L; int main() { int x; return (L)(x) + (x); }");
        match &returned(&program.functions[0]).kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                assert!(matches!(&lhs.kind, ExprKind::Cast { to: Type::Long, .. }));
                assert!(matches!(rhs.kind, ExprKind::Local(_)));
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn function_prototype_and_globals() {
        let program = program("int x, y[4]; int f(int a, char *b); int *g(void) { return &x; }");

        assert_eq!(program.globals.len(), 2);
        assert_eq!(program.globals[1].ty, Type::Int.array_of(4));

        let f = &program.functions[0];
        assert!(f.body.is_none());
        assert_eq!(f.locals[1].ty, Type::Char.pointer_to());

        let g = &program.functions[1];
        assert_eq!(g.ret, Type::Int.pointer_to());
        assert!(g.params.is_empty());
    }

    #[test]
    fn nested_arrays_and_params_decay() {
        let program = program("int f(int v[]) { int a[2][3]; return 0; }");
        let locals = &program.functions[0].locals;

        assert_eq!(locals[0].ty, Type::Int.pointer_to());
        assert_eq!(locals[1].ty, Type::Int.array_of(3).array_of(2));
    }

    #[test]
    fn block_scoping() {
        let text = "typedef int T;
                    int main() {
                        int x;
                        { typedef char T; T x; x = 1; }
                        T y;
                        return x;
                    }";

        let program = program(text);
        let main = &program.functions[0];

        let types: Vec<_> = main.locals.iter().map(|var| var.ty.clone()).collect();
        assert_eq!(types, vec![Type::Int, Type::Char, Type::Int]);
        assert!(matches!(returned(main).kind, ExprKind::Local(VarId(0))));
    }

    #[test]
    fn struct_tags() {
        let text = "struct node { int value; struct node *next; };
                    int main() { struct node n; return n.next->value; }";

        let program = program(text);
        let main = &program.functions[0];

        match &main.locals[0].ty {
            Type::Struct(node) => {
                assert_eq!(node.size(), 16);
                assert_eq!(node.field("next").map(|field| field.offset), Some(8));
            }

            other => panic!("{:?}", other),
        }

        match &returned(main).kind {
            ExprKind::Member { expr, name, .. } => {
                assert_eq!(name.as_ref(), "value");
                assert!(matches!(expr.kind, ExprKind::Deref(_)));
            }

            other => panic!("{:?}", other),
        }

        assert!(matches!(
            fail("struct s { int a; }; struct s { int b; };"),
            ParserError::TagRedefinition(_)
        ));

        // Un bloque interno puede declarar su propio tag
        program_ok("struct s { int a; }; int main() { struct s { char b; } x; return 0; }");
    }

    fn program_ok(text: &str) {
        parse_text(text).expect("parsing failed");
    }

    #[test]
    fn enum_constants_are_copies() {
        let program = program("enum color { RED, GREEN = 5, BLUE }; int main() { return BLUE + BLUE; }");
        let expr = returned(&program.functions[0]);

        match &expr.kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                assert!(matches!(lhs.kind, ExprKind::Num(6)));
                assert!(matches!(rhs.kind, ExprKind::Num(6)));

                let mut lhs = lhs.clone();
                lhs.ty = Type::Long;
                assert_eq!(rhs.ty, Type::Int);
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn compound_assignment_duplicates_target() {
        let program = program("int main() { int a; a *= 3; return a; }");
        match &body(&program.functions[0])[0].kind {
            StmtKind::Expr(Expr {
                kind: ExprKind::Assign { lhs, rhs },
                ..
            }) => {
                assert!(matches!(lhs.kind, ExprKind::Local(VarId(0))));
                match &rhs.kind {
                    ExprKind::Binary { op: BinOp::Mul, lhs, .. } => {
                        assert!(matches!(lhs.kind, ExprKind::Local(VarId(0))))
                    }

                    other => panic!("{:?}", other),
                }
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn increments() {
        let program = program("int main() { int i; ++i; return i--; }");
        let main = &program.functions[0];

        match &body(main)[0].kind {
            StmtKind::Expr(Expr {
                kind: ExprKind::Assign { rhs, .. },
                ..
            }) => assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Add, .. })),

            other => panic!("{:?}", other),
        }

        match &returned(main).kind {
            ExprKind::Postfix { op: BinOp::Sub, expr } => {
                assert!(matches!(expr.kind, ExprKind::Local(VarId(0))))
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn local_initializers() {
        let program = program("int main() { char s[] = \"ab\"; int a[3] = {1}; return 0; }");
        let main = &program.functions[0];

        assert_eq!(main.locals[0].ty, Type::Char.array_of(3));

        let count = |stmt: &Stmt| {
            let mut expr = match &stmt.kind {
                StmtKind::Expr(expr) => expr,
                other => panic!("{:?}", other),
            };

            let mut assignments = 1;
            while let ExprKind::Comma(lhs, _) = &expr.kind {
                assignments += 1;
                expr = lhs;
            }

            assignments
        };

        // Los elementos no mencionados se llenan con cero
        assert_eq!(count(&body(main)[0]), 3);
        assert_eq!(count(&body(main)[1]), 3);
    }

    #[test]
    fn global_initializers() {
        let program = program("int g[3] = {1, 2}; char *s = \"hi\"; char t[] = \"ok\"; int *p = &g[0] + 0;");

        let image = |index: usize| program.globals[index].init.as_ref().unwrap();
        assert_eq!(image(0).bytes, vec![1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0]);

        assert_eq!(image(1).relocations.len(), 1);
        assert_eq!(image(1).relocations[0].symbol, ".L.str.0");

        assert_eq!(program.globals[2].ty, Type::Char.array_of(3));
        assert_eq!(image(2).bytes, b"ok\0".to_vec());

        assert!(matches!(fail("int x; int y = x;"), ParserError::NotConstant));
        assert!(matches!(fail("int x = 1; int x = 2;"), ParserError::Redefinition(_)));
    }

    #[test]
    fn constant_expressions() {
        let program = program("int a[2 * (3 + 1) - 1 ? 4 : 5]; enum { K = 1 << 3 }; int b[K];");

        assert_eq!(program.globals[0].ty, Type::Int.array_of(4));
        assert_eq!(program.globals[1].ty, Type::Int.array_of(8));
        assert!(matches!(fail("int a[1 / 0];"), ParserError::DivisionByZero));
        assert!(matches!(fail("int a[0];"), ParserError::BadArrayLength(0)));
    }

    #[test]
    fn strings_are_interned() {
        let program = program("int main() { char *a = \"x\"; char *b = \"x\" \"\"; char *c = \"y\"; return 0; }");
        assert_eq!(program.strings, vec![b"x".to_vec(), b"y".to_vec()]);
    }

    #[test]
    fn switch_and_loops() {
        let text = "int main() {
                        int i;
                        for (int j = 0; j < 3; j++) continue;
                        do i = i + 1; while (i < 10);
                        switch (i) { case 1 + 1: break; default: ; }
                        return 0;
                    }";

        let program = program(text);
        let stmts = body(&program.functions[0]);

        assert!(matches!(stmts[0].kind, StmtKind::For { .. }));
        assert!(matches!(stmts[1].kind, StmtKind::DoWhile { .. }));

        match &stmts[2].kind {
            StmtKind::Switch { body, .. } => match &body.kind {
                StmtKind::Block(stmts) => {
                    assert!(matches!(stmts[0].kind, StmtKind::Case { value: 2, .. }))
                }

                other => panic!("{:?}", other),
            },

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn sizeof_type_is_folded() {
        let program = program("struct p { char c; long l; }; int main() { return sizeof(struct p) + sizeof(int*); }");
        match &returned(&program.functions[0]).kind {
            ExprKind::Binary { lhs, rhs, .. } => {
                assert!(matches!(lhs.kind, ExprKind::Num(16)));
                assert!(matches!(rhs.kind, ExprKind::Num(8)));
                assert_eq!(lhs.ty, Type::Long);
            }

            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn errors() {
        assert!(matches!(fail("int main() { return y; }"), ParserError::Undefined(_)));
        assert!(matches!(fail("int main() { return 1 }"), ParserError::UnexpectedToken { .. }));
        assert!(matches!(fail("int main() { return"), ParserError::UnexpectedEof));
        assert!(matches!(fail("int main() { void v; }"), ParserError::IncompleteType(..)));
        assert!(matches!(fail("int main() { return ); }"), ParserError::ExpectedExpr(_)));
        assert!(matches!(fail("foo x;"), ParserError::ExpectedType));
        assert!(matches!(
            fail("int main() { int a[2] = {1, 2, 3}; }"),
            ParserError::BadInitializer(_)
        ));
    }

    #[test]
    fn oversized_declarations() {
        assert!(matches!(fail("long a[1000000000];"), ParserError::TooLarge));
        assert!(matches!(
            fail("int main() { long a[1000000000]; return 0; }"),
            ParserError::TooLarge
        ));

        assert!(matches!(fail("char a[4294967295][2];"), ParserError::TooLarge));
        assert!(matches!(
            fail("struct big { long a[200000000]; long b[200000000]; };"),
            ParserError::TooLarge
        ));

        program_ok("long a[200000000];");
    }

    #[test]
    fn function_redefinition() {
        program_ok("int f(void); int f(void) { return 1; } int f(void);");

        let error = parse_text("int f() { return 1; }\nint f() { return 2; }").unwrap_err();
        assert_eq!(error.location().to_string(), "test.c:2:5");
        assert!(matches!(error.into_inner(), ParserError::FunctionRedefinition(_)));
    }

    #[test]
    fn error_location() {
        let error = parse_text("int main() {\n  return 1 +;\n}").unwrap_err();
        assert_eq!(error.location().to_string(), "test.c:2:13");
    }
}
