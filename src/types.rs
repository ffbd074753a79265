//! Tipos de C.
//!
//! Los tipos son valores: se clonan en vez de mutarse. La única
//! excepción es el layout de un struct, que se completa una sola vez
//! después de haberse declarado su tag. Esto permite structs que se
//! refieren a sí mismos por medio de punteros.

use crate::lex::Identifier;
use std::{
    cell::RefCell,
    fmt::{self, Debug, Display},
    rc::Rc,
};

/// Tamaño de un puntero, en bytes.
pub const POINTER_SIZE: u32 = 8;

/// Tamaño máximo de un objeto. Los desplazamientos relativos a `rbp`
/// deben caber en 32 bits con signo.
pub const MAX_OBJECT_SIZE: u32 = i32::MAX as u32;

#[derive(Clone, Debug)]
pub enum Type {
    Void,
    Char,
    Int,
    Long,
    Ptr(Box<Type>),

    /// Arreglo de longitud conocida. Una longitud de cero proveniente de
    /// `[]` se completa a partir del inicializador.
    Array(Box<Type>, u32),

    Struct(Rc<StructType>),
}

impl Type {
    pub fn pointer_to(self) -> Type {
        Type::Ptr(Box::new(self))
    }

    pub fn array_of(self, length: u32) -> Type {
        Type::Array(Box::new(self), length)
    }

    /// Como [`Type::array_of`], pero falla si el arreglo excede
    /// [`MAX_OBJECT_SIZE`].
    pub fn checked_array_of(self, length: u32) -> Option<Type> {
        match self.size().checked_mul(length) {
            Some(size) if size <= MAX_OBJECT_SIZE => Some(self.array_of(length)),
            _ => None,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Type::Void | Type::Char => 1,
            Type::Int => 4,
            Type::Long | Type::Ptr(_) => POINTER_SIZE,
            Type::Array(element, length) => element.size() * length,
            Type::Struct(aggregate) => aggregate.size(),
        }
    }

    pub fn align(&self) -> u32 {
        match self {
            Type::Array(element, _) => element.align(),
            Type::Struct(aggregate) => aggregate.align(),
            _ => self.size(),
        }
    }

    /// `char`, `int` o `long`.
    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Char | Type::Int | Type::Long)
    }

    /// Punteros y arreglos, los cuales decaen a punteros.
    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_) | Type::Array(..))
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Type::Struct(_))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Valores que no caben en un registro y se manejan por dirección.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Array(..) | Type::Struct(_))
    }

    /// Tipo apuntado por un puntero o elemento de un arreglo.
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(pointee) | Type::Array(pointee, _) => Some(pointee),
            _ => None,
        }
    }

    /// Un arreglo decae a un puntero nuevo a su primer elemento; el
    /// tipo original no se modifica.
    pub fn decay(&self) -> Type {
        match self {
            Type::Array(element, _) => Type::Ptr(element.clone()),
            other => other.clone(),
        }
    }

    /// Promoción entera: `char` opera como `int`.
    pub fn promote(&self) -> Type {
        match self {
            Type::Char => Type::Int,
            other => other.decay(),
        }
    }

    /// Un tipo cuyo tamaño se conoce. `void` y structs sin cuerpo no lo son.
    pub fn is_complete(&self) -> bool {
        match self {
            Type::Void => false,
            Type::Array(element, _) => element.is_complete(),
            Type::Struct(aggregate) => aggregate.is_complete(),
            _ => true,
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        use Type::*;

        match (self, other) {
            (Void, Void) | (Char, Char) | (Int, Int) | (Long, Long) => true,
            (Ptr(a), Ptr(b)) => a == b,
            (Array(a, m), Array(b, n)) => m == n && a == b,
            (Struct(a), Struct(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Display for Type {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => fmt.write_str("void"),
            Type::Char => fmt.write_str("char"),
            Type::Int => fmt.write_str("int"),
            Type::Long => fmt.write_str("long"),
            Type::Ptr(pointee) => write!(fmt, "{}*", pointee),
            Type::Array(element, length) => write!(fmt, "{}[{}]", element, length),
            Type::Struct(aggregate) => match &aggregate.tag {
                Some(tag) => write!(fmt, "struct {}", tag),
                None => fmt.write_str("struct <anonymous>"),
            },
        }
    }
}

/// Un struct, posiblemente incompleto.
pub struct StructType {
    pub tag: Option<Identifier>,
    layout: RefCell<Option<Layout>>,
}

impl StructType {
    pub fn new(tag: Option<Identifier>) -> Rc<Self> {
        Rc::new(StructType {
            tag,
            layout: RefCell::new(None),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.layout.borrow().is_some()
    }

    /// Fija los campos del struct. Retorna `false` si ya estaba completo.
    pub fn complete(&self, layout: Layout) -> bool {
        let mut current = self.layout.borrow_mut();
        if current.is_some() {
            return false;
        }

        *current = Some(layout);
        true
    }

    pub fn field(&self, name: &str) -> Option<Field> {
        self.layout
            .borrow()
            .as_ref()
            .and_then(|layout| layout.fields.iter().find(|field| field.name.as_ref() == name))
            .cloned()
    }

    /// Campos en orden de declaración. Vacío si el struct es incompleto.
    pub fn fields(&self) -> Vec<Field> {
        self.layout
            .borrow()
            .as_ref()
            .map(|layout| layout.fields.clone())
            .unwrap_or_default()
    }

    pub fn size(&self) -> u32 {
        self.layout.borrow().as_ref().map_or(0, |layout| layout.size)
    }

    pub fn align(&self) -> u32 {
        self.layout.borrow().as_ref().map_or(1, |layout| layout.align)
    }
}

impl Debug for StructType {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Los campos pueden apuntar de vuelta a este struct
        match &self.tag {
            Some(tag) => write!(fmt, "struct {}", tag),
            None => fmt.write_str("struct <anonymous>"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Field {
    pub name: Identifier,
    pub ty: Type,
    pub offset: u32,
}

#[derive(Clone, Debug)]
pub struct Layout {
    pub fields: Vec<Field>,
    pub size: u32,
    pub align: u32,
}

impl Layout {
    /// Dispone campos en orden, cada uno alineado a su tipo. El tamaño
    /// total se redondea a la mayor alineación entre los campos.
    ///
    /// Retorna `None` si el struct excedería [`MAX_OBJECT_SIZE`].
    pub fn compute(members: Vec<(Identifier, Type)>) -> Option<Layout> {
        let mut offset = 0;
        let mut align = 1;

        let mut fields = Vec::with_capacity(members.len());
        for (name, ty) in members {
            offset = align_to(offset, ty.align());
            align = align.max(ty.align());

            let field = Field { name, offset, ty };
            offset = offset
                .checked_add(field.ty.size())
                .filter(|&end| end <= MAX_OBJECT_SIZE)?;

            fields.push(field);
        }

        let size = align_to(offset, align);
        if size > MAX_OBJECT_SIZE {
            return None;
        }

        Some(Layout {
            fields,
            size,
            align,
        })
    }
}

/// Redondea `n` hacia arriba al siguiente múltiplo de `align`.
pub fn align_to(n: u32, align: u32) -> u32 {
    (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(types: &[Type]) -> Vec<(Identifier, Type)> {
        types
            .iter()
            .enumerate()
            .map(|(i, ty)| (Identifier::new(&format!("f{}", i)), ty.clone()))
            .collect()
    }

    #[test]
    fn scalar_sizes() {
        assert_eq!(Type::Char.size(), 1);
        assert_eq!(Type::Int.size(), 4);
        assert_eq!(Type::Long.size(), 8);
        assert_eq!(Type::Int.pointer_to().size(), 8);
        assert_eq!(Type::Int.array_of(3).array_of(2).size(), 24);
        assert_eq!(Type::Long.array_of(4).align(), 8);
    }

    #[test]
    fn struct_layout() {
        let layout = Layout::compute(members(&[Type::Char, Type::Int, Type::Char])).unwrap();
        let offsets: Vec<_> = layout.fields.iter().map(|field| field.offset).collect();

        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(layout.size, 12);
        assert_eq!(layout.align, 4);
    }

    #[test]
    fn layout_law() {
        let shapes = [
            vec![Type::Char, Type::Long, Type::Int],
            vec![Type::Int, Type::Char, Type::Char, Type::Long],
            vec![Type::Char.array_of(3), Type::Int, Type::Char.pointer_to()],
            vec![Type::Char, Type::Char],
        ];

        for shape in shapes.iter() {
            let layout = Layout::compute(members(shape)).unwrap();
            let max_align = shape.iter().map(Type::align).max().unwrap();

            let mut last = 0;
            for field in &layout.fields {
                assert!(field.offset >= last);
                assert_eq!(field.offset % field.ty.align(), 0);
                last = field.offset + field.ty.size();
            }

            assert!(layout.size >= last);
            assert_eq!(layout.size % max_align, 0);
        }
    }

    #[test]
    fn decay_is_a_copy() {
        let array = Type::Int.array_of(3);
        let decayed = array.decay();

        assert_eq!(decayed, Type::Int.pointer_to());
        assert_eq!(array, Type::Int.array_of(3));
        assert_eq!(array.to_string(), "int[3]");
    }

    #[test]
    fn oversized_objects() {
        assert_eq!(Type::Long.checked_array_of(1_000_000_000), None);
        assert_eq!(Type::Char.checked_array_of(u32::MAX), None);
        assert_eq!(
            Type::Long.checked_array_of(4),
            Some(Type::Long.array_of(4))
        );

        let half = Type::Long.checked_array_of(200_000_000).unwrap();
        assert!(Layout::compute(members(&[half.clone()])).is_some());
        assert!(Layout::compute(members(&[half.clone(), half])).is_none());
    }

    #[test]
    fn self_referential_struct() {
        let node = StructType::new(Some(Identifier::new("node")));
        let next = Type::Struct(Rc::clone(&node)).pointer_to();

        assert!(!node.is_complete());
        assert!(node.complete(Layout::compute(vec![
            (Identifier::new("value"), Type::Int),
            (Identifier::new("next"), next),
        ])
        .unwrap()));

        assert!(!node.complete(Layout::compute(vec![]).unwrap()));
        assert_eq!(node.size(), 16);
        assert_eq!(node.field("next").map(|field| field.offset), Some(8));
        assert_eq!(format!("{:?}", Type::Struct(node)), "Struct(struct node)");
    }
}
