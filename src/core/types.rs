//! C type graph
//!
//! A `TypeNode` is one vertex of a declared C type: builtin scalars,
//! pointers, arrays, function signatures, records and enums. Pointer, array
//! and function nodes own or share what they point at; record and enum nodes
//! only hold weak references, the canonical object lives in the declaration
//! store.

use super::layout::{AbiScalar, DataModel};
use super::record::{EnumType, Record};
use crate::errors::{FfiError, Result};
use crate::interop::abi::CallingConvention;
use bitflags::bitflags;
use std::fmt;
use std::rc::{Rc, Weak};

/// Type tag. Everything ordered at or after `Enum` is arithmetic, and
/// everything from `Float` on is floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CKind {
    Void,
    Pointer,
    Function,
    Record,
    Array,
    VaList,
    Enum,
    Bool,
    Char,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    LongDouble,
}

impl CKind {
    #[inline]
    pub fn is_arith(self) -> bool {
        self >= Self::Enum
    }

    #[inline]
    pub fn is_integer(self) -> bool {
        self.is_arith() && self < Self::Float
    }

    #[inline]
    pub fn is_float(self) -> bool {
        self >= Self::Float
    }

    #[inline]
    pub fn is_char(self) -> bool {
        matches!(self, Self::Char | Self::SChar | Self::UChar)
    }

    /// Spelling of builtin kinds
    pub fn builtin_name(self) -> Option<&'static str> {
        Some(match self {
            Self::Void => "void",
            Self::VaList => "va_list",
            Self::Bool => "bool",
            Self::Char => "char",
            Self::SChar => "signed char",
            Self::UChar => "unsigned char",
            Self::Short => "short",
            Self::UShort => "unsigned short",
            Self::Int => "int",
            Self::UInt => "unsigned int",
            Self::Long => "long",
            Self::ULong => "unsigned long",
            Self::LongLong => "long long",
            Self::ULongLong => "unsigned long long",
            Self::Float => "float",
            Self::Double => "double",
            Self::LongDouble => "long double",
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Qualifiers: u8 {
        const CONST = 1 << 0;
        const VOLATILE = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u8 {
        /// Function node whose values may own a trampoline
        const CLOSURE = 1 << 0;
        /// Array without a length (`T[]`)
        const UNBOUNDED = 1 << 1;
        /// Array sized at allocation time (`T[?]`)
        const VLA = 1 << 2;
        /// Output parameter: native side sees a pointer to the value
        const REF = 1 << 3;
    }
}

bitflags! {
    /// Calling convention tag in the low bits plus the variadic bit
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FunctionFlags: u32 {
        const CALLCONV = 0xF;
        const VARIADIC = 1 << 8;
    }
}

/// What a node points at, with its ownership
#[derive(Debug, Clone)]
pub enum Nested {
    None,
    Owned(Box<TypeNode>),
    Shared(Rc<TypeNode>),
    Function(Box<FunctionSig>),
    SharedFunction(Rc<FunctionSig>),
    Record(Weak<Record>),
    Enum(Weak<EnumType>),
}

#[derive(Debug, Clone)]
pub struct TypeNode {
    kind: CKind,
    cv: Qualifiers,
    flags: TypeFlags,
    array_len: usize,
    nested: Nested,
}

impl TypeNode {
    fn with_nested(kind: CKind, nested: Nested) -> Self {
        Self {
            kind,
            cv: Qualifiers::empty(),
            flags: TypeFlags::empty(),
            array_len: 0,
            nested,
        }
    }

    /// Scalar, void or va_list node
    pub fn builtin(kind: CKind) -> Self {
        debug_assert!(kind.builtin_name().is_some() || kind == CKind::Enum);
        Self::with_nested(kind, Nested::None)
    }

    pub fn void() -> Self {
        Self::builtin(CKind::Void)
    }

    pub fn pointer_to(target: TypeNode) -> Self {
        Self::with_nested(CKind::Pointer, Nested::Owned(Box::new(target)))
    }

    pub fn pointer_to_shared(target: Rc<TypeNode>) -> Self {
        Self::with_nested(CKind::Pointer, Nested::Shared(target))
    }

    pub fn array_of(elem: TypeNode, len: usize) -> Self {
        let mut node = Self::with_nested(CKind::Array, Nested::Owned(Box::new(elem)));
        node.array_len = len;
        node
    }

    pub fn unbounded_array_of(elem: TypeNode) -> Self {
        let mut node = Self::array_of(elem, 0);
        node.flags |= TypeFlags::UNBOUNDED;
        node
    }

    pub fn vla_of(elem: TypeNode) -> Self {
        let mut node = Self::array_of(elem, 0);
        node.flags |= TypeFlags::VLA;
        node
    }

    pub fn function(sig: FunctionSig) -> Self {
        Self::with_nested(CKind::Function, Nested::Function(Box::new(sig)))
    }

    pub fn function_shared(sig: Rc<FunctionSig>) -> Self {
        Self::with_nested(CKind::Function, Nested::SharedFunction(sig))
    }

    /// Pointer to a closure-capable function type, e.g. `void (*)(int)`
    pub fn callback(sig: FunctionSig) -> Self {
        let mut func = Self::function(sig);
        func.flags |= TypeFlags::CLOSURE;
        Self::pointer_to(func)
    }

    pub fn of_record(record: &Rc<Record>) -> Self {
        Self::with_nested(CKind::Record, Nested::Record(Rc::downgrade(record)))
    }

    pub fn enumeration(enum_type: &Rc<EnumType>) -> Self {
        Self::with_nested(CKind::Enum, Nested::Enum(Rc::downgrade(enum_type)))
    }

    pub fn with_cv(mut self, cv: Qualifiers) -> Self {
        self.cv = cv;
        self
    }

    pub fn with_flags(mut self, flags: TypeFlags) -> Self {
        self.flags |= flags;
        self
    }

    #[inline]
    pub fn kind(&self) -> CKind {
        self.kind
    }

    #[inline]
    pub fn cv(&self) -> Qualifiers {
        self.cv
    }

    #[inline]
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    #[inline]
    pub fn array_len(&self) -> usize {
        self.array_len
    }

    pub fn nested(&self) -> &Nested {
        &self.nested
    }

    /// Whether the nested node is owned by this one
    pub fn owns_nested(&self) -> bool {
        matches!(self.nested, Nested::Owned(_) | Nested::Function(_))
    }

    /// Target of a pointer, element of an array
    pub fn pointee(&self) -> Option<&TypeNode> {
        match &self.nested {
            Nested::Owned(node) => Some(node),
            Nested::Shared(node) => Some(node),
            _ => None,
        }
    }

    /// Signature of a function node or of a pointer to one
    pub fn function_sig(&self) -> Option<&FunctionSig> {
        match (&self.nested, self.kind) {
            (Nested::Function(sig), CKind::Function) => Some(sig),
            (Nested::SharedFunction(sig), CKind::Function) => Some(sig),
            (_, CKind::Pointer) => self
                .pointee()
                .filter(|p| p.kind == CKind::Function)
                .and_then(TypeNode::function_sig),
            _ => None,
        }
    }

    /// Canonical record, `None` if this is not a record or it was dropped
    pub fn record(&self) -> Option<Rc<Record>> {
        match &self.nested {
            Nested::Record(weak) => weak.upgrade(),
            _ => None,
        }
    }

    pub fn enum_type(&self) -> Option<Rc<EnumType>> {
        match &self.nested {
            Nested::Enum(weak) => weak.upgrade(),
            _ => None,
        }
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        self.kind == CKind::Void
    }

    #[inline]
    pub fn is_arith(&self) -> bool {
        self.kind.is_arith()
    }

    #[inline]
    pub fn is_integer(&self) -> bool {
        self.kind.is_integer()
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        self.kind.is_float()
    }

    #[inline]
    pub fn is_pointer(&self) -> bool {
        self.kind == CKind::Pointer
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        self.kind == CKind::Array
    }

    #[inline]
    pub fn is_record(&self) -> bool {
        self.kind == CKind::Record
    }

    pub fn is_ptr_like(&self) -> bool {
        matches!(self.kind, CKind::Pointer | CKind::Array)
    }

    pub fn is_callable(&self) -> bool {
        match self.kind {
            CKind::Function => true,
            CKind::Pointer => self.pointee().map_or(false, |p| p.kind == CKind::Function),
            _ => false,
        }
    }

    /// Callable type whose values may own a trampoline
    pub fn is_closure(&self) -> bool {
        match self.kind {
            CKind::Function => self.flags.contains(TypeFlags::CLOSURE),
            CKind::Pointer => self.pointee().map_or(false, TypeNode::is_closure),
            _ => false,
        }
    }

    pub fn is_ref(&self) -> bool {
        self.flags.contains(TypeFlags::REF)
    }

    pub fn is_vla(&self) -> bool {
        self.kind == CKind::Array && self.flags.contains(TypeFlags::VLA)
    }

    pub fn is_unbounded(&self) -> bool {
        self.kind == CKind::Array && self.flags.contains(TypeFlags::UNBOUNDED)
    }

    pub fn is_const(&self) -> bool {
        self.cv.contains(Qualifiers::CONST)
    }

    /// Scalar descriptor under the host model
    pub fn abi_scalar(&self) -> Option<AbiScalar> {
        DataModel::host().abi_scalar(self.kind)
    }

    pub fn is_unsigned(&self) -> bool {
        self.abi_scalar().map_or(false, AbiScalar::is_unsigned)
    }

    /// Whether a value of this type can be passed by value
    pub fn passable(&self) -> bool {
        match self.kind {
            CKind::Void | CKind::Array => false,
            CKind::Record => self.record().map_or(false, |r| r.passable()),
            _ => true,
        }
    }

    /// Same type without the output-parameter marker
    pub fn unref(&self) -> TypeNode {
        let mut node = self.clone();
        node.clear_ref();
        node
    }

    /// Same type marked as an output parameter
    pub fn as_ref(&self) -> TypeNode {
        let mut node = self.clone();
        node.add_ref();
        node
    }

    pub fn add_ref(&mut self) {
        self.flags |= TypeFlags::REF;
    }

    pub fn clear_ref(&mut self) {
        self.flags -= TypeFlags::REF;
    }

    /// Native size under the host model
    pub fn alloc_size(&self) -> Result<usize> {
        self.size_in(DataModel::host())
    }

    pub fn alignment(&self) -> Result<usize> {
        self.align_in(DataModel::host())
    }

    pub fn size_in(&self, model: &DataModel) -> Result<usize> {
        match self.kind {
            CKind::Void => Err(FfiError::incomplete(self)),
            CKind::Record => {
                let record = self.record().ok_or_else(|| FfiError::incomplete(self))?;
                Ok(record.layout_in(model)?.size)
            }
            CKind::Array => {
                let elem = self.pointee().ok_or_else(|| FfiError::incomplete(self))?;
                let elem_size = elem.size_in(model)?;
                if self.flags.intersects(TypeFlags::UNBOUNDED | TypeFlags::VLA) {
                    return Ok(0);
                }
                elem_size
                    .checked_mul(self.array_len)
                    .ok_or_else(|| FfiError::range(self.array_len, self))
            }
            kind => model
                .scalar_layout(kind)
                .map(|l| l.size)
                .ok_or_else(|| FfiError::unsupported(self)),
        }
    }

    pub fn align_in(&self, model: &DataModel) -> Result<usize> {
        match self.kind {
            CKind::Void => Err(FfiError::incomplete(self)),
            CKind::Record => {
                let record = self.record().ok_or_else(|| FfiError::incomplete(self))?;
                Ok(record.layout_in(model)?.align)
            }
            CKind::Array => self
                .pointee()
                .ok_or_else(|| FfiError::incomplete(self))?
                .align_in(model),
            kind => model
                .scalar_layout(kind)
                .map(|l| l.align)
                .ok_or_else(|| FfiError::unsupported(self)),
        }
    }

    /// Structural equality; records and enums compare by identity
    pub fn is_same(&self, other: &TypeNode, ignore_cv: bool, ignore_ref: bool) -> bool {
        if !ignore_cv && self.cv != other.cv {
            return false;
        }
        if !ignore_ref && self.flags.contains(TypeFlags::REF) != other.flags.contains(TypeFlags::REF) {
            return false;
        }
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            CKind::Pointer => match (self.pointee(), other.pointee()) {
                (Some(a), Some(b)) => a.is_same(b, false, false),
                _ => false,
            },
            CKind::Array => {
                let sizing = TypeFlags::UNBOUNDED | TypeFlags::VLA;
                self.array_len == other.array_len
                    && (self.flags & sizing) == (other.flags & sizing)
                    && match (self.pointee(), other.pointee()) {
                        (Some(a), Some(b)) => a.is_same(b, false, false),
                        _ => false,
                    }
            }
            CKind::Function => match (self.function_sig(), other.function_sig()) {
                (Some(a), Some(b)) => a.is_same(b),
                _ => false,
            },
            CKind::Record => match (&self.nested, &other.nested) {
                (Nested::Record(a), Nested::Record(b)) => Weak::ptr_eq(a, b),
                _ => false,
            },
            CKind::Enum => match (&self.nested, &other.nested) {
                (Nested::Enum(a), Nested::Enum(b)) => Weak::ptr_eq(a, b),
                _ => false,
            },
            _ => true,
        }
    }

    /// Spelling plus the identity of every record and enum it mentions, so
    /// distinct declarations sharing a tag never share a key
    pub fn identity_key(&self) -> String {
        let mut key = self.to_string();
        self.push_identities(&mut key);
        key
    }

    fn push_identities(&self, out: &mut String) {
        match &self.nested {
            Nested::Owned(node) => node.push_identities(out),
            Nested::Shared(node) => node.push_identities(out),
            Nested::Function(sig) => sig.push_identities(out),
            Nested::SharedFunction(sig) => sig.push_identities(out),
            Nested::Record(weak) => out.push_str(&format!("@{:p}", weak.as_ptr())),
            Nested::Enum(weak) => out.push_str(&format!("@{:p}", weak.as_ptr())),
            Nested::None => {}
        }
    }

    /// C declaration of `name` with this type, e.g. `int (*cb)(int)`
    pub fn declare(&self, name: &str) -> String {
        self.render(name.to_string())
    }

    fn render(&self, inner: String) -> String {
        if self.flags.contains(TypeFlags::REF) {
            return self.unref().render(wrap_declarator("&", Qualifiers::empty(), inner));
        }
        match self.kind {
            CKind::Pointer => {
                let decl = wrap_declarator("*", self.cv, inner);
                let target = self.pointee();
                let decl = match target.map(|t| t.kind) {
                    Some(CKind::Array) | Some(CKind::Function) => format!("({})", decl),
                    _ => decl,
                };
                match target {
                    Some(t) => t.render(decl),
                    None => format!("void {}", decl),
                }
            }
            CKind::Array => {
                let dim = if self.flags.contains(TypeFlags::VLA) {
                    "[?]".to_string()
                } else if self.flags.contains(TypeFlags::UNBOUNDED) {
                    "[]".to_string()
                } else {
                    format!("[{}]", self.array_len)
                };
                match self.pointee() {
                    Some(elem) => elem.render(format!("{}{}", inner, dim)),
                    None => format!("void {}{}", inner, dim),
                }
            }
            CKind::Function => match self.function_sig() {
                Some(sig) => sig.result.render(format!("{}({})", inner, sig.param_list())),
                None => format!("void {}()", inner),
            },
            _ => {
                let mut out = String::new();
                if self.cv.contains(Qualifiers::CONST) {
                    out.push_str("const ");
                }
                if self.cv.contains(Qualifiers::VOLATILE) {
                    out.push_str("volatile ");
                }
                out.push_str(&self.base_name());
                if !inner.is_empty() {
                    out.push(' ');
                    out.push_str(&inner);
                }
                out
            }
        }
    }

    fn base_name(&self) -> String {
        match (&self.nested, self.kind) {
            (Nested::Record(weak), _) => match weak.upgrade() {
                Some(record) => record.display_name(),
                None => "struct <released>".to_string(),
            },
            (Nested::Enum(weak), _) => match weak.upgrade() {
                Some(e) => e.display_name(),
                None => "enum <released>".to_string(),
            },
            (_, CKind::Enum) => "int".to_string(),
            (_, kind) => kind.builtin_name().unwrap_or("?").to_string(),
        }
    }
}

fn wrap_declarator(mark: &str, cv: Qualifiers, inner: String) -> String {
    let mut decl = mark.to_string();
    if cv.contains(Qualifiers::CONST) {
        decl.push_str("const");
    }
    if cv.contains(Qualifiers::VOLATILE) {
        if cv.contains(Qualifiers::CONST) {
            decl.push(' ');
        }
        decl.push_str("volatile");
    }
    if !inner.is_empty() {
        if !cv.is_empty() {
            decl.push(' ');
        }
        decl.push_str(&inner);
    }
    decl
}

impl fmt::Display for TypeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(String::new()))
    }
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Option<String>,
    pub ty: TypeNode,
}

impl Param {
    pub fn new(ty: TypeNode) -> Self {
        Self { name: None, ty }
    }

    pub fn named(name: impl Into<String>, ty: TypeNode) -> Self {
        Self {
            name: Some(name.into()),
            ty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionSig {
    result: TypeNode,
    params: Vec<Param>,
    flags: FunctionFlags,
}

impl FunctionSig {
    pub fn new(result: TypeNode, params: Vec<Param>) -> Self {
        Self {
            result,
            params,
            flags: FunctionFlags::empty(),
        }
    }

    /// Signature from bare parameter types
    pub fn of(result: TypeNode, params: impl IntoIterator<Item = TypeNode>) -> Self {
        Self::new(result, params.into_iter().map(Param::new).collect())
    }

    pub fn variadic(mut self) -> Self {
        self.flags |= FunctionFlags::VARIADIC;
        self
    }

    pub fn with_callconv(mut self, conv: CallingConvention) -> Self {
        self.flags = (self.flags - FunctionFlags::CALLCONV) | FunctionFlags::from_bits_retain(conv.bits());
        self
    }

    pub fn result(&self) -> &TypeNode {
        &self.result
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn flags(&self) -> FunctionFlags {
        self.flags
    }

    pub fn is_variadic(&self) -> bool {
        self.flags.contains(FunctionFlags::VARIADIC)
    }

    pub fn callconv(&self) -> CallingConvention {
        CallingConvention::from_bits((self.flags & FunctionFlags::CALLCONV).bits())
    }

    pub fn is_same(&self, other: &FunctionSig) -> bool {
        self.flags == other.flags
            && self.params.len() == other.params.len()
            && self.result.is_same(&other.result, false, false)
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.ty.is_same(&b.ty, false, false))
    }

    fn param_list(&self) -> String {
        let mut parts: Vec<String> = self.params.iter().map(|p| p.ty.to_string()).collect();
        if self.is_variadic() {
            parts.push("...".to_string());
        }
        if parts.is_empty() {
            "void".to_string()
        } else {
            parts.join(", ")
        }
    }

    fn push_identities(&self, out: &mut String) {
        self.result.push_identities(out);
        for param in &self.params {
            param.ty.push_identities(out);
        }
    }

    /// Cache key: spelling, the full flags word, and the identity of every
    /// record and enum in the signature
    pub fn cache_key(&self) -> String {
        let mut key = format!("{}#{:x}", TypeNode::function(self.clone()), self.flags.bits());
        self.push_identities(&mut key);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::Field;

    fn int() -> TypeNode {
        TypeNode::builtin(CKind::Int)
    }

    fn char_ptr() -> TypeNode {
        TypeNode::pointer_to(TypeNode::builtin(CKind::Char))
    }

    #[test]
    fn test_kind_predicates() {
        assert!(CKind::Enum.is_arith());
        assert!(CKind::Bool.is_integer());
        assert!(!CKind::Double.is_integer());
        assert!(CKind::LongDouble.is_float());
        assert!(!CKind::Pointer.is_arith());
        assert!(TypeNode::builtin(CKind::UInt).is_unsigned());
        assert!(!TypeNode::builtin(CKind::Int).is_unsigned());
    }

    #[test]
    fn test_render_declarators() {
        assert_eq!(char_ptr().to_string(), "char *");
        let fp = TypeNode::pointer_to(TypeNode::function(FunctionSig::of(int(), [int(), char_ptr()])));
        assert_eq!(fp.to_string(), "int (*)(int, char *)");
        let arr = TypeNode::pointer_to(TypeNode::array_of(int(), 4));
        assert_eq!(arr.to_string(), "int (*)[4]");
        let cptr = TypeNode::pointer_to(TypeNode::builtin(CKind::Char).with_cv(Qualifiers::CONST))
            .with_cv(Qualifiers::CONST);
        assert_eq!(cptr.to_string(), "const char *const");
        let printf = TypeNode::function(FunctionSig::of(int(), [char_ptr()]).variadic());
        assert_eq!(printf.declare("printf"), "int printf(char *, ...)");
        let none = TypeNode::function(FunctionSig::of(TypeNode::void(), []));
        assert_eq!(none.declare("f"), "void f(void)");
        assert_eq!(TypeNode::vla_of(int()).to_string(), "int [?]");
    }

    #[test]
    fn test_is_same_structural_for_pointers() {
        assert!(char_ptr().is_same(&char_ptr(), false, false));
        let const_char = TypeNode::pointer_to(TypeNode::builtin(CKind::Char).with_cv(Qualifiers::CONST));
        assert!(!char_ptr().is_same(&const_char, false, false));
        assert!(!TypeNode::array_of(int(), 3).is_same(&TypeNode::array_of(int(), 4), false, false));
    }

    #[test]
    fn test_records_compare_by_identity() {
        let a = Rc::new(Record::new("s", false));
        let b = Rc::new(Record::new("s", false));
        assert!(TypeNode::of_record(&a).is_same(&TypeNode::of_record(&a), false, false));
        assert!(!TypeNode::of_record(&a).is_same(&TypeNode::of_record(&b), false, false));
    }

    #[test]
    fn test_cache_key_tells_same_named_records_apart() {
        let a = Rc::new(Record::new("s", false));
        let b = Rc::new(Record::new("s", false));
        let sig_a = FunctionSig::of(int(), [TypeNode::of_record(&a)]);
        let sig_b = FunctionSig::of(int(), [TypeNode::of_record(&b)]);
        assert_eq!(TypeNode::of_record(&a).to_string(), TypeNode::of_record(&b).to_string());
        assert_ne!(sig_a.cache_key(), sig_b.cache_key());
        assert_eq!(sig_a.cache_key(), sig_a.clone().cache_key());
        let ptr_a = TypeNode::pointer_to(TypeNode::of_record(&a));
        assert_ne!(ptr_a.identity_key(), TypeNode::pointer_to(TypeNode::of_record(&b)).identity_key());
    }

    #[test]
    fn test_ref_toggle() {
        let r = int().as_ref();
        assert!(r.is_ref());
        assert!(!r.is_same(&int(), false, false));
        assert!(r.is_same(&int(), false, true));
        assert!(!r.unref().is_ref());
        assert_eq!(r.alloc_size().unwrap(), int().alloc_size().unwrap());
    }

    #[test]
    fn test_reference_is_a_flag_not_a_kind() {
        let ptr = TypeNode::pointer_to(int());
        let r = ptr.as_ref();
        assert_eq!(r.kind(), CKind::Pointer);
        assert!(r.is_ref());
        assert!(r.is_same(&ptr, false, true));
        assert_eq!(r.declare("out"), "int *&out");
        assert_eq!(r.unref().declare("p"), "int *p");
    }

    #[test]
    fn test_incomplete_sizes() {
        assert!(TypeNode::void().alloc_size().is_err());
        let opaque = Rc::new(Record::new("o", false));
        let ty = TypeNode::of_record(&opaque);
        assert!(ty.alloc_size().is_err());
        assert!(!ty.passable());
        // pointers to incomplete types are always sized
        assert_eq!(
            TypeNode::pointer_to(ty).alloc_size().unwrap(),
            std::mem::size_of::<*const u8>()
        );
    }

    #[test]
    fn test_dead_record_reference_is_incomplete() {
        let ty = {
            let rec = Rc::new(Record::new("gone", false));
            rec.set_fields(vec![Field::new("x", int())]).unwrap();
            TypeNode::of_record(&rec)
        };
        assert!(ty.alloc_size().is_err());
        assert_eq!(ty.to_string(), "struct <released>");
    }

    #[test]
    fn test_copy_owns_independent_tree() {
        let original = TypeNode::pointer_to(TypeNode::pointer_to(int()));
        let copy = original.clone();
        drop(original);
        assert_eq!(copy.to_string(), "int **");
        assert!(copy.owns_nested());
    }

    #[test]
    fn test_shared_nested_is_not_deep_copied() {
        let shared = Rc::new(int());
        let a = TypeNode::pointer_to_shared(shared.clone());
        let b = a.clone();
        assert_eq!(Rc::strong_count(&shared), 3);
        assert!(!b.owns_nested());
    }

    #[test]
    fn test_callconv_in_flags_word() {
        let sig = FunctionSig::of(int(), [int()])
            .variadic()
            .with_callconv(CallingConvention::Stdcall);
        assert_eq!(sig.callconv(), CallingConvention::Stdcall);
        assert!(sig.is_variadic());
        let plain = FunctionSig::of(int(), [int()]);
        assert!(!sig.is_same(&plain));
    }

    #[test]
    fn test_callable_predicates() {
        let cb = TypeNode::callback(FunctionSig::of(TypeNode::void(), [int()]));
        assert!(cb.is_callable());
        assert!(cb.is_closure());
        assert!(cb.function_sig().is_some());
        assert!(!char_ptr().is_callable());
    }
}
