//! Resolved top-level declarations and their scoped registry

mod store;

pub use store::{DeclarationStore, StagedStore};

use crate::core::{FunctionSig, Param, Record, EnumType, TypeNode};
use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclKind {
    Function,
    Variable,
    Constant,
    Typedef,
    Record,
    Enum,
    Type,
    Param,
}

/// Value of a declared constant
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}U", v),
            Self::Float(v) => write!(f, "{:?}", v),
            Self::Bool(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub name: String,
    /// Symbol to resolve instead of `name`
    pub link_name: Option<String>,
    pub sig: Rc<FunctionSig>,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>, sig: FunctionSig) -> Self {
        Self {
            name: name.into(),
            link_name: None,
            sig: Rc::new(sig),
        }
    }

    pub fn with_link_name(mut self, link_name: impl Into<String>) -> Self {
        self.link_name = Some(link_name.into());
        self
    }

    pub fn symbol(&self) -> &str {
        self.link_name.as_deref().unwrap_or(&self.name)
    }

    pub fn type_node(&self) -> TypeNode {
        TypeNode::function_shared(self.sig.clone())
    }
}

#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub name: String,
    pub link_name: Option<String>,
    pub ty: TypeNode,
}

impl VariableDecl {
    pub fn new(name: impl Into<String>, ty: TypeNode) -> Self {
        Self {
            name: name.into(),
            link_name: None,
            ty,
        }
    }

    pub fn with_link_name(mut self, link_name: impl Into<String>) -> Self {
        self.link_name = Some(link_name.into());
        self
    }

    pub fn symbol(&self) -> &str {
        self.link_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct ConstantDecl {
    pub name: String,
    pub ty: TypeNode,
    pub value: ConstValue,
}

#[derive(Debug, Clone)]
pub struct TypedefDecl {
    pub name: String,
    pub ty: Rc<TypeNode>,
}

#[derive(Debug, Clone)]
pub enum Declaration {
    Function(FunctionDecl),
    Variable(VariableDecl),
    Constant(ConstantDecl),
    Typedef(TypedefDecl),
    Record(Rc<Record>),
    Enum(Rc<EnumType>),
    Type(TypeNode),
    Param(Param),
}

impl Declaration {
    pub fn function(name: impl Into<String>, sig: FunctionSig) -> Self {
        Self::Function(FunctionDecl::new(name, sig))
    }

    pub fn variable(name: impl Into<String>, ty: TypeNode) -> Self {
        Self::Variable(VariableDecl::new(name, ty))
    }

    pub fn constant(name: impl Into<String>, ty: TypeNode, value: ConstValue) -> Self {
        Self::Constant(ConstantDecl {
            name: name.into(),
            ty,
            value,
        })
    }

    pub fn typedef(name: impl Into<String>, ty: TypeNode) -> Self {
        Self::Typedef(TypedefDecl {
            name: name.into(),
            ty: Rc::new(ty),
        })
    }

    pub fn kind(&self) -> DeclKind {
        match self {
            Self::Function(_) => DeclKind::Function,
            Self::Variable(_) => DeclKind::Variable,
            Self::Constant(_) => DeclKind::Constant,
            Self::Typedef(_) => DeclKind::Typedef,
            Self::Record(_) => DeclKind::Record,
            Self::Enum(_) => DeclKind::Enum,
            Self::Type(_) => DeclKind::Type,
            Self::Param(_) => DeclKind::Param,
        }
    }

    /// Registry key. Records and enums live in the tag namespace
    /// (`struct foo`), so they never collide with ordinary identifiers.
    pub fn name(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Function(f) => Some(Cow::Borrowed(&f.name)),
            Self::Variable(v) => Some(Cow::Borrowed(&v.name)),
            Self::Constant(c) => Some(Cow::Borrowed(&c.name)),
            Self::Typedef(t) => Some(Cow::Borrowed(&t.name)),
            Self::Record(r) => Some(Cow::Owned(r.display_name())),
            Self::Enum(e) => Some(Cow::Owned(e.display_name())),
            Self::Type(_) => None,
            Self::Param(p) => p.name.as_deref().map(Cow::Borrowed),
        }
    }

    /// The type this declaration denotes when used as a type name
    pub fn as_type(&self) -> Option<TypeNode> {
        match self {
            Self::Typedef(t) => Some(t.ty.as_ref().clone()),
            Self::Record(r) => Some(TypeNode::of_record(r)),
            Self::Enum(e) => Some(TypeNode::enumeration(e)),
            Self::Type(ty) => Some(ty.clone()),
            _ => None,
        }
    }

    pub fn is_same(&self, other: &Declaration) -> bool {
        match (self, other) {
            (Self::Function(a), Self::Function(b)) => {
                a.name == b.name && a.symbol() == b.symbol() && a.sig.is_same(&b.sig)
            }
            (Self::Variable(a), Self::Variable(b)) => {
                a.name == b.name && a.symbol() == b.symbol() && a.ty.is_same(&b.ty, false, false)
            }
            (Self::Constant(a), Self::Constant(b)) => {
                a.name == b.name && a.value == b.value && a.ty.is_same(&b.ty, false, false)
            }
            (Self::Typedef(a), Self::Typedef(b)) => {
                a.name == b.name && a.ty.is_same(&b.ty, false, false)
            }
            (Self::Record(a), Self::Record(b)) => Rc::ptr_eq(a, b),
            (Self::Enum(a), Self::Enum(b)) => Rc::ptr_eq(a, b),
            (Self::Type(a), Self::Type(b)) => a.is_same(b, false, false),
            (Self::Param(a), Self::Param(b)) => a.name == b.name && a.ty.is_same(&b.ty, false, false),
            _ => false,
        }
    }

    /// Canonical C spelling
    pub fn serialize(&self) -> String {
        match self {
            Self::Function(f) => f.type_node().declare(&f.name),
            Self::Variable(v) => v.ty.declare(&v.name),
            Self::Constant(c) => format!("static const {} = {}", c.ty.declare(&c.name), c.value),
            Self::Typedef(t) => format!("typedef {}", t.ty.declare(&t.name)),
            Self::Record(r) => {
                if r.is_opaque() {
                    return r.display_name();
                }
                let body: Vec<String> = r
                    .fields()
                    .iter()
                    .map(|f| format!("{};", f.ty.declare(&f.name)))
                    .collect();
                format!("{} {{ {} }}", r.display_name(), body.join(" "))
            }
            Self::Enum(e) => {
                if e.is_opaque() {
                    return e.display_name();
                }
                let body: Vec<String> = e
                    .fields()
                    .iter()
                    .map(|f| format!("{} = {}", f.name, f.value))
                    .collect();
                format!("{} {{ {} }}", e.display_name(), body.join(", "))
            }
            Self::Type(ty) => ty.to_string(),
            Self::Param(p) => p.ty.declare(p.name.as_deref().unwrap_or("")),
        }
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CKind, Field};

    fn int() -> TypeNode {
        TypeNode::builtin(CKind::Int)
    }

    #[test]
    fn test_serialize_function_and_typedef() {
        let add = Declaration::function("add", FunctionSig::of(int(), [int(), int()]));
        assert_eq!(add.serialize(), "int add(int, int)");

        let cb = Declaration::typedef(
            "cb_t",
            TypeNode::callback(FunctionSig::of(TypeNode::void(), [int()])),
        );
        assert_eq!(cb.serialize(), "typedef void (*cb_t)(int)");
    }

    #[test]
    fn test_serialize_record() {
        let rec = Rc::new(Record::new("pair", false));
        let decl = Declaration::Record(rec.clone());
        assert_eq!(decl.serialize(), "struct pair");
        rec.set_fields(vec![
            Field::new("a", int()),
            Field::new("b", TypeNode::pointer_to(TypeNode::builtin(CKind::Char))),
        ])
        .unwrap();
        assert_eq!(decl.serialize(), "struct pair { int a; char *b; }");
        assert_eq!(decl.name().as_deref(), Some("struct pair"));
    }

    #[test]
    fn test_link_name() {
        let f = FunctionDecl::new("my_puts", FunctionSig::of(int(), [])).with_link_name("puts");
        assert_eq!(f.symbol(), "puts");
    }

    #[test]
    fn test_is_same_by_structure() {
        let a = Declaration::variable("counter", int());
        let b = Declaration::variable("counter", int());
        let c = Declaration::variable("counter", TypeNode::builtin(CKind::Long));
        assert!(a.is_same(&b));
        assert!(!a.is_same(&c));
        assert_eq!(a.kind(), DeclKind::Variable);
    }
}
