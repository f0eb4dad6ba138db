//! Dynamic host values
//!
//! The host scripting runtime is represented by a small value enum: scalars
//! surface as primitives, everything with native identity is a `Cdata` box.

use super::cdata::ValueBox;
use crate::errors::Result;
use std::fmt;
use std::rc::Rc;

/// A host callable that native code may reach through a trampoline
pub trait HostFunction {
    fn invoke(&self, args: &[HostValue]) -> Result<HostValue>;
}

impl<F> HostFunction for F
where
    F: Fn(&[HostValue]) -> Result<HostValue>,
{
    fn invoke(&self, args: &[HostValue]) -> Result<HostValue> {
        self(args)
    }
}

#[derive(Clone)]
pub enum HostValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    /// Byte string; not required to be UTF-8
    String(Rc<[u8]>),
    Cdata(Rc<ValueBox>),
    Function(Rc<dyn HostFunction>),
}

impl HostValue {
    pub fn string(bytes: impl AsRef<[u8]>) -> Self {
        Self::String(Rc::from(bytes.as_ref()))
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue> + 'static,
    {
        Self::Function(Rc::new(f))
    }

    /// Host-facing type name used in conversion errors
    pub fn type_name(&self) -> String {
        match self {
            Self::Nil => "nil".to_string(),
            Self::Boolean(_) => "boolean".to_string(),
            Self::Integer(_) | Self::Number(_) => "number".to_string(),
            Self::String(_) => "string".to_string(),
            Self::Cdata(b) => format!("cdata<{}>", b.type_node()),
            Self::Function(_) => "function".to_string(),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value; numbers only when integral
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 9.2e18 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_cdata(&self) -> Option<&Rc<ValueBox>> {
        match self {
            Self::Cdata(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("Nil"),
            Self::Boolean(b) => write!(f, "Boolean({})", b),
            Self::Integer(i) => write!(f, "Integer({})", i),
            Self::Number(n) => write!(f, "Number({})", n),
            Self::String(s) => write!(f, "String({:?})", String::from_utf8_lossy(s)),
            Self::Cdata(b) => write!(f, "Cdata({} @ {:p})", b.type_node(), b.as_ptr()),
            Self::Function(func) => write!(f, "Function({:p})", Rc::as_ptr(func) as *const ()),
        }
    }
}

/// Primitives compare by value; boxes and functions by identity
impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Cdata(a), Self::Cdata(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => {
                Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        Self::string(v)
    }
}

impl From<Rc<ValueBox>> for HostValue {
    fn from(v: Rc<ValueBox>) -> Self {
        Self::Cdata(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(HostValue::Nil.type_name(), "nil");
        assert_eq!(HostValue::from(1.5).type_name(), "number");
        assert_eq!(HostValue::from("x").type_name(), "string");
    }

    #[test]
    fn test_integer_views() {
        assert_eq!(HostValue::Number(3.0).as_integer(), Some(3));
        assert_eq!(HostValue::Number(3.5).as_integer(), None);
        assert_eq!(HostValue::Integer(7).as_number(), Some(7.0));
    }

    #[test]
    fn test_function_identity() {
        let f = HostValue::function(|_| Ok(HostValue::Nil));
        let g = f.clone();
        assert_eq!(f, g);
        assert_ne!(f, HostValue::function(|_| Ok(HostValue::Nil)));
    }
}
