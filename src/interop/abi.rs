//! ABI lowering: calling conventions and libffi type descriptors
//!
//! Maps the C type graph onto `middle::Type` trees. Records lower to
//! libffi structures with arrays expanded element by element, which is how
//! libffi expects fixed arrays inside aggregates to be described.

use crate::core::{AbiScalar, CKind, Record, TypeNode};
use crate::errors::{FfiError, Result};
use libffi::middle::Type;
use libffi::raw;

/// Calling convention tag stored in the low bits of a signature's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CallingConvention {
    /// Platform default
    #[default]
    Default,
    Cdecl,
    Fastcall,
    Stdcall,
    Thiscall,
}

impl CallingConvention {
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Unknown tags read as the default convention
    pub const fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::Cdecl,
            2 => Self::Fastcall,
            3 => Self::Stdcall,
            4 => Self::Thiscall,
            _ => Self::Default,
        }
    }

    /// libffi ABI selector. The non-default conventions only differ on
    /// 32-bit x86 Windows; everywhere else they collapse to the default.
    #[cfg(all(target_arch = "x86", windows))]
    pub(crate) fn ffi_abi(self) -> raw::ffi_abi {
        match self {
            Self::Default => raw::ffi_abi_FFI_DEFAULT_ABI,
            Self::Cdecl => raw::ffi_abi_FFI_MS_CDECL,
            Self::Fastcall => raw::ffi_abi_FFI_FASTCALL,
            Self::Stdcall => raw::ffi_abi_FFI_STDCALL,
            Self::Thiscall => raw::ffi_abi_FFI_THISCALL,
        }
    }

    #[cfg(not(all(target_arch = "x86", windows)))]
    pub(crate) fn ffi_abi(self) -> raw::ffi_abi {
        raw::ffi_abi_FFI_DEFAULT_ABI
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Cdecl => "cdecl",
            Self::Fastcall => "fastcall",
            Self::Stdcall => "stdcall",
            Self::Thiscall => "thiscall",
        }
    }
}

/// libffi descriptor for one native scalar
pub(crate) fn scalar_type(scalar: AbiScalar) -> Type {
    match scalar {
        AbiScalar::Void => Type::void(),
        AbiScalar::U8 => Type::u8(),
        AbiScalar::S8 => Type::i8(),
        AbiScalar::U16 => Type::u16(),
        AbiScalar::S16 => Type::i16(),
        AbiScalar::U32 => Type::u32(),
        AbiScalar::S32 => Type::i32(),
        AbiScalar::U64 => Type::u64(),
        AbiScalar::S64 => Type::i64(),
        AbiScalar::F32 => Type::f32(),
        AbiScalar::F64 => Type::f64(),
        AbiScalar::LongDouble => Type::longdouble(),
        AbiScalar::Pointer => Type::pointer(),
    }
}

/// Descriptor for a value passed as an argument. Arrays decay and output
/// parameters travel as pointers.
pub(crate) fn param_type(ty: &TypeNode) -> Result<Type> {
    if ty.is_ref() || ty.kind() == CKind::Array {
        return Ok(Type::pointer());
    }
    match ty.kind() {
        CKind::Void => Err(FfiError::unsupported_in(ty, "parameter")),
        CKind::Record => record_type_of(ty),
        _ => value_type(ty),
    }
}

/// Descriptor for a function result
pub(crate) fn result_type(ty: &TypeNode) -> Result<Type> {
    if ty.is_ref() {
        return Ok(Type::pointer());
    }
    match ty.kind() {
        CKind::Void => Ok(Type::void()),
        CKind::Array => Err(FfiError::unsupported_in(ty, "function result")),
        CKind::Record => record_type_of(ty),
        _ => value_type(ty),
    }
}

fn value_type(ty: &TypeNode) -> Result<Type> {
    ty.abi_scalar()
        .map(scalar_type)
        .ok_or_else(|| FfiError::unsupported(ty))
}

fn record_type_of(ty: &TypeNode) -> Result<Type> {
    let record = ty.record().ok_or_else(|| FfiError::incomplete(ty))?;
    record_type(&record)
}

/// Only complete structs travel by value; unions and flexible records have
/// no libffi representation.
pub(crate) fn record_type(record: &Record) -> Result<Type> {
    if record.is_opaque() {
        return Err(FfiError::incomplete(record.display_name()));
    }
    if record.is_union() {
        return Err(FfiError::unsupported_in(record.display_name(), "passed by value"));
    }
    let mut elements = Vec::with_capacity(record.fields().len());
    for field in record.fields() {
        push_member(&field.ty, &mut elements)?;
    }
    if elements.is_empty() {
        return Err(FfiError::unsupported_in(record.display_name(), "no sized members"));
    }
    Ok(Type::structure(elements))
}

fn push_member(ty: &TypeNode, out: &mut Vec<Type>) -> Result<()> {
    match ty.kind() {
        CKind::Array if ty.is_unbounded() || ty.is_vla() => {
            Err(FfiError::unsupported_in(ty, "passed by value"))
        }
        CKind::Array => {
            let elem = ty.pointee().ok_or_else(|| FfiError::incomplete(ty))?;
            for _ in 0..ty.array_len() {
                push_member(elem, out)?;
            }
            Ok(())
        }
        CKind::Record => {
            out.push(record_type_of(ty)?);
            Ok(())
        }
        _ => {
            out.push(value_type(ty)?);
            Ok(())
        }
    }
}

/// Host-side type for an extra variadic argument after C default argument
/// promotions
pub(crate) fn promote_variadic(ty: &TypeNode) -> TypeNode {
    match ty.kind() {
        CKind::Float => TypeNode::builtin(CKind::Double),
        CKind::Bool | CKind::Char | CKind::SChar | CKind::UChar | CKind::Short | CKind::Enum => {
            TypeNode::builtin(CKind::Int)
        }
        CKind::UShort => {
            let host = crate::core::DataModel::host();
            if host.short.size < host.int.size {
                TypeNode::builtin(CKind::Int)
            } else {
                TypeNode::builtin(CKind::UInt)
            }
        }
        CKind::Array => match ty.pointee() {
            Some(elem) => TypeNode::pointer_to(elem.clone()),
            None => TypeNode::pointer_to(TypeNode::void()),
        },
        CKind::Function => TypeNode::pointer_to(ty.clone()),
        _ => ty.unref(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Field, FunctionSig};

    #[test]
    fn test_callconv_bits_round_trip() {
        for conv in [
            CallingConvention::Default,
            CallingConvention::Cdecl,
            CallingConvention::Fastcall,
            CallingConvention::Stdcall,
            CallingConvention::Thiscall,
        ] {
            assert_eq!(CallingConvention::from_bits(conv.bits()), conv);
        }
        assert_eq!(CallingConvention::from_bits(0xE), CallingConvention::Default);
    }

    #[test]
    fn test_param_decay() {
        let arr = TypeNode::array_of(TypeNode::builtin(CKind::Int), 4);
        assert!(param_type(&arr).is_ok());
        assert!(result_type(&arr).is_err());
        assert!(param_type(&TypeNode::void()).is_err());
        assert!(result_type(&TypeNode::void()).is_ok());
    }

    #[test]
    fn test_union_has_no_descriptor() {
        let u = Record::with_fields("u", true, vec![Field::new("i", TypeNode::builtin(CKind::Int))]).unwrap();
        assert!(record_type(&u).is_err());
        let s = Record::with_fields(
            "s",
            false,
            vec![Field::new("a", TypeNode::array_of(TypeNode::builtin(CKind::Char), 3))],
        )
        .unwrap();
        assert!(record_type(&s).is_ok());
    }

    #[test]
    fn test_variadic_promotions() {
        let f = promote_variadic(&TypeNode::builtin(CKind::Float));
        assert_eq!(f.kind(), CKind::Double);
        let c = promote_variadic(&TypeNode::builtin(CKind::UChar));
        assert_eq!(c.kind(), CKind::Int);
        let fun = TypeNode::function(FunctionSig::of(TypeNode::void(), []));
        assert!(promote_variadic(&fun).is_pointer());
        let ll = promote_variadic(&TypeNode::builtin(CKind::LongLong));
        assert_eq!(ll.kind(), CKind::LongLong);
    }
}
