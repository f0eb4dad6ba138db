//! Host value <-> native bytes conversion
//!
//! Four rules drive every conversion:
//! - `Conv`: implicit assignment, numeric narrowing only when the value fits
//! - `Pass`: argument passing, arrays decay and strings become `char *`
//! - `Cast`: explicit reinterpretation, integers wrap like C
//! - `Ret`: native results and callback return values
//!
//! Values that cannot be represented exactly as a host primitive are boxed,
//! never truncated.

use super::call::CallFrame;
use super::closure;
use super::extended::LongDoubleFormat;
use crate::core::{AbiScalar, CKind, TypeFlags, TypeNode};
use crate::errors::{FfiError, Result};
use crate::runtime::cdata::{Anchor, NativeBuffer, ValueBox};
use crate::runtime::HostValue;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvRule {
    Conv,
    Pass,
    Cast,
    Ret,
}

/// Integer precision of the host's primitive numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNumerics {
    #[serde(default = "default_integer_bits")]
    pub integer_bits: u32,
}

fn default_integer_bits() -> u32 {
    64
}

impl Default for HostNumerics {
    fn default() -> Self {
        Self {
            integer_bits: default_integer_bits(),
        }
    }
}

impl HostNumerics {
    pub fn new(integer_bits: u32) -> Self {
        Self { integer_bits }
    }

    /// Signed width `w` fits iff `w <= bits`, unsigned iff `w < bits`
    pub fn fits(&self, scalar: AbiScalar) -> bool {
        match scalar.int_bits() {
            Some(w) if scalar.is_unsigned() => w < self.integer_bits,
            Some(w) => w <= self.integer_bits,
            None => true,
        }
    }
}

/// Settings plus the slot where callback errors wait for the enclosing call
#[derive(Debug, Clone, Default)]
pub struct MarshalContext {
    pub numerics: HostNumerics,
    pub symbolic_enums: bool,
    pending: Rc<RefCell<Option<FfiError>>>,
}

impl MarshalContext {
    pub fn new(numerics: HostNumerics, symbolic_enums: bool) -> Self {
        Self {
            numerics,
            symbolic_enums,
            pending: Rc::default(),
        }
    }

    /// Keep the first error raised while native code is on the stack
    pub(crate) fn park_error(&self, err: FfiError) {
        let mut slot = self.pending.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take_pending(&self) -> Option<FfiError> {
        self.pending.borrow_mut().take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.borrow().is_some()
    }
}

/// Numeric value in transit; `i128` covers both 64-bit signednesses
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Num {
    Int(i128),
    Float(f64),
}

/// # Safety
/// `src` must be readable for the scalar's size
pub(crate) unsafe fn read_num(scalar: AbiScalar, src: *const u8) -> Option<Num> {
    Some(match scalar {
        AbiScalar::U8 => Num::Int(ptr::read_unaligned(src) as i128),
        AbiScalar::S8 => Num::Int(ptr::read_unaligned(src as *const i8) as i128),
        AbiScalar::U16 => Num::Int(ptr::read_unaligned(src as *const u16) as i128),
        AbiScalar::S16 => Num::Int(ptr::read_unaligned(src as *const i16) as i128),
        AbiScalar::U32 => Num::Int(ptr::read_unaligned(src as *const u32) as i128),
        AbiScalar::S32 => Num::Int(ptr::read_unaligned(src as *const i32) as i128),
        AbiScalar::U64 => Num::Int(ptr::read_unaligned(src as *const u64) as i128),
        AbiScalar::S64 => Num::Int(ptr::read_unaligned(src as *const i64) as i128),
        AbiScalar::F32 => Num::Float(ptr::read_unaligned(src as *const f32) as f64),
        AbiScalar::F64 => Num::Float(ptr::read_unaligned(src as *const f64)),
        AbiScalar::Pointer => Num::Int(ptr::read_unaligned(src as *const usize) as i128),
        AbiScalar::LongDouble => Num::Float(read_long_double(src).0),
        AbiScalar::Void => return None,
    })
}

/// # Safety
/// `src` must hold a host `long double`
unsafe fn read_long_double(src: *const u8) -> (f64, bool) {
    let format = LongDoubleFormat::host();
    format.decode(std::slice::from_raw_parts(src, format.width()))
}

/// Truncating integer store
///
/// # Safety
/// `dst` must be writable for the scalar's size
pub(crate) unsafe fn write_int(scalar: AbiScalar, dst: *mut u8, v: i128) {
    match scalar {
        AbiScalar::U8 | AbiScalar::S8 => ptr::write_unaligned(dst, v as u8),
        AbiScalar::U16 | AbiScalar::S16 => ptr::write_unaligned(dst as *mut u16, v as u16),
        AbiScalar::U32 | AbiScalar::S32 => ptr::write_unaligned(dst as *mut u32, v as u32),
        AbiScalar::U64 | AbiScalar::S64 => ptr::write_unaligned(dst as *mut u64, v as u64),
        AbiScalar::Pointer => ptr::write_unaligned(dst as *mut usize, v as usize),
        _ => {}
    }
}

fn integer_for(n: Num, scalar: AbiScalar, rule: ConvRule, ty: &TypeNode) -> Result<i128> {
    let bits = scalar.int_bits().unwrap_or(usize::BITS);
    // negative values are accepted for unsigned targets of the same width
    let min = -(1i128 << (bits - 1));
    let max = if scalar.is_unsigned() {
        (1i128 << bits) - 1
    } else {
        (1i128 << (bits - 1)) - 1
    };
    let v = match n {
        Num::Int(v) => v,
        Num::Float(f) if rule == ConvRule::Cast => {
            return Ok(if f.is_finite() { f as i128 } else { 0 });
        }
        Num::Float(f) => {
            if f.fract() != 0.0 {
                return Err(FfiError::range(f, ty));
            }
            f.to_i128().ok_or_else(|| FfiError::range(f, ty))?
        }
    };
    if rule == ConvRule::Cast || (min..=max).contains(&v) {
        Ok(v)
    } else {
        Err(FfiError::range(v, ty))
    }
}

fn scalar_of(ty: &TypeNode) -> Result<AbiScalar> {
    ty.abi_scalar().ok_or_else(|| FfiError::unsupported(ty))
}

fn owned_copy(ty: &TypeNode, src: *const u8) -> Result<HostValue> {
    let size = ty.alloc_size()?;
    let b = ValueBox::owned(ty.clone(), size)?;
    // SAFETY: `src` holds a value of `ty`, the box is `size` bytes
    unsafe { ptr::copy_nonoverlapping(src, b.as_ptr(), size) };
    Ok(HostValue::Cdata(Rc::new(b)))
}

/// Box for a callable type, holding the code pointer found at `src`
fn callable_from(ty: &TypeNode, src: *const u8) -> HostValue {
    // SAFETY: callable values are stored as one code pointer
    let sym = unsafe { ptr::read_unaligned(src as *const *const c_void) };
    HostValue::Cdata(Rc::new(ValueBox::callable(ty.clone(), CallFrame::new(sym))))
}

/// Native bytes at `src` to a host value.
///
/// `owner` is the box `src` points into; under `Conv` aggregates become
/// views that keep it alive. `lossy` lets integers that are too wide for a
/// host integer surface as numbers instead of boxes.
pub fn to_host(
    ctx: &MarshalContext,
    ty: &TypeNode,
    src: *const u8,
    rule: ConvRule,
    lossy: bool,
    owner: Option<&Rc<ValueBox>>,
) -> Result<HostValue> {
    if ty.flags().contains(TypeFlags::REF) {
        // the slot holds the address of the value
        // SAFETY: reference slots are pointer-sized
        let target = unsafe { ptr::read_unaligned(src as *const *mut u8) };
        let inner = ty.unref();
        let len = inner.alloc_size().unwrap_or(0);
        return Ok(HostValue::Cdata(Rc::new(ValueBox::borrowed(inner, target, len, None))));
    }

    match ty.kind() {
        CKind::Void => Ok(HostValue::Nil),
        // SAFETY (all reads below): `src` holds a value of `ty`
        CKind::Bool => Ok(HostValue::Boolean(unsafe { *src } != 0)),
        CKind::Char if rule == ConvRule::Conv => Ok(HostValue::string([unsafe { *src }])),
        kind if kind.is_integer() => {
            let scalar = scalar_of(ty)?;
            let v = match unsafe { read_num(scalar, src) } {
                Some(Num::Int(v)) => v,
                _ => return Err(FfiError::unsupported(ty)),
            };
            if kind == CKind::Enum && ctx.symbolic_enums {
                if let Some(name) = ty.enum_type().and_then(|e| e.name_of(v as i64).map(str::to_string)) {
                    return Ok(HostValue::string(name));
                }
            }
            if ctx.numerics.fits(scalar) {
                Ok(HostValue::Integer(v as i64))
            } else if lossy {
                Ok(HostValue::Number(v as f64))
            } else {
                owned_copy(ty, src)
            }
        }
        kind if kind.is_float() => match scalar_of(ty)? {
            // wider than a host number: box unless the value fits exactly
            AbiScalar::LongDouble => match unsafe { read_long_double(src) } {
                (f, true) => Ok(HostValue::Number(f)),
                (f, false) if lossy => Ok(HostValue::Number(f)),
                _ => owned_copy(ty, src),
            },
            scalar => match unsafe { read_num(scalar, src) } {
                Some(Num::Float(f)) => Ok(HostValue::Number(f)),
                _ => owned_copy(ty, src),
            },
        },
        _ if ty.is_callable() => Ok(callable_from(ty, src)),
        CKind::Pointer | CKind::VaList => owned_copy(ty, src),
        CKind::Record | CKind::Array => {
            if rule == ConvRule::Conv {
                let len = ty.alloc_size()?;
                Ok(HostValue::Cdata(Rc::new(ValueBox::borrowed(
                    ty.clone(),
                    src as *mut u8,
                    len,
                    owner.cloned(),
                ))))
            } else {
                owned_copy(ty, src)
            }
        }
        _ => Err(FfiError::unsupported(ty)),
    }
}

/// Store a host value as native bytes of `ty` at `dst`.
///
/// Anything the written bytes point into (string copies, temporaries,
/// trampolines created on the fly) is pushed to `anchors`; the caller
/// keeps it alive for as long as the bytes are in use.
pub(crate) fn to_native(
    ctx: &MarshalContext,
    ty: &TypeNode,
    value: &HostValue,
    dst: *mut u8,
    rule: ConvRule,
    anchors: &mut Vec<Anchor>,
) -> Result<()> {
    if ty.is_ref() {
        return store_reference(ctx, ty, value, dst, rule, anchors);
    }
    match ty.kind() {
        CKind::Void if rule == ConvRule::Ret => Ok(()),
        CKind::Void => Err(FfiError::incomplete(ty)),
        CKind::Bool => {
            let b = match value {
                HostValue::Boolean(b) => *b,
                HostValue::Integer(i) => *i != 0,
                HostValue::Number(n) => *n != 0.0,
                HostValue::Cdata(b) if b.type_node().is_arith() => {
                    match unsafe { read_num(scalar_of(b.type_node())?, b.as_ptr()) } {
                        Some(Num::Int(v)) => v != 0,
                        Some(Num::Float(f)) => f != 0.0,
                        None => return Err(FfiError::mismatch(ty, value.type_name())),
                    }
                }
                _ => return Err(FfiError::mismatch(ty, value.type_name())),
            };
            unsafe { ptr::write_unaligned(dst, b as u8) };
            Ok(())
        }
        kind if kind.is_arith() => store_arith(ty, value, dst, rule),
        _ if ty.is_callable() => store_code_pointer(ctx, ty, value, dst, rule, anchors),
        CKind::Pointer | CKind::VaList => store_pointer(ty, value, dst, rule, anchors),
        CKind::Array => store_array(ty, value, dst, rule),
        CKind::Record => store_record(ty, value, dst, rule),
        _ => Err(FfiError::unsupported(ty)),
    }
}

fn numeric_of(ty: &TypeNode, value: &HostValue, rule: ConvRule) -> Result<Num> {
    match value {
        HostValue::Integer(i) => Ok(Num::Int(*i as i128)),
        HostValue::Number(n) => Ok(Num::Float(*n)),
        HostValue::Boolean(b) if rule == ConvRule::Cast => Ok(Num::Int(*b as i128)),
        HostValue::String(s) if ty.kind().is_char() && s.len() == 1 => Ok(if ty.is_unsigned() {
            Num::Int(s[0] as i128)
        } else {
            Num::Int(s[0] as i8 as i128)
        }),
        HostValue::String(s) if ty.kind() == CKind::Enum => {
            let name = String::from_utf8_lossy(s);
            ty.enum_type()
                .and_then(|e| e.value_of(&name))
                .map(|v| Num::Int(v as i128))
                .ok_or_else(|| FfiError::mismatch(ty, format!("string \"{}\"", name)))
        }
        HostValue::Cdata(b) => {
            let src = b.type_node();
            if src.is_arith() {
                // SAFETY: arithmetic boxes hold one scalar of their type
                unsafe { read_num(scalar_of(src)?, b.as_ptr()) }
                    .ok_or_else(|| FfiError::unsupported(src))
            } else if rule == ConvRule::Cast && ty.is_integer() && (src.is_ptr_like() || src.is_callable()) {
                Ok(Num::Int(b.address() as usize as i128))
            } else {
                Err(FfiError::mismatch(ty, value.type_name()))
            }
        }
        _ => Err(FfiError::mismatch(ty, value.type_name())),
    }
}

fn store_arith(ty: &TypeNode, value: &HostValue, dst: *mut u8, rule: ConvRule) -> Result<()> {
    let scalar = scalar_of(ty)?;
    let n = numeric_of(ty, value, rule)?;
    let as_float = |n: Num| match n {
        Num::Int(v) => v as f64,
        Num::Float(f) => f,
    };
    // SAFETY (writes): `dst` is sized for `ty`
    match scalar {
        AbiScalar::F32 => unsafe { ptr::write_unaligned(dst as *mut f32, as_float(n) as f32) },
        AbiScalar::F64 => unsafe { ptr::write_unaligned(dst as *mut f64, as_float(n)) },
        AbiScalar::LongDouble => {
            let format = LongDoubleFormat::host();
            // SAFETY: `dst` holds a host `long double`
            let out = unsafe { std::slice::from_raw_parts_mut(dst, format.width()) };
            format.encode(as_float(n), out);
        }
        AbiScalar::Void | AbiScalar::Pointer => return Err(FfiError::unsupported(ty)),
        _ => {
            let v = integer_for(n, scalar, rule, ty)?;
            unsafe { write_int(scalar, dst, v) };
        }
    }
    Ok(())
}

fn write_address(dst: *mut u8, addr: *const c_void) {
    // SAFETY: pointer slots are pointer-sized
    unsafe { ptr::write_unaligned(dst as *mut *const c_void, addr) }
}

/// Whether a pointer to `src` may be stored where a pointer to `target` goes
fn pointee_compatible(target: Option<&TypeNode>, src: Option<&TypeNode>, rule: ConvRule) -> bool {
    if rule == ConvRule::Cast {
        return true;
    }
    match (target, src) {
        (Some(t), Some(s)) => t.is_void() || s.is_void() || t.is_same(s, true, true),
        _ => false,
    }
}

fn store_pointer(
    ty: &TypeNode,
    value: &HostValue,
    dst: *mut u8,
    rule: ConvRule,
    anchors: &mut Vec<Anchor>,
) -> Result<()> {
    let mismatch = || FfiError::mismatch(ty, value.type_name());
    let addr: *const c_void = match value {
        HostValue::Nil => ptr::null(),
        HostValue::Integer(i) if rule == ConvRule::Cast => *i as usize as *const c_void,
        HostValue::String(s) if rule != ConvRule::Ret && accepts_string(ty) => {
            let mut bytes = Vec::with_capacity(s.len() + 1);
            bytes.extend_from_slice(s);
            bytes.push(0);
            let bytes = bytes.into_boxed_slice();
            let addr = bytes.as_ptr() as *const c_void;
            anchors.push(Anchor::Bytes(bytes));
            addr
        }
        HostValue::Cdata(b) => {
            let src = b.type_node();
            let target = ty.pointee();
            match src.kind() {
                _ if b.is_callable() => {
                    if rule != ConvRule::Cast && !target.map_or(false, TypeNode::is_void) {
                        return Err(mismatch());
                    }
                    b.live_code()?
                }
                CKind::Pointer | CKind::VaList => {
                    if !pointee_compatible(target, src.pointee(), rule) {
                        return Err(mismatch());
                    }
                    b.address()
                }
                CKind::Array => {
                    if !pointee_compatible(target, src.pointee(), rule) {
                        return Err(mismatch());
                    }
                    anchors.push(Anchor::Value(b.clone()));
                    b.as_ptr() as *mut c_void
                }
                CKind::Record => {
                    if !pointee_compatible(target, Some(src), rule) {
                        return Err(mismatch());
                    }
                    anchors.push(Anchor::Value(b.clone()));
                    b.as_ptr() as *mut c_void
                }
                kind if kind.is_integer() && rule == ConvRule::Cast => {
                    match numeric_of(&TypeNode::builtin(CKind::ULongLong), value, rule)? {
                        Num::Int(v) => v as usize as *const c_void as *mut c_void,
                        Num::Float(_) => return Err(mismatch()),
                    }
                }
                _ => return Err(mismatch()),
            }
        }
        _ => return Err(mismatch()),
    };
    write_address(dst, addr);
    Ok(())
}

fn accepts_string(ty: &TypeNode) -> bool {
    ty.pointee()
        .map_or(false, |p| p.kind().is_char() || p.is_void())
}

fn store_code_pointer(
    ctx: &MarshalContext,
    ty: &TypeNode,
    value: &HostValue,
    dst: *mut u8,
    rule: ConvRule,
    anchors: &mut Vec<Anchor>,
) -> Result<()> {
    let mismatch = || FfiError::mismatch(ty, value.type_name());
    let addr: *const c_void = match value {
        HostValue::Nil => ptr::null(),
        HostValue::Integer(i) if rule == ConvRule::Cast => *i as usize as *const c_void,
        // a trampoline created here lives as long as whoever keeps the anchors
        HostValue::Function(f) if rule != ConvRule::Ret => {
            let cb = closure::bind_callback(ctx, ty, f.clone())?;
            let code = cb.code_ptr().unwrap_or(ptr::null());
            anchors.push(Anchor::Value(cb));
            code
        }
        HostValue::Cdata(b) if b.is_callable() => {
            let same = match (ty.function_sig(), b.type_node().function_sig()) {
                (Some(a), Some(s)) => a.is_same(s),
                _ => false,
            };
            if !same && rule != ConvRule::Cast {
                return Err(mismatch());
            }
            b.live_code()?
        }
        HostValue::Cdata(b) if b.type_node().is_ptr_like() => {
            let void_src = b.type_node().pointee().map_or(false, TypeNode::is_void);
            if rule != ConvRule::Cast && !void_src {
                return Err(mismatch());
            }
            b.address()
        }
        _ => return Err(mismatch()),
    };
    write_address(dst, addr);
    Ok(())
}

fn store_array(ty: &TypeNode, value: &HostValue, dst: *mut u8, rule: ConvRule) -> Result<()> {
    let size = ty.alloc_size()?;
    let elem = ty.pointee().ok_or_else(|| FfiError::incomplete(ty))?;
    match value {
        HostValue::String(s) if elem.kind().is_char() => {
            let n = s.len().min(size);
            // SAFETY: `dst` holds `size` bytes
            unsafe {
                ptr::copy_nonoverlapping(s.as_ptr(), dst, n);
                if n < size {
                    *dst.add(n) = 0;
                }
            }
            Ok(())
        }
        HostValue::Cdata(b)
            if b.type_node().is_array()
                && b.len() >= size
                && (rule == ConvRule::Cast
                    || b.type_node().pointee().map_or(false, |e| e.is_same(elem, true, true))) =>
        {
            // SAFETY: both sides hold at least `size` bytes
            unsafe { ptr::copy(b.as_ptr(), dst, size) };
            Ok(())
        }
        _ => Err(FfiError::mismatch(ty, value.type_name())),
    }
}

fn store_record(ty: &TypeNode, value: &HostValue, dst: *mut u8, rule: ConvRule) -> Result<()> {
    let size = ty.alloc_size()?;
    match value {
        HostValue::Cdata(b)
            if b.len() >= size
                && (b.type_node().is_same(ty, true, true) || rule == ConvRule::Cast) =>
        {
            // SAFETY: both sides hold at least `size` bytes
            unsafe { ptr::copy(b.as_ptr(), dst, size) };
            Ok(())
        }
        _ => Err(FfiError::mismatch(ty, value.type_name())),
    }
}

/// Output parameters: the slot receives an address. A box
/// of the referenced type is passed in place; anything else is converted
/// into a temporary that lives in `anchors`.
fn store_reference(
    ctx: &MarshalContext,
    ty: &TypeNode,
    value: &HostValue,
    dst: *mut u8,
    rule: ConvRule,
    anchors: &mut Vec<Anchor>,
) -> Result<()> {
    let referent = ty.unref();
    if let HostValue::Cdata(b) = value {
        let src = b.type_node();
        if src.is_same(&referent, true, true) {
            anchors.push(Anchor::Value(b.clone()));
            write_address(dst, b.as_ptr() as *const c_void);
            return Ok(());
        }
        if src.is_pointer() && src.pointee().map_or(false, |p| p.is_same(&referent, true, true)) {
            write_address(dst, b.address());
            return Ok(());
        }
    }
    let size = referent.alloc_size()?;
    let temp = NativeBuffer::zeroed(size, referent.alignment()?)?;
    to_native(ctx, &referent, value, temp.as_ptr(), rule, anchors)?;
    write_address(dst, temp.as_ptr() as *const c_void);
    anchors.push(Anchor::Buffer(temp));
    Ok(())
}

/// Integral results narrower than a register come back widened to a full
/// `ffi_arg`, and callbacks must hand them back the same way.
pub(crate) fn widened_return(ty: &TypeNode) -> Option<AbiScalar> {
    if ty.is_ref() || !ty.is_integer() {
        return None;
    }
    let scalar = ty.abi_scalar()?;
    match scalar.int_bits() {
        Some(bits) if (bits as usize) < usize::BITS as usize => Some(scalar),
        _ => None,
    }
}

/// # Safety
/// `ret` must hold a result of `ty` as written by `ffi_call`
pub(crate) unsafe fn read_return(
    ctx: &MarshalContext,
    ty: &TypeNode,
    ret: *const u8,
    lossy: bool,
) -> Result<HostValue> {
    if let Some(scalar) = widened_return(ty) {
        let word = ptr::read(ret as *const usize);
        let mut narrow = [0u8; 8];
        write_int(scalar, narrow.as_mut_ptr(), word as i128);
        return to_host(ctx, ty, narrow.as_ptr(), ConvRule::Ret, lossy, None);
    }
    to_host(ctx, ty, ret, ConvRule::Ret, lossy, None)
}

/// # Safety
/// `ret` must be the result buffer libffi handed to a closure
pub(crate) unsafe fn write_return(
    ctx: &MarshalContext,
    ty: &TypeNode,
    value: &HostValue,
    ret: *mut u8,
    anchors: &mut Vec<Anchor>,
) -> Result<()> {
    if let Some(scalar) = widened_return(ty) {
        let mut narrow = [0u8; 8];
        to_native(ctx, ty, value, narrow.as_mut_ptr(), ConvRule::Ret, anchors)?;
        let v = match read_num(scalar, narrow.as_ptr()) {
            Some(Num::Int(v)) => v,
            _ => 0,
        };
        ptr::write(ret as *mut usize, v as usize);
        return Ok(());
    }
    to_native(ctx, ty, value, ret, ConvRule::Ret, anchors)
}
