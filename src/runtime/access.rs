//! Native memory access on value boxes
//!
//! Field and element reads go through the `Conv` rule, so nested records
//! and arrays come back as views that keep the parent box alive. Writes
//! anchor whatever the stored bytes point into on the box being written,
//! replacing what the same slot held before.

use crate::core::{CKind, TypeNode};
use crate::errors::{FfiError, Result};
use crate::interop::marshal::{self, ConvRule, MarshalContext};
use crate::runtime::cdata::{Anchor, ValueBox};
use crate::runtime::HostValue;
use std::ffi::CStr;
use std::ptr;
use std::rc::Rc;

/// Memory a field or element access resolves against
struct Place {
    ty: TypeNode,
    ptr: *mut u8,
    /// Bytes available, unknown behind a raw pointer
    len: Option<usize>,
    owner: Option<Rc<ValueBox>>,
}

impl Place {
    fn check(&self, offset: usize, size: usize) -> Result<()> {
        match self.len {
            Some(len) if offset.checked_add(size).map_or(true, |end| end > len) => {
                Err(FfiError::range(offset, &self.ty))
            }
            _ => Ok(()),
        }
    }
}

fn null_deref(ty: &TypeNode) -> FfiError {
    FfiError::mismatch(format!("non-NULL {}", ty), "NULL")
}

/// A record box, or a pointer to a record
fn record_place(value: &Rc<ValueBox>) -> Result<Place> {
    let ty = value.type_node();
    match ty.kind() {
        CKind::Record => Ok(Place {
            ty: ty.unref(),
            ptr: value.as_ptr(),
            len: Some(value.len()),
            owner: Some(value.clone()),
        }),
        CKind::Pointer if ty.pointee().map_or(false, TypeNode::is_record) => {
            let addr = value.address() as *mut u8;
            if addr.is_null() {
                return Err(null_deref(ty));
            }
            Ok(Place {
                ty: ty.pointee().cloned().ok_or_else(|| FfiError::incomplete(ty))?,
                ptr: addr,
                len: None,
                owner: None,
            })
        }
        _ => Err(FfiError::mismatch("struct or union", format!("cdata<{}>", ty))),
    }
}

fn field_of(record_ty: &TypeNode, name: &str) -> Result<(usize, TypeNode)> {
    let record = record_ty
        .record()
        .ok_or_else(|| FfiError::incomplete(record_ty))?;
    if record.is_opaque() {
        return Err(FfiError::incomplete(record_ty));
    }
    record
        .field_offset(name)
        .ok_or_else(|| FfiError::unknown(format!("{}.{}", record.display_name(), name)))
}

/// Read a struct or union member
pub fn get_field(ctx: &MarshalContext, value: &Rc<ValueBox>, name: &str) -> Result<HostValue> {
    let place = record_place(value)?;
    let (offset, fty) = field_of(&place.ty, name)?;
    // SAFETY: the offset comes from the record's own layout
    let at = unsafe { place.ptr.add(offset) };
    if fty.is_unbounded() || fty.is_vla() {
        // flexible member: whatever the allocation holds past its offset
        let len = place.len.map_or(0, |l| l.saturating_sub(offset));
        return Ok(HostValue::Cdata(Rc::new(ValueBox::borrowed(fty, at, len, place.owner))));
    }
    place.check(offset, fty.alloc_size()?)?;
    marshal::to_host(ctx, &fty, at, ConvRule::Conv, false, place.owner.as_ref())
}

/// Write a struct or union member
pub fn set_field(
    ctx: &MarshalContext,
    value: &Rc<ValueBox>,
    name: &str,
    new: &HostValue,
) -> Result<()> {
    let place = record_place(value)?;
    let (offset, fty) = field_of(&place.ty, name)?;
    if place.ty.is_const() || fty.is_const() {
        return Err(FfiError::unsupported_in(&fty, "assignment to const member"));
    }
    place.check(offset, fty.alloc_size()?)?;
    let mut anchors = Vec::new();
    // SAFETY: the offset comes from the record's own layout
    let at = unsafe { place.ptr.add(offset) };
    marshal::to_native(ctx, &fty, new, at, ConvRule::Conv, &mut anchors)?;
    value.anchor_slot(at, anchors);
    Ok(())
}

/// Element `index` of an array or pointer box
fn element_place(value: &Rc<ValueBox>, index: i64) -> Result<(TypeNode, *mut u8, Option<Rc<ValueBox>>)> {
    let ty = value.type_node();
    let elem = match ty.kind() {
        CKind::Array | CKind::Pointer => ty.pointee().cloned(),
        _ => None,
    }
    .ok_or_else(|| FfiError::mismatch("array or pointer", format!("cdata<{}>", ty)))?;
    let esize = elem.alloc_size()?;

    if ty.is_array() {
        let count = if ty.is_unbounded() || ty.is_vla() {
            if esize == 0 {
                0
            } else {
                value.len() / esize
            }
        } else {
            ty.array_len()
        };
        if index < 0 || index as usize >= count {
            return Err(FfiError::range(index, ty));
        }
        // SAFETY: bounds checked against the element count
        let at = unsafe { value.as_ptr().add(index as usize * esize) };
        return Ok((elem, at, Some(value.clone())));
    }

    let base = value.address() as *mut u8;
    if base.is_null() {
        return Err(null_deref(ty));
    }
    // pointer arithmetic is unchecked, as in C, short of overflowing
    let delta = isize::try_from(index)
        .ok()
        .zip(isize::try_from(esize).ok())
        .and_then(|(i, e)| i.checked_mul(e))
        .ok_or_else(|| FfiError::range(index, ty))?;
    let at = base.wrapping_offset(delta);
    Ok((elem, at, None))
}

pub fn get_index(ctx: &MarshalContext, value: &Rc<ValueBox>, index: i64) -> Result<HostValue> {
    let (elem, at, owner) = element_place(value, index)?;
    marshal::to_host(ctx, &elem, at, ConvRule::Conv, false, owner.as_ref())
}

pub fn set_index(
    ctx: &MarshalContext,
    value: &Rc<ValueBox>,
    index: i64,
    new: &HostValue,
) -> Result<()> {
    let (elem, at, _) = element_place(value, index)?;
    if elem.is_const() {
        return Err(FfiError::unsupported_in(&elem, "assignment to const element"));
    }
    let mut anchors = Vec::new();
    marshal::to_native(ctx, &elem, new, at, ConvRule::Conv, &mut anchors)?;
    value.anchor_slot(at, anchors);
    Ok(())
}

/// `*p`
pub fn deref(ctx: &MarshalContext, value: &Rc<ValueBox>) -> Result<HostValue> {
    match value.type_node().kind() {
        CKind::Pointer => get_index(ctx, value, 0),
        _ => Err(FfiError::mismatch("pointer", value.type_node().to_string())),
    }
}

/// Bytes of a C string, or exactly `len` bytes when given
pub fn read_string(value: &HostValue, len: Option<usize>) -> Result<HostValue> {
    let b = match value {
        HostValue::Cdata(b) => b,
        HostValue::String(_) => return Ok(value.clone()),
        _ => return Err(FfiError::mismatch("char *", value.type_name())),
    };
    let ty = b.type_node();
    let (base, limit) = match ty.kind() {
        CKind::Array => (b.as_ptr() as *const u8, Some(b.len())),
        CKind::Pointer => (b.address() as *const u8, None),
        _ => return Err(FfiError::mismatch("char *", format!("cdata<{}>", ty))),
    };
    if base.is_null() {
        return Err(null_deref(ty));
    }

    let bytes = match (len, limit) {
        (Some(n), Some(max)) if n > max => return Err(FfiError::range(n, ty)),
        // SAFETY: `n` bytes are readable, checked above for arrays and the
        // caller's promise for raw pointers
        (Some(n), _) => unsafe { std::slice::from_raw_parts(base, n) }.to_vec(),
        (None, Some(max)) => {
            // SAFETY: array storage holds `max` bytes
            let all = unsafe { std::slice::from_raw_parts(base, max) };
            let end = all.iter().position(|&c| c == 0).unwrap_or(max);
            all[..end].to_vec()
        }
        // SAFETY: the pointer denotes a NUL-terminated string
        (None, None) => unsafe { CStr::from_ptr(base as *const _) }.to_bytes().to_vec(),
    };
    Ok(HostValue::string(bytes))
}

fn too_many(count: usize, ty: &TypeNode) -> FfiError {
    FfiError::range(format!("{} initializers", count), ty)
}

/// Fill a freshly allocated box from positional initializers
pub(crate) fn initialize(ctx: &MarshalContext, value: &ValueBox, init: &[HostValue]) -> Result<()> {
    if init.is_empty() {
        return Ok(());
    }
    let mut anchors = Vec::new();
    init_at(ctx, value.type_node(), value.as_ptr(), value.len(), init, &mut anchors)?;
    value.anchor_all(anchors);
    Ok(())
}

fn init_at(
    ctx: &MarshalContext,
    ty: &TypeNode,
    dst: *mut u8,
    avail: usize,
    init: &[HostValue],
    anchors: &mut Vec<Anchor>,
) -> Result<()> {
    match ty.kind() {
        CKind::Array => init_array(ctx, ty, dst, avail, init, anchors),
        CKind::Record if !is_whole_record(ty, init) => init_record(ctx, ty, dst, avail, init, anchors),
        _ => match init {
            [] => Ok(()),
            [single] => marshal::to_native(ctx, ty, single, dst, ConvRule::Conv, anchors),
            _ => Err(too_many(init.len(), ty)),
        },
    }
}

fn is_whole_record(ty: &TypeNode, init: &[HostValue]) -> bool {
    matches!(init, [HostValue::Cdata(b)] if b.type_node().is_same(ty, true, true))
}

fn init_array(
    ctx: &MarshalContext,
    ty: &TypeNode,
    dst: *mut u8,
    avail: usize,
    init: &[HostValue],
    anchors: &mut Vec<Anchor>,
) -> Result<()> {
    let elem = ty.pointee().ok_or_else(|| FfiError::incomplete(ty))?;
    let esize = elem.alloc_size()?;
    let count = match (ty.is_unbounded() || ty.is_vla(), esize) {
        (_, 0) => 0,
        (true, _) => avail / esize,
        (false, _) => ty.array_len(),
    };
    let total = count * esize;

    if let [single] = init {
        match single {
            HostValue::String(s) if elem.kind().is_char() => {
                let n = s.len().min(total);
                // SAFETY: `dst` holds `total` bytes
                unsafe {
                    ptr::copy_nonoverlapping(s.as_ptr(), dst, n);
                    if n < total {
                        *dst.add(n) = 0;
                    }
                }
                return Ok(());
            }
            HostValue::Cdata(b) if b.type_node().is_array() => {
                let same = b
                    .type_node()
                    .pointee()
                    .map_or(false, |e| e.is_same(elem, true, true));
                if !same {
                    return Err(FfiError::mismatch(ty, single.type_name()));
                }
                // SAFETY: both sides hold at least `n` bytes
                unsafe { ptr::copy(b.as_ptr(), dst, b.len().min(total)) };
                return Ok(());
            }
            // one scalar fills every element
            _ => {
                for i in 0..count {
                    // SAFETY: i < count elements of `esize` bytes
                    init_at(ctx, elem, unsafe { dst.add(i * esize) }, esize, init, anchors)?;
                }
                return Ok(());
            }
        }
    }

    if init.len() > count {
        return Err(too_many(init.len(), ty));
    }
    for (i, v) in init.iter().enumerate() {
        // SAFETY: i < count elements of `esize` bytes
        let at = unsafe { dst.add(i * esize) };
        init_at(ctx, elem, at, esize, std::slice::from_ref(v), anchors)?;
    }
    Ok(())
}

fn init_record(
    ctx: &MarshalContext,
    ty: &TypeNode,
    dst: *mut u8,
    avail: usize,
    init: &[HostValue],
    anchors: &mut Vec<Anchor>,
) -> Result<()> {
    let record = ty.record().ok_or_else(|| FfiError::incomplete(ty))?;
    let layout = record.layout()?;
    // a union takes one initializer, for its first member
    let limit = if record.is_union() { 1 } else { record.fields().len() };
    if init.len() > limit {
        return Err(too_many(init.len(), ty));
    }
    for ((field, slot), v) in record.fields().iter().zip(&layout.fields).zip(init) {
        let room = if field.ty.is_unbounded() || field.ty.is_vla() {
            avail.saturating_sub(slot.offset)
        } else {
            slot.size
        };
        // SAFETY: offsets come from the record's layout
        let at = unsafe { dst.add(slot.offset) };
        init_at(ctx, &field.ty, at, room, std::slice::from_ref(v), anchors)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Field, Qualifiers, Record};
    use crate::errors::ErrorKind;

    fn int() -> TypeNode {
        TypeNode::builtin(CKind::Int)
    }

    fn point() -> (Rc<Record>, TypeNode) {
        let record = Rc::new(
            Record::with_fields(
                "point",
                false,
                vec![Field::new("x", int()), Field::new("y", int())],
            )
            .unwrap(),
        );
        let ty = TypeNode::of_record(&record);
        (record, ty)
    }

    fn boxed(ty: TypeNode, size: usize) -> Rc<ValueBox> {
        Rc::new(ValueBox::owned(ty, size).unwrap())
    }

    #[test]
    fn test_field_roundtrip() {
        let ctx = MarshalContext::default();
        let (_record, ty) = point();
        let p = boxed(ty, 8);
        set_field(&ctx, &p, "y", &HostValue::Integer(-4)).unwrap();
        assert_eq!(get_field(&ctx, &p, "y").unwrap(), HostValue::Integer(-4));
        assert_eq!(get_field(&ctx, &p, "x").unwrap(), HostValue::Integer(0));
        assert_eq!(p.read::<i32>(4), Some(-4));
    }

    #[test]
    fn test_unknown_field() {
        let ctx = MarshalContext::default();
        let (_record, ty) = point();
        let p = boxed(ty, 8);
        let err = get_field(&ctx, &p, "z").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnknownName { .. }));
    }

    #[test]
    fn test_field_through_pointer() {
        let ctx = MarshalContext::default();
        let (_record, ty) = point();
        let p = boxed(ty.clone(), 8);
        let ptr_box = boxed(TypeNode::pointer_to(ty), 8);
        ptr_box.write::<usize>(0, p.as_ptr() as usize);
        set_field(&ctx, &ptr_box, "x", &HostValue::Integer(11)).unwrap();
        assert_eq!(p.read::<i32>(0), Some(11));
    }

    #[test]
    fn test_const_field_rejected() {
        let ctx = MarshalContext::default();
        let record = Rc::new(
            Record::with_fields(
                "ro",
                false,
                vec![Field::new("v", int().with_cv(Qualifiers::CONST))],
            )
            .unwrap(),
        );
        let b = boxed(TypeNode::of_record(&record), 4);
        assert!(set_field(&ctx, &b, "v", &HostValue::Integer(1)).is_err());
    }

    #[test]
    fn test_array_bounds() {
        let ctx = MarshalContext::default();
        let arr = boxed(TypeNode::array_of(int(), 3), 12);
        set_index(&ctx, &arr, 2, &HostValue::Integer(9)).unwrap();
        assert_eq!(get_index(&ctx, &arr, 2).unwrap(), HostValue::Integer(9));
        let err = get_index(&ctx, &arr, 3).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConversionRange { .. }));
        assert!(get_index(&ctx, &arr, -1).is_err());
    }

    #[test]
    fn test_deref_null() {
        let ctx = MarshalContext::default();
        let p = boxed(TypeNode::pointer_to(int()), 8);
        assert!(deref(&ctx, &p).is_err());
    }

    #[test]
    fn test_flexible_member_view() {
        let ctx = MarshalContext::default();
        let record = Rc::new(
            Record::with_fields(
                "vec",
                false,
                vec![
                    Field::new("n", int()),
                    Field::new("data", TypeNode::unbounded_array_of(int())),
                ],
            )
            .unwrap(),
        );
        let size = record.layout().unwrap().size_with(3).unwrap();
        let b = boxed(TypeNode::of_record(&record), size);
        let data = get_field(&ctx, &b, "data").unwrap();
        let view = data.as_cdata().unwrap().clone();
        assert!(view.is_weak());
        assert_eq!(view.len(), 12);
        set_index(&ctx, &view, 2, &HostValue::Integer(5)).unwrap();
        assert!(set_index(&ctx, &view, 3, &HostValue::Integer(5)).is_err());
        assert_eq!(b.read::<i32>(12), Some(5));
    }

    #[test]
    fn test_initialize_aggregates() {
        let ctx = MarshalContext::default();
        let (_record, ty) = point();
        let p = boxed(ty, 8);
        initialize(&ctx, &p, &[HostValue::Integer(1), HostValue::Integer(2)]).unwrap();
        assert_eq!(p.read::<i32>(4), Some(2));
        let three = [HostValue::Integer(1), HostValue::Integer(2), HostValue::Integer(3)];
        assert!(initialize(&ctx, &p, &three).is_err());

        let arr = boxed(TypeNode::array_of(int(), 4), 16);
        initialize(&ctx, &arr, &[HostValue::Integer(7)]).unwrap();
        assert_eq!(arr.read::<i32>(12), Some(7));
    }

    #[test]
    fn test_string_into_char_array() {
        let ctx = MarshalContext::default();
        let buf = boxed(TypeNode::array_of(TypeNode::builtin(CKind::Char), 8), 8);
        initialize(&ctx, &buf, &[HostValue::string("hi")]).unwrap();
        let s = read_string(&HostValue::Cdata(buf), None).unwrap();
        assert_eq!(s.as_bytes(), Some(&b"hi"[..]));
    }

    #[test]
    fn test_reassigned_slot_releases_old_anchor() {
        let ctx = MarshalContext::default();
        let char_ptr = TypeNode::pointer_to(TypeNode::builtin(CKind::Char));
        let record = Rc::new(
            Record::with_fields(
                "named",
                false,
                vec![Field::new("name", char_ptr.clone()), Field::new("alias", char_ptr)],
            )
            .unwrap(),
        );
        let b = boxed(TypeNode::of_record(&record), 16);
        for i in 0..1000 {
            set_field(&ctx, &b, "name", &HostValue::string(format!("n{}", i))).unwrap();
        }
        assert_eq!(b.anchor_count(), 1);
        set_field(&ctx, &b, "alias", &HostValue::string("a")).unwrap();
        assert_eq!(b.anchor_count(), 2);
        set_field(&ctx, &b, "name", &HostValue::Nil).unwrap();
        assert_eq!(b.anchor_count(), 1);

        let arr = boxed(TypeNode::array_of(TypeNode::pointer_to(TypeNode::builtin(CKind::Char)), 2), 16);
        for _ in 0..10 {
            set_index(&ctx, &arr, 1, &HostValue::string("x")).unwrap();
        }
        assert_eq!(arr.anchor_count(), 1);
    }

    #[test]
    fn test_pointer_index_overflow() {
        let ctx = MarshalContext::default();
        let target = boxed(TypeNode::builtin(CKind::LongLong), 8);
        let p = boxed(TypeNode::pointer_to(TypeNode::builtin(CKind::LongLong)), 8);
        p.write::<usize>(0, target.as_ptr() as usize);
        assert_eq!(get_index(&ctx, &p, 0).unwrap(), HostValue::Integer(0));
        let err = get_index(&ctx, &p, i64::MAX).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConversionRange { .. }));
    }
}
