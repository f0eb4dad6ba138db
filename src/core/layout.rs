//! Native data models and the record layout builder
//!
//! Layout is a pure function of (field list, union flag, data model). The
//! host model is what calls and value boxes use; the fixed models exist so
//! layouts can be checked against other ABIs without running on them.

use super::record::Field;
use super::types::{CKind, TypeNode};
use crate::errors::{FfiError, Result};
use once_cell::sync::Lazy;
use std::os::raw::{c_char, c_int, c_long, c_longlong, c_short, c_void};

/// Size and alignment of one native scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarLayout {
    pub size: usize,
    pub align: usize,
}

impl ScalarLayout {
    pub const fn new(size: usize, align: usize) -> Self {
        Self { size, align }
    }

    const fn of<T>() -> Self {
        Self::new(std::mem::size_of::<T>(), std::mem::align_of::<T>())
    }
}

/// Native scalar descriptor a C type lowers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiScalar {
    Void,
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
    F32,
    F64,
    LongDouble,
    Pointer,
}

impl AbiScalar {
    pub const fn is_unsigned(self) -> bool {
        matches!(self, Self::U8 | Self::U16 | Self::U32 | Self::U64)
    }

    pub const fn is_signed_int(self) -> bool {
        matches!(self, Self::S8 | Self::S16 | Self::S32 | Self::S64)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64 | Self::LongDouble)
    }

    /// Width in bits for integer descriptors
    pub const fn int_bits(self) -> Option<u32> {
        match self {
            Self::U8 | Self::S8 => Some(8),
            Self::U16 | Self::S16 => Some(16),
            Self::U32 | Self::S32 => Some(32),
            Self::U64 | Self::S64 => Some(64),
            _ => None,
        }
    }

    fn int_of(size: usize, signed: bool) -> Option<Self> {
        Some(match (size, signed) {
            (1, true) => Self::S8,
            (1, false) => Self::U8,
            (2, true) => Self::S16,
            (2, false) => Self::U16,
            (4, true) => Self::S32,
            (4, false) => Self::U32,
            (8, true) => Self::S64,
            (8, false) => Self::U64,
            _ => return None,
        })
    }
}

/// Scalar sizes and alignments of one C ABI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataModel {
    pub name: &'static str,
    pub char_signed: bool,
    pub boolean: ScalarLayout,
    pub short: ScalarLayout,
    pub int: ScalarLayout,
    pub long: ScalarLayout,
    pub long_long: ScalarLayout,
    pub float: ScalarLayout,
    pub double: ScalarLayout,
    pub long_double: ScalarLayout,
    pub pointer: ScalarLayout,
}

static HOST_MODEL: Lazy<DataModel> = Lazy::new(|| DataModel {
    name: "host",
    char_signed: (c_char::MIN as i32) < 0,
    boolean: ScalarLayout::of::<bool>(),
    short: ScalarLayout::of::<c_short>(),
    int: ScalarLayout::of::<c_int>(),
    long: ScalarLayout::of::<c_long>(),
    long_long: ScalarLayout::of::<c_longlong>(),
    float: ScalarLayout::of::<f32>(),
    double: ScalarLayout::of::<f64>(),
    long_double: host_long_double(),
    pointer: ScalarLayout::of::<*const c_void>(),
});

fn host_long_double() -> ScalarLayout {
    if cfg!(all(target_arch = "x86_64", not(windows))) {
        ScalarLayout::new(16, 16)
    } else if cfg!(all(target_arch = "x86", not(windows))) {
        ScalarLayout::new(12, 4)
    } else if cfg!(any(
        all(target_arch = "aarch64", target_os = "linux"),
        target_arch = "riscv64",
        target_arch = "s390x"
    )) {
        ScalarLayout::new(16, 16)
    } else {
        ScalarLayout::new(8, 8)
    }
}

impl DataModel {
    /// The model of the running target
    pub fn host() -> &'static DataModel {
        &HOST_MODEL
    }

    /// x86-64 System V and most 64-bit unix targets
    pub fn lp64() -> Self {
        Self {
            name: "lp64",
            char_signed: true,
            boolean: ScalarLayout::new(1, 1),
            short: ScalarLayout::new(2, 2),
            int: ScalarLayout::new(4, 4),
            long: ScalarLayout::new(8, 8),
            long_long: ScalarLayout::new(8, 8),
            float: ScalarLayout::new(4, 4),
            double: ScalarLayout::new(8, 8),
            long_double: ScalarLayout::new(16, 16),
            pointer: ScalarLayout::new(8, 8),
        }
    }

    /// 64-bit Windows
    pub fn llp64() -> Self {
        Self {
            name: "llp64",
            long: ScalarLayout::new(4, 4),
            long_double: ScalarLayout::new(8, 8),
            ..Self::lp64()
        }
    }

    /// i386 System V: 8-byte scalars are only 4-aligned inside records
    pub fn ilp32() -> Self {
        Self {
            name: "ilp32",
            char_signed: true,
            boolean: ScalarLayout::new(1, 1),
            short: ScalarLayout::new(2, 2),
            int: ScalarLayout::new(4, 4),
            long: ScalarLayout::new(4, 4),
            long_long: ScalarLayout::new(8, 4),
            float: ScalarLayout::new(4, 4),
            double: ScalarLayout::new(8, 4),
            long_double: ScalarLayout::new(12, 4),
            pointer: ScalarLayout::new(4, 4),
        }
    }

    pub fn is_host(&self) -> bool {
        self == Self::host()
    }

    /// Layout of a scalar kind; `None` for aggregates and void
    pub fn scalar_layout(&self, kind: CKind) -> Option<ScalarLayout> {
        use CKind::*;
        Some(match kind {
            Bool => self.boolean,
            Char | SChar | UChar => ScalarLayout::new(1, 1),
            Short | UShort => self.short,
            Int | UInt | Enum => self.int,
            Long | ULong => self.long,
            LongLong | ULongLong => self.long_long,
            Float => self.float,
            Double => self.double,
            LongDouble => self.long_double,
            Pointer | Function | VaList => self.pointer,
            Void | Record | Array => return None,
        })
    }

    /// Match a scalar kind against the native scalar descriptors
    pub fn abi_scalar(&self, kind: CKind) -> Option<AbiScalar> {
        use CKind::*;
        let layout = self.scalar_layout(kind);
        match kind {
            Void => Some(AbiScalar::Void),
            Bool | UChar | UShort | UInt | ULong | ULongLong => {
                AbiScalar::int_of(layout?.size, false)
            }
            SChar | Short | Int | Long | LongLong | Enum => AbiScalar::int_of(layout?.size, true),
            Char => AbiScalar::int_of(1, self.char_signed),
            Float => Some(AbiScalar::F32),
            Double => Some(AbiScalar::F64),
            LongDouble if self.long_double.size == self.double.size => Some(AbiScalar::F64),
            LongDouble => Some(AbiScalar::LongDouble),
            Pointer | Function | VaList => Some(AbiScalar::Pointer),
            Record | Array => None,
        }
    }
}

/// Round `value` up to a multiple of the power-of-two `align`
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub align: usize,
}

/// Trailing unbounded array, sized by the allocation instead of the type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlexibleMember {
    pub offset: usize,
    pub elem_size: usize,
    pub elem_align: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    pub fields: Vec<FieldLayout>,
    pub size: usize,
    pub align: usize,
    pub flexible: Option<FlexibleMember>,
}

impl RecordLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.field(name).map(|f| f.offset)
    }

    /// Allocation size with `count` trailing flexible elements; `None` on
    /// overflow
    pub fn size_with(&self, count: usize) -> Option<usize> {
        match self.flexible {
            Some(flex) => {
                let end = flex.elem_size.checked_mul(count)?.checked_add(flex.offset)?;
                let size = end.max(self.size);
                size.checked_add(self.align - 1)?;
                Some(align_up(size, self.align))
            }
            None => Some(self.size),
        }
    }
}

/// Compute offsets, size and alignment of a struct or union field list
pub fn compute_layout(
    record: &str,
    fields: &[Field],
    is_union: bool,
    model: &DataModel,
) -> Result<RecordLayout> {
    if fields.is_empty() && !is_union {
        return Err(FfiError::invalid_declaration(record, "struct has no members"));
    }

    let mut out = Vec::with_capacity(fields.len());
    let mut cursor = 0usize;
    let mut size = 0usize;
    let mut align = 1usize;
    let mut flexible = None;
    let last = fields.len().saturating_sub(1);

    for (i, field) in fields.iter().enumerate() {
        let ty = &field.ty;
        if ty.is_vla() {
            return Err(FfiError::unsupported_in(ty, format!("member '{}' of {}", field.name, record)));
        }

        if ty.is_unbounded() {
            if i != last {
                return Err(FfiError::invalid_declaration(
                    record,
                    format!("flexible array member '{}' not at end", field.name),
                ));
            }
            let elem = ty
                .pointee()
                .ok_or_else(|| FfiError::incomplete(ty))?;
            let elem_size = elem.size_in(model)?;
            let elem_align = elem.align_in(model)?;
            let offset = if is_union { 0 } else { align_up(cursor, elem_align) };
            align = align.max(elem_align);
            flexible = Some(FlexibleMember {
                offset,
                elem_size,
                elem_align,
            });
            out.push(FieldLayout {
                name: field.name.clone(),
                offset,
                size: 0,
                align: elem_align,
            });
            continue;
        }

        let field_size = ty.size_in(model)?;
        let field_align = ty.align_in(model)?;
        align = align.max(field_align);

        let offset = if is_union {
            size = size.max(field_size);
            0
        } else {
            let offset = align_up(cursor, field_align);
            cursor = offset + field_size;
            offset
        };

        if i == last && ty.kind() == CKind::Record {
            if let Some(nested) = ty.record() {
                let nested_layout = nested.layout_in(model)?;
                if let Some(flex) = nested_layout.flexible {
                    flexible = Some(FlexibleMember {
                        offset: offset + flex.offset,
                        ..flex
                    });
                }
            }
        }

        out.push(FieldLayout {
            name: field.name.clone(),
            offset,
            size: field_size,
            align: field_align,
        });
    }

    let raw_size = if is_union { size } else { cursor };
    Ok(RecordLayout {
        fields: out,
        size: align_up(raw_size, align),
        align,
        flexible,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::Record;
    use std::rc::Rc;

    fn int() -> TypeNode {
        TypeNode::builtin(CKind::Int)
    }

    fn fields(list: &[(&str, TypeNode)]) -> Vec<Field> {
        list.iter()
            .map(|(n, t)| Field::new(*n, t.clone()))
            .collect()
    }

    #[test]
    fn test_int_char_double_over_models() {
        let f = fields(&[
            ("a", int()),
            ("b", TypeNode::builtin(CKind::Char)),
            ("c", TypeNode::builtin(CKind::Double)),
        ]);
        for (model, align) in [
            (DataModel::lp64(), 8),
            (DataModel::llp64(), 8),
            (DataModel::ilp32(), 4),
        ] {
            let layout = compute_layout("struct s", &f, false, &model).unwrap();
            assert_eq!(layout.offset_of("a"), Some(0), "{}", model.name);
            assert_eq!(layout.offset_of("b"), Some(4), "{}", model.name);
            assert_eq!(layout.offset_of("c"), Some(8), "{}", model.name);
            assert_eq!(layout.size, 16, "{}", model.name);
            assert_eq!(layout.align, align, "{}", model.name);
        }
    }

    #[test]
    fn test_long_differs_between_lp64_and_llp64() {
        let f = fields(&[
            ("c", TypeNode::builtin(CKind::Char)),
            ("l", TypeNode::builtin(CKind::Long)),
        ]);
        let lp = compute_layout("struct s", &f, false, &DataModel::lp64()).unwrap();
        let llp = compute_layout("struct s", &f, false, &DataModel::llp64()).unwrap();
        assert_eq!((lp.offset_of("l"), lp.size), (Some(8), 16));
        assert_eq!((llp.offset_of("l"), llp.size), (Some(4), 8));
    }

    #[test]
    fn test_union_offsets_are_zero() {
        let f = fields(&[
            ("c", TypeNode::builtin(CKind::Char)),
            ("d", TypeNode::builtin(CKind::Double)),
            ("a", TypeNode::array_of(TypeNode::builtin(CKind::Char), 9)),
        ]);
        let layout = compute_layout("union u", &f, true, &DataModel::lp64()).unwrap();
        assert!(layout.fields.iter().all(|f| f.offset == 0));
        assert_eq!(layout.size, 16);
        assert_eq!(layout.align, 8);
    }

    #[test]
    fn test_trailing_padding() {
        let f = fields(&[
            ("d", TypeNode::builtin(CKind::Double)),
            ("c", TypeNode::builtin(CKind::Char)),
        ]);
        let layout = compute_layout("struct s", &f, false, &DataModel::lp64()).unwrap();
        assert_eq!(layout.size, 16);
    }

    #[test]
    fn test_flexible_member_excluded_from_size() {
        let f = fields(&[
            ("len", int()),
            ("data", TypeNode::unbounded_array_of(TypeNode::builtin(CKind::Double))),
        ]);
        let layout = compute_layout("struct s", &f, false, &DataModel::lp64()).unwrap();
        assert_eq!(layout.size, 8);
        assert_eq!(layout.align, 8);
        let flex = layout.flexible.unwrap();
        assert_eq!(flex.offset, 8);
        assert_eq!(flex.elem_size, 8);
        assert_eq!(layout.size_with(3), Some(32));
        assert_eq!(layout.size_with(usize::MAX), None);
    }

    #[test]
    fn test_nested_flexible_record_propagates() {
        let inner = Rc::new(Record::new("inner", false));
        inner
            .set_fields(fields(&[
                ("n", TypeNode::builtin(CKind::Short)),
                ("v", TypeNode::unbounded_array_of(TypeNode::builtin(CKind::Short))),
            ]))
            .unwrap();
        let f = fields(&[("tag", int()), ("body", TypeNode::of_record(&inner))]);
        let layout = compute_layout("struct outer", &f, false, DataModel::host()).unwrap();
        let flex = layout.flexible.unwrap();
        assert_eq!(flex.offset, 4 + 2);
        assert_eq!(flex.elem_size, 2);
    }

    #[test]
    fn test_flexible_not_last_is_rejected() {
        let f = fields(&[
            ("data", TypeNode::unbounded_array_of(int())),
            ("len", int()),
        ]);
        assert!(compute_layout("struct s", &f, false, &DataModel::lp64()).is_err());
    }

    #[test]
    fn test_empty_struct_is_rejected() {
        assert!(compute_layout("struct s", &[], false, &DataModel::lp64()).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(16, 16), 16);
    }

    #[test]
    fn test_host_scalars_match_rust() {
        let host = DataModel::host();
        assert_eq!(host.int.size, std::mem::size_of::<c_int>());
        assert_eq!(host.pointer.size, std::mem::size_of::<usize>());
        assert_eq!(host.abi_scalar(CKind::UInt), Some(AbiScalar::U32));
        assert!(host.abi_scalar(CKind::Record).is_none());
    }
}
