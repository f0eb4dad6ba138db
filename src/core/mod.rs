//! C type graph and native layout
//!
//! Everything here is independent of libffi; the interop layer lowers these
//! types to foreign call descriptors.

pub mod layout;
pub mod record;
pub mod types;

pub use layout::{align_up, compute_layout, AbiScalar, DataModel, RecordLayout, ScalarLayout};
pub use record::{EnumField, EnumType, Field, Record, RecordFill};
pub use types::{CKind, FunctionFlags, FunctionSig, Nested, Param, Qualifiers, TypeFlags, TypeNode};
