//! cffi-core: declare C types and functions at runtime, call native code,
//! read and write native-layout memory, and hand host callables to native
//! code as function pointers.

// Core modules
pub mod config;
pub mod core;
pub mod decl;
pub mod errors;
pub mod interop;
pub mod logging;
pub mod runtime;
pub mod session;

// Re-export commonly used items
pub use config::{LoggingSection, SessionConfig};
pub use core::{
    CKind, DataModel, EnumField, EnumType, Field, FunctionSig, Param, Qualifiers, Record,
    RecordLayout, TypeFlags, TypeNode,
};
pub use decl::{ConstValue, Declaration, DeclarationStore, FunctionDecl, StagedStore, VariableDecl};
pub use errors::{ErrorKind, FfiError, Result};
pub use interop::{
    host_fn, CallingConvention, ClosureRef, ConvRule, HostNumerics, Library, MarshalContext,
    SymbolResolver, SymbolTable,
};
pub use runtime::{Finalizer, HostFunction, HostValue, ValueBox};
pub use session::Session;
