//! Crossing into native code: ABI lowering, marshaling, calls and callbacks

pub mod abi;
pub mod call;
pub mod closure;
mod extended;
pub mod library;
pub mod marshal;
mod scratch;


pub use abi::CallingConvention;
pub use call::{CallDescriptor, CallFrame, Dispatcher};
pub use closure::{host_fn, ClosureRef, ClosureState};
pub use library::{Library, SymbolResolver, SymbolTable};
pub use marshal::{ConvRule, HostNumerics, MarshalContext};
