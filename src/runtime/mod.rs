//! Host-side values and the boxes that hold native memory

pub mod access;
pub mod cdata;
pub mod value;

pub use cdata::{Finalizer, ValueBox, MIN_ALIGN};
pub use value::{HostFunction, HostValue};
