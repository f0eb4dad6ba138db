//! Dynamic library loading and symbol resolution
//!
//! Declared functions and variables are resolved lazily through a chain of
//! `SymbolResolver`s. `Library` wraps a loaded shared object; `SymbolTable`
//! is an explicit name to address map for symbols that live in the host
//! binary.

use crate::errors::{ErrorKind, FfiError, Result};
use crate::logging;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;

/// Source of native symbol addresses
pub trait SymbolResolver {
    /// Address of `name`, `None` if this resolver does not know it
    fn resolve(&self, name: &str) -> Option<*mut c_void>;

    /// Name for diagnostics
    fn describe(&self) -> String {
        "resolver".to_string()
    }
}

/// Handle to a dynamically loaded library
pub struct Library {
    name: String,
    inner: libloading::Library,
}

impl Library {
    /// Load a library by file name or path
    pub fn open(name: impl AsRef<Path>) -> Result<Self> {
        let path = name.as_ref();
        // SAFETY: running library initializers is inherent to loading code
        let inner = unsafe { libloading::Library::new(path) }.map_err(|e| {
            FfiError::new(ErrorKind::LibraryLoad {
                name: path.display().to_string(),
                reason: e.to_string(),
            })
        })?;
        logging::log_library_loaded(&path.display().to_string());
        Ok(Self {
            name: path.display().to_string(),
            inner,
        })
    }

    /// The running program and everything it already links
    #[cfg(unix)]
    pub fn this() -> Result<Self> {
        Ok(Self {
            name: "<self>".to_string(),
            inner: libloading::os::unix::Library::this().into(),
        })
    }

    #[cfg(windows)]
    pub fn this() -> Result<Self> {
        let inner = libloading::os::windows::Library::this().map_err(|e| {
            FfiError::new(ErrorKind::LibraryLoad {
                name: "<self>".to_string(),
                reason: e.to_string(),
            })
        })?;
        Ok(Self {
            name: "<self>".to_string(),
            inner: inner.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SymbolResolver for Library {
    fn resolve(&self, name: &str) -> Option<*mut c_void> {
        // SAFETY: the symbol is only used as an address
        let symbol = unsafe { self.inner.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        let addr = *symbol;
        (!addr.is_null()).then_some(addr)
    }

    fn describe(&self) -> String {
        format!("library '{}'", self.name)
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").field("name", &self.name).finish()
    }
}

/// Explicit symbol map
#[derive(Debug, Default, Clone)]
pub struct SymbolTable {
    symbols: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, addr: *const c_void) {
        self.symbols.insert(name.into(), addr as usize);
    }

    /// Builder form of `insert`, handy for `extern "C" fn` items
    pub fn with(mut self, name: impl Into<String>, addr: *const c_void) -> Self {
        self.insert(name, addr);
        self
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolResolver for SymbolTable {
    fn resolve(&self, name: &str) -> Option<*mut c_void> {
        self.symbols.get(name).map(|&addr| addr as *mut c_void)
    }

    fn describe(&self) -> String {
        format!("symbol table ({} entries)", self.symbols.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn marker() -> i32 {
        7
    }

    #[test]
    fn test_symbol_table() {
        let table = SymbolTable::new().with("marker", marker as *const c_void);
        assert_eq!(table.resolve("marker"), Some(marker as *mut c_void));
        assert!(table.resolve("other").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_missing_library() {
        let err = Library::open("definitely-not-a-library.so.42").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::LibraryLoad { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_this_resolves_libc() {
        let lib = Library::this().unwrap();
        assert!(lib.resolve("strlen").is_some());
        assert!(lib.resolve("no_such_symbol_here_123").is_none());
    }
}
