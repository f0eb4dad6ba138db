//! The explicit context every operation runs against
//!
//! A `Session` owns the declaration store, the symbol resolvers, resolved
//! functions and globals, and the dispatcher with its descriptor cache.
//! Nothing here is global; two sessions never share state.

use crate::config::SessionConfig;
use crate::core::{CKind, RecordLayout, TypeNode};
use crate::decl::{ConstValue, Declaration, DeclarationStore, StagedStore};
use crate::errors::{ErrorKind, FfiError, Result};
use crate::interop::call::{CallFrame, Dispatcher};
use crate::interop::closure;
use crate::interop::library::{Library, SymbolResolver};
use crate::interop::marshal::{self, ConvRule, MarshalContext};
use crate::logging;
use crate::runtime::{access, HostFunction, HostValue, ValueBox};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::ptr;
use std::rc::Rc;
use tracing::debug;

pub struct Session {
    config: SessionConfig,
    store: RefCell<DeclarationStore>,
    resolvers: RefCell<Vec<Box<dyn SymbolResolver>>>,
    /// Callable boxes for declared functions, created on first use
    functions: RefCell<HashMap<String, Rc<ValueBox>>>,
    /// Views onto declared variables; also anchor what was stored in them
    globals: RefCell<HashMap<String, Rc<ValueBox>>>,
    dispatcher: Dispatcher,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::build(SessionConfig::default())
    }

    /// Session from validated configuration, with its libraries opened
    pub fn with_config(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let libraries = config.libraries.clone();
        let session = Self::build(config);
        for path in libraries {
            session.load_library(&path)?;
        }
        Ok(session)
    }

    fn build(config: SessionConfig) -> Self {
        let ctx = MarshalContext::new(config.numerics, config.symbolic_enums);
        let dispatcher = Dispatcher::new(ctx, config.descriptor_cache);
        Self {
            config,
            store: RefCell::new(DeclarationStore::new()),
            resolvers: RefCell::new(Vec::new()),
            functions: RefCell::new(HashMap::new()),
            globals: RefCell::new(HashMap::new()),
            dispatcher,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn context(&self) -> &MarshalContext {
        self.dispatcher.context()
    }

    /// Install the configured logging subscriber
    pub fn init_logging(&self) {
        logging::init_with_config(self.config.log_config());
    }

    /// Number of prepared descriptors in the signature cache
    pub fn cached_descriptors(&self) -> usize {
        self.dispatcher.cached_descriptors()
    }

    // ------------------------------------------------------------------
    // Symbols
    // ------------------------------------------------------------------

    /// Resolvers are consulted in the order they were added
    pub fn add_resolver(&self, resolver: impl SymbolResolver + 'static) {
        debug!(resolver = %resolver.describe(), "resolver added");
        self.resolvers.borrow_mut().push(Box::new(resolver));
    }

    pub fn load_library(&self, path: impl AsRef<Path>) -> Result<()> {
        let library = Library::open(path)?;
        self.add_resolver(library);
        Ok(())
    }

    fn resolve_symbol(&self, name: &str) -> Result<*mut c_void> {
        self.resolvers
            .borrow()
            .iter()
            .find_map(|r| r.resolve(name))
            .ok_or_else(|| {
                FfiError::new(ErrorKind::SymbolNotFound {
                    name: name.to_string(),
                })
            })
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    pub fn declare(&self, decl: Declaration) -> Result<()> {
        self.store.borrow_mut().add(decl)
    }

    /// Run `f` against a staged scope; the batch lands only if `f` succeeds
    pub fn declare_batch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StagedStore<'_>) -> Result<()>,
    {
        let mut store = self.store.borrow_mut();
        let mut staged = store.stage();
        f(&mut staged)?;
        staged.commit();
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Declaration> {
        self.store.borrow().lookup(name).cloned()
    }

    /// Fresh tag for an anonymous record or enum
    pub fn request_name(&self) -> String {
        self.store.borrow_mut().request_name()
    }

    /// Type named by a typedef, `struct foo`, `enum foo` or a type declaration
    pub fn resolve_type(&self, name: &str) -> Result<TypeNode> {
        self.lookup(name)
            .and_then(|d| d.as_type())
            .ok_or_else(|| FfiError::unknown(name))
    }

    pub fn layout_of(&self, record: &TypeNode) -> Result<RecordLayout> {
        let rec = record
            .unref()
            .record()
            .ok_or_else(|| FfiError::mismatch("struct or union", record.to_string()))?;
        rec.layout().cloned()
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// Box of `ty` holding a copy of `bytes`, zeroed when absent
    pub fn make_value(&self, ty: &TypeNode, bytes: Option<&[u8]>) -> Result<Rc<ValueBox>> {
        if ty.is_callable() {
            let sym = match bytes {
                Some(b) if b.len() >= std::mem::size_of::<usize>() => {
                    // SAFETY: length checked above
                    unsafe { ptr::read_unaligned(b.as_ptr() as *const *const c_void) }
                }
                _ => ptr::null(),
            };
            return Ok(Rc::new(ValueBox::callable(ty.clone(), CallFrame::new(sym))));
        }
        let size = if ty.is_unbounded() || ty.is_vla() {
            bytes.map_or(0, <[u8]>::len)
        } else {
            ty.alloc_size()?
        };
        let value = ValueBox::owned(ty.clone(), size)?;
        if let Some(bytes) = bytes {
            let n = bytes.len().min(size);
            // SAFETY: the box holds `size` bytes
            unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), value.as_ptr(), n) };
        }
        Ok(Rc::new(value))
    }

    /// Allocate and initialize a value of `ty`.
    ///
    /// `count` sizes variable-length arrays and the flexible member of a
    /// struct; without it the initializer count is used. Callable types take
    /// a host function (bound to a fresh trampoline), another callable box
    /// (aliased) or nil.
    pub fn new_value(
        &self,
        ty: &TypeNode,
        count: Option<usize>,
        init: &[HostValue],
    ) -> Result<Rc<ValueBox>> {
        if ty.is_callable() {
            return self.new_callable(ty, init);
        }
        if ty.is_void() {
            return Err(FfiError::incomplete(ty));
        }

        let size = if ty.is_unbounded() || ty.is_vla() {
            let elem = ty.pointee().ok_or_else(|| FfiError::incomplete(ty))?;
            let n = count.or_else(|| element_count_hint(elem, init)).ok_or_else(|| {
                FfiError::invalid_declaration(ty.to_string(), "element count required")
            })?;
            elem.alloc_size()?
                .checked_mul(n)
                .ok_or_else(|| FfiError::range(n, ty))?
        } else if let Some(record) = ty.record() {
            let layout = record.layout()?;
            match (layout.flexible, count) {
                (Some(_), Some(n)) => layout
                    .size_with(n)
                    .ok_or_else(|| FfiError::range(n, ty))?,
                _ => layout.size,
            }
        } else {
            ty.alloc_size()?
        };

        let value = ValueBox::owned(ty.clone(), size)?;
        access::initialize(self.context(), &value, init)?;
        Ok(Rc::new(value))
    }

    fn new_callable(&self, ty: &TypeNode, init: &[HostValue]) -> Result<Rc<ValueBox>> {
        match init {
            [] | [HostValue::Nil] => Ok(Rc::new(ValueBox::callable(
                ty.clone(),
                CallFrame::new(ptr::null()),
            ))),
            [HostValue::Function(f)] => closure::bind_callback(self.context(), ty, f.clone()),
            [HostValue::Cdata(b)] if b.is_callable() => {
                if let Some(alias) = closure::alias_callback(ty, b) {
                    return Ok(alias);
                }
                let sym = b.code_ptr().unwrap_or(ptr::null());
                Ok(Rc::new(ValueBox::callable(ty.clone(), CallFrame::new(sym))))
            }
            [other] => Err(FfiError::mismatch(ty, other.type_name())),
            _ => Err(FfiError::range(format!("{} initializers", init.len()), ty)),
        }
    }

    /// Trampoline implementing `fn_ty` that calls back into `callback`.
    /// The returned box owns it; `code_ptr()` is the native entry point.
    pub fn bind_callback(
        &self,
        fn_ty: &TypeNode,
        callback: Rc<dyn HostFunction>,
    ) -> Result<Rc<ValueBox>> {
        closure::bind_callback(self.context(), fn_ty, callback)
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Callable box for a declared function, resolved on first access
    pub fn function(&self, name: &str) -> Result<Rc<ValueBox>> {
        if let Some(found) = self.functions.borrow().get(name) {
            return Ok(found.clone());
        }
        let decl = match self.lookup(name) {
            Some(Declaration::Function(f)) => f,
            Some(other) => {
                return Err(FfiError::mismatch("function", other.serialize()));
            }
            None => return Err(FfiError::unknown(name)),
        };
        let sym = self.resolve_symbol(decl.symbol())?;
        debug!(function = %name, symbol = %decl.symbol(), address = ?sym, "function resolved");
        let value = Rc::new(ValueBox::callable(
            decl.type_node(),
            CallFrame::new(sym as *const c_void),
        ));
        self.functions
            .borrow_mut()
            .insert(name.to_string(), value.clone());
        Ok(value)
    }

    pub fn call(&self, name: &str, args: &[HostValue]) -> Result<HostValue> {
        let func = self.function(name)?;
        self.dispatcher.call(&func, name, args)
    }

    /// Call through a callable box, such as a function pointer read from a
    /// struct or returned by native code
    pub fn call_value(&self, func: &ValueBox, args: &[HostValue]) -> Result<HostValue> {
        let name = func.type_node().to_string();
        self.dispatcher.call(func, &name, args)
    }

    // ------------------------------------------------------------------
    // Globals and constants
    // ------------------------------------------------------------------

    fn global_view(&self, name: &str) -> Result<Rc<ValueBox>> {
        if let Some(found) = self.globals.borrow().get(name) {
            return Ok(found.clone());
        }
        let var = match self.lookup(name) {
            Some(Declaration::Variable(v)) => v,
            Some(other) => return Err(FfiError::mismatch("variable", other.serialize())),
            None => return Err(FfiError::unknown(name)),
        };
        let addr = self.resolve_symbol(var.symbol())?;
        let len = if var.ty.is_unbounded() {
            0
        } else {
            var.ty.alloc_size()?
        };
        let view = Rc::new(ValueBox::borrowed(var.ty.clone(), addr as *mut u8, len, None));
        self.globals
            .borrow_mut()
            .insert(name.to_string(), view.clone());
        Ok(view)
    }

    /// Value of a declared variable, function or constant
    pub fn get_global(&self, name: &str) -> Result<HostValue> {
        match self.lookup(name) {
            Some(Declaration::Function(_)) => return self.function(name).map(HostValue::Cdata),
            Some(Declaration::Constant(_)) => return self.constant(name),
            _ => {}
        }
        let view = self.global_view(name)?;
        let ty = view.type_node().clone();
        if ty.is_array() {
            return Ok(HostValue::Cdata(view));
        }
        marshal::to_host(self.context(), &ty, view.as_ptr(), ConvRule::Conv, false, Some(&view))
    }

    pub fn set_global(&self, name: &str, value: &HostValue) -> Result<()> {
        let view = self.global_view(name)?;
        let ty = view.type_node().clone();
        if ty.is_const() {
            return Err(FfiError::unsupported_in(&ty, "assignment to const variable"));
        }
        let mut anchors = Vec::new();
        marshal::to_native(self.context(), &ty, value, view.as_ptr(), ConvRule::Conv, &mut anchors)?;
        view.anchor_slot(view.as_ptr(), anchors);
        Ok(())
    }

    /// A declared constant, or an enumerator of any declared enum
    pub fn constant(&self, name: &str) -> Result<HostValue> {
        let store = self.store.borrow();
        if let Some(Declaration::Constant(c)) = store.lookup(name) {
            return Ok(match c.value {
                ConstValue::Int(v) => HostValue::Integer(v),
                ConstValue::UInt(v) => match i64::try_from(v) {
                    Ok(v) => HostValue::Integer(v),
                    Err(_) => {
                        let b = ValueBox::owned(TypeNode::builtin(CKind::ULongLong), 8)?;
                        b.write::<u64>(0, v);
                        HostValue::Cdata(Rc::new(b))
                    }
                },
                ConstValue::Float(v) => HostValue::Number(v),
                ConstValue::Bool(v) => HostValue::Boolean(v),
            });
        }
        let enumerator = store.iter().find_map(|d| match d {
            Declaration::Enum(e) => e.value_of(name),
            _ => None,
        });
        enumerator
            .map(HostValue::Integer)
            .ok_or_else(|| FfiError::unknown(name))
    }

    // ------------------------------------------------------------------
    // Reflection
    // ------------------------------------------------------------------

    /// Size of `ty`, with `count` elements for a VLA or flexible struct
    pub fn sizeof(&self, ty: &TypeNode, count: Option<usize>) -> Result<usize> {
        match (ty.kind(), count) {
            (CKind::Array, Some(n)) if ty.is_unbounded() || ty.is_vla() => {
                let elem = ty.pointee().ok_or_else(|| FfiError::incomplete(ty))?;
                elem.alloc_size()?
                    .checked_mul(n)
                    .ok_or_else(|| FfiError::range(n, ty))
            }
            (CKind::Record, Some(n)) => {
                let record = ty.record().ok_or_else(|| FfiError::incomplete(ty))?;
                record
                    .layout()?
                    .size_with(n)
                    .ok_or_else(|| FfiError::range(n, ty))
            }
            _ => ty.alloc_size(),
        }
    }

    pub fn alignof(&self, ty: &TypeNode) -> Result<usize> {
        ty.alignment()
    }

    pub fn offsetof(&self, ty: &TypeNode, field: &str) -> Result<usize> {
        let record = ty.record().ok_or_else(|| FfiError::mismatch("struct or union", ty.to_string()))?;
        record
            .field_offset(field)
            .map(|(offset, _)| offset)
            .ok_or_else(|| FfiError::unknown(format!("{}.{}", record.display_name(), field)))
    }

    /// Whether `value` is a box of `ty`, qualifiers aside
    pub fn is_type(&self, ty: &TypeNode, value: &HostValue) -> bool {
        match value {
            HostValue::Cdata(b) => b.type_node().is_same(ty, true, true),
            _ => false,
        }
    }

    /// Reinterpret `value` as `ty` under the `Cast` rule; always a box
    pub fn cast(&self, ty: &TypeNode, value: &HostValue) -> Result<HostValue> {
        let mut anchors = Vec::new();
        if ty.is_callable() {
            let mut slot = [0u8; std::mem::size_of::<usize>()];
            let as_ptr = TypeNode::pointer_to(TypeNode::void());
            marshal::to_native(self.context(), &as_ptr, value, slot.as_mut_ptr(), ConvRule::Cast, &mut anchors)?;
            let sym = usize::from_ne_bytes(slot) as *const c_void;
            return Ok(HostValue::Cdata(Rc::new(ValueBox::callable(
                ty.clone(),
                CallFrame::new(sym),
            ))));
        }
        let b = ValueBox::owned(ty.clone(), ty.alloc_size()?)?;
        marshal::to_native(self.context(), ty, value, b.as_ptr(), ConvRule::Cast, &mut anchors)?;
        b.anchor_all(anchors);
        Ok(HostValue::Cdata(Rc::new(b)))
    }

    pub fn read_string(&self, value: &HostValue, len: Option<usize>) -> Result<HostValue> {
        access::read_string(value, len)
    }

    // ------------------------------------------------------------------
    // Memory access
    // ------------------------------------------------------------------

    /// Current contents of a box as a host value
    pub fn read_value(&self, value: &Rc<ValueBox>) -> Result<HostValue> {
        let ty = value.type_node();
        if ty.is_unbounded() || ty.is_vla() {
            return Ok(HostValue::Cdata(value.clone()));
        }
        marshal::to_host(self.context(), ty, value.as_ptr(), ConvRule::Conv, false, Some(value))
    }

    pub fn get_field(&self, value: &Rc<ValueBox>, name: &str) -> Result<HostValue> {
        access::get_field(self.context(), value, name)
    }

    pub fn set_field(&self, value: &Rc<ValueBox>, name: &str, new: &HostValue) -> Result<()> {
        access::set_field(self.context(), value, name, new)
    }

    pub fn get_index(&self, value: &Rc<ValueBox>, index: i64) -> Result<HostValue> {
        access::get_index(self.context(), value, index)
    }

    pub fn set_index(&self, value: &Rc<ValueBox>, index: i64, new: &HostValue) -> Result<()> {
        access::set_index(self.context(), value, index, new)
    }

    pub fn deref(&self, value: &Rc<ValueBox>) -> Result<HostValue> {
        access::deref(self.context(), value)
    }
}

/// Element count implied by the initializers of a VLA
fn element_count_hint(elem: &TypeNode, init: &[HostValue]) -> Option<usize> {
    match init {
        [] => None,
        // room for the terminator
        [HostValue::String(s)] if elem.kind().is_char() => Some(s.len() + 1),
        _ => Some(init.len()),
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("declarations", &self.store.borrow().len())
            .field("resolvers", &self.resolvers.borrow().len())
            .field("cached_descriptors", &self.cached_descriptors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EnumField, EnumType, Field, FunctionSig, Record};
    use crate::interop::library::SymbolTable;

    extern "C" fn triple(x: i32) -> i32 {
        x * 3
    }

    static mut COUNTER: i32 = 5;

    fn int() -> TypeNode {
        TypeNode::builtin(CKind::Int)
    }

    fn session() -> Session {
        let session = Session::new();
        session.add_resolver(
            SymbolTable::new()
                .with("triple", triple as *const c_void)
                .with("counter", unsafe { ptr::addr_of!(COUNTER) } as *const c_void),
        );
        session
    }

    #[test]
    fn test_call_declared_function() {
        let s = session();
        s.declare(Declaration::function("triple", FunctionSig::of(int(), [int()])))
            .unwrap();
        assert_eq!(s.call("triple", &[HostValue::Integer(4)]).unwrap(), HostValue::Integer(12));
        // resolved once, reused afterwards
        let a = s.function("triple").unwrap();
        let b = s.function("triple").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_missing_symbol() {
        let s = session();
        s.declare(Declaration::function("nowhere", FunctionSig::of(int(), [])))
            .unwrap();
        let err = s.call("nowhere", &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::SymbolNotFound { .. }));
        let err = s.call("undeclared", &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnknownName { .. }));
    }

    #[test]
    fn test_globals() {
        let s = session();
        s.declare(Declaration::variable("counter", int())).unwrap();
        assert_eq!(s.get_global("counter").unwrap(), HostValue::Integer(5));
        s.set_global("counter", &HostValue::Integer(9)).unwrap();
        assert_eq!(s.get_global("counter").unwrap(), HostValue::Integer(9));
        assert_eq!(unsafe { COUNTER }, 9);
    }

    #[test]
    fn test_constants_and_enumerators() {
        let s = session();
        s.declare(Declaration::constant("LIMIT", int(), ConstValue::Int(10)))
            .unwrap();
        let color = EnumType::with_fields("color", vec![EnumField::new("RED", 0), EnumField::new("BLUE", 2)])
            .unwrap();
        s.declare(Declaration::Enum(Rc::new(color))).unwrap();
        assert_eq!(s.constant("LIMIT").unwrap(), HostValue::Integer(10));
        assert_eq!(s.constant("BLUE").unwrap(), HostValue::Integer(2));
        assert!(s.constant("GREEN").is_err());
    }

    #[test]
    fn test_flexible_struct_allocation() {
        let s = Session::new();
        let record = Rc::new(
            Record::with_fields(
                "buf",
                false,
                vec![
                    Field::new("len", int()),
                    Field::new("data", TypeNode::unbounded_array_of(TypeNode::builtin(CKind::Char))),
                ],
            )
            .unwrap(),
        );
        s.declare(Declaration::Record(record.clone())).unwrap();
        let ty = s.resolve_type("struct buf").unwrap();
        let b = s.new_value(&ty, Some(10), &[HostValue::Integer(10)]).unwrap();
        assert_eq!(b.len(), s.sizeof(&ty, Some(10)).unwrap());
        assert_eq!(s.get_field(&b, "len").unwrap(), HostValue::Integer(10));
        assert_eq!(s.offsetof(&ty, "data").unwrap(), 4);
    }

    #[test]
    fn test_vla_needs_count() {
        let s = Session::new();
        let vla = TypeNode::vla_of(int());
        assert!(s.new_value(&vla, None, &[]).is_err());
        let b = s.new_value(&vla, None, &[HostValue::Integer(1), HostValue::Integer(2)]).unwrap();
        assert_eq!(b.len(), 8);
    }

    #[test]
    fn test_cast_pointer_to_integer() {
        let s = Session::new();
        let p = s.cast(&TypeNode::pointer_to(TypeNode::void()), &HostValue::Integer(0x1000)).unwrap();
        let n = s.cast(&TypeNode::builtin(CKind::ULongLong), &p).unwrap();
        assert_eq!(n.as_cdata().unwrap().read::<u64>(0), Some(0x1000));
        assert!(s.is_type(&TypeNode::builtin(CKind::ULongLong), &n));
    }
}
