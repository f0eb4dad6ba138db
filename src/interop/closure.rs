//! Native-callable trampolines bound to host callables
//!
//! Lifecycle: a callable value box is created unbound, gets a trampoline
//! the first time a host function is coerced into a callback slot, and
//! loses it exactly once when the owning box is finalized. Teardown nulls
//! every registered `ClosureRef` first, then drops the host callable, then
//! frees the libffi closure.

use super::call::{CallDescriptor, CallFrame};
use super::marshal::{self, ConvRule, MarshalContext};
use crate::core::{CKind, TypeFlags, TypeNode};
use crate::errors::{ErrorKind, FfiError, Result};
use crate::logging;
use crate::runtime::{HostFunction, HostValue, ValueBox};
use libffi::low;
use libffi::raw;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

/// Weak handle on another box's trampoline; reads as absent after teardown
#[derive(Debug, Clone)]
pub struct ClosureRef {
    code: Rc<Cell<*const c_void>>,
}

impl ClosureRef {
    pub fn get(&self) -> Option<*const c_void> {
        let code = self.code.get();
        (!code.is_null()).then_some(code)
    }

    pub fn is_live(&self) -> bool {
        !self.code.get().is_null()
    }
}

/// Everything the trampoline needs, reachable from libffi's user data
struct ClosureData {
    /// Function type the trampoline implements
    fn_ty: TypeNode,
    callback: RefCell<Option<Rc<dyn HostFunction>>>,
    ctx: MarshalContext,
    /// Bytes to clear when the callback fails
    ret_size: usize,
}

impl ClosureData {
    unsafe fn dispatch(&self, ret: *mut c_void, args: *mut *mut c_void) -> Result<()> {
        let sig = self
            .fn_ty
            .function_sig()
            .ok_or_else(|| FfiError::mismatch("function", self.fn_ty.to_string()))?;

        let mut host_args = Vec::with_capacity(sig.params().len());
        for (i, param) in sig.params().iter().enumerate() {
            let src = *args.add(i) as *const u8;
            let ty = match (param.ty.kind(), param.ty.pointee()) {
                // arrays arrive decayed
                (CKind::Array, Some(elem)) => TypeNode::pointer_to(elem.clone()),
                _ => param.ty.clone(),
            };
            host_args.push(
                marshal::to_host(&self.ctx, &ty, src, ConvRule::Pass, false, None)
                    .map_err(|e| e.at_argument(i))?,
            );
        }

        let callback = self
            .callback
            .borrow()
            .clone()
            .ok_or_else(|| FfiError::new(ErrorKind::ClosureReleased))?;
        let result = callback.invoke(&host_args)?;

        let mut anchors = Vec::new();
        marshal::write_return(&self.ctx, sig.result(), &result, ret as *mut u8, &mut anchors)?;
        if !anchors.is_empty() {
            // anything anchored here would dangle once we return
            return Err(FfiError::mismatch(sig.result(), result.type_name()));
        }
        Ok(())
    }
}

unsafe extern "C" fn trampoline(
    _cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    userdata: *mut c_void,
) {
    // hold a strong count for the duration in case the callback drops the
    // last reference to the owning box
    let raw_data = userdata as *const ClosureData;
    Rc::increment_strong_count(raw_data);
    let data = Rc::from_raw(raw_data);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| data.dispatch(ret, args)));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(_) => Some(FfiError::new(ErrorKind::CallbackFailed {
            message: "callback panicked".to_string(),
        })),
    };
    if let Some(err) = failure {
        if data.ret_size > 0 {
            ptr::write_bytes(ret as *mut u8, 0, data.ret_size);
        }
        logging::log_callback_error(&err.to_string());
        data.ctx.park_error(err);
    }
}

/// A bound trampoline, owned by exactly one value box
pub struct ClosureState {
    descriptor: Rc<CallDescriptor>,
    raw: *mut raw::ffi_closure,
    code: *const c_void,
    data: *const ClosureData,
    /// One cell shared by every handed-out `ClosureRef`
    shared: Rc<Cell<*const c_void>>,
}

impl ClosureState {
    pub(crate) fn bind(
        ctx: &MarshalContext,
        fn_ty: TypeNode,
        descriptor: Rc<CallDescriptor>,
        callback: Rc<dyn HostFunction>,
    ) -> Result<Self> {
        let result = fn_ty
            .function_sig()
            .map(|s| s.result().clone())
            .ok_or_else(|| FfiError::mismatch("function", fn_ty.to_string()))?;
        let ret_size = if result.is_void() {
            0
        } else {
            result
                .alloc_size()
                .unwrap_or(0)
                .max(std::mem::size_of::<usize>())
        };

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(FfiError::new(ErrorKind::CallPreparation {
                function: fn_ty.to_string(),
                reason: "closure allocation failed".to_string(),
            }));
        }

        let data = Rc::into_raw(Rc::new(ClosureData {
            fn_ty: fn_ty.clone(),
            callback: RefCell::new(Some(callback)),
            ctx: ctx.clone(),
            ret_size,
        }));

        // SAFETY: closure, cif and code come from libffi and stay alive
        // until `drop`
        let status = unsafe {
            raw::ffi_prep_closure_loc(
                closure,
                descriptor.as_raw(),
                Some(trampoline),
                data as *mut c_void,
                code.as_mut_ptr(),
            )
        };
        if status != raw::ffi_status_FFI_OK {
            // SAFETY: nothing else references either allocation yet
            unsafe {
                low::closure_free(closure);
                drop(Rc::from_raw(data));
            }
            return Err(FfiError::new(ErrorKind::CallPreparation {
                function: fn_ty.to_string(),
                reason: format!("closure preparation failed with status {}", status),
            }));
        }

        let code = code.as_ptr() as *const c_void;
        logging::log_closure_bound(&fn_ty.to_string(), code);
        Ok(Self {
            descriptor,
            raw: closure,
            code,
            data,
            shared: Rc::new(Cell::new(code)),
        })
    }

    pub fn code_ptr(&self) -> *const c_void {
        self.code
    }

    pub(crate) fn descriptor(&self) -> Rc<CallDescriptor> {
        self.descriptor.clone()
    }

    pub fn register_ref(&self) -> ClosureRef {
        ClosureRef {
            code: self.shared.clone(),
        }
    }

    /// Handles still held by someone
    pub fn live_refs(&self) -> usize {
        Rc::strong_count(&self.shared) - 1
    }
}

impl Drop for ClosureState {
    fn drop(&mut self) {
        let refs = self.live_refs();
        self.shared.set(ptr::null());
        // SAFETY: `data` came from Rc::into_raw in `bind`; the trampoline
        // only borrows it while running
        unsafe {
            let callback = (*self.data).callback.borrow_mut().take();
            drop(callback);
            low::closure_free(self.raw);
            drop(Rc::from_raw(self.data));
        }
        logging::log_closure_teardown(self.code, refs);
    }
}

/// Bind `callback` to a fresh trampoline implementing `ty`, a function type
/// or a pointer to one. The returned box owns the trampoline.
pub(crate) fn bind_callback(
    ctx: &MarshalContext,
    ty: &TypeNode,
    callback: Rc<dyn HostFunction>,
) -> Result<Rc<ValueBox>> {
    let sig = ty
        .function_sig()
        .ok_or_else(|| FfiError::mismatch(ty, "function"))?;
    if sig.is_variadic() {
        return Err(FfiError::unsupported_in(ty, "callback"));
    }
    let fn_ty = match ty.kind() {
        CKind::Function => ty.clone(),
        _ => ty.pointee().cloned().ok_or_else(|| FfiError::mismatch(ty, "function"))?,
    }
    .with_flags(TypeFlags::CLOSURE);

    let descriptor = Rc::new(CallDescriptor::prepare(sig, &[], "callback")?);
    let state = ClosureState::bind(ctx, fn_ty, descriptor, callback)?;
    Ok(Rc::new(ValueBox::callable(ty.clone(), CallFrame::owning(state))))
}

/// Box aliasing the trampoline of `owner` without keeping it alive
pub(crate) fn alias_callback(ty: &TypeNode, owner: &ValueBox) -> Option<Rc<ValueBox>> {
    let frame = owner.frame()?;
    let shared = frame.borrow().share_closure()?;
    Some(Rc::new(ValueBox::callable(ty.clone(), CallFrame::aliasing(shared))))
}

/// Host function wrapping a plain Rust closure, for tests and embedders
pub fn host_fn<F>(f: F) -> Rc<dyn HostFunction>
where
    F: Fn(&[HostValue]) -> Result<HostValue> + 'static,
{
    Rc::new(f)
}
