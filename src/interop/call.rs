//! Foreign call descriptors and the call dispatcher
//!
//! A descriptor is a prepared `ffi_cif` plus the libffi type trees it
//! points into. Descriptors are immutable once prepared and shared through
//! `Rc`: between the frames of every function with the same signature (via
//! the dispatcher's LRU cache) and with closures bound to that signature.

use super::abi::{param_type, promote_variadic, result_type};
use super::closure::{ClosureRef, ClosureState};
use super::marshal::{self, ConvRule, MarshalContext};
use super::scratch::ArgScratch;
use crate::core::{CKind, FunctionSig, Qualifiers, TypeNode};
use crate::errors::{ErrorKind, FfiError, Result};
use crate::logging;
use crate::runtime::{HostValue, ValueBox};
use libffi::low::{self, CodePtr};
use libffi::middle::Type;
use libffi::raw;
use lru::LruCache;
use smallvec::SmallVec;
use std::borrow::Cow;
use std::cell::RefCell;
use std::ffi::c_void;
use std::mem::size_of;
use std::num::NonZeroUsize;
use std::ptr;
use std::rc::Rc;

pub struct CallDescriptor {
    cif: *mut raw::ffi_cif,
    // holds the weak record references of the cache key, so the addresses
    // in it cannot be reused while the descriptor is cached
    _sig: FunctionSig,
    _extra: Vec<TypeNode>,
    // the cif points into these
    _params: Vec<Type>,
    _atypes: Box<[*mut raw::ffi_type]>,
    _result: Type,
    nfixed: usize,
    ntotal: usize,
}

fn in_function(name: &str) -> impl Fn(FfiError) -> FfiError + '_ {
    move |e| e.with_context(format!("function '{}'", name))
}

impl CallDescriptor {
    /// Prepare a cif for `sig`, with `extra` variadic argument types
    pub(crate) fn prepare(sig: &FunctionSig, extra: &[TypeNode], name: &str) -> Result<Self> {
        let mut params = Vec::with_capacity(sig.params().len() + extra.len());
        for param in sig.params() {
            params.push(param_type(&param.ty).map_err(in_function(name))?);
        }
        for ty in extra {
            params.push(param_type(ty).map_err(in_function(name))?);
        }
        let result = result_type(sig.result()).map_err(in_function(name))?;

        let mut atypes: Box<[*mut raw::ffi_type]> = params.iter().map(Type::as_raw_ptr).collect();
        let nfixed = sig.params().len();
        let ntotal = params.len();
        let abi = sig.callconv().ffi_abi();

        // SAFETY: a zeroed cif is a valid target for prep_cif
        let cif = Box::into_raw(Box::new(unsafe { std::mem::zeroed::<raw::ffi_cif>() }));
        // SAFETY: every type pointer stays alive in `params`/`result`
        let status = unsafe {
            if sig.is_variadic() {
                low::prep_cif_var(cif, abi, nfixed, ntotal, result.as_raw_ptr(), atypes.as_mut_ptr())
            } else {
                low::prep_cif(cif, abi, ntotal, result.as_raw_ptr(), atypes.as_mut_ptr())
            }
        };
        if let Err(err) = status {
            // SAFETY: allocated above and not shared
            unsafe { drop(Box::from_raw(cif)) };
            return Err(FfiError::new(ErrorKind::CallPreparation {
                function: name.to_string(),
                reason: format!("{:?} for {} ABI", err, sig.callconv().name()),
            }));
        }

        Ok(Self {
            cif,
            _sig: sig.clone(),
            _extra: extra.to_vec(),
            _params: params,
            _atypes: atypes,
            _result: result,
            nfixed,
            ntotal,
        })
    }

    #[inline]
    pub(crate) fn as_raw(&self) -> *mut raw::ffi_cif {
        self.cif
    }

    pub fn fixed_args(&self) -> usize {
        self.nfixed
    }

    pub fn total_args(&self) -> usize {
        self.ntotal
    }
}

impl Drop for CallDescriptor {
    fn drop(&mut self) {
        // SAFETY: created by Box::into_raw in `prepare`
        unsafe { drop(Box::from_raw(self.cif)) }
    }
}

/// Call machinery stored in a callable value box
pub struct CallFrame {
    /// Native code pointer; a box's bytes are this field
    pub(crate) sym: *const c_void,
    /// Trampoline owned by this box
    pub(crate) closure: Option<ClosureState>,
    /// Trampoline owned by another box
    pub(crate) closure_ref: Option<ClosureRef>,
    descriptor: Option<Rc<CallDescriptor>>,
    /// Last variadic descriptor, keyed by the extra argument types
    variadic: Option<(String, Rc<CallDescriptor>)>,
    scratch: ArgScratch,
}

impl CallFrame {
    pub(crate) fn new(sym: *const c_void) -> Self {
        Self {
            sym,
            closure: None,
            closure_ref: None,
            descriptor: None,
            variadic: None,
            scratch: ArgScratch::default(),
        }
    }

    pub(crate) fn owning(state: ClosureState) -> Self {
        let mut frame = Self::new(state.code_ptr());
        frame.descriptor = Some(state.descriptor());
        frame.closure = Some(state);
        frame
    }

    pub(crate) fn aliasing(closure: ClosureRef) -> Self {
        let mut frame = Self::new(closure.get().unwrap_or(ptr::null()));
        frame.closure_ref = Some(closure);
        frame
    }

    /// Code pointer, unless the trampoline this frame aliases is gone
    pub(crate) fn live_sym(&self) -> Option<*const c_void> {
        match &self.closure_ref {
            Some(closure) if !closure.is_live() => None,
            _ => Some(self.sym),
        }
    }

    /// Clear the stored address once an aliased trampoline is released
    pub(crate) fn forget_released(&mut self) {
        if self.live_sym().is_none() {
            self.sym = ptr::null();
        }
    }

    /// Tear down an owned trampoline, if any
    pub(crate) fn release_closure(&mut self) {
        if let Some(state) = self.closure.take() {
            self.sym = ptr::null();
            drop(state);
        }
    }

    /// Register a weak back-reference with the closure this frame owns or aliases
    pub(crate) fn share_closure(&self) -> Option<ClosureRef> {
        match (&self.closure, &self.closure_ref) {
            (Some(state), _) => Some(state.register_ref()),
            (None, Some(r)) => Some(r.clone()),
            _ => None,
        }
    }
}

/// Host-side type of one extra variadic argument
fn variadic_type(value: &HostValue) -> Result<TypeNode> {
    Ok(match value {
        HostValue::Nil => TypeNode::pointer_to(TypeNode::void()),
        HostValue::Boolean(_) => TypeNode::builtin(CKind::Int),
        HostValue::Integer(_) => TypeNode::builtin(CKind::LongLong),
        HostValue::Number(_) => TypeNode::builtin(CKind::Double),
        HostValue::String(_) => {
            TypeNode::pointer_to(TypeNode::builtin(CKind::Char).with_cv(Qualifiers::CONST))
        }
        HostValue::Cdata(b) => {
            let ty = promote_variadic(b.type_node());
            if ty.is_record() && !ty.passable() {
                return Err(FfiError::unsupported_in(&ty, "variadic argument"));
            }
            ty
        }
        HostValue::Function(_) => return Err(FfiError::mismatch("typed value", value.type_name())),
    })
}

/// Arrays travel as pointers to their first element
fn pass_type(ty: &TypeNode) -> Cow<'_, TypeNode> {
    match (ty.kind(), ty.pointee()) {
        (CKind::Array, Some(elem)) if !ty.is_ref() => Cow::Owned(TypeNode::pointer_to(elem.clone())),
        _ => Cow::Borrowed(ty),
    }
}

fn slot_layout(ty: &TypeNode) -> Result<(usize, usize)> {
    if ty.is_ref() {
        return Ok((size_of::<*const c_void>(), size_of::<*const c_void>()));
    }
    Ok((ty.alloc_size()?, ty.alignment()?))
}

/// Marshals arguments, invokes native code, marshals the result
pub struct Dispatcher {
    ctx: MarshalContext,
    cache: RefCell<LruCache<String, Rc<CallDescriptor>>>,
}

impl Dispatcher {
    pub fn new(ctx: MarshalContext, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ctx,
            cache: RefCell::new(LruCache::new(capacity)),
        }
    }

    pub fn context(&self) -> &MarshalContext {
        &self.ctx
    }

    pub fn cached_descriptors(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Shared descriptor for a signature plus variadic extras
    pub(crate) fn descriptor(
        &self,
        sig: &FunctionSig,
        extra: &[TypeNode],
        name: &str,
    ) -> Result<Rc<CallDescriptor>> {
        let mut key = sig.cache_key();
        for ty in extra {
            key.push('|');
            key.push_str(&ty.identity_key());
        }
        if let Some(found) = self.cache.borrow_mut().get(&key) {
            return Ok(found.clone());
        }
        let descriptor = Rc::new(CallDescriptor::prepare(sig, extra, name)?);
        logging::log_descriptor_prepared(&key, descriptor.total_args(), false);
        self.cache.borrow_mut().put(key, descriptor.clone());
        Ok(descriptor)
    }

    /// Call the native function held by `func`
    pub fn call(&self, func: &ValueBox, name: &str, args: &[HostValue]) -> Result<HostValue> {
        self.dispatch(func, name, args).map_err(|e| {
            logging::log_ffi_error(name, &e.to_string());
            e
        })
    }

    fn dispatch(&self, func: &ValueBox, name: &str, args: &[HostValue]) -> Result<HostValue> {
        let fn_ty = func.type_node();
        let not_callable = || FfiError::mismatch("function", format!("cdata<{}>", fn_ty));
        let sig = fn_ty.function_sig().ok_or_else(not_callable)?;
        let frame = func.frame().ok_or_else(not_callable)?;

        let nfixed = sig.params().len();
        if args.len() < nfixed || (!sig.is_variadic() && args.len() != nfixed) {
            return Err(FfiError::new(ErrorKind::ArgumentCountMismatch {
                expected: nfixed,
                found: args.len(),
                variadic: sig.is_variadic(),
            })
            .with_context(format!("function '{}'", name)));
        }

        let (sym, cached) = {
            let frame = frame.borrow();
            let sym = frame
                .live_sym()
                .ok_or_else(|| FfiError::new(ErrorKind::ClosureReleased))?;
            (sym, frame.descriptor.clone())
        };
        if sym.is_null() {
            return Err(FfiError::new(ErrorKind::CallPreparation {
                function: name.to_string(),
                reason: "null function pointer".to_string(),
            }));
        }

        let extra = args[nfixed..]
            .iter()
            .enumerate()
            .map(|(i, v)| variadic_type(v).map_err(|e| e.at_argument(nfixed + i)))
            .collect::<Result<Vec<_>>>()?;

        let descriptor = if sig.is_variadic() {
            let key = extra.iter().map(TypeNode::identity_key).collect::<Vec<_>>().join(",");
            let reuse = frame
                .borrow()
                .variadic
                .as_ref()
                .filter(|(k, _)| *k == key)
                .map(|(_, d)| d.clone());
            match reuse {
                Some(d) => d,
                None => {
                    let d = self.descriptor(sig, &extra, name)?;
                    frame.borrow_mut().variadic = Some((key, d.clone()));
                    d
                }
            }
        } else {
            match cached {
                Some(d) => d,
                None => {
                    let d = self.descriptor(sig, &[], name)?;
                    frame.borrow_mut().descriptor = Some(d.clone());
                    d
                }
            }
        };

        // detached for the duration of the call so callbacks may reenter
        let mut scratch = std::mem::take(&mut frame.borrow_mut().scratch);
        let outcome = self.invoke(sig, &descriptor, sym, &extra, args, &mut scratch, name);
        frame.borrow_mut().scratch = scratch;
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &self,
        sig: &FunctionSig,
        descriptor: &CallDescriptor,
        sym: *const c_void,
        extra: &[TypeNode],
        args: &[HostValue],
        scratch: &mut ArgScratch,
        name: &str,
    ) -> Result<HostValue> {
        let nfixed = sig.params().len();
        scratch.ensure(args.len());

        let mut anchors = Vec::new();
        let mut values: SmallVec<[*mut c_void; 8]> = SmallVec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let declared = if i < nfixed {
                &sig.params()[i].ty
            } else {
                &extra[i - nfixed]
            };
            let ty = pass_type(declared);
            let (size, align) = slot_layout(&ty).map_err(in_function(name))?;
            let slot = scratch.slot(i).reserve(size, align)?;
            marshal::to_native(&self.ctx, &ty, arg, slot, ConvRule::Pass, &mut anchors)
                .map_err(|e| e.at_argument(i).with_context(format!("function '{}'", name)))?;
            values.push(slot as *mut c_void);
        }

        let result_ty = sig.result();
        let (rsize, ralign) = if result_ty.is_void() {
            (0, 1)
        } else {
            slot_layout(result_ty).map_err(in_function(name))?
        };
        let ret = scratch.ret(rsize, ralign)?;

        logging::log_ffi_call(name, args.len(), sig.is_variadic());
        let code = CodePtr(sym as *mut c_void);
        // SAFETY: the descriptor matches the declared signature, every
        // argument slot holds a value of its parameter type, and the result
        // slot is at least as large as the result type.
        unsafe {
            raw::ffi_call(
                descriptor.as_raw(),
                Some(*code.as_safe_fun()),
                ret as *mut c_void,
                values.as_mut_ptr(),
            );
        }
        drop(anchors);

        if let Some(err) = self.ctx.take_pending() {
            return Err(FfiError::new(ErrorKind::CallbackFailed {
                message: err.to_string(),
            })
            .with_context(format!("function '{}'", name)));
        }
        // SAFETY: ffi_call wrote a result of `result_ty` to `ret`
        unsafe { marshal::read_return(&self.ctx, result_ty, ret, false) }
    }
}
