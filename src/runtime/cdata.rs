//! Value boxes: a type node paired with native-layout bytes
//!
//! Storage is one of three shapes. `Owned` memory is allocated zeroed and
//! freed when the box drops. `Borrowed` memory belongs to someone else (a
//! parent box, a global, a native buffer) and is never freed here. `Frame`
//! holds a callable: the native code pointer plus the call machinery, and
//! possibly a trampoline this box owns.
//!
//! Anchors written through a field or element are keyed by the address of
//! the slot, so overwriting a slot releases whatever it pointed into.

use crate::core::{CKind, TypeNode};
use crate::errors::{ErrorKind, FfiError, Result};
use crate::interop::call::CallFrame;
use crate::interop::closure::ClosureRef;
use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use tracing::trace;

/// Alignment of every owned allocation, at least `max_align_t`
pub const MIN_ALIGN: usize = 16;

/// Zeroed heap block with a fixed layout
pub(crate) struct NativeBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl NativeBuffer {
    pub(crate) fn zeroed(size: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), align.max(MIN_ALIGN))
            .map_err(|_| FfiError::range(size, "native allocation"))?;
        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| FfiError::range(size, "native allocation"))?;
        Ok(Self { ptr, layout })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Something a box keeps alive because its bytes point into it
pub(crate) enum Anchor {
    Value(Rc<ValueBox>),
    /// NUL-terminated copy of a host string
    Bytes(Box<[u8]>),
    Buffer(NativeBuffer),
}

#[derive(Default)]
struct Anchors {
    /// Taken at construction, released with the box
    fixed: Vec<Anchor>,
    /// Keyed by the address of the slot that points into them
    slots: BTreeMap<usize, Vec<Anchor>>,
}

impl Anchors {
    fn len(&self) -> usize {
        self.fixed.len() + self.slots.values().map(Vec::len).sum::<usize>()
    }
}

/// Host hook run once when a box is reclaimed
pub type Finalizer = Box<dyn FnOnce(&ValueBox)>;

pub(crate) enum Storage {
    Owned(NativeBuffer),
    Borrowed {
        ptr: *mut u8,
        len: usize,
        _parent: Option<Rc<ValueBox>>,
    },
    Frame(RefCell<CallFrame>),
}

pub struct ValueBox {
    ty: TypeNode,
    storage: Storage,
    anchors: RefCell<Anchors>,
    finalizer: RefCell<Option<Finalizer>>,
}

impl ValueBox {
    /// Zeroed owned storage of `size` bytes
    pub(crate) fn owned(ty: TypeNode, size: usize) -> Result<Self> {
        let align = match ty.kind() {
            CKind::Function | CKind::Void => 1,
            _ => ty.alignment().unwrap_or(1),
        };
        let buffer = NativeBuffer::zeroed(size, align)?;
        trace!(ty = %ty, size, "value box allocated");
        Ok(Self {
            ty,
            storage: Storage::Owned(buffer),
            anchors: RefCell::default(),
            finalizer: RefCell::new(None),
        })
    }

    /// View onto memory owned elsewhere; `parent` is kept alive if given
    pub(crate) fn borrowed(
        ty: TypeNode,
        ptr: *mut u8,
        len: usize,
        parent: Option<Rc<ValueBox>>,
    ) -> Self {
        Self {
            ty,
            storage: Storage::Borrowed {
                ptr,
                len,
                _parent: parent,
            },
            anchors: RefCell::default(),
            finalizer: RefCell::new(None),
        }
    }

    pub(crate) fn callable(ty: TypeNode, frame: CallFrame) -> Self {
        Self {
            ty,
            storage: Storage::Frame(RefCell::new(frame)),
            anchors: RefCell::default(),
            finalizer: RefCell::new(None),
        }
    }

    pub fn type_node(&self) -> &TypeNode {
        &self.ty
    }

    /// Start of the native-layout bytes. For callables this is the slot
    /// holding the code pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        match &self.storage {
            Storage::Owned(buf) => buf.as_ptr(),
            Storage::Borrowed { ptr, .. } => *ptr,
            Storage::Frame(frame) => {
                if let Ok(mut f) = frame.try_borrow_mut() {
                    f.forget_released();
                }
                // SAFETY: only the address of the field is taken
                unsafe { ptr::addr_of_mut!((*frame.as_ptr()).sym) as *mut u8 }
            }
        }
    }

    /// Size of the storage in bytes
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Owned(buf) => buf.len(),
            Storage::Borrowed { len, .. } => *len,
            Storage::Frame(_) => std::mem::size_of::<*const c_void>(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the bytes belong to someone else
    pub fn is_weak(&self) -> bool {
        matches!(self.storage, Storage::Borrowed { .. })
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.storage, Storage::Frame(_))
    }

    pub(crate) fn frame(&self) -> Option<&RefCell<CallFrame>> {
        match &self.storage {
            Storage::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    /// Native function pointer of a callable box; null once the
    /// trampoline it aliases has been torn down
    pub fn code_ptr(&self) -> Option<*const c_void> {
        self.frame().map(|f| f.borrow().live_sym().unwrap_or(ptr::null()))
    }

    /// Code pointer for handing to native code; fails instead of yielding
    /// the address of a released trampoline
    pub(crate) fn live_code(&self) -> Result<*mut c_void> {
        match self.frame() {
            Some(frame) => frame
                .borrow()
                .live_sym()
                .map(|sym| sym as *mut c_void)
                .ok_or_else(|| FfiError::new(ErrorKind::ClosureReleased)),
            None => Ok(self.address()),
        }
    }

    /// Weak handle on the trampoline this box owns or aliases; reads as
    /// absent once the owning box is gone
    pub fn closure_ref(&self) -> Option<ClosureRef> {
        self.frame().and_then(|f| f.borrow().share_closure())
    }

    /// Whether this box owns a trampoline
    pub fn owns_closure(&self) -> bool {
        self.frame().map_or(false, |f| f.borrow().closure.is_some())
    }

    /// The address this value denotes: the pointer stored in a pointer box,
    /// the code pointer of a callable, the storage itself otherwise.
    pub fn address(&self) -> *mut c_void {
        match &self.storage {
            Storage::Frame(frame) => frame.borrow().live_sym().unwrap_or(ptr::null()) as *mut c_void,
            _ if matches!(self.ty.kind(), CKind::Pointer | CKind::VaList) => {
                self.read::<*mut c_void>(0).unwrap_or(ptr::null_mut())
            }
            _ => self.as_ptr() as *mut c_void,
        }
    }

    /// Bounds-checked unaligned read
    pub fn read<T: Copy>(&self, offset: usize) -> Option<T> {
        let end = offset.checked_add(std::mem::size_of::<T>())?;
        if end > self.len() {
            return None;
        }
        // SAFETY: range checked against the storage size
        Some(unsafe { ptr::read_unaligned(self.as_ptr().add(offset) as *const T) })
    }

    /// Bounds-checked unaligned write; false when out of range
    pub fn write<T: Copy>(&self, offset: usize, value: T) -> bool {
        let end = match offset.checked_add(std::mem::size_of::<T>()) {
            Some(end) => end,
            None => return false,
        };
        if end > self.len() || self.is_callable() {
            return false;
        }
        // SAFETY: range checked against the storage size
        unsafe { ptr::write_unaligned(self.as_ptr().add(offset) as *mut T, value) };
        true
    }

    /// Copy of the native bytes
    pub fn bytes(&self) -> Vec<u8> {
        if self.len() == 0 || self.as_ptr().is_null() {
            return Vec::new();
        }
        // SAFETY: storage is valid for `len` bytes
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()).to_vec() }
    }

    pub(crate) fn anchor_all(&self, anchors: Vec<Anchor>) {
        if !anchors.is_empty() {
            self.anchors.borrow_mut().fixed.extend(anchors);
        }
    }

    /// Replace whatever the slot at `at` kept alive with `anchors`
    pub(crate) fn anchor_slot(&self, at: *const u8, anchors: Vec<Anchor>) {
        let mut held = self.anchors.borrow_mut();
        if anchors.is_empty() {
            held.slots.remove(&(at as usize));
        } else {
            held.slots.insert(at as usize, anchors);
        }
    }

    /// Number of values this box keeps alive
    pub fn anchor_count(&self) -> usize {
        self.anchors.borrow().len()
    }

    /// Run `finalizer` when the box is reclaimed, before its storage is
    /// freed. A later call replaces an earlier hook; `None` removes it.
    pub fn set_finalizer(&self, finalizer: Option<Finalizer>) {
        *self.finalizer.borrow_mut() = finalizer;
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizer.borrow().is_some()
    }
}

impl Drop for ValueBox {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.get_mut().take() {
            finalizer(&*self);
        }
        // A trampoline goes first so nothing can reach it through memory
        // that is about to be freed.
        if let Storage::Frame(frame) = &self.storage {
            frame.borrow_mut().release_closure();
        }
        trace!(ty = %self.ty, len = self.len(), weak = self.is_weak(), "value box finalized");
    }
}

impl std::fmt::Debug for ValueBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueBox")
            .field("ty", &self.ty.to_string())
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .field("weak", &self.is_weak())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_is_zeroed_and_aligned() {
        let b = ValueBox::owned(TypeNode::builtin(CKind::Double), 8).unwrap();
        assert_eq!(b.read::<f64>(0), Some(0.0));
        assert_eq!(b.as_ptr() as usize % MIN_ALIGN, 0);
        assert!(!b.is_weak());
    }

    #[test]
    fn test_bounds_checked_access() {
        let b = ValueBox::owned(TypeNode::builtin(CKind::Int), 4).unwrap();
        assert!(b.write::<i32>(0, -5));
        assert_eq!(b.read::<i32>(0), Some(-5));
        assert!(b.read::<u64>(0).is_none());
        assert!(!b.write::<u32>(2, 1));
    }

    #[test]
    fn test_borrowed_keeps_parent_alive() {
        let parent = Rc::new(ValueBox::owned(TypeNode::array_of(TypeNode::builtin(CKind::Int), 2), 8).unwrap());
        parent.write::<i32>(4, 77);
        let view = ValueBox::borrowed(
            TypeNode::builtin(CKind::Int),
            unsafe { parent.as_ptr().add(4) },
            4,
            Some(parent.clone()),
        );
        drop(parent);
        assert!(view.is_weak());
        assert_eq!(view.read::<i32>(0), Some(77));
    }

    #[test]
    fn test_pointer_box_address() {
        let ty = TypeNode::pointer_to(TypeNode::void());
        let b = ValueBox::owned(ty, std::mem::size_of::<usize>()).unwrap();
        b.write::<usize>(0, 0x1000);
        assert_eq!(b.address() as usize, 0x1000);
    }
}
