//! Type descriptors, handles, and the RTTI prefix of every composite.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{
    AtomicBool, AtomicUsize,
    Ordering::{AcqRel, Acquire, Release},
};
use std::sync::Arc;

use crate::error::TypeResult;
use crate::lock::{LockProvider, SingleThread};
use crate::plugin::PluginRegistry;

/// Lifecycle and sizing callbacks for one registered type's language object.
///
/// An interface is supplied per [`register_type`] call and is owned by the
/// descriptor; it is dropped when the last [`TypeHandle`] goes away. The
/// convenience registrations ([`register_struct_type`] and friends)
/// synthesize one from the safe [`LanguageObject`] trait.
///
/// # Safety
///
/// `construct` and `copy_construct` must initialize exactly the bytes
/// reported by the corresponding size method, `destruct` must release
/// whatever they acquired, and the reported sizes are immutable: once a size
/// has been returned for given parameters or a given live instance, the same
/// value must be returned forever after. All sizes must be multiples of
/// [`OBJECT_ALIGNMENT`](crate::OBJECT_ALIGNMENT) (zero meaning "refuse
/// construction").
///
/// [`register_type`]: crate::TypeSystem::register_type
/// [`register_struct_type`]: crate::TypeSystem::register_struct_type
/// [`LanguageObject`]: crate::LanguageObject
pub unsafe trait TypeInterface<S>: Send + Sync {
    /// Constructs the language object in `mem` from `params`.
    fn construct(&self, mem: NonNull<u8>, sys: &S, params: Option<&dyn Any>) -> TypeResult<()>;

    /// Copy-constructs into `mem` from the live language object at `src`.
    fn copy_construct(&self, mem: NonNull<u8>, src: NonNull<u8>) -> TypeResult<()>;

    /// Destroys the language object at `mem`. Must not fail.
    fn destruct(&self, mem: NonNull<u8>);

    /// Size of the language object `construct` would build from `params`.
    fn size_from_params(&self, sys: &S, params: Option<&dyn Any>) -> usize;

    /// Size of the live language object at `obj`.
    fn size_from_instance(&self, sys: &S, obj: NonNull<u8>) -> usize;
}

/// One node of the type graph.
///
/// Interior state is split between atomics (the counters and flags, which
/// the original-style accessors mutate without a full lock) and
/// `UnsafeCell`s guarded by `lock` / the global registry lock. All guarded
/// access flows through [`TypeSystem`](crate::TypeSystem), which owns the
/// lock provider.
pub(crate) struct TypeDescriptor<S: 'static, L: LockProvider> {
    pub(crate) name: String,
    pub(crate) iface: Box<dyn TypeInterface<S>>,
    /// Live instances plus explicit references. Nonzero makes the
    /// descriptor immutable.
    pub(crate) ref_count: AtomicUsize,
    /// Number of descriptors whose parent link points here.
    pub(crate) child_count: AtomicUsize,
    pub(crate) exclusive: AtomicBool,
    pub(crate) abstract_type: AtomicBool,
    /// Written only while holding the global registry write lock plus the
    /// affected descriptors' write locks; readable under either.
    parent: UnsafeCell<Option<TypeHandle<S, L>>>,
    /// Guarded by `lock`.
    plugins: UnsafeCell<PluginRegistry<S>>,
    pub(crate) lock: Option<L::Lock>,
}

// The cells above are only reached through `TypeSystem`, whose `Sync` impl
// requires a `ConcurrentLockProvider`; under the no-op provider the system
// is confined to one thread, and under a real provider the lock discipline
// serializes cell access.
unsafe impl<S, L: LockProvider> Send for TypeDescriptor<S, L> where L::Lock: Send {}
unsafe impl<S, L: LockProvider> Sync for TypeDescriptor<S, L> where L::Lock: Send + Sync {}

impl<S, L: LockProvider> TypeDescriptor<S, L> {
    pub(crate) fn new(
        name: String,
        iface: Box<dyn TypeInterface<S>>,
        lock: Option<L::Lock>,
    ) -> Self {
        TypeDescriptor {
            name,
            iface,
            ref_count: AtomicUsize::new(0),
            child_count: AtomicUsize::new(0),
            exclusive: AtomicBool::new(false),
            abstract_type: AtomicBool::new(false),
            parent: UnsafeCell::new(None),
            plugins: UnsafeCell::new(PluginRegistry::new()),
            lock,
        }
    }

    /// Increment the reference count, pinning this descriptor immutable.
    pub(crate) fn incref(&self, why: &str) {
        let old_count = self.ref_count.fetch_add(1, AcqRel);
        log::trace!(
            "increment ref count for `{}` (refs -> {}): {why}",
            self.name,
            old_count + 1
        );
    }

    /// Decrement the reference count, possibly making the descriptor
    /// mutable again.
    pub(crate) fn decref(&self, why: &str) {
        let old_count = self.ref_count.fetch_sub(1, AcqRel);
        assert_ne!(
            old_count, 0,
            "type `{}` dereferenced with no live references",
            self.name
        );
        log::trace!(
            "decrement ref count for `{}` (refs -> {}): {why}",
            self.name,
            old_count - 1
        );
    }

    /// # Safety
    ///
    /// The caller must hold this descriptor's lock (read suffices) or the
    /// global registry lock.
    pub(crate) unsafe fn parent_unguarded(&self) -> Option<TypeHandle<S, L>> {
        unsafe { (*self.parent.get()).clone() }
    }

    /// # Safety
    ///
    /// As [`parent_unguarded`](Self::parent_unguarded).
    pub(crate) unsafe fn parent_ptr_unguarded(&self) -> Option<*const TypeDescriptor<S, L>> {
        unsafe { (*self.parent.get()).as_ref().map(TypeHandle::as_ptr) }
    }

    /// # Safety
    ///
    /// The caller must hold the global registry write lock and this
    /// descriptor's write lock.
    pub(crate) unsafe fn set_parent_unguarded(&self, parent: Option<TypeHandle<S, L>>) {
        unsafe { *self.parent.get() = parent }
    }

    /// # Safety
    ///
    /// The caller must hold this descriptor's lock (read suffices).
    pub(crate) unsafe fn plugins_unguarded(&self) -> &PluginRegistry<S> {
        unsafe { &*self.plugins.get() }
    }

    /// # Safety
    ///
    /// The caller must hold this descriptor's write lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn plugins_mut_unguarded(&self) -> &mut PluginRegistry<S> {
        unsafe { &mut *self.plugins.get() }
    }
}

/// Shared reference to a registered type.
///
/// Handles are cheap to clone and compare by identity: two handles are the
/// same type exactly when they point at the same descriptor. A handle keeps
/// the descriptor's memory alive but does *not* count as a reference in the
/// [`ref_count`](Self::ref_count) sense — only instances and
/// [`reference_type`](crate::TypeSystem::reference_type) do that.
pub struct TypeHandle<S: 'static, L: LockProvider = SingleThread>(pub(crate) Arc<TypeDescriptor<S, L>>);

impl<S, L: LockProvider> Clone for TypeHandle<S, L> {
    fn clone(&self) -> Self {
        TypeHandle(self.0.clone())
    }
}

impl<S, L: LockProvider> PartialEq for TypeHandle<S, L> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<S, L: LockProvider> Eq for TypeHandle<S, L> {}

impl<S, L: LockProvider> std::hash::Hash for TypeHandle<S, L> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state);
    }
}

impl<S, L: LockProvider> fmt::Debug for TypeHandle<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeHandle")
            .field("name", &self.name())
            .field("ref_count", &self.ref_count())
            .field("child_count", &self.child_count())
            .finish_non_exhaustive()
    }
}

impl<S, L: LockProvider> TypeHandle<S, L> {
    /// The name this type was registered under.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Number of live instances plus explicit references.
    pub fn ref_count(&self) -> usize {
        self.0.ref_count.load(Acquire)
    }

    /// Number of types whose parent is this type.
    pub fn child_count(&self) -> usize {
        self.0.child_count.load(Acquire)
    }

    /// A referenced type is immutable: it cannot be re-rooted and its
    /// plugin set cannot change.
    pub fn is_immutable(&self) -> bool {
        self.ref_count() != 0
    }

    /// Does any registered type inherit from this one?
    pub fn is_end_type(&self) -> bool {
        self.child_count() == 0
    }

    /// Was this type registered through
    /// [`register_abstract_type`](crate::TypeSystem::register_abstract_type)?
    pub fn is_abstract(&self) -> bool {
        self.0.abstract_type.load(Acquire)
    }

    /// The host-visible exclusivity flag.
    pub fn is_exclusive(&self) -> bool {
        self.0.exclusive.load(Acquire)
    }

    /// Sets the host-visible exclusivity flag.
    pub fn set_exclusive(&self, exclusive: bool) {
        self.0.exclusive.store(exclusive, Release);
    }

    /// Identity comparison; equivalent to `self == other`.
    pub fn same_type(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn as_ptr(&self) -> *const TypeDescriptor<S, L> {
        Arc::as_ptr(&self.0)
    }
}

/// The RTTI prefix record at offset zero of every composite.
///
/// One machine word — the descriptor pointer — plus, in debug builds only,
/// a back-pointer to the owning [`TypeSystem`](crate::TypeSystem) used to
/// catch instances crossing between systems.
#[repr(C)]
pub struct RttiHeader<S: 'static, L: LockProvider = SingleThread> {
    #[cfg(debug_assertions)]
    pub(crate) system: *const (),
    pub(crate) descriptor: *const TypeDescriptor<S, L>,
}

pub(crate) fn header_size<S: 'static, L: LockProvider>() -> usize {
    mem::size_of::<RttiHeader<S, L>>()
}

/// Owning handle to one composite instance.
///
/// `Composite` is a raw handle in the same spirit as an instance pointer:
/// it is `Copy`, dropping it does nothing, and the underlying memory lives
/// until [`destroy`](crate::TypeSystem::destroy) (or, for placement
/// construction, until the caller reclaims the buffer after
/// [`destroy_placement`](crate::TypeSystem::destroy_placement)). Using a
/// handle after that point is undefined behavior, which is why every
/// operation consuming one is `unsafe`.
pub struct Composite<S: 'static, L: LockProvider = SingleThread> {
    pub(crate) rtti: NonNull<RttiHeader<S, L>>,
}

impl<S, L: LockProvider> Clone for Composite<S, L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, L: LockProvider> Copy for Composite<S, L> {}

impl<S, L: LockProvider> fmt::Debug for Composite<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Composite").field(&self.rtti).finish()
    }
}

// A composite is just an address; whether the pointed-to instance may be
// touched from several threads is decided by the host objects stored in it
// and by the lock provider of the owning system.
unsafe impl<S, L: LockProvider> Send for Composite<S, L> {}
unsafe impl<S, L: LockProvider> Sync for Composite<S, L> {}

impl<S, L: LockProvider> Composite<S, L> {
    /// Address of the allocation (the RTTI header comes first).
    pub fn as_ptr(&self) -> *mut u8 {
        self.rtti.as_ptr().cast()
    }

    /// Pointer to the language object, stored immediately after the header.
    pub fn object_ptr(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.as_ptr().add(header_size::<S, L>())) }
    }

    /// Recovers the composite handle from a language-object pointer obtained
    /// through [`object_ptr`](Self::object_ptr).
    ///
    /// # Safety
    ///
    /// `obj` must be the language-object pointer of a live composite.
    pub unsafe fn from_object_ptr(obj: NonNull<u8>) -> Self {
        let header = unsafe { obj.as_ptr().sub(header_size::<S, L>()) };
        Composite {
            rtti: unsafe { NonNull::new_unchecked(header.cast()) },
        }
    }

    pub(crate) fn header(&self) -> NonNull<RttiHeader<S, L>> {
        self.rtti
    }
}
