//! The type system: registry, inheritance mutation, and lookup.

use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::Ordering::{AcqRel, Release};
use std::sync::Arc;

use crate::alloc::{GlobalAllocator, HostAllocator};
use crate::descriptor::{TypeDescriptor, TypeHandle, TypeInterface};
use crate::error::{TypeError, TypeResult};
use crate::interfaces::{
    AbstractTypeInterface, DynamicTypeInterface, LanguageObject, StructTypeInterface, TypeSizeMeta,
};
use crate::lock::{ConcurrentLockProvider, LockProvider, ScopedRead, ScopedWrite, SingleThread};
use crate::plugin::{PluginInterface, PluginOffset, StructPlugin};

/// Configuration consumed by [`TypeSystem::with_config`].
pub struct Config<L: LockProvider = SingleThread> {
    pub(crate) allocator: Arc<dyn HostAllocator>,
    pub(crate) locks: L,
}

impl Config<SingleThread> {
    /// A configuration with the defaults: the global allocator and no
    /// locking.
    pub fn new() -> Config<SingleThread> {
        Config {
            allocator: Arc::new(GlobalAllocator),
            locks: SingleThread,
        }
    }
}

impl Default for Config<SingleThread> {
    fn default() -> Config<SingleThread> {
        Config::new()
    }
}

impl<L: LockProvider> Config<L> {
    /// Replaces the allocator composite instances are carved from.
    pub fn allocator(mut self, allocator: Arc<dyn HostAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Replaces the lock provider. Choosing a
    /// [`ConcurrentLockProvider`] makes the resulting system `Sync`.
    pub fn lock_provider<L2: LockProvider>(self, locks: L2) -> Config<L2> {
        Config {
            allocator: self.allocator,
            locks,
        }
    }
}

/// A dynamic type system.
///
/// Owns the registry of types, computes composite layouts, and drives
/// instance lifecycles. Each system is fully independent: there is no
/// process-wide state, and instances must stay with the system that
/// constructed them (debug builds assert this through the RTTI header).
///
/// `S` is the host's opaque system-pointer type: a `&S` is threaded,
/// untouched, through every construct/destruct/size/assign callback so host
/// code can recover its context. `L` selects the lock provider.
pub struct TypeSystem<S: 'static, L: LockProvider = SingleThread> {
    /// Registered types in registration order. Guarded by `main_lock`; the
    /// parent links inside the entries are additionally guarded per
    /// descriptor.
    registry: UnsafeCell<Vec<TypeHandle<S, L>>>,
    pub(crate) main_lock: Option<L::Lock>,
    pub(crate) locks: L,
    pub(crate) allocator: Arc<dyn HostAllocator>,
}

unsafe impl<S, L> Send for TypeSystem<S, L>
where
    L: LockProvider + Send,
    L::Lock: Send + Sync,
{
}

// Sharing a system between threads requires locks that actually lock; the
// no-op provider stays single-threaded by construction.
unsafe impl<S, L> Sync for TypeSystem<S, L>
where
    L: ConcurrentLockProvider + Sync,
    L::Lock: Send + Sync,
{
}

impl<S: 'static> TypeSystem<S, SingleThread> {
    /// Creates a single-threaded type system with the default allocator.
    pub fn new() -> Self {
        TypeSystem::with_config(Config::new())
    }
}

impl<S> Default for TypeSystem<S, SingleThread> {
    fn default() -> Self {
        TypeSystem::new()
    }
}

impl<S: 'static, L: LockProvider> TypeSystem<S, L> {
    /// Creates a type system from `config`.
    pub fn with_config(config: Config<L>) -> Self {
        let main_lock = config.locks.create_lock();
        TypeSystem {
            registry: UnsafeCell::new(Vec::new()),
            main_lock,
            locks: config.locks,
            allocator: config.allocator,
        }
    }

    /// Registers a type named `name` under `parent` (or at the root) with a
    /// caller-supplied interface.
    ///
    /// Fails with [`TypeError::NameConflict`] if a type of that name already
    /// exists under the same parent.
    pub fn register_type(
        &self,
        name: &str,
        iface: Box<dyn TypeInterface<S>>,
        parent: Option<&TypeHandle<S, L>>,
    ) -> TypeResult<TypeHandle<S, L>> {
        let _registry_lock = ScopedWrite::new(&self.locks, self.main_lock.as_ref());
        let registry = unsafe { &mut *self.registry.get() };

        if Self::find_in(registry, name, parent).is_some() {
            return Err(TypeError::NameConflict(name.to_string()));
        }

        log::trace!("register type `{name}`");

        let ty = TypeHandle(Arc::new(TypeDescriptor::new(
            name.to_string(),
            iface,
            self.locks.create_lock(),
        )));

        if let Some(parent) = parent {
            {
                let _subject = ScopedWrite::new(&self.locks, ty.0.lock.as_ref());
                unsafe { ty.0.set_parent_unguarded(Some(parent.clone())) };
            }
            let _parent = ScopedWrite::new(&self.locks, parent.0.lock.as_ref());
            parent.0.child_count.fetch_add(1, AcqRel);
        }

        registry.push(ty.clone());
        Ok(ty)
    }

    /// Registers a constant-size struct type whose language object is `T`.
    pub fn register_struct_type<T>(
        &self,
        name: &str,
        parent: Option<&TypeHandle<S, L>>,
    ) -> TypeResult<TypeHandle<S, L>>
    where
        T: LanguageObject<S> + Send + Sync,
    {
        self.register_type(name, Box::new(StructTypeInterface::<T>::new()), parent)
    }

    /// Registers a struct type whose sizes come from `meta`.
    pub fn register_dynamic_struct_type<T>(
        &self,
        name: &str,
        meta: Arc<dyn TypeSizeMeta<S>>,
        parent: Option<&TypeHandle<S, L>>,
    ) -> TypeResult<TypeHandle<S, L>>
    where
        T: LanguageObject<S> + Send + Sync,
    {
        self.register_type(name, Box::new(DynamicTypeInterface::<S, T>::new(meta)), parent)
    }

    /// Registers an abstract type: construction and copy-construction fail
    /// with [`TypeError::AbstractConstruction`]. `T` fixes the size the type
    /// would report for construction parameters.
    pub fn register_abstract_type<T: 'static>(
        &self,
        name: &str,
        parent: Option<&TypeHandle<S, L>>,
    ) -> TypeResult<TypeHandle<S, L>> {
        let ty = self.register_type(name, Box::new(AbstractTypeInterface::<T>::new()), parent)?;
        ty.0.abstract_type.store(true, Release);
        Ok(ty)
    }

    /// Finds the direct child of `parent` (or the root type, for `None`)
    /// named `name`.
    ///
    /// Only direct children match; looking a name up anywhere along a chain
    /// is the caller's loop.
    pub fn find_type(
        &self,
        name: &str,
        parent: Option<&TypeHandle<S, L>>,
    ) -> Option<TypeHandle<S, L>> {
        let _registry_lock = ScopedRead::new(&self.locks, self.main_lock.as_ref());
        let registry = unsafe { &*self.registry.get() };
        Self::find_in(registry, name, parent).cloned()
    }

    // Linear scan; the caller holds the registry lock (either mode), which
    // is what makes the parent-link reads sound.
    fn find_in<'a>(
        registry: &'a [TypeHandle<S, L>],
        name: &str,
        parent: Option<&TypeHandle<S, L>>,
    ) -> Option<&'a TypeHandle<S, L>> {
        let parent = parent.map(TypeHandle::as_ptr);
        registry.iter().find(|ty| {
            (unsafe { ty.0.parent_ptr_unguarded() }) == parent && ty.name() == name
        })
    }

    /// Resolves a `::`-separated type path, token by token, starting at
    /// `base` (or the root scope).
    ///
    /// Every token must match a direct child of the previous one; any failed
    /// token makes the whole resolution `None`. An empty path resolves to
    /// `base`.
    pub fn resolve_path(
        &self,
        path: &str,
        base: Option<&TypeHandle<S, L>>,
    ) -> Option<TypeHandle<S, L>> {
        let mut current = base.cloned();
        for token in TypePathIter::new(path) {
            current = Some(self.find_type(token, current.as_ref())?);
        }
        current
    }

    /// Re-roots `ty` under `new_parent` (or makes it a root type).
    ///
    /// Fails with [`TypeError::NameConflict`] if a different type named like
    /// `ty` already lives under `new_parent`.
    ///
    /// # Panics
    ///
    /// Panics if `ty` is immutable, or if `new_parent` transitively inherits
    /// from `ty` — inheritance must stay acyclic.
    pub fn set_parent(
        &self,
        ty: &TypeHandle<S, L>,
        new_parent: Option<&TypeHandle<S, L>>,
    ) -> TypeResult<()> {
        assert!(
            !ty.is_immutable(),
            "cannot re-root type `{}` while it is referenced",
            ty.name()
        );

        let _registry_lock = ScopedWrite::new(&self.locks, self.main_lock.as_ref());
        let registry = unsafe { &*self.registry.get() };

        if let Some(new_parent) = new_parent {
            if let Some(existing) = Self::find_in(registry, ty.name(), Some(new_parent)) {
                if !existing.same_type(ty) {
                    return Err(TypeError::NameConflict(ty.name().to_string()));
                }
            }
        }

        let prev = unsafe { ty.0.parent_unguarded() };
        if prev.as_ref().map(TypeHandle::as_ptr) == new_parent.map(TypeHandle::as_ptr) {
            return Ok(());
        }

        if let Some(new_parent) = new_parent {
            assert!(
                !self.inherits_from_locked(ty, new_parent),
                "re-rooting `{}` under `{}` would create an inheritance cycle",
                ty.name(),
                new_parent.name()
            );
        }

        log::trace!(
            "re-root `{}` under {:?}",
            ty.name(),
            new_parent.map(TypeHandle::name)
        );

        // Per-descriptor write locks in address order; the registry write
        // lock is already held.
        let mut involved: Vec<&TypeDescriptor<S, L>> = Vec::with_capacity(3);
        involved.push(&ty.0);
        if let Some(prev) = &prev {
            involved.push(&prev.0);
        }
        if let Some(new_parent) = new_parent {
            involved.push(&new_parent.0);
        }
        involved.sort_by_key(|descriptor| *descriptor as *const TypeDescriptor<S, L> as usize);
        involved.dedup_by_key(|descriptor| *descriptor as *const TypeDescriptor<S, L>);
        let _guards: Vec<ScopedWrite<'_, L>> = involved
            .iter()
            .map(|descriptor| ScopedWrite::new(&self.locks, descriptor.lock.as_ref()))
            .collect();

        unsafe { ty.0.set_parent_unguarded(new_parent.cloned()) };
        if let Some(prev) = &prev {
            prev.0.child_count.fetch_sub(1, AcqRel);
        }
        if let Some(new_parent) = new_parent {
            new_parent.0.child_count.fetch_add(1, AcqRel);
        }
        Ok(())
    }

    /// Does `sub` inherit from `base`? A type inherits from itself.
    pub fn inherits_from(&self, base: &TypeHandle<S, L>, sub: &TypeHandle<S, L>) -> bool {
        if sub.same_type(base) {
            return true;
        }
        let mut current = {
            let _guard = ScopedRead::new(&self.locks, sub.0.lock.as_ref());
            unsafe { sub.0.parent_unguarded() }
        };
        while let Some(ty) = current {
            if ty.same_type(base) {
                return true;
            }
            current = {
                let _guard = ScopedRead::new(&self.locks, ty.0.lock.as_ref());
                unsafe { ty.0.parent_unguarded() }
            };
        }
        false
    }

    // Chain walk for callers already holding the registry lock.
    fn inherits_from_locked(&self, base: &TypeHandle<S, L>, sub: &TypeHandle<S, L>) -> bool {
        let mut current = Some(sub.clone());
        while let Some(ty) = current {
            if ty.same_type(base) {
                return true;
            }
            current = unsafe { ty.0.parent_unguarded() };
        }
        false
    }

    /// Identity comparison between two handles.
    pub fn same_type(&self, first: &TypeHandle<S, L>, second: &TypeHandle<S, L>) -> bool {
        first.same_type(second)
    }

    /// The parent `ty` currently inherits from.
    pub fn parent_of(&self, ty: &TypeHandle<S, L>) -> Option<TypeHandle<S, L>> {
        let _guard = ScopedRead::new(&self.locks, ty.0.lock.as_ref());
        unsafe { ty.0.parent_unguarded() }
    }

    /// Removes `ty` from the registry.
    ///
    /// Children of `ty` are re-rooted to `None` first, so `ty` may be
    /// deleted while it still has children. The caller must guarantee that
    /// no live instance references `ty` or any of its descendants.
    ///
    /// # Panics
    ///
    /// Panics if `ty` is referenced or is not registered in this system.
    pub fn delete_type(&self, ty: &TypeHandle<S, L>) {
        assert!(
            !ty.is_immutable(),
            "cannot delete type `{}` while it is referenced",
            ty.name()
        );

        let _registry_lock = ScopedWrite::new(&self.locks, self.main_lock.as_ref());
        let registry = unsafe { &mut *self.registry.get() };

        log::trace!("delete type `{}`", ty.name());

        // Detach from the parent.
        let prev = unsafe { ty.0.parent_unguarded() };
        if let Some(prev) = prev {
            {
                let _subject = ScopedWrite::new(&self.locks, ty.0.lock.as_ref());
                unsafe { ty.0.set_parent_unguarded(None) };
            }
            let _parent = ScopedWrite::new(&self.locks, prev.0.lock.as_ref());
            prev.0.child_count.fetch_sub(1, AcqRel);
        }

        // Re-root every child.
        for item in registry.iter() {
            if unsafe { item.0.parent_ptr_unguarded() } == Some(ty.as_ptr()) {
                assert!(
                    !item.is_immutable(),
                    "cannot delete type `{}`: its child `{}` is referenced",
                    ty.name(),
                    item.name()
                );
                let _child = ScopedWrite::new(&self.locks, item.0.lock.as_ref());
                unsafe { item.0.set_parent_unguarded(None) };
                ty.0.child_count.fetch_sub(1, AcqRel);
            }
        }
        debug_assert_eq!(ty.child_count(), 0);

        let index = registry
            .iter()
            .position(|item| item.same_type(ty))
            .expect("type is not registered in this system");
        registry.remove(index);
    }

    /// Iterates over every registered type.
    ///
    /// The iterator holds the registry read lock for its whole lifetime, so
    /// the set of types cannot change underneath it.
    pub fn types(&self) -> TypeIter<'_, S, L> {
        let lock = ScopedRead::new(&self.locks, self.main_lock.as_ref());
        let types = unsafe { (*self.registry.get()).clone() };
        TypeIter {
            _registry_lock: lock,
            types,
            next: 0,
        }
    }

    /// Deletes every remaining type, re-rooting children to `None` before
    /// their parent goes away. Called automatically on drop.
    pub fn shutdown(&self) {
        loop {
            let first = {
                let _registry_lock = ScopedRead::new(&self.locks, self.main_lock.as_ref());
                unsafe { (*self.registry.get()).first().cloned() }
            };
            match first {
                Some(ty) => self.delete_type(&ty),
                None => break,
            }
        }
    }

    /// Registers a `size`-byte plugin block on `ty` with a caller-supplied
    /// interface. The registry owns the interface and drops it on
    /// unregistration.
    ///
    /// # Panics
    ///
    /// Panics if `ty` is immutable.
    pub fn register_plugin(
        &self,
        ty: &TypeHandle<S, L>,
        size: usize,
        id: u32,
        iface: Box<dyn PluginInterface<S>>,
    ) -> PluginOffset {
        let _guard = ScopedWrite::new(&self.locks, ty.0.lock.as_ref());
        assert!(
            !ty.is_immutable(),
            "cannot register a plugin on type `{}` while it is referenced",
            ty.name()
        );
        log::trace!("register {size}-byte plugin {id:#x} on `{}`", ty.name());
        unsafe { ty.0.plugins_mut_unguarded() }.register(size, id, iface)
    }

    /// Registers a plugin that default-constructs a `P` into every instance
    /// of `ty` (and of every type inheriting from it); assignment clones.
    pub fn register_struct_plugin<P>(&self, ty: &TypeHandle<S, L>, id: u32) -> PluginOffset
    where
        P: Default + Clone + Send + Sync + 'static,
    {
        self.register_plugin(ty, mem::size_of::<P>(), id, Box::new(StructPlugin::<P>::new()))
    }

    /// Like [`register_struct_plugin`](Self::register_struct_plugin), but
    /// reserves `size` bytes instead of `P`'s own size (for trailing
    /// host-managed space).
    pub fn register_dependant_struct_plugin<P>(
        &self,
        ty: &TypeHandle<S, L>,
        id: u32,
        size: usize,
    ) -> PluginOffset
    where
        P: Default + Clone + Send + Sync + 'static,
    {
        assert!(size >= mem::size_of::<P>());
        self.register_plugin(ty, size, id, Box::new(StructPlugin::<P>::new()))
    }

    /// Removes the plugin registered at `offset` from `ty`, dropping its
    /// interface.
    ///
    /// # Panics
    ///
    /// Panics if `ty` is immutable or no plugin lives at `offset`.
    pub fn unregister_plugin(&self, ty: &TypeHandle<S, L>, offset: PluginOffset) {
        let _guard = ScopedWrite::new(&self.locks, ty.0.lock.as_ref());
        assert!(
            !ty.is_immutable(),
            "cannot unregister a plugin on type `{}` while it is referenced",
            ty.name()
        );
        unsafe { ty.0.plugins_mut_unguarded() }.unregister(offset);
    }
}

impl<S: 'static, L: LockProvider> Drop for TypeSystem<S, L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Iterator over the registered types of a [`TypeSystem`].
///
/// Returned by [`TypeSystem::types`]; holds the registry read lock until
/// dropped.
pub struct TypeIter<'a, S: 'static, L: LockProvider = SingleThread> {
    _registry_lock: ScopedRead<'a, L>,
    types: Vec<TypeHandle<S, L>>,
    next: usize,
}

impl<S: 'static, L: LockProvider> Iterator for TypeIter<'_, S, L> {
    type Item = TypeHandle<S, L>;

    fn next(&mut self) -> Option<TypeHandle<S, L>> {
        let item = self.types.get(self.next)?.clone();
        self.next += 1;
        Some(item)
    }
}

/// Tokenizer for `::`-separated type paths.
///
/// Yields every token, including interior empty ones (which never match a
/// registered name); a single trailing separator terminates iteration.
pub struct TypePathIter<'a> {
    rest: Option<&'a str>,
}

impl<'a> TypePathIter<'a> {
    /// Creates a tokenizer over `path`.
    pub fn new(path: &'a str) -> Self {
        TypePathIter {
            rest: (!path.is_empty()).then_some(path),
        }
    }
}

impl<'a> Iterator for TypePathIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let rest = self.rest?;
        match rest.find("::") {
            Some(split) => {
                self.rest = Some(&rest[split + 2..]);
                Some(&rest[..split])
            }
            None => {
                self.rest = None;
                (!rest.is_empty()).then_some(rest)
            }
        }
    }
}
