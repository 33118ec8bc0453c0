//! Instance lifecycle: construct, clone, destroy.
//!
//! Construction walks the inheritance chain twice — plugin blocks are
//! constructed root-first, torn down leaf-first — and every failure path
//! unwinds whatever was already built, so callers observe either a finished
//! composite or no side effects at all. The chain is referenced before any
//! layout decision is made, which freezes the layout for the lifetime of
//! the instance.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::descriptor::{Composite, RttiHeader, TypeHandle};
use crate::error::TypeResult;
use crate::layout::composite_layout;
use crate::lock::{LockProvider, ScopedRead, ScopedWrite};
use crate::system::TypeSystem;

fn block_ptr<S, L: LockProvider>(obj: Composite<S, L>, base: usize) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(obj.as_ptr().add(base)) }
}

impl<S, L: LockProvider> TypeSystem<S, L> {
    /// Takes an explicit reference on `ty` and every ancestor, pinning the
    /// whole chain immutable until a matching
    /// [`dereference_type`](Self::dereference_type).
    pub fn reference_type(&self, ty: &TypeHandle<S, L>) {
        let _ = self.reference_chain(ty);
    }

    /// Releases a reference taken with
    /// [`reference_type`](Self::reference_type).
    ///
    /// # Panics
    ///
    /// Panics if any type on the chain has no outstanding references.
    pub fn dereference_type(&self, ty: &TypeHandle<S, L>) {
        self.dereference_chain(&self.chain_of(ty));
    }

    // References leaf-first and returns the chain root-first. Once a type's
    // count is up its parent link is frozen, so the walk sees a consistent
    // chain even while other threads construct concurrently.
    pub(crate) fn reference_chain(&self, ty: &TypeHandle<S, L>) -> Vec<TypeHandle<S, L>> {
        let mut chain = Vec::new();
        let mut current = Some(ty.clone());
        while let Some(t) = current {
            current = {
                let _guard = ScopedWrite::new(&self.locks, t.0.lock.as_ref());
                t.0.incref("referencing inheritance chain");
                unsafe { t.0.parent_unguarded() }
            };
            chain.push(t);
        }
        chain.reverse();
        chain
    }

    // Dereferences root-first, mirroring how the references were taken.
    pub(crate) fn dereference_chain(&self, chain: &[TypeHandle<S, L>]) {
        for ty in chain {
            let _guard = ScopedWrite::new(&self.locks, ty.0.lock.as_ref());
            ty.0.decref("releasing inheritance chain");
        }
    }

    /// Constructs a new composite of `ty` from `params`.
    ///
    /// Returns `Ok(None)` — with all side effects rolled back — when the
    /// type reports size zero, the allocator refuses the request, or a
    /// plugin block declines construction. Structured failures from the
    /// language interface (abstract type, construction error) come back as
    /// `Err`, likewise fully rolled back.
    pub fn construct(
        &self,
        sys: &S,
        ty: &TypeHandle<S, L>,
        params: Option<&dyn Any>,
    ) -> TypeResult<Option<Composite<S, L>>> {
        // Pin the chain so the layout cannot change between the size
        // computation and placement construction.
        let chain = self.reference_chain(ty);

        let result = (|| {
            let size = self.composite_size_for(sys, ty, params);
            if size == 0 {
                return Ok(None);
            }
            let layout = composite_layout(size);
            let Some(mem) = self.allocator.allocate(layout) else {
                return Ok(None);
            };
            match unsafe { self.construct_placement(sys, mem, ty, params) } {
                Ok(Some(obj)) => Ok(Some(obj)),
                failed => {
                    unsafe { self.allocator.deallocate(mem, layout) };
                    failed
                }
            }
        })();

        self.dereference_chain(&chain);
        result
    }

    /// Constructs a composite of `ty` in caller-provided memory.
    ///
    /// On success the buffer holds a live composite and the chain stays
    /// referenced until [`destroy_placement`](Self::destroy_placement); on
    /// failure the buffer is back to meaningless bytes.
    ///
    /// # Safety
    ///
    /// `mem` must be valid for [`composite_size_for`](Self::composite_size_for)
    /// bytes at [`OBJECT_ALIGNMENT`](crate::OBJECT_ALIGNMENT), and the
    /// caller must not touch it until the composite is destroyed.
    pub unsafe fn construct_placement(
        &self,
        sys: &S,
        mem: NonNull<u8>,
        ty: &TypeHandle<S, L>,
        params: Option<&dyn Any>,
    ) -> TypeResult<Option<Composite<S, L>>> {
        let chain = self.reference_chain(ty);
        let obj = unsafe { self.write_header(mem, ty) };

        if let Err(error) = ty.0.iface.construct(obj.object_ptr(), sys, params) {
            self.dereference_chain(&chain);
            return Err(error);
        }

        let bases = self.block_bases(sys, &chain, obj);
        if !self.construct_plugins(sys, &chain, &bases, obj) {
            ty.0.iface.destruct(obj.object_ptr());
            self.dereference_chain(&chain);
            return Ok(None);
        }

        log::trace!("constructed instance of `{}`", ty.name());
        Ok(Some(obj))
    }

    /// Clones the live composite `src` into a fresh allocation.
    ///
    /// Fails with [`TypeError::UndefinedMethod`] if the language object does
    /// not support copy-construction; returns `Ok(None)` when the allocator
    /// refuses or any plugin declines construction or assignment. All
    /// failures unwind completely.
    ///
    /// [`TypeError::UndefinedMethod`]: crate::TypeError::UndefinedMethod
    ///
    /// # Safety
    ///
    /// `src` must be a live composite owned by this system.
    pub unsafe fn clone_object(
        &self,
        sys: &S,
        src: Composite<S, L>,
    ) -> TypeResult<Option<Composite<S, L>>> {
        self.debug_check_owner(src);
        // The size an instance takes is immutable, so it is also the size of
        // its clone.
        let size = unsafe { self.composite_size_of(sys, src) };
        if size == 0 {
            return Ok(None);
        }
        let layout = composite_layout(size);
        let Some(mem) = self.allocator.allocate(layout) else {
            return Ok(None);
        };
        match unsafe { self.clone_placement(sys, mem, src) } {
            Ok(Some(obj)) => Ok(Some(obj)),
            failed => {
                unsafe { self.allocator.deallocate(mem, layout) };
                failed
            }
        }
    }

    /// Clones the live composite `src` into caller-provided memory.
    ///
    /// # Safety
    ///
    /// `src` must be a live composite owned by this system, and `mem` must
    /// be valid for [`composite_size_of`](Self::composite_size_of) bytes at
    /// [`OBJECT_ALIGNMENT`](crate::OBJECT_ALIGNMENT) and untouched by the
    /// caller until the clone is destroyed.
    pub unsafe fn clone_placement(
        &self,
        sys: &S,
        mem: NonNull<u8>,
        src: Composite<S, L>,
    ) -> TypeResult<Option<Composite<S, L>>> {
        self.debug_check_owner(src);
        let ty = unsafe { self.type_of(src) };
        let chain = self.reference_chain(&ty);
        let obj = unsafe { self.write_header(mem, &ty) };

        if let Err(error) = ty.0.iface.copy_construct(obj.object_ptr(), src.object_ptr()) {
            self.dereference_chain(&chain);
            return Err(error);
        }

        let bases = self.block_bases(sys, &chain, obj);
        if !self.construct_plugins(sys, &chain, &bases, obj) {
            ty.0.iface.destruct(obj.object_ptr());
            self.dereference_chain(&chain);
            return Ok(None);
        }

        // Plugins start out freshly constructed; now bring their state over.
        // Any refusal unwinds the entire clone.
        if !self.assign_plugins(sys, &chain, &bases, obj, src) {
            self.destroy_plugins(sys, &chain, &bases, obj);
            ty.0.iface.destruct(obj.object_ptr());
            self.dereference_chain(&chain);
            return Ok(None);
        }

        log::trace!("cloned instance of `{}`", ty.name());
        Ok(Some(obj))
    }

    /// Destroys the composite in place; the memory itself is not freed.
    ///
    /// Plugins go down leaf-first, then the language object, then the
    /// chain's references. Destruction is infallible.
    ///
    /// # Safety
    ///
    /// `obj` must be a live composite owned by this system. Afterwards the
    /// buffer no longer holds a composite and may be reclaimed by whoever
    /// owns it.
    pub unsafe fn destroy_placement(&self, sys: &S, obj: Composite<S, L>) {
        self.debug_check_owner(obj);
        let ty = unsafe { self.type_of(obj) };
        let chain = self.chain_of(&ty);
        let bases = self.block_bases(sys, &chain, obj);

        self.destroy_plugins(sys, &chain, &bases, obj);
        ty.0.iface.destruct(obj.object_ptr());
        self.dereference_chain(&chain);
        log::trace!("destroyed instance of `{}`", ty.name());
    }

    /// Destroys `obj` and frees its memory through the host allocator.
    ///
    /// # Safety
    ///
    /// `obj` must be a live composite created by [`construct`](Self::construct)
    /// or [`clone_object`](Self::clone_object) on this system.
    pub unsafe fn destroy(&self, sys: &S, obj: Composite<S, L>) {
        // The allocation size is an immutable property of the instance; take
        // it before tearing the instance down.
        let size = unsafe { self.composite_size_of(sys, obj) };
        unsafe {
            self.destroy_placement(sys, obj);
            let mem = NonNull::new_unchecked(obj.as_ptr());
            self.allocator.deallocate(mem, composite_layout(size));
        }
    }

    unsafe fn write_header(&self, mem: NonNull<u8>, ty: &TypeHandle<S, L>) -> Composite<S, L> {
        let header = mem.as_ptr().cast::<RttiHeader<S, L>>();
        unsafe {
            header.write(RttiHeader {
                #[cfg(debug_assertions)]
                system: self as *const Self as *const (),
                descriptor: Arc::as_ptr(&ty.0),
            });
            Composite {
                rtti: NonNull::new_unchecked(header),
            }
        }
    }

    // Constructs plugin blocks along `chain` (root first). On a refusal the
    // blocks built so far are destroyed again and `false` comes back.
    fn construct_plugins(
        &self,
        sys: &S,
        chain: &[TypeHandle<S, L>],
        bases: &[usize],
        obj: Composite<S, L>,
    ) -> bool {
        for (index, (ty, base)) in chain.iter().zip(bases).enumerate() {
            let _guard = ScopedRead::new(&self.locks, ty.0.lock.as_ref());
            let ok = unsafe {
                ty.0.plugins_unguarded()
                    .construct_block(block_ptr(obj, *base), sys)
            };
            if !ok {
                self.destroy_plugins(sys, &chain[..index], &bases[..index], obj);
                return false;
            }
        }
        true
    }

    // Assigns plugin state root-first; stops at the first refusal.
    fn assign_plugins(
        &self,
        sys: &S,
        chain: &[TypeHandle<S, L>],
        bases: &[usize],
        dst: Composite<S, L>,
        src: Composite<S, L>,
    ) -> bool {
        for (ty, base) in chain.iter().zip(bases) {
            let _guard = ScopedRead::new(&self.locks, ty.0.lock.as_ref());
            let ok = unsafe {
                ty.0.plugins_unguarded()
                    .assign_block(block_ptr(dst, *base), block_ptr(src, *base), sys)
            };
            if !ok {
                return false;
            }
        }
        true
    }

    // Destroys plugin blocks leaf-first.
    fn destroy_plugins(
        &self,
        sys: &S,
        chain: &[TypeHandle<S, L>],
        bases: &[usize],
        obj: Composite<S, L>,
    ) {
        for (ty, base) in chain.iter().zip(bases).rev() {
            let _guard = ScopedRead::new(&self.locks, ty.0.lock.as_ref());
            unsafe {
                ty.0.plugins_unguarded()
                    .destroy_block(block_ptr(obj, *base), sys)
            };
        }
    }
}
