//! Composite layout: sizes along the inheritance chain and plugin
//! resolution inside live instances.
//!
//! A composite is laid out as the RTTI header, then the language object,
//! then one plugin block per type on the inheritance chain, most-base
//! ancestor first. Plugin block sizes never depend on the instance, so the
//! total size — and the address of any plugin — is computable in a single
//! walk of the chain.

use std::alloc::Layout;
use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::descriptor::{header_size, Composite, TypeHandle};
use crate::lock::{LockProvider, ScopedRead};
use crate::plugin::PluginOffset;
use crate::system::TypeSystem;
use crate::OBJECT_ALIGNMENT;

pub(crate) fn composite_layout(size: usize) -> Layout {
    Layout::from_size_align(size, OBJECT_ALIGNMENT).expect("composite size overflows a usize")
}

impl<S: 'static, L: LockProvider> TypeSystem<S, L> {
    /// Total size of a composite that [`construct`](Self::construct) would
    /// build for `ty` from `params`. Zero means the type rejects
    /// construction.
    pub fn composite_size_for(
        &self,
        sys: &S,
        ty: &TypeHandle<S, L>,
        params: Option<&dyn Any>,
    ) -> usize {
        let lang_size = ty.0.iface.size_from_params(sys, params);
        if lang_size == 0 {
            return 0;
        }
        debug_assert_eq!(
            lang_size % OBJECT_ALIGNMENT,
            0,
            "type `{}` reported a misaligned object size",
            ty.name()
        );
        header_size::<S, L>() + lang_size + self.chain_plugin_size(ty)
    }

    /// Total size of the live composite `obj`. This is an immutable property
    /// of the instance.
    ///
    /// # Safety
    ///
    /// `obj` must be a live composite owned by this system.
    pub unsafe fn composite_size_of(&self, sys: &S, obj: Composite<S, L>) -> usize {
        self.debug_check_owner(obj);
        let ty = unsafe { self.type_of(obj) };
        let lang_size = ty.0.iface.size_from_instance(sys, obj.object_ptr());
        if lang_size == 0 {
            return 0;
        }

        let mut total = header_size::<S, L>() + lang_size;
        let mut current = Some(ty);
        while let Some(t) = current {
            current = {
                let _guard = ScopedRead::new(&self.locks, t.0.lock.as_ref());
                total += unsafe { t.0.plugins_unguarded() }.size_for_instance();
                unsafe { t.0.parent_unguarded() }
            };
        }
        total
    }

    /// Returns a handle to the type that owns `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be a live composite owned by this system.
    pub unsafe fn type_of(&self, obj: Composite<S, L>) -> TypeHandle<S, L> {
        self.debug_check_owner(obj);
        let descriptor = unsafe { (*obj.header().as_ptr()).descriptor };
        // The header pointer was minted from the registry's Arc, and the
        // live instance pins the descriptor in the registry.
        unsafe {
            Arc::increment_strong_count(descriptor);
            TypeHandle(Arc::from_raw(descriptor))
        }
    }

    /// Resolves the address of the plugin registered at `offset` on `owner`
    /// inside the live composite `obj`. Returns `None` if nothing is
    /// registered at `offset`.
    ///
    /// `owner` must be the instance's own type or one of its ancestors —
    /// the type the plugin was registered on.
    ///
    /// # Safety
    ///
    /// `obj` must be a live composite owned by this system.
    pub unsafe fn resolve_plugin(
        &self,
        sys: &S,
        obj: Composite<S, L>,
        owner: &TypeHandle<S, L>,
        offset: PluginOffset,
    ) -> Option<NonNull<u8>> {
        self.debug_check_owner(obj);
        let ty = unsafe { self.type_of(obj) };
        debug_assert!(
            self.inherits_from(owner, &ty),
            "plugin owner `{}` is not on the inheritance chain of `{}`",
            owner.name(),
            ty.name()
        );

        let lang_size = ty.0.iface.size_from_instance(sys, obj.object_ptr());
        let mut base = header_size::<S, L>() + lang_size;

        // Blocks run root to leaf: every strict ancestor of the owner
        // contributes its block before the owner's.
        let parent = {
            let _guard = ScopedRead::new(&self.locks, owner.0.lock.as_ref());
            unsafe { owner.0.parent_unguarded() }
        };
        if let Some(parent) = parent {
            base += self.chain_plugin_size(&parent);
        }

        let within_block = {
            let _guard = ScopedRead::new(&self.locks, owner.0.lock.as_ref());
            unsafe { owner.0.plugins_unguarded() }.resolve_offset(offset)?
        };
        Some(unsafe { NonNull::new_unchecked(obj.as_ptr().add(base + within_block)) })
    }

    // Sum of the plugin block sizes of `ty` and all its ancestors.
    pub(crate) fn chain_plugin_size(&self, ty: &TypeHandle<S, L>) -> usize {
        let mut total = 0;
        let mut current = Some(ty.clone());
        while let Some(t) = current {
            current = {
                let _guard = ScopedRead::new(&self.locks, t.0.lock.as_ref());
                total += unsafe { t.0.plugins_unguarded() }.runtime_size();
                unsafe { t.0.parent_unguarded() }
            };
        }
        total
    }

    /// Inheritance chain of `ty`, root first, `ty` itself last.
    pub(crate) fn chain_of(&self, ty: &TypeHandle<S, L>) -> Vec<TypeHandle<S, L>> {
        let mut chain = Vec::new();
        let mut current = Some(ty.clone());
        while let Some(t) = current {
            current = {
                let _guard = ScopedRead::new(&self.locks, t.0.lock.as_ref());
                unsafe { t.0.parent_unguarded() }
            };
            chain.push(t);
        }
        chain.reverse();
        chain
    }

    /// Byte offset of each chain member's plugin block from the start of the
    /// composite, in chain (root-first) order. The language object must
    /// already be constructed, since its instance size anchors the blocks.
    pub(crate) fn block_bases(
        &self,
        sys: &S,
        chain: &[TypeHandle<S, L>],
        obj: Composite<S, L>,
    ) -> Vec<usize> {
        let leaf = chain.last().expect("inheritance chains are never empty");
        let lang_size = leaf.0.iface.size_from_instance(sys, obj.object_ptr());

        let mut bases = Vec::with_capacity(chain.len());
        let mut base = header_size::<S, L>() + lang_size;
        for ty in chain {
            bases.push(base);
            let _guard = ScopedRead::new(&self.locks, ty.0.lock.as_ref());
            base += unsafe { ty.0.plugins_unguarded() }.runtime_size();
        }
        bases
    }

    #[inline]
    pub(crate) fn debug_check_owner(&self, _obj: Composite<S, L>) {
        #[cfg(debug_assertions)]
        {
            let system = unsafe { (*_obj.header().as_ptr()).system };
            assert!(
                std::ptr::eq(system, self as *const Self as *const ()),
                "composite does not belong to this type system"
            );
        }
    }
}
