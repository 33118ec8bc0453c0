//! Packed registration of fixed-size plugin blocks.
//!
//! Every registered type owns one [`PluginRegistry`]: the set of extension
//! structs that subsystems have attached to instances of that type. The
//! registry assigns each plugin a stable offset inside the type's block,
//! reports the block's total size, and drives the per-plugin
//! construct/assign/destroy callbacks when a composite goes through its
//! lifecycle. Block layout never depends on the instance, so the size of a
//! composite is computable in one walk of the inheritance chain.

use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use crate::{align_up, OBJECT_ALIGNMENT};

/// Identifies one registered plugin block within its owning type.
///
/// The offset is relative to the owning type's block and stays valid from
/// registration until the matching
/// [`unregister_plugin`](crate::TypeSystem::unregister_plugin).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PluginOffset(pub(crate) usize);

/// Per-plugin lifecycle callbacks, driven by the owning type's registry.
///
/// # Safety
///
/// Implementations may only touch the bytes registered for the plugin behind
/// the given pointer (the `size` passed at registration), and a `true`
/// return from [`construct_plugin`](Self::construct_plugin) must leave those
/// bytes in whatever state [`destroy_plugin`](Self::destroy_plugin) expects.
pub unsafe trait PluginInterface<S>: Send + Sync {
    /// Constructs the plugin in place. Returning `false` aborts the
    /// surrounding composite construction; plugins constructed before this
    /// one are destroyed again.
    fn construct_plugin(&self, plugin: NonNull<u8>, sys: &S) -> bool;

    /// Copies plugin state from `src` into the already-constructed `dst`.
    /// Returning `false` unwinds the surrounding clone.
    fn assign_plugin(&self, dst: NonNull<u8>, src: NonNull<u8>, sys: &S) -> bool;

    /// Tears the plugin down. Must not fail.
    fn destroy_plugin(&self, plugin: NonNull<u8>, sys: &S);
}

struct PluginEntry<S> {
    offset: usize,
    size: usize,
    id: u32,
    iface: Box<dyn PluginInterface<S>>,
}

/// The packed set of plugin blocks registered on one type.
pub(crate) struct PluginRegistry<S> {
    // Sorted by offset. Gaps left behind by unregistration are reused
    // first-fit, so offsets handed out earlier never move.
    entries: Vec<PluginEntry<S>>,
}

impl<S> PluginRegistry<S> {
    pub(crate) fn new() -> Self {
        PluginRegistry {
            entries: Vec::new(),
        }
    }

    /// Registers a `size`-byte plugin and returns its offset inside this
    /// type's block.
    pub(crate) fn register(
        &mut self,
        size: usize,
        id: u32,
        iface: Box<dyn PluginInterface<S>>,
    ) -> PluginOffset {
        let offset = self.place(size);
        let index = self.entries.partition_point(|entry| entry.offset < offset);
        self.entries.insert(
            index,
            PluginEntry {
                offset,
                size,
                id,
                iface,
            },
        );
        PluginOffset(offset)
    }

    // First fit over the gaps between live entries, at word granularity.
    fn place(&self, size: usize) -> usize {
        let mut candidate = 0;
        for entry in &self.entries {
            let aligned = align_up(candidate, OBJECT_ALIGNMENT);
            if aligned + size <= entry.offset {
                return aligned;
            }
            candidate = entry.offset + entry.size;
        }
        align_up(candidate, OBJECT_ALIGNMENT)
    }

    /// Removes the plugin registered at `offset`.
    pub(crate) fn unregister(&mut self, offset: PluginOffset) {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.offset == offset.0)
            .expect("no plugin is registered at this offset");
        let entry = self.entries.remove(index);
        log::trace!("unregistered {}-byte plugin {:#x}", entry.size, entry.id);
    }

    /// Total bytes this registry contributes to every instance, padded so
    /// that the next type's block starts word-aligned.
    pub(crate) fn runtime_size(&self) -> usize {
        let end = self
            .entries
            .last()
            .map_or(0, |entry| entry.offset + entry.size);
        align_up(end, OBJECT_ALIGNMENT)
    }

    /// Bytes contributed to the given live instance. Block layout does not
    /// depend on the instance, so this always equals
    /// [`runtime_size`](Self::runtime_size).
    pub(crate) fn size_for_instance(&self) -> usize {
        self.runtime_size()
    }

    /// Maps a registration token back to its offset within this block, or
    /// `None` if nothing is registered there.
    pub(crate) fn resolve_offset(&self, offset: PluginOffset) -> Option<usize> {
        self.entries
            .iter()
            .find(|entry| entry.offset == offset.0)
            .map(|entry| entry.offset)
    }

    /// Runs every plugin's constructor in offset order. On failure the
    /// plugins constructed so far are destroyed again, in reverse order.
    ///
    /// # Safety
    ///
    /// `block` must be valid for [`runtime_size`](Self::runtime_size) bytes.
    pub(crate) unsafe fn construct_block(&self, block: NonNull<u8>, sys: &S) -> bool {
        for (index, entry) in self.entries.iter().enumerate() {
            let plugin = unsafe { entry_ptr(block, entry) };
            if !entry.iface.construct_plugin(plugin, sys) {
                for done in self.entries[..index].iter().rev() {
                    done.iface.destroy_plugin(unsafe { entry_ptr(block, done) }, sys);
                }
                return false;
            }
        }
        true
    }

    /// Copies every plugin from `src` to `dst` in offset order, stopping at
    /// the first refusal.
    ///
    /// # Safety
    ///
    /// Both blocks must be valid for [`runtime_size`](Self::runtime_size)
    /// bytes and fully constructed.
    pub(crate) unsafe fn assign_block(&self, dst: NonNull<u8>, src: NonNull<u8>, sys: &S) -> bool {
        for entry in &self.entries {
            let to = unsafe { entry_ptr(dst, entry) };
            let from = unsafe { entry_ptr(src, entry) };
            if !entry.iface.assign_plugin(to, from, sys) {
                return false;
            }
        }
        true
    }

    /// Destroys every plugin, in reverse offset order.
    ///
    /// # Safety
    ///
    /// `block` must be valid for [`runtime_size`](Self::runtime_size) bytes
    /// and fully constructed.
    pub(crate) unsafe fn destroy_block(&self, block: NonNull<u8>, sys: &S) {
        for entry in self.entries.iter().rev() {
            entry.iface.destroy_plugin(unsafe { entry_ptr(block, entry) }, sys);
        }
    }
}

unsafe fn entry_ptr<S>(block: NonNull<u8>, entry: &PluginEntry<S>) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(block.as_ptr().add(entry.offset)) }
}

/// Default-constructs a `P` into each instance; assignment clones from the
/// source block. The safe backing for
/// [`register_struct_plugin`](crate::TypeSystem::register_struct_plugin).
pub(crate) struct StructPlugin<P> {
    _marker: PhantomData<fn() -> P>,
}

impl<P> StructPlugin<P> {
    pub(crate) fn new() -> Self {
        debug_assert!(std::mem::align_of::<P>() <= OBJECT_ALIGNMENT);
        StructPlugin {
            _marker: PhantomData,
        }
    }
}

unsafe impl<S, P> PluginInterface<S> for StructPlugin<P>
where
    P: Default + Clone + Send + Sync + 'static,
{
    fn construct_plugin(&self, plugin: NonNull<u8>, _sys: &S) -> bool {
        unsafe { plugin.as_ptr().cast::<P>().write(P::default()) }
        true
    }

    fn assign_plugin(&self, dst: NonNull<u8>, src: NonNull<u8>, _sys: &S) -> bool {
        unsafe {
            let src = &*src.as_ptr().cast::<P>().cast_const();
            (*dst.as_ptr().cast::<P>()).clone_from(src);
        }
        true
    }

    fn destroy_plugin(&self, plugin: NonNull<u8>, _sys: &S) {
        unsafe { ptr::drop_in_place(plugin.as_ptr().cast::<P>()) }
    }
}
