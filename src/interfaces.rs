//! Safe building blocks for the common kinds of registered types.
//!
//! Most hosts never implement [`TypeInterface`] by hand: they implement
//! [`LanguageObject`] for an ordinary struct and register it through one of
//! the convenience registrations, which synthesize the interface here. Three
//! flavors exist, one per registration: constant-size structs, dynamically
//! sized structs (sizes from a [`TypeSizeMeta`]), and abstract types that
//! refuse construction outright.

use std::any::Any;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::descriptor::TypeInterface;
use crate::error::{TypeError, TypeResult};
use crate::{align_up, OBJECT_ALIGNMENT};

/// A host struct usable as the language object of a registered type.
///
/// `construct` receives the opaque system pointer and whatever parameters
/// the caller handed to [`construct`](crate::TypeSystem::construct). The
/// copy hook defaults to failing with [`TypeError::UndefinedMethod`]; types
/// that support cloning override it.
pub trait LanguageObject<S>: Sized + 'static {
    /// Builds the object.
    fn construct(sys: &S, params: Option<&dyn Any>) -> TypeResult<Self>;

    /// Builds a copy of `self` for
    /// [`clone_object`](crate::TypeSystem::clone_object).
    fn copy_construct(&self) -> TypeResult<Self> {
        Err(TypeError::UndefinedMethod)
    }
}

/// Instance sizing for dynamically sized types.
///
/// Both sizes are immutable properties: once reported for given parameters
/// or a given live object, the same value must be reported forever after,
/// and every size must be a multiple of
/// [`OBJECT_ALIGNMENT`](crate::OBJECT_ALIGNMENT).
pub trait TypeSizeMeta<S>: Send + Sync {
    /// Size of an object about to be constructed from `params`. Zero
    /// refuses construction.
    fn size_from_params(&self, sys: &S, params: Option<&dyn Any>) -> usize;

    /// Size of the live object at `obj`.
    fn size_from_instance(&self, sys: &S, obj: NonNull<u8>) -> usize;
}

/// Interface for a constant-size struct type.
pub(crate) struct StructTypeInterface<T> {
    size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> StructTypeInterface<T> {
    pub(crate) fn new() -> Self {
        debug_assert!(mem::align_of::<T>() <= OBJECT_ALIGNMENT);
        StructTypeInterface {
            size: align_up(mem::size_of::<T>(), OBJECT_ALIGNMENT),
            _marker: PhantomData,
        }
    }
}

unsafe impl<S, T> TypeInterface<S> for StructTypeInterface<T>
where
    T: LanguageObject<S> + Send + Sync,
{
    fn construct(&self, mem: NonNull<u8>, sys: &S, params: Option<&dyn Any>) -> TypeResult<()> {
        let value = T::construct(sys, params)?;
        unsafe { mem.as_ptr().cast::<T>().write(value) }
        Ok(())
    }

    fn copy_construct(&self, mem: NonNull<u8>, src: NonNull<u8>) -> TypeResult<()> {
        let copy = unsafe { &*src.as_ptr().cast::<T>() }.copy_construct()?;
        unsafe { mem.as_ptr().cast::<T>().write(copy) }
        Ok(())
    }

    fn destruct(&self, mem: NonNull<u8>) {
        unsafe { ptr::drop_in_place(mem.as_ptr().cast::<T>()) }
    }

    fn size_from_params(&self, _sys: &S, _params: Option<&dyn Any>) -> usize {
        self.size
    }

    fn size_from_instance(&self, _sys: &S, _obj: NonNull<u8>) -> usize {
        self.size
    }
}

/// Interface for a struct type whose sizes come from a caller-supplied meta
/// object. The `Arc` parameterizes ownership: hand over the only clone or
/// keep one around, as the host pleases.
pub(crate) struct DynamicTypeInterface<S, T> {
    meta: Arc<dyn TypeSizeMeta<S>>,
    _marker: PhantomData<fn() -> T>,
}

impl<S, T: 'static> DynamicTypeInterface<S, T> {
    pub(crate) fn new(meta: Arc<dyn TypeSizeMeta<S>>) -> Self {
        debug_assert!(mem::align_of::<T>() <= OBJECT_ALIGNMENT);
        DynamicTypeInterface {
            meta,
            _marker: PhantomData,
        }
    }
}

unsafe impl<S, T> TypeInterface<S> for DynamicTypeInterface<S, T>
where
    T: LanguageObject<S> + Send + Sync,
{
    fn construct(&self, mem: NonNull<u8>, sys: &S, params: Option<&dyn Any>) -> TypeResult<()> {
        let value = T::construct(sys, params)?;
        unsafe { mem.as_ptr().cast::<T>().write(value) }
        Ok(())
    }

    fn copy_construct(&self, mem: NonNull<u8>, src: NonNull<u8>) -> TypeResult<()> {
        let copy = unsafe { &*src.as_ptr().cast::<T>() }.copy_construct()?;
        unsafe { mem.as_ptr().cast::<T>().write(copy) }
        Ok(())
    }

    fn destruct(&self, mem: NonNull<u8>) {
        unsafe { ptr::drop_in_place(mem.as_ptr().cast::<T>()) }
    }

    fn size_from_params(&self, sys: &S, params: Option<&dyn Any>) -> usize {
        self.meta.size_from_params(sys, params)
    }

    fn size_from_instance(&self, sys: &S, obj: NonNull<u8>) -> usize {
        self.meta.size_from_instance(sys, obj)
    }
}

/// Interface for an abstract type: construction unconditionally fails.
pub(crate) struct AbstractTypeInterface<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> AbstractTypeInterface<T> {
    pub(crate) fn new() -> Self {
        AbstractTypeInterface {
            _marker: PhantomData,
        }
    }
}

unsafe impl<S, T: 'static> TypeInterface<S> for AbstractTypeInterface<T> {
    fn construct(&self, _mem: NonNull<u8>, _sys: &S, _params: Option<&dyn Any>) -> TypeResult<()> {
        Err(TypeError::AbstractConstruction)
    }

    fn copy_construct(&self, _mem: NonNull<u8>, _src: NonNull<u8>) -> TypeResult<()> {
        Err(TypeError::AbstractConstruction)
    }

    fn destruct(&self, _mem: NonNull<u8>) {}

    fn size_from_params(&self, _sys: &S, _params: Option<&dyn Any>) -> usize {
        align_up(mem::size_of::<T>(), OBJECT_ALIGNMENT)
    }

    fn size_from_instance(&self, _sys: &S, _obj: NonNull<u8>) -> usize {
        0
    }
}
