use thiserror::Error;

/// A failure reported by a public type-system operation.
///
/// Allocation failure and a type reporting size zero are deliberately not
/// structured errors; they surface as a missing instance (`Ok(None)`) from
/// [`TypeSystem::construct`] and [`TypeSystem::clone_object`].
///
/// [`TypeSystem::construct`]: crate::TypeSystem::construct
/// [`TypeSystem::clone_object`]: crate::TypeSystem::clone_object
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum TypeError {
    /// Attempted to construct or copy-construct a type marked abstract.
    #[error("cannot construct an instance of an abstract type")]
    AbstractConstruction,

    /// A type with this name is already registered under the same parent.
    #[error("a type named `{0}` already exists under the same parent")]
    NameConflict(String),

    /// Copy-construction was requested on a type that does not implement it.
    #[error("the type does not implement the requested method")]
    UndefinedMethod,
}

/// A convenient alias for a `Result` that uses [`TypeError`] as the error
/// type.
pub type TypeResult<T> = Result<T, TypeError>;
