//! Error taxonomy shared by every layer of the framework.
//!
//! Nothing in the core recovers from these: they are surfaced to the caller,
//! who is expected to fix the model specification.

use thiserror::Error;

/// Result type alias for framework operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid shape, unresolvable name, unknown spec keyword, conflicting
    /// `default_variable`/`size`, competing OVERRIDE modulations, or a state
    /// being attached to a second owner.
    #[error("specification error: {0}")]
    Specification(String),

    /// Sender and receiver cannot be made shape compatible, or the two ends
    /// of an edge live in different compositions.
    #[error("connection error: {0}")]
    Connection(String),

    /// A function failed on legal input, or a scheduler condition names a
    /// mechanism outside the composition.
    #[error("execution error: {0}")]
    Execution(String),

    /// A component finished composition assembly still deferred.
    #[error("deferred initialization error: {0}")]
    Deferred(String),
}

impl Error {
    pub(crate) fn spec(msg: impl Into<String>) -> Self {
        Error::Specification(msg.into())
    }

    pub(crate) fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    pub(crate) fn execution(msg: impl Into<String>) -> Self {
        Error::Execution(msg.into())
    }

    pub(crate) fn deferred(msg: impl Into<String>) -> Self {
        Error::Deferred(msg.into())
    }

    /// Re-tag a numeric failure raised while building a component.
    pub(crate) fn into_specification(self) -> Self {
        match self {
            Error::Execution(msg) => Error::Specification(msg),
            other => other,
        }
    }

    pub(crate) fn into_connection(self) -> Self {
        match self {
            Error::Execution(msg) | Error::Specification(msg) => Error::Connection(msg),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_category() {
        let e = Error::spec("bad shape");
        assert_eq!(e.to_string(), "specification error: bad shape");
        let e = Error::execution("boom").into_specification();
        assert!(matches!(e, Error::Specification(_)));
        let e = Error::deferred("x").into_connection();
        assert!(matches!(e, Error::Deferred(_)));
    }
}
