//! Error types for the Cluster controller

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for Cluster reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The requested object does not exist
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespaced name of the missing object
        name: String,
    },

    /// Optimistic concurrency failure on write
    #[error("conflict: {0}")]
    Conflict(String),

    /// Another writer changed a condition this controller does not own
    #[error("condition {condition} was modified concurrently")]
    ConditionConflict {
        /// Type of the contested condition
        condition: String,
    },

    /// Several independent failures from one reconcile pass
    #[error("[{}]", join_errors(.0))]
    Aggregate(Vec<Error>),

    /// A provider-managed object could not be read or interpreted
    #[error("external object {reference}: {message}")]
    ExternalObject {
        /// `apiVersion/kind "name"` of the object
        reference: String,
        /// What went wrong
        message: String,
    },

    /// Fetching an object referenced by a Cluster failed
    #[error("failed to get {reference} for Cluster {cluster}: {source}")]
    Lookup {
        /// `apiVersion/kind "name"` of the referenced object
        reference: String,
        /// `namespace/name` of the Cluster holding the reference
        cluster: String,
        /// Underlying failure
        source: Box<Error>,
    },

    /// Deleting an object on behalf of a Cluster failed
    #[error("failed to delete {target} for Cluster {cluster}: {source}")]
    Delete {
        /// Kind and name of the object being deleted
        target: String,
        /// `namespace/name` of the Cluster being torn down
        cluster: String,
        /// Underlying failure
        source: Box<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Certificate or key handling failed while generating a kubeconfig
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Unexpected internal state
    #[error("internal error: {0}")]
    Internal(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// A condition outside the controller's ownership changed under us
    pub fn condition_conflict(condition: impl Into<String>) -> Self {
        Self::ConditionConflict {
            condition: condition.into(),
        }
    }

    /// Create an external object error
    pub fn external(reference: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ExternalObject {
            reference: reference.into(),
            message: msg.into(),
        }
    }

    /// Wrap a failed lookup of an object referenced by `cluster`
    pub fn lookup(
        reference: impl std::fmt::Display,
        cluster: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::Lookup {
            reference: reference.to_string(),
            cluster: cluster.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a failed delete of `target` during teardown of `cluster`
    pub fn delete(target: impl std::fmt::Display, cluster: impl Into<String>, source: Error) -> Self {
        Self::Delete {
            target: target.to_string(),
            cluster: cluster.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Combine a list of errors into one.
    ///
    /// Returns `None` for an empty list and the error itself for a single
    /// entry, so callers never see a one-element aggregate.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(errors)),
        }
    }

    /// Returns true if this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Returns true if this error is an optimistic concurrency conflict
    ///
    /// Only stale-version rejections count; a [`Error::ConditionConflict`]
    /// will not go away by writing again.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Number of leaf errors contained in this error
    pub fn len(&self) -> usize {
        match self {
            Self::Aggregate(errors) => errors.iter().map(Error::len).sum(),
            _ => 1,
        }
    }

    /// Always false; an error carries at least one failure
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Classify a kube API error, turning 404 and 409 into typed variants
pub(crate) fn classify(err: kube::Error, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, name),
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(ae.message),
        other => Error::Kube(other),
    }
}
