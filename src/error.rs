use thiserror::Error;

/// Errors returned by the clustering engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A sample was added after tree construction had already begun.
    ///
    /// Once `cluster_samples` has built the cluster tree, the sample set is
    /// frozen; re-clustering under a different configuration is allowed, but
    /// growing the sample set is not.
    #[error("samples cannot be added once clustering has begun")]
    AlreadyClustered,

    /// A feature vector's length does not match the clusterer dimensionality.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Expected dimensionality.
        expected: usize,
        /// Found dimensionality.
        found: usize,
    },
}

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;
