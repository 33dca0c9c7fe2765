//! Feature-vector clustering and prototype fitting.
//!
//! `protoclust` condenses a tagged multidimensional sample set into a small
//! list of statistical *prototypes*, the way a character-recognition
//! training pipeline condenses glyph features into per-class templates.
//! Samples are first merged bottom-up into a binary cluster tree by
//! nearest-neighbor distance; the tree is then walked top-down, emitting a
//! parametric prototype (spherical, elliptical, or mixed-distribution) for
//! every subtree that passes per-dimension chi-squared goodness-of-fit
//! tests, and splitting the subtrees that do not.
//!
//! Feature dimensions may be circular (angles wrap around their range) and
//! may be flagged non-essential to exclude them from the statistical tests.
//!
//! ```rust
//! use protoclust::{ClusterConfig, Clusterer, ParamDesc, ProtoStyle};
//!
//! let mut clusterer = Clusterer::new(vec![
//!     ParamDesc::linear(0.0, 1.0),
//!     ParamDesc::linear(0.0, 1.0),
//! ]);
//!
//! // Two tight groups, each sample from a distinct source character.
//! let points = [
//!     [0.1, 0.1], [0.1, 0.1], [0.1, 0.1],
//!     [0.9, 0.9], [0.9, 0.9], [0.9, 0.9],
//! ];
//! for (char_id, point) in points.iter().enumerate() {
//!     clusterer.add_sample(point, char_id as u32)?;
//! }
//!
//! let config = ClusterConfig {
//!     proto_style: ProtoStyle::Spherical,
//!     min_samples: 0.7,
//!     ..ClusterConfig::default()
//! };
//! let prototypes = clusterer.cluster_samples(&config);
//!
//! // The two groups are too small for a significant fit, so each becomes
//! // an insignificant prototype rather than being merged into one.
//! assert_eq!(prototypes.len(), 2);
//! assert!(prototypes.iter().all(|p| !p.significant()));
//! # Ok::<(), protoclust::Error>(())
//! ```

#![forbid(unsafe_code)]

pub mod cluster;
pub mod error;
mod heap;
mod kdtree;
mod param;

pub use cluster::{
    ClusterConfig, ClusterId, ClusterNode, Clusterer, Distribution, ProtoStyle, Prototype,
    Samples, MIN_VARIANCE,
};
pub use error::{Error, Result};
pub use param::ParamDesc;
