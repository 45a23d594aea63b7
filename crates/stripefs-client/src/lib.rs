//! StripeFS Client - Object store surface and cluster maps
//!
//! This crate defines the object store operations the metadata server
//! issues against the data cluster, the stripe arithmetic that maps file
//! sizes onto object counts, and read-only views of the cluster maps.

pub mod maps;
pub mod objecter;
pub mod striper;

pub use maps::{OsdMapView, RankMap};
pub use objecter::ObjectStore;
