//! Out-of-core hierarchical point cloud indexing.
//!
//! A builder climbs billions of points into an immutable chunked octree
//! (or quadtree) alongside a hierarchy of per-node occupancy counts; a
//! reader answers bounded spatial+depth queries against the published
//! dataset, streaming points back in a caller-chosen schema through a
//! byte-capped chunk cache.

pub mod builder;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod manifest;
pub mod metadata;
pub mod model;
pub mod query;
pub mod reader;
pub mod source;
pub mod state;
pub mod storage;
pub mod structure;

pub use crate::builder::Builder;
pub use crate::cache::{Block, Cache, FetchInfo};
pub use crate::error::{Error, Result};
pub use crate::hierarchy::Hierarchy;
pub use crate::manifest::{FileInfo, FileStatus, Manifest};
pub use crate::metadata::{Metadata, Subset};
pub use crate::model::bbox::BBox;
pub use crate::model::dir::Dir;
pub use crate::model::id::Id;
pub use crate::model::point::Point;
pub use crate::model::schema::{DimType, Dimension, Schema};
pub use crate::query::Query;
pub use crate::reader::Reader;
pub use crate::source::{CsvSource, PointSource};
pub use crate::storage::{Endpoint, FsEndpoint, MemEndpoint};
pub use crate::structure::Structure;
