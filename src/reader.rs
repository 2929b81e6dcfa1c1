use std::sync::Arc;

use serde_json::Value;

use crate::cache::{Block, Cache, FetchInfo};
use crate::chunk::{Cells, ChunkReader};
use crate::error::{Error, Result};
use crate::hierarchy::Hierarchy;
use crate::metadata::Metadata;
use crate::model::bbox::BBox;
use crate::model::dir::Dir;
use crate::model::id::Id;
use crate::model::point::Point;
use crate::model::schema::Schema;
use crate::query::Query;
use crate::state::PointState;
use crate::storage::Endpoint;

/// Read-side handle on a published dataset: metadata, the in-memory
/// base chunk, and the lazily awakened hierarchy.
pub struct Reader {
	endpoint: Arc<dyn Endpoint>,
	cache: Cache,
	metadata: Metadata,
	/// Base-region points as `(depth, record)`, in cell order.
	base: Vec<(u64, Vec<u8>)>,
	hierarchy: Hierarchy,
}

impl Reader {
	pub fn open(endpoint: Arc<dyn Endpoint>, cache: Cache) -> Result<Reader> {
		Reader::open_subset(endpoint, cache, "")
	}

	pub fn open_subset(
		endpoint: Arc<dyn Endpoint>,
		cache: Cache,
		postfix: &str,
	) -> Result<Reader> {
		let metadata = Metadata::load(endpoint.as_ref(), postfix)?;
		let hierarchy = Hierarchy::open(
			metadata.hierarchy_structure.clone(),
			metadata.bbox.clone(),
			endpoint.as_ref(),
			postfix,
		)?;
		let base = Reader::load_base(endpoint.as_ref(), &metadata, postfix)?;
		Ok(Reader {
			endpoint,
			cache,
			metadata,
			base,
			hierarchy,
		})
	}

	/// Rebuild the base cells by re-climbing the stored records. The
	/// file holds cells in key order, so every ancestor settles back
	/// into its cell before any of its descendants arrive.
	fn load_base(
		ep: &dyn Endpoint,
		metadata: &Metadata,
		postfix: &str,
	) -> Result<Vec<(u64, Vec<u8>)>> {
		let name = format!("0{}", postfix);
		let data = match ep.try_get_size(&name)? {
			Some(_) => ep.get_binary(&name)?,
			None => return Ok(Vec::new()),
		};
		let reader = ChunkReader::new(&name, data, metadata.schema.point_size())?;

		let structure = &metadata.structure;
		let scale = metadata.scale_point();
		let offset = metadata.offset_point();
		let mut cells = Cells::new();
		for record in reader.iter() {
			let point = metadata.schema.xyz(record, &scale, &offset)?;
			let mut state = PointState::new(structure, metadata.bbox.clone());
			loop {
				let depth = state.depth();
				if depth >= structure.base_depth_end() {
					return Err(Error::CorruptChunk {
						path: name.clone(),
						detail: "base point fell through the base region".to_string(),
					});
				}
				if structure.is_base_depth(depth) {
					let slot = state
						.index()
						.simple()
						.ok_or(Error::Overflow { depth })?;
					if cells.try_insert(slot, state.tick(point.z), record) {
						break;
					}
				}
				let dir = Dir::of(&point, &state.bbox().mid(), structure.dimensions);
				state.climb(dir);
			}
		}
		Ok(cells
			.iter()
			.map(|((slot, _), record)| {
				(structure.depth_of(&Id::from_u64(*slot)), record.clone())
			})
			.collect())
	}

	pub fn metadata(&self) -> &Metadata {
		&self.metadata
	}

	pub fn hierarchy(&self) -> &Hierarchy {
		&self.hierarchy
	}

	pub fn endpoint(&self) -> &dyn Endpoint {
		self.endpoint.as_ref()
	}

	pub fn num_points(&self) -> u64 {
		self.metadata.num_points
	}

	pub(crate) fn base_points(&self) -> &[(u64, Vec<u8>)] {
		&self.base
	}

	pub(crate) fn reserve(&self, fetches: Vec<FetchInfo>) -> Block {
		self.cache.reserve(
			self.endpoint.clone(),
			self.metadata.schema.point_size(),
			self.metadata.structure.prefix_ids,
			self.metadata.postfix(),
			fetches,
		)
	}

	/// Bounded LOD query streaming points in the output schema.
	pub fn query(
		&self,
		out_schema: Schema,
		qbox: BBox,
		depth_begin: u64,
		depth_end: u64,
		scale: f64,
		offset: Point,
	) -> Result<Query> {
		Query::new(self, out_schema, qbox, depth_begin, depth_end, scale, offset)
	}

	/// Counts within a query box, straight off the hierarchy.
	pub fn hierarchy_query(
		&self,
		qbox: &BBox,
		depth_begin: u64,
		depth_end: u64,
	) -> Result<Value> {
		self.hierarchy
			.query(Some(self.endpoint.as_ref()), qbox, depth_begin, depth_end)
	}
}
