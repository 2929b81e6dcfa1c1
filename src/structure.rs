use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::dir::Dir;
use crate::model::id::Id;

/// Immutable tree geometry. Depths `[0, nullDepth)` hold no data,
/// `[nullDepth, baseDepth)` form the base region stored as the single
/// base chunk, and `[baseDepth, coldDepth)` is the cold region of
/// individually addressed chunks (`coldDepth == 0` leaves it unbounded).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Structure {
	pub null_depth: u64,
	pub base_depth: u64,
	pub cold_depth: u64,
	pub points_per_chunk: u64,
	pub dimensions: u32,
	pub num_points_hint: u64,
	pub tubular: bool,
	pub dynamic_chunks: bool,
	pub prefix_ids: bool,
	pub sparse_depth: u64,
}

impl Default for Structure {
	fn default() -> Structure {
		Structure {
			null_depth: 0,
			base_depth: 10,
			cold_depth: 0,
			points_per_chunk: 262144,
			dimensions: 3,
			num_points_hint: 0,
			tubular: false,
			dynamic_chunks: true,
			prefix_ids: false,
			sparse_depth: 0,
		}
	}
}

// The base block of hierarchy counts is one flat allocation, so its span
// has to stay addressable.
const MAX_BASE_SPAN: u64 = 1 << 32;
const MAX_HIERARCHY_BASE_SPAN: u64 = 1 << 22;

impl Structure {
	pub fn new(structure: Structure) -> Result<Structure> {
		structure.validate()?;
		Ok(structure)
	}

	pub fn validate(&self) -> Result<()> {
		if self.dimensions != 2 && self.dimensions != 3 {
			return Err(Error::Config(format!(
				"dimensions must be 2 or 3, got {}",
				self.dimensions
			)));
		}
		if self.tubular && self.dimensions != 2 {
			return Err(Error::Config(
				"tubular trees subdivide x and y only, so dimensions must be 2".to_string(),
			));
		}
		if self.null_depth >= self.base_depth {
			return Err(Error::Config(format!(
				"null depth {} must stay below base depth {}",
				self.null_depth, self.base_depth
			)));
		}
		if self.cold_depth > 0 && self.base_depth > self.cold_depth {
			return Err(Error::Config(format!(
				"base depth {} exceeds cold depth {}",
				self.base_depth, self.cold_depth
			)));
		}
		if self.points_per_chunk == 0 || !self.points_per_chunk.is_power_of_two() {
			return Err(Error::Config(format!(
				"chunk capacity {} must be a power of 2",
				self.points_per_chunk
			)));
		}
		let bits = self.points_per_chunk.trailing_zeros();
		if bits % self.dimensions != 0 {
			return Err(Error::Config(format!(
				"chunk capacity {} must be a power of {} so chunks tile whole subtrees",
				self.points_per_chunk,
				1u64 << self.dimensions
			)));
		}
		if self.base_depth > 32 {
			return Err(Error::Config(format!(
				"base region through depth {} is too large to address",
				self.base_depth
			)));
		}
		let level_bits = self.base_depth.saturating_mul(self.dimensions as u64);
		if level_bits < 64 && self.points_per_chunk > 1u64 << level_bits {
			return Err(Error::Config(format!(
				"chunk capacity {} exceeds the node span at base depth {}",
				self.points_per_chunk, self.base_depth
			)));
		}
		match self.index_begin(self.base_depth).simple() {
			Some(span) if span <= MAX_BASE_SPAN => Ok(()),
			_ => Err(Error::Config(format!(
				"base region through depth {} is too large to address",
				self.base_depth
			))),
		}
	}

	/// Chunk capacity growth per depth once chunks go dynamic.
	pub fn factor(&self) -> u64 {
		1u64 << self.dimensions
	}

	pub fn base_depth_begin(&self) -> u64 {
		self.null_depth
	}

	pub fn base_depth_end(&self) -> u64 {
		self.base_depth
	}

	pub fn is_base_depth(&self, depth: u64) -> bool {
		depth >= self.null_depth && depth < self.base_depth
	}

	pub fn is_cold_depth(&self, depth: u64) -> bool {
		depth >= self.base_depth && (self.cold_depth == 0 || depth < self.cold_depth)
	}

	/// First global node id at a depth: the node count of all shallower
	/// levels, `sum of 2^(d * dims)`.
	pub fn index_begin(&self, depth: u64) -> Id {
		if depth == 0 {
			return Id::zero();
		}
		let one = BigUint::from(1u64);
		let numerator = (&one << (depth as usize * self.dimensions as usize)) - &one;
		let denominator = BigUint::from((1u64 << self.dimensions) - 1);
		Id(numerator / denominator)
	}

	pub fn base_index_begin(&self) -> Id {
		self.index_begin(self.null_depth)
	}

	pub fn base_index_span(&self) -> u64 {
		let begin = self.base_index_begin().0;
		let end = self.index_begin(self.base_depth).0;
		Id(end - begin).simple().unwrap_or(u64::MAX)
	}

	pub fn nominal_chunk_depth(&self) -> u64 {
		self.base_depth
	}

	pub fn nominal_chunk_index(&self) -> Id {
		self.index_begin(self.base_depth)
	}

	/// Levels of subtree a single chunk covers.
	pub fn chunk_k(&self) -> u64 {
		(self.points_per_chunk.trailing_zeros() / self.dimensions) as u64
	}

	/// Depth from which chunk addressing goes sparse and chunk spans
	/// start growing by `factor` per level.
	pub fn sparse_depth_begin(&self) -> u64 {
		if self.sparse_depth > 0 {
			return self.sparse_depth.max(self.base_depth);
		}
		if self.num_points_hint == 0 {
			return self.base_depth + 6;
		}
		// The first depth where expected occupancy falls below ~1%.
		let mut depth = self.base_depth;
		loop {
			let bits = depth * self.dimensions as u64;
			if bits >= 64 || (1u128 << bits) > self.num_points_hint as u128 * 100 {
				return depth;
			}
			depth += 1;
		}
	}

	/// Node span of a chunk at a depth.
	pub fn chunk_points(&self, depth: u64) -> Id {
		let sparse = self.sparse_depth_begin();
		if !self.dynamic_chunks || depth <= sparse {
			Id::from_u64(self.points_per_chunk)
		} else {
			let grown = (depth - sparse) as usize * self.dimensions as usize;
			Id(BigUint::from(self.points_per_chunk) << grown)
		}
	}

	/// Id of the chunk holding a node.
	pub fn chunk_id(&self, depth: u64, index: &Id) -> Id {
		if depth < self.base_depth {
			return Id::zero();
		}
		let begin = self.index_begin(depth).0;
		let span = self.chunk_points(depth).0;
		let ordinal = (&index.0 - &begin) / &span;
		Id(begin + ordinal * span)
	}

	pub fn climb(&self, id: &Id, dir: Dir) -> Id {
		id.climb(self.dimensions, dir)
	}

	/// Depth of a node id within the base region.
	pub fn depth_of(&self, index: &Id) -> u64 {
		let mut depth = 0;
		while index >= &self.index_begin(depth + 1) {
			depth += 1;
		}
		depth
	}

	/// Geometry of the parallel hierarchy-of-counts tree: no null region,
	/// a deeper contiguous base, unbounded cold blocks.
	pub fn hierarchy_structure(&self) -> Structure {
		let mut base = self.base_depth.max(6);
		while base > 1 {
			match self.hierarchy_index_begin(base) {
				Some(span) if span <= MAX_HIERARCHY_BASE_SPAN => break,
				_ => base -= 1,
			}
		}

		let level_bits = base * self.dimensions as u64;
		let mut chunk_bits = self.points_per_chunk.trailing_zeros() as u64;
		if chunk_bits > level_bits {
			chunk_bits = level_bits - level_bits % self.dimensions as u64;
		}

		Structure {
			null_depth: 0,
			base_depth: base,
			cold_depth: 0,
			points_per_chunk: 1u64 << chunk_bits,
			dimensions: self.dimensions,
			num_points_hint: self.num_points_hint,
			tubular: self.tubular,
			dynamic_chunks: true,
			prefix_ids: false,
			sparse_depth: self.sparse_depth_begin().max(base),
		}
	}

	fn hierarchy_index_begin(&self, depth: u64) -> Option<u64> {
		let hypothetical = Structure {
			null_depth: 0,
			base_depth: depth,
			..self.clone()
		};
		hypothetical.index_begin(depth).simple()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::dir::Dir;

	fn quad() -> Structure {
		Structure {
			null_depth: 0,
			base_depth: 2,
			cold_depth: 0,
			points_per_chunk: 4,
			dimensions: 2,
			..Structure::default()
		}
	}

	#[test]
	fn test_index_begin() {
		let s = quad();
		assert_eq!(s.index_begin(0).simple(), Some(0));
		assert_eq!(s.index_begin(1).simple(), Some(1));
		assert_eq!(s.index_begin(2).simple(), Some(5));
		assert_eq!(s.index_begin(3).simple(), Some(21));
	}

	#[test]
	fn test_base_span() {
		let s = quad();
		assert_eq!(s.base_index_span(), 5);
		assert_eq!(s.nominal_chunk_index().simple(), Some(5));
	}

	#[test]
	fn test_chunk_id_alignment() {
		let s = quad();
		// Depth 2 nodes are ids 5..21; chunks of 4 start at 5, 9, 13, 17.
		assert_eq!(s.chunk_id(2, &Id::from_u64(5)).simple(), Some(5));
		assert_eq!(s.chunk_id(2, &Id::from_u64(8)).simple(), Some(5));
		assert_eq!(s.chunk_id(2, &Id::from_u64(9)).simple(), Some(9));
		assert_eq!(s.chunk_id(2, &Id::from_u64(20)).simple(), Some(17));
	}

	#[test]
	fn test_chunk_child_alignment() {
		let s = quad();
		// Chunk 5 covers the depth-2 subtree of depth-1 node 1. Each of
		// its dir-climbed children covers one depth-2 node's children,
		// at ids (5 << dims) + 1 + dir * pointsPerChunk.
		for dir in Dir::all(2) {
			let child_chunk =
				(&Id::from_u64(5).0 << 2usize) + 1u64 + dir.to_integral() * s.points_per_chunk;
			let node = s.climb(&Id::from_u64(1), *dir);
			let first_child = s.climb(&node, Dir::Swd);
			assert_eq!(s.chunk_id(3, &first_child).0, child_chunk);
		}
	}

	#[test]
	fn test_dynamic_chunk_growth() {
		let mut s = quad();
		s.sparse_depth = 3;
		assert_eq!(s.chunk_points(3).simple(), Some(4));
		assert_eq!(s.chunk_points(4).simple(), Some(16));
		assert_eq!(s.chunk_points(5).simple(), Some(64));
	}

	#[test]
	fn test_depth_of() {
		let s = quad();
		assert_eq!(s.depth_of(&Id::from_u64(0)), 0);
		assert_eq!(s.depth_of(&Id::from_u64(1)), 1);
		assert_eq!(s.depth_of(&Id::from_u64(4)), 1);
		assert_eq!(s.depth_of(&Id::from_u64(5)), 2);
	}

	#[test]
	fn test_validation_rejects() {
		let reject = |mutate: fn(&mut Structure)| {
			let mut s = quad();
			mutate(&mut s);
			assert!(matches!(s.validate(), Err(Error::Config(_))));
		};
		reject(|s| s.null_depth = 2);
		reject(|s| {
			s.cold_depth = 1;
		});
		reject(|s| s.dimensions = 4);
		reject(|s| s.points_per_chunk = 3);
		reject(|s| s.points_per_chunk = 8);
		reject(|s| s.points_per_chunk = 64);
		reject(|s| {
			s.tubular = true;
			s.dimensions = 3;
			s.points_per_chunk = 8;
		});
	}

	#[test]
	fn test_tubular_requires_two_dims() {
		let s = Structure {
			tubular: true,
			dimensions: 2,
			base_depth: 4,
			points_per_chunk: 16,
			..Structure::default()
		};
		assert!(s.validate().is_ok());
	}

	#[test]
	fn test_hierarchy_structure() {
		let s = quad();
		let h = s.hierarchy_structure();
		assert!(h.validate().is_ok());
		assert_eq!(h.null_depth, 0);
		assert!(h.base_depth >= s.base_depth);
		assert_eq!(h.cold_depth, 0);
		assert!(!h.prefix_ids);
	}

	#[test]
	fn test_serde_camel_case() {
		let s = quad();
		let json = serde_json::to_string(&s).unwrap();
		assert!(json.contains("pointsPerChunk"));
		assert!(json.contains("nullDepth"));
		let back: Structure = serde_json::from_str(&json).unwrap();
		assert_eq!(back, s);
	}

	#[test]
	fn test_serde_rejects_unknown() {
		let back: std::result::Result<Structure, _> =
			serde_json::from_str(r#"{"baseDpeth": 4}"#);
		assert!(back.is_err());
	}
}
