use num_bigint::BigUint;

use crate::error::{Error, Result};
use crate::model::bbox::BBox;
use crate::model::dir::Dir;
use crate::model::id::Id;
use crate::structure::Structure;

/// Tick slot along the tubular axis: the z range of the root is divided
/// into `2^depth` equal slots per level. Pure in `(z, depth, z range)`.
pub fn tick_of(z: f64, depth: u64, z_min: f64, z_span: f64) -> u64 {
	if z_span <= 0.0 {
		return 0;
	}
	let ticks = (depth as f64).exp2();
	let t = ((z - z_min) / z_span * ticks).floor();
	if t < 0.0 {
		0
	} else if t >= ticks {
		(ticks - 1.0) as u64
	} else {
		t as u64
	}
}

/// Walker over the node tree: carries `(bbox, id, depth)` explicitly so
/// neither tree keeps back-pointers.
#[derive(Clone)]
pub struct PointState<'a> {
	structure: &'a Structure,
	root: BBox,
	bbox: BBox,
	depth: u64,
	index: Id,
}

impl<'a> PointState<'a> {
	pub fn new(structure: &'a Structure, root: BBox) -> PointState<'a> {
		PointState {
			structure,
			bbox: root.clone(),
			root,
			depth: 0,
			index: Id::zero(),
		}
	}

	pub fn climb(&mut self, dir: Dir) {
		self.bbox.go(dir);
		self.depth += 1;
		self.index = self.structure.climb(&self.index, dir);
	}

	pub fn bbox(&self) -> &BBox {
		&self.bbox
	}

	pub fn depth(&self) -> u64 {
		self.depth
	}

	pub fn index(&self) -> &Id {
		&self.index
	}

	pub fn chunk_id(&self) -> Id {
		self.structure.chunk_id(self.depth, &self.index)
	}

	pub fn tick(&self, z: f64) -> u64 {
		if !self.structure.tubular {
			return 0;
		}
		tick_of(z, self.depth, self.root.min.z, self.root.max.z - self.root.min.z)
	}
}

/// Walker over the chunk tree used to enumerate fetches. A chunk at
/// depth `d` spans one subtree slice, so its bbox is the box of the
/// ancestor node `chunk_k` levels up.
#[derive(Clone, Debug)]
pub struct ChunkState<'a> {
	structure: &'a Structure,
	bbox: BBox,
	depth: u64,
	chunk_id: Id,
	chunk_points: Id,
}

impl<'a> ChunkState<'a> {
	pub fn new(structure: &'a Structure, bbox: BBox, depth: u64, chunk_id: Id) -> ChunkState<'a> {
		let chunk_points = structure.chunk_points(depth);
		ChunkState {
			structure,
			bbox,
			depth,
			chunk_id,
			chunk_points,
		}
	}

	/// Whether the next level still fans out one chunk per direction.
	pub fn all_directions(&self) -> bool {
		!self.structure.dynamic_chunks || self.depth + 1 <= self.structure.sparse_depth_begin()
	}

	/// Call when `all_directions()` holds.
	pub fn get_climb(&self, dir: Dir) -> Result<ChunkState<'a>> {
		let depth = self.depth + 1;
		if self.structure.dynamic_chunks && depth > self.structure.sparse_depth_begin() {
			return Err(Error::Config(format!(
				"directional chunk climb crosses the sparse boundary at depth {}",
				depth
			)));
		}
		let dims = self.structure.dimensions as usize;
		let chunk_id = Id(
			(&self.chunk_id.0 << dims)
				+ 1u64 + dir.to_integral() * self.structure.points_per_chunk,
		);
		Ok(ChunkState {
			structure: self.structure,
			bbox: self.bbox.child(dir),
			depth,
			chunk_id,
			chunk_points: self.chunk_points.clone(),
		})
	}

	/// The single growing child chunk past the sparse boundary. The bbox
	/// stays put: the chunk keeps covering the same subtree.
	pub fn get_climb_shared(&self) -> ChunkState<'a> {
		let dims = self.structure.dimensions as usize;
		ChunkState {
			structure: self.structure,
			bbox: self.bbox.clone(),
			depth: self.depth + 1,
			chunk_id: Id((&self.chunk_id.0 << dims) + 1u64),
			chunk_points: Id(&self.chunk_points.0 * BigUint::from(self.structure.factor())),
		}
	}

	pub fn bbox(&self) -> &BBox {
		&self.bbox
	}

	pub fn depth(&self) -> u64 {
		self.depth
	}

	pub fn chunk_id(&self) -> &Id {
		&self.chunk_id
	}

	pub fn chunk_points(&self) -> &Id {
		&self.chunk_points
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::point::Point;

	fn unit() -> BBox {
		BBox::new(Point::new(0.0, 0.0, 0.0), Point::new(1.0, 1.0, 1.0))
	}

	fn structure() -> Structure {
		Structure {
			null_depth: 0,
			base_depth: 2,
			cold_depth: 0,
			points_per_chunk: 4,
			dimensions: 2,
			sparse_depth: 4,
			..Structure::default()
		}
	}

	#[test]
	fn test_tick_slots() {
		// Depth 0 is one slot; each level doubles the slot count.
		assert_eq!(tick_of(-500.0, 0, -1000.0, 2000.0), 0);
		assert_eq!(tick_of(-500.0, 1, -1000.0, 2000.0), 0);
		assert_eq!(tick_of(500.0, 1, -1000.0, 2000.0), 1);
		assert_eq!(tick_of(-1000.0, 3, -1000.0, 2000.0), 0);
		assert_eq!(tick_of(999.9, 3, -1000.0, 2000.0), 7);
	}

	#[test]
	fn test_tick_clamps() {
		assert_eq!(tick_of(-2000.0, 4, -1000.0, 2000.0), 0);
		assert_eq!(tick_of(5000.0, 4, -1000.0, 2000.0), 15);
		assert_eq!(tick_of(1000.0, 4, -1000.0, 2000.0), 15);
	}

	#[test]
	fn test_point_state_climb() {
		let s = structure();
		let mut st = PointState::new(&s, unit());
		assert_eq!(st.index().simple(), Some(0));

		st.climb(Dir::Ned);
		assert_eq!(st.depth(), 1);
		assert_eq!(st.index().simple(), Some(4));
		assert_eq!(st.bbox().min, Point::new(0.5, 0.5, 0.0));

		st.climb(Dir::Swd);
		assert_eq!(st.depth(), 2);
		assert_eq!(st.index().simple(), Some(17));
		assert_eq!(st.chunk_id().simple(), Some(17));
	}

	#[test]
	fn test_chunk_state_directional() {
		let s = structure();
		let cs = ChunkState::new(&s, unit(), 2, s.nominal_chunk_index());
		assert!(cs.all_directions());

		let child = cs.get_climb(Dir::Sed).unwrap();
		assert_eq!(child.depth(), 3);
		assert_eq!(child.chunk_id().simple(), Some(5 * 4 + 1 + 4));
		assert_eq!(child.chunk_points().simple(), Some(4));
		assert!(child.bbox().min.x > 0.0);
	}

	#[test]
	fn test_chunk_state_shared_growth() {
		let s = structure();
		let cs = ChunkState::new(&s, unit(), 4, Id::from_u64(341));
		assert!(!cs.all_directions());

		let child = cs.get_climb_shared();
		assert_eq!(child.depth(), 5);
		assert_eq!(child.chunk_id().simple(), Some(341 * 4 + 1));
		assert_eq!(child.chunk_points().simple(), Some(16));
		assert_eq!(child.bbox(), cs.bbox());
	}

	#[test]
	fn test_chunk_climb_rejects_sparse_crossing() {
		let s = structure();
		let cs = ChunkState::new(&s, unit(), 4, Id::from_u64(341));
		let err = cs.get_climb(Dir::Swd).unwrap_err();
		assert!(matches!(err, Error::Config(_)));
		assert!(err.to_string().contains("depth 5"));
	}
}
