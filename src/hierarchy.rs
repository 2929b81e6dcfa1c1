use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::bbox::BBox;
use crate::model::dir::Dir;
use crate::model::id::Id;
use crate::state::{tick_of, PointState};
use crate::storage::Endpoint;
use crate::structure::Structure;

/// Occupancy per tick within one node. Non-tubular trees only ever use
/// tick 0.
pub type HierarchyTube = BTreeMap<u64, u64>;

const TRIPLE_SIZE: usize = 24;

fn push_triple(data: &mut Vec<u8>, key: u64, tick: u64, value: u64) {
	let mut buf = [0u8; TRIPLE_SIZE];
	LittleEndian::write_u64(&mut buf[0..8], key);
	LittleEndian::write_u64(&mut buf[8..16], tick);
	LittleEndian::write_u64(&mut buf[16..24], value);
	data.extend_from_slice(&buf);
}

fn parse_triples(name: &str, data: &[u8]) -> Result<Vec<(u64, u64, u64)>> {
	if data.len() % TRIPLE_SIZE != 0 {
		return Err(Error::CorruptChunk {
			path: name.to_string(),
			detail: format!("truncated triple stream of {} bytes", data.len()),
		});
	}
	Ok(data
		.chunks_exact(TRIPLE_SIZE)
		.map(|c| {
			(
				LittleEndian::read_u64(&c[0..8]),
				LittleEndian::read_u64(&c[8..16]),
				LittleEndian::read_u64(&c[16..24]),
			)
		})
		.collect())
}

/// Fixed-span shard: one tube per node slot, indexed `id - block id`.
/// Tubes carry their own locks so concurrent counts only collide on the
/// same node.
#[derive(Debug)]
struct ContiguousBlock {
	span: u64,
	tubes: Vec<Mutex<HierarchyTube>>,
}

impl ContiguousBlock {
	fn new(span: u64) -> ContiguousBlock {
		ContiguousBlock {
			span,
			tubes: (0..span).map(|_| Mutex::new(HierarchyTube::new())).collect(),
		}
	}

	fn from_bytes(span: u64, name: &str, data: &[u8]) -> Result<ContiguousBlock> {
		let block = ContiguousBlock::new(span);
		for (tube, tick, value) in parse_triples(name, data)? {
			if tube >= span {
				return Err(Error::CorruptChunk {
					path: name.to_string(),
					detail: format!("tube {} outside block span {}", tube, span),
				});
			}
			block.tubes[tube as usize].lock().insert(tick, value);
		}
		Ok(block)
	}

	fn count(&self, tube: u64, tick: u64, delta: i64) {
		if let Some(t) = self.tubes.get(tube as usize) {
			let mut tube = t.lock();
			let cell = tube.entry(tick).or_insert(0);
			*cell = (*cell as i64 + delta) as u64;
		}
	}

	fn get(&self, tube: u64, ticks: RangeInclusive<u64>) -> u64 {
		match self.tubes.get(tube as usize) {
			Some(t) => t.lock().range(ticks).map(|(_, v)| *v).sum(),
			None => 0,
		}
	}

	fn triples(&self) -> Vec<(u64, u64, u64)> {
		let mut out = Vec::new();
		for (i, tube) in self.tubes.iter().enumerate() {
			for (tick, value) in tube.lock().iter() {
				if *value > 0 {
					out.push((i as u64, *tick, *value));
				}
			}
		}
		out
	}

	fn to_bytes(&self) -> Vec<u8> {
		let mut data = Vec::new();
		for (key, tick, value) in self.triples() {
			push_triple(&mut data, key, tick, value);
		}
		data
	}
}

/// Map-backed shard for depths where occupancy is far below the slot
/// span. One lock guards the whole block.
struct SparseBlock {
	tubes: Mutex<BTreeMap<u64, HierarchyTube>>,
}

impl SparseBlock {
	fn new() -> SparseBlock {
		SparseBlock {
			tubes: Mutex::new(BTreeMap::new()),
		}
	}

	fn from_bytes(name: &str, data: &[u8]) -> Result<SparseBlock> {
		let block = SparseBlock::new();
		{
			let mut tubes = block.tubes.lock();
			for (key, tick, value) in parse_triples(name, data)? {
				tubes.entry(key).or_default().insert(tick, value);
			}
		}
		Ok(block)
	}

	fn count(&self, key: u64, tick: u64, delta: i64) {
		let mut tubes = self.tubes.lock();
		let cell = tubes.entry(key).or_default().entry(tick).or_insert(0);
		*cell = (*cell as i64 + delta) as u64;
	}

	fn get(&self, key: u64, ticks: RangeInclusive<u64>) -> u64 {
		match self.tubes.lock().get(&key) {
			Some(tube) => tube.range(ticks).map(|(_, v)| *v).sum(),
			None => 0,
		}
	}

	fn triples(&self) -> Vec<(u64, u64, u64)> {
		let mut out = Vec::new();
		for (key, tube) in self.tubes.lock().iter() {
			for (tick, value) in tube.iter() {
				if *value > 0 {
					out.push((*key, *tick, *value));
				}
			}
		}
		out
	}

	fn to_bytes(&self) -> Vec<u8> {
		let mut data = Vec::new();
		for (key, tick, value) in self.triples() {
			push_triple(&mut data, key, tick, value);
		}
		data
	}
}

enum HierarchyBlock {
	Contiguous(ContiguousBlock),
	Sparse(SparseBlock),
}

impl HierarchyBlock {
	fn count(&self, key: u64, tick: u64, delta: i64) {
		match self {
			HierarchyBlock::Contiguous(b) => b.count(key, tick, delta),
			HierarchyBlock::Sparse(b) => b.count(key, tick, delta),
		}
	}

	fn get(&self, key: u64, ticks: RangeInclusive<u64>) -> u64 {
		match self {
			HierarchyBlock::Contiguous(b) => b.get(key, ticks),
			HierarchyBlock::Sparse(b) => b.get(key, ticks),
		}
	}

	fn triples(&self) -> Vec<(u64, u64, u64)> {
		match self {
			HierarchyBlock::Contiguous(b) => b.triples(),
			HierarchyBlock::Sparse(b) => b.triples(),
		}
	}

	fn to_bytes(&self) -> Vec<u8> {
		match self {
			HierarchyBlock::Contiguous(b) => b.to_bytes(),
			HierarchyBlock::Sparse(b) => b.to_bytes(),
		}
	}
}

/// Tree of per-node occupancy counts parallel to the data tree. Each
/// insert counts once at every depth along its path, so a cell holds the
/// subtree population at-or-below its node and an interior cell is never
/// smaller than the sum of its children.
pub struct Hierarchy {
	structure: Structure,
	bbox: BBox,
	postfix: String,
	base: ContiguousBlock,
	blocks: Mutex<HashMap<Id, Arc<HierarchyBlock>>>,
}

impl Hierarchy {
	pub fn new(structure: Structure, bbox: BBox, postfix: &str) -> Result<Hierarchy> {
		structure.validate()?;
		let span = structure.base_index_span();
		Ok(Hierarchy {
			structure,
			bbox,
			postfix: postfix.to_string(),
			base: ContiguousBlock::new(span),
			blocks: Mutex::new(HashMap::new()),
		})
	}

	/// Open against saved blocks: the base loads now, cold blocks load
	/// when a query first touches their id range.
	pub fn open(
		structure: Structure,
		bbox: BBox,
		ep: &dyn Endpoint,
		postfix: &str,
	) -> Result<Hierarchy> {
		let mut hierarchy = Hierarchy::new(structure, bbox, postfix)?;
		let name = format!("h/0{}", postfix);
		if ep.try_get_size(&name)?.is_some() {
			let data = ep.get_binary(&name)?;
			let span = hierarchy.structure.base_index_span();
			hierarchy.base = ContiguousBlock::from_bytes(span, &name, &data)?;
		}
		Ok(hierarchy)
	}

	pub fn structure(&self) -> &Structure {
		&self.structure
	}

	/// Thread-safe occupancy bump for the cell `(index, tick)` at a depth.
	pub fn count(&self, depth: u64, index: &Id, tick: u64, delta: i64) {
		if depth < self.structure.base_depth {
			if let Some(tube) = index.simple() {
				self.base.count(tube, tick, delta);
			}
			return;
		}
		let block_id = self.structure.chunk_id(depth, index);
		let block = self.ensure_block(depth, &block_id);
		if let Some(key) = Id(&index.0 - &block_id.0).simple() {
			block.count(key, tick, delta);
		}
	}

	/// Single-threaded during query. Zero when no block or cell exists.
	/// With an endpoint, cold blocks are awakened from storage on first
	/// touch.
	pub fn get(
		&self,
		depth: u64,
		index: &Id,
		ticks: RangeInclusive<u64>,
		ep: Option<&dyn Endpoint>,
	) -> Result<u64> {
		if depth < self.structure.base_depth {
			return Ok(match index.simple() {
				Some(tube) => self.base.get(tube, ticks),
				None => 0,
			});
		}
		let block_id = self.structure.chunk_id(depth, index);
		let block = match self.load_block(depth, &block_id, ep)? {
			Some(block) => block,
			None => return Ok(0),
		};
		Ok(match Id(&index.0 - &block_id.0).simple() {
			Some(key) => block.get(key, ticks),
			None => 0,
		})
	}

	fn make_block(&self, depth: u64) -> HierarchyBlock {
		if depth < self.structure.sparse_depth_begin() {
			HierarchyBlock::Contiguous(ContiguousBlock::new(self.structure.points_per_chunk))
		} else {
			HierarchyBlock::Sparse(SparseBlock::new())
		}
	}

	fn ensure_block(&self, depth: u64, block_id: &Id) -> Arc<HierarchyBlock> {
		let mut blocks = self.blocks.lock();
		blocks
			.entry(block_id.clone())
			.or_insert_with(|| Arc::new(self.make_block(depth)))
			.clone()
	}

	fn load_block(
		&self,
		depth: u64,
		block_id: &Id,
		ep: Option<&dyn Endpoint>,
	) -> Result<Option<Arc<HierarchyBlock>>> {
		if let Some(block) = self.blocks.lock().get(block_id) {
			return Ok(Some(block.clone()));
		}
		let ep = match ep {
			Some(ep) => ep,
			None => return Ok(None),
		};
		let name = format!("h/{}{}", block_id, self.postfix);
		let block = match ep.try_get_size(&name)? {
			Some(_) => {
				let data = ep.get_binary(&name)?;
				if depth < self.structure.sparse_depth_begin() {
					HierarchyBlock::Contiguous(ContiguousBlock::from_bytes(
						self.structure.points_per_chunk,
						&name,
						&data,
					)?)
				} else {
					HierarchyBlock::Sparse(SparseBlock::from_bytes(&name, &data)?)
				}
			}
			// Remember the absence so the endpoint is asked only once.
			None => self.make_block(depth),
		};
		let block = Arc::new(block);
		let mut blocks = self.blocks.lock();
		let block = blocks
			.entry(block_id.clone())
			.or_insert_with(|| block)
			.clone();
		Ok(Some(block))
	}

	/// Write the base block as `h/0` and each cold block as `h/<id>`,
	/// all postfixed for subset builds.
	pub fn save(&self, ep: &dyn Endpoint) -> Result<()> {
		ep.put(&format!("h/0{}", self.postfix), &self.base.to_bytes())?;
		for (id, block) in self.blocks.lock().iter() {
			let data = block.to_bytes();
			if data.is_empty() {
				continue;
			}
			ep.put(&format!("h/{}{}", id, self.postfix), &data)?;
		}
		Ok(())
	}

	/// Cell-wise addition of another hierarchy, block by block.
	pub fn merge(&self, other: &Hierarchy) {
		for (tube, tick, value) in other.base.triples() {
			self.base.count(tube, tick, value as i64);
		}
		let other_blocks = other.blocks.lock();
		for (id, block) in other_blocks.iter() {
			let mine = {
				let mut blocks = self.blocks.lock();
				blocks
					.entry(id.clone())
					.or_insert_with(|| {
						Arc::new(match block.as_ref() {
							HierarchyBlock::Contiguous(c) => HierarchyBlock::Contiguous(
								ContiguousBlock::new(c.span),
							),
							HierarchyBlock::Sparse(_) => HierarchyBlock::Sparse(SparseBlock::new()),
						})
					})
					.clone()
			};
			for (key, tick, value) in block.triples() {
				mine.count(key, tick, value as i64);
			}
		}
	}

	/// Tick slots a query box touches at a depth. Empty when the box
	/// misses the tubular extent entirely.
	pub fn tick_range(&self, qbox: &BBox, depth: u64) -> RangeInclusive<u64> {
		if !self.structure.tubular {
			return 0..=0;
		}
		let z0 = self.bbox.min.z;
		let span = self.bbox.max.z - z0;
		if span <= 0.0 {
			return 0..=0;
		}
		let lo = tick_of(qbox.min.z, depth, z0, span);
		let ticks = (depth as f64).exp2();
		let hi = (((qbox.max.z - z0) / span) * ticks).ceil() - 1.0;
		let hi = if hi < 0.0 {
			return 1..=0;
		} else if hi >= ticks {
			(ticks - 1.0) as u64
		} else {
			hi as u64
		};
		if hi < lo {
			1..=0
		} else {
			lo..=hi
		}
	}

	/// Counts within a query box as nested JSON: `n` at each visited
	/// cell, children keyed by their dir digit.
	pub fn query(
		&self,
		ep: Option<&dyn Endpoint>,
		qbox: &BBox,
		depth_begin: u64,
		depth_end: u64,
	) -> Result<Value> {
		if depth_begin > depth_end {
			return Err(Error::Config(format!(
				"query depths inverted: [{}, {})",
				depth_begin, depth_end
			)));
		}
		let mut root = Value::Object(Map::new());
		if depth_begin < depth_end {
			let state = PointState::new(&self.structure, self.bbox.clone());
			self.accumulate(&mut root, qbox, state, depth_begin, depth_end, ep)?;
		}
		Ok(root)
	}

	fn accumulate(
		&self,
		json: &mut Value,
		qbox: &BBox,
		state: PointState,
		depth_begin: u64,
		depth_end: u64,
		ep: Option<&dyn Endpoint>,
	) -> Result<()> {
		if !qbox.intersects(state.bbox()) {
			return Ok(());
		}
		if state.depth() == depth_begin {
			return self.traverse(json, qbox, state, depth_end, ep);
		}
		for dir in Dir::all(self.structure.dimensions) {
			let mut child = state.clone();
			child.climb(*dir);
			self.accumulate(json, qbox, child, depth_begin, depth_end, ep)?;
		}
		Ok(())
	}

	fn traverse(
		&self,
		json: &mut Value,
		qbox: &BBox,
		state: PointState,
		depth_end: u64,
		ep: Option<&dyn Endpoint>,
	) -> Result<()> {
		let ticks = self.tick_range(qbox, state.depth());
		let n = self.get(state.depth(), state.index(), ticks, ep)?;
		if n == 0 {
			return Ok(());
		}
		add_count(json, n);
		if state.depth() + 1 >= depth_end {
			return Ok(());
		}
		for dir in Dir::all(self.structure.dimensions) {
			let mut child = state.clone();
			child.climb(*dir);
			if !qbox.intersects(child.bbox()) {
				continue;
			}
			let key = dir.to_integral().to_string();
			let mut sub = match json.get_mut(&key) {
				Some(existing) => existing.take(),
				None => Value::Object(Map::new()),
			};
			self.traverse(&mut sub, qbox, child, depth_end, ep)?;
			if sub.get("n").is_some() {
				json[key.as_str()] = sub;
			}
		}
		Ok(())
	}
}

fn add_count(json: &mut Value, n: u64) {
	if !json.is_object() {
		*json = Value::Object(Map::new());
	}
	let current = json.get("n").and_then(Value::as_u64).unwrap_or(0);
	json["n"] = Value::from(current + n);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::point::Point;
	use crate::storage::MemEndpoint;

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

	fn unit() -> BBox {
		BBox::new(Point::new(0.0, 0.0, 0.0), Point::new(1.0, 1.0, 1.0))
	}

	/// Count one insert along a full dir path from the root.
	fn count_path(h: &Hierarchy, dirs: &[Dir]) {
		let s = h.structure().clone();
		let mut state = PointState::new(&s, unit());
		h.count(0, state.index(), 0, 1);
		for dir in dirs {
			state.climb(*dir);
			h.count(state.depth(), state.index(), 0, 1);
		}
	}

	#[test]
	fn test_count_and_get() {
		let h = Hierarchy::new(structure(), unit(), "").unwrap();
		count_path(&h, &[Dir::Swd, Dir::Swd]);
		count_path(&h, &[Dir::Swd, Dir::Ned]);
		count_path(&h, &[Dir::Ned]);

		assert_eq!(h.get(0, &Id::zero(), 0..=0, None).unwrap(), 3);
		assert_eq!(h.get(1, &Id::from_u64(1), 0..=0, None).unwrap(), 2);
		assert_eq!(h.get(1, &Id::from_u64(4), 0..=0, None).unwrap(), 1);
		// Depth 2 cells live in a cold block.
		assert_eq!(h.get(2, &Id::from_u64(5), 0..=0, None).unwrap(), 1);
		assert_eq!(h.get(2, &Id::from_u64(8), 0..=0, None).unwrap(), 1);
		assert_eq!(h.get(2, &Id::from_u64(6), 0..=0, None).unwrap(), 0);
	}

	#[test]
	fn test_parent_at_least_children() {
		let h = Hierarchy::new(structure(), unit(), "").unwrap();
		for dirs in [
			&[Dir::Swd, Dir::Sed][..],
			&[Dir::Swd, Dir::Nwd][..],
			&[Dir::Swd][..],
		] {
			count_path(&h, dirs);
		}
		let parent = h.get(1, &Id::from_u64(1), 0..=0, None).unwrap();
		let children: u64 = (5..9)
			.map(|i| h.get(2, &Id::from_u64(i), 0..=0, None).unwrap())
			.sum();
		assert!(parent >= children);
		assert_eq!(parent, 3);
		assert_eq!(children, 2);
	}

	#[test]
	fn test_save_load_round_trip() {
		let ep = MemEndpoint::new();
		let h = Hierarchy::new(structure(), unit(), "").unwrap();
		count_path(&h, &[Dir::Ned, Dir::Ned, Dir::Ned, Dir::Ned, Dir::Ned]);
		count_path(&h, &[Dir::Swd, Dir::Swd]);
		h.save(&ep).unwrap();

		let loaded = Hierarchy::open(structure(), unit(), &ep, "").unwrap();
		// Base cells come back eagerly, cold cells lazily through the
		// endpoint.
		assert_eq!(loaded.get(0, &Id::zero(), 0..=0, None).unwrap(), 2);
		let deep = {
			let s = structure();
			let mut state = PointState::new(&s, unit());
			for _ in 0..5 {
				state.climb(Dir::Ned);
			}
			state.index().clone()
		};
		assert_eq!(loaded.get(5, &deep, 0..=0, None).unwrap(), 0);
		assert_eq!(loaded.get(5, &deep, 0..=0, Some(&ep)).unwrap(), 1);
	}

	#[test]
	fn test_block_serialization_round_trip() {
		let block = ContiguousBlock::new(8);
		block.count(3, 0, 7);
		block.count(5, 2, 1);
		block.count(0, 0, 2);

		let parsed = ContiguousBlock::from_bytes(8, "h/5", &block.to_bytes()).unwrap();
		assert_eq!(parsed.triples(), block.triples());
	}

	#[test]
	fn test_truncated_block_rejected() {
		let err = ContiguousBlock::from_bytes(8, "h/5", &[0u8; 23]).unwrap_err();
		assert!(matches!(err, Error::CorruptChunk { .. }));
	}

	#[test]
	fn test_merge_sums_cell_wise() {
		let a = Hierarchy::new(structure(), unit(), "-1").unwrap();
		let b = Hierarchy::new(structure(), unit(), "-2").unwrap();
		count_path(&a, &[Dir::Swd, Dir::Swd]);
		count_path(&a, &[Dir::Ned]);
		count_path(&b, &[Dir::Swd, Dir::Swd]);

		a.merge(&b);
		assert_eq!(a.get(0, &Id::zero(), 0..=0, None).unwrap(), 3);
		assert_eq!(a.get(1, &Id::from_u64(1), 0..=0, None).unwrap(), 2);
		assert_eq!(a.get(2, &Id::from_u64(5), 0..=0, None).unwrap(), 2);
		assert_eq!(a.get(1, &Id::from_u64(4), 0..=0, None).unwrap(), 1);
	}

	#[test]
	fn test_query_json_shape() {
		let h = Hierarchy::new(structure(), unit(), "").unwrap();
		count_path(&h, &[Dir::Swd, Dir::Swd]);
		count_path(&h, &[Dir::Swd, Dir::Ned]);
		count_path(&h, &[Dir::Ned, Dir::Ned]);

		let json = h.query(None, &unit(), 0, 3).unwrap();
		assert_eq!(json["n"], 3);
		assert_eq!(json["0"]["n"], 2);
		assert_eq!(json["0"]["0"]["n"], 1);
		assert_eq!(json["0"]["3"]["n"], 1);
		assert_eq!(json["3"]["n"], 1);
		assert!(json.get("1").is_none());
	}

	#[test]
	fn test_query_subvolume() {
		let h = Hierarchy::new(structure(), unit(), "").unwrap();
		count_path(&h, &[Dir::Swd, Dir::Swd]);
		count_path(&h, &[Dir::Ned, Dir::Ned]);

		let quadrant = BBox::new(Point::new(0.0, 0.0, 0.0), Point::new(0.5, 0.5, 1.0));
		let json = h.query(None, &quadrant, 1, 2).unwrap();
		assert_eq!(json["n"], 1);
		assert!(json.get("3").is_none());
	}

	#[test]
	fn test_tubular_ticks() {
		let s = Structure {
			tubular: true,
			..structure()
		};
		let bbox = BBox::new(Point::new(0.0, 0.0, -1e6), Point::new(1.0, 1.0, 1e6));
		let h = Hierarchy::new(s.clone(), bbox.clone(), "").unwrap();

		// Two points in the same xy cell at opposite z extremes land in
		// different ticks of the depth-1 tube.
		let mut state = PointState::new(&s, bbox.clone());
		h.count(0, state.index(), state.tick(-999999.0), 1);
		h.count(0, state.index(), state.tick(999999.0), 1);
		state.climb(Dir::Swd);
		h.count(1, state.index(), state.tick(-999999.0), 1);
		h.count(1, state.index(), state.tick(999999.0), 1);

		assert_eq!(h.get(1, &Id::from_u64(1), 0..=0, None).unwrap(), 1);
		assert_eq!(h.get(1, &Id::from_u64(1), 1..=1, None).unwrap(), 1);
		// An xy query over the full z extent sums every tick.
		let json = h.query(None, &bbox, 1, 2).unwrap();
		assert_eq!(json["n"], 2);
	}
}
