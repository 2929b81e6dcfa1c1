use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::model::id::Id;

/// Ordered point cells keyed by `(node slot, tick)`. One point per cell;
/// serialization walks keys in order, so ancestors always precede their
/// descendants in the byte stream.
#[derive(Clone, Debug, Default)]
pub struct Cells {
	map: BTreeMap<(u64, u64), Vec<u8>>,
}

impl Cells {
	pub fn new() -> Cells {
		Cells::default()
	}

	/// True if the cell was vacant and took the record.
	pub fn try_insert(&mut self, slot: u64, tick: u64, record: &[u8]) -> bool {
		match self.map.entry((slot, tick)) {
			Entry::Vacant(e) => {
				e.insert(record.to_vec());
				true
			}
			Entry::Occupied(_) => false,
		}
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&(u64, u64), &Vec<u8>)> {
		self.map.iter()
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		let mut data = Vec::new();
		for record in self.map.values() {
			data.extend_from_slice(record);
		}
		data
	}
}

/// Write-side bucket of points for one cold chunk id. Exactly one
/// builder thread installs into a chunk at a time; once flushed it is
/// never touched again.
#[derive(Debug)]
pub struct Chunk {
	id: Id,
	depth: u64,
	cells: Cells,
}

impl Chunk {
	pub fn new(id: Id, depth: u64) -> Chunk {
		Chunk {
			id,
			depth,
			cells: Cells::new(),
		}
	}

	pub fn try_insert(&mut self, slot: u64, tick: u64, record: &[u8]) -> bool {
		self.cells.try_insert(slot, tick, record)
	}

	pub fn id(&self) -> &Id {
		&self.id
	}

	pub fn depth(&self) -> u64 {
		self.depth
	}

	pub fn num_points(&self) -> usize {
		self.cells.len()
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		self.cells.to_bytes()
	}
}

/// Read-side view of a chunk file: headerless concatenated records, the
/// point count implied by the byte length.
#[derive(Debug)]
pub struct ChunkReader {
	data: Vec<u8>,
	point_size: usize,
}

impl ChunkReader {
	pub fn new(name: &str, data: Vec<u8>, point_size: usize) -> Result<ChunkReader> {
		if point_size == 0 || data.len() % point_size != 0 {
			return Err(Error::CorruptChunk {
				path: name.to_string(),
				detail: format!(
					"{} bytes is not a whole number of {}-byte points",
					data.len(),
					point_size
				),
			});
		}
		Ok(ChunkReader { data, point_size })
	}

	pub fn empty(point_size: usize) -> ChunkReader {
		ChunkReader {
			data: Vec::new(),
			point_size: point_size.max(1),
		}
	}

	pub fn num_points(&self) -> usize {
		self.data.len() / self.point_size
	}

	pub fn num_bytes(&self) -> usize {
		self.data.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
		self.data.chunks_exact(self.point_size)
	}
}
