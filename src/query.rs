use std::collections::BTreeMap;

use crate::cache::{Block, FetchInfo};
use crate::chunk::ChunkReader;
use crate::error::{Error, Result};
use crate::model::bbox::BBox;
use crate::model::dir::Dir;
use crate::model::id::Id;
use crate::model::point::Point;
use crate::model::schema::{DimType, Schema};
use crate::reader::Reader;
use crate::state::{ChunkState, PointState};

enum Stage {
	Base,
	Chunks,
	Done,
}

enum PackSource {
	/// Axis index into the world-space coordinate.
	Spatial(usize),
	/// Straight copy from the stored record.
	Copy { offset: usize, dtype: DimType },
	/// Not stored; the output stays zero-filled.
	Zero,
}

struct PackDim {
	out_offset: usize,
	dtype: DimType,
	source: PackSource,
}

/// One bounded spatial+depth query. `next` consumes the base pass, then
/// one chunk per call, appending packed points to the caller's buffer.
pub struct Query<'a> {
	reader: &'a Reader,
	qbox: BBox,
	depth_begin: u64,
	depth_end: u64,
	scale: f64,
	offset: Point,
	plan: Vec<PackDim>,
	out_size: usize,
	stage: Stage,
	block: Option<Block>,
	num_points: u64,
}

impl<'a> Query<'a> {
	pub(crate) fn new(
		reader: &'a Reader,
		out_schema: Schema,
		qbox: BBox,
		depth_begin: u64,
		depth_end: u64,
		scale: f64,
		offset: Point,
	) -> Result<Query<'a>> {
		if depth_begin > depth_end {
			return Err(Error::Config(format!(
				"query depths inverted: [{}, {})",
				depth_begin, depth_end
			)));
		}
		if scale <= 0.0 {
			return Err(Error::Config(format!("output scale {} must be positive", scale)));
		}
		if !qbox.intersects(&reader.metadata().bbox) {
			return Err(Error::Config(
				"query box misses the indexed domain".to_string(),
			));
		}
		if out_schema.dims().is_empty() {
			return Err(Error::Schema("output schema is empty".to_string()));
		}

		let stored = &reader.metadata().schema;
		let mut plan = Vec::new();
		let mut out_offset = 0;
		for dim in out_schema.dims() {
			let source = if Schema::is_spatial(&dim.name) {
				PackSource::Spatial(match dim.name.as_str() {
					"X" => 0,
					"Y" => 1,
					_ => 2,
				})
			} else {
				match stored.find(&dim.name) {
					Some((offset, stored_dim)) => PackSource::Copy {
						offset,
						dtype: stored_dim.dtype,
					},
					None => PackSource::Zero,
				}
			};
			plan.push(PackDim {
				out_offset,
				dtype: dim.dtype,
				source,
			});
			out_offset += dim.size;
		}

		Ok(Query {
			reader,
			qbox,
			depth_begin,
			depth_end,
			scale,
			offset,
			plan,
			out_size: out_offset,
			stage: Stage::Base,
			block: None,
			num_points: 0,
		})
	}

	pub fn done(&self) -> bool {
		matches!(self.stage, Stage::Done)
	}

	pub fn num_points(&self) -> u64 {
		self.num_points
	}

	/// Appends the next batch of matching points and reports whether
	/// more chunks remain. The first call runs the base pass and the
	/// chunk enumeration; each later call consumes one chunk.
	pub fn next(&mut self, buffer: &mut Vec<u8>) -> Result<bool> {
		match self.stage {
			Stage::Base => {
				self.get_base(buffer);
				let fetches = self.enumerate()?;
				let block = self.reader.reserve(fetches);
				let more = block.remaining() > 0;
				self.block = Some(block);
				self.stage = if more { Stage::Chunks } else { Stage::Done };
				Ok(more)
			}
			Stage::Chunks => {
				let step = match self.block.as_mut() {
					Some(block) => block.next_chunk(),
					None => None,
				};
				let remaining = self.block.as_ref().map_or(0, |b| b.remaining());
				if remaining == 0 {
					self.stage = Stage::Done;
				}
				match step {
					Some(Ok((_, chunk))) => {
						self.emit(buffer, &chunk);
						Ok(remaining > 0)
					}
					// This chunk is lost; the rest still serve.
					Some(Err(e)) => Err(e),
					None => Ok(false),
				}
			}
			Stage::Done => Ok(false),
		}
	}

	fn get_base(&mut self, buffer: &mut Vec<u8>) {
		let reader = self.reader;
		let base_end = reader
			.metadata()
			.structure
			.base_depth_end()
			.min(self.depth_end);
		if self.depth_begin >= base_end {
			return;
		}
		let depth_begin = self.depth_begin;
		for (depth, record) in reader.base_points() {
			if *depth < depth_begin || *depth >= base_end {
				continue;
			}
			self.process(buffer, record);
		}
	}

	fn emit(&mut self, buffer: &mut Vec<u8>, chunk: &ChunkReader) {
		for record in chunk.iter() {
			self.process(buffer, record);
		}
	}

	fn process(&mut self, buffer: &mut Vec<u8>, record: &[u8]) {
		let metadata = self.reader.metadata();
		let point = match metadata.schema.xyz(
			record,
			&metadata.scale_point(),
			&metadata.offset_point(),
		) {
			Ok(point) => point,
			Err(_) => return,
		};
		if !self.qbox.contains(&point) {
			return;
		}

		let start = buffer.len();
		buffer.resize(start + self.out_size, 0);
		let out = &mut buffer[start..];
		for dim in &self.plan {
			match &dim.source {
				PackSource::Spatial(axis) => {
					let world = [point.x, point.y, point.z][*axis];
					let offset = [self.offset.x, self.offset.y, self.offset.z][*axis];
					Schema::write(out, dim.out_offset, dim.dtype, (world - offset) / self.scale);
				}
				PackSource::Copy { offset, dtype } => {
					let value = Schema::read(record, *offset, *dtype);
					Schema::write(out, dim.out_offset, dim.dtype, value);
				}
				PackSource::Zero => {}
			}
		}
		self.num_points += 1;
	}

	/// Enumerate the chunks the query touches, ascending by id. The
	/// walk pairs a chunk state with the ancestor node whose subtree the
	/// chunk covers; the ancestor's hierarchy cell prunes dead branches.
	fn enumerate(&self) -> Result<Vec<FetchInfo>> {
		let metadata = self.reader.metadata();
		let structure = &metadata.structure;
		let depth_cap = self.depth_end.min(metadata.depth + 1);
		if structure.base_depth_end() >= depth_cap {
			return Ok(Vec::new());
		}

		let ancestor_depth = structure.base_depth_end() - structure.chunk_k();
		let mut fetches = BTreeMap::new();
		let state = PointState::new(structure, metadata.bbox.clone());
		self.walk_ancestors(&mut fetches, state, ancestor_depth, depth_cap)?;
		Ok(fetches.into_values().collect())
	}

	fn walk_ancestors(
		&self,
		fetches: &mut BTreeMap<Id, FetchInfo>,
		state: PointState,
		target_depth: u64,
		depth_cap: u64,
	) -> Result<()> {
		if !self.qbox.intersects(state.bbox()) {
			return Ok(());
		}
		let structure = &self.reader.metadata().structure;
		if state.depth() == target_depth {
			let offset = &state.index().0 - &structure.index_begin(target_depth).0;
			let chunk_id = Id(
				structure.nominal_chunk_index().0 + offset * structure.points_per_chunk,
			);
			let chunk_state = ChunkState::new(
				structure,
				state.bbox().clone(),
				structure.base_depth_end(),
				chunk_id,
			);
			return self.walk_chunks(
				fetches,
				chunk_state,
				state.index().clone(),
				target_depth,
				depth_cap,
			);
		}
		for dir in Dir::all(structure.dimensions) {
			let mut child = state.clone();
			child.climb(*dir);
			self.walk_ancestors(fetches, child, target_depth, depth_cap)?;
		}
		Ok(())
	}

	fn walk_chunks(
		&self,
		fetches: &mut BTreeMap<Id, FetchInfo>,
		chunk_state: ChunkState,
		ancestor: Id,
		ancestor_depth: u64,
		depth_cap: u64,
	) -> Result<()> {
		if chunk_state.depth() >= depth_cap {
			return Ok(());
		}
		if !self.qbox.intersects(chunk_state.bbox()) {
			return Ok(());
		}
		let hierarchy = self.reader.hierarchy();
		let ticks = hierarchy.tick_range(&self.qbox, ancestor_depth);
		let population =
			hierarchy.get(ancestor_depth, &ancestor, ticks, Some(self.reader.endpoint()))?;
		if population == 0 {
			return Ok(());
		}

		if chunk_state.depth() >= self.depth_begin {
			fetches
				.entry(chunk_state.chunk_id().clone())
				.or_insert_with(|| FetchInfo {
					id: chunk_state.chunk_id().clone(),
					depth: chunk_state.depth(),
				});
		}

		let structure = &self.reader.metadata().structure;
		if chunk_state.all_directions() {
			for dir in Dir::all(structure.dimensions) {
				let child = chunk_state.get_climb(*dir)?;
				let child_ancestor = ancestor.climb(structure.dimensions, *dir);
				self.walk_chunks(fetches, child, child_ancestor, ancestor_depth + 1, depth_cap)?;
			}
		} else {
			self.walk_chunks(
				fetches,
				chunk_state.get_climb_shared(),
				ancestor,
				ancestor_depth,
				depth_cap,
			)?;
		}
		Ok(())
	}
}
