use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use num_bigint::BigUint;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::chunk::{Cells, Chunk, ChunkReader};
use crate::error::{Error, Result};
use crate::hierarchy::Hierarchy;
use crate::manifest::FileStatus;
use crate::metadata::Metadata;
use crate::model::dir::Dir;
use crate::model::id::Id;
use crate::source::PointSource;
use crate::state::PointState;
use crate::storage::Endpoint;

/// Write path of the index. Inserts climb the tree from the root and
/// settle in the first vacant cell along their path; chunks and the
/// hierarchy take concurrent inserts from the ingest pool.
pub struct Builder {
	metadata: Metadata,
	out: Arc<dyn Endpoint>,
	threads: usize,
	hierarchy: Hierarchy,
	base: Mutex<Cells>,
	cold: Mutex<HashMap<Id, Arc<Mutex<Chunk>>>>,
	num_points: AtomicU64,
	num_omitted: AtomicU64,
	max_depth: AtomicU64,
}

impl Builder {
	pub fn new(metadata: Metadata, out: Arc<dyn Endpoint>, threads: usize) -> Result<Builder> {
		metadata.structure.validate()?;
		let hierarchy = Hierarchy::new(
			metadata.hierarchy_structure.clone(),
			metadata.bbox.clone(),
			&metadata.postfix(),
		)?;
		Ok(Builder {
			metadata,
			out,
			threads: threads.max(1),
			hierarchy,
			base: Mutex::new(Cells::new()),
			cold: Mutex::new(HashMap::new()),
			num_points: AtomicU64::new(0),
			num_omitted: AtomicU64::new(0),
			max_depth: AtomicU64::new(0),
		})
	}

	/// Whether a published dataset already sits at the output.
	pub fn try_get_existing(out: &dyn Endpoint, postfix: &str) -> Result<bool> {
		Ok(out.try_get_size(&Metadata::filename(postfix))?.is_some())
	}

	/// Reopen a published build to resume it. Saved chunks replay
	/// through the climb in id order, which reproduces every cell
	/// assignment without recounting the hierarchy.
	pub fn open(out: Arc<dyn Endpoint>, postfix: &str, threads: usize) -> Result<Builder> {
		let metadata = Metadata::load(out.as_ref(), postfix)?;
		let hierarchy = Hierarchy::open(
			metadata.hierarchy_structure.clone(),
			metadata.bbox.clone(),
			out.as_ref(),
			postfix,
		)?;
		let builder = Builder {
			num_points: AtomicU64::new(metadata.num_points),
			num_omitted: AtomicU64::new(0),
			max_depth: AtomicU64::new(metadata.depth),
			threads: threads.max(1),
			hierarchy,
			base: Mutex::new(Cells::new()),
			cold: Mutex::new(HashMap::new()),
			metadata,
			out,
		};
		builder.replay_published()?;
		info!(
			"resumed build of {} points",
			builder.num_points.load(Ordering::Relaxed)
		);
		Ok(builder)
	}

	pub fn metadata(&self) -> &Metadata {
		&self.metadata
	}

	pub fn hierarchy(&self) -> &Hierarchy {
		&self.hierarchy
	}

	pub fn num_points(&self) -> u64 {
		self.num_points.load(Ordering::Relaxed)
	}

	pub fn num_omitted(&self) -> u64 {
		self.num_omitted.load(Ordering::Relaxed)
	}

	/// Point counts per chunk, base chunk first, then ascending id.
	pub fn chunk_counts(&self) -> Vec<(Id, u64)> {
		let mut out = vec![(Id::zero(), self.base.lock().len() as u64)];
		let cold = self.cold.lock();
		let mut chunks: Vec<(Id, u64)> = cold
			.iter()
			.map(|(id, c)| (id.clone(), c.lock().num_points() as u64))
			.collect();
		chunks.sort_by(|a, b| a.0.cmp(&b.0));
		out.extend(chunks);
		out
	}

	/// Insert one record. Returns false for points outside the indexed
	/// domain, which are omitted and tallied.
	pub fn insert(&self, record: &[u8]) -> Result<bool> {
		self.insert_climb(record, true)
	}

	fn insert_climb(&self, record: &[u8], count: bool) -> Result<bool> {
		let structure = &self.metadata.structure;
		let point = self.metadata.schema.xyz(
			record,
			&self.metadata.scale_point(),
			&self.metadata.offset_point(),
		)?;
		if !self.metadata.bbox.contains(&point) {
			if count {
				self.num_omitted.fetch_add(1, Ordering::Relaxed);
			}
			return Ok(false);
		}

		let mut state = PointState::new(structure, self.metadata.bbox.clone());
		let mut path: Vec<(u64, Id, u64)> = Vec::new();
		loop {
			let depth = state.depth();
			let tick = state.tick(point.z);
			path.push((depth, state.index().clone(), tick));

			let placed = if structure.is_base_depth(depth) {
				let slot = state
					.index()
					.simple()
					.ok_or(Error::Overflow { depth })?;
				self.base.lock().try_insert(slot, tick, record)
			} else if depth >= structure.base_depth_end() {
				if structure.cold_depth > 0 && depth >= structure.cold_depth {
					return Err(Error::Overflow { depth });
				}
				let chunk_id = state.chunk_id();
				let chunk = {
					let mut cold = self.cold.lock();
					cold.entry(chunk_id.clone())
						.or_insert_with(|| Arc::new(Mutex::new(Chunk::new(chunk_id.clone(), depth))))
						.clone()
				};
				let slot = Id(&state.index().0 - &chunk_id.0)
					.simple()
					.ok_or(Error::Overflow { depth })?;
				let inserted = chunk.lock().try_insert(slot, tick, record);
				inserted
			} else {
				// Null depths hold nothing.
				false
			};

			if placed {
				break;
			}
			let dir = Dir::of(&point, &state.bbox().mid(), structure.dimensions);
			state.climb(dir);
		}

		if count {
			for (depth, index, tick) in &path {
				self.hierarchy.count(*depth, index, *tick, 1);
			}
			self.num_points.fetch_add(1, Ordering::Relaxed);
			self.max_depth.fetch_max(state.depth(), Ordering::Relaxed);
		}
		Ok(true)
	}

	/// Ingest source files on a pool of `threads` workers. Failures are
	/// recorded in the manifest; the rest of the build continues.
	pub fn go(
		&mut self,
		input: Arc<dyn Endpoint>,
		paths: &[String],
		source: &dyn PointSource,
	) -> Result<()> {
		let pool = rayon::ThreadPoolBuilder::new()
			.num_threads(self.threads)
			.build()
			.map_err(|e| Error::Config(format!("thread pool: {}", e)))?;
		let scale = self.metadata.scale_point();
		let offset = self.metadata.offset_point();
		let schema = self.metadata.schema.clone();

		let results: Vec<(String, std::result::Result<(u64, u64), String>)> =
			pool.install(|| {
				paths
					.par_iter()
					.map(|path| {
						let outcome = (|| -> anyhow::Result<(u64, u64)> {
							let data = input.get(path).map_err(anyhow::Error::new)?;
							let records = source.points(&data, &schema, &scale, &offset)?;
							let mut added = 0u64;
							let mut omitted = 0u64;
							for record in &records {
								match self.insert(record) {
									Ok(true) => added += 1,
									Ok(false) => omitted += 1,
									Err(e) => return Err(anyhow::Error::new(e)),
								}
							}
							Ok((added, omitted))
						})();
						(path.clone(), outcome.map_err(|e| e.to_string()))
					})
					.collect()
			});

		for (path, outcome) in results {
			match outcome {
				Ok((added, omitted)) => {
					if omitted > 0 {
						warn!("{}: {} points fell outside the index bounds", path, omitted);
					}
					let status = if added == 0 && omitted > 0 {
						FileStatus::Omitted
					} else {
						FileStatus::Added
					};
					self.metadata.manifest.update(&path, status, added, None);
				}
				Err(message) => {
					warn!("{} failed: {}", path, message);
					self.metadata
						.manifest
						.update(&path, FileStatus::Error, 0, Some(message));
				}
			}
		}
		info!(
			"ingested {} points from {} files",
			self.num_points.load(Ordering::Relaxed),
			paths.len()
		);
		Ok(())
	}

	/// Flush everything: base chunk, cold chunks in id order, hierarchy
	/// blocks, and last the metadata file that publishes the build.
	pub fn save(&mut self) -> Result<()> {
		let postfix = self.metadata.postfix();
		self.out
			.put(&format!("0{}", postfix), &self.base.lock().to_bytes())?;

		let chunks: Vec<(Id, Arc<Mutex<Chunk>>)> = {
			let cold = self.cold.lock();
			let mut chunks: Vec<_> = cold.iter().map(|(k, c)| (k.clone(), c.clone())).collect();
			chunks.sort_by(|a, b| a.0.cmp(&b.0));
			chunks
		};
		let mut written = 1;
		for (id, chunk) in &chunks {
			let chunk = chunk.lock();
			if chunk.num_points() == 0 {
				continue;
			}
			let name = format!("{}{}", id.name(self.metadata.structure.prefix_ids), postfix);
			self.out.put(&name, &chunk.to_bytes())?;
			written += 1;
		}

		self.hierarchy.save(self.out.as_ref())?;
		self.metadata.num_points = self.num_points.load(Ordering::Relaxed);
		self.metadata.depth = self.max_depth.load(Ordering::Relaxed);
		self.metadata.save(self.out.as_ref())?;
		info!(
			"saved {} chunks holding {} points",
			written, self.metadata.num_points
		);
		Ok(())
	}

	fn replay_published(&self) -> Result<()> {
		let postfix = self.metadata.postfix();
		let point_size = self.metadata.schema.point_size();

		let mut names: Vec<(BigUint, String)> = Vec::new();
		for name in self.out.resolve("*")? {
			if name.starts_with("h/") || name == Metadata::filename(&postfix) {
				continue;
			}
			let bare = match name.strip_suffix(&postfix) {
				Some(bare) if !postfix.is_empty() => bare,
				_ if postfix.is_empty() => name.as_str(),
				_ => continue,
			};
			let radix = if self.metadata.structure.prefix_ids { 16 } else { 10 };
			if let Some(id) = BigUint::parse_bytes(bare.as_bytes(), radix) {
				names.push((id, name.clone()));
			}
		}
		// Ascending id is a topological order: every ancestor cell
		// precedes its descendants, so replay lands each point back in
		// its original cell.
		names.sort_by(|a, b| a.0.cmp(&b.0));

		for (_, name) in &names {
			let data = self.out.get_binary(name)?;
			let reader = ChunkReader::new(name, data, point_size)?;
			for record in reader.iter() {
				self.insert_climb(record, false)?;
			}
		}
		Ok(())
	}
}
