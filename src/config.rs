use log::{info, warn};
use serde_json::Value;

use crate::builder::Builder;
use crate::error::{Error, Result};
use crate::metadata::{Metadata, Subset};
use crate::model::bbox::BBox;
use crate::model::schema::Schema;
use crate::storage;
use crate::storage::Endpoint;
use crate::structure::Structure;

/// Build-side front door: a JSON config with `input`, `output`,
/// `geometry`, `structure` and `subset` groups becomes a validated
/// builder. Without `output.force`, an already-published output is
/// reopened for resumption instead of clobbered.
pub fn get_builder(config: &Value) -> Result<Builder> {
	let output = &config["output"];
	let out_path = output["path"]
		.as_str()
		.ok_or_else(|| Error::Config("output.path is required".to_string()))?;
	let force = output["force"].as_bool().unwrap_or(false);
	if output["compress"].as_bool().unwrap_or(false) {
		warn!("output.compress is recognized but chunks are stored raw");
	}
	let threads = config["input"]["threads"].as_u64().unwrap_or(4) as usize;

	let out = storage::endpoint(out_path)?;
	let postfix = match config.get("subset") {
		Some(subset) if !subset.is_null() => {
			format!("-{}", subset["id"].as_u64().unwrap_or(0))
		}
		_ => String::new(),
	};
	if !force && Builder::try_get_existing(out.as_ref(), &postfix)? {
		info!("resuming the existing build at {}", out_path);
		return Builder::open(out, &postfix, threads);
	}

	let geometry = &config["geometry"];
	let bbox = match geometry.get("bbox") {
		Some(v) if !v.is_null() => serde_json::from_value::<BBox>(v.clone())
			.map_err(|e| Error::Config(format!("geometry.bbox: {}", e)))?,
		_ => return Err(Error::Config("geometry.bbox is required".to_string())),
	};
	let schema = match geometry.get("schema") {
		Some(v) if !v.is_null() => {
			let dims = serde_json::from_value(v.clone())
				.map_err(|e| Error::Config(format!("geometry.schema: {}", e)))?;
			Schema::new(dims)?
		}
		_ => Schema::default_xyz(),
	};
	let scale = array3(geometry.get("scale")).unwrap_or([0.01, 0.01, 0.01]);
	let offset = array3(geometry.get("offset")).unwrap_or([0.0, 0.0, 0.0]);

	let structure_json = config
		.get("structure")
		.cloned()
		.unwrap_or_else(|| Value::Object(Default::default()));
	let structure: Structure = serde_json::from_value(structure_json)
		.map_err(|e| Error::Config(format!("structure: {}", e)))?;

	let mut metadata = Metadata::new(bbox, schema, structure, scale, offset)?;
	if let Some(subset) = config.get("subset").filter(|s| !s.is_null()) {
		let id = subset["id"]
			.as_u64()
			.ok_or_else(|| Error::Config("subset.id is required".to_string()))?;
		let of = subset["of"]
			.as_u64()
			.ok_or_else(|| Error::Config("subset.of is required".to_string()))?;
		metadata = metadata.with_subset(Subset { id, of })?;
	}
	if let Some(reproject) = geometry.get("reproject").filter(|r| !r.is_null()) {
		metadata.reprojection = Some(reproject.clone());
	}
	if let Some(srs) = geometry["srs"].as_str() {
		metadata.srs = srs.to_string();
	}

	Builder::new(metadata, out, threads)
}

/// Expand `input.manifest` into concrete source paths.
pub fn get_paths(config: &Value, input: &dyn Endpoint) -> Result<Vec<String>> {
	let manifest = &config["input"]["manifest"];
	let mut paths = Vec::new();
	match manifest {
		Value::String(pattern) => paths.extend(input.resolve(pattern)?),
		Value::Array(patterns) => {
			for pattern in patterns {
				match pattern.as_str() {
					Some(pattern) => paths.extend(input.resolve(pattern)?),
					None => {
						return Err(Error::Config(
							"input.manifest entries must be strings".to_string(),
						))
					}
				}
			}
		}
		Value::Null => {}
		_ => {
			return Err(Error::Config(
				"input.manifest must be a path or a list of paths".to_string(),
			))
		}
	}
	Ok(paths)
}

fn array3(v: Option<&Value>) -> Option<[f64; 3]> {
	v.and_then(|v| serde_json::from_value(v.clone()).ok())
}
