use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::model::bbox::BBox;
use crate::model::point::Point;
use crate::model::schema::Schema;
use crate::storage::Endpoint;
use crate::structure::Structure;

pub const METADATA_FILE: &str = "cumulus";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subset {
	pub id: u64,
	pub of: u64,
}

/// The dataset descriptor published next to the chunks. Everything a
/// reader needs to interpret the tree lives here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
	pub bbox: BBox,
	pub bbox_conforming: BBox,
	pub schema: Schema,
	pub scale: [f64; 3],
	pub offset: [f64; 3],
	pub structure: Structure,
	pub hierarchy_structure: Structure,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reprojection: Option<Value>,
	#[serde(default)]
	pub manifest: Manifest,
	#[serde(default)]
	pub num_points: u64,
	/// Deepest depth holding a point, recorded so depth-open queries can
	/// stop walking.
	#[serde(default)]
	pub depth: u64,
	#[serde(default)]
	pub srs: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subset: Option<Subset>,
}

impl Metadata {
	pub fn new(
		bbox_conforming: BBox,
		schema: Schema,
		structure: Structure,
		scale: [f64; 3],
		offset: [f64; 3],
	) -> Result<Metadata> {
		structure.validate()?;
		if !schema.has_xyz() {
			return Err(Error::Schema(
				"storage schema needs X, Y and Z".to_string(),
			));
		}
		if scale.iter().any(|s| *s <= 0.0) {
			return Err(Error::Config(format!(
				"scale must be positive on every axis, got {:?}",
				scale
			)));
		}
		let hierarchy_structure = structure.hierarchy_structure();
		// The indexed domain is the minimum enclosing cube; tubular
		// trees square only x and y and keep z unbounded.
		let bbox = if structure.tubular {
			bbox_conforming.cubic_xy()
		} else {
			bbox_conforming.cubic()
		};
		Ok(Metadata {
			bbox,
			bbox_conforming,
			schema,
			scale,
			offset,
			structure,
			hierarchy_structure,
			reprojection: None,
			manifest: Manifest::default(),
			num_points: 0,
			depth: 0,
			srs: String::new(),
			subset: None,
		})
	}

	pub fn with_subset(mut self, subset: Subset) -> Result<Metadata> {
		if subset.id == 0 || subset.id > subset.of || subset.of < 2 {
			return Err(Error::Config(format!(
				"subset {} of {} is inconsistent",
				subset.id, subset.of
			)));
		}
		self.subset = Some(subset);
		Ok(self)
	}

	/// Artifact name suffix for subset builds.
	pub fn postfix(&self) -> String {
		match &self.subset {
			Some(s) => format!("-{}", s.id),
			None => String::new(),
		}
	}

	pub fn filename(postfix: &str) -> String {
		format!("{}{}", METADATA_FILE, postfix)
	}

	pub fn scale_point(&self) -> Point {
		Point::from_array(self.scale)
	}

	pub fn offset_point(&self) -> Point {
		Point::from_array(self.offset)
	}

	pub fn save(&self, ep: &dyn Endpoint) -> Result<()> {
		let json = serde_json::to_vec_pretty(self)
			.map_err(|e| Error::Config(format!("metadata did not encode: {}", e)))?;
		ep.put(&Metadata::filename(&self.postfix()), &json)
	}

	pub fn load(ep: &dyn Endpoint, postfix: &str) -> Result<Metadata> {
		let name = Metadata::filename(postfix);
		let data = ep.get(&name)?;
		let metadata: Metadata = serde_json::from_slice(&data)
			.map_err(|e| Error::Config(format!("{} did not parse: {}", name, e)))?;
		metadata.structure.validate()?;
		metadata.hierarchy_structure.validate()?;
		Ok(metadata)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::point::Point;
	use crate::storage::MemEndpoint;

	fn metadata() -> Metadata {
		let conforming = BBox::new(Point::new(0.0, 0.0, 0.0), Point::new(8.0, 4.0, 2.0));
		Metadata::new(
			conforming,
			Schema::default_xyz(),
			Structure {
				base_depth: 4,
				points_per_chunk: 64,
				..Structure::default()
			},
			[0.01, 0.01, 0.01],
			[0.0, 0.0, 0.0],
		)
		.unwrap()
	}

	#[test]
	fn test_domain_is_cubic() {
		let m = metadata();
		assert!(m.bbox.is_cubic());
		assert_eq!(m.bbox.max, Point::new(8.0, 8.0, 8.0));
		assert_eq!(m.bbox_conforming.max, Point::new(8.0, 4.0, 2.0));
	}

	#[test]
	fn test_save_load_round_trip() {
		let ep = MemEndpoint::new();
		let mut m = metadata();
		m.num_points = 12345;
		m.save(&ep).unwrap();

		let back = Metadata::load(&ep, "").unwrap();
		assert_eq!(back.num_points, 12345);
		assert_eq!(back.bbox, m.bbox);
		assert_eq!(back.structure, m.structure);
	}

	#[test]
	fn test_camel_case_keys() {
		let m = metadata();
		let json = serde_json::to_string(&m).unwrap();
		assert!(json.contains("bboxConforming"));
		assert!(json.contains("hierarchyStructure"));
		assert!(json.contains("numPoints"));
	}

	#[test]
	fn test_subset_postfix() {
		let m = metadata()
			.with_subset(Subset { id: 2, of: 4 })
			.unwrap();
		assert_eq!(m.postfix(), "-2");
		assert_eq!(Metadata::filename(&m.postfix()), "cumulus-2");
	}

	#[test]
	fn test_inconsistent_subset() {
		let bad = metadata().with_subset(Subset { id: 5, of: 4 });
		assert!(matches!(bad, Err(Error::Config(_))));
	}

	#[test]
	fn test_zero_scale_rejected() {
		let conforming = BBox::new(Point::new(0.0, 0.0, 0.0), Point::new(1.0, 1.0, 1.0));
		let bad = Metadata::new(
			conforming,
			Schema::default_xyz(),
			Structure::default(),
			[0.0, 0.01, 0.01],
			[0.0, 0.0, 0.0],
		);
		assert!(matches!(bad, Err(Error::Config(_))));
	}
}
