use anyhow::Result;
use csv::Reader;
use ord_subset::OrdSubsetIterExt;
use serde::Deserialize;

use crate::model::bbox::BBox;
use crate::model::point::Point;
use crate::model::schema::Schema;

/// The point-reader seam: decode one source file into packed records in
/// the dataset schema. Format libraries plug in behind this trait.
pub trait PointSource: Send + Sync {
	fn points(
		&self,
		data: &[u8],
		schema: &Schema,
		scale: &Point,
		offset: &Point,
	) -> Result<Vec<Vec<u8>>>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Intensity {
	Int(u16),
	Float(f32),
}

#[derive(Debug, Deserialize)]
struct Row {
	pub x: f64,
	pub y: f64,
	pub z: f64,
	pub intensity: Option<Intensity>,
}

/// Comma-separated `x,y,z[,intensity]` rows with a header line.
pub struct CsvSource;

impl PointSource for CsvSource {
	fn points(
		&self,
		data: &[u8],
		schema: &Schema,
		scale: &Point,
		offset: &Point,
	) -> Result<Vec<Vec<u8>>> {
		let mut rdr = Reader::from_reader(data);
		let mut records = Vec::new();
		for result in rdr.deserialize() {
			let row: Row = result?;
			let mut record = vec![0u8; schema.point_size()];
			schema.set_xyz(&mut record, &Point::new(row.x, row.y, row.z), scale, offset);
			if let (Some(intensity), Some((offset, dim))) =
				(&row.intensity, schema.find("Intensity"))
			{
				let value = match intensity {
					Intensity::Int(i) => *i as f64,
					Intensity::Float(f) => *f as f64,
				};
				Schema::write(&mut record, offset, dim.dtype, value);
			}
			records.push(record);
		}
		Ok(records)
	}
}

/// World bounds of a point batch, for sources that do not declare them.
pub fn find_bounds(points: &[Point]) -> Option<BBox> {
	if points.is_empty() {
		return None;
	}
	let xs: Vec<f64> = points.iter().map(|p| p.x).collect();
	let ys: Vec<f64> = points.iter().map(|p| p.y).collect();
	let zs: Vec<f64> = points.iter().map(|p| p.z).collect();

	Some(BBox::new(
		Point::new(
			*xs.iter().ord_subset_min()?,
			*ys.iter().ord_subset_min()?,
			*zs.iter().ord_subset_min()?,
		),
		Point::new(
			*xs.iter().ord_subset_max()?,
			*ys.iter().ord_subset_max()?,
			*zs.iter().ord_subset_max()?,
		),
	))
}
