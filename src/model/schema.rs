use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::point::Point;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimType {
	Int8,
	Int16,
	Int32,
	Int64,
	Uint8,
	Uint16,
	Uint32,
	Uint64,
	Float,
	Double,
}

impl DimType {
	pub fn size(self) -> usize {
		match self {
			DimType::Int8 | DimType::Uint8 => 1,
			DimType::Int16 | DimType::Uint16 => 2,
			DimType::Int32 | DimType::Uint32 | DimType::Float => 4,
			DimType::Int64 | DimType::Uint64 | DimType::Double => 8,
		}
	}

	pub fn is_integral(self) -> bool {
		!matches!(self, DimType::Float | DimType::Double)
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dimension {
	pub name: String,
	#[serde(rename = "type")]
	pub dtype: DimType,
	pub size: usize,
}

impl Dimension {
	pub fn new(name: &str, dtype: DimType) -> Dimension {
		Dimension {
			name: name.to_string(),
			dtype,
			size: dtype.size(),
		}
	}
}

/// Ordered dimension list defining the fixed-width point record layout.
/// All values travel through f64, widening on read and narrowing on
/// write, which is what lets one record repack into another schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
	dims: Vec<Dimension>,
}

impl Schema {
	pub fn new(dims: Vec<Dimension>) -> Result<Schema> {
		if dims.is_empty() {
			return Err(Error::Schema("schema has no dimensions".to_string()));
		}
		for d in &dims {
			if d.size != d.dtype.size() {
				return Err(Error::Schema(format!(
					"dimension {} declares size {} but its type holds {}",
					d.name,
					d.size,
					d.dtype.size()
				)));
			}
		}
		Ok(Schema { dims })
	}

	/// Three scaled 32-bit integer spatial dimensions.
	pub fn default_xyz() -> Schema {
		Schema {
			dims: vec![
				Dimension::new("X", DimType::Int32),
				Dimension::new("Y", DimType::Int32),
				Dimension::new("Z", DimType::Int32),
			],
		}
	}

	pub fn dims(&self) -> &[Dimension] {
		&self.dims
	}

	pub fn point_size(&self) -> usize {
		self.dims.iter().map(|d| d.size).sum()
	}

	pub fn find(&self, name: &str) -> Option<(usize, &Dimension)> {
		let mut offset = 0;
		for d in &self.dims {
			if d.name == name {
				return Some((offset, d));
			}
			offset += d.size;
		}
		None
	}

	pub fn is_spatial(name: &str) -> bool {
		name == "X" || name == "Y" || name == "Z"
	}

	pub fn has_xyz(&self) -> bool {
		self.find("X").is_some() && self.find("Y").is_some() && self.find("Z").is_some()
	}

	pub fn read(record: &[u8], offset: usize, dtype: DimType) -> f64 {
		match dtype {
			DimType::Int8 => record[offset] as i8 as f64,
			DimType::Int16 => LittleEndian::read_i16(&record[offset..]) as f64,
			DimType::Int32 => LittleEndian::read_i32(&record[offset..]) as f64,
			DimType::Int64 => LittleEndian::read_i64(&record[offset..]) as f64,
			DimType::Uint8 => record[offset] as f64,
			DimType::Uint16 => LittleEndian::read_u16(&record[offset..]) as f64,
			DimType::Uint32 => LittleEndian::read_u32(&record[offset..]) as f64,
			DimType::Uint64 => LittleEndian::read_u64(&record[offset..]) as f64,
			DimType::Float => LittleEndian::read_f32(&record[offset..]) as f64,
			DimType::Double => LittleEndian::read_f64(&record[offset..]),
		}
	}

	pub fn write(record: &mut [u8], offset: usize, dtype: DimType, value: f64) {
		match dtype {
			DimType::Int8 => record[offset] = value.round() as i64 as i8 as u8,
			DimType::Int16 => {
				LittleEndian::write_i16(&mut record[offset..], value.round() as i64 as i16)
			}
			DimType::Int32 => {
				LittleEndian::write_i32(&mut record[offset..], value.round() as i64 as i32)
			}
			DimType::Int64 => LittleEndian::write_i64(&mut record[offset..], value.round() as i64),
			DimType::Uint8 => record[offset] = value.round() as u64 as u8,
			DimType::Uint16 => {
				LittleEndian::write_u16(&mut record[offset..], value.round() as u64 as u16)
			}
			DimType::Uint32 => {
				LittleEndian::write_u32(&mut record[offset..], value.round() as u64 as u32)
			}
			DimType::Uint64 => LittleEndian::write_u64(&mut record[offset..], value.round() as u64),
			DimType::Float => LittleEndian::write_f32(&mut record[offset..], value as f32),
			DimType::Double => LittleEndian::write_f64(&mut record[offset..], value),
		}
	}

	/// World-space coordinates of a stored record, inverting the storage
	/// transform: `world = stored * scale + offset`.
	pub fn xyz(&self, record: &[u8], scale: &Point, offset: &Point) -> Result<Point> {
		let read_axis = |name: &str, s: f64, o: f64| -> Result<f64> {
			let (off, dim) = self
				.find(name)
				.ok_or_else(|| Error::Schema(format!("schema is missing {}", name)))?;
			Ok(Schema::read(record, off, dim.dtype) * s + o)
		};
		Ok(Point {
			x: read_axis("X", scale.x, offset.x)?,
			y: read_axis("Y", scale.y, offset.y)?,
			z: read_axis("Z", scale.z, offset.z)?,
		})
	}

	/// Pack world-space coordinates into a record under the storage
	/// transform: `stored = (world - offset) / scale`, rounded for
	/// integral spatial types.
	pub fn set_xyz(&self, record: &mut [u8], point: &Point, scale: &Point, offset: &Point) {
		let axes = [
			("X", point.x, scale.x, offset.x),
			("Y", point.y, scale.y, offset.y),
			("Z", point.z, scale.z, offset.z),
		];
		for (name, world, s, o) in axes {
			if let Some((off, dim)) = self.find(name) {
				Schema::write(record, off, dim.dtype, (world - o) / s);
			}
		}
	}
}
