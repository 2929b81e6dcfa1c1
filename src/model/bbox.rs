use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

use crate::model::dir::Dir;
use crate::model::point::Point;

/// Axis-aligned box over the indexed domain. Containment is inclusive at
/// the minimum edge and exclusive at the maximum, so siblings never share
/// a point.
#[derive(Clone, Debug, PartialEq)]
pub struct BBox {
	pub min: Point,
	pub max: Point,
}

impl BBox {
	pub fn new(min: Point, max: Point) -> BBox {
		BBox { min, max }
	}

	pub fn mid(&self) -> Point {
		Point {
			x: (self.min.x + self.max.x) / 2.0,
			y: (self.min.y + self.max.y) / 2.0,
			z: (self.min.z + self.max.z) / 2.0,
		}
	}

	pub fn width(&self) -> f64 {
		self.max.x - self.min.x
	}

	/// Minimum enclosing cube, anchored at the minimum corner.
	pub fn cubic(&self) -> BBox {
		let size = [
			self.max.x - self.min.x,
			self.max.y - self.min.y,
			self.max.z - self.min.z,
		]
		.iter()
		.cloned()
		.fold(f64::NEG_INFINITY, f64::max);

		BBox {
			min: self.min,
			max: Point {
				x: self.min.x + size,
				y: self.min.y + size,
				z: self.min.z + size,
			},
		}
	}

	/// Square in x and y only, the z extent left alone; the domain shape
	/// of a tubular tree.
	pub fn cubic_xy(&self) -> BBox {
		let size = (self.max.x - self.min.x).max(self.max.y - self.min.y);
		BBox {
			min: self.min,
			max: Point {
				x: self.min.x + size,
				y: self.min.y + size,
				z: self.max.z,
			},
		}
	}

	pub fn is_cubic(&self) -> bool {
		let dx = self.max.x - self.min.x;
		let dy = self.max.y - self.min.y;
		let dz = self.max.z - self.min.z;
		(dx - dy).abs() < f64::EPSILON * dx.abs() && (dx - dz).abs() < f64::EPSILON * dx.abs()
	}

	/// Halve toward one child in place. Axes absent from the direction's
	/// bits stay untouched, which is what keeps a tubular z unbounded.
	pub fn go(&mut self, dir: Dir) {
		let mid = self.mid();
		let i = dir.to_integral();
		if i & 1 != 0 {
			self.min.x = mid.x;
		} else {
			self.max.x = mid.x;
		}
		if i & 2 != 0 {
			self.min.y = mid.y;
		} else {
			self.max.y = mid.y;
		}
		if i & 4 != 0 {
			self.min.z = mid.z;
		} else {
			self.max.z = mid.z;
		}
	}

	pub fn child(&self, dir: Dir) -> BBox {
		let mut b = self.clone();
		b.go(dir);
		b
	}

	pub fn intersects(&self, other: &BBox) -> bool {
		self.min.x < other.max.x
			&& self.max.x > other.min.x
			&& self.min.y < other.max.y
			&& self.max.y > other.min.y
			&& self.min.z < other.max.z
			&& self.max.z > other.min.z
	}

	pub fn contains(&self, p: &Point) -> bool {
		p.x >= self.min.x
			&& p.x < self.max.x
			&& p.y >= self.min.y
			&& p.y < self.max.y
			&& p.z >= self.min.z
			&& p.z < self.max.z
	}

	pub fn to_array(&self) -> [f64; 6] {
		[
			self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z,
		]
	}

	pub fn from_array(a: [f64; 6]) -> BBox {
		BBox {
			min: Point::new(a[0], a[1], a[2]),
			max: Point::new(a[3], a[4], a[5]),
		}
	}
}

impl Serialize for BBox {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		self.to_array().serialize(serializer)
	}
}

impl<'de> Deserialize<'de> for BBox {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<BBox, D::Error> {
		let a = <[f64; 6]>::deserialize(deserializer)?;
		Ok(BBox::from_array(a))
	}
}
