use std::fmt;

use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::model::dir::Dir;

/// Node or chunk identifier. Depth is unbounded, so ids must grow past
/// any fixed width: at 3 dimensions every level shifts by 3 bits.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub(crate) BigUint);

impl Id {
	pub fn zero() -> Id {
		Id(BigUint::default())
	}

	pub fn from_u64(v: u64) -> Id {
		Id(BigUint::from(v))
	}

	/// The child id one level down: `(id << dims) + 1 + dir`.
	pub fn climb(&self, dims: u32, dir: Dir) -> Id {
		Id((&self.0 << dims as usize) + 1u64 + dir.to_integral())
	}

	/// The value as a plain integer, when it still fits one.
	pub fn simple(&self) -> Option<u64> {
		self.0.to_u64()
	}

	pub fn is_zero(&self) -> bool {
		self.simple() == Some(0)
	}

	/// Storage name for this id: decimal, or hex for prefixed layouts.
	pub fn name(&self, hex: bool) -> String {
		if hex {
			format!("{:x}", self.0)
		} else {
			self.0.to_string()
		}
	}
}

impl fmt::Display for Id {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_climb() {
		let root = Id::zero();
		let a = root.climb(2, Dir::Swd);
		let b = root.climb(2, Dir::Ned);
		assert_eq!(a.simple(), Some(1));
		assert_eq!(b.simple(), Some(4));
	}

	#[test]
	fn test_climb_distinct_paths() {
		// Two different ids never collide after identical climbs.
		let a = Id::from_u64(5);
		let b = Id::from_u64(6);
		let climb = |id: &Id| {
			id.climb(3, Dir::Sed).climb(3, Dir::Nwu)
		};
		assert_ne!(climb(&a), climb(&b));
	}

	#[test]
	fn test_climb_outgrows_u64() {
		let mut id = Id::zero();
		for _ in 0..30 {
			id = id.climb(3, Dir::Neu);
		}
		assert_eq!(id.simple(), None);
		assert!(!id.name(false).is_empty());
	}

	#[test]
	fn test_names() {
		let id = Id::from_u64(255);
		assert_eq!(id.name(false), "255");
		assert_eq!(id.name(true), "ff");
	}
}
