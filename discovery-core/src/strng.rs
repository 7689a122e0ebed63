//! Cheaply clonable, immutable strings for identifier-heavy data structures.
//!
//! `Strng` is an alias so we can swap the implementation without touching
//! call sites. Most workload fields (ids, names, groups) are cloned into
//! several indices, which `ArcStr` makes an atomic refcount bump.

use arcstr::ArcStr;

pub type Strng = ArcStr;

/// Build a `Strng` at compile time from a literal.
pub use arcstr::literal;

/// `format!` for `Strng`.
pub use arcstr::format;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clones_share_storage() {
		let a = new("workload-1234");
		let b = a.clone();
		assert_eq!(a, b);
		assert_eq!(a.as_ptr(), b.as_ptr());
	}

	#[test]
	fn literal_is_static() {
		let l: Strng = literal!("data");
		assert_eq!(l, "data");
	}
}
