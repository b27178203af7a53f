//! In-memory authoritative zone data: wire-form names, per-zone label
//! storage and node trees, the lock-free zone registry, and the
//! quiescent-state reclamation that protects its readers.

use std::time::SystemTime;

use log::error;
use utils::error::*;

pub mod arena;
pub mod ltree;
pub mod name;
pub mod qsr;
pub mod registry;

use arena::{Arena, Span};
use ltree::{Node, RrSet, Tree};

/// Authoritative data for one owner name and its descendants. Immutable
/// once built; replacing a zone means installing a fresh `Zone` under the
/// same owner name and retiring this one.
pub struct Zone {
	name: Span,
	fingerprint: u32,
	serial: u32,
	mtime: SystemTime,
	src: String,
	arena: Arena,
	tree: Tree,
}

impl Zone {
	/// The owner name in wire form.
	pub fn name(&self) -> &[u8] {
		self.arena.get(self.name)
	}

	/// Fingerprint of the owner name, fixed at finalize time.
	pub fn fingerprint(&self) -> u32 {
		self.fingerprint
	}

	pub fn serial(&self) -> u32 {
		self.serial
	}

	pub fn mtime(&self) -> SystemTime {
		self.mtime
	}

	/// Human-readable source descriptor, e.g. `file:example.com`.
	pub fn src(&self) -> &str {
		&self.src
	}

	pub fn tree(&self) -> &Tree {
		&self.tree
	}

	pub fn arena(&self) -> &Arena {
		&self.arena
	}

	/// Walk to the node for `rest`, the run of query labels in front of
	/// this zone's owner name (what a suffix lookup leaves of the query).
	pub fn lookup(&self, rest: &[u8]) -> Option<&Node> {
		self.tree.lookup(&self.arena, rest).map(|id| self.tree.node(id))
	}
}

/// Assembles a detached zone. [`Builder::finish`] is the finalize step: it
/// computes the owner-name fingerprint and freezes the contents — `Zone`
/// has no mutating operations.
pub struct Builder {
	name: Span,
	serial: u32,
	mtime: SystemTime,
	src: String,
	arena: Arena,
	tree: Tree,
}

impl Builder {
	pub fn new(name_text: &str, src: &str) -> Result<Self> {
		let wire = name::from_text(name_text).or_log(|_| error!("Invalid zone name {name_text:?} from {src}"))?;

		let mut arena = Arena::default();
		let name = arena.alloc(&wire);
		let tree = Tree::new(&mut arena);

		Ok(Self {
			name,
			serial: 0,
			mtime: SystemTime::UNIX_EPOCH,
			src: src.to_owned(),
			arena,
			tree,
		})
	}

	pub fn serial(&mut self, serial: u32) -> &mut Self {
		self.serial = serial;
		self
	}

	pub fn mtime(&mut self, mtime: SystemTime) -> &mut Self {
		self.mtime = mtime;
		self
	}

	/// Add a record set at `owner`, which must be the zone name or a name
	/// below it.
	pub fn rrset(&mut self, owner: &str, set: RrSet) -> Result<&mut Self> {
		let src = &self.src;
		let wire = name::from_text(owner).or_log(|_| error!("Invalid owner name {owner:?} in {src}"))?;

		let zone_name = self.arena.get(self.name).to_vec();

		let below = wire.len() >= zone_name.len() && name::eq(&wire[wire.len() - zone_name.len()..], &zone_name);
		// the split in front of the zone name must land on a label boundary
		let rest = below.then(|| &wire[..wire.len() - zone_name.len()]);
		let labels = rest.and_then(name::raw_labels);

		let Some(mut labels) = labels else {
			error!("Owner name {owner:?} is outside zone {} from {}", name::display(&zone_name), self.src);
			return Err(());
		};

		labels.reverse();

		let id = self.tree.graft(&mut self.arena, &labels);
		self.tree.add_rrset(id, set);

		Ok(self)
	}

	/// Finalize: compute the invariants and lock the contents.
	pub fn finish(self) -> Zone {
		let fingerprint = name::hash(self.arena.get(self.name));

		Zone {
			name: self.name,
			fingerprint,
			serial: self.serial,
			mtime: self.mtime,
			src: self.src,
			arena: self.arena,
			tree: self.tree,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn a_record() -> RrSet {
		RrSet {
			rtype: 1,
			ttl: 300,
			rdata: vec![vec![192, 0, 2, 1].into_boxed_slice()],
		}
	}

	#[test]
	fn build_and_look_up() {
		let mut b = Builder::new("example.com.", "test").unwrap();
		b.serial(2024_01_01);
		b.rrset("www.example.com.", a_record()).unwrap();
		b.rrset("example.com.", a_record()).unwrap();

		let zone = b.finish();

		assert_eq!(zone.name(), b"\x07example\x03com\x00");
		assert_eq!(zone.fingerprint(), name::hash(zone.name()));
		assert_eq!(zone.serial(), 2024_01_01);

		// apex and child both resolve; matching ignores ASCII case
		assert!(zone.lookup(b"").unwrap().rrset(1).is_some());
		assert!(zone.lookup(b"\x03WWW").unwrap().rrset(1).is_some());
		assert!(zone.lookup(b"\x03ftp").is_none());
	}

	#[test]
	fn rejects_out_of_zone_owners() {
		let mut b = Builder::new("example.com.", "test").unwrap();
		assert!(b.rrset("www.example.org.", a_record()).is_err());
		// "ample.com." is a byte suffix but not a label-boundary suffix
		assert!(Builder::new("ample.com.", "test").unwrap().rrset("example.com.", a_record()).is_err());
	}
}
