//! The owner name → zone map. Lookups run lock-free against an immutable
//! table published through a single atomic pointer; a lone writer rebuilds
//! the table for every change and retires the previous one through
//! quiescent-state reclamation.

use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Acquire, SeqCst};
use std::sync::{Arc, Mutex};

use log::info;

use crate::name;
use crate::qsr::{Qsr, Reader};
use crate::Zone;

/// A best-suffix lookup hit: the owning zone and the byte offset within the
/// query name at which its owner name begins.
pub struct Found<'g> {
	pub zone: &'g Zone,
	pub auth_depth: usize,
}

pub struct Registry {
	table: AtomicPtr<Table>,
	write: Mutex<()>,
	qsr: Arc<Qsr>,
}

struct Table {
	mask: u32,
	buckets: Box<[Vec<Arc<Zone>>]>,
}

impl Table {
	fn build(zones: Vec<Arc<Zone>>) -> Box<Table> {
		let cap = (zones.len() * 2).next_power_of_two().max(8);
		let mut buckets = vec![Vec::new(); cap].into_boxed_slice();
		let mask = (cap - 1) as u32;

		for z in zones {
			buckets[(z.fingerprint() & mask) as usize].push(z);
		}

		Box::new(Table { mask, buckets })
	}

	fn get(&self, hash: u32, name: &[u8]) -> Option<&Arc<Zone>> {
		self.buckets[(hash & self.mask) as usize].iter().find(|z| name::eq(z.name(), name))
	}

	fn zones(&self) -> impl Iterator<Item = &Arc<Zone>> {
		self.buckets.iter().flatten()
	}
}

impl Default for Registry {
	fn default() -> Self {
		Self {
			table: AtomicPtr::new(Box::into_raw(Table::build(Vec::new()))),
			write: Mutex::new(()),
			qsr: Arc::default(),
		}
	}
}

impl Registry {
	/// Register the calling thread as a lookup reader.
	pub fn reader(&self) -> Reader {
		self.qsr.register()
	}

	/// Find the installed zone whose owner name is the longest
	/// label-boundary suffix of `name`, and the offset at which that suffix
	/// starts. Never fails; a malformed name simply finds nothing.
	///
	/// The borrow is pinned by the reader token: `quiesce` and `offline`
	/// take `&mut Reader`, which ends every outstanding `Found`.
	pub fn find<'g>(&self, reader: &'g Reader, name: &[u8]) -> Option<Found<'g>> {
		debug_assert!(reader.is_online());

		// Live until every reader that can see it has quiesced, which the
		// 'g bound rules out for the caller.
		let table: &'g Table = unsafe { &*self.table.load(Acquire) };

		let mut off = 0;

		loop {
			let suffix = name.get(off..)?;

			if let Some(zone) = table.get(name::hash(suffix), suffix) {
				return Some(Found { zone: &**zone, auth_depth: off });
			}

			// Strip the leading label and retry; the zero label ends the
			// walk with the root already probed.
			match *name.get(off)? {
				0 => return None,
				len => off += len as usize + 1,
			}
		}
	}

	/// Install (`None`/`Some`), replace (`Some`/`Some`, same owner name) or
	/// remove (`Some`/`None`) a single zone. Single-writer; precondition
	/// violations abort.
	pub fn update(&self, old: Option<&Arc<Zone>>, new: Option<Arc<Zone>>) {
		assert!(old.is_some() || new.is_some(), "update() needs a zone to install or remove");

		if let (Some(o), Some(n)) = (old, new.as_ref()) {
			assert!(name::eq(o.name(), n.name()), "replacement zone changes the owner name");
		}

		let guard = self.write.lock().expect("Single writer");

		// The pointer only changes under the write lock.
		let cur = unsafe { &*self.table.load(Acquire) };

		match (old, new.as_ref()) {
			(None, Some(n)) => info!("Zone {}: loaded from {} with serial {}", name::display(n.name()), n.src(), n.serial()),
			(Some(o), Some(n)) => info!(
				"Zone {}: replaced from {} (serial {} -> {})",
				name::display(n.name()),
				n.src(),
				o.serial(),
				n.serial()
			),
			(Some(o), None) => info!("Zone {}: removed (was from {})", name::display(o.name()), o.src()),
			(None, None) => unreachable!(),
		}

		let mut removed = 0;
		let mut zones = Vec::with_capacity(cur.zones().count() + 1);

		for z in cur.zones() {
			if let Some(o) = old {
				if name::eq(z.name(), o.name()) {
					removed += 1;
					continue;
				}
			}

			zones.push(z.clone());
		}

		assert!(old.is_none() || removed == 1, "old zone was not installed");

		if let Some(n) = new {
			zones.push(n);
		}

		let next = Box::into_raw(Table::build(zones));
		let prev = self.table.swap(next, SeqCst);

		// Readers that already picked up the old table keep it alive until
		// their next quiescent point; free it only after that.
		self.qsr.synchronize();
		drop(unsafe { Box::from_raw(prev) });

		drop(guard);
	}

	/// Writer-side exact-match lookup, for the reloader.
	pub fn installed(&self, name_wire: &[u8]) -> Option<Arc<Zone>> {
		let _guard = self.write.lock().expect("Single writer");
		let cur = unsafe { &*self.table.load(Acquire) };

		cur.get(name::hash(name_wire), name_wire).cloned()
	}

	/// Writer-side snapshot of every installed zone, for the reloader.
	pub fn snapshot(&self) -> Vec<Arc<Zone>> {
		let _guard = self.write.lock().expect("Single writer");
		let cur = unsafe { &*self.table.load(Acquire) };

		cur.zones().cloned().collect()
	}
}

impl Drop for Registry {
	fn drop(&mut self) {
		drop(unsafe { Box::from_raw(self.table.load(Acquire)) });
	}
}

#[cfg(test)]
mod tests {
	use std::thread;
	use std::time::Duration;

	use super::*;
	use crate::Builder;

	fn zone(text: &str, serial: u32) -> Arc<Zone> {
		let mut b = Builder::new(text, "test").unwrap();
		b.serial(serial);
		Arc::new(b.finish())
	}

	fn wire(text: &str) -> Box<[u8]> {
		name::from_text(text).unwrap()
	}

	#[test]
	fn longest_suffix_wins() {
		let reg = Registry::default();
		reg.update(None, Some(zone("example.com.", 1)));
		reg.update(None, Some(zone("sub.example.com.", 1)));

		let reader = reg.reader();

		// past the "www" label (length byte + 3 bytes)
		let hit = reg.find(&reader, &wire("www.sub.example.com.")).unwrap();
		assert!(name::eq(hit.zone.name(), &wire("sub.example.com.")));
		assert_eq!(hit.auth_depth, 4);

		let hit = reg.find(&reader, &wire("other.example.com.")).unwrap();
		assert!(name::eq(hit.zone.name(), &wire("example.com.")));
		assert_eq!(hit.auth_depth, 6);

		// exact match of the owner name itself
		let hit = reg.find(&reader, &wire("sub.example.com.")).unwrap();
		assert_eq!(hit.auth_depth, 0);
	}

	#[test]
	fn matches_only_at_label_boundaries() {
		let reg = Registry::default();
		reg.update(None, Some(zone("ample.com.", 1)));

		let reader = reg.reader();
		assert!(reg.find(&reader, &wire("example.com.")).is_none());
	}

	#[test]
	fn matching_is_ascii_case_insensitive() {
		let reg = Registry::default();
		reg.update(None, Some(zone("Example.COM.", 1)));

		let reader = reg.reader();
		assert!(reg.find(&reader, &wire("www.example.com.")).is_some());
	}

	#[test]
	fn root_zone_catches_everything() {
		let reg = Registry::default();
		reg.update(None, Some(zone(".", 1)));

		let reader = reg.reader();
		let q = wire("www.example.com.");
		let hit = reg.find(&reader, &q).unwrap();
		assert_eq!(hit.auth_depth, q.len() - 1);
	}

	#[test]
	fn replace_and_remove() {
		let reg = Registry::default();
		let v1 = zone("example.com.", 1);
		let v2 = zone("example.com.", 2);

		reg.update(None, Some(v1.clone()));
		reg.update(Some(&v1), Some(v2.clone()));

		{
			let reader = reg.reader();
			let hit = reg.find(&reader, &wire("example.com.")).unwrap();
			assert_eq!(hit.zone.serial(), 2);
		}

		// the retired zone is fully released once update() returns
		assert_eq!(Arc::strong_count(&v1), 1);

		reg.update(Some(&v2), None);
		let reader = reg.reader();
		assert!(reg.find(&reader, &wire("example.com.")).is_none());
	}

	#[test]
	fn self_replacement_is_a_noop() {
		let reg = Registry::default();
		let z = zone("example.com.", 1);

		reg.update(None, Some(z.clone()));
		reg.update(Some(&z), Some(z.clone()));

		let reader = reg.reader();
		let hit = reg.find(&reader, &wire("example.com.")).unwrap();
		assert!(std::ptr::eq(hit.zone, &*z));
	}

	#[test]
	#[should_panic]
	fn replacing_a_missing_zone_aborts() {
		let reg = Registry::default();
		let z = zone("example.com.", 1);
		reg.update(Some(&z), None);
	}

	#[test]
	fn readers_never_observe_reclaimed_zones() {
		let reg = Arc::new(Registry::default());
		let seed = zone("example.com.", 0);
		reg.update(None, Some(seed.clone()));

		let mut handles = Vec::new();

		for _ in 0..16 {
			let reg = reg.clone();
			handles.push(thread::spawn(move || {
				let mut reader = reg.reader();
				let q = wire("www.example.com.");

				for _ in 0..2000 {
					{
						let hit = reg.find(&reader, &q).unwrap();
						// a torn or reclaimed zone would fail here
						assert!(name::eq(hit.zone.name(), &wire("example.com.")));
						let _ = hit.zone.serial();
					}
					reader.quiesce();
				}
			}));
		}

		let mut old = seed;

		for serial in 1..50 {
			let new = zone("example.com.", serial);
			reg.update(Some(&old), Some(new.clone()));

			// once update() has synchronized, nothing else may still hold
			// the retired zone
			assert_eq!(Arc::strong_count(&old), 1);
			old = new;
			thread::sleep(Duration::from_micros(200));
		}

		for h in handles {
			h.join().unwrap();
		}
	}
}
