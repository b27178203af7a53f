//! Quiescent-state reclamation. Readers periodically announce that they
//! hold no references (a quiescent point) or that they are parked in a
//! blocking wait (offline). A writer that has detached data waits for one
//! full grace period before freeing it.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const OFFLINE: u64 = 0;

/// The shared grace-period state. One instance protects one family of
/// read-mostly structures.
pub struct Qsr {
	/// Current period. Starts at 1; 0 is reserved for offline readers.
	period: AtomicU64,
	readers: Mutex<Vec<Arc<Slot>>>,
}

struct Slot {
	/// Last period this reader observed, or `OFFLINE`.
	ctr: AtomicU64,
}

impl Default for Qsr {
	fn default() -> Self {
		Self {
			period: AtomicU64::new(1),
			readers: Mutex::new(Vec::new()),
		}
	}
}

impl Qsr {
	/// Register the calling thread as a reader. The reader starts online.
	pub fn register(self: &Arc<Self>) -> Reader {
		let slot = Arc::new(Slot {
			ctr: AtomicU64::new(self.period.load(SeqCst)),
		});

		self.readers.lock().expect("Reader list intact").push(slot.clone());

		Reader {
			qsr: self.clone(),
			slot,
			online: true,
		}
	}

	/// Wait until every reader registered before the call has either gone
	/// offline or passed a quiescent point since the call began. Anything
	/// retired before the call is unreachable afterwards.
	pub fn synchronize(&self) {
		let target = self.period.fetch_add(1, SeqCst) + 1;
		let readers = self.readers.lock().expect("Reader list intact");

		for slot in readers.iter() {
			loop {
				let seen = slot.ctr.load(SeqCst);

				if seen == OFFLINE || seen >= target {
					break;
				}

				// An online reader quiesces once per loop pass; a blocked
				// one is offline by contract. The wait stays short.
				thread::sleep(Duration::from_micros(50));
			}
		}
	}
}

/// A registered reader. State transitions take `&mut self`, so borrows
/// handed out during a read section cannot survive the section's end.
/// Dropping the reader unregisters it.
pub struct Reader {
	qsr: Arc<Qsr>,
	slot: Arc<Slot>,
	online: bool,
}

impl Reader {
	/// Declare that references may be held from now on. Idempotent.
	pub fn online(&mut self) {
		if !self.online {
			self.slot.ctr.store(self.qsr.period.load(SeqCst), SeqCst);
			self.online = true;
		}
	}

	/// Declare that no references are held and none will be taken until the
	/// next `online`. Required before any blocking wait of unbounded
	/// duration. Idempotent.
	pub fn offline(&mut self) {
		if self.online {
			self.slot.ctr.store(OFFLINE, SeqCst);
			self.online = false;
		}
	}

	/// Pass through a quiescent point: no references held right now.
	pub fn quiesce(&mut self) {
		debug_assert!(self.online);
		self.slot.ctr.store(self.qsr.period.load(SeqCst), SeqCst);
	}

	pub fn is_online(&self) -> bool {
		self.online
	}
}

impl Drop for Reader {
	fn drop(&mut self) {
		self.slot.ctr.store(OFFLINE, SeqCst);

		let mut readers = self.qsr.readers.lock().expect("Reader list intact");
		readers.retain(|s| !Arc::ptr_eq(s, &self.slot));
	}
}

#[cfg(test)]
mod tests {
	use std::sync::mpsc;
	use std::time::Instant;

	use super::*;

	#[test]
	fn offline_reader_never_blocks_the_writer() {
		let qsr = Arc::new(Qsr::default());
		let mut reader = qsr.register();

		reader.offline();

		let start = Instant::now();
		qsr.synchronize();
		assert!(start.elapsed() < Duration::from_millis(100));
	}

	#[test]
	fn writer_waits_for_online_readers() {
		let qsr = Arc::new(Qsr::default());
		let mut reader = qsr.register();

		reader.online();

		let (tx, rx) = mpsc::channel();
		let writer = {
			let qsr = qsr.clone();
			thread::spawn(move || {
				qsr.synchronize();
				tx.send(()).unwrap();
			})
		};

		// The reader has not quiesced yet, so the writer must still be
		// inside synchronize().
		assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

		// Quiescing (repeatedly, in case the writer was slow to start)
		// lets it through.
		while rx.try_recv().is_err() {
			reader.quiesce();
			thread::sleep(Duration::from_millis(1));
		}

		writer.join().unwrap();
	}

	#[test]
	fn going_offline_releases_the_writer() {
		let qsr = Arc::new(Qsr::default());
		let mut reader = qsr.register();

		reader.online();

		let writer = {
			let qsr = qsr.clone();
			thread::spawn(move || qsr.synchronize())
		};

		thread::sleep(Duration::from_millis(20));
		reader.offline();
		writer.join().unwrap();
	}

	#[test]
	fn dropped_readers_unregister() {
		let qsr = Arc::new(Qsr::default());
		let reader = qsr.register();

		drop(reader);
		qsr.synchronize();
		assert!(qsr.readers.lock().unwrap().is_empty());
	}
}
