//! Per-worker event counters. Each block has exactly one writer (the
//! owning worker); everyone else reads with relaxed loads.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};

use log::info;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
	pub fn inc(&self) {
		self.0.fetch_add(1, Relaxed);
	}

	pub fn get(&self) -> u64 {
		self.0.load(Relaxed)
	}
}

#[derive(Default)]
pub struct ProtoStats {
	pub recvfail: Counter,
	pub sendfail: Counter,
}

/// One worker's counter block.
#[derive(Default)]
pub struct Stats {
	pub udp: ProtoStats,
	pub tcp: ProtoStats,
	/// Datagrams discarded before processing (e.g. source port zero).
	pub dropped: Counter,

	// Reply classes, incremented by the packet processor.
	pub noerror: Counter,
	pub refused: Counter,
	pub nxdomain: Counter,
	pub notimp: Counter,
	pub formerr: Counter,
	pub servfail: Counter,
	/// Queries carrying an EDNS OPT record.
	pub edns: Counter,
	/// Queries arriving over IPv6.
	pub v6: Counter,
}

/// Every worker's block. Workers allocate at startup; the reporter sums on
/// demand.
#[derive(Default)]
pub struct Registry {
	blocks: Mutex<Vec<Arc<Stats>>>,
}

impl Registry {
	pub fn allocate(&self) -> Arc<Stats> {
		let block = Arc::new(Stats::default());
		self.blocks.lock().expect("Stats list intact").push(block.clone());
		block
	}

	/// Log one summary line across all workers.
	pub fn report(&self) {
		let blocks = self.blocks.lock().expect("Stats list intact");
		let sum = |f: fn(&Stats) -> &Counter| blocks.iter().map(|b| f(b).get()).sum::<u64>();

		info!(
			"noerror {} refused {} nxdomain {} notimp {} formerr {} servfail {} edns {} v6 {} dropped {} udp.recvfail {} udp.sendfail {} tcp.recvfail {} tcp.sendfail {}",
			sum(|s| &s.noerror),
			sum(|s| &s.refused),
			sum(|s| &s.nxdomain),
			sum(|s| &s.notimp),
			sum(|s| &s.formerr),
			sum(|s| &s.servfail),
			sum(|s| &s.edns),
			sum(|s| &s.v6),
			sum(|s| &s.dropped),
			sum(|s| &s.udp.recvfail),
			sum(|s| &s.udp.sendfail),
			sum(|s| &s.tcp.recvfail),
			sum(|s| &s.tcp.sendfail),
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_accumulate() {
		let reg = Registry::default();
		let a = reg.allocate();
		let b = reg.allocate();

		a.dropped.inc();
		a.dropped.inc();
		b.udp.recvfail.inc();

		assert_eq!(a.dropped.get(), 2);
		assert_eq!(b.udp.recvfail.get(), 1);
		assert_eq!(b.dropped.get(), 0);
	}
}
