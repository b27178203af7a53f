//! The seam to the DNS packet logic. Parsing and rendering live outside
//! this crate; the workers hand over the raw query plus transport metadata
//! and send back whatever comes out.

use std::net::SocketAddr;

use zone::qsr::Reader;
use zone::registry::{Found, Registry};

use crate::stats::Stats;

/// Zone lookup capability lent to the packet processor for one query. It
/// couples the registry with the worker's reclamation reader, so a borrowed
/// zone cannot outlive the read section it was found in.
pub struct ZoneAccess<'a> {
	registry: &'a Registry,
	reader: &'a Reader,
}

impl<'a> ZoneAccess<'a> {
	pub fn new(registry: &'a Registry, reader: &'a Reader) -> Self {
		debug_assert!(reader.is_online());
		Self { registry, reader }
	}

	/// Best-suffix zone lookup; see [`Registry::find`].
	pub fn find(&self, name: &[u8]) -> Option<Found<'a>> {
		self.registry.find(self.reader, name)
	}
}

pub trait Processor: Send + Sync {
	/// Handle one query of `len` bytes at the front of `buf`, writing any
	/// reply over it. Returns the reply length, bounded by the configured
	/// maximum response size; 0 suppresses the reply entirely.
	fn process(&self, zones: &ZoneAccess, stats: &Stats, client: &SocketAddr, buf: &mut [u8], len: usize) -> usize;
}
