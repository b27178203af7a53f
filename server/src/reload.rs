//! Zone data reload orchestration. At most one reload runs at a time; one
//! more may queue behind it, and further requests coalesce into that one.
//! Every zone update is independent: a zone that fails to build keeps its
//! previously installed data.

use std::collections::HashSet;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info};
use utils::error::*;
use zone::registry::Registry;
use zone::{name, Zone};

/// One zone's raw payload from a source.
pub struct Entry {
	/// Owner name in text form, e.g. `example.com.`
	pub name: String,
	/// Human-readable descriptor, e.g. `file:example.com`
	pub src: String,
	pub bytes: Vec<u8>,
}

/// A provider of zone payloads. The reload orchestrator is the sole
/// consumer; building a `Zone` out of a payload is the source's business.
pub trait Source: Send + Sync {
	/// List every zone this source currently provides.
	fn enumerate(&self) -> Result<Vec<Entry>>;

	/// Build a finalized zone from one payload.
	fn parse(&self, entry: &Entry) -> Result<Zone>;
}

pub struct Reloader {
	registry: Arc<Registry>,
	sources: Arc<Vec<Box<dyn Source>>>,
	done: Sender<bool>,
	running: Option<JoinHandle<()>>,
	pending: bool,
}

impl Reloader {
	pub fn new(registry: Arc<Registry>, sources: Arc<Vec<Box<dyn Source>>>, done: Sender<bool>) -> Self {
		Self {
			registry,
			sources,
			done,
			running: None,
			pending: false,
		}
	}

	/// Run one pass on the calling thread; the synchronous initial load.
	pub fn run_initial(&self) -> bool {
		run(&self.registry, &self.sources)
	}

	/// Request an asynchronous reload. Requests made while one is already
	/// queued are dropped.
	pub fn request(&mut self) {
		if self.running.is_some() {
			self.pending = true;
			return;
		}

		info!("Reloading zone data");

		let registry = self.registry.clone();
		let sources = self.sources.clone();
		let done = self.done.clone();

		let handle = thread::Builder::new()
			.name("zone-reload".into())
			.spawn(move || {
				let ok = run(&registry, &sources);
				let _ = done.send(ok);
			})
			.expect("Thread spawn");

		self.running = Some(handle);
	}

	/// Note a completed reload, after its message arrived on the `done`
	/// channel. Starts the queued pass if one coalesced.
	pub fn finished(&mut self, ok: bool) {
		if let Some(handle) = self.running.take() {
			let _ = handle.join();
		}

		if ok {
			info!("Reloading zone data successful");
		} else {
			error!("Reloading zone data failed");
		}

		if self.pending {
			self.pending = false;
			self.request();
		}
	}

	/// Wait out an in-flight pass; the completion message is discarded.
	pub fn shutdown(&mut self) {
		if let Some(handle) = self.running.take() {
			let _ = handle.join();
		}
	}
}

fn key(wire: &[u8]) -> Vec<u8> {
	wire.to_ascii_lowercase()
}

/// One pass: rebuild and install every enumerated zone, then drop installed
/// zones no source mentions anymore. A zone that fails to build stays
/// listed as seen, so its previous installation survives. When a source
/// fails to enumerate at all, its zone list is unknown and nothing can be
/// told apart from a removal, so the removal step is skipped for the whole
/// pass.
fn run(registry: &Registry, sources: &[Box<dyn Source>]) -> bool {
	let mut ok = true;
	let mut enumerated_all = true;
	let mut seen: HashSet<Vec<u8>> = HashSet::new();

	for source in sources {
		let entries = match source.enumerate() {
			Ok(entries) => entries,
			Err(()) => {
				enumerated_all = false;
				ok = false;
				continue;
			}
		};

		for entry in entries {
			let Ok(wire) = name::from_text(&entry.name) else {
				error!("Skipping zone with invalid name {:?} from {}", entry.name, entry.src);
				ok = false;
				continue;
			};

			match source.parse(&entry) {
				Ok(new) => {
					let new = Arc::new(new);
					debug_assert!(name::eq(new.name(), &wire));

					seen.insert(key(new.name()));

					let old = registry.installed(new.name());
					registry.update(old.as_ref(), Some(new));
				}
				Err(()) => {
					error!("Zone {}: rebuild failed, keeping previous data", entry.name);
					seen.insert(key(&wire));
					ok = false;
				}
			}
		}
	}

	if enumerated_all {
		for stale in registry.snapshot() {
			if !seen.contains(&key(stale.name())) {
				registry.update(Some(&stale), None);
			}
		}
	}

	ok
}
