//! Process lifecycle: memory locking, the initial zone load, socket
//! binding, worker spawn with the signal-mask dance, the control loop, and
//! orderly shutdown.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};
use runtime::Notifier;
use utils::error::*;
use zone::registry::Registry;

use crate::config::Config;
use crate::packet::Processor;
use crate::reload::{Reloader, Source};
use crate::{sock, stats, tcp, udp};

static TERMINATE: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn reload_handler(_: libc::c_int) {
	RELOAD.store(true, Relaxed);
}

/// Block every signal while `f` spawns threads, so they inherit a full
/// mask, then restore. UDP workers punch their stop signal back out
/// themselves.
fn with_signals_blocked<T>(f: impl FnOnce() -> T) -> T {
	unsafe {
		let mut all: libc::sigset_t = std::mem::zeroed();
		let mut prev: libc::sigset_t = std::mem::zeroed();

		libc::sigfillset(&mut all);
		libc::pthread_sigmask(libc::SIG_SETMASK, &all, &mut prev);

		let out = f();

		libc::pthread_sigmask(libc::SIG_SETMASK, &prev, std::ptr::null_mut());
		out
	}
}

struct Workers {
	udp: Vec<JoinHandle<()>>,
	tcp: Vec<(JoinHandle<()>, Notifier)>,
}

/// Run the daemon to completion. Returns `Err` only for fatal startup
/// conditions; a clean signal-driven exit is `Ok`.
pub fn run(cfg: Config, sources: Vec<Box<dyn Source>>, processor: Arc<dyn Processor>) -> Result {
	let cfg = Arc::new(cfg);

	if cfg.lock_mem && unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
		error!("mlockall() failed: {}", std::io::Error::last_os_error());
		return Err(());
	}

	let registry = Arc::new(Registry::default());
	let stats = Arc::new(stats::Registry::default());

	let (done_tx, done_rx) = mpsc::channel();
	let mut reloader = Reloader::new(registry.clone(), Arc::new(sources), done_tx);

	// The initial load is synchronous; a broken zone set is fatal here and
	// only here.
	if !reloader.run_initial() {
		error!("Initial load of zone data failed");
		return Err(());
	}

	// Bind everything before any worker starts.
	let mut udp_socks = Vec::new();
	let mut tcp_socks = Vec::new();

	for &addr in &cfg.listen {
		for _ in 0..cfg.udp_threads {
			udp_socks.push((sock::udp(&cfg, addr)?, addr));
		}

		for _ in 0..cfg.tcp_threads {
			tcp_socks.push((sock::tcp(&cfg, addr)?, addr));
		}
	}

	udp::init();

	let workers = with_signals_blocked(|| -> Result<Workers> {
		let mut udp_workers = Vec::new();

		for (i, (sock, addr)) in udp_socks.into_iter().enumerate() {
			let w = udp::Worker {
				sock,
				addr,
				cfg: cfg.clone(),
				registry: registry.clone(),
				stats: stats.allocate(),
				processor: processor.clone(),
			};

			let handle = thread::Builder::new()
				.name(format!("io-udp-{i}"))
				.spawn(move || udp::run(w))
				.or_log(|e| error!("Failed to spawn UDP worker for {addr}: {e}"))?;

			udp_workers.push(handle);
		}

		let mut tcp_workers = Vec::new();

		for (i, (sock, addr)) in tcp_socks.into_iter().enumerate() {
			let (notifier, notified) = runtime::pair()?;

			let w = tcp::Worker {
				sock,
				addr,
				stop: notified,
				cfg: cfg.clone(),
				registry: registry.clone(),
				stats: stats.allocate(),
				processor: processor.clone(),
			};

			let handle = thread::Builder::new()
				.name(format!("io-tcp-{i}"))
				.spawn(move || {
					let _ = tcp::run(w);
				})
				.or_log(|e| error!("Failed to spawn TCP worker for {addr}: {e}"))?;

			tcp_workers.push((handle, notifier));
		}

		Ok(Workers { udp: udp_workers, tcp: tcp_workers })
	})?;

	ctrlc::set_handler(|| TERMINATE.store(true, Relaxed)).or_log(|e| error!("Failed to install termination handler: {e}"))?;

	// SIGHUP requests a zone reload. Installed after ctrlc so this wins.
	unsafe {
		let mut sa: libc::sigaction = std::mem::zeroed();
		sa.sa_sigaction = reload_handler as extern "C" fn(libc::c_int) as usize;
		libc::sigfillset(&mut sa.sa_mask);
		sa.sa_flags = 0;
		libc::sigaction(libc::SIGHUP, &sa, std::ptr::null_mut());
	}

	let reporter = {
		let stats = stats.clone();
		let interval = cfg.stats_interval;

		thread::Builder::new()
			.name("stats".into())
			.spawn(move || {
				let mut elapsed = Duration::ZERO;

				loop {
					thread::sleep(Duration::from_millis(500));

					if TERMINATE.load(Relaxed) {
						return;
					}

					elapsed += Duration::from_millis(500);

					if elapsed >= interval {
						elapsed = Duration::ZERO;
						stats.report();
					}
				}
			})
			.or_log(|e| error!("Failed to spawn stats reporter: {e}"))?
	};

	info!("DNS listeners started");

	loop {
		if TERMINATE.load(Relaxed) {
			break;
		}

		if RELOAD.swap(false, Relaxed) {
			reloader.request();
		}

		match done_rx.recv_timeout(Duration::from_millis(250)) {
			Ok(ok) => reloader.finished(ok),
			Err(RecvTimeoutError::Timeout) => {}
			Err(RecvTimeoutError::Disconnected) => break,
		}
	}

	info!("Exiting cleanly on receipt of a terminating signal");

	// Stop the I/O threads: async notifiers for TCP, the stop signal for
	// UDP; then wait them all out.
	for (_, notifier) in &workers.tcp {
		notifier.notify();
	}

	for handle in &workers.udp {
		udp::request_stop(handle);
	}

	for handle in workers.udp {
		let _ = handle.join();
	}

	for (handle, _) in workers.tcp {
		let _ = handle.join();
	}

	reloader.shutdown();
	let _ = reporter.join();

	stats.report();

	Ok(())
}
