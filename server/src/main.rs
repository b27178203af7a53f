use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use server::config::Config;
use server::daemon;
use server::packet::{Processor, ZoneAccess};
use server::stats::Stats;

/// Authoritative DNS server core.
#[derive(Parser)]
#[command(name = "cairnd", version)]
struct Args {
	/// Address to listen on; repeatable.
	#[arg(short, long = "listen")]
	listen: Vec<SocketAddr>,

	/// UDP worker threads per address.
	#[arg(long, default_value_t = 2)]
	udp_threads: usize,

	/// TCP worker threads per address.
	#[arg(long, default_value_t = 2)]
	tcp_threads: usize,

	/// Datagrams per batched receive; 1 disables batching.
	#[arg(long, default_value_t = 8)]
	udp_recv_width: usize,

	/// Per-connection TCP idle timeout in seconds.
	#[arg(long, default_value_t = 10)]
	tcp_timeout: u64,

	/// Simultaneous TCP clients per worker.
	#[arg(long, default_value_t = 128)]
	max_clients: usize,

	/// Lock the daemon's memory (mlockall).
	#[arg(long)]
	lock_mem: bool,

	/// Verbose debug output.
	#[arg(short = 'D', long)]
	debug: bool,
}

/// Stand-in packet logic so the daemon runs end to end: every well-formed
/// query is answered with REFUSED. Deployments plug their renderer in
/// through [`server::packet::Processor`].
struct Refuse;

impl Processor for Refuse {
	fn process(&self, _zones: &ZoneAccess, stats: &Stats, client: &SocketAddr, buf: &mut [u8], len: usize) -> usize {
		// too short to carry a header: ignore silently
		if len < 12 {
			return 0;
		}

		if client.is_ipv6() {
			stats.v6.inc();
		}

		// QR=1, keep opcode and RD, RCODE=REFUSED, no records
		buf[2] = 0x80 | (buf[2] & 0x79);
		buf[3] = 5;
		buf[6..12].fill(0);

		stats.refused.inc();
		len
	}
}

fn main() -> ExitCode {
	let args = Args::parse();

	runtime::logger::init(args.debug);

	let mut cfg = Config::default();

	if !args.listen.is_empty() {
		cfg.listen = args.listen;
	}

	cfg.udp_threads = args.udp_threads;
	cfg.tcp_threads = args.tcp_threads;
	cfg.udp_recv_width = args.udp_recv_width;
	cfg.tcp_timeout = Duration::from_secs(args.tcp_timeout);
	cfg.tcp_clients_per_thread = args.max_clients;
	cfg.lock_mem = args.lock_mem;

	// Zone sources are external collaborators; none are wired into the
	// stand-alone binary.
	match daemon::run(cfg, Vec::new(), Arc::new(Refuse)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(()) => ExitCode::FAILURE,
	}
}
