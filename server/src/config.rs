use std::net::SocketAddr;
use std::time::Duration;

/// Largest query accepted on the wire. Responses are bounded separately by
/// [`Config::max_response`].
pub const DNS_RECV_SIZE: usize = 1024;

/// Runtime configuration. Parsing and validating external configuration is
/// out of scope; this is the in-memory shape the daemon runs from.
#[derive(Clone)]
pub struct Config {
	/// Addresses to serve; each gets `udp_threads` + `tcp_threads` workers
	/// sharing the port through SO_REUSEPORT.
	pub listen: Vec<SocketAddr>,
	pub udp_threads: usize,
	pub tcp_threads: usize,
	/// Datagrams moved per batched syscall; 1 disables batching.
	pub udp_recv_width: usize,
	/// Largest response the packet processor may produce.
	pub max_response: usize,
	/// Explicit socket buffer sizes; `None` negotiates with the kernel.
	pub udp_rcvbuf: Option<usize>,
	pub udp_sndbuf: Option<usize>,
	/// Per-connection TCP idle timeout.
	pub tcp_timeout: Duration,
	pub tcp_clients_per_thread: usize,
	/// Lock the daemon's memory with mlockall at startup.
	pub lock_mem: bool,
	pub stats_interval: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			listen: vec!["127.0.0.1:5353".parse().expect("Literal address")],
			udp_threads: 2,
			tcp_threads: 2,
			udp_recv_width: 8,
			max_response: 16384,
			udp_rcvbuf: None,
			udp_sndbuf: None,
			tcp_timeout: Duration::from_secs(10),
			tcp_clients_per_thread: 128,
			lock_mem: false,
			stats_interval: Duration::from_secs(60),
		}
	}
}
