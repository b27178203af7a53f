//! End-to-end exercises against live workers on loopback sockets.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use server::config::Config;
use server::packet::{Processor, ZoneAccess};
use server::reload::{Entry, Reloader, Source};
use server::stats::Stats;
use server::{sock, tcp, udp};
use utils::error::Result;
use zone::registry::Registry;
use zone::{name, Builder, Zone};

/// Echoes the query payload straight back; a leading 0xff byte suppresses
/// the reply.
struct Echo;

impl Processor for Echo {
	fn process(&self, _zones: &ZoneAccess, _stats: &Stats, _client: &SocketAddr, buf: &mut [u8], len: usize) -> usize {
		if len == 0 || buf[0] == 0xff {
			return 0;
		}

		len
	}
}

fn test_cfg() -> Config {
	Config {
		tcp_timeout: Duration::from_secs(1),
		tcp_clients_per_thread: 2,
		udp_recv_width: 1,
		..Config::default()
	}
}

struct TcpHarness {
	addr: SocketAddr,
	stats: Arc<Stats>,
	stop: runtime::Notifier,
	worker: thread::JoinHandle<()>,
}

impl TcpHarness {
	fn start(cfg: Config) -> Self {
		let cfg = Arc::new(cfg);
		let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
		let sock = sock::tcp(&cfg, bind).unwrap();
		let addr = sock.local_addr().unwrap().as_socket().unwrap();

		let stats = Arc::new(Stats::default());
		let (stop, notified) = runtime::pair().unwrap();

		let w = tcp::Worker {
			sock,
			addr,
			stop: notified,
			cfg,
			registry: Arc::new(Registry::default()),
			stats: stats.clone(),
			processor: Arc::new(Echo),
		};

		let worker = thread::Builder::new()
			.name("io-tcp-test".into())
			.spawn(move || {
				let _ = tcp::run(w);
			})
			.unwrap();

		TcpHarness { addr, stats, stop, worker }
	}

	fn stop(self) {
		self.stop.notify();
		self.worker.join().unwrap();
	}
}

fn framed(payload: &[u8]) -> Vec<u8> {
	let mut out = (payload.len() as u16).to_be_bytes().to_vec();
	out.extend_from_slice(payload);
	out
}

fn read_reply(sock: &mut TcpStream) -> Vec<u8> {
	let mut prefix = [0u8; 2];
	sock.read_exact(&mut prefix).unwrap();

	let mut body = vec![0u8; u16::from_be_bytes(prefix) as usize];
	sock.read_exact(&mut body).unwrap();
	body
}

#[test]
fn tcp_framing_round_trip() {
	let h = TcpHarness::start(test_cfg());

	let mut c = TcpStream::connect(h.addr).unwrap();
	c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

	c.write_all(&framed(b"hello")).unwrap();
	assert_eq!(read_reply(&mut c), b"hello");

	// the connection is rearmed and reused for the next exchange
	c.write_all(&framed(b"again")).unwrap();
	assert_eq!(read_reply(&mut c), b"again");

	drop(c);
	h.stop();
}

#[test]
fn tcp_empty_reply_closes_the_connection() {
	let h = TcpHarness::start(test_cfg());

	let mut c = TcpStream::connect(h.addr).unwrap();
	c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
	c.write_all(&framed(&[0xff, 1, 2])).unwrap();

	let mut buf = [0u8; 1];
	assert_eq!(c.read(&mut buf).unwrap(), 0);

	h.stop();
}

#[test]
fn tcp_oversize_query_closes_and_counts() {
	let h = TcpHarness::start(test_cfg());

	let mut c = TcpStream::connect(h.addr).unwrap();
	c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

	// length prefix far beyond max_response
	c.write_all(&[0xff, 0xff, 0, 0]).unwrap();

	let mut buf = [0u8; 1];
	assert_eq!(c.read(&mut buf).unwrap(), 0);
	assert_eq!(h.stats.tcp.recvfail.get(), 1);

	h.stop();
}

#[test]
fn tcp_idle_connection_times_out() {
	let h = TcpHarness::start(test_cfg());

	let mut c = TcpStream::connect(h.addr).unwrap();
	c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

	// half a length prefix, then silence past the idle timeout
	c.write_all(&[0]).unwrap();

	let mut buf = [0u8; 1];
	assert_eq!(c.read(&mut buf).unwrap(), 0);
	assert_eq!(h.stats.tcp.recvfail.get(), 1);

	h.stop();
}

#[test]
fn tcp_max_clients_caps_concurrency() {
	let h = TcpHarness::start(test_cfg()); // cap is 2

	let mut c1 = TcpStream::connect(h.addr).unwrap();
	let mut c2 = TcpStream::connect(h.addr).unwrap();
	c1.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
	c2.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

	c1.write_all(&framed(b"one")).unwrap();
	assert_eq!(read_reply(&mut c1), b"one");
	c2.write_all(&framed(b"two")).unwrap();
	assert_eq!(read_reply(&mut c2), b"two");

	// with both slots held, the third client waits in the backlog
	let mut c3 = TcpStream::connect(h.addr).unwrap();
	c3.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
	c3.write_all(&framed(b"three")).unwrap();

	let mut buf = [0u8; 2];
	assert_eq!(c3.read(&mut buf).unwrap_err().kind(), ErrorKind::WouldBlock);

	// freeing a slot lets the worker accept it
	drop(c1);
	c3.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
	assert_eq!(read_reply(&mut c3), b"three");

	drop(c2);
	drop(c3);
	h.stop();
}

struct UdpHarness {
	addr: SocketAddr,
	worker: thread::JoinHandle<()>,
}

impl UdpHarness {
	fn start(cfg: Config) -> Self {
		let cfg = Arc::new(cfg);
		let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
		let sock = sock::udp(&cfg, bind).unwrap();
		let addr = sock.local_addr().unwrap().as_socket().unwrap();

		let w = udp::Worker {
			sock,
			addr,
			cfg,
			registry: Arc::new(Registry::default()),
			stats: Arc::new(Stats::default()),
			processor: Arc::new(Echo),
		};

		let worker = thread::Builder::new().name("io-udp-test".into()).spawn(move || udp::run(w)).unwrap();

		UdpHarness { addr, worker }
	}

	fn stop(self) {
		udp::request_stop(&self.worker);
		self.worker.join().unwrap();
	}
}

#[test]
fn udp_round_trip() {
	let h = UdpHarness::start(test_cfg());

	let c = UdpSocket::bind("127.0.0.1:0").unwrap();
	c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

	c.send_to(b"ping", h.addr).unwrap();

	let mut buf = [0u8; 64];
	let (n, from) = c.recv_from(&mut buf).unwrap();
	assert_eq!(&buf[..n], b"ping");
	assert_eq!(from, h.addr);

	h.stop();
}

#[cfg(target_os = "linux")]
#[test]
fn udp_batched_round_trip() {
	let mut cfg = test_cfg();
	cfg.udp_recv_width = 4;
	let h = UdpHarness::start(cfg);

	let c = UdpSocket::bind("127.0.0.1:0").unwrap();
	c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

	for i in 0..3u8 {
		c.send_to(&[b'q', i], h.addr).unwrap();
	}

	let mut got = Vec::new();
	let mut buf = [0u8; 64];

	for _ in 0..3 {
		let (n, _) = c.recv_from(&mut buf).unwrap();
		got.push(buf[..n].to_vec());
	}

	got.sort();
	assert_eq!(got, [vec![b'q', 0], vec![b'q', 1], vec![b'q', 2]]);

	// a suppressed datagram is compacted out of the outgoing batch
	c.send_to(&[0xff], h.addr).unwrap();
	c.send_to(b"ok", h.addr).unwrap();
	let (n, _) = c.recv_from(&mut buf).unwrap();
	assert_eq!(&buf[..n], b"ok");

	h.stop();
}

struct TestSource {
	zones: Mutex<Vec<(String, u32)>>,
	delay: Duration,
	broken: AtomicBool,
}

struct SourceHandle(Arc<TestSource>);

impl Source for SourceHandle {
	fn enumerate(&self) -> Result<Vec<Entry>> {
		thread::sleep(self.0.delay);

		if self.0.broken.load(Relaxed) {
			return Err(());
		}

		let entries = self
			.0
			.zones
			.lock()
			.unwrap()
			.iter()
			.map(|(name, serial)| Entry {
				name: name.clone(),
				src: format!("test:{name}"),
				bytes: serial.to_string().into_bytes(),
			})
			.collect();

		Ok(entries)
	}

	fn parse(&self, entry: &Entry) -> Result<Zone> {
		let serial: u32 = std::str::from_utf8(&entry.bytes).map_err(|_| ())?.parse().map_err(|_| ())?;

		// poison marker standing in for an unparseable zone
		if serial == 666 {
			return Err(());
		}

		let mut b = Builder::new(&entry.name, &entry.src)?;
		b.serial(serial);
		Ok(b.finish())
	}
}

#[test]
fn reload_installs_updates_and_removes() {
	let registry = Arc::new(Registry::default());
	let source = Arc::new(TestSource {
		zones: Mutex::new(vec![("example.com.".into(), 1), ("example.org.".into(), 1)]),
		delay: Duration::ZERO,
		broken: AtomicBool::new(false),
	});

	let (tx, rx) = mpsc::channel();
	let mut reloader = Reloader::new(registry.clone(), Arc::new(vec![Box::new(SourceHandle(source.clone())) as Box<dyn Source>]), tx);

	assert!(reloader.run_initial());

	let com = name::from_text("example.com.").unwrap();
	let org = name::from_text("example.org.").unwrap();

	assert_eq!(registry.installed(&com).unwrap().serial(), 1);
	assert_eq!(registry.installed(&org).unwrap().serial(), 1);

	// bump one zone, poison the other
	*source.zones.lock().unwrap() = vec![("example.com.".into(), 2), ("example.org.".into(), 666)];

	reloader.request();
	let ok = rx.recv_timeout(Duration::from_secs(5)).unwrap();
	reloader.finished(ok);
	assert!(!ok);

	assert_eq!(registry.installed(&com).unwrap().serial(), 2);
	// the failing zone keeps its previously installed data
	assert_eq!(registry.installed(&org).unwrap().serial(), 1);

	// a zone the source no longer mentions is removed on the next pass
	*source.zones.lock().unwrap() = vec![("example.com.".into(), 3)];

	reloader.request();
	let ok = rx.recv_timeout(Duration::from_secs(5)).unwrap();
	reloader.finished(ok);
	assert!(ok);

	assert_eq!(registry.installed(&com).unwrap().serial(), 3);
	assert!(registry.installed(&org).is_none());
}

#[test]
fn reload_keeps_zones_when_a_source_fails_to_enumerate() {
	let registry = Arc::new(Registry::default());
	let source = Arc::new(TestSource {
		zones: Mutex::new(vec![("example.com.".into(), 1)]),
		delay: Duration::ZERO,
		broken: AtomicBool::new(false),
	});

	let (tx, rx) = mpsc::channel();
	let mut reloader = Reloader::new(registry.clone(), Arc::new(vec![Box::new(SourceHandle(source.clone())) as Box<dyn Source>]), tx);

	assert!(reloader.run_initial());

	let com = name::from_text("example.com.").unwrap();
	assert_eq!(registry.installed(&com).unwrap().serial(), 1);

	// a source that cannot enumerate must not look like it removed its
	// zones
	source.broken.store(true, Relaxed);

	reloader.request();
	let ok = rx.recv_timeout(Duration::from_secs(5)).unwrap();
	reloader.finished(ok);
	assert!(!ok);

	assert_eq!(registry.installed(&com).unwrap().serial(), 1);

	// once it recovers, an empty listing is a real removal again
	source.broken.store(false, Relaxed);
	*source.zones.lock().unwrap() = Vec::new();

	reloader.request();
	let ok = rx.recv_timeout(Duration::from_secs(5)).unwrap();
	reloader.finished(ok);
	assert!(ok);

	assert!(registry.installed(&com).is_none());
}

#[test]
fn reload_requests_coalesce() {
	let registry = Arc::new(Registry::default());
	let source = Arc::new(TestSource {
		zones: Mutex::new(vec![("example.com.".into(), 1)]),
		delay: Duration::from_millis(300),
		broken: AtomicBool::new(false),
	});

	let (tx, rx) = mpsc::channel();
	let mut reloader = Reloader::new(registry, Arc::new(vec![Box::new(SourceHandle(source)) as Box<dyn Source>]), tx);

	// one running, one queued; the rest coalesce away
	reloader.request();
	reloader.request();
	reloader.request();
	reloader.request();

	let ok = rx.recv_timeout(Duration::from_secs(5)).unwrap();
	reloader.finished(ok);
	assert!(ok);

	let ok = rx.recv_timeout(Duration::from_secs(5)).unwrap();
	reloader.finished(ok);
	assert!(ok);

	// nothing further was queued
	assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());
}
