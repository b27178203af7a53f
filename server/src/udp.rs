//! UDP I/O workers. One thread per listener socket, each a plain blocking
//! receive/process/send loop. While online the receive times out quickly so
//! the thread keeps passing quiescent points; once idle it parks offline
//! with a long timeout so reloads never wait on it.

use std::io::{self, ErrorKind};
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Once};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use socket2::{SockAddr, Socket};
use zone::qsr::Reader;
use zone::registry::Registry;

use crate::config::{Config, DNS_RECV_SIZE};
use crate::packet::{Processor, ZoneAccess};
use crate::sock;
use crate::stats::Stats;

/// Longest receive wait while online; the upper bound on how long a reload
/// can stall behind this thread.
const SHORT_TIMEOUT: Duration = Duration::from_micros(109_367);
/// Offline receive wait; bounds shutdown latency for an idle worker.
const LONG_TIMEOUT: Duration = Duration::from_micros(3_109_367);

/// Room for a v4/v6 pktinfo plus its cmsg header.
const CMSG_BUFSIZE: usize = 256;

/// The signal reserved for stopping UDP workers. Distinct from anything
/// that terminates the process.
pub const STOP_SIGNAL: libc::c_int = libc::SIGUSR2;

thread_local! {
	static SHUTDOWN: AtomicBool = const { AtomicBool::new(false) };
}

extern "C" fn stop_handler(_: libc::c_int) {
	SHUTDOWN.with(|flag| flag.store(true, Relaxed));
}

/// Install the process-wide stop-signal handler. Idempotent.
pub fn init() {
	static ONCE: Once = Once::new();

	ONCE.call_once(|| unsafe {
		let mut sa: libc::sigaction = std::mem::zeroed();
		sa.sa_sigaction = stop_handler as extern "C" fn(libc::c_int) as usize;
		libc::sigfillset(&mut sa.sa_mask);
		sa.sa_flags = 0;
		libc::sigaction(STOP_SIGNAL, &sa, std::ptr::null_mut());
	});
}

/// Ask the worker on `thread` to exit, interrupting its in-flight receive.
pub fn request_stop(thread: &JoinHandle<()>) {
	use std::os::unix::thread::JoinHandleExt;

	unsafe { libc::pthread_kill(thread.as_pthread_t(), STOP_SIGNAL) };
}

pub struct Worker {
	pub sock: Socket,
	pub addr: SocketAddr,
	pub cfg: Arc<Config>,
	pub registry: Arc<Registry>,
	pub stats: Arc<Stats>,
	pub processor: Arc<dyn Processor>,
}

/// Thread entry.
pub fn run(w: Worker) {
	init();

	// Workers are spawned with every signal blocked; let the stop signal
	// through. The shutdown flag is touched here so the handler never
	// observes uninitialised thread-locals.
	unsafe {
		let mut mask: libc::sigset_t = std::mem::zeroed();
		libc::sigfillset(&mut mask);
		libc::sigdelset(&mut mask, STOP_SIGNAL);
		libc::pthread_sigmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
	}
	SHUTDOWN.with(|flag| flag.store(false, Relaxed));

	let mut reader = w.registry.reader();

	#[cfg(target_os = "linux")]
	if w.cfg.udp_recv_width > 1 {
		debug!("recvmmsg() with a width of {} enabled for UDP socket {}", w.cfg.udp_recv_width, w.addr);
		return mainloop_mmsg(&w, &mut reader);
	}

	mainloop(&w, &mut reader)
}

fn shutdown_requested() -> bool {
	SHUTDOWN.with(|flag| flag.load(Relaxed))
}

fn set_rcvtimeo(sock: &Socket, timeout: Duration) {
	let _ = sock.set_read_timeout(Some(timeout));
}

fn client_addr(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<SocketAddr> {
	unsafe { SockAddr::new(*storage, len) }.as_socket()
}

fn recv(fd: RawFd, hdr: &mut libc::msghdr) -> io::Result<usize> {
	let rv = unsafe { libc::recvmsg(fd, hdr, 0) };

	if rv < 0 {
		return Err(io::Error::last_os_error());
	}

	Ok(rv as usize)
}

fn mainloop(w: &Worker, reader: &mut Reader) {
	let use_cmsg = sock::needs_cmsg(&w.addr);
	let cmsg_size = if use_cmsg { CMSG_BUFSIZE } else { 0 };
	let fd = w.sock.as_raw_fd();

	let mut buf = vec![0u8; w.cfg.max_response.max(DNS_RECV_SIZE)];
	let mut name: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
	let mut cmsg = [0u8; CMSG_BUFSIZE];
	let mut iov = libc::iovec {
		iov_base: buf.as_mut_ptr().cast(),
		iov_len: 0,
	};

	w.sock.set_read_timeout(Some(SHORT_TIMEOUT)).expect("SO_RCVTIMEO is settable");
	let mut online = true;

	loop {
		if shutdown_requested() {
			break;
		}

		iov.iov_len = DNS_RECV_SIZE;

		let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
		hdr.msg_name = (&mut name as *mut libc::sockaddr_storage).cast();
		hdr.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
		hdr.msg_iov = &mut iov;
		hdr.msg_iovlen = 1;

		if use_cmsg {
			hdr.msg_control = cmsg.as_mut_ptr().cast();
			hdr.msg_controllen = cmsg_size;
		}

		let got = if online {
			reader.quiesce();

			match recv(fd, &mut hdr) {
				Err(e) if e.kind() == ErrorKind::Interrupted => continue,
				Err(e) if e.kind() == ErrorKind::WouldBlock => {
					// idle: park the reader before the long waits begin
					reader.offline();
					online = false;
					set_rcvtimeo(&w.sock, LONG_TIMEOUT);
					continue;
				}
				other => other,
			}
		} else {
			match recv(fd, &mut hdr) {
				Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => continue,
				other => {
					set_rcvtimeo(&w.sock, SHORT_TIMEOUT);
					online = true;
					reader.online();
					other
				}
			}
		};

		let len = match got {
			Ok(len) => len,
			Err(e) => {
				w.stats.udp.recvfail.inc();
				debug!("UDP recvmsg() error: {e}");
				continue;
			}
		};

		let client = client_addr(&name, hdr.msg_namelen);

		// no reply and no log for forged source ports
		let Some(client) = client.filter(|c| c.port() != 0) else {
			w.stats.dropped.inc();
			continue;
		};

		let zones = ZoneAccess::new(&w.registry, reader);
		let out = w.processor.process(&zones, &w.stats, &client, &mut buf, len);

		if out == 0 {
			continue;
		}

		// reply with the receive-time control data so the source address
		// matches the address the query was sent to
		iov.iov_len = out;

		loop {
			let rv = unsafe { libc::sendmsg(fd, &hdr, 0) };

			if rv < 0 {
				let e = io::Error::last_os_error();

				if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) {
					continue;
				}

				w.stats.udp.sendfail.inc();
				debug!("UDP sendmsg() of {out} bytes to client {client} failed: {e}");
			}

			break;
		}
	}
}

#[cfg(target_os = "linux")]
fn recv_batch(fd: RawFd, dgrams: &mut [libc::mmsghdr]) -> io::Result<usize> {
	let rv = unsafe {
		libc::recvmmsg(
			fd,
			dgrams.as_mut_ptr(),
			dgrams.len() as libc::c_uint,
			libc::MSG_WAITFORONE,
			std::ptr::null_mut(),
		)
	};

	if rv < 0 {
		return Err(io::Error::last_os_error());
	}

	Ok(rv as usize)
}

#[cfg(target_os = "linux")]
fn mainloop_mmsg(w: &Worker, reader: &mut Reader) {
	let width = w.cfg.udp_recv_width.min(64);
	let use_cmsg = sock::needs_cmsg(&w.addr);
	let cmsg_size = if use_cmsg { CMSG_BUFSIZE } else { 0 };
	let fd = w.sock.as_raw_fd();
	let bufsz = w.cfg.max_response.max(DNS_RECV_SIZE);

	let mut bufs = vec![0u8; width * bufsz];
	let mut names = vec![unsafe { std::mem::zeroed::<libc::sockaddr_storage>() }; width];
	let mut cmsgs = vec![[0u8; CMSG_BUFSIZE]; width];
	let mut iovs = vec![
		libc::iovec {
			iov_base: std::ptr::null_mut(),
			iov_len: 0,
		};
		width
	];
	let mut dgrams = vec![unsafe { std::mem::zeroed::<libc::mmsghdr>() }; width];

	w.sock.set_read_timeout(Some(SHORT_TIMEOUT)).expect("SO_RCVTIMEO is settable");
	let mut online = true;

	loop {
		if shutdown_requested() {
			break;
		}

		// Rebuilt every pass: the compaction below shuffles the headers.
		for i in 0..width {
			iovs[i] = libc::iovec {
				iov_base: bufs[i * bufsz..].as_mut_ptr().cast(),
				iov_len: DNS_RECV_SIZE,
			};

			let hdr = &mut dgrams[i].msg_hdr;
			hdr.msg_iov = &mut iovs[i];
			hdr.msg_iovlen = 1;
			hdr.msg_name = (&mut names[i] as *mut libc::sockaddr_storage).cast();
			hdr.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
			hdr.msg_control = if use_cmsg { cmsgs[i].as_mut_ptr().cast() } else { std::ptr::null_mut() };
			hdr.msg_controllen = cmsg_size;
			hdr.msg_flags = 0;
			dgrams[i].msg_len = 0;
		}

		let got = if online {
			reader.quiesce();

			match recv_batch(fd, &mut dgrams) {
				Err(e) if e.kind() == ErrorKind::Interrupted => continue,
				Err(e) if e.kind() == ErrorKind::WouldBlock => {
					reader.offline();
					online = false;
					set_rcvtimeo(&w.sock, LONG_TIMEOUT);
					continue;
				}
				other => other,
			}
		} else {
			match recv_batch(fd, &mut dgrams) {
				Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => continue,
				other => {
					set_rcvtimeo(&w.sock, SHORT_TIMEOUT);
					online = true;
					reader.online();
					other
				}
			}
		};

		let mut pkts = match got {
			Ok(pkts) => pkts,
			Err(e) => {
				w.stats.udp.recvfail.inc();
				debug!("UDP recvmmsg() error: {e}");
				continue;
			}
		};

		for i in 0..pkts {
			let client = client_addr(&names[i], dgrams[i].msg_hdr.msg_namelen);

			match client.filter(|c| c.port() != 0) {
				Some(client) => {
					let len = dgrams[i].msg_len as usize;
					let buf = &mut bufs[i * bufsz..(i + 1) * bufsz];

					let zones = ZoneAccess::new(&w.registry, reader);
					iovs[i].iov_len = w.processor.process(&zones, &w.stats, &client, buf, len);
				}
				None => {
					// forged source port: count, suppress the reply
					w.stats.dropped.inc();
					iovs[i].iov_len = 0;
				}
			}
		}

		// Compact suppressed entries out of the outgoing array; the moved
		// headers keep pointing at their original iov/name/cmsg slots.
		let mut i = 0;

		while i < pkts {
			if unsafe { (*dgrams[i].msg_hdr.msg_iov).iov_len } == 0 {
				dgrams.copy_within(i + 1..pkts, i);
				pkts -= 1;
			} else {
				i += 1;
			}
		}

		let mut off = 0;

		while off < pkts {
			let rv = unsafe { libc::sendmmsg(fd, dgrams[off..].as_mut_ptr(), (pkts - off) as libc::c_uint, 0) };

			if rv < 0 {
				let e = io::Error::last_os_error();

				if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) {
					continue;
				}

				w.stats.udp.sendfail.inc();
				debug!("UDP sendmmsg() failed: {e}");
				// skip the failing packet instead of resending it
				off += 1;
				continue;
			}

			// partial success: advance past what the kernel took
			off += rv as usize;
		}
	}
}
