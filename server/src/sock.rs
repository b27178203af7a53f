//! Listener socket creation. Everything here is fatal at startup: a
//! listener that cannot get its required options must not serve.

use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use log::{error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use utils::error::*;

use crate::config::{Config, DNS_RECV_SIZE};

fn set_opt(sock: &Socket, level: i32, opt: i32, val: i32) -> io::Result<()> {
	let rv = unsafe {
		libc::setsockopt(
			sock.as_raw_fd(),
			level,
			opt,
			(&val as *const i32).cast(),
			size_of::<i32>() as libc::socklen_t,
		)
	};

	if rv == -1 {
		return Err(io::Error::last_os_error());
	}

	Ok(())
}

/// Whether replies must carry explicit source-address control data: any
/// IPv6 listener, or an IPv4 listener bound to the wildcard.
pub fn needs_cmsg(addr: &SocketAddr) -> bool {
	addr.is_ipv6() || addr.ip().is_unspecified()
}

/// Ask the kernel for `pktsize * 8 * max(width, 4)` bytes of buffer,
/// halving on refusal down to `max(16 KiB, pktsize)`. Below that the
/// listener is not viable.
fn negotiate_buffer(sock: &Socket, send: bool, pktsize: usize, width: usize, addr: &SocketAddr) -> Result {
	let desired = pktsize * 8 * width.clamp(4, 64);
	let min = pktsize.max(16 * 1024);
	let which = if send { "SO_SNDBUF" } else { "SO_RCVBUF" };

	let current = if send { sock.send_buffer_size() } else { sock.recv_buffer_size() };
	let current = current.or_log(|e| error!("Failed to get {which} on UDP socket: {e}"))?;

	if current >= desired {
		return Ok(());
	}

	let mut size = desired;

	loop {
		let rv = if send {
			sock.set_send_buffer_size(size)
		} else {
			sock.set_recv_buffer_size(size)
		};

		match rv {
			Ok(()) => break,
			Err(_) if size > (min << 1) => size >>= 1,
			Err(_) if size > min => size = min,
			Err(e) => {
				error!("Failed to set {which} to {size} for UDP socket {addr}: {e}");
				return Err(());
			}
		}
	}

	if size < desired {
		info!("UDP socket {addr}: {which}: wanted {desired}, got {size}");
	}

	Ok(())
}

fn udp_opts_v4(sock: &Socket, any_addr: bool) -> Result {
	// Never set the DF bit on replies; let the stack fragment.
	set_opt(sock, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DONT)
		.or_log(|e| error!("Failed to disable Path MTU Discovery for UDP socket: {e}"))?;

	if any_addr {
		set_opt(sock, libc::IPPROTO_IP, libc::IP_PKTINFO, 1).or_log(|e| error!("Failed to set IP_PKTINFO on UDP socket: {e}"))?;
	}

	// Latency hack, not needed for correct operation.
	if let Err(e) = set_opt(sock, libc::IPPROTO_IP, libc::IP_TOS, libc::IPTOS_LOWDELAY as i32) {
		warn!("Failed to set IPTOS_LOWDELAY on UDP socket: {e}");
	}

	Ok(())
}

fn udp_opts_v6(sock: &Socket) -> Result {
	// Fragment at the v6 minimum MTU instead of discovering the path MTU.
	set_opt(sock, libc::IPPROTO_IPV6, libc::IPV6_MTU, 1280).or_log(|e| error!("Failed to set IPV6_MTU on UDP socket: {e}"))?;

	set_opt(sock, libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER, libc::IPV6_PMTUDISC_DONT)
		.or_log(|e| error!("Failed to disable Path MTU Discovery for UDP socket: {e}"))?;

	sock.set_only_v6(true).or_log(|e| error!("Failed to set IPV6_V6ONLY on UDP socket: {e}"))?;

	set_opt(sock, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1).or_log(|e| error!("Failed to set IPV6_RECVPKTINFO on UDP socket: {e}"))?;

	if let Err(e) = set_opt(sock, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, libc::IPTOS_LOWDELAY as i32) {
		warn!("Failed to set IPTOS_LOWDELAY on UDP socket: {e}");
	}

	Ok(())
}

/// Create and bind one UDP listener.
pub fn udp(cfg: &Config, addr: SocketAddr) -> Result<Socket> {
	let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
		.or_log(|e| error!("Failed to create UDP socket: {e}"))?;

	sock.set_reuse_address(true).or_log(|e| error!("Failed to set SO_REUSEADDR on UDP socket: {e}"))?;
	// many workers bind the same address; the kernel balances between them
	sock.set_reuse_port(true).or_log(|e| error!("Failed to set SO_REUSEPORT on UDP socket: {e}"))?;

	match cfg.udp_rcvbuf {
		Some(n) => sock
			.set_recv_buffer_size(n)
			.or_log(|e| error!("Failed to set SO_RCVBUF to {n} for UDP socket {addr}: {e}"))?,
		None => negotiate_buffer(&sock, false, DNS_RECV_SIZE, cfg.udp_recv_width, &addr)?,
	}

	match cfg.udp_sndbuf {
		Some(n) => sock
			.set_send_buffer_size(n)
			.or_log(|e| error!("Failed to set SO_SNDBUF to {n} for UDP socket {addr}: {e}"))?,
		None => negotiate_buffer(&sock, true, cfg.max_response, cfg.udp_recv_width, &addr)?,
	}

	if addr.is_ipv6() {
		udp_opts_v6(&sock)?;
	} else {
		udp_opts_v4(&sock, addr.ip().is_unspecified())?;
	}

	sock.bind(&addr.into()).or_log(|e| error!("Failed to bind UDP socket {addr}: {e}"))?;

	Ok(sock)
}

/// Create and bind one TCP listener; the worker calls listen() itself.
pub fn tcp(cfg: &Config, addr: SocketAddr) -> Result<Socket> {
	let sock = Socket::new(Domain::for_address(addr), Type::STREAM.nonblocking(), Some(Protocol::TCP))
		.or_log(|e| error!("Failed to create TCP socket: {e}"))?;

	sock.set_reuse_address(true).or_log(|e| error!("Failed to set SO_REUSEADDR on TCP socket: {e}"))?;
	sock.set_reuse_port(true).or_log(|e| error!("Failed to set SO_REUSEPORT on TCP socket: {e}"))?;

	// hold back empty connections until their first query arrives
	set_opt(&sock, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, cfg.tcp_timeout.as_secs() as i32)
		.or_log(|e| error!("Failed to set TCP_DEFER_ACCEPT on TCP socket: {e}"))?;

	if addr.is_ipv6() {
		sock.set_only_v6(true).or_log(|e| error!("Failed to set IPV6_V6ONLY on TCP socket: {e}"))?;
	}

	sock.bind(&addr.into()).or_log(|e| error!("Failed to bind TCP socket {addr}: {e}"))?;

	Ok(sock)
}
