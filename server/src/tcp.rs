//! TCP I/O workers. One thread per listener socket, each driving its own
//! actor runtime over the thread's poll registry: a `Listener` actor owning
//! the accept watcher, the stop notifier and the connection slab, plus one
//! `Conn` actor per live connection. Before every blocking wait the worker
//! parks its reclamation reader; connections come back online lazily, right
//! before they touch zone data.

use std::cell::{Cell, RefCell};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, error};
use runtime::{Interest, Io, Notified, Ready};
use slab::Slab;
use socket2::Socket;
use stakker::{actor, fwd_to, ret_nop, FixedTimerKey, Fwd, CX};
use utils::error::*;
use zone::qsr::Reader;
use zone::registry::Registry;

use crate::config::Config;
use crate::packet::{Processor, ZoneAccess};
use crate::stats::Stats;

/// Worker-wide state shared by the listener and its connections.
struct Ctx {
	cfg: Arc<Config>,
	registry: Arc<Registry>,
	stats: Arc<Stats>,
	processor: Arc<dyn Processor>,
	reader: RefCell<Reader>,
	shutting_down: Cell<bool>,
}

impl Ctx {
	/// Re-enter the read-side critical section. Cheap when already online.
	fn online(&self) {
		self.reader.borrow_mut().online();
	}

	fn offline(&self) {
		self.reader.borrow_mut().offline();
	}
}

pub struct Worker {
	/// Bound, nonblocking, not yet listening.
	pub sock: Socket,
	pub addr: SocketAddr,
	/// Posted by the control thread to request a graceful stop.
	pub stop: Notified,
	pub cfg: Arc<Config>,
	pub registry: Arc<Registry>,
	pub stats: Arc<Stats>,
	pub processor: Arc<dyn Processor>,
}

/// Thread entry. Returns once the worker has fully drained.
pub fn run(w: Worker) -> Result {
	w.sock
		.listen(w.cfg.tcp_clients_per_thread as i32)
		.or_log(|e| error!("Failed to listen on TCP socket {}: {e}", w.addr))?;

	let mut stakker = runtime::init();

	let ctx = Rc::new(Ctx {
		cfg: w.cfg,
		registry: w.registry.clone(),
		stats: w.stats,
		processor: w.processor,
		reader: RefCell::new(w.registry.reader()),
		shutting_down: Cell::new(false),
	});

	let listener: TcpListener = w.sock.into();
	let _lst = actor!(stakker, Listener::init(listener, w.stop, ctx.clone()), ret_nop!());

	// The loop ends once the stop notifier has fired and the last
	// connection (and its timer) is gone.
	runtime::exec(&mut stakker, || ctx.offline())
}

struct Listener {
	ctx: Rc<Ctx>,
	sock: Option<Io<TcpListener>>,
	notify: Option<Io<Notified>>,
	conns: Slab<stakker::ActorOwn<Conn>>,
}

impl Listener {
	fn init(cx: CX![], sock: TcpListener, stop: Notified, ctx: Rc<Ctx>) -> Option<Self> {
		let sock = Io::new(sock, Interest::READ, fwd_to!([cx], accept() as (Ready)));
		let notify = Io::new(stop, Interest::READ, fwd_to!([cx], stop() as (Ready)));

		Some(Self {
			ctx,
			sock: Some(sock),
			notify: Some(notify),
			conns: Slab::new(),
		})
	}

	fn accept(&mut self, cx: CX![], _: Ready) {
		let Some(io) = &self.sock else { return };

		while self.conns.len() < self.ctx.cfg.tcp_clients_per_thread {
			let (stream, peer) = match io.get().accept() {
				Ok(v) => v,
				Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => return,
				Err(e) => {
					// mostly early deaths of queued connections
					debug!("TCP DNS: accept() failed: {e}");
					return;
				}
			};

			if stream.set_nonblocking(true).is_err() {
				continue;
			}

			debug!("Received TCP DNS connection from {peer}");

			let entry = self.conns.vacant_entry();
			let key = entry.key();
			let closed = fwd_to!([cx], closed() as (usize));
			let conn = actor!(cx, Conn::init(stream, peer, key, self.ctx.clone(), closed), ret_nop!());
			entry.insert(conn);
		}

		// at the cap: stop accepting until a slot frees up
		io.interest(Interest::empty());
	}

	fn closed(&mut self, _cx: CX![], key: usize) {
		self.conns.remove(key);

		if self.ctx.shutting_down.get() {
			return;
		}

		if self.conns.len() + 1 == self.ctx.cfg.tcp_clients_per_thread {
			if let Some(io) = &self.sock {
				io.interest(Interest::READ);
			}
		}
	}

	fn stop(&mut self, _cx: CX![], _: Ready) {
		debug!("TCP DNS worker on {:?} stopping", self.sock.as_ref().and_then(|io| io.get().local_addr().ok()));

		if let Some(io) = &self.notify {
			io.get().drain();
		}

		// Drop the accept and stop watchers; live connections complete
		// their current exchange and then close instead of being reused.
		self.sock = None;
		self.notify = None;
		self.ctx.shutting_down.set(true);
	}
}

enum State {
	ReadingInitial,
	ReadingMore,
	Writing,
}

struct Conn {
	ctx: Rc<Ctx>,
	key: usize,
	peer: SocketAddr,
	closed: Fwd<usize>,
	io: Io<TcpStream>,
	timer: FixedTimerKey,
	/// One allocation for the whole exchange: 2-byte frame + payload.
	buf: Box<[u8]>,
	state: State,
	/// Total bytes of the current inbound or outbound message, frame
	/// included. Zero while the length prefix is still incomplete.
	size: usize,
	done: usize,
	dead: bool,
}

impl Conn {
	fn init(cx: CX![], stream: TcpStream, peer: SocketAddr, key: usize, ctx: Rc<Ctx>, closed: Fwd<usize>) -> Option<Self> {
		let io = Io::new(stream, Interest::READ, fwd_to!([cx], ready() as (Ready)));

		let actor = cx.access_actor().clone();
		let timer = cx.after(ctx.cfg.tcp_timeout, move |s| actor.apply(s, |this, cx| this.timeout(cx)));

		let buf = vec![0u8; ctx.cfg.max_response + 2].into_boxed_slice();

		Some(Self {
			ctx,
			key,
			peer,
			closed,
			io,
			timer,
			buf,
			state: State::ReadingInitial,
			size: 0,
			done: 0,
			dead: false,
		})
	}

	/// Restart the idle timer; called whenever a direction makes progress.
	fn rearm(&mut self, cx: CX![]) {
		cx.timer_del(self.timer);

		let actor = cx.access_actor().clone();
		self.timer = cx.after(self.ctx.cfg.tcp_timeout, move |s| actor.apply(s, |this, cx| this.timeout(cx)));
	}

	fn timeout(&mut self, cx: CX![]) {
		if self.dead {
			return;
		}

		debug!(
			"TCP DNS connection from {} timed out while {}",
			self.peer,
			match self.state {
				State::Writing => "writing",
				_ => "reading",
			}
		);

		match self.state {
			State::Writing => self.ctx.stats.tcp.sendfail.inc(),
			_ => self.ctx.stats.tcp.recvfail.inc(),
		}

		self.close(cx);
	}

	fn close(&mut self, cx: CX![]) {
		if self.dead {
			return;
		}

		self.dead = true;
		cx.timer_del(self.timer);
		self.io.interest(Interest::empty());
		let _ = self.io.get().shutdown(Shutdown::Both);

		// The listener drops this actor, which closes the socket and
		// removes it from the poll set.
		self.closed.fwd(self.key);
	}

	fn ready(&mut self, cx: CX![], r: Ready) {
		if self.dead {
			return;
		}

		match self.state {
			State::Writing => {
				if r.writable {
					self.write(cx)
				}
			}
			_ => {
				if r.readable {
					self.read(cx)
				}
			}
		}
	}

	fn read(&mut self, cx: CX![]) {
		loop {
			let want = match self.state {
				State::ReadingInitial => self.buf.len(),
				_ => self.size,
			};

			let got = {
				let mut sock = self.io.get();
				sock.read(&mut self.buf[self.done..want])
			};

			match got {
				Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => return,
				Err(e) => {
					debug!("TCP DNS recv() from {}: {e}", self.peer);
					self.ctx.stats.tcp.recvfail.inc();
					return self.close(cx);
				}
				Ok(0) => {
					// EOF mid-message is a failure; between messages it is
					// just the client going away.
					if self.done > 0 {
						debug!("TCP DNS recv() from {}: unexpected EOF", self.peer);
						self.ctx.stats.tcp.recvfail.inc();
					}

					return self.close(cx);
				}
				Ok(n) => {
					self.done += n;
					self.rearm(cx);
				}
			}

			if matches!(self.state, State::ReadingInitial) && self.done >= 2 {
				let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;

				if len > self.ctx.cfg.max_response {
					debug!("Oversized TCP DNS query of length {len} from {}", self.peer);
					self.ctx.stats.tcp.recvfail.inc();
					return self.close(cx);
				}

				self.size = len + 2;
				self.state = State::ReadingMore;
			}

			if matches!(self.state, State::ReadingMore) && self.done >= self.size {
				return self.respond(cx);
			}
		}
	}

	fn respond(&mut self, cx: CX![]) {
		// back online before touching zone data
		self.ctx.online();

		let out = {
			let reader = self.ctx.reader.borrow();
			let zones = ZoneAccess::new(&self.ctx.registry, &reader);
			self.ctx.processor.process(&zones, &self.ctx.stats, &self.peer, &mut self.buf[2..], self.size - 2)
		};

		if out == 0 {
			return self.close(cx);
		}

		self.buf[..2].copy_from_slice(&(out as u16).to_be_bytes());
		self.size = out + 2;
		self.done = 0;
		self.state = State::Writing;

		// The response usually fits the socket buffer, so try it without a
		// round trip through the poll loop; a partial send arms the writer.
		self.write(cx);
	}

	fn write(&mut self, cx: CX![]) {
		loop {
			let got = {
				let mut sock = self.io.get();
				sock.write(&self.buf[self.done..self.size])
			};

			match got {
				Err(e) if e.kind() == ErrorKind::Interrupted => continue,
				Err(e) if e.kind() == ErrorKind::WouldBlock => {
					self.io.interest(Interest::WRITE);
					return;
				}
				Err(e) => {
					debug!("TCP DNS send() failed, dropping response to {}: {e}", self.peer);
					self.ctx.stats.tcp.sendfail.inc();
					return self.close(cx);
				}
				Ok(n) => {
					self.done += n;
					self.rearm(cx);

					if self.done < self.size {
						continue;
					}

					if self.ctx.shutting_down.get() {
						// close cleanly after the final response instead
						// of waiting for another request
						return self.close(cx);
					}

					self.state = State::ReadingInitial;
					self.size = 0;
					self.done = 0;
					self.io.interest(Interest::READ);
					return;
				}
			}
		}
	}
}
