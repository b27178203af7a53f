use core::cell::RefCell;
use core::time::Duration;
use std::io::{self, ErrorKind};

use bitflags::bitflags;
use log::error;
use stakker::Fwd;
use utils::error::*;

pub mod logger;
mod notify;
mod rt;

pub use notify::{pair, Notified, Notifier};
pub use rt::*;

mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

pub use sys::AsRawFd;
use sys::*;

bitflags! {
	/// Poll interest for one registered descriptor.
	#[derive(Clone, Copy, PartialEq, Eq)]
	pub struct Interest: i16 {
		const READ = POLLIN;
		const WRITE = POLLOUT;
	}
}

/// Readiness delivered to a watcher. Errors and hangups are folded into both
/// directions so whichever handler is armed observes the failing syscall.
#[derive(Clone, Copy, Debug)]
pub struct Ready {
	pub readable: bool,
	pub writable: bool,
}

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

pub(crate) struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of<T: AsRawFd>(&mut self, socket: &T) -> usize {
		let raw = as_raw(socket);
		self.fds.iter().position(|f| f.fd == raw).expect("Socket is present")
	}

	/// Returns whether any descriptors remain registered.
	pub(crate) fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the registered descriptors and forward readiness to their
	/// watchers. Returns whether anything was ready.
	pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		if ret < 0 {
			let err = io::Error::last_os_error();

			if err.kind() == ErrorKind::Interrupted {
				return Ok(false);
			}

			error!("poll() failed: {err}");
			return Err(());
		}

		let mut pending = ret as usize;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0..self.fds.len() {
			let Poll { revents, .. } = &mut self.fds[idx];

			if *revents == 0 {
				continue;
			}

			if *revents & POLLNVAL != 0 {
				panic!("Polled a closed descriptor");
			}

			let ready = Ready {
				readable: *revents & (POLLIN | POLLHUP | POLLERR) != 0,
				writable: *revents & (POLLOUT | POLLHUP | POLLERR) != 0,
			};

			*revents = 0;

			// Forwarding only queues; the watcher runs after the poll pass.
			self.entries[idx].fwd.fwd(ready);

			pending -= 1;

			if pending == 0 {
				break;
			}
		}

		Ok(true)
	}
}

struct Entry {
	fwd: Fwd<Ready>,
}

/// A descriptor registered with this thread's poll set. Dropping the handle
/// removes the registration and drops the wrapped value with it.
pub struct Io<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Io<T> {
	pub fn new(inner: T, interest: Interest, fwd: Fwd<Ready>) -> Self {
		State::with(|i| {
			i.fds.push(Poll {
				fd: as_raw(&inner),
				events: interest.bits(),
				revents: 0,
			});

			i.entries.push(Entry { fwd });

			Self { inner }
		})
	}

	pub fn get(&self) -> &T {
		&self.inner
	}

	/// Replace the interest set. An empty set keeps the descriptor
	/// registered but silent (a stopped watcher).
	pub fn interest(&self, interest: Interest) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.fds[idx].events = interest.bits();
		})
	}
}

impl<T: AsRawFd> Drop for Io<T> {
	fn drop(&mut self) {
		State::with(|i| {
			let idx = i.idx_of(&self.inner);
			i.entries.swap_remove(idx);
			i.fds.swap_remove(idx);
		})
	}
}
