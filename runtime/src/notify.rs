use std::io;
use std::os::fd::{AsRawFd, RawFd};

use log::error;
use utils::error::*;

/// Create a cross-thread wakeup channel for a poll-driven worker: a
/// nonblocking pipe whose read end sits in the worker's poll set and whose
/// write end may be posted from any thread.
pub fn pair() -> Result<(Notifier, Notified)> {
	let mut fds = [0; 2];

	if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
		error!("pipe2() failed: {}", io::Error::last_os_error());
		return Err(());
	}

	Ok((Notifier { fd: fds[1] }, Notified { fd: fds[0] }))
}

/// The posting end. Held by the control thread.
pub struct Notifier {
	fd: RawFd,
}

impl Notifier {
	/// Wake the owning worker. A full pipe means a wakeup is already
	/// pending, so the result is ignored.
	pub fn notify(&self) {
		let b: u8 = 1;
		unsafe { libc::write(self.fd, (&b as *const u8).cast(), 1) };
	}
}

impl Drop for Notifier {
	fn drop(&mut self) {
		unsafe { libc::close(self.fd) };
	}
}

/// The receiving end, registered in the worker's poll set through `Io`.
pub struct Notified {
	fd: RawFd,
}

impl Notified {
	/// Consume pending wakeups so the descriptor stops polling readable.
	pub fn drain(&self) {
		let mut buf = [0u8; 16];
		while unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
	}
}

impl AsRawFd for Notified {
	fn as_raw_fd(&self) -> RawFd {
		self.fd
	}
}

impl Drop for Notified {
	fn drop(&mut self) {
		unsafe { libc::close(self.fd) };
	}
}
