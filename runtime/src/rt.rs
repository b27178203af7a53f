use std::time::{Duration, Instant, SystemTime};

use stakker::Stakker;
use utils::error::Result;

use crate::GLOBAL;

/// Initialise the actor runtime for this worker thread. Timers run off the
/// monotonic clock; the system clock is anchored for anything that needs
/// wall time.
pub fn init() -> Stakker {
	let mut s = Stakker::new(Instant::now());
	s.set_systime(Some(SystemTime::now()));
	s
}

/// Drive this thread's actors and poll registry until no timers and no
/// descriptors remain. `pre_poll` runs immediately before each wait; I/O
/// workers use it to park their reclamation reader while the thread may
/// block.
pub fn exec(stakker: &mut Stakker, mut pre_poll: impl FnMut()) -> Result {
	GLOBAL.with(|this| {
		let mut t = Instant::now();
		let mut idle_pending = stakker.run(t, false);

		while stakker.not_shutdown() {
			let timeout = if idle_pending {
				// Poll the file descriptors without a timeout if there are items in the idle queue.
				Some(Duration::from_secs(0))
			} else {
				// Otherwise, get the timeout for the next timer.
				stakker.next_wait(t)
			};

			// With no timer pending and nothing registered for I/O the
			// worker has fully drained. Exit.
			if timeout.is_none() && !this.borrow().is_io() {
				break;
			}

			pre_poll();

			// Poll the file descriptors.
			let Ok(is_io) = this.borrow_mut().poll(timeout) else {
				return Err(());
			};

			t = Instant::now();
			// If there is still no I/O ready after a non-blocking poll, run the idle queue.
			idle_pending = stakker.run(t, idle_pending && !is_io);
		}

		Ok(())
	})
}
