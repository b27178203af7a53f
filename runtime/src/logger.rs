use std::time::SystemTime;

use log::{Level, LevelFilter};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

static LOGGER: Logger = Logger;

/// Install the logger. `debug` raises the maximum level from Info to Debug.
pub fn init(debug: bool) {
	log::set_logger(&LOGGER).expect("Logger is installed once");
	log::set_max_level(if debug { LevelFilter::Debug } else { LevelFilter::Info });
}

pub struct Logger;

impl log::Log for Logger {
	fn enabled(&self, _: &log::Metadata) -> bool {
		true
	}

	fn log(&self, record: &log::Record) {
		let time = humantime::format_rfc3339_millis(SystemTime::now());

		// Workers are the unit of diagnosis here, so include the thread name.
		let thread = std::thread::current();
		let name = thread.name().unwrap_or("main");

		let dim = Style::new().dimmed().prefix();

		eprintln!(
			"{dim}{time}{RESET} {}{:5}{RESET} {}{}{RESET} {}{}{RESET}{dim}:{RESET} {}",
			match record.level() {
				Level::Trace => Color::Purple,
				Level::Debug => Color::Blue,
				Level::Info => Color::Green,
				Level::Warn => Color::Yellow,
				Level::Error => Color::Red,
			}
			.bold()
			.prefix(),
			record.level(),
			dim,
			name,
			Style::new().bold().prefix(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}
