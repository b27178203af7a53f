use core::result;

/// The workspace-wide result type. An `Err(())` means the failure was already
/// logged at the site that observed it; callers only decide whether to
/// recover or propagate.
pub type Result<T = (), E = ()> = result::Result<T, E>;

pub trait OrLog<T, E> {
	/// Log the error through `f` and erase it.
	fn or_log(self, f: impl FnOnce(E)) -> Result<T>;
}

impl<T, E> OrLog<T, E> for result::Result<T, E> {
	fn or_log(self, f: impl FnOnce(E)) -> Result<T> {
		self.map_err(f)
	}
}

pub trait OkOrLog<T> {
	/// Log through `f` when the value is absent and turn it into an `Err(())`.
	fn ok_or_log(self, f: impl FnOnce()) -> Result<T>;
}

impl<T> OkOrLog<T> for Option<T> {
	fn ok_or_log(self, f: impl FnOnce()) -> Result<T> {
		match self {
			Some(v) => Ok(v),
			None => {
				f();
				Err(())
			}
		}
	}
}
