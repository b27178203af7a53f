//! Wire-form DNS names: sequences of length-prefixed labels ending in the
//! zero-length root label. Matching is case-insensitive on ASCII label
//! bytes and exact on everything else.

use core::fmt;
use core::hash::{BuildHasher, Hasher};

use ahash::RandomState;

/// Longest legal wire name, including the root label.
pub const MAX_NAME: usize = 255;
/// Longest single label.
pub const MAX_LABEL: usize = 63;

/// 32-bit fingerprint of a wire name. Case-folded so that fingerprints of
/// names differing only in ASCII case collide intentionally. The seeds are
/// fixed: fingerprints computed at zone-finalize time must agree with the
/// ones computed while probing.
pub fn hash(name: &[u8]) -> u32 {
	let state = RandomState::with_seeds(0x243f_6a88_85a3_08d3, 0x1319_8a2e_0370_7344, 0xa409_3822_299f_31d0, 0x082e_fa98_ec4e_6c89);
	let mut h = state.build_hasher();

	for &b in name {
		h.write_u8(b.to_ascii_lowercase());
	}

	let h = h.finish();
	(h as u32) ^ ((h >> 32) as u32)
}

/// Equality under the matching rules above.
pub fn eq(a: &[u8], b: &[u8]) -> bool {
	a.eq_ignore_ascii_case(b)
}

/// Whether `name` is a well-formed wire name ending in the root label.
pub fn is_valid(name: &[u8]) -> bool {
	if name.len() > MAX_NAME {
		return false;
	}

	let mut off = 0;

	loop {
		let Some(&len) = name.get(off) else { return false };

		if len == 0 {
			return off + 1 == name.len();
		}

		if len as usize > MAX_LABEL {
			return false;
		}

		off += len as usize + 1;
	}
}

/// Parse a dotted text name into wire form. A trailing dot is accepted;
/// `.` alone is the root.
pub fn from_text(text: &str) -> Result<Box<[u8]>, ()> {
	let trimmed = text.strip_suffix('.').unwrap_or(text);
	let mut out = Vec::with_capacity(trimmed.len() + 2);

	if !trimmed.is_empty() {
		for label in trimmed.split('.') {
			let bytes = label.as_bytes();

			if bytes.is_empty() || bytes.len() > MAX_LABEL {
				return Err(());
			}

			out.push(bytes.len() as u8);
			out.extend_from_slice(bytes);
		}
	}

	out.push(0);

	if out.len() > MAX_NAME {
		return Err(());
	}

	Ok(out.into_boxed_slice())
}

/// Split a bare run of length-prefixed labels (no terminating root label)
/// into its label byte slices. `None` if the run is malformed.
pub fn raw_labels(run: &[u8]) -> Option<Vec<&[u8]>> {
	let mut labels = Vec::new();
	let mut off = 0;

	while off < run.len() {
		let len = run[off] as usize;

		if len == 0 || len > MAX_LABEL {
			return None;
		}

		labels.push(run.get(off + 1..off + 1 + len)?);
		off += len + 1;
	}

	Some(labels)
}

/// Iterate the labels of a wire name, root label excluded.
pub fn labels(name: &[u8]) -> Labels<'_> {
	Labels { name, off: 0 }
}

pub struct Labels<'a> {
	name: &'a [u8],
	off: usize,
}

impl<'a> Iterator for Labels<'a> {
	type Item = &'a [u8];

	fn next(&mut self) -> Option<&'a [u8]> {
		let len = *self.name.get(self.off)? as usize;

		if len == 0 {
			return None;
		}

		let start = self.off + 1;
		let label = self.name.get(start..start + len)?;
		self.off = start + len;

		Some(label)
	}
}

/// Adapter rendering a wire name in dotted text form.
pub fn display(name: &[u8]) -> Display<'_> {
	Display(name)
}

pub struct Display<'a>(&'a [u8]);

impl fmt::Display for Display<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut any = false;

		for label in labels(self.0) {
			any = true;

			for &b in label {
				match b {
					b'.' | b'\\' => write!(f, "\\{}", b as char)?,
					0x21..=0x7e => write!(f, "{}", b as char)?,
					_ => write!(f, "\\{:03}", b)?,
				}
			}

			f.write_str(".")?;
		}

		if !any {
			f.write_str(".")?;
		}

		Ok(())
	}
}
