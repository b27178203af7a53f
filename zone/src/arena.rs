//! Bump storage for the label bytes of one zone. Allocation hands out
//! `Span` indices instead of references, so the node graph stays plain data
//! and the arena can keep growing while the tree is built.

/// Index of a byte run inside an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
	off: u32,
	len: u16,
}

#[derive(Default)]
pub struct Arena {
	bytes: Vec<u8>,
}

impl Arena {
	/// Copy `bytes` into the arena. Spans stay valid for the arena's
	/// lifetime; nothing is freed individually.
	pub fn alloc(&mut self, bytes: &[u8]) -> Span {
		let off = self.bytes.len().try_into().expect("Arena under 4 GiB");
		let len = bytes.len().try_into().expect("Allocation under 64 KiB");

		self.bytes.extend_from_slice(bytes);

		Span { off, len }
	}

	pub fn get(&self, span: Span) -> &[u8] {
		&self.bytes[span.off as usize..span.off as usize + span.len as usize]
	}

	pub fn len(&self) -> usize {
		self.bytes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.bytes.is_empty()
	}
}
