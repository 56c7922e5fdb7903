use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Error, ErrorKind};

use crate::raw::heaps::{SizeDebugWrapper, StringIndex};
use crate::utilities::read_compressed_u32;

#[derive(Copy, Clone)]
pub struct StringHeap<'l> {
	data: &'l [u8],
}

impl<'l> TryFrom<&'l [u8]> for StringHeap<'l> {
	type Error = Error;
	fn try_from(data: &'l [u8]) -> Result<Self, Self::Error> {
		match data {
			[0, ..] => Ok(Self { data }),
			_ => Err(ErrorKind::InvalidData.into()),
		}
	}
}

impl<'l> StringHeap<'l> {
	pub fn get(&self, idx: StringIndex) -> Option<&'l str> {
		let slice = self.data.get(idx.0..)?;
		let end = slice.iter().position(|c| *c == 0)?;
		std::str::from_utf8(&slice[..end]).ok()
	}
}

impl Debug for StringHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("StringHeap");
		dbg.field("data", &SizeDebugWrapper::new(self.data.len()));
		dbg.finish()
	}
}

pub struct UserStringHeap<'l> {
	data: &'l [u8],
}

impl<'l> From<&'l [u8]> for UserStringHeap<'l> {
	fn from(data: &'l [u8]) -> Self {
		Self { data }
	}
}

impl<'l> UserStringHeap<'l> {
	/// Returns the UTF-16 code units of the user string at `offset`.
	/// The blob length counts bytes and includes a terminal flag byte.
	pub fn get_utf16(&self, offset: usize) -> Option<Vec<u16>> {
		let slice = self.data.get(offset..)?;
		let mut stream = Cursor::new(slice);
		let byte_len = read_compressed_u32(&mut stream).ok()? as usize;
		let start = stream.position() as usize;
		let bytes = slice.get(start..start + byte_len)?;
		let char_bytes = &bytes[..byte_len & !1];
		Some(
			char_bytes
				.chunks_exact(2)
				.map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
				.collect(),
		)
	}
}

impl Debug for UserStringHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("UserStringHeap");
		dbg.field("data", &SizeDebugWrapper::new(self.data.len()));
		dbg.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_heap_reads_null_terminated() {
		let data = b"\0Name\0Namespace\0";
		let heap = StringHeap::try_from(data.as_slice()).unwrap();
		assert_eq!(heap.get(StringIndex(1)), Some("Name"));
		assert_eq!(heap.get(StringIndex(6)), Some("Namespace"));
		assert_eq!(heap.get(StringIndex(0)), Some(""));
	}

	#[test]
	fn user_string_heap_decodes_utf16() {
		// "Hi" = 2 chars, blob length 5 = 4 UTF-16 bytes + flag byte.
		let data = [0x00, 0x05, b'H', 0x00, b'i', 0x00, 0x00];
		let heap = UserStringHeap::from(data.as_slice());
		assert_eq!(heap.get_utf16(1).unwrap(), ['H' as u16, 'i' as u16]);
	}
}
