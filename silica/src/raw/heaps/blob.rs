use std::fmt::{Debug, Formatter};
use std::io::Cursor;

use crate::raw::heaps::{BlobIndex, SizeDebugWrapper};
use crate::utilities::read_compressed_u32;

#[derive(Copy, Clone)]
pub struct BlobHeap<'l> {
	data: &'l [u8],
}

impl<'l> From<&'l [u8]> for BlobHeap<'l> {
	fn from(data: &'l [u8]) -> Self {
		Self { data }
	}
}

impl<'l> BlobHeap<'l> {
	/// Blobs are stored as a compressed byte length followed by the bytes.
	pub fn get(&self, idx: BlobIndex) -> Option<&'l [u8]> {
		let slice = self.data.get(idx.0..)?;
		let mut stream = Cursor::new(slice);
		let len = read_compressed_u32(&mut stream).ok()? as usize;
		let start = stream.position() as usize;
		slice.get(start..start + len)
	}
}

impl Debug for BlobHeap<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("BlobHeap");
		dbg.field("data", &SizeDebugWrapper::new(self.data.len()));
		dbg.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn blob_heap_reads_length_prefixed() {
		let data = [0x00, 0x03, 0xAA, 0xBB, 0xCC, 0x01, 0xDD];
		let heap = BlobHeap::from(data.as_slice());
		assert_eq!(heap.get(BlobIndex(1)), Some([0xAA, 0xBB, 0xCC].as_slice()));
		assert_eq!(heap.get(BlobIndex(5)), Some([0xDD].as_slice()));
		assert_eq!(heap.get(BlobIndex(64)), None);
	}
}
