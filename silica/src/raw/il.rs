use std::fmt::{Debug, Formatter};
use std::io::{Cursor, Error, ErrorKind};

use bitflags::bitflags;

use crate::utilities::{impl_from_byte_stream, read_bytes_slice_from_stream, FromByteStream};

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct CallingConvention: u8 {
		const DEFAULT = 0x0;
		const C = 0x1;
		const STD_CALL = 0x2;
		const THIS_CALL = 0x3;
		const FAST_CALL = 0x4;
		const VAR_ARG = 0x5;
		const FIELD = 0x6;
		const LOCAL_SIG = 0x7;
		const PROPERTY = 0x8;
		const UNMANAGED = 0x9;
		const GENERIC_INST = 0xA;
		const GENERIC = 0x10;
		const HAS_THIS = 0x20;
		const EXPLICIT_THIS = 0x40;
	}
}

impl_from_byte_stream!(CallingConvention);

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ExceptionClauseFlags: u32 {
		/// Typed exception handler.
		const EXCEPTION = 0x0000;
		/// Filter-based handler.
		const FILTER = 0x0001;
		/// Finally handler.
		const FINALLY = 0x0002;
		/// Fault handler (finally that runs on exception only).
		const FAULT = 0x0004;
	}
}

/// One row of a method's exception-handling section, widened to the fat form.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ExceptionClause {
	pub flags: ExceptionClauseFlags,
	pub try_offset: u32,
	pub try_length: u32,
	pub handler_offset: u32,
	pub handler_length: u32,
	/// A TypeDef/TypeRef/TypeSpec token for typed clauses, a filter IL
	/// offset for filter clauses, unused otherwise.
	pub class_token_or_filter_offset: u32,
}

/// The raw method body: header fields, the IL byte window, and the
/// widened exception clauses. Local variable types stay a token here;
/// the typed layer resolves them under the method's generic context.
pub struct MethodBody<'l> {
	pub max_stack: u16,
	pub init_locals: bool,
	pub local_var_sig_token: u32,
	pub code: &'l [u8],
	pub clauses: Vec<ExceptionClause>,
}

const FAT_FORMAT: u8 = 0x3;
const TINY_FORMAT: u8 = 0x2;
const FAT_FLAG_MORE_SECTS: u16 = 0x8;
const FAT_FLAG_INIT_LOCALS: u16 = 0x10;

const SECT_EH_TABLE: u8 = 0x01;
const SECT_FAT_FORMAT: u8 = 0x40;
const SECT_MORE_SECTS: u8 = 0x80;

impl<'l> MethodBody<'l> {
	pub fn read(stream: &mut Cursor<&'l [u8]>) -> std::io::Result<Self> {
		let header = u8::read(stream, &())?;
		match header & 3 {
			TINY_FORMAT => {
				let code_size = (header >> 2) as usize;
				let code = read_bytes_slice_from_stream(stream, code_size)?;
				Ok(Self {
					code,
					max_stack: 8,
					init_locals: false,
					local_var_sig_token: 0,
					clauses: vec![],
				})
			},
			FAT_FORMAT => {
				stream.set_position(stream.position() - 1);
				let flags = u16::read(stream, &())?;
				let max_stack = u16::read(stream, &())?;
				let code_size = u32::read(stream, &())?;
				let local_var_sig_token = u32::read(stream, &())?;
				let init_locals = flags & FAT_FLAG_INIT_LOCALS != 0;

				// The header size field (upper nibble of flags) counts
				// 4-byte units; 3 is the only defined value.
				if (flags >> 12) != 3 {
					return Err(ErrorKind::InvalidData.into());
				}

				let code = read_bytes_slice_from_stream(stream, code_size as usize)?;

				let mut clauses = vec![];
				if flags & FAT_FLAG_MORE_SECTS != 0 {
					read_exception_sections(stream, &mut clauses)?;
				}

				Ok(Self {
					max_stack,
					init_locals,
					local_var_sig_token,
					code,
					clauses,
				})
			},
			_ => Err(Error::new(ErrorKind::InvalidData, "Invalid method header")),
		}
	}
}

fn read_exception_sections(stream: &mut Cursor<&[u8]>, clauses: &mut Vec<ExceptionClause>) -> std::io::Result<()> {
	loop {
		// Sections start on a 4-byte boundary.
		let aligned = (stream.position() + 3) & !3;
		stream.set_position(aligned);

		let kind = u8::read(stream, &())?;
		if kind & SECT_EH_TABLE == 0 {
			return Err(ErrorKind::InvalidData.into());
		}

		if kind & SECT_FAT_FORMAT != 0 {
			let mut size_bytes = [0u8; 3];
			std::io::Read::read_exact(stream, &mut size_bytes)?;
			let data_size = u32::from_le_bytes([size_bytes[0], size_bytes[1], size_bytes[2], 0]);
			let count = (data_size as usize - 4) / 24;
			for _ in 0..count {
				clauses.push(ExceptionClause {
					flags: ExceptionClauseFlags::from_bits_retain(u32::read(stream, &())?),
					try_offset: u32::read(stream, &())?,
					try_length: u32::read(stream, &())?,
					handler_offset: u32::read(stream, &())?,
					handler_length: u32::read(stream, &())?,
					class_token_or_filter_offset: u32::read(stream, &())?,
				});
			}
		} else {
			let data_size = u8::read(stream, &())?;
			let _padding = u16::read(stream, &())?;
			let count = (data_size as usize - 4) / 12;
			for _ in 0..count {
				clauses.push(ExceptionClause {
					flags: ExceptionClauseFlags::from_bits_retain(u16::read(stream, &())? as u32),
					try_offset: u16::read(stream, &())? as u32,
					try_length: u8::read(stream, &())? as u32,
					handler_offset: u16::read(stream, &())? as u32,
					handler_length: u8::read(stream, &())? as u32,
					class_token_or_filter_offset: u32::read(stream, &())?,
				});
			}
		}

		if kind & SECT_MORE_SECTS == 0 {
			return Ok(());
		}
	}
}

impl Debug for MethodBody<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let mut dbg = f.debug_struct("MethodBody");
		dbg.field("max_stack", &self.max_stack);
		dbg.field("init_locals", &self.init_locals);
		dbg.field("local_var_sig_token", &format_args!("{:#010X}", self.local_var_sig_token));
		dbg.field("code", &format_args!("[u8; {:#X}]", self.code.len()));
		dbg.field("clauses", &self.clauses);
		dbg.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tiny_body() {
		// Tiny header: (size << 2) | 0x2, followed by the code bytes.
		let bytes = [(3 << 2) | 0x2u8, 0x00, 0x00, 0x2A];
		let mut stream = Cursor::new(bytes.as_slice());
		let body = MethodBody::read(&mut stream).unwrap();
		assert_eq!(body.max_stack, 8);
		assert_eq!(body.code, &[0x00, 0x00, 0x2A]);
		assert!(body.clauses.is_empty());
		assert_eq!(body.local_var_sig_token, 0);
	}

	#[test]
	fn fat_body_with_locals_token() {
		let mut bytes = vec![
			0x03, 0x30, // flags: fat, header size 3
			0x04, 0x00, // max stack 4
			0x02, 0x00, 0x00, 0x00, // code size 2
			0x01, 0x00, 0x00, 0x11, // locals token 0x11000001
		];
		bytes.extend_from_slice(&[0x00, 0x2A]);
		let mut stream = Cursor::new(bytes.as_slice());
		let body = MethodBody::read(&mut stream).unwrap();
		assert_eq!(body.max_stack, 4);
		assert_eq!(body.local_var_sig_token, 0x1100_0001);
		assert!(body.init_locals == false);
		assert_eq!(body.code, &[0x00, 0x2A]);
	}

	#[test]
	fn fat_body_with_small_eh_section() {
		let mut bytes = vec![
			0x0B, 0x30, // flags: fat | more sects, header size 3
			0x08, 0x00, // max stack
			0x02, 0x00, 0x00, 0x00, // code size 2
			0x00, 0x00, 0x00, 0x00, // no locals
			0x00, 0x2A, // code
			0x00, 0x00, // padding to 4-byte boundary
		];
		// Small EH section: kind, data size 16, padding, one 12-byte clause.
		bytes.extend_from_slice(&[
			0x01, 0x10, 0x00, 0x00, // kind=EHTable, size=16
			0x00, 0x00, // flags: typed clause
			0x00, 0x00, // try offset
			0x01, // try length
			0x01, 0x00, // handler offset
			0x01, // handler length
			0x02, 0x00, 0x00, 0x01, // class token 0x01000002
		]);
		let mut stream = Cursor::new(bytes.as_slice());
		let body = MethodBody::read(&mut stream).unwrap();
		assert_eq!(body.clauses.len(), 1);
		let clause = body.clauses[0];
		assert_eq!(clause.flags, ExceptionClauseFlags::EXCEPTION);
		assert_eq!(clause.try_length, 1);
		assert_eq!(clause.handler_offset, 1);
		assert_eq!(clause.class_token_or_filter_offset, 0x0100_0002);
	}
}
