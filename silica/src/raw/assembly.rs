use std::io::{Cursor, Error, ErrorKind, Read, Seek, SeekFrom};

use bitflags::bitflags;

use crate::raw::heaps::{BlobHeap, GuidHeap, MetadataHeap, StringHeap, UserStringHeap};
use crate::raw::heaps::table::TableHeap;
use crate::raw::pe::{DataDirectory, PEFile};
use crate::utilities::{impl_from_byte_stream, FromByteStream};

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CLIHeader {
	pub size_in_bytes: u32,
	pub major_runtime_version: u16,
	pub minor_runtime_version: u16,
	pub metadata: DataDirectory,
	pub flags: RuntimeFlags,
	pub entry_point_token: u32,
	pub resources: DataDirectory,
	pub strong_name_signature: u64,
	pub code_manager_table: u64,
	pub v_table_fixups: u64,
	pub export_address_table_jumps: u64,
	pub managed_native_header: u64,
}

impl_from_byte_stream!(CLIHeader);

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct RuntimeFlags: u32 {
		const IL_ONLY = 0x1;
		const REQUIRE_32_BIT = 0x2;
		const IL_LIBRARY = 0x4;
		const STRONG_NAME_SIGNED = 0x8;
		const PREFER_32_BIT = 0x00020000;
	}
}

impl_from_byte_stream!(RuntimeFlags);

#[derive(Debug)]
pub struct MetadataRoot<'l> {
	major_version: u16,
	minor_version: u16,
	version: String,
	flags: u16,
	heaps: Vec<MetadataHeap<'l>>,
}

impl<'l> MetadataRoot<'l> {
	pub fn read(data: &'l [u8]) -> std::io::Result<Self> {
		let mut stream = Cursor::new(data);
		if u32::read(&mut stream, &())? != 0x424A5342 {
			return Err(Error::new(ErrorKind::InvalidData, "Invalid metadata signature"));
		}

		let major_version = u16::read(&mut stream, &())?;
		let minor_version = u16::read(&mut stream, &())?;
		stream.seek(SeekFrom::Current(4))?; // Reserved

		let length = ((u32::read(&mut stream, &())? + 3) / 4) * 4; // Round length to 4
		let mut bytes = vec![0; length as usize];
		stream.read_exact(&mut bytes)?;
		let version_end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
		let Ok(version) = std::str::from_utf8(&bytes[..version_end]).map(str::to_string) else {
			return Err(ErrorKind::InvalidData.into());
		};

		let flags = u16::read(&mut stream, &())?;

		let stream_header_count = u16::read(&mut stream, &())? as usize;
		let mut heaps = Vec::with_capacity(stream_header_count);
		for _ in 0..stream_header_count {
			heaps.push(MetadataHeap::read(&mut stream, data)?);
		}

		Ok(Self {
			major_version,
			minor_version,
			version,
			flags,
			heaps,
		})
	}

	pub fn flags(&self) -> u16 {
		self.flags
	}
	pub fn version(&self) -> &str {
		&self.version
	}
	pub fn minor_version(&self) -> u16 {
		self.minor_version
	}
	pub fn major_version(&self) -> u16 {
		self.major_version
	}
	pub fn into_heaps(self) -> Vec<MetadataHeap<'l>> {
		self.heaps
	}
	#[allow(private_bounds)]
	pub fn get_heap<T>(&self) -> Option<&T>
	where
		Self: GetHeap<T>,
	{
		<Self as GetHeap<T>>::get_heap(self)
	}
}

/// The raw, borrow-the-bytes view of one PE image's CLI contents.
#[derive(Debug)]
pub struct Assembly<'l> {
	pe_file: PEFile<'l>,
	cli_header: CLIHeader,
	metadata_root: MetadataRoot<'l>,
}

impl<'l> TryFrom<PEFile<'l>> for Assembly<'l> {
	type Error = Error;
	fn try_from(pe: PEFile<'l>) -> Result<Self, Self::Error> {
		// Data directory 14 is the CLI header.
		let Some(data_dir) = pe.pe_header.image_optional_header.data_directory(14) else {
			return Err(Error::new(ErrorKind::InvalidData, "Missing CLI header directory"));
		};

		let Some((data, offset)) = pe.resolve_rva(data_dir.virtual_address) else {
			return Err(ErrorKind::InvalidData.into());
		};
		let mut cursor = Cursor::new(&data[offset..]);
		let cli_header = CLIHeader::read(&mut cursor, &())?;

		let Some((data, offset)) = pe.resolve_rva(cli_header.metadata.virtual_address) else {
			return Err(ErrorKind::InvalidData.into());
		};
		let metadata_root = MetadataRoot::read(&data[offset..])?;

		Ok(Self {
			pe_file: pe,
			cli_header,
			metadata_root,
		})
	}
}

impl<'l> Assembly<'l> {
	pub fn from_bytes(bytes: &'l [u8]) -> std::io::Result<Self> {
		let mut cursor = Cursor::new(bytes);
		let pe = PEFile::read(&mut cursor, &())?;
		Self::try_from(pe)
	}

	pub fn pe_file(&self) -> &PEFile<'l> {
		&self.pe_file
	}
	pub fn into_parts(self) -> (PEFile<'l>, MetadataRoot<'l>) {
		(self.pe_file, self.metadata_root)
	}
	pub fn cli_header(&self) -> CLIHeader {
		self.cli_header
	}
	pub fn metadata_root(&self) -> &MetadataRoot<'l> {
		&self.metadata_root
	}
}

trait GetHeap<T> {
	fn get_heap(&self) -> Option<&T>;
}

impl<'l> GetHeap<BlobHeap<'l>> for MetadataRoot<'l> {
	fn get_heap(&self) -> Option<&BlobHeap<'l>> {
		self.heaps.iter().find_map(|h| match h {
			MetadataHeap::Blob(h) => Some(h),
			_ => None,
		})
	}
}

impl<'l> GetHeap<GuidHeap<'l>> for MetadataRoot<'l> {
	fn get_heap(&self) -> Option<&GuidHeap<'l>> {
		self.heaps.iter().find_map(|h| match h {
			MetadataHeap::Guid(h) => Some(h),
			_ => None,
		})
	}
}

impl<'l> GetHeap<StringHeap<'l>> for MetadataRoot<'l> {
	fn get_heap(&self) -> Option<&StringHeap<'l>> {
		self.heaps.iter().find_map(|h| match h {
			MetadataHeap::String(h) => Some(h),
			_ => None,
		})
	}
}

impl<'l> GetHeap<UserStringHeap<'l>> for MetadataRoot<'l> {
	fn get_heap(&self) -> Option<&UserStringHeap<'l>> {
		self.heaps.iter().find_map(|h| match h {
			MetadataHeap::UserString(h) => Some(h),
			_ => None,
		})
	}
}

impl<'l> GetHeap<TableHeap> for MetadataRoot<'l> {
	fn get_heap(&self) -> Option<&TableHeap> {
		self.heaps.iter().find_map(|h| match h {
			MetadataHeap::Table(h) => Some(h),
			_ => None,
		})
	}
}
