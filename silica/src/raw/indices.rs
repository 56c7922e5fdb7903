pub mod metadata_token {
	use std::fmt::{Debug, Formatter};
	use std::io::{Cursor, ErrorKind};
	use paste::paste;

	use crate::utilities::FromByteStream;

	macro_rules! define_metadata_token {
		($($id: ident = $discriminant: literal),*) => {
			#[repr(u32)]
			#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
			pub enum MetadataTokenKind {
				$($id = $discriminant),*
			}

			#[repr(transparent)]
			#[derive(Copy, Clone, Eq, PartialEq, Hash)]
			pub struct MetadataToken(u32);

			impl MetadataToken {
				pub fn new(kind: MetadataTokenKind, index: usize) -> Self {
					Self(((kind as u32) << 24) | (index as u32 & 0x00FF_FFFF))
				}

				pub fn kind(&self) -> MetadataTokenKind {
					let discriminant = (self.0 & 0xFF000000) >> 24;
					match discriminant {
						$($discriminant => MetadataTokenKind::$id,)*
						_ => unreachable!(),
					}
				}

				/// 1-based rid (or heap offset for `String` tokens). 0 means "no token".
				#[inline]
				pub fn index(&self) -> usize {
					(self.0 & 0x00FFFFFF) as usize
				}

				#[inline]
				pub fn is_null(&self) -> bool {
					self.index() == 0
				}

				#[inline]
				pub fn raw(&self) -> u32 {
					self.0
				}
			}

			impl TryFrom<u32> for MetadataToken {
				type Error = ();
				fn try_from(value: u32) -> Result<Self, Self::Error> {
					let discriminant = (value & 0xFF000000) >> 24;
					match discriminant {
						$($discriminant => Ok(Self(value)),)*
						_ => Err(())
					}
				}
			}

			paste! {
				$(
					#[repr(transparent)]
					#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
					pub struct [<$id Token>](pub usize);

					impl From<[<$id Token>]> for MetadataToken {
						fn from(value: [<$id Token>]) -> Self {
							MetadataToken(((MetadataTokenKind::$id as u32) << 24) | value.0 as u32)
						}
					}

					impl TryFrom<MetadataToken> for [<$id Token>] {
						type Error = ();
						fn try_from(value: MetadataToken) -> Result<Self, Self::Error> {
							match value.kind() {
								MetadataTokenKind::$id => Ok(Self(value.index())),
								_ => Err(()),
							}
						}
					}
				)*
			}
		};
	}

	impl Debug for MetadataToken {
		fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
			write!(f, "MetadataToken::{:?}(", self.kind())?;
			self.index().fmt(f)?;
			write!(f, ")")
		}
	}

	impl FromByteStream for MetadataToken {
		type Deps = ();
		fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
			let value = u32::read(stream, &())?;
			MetadataToken::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
		}
	}

	define_metadata_token! {
		Module = 0x00,
		TypeRef = 0x01,
		TypeDef = 0x02,
		Field = 0x04,
		MethodDef = 0x06,
		Param = 0x08,
		InterfaceImpl = 0x09,
		MemberRef = 0x0a,
		Constant = 0x0b,
		CustomAttribute = 0x0c,
		DeclSecurity = 0x0e,
		ClassLayout = 0x0f,
		FieldLayout = 0x10,
		StandAloneSig = 0x11,
		EventMap = 0x12,
		Event = 0x14,
		PropertyMap = 0x15,
		Property = 0x17,
		MethodSemantics = 0x18,
		MethodImpl = 0x19,
		ModuleRef = 0x1a,
		TypeSpec = 0x1b,
		ImplMap = 0x1c,
		FieldRVA = 0x1d,
		Assembly = 0x20,
		AssemblyRef = 0x23,
		File = 0x26,
		ExportedType = 0x27,
		ManifestResource = 0x28,
		NestedClass = 0x29,
		GenericParam = 0x2a,
		MethodSpec = 0x2b,
		GenericParamConstraint = 0x2c,

		Document = 0x30,
		MethodDebugInformation = 0x31,
		LocalScope = 0x32,
		LocalVariable = 0x33,
		LocalConstant = 0x34,
		ImportScope = 0x35,
		StateMachineMethod = 0x36,
		CustomDebugInformation = 0x37,

		String = 0x70
	}
}

pub mod coded_index {
	use paste::paste;
	use std::io::{Cursor, ErrorKind, Read};

	use crate::raw::heaps::table::TableKind;
	use std::fmt::{Debug, Formatter};
	use crate::raw::indices::metadata_token::{MetadataTokenKind, MetadataToken};
	use crate::raw::indices::sizes::{IndexSizes, SizeOf};
	use crate::utilities::{FromByteStream, read_compressed_u32};

	macro_rules! define_coded_index {
		($($id: ident: [$($variant: ident),*]),*) => {
			#[repr(u32)]
			#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
			pub enum CodedIndexKind {
				$($id),*
			}

			$(
				#[repr(transparent)]
				#[derive(Copy, Clone, Eq, PartialEq, Hash)]
				pub struct $id(u32);

				impl Debug for $id {
					fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
						let token: MetadataToken = (*self).into();
						write!(f, "{}(", stringify!($id))?;
						self.0.fmt(f)?;
						write!(f, ") | ")?;
						token.fmt(f)
					}
				}

				impl TryFrom<u32> for $id {
					type Error = ();
					fn try_from(value: u32) -> Result<Self, Self::Error> {
						match CodedIndexKind::$id.is_valid(value) {
							false => Err(()),
							true => Ok(Self(value)),
						}
					}
				}

				impl FromByteStream for $id {
					type Deps = IndexSizes;
					fn read(stream: &mut Cursor<&[u8]>, sizes: &Self::Deps) -> std::io::Result<Self> {
						let size = <IndexSizes as SizeOf<$id>>::size_of(sizes);
						let mut bytes = 0u32.to_ne_bytes();
						stream.read_exact(&mut bytes[..size])?;
						let value = u32::from_le_bytes(bytes);
						Self::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
					}
				}

				impl SizeOf<$id> for IndexSizes {
					fn size_of(&self) -> usize {
						self.coded[CodedIndexKind::$id as usize]
					}
				}

				impl $id {
					pub fn read_compressed(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
						let value = read_compressed_u32(stream)?;
						Self::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
					}

					#[inline]
					pub fn raw(&self) -> u32 {
						self.0
					}

					#[inline]
					pub fn is_null(&self) -> bool {
						const BITS: u32 = CodedIndexKind::$id.mask_bits();
						self.0 >> BITS == 0
					}

					/// Re-encodes a token into this coded-index space, for
					/// comparisons against sorted owner columns.
					pub fn encode(token: MetadataToken) -> Option<Self> {
						const BITS: u32 = CodedIndexKind::$id.mask_bits();
						let kinds: &[MetadataTokenKind] = &[$(MetadataTokenKind::$variant),*];
						let tag = kinds.iter().position(|k| *k == token.kind())? as u32;
						Some(Self(((token.index() as u32) << BITS) | tag))
					}
				}

				impl From<$id> for MetadataToken {
					fn from(value: $id) -> Self {
						const BITS: u32 = CodedIndexKind::$id.mask_bits();
						let token = CodedIndexKind::$id.token_kind(value.0);
						let val = ((token as u32) << 24) | value.0 >> BITS;
						MetadataToken::try_from(val).unwrap()
					}
				}

				paste! {
					$(
						impl TryFrom<$id> for crate::raw::indices::metadata_token::[<$variant Token>] {
							type Error = ();
							fn try_from(value: $id) -> Result<Self, Self::Error> {
								use crate::raw::indices::metadata_token::*;
								let token = MetadataToken::from(value);
								[<$variant Token>]::try_from(token)
							}
						}
					)*
				}
			)*

			const TABLES: &[&[TableKind]] = &[$(&[$(TableKind::$variant),*]),*];
			const TOKENS: &[&[MetadataTokenKind]] = &[$(&[$(MetadataTokenKind::$variant),*]),*];
		};
	}

	define_coded_index! {
		TypeDefOrRef: [TypeDef, TypeRef, TypeSpec],
		HasConstant: [Field, Param, Property],
		HasCustomAttribute: [
			MethodDef, Field, TypeRef, TypeDef, Param, InterfaceImpl, MemberRef,
			Module, DeclSecurity, Property, Event, StandAloneSig, ModuleRef,
			TypeSpec, Assembly, AssemblyRef, File, ExportedType,
			ManifestResource, GenericParam, GenericParamConstraint, MethodSpec
		],
		HasFieldMarshal: [Field, Param],
		HasDeclSecurity: [TypeDef, MethodDef, Assembly],
		MemberRefParent: [TypeDef, TypeRef, ModuleRef, MethodDef, TypeSpec],
		HasSemantics: [Event, Property],
		MethodDefOrRef: [MethodDef, MemberRef],
		MemberForwarded: [Field, MethodDef],
		Implementation: [File, AssemblyRef, ExportedType],
		CustomAttributeType: [MethodDef, MemberRef],
		ResolutionScope: [Module, ModuleRef, AssemblyRef, TypeRef],
		TypeOrMethodDef: [TypeDef, MethodDef],
		HasCustomDebugInformation: [
			MethodDef, Field, TypeRef, TypeDef, Param, InterfaceImpl, MemberRef,
			Module, DeclSecurity, Property, Event, StandAloneSig, ModuleRef,
			TypeSpec, Assembly, AssemblyRef, File, ExportedType,
			ManifestResource, GenericParam, GenericParamConstraint, MethodSpec,
			Document, LocalScope, LocalVariable, LocalConstant, ImportScope
		]
	}

	impl CodedIndexKind {
		pub const fn get_size(&self, table_sizes: &[u32; 64]) -> usize {
			let mut i = 0;
			let mut max = 0;
			let bits = self.mask_bits();
			let tables = TABLES[*self as usize];
			while i < tables.len() {
				let table = tables[i];
				let size = table_sizes[table as usize] as usize;
				if max < size {
					max = size;
				}
				i += 1;
			}

			2 + 2 * (max > (1 << (16 - bits))) as usize
		}

		pub const fn mask(&self) -> u32 {
			match self {
				CodedIndexKind::CustomAttributeType => 0x7,
				_ => {
					let tokens = TABLES[*self as usize];
					match tokens.len() {
						0 | 1 => 0,
						_ => u32::MAX.overflowing_shr((tokens.len() as u32 - 1).leading_zeros()).0,
					}
				},
			}
		}

		pub const fn mask_bits(&self) -> u32 {
			match self {
				CodedIndexKind::CustomAttributeType => 0x3,
				_ => {
					let tokens = TABLES[*self as usize];
					32 - (tokens.len() as u32 - 1).leading_zeros()
				},
			}
		}

		pub const fn is_valid(&self, value: u32) -> bool {
			let discriminant = value & self.mask();
			match self {
				CodedIndexKind::CustomAttributeType => matches!(discriminant, 2 | 3),
				_ => {
					let tables = TABLES[*self as usize];
					((value & self.mask()) as usize) < tables.len()
				},
			}
		}

		pub const fn token_kind(&self, value: u32) -> MetadataTokenKind {
			let mask = self.mask();
			let discriminant = value & mask;
			match self {
				CodedIndexKind::CustomAttributeType => match discriminant {
					2 => MetadataTokenKind::MethodDef,
					3 => MetadataTokenKind::MemberRef,
					_ => unreachable!(),
				},
				_ => TOKENS[*self as usize][discriminant as usize],
			}
		}
	}
}

pub mod table_index {
	use std::io::{Cursor, Read};

	use paste::paste;

	use crate::raw::heaps::table::TableKind;
	use crate::raw::indices::sizes::{IndexSizes, SizeOf};
	use crate::utilities::FromByteStream;

	macro_rules! define_table_index {
		($($id: ident => $table: ident),*) => {
			paste! {
				$(
					/// 1-based row index into the named table; 0 means "none".
					#[repr(transparent)]
					#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
					pub struct $id(pub usize);

					impl $id {
						#[inline]
						pub fn rid(&self) -> Option<usize> {
							match self.0 {
								0 => None,
								rid => Some(rid),
							}
						}
					}

					impl SizeOf<$id> for IndexSizes {
						#[inline]
						fn size_of(&self) -> usize {
							self.tables[TableKind::$table as usize]
						}
					}

					impl FromByteStream for $id {
						type Deps = IndexSizes;
						fn read(stream: &mut Cursor<&[u8]>, sizes: &Self::Deps) -> std::io::Result<Self> {
							let size = <IndexSizes as SizeOf<$id>>::size_of(sizes);
							let mut bytes = 0usize.to_ne_bytes();
							stream.read_exact(&mut bytes[..size])?;
							Ok(Self(usize::from_le_bytes(bytes)))
						}
					}
				)*
			}
		};
	}

	define_table_index! {
		TypeDefIndex => TypeDef,
		FieldIndex => Field,
		MethodDefIndex => MethodDef,
		ParamIndex => Param,
		EventIndex => Event,
		PropertyIndex => Property,
		ModuleRefIndex => ModuleRef,
		GenericParamIndex => GenericParam,
		AssemblyRefIndex => AssemblyRef
	}
}

pub(crate) mod sizes {
	use crate::raw::heaps::{BlobIndex, GuidIndex, StringIndex};
	use crate::raw::indices::coded_index::CodedIndexKind;

	pub const TABLE_COUNT: usize = 64;
	pub const CODED_INDEX_COUNT: usize = 14;

	#[derive(Debug)]
	pub struct IndexSizes {
		pub guid: usize,
		pub blob: usize,
		pub string: usize,
		pub coded: [usize; CODED_INDEX_COUNT],
		pub tables: [usize; TABLE_COUNT],
	}

	pub trait SizeOf<T> {
		fn size_of(&self) -> usize;
	}

	impl IndexSizes {
		pub fn new(heap_sizes: u8, table_lens: &[u32; TABLE_COUNT]) -> Self {
			Self {
				blob: 2 + 2 * ((heap_sizes & 0x4) != 0) as usize,
				guid: 2 + 2 * ((heap_sizes & 0x2) != 0) as usize,
				string: 2 + 2 * ((heap_sizes & 0x1) != 0) as usize,
			tables: {
					let mut tables = [0; TABLE_COUNT];
					for (size, len) in tables.iter_mut().zip(table_lens) {
						*size = 2 + 2 * (*len >= 65536) as usize
					}
					tables
				},
				coded: {
					let mut coded = [0; CODED_INDEX_COUNT];
					let mut i = 0;
					while i < CODED_INDEX_COUNT {
						// Discriminants are dense, `from_repr` cannot fail here.
						let kind: CodedIndexKind = unsafe { std::mem::transmute(i as u32) };
						coded[i] = kind.get_size(table_lens);
						i += 1;
					}
					coded
				},
			}
		}
	}

	impl AsRef<()> for IndexSizes {
		#[inline]
		fn as_ref(&self) -> &() {
			&()
		}
	}

	impl AsRef<IndexSizes> for IndexSizes {
		#[inline]
		fn as_ref(&self) -> &Self {
			self
		}
	}

	impl SizeOf<()> for IndexSizes {
		#[inline]
		fn size_of(&self) -> usize {
			0
		}
	}

	impl<const S: usize> SizeOf<[u8; S]> for IndexSizes {
		#[inline]
		fn size_of(&self) -> usize {
			S
		}
	}

	impl SizeOf<GuidIndex> for IndexSizes {
		#[inline]
		fn size_of(&self) -> usize {
			self.guid
		}
	}

	impl SizeOf<BlobIndex> for IndexSizes {
		#[inline]
		fn size_of(&self) -> usize {
			self.blob
		}
	}

	impl SizeOf<StringIndex> for IndexSizes {
		#[inline]
		fn size_of(&self) -> usize {
			self.string
		}
	}
}

#[cfg(test)]
mod tests {
	use super::coded_index::*;
	use super::metadata_token::*;
	use super::sizes::*;
	use crate::raw::heaps::table::TableKind;

	#[test]
	fn token_roundtrip() {
		let token = MetadataToken::new(MetadataTokenKind::MethodDef, 0x002A);
		assert_eq!(token.raw(), 0x0600_002A);
		assert_eq!(token.kind(), MetadataTokenKind::MethodDef);
		assert_eq!(token.index(), 0x2A);
		assert_eq!(MetadataToken::try_from(token.raw()).unwrap(), token);
	}

	#[test]
	fn user_string_pseudo_table() {
		let token = MetadataToken::try_from(0x7000_0001).unwrap();
		assert_eq!(token.kind(), MetadataTokenKind::String);
		assert_eq!(token.index(), 1);
	}

	#[test]
	fn coded_index_tag_bits_match_schema() {
		assert_eq!(CodedIndexKind::ResolutionScope.mask_bits(), 2);
		assert_eq!(CodedIndexKind::TypeDefOrRef.mask_bits(), 2);
		assert_eq!(CodedIndexKind::HasCustomAttribute.mask_bits(), 5);
		assert_eq!(CodedIndexKind::CustomAttributeType.mask_bits(), 3);
		assert_eq!(CodedIndexKind::HasFieldMarshal.mask_bits(), 1);
		assert_eq!(CodedIndexKind::HasDeclSecurity.mask_bits(), 2);
		assert_eq!(CodedIndexKind::MemberRefParent.mask_bits(), 3);
		assert_eq!(CodedIndexKind::HasConstant.mask_bits(), 2);
		assert_eq!(CodedIndexKind::HasSemantics.mask_bits(), 1);
		assert_eq!(CodedIndexKind::MethodDefOrRef.mask_bits(), 1);
		assert_eq!(CodedIndexKind::MemberForwarded.mask_bits(), 1);
		assert_eq!(CodedIndexKind::Implementation.mask_bits(), 2);
		assert_eq!(CodedIndexKind::TypeOrMethodDef.mask_bits(), 1);
		assert_eq!(CodedIndexKind::HasCustomDebugInformation.mask_bits(), 5);
	}

	#[test]
	fn coded_index_width_rule() {
		let mut lens = [0u32; TABLE_COUNT];
		// TypeDefOrRef has 2 tag bits: 2-byte while max row count << 2 < 65536.
		lens[TableKind::TypeDef as usize] = (1 << 14) - 1;
		assert_eq!(CodedIndexKind::TypeDefOrRef.get_size(&lens), 2);
		lens[TableKind::TypeDef as usize] = 1 << 14;
		assert_eq!(CodedIndexKind::TypeDefOrRef.get_size(&lens), 4);
	}

	#[test]
	fn coded_index_decode_encode() {
		// TypeDefOrRef tag 0 = TypeDef, 2 tag bits.
		let coded = TypeDefOrRef::try_from((7 << 2) | 0).unwrap();
		let token: MetadataToken = coded.into();
		assert_eq!(token.kind(), MetadataTokenKind::TypeDef);
		assert_eq!(token.index(), 7);
		assert_eq!(TypeDefOrRef::encode(token).unwrap(), coded);
	}

	#[test]
	fn single_table_index_width_rule() {
		let mut lens = [0u32; TABLE_COUNT];
		lens[TableKind::Field as usize] = 65535;
		assert_eq!(IndexSizes::new(0, &lens).tables[TableKind::Field as usize], 2);
		lens[TableKind::Field as usize] = 65536;
		assert_eq!(IndexSizes::new(0, &lens).tables[TableKind::Field as usize], 4);
	}

	#[test]
	fn heap_size_flags_select_widths() {
		let lens = [0u32; TABLE_COUNT];
		let sizes = IndexSizes::new(0b111, &lens);
		assert_eq!((sizes.string, sizes.guid, sizes.blob), (4, 4, 4));
		let sizes = IndexSizes::new(0, &lens);
		assert_eq!((sizes.string, sizes.guid, sizes.blob), (2, 2, 2));
	}
}
