use std::any::TypeId;
use std::fmt::Debug;
use std::io::{Cursor, Error, ErrorKind, Read};
use std::sync::Arc;

use bitflags::bitflags;

use silica_derive::{FromRepr, Table};

use crate::raw::heaps::{BlobIndex, GuidIndex, StringIndex};
use crate::raw::indices::coded_index::{
	CustomAttributeType, HasConstant, HasCustomAttribute, HasDeclSecurity, HasFieldMarshal,
	HasSemantics, Implementation, MemberForwarded, MemberRefParent, MethodDefOrRef,
	ResolutionScope, TypeDefOrRef, TypeOrMethodDef,
};
use crate::raw::indices::sizes::{IndexSizes, TABLE_COUNT};
use crate::raw::indices::table_index::*;
use crate::utilities::{enumerate_set_bits, impl_from_byte_stream, FromByteStream};

#[derive(Debug)]
pub struct TableHeap {
	major_version: u8,
	minor_version: u8,
	index_sizes: IndexSizes,
	tables: Vec<Arc<dyn Table>>,
}

impl TableHeap {
	pub fn minor_version(&self) -> u8 {
		self.minor_version
	}
	pub fn major_version(&self) -> u8 {
		self.major_version
	}
	pub fn index_sizes(&self) -> &IndexSizes {
		&self.index_sizes
	}
	pub fn get_table<T: Table + 'static>(&self) -> Option<&T> {
		for table in &self.tables {
			if Table::type_id(&**table) == TypeId::of::<T>() {
				let table = table.as_ref() as *const dyn Table as *const T;
				return Some(unsafe { &*table });
			}
		}
		None
	}
	pub fn row_count(&self, kind: TableKind) -> usize {
		self.tables
			.iter()
			.find(|t| t.kind() == kind)
			.map(|t| t.len())
			.unwrap_or(0)
	}
}

impl TryFrom<&[u8]> for TableHeap {
	type Error = Error;
	fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
		#[repr(C)]
		#[derive(Copy, Clone)]
		struct Header {
			reserved_0: u32,
			major_version: u8,
			minor_version: u8,
			heap_sizes: u8,
			reserved_1: u8,
			valid: u64,
			sorted: u64,
		}

		impl_from_byte_stream!(Header);

		let mut stream = Cursor::new(value);
		let Header {
			heap_sizes, valid,
			minor_version, major_version,
			..
		} = Header::read(&mut stream, &())?;

		let table_count = valid.count_ones() as usize;
		let mut table_lens = [0u32; TABLE_COUNT];

		for i in enumerate_set_bits(valid) {
			if i >= TABLE_COUNT {
				return Err(ErrorKind::InvalidData.into());
			}
			let mut bytes = 0u32.to_ne_bytes();
			stream.read_exact(&mut bytes)?;
			table_lens[i] = u32::from_le_bytes(bytes);
		}

		let sizes = IndexSizes::new(heap_sizes, &table_lens);

		let mut tables: Vec<Arc<dyn Table>> = Vec::with_capacity(table_count);
		for i in enumerate_set_bits(valid) {
			let len = table_lens[i] as usize;
			let Some(kind) = TableKind::from_repr(i) else {
				return Err(ErrorKind::InvalidData.into());
			};

			tables.push(match kind {
				TableKind::Module => Arc::new(ModuleTable::read(&mut stream, &sizes, len)?),
				TableKind::TypeRef => Arc::new(TypeRefTable::read(&mut stream, &sizes, len)?),
				TableKind::TypeDef => Arc::new(TypeDefTable::read(&mut stream, &sizes, len)?),
				TableKind::FieldPtr => Arc::new(FieldPtrTable::read(&mut stream, &sizes, len)?),
				TableKind::Field => Arc::new(FieldTable::read(&mut stream, &sizes, len)?),
				TableKind::MethodPtr => Arc::new(MethodPtrTable::read(&mut stream, &sizes, len)?),
				TableKind::MethodDef => Arc::new(MethodDefTable::read(&mut stream, &sizes, len)?),
				TableKind::ParamPtr => Arc::new(ParamPtrTable::read(&mut stream, &sizes, len)?),
				TableKind::Param => Arc::new(ParamTable::read(&mut stream, &sizes, len)?),
				TableKind::InterfaceImpl => Arc::new(InterfaceImplTable::read(&mut stream, &sizes, len)?),
				TableKind::MemberRef => Arc::new(MemberRefTable::read(&mut stream, &sizes, len)?),
				TableKind::Constant => Arc::new(ConstantTable::read(&mut stream, &sizes, len)?),
				TableKind::CustomAttribute => Arc::new(CustomAttributeTable::read(&mut stream, &sizes, len)?),
				TableKind::FieldMarshal => Arc::new(FieldMarshalTable::read(&mut stream, &sizes, len)?),
				TableKind::DeclSecurity => Arc::new(DeclSecurityTable::read(&mut stream, &sizes, len)?),
				TableKind::ClassLayout => Arc::new(ClassLayoutTable::read(&mut stream, &sizes, len)?),
				TableKind::FieldLayout => Arc::new(FieldLayoutTable::read(&mut stream, &sizes, len)?),
				TableKind::StandAloneSig => Arc::new(StandAloneSigTable::read(&mut stream, &sizes, len)?),
				TableKind::EventMap => Arc::new(EventMapTable::read(&mut stream, &sizes, len)?),
				TableKind::EventPtr => Arc::new(EventPtrTable::read(&mut stream, &sizes, len)?),
				TableKind::Event => Arc::new(EventTable::read(&mut stream, &sizes, len)?),
				TableKind::PropertyMap => Arc::new(PropertyMapTable::read(&mut stream, &sizes, len)?),
				TableKind::PropertyPtr => Arc::new(PropertyPtrTable::read(&mut stream, &sizes, len)?),
				TableKind::Property => Arc::new(PropertyTable::read(&mut stream, &sizes, len)?),
				TableKind::MethodSemantics => Arc::new(MethodSemanticsTable::read(&mut stream, &sizes, len)?),
				TableKind::MethodImpl => Arc::new(MethodImplTable::read(&mut stream, &sizes, len)?),
				TableKind::ModuleRef => Arc::new(ModuleRefTable::read(&mut stream, &sizes, len)?),
				TableKind::TypeSpec => Arc::new(TypeSpecTable::read(&mut stream, &sizes, len)?),
				TableKind::ImplMap => Arc::new(ImplMapTable::read(&mut stream, &sizes, len)?),
				TableKind::FieldRVA => Arc::new(FieldRVATable::read(&mut stream, &sizes, len)?),
				TableKind::EncLog => Arc::new(EncLogTable::read(&mut stream, &sizes, len)?),
				TableKind::EncMap => Arc::new(EncMapTable::read(&mut stream, &sizes, len)?),
				TableKind::Assembly => Arc::new(AssemblyTable::read(&mut stream, &sizes, len)?),
				TableKind::AssemblyProcessor => Arc::new(AssemblyProcessorTable::read(&mut stream, &sizes, len)?),
				TableKind::AssemblyOS => Arc::new(AssemblyOSTable::read(&mut stream, &sizes, len)?),
				TableKind::AssemblyRef => Arc::new(AssemblyRefTable::read(&mut stream, &sizes, len)?),
				TableKind::AssemblyRefProcessor => Arc::new(AssemblyRefProcessorTable::read(&mut stream, &sizes, len)?),
				TableKind::AssemblyRefOS => Arc::new(AssemblyRefOSTable::read(&mut stream, &sizes, len)?),
				TableKind::File => Arc::new(FileTable::read(&mut stream, &sizes, len)?),
				TableKind::ExportedType => Arc::new(ExportedTypeTable::read(&mut stream, &sizes, len)?),
				TableKind::ManifestResource => Arc::new(ManifestResourceTable::read(&mut stream, &sizes, len)?),
				TableKind::NestedClass => Arc::new(NestedClassTable::read(&mut stream, &sizes, len)?),
				TableKind::GenericParam => Arc::new(GenericParamTable::read(&mut stream, &sizes, len)?),
				TableKind::MethodSpec => Arc::new(MethodSpecTable::read(&mut stream, &sizes, len)?),
				TableKind::GenericParamConstraint => Arc::new(GenericParamConstraintTable::read(&mut stream, &sizes, len)?),

				// Debug-extension tables belong to portable PDB images, not
				// to runnable assemblies.
				TableKind::Document
				| TableKind::MethodDebugInformation
				| TableKind::LocalScope
				| TableKind::LocalVariable
				| TableKind::LocalConstant
				| TableKind::ImportScope
				| TableKind::StateMachineMethod
				| TableKind::CustomDebugInformation => {
					return Err(ErrorKind::InvalidData.into());
				},
			});
		}

		Ok(Self {
			major_version,
			minor_version,
			index_sizes: sizes,
			tables,
		})
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromRepr)]
pub enum TableKind {
	Module = 0x00,
	TypeRef = 0x01,
	TypeDef = 0x02,
	FieldPtr = 0x03,
	Field = 0x04,
	MethodPtr = 0x05,
	MethodDef = 0x06,
	ParamPtr = 0x07,
	Param = 0x08,
	InterfaceImpl = 0x09,
	MemberRef = 0x0a,
	Constant = 0x0b,
	CustomAttribute = 0x0c,
	FieldMarshal = 0x0d,
	DeclSecurity = 0x0e,
	ClassLayout = 0x0f,
	FieldLayout = 0x10,
	StandAloneSig = 0x11,
	EventMap = 0x12,
	EventPtr = 0x13,
	Event = 0x14,
	PropertyMap = 0x15,
	PropertyPtr = 0x16,
	Property = 0x17,
	MethodSemantics = 0x18,
	MethodImpl = 0x19,
	ModuleRef = 0x1a,
	TypeSpec = 0x1b,
	ImplMap = 0x1c,
	FieldRVA = 0x1d,
	EncLog = 0x1e,
	EncMap = 0x1f,
	Assembly = 0x20,
	AssemblyProcessor = 0x21,
	AssemblyOS = 0x22,
	AssemblyRef = 0x23,
	AssemblyRefProcessor = 0x24,
	AssemblyRefOS = 0x25,
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
}

#[allow(clippy::len_without_is_empty)]
pub trait Table: 'static + Debug + Send + Sync {
	fn len(&self) -> usize;
	fn kind(&self) -> TableKind;
	fn row_size(&self) -> usize;
	fn type_id(&self) -> TypeId {
		TypeId::of::<Self>()
	}
}

/// Rid range `[start, end)` of the rows whose key column equals `key`,
/// assuming the table is sorted on that column.
pub(crate) fn equal_range_by_key<T, K: Ord + Copy>(rows: &[T], key: K, f: impl Fn(&T) -> K) -> std::ops::Range<usize> {
	let start = rows.partition_point(|r| f(r) < key);
	let end = rows.partition_point(|r| f(r) <= key);
	start + 1..end + 1
}

/// Rid of the last row whose key column is `<= key` in a sorted table.
pub(crate) fn find_last_le_by_key<T, K: Ord + Copy>(rows: &[T], key: K, f: impl Fn(&T) -> K) -> Option<usize> {
	match rows.partition_point(|r| f(r) <= key) {
		0 => None,
		n => Some(n),
	}
}

#[derive(Debug, Clone, Table)]
pub struct Module {
	pub generation: u16,
	pub name: StringIndex,
	pub mv_id: GuidIndex,
	pub enc_id: GuidIndex,
	pub enc_base_id: GuidIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct TypeAttributes: u32 {
		// #### Visibility attributes ####
		/// Use this mask to retrieve visibility information.
		const VISIBILITY_MASK = 0x00000007;
		/// Class has no public scope.
		const NOT_PUBLIC = 0x00000000;
		/// Class has public scope.
		const PUBLIC = 0x00000001;
		/// Class is nested with public visibility.
		const NESTED_PUBLIC = 0x00000002;
		/// Class is nested with private visibility.
		const NESTED_PRIVATE = 0x00000003;
		/// Class is nested with family visibility.
		const NESTED_FAMILY = 0x00000004;
		/// Class is nested with assembly visibility.
		const NESTED_ASSEMBLY = 0x00000005;
		/// Class is nested with family and assembly.
		const NESTED_FAMILY_AND_ASSEMBLY = 0x00000006;
		/// Class is nested with family or assembly.
		const NESTED_FAMILY_OR_ASSEMBLY = 0x00000007;

		// #### Class layout attributes ####
		/// Use this mask to retrieve class layout information.
		const LAYOUT_MASK = 0x00000018;
		/// Class fields are auto-laid out.
		const AUTO_LAYOUT = 0x00000000;
		/// Class fields are laid out sequentially.
		const SEQUENTIAL_LAYOUT = 0x00000008;
		/// Layout is supplied explicitly.
		const EXPLICIT_LAYOUT = 0x00000010;

		// #### Class semantics attributes ####
		/// Use this mask to retrieve class semantics information.
		const CLASS_SEMANTICS_MASK = 0x00000020;
		/// Type is a class.
		const CLASS = 0x00000000;
		/// Type is an interface.
		const INTERFACE = 0x00000020;

		// #### Special semantics in addition to class semantics ####
		/// Class is abstract.
		const ABSTRACT = 0x00000080;
		/// Class cannot be extended.
		const SEALED = 0x00000100;
		/// Class name is special.
		const SPECIAL_NAME = 0x00000400;

		// #### Implementation Attributes ####
		/// Class/Interface is imported.
		const IMPORTED = 0x00001000;
		/// Class can be serialized.
		const SERIALIZABLE = 0x00002000;

		// #### String formatting Attributes ####
		/// Use this mask to retrieve string information for native interop.
		const STRING_FORMAT_MASK = 0x00030000;
		/// LPSTR is interpreted as ANSI.
		const ANSI_CLASS = 0x00000000;
		/// LPSTR is interpreted as Unicode.
		const UNICODE_CLASS = 0x00010000;
		/// LPSTR is interpreted automatically.
		const AUTO_CLASS = 0x00020000;
		/// A non-standard encoding specified by CUSTOM_STRING_FORMAT_MASK.
		const CUSTOM_FORMAT_CLASS = 0x00030000;
		/// Use this mask to retrieve non-standard encoding information for native interop.
		const CUSTOM_STRING_FORMAT_MASK = 0x00C00000;

		// #### Class Initialization Attributes ####
		/// Initialize the class before first static field access.
		const BEFORE_FIELD_INIT = 0x00100000;

		// #### Additional Attributes ####
		/// CLI provides 'special' behavior, depending upon the name of the Type.
		const RT_SPECIAL_NAME = 0x00000800;
		/// Type has security associated with it.
		const HAS_SECURITY = 0x00040000;
		/// This ExportedType entry is a type forwarder.
		const IS_TYPE_FORWARDER = 0x00200000;
	}
}

impl_from_byte_stream!(TypeAttributes);

#[derive(Debug, Clone, Table)]
pub struct TypeRef {
	pub resolution_scope: ResolutionScope,
	pub type_name: StringIndex,
	pub type_namespace: StringIndex,
}

#[derive(Debug, Clone, Table)]
pub struct TypeDef {
	pub flags: TypeAttributes,
	pub type_name: StringIndex,
	pub type_namespace: StringIndex,
	pub extends: TypeDefOrRef,
	pub field_list: FieldIndex,
	pub method_list: MethodDefIndex,
}

#[derive(Debug, Clone, Table)]
pub struct FieldPtr {
	pub field: FieldIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct FieldAttributes: u16 {
		// #### Accessibility attributes ####
		/// Use this mask to retrieve access information.
		const FIELD_ACCESS_MASK = 0x0007;
		/// Member not referenceable.
		const COMPILER_CONTROLLED = 0x0000;
		/// Accessible only by the parent type.
		const PRIVATE = 0x0001;
		/// Accessible by sub-types only in this Assembly.
		const FAMILY_AND_ASSEMBLY = 0x0002;
		/// Accessible by anyone in the Assembly.
		const ASSEMBLY = 0x0003;
		/// Accessible only by type and sub-types.
		const FAMILY = 0x0004;
		/// Accessible by sub-types anywhere, plus anyone in assembly.
		const FAMILY_OR_ASSEMBLY = 0x0005;
		/// Accessible by anyone who has visibility to this scope.
		const PUBLIC = 0x0006;
		/// Defined on type, else per instance.
		const STATIC = 0x0010;
		/// Field can only be initialized, not written to after init.
		const INIT_ONLY = 0x0020;
		/// Value is compile time constant.
		const LITERAL = 0x0040;
		/// Reserved (to indicate this field should not be serialized when type is remoted).
		const NOT_SERIALIZED = 0x0080;
		/// Field is special.
		const SPECIAL_NAME = 0x0200;

		// #### Interop Attribute ####
		/// Implementation is forwarded through PInvoke.
		const PINVOKE_IMPL = 0x2000;

		// #### Additional Attributes ####
		/// CLI provides 'special' behavior, depending upon the name of the field.
		const RT_SPECIAL_NAME = 0x0400;
		/// Field has marshalling information.
		const HAS_FIELD_MARSHAL = 0x1000;
		/// Field has default.
		const HAS_DEFAULT = 0x8000;
		/// Field has RVA.
		const HAS_FIELD_RVA = 0x0100;
	}
}

impl_from_byte_stream!(FieldAttributes);

#[derive(Debug, Clone, Table)]
pub struct Field {
	pub flags: FieldAttributes,
	pub name: StringIndex,
	pub signature: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct MethodPtr {
	pub method: MethodDefIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodAttributes: u16 {
		/// Use this mask to retrieve accessibility information.
		const MEMBER_ACCESS_MASK = 0x0007;
		/// Member not referenceable.
		const COMPILER_CONTROLLED = 0x0000;
		/// Accessible only by the parent type.
		const PRIVATE = 0x0001;
		/// Accessible by sub-types only in this Assembly.
		const FAMILY_AND_ASSEMBLY = 0x0002;
		/// Accessible by anyone in the Assembly.
		const ASSEMBLY = 0x0003;
		/// Accessible only by type and sub-types.
		const FAMILY = 0x0004;
		/// Accessible by sub-types anywhere, plus anyone in assembly.
		const FAMILY_OR_ASSEMBLY = 0x0005;
		/// Accessible by anyone who has visibility to this scope.
		const PUBLIC = 0x0006;
		/// Defined on type, else per instance.
		const STATIC = 0x0010;
		/// Method cannot be overridden.
		const FINAL = 0x0020;
		/// Method is virtual.
		const VIRTUAL = 0x0040;
		/// Method hides by name+sig, else just by name.
		const HIDE_BY_SIG = 0x0080;
		/// Use this mask to retrieve vtable attributes.
		const VTABLE_LAYOUT_MASK = 0x0100;
		/// Method reuses existing slot in vtable.
		const REUSE_SLOT = 0x0000;
		/// Method always gets a new slot in the vtable.
		const NEW_SLOT = 0x0100;
		/// Method can only be overridden if also accessible.
		const STRICT = 0x0200;
		/// Method does not provide an implementation.
		const ABSTRACT = 0x0400;
		/// Method is special.
		const SPECIAL_NAME = 0x0800;

		// #### Interop attributes ####
		/// Implementation is forwarded through PInvoke.
		const PINVOKE_IMPL = 0x2000;
		/// Reserved: shall be zero for conforming implementations.
		const UNMANAGED_EXPORT = 0x0008;

		// #### Additional attributes ####
		/// CLI provides 'special' behavior, depending upon the name of the method.
		const RT_SPECIAL_NAME = 0x1000;
		/// Method has security associated with it.
		const HAS_SECURITY = 0x4000;
		/// Method calls another method containing security code.
		const REQUIRE_SEC_OBJECT = 0x8000;
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodImplAttributes: u16 {
		/// Use this mask to retrieve the code type.
		const CODE_TYPE_MASK = 0x0003;
		/// Method impl is CIL.
		const IL = 0x0000;
		/// Method impl is native.
		const NATIVE = 0x0001;
		/// Method impl is OPTIL.
		const OPTIL = 0x0002;
		/// Method impl is provided by the runtime.
		const RUNTIME = 0x0003;
		/// Use this mask to retrieve managed/unmanaged information.
		const MANAGED_MASK = 0x0004;
		/// Method impl is unmanaged.
		const UNMANAGED = 0x0004;
		/// Method impl is managed.
		const MANAGED = 0x0000;
		/// Method cannot be inlined.
		const NO_INLINING = 0x0008;
		/// Indicates the method is defined; used primarily in merge scenarios.
		const FORWARD_REF = 0x0010;
		/// Method will not be optimized when generating native code.
		const NO_OPTIMIZATION = 0x0040;
		/// Reserved: conforming implementations can ignore.
		const PRESERVE_SIG = 0x0080;
		/// Reserved: shall be zero in conforming implementations.
		const INTERNAL_CALL = 0x1000;
		/// Method is single threaded through the body.
		const SYNCHRONIZED = 0x0020;
		/// Method cannot be interrupted by a thread abort.
		const NO_THREAD_ABORT = 0x2000;
		/// Method is an aggressive inlining candidate.
		const AGGRESSIVE_INLINING = 0x0100;
	}
}

impl_from_byte_stream!(MethodAttributes);
impl_from_byte_stream!(MethodImplAttributes);

#[derive(Debug, Clone, Table)]
pub struct MethodDef {
	pub rva: u32,
	pub impl_flags: MethodImplAttributes,
	pub flags: MethodAttributes,
	pub name: StringIndex,
	pub signature: BlobIndex,
	pub param_list: ParamIndex,
}

#[derive(Debug, Clone, Table)]
pub struct ParamPtr {
	pub param: ParamIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ParamAttributes: u16 {
		/// Param is \[In\].
		const IN = 0x0001;
		/// Param is \[Out\].
		const OUT = 0x0002;
		/// Param is optional.
		const OPTIONAL = 0x0010;
		/// Param has a default value.
		const HAS_DEFAULT = 0x1000;
		/// Param has field marshal information.
		const HAS_FIELD_MARSHAL = 0x2000;
	}
}

impl_from_byte_stream!(ParamAttributes);

#[derive(Debug, Clone, Table)]
pub struct Param {
	pub flags: ParamAttributes,
	pub sequence: u16,
	pub name: StringIndex,
}

#[derive(Debug, Clone, Table)]
pub struct InterfaceImpl {
	pub class: TypeDefIndex,
	pub interface: TypeDefOrRef,
}

#[derive(Debug, Clone, Table)]
pub struct MemberRef {
	pub class: MemberRefParent,
	pub name: StringIndex,
	pub signature: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct Constant {
	pub ty: u8,
	pub padding: u8,
	pub parent: HasConstant,
	pub value: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct CustomAttribute {
	pub parent: HasCustomAttribute,
	pub ty: CustomAttributeType,
	pub value: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct FieldMarshal {
	pub parent: HasFieldMarshal,
	pub native_type: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct DeclSecurity {
	pub action: u16,
	pub parent: HasDeclSecurity,
	pub permission_set: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct ClassLayout {
	pub packing_size: u16,
	pub class_size: u32,
	pub parent: TypeDefIndex,
}

#[derive(Debug, Clone, Table)]
pub struct FieldLayout {
	pub offset: u32,
	pub field: FieldIndex,
}

#[derive(Debug, Clone, Table)]
pub struct StandAloneSig {
	pub signature: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct EventMap {
	pub parent: TypeDefIndex,
	pub event_list: EventIndex,
}

#[derive(Debug, Clone, Table)]
pub struct EventPtr {
	pub event: EventIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct EventAttributes: u16 {
		/// Event is special.
		const SPECIAL_NAME = 0x0200;
		/// CLI provides 'special' behavior, depending upon the name of the event.
		const RT_SPECIAL_NAME = 0x0400;
	}
}

impl_from_byte_stream!(EventAttributes);

#[derive(Debug, Clone, Table)]
pub struct Event {
	pub flags: EventAttributes,
	pub name: StringIndex,
	pub ty: TypeDefOrRef,
}

#[derive(Debug, Clone, Table)]
pub struct PropertyMap {
	pub parent: TypeDefIndex,
	pub property_list: PropertyIndex,
}

#[derive(Debug, Clone, Table)]
pub struct PropertyPtr {
	pub property: PropertyIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct PropertyAttributes: u16 {
		/// Property is special.
		const SPECIAL_NAME = 0x0200;
		/// Runtime(metadata internal APIs) should check name encoding.
		const RT_SPECIAL_NAME = 0x0400;
		/// Property has a default value.
		const HAS_DEFAULT = 0x1000;
	}
}

impl_from_byte_stream!(PropertyAttributes);

#[derive(Debug, Clone, Table)]
pub struct Property {
	pub flags: PropertyAttributes,
	pub name: StringIndex,
	pub ty: BlobIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodSemanticsAttributes: u16 {
		/// Setter for property.
		const SETTER = 0x0001;
		/// Getter for property.
		const GETTER = 0x0002;
		/// Other method for property or event.
		const OTHER = 0x0004;
		/// AddOn method for event.
		const ADD_ON = 0x0008;
		/// RemoveOn method for event.
		const REMOVE_ON = 0x0010;
		/// Fire method for event.
		const FIRE = 0x0020;
	}
}

impl_from_byte_stream!(MethodSemanticsAttributes);

#[derive(Debug, Clone, Table)]
pub struct MethodSemantics {
	pub flags: MethodSemanticsAttributes,
	pub method: MethodDefIndex,
	pub association: HasSemantics,
}

#[derive(Debug, Clone, Table)]
pub struct MethodImpl {
	pub class: TypeDefIndex,
	pub body: MethodDefOrRef,
	pub declaration: MethodDefOrRef,
}

#[derive(Debug, Clone, Table)]
pub struct ModuleRef {
	pub name: StringIndex,
}

#[derive(Debug, Clone, Table)]
pub struct TypeSpec {
	pub signature: BlobIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct PInvokeAttributes: u16 {
		/// PInvoke is to use the member name as specified.
		const NO_MANGLE = 0x0001;
		/// Use this mask to retrieve the CharSet information.
		const CHAR_SET_MASK = 0x0006;
		const CHAR_SET_NOT_SPEC = 0x0000;
		const CHAR_SET_ANSI = 0x0002;
		const CHAR_SET_UNICODE = 0x0004;
		const CHAR_SET_AUTO = 0x0006;
		/// Information about target function; not relevant for fields.
		const SUPPORTS_LAST_ERROR = 0x0040;
		/// Use this mask to retrieve the calling convention.
		const CALL_CONV_MASK = 0x0700;
		const CALL_CONV_PLATFORMAPI = 0x0100;
		const CALL_CONV_CDECL = 0x0200;
		const CALL_CONV_STDCALL = 0x0300;
		const CALL_CONV_THISCALL = 0x0400;
		const CALL_CONV_FASTCALL = 0x0500;
	}
}

impl_from_byte_stream!(PInvokeAttributes);

#[derive(Debug, Clone, Table)]
pub struct ImplMap {
	pub flags: PInvokeAttributes,
	pub member_forwarded: MemberForwarded,
	pub import_name: StringIndex,
	pub import_scope: ModuleRefIndex,
}

#[derive(Debug, Clone, Table)]
pub struct FieldRVA {
	pub rva: u32,
	pub field: FieldIndex,
}

#[derive(Debug, Clone, Table)]
pub struct EncLog {
	pub token: u32,
	pub func_code: u32,
}

#[derive(Debug, Clone, Table)]
pub struct EncMap {
	pub token: u32,
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromRepr)]
pub enum AssemblyHashAlgorithm {
	None = 0x0000,
	MD5 = 0x8003,
	SHA1 = 0x8004,
	SHA256 = 0x800C,
	SHA384 = 0x800D,
	SHA512 = 0x800E,
}

impl FromByteStream for AssemblyHashAlgorithm {
	type Deps = ();
	fn read(stream: &mut Cursor<&[u8]>, _: &Self::Deps) -> std::io::Result<Self> {
		let value = u32::read(stream, &())?;
		Self::from_repr(value).ok_or_else(|| ErrorKind::InvalidData.into())
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct AssemblyFlags: u32 {
		/// The assembly reference holds the full (unhashed) public key.
		const PUBLIC_KEY = 0x0001;
		/// The implementation of this assembly used at runtime is not expected to match the version seen at compile time.
		const RETARGETABLE = 0x0100;
		/// Reserved (a conforming implementation of the CLI can ignore this setting on read; some implementations might use this bit to indicate that a CIL-to-native-code compiler should not generate optimized code).
		const DISABLE_JIT_COMPILE_OPTIMIZER = 0x4000;
		/// Reserved (a conforming implementation of the CLI can ignore this setting on read; some implementations might use this bit to indicate that a CIL-to-native-code compiler should generate CIL-to-native code map).
		const ENABLE_JIT_COMPILE_TRACKING = 0x8000;
	}
}

impl_from_byte_stream!(AssemblyFlags);

#[derive(Debug, Clone, Table)]
pub struct Assembly {
	pub hash_algorithm: AssemblyHashAlgorithm,
	pub major_version: u16,
	pub minor_version: u16,
	pub build_number: u16,
	pub revision_number: u16,
	pub flags: AssemblyFlags,
	pub public_key: BlobIndex,
	pub name: StringIndex,
	pub culture: StringIndex,
}

#[derive(Debug, Clone, Table)]
pub struct AssemblyProcessor {
	pub processor: u32,
}

#[derive(Debug, Clone, Table)]
pub struct AssemblyOS {
	pub platform_id: u32,
	pub major_version: u32,
	pub minor_version: u32,
}

#[derive(Debug, Clone, Table)]
pub struct AssemblyRef {
	pub major_version: u16,
	pub minor_version: u16,
	pub build_number: u16,
	pub revision_number: u16,
	pub flags: AssemblyFlags,
	pub public_key_or_token: BlobIndex,
	pub name: StringIndex,
	pub culture: StringIndex,
	pub hash_value: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct AssemblyRefProcessor {
	pub processor: u32,
	pub assembly_ref: AssemblyRefIndex,
}

#[derive(Debug, Clone, Table)]
pub struct AssemblyRefOS {
	pub platform_id: u32,
	pub major_version: u32,
	pub minor_version: u32,
	pub assembly_ref: AssemblyRefIndex,
}

#[derive(Debug, Clone, Table)]
pub struct File {
	pub flags: u32,
	pub name: StringIndex,
	pub hash_value: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct ExportedType {
	pub flags: TypeAttributes,
	pub type_def_id: u32,
	pub type_name: StringIndex,
	pub type_namespace: StringIndex,
	pub implementation: Implementation,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct ManifestResourceAttributes: u32 {
		/// Use this mask to retrieve visibility information.
		const VISIBILITY_MASK = 0x0007;
		/// The resource is exported from the assembly.
		const PUBLIC = 0x0001;
		/// The resource is private to the assembly.
		const PRIVATE = 0x0002;
	}
}

impl_from_byte_stream!(ManifestResourceAttributes);

#[derive(Debug, Clone, Table)]
pub struct ManifestResource {
	pub offset: u32,
	pub flags: ManifestResourceAttributes,
	pub name: StringIndex,
	pub implementation: Implementation,
}

#[derive(Debug, Clone, Table)]
pub struct NestedClass {
	pub nested_class: TypeDefIndex,
	pub enclosing_class: TypeDefIndex,
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct GenericParamAttributes: u16 {
		/// Use this mask to retrieve variance information.
		const VARIANCE_MASK = 0x0003;
		const NONE = 0x0000;
		/// The generic parameter is covariant.
		const COVARIANT = 0x0001;
		/// The generic parameter is contravariant.
		const CONTRAVARIANT = 0x0002;
		/// Use this mask to retrieve special constraints.
		const SPECIAL_CONSTRAINT_MASK = 0x001C;
		/// The generic parameter has the class special constraint.
		const REFERENCE_TYPE_CONSTRAINT = 0x0004;
		/// The generic parameter has the valuetype special constraint.
		const NOT_NULLABLE_VALUE_TYPE_CONSTRAINT = 0x0008;
		/// The generic parameter has the .ctor special constraint.
		const DEFAULT_CONSTRUCTOR_CONSTRAINT = 0x0010;
	}
}

impl_from_byte_stream!(GenericParamAttributes);

#[derive(Debug, Clone, Table)]
pub struct GenericParam {
	pub number: u16,
	pub flags: GenericParamAttributes,
	pub owner: TypeOrMethodDef,
	pub name: StringIndex,
}

#[derive(Debug, Clone, Table)]
pub struct MethodSpec {
	pub method: MethodDefOrRef,
	pub instantiation: BlobIndex,
}

#[derive(Debug, Clone, Table)]
pub struct GenericParamConstraint {
	pub owner: GenericParamIndex,
	pub constraint: TypeDefOrRef,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn equal_range_finds_owner_span() {
		struct Row {
			owner: usize,
		}
		let rows = [
			Row { owner: 1 },
			Row { owner: 2 },
			Row { owner: 2 },
			Row { owner: 5 },
		];
		assert_eq!(equal_range_by_key(&rows, 2, |r| r.owner), 2..4);
		assert_eq!(equal_range_by_key(&rows, 5, |r| r.owner), 4..5);
		let empty = equal_range_by_key(&rows, 3, |r| r.owner);
		assert!(empty.is_empty());
	}

	#[test]
	fn find_last_le_picks_floor_row() {
		struct Row {
			offset: usize,
		}
		let rows = [Row { offset: 0 }, Row { offset: 16 }, Row { offset: 64 }];
		assert_eq!(find_last_le_by_key(&rows, 20, |r| r.offset), Some(2));
		assert_eq!(find_last_le_by_key(&rows, 64, |r| r.offset), Some(3));
		assert_eq!(find_last_le_by_key(&rows, usize::MAX, |r| r.offset), Some(3));
	}
}
