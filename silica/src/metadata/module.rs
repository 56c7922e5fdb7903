use std::cell::RefCell;
use std::io::Cursor;
use std::pin::Pin;

use bumpalo::Bump;
use derivative::Derivative;
use fxhash::FxHashMap;
use tracing::debug;

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::RtClass;
use crate::metadata::generics::{GenericContainer, GenericContainerContext, GenericContext};
use crate::metadata::method::RtMethod;
use crate::metadata::typesig::{
	decode_gid_rid, encode_gid, ElementType, TypeDefGid, TypeSig, TypeSigData,
};
use crate::raw::assembly::{Assembly as RawAssembly, CLIHeader};
use crate::raw::heaps::table::{
	self, equal_range_by_key, AssemblyFlags, Table, TableHeap, TableKind,
};
use crate::raw::heaps::{BlobHeap, BlobIndex, MetadataHeap, StringHeap, StringIndex, UserStringHeap};
use crate::raw::il::CallingConvention;
use crate::raw::indices::coded_index::{MemberRefParent, TypeDefOrRef, TypeOrMethodDef};
use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::raw::pe::PEFile;

pub(crate) const CORLIB_MODULE_ID: u32 = 0;

/// Identity of one deployment unit. The model here is one module per
/// assembly, so the assembly record hangs off its module.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct AssemblyName<'l> {
	pub name: &'l str,
	pub culture: &'l str,
	pub major_version: u16,
	pub minor_version: u16,
	pub build_number: u16,
	pub revision_number: u16,
	pub flags: AssemblyFlags,
	#[derivative(Debug = "ignore")]
	pub public_key: &'l [u8],
}

/// A field, method, or type produced by member-ref resolution.
#[derive(Debug, Copy, Clone)]
pub enum RuntimeHandle<'l> {
	Type(&'l RtClass<'l>),
	Method(&'l RtMethod<'l>),
	Field(&'l crate::metadata::class::RtField<'l>),
}

/// Parsed shape of a MethodDefSig / MethodRefSig / PropertySig blob.
#[derive(Debug)]
pub struct ParsedMethodSig<'l> {
	pub call_conv: CallingConvention,
	pub has_this: bool,
	pub generic_param_count: u32,
	pub return_type: &'l TypeSig<'l>,
	pub params: Vec<&'l TypeSig<'l>>,
}

/// One parsed image plus the descriptor arena derived from it.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Module<'l> {
	id: std::cell::Cell<u32>,
	name_no_ext: &'l str,
	assembly: AssemblyName<'l>,
	entry_point_token: u32,
	#[derivative(Debug = "ignore")]
	arena: Pin<Box<Bump>>,
	#[derivative(Debug = "ignore")]
	image: &'l [u8],
	#[derivative(Debug = "ignore")]
	pe: PEFile<'l>,
	cli_header: CLIHeader,
	#[derivative(Debug = "ignore")]
	tables: TableHeap,
	#[derivative(Debug = "ignore")]
	strings: StringHeap<'l>,
	#[derivative(Debug = "ignore")]
	blobs: BlobHeap<'l>,
	#[derivative(Debug = "ignore")]
	user_strings: Option<UserStringHeap<'l>>,

	#[derivative(Debug = "ignore")]
	class_cache: RefCell<FxHashMap<u32, &'l RtClass<'l>>>,
	#[derivative(Debug = "ignore")]
	type_def_sig_cache: RefCell<FxHashMap<(u32, bool), &'l TypeSig<'l>>>,
	#[derivative(Debug = "ignore")]
	type_ref_cache: RefCell<FxHashMap<u32, TypeDefGid>>,
	#[derivative(Debug = "ignore")]
	type_spec_cache: RefCell<FxHashMap<u32, &'l TypeSig<'l>>>,
	#[derivative(Debug = "ignore")]
	generic_container_cache: RefCell<FxHashMap<u32, Option<&'l GenericContainer<'l>>>>,
}

impl<'l> Module<'l> {
	/// Parses `bytes` into a module backed by its own arena and registers
	/// it with `ctx`. The first registered module is the corlib.
	pub(crate) fn load(ctx: &'l Context<'l>, bytes: &[u8]) -> RtResult<&'l Module<'l>> {
		let arena = Box::pin(Bump::new());
		// The arena lives exactly as long as the module, which lives as
		// long as the context; the box keeps its address stable.
		let bump: &'l Bump = unsafe { std::mem::transmute(&*arena) };
		let image: &'l [u8] = bump.alloc_slice_copy(bytes);

		let raw = RawAssembly::from_bytes(image)?;
		let cli_header = raw.cli_header();
		let (pe, root) = raw.into_parts();

		let mut tables = None;
		let mut strings = None;
		let mut blobs = None;
		let mut user_strings = None;
		for heap in root.into_heaps() {
			match heap {
				MetadataHeap::Table(h) => tables = Some(h),
				MetadataHeap::String(h) => strings = Some(h),
				MetadataHeap::Blob(h) => blobs = Some(h),
				MetadataHeap::UserString(h) => user_strings = Some(h),
				MetadataHeap::Guid(_) | MetadataHeap::Pdb(_) => {},
			}
		}
		let tables = tables.ok_or(RtErr::BadImageFormat)?;
		let strings = strings.ok_or(RtErr::BadImageFormat)?;
		let blobs = blobs.ok_or(RtErr::BadImageFormat)?;

		// Top-level sanity: module row 1 must exist.
		let module_table = tables.get_table::<table::ModuleTable>().ok_or(RtErr::BadImageFormat)?;
		let module_row = module_table.get(1).ok_or(RtErr::BadImageFormat)?;
		let module_name = strings.get(module_row.name).ok_or(RtErr::BadImageFormat)?;

		// At most one assembly row; library images may omit it.
		let assembly = match tables.get_table::<table::AssemblyTable>() {
			None => AssemblyName {
				name: trim_module_extension(module_name),
				culture: "",
				major_version: 0,
				minor_version: 0,
				build_number: 0,
				revision_number: 0,
				flags: AssemblyFlags::empty(),
				public_key: &[],
			},
			Some(assemblies) => {
				if assemblies.len() != 1 {
					return Err(RtErr::BadImageFormat);
				}
				let row = assemblies.get(1).unwrap();
				AssemblyName {
					name: strings.get(row.name).ok_or(RtErr::BadImageFormat)?,
					culture: strings.get(row.culture).ok_or(RtErr::BadImageFormat)?,
					major_version: row.major_version,
					minor_version: row.minor_version,
					build_number: row.build_number,
					revision_number: row.revision_number,
					flags: row.flags,
					public_key: blobs.get(row.public_key).unwrap_or(&[]),
				}
			},
		};

		// Generic-param ownership must decode to a real TypeDef/MethodDef.
		if let Some(generic_params) = tables.get_table::<table::GenericParamTable>() {
			for row in generic_params.rows() {
				let token: MetadataToken = row.owner.into();
				let valid = match token.kind() {
					MetadataTokenKind::TypeDef => token.index() <= tables.row_count(TableKind::TypeDef),
					MetadataTokenKind::MethodDef => token.index() <= tables.row_count(TableKind::MethodDef),
					_ => false,
				};
				if !valid {
					return Err(RtErr::BadImageFormat);
				}
			}
		}

		let module = ctx.bump().alloc(Module {
			id: std::cell::Cell::new(0),
			name_no_ext: assembly.name,
			assembly,
			entry_point_token: cli_header.entry_point_token,
			arena,
			image,
			pe,
			cli_header,
			tables,
			strings,
			blobs,
			user_strings,
			class_cache: Default::default(),
			type_def_sig_cache: Default::default(),
			type_ref_cache: Default::default(),
			type_spec_cache: Default::default(),
			generic_container_cache: Default::default(),
		});

		let id = ctx.register_module(module)?;
		module.id.set(id);
		debug!(module = module.name_no_ext, id, "loaded module");
		Ok(module)
	}

	#[inline]
	pub fn id(&self) -> u32 {
		self.id.get()
	}

	#[inline]
	pub fn is_corlib(&self) -> bool {
		self.id.get() == CORLIB_MODULE_ID
	}

	#[inline]
	pub fn name(&self) -> &'l str {
		self.name_no_ext
	}

	#[inline]
	pub fn assembly(&self) -> &AssemblyName<'l> {
		&self.assembly
	}

	#[inline]
	pub fn entry_point_token(&self) -> u32 {
		self.entry_point_token
	}

	#[inline]
	pub(crate) fn arena(&self) -> &'l Bump {
		unsafe { std::mem::transmute(&*self.arena) }
	}

	#[inline]
	pub(crate) fn tables(&self) -> &TableHeap {
		&self.tables
	}

	#[inline]
	pub(crate) fn pe(&self) -> &PEFile<'l> {
		&self.pe
	}

	pub fn get_string(&self, idx: StringIndex) -> RtResult<&'l str> {
		self.strings.get(idx).ok_or(RtErr::BadImageFormat)
	}

	pub fn get_blob(&self, idx: BlobIndex) -> RtResult<&'l [u8]> {
		self.blobs.get(idx).ok_or(RtErr::BadImageFormat)
	}

	/// A cursor over a blob, for callers that decode custom formats
	/// (constants, custom attributes, marshalling descriptors).
	pub fn get_decoded_blob_reader(&self, idx: BlobIndex) -> RtResult<Cursor<&'l [u8]>> {
		Ok(Cursor::new(self.get_blob(idx)?))
	}

	/// UTF-16 content of a `#US` entry addressed by the token rid.
	pub fn get_user_string(&self, rid: usize) -> RtResult<Vec<u16>> {
		let heap = self.user_strings.as_ref().ok_or(RtErr::BadImageFormat)?;
		heap.get_utf16(rid).ok_or(RtErr::BadImageFormat)
	}

	/// Raw image bytes at an RVA, for field RVA data and method bodies.
	pub fn image_at_rva(&self, rva: u32) -> RtResult<&'l [u8]> {
		let (data, offset) = self.pe.resolve_rva(rva).ok_or(RtErr::BadImageFormat)?;
		Ok(&data[offset..])
	}

	// ### Table helpers ###

	pub(crate) fn type_def_row(&self, rid: u32) -> RtResult<&table::TypeDef> {
		let table = self.tables.get_table::<table::TypeDefTable>().ok_or(RtErr::BadImageFormat)?;
		table.get(rid as usize).ok_or(RtErr::BadImageFormat)
	}

	pub(crate) fn type_def_row_count(&self) -> usize {
		self.tables.row_count(TableKind::TypeDef)
	}

	/// `[start, end)` field rids owned by a typedef row.
	pub(crate) fn field_rid_range(&self, rid: u32) -> RtResult<std::ops::Range<u32>> {
		let row = self.type_def_row(rid)?;
		let start = row.field_list.0 as u32;
		let end = match self.type_def_row(rid + 1) {
			Ok(next) => next.field_list.0 as u32,
			Err(_) => self.tables.row_count(TableKind::Field) as u32 + 1,
		};
		Ok(start..end.max(start))
	}

	/// `[start, end)` method rids owned by a typedef row.
	pub(crate) fn method_rid_range(&self, rid: u32) -> RtResult<std::ops::Range<u32>> {
		let row = self.type_def_row(rid)?;
		let start = row.method_list.0 as u32;
		let end = match self.type_def_row(rid + 1) {
			Ok(next) => next.method_list.0 as u32,
			Err(_) => self.tables.row_count(TableKind::MethodDef) as u32 + 1,
		};
		Ok(start..end.max(start))
	}

	/// The typedef that owns a field rid, found through the sorted
	/// `field_list` column.
	pub(crate) fn type_def_rid_of_field(&self, field_rid: u32) -> RtResult<u32> {
		let table = self.tables.get_table::<table::TypeDefTable>().ok_or(RtErr::BadImageFormat)?;
		let rid = table::find_last_le_by_key(table.rows(), field_rid as usize, |r| r.field_list.0)
			.ok_or(RtErr::BadImageFormat)?;
		Ok(rid as u32)
	}

	pub(crate) fn type_def_rid_of_method(&self, method_rid: u32) -> RtResult<u32> {
		let table = self.tables.get_table::<table::TypeDefTable>().ok_or(RtErr::BadImageFormat)?;
		let rid = table::find_last_le_by_key(table.rows(), method_rid as usize, |r| r.method_list.0)
			.ok_or(RtErr::BadImageFormat)?;
		Ok(rid as u32)
	}

	/// Enclosing typedef of a nested class, if any.
	pub(crate) fn enclosing_type_def_rid(&self, nested_rid: u32) -> Option<u32> {
		let table = self.tables.get_table::<table::NestedClassTable>()?;
		let range = equal_range_by_key(table.rows(), nested_rid as usize, |r| r.nested_class.0);
		let row = table.get(range.start)?;
		match row.nested_class.0 == nested_rid as usize {
			true => Some(row.enclosing_class.0 as u32),
			false => None,
		}
	}

	pub(crate) fn nested_type_def_rids(&self, enclosing_rid: u32) -> Vec<u32> {
		// NestedClass is sorted by the nested column, not the enclosing
		// one, so this is a scan.
		let Some(table) = self.tables.get_table::<table::NestedClassTable>() else {
			return vec![];
		};
		table
			.rows()
			.iter()
			.filter(|r| r.enclosing_class.0 == enclosing_rid as usize)
			.map(|r| r.nested_class.0 as u32)
			.collect()
	}

	// ### Class queries ###

	pub fn get_class_by_type_def_rid(&'l self, ctx: &'l Context<'l>, rid: u32) -> RtResult<&'l RtClass<'l>> {
		if let Some(class) = self.class_cache.borrow().get(&rid).copied() {
			return Ok(class);
		}
		// The record registers itself into the cache before resolving its
		// parent, so self-referential hierarchies terminate.
		crate::metadata::class::new_type_def_class(ctx, self, rid)
	}

	pub(crate) fn cache_class(&self, rid: u32, class: &'l RtClass<'l>) {
		self.class_cache.borrow_mut().insert(rid, class);
	}

	/// Finds a typedef rid by `namespace` + `name`.
	pub(crate) fn find_type_def_rid(&self, namespace: &str, name: &str, ignore_case: bool) -> Option<u32> {
		let table = self.tables.get_table::<table::TypeDefTable>()?;
		for (i, row) in table.rows().iter().enumerate() {
			let row_name = self.strings.get(row.type_name)?;
			let row_namespace = self.strings.get(row.type_namespace)?;
			let matches = match ignore_case {
				false => row_name == name && row_namespace == namespace,
				true => row_name.eq_ignore_ascii_case(name) && row_namespace.eq_ignore_ascii_case(namespace),
			};
			if matches {
				return Some(i as u32 + 1);
			}
		}
		None
	}

	/// `Namespace.Name` lookup. Returns `Ok(None)` when absent and
	/// `must_exist` is false, `TypeLoad` otherwise.
	pub fn get_class_by_name(
		&'l self,
		ctx: &'l Context<'l>,
		full_name: &str,
		ignore_case: bool,
		must_exist: bool,
	) -> RtResult<Option<&'l RtClass<'l>>> {
		let (namespace, name) = split_full_name(full_name);
		match self.find_type_def_rid(namespace, name, ignore_case) {
			Some(rid) => Ok(Some(self.get_class_by_type_def_rid(ctx, rid)?)),
			None if must_exist => Err(RtErr::TypeLoad),
			None => Ok(None),
		}
	}

	/// `Namespace.Outer+Inner` lookup, `+` separating nesting levels.
	pub fn get_class_by_nested_full_name(
		&'l self,
		ctx: &'l Context<'l>,
		full_name: &str,
		ignore_case: bool,
	) -> RtResult<Option<&'l RtClass<'l>>> {
		let mut parts = full_name.split('+');
		let outer = parts.next().unwrap_or(full_name);
		let Some(mut class) = self.get_class_by_name(ctx, outer, ignore_case, false)? else {
			return Ok(None);
		};
		for nested_name in parts {
			match crate::metadata::class::find_nested_class_by_name(ctx, class, nested_name, ignore_case)? {
				Some(nested) => class = nested,
				None => return Ok(None),
			}
		}
		Ok(Some(class))
	}

	// ### Typesig queries ###

	/// Canonical by-value/by-ref signature of a typedef row. Corlib
	/// primitives collapse to their element types; value types are told
	/// apart from classes by their `extends` chain.
	pub fn get_type_def_sig(&'l self, ctx: &'l Context<'l>, rid: u32, by_ref: bool) -> RtResult<&'l TypeSig<'l>> {
		if let Some(sig) = self.type_def_sig_cache.borrow().get(&(rid, by_ref)).copied() {
			return Ok(sig);
		}
		let element_type = self.type_def_element_type(rid)?;
		let sig = ctx.sig_pool().type_def(element_type, encode_gid(self.id(), rid), by_ref);
		self.type_def_sig_cache.borrow_mut().insert((rid, by_ref), sig);
		Ok(sig)
	}

	fn type_def_element_type(&self, rid: u32) -> RtResult<ElementType> {
		let row = self.type_def_row(rid)?;
		let name = self.get_string(row.type_name)?;
		let namespace = self.get_string(row.type_namespace)?;

		if self.is_corlib() && namespace == "System" {
			if let Some(primitive) = corlib_primitive_element_type(name) {
				return Ok(primitive);
			}
		}

		// Value types derive from System.ValueType or System.Enum; the
		// two roots themselves (and Enum in particular) stay classes.
		if row.extends.is_null() {
			return Ok(ElementType::Class);
		}
		if self.is_corlib() && namespace == "System" && matches!(name, "ValueType" | "Enum") {
			return Ok(ElementType::Class);
		}
		let token: MetadataToken = row.extends.into();
		if token.kind() == MetadataTokenKind::TypeSpec {
			// Only reference types extend constructed generics.
			return Ok(ElementType::Class);
		}
		let (base_namespace, base_name) = self.type_name_of_token(token)?;
		let extends_value_type = base_namespace == "System" && matches!(base_name, "ValueType" | "Enum");
		match extends_value_type {
			true => Ok(ElementType::ValueType),
			false => Ok(ElementType::Class),
		}
	}

	/// Namespace/name of a TypeDef or TypeRef token without materializing
	/// the class.
	fn type_name_of_token(&self, token: MetadataToken) -> RtResult<(&'l str, &'l str)> {
		match token.kind() {
			MetadataTokenKind::TypeDef => {
				let row = self.type_def_row(token.index() as u32)?;
				Ok((self.get_string(row.type_namespace)?, self.get_string(row.type_name)?))
			},
			MetadataTokenKind::TypeRef => {
				let table = self.tables.get_table::<table::TypeRefTable>().ok_or(RtErr::BadImageFormat)?;
				let row = table.get(token.index()).ok_or(RtErr::BadImageFormat)?;
				Ok((self.get_string(row.type_namespace)?, self.get_string(row.type_name)?))
			},
			_ => Err(RtErr::BadImageFormat),
		}
	}

	/// Resolves a TypeRef row to the defining module's typedef gid.
	pub(crate) fn resolve_type_ref(&'l self, ctx: &'l Context<'l>, rid: u32) -> RtResult<TypeDefGid> {
		if let Some(gid) = self.type_ref_cache.borrow().get(&rid).copied() {
			return Ok(gid);
		}
		let table = self.tables.get_table::<table::TypeRefTable>().ok_or(RtErr::BadImageFormat)?;
		let row = table.get(rid as usize).ok_or(RtErr::BadImageFormat)?;
		let name = self.get_string(row.type_name)?;
		let namespace = self.get_string(row.type_namespace)?;

		let scope: MetadataToken = row.resolution_scope.into();
		let gid = match scope.kind() {
			MetadataTokenKind::Module => {
				let rid = self
					.find_type_def_rid(namespace, name, false)
					.ok_or(RtErr::TypeLoad)?;
				encode_gid(self.id(), rid)
			},
			MetadataTokenKind::AssemblyRef => {
				let assembly_refs = self.tables.get_table::<table::AssemblyRefTable>().ok_or(RtErr::BadImageFormat)?;
				let assembly_row = assembly_refs.get(scope.index()).ok_or(RtErr::BadImageFormat)?;
				let assembly_name = self.get_string(assembly_row.name)?;
				let target = ctx.load_module_by_name(assembly_name)?;
				let rid = target
					.find_type_def_rid(namespace, name, false)
					.ok_or(RtErr::TypeLoad)?;
				encode_gid(target.id(), rid)
			},
			MetadataTokenKind::TypeRef => {
				// Nested type: resolve the enclosing type, then look for
				// the nested name inside its module.
				let enclosing_gid = self.resolve_type_ref(ctx, scope.index() as u32)?;
				let target = ctx
					.module_by_id(crate::metadata::typesig::decode_gid_module(enclosing_gid))
					.ok_or(RtErr::ExecutionEngine)?;
				let nested_rids = target.nested_type_def_rids(decode_gid_rid(enclosing_gid));
				let mut found = None;
				for nested_rid in nested_rids {
					let nested_row = target.type_def_row(nested_rid)?;
					if target.get_string(nested_row.type_name)? == name {
						found = Some(nested_rid);
						break;
					}
				}
				encode_gid(target.id(), found.ok_or(RtErr::TypeLoad)?)
			},
			MetadataTokenKind::ModuleRef => {
				let module_refs = self.tables.get_table::<table::ModuleRefTable>().ok_or(RtErr::BadImageFormat)?;
				let module_row = module_refs.get(scope.index()).ok_or(RtErr::BadImageFormat)?;
				let module_name = self.get_string(module_row.name)?;
				let target = ctx.load_module_by_name(trim_module_extension(module_name))?;
				let rid = target
					.find_type_def_rid(namespace, name, false)
					.ok_or(RtErr::TypeLoad)?;
				encode_gid(target.id(), rid)
			},
			_ => return Err(RtErr::BadImageFormat),
		};

		self.type_ref_cache.borrow_mut().insert(rid, gid);
		Ok(gid)
	}

	/// Typesig for any TypeDef / TypeRef / TypeSpec token.
	pub fn get_typesig_by_token(
		&'l self,
		ctx: &'l Context<'l>,
		token: MetadataToken,
		gcc: GenericContainerContext<'l>,
	) -> RtResult<&'l TypeSig<'l>> {
		match token.kind() {
			MetadataTokenKind::TypeDef => self.get_type_def_sig(ctx, token.index() as u32, false),
			MetadataTokenKind::TypeRef => {
				let gid = self.resolve_type_ref(ctx, token.index() as u32)?;
				let target = ctx
					.module_by_id(crate::metadata::typesig::decode_gid_module(gid))
					.ok_or(RtErr::ExecutionEngine)?;
				target.get_type_def_sig(ctx, decode_gid_rid(gid), false)
			},
			MetadataTokenKind::TypeSpec => {
				if gcc.class_container.is_none() && gcc.method_container.is_none() {
					if let Some(sig) = self.type_spec_cache.borrow().get(&(token.index() as u32)).copied() {
						return Ok(sig);
					}
				}
				let specs = self.tables.get_table::<table::TypeSpecTable>().ok_or(RtErr::BadImageFormat)?;
				let row = specs.get(token.index()).ok_or(RtErr::BadImageFormat)?;
				let blob = self.get_blob(row.signature)?;
				let mut stream = Cursor::new(blob);
				let sig = self.parse_type_sig(ctx, &mut stream, gcc)?;
				if gcc.class_container.is_none() && gcc.method_container.is_none() {
					self.type_spec_cache.borrow_mut().insert(token.index() as u32, sig);
				}
				Ok(sig)
			},
			_ => Err(RtErr::BadImageFormat),
		}
	}

	/// Same as `get_typesig_by_token`, starting from a coded index.
	pub fn get_typesig_by_coded_index(
		&'l self,
		ctx: &'l Context<'l>,
		coded: TypeDefOrRef,
		gcc: GenericContainerContext<'l>,
	) -> RtResult<&'l TypeSig<'l>> {
		self.get_typesig_by_token(ctx, coded.into(), gcc)
	}

	// ### Generic containers ###

	pub fn get_generic_container(&'l self, ctx: &'l Context<'l>, owner_token: u32) -> RtResult<Option<&'l GenericContainer<'l>>> {
		if let Some(container) = self.generic_container_cache.borrow().get(&owner_token).copied() {
			return Ok(container);
		}

		let container = self.build_generic_container(ctx, owner_token)?;
		self.generic_container_cache.borrow_mut().insert(owner_token, container);
		Ok(container)
	}

	fn build_generic_container(&'l self, ctx: &'l Context<'l>, owner_token: u32) -> RtResult<Option<&'l GenericContainer<'l>>> {
		let Some(generic_params) = self.tables.get_table::<table::GenericParamTable>() else {
			return Ok(None);
		};
		let token = MetadataToken::try_from(owner_token).map_err(|_| RtErr::BadImageFormat)?;
		let Some(owner) = TypeOrMethodDef::encode(token) else {
			return Ok(None);
		};
		let range = equal_range_by_key(generic_params.rows(), owner.raw() as usize, |r| r.owner.raw() as usize);
		if range.is_empty() {
			return Ok(None);
		}

		let is_method = token.kind() == MetadataTokenKind::MethodDef;
		let mut params = Vec::with_capacity(range.len());
		for rid in range {
			let row = generic_params.get(rid).ok_or(RtErr::BadImageFormat)?;
			let name = self.get_string(row.name)?;
			params.push(ctx.sig_pool().intern_param(
				encode_gid(self.id(), rid as u32),
				name,
				row.number,
				is_method,
			));
		}

		Ok(Some(&*self.arena().alloc(GenericContainer {
			owner_token,
			is_method,
			params: self.arena().alloc_slice_copy(&params),
		})))
	}

	/// `Var`/`MVar` signature for a GenericParam row.
	pub fn get_generic_param_typesig_by_rid(&'l self, ctx: &'l Context<'l>, rid: u32, by_ref: bool) -> RtResult<&'l TypeSig<'l>> {
		let generic_params = self.tables.get_table::<table::GenericParamTable>().ok_or(RtErr::BadImageFormat)?;
		let row = generic_params.get(rid as usize).ok_or(RtErr::BadImageFormat)?;
		let owner: MetadataToken = row.owner.into();
		let is_method = owner.kind() == MetadataTokenKind::MethodDef;
		let param = ctx.sig_pool().intern_param(
			encode_gid(self.id(), rid),
			self.get_string(row.name)?,
			row.number,
			is_method,
		);
		let sig = ctx.sig_pool().intern(TypeSig {
			element_type: match is_method {
				true => ElementType::MVar,
				false => ElementType::Var,
			},
			by_ref,
			data: TypeSigData::Param(param),
		});
		Ok(sig)
	}

	// ### Signature blob parsing ###

	/// Parses one Type production from a signature blob under the given
	/// formal-parameter scope.
	pub(crate) fn parse_type_sig(
		&'l self,
		ctx: &'l Context<'l>,
		stream: &mut Cursor<&[u8]>,
		gcc: GenericContainerContext<'l>,
	) -> RtResult<&'l TypeSig<'l>> {
		use crate::utilities::{read_compressed_i32, read_compressed_u32, FromByteStream};

		let pool = ctx.sig_pool();
		let tag = u8::read(stream, &())?;
		let element_type = ElementType::from_tag(tag).ok_or(RtErr::BadImageFormat)?;
		let sig = match element_type {
			ElementType::Void
			| ElementType::Boolean
			| ElementType::Char
			| ElementType::I1 | ElementType::U1
			| ElementType::I2 | ElementType::U2
			| ElementType::I4 | ElementType::U4
			| ElementType::I8 | ElementType::U8
			| ElementType::R4 | ElementType::R8
			| ElementType::String
			| ElementType::Object
			| ElementType::TypedByRef
			| ElementType::I | ElementType::U => pool.primitive(element_type),

			ElementType::Ptr => {
				let element = self.parse_type_sig(ctx, stream, gcc)?;
				pool.ptr_to(element)
			},
			ElementType::ByRef => {
				let element = self.parse_type_sig(ctx, stream, gcc)?;
				pool.by_ref_of(element)
			},
			ElementType::Pinned => {
				// Pinning only matters to a moving collector.
				self.parse_type_sig(ctx, stream, gcc)?
			},
			ElementType::CModReqd | ElementType::CModOpt => {
				let _modifier = TypeDefOrRef::read_compressed(stream)?;
				self.parse_type_sig(ctx, stream, gcc)?
			},
			ElementType::ValueType | ElementType::Class => {
				let coded = TypeDefOrRef::read_compressed(stream)?;
				let token: MetadataToken = coded.into();
				let gid = match token.kind() {
					MetadataTokenKind::TypeDef => encode_gid(self.id(), token.index() as u32),
					MetadataTokenKind::TypeRef => self.resolve_type_ref(ctx, token.index() as u32)?,
					_ => return Err(RtErr::BadImageFormat),
				};
				pool.type_def(element_type, gid, false)
			},
			ElementType::SZArray => {
				let element = self.parse_type_sig(ctx, stream, gcc)?;
				pool.szarray_of(element)
			},
			ElementType::Array => {
				let element = self.parse_type_sig(ctx, stream, gcc)?;
				let rank = read_compressed_u32(stream)?;
				if rank == 0 || rank > u8::MAX as u32 {
					return Err(RtErr::BadImageFormat);
				}
				let size_count = read_compressed_u32(stream)? as usize;
				let mut sizes = Vec::with_capacity(size_count);
				for _ in 0..size_count {
					sizes.push(read_compressed_u32(stream)?);
				}
				let bound_count = read_compressed_u32(stream)? as usize;
				let mut bounds = Vec::with_capacity(bound_count);
				for _ in 0..bound_count {
					bounds.push(read_compressed_i32(stream)?);
				}
				pool.array_of(element, rank as u8, &sizes, &bounds)
			},
			ElementType::GenericInst => {
				let base = self.parse_type_sig(ctx, stream, gcc)?;
				let TypeSigData::TypeDef(base_gid) = base.data else {
					return Err(RtErr::BadImageFormat);
				};
				let arg_count = read_compressed_u32(stream)? as usize;
				let mut args = Vec::with_capacity(arg_count);
				for _ in 0..arg_count {
					args.push(self.parse_type_sig(ctx, stream, gcc)?);
				}
				let inst = pool.intern_inst(&args);
				pool.generic_inst_of(base_gid, inst)
			},
			ElementType::Var | ElementType::MVar => {
				let number = read_compressed_u32(stream)?;
				let container = match element_type {
					ElementType::Var => gcc.class_container,
					_ => gcc.method_container,
				};
				let container = container.ok_or(RtErr::BadImageFormat)?;
				let param = container
					.params
					.get(number as usize)
					.copied()
					.ok_or(RtErr::BadImageFormat)?;
				pool.intern(TypeSig {
					element_type,
					by_ref: false,
					data: TypeSigData::Param(param),
				})
			},
			ElementType::FnPtr => {
				let parsed = self.parse_method_sig_from(ctx, stream, gcc)?;
				pool.fn_ptr_of(parsed.call_conv, parsed.return_type, &parsed.params)
			},
			_ => return Err(RtErr::BadImageFormat),
		};
		Ok(sig)
	}

	/// FieldSig: FIELD calling convention then one Type.
	pub fn read_field_sig(
		&'l self,
		ctx: &'l Context<'l>,
		blob: BlobIndex,
		gcc: GenericContainerContext<'l>,
	) -> RtResult<&'l TypeSig<'l>> {
		use crate::utilities::FromByteStream;
		let bytes = self.get_blob(blob)?;
		let mut stream = Cursor::new(bytes);
		let call_conv = CallingConvention::read(&mut stream, &())?;
		if call_conv.bits() & 0x0F != CallingConvention::FIELD.bits() {
			return Err(RtErr::BadImageFormat);
		}
		self.parse_type_sig(ctx, &mut stream, gcc)
	}

	/// MethodDefSig / MethodRefSig / PropertySig.
	pub fn read_method_sig(
		&'l self,
		ctx: &'l Context<'l>,
		blob: BlobIndex,
		gcc: GenericContainerContext<'l>,
	) -> RtResult<ParsedMethodSig<'l>> {
		let bytes = self.get_blob(blob)?;
		let mut stream = Cursor::new(bytes);
		self.parse_method_sig_from(ctx, &mut stream, gcc)
	}

	fn parse_method_sig_from(
		&'l self,
		ctx: &'l Context<'l>,
		stream: &mut Cursor<&[u8]>,
		gcc: GenericContainerContext<'l>,
	) -> RtResult<ParsedMethodSig<'l>> {
		use crate::utilities::{read_compressed_u32, FromByteStream};
		let call_conv = CallingConvention::read(stream, &())?;

		let generic_param_count = match call_conv.contains(CallingConvention::GENERIC) {
			true => read_compressed_u32(stream)?,
			false => 0,
		};
		let param_count = read_compressed_u32(stream)? as usize;
		let return_type = self.parse_type_sig(ctx, stream, gcc)?;

		let mut params = Vec::with_capacity(param_count);
		for _ in 0..param_count {
			params.push(self.parse_type_sig(ctx, stream, gcc)?);
		}

		Ok(ParsedMethodSig {
			call_conv,
			has_this: call_conv.contains(CallingConvention::HAS_THIS),
			generic_param_count,
			return_type,
			params,
		})
	}

	/// LocalVarSig: LOCAL_SIG, count, then the local types.
	pub fn read_locals_sig(
		&'l self,
		ctx: &'l Context<'l>,
		blob: BlobIndex,
		gcc: GenericContainerContext<'l>,
	) -> RtResult<Vec<&'l TypeSig<'l>>> {
		use crate::utilities::{read_compressed_u32, FromByteStream};
		let bytes = self.get_blob(blob)?;
		let mut stream = Cursor::new(bytes);
		let call_conv = CallingConvention::read(&mut stream, &())?;
		if call_conv.bits() & 0x0F != CallingConvention::LOCAL_SIG.bits() {
			return Err(RtErr::BadImageFormat);
		}
		let count = read_compressed_u32(&mut stream)? as usize;
		let mut locals = Vec::with_capacity(count);
		for _ in 0..count {
			locals.push(self.parse_type_sig(ctx, &mut stream, gcc)?);
		}
		Ok(locals)
	}

	// ### Member queries ###

	pub fn get_method_by_rid(&'l self, ctx: &'l Context<'l>, rid: u32) -> RtResult<&'l RtMethod<'l>> {
		let owner_rid = self.type_def_rid_of_method(rid)?;
		let class = self.get_class_by_type_def_rid(ctx, owner_rid)?;
		crate::metadata::class::initialize_methods(ctx, class)?;
		let start = self.method_rid_range(owner_rid)?.start;
		class
			.methods()
			.get((rid - start) as usize)
			.copied()
			.ok_or(RtErr::MissingMethod)
	}

	pub fn get_field_by_rid(&'l self, ctx: &'l Context<'l>, rid: u32) -> RtResult<&'l crate::metadata::class::RtField<'l>> {
		let owner_rid = self.type_def_rid_of_field(rid)?;
		let class = self.get_class_by_type_def_rid(ctx, owner_rid)?;
		crate::metadata::class::initialize_fields(ctx, class)?;
		let start = self.field_rid_range(owner_rid)?.start;
		class
			.fields()
			.get((rid - start) as usize)
			.ok_or(RtErr::MissingField)
	}

	/// Resolves a method token of any flavor (MethodDef, MemberRef,
	/// MethodSpec) under a generic context.
	pub fn get_method_by_token(
		&'l self,
		ctx: &'l Context<'l>,
		token: MetadataToken,
		gcc: GenericContainerContext<'l>,
		gctx: Option<&GenericContext<'l>>,
	) -> RtResult<&'l RtMethod<'l>> {
		match token.kind() {
			MetadataTokenKind::MethodDef => self.get_method_by_rid(ctx, token.index() as u32),
			MetadataTokenKind::MemberRef => match self.get_member_ref_by_rid(ctx, token.index() as u32, gcc, gctx)? {
				RuntimeHandle::Method(method) => Ok(method),
				_ => Err(RtErr::MissingMethod),
			},
			MetadataTokenKind::MethodSpec => {
				let specs = self.tables.get_table::<table::MethodSpecTable>().ok_or(RtErr::BadImageFormat)?;
				let row = specs.get(token.index()).ok_or(RtErr::BadImageFormat)?;
				let base = self.get_method_by_token(ctx, row.method.into(), gcc, gctx)?;

				use crate::utilities::{read_compressed_u32, FromByteStream};
				let bytes = self.get_blob(row.instantiation)?;
				let mut stream = Cursor::new(bytes);
				let call_conv = CallingConvention::read(&mut stream, &())?;
				if call_conv.bits() & 0x0F != CallingConvention::GENERIC_INST.bits() {
					return Err(RtErr::BadImageFormat);
				}
				let count = read_compressed_u32(&mut stream)? as usize;
				let mut args = Vec::with_capacity(count);
				for _ in 0..count {
					args.push(self.parse_type_sig(ctx, &mut stream, gcc)?);
				}
				let mut inst = ctx.sig_pool().intern_inst(&args);
				if let Some(gctx) = gctx {
					inst = crate::metadata::generics::inflate_inst(ctx.sig_pool(), inst, gctx)?;
				}
				crate::metadata::method::get_inflated_method(ctx, base, inst)
			},
			_ => Err(RtErr::BadImageFormat),
		}
	}

	pub fn get_field_by_token(
		&'l self,
		ctx: &'l Context<'l>,
		token: MetadataToken,
		gcc: GenericContainerContext<'l>,
		gctx: Option<&GenericContext<'l>>,
	) -> RtResult<&'l crate::metadata::class::RtField<'l>> {
		match token.kind() {
			MetadataTokenKind::Field => self.get_field_by_rid(ctx, token.index() as u32),
			MetadataTokenKind::MemberRef => match self.get_member_ref_by_rid(ctx, token.index() as u32, gcc, gctx)? {
				RuntimeHandle::Field(field) => Ok(field),
				_ => Err(RtErr::MissingField),
			},
			_ => Err(RtErr::BadImageFormat),
		}
	}

	/// Resolves a MemberRef row into a tagged handle: a method or field
	/// on the parent class, or the parent type itself when the name is
	/// absent (used by some custom-attribute encodings).
	pub fn get_member_ref_by_rid(
		&'l self,
		ctx: &'l Context<'l>,
		rid: u32,
		gcc: GenericContainerContext<'l>,
		gctx: Option<&GenericContext<'l>>,
	) -> RtResult<RuntimeHandle<'l>> {
		let member_refs = self.tables.get_table::<table::MemberRefTable>().ok_or(RtErr::BadImageFormat)?;
		let row = member_refs.get(rid as usize).ok_or(RtErr::BadImageFormat)?;
		let name = self.get_string(row.name)?;

		let parent_class = self.member_ref_parent_class(ctx, row.class, gcc, gctx)?;
		crate::metadata::class::initialize_all(ctx, parent_class)?;

		let blob = self.get_blob(row.signature)?;
		if blob.first().copied() == Some(CallingConvention::FIELD.bits()) {
			let field = crate::metadata::class::find_field_by_name(parent_class, name, true)
				.ok_or(RtErr::MissingField)?;
			return Ok(RuntimeHandle::Field(field));
		}

		let mut parsed = self.read_method_sig(ctx, row.signature, gcc)?;
		if let Some(gctx) = gctx {
			parsed.return_type = crate::metadata::generics::inflate_type_sig(ctx.sig_pool(), parsed.return_type, gctx)?;
			for param in parsed.params.iter_mut() {
				*param = crate::metadata::generics::inflate_type_sig(ctx.sig_pool(), *param, gctx)?;
			}
		}

		let method = crate::metadata::method::find_method_by_name_and_sig(ctx, parent_class, name, &parsed)?
			.ok_or(RtErr::MissingMethod)?;
		Ok(RuntimeHandle::Method(method))
	}

	fn member_ref_parent_class(
		&'l self,
		ctx: &'l Context<'l>,
		parent: MemberRefParent,
		gcc: GenericContainerContext<'l>,
		gctx: Option<&GenericContext<'l>>,
	) -> RtResult<&'l RtClass<'l>> {
		let token: MetadataToken = parent.into();
		match token.kind() {
			MetadataTokenKind::TypeDef => self.get_class_by_type_def_rid(ctx, token.index() as u32),
			MetadataTokenKind::TypeRef | MetadataTokenKind::TypeSpec => {
				let mut sig = self.get_typesig_by_token(ctx, token, gcc)?;
				if let Some(gctx) = gctx {
					sig = crate::metadata::generics::inflate_type_sig(ctx.sig_pool(), sig, gctx)?;
				}
				crate::metadata::class::class_from_type_sig(ctx, sig)
			},
			// Vararg call sites can hang member refs off a MethodDef.
			MetadataTokenKind::MethodDef => {
				let method = self.get_method_by_rid(ctx, token.index() as u32)?;
				Ok(method.parent())
			},
			_ => Err(RtErr::BadImageFormat),
		}
	}
}

impl<'l> Module<'l> {
	/// Name-only custom-attribute presence test, used where materializing
	/// the attribute class would be circular (thread-statics, intrinsics).
	pub(crate) fn has_custom_attribute_named(&self, target_token: u32, namespace: &str, name: &str) -> bool {
		let Some(attributes) = self.tables.get_table::<table::CustomAttributeTable>() else {
			return false;
		};
		let Ok(token) = MetadataToken::try_from(target_token) else {
			return false;
		};
		let Some(coded) = crate::raw::indices::coded_index::HasCustomAttribute::encode(token) else {
			return false;
		};
		let range = equal_range_by_key(attributes.rows(), coded.raw() as usize, |r| r.parent.raw() as usize);
		for rid in range {
			let Some(row) = attributes.get(rid) else {
				continue;
			};
			if self
				.attribute_ctor_type_name(row.ty.into())
				.map(|(ns, n)| ns == namespace && n == name)
				.unwrap_or(false)
			{
				return true;
			}
		}
		false
	}

	/// Namespace/name of the type declaring an attribute constructor.
	pub(crate) fn attribute_ctor_type_name(&self, ctor: MetadataToken) -> Option<(&'l str, &'l str)> {
		match ctor.kind() {
			MetadataTokenKind::MethodDef => {
				let type_rid = self.type_def_rid_of_method(ctor.index() as u32).ok()?;
				let row = self.type_def_row(type_rid).ok()?;
				Some((self.strings.get(row.type_namespace)?, self.strings.get(row.type_name)?))
			},
			MetadataTokenKind::MemberRef => {
				let member_refs = self.tables.get_table::<table::MemberRefTable>()?;
				let row = member_refs.get(ctor.index())?;
				let parent: MetadataToken = row.class.into();
				self.type_name_of_token(parent).ok()
			},
			_ => None,
		}
	}
}

fn trim_module_extension(name: &str) -> &str {
	name.strip_suffix(".dll")
		.or_else(|| name.strip_suffix(".exe"))
		.unwrap_or(name)
}

fn split_full_name(full_name: &str) -> (&str, &str) {
	match full_name.rfind('.') {
		Some(dot) => (&full_name[..dot], &full_name[dot + 1..]),
		None => ("", full_name),
	}
}

fn corlib_primitive_element_type(name: &str) -> Option<ElementType> {
	Some(match name {
		"Void" => ElementType::Void,
		"Boolean" => ElementType::Boolean,
		"Char" => ElementType::Char,
		"SByte" => ElementType::I1,
		"Byte" => ElementType::U1,
		"Int16" => ElementType::I2,
		"UInt16" => ElementType::U2,
		"Int32" => ElementType::I4,
		"UInt32" => ElementType::U4,
		"Int64" => ElementType::I8,
		"UInt64" => ElementType::U8,
		"Single" => ElementType::R4,
		"Double" => ElementType::R8,
		"String" => ElementType::String,
		"IntPtr" => ElementType::I,
		"UIntPtr" => ElementType::U,
		"Object" => ElementType::Object,
		"TypedReference" => ElementType::TypedByRef,
		_ => return None,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn full_name_splitting() {
		assert_eq!(split_full_name("System.Collections.ArrayList"), ("System.Collections", "ArrayList"));
		assert_eq!(split_full_name("Program"), ("", "Program"));
	}

	#[test]
	fn module_extension_trimming() {
		assert_eq!(trim_module_extension("mscorlib.dll"), "mscorlib");
		assert_eq!(trim_module_extension("app.exe"), "app");
		assert_eq!(trim_module_extension("plain"), "plain");
	}

	#[test]
	fn corlib_primitive_map() {
		assert_eq!(corlib_primitive_element_type("Int32"), Some(ElementType::I4));
		assert_eq!(corlib_primitive_element_type("Object"), Some(ElementType::Object));
		assert_eq!(corlib_primitive_element_type("Decimal"), None);
	}
}
