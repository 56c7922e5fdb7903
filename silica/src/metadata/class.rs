use std::cell::Cell;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use derivative::Derivative;
use fxhash::FxHashSet;
use tracing::trace;

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::generics::{
	inflate_type_sig, GenericContainer, GenericContainerContext, GenericContext,
};
use crate::metadata::layout::{self, PTR_ALIGN, PTR_SIZE};
use crate::metadata::method::{
	self, build_method_arg_descs, InvokerType, RtMethod, INVALID_SLOT,
};
use crate::metadata::module::Module;
use crate::metadata::typesig::{
	decode_gid_module, decode_gid_rid, ElementType, GenericInstSig, TypeDefGid, TypeSig,
	TypeSigData,
};
use crate::raw::heaps::table::{
	self, equal_range_by_key, EventAttributes, FieldAttributes, MethodSemanticsAttributes,
	PropertyAttributes, Table, TypeAttributes,
};
use crate::raw::indices::coded_index::HasSemantics;
use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};

bitflags! {
	/// Lazily built parts of a class. A set bit means the part has been
	/// (or is being) built; the guard-before-build discipline doubles as
	/// the reentrancy check during cyclic materialization.
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct ClassInitPart: u32 {
		const SUPER_TYPES = 1 << 0;
		const INTERFACES = 1 << 1;
		const NESTED_CLASSES = 1 << 2;
		const FIELDS = 1 << 3;
		const METHODS = 1 << 4;
		const PROPERTIES = 1 << 5;
		const EVENTS = 1 << 6;
		const VTABLE = 1 << 7;
		const ALL = 1 << 8;
		/// Set once the user-visible static constructor has finished;
		/// owned by the execution engine.
		const RUNTIME_CLASS_INIT = 1 << 9;
	}
}

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub struct ClassExtraFlags: u32 {
		const VALUE_TYPE = 1 << 0;
		const REFERENCE_TYPE = 1 << 1;
		const ENUM = 1 << 2;
		const NULLABLE = 1 << 3;
		const HAS_REFERENCES = 1 << 4;
		const ARRAY_OR_SZARRAY = 1 << 5;
		const HAS_STATIC_CONSTRUCTOR = 1 << 6;
		const HAS_FINALIZER = 1 << 7;
		const GENERIC = 1 << 8;
	}
}

/// Initialization strategy, derived from the by-value element type.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClassFamily {
	TypeDef,
	GenericInst,
	ArrayOrSZArray,
	GenericParam,
	TypeOrFnPtr,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct RtField<'l> {
	#[derivative(Debug = "ignore")]
	pub(crate) parent: Cell<Option<&'l RtClass<'l>>>,
	pub name: &'l str,
	/// Raw Field token; 0 for inflated copies.
	pub token: u32,
	pub flags: FieldAttributes,
	pub type_sig: &'l TypeSig<'l>,
	pub offset: Cell<u32>,
	pub(crate) thread_static: Cell<bool>,
}

impl<'l> RtField<'l> {
	#[inline]
	pub fn parent(&self) -> &'l RtClass<'l> {
		self.parent.get().expect("field not attached to a class")
	}

	#[inline]
	pub fn is_static(&self) -> bool {
		self.flags.contains(FieldAttributes::STATIC)
	}

	#[inline]
	pub fn is_instance(&self) -> bool {
		!self.is_static()
	}

	#[inline]
	pub fn is_literal(&self) -> bool {
		self.flags.contains(FieldAttributes::LITERAL)
	}

	#[inline]
	pub fn has_rva(&self) -> bool {
		self.flags.contains(FieldAttributes::HAS_FIELD_RVA)
	}

	/// Static fields that own a slot in the class's static block;
	/// literals and RVA-backed fields get their bytes elsewhere.
	#[inline]
	pub fn is_static_in_block(&self) -> bool {
		self.is_static() && !self.is_literal() && !self.has_rva()
	}

	#[inline]
	pub fn is_thread_static(&self) -> bool {
		self.thread_static.get()
	}

	/// Offset relative to the object header for reference-type parents.
	#[inline]
	pub fn offset_with_header(&self) -> u32 {
		self.offset.get() + crate::vm::object::OBJECT_HEADER_SIZE as u32
	}
}

#[derive(Debug)]
pub struct RtProperty<'l> {
	pub name: &'l str,
	pub token: u32,
	pub flags: PropertyAttributes,
	pub return_type: &'l TypeSig<'l>,
	pub params: &'l [&'l TypeSig<'l>],
	pub get_method: Cell<Option<&'l RtMethod<'l>>>,
	pub set_method: Cell<Option<&'l RtMethod<'l>>>,
}

#[derive(Debug)]
pub struct RtEvent<'l> {
	pub name: &'l str,
	pub token: u32,
	pub flags: EventAttributes,
	pub type_sig: &'l TypeSig<'l>,
	pub add_method: Cell<Option<&'l RtMethod<'l>>>,
	pub remove_method: Cell<Option<&'l RtMethod<'l>>>,
	pub raise_method: Cell<Option<&'l RtMethod<'l>>>,
}

/// One vtable slot: the declaring method and the implementation that a
/// virtual call through this slot dispatches to.
#[derive(Debug, Copy, Clone)]
pub struct VirtualInvokeData<'l> {
	pub method: &'l RtMethod<'l>,
	pub method_impl: Option<&'l RtMethod<'l>>,
}

#[derive(Debug, Copy, Clone)]
pub struct InterfaceOffset<'l> {
	pub interface: &'l RtClass<'l>,
	pub offset: u16,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct RtClass<'l> {
	#[derivative(Debug = "ignore")]
	module: &'l Module<'l>,
	/// Raw TypeDef token; 0 for synthetic (array, pointer, generic
	/// parameter) classes.
	pub token: u32,
	pub name: &'l str,
	pub namespace: &'l str,
	pub flags: TypeAttributes,
	extra: Cell<ClassExtraFlags>,
	init: Cell<ClassInitPart>,

	#[derivative(Debug = "ignore")]
	parent: Cell<Option<&'l RtClass<'l>>>,
	#[derivative(Debug = "ignore")]
	declaring_class: Cell<Option<&'l RtClass<'l>>>,
	/// None means "self". Enums store their underlying type, arrays and
	/// pointers their element, nullables the wrapped value type.
	#[derivative(Debug = "ignore")]
	element_class: Cell<Option<&'l RtClass<'l>>>,
	#[derivative(Debug = "ignore")]
	cast_class: Cell<Option<&'l RtClass<'l>>>,

	pub by_val: &'l TypeSig<'l>,
	pub by_ref: &'l TypeSig<'l>,
	#[derivative(Debug = "ignore")]
	generic_container: Option<&'l GenericContainer<'l>>,

	hierarchy_depth: Cell<u32>,
	#[derivative(Debug = "ignore")]
	super_types: Cell<&'l [&'l RtClass<'l>]>,
	#[derivative(Debug = "ignore")]
	interfaces: Cell<&'l [&'l RtClass<'l>]>,
	#[derivative(Debug = "ignore")]
	nested_classes: Cell<&'l [&'l RtClass<'l>]>,
	#[derivative(Debug = "ignore")]
	fields: Cell<&'l [RtField<'l>]>,
	#[derivative(Debug = "ignore")]
	methods: Cell<&'l [&'l RtMethod<'l>]>,
	#[derivative(Debug = "ignore")]
	properties: Cell<&'l [RtProperty<'l>]>,
	#[derivative(Debug = "ignore")]
	events: Cell<&'l [RtEvent<'l>]>,
	#[derivative(Debug = "ignore")]
	vtable: Cell<&'l [VirtualInvokeData<'l>]>,
	#[derivative(Debug = "ignore")]
	interface_offsets: Cell<&'l [InterfaceOffset<'l>]>,

	instance_size: Cell<u32>,
	alignment: Cell<u32>,
	static_size: Cell<u32>,
	#[derivative(Debug = "ignore")]
	static_data: Cell<*mut u8>,
}

impl Display for RtClass<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self.namespace {
			"" => write!(f, "{}", self.name),
			_ => write!(f, "{}.{}", self.namespace, self.name),
		}
	}
}

impl Eq for RtClass<'_> {}

impl PartialEq<Self> for RtClass<'_> {
	#[inline]
	fn eq(&self, other: &Self) -> bool {
		std::ptr::eq(self, other)
	}
}

impl Hash for RtClass<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(self as *const Self as usize).hash(state)
	}
}

impl<'l> RtClass<'l> {
	#[inline]
	pub fn module(&self) -> &'l Module<'l> {
		self.module
	}

	#[inline]
	pub fn parent(&self) -> Option<&'l RtClass<'l>> {
		self.parent.get()
	}

	#[inline]
	pub fn declaring_class(&self) -> Option<&'l RtClass<'l>> {
		self.declaring_class.get()
	}

	#[inline]
	pub fn element_class(&'l self) -> &'l RtClass<'l> {
		self.element_class.get().unwrap_or(self)
	}

	#[inline]
	pub fn generic_container(&self) -> Option<&'l GenericContainer<'l>> {
		self.generic_container
	}

	/// The instantiation vector when this is a constructed generic.
	pub fn generic_class_inst(&self) -> Option<&'l GenericInstSig<'l>> {
		match &self.by_val.data {
			TypeSigData::Generic(g) => Some(g.class_inst),
			_ => None,
		}
	}

	pub fn generic_container_context(&self) -> GenericContainerContext<'l> {
		GenericContainerContext {
			class_container: self.generic_container,
			method_container: None,
		}
	}

	pub fn generic_context(&self) -> GenericContext<'l> {
		GenericContext {
			class_inst: self.generic_class_inst(),
			method_inst: None,
		}
	}

	#[inline]
	fn has_extra(&self, flag: ClassExtraFlags) -> bool {
		self.extra.get().contains(flag)
	}

	fn add_extra(&self, flag: ClassExtraFlags) {
		self.extra.set(self.extra.get() | flag);
	}

	#[inline]
	pub fn is_value_type(&self) -> bool {
		self.has_extra(ClassExtraFlags::VALUE_TYPE)
	}

	#[inline]
	pub fn is_reference_type(&self) -> bool {
		self.has_extra(ClassExtraFlags::REFERENCE_TYPE)
	}

	#[inline]
	pub fn is_enum(&self) -> bool {
		self.has_extra(ClassExtraFlags::ENUM)
	}

	#[inline]
	pub fn is_nullable(&self) -> bool {
		self.has_extra(ClassExtraFlags::NULLABLE)
	}

	#[inline]
	pub fn has_references(&self) -> bool {
		self.has_extra(ClassExtraFlags::HAS_REFERENCES)
	}

	#[inline]
	pub fn is_array_or_szarray(&self) -> bool {
		self.has_extra(ClassExtraFlags::ARRAY_OR_SZARRAY)
	}

	#[inline]
	pub fn has_static_constructor(&self) -> bool {
		self.has_extra(ClassExtraFlags::HAS_STATIC_CONSTRUCTOR)
	}

	#[inline]
	pub fn has_finalizer(&self) -> bool {
		self.has_extra(ClassExtraFlags::HAS_FINALIZER)
	}

	#[inline]
	pub fn is_generic(&self) -> bool {
		self.has_extra(ClassExtraFlags::GENERIC)
	}

	#[inline]
	pub fn is_interface(&self) -> bool {
		self.flags.contains(TypeAttributes::INTERFACE)
	}

	#[inline]
	pub fn is_abstract(&self) -> bool {
		self.flags.contains(TypeAttributes::ABSTRACT)
	}

	#[inline]
	pub fn is_sealed(&self) -> bool {
		self.flags.contains(TypeAttributes::SEALED)
	}

	#[inline]
	pub fn is_explicit_layout(&self) -> bool {
		self.flags.contains(TypeAttributes::EXPLICIT_LAYOUT)
	}

	#[inline]
	pub fn is_szarray(&self) -> bool {
		self.by_val.element_type == ElementType::SZArray
	}

	pub fn rank(&self) -> u8 {
		match (&self.by_val.element_type, &self.by_val.data) {
			(ElementType::SZArray, _) => 1,
			(ElementType::Array, TypeSigData::Array(a)) => a.rank,
			_ => 0,
		}
	}

	pub fn family(&self) -> ClassFamily {
		match self.by_val.element_type {
			ElementType::GenericInst => ClassFamily::GenericInst,
			ElementType::Array | ElementType::SZArray => ClassFamily::ArrayOrSZArray,
			ElementType::Var | ElementType::MVar => ClassFamily::GenericParam,
			ElementType::Ptr | ElementType::FnPtr => ClassFamily::TypeOrFnPtr,
			_ => ClassFamily::TypeDef,
		}
	}

	#[inline]
	pub fn hierarchy_depth(&self) -> u32 {
		self.hierarchy_depth.get()
	}

	#[inline]
	pub fn super_types(&self) -> &'l [&'l RtClass<'l>] {
		self.super_types.get()
	}

	#[inline]
	pub fn interfaces(&self) -> &'l [&'l RtClass<'l>] {
		self.interfaces.get()
	}

	#[inline]
	pub fn nested_classes(&self) -> &'l [&'l RtClass<'l>] {
		self.nested_classes.get()
	}

	#[inline]
	pub fn fields(&self) -> &'l [RtField<'l>] {
		self.fields.get()
	}

	#[inline]
	pub fn methods(&self) -> &'l [&'l RtMethod<'l>] {
		self.methods.get()
	}

	#[inline]
	pub fn properties(&self) -> &'l [RtProperty<'l>] {
		self.properties.get()
	}

	#[inline]
	pub fn events(&self) -> &'l [RtEvent<'l>] {
		self.events.get()
	}

	#[inline]
	pub fn vtable(&self) -> &'l [VirtualInvokeData<'l>] {
		self.vtable.get()
	}

	#[inline]
	pub fn interface_offsets(&self) -> &'l [InterfaceOffset<'l>] {
		self.interface_offsets.get()
	}

	pub fn interface_offset(&self, interface: &'l RtClass<'l>) -> Option<u16> {
		self.interface_offsets
			.get()
			.iter()
			.find(|o| std::ptr::eq(o.interface, interface))
			.map(|o| o.offset)
	}

	/// Instance byte size without the object header.
	#[inline]
	pub fn instance_size(&self) -> u32 {
		self.instance_size.get()
	}

	#[inline]
	pub fn alignment(&self) -> u32 {
		self.alignment.get()
	}

	#[inline]
	pub fn static_size(&self) -> u32 {
		self.static_size.get()
	}

	#[inline]
	pub fn static_data(&self) -> *mut u8 {
		self.static_data.get()
	}

	#[inline]
	pub fn has_initialized_part(&self, part: ClassInitPart) -> bool {
		self.init.get().contains(part)
	}

	fn try_set_initialized_part(&self, part: ClassInitPart) -> bool {
		let current = self.init.get();
		match current.contains(part) {
			true => false,
			false => {
				self.init.set(current | part);
				true
			},
		}
	}

	/// True until the execution engine marks the user cctor finished.
	#[inline]
	pub fn is_cctor_not_finished(&self) -> bool {
		!self.has_initialized_part(ClassInitPart::RUNTIME_CLASS_INIT)
	}

	pub fn set_cctor_finished(&self) {
		self.init.set(self.init.get() | ClassInitPart::RUNTIME_CLASS_INIT);
	}

	/// Canonical representative for identity-based compatibility between
	/// value-type siblings: unsigned variants collapse onto the signed
	/// one, char onto short, enums onto their underlying type. Pointer
	/// classes deliberately pin to themselves.
	pub fn cast_class(&'l self, ctx: &'l Context<'l>) -> RtResult<&'l RtClass<'l>> {
		if let Some(cast) = self.cast_class.get() {
			return Ok(cast);
		}
		let cast = match self.by_val.element_type {
			ElementType::Boolean | ElementType::U1 | ElementType::I1 => ctx.corlib_types()?.cls_sbyte,
			ElementType::Char | ElementType::U2 | ElementType::I2 => ctx.corlib_types()?.cls_int16,
			ElementType::U4 | ElementType::I4 => ctx.corlib_types()?.cls_int32,
			ElementType::U8 | ElementType::I8 => ctx.corlib_types()?.cls_int64,
			ElementType::U | ElementType::I => ctx.corlib_types()?.cls_intptr,
			ElementType::ValueType if self.is_enum() => self.element_class().cast_class(ctx)?,
			_ => self,
		};
		self.cast_class.set(Some(cast));
		Ok(cast)
	}
}

// ### Class record construction ###

fn alloc_class<'l>(
	module: &'l Module<'l>,
	token: u32,
	name: &'l str,
	namespace: &'l str,
	flags: TypeAttributes,
	by_val: &'l TypeSig<'l>,
	by_ref: &'l TypeSig<'l>,
	generic_container: Option<&'l GenericContainer<'l>>,
) -> &'l RtClass<'l> {
	module.arena().alloc(RtClass {
		module,
		token,
		name,
		namespace,
		flags,
		extra: Cell::new(ClassExtraFlags::empty()),
		init: Cell::new(ClassInitPart::empty()),
		parent: Cell::new(None),
		declaring_class: Cell::new(None),
		element_class: Cell::new(None),
		cast_class: Cell::new(None),
		by_val,
		by_ref,
		generic_container,
		hierarchy_depth: Cell::new(0),
		super_types: Cell::new(&[]),
		interfaces: Cell::new(&[]),
		nested_classes: Cell::new(&[]),
		fields: Cell::new(&[]),
		methods: Cell::new(&[]),
		properties: Cell::new(&[]),
		events: Cell::new(&[]),
		vtable: Cell::new(&[]),
		interface_offsets: Cell::new(&[]),
		instance_size: Cell::new(0),
		alignment: Cell::new(1),
		static_size: Cell::new(0),
		static_data: Cell::new(std::ptr::null_mut()),
	})
}

fn is_value_type_element(element_type: ElementType) -> bool {
	matches!(
		element_type,
		ElementType::Boolean
			| ElementType::Char
			| ElementType::I1 | ElementType::U1
			| ElementType::I2 | ElementType::U2
			| ElementType::I4 | ElementType::U4
			| ElementType::I8 | ElementType::U8
			| ElementType::R4 | ElementType::R8
			| ElementType::I | ElementType::U
			| ElementType::ValueType
			| ElementType::TypedByRef
	)
}

/// Builds the shallow `RtClass` record for a typedef row. Parts are
/// materialized lazily afterwards.
pub(crate) fn new_type_def_class<'l>(
	ctx: &'l Context<'l>,
	module: &'l Module<'l>,
	rid: u32,
) -> RtResult<&'l RtClass<'l>> {
	let row = module.type_def_row(rid)?;
	let name = module.get_string(row.type_name)?;
	let namespace = module.get_string(row.type_namespace)?;
	let token = MetadataToken::new(MetadataTokenKind::TypeDef, rid as usize).raw();

	let generic_container = module.get_generic_container(ctx, token)?;
	let by_val = module.get_type_def_sig(ctx, rid, false)?;
	let by_ref = module.get_type_def_sig(ctx, rid, true)?;

	let class = alloc_class(module, token, name, namespace, row.flags, by_val, by_ref, generic_container);
	trace!(class = %class, "materializing typedef class");

	if generic_container.is_some() {
		class.add_extra(ClassExtraFlags::GENERIC);
	}

	// The record must be visible before parent resolution; mutual
	// references between a class and its own generic arguments would
	// otherwise rebuild it forever.
	module.cache_class(rid, class);

	let gcc = class.generic_container_context();
	if !row.extends.is_null() {
		let parent_sig = module.get_typesig_by_coded_index(ctx, row.extends, gcc)?;
		class.parent.set(Some(class_from_type_sig(ctx, parent_sig)?));
	}

	if let Some(enclosing_rid) = module.enclosing_type_def_rid(rid) {
		class.declaring_class.set(Some(module.get_class_by_type_def_rid(ctx, enclosing_rid)?));
	}

	match is_value_type_element(by_val.element_type) {
		true => class.add_extra(ClassExtraFlags::VALUE_TYPE),
		false => class.add_extra(ClassExtraFlags::REFERENCE_TYPE),
	}

	let is_enum = class
		.parent()
		.map(|p| p.name == "Enum" && p.namespace == "System" && p.module().is_corlib())
		.unwrap_or(false);
	if is_enum {
		class.add_extra(ClassExtraFlags::ENUM);
		// The underlying type is the single instance field's type.
		let field_range = module.field_rid_range(rid)?;
		let field_table = module
			.tables()
			.get_table::<table::FieldTable>()
			.ok_or(RtErr::BadImageFormat)?;
		let mut underlying = None;
		for field_rid in field_range {
			let field_row = field_table.get(field_rid as usize).ok_or(RtErr::BadImageFormat)?;
			if !field_row.flags.contains(FieldAttributes::STATIC) {
				let sig = module.read_field_sig(ctx, field_row.signature, gcc)?;
				underlying = Some(class_from_type_sig(ctx, sig)?);
				break;
			}
		}
		class.element_class.set(Some(underlying.ok_or(RtErr::BadImageFormat)?));
	}

	Ok(class)
}

/// Resolves any interned typesig to its runtime class, synthesizing
/// array, pointer and generic-parameter classes on demand.
pub fn class_from_type_sig<'l>(ctx: &'l Context<'l>, sig: &'l TypeSig<'l>) -> RtResult<&'l RtClass<'l>> {
	match sig.element_type {
		ElementType::Void => Ok(ctx.corlib_types()?.cls_void),
		ElementType::Boolean => named_or_known(ctx, sig, |t| t.cls_boolean),
		ElementType::Char => named_or_known(ctx, sig, |t| t.cls_char),
		ElementType::I1 => named_or_known(ctx, sig, |t| t.cls_sbyte),
		ElementType::U1 => named_or_known(ctx, sig, |t| t.cls_byte),
		ElementType::I2 => named_or_known(ctx, sig, |t| t.cls_int16),
		ElementType::U2 => named_or_known(ctx, sig, |t| t.cls_uint16),
		ElementType::I4 => named_or_known(ctx, sig, |t| t.cls_int32),
		ElementType::U4 => named_or_known(ctx, sig, |t| t.cls_uint32),
		ElementType::I8 => named_or_known(ctx, sig, |t| t.cls_int64),
		ElementType::U8 => named_or_known(ctx, sig, |t| t.cls_uint64),
		ElementType::R4 => named_or_known(ctx, sig, |t| t.cls_single),
		ElementType::R8 => named_or_known(ctx, sig, |t| t.cls_double),
		ElementType::String => named_or_known(ctx, sig, |t| t.cls_string),
		ElementType::Object => named_or_known(ctx, sig, |t| t.cls_object),
		ElementType::I => named_or_known(ctx, sig, |t| t.cls_intptr),
		ElementType::U => named_or_known(ctx, sig, |t| t.cls_uintptr),
		ElementType::TypedByRef => named_or_known(ctx, sig, |t| t.cls_typedreference),
		ElementType::ValueType | ElementType::Class => match sig.data {
			TypeSigData::TypeDef(gid) => class_by_gid(ctx, gid),
			_ => Err(RtErr::BadImageFormat),
		},
		ElementType::Ptr => get_ptr_class(ctx, sig.element_sig()?),
		ElementType::SZArray => get_szarray_class_from_element_sig(ctx, sig.element_sig()?),
		ElementType::Array => match &sig.data {
			TypeSigData::Array(a) => get_array_class_from_element_sig(ctx, a.element, a.rank),
			_ => Err(RtErr::BadImageFormat),
		},
		ElementType::GenericInst => {
			let generic = sig.generic_class()?;
			get_generic_class(ctx, generic.base_gid, generic.class_inst)
		},
		ElementType::Var | ElementType::MVar => match &sig.data {
			TypeSigData::Param(param) => get_generic_param_class(ctx, sig, *param),
			_ => Err(RtErr::BadImageFormat),
		},
		ElementType::FnPtr => Err(RtErr::NotImplemented),
		ElementType::ByRef => Err(RtErr::ExecutionEngine),
		_ => Err(RtErr::BadImageFormat),
	}
}

/// Primitive sigs parsed from blobs carry no typedef row; those resolve
/// through the well-known table. Sigs minted from typedef rows keep
/// their row identity.
fn named_or_known<'l>(
	ctx: &'l Context<'l>,
	sig: &'l TypeSig<'l>,
	pick: impl Fn(&crate::vm::runtime::CorlibTypes<'l>) -> &'l RtClass<'l>,
) -> RtResult<&'l RtClass<'l>> {
	match sig.data {
		TypeSigData::TypeDef(gid) => class_by_gid(ctx, gid),
		_ => Ok(pick(ctx.corlib_types()?)),
	}
}

pub(crate) fn class_by_gid<'l>(ctx: &'l Context<'l>, gid: TypeDefGid) -> RtResult<&'l RtClass<'l>> {
	let module = ctx.module_by_id(decode_gid_module(gid)).ok_or(RtErr::ExecutionEngine)?;
	module.get_class_by_type_def_rid(ctx, decode_gid_rid(gid))
}

/// Base (open) class of a constructed generic signature.
pub(crate) fn generic_base_class<'l>(ctx: &'l Context<'l>, sig: &'l TypeSig<'l>) -> RtResult<&'l RtClass<'l>> {
	class_by_gid(ctx, sig.generic_class()?.base_gid)
}

// ### Synthetic classes ###

fn arena_name<'l>(module: &'l Module<'l>, base: &str, suffix: &str) -> &'l str {
	module.arena().alloc_str(&format!("{base}{suffix}"))
}

pub fn get_szarray_class_from_element_class<'l>(
	ctx: &'l Context<'l>,
	element: &'l RtClass<'l>,
) -> RtResult<&'l RtClass<'l>> {
	get_szarray_class_from_element_sig(ctx, element.by_val)
}

pub fn get_szarray_class_from_element_sig<'l>(
	ctx: &'l Context<'l>,
	element_sig: &'l TypeSig<'l>,
) -> RtResult<&'l RtClass<'l>> {
	let key = element_sig as *const _ as usize;
	if let Some(class) = ctx.cached_szarray_class(key) {
		return Ok(class);
	}
	let class = new_array_class(ctx, element_sig, 1, true)?;
	ctx.insert_szarray_class(key, class);
	Ok(class)
}

pub fn get_array_class_from_element_sig<'l>(
	ctx: &'l Context<'l>,
	element_sig: &'l TypeSig<'l>,
	rank: u8,
) -> RtResult<&'l RtClass<'l>> {
	let key = element_sig as *const _ as usize;
	if let Some(class) = ctx.cached_array_class(key, rank) {
		return Ok(class);
	}
	let class = new_array_class(ctx, element_sig, rank, false)?;
	ctx.insert_array_class(key, rank, class);
	Ok(class)
}

fn new_array_class<'l>(
	ctx: &'l Context<'l>,
	element_sig: &'l TypeSig<'l>,
	rank: u8,
	szarray: bool,
) -> RtResult<&'l RtClass<'l>> {
	let element = class_from_type_sig(ctx, element_sig)?;
	let module = element.module();
	let pool = ctx.sig_pool();

	let by_val = match szarray {
		true => pool.szarray_of(element_sig),
		false => pool.array_of(element_sig, rank, &[], &[]),
	};
	let by_ref = pool.by_ref_of(by_val);

	let suffix = match szarray {
		true => "[]".to_string(),
		false => format!("[{}]", ",".repeat(rank as usize - 1)),
	};
	let name = arena_name(module, element.name, &suffix);

	let class = alloc_class(
		module,
		0,
		name,
		element.namespace,
		TypeAttributes::PUBLIC | TypeAttributes::SEALED,
		by_val,
		by_ref,
		None,
	);
	class.add_extra(ClassExtraFlags::REFERENCE_TYPE | ClassExtraFlags::ARRAY_OR_SZARRAY);
	class.element_class.set(Some(element));
	class.parent.set(Some(ctx.corlib_types()?.cls_array));
	Ok(class)
}

/// Pointer classes key on their element signature. Their `cast_class`
/// stays the pointer class itself, diverging from runtimes that unify
/// pointers with their element class.
pub fn get_ptr_class<'l>(ctx: &'l Context<'l>, element_sig: &'l TypeSig<'l>) -> RtResult<&'l RtClass<'l>> {
	let key = element_sig as *const _ as usize;
	if let Some(class) = ctx.cached_ptr_class(key) {
		return Ok(class);
	}

	let element = class_from_type_sig(ctx, element_sig)?;
	let module = element.module();
	let pool = ctx.sig_pool();
	let by_val = pool.ptr_to(element_sig);
	let by_ref = pool.by_ref_of(by_val);

	let class = alloc_class(
		module,
		0,
		arena_name(module, element.name, "*"),
		"",
		TypeAttributes::CLASS | (element.flags & TypeAttributes::VISIBILITY_MASK),
		by_val,
		by_ref,
		None,
	);
	class.add_extra(ClassExtraFlags::VALUE_TYPE);
	class.element_class.set(Some(element));
	class.cast_class.set(Some(class));

	ctx.insert_ptr_class(key, class);
	Ok(class)
}

/// Generic-parameter classes key on the pooled parameter identity.
pub fn get_generic_param_class<'l>(
	ctx: &'l Context<'l>,
	sig: &'l TypeSig<'l>,
	param: &'l crate::metadata::typesig::GenericParamDef<'l>,
) -> RtResult<&'l RtClass<'l>> {
	if let Some(class) = ctx.cached_generic_param_class(param.gid) {
		return Ok(class);
	}

	let module = ctx
		.module_by_id(decode_gid_module(param.gid))
		.ok_or(RtErr::ExecutionEngine)?;
	let by_val = ctx.sig_pool().by_val_of(sig);
	let by_ref = ctx.sig_pool().by_ref_of(sig);

	let class = alloc_class(module, 0, param.name, "", TypeAttributes::PUBLIC, by_val, by_ref, None);
	class.add_extra(ClassExtraFlags::REFERENCE_TYPE);
	class.cast_class.set(Some(class));

	ctx.insert_generic_param_class(param.gid, class);
	Ok(class)
}

/// Materializes (or fetches) the class of a constructed generic.
pub fn get_generic_class<'l>(
	ctx: &'l Context<'l>,
	base_gid: TypeDefGid,
	inst: &'l GenericInstSig<'l>,
) -> RtResult<&'l RtClass<'l>> {
	if let Some(class) = ctx.cached_generic_class(base_gid, inst) {
		return Ok(class);
	}

	let base = class_by_gid(ctx, base_gid)?;
	let module = base.module();
	let pool = ctx.sig_pool();
	let by_val = pool.generic_inst_of(base_gid, inst);
	let by_ref = pool.by_ref_of(by_val);

	let class = alloc_class(module, base.token, base.name, base.namespace, base.flags, by_val, by_ref, base.generic_container);
	trace!(class = %class, args = inst.args.len(), "materializing generic instance");
	match base.is_value_type() {
		true => class.add_extra(ClassExtraFlags::VALUE_TYPE),
		false => class.add_extra(ClassExtraFlags::REFERENCE_TYPE),
	}

	ctx.insert_generic_class(base_gid, inst, class);

	// Parent is the base's parent inflated through this instantiation.
	let gctx = GenericContext {
		class_inst: Some(inst),
		method_inst: None,
	};
	let row = module.type_def_row(decode_gid_rid(base_gid))?;
	if !row.extends.is_null() {
		let parent_sig = module.get_typesig_by_coded_index(ctx, row.extends, base.generic_container_context())?;
		let parent_sig = inflate_type_sig(pool, parent_sig, &gctx)?;
		class.parent.set(Some(class_from_type_sig(ctx, parent_sig)?));
	}
	class.declaring_class.set(base.declaring_class.get());

	if base.name == "Nullable`1" && base.namespace == "System" && module.is_corlib() {
		class.add_extra(ClassExtraFlags::NULLABLE);
		let underlying = inst.args.first().ok_or(RtErr::BadImageFormat)?;
		class.element_class.set(Some(class_from_type_sig(ctx, underlying)?));
	}

	Ok(class)
}

// ### Part initialization ###

/// Idempotently builds every part of `class`.
pub fn initialize_all<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.try_set_initialized_part(ClassInitPart::ALL) {
		return Ok(());
	}
	initialize_super_types(ctx, class)?;
	initialize_interfaces(ctx, class)?;
	initialize_nested_classes(ctx, class)?;
	initialize_fields(ctx, class)?;
	initialize_methods(ctx, class)?;
	initialize_properties(ctx, class)?;
	initialize_events(ctx, class)?;
	initialize_vtables(ctx, class)?;
	Ok(())
}

pub fn initialize_super_types<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.try_set_initialized_part(ClassInitPart::SUPER_TYPES) {
		return Ok(());
	}

	let depth = match class.parent() {
		Some(parent) => {
			initialize_super_types(ctx, parent)?;
			parent.hierarchy_depth() + 1
		},
		None => 0,
	};
	class.hierarchy_depth.set(depth);

	let arena = class.module().arena();
	let mut super_types = Vec::with_capacity(depth as usize + 1);
	if let Some(parent) = class.parent() {
		super_types.extend_from_slice(parent.super_types());
	}
	super_types.push(class);
	class.super_types.set(arena.alloc_slice_copy(&super_types));
	Ok(())
}

pub fn initialize_interfaces<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.try_set_initialized_part(ClassInitPart::INTERFACES) {
		return Ok(());
	}
	if let Some(parent) = class.parent() {
		initialize_interfaces(ctx, parent)?;
	}

	match class.family() {
		ClassFamily::TypeDef => setup_interfaces_typedef(ctx, class, None),
		ClassFamily::GenericInst => {
			let gctx = class.generic_context();
			setup_interfaces_typedef(ctx, class, Some(&gctx))
		},
		ClassFamily::ArrayOrSZArray => setup_interfaces_array(ctx, class),
		ClassFamily::GenericParam | ClassFamily::TypeOrFnPtr => Ok(()),
	}
}

fn setup_interfaces_typedef<'l>(
	ctx: &'l Context<'l>,
	class: &'l RtClass<'l>,
	gctx: Option<&GenericContext<'l>>,
) -> RtResult<()> {
	let module = class.module();
	let rid = MetadataToken::try_from(class.token)
		.map_err(|_| RtErr::BadImageFormat)?
		.index() as u32;
	if rid == 0 {
		return Ok(());
	}
	let Some(impls) = module.tables().get_table::<table::InterfaceImplTable>() else {
		return Ok(());
	};
	let range = equal_range_by_key(impls.rows(), rid as usize, |r| r.class.0);
	if range.is_empty() {
		return Ok(());
	}

	let gcc = class.generic_container_context();
	let mut interfaces = Vec::with_capacity(range.len());
	for impl_rid in range {
		let row = impls.get(impl_rid).ok_or(RtErr::BadImageFormat)?;
		let mut sig = module.get_typesig_by_coded_index(ctx, row.interface, gcc)?;
		if let Some(gctx) = gctx {
			sig = inflate_type_sig(ctx.sig_pool(), sig, gctx)?;
		}
		let interface = class_from_type_sig(ctx, sig)?;
		initialize_all(ctx, interface)?;
		interfaces.push(interface);
	}
	class.interfaces.set(class.module().arena().alloc_slice_copy(&interfaces));
	Ok(())
}

/// SZ-arrays surface the well-known generic collection interfaces over
/// their element type. Multi-dimensional arrays add none of their own.
fn setup_interfaces_array<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.is_szarray() {
		return Ok(());
	}
	let types = ctx.corlib_types()?;
	let element_sig = ctx.sig_pool().by_val_of(class.element_class().by_val);
	let inst = ctx.sig_pool().intern_inst(&[element_sig]);

	let bases = [
		types.cls_ilist_generic,
		types.cls_icollection_generic,
		types.cls_ienumerable_generic,
		types.cls_ireadonlylist_generic,
		types.cls_ireadonlycollection_generic,
	];
	let mut interfaces = Vec::with_capacity(bases.len());
	for base in bases {
		let gid = match base.by_val.data {
			TypeSigData::TypeDef(gid) => gid,
			_ => return Err(RtErr::ExecutionEngine),
		};
		let interface = get_generic_class(ctx, gid, inst)?;
		initialize_all(ctx, interface)?;
		interfaces.push(interface);
	}
	class.interfaces.set(class.module().arena().alloc_slice_copy(&interfaces));
	Ok(())
}

pub fn initialize_nested_classes<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.try_set_initialized_part(ClassInitPart::NESTED_CLASSES) {
		return Ok(());
	}
	if let Some(parent) = class.parent() {
		initialize_nested_classes(ctx, parent)?;
	}

	match class.family() {
		ClassFamily::TypeDef => {
			let module = class.module();
			let rid = MetadataToken::try_from(class.token)
				.map_err(|_| RtErr::BadImageFormat)?
				.index() as u32;
			if rid == 0 {
				return Ok(());
			}
			let rids = module.nested_type_def_rids(rid);
			if rids.is_empty() {
				return Ok(());
			}
			let mut nested = Vec::with_capacity(rids.len());
			for nested_rid in rids {
				nested.push(module.get_class_by_type_def_rid(ctx, nested_rid)?);
			}
			class.nested_classes.set(module.arena().alloc_slice_copy(&nested));
		},
		ClassFamily::GenericInst => {
			let base = generic_base_class(ctx, class.by_val)?;
			initialize_nested_classes(ctx, base)?;
			class.nested_classes.set(base.nested_classes());
		},
		_ => {},
	}
	Ok(())
}

/// True when a stored value of `sig` transitively contains a managed
/// reference, forcing collector scanning of the enclosing storage.
fn sig_is_or_contains_references<'l>(ctx: &'l Context<'l>, sig: &'l TypeSig<'l>) -> RtResult<bool> {
	if sig.by_ref {
		return Ok(false);
	}
	match sig.element_type {
		ElementType::Object
		| ElementType::String
		| ElementType::Class
		| ElementType::Array
		| ElementType::SZArray => Ok(true),
		ElementType::ValueType => {
			let class = class_from_type_sig(ctx, sig)?;
			initialize_fields(ctx, class)?;
			Ok(class.has_references())
		},
		ElementType::GenericInst => {
			let base = generic_base_class(ctx, sig)?;
			match base.is_reference_type() {
				true => Ok(true),
				false => {
					let class = class_from_type_sig(ctx, sig)?;
					initialize_fields(ctx, class)?;
					Ok(class.has_references())
				},
			}
		},
		_ => Ok(false),
	}
}

pub fn initialize_fields<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.try_set_initialized_part(ClassInitPart::FIELDS) {
		return Ok(());
	}
	if let Some(parent) = class.parent() {
		initialize_fields(ctx, parent)?;
	}

	match class.family() {
		ClassFamily::TypeDef => {
			setup_fields_typedef(ctx, class, None)?;
			setup_field_layout(ctx, class)?;
			setup_static_field_data(class);
		},
		ClassFamily::GenericInst => {
			let gctx = class.generic_context();
			setup_fields_typedef(ctx, class, Some(&gctx))?;
			setup_field_layout(ctx, class)?;
			setup_static_field_data(class);
		},
		ClassFamily::ArrayOrSZArray => {
			class.instance_size.set(0);
			class.alignment.set(PTR_ALIGN);
			if sig_is_or_contains_references(ctx, class.element_class().by_val)? {
				class.add_extra(ClassExtraFlags::HAS_REFERENCES);
			}
		},
		ClassFamily::TypeOrFnPtr | ClassFamily::GenericParam => {
			class.instance_size.set(PTR_SIZE);
			class.alignment.set(PTR_ALIGN);
		},
	}
	Ok(())
}

fn setup_fields_typedef<'l>(
	ctx: &'l Context<'l>,
	class: &'l RtClass<'l>,
	gctx: Option<&GenericContext<'l>>,
) -> RtResult<()> {
	let module = class.module();
	let rid = MetadataToken::try_from(class.token)
		.map_err(|_| RtErr::BadImageFormat)?
		.index() as u32;
	if rid == 0 {
		return Ok(());
	}
	let range = module.field_rid_range(rid)?;
	if range.is_empty() {
		return Ok(());
	}
	let field_table = module
		.tables()
		.get_table::<table::FieldTable>()
		.ok_or(RtErr::BadImageFormat)?;

	let gcc = class.generic_container_context();
	let mut fields = Vec::with_capacity(range.len());
	for field_rid in range {
		let row = field_table.get(field_rid as usize).ok_or(RtErr::BadImageFormat)?;
		let token = MetadataToken::new(MetadataTokenKind::Field, field_rid as usize).raw();
		let mut type_sig = module.read_field_sig(ctx, row.signature, gcc)?;
		if let Some(gctx) = gctx {
			type_sig = inflate_type_sig(ctx.sig_pool(), type_sig, gctx)?;
		}
		fields.push(RtField {
			parent: Cell::new(None),
			name: module.get_string(row.name)?,
			token,
			flags: row.flags,
			type_sig,
			offset: Cell::new(0),
			thread_static: Cell::new(
				row.flags.contains(FieldAttributes::STATIC)
					&& module.has_custom_attribute_named(token, "System", "ThreadStaticAttribute"),
			),
		});
	}

	let fields = class.module().arena().alloc_slice_fill_iter(fields);
	for field in fields.iter() {
		field.parent.set(Some(class));
	}
	class.fields.set(fields);
	Ok(())
}

fn setup_field_layout<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	debug_assert!(class.has_initialized_part(ClassInitPart::FIELDS));
	let mut instance_fields = Vec::new();
	let mut static_fields = Vec::new();
	let mut has_references = class.parent().map(|p| p.has_references()).unwrap_or(false);

	for field in class.fields() {
		if field.is_instance() {
			if sig_is_or_contains_references(ctx, field.type_sig)? {
				has_references = true;
			}
			instance_fields.push(field);
		} else if field.is_static_in_block() {
			static_fields.push(field);
		}
	}
	if has_references {
		class.add_extra(ClassExtraFlags::HAS_REFERENCES);
	}

	let module = class.module();
	let rid = MetadataToken::try_from(class.token)
		.map_err(|_| RtErr::BadImageFormat)?
		.index() as u32;
	let (declared_size, packing) = layout::class_layout_of(module, rid).unwrap_or((0, 0));

	let instance = match class.is_explicit_layout() {
		true => layout::compute_explicit_layout(ctx, module, &instance_fields)?,
		false => {
			let (parent_size, parent_alignment) = match class.parent() {
				Some(parent) => (parent.instance_size(), parent.alignment()),
				None => (0, 1),
			};
			layout::compute_layout(ctx, &instance_fields, parent_size, parent_alignment, packing)?
		},
	};

	let mut instance_size = instance.size.max(declared_size);
	if class.is_value_type() {
		instance_size = instance_size.max(1);
	}
	class.instance_size.set(instance_size);
	class.alignment.set(instance.alignment);

	let statics = layout::compute_layout(ctx, &static_fields, 0, 1, 0)?;
	class.static_size.set(statics.size);
	Ok(())
}

fn setup_static_field_data(class: &RtClass) {
	if class.static_size() > 0 {
		let data = crate::vm::gc::GarbageCollector::allocate_fixed(class.static_size() as usize);
		class.static_data.set(data);
	}
}

pub fn initialize_methods<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.try_set_initialized_part(ClassInitPart::METHODS) {
		return Ok(());
	}
	if let Some(parent) = class.parent() {
		initialize_methods(ctx, parent)?;
	}

	match class.family() {
		ClassFamily::TypeDef => setup_methods_typedef(ctx, class, None)?,
		ClassFamily::GenericInst => {
			let gctx = class.generic_context();
			setup_methods_typedef(ctx, class, Some(&gctx))?;
		},
		ClassFamily::ArrayOrSZArray => setup_methods_array(ctx, class)?,
		_ => {},
	}

	for method in class.methods().iter().copied() {
		if method.is_generic() {
			// Instantiated descriptors carry their own widths.
			continue;
		}
		build_method_arg_descs(ctx, method)?;
	}
	Ok(())
}

fn setup_methods_typedef<'l>(
	ctx: &'l Context<'l>,
	class: &'l RtClass<'l>,
	gctx: Option<&GenericContext<'l>>,
) -> RtResult<()> {
	let module = class.module();
	let rid = MetadataToken::try_from(class.token)
		.map_err(|_| RtErr::BadImageFormat)?
		.index() as u32;
	if rid == 0 {
		return Ok(());
	}
	let range = module.method_rid_range(rid)?;
	if range.is_empty() {
		return Ok(());
	}
	let method_table = module
		.tables()
		.get_table::<table::MethodDefTable>()
		.ok_or(RtErr::BadImageFormat)?;

	let arena = module.arena();
	let mut methods = Vec::with_capacity(range.len());
	for method_rid in range {
		let row = method_table.get(method_rid as usize).ok_or(RtErr::BadImageFormat)?;
		let name = module.get_string(row.name)?;
		let token = MetadataToken::new(MetadataTokenKind::MethodDef, method_rid as usize).raw();

		if name == ".cctor" {
			class.add_extra(ClassExtraFlags::HAS_STATIC_CONSTRUCTOR);
		} else if name == "Finalize" {
			class.add_extra(ClassExtraFlags::HAS_FINALIZER);
		}

		let generic_container = module.get_generic_container(ctx, token)?;
		let gcc = GenericContainerContext {
			class_container: class.generic_container,
			method_container: generic_container,
		};
		let sig = module.read_method_sig(ctx, row.signature, gcc)?;
		match generic_container {
			Some(container) => {
				if sig.generic_param_count as usize != container.params.len() {
					return Err(RtErr::BadImageFormat);
				}
			},
			None => {
				if sig.generic_param_count != 0 {
					return Err(RtErr::BadImageFormat);
				}
			},
		}

		let mut return_type = sig.return_type;
		let mut params = sig.params;
		if let Some(gctx) = gctx {
			return_type = inflate_type_sig(ctx.sig_pool(), return_type, gctx)?;
			for param in params.iter_mut() {
				*param = inflate_type_sig(ctx.sig_pool(), *param, gctx)?;
			}
		}

		let method = &*arena.alloc(RtMethod {
			parent: Cell::new(class),
			name,
			token,
			flags: row.flags,
			impl_flags: row.impl_flags,
			rva: row.rva,
			has_this: sig.has_this,
			return_type,
			params: arena.alloc_slice_copy(&params),
			generic_container,
			method_inst: None,
			slot: Cell::new(INVALID_SLOT),
			invoker_type: Cell::new(InvokerType::None),
			invoke_fn: Cell::new(None),
			virtual_invoke_fn: Cell::new(None),
			method_ptr: Cell::new(std::ptr::null()),
			total_arg_stack_size: Cell::new(0),
			ret_stack_size: Cell::new(0),
			interp_data: Cell::new(None),
		});
		crate::vm::icalls::select_invokers(ctx, method)?;
		methods.push(method);
	}

	class.methods.set(arena.alloc_slice_copy(&methods));
	Ok(())
}

/// Arrays expose synthesized accessors: `Get`, `Set`, `Address` and the
/// rank-shaped constructors the `newobj` path consults.
fn setup_methods_array<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	let module = class.module();
	let arena = module.arena();
	let element_sig = ctx.sig_pool().by_val_of(class.element_class().by_val);
	let i4 = ctx.sig_pool().primitive(ElementType::I4);
	let void = ctx.sig_pool().primitive(ElementType::Void);
	let rank = class.rank() as usize;

	let index_params = vec![i4; rank];
	let mut set_params = index_params.clone();
	set_params.push(element_sig);
	let ctor2_params = vec![i4; rank * 2];

	let make = |name: &'static str, return_type, params: &[&'l TypeSig<'l>], invoker_type| {
		&*arena.alloc(RtMethod {
			parent: Cell::new(class),
			name,
			token: 0,
			flags: table::MethodAttributes::PUBLIC,
			impl_flags: table::MethodImplAttributes::RUNTIME,
			rva: 0,
			has_this: true,
			return_type,
			params: arena.alloc_slice_copy(params),
			generic_container: None,
			method_inst: None,
			slot: Cell::new(INVALID_SLOT),
			invoker_type: Cell::new(invoker_type),
			invoke_fn: Cell::new(None),
			virtual_invoke_fn: Cell::new(None),
			method_ptr: Cell::new(std::ptr::null()),
			total_arg_stack_size: Cell::new(0),
			ret_stack_size: Cell::new(0),
			interp_data: Cell::new(None),
		})
	};

	let get = make("Get", element_sig, &index_params, InvokerType::ArrayAccessor);
	let set = make("Set", void, &set_params, InvokerType::ArrayAccessor);
	let address = make("Address", ctx.sig_pool().by_ref_of(element_sig), &index_params, InvokerType::ArrayAccessor);
	let ctor = make(".ctor", void, &index_params, InvokerType::ArrayAccessor);
	let ctor_bounds = make(".ctor", void, &ctor2_params, InvokerType::ArrayAccessor);

	let methods = [get, set, address, ctor, ctor_bounds];
	for method in methods {
		crate::vm::array::assign_array_invoker(class, method);
	}
	class.methods.set(arena.alloc_slice_copy(&methods));
	Ok(())
}

pub fn initialize_properties<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.try_set_initialized_part(ClassInitPart::PROPERTIES) {
		return Ok(());
	}
	initialize_methods(ctx, class)?;
	if let Some(parent) = class.parent() {
		initialize_properties(ctx, parent)?;
	}
	match class.family() {
		ClassFamily::TypeDef => setup_properties_typedef(ctx, class, None),
		ClassFamily::GenericInst => {
			let gctx = class.generic_context();
			setup_properties_typedef(ctx, class, Some(&gctx))
		},
		_ => Ok(()),
	}
}

/// Maps a base-definition method to this class's own descriptor. The
/// method arrays of a constructed generic parallel its base's.
fn own_method_for<'l>(
	class: &'l RtClass<'l>,
	module: &'l Module<'l>,
	ctx: &'l Context<'l>,
	method_rid: u32,
) -> RtResult<&'l RtMethod<'l>> {
	let rid = MetadataToken::try_from(class.token)
		.map_err(|_| RtErr::BadImageFormat)?
		.index() as u32;
	let range = module.method_rid_range(rid)?;
	if range.contains(&method_rid) {
		let index = (method_rid - range.start) as usize;
		return class.methods().get(index).copied().ok_or(RtErr::MissingMethod);
	}
	module.get_method_by_rid(ctx, method_rid)
}

fn setup_properties_typedef<'l>(
	ctx: &'l Context<'l>,
	class: &'l RtClass<'l>,
	gctx: Option<&GenericContext<'l>>,
) -> RtResult<()> {
	let module = class.module();
	let rid = MetadataToken::try_from(class.token)
		.map_err(|_| RtErr::BadImageFormat)?
		.index() as u32;
	if rid == 0 {
		return Ok(());
	}
	let Some(maps) = module.tables().get_table::<table::PropertyMapTable>() else {
		return Ok(());
	};
	let Some(map_rid) = maps.rows().iter().position(|r| r.parent.0 == rid as usize) else {
		return Ok(());
	};
	let map_rid = map_rid + 1;
	let properties_table = module
		.tables()
		.get_table::<table::PropertyTable>()
		.ok_or(RtErr::BadImageFormat)?;

	let start = maps.get(map_rid).ok_or(RtErr::BadImageFormat)?.property_list.0;
	let end = match maps.get(map_rid + 1) {
		Some(next) => next.property_list.0,
		None => properties_table.len() + 1,
	};

	let semantics = module.tables().get_table::<table::MethodSemanticsTable>();
	let mut properties = Vec::with_capacity(end.saturating_sub(start));
	for property_rid in start..end {
		let row = properties_table.get(property_rid).ok_or(RtErr::BadImageFormat)?;
		let sig = module.read_method_sig(ctx, row.ty, class.generic_container_context())?;
		let mut return_type = sig.return_type;
		let mut params = sig.params;
		if let Some(gctx) = gctx {
			return_type = inflate_type_sig(ctx.sig_pool(), return_type, gctx)?;
			for param in params.iter_mut() {
				*param = inflate_type_sig(ctx.sig_pool(), *param, gctx)?;
			}
		}

		let property = RtProperty {
			name: module.get_string(row.name)?,
			token: MetadataToken::new(MetadataTokenKind::Property, property_rid).raw(),
			flags: row.flags,
			return_type,
			params: module.arena().alloc_slice_copy(&params),
			get_method: Cell::new(None),
			set_method: Cell::new(None),
		};

		if let Some(semantics) = semantics {
			let token = MetadataToken::new(MetadataTokenKind::Property, property_rid);
			let coded = HasSemantics::encode(token).ok_or(RtErr::BadImageFormat)?;
			let range = equal_range_by_key(semantics.rows(), coded.raw() as usize, |r| r.association.raw() as usize);
			for semantics_rid in range {
				let sem = semantics.get(semantics_rid).ok_or(RtErr::BadImageFormat)?;
				let method = own_method_for(class, module, ctx, sem.method.0 as u32)?;
				if sem.flags.contains(MethodSemanticsAttributes::GETTER) {
					property.get_method.set(Some(method));
				} else if sem.flags.contains(MethodSemanticsAttributes::SETTER) {
					property.set_method.set(Some(method));
				}
			}
		}
		properties.push(property);
	}

	class.properties.set(module.arena().alloc_slice_fill_iter(properties));
	Ok(())
}

pub fn initialize_events<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.try_set_initialized_part(ClassInitPart::EVENTS) {
		return Ok(());
	}
	initialize_methods(ctx, class)?;
	if let Some(parent) = class.parent() {
		initialize_events(ctx, parent)?;
	}
	match class.family() {
		ClassFamily::TypeDef => setup_events_typedef(ctx, class, None),
		ClassFamily::GenericInst => {
			let gctx = class.generic_context();
			setup_events_typedef(ctx, class, Some(&gctx))
		},
		_ => Ok(()),
	}
}

fn setup_events_typedef<'l>(
	ctx: &'l Context<'l>,
	class: &'l RtClass<'l>,
	gctx: Option<&GenericContext<'l>>,
) -> RtResult<()> {
	let module = class.module();
	let rid = MetadataToken::try_from(class.token)
		.map_err(|_| RtErr::BadImageFormat)?
		.index() as u32;
	if rid == 0 {
		return Ok(());
	}
	let Some(maps) = module.tables().get_table::<table::EventMapTable>() else {
		return Ok(());
	};
	let Some(map_rid) = maps.rows().iter().position(|r| r.parent.0 == rid as usize) else {
		return Ok(());
	};
	let map_rid = map_rid + 1;
	let events_table = module
		.tables()
		.get_table::<table::EventTable>()
		.ok_or(RtErr::BadImageFormat)?;

	let start = maps.get(map_rid).ok_or(RtErr::BadImageFormat)?.event_list.0;
	let end = match maps.get(map_rid + 1) {
		Some(next) => next.event_list.0,
		None => events_table.len() + 1,
	};

	let semantics = module.tables().get_table::<table::MethodSemanticsTable>();
	let mut events = Vec::with_capacity(end.saturating_sub(start));
	for event_rid in start..end {
		let row = events_table.get(event_rid).ok_or(RtErr::BadImageFormat)?;
		let mut type_sig = module.get_typesig_by_coded_index(ctx, row.ty, class.generic_container_context())?;
		if let Some(gctx) = gctx {
			type_sig = inflate_type_sig(ctx.sig_pool(), type_sig, gctx)?;
		}

		let event = RtEvent {
			name: module.get_string(row.name)?,
			token: MetadataToken::new(MetadataTokenKind::Event, event_rid).raw(),
			flags: row.flags,
			type_sig,
			add_method: Cell::new(None),
			remove_method: Cell::new(None),
			raise_method: Cell::new(None),
		};

		if let Some(semantics) = semantics {
			let token = MetadataToken::new(MetadataTokenKind::Event, event_rid);
			let coded = HasSemantics::encode(token).ok_or(RtErr::BadImageFormat)?;
			let range = equal_range_by_key(semantics.rows(), coded.raw() as usize, |r| r.association.raw() as usize);
			for semantics_rid in range {
				let sem = semantics.get(semantics_rid).ok_or(RtErr::BadImageFormat)?;
				let method = own_method_for(class, module, ctx, sem.method.0 as u32)?;
				if sem.flags.contains(MethodSemanticsAttributes::ADD_ON) {
					event.add_method.set(Some(method));
				} else if sem.flags.contains(MethodSemanticsAttributes::REMOVE_ON) {
					event.remove_method.set(Some(method));
				} else if sem.flags.contains(MethodSemanticsAttributes::FIRE) {
					event.raise_method.set(Some(method));
				}
			}
		}
		events.push(event);
	}

	class.events.set(module.arena().alloc_slice_fill_iter(events));
	Ok(())
}

// ### Virtual tables ###

fn collect_virtual_methods<'l>(class: &'l RtClass<'l>, out: &mut Vec<&'l RtMethod<'l>>) {
	if let Some(parent) = class.parent() {
		collect_virtual_methods(parent, out);
	}
	for method in class.methods() {
		if method.is_virtual() {
			out.push(*method);
		}
	}
}

pub fn initialize_vtables<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.try_set_initialized_part(ClassInitPart::VTABLE) {
		return Ok(());
	}
	if let Some(parent) = class.parent() {
		initialize_vtables(ctx, parent)?;
	}
	initialize_super_types(ctx, class)?;
	initialize_interfaces(ctx, class)?;
	initialize_methods(ctx, class)?;
	for interface in class.interfaces().iter().copied() {
		initialize_vtables(ctx, interface)?;
	}

	match class.family() {
		ClassFamily::TypeDef | ClassFamily::GenericInst => setup_vtable_typedef(ctx, class),
		ClassFamily::ArrayOrSZArray => setup_vtable_array(ctx, class),
		ClassFamily::TypeOrFnPtr | ClassFamily::GenericParam => {
			if let Some(parent) = class.parent() {
				class.vtable.set(parent.vtable());
				class.interface_offsets.set(parent.interface_offsets());
			}
			Ok(())
		},
	}
}

struct WorkingVtable<'l> {
	entries: Vec<VirtualInvokeData<'l>>,
	offsets: Vec<InterfaceOffset<'l>>,
	/// Indexes into `offsets` for this class's own declared interfaces.
	own_offset_indexes: Vec<usize>,
}

/// Inherits the parent vtable and appends one block per interface the
/// parent does not already carry.
fn inherit_vtable<'l>(class: &'l RtClass<'l>, parent: &'l RtClass<'l>) -> WorkingVtable<'l> {
	let mut offsets: Vec<InterfaceOffset<'l>> = parent.interface_offsets().to_vec();
	let mut own_offset_indexes = Vec::with_capacity(class.interfaces().len());
	let mut total_slot_count = parent.vtable().len();

	for interface in class.interfaces() {
		match offsets.iter().position(|o| std::ptr::eq(o.interface, *interface)) {
			Some(index) => own_offset_indexes.push(index),
			None => {
				own_offset_indexes.push(offsets.len());
				offsets.push(InterfaceOffset {
					interface,
					offset: total_slot_count as u16,
				});
				total_slot_count += interface.vtable().len();
			},
		}
	}

	let mut entries = parent.vtable().to_vec();
	for offset in &offsets {
		if (offset.offset as usize) < parent.vtable().len() {
			continue;
		}
		entries.extend_from_slice(offset.interface.vtable());
	}
	debug_assert_eq!(entries.len(), total_slot_count);

	WorkingVtable {
		entries,
		offsets,
		own_offset_indexes,
	}
}

fn setup_vtable_typedef<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	let mut hierarchy_virtuals = Vec::new();
	if let Some(parent) = class.parent() {
		collect_virtual_methods(parent, &mut hierarchy_virtuals);
	}
	let own_virtual_start = hierarchy_virtuals.len();

	let mut new_slot_methods = Vec::new();
	let mut override_methods = Vec::new();
	for method in class.methods().iter().copied() {
		if method.is_virtual() {
			hierarchy_virtuals.push(method);
			match method.is_new_slot() {
				true => new_slot_methods.push(method),
				false => override_methods.push(method),
			}
		}
	}

	let arena = class.module().arena();

	// Roots: only interfaces and the corlib Object get a fresh vtable.
	let Some(parent) = class.parent() else {
		if class.is_interface() || (class.name == "Object" && class.module().is_corlib()) {
			let mut entries = Vec::with_capacity(new_slot_methods.len());
			for (slot, method) in new_slot_methods.iter().copied().enumerate() {
				method.slot.set(slot as u16);
				entries.push(VirtualInvokeData {
					method,
					method_impl: match method.is_abstract() {
						true => None,
						false => Some(method),
					},
				});
			}
			class.vtable.set(arena.alloc_slice_copy(&entries));
		}
		return Ok(());
	};

	if new_slot_methods.is_empty() && override_methods.is_empty() && class.interfaces().is_empty() {
		class.vtable.set(parent.vtable());
		class.interface_offsets.set(parent.interface_offsets());
		return Ok(());
	}

	let mut working = inherit_vtable(class, parent);

	// New-slot methods extend the table.
	for method in new_slot_methods.iter().copied() {
		method.slot.set(working.entries.len() as u16);
		working.entries.push(VirtualInvokeData {
			method,
			method_impl: match method.is_abstract() {
				true => None,
				false => Some(method),
			},
		});
	}

	class.interface_offsets.set(arena.alloc_slice_copy(&working.offsets));

	// Explicit MethodImpl rows pin slots and lock them against implicit
	// overriding.
	let mut explicitly_initialized: FxHashSet<usize> = FxHashSet::default();
	let module = class.module();
	let rid = MetadataToken::try_from(class.token)
		.map_err(|_| RtErr::BadImageFormat)?
		.index() as u32;
	if let Some(method_impls) = module.tables().get_table::<table::MethodImplTable>() {
		let gcc = class.generic_container_context();
		let gctx = class.generic_context();
		let range = equal_range_by_key(method_impls.rows(), rid as usize, |r| r.class.0);
		for impl_rid in range {
			let row = method_impls.get(impl_rid).ok_or(RtErr::BadImageFormat)?;
			let body = module.get_method_by_token(ctx, row.body.into(), gcc, Some(&gctx))?;
			let declaration = module.get_method_by_token(ctx, row.declaration.into(), gcc, Some(&gctx))?;
			if !body.is_virtual() || !declaration.is_virtual() {
				return Err(RtErr::BadImageFormat);
			}
			let declaration_slot = declaration.slot();
			if declaration_slot == INVALID_SLOT {
				return Err(RtErr::BadImageFormat);
			}

			let index = match declaration.parent().is_interface() {
				true => {
					let offset = working
						.offsets
						.iter()
						.find(|o| std::ptr::eq(o.interface, declaration.parent()))
						.ok_or(RtErr::BadImageFormat)?
						.offset;
					offset as usize + declaration_slot as usize
				},
				false => {
					if !has_class_parent_fast(class, declaration.parent()) {
						return Err(RtErr::BadImageFormat);
					}
					declaration_slot as usize
				},
			};
			if index >= working.entries.len() || !explicitly_initialized.insert(index) {
				return Err(RtErr::BadImageFormat);
			}
			let entry = &mut working.entries[index];
			if !std::ptr::eq(entry.method, declaration) {
				return Err(RtErr::BadImageFormat);
			}
			entry.method_impl = Some(body);
		}
	}

	// Implicit overrides: nearest-parent-outwards search by name and
	// signature; winning also redirects devirtualized parent entries.
	let parent_vtable_len = parent.vtable().len();
	for method in override_methods.iter().copied() {
		let mut found = false;
		for candidate in hierarchy_virtuals[..own_virtual_start].iter().copied().rev() {
			if candidate.slot() == INVALID_SLOT {
				return Err(RtErr::BadImageFormat);
			}
			if candidate.name != method.name
				|| !method::is_method_signature_equal(ctx, method, candidate)?
			{
				continue;
			}
			let match_slot = candidate.slot() as usize;
			if explicitly_initialized.contains(&match_slot) {
				found = true;
				break;
			}
			working.entries[match_slot].method_impl = Some(method);
			method.slot.set(match_slot as u16);
			found = true;

			for entry in working.entries[..parent_vtable_len].iter_mut() {
				if entry.method_impl.map(|m| std::ptr::eq(m, candidate)).unwrap_or(false) {
					entry.method_impl = Some(method);
				}
			}
			break;
		}
		if !found {
			return Err(RtErr::ExecutionEngine);
		}
	}

	// New-slot methods implicitly satisfy matching interface slots.
	if !working.own_offset_indexes.is_empty() {
		for method in new_slot_methods.iter().copied() {
			for index in &working.own_offset_indexes {
				let offset_info = working.offsets[*index];
				for i in 0..offset_info.interface.vtable().len() {
					let slot = offset_info.offset as usize + i;
					let declared = working.entries[slot].method;
					if declared.name == method.name
						&& method::is_method_signature_equal(ctx, method, declared)?
					{
						working.entries[slot].method_impl = Some(method);
					}
				}
			}
		}
	}

	// Remaining null interface slots inherit any hierarchy method with
	// a matching signature. Only the freshly appended interface blocks
	// qualify; new-slot entries past them already carry their own
	// implementation, or stay empty while abstract.
	for offset_index in 0..working.offsets.len() {
		let offset_info = working.offsets[offset_index];
		if (offset_info.offset as usize) < parent_vtable_len {
			continue;
		}
		for i in 0..offset_info.interface.vtable().len() {
			let index = offset_info.offset as usize + i;
			if working.entries[index].method_impl.is_some() {
				continue;
			}
			let declared = working.entries[index].method;
			let mut found = false;
			for candidate in hierarchy_virtuals.iter().copied().rev() {
				if candidate.slot() == INVALID_SLOT {
					return Err(RtErr::BadImageFormat);
				}
				if candidate.name == declared.name
					&& method::is_method_signature_equal(ctx, declared, candidate)?
				{
					working.entries[index].method_impl = Some(candidate);
					found = true;
					break;
				}
			}
			if !found {
				return Err(RtErr::ExecutionEngine);
			}
		}
	}

	if !class.is_abstract() {
		for (index, entry) in working.entries.iter().enumerate() {
			// Slot 1 of the Object root may legitimately stay empty.
			if entry.method_impl.is_none() && index != 1 {
				return Err(RtErr::ExecutionEngine);
			}
		}
	}

	class.vtable.set(arena.alloc_slice_copy(&working.entries));
	Ok(())
}

/// Arrays inherit `System.Array`'s table and append blocks for their
/// synthesized interfaces; slots fill by signature where the hierarchy
/// provides an implementation and stay empty otherwise.
fn setup_vtable_array<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	let Some(parent) = class.parent() else {
		return Ok(());
	};

	let mut hierarchy_virtuals = Vec::new();
	collect_virtual_methods(parent, &mut hierarchy_virtuals);

	let mut working = inherit_vtable(class, parent);
	let parent_vtable_len = parent.vtable().len();
	for index in parent_vtable_len..working.entries.len() {
		if working.entries[index].method_impl.is_some() {
			continue;
		}
		let declared = working.entries[index].method;
		for candidate in hierarchy_virtuals.iter().copied().rev() {
			if candidate.name == declared.name
				&& method::is_method_signature_equal(ctx, declared, candidate)?
			{
				working.entries[index].method_impl = Some(candidate);
				break;
			}
		}
	}

	let arena = class.module().arena();
	class.vtable.set(arena.alloc_slice_copy(&working.entries));
	class.interface_offsets.set(arena.alloc_slice_copy(&working.offsets));
	Ok(())
}

// ### Lookup helpers ###

pub fn find_field_by_name<'l>(
	class: &'l RtClass<'l>,
	name: &str,
	search_parent: bool,
) -> Option<&'l RtField<'l>> {
	let mut current = Some(class);
	while let Some(cls) = current {
		if let Some(field) = cls.fields().iter().find(|f| f.name == name) {
			return Some(field);
		}
		if !search_parent {
			break;
		}
		current = cls.parent();
	}
	None
}

pub fn find_nested_class_by_name<'l>(
	ctx: &'l Context<'l>,
	class: &'l RtClass<'l>,
	name: &str,
	ignore_case: bool,
) -> RtResult<Option<&'l RtClass<'l>>> {
	initialize_nested_classes(ctx, class)?;
	for nested in class.nested_classes().iter().copied() {
		let matches = match ignore_case {
			false => nested.name == name,
			true => nested.name.eq_ignore_ascii_case(name),
		};
		if matches {
			return Ok(Some(nested));
		}
	}
	Ok(None)
}

pub fn get_static_constructor<'l>(class: &'l RtClass<'l>) -> Option<&'l RtMethod<'l>> {
	debug_assert!(class.has_initialized_part(ClassInitPart::METHODS));
	if !class.has_static_constructor() {
		return None;
	}
	class.methods().iter().copied().find(|m| m.name == ".cctor")
}

// ### Assignability ###

/// Constant-time ancestry test through the depth-indexed super-type
/// vector.
pub fn has_class_parent_fast<'l>(class: &'l RtClass<'l>, parent: &'l RtClass<'l>) -> bool {
	debug_assert!(class.has_initialized_part(ClassInitPart::SUPER_TYPES));
	parent.hierarchy_depth() <= class.hierarchy_depth()
		&& std::ptr::eq(class.super_types()[parent.hierarchy_depth() as usize], parent)
}

fn is_assignable_from_class<'l>(from: &'l RtClass<'l>, to: &'l RtClass<'l>) -> bool {
	if std::ptr::eq(from, to) {
		return true;
	}
	match to.by_val.element_type {
		ElementType::Void => false,
		ElementType::Object => true,
		ElementType::String
		| ElementType::Boolean
		| ElementType::Char
		| ElementType::I1 | ElementType::U1
		| ElementType::I2 | ElementType::U2
		| ElementType::I4 | ElementType::U4
		| ElementType::I8 | ElementType::U8
		| ElementType::R4 | ElementType::R8
		| ElementType::I | ElementType::U
		| ElementType::TypedByRef
		| ElementType::ValueType => false,
		ElementType::Class => has_class_parent_fast(from, to),
		ElementType::Var | ElementType::MVar => false,
		ElementType::SZArray => {
			if from.by_val.element_type != ElementType::SZArray {
				return false;
			}
			let from_element = from.element_class();
			let to_element = to.element_class();
			match from_element.is_value_type() {
				true => std::ptr::eq(from_element, to_element),
				false => is_assignable_from(from_element, to_element),
			}
		},
		ElementType::Array => {
			if from.by_val.element_type != ElementType::Array || from.rank() != to.rank() {
				return false;
			}
			let from_element = from.element_class();
			let to_element = to.element_class();
			match from_element.is_value_type() {
				true => std::ptr::eq(from_element, to_element),
				false => is_assignable_from(from_element, to_element),
			}
		},
		ElementType::GenericInst => match to.is_value_type() {
			true => false,
			false => has_class_parent_fast(from, to),
		},
		_ => false,
	}
}

fn is_assignable_from_interface<'l>(from: &'l RtClass<'l>, to: &'l RtClass<'l>) -> bool {
	let mut current = Some(from);
	while let Some(cls) = current {
		if cls.interfaces().iter().any(|i| std::ptr::eq(*i, to)) {
			return true;
		}
		current = cls.parent();
	}
	false
}

/// Whether a reference of class `from` can stand where `to` is expected.
pub fn is_assignable_from<'l>(from: &'l RtClass<'l>, to: &'l RtClass<'l>) -> bool {
	debug_assert!(from.has_initialized_part(ClassInitPart::SUPER_TYPES));
	if std::ptr::eq(from, to) {
		return true;
	}
	match to.is_interface() {
		false => is_assignable_from_class(from, to),
		true => is_assignable_from_interface(from, to),
	}
}

pub fn is_pointer_element_compatible_with<'l>(
	ctx: &'l Context<'l>,
	from: &'l RtClass<'l>,
	to: &'l RtClass<'l>,
) -> RtResult<bool> {
	Ok(std::ptr::eq(from.cast_class(ctx)?, to.cast_class(ctx)?))
}
