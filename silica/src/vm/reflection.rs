use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::{self, RtClass, RtField};
use crate::metadata::method::RtMethod;
use crate::metadata::module::Module;
use crate::metadata::typesig::TypeSig;
use crate::vm::object::{self, RtArray, RtObject, RtString, OBJECT_HEADER_SIZE};

// Reflection object shapes. The corlib defines the managed halves;
// startup verification pins both sides to the same byte layout so the
// reflection icalls can poke fields directly.

#[repr(C)]
pub struct RtReflectionType<'l> {
	pub header: RtObject<'l>,
	pub type_handle: *const TypeSig<'l>,
}

#[repr(C)]
pub struct RtReflectionRuntimeType<'l> {
	pub base: RtReflectionType<'l>,
	pub type_info: *mut RtObject<'l>,
	pub generic_cache: *mut RtObject<'l>,
	pub serialization_ctor: *mut RtObject<'l>,
}

#[repr(C)]
pub struct RtReflectionField<'l> {
	pub header: RtObject<'l>,
	pub klass: *const RtClass<'l>,
	pub field: *const RtField<'l>,
	pub name: *mut RtString<'l>,
	pub field_type: *mut RtReflectionType<'l>,
	pub attrs: u32,
}

#[repr(C)]
pub struct RtReflectionMethod<'l> {
	pub header: RtObject<'l>,
	pub method: *const RtMethod<'l>,
	pub name: *mut RtString<'l>,
	pub ref_type: *mut RtReflectionType<'l>,
}

#[repr(C)]
pub struct RtReflectionPropertyInfo<'l> {
	pub parent: *mut RtReflectionType<'l>,
	pub declaring_type: *mut RtReflectionType<'l>,
	pub name: *mut RtString<'l>,
	pub get_method: *mut RtReflectionMethod<'l>,
	pub set_method: *mut RtReflectionMethod<'l>,
	pub attrs: u32,
}

#[repr(C)]
pub struct RtReflectionProperty<'l> {
	pub header: RtObject<'l>,
	pub klass: *const RtClass<'l>,
	pub property: *const crate::metadata::class::RtProperty<'l>,
	pub info: RtReflectionPropertyInfo<'l>,
	pub cached: u32,
	pub cached_get: *mut RtObject<'l>,
}

#[repr(C)]
pub struct RtReflectionEvent<'l> {
	pub header: RtObject<'l>,
	pub cached_add_event: *mut RtObject<'l>,
}

#[repr(C)]
pub struct RtReflectionEventInfo<'l> {
	pub base: RtReflectionEvent<'l>,
	pub ref_type: *mut RtReflectionType<'l>,
	pub event: *const crate::metadata::class::RtEvent<'l>,
}

#[repr(C)]
pub struct RtReflectionParameter<'l> {
	pub header: RtObject<'l>,
	pub attrs: u32,
	pub parent_type: *mut RtReflectionType<'l>,
	pub default_value: *mut RtObject<'l>,
	pub member: *mut RtObject<'l>,
	pub name: *mut RtString<'l>,
	pub position: i32,
	pub marshaling_info: *mut RtObject<'l>,
}

#[repr(C)]
pub struct RtReflectionAssembly<'l> {
	pub header: RtObject<'l>,
	pub assembly: *const Module<'l>,
	pub evidence: *mut RtObject<'l>,
	pub resolve_event_holder: *mut RtObject<'l>,
	pub minimum: *mut RtObject<'l>,
	pub optional: *mut RtObject<'l>,
	pub refused: *mut RtObject<'l>,
	pub granted: *mut RtObject<'l>,
	pub denied: *mut RtObject<'l>,
	pub from_byte_array: bool,
	pub name: *mut RtString<'l>,
}

#[repr(C)]
pub struct RtReflectionModule<'l> {
	pub header: RtObject<'l>,
	pub image: *const Module<'l>,
	pub assembly: *mut RtReflectionAssembly<'l>,
	pub fqname: *mut RtString<'l>,
	pub name: *mut RtString<'l>,
	pub scope_name: *mut RtString<'l>,
	pub is_resource: bool,
	pub token: u32,
}

#[repr(C)]
pub struct RtStackFrame<'l> {
	pub header: RtObject<'l>,
	pub il_offset: i32,
	pub native_offset: i32,
	pub method_address: u64,
	pub method_index: u32,
	pub method: *mut RtReflectionMethod<'l>,
	pub filename: *mut RtString<'l>,
	pub line: i32,
	pub column: i32,
	pub internal_method_name: *mut RtString<'l>,
}

/// Verifies at startup that each reflection-facing corlib class lays
/// out to exactly the native struct the runtime pokes. Any drift is a
/// malformed corlib.
pub(crate) fn verify_corlib_layouts<'l>(ctx: &'l Context<'l>) -> RtResult<()> {
	use crate::vm::object::{RtDelegate, RtException, RtMulticastDelegate, RtTypedReference};

	let types = ctx.corlib_types()?;

	let with_header = |class: &'l RtClass<'l>| -> RtResult<usize> {
		class::initialize_all(ctx, class)?;
		Ok(OBJECT_HEADER_SIZE + class.instance_size() as usize)
	};
	let without_header = |class: &'l RtClass<'l>| -> RtResult<usize> {
		class::initialize_all(ctx, class)?;
		Ok(class.instance_size() as usize)
	};

	let checks: &[(usize, usize)] = &[
		(without_header(types.cls_typedreference)?, std::mem::size_of::<RtTypedReference>()),
		(with_header(types.cls_delegate)?, std::mem::size_of::<RtDelegate>()),
		(with_header(types.cls_multicastdelegate)?, std::mem::size_of::<RtMulticastDelegate>()),
		(with_header(types.cls_exception)?, std::mem::size_of::<RtException>()),
		(with_header(types.cls_runtimetype)?, std::mem::size_of::<RtReflectionRuntimeType>()),
		(with_header(types.cls_reflection_field)?, std::mem::size_of::<RtReflectionField>()),
		(with_header(types.cls_reflection_method)?, std::mem::size_of::<RtReflectionMethod>()),
		(with_header(types.cls_reflection_property)?, std::mem::size_of::<RtReflectionProperty>()),
		(with_header(types.cls_reflection_event)?, std::mem::size_of::<RtReflectionEventInfo>()),
		(with_header(types.cls_reflection_parameter)?, std::mem::size_of::<RtReflectionParameter>()),
		(with_header(types.cls_reflection_assembly)?, std::mem::size_of::<RtReflectionAssembly>()),
		(with_header(types.cls_reflection_module)?, std::mem::size_of::<RtReflectionModule>()),
		(with_header(types.cls_stackframe)?, std::mem::size_of::<RtStackFrame>()),
	];

	for (managed, native) in checks {
		if managed != native {
			return Err(RtErr::BadImageFormat);
		}
	}
	Ok(())
}

/// The (cached) `System.RuntimeType` object of a class.
pub fn type_object_of_class<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<*mut RtReflectionType<'l>> {
	if let Some(existing) = ctx.cached_reflection_type(class) {
		return Ok(existing);
	}
	let types = ctx.corlib_types()?;
	let obj = object::new_object(ctx, types.cls_runtimetype)? as *mut RtReflectionType<'l>;
	unsafe { (*obj).type_handle = class.by_val };
	ctx.insert_reflection_type(class, obj);
	Ok(obj)
}

pub fn method_object_of_method<'l>(ctx: &'l Context<'l>, method: &'l RtMethod<'l>) -> RtResult<*mut RtReflectionMethod<'l>> {
	let types = ctx.corlib_types()?;
	let class = match method.name.starts_with('.') {
		true => types.cls_reflection_constructor,
		false => types.cls_reflection_method,
	};
	let obj = object::new_object(ctx, class)? as *mut RtReflectionMethod<'l>;
	unsafe {
		(*obj).method = method;
		(*obj).name = crate::vm::string::create_string_from_utf8(ctx, method.name)?;
		(*obj).ref_type = type_object_of_class(ctx, method.parent())?;
	}
	Ok(obj)
}

pub fn field_object_of_field<'l>(ctx: &'l Context<'l>, field: &'l RtField<'l>) -> RtResult<*mut RtReflectionField<'l>> {
	let types = ctx.corlib_types()?;
	let obj = object::new_object(ctx, types.cls_reflection_field)? as *mut RtReflectionField<'l>;
	unsafe {
		(*obj).klass = field.parent();
		(*obj).field = field;
		(*obj).name = crate::vm::string::create_string_from_utf8(ctx, field.name)?;
		(*obj).attrs = field.flags.bits() as u32;
	}
	Ok(obj)
}

pub fn assembly_object_of_module<'l>(ctx: &'l Context<'l>, module: &'l Module<'l>) -> RtResult<*mut RtReflectionAssembly<'l>> {
	if let Some(existing) = ctx.cached_reflection_assembly(module) {
		return Ok(existing);
	}
	let types = ctx.corlib_types()?;
	let obj = object::new_object(ctx, types.cls_reflection_assembly)? as *mut RtReflectionAssembly<'l>;
	unsafe {
		(*obj).assembly = module;
		(*obj).name = crate::vm::string::create_string_from_utf8(ctx, module.name())?;
	}
	ctx.insert_reflection_assembly(module, obj);
	Ok(obj)
}

/// A `StackFrame` for one captured frame; file and line stay zero, no
/// debug information is consulted.
pub fn new_stack_frame<'l>(
	ctx: &'l Context<'l>,
	method: &'l RtMethod<'l>,
	il_offset: i32,
) -> RtResult<*mut RtObject<'l>> {
	let types = ctx.corlib_types()?;
	let obj = object::new_object(ctx, types.cls_stackframe)? as *mut RtStackFrame<'l>;
	unsafe {
		(*obj).il_offset = il_offset;
		(*obj).native_offset = -1;
		(*obj).method = method_object_of_method(ctx, method)?;
		(*obj).internal_method_name = crate::vm::string::create_string_from_utf8(ctx, method.name)?;
	}
	Ok(obj as *mut RtObject<'l>)
}

/// All classes of a module as `RuntimeType[]` (`Assembly.GetTypes`).
pub fn get_module_types<'l>(
	ctx: &'l Context<'l>,
	module: &'l Module<'l>,
	exported_only: bool,
) -> RtResult<*mut RtArray<'l>> {
	use crate::raw::heaps::table::TypeAttributes;
	let types = ctx.corlib_types()?;

	let mut classes = Vec::new();
	// Row 1 is the implicit <Module> class.
	for rid in 2..=module.type_def_row_count() as u32 {
		let class = module.get_class_by_type_def_rid(ctx, rid)?;
		if exported_only && (class.flags & TypeAttributes::VISIBILITY_MASK) != TypeAttributes::PUBLIC {
			continue;
		}
		classes.push(class);
	}

	let arr = crate::vm::array::new_array_from_element_class(ctx, types.cls_systemtype, classes.len() as i32)?;
	for (i, class) in classes.iter().enumerate() {
		let reflected = type_object_of_class(ctx, class)?;
		unsafe { crate::vm::array::array_set_at(arr, i as i32, reflected) };
	}
	Ok(arr)
}
