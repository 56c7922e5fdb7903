use tracing::{debug, info, instrument};

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::{self, RtClass};
use crate::metadata::method::RtMethod;
use crate::metadata::module::Module;
use crate::raw::indices::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::{RtArray, RtObject};

/// Eagerly resolved well-known corlib classes. Everything the runtime
/// allocates, raises, or reflects over is pinned here at startup.
#[derive(Debug)]
pub struct CorlibTypes<'l> {
	pub cls_object: &'l RtClass<'l>,
	pub cls_void: &'l RtClass<'l>,
	pub cls_string: &'l RtClass<'l>,
	pub cls_valuetype: &'l RtClass<'l>,

	pub cls_boolean: &'l RtClass<'l>,
	pub cls_char: &'l RtClass<'l>,
	pub cls_sbyte: &'l RtClass<'l>,
	pub cls_byte: &'l RtClass<'l>,
	pub cls_int16: &'l RtClass<'l>,
	pub cls_uint16: &'l RtClass<'l>,
	pub cls_int32: &'l RtClass<'l>,
	pub cls_uint32: &'l RtClass<'l>,
	pub cls_int64: &'l RtClass<'l>,
	pub cls_uint64: &'l RtClass<'l>,
	pub cls_intptr: &'l RtClass<'l>,
	pub cls_uintptr: &'l RtClass<'l>,
	pub cls_single: &'l RtClass<'l>,
	pub cls_double: &'l RtClass<'l>,
	pub cls_typedreference: &'l RtClass<'l>,

	pub cls_enum: &'l RtClass<'l>,
	pub cls_nullable: &'l RtClass<'l>,
	pub cls_array: &'l RtClass<'l>,
	pub cls_delegate: &'l RtClass<'l>,
	pub cls_multicastdelegate: &'l RtClass<'l>,
	pub cls_systemtype: &'l RtClass<'l>,
	pub cls_runtimetype: &'l RtClass<'l>,

	pub cls_icollection: &'l RtClass<'l>,
	pub cls_ienumerable: &'l RtClass<'l>,
	pub cls_ilist: &'l RtClass<'l>,
	pub cls_ienumerator: &'l RtClass<'l>,
	pub cls_ilist_generic: &'l RtClass<'l>,
	pub cls_icollection_generic: &'l RtClass<'l>,
	pub cls_ienumerable_generic: &'l RtClass<'l>,
	pub cls_ireadonlylist_generic: &'l RtClass<'l>,
	pub cls_ireadonlycollection_generic: &'l RtClass<'l>,
	pub cls_ienumerator_generic: &'l RtClass<'l>,

	pub cls_exception: &'l RtClass<'l>,
	pub cls_arithmetic_exception: &'l RtClass<'l>,
	pub cls_divide_by_zero_exception: &'l RtClass<'l>,
	pub cls_execution_engine_exception: &'l RtClass<'l>,
	pub cls_overflow_exception: &'l RtClass<'l>,
	pub cls_stack_overflow_exception: &'l RtClass<'l>,
	pub cls_argument_exception: &'l RtClass<'l>,
	pub cls_argument_null_exception: &'l RtClass<'l>,
	pub cls_argument_out_of_range_exception: &'l RtClass<'l>,
	pub cls_type_load_exception: &'l RtClass<'l>,
	pub cls_index_out_of_range_exception: &'l RtClass<'l>,
	pub cls_invalid_cast_exception: &'l RtClass<'l>,
	pub cls_missing_field_exception: &'l RtClass<'l>,
	pub cls_missing_method_exception: &'l RtClass<'l>,
	pub cls_missing_member_exception: &'l RtClass<'l>,
	pub cls_null_reference_exception: &'l RtClass<'l>,
	pub cls_array_type_mismatch_exception: &'l RtClass<'l>,
	pub cls_out_of_memory_exception: &'l RtClass<'l>,
	pub cls_bad_image_format_exception: &'l RtClass<'l>,
	pub cls_entry_point_not_found_exception: &'l RtClass<'l>,
	pub cls_not_supported_exception: &'l RtClass<'l>,
	pub cls_not_implemented_exception: &'l RtClass<'l>,
	pub cls_type_unloaded_exception: &'l RtClass<'l>,
	pub cls_type_initialization_exception: &'l RtClass<'l>,
	pub cls_file_not_found_exception: &'l RtClass<'l>,

	pub cls_attribute: &'l RtClass<'l>,
	pub cls_customattributedata: &'l RtClass<'l>,
	pub cls_intrinsic: &'l RtClass<'l>,

	pub cls_reflection_assembly: &'l RtClass<'l>,
	pub cls_reflection_module: &'l RtClass<'l>,
	pub cls_reflection_field: &'l RtClass<'l>,
	pub cls_reflection_method: &'l RtClass<'l>,
	pub cls_reflection_constructor: &'l RtClass<'l>,
	pub cls_reflection_property: &'l RtClass<'l>,
	pub cls_reflection_event: &'l RtClass<'l>,
	pub cls_reflection_parameter: &'l RtClass<'l>,
	pub cls_reflection_memberinfo: &'l RtClass<'l>,
	pub cls_stackframe: &'l RtClass<'l>,
}

fn resolve_corlib_types<'l>(ctx: &'l Context<'l>) -> RtResult<&'l CorlibTypes<'l>> {
	let corlib = ctx.corlib_module()?;
	let get = |full_name: &str| -> RtResult<&'l RtClass<'l>> {
		corlib
			.get_class_by_name(ctx, full_name, false, true)?
			.ok_or(RtErr::TypeLoad)
	};

	let types = CorlibTypes {
		cls_object: get("System.Object")?,
		cls_void: get("System.Void")?,
		cls_string: get("System.String")?,
		cls_valuetype: get("System.ValueType")?,

		cls_boolean: get("System.Boolean")?,
		cls_char: get("System.Char")?,
		cls_sbyte: get("System.SByte")?,
		cls_byte: get("System.Byte")?,
		cls_int16: get("System.Int16")?,
		cls_uint16: get("System.UInt16")?,
		cls_int32: get("System.Int32")?,
		cls_uint32: get("System.UInt32")?,
		cls_int64: get("System.Int64")?,
		cls_uint64: get("System.UInt64")?,
		cls_intptr: get("System.IntPtr")?,
		cls_uintptr: get("System.UIntPtr")?,
		cls_single: get("System.Single")?,
		cls_double: get("System.Double")?,
		cls_typedreference: get("System.TypedReference")?,

		cls_enum: get("System.Enum")?,
		cls_nullable: get("System.Nullable`1")?,
		cls_array: get("System.Array")?,
		cls_delegate: get("System.Delegate")?,
		cls_multicastdelegate: get("System.MulticastDelegate")?,
		cls_systemtype: get("System.Type")?,
		cls_runtimetype: get("System.RuntimeType")?,

		cls_icollection: get("System.Collections.ICollection")?,
		cls_ienumerable: get("System.Collections.IEnumerable")?,
		cls_ilist: get("System.Collections.IList")?,
		cls_ienumerator: get("System.Collections.IEnumerator")?,
		cls_ilist_generic: get("System.Collections.Generic.IList`1")?,
		cls_icollection_generic: get("System.Collections.Generic.ICollection`1")?,
		cls_ienumerable_generic: get("System.Collections.Generic.IEnumerable`1")?,
		cls_ireadonlylist_generic: get("System.Collections.Generic.IReadOnlyList`1")?,
		cls_ireadonlycollection_generic: get("System.Collections.Generic.IReadOnlyCollection`1")?,
		cls_ienumerator_generic: get("System.Collections.Generic.IEnumerator`1")?,

		cls_exception: get("System.Exception")?,
		cls_arithmetic_exception: get("System.ArithmeticException")?,
		cls_divide_by_zero_exception: get("System.DivideByZeroException")?,
		cls_execution_engine_exception: get("System.ExecutionEngineException")?,
		cls_overflow_exception: get("System.OverflowException")?,
		cls_stack_overflow_exception: get("System.StackOverflowException")?,
		cls_argument_exception: get("System.ArgumentException")?,
		cls_argument_null_exception: get("System.ArgumentNullException")?,
		cls_argument_out_of_range_exception: get("System.ArgumentOutOfRangeException")?,
		cls_type_load_exception: get("System.TypeLoadException")?,
		cls_index_out_of_range_exception: get("System.IndexOutOfRangeException")?,
		cls_invalid_cast_exception: get("System.InvalidCastException")?,
		cls_missing_field_exception: get("System.MissingFieldException")?,
		cls_missing_method_exception: get("System.MissingMethodException")?,
		cls_missing_member_exception: get("System.MissingMemberException")?,
		cls_null_reference_exception: get("System.NullReferenceException")?,
		cls_array_type_mismatch_exception: get("System.ArrayTypeMismatchException")?,
		cls_out_of_memory_exception: get("System.OutOfMemoryException")?,
		cls_bad_image_format_exception: get("System.BadImageFormatException")?,
		cls_entry_point_not_found_exception: get("System.EntryPointNotFoundException")?,
		cls_not_supported_exception: get("System.NotSupportedException")?,
		cls_not_implemented_exception: get("System.NotImplementedException")?,
		cls_type_unloaded_exception: get("System.TypeUnloadedException")?,
		cls_type_initialization_exception: get("System.TypeInitializationException")?,
		cls_file_not_found_exception: get("System.IO.FileNotFoundException")?,

		cls_attribute: get("System.Attribute")?,
		cls_customattributedata: get("System.Reflection.CustomAttributeData")?,
		cls_intrinsic: get("System.Runtime.CompilerServices.IntrinsicAttribute")?,

		cls_reflection_assembly: get("System.Reflection.RuntimeAssembly")?,
		cls_reflection_module: get("System.Reflection.RuntimeModule")?,
		cls_reflection_field: get("System.Reflection.RuntimeFieldInfo")?,
		cls_reflection_method: get("System.Reflection.RuntimeMethodInfo")?,
		cls_reflection_constructor: get("System.Reflection.RuntimeConstructorInfo")?,
		cls_reflection_property: get("System.Reflection.RuntimePropertyInfo")?,
		cls_reflection_event: get("System.Reflection.RuntimeEventInfo")?,
		cls_reflection_parameter: get("System.Reflection.RuntimeParameterInfo")?,
		cls_reflection_memberinfo: get("System.Reflection.MemberInfo")?,
		cls_stackframe: get("System.Diagnostics.StackFrame")?,
	};

	Ok(ctx.bump().alloc(types))
}

/// Brings the runtime up: registries, the current-exception slot, the
/// well-known corlib classes, `String.Empty`, and the reflection layout
/// verification. The corlib must already be loaded.
#[instrument(skip_all)]
pub fn initialize<'l>(ctx: &'l Context<'l>) -> RtResult<()> {
	crate::vm::exception::initialize(ctx)?;
	crate::vm::icalls::install(ctx);

	let types = resolve_corlib_types(ctx)?;
	ctx.set_corlib_types(types)?;

	crate::vm::string::initialize(ctx)?;
	crate::vm::reflection::verify_corlib_layouts(ctx)?;
	info!("runtime initialized");
	Ok(())
}

/// Runs a class's user static constructor exactly once, marking the
/// class before entry so self-referential constructors terminate.
pub fn run_class_static_constructor<'l>(ctx: &'l Context<'l>, class: &'l RtClass<'l>) -> RtResult<()> {
	if !class.is_cctor_not_finished() {
		return Ok(());
	}
	class::initialize_methods(ctx, class)?;
	class.set_cctor_finished();

	let Some(cctor) = class::get_static_constructor(class) else {
		return Ok(());
	};
	debug!(class = %class, "running static constructor");
	let invoke = cctor.invoke_fn().ok_or(RtErr::ExecutionEngine)?;
	let mut ret = [StackObject::default(); 1];
	invoke(ctx, cctor.method_ptr(), cctor, std::ptr::null(), ret.as_mut_ptr())
}

/// The `<Module>` row-1 pseudo-class may carry a module constructor.
pub fn run_module_static_constructor<'l>(ctx: &'l Context<'l>, module: &'l Module<'l>) -> RtResult<()> {
	let class = module.get_class_by_type_def_rid(ctx, 1)?;
	class::initialize_all(ctx, class)?;
	run_class_static_constructor(ctx, class)
}

/// Invokes through the uniform stack-object ABI after making sure the
/// declaring class's static constructor has run.
pub fn invoke_stackobject_arguments_with_run_cctor<'l>(
	ctx: &'l Context<'l>,
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	run_class_static_constructor(ctx, method.parent())?;
	invoke_stackobject_arguments_without_run_cctor(ctx, method, params, ret)
}

pub fn invoke_stackobject_arguments_without_run_cctor<'l>(
	ctx: &'l Context<'l>,
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let invoke = method.invoke_fn().ok_or(RtErr::ExecutionEngine)?;
	invoke(ctx, method.method_ptr(), method, params, ret)
}

/// Boxed-argument invocation, the reflection `Invoke` shape: `this`
/// (null for statics) plus one object reference per parameter, value
/// types arriving boxed.
pub fn invoke_object_arguments<'l>(
	ctx: &'l Context<'l>,
	method: &'l RtMethod<'l>,
	this: *mut RtObject<'l>,
	args: &[*mut RtObject<'l>],
) -> RtResult<*mut RtObject<'l>> {
	use crate::metadata::typesig::ElementType;
	if args.len() != method.param_count() {
		return Err(RtErr::Argument);
	}
	run_class_static_constructor(ctx, method.parent())?;

	let mut slots = vec![StackObject::default(); (method.total_arg_stack_size() as usize).max(1)];
	let mut cursor = 0;
	if method.is_instance() {
		if this.is_null() {
			return Err(RtErr::NullReference);
		}
		let mut receiver = this as *mut u8;
		if method.parent().is_value_type() {
			receiver = unsafe { receiver.add(crate::vm::object::OBJECT_HEADER_SIZE) };
		}
		unsafe { eval_stack_op::set_param(slots.as_mut_ptr(), 0, receiver) };
		cursor += 1;
	}

	for (arg, param) in args.iter().zip(method.params.iter().copied()) {
		let param_class = class::class_from_type_sig(ctx, param)?;
		let width = crate::metadata::method::stack_object_size_of_sig(ctx, param)?;
		let slot = unsafe { slots.as_mut_ptr().add(cursor) };
		match param_class.is_value_type() {
			true => {
				crate::vm::object::unbox_any(ctx, *arg, param_class, slot as *mut u8, true)?;
			},
			false => unsafe { eval_stack_op::set_param(slot, 0, *arg) },
		}
		cursor += width as usize;
	}

	let mut ret_slots = vec![StackObject::default(); (method.ret_stack_size() as usize).max(1)];
	invoke_stackobject_arguments_without_run_cctor(ctx, method, slots.as_ptr(), ret_slots.as_mut_ptr())?;

	if method.return_type.element_type == ElementType::Void {
		return Ok(std::ptr::null_mut());
	}
	let ret_class = class::class_from_type_sig(ctx, method.return_type)?;
	match ret_class.is_value_type() {
		true => crate::vm::object::box_object(ctx, ret_class, ret_slots.as_ptr() as *const u8),
		false => Ok(unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(ret_slots.as_ptr(), 0) }),
	}
}

/// `string[]` from host strings, for `Main(string[] args)`.
pub fn new_string_array<'l>(ctx: &'l Context<'l>, values: &[String]) -> RtResult<*mut RtArray<'l>> {
	let types = ctx.corlib_types()?;
	let arr = crate::vm::array::new_array_from_element_class(ctx, types.cls_string, values.len() as i32)?;
	for (i, value) in values.iter().enumerate() {
		let s = crate::vm::string::create_string_from_utf8(ctx, value)?;
		unsafe { crate::vm::array::array_set_at(arr, i as i32, s) };
	}
	Ok(arr)
}

/// Locates the method to run: an explicit `Namespace.Class::Method`
/// override, or the image's entry-point token.
pub fn find_entry_point<'l>(
	ctx: &'l Context<'l>,
	module: &'l Module<'l>,
	override_path: Option<&str>,
) -> RtResult<&'l RtMethod<'l>> {
	if let Some(path) = override_path {
		let (class_path, method_name) = path.rsplit_once("::").ok_or(RtErr::EntryPointNotFound)?;
		let class = module
			.get_class_by_nested_full_name(ctx, class_path, false)?
			.ok_or(RtErr::EntryPointNotFound)?;
		return crate::metadata::method::find_method_by_name(ctx, class, method_name, false)?
			.ok_or(RtErr::EntryPointNotFound);
	}

	let token = module.entry_point_token();
	if token == 0 {
		return Err(RtErr::EntryPointNotFound);
	}
	let token = MetadataToken::try_from(token).map_err(|_| RtErr::BadImageFormat)?;
	if token.kind() != MetadataTokenKind::MethodDef {
		return Err(RtErr::EntryPointNotFound);
	}
	module.get_method_by_rid(ctx, token.index() as u32)
}

/// Runs an assembly's entry point with the configured program args.
/// Returns the managed exit code; an unhandled managed exception goes
/// to the configured reporter first.
pub fn execute_entry_point<'l>(
	ctx: &'l Context<'l>,
	module: &'l Module<'l>,
	override_path: Option<&str>,
) -> RtResult<i32> {
	use crate::metadata::typesig::ElementType;

	let entry = find_entry_point(ctx, module, override_path)?;
	class::initialize_all(ctx, entry.parent())?;
	run_module_static_constructor(ctx, module)?;

	let mut args: Vec<*mut RtObject<'l>> = vec![];
	if entry.param_count() == 1 {
		let program_args = ctx.settings().program_args.clone();
		args.push(new_string_array(ctx, &program_args)? as *mut RtObject<'l>);
	} else if entry.param_count() != 0 {
		return Err(RtErr::EntryPointNotFound);
	}

	let result = invoke_object_arguments(ctx, entry, std::ptr::null_mut(), &args);
	match result {
		Ok(ret) => {
			let code = match entry.return_type.element_type {
				ElementType::I4 => match ret.is_null() {
					true => 0,
					false => unsafe {
						*(crate::vm::object::box_value_data_ptr(ret) as *const i32)
					},
				},
				_ => 0,
			};
			Ok(code)
		},
		Err(err) => {
			let ex = crate::vm::exception::raise_error_as_exception(ctx, err);
			let pending = crate::vm::exception::get_and_clear_current_exception(ctx);
			let ex = match pending.is_null() {
				true => ex,
				false => pending,
			};
			if !ex.is_null() {
				crate::vm::exception::report_unhandled_exception(ctx, ex);
			}
			Err(err)
		},
	}
}
