use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::RtObject;
use crate::vm::reflection::{self, RtReflectionAssembly, RtReflectionType};

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_icall(
		"System.Reflection.Assembly::GetExecutingAssembly()",
		IcallEntry::new(get_executing_assembly),
	);
	ctx.register_icall(
		"System.Reflection.Assembly::GetEntryAssembly()",
		IcallEntry::new(get_entry_assembly),
	);
	ctx.register_icall("System.Type::internal_from_handle(intptr)", IcallEntry::new(type_from_handle));
	ctx.register_icall("System.RuntimeType::get_Name()", IcallEntry::new(runtime_type_name));
	ctx.register_icall("System.RuntimeType::get_Namespace()", IcallEntry::new(runtime_type_namespace));
	ctx.register_icall(
		"System.MonoCustomAttrs::GetCustomAttributesInternal(System.Reflection.ICustomAttributeProvider,System.Type,bool)",
		IcallEntry::new(get_custom_attributes),
	);
	ctx.register_icall(
		"System.MonoCustomAttrs::GetCustomAttributesDataInternal(System.Reflection.ICustomAttributeProvider)",
		IcallEntry::new(get_custom_attributes_data),
	);
}

fn get_executing_assembly<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	// The topmost managed frame's module is the executing assembly.
	let frames = crate::vm::stack_trace::capture_frames(ctx);
	let module = match frames.first() {
		Some(frame) => frame.method.parent().module(),
		None => ctx.corlib_module()?,
	};
	let assembly = reflection::assembly_object_of_module(ctx, module)?;
	unsafe { eval_stack_op::set_return(ret, assembly) };
	Ok(())
}

fn get_entry_assembly<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	// Module 1 is the first user assembly (0 is the corlib).
	let module = ctx.module_by_id(1).or(ctx.module_by_id(0)).ok_or(RtErr::ExecutionEngine)?;
	let assembly: *mut RtReflectionAssembly<'l> = reflection::assembly_object_of_module(ctx, module)?;
	unsafe { eval_stack_op::set_return(ret, assembly) };
	Ok(())
}

fn type_from_handle<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	use crate::metadata::typesig::TypeSig;
	let handle = unsafe { eval_stack_op::get_param::<*const TypeSig<'l>>(params, 0) };
	if handle.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	let class = crate::metadata::class::class_from_type_sig(ctx, unsafe { &*handle })?;
	let reflected: *mut RtReflectionType<'l> = reflection::type_object_of_class(ctx, class)?;
	unsafe { eval_stack_op::set_return(ret, reflected) };
	Ok(())
}

fn this_type<'l>(ctx: &'l Context<'l>, params: *const StackObject) -> RtResult<&'l crate::metadata::class::RtClass<'l>> {
	let this = unsafe { eval_stack_op::get_param::<*mut RtReflectionType<'l>>(params, 0) };
	if this.is_null() {
		return Err(RtErr::NullReference);
	}
	let handle = unsafe { (*this).type_handle };
	if handle.is_null() {
		return Err(RtErr::ExecutionEngine);
	}
	crate::metadata::class::class_from_type_sig(ctx, unsafe { &*handle })
}

fn runtime_type_name<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let class = this_type(ctx, params)?;
	let name = crate::vm::string::create_string_from_utf8(ctx, class.name)?;
	unsafe { eval_stack_op::set_return(ret, name) };
	Ok(())
}

fn runtime_type_namespace<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let class = this_type(ctx, params)?;
	let namespace = crate::vm::string::create_string_from_utf8(ctx, class.namespace)?;
	unsafe { eval_stack_op::set_return(ret, namespace) };
	Ok(())
}

fn get_custom_attributes<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let provider = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	let attr_type = unsafe { eval_stack_op::get_param::<*mut RtReflectionType<'l>>(params, 1) };
	let arr = crate::vm::custom_attribute::get_custom_attributes_on_provider(ctx, provider, attr_type)?;
	unsafe { eval_stack_op::set_return(ret, arr) };
	Ok(())
}

fn get_custom_attributes_data<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let provider = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	let arr = crate::vm::custom_attribute::get_custom_attributes_data_on_provider(ctx, provider)?;
	unsafe { eval_stack_op::set_return(ret, arr) };
	Ok(())
}
