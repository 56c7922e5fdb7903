use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::{RtArray, RtObject};

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_icall(
		"System.Runtime.CompilerServices.RuntimeHelpers::InitializeArray(System.Array,intptr)",
		IcallEntry::new(initialize_array),
	);
	ctx.register_icall(
		"System.Runtime.CompilerServices.RuntimeHelpers::get_OffsetToStringData()",
		IcallEntry::new(offset_to_string_data),
	);
	ctx.register_icall(
		"System.Runtime.CompilerServices.RuntimeHelpers::GetObjectValue(object)",
		IcallEntry::new(get_object_value),
	);

	// Monitor enter/exit collapse to no-ops in the cooperative
	// single-threaded model.
	ctx.register_icall("System.Threading.Monitor::Enter(object)", IcallEntry::new(monitor_noop));
	ctx.register_icall("System.Threading.Monitor::Enter(object,bool&)", IcallEntry::new(monitor_enter_flag));
	ctx.register_icall("System.Threading.Monitor::Exit(object)", IcallEntry::new(monitor_noop));

	ctx.register_icall(
		"System.Runtime.InteropServices.RuntimeInformation::GetRuntimeArchitecture()",
		IcallEntry::new(runtime_architecture),
	);
}

/// `ldtoken`-driven static array initialization: the field's RVA bytes
/// blit straight over the array elements.
fn initialize_array<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	use crate::metadata::class::RtField;
	let arr = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	let field = unsafe { eval_stack_op::get_param::<*const RtField<'l>>(params, 1) };
	if arr.is_null() || field.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	let field = unsafe { &*field };
	let data = crate::vm::field::get_field_rva_data(field)?;

	let total = crate::vm::array::array_length(arr) as usize * crate::vm::array::array_element_size(arr);
	if data.len() < total {
		return Err(RtErr::Argument);
	}
	unsafe {
		std::ptr::copy_nonoverlapping(data.as_ptr(), crate::vm::array::array_data_ptr(arr), total);
	}
	Ok(())
}

fn offset_to_string_data<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let offset = std::mem::offset_of!(crate::vm::object::RtString, first_char) as i32;
	unsafe { eval_stack_op::set_return(ret, offset) };
	Ok(())
}

fn get_object_value<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let obj = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	let result = match obj.is_null() {
		true => obj,
		false => {
			let klass = unsafe { (*obj).klass };
			match klass.is_value_type() && !klass.is_enum() {
				true => crate::vm::object::clone_object(ctx, obj)?,
				false => obj,
			}
		},
	};
	unsafe { eval_stack_op::set_return(ret, result) };
	Ok(())
}

fn monitor_noop<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	let obj = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	match obj.is_null() {
		true => Err(RtErr::ArgumentNull),
		false => Ok(()),
	}
}

fn monitor_enter_flag<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	let obj = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	let taken = unsafe { eval_stack_op::get_param::<*mut u8>(params, 1) };
	if obj.is_null() || taken.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	unsafe { *taken = 1 };
	Ok(())
}

fn runtime_architecture<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arch = crate::vm::string::create_string_from_utf8(ctx, std::env::consts::ARCH)?;
	unsafe { eval_stack_op::set_return(ret, arch) };
	Ok(())
}
