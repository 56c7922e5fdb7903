use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::array;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::{RtArray, RtObject};

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_icall(
		"System.Array::FastCopy(System.Array,int,System.Array,int,int)",
		IcallEntry::new(fast_copy),
	);
	ctx.register_icall("System.Array::ClearInternal(System.Array,int,int)", IcallEntry::new(clear_internal));
	ctx.register_icall("System.Array::GetLength(int)", IcallEntry::new(get_length));
	ctx.register_icall("System.Array::GetLowerBound(int)", IcallEntry::new(get_lower_bound));
	ctx.register_icall("System.Array::get_Rank()", IcallEntry::new(get_rank));
	ctx.register_icall("System.Array::get_Length()", IcallEntry::new(get_total_length));
	ctx.register_icall("System.Array::GetValueImpl(int)", IcallEntry::new(get_value_impl));
	ctx.register_icall("System.Array::SetValueImpl(object,int)", IcallEntry::new(set_value_impl));
	ctx.register_icall("System.Array::Clone()", IcallEntry::new(clone));
}

fn this_array<'l>(params: *const StackObject) -> RtResult<*mut RtArray<'l>> {
	let arr = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	match arr.is_null() {
		true => Err(RtErr::NullReference),
		false => Ok(arr),
	}
}

fn fast_copy<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let src = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	let src_index = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
	let dst = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 2) };
	let dst_index = unsafe { eval_stack_op::get_param::<i32>(params, 3) };
	let length = unsafe { eval_stack_op::get_param::<i32>(params, 4) };
	let copied = array::fast_copy(src, src_index, dst, dst_index, length)?;
	unsafe { eval_stack_op::set_return(ret, copied as i32) };
	Ok(())
}

fn clear_internal<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	let arr = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	let index = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
	let length = unsafe { eval_stack_op::get_param::<i32>(params, 2) };
	array::clear_internal(arr, index, length)
}

fn get_length<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arr = this_array(params)?;
	let dimension = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
	if dimension < 0 {
		return Err(RtErr::IndexOutOfRange);
	}
	let length = array::array_length_at_dimension(arr, dimension as usize)?;
	unsafe { eval_stack_op::set_return(ret, length) };
	Ok(())
}

fn get_lower_bound<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arr = this_array(params)?;
	let dimension = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
	if dimension < 0 {
		return Err(RtErr::IndexOutOfRange);
	}
	let bound = array::array_lower_bound_at_dimension(arr, dimension as usize)?;
	unsafe { eval_stack_op::set_return(ret, bound) };
	Ok(())
}

fn get_rank<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arr = this_array(params)?;
	let rank = unsafe { (*arr).header.klass.rank() };
	unsafe { eval_stack_op::set_return(ret, rank as i32) };
	Ok(())
}

fn get_total_length<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arr = this_array(params)?;
	unsafe { eval_stack_op::set_return(ret, array::array_length(arr)) };
	Ok(())
}

fn get_value_impl<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arr = this_array(params)?;
	let index = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
	let boxed = array::array_get_value_boxed(ctx, arr, index)?;
	unsafe { eval_stack_op::set_return(ret, boxed) };
	Ok(())
}

fn set_value_impl<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	let arr = this_array(params)?;
	let value = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 1) };
	let index = unsafe { eval_stack_op::get_param::<i32>(params, 2) };
	if !array::is_valid_index(arr, index) {
		return Err(RtErr::IndexOutOfRange);
	}

	let element = array::array_element_class(arr);
	let dst = array::array_element_ptr(arr, index);
	match element.is_value_type() {
		true => crate::vm::object::unbox_any(ctx, value, element, dst, false),
		false => {
			if !value.is_null() {
				let value_class = unsafe { (*value).klass };
				if !crate::metadata::class::is_assignable_from(value_class, element) {
					return Err(RtErr::InvalidCast);
				}
			}
			crate::vm::gc::GarbageCollector::write_barrier(dst as *mut *mut RtObject<'l>, value);
			Ok(())
		},
	}
}

fn clone<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arr = this_array(params)?;
	let cloned = array::clone_array(arr)?;
	unsafe { eval_stack_op::set_return(ret, cloned) };
	Ok(())
}
