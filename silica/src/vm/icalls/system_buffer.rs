use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::array;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::RtArray;

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_icall(
		"System.Buffer::BlockCopy(System.Array,int,System.Array,int,int)",
		IcallEntry::new(block_copy),
	);
	ctx.register_icall("System.Buffer::_ByteLength(System.Array)", IcallEntry::new(byte_length));
	ctx.register_icall("System.Buffer::Memcpy(byte*,byte*,int)", IcallEntry::new(memcpy));
}

fn byte_length_of(arr: *mut RtArray) -> RtResult<i64> {
	if arr.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	Ok(array::array_length(arr) as i64 * array::array_element_size(arr) as i64)
}

fn block_copy<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	let src = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	let src_offset = unsafe { eval_stack_op::get_param::<i32>(params, 1) } as i64;
	let dst = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 2) };
	let dst_offset = unsafe { eval_stack_op::get_param::<i32>(params, 3) } as i64;
	let count = unsafe { eval_stack_op::get_param::<i32>(params, 4) } as i64;

	if src_offset < 0 || dst_offset < 0 || count < 0 {
		return Err(RtErr::ArgumentOutOfRange);
	}
	if src_offset + count > byte_length_of(src)? || dst_offset + count > byte_length_of(dst)? {
		return Err(RtErr::Argument);
	}

	unsafe {
		std::ptr::copy(
			array::array_data_ptr(src).add(src_offset as usize),
			array::array_data_ptr(dst).add(dst_offset as usize),
			count as usize,
		);
	}
	Ok(())
}

fn byte_length<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arr = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	let length = byte_length_of(arr)?;
	unsafe { eval_stack_op::set_return(ret, length as i32) };
	Ok(())
}

fn memcpy<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	let dst = unsafe { eval_stack_op::get_param::<*mut u8>(params, 0) };
	let src = unsafe { eval_stack_op::get_param::<*const u8>(params, 1) };
	let count = unsafe { eval_stack_op::get_param::<i32>(params, 2) };
	if dst.is_null() || src.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	if count < 0 {
		return Err(RtErr::ArgumentOutOfRange);
	}
	unsafe { std::ptr::copy(src, dst, count as usize) };
	Ok(())
}
