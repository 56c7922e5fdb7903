use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::{RtArray, RtString};
use crate::vm::string;

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_icall("System.String::FastAllocateString(int)", IcallEntry::new(fast_allocate));
	ctx.register_icall("System.String::InternalIntern(string)", IcallEntry::new(intern));
	ctx.register_icall("System.String::InternalIsInterned(string)", IcallEntry::new(is_interned));
	ctx.register_icall("System.String::GetLegacyNonRandomizedHashCode()", IcallEntry::new(legacy_hash_code));

	// Constructors that must allocate the instance themselves.
	ctx.register_newobj("System.String::.ctor(char[])", IcallEntry::new(ctor_char_array));
	ctx.register_newobj("System.String::.ctor(char[],int,int)", IcallEntry::new(ctor_char_array_range));
	ctx.register_newobj("System.String::.ctor(char,int)", IcallEntry::new(ctor_char_count));
}

fn fast_allocate<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let length = unsafe { eval_stack_op::get_param::<i32>(params, 0) };
	let s = string::fast_allocate_string(ctx, length)?;
	unsafe { eval_stack_op::set_return(ret, s) };
	Ok(())
}

fn intern<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let s = unsafe { eval_stack_op::get_param::<*mut RtString<'l>>(params, 0) };
	unsafe { eval_stack_op::set_return(ret, string::intern_string(ctx, s)) };
	Ok(())
}

fn is_interned<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let s = unsafe { eval_stack_op::get_param::<*mut RtString<'l>>(params, 0) };
	let result = match string::is_interned_string(ctx, s) {
		true => s,
		false => std::ptr::null_mut(),
	};
	unsafe { eval_stack_op::set_return(ret, result) };
	Ok(())
}

fn legacy_hash_code<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let this = unsafe { eval_stack_op::get_param::<*const RtString<'l>>(params, 0) };
	if this.is_null() {
		return Err(RtErr::NullReference);
	}
	unsafe { eval_stack_op::set_return(ret, string::get_hash_code(this)) };
	Ok(())
}

fn chars_of<'l>(arr: *mut RtArray<'l>) -> RtResult<&'l [u16]> {
	if arr.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	let length = crate::vm::array::array_length(arr) as usize;
	let data = crate::vm::array::array_data_ptr(arr) as *const u16;
	Ok(unsafe { std::slice::from_raw_parts(data, length) })
}

fn ctor_char_array<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arr = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	let s = match arr.is_null() {
		true => string::empty_string(ctx)?,
		false => string::create_string_from_utf16(ctx, chars_of(arr)?)?,
	};
	unsafe { eval_stack_op::set_return(ret, s) };
	Ok(())
}

fn ctor_char_array_range<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let arr = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	let start = unsafe { eval_stack_op::get_param::<i32>(params, 1) } as usize;
	let length = unsafe { eval_stack_op::get_param::<i32>(params, 2) } as usize;
	let chars = chars_of(arr)?;
	let slice = chars
		.get(start..start + length)
		.ok_or(RtErr::ArgumentOutOfRange)?;
	let s = string::create_string_from_utf16(ctx, slice)?;
	unsafe { eval_stack_op::set_return(ret, s) };
	Ok(())
}

fn ctor_char_count<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let ch = unsafe { eval_stack_op::get_param::<u16>(params, 0) };
	let count = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
	if count < 0 {
		return Err(RtErr::ArgumentOutOfRange);
	}
	let chars = vec![ch; count as usize];
	let s = string::create_string_from_utf16(ctx, &chars)?;
	unsafe { eval_stack_op::set_return(ret, s) };
	Ok(())
}
