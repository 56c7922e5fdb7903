use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::delegate;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::{RtDelegate, RtMulticastDelegate};

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_icall(
		"System.Delegate::AllocDelegateLike_internal(System.Delegate)",
		IcallEntry::new(alloc_delegate_like),
	);
	ctx.register_icall(
		"System.Delegate::CombineImpl(System.Delegate)",
		IcallEntry::new(combine_impl),
	);
	ctx.register_icall(
		"System.Delegate::GetVirtualMethod_internal()",
		IcallEntry::new(crate::vm::icalls::not_implemented_invoker),
	);
}

fn alloc_delegate_like<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let source = unsafe { eval_stack_op::get_param::<*mut RtDelegate<'l>>(params, 0) };
	let clone = delegate::allocate_delegate_like(ctx, source)?;
	unsafe { eval_stack_op::set_return(ret, clone) };
	Ok(())
}

fn combine_impl<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let this = unsafe { eval_stack_op::get_param::<*mut RtMulticastDelegate<'l>>(params, 0) };
	let other = unsafe { eval_stack_op::get_param::<*mut RtMulticastDelegate<'l>>(params, 1) };
	if this.is_null() {
		return Err(RtErr::NullReference);
	}
	let combined = delegate::combine_delegates(ctx, this, other)?;
	unsafe { eval_stack_op::set_return(ret, combined) };
	Ok(())
}
