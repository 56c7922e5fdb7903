use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::{RtException, RtObject};

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_icall("System.Diagnostics.Debugger::get_IsAttached()", IcallEntry::new(debugger_is_attached));
	ctx.register_icall("System.Diagnostics.Debugger::IsLogging()", IcallEntry::new(debugger_is_logging));
	ctx.register_icall("System.Diagnostics.Debugger::Break()", IcallEntry::new(debugger_break));
	ctx.register_icall(
		"System.Diagnostics.StackTrace::GetTrace(System.Exception,int,bool)",
		IcallEntry::new(stack_trace_get_trace),
	);
}

fn debugger_is_attached<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	unsafe { eval_stack_op::set_return(ret, 0i32) };
	Ok(())
}

fn debugger_is_logging<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	unsafe { eval_stack_op::set_return(ret, 0i32) };
	Ok(())
}

fn debugger_break<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	Ok(())
}

/// Converts an exception's captured `trace_ips` into an array of
/// `System.Diagnostics.StackFrame` objects. Source file and line stay
/// zeroed; no debug symbols are consulted.
fn stack_trace_get_trace<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let exception = unsafe { eval_stack_op::get_param::<*mut RtException<'l>>(params, 0) };
	let skip = unsafe { eval_stack_op::get_param::<i32>(params, 1) }.max(0) as usize;

	let frames = match exception.is_null() {
		true => crate::vm::stack_trace::capture_frames(ctx),
		false => crate::vm::stack_trace::decode_trace_ips(unsafe { (*exception).trace_ips }),
	};
	let frames = frames.into_iter().skip(skip).collect::<Vec<_>>();

	let types = ctx.corlib_types()?;
	let arr = crate::vm::array::new_array_from_element_class(ctx, types.cls_stackframe, frames.len() as i32)?;
	for (i, captured) in frames.iter().enumerate() {
		let frame_obj = crate::vm::reflection::new_stack_frame(ctx, captured.method, captured.il_offset)?;
		unsafe {
			crate::vm::array::array_set_at::<*mut RtObject<'l>>(arr, i as i32, frame_obj);
		}
	}
	unsafe { eval_stack_op::set_return(ret, arr) };
	Ok(())
}
