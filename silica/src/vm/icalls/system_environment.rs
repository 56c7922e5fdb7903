use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_icall("System.Environment::get_ProcessorCount()", IcallEntry::new(processor_count));
	ctx.register_icall("System.Environment::get_TickCount()", IcallEntry::new(tick_count));
	ctx.register_icall("System.Environment::GetCommandLineArgs()", IcallEntry::new(command_line_args));
	ctx.register_icall("System.Environment::get_HasShutdownStarted()", IcallEntry::new(has_shutdown_started));
	ctx.register_icall("System.Environment::FailFast(string)", IcallEntry::new(fail_fast));
	ctx.register_icall("System.Environment::GetEnvironmentVariable(string)", IcallEntry::new(get_environment_variable));
}

fn processor_count<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	// The execution model is single-threaded regardless of hardware.
	unsafe { eval_stack_op::set_return(ret, 1i32) };
	Ok(())
}

fn tick_count<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let millis = std::time::UNIX_EPOCH
		.elapsed()
		.map(|d| d.as_millis() as i32)
		.unwrap_or(0);
	unsafe { eval_stack_op::set_return(ret, millis) };
	Ok(())
}

fn command_line_args<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let args = ctx.settings().program_args.clone();
	let arr = crate::vm::runtime::new_string_array(ctx, &args)?;
	unsafe { eval_stack_op::set_return(ret, arr) };
	Ok(())
}

fn has_shutdown_started<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	unsafe { eval_stack_op::set_return(ret, 0i32) };
	Ok(())
}

fn fail_fast<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	Err(RtErr::ExecutionEngine)
}

fn get_environment_variable<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	use crate::vm::object::RtString;
	let name = unsafe { eval_stack_op::get_param::<*mut RtString<'l>>(params, 0) };
	if name.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	let name = crate::vm::string::string_to_rust(name);
	let result = match std::env::var(&name) {
		Ok(value) => crate::vm::string::create_string_from_utf8(ctx, &value)?,
		Err(_) => std::ptr::null_mut(),
	};
	unsafe { eval_stack_op::set_return(ret, result) };
	Ok(())
}
