use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::RtObject;

/// Intrinsic entries shadow ordinary IL bodies, but only for methods
/// the metadata marks with `IntrinsicAttribute`.
pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_intrinsic("System.Object::.ctor()", IcallEntry::new(object_ctor));

	macro_rules! volatile_pair {
		($read_sig:literal, $write_sig:literal, $ty:ty) => {
			ctx.register_intrinsic($read_sig, IcallEntry::new(volatile_read::<$ty>));
			ctx.register_intrinsic($write_sig, IcallEntry::new(volatile_write::<$ty>));
		};
	}

	volatile_pair!("System.Threading.Volatile::Read(bool&)", "System.Threading.Volatile::Write(bool&,bool)", u8);
	volatile_pair!("System.Threading.Volatile::Read(byte&)", "System.Threading.Volatile::Write(byte&,byte)", u8);
	volatile_pair!("System.Threading.Volatile::Read(sbyte&)", "System.Threading.Volatile::Write(sbyte&,sbyte)", i8);
	volatile_pair!("System.Threading.Volatile::Read(short&)", "System.Threading.Volatile::Write(short&,short)", i16);
	volatile_pair!("System.Threading.Volatile::Read(ushort&)", "System.Threading.Volatile::Write(ushort&,ushort)", u16);
	volatile_pair!("System.Threading.Volatile::Read(int&)", "System.Threading.Volatile::Write(int&,int)", i32);
	volatile_pair!("System.Threading.Volatile::Read(uint&)", "System.Threading.Volatile::Write(uint&,uint)", u32);
	volatile_pair!("System.Threading.Volatile::Read(long&)", "System.Threading.Volatile::Write(long&,long)", i64);
	volatile_pair!("System.Threading.Volatile::Read(ulong&)", "System.Threading.Volatile::Write(ulong&,ulong)", u64);
	volatile_pair!("System.Threading.Volatile::Read(intptr&)", "System.Threading.Volatile::Write(intptr&,intptr)", isize);
	volatile_pair!("System.Threading.Volatile::Read(uintptr&)", "System.Threading.Volatile::Write(uintptr&,uintptr)", usize);
	volatile_pair!("System.Threading.Volatile::Read(float&)", "System.Threading.Volatile::Write(float&,float)", u32);
	volatile_pair!("System.Threading.Volatile::Read(double&)", "System.Threading.Volatile::Write(double&,double)", u64);
	volatile_pair!("System.Threading.Volatile::Read(!!0&)", "System.Threading.Volatile::Write(!!0&,!!0)", usize);

	ctx.register_intrinsic("System.Threading.Interlocked::Increment(int&)", IcallEntry::new(interlocked_add_i32_one));
	ctx.register_intrinsic("System.Threading.Interlocked::Decrement(int&)", IcallEntry::new(interlocked_sub_i32_one));
	ctx.register_intrinsic("System.Threading.Interlocked::Add(int&,int)", IcallEntry::new(interlocked_add_i32));
	ctx.register_intrinsic("System.Threading.Interlocked::Exchange(int&,int)", IcallEntry::new(interlocked_exchange_i32));
	ctx.register_intrinsic(
		"System.Threading.Interlocked::CompareExchange(int&,int,int)",
		IcallEntry::new(interlocked_compare_exchange_i32),
	);
	ctx.register_intrinsic(
		"System.Threading.Interlocked::Exchange(object&,object)",
		IcallEntry::new(interlocked_exchange_object),
	);
	ctx.register_intrinsic(
		"System.Threading.Interlocked::CompareExchange(object&,object,object)",
		IcallEntry::new(interlocked_compare_exchange_object),
	);
}

/// `System.Object..ctor` does nothing; skipping the interpreter round
/// trip keeps every allocation from paying for an empty body.
fn object_ctor<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	Ok(())
}

fn volatile_read<'l, T: Copy>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let location = unsafe { eval_stack_op::get_param::<*const T>(params, 0) };
	if location.is_null() {
		return Err(RtErr::NullReference);
	}
	let value = unsafe { std::ptr::read_volatile(location) };
	unsafe { eval_stack_op::set_return(ret, value) };
	Ok(())
}

fn volatile_write<'l, T: Copy>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	let location = unsafe { eval_stack_op::get_param::<*mut T>(params, 0) };
	if location.is_null() {
		return Err(RtErr::NullReference);
	}
	let value = unsafe { eval_stack_op::get_param::<T>(params, 1) };
	unsafe { std::ptr::write_volatile(location, value) };
	Ok(())
}

fn interlocked_location<'l>(params: *const StackObject) -> RtResult<*mut i32> {
	let location = unsafe { eval_stack_op::get_param::<*mut i32>(params, 0) };
	match location.is_null() {
		true => Err(RtErr::NullReference),
		false => Ok(location),
	}
}

// Single-threaded model: the "interlocked" shapes are ordinary
// read-modify-write sequences.

fn interlocked_add_i32_one<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let location = interlocked_location(params)?;
	let value = unsafe { (*location).wrapping_add(1) };
	unsafe {
		*location = value;
		eval_stack_op::set_return(ret, value);
	}
	Ok(())
}

fn interlocked_sub_i32_one<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let location = interlocked_location(params)?;
	let value = unsafe { (*location).wrapping_sub(1) };
	unsafe {
		*location = value;
		eval_stack_op::set_return(ret, value);
	}
	Ok(())
}

fn interlocked_add_i32<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let location = interlocked_location(params)?;
	let addend = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
	let value = unsafe { (*location).wrapping_add(addend) };
	unsafe {
		*location = value;
		eval_stack_op::set_return(ret, value);
	}
	Ok(())
}

fn interlocked_exchange_i32<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let location = interlocked_location(params)?;
	let value = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
	let old = unsafe { *location };
	unsafe {
		*location = value;
		eval_stack_op::set_return(ret, old);
	}
	Ok(())
}

fn interlocked_compare_exchange_i32<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let location = interlocked_location(params)?;
	let value = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
	let comparand = unsafe { eval_stack_op::get_param::<i32>(params, 2) };
	let old = unsafe { *location };
	if old == comparand {
		unsafe { *location = value };
	}
	unsafe { eval_stack_op::set_return(ret, old) };
	Ok(())
}

fn interlocked_exchange_object<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let location = unsafe { eval_stack_op::get_param::<*mut *mut RtObject<'l>>(params, 0) };
	if location.is_null() {
		return Err(RtErr::NullReference);
	}
	let value = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 1) };
	let old = unsafe { *location };
	crate::vm::gc::GarbageCollector::write_barrier(location, value);
	unsafe { eval_stack_op::set_return(ret, old) };
	Ok(())
}

fn interlocked_compare_exchange_object<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let location = unsafe { eval_stack_op::get_param::<*mut *mut RtObject<'l>>(params, 0) };
	if location.is_null() {
		return Err(RtErr::NullReference);
	}
	let value = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 1) };
	let comparand = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 2) };
	let old = unsafe { *location };
	if std::ptr::eq(old, comparand) {
		crate::vm::gc::GarbageCollector::write_barrier(location, value);
	}
	unsafe { eval_stack_op::set_return(ret, old) };
	Ok(())
}
