use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::RtClass;
use crate::metadata::method::{get_virtual_method_impl, RtMethod};
use crate::vm::gc::GarbageCollector;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::{self, RtArray, RtDelegate, RtMulticastDelegate, RtObject, OBJECT_HEADER_SIZE};

/// Staging room for intermediate multicast returns; only the last
/// subscriber's value survives.
const MAX_DELEGATE_RESULT_SLOTS: usize = 1024;

/// Binds `(target, method)` into a delegate. Virtual methods resolve
/// against the target's dynamic class right here, so each invocation
/// skips the vtable.
pub fn constructor_delegate<'l>(
	ctx: &'l Context<'l>,
	del: *mut RtMulticastDelegate<'l>,
	target: *mut RtObject<'l>,
	method: &'l RtMethod<'l>,
) -> RtResult<()> {
	let sub = unsafe { &mut (*del).dele };
	GarbageCollector::write_barrier(
		std::ptr::addr_of_mut!(sub.target) as *mut *mut RtObject<'l>,
		target,
	);
	if method.is_virtual() && !target.is_null() {
		let target_class = unsafe { (*target).klass };
		sub.method = get_virtual_method_impl(ctx, target_class, method)?;
		sub.method_is_virtual = false;
	} else {
		sub.method = method;
		sub.method_is_virtual = method.is_virtual();
	}
	Ok(())
}

pub fn new_delegate<'l>(
	ctx: &'l Context<'l>,
	delegate_class: &'l RtClass<'l>,
	target: *mut RtObject<'l>,
	method: &'l RtMethod<'l>,
) -> RtResult<*mut RtMulticastDelegate<'l>> {
	let obj = object::new_object(ctx, delegate_class)?;
	let del = obj as *mut RtMulticastDelegate<'l>;
	constructor_delegate(ctx, del, target, method)?;
	Ok(del)
}

/// Invoker behind delegate `.ctor(object, native int)` call sites where
/// the instance already exists.
pub(crate) fn delegate_ctor_invoker<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let del = unsafe { eval_stack_op::get_param::<*mut RtMulticastDelegate<'l>>(params, 0) };
	let target = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 1) };
	let method = unsafe { eval_stack_op::get_param::<*const RtMethod<'l>>(params, 2) };
	if del.is_null() || method.is_null() {
		return Err(RtErr::NullReference);
	}
	constructor_delegate(ctx, del, target, unsafe { &*method })?;
	unsafe { eval_stack_op::set_return(ret, del) };
	Ok(())
}

/// `newobj` path: allocates the delegate and binds in one step.
pub(crate) fn newobj_delegate_invoker<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let target = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	let bound_method = unsafe { eval_stack_op::get_param::<*const RtMethod<'l>>(params, 1) };
	if bound_method.is_null() {
		return Err(RtErr::NullReference);
	}
	let del = new_delegate(ctx, method.parent(), target, unsafe { &*bound_method })?;
	unsafe { eval_stack_op::set_return(ret, del) };
	Ok(())
}

/// `Invoke` fan-out. Single-cast delegates run their embedded slot;
/// multicast delegates walk `deles` in subscription order. Argument
/// buffers shift by one slot to absorb the open/closed mismatch between
/// the delegate signature and each leaf target.
pub(crate) fn delegate_invoke_invoker<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let args = params as *mut StackObject;
	let del = unsafe { eval_stack_op::get_param::<*mut RtMulticastDelegate<'l>>(args, 0) };
	if del.is_null() {
		return Err(RtErr::NullReference);
	}

	let single = unsafe { std::ptr::addr_of_mut!((*del).dele) };
	let (leafs, count): (*mut *mut RtDelegate<'l>, usize) = unsafe {
		match (*del).deles.is_null() {
			true => (std::ptr::null_mut(), 1),
			false => {
				let arr = (*del).deles;
				(
					crate::vm::array::array_data_ptr(arr) as *mut *mut RtDelegate<'l>,
					crate::vm::array::array_length(arr) as usize,
				)
			},
		}
	};

	let delegate_param_count = method.param_count() as isize;
	let mut staged = vec![StackObject::default(); MAX_DELEGATE_RESULT_SLOTS];

	for i in 0..count {
		let leaf: *mut RtDelegate<'l> = match leafs.is_null() {
			true => single,
			false => unsafe { *leafs.add(i) },
		};
		let (target_method, target_obj) = unsafe { ((*leaf).method, (*leaf).target) };
		if target_method.is_null() {
			return Err(RtErr::NullReference);
		}
		let target_method = unsafe { &*target_method };

		let final_args = match delegate_param_count - target_method.param_count() as isize {
			0 => match target_method.is_instance() {
				true => {
					if target_obj.is_null() {
						return Err(RtErr::NullReference);
					}
					let mut this_ptr = target_obj;
					if target_method.parent().is_value_type() {
						// Value-type receivers take a payload pointer.
						this_ptr = unsafe { (target_obj as *mut u8).add(OBJECT_HEADER_SIZE) } as *mut RtObject<'l>;
					}
					unsafe { eval_stack_op::set_param(args, 0, this_ptr) };
					args
				},
				false => unsafe { args.add(1) },
			},
			1 => {
				// Open instance delegate: the first delegate argument is
				// the receiver.
				debug_assert!(target_method.is_instance());
				let this_obj = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(args, 1) };
				if this_obj.is_null() {
					return Err(RtErr::NullReference);
				}
				unsafe { args.add(1) }
			},
			-1 => {
				// Closed delegate over a static method: the bound target
				// becomes the first argument.
				debug_assert!(target_method.is_static());
				unsafe { eval_stack_op::set_param(args, 0, target_obj) };
				args
			},
			_ => return Err(RtErr::ExecutionEngine),
		};

		let invoke = target_method.invoke_fn().ok_or(RtErr::ExecutionEngine)?;
		invoke(ctx, target_method.method_ptr(), target_method, final_args, staged.as_mut_ptr())?;
	}

	// Only the final invocation's return value is observable.
	if method.ret_stack_size() > 0 {
		unsafe {
			std::ptr::copy_nonoverlapping(
				staged.as_ptr(),
				ret,
				method.ret_stack_size() as usize,
			);
		}
	}
	Ok(())
}

pub(crate) fn delegate_begin_invoke_invoker<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	Err(RtErr::NotImplemented)
}

pub(crate) fn delegate_end_invoke_invoker<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	Err(RtErr::NotImplemented)
}

/// Clones `source`'s dynamic class into a fresh, unbound delegate
/// (`AllocDelegateLike_internal`).
pub fn allocate_delegate_like<'l>(
	ctx: &'l Context<'l>,
	source: *mut RtDelegate<'l>,
) -> RtResult<*mut RtMulticastDelegate<'l>> {
	if source.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	let klass = unsafe { (*source).header.klass };
	Ok(object::new_object(ctx, klass)? as *mut RtMulticastDelegate<'l>)
}

/// Combines subscription lists into a fresh multicast delegate.
pub fn combine_delegates<'l>(
	ctx: &'l Context<'l>,
	a: *mut RtMulticastDelegate<'l>,
	b: *mut RtMulticastDelegate<'l>,
) -> RtResult<*mut RtMulticastDelegate<'l>> {
	if a.is_null() {
		return Ok(b);
	}
	if b.is_null() {
		return Ok(a);
	}

	let flatten = |del: *mut RtMulticastDelegate<'l>, out: &mut Vec<*mut RtDelegate<'l>>| unsafe {
		match (*del).deles.is_null() {
			true => out.push(del as *mut RtDelegate<'l>),
			false => {
				let arr = (*del).deles;
				for i in 0..crate::vm::array::array_length(arr) {
					out.push(crate::vm::array::array_get_at::<*mut RtDelegate<'l>>(arr, i));
				}
			},
		}
	};

	let mut all = Vec::new();
	flatten(a, &mut all);
	flatten(b, &mut all);

	let klass = unsafe { (*a).dele.header.klass };
	let combined = object::new_object(ctx, klass)? as *mut RtMulticastDelegate<'l>;
	unsafe {
		(*combined).dele.method = (*(all[0])).method;
		(*combined).dele.target = (*(all[0])).target;
		(*combined).dele.method_is_virtual = (*(all[0])).method_is_virtual;
	}

	let types = ctx.corlib_types()?;
	let arr = crate::vm::array::new_array_from_element_class(ctx, types.cls_delegate, all.len() as i32)?;
	for (i, leaf) in all.iter().enumerate() {
		unsafe { crate::vm::array::array_set_at(arr, i as i32, *leaf) };
	}
	unsafe {
		GarbageCollector::write_barrier(
			std::ptr::addr_of_mut!((*combined).deles) as *mut *mut RtObject<'l>,
			arr as *mut RtObject<'l>,
		);
	}
	Ok(combined)
}
