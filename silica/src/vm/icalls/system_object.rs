use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::{self, RtObject};

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	ctx.register_icall("System.Object::MemberwiseClone()", IcallEntry::new(memberwise_clone));
	ctx.register_icall("System.Object::GetType()", IcallEntry::new(get_type));
	ctx.register_icall("System.Object::InternalGetHashCode(object)", IcallEntry::new(internal_get_hash_code));
	ctx.register_icall("System.ValueType::InternalGetHashCode(object,object[]&)", IcallEntry::new(value_type_get_hash_code));
	ctx.register_icall("System.ValueType::InternalEquals(object,object,object[]&)", IcallEntry::new(value_type_equals));
	ctx.register_icall("System.TypedReference::InternalToObject(void*)", IcallEntry::new(typed_reference_to_object));
}

fn memberwise_clone<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let this = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	if this.is_null() {
		return Err(RtErr::NullReference);
	}
	let clone = object::clone_object(ctx, this)?;
	unsafe { eval_stack_op::set_return(ret, clone) };
	Ok(())
}

fn get_type<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let this = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	if this.is_null() {
		return Err(RtErr::NullReference);
	}
	let klass = unsafe { (*this).klass };
	let reflected = crate::vm::reflection::type_object_of_class(ctx, klass)?;
	unsafe { eval_stack_op::set_return(ret, reflected) };
	Ok(())
}

fn internal_get_hash_code<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let obj = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	// Address-derived identity hash; the plain allocator never moves
	// objects.
	let hash = (obj as usize as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
	unsafe { eval_stack_op::set_return(ret, hash as i32) };
	Ok(())
}

fn value_type_get_hash_code<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let this = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	if this.is_null() {
		return Err(RtErr::NullReference);
	}
	let klass = unsafe { (*this).klass };
	let data = object::box_value_data_ptr(this);
	let bytes = unsafe { std::slice::from_raw_parts(data, klass.instance_size() as usize) };
	let mut hash: u32 = 2166136261;
	for byte in bytes {
		hash ^= *byte as u32;
		hash = hash.wrapping_mul(16777619);
	}
	unsafe { eval_stack_op::set_return(ret, hash as i32) };
	Ok(())
}

fn value_type_equals<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let this = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 0) };
	let other = unsafe { eval_stack_op::get_param::<*mut RtObject<'l>>(params, 1) };
	if this.is_null() {
		return Err(RtErr::NullReference);
	}
	let equal = !other.is_null() && {
		let this_class = unsafe { (*this).klass };
		let other_class = unsafe { (*other).klass };
		std::ptr::eq(this_class, other_class) && unsafe {
			let a = object::box_value_data_ptr(this);
			let b = object::box_value_data_ptr(other);
			std::slice::from_raw_parts(a, this_class.instance_size() as usize)
				== std::slice::from_raw_parts(b, this_class.instance_size() as usize)
		}
	};
	unsafe { eval_stack_op::set_return(ret, equal as i32) };
	Ok(())
}

fn typed_reference_to_object<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	use crate::vm::object::RtTypedReference;
	let typed_ref = unsafe { eval_stack_op::get_param::<*const RtTypedReference<'l>>(params, 0) };
	if typed_ref.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	let (klass, value) = unsafe { ((*typed_ref).klass, (*typed_ref).value) };
	if klass.is_null() || value.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	let klass = unsafe { &*klass };
	let result = match klass.is_value_type() {
		true => object::box_object(ctx, klass, value)?,
		false => unsafe { *(value as *const *mut RtObject<'l>) },
	};
	unsafe { eval_stack_op::set_return(ret, result) };
	Ok(())
}
