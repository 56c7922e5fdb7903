use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::{self, RtField};
use crate::metadata::layout;
use crate::vm::gc::GarbageCollector;
use crate::vm::object::{self, RtObject, OBJECT_HEADER_SIZE};

/// Address of a static field's storage slot. Literals and RVA fields
/// never live in the static block.
pub fn static_field_ptr<'l>(ctx: &'l Context<'l>, field: &'l RtField<'l>) -> RtResult<*mut u8> {
	if !field.is_static_in_block() {
		return Err(RtErr::MissingField);
	}
	let class = field.parent();
	class::initialize_fields(ctx, class)?;
	let data = class.static_data();
	if data.is_null() {
		return Err(RtErr::ExecutionEngine);
	}
	Ok(unsafe { data.add(field.offset.get() as usize) })
}

/// Address of an instance field inside `obj` (reference types skip the
/// object header; the offset is relative to the instance start).
pub fn instance_field_ptr<'l>(field: &'l RtField<'l>, obj: *mut RtObject<'l>) -> RtResult<*mut u8> {
	if obj.is_null() {
		return Err(RtErr::NullReference);
	}
	Ok(unsafe { (obj as *mut u8).add(OBJECT_HEADER_SIZE + field.offset.get() as usize) })
}

pub fn field_size<'l>(ctx: &'l Context<'l>, field: &'l RtField<'l>) -> RtResult<u32> {
	let (size, _) = layout::type_sig_size_and_alignment(ctx, field.type_sig)?;
	Ok(size)
}

pub fn set_static_value<'l>(ctx: &'l Context<'l>, field: &'l RtField<'l>, value: *const u8) -> RtResult<()> {
	let dst = static_field_ptr(ctx, field)?;
	let size = field_size(ctx, field)? as usize;
	unsafe { std::ptr::copy_nonoverlapping(value, dst, size) };
	Ok(())
}

pub fn set_instance_value<'l>(
	ctx: &'l Context<'l>,
	field: &'l RtField<'l>,
	obj: *mut RtObject<'l>,
	value: *const u8,
) -> RtResult<()> {
	let dst = instance_field_ptr(field, obj)?;
	let size = field_size(ctx, field)? as usize;
	unsafe { std::ptr::copy_nonoverlapping(value, dst, size) };
	Ok(())
}

/// Reads a field as an object reference, boxing value types. `obj` is
/// ignored for statics.
pub fn get_value_object<'l>(
	ctx: &'l Context<'l>,
	field: &'l RtField<'l>,
	obj: *mut RtObject<'l>,
) -> RtResult<*mut RtObject<'l>> {
	let src = match field.is_static() {
		true => static_field_ptr(ctx, field)?,
		false => instance_field_ptr(field, obj)?,
	};
	let field_class = class::class_from_type_sig(ctx, field.type_sig)?;
	match field_class.is_value_type() {
		true => object::box_object(ctx, field_class, src),
		false => Ok(unsafe { *(src as *mut *mut RtObject<'l>) }),
	}
}

/// Stores an object into a field, unboxing into value-type storage.
pub fn set_value_object<'l>(
	ctx: &'l Context<'l>,
	field: &'l RtField<'l>,
	obj: *mut RtObject<'l>,
	value: *mut RtObject<'l>,
) -> RtResult<()> {
	let dst = match field.is_static() {
		true => static_field_ptr(ctx, field)?,
		false => instance_field_ptr(field, obj)?,
	};
	let field_class = class::class_from_type_sig(ctx, field.type_sig)?;
	match field_class.is_value_type() {
		true => object::unbox_any(ctx, value, field_class, dst, false),
		false => {
			GarbageCollector::write_barrier(dst as *mut *mut RtObject<'l>, value);
			Ok(())
		},
	}
}

/// Constant blob of a literal field, typed by the `Constant` row tag.
pub fn get_field_const_data<'l>(field: &'l RtField<'l>) -> RtResult<(u8, &'l [u8])> {
	layout::field_constant(field.parent().module(), field)
}

/// PE-backed bytes of an RVA-initialized static.
pub fn get_field_rva_data<'l>(field: &'l RtField<'l>) -> RtResult<&'l [u8]> {
	layout::field_rva_data(field.parent().module(), field)
}
