use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::{self, RtClass};
use crate::metadata::method::RtMethod;
use crate::metadata::typesig::{ElementType, TypeSig};
use crate::vm::gc::GarbageCollector;
use crate::vm::machine::StackObject;
use crate::vm::runtime;

pub const OBJECT_HEADER_SIZE: usize = std::mem::size_of::<RtObject>();

/// Every managed object starts with this header.
#[repr(C)]
pub struct RtObject<'l> {
	pub klass: &'l RtClass<'l>,
	pub sync_block: usize,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ArrayBounds {
	pub length: i32,
	pub lower_bound: i32,
}

/// SZ-arrays leave `bounds` null; multi-dimensional arrays point it at a
/// trailing `{length, lower_bound}` block stored after the elements.
#[repr(C)]
pub struct RtArray<'l> {
	pub header: RtObject<'l>,
	pub bounds: *const ArrayBounds,
	pub length: i32,
	pub first_data: u64,
}

/// UTF-16 string; one extra zero code unit is kept past `length` for
/// legacy hash helpers that expect a terminator.
#[repr(C)]
pub struct RtString<'l> {
	pub header: RtObject<'l>,
	pub length: i32,
	pub first_char: u16,
}

/// Value-type-only triple; no object header.
#[repr(C)]
pub struct RtTypedReference<'l> {
	pub type_handle: *const TypeSig<'l>,
	pub value: *const u8,
	pub klass: *const RtClass<'l>,
}

#[repr(C)]
pub struct RtException<'l> {
	pub header: RtObject<'l>,
	pub class_name: *mut RtString<'l>,
	pub message: *mut RtString<'l>,
	pub data: *mut RtObject<'l>,
	pub inner_exception: *mut RtException<'l>,
	pub help_url: *mut RtString<'l>,
	pub trace_ips: *mut RtArray<'l>,
	pub stack_trace: *mut RtString<'l>,
	pub remote_stack_trace: *mut RtString<'l>,
	pub remote_stack_index: i32,
	pub dynamic_methods: *mut RtObject<'l>,
	pub hresult: i32,
	pub source: *mut RtString<'l>,
	pub safe_serialization_manager: *mut RtObject<'l>,
	pub captured_traces: *mut RtArray<'l>,
	pub native_trace_ips: *mut RtArray<'l>,
	pub caught_in_unmanaged: i32,
}

#[repr(C)]
pub struct RtDelegateData<'l> {
	pub header: RtObject<'l>,
	pub target_type: *mut RtObject<'l>,
	pub method_name: *mut RtString<'l>,
	pub curried_first_arg: bool,
}

#[repr(C)]
pub struct RtDelegate<'l> {
	pub header: RtObject<'l>,
	pub method_ptr: usize,
	pub invoke_impl: usize,
	pub target: *mut RtObject<'l>,
	pub method: *const RtMethod<'l>,
	pub delegate_trampoline: usize,
	pub extra_arg: isize,
	pub method_code: usize,
	pub interp_method: usize,
	pub interp_invoke_impl: usize,
	pub method_info: *mut RtObject<'l>,
	pub original_method_info: *mut RtObject<'l>,
	pub data: *mut RtDelegateData<'l>,
	pub method_is_virtual: bool,
}

#[repr(C)]
pub struct RtMulticastDelegate<'l> {
	pub dele: RtDelegate<'l>,
	pub deles: *mut RtArray<'l>,
}

/// Allocates a fully initialized instance of `klass`, running its static
/// constructor first if needed. Field storage comes back zeroed.
pub fn new_object<'l>(ctx: &'l Context<'l>, klass: &'l RtClass<'l>) -> RtResult<*mut RtObject<'l>> {
	class::initialize_all(ctx, klass)?;
	runtime::run_class_static_constructor(ctx, klass)?;

	let total_size = OBJECT_HEADER_SIZE + klass.instance_size() as usize;
	let obj = GarbageCollector::allocate_object(klass, total_size);
	if obj.is_null() {
		return Err(RtErr::OutOfMemory);
	}
	Ok(obj)
}

fn box_object_internal<'l>(ctx: &'l Context<'l>, klass: &'l RtClass<'l>, value: *const u8) -> RtResult<*mut RtObject<'l>> {
	let obj = new_object(ctx, klass)?;
	// The source may be unaligned (interior of a packed struct).
	unsafe {
		std::ptr::copy_nonoverlapping(
			value,
			(obj as *mut u8).add(OBJECT_HEADER_SIZE),
			klass.instance_size() as usize,
		);
	}
	Ok(obj)
}

/// Boxes a value type. A nullable with `HasValue == false` boxes to null;
/// otherwise its payload boxes as the underlying type.
pub fn box_object<'l>(ctx: &'l Context<'l>, klass: &'l RtClass<'l>, value: *const u8) -> RtResult<*mut RtObject<'l>> {
	if !klass.is_nullable() {
		return box_object_internal(ctx, klass, value);
	}

	let fields = klass.fields();
	if fields.len() < 2 {
		return Err(RtErr::ExecutionEngine);
	}
	let has_value_offset = fields[0].offset.get() as usize;
	if unsafe { *value.add(has_value_offset) } == 0 {
		return Ok(std::ptr::null_mut());
	}
	let value_offset = fields[1].offset.get() as usize;
	let underlying = klass.element_class();
	box_object_internal(ctx, underlying, unsafe { value.add(value_offset) })
}

/// Payload pointer of a boxed value type.
pub fn box_value_data_ptr(obj: *const RtObject) -> *const u8 {
	debug_assert!(!obj.is_null());
	unsafe { (obj as *const u8).add(OBJECT_HEADER_SIZE) }
}

/// Widens a raw value into eval-stack representation: small integers
/// sign- or zero-extend to i32, floats pass through bit-exact, value
/// types copy as raw slots.
pub fn extend_to_eval_stack<'l>(src: *const u8, dst: *mut StackObject, ele_klass: &'l RtClass<'l>) {
	unsafe {
		match ele_klass.by_val.element_type {
			ElementType::Boolean | ElementType::I1 => {
				let v = *(src as *const i8);
				*(dst as *mut i32) = v as i32;
			},
			ElementType::U1 => {
				let v = *src;
				*(dst as *mut i32) = v as i32;
			},
			ElementType::I2 => {
				let v = std::ptr::read_unaligned(src as *const i16);
				*(dst as *mut i32) = v as i32;
			},
			ElementType::U2 | ElementType::Char => {
				let v = std::ptr::read_unaligned(src as *const u16);
				*(dst as *mut i32) = v as i32;
			},
			ElementType::I4 | ElementType::U4 | ElementType::R4 => {
				let v = std::ptr::read_unaligned(src as *const i32);
				*(dst as *mut i32) = v;
			},
			ElementType::I8 | ElementType::U8 | ElementType::R8 => {
				let v = std::ptr::read_unaligned(src as *const i64);
				*(dst as *mut i64) = v;
			},
			ElementType::I | ElementType::U | ElementType::Ptr | ElementType::FnPtr => {
				let v = std::ptr::read_unaligned(src as *const isize);
				*(dst as *mut isize) = v;
			},
			ElementType::String
			| ElementType::Class
			| ElementType::Object
			| ElementType::Array
			| ElementType::SZArray => {
				let v = std::ptr::read_unaligned(src as *const *const RtObject);
				*(dst as *mut *const RtObject) = v;
			},
			ElementType::ValueType | ElementType::TypedByRef => {
				std::ptr::copy_nonoverlapping(src, dst as *mut u8, ele_klass.instance_size() as usize);
			},
			ElementType::GenericInst => match ele_klass.is_value_type() {
				true => {
					std::ptr::copy_nonoverlapping(src, dst as *mut u8, ele_klass.instance_size() as usize);
				},
				false => {
					let v = std::ptr::read_unaligned(src as *const *const RtObject);
					*(dst as *mut *const RtObject) = v;
				},
			},
			_ => unreachable!("unsupported element type on the eval stack"),
		}
	}
}

/// `unbox.any` semantics: type-check then copy the payload out, or
/// reconstitute a nullable. With `extend_to_stack`, small integers
/// widen to i32 in the destination slot.
pub fn unbox_any<'l>(
	ctx: &'l Context<'l>,
	obj: *const RtObject<'l>,
	klass: &'l RtClass<'l>,
	dst: *mut u8,
	extend_to_stack: bool,
) -> RtResult<()> {
	let element_class = klass.element_class();
	let unbox_cast_class = element_class.cast_class(ctx)?;

	if !klass.is_nullable() {
		if obj.is_null() {
			return Err(RtErr::NullReference);
		}
		let obj_ref = unsafe { &*obj };
		if !std::ptr::eq(obj_ref.klass.cast_class(ctx)?, unbox_cast_class) {
			return Err(RtErr::InvalidCast);
		}
		let src = box_value_data_ptr(obj);
		match extend_to_stack {
			true => extend_to_eval_stack(src, dst as *mut StackObject, unbox_cast_class),
			false => unsafe {
				std::ptr::copy_nonoverlapping(src, dst, klass.instance_size() as usize);
			},
		}
		return Ok(());
	}

	if obj.is_null() {
		// Null nullable: zero-initialized Nullable<T>.
		unsafe { std::ptr::write_bytes(dst, 0, klass.instance_size() as usize) };
		return Ok(());
	}

	let obj_ref = unsafe { &*obj };
	let obj_element = obj_ref.klass.element_class();
	if !std::ptr::eq(obj_element.element_class(), unbox_cast_class) {
		return Err(RtErr::InvalidCast);
	}

	let fields = klass.fields();
	if fields.len() < 2 {
		return Err(RtErr::ExecutionEngine);
	}
	let has_value_offset = fields[0].offset.get() as usize;
	let value_offset = fields[1].offset.get() as usize;
	unsafe {
		*dst.add(has_value_offset) = 1;
		std::ptr::copy_nonoverlapping(
			box_value_data_ptr(obj),
			dst.add(value_offset),
			element_class.instance_size() as usize,
		);
	}
	Ok(())
}

/// `unbox` semantics: exact element-class match, returns the payload
/// pointer inside the box.
pub fn unbox_ex<'l>(
	obj: *const RtObject<'l>,
	unbox_class: &'l RtClass<'l>,
) -> RtResult<*const u8> {
	if !unbox_class.is_nullable() {
		if obj.is_null() {
			return Err(RtErr::NullReference);
		}
		let obj_ref = unsafe { &*obj };
		if !std::ptr::eq(obj_ref.klass.element_class(), unbox_class.element_class()) {
			return Err(RtErr::InvalidCast);
		}
		return Ok(box_value_data_ptr(obj));
	}

	if obj.is_null() {
		return Ok(std::ptr::null());
	}
	let obj_ref = unsafe { &*obj };
	let result_class = unbox_class.element_class();
	if !std::ptr::eq(obj_ref.klass.element_class().element_class(), result_class) {
		return Err(RtErr::InvalidCast);
	}
	Ok(box_value_data_ptr(obj))
}

/// `isinst`: the object when assignable, null otherwise. Never raises.
pub fn is_inst<'l>(obj: *const RtObject<'l>, klass: &'l RtClass<'l>) -> *const RtObject<'l> {
	if obj.is_null() {
		return std::ptr::null();
	}
	let obj_class = unsafe { (*obj).klass };
	match class::is_assignable_from(obj_class, klass) {
		true => obj,
		false => std::ptr::null(),
	}
}

/// The compatibility half of `castclass`; the raising half lives with
/// the IL dispatcher.
pub fn cast_class_obj<'l>(obj: *const RtObject<'l>, klass: &'l RtClass<'l>) -> *const RtObject<'l> {
	is_inst(obj, klass)
}

/// Shallow clone; arrays clone through the array path to preserve
/// bounds, strings are immutable and never cloned here.
pub fn clone_object<'l>(ctx: &'l Context<'l>, obj: *mut RtObject<'l>) -> RtResult<*mut RtObject<'l>> {
	debug_assert!(!obj.is_null());
	let klass = unsafe { (*obj).klass };
	debug_assert!(klass.by_val.element_type != ElementType::String);

	if klass.is_array_or_szarray() {
		let cloned = crate::vm::array::clone_array(obj as *mut RtArray<'l>)?;
		return Ok(cloned as *mut RtObject<'l>);
	}

	let new_obj = new_object(ctx, klass)?;
	unsafe {
		std::ptr::copy_nonoverlapping(
			(obj as *const u8).add(OBJECT_HEADER_SIZE),
			(new_obj as *mut u8).add(OBJECT_HEADER_SIZE),
			klass.instance_size() as usize,
		);
	}
	Ok(new_obj)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_is_two_words() {
		assert_eq!(OBJECT_HEADER_SIZE, 2 * std::mem::size_of::<usize>());
	}

	#[test]
	fn typed_reference_is_three_words() {
		assert_eq!(
			std::mem::size_of::<RtTypedReference>(),
			3 * std::mem::size_of::<usize>()
		);
	}

	#[test]
	fn array_layout_places_elements_at_eight_byte_alignment() {
		let first_data = std::mem::offset_of!(RtArray, first_data);
		assert_eq!(first_data % 8, 0);
		assert_eq!(std::mem::offset_of!(RtArray, length), OBJECT_HEADER_SIZE + 8);
	}

	#[test]
	fn string_layout_keeps_chars_after_length() {
		assert_eq!(std::mem::offset_of!(RtString, length), OBJECT_HEADER_SIZE);
		assert_eq!(std::mem::offset_of!(RtString, first_char), OBJECT_HEADER_SIZE + 4);
	}
}
