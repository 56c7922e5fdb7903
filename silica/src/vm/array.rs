use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::{self, RtClass};
use crate::metadata::layout::stack_location_size_of_class;
use crate::metadata::method::RtMethod;
use crate::metadata::typesig::ElementType;
use crate::vm::gc::GarbageCollector;
use crate::vm::machine::{eval_stack_op, InvokerFn, StackObject};
use crate::vm::object::{extend_to_eval_stack, ArrayBounds, RtArray, RtObject};

pub const MAX_ARRAY_LENGTH: i32 = i32::MAX;

/// Header + elements; `first_data` is a placeholder slot, so its size is
/// subtracted back out.
fn array_total_byte_size<'l>(klass: &'l RtClass<'l>, length: i32) -> usize {
	let element_size = stack_location_size_of_class(klass.element_class()) as usize;
	std::mem::size_of::<RtArray>() - 8 + length as usize * element_size
}

pub fn new_array_from_array_class<'l>(
	ctx: &'l Context<'l>,
	klass: &'l RtClass<'l>,
	length: i32,
) -> RtResult<*mut RtArray<'l>> {
	class::initialize_all(ctx, klass)?;
	if length < 0 {
		return Err(RtErr::ArgumentOutOfRange);
	}

	let total = array_total_byte_size(klass, length);
	let arr = GarbageCollector::allocate_array(klass, total) as *mut RtArray<'l>;
	if arr.is_null() {
		return Err(RtErr::OutOfMemory);
	}
	unsafe { (*arr).length = length };
	Ok(arr)
}

pub fn new_array_from_element_class<'l>(
	ctx: &'l Context<'l>,
	element: &'l RtClass<'l>,
	length: i32,
) -> RtResult<*mut RtArray<'l>> {
	let klass = class::get_szarray_class_from_element_class(ctx, element)?;
	new_array_from_array_class(ctx, klass, length)
}

pub fn new_empty_szarray<'l>(ctx: &'l Context<'l>, element: &'l RtClass<'l>) -> RtResult<*mut RtArray<'l>> {
	new_array_from_element_class(ctx, element, 0)
}

/// Multi-dimensional allocation: elements first, then the rank-sized
/// bounds block aligned to 8 bytes. The flat length is the product of
/// every dimension, with overflow checked along the way.
pub fn new_mdarray<'l>(
	ctx: &'l Context<'l>,
	klass: &'l RtClass<'l>,
	lengths: &[i32],
	lower_bounds: Option<&[i32]>,
) -> RtResult<*mut RtArray<'l>> {
	debug_assert!(klass.by_val.element_type == ElementType::Array);
	class::initialize_all(ctx, klass)?;

	let rank = klass.rank() as usize;
	if lengths.len() != rank || lower_bounds.map(|b| b.len() != rank).unwrap_or(false) {
		return Err(RtErr::Argument);
	}

	let mut total_length: i32 = 1;
	for &dimension_length in lengths {
		if dimension_length < 0 {
			return Err(RtErr::ArgumentOutOfRange);
		}
		total_length = match total_length.checked_mul(dimension_length) {
			Some(v) if v <= MAX_ARRAY_LENGTH => v,
			_ => return Err(RtErr::Overflow),
		};
	}

	let element_size = stack_location_size_of_class(klass.element_class()) as i32;
	if element_size != 0 && total_length > MAX_ARRAY_LENGTH / element_size {
		return Err(RtErr::Overflow);
	}
	let data_bytes = (total_length * element_size) as usize;

	let bytes_without_bounds = array_total_byte_size(klass, 0) + data_bytes;
	let bounds_start = crate::utilities::align_up(bytes_without_bounds, 8);
	let total_bytes = bounds_start + std::mem::size_of::<ArrayBounds>() * rank;

	let arr = GarbageCollector::allocate_array(klass, total_bytes) as *mut RtArray<'l>;
	if arr.is_null() {
		return Err(RtErr::OutOfMemory);
	}

	unsafe {
		let bounds = (arr as *mut u8).add(bounds_start) as *mut ArrayBounds;
		for i in 0..rank {
			(*bounds.add(i)).length = lengths[i];
			(*bounds.add(i)).lower_bound = lower_bounds.map(|b| b[i]).unwrap_or(0);
		}
		(*arr).bounds = bounds;
		(*arr).length = total_length;
	}
	Ok(arr)
}

#[inline]
pub fn array_length(arr: *const RtArray) -> i32 {
	unsafe { (*arr).length }
}

#[inline]
pub fn is_valid_index(arr: *const RtArray, index: i32) -> bool {
	index >= 0 && index < array_length(arr)
}

pub fn array_element_class<'l>(arr: *const RtArray<'l>) -> &'l RtClass<'l> {
	unsafe { (*arr).header.klass.element_class() }
}

pub fn array_element_size(arr: *const RtArray) -> usize {
	stack_location_size_of_class(array_element_class(arr)) as usize
}

#[inline]
pub fn array_data_ptr(arr: *mut RtArray) -> *mut u8 {
	unsafe { std::ptr::addr_of_mut!((*arr).first_data) as *mut u8 }
}

#[inline]
pub fn array_element_ptr(arr: *mut RtArray, index: i32) -> *mut u8 {
	let size = array_element_size(arr);
	unsafe { array_data_ptr(arr).add(size * index as usize) }
}

/// Typed element read; `T` must match the element representation.
pub unsafe fn array_get_at<T: Copy>(arr: *mut RtArray, index: i32) -> T {
	std::ptr::read_unaligned(array_element_ptr(arr, index) as *const T)
}

pub unsafe fn array_set_at<T: Copy>(arr: *mut RtArray, index: i32, value: T) {
	std::ptr::write_unaligned(array_element_ptr(arr, index) as *mut T, value)
}

pub fn array_length_at_dimension(arr: *const RtArray, dimension: usize) -> RtResult<i32> {
	let klass = unsafe { (*arr).header.klass };
	match klass.by_val.element_type {
		ElementType::SZArray => match dimension {
			0 => Ok(array_length(arr)),
			_ => Err(RtErr::IndexOutOfRange),
		},
		ElementType::Array => {
			if dimension >= klass.rank() as usize {
				return Err(RtErr::IndexOutOfRange);
			}
			Ok(unsafe { (*(*arr).bounds.add(dimension)).length })
		},
		_ => Err(RtErr::InvalidCast),
	}
}

pub fn array_lower_bound_at_dimension(arr: *const RtArray, dimension: usize) -> RtResult<i32> {
	let klass = unsafe { (*arr).header.klass };
	match klass.by_val.element_type {
		ElementType::SZArray => match dimension {
			0 => Ok(0),
			_ => Err(RtErr::IndexOutOfRange),
		},
		ElementType::Array => {
			if dimension >= klass.rank() as usize {
				return Err(RtErr::IndexOutOfRange);
			}
			Ok(unsafe { (*(*arr).bounds.add(dimension)).lower_bound })
		},
		_ => Err(RtErr::InvalidCast),
	}
}

/// Flattens `{i0..ik}` into the row-major index:
/// `((i0-lb0)·len1 + (i1-lb1))·len2 + ...`; every relative index must
/// fall inside its dimension.
pub fn mdarray_flat_index(arr: *const RtArray, indices: &[i32]) -> RtResult<i32> {
	let klass = unsafe { (*arr).header.klass };
	debug_assert!(klass.by_val.element_type == ElementType::Array);
	if indices.len() != klass.rank() as usize {
		return Err(RtErr::Argument);
	}

	let mut offset: i64 = 0;
	for (dimension, &index) in indices.iter().enumerate() {
		let bound = unsafe { *(*arr).bounds.add(dimension) };
		let relative = index - bound.lower_bound;
		if relative < 0 || relative >= bound.length {
			return Err(RtErr::IndexOutOfRange);
		}
		offset = offset * bound.length as i64 + relative as i64;
	}
	Ok(offset as i32)
}

/// Same flattening with indices read from invocation slots.
pub fn mdarray_flat_index_from_stack(arr: *const RtArray, indices: *const StackObject, rank: usize) -> RtResult<i32> {
	let mut buffer = [0i32; 32];
	if rank > buffer.len() {
		return Err(RtErr::Argument);
	}
	for i in 0..rank {
		buffer[i] = unsafe { eval_stack_op::get_param::<i32>(indices, i) };
	}
	mdarray_flat_index(arr, &buffer[..rank])
}

/// `Array.Copy` fast path. Identical classes move bytes; compatible
/// reference elements copy pointer-wise; anything else reports `false`
/// so the caller can fall back to the slow, converting path.
pub fn fast_copy<'l>(
	src: *mut RtArray<'l>,
	src_index: i32,
	dst: *mut RtArray<'l>,
	dst_index: i32,
	length: i32,
) -> RtResult<bool> {
	if src.is_null() || dst.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	if length < 0 || src_index < 0 || dst_index < 0 {
		return Err(RtErr::ArgumentOutOfRange);
	}
	if src_index.checked_add(length).map(|end| end > array_length(src)).unwrap_or(true)
		|| dst_index.checked_add(length).map(|end| end > array_length(dst)).unwrap_or(true)
	{
		return Err(RtErr::ArgumentOutOfRange);
	}

	let src_class = unsafe { (*src).header.klass };
	let dst_class = unsafe { (*dst).header.klass };
	let element_size = array_element_size(src);

	if std::ptr::eq(src_class, dst_class) {
		unsafe {
			// Same-array copies may overlap.
			std::ptr::copy(
				array_element_ptr(src, src_index),
				array_element_ptr(dst, dst_index),
				element_size * length as usize,
			);
		}
		return Ok(true);
	}

	let src_element = src_class.element_class();
	let dst_element = dst_class.element_class();
	if src_element.is_value_type() || dst_element.is_value_type() {
		return Ok(false);
	}
	if array_element_size(dst) != element_size {
		return Ok(false);
	}
	if !class::is_assignable_from(src_element, dst_element) {
		return Ok(false);
	}

	unsafe {
		std::ptr::copy(
			array_element_ptr(src, src_index),
			array_element_ptr(dst, dst_index),
			element_size * length as usize,
		);
	}
	Ok(true)
}

/// Zero-fills `[index, index+length)` of the flat element space.
pub fn clear_internal(arr: *mut RtArray, index: i32, length: i32) -> RtResult<()> {
	if arr.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	if index < 0 || length < 0 || index.checked_add(length).map(|end| end > array_length(arr)).unwrap_or(true) {
		return Err(RtErr::IndexOutOfRange);
	}
	let element_size = array_element_size(arr);
	unsafe {
		std::ptr::write_bytes(array_element_ptr(arr, index), 0, element_size * length as usize);
	}
	Ok(())
}

/// Clones into a fresh array of identical class, preserving bounds.
pub fn clone_array<'l>(arr: *mut RtArray<'l>) -> RtResult<*mut RtArray<'l>> {
	debug_assert!(!arr.is_null());
	let klass = unsafe { (*arr).header.klass };
	let length = array_length(arr);

	match klass.by_val.element_type {
		ElementType::SZArray => {
			let total = array_total_byte_size(klass, length);
			let new_arr = GarbageCollector::allocate_array(klass, total) as *mut RtArray<'l>;
			if new_arr.is_null() {
				return Err(RtErr::OutOfMemory);
			}
			unsafe {
				(*new_arr).length = length;
				std::ptr::copy_nonoverlapping(
					array_data_ptr(arr),
					array_data_ptr(new_arr),
					array_element_size(arr) * length as usize,
				);
			}
			Ok(new_arr)
		},
		ElementType::Array => {
			let rank = klass.rank() as usize;
			let element_size = array_element_size(arr);
			let bytes_without_bounds = array_total_byte_size(klass, 0) + element_size * length as usize;
			let bounds_start = crate::utilities::align_up(bytes_without_bounds, 8);
			let total = bounds_start + std::mem::size_of::<ArrayBounds>() * rank;

			let new_arr = GarbageCollector::allocate_array(klass, total) as *mut RtArray<'l>;
			if new_arr.is_null() {
				return Err(RtErr::OutOfMemory);
			}
			unsafe {
				(*new_arr).length = length;
				let bounds = (new_arr as *mut u8).add(bounds_start) as *mut ArrayBounds;
				std::ptr::copy_nonoverlapping((*arr).bounds, bounds, rank);
				(*new_arr).bounds = bounds;
				std::ptr::copy_nonoverlapping(
					array_data_ptr(arr),
					array_data_ptr(new_arr),
					element_size * length as usize,
				);
			}
			Ok(new_arr)
		},
		_ => Err(RtErr::ExecutionEngine),
	}
}

// ### Accessor invokers ###

/// Wires the synthesized `Get`/`Set`/`Address`/`.ctor` methods of an
/// array class to the matching trampoline.
pub(crate) fn assign_array_invoker<'l>(class: &'l RtClass<'l>, method: &'l RtMethod<'l>) {
	let rank = class.rank() as usize;
	let invoker: InvokerFn = match method.name {
		"Get" => array_get_invoker,
		"Set" => array_set_invoker,
		"Address" => array_address_invoker,
		".ctor" if method.param_count() == rank => array_new_invoker,
		_ => array_new_with_bounds_invoker,
	};
	method.invoke_fn.set(Some(invoker));
	method.virtual_invoke_fn.set(Some(invoker));
	method.method_ptr.set(invoker as *const ());
}

fn array_get_invoker<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let _ = ctx;
	let arr = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	if arr.is_null() {
		return Err(RtErr::NullReference);
	}
	let rank = method.parent().rank() as usize;
	let index = match rank {
		1 => {
			let index = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
			if !is_valid_index(arr, index) {
				return Err(RtErr::IndexOutOfRange);
			}
			index
		},
		_ => mdarray_flat_index_from_stack(arr, unsafe { params.add(1) }, rank)?,
	};
	let data = array_element_ptr(arr, index);
	extend_to_eval_stack(data, ret, array_element_class(arr));
	Ok(())
}

fn array_set_invoker<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	let _ = ctx;
	let arr = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	if arr.is_null() {
		return Err(RtErr::NullReference);
	}
	let rank = method.parent().rank() as usize;
	let index = match rank {
		1 => {
			let index = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
			if !is_valid_index(arr, index) {
				return Err(RtErr::IndexOutOfRange);
			}
			index
		},
		_ => mdarray_flat_index_from_stack(arr, unsafe { params.add(1) }, rank)?,
	};
	let element_size = array_element_size(arr);
	unsafe {
		let value_ptr = params.add(1 + rank) as *const u8;
		std::ptr::copy_nonoverlapping(value_ptr, array_element_ptr(arr, index), element_size);
	}
	Ok(())
}

fn array_address_invoker<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let _ = ctx;
	let arr = unsafe { eval_stack_op::get_param::<*mut RtArray<'l>>(params, 0) };
	if arr.is_null() {
		return Err(RtErr::NullReference);
	}
	let rank = method.parent().rank() as usize;
	let index = match rank {
		1 => {
			let index = unsafe { eval_stack_op::get_param::<i32>(params, 1) };
			if !is_valid_index(arr, index) {
				return Err(RtErr::IndexOutOfRange);
			}
			index
		},
		_ => mdarray_flat_index_from_stack(arr, unsafe { params.add(1) }, rank)?,
	};
	unsafe { eval_stack_op::set_return(ret, array_element_ptr(arr, index)) };
	Ok(())
}

fn array_new_invoker<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let klass = method.parent();
	let rank = klass.rank() as usize;
	let arr = match klass.by_val.element_type {
		ElementType::SZArray => {
			let length = unsafe { eval_stack_op::get_param::<i32>(params, 0) };
			new_array_from_array_class(ctx, klass, length)?
		},
		_ => {
			let mut lengths = [0i32; 32];
			if rank > lengths.len() {
				return Err(RtErr::Argument);
			}
			for i in 0..rank {
				lengths[i] = unsafe { eval_stack_op::get_param::<i32>(params, i) };
			}
			new_mdarray(ctx, klass, &lengths[..rank], None)?
		},
	};
	unsafe { eval_stack_op::set_return(ret, arr) };
	Ok(())
}

fn array_new_with_bounds_invoker<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	let klass = method.parent();
	let rank = klass.rank() as usize;
	let mut lengths = [0i32; 32];
	let mut lower_bounds = [0i32; 32];
	if rank > lengths.len() {
		return Err(RtErr::Argument);
	}
	// All lengths first, then all lower bounds.
	for i in 0..rank {
		lengths[i] = unsafe { eval_stack_op::get_param::<i32>(params, i) };
		lower_bounds[i] = unsafe { eval_stack_op::get_param::<i32>(params, i + rank) };
	}
	let arr = new_mdarray(ctx, klass, &lengths[..rank], Some(&lower_bounds[..rank]))?;
	unsafe { eval_stack_op::set_return(ret, arr) };
	Ok(())
}

/// Boxed (or reference) view of one element, for the reflection
/// `GetValue` surface.
pub fn array_get_value_boxed<'l>(
	ctx: &'l Context<'l>,
	arr: *mut RtArray<'l>,
	index: i32,
) -> RtResult<*mut RtObject<'l>> {
	if !is_valid_index(arr, index) {
		return Err(RtErr::IndexOutOfRange);
	}
	let element = array_element_class(arr);
	let data = array_element_ptr(arr, index);
	match element.is_value_type() {
		true => crate::vm::object::box_object(ctx, element, data),
		false => Ok(unsafe { *(data as *mut *mut RtObject<'l>) }),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fast_copy_rejects_null_arrays() {
		// Null arrays short-circuit before any dereference.
		let null: *mut RtArray<'static> = std::ptr::null_mut();
		let result = fast_copy(null, 0, std::ptr::null_mut(), 0, 1);
		assert_eq!(result, Err(RtErr::ArgumentNull));
	}
}
