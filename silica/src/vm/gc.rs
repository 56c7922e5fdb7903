use std::alloc::{alloc_zeroed, Layout};

use crate::metadata::class::RtClass;
use crate::vm::object::RtObject;

/// Facade over the collector. The current collector is a plain
/// never-freeing allocator; everything here is the seam a real GC slots
/// into. Allocations are zero-initialized by contract.
pub struct GarbageCollector;

const HEAP_ALIGN: usize = 8;

fn raw_zeroed(size: usize) -> *mut u8 {
	let layout = Layout::from_size_align(size.max(1), HEAP_ALIGN).expect("invalid allocation size");
	unsafe { alloc_zeroed(layout) }
}

impl GarbageCollector {
	/// Non-collected storage (static field blocks, runtime tables).
	pub fn allocate_fixed(size: usize) -> *mut u8 {
		raw_zeroed(size)
	}

	/// Non-collected array of managed references the collector scans as
	/// roots (the current-exception slot, pinned singletons).
	pub fn allocate_fixed_reference_array<'l>(length: usize) -> *mut *mut RtObject<'l> {
		raw_zeroed(length * std::mem::size_of::<*mut RtObject>()) as *mut *mut RtObject<'l>
	}

	pub fn allocate_object<'l>(klass: &'l RtClass<'l>, size: usize) -> *mut RtObject<'l> {
		debug_assert!(size >= std::mem::size_of::<RtObject>());
		let obj = raw_zeroed(size) as *mut RtObject<'l>;
		if !obj.is_null() {
			unsafe { (*obj).klass = klass };
		}
		obj
	}

	/// Reference-free payloads can skip collector scanning; the plain
	/// allocator treats them the same.
	pub fn allocate_object_not_contains_references<'l>(klass: &'l RtClass<'l>, size: usize) -> *mut RtObject<'l> {
		Self::allocate_object(klass, size)
	}

	pub fn allocate_array<'l>(klass: &'l RtClass<'l>, total_bytes: usize) -> *mut RtObject<'l> {
		Self::allocate_object(klass, total_bytes)
	}

	/// Every managed reference store whose destination may live in the
	/// heap goes through here.
	#[inline]
	pub fn write_barrier<'l>(location: *mut *mut RtObject<'l>, value: *mut RtObject<'l>) {
		unsafe { *location = value };
	}
}
