use std::hash::{Hash, Hasher};

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::vm::gc::GarbageCollector;
use crate::vm::object::{RtObject, RtString};

/// `RtString` ends in a `u16` placeholder the real character data
/// overlays; the allocation math removes it and re-adds `length + 1`
/// code units (one reserved zero terminator for legacy hash helpers).
const STRING_OVER_SIZE: usize = 4;

pub fn fast_allocate_string<'l>(ctx: &'l Context<'l>, length: i32) -> RtResult<*mut RtString<'l>> {
	if length < 0 {
		return Err(RtErr::ArgumentOutOfRange);
	}
	let klass = ctx.corlib_types()?.cls_string;
	let total = std::mem::size_of::<RtString>() - STRING_OVER_SIZE
		+ std::mem::size_of::<u16>()
		+ length as usize * std::mem::size_of::<u16>();
	let s = GarbageCollector::allocate_object_not_contains_references(klass, total) as *mut RtString<'l>;
	if s.is_null() {
		return Err(RtErr::OutOfMemory);
	}
	unsafe { (*s).length = length };
	Ok(s)
}

pub fn create_string_from_utf16<'l>(ctx: &'l Context<'l>, chars: &[u16]) -> RtResult<*mut RtString<'l>> {
	let s = fast_allocate_string(ctx, chars.len() as i32)?;
	unsafe {
		std::ptr::copy_nonoverlapping(chars.as_ptr(), std::ptr::addr_of_mut!((*s).first_char), chars.len());
	}
	Ok(s)
}

pub fn create_string_from_utf8<'l>(ctx: &'l Context<'l>, text: &str) -> RtResult<*mut RtString<'l>> {
	let utf16: Vec<u16> = text.encode_utf16().collect();
	create_string_from_utf16(ctx, &utf16)
}

/// The string's UTF-16 code units, excluding the reserved terminator.
pub fn string_chars<'l>(s: *const RtString<'l>) -> &'l [u16] {
	unsafe { std::slice::from_raw_parts(std::ptr::addr_of!((*s).first_char), (*s).length as usize) }
}

pub fn string_to_rust<'l>(s: *const RtString<'l>) -> String {
	String::from_utf16_lossy(string_chars(s))
}

/// Legacy non-randomized hash: 5381 rolled over i32 pairs of character
/// data, with a trailing odd character folded in separately.
pub fn get_hash_code(s: *const RtString) -> i32 {
	let chars = string_chars(s);
	let mut hash: i32 = 5381;
	let pairs = chars.len() / 2;
	let ints = chars.as_ptr() as *const i32;
	for i in 0..pairs {
		let v = unsafe { std::ptr::read_unaligned(ints.add(i)) };
		hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(v);
	}
	if chars.len() % 2 != 0 {
		hash = hash
			.wrapping_shl(5)
			.wrapping_add(hash)
			.wrapping_add(chars[chars.len() - 1] as i32);
	}
	hash
}

/// Intern-table key: hashes and compares by character content of the
/// referenced string.
#[derive(Copy, Clone)]
pub struct InternKey<'l>(pub *mut RtString<'l>);

impl Hash for InternKey<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		// FNV-1a over the raw character bytes.
		let chars = string_chars(self.0);
		let bytes = unsafe {
			std::slice::from_raw_parts(chars.as_ptr() as *const u8, chars.len() * 2)
		};
		let mut hash: u64 = 0xCBF2_9CE4_8422_2325;
		for byte in bytes {
			hash ^= *byte as u64;
			hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
		}
		state.write_u64(hash);
	}
}

impl Eq for InternKey<'_> {}

impl PartialEq for InternKey<'_> {
	fn eq(&self, other: &Self) -> bool {
		if std::ptr::eq(self.0, other.0) {
			return true;
		}
		string_chars(self.0) == string_chars(other.0)
	}
}

/// Returns the canonical instance for the string's contents, inserting
/// `s` itself when no equal string has been interned yet.
pub fn intern_string<'l>(ctx: &'l Context<'l>, s: *mut RtString<'l>) -> *mut RtString<'l> {
	if s.is_null() {
		return s;
	}
	let key = InternKey(s);
	let mut table = ctx.intern_table.borrow_mut();
	match table.get(&key) {
		Some(existing) => existing.0,
		None => {
			table.insert(key);
			s
		},
	}
}

pub fn is_interned_string<'l>(ctx: &'l Context<'l>, s: *mut RtString<'l>) -> bool {
	if s.is_null() {
		return false;
	}
	ctx.intern_table.borrow().contains(&InternKey(s))
}

/// The process-wide `""` singleton.
pub fn empty_string<'l>(ctx: &'l Context<'l>) -> RtResult<*mut RtString<'l>> {
	let holder = ctx.empty_string.get();
	if holder.is_null() {
		return Err(RtErr::ExecutionEngine);
	}
	Ok(unsafe { *holder })
}

/// Creates `String.Empty`, pins it as a collector root, publishes it
/// into the managed static field, and seeds the intern table.
pub(crate) fn initialize<'l>(ctx: &'l Context<'l>) -> RtResult<()> {
	let string_class = ctx.corlib_types()?.cls_string;
	crate::metadata::class::initialize_all(ctx, string_class)?;

	let holder: *mut *mut RtString<'l> =
		GarbageCollector::allocate_fixed_reference_array(1) as *mut *mut RtString<'l>;
	let empty = fast_allocate_string(ctx, 0)?;
	GarbageCollector::write_barrier(
		holder as *mut *mut RtObject<'l>,
		empty as *mut RtObject<'l>,
	);
	ctx.empty_string.set(holder);
	intern_string(ctx, empty);

	let field = crate::metadata::class::find_field_by_name(string_class, "Empty", false)
		.ok_or(RtErr::ExecutionEngine)?;
	crate::vm::field::set_static_value(ctx, field, &empty as *const _ as *const u8)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_allocation_math_reserves_terminator() {
		// header (16) + length (4) gives 20 once the placeholder char
		// and padding are removed; each string then carries length + 1
		// UTF-16 code units.
		let base = std::mem::size_of::<RtString>() - STRING_OVER_SIZE;
		assert_eq!(base, crate::vm::object::OBJECT_HEADER_SIZE + 4);
	}
}
