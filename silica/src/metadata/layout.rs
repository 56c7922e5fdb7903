use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::{self, RtField};
use crate::metadata::module::Module;
use crate::metadata::typesig::{ElementType, TypeSig, TypeSigData};
use crate::raw::heaps::table::{self, Table};
use crate::raw::indices::coded_index::HasConstant;
use crate::raw::indices::metadata_token::MetadataToken;

pub const PTR_SIZE: u32 = std::mem::size_of::<usize>() as u32;
pub const PTR_ALIGN: u32 = PTR_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SizeAndAlignment {
	pub size: u32,
	pub alignment: u32,
}

/// Byte size and natural alignment of one stored value of `sig`.
/// Value types recurse into their class layout; references, pointers
/// and by-refs are machine words.
pub fn type_sig_size_and_alignment<'l>(ctx: &'l Context<'l>, sig: &'l TypeSig<'l>) -> RtResult<(u32, u32)> {
	if sig.by_ref {
		return Ok((PTR_SIZE, PTR_ALIGN));
	}
	let (size, align) = match sig.element_type {
		ElementType::Boolean | ElementType::I1 | ElementType::U1 => (1, 1),
		ElementType::Char | ElementType::I2 | ElementType::U2 => (2, 2),
		ElementType::I4 | ElementType::U4 | ElementType::R4 => (4, 4),
		ElementType::I8 | ElementType::U8 | ElementType::R8 => (8, 8),
		ElementType::I | ElementType::U => (PTR_SIZE, PTR_ALIGN),
		ElementType::String
		| ElementType::Object
		| ElementType::Class
		| ElementType::Array
		| ElementType::SZArray
		| ElementType::Ptr
		| ElementType::FnPtr => (PTR_SIZE, PTR_ALIGN),
		ElementType::TypedByRef => (3 * PTR_SIZE, PTR_ALIGN),
		ElementType::ValueType => {
			let class = class::class_from_type_sig(ctx, sig)?;
			class::initialize_fields(ctx, class)?;
			(class.instance_size(), class.alignment())
		},
		ElementType::GenericInst => {
			let base = class::generic_base_class(ctx, sig)?;
			match base.is_value_type() {
				false => (PTR_SIZE, PTR_ALIGN),
				true => {
					let class = class::class_from_type_sig(ctx, sig)?;
					class::initialize_fields(ctx, class)?;
					(class.instance_size(), class.alignment())
				},
			}
		},
		// Open generic variables only occur in definitions that are
		// never instantiated directly.
		ElementType::Var | ElementType::MVar => (PTR_SIZE, PTR_ALIGN),
		ElementType::Void => return Err(RtErr::BadImageFormat),
		_ => return Err(RtErr::BadImageFormat),
	};
	Ok((size, align))
}

/// CLI sequential layout: walk fields in declaration order, aligning
/// each to `min(natural, packing)`. Instance layout seeds from the
/// parent's size, static layout from zero.
pub fn compute_layout<'l>(
	ctx: &'l Context<'l>,
	fields: &[&RtField<'l>],
	parent_size: u32,
	parent_alignment: u32,
	packing: u32,
) -> RtResult<SizeAndAlignment> {
	let mut offset = parent_size;
	let mut max_alignment = parent_alignment.max(1);

	for field in fields {
		let (size, natural_alignment) = type_sig_size_and_alignment(ctx, field.type_sig)?;
		let alignment = match packing {
			0 => natural_alignment,
			packing => natural_alignment.min(packing),
		};
		offset = align_up_u32(offset, alignment);
		field.offset.set(offset);
		offset += size;
		max_alignment = max_alignment.max(alignment);
	}

	Ok(SizeAndAlignment {
		size: align_up_u32(offset, max_alignment),
		alignment: max_alignment,
	})
}

/// Explicit layout: every field's offset comes from its `FieldLayout`
/// row; the class size covers the furthest field end.
pub fn compute_explicit_layout<'l>(
	ctx: &'l Context<'l>,
	module: &'l Module<'l>,
	fields: &[&RtField<'l>],
) -> RtResult<SizeAndAlignment> {
	let layouts = module
		.tables()
		.get_table::<table::FieldLayoutTable>()
		.ok_or(RtErr::BadImageFormat)?;

	let mut size = 0;
	let mut max_alignment = 1;
	for field in fields {
		let field_rid = MetadataToken::try_from(field.token)
			.map_err(|_| RtErr::BadImageFormat)?
			.index();
		let row = layouts
			.rows()
			.iter()
			.find(|r| r.field.0 == field_rid)
			.ok_or(RtErr::BadImageFormat)?;

		let (field_size, alignment) = type_sig_size_and_alignment(ctx, field.type_sig)?;
		field.offset.set(row.offset);
		size = size.max(row.offset + field_size);
		max_alignment = max_alignment.max(alignment);
	}

	Ok(SizeAndAlignment {
		size,
		alignment: max_alignment,
	})
}

/// Declared `ClassLayout` row of a typedef, if any.
pub fn class_layout_of<'l>(module: &'l Module<'l>, type_def_rid: u32) -> Option<(u32, u32)> {
	let layouts = module.tables().get_table::<table::ClassLayoutTable>()?;
	let range = table::equal_range_by_key(layouts.rows(), type_def_rid as usize, |r| r.parent.0);
	let row = layouts.get(range.start)?;
	match row.parent.0 == type_def_rid as usize {
		true => Some((row.class_size, row.packing_size as u32)),
		false => None,
	}
}

/// Constant blob of a literal field: the `Constant` row's element-type
/// tag plus the raw value bytes.
pub fn field_constant<'l>(module: &'l Module<'l>, field: &RtField<'l>) -> RtResult<(u8, &'l [u8])> {
	let constants = module
		.tables()
		.get_table::<table::ConstantTable>()
		.ok_or(RtErr::MissingField)?;
	let token = MetadataToken::try_from(field.token).map_err(|_| RtErr::BadImageFormat)?;
	let coded = HasConstant::encode(token).ok_or(RtErr::BadImageFormat)?;
	let range = table::equal_range_by_key(constants.rows(), coded.raw() as usize, |r| r.parent.raw() as usize);
	let row = constants.get(range.start).ok_or(RtErr::MissingField)?;
	if row.parent.raw() != coded.raw() {
		return Err(RtErr::MissingField);
	}
	Ok((row.ty, module.get_blob(row.value)?))
}

/// Storage bytes of an RVA-initialized static field inside the image.
pub fn field_rva_data<'l>(module: &'l Module<'l>, field: &RtField<'l>) -> RtResult<&'l [u8]> {
	let rvas = module
		.tables()
		.get_table::<table::FieldRVATable>()
		.ok_or(RtErr::MissingField)?;
	let field_rid = MetadataToken::try_from(field.token)
		.map_err(|_| RtErr::BadImageFormat)?
		.index();
	let range = table::equal_range_by_key(rvas.rows(), field_rid, |r| r.field.0);
	let row = rvas.get(range.start).ok_or(RtErr::MissingField)?;
	if row.field.0 != field_rid {
		return Err(RtErr::MissingField);
	}
	module.image_at_rva(row.rva)
}

#[inline]
const fn align_up_u32(value: u32, alignment: u32) -> u32 {
	(value + alignment - 1) & !(alignment - 1)
}

/// Size one element of `sig` occupies inside an array or an eval-stack
/// location: value types by size, everything else one machine word.
pub fn stack_location_size_of_class<'l>(class: &'l crate::metadata::class::RtClass<'l>) -> u32 {
	match class.is_value_type() {
		true => class.instance_size(),
		false => PTR_SIZE,
	}
}

#[cfg(test)]
mod tests {
	use std::cell::Cell;

	use super::*;
	use crate::context::Context;
	use crate::raw::heaps::table::FieldAttributes;

	fn field<'l>(name: &'l str, sig: &'l TypeSig<'l>) -> RtField<'l> {
		RtField {
			parent: Cell::new(None),
			name,
			token: 0,
			flags: FieldAttributes::empty(),
			type_sig: sig,
			offset: Cell::new(0),
			thread_static: Cell::new(false),
		}
	}

	#[test]
	fn sequential_layout_aligns_to_natural_boundaries() {
		let ctx = Context::new();
		let pool = ctx.sig_pool();
		let a = field("a", pool.primitive(ElementType::I1));
		let b = field("b", pool.primitive(ElementType::I4));
		let c = field("c", pool.primitive(ElementType::I1));

		let result = compute_layout(&ctx, &[&a, &b, &c], 0, 1, 0).unwrap();
		assert_eq!(a.offset.get(), 0);
		assert_eq!(b.offset.get(), 4);
		assert_eq!(c.offset.get(), 8);
		assert_eq!(result.alignment, 4);
		assert_eq!(result.size, 12);
	}

	#[test]
	fn packing_caps_field_alignment() {
		let ctx = Context::new();
		let pool = ctx.sig_pool();
		let a = field("a", pool.primitive(ElementType::I1));
		let b = field("b", pool.primitive(ElementType::I8));

		let result = compute_layout(&ctx, &[&a, &b], 0, 1, 1).unwrap();
		assert_eq!(a.offset.get(), 0);
		assert_eq!(b.offset.get(), 1);
		assert_eq!(result.size, 9);
		assert_eq!(result.alignment, 1);
	}

	#[test]
	fn instance_layout_seeds_from_parent_size() {
		let ctx = Context::new();
		let pool = ctx.sig_pool();
		let a = field("a", pool.primitive(ElementType::I2));

		let result = compute_layout(&ctx, &[&a], 6, 4, 0).unwrap();
		assert_eq!(a.offset.get(), 6);
		assert_eq!(result.size, 8);
		assert_eq!(result.alignment, 4);
	}

	#[test]
	fn by_ref_params_are_machine_words() {
		let ctx = Context::new();
		let pool = ctx.sig_pool();
		let by_ref = pool.by_ref_of(pool.primitive(ElementType::I1));
		assert_eq!(type_sig_size_and_alignment(&ctx, by_ref).unwrap(), (PTR_SIZE, PTR_ALIGN));
	}
}
