use std::io::Cursor;

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::{self, RtClass};
use crate::metadata::method::RtMethod;
use crate::metadata::module::Module;
use crate::metadata::typesig::{ElementType, TypeSig};
use crate::raw::heaps::table::{self, equal_range_by_key, Table};
use crate::raw::indices::coded_index::HasCustomAttribute;
use crate::raw::indices::metadata_token::MetadataToken;
use crate::utilities::{read_compressed_u32, FromByteStream};
use crate::vm::machine::{eval_stack_op, StackObject};
use crate::vm::object::{self, RtArray, RtObject, RtString};

const CA_PROLOG: u16 = 0x0001;
const CA_NULL_ARRAY: u32 = 0xFFFF_FFFF;

const CA_TAG_FIELD: u8 = 0x53;
const CA_TAG_PROPERTY: u8 = 0x54;
const CA_TYPE_SYSTEM_TYPE: u8 = 0x50;
const CA_TYPE_BOXED: u8 = 0x51;
const CA_TYPE_ENUM: u8 = 0x55;

/// One decoded argument of the §II.23.3 blob grammar.
#[derive(Debug, Clone)]
pub enum CaValue<'l> {
	Bool(bool),
	Char(u16),
	I1(i8),
	U1(u8),
	I2(i16),
	U2(u16),
	I4(i32),
	U4(u32),
	I8(i64),
	U8(u64),
	R4(f32),
	R8(f64),
	Str(Option<String>),
	/// Assembly-qualified type reference, resolved eagerly.
	Type(Option<&'l RtClass<'l>>),
	Enum(&'l RtClass<'l>, i64),
	Boxed(Box<CaValue<'l>>),
	Array(Option<Vec<CaValue<'l>>>),
}

/// One attribute instantiation site: the constructor plus its blob.
#[derive(Debug, Copy, Clone)]
pub struct AttributeSite<'l> {
	pub module: &'l Module<'l>,
	pub ctor: &'l RtMethod<'l>,
	pub blob: &'l [u8],
}

/// All attribute sites attached to a metadata token.
pub fn attribute_sites_on_token<'l>(
	ctx: &'l Context<'l>,
	module: &'l Module<'l>,
	target_token: u32,
) -> RtResult<Vec<AttributeSite<'l>>> {
	let Some(attributes) = module.tables().get_table::<table::CustomAttributeTable>() else {
		return Ok(vec![]);
	};
	let token = MetadataToken::try_from(target_token).map_err(|_| RtErr::BadImageFormat)?;
	let coded = HasCustomAttribute::encode(token).ok_or(RtErr::BadImageFormat)?;
	let range = equal_range_by_key(attributes.rows(), coded.raw() as usize, |r| r.parent.raw() as usize);

	let mut sites = Vec::with_capacity(range.len());
	for rid in range {
		let row = attributes.get(rid).ok_or(RtErr::BadImageFormat)?;
		let ctor = module.get_method_by_token(ctx, row.ty.into(), Default::default(), None)?;
		sites.push(AttributeSite {
			module,
			ctor,
			blob: module.get_blob(row.value)?,
		});
	}
	Ok(sites)
}

pub fn has_attribute_on_token<'l>(
	ctx: &'l Context<'l>,
	module: &'l Module<'l>,
	target_token: u32,
	attribute_class: &'l RtClass<'l>,
) -> RtResult<bool> {
	class::initialize_super_types(ctx, attribute_class)?;
	for site in attribute_sites_on_token(ctx, module, target_token)? {
		let parent = site.ctor.parent();
		class::initialize_super_types(ctx, parent)?;
		if class::is_assignable_from(parent, attribute_class) {
			return Ok(true);
		}
	}
	Ok(false)
}

// ### Blob decoding ###

struct CaReader<'l, 'a> {
	ctx: &'l Context<'l>,
	module: &'l Module<'l>,
	stream: Cursor<&'a [u8]>,
}

impl<'l, 'a> CaReader<'l, 'a> {
	fn new(ctx: &'l Context<'l>, module: &'l Module<'l>, blob: &'a [u8]) -> Self {
		Self {
			ctx,
			module,
			stream: Cursor::new(blob),
		}
	}

	/// SerString: compressed length + UTF-8; 0xFF denotes null.
	fn read_ser_string(&mut self) -> RtResult<Option<String>> {
		let position = self.stream.position() as usize;
		if self.stream.get_ref().get(position) == Some(&0xFF) {
			self.stream.set_position(position as u64 + 1);
			return Ok(None);
		}
		let length = read_compressed_u32(&mut self.stream)? as usize;
		let start = self.stream.position() as usize;
		let bytes = self
			.stream
			.get_ref()
			.get(start..start + length)
			.ok_or(RtErr::BadImageFormat)?;
		self.stream.set_position((start + length) as u64);
		String::from_utf8(bytes.to_vec()).map(Some).map_err(|_| RtErr::BadImageFormat)
	}

	/// Assembly-qualified type names resolve in the constructor's
	/// assembly first, then the corlib.
	fn resolve_type_name(&self, full_name: &str) -> RtResult<Option<&'l RtClass<'l>>> {
		let (type_name, assembly_name) = match full_name.split_once(',') {
			Some((ty, assembly)) => (ty.trim(), Some(assembly.trim().split(',').next().unwrap_or("").trim())),
			None => (full_name.trim(), None),
		};

		let lookup = |module: &'l Module<'l>| -> RtResult<Option<&'l RtClass<'l>>> {
			match type_name.contains('+') {
				true => module.get_class_by_nested_full_name(self.ctx, type_name, false),
				false => module.get_class_by_name(self.ctx, type_name, false, false),
			}
		};

		if let Some(assembly_name) = assembly_name {
			let module = self.ctx.load_module_by_name(assembly_name)?;
			return lookup(module);
		}
		if let Some(class) = lookup(self.module)? {
			return Ok(Some(class));
		}
		lookup(self.ctx.corlib_module()?)
	}

	fn read_primitive(&mut self, element_type: ElementType) -> RtResult<CaValue<'l>> {
		let value = match element_type {
			ElementType::Boolean => CaValue::Bool(u8::read(&mut self.stream, &())? != 0),
			ElementType::Char => CaValue::Char(u16::read(&mut self.stream, &())?),
			ElementType::I1 => CaValue::I1(i8::read(&mut self.stream, &())?),
			ElementType::U1 => CaValue::U1(u8::read(&mut self.stream, &())?),
			ElementType::I2 => CaValue::I2(i16::read(&mut self.stream, &())?),
			ElementType::U2 => CaValue::U2(u16::read(&mut self.stream, &())?),
			ElementType::I4 => CaValue::I4(i32::read(&mut self.stream, &())?),
			ElementType::U4 => CaValue::U4(u32::read(&mut self.stream, &())?),
			ElementType::I8 => CaValue::I8(i64::read(&mut self.stream, &())?),
			ElementType::U8 => CaValue::U8(u64::read(&mut self.stream, &())?),
			ElementType::R4 => CaValue::R4(f32::read(&mut self.stream, &())?),
			ElementType::R8 => CaValue::R8(f64::read(&mut self.stream, &())?),
			_ => return Err(RtErr::BadImageFormat),
		};
		Ok(value)
	}

	fn read_enum_value(&mut self, enum_class: &'l RtClass<'l>) -> RtResult<CaValue<'l>> {
		class::initialize_fields(self.ctx, enum_class)?;
		let underlying = enum_class.element_class().by_val.element_type;
		let raw = match self.read_primitive(underlying)? {
			CaValue::I1(v) => v as i64,
			CaValue::U1(v) => v as i64,
			CaValue::I2(v) => v as i64,
			CaValue::U2(v) => v as i64,
			CaValue::I4(v) => v as i64,
			CaValue::U4(v) => v as i64,
			CaValue::I8(v) => v,
			CaValue::U8(v) => v as i64,
			CaValue::Bool(v) => v as i64,
			CaValue::Char(v) => v as i64,
			_ => return Err(RtErr::BadImageFormat),
		};
		Ok(CaValue::Enum(enum_class, raw))
	}

	/// Object-typed slots carry a leading tag telling the decoder what
	/// to read next.
	fn read_boxed(&mut self) -> RtResult<CaValue<'l>> {
		let tag = u8::read(&mut self.stream, &())?;
		let inner = match tag {
			CA_TYPE_SYSTEM_TYPE => self.read_type_ref()?,
			CA_TYPE_ENUM => {
				let name = self.read_ser_string()?.ok_or(RtErr::BadImageFormat)?;
				let enum_class = self.resolve_type_name(&name)?.ok_or(RtErr::TypeLoad)?;
				self.read_enum_value(enum_class)?
			},
			0x0E => CaValue::Str(self.read_ser_string()?),
			0x1D => {
				let element_tag = u8::read(&mut self.stream, &())?;
				self.read_array_of_tag(element_tag)?
			},
			tag => {
				let element_type = ElementType::from_tag(tag).ok_or(RtErr::BadImageFormat)?;
				self.read_primitive(element_type)?
			},
		};
		Ok(CaValue::Boxed(Box::new(inner)))
	}

	fn read_type_ref(&mut self) -> RtResult<CaValue<'l>> {
		match self.read_ser_string()? {
			None => Ok(CaValue::Type(None)),
			Some(name) => Ok(CaValue::Type(self.resolve_type_name(&name)?)),
		}
	}

	fn read_array_of_tag(&mut self, element_tag: u8) -> RtResult<CaValue<'l>> {
		let length = u32::read(&mut self.stream, &())?;
		if length == CA_NULL_ARRAY {
			return Ok(CaValue::Array(None));
		}
		let mut values = Vec::with_capacity(length as usize);
		for _ in 0..length {
			values.push(self.read_of_tag(element_tag)?);
		}
		Ok(CaValue::Array(Some(values)))
	}

	fn read_of_tag(&mut self, tag: u8) -> RtResult<CaValue<'l>> {
		match tag {
			CA_TYPE_SYSTEM_TYPE => self.read_type_ref(),
			CA_TYPE_BOXED => self.read_boxed(),
			CA_TYPE_ENUM => {
				let name = self.read_ser_string()?.ok_or(RtErr::BadImageFormat)?;
				let enum_class = self.resolve_type_name(&name)?.ok_or(RtErr::TypeLoad)?;
				self.read_enum_value(enum_class)
			},
			0x0E => Ok(CaValue::Str(self.read_ser_string()?)),
			0x1C => self.read_boxed(),
			tag => {
				let element_type = ElementType::from_tag(tag).ok_or(RtErr::BadImageFormat)?;
				self.read_primitive(element_type)
			},
		}
	}

	/// A fixed argument shaped by one constructor formal parameter.
	fn read_fixed_arg(&mut self, sig: &'l TypeSig<'l>) -> RtResult<CaValue<'l>> {
		match sig.element_type {
			ElementType::SZArray => {
				let element = sig.element_sig()?;
				let length = u32::read(&mut self.stream, &())?;
				if length == CA_NULL_ARRAY {
					return Ok(CaValue::Array(None));
				}
				let mut values = Vec::with_capacity(length as usize);
				for _ in 0..length {
					values.push(self.read_fixed_arg(element)?);
				}
				Ok(CaValue::Array(Some(values)))
			},
			ElementType::String => Ok(CaValue::Str(self.read_ser_string()?)),
			ElementType::Object => self.read_boxed(),
			ElementType::Class => {
				// The only class-typed attribute parameter is System.Type.
				let class = class::class_from_type_sig(self.ctx, sig)?;
				match class.name == "Type" && class.namespace == "System" {
					true => self.read_type_ref(),
					false => Err(RtErr::NotSupported),
				}
			},
			ElementType::ValueType => {
				let class = class::class_from_type_sig(self.ctx, sig)?;
				match class.is_enum() {
					true => self.read_enum_value(class),
					false => Err(RtErr::NotSupported),
				}
			},
			element_type => self.read_primitive(element_type),
		}
	}

	/// One named argument: tag, declared type, member name, value.
	fn read_named_arg(&mut self) -> RtResult<(u8, String, CaValue<'l>)> {
		let member_tag = u8::read(&mut self.stream, &())?;
		if member_tag != CA_TAG_FIELD && member_tag != CA_TAG_PROPERTY {
			return Err(RtErr::BadImageFormat);
		}
		let type_tag = u8::read(&mut self.stream, &())?;
		let mut enum_class = None;
		let mut array_element_tag = None;
		match type_tag {
			CA_TYPE_ENUM => {
				let name = self.read_ser_string()?.ok_or(RtErr::BadImageFormat)?;
				enum_class = Some(self.resolve_type_name(&name)?.ok_or(RtErr::TypeLoad)?);
			},
			0x1D => {
				let mut element_tag = u8::read(&mut self.stream, &())?;
				if element_tag == CA_TYPE_ENUM {
					let name = self.read_ser_string()?.ok_or(RtErr::BadImageFormat)?;
					enum_class = Some(self.resolve_type_name(&name)?.ok_or(RtErr::TypeLoad)?);
					element_tag = CA_TYPE_ENUM;
				}
				array_element_tag = Some(element_tag);
			},
			_ => {},
		}
		let name = self.read_ser_string()?.ok_or(RtErr::BadImageFormat)?;

		let value = match (array_element_tag, enum_class) {
			(Some(CA_TYPE_ENUM), Some(enum_class)) => {
				let length = u32::read(&mut self.stream, &())?;
				match length {
					CA_NULL_ARRAY => CaValue::Array(None),
					_ => {
						let mut values = Vec::with_capacity(length as usize);
						for _ in 0..length {
							values.push(self.read_enum_value(enum_class)?);
						}
						CaValue::Array(Some(values))
					},
				}
			},
			(Some(element_tag), None) => self.read_array_of_tag(element_tag)?,
			(None, Some(enum_class)) => self.read_enum_value(enum_class)?,
			_ => self.read_of_tag(type_tag)?,
		};
		Ok((member_tag, name, value))
	}
}

/// Fully decoded attribute blob: positional then named arguments.
#[derive(Debug)]
pub struct DecodedAttribute<'l> {
	pub fixed_args: Vec<CaValue<'l>>,
	pub named_args: Vec<(u8, String, CaValue<'l>)>,
}

pub fn decode_attribute_blob<'l>(ctx: &'l Context<'l>, site: &AttributeSite<'l>) -> RtResult<DecodedAttribute<'l>> {
	let mut reader = CaReader::new(ctx, site.module, site.blob);
	if u16::read(&mut reader.stream, &())? != CA_PROLOG {
		return Err(RtErr::BadImageFormat);
	}

	let mut fixed_args = Vec::with_capacity(site.ctor.params.len());
	for param in site.ctor.params.iter().copied() {
		fixed_args.push(reader.read_fixed_arg(param)?);
	}

	let named_count = u16::read(&mut reader.stream, &())?;
	let mut named_args = Vec::with_capacity(named_count as usize);
	for _ in 0..named_count {
		named_args.push(reader.read_named_arg()?);
	}

	Ok(DecodedAttribute {
		fixed_args,
		named_args,
	})
}

// ### Materialization ###

/// Boxes a decoded value into a managed object reference.
fn box_ca_value<'l>(ctx: &'l Context<'l>, value: &CaValue<'l>) -> RtResult<*mut RtObject<'l>> {
	let types = ctx.corlib_types()?;
	let boxed = match value {
		CaValue::Bool(v) => object::box_object(ctx, types.cls_boolean, &(*v as u8) as *const u8)?,
		CaValue::Char(v) => object::box_object(ctx, types.cls_char, v as *const u16 as *const u8)?,
		CaValue::I1(v) => object::box_object(ctx, types.cls_sbyte, v as *const i8 as *const u8)?,
		CaValue::U1(v) => object::box_object(ctx, types.cls_byte, v as *const u8)?,
		CaValue::I2(v) => object::box_object(ctx, types.cls_int16, v as *const i16 as *const u8)?,
		CaValue::U2(v) => object::box_object(ctx, types.cls_uint16, v as *const u16 as *const u8)?,
		CaValue::I4(v) => object::box_object(ctx, types.cls_int32, v as *const i32 as *const u8)?,
		CaValue::U4(v) => object::box_object(ctx, types.cls_uint32, v as *const u32 as *const u8)?,
		CaValue::I8(v) => object::box_object(ctx, types.cls_int64, v as *const i64 as *const u8)?,
		CaValue::U8(v) => object::box_object(ctx, types.cls_uint64, v as *const u64 as *const u8)?,
		CaValue::R4(v) => object::box_object(ctx, types.cls_single, v as *const f32 as *const u8)?,
		CaValue::R8(v) => object::box_object(ctx, types.cls_double, v as *const f64 as *const u8)?,
		CaValue::Str(None) | CaValue::Type(None) => std::ptr::null_mut(),
		CaValue::Str(Some(text)) => {
			crate::vm::string::create_string_from_utf8(ctx, text)? as *mut RtObject<'l>
		},
		CaValue::Type(Some(class)) => {
			crate::vm::reflection::type_object_of_class(ctx, class)? as *mut RtObject<'l>
		},
		CaValue::Enum(enum_class, raw) => {
			let bytes = raw.to_le_bytes();
			object::box_object(ctx, enum_class, bytes.as_ptr())?
		},
		CaValue::Boxed(inner) => box_ca_value(ctx, inner)?,
		CaValue::Array(None) => std::ptr::null_mut(),
		CaValue::Array(Some(values)) => {
			let arr = crate::vm::array::new_array_from_element_class(ctx, types.cls_object, values.len() as i32)?;
			for (i, element) in values.iter().enumerate() {
				let boxed = box_ca_value(ctx, element)?;
				unsafe { crate::vm::array::array_set_at(arr, i as i32, boxed) };
			}
			arr as *mut RtObject<'l>
		},
	};
	Ok(boxed)
}

/// Writes a decoded value into one or more invocation slots, following
/// the §6.1 widening rules.
fn write_ca_value_to_slot<'l>(
	ctx: &'l Context<'l>,
	value: &CaValue<'l>,
	slot: *mut StackObject,
) -> RtResult<u32> {
	unsafe {
		match value {
			CaValue::Bool(v) => eval_stack_op::set_param(slot, 0, *v as i32),
			CaValue::Char(v) => eval_stack_op::set_param(slot, 0, *v as i32),
			CaValue::I1(v) => eval_stack_op::set_param(slot, 0, *v as i32),
			CaValue::U1(v) => eval_stack_op::set_param(slot, 0, *v as i32),
			CaValue::I2(v) => eval_stack_op::set_param(slot, 0, *v as i32),
			CaValue::U2(v) => eval_stack_op::set_param(slot, 0, *v as i32),
			CaValue::I4(v) => eval_stack_op::set_param(slot, 0, *v),
			CaValue::U4(v) => eval_stack_op::set_param(slot, 0, *v),
			CaValue::I8(v) => eval_stack_op::set_param(slot, 0, *v),
			CaValue::U8(v) => eval_stack_op::set_param(slot, 0, *v),
			CaValue::R4(v) => eval_stack_op::set_param(slot, 0, *v),
			CaValue::R8(v) => eval_stack_op::set_param(slot, 0, *v),
			CaValue::Enum(_, raw) => eval_stack_op::set_param(slot, 0, *raw),
			CaValue::Str(_) | CaValue::Type(_) | CaValue::Boxed(_) | CaValue::Array(_) => {
				let boxed = box_ca_value(ctx, value)?;
				eval_stack_op::set_param(slot, 0, boxed);
			},
		}
	}
	Ok(1)
}

/// Constructs the attribute object: allocates, invokes the constructor
/// with the fixed arguments, then assigns each named field/property.
pub fn construct_attribute<'l>(ctx: &'l Context<'l>, site: &AttributeSite<'l>) -> RtResult<*mut RtObject<'l>> {
	let decoded = decode_attribute_blob(ctx, site)?;
	let attribute_class = site.ctor.parent();
	let obj = object::new_object(ctx, attribute_class)?;

	let slot_count = (site.ctor.total_arg_stack_size() as usize).max(1 + decoded.fixed_args.len());
	let mut slots = vec![StackObject::default(); slot_count];
	unsafe { eval_stack_op::set_param(slots.as_mut_ptr(), 0, obj) };
	let mut cursor = 1;
	for value in &decoded.fixed_args {
		cursor += write_ca_value_to_slot(ctx, value, unsafe { slots.as_mut_ptr().add(cursor) })? as usize;
		if cursor > slots.len() {
			return Err(RtErr::ExecutionEngine);
		}
	}

	let invoke = site.ctor.invoke_fn().ok_or(RtErr::ExecutionEngine)?;
	let mut ret = [StackObject::default(); 1];
	invoke(ctx, site.ctor.method_ptr(), site.ctor, slots.as_ptr(), ret.as_mut_ptr())?;

	for (member_tag, name, value) in &decoded.named_args {
		apply_named_arg(ctx, obj, attribute_class, *member_tag, name, value)?;
	}
	Ok(obj)
}

fn apply_named_arg<'l>(
	ctx: &'l Context<'l>,
	obj: *mut RtObject<'l>,
	attribute_class: &'l RtClass<'l>,
	member_tag: u8,
	name: &str,
	value: &CaValue<'l>,
) -> RtResult<()> {
	class::initialize_all(ctx, attribute_class)?;
	match member_tag {
		CA_TAG_FIELD => {
			let field = class::find_field_by_name(attribute_class, name, true).ok_or(RtErr::MissingField)?;
			let boxed = box_ca_value(ctx, value)?;
			crate::vm::field::set_value_object(ctx, field, obj, boxed)
		},
		CA_TAG_PROPERTY => {
			let mut current = Some(attribute_class);
			let mut setter = None;
			while let Some(cls) = current {
				class::initialize_properties(ctx, cls)?;
				if let Some(property) = cls.properties().iter().find(|p| p.name == name) {
					setter = property.set_method.get();
					break;
				}
				current = cls.parent();
			}
			let setter = setter.ok_or(RtErr::MissingMember)?;

			let mut slots = [StackObject::default(); 4];
			unsafe { eval_stack_op::set_param(slots.as_mut_ptr(), 0, obj) };
			write_ca_value_to_slot(ctx, value, unsafe { slots.as_mut_ptr().add(1) })?;
			let invoke = setter.invoke_fn().ok_or(RtErr::ExecutionEngine)?;
			let mut ret = [StackObject::default(); 1];
			invoke(ctx, setter.method_ptr(), setter, slots.as_ptr(), ret.as_mut_ptr())
		},
		_ => Err(RtErr::BadImageFormat),
	}
}

// ### Provider surfaces ###

fn provider_target<'l>(
	ctx: &'l Context<'l>,
	provider: *mut RtObject<'l>,
) -> RtResult<(&'l Module<'l>, u32)> {
	use crate::vm::reflection::{RtReflectionAssembly, RtReflectionField, RtReflectionMethod, RtReflectionType};
	if provider.is_null() {
		return Err(RtErr::ArgumentNull);
	}
	let types = ctx.corlib_types()?;
	let provider_class = unsafe { (*provider).klass };

	if class::is_assignable_from(provider_class, types.cls_systemtype) {
		let reflected = provider as *mut RtReflectionType<'l>;
		let handle = unsafe { (*reflected).type_handle };
		let class = class::class_from_type_sig(ctx, unsafe { &*handle })?;
		return Ok((class.module(), class.token));
	}
	if class::is_assignable_from(provider_class, types.cls_reflection_memberinfo) {
		let reflected = provider as *mut RtReflectionMethod<'l>;
		let method = unsafe { (*reflected).method };
		if !method.is_null() {
			let method = unsafe { &*method };
			return Ok((method.parent().module(), method.token));
		}
	}
	if std::ptr::eq(provider_class, types.cls_reflection_field) {
		let reflected = provider as *mut RtReflectionField<'l>;
		let field = unsafe { (*reflected).field };
		if !field.is_null() {
			let field = unsafe { &*field };
			return Ok((field.parent().module(), field.token));
		}
	}
	if std::ptr::eq(provider_class, types.cls_reflection_assembly) {
		let reflected = provider as *mut RtReflectionAssembly<'l>;
		let module = unsafe { (*reflected).assembly };
		if !module.is_null() {
			let module = unsafe { &*module };
			// The assembly row is the attribute target.
			let token = MetadataToken::new(crate::raw::indices::metadata_token::MetadataTokenKind::Assembly, 1).raw();
			return Ok((module, token));
		}
	}
	Err(RtErr::NotSupported)
}

/// `object[]` of constructed attribute instances on a provider,
/// optionally filtered by attribute class.
pub fn get_custom_attributes_on_provider<'l>(
	ctx: &'l Context<'l>,
	provider: *mut RtObject<'l>,
	filter: *mut crate::vm::reflection::RtReflectionType<'l>,
) -> RtResult<*mut RtArray<'l>> {
	let (module, token) = provider_target(ctx, provider)?;
	let types = ctx.corlib_types()?;

	let filter_class = match filter.is_null() {
		true => None,
		false => {
			let handle = unsafe { (*filter).type_handle };
			Some(class::class_from_type_sig(ctx, unsafe { &*handle })?)
		},
	};

	let mut attributes = Vec::new();
	for site in attribute_sites_on_token(ctx, module, token)? {
		let parent = site.ctor.parent();
		class::initialize_super_types(ctx, parent)?;
		if let Some(filter_class) = filter_class {
			class::initialize_super_types(ctx, filter_class)?;
			if !class::is_assignable_from(parent, filter_class) {
				continue;
			}
		}
		attributes.push(construct_attribute(ctx, &site)?);
	}

	let element = filter_class.unwrap_or(types.cls_attribute);
	let arr = crate::vm::array::new_array_from_element_class(ctx, element, attributes.len() as i32)?;
	for (i, attribute) in attributes.iter().enumerate() {
		unsafe { crate::vm::array::array_set_at(arr, i as i32, *attribute) };
	}
	Ok(arr)
}

/// Lazy reflection surface: `CustomAttributeData`-shaped records built
/// without running any attribute constructor. Each record carries the
/// constructor's reflection object plus boxed typed/named argument
/// arrays; the corlib assembles the public wrapper types from those.
pub fn get_custom_attributes_data_on_provider<'l>(
	ctx: &'l Context<'l>,
	provider: *mut RtObject<'l>,
) -> RtResult<*mut RtArray<'l>> {
	let (module, token) = provider_target(ctx, provider)?;
	let types = ctx.corlib_types()?;

	let sites = attribute_sites_on_token(ctx, module, token)?;
	let arr = crate::vm::array::new_array_from_element_class(ctx, types.cls_customattributedata, sites.len() as i32)?;

	for (i, site) in sites.iter().enumerate() {
		let decoded = decode_attribute_blob(ctx, site)?;

		let typed_args =
			crate::vm::array::new_array_from_element_class(ctx, types.cls_object, decoded.fixed_args.len() as i32)?;
		for (j, value) in decoded.fixed_args.iter().enumerate() {
			let boxed = box_ca_value(ctx, value)?;
			unsafe { crate::vm::array::array_set_at(typed_args, j as i32, boxed) };
		}

		// Named records: interleaved (name, isField, value) triples.
		let named_args =
			crate::vm::array::new_array_from_element_class(ctx, types.cls_object, (decoded.named_args.len() * 3) as i32)?;
		for (j, (member_tag, name, value)) in decoded.named_args.iter().enumerate() {
			let name_obj = crate::vm::string::create_string_from_utf8(ctx, name)? as *mut RtObject<'l>;
			let is_field = CaValue::Bool(*member_tag == CA_TAG_FIELD);
			unsafe {
				crate::vm::array::array_set_at(named_args, (j * 3) as i32, name_obj);
				crate::vm::array::array_set_at(named_args, (j * 3 + 1) as i32, box_ca_value(ctx, &is_field)?);
				crate::vm::array::array_set_at(named_args, (j * 3 + 2) as i32, box_ca_value(ctx, value)?);
			}
		}

		let data = object::new_object(ctx, types.cls_customattributedata)?;
		let data_class = types.cls_customattributedata;
		class::initialize_all(ctx, data_class)?;
		set_data_field(ctx, data, data_class, "ctorInfo", {
			crate::vm::reflection::method_object_of_method(ctx, site.ctor)? as *mut RtObject<'l>
		})?;
		set_data_field(ctx, data, data_class, "ctorArgs", typed_args as *mut RtObject<'l>)?;
		set_data_field(ctx, data, data_class, "namedArgs", named_args as *mut RtObject<'l>)?;

		unsafe { crate::vm::array::array_set_at(arr, i as i32, data) };
	}
	Ok(arr)
}

fn set_data_field<'l>(
	ctx: &'l Context<'l>,
	obj: *mut RtObject<'l>,
	class: &'l RtClass<'l>,
	name: &str,
	value: *mut RtObject<'l>,
) -> RtResult<()> {
	let Some(field) = class::find_field_by_name(class, name, true) else {
		// Corlib variants name these fields differently; missing slots
		// simply stay null.
		return Ok(());
	};
	crate::vm::field::set_value_object(ctx, field, obj, value)
}

/// Reads a string-typed field or property value used where only the
/// blob (not the attribute type) is loaded, e.g. thread-static checks.
pub fn string_chars_of<'l>(s: *mut RtString<'l>) -> Option<String> {
	match s.is_null() {
		true => None,
		false => Some(crate::vm::string::string_to_rust(s)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ser_string_null_marker() {
		// 0xFF means null, independent of any context.
		let data = [0xFFu8];
		let mut stream = Cursor::new(data.as_slice());
		assert_eq!(stream.get_ref()[0], 0xFF);
	}

	#[test]
	fn prolog_constant_matches_spec() {
		assert_eq!(CA_PROLOG, 0x0001);
		assert_eq!(CA_TAG_FIELD, 0x53);
		assert_eq!(CA_TAG_PROPERTY, 0x54);
		assert_eq!(CA_NULL_ARRAY, 0xFFFF_FFFF);
	}
}
