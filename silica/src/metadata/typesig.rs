use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use bumpalo::Bump;
use fxhash::FxHashMap;

use crate::errors::{RtErr, RtResult};
use crate::raw::il::CallingConvention;

/// ECMA-335 §II.23.1.16 element types, as they appear in signature blobs.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ElementType {
	End = 0x00,
	Void = 0x01,
	Boolean = 0x02,
	Char = 0x03,
	I1 = 0x04,
	U1 = 0x05,
	I2 = 0x06,
	U2 = 0x07,
	I4 = 0x08,
	U4 = 0x09,
	I8 = 0x0A,
	U8 = 0x0B,
	R4 = 0x0C,
	R8 = 0x0D,
	String = 0x0E,
	Ptr = 0x0F,
	ByRef = 0x10,
	ValueType = 0x11,
	Class = 0x12,
	Var = 0x13,
	Array = 0x14,
	GenericInst = 0x15,
	TypedByRef = 0x16,
	I = 0x18,
	U = 0x19,
	FnPtr = 0x1B,
	Object = 0x1C,
	SZArray = 0x1D,
	MVar = 0x1E,
	CModReqd = 0x1F,
	CModOpt = 0x20,
	Internal = 0x21,
	Modifier = 0x40,
	Sentinel = 0x41,
	Pinned = 0x45,
}

impl ElementType {
	pub fn from_tag(tag: u8) -> Option<Self> {
		Some(match tag {
			0x00 => Self::End,
			0x01 => Self::Void,
			0x02 => Self::Boolean,
			0x03 => Self::Char,
			0x04 => Self::I1,
			0x05 => Self::U1,
			0x06 => Self::I2,
			0x07 => Self::U2,
			0x08 => Self::I4,
			0x09 => Self::U4,
			0x0A => Self::I8,
			0x0B => Self::U8,
			0x0C => Self::R4,
			0x0D => Self::R8,
			0x0E => Self::String,
			0x0F => Self::Ptr,
			0x10 => Self::ByRef,
			0x11 => Self::ValueType,
			0x12 => Self::Class,
			0x13 => Self::Var,
			0x14 => Self::Array,
			0x15 => Self::GenericInst,
			0x16 => Self::TypedByRef,
			0x18 => Self::I,
			0x19 => Self::U,
			0x1B => Self::FnPtr,
			0x1C => Self::Object,
			0x1D => Self::SZArray,
			0x1E => Self::MVar,
			0x1F => Self::CModReqd,
			0x20 => Self::CModOpt,
			0x21 => Self::Internal,
			0x40 => Self::Modifier,
			0x41 => Self::Sentinel,
			0x45 => Self::Pinned,
			_ => return None,
		})
	}
}

/// A global type-def id: module id in the top byte, rid below.
pub type TypeDefGid = u32;

#[inline]
pub fn encode_gid(module_id: u32, rid: u32) -> TypeDefGid {
	(module_id << 24) | (rid & 0x00FF_FFFF)
}

#[inline]
pub fn decode_gid_module(gid: TypeDefGid) -> u32 {
	gid >> 24
}

#[inline]
pub fn decode_gid_rid(gid: TypeDefGid) -> u32 {
	gid & 0x00FF_FFFF
}

/// A formal generic parameter, interned per (owner, number).
#[derive(Debug)]
pub struct GenericParamDef<'l> {
	/// Gid of the GenericParam row that declared it.
	pub gid: u32,
	pub name: &'l str,
	pub number: u16,
	pub is_method_param: bool,
}

#[derive(Debug)]
pub struct GenericInstSig<'l> {
	pub args: &'l [&'l TypeSig<'l>],
}

#[derive(Debug)]
pub struct GenericClassSig<'l> {
	pub base_gid: TypeDefGid,
	pub class_inst: &'l GenericInstSig<'l>,
}

#[derive(Debug)]
pub struct ArrayTypeSig<'l> {
	pub element: &'l TypeSig<'l>,
	pub rank: u8,
	pub sizes: &'l [u32],
	pub lower_bounds: &'l [i32],
}

#[derive(Debug)]
pub struct FnPtrSig<'l> {
	pub call_conv: CallingConvention,
	pub return_type: &'l TypeSig<'l>,
	pub params: &'l [&'l TypeSig<'l>],
}

#[derive(Debug)]
pub enum TypeSigData<'l> {
	None,
	/// `ValueType` / `Class`: the defining row.
	TypeDef(TypeDefGid),
	/// `Ptr` / `SZArray`: the element signature.
	Element(&'l TypeSig<'l>),
	Array(&'l ArrayTypeSig<'l>),
	Generic(&'l GenericClassSig<'l>),
	Param(&'l GenericParamDef<'l>),
	FnPtr(&'l FnPtrSig<'l>),
}

/// An interned, immutable type reference. Two signatures describing the
/// same type are pointer-equal (see `TypeSigPool`).
#[derive(Debug)]
pub struct TypeSig<'l> {
	pub element_type: ElementType,
	pub by_ref: bool,
	pub data: TypeSigData<'l>,
}

impl Eq for TypeSig<'_> {}

impl PartialEq<Self> for TypeSig<'_> {
	#[inline]
	fn eq(&self, other: &Self) -> bool {
		std::ptr::eq(self, other)
	}
}

impl Hash for TypeSig<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(self as *const Self as usize).hash(state)
	}
}

impl Display for TypeSig<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self.element_type {
			ElementType::Void => write!(f, "void"),
			ElementType::Boolean => write!(f, "bool"),
			ElementType::Char => write!(f, "char"),
			ElementType::I1 => write!(f, "sbyte"),
			ElementType::U1 => write!(f, "byte"),
			ElementType::I2 => write!(f, "short"),
			ElementType::U2 => write!(f, "ushort"),
			ElementType::I4 => write!(f, "int"),
			ElementType::U4 => write!(f, "uint"),
			ElementType::I8 => write!(f, "long"),
			ElementType::U8 => write!(f, "ulong"),
			ElementType::R4 => write!(f, "float"),
			ElementType::R8 => write!(f, "double"),
			ElementType::String => write!(f, "string"),
			ElementType::Object => write!(f, "object"),
			ElementType::I => write!(f, "nint"),
			ElementType::U => write!(f, "nuint"),
			ElementType::TypedByRef => write!(f, "System.TypedReference"),
			ElementType::Ptr => match &self.data {
				TypeSigData::Element(e) => write!(f, "{e}*"),
				_ => write!(f, "?*"),
			},
			ElementType::SZArray => match &self.data {
				TypeSigData::Element(e) => write!(f, "{e}[]"),
				_ => write!(f, "?[]"),
			},
			ElementType::Array => match &self.data {
				TypeSigData::Array(a) => {
					write!(f, "{}[", a.element)?;
					for _ in 1..a.rank {
						write!(f, ",")?;
					}
					write!(f, "]")
				},
				_ => write!(f, "?[?]"),
			},
			ElementType::Var => match &self.data {
				TypeSigData::Param(p) => write!(f, "!{}", p.number),
				_ => write!(f, "!?"),
			},
			ElementType::MVar => match &self.data {
				TypeSigData::Param(p) => write!(f, "!!{}", p.number),
				_ => write!(f, "!!?"),
			},
			other => write!(f, "{other:?}"),
		}
	}
}

/// Content key used only while interning; identity afterwards comes from
/// the pooled pointer. Children are interned first, so their addresses
/// are canonical and can stand in for deep content comparison.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
enum SigDataKey {
	None,
	TypeDef(u32),
	Element(usize),
	Array(usize, u8),
	Generic(u32, usize),
	Param(u32),
	FnPtr(usize),
}

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
struct SigKey {
	element_type: ElementType,
	by_ref: bool,
	data: SigDataKey,
}

pub struct TypeSigPool<'l> {
	bump: &'l Bump,
	sigs: RefCell<FxHashMap<SigKey, &'l TypeSig<'l>>>,
	insts: RefCell<HashMap<Vec<usize>, &'l GenericInstSig<'l>>>,
	params: RefCell<FxHashMap<(u32, bool), &'l GenericParamDef<'l>>>,
}

impl<'l> TypeSigPool<'l> {
	pub(crate) fn new(bump: &'l Bump) -> Self {
		Self {
			bump,
			sigs: Default::default(),
			insts: Default::default(),
			params: Default::default(),
		}
	}

	fn key_of(sig: &TypeSig<'l>) -> SigKey {
		let data = match &sig.data {
			TypeSigData::None => SigDataKey::None,
			TypeSigData::TypeDef(gid) => SigDataKey::TypeDef(*gid),
			TypeSigData::Element(e) => SigDataKey::Element(*e as *const _ as usize),
			TypeSigData::Array(a) => SigDataKey::Array(a.element as *const _ as usize, a.rank),
			TypeSigData::Generic(g) => SigDataKey::Generic(g.base_gid, g.class_inst as *const _ as usize),
			TypeSigData::Param(p) => SigDataKey::Param(p.gid),
			TypeSigData::FnPtr(p) => SigDataKey::FnPtr(*p as *const _ as usize),
		};
		SigKey {
			element_type: sig.element_type,
			by_ref: sig.by_ref,
			data,
		}
	}

	/// Interns `sig`, returning the canonical pointer for its content.
	pub fn intern(&self, sig: TypeSig<'l>) -> &'l TypeSig<'l> {
		let key = Self::key_of(&sig);
		let mut sigs = self.sigs.borrow_mut();
		sigs.entry(key).or_insert_with(|| self.bump.alloc(sig))
	}

	pub fn primitive(&self, element_type: ElementType) -> &'l TypeSig<'l> {
		self.intern(TypeSig {
			element_type,
			by_ref: false,
			data: TypeSigData::None,
		})
	}

	pub fn type_def(&self, element_type: ElementType, gid: TypeDefGid, by_ref: bool) -> &'l TypeSig<'l> {
		self.intern(TypeSig {
			element_type,
			by_ref,
			data: TypeSigData::TypeDef(gid),
		})
	}

	pub fn szarray_of(&self, element: &'l TypeSig<'l>) -> &'l TypeSig<'l> {
		self.intern(TypeSig {
			element_type: ElementType::SZArray,
			by_ref: false,
			data: TypeSigData::Element(element),
		})
	}

	pub fn ptr_to(&self, element: &'l TypeSig<'l>) -> &'l TypeSig<'l> {
		self.intern(TypeSig {
			element_type: ElementType::Ptr,
			by_ref: false,
			data: TypeSigData::Element(element),
		})
	}

	/// A by-ref flavor of an existing signature.
	pub fn by_ref_of(&self, sig: &'l TypeSig<'l>) -> &'l TypeSig<'l> {
		if sig.by_ref {
			return sig;
		}
		let data = match &sig.data {
			TypeSigData::None => TypeSigData::None,
			TypeSigData::TypeDef(gid) => TypeSigData::TypeDef(*gid),
			TypeSigData::Element(e) => TypeSigData::Element(*e),
			TypeSigData::Array(a) => TypeSigData::Array(*a),
			TypeSigData::Generic(g) => TypeSigData::Generic(*g),
			TypeSigData::Param(p) => TypeSigData::Param(*p),
			TypeSigData::FnPtr(p) => TypeSigData::FnPtr(*p),
		};
		self.intern(TypeSig {
			element_type: sig.element_type,
			by_ref: true,
			data,
		})
	}

	/// A by-value flavor of an existing signature.
	pub fn by_val_of(&self, sig: &'l TypeSig<'l>) -> &'l TypeSig<'l> {
		if !sig.by_ref {
			return sig;
		}
		let data = match &sig.data {
			TypeSigData::None => TypeSigData::None,
			TypeSigData::TypeDef(gid) => TypeSigData::TypeDef(*gid),
			TypeSigData::Element(e) => TypeSigData::Element(*e),
			TypeSigData::Array(a) => TypeSigData::Array(*a),
			TypeSigData::Generic(g) => TypeSigData::Generic(*g),
			TypeSigData::Param(p) => TypeSigData::Param(*p),
			TypeSigData::FnPtr(p) => TypeSigData::FnPtr(*p),
		};
		self.intern(TypeSig {
			element_type: sig.element_type,
			by_ref: false,
			data,
		})
	}

	/// Arrays are pooled by (element, rank); the optional size/bound
	/// vectors only matter to reflection and ride along with the first
	/// interned instance.
	pub fn array_of(&self, element: &'l TypeSig<'l>, rank: u8, sizes: &[u32], lower_bounds: &[i32]) -> &'l TypeSig<'l> {
		let key = SigKey {
			element_type: ElementType::Array,
			by_ref: false,
			data: SigDataKey::Array(element as *const _ as usize, rank),
		};
		let mut sigs = self.sigs.borrow_mut();
		sigs.entry(key).or_insert_with(|| {
			let array = self.bump.alloc(ArrayTypeSig {
				element,
				rank,
				sizes: self.bump.alloc_slice_copy(sizes),
				lower_bounds: self.bump.alloc_slice_copy(lower_bounds),
			});
			self.bump.alloc(TypeSig {
				element_type: ElementType::Array,
				by_ref: false,
				data: TypeSigData::Array(array),
			})
		})
	}

	pub fn fn_ptr_of(&self, call_conv: crate::raw::il::CallingConvention, return_type: &'l TypeSig<'l>, params: &[&'l TypeSig<'l>]) -> &'l TypeSig<'l> {
		let fn_ptr = self.bump.alloc(FnPtrSig {
			call_conv,
			return_type,
			params: self.bump.alloc_slice_copy(params),
		});
		self.intern(TypeSig {
			element_type: ElementType::FnPtr,
			by_ref: false,
			data: TypeSigData::FnPtr(fn_ptr),
		})
	}

	pub fn generic_inst_of(&self, base_gid: TypeDefGid, inst: &'l GenericInstSig<'l>) -> &'l TypeSig<'l> {
		let class = self.bump.alloc(GenericClassSig {
			base_gid,
			class_inst: inst,
		});
		self.intern(TypeSig {
			element_type: ElementType::GenericInst,
			by_ref: false,
			data: TypeSigData::Generic(class),
		})
	}

	/// Interns a generic argument vector; equal vectors share storage.
	pub fn intern_inst(&self, args: &[&'l TypeSig<'l>]) -> &'l GenericInstSig<'l> {
		let key: Vec<usize> = args.iter().map(|a| *a as *const _ as usize).collect();
		let mut insts = self.insts.borrow_mut();
		insts.entry(key).or_insert_with(|| {
			let args = self.bump.alloc_slice_copy(args);
			self.bump.alloc(GenericInstSig { args })
		})
	}

	/// Interns a generic parameter definition keyed by its declaring row.
	pub fn intern_param(
		&self,
		gid: u32,
		name: &'l str,
		number: u16,
		is_method_param: bool,
	) -> &'l GenericParamDef<'l> {
		let mut params = self.params.borrow_mut();
		params.entry((gid, is_method_param)).or_insert_with(|| {
			self.bump.alloc(GenericParamDef {
				gid,
				name,
				number,
				is_method_param,
			})
		})
	}
}

impl<'l> TypeSig<'l> {
	pub fn is_value_type_like(&self) -> bool {
		matches!(
			self.element_type,
			ElementType::Boolean
				| ElementType::Char
				| ElementType::I1 | ElementType::U1
				| ElementType::I2 | ElementType::U2
				| ElementType::I4 | ElementType::U4
				| ElementType::I8 | ElementType::U8
				| ElementType::R4 | ElementType::R8
				| ElementType::I | ElementType::U
				| ElementType::ValueType
				| ElementType::TypedByRef
		)
	}

	pub fn generic_class(&self) -> RtResult<&'l GenericClassSig<'l>> {
		match &self.data {
			TypeSigData::Generic(g) => Ok(*g),
			_ => Err(RtErr::ExecutionEngine),
		}
	}

	pub fn element_sig(&self) -> RtResult<&'l TypeSig<'l>> {
		match &self.data {
			TypeSigData::Element(e) => Ok(*e),
			TypeSigData::Array(a) => Ok(a.element),
			_ => Err(RtErr::ExecutionEngine),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interned_sigs_are_pointer_equal() {
		let bump = Bump::new();
		let pool = TypeSigPool::new(&bump);

		let a = pool.primitive(ElementType::I4);
		let b = pool.primitive(ElementType::I4);
		assert!(std::ptr::eq(a, b));

		let arr_a = pool.szarray_of(a);
		let arr_b = pool.szarray_of(b);
		assert!(std::ptr::eq(arr_a, arr_b));
		assert!(!std::ptr::eq(a, arr_a));
	}

	#[test]
	fn by_ref_and_by_val_flavors_roundtrip() {
		let bump = Bump::new();
		let pool = TypeSigPool::new(&bump);

		let val = pool.type_def(ElementType::ValueType, encode_gid(0, 3), false);
		let by_ref = pool.by_ref_of(val);
		assert!(by_ref.by_ref);
		assert!(std::ptr::eq(pool.by_val_of(by_ref), val));
		assert!(std::ptr::eq(pool.by_ref_of(val), by_ref));
	}

	#[test]
	fn generic_inst_vectors_are_pooled() {
		let bump = Bump::new();
		let pool = TypeSigPool::new(&bump);

		let i4 = pool.primitive(ElementType::I4);
		let obj = pool.primitive(ElementType::Object);
		let inst_a = pool.intern_inst(&[i4, obj]);
		let inst_b = pool.intern_inst(&[i4, obj]);
		assert!(std::ptr::eq(inst_a, inst_b));

		let sig_a = pool.generic_inst_of(encode_gid(0, 9), inst_a);
		let sig_b = pool.generic_inst_of(encode_gid(0, 9), inst_b);
		assert!(std::ptr::eq(sig_a, sig_b));
	}

	#[test]
	fn gid_encoding_roundtrip() {
		let gid = encode_gid(3, 0x1234);
		assert_eq!(decode_gid_module(gid), 3);
		assert_eq!(decode_gid_rid(gid), 0x1234);
	}
}
