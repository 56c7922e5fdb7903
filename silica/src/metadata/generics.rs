use crate::errors::{RtErr, RtResult};
use crate::metadata::typesig::{
	ElementType, GenericInstSig, TypeSig, TypeSigData, TypeSigPool,
};

/// The definition-side list of formal type parameters of a class or method.
#[derive(Debug)]
pub struct GenericContainer<'l> {
	/// Raw metadata token of the owning TypeDef or MethodDef.
	pub owner_token: u32,
	pub is_method: bool,
	pub params: &'l [&'l crate::metadata::typesig::GenericParamDef<'l>],
}

/// Formal-parameter scope active while parsing signatures of a definition.
#[derive(Debug, Default, Copy, Clone)]
pub struct GenericContainerContext<'l> {
	pub class_container: Option<&'l GenericContainer<'l>>,
	pub method_container: Option<&'l GenericContainer<'l>>,
}

/// Instantiation-side substitution vectors.
#[derive(Debug, Default, Copy, Clone)]
pub struct GenericContext<'l> {
	pub class_inst: Option<&'l GenericInstSig<'l>>,
	pub method_inst: Option<&'l GenericInstSig<'l>>,
}

impl<'l> GenericContext<'l> {
	pub fn is_empty(&self) -> bool {
		self.class_inst.is_none() && self.method_inst.is_none()
	}
}

/// Substitutes `Var`/`MVar` through `context`, rebuilding (and re-interning)
/// every composite signature along the way. Signatures containing no
/// variables come back pointer-identical.
pub fn inflate_type_sig<'l>(
	pool: &TypeSigPool<'l>,
	sig: &'l TypeSig<'l>,
	context: &GenericContext<'l>,
) -> RtResult<&'l TypeSig<'l>> {
	if context.is_empty() {
		return Ok(sig);
	}

	let inflated = match sig.element_type {
		ElementType::Var | ElementType::MVar => {
			let TypeSigData::Param(param) = &sig.data else {
				return Err(RtErr::ExecutionEngine);
			};
			let inst = match sig.element_type {
				ElementType::Var => context.class_inst,
				_ => context.method_inst,
			};
			let Some(inst) = inst else {
				// No substitution available; leave the variable open.
				return Ok(sig);
			};
			let arg = inst.args.get(param.number as usize).copied().ok_or(RtErr::BadImageFormat)?;
			match sig.by_ref {
				true => pool.by_ref_of(arg),
				false => arg,
			}
		},
		ElementType::Ptr | ElementType::SZArray => {
			let element = inflate_type_sig(pool, sig.element_sig()?, context)?;
			let base = match sig.element_type {
				ElementType::Ptr => pool.ptr_to(element),
				_ => pool.szarray_of(element),
			};
			match sig.by_ref {
				true => pool.by_ref_of(base),
				false => base,
			}
		},
		ElementType::Array => {
			let TypeSigData::Array(array) = &sig.data else {
				return Err(RtErr::ExecutionEngine);
			};
			let element = inflate_type_sig(pool, array.element, context)?;
			let base = pool.array_of(element, array.rank, array.sizes, array.lower_bounds);
			match sig.by_ref {
				true => pool.by_ref_of(base),
				false => base,
			}
		},
		ElementType::GenericInst => {
			let generic = sig.generic_class()?;
			let mut args = Vec::with_capacity(generic.class_inst.args.len());
			for arg in generic.class_inst.args.iter().copied() {
				args.push(inflate_type_sig(pool, arg, context)?);
			}
			let inst = pool.intern_inst(&args);
			let base = pool.generic_inst_of(generic.base_gid, inst);
			match sig.by_ref {
				true => pool.by_ref_of(base),
				false => base,
			}
		},
		_ => sig,
	};
	Ok(inflated)
}

/// Inflates a whole instantiation vector.
pub fn inflate_inst<'l>(
	pool: &TypeSigPool<'l>,
	inst: &'l GenericInstSig<'l>,
	context: &GenericContext<'l>,
) -> RtResult<&'l GenericInstSig<'l>> {
	if context.is_empty() {
		return Ok(inst);
	}
	let mut args = Vec::with_capacity(inst.args.len());
	for arg in inst.args.iter().copied() {
		args.push(inflate_type_sig(pool, arg, context)?);
	}
	Ok(pool.intern_inst(&args))
}

#[cfg(test)]
mod tests {
	use bumpalo::Bump;

	use super::*;
	use crate::metadata::typesig::encode_gid;

	#[test]
	fn inflating_without_context_is_identity() {
		let bump = Bump::new();
		let pool = TypeSigPool::new(&bump);
		let i4 = pool.primitive(ElementType::I4);
		let arr = pool.szarray_of(i4);
		let ctx = GenericContext::default();
		assert!(std::ptr::eq(inflate_type_sig(&pool, arr, &ctx).unwrap(), arr));
	}

	#[test]
	fn class_variable_substitutes_through_composites() {
		let bump = Bump::new();
		let pool = TypeSigPool::new(&bump);

		let param = pool.intern_param(encode_gid(0, 1), "T", 0, false);
		let var = pool.intern(TypeSig {
			element_type: ElementType::Var,
			by_ref: false,
			data: TypeSigData::Param(param),
		});
		let var_array = pool.szarray_of(var);

		let i8 = pool.primitive(ElementType::I8);
		let inst = pool.intern_inst(&[i8]);
		let ctx = GenericContext {
			class_inst: Some(inst),
			method_inst: None,
		};

		let inflated = inflate_type_sig(&pool, var_array, &ctx).unwrap();
		assert!(std::ptr::eq(inflated, pool.szarray_of(i8)));
	}
}
