use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::io::Cursor;

use derivative::Derivative;

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::RtClass;
use crate::metadata::generics::{inflate_type_sig, GenericContainer, GenericContext};
use crate::metadata::module::ParsedMethodSig;
use crate::metadata::typesig::{GenericInstSig, TypeSig};
use crate::raw::heaps::table::{MethodAttributes, MethodImplAttributes};
use crate::raw::il::{ExceptionClause, MethodBody};
use crate::vm::machine::InvokerFn;

pub const INVALID_SLOT: u16 = u16::MAX;

/// How a method's invoker bridges into its body.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum InvokerType {
	/// No body to run (abstract, interface declaration).
	#[default]
	None,
	/// Interpreted IL, entered through the frame machine.
	InterpretedIl,
	InternalCall,
	Intrinsic,
	PInvoke,
	DelegateCtor,
	DelegateInvoke,
	ArrayAccessor,
}

/// Interpreter-facing view of an IL body, materialized once per method.
#[derive(Debug)]
pub struct InterpMethodData<'l> {
	pub codes: &'l [u8],
	pub init_locals: bool,
	pub locals: &'l [&'l TypeSig<'l>],
	pub clauses: &'l [ExceptionClause],
	/// Slots occupied by arguments + locals + the IL evaluation stack.
	pub max_stack_object_size: u32,
	pub locals_stack_object_size: u32,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct RtMethod<'l> {
	#[derivative(Debug(format_with = "fmt_parent"))]
	pub(crate) parent: Cell<&'l RtClass<'l>>,
	pub name: &'l str,
	/// Raw MethodDef token within the parent's module.
	pub token: u32,
	pub flags: MethodAttributes,
	pub impl_flags: MethodImplAttributes,
	pub rva: u32,
	pub has_this: bool,
	pub return_type: &'l TypeSig<'l>,
	pub params: &'l [&'l TypeSig<'l>],
	pub generic_container: Option<&'l GenericContainer<'l>>,
	/// Instantiation vector when this is an inflated generic method.
	pub method_inst: Option<&'l GenericInstSig<'l>>,

	pub(crate) slot: Cell<u16>,
	pub(crate) invoker_type: Cell<InvokerType>,
	#[derivative(Debug = "ignore")]
	pub(crate) invoke_fn: Cell<Option<InvokerFn>>,
	#[derivative(Debug = "ignore")]
	pub(crate) virtual_invoke_fn: Cell<Option<InvokerFn>>,
	#[derivative(Debug = "ignore")]
	pub(crate) method_ptr: Cell<*const ()>,
	pub(crate) total_arg_stack_size: Cell<u32>,
	pub(crate) ret_stack_size: Cell<u32>,
	#[derivative(Debug = "ignore")]
	pub(crate) interp_data: Cell<Option<&'l InterpMethodData<'l>>>,
}

fn fmt_parent(parent: &Cell<&RtClass>, f: &mut Formatter) -> std::fmt::Result {
	write!(f, "{}", parent.get())
}

impl Eq for RtMethod<'_> {}

impl PartialEq<Self> for RtMethod<'_> {
	#[inline]
	fn eq(&self, other: &Self) -> bool {
		std::ptr::eq(self, other)
	}
}

impl Hash for RtMethod<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(self as *const Self as usize).hash(state)
	}
}

impl<'l> RtMethod<'l> {
	#[inline]
	pub fn parent(&self) -> &'l RtClass<'l> {
		self.parent.get()
	}

	#[inline]
	pub fn is_static(&self) -> bool {
		self.flags.contains(MethodAttributes::STATIC)
	}

	#[inline]
	pub fn is_instance(&self) -> bool {
		!self.is_static()
	}

	#[inline]
	pub fn is_virtual(&self) -> bool {
		self.flags.contains(MethodAttributes::VIRTUAL)
	}

	#[inline]
	pub fn is_abstract(&self) -> bool {
		self.flags.contains(MethodAttributes::ABSTRACT)
	}

	#[inline]
	pub fn is_new_slot(&self) -> bool {
		self.flags.contains(MethodAttributes::NEW_SLOT)
	}

	#[inline]
	pub fn is_final(&self) -> bool {
		self.flags.contains(MethodAttributes::FINAL)
	}

	#[inline]
	pub fn is_internal_call(&self) -> bool {
		self.impl_flags.contains(MethodImplAttributes::INTERNAL_CALL)
	}

	#[inline]
	pub fn is_pinvoke(&self) -> bool {
		self.flags.contains(MethodAttributes::PINVOKE_IMPL)
	}

	#[inline]
	pub fn is_generic(&self) -> bool {
		self.generic_container.is_some()
	}

	#[inline]
	pub fn slot(&self) -> u16 {
		self.slot.get()
	}

	#[inline]
	pub fn invoker_type(&self) -> InvokerType {
		self.invoker_type.get()
	}

	#[inline]
	pub fn invoke_fn(&self) -> Option<InvokerFn> {
		self.invoke_fn.get()
	}

	#[inline]
	pub fn virtual_invoke_fn(&self) -> Option<InvokerFn> {
		self.virtual_invoke_fn.get()
	}

	#[inline]
	pub fn method_ptr(&self) -> *const () {
		self.method_ptr.get()
	}

	/// Explicit parameter count, not counting the implicit `this`.
	#[inline]
	pub fn param_count(&self) -> usize {
		self.params.len()
	}

	/// Slots taken by `this` + all parameters in an invocation buffer.
	#[inline]
	pub fn total_arg_stack_size(&self) -> u32 {
		self.total_arg_stack_size.get()
	}

	#[inline]
	pub fn ret_stack_size(&self) -> u32 {
		self.ret_stack_size.get()
	}

	/// The substitution scope this method's signatures were built under.
	pub fn generic_context(&self) -> GenericContext<'l> {
		GenericContext {
			class_inst: self.parent().generic_class_inst(),
			method_inst: self.method_inst,
		}
	}
}

/// Slots (not bytes) one value of `sig` occupies in an argument buffer.
pub fn stack_object_size_of_sig<'l>(ctx: &'l Context<'l>, sig: &'l TypeSig<'l>) -> RtResult<u32> {
	let (size, _align) = crate::metadata::layout::type_sig_size_and_alignment(ctx, sig)?;
	Ok(size.div_ceil(8).max(1))
}

/// Precomputes the invocation-buffer widths of `method` (§6.1 ABI).
pub fn build_method_arg_descs<'l>(ctx: &'l Context<'l>, method: &'l RtMethod<'l>) -> RtResult<()> {
	let mut total = method.is_instance() as u32;
	for param in method.params.iter().copied() {
		total += stack_object_size_of_sig(ctx, param)?;
	}
	method.total_arg_stack_size.set(total);

	use crate::metadata::typesig::ElementType;
	let ret = match method.return_type.element_type {
		ElementType::Void => 0,
		_ => stack_object_size_of_sig(ctx, method.return_type)?,
	};
	method.ret_stack_size.set(ret);
	Ok(())
}

/// Pointer-compares two method signatures after inflating each side
/// through its own generic context. Calling-convention details are
/// ignored; name matching is the caller's business.
pub fn is_method_signature_equal<'l>(
	ctx: &'l Context<'l>,
	a: &'l RtMethod<'l>,
	b: &'l RtMethod<'l>,
) -> RtResult<bool> {
	if a.params.len() != b.params.len() {
		return Ok(false);
	}
	let ctx_a = a.generic_context();
	let ctx_b = b.generic_context();
	let pool = ctx.sig_pool();
	if inflate_type_sig(pool, a.return_type, &ctx_a)? != inflate_type_sig(pool, b.return_type, &ctx_b)? {
		return Ok(false);
	}
	for (pa, pb) in a.params.iter().copied().zip(b.params.iter().copied()) {
		if inflate_type_sig(pool, pa, &ctx_a)? != inflate_type_sig(pool, pb, &ctx_b)? {
			return Ok(false);
		}
	}
	Ok(true)
}

/// Finds a method on `class` (searching parents) whose name and fully
/// inflated signature match `sig`. The caller must already have inflated
/// `sig` into the lookup context.
pub fn find_method_by_name_and_sig<'l>(
	ctx: &'l Context<'l>,
	class: &'l RtClass<'l>,
	name: &str,
	sig: &ParsedMethodSig<'l>,
) -> RtResult<Option<&'l RtMethod<'l>>> {
	let pool = ctx.sig_pool();
	let mut current = Some(class);
	while let Some(cls) = current {
		crate::metadata::class::initialize_methods(ctx, cls)?;
		'candidates: for method in cls.methods().iter().copied() {
			if method.name != name || method.params.len() != sig.params.len() {
				continue;
			}
			let mctx = method.generic_context();
			if inflate_type_sig(pool, method.return_type, &mctx)? != sig.return_type {
				continue;
			}
			for (candidate, wanted) in method.params.iter().copied().zip(sig.params.iter().copied()) {
				if inflate_type_sig(pool, candidate, &mctx)? != wanted {
					continue 'candidates;
				}
			}
			return Ok(Some(method));
		}
		current = cls.parent();
	}
	Ok(None)
}

/// Finds a method by name alone, optionally searching parents.
pub fn find_method_by_name<'l>(
	ctx: &'l Context<'l>,
	class: &'l RtClass<'l>,
	name: &str,
	search_parent: bool,
) -> RtResult<Option<&'l RtMethod<'l>>> {
	let mut current = Some(class);
	while let Some(cls) = current {
		crate::metadata::class::initialize_methods(ctx, cls)?;
		if let Some(method) = cls.methods().iter().copied().find(|m| m.name == name) {
			return Ok(Some(method));
		}
		if !search_parent {
			break;
		}
		current = cls.parent();
	}
	Ok(None)
}

/// Materializes the instantiated descriptor of a generic method.
/// Descriptors are cached per (definition, instantiation).
pub fn get_inflated_method<'l>(
	ctx: &'l Context<'l>,
	base: &'l RtMethod<'l>,
	inst: &'l GenericInstSig<'l>,
) -> RtResult<&'l RtMethod<'l>> {
	if base.generic_container.is_none() {
		return Err(RtErr::ExecutionEngine);
	}
	if let Some(method) = ctx.lookup_inflated_method(base, inst) {
		return Ok(method);
	}

	let pool = ctx.sig_pool();
	let gctx = GenericContext {
		class_inst: base.parent().generic_class_inst(),
		method_inst: Some(inst),
	};
	let return_type = inflate_type_sig(pool, base.return_type, &gctx)?;
	let mut params = Vec::with_capacity(base.params.len());
	for param in base.params.iter().copied() {
		params.push(inflate_type_sig(pool, param, &gctx)?);
	}

	let arena = base.parent().module().arena();
	let method = &*arena.alloc(RtMethod {
		parent: Cell::new(base.parent()),
		name: base.name,
		token: base.token,
		flags: base.flags,
		impl_flags: base.impl_flags,
		rva: base.rva,
		has_this: base.has_this,
		return_type,
		params: arena.alloc_slice_copy(&params),
		generic_container: base.generic_container,
		method_inst: Some(inst),
		slot: Cell::new(base.slot.get()),
		invoker_type: Cell::new(base.invoker_type.get()),
		invoke_fn: Cell::new(base.invoke_fn.get()),
		virtual_invoke_fn: Cell::new(base.virtual_invoke_fn.get()),
		method_ptr: Cell::new(base.method_ptr.get()),
		total_arg_stack_size: Cell::new(0),
		ret_stack_size: Cell::new(0),
		interp_data: Cell::new(None),
	});
	build_method_arg_descs(ctx, method)?;
	ctx.insert_inflated_method(base, inst, method);
	Ok(method)
}

/// Devirtualizes `method` against the dynamic class of `obj_class`,
/// honoring interface dispatch offsets.
pub fn get_virtual_method_impl<'l>(
	ctx: &'l Context<'l>,
	obj_class: &'l RtClass<'l>,
	method: &'l RtMethod<'l>,
) -> RtResult<&'l RtMethod<'l>> {
	crate::metadata::class::initialize_vtables(ctx, obj_class)?;
	if !method.is_virtual() {
		return Ok(method);
	}
	let slot = method.slot.get();
	if slot == INVALID_SLOT {
		return Err(RtErr::ExecutionEngine);
	}

	let index = match method.parent().is_interface() {
		true => {
			let offset = obj_class
				.interface_offset(method.parent())
				.ok_or(RtErr::ExecutionEngine)?;
			offset as usize + slot as usize
		},
		false => slot as usize,
	};

	let vtable = obj_class.vtable();
	let entry = vtable.get(index).ok_or(RtErr::ExecutionEngine)?;
	entry.method_impl.ok_or(RtErr::ExecutionEngine)
}

/// Lazily builds the interpreter view of an IL body: the byte window,
/// locals, exception clauses, and the frame's slot budget.
pub fn init_interpreter_data<'l>(ctx: &'l Context<'l>, method: &'l RtMethod<'l>) -> RtResult<&'l InterpMethodData<'l>> {
	if let Some(data) = method.interp_data.get() {
		return Ok(data);
	}
	if method.rva == 0 {
		return Err(RtErr::ExecutionEngine);
	}

	let class = method.parent();
	let module = class.module();
	let body_bytes = module.image_at_rva(method.rva)?;
	let mut stream = Cursor::new(body_bytes);
	let body = MethodBody::read(&mut stream)?;

	let gcc = crate::metadata::generics::GenericContainerContext {
		class_container: class.generic_container(),
		method_container: method.generic_container,
	};

	let mut locals = vec![];
	if body.local_var_sig_token != 0 {
		use crate::raw::indices::metadata_token::{MetadataToken, StandAloneSigToken};
		let token = MetadataToken::try_from(body.local_var_sig_token).map_err(|_| RtErr::BadImageFormat)?;
		let sig_token = StandAloneSigToken::try_from(token).map_err(|_| RtErr::BadImageFormat)?;
		let sigs = module
			.tables()
			.get_table::<crate::raw::heaps::table::StandAloneSigTable>()
			.ok_or(RtErr::BadImageFormat)?;
		let row = sigs.get(sig_token.0).ok_or(RtErr::BadImageFormat)?;
		locals = module.read_locals_sig(ctx, row.signature, gcc)?;

		let gctx = method.generic_context();
		if !gctx.is_empty() {
			for local in locals.iter_mut() {
				*local = inflate_type_sig(ctx.sig_pool(), *local, &gctx)?;
			}
		}
	}

	let mut locals_stack_size = 0;
	for local in locals.iter().copied() {
		locals_stack_size += stack_object_size_of_sig(ctx, local)?;
	}

	let arena = module.arena();
	let data = &*arena.alloc(InterpMethodData {
		codes: arena.alloc_slice_copy(body.code),
		init_locals: body.init_locals,
		locals: arena.alloc_slice_copy(&locals),
		clauses: arena.alloc_slice_copy(&body.clauses),
		max_stack_object_size: method.total_arg_stack_size.get()
			+ locals_stack_size
			+ body.max_stack as u32,
		locals_stack_object_size: locals_stack_size,
	});
	method.interp_data.set(Some(data));
	Ok(data)
}
