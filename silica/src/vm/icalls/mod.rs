use tracing::debug;

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::RtClass;
use crate::metadata::method::{InvokerType, RtMethod};
use crate::metadata::typesig::{ElementType, TypeSig, TypeSigData};
use crate::vm::machine::{InvokerFn, StackObject};

mod system_array;
mod system_buffer;
mod system_delegate;
mod system_diagnostics;
mod system_environment;
mod system_object;
mod system_reflection;
mod system_runtime;
mod system_string;
mod unsupported;

/// One internal-call binding: the native entry and the trampoline that
/// marshals invocation-buffer slots into it.
#[derive(Debug, Copy, Clone)]
pub struct IcallEntry {
	pub function_pointer: *const (),
	pub invoker: InvokerFn,
}

impl IcallEntry {
	pub(crate) fn new(invoker: InvokerFn) -> Self {
		Self {
			function_pointer: invoker as *const (),
			invoker,
		}
	}
}

/// Populates every registry from the per-area tables. Runs once during
/// runtime initialization.
pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	system_object::install(ctx);
	system_string::install(ctx);
	system_array::install(ctx);
	system_buffer::install(ctx);
	system_delegate::install(ctx);
	system_environment::install(ctx);
	system_runtime::install(ctx);
	system_reflection::install(ctx);
	system_diagnostics::install(ctx);
	unsupported::install(ctx);
	crate::vm::intrinsics::install(ctx);
}

/// Textual method key: `Namespace.Class::Name(Param1,Param2)`.
pub fn icall_signature_of_method<'l>(ctx: &'l Context<'l>, method: &'l RtMethod<'l>) -> String {
	let mut signature = String::with_capacity(64);
	append_class_full_name(&mut signature, method.parent());
	signature.push_str("::");
	signature.push_str(method.name);
	signature.push('(');
	for (i, param) in method.params.iter().copied().enumerate() {
		if i > 0 {
			signature.push(',');
		}
		append_sig_type_name(ctx, &mut signature, param);
	}
	signature.push(')');
	signature
}

fn append_class_full_name(out: &mut String, class: &RtClass) {
	if !class.namespace.is_empty() {
		out.push_str(class.namespace);
		out.push('.');
	}
	out.push_str(class.name);
}

/// Type naming used inside signature keys. Primitives take their C#
/// keywords; named types print as `Namespace.Name`.
fn append_sig_type_name<'l>(ctx: &'l Context<'l>, out: &mut String, sig: &'l TypeSig<'l>) {
	let base_len = out.len();
	match sig.element_type {
		ElementType::Void => out.push_str("void"),
		ElementType::Boolean => out.push_str("bool"),
		ElementType::Char => out.push_str("char"),
		ElementType::I1 => out.push_str("sbyte"),
		ElementType::U1 => out.push_str("byte"),
		ElementType::I2 => out.push_str("short"),
		ElementType::U2 => out.push_str("ushort"),
		ElementType::I4 => out.push_str("int"),
		ElementType::U4 => out.push_str("uint"),
		ElementType::I8 => out.push_str("long"),
		ElementType::U8 => out.push_str("ulong"),
		ElementType::R4 => out.push_str("float"),
		ElementType::R8 => out.push_str("double"),
		ElementType::String => out.push_str("string"),
		ElementType::Object => out.push_str("object"),
		ElementType::I => out.push_str("intptr"),
		ElementType::U => out.push_str("uintptr"),
		ElementType::TypedByRef => out.push_str("System.TypedReference"),
		ElementType::ValueType | ElementType::Class => match sig.data {
			TypeSigData::TypeDef(gid) => append_gid_name(ctx, out, gid),
			_ => out.push('?'),
		},
		ElementType::Ptr => {
			if let Ok(element) = sig.element_sig() {
				append_sig_type_name(ctx, out, element);
			}
			out.push('*');
		},
		ElementType::SZArray => {
			if let Ok(element) = sig.element_sig() {
				append_sig_type_name(ctx, out, element);
			}
			out.push_str("[]");
		},
		ElementType::Array => {
			if let TypeSigData::Array(array) = &sig.data {
				append_sig_type_name(ctx, out, array.element);
				out.push('[');
				for _ in 1..array.rank {
					out.push(',');
				}
				out.push(']');
			}
		},
		ElementType::GenericInst => {
			if let Ok(generic) = sig.generic_class() {
				append_gid_name(ctx, out, generic.base_gid);
				out.push('<');
				for (i, arg) in generic.class_inst.args.iter().copied().enumerate() {
					if i > 0 {
						out.push(',');
					}
					append_sig_type_name(ctx, out, arg);
				}
				out.push('>');
			}
		},
		ElementType::Var | ElementType::MVar => {
			if let TypeSigData::Param(param) = &sig.data {
				match sig.element_type {
					ElementType::Var => out.push_str(&format!("!{}", param.number)),
					_ => out.push_str(&format!("!!{}", param.number)),
				}
			}
		},
		ElementType::FnPtr => out.push_str("fnptr"),
		_ => out.push('?'),
	}
	if sig.by_ref {
		out.push('&');
	}
	debug_assert!(out.len() > base_len);
}

fn append_gid_name<'l>(ctx: &'l Context<'l>, out: &mut String, gid: u32) {
	use crate::metadata::typesig::{decode_gid_module, decode_gid_rid};
	let Some(module) = ctx.module_by_id(decode_gid_module(gid)) else {
		out.push('?');
		return;
	};
	let Ok(row) = module.type_def_row(decode_gid_rid(gid)) else {
		out.push('?');
		return;
	};
	let namespace = module.get_string(row.type_namespace).unwrap_or("?");
	let name = module.get_string(row.type_name).unwrap_or("?");
	if !namespace.is_empty() {
		out.push_str(namespace);
		out.push('.');
	}
	out.push_str(name);
}

// ### Invoker selection ###

fn is_delegate_subclass(class: &RtClass) -> bool {
	let mut current = class.parent();
	while let Some(parent) = current {
		if parent.name == "MulticastDelegate" && parent.namespace == "System" && parent.module().is_corlib() {
			return true;
		}
		current = parent.parent();
	}
	false
}

/// Chooses the three function pointers of a freshly materialized method
/// by classifying its implementation.
pub(crate) fn select_invokers<'l>(ctx: &'l Context<'l>, method: &'l RtMethod<'l>) -> RtResult<()> {
	use crate::raw::heaps::table::{MethodAttributes, MethodImplAttributes};

	let mut invoker_type;
	let mut invoker: InvokerFn;

	if method.is_internal_call() {
		invoker_type = InvokerType::InternalCall;
		let signature = icall_signature_of_method(ctx, method);
		match ctx.lookup_icall(&signature) {
			Some(entry) => {
				method.method_ptr.set(entry.function_pointer);
				invoker = entry.invoker;
			},
			None => {
				debug!(signature, "internal call has no registered implementation");
				invoker = missing_icall_invoker;
			},
		}
	} else if method.flags.contains(MethodAttributes::PINVOKE_IMPL) {
		invoker_type = InvokerType::PInvoke;
		invoker = pinvoke_invoker;
	} else if method.impl_flags.contains(MethodImplAttributes::RUNTIME) && is_delegate_subclass(method.parent()) {
		match method.name {
			".ctor" => {
				invoker_type = InvokerType::DelegateCtor;
				invoker = crate::vm::delegate::delegate_ctor_invoker;
			},
			"Invoke" => {
				invoker_type = InvokerType::DelegateInvoke;
				invoker = crate::vm::delegate::delegate_invoke_invoker;
			},
			"BeginInvoke" => {
				invoker_type = InvokerType::DelegateInvoke;
				invoker = crate::vm::delegate::delegate_begin_invoke_invoker;
			},
			"EndInvoke" => {
				invoker_type = InvokerType::DelegateInvoke;
				invoker = crate::vm::delegate::delegate_end_invoke_invoker;
			},
			_ => {
				invoker_type = InvokerType::None;
				invoker = abstract_invoker;
			},
		}
	} else if method.is_abstract() {
		invoker_type = InvokerType::None;
		invoker = abstract_invoker;
	} else {
		invoker_type = InvokerType::InterpretedIl;
		invoker = interpreted_il_invoker;
	}

	// Intrinsics replace an ordinary body only when the metadata says so.
	if invoker_type == InvokerType::InterpretedIl
		&& method.parent().module().has_custom_attribute_named(
			method.token,
			"System.Runtime.CompilerServices",
			"IntrinsicAttribute",
		) {
		let signature = icall_signature_of_method(ctx, method);
		if let Some(entry) = ctx.lookup_intrinsic(&signature) {
			invoker_type = InvokerType::Intrinsic;
			invoker = entry.invoker;
			method.method_ptr.set(entry.function_pointer);
		}
	}

	method.invoker_type.set(invoker_type);
	method.invoke_fn.set(Some(invoker));
	method.virtual_invoke_fn.set(Some(invoker));
	if method.method_ptr.get().is_null() {
		method.method_ptr.set(invoker as *const ());
	}
	Ok(())
}

/// Consulted when the `newobj` opcode resolves a constructor that must
/// allocate the instance itself (strings, delegates).
pub fn newobj_entry_for<'l>(ctx: &'l Context<'l>, ctor: &'l RtMethod<'l>) -> Option<IcallEntry> {
	if is_delegate_subclass(ctor.parent()) && ctor.name == ".ctor" {
		return Some(IcallEntry::new(crate::vm::delegate::newobj_delegate_invoker));
	}
	let signature = icall_signature_of_method(ctx, ctor);
	ctx.lookup_newobj(&signature)
}

// ### Fallback invokers ###

fn interpreted_il_invoker<'l>(
	ctx: &'l Context<'l>,
	_ptr: *const (),
	method: &'l RtMethod<'l>,
	params: *const StackObject,
	ret: *mut StackObject,
) -> RtResult<()> {
	crate::metadata::method::init_interpreter_data(ctx, method)?;
	let entry = ctx.settings().interpreter_entry;
	match entry {
		Some(entry) => entry(ctx, method, params, ret),
		None => Err(RtErr::ExecutionEngine),
	}
}

fn pinvoke_invoker<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	// Platform invocation rides on the embedder's platform layer.
	Err(RtErr::NotImplemented)
}

fn abstract_invoker<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	Err(RtErr::ExecutionEngine)
}

fn missing_icall_invoker<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	Err(RtErr::NotImplemented)
}

pub(crate) fn not_implemented_invoker<'l>(
	_ctx: &'l Context<'l>,
	_ptr: *const (),
	_method: &'l RtMethod<'l>,
	_params: *const StackObject,
	_ret: *mut StackObject,
) -> RtResult<()> {
	Err(RtErr::NotImplemented)
}
