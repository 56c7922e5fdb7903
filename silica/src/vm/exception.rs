use tracing::debug;

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::class::RtClass;
use crate::vm::gc::GarbageCollector;
use crate::vm::object::{self, RtException, RtObject};
use crate::vm::string::create_string_from_utf8;

/// Allocates the one-slot current-exception cell as a scanned root.
pub(crate) fn initialize<'l>(ctx: &'l Context<'l>) -> RtResult<()> {
	let slot: *mut *mut RtException<'l> =
		GarbageCollector::allocate_fixed_reference_array(1) as *mut *mut RtException<'l>;
	ctx.set_exception_slot(slot);
	Ok(())
}

pub fn set_current_exception<'l>(ctx: &'l Context<'l>, ex: *mut RtException<'l>) {
	let slot = ctx.exception_slot();
	debug_assert!(!slot.is_null());
	GarbageCollector::write_barrier(slot as *mut *mut RtObject<'l>, ex as *mut RtObject<'l>);
}

pub fn current_exception<'l>(ctx: &'l Context<'l>) -> *mut RtException<'l> {
	let slot = ctx.exception_slot();
	match slot.is_null() {
		true => std::ptr::null_mut(),
		false => unsafe { *slot },
	}
}

/// The unwind reads the slot exactly once, clearing it.
pub fn get_and_clear_current_exception<'l>(ctx: &'l Context<'l>) -> *mut RtException<'l> {
	let ex = current_exception(ctx);
	set_current_exception(ctx, std::ptr::null_mut());
	ex
}

/// Fixed runtime-error → corlib-exception-class mapping.
pub fn exception_class_of_error<'l>(ctx: &'l Context<'l>, err: RtErr) -> RtResult<&'l RtClass<'l>> {
	let types = ctx.corlib_types()?;
	Ok(match err {
		RtErr::NotImplemented => types.cls_not_implemented_exception,
		RtErr::StackOverflow => types.cls_stack_overflow_exception,
		RtErr::InvalidCast => types.cls_invalid_cast_exception,
		RtErr::NullReference => types.cls_null_reference_exception,
		RtErr::ArrayTypeMismatch => types.cls_array_type_mismatch_exception,
		RtErr::IndexOutOfRange => types.cls_index_out_of_range_exception,
		RtErr::OutOfMemory => types.cls_out_of_memory_exception,
		RtErr::Arithmetic => types.cls_arithmetic_exception,
		RtErr::DivideByZero => types.cls_divide_by_zero_exception,
		RtErr::Overflow => types.cls_overflow_exception,
		RtErr::Argument => types.cls_argument_exception,
		RtErr::ArgumentNull => types.cls_argument_null_exception,
		RtErr::ArgumentOutOfRange => types.cls_argument_out_of_range_exception,
		RtErr::TypeLoad => types.cls_type_load_exception,
		RtErr::MissingField => types.cls_missing_field_exception,
		RtErr::MissingMethod => types.cls_missing_method_exception,
		RtErr::MissingMember => types.cls_missing_member_exception,
		RtErr::BadImageFormat | RtErr::ModuleAlreadyLoaded => types.cls_bad_image_format_exception,
		RtErr::EntryPointNotFound => types.cls_entry_point_not_found_exception,
		RtErr::NotSupported => types.cls_not_supported_exception,
		RtErr::TypeUnloaded => types.cls_type_unloaded_exception,
		RtErr::FileNotFound => types.cls_file_not_found_exception,
		RtErr::ExecutionEngine | RtErr::ManagedException => types.cls_execution_engine_exception,
	})
}

/// Translates a runtime error into a managed exception instance and
/// stores it in the current-exception slot. `ManagedException` passes
/// the already-pending exception through.
pub fn raise_error_as_exception<'l>(ctx: &'l Context<'l>, err: RtErr) -> *mut RtException<'l> {
	if err == RtErr::ManagedException {
		return current_exception(ctx);
	}
	let ex = match exception_class_of_error(ctx, err)
		.and_then(|class| object::new_object(ctx, class))
	{
		Ok(obj) => obj as *mut RtException<'l>,
		Err(inner) => {
			debug!(?err, ?inner, "failed to materialize exception object");
			// Last resort: an ExecutionEngineException, or null if even
			// that cannot be built.
			ctx.corlib_types()
				.ok()
				.and_then(|t| object::new_object(ctx, t.cls_execution_engine_exception).ok())
				.map(|obj| obj as *mut RtException<'l>)
				.unwrap_or(std::ptr::null_mut())
		},
	};
	if ex.is_null() {
		return ex;
	}
	raise_exception(ctx, ex)
}

/// Captures the trace and publishes `ex` as the pending exception.
pub fn raise_exception<'l>(ctx: &'l Context<'l>, ex: *mut RtException<'l>) -> *mut RtException<'l> {
	let _ = crate::vm::stack_trace::setup_trace_ips(ctx, ex);
	set_current_exception(ctx, ex);
	ex
}

/// Builds and raises an instance of `class` carrying `message`.
pub fn raise_exception_with_message<'l>(
	ctx: &'l Context<'l>,
	class: &'l RtClass<'l>,
	message: &str,
) -> RtResult<*mut RtException<'l>> {
	let ex = object::new_object(ctx, class)? as *mut RtException<'l>;
	let text = create_string_from_utf8(ctx, message)?;
	unsafe {
		GarbageCollector::write_barrier(
			std::ptr::addr_of_mut!((*ex).message) as *mut *mut RtObject<'l>,
			text as *mut RtObject<'l>,
		);
	}
	Ok(raise_exception(ctx, ex))
}

/// Invoked when execution returns to the embedder with the slot
/// occupied. Without a configured reporter, nothing is printed.
pub fn report_unhandled_exception<'l>(ctx: &'l Context<'l>, ex: *mut RtException<'l>) {
	let reporter = ctx.settings().report_unhandled_exception;
	if let Some(reporter) = reporter {
		reporter(ctx, ex);
	}
}
