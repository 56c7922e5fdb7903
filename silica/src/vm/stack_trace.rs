use crate::context::Context;
use crate::errors::RtResult;
use crate::metadata::method::RtMethod;
use crate::vm::gc::GarbageCollector;
use crate::vm::object::{RtException, RtObject};

/// One captured frame: the method descriptor and the IL offset the
/// frame's instruction pointer had when the exception was raised.
#[derive(Debug, Copy, Clone)]
pub struct CapturedFrame<'l> {
	pub method: &'l RtMethod<'l>,
	pub il_offset: i32,
}

/// Walks the frame stack top-down into `(method, offset)` pairs.
/// Icall marker frames carry a null ip and report offset -1.
pub fn capture_frames<'l>(ctx: &'l Context<'l>) -> Vec<CapturedFrame<'l>> {
	let machine = ctx.machine();
	let depth = machine.frame_stack_top();
	let mut frames = Vec::with_capacity(depth as usize);
	for index in (0..depth).rev() {
		let Some(frame) = machine.frame_at(index) else {
			continue;
		};
		let il_offset = match frame.method.interp_data.get() {
			Some(interp) if !frame.ip.is_null() => {
				(frame.ip as usize).wrapping_sub(interp.codes.as_ptr() as usize) as i32
			},
			_ => -1,
		};
		frames.push(CapturedFrame {
			method: frame.method,
			il_offset,
		});
	}
	frames
}

/// Fills `ex.trace_ips` with the interleaved `(method, offset)` pairs of
/// the current frame stack, each widened to a native int element.
pub fn setup_trace_ips<'l>(ctx: &'l Context<'l>, ex: *mut RtException<'l>) -> RtResult<()> {
	let frames = capture_frames(ctx);
	let types = ctx.corlib_types()?;

	let arr = crate::vm::array::new_array_from_element_class(
		ctx,
		types.cls_intptr,
		(frames.len() * 2) as i32,
	)?;
	for (i, frame) in frames.iter().enumerate() {
		unsafe {
			crate::vm::array::array_set_at::<isize>(arr, (i * 2) as i32, frame.method as *const _ as isize);
			crate::vm::array::array_set_at::<isize>(arr, (i * 2 + 1) as i32, frame.il_offset as isize);
		}
	}
	unsafe {
		GarbageCollector::write_barrier(
			std::ptr::addr_of_mut!((*ex).trace_ips) as *mut *mut RtObject<'l>,
			arr as *mut RtObject<'l>,
		);
	}
	Ok(())
}

/// Decodes a `trace_ips` array captured by `setup_trace_ips` back into
/// frames; the reflection stack-trace icalls consume this.
pub fn decode_trace_ips<'l>(trace_ips: *mut crate::vm::object::RtArray<'l>) -> Vec<CapturedFrame<'l>> {
	if trace_ips.is_null() {
		return vec![];
	}
	let length = crate::vm::array::array_length(trace_ips);
	let mut frames = Vec::with_capacity(length as usize / 2);
	let mut i = 0;
	while i + 1 < length {
		let method = unsafe { crate::vm::array::array_get_at::<isize>(trace_ips, i) };
		let offset = unsafe { crate::vm::array::array_get_at::<isize>(trace_ips, i + 1) };
		if method != 0 {
			frames.push(CapturedFrame {
				method: unsafe { &*(method as *const RtMethod<'l>) },
				il_offset: offset as i32,
			});
		}
		i += 2;
	}
	frames
}
