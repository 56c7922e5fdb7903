use std::cell::{Cell, UnsafeCell};

use tracing::trace;

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::{init_interpreter_data, RtMethod};

/// One 8-byte evaluation-stack slot. Values smaller than 4 bytes are
/// widened to i32 before they land here (§6.1); wider value types span
/// several consecutive slots.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct StackObject(u64);

impl StackObject {
	#[inline]
	pub fn raw(&self) -> u64 {
		self.0
	}
}

impl std::fmt::Debug for StackObject {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "StackObject({:#018X})", self.0)
	}
}

/// The universal invoker shape every method exposes. `params` points at
/// the argument slots laid out per §6.1; `ret` receives the return value
/// and is left untouched for void methods.
pub type InvokerFn = for<'l> fn(
	&'l Context<'l>,
	*const (),
	&'l RtMethod<'l>,
	*const StackObject,
	*mut StackObject,
) -> RtResult<()>;

/// Typed access into invocation buffers. Reads and writes go through the
/// exact §6.1 offsets; `T` must be `Copy` and at most slot-sized per slot
/// it occupies.
pub mod eval_stack_op {
	use super::StackObject;

	#[inline]
	pub unsafe fn get_param<T: Copy>(params: *const StackObject, index: usize) -> T {
		debug_assert!(std::mem::size_of::<T>() <= 8);
		std::ptr::read(params.add(index) as *const T)
	}

	#[inline]
	pub unsafe fn set_param<T: Copy>(params: *mut StackObject, index: usize, value: T) {
		debug_assert!(std::mem::size_of::<T>() <= 8);
		std::ptr::write(params.add(index) as *mut T, value)
	}

	#[inline]
	pub unsafe fn set_return<T: Copy>(ret: *mut StackObject, value: T) {
		debug_assert!(std::mem::size_of::<T>() <= 8);
		std::ptr::write(ret as *mut T, value)
	}
}

/// One activation record. `eval_stack_base` indexes into the machine's
/// evaluation stack; the argument slots sit at the base, locals follow,
/// and the IL evaluation stack grows above them.
#[derive(Copy, Clone)]
pub struct InterpFrame<'l> {
	pub method: &'l RtMethod<'l>,
	pub ip: *const u8,
	pub eval_stack_base: u32,
	pub eval_stack_size: u32,
	pub old_eval_stack_top: u32,
}

/// Marks a frame-stack depth that a nested unwind must not pass.
#[derive(Debug, Copy, Clone)]
pub struct MachineStateSavePoint {
	old_frame_stack_top: u32,
}

pub const DEFAULT_EVAL_STACK_SLOTS: usize = 1024 * 128;
pub const DEFAULT_FRAME_STACK_DEPTH: usize = 1024 * 2;

/// The process-wide evaluation stack and frame stack. Both tops are
/// counters that only the enter/leave pairs move. Single-threaded by
/// construction; raw frame pointers hand mutable access to the one
/// interpreter driving this machine.
pub struct MachineState<'l> {
	eval_stack: UnsafeCell<Box<[StackObject]>>,
	frames: UnsafeCell<Box<[Option<InterpFrame<'l>>]>>,
	eval_top: Cell<u32>,
	frame_top: Cell<u32>,
}

impl<'l> MachineState<'l> {
	pub(crate) fn new(eval_slots: usize, frame_depth: usize) -> Self {
		Self {
			eval_stack: UnsafeCell::new(vec![StackObject::default(); eval_slots].into_boxed_slice()),
			frames: UnsafeCell::new(vec![None; frame_depth].into_boxed_slice()),
			eval_top: Cell::new(0),
			frame_top: Cell::new(0),
		}
	}

	#[inline]
	pub fn eval_stack_top(&self) -> u32 {
		self.eval_top.get()
	}

	#[inline]
	pub fn frame_stack_top(&self) -> u32 {
		self.frame_top.get()
	}

	#[inline]
	pub fn save_point(&self) -> MachineStateSavePoint {
		MachineStateSavePoint {
			old_frame_stack_top: self.frame_top.get(),
		}
	}

	#[inline]
	fn eval_stack_len(&self) -> u32 {
		unsafe { (&*self.eval_stack.get()).len() as u32 }
	}

	#[inline]
	fn frame_stack_len(&self) -> u32 {
		unsafe { (&*self.frames.get()).len() as u32 }
	}

	/// Pointer to the slot at `index`. Valid while the machine lives;
	/// the stacks never reallocate.
	#[inline]
	pub fn eval_slot_ptr(&self, index: u32) -> *mut StackObject {
		unsafe { (*self.eval_stack.get()).as_mut_ptr().add(index as usize) }
	}

	pub(crate) fn alloc_eval_stack(&self, slots: u32) -> RtResult<u32> {
		let top = self.eval_top.get();
		if top + slots > self.eval_stack_len() {
			return Err(RtErr::StackOverflow);
		}
		self.eval_top.set(top + slots);
		Ok(top)
	}

	fn alloc_frame(&self) -> RtResult<*mut Option<InterpFrame<'l>>> {
		let top = self.frame_top.get();
		if top + 1 > self.frame_stack_len() {
			return Err(RtErr::StackOverflow);
		}
		self.frame_top.set(top + 1);
		Ok(unsafe { (*self.frames.get()).as_mut_ptr().add(top as usize) })
	}

	/// The frame at depth `index` (0 = outermost).
	pub fn frame_at(&self, index: u32) -> Option<InterpFrame<'l>> {
		if index >= self.frame_top.get() {
			return None;
		}
		unsafe { *(*self.frames.get()).as_ptr().add(index as usize) }
	}
}

/// Enters a frame on behalf of a native caller. Arguments are copied
/// from `args` into the new frame's base; the interpreter data (IL
/// window, locals, clause table) is materialized on first entry.
pub fn enter_frame_from_native<'l>(
	ctx: &'l Context<'l>,
	method: &'l RtMethod<'l>,
	args: *const StackObject,
) -> RtResult<*mut InterpFrame<'l>> {
	trace!(method = method.name, "enter frame from native");
	let interp = init_interpreter_data(ctx, method)?;
	let machine = ctx.machine();

	let slot = machine.alloc_frame()?;
	let max_stack = interp.max_stack_object_size;
	let old_eval_stack_top = machine.eval_stack_top();
	let base = match machine.alloc_eval_stack(max_stack) {
		Ok(base) => base,
		Err(err) => {
			machine.frame_top.set(machine.frame_top.get() - 1);
			return Err(err);
		},
	};

	if cfg!(debug_assertions) {
		for i in 0..max_stack {
			unsafe { *machine.eval_slot_ptr(base + i) = StackObject::default() };
		}
	}

	let arg_slots = method.total_arg_stack_size();
	if arg_slots > 0 {
		unsafe {
			std::ptr::copy_nonoverlapping(args, machine.eval_slot_ptr(base), arg_slots as usize);
		}
	}

	unsafe {
		*slot = Some(InterpFrame {
			method,
			ip: interp.codes.as_ptr(),
			eval_stack_base: base,
			eval_stack_size: max_stack,
			old_eval_stack_top,
		});
		Ok((*slot).as_mut().unwrap_unchecked())
	}
}

/// Enters a frame for an interp→interp call. The caller has already
/// pushed the arguments contiguously at `frame_base`; only the slots
/// above them are claimed.
pub fn enter_frame_from_interp<'l>(
	ctx: &'l Context<'l>,
	method: &'l RtMethod<'l>,
	frame_base: u32,
) -> RtResult<*mut InterpFrame<'l>> {
	trace!(method = method.name, "enter frame from interp");
	let interp = init_interpreter_data(ctx, method)?;
	let machine = ctx.machine();

	let slot = machine.alloc_frame()?;
	let max_stack = interp.max_stack_object_size;
	let old_eval_stack_top = machine.eval_stack_top();
	let new_eval_stack_top = frame_base + max_stack;
	if new_eval_stack_top > machine.eval_stack_len() {
		machine.frame_top.set(machine.frame_top.get() - 1);
		return Err(RtErr::StackOverflow);
	}
	machine.eval_top.set(new_eval_stack_top);

	if cfg!(debug_assertions) {
		let arg_slots = method.total_arg_stack_size();
		for i in arg_slots..max_stack {
			unsafe { *machine.eval_slot_ptr(frame_base + i) = StackObject::default() };
		}
	}

	unsafe {
		*slot = Some(InterpFrame {
			method,
			ip: interp.codes.as_ptr(),
			eval_stack_base: frame_base,
			eval_stack_size: max_stack,
			old_eval_stack_top,
		});
		Ok((*slot).as_mut().unwrap_unchecked())
	}
}

/// Pops the current frame during an unwind. Refuses to pop past the
/// save point: the boundary frame stays in place and null comes back,
/// telling the caller to return control to native code.
pub fn leave_frame<'l>(
	ctx: &'l Context<'l>,
	sp: &MachineStateSavePoint,
	frame: *mut InterpFrame<'l>,
) -> *mut InterpFrame<'l> {
	let machine = ctx.machine();
	let top = machine.frame_top.get();
	debug_assert!(top > 0);
	let index = top - 1;

	if index <= sp.old_frame_stack_top {
		return std::ptr::null_mut();
	}

	let old_eval_stack_top = unsafe { (*frame).old_eval_stack_top };
	if cfg!(debug_assertions) {
		// Poison the abandoned slots so stale reads stand out.
		for i in old_eval_stack_top..machine.eval_top.get() {
			unsafe { *machine.eval_slot_ptr(i) = StackObject(0xDDDD_DDDD_DDDD_DDDD) };
		}
	}
	machine.frame_top.set(index);
	machine.eval_top.set(old_eval_stack_top);

	unsafe {
		match &mut *(*machine.frames.get()).as_mut_ptr().add(index as usize - 1) {
			Some(prev) => prev as *mut InterpFrame<'l>,
			None => std::ptr::null_mut(),
		}
	}
}

/// Pops the current frame on the normal return path, restoring the
/// recorded eval-stack top.
pub fn free_frame_stack<'l>(ctx: &'l Context<'l>, old_eval_stack_top: u32) {
	let machine = ctx.machine();
	let top = machine.frame_top.get();
	debug_assert!(top > 0);
	let index = top - 1;
	debug_assert!(machine
		.frame_at(index)
		.map(|f| f.old_eval_stack_top == old_eval_stack_top)
		.unwrap_or(false));
	if cfg!(debug_assertions) {
		for i in old_eval_stack_top..machine.eval_top.get() {
			unsafe { *machine.eval_slot_ptr(i) = StackObject(0xDDDD_DDDD_DDDD_DDDD) };
		}
	}
	machine.frame_top.set(index);
	machine.eval_top.set(old_eval_stack_top);
}

/// Records a frame for stack traces across an icall or intrinsic. The
/// eval stack is untouched; the returned depth restores the frame stack.
pub fn enter_frame_from_icall_or_intrinsic<'l>(ctx: &'l Context<'l>, method: &'l RtMethod<'l>) -> u32 {
	let machine = ctx.machine();
	let old_frame_top = machine.frame_top.get();
	if old_frame_top < machine.frame_stack_len() {
		let slot = unsafe { (*machine.frames.get()).as_mut_ptr().add(old_frame_top as usize) };
		machine.frame_top.set(old_frame_top + 1);
		unsafe {
			*slot = Some(InterpFrame {
				method,
				ip: std::ptr::null(),
				eval_stack_base: 0,
				eval_stack_size: 0,
				old_eval_stack_top: machine.eval_stack_top(),
			});
		}
	}
	old_frame_top
}

pub fn leave_frame_from_icall_or_intrinsic<'l>(ctx: &'l Context<'l>, old_frame_top: u32) {
	ctx.machine().frame_top.set(old_frame_top);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn eval_slot_abi_widening_roundtrip() {
		let mut slots = [StackObject::default(); 4];
		unsafe {
			eval_stack_op::set_param(slots.as_mut_ptr(), 0, -3i32);
			eval_stack_op::set_param(slots.as_mut_ptr(), 1, 1.5f64);
			eval_stack_op::set_param(slots.as_mut_ptr(), 2, usize::MAX as *const u8);

			assert_eq!(eval_stack_op::get_param::<i32>(slots.as_ptr(), 0), -3);
			assert_eq!(eval_stack_op::get_param::<f64>(slots.as_ptr(), 1), 1.5);
			assert_eq!(eval_stack_op::get_param::<*const u8>(slots.as_ptr(), 2), usize::MAX as *const u8);
		}
	}

	#[test]
	fn eval_stack_top_moves_monotonically_and_overflows() {
		let machine = MachineState::new(8, 2);
		assert_eq!(machine.eval_stack_top(), 0);
		assert_eq!(machine.alloc_eval_stack(4).unwrap(), 0);
		assert_eq!(machine.alloc_eval_stack(4).unwrap(), 4);
		assert_eq!(machine.alloc_eval_stack(1), Err(crate::errors::RtErr::StackOverflow));
		assert_eq!(machine.eval_stack_top(), 8);
	}

	#[test]
	fn frame_stack_depth_is_bounded() {
		let machine = MachineState::new(8, 2);
		assert!(machine.alloc_frame().is_ok());
		assert!(machine.alloc_frame().is_ok());
		assert_eq!(machine.frame_stack_top(), 2);
		assert!(machine.alloc_frame().is_err());
	}

	#[test]
	fn save_point_records_current_depth() {
		let machine = MachineState::new(8, 4);
		let _ = machine.alloc_frame();
		let sp = machine.save_point();
		assert_eq!(sp.old_frame_stack_top, 1);
	}
}
