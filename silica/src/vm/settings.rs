use std::fmt::Debug;
use std::path::{Path, PathBuf};

use fxhash::FxHashMap;
use rust_search::SearchBuilder;
use tracing::debug;

use crate::context::Context;
use crate::errors::{RtErr, RtResult};
use crate::metadata::method::RtMethod;
use crate::vm::machine::{StackObject, DEFAULT_EVAL_STACK_SLOTS, DEFAULT_FRAME_STACK_DEPTH};
use crate::vm::object::RtException;

/// Supplies assembly bytes for a simple name (no extension). Called
/// synchronously whenever a not-yet-loaded assembly is referenced.
pub trait AssemblyLoader: Debug {
	fn load_assembly(&mut self, name: &str) -> RtResult<Vec<u8>>;
}

/// Hook invoked when an exception reaches the embedder unhandled.
pub type ReportUnhandledExceptionFn = for<'l> fn(&'l Context<'l>, *mut RtException<'l>);

/// Entry into the external IL dispatch loop. The core hands it a method
/// whose interpreter data is materialized and an argument buffer laid
/// out per the invoker ABI.
pub type InterpreterEntryFn = for<'l> fn(
	&'l Context<'l>,
	&'l RtMethod<'l>,
	*const StackObject,
	*mut StackObject,
) -> RtResult<()>;

/// Embedder-tunable knobs, fixed at context construction except for the
/// hooks, which may be installed any time before execution.
#[derive(Debug)]
pub struct Settings {
	pub eval_stack_slots: usize,
	pub frame_stack_depth: usize,
	pub assembly_loader: Option<Box<dyn AssemblyLoader>>,
	pub report_unhandled_exception: Option<ReportUnhandledExceptionFn>,
	pub interpreter_entry: Option<InterpreterEntryFn>,
	/// Arguments surfaced to the managed program's `Main(string[])`.
	pub program_args: Vec<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			eval_stack_slots: DEFAULT_EVAL_STACK_SLOTS,
			frame_stack_depth: DEFAULT_FRAME_STACK_DEPTH,
			assembly_loader: None,
			report_unhandled_exception: None,
			interpreter_entry: None,
			program_args: vec![],
		}
	}
}

/// Default loader: scans library directories for `.dll` files up front
/// and serves file bytes by simple name.
#[derive(Debug, Default)]
pub struct DirectoryAssemblyLoader {
	paths: FxHashMap<String, PathBuf>,
}

impl DirectoryAssemblyLoader {
	pub fn new<T: AsRef<Path>>(directories: impl IntoIterator<Item = T>) -> Self {
		let mut paths = FxHashMap::default();
		for directory in directories {
			for entry in SearchBuilder::default()
				.location(directory.as_ref())
				.depth(usize::MAX)
				.ext("dll")
				.build()
			{
				let path = PathBuf::from(&entry);
				let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
					continue;
				};
				// First hit wins so earlier directories take priority.
				paths.entry(stem.to_string()).or_insert(path);
			}
		}
		Self { paths }
	}

	pub fn add_file(&mut self, path: impl AsRef<Path>) {
		let path = path.as_ref();
		if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
			self.paths.insert(stem.to_string(), path.to_path_buf());
		}
	}
}

impl AssemblyLoader for DirectoryAssemblyLoader {
	fn load_assembly(&mut self, name: &str) -> RtResult<Vec<u8>> {
		let Some(path) = self.paths.get(name) else {
			debug!(name, "assembly not found in search directories");
			return Err(RtErr::FileNotFound);
		};
		read_assembly_file(path)
	}
}

#[cfg(feature = "memmap2")]
fn read_assembly_file(path: &Path) -> RtResult<Vec<u8>> {
	let file = std::fs::File::open(path).map_err(|_| RtErr::FileNotFound)?;
	let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|_| RtErr::FileNotFound)?;
	Ok(map.to_vec())
}

#[cfg(not(feature = "memmap2"))]
fn read_assembly_file(path: &Path) -> RtResult<Vec<u8>> {
	std::fs::read(path).map_err(|_| RtErr::FileNotFound)
}
