use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashMap;
use std::pin::Pin;

use bumpalo::Bump;
use derivative::Derivative;
use fxhash::{FxHashMap, FxHashSet};
use nohash_hasher::BuildNoHashHasher;
use tracing::info;

use crate::errors::{RtErr, RtResult};
use crate::metadata::class::RtClass;
use crate::metadata::method::RtMethod;
use crate::metadata::module::{Module, CORLIB_MODULE_ID};
use crate::metadata::typesig::{GenericInstSig, TypeSigPool};
use crate::vm::icalls::IcallEntry;
use crate::vm::machine::MachineState;
use crate::vm::object::RtException;
use crate::vm::runtime::CorlibTypes;
use crate::vm::settings::Settings;
use crate::vm::string::InternKey;

/// The runtime instance: module registry, metadata caches, machine
/// stacks, and the registries execution depends on. All "process-wide"
/// state of the runtime lives here; one context per process is the
/// supported embedding, driven from a single thread.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Context<'l> {
	#[derivative(Debug = "ignore")]
	bump: Pin<Box<Bump>>,
	#[derivative(Debug = "ignore")]
	sig_pool: TypeSigPool<'l>,
	#[derivative(Debug(format_with = "fmt_module_names"))]
	modules: RefCell<Vec<&'l Module<'l>>>,
	#[derivative(Debug = "ignore")]
	modules_by_name: RefCell<FxHashMap<&'l str, u32>>,

	#[derivative(Debug = "ignore")]
	corlib_types: OnceCell<&'l CorlibTypes<'l>>,

	// Synthetic-class and instantiation caches, keyed by interned
	// signature identity. Pointer addresses and gids are already
	// well-distributed, so the single-key caches skip hashing entirely.
	#[derivative(Debug = "ignore")]
	generic_class_cache: RefCell<FxHashMap<(u32, usize), &'l RtClass<'l>>>,
	#[derivative(Debug = "ignore")]
	szarray_class_cache: RefCell<HashMap<usize, &'l RtClass<'l>, BuildNoHashHasher<usize>>>,
	#[derivative(Debug = "ignore")]
	array_class_cache: RefCell<FxHashMap<(usize, u8), &'l RtClass<'l>>>,
	#[derivative(Debug = "ignore")]
	ptr_class_cache: RefCell<HashMap<usize, &'l RtClass<'l>, BuildNoHashHasher<usize>>>,
	#[derivative(Debug = "ignore")]
	generic_param_class_cache: RefCell<HashMap<u32, &'l RtClass<'l>, BuildNoHashHasher<u32>>>,
	#[derivative(Debug = "ignore")]
	inflated_method_cache: RefCell<FxHashMap<(usize, usize), &'l RtMethod<'l>>>,

	#[derivative(Debug = "ignore")]
	machine: MachineState<'l>,
	#[derivative(Debug = "ignore")]
	exception_slot: Cell<*mut *mut RtException<'l>>,
	#[derivative(Debug = "ignore")]
	pub(crate) intern_table: RefCell<FxHashSet<InternKey<'l>>>,
	#[derivative(Debug = "ignore")]
	pub(crate) empty_string: Cell<*mut *mut crate::vm::object::RtString<'l>>,

	#[derivative(Debug = "ignore")]
	reflection_type_cache: RefCell<FxHashMap<usize, usize>>,
	#[derivative(Debug = "ignore")]
	reflection_assembly_cache: RefCell<FxHashMap<u32, usize>>,

	#[derivative(Debug = "ignore")]
	icalls: RefCell<FxHashMap<&'static str, IcallEntry>>,
	#[derivative(Debug = "ignore")]
	intrinsics: RefCell<FxHashMap<&'static str, IcallEntry>>,
	#[derivative(Debug = "ignore")]
	newobj_entries: RefCell<FxHashMap<&'static str, IcallEntry>>,

	#[derivative(Debug = "ignore")]
	settings: RefCell<Settings>,
}

fn fmt_module_names(modules: &RefCell<Vec<&Module>>, f: &mut std::fmt::Formatter) -> std::fmt::Result {
	let modules = modules.borrow();
	let mut dbg = f.debug_list();
	for module in modules.iter() {
		dbg.entry(&module.name());
	}
	dbg.finish()
}

impl<'l> Context<'l> {
	pub fn new() -> Self {
		Self::with_settings(Settings::default())
	}

	pub fn with_settings(settings: Settings) -> Self {
		let bump = Box::pin(Bump::new());
		// The pool borrows the pinned arena; both live and die with the
		// context, and the box keeps the arena's address stable.
		let bump_ref: &'l Bump = unsafe { std::mem::transmute(&*bump) };
		Context {
			sig_pool: TypeSigPool::new(bump_ref),
			modules: Default::default(),
			modules_by_name: Default::default(),
			corlib_types: OnceCell::new(),
			generic_class_cache: Default::default(),
			szarray_class_cache: Default::default(),
			array_class_cache: Default::default(),
			ptr_class_cache: Default::default(),
			generic_param_class_cache: Default::default(),
			inflated_method_cache: Default::default(),
			machine: MachineState::new(settings.eval_stack_slots, settings.frame_stack_depth),
			exception_slot: Cell::new(std::ptr::null_mut()),
			intern_table: Default::default(),
			empty_string: Cell::new(std::ptr::null_mut()),
			reflection_type_cache: Default::default(),
			reflection_assembly_cache: Default::default(),
			icalls: Default::default(),
			intrinsics: Default::default(),
			newobj_entries: Default::default(),
			settings: RefCell::new(settings),
			bump,
		}
	}

	#[inline]
	pub(crate) fn bump(&self) -> &'l Bump {
		unsafe { std::mem::transmute(&*self.bump) }
	}

	#[inline]
	pub fn sig_pool(&self) -> &TypeSigPool<'l> {
		&self.sig_pool
	}

	#[inline]
	pub fn machine(&self) -> &MachineState<'l> {
		&self.machine
	}

	// ### Module registry ###

	pub(crate) fn register_module(&'l self, module: &'l Module<'l>) -> RtResult<u32> {
		let mut names = self.modules_by_name.borrow_mut();
		if names.contains_key(module.name()) {
			return Err(RtErr::ModuleAlreadyLoaded);
		}
		let mut modules = self.modules.borrow_mut();
		let id = modules.len() as u32;
		modules.push(module);
		names.insert(module.name(), id);
		Ok(id)
	}

	pub fn module_by_id(&self, id: u32) -> Option<&'l Module<'l>> {
		self.modules.borrow().get(id as usize).copied()
	}

	pub fn module_by_name(&self, name: &str) -> Option<&'l Module<'l>> {
		let id = *self.modules_by_name.borrow().get(name)?;
		self.module_by_id(id)
	}

	/// The first loaded assembly is implicitly the corlib.
	pub fn corlib_module(&self) -> RtResult<&'l Module<'l>> {
		self.module_by_id(CORLIB_MODULE_ID).ok_or(RtErr::ExecutionEngine)
	}

	/// Loads an assembly from raw bytes and registers its module.
	pub fn load_assembly(&'l self, bytes: &[u8]) -> RtResult<&'l Module<'l>> {
		Module::load(self, bytes)
	}

	/// Finds an already-loaded module or pulls assembly bytes through
	/// the embedder's loader hook.
	pub fn load_module_by_name(&'l self, name: &str) -> RtResult<&'l Module<'l>> {
		if let Some(module) = self.module_by_name(name) {
			return Ok(module);
		}
		info!(name, "resolving assembly through loader hook");
		let bytes = {
			let mut settings = self.settings.borrow_mut();
			let loader = settings.assembly_loader.as_mut().ok_or(RtErr::FileNotFound)?;
			loader.load_assembly(name)?
		};
		self.load_assembly(&bytes)
	}

	// ### Well-known corlib classes ###

	pub(crate) fn set_corlib_types(&self, types: &'l CorlibTypes<'l>) -> RtResult<()> {
		self.corlib_types.set(types).map_err(|_| RtErr::ExecutionEngine)
	}

	/// The well-known corlib classes. Available once `runtime::initialize`
	/// has run.
	pub fn corlib_types(&self) -> RtResult<&'l CorlibTypes<'l>> {
		self.corlib_types.get().copied().ok_or(RtErr::ExecutionEngine)
	}

	// ### Synthetic-class caches ###

	pub(crate) fn cached_generic_class(&self, base_gid: u32, inst: &'l GenericInstSig<'l>) -> Option<&'l RtClass<'l>> {
		self.generic_class_cache
			.borrow()
			.get(&(base_gid, inst as *const _ as usize))
			.copied()
	}

	pub(crate) fn insert_generic_class(&self, base_gid: u32, inst: &'l GenericInstSig<'l>, class: &'l RtClass<'l>) {
		self.generic_class_cache
			.borrow_mut()
			.insert((base_gid, inst as *const _ as usize), class);
	}

	pub(crate) fn cached_szarray_class(&self, element_sig: usize) -> Option<&'l RtClass<'l>> {
		self.szarray_class_cache.borrow().get(&element_sig).copied()
	}

	pub(crate) fn insert_szarray_class(&self, element_sig: usize, class: &'l RtClass<'l>) {
		self.szarray_class_cache.borrow_mut().insert(element_sig, class);
	}

	pub(crate) fn cached_array_class(&self, element_sig: usize, rank: u8) -> Option<&'l RtClass<'l>> {
		self.array_class_cache.borrow().get(&(element_sig, rank)).copied()
	}

	pub(crate) fn insert_array_class(&self, element_sig: usize, rank: u8, class: &'l RtClass<'l>) {
		self.array_class_cache.borrow_mut().insert((element_sig, rank), class);
	}

	pub(crate) fn cached_ptr_class(&self, element_sig: usize) -> Option<&'l RtClass<'l>> {
		self.ptr_class_cache.borrow().get(&element_sig).copied()
	}

	pub(crate) fn insert_ptr_class(&self, element_sig: usize, class: &'l RtClass<'l>) {
		self.ptr_class_cache.borrow_mut().insert(element_sig, class);
	}

	pub(crate) fn cached_generic_param_class(&self, param_gid: u32) -> Option<&'l RtClass<'l>> {
		self.generic_param_class_cache.borrow().get(&param_gid).copied()
	}

	pub(crate) fn insert_generic_param_class(&self, param_gid: u32, class: &'l RtClass<'l>) {
		self.generic_param_class_cache.borrow_mut().insert(param_gid, class);
	}

	pub(crate) fn lookup_inflated_method(&self, base: &'l RtMethod<'l>, inst: &'l GenericInstSig<'l>) -> Option<&'l RtMethod<'l>> {
		self.inflated_method_cache
			.borrow()
			.get(&(base as *const _ as usize, inst as *const _ as usize))
			.copied()
	}

	pub(crate) fn insert_inflated_method(&self, base: &'l RtMethod<'l>, inst: &'l GenericInstSig<'l>, method: &'l RtMethod<'l>) {
		self.inflated_method_cache
			.borrow_mut()
			.insert((base as *const _ as usize, inst as *const _ as usize), method);
	}

	pub(crate) fn cached_reflection_type(&self, class: &'l RtClass<'l>) -> Option<*mut crate::vm::reflection::RtReflectionType<'l>> {
		self.reflection_type_cache
			.borrow()
			.get(&(class as *const _ as usize))
			.map(|p| *p as *mut crate::vm::reflection::RtReflectionType<'l>)
	}

	pub(crate) fn insert_reflection_type(&self, class: &'l RtClass<'l>, obj: *mut crate::vm::reflection::RtReflectionType<'l>) {
		self.reflection_type_cache
			.borrow_mut()
			.insert(class as *const _ as usize, obj as usize);
	}

	pub(crate) fn cached_reflection_assembly(&self, module: &'l Module<'l>) -> Option<*mut crate::vm::reflection::RtReflectionAssembly<'l>> {
		self.reflection_assembly_cache
			.borrow()
			.get(&module.id())
			.map(|p| *p as *mut crate::vm::reflection::RtReflectionAssembly<'l>)
	}

	pub(crate) fn insert_reflection_assembly(&self, module: &'l Module<'l>, obj: *mut crate::vm::reflection::RtReflectionAssembly<'l>) {
		self.reflection_assembly_cache
			.borrow_mut()
			.insert(module.id(), obj as usize);
	}

	// ### Exception slot ###

	#[inline]
	pub(crate) fn exception_slot(&self) -> *mut *mut RtException<'l> {
		self.exception_slot.get()
	}

	#[inline]
	pub(crate) fn set_exception_slot(&self, slot: *mut *mut RtException<'l>) {
		self.exception_slot.set(slot);
	}

	// ### Internal-call registries ###

	pub(crate) fn register_icall(&self, signature: &'static str, entry: IcallEntry) {
		self.icalls.borrow_mut().insert(signature, entry);
	}

	pub(crate) fn register_intrinsic(&self, signature: &'static str, entry: IcallEntry) {
		self.intrinsics.borrow_mut().insert(signature, entry);
	}

	pub(crate) fn register_newobj(&self, signature: &'static str, entry: IcallEntry) {
		self.newobj_entries.borrow_mut().insert(signature, entry);
	}

	pub(crate) fn lookup_icall(&self, signature: &str) -> Option<IcallEntry> {
		self.icalls.borrow().get(signature).copied()
	}

	pub(crate) fn lookup_intrinsic(&self, signature: &str) -> Option<IcallEntry> {
		self.intrinsics.borrow().get(signature).copied()
	}

	pub(crate) fn lookup_newobj(&self, signature: &str) -> Option<IcallEntry> {
		self.newobj_entries.borrow().get(signature).copied()
	}

	// ### Settings ###

	pub fn settings(&self) -> std::cell::Ref<'_, Settings> {
		self.settings.borrow()
	}

	pub fn settings_mut(&self) -> std::cell::RefMut<'_, Settings> {
		self.settings.borrow_mut()
	}
}

impl Default for Context<'_> {
	fn default() -> Self {
		Self::new()
	}
}
