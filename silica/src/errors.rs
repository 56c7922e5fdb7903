use thiserror::Error;

/// Runtime error kinds. Most map 1:1 onto a corlib exception class; the
/// execution boundary performs that translation (see `vm::exception`).
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RtErr {
	#[error("feature is not implemented")]
	NotImplemented,
	#[error("operation is not supported")]
	NotSupported,
	#[error("evaluation or frame stack exhausted")]
	StackOverflow,
	#[error("invalid cast")]
	InvalidCast,
	#[error("null reference")]
	NullReference,
	#[error("array type mismatch")]
	ArrayTypeMismatch,
	#[error("index out of range")]
	IndexOutOfRange,
	#[error("out of memory")]
	OutOfMemory,
	#[error("arithmetic error")]
	Arithmetic,
	#[error("division by zero")]
	DivideByZero,
	#[error("arithmetic overflow")]
	Overflow,
	#[error("invalid argument")]
	Argument,
	#[error("argument is null")]
	ArgumentNull,
	#[error("argument out of range")]
	ArgumentOutOfRange,
	#[error("type failed to load")]
	TypeLoad,
	#[error("missing field")]
	MissingField,
	#[error("missing method")]
	MissingMethod,
	#[error("missing member")]
	MissingMember,
	#[error("malformed image")]
	BadImageFormat,
	#[error("entry point not found")]
	EntryPointNotFound,
	#[error("type has been unloaded")]
	TypeUnloaded,
	#[error("execution engine fault")]
	ExecutionEngine,
	#[error("a managed exception is pending in the current-exception slot")]
	ManagedException,
	#[error("assembly file not found")]
	FileNotFound,
	#[error("module with the same name is already loaded")]
	ModuleAlreadyLoaded,
}

pub type RtResult<T> = Result<T, RtErr>;

/// Raw-layer parse failures all surface as malformed-image errors.
impl From<std::io::Error> for RtErr {
	fn from(_: std::io::Error) -> Self {
		RtErr::BadImageFormat
	}
}
