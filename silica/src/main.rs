use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use silica::vm::settings::{DirectoryAssemblyLoader, Settings};
use silica::vm::{runtime, string};
use silica::Context;

/// Sample embedder shell: loads an assembly and its dependencies, then
/// runs the entry point under the interpreter the host wires in.
#[derive(Parser, Debug)]
#[command(name = "silica", version, about = "Run a CLI assembly under the silica runtime core")]
struct Args {
	/// Assembly to execute (.dll or .exe). Its directory is searched
	/// for dependencies automatically.
	assembly: PathBuf,

	/// Additional library search directories.
	#[arg(short = 'l', long = "lib", value_name = "DIR")]
	lib_dirs: Vec<PathBuf>,

	/// Entry-point override, e.g. `My.Namespace.Program::Main`.
	#[arg(short = 'e', long = "entry", value_name = "PATH")]
	entry: Option<String>,

	/// Arguments passed through to the managed program.
	#[arg(last = true)]
	program_args: Vec<String>,
}

fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();

	let Ok(bytes) = std::fs::read(&args.assembly) else {
		eprintln!("silica: cannot read {}", args.assembly.display());
		return ExitCode::from(2);
	};

	let mut search_dirs = args.lib_dirs.clone();
	if let Some(parent) = args.assembly.parent() {
		search_dirs.push(parent.to_path_buf());
	}

	let mut settings = Settings::default();
	settings.assembly_loader = Some(Box::new(DirectoryAssemblyLoader::new(&search_dirs)));
	settings.program_args = args.program_args.clone();
	settings.report_unhandled_exception = Some(report_unhandled);

	let ctx = Context::with_settings(settings);
	match run(&ctx, &bytes, args.entry.as_deref()) {
		Ok(code) => ExitCode::from(code as u8),
		Err(err) => {
			eprintln!("silica: {err}");
			// Managed failures report through the unhandled hook above;
			// -1 mirrors the process exit convention.
			ExitCode::from(u8::MAX)
		},
	}
}

fn run<'l>(ctx: &'l Context<'l>, bytes: &[u8], entry: Option<&str>) -> silica::RtResult<i32> {
	// The first loaded assembly becomes the corlib, so resolve it by
	// its conventional names before touching the program image.
	let corlib = ["mscorlib", "System.Private.CoreLib", "corlib"]
		.iter()
		.find_map(|name| ctx.load_module_by_name(name).ok());

	let module = match ctx.load_assembly(bytes) {
		Ok(module) => module,
		// The program image may itself be the corlib found above.
		Err(silica::RtErr::ModuleAlreadyLoaded) => corlib.ok_or(silica::RtErr::ModuleAlreadyLoaded)?,
		Err(err) => return Err(err),
	};
	runtime::initialize(ctx)?;
	runtime::execute_entry_point(ctx, module, entry)
}

fn report_unhandled<'l>(_ctx: &'l Context<'l>, ex: *mut silica::vm::object::RtException<'l>) {
	if ex.is_null() {
		return;
	}
	let class_name = unsafe { (*ex).header.klass.to_string() };
	let message = unsafe {
		match (*ex).message.is_null() {
			true => String::new(),
			false => string::string_to_rust((*ex).message),
		}
	};
	eprintln!("Unhandled exception: {class_name}: {message}");
}
