use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn missing_assembly_argument_is_a_usage_error() {
	Command::cargo_bin("silica")
		.unwrap()
		.assert()
		.failure()
		.code(2)
		.stderr(predicate::str::contains("Usage"));
}

#[test]
fn unreadable_assembly_path_reports_and_exits_2() {
	Command::cargo_bin("silica")
		.unwrap()
		.arg("definitely-not-a-real-assembly.dll")
		.assert()
		.failure()
		.code(2)
		.stderr(predicate::str::contains("cannot read"));
}

#[test]
fn garbage_image_fails_with_runtime_error() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("garbage.dll");
	std::fs::write(&path, b"this is not a PE image").unwrap();

	Command::cargo_bin("silica")
		.unwrap()
		.arg(&path)
		.assert()
		.failure()
		.code(255)
		.stderr(predicate::str::contains("malformed image"));
}
