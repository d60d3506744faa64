//! Module loader tests: real files on disk, imports, visibility, caching,
//! and cycle detection.

use std::fs;
use std::path::Path;

use crux_runtime::{InterpretError, Vm};

fn write_file(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write module source");
    path.display().to_string()
}

fn vm_for_script(script_path: &str) -> Vm {
    let mut vm = Vm::new(vec![script_path.to_string()]);
    vm.capture_output();
    vm
}

#[test]
fn test_import_public_value() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "lib.crux", "pub let answer = 42;\n");
    let main = write_file(
        dir.path(),
        "main.crux",
        "use answer from \"./lib.crux\";\nprintln(answer);\n",
    );

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    vm.interpret(&source).expect("main module runs");
    assert_eq!(vm.take_output(), "42\n");
}

#[test]
fn test_import_public_function_with_alias() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(
        dir.path(),
        "lib.crux",
        "pub fn double(n) { return n * 2; }\n",
    );
    let main = write_file(
        dir.path(),
        "main.crux",
        "use double as twice from \"./lib.crux\";\nprintln(twice(21));\n",
    );

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    vm.interpret(&source).expect("main module runs");
    assert_eq!(vm.take_output(), "42\n");
}

#[test]
fn test_private_names_are_not_importable() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(
        dir.path(),
        "lib.crux",
        "let secret = 1;\npub let open = 2;\n",
    );
    let main = write_file(
        dir.path(),
        "main.crux",
        "use secret from \"./lib.crux\";\n",
    );

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    assert_eq!(vm.interpret(&source), Err(InterpretError::Runtime));
}

#[test]
fn test_module_top_level_runs_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(
        dir.path(),
        "lib.crux",
        "println(\"loaded\");\npub let marker = 1;\n",
    );
    let main = write_file(
        dir.path(),
        "main.crux",
        "use marker from \"./lib.crux\";\nuse marker as marker2 from \"./lib.crux\";\nprintln(marker + marker2);\n",
    );

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    vm.interpret(&source).expect("main module runs");
    // One "loaded" despite two imports: the second hit the cache.
    assert_eq!(vm.take_output(), "loaded\n2\n");
}

#[test]
fn test_circular_import_is_detected() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "a.crux", "use b_value from \"./b.crux\";\npub let a_value = 1;\n");
    write_file(dir.path(), "b.crux", "use a_value from \"./a.crux\";\npub let b_value = 2;\n");
    let main = write_file(dir.path(), "main.crux", "use a_value from \"./a.crux\";\n");

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    assert_eq!(vm.interpret(&source), Err(InterpretError::Runtime));
}

#[test]
fn test_missing_module_file_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let main = write_file(dir.path(), "main.crux", "use x from \"./nope.crux\";\n");

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    assert_eq!(vm.interpret(&source), Err(InterpretError::Runtime));
}

#[test]
fn test_transitive_imports() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "base.crux", "pub let base = 10;\n");
    write_file(
        dir.path(),
        "mid.crux",
        "use base from \"./base.crux\";\npub let mid = base + 5;\n",
    );
    let main = write_file(
        dir.path(),
        "main.crux",
        "use mid from \"./mid.crux\";\nprintln(mid);\n",
    );

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    vm.interpret(&source).expect("main module runs");
    assert_eq!(vm.take_output(), "15\n");
}

#[test]
fn test_module_globals_are_isolated() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "lib.crux", "let private_state = 9;\npub let ok_val = 1;\n");
    let main = write_file(
        dir.path(),
        "main.crux",
        "use ok_val from \"./lib.crux\";\nprintln(private_state);\n",
    );

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    // The library's private global is not visible here.
    assert_eq!(vm.interpret(&source), Err(InterpretError::Runtime));
}

#[test]
fn test_module_with_runtime_error_fails_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "lib.crux", "pub let x = 1;\npanic(\"module init failed\");\n");
    let main = write_file(dir.path(), "main.crux", "use x from \"./lib.crux\";\n");

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    assert_eq!(vm.interpret(&source), Err(InterpretError::Runtime));
}

#[test]
fn test_module_with_compile_error_fails_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(dir.path(), "lib.crux", "let = broken;\n");
    let main = write_file(dir.path(), "main.crux", "use x from \"./lib.crux\";\n");

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    assert_eq!(vm.interpret(&source), Err(InterpretError::Compile));
}

#[test]
fn test_imported_closure_keeps_its_module_globals() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_file(
        dir.path(),
        "lib.crux",
        "let hidden = 40;\npub fn reveal() { return hidden + 2; }\n",
    );
    let main = write_file(
        dir.path(),
        "main.crux",
        "use reveal from \"./lib.crux\";\nprintln(reveal());\n",
    );

    let mut vm = vm_for_script(&main);
    let source = fs::read_to_string(&main).unwrap();
    vm.interpret(&source).expect("main module runs");
    assert_eq!(vm.take_output(), "42\n");
}
