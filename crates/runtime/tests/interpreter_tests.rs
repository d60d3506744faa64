//! End-to-end interpreter tests: source text in, observable behaviour out.

use crux_core::Value;
use crux_runtime::{InterpretError, Vm};

fn run(source: &str) -> Vm {
    let mut vm = Vm::new(vec!["test.crux".to_string()]);
    vm.capture_output();
    if vm.interpret(source).is_err() {
        panic!("program failed:\n{}", source);
    }
    vm
}

fn output_of(source: &str) -> String {
    let mut vm = run(source);
    vm.take_output()
}

fn runtime_error(source: &str) {
    let mut vm = Vm::new(vec!["test.crux".to_string()]);
    vm.capture_output();
    assert_eq!(
        vm.interpret(source),
        Err(InterpretError::Runtime),
        "expected a runtime error:\n{}",
        source
    );
}

// --- the concrete scenarios -------------------------------------------------

#[test]
fn test_addition_prints_five() {
    assert_eq!(output_of("let a = 2; let b = 3; println(a + b);"), "5\n");
}

#[test]
fn test_closure_counts_through_upvalue() {
    let source = "fn make() { let x = 1; fn inner() { x += 1; return x; } return inner; } \
                  let f = make(); println(f()); println(f());";
    assert_eq!(output_of(source), "2\n3\n");
}

#[test]
fn test_array_index_and_mutation() {
    let source = "let xs = [10, 20, 30]; println(xs[1]); xs[1] = 99; println(xs[1]);";
    assert_eq!(output_of(source), "20\n99\n");
}

#[test]
fn test_result_match_prints_payload() {
    let source = "let r = ok(42); match r { Ok(v) => println(v), Err(e) => println(\"bad\") }";
    assert_eq!(output_of(source), "42\n");
}

#[test]
fn test_struct_fields() {
    let source = "struct Point { x, y } let p = Point{x: 3, y: 4}; println(p.x + p.y);";
    assert_eq!(output_of(source), "7\n");
}

#[test]
fn test_recursive_factorial() {
    let source = "fn f(n) { if (n <= 1) return 1; return n * f(n-1); } println(f(5));";
    assert_eq!(output_of(source), "120\n");
}

// --- arithmetic -------------------------------------------------------------

#[test]
fn test_int_arithmetic_stays_int() {
    let vm = run("let v = 2 + 3;");
    assert_eq!(vm.get_global("v"), Some(Value::Int(5)));
}

#[test]
fn test_int_overflow_promotes_to_float() {
    let vm = run("let v = 2147483647 + 1;");
    assert_eq!(vm.get_global("v"), Some(Value::Float(2147483648.0)));
}

#[test]
fn test_division_always_floats() {
    let vm = run("let v = 6 / 3;");
    assert_eq!(vm.get_global("v"), Some(Value::Float(2.0)));
}

#[test]
fn test_int_divide_stays_int() {
    let vm = run("let v = 7 \\ 2;");
    assert_eq!(vm.get_global("v"), Some(Value::Int(3)));
}

#[test]
fn test_int_min_int_divide_minus_one_promotes() {
    let vm = run("let min = -2147483647 - 1; let v = min \\ -1;");
    assert_eq!(vm.get_global("v"), Some(Value::Float(2147483648.0)));
}

#[test]
fn test_int_min_modulo_minus_one_is_zero() {
    let vm = run("let min = -2147483647 - 1; let v = min % -1;");
    assert_eq!(vm.get_global("v"), Some(Value::Int(0)));
}

#[test]
fn test_negate_int_min_promotes() {
    let vm = run("let min = -2147483647 - 1; let v = -min;");
    assert_eq!(vm.get_global("v"), Some(Value::Float(2147483648.0)));
}

#[test]
fn test_power_always_floats() {
    let vm = run("let v = 2 ** 10;");
    assert_eq!(vm.get_global("v"), Some(Value::Float(1024.0)));
}

#[test]
fn test_mixed_arithmetic_floats() {
    let vm = run("let v = 1 + 0.5;");
    assert_eq!(vm.get_global("v"), Some(Value::Float(1.5)));
}

#[test]
fn test_shift_bounds() {
    let vm = run("let a = 1 << 0; let b = 1 << 31; let c = 4 >> 1;");
    assert_eq!(vm.get_global("a"), Some(Value::Int(1)));
    assert_eq!(vm.get_global("b"), Some(Value::Int(i32::MIN)));
    assert_eq!(vm.get_global("c"), Some(Value::Int(2)));
}

#[test]
fn test_shift_out_of_range_errors() {
    runtime_error("let v = 1 << 32;");
    runtime_error("let v = 1 << -1;");
}

#[test]
fn test_shift_requires_ints() {
    runtime_error("let v = 1.5 << 1;");
}

#[test]
fn test_division_by_zero_errors() {
    runtime_error("let v = 1 / 0;");
    runtime_error("let v = 1 \\ 0;");
    runtime_error("let v = 1 % 0;");
}

#[test]
fn test_adding_bool_errors() {
    runtime_error("let v = 1 + true;");
}

// --- strings ----------------------------------------------------------------

#[test]
fn test_string_concatenation_stringifies() {
    assert_eq!(output_of("println(\"n = \" + 42);"), "n = 42\n");
    assert_eq!(output_of("println(1 + \"!\");"), "1!\n");
}

#[test]
fn test_string_indexing() {
    assert_eq!(output_of("let s = \"abc\"; println(s[1]);"), "b\n");
    runtime_error("let s = \"abc\"; let c = s[3];");
}

#[test]
fn test_string_methods() {
    assert_eq!(output_of("println(\"hi there\".upper()?);"), "HI THERE\n");
    assert_eq!(
        output_of("println(\"a,b,c\".split(\",\")?);"),
        "[\"a\", \"b\", \"c\"]\n"
    );
    assert_eq!(output_of("println(\"hello\".contains(\"ell\")?);"), "true\n");
    assert_eq!(
        output_of("println(\"hello\".substring(1, 3)?);"),
        "el\n"
    );
}

#[test]
fn test_escape_sequences() {
    assert_eq!(output_of("print(\"a\\tb\\n\");"), "a\tb\n");
}

// --- variables, scopes, control flow ----------------------------------------

#[test]
fn test_global_redefinition_errors_outside_repl() {
    runtime_error("let a = 1; let a = 2;");
}

#[test]
fn test_repl_allows_redefinition() {
    let mut vm = Vm::new(vec![]); // no args: REPL module
    vm.capture_output();
    vm.interpret("let a = 1;").unwrap();
    vm.interpret("let a = 2;").unwrap();
    vm.interpret("println(a);").unwrap();
    assert_eq!(vm.take_output(), "2\n");
}

#[test]
fn test_undefined_variable_errors() {
    runtime_error("println(missing);");
}

#[test]
fn test_assignment_to_undefined_global_errors() {
    runtime_error("missing = 1;");
}

#[test]
fn test_while_loop() {
    let source = "let total = 0; let i = 0; while (i < 5) { total += i; i += 1; } println(total);";
    assert_eq!(output_of(source), "10\n");
}

#[test]
fn test_for_loop() {
    let source = "let total = 0; for (let i = 0; i < 4; i += 1) { total += i; } println(total);";
    assert_eq!(output_of(source), "6\n");
}

#[test]
fn test_if_else() {
    assert_eq!(
        output_of("if (1 > 2) println(\"a\"); else println(\"b\");"),
        "b\n"
    );
}

#[test]
fn test_logical_operators_short_circuit() {
    let source = "fn boom() { panic(\"called\"); } let v = false and boom(); println(v);";
    assert_eq!(output_of(source), "false\n");
    let source = "fn boom() { panic(\"called\"); } let v = true or boom(); println(v);";
    assert_eq!(output_of(source), "true\n");
}

#[test]
fn test_zero_is_falsy() {
    assert_eq!(output_of("if (0) println(\"t\"); else println(\"f\");"), "f\n");
    assert_eq!(
        output_of("if (0.0) println(\"t\"); else println(\"f\");"),
        "f\n"
    );
}

#[test]
fn test_compound_assignment_on_globals() {
    let vm = run("let x = 10; x += 5; x -= 1; x *= 2; x \\= 3; x %= 7;");
    // ((10+5-1)*2)\3 = 9; 9 % 7 = 2
    assert_eq!(vm.get_global("x"), Some(Value::Int(2)));
}

#[test]
fn test_compound_division_promotes() {
    let vm = run("let x = 9; x /= 2;");
    assert_eq!(vm.get_global("x"), Some(Value::Float(4.5)));
}

// --- closures ---------------------------------------------------------------

#[test]
fn test_closures_share_captured_variable() {
    let source = "\
fn make() {
    let count = 0;
    fn add() { count += 1; return count; }
    fn read() { return count; }
    return [add, read];
}
let fns = make();
let add = fns[0];
let read = fns[1];
add(); add();
println(read());";
    assert_eq!(output_of(source), "2\n");
}

#[test]
fn test_closed_upvalue_observes_final_value() {
    let source = "\
fn make() {
    let x = 1;
    fn get() { return x; }
    x = 99;
    return get;
}
let g = make();
println(g());";
    assert_eq!(output_of(source), "99\n");
}

#[test]
fn test_anonymous_function_expression() {
    let source = "let double = fn(n) { return n * 2; }; println(double(21));";
    assert_eq!(output_of(source), "42\n");
}

#[test]
fn test_arity_mismatch_errors() {
    runtime_error("fn f(a, b) { return a; } f(1);");
}

#[test]
fn test_calling_non_function_errors() {
    runtime_error("let x = 5; x();");
}

#[test]
fn test_deep_recursion_overflows() {
    runtime_error("fn f(n) { return f(n + 1); } f(0);");
}

// --- collections ------------------------------------------------------------

#[test]
fn test_table_literal_get_set() {
    let source = "\
let t = {\"a\": 1, 2: \"two\"};
println(t[\"a\"]);
println(t[2]);
t[\"a\"] = 10;
println(t[\"a\"]);
println(len(t)?);";
    assert_eq!(output_of(source), "1\ntwo\n10\n2\n");
}

#[test]
fn test_table_insert_grows_len() {
    let source = "let t = {}; t[1] = \"one\"; println(len(t)?); println(t[1]);";
    assert_eq!(output_of(source), "1\none\n");
}

#[test]
fn test_numeric_keys_unify_across_int_and_float() {
    let source = "let t = {1: \"x\"}; println(t[1.0]);";
    assert_eq!(output_of(source), "x\n");
}

#[test]
fn test_array_methods() {
    let source = "\
let xs = [1, 2];
xs.push(3)?;
println(xs);
println(xs.pop()?);
println(len(xs)?);
println(xs.contains(2));";
    assert_eq!(output_of(source), "[1, 2, 3]\n3\n2\ntrue\n");
}

#[test]
fn test_array_set_keeps_length() {
    let source = "let xs = [1, 2, 3]; xs[0] = 9; println(len(xs)?); println(xs);";
    assert_eq!(output_of(source), "3\n[9, 2, 3]\n");
}

#[test]
fn test_array_out_of_bounds_errors() {
    runtime_error("let xs = [1]; let v = xs[1];");
    runtime_error("let xs = [1]; xs[-1] = 0;");
}

#[test]
fn test_static_array_rejects_writes() {
    assert_eq!(output_of("let xs = #[1, 2]; println(xs[1]);"), "2\n");
    runtime_error("let xs = #[1, 2]; xs[0] = 9;");
}

#[test]
fn test_static_table_rejects_writes() {
    assert_eq!(output_of("let t = #{1: \"a\"}; println(t[1]);"), "a\n");
    runtime_error("let t = #{1: \"a\"}; t[1] = \"b\";");
}

#[test]
fn test_duplicate_table_keys_last_wins() {
    assert_eq!(output_of("let t = {1: \"a\", 1: \"b\"}; println(t[1]);"), "b\n");
}

#[test]
fn test_unhashable_key_errors() {
    runtime_error("let t = {}; t[[1]] = 2;");
}

#[test]
fn test_table_methods() {
    let source = "let t = {1: \"a\"}; println(t.has_key(1)); println(t.has_key(9));";
    assert_eq!(output_of(source), "true\nfalse\n");
}

// --- structs ----------------------------------------------------------------

#[test]
fn test_struct_field_assignment() {
    let source = "struct P { x, y } let p = P{x: 1, y: 2}; p.x = 10; println(p.x);";
    assert_eq!(output_of(source), "10\n");
}

#[test]
fn test_struct_unknown_field_errors() {
    runtime_error("struct P { x } let p = P{x: 1}; println(p.z);");
    runtime_error("struct P { x } let p = P{z: 1};");
}

#[test]
fn test_struct_missing_fields_default_nil() {
    assert_eq!(output_of("struct P { x, y } let p = P{x: 1}; println(p.y);"), "nil\n");
}

#[test]
fn test_struct_field_callable_invokes() {
    let source = "\
struct Ops { op }
let ops = Ops{op: fn(n) { return n + 1; }};
println(ops.op(41));";
    assert_eq!(output_of(source), "42\n");
}

#[test]
fn test_property_on_non_struct_errors() {
    runtime_error("let x = 1; println(x.field);");
}

// --- match ------------------------------------------------------------------

#[test]
fn test_match_value_arms() {
    let source = "\
fn name(n) {
    let label = \"\";
    match n {
        1 => { label = \"one\"; },
        2 => { label = \"two\"; },
        default => { label = \"many\"; },
    }
    return label;
}
println(name(1)); println(name(2)); println(name(3));";
    assert_eq!(output_of(source), "one\ntwo\nmany\n");
}

#[test]
fn test_match_as_expression_value() {
    let source = "let r = ok(42); let v = match r { Ok(x) => x, Err(e) => e };\nprintln(v);";
    assert_eq!(output_of(source), "42\n");
}

#[test]
fn test_match_err_payload() {
    let source = "\
let r = err(\"broken\");
match r {
    Ok(v) => println(\"fine\"),
    Err(e) => println(e.message()?),
}";
    assert_eq!(output_of(source), "broken\n");
}

#[test]
fn test_match_give_in_block_arm() {
    let source = "\
let v = match 2 {
    1 => \"one\",
    2 => { give \"two\"; },
    default => \"other\",
};
println(v);";
    assert_eq!(output_of(source), "two\n");
}

#[test]
fn test_match_default_taken() {
    let source = "let v = match 9 { 1 => \"one\", default => \"other\" };\nprintln(v);";
    assert_eq!(output_of(source), "other\n");
}

// --- results, errors, unwrap ------------------------------------------------

#[test]
fn test_unwrap_ok() {
    assert_eq!(output_of("println(ok(7)?);"), "7\n");
}

#[test]
fn test_unwrap_err_surfaces_error_value() {
    let source = "let e = err(\"oops\")?; println(typeof e); println(e.message()?);";
    assert_eq!(output_of(source), "error\noops\n");
}

#[test]
fn test_unwrap_non_result_errors() {
    runtime_error("let v = 5?;");
}

#[test]
fn test_result_is_ok_is_err() {
    assert_eq!(output_of("println(ok(1).is_ok()); println(err(\"x\").is_err());"), "true\ntrue\n");
}

#[test]
fn test_panic_unwinds() {
    runtime_error("panic(\"boom\");");
}

#[test]
fn test_assert_failure_unwinds() {
    runtime_error("assert(1 == 2, \"math is broken\");");
}

#[test]
fn test_assert_success_continues() {
    assert_eq!(output_of("assert(1 == 1, \"fine\"); println(\"after\");"), "after\n");
}

#[test]
fn test_vm_usable_after_runtime_error() {
    let mut vm = Vm::new(vec![]);
    vm.capture_output();
    assert_eq!(vm.interpret("panic(\"boom\");"), Err(InterpretError::Runtime));
    vm.interpret("println(\"still alive\");").unwrap();
    assert_eq!(vm.take_output(), "still alive\n");
}

#[test]
fn test_vm_usable_after_compile_error() {
    let mut vm = Vm::new(vec![]);
    vm.capture_output();
    assert_eq!(vm.interpret("let x = ;"), Err(InterpretError::Compile));
    vm.interpret("let x = 3; println(x);").unwrap();
    assert_eq!(vm.take_output(), "3\n");
}

// --- typeof -----------------------------------------------------------------

#[test]
fn test_typeof_names() {
    let source = "\
println(typeof 1);
println(typeof 1.5);
println(typeof true);
println(typeof nil);
println(typeof \"s\");
println(typeof [1]);
println(typeof {1: 2});
println(typeof #[1]);
println(typeof ok(1));
println(typeof println);";
    assert_eq!(
        output_of(source),
        "int\nfloat\nboolean\nnil\nstring\narray\ntable\nstatic array\nresult\nfunction\n"
    );
}

#[test]
fn test_typeof_is_stable() {
    let source = "println(typeof (1 + 1) == typeof (2 + 2));";
    assert_eq!(output_of(source), "true\n");
}

#[test]
fn test_typeof_struct_names() {
    let source = "struct P { x } println(typeof P); let p = P{x: 1}; println(typeof p);";
    assert_eq!(output_of(source), "struct\nstruct instance\n");
}

// --- equality ---------------------------------------------------------------

#[test]
fn test_value_equality() {
    let source = "\
println(1 == 1.0);
println(\"a\" == \"a\");
println([1] == [1]);
println(nil == nil);
println(1 != 2);";
    // Arrays compare by identity; distinct literals differ.
    assert_eq!(output_of(source), "true\ntrue\nfalse\ntrue\ntrue\n");
}

#[test]
fn test_interned_strings_compare_equal_after_building() {
    let source = "let a = \"he\" + \"llo\"; println(a == \"hello\");";
    assert_eq!(output_of(source), "true\n");
}

// --- native modules ---------------------------------------------------------

#[test]
fn test_use_native_math() {
    let source = "use sqrt, pi from \"crux:math\"; println(sqrt(9.0)?); println(pi() > 3.14);";
    assert_eq!(output_of(source), "3\ntrue\n");
}

#[test]
fn test_use_native_with_alias() {
    let source = "use sqrt as root from \"crux:math\"; println(root(16)?);";
    assert_eq!(output_of(source), "4\n");
}

#[test]
fn test_unknown_native_module_errors() {
    runtime_error("use nothing from \"crux:nope\";");
}

#[test]
fn test_unknown_native_name_errors() {
    runtime_error("use missing_fn from \"crux:math\";");
}

#[test]
fn test_random_is_deterministic_after_seeding() {
    let source = "\
use Random from \"crux:random\";
let r = Random();
r.seed(7)?;
let a = r.int(0, 100)?;
r.seed(7)?;
let b = r.int(0, 100)?;
println(a == b);
println(a >= 0 and a <= 100);";
    assert_eq!(output_of(source), "true\ntrue\n");
}

#[test]
fn test_vectors_module() {
    let source = "\
use vec2 from \"crux:vectors\";
let v = vec2(3, 4)?;
println(v.length());
println(v.x());";
    assert_eq!(output_of(source), "5\n3\n");
}

#[test]
fn test_vector_scaling_and_normalize() {
    let source = "\
use vec2 from \"crux:vectors\";
let v = vec2(3, 4)?;
println(v.multiply(2)?.length());
println(v.divide(2)?.length());
let unit = v.normalize()?.length();
println(unit > 0.999 and unit < 1.001);";
    assert_eq!(output_of(source), "10\n2.5\ntrue\n");
}

#[test]
fn test_vector_equals_and_distance() {
    let source = "\
use vec2, vec3 from \"crux:vectors\";
println(vec2(1, 0)?.equals(vec2(1, 0)?)?);
println(vec2(1, 0)?.equals(vec2(0, 1)?)?);
println(vec2(0, 0)?.distance(vec2(3, 4)?)?);
println(vec3(1, 2, 3)?.equals(vec3(1, 2, 3)?)?);";
    assert_eq!(output_of(source), "true\nfalse\n5\ntrue\n");
}

#[test]
fn test_vector_cross_product() {
    let source = "\
use vec3 from \"crux:vectors\";
let c = vec3(1, 0, 0)?.cross(vec3(0, 1, 0)?)?;
println(c.x());
println(c.y());
println(c.z());";
    assert_eq!(output_of(source), "0\n0\n1\n");
}

#[test]
fn test_vector_rotate_lerp_reflect() {
    // Rotating (1, 0) a quarter turn lands on (0, 1) within the vector
    // equality tolerance.
    let source = "\
use vec2 from \"crux:vectors\";
let quarter = vec2(1, 0)?.rotate(3.141592653589793 / 2)?;
println(quarter.equals(vec2(0, 1)?)?);
let mid = vec2(0, 0)?.lerp(vec2(10, 20)?, 0.5)?;
println(mid.x());
println(mid.y());
let bounced = vec2(1, -1)?.reflect(vec2(0, 1)?)?;
println(bounced.equals(vec2(1, 1)?)?);";
    assert_eq!(output_of(source), "true\n5\n10\ntrue\n");
}

#[test]
fn test_vector_angles_are_half_pi() {
    let source = "\
use vec2 from \"crux:vectors\";
let up = vec2(0, 2)?.angle()?;
println(up > 1.57 and up < 1.58);
let between = vec2(1, 0)?.angle_between(vec2(0, 1)?)?;
println(between > 1.57 and between < 1.58);";
    assert_eq!(output_of(source), "true\ntrue\n");
}

#[test]
fn test_vector_zero_guards_are_errs() {
    let source = "\
use vec2 from \"crux:vectors\";
println(vec2(1, 1)?.divide(0).is_err());
println(vec2(0, 0)?.normalize().is_err());
println(vec2(1, 1)?.reflect(vec2(0, 0)?).is_err());
println(vec2(1, 1)?.angle_between(vec2(0, 0)?).is_err());";
    assert_eq!(output_of(source), "true\ntrue\ntrue\ntrue\n");
}

#[test]
fn test_math_min_max_preserve_int() {
    let source = "use min, max from \"crux:math\"; println(min(2, 5)); println(max(2, 5));";
    assert_eq!(output_of(source), "Ok(2)\nOk(5)\n");
}

// --- conversions ------------------------------------------------------------

#[test]
fn test_int_and_float_conversions() {
    let source = "\
println(int(\"42\")?);
println(int(3.9)?);
println(float(2)?);
println(int(true)?);";
    assert_eq!(output_of(source), "42\n3\n2\n1\n");
}

#[test]
fn test_bad_conversion_is_err() {
    let source = "match int(\"not a number\") { Ok(v) => println(\"ok\"), Err(e) => println(\"err\") }";
    assert_eq!(output_of(source), "err\n");
}
