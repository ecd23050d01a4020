//! End-to-end pipeline tests
//!
//! The scenarios compile real programs and assert on the TAC and assembly
//! the way unit tests do, but the boolean/short-circuit and optimization
//! properties are checked by actually evaluating the lowered TAC with a
//! small interpreter: same program, optimized and not, must print the same
//! values, and the sixteen boolean operator combinations must match Rust's
//! own semantics.

use bxc::cfg::opt;
use bxc::lower::Context;
use bxc::tac::is_ordinary;
use bxc::{Instr, Opcode};
use std::collections::HashMap;

fn compile(source: &str) -> (Vec<Instr>, Context) {
    bxc::compile_to_tac(source).expect("compilation failed")
}

fn compile_opt(source: &str) -> (Vec<Instr>, Context) {
    let (instr, mut ctx) = compile(source);
    let instr = opt::run_pipeline(&mut ctx, instr);
    (instr, ctx)
}

/// Minimal TAC evaluator for programs whose only calls are `print`.
/// Returns the printed values as `(symbol, value)` pairs.
fn evaluate_main(instr: &[Instr], ctx: &Context) -> Vec<(String, i64)> {
    let (start, finish) = ctx
        .procs
        .iter()
        .find(|&&(s, _)| instr[s].result.as_deref() == Some("main"))
        .copied()
        .expect("no main procedure");
    let body = &instr[start + 1..=finish];

    let mut labels: HashMap<&str, usize> = HashMap::new();
    for (i, tac) in body.iter().enumerate() {
        if tac.opcode == Opcode::Label {
            labels.insert(&tac.args[0], i);
        }
    }

    let mut values: HashMap<String, i64> = HashMap::new();
    let mut symbols: HashMap<String, String> = HashMap::new();
    let mut params: HashMap<usize, i64> = HashMap::new();
    let mut output = Vec::new();

    let mut pc = 0usize;
    let mut steps = 0usize;
    while pc < body.len() {
        steps += 1;
        assert!(steps < 1_000_000, "interpreter did not terminate");
        let tac = &body[pc];
        let read = |values: &HashMap<String, i64>, operand: &str| -> i64 {
            values
                .get(operand)
                .copied()
                .unwrap_or_else(|| panic!("read of undefined operand {}", operand))
        };
        match tac.opcode {
            Opcode::Label | Opcode::Proc => {}
            Opcode::Const => {
                let result = tac.result.clone().unwrap();
                match tac.args[0].parse::<i64>() {
                    Ok(n) => {
                        values.insert(result, n);
                    }
                    Err(_) => {
                        symbols.insert(result.clone(), tac.args[0].clone());
                        values.insert(result, 0);
                    }
                }
            }
            Opcode::Copy => {
                // ignore the flagged static-link save; %p operands are not
                // modeled
                if tac.args.len() == 1 && !tac.args[0].starts_with("%p") {
                    let value = read(&values, &tac.args[0]);
                    values.insert(tac.result.clone().unwrap(), value);
                } else {
                    values.insert(tac.result.clone().unwrap(), 0);
                }
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Shl
            | Opcode::Shr => {
                let a = read(&values, &tac.args[0]);
                let b = read(&values, &tac.args[1]);
                let v = match tac.opcode {
                    Opcode::Add => a.wrapping_add(b),
                    Opcode::Sub => a.wrapping_sub(b),
                    Opcode::And => a & b,
                    Opcode::Or => a | b,
                    Opcode::Xor => a ^ b,
                    Opcode::Mul => a.wrapping_mul(b),
                    Opcode::Div => {
                        assert_ne!(b, 0, "division by zero was executed");
                        a / b
                    }
                    Opcode::Mod => {
                        assert_ne!(b, 0, "division by zero was executed");
                        a % b
                    }
                    Opcode::Shl => a << (b & 63),
                    _ => a >> (b & 63),
                };
                values.insert(tac.result.clone().unwrap(), v);
            }
            Opcode::Neg => {
                let a = read(&values, &tac.args[0]);
                values.insert(tac.result.clone().unwrap(), a.wrapping_neg());
            }
            Opcode::Not => {
                let a = read(&values, &tac.args[0]);
                values.insert(tac.result.clone().unwrap(), !a);
            }
            Opcode::Jmp => {
                let target = tac.jmp_target().expect("jmp without target");
                pc = labels[target.as_str()];
                continue;
            }
            Opcode::Jz | Opcode::Jnz | Opcode::Jl | Opcode::Jle | Opcode::Jg | Opcode::Jge => {
                let a = read(&values, &tac.args[0]);
                let taken = match tac.opcode {
                    Opcode::Jz => a == 0,
                    Opcode::Jnz => a != 0,
                    Opcode::Jl => a < 0,
                    Opcode::Jle => a <= 0,
                    Opcode::Jg => a > 0,
                    _ => a >= 0,
                };
                if taken {
                    pc = labels[tac.result.as_deref().unwrap()];
                    continue;
                }
            }
            Opcode::Param => {
                let index: usize = tac.result.as_deref().unwrap().parse().unwrap();
                params.insert(index, read(&values, &tac.args[0]));
            }
            Opcode::Call => {
                let symbol = symbols
                    .get(&tac.args[0])
                    .cloned()
                    .expect("call through an unmodeled code pointer");
                assert!(
                    symbol.starts_with("__bx_print"),
                    "interpreter only models print calls, got {}",
                    symbol
                );
                output.push((symbol, params[&1]));
                params.clear();
            }
            Opcode::Ret => break,
            Opcode::GetFp => {
                values.insert(tac.result.clone().unwrap(), 0);
            }
        }
        pc += 1;
    }
    output
}

fn printed(source: &str, optimize: bool) -> Vec<(String, i64)> {
    let (instr, ctx) = if optimize {
        compile_opt(source)
    } else {
        compile(source)
    };
    evaluate_main(&instr, &ctx)
}

// ---------------------------------------------------------------------
// Spec scenarios
// ---------------------------------------------------------------------

#[test]
fn s1_arithmetic_prints_42() {
    let out = printed("def main() { print(1 + 41 * 1); }", false);
    assert_eq!(out, vec![("__bx_print_int".to_string(), 42)]);
}

#[test]
fn s2_short_circuit_avoids_division_by_zero() {
    let source =
        "def main() { var x = 0 : int; if (false && (1 / 0 > 0)) { x = 1; } print(x); }";
    // the division is present in the TAC but must never execute
    let out = printed(source, false);
    assert_eq!(out, vec![("__bx_print_int".to_string(), 0)]);
}

#[test]
fn s2_optimizer_removes_unreachable_division() {
    let source =
        "def main() { var x = 0 : int; if (false && (1 / 0 > 0)) { x = 1; } print(x); }";
    let (instr, _) = compile_opt(source);
    assert!(
        !instr.iter().any(|i| i.opcode == Opcode::Div),
        "unreachable division survived UCE"
    );
}

#[test]
fn s3_while_break_prints_3() {
    let source = "def main() { var i = 0 : int; while (true) { if (i == 3) { break; } i = i + 1; } print(i); }";
    assert_eq!(printed(source, false), vec![("__bx_print_int".to_string(), 3)]);
}

#[test]
fn s4_higher_order_capturing_closure_structure() {
    let source = "def main() {
        var a = 10 : int;
        def add(x : int) : int { return x + a; }
        def apply(f : function(int) -> int, v : int) : int { return f(v); }
        print(apply(add, 5));
    }";
    let (instr, ctx) = compile(source);
    let names: Vec<_> = ctx
        .procs
        .iter()
        .map(|&(s, _)| instr[s].result.clone().unwrap())
        .collect();
    assert_eq!(names, vec!["main", "main::add0", "main::apply1"]);

    // the assembly walks the static link inside add to reach a
    let text = bxc::compile_to_asm(source, false).unwrap();
    assert!(text.contains("movq -8(%rbp), %r1"));
    // add travels as a (code pointer, static link) pair: apply is called
    // with 4 slots
    let apply_call = instr
        .iter()
        .filter(|i| i.opcode == Opcode::Call)
        .find(|i| i.result.is_some())
        .unwrap();
    assert_eq!(apply_call.args[1], "4");
}

#[test]
fn s5_jt_cond_collapses_inner_branch() {
    let source = "def main() {
        var x = 0 : int;
        if (x == 0) { if (x == 0) { print(1); } else { print(2); } } else { print(3); }
    }";
    let (plain, _) = compile(source);
    let (optimized, ctx) = compile_opt(source);

    let count =
        |instr: &[Instr]| instr.iter().filter(|i| i.opcode == Opcode::Jz).count();
    assert!(
        count(&optimized) < count(&plain),
        "inner repeated test must collapse to an unconditional jump"
    );
    // behavior is preserved
    assert_eq!(
        evaluate_main(&optimized, &ctx),
        vec![("__bx_print_int".to_string(), 1)]
    );
}

#[test]
fn s6_dead_copy_eliminated() {
    let source = "def main() { var x = 5 : int; var y = x : int; print(x); }";
    let (instr, ctx) = compile_opt(source);
    for (i, tac) in instr.iter().enumerate() {
        if tac.opcode == Opcode::Copy
            && tac.args.len() == 1
            && let Some(result) = &tac.result
            && is_ordinary(result)
        {
            let used = instr
                .iter()
                .enumerate()
                .any(|(j, other)| j != i && other.args.contains(result));
            assert!(used, "copy defining unused {} survived", result);
        }
    }
    assert_eq!(
        evaluate_main(&instr, &ctx),
        vec![("__bx_print_int".to_string(), 5)]
    );
}

// ---------------------------------------------------------------------
// Boolean operator truth tables (all sixteen combinations)
// ---------------------------------------------------------------------

#[test]
fn boolean_operator_combinations_match_source_semantics() {
    let literals = [("true", true), ("false", false)];
    for (a_text, a) in literals {
        for (b_text, b) in literals {
            for negate_lhs in [false, true] {
                for (op_text, is_and) in [("&&", true), ("||", false)] {
                    let lhs_text = if negate_lhs {
                        format!("!{}", a_text)
                    } else {
                        a_text.to_string()
                    };
                    let lhs = if negate_lhs { !a } else { a };
                    let expected = if is_and { lhs && b } else { lhs || b };

                    let source = format!(
                        "def main() {{ print({} {} {}); }}",
                        lhs_text, op_text, b_text
                    );
                    let out = printed(&source, false);
                    assert_eq!(
                        out,
                        vec![("__bx_print_bool".to_string(), i64::from(expected))],
                        "wrong value for {}",
                        source
                    );
                }
            }
        }
    }
}

#[test]
fn comparison_operators_branch_correctly() {
    for (expr, expected) in [
        ("1 == 1", true),
        ("1 == 2", false),
        ("1 != 2", true),
        ("2 < 3", true),
        ("3 < 2", false),
        ("2 <= 2", true),
        ("3 > 2", true),
        ("2 >= 3", false),
        ("-1 < 0", true),
    ] {
        let source = format!("def main() {{ print({}); }}", expr);
        let out = printed(&source, false);
        assert_eq!(
            out,
            vec![("__bx_print_bool".to_string(), i64::from(expected))],
            "wrong value for {}",
            expr
        );
    }
}

// ---------------------------------------------------------------------
// Optimization preservation
// ---------------------------------------------------------------------

#[test]
fn optimization_preserves_observable_behavior() {
    let programs = [
        "def main() { var i = 0 : int; var sum = 0 : int; while (i < 10) { sum = sum + i; i = i + 1; } print(sum); }",
        "def main() { var x = 3 : int; if (x > 0 && x < 10) { print(x * x); } else { print(0); } }",
        "def main() { var n = 1 : int; while (n < 100) { n = n * 2; if (n == 32) { continue; } } print(n); }",
        "def main() { print(10 % 3); print(10 / 3); print(1 << 5); print(-64 >> 2); print(~0); print(-(5)); }",
        "def main() { var b = true : bool; if (!b || 1 == 2) { print(0); } else { print(1); } }",
    ];
    for source in programs {
        assert_eq!(
            printed(source, false),
            printed(source, true),
            "optimization changed behavior of: {}",
            source
        );
    }
}

#[test]
fn optimization_preserves_procedures_and_label_uniqueness() {
    let source = "def helper(n : int) : int { return n * 2; }
                  def main() { var i = 0 : int; while (i < 4) { i = i + 1; } print(helper(i)); }";
    let (plain, _) = compile(source);
    let (optimized, _) = compile_opt(source);

    let proc_names = |instr: &[Instr]| -> Vec<String> {
        instr
            .iter()
            .filter(|i| i.opcode == Opcode::Proc)
            .map(|i| i.result.clone().unwrap())
            .collect()
    };
    assert_eq!(proc_names(&plain), proc_names(&optimized));

    let mut seen = std::collections::HashSet::new();
    for tac in &optimized {
        if tac.opcode == Opcode::Label {
            assert!(seen.insert(tac.args[0].clone()), "duplicate label");
        }
    }
}

// ---------------------------------------------------------------------
// File outputs
// ---------------------------------------------------------------------

#[test]
fn compile_file_writes_assembly_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("answer.bx");
    std::fs::write(&input, "def main() { print(6 * 7); }").unwrap();

    let stem = dir.path().join("answer");
    bxc::compile_file(&input, &stem, true).unwrap();

    let asm = std::fs::read_to_string(dir.path().join("answer.s")).unwrap();
    assert!(asm.contains("main:"));
    assert!(asm.contains(".globl main"));

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("answer.tac.json")).unwrap())
            .unwrap();
    let entries = json.as_array().unwrap();
    assert_eq!(entries[0]["proc"], "main");
    // literal arguments are JSON numbers
    let body = entries[0]["body"].as_array().unwrap();
    assert!(
        body.iter().any(|i| i["opcode"] == "const" && i["args"][0].is_number()),
        "numeric literals must dump as JSON numbers"
    );
}

#[test]
fn compile_file_reports_missing_input() {
    let dir = tempfile::tempdir().unwrap();
    let err = bxc::compile_file(
        &dir.path().join("missing.bx"),
        &dir.path().join("out"),
        false,
    )
    .unwrap_err();
    assert!(err.contains("failed to read"));
}

// ---------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------

#[test]
fn first_error_aborts_with_position() {
    let err = bxc::compile_to_asm("def main() { var x = 1 + true : int; }", false).unwrap_err();
    assert_eq!(err.kind, bxc::ErrorKind::TypeMismatch);
    let text = err.to_string();
    assert!(text.contains("type mismatch at 1:"), "got: {}", text);
}

#[test]
fn demo_programs_compile_with_and_without_optimization() {
    let demos = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
    let mut seen = 0;
    for entry in std::fs::read_dir(&demos).expect("demos directory") {
        let path = entry.unwrap().path();
        if path.extension().is_none_or(|e| e != "bx") {
            continue;
        }
        let source = std::fs::read_to_string(&path).unwrap();
        for optimize in [false, true] {
            let text = bxc::compile_to_asm(&source, optimize)
                .unwrap_or_else(|e| panic!("{} failed: {}", path.display(), e));
            assert!(text.contains("main:"), "{} has no main", path.display());
        }
        seen += 1;
    }
    assert!(seen >= 6, "expected the demo programs to be present");
}

#[test]
fn global_and_nested_scenarios_assemble() {
    // a broad program exercising globals, loops, closures, higher-order
    // params, and both print forms; it only needs to make it through the
    // whole pipeline including optimization
    let source = "
        var base = 100 : int;
        var verbose = false : bool;

        def scale(n : int) : int { return n * base; }

        def main() {
            var total = 0 : int;
            var i = 0 : int;
            def bump(step : int) : int { return total + step; }
            def twice(f : function(int) -> int, v : int) : int { return f(f(v)); }
            while (i < 3) {
                total = twice(bump, i);
                i = i + 1;
            }
            if (verbose) { print(base); }
            print(scale(total));
            print(total == 4);
        }
    ";
    let text = bxc::compile_to_asm(source, true).unwrap();
    assert!(text.contains("base(%rip)"));
    assert!(text.contains("__bx_print_bool"));
}
