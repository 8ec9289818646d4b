//! vellum-vm — the stack-based bytecode interpreter: calling convention,
//! upvalue capture/close, class/method dispatch, and the GC trigger point
//! (§4.H, §4.I).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod error;
pub mod frame;
pub mod natives;
pub mod vm;

pub use error::VmError;
pub use frame::CallFrame;
pub use vm::{Vm, VmConfig};

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use vellum_compiler::compile;
    use vellum_core::Heap;

    use super::*;

    fn run_to_string(src: &str) -> Result<String, VmError> {
        let mut vm = Vm::new(VmConfig::default());
        let script = compile(src, vm.heap_mut()).expect("should compile");
        let mut out = Vec::new();
        vm.run(script, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn globals_and_control_flow() {
        let src = r"
            var total = 0;
            for (var i = 1; i <= 5; i = i + 1) {
                if (i != 3) {
                    total = total + i;
                }
            }
            print total;
        ";
        assert_eq!(run_to_string(src).unwrap(), "12\n");
    }

    #[test]
    fn native_clock_returns_a_number() {
        let out = run_to_string("print clock() >= 0;").unwrap();
        assert_eq!(out, "true\n");
    }

    #[test]
    fn native_sqrt_rejects_negative_input() {
        let err = run_to_string("sqrt(-1);").unwrap_err();
        assert!(err.message.contains("must not be negative"));
    }

    #[test]
    fn stack_overflow_on_unbounded_recursion_is_a_runtime_error() {
        let src = r"
            fun recurse() {
                return recurse();
            }
            recurse();
        ";
        let err = run_to_string(src).unwrap_err();
        assert!(err.message.contains("Stack overflow"), "got: {}", err.message);
    }

    #[test]
    fn calling_a_non_callable_value_is_a_runtime_error() {
        let err = run_to_string("var x = 1; x();").unwrap_err();
        assert!(err.message.contains("Can only call"));
    }

    #[test]
    fn runtime_error_reports_the_call_stack_trace() {
        let src = r"
            fun inner() {
                return 1 / nil;
            }
            fun outer() {
                return inner();
            }
            outer();
        ";
        let mut vm = Vm::new(VmConfig::default());
        let script = compile(src, vm.heap_mut()).unwrap();
        let mut out = Vec::new();
        let err = vm.run(script, &mut out).unwrap_err();
        assert!(err.trace.iter().any(|l| l.contains("inner()")));
        assert!(err.trace.iter().any(|l| l.contains("outer()")));
        assert!(err.trace.iter().any(|l| l.contains("script")));
    }

    #[test]
    fn garbage_collection_under_stress_does_not_corrupt_live_state() {
        let mut config = VmConfig::default();
        config.stress_gc = true;
        let mut vm = Vm::new(config);
        let src = r#"
            class Node {
                init(value) {
                    this.value = value;
                }
            }
            var n = Node("kept");
            print n.value;
        "#;
        let script = compile(src, vm.heap_mut()).unwrap();
        let mut out = Vec::new();
        vm.run(script, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "kept\n");
    }

    #[test]
    fn heap_mut_allows_precompiling_into_the_same_arena() {
        let mut vm = Vm::new(VmConfig::default());
        let heap: &mut Heap = vm.heap_mut();
        let _ = heap.intern("warm up the string table");
    }
}
