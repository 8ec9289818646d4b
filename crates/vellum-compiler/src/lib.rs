//! vellum-compiler — the scanner and single-pass Pratt compiler that turn
//! source text into a top-level [`vellum_core::Obj::Function`].
//!
//! ## Modules
//! - `scanner`     : hand-coded lexer (§4.F).
//! - `compiler`    : Pratt-table expression parsing plus statement/
//!   declaration compilation, locals, upvalues, and class context (§4.G).
//! - `diagnostics` : accumulated `CompileError`s (§7).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod compiler;
pub mod diagnostics;
pub mod scanner;

pub use compiler::compile;
pub use diagnostics::{AtToken, CompileError};
pub use scanner::{Scanner, Token, TokenKind};

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use vellum_core::{disasm, Heap};

    use super::*;

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let mut heap = Heap::new();
        let func = compile("1 + 2 * 3;", &mut heap).expect("should compile");
        let chunk = match heap.get(func) {
            vellum_core::Obj::Function { chunk, .. } => chunk,
            _ => panic!("expected Function"),
        };
        let dump = disasm::disassemble_chunk(chunk, &heap, "test");
        assert!(dump.contains("CONSTANT"));
        assert!(dump.contains("MULTIPLY"));
        assert!(dump.contains("ADD"));
        assert!(dump.contains("POP"));
    }

    #[test]
    fn reports_unterminated_block_as_error() {
        let mut heap = Heap::new();
        let errs = compile("{ var x = 1;", &mut heap).unwrap_err();
        assert!(!errs.is_empty());
        assert!(errs[0].message.contains('}'));
    }

    #[test]
    fn reports_use_of_undeclared_assignment_target() {
        let mut heap = Heap::new();
        let errs = compile("1 + 2 = 3;", &mut heap).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("Invalid assignment target")));
    }

    #[test]
    fn compiles_function_declaration_with_closure_opcode() {
        let mut heap = Heap::new();
        let func = compile("fun add(a, b) { return a + b; }", &mut heap).expect("should compile");
        let chunk = match heap.get(func) {
            vellum_core::Obj::Function { chunk, .. } => chunk,
            _ => panic!("expected Function"),
        };
        let dump = disasm::disassemble_chunk(chunk, &heap, "test");
        assert!(dump.contains("CLOSURE"));
        assert!(dump.contains("DEFINE_GLOBAL"));
    }

    #[test]
    fn reports_return_from_top_level_as_error() {
        let mut heap = Heap::new();
        let errs = compile("return 1;", &mut heap).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("top-level")));
    }

    #[test]
    fn reports_this_outside_class_as_error() {
        let mut heap = Heap::new();
        let errs = compile("print this;", &mut heap).unwrap_err();
        assert!(errs.iter().any(|e| e.message.contains("'this'")));
    }
}
