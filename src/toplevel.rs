use tracing::{debug, error};

use super::codegen::Codegen;
use super::error::Result;
use super::jit;
use super::lexer::Lexer;
use super::parser::{OperatorTable, Parser};
use super::token::Token;

/// Driver state surviving across input units: the code generator (module,
/// scope) and the operator precedence table.
pub(crate) struct Session {
    codegen: Codegen,
    ops: OperatorTable,
}

impl Session {
    pub(crate) fn new() -> Self {
        Session {
            codegen: Codegen::new(),
            ops: OperatorTable::default(),
        }
    }

    /// top ::= definition | external | expression | ';'
    ///
    /// Parse and evaluate every top-level unit in `input`. Returns the
    /// values of the evaluated top-level expressions, in order. A failed
    /// unit is reported and skipped by discarding exactly one token, which
    /// may cascade further errors on badly malformed input.
    pub(crate) fn run<I: Iterator<Item = char>>(&mut self, input: I) -> Vec<f64> {
        let mut parser = Parser::new(Lexer::new(input), std::mem::take(&mut self.ops));
        let mut results = Vec::new();

        loop {
            match parser.current() {
                Token::Eof => break,
                // A stray top-level semicolon is a no-op unit.
                Token::Kwd(';') => {
                    parser.next_token();
                }
                Token::Def => self.handle_definition(&mut parser),
                Token::Extern => self.handle_extern(&mut parser),
                _ => {
                    if let Some(value) = self.handle_top_level_expression(&mut parser) {
                        results.push(value);
                    }
                }
            }
        }

        self.ops = parser.into_ops();
        results
    }

    fn handle_definition<I: Iterator<Item = char>>(&mut self, parser: &mut Parser<I>) {
        match parser.parse_definition() {
            Ok(func) => match self.codegen.codegen_func(&func, parser.ops_mut()) {
                Ok(ir) => {
                    debug!("parsed a function definition:\n{}", self.codegen.function_ir(ir));
                }
                Err(err) => error!("{}", err),
            },
            Err(err) => {
                error!("{}", err);
                // Skip token for error recovery.
                parser.next_token();
            }
        }
    }

    fn handle_extern<I: Iterator<Item = char>>(&mut self, parser: &mut Parser<I>) {
        match parser.parse_extern() {
            Ok(proto) => match self.codegen.codegen_proto(&proto) {
                Ok(ir) => {
                    debug!("parsed an extern:\n{}", self.codegen.function_ir(ir));
                }
                Err(err) => error!("{}", err),
            },
            Err(err) => {
                error!("{}", err);
                parser.next_token();
            }
        }
    }

    /// Evaluate a top-level expression as an anonymous nullary function.
    fn handle_top_level_expression<I: Iterator<Item = char>>(
        &mut self,
        parser: &mut Parser<I>,
    ) -> Option<f64> {
        match parser.parse_top_level_expr() {
            Ok(func) => {
                let name = func.proto.name.clone();
                let result: Result<f64> = self
                    .codegen
                    .codegen_func(&func, parser.ops_mut())
                    .and_then(|_| jit::run_function(&self.codegen, &name));
                match result {
                    Ok(value) => Some(value),
                    Err(err) => {
                        error!("{}", err);
                        None
                    }
                }
            }
            Err(err) => {
                error!("{}", err);
                parser.next_token();
                None
            }
        }
    }
}

/// Run a whole source text, printing each top-level result.
pub(crate) fn main_loop<I: Iterator<Item = char>>(input: I) {
    let mut session = Session::new();
    for value in session.run(input) {
        println!("Evaluated to {}", value);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn eval(input: &str) -> Vec<f64> {
        Session::new().run(input.chars())
    }

    #[test]
    fn test_simple_expression() {
        assert_eq!(eval("4+5;"), vec![9.0]);
    }

    #[test]
    fn test_identity_round_trip() {
        assert_eq!(eval("def foo(a) a; foo(42);"), vec![42.0]);
    }

    #[test]
    fn test_polynomial() {
        assert_eq!(
            eval("def foo(a b) a*a + 2*a*b + b*b; foo(1,2);"),
            vec![9.0]
        );
    }

    #[test]
    fn test_if_then_else() {
        assert_eq!(
            eval("def pick(x) if x < 3 then 1 else 2; pick(1); pick(5);"),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn test_nested_control_flow_in_then_branch() {
        // The then-branch itself contains an if, so its terminating block
        // differs from the block first created for it.
        assert_eq!(
            eval("def f(x) if x then (if x < 2 then 10 else 20) else 30; f(1); f(3); f(0);"),
            vec![10.0, 20.0, 30.0]
        );
    }

    #[test]
    fn test_for_loop_counts() {
        // The end condition is evaluated after the loop variable is
        // stepped, so it sees the incremented counter: starting at 1 with
        // bound i < 10 runs the body nine times.
        assert_eq!(
            eval("def count(n) var c = 0 in (for i = 1, i < n in c = c + 1) + c; count(10);"),
            vec![9.0]
        );
    }

    #[test]
    fn test_for_body_runs_at_least_once() {
        // The condition is first checked after the body: a loop that starts
        // beyond its bound still runs once.
        assert_eq!(
            eval("def once() var c = 0 in (for i = 5, i < 3 in c = c + 1) + c; once();"),
            vec![1.0]
        );
    }

    #[test]
    fn test_for_returns_zero() {
        assert_eq!(eval("for i = 1, i < 3 in 42;"), vec![0.0]);
    }

    #[test]
    fn test_mutable_variables() {
        assert_eq!(
            eval("def f(x) var a = 1, b = 2 in (a = a + x) * b; f(3);"),
            vec![8.0]
        );
    }

    #[test]
    fn test_var_shadowing_resolves_outward() {
        assert_eq!(eval("var a = 1 in var a = a in a;"), vec![1.0]);
    }

    #[test]
    fn test_chained_assignment() {
        assert_eq!(
            eval("def f() var a, b in (a = b = 7) + a + b; f();"),
            vec![21.0]
        );
    }

    #[test]
    fn test_user_defined_binary_operator() {
        // Sequencing operator: evaluate both, yield the right operand.
        assert_eq!(
            eval("def binary : 1 (x y) y; def f() 1 : 2 : 3; f();"),
            vec![3.0]
        );
    }

    #[test]
    fn test_user_defined_unary_operator() {
        assert_eq!(
            eval("def unary!(v) if v then 0 else 1; !0; !17;"),
            vec![1.0, 0.0]
        );
    }

    #[test]
    fn test_binary_operator_precedence_applies_after_definition() {
        // '|' at precedence 5 binds looser than '<'.
        assert_eq!(
            eval(
                "def binary| 5 (a b) if a then 1 else if b then 1 else 0; \
                 def f(x) x < 2 | x < 1; f(0); f(5);"
            ),
            vec![1.0, 0.0]
        );
    }

    #[test]
    fn test_forward_reference_to_undefined_operator() {
        // '&' has no precedence entry, so the definition's body ends at
        // 'a' and the leftover '& b' becomes a separate unit that fails in
        // codegen (no 'unary&'); later units still run.
        assert_eq!(eval("def f(a b) a & b; 4+5;"), vec![9.0]);
    }

    #[test]
    fn test_extern_and_runtime_call() {
        // putchard(42) prints '*' and returns 0.
        assert_eq!(
            eval("extern putchard(x); putchard(42) + 1;"),
            vec![1.0]
        );
    }

    #[test]
    fn test_extern_then_mismatched_definition_does_not_crash() {
        // Arity mismatch against an earlier declaration is a clean error;
        // the session keeps going.
        assert_eq!(
            eval("extern foo(a b); def foo(x) x; 4+5;"),
            vec![9.0]
        );
    }

    #[test]
    fn test_parse_error_recovery() {
        // "(4" fails to parse; the driver discards a token and carries on
        // with the next unit.
        assert_eq!(eval("(4; 4+5;"), vec![9.0]);
    }

    #[test]
    fn test_sessions_are_independent() {
        // A second session must not see the first one's operators.
        let mut first = Session::new();
        assert_eq!(
            first.run("def binary : 1 (x y) y; 1 : 2;".chars()),
            vec![2.0]
        );
        // Without the ':' precedence the expression ends at '1'; the
        // leftover ': 2' fails as an unknown unary operator.
        let mut second = Session::new();
        assert_eq!(second.run("1 : 2;".chars()), vec![1.0]);
    }

    #[test]
    fn test_state_survives_across_run_calls() {
        let mut session = Session::new();
        session.run("def double(x) x * 2;".chars());
        assert_eq!(session.run("double(21);".chars()), vec![42.0]);
    }
}
