use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::ast::{Expr, Function, Prototype};
use super::error::{ErrorKind, Result};
use super::lexer::Lexer;
use super::token::Token;

/// Counter for naming anonymous top-level functions; process-wide so a
/// session never hands the JIT two functions with the same name.
static ANON_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Binary operator precedences. Shared between parsing (lookup) and code
/// generation, which registers user-defined operators once their defining
/// function has been successfully lowered.
#[derive(Debug, Clone)]
pub(crate) struct OperatorTable(HashMap<char, i32>);

impl Default for OperatorTable {
    fn default() -> Self {
        // 1 is lowest precedence.
        OperatorTable(
            [('=', 2), ('<', 10), ('+', 20), ('-', 20), ('*', 40)]
                .into_iter()
                .collect(),
        )
    }
}

impl OperatorTable {
    pub(crate) fn precedence(&self, op: char) -> Option<i32> {
        self.0.get(&op).copied()
    }

    pub(crate) fn set(&mut self, op: char, precedence: i32) {
        self.0.insert(op, precedence);
    }

    /// Reinstall a saved binding, or remove the operator if there was none.
    /// Used to roll back a registration when the defining function fails.
    pub(crate) fn restore(&mut self, op: char, old: Option<i32>) {
        match old {
            Some(prec) => self.0.insert(op, prec),
            None => self.0.remove(&op),
        };
    }
}

/// Recursive-descent parser with one token of lookahead in `cur_tok`.
/// Every parse routine expects `cur_tok` to be the first token of its
/// production and leaves it on the first token after the production on
/// success; on error the cursor position is unspecified and the caller
/// resynchronizes (the driver skips one token).
pub(crate) struct Parser<I: Iterator<Item = char>> {
    lexer: Lexer<I>,
    cur_tok: Token,
    ops: OperatorTable,
}

fn parse_error<T>(msg: &str) -> Result<T> {
    Err(ErrorKind::Parse(msg.to_owned()).into())
}

impl<I: Iterator<Item = char>> Parser<I> {
    pub(crate) fn new(lexer: Lexer<I>, ops: OperatorTable) -> Self {
        let mut parser = Parser {
            lexer,
            cur_tok: Token::Eof,
            ops,
        };
        parser.next_token();
        parser
    }

    pub(crate) fn current(&self) -> &Token {
        &self.cur_tok
    }

    pub(crate) fn next_token(&mut self) -> &Token {
        self.cur_tok = self.lexer.next_token();
        &self.cur_tok
    }

    pub(crate) fn ops_mut(&mut self) -> &mut OperatorTable {
        &mut self.ops
    }

    pub(crate) fn into_ops(self) -> OperatorTable {
        self.ops
    }

    /// Precedence of the pending binary operator, or -1 if the current
    /// token is not a known ASCII operator character.
    fn tok_precedence(&self) -> i32 {
        match self.cur_tok {
            Token::Kwd(c) if c.is_ascii() => self.ops.precedence(c).unwrap_or(-1),
            _ => -1,
        }
    }

    /// numberexpr ::= number
    fn parse_number_expr(&mut self) -> Result<Expr> {
        match self.cur_tok {
            Token::Number(n) => {
                self.next_token();
                Ok(Expr::Number(n))
            }
            _ => parse_error("expected number"),
        }
    }

    /// parenexpr ::= '(' expression ')'
    fn parse_paren_expr(&mut self) -> Result<Expr> {
        self.next_token(); // eat (.
        let expr = self.parse_expression()?;
        if self.cur_tok != Token::Kwd(')') {
            return parse_error("expected ')'");
        }
        self.next_token(); // eat ).
        Ok(expr)
    }

    /// identifierexpr
    ///   ::= identifier
    ///   ::= identifier '(' expression* ')'
    fn parse_identifier_expr(&mut self) -> Result<Expr> {
        let id_name = match &self.cur_tok {
            Token::Ident(id) => id.clone(),
            _ => return parse_error("expected identifier"),
        };

        self.next_token(); // eat identifier.

        if self.cur_tok != Token::Kwd('(') {
            // Simple variable ref, not a function call.
            return Ok(Expr::Variable(id_name));
        }

        // Call.
        self.next_token(); // eat (.
        let mut args = Vec::new();
        if self.cur_tok != Token::Kwd(')') {
            loop {
                args.push(self.parse_expression()?);

                if self.cur_tok == Token::Kwd(')') {
                    break;
                }
                if self.cur_tok != Token::Kwd(',') {
                    return parse_error("expected ')' or ',' in argument list");
                }
                self.next_token();
            }
        }
        self.next_token(); // eat ).

        Ok(Expr::Call(id_name, args))
    }

    /// ifexpr ::= 'if' expression 'then' expression 'else' expression
    fn parse_if_expr(&mut self) -> Result<Expr> {
        self.next_token(); // eat the if.

        let cond = self.parse_expression()?;

        if self.cur_tok != Token::Then {
            return parse_error("expected then");
        }
        self.next_token(); // eat the then.

        let then = self.parse_expression()?;

        if self.cur_tok != Token::Else {
            return parse_error("expected else");
        }
        self.next_token(); // eat the else.

        let else_ = self.parse_expression()?;

        Ok(Expr::If(Box::new(cond), Box::new(then), Box::new(else_)))
    }

    /// forexpr ::= 'for' identifier '=' expr ',' expr (',' expr)? 'in' expression
    fn parse_for_expr(&mut self) -> Result<Expr> {
        self.next_token(); // eat the for.

        let var_name = match &self.cur_tok {
            Token::Ident(id) => id.clone(),
            _ => return parse_error("expected identifier after for"),
        };
        self.next_token(); // eat identifier.

        if self.cur_tok != Token::Kwd('=') {
            return parse_error("expected '=' after for");
        }
        self.next_token(); // eat '='.

        let start = self.parse_expression()?;

        if self.cur_tok != Token::Kwd(',') {
            return parse_error("expected ',' after for start value");
        }
        self.next_token();

        let end = self.parse_expression()?;

        // The step value is optional.
        let step = if self.cur_tok == Token::Kwd(',') {
            self.next_token();
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };

        if self.cur_tok != Token::In {
            return parse_error("expected 'in' after for");
        }
        self.next_token();

        let body = self.parse_expression()?;

        Ok(Expr::For {
            var_name,
            start: Box::new(start),
            end: Box::new(end),
            step,
            body: Box::new(body),
        })
    }

    /// varexpr ::= 'var' identifier ('=' expression)?
    ///                   (',' identifier ('=' expression)?)* 'in' expression
    fn parse_var_expr(&mut self) -> Result<Expr> {
        self.next_token(); // eat the var.

        // At least one variable name is required.
        if !matches!(self.cur_tok, Token::Ident(_)) {
            return parse_error("expected identifier after var");
        }

        let mut bindings = Vec::new();
        loop {
            let name = match &self.cur_tok {
                Token::Ident(id) => id.clone(),
                _ => return parse_error("expected identifier list after var"),
            };
            self.next_token(); // eat identifier.

            // Read the optional initializer.
            let init = if self.cur_tok == Token::Kwd('=') {
                self.next_token(); // eat the '='.
                Some(self.parse_expression()?)
            } else {
                None
            };

            bindings.push((name, init));

            if self.cur_tok != Token::Kwd(',') {
                break;
            }
            self.next_token(); // eat the ','.
        }

        if self.cur_tok != Token::In {
            return parse_error("expected 'in' keyword after 'var'");
        }
        self.next_token(); // eat 'in'.

        let body = self.parse_expression()?;

        Ok(Expr::Var {
            bindings,
            body: Box::new(body),
        })
    }

    /// primary
    ///   ::= identifierexpr
    ///   ::= numberexpr
    ///   ::= parenexpr
    ///   ::= ifexpr
    ///   ::= forexpr
    ///   ::= varexpr
    fn parse_primary(&mut self) -> Result<Expr> {
        match self.cur_tok {
            Token::Ident(_) => self.parse_identifier_expr(),
            Token::Number(_) => self.parse_number_expr(),
            Token::Kwd('(') => self.parse_paren_expr(),
            Token::If => self.parse_if_expr(),
            Token::For => self.parse_for_expr(),
            Token::Var => self.parse_var_expr(),
            _ => parse_error("unknown token when expecting an expression"),
        }
    }

    /// unary
    ///   ::= primary
    ///   ::= '!' unary
    ///
    /// Any single-character token other than '(' or ',' is taken as a
    /// prefix operator; whether an operator function exists is checked at
    /// codegen time, not here.
    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.cur_tok {
            Token::Kwd(c) if c.is_ascii() && c != '(' && c != ',' => c,
            _ => return self.parse_primary(),
        };

        self.next_token();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    /// binoprhs ::= (op unary)*
    ///
    /// Precedence climbing: operators below `expr_prec` end the loop; a
    /// following operator that binds tighter takes the just-parsed operand
    /// as its own left side first. '=' additionally chains to the right so
    /// "a = b = c" nests as "a = (b = c)".
    fn parse_bin_op_rhs(&mut self, expr_prec: i32, mut lhs: Expr) -> Result<Expr> {
        loop {
            let tok_prec = self.tok_precedence();

            // If this binop does not bind at least as tightly as the
            // current one, we are done.
            if tok_prec < expr_prec {
                return Ok(lhs);
            }

            let bin_op = match self.cur_tok {
                Token::Kwd(c) => c,
                _ => return Ok(lhs),
            };
            self.next_token(); // eat binop.

            let mut rhs = self.parse_unary()?;

            // If the operator after the RHS binds tighter, let it take the
            // RHS as its LHS.
            let next_prec = self.tok_precedence();
            let min_prec = if bin_op == '=' { tok_prec } else { tok_prec + 1 };
            if next_prec >= min_prec {
                rhs = self.parse_bin_op_rhs(min_prec, rhs)?;
            }

            lhs = Expr::Binary(bin_op, Box::new(lhs), Box::new(rhs));
        }
    }

    /// expression ::= unary binoprhs
    pub(crate) fn parse_expression(&mut self) -> Result<Expr> {
        let lhs = self.parse_unary()?;
        self.parse_bin_op_rhs(0, lhs)
    }

    /// prototype
    ///   ::= id '(' id* ')'
    ///   ::= 'binary' LETTER number? '(' id id ')'
    ///   ::= 'unary' LETTER '(' id ')'
    fn parse_prototype(&mut self) -> Result<Prototype> {
        let fn_name;
        let kind; // 0 = plain function, 1 = unary, 2 = binary.
        let mut binary_precedence = 30;

        match &self.cur_tok {
            Token::Ident(id) => {
                fn_name = id.clone();
                kind = 0;
                self.next_token();
            }
            Token::Binary => {
                self.next_token();
                let op = match self.cur_tok {
                    Token::Kwd(c) if c.is_ascii() => c,
                    _ => return parse_error("expected binary operator"),
                };
                fn_name = format!("binary{}", op);
                kind = 2;
                self.next_token();

                // Read the precedence if present.
                if let Token::Number(n) = self.cur_tok {
                    if !(1.0..=100.0).contains(&n) {
                        return parse_error("invalid precedence: must be 1..100");
                    }
                    binary_precedence = n as i32;
                    self.next_token();
                }
            }
            Token::Unary => {
                self.next_token();
                let op = match self.cur_tok {
                    Token::Kwd(c) if c.is_ascii() => c,
                    _ => return parse_error("expected unary operator"),
                };
                fn_name = format!("unary{}", op);
                kind = 1;
                self.next_token();
            }
            _ => return parse_error("expected function name in prototype"),
        }

        if self.cur_tok != Token::Kwd('(') {
            return parse_error("expected '(' in prototype");
        }

        // Read the list of argument names.
        let mut arg_names = Vec::new();
        while let Token::Ident(id) = self.next_token() {
            arg_names.push(id.clone());
        }
        if self.cur_tok != Token::Kwd(')') {
            return parse_error("expected ')' in prototype");
        }
        self.next_token(); // eat ')'.

        // Verify right number of names for operator.
        if kind != 0 && arg_names.len() != kind {
            return parse_error("invalid number of operands for operator");
        }

        Ok(Prototype::new(fn_name, arg_names, kind != 0, binary_precedence))
    }

    /// definition ::= 'def' prototype expression
    pub(crate) fn parse_definition(&mut self) -> Result<Function> {
        self.next_token(); // eat def.
        let proto = self.parse_prototype()?;
        let body = self.parse_expression()?;
        Ok(Function::new(proto, body))
    }

    /// external ::= 'extern' prototype
    pub(crate) fn parse_extern(&mut self) -> Result<Prototype> {
        self.next_token(); // eat extern.
        self.parse_prototype()
    }

    /// toplevelexpr ::= expression
    ///
    /// Wrapped in an anonymous nullary function so the driver can generate
    /// and invoke it like any other function.
    pub(crate) fn parse_top_level_expr(&mut self) -> Result<Function> {
        let body = self.parse_expression()?;
        let name = format!("__anon_func{}", ANON_COUNTER.fetch_add(1, Ordering::Relaxed));
        let proto = Prototype::new(name, Vec::new(), false, 0);
        Ok(Function::new(proto, body))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parser(input: &str) -> Parser<std::str::Chars<'_>> {
        Parser::new(Lexer::new(input.chars()), OperatorTable::default())
    }

    fn parse_expr(input: &str) -> Result<Expr> {
        parser(input).parse_expression()
    }

    fn binary(op: char, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    fn var(name: &str) -> Expr {
        Expr::Variable(name.to_owned())
    }

    #[test]
    fn test_precedence_climbing() {
        assert_eq!(
            parse_expr("a+b*c").unwrap(),
            binary('+', var("a"), binary('*', var("b"), var("c")))
        );
        assert_eq!(
            parse_expr("a*b+c").unwrap(),
            binary('+', binary('*', var("a"), var("b")), var("c"))
        );
        assert_eq!(
            parse_expr("a < b + c").unwrap(),
            binary('<', var("a"), binary('+', var("b"), var("c")))
        );
    }

    #[test]
    fn test_paren_grouping() {
        assert_eq!(
            parse_expr("(a+b)*c").unwrap(),
            binary('*', binary('+', var("a"), var("b")), var("c"))
        );
    }

    #[test]
    fn test_assignment_chains_right() {
        assert_eq!(
            parse_expr("a = b = c").unwrap(),
            binary('=', var("a"), binary('=', var("b"), var("c")))
        );
    }

    #[test]
    fn test_call() {
        assert_eq!(
            parse_expr("foo(y, 4.0)").unwrap(),
            Expr::Call("foo".to_owned(), vec![var("y"), Expr::Number(4.0)])
        );
        assert_eq!(parse_expr("foo()").unwrap(), Expr::Call("foo".to_owned(), vec![]));
    }

    #[test]
    fn test_unary() {
        assert_eq!(
            parse_expr("!x").unwrap(),
            Expr::Unary('!', Box::new(var("x")))
        );
        assert_eq!(
            parse_expr("!!x").unwrap(),
            Expr::Unary('!', Box::new(Expr::Unary('!', Box::new(var("x")))))
        );
        // A unary operand binds tighter than any binary operator.
        assert_eq!(
            parse_expr("-a + b").unwrap(),
            binary('+', Expr::Unary('-', Box::new(var("a"))), var("b"))
        );
    }

    #[test]
    fn test_if_expr() {
        assert_eq!(
            parse_expr("if x then 1 else 2").unwrap(),
            Expr::If(
                Box::new(var("x")),
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Number(2.0))
            )
        );
        assert!(parse_expr("if x then 1").is_err());
    }

    #[test]
    fn test_for_expr() {
        assert_eq!(
            parse_expr("for i = 1, 3 in 3").unwrap(),
            Expr::For {
                var_name: "i".to_owned(),
                start: Box::new(Expr::Number(1.0)),
                end: Box::new(Expr::Number(3.0)),
                step: None,
                body: Box::new(Expr::Number(3.0)),
            }
        );
        assert_eq!(
            parse_expr("for i = 1, 3, 2 in 3").unwrap(),
            Expr::For {
                var_name: "i".to_owned(),
                start: Box::new(Expr::Number(1.0)),
                end: Box::new(Expr::Number(3.0)),
                step: Some(Box::new(Expr::Number(2.0))),
                body: Box::new(Expr::Number(3.0)),
            }
        );
    }

    #[test]
    fn test_var_expr() {
        assert_eq!(
            parse_expr("var a = 1, b in a + b").unwrap(),
            Expr::Var {
                bindings: vec![
                    ("a".to_owned(), Some(Expr::Number(1.0))),
                    ("b".to_owned(), None),
                ],
                body: Box::new(binary('+', var("a"), var("b"))),
            }
        );
        assert!(parse_expr("var in 1").is_err());
    }

    #[test]
    fn test_definition() {
        let f = parser("def foo(a b) a + b").parse_definition().unwrap();
        assert_eq!(f.proto.name, "foo");
        assert_eq!(f.proto.args, vec!["a".to_owned(), "b".to_owned()]);
        assert!(!f.proto.is_binary_op());
        assert_eq!(f.body, binary('+', var("a"), var("b")));
    }

    #[test]
    fn test_operator_prototypes() {
        let f = parser("def binary| 5 (a b) a + b").parse_definition().unwrap();
        assert_eq!(f.proto.name, "binary|");
        assert!(f.proto.is_binary_op());
        assert_eq!(f.proto.operator_name(), '|');
        assert_eq!(f.proto.binary_precedence(), 5);

        // Default precedence when the literal is omitted.
        let f = parser("def binary& (a b) a * b").parse_definition().unwrap();
        assert_eq!(f.proto.binary_precedence(), 30);

        let f = parser("def unary!(v) 0 - v").parse_definition().unwrap();
        assert!(f.proto.is_unary_op());
        assert_eq!(f.proto.operator_name(), '!');
    }

    #[test]
    fn test_operator_arity_errors() {
        assert!(parser("def binary& (a) a").parse_definition().is_err());
        assert!(parser("def unary& (a b) a").parse_definition().is_err());
    }

    #[test]
    fn test_precedence_range_error() {
        assert!(parser("def binary& 200 (a b) a").parse_definition().is_err());
        assert!(parser("def binary& 0 (a b) a").parse_definition().is_err());
    }

    #[test]
    fn test_unknown_operator_is_parse_time_legal() {
        // '@' has no precedence entry, so it is not consumed as a binop;
        // the expression simply ends at 'a'.
        assert_eq!(parse_expr("a").unwrap(), var("a"));
        // As a prefix it is accepted; codegen decides whether 'unary@' exists.
        assert_eq!(
            parse_expr("@a").unwrap(),
            Expr::Unary('@', Box::new(var("a")))
        );
    }

    #[test]
    fn test_unterminated_paren() {
        assert!(parse_expr("(4").is_err());
    }

    #[test]
    fn test_top_level_expr_wrapping() {
        let f = parser("4+5").parse_top_level_expr().unwrap();
        assert!(f.proto.name.starts_with("__anon_func"));
        assert!(f.proto.args.is_empty());
        assert_eq!(f.body, binary('+', Expr::Number(4.0), Expr::Number(5.0)));
    }

    #[test]
    fn test_user_defined_precedence_lookup() {
        let mut p = parser("a | b * c");
        p.ops_mut().set('|', 5);
        assert_eq!(
            p.parse_expression().unwrap(),
            binary('|', var("a"), binary('*', var("b"), var("c")))
        );
    }
}
