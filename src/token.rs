/// The lexer emits a keyword token for known words, `Ident`/`Number` for
/// identifiers and numeric literals, and `Kwd` for any other single
/// character (operators, punctuation, user-defined operator symbols).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Def,
    Extern,
    If,
    Then,
    Else,
    For,
    In,
    Var,
    Binary,
    Unary,
    Ident(String),
    Number(f64),
    Kwd(char),
    Eof,
}
