/// Expression nodes. Each node owns its children exclusively; code
/// generation consumes the tree by reference and emits IR per variant.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    Variable(String),
    Unary(char, Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    For {
        var_name: String,
        start: Box<Expr>,
        end: Box<Expr>,
        step: Option<Box<Expr>>,
        body: Box<Expr>,
    },
    Var {
        bindings: Vec<(String, Option<Expr>)>,
        body: Box<Expr>,
    },
}

/// A function signature: name, parameter names, and for user-defined
/// operators the operator kind and binary precedence. Operator functions
/// are named by convention: "binary<op>" or "unary<op>".
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Prototype {
    pub(crate) name: String,
    pub(crate) args: Vec<String>,
    is_operator: bool,
    precedence: i32,
}

impl Prototype {
    pub(crate) fn new(name: String, args: Vec<String>, is_operator: bool, precedence: i32) -> Self {
        Prototype {
            name,
            args,
            is_operator,
            precedence,
        }
    }

    pub(crate) fn is_unary_op(&self) -> bool {
        self.is_operator && self.args.len() == 1
    }

    pub(crate) fn is_binary_op(&self) -> bool {
        self.is_operator && self.args.len() == 2
    }

    /// The operator character, encoded as the last character of the name.
    pub(crate) fn operator_name(&self) -> char {
        debug_assert!(self.is_unary_op() || self.is_binary_op());
        self.name.chars().last().unwrap_or('\0')
    }

    pub(crate) fn binary_precedence(&self) -> i32 {
        self.precedence
    }
}

/// A function definition: a prototype plus exactly one body expression.
/// An `extern` declaration is a bare `Prototype`, never a `Function`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    pub(crate) proto: Prototype,
    pub(crate) body: Expr,
}

impl Function {
    pub(crate) fn new(proto: Prototype, body: Expr) -> Self {
        Function { proto, body }
    }
}
