use super::token::Token;

/// Pull lexer over a character stream. Exactly one unconsumed character is
/// buffered in `last_char`; `None` means the underlying stream is exhausted.
pub(crate) struct Lexer<I: Iterator<Item = char>> {
    chars: I,
    last_char: Option<char>,
}

impl<I: Iterator<Item = char>> Lexer<I> {
    pub(crate) fn new(chars: I) -> Self {
        // Prime the lookahead with a blank so the first call reads normally.
        Lexer {
            chars,
            last_char: Some(' '),
        }
    }

    fn read(&mut self) -> Option<char> {
        self.chars.next()
    }

    /// Return the next token. Once the input is exhausted this keeps
    /// returning `Token::Eof`; it never reads past end-of-input.
    pub(crate) fn next_token(&mut self) -> Token {
        // Skip any whitespace.
        while matches!(self.last_char, Some(c) if c.is_ascii_whitespace()) {
            self.last_char = self.read();
        }

        let c = match self.last_char {
            Some(c) => c,
            None => return Token::Eof,
        };

        // identifier: [a-zA-Z][a-zA-Z0-9]*
        if c.is_ascii_alphabetic() {
            let mut ident = String::new();
            ident.push(c);
            loop {
                self.last_char = self.read();
                match self.last_char {
                    Some(c) if c.is_ascii_alphanumeric() => ident.push(c),
                    _ => break,
                }
            }

            return match ident.as_str() {
                "def" => Token::Def,
                "extern" => Token::Extern,
                "if" => Token::If,
                "then" => Token::Then,
                "else" => Token::Else,
                "for" => Token::For,
                "in" => Token::In,
                "var" => Token::Var,
                "binary" => Token::Binary,
                "unary" => Token::Unary,
                _ => Token::Ident(ident),
            };
        }

        // number: [0-9.]+
        if c.is_ascii_digit() || c == '.' {
            let mut num = String::new();
            num.push(c);
            loop {
                self.last_char = self.read();
                match self.last_char {
                    Some(c) if c.is_ascii_digit() || c == '.' => num.push(c),
                    _ => break,
                }
            }
            return Token::Number(parse_number(&num));
        }

        // Comment until end of line, then scan again.
        if c == '#' {
            loop {
                self.last_char = self.read();
                match self.last_char {
                    None | Some('\n') | Some('\r') => break,
                    Some(_) => {}
                }
            }
            return self.next_token();
        }

        // Otherwise surface the character itself.
        self.last_char = self.read();
        Token::Kwd(c)
    }
}

/// Convert a scanned `[0-9.]+` lexeme. The scan permits multiple dots, so a
/// lexeme like "1.2.3" is converted from its longest parseable prefix
/// (strtod-style) rather than rejected.
fn parse_number(s: &str) -> f64 {
    if let Ok(n) = s.parse() {
        return n;
    }
    let mut end = s.len();
    while end > 0 {
        if let Ok(n) = s[..end].parse() {
            return n;
        }
        end -= 1;
    }
    0.0
}

#[cfg(test)]
mod test {
    use super::super::token::Token::*;
    use super::*;

    fn lex_all(s: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(s.chars());
        let mut tokens = Vec::new();
        loop {
            match lexer.next_token() {
                Eof => break,
                t => tokens.push(t),
            }
        }
        tokens
    }

    #[test]
    fn test_number() {
        assert_eq!(lex_all("1.0"), vec![Number(1.0)]);
        assert_eq!(lex_all(".5"), vec![Number(0.5)]);
    }

    #[test]
    fn test_lenient_number() {
        // Known looseness: multiple dots convert from the longest valid prefix.
        assert_eq!(lex_all("1.2.3"), vec![Number(1.2)]);
    }

    #[test]
    fn test_ident_and_keywords() {
        assert_eq!(lex_all("test"), vec![Ident("test".to_owned())]);
        assert_eq!(lex_all("def"), vec![Def]);
        assert_eq!(
            lex_all("var binary unary"),
            vec![Var, Binary, Unary]
        );
        // Keywords are case-sensitive.
        assert_eq!(lex_all("Def"), vec![Ident("Def".to_owned())]);
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            lex_all("a+b"),
            vec![Ident("a".to_owned()), Kwd('+'), Ident("b".to_owned())]
        );
        assert_eq!(lex_all("(|)"), vec![Kwd('('), Kwd('|'), Kwd(')')]);
    }

    #[test]
    fn test_comment() {
        assert_eq!(lex_all("# comment"), vec![]);
        assert_eq!(
            lex_all("1.0 # comment\n2.0"),
            vec![Number(1.0), Number(2.0)]
        );
    }

    #[test]
    fn test_eof_is_sticky() {
        let mut lexer = Lexer::new("x".chars());
        assert_eq!(lexer.next_token(), Ident("x".to_owned()));
        assert_eq!(lexer.next_token(), Eof);
        assert_eq!(lexer.next_token(), Eof);
    }
}
