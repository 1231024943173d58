/// Kind of a scanned token.
///
/// Only the kinds the compiler has parse rules for ever reach codegen; the
/// rest (`[`, `]`) are scanned so they can be reported with a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Arithmetic
    Plus,
    PlusEqual,
    Minus,
    MinusEqual,
    Star,
    StarEqual,
    Slash,
    SlashEqual,
    Percent,
    PercentEqual,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Semicolon,
    Comma,

    // Comparison
    Gt,
    Lt,
    GtEqual,
    LtEqual,
    Equal,
    EqualEqual,
    Bang,
    BangEqual,

    // Logic
    And,
    Or,

    // Keywords
    If,
    Else,
    While,
    For,
    Return,
    Func,
    Print,
    Fork,
    Kill,
    Halt,

    // Literals
    Int,
    Float,
    Identifier,

    // Special
    Error,
    Eof,
}

impl TokenKind {
    /// Assignment operators: only legal right after an identifier in
    /// assignment position.
    pub fn is_assignment(self) -> bool {
        matches!(
            self,
            TokenKind::Equal
                | TokenKind::PlusEqual
                | TokenKind::MinusEqual
                | TokenKind::StarEqual
                | TokenKind::SlashEqual
                | TokenKind::PercentEqual
        )
    }

    /// Tokens that begin a statement, used to resynchronise after an error.
    pub fn starts_statement(self) -> bool {
        matches!(
            self,
            TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Func
                | TokenKind::Return
                | TokenKind::Print
                | TokenKind::Halt
                | TokenKind::LBrace
        )
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TokenKind::Plus => "+",
            TokenKind::PlusEqual => "+=",
            TokenKind::Minus => "-",
            TokenKind::MinusEqual => "-=",
            TokenKind::Star => "*",
            TokenKind::StarEqual => "*=",
            TokenKind::Slash => "/",
            TokenKind::SlashEqual => "/=",
            TokenKind::Percent => "%",
            TokenKind::PercentEqual => "%=",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Semicolon => ";",
            TokenKind::Comma => ",",
            TokenKind::Gt => ">",
            TokenKind::Lt => "<",
            TokenKind::GtEqual => ">=",
            TokenKind::LtEqual => "<=",
            TokenKind::Equal => "=",
            TokenKind::EqualEqual => "==",
            TokenKind::Bang => "!",
            TokenKind::BangEqual => "!=",
            TokenKind::And => "&&",
            TokenKind::Or => "||",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::For => "for",
            TokenKind::Return => "return",
            TokenKind::Func => "func",
            TokenKind::Print => "print",
            TokenKind::Fork => "fork",
            TokenKind::Kill => "kill",
            TokenKind::Halt => "halt",
            TokenKind::Int => "integer",
            TokenKind::Float => "float",
            TokenKind::Identifier => "identifier",
            TokenKind::Error => "error",
            TokenKind::Eof => "end of file",
        };
        write!(f, "{}", s)
    }
}

/// Literal payload carried by numeric tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    None,
    Int(i32),
    Float(f64),
}

/// A single scanned token.
///
/// `start`/`len` index into the scanner's character buffer, `line_start`
/// is the index of the first character of the token's line so diagnostics
/// can reprint it. `col` is 1-based.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub literal: Literal,
    pub start: usize,
    pub len: usize,
    pub line: usize,
    pub col: usize,
    pub line_start: usize,
}

impl Token {
    /// Placeholder token used before the first scan.
    pub fn empty() -> Self {
        Token {
            kind: TokenKind::Eof,
            lexeme: String::new(),
            literal: Literal::None,
            start: 0,
            len: 0,
            line: 1,
            col: 1,
            line_start: 0,
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            TokenKind::Eof => write!(f, "end of file"),
            _ => write!(f, "'{}'", self.lexeme),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_kinds() {
        assert!(TokenKind::Equal.is_assignment());
        assert!(TokenKind::PercentEqual.is_assignment());
        assert!(!TokenKind::EqualEqual.is_assignment());
        assert!(!TokenKind::Plus.is_assignment());
    }

    #[test]
    fn test_display_eof_token() {
        assert_eq!(Token::empty().to_string(), "end of file");
    }
}
