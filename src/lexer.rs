use crate::token::{Literal, Token, TokenKind};

/// Pull-based scanner for Cobra source.
///
/// Each call to [`Lexer::scan_token`] yields the next token. Unrecognised
/// input produces a `TokenKind::Error` token whose `lexeme` is the message and
/// whose span covers the offending text; it also sets a sticky error flag so
/// the compiler can abandon codegen once parsing completes.
pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    line_start: usize,
    had_error: bool,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            line_start: 0,
            had_error: false,
        }
    }

    pub fn had_error(&self) -> bool {
        self.had_error
    }

    /// Text of the source line starting at `line_start`, without the newline.
    pub fn line_text(&self, line_start: usize) -> String {
        self.source
            .iter()
            .skip(line_start)
            .take_while(|&&c| c != '\n')
            .collect()
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
            self.line_start = self.pos + 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.current() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(ch) = self.current() {
            match ch {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '/' if self.peek() == Some('/') => {
                    while let Some(c) = self.current() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn make_token(
        &self,
        kind: TokenKind,
        start: usize,
        line: usize,
        col: usize,
        line_start: usize,
    ) -> Token {
        Token {
            kind,
            lexeme: self.source[start..self.pos].iter().collect(),
            literal: Literal::None,
            start,
            len: self.pos - start,
            line,
            col,
            line_start,
        }
    }

    fn error_token(
        &mut self,
        message: String,
        start: usize,
        line: usize,
        col: usize,
        line_start: usize,
    ) -> Token {
        self.had_error = true;
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            literal: Literal::None,
            start,
            len: (self.pos - start).max(1),
            line,
            col,
            line_start,
        }
    }

    fn read_identifier(&mut self, start: usize) -> TokenKind {
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let word: String = self.source[start..self.pos].iter().collect();

        match word.as_str() {
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "for" => TokenKind::For,
            "return" => TokenKind::Return,
            "func" => TokenKind::Func,
            "print" => TokenKind::Print,
            "fork" => TokenKind::Fork,
            "kill" => TokenKind::Kill,
            "halt" => TokenKind::Halt,
            _ => TokenKind::Identifier,
        }
    }

    fn read_number(&mut self, start: usize) -> Result<(TokenKind, Literal), String> {
        while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }

        // Only treat '.' as a decimal point if followed by a digit
        let is_float = self.current() == Some('.')
            && self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false);

        if is_float {
            self.advance();
            while matches!(self.current(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }

        let digits: String = self.source[start..self.pos].iter().collect();

        if is_float {
            let value: f64 = digits
                .parse()
                .map_err(|_| format!("invalid float literal: {}", digits))?;
            Ok((TokenKind::Float, Literal::Float(value)))
        } else {
            let value: i32 = digits
                .parse()
                .map_err(|_| format!("integer literal out of range: {}", digits))?;
            Ok((TokenKind::Int, Literal::Int(value)))
        }
    }

    pub fn scan_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        let start = self.pos;
        let line = self.line;
        let col = self.col;
        let line_start = self.line_start;

        let Some(ch) = self.current() else {
            return self.make_token(TokenKind::Eof, start, line, col, line_start);
        };
        self.advance();

        let kind = match ch {
            '+' if self.matches('=') => TokenKind::PlusEqual,
            '+' => TokenKind::Plus,
            '-' if self.matches('=') => TokenKind::MinusEqual,
            '-' => TokenKind::Minus,
            '*' if self.matches('=') => TokenKind::StarEqual,
            '*' => TokenKind::Star,
            '/' if self.matches('=') => TokenKind::SlashEqual,
            '/' => TokenKind::Slash,
            '%' if self.matches('=') => TokenKind::PercentEqual,
            '%' => TokenKind::Percent,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ';' => TokenKind::Semicolon,
            ',' => TokenKind::Comma,
            '>' if self.matches('=') => TokenKind::GtEqual,
            '>' => TokenKind::Gt,
            '<' if self.matches('=') => TokenKind::LtEqual,
            '<' => TokenKind::Lt,
            '=' if self.matches('=') => TokenKind::EqualEqual,
            '=' => TokenKind::Equal,
            '!' if self.matches('=') => TokenKind::BangEqual,
            '!' => TokenKind::Bang,
            '&' if self.matches('&') => TokenKind::And,
            '|' if self.matches('|') => TokenKind::Or,
            c if c.is_ascii_digit() => match self.read_number(start) {
                Ok((kind, literal)) => {
                    let mut token = self.make_token(kind, start, line, col, line_start);
                    token.literal = literal;
                    return token;
                }
                Err(message) => return self.error_token(message, start, line, col, line_start),
            },
            c if c.is_ascii_alphabetic() => self.read_identifier(start),
            c => {
                return self.error_token(
                    format!("unexpected symbol '{}'", c),
                    start,
                    line,
                    col,
                    line_start,
                );
            }
        };

        self.make_token(kind, start, line, col, line_start)
    }

    /// Scans the whole input, including the trailing `Eof` token.
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.scan_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }
}
