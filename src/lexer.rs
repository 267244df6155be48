use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Debug, PartialEq, Clone)]
pub enum Token {
    Eof,
    Def,
    Extern,
    Ident(String),
    Number(f64),
    Char(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Eof => write!(f, "end of input"),
            Token::Def => write!(f, "keyword 'def'"),
            Token::Extern => write!(f, "keyword 'extern'"),
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::Number(value) => write!(f, "number '{}'", value),
            Token::Char(c) => write!(f, "'{}'", c),
        }
    }
}

lazy_static! {
    // the longest prefix of a digit/dot run that strtod would accept
    static ref NUMBER_PREFIX_RE: Regex = Regex::new(r"^[0-9]*(\.[0-9]*)?").unwrap();
}

/// parse an accumulated run of digits and dots - anything past the first
/// valid float prefix is silently dropped, so `3.4.5` reads as `3.4`
fn parse_number(text: &str) -> f64 {
    let prefix = NUMBER_PREFIX_RE.find(text).map_or("", |m| m.as_str());
    prefix.parse().unwrap_or(0.0)
}

fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

fn is_number_char(c: &u8) -> bool {
    c.is_ascii_digit() || *c == b'.'
}

/// A one-directional cursor over a byte stream.
///
/// Holds exactly one byte of lookahead. Once the input is exhausted every
/// further call to [`Lexer::next_token`] returns [`Token::Eof`].
pub struct Lexer<I: Iterator<Item = u8>> {
    input: I,
    last_char: Option<u8>,
}

impl<I: Iterator<Item = u8>> Lexer<I> {
    pub fn new(input: I) -> Self {
        Self {
            input,
            last_char: Some(b' '),
        }
    }

    fn advance(&mut self) {
        self.last_char = self.input.next();
    }

    pub fn next_token(&mut self) -> Token {
        loop {
            while self.last_char.map_or(false, is_space) {
                self.advance();
            }

            let c = match self.last_char {
                Some(c) => c,
                None => return Token::Eof,
            };

            if c.is_ascii_alphabetic() {
                let mut ident = String::new();
                while let Some(c) = self.last_char.filter(u8::is_ascii_alphanumeric) {
                    ident.push(c as char);
                    self.advance();
                }

                return match ident.as_str() {
                    "def" => Token::Def,
                    "extern" => Token::Extern,
                    _ => Token::Ident(ident),
                };
            }

            if is_number_char(&c) {
                let mut text = String::new();
                while let Some(c) = self.last_char.filter(is_number_char) {
                    text.push(c as char);
                    self.advance();
                }
                return Token::Number(parse_number(&text));
            }

            if c == b'#' {
                while !matches!(self.last_char, None | Some(b'\n') | Some(b'\r')) {
                    self.advance();
                }
                continue;
            }

            self.advance();
            return Token::Char(c as char);
        }
    }
}

impl<I: Iterator<Item = u8>> Iterator for Lexer<I> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        match self.next_token() {
            Token::Eof => None,
            tok => Some(tok),
        }
    }
}

/// lex the given input string up to (not including) the end token
pub fn lex(input: &str) -> Vec<Token> {
    Lexer::new(input.bytes()).collect()
}
