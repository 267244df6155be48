use crate::ast::{ASTNode, Expression, Function, Prototype};
use crate::lexer::{Lexer, Token};
use crate::session::Session;

/// Deepest expression tree (and deepest parenthesis/argument nesting) the
/// parser accepts. Everything downstream walks expressions recursively.
pub const MAX_EXPRESSION_DEPTH: usize = 256;

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum ParserError {
    #[error("unknown token when expecting an expression, found {0}")]
    UnexpectedToken(Token),
    #[error("expected ')', found {0}")]
    ExpectedCloseParen(Token),
    #[error("expected ')' or ',' in argument list, found {0}")]
    ExpectedArgumentSeparator(Token),
    #[error("expected function name in prototype, found {0}")]
    ExpectedFunctionName(Token),
    #[error("expected '(' in prototype, found {0}")]
    ExpectedPrototypeOpenParen(Token),
    #[error("expected ')' in prototype, found {0}")]
    ExpectedPrototypeCloseParen(Token),
    #[error("expression nested deeper than {0} levels")]
    TooDeep(usize),
}

pub type PartialParseResult = Result<Expression, ParserError>;

/// an expression along with the height of its tree
type MeasuredResult = Result<(Expression, usize), ParserError>;

fn measured(expr: Expression, height: usize) -> MeasuredResult {
    if height > MAX_EXPRESSION_DEPTH {
        return Err(ParserError::TooDeep(MAX_EXPRESSION_DEPTH));
    }
    Ok((expr, height))
}

/// Recursive descent parser over a lexer, with one token of lookahead.
///
/// A new parser has not read anything yet; call [`Parser::next_token`] once
/// to prime it before parsing. Failed parses leave the current token where
/// the failure was detected.
pub struct Parser<I: Iterator<Item = u8>> {
    lexer: Lexer<I>,
    current: Token,
    nesting: usize,
}

impl<I: Iterator<Item = u8>> Parser<I> {
    pub fn new(lexer: Lexer<I>) -> Self {
        Self {
            lexer,
            current: Token::Eof,
            nesting: 0,
        }
    }

    pub fn current(&self) -> &Token {
        &self.current
    }

    pub fn next_token(&mut self) -> &Token {
        self.current = self.lexer.next_token();
        &self.current
    }

    fn is_char(&self, c: char) -> bool {
        self.current == Token::Char(c)
    }

    fn parse_number(&mut self, value: f64) -> MeasuredResult {
        self.next_token();
        Ok((Expression::Number(value), 1))
    }

    fn parse_nested(&mut self, session: &Session) -> MeasuredResult {
        self.next_token(); // eat '('
        let res = self.parse_measured(session)?;
        if !self.is_char(')') {
            return Err(ParserError::ExpectedCloseParen(self.current.clone()));
        }
        self.next_token();
        Ok(res)
    }

    fn parse_identifier(&mut self, session: &Session, ident: String) -> MeasuredResult {
        self.next_token();
        if !self.is_char('(') {
            return Ok((Expression::Variable(ident), 1));
        }

        self.next_token();
        let mut args = Vec::new();
        let mut height = 0;
        if !self.is_char(')') {
            loop {
                let (arg, arg_height) = self.parse_measured(session)?;
                args.push(arg);
                height = height.max(arg_height);

                if self.is_char(')') {
                    break;
                }
                if !self.is_char(',') {
                    return Err(ParserError::ExpectedArgumentSeparator(self.current.clone()));
                }
                self.next_token();
            }
        }
        self.next_token(); // eat ')'

        measured(Expression::Call(ident, args), height + 1)
    }

    fn parse_primary(&mut self, session: &Session) -> MeasuredResult {
        match &self.current {
            Token::Number(value) => {
                let value = *value;
                self.parse_number(value)
            }
            Token::Ident(ident) => {
                let ident = ident.clone();
                self.parse_identifier(session, ident)
            }
            Token::Char('(') => self.parse_nested(session),
            tok => Err(ParserError::UnexpectedToken(tok.clone())),
        }
    }

    /// precedence of the current token, `None` if it is not a known binary operator
    fn token_precedence(&self, session: &Session) -> Option<u32> {
        match self.current {
            Token::Char(op) => session.precedence(op),
            _ => None,
        }
    }

    fn parse_rhs(
        &mut self,
        session: &Session,
        expr_precedence: u32,
        lhs: (Expression, usize),
    ) -> MeasuredResult {
        let (mut result, mut height) = lhs;

        loop {
            let (operator, precedence) = match (&self.current, self.token_precedence(session)) {
                (Token::Char(op), Some(pr)) if pr >= expr_precedence => (*op, pr),
                _ => return Ok((result, height)),
            };
            self.next_token();

            let mut rhs = self.parse_primary(session)?;

            if self
                .token_precedence(session)
                .map_or(false, |next_precedence| precedence < next_precedence)
            {
                rhs = self.parse_rhs(session, precedence + 1, rhs)?;
            }

            let (rhs, rhs_height) = rhs;
            let binary = Expression::Binary(operator, Box::new(result), Box::new(rhs));
            let (binary, binary_height) = measured(binary, height.max(rhs_height) + 1)?;
            result = binary;
            height = binary_height;
        }
    }

    fn parse_measured(&mut self, session: &Session) -> MeasuredResult {
        if self.nesting >= MAX_EXPRESSION_DEPTH {
            return Err(ParserError::TooDeep(MAX_EXPRESSION_DEPTH));
        }

        self.nesting += 1;
        let result = match self.parse_primary(session) {
            Ok(lhs) => self.parse_rhs(session, 0, lhs),
            Err(err) => Err(err),
        };
        self.nesting -= 1;
        result
    }

    pub fn parse_expression(&mut self, session: &Session) -> PartialParseResult {
        self.parse_measured(session).map(|(expr, _)| expr)
    }

    pub fn parse_prototype(&mut self) -> Result<Prototype, ParserError> {
        let name = match &self.current {
            Token::Ident(name) => name.clone(),
            tok => return Err(ParserError::ExpectedFunctionName(tok.clone())),
        };
        self.next_token();

        if !self.is_char('(') {
            return Err(ParserError::ExpectedPrototypeOpenParen(self.current.clone()));
        }

        let mut args = Vec::new();
        while let Token::Ident(arg) = self.next_token() {
            args.push(arg.clone());
        }

        if !self.is_char(')') {
            return Err(ParserError::ExpectedPrototypeCloseParen(self.current.clone()));
        }
        self.next_token();

        Ok(Prototype { name, args })
    }

    pub fn parse_definition(&mut self, session: &Session) -> Result<Function, ParserError> {
        self.next_token(); // eat 'def'
        let prototype = self.parse_prototype()?;
        let body = self.parse_expression(session)?;
        Ok(Function { prototype, body })
    }

    pub fn parse_extern(&mut self) -> Result<Prototype, ParserError> {
        self.next_token(); // eat 'extern'
        self.parse_prototype()
    }

    pub fn parse_top_level_expression(
        &mut self,
        session: &Session,
    ) -> Result<Function, ParserError> {
        let body = self.parse_expression(session)?;
        Ok(Function {
            prototype: Prototype::anonymous(),
            body,
        })
    }

    /// Parse everything up to the end of input, stopping at the first error.
    ///
    /// Nothing is submitted anywhere; this is the pure syntactic view of a
    /// whole program.
    pub fn parse_program(&mut self, session: &Session) -> Result<Vec<ASTNode>, ParserError> {
        let mut ast = Vec::new();

        loop {
            let node = match self.current {
                Token::Eof => return Ok(ast),
                Token::Char(';') => {
                    self.next_token();
                    continue;
                }
                Token::Def => ASTNode::Function(self.parse_definition(session)?),
                Token::Extern => ASTNode::Extern(self.parse_extern()?),
                _ => ASTNode::Expression(self.parse_top_level_expression(session)?),
            };
            ast.push(node);
        }
    }
}

impl<'a> Parser<std::str::Bytes<'a>> {
    /// a parser over a string, already primed with its first token
    pub fn for_source(source: &'a str) -> Self {
        let mut parser = Parser::new(Lexer::new(source.bytes()));
        parser.next_token();
        parser
    }
}
