use std::io::{self, Write};

use crate::ast::{Function, Prototype};
use crate::backend::{Backend, BackendError};
use crate::lexer::{Lexer, Token};
use crate::parser::{Parser, ParserError};
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Parse(#[from] ParserError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone)]
pub struct Options {
    /// printed before each top-level unit is read
    pub prompt: Option<String>,
    /// echo every accepted definition and extern
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            prompt: Some("ready> ".to_string()),
            verbose: true,
        }
    }
}

impl Options {
    pub fn quiet() -> Self {
        Self {
            prompt: None,
            verbose: false,
        }
    }
}

/// The incremental read-parse-compile-execute loop.
///
/// Everything the user sees (prompt, echo, results, errors) goes to
/// `diagnostics`. No error stops the loop; only the end of input does.
pub struct Driver<I: Iterator<Item = u8>, B: Backend, W: Write> {
    parser: Parser<I>,
    session: Session,
    backend: B,
    diagnostics: W,
    options: Options,
}

impl<I, B, W> Driver<I, B, W>
where
    I: Iterator<Item = u8>,
    B: Backend,
    W: Write,
{
    pub fn new(lexer: Lexer<I>, backend: B, diagnostics: W, options: Options) -> Self {
        Self {
            parser: Parser::new(lexer),
            session: Session::default(),
            backend,
            diagnostics,
            options,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn into_diagnostics(self) -> W {
        self.diagnostics
    }

    pub fn run(&mut self) -> io::Result<()> {
        self.prompt()?;
        self.parser.next_token();

        loop {
            match self.parser.current() {
                Token::Eof => return Ok(()),
                // ignore top-level semicolons
                Token::Char(';') => {
                    self.parser.next_token();
                }
                Token::Def => self.handle_definition()?,
                Token::Extern => self.handle_extern()?,
                _ => self.handle_top_level_expression()?,
            }
            self.prompt()?;
        }
    }

    fn prompt(&mut self) -> io::Result<()> {
        if let Some(prompt) = &self.options.prompt {
            write!(self.diagnostics, "{}", prompt)?;
            self.diagnostics.flush()?;
        }
        Ok(())
    }

    fn report(&mut self, err: &DriverError) -> io::Result<()> {
        writeln!(self.diagnostics, "error: {}", err)
    }

    /// report a parse failure and skip a single token to recover
    fn recover(&mut self, err: ParserError) -> io::Result<()> {
        self.report(&err.into())?;
        self.parser.next_token();
        Ok(())
    }

    /// print what the backend lowered a function to, in verbose mode
    fn echo(&mut self, listing: Option<String>) -> io::Result<()> {
        match listing {
            Some(listing) if self.options.verbose => writeln!(self.diagnostics, "{}", listing),
            _ => Ok(()),
        }
    }

    fn handle_definition(&mut self) -> io::Result<()> {
        match self.parser.parse_definition(&self.session) {
            Ok(function) => match self.define(&function) {
                Ok(handle) => {
                    self.backend.finalize_unit();
                    let listing = self.backend.render(handle);
                    self.echo(listing)
                }
                Err(err) => self.report(&err),
            },
            Err(err) => self.recover(err),
        }
    }

    fn handle_extern(&mut self) -> io::Result<()> {
        match self.parser.parse_extern() {
            Ok(prototype) => match self.declare(prototype) {
                Ok(handle) => {
                    let listing = self.backend.render(handle);
                    self.echo(listing)
                }
                Err(err) => self.report(&err),
            },
            Err(err) => self.recover(err),
        }
    }

    fn handle_top_level_expression(&mut self) -> io::Result<()> {
        match self.parser.parse_top_level_expression(&self.session) {
            Ok(function) => match self.evaluate(&function) {
                Ok((value, listing)) => {
                    self.echo(listing)?;
                    writeln!(self.diagnostics, "evaluated to {:.6}", value)
                }
                Err(err) => self.report(&err),
            },
            Err(err) => self.recover(err),
        }
    }

    fn declare(&mut self, prototype: Prototype) -> Result<B::Function, DriverError> {
        let handle = self.backend.declare(&prototype)?;
        self.session.register_prototype(prototype);
        Ok(handle)
    }

    /// Compile a function into the open unit.
    ///
    /// The prototype is registered up front so the body can refer to the
    /// function itself; if anything fails the registry is put back the way
    /// it was, so a rejected redefinition keeps the old signature callable.
    fn define(&mut self, function: &Function) -> Result<B::Function, DriverError> {
        let name = &function.prototype.name;
        let previous = self.session.register_prototype(function.prototype.clone());

        let result = self.compile(function);
        if result.is_err() {
            self.session.restore_prototype(name, previous);
        }
        result
    }

    fn compile(&mut self, function: &Function) -> Result<B::Function, DriverError> {
        let prototype = &function.prototype;
        let handle = match self.backend.get_function(&prototype.name, &self.session)? {
            Some(handle) => handle,
            None => self.backend.declare(prototype)?,
        };
        Ok(self
            .backend
            .define_body(handle, &function.body, &prototype.args, &self.session)?)
    }

    /// Run an anonymous function in a unit of its own, then throw the unit
    /// away. The listing is taken before the unit is released.
    fn evaluate(&mut self, function: &Function) -> Result<(f64, Option<String>), DriverError> {
        let handle = self.define(function)?;
        let unit = self.backend.finalize_unit();
        let listing = self.backend.render(handle);
        let result = self.backend.execute(handle);
        self.backend.release(unit);
        Ok((result?, listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::Codegen;
    use pretty_assertions::assert_eq;

    fn driver(source: &str) -> Driver<std::str::Bytes<'_>, Codegen, Vec<u8>> {
        Driver::new(
            Lexer::new(source.bytes()),
            Codegen::new(),
            Vec::new(),
            Options::quiet(),
        )
    }

    fn output(driver: Driver<std::str::Bytes<'_>, Codegen, Vec<u8>>) -> String {
        String::from_utf8(driver.into_diagnostics()).unwrap()
    }

    #[test]
    fn failed_redefinition_keeps_registry() {
        let mut driver = driver("def f(x) x; def f(x y) x+y;");
        driver.run().unwrap();
        assert_eq!(
            driver.session().prototype("f"),
            Some(&Prototype::new("f", vec!["x".to_string()]))
        );
        assert_eq!(output(driver), "error: function f cannot be redefined\n");
    }

    #[test]
    fn extern_is_registered() {
        let mut driver = driver("extern cos(x);");
        driver.run().unwrap();
        assert!(driver.session().prototype("cos").is_some());
        assert_eq!(output(driver), "");
    }

    #[test]
    fn anonymous_function_is_reusable() {
        let mut driver = driver("1; 2; 3");
        driver.run().unwrap();
        assert_eq!(
            output(driver),
            "evaluated to 1.000000\nevaluated to 2.000000\nevaluated to 3.000000\n"
        );
    }

    #[test]
    fn verbose_output_echoes_units() {
        let source = "extern sin(x); def f(x) x*2; f(4)";
        let mut driver = Driver::new(
            Lexer::new(source.bytes()),
            Codegen::new(),
            Vec::new(),
            Options::default(),
        );
        driver.run().unwrap();
        assert_eq!(
            output(driver),
            concat!(
                "ready> declare sin(x)\n",
                "ready> ready> define f(x)\n",
                "  param 0\n",
                "  const 2\n",
                "  mul\n",
                "ready> ready> define __anon_expr()\n",
                "  const 4\n",
                "  call f 1\n",
                "evaluated to 8.000000\n",
                "ready> ",
            )
        );
    }
}
