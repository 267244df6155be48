use crate::ast::{Expression, Prototype};
use crate::session::Session;

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("unknown variable name '{0}'")]
    UnknownVariable(String),
    #[error("invalid binary operator '{0}'")]
    UnknownOperator(char),
    #[error("unknown function referenced '{0}'")]
    UnknownFunction(String),
    #[error("invalid number of args in call to {0}: expected {1} found {2}")]
    InvalidCall(String, usize, usize),
    #[error("function {0} cannot be redefined")]
    Redefinition(String),
    #[error("{name} is already declared with {expected} args, not {found}")]
    ConflictingDeclaration {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("function handle does not belong to the open compilation unit")]
    StaleHandle,
    #[error("function {0} has not been finalized for execution")]
    NotFinalized(String),
    #[error("unresolved symbol {0}")]
    UnresolvedSymbol(String),
    #[error("call depth exceeded while calling {0}")]
    CallDepthExceeded(String),
    #[error("compiled code underflowed its value stack")]
    MalformedCode,
}

/// The capabilities the driver needs from a code generator.
///
/// Functions are declared and defined into an open compilation unit.
/// Finalizing hands that unit off for execution and opens a fresh one;
/// afterwards [`Backend::lookup`] no longer sees its functions.
pub trait Backend {
    type Function: Copy;
    type Unit: Copy;

    /// declare a function (no body) in the open unit
    fn declare(&mut self, prototype: &Prototype) -> Result<Self::Function, BackendError>;

    /// Give a declared function its body.
    ///
    /// Fails if any live unit already holds a body under the same name.
    /// Calls in `body` are resolved through [`Backend::get_function`].
    fn define_body(
        &mut self,
        function: Self::Function,
        body: &Expression,
        params: &[String],
        session: &Session,
    ) -> Result<Self::Function, BackendError>;

    /// find a function by name in the open unit
    fn lookup(&self, name: &str) -> Option<Self::Function>;

    fn finalize_unit(&mut self) -> Self::Unit;

    fn execute(&self, function: Self::Function) -> Result<f64, BackendError>;

    /// free a finalized unit, along with everything defined in it
    fn release(&mut self, unit: Self::Unit);

    /// human readable listing of what a function was lowered to
    fn render(&self, function: Self::Function) -> Option<String>;

    /// Look a function up in the open unit, falling back to re-declaring the
    /// session's most recent prototype for that name. This is what lets a
    /// later unit call into functions whose units were already handed off.
    fn get_function(
        &mut self,
        name: &str,
        session: &Session,
    ) -> Result<Option<Self::Function>, BackendError> {
        if let Some(function) = self.lookup(name) {
            return Ok(Some(function));
        }

        match session.prototype(name) {
            Some(prototype) => self.declare(prototype).map(Some),
            None => Ok(None),
        }
    }
}
