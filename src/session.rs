use std::collections::HashMap;

use crate::ast::Prototype;

/// binary operators known to every fresh session
pub const DEFAULT_PRECEDENCE: [(char, u32); 4] = [('<', 10), ('+', 20), ('-', 30), ('*', 40)];

#[derive(Debug, PartialEq, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("precedence of '{0}' must be positive")]
    ZeroPrecedence(char),
    #[error("'{0}' cannot be used as a binary operator")]
    ReservedOperator(char),
}

/// Mutable state of one REPL run, threaded through parsing and driving.
#[derive(Debug, Clone)]
pub struct Session {
    precedence: HashMap<char, u32>,
    prototypes: HashMap<String, Prototype>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            precedence: DEFAULT_PRECEDENCE.iter().copied().collect(),
            prototypes: HashMap::new(),
        }
    }
}

impl Session {
    pub fn precedence(&self, op: char) -> Option<u32> {
        self.precedence.get(&op).copied()
    }

    /// Register (or change) the precedence of a single-character operator.
    ///
    /// Only punctuation that the lexer hands to the parser as a bare
    /// character and that the grammar does not already use is accepted.
    /// Returns the previous precedence, if any.
    pub fn set_precedence(
        &mut self,
        op: char,
        precedence: u32,
    ) -> Result<Option<u32>, SessionError> {
        if !op.is_ascii_punctuation() || matches!(op, '.' | '#' | '(' | ')' | ',' | ';') {
            return Err(SessionError::ReservedOperator(op));
        }
        if precedence == 0 {
            return Err(SessionError::ZeroPrecedence(op));
        }
        Ok(self.precedence.insert(op, precedence))
    }

    pub fn prototype(&self, name: &str) -> Option<&Prototype> {
        self.prototypes.get(name)
    }

    /// record the most recent prototype for its name, returning the one it replaces
    pub fn register_prototype(&mut self, prototype: Prototype) -> Option<Prototype> {
        self.prototypes.insert(prototype.name.clone(), prototype)
    }

    /// undo a [`Session::register_prototype`] whose definition was rejected
    pub(crate) fn restore_prototype(&mut self, name: &str, previous: Option<Prototype>) {
        match previous {
            Some(prototype) => {
                self.prototypes.insert(name.to_string(), prototype);
            }
            None => {
                self.prototypes.remove(name);
            }
        }
    }
}
