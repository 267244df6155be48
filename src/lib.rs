pub mod ast;
pub mod backend;
pub mod codegen;
pub mod driver;
pub mod lexer;
pub mod parser;
pub mod session;
