//! Front end of the subject language: tokenizer, parser, scope analysis and
//! compiler to [`CodeObject`]s.

pub mod ast;
mod compiler;
pub mod lexer;
mod parser;
mod symtable;

use crate::bytecode::{CodeKind, CodeObject};
use thiserror::Error;

pub use lexer::quote;
pub use parser::is_keyword;

/// File name given to compiled test statements.
pub const STATEMENT_FILENAME: &str = "<test>";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("line {line}: {message}")]
    Lex { line: u32, message: String },
    #[error("line {line}: {message}")]
    Parse { line: u32, message: String },
    #[error("line {line}: {message}")]
    Syntax { line: u32, message: String },
    #[error("internal compiler error: {0}")]
    Internal(String),
}

pub fn parse_module(source: &str) -> Result<ast::Module, CompileError> {
    let tokens = lexer::tokenize(source)?;
    parser::Parser::new(tokens).parse_module()
}

/// Compile a subject module's source.
pub fn compile_module(source: &str, filename: &str) -> Result<CodeObject, CompileError> {
    let module = parse_module(source)?;
    compiler::compile(&module, filename, CodeKind::Module)
}

/// Compile one rendered test statement.
pub fn compile_statement(source: &str) -> Result<CodeObject, CompileError> {
    let module = parse_module(source)?;
    compiler::compile(&module, STATEMENT_FILENAME, CodeKind::Statement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_error_carries_line() {
        let err = compile_module("x = 1\ny = (\n", "m.sub").unwrap_err();
        assert!(err.to_string().starts_with("line"));
    }

    #[test]
    fn test_statement_file_name() {
        let code = compile_statement("v0 = 1\n").unwrap();
        assert_eq!(&*code.filename, STATEMENT_FILENAME);
    }
}
