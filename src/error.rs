//! Error types for the kernel code generator

use thiserror::Error;

/// Result type for code-generation operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Code-generation errors
///
/// Every failure in this crate is a programmer or configuration error;
/// nothing here is transient and nothing is retried.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Bytecode error at token {position}: {message}")]
    Bytecode { position: usize, message: String },

    #[error("Assembler error: {message}")]
    Asm { message: String },

    #[error("Invalid kernel spec: {message}")]
    Spec { message: String },

    #[error("Register budget exceeded: {message}")]
    RegisterBudget { message: String },

    #[error("Code generation error: {message}")]
    Codegen { message: String },
}

impl KernelError {
    pub fn bytecode(position: usize, msg: impl Into<String>) -> Self {
        KernelError::Bytecode { position, message: msg.into() }
    }

    pub fn asm(msg: impl Into<String>) -> Self {
        KernelError::Asm { message: msg.into() }
    }

    pub fn spec(msg: impl Into<String>) -> Self {
        KernelError::Spec { message: msg.into() }
    }

    pub fn budget(msg: impl Into<String>) -> Self {
        KernelError::RegisterBudget { message: msg.into() }
    }

    pub fn codegen(msg: impl Into<String>) -> Self {
        KernelError::Codegen { message: msg.into() }
    }
}
