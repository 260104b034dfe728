//! SIMD GEMM Micro-Kernel Code Generator
//!
//! This library takes a compact bytecode describing an arithmetic
//! expression over matrix-tile operands, plus a set of tiling and layout
//! parameters, and emits the concrete sequence of vector instructions
//! that computes a blocked matrix-multiplication accumulation, with
//! manual register-budget-aware scheduling.
//!
//! # Example
//!
//! ```rust
//! use gemm_kernelgen::{generate_from_expr, KernelSpec};
//!
//! let mut spec = KernelSpec::plain(2, 8, (8, 8, 8)).unwrap(); // 2 rows, 8 lanes
//! spec.k_panel = 4;
//! let program = generate_from_expr("fmadd(c, a, b)", &spec).unwrap();
//! println!("{}", program);
//! ```

pub mod asm;
pub mod dag;
pub mod driver;
pub mod emit;
pub mod error;
pub mod isa;
pub mod layout;
pub mod opcode;
pub mod schedule;
pub mod spec;

pub use asm::assemble;
pub use dag::ExprDag;
pub use error::{KernelError, KernelResult};
pub use isa::{KernelProgram, TileShape, VectorInst, NATIVE_LANES, VECTOR_REGS};
pub use opcode::Bytecode;
pub use schedule::{ArgBindings, Location, RegisterPool, Scheduler};
pub use spec::{KernelSpec, LayoutKind, VarArgKind};

/// Generate a kernel body from wire bytecode.
pub fn generate(bytecode: &Bytecode, spec: &KernelSpec) -> KernelResult<KernelProgram> {
    driver::generate(bytecode, spec)
}

/// Generate a kernel body from the wire bit-string form of the bytecode.
pub fn generate_from_bits(bits: &str, spec: &KernelSpec) -> KernelResult<KernelProgram> {
    let bytecode = Bytecode::from_bits(bits)?;
    driver::generate(&bytecode, spec)
}

/// Generate a kernel body from a textual kernel expression.
pub fn generate_from_expr(src: &str, spec: &KernelSpec) -> KernelResult<KernelProgram> {
    let bytecode = asm::assemble(src)?;
    driver::generate(&bytecode, spec)
}
