//! Example: plain GEMM kernel body
//!
//! Demonstrates generating the straight-line instruction sequence for a
//! 4x16 output tile with the plain (AB) layout.
//!
//! Run with: cargo run --example plain_kernel

use gemm_kernelgen::{assemble, generate, ExprDag, KernelSpec};

fn main() {
    println!("=== Plain GEMM Kernel Example ===\n");

    // Example 1: the canonical accumulation body
    println!("Example 1: fmadd(c, a, b)");
    println!("Tile: 4 rows x 16 lanes, K panel of 8\n");

    let mut spec = KernelSpec::plain(4, 16, (64, 64, 64)).unwrap();
    spec.k_panel = 8;

    let bytecode = assemble("fmadd(c, a, b)").unwrap();
    println!("Wire bytecode: {}\n", bytecode.to_bits());

    let program = generate(&bytecode, &spec).unwrap();
    println!("{}", program.summary);

    // Example 2: the expression DAG behind a richer body
    println!("Example 2: expression sharing");
    println!("Expression: add(mul(a, b), mul(a, b))\n");

    let shared = assemble("add(mul(a, b), mul(a, b))").unwrap();
    let dag = ExprDag::build(&shared).unwrap();
    println!(
        "DAG has {} nodes for 7 bytecode tokens: the repeated mul collapsed",
        dag.len()
    );
    println!();

    // Example 3: the full listing for a tiny tile
    println!("Example 3: full listing, 1x8 tile, K panel of 2\n");
    let mut small = KernelSpec::plain(1, 8, (8, 8, 8)).unwrap();
    small.k_panel = 2;
    let program = generate(&bytecode, &small).unwrap();
    println!("{}", program);
}
