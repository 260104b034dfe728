//! Example: packed-panel kernel bodies
//!
//! Shows packed addressing with interleaved accumulation, and how a
//! per-cell variable argument forces the non-interleaved path.
//!
//! Run with: cargo run --example packed_kernel

use gemm_kernelgen::{
    generate_from_expr, KernelSpec, LayoutKind, VarArgKind,
};

fn main() {
    println!("=== Packed Kernel Example ===\n");

    // Example 1: interleaved packed accumulation
    println!("Example 1: InterleavedPacked, 4 rows x 8 lanes");
    let mut spec =
        KernelSpec::new(LayoutKind::InterleavedPacked, 4, 8, (32, 32, 32)).unwrap();
    spec.pack_factor = 8;
    spec.a_align = 0;
    spec.b_align = 64;
    spec.k_panel = 8;

    let program = generate_from_expr("fmadd(c, a, b)", &spec).unwrap();
    println!("{}", program.summary);

    // Example 2: a per-cell variable argument on the Packed layout
    println!("Example 2: Packed with a per-cell variable argument");
    let mut spec = KernelSpec::new(LayoutKind::Packed, 2, 8, (32, 32, 32)).unwrap();
    spec.pack_factor = 8;
    spec.k_panel = 2;
    spec.var_args = vec![VarArgKind::PerCell];

    let program = generate_from_expr("fmadd(c, a, var[0])", &spec).unwrap();
    println!("{}", program);
}
