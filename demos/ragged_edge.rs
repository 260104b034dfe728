//! Example: ragged-edge tile specialization
//!
//! Walks the tile-shape ladder as the tile origin approaches the end of
//! the M dimension, down to the explicit no-tile outcome.
//!
//! Run with: cargo run --example ragged_edge

use gemm_kernelgen::{assemble, generate, KernelSpec};

fn main() {
    println!("=== Ragged Edge Example ===\n");

    let bytecode = assemble("fmadd(c, a, b)").unwrap();

    for i_pos in [0, 7, 9, 10] {
        let mut spec = KernelSpec::plain(4, 8, (10, 8, 8)).unwrap();
        spec.i_pos = i_pos;
        spec.k_panel = 1;

        let program = generate(&bytecode, &spec).unwrap();
        match program.tile {
            Some(tile) => println!(
                "iPos = {:2}: tile of {} row(s), {} instructions",
                i_pos,
                tile.rows,
                program.insts.len()
            ),
            None => println!(
                "iPos = {:2}: no tile fits the remaining rows; nothing emitted",
                i_pos
            ),
        }
    }
}
