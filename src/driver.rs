//! Kernel driver
//!
//! Stages arguments, clamps the K panel, walks the tile-shape ladder and
//! delegates to the layout strategy. The driver is the single entry
//! point for one code-emission call: `(bytecode, spec) -> program`, pure
//! and synchronous.

use crate::dag::ExprDag;
use crate::error::{KernelError, KernelResult};
use crate::isa::{KernelProgram, TileShape, VectorInst};
use crate::layout::{emit_kernel, RegisterLayout};
use crate::opcode::Bytecode;
use crate::spec::{KernelSpec, VarArgKind};

/// Generate the kernel body for one invocation.
///
/// A spec whose tile origin has run past the M dimension produces a
/// program with `tile: None` and no kernel body: an explicit, observable
/// no-op rather than a silent fallthrough.
pub fn generate(bytecode: &Bytecode, spec: &KernelSpec) -> KernelResult<KernelProgram> {
    spec.validate()?;

    // CLAMP_PANEL: never read past the K dimension
    let spec = spec.clamped();

    let dag = ExprDag::build(bytecode)?;
    validate_arg_refs(&dag, &spec)?;

    let mut program = KernelProgram::new(spec.layout);

    // STAGE_ARGS
    let staged = stage_args(&spec, &mut program);

    // SELECT_TILE_SHAPE and delegate
    if let Some(rows) = select_tile_rows(&spec) {
        let mut regs = RegisterLayout::build(&spec, rows)?;
        emit_kernel(&spec, &dag, &mut regs, &mut program)?;
        program.tile = Some(TileShape { rows, vecs: spec.b_len });
    }

    // UNSTAGE_ARGS
    unstage_args(staged, &mut program);

    program.generate_summary();
    Ok(program)
}

/// Every argument reference in the DAG must be backed by the spec.
fn validate_arg_refs(dag: &ExprDag, spec: &KernelSpec) -> KernelResult<()> {
    for index in dag.const_refs() {
        if index as usize >= spec.const_args.len() {
            return Err(KernelError::spec(format!(
                "bytecode references constant argument {index} but only {} are supplied",
                spec.const_args.len()
            )));
        }
    }
    for index in dag.var_refs() {
        match spec.var_args.get(index as usize) {
            Some(kind) if *kind != VarArgKind::Unused => {}
            _ => {
                return Err(KernelError::spec(format!(
                    "bytecode references variable argument {index} with no usable descriptor"
                )))
            }
        }
    }
    Ok(())
}

/// Constants are pushed in reverse order so argument 0 lands in slot 0;
/// variable arguments follow in an increasing slot table keyed by index.
/// Returns the number of staged slots.
fn stage_args(spec: &KernelSpec, program: &mut KernelProgram) -> u8 {
    for &value in spec.const_args.iter().rev() {
        program.push(VectorInst::PushDouble { value });
    }
    let mut slot = spec.const_args.len() as u8;
    for (arg, &kind) in spec.var_args.iter().enumerate() {
        if kind != VarArgKind::Unused {
            program.push(VectorInst::StageVar { arg: arg as u8, kind, slot });
            slot += 1;
        }
    }
    slot
}

/// Pop the staged slots in reverse staging order.
fn unstage_args(staged: u8, program: &mut KernelProgram) {
    if staged > 0 {
        program.push(VectorInst::PopStack { count: staged });
    }
}

/// The ragged-edge specialization ladder: try the configured row count,
/// then every smaller one, until a candidate fits the remaining rows and
/// the layout accepts it.
fn select_tile_rows(spec: &KernelSpec) -> Option<usize> {
    let mut candidate = spec.a_len;
    while candidate >= 1 {
        if spec.i_pos + candidate <= spec.m_length && spec.layout.accepts_rows(candidate) {
            return Some(candidate);
        }
        candidate -= 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::spec::LayoutKind;

    fn fmadd() -> Bytecode {
        assemble("fmadd(c, a, b)").unwrap()
    }

    #[test]
    fn test_panel_clamp_bounds_k_range() {
        let mut spec = KernelSpec::plain(1, 8, (8, 64, 8)).unwrap();
        spec.k_pos = 60;
        spec.k_panel = 16;
        let program = generate(&fmadd(), &spec).unwrap();

        // exactly [60, 64): four K steps
        let fmadds = program.count(|i| matches!(i, VectorInst::Fmadd { .. }));
        assert_eq!(fmadds, 4);
    }

    #[test]
    fn test_ragged_edge_ladder_selects_one_row() {
        let mut spec = KernelSpec::plain(4, 8, (10, 8, 8)).unwrap();
        spec.i_pos = 9;
        spec.k_panel = 1;
        let program = generate(&fmadd(), &spec).unwrap();

        assert_eq!(program.tile.unwrap().rows, 1);
        let fmadds = program.count(|i| matches!(i, VectorInst::Fmadd { .. }));
        assert_eq!(fmadds, 1);
    }

    #[test]
    fn test_degenerate_origin_is_explicit_no_op() {
        let mut spec = KernelSpec::plain(4, 8, (10, 8, 8)).unwrap();
        spec.i_pos = 10;
        let program = generate(&fmadd(), &spec).unwrap();

        assert!(program.tile.is_none());
        assert_eq!(program.count(|i| matches!(i, VectorInst::Fmadd { .. })), 0);
        assert_eq!(program.count(|i| matches!(i, VectorInst::Store { .. })), 0);
    }

    #[test]
    fn test_interleaved_ladder_skips_odd_candidates() {
        let mut spec =
            KernelSpec::new(LayoutKind::InterleavedPacked, 4, 8, (16, 8, 8)).unwrap();
        spec.pack_factor = 4;
        spec.i_pos = 13;
        spec.k_panel = 1;
        let program = generate(&fmadd(), &spec).unwrap();

        // 3 rows fit but are odd; the ladder settles on 2
        assert_eq!(program.tile.unwrap().rows, 2);
    }

    #[test]
    fn test_staging_order_and_unstage() {
        let mut spec = KernelSpec::plain(1, 8, (8, 8, 8)).unwrap();
        spec.k_panel = 1;
        spec.const_args = vec![1.5, 2.5];
        spec.var_args = vec![VarArgKind::Unused, VarArgKind::ColVector];

        let bc = assemble("fmadd(c, mul(a, const[0]), var[1])").unwrap();
        let program = generate(&bc, &spec).unwrap();

        // reverse push order: constant 1 first, constant 0 on top
        assert_eq!(program.insts[0], VectorInst::PushDouble { value: 2.5 });
        assert_eq!(program.insts[1], VectorInst::PushDouble { value: 1.5 });
        assert_eq!(
            program.insts[2],
            VectorInst::StageVar { arg: 1, kind: VarArgKind::ColVector, slot: 2 }
        );
        assert_eq!(
            program.insts.last().unwrap(),
            &VectorInst::PopStack { count: 3 }
        );
    }

    #[test]
    fn test_unbacked_const_ref_rejected() {
        let spec = KernelSpec::plain(1, 8, (8, 8, 8)).unwrap();
        let bc = assemble("add(mul(a, b), const[0])").unwrap();
        assert!(matches!(
            generate(&bc, &spec),
            Err(KernelError::Spec { .. })
        ));
    }

    #[test]
    fn test_unused_var_ref_rejected() {
        let mut spec = KernelSpec::plain(1, 8, (8, 8, 8)).unwrap();
        spec.var_args = vec![VarArgKind::Unused];
        let bc = assemble("fmadd(c, a, var[0])").unwrap();
        assert!(matches!(
            generate(&bc, &spec),
            Err(KernelError::Spec { .. })
        ));
    }

    #[test]
    fn test_determinism() {
        let mut spec = KernelSpec::plain(2, 16, (16, 16, 16)).unwrap();
        spec.k_panel = 8;
        spec.const_args = vec![0.5];
        let bc = assemble("fmadd(c, mul(a, const[0]), b)").unwrap();

        let first = generate(&bc, &spec).unwrap();
        let second = generate(&bc, &spec).unwrap();
        assert_eq!(first.insts, second.insts);
    }
}
