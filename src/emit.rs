//! Lowering from abstract instructions to concrete vector operations
//!
//! A pure, order-preserving 1:1 table. Instructions must land in the
//! generated stream in scheduler order; reordering would break the
//! freed-register bookkeeping baked into that order.

use crate::error::{KernelError, KernelResult};
use crate::isa::{KernelProgram, MaskReg, VReg, VectorInst};
use crate::schedule::{AbstractInst, Location};

/// Append the concrete form of every scheduled instruction.
pub fn lower(insts: &[AbstractInst], program: &mut KernelProgram) -> KernelResult<()> {
    for inst in insts {
        program.push(lower_one(inst)?);
    }
    Ok(())
}

fn lower_one(inst: &AbstractInst) -> KernelResult<VectorInst> {
    match inst {
        AbstractInst::Arith { op, dst, lhs, rhs } => Ok(VectorInst::Arith {
            op: *op,
            dst: vec_reg(*dst)?,
            lhs: vec_reg(*lhs)?,
            rhs: vec_reg(*rhs)?,
        }),
        AbstractInst::Fused { acc, lhs, rhs } => Ok(VectorInst::Fmadd {
            acc: vec_reg(*acc)?,
            lhs: vec_reg(*lhs)?,
            rhs: vec_reg(*rhs)?,
        }),
        AbstractInst::Masked { op, mask, dst, lhs, rhs } => Ok(VectorInst::MaskedArith {
            op: *op,
            mask: mask_reg(*mask)?,
            dst: vec_reg(*dst)?,
            lhs: vec_reg(*lhs)?,
            rhs: vec_reg(*rhs)?,
        }),
        AbstractInst::Compare { op, dst, lhs, rhs } => Ok(VectorInst::Cmp {
            op: *op,
            dst: mask_reg(*dst)?,
            lhs: vec_reg(*lhs)?,
            rhs: vec_reg(*rhs)?,
        }),
        AbstractInst::Copy { dst, src } => Ok(VectorInst::Mov {
            dst: vec_reg(*dst)?,
            src: vec_reg(*src)?,
        }),
    }
}

fn vec_reg(loc: Location) -> KernelResult<VReg> {
    match loc {
        Location::Vec(reg) => Ok(reg),
        other => Err(KernelError::codegen(format!(
            "operand {other} is not a vector register; slots are staging-only"
        ))),
    }
}

fn mask_reg(loc: Location) -> KernelResult<MaskReg> {
    match loc {
        Location::Mask(mask) => Ok(mask),
        other => Err(KernelError::codegen(format!(
            "predicate operand {other} is not a mask register"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::CMP_MASK;
    use crate::opcode::{ArithKind, CompareKind};
    use crate::spec::LayoutKind;

    #[test]
    fn test_order_preserved() {
        let insts = vec![
            AbstractInst::Arith {
                op: ArithKind::Mul,
                dst: Location::Vec(VReg(28)),
                lhs: Location::Vec(VReg(8)),
                rhs: Location::Vec(VReg(16)),
            },
            AbstractInst::Fused {
                acc: Location::Vec(VReg(0)),
                lhs: Location::Vec(VReg(28)),
                rhs: Location::Vec(VReg(16)),
            },
        ];
        let mut program = KernelProgram::new(LayoutKind::Plain);
        lower(&insts, &mut program).unwrap();
        assert_eq!(program.insts.len(), 2);
        assert!(matches!(program.insts[0], VectorInst::Arith { op: ArithKind::Mul, .. }));
        assert!(matches!(program.insts[1], VectorInst::Fmadd { .. }));
    }

    #[test]
    fn test_compare_and_masked() {
        let insts = vec![
            AbstractInst::Compare {
                op: CompareKind::Gt,
                dst: Location::Mask(CMP_MASK),
                lhs: Location::Vec(VReg(8)),
                rhs: Location::Vec(VReg(16)),
            },
            AbstractInst::Masked {
                op: ArithKind::Add,
                mask: Location::Mask(CMP_MASK),
                dst: Location::Vec(VReg(0)),
                lhs: Location::Vec(VReg(8)),
                rhs: Location::Vec(VReg(24)),
            },
        ];
        let mut program = KernelProgram::new(LayoutKind::Plain);
        lower(&insts, &mut program).unwrap();
        assert!(matches!(
            program.insts[0],
            VectorInst::Cmp { dst: CMP_MASK, .. }
        ));
        assert!(matches!(
            program.insts[1],
            VectorInst::MaskedArith { mask: CMP_MASK, .. }
        ));
    }

    #[test]
    fn test_slot_in_arithmetic_rejected() {
        let insts = vec![AbstractInst::Arith {
            op: ArithKind::Add,
            dst: Location::Vec(VReg(0)),
            lhs: Location::Slot(0),
            rhs: Location::Vec(VReg(1)),
        }];
        let mut program = KernelProgram::new(LayoutKind::Plain);
        assert!(lower(&insts, &mut program).is_err());
    }
}
