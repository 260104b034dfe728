//! Evaluation-order scheduling and scratch-register allocation
//!
//! Walks a labeled expression DAG and produces an ordered list of
//! abstract instructions, binding every node to a [`Location`]. Freeing
//! is reference-counted, not liveness-based: a scratch register returns
//! to the pool exactly when the last recorded parent of its node has
//! triggered one scheduling visit. This is a deliberate simplification
//! for small, statically-shaped trees re-evaluated once per output cell.

use crate::dag::{ArgRef, ExprDag, NodeId, Op};
use crate::error::{KernelError, KernelResult};
use crate::isa::{MaskReg, VReg, CMP_MASK, VECTOR_REGS};
use crate::opcode::{ArithKind, CompareKind};

/// Runtime binding of a node to a register or stack slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Vec(VReg),
    Mask(MaskReg),
    Slot(u8),
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Vec(r) => write!(f, "{r}"),
            Location::Mask(m) => write!(f, "{m}"),
            Location::Slot(s) => write!(f, "[sp+{s}]"),
        }
    }
}

/// A bounded pool of scratch vector registers
///
/// Only registers handed to the pool at construction are ever released
/// back into it; pre-bound tile registers pass through [`release`] as
/// no-ops. The pool is never resized at runtime.
///
/// [`release`]: RegisterPool::release
#[derive(Debug)]
pub struct RegisterPool {
    free: Vec<VReg>,
    owned: u32,
    in_free_list: u32,
}

impl RegisterPool {
    pub fn new(regs: impl IntoIterator<Item = VReg>) -> Self {
        let mut free: Vec<VReg> = regs.into_iter().collect();
        // pop() hands out the lowest-numbered register first
        free.reverse();
        let mut owned = 0u32;
        for r in &free {
            debug_assert!(r.0 < VECTOR_REGS);
            owned |= 1 << r.0;
        }
        Self { in_free_list: owned, free, owned }
    }

    /// Take a scratch register, or fail with a register-budget error.
    pub fn acquire(&mut self) -> KernelResult<VReg> {
        let reg = self.free.pop().ok_or_else(|| {
            KernelError::budget(format!(
                "scratch pool of {} registers exhausted; the kernel needs a smaller tile",
                self.capacity()
            ))
        })?;
        self.in_free_list &= !(1 << reg.0);
        Ok(reg)
    }

    /// Return a register to the pool. Registers the pool does not own,
    /// and registers already free, are ignored.
    pub fn release(&mut self, reg: VReg) {
        let bit = 1u32 << reg.0;
        if self.owned & bit == 0 || self.in_free_list & bit != 0 {
            return;
        }
        self.in_free_list |= bit;
        self.free.push(reg);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.owned.count_ones() as usize
    }
}

/// Pre-bound leaf locations for one output cell
///
/// The layout strategy populates these before scheduling; the scheduler
/// itself never emits loads for leaves.
#[derive(Debug, Clone)]
pub struct ArgBindings {
    /// The C accumulator for this cell; also the destination of the DAG root
    pub acc: Location,
    /// The A operand (broadcast or pair-broadcast) for this row
    pub a: Location,
    /// The B operand vector for this column block
    pub b: Location,
    /// Constant-argument broadcast registers, by argument index
    pub consts: Vec<Location>,
    /// Variable-argument tiles, by argument index; `None` for unused slots
    pub vars: Vec<Option<Location>>,
}

impl ArgBindings {
    pub fn resolve(&self, arg: ArgRef) -> KernelResult<Location> {
        match arg {
            ArgRef::A => Ok(self.a),
            ArgRef::B => Ok(self.b),
            ArgRef::C => Ok(self.acc),
            ArgRef::Mask => Ok(Location::Mask(CMP_MASK)),
            ArgRef::Reg(i) => {
                if i < VECTOR_REGS {
                    Ok(Location::Vec(VReg(i)))
                } else {
                    Err(KernelError::codegen(format!("register reference v{i} out of range")))
                }
            }
            ArgRef::Const(i) => self.consts.get(i as usize).copied().ok_or_else(|| {
                KernelError::codegen(format!("constant argument {i} is not bound"))
            }),
            ArgRef::Var(i) => self
                .vars
                .get(i as usize)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    KernelError::codegen(format!("variable argument {i} is not bound"))
                }),
        }
    }
}

/// One scheduled instruction, still in terms of [`Location`]s
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbstractInst {
    Arith { op: ArithKind, dst: Location, lhs: Location, rhs: Location },
    /// `acc += lhs * rhs`; destination aliases the accumulator operand
    Fused { acc: Location, lhs: Location, rhs: Location },
    Masked { op: ArithKind, mask: Location, dst: Location, lhs: Location, rhs: Location },
    Compare { op: CompareKind, dst: Location, lhs: Location, rhs: Location },
    Copy { dst: Location, src: Location },
}

/// Scheduler for one output cell
pub struct Scheduler<'a> {
    dag: &'a ExprDag,
    bindings: &'a ArgBindings,
    pool: &'a mut RegisterPool,
    visits: Vec<u32>,
    locations: Vec<Option<Location>>,
    insts: Vec<AbstractInst>,
}

impl<'a> Scheduler<'a> {
    pub fn new(dag: &'a ExprDag, bindings: &'a ArgBindings, pool: &'a mut RegisterPool) -> Self {
        Self {
            visits: vec![0; dag.len()],
            locations: vec![None; dag.len()],
            insts: Vec::new(),
            dag,
            bindings,
            pool,
        }
    }

    /// Schedule a whole cell: order, allocate and emit for the DAG root.
    pub fn run(
        dag: &'a ExprDag,
        bindings: &'a ArgBindings,
        pool: &'a mut RegisterPool,
    ) -> KernelResult<(Location, Vec<AbstractInst>)> {
        let mut scheduler = Self::new(dag, bindings, pool);
        let root = scheduler.schedule_root()?;
        Ok((root, scheduler.insts))
    }

    pub fn schedule_root(&mut self) -> KernelResult<Location> {
        self.schedule(self.dag.root(), true)
    }

    pub fn instructions(&self) -> &[AbstractInst] {
        &self.insts
    }

    fn schedule(&mut self, id: NodeId, is_root: bool) -> KernelResult<Location> {
        self.visits[id] += 1;
        if let Some(loc) = self.locations[id] {
            return Ok(loc);
        }

        let node = self.dag.node(id);
        let children = node.children.clone();
        let loc = match node.op {
            Op::Arg(arg) => self.bindings.resolve(arg)?,
            Op::Arith(ArithKind::Fmadd) => self.schedule_fused(&children)?,
            Op::Arith(ArithKind::Load) => self.schedule_load(&children, is_root)?,
            Op::Arith(op) => self.schedule_binary(op, &children, is_root)?,
            Op::Compare(op) => self.schedule_compare(op, &children)?,
            Op::Masked(op) => self.schedule_masked(op, &children, is_root)?,
        };

        self.locations[id] = Some(loc);
        Ok(loc)
    }

    /// Heavier subtree first keeps the live-register count low.
    fn schedule_binary(
        &mut self,
        op: ArithKind,
        children: &[NodeId],
        is_root: bool,
    ) -> KernelResult<Location> {
        for &child in &self.by_label(children, false) {
            self.schedule(child, false)?;
        }
        let lhs = self.resolved(children[0]);
        let rhs = self.resolved(children[1]);
        let dst = if is_root {
            self.bindings.acc
        } else {
            Location::Vec(self.pool.acquire()?)
        };
        self.insts.push(AbstractInst::Arith { op, dst, lhs, rhs });
        self.release_dead(children, None);
        Ok(dst)
    }

    fn schedule_compare(&mut self, op: CompareKind, children: &[NodeId]) -> KernelResult<Location> {
        for &child in &self.by_label(children, false) {
            self.schedule(child, false)?;
        }
        let lhs = self.resolved(children[0]);
        let rhs = self.resolved(children[1]);
        let dst = Location::Mask(CMP_MASK);
        self.insts.push(AbstractInst::Compare { op, dst, lhs, rhs });
        self.release_dead(children, None);
        Ok(dst)
    }

    /// The accumulator operand must stay resolvable while the multiplier
    /// operands are evaluated, so the lightest subtree goes first. The
    /// destination aliases the first child, which therefore survives the
    /// release check: it now carries this node's value.
    fn schedule_fused(&mut self, children: &[NodeId]) -> KernelResult<Location> {
        for &child in &self.by_label(children, true) {
            self.schedule(child, false)?;
        }
        let acc = self.resolved(children[0]);
        let lhs = self.resolved(children[1]);
        let rhs = self.resolved(children[2]);
        self.insts.push(AbstractInst::Fused { acc, lhs, rhs });
        self.release_dead(children, Some(children[0]));
        Ok(acc)
    }

    fn schedule_masked(
        &mut self,
        op: ArithKind,
        children: &[NodeId],
        is_root: bool,
    ) -> KernelResult<Location> {
        for &child in &self.by_label(children, true) {
            self.schedule(child, false)?;
        }
        let mask = self.resolved(children[0]);
        if !matches!(mask, Location::Mask(_)) {
            return Err(KernelError::codegen(
                "masked arithmetic needs a predicate as its first operand",
            ));
        }
        let lhs = self.resolved(children[1]);
        let rhs = self.resolved(children[2]);
        let dst = if is_root {
            self.bindings.acc
        } else {
            Location::Vec(self.pool.acquire()?)
        };
        self.insts.push(AbstractInst::Masked { op, mask, dst, lhs, rhs });
        self.release_dead(children, None);
        Ok(dst)
    }

    fn schedule_load(&mut self, children: &[NodeId], is_root: bool) -> KernelResult<Location> {
        self.schedule(children[0], false)?;
        let src = self.resolved(children[0]);
        let dst = if is_root {
            self.bindings.acc
        } else {
            Location::Vec(self.pool.acquire()?)
        };
        self.insts.push(AbstractInst::Copy { dst, src });
        self.release_dead(children, None);
        Ok(dst)
    }

    fn resolved(&self, id: NodeId) -> Location {
        self.locations[id].expect("child scheduled before parent")
    }

    /// Children ordered by label; stable, so bytecode order breaks ties.
    fn by_label(&self, children: &[NodeId], ascending: bool) -> Vec<NodeId> {
        let mut order = children.to_vec();
        if ascending {
            order.sort_by_key(|&c| self.dag.node(c).label);
        } else {
            order.sort_by_key(|&c| std::cmp::Reverse(self.dag.node(c).label));
        }
        order
    }

    /// Return the registers of fully-visited children to the pool.
    fn release_dead(&mut self, children: &[NodeId], keep: Option<NodeId>) {
        for &child in children {
            if Some(child) == keep {
                continue;
            }
            if self.visits[child] == self.dag.node(child).parent_count {
                if let Some(Location::Vec(reg)) = self.locations[child] {
                    self.pool.release(reg);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use pretty_assertions::assert_eq;

    fn dag(src: &str) -> ExprDag {
        ExprDag::build(&assemble(src).unwrap()).unwrap()
    }

    fn bindings() -> ArgBindings {
        ArgBindings {
            acc: Location::Vec(VReg(0)),
            a: Location::Vec(VReg(8)),
            b: Location::Vec(VReg(16)),
            consts: vec![Location::Vec(VReg(20))],
            vars: vec![Some(Location::Vec(VReg(24)))],
        }
    }

    fn pool(n: u8) -> RegisterPool {
        RegisterPool::new((28..28 + n).map(VReg))
    }

    #[test]
    fn test_fmadd_uses_no_scratch() {
        let d = dag("fmadd(c, a, b)");
        let b = bindings();
        let mut p = pool(4);
        let (root, insts) = Scheduler::run(&d, &b, &mut p).unwrap();

        assert_eq!(root, Location::Vec(VReg(0)));
        assert_eq!(
            insts,
            vec![AbstractInst::Fused {
                acc: Location::Vec(VReg(0)),
                lhs: Location::Vec(VReg(8)),
                rhs: Location::Vec(VReg(16)),
            }]
        );
        assert_eq!(p.available(), 4);
    }

    #[test]
    fn test_mul_then_add_with_scratch_freed() {
        let d = dag("add(mul(a, b), const[0])");
        let b = bindings();
        let mut p = pool(2);
        let (root, insts) = Scheduler::run(&d, &b, &mut p).unwrap();

        assert_eq!(root, Location::Vec(VReg(0)));
        assert_eq!(
            insts,
            vec![
                AbstractInst::Arith {
                    op: ArithKind::Mul,
                    dst: Location::Vec(VReg(28)),
                    lhs: Location::Vec(VReg(8)),
                    rhs: Location::Vec(VReg(16)),
                },
                AbstractInst::Arith {
                    op: ArithKind::Add,
                    dst: Location::Vec(VReg(0)),
                    lhs: Location::Vec(VReg(28)),
                    rhs: Location::Vec(VReg(20)),
                },
            ]
        );
        // the MUL scratch is back in the pool after the ADD
        assert_eq!(p.available(), 2);
    }

    #[test]
    fn test_descending_order_for_binary() {
        // mul has label 2, a label 1: the heavier right subtree is
        // evaluated first even though it is the second operand
        let d = dag("sub(a, mul(a, b))");
        let b = bindings();
        let mut p = pool(2);
        let (_, insts) = Scheduler::run(&d, &b, &mut p).unwrap();

        assert!(matches!(insts[0], AbstractInst::Arith { op: ArithKind::Mul, .. }));
        match &insts[1] {
            AbstractInst::Arith { op: ArithKind::Sub, lhs, rhs, .. } => {
                // operand positions still follow the bytecode
                assert_eq!(*lhs, Location::Vec(VReg(8)));
                assert_eq!(*rhs, Location::Vec(VReg(28)));
            }
            other => panic!("expected sub, got {other:?}"),
        }
    }

    #[test]
    fn test_ascending_order_for_fused() {
        // children: c (label 1), mul (label 2), add (label 2); ascending
        // stable order schedules c, then mul, then add
        let d = dag("fmadd(c, mul(a, b), add(a, b))");
        let b = bindings();
        let mut p = pool(2);
        let (_, insts) = Scheduler::run(&d, &b, &mut p).unwrap();

        assert!(matches!(insts[0], AbstractInst::Arith { op: ArithKind::Mul, .. }));
        assert!(matches!(insts[1], AbstractInst::Arith { op: ArithKind::Add, .. }));
        assert!(matches!(insts[2], AbstractInst::Fused { .. }));
        // both multiplier scratches freed once the fused op consumed them
        assert_eq!(p.available(), 2);
    }

    #[test]
    fn test_shared_node_scheduled_once() {
        let d = dag("add(mul(a, b), mul(a, b))");
        let b = bindings();
        let mut p = pool(2);
        let (_, insts) = Scheduler::run(&d, &b, &mut p).unwrap();

        // one mul, not two: the DAG sharing becomes instruction reuse
        let muls = insts
            .iter()
            .filter(|i| matches!(i, AbstractInst::Arith { op: ArithKind::Mul, .. }))
            .count();
        assert_eq!(muls, 1);
        assert_eq!(p.available(), 2);
    }

    #[test]
    fn test_shared_register_not_freed_early() {
        // mul(a, b) is shared between the root and the inner add; its
        // scratch register must survive until both parents have visited
        let d = dag("sub(mul(a, b), add(mul(a, b), const[0]))");
        let b = bindings();
        let mut p = pool(2);
        let (_, insts) = Scheduler::run(&d, &b, &mut p).unwrap();

        let mul_dst = match &insts[0] {
            AbstractInst::Arith { op: ArithKind::Mul, dst, .. } => *dst,
            other => panic!("expected mul first, got {other:?}"),
        };
        let add_dst = match &insts[1] {
            AbstractInst::Arith { op: ArithKind::Add, dst, .. } => *dst,
            other => panic!("expected add second, got {other:?}"),
        };
        // the add may not clobber the still-live mul result
        assert_ne!(mul_dst, add_dst);
        assert_eq!(p.available(), 2);
    }

    #[test]
    fn test_idempotent_reschedule() {
        let d = dag("add(mul(a, b), const[0])");
        let b = bindings();
        let mut p = pool(2);
        let mut s = Scheduler::new(&d, &b, &mut p);
        let first = s.schedule_root().unwrap();
        let count = s.instructions().len();
        let second = s.schedule_root().unwrap();
        assert_eq!(first, second);
        assert_eq!(s.instructions().len(), count);
    }

    #[test]
    fn test_pool_exhaustion_is_fatal() {
        let d = dag("add(mul(a, b), const[0])");
        let b = bindings();
        let mut p = pool(0);
        assert!(matches!(
            Scheduler::run(&d, &b, &mut p),
            Err(KernelError::RegisterBudget { .. })
        ));
    }

    #[test]
    fn test_compare_writes_fixed_mask() {
        let d = dag("gt(a, b)");
        let b = bindings();
        let mut p = pool(1);
        let (root, insts) = Scheduler::run(&d, &b, &mut p).unwrap();
        assert_eq!(root, Location::Mask(CMP_MASK));
        assert_eq!(insts.len(), 1);
        assert_eq!(p.available(), 1);
    }

    #[test]
    fn test_masked_arith_threads_predicate() {
        let d = dag("masked_add(gt(a, b), a, var[0])");
        let b = bindings();
        let mut p = pool(2);
        let (root, insts) = Scheduler::run(&d, &b, &mut p).unwrap();

        assert!(matches!(insts[0], AbstractInst::Compare { .. }));
        match &insts[1] {
            AbstractInst::Masked { mask, dst, .. } => {
                assert_eq!(*mask, Location::Mask(CMP_MASK));
                assert_eq!(*dst, root);
                assert_eq!(root, Location::Vec(VReg(0)));
            }
            other => panic!("expected masked op, got {other:?}"),
        }
    }

    #[test]
    fn test_release_ignores_prebound_registers() {
        let mut p = RegisterPool::new([VReg(30), VReg(31)]);
        p.release(VReg(5));
        assert_eq!(p.available(), 2);
        let r = p.acquire().unwrap();
        assert_eq!(r, VReg(30));
        p.release(r);
        p.release(r);
        assert_eq!(p.available(), 2);
    }
}
