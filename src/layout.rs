//! Kernel layout strategies
//!
//! Every strategy walks the same state machine per invocation: INIT
//! (zero accumulators, materialize constants, hoist row/column variable
//! arguments), an unrolled main loop over the K panel (per offset:
//! LOAD_B, LOAD_A, then schedule+emit for every output cell), a
//! non-unrolled remainder loop with zero prefetch, and WRITEBACK.
//! Strategies differ only in how operand tiles are fetched and how the
//! accumulated tile lands back in memory.
//!
//! Interleaved mode packs two adjacent output rows into alternating
//! lanes of one accumulator: A rows arrive via pair-broadcast, B via
//! duplicating loads over half-width column blocks, and writeback
//! de-interleaves adjacent accumulator pairs with even/odd unpacks.

use crate::dag::ExprDag;
use crate::error::{KernelError, KernelResult};
use crate::isa::{
    BaseAddr, KernelProgram, MemRef, VReg, VectorInst, FULL_MASK, NATIVE_LANES, VECTOR_REGS,
};
use crate::opcode::ArithKind;
use crate::schedule::{ArgBindings, Location, RegisterPool, Scheduler};
use crate::spec::{KernelSpec, LayoutKind, VarArgKind};

/// Columns covered by one duplicating load in interleaved mode
const HALF_LANES: usize = NATIVE_LANES / 2;

/// Registers materialized for one variable argument
#[derive(Debug, Clone)]
pub enum VarArgRegs {
    Unused,
    /// One register per row (per pair in interleaved mode)
    Row(Vec<VReg>),
    /// One register per B vector
    Col(Vec<VReg>),
    /// A single register re-filled inside the innermost loop
    Cell(VReg),
}

/// The fixed register assignment for one tile shape
///
/// Built fresh for every ladder candidate; accumulators, operand tiles
/// and argument tiles come first, everything left over becomes the
/// scratch pool.
#[derive(Debug)]
pub struct RegisterLayout {
    /// Accumulator grid, `[row or pair][vec]`
    pub acc: Vec<Vec<VReg>>,
    /// A operand registers, one per row (per pair in interleaved mode)
    pub a: Vec<VReg>,
    /// B operand registers
    pub b: Vec<VReg>,
    /// Constant-argument broadcast registers
    pub consts: Vec<VReg>,
    /// Variable-argument tiles, by argument index
    pub vars: Vec<VarArgRegs>,
    /// Scratch pool for the scheduler and writeback staging
    pub pool: RegisterPool,
    /// Two output rows per accumulator?
    pub interleaved: bool,
    /// Output rows of the selected tile
    pub rows: usize,
}

/// Interleaved accumulation needs an even row count, and per-cell
/// variable arguments force it off: duplicated lanes would duplicate
/// their reads.
fn interleaved_mode(spec: &KernelSpec, rows: usize) -> bool {
    match spec.layout {
        LayoutKind::Plain | LayoutKind::TransposedRight => false,
        LayoutKind::TransposedLeft | LayoutKind::Packed => {
            rows % 2 == 0 && !spec.has_per_cell_var()
        }
        LayoutKind::InterleavedPacked => true,
    }
}

impl RegisterLayout {
    /// Derive the register assignment for a candidate tile of `rows`
    /// output rows. Exceeding the target's register file is a fatal
    /// configuration error.
    pub fn build(spec: &KernelSpec, rows: usize) -> KernelResult<Self> {
        let interleaved = interleaved_mode(spec, rows);
        let (acc_rows, vecs, a_regs) = if interleaved {
            (rows / 2, 2 * spec.b_len, rows / 2)
        } else {
            (rows, spec.b_len, rows)
        };

        let mut next: u8 = 0;
        let mut take = |n: usize| -> KernelResult<Vec<VReg>> {
            let start = next;
            let end = start as usize + n;
            if end > VECTOR_REGS as usize {
                return Err(KernelError::budget(format!(
                    "tile of {rows} rows needs more than {VECTOR_REGS} vector registers"
                )));
            }
            next = end as u8;
            Ok((start..next).map(VReg).collect())
        };

        let mut acc = Vec::with_capacity(acc_rows);
        for _ in 0..acc_rows {
            acc.push(take(vecs)?);
        }
        let b = take(vecs)?;
        let a = take(a_regs)?;
        let consts = take(spec.const_args.len())?;

        let mut vars = Vec::with_capacity(spec.var_args.len());
        for kind in &spec.var_args {
            vars.push(match kind {
                VarArgKind::Unused => VarArgRegs::Unused,
                VarArgKind::RowBroadcast => VarArgRegs::Row(take(a_regs)?),
                VarArgKind::ColVector => VarArgRegs::Col(take(vecs)?),
                VarArgKind::PerCell => VarArgRegs::Cell(take(1)?[0]),
            });
        }

        let pool = RegisterPool::new((next..VECTOR_REGS).map(VReg));
        Ok(Self { acc, a, b, consts, vars, pool, interleaved, rows })
    }

    fn acc_rows(&self) -> usize {
        self.acc.len()
    }

    fn vecs(&self) -> usize {
        self.b.len()
    }
}

/// Emit the complete kernel body for one selected tile shape.
pub fn emit_kernel(
    spec: &KernelSpec,
    dag: &ExprDag,
    regs: &mut RegisterLayout,
    program: &mut KernelProgram,
) -> KernelResult<()> {
    let mut ctx = Ctx { spec, dag, regs };
    ctx.init(program);

    let unroll = spec.layout.unroll_factor();
    let prefetch = spec.layout.prefetch_distance();
    let mut k = 0;
    while k + unroll <= spec.k_panel {
        for u in 0..unroll {
            ctx.emit_step(k + u, prefetch, program)?;
        }
        k += unroll;
    }
    // ragged tail of the panel: offset-by-1, no unroll, no prefetch
    while k < spec.k_panel {
        ctx.emit_step(k, 0, program)?;
        k += 1;
    }

    ctx.writeback(program)
}

struct Ctx<'a> {
    spec: &'a KernelSpec,
    dag: &'a ExprDag,
    regs: &'a mut RegisterLayout,
}

impl Ctx<'_> {
    fn init(&mut self, program: &mut KernelProgram) {
        for row in &self.regs.acc {
            for &reg in row {
                program.push(VectorInst::Zero { dst: reg });
            }
        }
        for (slot, &reg) in self.regs.consts.iter().enumerate() {
            program.push(VectorInst::BroadcastSlot { dst: reg, slot: slot as u8 });
        }
        self.hoist_var_args(program);
    }

    /// Row and column variable arguments are loop-invariant and load
    /// once, above the K loop. Per-cell arguments cannot be hoisted.
    fn hoist_var_args(&mut self, program: &mut KernelProgram) {
        let spec = self.spec;
        for (arg, regs) in self.regs.vars.iter().enumerate() {
            let base = BaseAddr::Var(arg as u8);
            match regs {
                VarArgRegs::Unused | VarArgRegs::Cell(_) => {}
                VarArgRegs::Row(rows) => {
                    for (r, &dst) in rows.iter().enumerate() {
                        if self.regs.interleaved {
                            let src = MemRef::new(base, (spec.i_pos + 2 * r) as i64);
                            program.push(VectorInst::BroadcastPair { dst, src });
                        } else {
                            let src = MemRef::new(base, (spec.i_pos + r) as i64);
                            program.push(VectorInst::Broadcast { dst, src });
                        }
                    }
                }
                VarArgRegs::Col(cols) => {
                    for (v, &dst) in cols.iter().enumerate() {
                        if self.regs.interleaved {
                            let src = MemRef::new(base, (spec.j_pos + v * HALF_LANES) as i64);
                            program.push(VectorInst::LoadDup { dst, src });
                        } else {
                            let src = MemRef::new(base, (spec.j_pos + v * NATIVE_LANES) as i64);
                            program.push(VectorInst::Load { dst, src });
                        }
                    }
                }
            }
        }
    }

    /// Packed panel coordinates for an absolute K index
    fn panel_coords(&self, kk: usize) -> (usize, usize) {
        (kk / self.spec.pack_factor, kk % self.spec.pack_factor)
    }

    /// Element address of the A operand for row `r` at panel offset `k`
    fn a_addr(&self, r: usize, k: usize) -> MemRef {
        let spec = self.spec;
        let kk = spec.k_pos + k;
        let row = if self.regs.interleaved { 2 * r } else { r };
        let offset = match spec.layout {
            // A is M x K, row-major
            LayoutKind::Plain | LayoutKind::TransposedRight => {
                (spec.i_pos + row) * spec.k_length + kk
            }
            // A is K x M: one K step is column-contiguous over rows
            LayoutKind::TransposedLeft => kk * spec.m_length + spec.i_pos + row,
            // packed panels, column-contiguous within a panel
            LayoutKind::Packed | LayoutKind::InterleavedPacked => {
                let (kt, kw) = self.panel_coords(kk);
                spec.a_align
                    + kt * spec.pack_factor * spec.m_length
                    + kw * spec.m_length
                    + spec.i_pos
                    + row
            }
        };
        MemRef::new(BaseAddr::A, offset as i64)
    }

    /// Element address of the B operand for vector `v` at panel offset `k`
    fn b_addr(&self, v: usize, k: usize) -> MemRef {
        let spec = self.spec;
        let kk = spec.k_pos + k;
        let col = if self.regs.interleaved { v * HALF_LANES } else { v * NATIVE_LANES };
        let offset = match spec.layout {
            LayoutKind::Plain | LayoutKind::TransposedLeft => {
                kk * spec.n_length + spec.j_pos + col
            }
            // B is N x K: lanes sit kLength apart and must be gathered
            LayoutKind::TransposedRight => (spec.j_pos + col) * spec.k_length + kk,
            LayoutKind::Packed | LayoutKind::InterleavedPacked => {
                let (kt, kw) = self.panel_coords(kk);
                spec.b_align
                    + kt * spec.pack_factor * spec.n_length
                    + kw * spec.n_length
                    + spec.j_pos
                    + col
            }
        };
        MemRef::new(BaseAddr::B, offset as i64)
    }

    fn emit_step(
        &mut self,
        k: usize,
        prefetch: i64,
        program: &mut KernelProgram,
    ) -> KernelResult<()> {
        if prefetch > 0 {
            let mut addr = self.b_addr(0, k);
            addr.offset += prefetch;
            program.push(VectorInst::Prefetch { addr });
        }

        // LOAD_B
        for v in 0..self.regs.vecs() {
            let dst = self.regs.b[v];
            let src = self.b_addr(v, k);
            program.push(match self.spec.layout {
                LayoutKind::TransposedRight => VectorInst::Gather {
                    dst,
                    base: src,
                    stride: self.spec.k_length as i64,
                    mask: FULL_MASK,
                },
                _ if self.regs.interleaved => VectorInst::LoadDup { dst, src },
                _ => VectorInst::Load { dst, src },
            });
        }

        // LOAD_A
        for r in 0..self.regs.a.len() {
            let dst = self.regs.a[r];
            let src = self.a_addr(r, k);
            program.push(if self.regs.interleaved {
                VectorInst::BroadcastPair { dst, src }
            } else {
                VectorInst::Broadcast { dst, src }
            });
        }

        // SCHEDULE + EMIT per output cell
        for r in 0..self.regs.acc_rows() {
            for v in 0..self.regs.vecs() {
                self.fetch_per_cell_vars(r, v, program);
                let bindings = self.cell_bindings(r, v);
                let (_, insts) = Scheduler::run(self.dag, &bindings, &mut self.regs.pool)?;
                crate::emit::lower(&insts, program)?;
            }
        }
        Ok(())
    }

    /// Per-cell variable arguments are the one variant re-fetched inside
    /// the innermost loop.
    fn fetch_per_cell_vars(&mut self, r: usize, v: usize, program: &mut KernelProgram) {
        let spec = self.spec;
        for (arg, regs) in self.regs.vars.iter().enumerate() {
            if let VarArgRegs::Cell(dst) = regs {
                if self.dag.uses_var(arg as u8) {
                    let offset = (spec.i_pos + r) * spec.n_length + spec.j_pos + v * NATIVE_LANES;
                    program.push(VectorInst::Broadcast {
                        dst: *dst,
                        src: MemRef::new(BaseAddr::Var(arg as u8), offset as i64),
                    });
                }
            }
        }
    }

    fn cell_bindings(&self, r: usize, v: usize) -> ArgBindings {
        let vars = self
            .regs
            .vars
            .iter()
            .map(|regs| match regs {
                VarArgRegs::Unused => None,
                VarArgRegs::Row(rows) => Some(Location::Vec(rows[r])),
                VarArgRegs::Col(cols) => Some(Location::Vec(cols[v])),
                VarArgRegs::Cell(reg) => Some(Location::Vec(*reg)),
            })
            .collect();
        ArgBindings {
            acc: Location::Vec(self.regs.acc[r][v]),
            a: Location::Vec(self.regs.a[r]),
            b: Location::Vec(self.regs.b[v]),
            consts: self.regs.consts.iter().map(|&r| Location::Vec(r)).collect(),
            vars,
        }
    }

    fn c_addr(&self, row: usize, col_block: usize) -> MemRef {
        let spec = self.spec;
        let offset = (spec.i_pos + row) * spec.n_length + spec.j_pos + col_block * NATIVE_LANES;
        MemRef::new(BaseAddr::C, offset as i64)
    }

    /// Accumulate the finished tile into C memory.
    fn writeback(&mut self, program: &mut KernelProgram) -> KernelResult<()> {
        if self.regs.interleaved {
            self.writeback_interleaved(program)
        } else {
            self.writeback_plain(program)
        }
    }

    fn writeback_plain(&mut self, program: &mut KernelProgram) -> KernelResult<()> {
        let tmp = self.regs.pool.acquire()?;
        for r in 0..self.regs.acc_rows() {
            for v in 0..self.regs.vecs() {
                let acc = self.regs.acc[r][v];
                let addr = self.c_addr(r, v);
                program.push(VectorInst::Load { dst: tmp, src: addr });
                program.push(VectorInst::Arith {
                    op: ArithKind::Add,
                    dst: acc,
                    lhs: acc,
                    rhs: tmp,
                });
                program.push(VectorInst::Store { dst: addr, src: acc });
            }
        }
        self.regs.pool.release(tmp);
        Ok(())
    }

    /// Adjacent accumulator pairs de-interleave into one even-row and one
    /// odd-row vector before the read-add-store.
    fn writeback_interleaved(&mut self, program: &mut KernelProgram) -> KernelResult<()> {
        let even = self.regs.pool.acquire()?;
        let odd = self.regs.pool.acquire()?;
        let tmp = self.regs.pool.acquire()?;
        for p in 0..self.regs.acc_rows() {
            for t in 0..self.regs.vecs() / 2 {
                let lo = self.regs.acc[p][2 * t];
                let hi = self.regs.acc[p][2 * t + 1];
                program.push(VectorInst::UnpackEven { dst: even, lhs: lo, rhs: hi });
                program.push(VectorInst::UnpackOdd { dst: odd, lhs: lo, rhs: hi });

                for (row, reg) in [(2 * p, even), (2 * p + 1, odd)] {
                    let addr = self.c_addr(row, t);
                    program.push(VectorInst::Load { dst: tmp, src: addr });
                    program.push(VectorInst::Arith {
                        op: ArithKind::Add,
                        dst: reg,
                        lhs: reg,
                        rhs: tmp,
                    });
                    program.push(VectorInst::Store { dst: addr, src: reg });
                }
            }
        }
        self.regs.pool.release(tmp);
        self.regs.pool.release(odd);
        self.regs.pool.release(even);
        Ok(())
    }
}
