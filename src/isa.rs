//! Target ISA definitions and the generated-program artifact
//!
//! The generator targets a neutral 512-bit vector ISA: 32 vector
//! registers of 8 f64 lanes, plus mask registers. `k0` reads as all-true
//! and is used by gathers; `k1` is the fixed compare predicate.
//!
//! A [`KernelProgram`] is what one code-emission call hands back to the
//! host: an ordered instruction list plus the tile shape that was
//! actually selected (`None` when no tile fit the remaining rows).

use serde::{Deserialize, Serialize};

use crate::opcode::{ArithKind, CompareKind};
use crate::spec::{LayoutKind, VarArgKind};

/// Vector registers available on the target
pub const VECTOR_REGS: u8 = 32;

/// f64 lanes per vector register
pub const NATIVE_LANES: usize = 8;

/// A vector register, `v0..v31`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VReg(pub u8);

impl std::fmt::Display for VReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A predicate/mask register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaskReg(pub u8);

/// All-true mask, implicit operand of unmasked gathers
pub const FULL_MASK: MaskReg = MaskReg(0);

/// Fixed destination of compare instructions
pub const CMP_MASK: MaskReg = MaskReg(1);

impl std::fmt::Display for MaskReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "k{}", self.0)
    }
}

/// Operand streams addressable by generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseAddr {
    A,
    B,
    C,
    /// The staged buffer of variable argument `k`
    Var(u8),
}

impl std::fmt::Display for BaseAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaseAddr::A => write!(f, "A"),
            BaseAddr::B => write!(f, "B"),
            BaseAddr::C => write!(f, "C"),
            BaseAddr::Var(k) => write!(f, "var{k}"),
        }
    }
}

/// A memory operand: base stream plus element offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRef {
    pub base: BaseAddr,
    pub offset: i64,
}

impl MemRef {
    pub fn new(base: BaseAddr, offset: i64) -> Self {
        Self { base, offset }
    }
}

impl std::fmt::Display for MemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{:+}]", self.base, self.offset)
    }
}

/// One concrete vector instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VectorInst {
    /// Clear a register
    Zero { dst: VReg },
    /// Contiguous vector load
    Load { dst: VReg, src: MemRef },
    /// Contiguous vector store
    Store { dst: MemRef, src: VReg },
    /// Broadcast one scalar across all lanes
    Broadcast { dst: VReg, src: MemRef },
    /// Broadcast two adjacent scalars as alternating lane pairs
    BroadcastPair { dst: VReg, src: MemRef },
    /// Load 4 scalars, duplicating each into adjacent lanes
    LoadDup { dst: VReg, src: MemRef },
    /// Strided gather under a mask
    Gather { dst: VReg, base: MemRef, stride: i64, mask: MaskReg },
    /// Broadcast a staged double from a stack slot
    BroadcastSlot { dst: VReg, slot: u8 },
    /// Register copy
    Mov { dst: VReg, src: VReg },
    /// Two-source arithmetic
    Arith { op: ArithKind, dst: VReg, lhs: VReg, rhs: VReg },
    /// Fused multiply-add: `acc += lhs * rhs`
    Fmadd { acc: VReg, lhs: VReg, rhs: VReg },
    /// Two-source arithmetic under a mask
    MaskedArith { op: ArithKind, mask: MaskReg, dst: VReg, lhs: VReg, rhs: VReg },
    /// Lane-wise compare into a mask register
    Cmp { op: CompareKind, dst: MaskReg, lhs: VReg, rhs: VReg },
    /// Even lanes of `lhs` followed by even lanes of `rhs`
    UnpackEven { dst: VReg, lhs: VReg, rhs: VReg },
    /// Odd lanes of `lhs` followed by odd lanes of `rhs`
    UnpackOdd { dst: VReg, lhs: VReg, rhs: VReg },
    /// Software prefetch hint
    Prefetch { addr: MemRef },
    /// Stage a constant argument: push one double onto the scratch stack
    PushDouble { value: f64 },
    /// Stage a variable argument buffer into a stack slot
    StageVar { arg: u8, kind: VarArgKind, slot: u8 },
    /// Unstage: pop `count` slots in reverse staging order
    PopStack { count: u8 },
}

impl std::fmt::Display for VectorInst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorInst::Zero { dst } => write!(f, "vzero    {dst}"),
            VectorInst::Load { dst, src } => write!(f, "vload    {dst}, {src}"),
            VectorInst::Store { dst, src } => write!(f, "vstore   {dst}, {src}"),
            VectorInst::Broadcast { dst, src } => write!(f, "vbcast   {dst}, {src}"),
            VectorInst::BroadcastPair { dst, src } => write!(f, "vbcast2  {dst}, {src}"),
            VectorInst::LoadDup { dst, src } => write!(f, "vloaddup {dst}, {src}"),
            VectorInst::Gather { dst, base, stride, mask } => {
                write!(f, "vgather  {dst}, {base}{{stride {stride}}}, {mask}")
            }
            VectorInst::BroadcastSlot { dst, slot } => {
                write!(f, "vbcastsd {dst}, [sp+{slot}]")
            }
            VectorInst::Mov { dst, src } => write!(f, "vmov     {dst}, {src}"),
            VectorInst::Arith { op, dst, lhs, rhs } => {
                write!(f, "v{:<8}{dst}, {lhs}, {rhs}", op.mnemonic())
            }
            VectorInst::Fmadd { acc, lhs, rhs } => {
                write!(f, "vfmadd   {acc}, {lhs}, {rhs}")
            }
            VectorInst::MaskedArith { op, mask, dst, lhs, rhs } => {
                write!(f, "v{:<8}{dst}{{{mask}}}, {lhs}, {rhs}", op.mnemonic())
            }
            VectorInst::Cmp { op, dst, lhs, rhs } => {
                write!(f, "vcmp{:<4} {dst}, {lhs}, {rhs}", op.mnemonic())
            }
            VectorInst::UnpackEven { dst, lhs, rhs } => {
                write!(f, "vunpckev {dst}, {lhs}, {rhs}")
            }
            VectorInst::UnpackOdd { dst, lhs, rhs } => {
                write!(f, "vunpckod {dst}, {lhs}, {rhs}")
            }
            VectorInst::Prefetch { addr } => write!(f, "prefetch {addr}"),
            VectorInst::PushDouble { value } => write!(f, "push     {value}"),
            VectorInst::StageVar { arg, kind, slot } => {
                write!(f, "stage    var{arg} ({kind:?}) -> [sp+{slot}]")
            }
            VectorInst::PopStack { count } => write!(f, "pop      {count}"),
        }
    }
}

/// The tile shape one kernel invocation actually computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileShape {
    /// Output rows covered
    pub rows: usize,
    /// Output width in vector registers
    pub vecs: usize,
}

/// A complete generated kernel body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelProgram {
    /// Layout strategy that produced the body
    pub layout: LayoutKind,
    /// Selected tile shape; `None` means no tile size fit the remaining
    /// rows and no kernel body was emitted
    pub tile: Option<TileShape>,
    /// Ordered instruction sequence
    pub insts: Vec<VectorInst>,
    /// Human-readable summary
    pub summary: String,
}

impl KernelProgram {
    pub fn new(layout: LayoutKind) -> Self {
        Self {
            layout,
            tile: None,
            insts: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn push(&mut self, inst: VectorInst) {
        self.insts.push(inst);
    }

    /// Count instructions matching a predicate
    pub fn count(&self, pred: impl Fn(&VectorInst) -> bool) -> usize {
        self.insts.iter().filter(|i| pred(i)).count()
    }

    /// Generate the summary string
    pub fn generate_summary(&mut self) {
        let fused = self.count(|i| matches!(i, VectorInst::Fmadd { .. }));
        let loads = self.count(|i| {
            matches!(
                i,
                VectorInst::Load { .. }
                    | VectorInst::Broadcast { .. }
                    | VectorInst::BroadcastPair { .. }
                    | VectorInst::LoadDup { .. }
                    | VectorInst::Gather { .. }
            )
        });
        let stores = self.count(|i| matches!(i, VectorInst::Store { .. }));
        let tile = match self.tile {
            Some(t) => format!("{}x{} vectors", t.rows, t.vecs),
            None => "none (no tile fit)".to_string(),
        };

        self.summary = format!(
            "Kernel Program Summary:\n\
             =======================\n\
             Layout: {:?}\n\
             Tile: {}\n\
             Instructions: {}\n\
             Fused multiply-adds: {}\n\
             Loads: {}\n\
             Stores: {}\n",
            self.layout,
            tile,
            self.insts.len(),
            fused,
            loads,
            stores,
        );
    }

    /// Export to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for KernelProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Kernel Program")?;
        writeln!(f, "==============")?;
        writeln!(f, "Layout: {:?}", self.layout)?;
        match self.tile {
            Some(t) => writeln!(f, "Tile: {} rows x {} vectors", t.rows, t.vecs)?,
            None => writeln!(f, "Tile: none (no tile fit)")?,
        }
        writeln!(f, "Instructions: {}", self.insts.len())?;
        writeln!(f)?;
        for (i, inst) in self.insts.iter().enumerate() {
            writeln!(f, "{i:4}:  {inst}")?;
        }
        Ok(())
    }
}
