//! Kernel configuration as supplied by the host compiler
//!
//! A [`KernelSpec`] is constructed once per kernel-instantiation request
//! and is immutable for the duration of one code-emission call.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::isa::NATIVE_LANES;

/// Tiling/addressing strategy for one kernel body
///
/// The variant set is fixed; dispatch is a closed match, not subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutKind {
    /// `C += A B`, row-major operands
    Plain,
    /// `C += Aᵗ B`, pair-broadcast over adjacent A rows
    TransposedLeft,
    /// `C += A Bᵗ`, gathered B columns
    TransposedRight,
    /// Pre-packed A/B panels
    Packed,
    /// Pre-packed panels, always 2-row interleaved
    InterleavedPacked,
}

impl LayoutKind {
    /// Map the host's kernel-type code. Code 3 is reserved.
    pub fn from_code(code: u8) -> KernelResult<Self> {
        match code {
            0 => Ok(LayoutKind::Plain),
            1 => Ok(LayoutKind::TransposedLeft),
            2 => Ok(LayoutKind::TransposedRight),
            4 => Ok(LayoutKind::Packed),
            5 => Ok(LayoutKind::InterleavedPacked),
            3 => Err(KernelError::spec("kernel type 3 is reserved")),
            other => Err(KernelError::spec(format!("unknown kernel type {other}"))),
        }
    }

    /// K-steps emitted per main-loop iteration
    pub fn unroll_factor(self) -> usize {
        match self {
            LayoutKind::Plain | LayoutKind::TransposedLeft => 4,
            LayoutKind::TransposedRight => 2,
            LayoutKind::Packed | LayoutKind::InterleavedPacked => 8,
        }
    }

    /// Prefetch distance in elements ahead of the B stream; the remainder
    /// loop always runs with distance zero
    pub fn prefetch_distance(self) -> i64 {
        match self {
            LayoutKind::Plain | LayoutKind::TransposedLeft => 64,
            LayoutKind::TransposedRight => 0,
            LayoutKind::Packed | LayoutKind::InterleavedPacked => 16,
        }
    }

    /// Does the strategy read operands through packed-panel addressing?
    pub fn is_packed(self) -> bool {
        matches!(self, LayoutKind::Packed | LayoutKind::InterleavedPacked)
    }

    /// Can the tile-shape ladder offer this layout `rows` output rows?
    pub fn accepts_rows(self, rows: usize) -> bool {
        match self {
            LayoutKind::InterleavedPacked => rows % 2 == 0,
            _ => rows >= 1,
        }
    }
}

/// How a variable argument is materialized into registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarArgKind {
    Unused,
    /// One scalar per A-row, broadcast; hoisted above the K loop
    RowBroadcast,
    /// One full vector per B-column block; hoisted above the K loop
    ColVector,
    /// One scalar per output cell, broadcast; re-fetched in the innermost loop
    PerCell,
}

impl VarArgKind {
    pub fn from_code(code: u8) -> KernelResult<Self> {
        match code {
            0 => Ok(VarArgKind::Unused),
            1 => Ok(VarArgKind::RowBroadcast),
            2 => Ok(VarArgKind::ColVector),
            3 => Ok(VarArgKind::PerCell),
            other => Err(KernelError::spec(format!(
                "unknown variable-argument property {other}"
            ))),
        }
    }
}

/// Configuration for one kernel-instantiation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpec {
    pub layout: LayoutKind,
    /// M-tile length in output rows
    pub a_len: usize,
    /// N-tile width in vector registers (raw lanes / `NATIVE_LANES`)
    pub b_len: usize,
    pub m_length: usize,
    pub k_length: usize,
    pub n_length: usize,
    /// Current tile origin
    pub i_pos: usize,
    pub k_pos: usize,
    pub j_pos: usize,
    /// K range covered by one kernel call before accumulating to memory
    pub k_panel: usize,
    pub const_args: Vec<f64>,
    pub var_args: Vec<VarArgKind>,
    /// Panel depth for packed variants
    pub pack_factor: usize,
    /// Element alignment offset of the packed A buffer
    pub a_align: usize,
    /// Element alignment offset of the packed B buffer
    pub b_align: usize,
}

impl KernelSpec {
    /// Build a spec from host units. `b_lanes` is given in raw lanes and
    /// must be a multiple of the native lane count.
    pub fn new(
        layout: LayoutKind,
        a_len: usize,
        b_lanes: usize,
        dims: (usize, usize, usize),
    ) -> KernelResult<Self> {
        if b_lanes == 0 || b_lanes % NATIVE_LANES != 0 {
            return Err(KernelError::spec(format!(
                "bLength {b_lanes} is not a positive multiple of {NATIVE_LANES} lanes"
            )));
        }
        let (m_length, k_length, n_length) = dims;
        Ok(Self {
            layout,
            a_len,
            b_len: b_lanes / NATIVE_LANES,
            m_length,
            k_length,
            n_length,
            i_pos: 0,
            k_pos: 0,
            j_pos: 0,
            k_panel: k_length,
            const_args: Vec::new(),
            var_args: Vec::new(),
            pack_factor: 0,
            a_align: 0,
            b_align: 0,
        })
    }

    /// Convenience constructor for the plain layout
    pub fn plain(a_len: usize, b_lanes: usize, dims: (usize, usize, usize)) -> KernelResult<Self> {
        Self::new(LayoutKind::Plain, a_len, b_lanes, dims)
    }

    /// Build from the raw host request: kernel-type code, variable-argument
    /// property codes and, for packed variants,
    /// `misc_args = [pack_factor, a_align, b_align]`.
    pub fn from_host(
        kernel_type: u8,
        a_len: usize,
        b_lanes: usize,
        dims: (usize, usize, usize),
        const_args: Vec<f64>,
        var_codes: &[u8],
        misc_args: &[usize],
    ) -> KernelResult<Self> {
        let layout = LayoutKind::from_code(kernel_type)?;
        let mut spec = Self::new(layout, a_len, b_lanes, dims)?;
        spec.const_args = const_args;
        spec.var_args = var_codes
            .iter()
            .map(|&c| VarArgKind::from_code(c))
            .collect::<KernelResult<_>>()?;
        if layout.is_packed() {
            match misc_args {
                [pack, a_align, b_align] => {
                    spec.pack_factor = *pack;
                    spec.a_align = *a_align;
                    spec.b_align = *b_align;
                }
                _ => {
                    return Err(KernelError::spec(
                        "packed layouts need miscArgs = [packFactor, aAlignment, bAlignment]",
                    ))
                }
            }
        }
        Ok(spec)
    }

    /// Does any variable argument use per-cell materialization?
    pub fn has_per_cell_var(&self) -> bool {
        self.var_args.iter().any(|v| matches!(v, VarArgKind::PerCell))
    }

    /// Check internal consistency. Violations are configuration errors.
    pub fn validate(&self) -> KernelResult<()> {
        if self.a_len == 0 {
            return Err(KernelError::spec("aLength must be at least 1"));
        }
        if self.b_len == 0 {
            return Err(KernelError::spec("bLength must cover at least one vector"));
        }
        if self.m_length == 0 || self.k_length == 0 || self.n_length == 0 {
            return Err(KernelError::spec("matrix dimensions must be positive"));
        }
        if self.k_pos >= self.k_length {
            return Err(KernelError::spec(format!(
                "kPos {} lies past kLength {}",
                self.k_pos, self.k_length
            )));
        }
        if self.const_args.len() > 32 {
            return Err(KernelError::spec("at most 32 constant arguments are addressable"));
        }
        if self.var_args.len() > 32 {
            return Err(KernelError::spec("at most 32 variable arguments are addressable"));
        }
        if self.layout.is_packed() && self.pack_factor == 0 {
            return Err(KernelError::spec("packed layouts need a positive packFactor"));
        }
        if self.layout == LayoutKind::InterleavedPacked && self.has_per_cell_var() {
            // duplicated lanes would duplicate per-cell reads
            return Err(KernelError::spec(
                "InterleavedPacked cannot carry per-cell variable arguments",
            ));
        }
        Ok(())
    }

    /// Panel clamp: restrict the K range to `[kPos, kLength)`.
    pub fn clamped(&self) -> Self {
        let mut spec = self.clone();
        spec.k_panel = spec.k_panel.min(spec.k_length - spec.k_pos);
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_codes() {
        assert_eq!(LayoutKind::from_code(0).unwrap(), LayoutKind::Plain);
        assert_eq!(LayoutKind::from_code(5).unwrap(), LayoutKind::InterleavedPacked);
        assert!(LayoutKind::from_code(3).is_err());
        assert!(LayoutKind::from_code(9).is_err());
    }

    #[test]
    fn test_lane_division() {
        let spec = KernelSpec::plain(4, 24, (64, 64, 64)).unwrap();
        assert_eq!(spec.b_len, 3);
        assert!(KernelSpec::plain(4, 12, (64, 64, 64)).is_err());
    }

    #[test]
    fn test_panel_clamp() {
        let mut spec = KernelSpec::plain(4, 8, (64, 64, 64)).unwrap();
        spec.k_pos = 60;
        spec.k_panel = 16;
        assert_eq!(spec.clamped().k_panel, 4);
    }

    #[test]
    fn test_packed_needs_misc_args() {
        let err = KernelSpec::from_host(4, 4, 8, (64, 64, 64), vec![], &[], &[]);
        assert!(err.is_err());

        let spec =
            KernelSpec::from_host(4, 4, 8, (64, 64, 64), vec![], &[], &[8, 0, 64]).unwrap();
        assert_eq!(spec.pack_factor, 8);
        assert_eq!(spec.b_align, 64);
    }

    #[test]
    fn test_interleaved_rejects_per_cell() {
        let mut spec =
            KernelSpec::new(LayoutKind::InterleavedPacked, 4, 8, (64, 64, 64)).unwrap();
        spec.pack_factor = 8;
        spec.var_args = vec![VarArgKind::PerCell];
        assert!(spec.validate().is_err());

        spec.var_args = vec![VarArgKind::RowBroadcast];
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_interleaved_row_acceptance() {
        assert!(LayoutKind::InterleavedPacked.accepts_rows(4));
        assert!(!LayoutKind::InterleavedPacked.accepts_rows(3));
        assert!(LayoutKind::Plain.accepts_rows(1));
    }
}
