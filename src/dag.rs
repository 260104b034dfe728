//! Expression DAG builder
//!
//! Parses a bytecode stream into a shared, de-duplicated expression
//! graph. Sharing is purely syntactic: two subtrees collapse to one node
//! exactly when their operation and (already-shared) children coincide,
//! which is equivalent to canonical-string equality without building
//! strings. `parent_count` records the fan-in produced by this sharing
//! and later drives register freeing in the scheduler.

use std::collections::HashMap;

use crate::error::{KernelError, KernelResult};
use crate::opcode::{ArgKind, ArithKind, Bytecode, CompareKind, Cursor, OpToken};

/// Index of a node in the DAG arena
pub type NodeId = usize;

/// A fully resolved operand reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgRef {
    A,
    B,
    C,
    Const(u8),
    Var(u8),
    Reg(u8),
    Mask,
}

/// A DAG node operation, including the ARGREF index where present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Arith(ArithKind),
    Masked(ArithKind),
    Compare(CompareKind),
    Arg(ArgRef),
}

/// One node of the expression DAG
#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    /// Unique id, insertion (postorder) order
    pub id: NodeId,
    pub op: Op,
    /// 0, 1, 2 or 3 children; shared references into the arena
    pub children: Vec<NodeId>,
    /// Number of distinct parent edges pointing at this node
    pub parent_count: u32,
    /// Sethi-Ullman number; assigned once after parsing
    pub label: u32,
}

impl ExprNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A parsed, de-duplicated expression DAG
#[derive(Debug, Clone)]
pub struct ExprDag {
    nodes: Vec<ExprNode>,
    root: NodeId,
}

impl ExprDag {
    /// Parse a bytecode stream into a DAG.
    ///
    /// Fails if the stream is exhausted mid-parse or if tokens remain
    /// after the root is built. Labels are assigned before returning.
    pub fn build(bytecode: &Bytecode) -> KernelResult<Self> {
        let mut cursor = bytecode.cursor();
        let mut builder = Builder {
            nodes: Vec::new(),
            dedup: HashMap::new(),
        };
        let root = builder.parse(&mut cursor)?;
        if cursor.remaining() > 0 {
            return Err(KernelError::bytecode(
                cursor.pos(),
                format!("{} unconsumed tokens after root", cursor.remaining()),
            ));
        }
        let mut dag = Self { nodes: builder.nodes, root };
        dag.assign_labels();
        Ok(dag)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &ExprNode {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ExprNode> {
        self.nodes.iter()
    }

    /// Assign Sethi-Ullman labels: leaves get 1; an interior node gets
    /// `max + 1` when all children carry one label, `max` otherwise.
    ///
    /// Ids are postorder, so a single forward pass sees every child
    /// before its parents. Re-running on an unmodified DAG is a no-op.
    pub fn assign_labels(&mut self) {
        for id in 0..self.nodes.len() {
            let label = if self.nodes[id].children.is_empty() {
                1
            } else {
                let labels: Vec<u32> = self.nodes[id]
                    .children
                    .iter()
                    .map(|&c| self.nodes[c].label)
                    .collect();
                let max = *labels.iter().max().unwrap_or(&1);
                if labels.iter().all(|&l| l == max) {
                    max + 1
                } else {
                    max
                }
            };
            self.nodes[id].label = label;
        }
    }

    /// Does any node reference constant argument `index`?
    pub fn uses_const(&self, index: u8) -> bool {
        self.nodes
            .iter()
            .any(|n| n.op == Op::Arg(ArgRef::Const(index)))
    }

    /// Does any node reference variable argument `index`?
    pub fn uses_var(&self, index: u8) -> bool {
        self.nodes
            .iter()
            .any(|n| n.op == Op::Arg(ArgRef::Var(index)))
    }

    /// All constant-argument indices referenced by the DAG
    pub fn const_refs(&self) -> Vec<u8> {
        let mut refs: Vec<u8> = self
            .nodes
            .iter()
            .filter_map(|n| match n.op {
                Op::Arg(ArgRef::Const(i)) => Some(i),
                _ => None,
            })
            .collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }

    /// All variable-argument indices referenced by the DAG
    pub fn var_refs(&self) -> Vec<u8> {
        let mut refs: Vec<u8> = self
            .nodes
            .iter()
            .filter_map(|n| match n.op {
                Op::Arg(ArgRef::Var(i)) => Some(i),
                _ => None,
            })
            .collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}

struct Builder {
    nodes: Vec<ExprNode>,
    /// Hash-consing table: (op, shared child ids) -> node
    dedup: HashMap<(Op, Vec<NodeId>), NodeId>,
}

impl Builder {
    /// Recursive-descent prefix parse: an operation token followed by its
    /// operand subtrees, left to right.
    fn parse(&mut self, cursor: &mut Cursor<'_>) -> KernelResult<NodeId> {
        let at = cursor.pos();
        let (token, index) = cursor.next_op()?;

        let op = match token {
            OpToken::Arith(k) => Op::Arith(k),
            OpToken::Masked(k) => Op::Masked(k),
            OpToken::Compare(k) => Op::Compare(k),
            OpToken::Arg(kind) => Op::Arg(match kind {
                ArgKind::A => ArgRef::A,
                ArgKind::B => ArgRef::B,
                ArgKind::C => ArgRef::C,
                ArgKind::MaskReg => ArgRef::Mask,
                ArgKind::ConstArg => ArgRef::Const(expect_index(index, at)?),
                ArgKind::VariableArg => ArgRef::Var(expect_index(index, at)?),
                ArgKind::Reg => ArgRef::Reg(expect_index(index, at)?),
            }),
        };

        let mut children = Vec::with_capacity(token.child_count());
        for _ in 0..token.child_count() {
            children.push(self.parse(cursor)?);
        }

        Ok(self.intern(op, children))
    }

    /// Insert a candidate node, collapsing it onto a structurally
    /// identical existing node when one exists. Parent counts on children
    /// only grow when a new parent edge is actually created.
    fn intern(&mut self, op: Op, children: Vec<NodeId>) -> NodeId {
        let key = (op, children.clone());
        if let Some(&existing) = self.dedup.get(&key) {
            return existing;
        }
        let id = self.nodes.len();
        for &child in &children {
            self.nodes[child].parent_count += 1;
        }
        self.nodes.push(ExprNode {
            id,
            op,
            children,
            parent_count: 0,
            label: 0,
        });
        self.dedup.insert(key, id);
        id
    }
}

fn expect_index(index: Option<u8>, position: usize) -> KernelResult<u8> {
    index.ok_or_else(|| KernelError::bytecode(position, "argument reference lost its index"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    fn dag(src: &str) -> ExprDag {
        ExprDag::build(&assemble(src).unwrap()).unwrap()
    }

    #[test]
    fn test_fmadd_shape() {
        let d = dag("fmadd(c, a, b)");
        assert_eq!(d.len(), 4);
        let root = d.node(d.root());
        assert_eq!(root.op, Op::Arith(ArithKind::Fmadd));
        assert_eq!(root.children.len(), 3);
        assert_eq!(d.node(root.children[0]).op, Op::Arg(ArgRef::C));
    }

    #[test]
    fn test_cse_collapses_identical_subtrees() {
        // mul(a, b) appears twice and must be one node
        let d = dag("add(mul(a, b), mul(a, b))");
        let muls: Vec<_> = d
            .nodes()
            .filter(|n| n.op == Op::Arith(ArithKind::Mul))
            .collect();
        assert_eq!(muls.len(), 1);
        assert_eq!(muls[0].parent_count, 2);

        let root = d.node(d.root());
        assert_eq!(root.children[0], root.children[1]);
    }

    #[test]
    fn test_cse_distinguishes_arg_indices() {
        let d = dag("add(const[0], const[1])");
        assert_eq!(d.len(), 3);
        let root = d.node(d.root());
        assert_ne!(root.children[0], root.children[1]);
    }

    #[test]
    fn test_shared_leaf_parent_count() {
        // `a` feeds both the mul and the sub
        let d = dag("sub(mul(a, b), a)");
        let a = d
            .nodes()
            .find(|n| n.op == Op::Arg(ArgRef::A))
            .unwrap();
        assert_eq!(a.parent_count, 2);
    }

    #[test]
    fn test_labels() {
        // mul(a, b): equal child labels 1 -> 2; add(mul, const): max(2, 1) -> 2
        let d = dag("add(mul(a, b), const[0])");
        let root = d.node(d.root());
        assert_eq!(root.label, 2);
        assert_eq!(d.node(root.children[0]).label, 2);
        assert_eq!(d.node(root.children[1]).label, 1);

        for n in d.nodes() {
            if n.is_leaf() {
                assert_eq!(n.label, 1);
            }
        }
    }

    #[test]
    fn test_labeling_idempotent() {
        let mut d = dag("fmadd(c, mul(a, b), add(a, b))");
        let before: Vec<u32> = d.nodes().map(|n| n.label).collect();
        d.assign_labels();
        let after: Vec<u32> = d.nodes().map(|n| n.label).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_three_child_label() {
        // all three children are leaves with label 1 -> 2
        let d = dag("fmadd(c, a, b)");
        assert_eq!(d.node(d.root()).label, 2);
    }

    #[test]
    fn test_truncated_stream() {
        let bc = assemble("fmadd(c, a, b)").unwrap();
        let mut codes: Vec<u8> = Vec::new();
        let mut cur = bc.cursor();
        while cur.remaining() > 1 {
            codes.push(cur.next_code().unwrap());
        }
        let truncated = Bytecode::from_codes(codes).unwrap();
        assert!(matches!(
            ExprDag::build(&truncated),
            Err(KernelError::Bytecode { .. })
        ));
    }

    #[test]
    fn test_trailing_tokens() {
        let bc = assemble("mul(a, b)").unwrap();
        let mut codes = Vec::new();
        let mut cur = bc.cursor();
        while cur.remaining() > 0 {
            codes.push(cur.next_code().unwrap());
        }
        codes.push(OpToken::Arg(ArgKind::A).encode());
        let extended = Bytecode::from_codes(codes).unwrap();
        assert!(matches!(
            ExprDag::build(&extended),
            Err(KernelError::Bytecode { .. })
        ));
    }

    #[test]
    fn test_arg_queries() {
        let d = dag("masked_add(gt(a, b), var[1], const[2])");
        assert!(d.uses_var(1));
        assert!(!d.uses_var(0));
        assert_eq!(d.const_refs(), vec![2]);
        assert_eq!(d.var_refs(), vec![1]);
    }
}
