/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! The higher-level SSA IR the divergence analysis runs on.
//!
//! This is the shape of the program before instruction selection: blocks
//! hang off a structured control-flow tree (root / if / loop), values are
//! dense SSA ids and instruction kinds are coarse.  Only what the
//! divergence rules need survives here; everything else belongs to the
//! low-level IR in `wfc_ir`.

/// Index of a control-flow tree node.
pub type CfRef = usize;

#[derive(Clone, Debug)]
pub enum CfNodeKind {
    Root,
    If {
        condition: u32,
    },
    /// `pre_block` is the block preceding the loop, `last_block` the
    /// final block of the body (source of the back edge).
    Loop {
        pre_block: usize,
        last_block: usize,
    },
}

#[derive(Clone, Debug)]
pub struct CfNode {
    pub kind: CfNodeKind,
    pub parent: Option<CfRef>,
}

#[derive(Clone, Copy, Debug)]
pub struct AluSrc {
    pub val: u32,
    /// Component read out of a multi-component value, if the source is
    /// swizzled down to one component.
    pub swizzle: Option<u8>,
}

impl AluSrc {
    pub fn new(val: u32) -> AluSrc {
        AluSrc {
            val: val,
            swizzle: None,
        }
    }

    pub fn swizzled(val: u32, comp: u8) -> AluSrc {
        AluSrc {
            val: val,
            swizzle: Some(comp),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Intrinsic {
    Ballot,
    ReadInvocation,
    ReadFirstInvocation,
    VoteAny,
    VoteAll,
    VoteIeq,
    VoteFeq,
    Reduce,
    LoadPushConstant,
    ResourceIndex,
    ShaderClock,
    LoadUbo,
    LoadInterpolatedInput,
    LoadBarycentricPixel,
    Other,
}

#[derive(Clone, Debug)]
pub struct PhiSrc {
    pub pred: usize,
    pub val: u32,
}

#[derive(Clone, Debug)]
pub enum HirOp {
    Alu { srcs: Vec<AluSrc> },
    /// Vector construction; the swizzle rule pierces through these.
    Vec { srcs: Vec<u32> },
    Intrinsic { intrinsic: Intrinsic, srcs: Vec<u32> },
    Tex { coord: u32, srcs: Vec<u32> },
    Phi { srcs: Vec<PhiSrc> },
    ParallelCopy { entries: Vec<(u32, u32)> },
    LoadConst,
    Undef,
    Deref { srcs: Vec<u32> },
}

#[derive(Clone, Debug)]
pub struct HirInstr {
    /// Defined value id, if the instruction has a result.  Parallel
    /// copies define through their entries instead.
    pub def: Option<u32>,
    pub op: HirOp,
}

#[derive(Clone, Debug)]
pub struct HirBlock {
    pub index: usize,
    pub parent: CfRef,
    /// The control-flow node immediately preceding this block on the same
    /// nesting level, if any.  A block opening a loop body has none.
    pub prev_node: Option<CfRef>,
    pub instrs: Vec<HirInstr>,
}

pub struct Shader {
    pub blocks: Vec<HirBlock>,
    pub cf_nodes: Vec<CfNode>,
    num_values: u32,
}

impl Shader {
    pub fn new() -> Shader {
        Shader {
            blocks: Vec::new(),
            cf_nodes: vec![CfNode {
                kind: CfNodeKind::Root,
                parent: None,
            }],
            num_values: 0,
        }
    }

    pub fn root(&self) -> CfRef {
        0
    }

    pub fn add_cf_node(&mut self, kind: CfNodeKind, parent: CfRef) -> CfRef {
        self.cf_nodes.push(CfNode {
            kind: kind,
            parent: Some(parent),
        });
        self.cf_nodes.len() - 1
    }

    pub fn add_block(
        &mut self,
        parent: CfRef,
        prev_node: Option<CfRef>,
    ) -> usize {
        let index = self.blocks.len();
        self.blocks.push(HirBlock {
            index: index,
            parent: parent,
            prev_node: prev_node,
            instrs: Vec::new(),
        });
        index
    }

    pub fn alloc_value(&mut self) -> u32 {
        let v = self.num_values;
        self.num_values += 1;
        v
    }

    pub fn num_values(&self) -> u32 {
        self.num_values
    }

    pub fn push_instr(&mut self, block: usize, def: Option<u32>, op: HirOp) {
        self.blocks[block].instrs.push(HirInstr { def: def, op: op });
    }
}
