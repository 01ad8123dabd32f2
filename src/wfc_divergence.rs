/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! Divergence analysis over the higher-level SSA IR.
//!
//! Computes for each value whether it is guaranteed uniform across the
//! lanes active at its definition.  Forward fixpoint over all blocks; the
//! lattice is uniform -> divergent, so transfer functions only ever set
//! bits and termination is immediate.

use crate::bitset::BitSet;
use crate::wfc_hir::*;

use log::debug;
use rustc_hash::FxHashMap;

struct DivergenceCtx<'a> {
    shader: &'a Shader,
    divergent: BitSet,
    def_site: Vec<Option<(usize, usize)>>,
    used_by_non_tex: BitSet,
    /// Memoizes "any enclosing if-condition up to the innermost loop is
    /// divergent" per control-flow node.  Cleared every sweep.
    cond_cache: FxHashMap<CfRef, bool>,
}

impl<'a> DivergenceCtx<'a> {
    fn new(shader: &'a Shader) -> Self {
        let num_values = shader.num_values() as usize;
        let mut def_site = vec![None; num_values];
        let mut used_by_non_tex = BitSet::with_capacity(num_values);

        for block in &shader.blocks {
            for (ip, instr) in block.instrs.iter().enumerate() {
                if let Some(def) = instr.def {
                    def_site[def as usize] = Some((block.index, ip));
                }
                match &instr.op {
                    HirOp::Tex { .. } => {}
                    HirOp::ParallelCopy { entries } => {
                        for (def, src) in entries {
                            def_site[*def as usize] = Some((block.index, ip));
                            used_by_non_tex.insert(*src as usize);
                        }
                    }
                    op => {
                        for_each_src(op, |val| {
                            used_by_non_tex.insert(val as usize);
                        });
                    }
                }
            }
        }

        DivergenceCtx {
            shader: shader,
            divergent: BitSet::with_capacity(num_values),
            def_site: def_site,
            used_by_non_tex: used_by_non_tex,
            cond_cache: FxHashMap::default(),
        }
    }

    fn is_divergent(&self, val: u32) -> bool {
        self.divergent.get(val as usize)
    }

    fn defined_by_undef(&self, val: u32) -> bool {
        match self.def_site[val as usize] {
            Some((b, i)) => matches!(
                self.shader.blocks[b].instrs[i].op,
                HirOp::Undef
            ),
            None => false,
        }
    }

    /// Walks from `node` outward until the innermost enclosing loop (or
    /// the root) and reports whether any if-condition on the way is
    /// divergent.
    fn enclosing_condition_divergent(&mut self, start: CfRef) -> bool {
        let mut path = Vec::new();
        let mut node = start;
        let result = loop {
            if let Some(&cached) = self.cond_cache.get(&node) {
                break cached;
            }
            match self.shader.cf_nodes[node].kind {
                CfNodeKind::Root | CfNodeKind::Loop { .. } => break false,
                CfNodeKind::If { condition } => {
                    path.push(node);
                    if self.is_divergent(condition) {
                        break true;
                    }
                    node = self.shader.cf_nodes[node].parent.unwrap();
                }
            }
        };
        for n in path {
            self.cond_cache.insert(n, result);
        }
        result
    }

    fn set_divergent(&mut self, val: u32) -> bool {
        self.divergent.insert(val as usize)
    }

    fn alu_src_is_divergent(&self, src: &AluSrc) -> bool {
        /* A swizzle into a value built by a vector-construction op only
         * depends on the selected component's source. */
        if let Some(comp) = src.swizzle {
            if let Some((b, i)) = self.def_site[src.val as usize] {
                if let HirOp::Vec { srcs } = &self.shader.blocks[b].instrs[i].op
                {
                    return self.is_divergent(srcs[comp as usize]);
                }
            }
        }
        self.is_divergent(src.val)
    }

    fn visit_alu(&mut self, def: u32, srcs: &[AluSrc]) -> bool {
        if self.is_divergent(def) {
            return false;
        }
        for src in srcs {
            if self.alu_src_is_divergent(src) {
                return self.set_divergent(def);
            }
        }
        false
    }

    fn visit_vec(&mut self, def: u32, srcs: &[u32]) -> bool {
        if self.is_divergent(def) {
            return false;
        }
        for src in srcs {
            if self.is_divergent(*src) {
                return self.set_divergent(def);
            }
        }
        false
    }

    fn visit_intrinsic(
        &mut self,
        def: Option<u32>,
        intrinsic: Intrinsic,
        srcs: &[u32],
    ) -> bool {
        let def = match def {
            Some(def) => def,
            None => return false,
        };
        if self.is_divergent(def) {
            return false;
        }
        let is_divergent = match intrinsic {
            Intrinsic::ShaderClock
            | Intrinsic::Ballot
            | Intrinsic::ReadInvocation
            | Intrinsic::ReadFirstInvocation
            | Intrinsic::VoteAny
            | Intrinsic::VoteAll
            | Intrinsic::VoteIeq
            | Intrinsic::VoteFeq
            | Intrinsic::Reduce
            | Intrinsic::LoadPushConstant
            | Intrinsic::ResourceIndex => false,
            Intrinsic::LoadUbo => {
                srcs.iter().any(|src| self.is_divergent(*src))
            }
            Intrinsic::LoadInterpolatedInput
            | Intrinsic::LoadBarycentricPixel
            | Intrinsic::Other => true,
        };
        if is_divergent {
            self.set_divergent(def)
        } else {
            false
        }
    }

    fn visit_tex(&mut self, def: u32, coord: u32) -> bool {
        if self.is_divergent(def) {
            return false;
        }
        if self.is_divergent(coord) {
            self.set_divergent(def)
        } else {
            false
        }
    }

    fn visit_phi(&mut self, block: &HirBlock, def: u32, srcs: &[PhiSrc]) -> bool {
        if self.is_divergent(def) {
            return false;
        }

        let mut non_undef = 0;
        for src in srcs {
            if self.is_divergent(src.val) {
                return self.set_divergent(def);
            }
            if !self.defined_by_undef(src.val) {
                non_undef += 1;
            }
        }
        /* all values but at most one undef: the result is uniform */
        if non_undef <= 1 {
            return false;
        }

        match block.prev_node {
            /* mu: no preceding node, the phi sits at a loop header */
            None => {
                let (pre_block, last_block) =
                    match self.shader.cf_nodes[block.parent].kind {
                        CfNodeKind::Loop {
                            pre_block,
                            last_block,
                        } => (pre_block, last_block),
                        _ => panic!("header phi outside a loop"),
                    };
                /* the incoming and back-edge operands are unconditional;
                 * every other operand re-enters the header through some
                 * condition which must be uniform */
                for src in srcs {
                    if src.pred == pre_block || src.pred == last_block {
                        continue;
                    }
                    let node = self.shader.blocks[src.pred].parent;
                    if self.enclosing_condition_divergent(node) {
                        return self.set_divergent(def);
                    }
                }
            }
            Some(prev) => match self.shader.cf_nodes[prev].kind {
                /* gamma: join of an if-then-else */
                CfNodeKind::If { condition } => {
                    if self.is_divergent(condition) {
                        return self.set_divergent(def);
                    }
                }
                /* eta: join behind a loop; every exit condition counts */
                CfNodeKind::Loop { .. } => {
                    for src in srcs {
                        let node = self.shader.blocks[src.pred].parent;
                        if self.enclosing_condition_divergent(node) {
                            return self.set_divergent(def);
                        }
                    }
                }
                CfNodeKind::Root => panic!("phi preceded by the root node"),
            },
        }
        false
    }

    fn visit_parallel_copy(&mut self, entries: &[(u32, u32)]) -> bool {
        let mut has_changed = false;
        for (def, src) in entries {
            if self.is_divergent(*def) {
                continue;
            }
            if self.is_divergent(*src) {
                has_changed |= self.set_divergent(*def);
            }
        }
        has_changed
    }

    fn visit_deref(&mut self, def: u32) -> bool {
        /* a deref feeding anything but texture instructions addresses
         * scalar memory and must stay uniform */
        if self.used_by_non_tex.get(def as usize) {
            return false;
        }
        self.set_divergent(def)
    }

    fn visit_instr(&mut self, block: &HirBlock, instr: &HirInstr) -> bool {
        match &instr.op {
            HirOp::Alu { srcs } => self.visit_alu(instr.def.unwrap(), srcs),
            HirOp::Vec { srcs } => self.visit_vec(instr.def.unwrap(), srcs),
            HirOp::Intrinsic { intrinsic, srcs } => {
                self.visit_intrinsic(instr.def, *intrinsic, srcs)
            }
            HirOp::Tex { coord, .. } => {
                self.visit_tex(instr.def.unwrap(), *coord)
            }
            HirOp::Phi { srcs } => {
                self.visit_phi(block, instr.def.unwrap(), srcs)
            }
            HirOp::ParallelCopy { entries } => {
                self.visit_parallel_copy(entries)
            }
            HirOp::LoadConst | HirOp::Undef => false,
            HirOp::Deref { .. } => self.visit_deref(instr.def.unwrap()),
        }
    }
}

fn for_each_src(op: &HirOp, mut f: impl FnMut(u32)) {
    match op {
        HirOp::Alu { srcs } => {
            for s in srcs {
                f(s.val);
            }
        }
        HirOp::Vec { srcs }
        | HirOp::Intrinsic { srcs, .. }
        | HirOp::Deref { srcs } => {
            for s in srcs {
                f(*s);
            }
        }
        HirOp::Tex { coord, srcs } => {
            f(*coord);
            for s in srcs {
                f(*s);
            }
        }
        HirOp::Phi { srcs } => {
            for s in srcs {
                f(s.val);
            }
        }
        HirOp::ParallelCopy { entries } => {
            for (_, s) in entries {
                f(*s);
            }
        }
        HirOp::LoadConst | HirOp::Undef => {}
    }
}

/// Returns a bitset indexed by value id: set means the value may differ
/// between lanes.
pub fn divergence_analysis(shader: &Shader) -> BitSet {
    let mut ctx = DivergenceCtx::new(shader);

    loop {
        ctx.cond_cache.clear();
        let mut changed = false;
        for block in &shader.blocks {
            for instr in &block.instrs {
                changed |= ctx.visit_instr(block, instr);
            }
        }
        if !changed {
            break;
        }
    }

    debug!(
        "divergence: {} of {} values divergent",
        (0..shader.num_values())
            .filter(|v| ctx.divergent.get(*v as usize))
            .count(),
        shader.num_values()
    );
    ctx.divergent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_value(shader: &mut Shader, block: usize) -> u32 {
        let v = shader.alloc_value();
        shader.push_instr(block, Some(v), HirOp::LoadConst);
        v
    }

    fn divergent_value(shader: &mut Shader, block: usize) -> u32 {
        let v = shader.alloc_value();
        shader.push_instr(
            block,
            Some(v),
            HirOp::Intrinsic {
                intrinsic: Intrinsic::Other,
                srcs: vec![],
            },
        );
        v
    }

    /// Uniform branch, uniform operands: the join phi stays uniform.
    #[test]
    fn uniform_if_join_phi_is_uniform() {
        let mut shader = Shader::new();
        let root = shader.root();
        let b0 = shader.add_block(root, None);
        let a = uniform_value(&mut shader, b0);
        let c = uniform_value(&mut shader, b0);

        let if_node =
            shader.add_cf_node(CfNodeKind::If { condition: c }, root);
        let b1 = shader.add_block(if_node, None);
        let b2 = shader.add_block(if_node, None);
        let zero = uniform_value(&mut shader, b2);

        let b3 = shader.add_block(root, Some(if_node));
        let phi = shader.alloc_value();
        shader.push_instr(
            b3,
            Some(phi),
            HirOp::Phi {
                srcs: vec![
                    PhiSrc { pred: b1, val: a },
                    PhiSrc { pred: b2, val: zero },
                ],
            },
        );

        let divergent = divergence_analysis(&shader);
        assert!(!divergent.get(phi as usize));
    }

    #[test]
    fn divergent_condition_makes_join_phi_divergent() {
        let mut shader = Shader::new();
        let root = shader.root();
        let b0 = shader.add_block(root, None);
        let a = uniform_value(&mut shader, b0);
        let c = divergent_value(&mut shader, b0);

        let if_node =
            shader.add_cf_node(CfNodeKind::If { condition: c }, root);
        let b1 = shader.add_block(if_node, None);
        let b2 = shader.add_block(if_node, None);
        let zero = uniform_value(&mut shader, b2);

        let b3 = shader.add_block(root, Some(if_node));
        let phi = shader.alloc_value();
        shader.push_instr(
            b3,
            Some(phi),
            HirOp::Phi {
                srcs: vec![
                    PhiSrc { pred: b1, val: a },
                    PhiSrc { pred: b2, val: zero },
                ],
            },
        );

        let divergent = divergence_analysis(&shader);
        assert!(divergent.get(phi as usize));
    }

    /// A loop-header phi whose extra operand re-enters through a
    /// divergent condition is divergent even though every operand value
    /// is uniform.
    #[test]
    fn loop_carry_under_divergent_condition_is_divergent() {
        let mut shader = Shader::new();
        let root = shader.root();
        let b0 = shader.add_block(root, None);
        let init = uniform_value(&mut shader, b0);
        let d = divergent_value(&mut shader, b0);

        /* blocks are created before the loop node so the indices are
         * known up front: b1 header, b2 continue block, b3 latch */
        let loop_node = shader.add_cf_node(
            CfNodeKind::Loop {
                pre_block: b0,
                last_block: 3,
            },
            root,
        );
        let b1 = shader.add_block(loop_node, None);
        let if_node =
            shader.add_cf_node(CfNodeKind::If { condition: d }, loop_node);
        let b2 = shader.add_block(if_node, None);
        let carried = uniform_value(&mut shader, b2);
        let b3 = shader.add_block(loop_node, Some(if_node));
        let latch_val = uniform_value(&mut shader, b3);
        assert_eq!(b3, 3);

        let phi = shader.alloc_value();
        shader.blocks[b1].instrs.insert(
            0,
            HirInstr {
                def: Some(phi),
                op: HirOp::Phi {
                    srcs: vec![
                        PhiSrc { pred: b0, val: init },
                        PhiSrc { pred: b3, val: latch_val },
                        PhiSrc { pred: b2, val: carried },
                    ],
                },
            },
        );

        let divergent = divergence_analysis(&shader);
        assert!(divergent.get(phi as usize));
        assert!(!divergent.get(init as usize));
        assert!(!divergent.get(carried as usize));
        assert!(!divergent.get(latch_val as usize));
    }

    #[test]
    fn swizzle_pierces_vector_construction() {
        let mut shader = Shader::new();
        let root = shader.root();
        let b0 = shader.add_block(root, None);
        let u = uniform_value(&mut shader, b0);
        let d = divergent_value(&mut shader, b0);

        let vec = shader.alloc_value();
        shader.push_instr(b0, Some(vec), HirOp::Vec { srcs: vec![u, d] });

        let lane0 = shader.alloc_value();
        shader.push_instr(
            b0,
            Some(lane0),
            HirOp::Alu {
                srcs: vec![AluSrc::swizzled(vec, 0)],
            },
        );
        let lane1 = shader.alloc_value();
        shader.push_instr(
            b0,
            Some(lane1),
            HirOp::Alu {
                srcs: vec![AluSrc::swizzled(vec, 1)],
            },
        );

        let divergent = divergence_analysis(&shader);
        assert!(divergent.get(vec as usize));
        assert!(!divergent.get(lane0 as usize));
        assert!(divergent.get(lane1 as usize));
    }

    #[test]
    fn deref_divergence_follows_uses() {
        let mut shader = Shader::new();
        let root = shader.root();
        let b0 = shader.add_block(root, None);

        let tex_only = shader.alloc_value();
        shader.push_instr(b0, Some(tex_only), HirOp::Deref { srcs: vec![] });
        let texel = shader.alloc_value();
        shader.push_instr(
            b0,
            Some(texel),
            HirOp::Tex {
                coord: tex_only,
                srcs: vec![tex_only],
            },
        );

        let scalar_use = shader.alloc_value();
        shader.push_instr(b0, Some(scalar_use), HirOp::Deref { srcs: vec![] });
        let loaded = shader.alloc_value();
        shader.push_instr(
            b0,
            Some(loaded),
            HirOp::Intrinsic {
                intrinsic: Intrinsic::LoadUbo,
                srcs: vec![scalar_use],
            },
        );

        let divergent = divergence_analysis(&shader);
        assert!(divergent.get(tex_only as usize));
        assert!(!divergent.get(scalar_use as usize));
        assert!(!divergent.get(loaded as usize));
    }

    #[test]
    fn ubo_load_inherits_address_divergence() {
        let mut shader = Shader::new();
        let root = shader.root();
        let b0 = shader.add_block(root, None);
        let addr = divergent_value(&mut shader, b0);

        let loaded = shader.alloc_value();
        shader.push_instr(
            b0,
            Some(loaded),
            HirOp::Intrinsic {
                intrinsic: Intrinsic::LoadUbo,
                srcs: vec![addr],
            },
        );
        let ballot = shader.alloc_value();
        shader.push_instr(
            b0,
            Some(ballot),
            HirOp::Intrinsic {
                intrinsic: Intrinsic::Ballot,
                srcs: vec![addr],
            },
        );

        let divergent = divergence_analysis(&shader);
        assert!(divergent.get(loaded as usize));
        assert!(!divergent.get(ballot as usize));
    }
}
