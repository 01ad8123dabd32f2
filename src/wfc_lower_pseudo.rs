/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! Pseudo-instruction elimination after register allocation.
//!
//! Phis dissolve into one parallel copy per incoming edge.  Each
//! parallel copy then lowers to plain moves that honor its simultaneous
//! semantics: the copy graph has in-degree at most one per destination,
//! so after peeling all reads-completed destinations only cycles remain,
//! and every cycle is rotated through one scratch register just past the
//! allocation bound of its bank.  Linear-vgpr lifetime markers vanish
//! and branch pseudos become architectural scalar branches.

use crate::wfc_ir::*;

use log::debug;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::mem;

struct CopyNode {
    num_reads: usize,
    src: i32,
}

struct CopyGraph {
    nodes: Vec<CopyNode>,
}

impl CopyGraph {
    fn new() -> CopyGraph {
        CopyGraph { nodes: Vec::new() }
    }

    fn add_node(&mut self) -> usize {
        self.nodes.push(CopyNode {
            num_reads: 0,
            src: -1,
        });
        self.nodes.len() - 1
    }

    fn num_reads(&self, node_idx: usize) -> usize {
        self.nodes[node_idx].num_reads
    }

    fn src(&self, node_idx: usize) -> Option<usize> {
        if self.nodes[node_idx].src < 0 {
            None
        } else {
            Some(self.nodes[node_idx].src as usize)
        }
    }

    fn add_edge(&mut self, dst_idx: usize, src_idx: usize) {
        /* no self-loops, in-degree at most 1 */
        assert!(dst_idx != src_idx);
        assert!(self.nodes[dst_idx].src == -1);
        self.nodes[dst_idx].src = src_idx as i32;
        self.nodes[src_idx].num_reads += 1;
    }

    /// Returns true when the source node has no reads left.
    fn del_edge(&mut self, dst_idx: usize, src_idx: usize) -> bool {
        assert!(self.nodes[dst_idx].src >= 0);
        self.nodes[dst_idx].src = -1;
        self.nodes[src_idx].num_reads -= 1;
        self.nodes[src_idx].num_reads == 0
    }
}

#[derive(Clone, Copy)]
enum CopyVal {
    Reg(PhysReg, RegBank),
    Const(Operand),
    Undef,
}

fn mov_to(dst: PhysReg, bank: RegBank, src: Operand) -> Instruction {
    let rc = match bank {
        RegBank::Sgpr => RegClass::Sgpr(1),
        RegBank::Vgpr => RegClass::Vgpr(1),
    };
    match bank {
        RegBank::Sgpr => Instruction::new(
            Opcode::SMovB32,
            Format::SOP1,
            vec![src],
            vec![Definition::phys(dst, rc)],
        ),
        RegBank::Vgpr => Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![src],
            vec![Definition::phys(dst, rc)],
        ),
    }
}

fn val_operand(val: CopyVal) -> Operand {
    match val {
        CopyVal::Reg(reg, bank) => {
            let rc = match bank {
                RegBank::Sgpr => RegClass::Sgpr(1),
                RegBank::Vgpr => RegClass::Vgpr(1),
            };
            Operand::phys(reg, rc)
        }
        CopyVal::Const(op) => op,
        CopyVal::Undef => Operand::undef(),
    }
}

/// Register just past the allocation bound, usable to rotate copy
/// cycles without clobbering a live value.
fn scratch_reg(config: &Config, bank: RegBank) -> PhysReg {
    match bank {
        RegBank::Sgpr => {
            let idx = (config.num_sgprs - 2) as u32;
            PhysReg::sgpr(idx)
        }
        RegBank::Vgpr => {
            assert!(config.num_vgprs < 256, "no free vector scratch");
            PhysReg::vgpr(config.num_vgprs as u32)
        }
    }
}

fn lower_parallel_copy(
    pc: &Instruction,
    config: &Config,
) -> Vec<Instruction> {
    let mut graph = CopyGraph::new();
    let mut vals: Vec<CopyVal> = Vec::new();
    let mut dst_bank: Vec<RegBank> = Vec::new();
    let mut reg_to_idx: FxHashMap<u32, usize> = FxHashMap::default();

    /* split everything into dword entries; destinations must be
     * pairwise distinct and come first so a source reused as a
     * destination maps to the same node */
    let mut num_dsts = 0;
    for def in pc.definitions.iter() {
        let bank = def.reg_class().bank();
        for j in 0..def.size() {
            let dst = PhysReg(def.phys_reg().0 + j);
            assert!(!reg_to_idx.contains_key(&dst.0), "duplicate copy dst");
            let node_idx = graph.add_node();
            assert!(node_idx == num_dsts && vals.len() == num_dsts);
            vals.push(CopyVal::Reg(dst, bank));
            dst_bank.push(bank);
            reg_to_idx.insert(dst.0, node_idx);
            num_dsts += 1;
        }
    }

    let mut src_indices: Vec<usize> = Vec::new();
    for (op, def) in pc.operands.iter().zip(pc.definitions.iter()) {
        for j in 0..def.size() {
            let src_idx = if !op.is_constant() && !op.is_undefined() {
                let src = PhysReg(op.phys_reg().0 + j);
                let bank = def.reg_class().bank();
                *reg_to_idx.entry(src.0).or_insert_with(|| {
                    let node_idx = graph.add_node();
                    assert!(node_idx == vals.len());
                    vals.push(CopyVal::Reg(src, bank));
                    node_idx
                })
            } else {
                let node_idx = graph.add_node();
                assert!(node_idx == vals.len());
                vals.push(if op.is_constant() {
                    CopyVal::Const(*op)
                } else {
                    CopyVal::Undef
                });
                node_idx
            };
            src_indices.push(src_idx);
        }
    }

    let mut dst_idx = 0;
    for (_, def) in pc.operands.iter().zip(pc.definitions.iter()) {
        for _ in 0..def.size() {
            let src_idx = src_indices[dst_idx];
            if dst_idx != src_idx {
                graph.add_edge(dst_idx, src_idx);
            }
            dst_idx += 1;
        }
    }

    let mut instrs = Vec::new();

    /* peel destinations nothing reads anymore */
    let mut ready: Vec<usize> = (0..num_dsts)
        .filter(|i| graph.num_reads(*i) == 0)
        .collect();
    while let Some(dst_idx) = ready.pop() {
        if let Some(src_idx) = graph.src(dst_idx) {
            let dst = match vals[dst_idx] {
                CopyVal::Reg(reg, _) => reg,
                _ => unreachable!(),
            };
            instrs.push(mov_to(dst, dst_bank[dst_idx], val_operand(vals[src_idx])));
            if graph.del_edge(dst_idx, src_idx) && src_idx < num_dsts {
                ready.push(src_idx);
            }
        }
    }

    /* only cycles remain; rotate each through the scratch register */
    for i in 0..num_dsts {
        if graph.src(i).is_none() {
            continue;
        }
        let bank = dst_bank[i];
        let scratch = scratch_reg(config, bank);

        /* scratch saves the value this cycle finally needs */
        let first_src = graph.src(i).unwrap();
        instrs.push(mov_to(scratch, bank, val_operand(vals[first_src])));
        let mut dst_idx = i;
        let mut src_idx = first_src;
        graph.del_edge(dst_idx, src_idx);

        /* shift the rest of the cycle one step */
        while let Some(next) = graph.src(src_idx) {
            dst_idx = src_idx;
            src_idx = next;
            let dst = match vals[dst_idx] {
                CopyVal::Reg(reg, _) => reg,
                _ => unreachable!(),
            };
            instrs.push(mov_to(dst, bank, val_operand(vals[src_idx])));
            graph.del_edge(dst_idx, src_idx);
        }

        let last = match vals[src_idx] {
            CopyVal::Reg(reg, _) => reg,
            _ => unreachable!(),
        };
        instrs.push(mov_to(
            last,
            bank,
            Operand::phys(
                scratch,
                match bank {
                    RegBank::Sgpr => RegClass::Sgpr(1),
                    RegBank::Vgpr => RegClass::Vgpr(1),
                },
            ),
        ));
    }

    instrs
}

/// Rewrites every phi as entries of a parallel copy at the end of each
/// predecessor (vector values in front of `logical_end`, the rest in
/// front of the branch).
fn eliminate_phis(program: &mut Program) {
    let mut eliminated = 0_u32;
    for block_idx in 0..program.blocks.len() {
        let num_phis = program.blocks[block_idx]
            .instructions
            .iter()
            .take_while(|i| i.is_phi())
            .count();
        if num_phis == 0 {
            continue;
        }
        let phis: Vec<Instruction> = program.blocks[block_idx]
            .instructions
            .drain(0..num_phis)
            .collect();
        eliminated += phis.len() as u32;

        let mut edge_copies: BTreeMap<(usize, bool), Vec<(Operand, Definition)>> =
            BTreeMap::new();
        for phi in phis {
            let logical = phi.opcode == Opcode::Phi;
            let preds = if logical {
                program.blocks[block_idx].logical_preds.clone()
            } else {
                program.blocks[block_idx].linear_preds.clone()
            };
            assert!(phi.operands.len() == preds.len());
            for (i, op) in phi.operands.iter().enumerate() {
                if op.is_undefined() {
                    continue;
                }
                /* already coalesced into place */
                if op.phys_reg() == phi.definitions[0].phys_reg() {
                    continue;
                }
                edge_copies
                    .entry((preds[i] as usize, logical))
                    .or_default()
                    .push((*op, phi.definitions[0]));
            }
        }

        for ((pred, logical), copies) in edge_copies {
            let (ops, defs): (Vec<Operand>, Vec<Definition>) =
                copies.into_iter().unzip();
            let pc = Instruction::new(
                Opcode::ParallelCopy,
                Format::PSEUDO,
                ops,
                defs,
            );
            if logical {
                program.blocks[pred].insert_before_logical_end(pc);
            } else {
                program.blocks[pred].insert_before_branch(pc);
            }
        }
    }
    if eliminated > 0 {
        debug!("eliminated {} phis", eliminated);
    }
}

fn resolve_branch(mut instr: Instruction) -> Instruction {
    let target = instr.branch_target();
    let opcode = match instr.opcode {
        Opcode::Branch => Opcode::SBranch,
        Opcode::BranchZ | Opcode::BranchNz => {
            let z = instr.opcode == Opcode::BranchZ;
            let cond = instr.operands[0].phys_reg();
            match cond {
                SCC if z => Opcode::SCbranchSccZ,
                SCC => Opcode::SCbranchSccNz,
                EXEC if z => Opcode::SCbranchExecZ,
                EXEC => Opcode::SCbranchExecNz,
                VCC if z => Opcode::SCbranchVccZ,
                VCC => Opcode::SCbranchVccNz,
                _ => panic!("branch condition in {}", cond),
            }
        }
        _ => unreachable!(),
    };
    instr.opcode = opcode;
    instr.format = Format::SOPP;
    instr.payload = Payload::Branch { target: target };
    instr
}

/// Replaces the remaining pseudo instructions with machine-ready code.
pub fn lower_pseudo_instructions(program: &mut Program) {
    eliminate_phis(program);

    let config = program.config;
    for block in program.blocks.iter_mut() {
        let instrs = mem::take(&mut block.instructions);
        let mut out = Vec::with_capacity(instrs.len());
        for instr in instrs {
            match instr.opcode {
                Opcode::ParallelCopy => {
                    out.extend(lower_parallel_copy(&instr, &config));
                }
                Opcode::StartLinearVgpr | Opcode::EndLinearVgpr => {}
                Opcode::Branch | Opcode::BranchZ | Opcode::BranchNz => {
                    out.push(resolve_branch(instr));
                }
                _ => out.push(instr),
            }
        }
        block.instructions = out;
    }
}
