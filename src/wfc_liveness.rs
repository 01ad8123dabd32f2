/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! Live-variable and register-demand analysis.
//!
//! Backward iterative dataflow over a block worklist.  Values on the
//! linear CFG (scalars and linear vgprs) propagate along linear
//! predecessors, per-lane values along logical predecessors.  Demand is
//! tracked per bank and per instruction boundary; the occupancy target
//! (`num_waves`) and the per-wave register limits fall out at the end.

use crate::wfc_ir::*;

use log::debug;
use std::cmp::max;
use std::collections::BTreeSet;

#[derive(Clone, Copy, Default, Eq, PartialEq, Debug)]
pub struct RegisterDemand {
    pub sgpr: u16,
    pub vgpr: u16,
}

pub struct LiveVars {
    /// Temps live at each block's exit.
    pub live_out: Vec<BTreeSet<Temp>>,
    /// Per block, per instruction: the register pressure at the boundary
    /// following that instruction.
    pub register_demand: Vec<Vec<RegisterDemand>>,
}

fn process_live_temps_per_block(
    program: &Program,
    lives: &mut LiveVars,
    block_idx: usize,
    worklist: &mut BTreeSet<usize>,
    compute_demand: bool,
) -> RegisterDemand {
    let block = &program.blocks[block_idx];
    let mut register_demand = Vec::new();
    if compute_demand {
        register_demand
            .resize(block.instructions.len(), RegisterDemand::default());
    }
    let mut sgpr_demand: u16 = 0;
    let mut vgpr_demand: u16 = 0;
    let mut block_demand = RegisterDemand::default();

    let mut live_linear: BTreeSet<Temp> = BTreeSet::new();
    let mut live_logical: BTreeSet<Temp> = BTreeSet::new();

    /* seed with this block's live-outs */
    for t in &lives.live_out[block_idx] {
        if t.is_linear() {
            live_linear.insert(*t);
        } else {
            live_logical.insert(*t);
        }
        if compute_demand {
            match t.bank() {
                RegBank::Vgpr => vgpr_demand += t.size() as u16,
                RegBank::Sgpr => sgpr_demand += t.size() as u16,
            }
        }
    }

    /* traverse the instructions backwards */
    for i in (0..block.instructions.len()).rev() {
        if compute_demand {
            register_demand[i] = RegisterDemand {
                sgpr: sgpr_demand,
                vgpr: vgpr_demand,
            };
        }
        let insn = &block.instructions[i];

        for def in &insn.definitions {
            if !def.is_temp() {
                continue;
            }
            let t = def.temp();
            let erased = if t.is_linear() {
                live_linear.remove(&t)
            } else {
                live_logical.remove(&t)
            };
            if compute_demand {
                if erased {
                    match t.bank() {
                        RegBank::Vgpr => {
                            vgpr_demand = vgpr_demand
                                .checked_sub(t.size() as u16)
                                .expect("vector demand underflow")
                        }
                        RegBank::Sgpr => {
                            sgpr_demand = sgpr_demand
                                .checked_sub(t.size() as u16)
                                .expect("scalar demand underflow")
                        }
                    }
                } else {
                    /* a definition that is never read still occupies its
                     * registers at the defining point */
                    match t.bank() {
                        RegBank::Vgpr => {
                            register_demand[i].vgpr += t.size() as u16
                        }
                        RegBank::Sgpr => {
                            register_demand[i].sgpr += t.size() as u16
                        }
                    }
                }
            }
        }

        if insn.is_phi() {
            /* phi operands belong to the predecessor's live-out, not to
             * this block's demand */
            let preds = if insn.opcode == Opcode::Phi {
                &block.logical_preds
            } else {
                &block.linear_preds
            };
            assert!(
                insn.operands.len() == preds.len(),
                "phi operand count does not match predecessor count"
            );
            for (op_idx, op) in insn.operands.iter().enumerate() {
                if op.is_temp() {
                    let pred = preds[op_idx] as usize;
                    if lives.live_out[pred].insert(op.temp()) {
                        worklist.insert(pred);
                    }
                }
            }
        } else {
            for op in &insn.operands {
                if !op.is_temp() {
                    continue;
                }
                let t = op.temp();
                let inserted = if t.is_linear() {
                    live_linear.insert(t)
                } else {
                    live_logical.insert(t)
                };
                if compute_demand && inserted {
                    match t.bank() {
                        RegBank::Vgpr => vgpr_demand += t.size() as u16,
                        RegBank::Sgpr => sgpr_demand += t.size() as u16,
                    }
                }
            }
            if compute_demand {
                block_demand.sgpr = max(block_demand.sgpr, sgpr_demand);
                block_demand.vgpr = max(block_demand.vgpr, vgpr_demand);
            }
        }
    }

    /* merge the remaining live-ins into the predecessors' live-outs */
    for &pred in &block.logical_preds {
        for t in &live_logical {
            if lives.live_out[pred as usize].insert(*t) {
                worklist.insert(pred as usize);
            }
        }
    }
    for &pred in &block.linear_preds {
        for t in &live_linear {
            if lives.live_out[pred as usize].insert(*t) {
                worklist.insert(pred as usize);
            }
        }
    }

    assert!(
        !block.linear_preds.is_empty()
            || (live_linear.is_empty() && live_logical.is_empty()),
        "temps live into the entry block"
    );

    if compute_demand {
        lives.register_demand[block_idx] = register_demand;
    }
    block_demand
}

/// Computes live-out sets for every block and, when `compute_demand` is
/// set, per-instruction demand records, per-block demand maxima and the
/// program's occupancy.
pub fn live_var_analysis(
    program: &mut Program,
    compute_demand: bool,
) -> LiveVars {
    let num_blocks = program.blocks.len();
    let mut lives = LiveVars {
        live_out: vec![BTreeSet::new(); num_blocks],
        register_demand: vec![Vec::new(); num_blocks],
    };

    let mut block_demands = vec![RegisterDemand::default(); num_blocks];
    let mut worklist: BTreeSet<usize> = (0..num_blocks).collect();
    while let Some(block_idx) = worklist.pop_last() {
        let demand = process_live_temps_per_block(
            program,
            &mut lives,
            block_idx,
            &mut worklist,
            compute_demand,
        );
        block_demands[block_idx] = demand;
    }

    if !compute_demand {
        return lives;
    }

    let mut program_demand = RegisterDemand::default();
    for block in &mut program.blocks {
        block.sgpr_demand = block_demands[block.index].sgpr;
        block.vgpr_demand = block_demands[block.index].vgpr;
        program_demand.sgpr = max(program_demand.sgpr, block.sgpr_demand);
        program_demand.vgpr = max(program_demand.vgpr, block.vgpr_demand);
    }

    /* the EXEC-carry pair (VCC) is always reserved */
    let sgpr_demand = program_demand.sgpr + 2;
    let vgpr_demand = program_demand.vgpr;
    program.sgpr_demand = sgpr_demand;
    program.vgpr_demand = vgpr_demand;

    let total_sgpr_regs = program.chip_class.total_sgprs();
    let max_addressable_sgpr = program.chip_class.max_addressable_sgpr();
    let rounded_vgpr_demand = max(4, (vgpr_demand + 3) & !3);
    let rounded_sgpr_demand =
        max(8, (sgpr_demand + 7) & !7).min(max_addressable_sgpr);

    if vgpr_demand > 256 || sgpr_demand > max_addressable_sgpr {
        /* demand exceeds the hardware bounds; spilling (or a fallback
         * backend) has to bring it down */
        program.num_waves = 0;
        program.max_sgpr = sgpr_demand;
        program.max_vgpr = vgpr_demand;
    } else {
        program.num_waves = (256 / rounded_vgpr_demand)
            .min(total_sgpr_regs / rounded_sgpr_demand)
            .min(10);
        program.max_sgpr = ((total_sgpr_regs / program.num_waves) & !7)
            .min(max_addressable_sgpr)
            - 2;
        program.max_vgpr = (256 / program.num_waves) & !3;
    }

    debug!(
        "liveness: demand sgpr {} vgpr {} -> {} waves (limits {}/{})",
        sgpr_demand, vgpr_demand, program.num_waves, program.max_sgpr,
        program.max_vgpr
    );

    lives
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two-block program: block 0 defines `num_sgprs` scalar and
    /// `num_vgprs` vector dwords, block 1 consumes them all.
    pub(crate) fn pressure_program(
        num_sgprs: u32,
        num_vgprs: u32,
    ) -> Program {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        program.set_allocation_id(2000);
        let b0 = program.create_and_insert_block();
        let b1 = program.create_and_insert_block();
        program.blocks[b1].linear_preds.push(b0 as u32);
        program.blocks[b1].logical_preds.push(b0 as u32);
        program.blocks[b0].linear_succs.push(b1 as u32);
        program.blocks[b0].logical_succs.push(b1 as u32);

        let mut consumed = Vec::new();
        for _ in 0..num_sgprs {
            let t = program.alloc_temp(RegClass::Sgpr(1));
            program.blocks[b0].instructions.push(Instruction::new(
                Opcode::SMovB32,
                Format::SOP1,
                vec![Operand::constant(0)],
                vec![Definition::of_temp(t)],
            ));
            consumed.push(Operand::of_temp(t));
        }
        for _ in 0..num_vgprs {
            let t = program.alloc_temp(RegClass::Vgpr(1));
            program.blocks[b0].instructions.push(Instruction::new(
                Opcode::VMovB32,
                Format::VOP1,
                vec![Operand::constant(0)],
                vec![Definition::of_temp(t)],
            ));
            consumed.push(Operand::of_temp(t));
        }
        program.blocks[b0]
            .instructions
            .push(Instruction::new(
                Opcode::LogicalEnd,
                Format::PSEUDO,
                vec![],
                vec![],
            ));
        program.blocks[b0]
            .instructions
            .push(Instruction::new_branch(Opcode::Branch, b1 as u32));

        program.blocks[b1].instructions.push(Instruction::new(
            Opcode::ParallelCopy,
            Format::PSEUDO,
            consumed.clone(),
            consumed
                .iter()
                .map(|op| {
                    Definition::of_temp(Temp::new(
                        1000 + op.temp_id(),
                        op.reg_class(),
                    ))
                })
                .collect(),
        ));
        program.blocks[b1].instructions.push(Instruction::new(
            Opcode::SEndpgm,
            Format::SOPP,
            vec![],
            vec![],
        ));
        program
    }

    #[test]
    fn demand_and_occupancy() {
        let mut program = pressure_program(30, 20);
        let lives = live_var_analysis(&mut program, true);

        assert_eq!(lives.live_out[0].len(), 50);
        assert_eq!(program.blocks[0].sgpr_demand, 30);
        assert_eq!(program.blocks[0].vgpr_demand, 20);
        assert_eq!(program.sgpr_demand, 32);
        assert_eq!(program.num_waves, 10);
        assert_eq!(program.max_sgpr, 78);
        assert_eq!(program.max_vgpr, 24);
    }

    #[test]
    fn excess_scalar_demand_zeroes_wave_count() {
        let mut program = pressure_program(120, 4);
        live_var_analysis(&mut program, true);
        assert_eq!(program.num_waves, 0);
        assert_eq!(program.sgpr_demand, 122);
    }

    #[test]
    fn dead_definition_still_counts_at_its_point() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        let dead = program.alloc_temp(RegClass::Vgpr(2));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![Operand::constant(0)],
            vec![Definition::of_temp(dead)],
        ));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SEndpgm,
            Format::SOPP,
            vec![],
            vec![],
        ));
        let lives = live_var_analysis(&mut program, true);
        assert_eq!(lives.register_demand[0][0].vgpr, 2);
        assert_eq!(program.blocks[0].vgpr_demand, 0);
    }

    #[test]
    fn phi_operand_counts_in_predecessor() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        let b1 = program.create_and_insert_block();
        let b2 = program.create_and_insert_block();
        for (from, to) in [(0u32, 1u32), (0, 2), (1, 2)] {
            program.blocks[to as usize].linear_preds.push(from);
            program.blocks[to as usize].logical_preds.push(from);
            program.blocks[from as usize].linear_succs.push(to);
            program.blocks[from as usize].logical_succs.push(to);
        }

        let a = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![Operand::constant(0)],
            vec![Definition::of_temp(a)],
        ));
        let b = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b1].instructions.push(Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![Operand::constant(1)],
            vec![Definition::of_temp(b)],
        ));

        let res = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b2].instructions.push(Instruction::new_phi(
            Definition::of_temp(res),
            vec![Operand::of_temp(a), Operand::of_temp(b)],
        ));

        let lives = live_var_analysis(&mut program, true);
        assert!(lives.live_out[b0].contains(&a));
        assert!(lives.live_out[b1].contains(&b));
        /* the phi's operands do not raise the merge block's pressure;
         * its dead definition is charged to the defining point only */
        assert_eq!(program.blocks[b2].vgpr_demand, 0);
        assert_eq!(lives.register_demand[b2][0].vgpr, 1);
    }
}
