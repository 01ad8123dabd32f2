/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! Lowering of per-lane boolean phis.
//!
//! A lane mask lives in a 64-bit scalar register, so a logical phi over
//! such values cannot become a scalar-CFG phi: different lanes may have
//! arrived over different edges.  Instead, every predecessor blends its
//! incoming value into a running accumulator under EXEC:
//!
//!     cur' = (cur & ~EXEC) | (src & EXEC)
//!
//! The accumulator is kept in SSA form on demand: reads walk linear
//! predecessors and materialize linear phis only where paths merge, and
//! rewriting the accumulator patches the operands of phis created
//! earlier.

use crate::wfc_ir::*;

use log::debug;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::mem;

const MASK_RC: RegClass = RegClass::Sgpr(2);

#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
struct PhiUse {
    block: usize,
    phi_def: u32,
}

#[derive(Default)]
struct SsaState {
    /// Latest accumulator name per block.
    latest: FxHashMap<usize, u32>,
    /// For each accumulator name: the phis reading it, with a bitmask of
    /// the operand slots doing so.
    phis: FxHashMap<u32, BTreeMap<PhiUse, u64>>,
}

fn get_ssa(
    program: &mut Program,
    block_idx: usize,
    state: &mut SsaState,
) -> Operand {
    let mut block_idx = block_idx;
    loop {
        if let Some(&id) = state.latest.get(&block_idx) {
            return Operand::of_temp(Temp::new(id, MASK_RC));
        }

        let preds = program.blocks[block_idx].linear_preds.clone();
        match preds.len() {
            0 => return Operand::undef(),
            1 => {
                block_idx = preds[0] as usize;
            }
            _ => {
                let res = program.allocate_id();
                state.latest.insert(block_idx, res);

                let mut operands = Vec::with_capacity(preds.len());
                for (i, &pred) in preds.iter().enumerate() {
                    let op = get_ssa(program, pred as usize, state);
                    if op.is_temp() {
                        assert!(i < 64);
                        *state
                            .phis
                            .entry(op.temp_id())
                            .or_default()
                            .entry(PhiUse {
                                block: block_idx,
                                phi_def: res,
                            })
                            .or_insert(0) |= 1_u64 << i;
                    }
                    operands.push(op);
                }

                let phi = Instruction::new_linear_phi(
                    Definition::of_temp(Temp::new(res, MASK_RC)),
                    operands,
                );
                program.blocks[block_idx].instructions.insert(0, phi);
                return Operand::of_temp(Temp::new(res, MASK_RC));
            }
        }
    }
}

fn update_phi(
    program: &mut Program,
    state: &mut SsaState,
    block_idx: usize,
    phi_def: u32,
    operand_mask: u64,
) {
    let pos = {
        let block = &program.blocks[block_idx];
        let mut found = None;
        for (i, instr) in block.instructions.iter().enumerate() {
            if !instr.is_phi() {
                break;
            }
            if instr.opcode != Opcode::LinearPhi {
                continue;
            }
            if instr.definitions[0].temp_id() == phi_def {
                found = Some(i);
                break;
            }
        }
        found.expect("accumulator phi vanished")
    };

    let preds = program.blocks[block_idx].linear_preds.clone();
    let mut operands = operand_mask;
    while operands != 0 {
        let operand = operands.trailing_zeros() as usize;
        operands &= operands - 1;

        let new_operand = get_ssa(program, preds[operand] as usize, state);
        program.blocks[block_idx].instructions[pos].operands[operand] =
            new_operand;
        if !new_operand.is_undefined() {
            *state
                .phis
                .entry(new_operand.temp_id())
                .or_default()
                .entry(PhiUse {
                    block: block_idx,
                    phi_def: phi_def,
                })
                .or_insert(0) |= 1_u64 << operand;
        }
    }
}

fn write_ssa(
    program: &mut Program,
    block_idx: usize,
    state: &mut SsaState,
    previous: u32,
) -> Temp {
    let id = program.allocate_id();
    state.latest.insert(block_idx, id);

    /* every phi that read the previous name re-reads it */
    if previous != 0 {
        if let Some(phis) = state.phis.remove(&previous) {
            for (phi_use, mask) in phis {
                update_phi(program, state, phi_use.block, phi_use.phi_def, mask);
            }
        }
    }

    Temp::new(id, MASK_RC)
}

fn scc_def(program: &mut Program) -> Definition {
    let mut def = Definition::of_temp(program.alloc_temp(RegClass::Scc));
    def.set_fixed(SCC);
    def
}

fn lower_divergent_bool_phi(
    program: &mut Program,
    block_idx: usize,
    phi: &Instruction,
) -> Instruction {
    let mut state = SsaState::default();
    let preds = program.blocks[block_idx].logical_preds.clone();
    assert!(
        phi.operands.len() == preds.len(),
        "phi operand count does not match predecessor count"
    );

    for (i, operand) in phi.operands.iter().enumerate() {
        let pred = preds[i] as usize;

        assert!(operand.is_temp());
        let mut phi_src = operand.temp();
        if phi_src.rc == RegClass::Sgpr(1) {
            /* 1-dword (SCC-style) booleans are widened to the lane-mask
             * form first: all-ones or zero selected under SCC */
            let mut scc_src = Operand::of_temp(phi_src);
            scc_src.set_fixed(SCC);
            phi_src = program.alloc_temp(MASK_RC);
            let cselect = Instruction::new(
                Opcode::SCselectB64,
                Format::SOP2,
                vec![
                    Operand::constant(u32::MAX),
                    Operand::constant(0),
                    scc_src,
                ],
                vec![Definition::of_temp(phi_src)],
            );
            program.blocks[pred].insert_before_logical_end(cselect);
        }
        assert!(phi_src.rc == MASK_RC);

        let cur = get_ssa(program, pred, &mut state);
        let previous = if cur.is_undefined() { 0 } else { cur.temp_id() };
        let new_cur = write_ssa(program, pred, &mut state, previous);

        if cur.is_undefined() {
            let merge = Instruction::new(
                Opcode::SMovB64,
                Format::SOP1,
                vec![Operand::of_temp(phi_src)],
                vec![Definition::of_temp(new_cur)],
            );
            program.blocks[pred].insert_before_logical_end(merge);
        } else {
            /* keep inactive lanes from the accumulator, take active
             * lanes from the incoming value */
            let tmp1 = program.alloc_temp(MASK_RC);
            let scc = scc_def(program);
            let andn2 = Instruction::new(
                Opcode::SAndn2B64,
                Format::SOP2,
                vec![cur, Operand::phys(EXEC, MASK_RC)],
                vec![Definition::of_temp(tmp1), scc],
            );
            program.blocks[pred].insert_before_logical_end(andn2);

            let tmp2 = program.alloc_temp(MASK_RC);
            let scc = scc_def(program);
            let and = Instruction::new(
                Opcode::SAndB64,
                Format::SOP2,
                vec![Operand::of_temp(phi_src), Operand::phys(EXEC, MASK_RC)],
                vec![Definition::of_temp(tmp2), scc],
            );
            program.blocks[pred].insert_before_logical_end(and);

            let scc = scc_def(program);
            let or = Instruction::new(
                Opcode::SOrB64,
                Format::SOP2,
                vec![Operand::of_temp(tmp1), Operand::of_temp(tmp2)],
                vec![Definition::of_temp(new_cur), scc],
            );
            program.blocks[pred].insert_before_logical_end(or);
        }
    }

    let result = get_ssa(program, block_idx, &mut state);
    Instruction::new(
        Opcode::SMovB64,
        Format::SOP1,
        vec![result],
        vec![phi.definitions[0]],
    )
}

/// Rewrites every logical phi over lane masks into explicit EXEC blends
/// in the predecessors.
pub fn lower_bool_phis(program: &mut Program) {
    let mut lowered = 0_u32;

    for block_idx in 0..program.blocks.len() {
        let instructions =
            mem::take(&mut program.blocks[block_idx].instructions);

        let mut kept_phis = Vec::new();
        let mut non_phi = Vec::new();
        let mut rest = Vec::new();
        let mut in_prefix = true;

        for instr in instructions {
            if in_prefix && instr.is_phi() {
                if instr.opcode == Opcode::Phi
                    && instr.definitions[0].reg_class() == MASK_RC
                {
                    let copy =
                        lower_divergent_bool_phi(program, block_idx, &instr);
                    non_phi.push(copy);
                    lowered += 1;
                } else {
                    kept_phis.push(instr);
                }
            } else {
                in_prefix = false;
                assert!(!instr.is_phi());
                rest.push(instr);
            }
        }

        /* accumulator phis created for this block were prepended to the
         * (taken) instruction vector; keep them in front */
        let mut result =
            mem::take(&mut program.blocks[block_idx].instructions);
        result.extend(kept_phis);
        result.extend(non_phi);
        result.extend(rest);
        program.blocks[block_idx].instructions = result;
    }

    if lowered > 0 {
        debug!("lowered {} divergent bool phis", lowered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A divergent if: logically a diamond, linearly a straight line
    /// through both sides.
    fn divergent_if_program() -> (Program, Temp, Temp, Temp) {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Fragment);
        let b0 = program.create_and_insert_block();
        let b1 = program.create_and_insert_block();
        let b2 = program.create_and_insert_block();
        let b3 = program.create_and_insert_block();

        for (from, to) in [(b0, b1), (b1, b2), (b2, b3)] {
            program.blocks[to].linear_preds.push(from as u32);
            program.blocks[from].linear_succs.push(to as u32);
        }
        for (from, to) in [(b0, b1), (b0, b2), (b1, b3), (b2, b3)] {
            program.blocks[to].logical_preds.push(from as u32);
            program.blocks[from].logical_succs.push(to as u32);
        }

        let t_true = program.alloc_temp(RegClass::Sgpr(2));
        let t_false = program.alloc_temp(RegClass::Sgpr(2));

        for b in [b0, b1, b2] {
            program.blocks[b].instructions.push(Instruction::new(
                Opcode::LogicalEnd,
                Format::PSEUDO,
                vec![],
                vec![],
            ));
            program.blocks[b]
                .instructions
                .push(Instruction::new_branch(Opcode::Branch, b as u32 + 1));
        }
        program.blocks[b1].instructions.insert(
            0,
            Instruction::new(
                Opcode::SMovB64,
                Format::SOP1,
                vec![Operand::constant(u32::MAX)],
                vec![Definition::of_temp(t_true)],
            ),
        );
        program.blocks[b2].instructions.insert(
            0,
            Instruction::new(
                Opcode::SMovB64,
                Format::SOP1,
                vec![Operand::constant(0)],
                vec![Definition::of_temp(t_false)],
            ),
        );

        let res = program.alloc_temp(RegClass::Sgpr(2));
        program.blocks[b3].instructions.push(Instruction::new_phi(
            Definition::of_temp(res),
            vec![Operand::of_temp(t_true), Operand::of_temp(t_false)],
        ));
        program.blocks[b3].instructions.push(Instruction::new(
            Opcode::SEndpgm,
            Format::SOPP,
            vec![],
            vec![],
        ));

        (program, t_true, t_false, res)
    }

    #[test]
    fn divergent_bool_phi_becomes_exec_blend() {
        let (mut program, t_true, t_false, res) = divergent_if_program();
        lower_bool_phis(&mut program);

        /* the logical phi is gone */
        assert!(!program.blocks[3]
            .instructions
            .iter()
            .any(|i| i.is_phi()));

        /* the first predecessor initializes the accumulator */
        let b1_movs: Vec<_> = program.blocks[1]
            .instructions
            .iter()
            .filter(|i| {
                i.opcode == Opcode::SMovB64
                    && i.operands[0].is_temp()
                    && i.operands[0].temp() == t_true
            })
            .collect();
        assert_eq!(b1_movs.len(), 1);

        /* the second predecessor blends under EXEC */
        let b2_ops: Vec<_> = program.blocks[2]
            .instructions
            .iter()
            .map(|i| i.opcode)
            .collect();
        let andn2 =
            b2_ops.iter().position(|o| *o == Opcode::SAndn2B64).unwrap();
        let and = b2_ops.iter().position(|o| *o == Opcode::SAndB64).unwrap();
        let or = b2_ops.iter().position(|o| *o == Opcode::SOrB64).unwrap();
        assert!(andn2 < and && and < or);
        let end =
            b2_ops.iter().position(|o| *o == Opcode::LogicalEnd).unwrap();
        assert!(or < end);

        let and_instr = &program.blocks[2].instructions[and];
        assert_eq!(and_instr.operands[0].temp(), t_false);
        assert_eq!(and_instr.operands[1].phys_reg(), EXEC);

        /* the merge block moves the accumulator into the phi's dest */
        let copy = program.blocks[3]
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::SMovB64)
            .unwrap();
        assert_eq!(copy.definitions[0].temp(), res);
        let or_instr = &program.blocks[2].instructions[or];
        assert_eq!(
            copy.operands[0].temp(),
            or_instr.definitions[0].temp()
        );
    }

    #[test]
    fn one_dword_bool_is_widened_first() {
        let (mut program, _, _, _) = {
            let (mut program, t_true, t_false, res) = divergent_if_program();
            /* replace the first phi operand with an SCC-style bool */
            let narrow = program.alloc_temp(RegClass::Sgpr(1));
            program.blocks[1].instructions[0] = Instruction::new(
                Opcode::SCmpEqU32,
                Format::SOPC,
                vec![Operand::constant(0), Operand::constant(0)],
                vec![Definition::of_temp(narrow)],
            );
            let phi = program.blocks[3]
                .instructions
                .iter_mut()
                .find(|i| i.is_phi())
                .unwrap();
            phi.operands[0] = Operand::of_temp(narrow);
            (program, t_true, t_false, res)
        };
        lower_bool_phis(&mut program);

        let cselect = program.blocks[1]
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::SCselectB64)
            .expect("widening cselect");
        assert_eq!(cselect.operands[2].phys_reg(), SCC);
        assert_eq!(cselect.operands[0].const_value(), u32::MAX);
    }
}
