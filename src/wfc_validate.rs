/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! IR validation helpers, used by tests and debug builds.

use crate::error::CompileError;
use crate::wfc_ir::*;
use crate::wfc_liveness::live_var_analysis;

use rustc_hash::{FxHashMap, FxHashSet};

fn err(msg: String) -> CompileError {
    CompileError::InvariantViolation(msg)
}

/// Structural SSA checks: unique definitions, phi arity against the
/// matching predecessor list, operand classes against the phi's result
/// class.
pub fn validate_ssa(program: &Program) -> Result<(), CompileError> {
    let mut defined: FxHashSet<u32> = FxHashSet::default();

    for block in &program.blocks {
        let mut past_phis = false;
        for instr in &block.instructions {
            if instr.is_phi() {
                if past_phis {
                    return Err(err(format!(
                        "phi below regular instructions in block {}",
                        block.index
                    )));
                }
                let preds = if instr.opcode == Opcode::Phi {
                    &block.logical_preds
                } else {
                    &block.linear_preds
                };
                if instr.operands.len() != preds.len() {
                    return Err(err(format!(
                        "phi arity {} vs {} predecessors in block {}",
                        instr.operands.len(),
                        preds.len(),
                        block.index
                    )));
                }
                let def_rc = instr.definitions[0].reg_class();
                for op in &instr.operands {
                    if op.is_temp() && op.reg_class() != def_rc {
                        return Err(err(format!(
                            "phi operand class {} vs result class {}",
                            op.reg_class(),
                            def_rc
                        )));
                    }
                }
            } else {
                past_phis = true;
            }

            for def in &instr.definitions {
                if def.is_temp() && !defined.insert(def.temp_id()) {
                    return Err(err(format!(
                        "temp %{} defined more than once",
                        def.temp_id()
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Post-allocation checks: everything is bound, operands carry their
/// definition's register, and no two simultaneously live values share a
/// register file slot.
pub fn validate_ra(program: &mut Program) -> Result<(), CompileError> {
    let mut def_regs: FxHashMap<u32, PhysReg> = FxHashMap::default();
    for block in &program.blocks {
        for instr in &block.instructions {
            for def in &instr.definitions {
                if !def.is_temp() {
                    continue;
                }
                if !def.is_fixed() {
                    return Err(err(format!(
                        "unassigned definition in {}",
                        instr
                    )));
                }
                def_regs.insert(def.temp_id(), def.phys_reg());
            }
        }
    }

    for block in &program.blocks {
        for instr in &block.instructions {
            for op in &instr.operands {
                if !op.is_temp() {
                    continue;
                }
                if !op.is_fixed() {
                    return Err(err(format!(
                        "unassigned operand in {}",
                        instr
                    )));
                }
                match def_regs.get(&op.temp_id()) {
                    None => {
                        return Err(err(format!(
                            "operand %{} has no definition",
                            op.temp_id()
                        )))
                    }
                    Some(reg) if *reg != op.phys_reg() => {
                        return Err(err(format!(
                            "operand %{} in {} but defined into {}",
                            op.temp_id(),
                            op.phys_reg(),
                            reg
                        )))
                    }
                    _ => {}
                }
            }
        }
    }

    /* interference: re-derive liveness and walk each block backward
     * with an occupancy map */
    let lives = live_var_analysis(program, false);
    for block in &program.blocks {
        let mut occupied: FxHashMap<u32, u32> = FxHashMap::default();
        let occupy = |occupied: &mut FxHashMap<u32, u32>,
                          id: u32,
                          reg: PhysReg,
                          size: u32|
         -> Result<(), CompileError> {
            for i in 0..size {
                let slot = reg.0 + i;
                match occupied.get(&slot) {
                    Some(other) if *other != id => {
                        return Err(err(format!(
                            "%{} and %{} overlap at {}",
                            id,
                            other,
                            PhysReg(slot)
                        )))
                    }
                    _ => {}
                }
                occupied.insert(slot, id);
            }
            Ok(())
        };

        for t in &lives.live_out[block.index] {
            if let Some(reg) = def_regs.get(&t.id) {
                occupy(&mut occupied, t.id, *reg, t.size())?;
            }
        }

        for instr in block.instructions.iter().rev() {
            for def in &instr.definitions {
                if !def.is_temp() {
                    continue;
                }
                for i in 0..def.size() {
                    occupied.remove(&(def.phys_reg().0 + i));
                }
            }
            if instr.is_phi() {
                continue;
            }
            for op in &instr.operands {
                if op.is_temp() {
                    occupy(
                        &mut occupied,
                        op.temp_id(),
                        op.phys_reg(),
                        op.size(),
                    )?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wfc_assign_regs::register_allocation;
    use crate::wfc_dom::dominator_tree;
    use crate::wfc_liveness::tests::pressure_program;

    #[test]
    fn allocated_program_passes_interference_check() {
        let mut program = pressure_program(30, 20);
        dominator_tree(&mut program);
        live_var_analysis(&mut program, true);
        validate_ssa(&program).unwrap();
        register_allocation(&mut program);
        validate_ra(&mut program).unwrap();
    }

    #[test]
    fn overlap_is_reported() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        let mut d1 = Definition::of_temp(Temp::new(1, RegClass::Sgpr(2)));
        d1.set_fixed(PhysReg(0));
        let mut d2 = Definition::of_temp(Temp::new(2, RegClass::Sgpr(1)));
        d2.set_fixed(PhysReg(1));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SMovB64,
            Format::SOP1,
            vec![Operand::constant(0)],
            vec![d1],
        ));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SMovB32,
            Format::SOP1,
            vec![Operand::constant(0)],
            vec![d2],
        ));
        /* both live at the same point */
        let mut o1 = Operand::of_temp(Temp::new(1, RegClass::Sgpr(2)));
        o1.set_fixed(PhysReg(0));
        let mut o2 = Operand::of_temp(Temp::new(2, RegClass::Sgpr(1)));
        o2.set_fixed(PhysReg(1));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SAndB64,
            Format::SOP2,
            vec![o1, o2],
            vec![],
        ));

        assert!(validate_ra(&mut program).is_err());
    }

    #[test]
    fn phi_arity_mismatch_is_reported() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        let b1 = program.create_and_insert_block();
        program.blocks[b1].logical_preds.push(b0 as u32);
        program.blocks[b1].instructions.push(Instruction::new_phi(
            Definition::of_temp(Temp::new(1, RegClass::Vgpr(1))),
            vec![Operand::undef(), Operand::undef()],
        ));
        assert!(validate_ssa(&program).is_err());
    }
}
