/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! End-to-end pipeline test: a fragment shader with a divergent bool
//! phi goes from selected IR to encoded instruction words.

use wfc::wfc_ir::*;

fn link_logical(program: &mut Program, from: usize, to: usize) {
    program.blocks[to].logical_preds.push(from as u32);
    program.blocks[from].logical_succs.push(to as u32);
}

fn link_linear(program: &mut Program, from: usize, to: usize) {
    program.blocks[to].linear_preds.push(from as u32);
    program.blocks[from].linear_succs.push(to as u32);
}

#[test]
fn divergent_bool_phi_shader_compiles() {
    env_logger::try_init().ok();

    let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Fragment);
    let b0 = program.create_and_insert_block();
    let b1 = program.create_and_insert_block();
    let b2 = program.create_and_insert_block();
    let b3 = program.create_and_insert_block();

    /* a divergent if: logically a diamond, linearly a straight line */
    link_linear(&mut program, b0, b1);
    link_linear(&mut program, b1, b2);
    link_linear(&mut program, b2, b3);
    link_logical(&mut program, b0, b1);
    link_logical(&mut program, b0, b2);
    link_logical(&mut program, b1, b3);
    link_logical(&mut program, b2, b3);

    /* four color components, defined up front and exported at the end */
    let mut color = Vec::new();
    for i in 0..4_u32 {
        let c = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![Operand::constant(i)],
            vec![Definition::of_temp(c)],
        ));
        color.push(c);
    }

    let t_true = program.alloc_temp(RegClass::Sgpr(2));
    let t_false = program.alloc_temp(RegClass::Sgpr(2));
    program.blocks[b1].instructions.push(Instruction::new(
        Opcode::SMovB64,
        Format::SOP1,
        vec![Operand::constant(u32::MAX)],
        vec![Definition::of_temp(t_true)],
    ));
    program.blocks[b2].instructions.push(Instruction::new(
        Opcode::SMovB64,
        Format::SOP1,
        vec![Operand::constant(0)],
        vec![Definition::of_temp(t_false)],
    ));

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

    /* the per-lane bool merges in b3 */
    let cond = program.alloc_temp(RegClass::Sgpr(2));
    program.blocks[b3].instructions.push(Instruction::new_phi(
        Definition::of_temp(cond),
        vec![Operand::of_temp(t_true), Operand::of_temp(t_false)],
    ));
    let mask = program.alloc_temp(RegClass::Sgpr(2));
    program.blocks[b3].instructions.push(Instruction::new(
        Opcode::SMovB64,
        Format::SOP1,
        vec![Operand::of_temp(cond)],
        vec![Definition::of_temp(mask)],
    ));
    program.blocks[b3].instructions.push(
        Instruction::new(
            Opcode::Exp,
            Format::EXP,
            color.iter().map(|c| Operand::of_temp(*c)).collect(),
            vec![],
        )
        .with_payload(Payload::Exp {
            enabled_mask: 0xF,
            dest: 0,
            compressed: false,
            done: false,
            valid_mask: false,
        }),
    );
    program.blocks[b3].instructions.push(Instruction::new(
        Opcode::SEndpgm,
        Format::SOPP,
        vec![],
        vec![],
    ));

    let binary = wfc::compile(&mut program).unwrap();

    assert!(!binary.is_empty());
    assert!(program.config.num_sgprs > 0);
    assert!(program.config.num_vgprs > 0);
    assert_eq!(program.num_waves, 10);

    /* no pseudo survived into the encoded program */
    for block in &program.blocks {
        for instr in &block.instructions {
            assert!(!instr.is_phi());
            assert!(instr.opcode != Opcode::ParallelCopy);
        }
    }

    /* the program ends and the final export is flagged done */
    let endpgm: u32 = (0b101111111 << 23) | (1 << 16);
    assert!(binary.contains(&endpgm));
    let exp = binary
        .iter()
        .find(|w| *w >> 26 == 0b110001)
        .expect("export missing");
    assert!(exp & (1 << 11) != 0);
    assert!(exp & (1 << 12) != 0);
}

#[test]
fn excessive_demand_reports_resource_exhaustion() {
    env_logger::try_init().ok();

    let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
    let b0 = program.create_and_insert_block();
    let b1 = program.create_and_insert_block();
    link_linear(&mut program, b0, b1);
    link_logical(&mut program, b0, b1);

    /* more vector values than the file can ever hold */
    let mut ops = Vec::new();
    for _ in 0..300 {
        let t = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![Operand::constant(0)],
            vec![Definition::of_temp(t)],
        ));
        ops.push(Operand::of_temp(t));
    }
    program.blocks[b0].instructions.push(Instruction::new(
        Opcode::LogicalEnd,
        Format::PSEUDO,
        vec![],
        vec![],
    ));
    program.blocks[b0]
        .instructions
        .push(Instruction::new_branch(Opcode::Branch, b1 as u32));
    program.blocks[b1].instructions.push(Instruction::new(
        Opcode::Exp,
        Format::EXP,
        ops,
        vec![],
    ));
    program.blocks[b1].instructions.push(Instruction::new(
        Opcode::SEndpgm,
        Format::SOPP,
        vec![],
        vec![],
    ));

    match wfc::compile(&mut program) {
        Err(wfc::CompileError::ResourceExhaustion { vgpr_demand, .. }) => {
            assert!(vgpr_demand > 256);
        }
        other => panic!("expected resource exhaustion, got {:?}", other.map(|_| ())),
    }
    assert_eq!(program.num_waves, 0);
}
