/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! Instruction encoding.
//!
//! Emits the 32-bit word stream for the fixed format table.  Branch
//! immediates are patched once every block's word offset is known:
//! the offset field counts words relative to the instruction after the
//! branch.  A fragment shader's final export gets `done` and
//! `valid_mask` set, and a null export is synthesized when the shader
//! has none at all.

use crate::wfc_ir::*;

use log::debug;

struct AsmContext {
    /* (word index of the branch, target block) */
    branches: Vec<(usize, u32)>,
    block_offsets: Vec<u32>,
}

fn hw_opcode(op: Opcode) -> u32 {
    match op {
        Opcode::SMovB32 => 0,
        Opcode::SMovB64 => 1,
        Opcode::SCselectB64 => 11,
        Opcode::SAndB64 => 13,
        Opcode::SOrB64 => 15,
        Opcode::SAndn2B64 => 21,
        Opcode::SAddU32 => 0,
        Opcode::SCmpEqU32 => 6,

        Opcode::SEndpgm => 1,
        Opcode::SBranch => 2,
        Opcode::SCbranchSccZ => 4,
        Opcode::SCbranchSccNz => 5,
        Opcode::SCbranchVccZ => 6,
        Opcode::SCbranchVccNz => 7,
        Opcode::SCbranchExecZ => 8,
        Opcode::SCbranchExecNz => 9,

        Opcode::SLoadDword => 0,
        Opcode::SLoadDwordx2 => 1,
        Opcode::SLoadDwordx4 => 2,

        Opcode::VCndmaskB32 => 0,
        Opcode::VAddF32 => 1,
        Opcode::VMulF32 => 5,
        Opcode::VMacF32 => 22,
        Opcode::VAddCoU32 => 25,
        Opcode::VMovB32 => 1,
        Opcode::VReadlaneB32 => 40,
        Opcode::VWritelaneB32 => 41,
        Opcode::VCmpLtF32 => 0x41,
        Opcode::VInterpP1F32 => 0,
        Opcode::VInterpP2F32 => 1,

        Opcode::BufferLoadDword => 20,
        Opcode::DsWriteB32 => 13,
        Opcode::DsReadB32 => 54,
        Opcode::ImageSample => 32,

        _ => panic!("no hardware opcode for {:?}", op),
    }
}

fn src_reg(instr: &Instruction, idx: usize) -> u32 {
    instr.operands[idx].phys_reg().0
}

fn dst_reg(instr: &Instruction, idx: usize) -> u32 {
    instr.definitions[idx].phys_reg().0
}

fn emit_instruction(
    ctx: &mut AsmContext,
    out: &mut Vec<u32>,
    instr: &Instruction,
) {
    let fmt = instr.format;
    if fmt.has(Format::VOP3A) {
        /* VOP2/VOPC instructions promoted to the three-address form
         * move into the VOP3 opcode space */
        let opcode = 0x100 + hw_opcode(instr.opcode);
        let (abs, clamp, omod, neg) = match instr.payload {
            Payload::Vop3a {
                abs,
                clamp,
                omod,
                neg,
                ..
            } => (abs, clamp, omod, neg),
            _ => ([false; 3], false, 0, [false; 3]),
        };
        let mut encoding: u32 = 0b110100 << 26;
        encoding |= opcode << 16;
        for (i, a) in abs.iter().enumerate() {
            if *a {
                encoding |= 1 << (8 + i);
            }
        }
        if clamp {
            encoding |= 1 << 11;
        }
        encoding |= 0xFF & dst_reg(instr, 0);
        out.push(encoding);

        encoding = 0;
        for (i, n) in neg.iter().enumerate() {
            if *n {
                encoding |= 1 << (29 + i);
            }
        }
        encoding |= u32::from(omod) << 27;
        for i in 0..instr.operands.len().min(3) {
            encoding |= src_reg(instr, i) << (i * 9);
        }
        /* the second (carry) definition lands in the sdst field */
        if instr.definitions.len() > 1 {
            encoding |= dst_reg(instr, 1) << 18;
        }
        out.push(encoding);
        emit_literal(out, instr);
        return;
    }

    /* the vector-ALU formats live in the high byte of the format word */
    if fmt.has(Format::VOP2) {
        let mut encoding: u32 = 0;
        encoding |= hw_opcode(instr.opcode) << 25;
        encoding |= (0xFF & dst_reg(instr, 0)) << 17;
        encoding |= (0xFF & src_reg(instr, 1)) << 9;
        encoding |= src_reg(instr, 0);
        out.push(encoding);
        emit_literal(out, instr);
        return;
    }
    if fmt.has(Format::VOP1) {
        let mut encoding: u32 = 0b0111111 << 25;
        encoding |= (0xFF & dst_reg(instr, 0)) << 17;
        encoding |= hw_opcode(instr.opcode) << 9;
        encoding |= src_reg(instr, 0);
        out.push(encoding);
        emit_literal(out, instr);
        return;
    }
    if fmt.has(Format::VOPC) {
        let mut encoding: u32 = 0b0111110 << 25;
        encoding |= hw_opcode(instr.opcode) << 17;
        encoding |= (0xFF & src_reg(instr, 1)) << 9;
        encoding |= src_reg(instr, 0);
        out.push(encoding);
        emit_literal(out, instr);
        return;
    }

    match fmt.base() {
        Format::SOP2 => {
            let mut encoding: u32 = 0b10 << 30;
            encoding |= hw_opcode(instr.opcode) << 23;
            if !instr.definitions.is_empty() {
                encoding |= dst_reg(instr, 0) << 16;
            }
            if instr.operands.len() >= 2 {
                encoding |= src_reg(instr, 1) << 8;
            }
            if !instr.operands.is_empty() {
                encoding |= src_reg(instr, 0);
            }
            out.push(encoding);
        }
        Format::SOPK => {
            let mut encoding: u32 = 0b1011 << 28;
            encoding |= hw_opcode(instr.opcode) << 23;
            if !instr.definitions.is_empty() {
                encoding |= dst_reg(instr, 0) << 16;
            }
            if let Payload::Sopk { imm } = instr.payload {
                encoding |= u32::from(imm);
            }
            out.push(encoding);
        }
        Format::SOP1 => {
            let mut encoding: u32 = 0b101111101 << 23;
            if !instr.definitions.is_empty() {
                encoding |= dst_reg(instr, 0) << 16;
            }
            encoding |= hw_opcode(instr.opcode) << 8;
            if !instr.operands.is_empty() {
                encoding |= src_reg(instr, 0);
            }
            out.push(encoding);
        }
        Format::SOPC => {
            let mut encoding: u32 = 0b101111110 << 23;
            encoding |= hw_opcode(instr.opcode) << 16;
            if instr.operands.len() >= 2 {
                encoding |= src_reg(instr, 1) << 8;
            }
            encoding |= src_reg(instr, 0);
            out.push(encoding);
        }
        Format::SOPP => {
            let mut encoding: u32 = 0b101111111 << 23;
            encoding |= hw_opcode(instr.opcode) << 16;
            match instr.payload {
                Payload::Branch { target } => {
                    /* the offset is patched once all block offsets are
                     * known */
                    ctx.branches.push((out.len(), target));
                }
                Payload::Sopp { imm } => {
                    encoding |= u32::from(imm);
                }
                _ => {}
            }
            out.push(encoding);
        }
        Format::SMEM => {
            let (glc, nv) = match instr.payload {
                Payload::Smem { glc, nv } => (glc, nv),
                _ => (false, false),
            };
            let mut encoding: u32 = 0b110000 << 26;
            encoding |= hw_opcode(instr.opcode) << 18;
            if glc {
                encoding |= 1 << 16;
            }
            if nv {
                encoding |= 1 << 15;
            }
            if !instr.definitions.is_empty() {
                encoding |= dst_reg(instr, 0) << 6;
            }
            /* sbase is encoded in register pairs */
            encoding |= src_reg(instr, 0) >> 1;
            out.push(encoding);
            /* the second dword carries the offset */
            let offset = if instr.operands.len() >= 2
                && instr.operands[1].is_constant()
            {
                instr.operands[1].const_value()
            } else {
                0
            };
            out.push(offset);
        }
        Format::VINTRP => {
            let (attribute, component) = match instr.payload {
                Payload::Vintrp {
                    attribute,
                    component,
                } => (attribute, component),
                _ => (0, 0),
            };
            let mut encoding: u32 = 0b110101 << 26;
            encoding |= (0xFF & dst_reg(instr, 0)) << 18;
            encoding |= hw_opcode(instr.opcode) << 16;
            encoding |= u32::from(attribute) << 10;
            encoding |= u32::from(component) << 8;
            encoding |= 0xFF & src_reg(instr, 0);
            out.push(encoding);
        }
        Format::DS => {
            let (offset0, offset1, gds) = match instr.payload {
                Payload::Ds {
                    offset0,
                    offset1,
                    gds,
                } => (offset0, offset1, gds),
                _ => (0, 0, false),
            };
            let mut encoding: u32 = 0b110110 << 26;
            encoding |= hw_opcode(instr.opcode) << 17;
            if gds {
                encoding |= 1 << 16;
            }
            encoding |= u32::from(offset1) << 8;
            encoding |= u32::from(offset0) & 0xFF;
            out.push(encoding);

            encoding = 0xFF & src_reg(instr, 0);
            if instr.operands.len() >= 2 {
                encoding |= (0xFF & src_reg(instr, 1)) << 8;
            }
            if !instr.definitions.is_empty() {
                encoding |= (0xFF & dst_reg(instr, 0)) << 24;
            }
            out.push(encoding);
        }
        Format::MUBUF => {
            let (offset, offen, idxen, glc, slc, tfe, lds) =
                match instr.payload {
                    Payload::Mubuf {
                        offset,
                        offen,
                        idxen,
                        glc,
                        slc,
                        tfe,
                        lds,
                        ..
                    } => (offset, offen, idxen, glc, slc, tfe, lds),
                    _ => (0, false, false, false, false, false, false),
                };
            let mut encoding: u32 = 0b111000 << 26;
            encoding |= hw_opcode(instr.opcode) << 18;
            if glc {
                encoding |= 1 << 14;
            }
            if idxen {
                encoding |= 1 << 13;
            }
            if offen {
                encoding |= 1 << 12;
            }
            if lds {
                encoding |= 1 << 16;
            }
            encoding |= u32::from(offset) & 0xFFF;
            out.push(encoding);

            encoding = 0xFF & src_reg(instr, 0);
            /* the resource descriptor is encoded in groups of four */
            encoding |= (src_reg(instr, 1) >> 2) << 16;
            let vdata = if !instr.definitions.is_empty() {
                dst_reg(instr, 0)
            } else if instr.operands.len() >= 4 {
                src_reg(instr, 3)
            } else {
                0
            };
            encoding |= (0xFF & vdata) << 8;
            if instr.operands.len() >= 3 {
                encoding |= src_reg(instr, 2) << 24;
            }
            if slc {
                encoding |= 1 << 22;
            }
            if tfe {
                encoding |= 1 << 23;
            }
            out.push(encoding);
        }
        Format::MIMG => {
            let (dmask, unrm, glc, slc, tfe, da, d16) = match instr.payload {
                Payload::Mimg {
                    dmask,
                    unrm,
                    glc,
                    slc,
                    tfe,
                    da,
                    d16,
                } => (dmask, unrm, glc, slc, tfe, da, d16),
                _ => (0xF, false, false, false, false, false, false),
            };
            let mut encoding: u32 = 0b111100 << 26;
            encoding |= hw_opcode(instr.opcode) << 18;
            encoding |= u32::from(dmask) << 8;
            if unrm {
                encoding |= 1 << 12;
            }
            if glc {
                encoding |= 1 << 13;
            }
            if da {
                encoding |= 1 << 14;
            }
            if tfe {
                encoding |= 1 << 16;
            }
            if slc {
                encoding |= 1 << 25;
            }
            out.push(encoding);

            encoding = 0xFF & src_reg(instr, 0);
            let vdata = if !instr.definitions.is_empty() {
                dst_reg(instr, 0)
            } else {
                0
            };
            encoding |= (0xFF & vdata) << 8;
            encoding |= (src_reg(instr, 1) >> 2) << 16;
            if instr.operands.len() >= 3 {
                encoding |= (src_reg(instr, 2) >> 2) << 21;
            }
            if d16 {
                encoding |= 1 << 31;
            }
            out.push(encoding);
        }
        Format::EXP => {
            let (enabled_mask, dest, compressed, done, valid_mask) =
                match instr.payload {
                    Payload::Exp {
                        enabled_mask,
                        dest,
                        compressed,
                        done,
                        valid_mask,
                    } => (enabled_mask, dest, compressed, done, valid_mask),
                    _ => panic!("export without payload"),
                };
            let mut encoding: u32 = 0b110001 << 26;
            if valid_mask {
                encoding |= 1 << 12;
            }
            if done {
                encoding |= 1 << 11;
            }
            if compressed {
                encoding |= 1 << 10;
            }
            encoding |= u32::from(dest) << 4;
            encoding |= u32::from(enabled_mask);
            out.push(encoding);

            encoding = 0;
            for i in 0..instr.operands.len().min(4) {
                encoding |= (0xFF & src_reg(instr, i)) << (i * 8);
            }
            out.push(encoding);
        }
        Format::PSEUDO => {
            /* logical markers and friends encode to nothing */
        }
        _ => panic!("unimplemented instruction format {:?}", fmt),
    }

    emit_literal(out, instr);
}

/// Constants without an inline encoding append one trailing dword.
fn emit_literal(out: &mut Vec<u32>, instr: &Instruction) {
    for op in &instr.operands {
        if op.is_literal() {
            out.push(op.const_value());
            return;
        }
    }
}

/// The shader's final export must signal completion; fragment shaders
/// without any export still owe the hardware a null one.
fn fixup_exports(program: &mut Program) {
    if program.stage != ShaderStage::Fragment {
        return;
    }

    let mut last: Option<(usize, usize)> = None;
    for (block_idx, block) in program.blocks.iter().enumerate() {
        for (idx, instr) in block.instructions.iter().enumerate() {
            if instr.opcode == Opcode::Exp {
                last = Some((block_idx, idx));
            }
        }
    }

    match last {
        Some((block_idx, idx)) => {
            if let Payload::Exp {
                ref mut done,
                ref mut valid_mask,
                ..
            } = program.blocks[block_idx].instructions[idx].payload
            {
                *done = true;
                *valid_mask = true;
            }
        }
        None => {
            let null_export = Instruction::new(
                Opcode::Exp,
                Format::EXP,
                vec![
                    Operand::undef(),
                    Operand::undef(),
                    Operand::undef(),
                    Operand::undef(),
                ],
                vec![],
            )
            .with_payload(Payload::Exp {
                enabled_mask: 0,
                dest: 9, /* null */
                compressed: false,
                done: true,
                valid_mask: true,
            });
            let last_block = program.blocks.len() - 1;
            let block = &mut program.blocks[last_block];
            let at = block
                .instructions
                .iter()
                .position(|i| i.opcode == Opcode::SEndpgm)
                .unwrap_or(block.instructions.len());
            block.instructions.insert(at, null_export);
        }
    }
}

/// Encodes the program into its final instruction words.
pub fn emit_program(program: &mut Program) -> Vec<u32> {
    fixup_exports(program);

    let mut ctx = AsmContext {
        branches: Vec::new(),
        block_offsets: vec![0; program.blocks.len()],
    };
    let mut out: Vec<u32> = Vec::new();

    for block in &program.blocks {
        ctx.block_offsets[block.index] = out.len() as u32;
        for instr in &block.instructions {
            emit_instruction(&mut ctx, &mut out, instr);
        }
    }

    /* patch branch offsets: counted from the word after the branch */
    for (branch_idx, target) in &ctx.branches {
        let offset = ctx.block_offsets[*target as usize] as i32
            - (*branch_idx as i32 + 1);
        out[*branch_idx] |= (offset as u16) as u32;
    }

    debug!("emitted {} words", out.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end_block(program: &mut Program) -> usize {
        let b = program.create_and_insert_block();
        program.blocks[b].instructions.push(Instruction::new(
            Opcode::SEndpgm,
            Format::SOPP,
            vec![],
            vec![],
        ));
        b
    }

    #[test]
    fn sop1_and_literal() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        let mut def = Definition::of_temp(Temp::new(1, RegClass::Sgpr(1)));
        def.set_fixed(PhysReg(4));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SMovB32,
            Format::SOP1,
            vec![Operand::constant(0xDEADBEEF)],
            vec![def],
        ));

        let words = emit_program(&mut program);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0] >> 23, 0b101111101);
        assert_eq!((words[0] >> 16) & 0x7F, 4);
        assert_eq!(words[0] & 0xFF, 255); /* literal marker */
        assert_eq!(words[1], 0xDEADBEEF);
    }

    #[test]
    fn branch_offsets_are_patched() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        /* two filler words between the branch and its target */
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SBranch,
            Format::SOPP,
            vec![],
            vec![],
        ).with_payload(Payload::Branch { target: 1 }));
        let mut def = Definition::of_temp(Temp::new(1, RegClass::Vgpr(1)));
        def.set_fixed(PhysReg::vgpr(0));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![Operand::constant(0x12345678)],
            vec![def],
        ));
        end_block(&mut program);

        let words = emit_program(&mut program);
        /* branch at word 0, filler words 1+2, target block at word 3 */
        assert_eq!(words.len(), 4);
        assert_eq!(words[0] & 0xFFFF, 2);
    }

    #[test]
    fn backward_branch_encodes_negative_offset() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SBranch,
            Format::SOPP,
            vec![],
            vec![],
        ).with_payload(Payload::Branch { target: 0 }));

        let words = emit_program(&mut program);
        assert_eq!(words[0] & 0xFFFF, (-1_i16 as u16) as u32);
    }

    #[test]
    fn fragment_shader_gets_null_export() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Fragment);
        end_block(&mut program);

        let words = emit_program(&mut program);
        /* null export (2 words) + endpgm */
        assert_eq!(words.len(), 3);
        assert_eq!(words[0] >> 26, 0b110001);
        assert!(words[0] & (1 << 11) != 0); /* done */
        assert!(words[0] & (1 << 12) != 0); /* valid mask */
        assert_eq!((words[0] >> 4) & 0x3F, 9);
    }

    #[test]
    fn final_export_is_marked_done() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Fragment);
        let b0 = program.create_and_insert_block();
        let mut ops = Vec::new();
        for i in 0..4 {
            let mut op = Operand::of_temp(Temp::new(10 + i, RegClass::Vgpr(1)));
            op.set_fixed(PhysReg::vgpr(i));
            ops.push(op);
        }
        program.blocks[b0].instructions.push(
            Instruction::new(Opcode::Exp, Format::EXP, ops, vec![])
                .with_payload(Payload::Exp {
                    enabled_mask: 0xF,
                    dest: 0,
                    compressed: false,
                    done: false,
                    valid_mask: false,
                }),
        );
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SEndpgm,
            Format::SOPP,
            vec![],
            vec![],
        ));

        let words = emit_program(&mut program);
        assert!(words[0] & (1 << 11) != 0);
        assert!(words[0] & (1 << 12) != 0);
        /* source registers in the second dword */
        assert_eq!(words[1], 0x03020100);
    }

    #[test]
    fn vop3a_promoted_add_uses_vop3_opcode_space() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        let mut dst = Definition::of_temp(Temp::new(1, RegClass::Vgpr(1)));
        dst.set_fixed(PhysReg::vgpr(2));
        let mut carry = Definition::of_temp(Temp::new(2, RegClass::Sgpr(2)));
        carry.set_fixed(PhysReg(10));
        let mut src = Operand::of_temp(Temp::new(3, RegClass::Vgpr(1)));
        src.set_fixed(PhysReg::vgpr(0));
        program.blocks[b0].instructions.push(
            Instruction::new(
                Opcode::VAddCoU32,
                Format::VOP2.with(Format::VOP3A),
                vec![src, Operand::constant(3)],
                vec![dst, carry],
            )
            .with_payload(Payload::vop3a_default()),
        );

        let words = emit_program(&mut program);
        assert_eq!(words.len(), 2);
        assert_eq!(words[0] >> 26, 0b110100);
        assert_eq!((words[0] >> 16) & 0x3FF, 0x100 + 25);
        assert_eq!(words[0] & 0xFF, 2); /* vdst */
        assert_eq!((words[1] >> 18) & 0x7F, 10); /* carry pair */
    }
}
