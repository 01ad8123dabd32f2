/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

use smallvec::SmallVec;
use std::fmt;

/// The two physical register banks of the wavefront ISA, plus the 1-bit
/// scalar condition code which rides along with the scalar side.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug)]
pub enum RegBank {
    Sgpr,
    Vgpr,
}

/// Register class of a value: bank and size in dwords.
///
/// `LinearVgpr` is a vector register whose lifetime is tracked on the
/// linear CFG so that its per-lane payload survives execution-mask
/// changes.  The spiller uses it as backing storage for scalar spills.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Debug)]
pub enum RegClass {
    Scc,
    Sgpr(u8),
    Vgpr(u8),
    LinearVgpr(u8),
}

impl RegClass {
    pub fn bank(self) -> RegBank {
        match self {
            RegClass::Scc | RegClass::Sgpr(_) => RegBank::Sgpr,
            RegClass::Vgpr(_) | RegClass::LinearVgpr(_) => RegBank::Vgpr,
        }
    }

    /// Size in dwords.  SCC occupies no register file slot.
    pub fn size(self) -> u32 {
        match self {
            RegClass::Scc => 0,
            RegClass::Sgpr(n) | RegClass::Vgpr(n) | RegClass::LinearVgpr(n) => {
                n.into()
            }
        }
    }

    /// Whether the value lives on the linear CFG.  Scalar values always
    /// do; linear vgprs do by construction.
    pub fn is_linear(self) -> bool {
        !matches!(self, RegClass::Vgpr(_))
    }
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegClass::Scc => write!(f, "b"),
            RegClass::Sgpr(n) => write!(f, "s{}", n),
            RegClass::Vgpr(n) => write!(f, "v{}", n),
            RegClass::LinearVgpr(n) => write!(f, "lv{}", n),
        }
    }
}

/// A temporary virtual register: dense SSA id plus register class.
/// `id == 0` is reserved and means "no temp".
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Debug)]
pub struct Temp {
    pub id: u32,
    pub rc: RegClass,
}

impl Temp {
    pub fn new(id: u32, rc: RegClass) -> Temp {
        Temp { id: id, rc: rc }
    }

    pub fn none() -> Temp {
        Temp {
            id: 0,
            rc: RegClass::Sgpr(1),
        }
    }

    pub fn size(&self) -> u32 {
        self.rc.size()
    }

    pub fn bank(&self) -> RegBank {
        self.rc.bank()
    }

    pub fn is_linear(&self) -> bool {
        self.rc.is_linear()
    }
}

impl fmt::Display for Temp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}:{}", self.id, self.rc)
    }
}

/// A physical register index in the flat encoding space: sgprs at 0..102,
/// VCC at 106, M0 at 124, EXEC at 126, inline constants at 128..=254,
/// the literal marker at 255 and vgprs at 256..512.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Debug)]
pub struct PhysReg(pub u32);

pub const VCC: PhysReg = PhysReg(106);
pub const M0: PhysReg = PhysReg(124);
pub const EXEC: PhysReg = PhysReg(126);
pub const SCC: PhysReg = PhysReg(253);

impl PhysReg {
    pub fn sgpr(idx: u32) -> PhysReg {
        PhysReg(idx)
    }

    pub fn vgpr(idx: u32) -> PhysReg {
        PhysReg(256 + idx)
    }

    pub fn reg(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            VCC => write!(f, "vcc"),
            M0 => write!(f, "m0"),
            EXEC => write!(f, "exec"),
            SCC => write!(f, "scc"),
            PhysReg(r) if r >= 256 => write!(f, "v{}", r - 256),
            PhysReg(r) => write!(f, "s{}", r),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
enum OperandKind {
    Temp(Temp),
    Const(u32),
    Undef,
}

/// An instruction source.  Before allocation it names a temp, a constant
/// or undef; allocation binds every temp operand to a physical register.
/// The kill flag is computed by liveness, never authored.
#[derive(Clone, Copy, Debug)]
pub struct Operand {
    kind: OperandKind,
    fixed: Option<PhysReg>,
    kill: bool,
}

impl Operand {
    pub fn of_temp(temp: Temp) -> Operand {
        Operand {
            kind: OperandKind::Temp(temp),
            fixed: None,
            kill: false,
        }
    }

    /// Constants with a dedicated inline encoding get it as their fixed
    /// register; everything else becomes a trailing literal dword.
    pub fn constant(v: u32) -> Operand {
        let reg = if v <= 64 {
            PhysReg(128 + v)
        } else if v >= 0xFFFFFFF0 {
            /* [-16 .. -1] */
            PhysReg(192u32.wrapping_sub(v))
        } else if v == 0x3f000000 {
            PhysReg(240) /* 0.5 */
        } else if v == 0xbf000000 {
            PhysReg(241) /* -0.5 */
        } else if v == 0x3f800000 {
            PhysReg(242) /* 1.0 */
        } else if v == 0xbf800000 {
            PhysReg(243) /* -1.0 */
        } else if v == 0x40000000 {
            PhysReg(244) /* 2.0 */
        } else if v == 0xc0000000 {
            PhysReg(245) /* -2.0 */
        } else if v == 0x40800000 {
            PhysReg(246) /* 4.0 */
        } else if v == 0xc0800000 {
            PhysReg(247) /* -4.0 */
        } else if v == 0x3e22f983 {
            PhysReg(248) /* 1/(2*PI) */
        } else {
            PhysReg(255) /* literal */
        };
        Operand {
            kind: OperandKind::Const(v),
            fixed: Some(reg),
            kill: false,
        }
    }

    pub fn undef() -> Operand {
        Operand {
            kind: OperandKind::Undef,
            fixed: Some(PhysReg(128)),
            kill: false,
        }
    }

    /// An operand pinned to a physical register (EXEC, SCC, ...).
    pub fn phys(reg: PhysReg, rc: RegClass) -> Operand {
        Operand {
            kind: OperandKind::Temp(Temp::new(0, rc)),
            fixed: Some(reg),
            kill: false,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self.kind, OperandKind::Temp(t) if t.id != 0)
    }

    pub fn temp(&self) -> Temp {
        match self.kind {
            OperandKind::Temp(t) => t,
            _ => panic!("not a temp operand"),
        }
    }

    pub fn temp_id(&self) -> u32 {
        self.temp().id
    }

    pub fn set_temp(&mut self, t: Temp) {
        assert!(!self.is_constant());
        self.kind = OperandKind::Temp(t);
    }

    pub fn reg_class(&self) -> RegClass {
        self.temp().rc
    }

    pub fn size(&self) -> u32 {
        match self.kind {
            OperandKind::Const(_) | OperandKind::Undef => 1,
            OperandKind::Temp(t) => t.size(),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, OperandKind::Const(_))
    }

    pub fn is_literal(&self) -> bool {
        self.is_constant() && self.fixed == Some(PhysReg(255))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.kind, OperandKind::Undef)
    }

    pub fn const_value(&self) -> u32 {
        match self.kind {
            OperandKind::Const(v) => v,
            _ => panic!("not a constant operand"),
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed.is_some()
    }

    pub fn phys_reg(&self) -> PhysReg {
        self.fixed.unwrap()
    }

    pub fn set_fixed(&mut self, reg: PhysReg) {
        self.fixed = Some(reg);
    }

    pub fn set_kill(&mut self, kill: bool) {
        self.kill = kill;
    }

    pub fn is_kill(&self) -> bool {
        self.kill
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            OperandKind::Temp(t) if t.id != 0 => {
                write!(f, "{}", t)?;
            }
            OperandKind::Temp(_) => {}
            OperandKind::Const(v) => write!(f, "{:#x}", v)?,
            OperandKind::Undef => write!(f, "undef")?,
        }
        if let Some(reg) = self.fixed {
            write!(f, "({})", reg)?;
        }
        if self.kill {
            write!(f, "!")?;
        }
        Ok(())
    }
}

/// An instruction result.  `temp.id == 0` marks a definition that exists
/// only for its fixed register (e.g. a clobbered SCC).
#[derive(Clone, Copy, Debug)]
pub struct Definition {
    temp: Temp,
    fixed: Option<PhysReg>,
    hint: Option<PhysReg>,
    reuse_input: bool,
}

impl Definition {
    pub fn of_temp(temp: Temp) -> Definition {
        Definition {
            temp: temp,
            fixed: None,
            hint: None,
            reuse_input: false,
        }
    }

    pub fn phys(reg: PhysReg, rc: RegClass) -> Definition {
        Definition {
            temp: Temp::new(0, rc),
            fixed: Some(reg),
            hint: None,
            reuse_input: false,
        }
    }

    pub fn is_temp(&self) -> bool {
        self.temp.id != 0
    }

    pub fn temp(&self) -> Temp {
        self.temp
    }

    pub fn temp_id(&self) -> u32 {
        self.temp.id
    }

    pub fn set_temp(&mut self, t: Temp) {
        self.temp = t;
    }

    pub fn reg_class(&self) -> RegClass {
        self.temp.rc
    }

    pub fn size(&self) -> u32 {
        self.temp.size()
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed.is_some()
    }

    pub fn phys_reg(&self) -> PhysReg {
        self.fixed.unwrap()
    }

    pub fn set_fixed(&mut self, reg: PhysReg) {
        self.fixed = Some(reg);
    }

    pub fn set_hint(&mut self, reg: PhysReg) {
        self.hint = Some(reg);
    }

    pub fn hint(&self) -> Option<PhysReg> {
        self.hint
    }

    pub fn must_reuse_input(&self) -> bool {
        self.reuse_input
    }

    pub fn set_reuse_input(&mut self, v: bool) {
        self.reuse_input = v;
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_temp() {
            write!(f, "{}", self.temp)?;
        }
        if let Some(reg) = self.fixed {
            write!(f, "({})", reg)?;
        }
        Ok(())
    }
}

/// Microcode encoding format.  The low byte holds the base format; the
/// vector-ALU formats and their modifiers are single bits so that e.g.
/// a VOP2 instruction promoted to the VOP3A encoding is VOP2 | VOP3A.
#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug)]
pub struct Format(pub u16);

impl Format {
    pub const PSEUDO: Format = Format(0);
    pub const SOP1: Format = Format(1);
    pub const SOP2: Format = Format(2);
    pub const SOPK: Format = Format(3);
    pub const SOPP: Format = Format(4);
    pub const SOPC: Format = Format(5);
    pub const SMEM: Format = Format(6);
    pub const VINTRP: Format = Format(7);
    pub const DS: Format = Format(8);
    pub const MUBUF: Format = Format(10);
    pub const MIMG: Format = Format(11);
    pub const EXP: Format = Format(12);
    pub const PSEUDO_BRANCH: Format = Format(16);

    pub const VOP1: Format = Format(1 << 8);
    pub const VOP2: Format = Format(1 << 9);
    pub const VOPC: Format = Format(1 << 10);
    pub const VOP3B: Format = Format(1 << 11);
    pub const VOP3P: Format = Format(1 << 12);
    pub const VOP3A: Format = Format(1 << 13);
    pub const DPP: Format = Format(1 << 14);
    pub const SDWA: Format = Format(1 << 15);

    pub fn base(self) -> Format {
        Format(self.0 & 0xFF)
    }

    pub fn with(self, other: Format) -> Format {
        Format(self.0 | other.0)
    }

    pub fn has(self, other: Format) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_valu(self) -> bool {
        self.0 & (Format::VOP1.0
            | Format::VOP2.0
            | Format::VOPC.0
            | Format::VOP3A.0
            | Format::VOP3B.0
            | Format::VOP3P.0)
            != 0
    }

    pub fn is_salu(self) -> bool {
        matches!(
            self.base(),
            Format::SOP1
                | Format::SOP2
                | Format::SOPK
                | Format::SOPP
                | Format::SOPC
        ) && !self.is_valu()
    }
}

#[derive(Clone, Copy, Eq, Hash, PartialEq, Debug)]
pub enum Opcode {
    /* pseudo instructions */
    Phi,
    LinearPhi,
    ParallelCopy,
    Spill,
    Reload,
    StartLinearVgpr,
    EndLinearVgpr,
    LogicalStart,
    LogicalEnd,
    Branch,
    BranchZ,
    BranchNz,

    /* scalar ALU */
    SMovB32,
    SMovB64,
    SCselectB64,
    SAndB64,
    SAndn2B64,
    SOrB64,
    SAddU32,
    SCmpEqU32,
    SEndpgm,
    SBranch,
    SCbranchSccZ,
    SCbranchSccNz,
    SCbranchExecZ,
    SCbranchExecNz,
    SCbranchVccZ,
    SCbranchVccNz,

    /* scalar memory */
    SLoadDword,
    SLoadDwordx2,
    SLoadDwordx4,

    /* vector ALU */
    VMovB32,
    VAddF32,
    VMulF32,
    VMacF32,
    VAddCoU32,
    VCndmaskB32,
    VCmpLtF32,
    VWritelaneB32,
    VReadlaneB32,
    VInterpP1F32,
    VInterpP2F32,

    /* memory */
    BufferLoadDword,
    DsReadB32,
    DsWriteB32,
    ImageSample,

    /* export */
    Exp,
}

impl Opcode {
    pub fn is_phi(self) -> bool {
        matches!(self, Opcode::Phi | Opcode::LinearPhi)
    }
}

/// Format-specific instruction fields.  One tagged payload on the shared
/// instruction header, never a type hierarchy.
#[derive(Clone, Debug)]
pub enum Payload {
    None,
    Sopk {
        imm: u16,
    },
    Sopp {
        imm: u16,
    },
    Smem {
        glc: bool,
        nv: bool,
    },
    Vop3a {
        abs: [bool; 3],
        opsel: [bool; 3],
        clamp: bool,
        omod: u8,
        neg: [bool; 3],
    },
    Vintrp {
        attribute: u8,
        component: u8,
    },
    Ds {
        offset0: u16,
        offset1: u8,
        gds: bool,
    },
    Mubuf {
        dfmt: u8,
        nfmt: u8,
        offset: u16,
        offen: bool,
        idxen: bool,
        glc: bool,
        slc: bool,
        tfe: bool,
        lds: bool,
    },
    Mimg {
        dmask: u8,
        unrm: bool,
        glc: bool,
        slc: bool,
        tfe: bool,
        da: bool,
        d16: bool,
    },
    Exp {
        enabled_mask: u8,
        dest: u8,
        compressed: bool,
        done: bool,
        valid_mask: bool,
    },
    /// Branch pseudos carry their target block until the assembler patches
    /// the immediate.
    Branch {
        target: u32,
    },
}

impl Payload {
    pub fn vop3a_default() -> Payload {
        Payload::Vop3a {
            abs: [false; 3],
            opsel: [false; 3],
            clamp: false,
            omod: 0,
            neg: [false; 3],
        }
    }
}

#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    pub format: Format,
    pub operands: SmallVec<[Operand; 4]>,
    pub definitions: SmallVec<[Definition; 2]>,
    pub payload: Payload,
}

impl Instruction {
    pub fn new(
        opcode: Opcode,
        format: Format,
        operands: Vec<Operand>,
        definitions: Vec<Definition>,
    ) -> Instruction {
        Instruction {
            opcode: opcode,
            format: format,
            operands: SmallVec::from_vec(operands),
            definitions: SmallVec::from_vec(definitions),
            payload: Payload::None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Instruction {
        self.payload = payload;
        self
    }

    pub fn new_phi(def: Definition, operands: Vec<Operand>) -> Instruction {
        Instruction::new(Opcode::Phi, Format::PSEUDO, operands, vec![def])
    }

    pub fn new_linear_phi(
        def: Definition,
        operands: Vec<Operand>,
    ) -> Instruction {
        Instruction::new(Opcode::LinearPhi, Format::PSEUDO, operands, vec![def])
    }

    pub fn new_branch(opcode: Opcode, target: u32) -> Instruction {
        assert!(matches!(
            opcode,
            Opcode::Branch | Opcode::BranchZ | Opcode::BranchNz
        ));
        Instruction::new(opcode, Format::PSEUDO_BRANCH, vec![], vec![])
            .with_payload(Payload::Branch { target: target })
    }

    pub fn is_phi(&self) -> bool {
        self.opcode.is_phi()
    }

    pub fn is_branch(&self) -> bool {
        self.format.base() == Format::PSEUDO_BRANCH
    }

    pub fn branch_target(&self) -> u32 {
        match self.payload {
            Payload::Branch { target } => target,
            _ => panic!("not a branch"),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {{", self.opcode)?;
        for (i, def) in self.definitions.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { " " } else { ", " }, def)?;
        }
        write!(f, " }} {{")?;
        for (i, op) in self.operands.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { " " } else { ", " }, op)?;
        }
        write!(f, " }}")
    }
}

/// A basic block.  Blocks own their instructions and refer to other
/// blocks only by index.  The two predecessor/successor lists reflect the
/// structured source CFG (logical) and the divergence-lowered CFG
/// (linear); every pass must be explicit about which graph it walks.
#[derive(Debug, Default)]
pub struct Block {
    pub index: usize,
    pub instructions: Vec<Instruction>,
    pub logical_preds: Vec<u32>,
    pub linear_preds: Vec<u32>,
    pub logical_succs: Vec<u32>,
    pub linear_succs: Vec<u32>,
    pub loop_nest_depth: u32,
    pub logical_idom: i32,
    pub linear_idom: i32,
    pub sgpr_demand: u16,
    pub vgpr_demand: u16,
}

impl Block {
    pub fn new(index: usize) -> Block {
        Block {
            index: index,
            logical_idom: -1,
            linear_idom: -1,
            ..Default::default()
        }
    }

    pub fn insert_before_branch(&mut self, instr: Instruction) {
        let ends_in_branch =
            self.instructions.last().map_or(false, |i| i.is_branch());
        if ends_in_branch {
            let at = self.instructions.len() - 1;
            self.instructions.insert(at, instr);
        } else {
            self.instructions.push(instr);
        }
    }

    pub fn insert_before_logical_end(&mut self, instr: Instruction) {
        for i in (0..self.instructions.len()).rev() {
            if self.instructions[i].opcode == Opcode::LogicalEnd {
                self.instructions.insert(i, instr);
                return;
            }
        }
        self.insert_before_branch(instr);
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block {} {{", self.index)?;
        for i in &self.instructions {
            writeln!(f, "    {}", i)?;
        }
        writeln!(f, "}}")
    }
}

/// Chip generations the core distinguishes.  The scalar register file
/// grew from 512 to 800 entries with Gfx8 while the addressable window
/// shrank by two.
#[derive(Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Debug)]
pub enum ChipClass {
    Gfx6,
    Gfx7,
    Gfx8,
    Gfx9,
}

impl ChipClass {
    pub fn total_sgprs(self) -> u16 {
        if self >= ChipClass::Gfx8 {
            800
        } else {
            512
        }
    }

    pub fn max_addressable_sgpr(self) -> u16 {
        if self >= ChipClass::Gfx8 {
            102
        } else {
            104
        }
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct Config {
    pub num_sgprs: u16,
    pub num_vgprs: u16,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

pub struct Program {
    pub blocks: Vec<Block>,
    pub chip_class: ChipClass,
    pub stage: ShaderStage,
    pub config: Config,
    /// Occupancy chosen by the demand analysis; 0 marks a program whose
    /// demand exceeds the hardware bounds.
    pub num_waves: u16,
    /// Program-wide demand maxima from the last liveness run.
    pub sgpr_demand: u16,
    pub vgpr_demand: u16,
    /// Per-wave register limits implied by `num_waves`.
    pub max_sgpr: u16,
    pub max_vgpr: u16,
    allocation_id: u32,
}

impl Program {
    pub fn new(chip_class: ChipClass, stage: ShaderStage) -> Program {
        Program {
            blocks: Vec::new(),
            chip_class: chip_class,
            stage: stage,
            config: Config::default(),
            num_waves: 0,
            sgpr_demand: 0,
            vgpr_demand: 0,
            max_sgpr: 0,
            max_vgpr: 0,
            allocation_id: 1,
        }
    }

    pub fn allocate_id(&mut self) -> u32 {
        let id = self.allocation_id;
        self.allocation_id += 1;
        id
    }

    pub fn peek_allocation_id(&self) -> u32 {
        self.allocation_id
    }

    pub fn set_allocation_id(&mut self, id: u32) {
        assert!(id >= self.allocation_id);
        self.allocation_id = id;
    }

    pub fn alloc_temp(&mut self, rc: RegClass) -> Temp {
        Temp::new(self.allocate_id(), rc)
    }

    pub fn create_and_insert_block(&mut self) -> usize {
        let index = self.blocks.len();
        self.blocks.push(Block::new(index));
        index
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.blocks {
            write!(f, "{}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_constant_encodings() {
        assert_eq!(Operand::constant(0).phys_reg(), PhysReg(128));
        assert_eq!(Operand::constant(64).phys_reg(), PhysReg(192));
        assert_eq!(Operand::constant(0xFFFFFFFF).phys_reg(), PhysReg(193));
        assert_eq!(Operand::constant(0xFFFFFFF0).phys_reg(), PhysReg(208));
        assert_eq!(Operand::constant(0x3f800000).phys_reg(), PhysReg(242));
        assert_eq!(Operand::constant(0x3e22f983).phys_reg(), PhysReg(248));
        assert!(Operand::constant(1000).is_literal());
        assert!(!Operand::constant(33).is_literal());
    }

    #[test]
    fn format_bits_compose() {
        let fmt = Format::VOP2.with(Format::VOP3A);
        assert!(fmt.has(Format::VOP2));
        assert!(fmt.has(Format::VOP3A));
        assert!(fmt.is_valu());
        assert_eq!(fmt.base(), Format(0));
        assert!(Format::SOP2.is_salu());
        assert!(!Format::SMEM.is_salu());
    }

    #[test]
    fn register_class_properties() {
        assert_eq!(RegClass::Sgpr(2).size(), 2);
        assert_eq!(RegClass::Scc.size(), 0);
        assert!(RegClass::Sgpr(1).is_linear());
        assert!(RegClass::LinearVgpr(1).is_linear());
        assert!(!RegClass::Vgpr(1).is_linear());
        assert_eq!(RegClass::LinearVgpr(1).bank(), RegBank::Vgpr);
    }

    #[test]
    fn insert_before_logical_end() {
        let mut block = Block::new(0);
        block.instructions.push(Instruction::new(
            Opcode::LogicalEnd,
            Format::PSEUDO,
            vec![],
            vec![],
        ));
        block.instructions.push(Instruction::new_branch(Opcode::Branch, 1));
        block.insert_before_logical_end(Instruction::new(
            Opcode::SMovB64,
            Format::SOP1,
            vec![Operand::constant(0)],
            vec![Definition::of_temp(Temp::new(1, RegClass::Sgpr(2)))],
        ));
        assert_eq!(block.instructions[0].opcode, Opcode::SMovB64);
        assert_eq!(block.instructions[1].opcode, Opcode::LogicalEnd);
    }
}
