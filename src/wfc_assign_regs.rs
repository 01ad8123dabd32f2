/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! SSA register allocation.
//!
//! Blocks are walked in CFG order with a per-block rename map.  Values
//! whose live range gets split (fixed-register constraints, eviction,
//! displacement) receive fresh names, and the SSA form is repaired on
//! the fly in the Braun/Hack style: reads recurse through predecessors,
//! unsealed blocks get incomplete phis, and phis that turn out trivial
//! are removed again with their users re-tested.
//!
//! The register file is a flat 512-entry array per block walk: slot 0 is
//! free, a temp id marks occupancy and 0xFFFF marks a slot blocked
//! within an allocation attempt.

use crate::wfc_ir::*;
use crate::wfc_liveness::live_var_analysis;

use log::debug;
use rustc_hash::FxHashMap;
use std::cmp::max;
use std::collections::BTreeSet;
use std::mem;

const BLOCKED: u32 = 0xFFFF;

type RegFile = [u32; 512];

struct PhiEntry {
    arena: usize,
    block_idx: usize,
    /// Defs of later phis reading this phi, for the triviality cascade.
    users: Vec<u32>,
}

struct CreatedPhi {
    block_idx: usize,
    instr: Instruction,
    removed: bool,
}

struct RaCtx<'a> {
    program: &'a mut Program,
    max_sgpr: u32,
    max_vgpr: u32,
    assignments: FxHashMap<u32, (PhysReg, RegClass)>,
    renames: Vec<FxHashMap<u32, Temp>>,
    orig_names: FxHashMap<u32, Temp>,
    affinities: FxHashMap<u32, u32>,
    filled: Vec<bool>,
    sealed: Vec<bool>,
    created: Vec<CreatedPhi>,
    phis_per_block: Vec<Vec<usize>>,
    incomplete_per_block: Vec<Vec<usize>>,
    phi_map: FxHashMap<u32, PhiEntry>,
    /// Removed trivial phis: def id -> replacement value.  Applied to
    /// all remaining operand references in a final sweep.
    substitutions: FxHashMap<u32, Temp>,
    /// Live-in sets (the kill pre-pass reduces live-out to live-in).
    live_in: Vec<BTreeSet<Temp>>,
    /// Per block: temp id -> index of the killing instruction, None for
    /// live-outs.
    kills: Vec<FxHashMap<u32, Option<usize>>>,
}

impl<'a> RaCtx<'a> {
    fn resolve(&self, mut t: Temp) -> Temp {
        while let Some(s) = self.substitutions.get(&t.id) {
            t = *s;
        }
        t
    }

    fn read_variable(&mut self, val: Temp, block_idx: usize) -> Temp {
        match self.renames[block_idx].get(&val.id) {
            Some(t) => *t,
            None => self.read_variable_recursive(val, block_idx),
        }
    }

    fn read_variable_recursive(
        &mut self,
        val: Temp,
        block_idx: usize,
    ) -> Temp {
        /* per-lane values merge along the logical graph, everything
         * else along the linear graph */
        let is_logical = !val.rc.is_linear();
        let preds: Vec<u32> = if is_logical {
            self.program.blocks[block_idx].logical_preds.clone()
        } else {
            self.program.blocks[block_idx].linear_preds.clone()
        };
        assert!(!preds.is_empty());

        let new_val;
        if !self.sealed[block_idx] {
            /* not all predecessors are known yet: place an incomplete
             * phi and fill it when the block seals */
            new_val = Temp::new(self.program.allocate_id(), val.rc);
            let reg = self.assignments[&val.id].0;
            let mut def = Definition::of_temp(new_val);
            def.set_fixed(reg);
            self.assignments.insert(new_val.id, (reg, val.rc));

            let opcode = if is_logical {
                Opcode::Phi
            } else {
                Opcode::LinearPhi
            };
            let operands = vec![Operand::of_temp(val); preds.len()];
            let phi = Instruction::new(opcode, Format::PSEUDO, operands, vec![def]);

            let arena = self.created.len();
            self.created.push(CreatedPhi {
                block_idx: block_idx,
                instr: phi,
                removed: false,
            });
            self.incomplete_per_block[block_idx].push(arena);
            self.phi_map.insert(
                new_val.id,
                PhiEntry {
                    arena: arena,
                    block_idx: block_idx,
                    users: Vec::new(),
                },
            );
        } else if preds.len() == 1 {
            new_val = self.read_variable(val, preds[0] as usize);
        } else {
            /* create a phi and test it for triviality afterwards */
            let id = self.program.allocate_id();
            let phi_val = Temp::new(id, val.rc);
            self.renames[block_idx].insert(val.id, phi_val);
            let reg = self.assignments[&val.id].0;
            let mut def = Definition::of_temp(phi_val);
            def.set_fixed(reg);
            self.assignments.insert(id, (reg, val.rc));

            let arena = self.created.len();
            self.phi_map.insert(
                id,
                PhiEntry {
                    arena: arena,
                    block_idx: block_idx,
                    users: Vec::new(),
                },
            );

            let mut operands = Vec::with_capacity(preds.len());
            for &pred in &preds {
                let op_temp = self.read_variable(val, pred as usize);
                let mut op = Operand::of_temp(op_temp);
                assert!(self.assignments.contains_key(&op_temp.id));
                op.set_fixed(self.assignments[&op_temp.id].0);
                operands.push(op);
                if op_temp != phi_val && self.phi_map.contains_key(&op_temp.id)
                {
                    self.phi_map
                        .get_mut(&op_temp.id)
                        .unwrap()
                        .users
                        .push(id);
                }
            }

            let opcode = if is_logical {
                Opcode::Phi
            } else {
                Opcode::LinearPhi
            };
            let phi = Instruction::new(opcode, Format::PSEUDO, operands, vec![def]);
            self.created.push(CreatedPhi {
                block_idx: block_idx,
                instr: phi,
                removed: false,
            });
            self.phis_per_block[block_idx].push(arena);

            new_val = self.try_remove_trivial_phi(id);
        }

        self.renames[block_idx].insert(val.id, new_val);
        self.orig_names.insert(new_val.id, val);
        new_val
    }

    /// A phi is trivial iff all operands are the same value or the phi
    /// itself.  Removing one may make its users trivial in turn.
    fn try_remove_trivial_phi(&mut self, phi_def: u32) -> Temp {
        let (arena, block_idx) = match self.phi_map.get(&phi_def) {
            Some(entry) => (entry.arena, entry.block_idx),
            None => {
                return self.resolve(Temp::new(phi_def, RegClass::Sgpr(1)))
            }
        };
        assert!(block_idx != 0);

        let def = self.created[arena].instr.definitions[0].temp();
        let mut same = Temp::none();
        let operands: Vec<Temp> = self.created[arena]
            .instr
            .operands
            .iter()
            .map(|op| op.temp())
            .collect();
        for op in operands {
            let op = self.resolve(op);
            if op == same || op == def {
                continue;
            }
            if same.id != 0 {
                /* not trivial */
                return def;
            }
            same = op;
        }
        assert!(same.id != 0 && same != def);

        /* reroute everything to `same` and drop the phi */
        self.created[arena].removed = true;
        self.substitutions.insert(def.id, same);
        let users = self.phi_map.remove(&phi_def).unwrap().users;

        let orig_var = self
            .orig_names
            .get(&same.id)
            .map(|t| t.id)
            .unwrap_or(same.id);
        for block_renames in self.renames.iter_mut() {
            if let Some(t) = block_renames.get_mut(&orig_var) {
                if t.id == def.id {
                    *t = same;
                }
            }
        }

        for user in users {
            if self.phi_map.contains_key(&user) {
                self.try_remove_trivial_phi(user);
            }
        }

        /* cascaded removals may have renamed the value yet again */
        self.renames[block_idx]
            .get(&orig_var)
            .copied()
            .unwrap_or(same)
    }

    /// Sliding-window scan for `size` stride-aligned dwords in
    /// [lb, ub).  With `num_moves > 0`, up to that many occupying temps
    /// may be displaced; the moves are appended to `pc` and the file is
    /// updated on success.
    fn find_reg(
        &mut self,
        reg_file: &mut RegFile,
        pc: &mut Vec<(Operand, Definition)>,
        lb: u32,
        ub: u32,
        size: u32,
        stride: u32,
        num_moves: u32,
    ) -> Option<u32> {
        assert!(num_moves <= size);

        /* trivial case: no moves */
        if num_moves == 0 {
            let mut reg_lo = lb;
            while reg_lo + size <= ub {
                if reg_file[reg_lo as usize] != 0 {
                    reg_lo += stride;
                    continue;
                }
                let mut found = true;
                let mut reg_hi = reg_lo;
                for i in 1..size {
                    reg_hi = reg_lo + i;
                    if reg_file[reg_hi as usize] != 0 {
                        found = false;
                        break;
                    }
                }
                if found {
                    return Some(reg_lo);
                }
                while reg_lo <= reg_hi {
                    reg_lo += stride;
                }
            }
            return None;
        }

        let mut reg_lo = lb;
        let mut reg_hi = lb + size - 1;
        while reg_hi < ub {
            /* reject windows cutting through an allocation */
            if reg_lo > lb + 1
                && reg_file[reg_lo as usize]
                    == reg_file[(reg_lo - 1) as usize]
            {
                reg_lo += stride;
                reg_hi += stride;
                continue;
            }
            if reg_hi < ub - 1
                && reg_file[reg_hi as usize]
                    == reg_file[(reg_hi + 1) as usize]
            {
                reg_lo += stride;
                reg_hi += stride;
                continue;
            }

            /* at most num_moves occupants, none as large as the
             * incoming value */
            let mut k = 0;
            let mut vars: BTreeSet<u32> = BTreeSet::new();
            let mut stop = false;
            for j in reg_lo..=reg_hi {
                let occupant = reg_file[j as usize];
                if occupant == 0 {
                    continue;
                }
                k += 1;
                if occupant == BLOCKED || k > num_moves {
                    stop = true;
                    break;
                }
                if self.assignments[&occupant].1.size() >= size {
                    stop = true;
                    break;
                }
                vars.insert(occupant);
            }
            if stop {
                reg_lo += stride;
                reg_hi += stride;
                continue;
            }

            /* relocate the occupants out of the (blocked) window */
            let mut file_copy = *reg_file;
            for j in reg_lo..=reg_hi {
                file_copy[j as usize] = BLOCKED;
            }

            let mut parallelcopy: Vec<(Operand, Definition)> = Vec::new();
            let mut success = true;
            let mut remaining_moves = num_moves - k;
            for &id in &vars {
                let (var_reg, var_rc) = self.assignments[&id];
                let var_size = var_rc.size();
                let mut var_stride = 1;
                if var_rc.bank() == RegBank::Sgpr {
                    if var_size == 2 {
                        var_stride = 2;
                    }
                    if var_size > 3 {
                        var_stride = 4;
                    }
                }

                let mut moves = 0;
                let mut res = self.find_reg(
                    &mut file_copy,
                    &mut parallelcopy,
                    lb,
                    ub,
                    var_size,
                    var_stride,
                    0,
                );
                while res.is_none() && remaining_moves > 0 {
                    remaining_moves -= 1;
                    moves += 1;
                    res = self.find_reg(
                        &mut file_copy,
                        &mut parallelcopy,
                        lb,
                        ub,
                        var_size,
                        var_stride,
                        moves,
                    );
                }
                let new_lo = match res {
                    Some(r) => r,
                    None => {
                        success = false;
                        break;
                    }
                };
                for i in new_lo..new_lo + var_size {
                    file_copy[i as usize] = BLOCKED;
                }

                let mut pc_op = Operand::of_temp(Temp::new(id, var_rc));
                pc_op.set_fixed(var_reg);
                let pc_def = Definition::phys(PhysReg(new_lo), var_rc);
                parallelcopy.push((pc_op, pc_def));
            }

            if success {
                pc.append(&mut parallelcopy);
                *reg_file = file_copy;
                for i in reg_lo..reg_lo + size {
                    reg_file[i as usize] = 0;
                }
                return Some(reg_lo);
            }

            reg_lo += stride;
            reg_hi += stride;
        }

        None
    }

    fn get_reg(
        &mut self,
        reg_file: &mut RegFile,
        rc: RegClass,
        pc: &mut Vec<(Operand, Definition)>,
        instr: &mut Instruction,
    ) -> PhysReg {
        let size = rc.size();
        let (lb, ub, stride) = match rc.bank() {
            RegBank::Vgpr => (256, 256 + self.max_vgpr, 1),
            RegBank::Sgpr => (
                0,
                self.max_sgpr,
                if size == 2 {
                    2
                } else if size >= 4 {
                    4
                } else {
                    1
                },
            ),
        };

        /* try without moves first */
        if let Some(reg) = self.find_reg(reg_file, pc, lb, ub, size, stride, 0)
        {
            return PhysReg(reg);
        }

        /* then with 1..n displacements */
        assert!(size > 1, "single dword allocation failed without moves");
        for k in 1..=size {
            let reg_lo =
                match self.find_reg(reg_file, pc, lb, ub, size, stride, k) {
                    Some(r) => r,
                    None => continue,
                };

            /* the caller fills in the definition cells */
            for i in reg_lo..reg_lo + size {
                reg_file[i as usize] = 0;
            }

            /* give the emitted moves fresh names and rename any moved
             * operand of the current instruction */
            for ci in 0..pc.len() {
                if pc[ci].1.is_temp() {
                    /* not from this placement, already named */
                    continue;
                }
                let def_rc = pc[ci].1.reg_class();
                let def_reg = pc[ci].1.phys_reg();
                let tmp = Temp::new(self.program.allocate_id(), def_rc);
                pc[ci].1.set_temp(tmp);
                self.assignments.insert(tmp.id, (def_reg, def_rc));
                for i in def_reg.0..def_reg.0 + def_rc.size() {
                    reg_file[i as usize] = tmp.id;
                }

                let moved_id = pc[ci].0.temp_id();
                for op in instr.operands.iter_mut() {
                    if op.is_temp() && op.temp_id() == moved_id {
                        op.set_temp(tmp);
                        op.set_fixed(def_reg);
                    }
                }
            }

            /* a displaced value may have landed on a killed operand's
             * registers; that operand then needs a new home as well */
            for i in 0..instr.operands.len() {
                let op = instr.operands[i];
                if !op.is_temp()
                    || op.temp().bank() != rc.bank()
                    || !op.is_kill()
                    || !op.is_fixed()
                {
                    continue;
                }
                for j in 0..op.size() {
                    if reg_file[(op.phys_reg().0 + j) as usize] != 0 {
                        let op_rc = op.reg_class();
                        let reg = self.get_reg(reg_file, op_rc, pc, instr);
                        let tmp =
                            Temp::new(self.program.allocate_id(), op_rc);
                        let mut def = Definition::of_temp(tmp);
                        def.set_fixed(reg);
                        self.assignments.insert(tmp.id, (reg, op_rc));
                        pc.push((op, def));
                        instr.operands[i].set_temp(tmp);
                        instr.operands[i].set_fixed(reg);
                        break;
                    }
                }
            }

            return PhysReg(reg_lo);
        }

        panic!("no register found for {} within bounds", rc);
    }

    /// Kill points per block plus phi affinities; reduces live-out sets
    /// to live-in sets along the way.
    fn compute_kills_and_affinities(&mut self) {
        for block_idx in (0..self.program.blocks.len()).rev() {
            let live_outs: Vec<Temp> =
                self.live_in[block_idx].iter().copied().collect();
            for t in live_outs {
                self.kills[block_idx].entry(t.id).or_insert(None);
            }

            for idx in
                (0..self.program.blocks[block_idx].instructions.len()).rev()
            {
                let instr =
                    &self.program.blocks[block_idx].instructions[idx];
                if !instr.is_phi() {
                    let temps: Vec<Temp> = instr
                        .operands
                        .iter()
                        .filter(|op| op.is_temp())
                        .map(|op| op.temp())
                        .collect();
                    for t in temps {
                        if self.live_in[block_idx].insert(t) {
                            self.kills[block_idx]
                                .entry(t.id)
                                .or_insert(Some(idx));
                        }
                    }
                } else {
                    /* the smallest-id operand from an already placed
                     * predecessor becomes the coalescing target */
                    let def_id = instr.definitions[0].temp_id();
                    let def_rc = instr.definitions[0].reg_class();
                    let preds = if instr.opcode == Opcode::Phi {
                        &self.program.blocks[block_idx].logical_preds
                    } else {
                        &self.program.blocks[block_idx].linear_preds
                    };
                    let mut preferred = def_id;
                    let mut op_idx = usize::MAX;
                    for (i, op) in instr.operands.iter().enumerate() {
                        if (preds[i] as usize) < block_idx
                            && op.is_temp()
                            && op.temp_id() < preferred
                            && op.reg_class() == def_rc
                        {
                            assert!(!op.is_undefined());
                            preferred = op.temp_id();
                            op_idx = i;
                        }
                    }
                    let affinity_ops: Vec<u32> = instr
                        .operands
                        .iter()
                        .enumerate()
                        .filter(|(i, op)| op.is_temp() && *i != op_idx)
                        .map(|(_, op)| op.temp_id())
                        .collect();
                    for op_id in affinity_ops {
                        self.affinities.entry(op_id).or_insert(preferred);
                    }
                    if op_idx != usize::MAX {
                        self.affinities.entry(def_id).or_insert(preferred);
                    }
                }

                let instr =
                    &self.program.blocks[block_idx].instructions[idx];
                let defs: Vec<Temp> = instr
                    .definitions
                    .iter()
                    .filter(|d| d.is_temp())
                    .map(|d| d.temp())
                    .collect();
                for t in defs {
                    self.live_in[block_idx].remove(&t);
                }
            }
        }
    }

    fn process_block(&mut self, block_idx: usize) {
        let mut register_file: RegFile = [0; 512];
        assert!(block_idx != 0 || self.live_in[block_idx].is_empty());
        for t in &self.live_in[block_idx] {
            let (reg, _) = *self
                .assignments
                .get(&t.id)
                .expect("live-in temp without assignment");
            for i in 0..t.size() {
                register_file[(reg.0 + i) as usize] = t.id;
            }
        }

        let old_instrs =
            mem::take(&mut self.program.blocks[block_idx].instructions);
        let mut instructions: Vec<Instruction> =
            Vec::with_capacity(old_instrs.len());

        for (this_idx, mut instr) in old_instrs.into_iter().enumerate() {
            let mut parallelcopy: Vec<(Operand, Definition)> = Vec::new();

            if instr.is_phi() {
                /* phis were either repaired at sealing time or still
                 * wait for it; only their defs are named here */
                let def = instr.definitions[0];
                self.renames[block_idx].insert(def.temp_id(), def.temp());
            } else {
                /* operands */
                for i in 0..instr.operands.len() {
                    if !instr.operands[i].is_temp() {
                        continue;
                    }

                    if self.kills[block_idx]
                        .get(&instr.operands[i].temp_id())
                        == Some(&Some(this_idx))
                    {
                        instr.operands[i].set_kill(true);
                    }

                    let renamed = self
                        .read_variable(instr.operands[i].temp(), block_idx);
                    instr.operands[i].set_temp(renamed);

                    if instr.operands[i].is_fixed() {
                        let target = instr.operands[i].phys_reg();
                        let current = self.assignments[&renamed.id].0;
                        if target != current {
                            /* move a blocking value out of the way */
                            if register_file[target.0 as usize] != 0 {
                                let blocking_id =
                                    register_file[target.0 as usize];
                                let b_rc = self.assignments[&blocking_id].1;
                                let mut pc_op = Operand::of_temp(Temp::new(
                                    blocking_id,
                                    b_rc,
                                ));
                                pc_op.set_fixed(target);
                                let reg = self.get_reg(
                                    &mut register_file,
                                    b_rc,
                                    &mut parallelcopy,
                                    &mut instr,
                                );
                                let tmp = Temp::new(
                                    self.program.allocate_id(),
                                    b_rc,
                                );
                                let mut pc_def = Definition::of_temp(tmp);
                                pc_def.set_fixed(reg);
                                self.assignments
                                    .insert(tmp.id, (reg, b_rc));
                                for j in 0..b_rc.size() {
                                    register_file
                                        [(pc_op.phys_reg().0 + j) as usize] =
                                        0;
                                    register_file[(reg.0 + j) as usize] =
                                        tmp.id;
                                }
                                parallelcopy.push((pc_op, pc_def));
                            }

                            /* and copy the operand into place */
                            let rc = instr.operands[i].reg_class();
                            let mut pc_op = instr.operands[i];
                            pc_op.set_fixed(current);
                            pc_op.set_kill(false);
                            let tmp =
                                Temp::new(self.program.allocate_id(), rc);
                            let mut pc_def = Definition::of_temp(tmp);
                            pc_def.set_fixed(target);
                            self.assignments.insert(tmp.id, (target, rc));
                            instr.operands[i].set_temp(tmp);
                            for j in 0..rc.size() {
                                register_file[(current.0 + j) as usize] = 0;
                                register_file[(target.0 + j) as usize] =
                                    tmp.id;
                            }
                            parallelcopy.push((pc_op, pc_def));
                        }
                    } else {
                        instr.operands[i]
                            .set_fixed(self.assignments[&renamed.id].0);
                    }
                }

                /* killed operands release their registers before the
                 * definitions take theirs */
                for i in 0..instr.operands.len() {
                    let op = instr.operands[i];
                    if op.is_temp() && op.is_fixed() && op.is_kill() {
                        for j in 0..op.size() {
                            register_file
                                [(op.phys_reg().0 + j) as usize] = 0;
                        }
                    }
                }
            }

            /* definitions */
            for i in 0..instr.definitions.len() {
                if !instr.definitions[i].is_temp() {
                    continue;
                }

                if instr.definitions[i].is_fixed() {
                    let target = instr.definitions[i].phys_reg();
                    if instr.definitions[i].size() > 0
                        && register_file[target.0 as usize] != 0
                    {
                        /* evict the blocking value */
                        let blocking_id = register_file[target.0 as usize];
                        let b_rc = self.assignments[&blocking_id].1;
                        let mut pc_op =
                            Operand::of_temp(Temp::new(blocking_id, b_rc));
                        pc_op.set_fixed(self.assignments[&blocking_id].0);
                        let reg = self.get_reg(
                            &mut register_file,
                            b_rc,
                            &mut parallelcopy,
                            &mut instr,
                        );
                        let tmp =
                            Temp::new(self.program.allocate_id(), b_rc);
                        let mut pc_def = Definition::of_temp(tmp);
                        pc_def.set_fixed(reg);
                        self.assignments.insert(tmp.id, (reg, b_rc));
                        for j in 0..b_rc.size() {
                            register_file
                                [(pc_op.phys_reg().0 + j) as usize] =
                                BLOCKED;
                            register_file[(reg.0 + j) as usize] = tmp.id;
                        }
                        parallelcopy.push((pc_op, pc_def));
                    }
                } else {
                    let def_rc = instr.definitions[i].reg_class();
                    let def_id = instr.definitions[i].temp_id();

                    if matches!(
                        instr.opcode,
                        Opcode::VInterpP2F32 | Opcode::VMacF32
                    ) {
                        /* these read and write their accumulator */
                        let reg = instr.operands[2].phys_reg();
                        instr.definitions[i].set_fixed(reg);
                    } else if instr.definitions[i]
                        .hint()
                        .map_or(false, |h| {
                            register_file[h.0 as usize] == 0
                        })
                    {
                        let hint = instr.definitions[i].hint().unwrap();
                        instr.definitions[i].set_fixed(hint);
                    } else if let Some(reg) = self
                        .affinities
                        .get(&def_id)
                        .and_then(|pref| self.assignments.get(pref))
                        .map(|(reg, _)| *reg)
                    {
                        /* prefer the phi-affine register if it is free */
                        let free = (0..def_rc.size()).all(|j| {
                            register_file[(reg.0 + j) as usize] == 0
                        });
                        if free {
                            instr.definitions[i].set_fixed(reg);
                        } else {
                            let reg = self.get_reg(
                                &mut register_file,
                                def_rc,
                                &mut parallelcopy,
                                &mut instr,
                            );
                            instr.definitions[i].set_fixed(reg);
                        }
                    } else {
                        let reg = self.get_reg(
                            &mut register_file,
                            def_rc,
                            &mut parallelcopy,
                            &mut instr,
                        );
                        instr.definitions[i].set_fixed(reg);
                    }
                }

                let def = instr.definitions[i];
                self.assignments
                    .insert(def.temp_id(), (def.phys_reg(), def.reg_class()));
                /* only values with a kill point (or live-out dummy)
                 * occupy the file */
                if self.kills[block_idx].contains_key(&def.temp_id()) {
                    for j in 0..def.size() {
                        register_file[(def.phys_reg().0 + j) as usize] =
                            def.temp_id();
                    }
                }
                self.renames[block_idx].insert(def.temp_id(), def.temp());
            }

            /* the moves decided above become one parallel copy in front
             * of the instruction */
            if !parallelcopy.is_empty() {
                let mut pc_ops = Vec::with_capacity(parallelcopy.len());
                let mut pc_defs = Vec::with_capacity(parallelcopy.len());
                for (mut op, def) in parallelcopy {
                    /* the operand might be a renamed value; track names
                     * from the original one */
                    if let Some(orig) = self.orig_names.get(&op.temp_id()) {
                        op.set_temp(*orig);
                    }
                    let orig_id = op.temp_id();
                    self.orig_names.insert(def.temp_id(), op.temp());

                    let renamed = self.read_variable(op.temp(), block_idx);
                    op.set_temp(renamed);
                    self.renames[block_idx].insert(orig_id, def.temp());

                    pc_ops.push(op);
                    pc_defs.push(def);
                }
                instructions.push(Instruction::new(
                    Opcode::ParallelCopy,
                    Format::PSEUDO,
                    pc_ops,
                    pc_defs,
                ));
            }

            /* the carry output could not be placed in VCC: switch to
             * the VOP3A encoding which takes an arbitrary pair */
            if instr.opcode == Opcode::VAddCoU32
                && instr.definitions[1].phys_reg() != VCC
                && !instr.format.has(Format::VOP3A)
            {
                instr.format = instr.format.with(Format::VOP3A);
                instr.payload = Payload::vop3a_default();
            }

            instructions.push(instr);
        }

        self.program.blocks[block_idx].instructions = instructions;
        self.filled[block_idx] = true;

        /* seal every successor whose predecessors are now all filled */
        let succs = self.program.blocks[block_idx].linear_succs.clone();
        for succ in succs {
            let succ = succ as usize;
            if self.sealed[succ] {
                continue;
            }
            let all_filled = self.program.blocks[succ]
                .linear_preds
                .iter()
                .all(|p| self.filled[*p as usize]);
            if !all_filled {
                continue;
            }
            self.seal_block(succ);
        }
    }

    fn seal_block(&mut self, block_idx: usize) {
        /* finish incomplete phis and test them for triviality */
        let incomplete = self.incomplete_per_block[block_idx].clone();
        for arena in &incomplete {
            let arena = *arena;
            let (is_logical, num_ops, def_id) = {
                let instr = &self.created[arena].instr;
                (
                    !instr.definitions[0].reg_class().is_linear(),
                    instr.operands.len(),
                    instr.definitions[0].temp_id(),
                )
            };
            let preds: Vec<u32> = if is_logical {
                self.program.blocks[block_idx].logical_preds.clone()
            } else {
                self.program.blocks[block_idx].linear_preds.clone()
            };
            assert!(preds.len() == num_ops);

            for i in 0..num_ops {
                let placeholder = self.created[arena].instr.operands[i].temp();
                let new_t =
                    self.read_variable(placeholder, preds[i] as usize);
                let reg = self.assignments[&new_t.id].0;
                let op = &mut self.created[arena].instr.operands[i];
                op.set_temp(new_t);
                op.set_fixed(reg);
            }
            self.try_remove_trivial_phi(def_id);
        }

        /* complete the block's original phis; no triviality test here */
        for idx in 0..self.program.blocks[block_idx].instructions.len() {
            let (opcode, num_ops) = {
                let instr = &self.program.blocks[block_idx].instructions[idx];
                if !instr.is_phi() {
                    break;
                }
                (instr.opcode, instr.operands.len())
            };
            let preds: Vec<u32> = if opcode == Opcode::Phi {
                self.program.blocks[block_idx].logical_preds.clone()
            } else {
                self.program.blocks[block_idx].linear_preds.clone()
            };
            assert!(preds.len() == num_ops);

            for i in 0..num_ops {
                let op = self.program.blocks[block_idx].instructions[idx]
                    .operands[i];
                if !op.is_temp() {
                    continue;
                }
                let new_t = self.read_variable(op.temp(), preds[i] as usize);
                let reg = self.assignments[&new_t.id].0;
                let op = &mut self.program.blocks[block_idx].instructions
                    [idx]
                    .operands[i];
                op.set_temp(new_t);
                op.set_fixed(reg);
            }
        }

        /* incomplete phis now count as ordinary created phis */
        let mut incomplete =
            mem::take(&mut self.incomplete_per_block[block_idx]);
        self.phis_per_block[block_idx].append(&mut incomplete);
        self.sealed[block_idx] = true;
    }

    /// Prepends the surviving repair phis and applies the removed-phi
    /// substitutions everywhere.
    fn finalize(&mut self) {
        for block_idx in 0..self.program.blocks.len() {
            let arenas = mem::take(&mut self.phis_per_block[block_idx]);
            let mut phis: Vec<Instruction> = Vec::new();
            for arena in arenas {
                if !self.created[arena].removed {
                    phis.push(self.created[arena].instr.clone());
                }
            }
            if !phis.is_empty() {
                let rest = mem::take(
                    &mut self.program.blocks[block_idx].instructions,
                );
                phis.extend(rest);
                self.program.blocks[block_idx].instructions = phis;
            }
        }

        if self.substitutions.is_empty() {
            return;
        }
        for block in self.program.blocks.iter_mut() {
            for instr in block.instructions.iter_mut() {
                for op in instr.operands.iter_mut() {
                    if !op.is_temp() {
                        continue;
                    }
                    let mut t = op.temp();
                    while let Some(s) = self.substitutions.get(&t.id) {
                        t = *s;
                    }
                    if t != op.temp() {
                        op.set_temp(t);
                    }
                }
            }
        }
    }
}

/// Binds every temp to a physical register within the occupancy-derived
/// bounds and populates `program.config`.
pub fn register_allocation(program: &mut Program) {
    let live_out = live_var_analysis(program, false).live_out;

    let mut sgpr_demand: u16 = 0;
    let mut vgpr_demand: u16 = 0;
    for block in &program.blocks {
        sgpr_demand = max(sgpr_demand, block.sgpr_demand);
        vgpr_demand = max(vgpr_demand, block.vgpr_demand);
    }
    assert!(
        vgpr_demand <= 256 && sgpr_demand <= 100,
        "demand exceeds hardware bounds; the spiller must run first"
    );

    /* smallest bound pair that fits the demand */
    let (max_sgpr, max_vgpr) = if vgpr_demand <= 24 && sgpr_demand <= 46 {
        (46, 24)
    } else if vgpr_demand <= 28 && sgpr_demand <= 54 {
        (54, 28)
    } else if vgpr_demand <= 32 && sgpr_demand <= 62 {
        (62, 32)
    } else if vgpr_demand <= 36 && sgpr_demand <= 70 {
        (70, 36)
    } else if vgpr_demand <= 40 && sgpr_demand <= 78 {
        (78, 40)
    } else if vgpr_demand <= 48 && sgpr_demand <= 94 {
        (94, 48)
    } else {
        (
            100,
            if vgpr_demand <= 64 {
                64
            } else if vgpr_demand <= 84 {
                84
            } else if vgpr_demand <= 128 {
                128
            } else {
                256
            },
        )
    };
    program.config.num_vgprs = max_vgpr;
    program.config.num_sgprs = max_sgpr + 2;
    debug!(
        "allocating registers within {} sgprs / {} vgprs",
        max_sgpr, max_vgpr
    );

    let num_blocks = program.blocks.len();
    let mut ctx = RaCtx {
        program: program,
        max_sgpr: max_sgpr as u32,
        max_vgpr: max_vgpr as u32,
        assignments: FxHashMap::default(),
        renames: vec![FxHashMap::default(); num_blocks],
        orig_names: FxHashMap::default(),
        affinities: FxHashMap::default(),
        filled: vec![false; num_blocks],
        sealed: vec![false; num_blocks],
        created: Vec::new(),
        phis_per_block: vec![Vec::new(); num_blocks],
        incomplete_per_block: vec![Vec::new(); num_blocks],
        phi_map: FxHashMap::default(),
        substitutions: FxHashMap::default(),
        live_in: live_out,
        kills: vec![FxHashMap::default(); num_blocks],
    };

    ctx.compute_kills_and_affinities();
    for block_idx in 0..num_blocks {
        ctx.process_block(block_idx);
    }
    ctx.finalize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wfc_dom::dominator_tree;
    use crate::wfc_liveness::tests::pressure_program;

    fn assert_all_assigned(program: &Program) {
        for block in &program.blocks {
            for instr in &block.instructions {
                for op in &instr.operands {
                    if op.is_temp() {
                        assert!(op.is_fixed(), "unassigned operand in {}", instr);
                    }
                }
                for def in &instr.definitions {
                    if def.is_temp() {
                        assert!(
                            def.is_fixed(),
                            "unassigned definition in {}",
                            instr
                        );
                    }
                }
            }
        }
    }

    /// Demand (30, 20) selects the smallest bound pair (46, 24) and
    /// allocation succeeds without spilling.
    #[test]
    fn fits_smallest_bound_pair() {
        let mut program = pressure_program(30, 20);
        dominator_tree(&mut program);
        live_var_analysis(&mut program, true);
        register_allocation(&mut program);

        assert_eq!(program.config.num_vgprs, 24);
        assert_eq!(program.config.num_sgprs, 48);
        assert_all_assigned(&program);
        assert!(!program
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .any(|i| i.opcode == Opcode::Spill));
    }

    #[test]
    fn fixed_operand_forces_parallel_copy() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        let t = program.alloc_temp(RegClass::Sgpr(1));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SMovB32,
            Format::SOP1,
            vec![Operand::constant(5)],
            vec![Definition::of_temp(t)],
        ));
        /* something reads the value out of M0, far outside the
         * allocatable range */
        let mut m0_op = Operand::of_temp(t);
        m0_op.set_fixed(M0);
        let u = program.alloc_temp(RegClass::Sgpr(1));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SMovB32,
            Format::SOP1,
            vec![m0_op],
            vec![Definition::of_temp(u)],
        ));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SEndpgm,
            Format::SOPP,
            vec![],
            vec![],
        ));

        dominator_tree(&mut program);
        live_var_analysis(&mut program, true);
        register_allocation(&mut program);

        let pc = program.blocks[b0]
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::ParallelCopy)
            .expect("copy into the fixed register");
        assert_eq!(pc.definitions[0].phys_reg(), M0);
        assert_all_assigned(&program);
    }

    /// A carry definition that cannot live in VCC promotes the add to
    /// its VOP3A form.
    #[test]
    fn unplaceable_carry_promotes_to_vop3a() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        let a = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![Operand::constant(1)],
            vec![Definition::of_temp(a)],
        ));
        let sum = program.alloc_temp(RegClass::Vgpr(1));
        let carry = program.alloc_temp(RegClass::Sgpr(2));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::VAddCoU32,
            Format::VOP2,
            vec![Operand::of_temp(a), Operand::constant(3)],
            vec![Definition::of_temp(sum), Definition::of_temp(carry)],
        ));
        /* keep the carry alive so it really occupies its pair */
        let carry_copy = program.alloc_temp(RegClass::Sgpr(2));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SMovB64,
            Format::SOP1,
            vec![Operand::of_temp(carry)],
            vec![Definition::of_temp(carry_copy)],
        ));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::SEndpgm,
            Format::SOPP,
            vec![],
            vec![],
        ));

        dominator_tree(&mut program);
        live_var_analysis(&mut program, true);
        register_allocation(&mut program);

        let add = program.blocks[b0]
            .instructions
            .iter()
            .find(|i| i.opcode == Opcode::VAddCoU32)
            .unwrap();
        assert!(add.format.has(Format::VOP3A));
        assert!(add.definitions[1].phys_reg() != VCC);
    }

    /// A value flowing around a diamond must keep one register on all
    /// paths; the join phi coalesces onto it.
    #[test]
    fn diamond_join_phi_operands_share_class() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        let b0 = program.create_and_insert_block();
        let b1 = program.create_and_insert_block();
        let b2 = program.create_and_insert_block();
        let b3 = program.create_and_insert_block();
        for (from, to) in [(0u32, 1u32), (0, 2), (1, 3), (2, 3)] {
            program.blocks[to as usize].logical_preds.push(from);
            program.blocks[to as usize].linear_preds.push(from);
            program.blocks[from as usize].logical_succs.push(to);
            program.blocks[from as usize].linear_succs.push(to);
        }

        let x = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b0].instructions.push(Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![Operand::constant(1)],
            vec![Definition::of_temp(x)],
        ));
        let y = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b1].instructions.push(Instruction::new(
            Opcode::VMovB32,
            Format::VOP1,
            vec![Operand::constant(2)],
            vec![Definition::of_temp(y)],
        ));
        let z = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b2].instructions.push(Instruction::new(
            Opcode::VAddF32,
            Format::VOP2,
            vec![Operand::of_temp(x), Operand::constant(0x3f800000)],
            vec![Definition::of_temp(z)],
        ));
        let res = program.alloc_temp(RegClass::Vgpr(1));
        program.blocks[b3].instructions.push(Instruction::new_phi(
            Definition::of_temp(res),
            vec![Operand::of_temp(y), Operand::of_temp(z)],
        ));
        program.blocks[b3].instructions.push(Instruction::new(
            Opcode::Exp,
            Format::EXP,
            vec![Operand::of_temp(res)],
            vec![],
        ));
        program.blocks[b3].instructions.push(Instruction::new(
            Opcode::SEndpgm,
            Format::SOPP,
            vec![],
            vec![],
        ));

        dominator_tree(&mut program);
        live_var_analysis(&mut program, true);
        register_allocation(&mut program);
        assert_all_assigned(&program);

        let phi = program.blocks[b3]
            .instructions
            .iter()
            .find(|i| i.is_phi())
            .unwrap();
        for op in &phi.operands {
            assert_eq!(op.reg_class(), phi.definitions[0].reg_class());
        }
    }
}
