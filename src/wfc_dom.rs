/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! Immediate dominators for both CFGs.
//!
//! Block indices are topological along the linear CFG, so the classic
//! intersect-based construction works in index order; iteration handles
//! the back edges of reducible loops.  Blocks that only exist on the
//! linear CFG keep a logical idom of -1.

use crate::wfc_ir::*;

fn intersect(mut a: i32, mut b: i32, idom: &[i32]) -> i32 {
    while a != b {
        while a > b {
            a = idom[a as usize];
        }
        while b > a {
            b = idom[b as usize];
        }
    }
    a
}

fn compute_idoms(
    program: &Program,
    preds: fn(&Block) -> &[u32],
) -> Vec<i32> {
    let mut idom = vec![-1_i32; program.blocks.len()];
    idom[0] = 0;

    let mut changed = true;
    while changed {
        changed = false;
        for block in &program.blocks[1..] {
            let mut new_idom = -1_i32;
            for &pred in preds(block) {
                if idom[pred as usize] < 0 {
                    continue;
                }
                new_idom = if new_idom < 0 {
                    pred as i32
                } else {
                    intersect(new_idom, pred as i32, &idom)
                };
            }
            if new_idom >= 0 && idom[block.index] != new_idom {
                idom[block.index] = new_idom;
                changed = true;
            }
        }
    }
    idom
}

fn logical_preds(b: &Block) -> &[u32] {
    &b.logical_preds
}

fn linear_preds(b: &Block) -> &[u32] {
    &b.linear_preds
}

pub fn dominator_tree(program: &mut Program) {
    let logical = compute_idoms(program, logical_preds);
    let linear = compute_idoms(program, linear_preds);
    for block in &mut program.blocks {
        block.logical_idom = logical[block.index];
        block.linear_idom = linear[block.index];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diamond_idoms() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        /* 0 -> 1, 0 -> 2, 1 -> 3, 2 -> 3 on both graphs */
        for (from, to) in [(0u32, 1u32), (0, 2), (1, 3), (2, 3)] {
            program.blocks[to as usize].linear_preds.push(from);
            program.blocks[to as usize].logical_preds.push(from);
            program.blocks[from as usize].linear_succs.push(to);
            program.blocks[from as usize].logical_succs.push(to);
        }
        dominator_tree(&mut program);
        assert_eq!(program.blocks[0].linear_idom, 0);
        assert_eq!(program.blocks[1].linear_idom, 0);
        assert_eq!(program.blocks[2].linear_idom, 0);
        assert_eq!(program.blocks[3].linear_idom, 0);
        assert_eq!(program.blocks[3].logical_idom, 0);
    }

    #[test]
    fn loop_back_edge_idoms() {
        let mut program = Program::new(ChipClass::Gfx8, ShaderStage::Compute);
        for _ in 0..4 {
            program.create_and_insert_block();
        }
        /* 0 -> 1 (header) <-> 2 (body), 1 -> 3 */
        for (from, to) in [(0u32, 1u32), (1, 2), (2, 1), (1, 3)] {
            program.blocks[to as usize].linear_preds.push(from);
            program.blocks[from as usize].linear_succs.push(to);
        }
        dominator_tree(&mut program);
        assert_eq!(program.blocks[1].linear_idom, 0);
        assert_eq!(program.blocks[2].linear_idom, 1);
        assert_eq!(program.blocks[3].linear_idom, 1);
    }
}
