/*
 * Copyright © 2023 Collabora, Ltd.
 * SPDX-License-Identifier: MIT
 */

//! SSA core of a shader compiler backend for a wide-SIMD (wavefront)
//! GPU with split scalar/vector register banks.
//!
//! The crate consumes a low-level SSA program (`wfc_ir::Program`)
//! produced by instruction selection and turns it into a stream of
//! 32-bit instruction words:
//!
//! 1. divergent-bool phi lowering (`wfc_lower_bool_phis`),
//! 2. liveness, register demand and occupancy (`wfc_liveness`),
//! 3. SSA spilling when the demand exceeds the target (`wfc_spill`),
//! 4. SSA register allocation with on-the-fly phi repair
//!    (`wfc_assign_regs`),
//! 5. pseudo elimination: phis, parallel copies, linear-vgpr markers,
//!    branches (`wfc_lower_pseudo`),
//! 6. encoding (`wfc_assemble`).
//!
//! Divergence analysis (`wfc_divergence`) runs against the higher-level
//! SSA IR (`wfc_hir`) before instruction selection and is exposed
//! separately.

pub mod bitset;
pub mod error;
pub mod wfc_assemble;
pub mod wfc_assign_regs;
pub mod wfc_divergence;
pub mod wfc_dom;
pub mod wfc_hir;
pub mod wfc_ir;
pub mod wfc_liveness;
pub mod wfc_lower_bool_phis;
pub mod wfc_lower_pseudo;
pub mod wfc_spill;
pub mod wfc_validate;

pub use crate::error::CompileError;
pub use crate::wfc_ir::Program;

/// Runs the backend pipeline on a selected program and returns the
/// encoded instruction stream.  The program is mutated in place; on
/// success every operand and definition is bound to a physical register
/// and `program.config` is populated.
pub fn compile(program: &mut Program) -> Result<Vec<u32>, CompileError> {
    crate::wfc_lower_bool_phis::lower_bool_phis(program);
    crate::wfc_dom::dominator_tree(program);

    let mut live_vars = crate::wfc_liveness::live_var_analysis(program, true);
    crate::wfc_spill::spill(program, &mut live_vars)?;
    if program.num_waves == 0 {
        return Err(CompileError::ResourceExhaustion {
            sgpr_demand: program.sgpr_demand,
            vgpr_demand: program.vgpr_demand,
        });
    }

    crate::wfc_assign_regs::register_allocation(program);
    if cfg!(debug_assertions) {
        crate::wfc_validate::validate_ra(program)?;
    }

    crate::wfc_lower_pseudo::lower_pseudo_instructions(program);
    Ok(crate::wfc_assemble::emit_program(program))
}
