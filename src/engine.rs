//! Contract of the external electronic-structure collaborators.
//!
//! The response pipeline treats the integral engine, the self-consistent
//! field, the CPKS solver and the grid/XC machinery as black boxes behind
//! this trait. Every call blocks and returns a fully-computed result; any
//! parallelism lives inside the implementation. Collaborator failures are
//! opaque [`anyhow::Error`] values, tagged with the calling stage at the
//! pipeline boundary.

use anyhow::{bail, Result};
use ndarray::prelude::*;

/// Facts about the converged self-consistent reference.
#[derive(Clone, Debug)]
pub struct ScfSummary {
    pub e_scf: f64,
    /// Orbital energies, ascending. Length `nmo`.
    pub mo_energy: Array1<f64>,
    /// Orbital coefficients, shape `(nao, nmo)`.
    pub mo_coeff: Array2<f64>,
    /// Occupation numbers. Length `nmo`.
    pub mo_occ: Array1<f64>,
    pub nao: usize,
    pub nmo: usize,
    pub nocc: usize,
    pub nvir: usize,
    /// Auxiliary (density-fitting) basis dimension.
    pub naux: usize,
}

/// Ground-state XC kernel data on the molecular grid.
pub struct XcKernel {
    /// Density and gradient components, shape `(4, ngrid)`.
    pub rho: Array2<f64>,
    /// Grid weights, length `ngrid`.
    pub weights: Array1<f64>,
    /// Second functional derivatives `frr, frg, fgg`, shape `(3, ngrid)`.
    pub fxc: Array2<f64>,
}

/// Third functional derivatives `frrr, frrg, frgg, fggg`, shape `(4, ngrid)`.
pub struct XcKernelThird {
    pub kxc: Array2<f64>,
}

pub trait ResponseEngine {
    /// Run (or fetch) the self-consistent reference.
    fn run_scf(&mut self) -> Result<ScfSummary>;

    /// Dipole perturbation integrals, shape `(3, nao, nao)`.
    fn dipole_ao(&self) -> Result<Array3<f64>>;

    /// Rows `[start, stop)` of the RI three-index MO tensor
    /// `(naux, nmo, nmo)`.
    fn ri_mo_block(&self, start: usize, stop: usize) -> Result<Array3<f64>>;

    /// Solve the CPKS equations for a set of right-hand sides of shape
    /// `(nset, nvir, nocc)`. Convergence parameters are forwarded
    /// unchanged from the caller.
    fn solve_cpks(&self, rhs: ArrayView3<f64>, max_cycle: usize, tol: f64) -> Result<Array3<f64>>;

    /// Zeroth-order response operator applied to a set of MO-basis
    /// perturbations, `(nset, nmo, nmo)` in and out.
    fn ax0_mo(&self, x: ArrayView3<f64>) -> Result<Array3<f64>>;

    /// Response operator of the secondary (non-self-consistent) functional
    /// of xDH-type methods. `None` when the method has no secondary
    /// functional.
    fn ax0_mo_secondary(&self, _x: ArrayView3<f64>) -> Result<Option<Array3<f64>>> {
        Ok(None)
    }

    /// MO-basis Fock matrix of the secondary functional, `None` when the
    /// method has no secondary functional.
    fn fock_secondary(&self) -> Result<Option<Array2<f64>>> {
        Ok(None)
    }

    /// Ground-state density, weights and second XC derivatives on the
    /// grid. Only called for density-functional references.
    fn xc_kernel(&self) -> Result<XcKernel> {
        bail!("this reference provides no xc kernel")
    }

    /// Third XC derivatives on the grid. Only called for
    /// gradient-corrected references.
    fn xc_kernel_third(&self) -> Result<XcKernelThird> {
        bail!("this reference provides no third-order xc kernel")
    }

    /// Density derivatives on the grid for a set of AO matrices:
    /// `(nset, nao, nao)` in, `(nset, 4, ngrid)` out. Gradient-corrected
    /// references only.
    fn eval_rho_resp(&self, _dms: ArrayView3<f64>) -> Result<Array3<f64>> {
        bail!("this reference provides no grid density evaluation")
    }

    /// Contract grid-weighted response values `(nset, 4, ngrid)` back to
    /// AO matrices `(nset, nao, nao)`. Gradient-corrected references only.
    fn weighted_grid_matrix(&self, _wv: ArrayView3<f64>) -> Result<Array3<f64>> {
        bail!("this reference provides no grid contraction")
    }

    /// Advisory memory budget in MB, if the collaborator tracks one.
    fn memory_mb(&self) -> Option<f64> {
        None
    }
}
