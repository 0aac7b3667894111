//! Static polarizability of an RI doubly-hybrid reference.
//!
//! The pipeline is a fixed sequence of stages over a [`HybridStore`] of
//! named tensors. Every stage declares the keys it reads and writes; a
//! missing input is a fatal precondition error, and the schedule carries
//! exactly one conditional branch (the kernel-response stages of
//! gradient-corrected references). Large intermediates (`Y_mo_ri`,
//! `t_ijab`) live in the backing file and are produced and consumed in
//! planner-sized batches.

use crate::dft::{parse_xc_dh, DhFunctional, XcKind};
use crate::engine::{ResponseEngine, ScfSummary};
use crate::error::{PolarError, Result};
use crate::polar::numerics::{hermi_sum_trailing, restricted_biorthogonalize, rks_gga_wv2};
use crate::polar::traits::PolarAPI;
use crate::tensor_store::HybridStore;
use crate::utilities::{calc_batch_size, gen_batch, TimeRecords};
use itertools::izip;
use ndarray::prelude::*;
use std::ops::Range;

#[non_exhaustive]
#[derive(Clone, derive_builder::Builder)]
pub struct PolarFlags {
    /// Print level for debugging.
    #[builder(default = 0)]
    pub print_level: usize,

    /// Memory available for calculation (in MB).
    /// Note that this value does not count the memory used by the program itself.
    #[builder(default = "None")]
    pub max_memory: Option<f64>,

    /// CPKS iteration cap, forwarded unchanged to the solver.
    #[builder(default = "crate::constants::CPKS_MAX_CYCLE")]
    pub cpks_max_cycle: usize,

    /// CPKS convergence tolerance, forwarded unchanged to the solver.
    #[builder(default = "crate::constants::CPKS_TOL")]
    pub cpks_tol: f64,

    /// Parallel execution inside the dense numeric helpers. Resolved here
    /// once and threaded into every call; never ambient state.
    #[builder(default = true)]
    pub parallel_numerics: bool,

    /// Explicit backing-file path for the tensor store; a private
    /// temporary file is used when unset.
    #[builder(default = "None")]
    pub chkfile: Option<std::path::PathBuf>,
}

/// Polarizability driver for an RI doubly-hybrid reference.
///
/// Field `pol_tot` contains the total 3x3 polarizability after
/// [`kernel`](Self::kernel); `pol_scf` and `pol_corr` hold the
/// self-consistent and correlation contributions, `e_corr` the PT2
/// correlation energy as `[total, os, ss]`.
pub struct RIDHPolar<'a, E: ResponseEngine> {
    pub engine: &'a mut E,
    pub dh: DhFunctional,
    pub flags: PolarFlags,
    pub tensors: HybridStore,
    pub scf: Option<ScfSummary>,
    pub e_corr: Option<[f64; 3]>,
    pub pol_scf: Option<Array2<f64>>,
    pub pol_corr: Option<Array2<f64>>,
    pub pol_tot: Option<Array2<f64>>,
}

impl<E: ResponseEngine> PolarAPI for RIDHPolar<'_, E> {
    fn get_polarizability(&self) -> Array2<f64> {
        self.pol_tot.as_ref().unwrap().clone()
    }

    fn get_energy(&self) -> f64 {
        self.scf.as_ref().unwrap().e_scf
    }
}

impl<'a, E: ResponseEngine> RIDHPolar<'a, E> {
    pub fn new(engine: &'a mut E, xc: &str) -> Result<RIDHPolar<'a, E>> {
        let dh = parse_xc_dh(xc).ok_or_else(|| {
            PolarError::Usage(format!("unknown doubly-hybrid functional `{}`", xc))
        })?;
        let flags = PolarFlagsBuilder::default().build().unwrap();
        return RIDHPolar::with_flags(engine, dh, flags);
    }

    pub fn with_flags(engine: &'a mut E, dh: DhFunctional, flags: PolarFlags) -> Result<RIDHPolar<'a, E>> {
        let tensors = HybridStore::new(flags.chkfile.as_deref())?;
        return Ok(RIDHPolar {
            engine,
            dh,
            flags,
            tensors,
            scf: None,
            e_corr: None,
            pol_scf: None,
            pol_corr: None,
            pol_tot: None,
        });
    }

    fn mem_budget(&self) -> Option<f64> {
        self.flags.max_memory.or_else(|| self.engine.memory_mb())
    }

    /// Run (or fetch) the self-consistent reference.
    pub fn run_scf(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "run_scf";
        let summary = self
            .engine
            .run_scf()
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        if self.flags.print_level > 0 {
            println!("SCF ({}) energy: {:16.8}", self.dh.name, summary.e_scf);
        }
        self.scf = Some(summary);
        return Ok(self);
    }

    /// Dipole perturbation in AO and MO basis.
    ///
    /// Writes: `H_1_ao`, `H_1_mo`.
    pub fn prepare_h_1(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_h_1";
        let scf = require_scf(&self.scf, STAGE)?;
        let nmo = scf.nmo;
        let c = scf.mo_coeff.clone();
        let h_1_ao = self
            .engine
            .dipole_ao()
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        let mut h_1_mo = Array3::zeros((3, nmo, nmo));
        for t in 0..3 {
            let h_t = h_1_ao.index_axis(Axis(0), t);
            h_1_mo
                .index_axis_mut(Axis(0), t)
                .assign(&c.t().dot(&h_t).dot(&c));
        }
        self.tensors.create_data("H_1_ao", h_1_ao.into_dyn())?;
        self.tensors.create_data("H_1_mo", h_1_mo.into_dyn())?;
        return Ok(self);
    }

    /// Batched production of the RI three-index MO tensor into the
    /// backing file.
    ///
    /// Writes: `Y_mo_ri` (disk).
    pub fn prepare_integral(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_integral";
        let scf = require_scf(&self.scf, STAGE)?;
        let (naux, nmo) = (scf.naux, scf.nmo);
        let mem = self.mem_budget();
        self.tensors.create_zeros("Y_mo_ri", &[naux, nmo, nmo], false)?;
        let nbatch = calc_batch_size::<f64>(nmo * nmo, mem, None, None);
        for batch in gen_batch(0, naux, nbatch)? {
            let block = self
                .engine
                .ri_mo_block(batch.start, batch.end)
                .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
            let block = block.into_dyn();
            self.tensors.write_rows("Y_mo_ri", batch.start, block.view())?;
        }
        return Ok(self);
    }

    /// Ground-state density and second XC derivatives on the grid.
    /// No-op for Hartree-Fock-type references.
    ///
    /// Writes: `rho`, `grid_weights`, `fxc`.
    pub fn prepare_xc_kernel(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_xc_kernel";
        require_scf(&self.scf, STAGE)?;
        if self.dh.kind == XcKind::HartreeFock {
            return Ok(self);
        }
        let kern = self
            .engine
            .xc_kernel()
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        self.tensors.create_data("rho", kern.rho.into_dyn())?;
        self.tensors.create_data("grid_weights", kern.weights.into_dyn())?;
        self.tensors.create_data("fxc", kern.fxc.into_dyn())?;
        return Ok(self);
    }

    /// PT2 amplitudes, built and stored in occupied-index batches, and
    /// the PT2 correlation energy components.
    ///
    /// Reads: `Y_mo_ri`. Writes: `t_ijab` (disk).
    pub fn prepare_pt2(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_pt2";
        require_keys(&self.tensors, STAGE, &["Y_mo_ri"])?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nvir, nmo) = (scf.nocc, scf.nvir, scf.nmo);
        let eo = scf.mo_energy.slice(s![0..nocc]).to_owned();
        let ev = scf.mo_energy.slice(s![nocc..nmo]).to_owned();
        let mem = self.mem_budget();
        let y_ia = load_y_block(&self.tensors, 0..nocc, nocc..nmo, mem)?;
        self.tensors
            .create_zeros("t_ijab", &[nocc, nocc, nvir, nvir], false)?;

        let mut e_bi1 = 0.0;
        let mut e_bi2 = 0.0;
        let nbatch = calc_batch_size::<f64>(2 * nocc * nvir * nvir, mem, None, Some(y_ia.len()));
        for batch in gen_batch(0, nocc, nbatch)? {
            let g = contract_ri_pair(y_ia.slice(s![.., batch.clone(), ..]), y_ia.view());
            let d = energy_denominator(&eo, &ev, &batch);
            let t = &g / &d;
            e_bi1 += (&g * &t).sum();
            let mut g_swap = g.view();
            g_swap.swap_axes(2, 3);
            e_bi2 += (&g_swap * &t).sum();
            let t = t.into_dyn();
            self.tensors.write_rows("t_ijab", batch.start, t.view())?;
        }
        let (e_os, e_ss) = (e_bi1, e_bi1 - e_bi2);
        let e_corr = self.dh.cc * (self.dh.c_os * e_os + self.dh.c_ss * e_ss);
        if self.flags.print_level > 0 {
            println!(
                "PT2 correlation energy (total, OS, SS): {:16.8} {:16.8} {:16.8}",
                e_corr, e_os, e_ss
            );
        }
        self.e_corr = Some([e_corr, e_os, e_ss]);
        return Ok(self);
    }

    /// Three-index amplitude intermediate, the response Lagrangian, and
    /// the occupied/virtual blocks of the relaxed difference density.
    ///
    /// Reads: `t_ijab`, `Y_mo_ri`. Writes: `G_ia`, `L_ai`, `D_r`.
    pub fn prepare_lagrangian(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_lagrangian";
        require_keys(&self.tensors, STAGE, &["t_ijab", "Y_mo_ri"])?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nvir, nmo, naux) = (scf.nocc, scf.nvir, scf.nmo, scf.naux);
        let (cc, c_os, c_ss) = (self.dh.cc, self.dh.c_os, self.dh.c_ss);
        let par = self.flags.parallel_numerics;
        let mem = self.mem_budget();

        let y_ia = load_y_block(&self.tensors, 0..nocc, nocc..nmo, mem)?;
        let mut g_ia = Array3::zeros((naux, nocc, nvir));
        let mut d_oo = Array2::<f64>::zeros((nocc, nocc));
        let mut d_vv = Array2::<f64>::zeros((nvir, nvir));
        let nbatch =
            calc_batch_size::<f64>(4 * nocc * nvir * nvir, mem, None, Some(y_ia.len() + g_ia.len()));
        for batch in gen_batch(0, nocc, nbatch)? {
            let bi = batch.len();
            let t_i = self
                .tensors
                .read_rows_dim::<Ix4>("t_ijab", batch.start, batch.end)?;
            let tt_i = restricted_biorthogonalize(t_i.view(), cc, c_os, c_ss, par);
            g_ia.slice_mut(s![.., batch.clone(), ..])
                .assign(&contract_t_y(tt_i.view(), y_ia.view()));

            let t_p = reshape2(t_i.view().permuted_axes([1, 0, 2, 3]), nocc, bi * nvir * nvir);
            let tt_p = reshape2(tt_i.view().permuted_axes([1, 0, 2, 3]), nocc, bi * nvir * nvir);
            d_oo.scaled_add(-2.0, &tt_p.dot(&t_p.t()));

            let t_q = reshape2(t_i.view().permuted_axes([2, 0, 1, 3]), nvir, bi * nocc * nvir);
            let tt_q = reshape2(tt_i.view().permuted_axes([2, 0, 1, 3]), nvir, bi * nocc * nvir);
            d_vv.scaled_add(2.0, &tt_q.dot(&t_q.t()));
        }

        let y_oo = load_y_block(&self.tensors, 0..nocc, 0..nocc, mem)?;
        let y_vv = load_y_block(&self.tensors, nocc..nmo, nocc..nmo, mem)?;
        let mut l_ai = Array2::<f64>::zeros((nvir, nocc));
        for (g_p, yoo_p, yvv_p) in izip!(g_ia.outer_iter(), y_oo.outer_iter(), y_vv.outer_iter()) {
            l_ai.scaled_add(-4.0, &g_p.t().dot(&yoo_p.t()));
            l_ai.scaled_add(4.0, &yvv_p.dot(&g_p.t()));
        }

        let mut d_mo = Array2::<f64>::zeros((nmo, nmo));
        d_mo.slice_mut(s![0..nocc, 0..nocc]).assign(&d_oo);
        d_mo.slice_mut(s![nocc..nmo, nocc..nmo]).assign(&d_vv);
        let x = d_mo.clone().insert_axis(Axis(0));
        let ax = self
            .engine
            .ax0_mo(x.view())
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        l_ai += &ax.slice(s![0, nocc..nmo, 0..nocc]);

        self.tensors.create_data("G_ia", g_ia.into_dyn())?;
        self.tensors.create_data("L_ai", l_ai.into_dyn())?;
        self.tensors.create_data("D_r", d_mo.into_dyn())?;
        return Ok(self);
    }

    /// Z-vector solve filling the virtual-occupied block of `D_r`.
    ///
    /// Reads: `L_ai`, `D_r`. Writes: `D_r` (intentional replace).
    pub fn prepare_d_r(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_d_r";
        require_keys(&self.tensors, STAGE, &["L_ai", "D_r"])?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nmo) = (scf.nocc, scf.nmo);
        let l_ai = self.tensors.load_dim::<Ix2>("L_ai")?;
        let rhs = l_ai.insert_axis(Axis(0));
        let z = self
            .engine
            .solve_cpks(rhs.view(), self.flags.cpks_max_cycle, self.flags.cpks_tol)
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        let mut d_r = self.tensors.load_dim::<Ix2>("D_r")?;
        d_r.slice_mut(s![nocc..nmo, 0..nocc])
            .assign(&z.index_axis(Axis(0), 0));
        self.tensors.create_data("D_r", d_r.into_dyn())?;
        return Ok(self);
    }

    /// CPKS solution for the dipole perturbation.
    ///
    /// Reads: `H_1_mo`. Writes: `U_1`.
    pub fn prepare_u_1(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_u_1";
        require_keys(&self.tensors, STAGE, &["H_1_mo"])?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nmo) = (scf.nocc, scf.nmo);
        let h_1_mo = self.tensors.load_dim::<Ix3>("H_1_mo")?;
        let rhs = h_1_mo
            .slice(s![.., nocc..nmo, 0..nocc])
            .as_standard_layout()
            .to_owned();
        let u_vo = self
            .engine
            .solve_cpks(rhs.view(), self.flags.cpks_max_cycle, self.flags.cpks_tol)
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        let mut u_1 = Array3::zeros((3, nmo, nmo));
        for t in 0..3 {
            let u_t = u_vo.index_axis(Axis(0), t);
            u_1.slice_mut(s![t, nocc..nmo, 0..nocc]).assign(&u_t);
            let u_t_neg = u_t.t().mapv(|x| -x);
            u_1.slice_mut(s![t, 0..nocc, nocc..nmo]).assign(&u_t_neg);
        }
        self.tensors.create_data("U_1", u_1.into_dyn())?;
        return Ok(self);
    }

    /// Grid densities of the response and difference densities plus the
    /// third XC derivatives. Gradient-corrected references only.
    ///
    /// Reads: `U_1`, `D_r`, `rho`. Writes: `rhoU`, `rhoDr`, `kxc`.
    pub fn prepare_dm_u(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_dm_u";
        require_keys(&self.tensors, STAGE, &["U_1", "D_r", "rho"])?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nao) = (scf.nocc, scf.nao);
        let c = scf.mo_coeff.clone();
        let co = c.slice(s![.., 0..nocc]).to_owned();
        let par = self.flags.parallel_numerics;

        let u_1 = self.tensors.load_dim::<Ix3>("U_1")?;
        let d_r = self.tensors.load_dim::<Ix2>("D_r")?;
        let mut dm_x = Array3::zeros((4, nao, nao));
        for t in 0..3 {
            let u_occ = u_1.slice(s![t, .., 0..nocc]);
            dm_x.index_axis_mut(Axis(0), t)
                .assign(&c.dot(&u_occ).dot(&co.t()));
        }
        dm_x.index_axis_mut(Axis(0), 3)
            .assign(&c.dot(&d_r).dot(&c.t()));
        hermi_sum_trailing(&mut dm_x, par);

        let rho_x = self
            .engine
            .eval_rho_resp(dm_x.view())
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        let kxc = self
            .engine
            .xc_kernel_third()
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        self.tensors
            .create_data("rhoU", rho_x.slice(s![0..3, .., ..]).to_owned().into_dyn())?;
        self.tensors
            .create_data("rhoDr", rho_x.index_axis(Axis(0), 3).to_owned().into_dyn())?;
        self.tensors.create_data("kxc", kxc.kxc.into_dyn())?;
        return Ok(self);
    }

    /// First-order response of the gradient-corrected kernel, contracted
    /// with the dipole response.
    ///
    /// Reads: `U_1`, `rho`, `grid_weights`, `fxc`, `rhoU`, `rhoDr`,
    /// `kxc`. Writes: `Ax1_contrib`.
    pub fn prepare_polar_ax1_gga(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_polar_ax1_gga";
        require_keys(
            &self.tensors,
            STAGE,
            &["U_1", "rho", "grid_weights", "fxc", "rhoU", "rhoDr", "kxc"],
        )?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nao) = (scf.nocc, scf.nao);
        let c = scf.mo_coeff.clone();
        let co = c.slice(s![.., 0..nocc]).to_owned();

        let rho = self.tensors.load_dim::<Ix2>("rho")?;
        let weights = self.tensors.load_dim::<Ix1>("grid_weights")?;
        let fxc = self.tensors.load_dim::<Ix2>("fxc")?;
        let kxc = self.tensors.load_dim::<Ix2>("kxc")?;
        let rho_u = self.tensors.load_dim::<Ix3>("rhoU")?;
        let rho_dr = self.tensors.load_dim::<Ix2>("rhoDr")?;
        let ngrid = weights.len();

        let mut wv2 = Array3::zeros((3, 4, ngrid));
        for i in 0..3 {
            let wv = rks_gga_wv2(
                rho.view(),
                rho_u.index_axis(Axis(0), i),
                rho_dr.view(),
                fxc.view(),
                kxc.view(),
                weights.view(),
            );
            wv2.index_axis_mut(Axis(0), i).assign(&wv);
        }
        let v = self
            .engine
            .weighted_grid_matrix(wv2.view())
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        let mut ax1 = Array3::zeros((3, nao, nao));
        for i in 0..3 {
            let v_i = v.index_axis(Axis(0), i);
            ax1.index_axis_mut(Axis(0), i)
                .assign(&(2.0 * (&v_i + &v_i.t())));
        }

        let u_1 = self.tensors.load_dim::<Ix3>("U_1")?;
        let mut res = Array2::zeros((3, 3));
        for a in 0..3 {
            let m = c.t().dot(&ax1.index_axis(Axis(0), a)).dot(&co);
            for b in 0..3 {
                let u_b = u_1.slice(s![b, .., 0..nocc]);
                res[[a, b]] = (&m * &u_b).sum();
            }
        }
        self.tensors.create_data("Ax1_contrib", res.into_dyn())?;
        return Ok(self);
    }

    /// Perturbed Fock matrix (and its secondary-functional counterpart
    /// when the engine exposes one).
    ///
    /// Reads: `H_1_mo`, `U_1`. Writes: `pdA_F_0_mo` [, `pdA_F_0_mo_n`].
    pub fn prepare_pda_f_0_mo(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_pda_f_0_mo";
        require_keys(&self.tensors, STAGE, &["H_1_mo", "U_1"])?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nmo) = (scf.nocc, scf.nmo);
        let e = scf.mo_energy.clone();

        let h_1_mo = self.tensors.load_dim::<Ix3>("H_1_mo")?;
        let u_1 = self.tensors.load_dim::<Ix3>("U_1")?;
        let mut pda_f = h_1_mo.clone();
        for a in 0..3 {
            for p in 0..nmo {
                for q in 0..nmo {
                    pda_f[[a, p, q]] += u_1[[a, p, q]] * e[p] + u_1[[a, q, p]] * e[q];
                }
            }
        }
        let mut u_occ = u_1.clone();
        u_occ.slice_mut(s![.., .., nocc..nmo]).fill(0.0);
        let ax = self
            .engine
            .ax0_mo(u_occ.view())
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        pda_f += &ax;
        self.tensors.create_data("pdA_F_0_mo", pda_f.into_dyn())?;

        let f_n = self
            .engine
            .fock_secondary()
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        if let Some(f_n) = f_n {
            let mut pda_f_n = h_1_mo.clone();
            for a in 0..3 {
                let u_a = u_1.index_axis(Axis(0), a);
                let term1 = u_a.t().dot(&f_n);
                let term2 = f_n.dot(&u_a);
                let mut row = pda_f_n.index_axis_mut(Axis(0), a);
                row += &term1;
                row += &term2;
            }
            let ax_n = self
                .engine
                .ax0_mo_secondary(u_occ.view())
                .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?
                .ok_or_else(|| PolarError::Engine {
                    stage: STAGE,
                    source: anyhow::anyhow!(
                        "engine exposes a secondary Fock matrix but no secondary response operator"
                    ),
                })?;
            pda_f_n += &ax_n;
            self.tensors.create_data("pdA_F_0_mo_n", pda_f_n.into_dyn())?;
        }
        return Ok(self);
    }

    /// Perturbed three-index tensor, auxiliary-dimension batches.
    ///
    /// Reads: `U_1`, `Y_mo_ri`. Writes: `pdA_Y_ia_ri`.
    pub fn prepare_pda_y_ia(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_pda_y_ia";
        require_keys(&self.tensors, STAGE, &["U_1", "Y_mo_ri"])?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nvir, nmo, naux) = (scf.nocc, scf.nvir, scf.nmo, scf.naux);
        let mem = self.mem_budget();

        let u_1 = self.tensors.load_dim::<Ix3>("U_1")?;
        let mut pda_y = Array4::zeros((3, naux, nocc, nvir));
        let nbatch =
            calc_batch_size::<f64>(8 * nmo * nmo, mem, None, Some(u_1.len() + pda_y.len()));
        for batch in gen_batch(0, naux, nbatch)? {
            let y_blk = self
                .tensors
                .read_rows_dim::<Ix3>("Y_mo_ri", batch.start, batch.end)?;
            for a in 0..3 {
                let u_a = u_1.index_axis(Axis(0), a);
                let u_occ = u_a.slice(s![.., 0..nocc]);
                let u_vir = u_a.slice(s![.., nocc..nmo]);
                for (pp, p) in batch.clone().enumerate() {
                    let y_p = y_blk.index_axis(Axis(0), pp);
                    let m1 = u_occ.t().dot(&y_p.slice(s![.., nocc..nmo]));
                    let m2 = y_p.slice(s![.., 0..nocc]).t().dot(&u_vir);
                    pda_y.slice_mut(s![a, p, .., ..]).assign(&(m1 + m2));
                }
            }
        }
        self.tensors.create_data("pdA_Y_ia_ri", pda_y.into_dyn())?;
        return Ok(self);
    }

    /// Perturbed amplitudes and their contractions: the perturbed
    /// three-index intermediate and the perturbed correlation density.
    /// Outer and inner occupied batches are sized independently.
    ///
    /// Reads: `pdA_F_0_mo`, `pdA_Y_ia_ri`, `t_ijab`, `Y_mo_ri`.
    /// Writes: `pdA_G_ia`, `pdA_D_rdm1`.
    pub fn prepare_pt2_deriv(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_pt2_deriv";
        require_keys(
            &self.tensors,
            STAGE,
            &["pdA_F_0_mo", "pdA_Y_ia_ri", "t_ijab", "Y_mo_ri"],
        )?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nvir, nmo, naux) = (scf.nocc, scf.nvir, scf.nmo, scf.naux);
        let eo = scf.mo_energy.slice(s![0..nocc]).to_owned();
        let ev = scf.mo_energy.slice(s![nocc..nmo]).to_owned();
        let (cc, c_os, c_ss) = (self.dh.cc, self.dh.c_os, self.dh.c_ss);
        let par = self.flags.parallel_numerics;
        let mem = self.mem_budget();

        let y_ia = load_y_block(&self.tensors, 0..nocc, nocc..nmo, mem)?;
        let pda_f = self.tensors.load_dim::<Ix3>("pdA_F_0_mo")?;
        let pda_y = self.tensors.load_dim::<Ix4>("pdA_Y_ia_ri")?;
        let mut pda_g = Array4::<f64>::zeros((3, naux, nocc, nvir));
        let mut pda_d_rdm1 = Array3::<f64>::zeros((3, nmo, nmo));

        let f_oo = pda_f.slice(s![.., 0..nocc, 0..nocc]).to_owned();
        let f_vv = pda_f.slice(s![.., nocc..nmo, nocc..nmo]).to_owned();

        let pre = y_ia.len() + pda_f.len() + pda_y.len() + pda_g.len();
        let nbatch_outer = calc_batch_size::<f64>(8 * nocc * nvir * nvir, mem, None, Some(pre));
        let nbatch_inner = calc_batch_size::<f64>(16 * nocc * nvir * nvir, mem, None, Some(pre));

        for batch in gen_batch(0, nocc, nbatch_outer)? {
            let bi = batch.len();
            let t_i = self
                .tensors
                .read_rows_dim::<Ix4>("t_ijab", batch.start, batch.end)?;
            let mut pda_t = Array::<f64, Ix5>::zeros((3, bi, nocc, nvir, nvir));
            for a in 0..3 {
                let pda_y_a = pda_y.index_axis(Axis(0), a);
                let term1 =
                    contract_ri_pair(pda_y_a.slice(s![.., batch.clone(), ..]), y_ia.view());
                let term2 =
                    contract_ri_pair(y_ia.slice(s![.., batch.clone(), ..]), pda_y_a);
                let mut dst = pda_t.index_axis_mut(Axis(0), a);
                dst += &term1;
                dst += &term2;
            }
            for kbatch in gen_batch(0, nocc, nbatch_inner)? {
                let bk = kbatch.len();
                let t_k = if kbatch == batch {
                    t_i.clone()
                } else {
                    self.tensors
                        .read_rows_dim::<Ix4>("t_ijab", kbatch.start, kbatch.end)?
                };
                let t_k2 = reshape2(t_k.view(), bk, nocc * nvir * nvir);
                for a in 0..3 {
                    let f_blk: ArrayView2<f64> = pda_f.slice(s![a, kbatch.clone(), batch.clone()]);
                    let out = f_blk.t().dot(&t_k2);
                    let out = out
                        .into_shape_with_order((bi, nocc, nvir, nvir))
                        .unwrap();
                    let mut dst = pda_t.index_axis_mut(Axis(0), a);
                    dst -= &out;
                }
            }
            for a in 0..3 {
                let f_o = f_oo.index_axis(Axis(0), a);
                let t_p = reshape2(t_i.view().permuted_axes([1, 0, 2, 3]), nocc, bi * nvir * nvir);
                let out = f_o.t().dot(&t_p);
                let out = out
                    .into_shape_with_order((nocc, bi, nvir, nvir))
                    .unwrap()
                    .permuted_axes([1, 0, 2, 3]);
                let mut dst = pda_t.index_axis_mut(Axis(0), a);
                dst -= &out;

                let f_v = f_vv.index_axis(Axis(0), a);
                let t_flat = reshape2(t_i.view(), bi * nocc * nvir, nvir);
                let out = t_flat.dot(&f_v);
                let out = out
                    .into_shape_with_order((bi, nocc, nvir, nvir))
                    .unwrap();
                let mut dst = pda_t.index_axis_mut(Axis(0), a);
                dst += &out;

                let t_pc = reshape2(t_i.view().permuted_axes([0, 1, 3, 2]), bi * nocc * nvir, nvir);
                let out = t_pc.dot(&f_v);
                let out = out
                    .into_shape_with_order((bi, nocc, nvir, nvir))
                    .unwrap()
                    .permuted_axes([0, 1, 3, 2]);
                let mut dst = pda_t.index_axis_mut(Axis(0), a);
                dst += &out;
            }
            let d = energy_denominator(&eo, &ev, &batch);
            for a in 0..3 {
                let mut dst = pda_t.index_axis_mut(Axis(0), a);
                dst /= &d;
            }

            let tt_i = restricted_biorthogonalize(t_i.view(), cc, c_os, c_ss, par);
            let pda_tt = restricted_biorthogonalize(pda_t.view(), cc, c_os, c_ss, par);
            for a in 0..3 {
                let g1 = contract_t_y(pda_tt.index_axis(Axis(0), a), y_ia.view());
                let g2 = contract_t_y(tt_i.view(), pda_y.index_axis(Axis(0), a));
                let mut dst = pda_g.slice_mut(s![a, .., batch.clone(), ..]);
                dst += &g1;
                dst += &g2;

                let tt_p = reshape2(tt_i.view().permuted_axes([1, 0, 2, 3]), nocc, bi * nvir * nvir);
                let pt_p = reshape2(
                    pda_t.index_axis(Axis(0), a).permuted_axes([1, 0, 2, 3]),
                    nocc,
                    bi * nvir * nvir,
                );
                let mut dst = pda_d_rdm1.slice_mut(s![a, 0..nocc, 0..nocc]);
                dst.scaled_add(-2.0, &tt_p.dot(&pt_p.t()));

                let tt_q = reshape2(tt_i.view().permuted_axes([2, 0, 1, 3]), nvir, bi * nocc * nvir);
                let pt_q = reshape2(
                    pda_t.index_axis(Axis(0), a).permuted_axes([2, 0, 1, 3]),
                    nvir,
                    bi * nocc * nvir,
                );
                let mut dst = pda_d_rdm1.slice_mut(s![a, nocc..nmo, nocc..nmo]);
                dst.scaled_add(2.0, &tt_q.dot(&pt_q.t()));
            }
        }
        hermi_sum_trailing(&mut pda_d_rdm1, par);
        self.tensors.create_data("pdA_G_ia", pda_g.into_dyn())?;
        self.tensors.create_data("pdA_D_rdm1", pda_d_rdm1.into_dyn())?;
        return Ok(self);
    }

    /// Final contraction assembling the polarizability.
    ///
    /// Reads: `H_1_mo`, `U_1`, `pdA_F_0_mo`, `D_r`, `pdA_D_rdm1`,
    /// `G_ia`, `pdA_G_ia`, `Y_mo_ri` [, `Ax1_contrib`, `pdA_F_0_mo_n`].
    pub fn prepare_polar(&mut self) -> Result<&mut Self> {
        const STAGE: &str = "prepare_polar";
        require_keys(
            &self.tensors,
            STAGE,
            &["H_1_mo", "U_1", "pdA_F_0_mo", "D_r", "pdA_D_rdm1", "G_ia", "pdA_G_ia", "Y_mo_ri"],
        )?;
        let scf = require_scf(&self.scf, STAGE)?;
        let (nocc, nmo, naux) = (scf.nocc, scf.nmo, scf.naux);
        let par = self.flags.parallel_numerics;
        let mem = self.mem_budget();

        let h_1_mo = self.tensors.load_dim::<Ix3>("H_1_mo")?;
        let u_1 = self.tensors.load_dim::<Ix3>("U_1")?;
        let pda_f = self.tensors.load_dim::<Ix3>("pdA_F_0_mo")?;
        let d_r = self.tensors.load_dim::<Ix2>("D_r")?;
        let pda_d = self.tensors.load_dim::<Ix3>("pdA_D_rdm1")?;

        let x = d_r.clone().insert_axis(Axis(0));
        let scr1 = self
            .engine
            .ax0_mo(x.view())
            .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?
            .index_axis(Axis(0), 0)
            .to_owned();
        let mut u_vo_pad = Array3::zeros((3, nmo, nmo));
        u_vo_pad
            .slice_mut(s![.., nocc..nmo, 0..nocc])
            .assign(&u_1.slice(s![.., nocc..nmo, 0..nocc]));
        let scr2 = &h_1_mo
            + &self
                .engine
                .ax0_mo(u_vo_pad.view())
                .map_err(|e| PolarError::Engine { stage: STAGE, source: e })?;
        let scr3 = assemble_scr3(&self.tensors, nocc, nmo, naux, mem, par)?;

        let mut pol_scf = Array2::zeros((3, 3));
        for a in 0..3 {
            for b in 0..3 {
                let h_a = h_1_mo.slice(s![a, .., 0..nocc]);
                let u_b = u_1.slice(s![b, .., 0..nocc]);
                pol_scf[[a, b]] = -4.0 * (&h_a * &u_b).sum();
            }
        }

        let d_vo = d_r.slice(s![nocc..nmo, 0..nocc]);
        let scr1_o = scr1.slice(s![.., 0..nocc]);
        let scr1_v = scr1.slice(s![.., nocc..nmo]);
        let mut pol_corr = Array2::zeros((3, 3));
        for a in 0..3 {
            let u_a_vo = u_1.slice(s![a, nocc..nmo, 0..nocc]);
            let scr2_a = scr2.index_axis(Axis(0), a);
            for b in 0..3 {
                let u_b = u_1.index_axis(Axis(0), b);
                let u_b_mv = u_b.slice(s![.., nocc..nmo]);
                let u_b_mo = u_b.slice(s![.., 0..nocc]);
                let f_b_oo = pda_f.slice(s![b, 0..nocc, 0..nocc]);
                let f_b_vv = pda_f.slice(s![b, nocc..nmo, nocc..nmo]);

                let mut val = 0.0;
                val += (&u_a_vo * &u_b_mv.t().dot(&scr1_o)).sum();
                val += (&u_a_vo * &scr1_v.t().dot(&u_b_mo)).sum();
                val += (&scr2_a.dot(&u_b) * &d_r).sum();
                val += (&u_b.t().dot(&scr2_a) * &d_r).sum();
                val += (&scr2_a * &pda_d.index_axis(Axis(0), b)).sum();
                val += (&scr3.index_axis(Axis(0), b) * &u_a_vo).sum();
                val -= (&f_b_oo * &d_vo.t().dot(&u_a_vo)).sum();
                let tmp = u_a_vo.dot(&d_vo.t());
                val += (&f_b_vv * &tmp.t()).sum();
                pol_corr[[a, b]] = -val;
            }
        }
        if self.dh.kind == XcKind::Gga {
            require_keys(&self.tensors, STAGE, &["Ax1_contrib"])?;
            let ax1 = self.tensors.load_dim::<Ix2>("Ax1_contrib")?;
            pol_corr.scaled_add(-2.0, &ax1);
        }
        let pol_tot = &pol_scf + &pol_corr;
        if self.flags.print_level > 0 {
            println!("Polarizability, SCF part:");
            formated_output_3x3(&pol_scf);
            println!("Polarizability, correlation part:");
            formated_output_3x3(&pol_corr);
            println!("Polarizability, total:");
            formated_output_3x3(&pol_tot);
        }
        self.pol_scf = Some(pol_scf);
        self.pol_corr = Some(pol_corr);
        self.pol_tot = Some(pol_tot);
        return Ok(self);
    }

    /// Run the whole pipeline in its fixed order and return the total
    /// polarizability. The schedule is a static path; only the
    /// kernel-response pair of stages is conditional on the functional
    /// being gradient-corrected.
    pub fn kernel(&mut self) -> Result<Array2<f64>> {
        let mut time_mark = TimeRecords::new();
        time_mark.new_item("dh polar", "the whole response pipeline");
        time_mark.new_item("dh polar scf", "self-consistent reference");
        time_mark.new_item("dh polar pt2", "amplitudes and lagrangian");
        time_mark.new_item("dh polar response", "CPKS solutions");
        time_mark.new_item("dh polar pt2 deriv", "perturbed amplitudes");
        time_mark.count_start("dh polar");

        time_mark.count_start("dh polar scf");
        self.run_scf()?;
        time_mark.count("dh polar scf");

        self.prepare_h_1()?;
        self.prepare_integral()?;
        self.prepare_xc_kernel()?;

        time_mark.count_start("dh polar pt2");
        self.prepare_pt2()?;
        self.prepare_lagrangian()?;
        time_mark.count("dh polar pt2");

        time_mark.count_start("dh polar response");
        self.prepare_d_r()?;
        self.prepare_u_1()?;
        time_mark.count("dh polar response");

        if self.dh.kind == XcKind::Gga {
            self.prepare_dm_u()?;
            self.prepare_polar_ax1_gga()?;
        }

        self.prepare_pda_f_0_mo()?;
        self.prepare_pda_y_ia()?;

        time_mark.count_start("dh polar pt2 deriv");
        self.prepare_pt2_deriv()?;
        time_mark.count("dh polar pt2 deriv");

        self.prepare_polar()?;
        time_mark.count("dh polar");

        if self.flags.print_level >= 2 {
            time_mark.report_all();
        }
        return self
            .pol_tot
            .clone()
            .ok_or_else(|| PolarError::Usage("pipeline finished without assembling the property".to_string()));
    }
}

/* #region utilities */

fn require_scf<'s>(scf: &'s Option<ScfSummary>, stage: &'static str) -> Result<&'s ScfSummary> {
    scf.as_ref().ok_or(PolarError::Precondition {
        stage,
        key: "scf_summary".to_string(),
    })
}

fn require_keys(tensors: &HybridStore, stage: &'static str, keys: &[&str]) -> Result<()> {
    for &key in keys {
        if !tensors.contains(key) {
            return Err(PolarError::Precondition {
                stage,
                key: key.to_string(),
            });
        }
    }
    return Ok(());
}

/// Standard-layout copy of `a` reshaped to 2-D.
fn reshape2<D: Dimension>(a: ArrayView<f64, D>, rows: usize, cols: usize) -> Array2<f64> {
    a.as_standard_layout()
        .to_owned()
        .into_shape_with_order((rows, cols))
        .unwrap()
}

/// Load `Y_mo_ri[:, rows, cols]` fully into memory, reading the backing
/// dataset in auxiliary-dimension batches.
fn load_y_block(
    tensors: &HybridStore,
    rows: Range<usize>,
    cols: Range<usize>,
    mem: Option<f64>,
) -> Result<Array3<f64>> {
    let shape = tensors.shape("Y_mo_ri")?;
    let (naux, nmo) = (shape[0], shape[1]);
    let mut out = Array3::zeros((naux, rows.len(), cols.len()));
    let nbatch = calc_batch_size::<f64>(nmo * nmo, mem, None, Some(out.len()));
    for batch in gen_batch(0, naux, nbatch)? {
        let blk = tensors.read_rows_dim::<Ix3>("Y_mo_ri", batch.start, batch.end)?;
        out.slice_mut(s![batch, .., ..])
            .assign(&blk.slice(s![.., rows.clone(), cols.clone()]));
    }
    return Ok(out);
}

/// `out[i, j, a, b] = sum_P left[P, i, a] * right[P, j, b]`.
fn contract_ri_pair(left: ArrayView3<f64>, right: ArrayView3<f64>) -> Array4<f64> {
    let (naux, ni, na) = left.dim();
    let (_, nj, nb) = right.dim();
    let l = reshape2(left, naux, ni * na);
    let r = reshape2(right, naux, nj * nb);
    let m = l.t().dot(&r);
    let g = m.into_shape_with_order((ni, na, nj, nb)).unwrap();
    let g = g.permuted_axes([0, 2, 1, 3]);
    return g.as_standard_layout().to_owned();
}

/// `out[P, i, a] = sum_{j, b} t[i, j, a, b] * y[P, j, b]`.
fn contract_t_y(t: ArrayView4<f64>, y: ArrayView3<f64>) -> Array3<f64> {
    let (bi, _, na, nb) = t.dim();
    let (naux, nj, _) = y.dim();
    let t2 = reshape2(t.permuted_axes([0, 2, 1, 3]), bi * na, nj * nb);
    let y2 = reshape2(y, naux, nj * nb);
    let m = t2.dot(&y2.t());
    let m = m.into_shape_with_order((bi, na, naux)).unwrap();
    let m = m.permuted_axes([2, 0, 1]);
    return m.as_standard_layout().to_owned();
}

/// `d[i, j, a, b] = eo[i] + eo[j] - ev[a] - ev[b]` for `i` in `range`.
fn energy_denominator(eo: &Array1<f64>, ev: &Array1<f64>, range: &Range<usize>) -> Array4<f64> {
    let (nocc, nvir) = (eo.len(), ev.len());
    let mut d = Array4::zeros((range.len(), nocc, nvir, nvir));
    for (ii, i) in range.clone().enumerate() {
        for j in 0..nocc {
            for a in 0..nvir {
                for b in 0..nvir {
                    d[[ii, j, a, b]] = eo[i] + eo[j] - ev[a] - ev[b];
                }
            }
        }
    }
    return d;
}

/// Right-hand-side intermediate of the final contraction, assembled in
/// auxiliary-dimension batches.
fn assemble_scr3(
    tensors: &HybridStore,
    nocc: usize,
    nmo: usize,
    naux: usize,
    mem: Option<f64>,
    par: bool,
) -> Result<Array3<f64>> {
    let nvir = nmo - nocc;
    let u_1 = tensors.load_dim::<Ix3>("U_1")?;
    let g_ia = tensors.load_dim::<Ix3>("G_ia")?;
    let pda_g = tensors.load_dim::<Ix4>("pdA_G_ia")?;
    let mut scr3 = Array3::<f64>::zeros((3, nvir, nocc));
    let nbatch =
        calc_batch_size::<f64>(10 * nmo * nmo, mem, None, Some(g_ia.len() + pda_g.len()));
    for batch in gen_batch(0, naux, nbatch)? {
        let bk = batch.len();
        let y_blk = tensors.read_rows_dim::<Ix3>("Y_mo_ri", batch.start, batch.end)?;

        let mut pdy_oo = Array4::zeros((3, bk, nocc, nocc));
        let mut pdy_vv = Array4::zeros((3, bk, nvir, nvir));
        for a in 0..3 {
            let u_a = u_1.index_axis(Axis(0), a);
            let u_occ = u_a.slice(s![.., 0..nocc]);
            let u_vir = u_a.slice(s![.., nocc..nmo]);
            for pp in 0..bk {
                let y_p = y_blk.index_axis(Axis(0), pp);
                pdy_oo
                    .slice_mut(s![a, pp, .., ..])
                    .assign(&u_occ.t().dot(&y_p.slice(s![.., 0..nocc])));
                pdy_vv
                    .slice_mut(s![a, pp, .., ..])
                    .assign(&u_vir.t().dot(&y_p.slice(s![.., nocc..nmo])));
            }
        }
        hermi_sum_trailing(&mut pdy_oo, par);
        hermi_sum_trailing(&mut pdy_vv, par);

        for a in 0..3 {
            for (pp, p) in batch.clone().enumerate() {
                let y_p = y_blk.index_axis(Axis(0), pp);
                let y_oo = y_p.slice(s![0..nocc, 0..nocc]);
                let y_vv = y_p.slice(s![nocc..nmo, nocc..nmo]);
                let g_p = g_ia.index_axis(Axis(0), p);
                let pg_p = pda_g.slice(s![a, p, .., ..]);
                let mut dst = scr3.index_axis_mut(Axis(0), a);
                dst.scaled_add(-4.0, &pg_p.t().dot(&y_oo.t()));
                dst.scaled_add(-4.0, &g_p.t().dot(&pdy_oo.slice(s![a, pp, .., ..]).t()));
                dst.scaled_add(4.0, &y_vv.dot(&pg_p.t()));
                dst.scaled_add(4.0, &pdy_vv.slice(s![a, pp, .., ..]).dot(&g_p.t()));
            }
        }
    }
    if tensors.contains("pdA_F_0_mo_n") {
        let f_n = tensors.load_dim::<Ix3>("pdA_F_0_mo_n")?;
        scr3.scaled_add(4.0, &f_n.slice(s![.., nocc..nmo, 0..nocc]));
    }
    return Ok(scr3);
}

fn formated_output_3x3(mat: &Array2<f64>) {
    for row in mat.rows() {
        println!("{:16.8} {:16.8} {:16.8}", row[0], row[1], row[2]);
    }
}

/* #endregion */

#[cfg(test)]
mod debug {
    use super::*;
    use crate::engine::{XcKernel, XcKernelThird};
    use serde::Deserialize;

    #[derive(Clone, Deserialize)]
    struct ModelSpec {
        nocc: usize,
        nvir: usize,
        naux: usize,
        ngrid: usize,
        seed: u64,
    }

    fn model_spec() -> ModelSpec {
        let input_token = r##"
[model]
    nocc  = 3
    nvir  = 3
    naux  = 10
    ngrid = 8
    seed  = 42
"##;
        let keys = toml::from_str::<serde_json::Value>(&input_token[..]).unwrap();
        serde_json::from_value(keys["model"].clone()).unwrap()
    }

    struct Lcg(u64);

    impl Lcg {
        fn new(seed: u64) -> Lcg {
            Lcg(seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
        }

        fn next_f64(&mut self) -> f64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 11) as f64 / (1u64 << 53) as f64 - 0.5
        }
    }

    /// Deterministic synthetic collaborator: a linear response operator,
    /// a diagonal CPKS solve, and a fixed grid projection.
    struct ModelEngine {
        summary: ScfSummary,
        dipole: Array3<f64>,
        y: Array3<f64>,
        rho: Array2<f64>,
        weights: Array1<f64>,
        fxc: Array2<f64>,
        kxc: Array2<f64>,
        grid_map: Array4<f64>,
    }

    impl ModelEngine {
        fn build(spec: &ModelSpec) -> ModelEngine {
            let (nocc, nvir) = (spec.nocc, spec.nvir);
            let nmo = nocc + nvir;
            let nao = nmo;
            let (naux, ngrid) = (spec.naux, spec.ngrid);
            let mut rng = Lcg::new(spec.seed);

            let mo_energy =
                Array1::from_iter((0..nmo).map(|p| p as f64 - nocc as f64 + 0.5 + 0.1 * rng.next_f64()));
            let mut mo_coeff = Array2::eye(nao);
            for u in 0..nao {
                for p in 0..nmo {
                    mo_coeff[[u, p]] += 0.05 * rng.next_f64();
                }
            }
            let mut mo_occ = Array1::zeros(nmo);
            mo_occ.slice_mut(s![0..nocc]).fill(2.0);

            let mut dipole = Array3::zeros((3, nao, nao));
            for t in 0..3 {
                for u in 0..nao {
                    for v in u..nao {
                        let x = rng.next_f64();
                        dipole[[t, u, v]] = x;
                        dipole[[t, v, u]] = x;
                    }
                }
            }
            let mut y = Array3::zeros((naux, nmo, nmo));
            for p in 0..naux {
                for u in 0..nmo {
                    for v in u..nmo {
                        let x = rng.next_f64();
                        y[[p, u, v]] = x;
                        y[[p, v, u]] = x;
                    }
                }
            }
            let mut rho = Array2::zeros((4, ngrid));
            for r in 0..4 {
                for g in 0..ngrid {
                    rho[[r, g]] = if r == 0 {
                        0.5 + rng.next_f64().abs()
                    } else {
                        0.2 * rng.next_f64()
                    };
                }
            }
            let weights = Array1::from_iter((0..ngrid).map(|_| 0.1 + rng.next_f64().abs()));
            let mut fxc = Array2::zeros((3, ngrid));
            fxc.mapv_inplace(|_: f64| 0.1 * rng.next_f64());
            let mut kxc = Array2::zeros((4, ngrid));
            kxc.mapv_inplace(|_: f64| 0.1 * rng.next_f64());
            let mut grid_map = Array4::zeros((4, ngrid, nao, nao));
            for r in 0..4 {
                for g in 0..ngrid {
                    for u in 0..nao {
                        for v in u..nao {
                            let x = 0.1 * rng.next_f64();
                            grid_map[[r, g, u, v]] = x;
                            grid_map[[r, g, v, u]] = x;
                        }
                    }
                }
            }

            let summary = ScfSummary {
                e_scf: -10.0 + rng.next_f64(),
                mo_energy,
                mo_coeff,
                mo_occ,
                nao,
                nmo,
                nocc,
                nvir,
                naux,
            };
            ModelEngine { summary, dipole, y, rho, weights, fxc, kxc, grid_map }
        }
    }

    impl ResponseEngine for ModelEngine {
        fn run_scf(&mut self) -> anyhow::Result<ScfSummary> {
            Ok(self.summary.clone())
        }

        fn dipole_ao(&self) -> anyhow::Result<Array3<f64>> {
            Ok(self.dipole.clone())
        }

        fn ri_mo_block(&self, start: usize, stop: usize) -> anyhow::Result<Array3<f64>> {
            Ok(self.y.slice(s![start..stop, .., ..]).to_owned())
        }

        fn solve_cpks(
            &self,
            rhs: ArrayView3<f64>,
            _max_cycle: usize,
            _tol: f64,
        ) -> anyhow::Result<Array3<f64>> {
            let (nset, nvir, nocc) = rhs.dim();
            let e = &self.summary.mo_energy;
            let mut u = rhs.to_owned();
            for s in 0..nset {
                for a in 0..nvir {
                    for i in 0..nocc {
                        u[[s, a, i]] /= e[i] - e[nocc + a] - 0.5;
                    }
                }
            }
            Ok(u)
        }

        fn ax0_mo(&self, x: ArrayView3<f64>) -> anyhow::Result<Array3<f64>> {
            let mut out = x.to_owned();
            hermi_sum_trailing(&mut out, false);
            out.mapv_inplace(|v| 0.05 * v);
            Ok(out)
        }

        fn xc_kernel(&self) -> anyhow::Result<XcKernel> {
            Ok(XcKernel {
                rho: self.rho.clone(),
                weights: self.weights.clone(),
                fxc: self.fxc.clone(),
            })
        }

        fn xc_kernel_third(&self) -> anyhow::Result<XcKernelThird> {
            Ok(XcKernelThird { kxc: self.kxc.clone() })
        }

        fn eval_rho_resp(&self, dms: ArrayView3<f64>) -> anyhow::Result<Array3<f64>> {
            let nset = dms.dim().0;
            let ngrid = self.weights.len();
            let mut out = Array3::zeros((nset, 4, ngrid));
            for s in 0..nset {
                for r in 0..4 {
                    for g in 0..ngrid {
                        out[[s, r, g]] =
                            (&self.grid_map.slice(s![r, g, .., ..]) * &dms.index_axis(Axis(0), s)).sum();
                    }
                }
            }
            Ok(out)
        }

        fn weighted_grid_matrix(&self, wv: ArrayView3<f64>) -> anyhow::Result<Array3<f64>> {
            let nset = wv.dim().0;
            let ngrid = self.weights.len();
            let nao = self.summary.nao;
            let mut out = Array3::zeros((nset, nao, nao));
            for s in 0..nset {
                for r in 0..4 {
                    for g in 0..ngrid {
                        out.index_axis_mut(Axis(0), s)
                            .scaled_add(wv[[s, r, g]], &self.grid_map.slice(s![r, g, .., ..]));
                    }
                }
            }
            Ok(out)
        }
    }

    fn flags_with_memory(mem: f64) -> PolarFlags {
        PolarFlagsBuilder::default()
            .max_memory(Some(mem))
            .print_level(0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_mp2_reference_pipeline() {
        let spec = model_spec();
        let mut engine = ModelEngine::build(&spec);
        let dh = parse_xc_dh("mp2").unwrap();
        let mut mf = RIDHPolar::with_flags(&mut engine, dh, flags_with_memory(1024.0)).unwrap();
        let pol = mf.kernel().unwrap();
        assert_eq!(pol.shape(), &[3, 3]);
        assert!(pol.iter().all(|x| x.is_finite()));
        // HF-type reference skips the kernel-response stages
        assert!(!mf.tensors.contains("rhoU"));
        assert!(!mf.tensors.contains("Ax1_contrib"));
        assert!(mf.tensors.contains("U_1"));
        assert!(mf.tensors.contains("pdA_G_ia"));
        // the large intermediates stay on disk
        assert!(!mf.tensors.is_incore("t_ijab").unwrap());
        assert!(!mf.tensors.is_incore("Y_mo_ri").unwrap());
        assert!(mf.e_corr.is_some());
        assert_eq!(mf.get_polarizability(), pol);
    }

    #[test]
    fn test_gga_pipeline_runs_kernel_response() {
        let spec = model_spec();
        let mut engine = ModelEngine::build(&spec);
        let dh = parse_xc_dh("b2plyp").unwrap();
        let mut mf = RIDHPolar::with_flags(&mut engine, dh, flags_with_memory(1024.0)).unwrap();
        let pol = mf.kernel().unwrap();
        assert!(pol.iter().all(|x| x.is_finite()));
        for key in ["rho", "fxc", "rhoU", "rhoDr", "kxc", "Ax1_contrib"] {
            assert!(mf.tensors.contains(key), "missing `{}`", key);
        }
    }

    #[test]
    fn test_batched_matches_unbatched() {
        let spec = model_spec();
        let dh = parse_xc_dh("b2plyp").unwrap();

        let mut e1 = ModelEngine::build(&spec);
        let mut mf1 = RIDHPolar::with_flags(&mut e1, dh.clone(), flags_with_memory(4096.0)).unwrap();
        let pol_full = mf1.kernel().unwrap();
        drop(mf1);

        // budget far below the baseline: every chunk floors at one index,
        // exercising the outer and inner batch loops fully
        let mut e2 = ModelEngine::build(&spec);
        let mut mf2 = RIDHPolar::with_flags(&mut e2, dh, flags_with_memory(1.0e-6)).unwrap();
        let pol_tiny = mf2.kernel().unwrap();

        let diff = (&pol_full - &pol_tiny)
            .iter()
            .fold(0.0f64, |acc, x| acc.max(x.abs()));
        assert!(diff < 1.0e-8, "batched/unbatched mismatch: {}", diff);
    }

    #[test]
    fn test_pipeline_is_deterministic() {
        let spec = model_spec();
        let dh = parse_xc_dh("mp2").unwrap();
        let mut e1 = ModelEngine::build(&spec);
        let pol1 = RIDHPolar::with_flags(&mut e1, dh.clone(), flags_with_memory(1024.0))
            .unwrap()
            .kernel()
            .unwrap();
        let mut e2 = ModelEngine::build(&spec);
        let pol2 = RIDHPolar::with_flags(&mut e2, dh, flags_with_memory(1024.0))
            .unwrap()
            .kernel()
            .unwrap();
        assert_eq!(pol1, pol2);
    }

    #[test]
    fn test_out_of_order_stage_is_precondition_error() {
        let spec = model_spec();
        let mut engine = ModelEngine::build(&spec);
        let dh = parse_xc_dh("mp2").unwrap();
        let mut mf = RIDHPolar::with_flags(&mut engine, dh, flags_with_memory(1024.0)).unwrap();
        mf.run_scf().unwrap();
        let err = match mf.prepare_pt2_deriv() {
            Err(e) => e,
            Ok(_) => panic!("expected a precondition error"),
        };
        assert!(matches!(err, PolarError::Precondition { stage: "prepare_pt2_deriv", .. }));
        // the diagnostic names both the stage and the missing tensor
        let msg = err.to_string();
        assert!(msg.contains("prepare_pt2_deriv"));
        assert!(msg.contains("pdA_F_0_mo"));
    }

    #[test]
    fn test_stage_before_scf_is_precondition_error() {
        let spec = model_spec();
        let mut engine = ModelEngine::build(&spec);
        let dh = parse_xc_dh("mp2").unwrap();
        let mut mf = RIDHPolar::with_flags(&mut engine, dh, flags_with_memory(1024.0)).unwrap();
        let err = match mf.prepare_h_1() {
            Err(e) => e,
            Ok(_) => panic!("expected a precondition error"),
        };
        assert!(matches!(err, PolarError::Precondition { stage: "prepare_h_1", .. }));
    }
}
