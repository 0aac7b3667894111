//! Dense numeric helpers of the response stages.
//!
//! The parallel/serial choice is threaded in by the caller (resolved once
//! at pipeline construction), never read from ambient state.

use crate::constants::BIORTH_THRESHOLD;
use ndarray::prelude::*;
use rayon::prelude::*;

/// Biorthogonalize closed-shell amplitudes:
/// `cc * ((c_os + c_ss) * t - c_ss * t.swapaxes(-1, -2))`.
///
/// When the same-spin coefficient magnitude is below 1e-7 the transpose
/// pass is skipped and only the scalar scaling is applied; in that regime
/// both paths agree to floating-point accuracy.
pub fn restricted_biorthogonalize<D: Dimension>(
    t_ijab: ArrayView<f64, D>,
    cc: f64,
    c_os: f64,
    c_ss: f64,
    parallel: bool,
) -> Array<f64, D> {
    let coef_0 = cc * (c_os + c_ss);
    let coef_1 = -cc * c_ss;
    if coef_1.abs() < BIORTH_THRESHOLD {
        return t_ijab.mapv(|x| coef_0 * x);
    }

    let nd = t_ijab.ndim();
    assert!(nd >= 2);
    let n = t_ijab.shape()[nd - 1];
    assert_eq!(t_ijab.shape()[nd - 2], n);

    let t = t_ijab.as_standard_layout();
    let mut res = t.mapv(|x| coef_0 * x);
    let t_slice = t.as_slice().unwrap();
    let res_slice = res.as_slice_mut().unwrap();
    let pair = n * n;
    if parallel {
        res_slice
            .par_chunks_mut(pair)
            .zip(t_slice.par_chunks(pair))
            .for_each(|(r, t)| add_scaled_transpose(r, t, n, coef_1));
    } else {
        for (r, t) in res_slice.chunks_mut(pair).zip(t_slice.chunks(pair)) {
            add_scaled_transpose(r, t, n, coef_1);
        }
    }
    return res;
}

fn add_scaled_transpose(res: &mut [f64], t: &[f64], n: usize, coef: f64) {
    for i in 0..n {
        for j in 0..n {
            res[i * n + j] += coef * t[j * n + i];
        }
    }
}

/// In-place `t += t.swapaxes(-1, -2)` over the trailing square axis pair.
///
/// The tensor is processed in leading-index chunks; a trailing pair is
/// always transformed as one contiguous unit inside its chunk. Note the
/// transform is additive: applying it twice doubles an already-symmetric
/// tensor.
pub fn hermi_sum_trailing<D: Dimension>(tsr: &mut Array<f64, D>, parallel: bool) {
    let nd = tsr.ndim();
    assert!(nd >= 2);
    let n = tsr.shape()[nd - 1];
    assert_eq!(tsr.shape()[nd - 2], n);

    let slice = tsr
        .as_slice_mut()
        .expect("trailing-pair symmetrization requires standard layout");
    let pair = n * n;
    if parallel {
        slice.par_chunks_mut(pair).for_each(|block| hermi_block(block, n));
    } else {
        for block in slice.chunks_mut(pair) {
            hermi_block(block, n);
        }
    }
}

fn hermi_block(block: &mut [f64], n: usize) {
    for i in 0..n {
        for j in i..n {
            let s = block[i * n + j] + block[j * n + i];
            block[i * n + j] = s;
            block[j * n + i] = s;
        }
    }
}

/// Second-order GGA response weights on the grid.
///
/// `rho0` is the ground-state density/gradient `(4, ngrid)`, `rho1` and
/// `rho2` two first-order responses of the same shape, `fxc` the second
/// derivatives `(frr, frg, fgg)` and `kxc` the third derivatives
/// `(frrr, frrg, frgg, fggg)`.
pub fn rks_gga_wv2(
    rho0: ArrayView2<f64>,
    rho1: ArrayView2<f64>,
    rho2: ArrayView2<f64>,
    fxc: ArrayView2<f64>,
    kxc: ArrayView2<f64>,
    weight: ArrayView1<f64>,
) -> Array2<f64> {
    let ngrid = weight.len();
    let (frr, frg, fgg) = (fxc.row(0), fxc.row(1), fxc.row(2));
    let (frrr, frrg, frgg, fggg) = (kxc.row(0), kxc.row(1), kxc.row(2), kxc.row(3));

    let grad0 = rho0.slice(s![1.., ..]);
    let grad1 = rho1.slice(s![1.., ..]);
    let grad2 = rho2.slice(s![1.., ..]);

    let sigma01 = 2.0 * (&grad0 * &grad1).sum_axis(Axis(0));
    let sigma02 = 2.0 * (&grad0 * &grad2).sum_axis(Axis(0));
    let sigma12 = 2.0 * (&grad1 * &grad2).sum_axis(Axis(0));
    let r1r2 = &rho1.row(0) * &rho2.row(0);
    let r1s2 = &rho1.row(0) * &sigma02;
    let s1r2 = &sigma01 * &rho2.row(0);
    let s1s2 = &sigma01 * &sigma02;

    let mut wv = Array2::<f64>::zeros((4, ngrid));

    let wv0 = &frrr * &r1r2 + &frrg * &r1s2 + &frrg * &s1r2 + &frgg * &s1s2 + &frg * &sigma12;
    wv.row_mut(0).assign(&(0.5 * wv0));

    let wv1_tmp = &frrg * &r1r2 + &frgg * &r1s2 + &frgg * &s1r2 + &fggg * &s1s2 + &fgg * &sigma12;
    let mut wv_grad = &grad0 * &wv1_tmp;
    wv_grad = wv_grad + &grad2 * &(&frg * &rho1.row(0));
    wv_grad = wv_grad + &grad1 * &(&frg * &rho2.row(0));
    wv_grad = wv_grad + &grad2 * &(&fgg * &sigma01);
    wv_grad = wv_grad + &grad1 * &(&fgg * &sigma02);
    wv.slice_mut(s![1.., ..]).assign(&(2.0 * wv_grad));

    wv = wv * &weight;
    return wv;
}

#[cfg(test)]
mod debug {
    use super::*;
    use ndarray::ArrayD;
    use ndarray::IxDyn;

    fn lcg_fill(shape: &[usize], seed: u64) -> ArrayD<f64> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let n: usize = shape.iter().product();
        let data = (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 11) as f64 / (1u64 << 53) as f64 - 0.5
            })
            .collect();
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    #[test]
    fn test_biorthogonalize_general_path() {
        let t = lcg_fill(&[2, 3, 4, 4], 3);
        let cc = 0.27;
        let (c_os, c_ss) = (1.0, 1.0);
        let res = restricted_biorthogonalize(t.view(), cc, c_os, c_ss, false);
        let res_par = restricted_biorthogonalize(t.view(), cc, c_os, c_ss, true);
        assert_eq!(res, res_par);
        // spot-check against the definition
        for (i, j) in [(1usize, 2usize), (0, 3), (2, 0)] {
            let expect = cc * ((c_os + c_ss) * t[[1, 2, i, j]] - c_ss * t[[1, 2, j, i]]);
            assert!((res[[1, 2, i, j]] - expect).abs() < 1e-14);
        }
    }

    #[test]
    fn test_biorthogonalize_same_spin_short_circuit() {
        let t = lcg_fill(&[3, 5, 5], 5);
        let cc = 0.4364;
        let c_os = 1.0;
        // below the tolerance: the scalar path must match the general path
        // evaluated at that coefficient
        let c_ss = 1e-8;
        let shortcut = restricted_biorthogonalize(t.view(), cc, c_os, c_ss, false);
        let scaled = t.mapv(|x| cc * (c_os + c_ss) * x);
        assert_eq!(shortcut, scaled);

        // general-path output at the same coefficient agrees to fp accuracy
        let general: ArrayD<f64> = {
            let coef_0 = cc * (c_os + c_ss);
            let coef_1 = -cc * c_ss;
            let mut sw = t.clone();
            sw.swap_axes(1, 2);
            let sw = sw.as_standard_layout().to_owned();
            coef_0 * &t + coef_1 * &sw
        };
        let max_diff = (&general - &shortcut)
            .iter()
            .fold(0.0f64, |acc, x| acc.max(x.abs()));
        assert!(max_diff < 1e-7);
    }

    #[test]
    fn test_hermi_sum_trailing() {
        let t = lcg_fill(&[4, 3, 3], 9);
        let mut sym = t.clone();
        hermi_sum_trailing(&mut sym, false);
        for l in 0..4 {
            for i in 0..3 {
                for j in 0..3 {
                    let expect = t[[l, i, j]] + t[[l, j, i]];
                    assert!((sym[[l, i, j]] - expect).abs() < 1e-14);
                    assert!((sym[[l, i, j]] - sym[[l, j, i]]).abs() < 1e-14);
                }
            }
        }
        let mut par = t.clone();
        hermi_sum_trailing(&mut par, true);
        assert_eq!(par, sym);
    }

    #[test]
    fn test_wv2_shape_and_weighting() {
        let ngrid = 6;
        let rho0 = lcg_fill(&[4, ngrid], 11).into_dimensionality().unwrap();
        let rho1 = lcg_fill(&[4, ngrid], 13).into_dimensionality().unwrap();
        let rho2 = lcg_fill(&[4, ngrid], 17).into_dimensionality().unwrap();
        let fxc = lcg_fill(&[3, ngrid], 19).into_dimensionality().unwrap();
        let kxc = lcg_fill(&[4, ngrid], 23).into_dimensionality().unwrap();
        let weight = Array1::from_elem(ngrid, 0.5);

        let wv: Array2<f64> = rks_gga_wv2(
            ArrayView2::from(&rho0),
            ArrayView2::from(&rho1),
            ArrayView2::from(&rho2),
            ArrayView2::from(&fxc),
            ArrayView2::from(&kxc),
            weight.view(),
        );
        assert_eq!(wv.shape(), &[4, ngrid]);

        let double = rks_gga_wv2(
            ArrayView2::from(&rho0),
            ArrayView2::from(&rho1),
            ArrayView2::from(&rho2),
            ArrayView2::from(&fxc),
            ArrayView2::from(&kxc),
            Array1::from_elem(ngrid, 1.0).view(),
        );
        let diff = (&double * 0.5 - &wv).iter().fold(0.0f64, |a, x| a.max(x.abs()));
        assert!(diff < 1e-14);
    }
}
