//! Doubly-hybrid functional definitions.
//!
//! A doubly-hybrid method is described by its self-consistent functional,
//! an optional secondary energy functional (xDH-type methods evaluate the
//! energy with a different functional than the orbitals were optimized
//! with), and the PT2 mixing coefficients `cc`, `c_os`, `c_ss`.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Classification of the exchange-correlation reference, driving the
/// kernel-response branch of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum XcKind {
    HartreeFock,
    Lda,
    Gga,
}

#[derive(Clone, Debug, Serialize)]
pub struct DhFunctional {
    pub name: &'static str,
    /// Functional of the self-consistent reference.
    pub xc_scf: &'static str,
    /// Secondary energy functional of xDH-type methods.
    pub xc_energy: Option<&'static str>,
    /// Overall PT2 coefficient.
    pub cc: f64,
    /// Opposite-spin PT2 coefficient.
    pub c_os: f64,
    /// Same-spin PT2 coefficient.
    pub c_ss: f64,
    pub kind: XcKind,
}

impl DhFunctional {
    const fn new(
        name: &'static str,
        xc_scf: &'static str,
        xc_energy: Option<&'static str>,
        cc: f64,
        c_os: f64,
        c_ss: f64,
        kind: XcKind,
    ) -> DhFunctional {
        DhFunctional { name, xc_scf, xc_energy, cc, c_os, c_ss, kind }
    }
}

lazy_static! {
    /// Doubly hybrid functionals xc code in detail.
    pub static ref DH_XC_MAP: HashMap<&'static str, DhFunctional> = {
        let mut map = HashMap::new();
        for dh in [
            DhFunctional::new("mp2", "HF", None, 1.0, 1.0, 1.0, XcKind::HartreeFock),
            DhFunctional::new(
                "xyg3", "B3LYPg",
                Some("0.8033*HF - 0.0140*LDA + 0.2107*B88, 0.6789*LYP"),
                0.3211, 1.0, 1.0, XcKind::Gga,
            ),
            DhFunctional::new(
                "xygjos", "B3LYPg",
                Some("0.7731*HF + 0.2269*LDA, 0.2309*VWN3 + 0.2754*LYP"),
                0.4364, 1.0, 0.0, XcKind::Gga,
            ),
            DhFunctional::new(
                "xdhpbe0", "PBE0",
                Some("0.8335*HF + 0.1665*PBE, 0.5292*PBE"),
                0.5428, 1.0, 0.0, XcKind::Gga,
            ),
            DhFunctional::new("b2plyp", "0.53*HF + 0.47*B88, 0.73*LYP", None, 0.27, 1.0, 1.0, XcKind::Gga),
            DhFunctional::new("mpw2plyp", "0.55*HF + 0.45*mPW91, 0.75*LYP", None, 0.25, 1.0, 1.0, XcKind::Gga),
            DhFunctional::new("pbe0dh", "0.5*HF + 0.5*PBE, 0.875*PBE", None, 0.125, 1.0, 1.0, XcKind::Gga),
            DhFunctional::new("pbeqidh", "0.693361*HF + 0.306639*PBE, 0.666667*PBE", None, 0.333333, 1.0, 1.0, XcKind::Gga),
            DhFunctional::new("pbe02", "0.793701*HF + 0.206299*PBE, 0.5*PBE", None, 0.5, 1.0, 1.0, XcKind::Gga),
        ] {
            map.insert(dh.name, dh);
        }
        map
    };
}

/// Look up a doubly-hybrid functional by name. Dashes, underscores and
/// case are ignored.
pub fn parse_xc_dh(name: &str) -> Option<DhFunctional> {
    let normalized: String = name
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(|c| c.to_lowercase())
        .collect();
    DH_XC_MAP.get(normalized.as_str()).cloned()
}

#[cfg(test)]
mod debug {
    use super::*;

    #[test]
    fn test_parse() {
        let dh = parse_xc_dh("XYG3").unwrap();
        assert_eq!(dh.kind, XcKind::Gga);
        assert!((dh.cc - 0.3211).abs() < 1e-12);

        let dh = parse_xc_dh("B2-PLYP").unwrap();
        assert_eq!(dh.name, "b2plyp");

        let dh = parse_xc_dh("mp2").unwrap();
        assert_eq!(dh.kind, XcKind::HartreeFock);
        assert!(parse_xc_dh("no-such-functional").is_none());
    }

    #[test]
    fn test_xygjos_is_opposite_spin_only() {
        let dh = parse_xc_dh("XYGJ-OS").unwrap();
        assert_eq!(dh.c_ss, 0.0);
    }
}
