//! Constant-rate birth-death process kernel.
//!
//! `p0`/`p1`/`intp1` follow Stadler (2010); `lik_constant` is the negative
//! log-likelihood of a set of branching times under that process. When the
//! double-precision kernel over/underflows, the `_exact` variants re-derive
//! the same formulas using `rust_decimal` and convert back to `f64`.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::errors::{TactError, TactResult};

/// Birth and death rates, always non-negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BirthDeath {
    pub birth: f64,
    pub death: f64,
}

/// Convert turnover `r = birth - death` and relative extinction `a =
/// death / birth` into (birth, death).
pub fn get_bd(r: f64, a: f64) -> BirthDeath {
    let birth = r / (1.0 - a);
    let death = birth * a;
    BirthDeath { birth, death }
}

/// Inverse of [`get_bd`]: convert (birth, death) into (r, a).
pub fn get_ra(birth: f64, death: f64) -> (f64, f64) {
    (birth - death, death / birth)
}

/// Probability that a lineage at time `t` in the past, under a constant-rate
/// birth-death process sampled with probability `rho`, has no sampled
/// descendants today.
fn p0(t: f64, birth: f64, death: f64, rho: f64) -> f64 {
    if birth == death {
        return 1.0 - rho / (1.0 + birth * rho * t);
    }
    let diff = birth - death;
    let e = (-diff * t).exp();
    1.0 - rho * diff / (rho * birth + (birth * (1.0 - rho) - death) * e)
}

fn p0_exact(t: f64, birth: f64, death: f64, rho: f64) -> TactResult<f64> {
    let t_d = Decimal::from_f64(t).ok_or_else(|| TactError::Numeric("non-finite t".into()))?;
    let birth_d = Decimal::from_f64(birth).ok_or_else(|| TactError::Numeric("non-finite birth".into()))?;
    let death_d = Decimal::from_f64(death).ok_or_else(|| TactError::Numeric("non-finite death".into()))?;
    let rho_d = Decimal::from_f64(rho).ok_or_else(|| TactError::Numeric("non-finite rho".into()))?;
    if birth_d == death_d {
        let denom = Decimal::ONE + birth_d * rho_d * t_d;
        return (Decimal::ONE - rho_d / denom)
            .to_f64()
            .ok_or_else(|| TactError::Numeric("decimal conversion overflow".into()));
    }
    let diff = birth_d - death_d;
    let exponent = (-diff * t_d).to_f64().ok_or_else(|| TactError::Numeric("exponent overflow".into()))?;
    let e = Decimal::from_f64(exponent.exp()).ok_or_else(|| TactError::Numeric("exp overflow".into()))?;
    let den = rho_d * birth_d + (birth_d * (Decimal::ONE - rho_d) - death_d) * e;
    (Decimal::ONE - rho_d * diff / den)
        .to_f64()
        .ok_or_else(|| TactError::Numeric("decimal conversion overflow".into()))
}

/// Probability that a single lineage at time `t` in the past has exactly one
/// sampled descendant today, under sampling fraction `rho`.
pub fn p1(t: f64, birth: f64, death: f64, rho: f64) -> f64 {
    let v = p1_raw(t, birth, death, rho);
    if v.is_finite() && v >= 0.0 {
        v
    } else {
        p1_exact(t, birth, death, rho).unwrap_or(v)
    }
}

fn p1_raw(t: f64, birth: f64, death: f64, rho: f64) -> f64 {
    if birth == death {
        let denom = 1.0 + birth * rho * t;
        return rho / (denom * denom);
    }
    let diff = birth - death;
    let e = (-diff * t).exp();
    let den = rho * birth + (birth * (1.0 - rho) - death) * e;
    rho * diff * diff * e / (den * den)
}

fn p1_exact(t: f64, birth: f64, death: f64, rho: f64) -> TactResult<f64> {
    let t_d = Decimal::from_f64(t).ok_or_else(|| TactError::Numeric("non-finite t".into()))?;
    let birth_d = Decimal::from_f64(birth).ok_or_else(|| TactError::Numeric("non-finite birth".into()))?;
    let death_d = Decimal::from_f64(death).ok_or_else(|| TactError::Numeric("non-finite death".into()))?;
    let rho_d = Decimal::from_f64(rho).ok_or_else(|| TactError::Numeric("non-finite rho".into()))?;
    if birth_d == death_d {
        let denom = Decimal::ONE + birth_d * rho_d * t_d;
        return (rho_d / (denom * denom))
            .to_f64()
            .ok_or_else(|| TactError::Numeric("decimal conversion overflow".into()));
    }
    let diff = birth_d - death_d;
    let exponent = (-diff * t_d).to_f64().ok_or_else(|| TactError::Numeric("exponent overflow".into()))?;
    let e = Decimal::from_f64(exponent.exp()).ok_or_else(|| TactError::Numeric("exp overflow".into()))?;
    let den = rho_d * birth_d + (birth_d * (Decimal::ONE - rho_d) - death_d) * e;
    (rho_d * diff * diff * e / (den * den))
        .to_f64()
        .ok_or_else(|| TactError::Numeric("decimal conversion overflow".into()))
}

/// Integral of `p1` from `0` to `t`, used by the missing-speciation-time
/// sampler's inverse-CDF construction.
pub fn intp1(t: f64, birth: f64, death: f64) -> f64 {
    let v = intp1_raw(t, birth, death);
    if v.is_finite() {
        v
    } else {
        intp1_exact(t, birth, death).unwrap_or(v)
    }
}

fn intp1_raw(t: f64, birth: f64, death: f64) -> f64 {
    if birth == death {
        return (birth * t) / (1.0 + birth * t);
    }
    let diff = death - birth;
    let e = (diff * t).exp();
    (birth - death * e) / (birth * (1.0 - e))
}

fn intp1_exact(t: f64, birth: f64, death: f64) -> TactResult<f64> {
    let t_d = Decimal::from_f64(t).ok_or_else(|| TactError::Numeric("non-finite t".into()))?;
    let birth_d = Decimal::from_f64(birth).ok_or_else(|| TactError::Numeric("non-finite birth".into()))?;
    let death_d = Decimal::from_f64(death).ok_or_else(|| TactError::Numeric("non-finite death".into()))?;
    if birth_d == death_d {
        return ((birth_d * t_d) / (Decimal::ONE + birth_d * t_d))
            .to_f64()
            .ok_or_else(|| TactError::Numeric("decimal conversion overflow".into()));
    }
    let diff = death_d - birth_d;
    let exponent = (diff * t_d).to_f64().ok_or_else(|| TactError::Numeric("exponent overflow".into()))?;
    let e = Decimal::from_f64(exponent.exp()).ok_or_else(|| TactError::Numeric("exp overflow".into()))?;
    ((birth_d - death_d * e) / (birth_d * (Decimal::ONE - e)))
        .to_f64()
        .ok_or_else(|| TactError::Numeric("decimal conversion overflow".into()))
}

/// Negative log-likelihood of a constant-rate birth-death process given a
/// set of branching times `t`, sampling fraction `rho`, with `root`/
/// `survival` flags controlling whether the root branching event is counted
/// twice and whether the survival conditioning term is included (matches
/// Stadler 2010, eq. 1, and TreePar::LikConstant).
pub fn lik_constant(times: &[f64], rho: f64, birth: f64, death: f64, root: bool, survival: bool) -> f64 {
    if birth <= 0.0 || rho <= 0.0 || times.is_empty() {
        return f64::INFINITY;
    }
    let mut times = times.to_vec();
    times.sort_by(|a, b| b.partial_cmp(a).unwrap());

    let root_mult = if root { 2.0 } else { 1.0 };
    let mut lik = root_mult * p1(times[0], birth, death, rho).ln();
    for &t in &times[1..] {
        lik += birth.ln() + p1(t, birth, death, rho).ln();
    }
    if survival {
        lik -= root_mult * (1.0 - p0(times[0], birth, death, rho)).ln();
    }
    -lik
}

/// Special case of [`lik_constant`] with `death = 0` (a pure-birth / Yule
/// process), used by the golden-section scalar optimizer.
pub fn lik_yule(times: &[f64], rho: f64, birth: f64, root: bool, survival: bool) -> f64 {
    lik_constant(times, rho, birth, 0.0, root, survival)
}

/// Sanderson (1996) "crown capture probability": the probability that the
/// MRCA of `k` randomly sampled tips from an `n`-tip clade is also the crown
/// node of the full clade.
pub fn crown_capture_probability(n: usize, k: usize) -> TactResult<f64> {
    if k > n {
        return Err(TactError::Invariant(format!(
            "crown capture probability requires k <= n, got k={k} n={n}"
        )));
    }
    if n == 1 && k == 1 {
        return Ok(0.0);
    }
    let n = n as f64;
    let k = k as f64;
    Ok(1.0 - 2.0 * (n - k) / ((n - 1.0) * (k + 1.0)))
}

/// Magallon & Sanderson (2001) crown-group birth rate estimator under a
/// Yule process, used to seed the local optimizer and for cases where a
/// clade has too few tips to fit a rate directly.
pub fn magallon_sanderson_crown_rate(n_tips: f64, stem_age: f64, sampling_fraction: f64) -> f64 {
    if n_tips <= 1.0 || stem_age <= 0.0 {
        return 0.0;
    }
    let n = n_tips / sampling_fraction;
    (n.ln() - (2.0_f64).ln()) / stem_age
}

#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub lo: f64,
    pub hi: f64,
}

const R_BOUNDS: Bounds = Bounds { lo: 1e-9, hi: 100.0 };
const A_BOUNDS: Bounds = Bounds { lo: 0.0, hi: 1.0 - 1e-9 };

fn clamp(v: f64, b: Bounds) -> f64 {
    v.max(b.lo).min(b.hi)
}

/// Bounded Nelder-Mead simplex search over `(r, a)`, restarted from the
/// Magallon-Sanderson estimate. This is the "local method" half of the
/// two-step optimization.
fn nelder_mead_2d(
    objective: impl Fn(f64, f64) -> f64,
    init: (f64, f64),
    max_iter: usize,
) -> (f64, f64, f64) {
    let clamp_point = |p: (f64, f64)| (clamp(p.0, R_BOUNDS), clamp(p.1, A_BOUNDS));
    let mut simplex = [
        clamp_point(init),
        clamp_point((init.0 * 1.05 + 1e-6, init.1)),
        clamp_point((init.0, init.1 * 1.05 + 1e-6)),
    ];
    let f = |p: (f64, f64)| objective(p.0, p.1);
    let mut fvals = [f(simplex[0]), f(simplex[1]), f(simplex[2])];

    for _ in 0..max_iter {
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| fvals[a].partial_cmp(&fvals[b]).unwrap());
        let (best, mid, worst) = (order[0], order[1], order[2]);

        let centroid = (
            (simplex[best].0 + simplex[mid].0) / 2.0,
            (simplex[best].1 + simplex[mid].1) / 2.0,
        );

        let reflected = clamp_point((
            centroid.0 + (centroid.0 - simplex[worst].0),
            centroid.1 + (centroid.1 - simplex[worst].1),
        ));
        let f_reflected = f(reflected);

        if f_reflected < fvals[best] {
            let expanded = clamp_point((
                centroid.0 + 2.0 * (centroid.0 - simplex[worst].0),
                centroid.1 + 2.0 * (centroid.1 - simplex[worst].1),
            ));
            let f_expanded = f(expanded);
            if f_expanded < f_reflected {
                simplex[worst] = expanded;
                fvals[worst] = f_expanded;
            } else {
                simplex[worst] = reflected;
                fvals[worst] = f_reflected;
            }
        } else if f_reflected < fvals[mid] {
            simplex[worst] = reflected;
            fvals[worst] = f_reflected;
        } else {
            let contracted = clamp_point((
                centroid.0 + 0.5 * (simplex[worst].0 - centroid.0),
                centroid.1 + 0.5 * (simplex[worst].1 - centroid.1),
            ));
            let f_contracted = f(contracted);
            if f_contracted < fvals[worst] {
                simplex[worst] = contracted;
                fvals[worst] = f_contracted;
            } else {
                for i in 0..3 {
                    if i != best {
                        simplex[i] = clamp_point((
                            simplex[best].0 + 0.5 * (simplex[i].0 - simplex[best].0),
                            simplex[best].1 + 0.5 * (simplex[i].1 - simplex[best].1),
                        ));
                        fvals[i] = f(simplex[i]);
                    }
                }
            }
        }

        let spread = (fvals[0] - fvals[1]).abs() + (fvals[1] - fvals[2]).abs() + (fvals[0] - fvals[2]).abs();
        if spread < 1e-10 {
            break;
        }
    }

    let best = (0..3).min_by(|&a, &b| fvals[a].partial_cmp(&fvals[b]).unwrap()).unwrap();
    (simplex[best].0, simplex[best].1, fvals[best])
}

/// Bounded simulated annealing over `(r, a)`, the global-search fallback
/// used when the local method fails to improve on the starting guess.
fn simulated_annealing_2d(objective: impl Fn(f64, f64) -> f64, seed: u64) -> (f64, f64, f64) {
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};
    let mut rng = rand_pcg::Pcg64::seed_from_u64(seed);

    let mut current = (
        rng.gen_range(R_BOUNDS.lo..R_BOUNDS.hi),
        rng.gen_range(A_BOUNDS.lo..A_BOUNDS.hi),
    );
    let mut current_f = objective(current.0, current.1);
    let mut best = current;
    let mut best_f = current_f;

    let iterations = 2000;
    for step in 0..iterations {
        let temp = 1.0 - (step as f64 / iterations as f64);
        let scale_r = (R_BOUNDS.hi - R_BOUNDS.lo) * 0.1 * temp;
        let scale_a = (A_BOUNDS.hi - A_BOUNDS.lo) * 0.1 * temp;
        let step_r = Normal::new(0.0, scale_r.max(1e-12)).unwrap().sample(&mut rng);
        let step_a = Normal::new(0.0, scale_a.max(1e-12)).unwrap().sample(&mut rng);
        let candidate = (clamp(current.0 + step_r, R_BOUNDS), clamp(current.1 + step_a, A_BOUNDS));
        let candidate_f = objective(candidate.0, candidate.1);
        let accept = candidate_f < current_f
            || rng.gen_range(0.0..1.0) < ((current_f - candidate_f) / temp.max(1e-12)).exp();
        if accept {
            current = candidate;
            current_f = candidate_f;
            if current_f < best_f {
                best = current;
                best_f = current_f;
            }
        }
    }
    (best.0, best.1, best_f)
}

/// Fit birth/death rates to a set of branching times via the two-step
/// optimizer: a bounded local search seeded from the Magallon-Sanderson
/// estimate, falling back to bounded simulated annealing if the local
/// search fails to find a finite optimum.
pub fn optim_bd(times: &[f64], rho: f64, root: bool, survival: bool, seed: u64) -> TactResult<BirthDeath> {
    if times.is_empty() {
        return Err(TactError::Numeric("cannot fit rates with zero branching times".into()));
    }
    let stem_age = times.iter().cloned().fold(f64::MIN, f64::max);
    let init_birth = magallon_sanderson_crown_rate((times.len() + 1) as f64, stem_age, rho).max(1e-6);
    let init = get_ra(init_birth, init_birth * 0.5);

    let objective = |r: f64, a: f64| {
        let bd = get_bd(r, a);
        lik_constant(times, rho, bd.birth, bd.death, root, survival)
    };

    let (mut r, mut a, mut fval) = nelder_mead_2d(&objective, init, 500);
    if !fval.is_finite() {
        let (r2, a2, f2) = simulated_annealing_2d(&objective, seed);
        r = r2;
        a = a2;
        fval = f2;
    }
    if !fval.is_finite() {
        return Err(TactError::Numeric("birth-death optimizer failed to converge".into()));
    }
    Ok(get_bd(r, a))
}

/// Bounded golden-section search over a scalar birth rate, used for the
/// Yule-process (`death = 0`) special case.
pub fn optim_yule(times: &[f64], rho: f64, root: bool, survival: bool) -> TactResult<BirthDeath> {
    if times.is_empty() {
        return Err(TactError::Numeric("cannot fit rates with zero branching times".into()));
    }
    let objective = |birth: f64| lik_yule(times, rho, birth, root, survival);

    let gold = (5.0_f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = (R_BOUNDS.lo, R_BOUNDS.hi);
    let mut c = hi - gold * (hi - lo);
    let mut d = lo + gold * (hi - lo);
    let mut fc = objective(c);
    let mut fd = objective(d);

    for _ in 0..200 {
        if (hi - lo).abs() < 1e-10 {
            break;
        }
        if fc < fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - gold * (hi - lo);
            fc = objective(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + gold * (hi - lo);
            fd = objective(d);
        }
    }
    let birth = (lo + hi) / 2.0;
    if !birth.is_finite() || birth <= 0.0 {
        return Err(TactError::Numeric("yule optimizer failed to converge".into()));
    }
    Ok(BirthDeath { birth, death: 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_bd_and_get_ra_roundtrip() {
        let bd = get_bd(0.3, 0.4);
        let (r, a) = get_ra(bd.birth, bd.death);
        assert!((r - 0.3).abs() < 1e-9);
        assert!((a - 0.4).abs() < 1e-9);
    }

    #[test]
    fn crown_capture_probability_singleton_is_zero() {
        assert_eq!(crown_capture_probability(1, 1).unwrap(), 0.0);
    }

    #[test]
    fn crown_capture_probability_rejects_k_greater_than_n() {
        assert!(crown_capture_probability(2, 3).is_err());
    }

    #[test]
    fn p1_and_p1_exact_agree_on_ordinary_inputs() {
        let direct = p1_raw(1.0, 0.3, 0.1, 0.5);
        let exact = p1_exact(1.0, 0.3, 0.1, 0.5).unwrap();
        assert!((direct - exact).abs() < 1e-6);
    }

    #[test]
    fn optim_yule_recovers_positive_birth_rate_with_zero_death() {
        let times = [4.0, 3.0, 2.5, 2.0, 1.0];
        let bd = optim_yule(&times, 1.0, true, true).unwrap();
        assert!(bd.birth > 0.0);
        assert_eq!(bd.death, 0.0);
    }

    #[test]
    fn optim_bd_gives_nonnegative_rates() {
        let times = [5.0, 4.2, 3.8, 3.0, 2.5, 2.0, 1.2];
        let bd = optim_bd(&times, 0.8, true, true, 42).unwrap();
        assert!(bd.birth >= 0.0);
        assert!(bd.death >= 0.0);
    }

    proptest::proptest! {
        #[test]
        fn get_bd_get_ra_roundtrip_over_bounded_r_a(
            r in 1e-6_f64..50.0,
            a in 0.0_f64..0.999,
        ) {
            let bd = get_bd(r, a);
            let (r2, a2) = get_ra(bd.birth, bd.death);
            proptest::prop_assert!((r - r2).abs() < 1e-6);
            proptest::prop_assert!((a - a2).abs() < 1e-6);
        }
    }
}
