//! Missing-speciation-time sampler.
//!
//! Draws `missing` new branching times on the interval `(tyoung, told)`
//! conditioned on an existing set of branching times `ages`, following the
//! inverse-CDF construction of Cusimano, Stadler & Renner (2012).

use crate::errors::{TactError, TactResult};
use crate::numerics::intp1;

/// Draw `missing` new branching times given existing branching times
/// `ages` (descending, all within `(tyoung, told)`), under a birth-death
/// process with the given rates. `told` defaults to `max(ages)` and
/// `tyoung` to `0.0` when not supplied, matching the original's handling
/// of a clade's stem age and minimum graftable age.
pub fn get_new_times(
    ages: &[f64],
    birth: f64,
    death: f64,
    missing: usize,
    told: Option<f64>,
    tyoung: Option<f64>,
    rng: &mut impl rand::Rng,
) -> TactResult<Vec<f64>> {
    if missing == 0 {
        return Ok(Vec::new());
    }
    let told = told.unwrap_or_else(|| ages.iter().cloned().fold(f64::MIN, f64::max));
    let tyoung = tyoung.unwrap_or(0.0);

    if let Some(&oldest) = ages.iter().max_by(|a, b| a.partial_cmp(b).unwrap()) {
        if oldest > told + 1e-9 {
            return Err(TactError::Invariant(format!(
                "branching time {oldest} exceeds told {told}"
            )));
        }
    }

    let mut result: Vec<f64> = Vec::with_capacity(missing);
    let mut times: Vec<f64> = std::iter::once(told)
        .chain(ages.iter().cloned().filter(|&a| a > tyoung && a < told))
        .chain(std::iter::once(tyoung))
        .collect();
    times.sort_by(|a, b| b.partial_cmp(a).unwrap());

    for _ in 0..missing {
        let addrank = if times.len() > 2 {
            let ranks: Vec<usize> = (0..times.len() - 1).collect();
            let mut distrranks: Vec<f64> = ranks
                .iter()
                .map(|&i| {
                    let rank = (i + 1) as f64;
                    rank * (intp1(times[i], birth, death) - intp1(times[i + 1], birth, death))
                })
                .collect();
            let total: f64 = distrranks.iter().sum();
            if total <= 0.0 || !total.is_finite() {
                0
            } else {
                let mut cumulative = 0.0;
                for v in distrranks.iter_mut() {
                    cumulative += *v / total;
                    *v = cumulative;
                }
                let r: f64 = rng.gen_range(0.0..1.0);
                distrranks.iter().position(|&cdf| cdf > r).unwrap_or(0)
            }
        } else {
            0
        };

        let const_term = intp1(times[addrank], birth, death) - intp1(times[addrank + 1], birth, death);
        let temp = if const_term == 0.0 {
            0.0
        } else {
            intp1(times[addrank + 1], birth, death) / const_term
        };

        let r: f64 = rng.gen_range(0.0..1.0);
        let numerator = 1.0 - (r + temp) * const_term * birth;
        let denominator = 1.0 - (r + temp) * const_term * death;
        let xnew = 1.0 / (death - birth) * (numerator / denominator).ln();

        result.push(xnew);
        times.push(xnew);
        times.sort_by(|a, b| b.partial_cmp(a).unwrap());
    }

    result.sort_by(|a, b| b.partial_cmp(a).unwrap());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn draws_requested_count_of_times() {
        let mut rng = rand_pcg::Pcg64::seed_from_u64(1);
        let ages = [3.0, 2.0];
        let times = get_new_times(&ages, 0.5, 0.1, 4, Some(4.0), Some(0.0), &mut rng).unwrap();
        assert_eq!(times.len(), 4);
    }

    #[test]
    fn zero_missing_returns_empty() {
        let mut rng = rand_pcg::Pcg64::seed_from_u64(1);
        let times = get_new_times(&[1.0], 0.5, 0.1, 0, Some(2.0), Some(0.0), &mut rng).unwrap();
        assert!(times.is_empty());
    }

    #[test]
    fn rejects_ages_older_than_told() {
        let mut rng = rand_pcg::Pcg64::seed_from_u64(1);
        let result = get_new_times(&[5.0], 0.5, 0.1, 1, Some(1.0), Some(0.0), &mut rng);
        assert!(result.is_err());
    }
}
