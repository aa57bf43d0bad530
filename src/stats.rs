//! Small numeric kernels used by normalization and scaling. NaN values are
//! ignored by every function here.

pub fn finite_sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted
}

/// Linear-interpolated quantile of already sorted data, `q` in `[0, 1]`.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile_sorted(&finite_sorted(values), 0.5)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(finite.iter().sum::<f64>() / finite.len() as f64)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mean = mean(values)?;
    let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / finite.len() as f64;
    Some(variance.sqrt())
}

/// 1-based ranks with ties sharing their average rank. NaN positions get NaN.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).filter(|&i| !values[i].is_nan()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![f64::NAN; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for &position in &order[start..=end] {
            ranks[position] = rank;
        }
        start = end + 1;
    }
    ranks
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KsResult {
    pub statistic: f64,
    pub pvalue: f64,
}

/// Products `n * m` below this use the exact null distribution.
const KS_EXACT_LIMIT: usize = 10_000;

/// Two-sample Kolmogorov-Smirnov test. The p-value is exact for small samples
/// without ties and asymptotic otherwise.
pub fn ks_two_sample(a: &[f64], b: &[f64]) -> Option<KsResult> {
    let a = finite_sorted(a);
    let b = finite_sorted(b);
    if a.is_empty() || b.is_empty() {
        return None;
    }

    let (n, m) = (a.len(), b.len());
    let (mut i, mut j) = (0, 0);
    let mut statistic: f64 = 0.0;
    while i < n && j < m {
        let x = a[i].min(b[j]);
        while i < n && a[i] <= x {
            i += 1;
        }
        while j < m && b[j] <= x {
            j += 1;
        }
        let diff = (i as f64 / n as f64 - j as f64 / m as f64).abs();
        statistic = statistic.max(diff);
    }

    let pvalue = if n * m < KS_EXACT_LIMIT && !has_ties(&a, &b) {
        1.0 - smirnov_cdf(statistic, n, m)
    } else {
        let effective = ((n * m) as f64 / (n + m) as f64).sqrt();
        kolmogorov_survival(effective * statistic)
    };
    Some(KsResult {
        statistic,
        pvalue: pvalue.clamp(0.0, 1.0),
    })
}

fn has_ties(a: &[f64], b: &[f64]) -> bool {
    let mut pooled: Vec<f64> = a.iter().chain(b).copied().collect();
    pooled.sort_by(f64::total_cmp);
    pooled.windows(2).any(|pair| pair[0] == pair[1])
}

/// Exact `P(D < statistic)` under the null for sample sizes `n` and `m`,
/// counting lattice paths that stay inside the band.
fn smirnov_cdf(statistic: f64, n: usize, m: usize) -> f64 {
    let (small, large) = if n <= m { (n, m) } else { (m, n) };
    let (sd, ld) = (small as f64, large as f64);
    let q = (0.5 + (statistic * sd * ld - 1e-7).floor()) / (sd * ld);

    let mut u: Vec<f64> = (0..=large)
        .map(|j| if j as f64 / ld > q { 0.0 } else { 1.0 })
        .collect();
    for i in 1..=small {
        let w = i as f64 / (i + large) as f64;
        let x = i as f64 / sd;
        u[0] = if x > q { 0.0 } else { w * u[0] };
        for j in 1..=large {
            u[j] = if (x - j as f64 / ld).abs() > q {
                0.0
            } else {
                w * u[j] + u[j - 1]
            };
        }
    }
    u[large]
}

/// Survival function of the Kolmogorov distribution.
fn kolmogorov_survival(lambda: f64) -> f64 {
    if lambda < 1e-3 {
        return 1.0;
    }
    let mut sum = 0.0;
    let mut sign = 1.0;
    for k in 1..=100 {
        let k = k as f64;
        let term = sign * (-2.0 * k * k * lambda * lambda).exp();
        sum += term;
        if term.abs() < 1e-12 {
            break;
        }
        sign = -sign;
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_interpolate() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile_sorted(&sorted, 0.5), Some(2.5));
        assert_eq!(quantile_sorted(&sorted, 0.25), Some(1.75));
        assert_eq!(median(&[3.0, f64::NAN, 1.0, 2.0]), Some(2.0));
    }

    #[test]
    fn ranks_average_ties() {
        let ranks = average_ranks(&[10.0, 20.0, 10.0, f64::NAN]);
        assert_eq!(&ranks[..3], &[1.5, 3.0, 1.5]);
        assert!(ranks[3].is_nan());
    }

    #[test]
    fn ks_identical_samples() {
        let sample = [1.0, 2.0, 3.0, 4.0, 5.0];
        let result = ks_two_sample(&sample, &sample).unwrap();
        assert_eq!(result.statistic, 0.0);
        assert_eq!(result.pvalue, 1.0);
    }

    #[test]
    fn ks_disjoint_samples() {
        let a: Vec<f64> = (0..50).map(f64::from).collect();
        let b: Vec<f64> = (100..150).map(f64::from).collect();
        let result = ks_two_sample(&a, &b).unwrap();
        assert_eq!(result.statistic, 1.0);
        assert!(result.pvalue < 1e-6);
    }

    #[test]
    fn ks_small_samples_use_exact_distribution() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [3.5, 4.5, 5.5, 6.5, 7.5];
        let result = ks_two_sample(&a, &b).unwrap();
        assert!((result.statistic - 0.6).abs() < 1e-12);
        // 90 of the 252 orderings reach D >= 0.6.
        assert!((result.pvalue - 90.0 / 252.0).abs() < 1e-9, "{}", result.pvalue);

        let c = [1.0, 2.0, 3.0, 4.0, 5.0];
        let d = [2.5, 3.5, 4.5, 5.5, 6.5];
        let result = ks_two_sample(&c, &d).unwrap();
        assert!((result.statistic - 0.4).abs() < 1e-12);
        assert!((result.pvalue - 0.873).abs() < 5e-4, "{}", result.pvalue);
    }

    #[test]
    fn ks_ties_fall_back_to_asymptotic() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [3.0, 4.0, 5.0, 6.0, 7.0];
        let result = ks_two_sample(&a, &b).unwrap();
        let expected = kolmogorov_survival((2.5f64).sqrt() * result.statistic);
        assert_eq!(result.pvalue, expected);
    }
}
