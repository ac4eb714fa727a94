/// Ceiling sentinel for e-values; also bounds the score histogram.
pub const MAX_HYPERSCORE: f64 = 100.0;

/// Hyperscores are bucketed as `round(h * 10)`.
pub const HISTOGRAM_SIZE: usize = 1 + MAX_HYPERSCORE as usize * 10;

/// Survival samples staged per spectrum for the cross-node exchange.
pub const SURVIVAL_SAMPLES: usize = 128;

/// Bucket index for a hyperscore, clamped into the histogram.
#[inline]
pub fn bucket(hyperscore: f64) -> usize {
    ((hyperscore * 10.0 + 0.5) as usize).min(HISTOGRAM_SIZE - 1)
}

/// Per-thread scratch for modeling the left tail of the log-survival
/// function of a spectrum's hyperscore distribution. Reused across
/// spectra to avoid reallocating the intermediate series.
pub struct TailFit {
    sx: Vec<f64>,
}

impl TailFit {
    pub fn new() -> Self {
        TailFit { sx: Vec::new() }
    }

    /// Expected number of random PSMs scoring at least as well as the top
    /// hit: `N * 10^(mu * hyp + beta)` from an OLS fit over the survival
    /// tail. `hyp` is the scaled top hyperscore; `n` is the candidate
    /// count. Returns the [`MAX_HYPERSCORE`] sentinel when there are too
    /// few candidates to model.
    pub fn expect(&mut self, survival: &[u32], n: u32, hyp: usize, min_cpsm: u32) -> f64 {
        if n < min_cpsm {
            return MAX_HYPERSCORE;
        }
        let (mu, beta) = self.model(survival, n, hyp);
        let lgs_x = mu * hyp as f64 + beta;
        n as f64 * 10f64.powf(lgs_x)
    }

    /// Fit `log10 s(x)` to a line over the 22-87% descent of the survival
    /// function, returning `(mu, beta)`.
    #[cfg(not(feature = "gumbelfit"))]
    fn model(&mut self, survival: &[u32], n: u32, hyp: usize) -> (f64, f64) {
        let hyp = hyp.min(survival.len() - 1);

        // Bracket the populated part of the histogram left of the top hit
        let mut end = 0;
        for i in (0..hyp).rev() {
            if survival[i] >= 1 {
                end = i;
                break;
            }
        }
        let mut stt = end;
        for (i, &v) in survival.iter().enumerate().take(end + 1) {
            if v >= 1 {
                stt = i;
                break;
            }
        }
        if stt == end {
            end = (end + 1).min(survival.len() - 1);
        }

        // Survival function: 1 - cdf, then log10
        let len = end - stt + 1;
        self.sx.clear();
        let mut cum = 0u64;
        for &v in &survival[stt..=end] {
            cum += v as u64;
            let mut s = 1.0 - cum as f64 / n as f64;
            if s > 1.0 {
                s = 0.999;
            }
            self.sx.push(s);
        }
        let replacement = self
            .sx
            .iter()
            .rev()
            .copied()
            .find(|&s| s >= 1e-4)
            .unwrap_or(1e-4);
        for s in self.sx.iter_mut() {
            if *s <= 0.0 {
                *s = replacement;
            }
            *s = s.log10();
        }

        // Regression markers at 22% and 87% of the total descent
        let hgt = self.sx[len - 1] - self.sx[0];
        let t1 = self.sx[0] + 0.22 * hgt;
        let t2 = self.sx[0] + 0.87 * hgt;

        let crossing = self
            .sx
            .iter()
            .position(|&s| s <= t1)
            .unwrap_or(len) as isize;
        let mut mark = (crossing - 1).max(0);
        let mut mark2 = self
            .sx
            .iter()
            .rposition(|&s| s >= t2)
            .unwrap_or(0)
            .min(len - 1) as isize;
        if mark >= mark2 {
            mark = mark2 - 1;
        }
        if len == 3 {
            mark2 = len as isize - 1;
        }
        if len < 3 {
            mark = 0;
            mark2 = len as isize - 1;
        }
        let mark = mark.max(0) as usize;
        let mark2 = mark2.max(0) as usize;

        let ys = &self.sx[mark..=mark2];
        ols_indexed(stt + mark, ys)
    }

    /// Gumbel extreme-value model of the score distribution; location and
    /// scale from the histogram moments.
    #[cfg(feature = "gumbelfit")]
    fn model(&mut self, survival: &[u32], n: u32, hyp: usize) -> (f64, f64) {
        const EULER_GAMMA: f64 = 0.5772156649015329;
        self.sx.clear();

        let total: f64 = survival.iter().map(|&v| v as f64).sum();
        if total <= 0.0 {
            return (0.0, 0.0);
        }
        let mean: f64 = survival
            .iter()
            .enumerate()
            .map(|(i, &v)| i as f64 * v as f64)
            .sum::<f64>()
            / total;
        let var: f64 = survival
            .iter()
            .enumerate()
            .map(|(i, &v)| (i as f64 - mean).powi(2) * v as f64)
            .sum::<f64>()
            / total;

        let scale = (6.0 * var).sqrt() / std::f64::consts::PI;
        if scale <= 0.0 {
            return (0.0, 0.0);
        }
        let location = mean - EULER_GAMMA * scale;

        // Express the Gumbel survival at `hyp` as the equivalent
        // log10 s(x) intercept so the caller's 10^(mu*x + beta) holds.
        let z = (hyp as f64 - location) / scale;
        let s = 1.0 - (-(-z).exp()).exp();
        let _ = n;
        (0.0, s.max(1e-300).log10())
    }
}

impl Default for TailFit {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordinary least squares of `ys` against consecutive integer abscissae
/// starting at `x0`. A single point yields a flat line through it.
fn ols_indexed(x0: usize, ys: &[f64]) -> (f64, f64) {
    if ys.len() < 2 {
        return (0.0, ys.first().copied().unwrap_or(0.0));
    }

    let n = ys.len() as f64;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for (i, &y) in ys.iter().enumerate() {
        let x = (x0 + i) as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denom = n * sum_xx - sum_x * sum_x;
    if denom == 0.0 {
        return (0.0, sum_y / n);
    }
    let mu = (n * sum_xy - sum_x * sum_y) / denom;
    let beta = (sum_y - mu * sum_x) / n;
    (mu, beta)
}
