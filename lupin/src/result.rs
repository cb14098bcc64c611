//! Held-out evaluation: per-iteration RMSE (instantaneous and running
//! average over post-burn-in samples) and optional AUC for binary
//! tasks.

use crate::model::Model;

/// One held-out observation with its prediction state.
#[derive(Debug, Clone)]
pub struct TestItem {
    pub row: usize,
    pub col: usize,
    pub val: f64,
    pub pred: f64,
    pub pred_avg: f64,
}

pub struct TestResult {
    pub items: Vec<TestItem>,
    pub rmse: f64,
    pub rmse_avg: f64,
    pub auc: f64,
    pub sample_iter: usize,
    threshold: Option<f64>,
}

impl TestResult {
    /// * `test` - held-out `(row, col, value)` entries
    /// * `threshold` - decision threshold enabling AUC
    pub fn new(test: Vec<(usize, usize, f64)>, threshold: Option<f64>) -> Self {
        let items = test
            .into_iter()
            .map(|(row, col, val)| TestItem {
                row,
                col,
                val,
                pred: f64::NAN,
                pred_avg: f64::NAN,
            })
            .collect();

        TestResult {
            items,
            rmse: f64::NAN,
            rmse_avg: f64::NAN,
            auc: f64::NAN,
            sample_iter: 0,
            threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Refresh predictions from the current sample. Burn-in samples
    /// update the instantaneous RMSE only; post-burn-in samples also
    /// fold into the running average.
    pub fn update(&mut self, model: &Model, mean_value: f64, burnin_done: bool) {
        if self.items.is_empty() {
            return;
        }

        if burnin_done {
            self.sample_iter += 1;
        }
        let nn = self.sample_iter as f64;

        let mut se = 0.0;
        let mut se_avg = 0.0;
        for item in self.items.iter_mut() {
            item.pred = model.predict(&[item.row, item.col]) + mean_value;

            if burnin_done {
                item.pred_avg = if self.sample_iter == 1 {
                    item.pred
                } else {
                    ((nn - 1.0) * item.pred_avg + item.pred) / nn
                };
                let res_avg = item.val - item.pred_avg;
                se_avg += res_avg * res_avg;
            }

            let res = item.val - item.pred;
            se += res * res;
        }

        let count = self.items.len() as f64;
        self.rmse = (se / count).sqrt();
        if burnin_done {
            self.rmse_avg = (se_avg / count).sqrt();
        }

        if self.threshold.is_some() {
            self.update_auc();
        }
    }

    /// Rank statistic over the running-average predictions (the
    /// instantaneous ones before any retained sample exists).
    fn update_auc(&mut self) {
        let threshold = match self.threshold {
            Some(tt) => tt,
            None => return,
        };

        let mut scored: Vec<(f64, bool)> = self
            .items
            .iter()
            .map(|item| {
                let score = if self.sample_iter > 0 {
                    item.pred_avg
                } else {
                    item.pred
                };
                (score, item.val > threshold)
            })
            .collect();

        let total_pos = scored.iter().filter(|(_, pos)| *pos).count();
        let total_neg = scored.len() - total_pos;
        if total_pos == 0 || total_neg == 0 {
            self.auc = f64::NAN;
            return;
        }

        scored.sort_by(|aa, bb| aa.0.partial_cmp(&bb.0).unwrap_or(std::cmp::Ordering::Equal));

        // rank-sum of the positives (ties get averaged ranks)
        let mut rank_sum = 0.0;
        let mut ii = 0;
        while ii < scored.len() {
            let mut jj = ii;
            while jj + 1 < scored.len() && scored[jj + 1].0 == scored[ii].0 {
                jj += 1;
            }
            let avg_rank = (ii + jj) as f64 / 2.0 + 1.0;
            for entry in scored.iter().take(jj + 1).skip(ii) {
                if entry.1 {
                    rank_sum += avg_rank;
                }
            }
            ii = jj + 1;
        }

        let np = total_pos as f64;
        let nn = total_neg as f64;
        self.auc = (rank_sum - np * (np + 1.0) / 2.0) / (np * nn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelInit;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn running_average_converges_on_repeated_samples() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(5);
        let model = Model::init(3, &[4, 4], ModelInit::Random, &mut rng)?;

        let truth = model.predict(&[1, 2]);
        let mut result = TestResult::new(vec![(1, 2, truth)], None);

        for _ in 0..10 {
            result.update(&model, 0.0, true);
        }

        // the model never changes, so both errors are zero
        approx::assert_abs_diff_eq!(result.rmse, 0.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(result.rmse_avg, 0.0, epsilon = 1e-12);
        assert_eq!(result.sample_iter, 10);
        Ok(())
    }

    #[test]
    fn burnin_never_touches_the_running_average() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(6);
        let model = Model::init(3, &[4, 4], ModelInit::Random, &mut rng)?;

        let mut result = TestResult::new(vec![(0, 0, 1.0)], None);
        result.update(&model, 0.0, false);

        assert!(result.rmse.is_finite());
        assert!(result.rmse_avg.is_nan());
        assert_eq!(result.sample_iter, 0);
        Ok(())
    }

    #[test]
    fn auc_ranks_a_perfect_separation_at_one() {
        let mut result = TestResult::new(
            vec![(0, 0, 1.0), (0, 1, 1.0), (1, 0, 0.0), (1, 1, 0.0)],
            Some(0.5),
        );

        // hand-crafted predictions: positives strictly above negatives
        for (item, pred) in result.items.iter_mut().zip([0.9, 0.8, 0.2, 0.1]) {
            item.pred = pred;
        }
        result.update_auc();
        approx::assert_abs_diff_eq!(result.auc, 1.0, epsilon = 1e-12);

        // flip one pair: 3 of 4 concordant pairs remain
        for (item, pred) in result.items.iter_mut().zip([0.9, 0.15, 0.2, 0.1]) {
            item.pred = pred;
        }
        result.update_auc();
        approx::assert_abs_diff_eq!(result.auc, 0.75, epsilon = 1e-12);
    }
}
