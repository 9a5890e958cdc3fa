//! Model-agnostic interpretation: partial dependence (PD), individual conditional
//! expectation (ICE) curves and permutation importance.
//!
//! Everything here treats the model as a black box through [`Module::forward`], so models
//! should be switched to evaluation mode (`set_training(false)`) beforehand.

use std::cmp::Ordering;

use rand::{Rng, seq::SliceRandom, seq::index};
use thiserror::Error;

use crate::{
    loss::Loss,
    nn::{Module, NNError},
    values::Value,
};

/// Maximum number of k-means refinement rounds when clustering ICE curves
const KMEANS_MAX_ITER: usize = 50;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Row {row} has {got} values but the frame has {expected} columns")]
    RowWidthMismatch {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("Unknown feature '{0}'")]
    UnknownFeature(String),
    #[error("Cannot draw {requested} rows from a frame of {available}")]
    SampleTooLarge { requested: usize, available: usize },
    #[error("Expected {expected} weights or targets, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("Model has {n_outputs} outputs, cannot read output {output}")]
    OutputOutOfRange { output: usize, n_outputs: usize },
    #[error("Sampling failed: {0}")]
    Sampling(String),
    #[error(transparent)]
    Model(#[from] NNError),
}

/// Row major table of named `f32` features
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    columns: Vec<String>,
    rows: Vec<Vec<f32>>,
}

impl FeatureFrame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<f32>>) -> Result<Self, FrameError> {
        if let Some((row, r)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != columns.len())
        {
            return Err(FrameError::RowWidthMismatch {
                row,
                expected: columns.len(),
                got: r.len(),
            });
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, feature: &str) -> Result<usize, FrameError> {
        self.columns
            .iter()
            .position(|c| c == feature)
            .ok_or_else(|| FrameError::UnknownFeature(feature.to_string()))
    }

    pub fn column(&self, feature: &str) -> Result<Vec<f32>, FrameError> {
        let idx = self.column_index(feature)?;
        Ok(self.rows.iter().map(|r| r[idx]).collect())
    }

    /// Draws `n` distinct rows, uniformly or proportionally to `weights`
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n: usize,
        weights: Option<&[f32]>,
        rng: &mut R,
    ) -> Result<FeatureFrame, FrameError> {
        if n > self.n_rows() {
            return Err(FrameError::SampleTooLarge {
                requested: n,
                available: self.n_rows(),
            });
        }
        let picked = match weights {
            Some(w) => {
                if w.len() != self.n_rows() {
                    return Err(FrameError::LengthMismatch {
                        expected: self.n_rows(),
                        got: w.len(),
                    });
                }
                index::sample_weighted(rng, self.n_rows(), |i| w[i], n)
                    .map_err(|e| FrameError::Sampling(e.to_string()))?
            }
            None => index::sample(rng, self.n_rows(), n),
        };
        let rows = picked.into_iter().map(|i| self.rows[i].clone()).collect();
        Ok(FeatureFrame {
            columns: self.columns.clone(),
            rows,
        })
    }
}

/// Evaluates the model on a raw row and reads one of its outputs
pub fn predict(model: &dyn Module, row: &[f32], output: usize) -> Result<f32, FrameError> {
    let inputs = row.iter().map(|&v| Value::new(v)).collect::<Vec<_>>();
    let outputs = model.forward(&inputs)?;
    outputs
        .get(output)
        .map(|v| v.data())
        .ok_or(FrameError::OutputOutOfRange {
            output,
            n_outputs: outputs.len(),
        })
}

/// Percentile grid over a feature column.
///
/// Columns with at most `n_points` distinct values use the distinct values directly,
/// a single grid point is the median.
pub fn grid_values(column: &[f32], n_points: usize) -> Vec<f32> {
    let mut sorted = column
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .collect::<Vec<_>>();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    if sorted.is_empty() || n_points == 0 {
        return vec![];
    }
    let mut distinct = sorted.clone();
    distinct.dedup();
    if distinct.len() <= n_points {
        return distinct;
    }
    if n_points == 1 {
        return vec![percentile(&sorted, 50.0)];
    }
    let mut grid = (0..n_points)
        .map(|i| percentile(&sorted, 100.0 * i as f32 / (n_points - 1) as f32))
        .collect::<Vec<_>>();
    grid.dedup();
    grid
}

// linear interpolation between closest ranks, `sorted` must be non-empty
fn percentile(sorted: &[f32], q: f32) -> f32 {
    let pos = q / 100.0 * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Dependence of a model output on a single feature
#[derive(Debug, Clone)]
pub struct Isolate {
    pub feature: String,
    pub grid: Vec<f32>,
    /// One curve per frame row, evaluated at every grid value
    pub ice: Vec<Vec<f32>>,
    /// Mean of the ICE curves
    pub pdp: Vec<f32>,
}

pub fn pdp_isolate(
    model: &dyn Module,
    frame: &FeatureFrame,
    feature: &str,
    n_points: usize,
    output: usize,
) -> Result<Isolate, FrameError> {
    let idx = frame.column_index(feature)?;
    let grid = grid_values(&frame.column(feature)?, n_points);
    let mut ice = Vec::with_capacity(frame.n_rows());
    for row in frame.rows() {
        let mut row = row.clone();
        let curve = grid
            .iter()
            .map(|&g| {
                row[idx] = g;
                predict(model, &row, output)
            })
            .collect::<Result<Vec<_>, _>>()?;
        ice.push(curve);
    }
    let pdp = mean_curve(&ice, grid.len());
    log::debug!(
        "PD of '{}' over {} grid points and {} rows",
        feature,
        grid.len(),
        ice.len()
    );
    Ok(Isolate {
        feature: feature.to_string(),
        grid,
        ice,
        pdp,
    })
}

/// Joint dependence of a model output on two features
#[derive(Debug, Clone)]
pub struct Interact {
    pub features: (String, String),
    pub grid: (Vec<f32>, Vec<f32>),
    /// `pdp[i][j]` is the mean output at `(grid.0[i], grid.1[j])`
    pub pdp: Vec<Vec<f32>>,
}

pub fn pdp_interact(
    model: &dyn Module,
    frame: &FeatureFrame,
    features: (&str, &str),
    n_points: (usize, usize),
    output: usize,
) -> Result<Interact, FrameError> {
    let (ix, iy) = (
        frame.column_index(features.0)?,
        frame.column_index(features.1)?,
    );
    let gx = grid_values(&frame.column(features.0)?, n_points.0);
    let gy = grid_values(&frame.column(features.1)?, n_points.1);
    let n_rows = frame.n_rows().max(1) as f32;
    let mut pdp = vec![vec![0.0; gy.len()]; gx.len()];
    for row in frame.rows() {
        let mut row = row.clone();
        for (i, &x) in gx.iter().enumerate() {
            row[ix] = x;
            for (j, &y) in gy.iter().enumerate() {
                row[iy] = y;
                pdp[i][j] += predict(model, &row, output)? / n_rows;
            }
        }
    }
    Ok(Interact {
        features: (features.0.to_string(), features.1.to_string()),
        grid: (gx, gy),
        pdp,
    })
}

fn mean_curve(curves: &[Vec<f32>], len: usize) -> Vec<f32> {
    let n = curves.len().max(1) as f32;
    let mut mean = vec![0.0; len];
    for curve in curves {
        for (m, v) in mean.iter_mut().zip(curve) {
            *m += v / n;
        }
    }
    mean
}

fn sq_dist(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest_dist(curve: &[f32], centres: &[Vec<f32>]) -> f32 {
    centres
        .iter()
        .map(|c| sq_dist(curve, c))
        .fold(f32::INFINITY, f32::min)
}

/// Groups ICE curves with k-means and returns the cluster centres.
/// With `k` at least the number of curves the curves are returned as is.
pub fn cluster_curves<R: Rng + ?Sized>(
    curves: &[Vec<f32>],
    k: usize,
    rng: &mut R,
) -> Vec<Vec<f32>> {
    if k == 0 || curves.is_empty() {
        return vec![];
    }
    if k >= curves.len() {
        return curves.to_vec();
    }
    // random first centre, then farthest point seeding
    let mut centres = vec![curves[rng.random_range(0..curves.len())].clone()];
    while centres.len() < k {
        let farthest = curves
            .iter()
            .max_by(|a, b| {
                let da = nearest_dist(a, &centres);
                let db = nearest_dist(b, &centres);
                da.partial_cmp(&db).unwrap_or(Ordering::Equal)
            })
            .cloned()
            .unwrap_or_default();
        centres.push(farthest);
    }
    let mut assignment = vec![usize::MAX; curves.len()];
    for iter in 0..KMEANS_MAX_ITER {
        let mut changed = false;
        for (curve, assigned) in curves.iter().zip(assignment.iter_mut()) {
            let nearest = centres
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    sq_dist(curve, a)
                        .partial_cmp(&sq_dist(curve, b))
                        .unwrap_or(Ordering::Equal)
                })
                .map(|(i, _)| i)
                .unwrap_or(0);
            if *assigned != nearest {
                *assigned = nearest;
                changed = true;
            }
        }
        if !changed {
            log::debug!("k-means converged after {} iterations", iter);
            break;
        }
        for (c, centre) in centres.iter_mut().enumerate() {
            let members = curves
                .iter()
                .zip(&assignment)
                .filter(|(_, a)| **a == c)
                .map(|(curve, _)| curve.clone())
                .collect::<Vec<_>>();
            // empty clusters keep their previous centre
            if !members.is_empty() {
                *centre = mean_curve(&members, centre.len());
            }
        }
    }
    centres
}

/// Importance of one feature, the increase in loss when its column is shuffled
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f32,
    /// Standard error over the permutation repeats, if there was more than one
    pub uncertainty: Option<f32>,
}

fn mean_loss(
    model: &dyn Module,
    rows: &[Vec<f32>],
    targets: &[Vec<f32>],
    loss: Loss,
) -> Result<f32, FrameError> {
    let mut total = 0.0;
    for (row, target) in rows.iter().zip(targets) {
        let inputs = row.iter().map(|&v| Value::new(v)).collect::<Vec<_>>();
        let target = target.iter().map(|&v| Value::new(v)).collect::<Vec<_>>();
        let outputs = model.forward(&inputs)?;
        total += loss.call(&outputs, &target).data();
    }
    Ok(total / rows.len().max(1) as f32)
}

/// Permutation importance of every column, sorted from most to least important
pub fn permutation_importance<R: Rng + ?Sized>(
    model: &dyn Module,
    frame: &FeatureFrame,
    targets: &[Vec<f32>],
    loss: Loss,
    n_repeats: usize,
    rng: &mut R,
) -> Result<Vec<FeatureImportance>, FrameError> {
    if targets.len() != frame.n_rows() {
        return Err(FrameError::LengthMismatch {
            expected: frame.n_rows(),
            got: targets.len(),
        });
    }
    let n_repeats = n_repeats.max(1);
    let baseline = mean_loss(model, frame.rows(), targets, loss)?;
    log::debug!("Baseline {} loss: {}", loss, baseline);

    let mut importances = Vec::with_capacity(frame.columns().len());
    for (idx, feature) in frame.columns().iter().enumerate() {
        let mut deltas = Vec::with_capacity(n_repeats);
        for _ in 0..n_repeats {
            let mut column = frame.rows().iter().map(|r| r[idx]).collect::<Vec<_>>();
            column.shuffle(rng);
            let permuted = frame
                .rows()
                .iter()
                .zip(column)
                .map(|(r, v)| {
                    let mut r = r.clone();
                    r[idx] = v;
                    r
                })
                .collect::<Vec<_>>();
            deltas.push(mean_loss(model, &permuted, targets, loss)? - baseline);
        }
        let n = deltas.len() as f32;
        let mean = deltas.iter().sum::<f32>() / n;
        let uncertainty = (deltas.len() > 1).then(|| {
            let var = deltas.iter().map(|d| (d - mean).powi(2)).sum::<f32>() / (n - 1.0);
            (var / n).sqrt()
        });
        importances.push(FeatureImportance {
            feature: feature.clone(),
            importance: mean,
            uncertainty,
        });
    }
    importances.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(Ordering::Equal)
    });
    Ok(importances)
}
