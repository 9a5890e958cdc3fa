//! Data loader

use std::collections::HashSet;

use rand::{Rng, seq::SliceRandom};
use thiserror::Error;

use crate::values::Value;

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error(
        "All input vectors must have the same dimension. Received different sizes: {input_dims:?}"
    )]
    InputDimensionMismatch { input_dims: HashSet<usize> },
    #[error("Targets must have the same length as the data")]
    TargetLengthMismatch { target_len: usize, data_len: usize },
    #[error("Batch size must be positive")]
    EmptyBatch,
}

/// A mini batch of inputs and their targets
pub type Batch = (Vec<Vec<Value>>, Vec<Vec<Value>>);

/// Data loader, returns batches of data and targets optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    data: Vec<Vec<Value>>,
    // encoded targets, e.g. one hot classes
    targets: Vec<Vec<Value>>,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    pub fn new(
        data: &[Vec<f32>],
        targets: &[Vec<f32>],
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::EmptyBatch);
        }
        if data.len() != targets.len() {
            return Err(DataLoaderError::TargetLengthMismatch {
                target_len: targets.len(),
                data_len: data.len(),
            });
        }
        let input_dims = data.iter().map(|d| d.len()).collect::<HashSet<_>>();
        if input_dims.len() > 1 {
            return Err(DataLoaderError::InputDimensionMismatch { input_dims });
        }
        let to_values = |rows: &[Vec<f32>]| -> Vec<Vec<Value>> {
            rows.iter()
                .map(|r| r.iter().map(|v| Value::new(*v)).collect())
                .collect()
        };
        Ok(Self {
            data: to_values(data),
            targets: to_values(targets),
            batch_size,
            shuffle,
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates with a caller provided random generator, for reproducible shuffling
    pub fn iter_with<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        DataLoaderIterator {
            data: &self.data,
            targets: &self.targets,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }

    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with(&mut rand::rng())
    }
}

/// An iterator which returns mini batches of data and targets until the end of the dataset,
/// the last batch holds the remainder
pub struct DataLoaderIterator<'a> {
    data: &'a [Vec<Value>],
    targets: &'a [Vec<Value>],
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.data.len() {
            return None;
        }
        let end = (self.curr_iter + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.curr_iter..end];
        let batch_data = batch_indices
            .iter()
            .map(|&i| self.data[i].clone())
            .collect::<Vec<_>>();
        let batch_targets = batch_indices
            .iter()
            .map(|&i| self.targets[i].clone())
            .collect::<Vec<_>>();
        self.curr_iter = end;
        Some((batch_data, batch_targets))
    }
}
