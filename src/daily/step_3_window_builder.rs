// External crates
use burn::tensor::{backend::Backend, Tensor, TensorData};
use serde::{Deserialize, Serialize};

// Internal modules
use crate::daily::step_1_indicator_engine::FeatureTable;
use crate::error::{ForecastError, Result};

/// What the model is trained to emit for each window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "horizon")]
pub enum OutputMode {
    /// Next close only; longer forecasts are produced recursively
    SingleStep,
    /// The next `H` closes in one pass
    MultiStep(usize),
}

impl OutputMode {
    pub fn output_size(&self) -> usize {
        match self {
            OutputMode::SingleStep => 1,
            OutputMode::MultiStep(horizon) => *horizon,
        }
    }
}

/// Supervised (window, target) pairs stored flat, ready for tensor conversion
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSet {
    inputs: Vec<f32>,
    targets: Vec<f32>,
    sequence_length: usize,
    num_features: usize,
    output_size: usize,
}

impl WindowSet {
    pub fn len(&self) -> usize {
        if self.sequence_length == 0 || self.num_features == 0 {
            return 0;
        }
        self.inputs.len() / (self.sequence_length * self.num_features)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Target row of window `index`
    pub fn target(&self, index: usize) -> &[f32] {
        &self.targets[index * self.output_size..(index + 1) * self.output_size]
    }

    /// Chronological cut at `floor(len * (1 - validation_split))`
    ///
    /// The validation part is always the most recent segment.
    pub fn split(&self, validation_split: f64) -> (WindowSet, WindowSet) {
        let cut = ((self.len() as f64) * (1.0 - validation_split)).floor() as usize;
        let cut = cut.min(self.len());
        (self.select_range(0, cut), self.select_range(cut, self.len()))
    }

    fn select_range(&self, start: usize, end: usize) -> WindowSet {
        let in_stride = self.sequence_length * self.num_features;
        WindowSet {
            inputs: self.inputs[start * in_stride..end * in_stride].to_vec(),
            targets: self.targets[start * self.output_size..end * self.output_size].to_vec(),
            sequence_length: self.sequence_length,
            num_features: self.num_features,
            output_size: self.output_size,
        }
    }

    /// Gather the windows at `indices` into a batch of tensors
    ///
    /// # Returns
    ///
    /// Inputs of shape `[batch, sequence_length, num_features]` and targets of
    /// shape `[batch, output_size]`
    pub fn batch<B: Backend>(
        &self,
        indices: &[usize],
        device: &B::Device,
    ) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let in_stride = self.sequence_length * self.num_features;
        let mut inputs = Vec::with_capacity(indices.len() * in_stride);
        let mut targets = Vec::with_capacity(indices.len() * self.output_size);
        for &i in indices {
            inputs.extend_from_slice(&self.inputs[i * in_stride..(i + 1) * in_stride]);
            targets.extend_from_slice(self.target(i));
        }

        let input_data = TensorData::new(
            inputs,
            [indices.len(), self.sequence_length, self.num_features],
        );
        let target_data = TensorData::new(targets, [indices.len(), self.output_size]);

        (
            Tensor::<B, 3>::from_data(input_data, device),
            Tensor::<B, 2>::from_data(target_data, device),
        )
    }

    /// All windows in order
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 3>, Tensor<B, 2>) {
        let indices: Vec<usize> = (0..self.len()).collect();
        self.batch(&indices, device)
    }
}

/// Slice a scaled feature table into supervised windows
///
/// # Arguments
///
/// * `table` - Scaled feature table of length T
/// * `sequence_length` - Rows per input window (L)
/// * `mode` - Single-step target (next close) or multi-step (next H closes)
///
/// # Returns
///
/// `T - L` windows for single-step, `T - L - H + 1` for multi-step.
/// Zero or fewer windows is an `InsufficientData` error.
pub fn build_windows(
    table: &FeatureTable,
    sequence_length: usize,
    mode: OutputMode,
) -> Result<WindowSet> {
    if sequence_length == 0 {
        return Err(ForecastError::invalid_parameter(
            "seq_len",
            "sequence length must be positive",
        ));
    }
    let horizon = mode.output_size();
    if horizon == 0 {
        return Err(ForecastError::invalid_parameter(
            "prediction_horizon",
            "prediction horizon must be positive",
        ));
    }

    let rows = table.len();
    let count = rows as i64 - sequence_length as i64 - horizon as i64 + 1;
    if count <= 0 {
        return Err(ForecastError::InsufficientData(format!(
            "{} rows cannot fill a window of {} with {} target step(s)",
            rows, sequence_length, horizon
        )));
    }
    let count = count as usize;

    let values = table.values();
    let num_features = table.num_features();
    let close_index = table.close_index();

    let mut inputs = Vec::with_capacity(count * sequence_length * num_features);
    let mut targets = Vec::with_capacity(count * horizon);
    for i in sequence_length..sequence_length + count {
        for row in i - sequence_length..i {
            inputs.extend(values.row(row).iter().map(|v| *v as f32));
        }
        for row in i..i + horizon {
            targets.push(values[[row, close_index]] as f32);
        }
    }

    Ok(WindowSet {
        inputs,
        targets,
        sequence_length,
        num_features,
        output_size: horizon,
    })
}
