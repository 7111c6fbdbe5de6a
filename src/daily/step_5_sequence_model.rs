// External imports
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

// Internal imports
use super::step_4_recurrent_cell::{CellKind, RecurrentLayer};

/// Two stacked recurrent layers, each followed by dropout, and a dense head
///
/// The head emits one value per output step: 1 for single-step models, H for
/// multi-step models.
#[derive(Module, Debug)]
pub struct SequenceModel<B: Backend> {
    // Model hyperparameters
    input_size: usize,
    hidden_size: usize,
    output_size: usize,

    // Model layers
    layer_1: RecurrentLayer<B>,
    dropout_1: Dropout,
    layer_2: RecurrentLayer<B>,
    dropout_2: Dropout,
    output_layer: Linear<B>,
}

impl<B: Backend> SequenceModel<B> {
    /// Forward pass through the model
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape [batch_size, sequence_length, input_size]
    /// * `is_training` - Whether the model is in training mode (affects dropout)
    ///
    /// # Returns
    ///
    /// Returns the output tensor of shape [batch_size, output_size]
    pub fn forward(&self, x: Tensor<B, 3>, is_training: bool) -> Tensor<B, 2> {
        let [batch_size, sequence_length, _] = x.dims();

        let out_1 = self.layer_1.forward(x);
        let out_1 = if is_training {
            self.dropout_1.forward(out_1)
        } else {
            out_1
        };

        let out_2 = self.layer_2.forward(out_1);
        // Only the last step of the second layer feeds the head
        let last = out_2
            .narrow(1, sequence_length - 1, 1)
            .reshape([batch_size, self.hidden_size]);
        let last = if is_training {
            self.dropout_2.forward(last)
        } else {
            last
        };

        self.output_layer.forward(last)
    }

    /// Inference forward pass (dropout disabled)
    pub fn predict(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        self.forward(x, false)
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }
}

/// Configuration for the [`SequenceModel`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceModelConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub output_size: usize,
    pub dropout: f64,
    pub cell: CellKind,
    /// Read the sequence in both directions in the first layer
    pub bidirectional: bool,
}

impl SequenceModelConfig {
    /// GRU models default to a bidirectional first layer, LSTM models do not
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        output_size: usize,
        dropout: f64,
        cell: CellKind,
    ) -> Self {
        Self {
            input_size,
            hidden_size,
            output_size,
            dropout,
            cell,
            bidirectional: cell == CellKind::Gru,
        }
    }

    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    /// Initialize a model from this configuration
    pub fn init<B: Backend>(&self, device: &B::Device) -> SequenceModel<B> {
        let layer_1 = RecurrentLayer::new(
            self.cell,
            self.input_size,
            self.hidden_size,
            self.bidirectional,
            device,
        );
        let layer_2 = RecurrentLayer::new(
            self.cell,
            layer_1.output_size(),
            self.hidden_size,
            false,
            device,
        );

        SequenceModel {
            input_size: self.input_size,
            hidden_size: self.hidden_size,
            output_size: self.output_size,
            layer_1,
            dropout_1: DropoutConfig::new(self.dropout).init(),
            layer_2,
            dropout_2: DropoutConfig::new(self.dropout).init(),
            output_layer: LinearConfig::new(self.hidden_size, self.output_size).init(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_shapes() {
        let device = NdArrayDevice::default();
        let x = Tensor::<TestBackend, 3>::ones([3, 10, 6], &device);

        let multi = SequenceModelConfig::new(6, 12, 5, 0.2, CellKind::Gru).init::<TestBackend>(&device);
        assert_eq!(multi.forward(x.clone(), true).dims(), [3, 5]);
        assert_eq!(multi.predict(x.clone()).dims(), [3, 5]);

        let single = SequenceModelConfig::new(6, 12, 1, 0.2, CellKind::Lstm).init::<TestBackend>(&device);
        assert_eq!(single.predict(x).dims(), [3, 1]);
        assert_eq!(single.input_size(), 6);
    }

    #[test]
    fn test_inference_is_deterministic() {
        let device = NdArrayDevice::default();
        let model = SequenceModelConfig::new(4, 8, 2, 0.5, CellKind::Gru).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 3>::ones([1, 6, 4], &device);

        let a = model.predict(x.clone()).into_data().convert::<f32>().to_vec::<f32>().unwrap();
        let b = model.predict(x).into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_default_bidirectional_by_cell() {
        assert!(SequenceModelConfig::new(4, 8, 1, 0.1, CellKind::Gru).bidirectional);
        assert!(!SequenceModelConfig::new(4, 8, 1, 0.1, CellKind::Lstm).bidirectional);
    }
}
