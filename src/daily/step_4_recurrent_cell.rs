// External imports
use std::fmt;
use std::str::FromStr;

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::{activation, backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

// Internal imports
use crate::error::ForecastError;

/// Recurrent cell family used by the sequence model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    #[default]
    Gru,
    Lstm,
}

impl FromStr for CellKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gru" => Ok(CellKind::Gru),
            "lstm" => Ok(CellKind::Lstm),
            other => Err(ForecastError::invalid_parameter(
                "cell",
                format!("unknown recurrent cell '{}', expected 'gru' or 'lstm'", other),
            )),
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellKind::Gru => write!(f, "gru"),
            CellKind::Lstm => write!(f, "lstm"),
        }
    }
}

/// GRU cell; the update and reset gates share one input projection
#[derive(Module, Debug)]
pub struct GruCell<B: Backend> {
    hidden_size: usize,
    // input -> [update | reset | candidate]
    input_gates: Linear<B>,
    // hidden -> [update | reset]
    hidden_gates: Linear<B>,
    candidate_hidden: Linear<B>,
}

impl<B: Backend> GruCell<B> {
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            hidden_size,
            input_gates: LinearConfig::new(input_size, 3 * hidden_size).init(device),
            hidden_gates: LinearConfig::new(hidden_size, 2 * hidden_size).init(device),
            candidate_hidden: LinearConfig::new(hidden_size, hidden_size).init(device),
        }
    }

    /// One time step: `x_t` is [batch, input], `h` is [batch, hidden]
    pub fn step(&self, x_t: Tensor<B, 2>, h: Tensor<B, 2>) -> Tensor<B, 2> {
        let hs = self.hidden_size;
        let xg = self.input_gates.forward(x_t);
        let hg = self.hidden_gates.forward(h.clone());

        let z_t = activation::sigmoid(xg.clone().narrow(1, 0, hs) + hg.clone().narrow(1, 0, hs));
        let r_t = activation::sigmoid(xg.clone().narrow(1, hs, hs) + hg.narrow(1, hs, hs));
        let h_tilde = activation::tanh(
            xg.narrow(1, 2 * hs, hs) + self.candidate_hidden.forward(r_t * h.clone()),
        );

        z_t.clone().neg().add_scalar(1.0) * h_tilde + z_t * h
    }
}

/// LSTM cell with all four gates computed from a single projection each
#[derive(Module, Debug)]
pub struct LstmCell<B: Backend> {
    hidden_size: usize,
    // input -> [input | forget | cell | output]
    input_gates: Linear<B>,
    hidden_gates: Linear<B>,
}

impl<B: Backend> LstmCell<B> {
    pub fn new(input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            hidden_size,
            input_gates: LinearConfig::new(input_size, 4 * hidden_size).init(device),
            hidden_gates: LinearConfig::new(hidden_size, 4 * hidden_size).init(device),
        }
    }

    /// One time step, returning the new (hidden, cell) state
    pub fn step(
        &self,
        x_t: Tensor<B, 2>,
        h: Tensor<B, 2>,
        c: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let hs = self.hidden_size;
        let gates = self.input_gates.forward(x_t) + self.hidden_gates.forward(h);

        let i_t = activation::sigmoid(gates.clone().narrow(1, 0, hs));
        let f_t = activation::sigmoid(gates.clone().narrow(1, hs, hs));
        let g_t = activation::tanh(gates.clone().narrow(1, 2 * hs, hs));
        let o_t = activation::sigmoid(gates.narrow(1, 3 * hs, hs));

        let c = f_t * c + i_t * g_t;
        let h = o_t * activation::tanh(c.clone());
        (h, c)
    }
}

/// One recurrent direction over a whole sequence
///
/// Exactly one of the two cells is present, chosen by [`CellKind`].
#[derive(Module, Debug)]
pub struct RecurrentCell<B: Backend> {
    input_size: usize,
    hidden_size: usize,
    gru: Option<GruCell<B>>,
    lstm: Option<LstmCell<B>>,
}

impl<B: Backend> RecurrentCell<B> {
    pub fn new(kind: CellKind, input_size: usize, hidden_size: usize, device: &B::Device) -> Self {
        let (gru, lstm) = match kind {
            CellKind::Gru => (Some(GruCell::new(input_size, hidden_size, device)), None),
            CellKind::Lstm => (None, Some(LstmCell::new(input_size, hidden_size, device))),
        };
        Self {
            input_size,
            hidden_size,
            gru,
            lstm,
        }
    }

    /// Run over `x` of shape [batch, seq, input]
    ///
    /// With `reverse` the sequence is consumed last step first, but the
    /// returned outputs stay aligned with the input time axis.
    ///
    /// # Returns
    ///
    /// Hidden states of shape [batch, seq, hidden]
    pub fn forward(&self, x: Tensor<B, 3>, reverse: bool) -> Tensor<B, 3> {
        let device = x.device();
        let [batch_size, sequence_length, _] = x.dims();

        let mut h: Tensor<B, 2> = Tensor::zeros([batch_size, self.hidden_size], &device);
        let mut c: Tensor<B, 2> = Tensor::zeros([batch_size, self.hidden_size], &device);

        let steps: Vec<usize> = if reverse {
            (0..sequence_length).rev().collect()
        } else {
            (0..sequence_length).collect()
        };

        let mut outputs = Vec::with_capacity(sequence_length);
        for t in steps {
            let x_t = x
                .clone()
                .narrow(1, t, 1)
                .reshape([batch_size, self.input_size]);

            if let Some(gru) = &self.gru {
                h = gru.step(x_t, h);
            } else if let Some(lstm) = &self.lstm {
                let (next_h, next_c) = lstm.step(x_t, h, c);
                h = next_h;
                c = next_c;
            }
            outputs.push(h.clone());
        }
        if reverse {
            outputs.reverse();
        }

        Tensor::stack::<3>(outputs, 1)
    }

    pub fn kind(&self) -> CellKind {
        if self.lstm.is_some() {
            CellKind::Lstm
        } else {
            CellKind::Gru
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

/// A recurrent layer, optionally reading the sequence in both directions
#[derive(Module, Debug)]
pub struct RecurrentLayer<B: Backend> {
    forward_cell: RecurrentCell<B>,
    backward_cell: Option<RecurrentCell<B>>,
}

impl<B: Backend> RecurrentLayer<B> {
    pub fn new(
        kind: CellKind,
        input_size: usize,
        hidden_size: usize,
        bidirectional: bool,
        device: &B::Device,
    ) -> Self {
        let backward_cell =
            bidirectional.then(|| RecurrentCell::new(kind, input_size, hidden_size, device));
        Self {
            forward_cell: RecurrentCell::new(kind, input_size, hidden_size, device),
            backward_cell,
        }
    }

    /// Width of each output step: hidden size, doubled when bidirectional
    pub fn output_size(&self) -> usize {
        match self.backward_cell {
            Some(_) => 2 * self.forward_cell.hidden_size(),
            None => self.forward_cell.hidden_size(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let forward_out = self.forward_cell.forward(x.clone(), false);
        match &self.backward_cell {
            Some(backward) => Tensor::cat(vec![forward_out, backward.forward(x, true)], 2),
            None => forward_out,
        }
    }
}
