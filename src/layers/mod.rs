//! Layer records and the closed set of layer kinds
//!
//! A [`Layer`] is one node of the graph arena: identity, orientation,
//! capability flags, edge lists and per-pass synchronization state. The
//! kind-specific behaviour lives in [`LayerKind`], a closed tagged variant
//! dispatched by pattern match; the graph driver owns the cross-layer
//! protocol (fan-in counting, accumulation policy, truncation, the
//! softmax/cost fusion decision).

mod conv;
mod cost;
mod data;
mod fully_connected;
mod norm;
mod pool;
mod softmax;

pub use conv::ConvLayer;
pub use cost::{CostKind, CostLayer};
pub use data::DataLayer;
pub use fully_connected::FullyConnectedLayer;
pub use norm::{ContrastNormLayer, ResponseNormLayer};
pub use pool::{PoolKind, PoolLayer};
pub use softmax::SoftmaxLayer;

use std::cell::{Cell, RefCell};

use ndarray::ArrayView2;

use crate::backend::{self, Matrix};
use crate::error::{Error, Result};
use crate::pass::Pass;
use crate::weights::WeightGroup;

/// Handle into the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerId(pub(crate) usize);

impl LayerId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Pointwise activation function, fused with its derivative on backward.
///
/// The derivative is expressed in terms of the layer's own outputs, so the
/// common-backward step needs no extra buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neuron {
    Ident,
    Logistic,
    Relu,
}

impl Neuron {
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "ident" => Ok(Neuron::Ident),
            "logistic" => Ok(Neuron::Logistic),
            "relu" => Ok(Neuron::Relu),
            other => Err(Error::UnknownNeuron(other.to_string())),
        }
    }

    pub fn apply(self, m: &mut Matrix) {
        match self {
            Neuron::Ident => {}
            Neuron::Logistic => m.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            Neuron::Relu => m.mapv_inplace(|v| v.max(0.0)),
        }
    }

    /// grad *= f'(output), in place.
    pub fn deriv_mul(self, outputs: &Matrix, grad: &mut Matrix) {
        match self {
            Neuron::Ident => {}
            Neuron::Logistic => grad.zip_mut_with(outputs, |g, &a| *g *= a * (1.0 - a)),
            Neuron::Relu => grad.zip_mut_with(outputs, |g, &a| {
                if a <= 0.0 {
                    *g = 0.0;
                }
            }),
        }
    }
}

/// Closed set of layer kinds.
#[derive(Debug)]
pub enum LayerKind {
    FullyConnected(FullyConnectedLayer),
    Conv(ConvLayer),
    Pool(PoolLayer),
    ResponseNorm(ResponseNormLayer),
    ContrastNorm(ContrastNormLayer),
    Softmax(SoftmaxLayer),
    Data(DataLayer),
    Cost(CostLayer),
}

impl LayerKind {
    /// Textual type tag; the softmax/cost fusion condition keys off these.
    pub fn tag(&self) -> &'static str {
        match self {
            LayerKind::FullyConnected(_) => "fc",
            LayerKind::Conv(_) => "conv",
            LayerKind::Pool(_) => "pool",
            LayerKind::ResponseNorm(_) => "rnorm",
            LayerKind::ContrastNorm(_) => "cnorm",
            LayerKind::Softmax(_) => "softmax",
            LayerKind::Data(_) => "data",
            LayerKind::Cost(c) => c.kind.tag(),
        }
    }

    /// Whether the layer accepts backward gradient flow.
    pub fn is_grad_consumer(&self) -> bool {
        !matches!(self, LayerKind::Data(_))
    }

    /// Whether the layer produces gradients for its predecessors.
    pub fn is_grad_producer(&self) -> bool {
        match self {
            LayerKind::Data(_) => false,
            LayerKind::Cost(c) => c.coeff != 0.0,
            _ => true,
        }
    }

    /// Whether the layer's input must keep the canonical orientation
    /// (spatially structured kinds index pixels directly).
    pub fn requires_untransposed_input(&self) -> bool {
        matches!(
            self,
            LayerKind::Conv(_)
                | LayerKind::Pool(_)
                | LayerKind::ResponseNorm(_)
                | LayerKind::ContrastNorm(_)
        )
    }

    pub fn weight_groups(&self) -> &[WeightGroup] {
        match self {
            LayerKind::FullyConnected(fc) => &fc.groups,
            LayerKind::Conv(conv) => &conv.groups,
            _ => &[],
        }
    }

    pub fn weight_groups_mut(&mut self) -> &mut [WeightGroup] {
        match self {
            LayerKind::FullyConnected(fc) => &mut fc.groups,
            LayerKind::Conv(conv) => &mut conv.groups,
            _ => &mut [],
        }
    }

    /// Kind-specific forward computation into `acts`.
    ///
    /// Data layers are sourced externally by the driver, never through this
    /// entry; reaching one here means the graph was miswired.
    pub fn compute_forward(
        &mut self,
        name: &str,
        inputs: &[ArrayView2<'_, f32>],
        acts: &mut Matrix,
        _pass: Pass,
    ) -> Result<()> {
        match self {
            LayerKind::FullyConnected(fc) => {
                fc.forward(inputs, acts);
                Ok(())
            }
            LayerKind::Conv(conv) => {
                conv.forward(&inputs[0], acts);
                Ok(())
            }
            LayerKind::Pool(pool) => {
                pool.forward(&inputs[0], acts);
                Ok(())
            }
            LayerKind::ResponseNorm(norm) => {
                norm.forward(&inputs[0], acts);
                Ok(())
            }
            LayerKind::ContrastNorm(norm) => {
                norm.forward(&inputs[0], acts);
                Ok(())
            }
            LayerKind::Softmax(softmax) => {
                softmax.forward(&inputs[0], acts);
                Ok(())
            }
            LayerKind::Cost(cost) => {
                cost.forward(&inputs[0], &inputs[1]);
                Ok(())
            }
            LayerKind::Data(_) => Err(Error::NoData(name.to_string())),
        }
    }

    /// Activation-function derivative fused into the incoming gradient.
    pub fn common_backward(&self, acts: &Matrix, grad: &mut Matrix) {
        match self {
            LayerKind::FullyConnected(fc) => fc.neuron.deriv_mul(acts, grad),
            LayerKind::Conv(conv) => conv.neuron.deriv_mul(acts, grad),
            _ => {}
        }
    }

    /// Release kind-specific transient buffers.
    pub fn truncate_transients(&mut self) {
        match self {
            LayerKind::Conv(conv) => conv.truncate_transients(),
            LayerKind::ResponseNorm(norm) => norm.truncate_transients(),
            LayerKind::ContrastNorm(norm) => norm.truncate_transients(),
            _ => {}
        }
    }
}

/// One node of the layer graph.
///
/// Edge lists and the gradient-producing-successor count are fixed at
/// assembly time; buffers, counters and kind state are per-pass mutable
/// behind cells so the traversal can hold disjoint borrows across arena
/// slots.
#[derive(Debug)]
pub struct Layer {
    name: String,
    transposed: bool,
    grad_consumer: bool,
    grad_producer: bool,
    pub(crate) prev: Vec<LayerId>,
    pub(crate) next: Vec<LayerId>,
    pub(crate) grad_producing_next: usize,
    pub(crate) kind: RefCell<LayerKind>,
    pub(crate) acts: RefCell<Matrix>,
    pub(crate) act_grads: RefCell<Matrix>,
    pub(crate) fwd_arrivals: Cell<usize>,
    pub(crate) bwd_arrivals: Cell<usize>,
    pub(crate) bwd_fired: Cell<bool>,
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind, transposed: bool) -> Self {
        let grad_consumer = kind.is_grad_consumer();
        let grad_producer = kind.is_grad_producer();
        Layer {
            name: name.into(),
            transposed,
            grad_consumer,
            grad_producer,
            prev: Vec::new(),
            next: Vec::new(),
            grad_producing_next: 0,
            kind: RefCell::new(kind),
            acts: RefCell::new(backend::empty()),
            act_grads: RefCell::new(backend::empty()),
            fwd_arrivals: Cell::new(0),
            bwd_arrivals: Cell::new(0),
            bwd_fired: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transposed(&self) -> bool {
        self.transposed
    }

    pub fn is_grad_consumer(&self) -> bool {
        self.grad_consumer
    }

    pub fn is_grad_producer(&self) -> bool {
        self.grad_producer
    }

    pub fn predecessors(&self) -> &[LayerId] {
        &self.prev
    }

    pub fn successors(&self) -> &[LayerId] {
        &self.next
    }

    /// Successors that will send a gradient contribution this pass.
    pub fn grad_producing_successors(&self) -> usize {
        self.grad_producing_next
    }

    /// Zero both fan-in counters and the fired guard for a fresh pass.
    pub fn reset(&self) {
        self.fwd_arrivals.set(0);
        self.bwd_arrivals.set(0);
        self.bwd_fired.set(false);
    }
}

/// Interpret one label cell as a class index.
///
/// Labels arrive as floats inside a data matrix; anything that is not a
/// non-negative integer below the class count is malformed input, not a
/// class-zero example.
pub(crate) fn label_index(raw: f32, classes: usize) -> usize {
    assert!(
        raw >= 0.0 && raw.fract() == 0.0,
        "labels must be non-negative integers, got {raw}"
    );
    let label = raw as usize;
    assert!(label < classes, "label {label} out of range for {classes} classes");
    label
}
