//! Layer-graph execution engine for DAG-shaped feed-forward networks
//!
//! Models are arbitrary acyclic graphs of layers. The graph driver runs
//! data-flow style: a layer fires its forward (or backward) computation when
//! the last of its inputs (or gradient producers) arrives, so shared
//! sub-networks and multi-branch topologies need no special casing. Weight
//! updates use per-group SGD with momentum and weight decay, and analytic
//! gradients can be verified numerically through [`gradcheck`].
//!
//! # Example
//!
//! ```
//! use capas::{build_graph, specs_from_json, Pass};
//! use ndarray::array;
//!
//! let specs = specs_from_json(r#"[
//!     { "name": "input", "type": "data", "data_idx": 0, "outputs": 2 },
//!     { "name": "labels", "type": "data", "data_idx": 1, "outputs": 1 },
//!     { "name": "fc1", "type": "fc", "inputs": ["input"], "outputs": 2,
//!       "learning_rate": 0.1 },
//!     { "name": "probs", "type": "softmax", "inputs": ["fc1"] },
//!     { "name": "logprob", "type": "cost.logreg", "inputs": ["labels", "probs"] }
//! ]"#).unwrap();
//!
//! let graph = build_graph(&specs, 42).unwrap();
//! let data = vec![array![[1.0, 2.0]], array![[1.0]]];
//! graph.forward(&data, Pass::Train).unwrap();
//! graph.backward(Pass::Train).unwrap();
//! graph.update(1, Pass::Train);
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod gradcheck;
pub mod graph;
pub mod layers;
pub mod pass;
pub mod weights;

pub use config::{build_graph, specs_from_json, HyperParam, LayerSpec};
pub use error::{Error, Result};
pub use gradcheck::{check_graph, check_weight_group, GradCheckReport};
pub use graph::{Graph, MemoryPolicy};
pub use layers::{Layer, LayerId, LayerKind, Neuron};
pub use pass::Pass;
pub use weights::WeightGroup;
