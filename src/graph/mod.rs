//! Layer-graph arena and the forward/backward pass drivers
//!
//! Layers live in an arena indexed by [`LayerId`]; edges are plain indices,
//! so the arena owns every lifetime. Traversal is an explicit FIFO work-list
//! that preserves the fan-in-triggering semantics: a layer fires forward on
//! the arrival of its last predecessor and backward on the arrival of its
//! last gradient-producing successor, each exactly once per pass.

use std::cell::Ref;
use std::collections::VecDeque;

use ndarray::ArrayView2;

use crate::backend::{self, Matrix};
use crate::error::{Error, Result};
use crate::layers::{CostKind, Layer, LayerId, LayerKind};
use crate::pass::Pass;
use crate::weights::WeightGroup;

/// Per-run buffer retention switches.
///
/// Retaining buffers trades memory for avoiding reallocation; both default
/// to retain. Kind-specific transients (conv partial sums, norm
/// denominators) follow `retain_activation_gradients`.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPolicy {
    pub retain_activations: bool,
    pub retain_activation_gradients: bool,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        MemoryPolicy {
            retain_activations: true,
            retain_activation_gradients: true,
        }
    }
}

/// The layer graph: arena, edges, pass drivers.
#[derive(Debug, Default)]
pub struct Graph {
    layers: Vec<Layer>,
    policy: MemoryPolicy,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn with_policy(policy: MemoryPolicy) -> Self {
        Graph {
            layers: Vec::new(),
            policy,
        }
    }

    pub fn add_layer(&mut self, layer: Layer) -> LayerId {
        self.layers.push(layer);
        LayerId(self.layers.len() - 1)
    }

    /// Directed edge `src -> dst`. Updates both endpoints and, when the
    /// successor produces gradients, the source's backward fan-in
    /// requirement.
    pub fn add_edge(&mut self, src: LayerId, dst: LayerId) -> Result<()> {
        self.check_id(src)?;
        self.check_id(dst)?;
        let dst_produces = self.layers[dst.0].is_grad_producer();
        self.layers[src.0].next.push(dst);
        if dst_produces {
            self.layers[src.0].grad_producing_next += 1;
        }
        self.layers[dst.0].prev.push(src);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, id: LayerId) -> &Layer {
        &self.layers[id.0]
    }

    pub fn layer_ids(&self) -> impl Iterator<Item = LayerId> {
        (0..self.layers.len()).map(LayerId)
    }

    pub fn layer_named(&self, name: &str) -> Option<LayerId> {
        self.layers.iter().position(|l| l.name() == name).map(LayerId)
    }

    fn check_id(&self, id: LayerId) -> Result<()> {
        if id.0 < self.layers.len() {
            Ok(())
        } else {
            Err(Error::InvalidLayerId(id.0))
        }
    }

    /// Structural checks after assembly: wiring arity, orientation
    /// restrictions, acyclicity.
    pub fn validate(&self) -> Result<()> {
        for layer in &self.layers {
            let kind = layer.kind.borrow();
            let invalid = |msg: &str| Err(Error::InvalidParam(layer.name().into(), msg.into()));
            match &*kind {
                LayerKind::Data(_) => {
                    if !layer.prev.is_empty() {
                        return invalid("data layers take no predecessors");
                    }
                }
                LayerKind::Cost(_) => {
                    if layer.prev.len() != 2 {
                        return invalid("cost layers take (labels, probabilities) inputs");
                    }
                    let labels = &self.layers[layer.prev[0].0];
                    if !matches!(&*labels.kind.borrow(), LayerKind::Data(_)) {
                        return invalid("cost label input must be a data layer");
                    }
                }
                LayerKind::FullyConnected(_) => {
                    if layer.prev.is_empty() {
                        return invalid("fc layers need at least one input");
                    }
                }
                _ => {
                    if layer.prev.len() != 1 {
                        return invalid("layer takes exactly one input");
                    }
                }
            }
            if layer.transposed() && !matches!(&*kind, LayerKind::Data(_)) {
                return invalid("only data layers may declare a transposed orientation");
            }
            if kind.requires_untransposed_input() {
                for &p in &layer.prev {
                    if self.layers[p.0].transposed() {
                        return invalid("spatial input must not be transposed");
                    }
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut remaining: Vec<usize> = self.layers.iter().map(|l| l.prev.len()).collect();
        let mut queue: VecDeque<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut seen = 0usize;
        while let Some(i) = queue.pop_front() {
            seen += 1;
            for &n in &self.layers[i].next {
                remaining[n.0] -= 1;
                if remaining[n.0] == 0 {
                    queue.push_back(n.0);
                }
            }
        }
        if seen == self.layers.len() {
            Ok(())
        } else {
            let stuck = remaining
                .iter()
                .position(|&d| d > 0)
                .expect("cycle implies a stuck layer");
            Err(Error::Cycle(self.layers[stuck].name().into()))
        }
    }

    /// Zero every layer's fan-in counters; required before each pass pair.
    pub fn reset(&self) {
        for layer in &self.layers {
            layer.reset();
        }
    }

    /// One forward pass: feed every data layer from `data`, then fire layers
    /// as their last predecessor arrives.
    pub fn forward(&self, data: &[Matrix], pass: Pass) -> Result<()> {
        let mut fired: VecDeque<LayerId> = VecDeque::new();
        for (i, layer) in self.layers.iter().enumerate() {
            let kind = layer.kind.borrow();
            if let LayerKind::Data(d) = &*kind {
                let input = data
                    .get(d.data_idx)
                    .ok_or_else(|| Error::NoData(layer.name().into()))?;
                d.feed(input, &mut layer.acts.borrow_mut());
                fired.push_back(LayerId(i));
            }
        }
        while let Some(id) = fired.pop_front() {
            for &succ in &self.layers[id.0].next {
                let s = &self.layers[succ.0];
                s.fwd_arrivals.set(s.fwd_arrivals.get() + 1);
                if s.fwd_arrivals.get() == s.prev.len() {
                    self.fire_forward(succ, pass)?;
                    fired.push_back(succ);
                }
            }
        }
        Ok(())
    }

    fn fire_forward(&self, id: LayerId, pass: Pass) -> Result<()> {
        let layer = &self.layers[id.0];
        let prev_refs: Vec<Ref<'_, Matrix>> = layer
            .prev
            .iter()
            .map(|p| self.layers[p.0].acts.borrow())
            .collect();
        let inputs: Vec<ArrayView2<'_, f32>> = prev_refs
            .iter()
            .zip(&layer.prev)
            .map(|(r, p)| backend::oriented(r, self.layers[p.0].transposed()))
            .collect();
        let mut kind = layer.kind.borrow_mut();
        let mut acts = layer.acts.borrow_mut();
        kind.compute_forward(layer.name(), &inputs, &mut acts, pass)
    }

    /// One backward pass, seeded at the cost sinks.
    pub fn backward(&self, pass: Pass) -> Result<()> {
        let mut ready: VecDeque<LayerId> = self
            .layers
            .iter()
            .enumerate()
            .filter(|(_, l)| matches!(&*l.kind.borrow(), LayerKind::Cost(_)))
            .map(|(i, _)| LayerId(i))
            .collect();
        while let Some(id) = ready.pop_front() {
            self.fire_backward(id, &mut ready)?;
        }
        Ok(())
    }

    fn fire_backward(&self, id: LayerId, ready: &mut VecDeque<LayerId>) -> Result<()> {
        let layer = &self.layers[id.0];
        // early or repeated arrival is a no-op by design, not an error
        if layer.bwd_fired.get() || layer.bwd_arrivals.get() != layer.grad_producing_next {
            return Ok(());
        }
        layer.bwd_fired.set(true);

        // a coefficient-zero cost layer's backward step is a no-op
        let noop_cost = matches!(&*layer.kind.borrow(), LayerKind::Cost(_))
            && !layer.is_grad_producer();
        if noop_cost {
            return Ok(());
        }

        // activation-function derivative, fused into the incoming gradient
        {
            let kind = layer.kind.borrow();
            let acts = layer.acts.borrow();
            let mut grad = layer.act_grads.borrow_mut();
            if !grad.is_empty() {
                kind.common_backward(&acts, &mut grad);
            }
        }

        // input gradients: first writer overwrites, later writers add
        if layer.is_grad_producer() {
            for (idx, &p) in layer.prev.iter().enumerate() {
                let pred = &self.layers[p.0];
                if !pred.is_grad_consumer() {
                    continue;
                }
                let overwrite = pred.bwd_arrivals.get() == 0;
                self.compute_input_gradient(id, idx, overwrite);
                pred.bwd_arrivals.set(pred.bwd_arrivals.get() + 1);
            }
        }

        self.compute_weight_gradients(id);

        // this layer's own buffers are dead for the rest of the pass
        if !self.policy.retain_activations {
            *layer.acts.borrow_mut() = backend::empty();
        }
        if !self.policy.retain_activation_gradients {
            *layer.act_grads.borrow_mut() = backend::empty();
            layer.kind.borrow_mut().truncate_transients();
        }

        for &p in &layer.prev {
            let pred = &self.layers[p.0];
            if pred.is_grad_consumer()
                && !pred.bwd_fired.get()
                && pred.bwd_arrivals.get() == pred.grad_producing_next
            {
                ready.push_back(p);
            }
        }
        Ok(())
    }

    fn compute_input_gradient(&self, id: LayerId, idx: usize, overwrite: bool) {
        let layer = &self.layers[id.0];
        let pred = &self.layers[layer.prev[idx].0];
        let kind = layer.kind.borrow();
        let grad = layer.act_grads.borrow();
        let mut dst = pred.act_grads.borrow_mut();
        match &*kind {
            LayerKind::FullyConnected(fc) => fc.input_gradient(idx, &grad, &mut dst, overwrite),
            LayerKind::Conv(conv) => conv.input_gradient(&grad, &mut dst, overwrite),
            LayerKind::Pool(pool) => {
                let input = pred.acts.borrow();
                pool.input_gradient(&input.view(), &grad, &mut dst, overwrite);
            }
            LayerKind::ResponseNorm(norm) => {
                let input = pred.acts.borrow();
                norm.input_gradient(&input.view(), &grad, &mut dst, overwrite);
            }
            LayerKind::ContrastNorm(norm) => norm.input_gradient(&grad, &mut dst, overwrite),
            LayerKind::Softmax(softmax) => {
                let probs = layer.acts.borrow();
                match self.softmax_fusion(id) {
                    Some((coeff, labels_id)) => {
                        let labels_layer = &self.layers[labels_id.0];
                        let labels = labels_layer.acts.borrow();
                        softmax.fused_input_gradient(
                            &probs,
                            &backend::oriented(&labels, labels_layer.transposed()),
                            coeff,
                            &mut dst,
                            overwrite,
                        );
                    }
                    None => softmax.generic_input_gradient(&probs, &grad, &mut dst, overwrite),
                }
            }
            LayerKind::Cost(cost) => {
                assert_eq!(idx, 1, "cost gradients flow into the probability input");
                // when the predecessor softmax fuses, exactly one of the two
                // paths runs the chain-rule arithmetic: skip ours
                if !self.cost_predecessor_will_fuse(id) {
                    let labels_layer = &self.layers[layer.prev[0].0];
                    let labels = labels_layer.acts.borrow();
                    let probs = pred.acts.borrow();
                    cost.input_gradient(
                        &backend::oriented(&labels, labels_layer.transposed()),
                        &probs.view(),
                        &mut dst,
                        overwrite,
                    );
                }
            }
            LayerKind::Data(_) => unreachable!("data layers are not gradient producers"),
        }
    }

    /// Fusion test on the softmax side: exactly one successor and it is a
    /// logistic cost layer. Returns the cost coefficient and its label input.
    fn softmax_fusion(&self, id: LayerId) -> Option<(f32, LayerId)> {
        let layer = &self.layers[id.0];
        if layer.next.len() != 1 {
            return None;
        }
        let succ = &self.layers[layer.next[0].0];
        if let LayerKind::Cost(c) = &*succ.kind.borrow() {
            if c.kind == CostKind::Logreg {
                return Some((c.coeff, succ.prev[0]));
            }
        }
        None
    }

    /// Mirror condition checked from the cost side: the probability
    /// predecessor's type tag is softmax and it has at most one successor.
    fn cost_predecessor_will_fuse(&self, id: LayerId) -> bool {
        let layer = &self.layers[id.0];
        let pred = &self.layers[layer.prev[1].0];
        pred.kind.borrow().tag() == "softmax" && pred.next.len() <= 1
    }

    fn compute_weight_gradients(&self, id: LayerId) {
        let layer = &self.layers[id.0];
        let mut kind = layer.kind.borrow_mut();
        match &mut *kind {
            LayerKind::FullyConnected(fc) => {
                let prev_refs: Vec<Ref<'_, Matrix>> = layer
                    .prev
                    .iter()
                    .map(|p| self.layers[p.0].acts.borrow())
                    .collect();
                let inputs: Vec<ArrayView2<'_, f32>> = prev_refs
                    .iter()
                    .zip(&layer.prev)
                    .map(|(r, p)| backend::oriented(r, self.layers[p.0].transposed()))
                    .collect();
                let grad = layer.act_grads.borrow();
                fc.weight_gradients(&inputs, &grad);
            }
            LayerKind::Conv(conv) => {
                let input = self.layers[layer.prev[0].0].acts.borrow();
                let grad = layer.act_grads.borrow();
                conv.weight_gradients(&input.view(), &grad);
            }
            _ => {}
        }
    }

    /// Apply the update rule to every weight group in the graph.
    pub fn update(&self, batch_size: usize, pass: Pass) {
        for layer in &self.layers {
            for group in layer.kind.borrow_mut().weight_groups_mut() {
                group.update(batch_size, pass);
            }
        }
    }

    /// Transfer every weight group's values and increments to the host
    /// shadows.
    pub fn copy_to_host(&self) {
        for layer in &self.layers {
            for group in layer.kind.borrow_mut().weight_groups_mut() {
                group.copy_to_host();
            }
        }
    }

    /// Transfer every weight group's host shadows back over the live buffers.
    pub fn copy_to_device(&self) {
        for layer in &self.layers {
            for group in layer.kind.borrow_mut().weight_groups_mut() {
                group.copy_to_device();
            }
        }
    }

    pub fn activations(&self, id: LayerId) -> Ref<'_, Matrix> {
        self.layers[id.0].acts.borrow()
    }

    pub fn activation_gradients(&self, id: LayerId) -> Ref<'_, Matrix> {
        self.layers[id.0].act_grads.borrow()
    }

    /// The ordered error metrics a cost layer computed this pass.
    pub fn cost_metrics(&self, id: LayerId) -> Result<Vec<f32>> {
        match &*self.layers[id.0].kind.borrow() {
            LayerKind::Cost(c) => Ok(c.metrics.clone()),
            _ => Err(Error::NotACostLayer(self.layers[id.0].name().into())),
        }
    }

    /// Coefficient-weighted sum of every cost layer's first metric.
    pub fn total_cost(&self) -> f32 {
        self.layers
            .iter()
            .filter_map(|l| match &*l.kind.borrow() {
                LayerKind::Cost(c) => c.metrics.first().map(|&m| m * c.coeff),
                _ => None,
            })
            .sum()
    }

    pub fn weight_group_count(&self, id: LayerId) -> usize {
        self.layers[id.0].kind.borrow().weight_groups().len()
    }

    pub fn with_weight_group<R>(
        &self,
        id: LayerId,
        group: usize,
        f: impl FnOnce(&WeightGroup) -> R,
    ) -> Result<R> {
        let kind = self.layers[id.0].kind.borrow();
        kind.weight_groups()
            .get(group)
            .map(f)
            .ok_or_else(|| Error::NoSuchWeightGroup(self.layers[id.0].name().into(), group))
    }

    pub fn with_weight_group_mut<R>(
        &self,
        id: LayerId,
        group: usize,
        f: impl FnOnce(&mut WeightGroup) -> R,
    ) -> Result<R> {
        let mut kind = self.layers[id.0].kind.borrow_mut();
        let name = self.layers[id.0].name().to_string();
        kind.weight_groups_mut()
            .get_mut(group)
            .map(f)
            .ok_or(Error::NoSuchWeightGroup(name, group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{DataLayer, FullyConnectedLayer, Neuron, SoftmaxLayer};
    use ndarray::array;

    fn fc_kind(weights: Matrix, bias_cols: usize) -> LayerKind {
        LayerKind::FullyConnected(FullyConnectedLayer::new(
            Neuron::Ident,
            vec![
                WeightGroup::new("w0", weights, 0.1, 0.0, 0.0),
                WeightGroup::new("bias", Matrix::zeros((1, bias_cols)), 0.1, 0.0, 0.0),
            ],
        ))
    }

    #[test]
    fn test_add_edge_tracks_gradient_producers() {
        let mut g = Graph::new();
        let data = g.add_layer(Layer::new("data", LayerKind::Data(DataLayer::new(0)), false));
        let fc = g.add_layer(Layer::new("fc", fc_kind(array![[1.0]], 1), false));
        g.add_edge(data, fc).unwrap();
        // fc produces gradients, so data's backward fan-in requirement grows
        assert_eq!(g.layer(data).grad_producing_successors(), 1);
        assert_eq!(g.layer(fc).grad_producing_successors(), 0);
    }

    #[test]
    fn test_add_edge_rejects_bad_id() {
        let mut g = Graph::new();
        let data = g.add_layer(Layer::new("data", LayerKind::Data(DataLayer::new(0)), false));
        assert!(matches!(
            g.add_edge(data, LayerId(7)),
            Err(Error::InvalidLayerId(7))
        ));
    }

    #[test]
    fn test_validate_detects_cycle() {
        let mut g = Graph::new();
        let a = g.add_layer(Layer::new("a", fc_kind(array![[1.0]], 1), false));
        let b = g.add_layer(Layer::new("b", fc_kind(array![[1.0]], 1), false));
        g.add_edge(a, b).unwrap();
        g.add_edge(b, a).unwrap();
        assert!(matches!(g.validate(), Err(Error::Cycle(_))));
    }

    #[test]
    fn test_validate_rejects_wired_data_layer() {
        let mut g = Graph::new();
        let a = g.add_layer(Layer::new("a", fc_kind(array![[1.0]], 1), false));
        let d = g.add_layer(Layer::new("d", LayerKind::Data(DataLayer::new(0)), false));
        g.add_edge(a, d).unwrap();
        assert!(matches!(g.validate(), Err(Error::InvalidParam(_, _))));
    }

    #[test]
    fn test_forward_missing_data_fails() {
        let mut g = Graph::new();
        g.add_layer(Layer::new("data", LayerKind::Data(DataLayer::new(2)), false));
        let err = g.forward(&[array![[1.0]]], Pass::Train);
        assert!(matches!(err, Err(Error::NoData(_))));
    }

    #[test]
    fn test_forward_fires_once_on_last_arrival() {
        // diamond: data -> {fc_a, fc_b} -> fc_join
        let mut g = Graph::new();
        let data = g.add_layer(Layer::new("data", LayerKind::Data(DataLayer::new(0)), false));
        let a = g.add_layer(Layer::new("a", fc_kind(array![[2.0]], 1), false));
        let b = g.add_layer(Layer::new("b", fc_kind(array![[3.0]], 1), false));
        let join = g.add_layer(Layer::new(
            "join",
            LayerKind::FullyConnected(FullyConnectedLayer::new(
                Neuron::Ident,
                vec![
                    WeightGroup::new("w0", array![[1.0]], 0.1, 0.0, 0.0),
                    WeightGroup::new("w1", array![[1.0]], 0.1, 0.0, 0.0),
                    WeightGroup::new("bias", array![[0.0]], 0.1, 0.0, 0.0),
                ],
            )),
            false,
        ));
        g.add_edge(data, a).unwrap();
        g.add_edge(data, b).unwrap();
        g.add_edge(a, join).unwrap();
        g.add_edge(b, join).unwrap();
        g.validate().unwrap();

        g.reset();
        g.forward(&[array![[1.0]]], Pass::Train).unwrap();
        // join fired exactly once, after both inputs: 1·2 + 1·3
        assert_eq!(*g.activations(join), array![[5.0]]);
        assert_eq!(g.layer(join).fwd_arrivals.get(), 2);
    }

    #[test]
    fn test_softmax_fusion_condition_is_exact() {
        use crate::layers::CostLayer;

        let mut g = Graph::new();
        let labels = g.add_layer(Layer::new("labels", LayerKind::Data(DataLayer::new(1)), false));
        let probs = g.add_layer(Layer::new("sm", LayerKind::Softmax(SoftmaxLayer::new()), false));
        let cost = g.add_layer(Layer::new(
            "cost",
            LayerKind::Cost(CostLayer::new(CostKind::Logreg, 1.0)),
            false,
        ));
        g.add_edge(labels, cost).unwrap();
        g.add_edge(probs, cost).unwrap();
        assert!(g.softmax_fusion(probs).is_some());
        assert!(g.cost_predecessor_will_fuse(cost));

        // a second successor disables the fused path even though the cost
        // layer is still attached
        let extra = g.add_layer(Layer::new("extra", fc_kind(array![[1.0, 0.0], [0.0, 1.0]], 2), false));
        g.add_edge(probs, extra).unwrap();
        assert!(g.softmax_fusion(probs).is_none());
        assert!(!g.cost_predecessor_will_fuse(cost));
    }
}
