//! End-to-end training passes over a small softmax classifier, checked
//! against hand-computed values.

use approx::assert_relative_eq;
use capas::{build_graph, specs_from_json, Graph, Pass};
use ndarray::{array, Array2};

/// data -> fc (identity weights, zero bias) -> softmax -> logistic cost.
fn identity_classifier() -> Graph {
    let specs = specs_from_json(
        r#"[
        { "name": "input", "type": "data", "data_idx": 0, "outputs": 2 },
        { "name": "labels", "type": "data", "data_idx": 1, "outputs": 1 },
        { "name": "fc1", "type": "fc", "inputs": ["input"], "outputs": 2,
          "learning_rate": 0.1 },
        { "name": "probs", "type": "softmax", "inputs": ["fc1"] },
        { "name": "logprob", "type": "cost.logreg", "inputs": ["labels", "probs"] }
    ]"#,
    )
    .unwrap();
    let graph = build_graph(&specs, 0).unwrap();
    let fc1 = graph.layer_named("fc1").unwrap();
    graph
        .with_weight_group_mut(fc1, 0, |w| {
            w.values = array![[1.0, 0.0], [0.0, 1.0]];
        })
        .unwrap();
    graph
}

#[test]
fn test_forward_probabilities_and_metrics() {
    let g = identity_classifier();
    g.reset();
    g.forward(&[array![[1.0, 2.0]], array![[1.0]]], Pass::Train).unwrap();

    let fc1 = g.layer_named("fc1").unwrap();
    assert_eq!(*g.activations(fc1), array![[1.0, 2.0]]);

    let probs = g.layer_named("probs").unwrap();
    let p = g.activations(probs);
    assert_relative_eq!(p[(0, 0)], 0.268_941_43, epsilon = 1e-6);
    assert_relative_eq!(p[(0, 1)], 0.731_058_6, epsilon = 1e-6);
    drop(p);

    let cost = g.layer_named("logprob").unwrap();
    let metrics = g.cost_metrics(cost).unwrap();
    // negative log-likelihood of the true class, and zero misclassifications
    assert_relative_eq!(metrics[0], 0.313_261_7, epsilon = 1e-5);
    assert_relative_eq!(metrics[1], 0.0);
    assert_relative_eq!(g.total_cost(), 0.313_261_7, epsilon = 1e-5);
}

#[test]
fn test_misclassification_counts_wrong_argmax() {
    let g = identity_classifier();
    g.reset();
    // same logits, but class 0 is the true label
    g.forward(&[array![[1.0, 2.0]], array![[0.0]]], Pass::Train).unwrap();
    let cost = g.layer_named("logprob").unwrap();
    let metrics = g.cost_metrics(cost).unwrap();
    assert_relative_eq!(metrics[0], 1.313_261_7, epsilon = 1e-5);
    assert_relative_eq!(metrics[1], 1.0);
}

#[test]
fn test_fused_backward_gradient() {
    let g = identity_classifier();
    g.reset();
    g.forward(&[array![[1.0, 2.0]], array![[1.0]]], Pass::Train).unwrap();
    g.backward(Pass::Train).unwrap();

    // probabilities minus one-hot, times the cost coefficient
    let fc1 = g.layer_named("fc1").unwrap();
    let grad = g.activation_gradients(fc1);
    assert_relative_eq!(grad[(0, 0)], 0.268_941_43, epsilon = 1e-6);
    assert_relative_eq!(grad[(0, 1)], -0.268_941_43, epsilon = 1e-6);
    drop(grad);

    g.with_weight_group(fc1, 0, |w| {
        // inputᵗ · grad
        assert_relative_eq!(w.grads[(0, 0)], 0.268_941_43, epsilon = 1e-6);
        assert_relative_eq!(w.grads[(1, 0)], 0.537_882_86, epsilon = 1e-6);
        assert_relative_eq!(w.grads[(0, 1)], -0.268_941_43, epsilon = 1e-6);
        assert_relative_eq!(w.grads[(1, 1)], -0.537_882_86, epsilon = 1e-6);
    })
    .unwrap();
}

#[test]
fn test_generic_softmax_path_matches_fused() {
    // a second (coefficient-zero) successor on the softmax disables fusion
    // without contributing any gradient of its own
    let specs = specs_from_json(
        r#"[
        { "name": "input", "type": "data", "data_idx": 0, "outputs": 2 },
        { "name": "labels", "type": "data", "data_idx": 1, "outputs": 1 },
        { "name": "fc1", "type": "fc", "inputs": ["input"], "outputs": 2,
          "learning_rate": 0.1 },
        { "name": "probs", "type": "softmax", "inputs": ["fc1"] },
        { "name": "logprob", "type": "cost.logreg", "inputs": ["labels", "probs"] },
        { "name": "monitor", "type": "cost.logreg", "inputs": ["labels", "probs"],
          "coeff": 0.0 }
    ]"#,
    )
    .unwrap();
    let generic = build_graph(&specs, 0).unwrap();
    let fc1 = generic.layer_named("fc1").unwrap();
    generic
        .with_weight_group_mut(fc1, 0, |w| {
            w.values = array![[1.0, 0.0], [0.0, 1.0]];
        })
        .unwrap();

    let fused = identity_classifier();
    let data = vec![array![[1.0, 2.0], [-0.5, 0.3]], array![[1.0], [0.0]]];
    for g in [&generic, &fused] {
        g.reset();
        g.forward(&data, Pass::Train).unwrap();
        g.backward(Pass::Train).unwrap();
    }

    let g_grad = generic.activation_gradients(fc1);
    let f_grad = fused.activation_gradients(fused.layer_named("fc1").unwrap());
    for (a, b) in g_grad.iter().zip(f_grad.iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-6);
    }
}

#[test]
fn test_update_applies_learning_rate() {
    let g = identity_classifier();
    g.reset();
    g.forward(&[array![[1.0, 2.0]], array![[1.0]]], Pass::Train).unwrap();
    g.backward(Pass::Train).unwrap();
    g.update(1, Pass::Train);

    let fc1 = g.layer_named("fc1").unwrap();
    g.with_weight_group(fc1, 0, |w| {
        // value += lr · grad, no momentum or decay configured
        assert_relative_eq!(w.values[(0, 0)], 1.0 + 0.1 * 0.268_941_43, epsilon = 1e-6);
        assert_relative_eq!(w.values[(1, 1)], 1.0 - 0.1 * 0.537_882_86, epsilon = 1e-6);
    })
    .unwrap();
}

#[test]
fn test_training_lowers_log_loss_over_steps() {
    // the update rule ascends the weighted objective, so a negative cost
    // coefficient descends the log-loss
    let specs = specs_from_json(
        r#"[
        { "name": "input", "type": "data", "data_idx": 0, "outputs": 2 },
        { "name": "labels", "type": "data", "data_idx": 1, "outputs": 1 },
        { "name": "fc1", "type": "fc", "inputs": ["input"], "outputs": 2,
          "neuron": "relu", "learning_rate": 0.5, "init_w": 0.1 },
        { "name": "fc2", "type": "fc", "inputs": ["fc1"], "outputs": 2,
          "learning_rate": 0.5, "init_w": 0.1 },
        { "name": "probs", "type": "softmax", "inputs": ["fc2"] },
        { "name": "logprob", "type": "cost.logreg", "inputs": ["labels", "probs"],
          "coeff": -1.0 }
    ]"#,
    )
    .unwrap();
    let g = build_graph(&specs, 3).unwrap();
    let cost = g.layer_named("logprob").unwrap();
    let data: Vec<Array2<f32>> = vec![
        array![[1.0, 0.0], [0.0, 1.0], [0.9, 0.1], [0.2, 0.8]],
        array![[0.0], [1.0], [0.0], [1.0]],
    ];

    g.reset();
    g.forward(&data, Pass::Train).unwrap();
    let initial = g.cost_metrics(cost).unwrap()[0];
    g.backward(Pass::Train).unwrap();
    g.update(4, Pass::Train);

    for _ in 0..50 {
        g.reset();
        g.forward(&data, Pass::Train).unwrap();
        g.backward(Pass::Train).unwrap();
        g.update(4, Pass::Train);
    }
    g.reset();
    g.forward(&data, Pass::Eval).unwrap();
    let final_loss = g.cost_metrics(cost).unwrap()[0];
    assert!(final_loss < initial, "log-loss should drop: {initial} -> {final_loss}");
}
