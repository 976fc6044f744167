//! Numerical verification of analytic weight gradients
//!
//! Perturbs each weight of a group through the host shadow, re-runs the
//! forward pass, and compares central differences of the total cost against
//! the gradients produced by the backward pass. Runs under
//! [`Pass::GradCheck`](crate::pass::Pass) so momentum history does not leak
//! into the measurement.

use crate::backend::Matrix;
use crate::error::Result;
use crate::graph::Graph;
use crate::layers::LayerId;
use crate::pass::Pass;

/// Outcome of checking one weight group.
#[derive(Debug, Clone)]
pub struct GradCheckReport {
    pub layer: String,
    pub group: String,
    pub checked: usize,
    pub worst_rel_err: f32,
    pub passed: bool,
}

/// Check every weight of one group against central differences.
///
/// `epsilon` is the perturbation step, `tolerance` the accepted relative
/// error. The graph's weights are restored before returning.
pub fn check_weight_group(
    graph: &Graph,
    id: LayerId,
    group: usize,
    data: &[Matrix],
    epsilon: f32,
    tolerance: f32,
) -> Result<GradCheckReport> {
    graph.reset();
    graph.forward(data, Pass::GradCheck)?;
    graph.backward(Pass::GradCheck)?;
    let (group_name, analytic) =
        graph.with_weight_group(id, group, |g| (g.name.clone(), g.grads.clone()))?;
    let layer_name = graph.layer(id).name().to_string();
    graph.copy_to_host();

    let (rows, cols) = analytic.dim();
    let mut worst = 0.0f32;
    for r in 0..rows {
        for c in 0..cols {
            let orig = graph.with_weight_group(id, group, |g| g.host_values()[(r, c)])?;
            let plus = cost_at(graph, id, group, (r, c), orig + epsilon, data)?;
            let minus = cost_at(graph, id, group, (r, c), orig - epsilon, data)?;
            graph.with_weight_group_mut(id, group, |g| g.host_values_mut()[(r, c)] = orig)?;
            graph.copy_to_device();

            let numeric = (plus - minus) / (2.0 * epsilon);
            let a = analytic[(r, c)];
            let scale = a.abs().max(numeric.abs()).max(1e-6);
            worst = worst.max((a - numeric).abs() / scale);
        }
    }

    Ok(GradCheckReport {
        layer: layer_name,
        group: group_name,
        checked: rows * cols,
        worst_rel_err: worst,
        passed: worst <= tolerance,
    })
}

/// Check every weight group of every layer, returning one report per group.
pub fn check_graph(
    graph: &Graph,
    data: &[Matrix],
    epsilon: f32,
    tolerance: f32,
) -> Result<Vec<GradCheckReport>> {
    let mut reports = Vec::new();
    for id in graph.layer_ids() {
        for group in 0..graph.weight_group_count(id) {
            reports.push(check_weight_group(graph, id, group, data, epsilon, tolerance)?);
        }
    }
    Ok(reports)
}

fn cost_at(
    graph: &Graph,
    id: LayerId,
    group: usize,
    at: (usize, usize),
    value: f32,
    data: &[Matrix],
) -> Result<f32> {
    graph.with_weight_group_mut(id, group, |g| g.host_values_mut()[at] = value)?;
    graph.copy_to_device();
    graph.reset();
    graph.forward(data, Pass::GradCheck)?;
    Ok(graph.total_cost())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{build_graph, specs_from_json};
    use ndarray::array;

    fn classifier() -> Graph {
        let specs = specs_from_json(
            r#"[
            { "name": "input", "type": "data", "data_idx": 0, "outputs": 3 },
            { "name": "labels", "type": "data", "data_idx": 1, "outputs": 1 },
            { "name": "fc1", "type": "fc", "inputs": ["input"], "outputs": 4,
              "neuron": "logistic", "learning_rate": 0.1, "init_w": 0.5 },
            { "name": "fc2", "type": "fc", "inputs": ["fc1"], "outputs": 2,
              "learning_rate": 0.1, "init_w": 0.5 },
            { "name": "probs", "type": "softmax", "inputs": ["fc2"] },
            { "name": "logprob", "type": "cost.logreg", "inputs": ["labels", "probs"] }
        ]"#,
        )
        .unwrap();
        build_graph(&specs, 7).unwrap()
    }

    #[test]
    fn test_fc_gradients_match_central_differences() {
        let graph = classifier();
        let data = vec![
            array![[0.3, -0.8, 0.5], [1.1, 0.2, -0.4]],
            array![[1.0], [0.0]],
        ];
        let reports = check_graph(&graph, &data, 1e-2, 1e-2).unwrap();
        // two fc layers, two groups each
        assert_eq!(reports.len(), 4);
        for report in &reports {
            assert!(
                report.passed,
                "{}/{} worst relative error {}",
                report.layer, report.group, report.worst_rel_err
            );
        }
    }

    #[test]
    fn test_weights_restored_after_check() {
        let graph = classifier();
        let fc1 = graph.layer_named("fc1").unwrap();
        let before = graph.with_weight_group(fc1, 0, |g| g.values.clone()).unwrap();
        let data = vec![array![[0.3, -0.8, 0.5]], array![[1.0]]];
        check_weight_group(&graph, fc1, 0, &data, 1e-2, 1e-2).unwrap();
        let after = graph.with_weight_group(fc1, 0, |g| g.values.clone()).unwrap();
        assert_eq!(before, after);
    }
}
