//! Declarative layer records and the graph builder
//!
//! A model is a list of [`LayerSpec`] records, each naming its type tag and
//! its inputs by layer name. Records must be listed in definition order
//! (inputs refer to earlier records), which also keeps the built graph
//! acyclic. Unknown type, pooling, cost or neuron tags fail construction
//! with a typed configuration error.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::backend::{ConvGeometry, Matrix, NormGeometry, PoolGeometry};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::layers::{
    ContrastNormLayer, ConvLayer, CostKind, CostLayer, DataLayer, FullyConnectedLayer, Layer,
    LayerKind, Neuron, PoolKind, PoolLayer, ResponseNormLayer, SoftmaxLayer,
};
use crate::weights::WeightGroup;

/// Scalar hyperparameter, or one value per weighted input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperParam {
    Scalar(f32),
    PerInput(Vec<f32>),
}

impl HyperParam {
    fn resolve(&self, n: usize, layer: &str, field: &str) -> Result<Vec<f32>> {
        match self {
            HyperParam::Scalar(v) => Ok(vec![*v; n]),
            HyperParam::PerInput(vs) if vs.len() == n => Ok(vs.clone()),
            HyperParam::PerInput(vs) => Err(Error::InvalidParam(
                layer.to_string(),
                format!("{field} needs 1 or {n} values, got {}", vs.len()),
            )),
        }
    }
}

fn default_coeff() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

/// One layer record of a model definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub transposed: bool,

    // data layers: input-list index and width
    #[serde(default)]
    pub data_idx: usize,
    pub outputs: Option<usize>,

    // weight layers
    pub neuron: Option<String>,
    pub init_w: Option<f32>,
    pub learning_rate: Option<HyperParam>,
    pub momentum: Option<HyperParam>,
    pub weight_decay: Option<HyperParam>,
    pub bias_learning_rate: Option<f32>,

    // convolution geometry
    pub channels: Option<usize>,
    pub img_size: Option<usize>,
    pub filters: Option<usize>,
    pub filter_size: Option<usize>,
    pub padding: Option<usize>,
    pub stride: Option<usize>,
    pub partial_sum: Option<usize>,
    #[serde(default = "default_true")]
    pub shared_biases: bool,

    // pooling / normalization
    pub pool: Option<String>,
    pub size_x: Option<usize>,
    #[serde(default)]
    pub start: isize,
    pub scale: Option<f32>,
    pub pow: Option<f32>,

    // cost layers
    #[serde(default = "default_coeff")]
    pub coeff: f32,
}

fn req<T>(value: Option<T>, layer: &str, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::InvalidParam(layer.to_string(), format!("missing field '{field}'")))
}

/// Parse a JSON array of layer records.
pub fn specs_from_json(json: &str) -> Result<Vec<LayerSpec>> {
    Ok(serde_json::from_str(json)?)
}

/// Build a validated graph from layer records, with seeded weight
/// initialization.
pub fn build_graph(specs: &[LayerSpec], seed: u64) -> Result<Graph> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut graph = Graph::new();
    let mut ids = HashMap::new();
    // output width per layer, for sizing the next layer's weights
    let mut dims: HashMap<String, usize> = HashMap::new();

    for spec in specs {
        if ids.contains_key(&spec.name) {
            return Err(Error::InvalidParam(
                spec.name.clone(),
                "duplicate layer name".to_string(),
            ));
        }
        let mut input_dims = Vec::with_capacity(spec.inputs.len());
        for input in &spec.inputs {
            let dim = dims
                .get(input)
                .ok_or_else(|| Error::UnknownInput(spec.name.clone(), input.clone()))?;
            input_dims.push(*dim);
        }

        let (kind, out_dim) = build_kind(spec, &input_dims, &mut rng)?;
        dims.insert(spec.name.clone(), out_dim);
        let id = graph.add_layer(Layer::new(&spec.name, kind, spec.transposed));
        for input in &spec.inputs {
            graph.add_edge(ids[input], id)?;
        }
        ids.insert(spec.name.clone(), id);
    }

    graph.validate()?;
    Ok(graph)
}

fn build_kind(
    spec: &LayerSpec,
    input_dims: &[usize],
    rng: &mut StdRng,
) -> Result<(LayerKind, usize)> {
    let name = spec.name.as_str();
    match spec.kind.as_str() {
        "data" => {
            let dim = req(spec.outputs, name, "outputs")?;
            Ok((LayerKind::Data(DataLayer::new(spec.data_idx)), dim))
        }
        "fc" => {
            let outputs = req(spec.outputs, name, "outputs")?;
            let neuron = Neuron::from_tag(spec.neuron.as_deref().unwrap_or("ident"))?;
            if input_dims.is_empty() {
                return Err(Error::InvalidParam(
                    name.to_string(),
                    "fc layers need at least one input".to_string(),
                ));
            }
            let n = input_dims.len();
            let init_w = spec.init_w.unwrap_or(0.01);
            let lr = req(spec.learning_rate.as_ref(), name, "learning_rate")?
                .resolve(n, name, "learning_rate")?;
            let momentum = resolve_or_zero(&spec.momentum, n, name, "momentum")?;
            let decay = resolve_or_zero(&spec.weight_decay, n, name, "weight_decay")?;
            let mut groups = Vec::with_capacity(n + 1);
            for (i, &in_dim) in input_dims.iter().enumerate() {
                groups.push(WeightGroup::new(
                    format!("w{i}"),
                    init_matrix((in_dim, outputs), init_w, rng),
                    lr[i],
                    decay[i],
                    momentum[i],
                ));
            }
            groups.push(WeightGroup::new(
                "bias",
                Matrix::zeros((1, outputs)),
                spec.bias_learning_rate.unwrap_or(lr[0]),
                0.0,
                momentum[0],
            ));
            Ok((
                LayerKind::FullyConnected(FullyConnectedLayer::new(neuron, groups)),
                outputs,
            ))
        }
        "conv" => {
            let geom = conv_geometry(spec, input_dims)?;
            let neuron = Neuron::from_tag(spec.neuron.as_deref().unwrap_or("ident"))?;
            let init_w = spec.init_w.unwrap_or(0.01);
            let lr = req(spec.learning_rate.as_ref(), name, "learning_rate")?
                .resolve(1, name, "learning_rate")?;
            let momentum = resolve_or_zero(&spec.momentum, 1, name, "momentum")?;
            let decay = resolve_or_zero(&spec.weight_decay, 1, name, "weight_decay")?;
            let filters = WeightGroup::new(
                "filters",
                init_matrix((geom.weight_rows(), geom.filters), init_w, rng),
                lr[0],
                decay[0],
                momentum[0],
            );
            let bias_cols = if spec.shared_biases {
                geom.filters
            } else {
                geom.output_len()
            };
            let biases = WeightGroup::new(
                "bias",
                Matrix::zeros((1, bias_cols)),
                spec.bias_learning_rate.unwrap_or(lr[0]),
                0.0,
                momentum[0],
            );
            let out_dim = geom.output_len();
            Ok((
                LayerKind::Conv(ConvLayer::new(
                    geom,
                    neuron,
                    spec.shared_biases,
                    spec.partial_sum,
                    filters,
                    biases,
                )),
                out_dim,
            ))
        }
        "pool" => {
            let kind = PoolKind::from_tag(&req(spec.pool.clone(), name, "pool")?)?;
            let geom = pool_geometry(spec, input_dims)?;
            let out_dim = geom.output_len();
            Ok((LayerKind::Pool(PoolLayer::new(kind, geom)), out_dim))
        }
        "rnorm" => {
            let geom = norm_geometry(spec, input_dims)?;
            let scale = req(spec.scale, name, "scale")?;
            let pow = req(spec.pow, name, "pow")?;
            let out_dim = geom.input_len();
            Ok((
                LayerKind::ResponseNorm(ResponseNormLayer::new(geom, scale, pow)),
                out_dim,
            ))
        }
        "cnorm" => {
            let geom = norm_geometry(spec, input_dims)?;
            let scale = req(spec.scale, name, "scale")?;
            let pow = req(spec.pow, name, "pow")?;
            let out_dim = geom.input_len();
            Ok((
                LayerKind::ContrastNorm(ContrastNormLayer::new(geom, scale, pow)),
                out_dim,
            ))
        }
        "softmax" => {
            let dim = *input_dims.first().ok_or_else(|| {
                Error::InvalidParam(name.to_string(), "softmax needs one input".to_string())
            })?;
            Ok((LayerKind::Softmax(SoftmaxLayer::new()), dim))
        }
        tag if tag.starts_with("cost.") => {
            let kind = CostKind::from_tag(tag)?;
            Ok((LayerKind::Cost(CostLayer::new(kind, spec.coeff)), 0))
        }
        other => Err(Error::UnknownLayerType(other.to_string())),
    }
}

fn resolve_or_zero(
    param: &Option<HyperParam>,
    n: usize,
    layer: &str,
    field: &str,
) -> Result<Vec<f32>> {
    match param {
        Some(p) => p.resolve(n, layer, field),
        None => Ok(vec![0.0; n]),
    }
}

fn init_matrix(dim: (usize, usize), init_w: f32, rng: &mut StdRng) -> Matrix {
    Array2::from_shape_fn(dim, |_| rng.gen_range(-init_w..=init_w))
}

fn conv_geometry(spec: &LayerSpec, input_dims: &[usize]) -> Result<ConvGeometry> {
    let name = spec.name.as_str();
    let channels = req(spec.channels, name, "channels")?;
    let img_size = req(spec.img_size, name, "img_size")?;
    let filter_size = req(spec.filter_size, name, "filter_size")?;
    let stride = req(spec.stride, name, "stride")?;
    let padding = spec.padding.unwrap_or(0);
    let filters = req(spec.filters, name, "filters")?;
    if stride == 0 {
        return Err(Error::InvalidParam(name.to_string(), "stride must be > 0".to_string()));
    }
    let span = img_size + 2 * padding;
    if filter_size > span {
        return Err(Error::InvalidParam(
            name.to_string(),
            "filter larger than padded input".to_string(),
        ));
    }
    let modules_x = (span - filter_size) / stride + 1;
    let geom = ConvGeometry {
        channels,
        img_size,
        filters,
        filter_size,
        padding,
        stride,
        modules_x,
    };
    check_spatial_input(name, geom.input_len(), input_dims)?;
    Ok(geom)
}

fn pool_geometry(spec: &LayerSpec, input_dims: &[usize]) -> Result<PoolGeometry> {
    let name = spec.name.as_str();
    let channels = req(spec.channels, name, "channels")?;
    let img_size = req(spec.img_size, name, "img_size")?;
    let size_x = req(spec.size_x, name, "size_x")?;
    let stride = req(spec.stride, name, "stride")?;
    if stride == 0 {
        return Err(Error::InvalidParam(name.to_string(), "stride must be > 0".to_string()));
    }
    let reach = img_size as isize - spec.start - size_x as isize;
    if reach < 0 {
        return Err(Error::InvalidParam(
            name.to_string(),
            "window does not fit the input".to_string(),
        ));
    }
    let outputs_x = (reach as f64 / stride as f64).ceil() as usize + 1;
    let geom = PoolGeometry {
        channels,
        img_size,
        size_x,
        start: spec.start,
        stride,
        outputs_x,
    };
    check_spatial_input(name, geom.input_len(), input_dims)?;
    Ok(geom)
}

fn norm_geometry(spec: &LayerSpec, input_dims: &[usize]) -> Result<NormGeometry> {
    let name = spec.name.as_str();
    let geom = NormGeometry {
        channels: req(spec.channels, name, "channels")?,
        img_size: req(spec.img_size, name, "img_size")?,
        size_x: req(spec.size_x, name, "size_x")?,
    };
    if geom.size_x == 0 {
        return Err(Error::InvalidParam(name.to_string(), "size_x must be > 0".to_string()));
    }
    check_spatial_input(name, geom.input_len(), input_dims)?;
    Ok(geom)
}

fn check_spatial_input(name: &str, expected: usize, input_dims: &[usize]) -> Result<()> {
    match input_dims {
        [dim] if *dim == expected => Ok(()),
        [dim] => Err(Error::InvalidParam(
            name.to_string(),
            format!("geometry expects input width {expected}, input provides {dim}"),
        )),
        _ => Err(Error::InvalidParam(
            name.to_string(),
            "layer takes exactly one input".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, kind: &str) -> LayerSpec {
        serde_json::from_value(serde_json::json!({ "name": name, "type": kind })).unwrap()
    }

    #[test]
    fn test_unknown_layer_type_fails() {
        let err = build_graph(&[spec("x", "blob")], 0);
        assert!(matches!(err, Err(Error::UnknownLayerType(_))));
    }

    #[test]
    fn test_unknown_cost_tag_fails() {
        let err = build_graph(&[spec("x", "cost.hinge")], 0);
        assert!(matches!(err, Err(Error::UnknownCostType(_))));
    }

    #[test]
    fn test_unknown_input_fails() {
        let mut fc = spec("fc1", "fc");
        fc.inputs = vec!["missing".to_string()];
        fc.outputs = Some(2);
        fc.learning_rate = Some(HyperParam::Scalar(0.1));
        let err = build_graph(&[fc], 0);
        assert!(matches!(err, Err(Error::UnknownInput(_, _))));
    }

    #[test]
    fn test_json_round_trip() {
        let json = r#"{
            "name": "conv1", "type": "conv", "inputs": ["images"],
            "neuron": "relu", "channels": 3, "img_size": 8, "filters": 4,
            "filter_size": 3, "stride": 1, "padding": 1, "partial_sum": 4,
            "learning_rate": 0.01, "momentum": 0.9, "weight_decay": 0.0005
        }"#;
        let spec: LayerSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kind, "conv");
        assert!(matches!(spec.learning_rate, Some(HyperParam::Scalar(_))));
        let back = serde_json::to_string(&spec).unwrap();
        let again: LayerSpec = serde_json::from_str(&back).unwrap();
        assert_eq!(again.name, "conv1");
        assert_eq!(again.filters, Some(4));
    }

    #[test]
    fn test_per_input_hyperparams() {
        let json = r#"{ "name": "fc1", "type": "fc", "inputs": ["a", "b"],
                        "outputs": 2, "learning_rate": [0.1, 0.2] }"#;
        let fc: LayerSpec = serde_json::from_str(json).unwrap();
        let lr = fc.learning_rate.as_ref().unwrap();
        assert_eq!(lr.resolve(2, "fc1", "learning_rate").unwrap(), vec![0.1, 0.2]);
        assert!(lr.resolve(3, "fc1", "learning_rate").is_err());
    }

    #[test]
    fn test_specs_from_json_rejects_malformed_input() {
        assert!(matches!(
            specs_from_json(r#"[{ "name": "x" }]"#),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(specs_from_json("[{"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_build_small_classifier() {
        let specs = specs_from_json(
            r#"[
            { "name": "images", "type": "data", "data_idx": 0, "outputs": 2 },
            { "name": "labels", "type": "data", "data_idx": 1, "outputs": 1 },
            { "name": "fc1", "type": "fc", "inputs": ["images"], "outputs": 2,
              "learning_rate": 0.1, "init_w": 0.05 },
            { "name": "probs", "type": "softmax", "inputs": ["fc1"] },
            { "name": "logprob", "type": "cost.logreg", "inputs": ["labels", "probs"] }
        ]"#,
        )
        .unwrap();
        let graph = build_graph(&specs, 42).unwrap();
        assert_eq!(graph.len(), 5);
        let fc1 = graph.layer_named("fc1").unwrap();
        assert_eq!(graph.weight_group_count(fc1), 2);
        graph
            .with_weight_group(fc1, 0, |g| {
                assert_eq!(g.values.dim(), (2, 2));
                assert!(g.values.iter().all(|v| v.abs() <= 0.05));
            })
            .unwrap();
        // same seed reproduces the same initialization
        let graph2 = build_graph(&specs, 42).unwrap();
        let w1 = graph.with_weight_group(fc1, 0, |g| g.values.clone()).unwrap();
        let w2 = graph2.with_weight_group(fc1, 0, |g| g.values.clone()).unwrap();
        assert_eq!(w1, w2);
    }

    #[test]
    fn test_pool_geometry_output_size() {
        let mut pool = spec("pool1", "pool");
        pool.pool = Some("max".to_string());
        pool.channels = Some(1);
        pool.img_size = Some(4);
        pool.size_x = Some(2);
        pool.stride = Some(2);
        let geom = pool_geometry(&pool, &[16]).unwrap();
        assert_eq!(geom.outputs_x, 2);
    }
}
