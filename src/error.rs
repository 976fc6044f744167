//! Error types for graph construction and pass execution

use thiserror::Error;

/// Errors raised while building a layer graph or driving a pass.
///
/// Construction problems (unknown type tags, bad wiring, invalid
/// hyperparameters) are fatal: the graph is unusable. Pass-time problems are
/// limited to driving a data layer without supplying its input; everything
/// else in the hot path is a programmer error and guarded by assertions.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown layer type: {0}")]
    UnknownLayerType(String),

    #[error("unknown cost type: {0}")]
    UnknownCostType(String),

    #[error("unknown pooling kind: {0}")]
    UnknownPoolKind(String),

    #[error("unknown neuron type: {0}")]
    UnknownNeuron(String),

    #[error("layer '{0}': no data supplied")]
    NoData(String),

    #[error("layer '{0}': unknown input layer '{1}'")]
    UnknownInput(String, String),

    #[error("layer '{0}': {1}")]
    InvalidParam(String, String),

    #[error("graph contains a cycle through layer '{0}'")]
    Cycle(String),

    #[error("invalid layer id {0}")]
    InvalidLayerId(usize),

    #[error("layer '{0}' has no weight group {1}")]
    NoSuchWeightGroup(String, usize),

    #[error("layer '{0}' is not a cost layer")]
    NotACostLayer(String),

    #[error("invalid layer configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownLayerType("blob".to_string());
        assert!(format!("{err}").contains("unknown layer type"));
        assert!(format!("{err}").contains("blob"));

        let err = Error::NoData("images".to_string());
        assert!(format!("{err}").contains("no data supplied"));

        let err = Error::UnknownPoolKind("median".to_string());
        assert!(format!("{err}").contains("median"));

        let err = Error::InvalidParam("conv1".to_string(), "stride must be > 0".to_string());
        assert!(format!("{err}").contains("conv1"));
        assert!(format!("{err}").contains("stride"));
    }
}
