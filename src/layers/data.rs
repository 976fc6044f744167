//! Data-source layer: externally fed, never visited backward

use crate::backend::Matrix;

/// Selects one matrix from the driver-supplied input list by index.
#[derive(Debug)]
pub struct DataLayer {
    pub data_idx: usize,
}

impl DataLayer {
    pub fn new(data_idx: usize) -> Self {
        DataLayer { data_idx }
    }

    /// Copy the selected external input into the activation buffer.
    pub fn feed(&self, data: &Matrix, acts: &mut Matrix) {
        if acts.dim() != data.dim() {
            *acts = data.clone();
        } else {
            acts.assign(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_feed_copies_input() {
        let layer = DataLayer::new(0);
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let mut acts = crate::backend::empty();
        layer.feed(&data, &mut acts);
        assert_eq!(acts, data);
    }
}
