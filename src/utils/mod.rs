//! Utility functions and helpers shared across the crate

pub mod npy;

/// Tensor utilities
pub mod tensor_utils {
    use candle_core::{DType, Device, Result, Tensor, D};

    /// Create a causal mask as u8 tensor (1 = attend, 0 = mask)
    ///
    /// Position i can attend to positions <= i
    pub fn create_causal_mask_u8(
        query_len: usize,
        key_len: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let start_pos = key_len.saturating_sub(query_len);
        let mut mask_data = vec![0u8; query_len * key_len];

        for q in 0..query_len {
            for k in 0..key_len {
                if k <= (start_pos + q) {
                    mask_data[q * key_len + k] = 1;
                }
            }
        }

        let mask = Tensor::from_slice(&mask_data, (query_len, key_len), device)?;
        mask.unsqueeze(0)?.unsqueeze(0)
    }

    /// Convert u8 mask to an additive attention bias (0.0 = attend, large negative = mask)
    ///
    /// A finite fill keeps fully masked rows free of NaNs in the backward pass.
    pub fn mask_to_attention_bias(mask: &Tensor) -> Result<Tensor> {
        let mask_f32 = mask.to_dtype(DType::F32)?;
        let inv_mask = (Tensor::ones_like(&mask_f32)? - &mask_f32)?;
        inv_mask * -1e9
    }

    /// Softmax over the last dim built from primitive ops only, so it
    /// backpropagates
    pub fn grad_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
        let max = x.max_keepdim(D::Minus1)?;
        let shifted = x.broadcast_sub(&max)?;
        let exp = shifted.exp()?;
        let sum = exp.sum_keepdim(D::Minus1)?;
        exp.broadcast_div(&sum)
    }

    /// Reverse a (B, T, ...) tensor along the time axis
    pub fn flip_time(x: &Tensor) -> Result<Tensor> {
        let t = x.dim(1)?;
        let idx: Vec<u32> = (0..t as u32).rev().collect();
        let idx = Tensor::from_vec(idx, t, x.device())?;
        x.index_select(&idx, 1)
    }

    /// One-hot encode integer labels of any shape into `(..., n_items)` f32
    pub fn one_hot(labels: &Tensor, n_items: usize) -> Result<Tensor> {
        let dims = labels.dims().to_vec();
        let values: Vec<u32> = labels.flatten_all()?.to_dtype(DType::U32)?.to_vec1()?;
        let mut data = vec![0f32; values.len() * n_items];
        for (i, &v) in values.iter().enumerate() {
            if (v as usize) < n_items {
                data[i * n_items + v as usize] = 1.0;
            }
        }
        let mut shape = dims;
        shape.push(n_items);
        Tensor::from_vec(data, shape, labels.device())
    }

    /// Min-max normalize along the last dim
    pub fn max_min_norm(x: &Tensor) -> Result<Tensor> {
        let min = x.min_keepdim(D::Minus1)?;
        let shifted = x.broadcast_sub(&min)?;
        let max = shifted.max_keepdim(D::Minus1)?;
        shifted.broadcast_div(&max.maximum(1e-12)?)
    }

    /// Cosine similarity of consecutive frames of a (B, T, D) tensor, shape (B, T - 1)
    pub fn adjacent_cosine_similarity(x: &Tensor) -> Result<Tensor> {
        let t = x.dim(1)?;
        let a = x.narrow(1, 0, t - 1)?;
        let b = x.narrow(1, 1, t - 1)?;
        let dot = (&a * &b)?.sum(D::Minus1)?;
        let na = a.sqr()?.sum(D::Minus1)?.sqrt()?;
        let nb = b.sqr()?.sum(D::Minus1)?.sqrt()?;
        dot / (na * nb)?.maximum(1e-8)?
    }

    /// Normalize a (B, T, C) tensor to zero mean and unit variance along time
    pub fn seq_normalization(x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(1)?;
        let var = x.var_keepdim(1)?;
        x.broadcast_sub(&mean)?.broadcast_div(&(var + 1e-8)?.sqrt()?)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_causal_mask_lower_triangular() {
            let mask = create_causal_mask_u8(3, 3, &Device::Cpu).unwrap();
            let rows: Vec<Vec<u8>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
            assert_eq!(rows, vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]);
        }

        #[test]
        fn test_flip_time() {
            let x = Tensor::arange(0f32, 6., &Device::Cpu)
                .unwrap()
                .reshape((1, 3, 2))
                .unwrap();
            let flipped: Vec<Vec<f32>> = flip_time(&x).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
            assert_eq!(flipped, vec![vec![4., 5.], vec![2., 3.], vec![0., 1.]]);
        }

        #[test]
        fn test_one_hot_shape() {
            let labels = Tensor::new(&[[0u32, 2], [1, 1]], &Device::Cpu).unwrap();
            let out = one_hot(&labels, 3).unwrap();
            assert_eq!(out.dims(), &[2, 2, 3]);
            let sums: Vec<f32> = out.sum((0, 1)).unwrap().to_vec1().unwrap();
            assert_eq!(sums, vec![1., 2., 1.]);
        }

        #[test]
        fn test_max_min_norm_range() {
            let x = Tensor::new(&[[2f32, 4., 6.]], &Device::Cpu).unwrap();
            let out: Vec<Vec<f32>> = max_min_norm(&x).unwrap().to_vec2().unwrap();
            assert_eq!(out, vec![vec![0., 0.5, 1.]]);
        }

        #[test]
        fn test_grad_softmax_sums_to_one() {
            let x = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu).unwrap();
            let s: f32 = grad_softmax_last_dim(&x).unwrap().sum_all().unwrap().to_scalar().unwrap();
            assert!((s - 1.0).abs() < 1e-6);
        }
    }
}
