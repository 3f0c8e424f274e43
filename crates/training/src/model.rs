//! Embedding model contract and reference implementation
//!
//! In search there are two entities, each possibly multi-domain: the query
//! and the item. The model embeds both and is otherwise opaque to the core:
//! the driver sees embeddings, parameter handles for its optimizers, and a
//! backward surface that accepts embedding-space gradients. What happens
//! between parameters and embeddings is the model's business.

use serde::{Deserialize, Serialize};

use embedtune_core::{Error, QueryItem, Result};

use crate::items::DownloadedItem;

/// An embedding vector
pub type Vector = Vec<f32>;

/// One trainable parameter tensor with its gradient buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    /// Parameter values
    pub values: Vec<f32>,
    /// Accumulated gradient, same length as `values`
    pub grad: Vec<f32>,
    /// Frozen parameters are skipped by optimizers
    pub frozen: bool,
}

impl ParamTensor {
    /// Create a tensor with a zeroed gradient
    pub fn new(values: Vec<f32>) -> Self {
        let grad = vec![0.0; values.len()];
        ParamTensor {
            values,
            grad,
            frozen: false,
        }
    }

    /// Reset the gradient buffer
    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The embedding model as seen by the fine-tuning driver
pub trait EmbeddingModel: Send {
    /// Embedding dimension of both query and item vectors
    fn embedding_dim(&self) -> usize;

    /// Embed a query
    fn embed_query(&self, query: &QueryItem) -> Result<Vector>;

    /// Embed a batch of items; row `i` corresponds to `items[i]`
    fn embed_items(&self, items: &[DownloadedItem]) -> Result<Vec<Vector>>;

    /// Whether query and items share one sub-model (then only the items
    /// optimizer is used)
    fn same_query_and_items(&self) -> bool {
        false
    }

    /// Freeze the first `num_layers` layers of the query sub-model
    fn fix_query_layers(&mut self, num_layers: u32);

    /// Freeze the first `num_layers` layers of the items sub-model
    fn fix_item_layers(&mut self, num_layers: u32);

    /// Unfreeze the query sub-model
    fn unfix_query_layers(&mut self);

    /// Unfreeze the items sub-model
    fn unfix_item_layers(&mut self);

    /// Accumulate the gradient of the loss w.r.t. a query embedding into
    /// the query sub-model's parameter gradients
    fn backward_query(&mut self, query: &QueryItem, grad: &[f32]) -> Result<()>;

    /// Accumulate the gradients of the loss w.r.t. item embeddings into the
    /// items sub-model's parameter gradients; `grads[i]` pairs `items[i]`
    fn backward_items(&mut self, items: &[DownloadedItem], grads: &[Vector]) -> Result<()>;

    /// Mutable handles to the query sub-model parameters
    fn query_parameters(&mut self) -> Vec<&mut ParamTensor>;

    /// Mutable handles to the items sub-model parameters
    fn item_parameters(&mut self) -> Vec<&mut ParamTensor>;

    /// Zero every parameter gradient
    fn zero_grad(&mut self) {
        for tensor in self.query_parameters() {
            tensor.zero_grad();
        }
        for tensor in self.item_parameters() {
            tensor.zero_grad();
        }
    }

    /// Serialize the model to an artifact blob
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

/// Decodes model artifact blobs back into models
///
/// Each plugin knows its concrete model type; the search and driver layers
/// only see this trait.
pub trait ModelCodec: Send + Sync {
    /// Decode an artifact blob
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn EmbeddingModel>>;
}

/// Reference model: trainable diagonal adapters over a frozen base encoder
///
/// The base encoder maps text deterministically into a fixed vector; each
/// adapter layer is an elementwise scale. Lightweight enough for tests and
/// local runs while exercising the full driver surface (layer freezing,
/// per-sub-model optimizers, serialization).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearAdapterModel {
    dim: usize,
    query_layers: Vec<ParamTensor>,
    item_layers: Vec<ParamTensor>,
    same_query_and_items: bool,
}

impl LinearAdapterModel {
    /// Create a model with `num_layers` adapter layers per sub-model, all
    /// initialized to identity
    pub fn new(dim: usize, num_layers: usize) -> Result<Self> {
        if dim == 0 {
            return Err(Error::validation("embedding dimension must be positive"));
        }
        if num_layers == 0 {
            return Err(Error::validation("adapter needs at least one layer"));
        }
        let identity = || ParamTensor::new(vec![1.0; dim]);
        Ok(LinearAdapterModel {
            dim,
            query_layers: (0..num_layers).map(|_| identity()).collect(),
            item_layers: (0..num_layers).map(|_| identity()).collect(),
            same_query_and_items: false,
        })
    }

    /// Share one sub-model between queries and items
    pub fn shared(mut self) -> Self {
        self.same_query_and_items = true;
        self
    }

    /// Decode from an artifact blob
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deterministic base embedding of a text
    fn base_vector(&self, text: &str) -> Vector {
        use rand::{Rng, SeedableRng};
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in text.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(hash);
        let mut v: Vector = (0..self.dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        v.iter_mut().for_each(|x| *x /= norm);
        v
    }

    fn query_text(query: &QueryItem) -> Result<String> {
        match query.as_text() {
            Some(text) => Ok(text.to_string()),
            None => Err(Error::validation(
                "the adapter reference model only embeds text queries",
            )),
        }
    }

    fn item_text(item: &DownloadedItem) -> String {
        match &item.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn forward(layers: &[ParamTensor], base: &[f32]) -> Vector {
        let mut out = base.to_vec();
        for layer in layers {
            for (o, w) in out.iter_mut().zip(&layer.values) {
                *o *= w;
            }
        }
        out
    }

    /// Accumulate d loss / d output into layer gradients
    ///
    /// With diagonal layers the output is `base * w_1 * ... * w_L`
    /// elementwise, so the gradient for layer k divides the full product by
    /// that layer's weights, guarded against zeros by recomputing prefixes.
    fn backward(layers: &mut [ParamTensor], base: &[f32], grad: &[f32]) {
        let num_layers = layers.len();
        // prefix[k][j] = base[j] * w_0..w_{k-1}[j]
        let mut prefix = Vec::with_capacity(num_layers + 1);
        prefix.push(base.to_vec());
        for layer in layers.iter() {
            let prev = prefix.last().unwrap();
            let next: Vector = prev
                .iter()
                .zip(&layer.values)
                .map(|(p, w)| p * w)
                .collect();
            prefix.push(next);
        }
        // suffix[k][j] = w_k..w_{L-1}[j]
        let mut suffix = vec![vec![1.0; grad.len()]; num_layers + 1];
        for k in (0..num_layers).rev() {
            for j in 0..grad.len() {
                suffix[k][j] = layers[k].values[j] * suffix[k + 1][j];
            }
        }
        for (k, layer) in layers.iter_mut().enumerate() {
            if layer.frozen {
                continue;
            }
            for j in 0..grad.len() {
                layer.grad[j] += grad[j] * prefix[k][j] * suffix[k + 1][j];
            }
        }
    }

    fn fix_layers(layers: &mut [ParamTensor], num_layers: u32) {
        for (index, layer) in layers.iter_mut().enumerate() {
            layer.frozen = (index as u32) < num_layers;
        }
    }
}

impl EmbeddingModel for LinearAdapterModel {
    fn embedding_dim(&self) -> usize {
        self.dim
    }

    fn embed_query(&self, query: &QueryItem) -> Result<Vector> {
        let text = Self::query_text(query)?;
        let base = self.base_vector(&text);
        let layers = if self.same_query_and_items {
            &self.item_layers
        } else {
            &self.query_layers
        };
        Ok(Self::forward(layers, &base))
    }

    fn embed_items(&self, items: &[DownloadedItem]) -> Result<Vec<Vector>> {
        items
            .iter()
            .map(|item| {
                let base = self.base_vector(&Self::item_text(item));
                Ok(Self::forward(&self.item_layers, &base))
            })
            .collect()
    }

    fn same_query_and_items(&self) -> bool {
        self.same_query_and_items
    }

    fn fix_query_layers(&mut self, num_layers: u32) {
        Self::fix_layers(&mut self.query_layers, num_layers);
    }

    fn fix_item_layers(&mut self, num_layers: u32) {
        Self::fix_layers(&mut self.item_layers, num_layers);
    }

    fn unfix_query_layers(&mut self) {
        Self::fix_layers(&mut self.query_layers, 0);
    }

    fn unfix_item_layers(&mut self) {
        Self::fix_layers(&mut self.item_layers, 0);
    }

    fn backward_query(&mut self, query: &QueryItem, grad: &[f32]) -> Result<()> {
        let text = Self::query_text(query)?;
        let base = self.base_vector(&text);
        let layers = if self.same_query_and_items {
            &mut self.item_layers
        } else {
            &mut self.query_layers
        };
        Self::backward(layers, &base, grad);
        Ok(())
    }

    fn backward_items(&mut self, items: &[DownloadedItem], grads: &[Vector]) -> Result<()> {
        if items.len() != grads.len() {
            return Err(Error::validation(
                "items and gradients must have the same length",
            ));
        }
        for (item, grad) in items.iter().zip(grads) {
            let base = self.base_vector(&Self::item_text(item));
            Self::backward(&mut self.item_layers, &base, grad);
        }
        Ok(())
    }

    fn query_parameters(&mut self) -> Vec<&mut ParamTensor> {
        if self.same_query_and_items {
            return Vec::new();
        }
        self.query_layers.iter_mut().collect()
    }

    fn item_parameters(&mut self) -> Vec<&mut ParamTensor> {
        self.item_layers.iter_mut().collect()
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Codec for the reference adapter model
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearAdapterCodec;

impl ModelCodec for LinearAdapterCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn EmbeddingModel>> {
        Ok(Box::new(LinearAdapterModel::from_bytes(bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, text: &str) -> DownloadedItem {
        DownloadedItem {
            id: id.to_string(),
            payload: serde_json::Value::String(text.to_string()),
        }
    }

    #[test]
    fn test_construction_validation() {
        assert!(LinearAdapterModel::new(0, 1).is_err());
        assert!(LinearAdapterModel::new(8, 0).is_err());
        LinearAdapterModel::new(8, 2).unwrap();
    }

    #[test]
    fn test_base_embedding_deterministic() {
        let model = LinearAdapterModel::new(8, 2).unwrap();
        let a = model.embed_query(&QueryItem::text("hat")).unwrap();
        let b = model.embed_query(&QueryItem::text("hat")).unwrap();
        let c = model.embed_query(&QueryItem::text("shoe")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_identity_adapters_preserve_norm() {
        let model = LinearAdapterModel::new(16, 2).unwrap();
        let v = model.embed_query(&QueryItem::text("hat")).unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_embed_items_order() {
        let model = LinearAdapterModel::new(8, 1).unwrap();
        let vectors = model
            .embed_items(&[item("a", "alpha"), item("b", "beta")])
            .unwrap();
        assert_eq!(vectors.len(), 2);
        let direct = model.embed_items(&[item("b", "beta")]).unwrap();
        assert_eq!(vectors[1], direct[0]);
    }

    #[test]
    fn test_image_query_rejected() {
        let model = LinearAdapterModel::new(8, 1).unwrap();
        let err = model
            .embed_query(&QueryItem::Image { bytes: vec![0] })
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_fix_layers_marks_frozen_prefix() {
        let mut model = LinearAdapterModel::new(4, 3).unwrap();
        model.fix_query_layers(2);
        let frozen: Vec<bool> = model.query_parameters().iter().map(|p| p.frozen).collect();
        assert_eq!(frozen, vec![true, true, false]);

        model.unfix_query_layers();
        assert!(model.query_parameters().iter().all(|p| !p.frozen));
    }

    #[test]
    fn test_backward_accumulates_into_unfrozen_layers() {
        let mut model = LinearAdapterModel::new(4, 2).unwrap();
        model.fix_item_layers(1);
        let items = [item("a", "alpha")];
        let grads = vec![vec![1.0; 4]];
        model.backward_items(&items, &grads).unwrap();

        let params = model.item_parameters();
        assert!(params[0].grad.iter().all(|g| *g == 0.0), "frozen layer untouched");
        assert!(params[1].grad.iter().any(|g| *g != 0.0));
    }

    #[test]
    fn test_backward_gradient_matches_finite_difference() {
        let mut model = LinearAdapterModel::new(4, 2).unwrap();
        let items = [item("a", "alpha")];
        let upstream = vec![vec![0.5, -1.0, 2.0, 0.25]];
        model.backward_items(&items, &upstream).unwrap();
        let analytic = model.item_parameters()[1].grad.clone();

        // loss = sum(upstream * output); perturb one weight of layer 1
        let eps = 1e-3_f32;
        let loss = |m: &LinearAdapterModel| -> f32 {
            let out = &m.embed_items(&items).unwrap()[0];
            out.iter().zip(&upstream[0]).map(|(o, u)| o * u).sum()
        };
        let mut plus = model.clone();
        plus.item_layers[1].values[2] += eps;
        let mut minus = model.clone();
        minus.item_layers[1].values[2] -= eps;
        let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
        assert!(
            (analytic[2] - numeric).abs() < 1e-2,
            "analytic {} vs numeric {}",
            analytic[2],
            numeric
        );
    }

    #[test]
    fn test_zero_grad_clears_buffers() {
        let mut model = LinearAdapterModel::new(4, 1).unwrap();
        model
            .backward_items(&[item("a", "alpha")], &[vec![1.0; 4]])
            .unwrap();
        model.zero_grad();
        assert!(model
            .item_parameters()
            .iter()
            .all(|p| p.grad.iter().all(|g| *g == 0.0)));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let model = LinearAdapterModel::new(8, 2).unwrap();
        let bytes = model.to_bytes().unwrap();
        let restored = LinearAdapterModel::from_bytes(&bytes).unwrap();
        let q = QueryItem::text("hat");
        assert_eq!(
            model.embed_query(&q).unwrap(),
            restored.embed_query(&q).unwrap()
        );
    }

    #[test]
    fn test_shared_model_has_no_query_parameters() {
        let mut model = LinearAdapterModel::new(4, 1).unwrap().shared();
        assert!(model.same_query_and_items());
        assert!(model.query_parameters().is_empty());
        assert_eq!(model.item_parameters().len(), 1);
    }

    #[test]
    fn test_shared_model_embeds_query_through_item_layers() {
        let mut model = LinearAdapterModel::new(4, 1).unwrap().shared();
        model.item_layers[0].values = vec![2.0; 4];
        let q = model.embed_query(&QueryItem::text("hat")).unwrap();
        let base = model.base_vector("hat");
        for (out, b) in q.iter().zip(&base) {
            assert!((out - b * 2.0).abs() < 1e-6);
        }
    }
}
