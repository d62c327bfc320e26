//! Shared read-only model state.
//!
//! Weight loading lives outside this crate. Whatever loads the weights
//! implements [`WeightProvider`]; [`ModelContext::init`] wraps it in a
//! reference-counted handle that every component needing model facts
//! receives explicitly. [`ModelContext::teardown`] ends the context's
//! lifetime; handles still held elsewhere observe it through
//! [`ModelContext::is_active`].

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::DataType;
use crate::error::{Error, Result};

/// Source of model facts the execution core depends on.
pub trait WeightProvider: Send + Sync + fmt::Debug {
    /// Weights are resident and usable.
    fn is_ready(&self) -> bool;

    /// Model layers held by this process (its pipeline stage).
    fn layer_range(&self) -> Range<usize>;

    /// This process coordinates the others (rank 0).
    fn is_chief(&self) -> bool;

    /// Element type the weights and KV cache use.
    fn data_type(&self) -> DataType;
}

/// Provider for weights that are already resident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticWeights {
    layers: Range<usize>,
    chief: bool,
    data_type: DataType,
}

impl StaticWeights {
    /// All of `num_layers` on a chief process.
    pub fn new(num_layers: usize, data_type: DataType) -> Self {
        Self {
            layers: 0..num_layers,
            chief: true,
            data_type,
        }
    }

    pub fn with_layer_range(mut self, layers: Range<usize>) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_chief(mut self, chief: bool) -> Self {
        self.chief = chief;
        self
    }
}

impl WeightProvider for StaticWeights {
    fn is_ready(&self) -> bool {
        true
    }

    fn layer_range(&self) -> Range<usize> {
        self.layers.clone()
    }

    fn is_chief(&self) -> bool {
        self.chief
    }

    fn data_type(&self) -> DataType {
        self.data_type
    }
}

#[derive(Debug)]
struct ContextInner {
    weights: Box<dyn WeightProvider>,
    active: AtomicBool,
}

/// Reference-counted handle to the model's shared state.
#[derive(Debug, Clone)]
pub struct ModelContext {
    inner: Arc<ContextInner>,
}

impl ModelContext {
    /// Create the context once the provider's weights are ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the weights are not ready or hold no layers.
    pub fn init(weights: impl WeightProvider + 'static) -> Result<Self> {
        if !weights.is_ready() {
            return Err(Error::Config("model weights are not ready".into()));
        }
        if weights.layer_range().is_empty() {
            return Err(Error::Config("model context holds no layers".into()));
        }
        info!(
            layers = ?weights.layer_range(),
            chief = weights.is_chief(),
            data_type = ?weights.data_type(),
            "model context initialized"
        );
        Ok(Self {
            inner: Arc::new(ContextInner {
                weights: Box::new(weights),
                active: AtomicBool::new(true),
            }),
        })
    }

    /// End the context's lifetime for every handle.
    pub fn teardown(self) {
        self.inner.active.store(false, Ordering::Release);
        info!(handles = Arc::strong_count(&self.inner), "model context torn down");
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn layer_range(&self) -> Range<usize> {
        self.inner.weights.layer_range()
    }

    pub fn num_layers(&self) -> usize {
        self.layer_range().len()
    }

    pub fn is_chief(&self) -> bool {
        self.inner.weights.is_chief()
    }

    pub fn data_type(&self) -> DataType {
        self.inner.weights.data_type()
    }

    /// Number of live handles.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Loading;

    impl WeightProvider for Loading {
        fn is_ready(&self) -> bool {
            false
        }
        fn layer_range(&self) -> Range<usize> {
            0..1
        }
        fn is_chief(&self) -> bool {
            true
        }
        fn data_type(&self) -> DataType {
            DataType::Float16
        }
    }

    #[test]
    fn test_init_requires_ready_weights() {
        assert!(ModelContext::init(Loading).is_err());
        assert!(ModelContext::init(StaticWeights::new(0, DataType::Float16)).is_err());
    }

    #[test]
    fn test_shared_handles_and_teardown() {
        let weights = StaticWeights::new(32, DataType::BFloat16)
            .with_layer_range(16..32)
            .with_chief(false);
        let context = ModelContext::init(weights).unwrap();
        let shared = context.clone();
        assert_eq!(shared.handle_count(), 2);
        assert_eq!(shared.layer_range(), 16..32);
        assert_eq!(shared.num_layers(), 16);
        assert!(!shared.is_chief());
        assert_eq!(shared.data_type(), DataType::BFloat16);

        context.teardown();
        assert!(!shared.is_active());
        assert_eq!(shared.handle_count(), 1);
    }
}
