//! Handle to the resident model

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use super::backend::LoadedModel;
use crate::catalog::ModelDescriptor;

/// Capability to use the resident model. Cheap to clone; all clones refer to
/// the same loaded weights.
#[derive(Clone)]
pub struct ModelHandle {
    model: Arc<dyn LoadedModel>,
    descriptor: &'static ModelDescriptor,
    loaded_at: DateTime<Utc>,
}

impl ModelHandle {
    pub(crate) fn new(model: Arc<dyn LoadedModel>, descriptor: &'static ModelDescriptor) -> Self {
        Self {
            model,
            descriptor,
            loaded_at: Utc::now(),
        }
    }

    pub fn model_id(&self) -> &'static str {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> &'static ModelDescriptor {
        self.descriptor
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub(crate) fn model(&self) -> &Arc<dyn LoadedModel> {
        &self.model
    }

    pub(crate) fn into_model(self) -> Arc<dyn LoadedModel> {
        self.model
    }

    /// True if both handles point at the same loaded weights
    pub fn same_model(&self, other: &ModelHandle) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.model) as *const (),
            Arc::as_ptr(&other.model) as *const (),
        )
    }
}

impl PartialEq for ModelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_model(other)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.descriptor.id)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}
