use std::sync::Arc;

use songfall_proto::source::SourceDescriptor;

use crate::error::RegistryError;

/// Ordered fallback chain.  Order is the priority and never changes after
/// construction, so clones share one backing slice.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Arc<[SourceDescriptor]>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<SourceDescriptor>) -> Result<Self, RegistryError> {
        if sources.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(Self {
            sources: sources.into(),
        })
    }

    pub fn get(&self, index: usize) -> Option<&SourceDescriptor> {
        self.sources.get(index)
    }

    pub fn size(&self) -> usize {
        self.sources.len()
    }

    /// Index after `index`, wrapping.  Used for manual switching; automatic
    /// fallback is bounded by the attempt counter, not by this wraparound.
    pub fn next(&self, index: usize) -> usize {
        (index + 1) % self.sources.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.iter()
    }
}
