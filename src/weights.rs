//! Named transformer parameters and the non-strict overlay used for base weights.

use candle_core::Tensor;
use std::collections::{BTreeMap, HashMap};

use crate::loader::LoaderError;

/// Transformer parameters keyed by their diffusers names.
///
/// Tensors are immutable, so replacing an entry and later putting the old
/// handle back restores the exact original values.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    tensors: BTreeMap<String, Tensor>,
}

/// Outcome of [`ParamStore::overlay`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayReport {
    /// Keys whose value was replaced
    pub applied: Vec<String>,
    /// Keys present in the archive but not in the store, ignored
    pub unknown: Vec<String>,
    /// Store keys the archive did not mention
    pub untouched: usize,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Swap in a new value, returning the previous one
    pub fn replace(&mut self, name: &str, tensor: Tensor) -> Option<Tensor> {
        self.tensors.get_mut(name).map(|slot| std::mem::replace(slot, tensor))
    }

    /// Merge an archive into the store by name.
    ///
    /// Keys missing from the archive keep their value, archive keys the store
    /// does not know are reported and skipped. Every known key is checked for
    /// shape before anything is written, so a mismatch leaves the store as it was.
    pub fn overlay(&mut self, archive: HashMap<String, Tensor>) -> Result<OverlayReport, LoaderError> {
        let mut staged = Vec::with_capacity(archive.len());
        let mut unknown = Vec::new();

        for (name, incoming) in archive {
            let Some(current) = self.tensors.get(&name) else {
                unknown.push(name);
                continue;
            };
            if current.dims() != incoming.dims() {
                return Err(LoaderError::ShapeMismatch {
                    name,
                    expected: current.dims().to_vec(),
                    found: incoming.dims().to_vec(),
                });
            }
            let incoming = incoming
                .to_dtype(current.dtype())?
                .to_device(current.device())?;
            staged.push((name, incoming));
        }

        let mut applied: Vec<String> = Vec::with_capacity(staged.len());
        for (name, tensor) in staged {
            self.tensors.insert(name.clone(), tensor);
            applied.push(name);
        }
        applied.sort();
        unknown.sort();

        Ok(OverlayReport {
            untouched: self.tensors.len() - applied.len(),
            applied,
            unknown,
        })
    }
}

impl From<HashMap<String, Tensor>> for ParamStore {
    fn from(tensors: HashMap<String, Tensor>) -> Self {
        Self {
            tensors: tensors.into_iter().collect(),
        }
    }
}
