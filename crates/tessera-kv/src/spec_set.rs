//! Layer-name to geometry mapping for a whole model

use std::collections::HashMap;

use crate::geometry::{BlockGeometry, GeometryTypeId};
use tessera_types::{Result, TesseraError};

/// Ordered mapping of layer names to cache geometries.
///
/// Insertion order is layer order and is preserved by every query.
#[derive(Debug, Clone, Default)]
pub struct CacheSpecSet {
    layers: Vec<(String, BlockGeometry)>,
    index: HashMap<String, usize>,
}

impl CacheSpecSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(layer_name, geometry)` pairs in layer order
    pub fn from_layers<I, S>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, BlockGeometry)>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for (name, geometry) in layers {
            set.insert(name, geometry)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, layer_name: impl Into<String>, geometry: BlockGeometry) -> Result<()> {
        let layer_name = layer_name.into();
        if self.index.contains_key(&layer_name) {
            return Err(TesseraError::already_exists(format!(
                "layer {} already has a cache geometry",
                layer_name
            )));
        }
        geometry.validate()?;
        self.index.insert(layer_name.clone(), self.layers.len());
        self.layers.push((layer_name, geometry));
        Ok(())
    }

    pub fn get(&self, layer_name: &str) -> Option<&BlockGeometry> {
        self.index.get(layer_name).map(|&i| &self.layers[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BlockGeometry)> {
        self.layers.iter().map(|(name, g)| (name.as_str(), g))
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Every layer shares one type id
    pub fn is_uniform_type(&self) -> Result<bool> {
        let mut ids = self.iter().map(|(_, g)| g.type_id());
        let first = match ids.next() {
            Some(id) => id?,
            None => return Ok(true),
        };
        for id in ids {
            if id? != first {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Every layer has the same page size, whatever its type
    pub fn has_uniform_page_size(&self) -> Result<bool> {
        let mut pages = self.iter().map(|(_, g)| g.page_size_bytes(None));
        let first = match pages.next() {
            Some(page) => page?,
            None => return Ok(true),
        };
        for page in pages {
            if page? != first {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Layers bucketed by type id, buckets in order of first appearance
    pub fn group_by_type(&self) -> Result<Vec<(GeometryTypeId, Vec<String>)>> {
        let mut groups: Vec<(GeometryTypeId, Vec<String>)> = Vec::new();
        for (name, geometry) in self.iter() {
            let type_id = geometry.type_id()?;
            match groups.iter_mut().find(|(id, _)| *id == type_id) {
                Some((_, names)) => names.push(name.to_string()),
                None => groups.push((type_id, vec![name.to_string()])),
            }
        }
        Ok(groups)
    }

    /// Merge every layer's geometry into one
    pub fn merge_all(&self) -> Result<BlockGeometry> {
        let geometries: Vec<BlockGeometry> = self.iter().map(|(_, g)| g.clone()).collect();
        BlockGeometry::merge(&geometries)
    }

    /// Bytes needed across all layers to serve one request of `max_model_len`
    pub fn max_memory_usage_bytes(&self, max_model_len: usize) -> Result<u64> {
        self.iter()
            .map(|(_, g)| g.max_memory_usage_bytes(max_model_len))
            .sum()
    }
}
