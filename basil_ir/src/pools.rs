//! String and constant pools
//!
//! The string pool names each section for the linker; the constant pool
//! holds raw data blobs (strings, arrays of doubles) that are emitted once
//! at the program tail and addressed PC-relative at link time.

use serde::{Deserialize, Serialize};

/// Maps section indices to externally visible names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    /// Registers a name and returns its index; an existing name keeps its
    /// original index.
    pub fn register(&mut self, name: &str) -> usize {
        if let Some(i) = self.strings.iter().position(|s| s == name) {
            return i;
        }
        self.strings.push(name.to_string());
        self.strings.len() - 1
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

/// One blob of the program constant pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantData {
    pub bytes: Vec<u8>,
    /// 8-byte alignment is required when the blob holds doubles.
    pub dbl: bool,
}

/// Raw data constants emitted at the program tail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstantPool {
    data: Vec<ConstantData>,
}

impl ConstantPool {
    /// Adds a blob and returns its index for `lca` references.
    pub fn add(&mut self, bytes: Vec<u8>, dbl: bool) -> usize {
        self.data.push(ConstantData { bytes, dbl });
        self.data.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&ConstantData> {
        self.data.get(index)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConstantData> {
        self.data.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_pool_dedups() {
        let mut pool = StringPool::default();
        let a = pool.register("main");
        let b = pool.register("helper");
        let c = pool.register("main");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.name(b), Some("helper"));
    }

    #[test]
    fn test_constant_pool_indices_are_stable() {
        let mut pool = ConstantPool::default();
        let a = pool.add(b"hello\0".to_vec(), false);
        let b = pool.add(vec![0u8; 16], true);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert!(pool.get(b).unwrap().dbl);
    }
}
