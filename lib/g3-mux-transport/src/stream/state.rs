/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::any::Any;
use std::collections::HashMap;

/// Typed values attached to a stream by the upper layer.
#[derive(Default)]
pub struct StateMap {
    inner: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl StateMap {
    /// Insert a value, returning true if an old value was replaced.
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T) -> bool
    where
        T: Any + Send + Sync,
    {
        self.inner.insert(key.into(), Box::new(value)).is_some()
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.inner.get(key)?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.inner.get_mut(key)?.downcast_mut()
    }

    /// Remove the value only if it has type `T`.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.inner.get(key)?.is::<T>() {
            return None;
        }
        let v = self.inner.remove(key)?;
        v.downcast().ok().map(|v| *v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access() {
        let mut map = StateMap::default();
        assert!(!map.insert("count", 1usize));
        assert!(map.insert("count", 2usize));
        assert_eq!(map.get::<usize>("count"), Some(&2));
        assert!(map.get::<u32>("count").is_none());

        *map.get_mut::<usize>("count").unwrap() += 1;
        assert_eq!(map.get::<usize>("count"), Some(&3));

        assert!(map.remove::<String>("count").is_none());
        assert!(map.contains_key("count"));
        assert_eq!(map.remove::<usize>("count"), Some(3));
        assert!(map.is_empty());
    }
}
