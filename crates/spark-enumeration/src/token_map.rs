//! 并行枚举的“令牌 → 元素”映射。
//!
//! - 启用 `concurrent-map`（默认）时使用 `DashMap` 分片表，插入与移除都是原子操作；
//! - 关闭该特性时退化为 `parking_lot::Mutex<HashMap>` 粗粒度锁，锁只包住单次映射操作，从不跨越 `.await`。

#[cfg(feature = "concurrent-map")]
mod imp {
    use dashmap::{DashMap, mapref::entry::Entry};

    #[derive(Debug)]
    pub(crate) struct TokenMap<T> {
        inner: DashMap<u64, T>,
    }

    impl<T> TokenMap<T> {
        pub(crate) fn new() -> Self {
            Self {
                inner: DashMap::new(),
            }
        }

        /// 插入新条目；令牌已存在时原样退回元素。
        pub(crate) fn insert_new(&self, token: u64, item: T) -> Result<(), T> {
            match self.inner.entry(token) {
                Entry::Occupied(_) => Err(item),
                Entry::Vacant(vacant) => {
                    vacant.insert(item);
                    Ok(())
                }
            }
        }

        pub(crate) fn remove(&self, token: u64) -> Option<T> {
            self.inner.remove(&token).map(|(_, item)| item)
        }

        pub(crate) fn clear(&self) {
            self.inner.clear();
        }

        pub(crate) fn len(&self) -> usize {
            self.inner.len()
        }
    }
}

#[cfg(not(feature = "concurrent-map"))]
mod imp {
    use std::collections::{HashMap, hash_map::Entry};

    use parking_lot::Mutex;

    #[derive(Debug)]
    pub(crate) struct TokenMap<T> {
        inner: Mutex<HashMap<u64, T>>,
    }

    impl<T> TokenMap<T> {
        pub(crate) fn new() -> Self {
            Self {
                inner: Mutex::new(HashMap::new()),
            }
        }

        pub(crate) fn insert_new(&self, token: u64, item: T) -> Result<(), T> {
            match self.inner.lock().entry(token) {
                Entry::Occupied(_) => Err(item),
                Entry::Vacant(vacant) => {
                    vacant.insert(item);
                    Ok(())
                }
            }
        }

        pub(crate) fn remove(&self, token: u64) -> Option<T> {
            self.inner.lock().remove(&token)
        }

        pub(crate) fn clear(&self) {
            self.inner.lock().clear();
        }

        pub(crate) fn len(&self) -> usize {
            self.inner.lock().len()
        }
    }
}

pub(crate) use imp::TokenMap;

#[cfg(test)]
mod tests {
    use super::TokenMap;

    #[test]
    fn duplicate_insert_returns_the_rejected_item() {
        let map = TokenMap::new();
        assert!(map.insert_new(1, "first").is_ok());
        assert_eq!(map.insert_new(1, "second"), Err("second"));
        assert_eq!(map.remove(1), Some("first"));
        assert_eq!(map.remove(1), None);
    }
}
