use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A concurrent key/value map for application state scoped to a loop or a
/// connection. Values are type-erased; `get` downcasts back to the stored
/// type.
///
/// # Examples
///
/// ```
/// use hive_io::Context;
///
/// let ctx = Context::new();
/// ctx.set("attempts", 3u32);
///
/// assert_eq!(ctx.get::<u32>("attempts").as_deref(), Some(&3));
/// assert!(ctx.get::<String>("attempts").is_none());
/// ```
#[derive(Default)]
pub struct Context {
    map: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    pub fn new() -> Context {
        Context {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        let mut map = self.map.write().unwrap();
        map.insert(key.into(), Arc::new(value));
    }

    /// Returns the value under `key` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let map = self.map.read().unwrap();
        let value = map.get(key)?.clone();
        drop(map);
        value.downcast().ok()
    }

    /// Removes `key`, reporting whether an entry existed.
    pub fn remove(&self, key: &str) -> bool {
        let mut map = self.map.write().unwrap();
        map.remove(key).is_some()
    }
}

#[cfg(test)]
mod test {
    use super::Context;

    #[test]
    fn set_get_remove() {
        let ctx = Context::new();

        ctx.set("name", String::from("worker-1"));
        ctx.set("count", 7usize);

        assert_eq!(ctx.get::<String>("name").as_deref().map(|s| s.as_str()), Some("worker-1"));
        assert_eq!(ctx.get::<usize>("count").as_deref(), Some(&7));
        assert!(ctx.get::<usize>("missing").is_none());

        assert!(ctx.remove("count"));
        assert!(!ctx.remove("count"));
        assert!(ctx.get::<usize>("count").is_none());
    }

    #[test]
    fn overwrite_changes_type() {
        let ctx = Context::new();

        ctx.set("slot", 1u8);
        ctx.set("slot", String::from("two"));

        assert!(ctx.get::<u8>("slot").is_none());
        assert_eq!(ctx.get::<String>("slot").as_deref().map(|s| s.as_str()), Some("two"));
    }
}
