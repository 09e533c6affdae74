use crate::StepError;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use tracing::warn;

/// Name and value type of a state bag entry.
///
/// Keys shared across steps are declared once as constants so that every
/// reader and writer agrees on the stored type at compile time.
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey<{}>({:?})", type_name::<T>(), self.name)
    }
}

/// First error recorded by a failing step. Never cleared by the runner.
pub const ERROR: StateKey<StepError> = StateKey::new("error");
/// Set by the runner when cancellation stopped the run.
pub const CANCELLED: StateKey<bool> = StateKey::new("cancelled");
/// Set by the runner when a step error stopped the run.
pub const HALTED: StateKey<bool> = StateKey::new("halted");

/// Shared context threaded through every step of one pipeline run.
///
/// Steps execute one at a time and receive the bag by `&mut`, so no locking
/// is involved. Values of any `Send` type can be stored; lookups name the
/// expected type and treat a type mismatch like an absent key.
#[derive(Default)]
pub struct StateBag {
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put<T: Any + Send>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Look up a value the caller knows to be present.
    ///
    /// # Panics
    ///
    /// Panics if `key` is absent or holds a value of another type.
    pub fn get<T: Any>(&self, key: &str) -> &T {
        match self.get_ok(key) {
            Some(value) => value,
            None => panic!(
                "state bag has no value of type {} under key '{key}'",
                type_name::<T>()
            ),
        }
    }

    pub fn get_ok<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    /// Move a value out of the bag. A value of another type is left in place.
    pub fn take<T: Any + Send>(&mut self, key: &str) -> Option<T> {
        let boxed = self.values.remove(key)?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.values.insert(key.to_owned(), other);
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keys currently present, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn put_key<T: Any + Send>(&mut self, key: &StateKey<T>, value: T) {
        self.put(key.name(), value);
    }

    /// Typed variant of [`get`](Self::get).
    ///
    /// # Panics
    ///
    /// Panics if `key` is absent.
    pub fn get_key<T: Any>(&self, key: &StateKey<T>) -> &T {
        self.get(key.name())
    }

    pub fn get_key_ok<T: Any>(&self, key: &StateKey<T>) -> Option<&T> {
        self.get_ok(key.name())
    }

    pub fn get_key_mut<T: Any>(&mut self, key: &StateKey<T>) -> Option<&mut T> {
        self.get_mut(key.name())
    }

    pub fn take_key<T: Any + Send>(&mut self, key: &StateKey<T>) -> Option<T> {
        self.take(key.name())
    }

    pub fn error(&self) -> Option<&StepError> {
        self.get_key_ok(&ERROR)
    }

    pub fn has_error(&self) -> bool {
        self.error().is_some()
    }

    /// Record a step failure. Only the first error is kept; later ones are
    /// logged and dropped. Returns whether `error` was stored.
    pub fn set_error(&mut self, error: StepError) -> bool {
        if let Some(existing) = self.error() {
            warn!("discarding error '{error}', pipeline already failed with '{existing}'");
            return false;
        }
        self.put_key(&ERROR, error);
        true
    }

    pub fn take_error(&mut self) -> Option<StepError> {
        self.take_key(&ERROR)
    }

    pub fn cancelled(&self) -> bool {
        self.get_key_ok(&CANCELLED).copied().unwrap_or(false)
    }

    pub fn halted(&self) -> bool {
        self.get_key_ok(&HALTED).copied().unwrap_or(false)
    }

    pub fn mark_cancelled(&mut self) {
        self.put_key(&CANCELLED, true);
    }

    pub fn mark_halted(&mut self) {
        self.put_key(&HALTED, true);
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBag")
            .field("keys", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const IMAGES: StateKey<BTreeMap<String, String>> = StateKey::new("images");

    #[test]
    fn put_and_get() {
        let mut bag = StateBag::new();
        bag.put("device", "/dev/sdf".to_owned());
        assert_eq!(bag.get::<String>("device"), "/dev/sdf");
        assert!(bag.contains("device"));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn get_ok_tolerates_absence_and_type_mismatch() {
        let mut bag = StateBag::new();
        assert!(bag.get_ok::<String>("missing").is_none());
        bag.put("size", 10_u64);
        assert!(bag.get_ok::<String>("size").is_none());
        assert_eq!(bag.get_ok::<u64>("size"), Some(&10));
    }

    #[test]
    #[should_panic(expected = "under key 'missing'")]
    fn get_panics_when_absent() {
        let bag = StateBag::new();
        let _ = bag.get::<String>("missing");
    }

    #[test]
    fn last_write_wins() {
        let mut bag = StateBag::new();
        bag.put("volume_id", "vol-1".to_owned());
        bag.put("volume_id", "vol-2".to_owned());
        assert_eq!(bag.get::<String>("volume_id"), "vol-2");
    }

    #[test]
    fn take_moves_value_out() {
        let mut bag = StateBag::new();
        bag.put("token", vec![1, 2, 3]);
        assert_eq!(bag.take::<Vec<i32>>("token"), Some(vec![1, 2, 3]));
        assert!(!bag.contains("token"));
        assert_eq!(bag.take::<Vec<i32>>("token"), None);
    }

    #[test]
    fn take_with_wrong_type_leaves_value() {
        let mut bag = StateBag::new();
        bag.put("token", 7_u32);
        assert_eq!(bag.take::<String>("token"), None);
        assert_eq!(bag.get_ok::<u32>("token"), Some(&7));
    }

    #[test]
    fn typed_keys() {
        let mut bag = StateBag::new();
        assert!(bag.get_key_ok(&IMAGES).is_none());
        let mut images = BTreeMap::new();
        images.insert("us-east-1".to_owned(), "img-1".to_owned());
        bag.put_key(&IMAGES, images);
        bag.get_key_mut(&IMAGES)
            .unwrap()
            .insert("eu-west-1".to_owned(), "img-2".to_owned());
        assert_eq!(bag.get_key(&IMAGES).len(), 2);
        assert_eq!(bag.get::<BTreeMap<String, String>>("images").len(), 2);
    }

    #[test]
    fn first_error_wins() {
        let mut bag = StateBag::new();
        assert!(!bag.has_error());
        assert!(bag.set_error(StepError::new("a", "first")));
        assert!(!bag.set_error(StepError::new("b", "second")));
        assert_eq!(bag.error().unwrap().step(), "a");
        let taken = bag.take_error().unwrap();
        assert_eq!(taken.to_string(), "a: first");
    }

    #[test]
    fn runner_flags_default_false() {
        let mut bag = StateBag::new();
        assert!(!bag.cancelled());
        assert!(!bag.halted());
        bag.mark_cancelled();
        bag.mark_halted();
        assert!(bag.cancelled());
        assert!(bag.halted());
    }

    #[test]
    fn keys_are_sorted() {
        let mut bag = StateBag::new();
        bag.put("b", 1_u8);
        bag.put("a", 2_u8);
        assert_eq!(bag.keys(), vec!["a", "b"]);
        assert_eq!(format!("{bag:?}"), r#"StateBag { keys: ["a", "b"] }"#);
    }
}
