//! Caller-supplied capabilities: key order, serialization and deletion.
//!
//! The engine never looks inside keys or values. Everything it needs to
//! know about them comes from a [`Schema`], a set of statically dispatched
//! capabilities chosen by the caller.

use crate::serializer::{BytesSerializer, DeletableSerializer, Serializer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;

/// Total order over keys.
pub trait KeyComparator<K>: Send + Sync + 'static {
    /// Compares two keys.
    fn compare(a: &K, b: &K) -> Ordering;
}

/// Orders keys by their [`Ord`] implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    fn compare(a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Deletion predicate and marking mutator over values.
pub trait DeletionMarker<V>: Send + Sync + 'static {
    /// Returns true if the value is a tombstone.
    fn is_deleted(value: &V) -> bool;

    /// Turns the value into a tombstone.
    fn mark_deleted(value: &mut V);
}

/// A value paired with a deletion flag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Deletable<T> {
    /// The payload.
    pub value: T,
    /// Whether this is a tombstone.
    pub deleted: bool,
}

impl<T> Deletable<T> {
    /// Creates a live value.
    pub fn new(value: T) -> Self {
        Self {
            value,
            deleted: false,
        }
    }
}

impl<T: Default> Deletable<T> {
    /// Creates a tombstone.
    #[must_use]
    pub fn tombstone() -> Self {
        Self {
            value: T::default(),
            deleted: true,
        }
    }
}

/// [`DeletionMarker`] for [`Deletable`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletableMarker;

impl<T: 'static> DeletionMarker<Deletable<T>> for DeletableMarker {
    fn is_deleted(value: &Deletable<T>) -> bool {
        value.deleted
    }

    fn mark_deleted(value: &mut Deletable<T>) {
        value.deleted = true;
    }
}

/// The capability set an engine is instantiated with.
///
/// # Example
///
/// ```rust
/// use tierdb_core::{
///     Deletable, DeletableMarker, DeletableSerializer, OrdComparator, Schema,
///     StringSerializer, U64Serializer,
/// };
///
/// struct Users;
///
/// impl Schema for Users {
///     type Key = u64;
///     type Value = Deletable<String>;
///     type Comparator = OrdComparator;
///     type KeySerializer = U64Serializer;
///     type ValueSerializer = DeletableSerializer<StringSerializer>;
///     type Deletion = DeletableMarker;
/// }
/// ```
pub trait Schema: Send + Sync + 'static {
    /// Key type.
    type Key: Clone + fmt::Debug + Send + Sync + 'static;
    /// Value type. `Default` supplies the value marked deleted when a key
    /// without a previous value is deleted.
    type Value: Clone + fmt::Debug + Default + Send + Sync + 'static;
    /// Key order.
    type Comparator: KeyComparator<Self::Key>;
    /// Key serializer.
    type KeySerializer: Serializer<Self::Key>;
    /// Value serializer.
    type ValueSerializer: Serializer<Self::Value>;
    /// Deletion predicate and mutator.
    type Deletion: DeletionMarker<Self::Value>;
}

/// Compares two keys with the schema comparator.
pub(crate) fn compare_keys<S: Schema>(a: &S::Key, b: &S::Key) -> Ordering {
    S::Comparator::compare(a, b)
}

/// Applies the schema's deletion predicate.
pub(crate) fn is_deleted<S: Schema>(value: &S::Value) -> bool {
    S::Deletion::is_deleted(value)
}

/// A key ordered by its schema comparator, usable in ordered collections.
pub(crate) struct SortKey<S: Schema>(pub S::Key, PhantomData<fn() -> S>);

impl<S: Schema> SortKey<S> {
    pub(crate) fn new(key: S::Key) -> Self {
        Self(key, PhantomData)
    }
}

impl<S: Schema> Clone for SortKey<S> {
    fn clone(&self) -> Self {
        Self::new(self.0.clone())
    }
}

impl<S: Schema> fmt::Debug for SortKey<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<S: Schema> PartialEq for SortKey<S> {
    fn eq(&self, other: &Self) -> bool {
        compare_keys::<S>(&self.0, &other.0) == Ordering::Equal
    }
}

impl<S: Schema> Eq for SortKey<S> {}

impl<S: Schema> PartialOrd for SortKey<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S: Schema> Ord for SortKey<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys::<S>(&self.0, &other.0)
    }
}

/// Type names of a schema's capabilities, stored in the metadata so a
/// reopen with a different schema is detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaTypes {
    /// Comparator type name.
    pub comparer_type: String,
    /// Key type name.
    pub key_type: String,
    /// Value type name.
    pub value_type: String,
    /// Key serializer type name.
    pub key_serializer_type: String,
    /// Value serializer type name.
    pub value_serializer_type: String,
}

impl SchemaTypes {
    /// Collects the type names of `S`.
    #[must_use]
    pub fn of<S: Schema>() -> Self {
        Self {
            comparer_type: std::any::type_name::<S::Comparator>().to_string(),
            key_type: std::any::type_name::<S::Key>().to_string(),
            value_type: std::any::type_name::<S::Value>().to_string(),
            key_serializer_type: std::any::type_name::<S::KeySerializer>().to_string(),
            value_serializer_type: std::any::type_name::<S::ValueSerializer>().to_string(),
        }
    }
}

/// Byte-string keys and deletable byte-string values.
///
/// Keys order lexicographically; a proper prefix sorts first.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSchema;

impl Schema for BytesSchema {
    type Key = Vec<u8>;
    type Value = Deletable<Vec<u8>>;
    type Comparator = OrdComparator;
    type KeySerializer = BytesSerializer;
    type ValueSerializer = DeletableSerializer<BytesSerializer>;
    type Deletion = DeletableMarker;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Reversed;

    impl KeyComparator<u64> for Reversed {
        fn compare(a: &u64, b: &u64) -> Ordering {
            b.cmp(a)
        }
    }

    struct ReversedSchema;

    impl Schema for ReversedSchema {
        type Key = u64;
        type Value = Deletable<Vec<u8>>;
        type Comparator = Reversed;
        type KeySerializer = crate::serializer::U64Serializer;
        type ValueSerializer = DeletableSerializer<BytesSerializer>;
        type Deletion = DeletableMarker;
    }

    #[test]
    fn sort_key_follows_schema_comparator() {
        let mut map = BTreeMap::new();
        for k in [1u64, 5, 3] {
            map.insert(SortKey::<ReversedSchema>::new(k), ());
        }
        let keys: Vec<u64> = map.keys().map(|k| k.0).collect();
        assert_eq!(keys, vec![5, 3, 1]);
    }

    #[test]
    fn deletable_marker() {
        let mut value = Deletable::new(b"x".to_vec());
        assert!(!DeletableMarker::is_deleted(&value));
        DeletableMarker::mark_deleted(&mut value);
        assert!(DeletableMarker::is_deleted(&value));
        assert!(Deletable::<Vec<u8>>::tombstone().deleted);
    }

    #[test]
    fn bytes_schema_prefix_sorts_first() {
        let a = b"ab".to_vec();
        let b = b"abc".to_vec();
        assert_eq!(compare_keys::<BytesSchema>(&a, &b), Ordering::Less);
    }

    #[test]
    fn schema_types_name_the_capabilities() {
        let types = SchemaTypes::of::<BytesSchema>();
        assert!(types.comparer_type.ends_with("OrdComparator"));
        assert!(types.value_serializer_type.contains("DeletableSerializer"));
        assert_eq!(types, SchemaTypes::of::<BytesSchema>());
    }
}
