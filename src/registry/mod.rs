//! Typed, immutable object registry.
//!
//! Registries are the contextual data plane the scheduler exposes to user
//! code: a logical mapping from a Rust type to zero or more values, with
//! insertion order preserved. Two shapes exist: a *leaf* backed by an ordered
//! entry list, and a *join* in which a child registry overlays a parent.
//! Lookups on a join return child entries first; [`Registry::get_all`]
//! concatenates child then parent. All shapes are immutable, so joins cache
//! per-type lookups to amortise hierarchical walks.
//!
//! Type matching is nominal (exact [`TypeId`]): polymorphic registration is
//! done by registering a trait-object handle such as `Arc<dyn Trait>` itself.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{ExecError, ExecResult};

type AnyValue = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
struct Entry {
    type_id: TypeId,
    value: AnyValue,
}

enum Backing {
    Empty,
    Entries(Vec<Entry>),
    Joined {
        parent: Registry,
        child: Registry,
        cache: DashMap<TypeId, Arc<Vec<AnyValue>>>,
    },
}

/// Immutable typed lookup. Cloning is cheap; clones share the backing.
#[derive(Clone)]
pub struct Registry {
    backing: Arc<Backing>,
}

impl Registry {
    /// The empty registry. Joins against it short-circuit.
    pub fn empty() -> Self {
        Registry { backing: Arc::new(Backing::Empty) }
    }

    /// Registry holding exactly one value.
    pub fn single<T: Send + Sync + 'static>(value: T) -> Self {
        Registry::builder().add(value).build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder { entries: Vec::new() }
    }

    pub(crate) fn from_entries(entries: Vec<(TypeId, AnyValue)>) -> Self {
        if entries.is_empty() {
            return Registry::empty();
        }
        let entries = entries
            .into_iter()
            .map(|(type_id, value)| Entry { type_id, value })
            .collect();
        Registry { backing: Arc::new(Backing::Entries(entries)) }
    }

    pub fn is_empty(&self) -> bool {
        matches!(*self.backing, Backing::Empty)
    }

    /// Overlay `child` on top of this registry. Child entries win and are
    /// returned first by [`Registry::get_all`].
    pub fn join(&self, child: Registry) -> Registry {
        if child.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return child;
        }
        Registry {
            backing: Arc::new(Backing::Joined {
                parent: self.clone(),
                child,
                cache: DashMap::new(),
            }),
        }
    }

    /// First value registered for `T`, if any. On a join the child is
    /// consulted before the parent.
    pub fn maybe_get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        match &*self.backing {
            Backing::Empty => None,
            Backing::Entries(entries) => entries
                .iter()
                .find(|entry| entry.type_id == TypeId::of::<T>())
                .and_then(|entry| entry.value.clone().downcast::<T>().ok()),
            Backing::Joined { parent, child, .. } => {
                child.maybe_get::<T>().or_else(|| parent.maybe_get::<T>())
            }
        }
    }

    /// Like [`Registry::maybe_get`] but failing with
    /// [`ErrorKind::NotInRegistry`](crate::error::ErrorKind::NotInRegistry).
    pub fn get<T: Send + Sync + 'static>(&self) -> ExecResult<Arc<T>> {
        self.maybe_get::<T>()
            .ok_or_else(|| ExecError::not_in_registry(std::any::type_name::<T>()))
    }

    /// Every value registered for `T`, child-then-parent, insertion order
    /// within each leaf.
    pub fn get_all<T: Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        let mut raw = Vec::new();
        self.collect_raw(TypeId::of::<T>(), &mut raw);
        raw.into_iter()
            .filter_map(|value| value.downcast::<T>().ok())
            .collect()
    }

    /// Apply `select` to each registered `T` in [`Registry::get_all`] order
    /// and return the first non-`None` result.
    pub fn first<T, U>(&self, select: impl Fn(&T) -> Option<U>) -> Option<U>
    where
        T: Send + Sync + 'static,
    {
        self.get_all::<T>().into_iter().find_map(|value| select(&value))
    }

    fn collect_raw(&self, type_id: TypeId, out: &mut Vec<AnyValue>) {
        match &*self.backing {
            Backing::Empty => {}
            Backing::Entries(entries) => {
                out.extend(
                    entries
                        .iter()
                        .filter(|entry| entry.type_id == type_id)
                        .map(|entry| entry.value.clone()),
                );
            }
            Backing::Joined { parent, child, cache } => {
                if let Some(hit) = cache.get(&type_id) {
                    out.extend(hit.iter().cloned());
                    return;
                }
                let mut collected = Vec::new();
                child.collect_raw(type_id, &mut collected);
                parent.collect_raw(type_id, &mut collected);
                let collected = Arc::new(collected);
                cache.insert(type_id, collected.clone());
                out.extend(collected.iter().cloned());
            }
        }
    }
}

/// Accumulates entries for a leaf [`Registry`].
pub struct RegistryBuilder {
    entries: Vec<Entry>,
}

impl RegistryBuilder {
    pub fn add<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.entries.push(Entry {
            type_id: TypeId::of::<T>(),
            value: Arc::new(value),
        });
        self
    }

    pub fn build(self) -> Registry {
        if self.entries.is_empty() {
            Registry::empty()
        } else {
            Registry { backing: Arc::new(Backing::Entries(self.entries)) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Port(u16);

    #[test]
    fn test_maybe_get_first_registered_wins() {
        let registry = Registry::builder()
            .add("p1".to_string())
            .add("p2".to_string())
            .build();
        assert_eq!(*registry.maybe_get::<String>().unwrap(), "p1");
    }

    #[test]
    fn test_get_missing_type_errors() {
        let registry = Registry::single(Port(80));
        assert_eq!(*registry.get::<Port>().unwrap(), Port(80));
        let error = registry.get::<String>().unwrap_err();
        assert!(error.to_string().contains("no entry in registry"));
    }

    #[test]
    fn test_join_child_overrides_parent() {
        let parent = Registry::builder()
            .add("p1".to_string())
            .add("p2".to_string())
            .build();
        let child = Registry::single("c1".to_string());
        let joined = parent.join(child.clone());

        assert_eq!(*joined.maybe_get::<String>().unwrap(), "c1");
        assert_eq!(
            joined.first::<String, String>(|s| Some(s.clone())),
            Some("c1".to_string())
        );

        let all: Vec<String> = joined.get_all::<String>().iter().map(|s| (**s).clone()).collect();
        assert_eq!(all, vec!["c1", "p1", "p2"]);

        // Join law: joined.maybe_get == child.maybe_get else parent.maybe_get.
        assert_eq!(
            joined.maybe_get::<String>().map(|s| (*s).clone()),
            child
                .maybe_get::<String>()
                .or_else(|| parent.maybe_get::<String>())
                .map(|s| (*s).clone())
        );
    }

    #[test]
    fn test_join_falls_through_to_parent() {
        let parent = Registry::single(Port(8080));
        let child = Registry::single("only-strings".to_string());
        let joined = parent.join(child);
        assert_eq!(*joined.maybe_get::<Port>().unwrap(), Port(8080));
    }

    #[test]
    fn test_join_with_empty_short_circuits() {
        let parent = Registry::single(Port(1));
        let joined = parent.join(Registry::empty());
        assert!(Arc::ptr_eq(&parent.backing, &joined.backing));

        let child = Registry::single(Port(2));
        let joined = Registry::empty().join(child.clone());
        assert!(Arc::ptr_eq(&child.backing, &joined.backing));
    }

    #[test]
    fn test_joined_lookup_is_cached() {
        let joined = Registry::single(Port(1)).join(Registry::single(Port(2)));
        let first: Vec<u16> = joined.get_all::<Port>().iter().map(|p| p.0).collect();
        let second: Vec<u16> = joined.get_all::<Port>().iter().map(|p| p.0).collect();
        assert_eq!(first, vec![2, 1]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_first_skips_non_matching() {
        let registry = Registry::builder().add(Port(0)).add(Port(443)).build();
        let hit = registry.first::<Port, u16>(|p| if p.0 > 0 { Some(p.0) } else { None });
        assert_eq!(hit, Some(443));
    }
}
