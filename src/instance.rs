//! Provisioned execution environments and the pool that tracks them.
//!
//! An [`Instance`] is an opaque token naming one externally provisioned
//! environment (a container, a VM, a chroot; quarry never looks inside).
//! The [`InstancePool`] tracks instances per profile across two disjoint
//! sets, `available` and `allocated`; every instance is in exactly one of
//! the two. The pool is not thread-safe by contract: the run controller is
//! the only mutator and serialises access.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Errors from pool operations. These indicate contract violations or
/// exhaustion and are not retried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no available instance for profile '{0}'")]
    Empty(String),

    #[error("instance '{0}' is not allocated")]
    NotAllocated(String),

    #[error("bad instance field: {0}")]
    BadArgument(String),
}

/// One provisioned execution environment, identified by `(profile, id)`.
///
/// Both fields are plain text; equality and ordering derive from both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Instance {
    profile: String,
    id: String,
}

impl Instance {
    /// Creates an instance, validating both fields.
    ///
    /// Ids travel through whitespace-separated command substitutions
    /// (`$INSTANCE_IDS`), so empty fields and embedded whitespace are
    /// rejected with [`PoolError::BadArgument`].
    pub fn new(profile: impl Into<String>, id: impl Into<String>) -> Result<Self, PoolError> {
        let profile = profile.into();
        let id = id.into();
        for (name, value) in [("profile", &profile), ("id", &id)] {
            if value.is_empty() {
                return Err(PoolError::BadArgument(format!("{name} is empty")));
            }
            if value.chars().any(|c| c.is_whitespace() || c == '\0') {
                return Err(PoolError::BadArgument(format!(
                    "{name} '{value}' contains whitespace"
                )));
            }
        }
        Ok(Instance { profile, id })
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.profile, self.id)
    }
}

/// Tracks provisioned instances per profile.
///
/// # Example
///
/// ```
/// use quarry::instance::{Instance, InstancePool};
///
/// let mut pool = InstancePool::new();
/// pool.add(Instance::new("py3", "worker-1").unwrap());
/// let held = pool.allocate("py3").unwrap();
/// assert_eq!(pool.size("py3"), 1);
/// pool.release(&held).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct InstancePool {
    available: HashMap<String, BTreeSet<Instance>>,
    allocated: HashMap<String, BTreeSet<Instance>>,
}

impl InstancePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an instance to the available set for its profile.
    pub fn add(&mut self, instance: Instance) {
        self.available
            .entry(instance.profile.clone())
            .or_default()
            .insert(instance);
    }

    /// Moves one available instance of `profile` to the allocated set.
    ///
    /// Selection among available instances is unspecified.
    pub fn allocate(&mut self, profile: &str) -> Result<Instance, PoolError> {
        let set = self
            .available
            .get_mut(profile)
            .filter(|set| !set.is_empty())
            .ok_or_else(|| PoolError::Empty(profile.to_string()))?;
        let instance = set.iter().next().cloned().expect("set checked non-empty");
        set.remove(&instance);
        self.allocated
            .entry(profile.to_string())
            .or_default()
            .insert(instance.clone());
        Ok(instance)
    }

    /// Returns an allocated instance to the available set.
    pub fn release(&mut self, instance: &Instance) -> Result<(), PoolError> {
        self.take_allocated(instance)?;
        self.available
            .entry(instance.profile.clone())
            .or_default()
            .insert(instance.clone());
        Ok(())
    }

    /// Drops an allocated instance from the pool entirely.
    ///
    /// Available-only instances cannot be removed this way.
    pub fn remove(&mut self, instance: &Instance) -> Result<(), PoolError> {
        self.take_allocated(instance)
    }

    fn take_allocated(&mut self, instance: &Instance) -> Result<(), PoolError> {
        let removed = self
            .allocated
            .get_mut(&instance.profile)
            .map(|set| set.remove(instance))
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(PoolError::NotAllocated(instance.to_string()))
        }
    }

    /// Total instance count for `profile`, available plus allocated.
    pub fn size(&self, profile: &str) -> usize {
        let available = self.available.get(profile).map_or(0, BTreeSet::len);
        let allocated = self.allocated.get(profile).map_or(0, BTreeSet::len);
        available + allocated
    }

    /// Snapshot of every instance across all profiles and both sets.
    pub fn all(&self) -> BTreeSet<Instance> {
        self.available
            .values()
            .chain(self.allocated.values())
            .flatten()
            .cloned()
            .collect()
    }

    /// Drops every instance. Used after disposal.
    pub fn clear(&mut self) {
        self.available.clear();
        self.allocated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(profile: &str, id: &str) -> Instance {
        Instance::new(profile, id).unwrap()
    }

    #[test]
    fn add_then_allocate_moves_between_sets() {
        let mut pool = InstancePool::new();
        pool.add(inst("py3", "a"));
        assert_eq!(pool.size("py3"), 1);
        let held = pool.allocate("py3").unwrap();
        assert_eq!(held, inst("py3", "a"));
        // Still counted while allocated.
        assert_eq!(pool.size("py3"), 1);
        assert_eq!(pool.allocate("py3"), Err(PoolError::Empty("py3".into())));
    }

    #[test]
    fn allocate_empty_profile_fails() {
        let mut pool = InstancePool::new();
        assert_eq!(pool.allocate("py3"), Err(PoolError::Empty("py3".into())));
    }

    #[test]
    fn release_returns_instance_for_reuse() {
        let mut pool = InstancePool::new();
        pool.add(inst("py3", "a"));
        let held = pool.allocate("py3").unwrap();
        pool.release(&held).unwrap();
        assert_eq!(pool.allocate("py3").unwrap(), held);
    }

    #[test]
    fn release_unallocated_fails() {
        let mut pool = InstancePool::new();
        pool.add(inst("py3", "a"));
        let err = pool.release(&inst("py3", "a")).unwrap_err();
        assert!(matches!(err, PoolError::NotAllocated(_)));
    }

    #[test]
    fn remove_only_touches_allocated() {
        let mut pool = InstancePool::new();
        pool.add(inst("py3", "a"));
        assert!(pool.remove(&inst("py3", "a")).is_err());
        let held = pool.allocate("py3").unwrap();
        pool.remove(&held).unwrap();
        assert_eq!(pool.size("py3"), 0);
    }

    #[test]
    fn full_lifecycle_shrinks_size_by_one() {
        let mut pool = InstancePool::new();
        pool.add(inst("py3", "a"));
        pool.add(inst("py3", "b"));
        let held = pool.allocate("py3").unwrap();
        pool.release(&held).unwrap();
        let held = pool.allocate("py3").unwrap();
        pool.remove(&held).unwrap();
        assert_eq!(pool.size("py3"), 1);
    }

    #[test]
    fn profiles_are_disjoint() {
        let mut pool = InstancePool::new();
        pool.add(inst("py3", "a"));
        pool.add(inst("pypy", "a"));
        assert_eq!(pool.size("py3"), 1);
        assert_eq!(pool.size("pypy"), 1);
        pool.allocate("py3").unwrap();
        assert_eq!(pool.allocate("py3"), Err(PoolError::Empty("py3".into())));
        pool.allocate("pypy").unwrap();
    }

    #[test]
    fn all_spans_both_sets_and_profiles() {
        let mut pool = InstancePool::new();
        pool.add(inst("py3", "a"));
        pool.add(inst("py3", "b"));
        pool.add(inst("pypy", "c"));
        pool.allocate("py3").unwrap();
        let all = pool.all();
        assert_eq!(all.len(), 3);
        assert!(all.contains(&inst("pypy", "c")));
    }

    #[test]
    fn bad_fields_rejected() {
        assert!(matches!(
            Instance::new("", "a"),
            Err(PoolError::BadArgument(_))
        ));
        assert!(matches!(
            Instance::new("py3", "has space"),
            Err(PoolError::BadArgument(_))
        ));
        assert!(matches!(
            Instance::new("py3", ""),
            Err(PoolError::BadArgument(_))
        ));
    }
}
