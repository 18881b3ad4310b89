//! Per-service target loader.
//!
//! # Responsibilities
//! - Bind ring virtual ids to live targets under a read/write lock
//! - Pick a target for a request by sampling random ring keys
//!
//! # Design Decisions
//! - Targets join the ring only once connected and leave it on close
//! - Selection is bounded: a fixed number of random keys, then give up

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::load_balancer::ring::HashRing;
use crate::load_balancer::RingMember;
use crate::upstream::connection::BackendConnection;

/// Size of the key space sampled by [`Loader::pick`].
pub const PICK_KEY_SPACE: u32 = 10_000;

#[derive(Debug)]
struct Inner<T> {
    ring: HashRing,
    members: HashMap<u32, Arc<T>>,
    keys: HashMap<String, u32>,
}

/// Consistent-hash selector for one backend service class.
#[derive(Debug)]
pub struct Loader<T = BackendConnection> {
    service: String,
    inner: RwLock<Inner<T>>,
}

impl<T: RingMember> Loader<T> {
    pub fn new(service: impl Into<String>, replicas: usize) -> Self {
        Self {
            service: service.into(),
            inner: RwLock::new(Inner {
                ring: HashRing::new(replicas),
                members: HashMap::new(),
                keys: HashMap::new(),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Register `member` under `key`, replacing any previous binding.
    pub fn add_target(&self, key: &str, virtual_id: u32, member: Arc<T>) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.keys.insert(key.to_string(), virtual_id) {
            if old != virtual_id {
                inner.ring.remove(old);
                inner.members.remove(&old);
            }
        }
        inner.ring.add(virtual_id);
        inner.members.insert(virtual_id, member);
        tracing::debug!(service = %self.service, key, virtual_id, "Target joined ring");
    }

    pub fn remove_target(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(virtual_id) = inner.keys.remove(key) else {
            return false;
        };
        inner.ring.remove(virtual_id);
        inner.members.remove(&virtual_id);
        tracing::debug!(service = %self.service, key, virtual_id, "Target left ring");
        true
    }

    /// Target owning `key` on the ring.
    pub fn get_target(&self, key: &str) -> Option<Arc<T>> {
        let inner = self.inner.read();
        let vid = inner.ring.get(key)?;
        inner.members.get(&vid).cloned()
    }

    /// Sample up to `attempts` random keys until one resolves to an
    /// available target.
    pub fn pick(&self, attempts: usize) -> Option<Arc<T>> {
        for _ in 0..attempts {
            let key = fastrand::u32(0..PICK_KEY_SPACE).to_string();
            match self.get_target(&key) {
                Some(target) if target.is_available() => return Some(target),
                _ => continue,
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.inner.read().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loaders keyed by service class. Built once at startup.
#[derive(Debug)]
pub struct LoaderSet<T = BackendConnection> {
    loaders: HashMap<String, Arc<Loader<T>>>,
    replicas: usize,
}

impl<T: RingMember> LoaderSet<T> {
    pub fn new(replicas: usize) -> Self {
        Self {
            loaders: HashMap::new(),
            replicas,
        }
    }

    /// Loader for `service`, created on first use.
    pub fn ensure(&mut self, service: &str) -> Arc<Loader<T>> {
        let replicas = self.replicas;
        Arc::clone(
            self.loaders
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(Loader::new(service, replicas))),
        )
    }

    pub fn get(&self, service: &str) -> Option<Arc<Loader<T>>> {
        self.loaders.get(service).cloned()
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Member {
        id: u32,
        up: AtomicBool,
    }

    impl RingMember for Member {
        fn is_available(&self) -> bool {
            self.up.load(Ordering::Relaxed)
        }
    }

    fn member(id: u32, up: bool) -> Arc<Member> {
        Arc::new(Member {
            id,
            up: AtomicBool::new(up),
        })
    }

    #[test]
    fn empty_loader_gives_up() {
        let loader: Loader<Member> = Loader::new("world", 16);
        assert!(loader.pick(6).is_none());
        assert!(loader.pick(0).is_none());
    }

    #[test]
    fn pick_returns_registered_target() {
        let loader = Loader::new("world", 16);
        loader.add_target("10.0.0.1:7000", 1, member(1, true));
        let picked = loader.pick(6).unwrap();
        assert_eq!(picked.id, 1);
    }

    #[test]
    fn pick_skips_unavailable_targets() {
        let loader = Loader::new("world", 16);
        loader.add_target("down", 1, member(1, false));
        assert!(loader.pick(6).is_none());

        loader.add_target("up", 2, member(2, true));
        // With one live member of two, six samples miss with odds ~1/64.
        let hits = (0..50).filter_map(|_| loader.pick(6)).count();
        assert!(hits > 0);
        assert!((0..50).filter_map(|_| loader.pick(6)).all(|m| m.id == 2));
    }

    #[test]
    fn remove_target_empties_ring() {
        let loader = Loader::new("world", 16);
        loader.add_target("a", 1, member(1, true));
        assert_eq!(loader.len(), 1);
        assert!(loader.remove_target("a"));
        assert!(!loader.remove_target("a"));
        assert!(loader.is_empty());
        assert!(loader.get_target("1").is_none());
    }

    #[test]
    fn loader_set_reuses_service_loader() {
        let mut set: LoaderSet<Member> = LoaderSet::new(8);
        let a = set.ensure("chat");
        let b = set.ensure("chat");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(set.get("world").is_none());
    }
}
