use dashmap::DashMap;

/// Cluster-wide uniqueness of worker names.
///
/// `register` claims a name and returns false when it is already held; the
/// supervisor refuses to start a second worker for a claimed name. The
/// single-process implementation is a local map; cluster mode replaces it
/// with a replicated one behind the same interface.
pub trait Registry: Send + Sync {
    /// Claim `name`. False means someone already holds it.
    fn register(&self, name: &str) -> bool;

    fn unregister(&self, name: &str);

    fn is_registered(&self, name: &str) -> bool;

    fn list(&self) -> Vec<String>;
}

/// In-process unique-name registry for single-node deployments.
#[derive(Default)]
pub struct LocalRegistry {
    names: DashMap<String, ()>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registry for LocalRegistry {
    fn register(&self, name: &str) -> bool {
        match self.names.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        }
    }

    fn unregister(&self, name: &str) {
        self.names.remove(name);
    }

    fn is_registered(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    fn list(&self) -> Vec<String> {
        self.names.iter().map(|e| e.key().clone()).collect()
    }
}
