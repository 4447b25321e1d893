//! Immutable name → host map for one generation of the live graph.

use std::collections::HashMap;
use std::sync::Arc;

use crate::host::Host;

/// One generation of the live graph. Replaced wholesale on reload.
#[derive(Debug, Default, Clone)]
pub struct HostRegistry {
    hosts: HashMap<String, Arc<Host>>,
}

impl HostRegistry {
    pub fn from_hosts<I>(hosts: I) -> Self
    where
        I: IntoIterator<Item = Arc<Host>>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|host| (host.name().to_string(), host))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Host>> {
        self.hosts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hosts.contains_key(name)
    }

    /// Sorted host names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.hosts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Arc<Host>> {
        self.hosts.values()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}
