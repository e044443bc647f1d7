use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use crate::db::normalize_domain;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsBlocklist {
    version: u64,
    domains: HashSet<String>,
}

impl DnsBlocklist {
    /// Entries that do not normalise to a domain are dropped.
    pub fn new(version: u64, domains: impl IntoIterator<Item = String>) -> Self {
        let domains = domains
            .into_iter()
            .filter_map(|d| normalize_domain(&d).ok())
            .collect();
        Self { version, domains }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// True when `name` or any of its parent domains is listed.
    pub fn is_blocked(&self, name: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let mut candidate = name.as_str();
        loop {
            if self.domains.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => candidate = parent,
                _ => return false,
            }
        }
    }
}

/// The list the proxy consults, swapped whole on every reload.
#[derive(Debug, Default)]
pub struct SharedBlocklist {
    inner: RwLock<Arc<DnsBlocklist>>,
}

impl SharedBlocklist {
    pub fn new(initial: DnsBlocklist) -> Self {
        Self {
            inner: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn current(&self) -> Arc<DnsBlocklist> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, next: DnsBlocklist) {
        let next = Arc::new(next);
        match self.inner.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents_match_but_siblings_do_not() {
        let list = DnsBlocklist::new(1, ["reddit.com".to_string(), "x.com".to_string()]);
        assert!(list.is_blocked("reddit.com"));
        assert!(list.is_blocked("old.reddit.com."));
        assert!(list.is_blocked("A.B.REDDIT.com"));
        assert!(!list.is_blocked("notreddit.com"));
        assert!(!list.is_blocked("reddit.co"));
        assert!(!list.is_blocked("com"));
        assert!(!list.is_blocked("notblocked.com"));
    }

    #[test]
    fn replace_swaps_the_whole_list() {
        let shared = SharedBlocklist::default();
        assert!(!shared.current().is_blocked("reddit.com"));
        shared.replace(DnsBlocklist::new(2, ["reddit.com".to_string()]));
        assert_eq!(shared.current().version(), 2);
        assert!(shared.current().is_blocked("www.reddit.com"));
    }
}
