//! The CoAP resource tree: which paths are currently mounted, rendered as
//! a CoRE Link Format (RFC 6690) listing for `.well-known/core` (§4.3, §6).
//!
//! Static routes are fixed for the server's lifetime; one dynamic route is
//! added per live subscription and removed the moment its last observer
//! deregisters, so the listing never needs a separate GC pass (§4.3's
//! "maintained incrementally, not recomputed from a stored snapshot").

use indexmap::IndexSet;

const STATIC_LINKS: &[&str] = &[
    "</info>",
    "</sparql/query>",
    "</sparql/update>",
    "</sparql/subscription>",
];

#[derive(Default)]
pub struct ResourceTree {
    subscriptions: IndexSet<String>,
}

impl ResourceTree {
    pub fn new() -> Self {
        Self {
            subscriptions: IndexSet::new(),
        }
    }

    pub fn mount_subscription(&mut self, fingerprint: &str) {
        self.subscriptions.insert(fingerprint.to_string());
    }

    pub fn unmount_subscription(&mut self, fingerprint: &str) {
        self.subscriptions.shift_remove(fingerprint);
    }

    /// Render every mounted resource as a comma-separated CoRE Link Format
    /// listing. Subscription resources advertise `obs` since they accept
    /// CoAP Observe registrations.
    pub fn link_format(&self) -> String {
        let mut links: Vec<String> = STATIC_LINKS.iter().map(|s| s.to_string()).collect();
        for fp in &self.subscriptions {
            links.push(format!("</{}>;obs", fp));
        }
        links.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_format_lists_static_routes_only_when_empty() {
        let tree = ResourceTree::new();
        let rendered = tree.link_format();
        assert!(rendered.contains("</info>"));
        assert!(rendered.contains("</sparql/query>"));
        assert!(rendered.contains("</sparql/update>"));
        assert!(rendered.contains("</sparql/subscription>"));
        assert!(!rendered.contains(";obs"));
    }

    #[test]
    fn test_mounting_and_unmounting_a_subscription_updates_the_listing() {
        let mut tree = ResourceTree::new();
        tree.mount_subscription("deadbeefdeadbeefdeadbeefdeadbeef");
        let rendered = tree.link_format();
        assert!(rendered.contains("</deadbeefdeadbeefdeadbeefdeadbeef>;obs"));

        tree.unmount_subscription("deadbeefdeadbeefdeadbeefdeadbeef");
        assert!(!tree.link_format().contains("deadbeef"));
    }
}
