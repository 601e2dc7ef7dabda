//! IP-level connection filtering.
//!
//! A small CIDR rule table consulted on every established connection. The
//! default action for an address no rule covers is `Accept`.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Accept,
    Deny,
}

#[derive(Debug, Default)]
pub struct Filters {
    rules: RwLock<Vec<(IpNetwork, FilterAction)>>,
}

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule for `net`, replacing any existing rule for the same network.
    pub fn add_filter(&self, net: IpNetwork, action: FilterAction) {
        let mut rules = self.rules.write();
        if let Some(entry) = rules.iter_mut().find(|(existing, _)| *existing == net) {
            entry.1 = action;
        } else {
            rules.push((net, action));
        }
    }

    /// Removes the rule whose network is exactly `net`. Covering rules with a
    /// different prefix are untouched.
    pub fn remove_literal(&self, net: IpNetwork) {
        self.rules.write().retain(|(existing, _)| *existing != net);
    }

    /// Returns the action a rule prescribes for exactly `net`, and whether
    /// such a rule exists.
    pub fn action_for_filter(&self, net: IpNetwork) -> (FilterAction, bool) {
        let rules = self.rules.read();
        match rules.iter().find(|(existing, _)| *existing == net) {
            Some((_, action)) => (*action, true),
            None => (FilterAction::Accept, false),
        }
    }

    /// Resolves the action for a single address against the whole table.
    /// The most recently added matching rule wins.
    pub fn action_for_addr(&self, addr: IpAddr) -> FilterAction {
        let rules = self.rules.read();
        rules
            .iter()
            .rev()
            .find(|(net, _)| net.contains(addr))
            .map(|(_, action)| *action)
            .unwrap_or(FilterAction::Accept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slash32(ip: &str) -> IpNetwork {
        format!("{ip}/32").parse().expect("cidr")
    }

    #[test]
    fn default_action_is_accept() {
        let filters = Filters::new();
        let (action, matched) = filters.action_for_filter(slash32("10.0.0.1"));
        assert_eq!(action, FilterAction::Accept);
        assert!(!matched);
        assert_eq!(
            filters.action_for_addr("10.0.0.1".parse().unwrap()),
            FilterAction::Accept
        );
    }

    #[test]
    fn deny_rule_is_visible_and_removable() {
        let filters = Filters::new();
        let net = slash32("10.0.0.1");

        filters.add_filter(net, FilterAction::Deny);
        assert_eq!(filters.action_for_filter(net), (FilterAction::Deny, true));
        assert_eq!(
            filters.action_for_addr("10.0.0.1".parse().unwrap()),
            FilterAction::Deny
        );

        filters.remove_literal(net);
        assert_eq!(
            filters.action_for_filter(net),
            (FilterAction::Accept, false)
        );
    }

    #[test]
    fn re_adding_a_rule_replaces_it() {
        let filters = Filters::new();
        let net = slash32("192.168.1.7");
        filters.add_filter(net, FilterAction::Deny);
        filters.add_filter(net, FilterAction::Accept);
        assert_eq!(
            filters.action_for_filter(net),
            (FilterAction::Accept, true)
        );
        assert_eq!(filters.rules.read().len(), 1);
    }

    #[test]
    fn remove_literal_ignores_covering_prefixes() {
        let filters = Filters::new();
        let wide: IpNetwork = "10.0.0.0/8".parse().unwrap();
        filters.add_filter(wide, FilterAction::Deny);
        filters.remove_literal(slash32("10.0.0.1"));
        assert_eq!(
            filters.action_for_addr("10.0.0.1".parse().unwrap()),
            FilterAction::Deny
        );
    }
}
