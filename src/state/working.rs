use std::collections::BTreeSet;

use crate::types::Protocol;

/// Protocols that carried inbound traffic during the current reachability
/// epoch. Grows monotonically until the epoch is reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingProtocolSet(BTreeSet<Protocol>);

impl WorkingProtocolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, protocol: Protocol) -> bool {
        self.0.insert(protocol)
    }

    pub fn contains(&self, protocol: Protocol) -> bool {
        self.0.contains(&protocol)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.0.iter().copied()
    }

    /// The working protocol that should be moved to the front of `order`, if
    /// any. A non-working first contact yields to the best working one; a
    /// working first contact yields only to a working protocol ranked above it.
    pub fn preferred_promotion(&self, order: &[Protocol], priority: &[Protocol]) -> Option<Protocol> {
        let first = *order.first()?;
        let rank = |p: Protocol| {
            priority
                .iter()
                .position(|q| *q == p)
                .unwrap_or(priority.len())
        };
        let best = self
            .iter()
            .filter(|p| order.contains(p))
            .min_by_key(|p| rank(*p))?;

        match self.contains(first) {
            false => Some(best),
            true => (rank(best) < rank(first)).then_some(best),
        }
    }
}

impl FromIterator<Protocol> for WorkingProtocolSet {
    fn from_iter<I: IntoIterator<Item = Protocol>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        test_utils::{arb_protocol_order, arb_protocol_set},
        types::DEFAULT_PRIORITY,
    };

    #[test]
    fn empty_set_promotes_nothing() {
        let working = WorkingProtocolSet::new();
        assert_eq!(
            working.preferred_promotion(&[Protocol::Relay, Protocol::Tcp], DEFAULT_PRIORITY),
            None
        );
    }

    #[test]
    fn dead_first_contact_yields_to_working() {
        let working: WorkingProtocolSet = [Protocol::Relay].into_iter().collect();
        assert_eq!(
            working.preferred_promotion(&[Protocol::Tcp, Protocol::Relay], DEFAULT_PRIORITY),
            Some(Protocol::Relay)
        );
    }

    #[test]
    fn working_tcp_displaces_working_relay() {
        let working: WorkingProtocolSet = [Protocol::Relay, Protocol::Tcp].into_iter().collect();
        assert_eq!(
            working.preferred_promotion(&[Protocol::Relay, Protocol::Tcp], DEFAULT_PRIORITY),
            Some(Protocol::Tcp)
        );
    }

    #[test]
    fn working_preferred_first_is_left_alone() {
        let working: WorkingProtocolSet = [Protocol::Tcp, Protocol::Udp].into_iter().collect();
        assert_eq!(
            working.preferred_promotion(&[Protocol::Tcp, Protocol::Udp], DEFAULT_PRIORITY),
            None
        );
    }

    #[test]
    fn custom_priority_is_respected() {
        let priority = [Protocol::Relay, Protocol::Udp, Protocol::Tcp];
        let working: WorkingProtocolSet = [Protocol::Relay, Protocol::Tcp].into_iter().collect();
        assert_eq!(
            working.preferred_promotion(&[Protocol::Tcp, Protocol::Relay], &priority),
            Some(Protocol::Relay)
        );
    }

    #[test]
    fn protocols_missing_from_order_are_not_promoted() {
        let working: WorkingProtocolSet = [Protocol::Udp].into_iter().collect();
        assert_eq!(
            working.preferred_promotion(&[Protocol::Tcp], DEFAULT_PRIORITY),
            None
        );
    }

    proptest! {
        #[test]
        fn promotion_is_always_working_and_published(
            working in arb_protocol_set(),
            order in arb_protocol_order(),
        ) {
            let working: WorkingProtocolSet = working.into_iter().collect();
            if let Some(p) = working.preferred_promotion(&order, DEFAULT_PRIORITY) {
                prop_assert!(working.contains(p));
                prop_assert!(order.contains(&p));
                prop_assert_ne!(Some(&p), order.first());
            }
        }

        #[test]
        fn applying_promotion_reaches_fixed_point(
            working in arb_protocol_set(),
            order in arb_protocol_order(),
        ) {
            let working: WorkingProtocolSet = working.into_iter().collect();
            let mut order = order;
            if let Some(p) = working.preferred_promotion(&order, DEFAULT_PRIORITY) {
                order.retain(|q| *q != p);
                order.insert(0, p);
            }
            prop_assert_eq!(working.preferred_promotion(&order, DEFAULT_PRIORITY), None);
        }
    }
}
