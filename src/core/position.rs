//! Insert position of a rule in the live enforcement chain
//!
//! The chain is shared by every server, so a rule is positioned relative to
//! its own match-key cohort only: it goes directly after the cohort members
//! that sort before it in declared order. The chain's real length bounds the
//! result; when declared and live state have drifted apart the rule is
//! appended instead.
//!
//! IPv4 and IPv6 rules live in separate chains, so the cohort is also
//! restricted to the rule's address family.

use crate::core::enforcement::{EnforcementAdapter, Position};
use crate::core::error::Result;
use crate::core::rule::{Rule, declared_order};
use crate::core::store::{RuleFilter, RuleStore};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Computes where `rule` belongs in the enforcement chain.
///
/// `rule` itself is excluded from its cohort by id, so an already stored
/// rule can be repositioned in place.
///
/// # Errors
///
/// Returns `Err` only if the store cannot be read. A failed chain length
/// query degrades to [`Position::Append`].
pub async fn calculate_position(
    store: &dyn RuleStore,
    adapter: &dyn EnforcementAdapter,
    rule: &Rule,
) -> Result<Position> {
    let chain_len = match adapter.chain_length(rule.family()).await {
        Ok(len) => len,
        Err(e) => {
            warn!("Chain length query failed, appending rule {}: {e}", rule.describe());
            return Ok(Position::Append);
        }
    };

    if chain_len == 0 {
        return Ok(Position::At(1));
    }

    let cohort = store
        .active_rules(&RuleFilter::match_key(&rule.match_key()))
        .await?;
    let ahead = cohort
        .iter()
        .filter(|other| other.id != rule.id && other.family() == rule.family())
        .filter(|other| declared_order(other, rule) == Ordering::Less)
        .count();

    Ok(bounded_position(ahead + 1, chain_len, rule))
}

/// `target` if it lands inside the chain (or right after it), else append.
fn bounded_position(target: usize, chain_len: usize, rule: &Rule) -> Position {
    if target > chain_len + 1 {
        debug!(
            "Position {target} for rule {} is past chain length {chain_len}, appending",
            rule.describe()
        );
        Position::Append
    } else {
        Position::At(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{Protocol, RuleKind};
    use crate::core::store::MemoryStore;
    use crate::core::test_helpers::{ChainRecorder, new_rule, sample_rule};
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_empty_chain_is_position_one() {
        let store = MemoryStore::new();
        let chain = ChainRecorder::new();
        let rule = store.insert(new_rule("srv", 25565, RuleKind::Allow, 100)).await.unwrap();

        let position = calculate_position(&store, &chain, &rule).await.unwrap();
        assert_eq!(position, Position::At(1));
    }

    #[tokio::test]
    async fn test_higher_priority_goes_first() {
        let store = MemoryStore::new();
        let chain = ChainRecorder::new();

        let a = store.insert(new_rule("srv", 25565, RuleKind::Allow, 100)).await.unwrap();
        chain.apply(&a, Position::At(1)).await.unwrap();
        let b = store.insert(new_rule("srv", 25565, RuleKind::Block, 50)).await.unwrap();

        let position = calculate_position(&store, &chain, &b).await.unwrap();
        assert_eq!(position, Position::At(1));
    }

    #[tokio::test]
    async fn test_lower_priority_goes_after_cohort() {
        let store = MemoryStore::new();
        let chain = ChainRecorder::new();

        for priority in [10, 20] {
            let r = store.insert(new_rule("srv", 80, RuleKind::Allow, priority)).await.unwrap();
            chain.apply(&r, Position::Append).await.unwrap();
        }
        let late = store.insert(new_rule("srv", 80, RuleKind::Block, 30)).await.unwrap();

        let position = calculate_position(&store, &chain, &late).await.unwrap();
        assert_eq!(position, Position::At(3));
    }

    #[tokio::test]
    async fn test_equal_priority_goes_after_earlier_rule() {
        let store = MemoryStore::new();
        let chain = ChainRecorder::new();

        let first = store.insert(new_rule("srv", 80, RuleKind::Allow, 100)).await.unwrap();
        chain.apply(&first, Position::At(1)).await.unwrap();
        let second = store.insert(new_rule("srv", 80, RuleKind::Block, 100)).await.unwrap();

        let position = calculate_position(&store, &chain, &second).await.unwrap();
        assert_eq!(position, Position::At(2));
    }

    #[tokio::test]
    async fn test_other_match_keys_are_ignored() {
        let store = MemoryStore::new();
        let chain = ChainRecorder::new();

        let other_port = store.insert(new_rule("srv", 443, RuleKind::Allow, 1)).await.unwrap();
        let other_server = store.insert(new_rule("other", 80, RuleKind::Allow, 1)).await.unwrap();
        let mut udp = new_rule("srv", 80, RuleKind::Allow, 1);
        udp.protocol = Protocol::Udp;
        let other_proto = store.insert(udp).await.unwrap();
        for r in [&other_port, &other_server, &other_proto] {
            chain.apply(r, Position::Append).await.unwrap();
        }

        let rule = store.insert(new_rule("srv", 80, RuleKind::Block, 100)).await.unwrap();
        let position = calculate_position(&store, &chain, &rule).await.unwrap();
        assert_eq!(position, Position::At(1));
    }

    #[tokio::test]
    async fn test_other_family_is_ignored() {
        let store = MemoryStore::new();
        let chain = ChainRecorder::new();

        let mut v6 = new_rule("srv", 80, RuleKind::Allow, 1);
        v6.remote = "2001:db8::1".parse().unwrap();
        let v6 = store.insert(v6).await.unwrap();
        chain.apply(&v6, Position::At(1)).await.unwrap();
        let v4_existing = store.insert(new_rule("other", 22, RuleKind::Allow, 1)).await.unwrap();
        chain.apply(&v4_existing, Position::At(1)).await.unwrap();

        let rule = store.insert(new_rule("srv", 80, RuleKind::Block, 100)).await.unwrap();
        let position = calculate_position(&store, &chain, &rule).await.unwrap();
        assert_eq!(position, Position::At(1));
    }

    #[tokio::test]
    async fn test_rule_excludes_itself() {
        let store = MemoryStore::new();
        let chain = ChainRecorder::new();

        let a = store.insert(new_rule("srv", 80, RuleKind::Allow, 10)).await.unwrap();
        chain.apply(&a, Position::At(1)).await.unwrap();

        // repositioning a stored rule must not count the rule itself
        let mut moved = a.clone();
        moved.priority = 50;
        let position = calculate_position(&store, &chain, &moved).await.unwrap();
        assert_eq!(position, Position::At(1));
    }

    #[tokio::test]
    async fn test_drifted_chain_appends() {
        let store = MemoryStore::new();
        let chain = ChainRecorder::new();

        // three declared rules, only one of them live
        let mut declared = Vec::new();
        for priority in [10, 20, 30] {
            declared.push(store.insert(new_rule("srv", 80, RuleKind::Allow, priority)).await.unwrap());
        }
        chain.apply(&declared[0], Position::At(1)).await.unwrap();
        let rule = store.insert(new_rule("srv", 80, RuleKind::Block, 40)).await.unwrap();

        let position = calculate_position(&store, &chain, &rule).await.unwrap();
        assert_eq!(position, Position::Append);
    }

    #[tokio::test]
    async fn test_chain_query_failure_appends() {
        let store = MemoryStore::new();
        let chain = ChainRecorder::new();
        chain.fail_with_timeout(true);
        let rule = store.insert(new_rule("srv", 80, RuleKind::Allow, 10)).await.unwrap();

        let position = calculate_position(&store, &chain, &rule).await.unwrap();
        assert_eq!(position, Position::Append);
    }

    #[test]
    fn test_bounded_position() {
        let rule = sample_rule(1, "10.0.0.1", 80, RuleKind::Allow);
        assert_eq!(bounded_position(1, 1, &rule), Position::At(1));
        assert_eq!(bounded_position(2, 1, &rule), Position::At(2));
        assert_eq!(bounded_position(3, 1, &rule), Position::Append);
    }

    proptest! {
        #[test]
        fn test_arrival_order_never_changes_final_order(
            priorities in prop::collection::vec(1i32..50, 1..8)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = MemoryStore::new();
                let chain = ChainRecorder::new();

                for priority in &priorities {
                    let rule = store
                        .insert(new_rule("srv", 25565, RuleKind::Allow, *priority))
                        .await
                        .unwrap();
                    let position = calculate_position(&store, &chain, &rule).await.unwrap();
                    chain.apply(&rule, position).await.unwrap();
                }

                let live: Vec<i32> = chain.entries().iter().map(|r| r.priority).collect();
                let mut expected = priorities.clone();
                expected.sort_unstable();
                prop_assert_eq!(live, expected);
                Ok(())
            })?;
        }
    }
}
