//! Transport VLAN allocation.
//!
//! A carrier VLAN isolates one logical flow on one link segment. The
//! allocator asks the store which ids are already taken on the target
//! (switch, ingress port, match tuple) and hands out the preferred id when
//! still free, otherwise the first free id from the configured ranges.

use sdno_nffg::Match;
use sdno_store::GraphStore;

use crate::error::DoResult;

#[derive(Debug, Clone)]
pub struct VlanAllocator {
    /// Allowed `[lo, hi]` ranges, sorted by low bound.
    ranges: Vec<(u16, u16)>,
}

impl VlanAllocator {
    pub fn new(ranges: Vec<(u16, u16)>) -> Self {
        VlanAllocator { ranges }
    }

    pub fn is_allowed(&self, vid: u16) -> bool {
        self.ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&vid))
    }

    /// A VLAN id free on (switch, port_in) for flows sharing this match
    /// tuple; `None` when every allowed id is taken.
    pub async fn free_vlan_on(
        &self,
        store: &GraphStore,
        switch_id: &str,
        port_in: &str,
        m: &Match,
        preferred: Option<u16>,
    ) -> DoResult<Option<u16>> {
        let busy = store.busy_vlans_on(switch_id, port_in, m).await?;

        if let Some(vid) = preferred {
            if !busy.contains(&vid) {
                return Ok(Some(vid));
            }
        }

        for (lo, hi) in &self.ranges {
            for vid in *lo..=*hi {
                if !busy.contains(&vid) {
                    return Ok(Some(vid));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdno_nffg::{Action, FlowRule};

    async fn install_external(store: &GraphStore, session: &str, vlan: Option<u16>, name: &str) {
        let mut rule = FlowRule::new(
            "f1",
            10,
            Match {
                port_in: Some("3".to_string()),
                vlan_id: vlan,
                ..Default::default()
            },
            vec![Action::Output("1".to_string())],
        );
        rule.internal_id = Some(name.to_string());
        store
            .add_flow_rule(session, Some("s2"), &rule, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_preferred_id_wins_when_free() {
        let store = GraphStore::connect_in_memory().await.unwrap();
        let allocator = VlanAllocator::new(vec![(280, 289)]);
        let vid = allocator
            .free_vlan_on(&store, "s2", "3", &Match::default(), Some(285))
            .await
            .unwrap();
        assert_eq!(vid, Some(285));
    }

    #[tokio::test]
    async fn test_first_free_id_from_ranges() {
        let store = GraphStore::connect_in_memory().await.unwrap();
        let session = store.new_session_id().await.unwrap();
        install_external(&store, &session, Some(280), "f1_0").await;
        install_external(&store, &session, Some(281), "f1_1").await;

        let allocator = VlanAllocator::new(vec![(280, 289)]);
        let vid = allocator
            .free_vlan_on(&store, "s2", "3", &Match::default(), None)
            .await
            .unwrap();
        assert_eq!(vid, Some(282));

        // The preferred id is busy, so allocation falls through to the
        // ranges.
        let vid = allocator
            .free_vlan_on(&store, "s2", "3", &Match::default(), Some(280))
            .await
            .unwrap();
        assert_eq!(vid, Some(282));
    }

    #[tokio::test]
    async fn test_exhausted_ranges_yield_none() {
        let store = GraphStore::connect_in_memory().await.unwrap();
        let session = store.new_session_id().await.unwrap();
        install_external(&store, &session, Some(290), "f1_0").await;
        install_external(&store, &session, Some(291), "f1_1").await;

        let allocator = VlanAllocator::new(vec![(290, 291)]);
        let vid = allocator
            .free_vlan_on(&store, "s2", "3", &Match::default(), None)
            .await
            .unwrap();
        assert_eq!(vid, None);
    }

    #[tokio::test]
    async fn test_busy_set_is_per_match_tuple() {
        let store = GraphStore::connect_in_memory().await.unwrap();
        let session = store.new_session_id().await.unwrap();
        install_external(&store, &session, Some(280), "f1_0").await;

        // A different non-vlan tuple does not see 280 as busy.
        let other = Match {
            port_in: Some("3".to_string()),
            source_mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ..Default::default()
        };
        let allocator = VlanAllocator::new(vec![(280, 289)]);
        let vid = allocator
            .free_vlan_on(&store, "s2", "3", &other, None)
            .await
            .unwrap();
        assert_eq!(vid, Some(280));
    }
}
