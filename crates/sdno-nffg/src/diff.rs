//! Structural diff between a deployed graph and a newly submitted one.
//!
//! The diff drives the update path: entities present only in the new graph
//! come out `new`, unchanged entities `already_deployed`, and entities that
//! disappeared (or changed in place) `to_be_deleted`. A changed entity is
//! reported twice-in-one: the old definition is deleted and the new one
//! reinstalled, so the result carries the new definition with status `new`
//! while the reconciler first drops whatever the old one left behind.

use crate::model::{EntityStatus, Nffg};

impl Nffg {
    /// Computes the update graph `self -> new`, where `self` is the deployed
    /// graph (db ids populated).
    ///
    /// The result contains the union of both graphs with statuses set; the
    /// deployed db ids are carried over on `already_deployed` and
    /// `to_be_deleted` entries so the reconciler can delete by row id.
    pub fn diff(&self, new: &Nffg) -> Nffg {
        let mut out = new.clone();
        out.id = new.id.clone().or_else(|| self.id.clone());

        // Endpoints
        for ep in &mut out.end_points {
            match self.endpoint(&ep.id) {
                Some(old) if old.same_definition(ep) => {
                    ep.status = Some(EntityStatus::AlreadyDeployed);
                    ep.db_id = old.db_id;
                }
                // Changed in place: reinstall under the same graph id.
                Some(_) | None => ep.status = Some(EntityStatus::New),
            }
        }
        for old in &self.end_points {
            if new.endpoint(&old.id).is_none() {
                let mut gone = old.clone();
                gone.status = Some(EntityStatus::ToBeDeleted);
                out.end_points.push(gone);
            } else if new
                .endpoint(&old.id)
                .map(|ep| !old.same_definition(ep))
                .unwrap_or(false)
            {
                // The new definition is already in `out` with status new;
                // append the old one so its resources are torn down first.
                let mut gone = old.clone();
                gone.status = Some(EntityStatus::ToBeDeleted);
                out.end_points.push(gone);
            }
        }

        // Flow rules
        for fr in &mut out.flow_rules {
            match self.flow_rule(&fr.id) {
                Some(old) if old.same_definition(fr) => {
                    fr.status = Some(EntityStatus::AlreadyDeployed);
                    fr.db_id = old.db_id;
                }
                Some(_) | None => fr.status = Some(EntityStatus::New),
            }
        }
        for old in &self.flow_rules {
            if new.flow_rule(&old.id).is_none() {
                let mut gone = old.clone();
                gone.status = Some(EntityStatus::ToBeDeleted);
                out.flow_rules.push(gone);
            }
        }

        // VNFs
        for vnf in &mut out.vnfs {
            match self.vnf(&vnf.id) {
                Some(old) if old.same_definition(vnf) => {
                    vnf.status = Some(EntityStatus::AlreadyDeployed);
                    vnf.db_id = old.db_id;
                }
                Some(old) => {
                    // Same function, new port layout: reconfigure in place.
                    vnf.status = Some(EntityStatus::ToBeUpdated);
                    vnf.db_id = old.db_id;
                }
                None => vnf.status = Some(EntityStatus::New),
            }
        }
        for old in &self.vnfs {
            if new.vnf(&old.id).is_none() {
                let mut gone = old.clone();
                gone.status = Some(EntityStatus::ToBeDeleted);
                out.vnfs.push(gone);
            }
        }

        out
    }
}
