//! The GraphStore itself.
//!
//! Reads that find nothing return `None`/empty collections; writes run in
//! one explicit transaction per operation and either commit whole or leave
//! the database untouched.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use sdno_nffg::{Action, EntityStatus, FlowRule, Match, Nffg, PortRef, Vnf, VnfPort};

use crate::models::{
    ActionRow, EndpointResourceRow, EndpointRow, FlowRuleRow, MatchRow, PortRow, SessionRow,
    SessionStatus, StoredFlowRule, VnfPortRow, VnfRow, FLOW_TYPE_EXTERNAL,
};
use crate::schema::SCHEMA;

/// How many times a colliding session id is re-rolled before giving up.
const SESSION_ID_RETRIES: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage invariant violated: {0}")]
    Internal(String),
}

#[derive(Clone)]
pub struct GraphStore {
    pool: SqlitePool,
}

impl GraphStore {
    /// Opens the store and applies the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options: SqliteConnectOptions = url
            .parse::<SqliteConnectOptions>()
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        // SQLite serialises writers anyway; a single connection also keeps
        // `sqlite::memory:` pools on one database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = GraphStore { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store, used by tests and dry runs.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Connectivity probe for boot.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /*
     * Session handling
     */

    /// Allocates a fresh 128-bit session id, re-rolling on collision.
    pub async fn new_session_id(&self) -> Result<String, StoreError> {
        for _ in 0..SESSION_ID_RETRIES {
            let candidate = Uuid::new_v4().simple().to_string();
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT session_id FROM graph_session WHERE session_id = ?")
                    .bind(&candidate)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Ok(candidate);
            }
        }
        Err(StoreError::Internal(
            "could not allocate a unique session id".to_string(),
        ))
    }

    pub async fn session(&self, session_id: &str) -> Result<Option<SessionRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, SessionRow>("SELECT * FROM graph_session WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Newest non-ended session for (user, graph). With `error_aware`, a
    /// session already in error is not considered active.
    pub async fn active_session(
        &self,
        user_id: &str,
        graph_id: &str,
        error_aware: bool,
    ) -> Result<Option<SessionRow>, StoreError> {
        let query = if error_aware {
            "SELECT * FROM graph_session
             WHERE user_id = ? AND graph_id = ? AND ended IS NULL AND error IS NULL
             ORDER BY started_at DESC LIMIT 1"
        } else {
            "SELECT * FROM graph_session
             WHERE user_id = ? AND graph_id = ? AND ended IS NULL
             ORDER BY started_at DESC LIMIT 1"
        };
        Ok(sqlx::query_as::<_, SessionRow>(query)
            .bind(user_id)
            .bind(graph_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn graph_id_exists(&self, graph_id: &str) -> Result<bool, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT graph_id FROM graph_session WHERE graph_id = ? LIMIT 1")
                .bind(graph_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE graph_session SET status = ?, last_update = ? WHERE session_id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_error(&self, session_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE graph_session SET status = 'error', error = ?, last_update = ? WHERE session_id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_ended(&self, session_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE graph_session SET status = 'deleted', ended = ?, last_update = ? WHERE session_id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /*
     * Graph persistence
     */

    /// Persists a whole new graph: session, endpoints with their ports,
    /// VNFs bound to their implementing applications, and the logical flow
    /// rules. Returns the new session id. The endpoints' and VNFs' `db_id`
    /// fields are filled in on the way.
    pub async fn store_graph(
        &self,
        nffg: &mut Nffg,
        user_id: &str,
        app_names: &HashMap<String, String>,
        gre_bridge_id: &str,
    ) -> Result<String, StoreError> {
        let session_id = self.new_session_id().await?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO graph_session
             (session_id, user_id, graph_id, graph_name, status, started_at, last_update, description)
             VALUES (?, ?, ?, ?, 'initialization', ?, ?, ?)",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(nffg.id.as_deref().unwrap_or_default())
        .bind(&nffg.name)
        .bind(&now)
        .bind(&now)
        .bind(&nffg.description)
        .execute(&mut *tx)
        .await?;

        for i in 0..nffg.end_points.len() {
            let ep_id =
                Self::insert_endpoint(&mut tx, &session_id, nffg, i, gre_bridge_id).await?;
            nffg.end_points[i].db_id = Some(ep_id);
        }
        for i in 0..nffg.vnfs.len() {
            let app = app_names.get(&nffg.vnfs[i].id).map(|s| s.as_str());
            let vnf_id = Self::insert_vnf(&mut tx, &session_id, &nffg.vnfs[i], app).await?;
            nffg.vnfs[i].db_id = Some(vnf_id);
        }
        for i in 0..nffg.flow_rules.len() {
            let rule = nffg.flow_rules[i].clone();
            let id = Self::insert_flow_rule(&mut tx, &session_id, None, &rule, Some(nffg)).await?;
            nffg.flow_rules[i].db_id = Some(id);
        }

        tx.commit().await?;
        debug!(%session_id, "graph stored");
        Ok(session_id)
    }

    /// Applies the insert half of an update diff: entities whose status is
    /// `new` (or unset) are persisted, `already_deployed` ones are left
    /// untouched.
    pub async fn update_graph(
        &self,
        diff: &mut Nffg,
        session_id: &str,
        app_names: &HashMap<String, String>,
        gre_bridge_id: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for i in 0..diff.end_points.len() {
            match diff.end_points[i].status {
                Some(EntityStatus::New) | None => {
                    let ep_id =
                        Self::insert_endpoint(&mut tx, session_id, diff, i, gre_bridge_id).await?;
                    diff.end_points[i].db_id = Some(ep_id);
                }
                _ => {}
            }
        }
        for i in 0..diff.vnfs.len() {
            match diff.vnfs[i].status {
                Some(EntityStatus::New) | None => {
                    let app = app_names.get(&diff.vnfs[i].id).map(|s| s.as_str());
                    let vnf_id = Self::insert_vnf(&mut tx, session_id, &diff.vnfs[i], app).await?;
                    diff.vnfs[i].db_id = Some(vnf_id);
                }
                _ => {}
            }
        }
        for i in 0..diff.flow_rules.len() {
            match diff.flow_rules[i].status {
                Some(EntityStatus::New) | None => {
                    let rule = diff.flow_rules[i].clone();
                    let id =
                        Self::insert_flow_rule(&mut tx, session_id, None, &rule, Some(diff)).await?;
                    diff.flow_rules[i].db_id = Some(id);
                }
                _ => {}
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Persists one flow rule. When `nffg` is given, symbolic port
    /// references are resolved against it and endpoint-resource links are
    /// recorded; rules carrying an `internal_id` are stored as `external`.
    pub async fn add_flow_rule(
        &self,
        session_id: &str,
        switch_id: Option<&str>,
        rule: &FlowRule,
        nffg: Option<&Nffg>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = Self::insert_flow_rule(&mut tx, session_id, switch_id, rule, nffg).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Reconstructs the logical NF-FG of a session (`external` flow rules
    /// are projection-dropped).
    pub async fn load_graph(&self, session_id: &str) -> Result<Option<Nffg>, StoreError> {
        let Some(session) = self.session(session_id).await? else {
            return Ok(None);
        };

        let mut nffg = Nffg {
            id: Some(session.graph_id.clone()),
            name: session.graph_name.clone(),
            description: session.description.clone(),
            ..Default::default()
        };

        let endpoints = self.endpoints_by_session(session_id).await?;
        for ep_row in &endpoints {
            let mut ep = sdno_nffg::Endpoint {
                id: ep_row.graph_endpoint_id.clone(),
                name: ep_row.name.clone(),
                kind: match ep_row.r#type.as_str() {
                    "vlan" => sdno_nffg::EndpointKind::Vlan,
                    "gre-tunnel" => sdno_nffg::EndpointKind::GreTunnel,
                    _ => sdno_nffg::EndpointKind::Interface,
                },
                node_id: None,
                interface: None,
                vlan_id: None,
                local_ip: None,
                remote_ip: None,
                gre_key: None,
                ttl: None,
                status: None,
                db_id: Some(ep_row.id),
            };
            if let Some(port) = self.port_for_endpoint(ep_row.id).await? {
                ep.node_id = port.switch_id.clone();
                ep.interface = Some(port.graph_port_id.clone());
                ep.vlan_id = port.vlan_id.map(|v| v as u16);
                ep.local_ip = port.ipv4_address.clone();
                ep.remote_ip = port.tunnel_remote_ip.clone();
                ep.gre_key = port.gre_key.clone();
            }
            nffg.end_points.push(ep);
        }

        let vnf_rows = self.vnfs_by_session(session_id).await?;
        for vnf_row in vnf_rows {
            let ports = self
                .vnf_ports(vnf_row.id)
                .await?
                .into_iter()
                .map(|p| VnfPort {
                    id: p.graph_port_id,
                    name: p.name,
                    db_id: Some(p.id),
                })
                .collect();
            nffg.vnfs.push(Vnf {
                id: vnf_row.graph_vnf_id,
                name: vnf_row.name,
                template: vnf_row.template,
                functional_capability: vnf_row.functional_capability,
                ports,
                status: None,
                db_id: Some(vnf_row.id),
            });
        }

        let rules = self.flow_rules_by_session(session_id, None).await?;
        for rule_row in rules {
            if rule_row.is_external() {
                continue;
            }
            let match_row = self.match_for_flow_rule(rule_row.id).await?;
            let action_rows = self.actions_for_flow_rule(rule_row.id).await?;
            let match_rule = match match_row {
                Some(m) => {
                    let port_in = m.port_in.clone();
                    m.to_match(port_in)
                }
                None => Match::default(),
            };
            let actions = action_rows
                .iter()
                .filter_map(|row| row.to_action(None))
                .collect();
            nffg.flow_rules.push(FlowRule {
                id: rule_row.graph_flow_rule_id.clone(),
                priority: rule_row.priority as u16,
                match_rule,
                actions,
                status: None,
                internal_id: rule_row.internal_id.clone(),
                db_id: Some(rule_row.id),
            });
        }

        Ok(Some(nffg))
    }

    /// All graphs whose session is `complete`, as (graph id, NF-FG) pairs.
    pub async fn list_graphs(&self) -> Result<Vec<(String, Nffg)>, StoreError> {
        let sessions = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM graph_session WHERE status = 'complete'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut graphs = Vec::with_capacity(sessions.len());
        for session in sessions {
            if let Some(nffg) = self.load_graph(&session.session_id).await? {
                graphs.push((session.graph_id, nffg));
            }
        }
        Ok(graphs)
    }

    /*
     * Probes used by the realiser
     */

    /// A flow rule on (switch, port_in) whose match equals the given rule's
    /// match on every field, priority included. Collision probe.
    pub async fn flow_on_switch(
        &self,
        switch_id: &str,
        port_in: &str,
        rule: &FlowRule,
    ) -> Result<Option<StoredFlowRule>, StoreError> {
        let m = &rule.match_rule;
        let row = sqlx::query(
            "SELECT f.id AS f_id, m.id AS m_id
             FROM flow_rule f JOIN match_rule m ON m.flow_rule_id = f.id
             WHERE f.switch_id = ? AND m.port_in = ?
               AND f.priority = ?
               AND m.vlan_id IS ? AND m.vlan_priority IS ?
               AND m.ether_type IS ? AND m.source_mac IS ? AND m.dest_mac IS ?
               AND m.source_ip IS ? AND m.dest_ip IS ? AND m.tos_bits IS ?
               AND m.source_port IS ? AND m.dest_port IS ? AND m.protocol IS ?
             LIMIT 1",
        )
        .bind(switch_id)
        .bind(port_in)
        .bind(rule.priority as i64)
        .bind(m.vlan_id.map(|v| v as i64))
        .bind(m.vlan_priority.map(|v| v as i64))
        .bind(&m.ether_type)
        .bind(&m.source_mac)
        .bind(&m.dest_mac)
        .bind(&m.source_ip)
        .bind(&m.dest_ip)
        .bind(&m.tos_bits)
        .bind(m.source_port.map(|v| v as i64))
        .bind(m.dest_port.map(|v| v as i64))
        .bind(&m.protocol)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let flow_id: i64 = row.get("f_id");
        let rule_row = self
            .flow_rule_by_id(flow_id)
            .await?
            .ok_or_else(|| StoreError::Internal("collision probe lost its row".to_string()))?;
        let match_row = self
            .match_for_flow_rule(flow_id)
            .await?
            .ok_or_else(|| StoreError::Internal("flow rule without match".to_string()))?;
        Ok(Some(StoredFlowRule {
            rule: rule_row,
            match_rule: match_row,
        }))
    }

    /// Flow rules on (switch, port_in) equal on every *non-vlan* match
    /// field. Feeds the busy-VLAN computation.
    pub async fn matches_on_switch(
        &self,
        switch_id: &str,
        port_in: &str,
        m: &Match,
    ) -> Result<Vec<StoredFlowRule>, StoreError> {
        let rows = sqlx::query_as::<_, MatchRow>(
            "SELECT m.* FROM flow_rule f JOIN match_rule m ON m.flow_rule_id = f.id
             WHERE f.switch_id = ? AND m.port_in = ?
               AND m.ether_type IS ? AND m.source_mac IS ? AND m.dest_mac IS ?
               AND m.source_ip IS ? AND m.dest_ip IS ? AND m.tos_bits IS ?
               AND m.source_port IS ? AND m.dest_port IS ? AND m.protocol IS ?",
        )
        .bind(switch_id)
        .bind(port_in)
        .bind(&m.ether_type)
        .bind(&m.source_mac)
        .bind(&m.dest_mac)
        .bind(&m.source_ip)
        .bind(&m.dest_ip)
        .bind(&m.tos_bits)
        .bind(m.source_port.map(|v| v as i64))
        .bind(m.dest_port.map(|v| v as i64))
        .bind(&m.protocol)
        .fetch_all(&self.pool)
        .await?;

        let mut found = Vec::with_capacity(rows.len());
        for match_row in rows {
            let rule_row = self
                .flow_rule_by_id(match_row.flow_rule_id)
                .await?
                .ok_or_else(|| StoreError::Internal("match without flow rule".to_string()))?;
            found.push(StoredFlowRule {
                rule: rule_row,
                match_rule: match_row,
            });
        }
        Ok(found)
    }

    /// The VLAN ids already in use on (switch, port_in) by flows sharing the
    /// same non-vlan match tuple.
    pub async fn busy_vlans_on(
        &self,
        switch_id: &str,
        port_in: &str,
        m: &Match,
    ) -> Result<HashSet<u16>, StoreError> {
        Ok(self
            .matches_on_switch(switch_id, port_in, m)
            .await?
            .into_iter()
            .filter_map(|f| f.match_rule.vlan_id.map(|v| v as u16))
            .collect())
    }

    /// An endpoint is "direct" when an installed flow already consumes the
    /// whole (switch, port_in) untagged, i.e. matches with a null vlan id.
    pub async fn is_direct_endpoint(
        &self,
        port_in: &str,
        switch_id: &str,
    ) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT f.id FROM flow_rule f JOIN match_rule m ON m.flow_rule_id = f.id
             WHERE f.switch_id = ? AND m.port_in = ? AND m.vlan_id IS NULL
               AND f.type = 'external'
             LIMIT 1",
        )
        .bind(switch_id)
        .bind(port_in)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Percentage of logical flow rules with at least one installed external
    /// realisation.
    pub async fn flow_rule_progress(&self, session_id: &str) -> Result<u8, StoreError> {
        let logical = sqlx::query_as::<_, FlowRuleRow>(
            "SELECT * FROM flow_rule WHERE session_id = ? AND type IS NULL",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        if logical.is_empty() {
            return Ok(0);
        }
        let mut realised = 0usize;
        for rule in &logical {
            let external: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM flow_rule
                 WHERE session_id = ? AND graph_flow_rule_id = ? AND type = 'external'
                 LIMIT 1",
            )
            .bind(session_id)
            .bind(&rule.graph_flow_rule_id)
            .fetch_optional(&self.pool)
            .await?;
            if external.is_some() {
                realised += 1;
            }
        }
        Ok((realised * 100 / logical.len()) as u8)
    }

    pub async fn external_flow_exists(
        &self,
        switch_id: &str,
        internal_id: &str,
    ) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM flow_rule
             WHERE switch_id = ? AND internal_id = ? AND type = 'external'
             LIMIT 1",
        )
        .bind(switch_id)
        .bind(internal_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn externals_for_graph_rule(
        &self,
        switch_id: &str,
        graph_flow_rule_id: &str,
    ) -> Result<Vec<FlowRuleRow>, StoreError> {
        Ok(sqlx::query_as::<_, FlowRuleRow>(
            "SELECT * FROM flow_rule
             WHERE switch_id = ? AND graph_flow_rule_id = ? AND type = 'external'
             ORDER BY internal_id ASC",
        )
        .bind(switch_id)
        .bind(graph_flow_rule_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /*
     * Row lookups
     */

    pub async fn endpoints_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<EndpointRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, EndpointRow>("SELECT * FROM endpoint WHERE session_id = ?")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn endpoint_by_graph_id(
        &self,
        graph_endpoint_id: &str,
        session_id: &str,
    ) -> Result<Option<EndpointRow>, StoreError> {
        Ok(sqlx::query_as::<_, EndpointRow>(
            "SELECT * FROM endpoint WHERE session_id = ? AND graph_endpoint_id = ?",
        )
        .bind(session_id)
        .bind(graph_endpoint_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn endpoint_by_id(&self, id: i64) -> Result<Option<EndpointRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, EndpointRow>("SELECT * FROM endpoint WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn endpoint_resources(
        &self,
        endpoint_id: i64,
    ) -> Result<Vec<EndpointResourceRow>, StoreError> {
        Ok(sqlx::query_as::<_, EndpointResourceRow>(
            "SELECT * FROM endpoint_resource WHERE endpoint_id = ?",
        )
        .bind(endpoint_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn port_by_id(&self, id: i64) -> Result<Option<PortRow>, StoreError> {
        Ok(sqlx::query_as::<_, PortRow>("SELECT * FROM port WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn port_for_endpoint(&self, endpoint_id: i64) -> Result<Option<PortRow>, StoreError> {
        Ok(sqlx::query_as::<_, PortRow>(
            "SELECT p.* FROM port p
             JOIN endpoint_resource er ON er.resource_id = p.id AND er.resource_type = 'port'
             WHERE er.endpoint_id = ?",
        )
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn flow_rules_by_session(
        &self,
        session_id: &str,
        graph_flow_rule_id: Option<&str>,
    ) -> Result<Vec<FlowRuleRow>, StoreError> {
        let rows = match graph_flow_rule_id {
            Some(gid) => {
                sqlx::query_as::<_, FlowRuleRow>(
                    "SELECT * FROM flow_rule WHERE session_id = ? AND graph_flow_rule_id = ?",
                )
                .bind(session_id)
                .bind(gid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, FlowRuleRow>("SELECT * FROM flow_rule WHERE session_id = ?")
                    .bind(session_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows)
    }

    pub async fn flow_rule_by_id(&self, id: i64) -> Result<Option<FlowRuleRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, FlowRuleRow>("SELECT * FROM flow_rule WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn match_for_flow_rule(
        &self,
        flow_rule_id: i64,
    ) -> Result<Option<MatchRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, MatchRow>("SELECT * FROM match_rule WHERE flow_rule_id = ?")
                .bind(flow_rule_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn actions_for_flow_rule(
        &self,
        flow_rule_id: i64,
    ) -> Result<Vec<ActionRow>, StoreError> {
        Ok(sqlx::query_as::<_, ActionRow>(
            "SELECT * FROM action WHERE flow_rule_id = ? ORDER BY position ASC",
        )
        .bind(flow_rule_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn vnfs_by_session(&self, session_id: &str) -> Result<Vec<VnfRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, VnfRow>("SELECT * FROM vnf WHERE session_id = ?")
                .bind(session_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn vnf_by_graph_id(
        &self,
        session_id: &str,
        graph_vnf_id: &str,
    ) -> Result<Option<VnfRow>, StoreError> {
        Ok(sqlx::query_as::<_, VnfRow>(
            "SELECT * FROM vnf WHERE session_id = ? AND graph_vnf_id = ?",
        )
        .bind(session_id)
        .bind(graph_vnf_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn vnf_ports(&self, vnf_id: i64) -> Result<Vec<VnfPortRow>, StoreError> {
        Ok(
            sqlx::query_as::<_, VnfPortRow>("SELECT * FROM vnf_port WHERE vnf_id = ?")
                .bind(vnf_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Next free GRE interface name: `greN`, N = max existing + 1.
    pub async fn next_gre_ifname(&self) -> Result<String, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT graph_port_id FROM port WHERE graph_port_id LIKE 'gre%'")
                .fetch_all(&self.pool)
                .await?;
        let next = rows
            .iter()
            .filter_map(|(name,)| name.strip_prefix("gre")?.parse::<u32>().ok())
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);
        Ok(format!("gre{next}"))
    }

    /*
     * Deletions (dependency order)
     */

    /// Deletes one flow rule and everything hanging off it: its match, its
    /// actions and any endpoint-resource links pointing at it.
    pub async fn delete_flow_rule_by_id(&self, flow_rule_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM flow_rule WHERE id = ?")
            .bind(flow_rule_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM match_rule WHERE flow_rule_id = ?")
            .bind(flow_rule_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM action WHERE flow_rule_id = ?")
            .bind(flow_rule_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM endpoint_resource WHERE resource_id = ? AND resource_type = 'flow-rule'",
        )
        .bind(flow_rule_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_endpoint_by_id(&self, endpoint_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM endpoint WHERE id = ?")
            .bind(endpoint_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_port(&self, port_id: i64, session_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM port WHERE id = ? AND session_id = ?")
            .bind(port_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM endpoint_resource WHERE resource_id = ? AND resource_type = 'port'",
        )
        .bind(port_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_vnf_by_id(&self, vnf_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vnf WHERE id = ?")
            .bind(vnf_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM vnf_port WHERE vnf_id = ?")
            .bind(vnf_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /*
     * Insert helpers (transaction-scoped)
     */

    async fn insert_endpoint(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        session_id: &str,
        nffg: &Nffg,
        index: usize,
        gre_bridge_id: &str,
    ) -> Result<i64, StoreError> {
        let ep = &nffg.end_points[index];
        let result = sqlx::query(
            "INSERT INTO endpoint (graph_endpoint_id, session_id, name, type) VALUES (?, ?, ?, ?)",
        )
        .bind(&ep.id)
        .bind(session_id)
        .bind(&ep.name)
        .bind(ep.kind.as_str())
        .execute(&mut **tx)
        .await?;
        let endpoint_id = result.last_insert_rowid();

        // The attachment port; GRE endpoints get a generated greN interface
        // on the tunnel bridge.
        let (graph_port_id, switch_id) = match ep.kind {
            sdno_nffg::EndpointKind::GreTunnel => {
                let name = Self::next_gre_ifname_tx(tx).await?;
                (name, Some(gre_bridge_id.to_string()))
            }
            _ => (
                ep.interface.clone().unwrap_or_default(),
                ep.node_id.clone(),
            ),
        };
        let result = sqlx::query(
            "INSERT INTO port
             (graph_port_id, session_id, switch_id, vlan_id, ipv4_address, tunnel_remote_ip, gre_key, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'complete')",
        )
        .bind(&graph_port_id)
        .bind(session_id)
        .bind(&switch_id)
        .bind(ep.vlan_id.map(|v| v as i64))
        .bind(&ep.local_ip)
        .bind(&ep.remote_ip)
        .bind(&ep.gre_key)
        .execute(&mut **tx)
        .await?;
        let port_id = result.last_insert_rowid();

        sqlx::query(
            "INSERT INTO endpoint_resource (endpoint_id, resource_type, resource_id) VALUES (?, 'port', ?)",
        )
        .bind(endpoint_id)
        .bind(port_id)
        .execute(&mut **tx)
        .await?;

        Ok(endpoint_id)
    }

    async fn next_gre_ifname_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ) -> Result<String, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT graph_port_id FROM port WHERE graph_port_id LIKE 'gre%'")
                .fetch_all(&mut **tx)
                .await?;
        let next = rows
            .iter()
            .filter_map(|(name,)| name.strip_prefix("gre")?.parse::<u32>().ok())
            .max()
            .map(|n| n + 1)
            .unwrap_or(0);
        Ok(format!("gre{next}"))
    }

    async fn insert_vnf(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        session_id: &str,
        vnf: &Vnf,
        application_name: Option<&str>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO vnf
             (graph_vnf_id, session_id, name, template, functional_capability, application_name)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&vnf.id)
        .bind(session_id)
        .bind(&vnf.name)
        .bind(&vnf.template)
        .bind(&vnf.functional_capability)
        .bind(application_name)
        .execute(&mut **tx)
        .await?;
        let vnf_id = result.last_insert_rowid();

        for port in &vnf.ports {
            sqlx::query("INSERT INTO vnf_port (graph_port_id, vnf_id, name) VALUES (?, ?, ?)")
                .bind(&port.id)
                .bind(vnf_id)
                .bind(&port.name)
                .execute(&mut **tx)
                .await?;
        }
        Ok(vnf_id)
    }

    async fn insert_flow_rule(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        session_id: &str,
        switch_id: Option<&str>,
        rule: &FlowRule,
        nffg: Option<&Nffg>,
    ) -> Result<i64, StoreError> {
        let now = Utc::now().to_rfc3339();
        let flow_type = rule.internal_id.as_ref().map(|_| FLOW_TYPE_EXTERNAL);
        let result = sqlx::query(
            "INSERT INTO flow_rule
             (graph_flow_rule_id, internal_id, session_id, switch_id, type, priority, status, creation_date, last_update)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.id)
        .bind(&rule.internal_id)
        .bind(session_id)
        .bind(switch_id)
        .bind(flow_type)
        .bind(rule.priority as i64)
        .bind(if flow_type.is_some() { Some("complete") } else { None })
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;
        let flow_rule_id = result.last_insert_rowid();

        // Match: flow rule and match are 1:1, the match reuses the rule id.
        let m = &rule.match_rule;
        let port_in_type = m.port_in.as_deref().map(|p| match PortRef::parse(p) {
            Some(PortRef::Endpoint(_)) => "endpoint",
            Some(PortRef::VnfPort { .. }) => "vnf",
            None => "port",
        });
        sqlx::query(
            "INSERT INTO match_rule
             (id, flow_rule_id, port_in_type, port_in, ether_type, vlan_id, vlan_priority,
              source_mac, dest_mac, source_ip, dest_ip, tos_bits, source_port, dest_port, protocol)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(flow_rule_id)
        .bind(flow_rule_id)
        .bind(port_in_type)
        .bind(&m.port_in)
        .bind(&m.ether_type)
        .bind(m.vlan_id.map(|v| v as i64))
        .bind(m.vlan_priority.map(|v| v as i64))
        .bind(&m.source_mac)
        .bind(&m.dest_mac)
        .bind(&m.source_ip)
        .bind(&m.dest_ip)
        .bind(&m.tos_bits)
        .bind(m.source_port.map(|v| v as i64))
        .bind(m.dest_port.map(|v| v as i64))
        .bind(&m.protocol)
        .execute(&mut **tx)
        .await?;

        // Ingress endpoint-resource link for symbolic rules.
        if let Some(nffg) = nffg {
            if let Some(PortRef::Endpoint(gid)) =
                m.port_in.as_deref().and_then(PortRef::parse)
            {
                if let Some(ep_db_id) = nffg.endpoint(&gid).and_then(|ep| ep.db_id) {
                    Self::link_flow_rule(tx, ep_db_id, flow_rule_id).await?;
                }
            }
        }

        for (position, action) in rule.actions.iter().enumerate() {
            Self::insert_action(tx, flow_rule_id, position as i64, action).await?;
            if let (Some(nffg), Some(PortRef::Endpoint(gid))) =
                (nffg, action.output().and_then(PortRef::parse))
            {
                if let Some(ep_db_id) = nffg.endpoint(&gid).and_then(|ep| ep.db_id) {
                    Self::link_flow_rule(tx, ep_db_id, flow_rule_id).await?;
                }
            }
        }

        Ok(flow_rule_id)
    }

    async fn link_flow_rule(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        endpoint_id: i64,
        flow_rule_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO endpoint_resource (endpoint_id, resource_type, resource_id)
             VALUES (?, 'flow-rule', ?)",
        )
        .bind(endpoint_id)
        .bind(flow_rule_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_action(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        flow_rule_id: i64,
        position: i64,
        action: &Action,
    ) -> Result<(), StoreError> {
        let mut output_type: Option<&str> = None;
        let mut output_to_port: Option<String> = None;
        let mut output_to_controller: Option<bool> = None;
        let mut drop_packet: Option<bool> = None;
        let mut set_vlan_id: Option<i64> = None;
        let mut set_vlan_priority: Option<i64> = None;
        let mut push_vlan: Option<i64> = None;
        let mut has_push_vlan: Option<bool> = None;
        let mut pop_vlan: Option<bool> = None;
        let mut set_eth_src: Option<&str> = None;
        let mut set_eth_dst: Option<&str> = None;
        let mut set_ip_src: Option<&str> = None;
        let mut set_ip_dst: Option<&str> = None;
        let mut set_ip_tos: Option<&str> = None;
        let mut set_l4_src_port: Option<i64> = None;
        let mut set_l4_dst_port: Option<i64> = None;
        let mut output_to_queue: Option<&str> = None;

        match action {
            Action::Output(port) => {
                output_to_port = Some(port.clone());
                output_type = Some(match PortRef::parse(port) {
                    Some(PortRef::Endpoint(_)) => "endpoint",
                    Some(PortRef::VnfPort { .. }) => "vnf",
                    None => "port",
                });
            }
            Action::OutputToController => output_to_controller = Some(true),
            Action::OutputToQueue(q) => output_to_queue = Some(q),
            Action::Drop => drop_packet = Some(true),
            Action::PushVlan(vid) => {
                has_push_vlan = Some(true);
                push_vlan = vid.map(|v| v as i64);
            }
            Action::SetVlanId(vid) => set_vlan_id = Some(*vid as i64),
            Action::SetVlanPriority(pcp) => set_vlan_priority = Some(*pcp as i64),
            Action::PopVlan => pop_vlan = Some(true),
            Action::SetEthSrc(mac) => set_eth_src = Some(mac),
            Action::SetEthDst(mac) => set_eth_dst = Some(mac),
            Action::SetIpSrc(ip) => set_ip_src = Some(ip),
            Action::SetIpDst(ip) => set_ip_dst = Some(ip),
            Action::SetIpTos(tos) => set_ip_tos = Some(tos),
            Action::SetL4Src(p) => set_l4_src_port = Some(*p as i64),
            Action::SetL4Dst(p) => set_l4_dst_port = Some(*p as i64),
        }

        sqlx::query(
            "INSERT INTO action
             (flow_rule_id, position, output_type, output_to_port, output_to_controller,
              drop_packet, set_vlan_id, set_vlan_priority, push_vlan, has_push_vlan, pop_vlan,
              set_eth_src, set_eth_dst, set_ip_src, set_ip_dst, set_ip_tos,
              set_l4_src_port, set_l4_dst_port, output_to_queue)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(flow_rule_id)
        .bind(position)
        .bind(output_type)
        .bind(&output_to_port)
        .bind(output_to_controller)
        .bind(drop_packet)
        .bind(set_vlan_id)
        .bind(set_vlan_priority)
        .bind(push_vlan)
        .bind(has_push_vlan)
        .bind(pop_vlan)
        .bind(set_eth_src)
        .bind(set_eth_dst)
        .bind(set_ip_src)
        .bind(set_ip_dst)
        .bind(set_ip_tos)
        .bind(set_l4_src_port)
        .bind(set_l4_dst_port)
        .bind(output_to_queue)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RESOURCE_FLOW_RULE, RESOURCE_PORT};
    use sdno_nffg::{Endpoint, EndpointKind};

    fn sample_graph() -> Nffg {
        Nffg {
            id: Some("g1".to_string()),
            name: Some("demo".to_string()),
            end_points: vec![
                Endpoint::interface_on("a", "s1", "eth1"),
                Endpoint::vlan_on("b", "s2", "eth1", 25),
            ],
            flow_rules: vec![FlowRule::new(
                "f1",
                10,
                Match::from_port("endpoint:a"),
                vec![Action::Output("endpoint:b".to_string())],
            )],
            ..Default::default()
        }
    }

    async fn store_with_graph() -> (GraphStore, String) {
        let store = GraphStore::connect_in_memory().await.unwrap();
        let mut nffg = sample_graph();
        let session_id = store
            .store_graph(&mut nffg, "admin", &HashMap::new(), "br-gre")
            .await
            .unwrap();
        (store, session_id)
    }

    #[tokio::test]
    async fn test_store_and_load_round_trip() {
        let (store, session_id) = store_with_graph().await;
        let loaded = store.load_graph(&session_id).await.unwrap().unwrap();

        assert_eq!(loaded.id.as_deref(), Some("g1"));
        assert_eq!(loaded.end_points.len(), 2);
        let b = loaded.endpoint("b").unwrap();
        assert_eq!(b.kind, EndpointKind::Vlan);
        assert_eq!(b.vlan_id, Some(25));
        assert_eq!(b.node_id.as_deref(), Some("s2"));

        assert_eq!(loaded.flow_rules.len(), 1);
        let f1 = &loaded.flow_rules[0];
        assert_eq!(f1.match_rule.port_in.as_deref(), Some("endpoint:a"));
        assert_eq!(f1.output_action(), Some("endpoint:b"));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (store, session_id) = store_with_graph().await;
        let session = store.session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status(), SessionStatus::Initialization);

        store
            .update_status(&session_id, SessionStatus::Complete)
            .await
            .unwrap();
        let active = store.active_session("admin", "g1", true).await.unwrap();
        assert!(active.is_some());

        store.update_error(&session_id).await.unwrap();
        assert!(store
            .active_session("admin", "g1", true)
            .await
            .unwrap()
            .is_none());
        // Not error-aware: the errored session is still the newest live one.
        assert!(store
            .active_session("admin", "g1", false)
            .await
            .unwrap()
            .is_some());

        store.update_ended(&session_id).await.unwrap();
        assert!(store
            .active_session("admin", "g1", false)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_list_graphs_only_complete() {
        let (store, session_id) = store_with_graph().await;
        assert!(store.list_graphs().await.unwrap().is_empty());
        store
            .update_status(&session_id, SessionStatus::Complete)
            .await
            .unwrap();
        let graphs = store.list_graphs().await.unwrap();
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].0, "g1");
    }

    #[tokio::test]
    async fn test_external_flow_and_collision_probe() {
        let (store, session_id) = store_with_graph().await;

        let mut external = FlowRule::new(
            "f1",
            10,
            Match {
                port_in: Some("1".to_string()),
                vlan_id: Some(280),
                ..Default::default()
            },
            vec![Action::Output("3".to_string())],
        );
        external.internal_id = Some("f1_0".to_string());
        store
            .add_flow_rule(&session_id, Some("s1"), &external, None)
            .await
            .unwrap();

        // Same match, same priority: collision.
        let probe = store
            .flow_on_switch("s1", "1", &external)
            .await
            .unwrap();
        assert!(probe.is_some());

        // Different vlan: no collision, but same non-vlan tuple.
        let mut other = external.clone();
        other.match_rule.vlan_id = Some(281);
        assert!(store.flow_on_switch("s1", "1", &other).await.unwrap().is_none());

        let busy = store
            .busy_vlans_on("s1", "1", &other.match_rule)
            .await
            .unwrap();
        assert!(busy.contains(&280));
        assert!(!busy.contains(&281));

        assert!(store.external_flow_exists("s1", "f1_0").await.unwrap());
        assert!(!store.external_flow_exists("s1", "f1_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_direct_endpoint_detection() {
        let (store, session_id) = store_with_graph().await;

        assert!(!store.is_direct_endpoint("1", "s1").await.unwrap());

        let mut external = FlowRule::new(
            "f1",
            10,
            Match::from_port("1"),
            vec![Action::Output("3".to_string())],
        );
        external.internal_id = Some("f1_0".to_string());
        store
            .add_flow_rule(&session_id, Some("s1"), &external, None)
            .await
            .unwrap();

        assert!(store.is_direct_endpoint("1", "s1").await.unwrap());
        assert!(!store.is_direct_endpoint("2", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_flow_rule_progress() {
        let (store, session_id) = store_with_graph().await;
        assert_eq!(store.flow_rule_progress(&session_id).await.unwrap(), 0);

        let mut external = FlowRule::new(
            "f1",
            10,
            Match::from_port("1"),
            vec![Action::Output("2".to_string())],
        );
        external.internal_id = Some("f1_0".to_string());
        store
            .add_flow_rule(&session_id, Some("s1"), &external, None)
            .await
            .unwrap();

        assert_eq!(store.flow_rule_progress(&session_id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (store, session_id) = store_with_graph().await;

        let ep = store
            .endpoint_by_graph_id("a", &session_id)
            .await
            .unwrap()
            .unwrap();
        let resources = store.endpoint_resources(ep.id).await.unwrap();
        // Port plus the flow-rule link created by the logical rule.
        assert_eq!(resources.len(), 2);

        for resource in &resources {
            match resource.resource_type.as_str() {
                RESOURCE_PORT => store.delete_port(resource.resource_id, &session_id).await.unwrap(),
                RESOURCE_FLOW_RULE => store
                    .delete_flow_rule_by_id(resource.resource_id)
                    .await
                    .unwrap(),
                other => panic!("unexpected resource type {other}"),
            }
        }
        store.delete_endpoint_by_id(ep.id).await.unwrap();

        assert!(store
            .endpoint_by_graph_id("a", &session_id)
            .await
            .unwrap()
            .is_none());
        assert!(store.endpoint_resources(ep.id).await.unwrap().is_empty());
        // The logical rule and its match went with the link.
        let rules = store.flow_rules_by_session(&session_id, None).await.unwrap();
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn test_gre_interface_names() {
        let store = GraphStore::connect_in_memory().await.unwrap();
        assert_eq!(store.next_gre_ifname().await.unwrap(), "gre0");

        let mut nffg = Nffg {
            id: Some("g2".to_string()),
            end_points: vec![Endpoint {
                id: "t".to_string(),
                name: None,
                kind: EndpointKind::GreTunnel,
                node_id: None,
                interface: None,
                vlan_id: None,
                local_ip: Some("10.0.0.1".to_string()),
                remote_ip: Some("10.0.0.2".to_string()),
                gre_key: Some("99".to_string()),
                ttl: None,
                status: None,
                db_id: None,
            }],
            ..Default::default()
        };
        let session_id = store
            .store_graph(&mut nffg, "admin", &HashMap::new(), "br-gre")
            .await
            .unwrap();

        let loaded = store.load_graph(&session_id).await.unwrap().unwrap();
        let tunnel = loaded.endpoint("t").unwrap();
        assert_eq!(tunnel.interface.as_deref(), Some("gre0"));
        assert_eq!(tunnel.node_id.as_deref(), Some("br-gre"));
        assert_eq!(store.next_gre_ifname().await.unwrap(), "gre1");
    }

    #[tokio::test]
    async fn test_new_session_ids_are_unique() {
        let store = GraphStore::connect_in_memory().await.unwrap();
        let a = store.new_session_id().await.unwrap();
        let b = store.new_session_id().await.unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }
}
