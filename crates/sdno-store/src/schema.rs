//! Database schema.
//!
//! Applied idempotently at startup. Row ids are SQLite rowid aliases;
//! `match_rule` shares its id with the owning flow rule (1:1), actions carry
//! a `position` column preserving treatment order.

pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS graph_session (
        session_id   TEXT PRIMARY KEY,
        user_id      TEXT NOT NULL,
        graph_id     TEXT NOT NULL,
        graph_name   TEXT,
        status       TEXT NOT NULL,
        started_at   TEXT NOT NULL,
        last_update  TEXT NOT NULL,
        error        TEXT,
        ended        TEXT,
        description  TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS endpoint (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        graph_endpoint_id  TEXT NOT NULL,
        session_id         TEXT NOT NULL,
        name               TEXT,
        type               TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS port (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        graph_port_id     TEXT NOT NULL,
        session_id        TEXT NOT NULL,
        switch_id         TEXT,
        vlan_id           INTEGER,
        ipv4_address      TEXT,
        tunnel_remote_ip  TEXT,
        gre_key           TEXT,
        status            TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS endpoint_resource (
        endpoint_id    INTEGER NOT NULL,
        resource_type  TEXT NOT NULL,
        resource_id    INTEGER NOT NULL,
        PRIMARY KEY (endpoint_id, resource_type, resource_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS flow_rule (
        id                  INTEGER PRIMARY KEY AUTOINCREMENT,
        graph_flow_rule_id  TEXT NOT NULL,
        internal_id         TEXT,
        session_id          TEXT NOT NULL,
        switch_id           TEXT,
        type                TEXT,
        priority            INTEGER NOT NULL,
        status              TEXT,
        creation_date       TEXT NOT NULL,
        last_update         TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS match_rule (
        id             INTEGER PRIMARY KEY,
        flow_rule_id   INTEGER NOT NULL,
        port_in_type   TEXT,
        port_in        TEXT,
        ether_type     TEXT,
        vlan_id        INTEGER,
        vlan_priority  INTEGER,
        source_mac     TEXT,
        dest_mac       TEXT,
        source_ip      TEXT,
        dest_ip        TEXT,
        tos_bits       TEXT,
        source_port    INTEGER,
        dest_port      INTEGER,
        protocol       TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS action (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_rule_id          INTEGER NOT NULL,
        position              INTEGER NOT NULL,
        output_type           TEXT,
        output_to_port        TEXT,
        output_to_controller  INTEGER,
        drop_packet           INTEGER,
        set_vlan_id           INTEGER,
        set_vlan_priority     INTEGER,
        push_vlan             INTEGER,
        has_push_vlan         INTEGER,
        pop_vlan              INTEGER,
        set_eth_src           TEXT,
        set_eth_dst           TEXT,
        set_ip_src            TEXT,
        set_ip_dst            TEXT,
        set_ip_tos            TEXT,
        set_l4_src_port       INTEGER,
        set_l4_dst_port       INTEGER,
        output_to_queue       TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vnf (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        graph_vnf_id      TEXT NOT NULL,
        session_id        TEXT NOT NULL,
        name              TEXT NOT NULL,
        template          TEXT,
        functional_capability TEXT,
        application_name  TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vnf_port (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        graph_port_id  TEXT NOT NULL,
        vnf_id         INTEGER NOT NULL,
        name           TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_flow_rule_session ON flow_rule (session_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_flow_rule_switch ON flow_rule (switch_id, type)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_match_flow_rule ON match_rule (flow_rule_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_action_flow_rule ON action (flow_rule_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_endpoint_session ON endpoint (session_id)
    "#,
];
