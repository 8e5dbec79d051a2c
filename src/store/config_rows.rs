//! Config rows: the four JSON config documents and the endpoint matching
//! rules. Raw rows only — pattern compilation happens in the traffic cache.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

use super::Store;
use crate::util::now_rfc3339;

/// One uncompiled row of `endpoint_matching_config`.
#[derive(Debug, Clone)]
pub struct MatchingRuleRow {
    pub id: i64,
    pub http_method: String,
    pub endpoint_pattern: String,
    pub regex: bool,
    pub priority: i64,
    pub enabled: bool,
    pub rule_type: String,
    pub match_version: i64,
    pub match_language: i64,
    pub match_platform: i64,
    pub match_environment: String,
    pub match_query_params: Option<String>,
    pub match_headers: Option<String>,
    pub match_body: Option<String>,
    pub match_response_status: String,
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<MatchingRuleRow> {
    Ok(MatchingRuleRow {
        id: row.get(0)?,
        http_method: row.get(1)?,
        endpoint_pattern: row.get(2)?,
        regex: row.get::<_, i64>(3)? != 0,
        priority: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        rule_type: row.get(6)?,
        match_version: row.get(7)?,
        match_language: row.get(8)?,
        match_platform: row.get(9)?,
        match_environment: row.get(10)?,
        match_query_params: row.get(11)?,
        match_headers: row.get(12)?,
        match_body: row.get(13)?,
        match_response_status: row.get(14)?,
    })
}

impl Store {
    /// Fetch the JSON config document of one type
    /// (`traffic`, `mapping`, `endpoint`, `proxy`).
    pub fn get_config(&self, config_type: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT config FROM config WHERE type = ?1",
                params![config_type],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => match serde_json::from_str(&text) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    tracing::warn!("Invalid JSON in config row '{}': {}", config_type, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Insert or replace a config document.
    pub fn set_config(&self, config_type: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            r#"INSERT INTO config (type, config, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?3)
               ON CONFLICT(type) DO UPDATE SET config = ?2, updated_at = ?3"#,
            params![config_type, value.to_string(), now],
        )?;
        Ok(())
    }

    /// Seed a config row only when absent; existing operator configuration
    /// always wins.
    pub fn seed_config_if_absent(&self, config_type: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            r#"INSERT INTO config (type, config, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?3)
               ON CONFLICT(type) DO NOTHING"#,
            params![config_type, value.to_string(), now],
        )?;
        Ok(())
    }

    /// All enabled endpoint matching rules, priority ascending.
    pub fn load_matching_rules(&self) -> Result<Vec<MatchingRuleRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, http_method, endpoint_pattern, regex, priority, enabled, type, \
                    match_version, match_language, match_platform, match_environment, \
                    match_query_params, match_headers, match_body, match_response_status \
             FROM endpoint_matching_config WHERE enabled = 1 ORDER BY priority ASC, id ASC",
        )?;
        let rows = stmt.query_map([], rule_from_row)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    /// Insert a matching rule (tests and seeding).
    pub fn insert_matching_rule(&self, rule: &MatchingRuleRow) -> Result<i64> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            r#"INSERT INTO endpoint_matching_config
                (http_method, endpoint_pattern, regex, priority, enabled, type,
                 match_version, match_language, match_platform, match_environment,
                 match_query_params, match_headers, match_body, match_response_status,
                 created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)"#,
            params![
                rule.http_method,
                rule.endpoint_pattern,
                rule.regex as i64,
                rule.priority,
                rule.enabled as i64,
                rule.rule_type,
                rule.match_version,
                rule.match_language,
                rule.match_platform,
                rule.match_environment,
                rule.match_query_params,
                rule.match_headers,
                rule.match_body,
                rule.match_response_status,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl Default for MatchingRuleRow {
    fn default() -> Self {
        Self {
            id: 0,
            http_method: "*".into(),
            endpoint_pattern: "*".into(),
            regex: false,
            priority: 100,
            enabled: true,
            rule_type: "both".into(),
            match_version: 1,
            match_language: 1,
            match_platform: 1,
            match_environment: "exact".into(),
            match_query_params: None,
            match_headers: None,
            match_body: None,
            match_response_status: "2xx".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_set_get_and_seed() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_config("traffic").unwrap().is_none());

        store.set_config("traffic", &json!({"monitor": {"key": "X-App"}})).unwrap();
        let loaded = store.get_config("traffic").unwrap().unwrap();
        assert_eq!(loaded["monitor"]["key"], "X-App");

        // Seeding never clobbers operator config
        store.seed_config_if_absent("traffic", &json!({"monitor": null})).unwrap();
        let still = store.get_config("traffic").unwrap().unwrap();
        assert_eq!(still["monitor"]["key"], "X-App");
    }

    #[test]
    fn test_matching_rules_ordered_by_priority() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_matching_rule(&MatchingRuleRow { priority: 50, endpoint_pattern: "/b".into(), ..Default::default() })
            .unwrap();
        store
            .insert_matching_rule(&MatchingRuleRow { priority: 10, endpoint_pattern: "/a".into(), ..Default::default() })
            .unwrap();
        store
            .insert_matching_rule(&MatchingRuleRow { priority: 20, enabled: false, endpoint_pattern: "/off".into(), ..Default::default() })
            .unwrap();

        let rules = store.load_matching_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].endpoint_pattern, "/a");
        assert_eq!(rules[1].endpoint_pattern, "/b");
    }
}
