// src/core/proxy/config_doc.rs

//! The management channel (§6): the JSON document model pools are
//! configured from, plus the flat key-value alternative (`pool-<name>`,
//! `svr-<name>`, `behavior-<name>`) for bootstrap configuration that never
//! touches the JSON channel at all.
//!
//! Mirrors the teacher's `RawConfig` staging-struct pattern
//! (`config.rs`): deserialize into a permissive `serde` shape first, then
//! validate and lower it into the strongly-typed `PoolConfig` the rest of
//! the proxy core consumes.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::core::errors::HiveError;
use crate::core::proxy::downstream::conn_set::{Protocol, ServerBehavior};
use crate::core::proxy::pool::PoolConfig;
use crate::core::proxy::selector::NodeLocator;

/// Defaults applied to every pool built from a config document; these come
/// from process-level config (`config.rs`), not the document itself, since
/// the wire format in §6 doesn't carry per-pool timeout/concurrency tuning.
#[derive(Clone)]
pub struct PoolDefaults {
    pub front_cache_size: usize,
    pub admission_spec: String,
    pub admission_unspec: String,
    pub optimize_set_spec: String,
    pub optimize_set_unspec: String,
    pub honor_flush_delay: bool,
    pub max_concurrent_downstream: usize,
    pub key_stats_capacity: usize,
    pub wait_queue_timeout: Duration,
    pub downstream_timeout: Duration,
    pub connect_timeout: Duration,
    pub connect_max_errors: u32,
    pub connect_retry_interval: Duration,
    pub max_retries: u32,
    /// Front-cache entry TTL (§8 scenario 4 needs this down to the low
    /// hundreds of ms, so it cannot stay a hardcoded constant).
    pub front_cache_lifespan: Duration,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            front_cache_size: 4096,
            admission_spec: String::new(),
            admission_unspec: String::new(),
            optimize_set_spec: String::new(),
            optimize_set_unspec: String::new(),
            honor_flush_delay: false,
            max_concurrent_downstream: 64,
            key_stats_capacity: 1024,
            wait_queue_timeout: Duration::from_millis(2500),
            downstream_timeout: Duration::from_millis(2500),
            connect_timeout: Duration::from_millis(1000),
            connect_max_errors: 3,
            connect_retry_interval: Duration::from_secs(1),
            max_retries: 2,
            front_cache_lifespan: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfigDocument {
    pub name: String,
    #[serde(rename = "nodeLocator")]
    pub node_locator: String,
    #[serde(rename = "saslPassword", default)]
    pub sasl_password: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDoc>,
    #[serde(rename = "vBucketServerMap", default)]
    pub vbucket_server_map: Option<VBucketServerMap>,
    /// The port upstream clients connect to for this pool; not part of the
    /// real membase document but required here since a pool must bind
    /// somewhere and the wire document doesn't otherwise carry it.
    #[serde(default)]
    pub listen_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct NodeDoc {
    pub hostname: String,
    pub ports: PortsDoc,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "healthy".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PortsDoc {
    pub direct: u16,
}

#[derive(Debug, Deserialize)]
pub struct VBucketServerMap {
    #[serde(rename = "hashAlgorithm")]
    pub hash_algorithm: String,
    #[serde(rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

/// Parses and validates a management-channel document into a
/// `(pool_name, listen_port, PoolConfig)` triple ready for
/// `ProxyMain::upsert_pool`. Pure function: no I/O, no mutation of any live
/// pool (§4.K step 1 "parse/validate").
pub fn parse_document(raw: &str, defaults: &PoolDefaults) -> Result<(String, u16, PoolConfig), HiveError> {
    let doc: ConfigDocument = serde_json::from_str(raw)?;
    let node_locator = match doc.node_locator.as_str() {
        "ketama" => NodeLocator::Ketama,
        "vbucket" => NodeLocator::Vbucket,
        other => return Err(HiveError::InvalidNodeLocator(other.to_string())),
    };

    if doc.nodes.is_empty() {
        return Err(HiveError::InvalidConfig(format!(
            "pool '{}' document has no nodes",
            doc.name
        )));
    }

    let sasl_credentials = doc
        .sasl_password
        .as_ref()
        .map(|pw| (doc.name.clone(), pw.clone()));

    let behaviors: Vec<ServerBehavior> = doc
        .nodes
        .iter()
        .map(|n| ServerBehavior {
            host: n.hostname.clone(),
            port: n.ports.direct,
            protocol: Protocol::Ascii,
            connect_timeout: defaults.connect_timeout,
            downstream_timeout: defaults.downstream_timeout,
            connect_max_errors: defaults.connect_max_errors,
            connect_retry_interval: defaults.connect_retry_interval,
            sasl_credentials: sasl_credentials.clone(),
            bucket_select: None,
        })
        .collect();

    let vbucket_map = match (&node_locator, &doc.vbucket_server_map) {
        (NodeLocator::Vbucket, Some(map)) => {
            if map.server_list.len() != doc.nodes.len() {
                return Err(HiveError::InvalidConfig(format!(
                    "pool '{}': vBucketServerMap.serverList length does not match nodes",
                    doc.name
                )));
            }
            map.vbucket_map
                .iter()
                .map(|row| {
                    row.first()
                        .copied()
                        .filter(|&m| m >= 0)
                        .map(|m| m as usize)
                        .ok_or_else(|| {
                            HiveError::InvalidConfig(format!(
                                "pool '{}': vBucketMap row with no master index",
                                doc.name
                            ))
                        })
                })
                .collect::<Result<Vec<usize>, HiveError>>()?
        }
        (NodeLocator::Vbucket, None) => {
            return Err(HiveError::InvalidConfig(format!(
                "pool '{}': vbucket locator requires vBucketServerMap",
                doc.name
            )));
        }
        _ => Vec::new(),
    };

    let port = doc.listen_port.unwrap_or(11211);

    let config = PoolConfig {
        node_locator,
        behaviors,
        vbucket_map,
        front_cache_size: defaults.front_cache_size,
        admission_spec: defaults.admission_spec.clone(),
        admission_unspec: defaults.admission_unspec.clone(),
        optimize_set_spec: defaults.optimize_set_spec.clone(),
        optimize_set_unspec: defaults.optimize_set_unspec.clone(),
        honor_flush_delay: defaults.honor_flush_delay,
        max_concurrent_downstream: defaults.max_concurrent_downstream,
        key_stats_capacity: defaults.key_stats_capacity,
        wait_queue_timeout: defaults.wait_queue_timeout,
        downstream_timeout: defaults.downstream_timeout,
        max_retries: defaults.max_retries,
        front_cache_lifespan: defaults.front_cache_lifespan,
        is_null_bucket: doc.name == "default",
    };

    Ok((doc.name, port, config))
}

/// Parses the flat key-value alternative to the JSON management channel:
/// `pools = a,b`, `pool-a = 11311 ketama`, `svr-a = host1:11211,host2:11211`,
/// `behavior-a = <reserved for future per-pool tuning>`. Used for bootstrap
/// configuration baked into `config.rs` rather than pushed live.
pub fn parse_kv_config(
    kv: &HashMap<String, String>,
    defaults: &PoolDefaults,
) -> Result<Vec<(String, u16, PoolConfig)>, HiveError> {
    let Some(pools_csv) = kv.get("pools") else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for name in pools_csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let pool_line = kv
            .get(&format!("pool-{name}"))
            .ok_or_else(|| HiveError::InvalidConfig(format!("missing pool-{name} entry")))?;
        let mut tokens = pool_line.split_whitespace();
        let port: u16 = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| HiveError::InvalidConfig(format!("pool-{name}: missing/invalid port")))?;
        let locator_str = tokens.next().unwrap_or("ketama");
        let node_locator = match locator_str {
            "ketama" => NodeLocator::Ketama,
            "vbucket" => NodeLocator::Vbucket,
            other => return Err(HiveError::InvalidNodeLocator(other.to_string())),
        };

        let svr_line = kv
            .get(&format!("svr-{name}"))
            .ok_or_else(|| HiveError::InvalidConfig(format!("missing svr-{name} entry")))?;
        let behaviors: Vec<ServerBehavior> = svr_line
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|hostport| {
                let (host, port_str) = hostport
                    .rsplit_once(':')
                    .ok_or_else(|| HiveError::InvalidConfig(format!("svr-{name}: bad host:port '{hostport}'")))?;
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| HiveError::InvalidConfig(format!("svr-{name}: bad port in '{hostport}'")))?;
                Ok(ServerBehavior {
                    host: host.to_string(),
                    port,
                    protocol: Protocol::Ascii,
                    connect_timeout: defaults.connect_timeout,
                    downstream_timeout: defaults.downstream_timeout,
                    connect_max_errors: defaults.connect_max_errors,
                    connect_retry_interval: defaults.connect_retry_interval,
                    sasl_credentials: None,
                    bucket_select: None,
                })
            })
            .collect::<Result<Vec<_>, HiveError>>()?;

        let config = PoolConfig {
            node_locator,
            behaviors,
            vbucket_map: Vec::new(),
            front_cache_size: defaults.front_cache_size,
            admission_spec: defaults.admission_spec.clone(),
            admission_unspec: defaults.admission_unspec.clone(),
            optimize_set_spec: defaults.optimize_set_spec.clone(),
            optimize_set_unspec: defaults.optimize_set_unspec.clone(),
            honor_flush_delay: defaults.honor_flush_delay,
            max_concurrent_downstream: defaults.max_concurrent_downstream,
            key_stats_capacity: defaults.key_stats_capacity,
            wait_queue_timeout: defaults.wait_queue_timeout,
            downstream_timeout: defaults.downstream_timeout,
            max_retries: defaults.max_retries,
            front_cache_lifespan: defaults.front_cache_lifespan,
            is_null_bucket: name == "default",
        };
        out.push((name.to_string(), port, config));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_ketama_document() {
        let raw = r#"{
            "name": "default",
            "nodeLocator": "ketama",
            "saslPassword": "secret",
            "listen_port": 11311,
            "nodes": [
                {"hostname": "10.0.0.1", "ports": {"direct": 11211}},
                {"hostname": "10.0.0.2", "ports": {"direct": 11211}}
            ]
        }"#;
        let (name, port, config) = parse_document(raw, &PoolDefaults::default()).unwrap();
        assert_eq!(name, "default");
        assert_eq!(port, 11311);
        assert_eq!(config.behaviors.len(), 2);
        assert_eq!(config.node_locator, NodeLocator::Ketama);
    }

    #[test]
    fn vbucket_document_requires_a_server_map() {
        let raw = r#"{
            "name": "default",
            "nodeLocator": "vbucket",
            "nodes": [{"hostname": "10.0.0.1", "ports": {"direct": 11211}}]
        }"#;
        let err = parse_document(raw, &PoolDefaults::default()).unwrap_err();
        assert!(matches!(err, HiveError::InvalidConfig(_)));
    }

    #[test]
    fn kv_config_round_trips_a_single_pool() {
        let mut kv = HashMap::new();
        kv.insert("pools".to_string(), "a".to_string());
        kv.insert("pool-a".to_string(), "11311 ketama".to_string());
        kv.insert("svr-a".to_string(), "127.0.0.1:11211,127.0.0.1:11212".to_string());
        let pools = parse_kv_config(&kv, &PoolDefaults::default()).unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].0, "a");
        assert_eq!(pools[0].1, 11311);
        assert_eq!(pools[0].2.behaviors.len(), 2);
    }
}
