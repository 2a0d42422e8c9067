//! Domain values supplied by the discovery collaborator: service definitions,
//! service instances and routing rules with their nested policy records.

use std::{cmp::Ordering, collections::HashMap};

use serde::{Deserialize, Serialize};

/// Identity of a logical backend service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceDefinition {
    /// `serviceId:version`
    pub unique_id: String,
    pub service_id: String,
    pub version: String,
    pub protocol: String,
    pub pattern_path: String,
    pub env_type: String,
    pub enable: bool,
    pub invoker_map: HashMap<String, ServiceInvoker>,
}

impl Default for ServiceDefinition {
    fn default() -> Self {
        Self {
            unique_id: String::new(),
            service_id: String::new(),
            version: String::new(),
            protocol: default_protocol(),
            pattern_path: "/**".to_string(),
            env_type: "dev".to_string(),
            enable: true,
            invoker_map: HashMap::new(),
        }
    }
}

impl ServiceDefinition {
    pub fn new(service_id: impl Into<String>, version: impl Into<String>) -> Self {
        let service_id = service_id.into();
        let version = version.into();
        Self {
            unique_id: format!("{service_id}:{version}"),
            service_id,
            version,
            ..Self::default()
        }
    }
}

/// Invocation descriptor for one path of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ServiceInvoker {
    pub invoker_path: String,
    pub timeout_ms: u64,
    pub rule_id: Option<String>,
}

/// One physical backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceInstance {
    /// `ip:port`
    pub instance_id: String,
    pub unique_id: String,
    pub ip: String,
    pub port: u16,
    pub tags: String,
    pub weight: u32,
    /// Epoch millis.
    pub register_time: i64,
    pub enable: bool,
    pub version: String,
    pub gray: bool,
}

impl Default for ServiceInstance {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            unique_id: String::new(),
            ip: String::new(),
            port: 0,
            tags: String::new(),
            weight: default_weight(),
            register_time: 0,
            enable: true,
            version: String::new(),
            gray: false,
        }
    }
}

impl ServiceInstance {
    pub fn new(unique_id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        let ip = ip.into();
        Self {
            instance_id: format!("{ip}:{port}"),
            unique_id: unique_id.into(),
            ip,
            port,
            register_time: chrono::Utc::now().timestamp_millis(),
            ..Self::default()
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_gray(mut self, gray: bool) -> Self {
        self.gray = gray;
        self
    }

    /// Authority used for the downstream request.
    pub fn address(&self) -> String {
        if self.ip.is_empty() {
            self.instance_id.clone()
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

/// Routing and policy configuration bound to a service and a path prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub service_id: String,
    pub prefix: String,
    pub paths: Vec<String>,
    pub order: i32,
    pub filter_configs: Vec<FilterConfig>,
    pub retry_config: RetryConfig,
    pub flow_control_configs: Vec<FlowControlConfig>,
    pub hystrix_configs: Vec<HystrixConfig>,
}

impl Rule {
    /// Looks up the configuration of a filter by id.
    pub fn filter_config(&self, id: &str) -> Option<&FilterConfig> {
        self.filter_configs.iter().find(|c| c.id == id)
    }

    /// Drops filter configs whose id was already seen; the first entry wins.
    pub fn dedup_filter_configs(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.filter_configs.retain(|c| seen.insert(c.id.clone()));
    }

    /// Circuit-breaker config declared for exactly this path.
    pub fn hystrix_config_for(&self, path: &str) -> Option<&HystrixConfig> {
        self.hystrix_configs.iter().find(|c| c.path == path)
    }

    /// Presentation ordering: higher `order` first, then by id.
    pub fn priority_cmp(&self, other: &Self) -> Ordering {
        other
            .order
            .cmp(&self.order)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A filter id plus its free-form JSON configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FilterConfig {
    pub id: String,
    pub config: String,
}

impl FilterConfig {
    pub fn new(id: impl Into<String>, config: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            config: config.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RetryConfig {
    pub times: u32,
}

/// What a flow-control config matches against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowControlType {
    #[default]
    Path,
    Service,
}

/// Where limiter state lives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowControlMode {
    #[default]
    Distributed,
    Singleton,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FlowControlConfig {
    #[serde(rename = "type")]
    pub kind: FlowControlType,
    pub value: String,
    pub mode: FlowControlMode,
    /// Algorithm name; resolved leniently, see `FlowAlgorithm::parse`.
    pub algorithm: Option<String>,
    /// JSON: `{"duration": secs, "permits": n, "warm_up": secs}`
    pub config: String,
}

/// Circuit-breaker settings for one path of a rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HystrixConfig {
    pub path: String,
    pub timeout_ms: u64,
    pub core_thread_size: usize,
    pub fallback_response: String,
    /// Consecutive failures that open the breaker; 0 keeps it closed.
    pub failure_threshold: u32,
    pub sleep_window_ms: u64,
}

impl Default for HystrixConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            timeout_ms: 1000,
            core_thread_size: 10,
            fallback_response: String::new(),
            failure_threshold: 0,
            sleep_window_ms: 5000,
        }
    }
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_weight() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_sort_by_descending_order_then_id() {
        let mut rules = vec![
            Rule {
                id: "b".into(),
                order: 1,
                ..Rule::default()
            },
            Rule {
                id: "a".into(),
                order: 1,
                ..Rule::default()
            },
            Rule {
                id: "c".into(),
                order: 5,
                ..Rule::default()
            },
        ];
        rules.sort_by(Rule::priority_cmp);
        let ids: Vec<_> = rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn duplicate_filter_configs_keep_first() {
        let mut rule = Rule {
            filter_configs: vec![
                FilterConfig::new("gray_filter", "{}"),
                FilterConfig::new("gray_filter", "{\"x\":1}"),
                FilterConfig::new("auth_filter", ""),
            ],
            ..Rule::default()
        };
        rule.dedup_filter_configs();
        assert_eq!(rule.filter_configs.len(), 2);
        assert_eq!(rule.filter_config("gray_filter").map(|c| c.config.as_str()), Some("{}"));
    }

    #[test]
    fn flow_control_config_deserializes_type_field() {
        let cfg: FlowControlConfig = serde_json::from_str(
            r#"{"type":"service","value":"user","mode":"singleton","config":"{}"}"#,
        )
        .unwrap();
        assert_eq!(cfg.kind, FlowControlType::Service);
        assert_eq!(cfg.mode, FlowControlMode::Singleton);
        assert!(cfg.algorithm.is_none());
    }

    #[test]
    fn instance_id_is_ip_and_port() {
        let instance = ServiceInstance::new("user:1.0", "10.0.0.1", 8080);
        assert_eq!(instance.instance_id, "10.0.0.1:8080");
        assert_eq!(instance.address(), "10.0.0.1:8080");
        assert!(instance.enable);
    }
}
