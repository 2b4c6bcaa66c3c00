use rrc_protocol::{
    CONNECT_TIMEOUT_SECS, EXPECTATION_TTL_SECS, HELLO_INTERVAL_SECS, HELLO_MAX_ATTEMPTS,
    MAX_ACTIVE_RESOURCES, MAX_PENDING_EXPECTATIONS, MAX_RESOURCE_BYTES,
};

/// Client tuning knobs. Defaults match `spec.md`'s constants table.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub dest_name: String,
    pub max_resource_bytes: u64,
    pub resource_expectation_ttl_secs: u64,
    pub max_pending_resource_expectations: usize,
    pub max_active_resources: usize,
    pub hello_interval_secs: u64,
    pub hello_max_attempts: u32,
    pub connect_timeout_secs: u64,
    pub cleanup_existing_links: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dest_name: "rrc.hub".to_string(),
            max_resource_bytes: MAX_RESOURCE_BYTES,
            resource_expectation_ttl_secs: EXPECTATION_TTL_SECS,
            max_pending_resource_expectations: MAX_PENDING_EXPECTATIONS,
            max_active_resources: MAX_ACTIVE_RESOURCES,
            hello_interval_secs: HELLO_INTERVAL_SECS,
            hello_max_attempts: HELLO_MAX_ATTEMPTS,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            cleanup_existing_links: true,
        }
    }
}
