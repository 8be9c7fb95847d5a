//! Config validation.

use crate::types::GatewayConfig;

/// Check value ranges and cross-field consistency.
///
/// # Errors
///
/// Returns a human-readable description of the first problem found.
pub fn validate(config: &GatewayConfig) -> Result<(), String> {
    if config.http.port == 0 {
        return Err("http.port must be non-zero".to_string());
    }
    if config.http.body_limit_bytes == 0 {
        return Err("http.body_limit_bytes must be non-zero".to_string());
    }
    if config.supervisor.backoff_multiplier < 1.0 {
        return Err("supervisor.backoff_multiplier must be >= 1.0".to_string());
    }
    if config.supervisor.max_backoff_ms < config.supervisor.initial_backoff_ms {
        return Err("supervisor.max_backoff_ms must be >= initial_backoff_ms".to_string());
    }
    if config.supervisor.heartbeat_interval_secs == 0 {
        return Err("supervisor.heartbeat_interval_secs must be non-zero".to_string());
    }
    if config.http.rate_limit.global.capacity <= 0.0 || config.http.rate_limit.mcp.capacity <= 0.0 {
        return Err("rate limit capacities must be positive".to_string());
    }

    for (name, server) in &config.servers {
        let has_command = server.command.is_some();
        let has_url = server.url.is_some();
        match server.transport.as_deref() {
            Some("stdio") if !has_command => {
                return Err(format!("servers.{name}: stdio transport needs a command"));
            }
            Some("http" | "sse") if !has_url => {
                return Err(format!("servers.{name}: http/sse transport needs a url"));
            }
            Some(other) if !matches!(other, "stdio" | "http" | "sse") => {
                return Err(format!("servers.{name}: unknown transport '{other}'"));
            }
            None if !has_command && !has_url => {
                return Err(format!("servers.{name}: needs a command or a url"));
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerEntry;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = GatewayConfig::default();
        config.http.port = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_server_without_target_rejected() {
        let mut config = GatewayConfig::default();
        config
            .servers
            .insert("broken".to_string(), ServerEntry::default());
        let err = validate(&config).unwrap_err();
        assert!(err.contains("broken"));
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let mut config = GatewayConfig::default();
        config.servers.insert(
            "weird".to_string(),
            ServerEntry {
                transport: Some("carrier-pigeon".to_string()),
                url: Some("coop://".to_string()),
                ..ServerEntry::default()
            },
        );
        assert!(validate(&config).is_err());
    }
}
