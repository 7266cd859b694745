use event_bus::{BackoffPolicy, BrokerSettings, BusResult, NatsSettings, QueueConfig};
use event_consumer::ConsumerConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                tracing::warn!(bus_type = other, "Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

/// Service configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_user: Option<String>,
    pub broker_pass: Option<String>,
    pub broker_vhost: String,
    pub exchange: String,
    pub queue: String,
    pub binding_patterns: Vec<String>,
    pub prefetch: u16,
    pub max_deliveries: u32,
    pub dead_letter_exchange: Option<String>,
    pub consumer_instances: usize,
    pub connect_timeout: Duration,
    pub host: String,
    pub port: u16,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: &str) -> Result<T, String> {
    let raw = var_or(name, default);
    raw.trim()
        .parse()
        .map_err(|_| format!("{name} has an invalid value: {raw:?}"))
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let binding_patterns: Vec<String> = var_or("BINDING_PATTERNS", "user.*,course.*,review.*")
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if binding_patterns.is_empty() {
            return Err("BINDING_PATTERNS must name at least one pattern".to_string());
        }

        let consumer_instances: usize = parse_var("CONSUMER_INSTANCES", "1")?;
        if consumer_instances == 0 {
            return Err("CONSUMER_INSTANCES must be at least 1".to_string());
        }

        let max_deliveries: u32 = parse_var("MAX_DELIVERIES", "5")?;
        if max_deliveries == 0 {
            return Err("MAX_DELIVERIES must be at least 1".to_string());
        }

        Ok(Config {
            bus_type: BusType::parse(&var_or("BUS_TYPE", "inmemory")),
            broker_host: var_or("BROKER_HOST", "localhost"),
            broker_port: parse_var("BROKER_PORT", "4222")?,
            broker_user: optional_var("BROKER_USER"),
            broker_pass: optional_var("BROKER_PASS"),
            broker_vhost: var_or("BROKER_VHOST", "/"),
            exchange: var_or("EVENT_EXCHANGE", event_bus::DEFAULT_EXCHANGE),
            queue: var_or("NOTIFICATION_QUEUE", "notification_queue"),
            binding_patterns,
            prefetch: parse_var("PREFETCH", "10")?,
            max_deliveries,
            dead_letter_exchange: optional_var("DEAD_LETTER_EXCHANGE"),
            consumer_instances,
            connect_timeout: Duration::from_millis(parse_var("CONNECT_TIMEOUT_MS", "2000")?),
            host: var_or("HOST", "0.0.0.0"),
            port: parse_var("PORT", "8089")?,
        })
    }

    pub fn nats_settings(&self) -> NatsSettings {
        NatsSettings {
            host: self.broker_host.clone(),
            port: self.broker_port,
            user: self.broker_user.clone(),
            password: self.broker_pass.clone(),
            vhost: self.broker_vhost.clone(),
            connection_name: "notifications-rs".to_string(),
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            exchange: self.exchange.clone(),
            connect_timeout: self.connect_timeout,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Fails if a binding pattern is malformed
    pub fn consumer_config(&self) -> BusResult<ConsumerConfig> {
        let queue = QueueConfig::new(self.queue.clone(), self.binding_patterns.as_slice())?
            .with_prefetch(self.prefetch)
            .with_max_deliveries(self.max_deliveries);

        let config = ConsumerConfig::new(queue);
        Ok(match &self.dead_letter_exchange {
            Some(exchange) => config.with_dead_letter_exchange(exchange.clone()),
            None => config,
        })
    }
}
