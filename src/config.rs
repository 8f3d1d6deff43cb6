//! # Connection Configuration
//!
//! Translates a user-supplied [`Properties`] bag into a validated
//! [`ConnectionConfig`]. Every knob has a default; unknown keys are
//! ignored so property files can be shared between client versions.

use crate::error::{MqError, MqResult};
use crate::properties::Properties;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Property key for the broker host name.
pub const BROKER_HOST_PROPERTY: &str = "MQBrokerHostName";
/// Property key for the broker port.
pub const BROKER_PORT_PROPERTY: &str = "MQBrokerHostPort";
/// Property key for the transport kind (`"TCP"` or `"SSL"`).
pub const CONNECTION_TYPE_PROPERTY: &str = "MQConnectionType";
/// Property key for the synchronous request timeout in milliseconds
/// (0 waits forever).
pub const ACK_TIMEOUT_PROPERTY: &str = "MQAckTimeout";
/// Property key for the ping interval in seconds (0 disables).
pub const PING_INTERVAL_PROPERTY: &str = "MQPingInterval";
/// Property key for the consumer prefetch window.
pub const CONSUMER_PREFETCH_MAX_PROPERTY: &str = "MQConsumerPrefetchMaxMsgCount";
/// Property key for the prefetch resume threshold percentage.
pub const CONSUMER_PREFETCH_THRESHOLD_PROPERTY: &str = "MQConsumerPrefetchThresholdPercent";
/// Property key for the DUPS_OK acknowledgement batch limit.
pub const DUPS_OK_LIMIT_PROPERTY: &str = "MQDupsOkLimit";
/// Property key for the number of extra connect attempts before the
/// initial connection is reported as failed.
pub const RECONNECT_ATTEMPTS_PROPERTY: &str = "MQReconnectAttempts";

/// Transport selection for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Tcp,
    Ssl,
}

/// Validated connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Broker host name or address.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Transport used to reach the broker.
    pub transport: TransportKind,

    /// Bound on every synchronous request/reply exchange with the broker.
    /// `None` waits forever.
    pub request_timeout: Option<Duration>,

    /// Interval between keep-alive pings. `None` disables pinging.
    pub ping_interval: Option<Duration>,

    /// Number of messages the broker may push to a consumer ahead of
    /// consumption. `-1` leaves the window to the broker.
    pub prefetch_max_msg_count: i32,

    /// Percentage of the prefetch window that must drain before the client
    /// asks the broker to resume a paused consumer flow.
    pub prefetch_threshold_percent: f64,

    /// How many DUPS_OK acknowledgements accumulate before a flush.
    pub dups_ok_limit: usize,

    /// Extra connect attempts before giving up on the initial
    /// connection.
    pub reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: crate::defaults::BROKER_PORT,
            transport: TransportKind::Tcp,
            request_timeout: Some(crate::defaults::REQUEST_TIMEOUT),
            ping_interval: None,
            prefetch_max_msg_count: crate::defaults::PREFETCH_MAX_MSG_COUNT,
            prefetch_threshold_percent: crate::defaults::PREFETCH_THRESHOLD_PERCENT,
            dups_ok_limit: crate::defaults::DUPS_OK_LIMIT,
            reconnect_attempts: 0,
        }
    }
}

impl ConnectionConfig {
    /// Builds a configuration from a property bag, applying defaults for
    /// absent keys and validating ranges.
    pub fn from_properties(props: &Properties) -> MqResult<Self> {
        let mut config = Self::default();

        if props.contains_key(BROKER_HOST_PROPERTY) {
            config.host = props.get_string(BROKER_HOST_PROPERTY)?;
        }
        if props.contains_key(BROKER_PORT_PROPERTY) {
            let port = read_int(props, BROKER_PORT_PROPERTY)?;
            if port <= 0 || port > u16::MAX as i64 {
                return Err(MqError::TcpInvalidPort);
            }
            config.port = port as u16;
        }
        if props.contains_key(CONNECTION_TYPE_PROPERTY) {
            config.transport = match props.get_string(CONNECTION_TYPE_PROPERTY)?.as_str() {
                "TCP" => TransportKind::Tcp,
                "SSL" => TransportKind::Ssl,
                _ => return Err(MqError::ConnectionUnsupportedTransport),
            };
        }
        if props.contains_key(ACK_TIMEOUT_PROPERTY) {
            let millis = read_int(props, ACK_TIMEOUT_PROPERTY)?;
            if millis < 0 {
                return Err(MqError::UnsupportedArgumentValue);
            }
            config.request_timeout = if millis == 0 {
                None
            } else {
                Some(Duration::from_millis(millis as u64))
            };
        }
        if props.contains_key(PING_INTERVAL_PROPERTY) {
            let secs = read_int(props, PING_INTERVAL_PROPERTY)?;
            if secs < 0 {
                return Err(MqError::UnsupportedArgumentValue);
            }
            config.ping_interval = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs as u64))
            };
        }
        if props.contains_key(CONSUMER_PREFETCH_MAX_PROPERTY) {
            let count = read_int(props, CONSUMER_PREFETCH_MAX_PROPERTY)?;
            if count < -1 || count > i32::MAX as i64 {
                return Err(MqError::UnsupportedArgumentValue);
            }
            config.prefetch_max_msg_count = count as i32;
        }
        if props.contains_key(CONSUMER_PREFETCH_THRESHOLD_PROPERTY) {
            let pct = read_float(props, CONSUMER_PREFETCH_THRESHOLD_PROPERTY)?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(MqError::UnsupportedArgumentValue);
            }
            config.prefetch_threshold_percent = pct;
        }
        if props.contains_key(DUPS_OK_LIMIT_PROPERTY) {
            let limit = read_int(props, DUPS_OK_LIMIT_PROPERTY)?;
            if limit < 1 {
                return Err(MqError::UnsupportedArgumentValue);
            }
            config.dups_ok_limit = limit as usize;
        }
        if props.contains_key(RECONNECT_ATTEMPTS_PROPERTY) {
            let attempts = read_int(props, RECONNECT_ATTEMPTS_PROPERTY)?;
            if !(0..=i64::from(u32::MAX)).contains(&attempts) {
                return Err(MqError::UnsupportedArgumentValue);
            }
            config.reconnect_attempts = attempts as u32;
        }

        Ok(config)
    }

    /// The number of undelivered prefetched messages at which a paused
    /// consumer flow is resumed.
    pub fn prefetch_resume_watermark(&self) -> i64 {
        if self.prefetch_max_msg_count < 0 {
            return 0;
        }
        (self.prefetch_max_msg_count as f64 * self.prefetch_threshold_percent / 100.0) as i64
    }
}

/// Accepts any integer property width for a numeric config key.
fn read_int(props: &Properties, key: &str) -> MqResult<i64> {
    props
        .get_int64(key)
        .or_else(|_| props.get_int32(key).map(i64::from))
        .or_else(|_| props.get_int16(key).map(i64::from))
        .or_else(|_| props.get_int8(key).map(i64::from))
}

fn read_float(props: &Properties, key: &str) -> MqResult<f64> {
    props
        .get_float64(key)
        .or_else(|_| props.get_float32(key).map(f64::from))
        .or_else(|_| read_int(props, key).map(|v| v as f64))
}
