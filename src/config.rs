//! Command-line and environment configuration

use std::time::Duration;

use clap::Parser;

use crate::connection::ConnectionSettings;
use crate::error::ConfigError;
use crate::hub::HubSettings;
use crate::identity::{SessionEntry, StaticSessions};

/// Real-time presence and private message hub
#[derive(Parser, Debug, Clone)]
#[command(name = "presence_hub", version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "PRESENCE_HUB_BIND", default_value = "127.0.0.1:8083")]
    pub bind: String,

    /// Outbound queue capacity per connection
    #[arg(long, env = "PRESENCE_HUB_QUEUE_CAPACITY", default_value_t = 256)]
    pub queue_capacity: usize,

    /// Hub event queue capacity
    #[arg(long, env = "PRESENCE_HUB_HUB_CAPACITY", default_value_t = 256)]
    pub hub_capacity: usize,

    /// Messages returned per history request
    #[arg(long, env = "PRESENCE_HUB_HISTORY_PAGE_SIZE", default_value_t = 50)]
    pub history_page_size: u32,

    /// Seconds between keepalive pings
    #[arg(long, env = "PRESENCE_HUB_PING_PERIOD_SECS", default_value_t = 54)]
    pub ping_period_secs: u64,

    /// Seconds a connection may stay silent before it is dropped
    #[arg(long, env = "PRESENCE_HUB_PONG_WAIT_SECS", default_value_t = 60)]
    pub pong_wait_secs: u64,

    /// Seconds allowed for a single frame write
    #[arg(long, env = "PRESENCE_HUB_WRITE_WAIT_SECS", default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Accepted session as TOKEN:USER_ID:NAME (repeatable)
    #[arg(
        long = "session",
        env = "PRESENCE_HUB_SESSIONS",
        value_delimiter = ',',
        value_name = "TOKEN:USER_ID:NAME"
    )]
    pub sessions: Vec<SessionEntry>,
}

impl Config {
    /// Reject settings the connection pumps cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue capacity"));
        }
        if self.hub_capacity == 0 {
            return Err(ConfigError::Zero("hub capacity"));
        }
        if self.history_page_size == 0 {
            return Err(ConfigError::Zero("history page size"));
        }
        if self.write_wait_secs == 0 {
            return Err(ConfigError::Zero("write wait"));
        }
        if self.ping_period_secs == 0 {
            return Err(ConfigError::Zero("ping period"));
        }
        if self.ping_period_secs >= self.pong_wait_secs {
            return Err(ConfigError::PingNotBeforeDeadline);
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            queue_capacity: self.queue_capacity,
            ping_period: Duration::from_secs(self.ping_period_secs),
            pong_wait: Duration::from_secs(self.pong_wait_secs),
            write_wait: Duration::from_secs(self.write_wait_secs),
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            event_capacity: self.hub_capacity,
            history_page_size: self.history_page_size,
        }
    }

    pub fn static_sessions(&self) -> StaticSessions {
        StaticSessions::new(self.sessions.iter().cloned())
    }
}
