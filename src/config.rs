use clap::Parser;
use std::time::Duration;

use crate::auth::AuthBoundary;
use crate::retry::RetryPolicy;
use crate::server::PollSettings;

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version, about = "Transcription job queue")]
pub struct ConfigContext {
    #[arg(
        short = 'c',
        long = "connect-url",
        env = "DATABASE_URL",
        help = "PostgreSQL Connection URL; in-memory store when omitted"
    )]
    pub connect_url: Option<String>,

    #[arg(long, env = "DB_CONNECTIONS", default_value = "5", help = "Database pool size")]
    pub db_connections: u32,

    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:8080", help = "HTTP bind address")]
    pub listen: String,

    #[arg(long, env = "TRANSCRIPTION_WORKER_URL", help = "Base URL of the transcription worker")]
    pub worker_url: String,

    #[arg(long, env = "TRANSCRIPTION_WORKER_SECRET", hide_env_values = true, help = "Shared worker secret")]
    pub worker_secret: String,

    #[arg(long, env = "SESSION_SECRET", hide_env_values = true, help = "HS256 key for user session tokens")]
    pub session_secret: String,

    #[arg(long, env = "MAX_BATCH", default_value = "5", help = "Maximum queue items claimed per batch")]
    pub max_batch: u16,

    #[arg(long, env = "MAX_ATTEMPTS", default_value = "3", help = "Attempts before a retryable failure becomes permanent")]
    pub max_attempts: u32,

    #[arg(
        long,
        env = "TRANSCRIBE_TIMEOUT_SECS",
        default_value = "300",
        value_parser = parse_duration,
        help = "Worker transcription timeout in seconds"
    )]
    pub transcribe_timeout: Duration,

    #[arg(
        long,
        env = "HEALTH_TIMEOUT_SECS",
        default_value = "10",
        value_parser = parse_duration,
        help = "Worker health check timeout in seconds"
    )]
    pub health_timeout: Duration,

    #[arg(
        long,
        env = "POLL_INTERVAL_SECS",
        value_parser = parse_duration,
        help = "Process a batch on this interval without an external trigger"
    )]
    pub poll_interval: Option<Duration>,

    #[arg(
        long,
        env = "STALE_AFTER_SECS",
        value_parser = parse_duration,
        help = "Requeue items left processing longer than this (requires --poll-interval)"
    )]
    pub stale_after: Option<Duration>,

    #[arg(long, env = "JAEGER_ENDPOINT", help = "Jaeger collector endpoint for trace export")]
    pub jaeger_endpoint: Option<String>,
}

impl ConfigContext {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }

    pub fn auth_boundary(&self) -> AuthBoundary {
        AuthBoundary::new(&self.worker_secret, &self.session_secret)
    }

    pub fn batch_ceiling(&self) -> i64 {
        i64::from(self.max_batch.max(1))
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.poll_interval,
            stale_after: self.stale_after,
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse::<u64>().map(Duration::from_secs)
}
