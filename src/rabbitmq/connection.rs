// src/rabbitmq/connection.rs
use lapin::{Connection, ConnectionProperties};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::config::BusConfig;
use crate::messaging::TransportError;

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Opens the broker connection, retrying with exponential backoff.
pub struct ConnectionManager {
    uri: String,
    max_connect_attempts: u32,
    initial_delay_ms: u64,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(uri: &str) -> Self {
        ConnectionManager {
            uri: uri.to_string(),
            max_connect_attempts: 10,
            initial_delay_ms: 1000,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(&config.connection_string)
            .with_reconnect_policy(config.max_connect_attempts, 1000)
            .with_connect_timeout(config.connect_timeout())
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_connect_attempts = max_attempts.max(1);
        self.initial_delay_ms = initial_delay_ms;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub async fn connect(&self) -> Result<Connection, TransportError> {
        let mut attempts = 0;
        let mut delay = self.initial_delay_ms;

        loop {
            info!(attempt = attempts + 1, "Attempting to connect to the AMQP broker");

            let outcome = match timeout(
                self.connect_timeout,
                Connection::connect(&self.uri, ConnectionProperties::default()),
            )
            .await
            {
                Ok(result) => result.map_err(TransportError::from),
                Err(elapsed) => Err(TransportError::from(elapsed)),
            };

            match outcome {
                Ok(connection) => {
                    info!("Successfully connected to the AMQP broker");
                    return Ok(connection);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        attempt = attempts,
                        max_attempts = self.max_connect_attempts,
                        error = %err,
                        "Failed to connect to the AMQP broker"
                    );

                    if attempts >= self.max_connect_attempts {
                        error!("Max connection attempts reached. Giving up.");
                        return Err(TransportError::Connection(err.to_string()));
                    }

                    let sleep_time = jittered(delay);
                    warn!(delay_ms = sleep_time, "Waiting before next connection attempt");
                    sleep(Duration::from_millis(sleep_time)).await;
                    delay = next_delay(delay);
                }
            }
        }
    }
}

// +/-15% around `delay`.
fn jittered(delay: u64) -> u64 {
    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
    (delay as f64 + jitter).max(0.0) as u64
}

fn next_delay(delay: u64) -> u64 {
    delay.saturating_mul(2).min(MAX_RECONNECT_DELAY_MS)
}
