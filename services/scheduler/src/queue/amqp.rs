//! AMQP 1.0 reader factory.
//!
//! One connection is shared by every reader; each reader gets its own session
//! and a receiving link with a credit of one, since consumers hold a message
//! for as long as it takes to obtain capacity.

use std::sync::Arc;

use async_trait::async_trait;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::delivery::Delivery;
use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{AmqpValue, Body, Source};
use fe2o3_amqp::{Connection, Receiver, Session};
use serde_amqp::described::Described;
use serde_amqp::descriptor::Descriptor;
use serde_amqp::primitives::Symbol;
use serde_amqp::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use brig_reconcile::{retry, RetryError, RetryPolicy};

use super::{Acknowledger, QueueError, QueueMessage, QueueReader, QueueReaderFactory};
use crate::config::AmqpConfig;

const CONTAINER_ID: &str = "brig-scheduler";

/// Source filter selecting one message group (session) on Azure Service Bus.
const SESSION_FILTER_NAME: &str = "com.microsoft:session-filter";
const SESSION_FILTER_CODE: u64 = 0x00000137000000C;

/// Reader factory backed by an AMQP 1.0 broker.
pub struct AmqpReaderFactory {
    config: AmqpConfig,
    connection: Mutex<Option<ConnectionHandle<()>>>,
}

impl AmqpReaderFactory {
    /// Dial the broker, retrying with fixed backoff.
    pub async fn connect(config: AmqpConfig) -> Result<Self, QueueError> {
        let factory = Self {
            config,
            connection: Mutex::new(None),
        };
        {
            let mut slot = factory.connection.lock().await;
            factory.reconnect(&mut slot).await?;
        }
        Ok(factory)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.config.connect_attempts,
            backoff: self.config.connect_backoff,
        }
    }

    /// Close any existing connection and dial a new one.
    #[instrument(skip_all, fields(address = %self.config.address))]
    async fn reconnect(&self, slot: &mut Option<ConnectionHandle<()>>) -> Result<(), QueueError> {
        if let Some(mut previous) = slot.take() {
            if let Err(e) = previous.close().await {
                debug!(error = %e, "Error closing previous connection");
            }
        }

        let config = &self.config;
        let connection = retry("connect to broker", self.retry_policy(), move || async move {
            Connection::builder()
                .container_id(CONTAINER_ID)
                .sasl_profile(SaslProfile::Plain {
                    username: config.username.clone(),
                    password: config.password.clone(),
                })
                .open(config.address.as_str())
                .await
                .map_err(|e| QueueError::Connect(e.to_string()))
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, last, .. } => QueueError::RetriesExhausted {
                attempts,
                last: last.to_string(),
            },
            RetryError::NoAttempts { .. } => QueueError::RetriesExhausted {
                attempts: 0,
                last: "no connection attempts configured".to_string(),
            },
        })?;

        info!("Connected to broker");
        *slot = Some(connection);
        Ok(())
    }

    /// Builds the link source for a queue, applying the session filter when
    /// talking to Service Bus.
    fn link_source(&self, queue_name: &str) -> Source {
        match self.service_bus_group(queue_name) {
            Some((queue, group)) => Source::builder()
                .address(queue.to_string())
                .add_to_filter(
                    Symbol::from(SESSION_FILTER_NAME),
                    Some(Described {
                        descriptor: Descriptor::Code(SESSION_FILTER_CODE),
                        value: Value::String(group.to_string()),
                    }),
                )
                .build(),
            None => Source::builder().address(queue_name.to_string()).build(),
        }
    }

    fn service_bus_group<'a>(&self, queue_name: &'a str) -> Option<(&'a str, &'a str)> {
        if !self.config.is_azure_service_bus {
            return None;
        }
        split_group(queue_name)
    }
}

/// Splits `<queue>.<group>`; any other shape is not a grouped queue.
fn split_group(queue_name: &str) -> Option<(&str, &str)> {
    let mut parts = queue_name.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(queue), Some(group), None) => Some((queue, group)),
        _ => None,
    }
}

#[async_trait]
impl QueueReaderFactory for AmqpReaderFactory {
    #[instrument(skip(self))]
    async fn new_reader(&self, queue_name: &str) -> Result<Box<dyn QueueReader>, QueueError> {
        let mut slot = self.connection.lock().await;

        loop {
            let Some(connection) = slot.as_mut() else {
                self.reconnect(&mut slot).await?;
                continue;
            };

            let mut session = match Session::begin(connection).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "Failed to begin session, reconnecting");
                    self.reconnect(&mut slot).await?;
                    continue;
                }
            };

            let attached = Receiver::builder()
                .name(format!("{queue_name}-receiver"))
                .source(self.link_source(queue_name))
                .credit_mode(CreditMode::Auto(1))
                .attach(&mut session)
                .await;

            match attached {
                Ok(receiver) => {
                    debug!("Receiver attached");
                    return Ok(Box::new(AmqpReader {
                        queue: queue_name.to_string(),
                        session: Some(session),
                        receiver: Arc::new(Mutex::new(Some(receiver))),
                    }));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to attach receiver, reconnecting");
                    let _ = session.end().await;
                    self.reconnect(&mut slot).await?;
                }
            }
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut slot = self.connection.lock().await;
        if let Some(mut connection) = slot.take() {
            connection
                .close()
                .await
                .map_err(|e| QueueError::Connect(e.to_string()))?;
            info!("Broker connection closed");
        }
        Ok(())
    }
}

type SharedReceiver = Arc<Mutex<Option<Receiver>>>;

struct AmqpReader {
    queue: String,
    session: Option<SessionHandle<()>>,
    receiver: SharedReceiver,
}

#[async_trait]
impl QueueReader for AmqpReader {
    async fn read(&mut self) -> Result<QueueMessage, QueueError> {
        let mut guard = self.receiver.lock().await;
        let receiver = guard
            .as_mut()
            .ok_or_else(|| QueueError::Closed(self.queue.clone()))?;

        let delivery: Delivery<Body<Value>> =
            receiver.recv().await.map_err(|e| QueueError::Receive {
                queue: self.queue.clone(),
                message: e.to_string(),
            })?;
        drop(guard);

        let body = match body_text(delivery.body()) {
            Some(body) => body,
            None => {
                // Undecodable bodies are still delivered so the consumer can
                // log and settle them.
                warn!(queue = %self.queue, "Message body is not UTF-8 text");
                String::new()
            }
        };

        Ok(QueueMessage::new(
            body,
            Box::new(AmqpAck {
                receiver: Arc::clone(&self.receiver),
                delivery,
            }),
        ))
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        let receiver = self.receiver.lock().await.take();
        if let Some(receiver) = receiver {
            if let Err(e) = receiver.close().await {
                debug!(queue = %self.queue, error = %e, "Error detaching receiver");
            }
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.end().await {
                debug!(queue = %self.queue, error = %e, "Error ending session");
            }
        }
        Ok(())
    }
}

fn body_text(body: &Body<Value>) -> Option<String> {
    match body {
        Body::Data(batch) => {
            let mut bytes = Vec::new();
            for data in batch.iter() {
                bytes.extend_from_slice(&data.0);
            }
            String::from_utf8(bytes).ok()
        }
        Body::Value(AmqpValue(Value::String(s))) => Some(s.clone()),
        Body::Value(AmqpValue(Value::Binary(b))) => String::from_utf8(b.to_vec()).ok(),
        _ => None,
    }
}

struct AmqpAck {
    receiver: SharedReceiver,
    delivery: Delivery<Body<Value>>,
}

#[async_trait]
impl Acknowledger for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let mut guard = self.receiver.lock().await;
        match guard.as_mut() {
            Some(receiver) => receiver
                .accept(&self.delivery)
                .await
                .map_err(|e| QueueError::Ack(e.to_string())),
            None => Ok(()),
        }
    }
}
