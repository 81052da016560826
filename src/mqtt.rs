use crate::prelude::*;

use {
    async_trait::async_trait,
    rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS},
};

pub type Sender = mpsc::UnboundedSender<DecodedReading>;
pub type Receiver = mpsc::UnboundedReceiver<DecodedReading>;

// how long the offline status and disconnect get to reach the broker at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    /// `{prefix}/{subtopic}` with the reading's JSON as payload.
    pub fn for_reading(prefix: &str, reading: &DecodedReading) -> Result<Message> {
        Ok(Message {
            topic: format!("{}/{}", prefix, reading.subtopic),
            retain: false,
            payload: reading.to_json()?,
        })
    }

    pub fn status(prefix: &str, status: &str) -> Message {
        Message {
            topic: status_topic(prefix),
            retain: true,
            payload: status.to_string(),
        }
    }
} // }}}

pub fn status_topic(prefix: &str) -> String {
    format!("{}/status", prefix)
}

// Deliver {{{
/// Where outgoing messages end up. Delivery must not wait on the broker.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<()>;
}

#[async_trait]
impl Deliver for AsyncClient {
    async fn deliver(&self, message: Message) -> Result<()> {
        self.try_publish(message.topic, QoS::AtLeastOnce, message.retain, message.payload)?;
        Ok(())
    }
}

// used when mqtt is disabled
struct LogOnly;

#[async_trait]
impl Deliver for LogOnly {
    async fn deliver(&self, message: Message) -> Result<()> {
        info!("{} = {}", message.topic, message.payload);
        Ok(())
    }
} // }}}

// Backoff {{{
/// Reconnect delay, doubling from `min` up to `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, current: min }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
} // }}}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub readings_received: u64,
    pub messages_sent: u64,
    pub errors: u64,
}

impl PublishStats {
    pub fn print_summary(&self) {
        info!("Publisher Statistics:");
        info!("  Readings received: {}", self.readings_received);
        info!("  Messages sent: {}", self.messages_sent);
        info!("  Errors (dropped): {}", self.errors);
    }
}

pub struct Mqtt {
    config: Config,
}

impl Mqtt {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Publish readings until the parser closes its channel.
    pub async fn start(self, from_parser: Receiver) -> Result<PublishStats> {
        let prefix = self.config.topic_prefix();

        if !self.config.mqtt.enabled() {
            info!("mqtt disabled, readings will only be logged");
            return Ok(Self::forward(&LogOnly, &prefix, from_parser).await);
        }

        let m = &self.config.mqtt;
        info!("initializing mqtt at {}:{}", m.host(), m.port());

        let (client, eventloop) = AsyncClient::new(self.options(), 10);

        let closing = CancellationToken::new();
        let poller = tokio::spawn(Self::poll(
            eventloop,
            client.clone(),
            Message::status(&prefix, "online"),
            Backoff::new(m.reconnect_min(), m.reconnect_max()),
            closing.clone(),
        ));

        let stats = Self::forward(&client, &prefix, from_parser).await;

        info!("parser channel closed, disconnecting from mqtt");
        if let Err(err) = client.deliver(Message::status(&prefix, "offline")).await {
            warn!("publishing offline status failed: {}", err);
        }
        if let Err(err) = client.try_disconnect() {
            warn!("mqtt disconnect failed: {}", err);
        }
        closing.cancel();

        if !finish_within(poller, SHUTDOWN_TIMEOUT).await {
            warn!("mqtt event loop did not finish within {}s, aborted", SHUTDOWN_TIMEOUT.as_secs());
        }

        info!("MQTT sender loop exiting");
        Ok(stats)
    }

    /// Drain `from_parser` into `sink`. A failed delivery drops that reading only.
    pub async fn forward<D: Deliver + ?Sized>(sink: &D, prefix: &str, mut from_parser: Receiver) -> PublishStats {
        let mut stats = PublishStats::default();

        while let Some(reading) = from_parser.recv().await {
            stats.readings_received += 1;

            let message = match Message::for_reading(prefix, &reading) {
                Ok(message) => message,
                Err(err) => {
                    warn!("serializing reading failed, dropping it: {}", err);
                    stats.errors += 1;
                    continue;
                }
            };

            let topic = message.topic.clone();
            debug!("publishing: {} = {}", topic, message.payload);
            match sink.deliver(message).await {
                Ok(()) => stats.messages_sent += 1,
                Err(err) => {
                    warn!("publishing to {} failed, dropping reading: {}", topic, err);
                    stats.errors += 1;
                }
            }
        }

        stats
    }

    // drives the connection; rumqttc reconnects on the next poll after an error
    async fn poll(
        mut eventloop: EventLoop,
        client: AsyncClient,
        online: Message,
        mut backoff: Backoff,
        closing: CancellationToken,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    backoff.reset();
                    if let Err(err) = client.deliver(online.clone()).await {
                        warn!("publishing online status failed: {}", err);
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("mqtt disconnect sent");
                    break;
                }
                Ok(_) => {} // keepalives, acks
                Err(err) => {
                    if closing.is_cancelled() {
                        break;
                    }

                    let delay = backoff.next_delay();
                    error!("{}", err);
                    info!("reconnecting in {}s", delay.as_secs_f32());

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = closing.cancelled() => {}
                    }
                }
            }
        }

        info!("MQTT event loop exiting");
    }

    fn options(&self) -> MqttOptions {
        let m = &self.config.mqtt;

        let mut options = MqttOptions::new(m.client_id(), m.host(), m.port());

        let will = LastWill {
            topic: status_topic(&self.config.topic_prefix()),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (m.username(), m.password()) {
            options.set_credentials(u, p);
        }

        options
    }
}

// false if the task had to be aborted
async fn finish_within(mut task: tokio::task::JoinHandle<()>, limit: Duration) -> bool {
    if tokio::time::timeout(limit, &mut task).await.is_ok() {
        return true;
    }

    task.abort();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));

        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn reading_topic() {
        let reading = DecodedReading::new(Subtopic::TotalImportedEnergy, vec![("kwh".to_string(), 1.5)]);
        let message = Message::for_reading("em340/meter", &reading).unwrap();

        assert_eq!(message.topic, "em340/meter/total_imported_energy");
        assert!(!message.retain);
        assert!(message.payload.contains("\"kwh\":1.5"));

        let status = Message::status("em340/meter", "online");
        assert_eq!(status.topic, "em340/meter/status");
        assert!(status.retain);
    }

    #[tokio::test]
    async fn stuck_event_loop_is_aborted() {
        let (alive, gone) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _alive = alive;
            std::future::pending::<()>().await
        });

        assert!(!finish_within(task, Duration::from_millis(10)).await);
        // the task, and with it the sender, is dropped once aborted
        assert!(gone.await.is_err());

        assert!(finish_within(tokio::spawn(async {}), Duration::from_secs(1)).await);
    }

    #[derive(Default)]
    struct Flaky {
        calls: Mutex<u32>,
        delivered: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Deliver for Flaky {
        async fn deliver(&self, message: Message) -> Result<()> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls % 2 == 0 {
                bail!("broker unavailable");
            }
            self.delivered.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_delivery_drops_only_that_reading() {
        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            tx.send(DecodedReading::new(Subtopic::ActivePower, vec![("w".to_string(), f64::from(i))]))
                .unwrap();
        }
        drop(tx);

        let sink = Flaky::default();
        let stats = Mqtt::forward(&sink, "em340/meter", rx).await;

        assert_eq!(
            stats,
            PublishStats {
                readings_received: 5,
                messages_sent: 3,
                errors: 2
            }
        );

        let delivered = sink.delivered.lock().unwrap();
        let payloads: Vec<_> = delivered.iter().map(|m| m.payload.contains("\"w\":2.0")).collect();
        assert_eq!(payloads, vec![false, true, false]);
        assert!(delivered.iter().all(|m| m.topic == "em340/meter/active_power"));
    }
}
