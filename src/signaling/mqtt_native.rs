//! Native MQTT bus, backed by `rumqttc`. Test/tooling only — this crate's
//! production target is `wasm32-unknown-unknown` (see [`super::mqtt_wasm`]);
//! this implementation exists so the signaling layer can be exercised
//! against a real MQTT broker without a browser.

use super::bus::{Bus, MessageHandler};
use crate::error::{Error, Result};
use crate::platform;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

pub struct RumqttBus {
    client: AsyncClient,
    eventloop: RefCell<Option<rumqttc::EventLoop>>,
    message_handler: Rc<RefCell<Option<MessageHandler>>>,
}

impl RumqttBus {
    pub fn new(broker_host: &str, broker_port: u16, client_id: &str, keep_alive_s: u64) -> Self {
        let mut options = MqttOptions::new(client_id, broker_host, broker_port);
        options.set_keep_alive(Duration::from_secs(keep_alive_s));
        let (client, eventloop) = AsyncClient::new(options, 64);
        RumqttBus { client, eventloop: RefCell::new(Some(eventloop)), message_handler: Rc::new(RefCell::new(None)) }
    }
}

#[async_trait(?Send)]
impl Bus for RumqttBus {
    async fn connect(&self) -> Result<()> {
        let Some(mut eventloop) = self.eventloop.borrow_mut().take() else {
            return Ok(()); // already connected/polling
        };
        let handler = self.message_handler.clone();
        platform::spawn_local(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(h) = handler.borrow().as_ref() {
                            h(&publish.topic, &publish.payload);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "mqtt event loop error");
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|err| Error::Transport(err.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|err| Error::Transport(err.to_string()))
    }

    fn on_message(&self, handler: impl Fn(&str, &[u8]) + 'static) {
        *self.message_handler.borrow_mut() = Some(Rc::new(handler));
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await.map_err(|err| Error::Transport(err.to_string()))
    }
}
