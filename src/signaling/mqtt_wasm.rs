//! Browser MQTT-over-WebSocket bus. There is no ecosystem MQTT client that
//! targets `wasm32-unknown-unknown` directly, so this drives a raw
//! `web_sys::WebSocket` by hand, encoding/decoding packets with
//! `mqttbytes` — the same pure-Rust, I/O-free codec `rumqttc` itself uses.

use super::bus::{Bus, MessageHandler};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use js_sys::{ArrayBuffer, Uint8Array};
use mqttbytes::v4::{Connect, Packet, Publish, Subscribe};
use mqttbytes::QoS;
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::oneshot;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;
use web_sys::{MessageEvent, WebSocket};

pub struct MqttBus {
    url: String,
    client_id: String,
    keep_alive_s: u16,
    ws: RefCell<Option<WebSocket>>,
    recv_buffer: Rc<RefCell<BytesMut>>,
    message_handler: Rc<RefCell<Option<MessageHandler>>>,
    connack: Rc<RefCell<Option<oneshot::Sender<()>>>>,
    // Closures must outlive the WebSocket; holding them here keeps them
    // alive for as long as this bus exists instead of leaking them with
    // `.forget()`.
    _on_open: RefCell<Option<Closure<dyn FnMut()>>>,
    _on_message: RefCell<Option<Closure<dyn FnMut(MessageEvent)>>>,
}

impl MqttBus {
    pub fn new(url: impl Into<String>, client_id: impl Into<String>, keep_alive_s: u16) -> Self {
        MqttBus {
            url: url.into(),
            client_id: client_id.into(),
            keep_alive_s,
            ws: RefCell::new(None),
            recv_buffer: Rc::new(RefCell::new(BytesMut::new())),
            message_handler: Rc::new(RefCell::new(None)),
            connack: Rc::new(RefCell::new(None)),
            _on_open: RefCell::new(None),
            _on_message: RefCell::new(None),
        }
    }

    fn send_packet(&self, bytes: BytesMut) -> Result<()> {
        let ws = self.ws.borrow();
        let ws = ws.as_ref().ok_or(Error::Disconnected)?;
        let array = Uint8Array::from(bytes.as_ref());
        ws.send_with_array_buffer(&array.buffer())
            .map_err(|_| Error::Transport("WebSocket.send threw".into()))
    }
}

#[async_trait(?Send)]
impl Bus for MqttBus {
    async fn connect(&self) -> Result<()> {
        let ws = WebSocket::new_with_str(&self.url, "mqtt")
            .map_err(|_| Error::MalformedBusUrl { url: self.url.clone() })?;
        ws.set_binary_type(web_sys::BinaryType::Arraybuffer);

        let (tx, rx) = oneshot::channel();
        *self.connack.borrow_mut() = Some(tx);

        let client_id = self.client_id.clone();
        let keep_alive = self.keep_alive_s;
        let ws_for_open = ws.clone();
        let on_open = Closure::<dyn FnMut()>::new(move || {
            let mut connect = Connect::new(client_id.clone());
            connect.keep_alive = keep_alive;
            let mut buf = BytesMut::new();
            if connect.write(&mut buf).is_ok() {
                let array = Uint8Array::from(buf.as_ref());
                let _ = ws_for_open.send_with_array_buffer(&array.buffer());
            }
        });
        ws.set_onopen(Some(on_open.as_ref().unchecked_ref()));

        let recv_buffer = self.recv_buffer.clone();
        let message_handler = self.message_handler.clone();
        let connack = self.connack.clone();
        let on_message = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            let Ok(buffer) = event.data().dyn_into::<ArrayBuffer>() else { return };
            let array = Uint8Array::new(&buffer);
            let mut chunk = vec![0u8; array.length() as usize];
            array.copy_to(&mut chunk);

            let mut pending = recv_buffer.borrow_mut();
            pending.extend_from_slice(&chunk);

            loop {
                match mqttbytes::v4::read(&mut pending, 64 * 1024) {
                    Ok(Packet::ConnAck(_)) => {
                        if let Some(tx) = connack.borrow_mut().take() {
                            let _ = tx.send(());
                        }
                    }
                    Ok(Packet::Publish(publish)) => {
                        if let Some(handler) = message_handler.borrow().as_ref() {
                            handler(&publish.topic, &publish.payload);
                        }
                    }
                    Ok(_) => {}
                    Err(mqttbytes::Error::InsufficientBytes(_)) => break,
                    Err(err) => {
                        tracing::error!(error = %err, "mqtt frame decode error");
                        break;
                    }
                }
            }
        });
        ws.set_onmessage(Some(on_message.as_ref().unchecked_ref()));

        *self.ws.borrow_mut() = Some(ws);
        *self._on_open.borrow_mut() = Some(on_open);
        *self._on_message.borrow_mut() = Some(on_message);

        rx.await.map_err(|_| Error::Transport("connection closed before CONNACK".into()))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let subscribe = Subscribe::new(topic, QoS::AtLeastOnce);
        let mut buf = BytesMut::new();
        subscribe.write(&mut buf).map_err(|err| Error::Transport(err.to_string()))?;
        self.send_packet(buf)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let publish = Publish::new(topic, QoS::AtLeastOnce, payload);
        let mut buf = BytesMut::new();
        publish.write(&mut buf).map_err(|err| Error::Transport(err.to_string()))?;
        self.send_packet(buf)
    }

    fn on_message(&self, handler: impl Fn(&str, &[u8]) + 'static) {
        *self.message_handler.borrow_mut() = Some(Rc::new(handler));
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(ws) = self.ws.borrow_mut().take() {
            let _ = ws.close();
        }
        Ok(())
    }
}
