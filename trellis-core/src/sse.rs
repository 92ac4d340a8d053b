// Server-Sent Events responses

use crate::error::Error;
use crate::http::Headers;
use crate::logging::debug;
use crate::response::{Response, ResponseSink};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 64;

/// Server-Sent Event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSentEvent {
    pub id: Option<String>,
    /// Event type; clients default to `message`
    pub event: Option<String>,
    pub data: String,
    /// Reconnect delay in milliseconds
    pub retry: Option<u64>,
}

impl ServerSentEvent {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_event(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Wire format, terminated by a blank line
    pub fn encode(&self) -> String {
        let mut output = String::new();

        if let Some(id) = &self.id {
            output.push_str(&format!("id: {id}\n"));
        }
        if let Some(event) = &self.event {
            output.push_str(&format!("event: {event}\n"));
        }
        // Multi-line data becomes one field per line
        for line in self.data.lines() {
            output.push_str(&format!("data: {line}\n"));
        }
        if self.data.is_empty() {
            output.push_str("data: \n");
        }
        if let Some(retry) = self.retry {
            output.push_str(&format!("retry: {retry}\n"));
        }

        output.push('\n');
        output
    }
}

/// Producer side of an [`EventStreamResponse`]; cheap to clone.
///
/// Events sent before the response is transmitted are queued and flushed
/// right after the head. Dropping every sender ends the stream.
#[derive(Debug, Clone)]
pub struct EventStreamSender {
    tx: mpsc::Sender<ServerSentEvent>,
}

impl EventStreamSender {
    pub async fn send(&self, event: ServerSentEvent) -> Result<(), Error> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::Send("event stream closed".to_string()))
    }

    /// Send `data` as JSON, optionally under an event name.
    pub async fn send_message<T: Serialize>(&self, data: &T, event: Option<&str>) -> Result<(), Error> {
        let json = serde_json::to_string(data).map_err(|e| Error::Serialization(e.to_string()))?;
        let message = match event {
            Some(event) => ServerSentEvent::with_event(event, json),
            None => ServerSentEvent::new(json),
        };
        self.send(message).await
    }

    /// False once the client disconnected or the response was dropped.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A kept-open `text/event-stream` response.
pub struct EventStreamResponse {
    status: u16,
    headers: Headers,
    events: mpsc::Receiver<ServerSentEvent>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl EventStreamResponse {
    pub fn new() -> (Self, EventStreamSender) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let response = Self {
            status: 200,
            headers: Headers::new(),
            events: rx,
            on_close: None,
        };
        (response, EventStreamSender { tx })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Called once when the stream ends, whether the client disconnected or
    /// all senders were dropped.
    pub fn on_close(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(callback));
        self
    }
}

#[async_trait]
impl Response for EventStreamResponse {
    fn status_code(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    async fn send(self: Box<Self>, sink: &mut dyn ResponseSink) -> Result<(), Error> {
        let EventStreamResponse {
            status,
            headers,
            mut events,
            on_close,
        } = *self;

        let mut head = Headers::from([
            ("Content-Type".to_string(), "text/event-stream".to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
        ]);
        head.extend(headers);

        let result = match sink.write_head(status, &head) {
            Ok(()) => pump(&mut events, sink).await,
            Err(err) => Err(err),
        };

        // Senders observe the disconnect through `is_connected`
        events.close();
        sink.finish();
        if let Some(callback) = on_close {
            callback();
        }
        debug!("Event stream closed");
        result
    }
}

async fn pump(
    events: &mut mpsc::Receiver<ServerSentEvent>,
    sink: &mut dyn ResponseSink,
) -> Result<(), Error> {
    loop {
        let next = tokio::select! {
            event = events.recv() => event,
            _ = sink.closed() => None,
        };
        let Some(event) = next else {
            return Ok(());
        };
        if sink.write(Bytes::from(event.encode())).await.is_err() {
            // Client went away mid-write; not a server failure
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::tests::BufferSink;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_event_encoding() {
        let event = ServerSentEvent::with_event("update", "line 1\nline 2").with_id("7");
        assert_eq!(
            event.encode(),
            "id: 7\nevent: update\ndata: line 1\ndata: line 2\n\n"
        );
        assert_eq!(ServerSentEvent::new("").encode(), "data: \n\n");
    }

    #[tokio::test]
    async fn test_queued_events_flush_after_head() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let (response, sender) = EventStreamResponse::new();
        let response = response.on_close(move || flag.store(true, Ordering::SeqCst));

        sender
            .send_message(&serde_json::json!({ "n": 1 }), Some("tick"))
            .await
            .unwrap();
        sender.send(ServerSentEvent::new("plain")).await.unwrap();
        drop(sender);

        let mut sink = BufferSink::default();
        Box::new(response).send(&mut sink).await.unwrap();

        assert_eq!(sink.status, Some(200));
        assert_eq!(sink.header("content-type"), Some("text/event-stream"));
        assert_eq!(
            sink.body_string(),
            "event: tick\ndata: {\"n\":1}\n\ndata: plain\n\n"
        );
        assert!(sink.finished);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sender_sees_closed_stream() {
        let (response, sender) = EventStreamResponse::new();
        assert!(sender.is_connected());
        drop(response);
        assert!(!sender.is_connected());
        assert!(sender.send(ServerSentEvent::new("late")).await.is_err());
    }
}
