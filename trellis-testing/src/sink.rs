// In-memory response sink

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use trellis_core::{Error, Headers, ResponseSink};

use crate::TestResponse;

/// A [`ResponseSink`] that keeps everything written to it.
///
/// [`disconnect_handle`](Self::disconnect_handle) simulates the client
/// going away: later writes fail and `closed()` completes.
pub struct RecordingSink {
    status: Option<u16>,
    headers: Headers,
    body: Vec<u8>,
    chunks: usize,
    finished: bool,
    disconnect_tx: watch::Sender<bool>,
    disconnect_rx: watch::Receiver<bool>,
}

/// Disconnects the client of a [`RecordingSink`].
#[derive(Clone)]
pub struct DisconnectHandle(watch::Sender<bool>);

impl DisconnectHandle {
    pub fn disconnect(&self) {
        self.0.send_replace(true);
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        Self {
            status: None,
            headers: Headers::new(),
            body: Vec::new(),
            chunks: 0,
            finished: false,
            disconnect_tx,
            disconnect_rx,
        }
    }

    pub fn disconnect_handle(&self) -> DisconnectHandle {
        DisconnectHandle(self.disconnect_tx.clone())
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnect_rx.borrow()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of body writes, useful for checking that output streamed.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn into_response(self) -> TestResponse {
        TestResponse::new(self.status, self.headers, self.body, self.finished)
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseSink for RecordingSink {
    fn head_written(&self) -> bool {
        self.status.is_some()
    }

    fn write_head(&mut self, status: u16, headers: &Headers) -> Result<(), Error> {
        if self.is_disconnected() {
            return Err(Error::Send("client disconnected".to_string()));
        }
        if self.status.is_some() {
            return Err(Error::Send("response head already written".to_string()));
        }
        self.status = Some(status);
        self.headers = headers.clone();
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), Error> {
        if self.is_disconnected() {
            return Err(Error::Send("client disconnected".to_string()));
        }
        if self.status.is_none() {
            return Err(Error::Send("body written before head".to_string()));
        }
        if self.finished {
            return Err(Error::Send("response already finished".to_string()));
        }
        self.body.extend_from_slice(&chunk);
        self.chunks += 1;
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    async fn closed(&self) {
        if self.finished {
            return;
        }
        let mut rx = self.disconnect_rx.clone();
        // The sink owns a sender, so the channel never closes under us
        let _ = rx.wait_for(|disconnected| *disconnected).await;
    }
}
