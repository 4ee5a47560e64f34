// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event Stream
//!
//! Single-writer framed channel from one request task to one caller. The
//! writer half enforces that exactly one terminal event (`Error` or `Done`)
//! is sent and nothing follows it. The reader half is a `Stream` consumed
//! once, in production order.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::admission::RequestId;
use crate::domain::stream::StreamEvent;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// The reader half was dropped (caller disconnected).
    #[error("event stream receiver disconnected")]
    Disconnected,

    #[error("event stream already terminated")]
    Terminated,
}

pub fn event_channel(request_id: RequestId, capacity: usize) -> (EventSink, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSink {
            request_id,
            tx,
            terminated: false,
        },
        EventReceiver { rx },
    )
}

#[derive(Debug)]
pub struct EventSink {
    request_id: RequestId,
    tx: mpsc::Sender<StreamEvent>,
    terminated: bool,
}

impl EventSink {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn send(&mut self, event: StreamEvent) -> Result<(), StreamError> {
        if self.terminated {
            return Err(StreamError::Terminated);
        }
        let terminal = event.is_terminal();
        trace!(request_id = %self.request_id, event = event.kind(), "frame");
        self.tx
            .send(event)
            .await
            .map_err(|_| StreamError::Disconnected)?;
        if terminal {
            self.terminated = true;
        }
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Resolves once the caller has dropped the reader half. The returned
    /// future keeps the channel open until it completes or is dropped.
    pub fn disconnect_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<StreamEvent>,
}

impl Stream for EventReceiver {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
