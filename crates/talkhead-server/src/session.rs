//! Session service: TCP listener and per-connection command handlers.
//!
//! Each connection reads newline-delimited JSON requests and answers them in
//! order. While a command runs the handler keeps reading, so a client that
//! disconnects cancels its job and pipelined requests are queued. Reading
//! pauses once `MAX_PENDING_REQUESTS` are queued.

use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use talkhead_core::{Error, SegmentEvent, ServerConfig};

use crate::error::ApiError;
use crate::protocol::{parse_command, segment_event, success, Command};
use crate::state::AppState;

/// Requests read ahead of the running command.
pub const MAX_PENDING_REQUESTS: usize = 64;

pub struct SessionServer {
    listener: TcpListener,
    state: AppState,
    connections: TaskTracker,
}

impl SessionServer {
    pub async fn bind(config: &ServerConfig, state: AppState) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.addr()).await?;
        Ok(Self {
            listener,
            state,
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Accept connections until shutdown completes, then wait for open
    /// connections to finish their current command.
    pub async fn run(self) {
        let shutdown = self.state.shutdown_token().clone();
        info!("Session service listening on {:?}", self.listener.local_addr());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = self.state.clone();
                        self.connections.spawn(handle_connection(stream, peer, state));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        drop(self.listener);
        self.connections.close();
        self.connections.wait().await;
        info!("Session service stopped");
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: AppState) {
    let _guard = state.connection_opened();
    debug!("Connection opened: {}", peer);

    let framed = Framed::new(stream, LinesCodec::new_with_max_length(state.max_line_bytes));
    let (sink, lines) = framed.split();
    let mut connection = Connection {
        state,
        sink,
        lines,
        pending: VecDeque::new(),
        cancel: CancellationToken::new(),
        disconnected: false,
        decode_errored: false,
    };
    connection.serve().await;
    connection.cancel.cancel();

    debug!("Connection closed: {}", peer);
}

enum Incoming {
    Line(String),
    TooLong,
}

enum Reply {
    Line(Value),
    Events(mpsc::Receiver<SegmentEvent>),
}

struct Connection {
    state: AppState,
    sink: SplitSink<Framed<TcpStream, LinesCodec>, String>,
    lines: SplitStream<Framed<TcpStream, LinesCodec>>,
    pending: VecDeque<Incoming>,
    /// Cancelled when the client goes away
    cancel: CancellationToken,
    disconnected: bool,
    /// The framed reader yields one `None` after a decode error
    decode_errored: bool,
}

impl Connection {
    async fn serve(&mut self) {
        while let Some(incoming) = self.next_incoming().await {
            let line = match incoming {
                Incoming::Line(line) => line,
                Incoming::TooLong => {
                    let err = ApiError::protocol(format!(
                        "Request exceeds {} bytes",
                        self.state.max_line_bytes
                    ));
                    if !self.send(err.to_json()).await {
                        return;
                    }
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let command = match parse_command(&line) {
                Ok(command) => command,
                Err(err) => {
                    debug!("Rejected request: {}", err);
                    if !self.send(err.to_json()).await {
                        return;
                    }
                    continue;
                }
            };

            let name = command.name();
            debug!("Command: {}", name);
            let state = self.state.clone();
            let cancel = self.cancel.clone();
            let reply = self
                .watch(async move { dispatch(&state, command, &cancel).await })
                .await;

            let keep_going = match reply {
                Reply::Line(value) => self.send(value).await,
                Reply::Events(events) => self.forward_events(events).await,
            };
            if !keep_going {
                return;
            }
        }
    }

    /// Next queued or freshly read request. `None` once the client is gone
    /// or shutdown has completed.
    async fn next_incoming(&mut self) -> Option<Incoming> {
        let shutdown = self.state.shutdown_token().clone();
        loop {
            if let Some(incoming) = self.pending.pop_front() {
                return Some(incoming);
            }
            if self.disconnected {
                return None;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                frame = self.lines.next() => self.on_frame(frame),
            }
        }
    }

    /// Drive `work` to completion while still reading from the socket.
    async fn watch<T>(&mut self, work: impl Future<Output = T>) -> T {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                frame = self.lines.next(), if self.reading() => self.on_frame(frame),
            }
        }
    }

    async fn forward_events(&mut self, mut events: mpsc::Receiver<SegmentEvent>) -> bool {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return true;
                    };
                    let finished = matches!(event, SegmentEvent::Finished(_));
                    if !self.send(segment_event(&event)).await {
                        self.cancel.cancel();
                        return false;
                    }
                    if finished {
                        return true;
                    }
                }
                frame = self.lines.next(), if self.reading() => self.on_frame(frame),
            }
        }
    }

    fn reading(&self) -> bool {
        !self.disconnected && self.pending.len() < MAX_PENDING_REQUESTS
    }

    fn on_frame(&mut self, frame: Option<Result<String, LinesCodecError>>) {
        match frame {
            Some(Ok(line)) => {
                self.decode_errored = false;
                self.pending.push_back(Incoming::Line(line));
            }
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                self.decode_errored = true;
                self.pending.push_back(Incoming::TooLong);
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!("Read failed: {}", e);
                self.disconnect();
            }
            None if self.decode_errored => self.decode_errored = false,
            None => self.disconnect(),
        }
    }

    fn disconnect(&mut self) {
        if !self.disconnected {
            self.disconnected = true;
            self.cancel.cancel();
        }
    }

    async fn send(&mut self, value: Value) -> bool {
        match self.sink.send(value.to_string()).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Write failed: {}", e);
                self.disconnect();
                false
            }
        }
    }
}

async fn dispatch(state: &AppState, command: Command, cancel: &CancellationToken) -> Reply {
    let service = &state.service;
    let name = command.name();
    let reply = match command {
        Command::Ping => respond(name, Ok(service.ping())),
        Command::Preprocess(request) => respond(name, service.preprocess(request).await),
        Command::Inference(request) => respond(name, service.inference(request, cancel).await),
        Command::Stream(request) => match service.stream(request, cancel.clone()).await {
            Ok(events) => return Reply::Events(events),
            Err(e) => failure(name, e),
        },
        Command::CheckCache(request) => respond(name, service.check_cache(&request.template_id)),
        Command::ListCache => respond(
            name,
            service
                .list_cache()
                .await
                .map(|templates| json!({ "templates": templates })),
        ),
        Command::Invalidate(request) => respond(
            name,
            service
                .invalidate(&request.template_id)
                .await
                .map(|removed| json!({ "removed": removed })),
        ),
        Command::Status => status(state).await,
        Command::Shutdown => {
            let drained = state.shutdown().await;
            let message = if drained {
                "Shutdown complete"
            } else {
                "Shutdown timed out waiting for in-flight jobs"
            };
            json!({ "success": drained, "message": message })
        }
    };
    Reply::Line(reply)
}

async fn status(state: &AppState) -> Value {
    let status = state.service.status().await;
    match success(&status) {
        Ok(mut value) => {
            value["activeConnections"] = json!(state.active_connections());
            value
        }
        Err(err) => err.to_json(),
    }
}

fn respond<T: serde::Serialize>(command: &str, result: talkhead_core::Result<T>) -> Value {
    match result {
        Ok(body) => success(&body).unwrap_or_else(|err| err.to_json()),
        Err(e) => failure(command, e),
    }
}

fn failure(command: &str, err: Error) -> Value {
    match &err {
        Error::Cancelled => debug!("{} cancelled", command),
        Error::NotFound(_) | Error::InvalidInput(_) | Error::ShuttingDown => {
            debug!("{} rejected: {}", command, err)
        }
        _ => warn!("{} failed: {}", command, err),
    }
    ApiError::from(err).to_json()
}
