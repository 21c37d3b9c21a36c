//! The four loops that tie the local terminal to the websocket.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt as _;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use uberterm_protocol::{ClientMessage, EOT, ServerMessage};

use crate::connection::Connection;
use crate::escape::{EscapeDetector, Filtered};
use crate::shutdown::{ExitReason, Shutdown};
use crate::{Error, Input, Output, Result, WindowSizeFn};

/// Upper bound on how long the input loop waits before rechecking shutdown.
pub const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Delay before the first resize frame; longer than the negotiation delay.
pub const RESIZE_START_DELAY: Duration = Duration::from_millis(200);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

const INPUT_BUFFER: usize = 4096;

/// State shared by every loop of one session.
pub(crate) struct Session {
    pub connection: Arc<Connection>,
    pub shutdown: Shutdown,
    pub output: Output,
    pub input: Input,
    pub window_size: WindowSizeFn,
    pub detach_keys: Vec<u8>,
}

/// Run all loops and wait for every one of them before returning.
pub(crate) async fn run(session: Session) -> Result<ExitReason> {
    let session = Arc::new(session);
    let runtime = tokio::runtime::Handle::current();
    let mut loops = tokio::task::JoinSet::new();

    {
        let session = session.clone();
        loops.spawn_blocking(move || {
            input_loop(&session, &runtime);
            "input"
        });
    }
    loops.spawn(output_loop(session.clone()));
    loops.spawn(resize_loop(session.clone()));
    loops.spawn(ping_loop(session.clone()));

    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok(name) => tracing::debug!("{name} loop exited"),
            Err(e) => {
                tracing::error!("pump loop aborted: {e}");
                session.shutdown.fail("pump", Error::LoopFailed(e.to_string()));
            }
        }
    }

    session.shutdown.take_outcome()
}

fn input_loop(session: &Session, runtime: &tokio::runtime::Handle) {
    let send = |bytes: Vec<u8>| {
        runtime.block_on(session.connection.send(&ClientMessage::Input(bytes)))
    };
    let mut input = session.input.lock();
    let mut detector = EscapeDetector::new(session.detach_keys.clone());
    let mut buf = [0u8; INPUT_BUFFER];

    while !session.shutdown.is_triggered() {
        let n = match input.read_timeout(&mut buf, INPUT_POLL_INTERVAL) {
            Ok(None) => continue,
            Ok(Some(n)) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                session.shutdown.fail("input", e.into());
                return;
            }
        };

        if n == 0 {
            tracing::debug!("local input closed, sending EOT");
            if let Err(e) = send(vec![EOT]) {
                session.shutdown.fail("input", e);
            }
            return;
        }

        match detector.filter(&buf[..n]) {
            Filtered::Forward(bytes) => {
                if bytes.is_empty() {
                    continue;
                }
                if let Err(e) = send(bytes) {
                    session.shutdown.fail("input", e);
                    return;
                }
            }
            Filtered::Detach(before) => {
                if !before.is_empty() {
                    if let Err(e) = send(before) {
                        tracing::debug!("failed to flush input before detach: {e}");
                    }
                }
                session.shutdown.trigger("input", ExitReason::Detached);
                return;
            }
        }
    }
}

async fn output_loop(session: Arc<Session>) -> &'static str {
    let mut stream = match session.connection.take_stream() {
        Ok(stream) => stream,
        Err(e) => {
            session.shutdown.fail("output", e);
            return "output";
        }
    };
    let revision = session.connection.revision();

    loop {
        let frame = tokio::select! {
            biased;
            () = session.shutdown.triggered() => break,
            frame = stream.next() => frame,
        };

        let data = match frame {
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!("server closed the connection: {frame:?}");
                session.shutdown.trigger("output", ExitReason::ServerClosed);
                break;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                session.shutdown.trigger("output", ExitReason::ServerClosed);
                break;
            }
            Some(Err(e)) => {
                session.shutdown.fail("output", e.into());
                break;
            }
        };

        if data.is_empty() {
            session.shutdown.fail("output", Error::EmptyFrame);
            break;
        }

        let message = match ServerMessage::decode(revision, &data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("dropping frame: {e}");
                continue;
            }
        };
        if let Err(e) = handle_server_message(&session, message) {
            session.shutdown.fail("output", e);
            break;
        }
    }

    session.connection.restore_stream(stream);
    "output"
}

fn handle_server_message(session: &Session, message: ServerMessage) -> Result<()> {
    match message {
        ServerMessage::Output(bytes) => {
            let mut output = session.output.lock();
            output.write_all(&bytes)?;
            output.flush()?;
        }
        ServerMessage::SetWindowTitle(title) => {
            let mut output = session.output.lock();
            crossterm::execute!(output, crossterm::terminal::SetTitle(title))?;
        }
        ServerMessage::Pong => tracing::debug!("received pong"),
        ServerMessage::SetPreferences(preferences) => {
            tracing::debug!("received preferences: {preferences}");
        }
        ServerMessage::SetReconnect(seconds) => {
            tracing::debug!("server suggests reconnecting after {seconds}s");
        }
    }
    Ok(())
}

async fn resize_loop(session: Arc<Session>) -> &'static str {
    // Registered before the start delay so early size changes are queued.
    let mut window_changes =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change()) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!("cannot watch window size changes: {e}");
                session.shutdown.triggered().await;
                return "resize";
            }
        };

    tokio::select! {
        () = session.shutdown.triggered() => return "resize",
        () = tokio::time::sleep(RESIZE_START_DELAY) => {}
    }

    // The terminal may not be attached yet; a failure here is expected.
    match (session.window_size)() {
        Ok(size) => send_resize(&session, size).await,
        Err(e) => tracing::debug!("initial window size unavailable: {e}"),
    }

    loop {
        tokio::select! {
            () = session.shutdown.triggered() => break,
            received = window_changes.recv() => {
                if received.is_none() {
                    session.shutdown.triggered().await;
                    break;
                }
                match (session.window_size)() {
                    Ok(size) => send_resize(&session, size).await,
                    Err(e) => tracing::warn!("failed to query window size: {e}"),
                }
            }
        }
    }
    "resize"
}

async fn send_resize(session: &Session, size: uberterm_protocol::WindowSize) {
    tracing::debug!("sending window size {}x{}", size.cols, size.rows);
    if let Err(e) = session
        .connection
        .send(&ClientMessage::ResizeTerminal(size))
        .await
    {
        tracing::warn!("failed to send window size: {e}");
    }
}

/// Write failures are only logged; the input and output loops notice a dead
/// socket on their own.
async fn ping_loop(session: Arc<Session>) -> &'static str {
    // The first tick completes immediately.
    let mut interval = tokio::time::interval(PING_INTERVAL);
    loop {
        tokio::select! {
            () = session.shutdown.triggered() => break,
            _ = interval.tick() => {
                tracing::debug!("sending ping");
                if let Err(e) = session.connection.send(&ClientMessage::Ping).await {
                    tracing::warn!("failed to send ping: {e}");
                }
            }
        }
    }
    "ping"
}
