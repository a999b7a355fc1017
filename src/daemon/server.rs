//! Request dispatch and per-connection line handling.

use crate::daemon::protocol::{self, Request, Response};
use crate::domain::models::{ConnectionState, DeskStatus, PositionLabel};
use crate::domain::sitting::{SittingTracker, SAMPLE_INTERVAL};
use crate::infrastructure::bluetooth::manager::DeskManager;
use crate::infrastructure::bluetooth::transport::BleAdapter;
use crate::infrastructure::idle::IdleSource;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How long a status query waits for the desk before answering "not ready"
pub const STATUS_TIMEOUT: Duration = Duration::from_millis(50);

/// Longest request line kept in memory. Longer lines are skipped unanswered.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

pub struct Dispatcher<A: BleAdapter> {
    manager: DeskManager<A>,
    sitting: Arc<Mutex<SittingTracker>>,
    stand_threshold_cm: f64,
}

impl<A: BleAdapter> Clone for Dispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            sitting: Arc::clone(&self.sitting),
            stand_threshold_cm: self.stand_threshold_cm,
        }
    }
}

impl<A: BleAdapter> Dispatcher<A> {
    pub fn new(manager: DeskManager<A>, sitting: SittingTracker, stand_threshold_cm: f64) -> Self {
        Self {
            manager,
            sitting: Arc::new(Mutex::new(sitting)),
            stand_threshold_cm,
        }
    }

    fn sitting(&self) -> std::sync::MutexGuard<'_, SittingTracker> {
        self.sitting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::MoveTo { pos } => Response::Ack(self.move_to(pos).await),
            Request::Wait => Response::Ack(self.manager.await_session().await.is_some()),
            Request::GetStatus => Response::Status(self.status().await),
            Request::Unknown => Response::Ack(false),
        }
    }

    async fn move_to(&self, target_cm: f64) -> bool {
        let Some(session) = self.manager.await_session().await else {
            return false;
        };
        match session.move_to(target_cm).await {
            Ok(outcome) => {
                debug!(target_cm, ?outcome, "Move request done");
                true
            }
            Err(e) => {
                warn!(target_cm, "Move failed: {}", e);
                false
            }
        }
    }

    async fn status(&self) -> DeskStatus {
        let session = match tokio::time::timeout(STATUS_TIMEOUT, self.manager.await_session()).await
        {
            Ok(Some(session)) => session,
            _ => return DeskStatus::not_ready(),
        };

        let height = session.position_cm();
        DeskStatus {
            ready: true,
            height: Some(height),
            pos: Some(PositionLabel::for_height(height, self.stand_threshold_cm)),
            sitting_time: Some(self.sitting().sitting_time().as_secs()),
        }
    }

    /// Sample the desk height and idle time every [`SAMPLE_INTERVAL`] and fold
    /// them into the sitting counter. Runs until the task is dropped.
    pub async fn track_sitting<I: IdleSource>(&self, idle: I) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + SAMPLE_INTERVAL, SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let height = self
                .manager
                .current_session()
                .filter(|session| session.connection_state() == ConnectionState::Ready)
                .map(|session| session.position_cm());
            self.sitting()
                .record(height, idle.idle_time(), SAMPLE_INTERVAL);
        }
    }
}

/// Answer requests on one client connection until it closes.
///
/// Lines that are not JSON get no reply, and neither do lines longer than
/// [`MAX_LINE_BYTES`]. A trailing line without `\n` at end of stream is
/// dropped.
pub async fn serve_connection<S, A>(stream: S, dispatcher: Dispatcher<A>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite,
    A: BleAdapter,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            if read < MAX_LINE_BYTES {
                debug!("Dropping unterminated line at end of stream");
                break;
            }
            warn!(limit = MAX_LINE_BYTES, "Discarding oversized request line");
            if !skip_line(&mut reader).await? {
                break;
            }
            continue;
        }

        let Some(request) = protocol::parse_line(&line) else {
            debug!("Discarding malformed request line");
            continue;
        };
        debug!(?request, "Received request");

        let response = dispatcher.dispatch(request).await;
        let output = protocol::encode_line(&response)?;
        if let Err(e) = writer.write_all(&output).await {
            info!("Client went away, dropping response: {}", e);
            break;
        }
    }

    Ok(())
}

/// Consume input up to and including the next `\n`. Returns `false` if the
/// stream ended first.
async fn skip_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<bool> {
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(false);
        }
        if let Some(end) = buf.iter().position(|&b| b == b'\n') {
            reader.consume(end + 1);
            return Ok(true);
        }
        let len = buf.len();
        reader.consume(len);
    }
}
