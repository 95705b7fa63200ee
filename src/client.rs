use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::command::{Command, ToArg};
use crate::connection::{ConnectOptions, Connection};
use crate::frame::Reply;
use crate::pipeline::{self, Pipeline};
use crate::pubsub::{self, Event, PubSubRequest, PubSubSession, SessionExit};
use crate::{Error, Result};

/// Fixed delay between redial attempts in the reconnect loop.
pub(crate) const RECONNECT_INTERVAL: Duration = Duration::from_millis(1200);

const SUBMIT_QUEUE_DEPTH: usize = 64;
const EVENT_QUEUE_DEPTH: usize = 128;

/// What the executor will currently accept. Admission is checked before a
/// command is enqueued, so an illegal submission never reaches the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Normal,
    PubSub,
    Closed,
}

impl Mode {
    fn from_u8(value: u8) -> Mode {
        match value {
            0 => Mode::Normal,
            1 => Mode::PubSub,
            _ => Mode::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Mode::Normal => 0,
            Mode::PubSub => 1,
            Mode::Closed => 2,
        }
    }
}

/// State shared between client handles and the dispatch task.
pub(crate) struct Shared {
    mode: AtomicU8,
    connected: AtomicBool,
}

impl Shared {
    fn new() -> Shared {
        Shared {
            mode: AtomicU8::new(Mode::Normal.as_u8()),
            connected: AtomicBool::new(true),
        }
    }

    pub(crate) fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// `Closed` is sticky: once a client is closed no transition leaves it.
    pub(crate) fn set_mode(&self, mode: Mode) {
        let _ = self
            .mode
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if Mode::from_u8(current) == Mode::Closed {
                    None
                } else {
                    Some(mode.as_u8())
                }
            });
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

/// One queued exchange, paired with the caller's completion slot.
pub(crate) enum Submission {
    Exec {
        command: Command,
        reply_tx: oneshot::Sender<Result<Reply>>,
    },
    Batch {
        commands: Vec<Command>,
        transactional: bool,
        reply_tx: oneshot::Sender<Result<Vec<Reply>>>,
    },
    Subscribe {
        channels: Vec<String>,
        patterns: Vec<String>,
        events_tx: mpsc::Sender<Event>,
        control_rx: mpsc::Receiver<PubSubRequest>,
        ready_tx: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        done_tx: oneshot::Sender<()>,
    },
}

/// The reason a submission was refused before dispatch, if any.
pub(crate) fn admission_error(mode: Mode, command: &Command) -> Option<Error> {
    match mode {
        Mode::Closed => Some(Error::Mode("client is closed")),
        Mode::PubSub if command.is_subscription() => Some(Error::Mode(
            "use the subscriber session handle to change subscriptions",
        )),
        Mode::PubSub if !command.is_pubsub_allowed() => Some(Error::Mode(
            "only (P)SUBSCRIBE, (P)UNSUBSCRIBE, PING and QUIT are allowed in subscriber mode",
        )),
        Mode::Normal if command.is_subscription() => Some(Error::Mode(
            "subscription commands must go through subscribe() and psubscribe()",
        )),
        _ => None,
    }
}

/// Handle to one server connection.
///
/// The connection itself is owned by a single dispatch task; handles are
/// cheap to clone and submit commands through a FIFO queue, so concurrent
/// callers are serialized and each gets exactly the reply to its own
/// command. One connection carries one exchange at a time; a blocking
/// command (`BLPOP`, `XREAD BLOCK`, ...) parks the whole connection until
/// the server answers, so callers needing concurrency alongside blocking
/// commands should open a second client.
#[derive(Clone)]
pub struct Client {
    submit_tx: mpsc::Sender<Submission>,
    shared: Arc<Shared>,
}

impl Client {
    /// Dial, authenticate and select per `options`, then spawn the dispatch
    /// task that owns the connection.
    pub async fn connect(options: ConnectOptions) -> Result<Client> {
        let conn = Connection::establish(&options).await?;
        let shared = Arc::new(Shared::new());
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);

        let dispatcher = Dispatcher {
            conn,
            options,
            shared: Arc::clone(&shared),
        };
        tokio::spawn(dispatcher.run(submit_rx));

        Ok(Client { submit_tx, shared })
    }

    /// Submit one command and wait for its reply. An `-ERR` reply surfaces
    /// as [`Error::Server`]; the connection stays usable afterwards.
    pub async fn exec(&self, command: Command) -> Result<Reply> {
        if let Some(err) = admission_error(self.shared.mode(), &command) {
            return Err(err);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit_tx
            .send(Submission::Exec { command, reply_tx })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        match reply_rx.await.map_err(|_| Error::ConnectionClosed)? {
            Ok(Reply::Error(message)) => Err(Error::Server(message)),
            other => other,
        }
    }

    /// `exec` sugar for a name plus a homogeneous argument list.
    pub async fn exec_args<A: ToArg>(
        &self,
        name: &str,
        args: impl IntoIterator<Item = A>,
    ) -> Result<Reply> {
        self.exec(Command::new(name).args(args)).await
    }

    /// A command buffer that batches submissions and flushes them in one
    /// write.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.submit_tx.clone(), Arc::clone(&self.shared), false)
    }

    /// As [`pipeline`](Client::pipeline), wrapped in `MULTI`/`EXEC` on
    /// flush.
    pub fn tx(&self) -> Pipeline {
        Pipeline::new(self.submit_tx.clone(), Arc::clone(&self.shared), true)
    }

    /// Enter subscriber mode for the given channels.
    pub async fn subscribe<S: Into<String>>(
        &self,
        channels: impl IntoIterator<Item = S>,
    ) -> Result<PubSubSession> {
        let channels = channels.into_iter().map(Into::into).collect();
        self.start_session(channels, Vec::new()).await
    }

    /// Enter subscriber mode for the given glob patterns.
    pub async fn psubscribe<S: Into<String>>(
        &self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Result<PubSubSession> {
        let patterns = patterns.into_iter().map(Into::into).collect();
        self.start_session(Vec::new(), patterns).await
    }

    async fn start_session(
        &self,
        channels: Vec<String>,
        patterns: Vec<String>,
    ) -> Result<PubSubSession> {
        if channels.is_empty() && patterns.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one channel or pattern is required".to_string(),
            ));
        }
        match self.shared.mode() {
            Mode::Closed => return Err(Error::Mode("client is closed")),
            Mode::PubSub => {
                return Err(Error::Mode(
                    "a subscriber session is already active; use its handle to subscribe further",
                ))
            }
            Mode::Normal => {}
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::channel(16);
        let (ready_tx, ready_rx) = oneshot::channel();

        self.submit_tx
            .send(Submission::Subscribe {
                channels,
                patterns,
                events_tx,
                control_rx,
                ready_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        ready_rx.await.map_err(|_| Error::ConnectionClosed)??;

        Ok(PubSubSession::new(events_rx, control_tx))
    }

    /// Close the connection. Idempotent; safe to call any number of times,
    /// from any handle.
    pub async fn close(&self) {
        if self.shared.mode() == Mode::Closed {
            return;
        }
        self.shared.set_mode(Mode::Closed);

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .submit_tx
            .send(Submission::Shutdown { done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
        self.shared.set_connected(false);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.mode() != Mode::Closed && self.shared.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.mode() == Mode::Closed
    }
}

/// The dispatch task: sole owner of the connection. Pops submissions in
/// FIFO order and performs one exchange at a time, so reply `k` always
/// belongs to request `k`.
struct Dispatcher {
    conn: Connection,
    options: ConnectOptions,
    shared: Arc<Shared>,
}

impl Dispatcher {
    #[instrument(name = "dispatcher", skip_all, fields(host = %self.options.host, port = self.options.port))]
    async fn run(mut self, mut submit_rx: mpsc::Receiver<Submission>) {
        while let Some(submission) = submit_rx.recv().await {
            match submission {
                Submission::Exec { command, reply_tx } => {
                    // A waiter that is already gone was cancelled before
                    // dispatch; its command must not reach the wire.
                    if reply_tx.is_closed() {
                        debug!(command = %command.name(), "submission cancelled before dispatch");
                        continue;
                    }

                    match self.exchange(&command).await {
                        Ok(reply) => {
                            let _ = reply_tx.send(Ok(reply));
                        }
                        Err(err) => {
                            error!(command = %command.name(), error = %err, "exchange failed");
                            let _ = reply_tx.send(Err(err));
                            self.teardown(&mut submit_rx).await;
                            return;
                        }
                    }
                }
                Submission::Batch {
                    commands,
                    transactional,
                    reply_tx,
                } => {
                    if reply_tx.is_closed() {
                        debug!("batch cancelled before dispatch");
                        continue;
                    }

                    match self.exchange_batch(&commands, transactional).await {
                        Ok(replies) => {
                            let _ = reply_tx.send(Ok(replies));
                        }
                        // The server refused the batch; the stream is still
                        // in sync and the connection stays up.
                        Err(err @ Error::Server(_)) => {
                            let _ = reply_tx.send(Err(err));
                        }
                        Err(err) => {
                            error!(error = %err, "batch exchange failed");
                            let _ = reply_tx.send(Err(err));
                            self.teardown(&mut submit_rx).await;
                            return;
                        }
                    }
                }
                Submission::Subscribe {
                    channels,
                    patterns,
                    events_tx,
                    control_rx,
                    ready_tx,
                } => {
                    let exit = pubsub::run_session(
                        &mut self.conn,
                        &self.shared,
                        channels,
                        patterns,
                        events_tx,
                        control_rx,
                        ready_tx,
                        &mut submit_rx,
                    )
                    .await;

                    match exit {
                        SessionExit::Resumed => {
                            self.shared.set_mode(Mode::Normal);
                        }
                        SessionExit::Shutdown(done_tx) => {
                            self.shared.set_mode(Mode::Closed);
                            self.shared.set_connected(false);
                            let _ = self.conn.shutdown().await;
                            let _ = done_tx.send(());
                            return;
                        }
                        SessionExit::Fatal(err) => {
                            // Subscriptions are never restored across a
                            // reconnect; the session is gone and the next
                            // exchange decides whether to redial.
                            warn!(error = %err, "subscriber session lost");
                            self.shared.set_mode(Mode::Normal);
                            self.shared.set_connected(false);
                            let _ = self.conn.shutdown().await;
                        }
                    }
                }
                Submission::Shutdown { done_tx } => {
                    self.shared.set_mode(Mode::Closed);
                    self.shared.set_connected(false);
                    let _ = self.conn.shutdown().await;
                    let _ = done_tx.send(());
                    return;
                }
            }
        }

        // Every client handle is gone; nothing can be submitted anymore.
        debug!("all client handles dropped; closing connection");
        let _ = self.conn.shutdown().await;
    }

    /// One request/reply exchange, with a single transparent retry after a
    /// successful reconnect. The command is re-submitted verbatim, so
    /// callers of non-idempotent commands should leave `max_retries` at 0.
    async fn exchange(&mut self, command: &Command) -> Result<Reply> {
        match self.conn.round_trip(command).await {
            Ok(reply) => Ok(reply),
            Err(err) if err.is_transient() && self.options.max_retries > 0 => {
                warn!(command = %command.name(), error = %err, "transport error; reconnecting");
                self.shared.set_connected(false);
                self.reconnect().await?;
                self.conn.round_trip(command).await
            }
            Err(err) => Err(err),
        }
    }

    async fn exchange_batch(
        &mut self,
        commands: &[Command],
        transactional: bool,
    ) -> Result<Vec<Reply>> {
        match pipeline::run_batch(&mut self.conn, commands, transactional).await {
            Ok(replies) => Ok(replies),
            Err(err) if err.is_transient() && self.options.max_retries > 0 => {
                warn!(error = %err, "transport error during batch; reconnecting");
                self.shared.set_connected(false);
                self.reconnect().await?;
                pipeline::run_batch(&mut self.conn, commands, transactional).await
            }
            Err(err) => Err(err),
        }
    }

    /// Probe the current connection first; if the probe fails, redial on a
    /// fixed interval until success or the retry ceiling. The attempt
    /// counter is local, so a later failure starts the count afresh.
    async fn reconnect(&mut self) -> Result<()> {
        if self.conn.ping().await {
            debug!("connection probe succeeded; resuming");
            self.shared.set_connected(true);
            return Ok(());
        }

        let _ = self.conn.shutdown().await;

        let mut attempts: u32 = 0;
        loop {
            if attempts >= self.options.max_retries {
                return Err(Error::RetriesExhausted { attempts });
            }
            attempts += 1;
            time::sleep(RECONNECT_INTERVAL).await;

            match Connection::establish(&self.options).await {
                Ok(conn) => {
                    info!(attempts, "reconnected");
                    self.conn = conn;
                    self.shared.set_connected(true);
                    return Ok(());
                }
                Err(err) => {
                    debug!(attempt = attempts, error = %err, "reconnect attempt failed");
                }
            }
        }
    }

    /// The connection is beyond recovery: fail the caller of every queued
    /// submission and refuse everything that comes later.
    async fn teardown(&mut self, submit_rx: &mut mpsc::Receiver<Submission>) {
        self.shared.set_mode(Mode::Closed);
        self.shared.set_connected(false);
        let _ = self.conn.shutdown().await;

        submit_rx.close();
        while let Ok(submission) = submit_rx.try_recv() {
            match submission {
                Submission::Exec { reply_tx, .. } => {
                    let _ = reply_tx.send(Err(Error::ConnectionClosed));
                }
                Submission::Batch { reply_tx, .. } => {
                    let _ = reply_tx.send(Err(Error::ConnectionClosed));
                }
                Submission::Subscribe { ready_tx, .. } => {
                    let _ = ready_tx.send(Err(Error::ConnectionClosed));
                }
                Submission::Shutdown { done_tx } => {
                    let _ = done_tx.send(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_in_normal_mode() {
        let get = Command::new("GET").arg("foo");
        assert!(admission_error(Mode::Normal, &get).is_none());

        let subscribe = Command::new("SUBSCRIBE").arg("news");
        assert!(matches!(
            admission_error(Mode::Normal, &subscribe),
            Some(Error::Mode(_))
        ));
    }

    #[test]
    fn admission_in_pubsub_mode() {
        let get = Command::new("GET").arg("foo");
        assert!(matches!(
            admission_error(Mode::PubSub, &get),
            Some(Error::Mode(_))
        ));

        let ping = Command::new("PING");
        assert!(admission_error(Mode::PubSub, &ping).is_none());

        let quit = Command::new("QUIT");
        assert!(admission_error(Mode::PubSub, &quit).is_none());

        // Subscription changes go through the session handle, not exec.
        let subscribe = Command::new("SUBSCRIBE").arg("more");
        assert!(matches!(
            admission_error(Mode::PubSub, &subscribe),
            Some(Error::Mode(_))
        ));
    }

    #[test]
    fn admission_when_closed() {
        let ping = Command::new("PING");
        assert!(matches!(
            admission_error(Mode::Closed, &ping),
            Some(Error::Mode(_))
        ));
    }

    #[test]
    fn closed_mode_is_sticky() {
        let shared = Shared::new();
        assert_eq!(shared.mode(), Mode::Normal);

        shared.set_mode(Mode::PubSub);
        assert_eq!(shared.mode(), Mode::PubSub);

        shared.set_mode(Mode::Closed);
        shared.set_mode(Mode::Normal);
        assert_eq!(shared.mode(), Mode::Closed);
    }
}
