use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::client::{Mode, Shared, Submission};
use crate::command::{Command, ToArg};
use crate::connection::Connection;
use crate::frame::Reply;
use crate::{Error, Result};

/// A command buffer sharing the executor's submission surface, except that
/// commands are stored instead of sent. `flush` puts the whole batch on the
/// wire in one write, then drains exactly one reply per command; while the
/// batch runs the dispatch task performs no other exchange.
pub struct Pipeline {
    submit_tx: mpsc::Sender<Submission>,
    shared: Arc<Shared>,
    commands: Vec<Command>,
    transactional: bool,
}

impl Pipeline {
    pub(crate) fn new(
        submit_tx: mpsc::Sender<Submission>,
        shared: Arc<Shared>,
        transactional: bool,
    ) -> Pipeline {
        Pipeline {
            submit_tx,
            shared,
            commands: Vec::new(),
            transactional,
        }
    }

    pub fn enqueue(&mut self, command: Command) -> &mut Pipeline {
        self.commands.push(command);
        self
    }

    /// `enqueue` sugar for a name plus a homogeneous argument list.
    pub fn enqueue_args<A: ToArg>(
        &mut self,
        name: &str,
        args: impl IntoIterator<Item = A>,
    ) -> &mut Pipeline {
        self.enqueue(Command::new(name).args(args))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Send the batch and collect its replies, in submission order. Server
    /// error replies stay in the returned list at the position of the
    /// command that caused them.
    pub async fn flush(self) -> Result<Vec<Reply>> {
        match self.shared.mode() {
            Mode::Closed => return Err(Error::Mode("client is closed")),
            Mode::PubSub => {
                return Err(Error::Mode("pipelines cannot run in subscriber mode"))
            }
            Mode::Normal => {}
        }

        if self.commands.is_empty() {
            return Ok(Vec::new());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit_tx
            .send(Submission::Batch {
                commands: self.commands,
                transactional: self.transactional,
                reply_tx,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }
}

/// Dispatch-side batch exchange. Writes everything in one flush, then reads
/// the exact number of replies the batch calls for.
pub(crate) async fn run_batch(
    conn: &mut Connection,
    commands: &[Command],
    transactional: bool,
) -> Result<Vec<Reply>> {
    if commands.is_empty() {
        return Ok(Vec::new());
    }

    if transactional {
        return run_tx(conn, commands).await;
    }

    conn.write_batch(commands).await?;

    let mut replies = Vec::with_capacity(commands.len());
    for _ in 0..commands.len() {
        replies.push(conn.read_reply().await?);
    }

    debug!(commands = commands.len(), "pipeline flushed");

    Ok(replies)
}

/// Transactional batch: `MULTI`, the commands, then `EXEC` — or `DISCARD`
/// instead when the buffer carries one, in which case everything after it is
/// dropped. All replies are drained before any of them is judged, so a
/// refused transaction never leaves the stream out of sync.
async fn run_tx(conn: &mut Connection, commands: &[Command]) -> Result<Vec<Reply>> {
    let discard_at = commands.iter().position(|c| c.name() == "DISCARD");
    let body = &commands[..discard_at.unwrap_or(commands.len())];

    let multi = Command::new("MULTI");
    let closer = if discard_at.is_some() {
        Command::new("DISCARD")
    } else {
        Command::new("EXEC")
    };

    let wire = std::iter::once(&multi)
        .chain(body.iter())
        .chain(std::iter::once(&closer));
    conn.write_batch(wire).await?;

    let multi_reply = conn.read_reply().await?;
    let mut queued = Vec::with_capacity(body.len());
    for _ in 0..body.len() {
        queued.push(conn.read_reply().await?);
    }
    let final_reply = conn.read_reply().await?;

    match multi_reply {
        Reply::Status(_) => {}
        Reply::Error(message) => return Err(Error::Server(message)),
        other => {
            return Err(Error::Protocol(format!(
                "unexpected MULTI reply {}",
                other
            )))
        }
    }

    if discard_at.is_some() {
        debug!(kept = body.len(), "transaction discarded");
        return match final_reply {
            Reply::Status(s) => Ok(vec![Reply::Status(s)]),
            Reply::Error(message) => Err(Error::Server(message)),
            other => Err(Error::Protocol(format!(
                "unexpected DISCARD reply {}",
                other
            ))),
        };
    }

    assemble_tx(queued, final_reply)
}

/// Pair the `QUEUED`-phase replies with the `EXEC` array. Commands the
/// server refused at queue time keep their error reply at their own
/// position; the EXEC array covers the rest, in order.
fn assemble_tx(queued: Vec<Reply>, exec: Reply) -> Result<Vec<Reply>> {
    for reply in &queued {
        match reply {
            Reply::Status(_) | Reply::Error(_) => {}
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected queue-phase reply {}",
                    other
                )))
            }
        }
    }

    let any_queue_error = queued.iter().any(|reply| matches!(reply, Reply::Error(_)));

    match exec {
        Reply::Array(values) => {
            let expected = queued
                .iter()
                .filter(|reply| matches!(reply, Reply::Status(_)))
                .count();
            if values.len() != expected {
                return Err(Error::Protocol(format!(
                    "transaction reply arity mismatch: expected {}, got {}",
                    expected,
                    values.len()
                )));
            }

            let mut values = values.into_iter();
            let mut replies = Vec::with_capacity(queued.len());
            for reply in queued {
                match reply {
                    Reply::Error(_) => replies.push(reply),
                    _ => match values.next() {
                        Some(value) => replies.push(value),
                        None => {
                            return Err(Error::Protocol(
                                "transaction reply arity mismatch".to_string(),
                            ))
                        }
                    },
                }
            }
            Ok(replies)
        }
        // EXEC refuses the whole transaction when any command failed to
        // queue. The per-command errors are the useful signal; positions
        // without one carry the abort error.
        Reply::Error(message) => {
            if any_queue_error {
                Ok(queued
                    .into_iter()
                    .map(|reply| match reply {
                        Reply::Error(_) => reply,
                        _ => Reply::Error(message.clone()),
                    })
                    .collect())
            } else {
                Err(Error::Server(message))
            }
        }
        Reply::Null => Err(Error::Server(
            "transaction aborted by the server".to_string(),
        )),
        other => Err(Error::Protocol(format!(
            "expected array reply for EXEC, got {}",
            other
        ))),
    }
}
