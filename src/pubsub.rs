use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::client::{Mode, Shared, Submission};
use crate::command::Command;
use crate::connection::Connection;
use crate::frame::Reply;
use crate::{Error, Result};

/// A server-initiated push, parsed out of the fixed-shape arrays the server
/// emits in subscriber mode.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Published to a channel this connection subscribed to.
    Message { channel: String, payload: Bytes },
    /// Published to a channel matching a subscribed pattern.
    PMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    Subscribe { channel: String, active: i64 },
    Unsubscribe { channel: String, active: i64 },
    PSubscribe { pattern: String, active: i64 },
    PUnsubscribe { pattern: String, active: i64 },
}

/// Requests a session handle sends to the streaming receiver.
pub(crate) enum PubSubRequest {
    Subscribe(Vec<String>),
    PSubscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    PUnsubscribe(Vec<String>),
    Ping(oneshot::Sender<Result<Reply>>),
    Close(oneshot::Sender<Result<()>>),
}

/// A live subscription: a lazy sequence of events plus a handle for
/// changing the membership sets.
///
/// Events for a single channel arrive in server-emitted order; across
/// channels the interleaving is whatever the server produced. Dropping the
/// session without [`close`](PubSubSession::close) unsubscribes everything
/// as soon as the receiver notices.
pub struct PubSubSession {
    events_rx: mpsc::Receiver<Event>,
    control_tx: mpsc::Sender<PubSubRequest>,
}

impl PubSubSession {
    pub(crate) fn new(
        events_rx: mpsc::Receiver<Event>,
        control_tx: mpsc::Sender<PubSubRequest>,
    ) -> PubSubSession {
        PubSubSession {
            events_rx,
            control_tx,
        }
    }

    /// The next event, or `None` once the session has ended.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    pub async fn subscribe<S: Into<String>>(
        &self,
        channels: impl IntoIterator<Item = S>,
    ) -> Result<()> {
        self.request(PubSubRequest::Subscribe(collect(channels)))
            .await
    }

    pub async fn psubscribe<S: Into<String>>(
        &self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Result<()> {
        self.request(PubSubRequest::PSubscribe(collect(patterns)))
            .await
    }

    /// Unsubscribe the given channels; an empty list unsubscribes all of
    /// them.
    pub async fn unsubscribe<S: Into<String>>(
        &self,
        channels: impl IntoIterator<Item = S>,
    ) -> Result<()> {
        self.request(PubSubRequest::Unsubscribe(collect(channels)))
            .await
    }

    /// Unsubscribe the given patterns; an empty list unsubscribes all of
    /// them.
    pub async fn punsubscribe<S: Into<String>>(
        &self,
        patterns: impl IntoIterator<Item = S>,
    ) -> Result<()> {
        self.request(PubSubRequest::PUnsubscribe(collect(patterns)))
            .await
    }

    pub async fn ping(&self) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(PubSubRequest::Ping(reply_tx)).await?;
        reply_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Unsubscribe everything and leave subscriber mode.
    pub async fn close(self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control_tx
            .send(PubSubRequest::Close(ack_tx))
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        ack_rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    async fn request(&self, request: PubSubRequest) -> Result<()> {
        self.control_tx
            .send(request)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

impl Drop for PubSubSession {
    fn drop(&mut self) {
        let (ack_tx, _ack_rx) = oneshot::channel();
        let _ = self.control_tx.try_send(PubSubRequest::Close(ack_tx));
    }
}

fn collect<S: Into<String>>(targets: impl IntoIterator<Item = S>) -> Vec<String> {
    targets.into_iter().map(Into::into).collect()
}

/// How the streaming receiver ended.
pub(crate) enum SessionExit {
    /// Membership drained to zero; the dispatcher resumes normal scheduling.
    Resumed,
    /// A client shutdown arrived mid-session.
    Shutdown(oneshot::Sender<()>),
    /// Transport or protocol failure. Subscriptions are not restored across
    /// a reconnect.
    Fatal(Error),
}

/// The streaming receiver the dispatch task runs while the connection is in
/// subscriber mode. Owns the membership sets; forwards pushes to the
/// session; answers `PING`/`QUIT` by pairing non-push replies with the
/// oldest pending request; rejects everything else without touching the
/// wire.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_session(
    conn: &mut Connection,
    shared: &Shared,
    channels: Vec<String>,
    patterns: Vec<String>,
    events_tx: mpsc::Sender<Event>,
    mut control_rx: mpsc::Receiver<PubSubRequest>,
    ready_tx: oneshot::Sender<Result<()>>,
    submit_rx: &mut mpsc::Receiver<Submission>,
) -> SessionExit {
    let mut confirmed_channels: HashSet<String> = HashSet::new();
    let mut confirmed_patterns: HashSet<String> = HashSet::new();

    // Predicted server-side membership after every command written so far.
    // Confirmation events are counted against `outstanding`; the mode can
    // only be exited once nothing is left in flight, otherwise a late
    // confirmation would desynchronize the stream.
    let mut sim_channels: HashSet<String> = HashSet::new();
    let mut sim_patterns: HashSet<String> = HashSet::new();
    let mut outstanding: usize = 0;

    let mut initial = Vec::new();
    if !channels.is_empty() {
        let (command, expected) = add_command("SUBSCRIBE", &channels, &mut sim_channels);
        outstanding += expected;
        initial.push(command);
    }
    if !patterns.is_empty() {
        let (command, expected) = add_command("PSUBSCRIBE", &patterns, &mut sim_patterns);
        outstanding += expected;
        initial.push(command);
    }

    if let Err(err) = conn.write_batch(&initial).await {
        warn!(error = %err, "failed to enter subscriber mode");
        let _ = ready_tx.send(Err(err));
        return SessionExit::Fatal(Error::ConnectionClosed);
    }

    shared.set_mode(Mode::PubSub);
    let _ = ready_tx.send(Ok(()));
    debug!(
        channels = channels.len(),
        patterns = patterns.len(),
        "subscriber mode entered"
    );

    let mut pending: VecDeque<oneshot::Sender<Result<Reply>>> = VecDeque::new();
    let mut closing: Option<oneshot::Sender<Result<()>>> = None;
    let mut detached = false;
    let mut control_open = true;
    let mut submissions_open = true;

    loop {
        tokio::select! {
            reply = conn.read_reply() => {
                let reply = match reply {
                    Ok(reply) => reply,
                    Err(err) => return fail_session(pending, closing, err),
                };

                if is_push(&reply) {
                    let event = match parse_push(reply) {
                        Ok(event) => event,
                        Err(err) => return fail_session(pending, closing, err),
                    };

                    let subscription_event = match &event {
                        Event::Subscribe { channel, .. } => {
                            confirmed_channels.insert(channel.clone());
                            true
                        }
                        Event::Unsubscribe { channel, .. } => {
                            confirmed_channels.remove(channel);
                            true
                        }
                        Event::PSubscribe { pattern, .. } => {
                            confirmed_patterns.insert(pattern.clone());
                            true
                        }
                        Event::PUnsubscribe { pattern, .. } => {
                            confirmed_patterns.remove(pattern);
                            true
                        }
                        _ => false,
                    };
                    if subscription_event {
                        outstanding = outstanding.saturating_sub(1);
                    }

                    if !detached && events_tx.send(event).await.is_err() {
                        // The event receiver is gone; nothing can consume
                        // this session anymore, so drain the membership.
                        detached = true;
                        if let Err(err) =
                            unsubscribe_all(conn, &mut sim_channels, &mut sim_patterns, &mut outstanding).await
                        {
                            return fail_session(pending, closing, err);
                        }
                    }

                    if subscription_event
                        && outstanding == 0
                        && confirmed_channels.is_empty()
                        && confirmed_patterns.is_empty()
                    {
                        if let Some(ack) = closing.take() {
                            let _ = ack.send(Ok(()));
                        }
                        for waiter in pending.drain(..) {
                            let _ = waiter.send(Err(Error::ConnectionClosed));
                        }
                        debug!("subscriber mode exited");
                        return SessionExit::Resumed;
                    }
                } else {
                    // Not a push: the reply to the oldest pending PING/QUIT.
                    match pending.pop_front() {
                        Some(waiter) => {
                            let _ = waiter.send(Ok(reply));
                        }
                        None => {
                            return fail_session(
                                pending,
                                closing,
                                Error::Protocol(format!(
                                    "unsolicited reply {} in subscriber mode",
                                    reply
                                )),
                            )
                        }
                    }
                }
            }

            request = control_rx.recv(), if control_open => {
                match request {
                    Some(PubSubRequest::Subscribe(targets)) => {
                        if closing.is_some() {
                            continue;
                        }
                        let (command, expected) = add_command("SUBSCRIBE", &targets, &mut sim_channels);
                        outstanding += expected;
                        if let Err(err) = conn.write_command(&command).await {
                            return fail_session(pending, closing, err);
                        }
                    }
                    Some(PubSubRequest::PSubscribe(targets)) => {
                        if closing.is_some() {
                            continue;
                        }
                        let (command, expected) = add_command("PSUBSCRIBE", &targets, &mut sim_patterns);
                        outstanding += expected;
                        if let Err(err) = conn.write_command(&command).await {
                            return fail_session(pending, closing, err);
                        }
                    }
                    Some(PubSubRequest::Unsubscribe(targets)) => {
                        if closing.is_some() {
                            continue;
                        }
                        let (command, expected) = remove_command("UNSUBSCRIBE", &targets, &mut sim_channels);
                        outstanding += expected;
                        if let Err(err) = conn.write_command(&command).await {
                            return fail_session(pending, closing, err);
                        }
                    }
                    Some(PubSubRequest::PUnsubscribe(targets)) => {
                        if closing.is_some() {
                            continue;
                        }
                        let (command, expected) = remove_command("PUNSUBSCRIBE", &targets, &mut sim_patterns);
                        outstanding += expected;
                        if let Err(err) = conn.write_command(&command).await {
                            return fail_session(pending, closing, err);
                        }
                    }
                    Some(PubSubRequest::Ping(waiter)) => {
                        if closing.is_some() {
                            let _ = waiter.send(Err(Error::Mode("subscriber session is closing")));
                            continue;
                        }
                        if let Err(err) = conn.write_command(&Command::new("PING")).await {
                            let _ = waiter.send(Err(Error::ConnectionClosed));
                            return fail_session(pending, closing, err);
                        }
                        pending.push_back(waiter);
                    }
                    Some(PubSubRequest::Close(ack)) => {
                        if closing.is_some() {
                            let _ = ack.send(Ok(()));
                            continue;
                        }
                        closing = Some(ack);
                        detached = true;
                        if let Err(err) =
                            unsubscribe_all(conn, &mut sim_channels, &mut sim_patterns, &mut outstanding).await
                        {
                            return fail_session(pending, closing, err);
                        }
                    }
                    None => {
                        control_open = false;
                        if closing.is_none() {
                            detached = true;
                            if let Err(err) =
                                unsubscribe_all(conn, &mut sim_channels, &mut sim_patterns, &mut outstanding).await
                            {
                                return fail_session(pending, closing, err);
                            }
                        }
                    }
                }
            }

            submission = submit_rx.recv(), if submissions_open => {
                match submission {
                    Some(Submission::Exec { command, reply_tx }) => {
                        if reply_tx.is_closed() {
                            continue;
                        }
                        match command.name().as_str() {
                            "PING" | "QUIT" => {
                                if let Err(err) = conn.write_command(&command).await {
                                    let _ = reply_tx.send(Err(err));
                                    return fail_session(pending, closing, Error::ConnectionClosed);
                                }
                                pending.push_back(reply_tx);
                            }
                            _ => {
                                let _ = reply_tx.send(Err(Error::Mode(
                                    "only (P)SUBSCRIBE, (P)UNSUBSCRIBE, PING and QUIT are allowed in subscriber mode",
                                )));
                            }
                        }
                    }
                    Some(Submission::Batch { reply_tx, .. }) => {
                        let _ = reply_tx.send(Err(Error::Mode(
                            "pipelines cannot run in subscriber mode",
                        )));
                    }
                    Some(Submission::Subscribe { ready_tx, .. }) => {
                        let _ = ready_tx.send(Err(Error::Mode(
                            "a subscriber session is already active; use its handle to subscribe further",
                        )));
                    }
                    Some(Submission::Shutdown { done_tx }) => {
                        for waiter in pending.drain(..) {
                            let _ = waiter.send(Err(Error::ConnectionClosed));
                        }
                        if let Some(ack) = closing.take() {
                            let _ = ack.send(Err(Error::ConnectionClosed));
                        }
                        return SessionExit::Shutdown(done_tx);
                    }
                    None => {
                        submissions_open = false;
                    }
                }
            }
        }
    }
}

fn fail_session(
    mut pending: VecDeque<oneshot::Sender<Result<Reply>>>,
    closing: Option<oneshot::Sender<Result<()>>>,
    err: Error,
) -> SessionExit {
    for waiter in pending.drain(..) {
        let _ = waiter.send(Err(Error::ConnectionClosed));
    }
    if let Some(ack) = closing {
        let _ = ack.send(Err(Error::ConnectionClosed));
    }
    SessionExit::Fatal(err)
}

/// Build a SUBSCRIBE/PSUBSCRIBE command. The server confirms one event per
/// named target.
fn add_command(
    name: &'static str,
    targets: &[String],
    sim: &mut HashSet<String>,
) -> (Command, usize) {
    let command = Command::new(name).args(targets);
    sim.extend(targets.iter().cloned());
    (command, targets.len())
}

/// Build an UNSUBSCRIBE/PUNSUBSCRIBE command. Without targets the server
/// confirms once per current subscription, or exactly once when there are
/// none.
fn remove_command(
    name: &'static str,
    targets: &[String],
    sim: &mut HashSet<String>,
) -> (Command, usize) {
    if targets.is_empty() {
        let expected = sim.len().max(1);
        sim.clear();
        (Command::new(name), expected)
    } else {
        for target in targets {
            sim.remove(target);
        }
        (Command::new(name).args(targets), targets.len())
    }
}

async fn unsubscribe_all(
    conn: &mut Connection,
    sim_channels: &mut HashSet<String>,
    sim_patterns: &mut HashSet<String>,
    outstanding: &mut usize,
) -> Result<()> {
    let (unsubscribe, expected) = remove_command("UNSUBSCRIBE", &[], sim_channels);
    *outstanding += expected;
    let (punsubscribe, expected) = remove_command("PUNSUBSCRIBE", &[], sim_patterns);
    *outstanding += expected;

    conn.write_batch([&unsubscribe, &punsubscribe]).await
}

fn is_push(reply: &Reply) -> bool {
    match reply {
        Reply::Array(items) => matches!(
            items.first(),
            Some(Reply::Bulk(kind)) if matches!(
                kind.as_ref(),
                b"message" | b"pmessage" | b"subscribe" | b"unsubscribe" | b"psubscribe" | b"punsubscribe"
            )
        ),
        _ => false,
    }
}

/// Parse one server push. The shape is fixed per kind; anything else is a
/// protocol error and fatal to the session.
pub(crate) fn parse_push(reply: Reply) -> Result<Event> {
    let items = match reply {
        Reply::Array(items) => items,
        other => {
            return Err(Error::Protocol(format!(
                "expected array push event, got {}",
                other
            )))
        }
    };

    let mut items = items.into_iter();
    let kind = match items.next() {
        Some(Reply::Bulk(kind)) => kind,
        other => {
            return Err(Error::Protocol(format!(
                "push event without a kind tag: {:?}",
                other
            )))
        }
    };

    let event = match kind.as_ref() {
        b"message" => Event::Message {
            channel: next_string(&mut items)?,
            payload: next_bytes(&mut items)?,
        },
        b"pmessage" => Event::PMessage {
            pattern: next_string(&mut items)?,
            channel: next_string(&mut items)?,
            payload: next_bytes(&mut items)?,
        },
        b"subscribe" => Event::Subscribe {
            channel: next_string(&mut items)?,
            active: next_integer(&mut items)?,
        },
        b"unsubscribe" => Event::Unsubscribe {
            channel: next_string(&mut items)?,
            active: next_integer(&mut items)?,
        },
        b"psubscribe" => Event::PSubscribe {
            pattern: next_string(&mut items)?,
            active: next_integer(&mut items)?,
        },
        b"punsubscribe" => Event::PUnsubscribe {
            pattern: next_string(&mut items)?,
            active: next_integer(&mut items)?,
        },
        other => {
            return Err(Error::Protocol(format!(
                "unknown push event kind {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    };

    if items.next().is_some() {
        return Err(Error::Protocol("oversized push event".to_string()));
    }

    Ok(event)
}

fn next_string(items: &mut std::vec::IntoIter<Reply>) -> Result<String> {
    match items.next() {
        Some(Reply::Bulk(data)) => String::from_utf8(data.to_vec())
            .map_err(|_| Error::Protocol("non-UTF-8 name in push event".to_string())),
        // UNSUBSCRIBE with nothing subscribed confirms with a nil name.
        Some(Reply::Null) => Ok(String::new()),
        Some(other) => Err(Error::Protocol(format!(
            "unexpected {} in push event",
            other
        ))),
        None => Err(Error::Protocol("truncated push event".to_string())),
    }
}

fn next_bytes(items: &mut std::vec::IntoIter<Reply>) -> Result<Bytes> {
    match items.next() {
        Some(Reply::Bulk(data)) => Ok(data),
        Some(Reply::Null) => Ok(Bytes::new()),
        Some(other) => Err(Error::Protocol(format!(
            "unexpected {} in push event",
            other
        ))),
        None => Err(Error::Protocol("truncated push event".to_string())),
    }
}

fn next_integer(items: &mut std::vec::IntoIter<Reply>) -> Result<i64> {
    match items.next() {
        Some(Reply::Integer(i)) => Ok(i),
        Some(other) => Err(Error::Protocol(format!(
            "unexpected {} in push event",
            other
        ))),
        None => Err(Error::Protocol("truncated push event".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_message_push() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Bytes::from("message")),
            Reply::Bulk(Bytes::from("news")),
            Reply::Bulk(Bytes::from("hello")),
        ]);

        let event = parse_push(reply).unwrap();

        assert_eq!(
            event,
            Event::Message {
                channel: "news".to_string(),
                payload: Bytes::from("hello"),
            }
        );
    }

    #[test]
    fn parse_pmessage_push() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Bytes::from("pmessage")),
            Reply::Bulk(Bytes::from("news.*")),
            Reply::Bulk(Bytes::from("news.eu")),
            Reply::Bulk(Bytes::from("hello")),
        ]);

        let event = parse_push(reply).unwrap();

        assert_eq!(
            event,
            Event::PMessage {
                pattern: "news.*".to_string(),
                channel: "news.eu".to_string(),
                payload: Bytes::from("hello"),
            }
        );
    }

    #[test]
    fn parse_subscribe_push() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Bytes::from("subscribe")),
            Reply::Bulk(Bytes::from("news")),
            Reply::Integer(1),
        ]);

        let event = parse_push(reply).unwrap();

        assert_eq!(
            event,
            Event::Subscribe {
                channel: "news".to_string(),
                active: 1,
            }
        );
    }

    #[test]
    fn parse_unsubscribe_push_with_nil_channel() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Bytes::from("unsubscribe")),
            Reply::Null,
            Reply::Integer(0),
        ]);

        let event = parse_push(reply).unwrap();

        assert_eq!(
            event,
            Event::Unsubscribe {
                channel: String::new(),
                active: 0,
            }
        );
    }

    #[test]
    fn parse_push_rejects_unknown_kind() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Bytes::from("announcement")),
            Reply::Bulk(Bytes::from("news")),
        ]);

        assert!(matches!(parse_push(reply), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_push_rejects_truncated_event() {
        let reply = Reply::Array(vec![Reply::Bulk(Bytes::from("message"))]);

        assert!(matches!(parse_push(reply), Err(Error::Protocol(_))));
    }

    #[test]
    fn parse_push_rejects_oversized_event() {
        let reply = Reply::Array(vec![
            Reply::Bulk(Bytes::from("subscribe")),
            Reply::Bulk(Bytes::from("news")),
            Reply::Integer(1),
            Reply::Integer(9),
        ]);

        assert!(matches!(parse_push(reply), Err(Error::Protocol(_))));
    }

    #[test]
    fn push_detection() {
        let push = Reply::Array(vec![
            Reply::Bulk(Bytes::from("message")),
            Reply::Bulk(Bytes::from("news")),
            Reply::Bulk(Bytes::from("hi")),
        ]);
        assert!(is_push(&push));

        assert!(!is_push(&Reply::Status("PONG".to_string())));
        assert!(!is_push(&Reply::Array(vec![Reply::Integer(1)])));
        assert!(!is_push(&Reply::Array(vec![Reply::Bulk(Bytes::from(
            "values"
        ))])));
    }

    #[test]
    fn remove_command_counts_unsubscribe_all() {
        let mut sim: HashSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let (command, expected) = remove_command("UNSUBSCRIBE", &[], &mut sim);

        assert_eq!(command.name(), "UNSUBSCRIBE");
        assert_eq!(command.tokens().len(), 1);
        assert_eq!(expected, 3);
        assert!(sim.is_empty());
    }

    #[test]
    fn remove_command_counts_empty_membership() {
        let mut sim: HashSet<String> = HashSet::new();

        let (_, expected) = remove_command("PUNSUBSCRIBE", &[], &mut sim);

        // The server confirms exactly once even with nothing subscribed.
        assert_eq!(expected, 1);
    }

    #[test]
    fn remove_command_counts_named_targets() {
        let mut sim: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let targets = vec!["a".to_string(), "zz".to_string()];

        let (command, expected) = remove_command("UNSUBSCRIBE", &targets, &mut sim);

        assert_eq!(command.tokens().len(), 3);
        assert_eq!(expected, 2);
        assert_eq!(sim.len(), 1);
    }

    #[test]
    fn add_command_extends_membership() {
        let mut sim: HashSet<String> = HashSet::new();
        let targets = vec!["news".to_string(), "sport".to_string()];

        let (command, expected) = add_command("SUBSCRIBE", &targets, &mut sim);

        assert_eq!(command.name(), "SUBSCRIBE");
        assert_eq!(expected, 2);
        assert_eq!(sim.len(), 2);
    }
}
