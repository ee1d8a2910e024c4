//! The session controller: owns the TCP connection, runs the
//! connect/authenticate/subscribe handshake, and demultiplexes inbound
//! replies, events, and background job results.
//!
//! One task owns the socket writer and the command FIFO (the session loop
//! inside [`connect`](EslClient::connect)); a second task owns the socket
//! reader and feeds framed packets to the loop over a bounded channel.
//! Event handlers run on their own transient tasks so a slow handler never
//! stalls the loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, trace};

use crate::config::ClientConfig;
use crate::constants::*;
use crate::error::{EslError, EslResult};
use crate::event::{EslEvent, EventName};
use crate::protocol::{Packet, PacketDecoder, RawPacket};

/// Callback registered for an event name. Each dispatch invokes the
/// handler on its own task; handlers needing async work spawn it
/// themselves.
pub type EventHandler = Arc<dyn Fn(Arc<EslEvent>) + Send + Sync>;

/// Capacity of the reader-to-loop handoff channel.
const INBOX_CAPACITY: usize = 1;

const JOB_ID_POOL: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";
const JOB_ID_LEN: usize = 32;

/// A connection to FreeSWITCH's event socket layer.
///
/// The client is a cheap clonable handle: run [`connect`](Self::connect) on
/// one clone (it blocks until disconnection) and issue commands or register
/// handlers from others. Commands submitted while the handshake is still in
/// progress, or during a brief disconnection, wait up to the configured
/// timeout for a session loop to accept them.
#[derive(Clone)]
pub struct EslClient {
    shared: Arc<Shared>,
}

struct Shared {
    config: ClientConfig,
    running: AtomicBool,
    outbox_tx: mpsc::Sender<Command>,
    errors_tx: mpsc::Sender<EslError>,
    /// Receiver ends of the outbox and error channels, owned by whichever
    /// `connect` call is live. Holding the lock for the whole session makes
    /// later `connect` attempts wait out the draining of the previous one.
    channels: Mutex<SessionChannels>,
    handlers: StdMutex<HashMap<EventName, Vec<EventHandler>>>,
    jobs: StdMutex<HashMap<String, oneshot::Sender<String>>>,
}

struct SessionChannels {
    outbox_rx: mpsc::Receiver<Command>,
    errors_rx: mpsc::Receiver<EslError>,
}

/// An in-flight command: argument words, a claim flag resolved exactly
/// once by [`claim`] (won by the session loop when it takes the command
/// for writing, or by the submitter when it gives up waiting), and a
/// single-slot response channel completed by the next matching packet (or
/// `None` on disconnect).
struct Command {
    args: Vec<String>,
    claimed: Arc<AtomicBool>,
    respond: oneshot::Sender<Option<Packet>>,
}

impl EslClient {
    /// New client with discovered configuration: defaults, merged with
    /// FreeSWITCH's own event socket configuration file when readable.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::discover())
    }

    /// New client with the given configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            config,
            running: AtomicBool::new(false),
            outbox_tx,
            errors_tx,
            channels: Mutex::new(SessionChannels {
                outbox_rx,
                errors_rx,
            }),
            handlers: StdMutex::new(HashMap::new()),
            jobs: StdMutex::new(HashMap::new()),
        });

        // Background job completions rendezvous with their callers through
        // the job table.
        let weak = Arc::downgrade(&shared);
        let bg_handler: EventHandler = Arc::new(move |event: Arc<EslEvent>| {
            if let Some(shared) = weak.upgrade() {
                shared.background_job_done(&event);
            }
        });
        locked(&shared.handlers).insert(EventName::plain(EVENT_BACKGROUND_JOB), vec![bg_handler]);

        Self { shared }
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// `true` between a successful dial and disconnection.
    pub fn is_connected(&self) -> bool {
        self.shared.is_running()
    }

    /// Connect to FreeSWITCH and block until disconnection. Run this in its
    /// own task, and call [`shutdown`](Self::shutdown) to make it return
    /// `Ok(())`; any other cause of disconnection is returned as the error
    /// that ended the session.
    pub async fn connect(&self) -> EslResult<()> {
        let shared = &self.shared;
        if !shared.set_running(true) {
            return Err(EslError::AlreadyConnected);
        }
        let mut channels = shared.channels.lock().await;
        let mut received_error = false;
        let mut exit = self.session(&mut channels, &mut received_error).await;

        // Whoever flipped the running flag owns the terminating cause. If
        // it wasn't this call and the loop never consumed the cause, it is
        // still in the error channel; a Shutdown found there wins.
        if !shared.set_running(false) && !received_error {
            if let Some(err) = channels.errors_rx.recv().await {
                if matches!(err, EslError::Shutdown) {
                    exit = EslError::Shutdown;
                }
            }
        }
        match exit {
            EslError::Shutdown => Ok(()),
            err => Err(err),
        }
    }

    /// Close the connection and make [`connect`](Self::connect) return
    /// `Ok(())`. Idempotent, non-blocking, safe to call from any task.
    pub fn shutdown(&self) {
        // No need to block here; another connection attempt will wait on
        // the session channel lock.
        self.shared.close(EslError::Shutdown);
    }

    /// Run an API command and return its response as a string.
    ///
    /// This is the blocking (synchronous) form; use
    /// [`query`](Self::query) to run a command asynchronously. Internally
    /// it sends `api`, or `bgapi` when
    /// [`prevent_socket_blocking`](ClientConfig::prevent_socket_blocking)
    /// is set; behaviour is the same either way.
    pub async fn execute(&self, app: &str, args: &[&str]) -> EslResult<String> {
        if self.shared.config.prevent_socket_blocking {
            let result = self.query(app, args).await?;
            return Ok(result.await.unwrap_or_default());
        }
        let mut words = Vec::with_capacity(args.len() + 2);
        words.push("api".to_string());
        words.push(app.to_string());
        words.extend(args.iter().map(|arg| arg.to_string()));
        let packet = self.submit(words).await?;
        Ok(packet.to_string())
    }

    /// Run an API command in the background. The returned channel receives
    /// the result body when the matching BACKGROUND_JOB event fires, or the
    /// empty string if the session disconnects first.
    pub async fn query(&self, app: &str, args: &[&str]) -> EslResult<oneshot::Receiver<String>> {
        let shared = &self.shared;
        let job_id = unique_id();
        let (result_tx, result_rx) = oneshot::channel();
        locked(&shared.jobs).insert(job_id.clone(), result_tx);

        let mut command = app.to_string();
        for arg in args {
            command.push(' ');
            command.push_str(arg);
        }
        command.push_str("\nJob-UUID: ");
        command.push_str(&job_id);

        let outcome = self.submit(vec!["bgapi".to_string(), command]).await;
        let confirmed = matches!(
            &outcome,
            Ok(Packet::Reply(reply))
                if reply.ok() && (reply.job_uuid() == job_id || reply.text().contains(&job_id))
        );
        if confirmed {
            return Ok(result_rx);
        }

        // The job was never started; retract its table entry.
        locked(&shared.jobs).remove(&job_id);
        match outcome {
            Err(err) => Err(err),
            Ok(Packet::Reply(reply)) => Err(EslError::CommandFailed {
                reply_text: reply.reply_text().to_string(),
            }),
            Ok(_) => Err(EslError::UnexpectedResponse),
        }
    }

    /// Handle the given event with the given handler. Can be called
    /// multiple times to register multiple handlers, which are invoked
    /// concurrently when the event fires. For CUSTOM events use
    /// [`on_custom`](Self::on_custom).
    pub async fn on(
        &self,
        name: &str,
        handler: impl Fn(Arc<EslEvent>) + Send + Sync + 'static,
    ) -> EslResult<()> {
        self.register(EventName::plain(name), Arc::new(handler))
            .await
    }

    /// Handle CUSTOM events with the given subclass. See [`on`](Self::on).
    pub async fn on_custom(
        &self,
        subclass: &str,
        handler: impl Fn(Arc<EslEvent>) + Send + Sync + 'static,
    ) -> EslResult<()> {
        self.register(EventName::custom(subclass), Arc::new(handler))
            .await
    }

    /// Inject an event into FreeSWITCH via `sendevent`. On success the
    /// server-assigned `Event-UUID` is copied back onto the event.
    pub async fn send_event(&self, event: &mut EslEvent) -> EslResult<()> {
        let name = event.name().name;
        let mut wire = event.clone();
        wire.remove(HEADER_EVENT_NAME);
        let packet = self
            .submit(vec!["sendevent".to_string(), format!("{name}\n{wire}")])
            .await?;
        match packet {
            Packet::Reply(reply) if reply.ok() => {
                event.set(HEADER_EVENT_UUID, reply.text());
                Ok(())
            }
            Packet::Reply(reply) => Err(EslError::CommandFailed {
                reply_text: reply.reply_text().to_string(),
            }),
            _ => Err(EslError::UnexpectedResponse),
        }
    }

    async fn register(&self, name: EventName, handler: EventHandler) -> EslResult<()> {
        let first = {
            let mut handlers = locked(&self.shared.handlers);
            let list = handlers.entry(name.clone()).or_default();
            let first = list.is_empty();
            list.push(handler);
            first
        };
        if !(first && self.shared.is_running()) {
            // Handlers registered before the first connect are batched into
            // the handshake's subscription step.
            return Ok(());
        }
        debug!(event = %name, "subscribing");
        match self
            .submit(subscription_command(std::slice::from_ref(&name)))
            .await?
        {
            Packet::Reply(reply) if reply.ok() => Ok(()),
            Packet::Reply(reply) => Err(EslError::CommandFailed {
                reply_text: reply.reply_text().to_string(),
            }),
            _ => Err(EslError::UnexpectedResponse),
        }
    }

    /// Hand a command to the session loop and wait for its response
    /// packet. The configured timeout covers acceptance only; once the
    /// command has been written there is no response deadline, and only
    /// disconnection releases the caller.
    async fn submit(&self, args: Vec<String>) -> EslResult<Packet> {
        let shared = &self.shared;
        if shared.config.fail_on_disconnect && !shared.is_running() {
            return Err(EslError::NotConnected);
        }
        let claimed = Arc::new(AtomicBool::new(false));
        let (respond, mut response) = oneshot::channel();
        let command = Command {
            args,
            claimed: Arc::clone(&claimed),
            respond,
        };
        let deadline = Instant::now() + shared.config.timeout;

        match timeout_at(deadline, shared.outbox_tx.send(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(EslError::NotConnected),
            Err(_) => return Err(EslError::Timeout),
        }
        match timeout_at(deadline, &mut response).await {
            Ok(Ok(Some(packet))) => Ok(packet),
            Ok(_) => Err(EslError::NotConnected),
            Err(_) => {
                if claim(&claimed) {
                    // Won the claim against the loop: the command is still
                    // queued and will never be written.
                    Err(EslError::Timeout)
                } else {
                    // The loop claimed the command first, so it has been
                    // written; wait out its response without a deadline.
                    // Only disconnection releases the caller.
                    match response.await {
                        Ok(Some(packet)) => Ok(packet),
                        _ => Err(EslError::NotConnected),
                    }
                }
            }
        }
    }

    /// One full session: dial, handshake, steady state, drain. Returns the
    /// error that ended it.
    async fn session(
        &self,
        channels: &mut SessionChannels,
        received_error: &mut bool,
    ) -> EslError {
        let shared = &self.shared;
        let config = &shared.config;
        if config.hostname.is_empty() {
            return EslError::BlankHostname;
        }

        debug!(host = %config.hostname, port = config.port, "dialing");
        let dial = TcpStream::connect((config.hostname.as_str(), config.port));
        let stream = match timeout_at(Instant::now() + config.timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return EslError::Io(err),
            Err(_) => return EslError::Timeout,
        };
        let (read_half, mut write_half) = stream.into_split();
        let (inbox_tx, mut inbox) = mpsc::channel(INBOX_CAPACITY);
        let reader = tokio::spawn(read_task(read_half, inbox_tx, Arc::clone(shared)));

        let mut fifo: VecDeque<oneshot::Sender<Option<Packet>>> = VecDeque::new();
        let exit = match self
            .handshake(channels, &mut inbox, &mut write_half, received_error)
            .await
        {
            Ok(()) => {
                self.main_loop(channels, &mut inbox, &mut write_half, &mut fifo, received_error)
                    .await
            }
            Err(err) => err,
        };

        // Unblock background jobs with empty results.
        {
            let mut jobs = locked(&shared.jobs);
            for (_, job) in jobs.drain() {
                let _ = job.send(String::new());
            }
        }

        // Tell callers waiting to submit commands that we're closed for
        // the day, or leave them queued for the next session.
        if config.fail_on_disconnect {
            while let Ok(command) = channels.outbox_rx.try_recv() {
                let _ = command.respond.send(None);
            }
        }

        // Cancel commands that were written but never answered.
        for respond in fifo.drain(..) {
            let _ = respond.send(None);
        }

        drop(write_half);
        reader.abort();
        let _ = reader.await;
        debug!(error = %exit, "session ended");
        exit
    }

    /// Wait for the auth request, authenticate, and issue the initial
    /// event subscription, all within a single shared timeout.
    async fn handshake(
        &self,
        channels: &mut SessionChannels,
        inbox: &mut mpsc::Receiver<RawPacket>,
        writer: &mut OwnedWriteHalf,
        received_error: &mut bool,
    ) -> EslResult<()> {
        let shared = &self.shared;
        let config = &shared.config;
        let deadline = Instant::now() + config.timeout;

        let greeting =
            next_handshake_packet(inbox, &mut channels.errors_rx, deadline, received_error)
                .await?;
        if greeting.content_type() != CONTENT_TYPE_AUTH_REQUEST {
            return Err(EslError::UnexpectedResponse);
        }

        debug!("authenticating");
        write_command(writer, &["auth".to_string(), config.password.clone()]).await?;
        let response =
            next_handshake_packet(inbox, &mut channels.errors_rx, deadline, received_error)
                .await?;
        match response.classify() {
            Packet::Reply(reply) if reply.ok() => {}
            _ => return Err(EslError::AuthenticationFailed),
        }

        // Listen for events with already-registered handlers.
        let names: Vec<EventName> = locked(&shared.handlers).keys().cloned().collect();
        if !names.is_empty() {
            debug!(subscriptions = names.len(), "subscribing to events");
            write_command(writer, &subscription_command(&names)).await?;
            let response =
                next_handshake_packet(inbox, &mut channels.errors_rx, deadline, received_error)
                    .await?;
            match response.classify() {
                Packet::Reply(reply) if reply.ok() => {}
                Packet::Reply(reply) => {
                    return Err(EslError::CommandFailed {
                        reply_text: reply.reply_text().to_string(),
                    })
                }
                _ => return Err(EslError::UnexpectedResponse),
            }
        }

        info!(host = %config.hostname, port = config.port, "connected to FreeSWITCH");
        Ok(())
    }

    /// Steady state: a three-way select over the error channel, inbound
    /// packets, and command submissions. Runs until an error breaks it.
    async fn main_loop(
        &self,
        channels: &mut SessionChannels,
        inbox: &mut mpsc::Receiver<RawPacket>,
        writer: &mut OwnedWriteHalf,
        fifo: &mut VecDeque<oneshot::Sender<Option<Packet>>>,
        received_error: &mut bool,
    ) -> EslError {
        loop {
            tokio::select! {
                err = channels.errors_rx.recv() => {
                    *received_error = true;
                    return err.unwrap_or(EslError::Disconnected);
                }
                packet = inbox.recv() => match packet {
                    Some(raw) => match raw.classify() {
                        Packet::Event(event) => self.dispatch_event(event),
                        Packet::Disconnect(notice) => {
                            debug!(notice = %notice, "host sent disconnect notice");
                            return EslError::Disconnected;
                        }
                        response => match fifo.pop_front() {
                            Some(respond) => {
                                let _ = respond.send(Some(response));
                            }
                            None => trace!("discarding unsolicited packet"),
                        },
                    },
                    None => {
                        // The reader pushes its error before dropping the
                        // inbox.
                        *received_error = true;
                        return channels
                            .errors_rx
                            .recv()
                            .await
                            .unwrap_or(EslError::Disconnected);
                    }
                },
                submission = channels.outbox_rx.recv() => {
                    let Some(command) = submission else {
                        return EslError::NotConnected;
                    };
                    if !claim(&command.claimed) {
                        // The submitter timed out and claimed the command
                        // back before we got here.
                        continue;
                    }
                    fifo.push_back(command.respond);
                    if let Err(err) = write_command(writer, &command.args).await {
                        return EslError::Io(err);
                    }
                }
            }
        }
    }

    /// Snapshot the handlers registered for this event's name and invoke
    /// each on its own task. Handlers are responsible for their own panics.
    fn dispatch_event(&self, event: EslEvent) {
        let key = event.name();
        let handlers: Vec<EventHandler> = locked(&self.shared.handlers)
            .get(&key)
            .cloned()
            .unwrap_or_default();
        trace!(event = %key, handlers = handlers.len(), "dispatching event");
        let event = Arc::new(event);
        for handler in handlers {
            let event = Arc::clone(&event);
            tokio::spawn(async move { handler(event) });
        }
    }
}

impl Default for EslClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn set_running(&self, running: bool) -> bool {
        self.running
            .compare_exchange(!running, running, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// First caller to observe the running→stopped transition owns the
    /// terminating cause; everyone else is a no-op.
    fn close(&self, err: EslError) {
        if self.set_running(false) {
            debug!(error = %err, "closing session");
            let _ = self.errors_tx.try_send(err);
        }
    }

    fn background_job_done(&self, event: &EslEvent) {
        let job_id = event.get(HEADER_JOB_UUID);
        if job_id.is_empty() {
            return;
        }
        let job = locked(&self.jobs).remove(job_id);
        if let Some(job) = job {
            trace!(job_id, "background job finished");
            let _ = job.send(event.body().to_string());
        }
    }
}

fn locked<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve a command's claim flag. Returns `true` for exactly one caller:
/// either the loop about to write the command, or the submitter cancelling
/// it on timeout. The loser must act on the winner's outcome.
fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

async fn write_command(writer: &mut OwnedWriteHalf, words: &[String]) -> std::io::Result<()> {
    let mut line = words.join(" ");
    trace!(command = %line, "writing command");
    line.push_str("\n\n");
    writer.write_all(line.as_bytes()).await
}

/// Wait for the next inbound packet during the handshake, also watching
/// the error channel and the shared handshake deadline.
async fn next_handshake_packet(
    inbox: &mut mpsc::Receiver<RawPacket>,
    errors: &mut mpsc::Receiver<EslError>,
    deadline: Instant,
    received_error: &mut bool,
) -> EslResult<RawPacket> {
    tokio::select! {
        packet = inbox.recv() => match packet {
            Some(packet) => Ok(packet),
            None => {
                // The reader pushes its error before dropping the inbox.
                *received_error = true;
                Err(errors.recv().await.unwrap_or(EslError::Disconnected))
            }
        },
        err = errors.recv() => {
            *received_error = true;
            Err(err.unwrap_or(EslError::Disconnected))
        }
        _ = sleep_until(deadline) => Err(EslError::Timeout),
    }
}

/// Read framed packets off the socket and pump them into the inbox until
/// the stream or the session ends.
async fn read_task(mut socket: OwnedReadHalf, inbox: mpsc::Sender<RawPacket>, shared: Arc<Shared>) {
    let mut decoder = PacketDecoder::new();
    let mut buf = vec![0u8; SOCKET_BUF_SIZE];
    let err = 'read: loop {
        loop {
            match decoder.next_packet() {
                Ok(Some(packet)) => {
                    if inbox.send(packet).await.is_err() {
                        return; // session loop is gone
                    }
                }
                Ok(None) => break,
                Err(err) => break 'read err,
            }
        }
        match socket.read(&mut buf).await {
            Ok(0) => break EslError::Disconnected,
            Ok(n) => {
                if let Err(err) = decoder.feed(&buf[..n]) {
                    break err;
                }
            }
            Err(err) => {
                break match err.kind() {
                    std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted => EslError::Disconnected,
                    _ => EslError::Io(err),
                }
            }
        }
    };
    debug!(error = %err, "reader stopped");
    shared.close(err);
}

/// 32 characters from `[A-Za-z0-9]`, used as Job-UUIDs for `bgapi`.
fn unique_id() -> String {
    let mut rng = rand::thread_rng();
    (0..JOB_ID_LEN)
        .map(|_| char::from(JOB_ID_POOL[rng.gen_range(0..JOB_ID_POOL.len())]))
        .collect()
}

/// Build an `events plain …` subscription command for the given names:
/// `all` when empty, otherwise plain names verbatim with `CUSTOM` and the
/// subclasses grouped at the end.
fn subscription_command(names: &[EventName]) -> Vec<String> {
    let mut command = vec!["events".to_string(), "plain".to_string()];
    if names.is_empty() {
        command.push("all".to_string());
        return command;
    }
    let mut subclasses = Vec::new();
    for name in names {
        if name.is_custom() {
            subclasses.push(name.subclass.clone());
        } else {
            command.push(name.name.clone());
        }
    }
    if !subclasses.is_empty() {
        command.push(EVENT_CUSTOM.to_string());
        command.append(&mut subclasses);
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_are_32_alphanumeric_chars() {
        let id = unique_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, unique_id());
    }

    #[test]
    fn subscription_for_no_names_is_all() {
        assert_eq!(subscription_command(&[]), ["events", "plain", "all"]);
    }

    #[test]
    fn subscription_groups_custom_subclasses_last() {
        let names = [
            EventName::plain("HEARTBEAT"),
            EventName::custom("sofia::register"),
            EventName::plain("CHANNEL_ANSWER"),
            EventName::custom("conference::maintenance"),
        ];
        assert_eq!(
            subscription_command(&names),
            [
                "events",
                "plain",
                "HEARTBEAT",
                "CHANNEL_ANSWER",
                "CUSTOM",
                "sofia::register",
                "conference::maintenance"
            ]
        );
    }

    #[test]
    fn commands_are_claimed_exactly_once() {
        let flag = Arc::new(AtomicBool::new(false));
        let winners: Vec<bool> = (0..4).map(|_| claim(&flag)).collect();
        assert_eq!(winners.iter().filter(|&&won| won).count(), 1);
        assert!(winners[0]);
    }

    #[test]
    fn new_client_listens_for_background_jobs() {
        let client = EslClient::with_config(ClientConfig::default());
        let handlers = locked(&client.shared.handlers);
        assert!(handlers.contains_key(&EventName::plain(EVENT_BACKGROUND_JOB)));
    }
}
