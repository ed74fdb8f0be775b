//! Connection controller actor.
//!
//! The controller owns a [`SessionMachine`] inside a single tokio task.
//! Caller requests and asynchronous results both arrive over channels and are
//! applied one at a time, so the session never sees two transitions
//! interleave. Observers get a `watch` of the latest [`SessionSnapshot`] and a
//! `broadcast` of [`ConnectUpdate`] notifications.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::auth::{AuthenticationCompleter, SignInError, SignInOptions};
use crate::config::ConnectTimings;
use crate::errors::ConnectError;
use crate::machine::{ConnectUpdate, Effect, Event, SessionMachine};
use crate::session::SessionSnapshot;
use crate::signer::SignerConnectionService;
use crate::timers::{TaskGuard, TimerSet};
use crate::types::{AuthStage, Stage};

const REQUEST_QUEUE: usize = 32;
const UPDATE_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<T>;

enum Request {
    StartInteractive(Reply<Result<(), ConnectError>>),
    SubmitBunker(String, Reply<Result<(), ConnectError>>),
    RetryAfterApproval(Reply<Result<(), ConnectError>>),
    RetryFromError(Reply<Result<(), ConnectError>>),
    Cancel(Reply<()>),
}

/// Actor driving one connection session.
pub struct ConnectionController<S, A>
where
    S: SignerConnectionService + 'static,
    A: AuthenticationCompleter + 'static,
{
    machine: SessionMachine,
    signer: Arc<S>,
    completer: Arc<A>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    requests: mpsc::Receiver<Request>,
    timers: TimerSet,
    /// The one outstanding service or completer call
    in_flight: Option<TaskGuard>,
    updates: broadcast::Sender<ConnectUpdate>,
    snapshot: watch::Sender<SessionSnapshot>,
}

impl<S, A> ConnectionController<S, A>
where
    S: SignerConnectionService + 'static,
    A: AuthenticationCompleter + 'static,
{
    /// Validate `config`, start the actor and return a handle to it.
    ///
    /// Must be called from within a tokio runtime. The actor stops once
    /// every [`ConnectionHandle`] has been dropped.
    pub fn spawn(
        connection_uri: impl Into<String>,
        config: ConnectTimings,
        signer: Arc<S>,
        completer: Arc<A>,
    ) -> Result<ConnectionHandle, ConnectError> {
        config.validate()?;

        let machine = SessionMachine::new(connection_uri, config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let (snapshot, snapshot_rx) = watch::channel(machine.snapshot());

        let handle = ConnectionHandle {
            requests: requests_tx,
            updates: updates.clone(),
            snapshot: snapshot_rx,
        };

        let controller = Self {
            machine,
            signer,
            completer,
            events_tx,
            events_rx,
            requests,
            timers: TimerSet::new(),
            in_flight: None,
            updates,
            snapshot,
        };
        tokio::spawn(controller.run());

        Ok(handle)
    }

    async fn run(mut self) {
        debug!("connection controller started");
        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => {
                    let effects = self.machine.handle(event);
                    self.apply(effects).await;
                }
            }
        }

        self.timers.disarm_all();
        self.in_flight = None;
        debug!("connection controller stopped");
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::StartInteractive(reply) => {
                let result = self.machine.start_interactive();
                self.finish(result, reply).await;
            }
            Request::SubmitBunker(raw, reply) => {
                let result = self.machine.submit_bunker_url(&raw);
                self.finish(result, reply).await;
            }
            Request::RetryAfterApproval(reply) => {
                let result = self.machine.retry_after_approval();
                self.finish(result, reply).await;
            }
            Request::RetryFromError(reply) => {
                let connected = self.signer.is_connected();
                let result = self.machine.retry_from_error(connected);
                self.finish(result, reply).await;
            }
            Request::Cancel(reply) => {
                let effects = self.machine.cancel();
                self.apply(effects).await;
                let _ = reply.send(());
            }
        }
    }

    async fn finish(
        &mut self,
        result: Result<Vec<Effect>, ConnectError>,
        reply: Reply<Result<(), ConnectError>>,
    ) {
        let outcome = match result {
            Ok(effects) => {
                self.apply(effects).await;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, stage = %self.machine.stage(), "request rejected");
                Err(e)
            }
        };
        let _ = reply.send(outcome);
    }

    /// Execute effects in order. The machine has already settled, so the
    /// snapshot is published first.
    async fn apply(&mut self, effects: Vec<Effect>) {
        self.snapshot.send_replace(self.machine.snapshot());

        for effect in effects {
            match effect {
                Effect::WaitForSigner { op, connection_uri } => {
                    let signer = Arc::clone(&self.signer);
                    let events = self.events_tx.clone();
                    self.in_flight = Some(TaskGuard::spawn(async move {
                        let result = signer.wait_for_connection(&connection_uri).await;
                        let _ = events.send(Event::SignerWaitResolved { op, result });
                    }));
                }
                Effect::ConnectBunker {
                    op,
                    bunker_url,
                    attempts,
                    force_new_secret,
                } => {
                    let signer = Arc::clone(&self.signer);
                    let events = self.events_tx.clone();
                    let approvals = self.events_tx.clone();
                    let on_approval_url = Arc::new(move |url: String| {
                        let _ = approvals.send(Event::ApprovalUrlReceived { op, url });
                    });
                    self.in_flight = Some(TaskGuard::spawn(async move {
                        let outcome = signer
                            .connect_with_bunker_url(
                                &bunker_url,
                                attempts,
                                force_new_secret,
                                on_approval_url,
                            )
                            .await;
                        let _ = events.send(Event::BunkerOutcomeResolved { op, outcome });
                    }));
                }
                Effect::CompleteSignIn {
                    op,
                    public_key,
                    timeout,
                } => {
                    let completer = Arc::clone(&self.completer);
                    let events = self.events_tx.clone();
                    let progress = self.events_tx.clone();
                    let options = SignInOptions {
                        timeout,
                        on_progress: Arc::new(move |stage: AuthStage| {
                            let _ = progress.send(Event::AuthProgress { op, stage });
                        }),
                    };
                    self.in_flight = Some(TaskGuard::spawn(async move {
                        let result = match tokio::time::timeout(
                            timeout,
                            completer.complete_sign_in(public_key, options),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(SignInError::Timeout(timeout)),
                        };
                        let _ = events.send(Event::AuthResolved { op, result });
                    }));
                }
                Effect::ArmTimer { token, after } => {
                    self.timers.arm(token, after, self.events_tx.clone());
                }
                Effect::DisarmTimer(kind) => self.timers.disarm(kind),
                Effect::AbortCall => {
                    if self.in_flight.take().is_some() {
                        debug!("aborted outstanding call");
                    }
                }
                Effect::Disconnect => {
                    info!("disconnecting signer transport");
                    self.signer.disconnect().await;
                }
                Effect::Publish(update) => {
                    // No subscribers is fine.
                    let _ = self.updates.send(update);
                }
            }
        }
    }
}

/// Cloneable handle to a running [`ConnectionController`].
#[derive(Clone)]
pub struct ConnectionHandle {
    requests: mpsc::Sender<Request>,
    updates: broadcast::Sender<ConnectUpdate>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl ConnectionHandle {
    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T, ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .await
            .map_err(|_| ConnectError::ControllerClosed)?;
        rx.await.map_err(|_| ConnectError::ControllerClosed)
    }

    /// `idle -> waitingForSigner` on the advertised connection URI.
    pub async fn start_interactive_connection(&self) -> Result<(), ConnectError> {
        self.call(Request::StartInteractive).await?
    }

    /// Connect with a bunker URL pasted by the user.
    pub async fn submit_bunker_url(&self, bunker_url: impl Into<String>) -> Result<(), ConnectError> {
        let bunker_url = bunker_url.into();
        self.call(|reply| Request::SubmitBunker(bunker_url, reply)).await?
    }

    /// Retry the same bunker URL after out-of-band approval.
    pub async fn retry_after_approval(&self) -> Result<(), ConnectError> {
        self.call(Request::RetryAfterApproval).await?
    }

    /// Recover from the `error` stage.
    pub async fn retry_from_error(&self) -> Result<(), ConnectError> {
        self.call(Request::RetryFromError).await?
    }

    /// Abandon the session and return to `idle`. Safe from any stage.
    pub async fn cancel(&self) {
        if self.call(Request::Cancel).await.is_err() {
            debug!("cancel on a stopped controller");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectUpdate> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the session reaches `stage`.
    pub async fn wait_for_stage(&self, stage: Stage) -> Result<SessionSnapshot, ConnectError> {
        self.wait_until(|s| s.stage == stage).await
    }

    /// Wait until `predicate` holds for the current snapshot.
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, ConnectError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| ConnectError::ControllerClosed)?;
        Ok(snapshot.clone())
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("stage", &self.snapshot.borrow().stage)
            .finish_non_exhaustive()
    }
}
