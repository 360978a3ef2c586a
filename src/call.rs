//! The call context: one room's orchestration loop.
//!
//! [`CallContext::run`] owns every piece of mutable call state and consumes
//! events from a single queue: inbound signaling messages, timer firings,
//! transport events and local user commands. Each event is handled to
//! completion before the next is dispatched, so no two transitions on the
//! same peer session ever interleave. User actions go through the cloneable
//! [`CallHandle`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{CallConfig, CallSettings};
use crate::error::{Error, Result};
use crate::presentation::{Presentation, StatusSeverity};
use crate::reconcile::PresenceReconciler;
use crate::registry::SessionRegistry;
use crate::session::{SessionState, TimerGuard};
use crate::signaling::{
    ChannelEvent, Envelope, FailedPeer, MediaFlags, SignalBody, SignalingChannel, UserName,
};
use crate::tiers::TierSelector;
use crate::transport::{
    ConnectivityState, IceCandidate, SessionDescription, Transport, TransportEvent,
};

/// Local user actions, posted to the call loop by [`CallHandle`].
#[derive(Debug)]
pub enum CallCommand {
    ToggleMic,
    ToggleCam,
    SetUserName(String),
    Hangup,
}

/// Timer firings and transport events, stamped with the session generation
/// that armed them so stale ones can be discarded.
enum LoopEvent {
    DeadlineElapsed {
        participant_id: String,
        epoch: u64,
    },
    RetryDue {
        participant_id: String,
        epoch: u64,
    },
    Transport {
        participant_id: String,
        epoch: u64,
        event: TransportEvent,
    },
}

/// Cloneable control surface for the local user.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<CallCommand>,
}

impl CallHandle {
    pub async fn toggle_mic(&self) -> Result<()> {
        self.send(CallCommand::ToggleMic).await
    }

    pub async fn toggle_cam(&self) -> Result<()> {
        self.send(CallCommand::ToggleCam).await
    }

    pub async fn set_user_name(&self, name: impl Into<String>) -> Result<()> {
        self.send(CallCommand::SetUserName(name.into())).await
    }

    pub async fn hangup(&self) -> Result<()> {
        self.send(CallCommand::Hangup).await
    }

    async fn send(&self, command: CallCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::InvalidState("call has ended".to_string()))
    }
}

/// One room's call orchestration.
pub struct CallContext {
    room_id: String,
    settings: CallSettings,
    tiers: TierSelector,
    transport: Arc<dyn Transport>,
    presentation: Arc<dyn Presentation>,
    registry: SessionRegistry,
    reconciler: PresenceReconciler,
    mic_on: bool,
    cam_on: bool,
    display_name: Option<String>,
    hanging_up: bool,
    relay_lost: bool,
    signal_tx: mpsc::Sender<Envelope>,
    signal_rx: Option<mpsc::Receiver<ChannelEvent>>,
    commands_rx: Option<mpsc::Receiver<CallCommand>>,
    internal_tx: mpsc::Sender<LoopEvent>,
    internal_rx: Option<mpsc::Receiver<LoopEvent>>,
}

impl CallContext {
    /// Build a context over an already-established signaling channel.
    pub fn with_channel(
        room_id: impl Into<String>,
        channel: SignalingChannel,
        tiers: TierSelector,
        settings: CallSettings,
        transport: Arc<dyn Transport>,
        presentation: Arc<dyn Presentation>,
    ) -> (Self, CallHandle) {
        let (signal_tx, signal_rx) = channel.split();
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (internal_tx, internal_rx) = mpsc::channel(64);
        let context = Self {
            room_id: room_id.into(),
            settings,
            tiers,
            transport,
            presentation,
            registry: SessionRegistry::new(),
            reconciler: PresenceReconciler::new(),
            mic_on: true,
            cam_on: true,
            display_name: None,
            hanging_up: false,
            relay_lost: false,
            signal_tx,
            signal_rx: Some(signal_rx),
            commands_rx: Some(commands_rx),
            internal_tx,
            internal_rx: Some(internal_rx),
        };
        (context, CallHandle { commands: commands_tx })
    }

    /// Connect the signaling channel for `room_id` and build the context.
    /// A channel that cannot be opened is fatal to call startup.
    pub async fn join(
        room_id: &str,
        config: &CallConfig,
        settings: CallSettings,
        transport: Arc<dyn Transport>,
        presentation: Arc<dyn Presentation>,
    ) -> Result<(Self, CallHandle)> {
        presentation.set_room_status("Connecting to the room...", StatusSeverity::Connecting);
        let channel =
            SignalingChannel::connect(&config.signaling_url, room_id, settings.connect_timeout)
                .await?;
        let tiers = TierSelector::new(config.resource_tiers());
        Ok(Self::with_channel(
            room_id,
            channel,
            tiers,
            settings,
            transport,
            presentation,
        ))
    }

    /// Drive the call until hangup. Consumes the context; all sessions are
    /// closed and the registry is cleared before returning.
    pub async fn run(mut self) -> Result<()> {
        let mut signal_rx = self
            .signal_rx
            .take()
            .ok_or_else(|| Error::InvalidState("call loop already started".to_string()))?;
        let mut commands_rx = self
            .commands_rx
            .take()
            .ok_or_else(|| Error::InvalidState("call loop already started".to_string()))?;
        let mut internal_rx = self
            .internal_rx
            .take()
            .ok_or_else(|| Error::InvalidState("call loop already started".to_string()))?;

        let mut signaling_open = true;
        let mut commands_open = true;
        info!(room = %self.room_id, "call loop started");
        self.update_room_status();

        loop {
            tokio::select! {
                event = signal_rx.recv(), if signaling_open => match event {
                    Some(ChannelEvent::Message(envelope)) => self.handle_signal(envelope).await,
                    Some(ChannelEvent::Closed { clean }) => self.handle_channel_closed(clean),
                    None => {
                        signaling_open = false;
                        self.handle_channel_closed(false);
                    }
                },
                command = commands_rx.recv(), if commands_open => match command {
                    Some(command) => {
                        self.handle_command(command).await;
                    }
                    None => commands_open = false,
                },
                event = internal_rx.recv() => match event {
                    Some(event) => self.handle_internal(event).await,
                    None => break,
                },
            }
            if self.hanging_up {
                break;
            }
        }

        self.teardown().await;
        Ok(())
    }

    // ---- inbound signaling -------------------------------------------------

    async fn handle_signal(&mut self, envelope: Envelope) {
        // The relay's count rides on whatever message it pushes; it wins
        // unconditionally.
        if let Some(count) = envelope.participants {
            self.reconciler.observe_count(count);
        }
        let peer_id = envelope.peer_id.clone();
        debug!(kind = envelope.body.kind(), peer = peer_id.as_deref().unwrap_or("-"), "signal");

        match envelope.body {
            SignalBody::Joined => {
                if let Some(id) = peer_id {
                    info!(room = %self.room_id, participant = %id, "joined room");
                    self.registry.set_local_participant(id);
                }
                self.update_room_status();
            }
            SignalBody::PeerJoined => {
                let Some(id) = peer_id else {
                    warn!("peer_joined without a peer id");
                    return;
                };
                self.handle_peer_joined(&id).await;
            }
            SignalBody::PeerLeft => {
                let Some(id) = peer_id else {
                    warn!("peer_left without a peer id");
                    return;
                };
                self.handle_peer_left(&id).await;
            }
            SignalBody::Offer(description) => {
                let Some(id) = peer_id else {
                    warn!("offer without a peer id");
                    return;
                };
                self.handle_offer(&id, description).await;
            }
            SignalBody::Answer(description) => {
                let Some(id) = peer_id else {
                    warn!("answer without a peer id");
                    return;
                };
                self.handle_answer(&id, description).await;
            }
            SignalBody::IceCandidate(candidate) => {
                let Some(id) = peer_id else {
                    warn!("ice_candidate without a peer id");
                    return;
                };
                self.handle_candidate(&id, candidate).await;
            }
            SignalBody::SetUserName(UserName { name })
            | SignalBody::UserNameSet(UserName { name }) => {
                let Some(id) = peer_id else {
                    return;
                };
                self.handle_name_update(&id, name);
            }
            SignalBody::UserMediaChanged(flags) => {
                let Some(id) = peer_id else {
                    return;
                };
                self.handle_media_update(&id, flags);
            }
            SignalBody::ConnectionQualityWarning(payload) => {
                // Advisory only; no correctness requirement on the reaction.
                warn!(
                    participant = peer_id.as_deref().unwrap_or("<room>"),
                    %payload,
                    "connection quality warning"
                );
            }
            SignalBody::ConnectionFailed(FailedPeer { peer_id: about }) => {
                // Another client gave up on its link; the relay owns the
                // resulting count correction.
                debug!(
                    reporter = peer_id.as_deref().unwrap_or("-"),
                    about = %about,
                    "peer reported a failed mesh link"
                );
            }
        }
    }

    async fn handle_peer_joined(&mut self, participant_id: &str) {
        if self.registry.is_local(participant_id) {
            return;
        }
        if self.registry.get(participant_id).is_some() {
            debug!(participant = %participant_id, "duplicate peer_joined ignored");
            self.update_room_status();
            return;
        }
        if self.registry.upsert(participant_id).is_none() {
            return;
        }
        info!(participant = %participant_id, "peer joined, initiating session");
        self.refresh_tile(participant_id);
        self.begin_attempt(participant_id).await;
        // A late joiner has never seen our name announcement.
        if let Some(name) = self.display_name.clone() {
            self.send_signal(Envelope::to_peer(
                SignalBody::SetUserName(UserName { name }),
                participant_id,
            ))
            .await;
        }
        self.update_room_status();
    }

    async fn handle_peer_left(&mut self, participant_id: &str) {
        if self.close_session(participant_id).await {
            info!(participant = %participant_id, "peer left");
            self.presentation.remove_participant(participant_id);
        } else {
            debug!(participant = %participant_id, "peer_left for unknown participant");
        }
        self.update_room_status();
    }

    async fn handle_offer(&mut self, participant_id: &str, description: SessionDescription) {
        if self.registry.is_local(participant_id) {
            warn!("dropping offer attributed to ourselves");
            return;
        }
        if self.registry.get(participant_id).is_none() {
            if self.registry.upsert(participant_id).is_none() {
                return;
            }
            info!(participant = %participant_id, "session created for inbound offer");
            self.refresh_tile(participant_id);
        }
        // Simultaneous-offer tie-break: accept the inbound offer on top of
        // a self-initiated attempt, reusing the live transport session
        // rather than opening a competing one.
        let has_transport = self
            .registry
            .get(participant_id)
            .map(|s| s.transport.is_some())
            .unwrap_or(false);
        if !has_transport && !self.open_transport(participant_id).await {
            return;
        }

        let applied = match self
            .registry
            .get(participant_id)
            .and_then(|s| s.transport.as_ref())
        {
            Some(transport) => transport.set_remote_description(description).await,
            None => return,
        };
        if let Err(err) = applied {
            warn!(participant = %participant_id, %err, "could not apply remote offer");
            self.fail_or_retry(participant_id, "remote offer rejected").await;
            return;
        }
        if !self.drain_candidates(participant_id).await {
            return;
        }

        let answer = match self
            .registry
            .get(participant_id)
            .and_then(|s| s.transport.as_ref())
        {
            Some(transport) => transport.create_answer().await,
            None => return,
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                warn!(participant = %participant_id, %err, "could not create answer");
                self.fail_or_retry(participant_id, "answer generation failed").await;
                return;
            }
        };
        let applied = match self
            .registry
            .get(participant_id)
            .and_then(|s| s.transport.as_ref())
        {
            Some(transport) => transport.set_local_description(answer.clone()).await,
            None => return,
        };
        if let Err(err) = applied {
            warn!(participant = %participant_id, %err, "could not apply local answer");
            self.fail_or_retry(participant_id, "local answer rejected").await;
            return;
        }

        if let Some(session) = self.registry.get_mut(participant_id) {
            session.set_state(SessionState::AnswerPending);
        }
        self.send_signal(Envelope::to_peer(SignalBody::Answer(answer), participant_id))
            .await;
        self.update_room_status();
    }

    async fn handle_answer(&mut self, participant_id: &str, description: SessionDescription) {
        match self.registry.get(participant_id) {
            None => {
                debug!(participant = %participant_id, "answer for unknown participant dropped");
                return;
            }
            Some(session) if session.state != SessionState::OfferPending => {
                debug!(
                    participant = %participant_id,
                    state = %session.state,
                    "unsolicited answer dropped"
                );
                return;
            }
            Some(_) => {}
        }
        let applied = match self
            .registry
            .get(participant_id)
            .and_then(|s| s.transport.as_ref())
        {
            Some(transport) => transport.set_remote_description(description).await,
            None => return,
        };
        if let Err(err) = applied {
            warn!(participant = %participant_id, %err, "could not apply answer");
            self.fail_or_retry(participant_id, "answer rejected").await;
            return;
        }
        if !self.drain_candidates(participant_id).await {
            return;
        }
        if let Some(session) = self.registry.get_mut(participant_id) {
            session.set_state(SessionState::AnswerPending);
        }
    }

    async fn handle_candidate(&mut self, participant_id: &str, candidate: IceCandidate) {
        let Some(session) = self.registry.get_mut(participant_id) else {
            debug!(participant = %participant_id, "candidate for unknown participant dropped");
            return;
        };
        if !session.remote_described {
            // Trickled candidates can outrun the description exchange; hold
            // them until the remote description lands.
            session.pending_candidates.push(candidate);
            return;
        }
        let applied = match self
            .registry
            .get(participant_id)
            .and_then(|s| s.transport.as_ref())
        {
            Some(transport) => transport.add_ice_candidate(candidate).await,
            None => return,
        };
        if let Err(err) = applied {
            warn!(participant = %participant_id, %err, "could not apply candidate");
            self.fail_or_retry(participant_id, "candidate rejected").await;
        }
    }

    fn handle_name_update(&mut self, participant_id: &str, name: String) {
        if self.registry.is_local(participant_id) {
            debug!("ignoring name echo for ourselves");
            return;
        }
        let Some(session) = self.registry.get_mut(participant_id) else {
            debug!(participant = %participant_id, "name for unknown participant dropped");
            return;
        };
        // A late-arriving name is a label update, never a reconnection.
        session.display_name = Some(name);
        self.refresh_tile(participant_id);
    }

    fn handle_media_update(&mut self, participant_id: &str, flags: MediaFlags) {
        if self.registry.is_local(participant_id) {
            debug!("ignoring media state echo for ourselves");
            return;
        }
        let Some(session) = self.registry.get_mut(participant_id) else {
            debug!(participant = %participant_id, "media state for unknown participant dropped");
            return;
        };
        session.mic_on = flags.mic_on;
        session.cam_on = flags.cam_on;
        self.presentation
            .update_media_status(participant_id, flags.mic_on, flags.cam_on);
    }

    fn handle_channel_closed(&mut self, clean: bool) {
        if self.hanging_up {
            return;
        }
        if clean {
            info!("signaling relay closed the connection");
            return;
        }
        if !self.relay_lost {
            self.relay_lost = true;
            warn!("lost connection to the signaling relay");
            self.presentation
                .set_room_status("Lost connection to the server", StatusSeverity::Error);
        }
    }

    // ---- timers and transport events --------------------------------------

    async fn handle_internal(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::DeadlineElapsed {
                participant_id,
                epoch,
            } => {
                if !self.epoch_is_current(&participant_id, epoch) {
                    return;
                }
                let pending = self
                    .registry
                    .get(&participant_id)
                    .map(|s| {
                        matches!(
                            s.state,
                            SessionState::OfferPending | SessionState::AnswerPending
                        )
                    })
                    .unwrap_or(false);
                if pending {
                    warn!(participant = %participant_id, "connection deadline elapsed");
                    self.fail_or_retry(&participant_id, "connection deadline elapsed")
                        .await;
                }
            }
            LoopEvent::RetryDue {
                participant_id,
                epoch,
            } => {
                if !self.epoch_is_current(&participant_id, epoch) {
                    return;
                }
                let due = self
                    .registry
                    .get(&participant_id)
                    .map(|s| s.state == SessionState::RetryScheduled)
                    .unwrap_or(false);
                if !due {
                    return;
                }
                if let Some(session) = self.registry.get_mut(&participant_id) {
                    session.retry_count += 1;
                    session.retry_timer = None;
                    info!(
                        participant = %participant_id,
                        retry = session.retry_count,
                        "retrying connection"
                    );
                }
                self.begin_attempt(&participant_id).await;
            }
            LoopEvent::Transport {
                participant_id,
                epoch,
                event,
            } => {
                if !self.epoch_is_current(&participant_id, epoch) {
                    return;
                }
                self.handle_transport_event(&participant_id, event).await;
            }
        }
    }

    async fn handle_transport_event(&mut self, participant_id: &str, event: TransportEvent) {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.send_signal(Envelope::to_peer(
                    SignalBody::IceCandidate(candidate),
                    participant_id,
                ))
                .await;
            }
            TransportEvent::RemoteMediaAvailable(stream) => {
                if let Some(session) = self.registry.get_mut(participant_id) {
                    session.remote_stream = Some(stream);
                }
                // First inbound media counts as connectivity.
                self.mark_connected(participant_id);
                self.refresh_tile(participant_id);
            }
            TransportEvent::ConnectivityChanged(state) => match state {
                ConnectivityState::Connected => {
                    self.mark_connected(participant_id);
                    self.refresh_tile(participant_id);
                }
                ConnectivityState::Failed | ConnectivityState::Disconnected => {
                    warn!(participant = %participant_id, %state, "transport connectivity lost");
                    self.fail_or_retry(participant_id, "transport connectivity lost")
                        .await;
                }
                ConnectivityState::New
                | ConnectivityState::Connecting
                | ConnectivityState::Closed => {
                    debug!(participant = %participant_id, %state, "transport state");
                }
            },
        }
    }

    fn mark_connected(&mut self, participant_id: &str) {
        let Some(session) = self.registry.get_mut(participant_id) else {
            return;
        };
        if !matches!(
            session.state,
            SessionState::OfferPending | SessionState::AnswerPending
        ) {
            return;
        }
        session.set_state(SessionState::Connected);
        session.deadline_timer = None;
        info!(
            participant = %session.participant_id,
            tier = session.resource_tier,
            retries = session.retry_count,
            "peer connected"
        );
        self.update_room_status();
    }

    // ---- connection attempts ----------------------------------------------

    /// Open a fresh transport session at the tier for the session's current
    /// retry count, arm the connection deadline and bridge its events into
    /// the loop. Failure is routed into the bounded retry path.
    async fn open_transport(&mut self, participant_id: &str) -> bool {
        let (epoch, retry_count) = {
            let Some(session) = self.registry.get_mut(participant_id) else {
                return false;
            };
            session.cancel_timers();
            // candidates trickled for a previous attempt must not leak into
            // this one
            session.pending_candidates.clear();
            session.remote_described = false;
            (session.bump_epoch(), session.retry_count)
        };
        let tier = self.tiers.tier_index(retry_count);
        let resources = self.tiers.select(retry_count).clone();
        debug!(participant = %participant_id, tier, "opening transport session");

        let (event_tx, event_rx) = mpsc::channel(32);
        let created = self.transport.create_session(&resources, event_tx).await;
        let handle = match created {
            Ok(handle) => handle,
            Err(err) => {
                warn!(participant = %participant_id, %err, "transport session setup failed");
                self.fail_or_retry(participant_id, "transport session setup failed")
                    .await;
                return false;
            }
        };
        handle.set_media_enabled(self.mic_on, self.cam_on);

        self.spawn_transport_forwarder(participant_id.to_string(), epoch, event_rx);
        let deadline = self.arm_deadline(participant_id.to_string(), epoch);

        let Some(session) = self.registry.get_mut(participant_id) else {
            return false;
        };
        session.resource_tier = tier;
        session.transport = Some(handle);
        session.deadline_timer = Some(deadline);
        true
    }

    /// Initiate towards a peer: open a transport session, generate and send
    /// an offer.
    async fn begin_attempt(&mut self, participant_id: &str) {
        if !self.open_transport(participant_id).await {
            return;
        }
        let offer = match self
            .registry
            .get(participant_id)
            .and_then(|s| s.transport.as_ref())
        {
            Some(transport) => transport.create_offer().await,
            None => return,
        };
        let offer = match offer {
            Ok(offer) => offer,
            Err(err) => {
                warn!(participant = %participant_id, %err, "could not create offer");
                self.fail_or_retry(participant_id, "offer generation failed")
                    .await;
                return;
            }
        };
        let applied = match self
            .registry
            .get(participant_id)
            .and_then(|s| s.transport.as_ref())
        {
            Some(transport) => transport.set_local_description(offer.clone()).await,
            None => return,
        };
        if let Err(err) = applied {
            warn!(participant = %participant_id, %err, "could not apply local offer");
            self.fail_or_retry(participant_id, "local offer rejected")
                .await;
            return;
        }
        if let Some(session) = self.registry.get_mut(participant_id) {
            session.set_state(SessionState::OfferPending);
        }
        self.send_signal(Envelope::to_peer(SignalBody::Offer(offer), participant_id))
            .await;
    }

    /// Apply buffered candidates after a remote description landed. Returns
    /// false when a rejected candidate sent the session into retry.
    async fn drain_candidates(&mut self, participant_id: &str) -> bool {
        let pending = {
            let Some(session) = self.registry.get_mut(participant_id) else {
                return false;
            };
            session.remote_described = true;
            std::mem::take(&mut session.pending_candidates)
        };
        for candidate in pending {
            let applied = match self
                .registry
                .get(participant_id)
                .and_then(|s| s.transport.as_ref())
            {
                Some(transport) => transport.add_ice_candidate(candidate).await,
                None => return false,
            };
            if let Err(err) = applied {
                warn!(participant = %participant_id, %err, "buffered candidate rejected");
                self.fail_or_retry(participant_id, "candidate rejected").await;
                return false;
            }
        }
        true
    }

    // ---- failure, retry, teardown -----------------------------------------

    /// Bounded-retry fork: schedule the next attempt at the next resource
    /// tier, or give the peer up when the retry budget is spent.
    async fn fail_or_retry(&mut self, participant_id: &str, reason: &str) {
        let verdict = {
            let Some(session) = self.registry.get(participant_id) else {
                return;
            };
            if session.state.is_terminal() || session.state == SessionState::RetryScheduled {
                return;
            }
            session.retry_count >= self.settings.max_retries
        };
        if verdict {
            self.fail_session(participant_id, reason).await;
        } else {
            self.schedule_retry(participant_id, reason).await;
        }
    }

    async fn schedule_retry(&mut self, participant_id: &str, reason: &str) {
        let (epoch, transport) = {
            let Some(session) = self.registry.get_mut(participant_id) else {
                return;
            };
            session.cancel_timers();
            let epoch = session.bump_epoch();
            session.set_state(SessionState::RetryScheduled);
            (epoch, session.take_transport())
        };
        if let Some(transport) = transport {
            let _ = transport.close().await;
        }
        let retry = {
            let delay = self.settings.retry_delay;
            let events = self.internal_tx.clone();
            let participant = participant_id.to_string();
            TimerGuard::spawn(async move {
                sleep(delay).await;
                let _ = events
                    .send(LoopEvent::RetryDue {
                        participant_id: participant,
                        epoch,
                    })
                    .await;
            })
        };
        if let Some(session) = self.registry.get_mut(participant_id) {
            warn!(
                participant = %participant_id,
                retry_count = session.retry_count,
                %reason,
                "attempt failed, retry scheduled"
            );
            session.retry_timer = Some(retry);
        }
    }

    /// Retry budget spent: notify the relay so the authoritative count can
    /// self-correct, drop the tile and remove the session.
    async fn fail_session(&mut self, participant_id: &str, reason: &str) {
        {
            let Some(session) = self.registry.get_mut(participant_id) else {
                return;
            };
            session.set_state(SessionState::Failed);
        }
        warn!(
            participant = %participant_id,
            %reason,
            "giving up on peer after exhausting retries"
        );
        self.send_signal(Envelope::broadcast(SignalBody::ConnectionFailed(
            FailedPeer {
                peer_id: participant_id.to_string(),
            },
        )))
        .await;
        if let Some(mut session) = self.registry.remove(participant_id) {
            if let Some(transport) = session.take_transport() {
                let _ = transport.close().await;
            }
        }
        self.presentation.remove_participant(participant_id);
        self.update_room_status();
    }

    /// Close and remove a session. Idempotent: returns false when no
    /// session existed.
    async fn close_session(&mut self, participant_id: &str) -> bool {
        let Some(mut session) = self.registry.remove(participant_id) else {
            return false;
        };
        session.set_state(SessionState::Closed);
        if let Some(transport) = session.take_transport() {
            let _ = transport.close().await;
        }
        true
    }

    async fn teardown(&mut self) {
        for mut session in self.registry.drain() {
            session.set_state(SessionState::Closed);
            if let Some(transport) = session.take_transport() {
                let _ = transport.close().await;
            }
            self.presentation.remove_participant(&session.participant_id);
        }
        info!(room = %self.room_id, "left room");
    }

    // ---- local user commands ----------------------------------------------

    async fn handle_command(&mut self, command: CallCommand) {
        match command {
            CallCommand::ToggleMic => {
                self.mic_on = !self.mic_on;
                info!(mic_on = self.mic_on, "toggled microphone");
                self.apply_local_media();
                self.broadcast_media_state().await;
            }
            CallCommand::ToggleCam => {
                self.cam_on = !self.cam_on;
                info!(cam_on = self.cam_on, "toggled camera");
                self.apply_local_media();
                self.broadcast_media_state().await;
            }
            CallCommand::SetUserName(name) => {
                self.display_name = Some(name.clone());
                self.send_signal(Envelope::broadcast(SignalBody::SetUserName(UserName {
                    name,
                })))
                .await;
            }
            CallCommand::Hangup => {
                info!(room = %self.room_id, "hanging up");
                self.hanging_up = true;
            }
        }
    }

    fn apply_local_media(&self) {
        for session in self.registry.iter() {
            if let Some(transport) = session.transport.as_ref() {
                transport.set_media_enabled(self.mic_on, self.cam_on);
            }
        }
    }

    async fn broadcast_media_state(&self) {
        self.send_signal(Envelope::broadcast(SignalBody::UserMediaChanged(
            MediaFlags {
                mic_on: self.mic_on,
                cam_on: self.cam_on,
            },
        )))
        .await;
    }

    // ---- helpers -----------------------------------------------------------

    fn epoch_is_current(&self, participant_id: &str, epoch: u64) -> bool {
        match self.registry.get(participant_id) {
            Some(session) if session.epoch == epoch => true,
            Some(session) => {
                debug!(
                    participant = %participant_id,
                    stale = epoch,
                    current = session.epoch,
                    "discarding event from a previous attempt"
                );
                false
            }
            None => false,
        }
    }

    fn arm_deadline(&self, participant_id: String, epoch: u64) -> TimerGuard {
        let deadline = self.settings.connection_deadline;
        let events = self.internal_tx.clone();
        TimerGuard::spawn(async move {
            sleep(deadline).await;
            let _ = events
                .send(LoopEvent::DeadlineElapsed {
                    participant_id,
                    epoch,
                })
                .await;
        })
    }

    fn spawn_transport_forwarder(
        &self,
        participant_id: String,
        epoch: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let queue = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let forwarded = queue
                    .send(LoopEvent::Transport {
                        participant_id: participant_id.clone(),
                        epoch,
                        event,
                    })
                    .await;
                if forwarded.is_err() {
                    break;
                }
            }
        });
    }

    async fn send_signal(&self, envelope: Envelope) {
        if self.signal_tx.send(envelope).await.is_err() && !self.hanging_up {
            warn!("signaling channel is closed, dropping outbound message");
        }
    }

    fn refresh_tile(&self, participant_id: &str) {
        let Some(session) = self.registry.get(participant_id) else {
            return;
        };
        match (&session.state, &session.remote_stream) {
            (SessionState::Connected, Some(stream)) => {
                self.presentation
                    .show_connected(participant_id, session.label(), stream);
            }
            _ => {
                self.presentation
                    .show_connecting(participant_id, session.label());
            }
        }
    }

    fn update_room_status(&mut self) {
        let connected = self.registry.connected_count();
        let pending = self.registry.pending_count();
        let (text, severity) = self.reconciler.room_status(connected, pending);
        self.presentation.set_room_status(&text, severity);
    }
}
