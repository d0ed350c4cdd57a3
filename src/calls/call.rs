//! One call: participants, sessions, keys and the relay connection.

use log::{debug, error, info, warn};
use serde::Serialize;
use sfucore::crypto::{KeySource, MediaKey, generate_send_key, xor_with_call_key};
use sfucore::protocol::{OutgoingCommand, PeerInfo, SendIvs, dispatch};
use sfucore::sdp::Sdp;
use sfucore::types::{
    AvFlags, CallId, ChatId, Cid, Direction, KeyId, SpeakerState, TermCode, TrackDescriptor,
    TrackKind, UserId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::CallError;
use super::initiator::SessionInitiator;
use super::keys::MediaKeyCrypto;
use super::media::MediaEngine;
use super::observer::CallObserver;
use super::session::{Peer, Session, SessionInfo, SlotRole};
use super::slot::{LocalSlots, SlotManager};
use super::state::CallState;
use crate::relay::{RelayConfig, RelayConnector, RelayError, RelayEvent, RelayEventKind, RelaySink, RelayState};

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Offer track that gets three simulcast layers. Send tracks are created
    /// in the order low resolution video, high resolution video, audio.
    pub simulcast_track_index: usize,
    /// Media keys kept per sender for late frames.
    pub max_retained_keys: usize,
    pub recv_video_slots: usize,
    pub recv_audio_slots: usize,
    /// Low resolution streams to ask for in `JOIN`.
    pub vthumbs_on_join: Option<u32>,
    pub relay: RelayConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            simulcast_track_index: 1,
            max_retained_keys: 16,
            recv_video_slots: 8,
            recv_audio_slots: 4,
            vthumbs_on_join: None,
            relay: RelayConfig::default(),
        }
    }
}

/// Collaborators of a call.
#[derive(Clone)]
pub struct CallDeps {
    pub initiator: Arc<dyn SessionInitiator>,
    pub connector: Arc<dyn RelayConnector>,
    pub engine: Arc<dyn MediaEngine>,
    pub keys: Arc<MediaKeyCrypto>,
    pub observer: Arc<dyn CallObserver>,
}

/// Read-only view of a [`Call`].
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub chat_id: ChatId,
    pub state: CallState,
    pub my_cid: Option<Cid>,
    pub local_av: AvFlags,
    pub speaker_state: SpeakerState,
    pub is_moderator: bool,
    pub participants: Vec<UserId>,
    pub sessions: Vec<SessionInfo>,
    pub key_id: Option<KeyId>,
}

pub struct Call {
    pub(super) call_id: CallId,
    pub(super) chat_id: ChatId,
    pub(super) my_user: UserId,
    pub(super) config: CallConfig,
    pub(super) deps: CallDeps,
    pub(super) state: CallState,
    pub(super) participants: BTreeSet<UserId>,
    pub(super) sessions: BTreeMap<Cid, Session>,
    /// Our own participant record. The cid is assigned by `ANSWER`.
    pub(super) my_peer: Peer,
    pub(super) local_av: AvFlags,
    pub(super) speaker_state: SpeakerState,
    pub(super) is_moderator: bool,
    pub(super) moderators: BTreeSet<UserId>,
    pub(super) call_key: Option<MediaKey>,
    /// Last generated send key before it was combined with the call key.
    pub(super) send_key: Option<(KeyId, MediaKey)>,
    pub(super) relay: Option<Arc<dyn RelaySink>>,
    pub(super) relay_events: mpsc::Sender<RelayEvent>,
    pub(super) slots: Option<SlotManager>,
    pub(super) offer: Option<(Sdp, SendIvs)>,
    pub(super) send_vthumb: bool,
    pub(super) send_hires: bool,
    pub(super) started_at: Option<u64>,
    pub(super) cancel: CancellationToken,
}

impl Call {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat_id: ChatId,
        call_id: CallId,
        my_user: UserId,
        call_key: Option<MediaKey>,
        config: CallConfig,
        deps: CallDeps,
        relay_events: mpsc::Sender<RelayEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let my_peer = Peer::new(0, my_user.clone(), AvFlags::EMPTY, config.max_retained_keys);
        Self {
            call_id,
            chat_id,
            my_user,
            config,
            deps,
            state: CallState::Initial,
            participants: BTreeSet::new(),
            sessions: BTreeMap::new(),
            my_peer,
            local_av: AvFlags::EMPTY,
            speaker_state: SpeakerState::None,
            is_moderator: false,
            moderators: BTreeSet::new(),
            call_key,
            send_key: None,
            relay: None,
            relay_events,
            slots: None,
            offer: None,
            send_vthumb: false,
            send_hires: false,
            started_at: None,
            cancel,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn session(&self, cid: Cid) -> Option<&Session> {
        self.sessions.get(&cid)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.call_id.clone(),
            chat_id: self.chat_id.clone(),
            state: self.state,
            my_cid: (self.state == CallState::InProgress).then_some(self.my_peer.cid),
            local_av: self.local_av,
            speaker_state: self.speaker_state,
            is_moderator: self.is_moderator,
            participants: self.participants.iter().cloned().collect(),
            sessions: self.sessions.values().map(Session::info).collect(),
            key_id: self.my_peer.keys.current_id(),
        }
    }

    pub(super) fn set_state(&mut self, next: CallState) -> Result<(), CallError> {
        let previous = self.state;
        self.state.transition(next)?;
        info!(target: "Call", "[{}] {previous:?} -> {next:?}", self.call_id);
        self.deps.observer.on_state_changed(&self.call_id, next);
        Ok(())
    }

    fn require(&self, op: &'static str, state: CallState) -> Result<(), CallError> {
        if self.state != state {
            return Err(CallError::StateViolation {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    fn require_moderator(&self) -> Result<(), CallError> {
        if !self.is_moderator {
            return Err(CallError::AccessDenied("moderator rights required"));
        }
        Ok(())
    }

    fn ensure_alive(&self) -> Result<(), CallError> {
        if self.cancel.is_cancelled() {
            return Err(CallError::Closed);
        }
        Ok(())
    }

    /// Our cid is only meaningful once `ANSWER` has assigned it.
    pub(super) fn is_me(&self, cid: Cid) -> bool {
        matches!(self.state, CallState::Joining | CallState::InProgress) && cid == self.my_peer.cid
    }

    pub(super) async fn send(&self, cmd: OutgoingCommand) -> Result<(), CallError> {
        let relay = self
            .relay
            .as_ref()
            .ok_or(CallError::Connection(RelayError::NotConnected))?;
        relay.send(cmd).await?;
        Ok(())
    }

    pub(super) fn report(&self, err: &CallError) {
        warn!(target: "Call", "[{}] {err}", self.call_id);
        self.deps.observer.on_error(&self.call_id, err);
    }

    // Joining and leaving

    /// Starts joining: fetches the relay url and opens the relay connection.
    /// The offer goes out once the socket is up.
    pub async fn join(&mut self, av: AvFlags) -> Result<(), CallError> {
        if !self.state.can_join() {
            return Err(CallError::StateViolation {
                op: "join",
                state: self.state,
            });
        }
        self.local_av = av;
        self.set_state(CallState::Connecting)?;

        let url = tokio::select! {
            r = self.deps.initiator.relay_url(&self.chat_id, &self.call_id) => r,
            _ = self.cancel.cancelled() => return Err(CallError::Closed),
        };
        let url = match url {
            Ok(url) => url,
            Err(e) => {
                self.leave(TermCode::SignalingFailure).await;
                return Err(CallError::Initiator(e.to_string()));
            }
        };

        let relay = match self
            .deps
            .connector
            .connect(&url, self.relay_events.clone())
            .await
        {
            Ok(relay) => relay,
            Err(e) => {
                self.leave(TermCode::SignalingFailure).await;
                return Err(e.into());
            }
        };
        info!(
            target: "Call",
            "[{}] relay connection {} to {url}",
            self.call_id,
            relay.connection_id()
        );
        self.relay = Some(relay);
        Ok(())
    }

    pub async fn hangup(&mut self) -> Result<(), CallError> {
        if !self.state.is_participating() {
            return Err(CallError::StateViolation {
                op: "hangup",
                state: self.state,
            });
        }
        self.leave(TermCode::UserHangup).await;
        Ok(())
    }

    /// Releases everything. The call cannot be used afterwards.
    pub async fn destroy(&mut self) {
        if self.state.is_destroyed() {
            return;
        }
        if self.state.is_participating() {
            self.leave(TermCode::UserHangup).await;
        }
        if self.set_state(CallState::Destroyed).is_ok() {
            self.cancel.cancel();
        }
    }

    /// Stops reconnecting. A lost relay link then ends participation.
    pub fn abort_reconnect(&self) -> Result<(), CallError> {
        let relay = self
            .relay
            .as_ref()
            .ok_or(CallError::Connection(RelayError::NotConnected))?;
        relay.abort_retries();
        Ok(())
    }

    /// Ends our participation and releases sessions, slots and the relay.
    pub(super) async fn leave(&mut self, code: TermCode) {
        if self.state.is_participating() {
            let _ = self.set_state(CallState::TerminatingParticipation);
        }
        if self.state != CallState::TerminatingParticipation {
            return;
        }

        if let Some(relay) = self.relay.take() {
            relay.disconnect().await;
        }
        self.clear_sessions();
        if let Some(mut slots) = self.slots.take() {
            slots.release_all();
            let local = slots.local();
            for slot in [&local.vthumb, &local.hires, &local.audio] {
                slot.set_enabled(false);
            }
            self.deps.engine.close().await;
        }
        self.offer = None;
        self.send_key = None;
        self.send_vthumb = false;
        self.send_hires = false;
        self.started_at = None;
        self.my_peer.keys.clear();
        self.my_peer.cid = 0;
        self.set_speaker_state(SpeakerState::None);

        let _ = self.set_state(CallState::ClientNotParticipating);
        info!(target: "Call", "[{}] left the call: {code:?}", self.call_id);
        self.deps.observer.on_terminated(&self.call_id, code);
    }

    // Relay connection events

    pub async fn on_relay_event(&mut self, event: RelayEvent) {
        let Some(relay) = &self.relay else {
            debug!(target: "Call", "[{}] relay event without a connection", self.call_id);
            return;
        };
        if relay.connection_id() != event.connection_id {
            debug!(
                target: "Call",
                "[{}] ignoring event of replaced connection {}",
                self.call_id, event.connection_id
            );
            return;
        }

        match event.kind {
            RelayEventKind::StateChanged(RelayState::Connected) => {
                if let Err(e) = self.on_relay_connected().await {
                    error!(target: "Call", "[{}] join failed: {e}", self.call_id);
                    self.deps.observer.on_error(&self.call_id, &e);
                    self.leave(TermCode::SignalingFailure).await;
                }
            }
            RelayEventKind::StateChanged(RelayState::Disconnected) => self.on_relay_lost(),
            RelayEventKind::StateChanged(_) => {}
            RelayEventKind::Frame(frame) => {
                dispatch(self, frame).await;
            }
            RelayEventKind::Failed(err) => {
                let code = match err {
                    RelayError::RetriesExhausted(_) | RelayError::Aborted => {
                        TermCode::RetriesExhausted
                    }
                    _ => TermCode::SignalingFailure,
                };
                self.deps
                    .observer
                    .on_error(&self.call_id, &CallError::Connection(err));
                self.leave(code).await;
            }
            RelayEventKind::Closed => {
                if self.state.is_participating() {
                    warn!(target: "Call", "[{}] relay connection closed unexpectedly", self.call_id);
                    self.leave(TermCode::SignalingFailure).await;
                }
            }
        }
    }

    async fn on_relay_connected(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Connecting {
            debug!(target: "Call", "[{}] relay connected while {:?}", self.call_id, self.state);
            return Ok(());
        }
        if self.slots.is_none() {
            self.setup_media().await?;
        }
        let (sdp, ivs) = self
            .offer
            .clone()
            .ok_or_else(|| CallError::Media("no local offer".into()))?;
        let relay = self.relay.clone().ok_or(CallError::Closed)?;
        relay
            .join(OutgoingCommand::Join {
                sdp,
                ivs,
                av: self.local_av,
                speaker: self.local_av.audio(),
                vthumbs: self.config.vthumbs_on_join,
            })
            .await?;
        self.set_state(CallState::Joining)
    }

    /// Creates the transceivers and the compressed offer. Done once per
    /// participation; reconnects re-send the same offer.
    async fn setup_media(&mut self) -> Result<(), CallError> {
        let engine = self.deps.engine.clone();
        let media = |e: anyhow::Error| CallError::Media(e.to_string());

        let vthumb = engine
            .add_transceiver(TrackKind::Video, Direction::SendRecv)
            .await
            .map_err(media)?;
        let hires = engine
            .add_transceiver(TrackKind::Video, Direction::SendRecv)
            .await
            .map_err(media)?;
        let audio = engine
            .add_transceiver(TrackKind::Audio, Direction::SendRecv)
            .await
            .map_err(media)?;

        let mut recv = Vec::new();
        for _ in 0..self.config.recv_video_slots {
            recv.push(
                engine
                    .add_transceiver(TrackKind::Video, Direction::RecvOnly)
                    .await
                    .map_err(media)?,
            );
        }
        for _ in 0..self.config.recv_audio_slots {
            recv.push(
                engine
                    .add_transceiver(TrackKind::Audio, Direction::RecvOnly)
                    .await
                    .map_err(media)?,
            );
        }

        let offer = engine.create_offer().await.map_err(media)?;
        self.ensure_alive()?;

        let mut sdp = Sdp::compress(&offer)?;
        if let Err(e) = sdp.munge_for_simulcast(self.config.simulcast_track_index) {
            warn!(target: "Call", "[{}] sending without simulcast: {e}", self.call_id);
        }

        let ivs = SendIvs::random();
        let mut local = LocalSlots::new(vthumb, hires, audio);
        local.bind(&ivs, self.my_peer.keys.clone());
        self.slots = Some(SlotManager::new(local, recv));
        self.offer = Some((sdp, ivs));
        self.apply_local_av();
        Ok(())
    }

    /// The relay link dropped. The connection retries on its own; the call
    /// waits in `Connecting` and joins again once it is back.
    fn on_relay_lost(&mut self) {
        if !matches!(self.state, CallState::Joining | CallState::InProgress) {
            return;
        }
        warn!(target: "Call", "[{}] relay link lost, waiting for reconnect", self.call_id);
        self.clear_sessions();
        self.send_vthumb = false;
        self.send_hires = false;
        self.set_speaker_state(SpeakerState::None);
        self.apply_local_av();
        let _ = self.set_state(CallState::Connecting);
    }

    // Sessions and slots

    pub(super) fn add_session(&mut self, info: PeerInfo) -> bool {
        if let Some(existing) = self.sessions.get_mut(&info.cid) {
            if existing.peer.av != info.av {
                existing.peer.av = info.av;
                self.deps
                    .observer
                    .on_av_flags_changed(&self.call_id, info.cid, info.av);
                self.apply_remote_av(info.cid);
            }
            return false;
        }
        debug!(target: "Call", "[{}] session {} ({})", self.call_id, info.cid, info.user_id);
        let peer = Peer::new(info.cid, info.user_id, info.av, self.config.max_retained_keys);
        self.deps
            .observer
            .on_session_added(&self.call_id, info.cid, &peer.user_id);
        self.sessions.insert(info.cid, Session::new(peer));
        true
    }

    pub(super) fn remove_session(&mut self, cid: Cid) -> Option<Session> {
        let session = self.sessions.remove(&cid)?;
        if let Some(slots) = self.slots.as_mut() {
            for mid in session.mids() {
                slots.release(mid);
            }
        }
        debug!(target: "Call", "[{}] session {cid} removed", self.call_id);
        self.deps.observer.on_session_removed(&self.call_id, cid);
        Some(session)
    }

    fn clear_sessions(&mut self) {
        let cids: Vec<Cid> = self.sessions.keys().copied().collect();
        for cid in cids {
            self.remove_session(cid);
        }
    }

    /// Binds the receive slot named by `track` to `cid` in `role`. Whoever
    /// held that slot before loses it.
    pub(super) fn bind_track(&mut self, cid: Cid, track: TrackDescriptor, role: SlotRole) -> bool {
        let Some(session) = self.sessions.get(&cid) else {
            warn!(target: "Call", "[{}] track for unknown cid {cid}", self.call_id);
            return false;
        };
        let keys: Arc<dyn KeySource> = session.peer.keys.clone();
        let Some(slots) = self.slots.as_mut() else {
            warn!(target: "Call", "[{}] track before media setup", self.call_id);
            return false;
        };
        if slots.assign(track.mid, cid, track.iv, keys).is_none() {
            warn!(target: "Call", "[{}] no receive slot with mid {}", self.call_id, track.mid);
            return false;
        }

        for other in self.sessions.values_mut() {
            other.forget_mid(track.mid);
        }
        if let Some(session) = self.sessions.get_mut(&cid) {
            if let Some(old) = session.slot(role)
                && old != track.mid
            {
                slots.release(old);
            }
            session.set_slot(role, Some(track.mid));
        }
        self.apply_remote_av(cid);
        true
    }

    pub(super) fn release_role(&mut self, cid: Cid, role: SlotRole) -> bool {
        let Some(session) = self.sessions.get_mut(&cid) else {
            return false;
        };
        if let Some(mid) = session.slot(role) {
            session.set_slot(role, None);
            if let Some(slots) = self.slots.as_mut() {
                slots.release(mid);
            }
        }
        true
    }

    pub(super) fn set_speaker_state(&mut self, state: SpeakerState) {
        if self.speaker_state != state {
            self.speaker_state = state;
            self.deps.observer.on_speaker_state(&self.call_id, state);
        }
    }

    /// Enables our send tracks according to the local flags, our speaker
    /// permission and what the relay asked us to send.
    pub(super) fn apply_local_av(&self) {
        let Some(slots) = &self.slots else {
            return;
        };
        let local = slots.local();
        let av = self.local_av;
        local
            .audio
            .set_enabled(av.audio() && !av.on_hold() && self.speaker_state == SpeakerState::Active);
        local
            .vthumb
            .set_enabled(av.video() && !av.on_hold() && self.send_vthumb);
        local
            .hires
            .set_enabled(av.video() && !av.on_hold() && self.send_hires);
    }

    /// Enables the receive tracks bound to `cid` according to what the
    /// participant says it is sending.
    pub(super) fn apply_remote_av(&self, cid: Cid) {
        let (Some(session), Some(slots)) = (self.sessions.get(&cid), &self.slots) else {
            return;
        };
        let av = session.peer.av;
        let video = av.video() && !av.on_hold();
        let audio = av.audio() && !av.on_hold();
        for (role, enabled) in [
            (SlotRole::Vthumb, video),
            (SlotRole::Hires, video),
            (SlotRole::Audio, audio),
        ] {
            if let Some(slot) = session.slot(role).and_then(|mid| slots.recv(mid)) {
                slot.set_enabled(enabled);
            }
        }
    }

    pub(super) fn set_moderator(&mut self, user: UserId, add: bool) {
        let changed = if add {
            self.moderators.insert(user.clone())
        } else {
            self.moderators.remove(&user)
        };
        if user == self.my_user {
            self.is_moderator = add;
        }
        if changed {
            self.deps
                .observer
                .on_moderator_changed(&self.call_id, &user, add);
        }
    }

    // Participants

    pub fn add_participant(&mut self, user: UserId) -> Result<bool, CallError> {
        if self.state.is_destroyed() {
            return Err(CallError::Closed);
        }
        let added = self.participants.insert(user.clone());
        if added {
            self.deps.observer.on_participant_added(&self.call_id, &user);
        }
        Ok(added)
    }

    pub fn remove_participant(&mut self, user: &UserId) -> Result<bool, CallError> {
        if self.state.is_destroyed() {
            return Err(CallError::Closed);
        }
        let removed = self.participants.remove(user);
        if removed {
            self.deps.observer.on_participant_removed(&self.call_id, user);
        }
        Ok(removed)
    }

    // Media keys

    /// Rotates our media key and sends it to every other participant,
    /// wrapped for each of them. Nothing is sent or installed unless every
    /// recipient's key could be wrapped.
    pub async fn generate_and_send_new_key(&mut self) -> Result<KeyId, CallError> {
        self.require("generate_and_send_new_key", CallState::InProgress)?;

        let plain = generate_send_key();
        let id = self.my_peer.keys.next_id();
        let recipients: Vec<(Cid, UserId)> = self
            .sessions
            .values()
            .filter(|s| s.cid() != self.my_peer.cid)
            .map(|s| (s.cid(), s.peer.user_id.clone()))
            .collect();

        let mut data = Vec::with_capacity(recipients.len());
        for (cid, user) in recipients {
            let wrapped = self.deps.keys.encrypt_key_to(&user, &plain).await?;
            data.push((cid, wrapped.to_vec()));
        }
        self.ensure_alive()?;

        self.send(OutgoingCommand::Key { id, data }).await?;
        self.my_peer.keys.insert(id, self.media_key(&plain));
        self.send_key = Some((id, plain));
        info!(target: "Call", "[{}] media key rotated to {id}", self.call_id);
        Ok(id)
    }

    /// Sends the current key to a participant that just joined.
    pub(super) async fn send_current_key_to(&self, cid: Cid) -> Result<(), CallError> {
        let Some((id, plain)) = self.send_key else {
            return Ok(());
        };
        let user = self
            .sessions
            .get(&cid)
            .map(|s| s.peer.user_id.clone())
            .ok_or_else(|| CallError::NotFound(format!("session {cid}")))?;
        let wrapped = self.deps.keys.encrypt_key_to(&user, &plain).await?;
        self.ensure_alive()?;
        self.send(OutgoingCommand::Key {
            id,
            data: vec![(cid, wrapped.to_vec())],
        })
        .await
    }

    /// Key actually used for frames: the send key bound to the call key.
    pub(super) fn media_key(&self, plain: &MediaKey) -> MediaKey {
        match &self.call_key {
            Some(call_key) => xor_with_call_key(call_key, plain),
            None => *plain,
        }
    }

    // Speakers and moderation

    /// Asks for, or withdraws a request for, permission to speak.
    pub async fn request_speaker(&mut self, add: bool) -> Result<(), CallError> {
        self.require("request_speaker", CallState::InProgress)?;
        if add {
            self.send(OutgoingCommand::SpeakRequest { cid: None }).await?;
            if self.speaker_state == SpeakerState::None {
                self.set_speaker_state(SpeakerState::Pending);
            }
        } else {
            self.send(OutgoingCommand::SpeakRequestDel { cid: None })
                .await?;
            if self.speaker_state == SpeakerState::Pending {
                self.set_speaker_state(SpeakerState::None);
            }
        }
        Ok(())
    }

    /// Grants or denies another participant's speak request.
    pub async fn approve_speak_request(&mut self, cid: Cid, allow: bool) -> Result<(), CallError> {
        self.require_moderator()?;
        self.require("approve_speak_request", CallState::InProgress)?;
        if !self.sessions.contains_key(&cid) {
            return Err(CallError::NotFound(format!("session {cid}")));
        }
        let cmd = if allow {
            OutgoingCommand::SpeakRequest { cid: Some(cid) }
        } else {
            OutgoingCommand::SpeakRequestDel { cid: Some(cid) }
        };
        self.send(cmd).await?;
        if let Some(session) = self.sessions.get_mut(&cid) {
            session.speak_requested = false;
        }
        Ok(())
    }

    /// Stops a speaker. `0` or our own cid stops ourselves; anyone else
    /// needs moderator rights.
    pub async fn stop_speak(&mut self, cid: Cid) -> Result<(), CallError> {
        let own = cid == 0 || self.is_me(cid);
        if !own {
            self.require_moderator()?;
        }
        self.require("stop_speak", CallState::InProgress)?;
        if own {
            self.send(OutgoingCommand::SpeakerDel { cid: None }).await?;
            self.set_speaker_state(SpeakerState::None);
            self.apply_local_av();
        } else {
            if !self.sessions.contains_key(&cid) {
                return Err(CallError::NotFound(format!("session {cid}")));
            }
            self.send(OutgoingCommand::SpeakerDel { cid: Some(cid) })
                .await?;
        }
        Ok(())
    }

    // Video subscriptions

    pub async fn request_high_resolution_video(
        &mut self,
        cid: Cid,
        quality: u8,
    ) -> Result<(), CallError> {
        self.require("request_high_resolution_video", CallState::InProgress)?;
        let session = self
            .sessions
            .get(&cid)
            .ok_or_else(|| CallError::NotFound(format!("session {cid}")))?;
        let reuse = session.vthumb_slot.is_some();
        self.send(OutgoingCommand::GetHires {
            cid,
            reuse,
            quality,
        })
        .await
    }

    pub async fn stop_high_resolution_video(&mut self, cids: Vec<Cid>) -> Result<(), CallError> {
        self.require("stop_high_resolution_video", CallState::InProgress)?;
        self.send(OutgoingCommand::DelHires { cids: cids.clone() })
            .await?;
        for cid in cids {
            self.release_role(cid, SlotRole::Hires);
        }
        Ok(())
    }

    pub async fn request_low_resolution_video(&mut self, cids: Vec<Cid>) -> Result<(), CallError> {
        self.require("request_low_resolution_video", CallState::InProgress)?;
        self.send(OutgoingCommand::GetVthumbs { cids }).await
    }

    pub async fn stop_low_resolution_video(&mut self, cids: Vec<Cid>) -> Result<(), CallError> {
        self.require("stop_low_resolution_video", CallState::InProgress)?;
        self.send(OutgoingCommand::DelVthumbs { cids: cids.clone() })
            .await?;
        for cid in cids {
            self.release_role(cid, SlotRole::Vthumb);
        }
        Ok(())
    }

    pub async fn request_hires_quality(&mut self, cid: Cid, quality: u8) -> Result<(), CallError> {
        self.require("request_hires_quality", CallState::InProgress)?;
        self.send(OutgoingCommand::HiresSetLo { cid, quality }).await
    }

    pub async fn set_layer(
        &mut self,
        spatial: u8,
        temporal: u8,
        screen_temporal: u8,
    ) -> Result<(), CallError> {
        self.require("set_layer", CallState::InProgress)?;
        self.send(OutgoingCommand::Layer {
            spatial,
            temporal,
            screen_temporal,
        })
        .await
    }

    /// Updates our audio/video flags. The relay is told only while in the call.
    pub async fn update_av_flags(&mut self, av: AvFlags) -> Result<(), CallError> {
        if self.state.is_destroyed() {
            return Err(CallError::Closed);
        }
        self.local_av = av;
        self.apply_local_av();
        if self.state == CallState::InProgress {
            self.send(OutgoingCommand::Av { av }).await?;
        }
        Ok(())
    }
}
