//! Applies relay commands to a [`Call`].

use async_trait::async_trait;
use log::{debug, info, warn};
use sfucore::protocol::{Answer, CidTrack, PeerInfo, SfuInterface};
use sfucore::types::{AvFlags, Cid, KeyId, SpeakerState, TermCode, TrackDescriptor, UserId};

use super::call::Call;
use super::error::CallError;
use super::session::SlotRole;
use super::state::CallState;

impl Call {
    fn in_call(&self, command: &str) -> bool {
        if self.state != CallState::InProgress {
            warn!(target: "Call", "[{}] {command} while {:?}", self.call_id, self.state);
            return false;
        }
        true
    }

    fn bind_tracks(&mut self, tracks: Vec<CidTrack>, role: SlotRole) -> bool {
        let mut all = true;
        for CidTrack { cid, track } in tracks {
            let bound = self.bind_track(cid, track, role);
            // A reused high resolution stream replaces the participant's
            // low resolution one.
            if bound
                && role == SlotRole::Hires
                && track.reuse
                && self
                    .session(cid)
                    .and_then(|s| s.slot(SlotRole::Vthumb))
                    .is_some_and(|mid| mid != track.mid)
            {
                debug!(target: "Call", "[{}] cid {cid} hires reuses its vthumb", self.call_id);
                self.release_role(cid, SlotRole::Vthumb);
            }
            all &= bound;
        }
        all
    }
}

#[async_trait]
impl SfuInterface for Call {
    async fn handle_av(&mut self, cid: Cid, av: AvFlags) -> bool {
        if !self.in_call("AV") {
            return false;
        }
        let Some(session) = self.sessions.get_mut(&cid) else {
            warn!(target: "Call", "[{}] AV for unknown cid {cid}", self.call_id);
            return false;
        };
        session.peer.av = av;
        debug!(target: "Call", "[{}] cid {cid} av {av}", self.call_id);
        self.apply_remote_av(cid);
        self.deps.observer.on_av_flags_changed(&self.call_id, cid, av);
        true
    }

    async fn handle_answer(&mut self, answer: Answer) -> bool {
        if self.state != CallState::Joining {
            warn!(target: "Call", "[{}] ANSWER while {:?}", self.call_id, self.state);
            return false;
        }
        let remote = match answer.sdp.decompress() {
            Ok(sdp) => sdp,
            Err(e) => {
                self.report(&e.into());
                return false;
            }
        };
        if let Err(e) = self.deps.engine.set_remote_description(&remote).await {
            self.report(&CallError::Media(e.to_string()));
            return false;
        }

        self.my_peer.cid = answer.cid;
        self.started_at = Some(answer.ts);
        for user in answer.moderators {
            self.set_moderator(user, true);
        }
        for peer in answer.peers {
            self.add_session(peer);
        }
        for (cid, track) in answer.vthumbs {
            self.bind_track(cid, track, SlotRole::Vthumb);
        }
        for (cid, track) in answer.speakers {
            if self.is_me(cid) {
                self.set_speaker_state(SpeakerState::Active);
            } else {
                self.bind_track(cid, track, SlotRole::Audio);
            }
        }

        if self.set_state(CallState::InProgress).is_err() {
            return false;
        }
        info!(
            target: "Call",
            "[{}] joined as cid {} with {} session(s)",
            self.call_id,
            answer.cid,
            self.sessions.len()
        );
        self.apply_local_av();
        if let Err(e) = self.generate_and_send_new_key().await {
            self.report(&e);
        }
        true
    }

    async fn handle_key(&mut self, id: KeyId, from: Cid, key: Vec<u8>) -> bool {
        if !self.in_call("KEY") {
            return false;
        }
        let Some(session) = self.sessions.get(&from) else {
            warn!(target: "Call", "[{}] KEY {id} from unknown cid {from}", self.call_id);
            return false;
        };
        let user = session.peer.user_id.clone();
        let ring = session.peer.keys.clone();

        match self.deps.keys.decrypt_key_from(&user, &key).await {
            Ok(plain) => {
                ring.insert(id, self.media_key(&plain));
                debug!(target: "Call", "[{}] key {id} from cid {from}", self.call_id);
                true
            }
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    async fn handle_vthumbs(&mut self, tracks: Vec<CidTrack>) -> bool {
        self.in_call("VTHUMBS") && self.bind_tracks(tracks, SlotRole::Vthumb)
    }

    async fn handle_vthumb_start(&mut self) -> bool {
        self.send_vthumb = true;
        self.apply_local_av();
        true
    }

    async fn handle_vthumb_stop(&mut self) -> bool {
        self.send_vthumb = false;
        self.apply_local_av();
        true
    }

    async fn handle_hires(&mut self, tracks: Vec<CidTrack>) -> bool {
        self.in_call("HIRES") && self.bind_tracks(tracks, SlotRole::Hires)
    }

    async fn handle_hires_start(&mut self) -> bool {
        self.send_hires = true;
        self.apply_local_av();
        true
    }

    async fn handle_hires_stop(&mut self) -> bool {
        self.send_hires = false;
        self.apply_local_av();
        true
    }

    async fn handle_speak_reqs(&mut self, cids: Vec<Cid>) -> bool {
        if !self.in_call("SPEAK_REQS") {
            return false;
        }
        for &cid in &cids {
            if self.is_me(cid) {
                if self.speaker_state == SpeakerState::None {
                    self.set_speaker_state(SpeakerState::Pending);
                }
            } else if let Some(session) = self.sessions.get_mut(&cid) {
                session.speak_requested = true;
            } else {
                debug!(target: "Call", "[{}] speak request of unknown cid {cid}", self.call_id);
            }
        }
        self.deps.observer.on_speak_requests(&self.call_id, &cids);
        true
    }

    async fn handle_speak_req_del(&mut self, cid: Cid) -> bool {
        if self.is_me(cid) {
            if self.speaker_state == SpeakerState::Pending {
                self.set_speaker_state(SpeakerState::None);
            }
            return true;
        }
        match self.sessions.get_mut(&cid) {
            Some(session) => {
                session.speak_requested = false;
                true
            }
            None => false,
        }
    }

    async fn handle_speak_on(&mut self, cid: Option<Cid>, audio: Option<TrackDescriptor>) -> bool {
        if !self.in_call("SPEAK_ON") {
            return false;
        }
        match (cid, audio) {
            (Some(cid), Some(track)) if !self.is_me(cid) => {
                if !self.bind_track(cid, track, SlotRole::Audio) {
                    return false;
                }
                if let Some(session) = self.sessions.get_mut(&cid) {
                    session.speak_requested = false;
                }
                true
            }
            (Some(cid), None) if !self.is_me(cid) => {
                warn!(target: "Call", "[{}] SPEAK_ON for cid {cid} without a track", self.call_id);
                false
            }
            _ => {
                self.set_speaker_state(SpeakerState::Active);
                self.apply_local_av();
                true
            }
        }
    }

    async fn handle_speak_off(&mut self, cid: Option<Cid>) -> bool {
        match cid {
            Some(cid) if !self.is_me(cid) => self.release_role(cid, SlotRole::Audio),
            _ => {
                self.set_speaker_state(SpeakerState::None);
                self.apply_local_av();
                true
            }
        }
    }

    async fn handle_peer_join(&mut self, peer: PeerInfo) -> bool {
        if !self.in_call("PEERJOIN") {
            return false;
        }
        let cid = peer.cid;
        if self.add_session(peer)
            && let Err(e) = self.send_current_key_to(cid).await
        {
            self.report(&e);
        }
        true
    }

    async fn handle_peer_left(&mut self, cid: Cid) -> bool {
        if !self.in_call("PEERLEFT") {
            return false;
        }
        if self.remove_session(cid).is_none() {
            warn!(target: "Call", "[{}] PEERLEFT for unknown cid {cid}", self.call_id);
            return false;
        }
        // Whoever left must not be able to decrypt what follows.
        if let Err(e) = self.generate_and_send_new_key().await {
            self.report(&e);
        }
        true
    }

    async fn handle_bye(&mut self, reason: u32) -> bool {
        info!(target: "Call", "[{}] relay said BYE ({reason})", self.call_id);
        self.leave(TermCode::RelayShutdown(reason)).await;
        true
    }

    async fn handle_mod_add(&mut self, user_id: UserId) -> bool {
        self.set_moderator(user_id, true);
        true
    }

    async fn handle_mod_del(&mut self, user_id: UserId) -> bool {
        self.set_moderator(user_id, false);
        true
    }

    async fn handle_error(&mut self, code: i32, msg: Option<String>) -> bool {
        let msg = msg.unwrap_or_default();
        warn!(target: "Call", "[{}] relay error {code}: {msg}", self.call_id);
        self.deps.observer.on_relay_error(&self.call_id, code, &msg);
        self.deps
            .observer
            .on_error(&self.call_id, &CallError::Relay { code, msg });
        self.leave(TermCode::Error(code)).await;
        true
    }
}
