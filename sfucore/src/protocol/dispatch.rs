//! Routes parsed frames to a typed handler.
//!
//! The set of commands is closed ([`Command`]), so the routing is a single
//! exhaustive `match` instead of a name-keyed table. Each handler method
//! returns whether the command could be applied.

use async_trait::async_trait;
use log::{debug, warn};

use super::incoming::{Answer, CidTrack, Command, IncomingFrame, PeerInfo, parse_frame};
use crate::types::{AvFlags, Cid, KeyId, TrackDescriptor, UserId};

/// Receiver of relay commands, implemented by the call.
#[async_trait]
pub trait SfuInterface: Send {
    async fn handle_av(&mut self, cid: Cid, av: AvFlags) -> bool;
    async fn handle_answer(&mut self, answer: Answer) -> bool;
    async fn handle_key(&mut self, id: KeyId, from: Cid, key: Vec<u8>) -> bool;
    async fn handle_vthumbs(&mut self, tracks: Vec<CidTrack>) -> bool;
    async fn handle_vthumb_start(&mut self) -> bool;
    async fn handle_vthumb_stop(&mut self) -> bool;
    async fn handle_hires(&mut self, tracks: Vec<CidTrack>) -> bool;
    async fn handle_hires_start(&mut self) -> bool;
    async fn handle_hires_stop(&mut self) -> bool;
    async fn handle_speak_reqs(&mut self, cids: Vec<Cid>) -> bool;
    async fn handle_speak_req_del(&mut self, cid: Cid) -> bool;
    async fn handle_speak_on(&mut self, cid: Option<Cid>, audio: Option<TrackDescriptor>) -> bool;
    async fn handle_speak_off(&mut self, cid: Option<Cid>) -> bool;
    async fn handle_peer_join(&mut self, peer: PeerInfo) -> bool;
    async fn handle_peer_left(&mut self, cid: Cid) -> bool;
    async fn handle_bye(&mut self, reason: u32) -> bool;
    async fn handle_mod_add(&mut self, user_id: UserId) -> bool;
    async fn handle_mod_del(&mut self, user_id: UserId) -> bool;
    /// An `err` frame. Never routed to a command handler.
    async fn handle_error(&mut self, code: i32, msg: Option<String>) -> bool;
}

/// Delivers one parsed frame to `handler`.
pub async fn dispatch<H: SfuInterface + ?Sized>(handler: &mut H, frame: IncomingFrame) -> bool {
    let cmd = match frame {
        IncomingFrame::Error(err) => return handler.handle_error(err.code, err.msg).await,
        IncomingFrame::Command(cmd) => cmd,
    };

    let name = cmd.name();
    debug!(target: "Protocol", "<-- {name}");
    let handled = match cmd {
        Command::Av { cid, av } => handler.handle_av(cid, av).await,
        Command::Answer(answer) => handler.handle_answer(*answer).await,
        Command::Key { id, from, key } => handler.handle_key(id, from, key).await,
        Command::Vthumbs { tracks } => handler.handle_vthumbs(tracks).await,
        Command::VthumbStart => handler.handle_vthumb_start().await,
        Command::VthumbStop => handler.handle_vthumb_stop().await,
        Command::Hires { tracks } => handler.handle_hires(tracks).await,
        Command::HiresStart => handler.handle_hires_start().await,
        Command::HiresStop => handler.handle_hires_stop().await,
        Command::SpeakReqs { cids } => handler.handle_speak_reqs(cids).await,
        Command::SpeakReqDel { cid } => handler.handle_speak_req_del(cid).await,
        Command::SpeakOn { cid, audio } => handler.handle_speak_on(cid, audio).await,
        Command::SpeakOff { cid } => handler.handle_speak_off(cid).await,
        Command::PeerJoin(peer) => handler.handle_peer_join(peer).await,
        Command::PeerLeft { cid } => handler.handle_peer_left(cid).await,
        Command::Bye { reason } => handler.handle_bye(reason).await,
        Command::ModAdd { user_id } => handler.handle_mod_add(user_id).await,
        Command::ModDel { user_id } => handler.handle_mod_del(user_id).await,
    };
    if !handled {
        warn!(target: "Protocol", "{name} could not be applied");
    }
    handled
}

/// Parses and delivers a raw frame. Malformed frames are logged and dropped.
pub async fn dispatch_raw<H: SfuInterface + ?Sized>(handler: &mut H, data: &[u8]) -> bool {
    match parse_frame(data) {
        Ok(frame) => dispatch(handler, frame).await,
        Err(e) => {
            warn!(target: "Protocol", "dropping inbound frame: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        accept: bool,
    }

    impl Recorder {
        fn record(&mut self, entry: String) -> bool {
            self.calls.push(entry);
            self.accept
        }
    }

    #[async_trait]
    impl SfuInterface for Recorder {
        async fn handle_av(&mut self, cid: Cid, av: AvFlags) -> bool {
            self.record(format!("av {cid} {}", av.bits()))
        }
        async fn handle_answer(&mut self, answer: Answer) -> bool {
            self.record(format!("answer {} peers={}", answer.cid, answer.peers.len()))
        }
        async fn handle_key(&mut self, id: KeyId, from: Cid, key: Vec<u8>) -> bool {
            self.record(format!("key {id} {from} {}", key.len()))
        }
        async fn handle_vthumbs(&mut self, tracks: Vec<CidTrack>) -> bool {
            self.record(format!("vthumbs {}", tracks.len()))
        }
        async fn handle_vthumb_start(&mut self) -> bool {
            self.record("vthumb_start".into())
        }
        async fn handle_vthumb_stop(&mut self) -> bool {
            self.record("vthumb_stop".into())
        }
        async fn handle_hires(&mut self, tracks: Vec<CidTrack>) -> bool {
            self.record(format!("hires {}", tracks.len()))
        }
        async fn handle_hires_start(&mut self) -> bool {
            self.record("hires_start".into())
        }
        async fn handle_hires_stop(&mut self) -> bool {
            self.record("hires_stop".into())
        }
        async fn handle_speak_reqs(&mut self, cids: Vec<Cid>) -> bool {
            self.record(format!("speak_reqs {cids:?}"))
        }
        async fn handle_speak_req_del(&mut self, cid: Cid) -> bool {
            self.record(format!("speak_rq_del {cid}"))
        }
        async fn handle_speak_on(&mut self, cid: Option<Cid>, audio: Option<TrackDescriptor>) -> bool {
            self.record(format!("speak_on {cid:?} {:?}", audio.map(|a| a.mid)))
        }
        async fn handle_speak_off(&mut self, cid: Option<Cid>) -> bool {
            self.record(format!("speak_off {cid:?}"))
        }
        async fn handle_peer_join(&mut self, peer: PeerInfo) -> bool {
            self.record(format!("peerjoin {} {}", peer.cid, peer.user_id))
        }
        async fn handle_peer_left(&mut self, cid: Cid) -> bool {
            self.record(format!("peerleft {cid}"))
        }
        async fn handle_bye(&mut self, reason: u32) -> bool {
            self.record(format!("bye {reason}"))
        }
        async fn handle_mod_add(&mut self, user_id: UserId) -> bool {
            self.record(format!("mod_add {user_id}"))
        }
        async fn handle_mod_del(&mut self, user_id: UserId) -> bool {
            self.record(format!("mod_del {user_id}"))
        }
        async fn handle_error(&mut self, code: i32, msg: Option<String>) -> bool {
            self.record(format!("error {code} {msg:?}"))
        }
    }

    async fn run(frames: &[serde_json::Value]) -> (Recorder, Vec<bool>) {
        let mut rec = Recorder {
            accept: true,
            ..Default::default()
        };
        let mut results = Vec::new();
        for f in frames {
            results.push(dispatch_raw(&mut rec, f.to_string().as_bytes()).await);
        }
        (rec, results)
    }

    #[tokio::test]
    async fn test_each_command_reaches_its_handler() {
        let (rec, results) = run(&[
            json!({"a": "AV", "cid": 5, "av": 3}),
            json!({"a": "PEERJOIN", "cid": 8, "userId": "U8", "av": 0}),
            json!({"a": "PEERLEFT", "cid": 8}),
            json!({"a": "SPEAK_REQS", "cids": [1, 2]}),
            json!({"a": "SPEAK_RQ_DEL", "cid": 2}),
            json!({"a": "SPEAK_ON", "cid": 1, "audio": {"mid": 4, "iv": "0000000000000001"}}),
            json!({"a": "SPEAK_OFF"}),
            json!({"a": "VTHUMB_START"}),
            json!({"a": "HIRES_STOP"}),
            json!({"a": "BYE", "rsn": 2}),
            json!({"a": "MOD_ADD", "userId": "U1"}),
        ])
        .await;

        assert!(results.iter().all(|r| *r));
        assert_eq!(
            rec.calls,
            vec![
                "av 5 3",
                "peerjoin 8 U8",
                "peerleft 8",
                "speak_reqs [1, 2]",
                "speak_rq_del 2",
                "speak_on Some(1) Some(4)",
                "speak_off None",
                "vthumb_start",
                "hires_stop",
                "bye 2",
                "mod_add U1",
            ]
        );
    }

    #[tokio::test]
    async fn test_error_frame_goes_to_error_callback_only() {
        let (rec, results) = run(&[json!({"err": 12, "msg": "bad", "a": "AV"})]).await;
        assert_eq!(results, vec![true]);
        assert_eq!(rec.calls, vec!["error 12 Some(\"bad\")"]);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_return_false() {
        let (rec, results) = run(&[
            json!({"a": "WHATEVER"}),
            json!({"a": "AV", "cid": 5}),
            json!({"a": "PEERLEFT", "cid": -1}),
        ])
        .await;
        assert_eq!(results, vec![false, false, false]);
        assert!(rec.calls.is_empty());
    }

    #[tokio::test]
    async fn test_handler_refusal_is_reported() {
        let mut rec = Recorder::default();
        let ok = dispatch_raw(&mut rec, br#"{"a":"PEERLEFT","cid":3}"#).await;
        assert!(!ok);
        assert_eq!(rec.calls, vec!["peerleft 3"]);
    }
}
