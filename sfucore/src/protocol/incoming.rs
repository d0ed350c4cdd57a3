//! Inbound relay frames.
//!
//! Parsing never panics: a frame that lacks a required field, or carries one
//! of the wrong JSON type, yields a [`ProtocolError`] naming the command and
//! the field so the caller can log it and drop the frame.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{COMMAND_FIELD, ERROR_FIELD, ProtocolError};
use crate::sdp::Sdp;
use crate::types::{AvFlags, Cid, InitVector, KeyId, TrackDescriptor, UserId};

/// A participant as announced by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub cid: Cid,
    pub user_id: UserId,
    pub av: AvFlags,
}

/// A track descriptor addressed to a specific participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidTrack {
    pub cid: Cid,
    pub track: TrackDescriptor,
}

/// The relay's reply to `JOIN`.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// Our own connection id for this call.
    pub cid: Cid,
    pub sdp: Sdp,
    /// Call start time on the relay, in milliseconds.
    pub ts: u64,
    pub peers: Vec<PeerInfo>,
    /// Audio tracks of the participants currently allowed to speak.
    pub speakers: BTreeMap<Cid, TrackDescriptor>,
    /// Low resolution video tracks already assigned to us.
    pub vthumbs: BTreeMap<Cid, TrackDescriptor>,
    pub moderators: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Av { cid: Cid, av: AvFlags },
    Answer(Box<Answer>),
    Key { id: KeyId, from: Cid, key: Vec<u8> },
    Vthumbs { tracks: Vec<CidTrack> },
    VthumbStart,
    VthumbStop,
    Hires { tracks: Vec<CidTrack> },
    HiresStart,
    HiresStop,
    SpeakReqs { cids: Vec<Cid> },
    SpeakReqDel { cid: Cid },
    SpeakOn { cid: Option<Cid>, audio: Option<TrackDescriptor> },
    SpeakOff { cid: Option<Cid> },
    PeerJoin(PeerInfo),
    PeerLeft { cid: Cid },
    Bye { reason: u32 },
    ModAdd { user_id: UserId },
    ModDel { user_id: UserId },
}

impl Command {
    pub const AV: &'static str = "AV";
    pub const ANSWER: &'static str = "ANSWER";
    pub const KEY: &'static str = "KEY";
    pub const VTHUMBS: &'static str = "VTHUMBS";
    pub const VTHUMB_START: &'static str = "VTHUMB_START";
    pub const VTHUMB_STOP: &'static str = "VTHUMB_STOP";
    pub const HIRES: &'static str = "HIRES";
    pub const HIRES_START: &'static str = "HIRES_START";
    pub const HIRES_STOP: &'static str = "HIRES_STOP";
    pub const SPEAK_REQS: &'static str = "SPEAK_REQS";
    pub const SPEAK_RQ_DEL: &'static str = "SPEAK_RQ_DEL";
    pub const SPEAK_ON: &'static str = "SPEAK_ON";
    pub const SPEAK_OFF: &'static str = "SPEAK_OFF";
    pub const PEERJOIN: &'static str = "PEERJOIN";
    pub const PEERLEFT: &'static str = "PEERLEFT";
    pub const BYE: &'static str = "BYE";
    pub const MOD_ADD: &'static str = "MOD_ADD";
    pub const MOD_DEL: &'static str = "MOD_DEL";

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Av { .. } => Self::AV,
            Self::Answer(_) => Self::ANSWER,
            Self::Key { .. } => Self::KEY,
            Self::Vthumbs { .. } => Self::VTHUMBS,
            Self::VthumbStart => Self::VTHUMB_START,
            Self::VthumbStop => Self::VTHUMB_STOP,
            Self::Hires { .. } => Self::HIRES,
            Self::HiresStart => Self::HIRES_START,
            Self::HiresStop => Self::HIRES_STOP,
            Self::SpeakReqs { .. } => Self::SPEAK_REQS,
            Self::SpeakReqDel { .. } => Self::SPEAK_RQ_DEL,
            Self::SpeakOn { .. } => Self::SPEAK_ON,
            Self::SpeakOff { .. } => Self::SPEAK_OFF,
            Self::PeerJoin(_) => Self::PEERJOIN,
            Self::PeerLeft { .. } => Self::PEERLEFT,
            Self::Bye { .. } => Self::BYE,
            Self::ModAdd { .. } => Self::MOD_ADD,
            Self::ModDel { .. } => Self::MOD_DEL,
        }
    }

    /// Parses the command named `name` from its JSON object.
    pub fn parse(name: &str, obj: &Map<String, Value>) -> Result<Self, ProtocolError> {
        let cmd = match name {
            Self::AV => {
                let f = Fields::new(Self::AV, obj);
                Self::Av {
                    cid: f.u32("cid")?,
                    av: f.av("av")?,
                }
            }
            Self::ANSWER => Self::Answer(Box::new(parse_answer(obj)?)),
            Self::KEY => {
                let f = Fields::new(Self::KEY, obj);
                let encoded = f.str("key")?;
                let key = URL_SAFE_NO_PAD
                    .decode(encoded)
                    .map_err(|_| f.wrong_type("key", "base64 string"))?;
                Self::Key {
                    id: f.u32("id")?,
                    from: f.u32("from")?,
                    key,
                }
            }
            Self::VTHUMBS => Self::Vthumbs {
                tracks: parse_track_list(Fields::new(Self::VTHUMBS, obj))?,
            },
            Self::HIRES => Self::Hires {
                tracks: parse_track_list(Fields::new(Self::HIRES, obj))?,
            },
            Self::VTHUMB_START => Self::VthumbStart,
            Self::VTHUMB_STOP => Self::VthumbStop,
            Self::HIRES_START => Self::HiresStart,
            Self::HIRES_STOP => Self::HiresStop,
            Self::SPEAK_REQS => {
                let f = Fields::new(Self::SPEAK_REQS, obj);
                Self::SpeakReqs {
                    cids: f.cid_list("cids")?,
                }
            }
            Self::SPEAK_RQ_DEL => Self::SpeakReqDel {
                cid: Fields::new(Self::SPEAK_RQ_DEL, obj).u32("cid")?,
            },
            Self::SPEAK_ON => {
                let f = Fields::new(Self::SPEAK_ON, obj);
                let audio = match f.opt_object("audio")? {
                    Some(audio) => Some(parse_descriptor(
                        &Fields::new(Self::SPEAK_ON, audio),
                        false,
                    )?),
                    None => None,
                };
                let cid = f.opt_u32("cid")?;
                if cid.is_some() && audio.is_none() {
                    return Err(f.missing("audio"));
                }
                Self::SpeakOn { cid, audio }
            }
            Self::SPEAK_OFF => Self::SpeakOff {
                cid: Fields::new(Self::SPEAK_OFF, obj).opt_u32("cid")?,
            },
            Self::PEERJOIN => Self::PeerJoin(parse_peer(&Fields::new(Self::PEERJOIN, obj))?),
            Self::PEERLEFT => Self::PeerLeft {
                cid: Fields::new(Self::PEERLEFT, obj).u32("cid")?,
            },
            Self::BYE => Self::Bye {
                reason: Fields::new(Self::BYE, obj).u32("rsn")?,
            },
            Self::MOD_ADD => Self::ModAdd {
                user_id: UserId::new(Fields::new(Self::MOD_ADD, obj).str("userId")?),
            },
            Self::MOD_DEL => Self::ModDel {
                user_id: UserId::new(Fields::new(Self::MOD_DEL, obj).str("userId")?),
            },
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };
        Ok(cmd)
    }
}

/// An `{"err": code, "msg": "..."}` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayErrorFrame {
    pub code: i32,
    pub msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncomingFrame {
    Command(Command),
    Error(RelayErrorFrame),
}

/// Parses one raw inbound frame.
pub fn parse_frame(data: &[u8]) -> Result<IncomingFrame, ProtocolError> {
    let value: Value =
        serde_json::from_slice(data).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
    let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;

    if let Some(code) = obj.get(ERROR_FIELD) {
        let code = code
            .as_i64()
            .and_then(|c| i32::try_from(c).ok())
            .ok_or(ProtocolError::WrongType {
                command: "error",
                field: ERROR_FIELD,
                expected: "integer",
            })?;
        let msg = obj.get("msg").and_then(Value::as_str).map(str::to_string);
        return Ok(IncomingFrame::Error(RelayErrorFrame { code, msg }));
    }

    let name = obj
        .get(COMMAND_FIELD)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingCommandName)?;
    Command::parse(name, obj).map(IncomingFrame::Command)
}

fn parse_answer(obj: &Map<String, Value>) -> Result<Answer, ProtocolError> {
    let f = Fields::new(Command::ANSWER, obj);
    let sdp: Sdp = serde_json::from_value(f.object_value("sdp")?.clone())
        .map_err(|e| ProtocolError::InvalidSdp(e.to_string()))?;

    let mut peers = Vec::new();
    for peer in f.array("peers")? {
        let peer = peer.as_object().ok_or(f.wrong_type("peers", "array of objects"))?;
        peers.push(parse_peer(&Fields::new(Command::ANSWER, peer))?);
    }

    let mut speakers = BTreeMap::new();
    if let Some(map) = f.opt_object("speakers")? {
        for (cid, entry) in map {
            let cid = parse_cid_key(&f, "speakers", cid)?;
            let audio = entry
                .as_object()
                .and_then(|e| e.get("audio"))
                .and_then(Value::as_object)
                .ok_or(f.wrong_type("speakers", "map of {audio: track}"))?;
            speakers.insert(cid, parse_descriptor(&Fields::new(Command::ANSWER, audio), false)?);
        }
    }

    let mut vthumbs = BTreeMap::new();
    if let Some(map) = f.opt_object("vthumbs")? {
        for (cid, entry) in map {
            let cid = parse_cid_key(&f, "vthumbs", cid)?;
            let track = entry
                .as_object()
                .ok_or(f.wrong_type("vthumbs", "map of tracks"))?;
            vthumbs.insert(cid, parse_descriptor(&Fields::new(Command::ANSWER, track), false)?);
        }
    }

    let mut moderators = Vec::new();
    if let Some(mods) = f.opt_array("mods")? {
        for m in mods {
            let m = m.as_str().ok_or(f.wrong_type("mods", "array of strings"))?;
            moderators.push(UserId::new(m));
        }
    }

    Ok(Answer {
        cid: f.u32("cid")?,
        sdp,
        ts: f.u64("t")?,
        peers,
        speakers,
        vthumbs,
        moderators,
    })
}

fn parse_peer(f: &Fields<'_>) -> Result<PeerInfo, ProtocolError> {
    Ok(PeerInfo {
        cid: f.u32("cid")?,
        user_id: UserId::new(f.str("userId")?),
        av: f.av("av")?,
    })
}

fn parse_descriptor(f: &Fields<'_>, allow_reuse: bool) -> Result<TrackDescriptor, ProtocolError> {
    let iv = InitVector::from_hex(f.str("iv")?)?;
    let reuse = if allow_reuse {
        f.opt_u32("r")?.unwrap_or(0) != 0
    } else {
        false
    };
    Ok(TrackDescriptor {
        mid: f.u32("mid")?,
        iv,
        reuse,
    })
}

fn parse_track_list(f: Fields<'_>) -> Result<Vec<CidTrack>, ProtocolError> {
    let mut tracks = Vec::new();
    for entry in f.array("tracks")? {
        let entry = entry
            .as_object()
            .ok_or(f.wrong_type("tracks", "array of objects"))?;
        let ef = Fields::new(f.command, entry);
        tracks.push(CidTrack {
            cid: ef.u32("cid")?,
            track: parse_descriptor(&ef, true)?,
        });
    }
    Ok(tracks)
}

fn parse_cid_key(f: &Fields<'_>, field: &'static str, key: &str) -> Result<Cid, ProtocolError> {
    key.parse::<Cid>()
        .map_err(|_| f.wrong_type(field, "map keyed by cid"))
}

/// Typed accessor over one JSON object, producing errors that name the command.
struct Fields<'a> {
    command: &'static str,
    obj: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn new(command: &'static str, obj: &'a Map<String, Value>) -> Self {
        Self { command, obj }
    }

    fn missing(&self, field: &'static str) -> ProtocolError {
        ProtocolError::MissingField {
            command: self.command,
            field,
        }
    }

    fn wrong_type(&self, field: &'static str, expected: &'static str) -> ProtocolError {
        ProtocolError::WrongType {
            command: self.command,
            field,
            expected,
        }
    }

    fn get(&self, field: &'static str) -> Result<&'a Value, ProtocolError> {
        self.obj.get(field).ok_or_else(|| self.missing(field))
    }

    fn u64(&self, field: &'static str) -> Result<u64, ProtocolError> {
        self.get(field)?
            .as_u64()
            .ok_or_else(|| self.wrong_type(field, "unsigned integer"))
    }

    fn u32(&self, field: &'static str) -> Result<u32, ProtocolError> {
        u32::try_from(self.u64(field)?).map_err(|_| self.wrong_type(field, "32-bit integer"))
    }

    fn opt_u32(&self, field: &'static str) -> Result<Option<u32>, ProtocolError> {
        match self.obj.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.u32(field).map(Some),
        }
    }

    fn av(&self, field: &'static str) -> Result<AvFlags, ProtocolError> {
        u8::try_from(self.u64(field)?)
            .map(AvFlags::from_bits)
            .map_err(|_| self.wrong_type(field, "8-bit flags"))
    }

    fn str(&self, field: &'static str) -> Result<&'a str, ProtocolError> {
        self.get(field)?
            .as_str()
            .ok_or_else(|| self.wrong_type(field, "string"))
    }

    fn array(&self, field: &'static str) -> Result<&'a Vec<Value>, ProtocolError> {
        self.get(field)?
            .as_array()
            .ok_or_else(|| self.wrong_type(field, "array"))
    }

    fn opt_array(&self, field: &'static str) -> Result<Option<&'a Vec<Value>>, ProtocolError> {
        match self.obj.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.array(field).map(Some),
        }
    }

    fn object_value(&self, field: &'static str) -> Result<&'a Value, ProtocolError> {
        let value = self.get(field)?;
        if value.is_object() {
            Ok(value)
        } else {
            Err(self.wrong_type(field, "object"))
        }
    }

    fn opt_object(
        &self,
        field: &'static str,
    ) -> Result<Option<&'a Map<String, Value>>, ProtocolError> {
        match self.obj.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_object()
                .map(Some)
                .ok_or_else(|| self.wrong_type(field, "object")),
        }
    }

    fn cid_list(&self, field: &'static str) -> Result<Vec<Cid>, ProtocolError> {
        self.array(field)?
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|c| Cid::try_from(c).ok())
                    .ok_or_else(|| self.wrong_type(field, "array of cids"))
            })
            .collect()
    }
}

/// Encodes key material the way `KEY` frames carry it.
pub fn encode_key(key: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<IncomingFrame, ProtocolError> {
        parse_frame(value.to_string().as_bytes())
    }

    fn command(value: Value) -> Command {
        match parse(value).unwrap() {
            IncomingFrame::Command(cmd) => cmd,
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_av() {
        assert_eq!(
            command(json!({"a": "AV", "cid": 5, "av": 3})),
            Command::Av {
                cid: 5,
                av: AvFlags::from_bits(3)
            }
        );
    }

    #[test]
    fn test_parse_answer() {
        let cmd = command(json!({
            "a": "ANSWER",
            "cid": 7,
            "t": 1_700_000_000_000u64,
            "sdp": {"cmn": "v=0\r\n", "tracks": []},
            "peers": [{"cid": 7, "userId": "U1", "av": 1}],
            "speakers": {"7": {"audio": {"mid": 3, "iv": "0000000000000001"}}},
            "vthumbs": {"9": {"mid": 4, "iv": "00000000000000ff"}},
            "mods": ["U1"]
        }));
        let Command::Answer(answer) = cmd else {
            panic!("not an answer");
        };
        assert_eq!(answer.cid, 7);
        assert_eq!(answer.ts, 1_700_000_000_000);
        assert_eq!(
            answer.peers,
            vec![PeerInfo {
                cid: 7,
                user_id: UserId::from("U1"),
                av: AvFlags::from_bits(1)
            }]
        );
        assert_eq!(answer.speakers[&7].mid, 3);
        assert_eq!(answer.speakers[&7].iv, InitVector(1));
        assert_eq!(answer.vthumbs[&9].iv, InitVector(0xff));
        assert_eq!(answer.moderators, vec![UserId::from("U1")]);
    }

    #[test]
    fn test_parse_track_lists() {
        let cmd = command(json!({
            "a": "HIRES",
            "tracks": [
                {"cid": 2, "mid": 5, "iv": "0000000000000010", "r": 1},
                {"cid": 3, "mid": 6, "iv": "0000000000000020"}
            ]
        }));
        let Command::Hires { tracks } = cmd else {
            panic!("not HIRES");
        };
        assert_eq!(tracks.len(), 2);
        assert!(tracks[0].track.reuse);
        assert!(!tracks[1].track.reuse);
        assert_eq!(tracks[1].cid, 3);
        assert_eq!(tracks[1].track.mid, 6);
    }

    #[test]
    fn test_parse_key() {
        let key = [7u8; 16];
        let cmd = command(json!({"a": "KEY", "id": 4, "from": 2, "key": encode_key(&key)}));
        assert_eq!(
            cmd,
            Command::Key {
                id: 4,
                from: 2,
                key: key.to_vec()
            }
        );
    }

    #[test]
    fn test_speak_on_without_cid_is_ours() {
        assert_eq!(
            command(json!({"a": "SPEAK_ON"})),
            Command::SpeakOn {
                cid: None,
                audio: None
            }
        );
        assert!(parse(json!({"a": "SPEAK_ON", "cid": 3})).is_err());
    }

    #[test]
    fn test_error_frame_is_not_a_command() {
        assert_eq!(
            parse(json!({"err": 403, "msg": "denied"})).unwrap(),
            IncomingFrame::Error(RelayErrorFrame {
                code: 403,
                msg: Some("denied".into())
            })
        );
        assert_eq!(
            parse(json!({"err": -1})).unwrap(),
            IncomingFrame::Error(RelayErrorFrame { code: -1, msg: None })
        );
    }

    #[test]
    fn test_malformed_frames_fail_without_panicking() {
        assert_eq!(
            parse(json!({"a": "AV", "cid": 5})),
            Err(ProtocolError::MissingField {
                command: "AV",
                field: "av"
            })
        );
        assert!(matches!(
            parse(json!({"a": "AV", "cid": "5", "av": 1})),
            Err(ProtocolError::WrongType { field: "cid", .. })
        ));
        assert!(matches!(
            parse(json!({"a": "PEERJOIN", "cid": 1, "userId": 5, "av": 0})),
            Err(ProtocolError::WrongType { field: "userId", .. })
        ));
        assert!(matches!(
            parse(json!({"a": "NOPE"})),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert_eq!(parse(json!([1, 2])), Err(ProtocolError::NotAnObject));
        assert_eq!(parse(json!({"cid": 1})), Err(ProtocolError::MissingCommandName));
        assert!(matches!(
            parse_frame(b"{not json"),
            Err(ProtocolError::MalformedJson(_))
        ));
        assert!(matches!(
            parse(json!({"a": "VTHUMBS", "tracks": [{"cid": 1, "mid": 2, "iv": "xyz"}]})),
            Err(ProtocolError::InvalidHex(_))
        ));
    }
}
