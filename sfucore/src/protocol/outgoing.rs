//! Client to relay commands.

use serde_json::{Map, Value, json};

use super::COMMAND_FIELD;
use super::incoming::encode_key;
use crate::sdp::Sdp;
use crate::types::{AvFlags, Cid, InitVector, KeyId};

/// IVs of our three send tracks, announced in `JOIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendIvs {
    pub vthumb: InitVector,
    pub hires: InitVector,
    pub audio: InitVector,
}

impl SendIvs {
    pub fn random() -> Self {
        Self {
            vthumb: InitVector::random(),
            hires: InitVector::random(),
            audio: InitVector::random(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingCommand {
    Join {
        sdp: Sdp,
        ivs: SendIvs,
        av: AvFlags,
        /// Ask to be a speaker right away.
        speaker: bool,
        /// Number of low resolution streams we want pushed without asking.
        vthumbs: Option<u32>,
    },
    /// One encrypted copy of a rotated key per recipient.
    Key {
        id: KeyId,
        data: Vec<(Cid, Vec<u8>)>,
    },
    Av {
        av: AvFlags,
    },
    GetVthumbs {
        cids: Vec<Cid>,
    },
    DelVthumbs {
        cids: Vec<Cid>,
    },
    GetHires {
        cid: Cid,
        /// Re-use the low resolution track already received for `cid`.
        reuse: bool,
        quality: u8,
    },
    DelHires {
        cids: Vec<Cid>,
    },
    HiresSetLo {
        cid: Cid,
        quality: u8,
    },
    Layer {
        spatial: u8,
        temporal: u8,
        screen_temporal: u8,
    },
    /// Without a cid: our own request. With one: a moderator grant.
    SpeakRequest {
        cid: Option<Cid>,
    },
    SpeakRequestDel {
        cid: Option<Cid>,
    },
    SpeakerDel {
        cid: Option<Cid>,
    },
}

impl OutgoingCommand {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "JOIN",
            Self::Key { .. } => "KEY",
            Self::Av { .. } => "AV",
            Self::GetVthumbs { .. } => "GET_VTHUMBS",
            Self::DelVthumbs { .. } => "DEL_VTHUMBS",
            Self::GetHires { .. } => "GET_HIRES",
            Self::DelHires { .. } => "DEL_HIRES",
            Self::HiresSetLo { .. } => "HIRES_SET_LO",
            Self::Layer { .. } => "LAYER",
            Self::SpeakRequest { .. } => "SPEAK_RQ",
            Self::SpeakRequestDel { .. } => "SPEAK_RQ_DEL",
            Self::SpeakerDel { .. } => "SPEAKER_DEL",
        }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(COMMAND_FIELD.to_string(), Value::from(self.name()));

        match self {
            Self::Join {
                sdp,
                ivs,
                av,
                speaker,
                vthumbs,
            } => {
                obj.insert("sdp".into(), json!(sdp));
                obj.insert(
                    "ivs".into(),
                    json!({
                        "0": ivs.vthumb.to_hex(),
                        "1": ivs.hires.to_hex(),
                        "2": ivs.audio.to_hex(),
                    }),
                );
                obj.insert("av".into(), json!(av.bits()));
                if *speaker {
                    obj.insert("spk".into(), json!(1));
                }
                if let Some(n) = vthumbs {
                    obj.insert("vthumbs".into(), json!(n));
                }
            }
            Self::Key { id, data } => {
                let data: Vec<Value> = data
                    .iter()
                    .map(|(cid, key)| json!([cid, encode_key(key)]))
                    .collect();
                obj.insert("id".into(), json!(id));
                obj.insert("data".into(), Value::Array(data));
            }
            Self::Av { av } => {
                obj.insert("av".into(), json!(av.bits()));
            }
            Self::GetVthumbs { cids } | Self::DelVthumbs { cids } | Self::DelHires { cids } => {
                obj.insert("cids".into(), json!(cids));
            }
            Self::GetHires {
                cid,
                reuse,
                quality,
            } => {
                obj.insert("cid".into(), json!(cid));
                if *reuse {
                    obj.insert("r".into(), json!(1));
                }
                obj.insert("lo".into(), json!(quality));
            }
            Self::HiresSetLo { cid, quality } => {
                obj.insert("cid".into(), json!(cid));
                obj.insert("lo".into(), json!(quality));
            }
            Self::Layer {
                spatial,
                temporal,
                screen_temporal,
            } => {
                obj.insert("spt".into(), json!(spatial));
                obj.insert("tmp".into(), json!(temporal));
                obj.insert("stmp".into(), json!(screen_temporal));
            }
            Self::SpeakRequest { cid }
            | Self::SpeakRequestDel { cid }
            | Self::SpeakerDel { cid } => {
                if let Some(cid) = cid {
                    obj.insert("cid".into(), json!(cid));
                }
            }
        }
        Value::Object(obj)
    }

    /// Serialized frame ready for the transport.
    pub fn to_frame(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame() {
        let ivs = SendIvs {
            vthumb: InitVector(1),
            hires: InitVector(2),
            audio: InitVector(3),
        };
        let cmd = OutgoingCommand::Join {
            sdp: Sdp {
                common: "v=0\r\n".into(),
                ..Default::default()
            },
            ivs,
            av: AvFlags::new(true, true),
            speaker: false,
            vthumbs: Some(10),
        };
        let json = cmd.to_json();
        assert_eq!(json["a"], "JOIN");
        assert_eq!(json["sdp"]["cmn"], "v=0\r\n");
        assert_eq!(json["ivs"]["0"], "0000000000000001");
        assert_eq!(json["ivs"]["2"], "0000000000000003");
        assert_eq!(json["av"], 3);
        assert_eq!(json["vthumbs"], 10);
        assert!(json.get("spk").is_none());
    }

    #[test]
    fn test_key_frame() {
        let cmd = OutgoingCommand::Key {
            id: 2,
            data: vec![(5, vec![0u8; 16]), (6, vec![1u8; 16])],
        };
        let json = cmd.to_json();
        assert_eq!(json["a"], "KEY");
        assert_eq!(json["id"], 2);
        assert_eq!(json["data"][0][0], 5);
        assert_eq!(json["data"][1][1], encode_key(&[1u8; 16]));
    }

    #[test]
    fn test_optional_cid_fields() {
        let own = OutgoingCommand::SpeakRequest { cid: None }.to_json();
        assert_eq!(own, json!({"a": "SPEAK_RQ"}));

        let grant = OutgoingCommand::SpeakRequestDel { cid: Some(4) }.to_json();
        assert_eq!(grant, json!({"a": "SPEAK_RQ_DEL", "cid": 4}));

        let revoke = OutgoingCommand::SpeakerDel { cid: Some(9) }.to_json();
        assert_eq!(revoke, json!({"a": "SPEAKER_DEL", "cid": 9}));
    }

    #[test]
    fn test_resolution_frames() {
        assert_eq!(
            OutgoingCommand::GetHires {
                cid: 3,
                reuse: true,
                quality: 1
            }
            .to_json(),
            json!({"a": "GET_HIRES", "cid": 3, "r": 1, "lo": 1})
        );
        assert_eq!(
            OutgoingCommand::GetHires {
                cid: 3,
                reuse: false,
                quality: 0
            }
            .to_json(),
            json!({"a": "GET_HIRES", "cid": 3, "lo": 0})
        );
        assert_eq!(
            OutgoingCommand::DelVthumbs { cids: vec![1, 2] }.to_json(),
            json!({"a": "DEL_VTHUMBS", "cids": [1, 2]})
        );
        assert_eq!(
            OutgoingCommand::Layer {
                spatial: 2,
                temporal: 1,
                screen_temporal: 0
            }
            .to_json(),
            json!({"a": "LAYER", "spt": 2, "tmp": 1, "stmp": 0})
        );
    }
}
