//! Compact session description codec.
//!
//! A full SDP offer is split into the session-level lines, one template per
//! media kind, and a small per-track delta. Only the deltas differ between the
//! media sections of a bundled offer, so the relay and the client exchange far
//! less text than the raw description.
//!
//! ```text
//! v=0 ... (common)
//! m=audio ... + codecs/extensions      -> audio template (captured once)
//!   a=mid / a=sendrecv / a=msid / a=ssrc -> Track delta
//! m=video ... + codecs/extensions      -> video template (captured once)
//!   a=mid / a=sendonly / a=ssrc-group    -> Track delta
//! ```

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Direction, TrackKind};

const LINE_END: &str = "\r\n";

/// Attributes that belong to one track instance and are never templated.
const TRACK_ATTRIBUTES: [&str; 8] = [
    "sendrecv",
    "sendonly",
    "recvonly",
    "inactive",
    "mid",
    "msid",
    "ssrc",
    "ssrc-group",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SdpError {
    #[error("session description is empty")]
    Empty,
    #[error("media section without a=mid")]
    MissingMid,
    #[error("invalid a=mid value: {0}")]
    InvalidMid(String),
    #[error("invalid ssrc line: {0}")]
    InvalidSsrc(String),
    #[error("no {0:?} template for track")]
    MissingTemplate(TrackKind),
    #[error("track is not eligible for simulcast: {0}")]
    NotSimulcastable(&'static str),
}

/// Per-track delta carried next to the shared templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    #[serde(rename = "t")]
    pub kind: TrackKind,
    pub mid: u32,
    #[serde(rename = "dir", default)]
    pub direction: Direction,
    #[serde(rename = "sid", default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    /// `(ssrc, cname)` pairs in first-seen order, unique by ssrc.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssrcs: Vec<(u64, String)>,
    /// Raw `ssrc-group` values, e.g. `FID 1111 2222`.
    #[serde(rename = "ssrcg", default, skip_serializing_if = "Vec::is_empty")]
    pub ssrc_groups: Vec<String>,
}

impl Track {
    fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            mid: 0,
            direction: Direction::default(),
            stream_id: None,
            track_id: None,
            ssrcs: Vec::new(),
            ssrc_groups: Vec::new(),
        }
    }

    fn add_ssrc(&mut self, id: u64, cname: Option<&str>) {
        if let Some(entry) = self.ssrcs.iter_mut().find(|(existing, _)| *existing == id) {
            if entry.1.is_empty()
                && let Some(cname) = cname
            {
                entry.1 = cname.to_string();
            }
            return;
        }
        self.ssrcs
            .push((id, cname.map(str::to_string).unwrap_or_default()));
    }
}

/// A session description reduced to templates plus track deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sdp {
    #[serde(rename = "cmn")]
    pub common: String,
    #[serde(rename = "atpl", default, skip_serializing_if = "Option::is_none")]
    pub audio_template: Option<String>,
    #[serde(rename = "vtpl", default, skip_serializing_if = "Option::is_none")]
    pub video_template: Option<String>,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

/// Splits `a=name:value` into `(name, value)`; flag attributes yield an empty value.
fn attribute(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix("a=")?;
    Some(match rest.split_once(':') {
        Some((name, value)) => (name, value),
        None => (rest, ""),
    })
}

fn is_track_attribute(line: &str) -> bool {
    attribute(line).is_some_and(|(name, _)| TRACK_ATTRIBUTES.contains(&name))
}

impl Sdp {
    /// Compresses a full session description.
    pub fn compress(full: &str) -> Result<Self, SdpError> {
        let lines: Vec<&str> = full.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return Err(SdpError::Empty);
        }

        let first_media = lines
            .iter()
            .position(|l| l.starts_with("m="))
            .unwrap_or(lines.len());

        let mut sdp = Sdp {
            common: join_lines(&lines[..first_media]),
            ..Default::default()
        };

        let mut start = first_media;
        while start < lines.len() {
            let end = lines[start + 1..]
                .iter()
                .position(|l| l.starts_with("m="))
                .map_or(lines.len(), |p| start + 1 + p);
            sdp.add_media_section(&lines[start..end])?;
            start = end;
        }

        debug!(
            target: "Sdp",
            "compressed {} bytes into {} tracks",
            full.len(),
            sdp.tracks.len()
        );
        Ok(sdp)
    }

    /// Sections other than audio and video (data channels) are left out.
    fn add_media_section(&mut self, section: &[&str]) -> Result<(), SdpError> {
        let Some(kind) = TrackKind::from_media_line(section[0]) else {
            debug!(target: "Sdp", "skipping media section {}", section[0]);
            return Ok(());
        };

        let template = match kind {
            TrackKind::Audio => &mut self.audio_template,
            TrackKind::Video => &mut self.video_template,
        };
        if template.is_none() {
            let kept: Vec<&str> = section
                .iter()
                .copied()
                .filter(|l| !is_track_attribute(l))
                .collect();
            *template = Some(join_lines(&kept));
        }

        self.tracks.push(parse_track(kind, section)?);
        Ok(())
    }

    /// Rebuilds the full session description.
    pub fn decompress(&self) -> Result<String, SdpError> {
        let mut out = String::with_capacity(self.common.len() + 512 * self.tracks.len());
        out.push_str(&self.common);

        for track in &self.tracks {
            let template = match track.kind {
                TrackKind::Audio => self.audio_template.as_deref(),
                TrackKind::Video => self.video_template.as_deref(),
            }
            .ok_or(SdpError::MissingTemplate(track.kind))?;

            out.push_str(template);
            push_line(&mut out, &format!("a=mid:{}", track.mid));
            push_line(&mut out, &format!("a={}", track.direction.as_str()));
            if let Some(sid) = &track.stream_id {
                let tid = track.track_id.as_deref().unwrap_or("-");
                push_line(&mut out, &format!("a=msid:{sid} {tid}"));
            }
            for group in &track.ssrc_groups {
                push_line(&mut out, &format!("a=ssrc-group:{group}"));
            }
            for (id, cname) in &track.ssrcs {
                if !cname.is_empty() {
                    push_line(&mut out, &format!("a=ssrc:{id} cname:{cname}"));
                }
                if let Some(sid) = &track.stream_id {
                    let tid = track.track_id.as_deref().unwrap_or("-");
                    push_line(&mut out, &format!("a=ssrc:{id} msid:{sid} {tid}"));
                }
            }
        }
        Ok(out)
    }

    /// Expands the single video/RTX ssrc pair of `tracks[index]` into three
    /// simulcast layers.
    pub fn munge_for_simulcast(&mut self, index: usize) -> Result<(), SdpError> {
        let track = self
            .tracks
            .get_mut(index)
            .ok_or(SdpError::NotSimulcastable("no track at index"))?;
        munge_track_for_simulcast(track)
    }
}

/// Rewrites a track carrying one video ssrc and one FID retransmission ssrc
/// into a `SIM` group of three video ssrcs, each with its own `FID` pair.
pub fn munge_track_for_simulcast(track: &mut Track) -> Result<(), SdpError> {
    if track.kind != TrackKind::Video {
        return Err(SdpError::NotSimulcastable("not a video track"));
    }
    if track.ssrcs.len() != 2 || track.ssrc_groups.len() != 1 {
        return Err(SdpError::NotSimulcastable(
            "expected exactly one video ssrc and one FID ssrc",
        ));
    }

    let mut fid = track.ssrc_groups[0].split_whitespace();
    let (video, rtx) = match (fid.next(), fid.next(), fid.next(), fid.next()) {
        (Some("FID"), Some(v), Some(r), None) => (
            v.parse::<u64>()
                .map_err(|_| SdpError::InvalidSsrc(v.to_string()))?,
            r.parse::<u64>()
                .map_err(|_| SdpError::InvalidSsrc(r.to_string()))?,
        ),
        _ => return Err(SdpError::NotSimulcastable("ssrc group is not FID")),
    };

    let cname_of = |id: u64| {
        track
            .ssrcs
            .iter()
            .find(|(s, _)| *s == id)
            .map(|(_, c)| c.clone())
    };
    let (Some(video_cname), Some(rtx_cname)) = (cname_of(video), cname_of(rtx)) else {
        return Err(SdpError::NotSimulcastable("FID group names unknown ssrcs"));
    };

    let layers: Vec<(u64, u64)> = (0..3).map(|i| (video + i, rtx + i)).collect();

    track.ssrcs = layers
        .iter()
        .flat_map(|&(v, r)| [(v, video_cname.clone()), (r, rtx_cname.clone())])
        .collect();

    let mut groups = Vec::with_capacity(4);
    groups.push(format!(
        "SIM {} {} {}",
        layers[0].0, layers[1].0, layers[2].0
    ));
    groups.extend(layers.iter().map(|(v, r)| format!("FID {v} {r}")));
    track.ssrc_groups = groups;
    Ok(())
}

fn parse_track(kind: TrackKind, section: &[&str]) -> Result<Track, SdpError> {
    let mut track = Track::new(kind);
    let mut mid = None;

    for line in section {
        let Some((name, value)) = attribute(line) else {
            continue;
        };
        match name {
            "mid" => {
                mid = Some(
                    value
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| SdpError::InvalidMid(value.to_string()))?,
                );
            }
            "msid" => {
                let mut parts = value.split_whitespace();
                track.stream_id = parts.next().map(str::to_string);
                track.track_id = parts.next().map(str::to_string);
            }
            "ssrc-group" => track.ssrc_groups.push(value.to_string()),
            "ssrc" => {
                let (id, rest) = value.split_once(' ').unwrap_or((value, ""));
                let id = id
                    .parse::<u64>()
                    .map_err(|_| SdpError::InvalidSsrc(line.to_string()))?;
                track.add_ssrc(id, rest.strip_prefix("cname:"));
            }
            other => {
                if let Some(direction) = Direction::parse(other) {
                    track.direction = direction;
                }
            }
        }
    }

    track.mid = mid.ok_or(SdpError::MissingMid)?;
    if track.ssrcs.iter().any(|(_, cname)| cname.is_empty()) {
        warn!(target: "Sdp", "track mid={} has ssrc without cname", track.mid);
    }
    Ok(track)
}

fn join_lines(lines: &[&str]) -> String {
    let mut out = String::new();
    for line in lines {
        push_line(&mut out, line);
    }
    out
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push_str(LINE_END);
}
