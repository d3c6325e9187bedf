//! ICE candidate descriptors.
//!
//! Candidates travel between peers in the browser-compatible JSON shape
//! (`candidate`, `sdpMid`, `sdpMLineIndex`). Locally they are parsed once
//! into [`CandidateInfo`] so the NAT classifier can look at the type and
//! address without re-parsing SDP attribute strings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Candidate type as advertised by the `typ` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relay,
    PeerReflexive,
    Unknown,
}

impl CandidateType {
    fn from_sdp(typ: &str) -> Self {
        match typ {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::ServerReflexive,
            "relay" => CandidateType::Relay,
            "prflx" => CandidateType::PeerReflexive,
            _ => CandidateType::Unknown,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relay => "relay",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// ICE candidate payload as carried in signaling envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// A discovered (local) or advertised (remote) endpoint.
///
/// Built once from the raw SDP line and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfo {
    pub kind: CandidateType,
    pub protocol: String,
    pub address: String,
    pub port: u16,
    pub raw: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

impl CandidateInfo {
    /// Parse an SDP candidate attribute.
    ///
    /// Accepts both `candidate:...` and the bare form. Layout:
    /// `foundation component protocol priority address port typ <type> [...]`.
    pub fn parse(raw: &str, sdp_mid: Option<String>, sdp_m_line_index: Option<u16>) -> Result<Self> {
        let line = raw.trim();
        let attr = line.strip_prefix("a=").unwrap_or(line);
        let body = attr.strip_prefix("candidate:").unwrap_or(attr);

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 {
            anyhow::bail!("Candidate has {} fields, expected at least 8", fields.len());
        }
        if fields[6] != "typ" {
            anyhow::bail!("Candidate is missing the 'typ' attribute");
        }

        let port: u16 = fields[5]
            .parse()
            .with_context(|| format!("Invalid candidate port '{}'", fields[5]))?;

        Ok(Self {
            kind: CandidateType::from_sdp(fields[7]),
            protocol: fields[2].to_ascii_lowercase(),
            address: fields[4].to_string(),
            port,
            raw: line.to_string(),
            sdp_mid,
            sdp_m_line_index,
        })
    }

    /// Parse a candidate received over signaling.
    pub fn from_payload(payload: &CandidatePayload) -> Result<Self> {
        Self::parse(
            &payload.candidate,
            payload.sdp_mid.clone(),
            payload.sdp_m_line_index,
        )
    }

    /// Convert back to the signaling representation.
    pub fn to_payload(&self) -> CandidatePayload {
        CandidatePayload {
            candidate: self.raw.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_m_line_index: self.sdp_m_line_index,
        }
    }
}

impl fmt::Display for CandidateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}:{}", self.kind, self.protocol, self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_candidate() {
        let c = CandidateInfo::parse(
            "candidate:1966762134 1 udp 2122260223 192.168.1.20 54321 typ host generation 0",
            Some("0".to_string()),
            Some(0),
        )
        .unwrap();
        assert_eq!(c.kind, CandidateType::Host);
        assert_eq!(c.protocol, "udp");
        assert_eq!(c.address, "192.168.1.20");
        assert_eq!(c.port, 54321);
    }

    #[test]
    fn test_parse_srflx_candidate_without_prefix() {
        let c = CandidateInfo::parse(
            "842163049 1 UDP 1677729535 203.0.113.7 61000 typ srflx raddr 0.0.0.0 rport 0",
            None,
            None,
        )
        .unwrap();
        assert_eq!(c.kind, CandidateType::ServerReflexive);
        assert_eq!(c.protocol, "udp");
        assert_eq!(c.port, 61000);
    }

    #[test]
    fn test_unknown_type_is_kept() {
        let c = CandidateInfo::parse("candidate:1 1 udp 1 10.0.0.1 9 typ weird", None, None).unwrap();
        assert_eq!(c.kind, CandidateType::Unknown);
    }

    #[test]
    fn test_reject_malformed() {
        assert!(CandidateInfo::parse("candidate:1 1 udp", None, None).is_err());
        assert!(CandidateInfo::parse("candidate:1 1 udp 1 10.0.0.1 notaport typ host", None, None).is_err());
        assert!(CandidateInfo::parse("candidate:1 1 udp 1 10.0.0.1 9 kind host", None, None).is_err());
    }

    #[test]
    fn test_payload_roundtrip_keeps_mid() {
        let payload = CandidatePayload {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let info = CandidateInfo::from_payload(&payload).unwrap();
        assert_eq!(info.to_payload(), payload);
    }
}
