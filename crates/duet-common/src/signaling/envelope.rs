//! Signaling envelopes exchanged through the relay.
//!
//! Wire shape: `{"kind": "...", "from": "...", "to": "...", "payload": ...}`
//! with `to` and `payload` optional. Offer/answer payloads carry the session
//! description plus every candidate gathered for it; `ice` carries one
//! candidate and `ice-batch` an ordered list.

use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::candidate::CandidatePayload;

/// Identity of one running instance, generated once at startup
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    /// Generate a random identity (8 bytes, hex encoded)
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 8] = rng.gen();
        Self(hex::encode(bytes))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Join,
    Offer,
    Answer,
    Ice,
    IceBatch,
    Ready,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Join => "join",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
            SignalKind::IceBatch => "ice-batch",
            SignalKind::Ready => "ready",
        }
    }
}

/// SDP payload for offer/answer exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    #[serde(default)]
    pub candidates: Vec<CandidatePayload>,
    #[serde(default)]
    pub ice_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    pub from: PeerIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl SignalEnvelope {
    fn bare(kind: SignalKind, from: &PeerIdentity, to: Option<&PeerIdentity>) -> Self {
        Self {
            kind,
            from: from.clone(),
            to: to.cloned(),
            payload: None,
        }
    }

    fn with_payload<T: Serialize>(
        kind: SignalKind,
        from: &PeerIdentity,
        to: Option<&PeerIdentity>,
        payload: &T,
    ) -> Result<Self> {
        let value = serde_json::to_value(payload)
            .with_context(|| format!("Failed to serialize {} payload", kind.as_str()))?;
        Ok(Self {
            payload: Some(value),
            ..Self::bare(kind, from, to)
        })
    }

    /// Broadcast join request (no target yet) or a restart prompt to a known peer
    pub fn join(from: &PeerIdentity, to: Option<&PeerIdentity>) -> Self {
        Self::bare(SignalKind::Join, from, to)
    }

    pub fn ready(from: &PeerIdentity, to: &PeerIdentity) -> Self {
        Self::bare(SignalKind::Ready, from, Some(to))
    }

    pub fn offer(from: &PeerIdentity, to: &PeerIdentity, payload: &DescriptionPayload) -> Result<Self> {
        Self::with_payload(SignalKind::Offer, from, Some(to), payload)
    }

    pub fn answer(from: &PeerIdentity, to: &PeerIdentity, payload: &DescriptionPayload) -> Result<Self> {
        Self::with_payload(SignalKind::Answer, from, Some(to), payload)
    }

    pub fn ice(from: &PeerIdentity, to: &PeerIdentity, candidate: &CandidatePayload) -> Result<Self> {
        Self::with_payload(SignalKind::Ice, from, Some(to), candidate)
    }

    pub fn ice_batch(
        from: &PeerIdentity,
        to: &PeerIdentity,
        candidates: &[CandidatePayload],
    ) -> Result<Self> {
        Self::with_payload(SignalKind::IceBatch, from, Some(to), &candidates)
    }

    /// Serialize to the JSON wire form
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize signaling envelope")
    }

    /// Parse the JSON wire form
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Malformed signaling envelope")
    }

    fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let value = self
            .payload
            .clone()
            .with_context(|| format!("'{}' envelope has no payload", self.kind.as_str()))?;
        serde_json::from_value(value)
            .with_context(|| format!("Malformed '{}' payload", self.kind.as_str()))
    }

    /// Session description of an offer or answer
    pub fn description(&self) -> Result<DescriptionPayload> {
        match self.kind {
            SignalKind::Offer | SignalKind::Answer => self.payload_as(),
            other => anyhow::bail!("'{}' envelope carries no description", other.as_str()),
        }
    }

    /// Candidates carried by an `ice` or `ice-batch` envelope
    pub fn candidates(&self) -> Result<Vec<CandidatePayload>> {
        match self.kind {
            SignalKind::Ice => Ok(vec![self.payload_as()?]),
            SignalKind::IceBatch => self.payload_as(),
            other => anyhow::bail!("'{}' envelope carries no candidates", other.as_str()),
        }
    }

    /// True if this envelope should be processed by `local`.
    ///
    /// Echoes of our own publications and envelopes addressed to somebody
    /// else are rejected.
    pub fn is_for(&self, local: &PeerIdentity) -> bool {
        if &self.from == local {
            return false;
        }
        match &self.to {
            Some(to) => to == local,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (PeerIdentity, PeerIdentity) {
        (PeerIdentity::new("aaaa"), PeerIdentity::new("bbbb"))
    }

    #[test]
    fn test_join_wire_shape_has_no_payload() {
        let (a, _) = ids();
        let raw = SignalEnvelope::join(&a, None).encode().unwrap();
        assert_eq!(raw, r#"{"kind":"join","from":"aaaa"}"#);
    }

    #[test]
    fn test_ice_batch_kind_is_kebab_case() {
        let (a, b) = ids();
        let candidate = CandidatePayload {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        };
        let env = SignalEnvelope::ice_batch(&a, &b, &[candidate.clone()]).unwrap();
        let raw = env.encode().unwrap();
        assert!(raw.contains(r#""kind":"ice-batch""#));
        assert!(raw.contains(r#""sdpMLineIndex":0"#));

        let decoded = SignalEnvelope::decode(&raw).unwrap();
        assert_eq!(decoded.candidates().unwrap(), vec![candidate]);
    }

    #[test]
    fn test_offer_description() {
        let (a, b) = ids();
        let payload = DescriptionPayload {
            sdp: "v=0\r\n".to_string(),
            sdp_type: "offer".to_string(),
            candidates: vec![],
            ice_restart: true,
        };
        let env = SignalEnvelope::offer(&a, &b, &payload).unwrap();
        let decoded = SignalEnvelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.description().unwrap(), payload);
    }

    #[test]
    fn test_description_without_restart_flag_defaults_false() {
        let raw = r#"{"kind":"answer","from":"bbbb","to":"aaaa","payload":{"sdp":"v=0","type":"answer"}}"#;
        let env = SignalEnvelope::decode(raw).unwrap();
        let desc = env.description().unwrap();
        assert!(!desc.ice_restart);
        assert!(desc.candidates.is_empty());
    }

    #[test]
    fn test_malformed_inputs_are_errors() {
        assert!(SignalEnvelope::decode("not json").is_err());
        assert!(SignalEnvelope::decode(r#"{"kind":"wave","from":"a"}"#).is_err());
        assert!(SignalEnvelope::decode(r#"{"kind":"join"}"#).is_err());

        let no_payload = SignalEnvelope::decode(r#"{"kind":"offer","from":"a","to":"b"}"#).unwrap();
        assert!(no_payload.description().is_err());

        let bad_payload =
            SignalEnvelope::decode(r#"{"kind":"ice","from":"a","to":"b","payload":42}"#).unwrap();
        assert!(bad_payload.candidates().is_err());
    }

    #[test]
    fn test_addressing_filter() {
        let (a, b) = ids();
        let c = PeerIdentity::new("cccc");

        assert!(SignalEnvelope::join(&b, None).is_for(&a));
        assert!(SignalEnvelope::ready(&b, &a).is_for(&a));
        assert!(!SignalEnvelope::ready(&b, &c).is_for(&a), "addressed elsewhere");
        assert!(!SignalEnvelope::join(&a, None).is_for(&a), "own echo");
    }

    #[test]
    fn test_generated_identities_differ() {
        let a = PeerIdentity::generate();
        let b = PeerIdentity::generate();
        assert_eq!(a.as_str().len(), 16);
        assert_ne!(a, b);
    }
}
