//! NAT classification from locally discovered candidates.
//!
//! This is a diagnostic heuristic. It never decides whether a session can
//! work; it only shapes status text and how eagerly the coordinator restarts
//! ICE after a connectivity loss.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::signaling::candidate::{CandidateInfo, CandidateType};

/// Upper bound for the restart backoff
const MAX_RESTART_DELAY: Duration = Duration::from_secs(8);

/// Inferred kind of address translation in front of this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatCategory {
    /// No reflexive candidates but host candidates exist (public address or LAN only)
    Open,
    /// One stable public mapping
    Cone,
    /// Mapping varies per destination port but the public address is stable
    Restricted,
    /// Mapping varies per destination
    Symmetric,
    /// Discovery produced nothing usable
    #[default]
    Unknown,
}

/// Classify the NAT from the candidates gathered for one negotiation attempt.
pub fn classify(candidates: &[CandidateInfo]) -> NatCategory {
    let reflexive: Vec<&CandidateInfo> = candidates
        .iter()
        .filter(|c| c.kind == CandidateType::ServerReflexive)
        .collect();

    if reflexive.is_empty() {
        let has_host = candidates.iter().any(|c| c.kind == CandidateType::Host);
        return if has_host {
            NatCategory::Open
        } else {
            NatCategory::Unknown
        };
    }

    let pairs: HashSet<(&str, u16)> = reflexive
        .iter()
        .map(|c| (c.address.as_str(), c.port))
        .collect();
    let addresses: HashSet<&str> = reflexive.iter().map(|c| c.address.as_str()).collect();

    if pairs.len() == 1 {
        NatCategory::Cone
    } else if pairs.len() >= 3 {
        NatCategory::Symmetric
    } else if addresses.len() == 1 {
        NatCategory::Restricted
    } else {
        // Two mappings on two addresses: not enough evidence either way
        NatCategory::Restricted
    }
}

impl NatCategory {
    /// Short explanation suitable for the status line
    pub fn description(&self) -> &'static str {
        match self {
            NatCategory::Open => "no NAT detected (host candidates only)",
            NatCategory::Cone => "cone NAT (stable public mapping)",
            NatCategory::Restricted => "restricted NAT (port-dependent mapping)",
            NatCategory::Symmetric => "symmetric NAT (mapping changes per destination)",
            NatCategory::Unknown => "unknown (endpoint discovery may be blocked)",
        }
    }

    fn backoff_base(&self) -> Duration {
        match self {
            NatCategory::Open | NatCategory::Cone => Duration::from_millis(500),
            NatCategory::Restricted | NatCategory::Unknown => Duration::from_secs(1),
            NatCategory::Symmetric => Duration::from_secs(2),
        }
    }

    /// Delay before restart attempt `attempt` (1-based).
    ///
    /// Hard NATs back off longer since a fresh ICE round rarely helps them.
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        self.backoff_base()
            .saturating_mul(attempt.max(1))
            .min(MAX_RESTART_DELAY)
    }

    /// Advice shown once automatic restarts are exhausted
    pub fn fallback_advice(&self) -> String {
        match self {
            NatCategory::Symmetric => format!(
                "Local network looks like {}. Direct connections rarely survive this; \
                 retry with a TURN relay (--turn-url).",
                self.description()
            ),
            NatCategory::Unknown => format!(
                "Local network is {}. Check that UDP is allowed, or retry with a TURN relay (--turn-url).",
                self.description()
            ),
            _ => format!(
                "Local network looks like {}. The remote side may be behind a stricter NAT; \
                 a TURN relay (--turn-url) is likely required.",
                self.description()
            ),
        }
    }
}

impl fmt::Display for NatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatCategory::Open => "open",
            NatCategory::Cone => "cone",
            NatCategory::Restricted => "restricted",
            NatCategory::Symmetric => "symmetric",
            NatCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
