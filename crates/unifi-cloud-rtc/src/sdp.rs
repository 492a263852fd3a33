//! Candidate selection over SDP text.
//!
//! Everything here is pure and synchronous. Lines keep their original
//! terminators so untouched lines render byte-for-byte.

use std::fmt;
use std::net::Ipv6Addr;

use crate::error::{CloudError, CloudResult};

const CANDIDATE_PREFIX: &str = "a=candidate:";
/// Connection line the engine emits before ICE has resolved an address.
pub const PLACEHOLDER_CONNECTION: &str = "c=IN IP4 0.0.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdpDocument {
    lines: Vec<String>,
}

impl SdpDocument {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.split_inclusive('\n').map(str::to_string).collect(),
        }
    }

    /// Lines without their terminators.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|line| content_of(line))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn candidates(&self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.lines().filter_map(IceCandidate::parse)
    }
}

impl fmt::Display for SdpDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            f.write_str(line)?;
        }
        Ok(())
    }
}

fn content_of(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}

fn terminator_of(line: &str) -> &str {
    &line[content_of(line).len()..]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Other(String),
}

impl TransportProtocol {
    fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("udp") {
            TransportProtocol::Udp
        } else if token.eq_ignore_ascii_case("tcp") {
            TransportProtocol::Tcp
        } else {
            TransportProtocol::Other(token.to_string())
        }
    }
}

/// One `a=candidate:` line, tokenized.
///
/// Layout: `a=candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub transport: TransportProtocol,
    pub priority: u64,
    pub address: String,
    pub port: u16,
    pub raw: String,
}

impl IceCandidate {
    /// Returns `None` for non-candidate lines and for candidate lines whose
    /// priority or port are not numeric.
    pub fn parse(line: &str) -> Option<Self> {
        let line = content_of(line);
        let body = line.strip_prefix(CANDIDATE_PREFIX)?;
        let mut tokens = body.split_whitespace();
        let _foundation = tokens.next()?;
        let _component = tokens.next()?;
        let transport = TransportProtocol::from_token(tokens.next()?);
        let priority = tokens.next()?.parse::<u64>().ok()?;
        let address = tokens.next()?.to_string();
        let port = tokens.next()?.parse::<u16>().ok()?;
        Some(Self {
            transport,
            priority,
            address,
            port,
            raw: line.to_string(),
        })
    }
}

fn transport_token(line: &str) -> Option<&str> {
    content_of(line)
        .strip_prefix(CANDIDATE_PREFIX)?
        .split_whitespace()
        .nth(2)
}

/// Drops every candidate line whose transport token is `tcp`; everything
/// else keeps its position and bytes.
pub fn strip_tcp_candidates(sdp: &SdpDocument) -> SdpDocument {
    let lines = sdp
        .lines
        .iter()
        .filter(|line| {
            !transport_token(line).is_some_and(|token| token.eq_ignore_ascii_case("tcp"))
        })
        .cloned()
        .collect();
    SdpDocument { lines }
}

/// Highest-priority UDP candidate; the earliest one wins a tie.
pub fn select_best_udp_candidate(sdp: &SdpDocument) -> CloudResult<IceCandidate> {
    let mut best: Option<IceCandidate> = None;
    for line in sdp.lines() {
        let Some(candidate) = IceCandidate::parse(line) else {
            if transport_token(line).is_some_and(|token| token.eq_ignore_ascii_case("udp")) {
                tracing::warn!(
                    target: "unifi_cloud::negotiation",
                    line,
                    "skipping unparsable udp candidate"
                );
            }
            continue;
        };
        if candidate.transport != TransportProtocol::Udp {
            continue;
        }
        match &best {
            Some(current) if current.priority >= candidate.priority => {}
            _ => best = Some(candidate),
        }
    }
    best.ok_or(CloudError::NoCandidate)
}

/// Points the placeholder connection line at `candidate`.
pub fn rewrite_connection_address(
    sdp: &SdpDocument,
    candidate: &IceCandidate,
) -> CloudResult<SdpDocument> {
    let positions: Vec<usize> = sdp
        .lines
        .iter()
        .enumerate()
        .filter(|(_, line)| content_of(line) == PLACEHOLDER_CONNECTION)
        .map(|(index, _)| index)
        .collect();
    let index = match positions.as_slice() {
        [index] => *index,
        [] => {
            return Err(CloudError::MalformedSdp(format!(
                "no `{PLACEHOLDER_CONNECTION}` line to rewrite"
            )));
        }
        many => {
            return Err(CloudError::MalformedSdp(format!(
                "{} `{PLACEHOLDER_CONNECTION}` lines; rewrite target is ambiguous",
                many.len()
            )));
        }
    };

    let family = if candidate.address.parse::<Ipv6Addr>().is_ok() {
        "IP6"
    } else {
        "IP4"
    };
    let mut lines = sdp.lines.clone();
    let terminator = terminator_of(&lines[index]).to_string();
    lines[index] = format!("c=IN {family} {}{terminator}", candidate.address);
    Ok(SdpDocument { lines })
}
