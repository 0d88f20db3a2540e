use std::net::IpAddr;

/// Transport component of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Rtp = 1,
    Rtcp = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Multicast,
}

/// A transport address the transmitter can send from or to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: Component,
    pub ip: IpAddr,
    pub port: u16,
    /// Base address of reflexive and relayed candidates
    pub base: Option<(IpAddr, u16)>,
    pub protocol: CandidateProtocol,
    pub priority: u32,
    pub typ: CandidateType,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Multicast TTL
    pub ttl: u8,
}

impl Candidate {
    pub fn host(foundation: impl Into<String>, component: Component, ip: IpAddr, port: u16) -> Self {
        Self {
            foundation: foundation.into(),
            component,
            ip,
            port,
            base: None,
            protocol: CandidateProtocol::Udp,
            priority: 0,
            typ: CandidateType::Host,
            username: None,
            password: None,
            ttl: 0,
        }
    }
}

/// Connectivity state of a transport component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Failed,
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Ready,
}
