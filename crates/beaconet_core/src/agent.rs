use serde::Serialize;

/// Known consensus client implementations, detected from the identify
/// protocol's AgentVersion string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Lighthouse,
    Prysm,
    Teku,
    Lodestar,
    Grandine,
    Nimbus,
    #[default]
    Unknown,
}

impl AgentKind {
    /// Lowercased substring match, e.g. "Lighthouse/v4.5.0-aa022f4/x86_64-linux".
    pub fn detect(agent_version: &str) -> AgentKind {
        let lower = agent_version.to_lowercase();
        const KNOWN: &[(&str, AgentKind)] = &[
            ("lighthouse", AgentKind::Lighthouse),
            ("prysm", AgentKind::Prysm),
            ("teku", AgentKind::Teku),
            ("lodestar", AgentKind::Lodestar),
            ("grandine", AgentKind::Grandine),
            ("nimbus", AgentKind::Nimbus),
        ];
        for (needle, kind) in KNOWN {
            if lower.contains(needle) {
                return *kind;
            }
        }
        AgentKind::Unknown
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::Lighthouse => "lighthouse",
            AgentKind::Prysm => "prysm",
            AgentKind::Teku => "teku",
            AgentKind::Lodestar => "lodestar",
            AgentKind::Grandine => "grandine",
            AgentKind::Nimbus => "nimbus",
            AgentKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
