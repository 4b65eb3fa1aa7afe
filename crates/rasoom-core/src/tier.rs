use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Participant class. Wire values: 1 = Prime, 2 = Domain, 3 = Micro.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Prime,
    Domain,
    Micro,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Prime, Tier::Domain, Tier::Micro];

    pub fn to_wire(self) -> u8 {
        match self {
            Tier::Prime => 1,
            Tier::Domain => 2,
            Tier::Micro => 3,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Tier::Prime),
            2 => Some(Tier::Domain),
            3 => Some(Tier::Micro),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Prime => "prime",
            Tier::Domain => "domain",
            Tier::Micro => "micro",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prime" | "1" => Ok(Tier::Prime),
            "domain" | "2" => Ok(Tier::Domain),
            "micro" | "3" => Ok(Tier::Micro),
            other => Err(format!("unknown tier '{other}' (expected prime, domain or micro)")),
        }
    }
}

/// Decision-tree resolution. Each resolution is bound to exactly one tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Strategic,
    Specialized,
    Atomic,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [
        Resolution::Strategic,
        Resolution::Specialized,
        Resolution::Atomic,
    ];

    pub fn tier(self) -> Tier {
        match self {
            Resolution::Strategic => Tier::Prime,
            Resolution::Specialized => Tier::Domain,
            Resolution::Atomic => Tier::Micro,
        }
    }

    pub fn max_depth(self) -> usize {
        match self {
            Resolution::Strategic => 3,
            Resolution::Specialized => 5,
            Resolution::Atomic => 8,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Resolution::Strategic => 0,
            Resolution::Specialized => 1,
            Resolution::Atomic => 2,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        Resolution::ALL.get(value as usize).copied()
    }
}
