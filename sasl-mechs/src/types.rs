use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use sasl_core::MechanismInfo;

use super::decode::mechanism_name;

/// Mechanisms provided by `BuiltinEngine`, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    External,
    Plain,
    Login,
    Anonymous,
}

impl Mechanism {
    pub const ALL: [Mechanism; 4] = [
        Mechanism::External,
        Mechanism::Plain,
        Mechanism::Login,
        Mechanism::Anonymous,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::External => "EXTERNAL",
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::Anonymous => "ANONYMOUS",
        }
    }

    pub fn info(&self) -> MechanismInfo {
        let info = MechanismInfo::new(self.name());
        match self {
            Self::External => info.with_external().with_proxy(),
            Self::Plain => info.with_username().with_credential().with_proxy(),
            Self::Login => info.with_username().with_credential(),
            Self::Anonymous => info,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mechanism {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        mechanism_name(s).ok_or_else(|| anyhow!("Unsupported mechanism {}", s))
    }
}
