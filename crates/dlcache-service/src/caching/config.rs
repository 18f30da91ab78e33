use std::fmt;

/// All known cache tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    Short,
    Long,
}

impl CacheTier {
    pub const ALL: [CacheTier; 2] = [CacheTier::Short, CacheTier::Long];
}

impl AsRef<str> for CacheTier {
    fn as_ref(&self) -> &str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
