use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the marketplace a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Vendor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Vendor => "vendor",
        }
    }

    /// The role on the other end of a support conversation.
    pub fn counterpart(&self) -> Role {
        match self {
            Role::User => Role::Vendor,
            Role::Vendor => Role::User,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "vendor" => Ok(Role::Vendor),
            other => anyhow::bail!("unknown role: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
        }
    }

    pub fn user(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, Role::User)
    }

    pub fn vendor(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, Role::Vendor)
    }

    /// Name shown to the other side; falls back to the id when no name was supplied.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Same account, ignoring the display name.
    pub fn same_account(&self, other: &Identity) -> bool {
        self.id == other.id && self.role == other.role
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.display_name(), self.role, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Vendor".parse::<Role>().unwrap(), Role::Vendor);
        assert_eq!(" user ".parse::<Role>().unwrap(), Role::User);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let anon = Identity::user("u-1", "");
        assert_eq!(anon.display_name(), "u-1");
        let named = Identity::vendor("v-1", "Blue Lagoon Tours");
        assert_eq!(named.display_name(), "Blue Lagoon Tours");
        assert_eq!(named.to_string(), "Blue Lagoon Tours (vendor:v-1)");
    }
}
