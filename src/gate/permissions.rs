//! Permission vocabulary and named tiers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// One class of gated operation. The vocabulary is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    ReadMail,
    WriteMail,
    WriteDraft,
    ReadCalendar,
    WriteCalendar,
    ReadContacts,
    WriteContacts,
    ReadFiles,
    WriteFiles,
    ReadSharepoint,
    /// Satisfies every permission check
    Admin,
}

impl Permission {
    pub const ALL: [Permission; 11] = [
        Permission::ReadMail,
        Permission::WriteMail,
        Permission::WriteDraft,
        Permission::ReadCalendar,
        Permission::WriteCalendar,
        Permission::ReadContacts,
        Permission::WriteContacts,
        Permission::ReadFiles,
        Permission::WriteFiles,
        Permission::ReadSharepoint,
        Permission::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadMail => "read:mail",
            Permission::WriteMail => "write:mail",
            Permission::WriteDraft => "write:draft",
            Permission::ReadCalendar => "read:calendar",
            Permission::WriteCalendar => "write:calendar",
            Permission::ReadContacts => "read:contacts",
            Permission::WriteContacts => "write:contacts",
            Permission::ReadFiles => "read:files",
            Permission::WriteFiles => "write:files",
            Permission::ReadSharepoint => "read:sharepoint",
            Permission::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown permission token
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownPermission(pub String);

impl std::fmt::Display for UnknownPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unknown permission '{}'", self.0)
    }
}

impl std::error::Error for UnknownPermission {}

impl FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPermission(s.to_string()))
    }
}

impl TryFrom<String> for Permission {
    type Error = UnknownPermission;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.as_str().to_string()
    }
}

/// Parses a list of permission tokens.
///
/// On failure returns every invalid token, sorted and de-duplicated.
pub fn parse_permissions(tokens: &[String]) -> Result<BTreeSet<Permission>, Vec<String>> {
    let mut valid = BTreeSet::new();
    let mut invalid = BTreeSet::new();

    for token in tokens {
        match token.parse::<Permission>() {
            Ok(p) => {
                valid.insert(p);
            }
            Err(_) => {
                invalid.insert(token.clone());
            }
        }
    }

    if invalid.is_empty() {
        Ok(valid)
    } else {
        Err(invalid.into_iter().collect())
    }
}

/// Tier definitions: name → permission tokens.
///
/// Tokens are checked against the vocabulary by [`TierTable::load`] at startup.
const TIER_DEFINITIONS: &[(&str, &[&str])] = &[
    (
        "openclaw",
        &[
            "read:mail",
            "write:draft",
            "read:calendar",
            "write:calendar",
            "read:contacts",
            "write:contacts",
        ],
    ),
    (
        "readonly",
        &[
            "read:mail",
            "read:calendar",
            "read:contacts",
            "read:files",
            "read:sharepoint",
        ],
    ),
    (
        "full",
        &[
            "read:mail",
            "write:mail",
            "write:draft",
            "read:calendar",
            "write:calendar",
            "read:contacts",
            "write:contacts",
            "read:files",
            "write:files",
            "read:sharepoint",
        ],
    ),
];

/// Tier table integrity errors
#[derive(Debug, Clone, PartialEq)]
pub enum TierTableError {
    UnknownPermission { tier: String, token: String },
    EmptyTier(String),
    DuplicateTier(String),
}

impl std::fmt::Display for TierTableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierTableError::UnknownPermission { tier, token } => {
                write!(f, "Tier '{}' references unknown permission '{}'", tier, token)
            }
            TierTableError::EmptyTier(tier) => write!(f, "Tier '{}' grants no permissions", tier),
            TierTableError::DuplicateTier(tier) => write!(f, "Tier '{}' is defined twice", tier),
        }
    }
}

impl std::error::Error for TierTableError {}

/// Validated tier → permission-set mapping.
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: BTreeMap<String, BTreeSet<Permission>>,
}

impl TierTable {
    /// Loads the built-in tier definitions.
    pub fn load() -> Result<Self, TierTableError> {
        Self::from_definitions(TIER_DEFINITIONS)
    }

    fn from_definitions(definitions: &[(&str, &[&str])]) -> Result<Self, TierTableError> {
        let mut tiers = BTreeMap::new();

        for (name, tokens) in definitions {
            if tokens.is_empty() {
                return Err(TierTableError::EmptyTier(name.to_string()));
            }

            let mut permissions = BTreeSet::new();
            for token in *tokens {
                let permission = token.parse::<Permission>().map_err(|_| {
                    TierTableError::UnknownPermission {
                        tier: name.to_string(),
                        token: token.to_string(),
                    }
                })?;
                permissions.insert(permission);
            }

            if tiers.insert(name.to_string(), permissions).is_some() {
                return Err(TierTableError::DuplicateTier(name.to_string()));
            }
        }

        Ok(Self { tiers })
    }

    /// Permission set of a tier, if the name is known.
    pub fn resolve(&self, tier: &str) -> Option<&BTreeSet<Permission>> {
        self.tiers.get(tier)
    }

    /// Known tier names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tiers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_string_roundtrip() {
        for p in Permission::ALL {
            assert_eq!(p.as_str().parse::<Permission>().unwrap(), p);
        }
        assert!("write:everything".parse::<Permission>().is_err());
    }

    #[test]
    fn test_permission_serde_as_string() {
        let json = serde_json::to_string(&vec![Permission::ReadMail, Permission::Admin]).unwrap();
        assert_eq!(json, r#"["read:mail","admin"]"#);

        let parsed: Vec<Permission> = serde_json::from_str(r#"["write:calendar"]"#).unwrap();
        assert_eq!(parsed, vec![Permission::WriteCalendar]);

        assert!(serde_json::from_str::<Vec<Permission>>(r#"["root"]"#).is_err());
    }

    #[test]
    fn test_parse_permissions_reports_all_invalid() {
        let tokens = vec![
            "read:mail".to_string(),
            "write:planet".to_string(),
            "delete:all".to_string(),
            "write:planet".to_string(),
        ];
        let invalid = parse_permissions(&tokens).unwrap_err();
        assert_eq!(invalid, vec!["delete:all".to_string(), "write:planet".to_string()]);
    }

    #[test]
    fn test_builtin_tiers_load() {
        let table = TierTable::load().unwrap();
        assert_eq!(table.names(), vec!["full", "openclaw", "readonly"]);

        let openclaw = table.resolve("openclaw").unwrap();
        assert_eq!(openclaw.len(), 6);
        assert!(openclaw.contains(&Permission::ReadMail));
        assert!(!openclaw.contains(&Permission::WriteMail));

        let full = table.resolve("full").unwrap();
        assert!(!full.contains(&Permission::Admin));
        assert_eq!(full.len(), Permission::ALL.len() - 1);

        assert!(table.resolve("superuser").is_none());
    }

    #[test]
    fn test_tier_with_unknown_permission_rejected() {
        let defs: &[(&str, &[&str])] = &[("broken", &["read:mail", "read:everything"])];
        assert_eq!(
            TierTable::from_definitions(defs).unwrap_err(),
            TierTableError::UnknownPermission {
                tier: "broken".to_string(),
                token: "read:everything".to_string(),
            }
        );
    }

    #[test]
    fn test_empty_and_duplicate_tiers_rejected() {
        let empty: &[(&str, &[&str])] = &[("nothing", &[])];
        assert_eq!(
            TierTable::from_definitions(empty).unwrap_err(),
            TierTableError::EmptyTier("nothing".to_string())
        );

        let dup: &[(&str, &[&str])] = &[("a", &["admin"]), ("a", &["read:mail"])];
        assert_eq!(
            TierTable::from_definitions(dup).unwrap_err(),
            TierTableError::DuplicateTier("a".to_string())
        );
    }
}
