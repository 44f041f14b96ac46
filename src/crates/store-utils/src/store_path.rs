pub const HASH_LEN: usize = 32;

/// A content-addressed location in the store, kept as its base name
/// (`<hash>-<name>`), without the store directory prefix.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StorePath {
    base_name: String,
}

impl StorePath {
    #[must_use]
    pub fn new(p: &str) -> Self {
        let base_name = p.rsplit_once('/').map_or(p, |(_, base)| base);
        debug_assert!(base_name.len() > HASH_LEN + 1);
        Self {
            base_name: base_name.to_string(),
        }
    }

    #[must_use]
    pub fn into_base_name(self) -> String {
        self.base_name
    }

    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.base_name[HASH_LEN + 1..]
    }

    #[must_use]
    pub fn hash_part(&self) -> &str {
        &self.base_name[..HASH_LEN]
    }

    #[must_use]
    pub fn is_recipe(&self) -> bool {
        std::path::Path::new(&self.base_name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("drv"))
    }
}

impl serde::Serialize for StorePath {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.base_name())
    }
}

impl<'de> serde::Deserialize<'de> for StorePath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.rsplit_once('/').map_or(s.as_str(), |(_, base)| base).len() <= HASH_LEN + 1 {
            return Err(serde::de::Error::custom("store path too short"));
        }
        Ok(Self::new(&s))
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.base_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_path_creation() {
        let path_str = "abc123def45678901234567890123456-package-name";
        let store_path = StorePath::new(path_str);

        assert_eq!(store_path.base_name(), path_str);
        assert_eq!(store_path.name(), "package-name");
        assert_eq!(store_path.hash_part(), "abc123def45678901234567890123456");
    }

    #[test]
    fn test_store_path_strips_directory() {
        let store_path =
            StorePath::new("/var/lib/forge/store/abc123def45678901234567890123456-package-name");

        assert_eq!(
            store_path.base_name(),
            "abc123def45678901234567890123456-package-name"
        );
        assert_eq!(store_path.name(), "package-name");
    }

    #[test]
    fn test_store_path_is_recipe() {
        let recipe = StorePath::new("abc123def45678901234567890123456-package.drv");
        let regular = StorePath::new("abc123def45678901234567890123456-package");

        assert!(recipe.is_recipe());
        assert!(!regular.is_recipe());
    }

    #[test]
    fn test_store_path_display() {
        let path_str = "abc123def45678901234567890123456-package-name";
        let store_path = StorePath::new(path_str);

        assert_eq!(format!("{store_path}"), path_str);
    }

    #[test]
    fn test_store_path_into_base_name() {
        let path_str = "abc123def45678901234567890123456-package-name";
        let store_path = StorePath::new(path_str);

        assert_eq!(store_path.into_base_name(), path_str);
    }
}
