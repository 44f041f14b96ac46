use serde::Deserialize;
use smallvec::SmallVec;

use crate::{BaseStore as _, StorePath};

/// A named derivation output and, if known up front, the store path it
/// will produce.
#[derive(Debug, Clone, Deserialize)]
pub struct Output {
    pub name: String,
    #[serde(default)]
    pub path: Option<StorePath>,
}

#[derive(Debug, Clone)]
pub struct Derivation {
    pub name: StorePath,
    pub platform: String,
    pub required_features: SmallVec<[String; 4]>,
    pub prefer_local: bool,
    pub input_drvs: SmallVec<[String; 8]>,
    pub outputs: SmallVec<[Output; 6]>,
}

impl Derivation {
    /// The capability key used for matcher lookups: the platform joined
    /// with the sorted required features.
    #[must_use]
    pub fn system_type(&self) -> String {
        if self.required_features.is_empty() {
            return self.platform.clone();
        }
        let mut features = self.required_features.to_vec();
        features.sort_unstable();
        format!("{}:{}", self.platform, features.join(","))
    }
}

fn default_version() -> u32 {
    1
}

/// On-disk recipe encoding. Versioned so the format can evolve without
/// silently misreading old recipes.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecipeHelper {
    #[serde(rename = "system")]
    platform: String,
    #[serde(default)]
    required_features: Vec<String>,
    #[serde(default)]
    prefer_local: bool,
    #[serde(default)]
    input_drvs: Vec<String>,
    outputs: Vec<Output>,
    #[serde(default = "default_version")]
    version: u32,
}

pub(crate) fn parse_drv(drv_path: &StorePath, input: &str) -> Result<Derivation, crate::Error> {
    let helper: RecipeHelper = serde_json::from_str(input)?;
    if helper.version != 1 {
        return Err(crate::Error::UnsupportedRecipeVersion(helper.version));
    }

    Ok(Derivation {
        name: drv_path.clone(),
        platform: helper.platform,
        required_features: helper.required_features.into(),
        prefer_local: helper.prefer_local,
        input_drvs: helper.input_drvs.into(),
        outputs: helper.outputs.into(),
    })
}

#[tracing::instrument(skip(store), fields(%drv), err)]
pub async fn query_drv(
    store: &crate::LocalStore,
    drv: &StorePath,
) -> Result<Option<Derivation>, crate::Error> {
    if !drv.is_recipe() {
        return Ok(None);
    }

    let full_path = store.print_store_path(drv);
    if !fs_err::tokio::try_exists(&full_path).await? {
        return Ok(None);
    }

    let input = fs_err::tokio::read_to_string(&full_path).await?;
    Ok(Some(parse_drv(drv, &input)?))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_parse_recipe() {
        let input = r#"{
            "system": "x86_64-linux",
            "requiredFeatures": ["kvm", "big-parallel"],
            "inputDrvs": [
                "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep-1.0.drv",
                "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-dep-2.0.drv"
            ],
            "outputs": [
                {"name": "out", "path": "cccccccccccccccccccccccccccccccc-pkg-1.0"},
                {"name": "doc"}
            ]
        }"#;
        let drv_path = StorePath::new("dddddddddddddddddddddddddddddddd-pkg-1.0.drv");
        let drv = parse_drv(&drv_path, input).unwrap();

        assert_eq!(drv.name, drv_path);
        assert_eq!(drv.platform, "x86_64-linux");
        assert_eq!(drv.required_features.as_slice(), ["kvm", "big-parallel"]);
        assert!(!drv.prefer_local);
        assert_eq!(drv.input_drvs.len(), 2);
        assert_eq!(drv.outputs.len(), 2);
        assert_eq!(drv.outputs[0].name, "out");
        assert!(drv.outputs[0].path.is_some());
        assert!(drv.outputs[1].path.is_none());
    }

    #[test]
    fn test_parse_recipe_prefer_local() {
        let input = r#"{
            "system": "builtin",
            "preferLocal": true,
            "outputs": [{"name": "out"}]
        }"#;
        let drv_path = StorePath::new("dddddddddddddddddddddddddddddddd-fetchurl.drv");
        let drv = parse_drv(&drv_path, input).unwrap();

        assert!(drv.prefer_local);
        assert!(drv.required_features.is_empty());
        assert!(drv.input_drvs.is_empty());
    }

    #[test]
    fn test_parse_recipe_rejects_unknown_version() {
        let input = r#"{"system": "x86_64-linux", "outputs": [], "version": 2}"#;
        let drv_path = StorePath::new("dddddddddddddddddddddddddddddddd-pkg.drv");
        assert!(matches!(
            parse_drv(&drv_path, input),
            Err(crate::Error::UnsupportedRecipeVersion(2))
        ));
    }

    #[test]
    fn test_system_type_sorts_features() {
        let input = r#"{
            "system": "aarch64-linux",
            "requiredFeatures": ["nixos-test", "kvm"],
            "outputs": [{"name": "out"}]
        }"#;
        let drv_path = StorePath::new("dddddddddddddddddddddddddddddddd-pkg.drv");
        let drv = parse_drv(&drv_path, input).unwrap();

        assert_eq!(drv.system_type(), "aarch64-linux:kvm,nixos-test");
    }

    #[test]
    fn test_system_type_without_features() {
        let input = r#"{"system": "x86_64-linux", "outputs": [{"name": "out"}]}"#;
        let drv_path = StorePath::new("dddddddddddddddddddddddddddddddd-pkg.drv");
        let drv = parse_drv(&drv_path, input).unwrap();

        assert_eq!(drv.system_type(), "x86_64-linux");
    }
}
