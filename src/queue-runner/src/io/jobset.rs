use std::sync::Arc;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Jobset {
    pub shares: u32,
    pub seconds: i64,
    pub share_used: f64,
}

impl From<Arc<crate::state::Jobset>> for Jobset {
    fn from(v: Arc<crate::state::Jobset>) -> Self {
        Self {
            shares: v.get_shares(),
            seconds: v.get_seconds(),
            share_used: v.share_used(),
        }
    }
}
