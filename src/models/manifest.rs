use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PREPROD_MANIFEST_PATH: &str = "env/.env.preprod";

/// Desired service versions read from the manifest repository at one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub commit_sha: String,
    pub raw_text: String,
    pub services: BTreeMap<String, String>,
}
