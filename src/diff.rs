use std::collections::BTreeSet;

use crate::models::deployment::EnvironmentState;
use crate::models::diff::{ChangeType, CommitRange, ServiceDiff};

/// Compare what production runs against what preprod runs.
///
/// Every service present in either environment appears exactly once, sorted by
/// name. `prod` is the environment that is behind, `preprod` the one ahead.
pub fn compute_diff(
    prod: Option<&EnvironmentState>,
    preprod: Option<&EnvironmentState>,
) -> Vec<ServiceDiff> {
    if prod.is_none() && preprod.is_none() {
        return Vec::new();
    }

    let names: BTreeSet<&String> = prod
        .into_iter()
        .chain(preprod)
        .flat_map(|state| state.services.keys())
        .collect();

    names
        .into_iter()
        .map(|service| {
            let prod_version = prod.and_then(|s| s.services.get(service)).cloned();
            let preprod_version = preprod.and_then(|s| s.services.get(service)).cloned();
            let change_type = match (&prod_version, &preprod_version) {
                (Some(p), Some(q)) if p == q => ChangeType::NoChange,
                (Some(_), Some(_)) => ChangeType::VersionBump,
                (None, Some(_)) => ChangeType::NewService,
                _ => ChangeType::RemovedService,
            };
            ServiceDiff {
                service: service.clone(),
                prod_version,
                preprod_version,
                change_type,
            }
        })
        .collect()
}

pub fn commit_range(
    prod: Option<&EnvironmentState>,
    preprod: Option<&EnvironmentState>,
) -> CommitRange {
    CommitRange {
        from: prod.map(|s| s.commit_sha.clone()),
        to: preprod.map(|s| s.commit_sha.clone()),
    }
}
