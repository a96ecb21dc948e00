use crate::host::{DependencyUpdate, PullRequestContent};
use crate::model::{Build, Subscription};
use std::collections::BTreeMap;

/// Work out which shipping assets move between `from` and `to`.
///
/// An asset counts as updated when it is new in `to` or its version changed.
/// Assets dropped by `to` are left alone.
pub fn dependency_updates(from: Option<&Build>, to: &Build) -> Vec<DependencyUpdate> {
    let previous: BTreeMap<&str, &str> = from
        .map(|b| {
            b.shipping_assets()
                .map(|a| (a.name.as_str(), a.version.as_str()))
                .collect()
        })
        .unwrap_or_default();

    let mut updates: Vec<DependencyUpdate> = to
        .shipping_assets()
        .filter_map(|asset| match previous.get(asset.name.as_str()) {
            Some(v) if *v == asset.version => None,
            old => Some(DependencyUpdate {
                name: asset.name.clone(),
                from_version: old.map(|v| v.to_string()),
                to_version: asset.version.clone(),
            }),
        })
        .collect();
    updates.sort_by(|a, b| a.name.cmp(&b.name));
    updates
}

/// PR branch name for a subscription; stable so reruns update the same PR.
pub fn head_branch(sub: &Subscription) -> String {
    format!("depflow-update-{}-{}", sub.target_branch, sub.id.simple())
}

pub fn pull_request_content(
    sub: &Subscription,
    from: Option<&Build>,
    to: &Build,
) -> PullRequestContent {
    let updates = dependency_updates(from, to);
    let title = format!(
        "[{}] Update dependencies from {}",
        sub.target_branch, sub.source_repository
    );

    let mut description = format!(
        "This pull request updates the following dependencies from {} \
         (build {}, commit {}):\n\n",
        sub.source_repository, to.build_number, to.commit
    );
    for u in &updates {
        match &u.from_version {
            Some(old) => description.push_str(&format!("- {}: {} -> {}\n", u.name, old, u.to_version)),
            None => description.push_str(&format!("- {}: {}\n", u.name, u.to_version)),
        }
    }

    PullRequestContent {
        title,
        description,
        head_branch: head_branch(sub),
        updates,
    }
}
