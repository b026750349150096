//! Accessors for the labels, annotations and data of watched Secrets.
//!
//! Everything here is a pure function of a `Secret`. Reads borrow, the single
//! mutation ([`with_deploy_key_id`]) consumes an owned copy so a cached object
//! can never be edited in place.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use crate::{
    Error, Result, DEPLOY_KEY_ID_ANNOTATION, GIT_URL_ANNOTATION, IDENTITY_DATA_KEY,
    SYNC_GC_MARK_LABEL,
};

/// `namespace/name` of a Secret, for logs and error messages.
pub fn qualified_name(secret: &Secret) -> String {
    match secret.namespace() {
        Some(ns) => format!("{}/{}", ns, secret.name_any()),
        None => secret.name_any(),
    }
}

/// `namespace/name` of a queue key.
pub fn key_name(key: &ObjectRef<Secret>) -> String {
    match &key.namespace {
        Some(ns) => format!("{}/{}", ns, key.name),
        None => key.name.clone(),
    }
}

/// Whether the Secret carries the sync-group label.
pub fn has_sync_label(secret: &Secret) -> bool {
    secret.labels().contains_key(SYNC_GC_MARK_LABEL)
}

/// The git remote this Secret grants access to, if annotated.
pub fn git_url(secret: &Secret) -> Option<&str> {
    secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(GIT_URL_ANNOTATION))
        .map(String::as_str)
}

/// Whether this controller is responsible for the Secret.
///
/// Both the sync-group label and a git-url annotation are required.
pub fn is_in_scope(secret: &Secret) -> bool {
    has_sync_label(secret) && git_url(secret).is_some()
}

/// The recorded deploy key id.
///
/// `Ok(None)` means the Secret has not been synced yet; an id that is not a
/// non-negative integer is malformed.
pub fn deploy_key_id(secret: &Secret) -> Result<Option<u64>> {
    let Some(raw) = secret
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DEPLOY_KEY_ID_ANNOTATION))
    else {
        return Ok(None);
    };
    raw.trim().parse::<u64>().map(Some).map_err(|_| {
        Error::malformed(
            qualified_name(secret),
            format!("{DEPLOY_KEY_ID_ANNOTATION} is not an integer: {raw:?}"),
        )
    })
}

/// The raw private key material.
pub fn identity(secret: &Secret) -> Result<&[u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(IDENTITY_DATA_KEY))
        .map(|b| b.0.as_slice())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| {
            Error::malformed(
                qualified_name(secret),
                format!("data field {IDENTITY_DATA_KEY:?} is missing or empty"),
            )
        })
}

/// Derive a GitLab project path from a git remote.
///
/// Strips `<user>@<hostname>:` and one trailing `.git`. Returns `None` when the
/// remote points at another host or names no project.
///
/// ```
/// use deploy_key_operator::secret::parse_project_path;
///
/// assert_eq!(parse_project_path("git@gitlab.com:org/repo.git", "gitlab.com"), Some("org/repo"));
/// assert_eq!(parse_project_path("git@gitlab.com:org/repo", "gitlab.com"), Some("org/repo"));
/// assert_eq!(parse_project_path("git@github.com:org/repo.git", "gitlab.com"), None);
/// ```
pub fn parse_project_path<'a>(git_url: &'a str, hostname: &str) -> Option<&'a str> {
    let (authority, path) = git_url.trim().split_once(':')?;
    let (user, host) = authority.rsplit_once('@')?;
    if user.is_empty() || !host.eq_ignore_ascii_case(hostname) {
        return None;
    }
    let path = path.strip_suffix(".git").unwrap_or(path);
    let path = path.trim_matches('/');
    (!path.is_empty()).then_some(path)
}

/// The GitLab project path named by the Secret's git-url annotation.
pub fn project_path(secret: &Secret, hostname: &str) -> Result<String> {
    let url = git_url(secret).ok_or_else(|| {
        Error::malformed(
            qualified_name(secret),
            format!("missing {GIT_URL_ANNOTATION} annotation"),
        )
    })?;
    parse_project_path(url, hostname)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::malformed(
                qualified_name(secret),
                format!("{GIT_URL_ANNOTATION} {url:?} is not a project on {hostname}"),
            )
        })
}

/// Record `id` on an owned copy of a Secret, ready for an authoritative update.
pub fn with_deploy_key_id(mut secret: Secret, id: u64) -> Secret {
    secret
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(DEPLOY_KEY_ID_ANNOTATION.to_string(), id.to_string());
    secret
}
