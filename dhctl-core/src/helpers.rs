use std::any::type_name;

pub fn pretty_type_name<'a, T>() -> &'a str {
    type_name::<T>().split("::").last().unwrap_or_default()
}

/// Strips surrounding whitespace and a single leading `v`.
pub fn canonicalize_version(version: &str) -> String {
    let trimmed = version.trim();

    trimmed.strip_prefix('v').unwrap_or(trimmed).to_owned()
}

/// Returns the tag of a container image reference, ignoring any digest.
///
/// `repo:5000/img:v1` yields `v1`, `repo/img@sha256:...` yields `None`.
pub fn image_tag(image: &str) -> Option<&str> {
    let without_digest = match image.find('@') {
        Some(position) => &image[..position],
        None => image,
    };

    let (repository, tag) = without_digest.rsplit_once(':')?;

    // a colon inside the repository part belongs to a registry port
    if tag.is_empty() || tag.contains('/') || repository.is_empty() {
        return None;
    }

    Some(tag)
}
