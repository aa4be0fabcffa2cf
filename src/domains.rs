//! Subdomain derivation and Host-header parsing

use uuid::Uuid;

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a generated slug
const MAX_SLUG_LEN: usize = 40;

/// Turn a project name into a DNS-safe slug: lowercase, whitespace folded to
/// hyphens, everything outside `[a-z0-9-]` stripped, hyphen runs collapsed.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_hyphen = false;

    for c in name.trim().to_lowercase().chars() {
        if c.is_whitespace() || c == '-' {
            if !last_hyphen && !slug.is_empty() {
                slug.push('-');
                last_hyphen = true;
            }
        } else if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_hyphen = false;
        }
        // anything else is dropped
    }

    while slug.ends_with('-') {
        slug.pop();
    }
    slug.truncate(MAX_SLUG_LEN);
    slug
}

/// Derive a fresh subdomain for a project: `{slug}-{6-char suffix}`.
///
/// The random suffix keeps repeated deploys of the same project name apart.
pub fn generate_subdomain(project_name: &str) -> String {
    let slug = slugify(project_name);
    let suffix = short_id();
    if slug.is_empty() {
        format!("app-{}", suffix)
    } else {
        format!("{}-{}", slug, suffix)
    }
}

/// First six hex characters of a fresh uuid
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Normalize a Host header value: strip the port, validate length and
/// charset, lowercase. Returns None for anything that is not a plausible
/// hostname (which also keeps garbage out of the logs).
pub fn normalize_host(host: &str) -> Option<String> {
    let hostname = host.split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// Extract the managed subdomain label from a normalized host.
///
/// Only single-label subdomains directly under the platform domain are
/// managed; the apex itself and deeper labels are someone else's traffic.
pub fn subdomain_for_host<'a>(host: &'a str, platform_domain: &str) -> Option<&'a str> {
    let suffix_len = platform_domain.len() + 1;
    if host.len() <= suffix_len {
        return None;
    }
    let (label, rest) = host.split_at(host.len() - suffix_len);
    if !rest.ends_with(platform_domain) || !rest.starts_with('.') {
        return None;
    }
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label)
}
