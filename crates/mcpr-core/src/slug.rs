//! Server-name slugification.
//!
//! A server's human name becomes the namespace token prefixed onto its
//! tools and prompts and used as the authority of `mcpr://` resource URIs.
//! The mapping must be stable: lowercase, every run of non-alphanumerics
//! collapses to a single `-`, leading/trailing `-` trimmed.

/// Slugify a server name into a namespace token.
///
/// ```
/// use mcpr_core::slugify;
///
/// assert_eq!(slugify("Filesystem"), "filesystem");
/// assert_eq!(slugify("My  GitHub (work)"), "my-github-work");
/// assert_eq!(slugify("--weird--"), "weird");
/// ```
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}
