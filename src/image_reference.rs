use std::fmt;

static DEFAULT_TAG: &str = "latest";

/// Identity of an image as used for backup naming: `[registry/]repository:tag`.
///
/// `repository` is always the last path segment and `registry` the segment in
/// front of it, so `docker.io/library/nginx:1.27` yields registry `library`
/// and repository `nginx`. Segments further left only survive in `location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
    location: String,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.registry.is_empty() {
            write!(f, "{}/", self.registry)?;
        }
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Self {
        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (s, None),
        };

        // A colon only separates the tag when it comes after the last slash,
        // otherwise it belongs to a registry port.
        let last_slash = name.rfind('/');
        let (without_tag, tag) = match name.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                (&name[..pos], &name[pos + 1..])
            }
            _ => (name, DEFAULT_TAG),
        };

        let (location, repository) = match without_tag.rsplit_once('/') {
            Some((location, repository)) => (location, repository),
            None => ("", without_tag),
        };
        let registry = location.rsplit('/').next().unwrap_or_default();

        Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
            location: location.to_string(),
        }
    }

    pub fn compose(backup_host: &str, repository: &str, tag: &str) -> String {
        format!("{}/{}:{}", backup_host, repository, tag)
    }

    /// Everything in front of the repository segment, e.g.
    /// `registry.example.com/backups` for `registry.example.com/backups/app:v1`.
    pub fn location(&self) -> &str {
        &self.location
    }
}
