//! Persistence keys and wildcard key patterns.
//!
//! Every persisted load-balancer state is identified by a two-part key: the
//! channel it belongs to and the algorithm that produced it. Both parts are
//! opaque, pre-hashed tokens. [`KeyPattern`] is the same shape with either
//! component optionally wildcarded, and is only accepted by `list`/`delete`.

use std::fmt;

/// Maximum length of a channel or algorithm identifier, in bytes.
///
/// Matches the width of the identifier columns in the database schema.
pub const MAX_ID_LEN: usize = 250;

/// Error returned when an identifier is not a storage-safe token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidId {
    /// The rejected identifier.
    pub id: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl fmt::Display for InvalidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid identifier {:?}: {}", self.id, self.reason)
    }
}

impl std::error::Error for InvalidId {}

/// Checks that `id` can be used verbatim as a directory name, a file name
/// prefix, and a SQL parameter.
///
/// # Errors
///
/// Returns [`InvalidId`] if the identifier is empty, too long, `.`/`..`, or
/// contains anything other than ASCII alphanumerics, `-`, `_` and `.`.
pub fn validate_id(id: &str) -> Result<(), InvalidId> {
    let reject = |reason| {
        Err(InvalidId {
            id: id.to_string(),
            reason,
        })
    };
    if id.is_empty() {
        return reject("empty");
    }
    if id.len() > MAX_ID_LEN {
        return reject("longer than 250 bytes");
    }
    if id == "." || id == ".." {
        return reject("reserved path component");
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return reject("contains characters outside [A-Za-z0-9._-]");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PersistenceKey
// ---------------------------------------------------------------------------

/// Fully specified `(channel, algorithm)` key of one persisted state.
///
/// The optional labels carry the human-readable originals of the hashed
/// identifiers. They only show up in `Display` output and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistenceKey {
    channel_id: String,
    algorithm_id: String,
    channel_label: Option<String>,
    algorithm_label: Option<String>,
}

impl PersistenceKey {
    /// Creates a key from two storage-safe identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidId`] if either identifier fails [`validate_id`].
    pub fn new(
        channel_id: impl Into<String>,
        algorithm_id: impl Into<String>,
    ) -> Result<Self, InvalidId> {
        let channel_id = channel_id.into();
        let algorithm_id = algorithm_id.into();
        validate_id(&channel_id)?;
        validate_id(&algorithm_id)?;
        Ok(Self {
            channel_id,
            algorithm_id,
            channel_label: None,
            algorithm_label: None,
        })
    }

    /// Attaches a diagnostic label for the channel.
    #[must_use]
    pub fn with_channel_label(mut self, label: impl Into<String>) -> Self {
        self.channel_label = Some(label.into());
        self
    }

    /// Attaches a diagnostic label for the algorithm.
    #[must_use]
    pub fn with_algorithm_label(mut self, label: impl Into<String>) -> Self {
        self.algorithm_label = Some(label.into());
        self
    }

    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    #[must_use]
    pub fn algorithm_id(&self) -> &str {
        &self.algorithm_id
    }

    #[must_use]
    pub fn channel_label(&self) -> Option<&str> {
        self.channel_label.as_deref()
    }

    #[must_use]
    pub fn algorithm_label(&self) -> Option<&str> {
        self.algorithm_label.as_deref()
    }

    /// The identity of this key without its labels, for use as a map key.
    #[must_use]
    pub fn id_pair(&self) -> (String, String) {
        (self.channel_id.clone(), self.algorithm_id.clone())
    }
}

impl fmt::Display for PersistenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.channel_id)?;
        if let Some(label) = &self.channel_label {
            write!(f, " ({label})")?;
        }
        write!(f, "/{}", self.algorithm_id)?;
        if let Some(label) = &self.algorithm_label {
            write!(f, " ({label})")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KeyPattern / Scope
// ---------------------------------------------------------------------------

/// A key whose components may be wildcarded (`None` means "all").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPattern {
    channel_id: Option<String>,
    algorithm_id: Option<String>,
}

/// Which of the four wildcard shapes a [`KeyPattern`] has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// `(*, *)`: every record.
    All,
    /// `(channel, *)`: every algorithm of one channel.
    Channel(&'a str),
    /// `(*, algorithm)`: one algorithm in every channel.
    Algorithm(&'a str),
    /// `(channel, algorithm)`: exactly one record.
    Exact(&'a str, &'a str),
}

impl KeyPattern {
    /// Matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches every algorithm stored for `channel_id`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidId`] if `channel_id` fails [`validate_id`].
    pub fn channel(channel_id: impl Into<String>) -> Result<Self, InvalidId> {
        Self::new(Some(channel_id.into()), None)
    }

    /// Matches `algorithm_id` in every channel.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidId`] if `algorithm_id` fails [`validate_id`].
    pub fn algorithm(algorithm_id: impl Into<String>) -> Result<Self, InvalidId> {
        Self::new(None, Some(algorithm_id.into()))
    }

    /// Matches exactly one record.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidId`] if either identifier fails [`validate_id`].
    pub fn exact(
        channel_id: impl Into<String>,
        algorithm_id: impl Into<String>,
    ) -> Result<Self, InvalidId> {
        Self::new(Some(channel_id.into()), Some(algorithm_id.into()))
    }

    /// Builds a pattern from optional components.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidId`] if a present component fails [`validate_id`].
    pub fn new(
        channel_id: Option<String>,
        algorithm_id: Option<String>,
    ) -> Result<Self, InvalidId> {
        if let Some(id) = &channel_id {
            validate_id(id)?;
        }
        if let Some(id) = &algorithm_id {
            validate_id(id)?;
        }
        Ok(Self {
            channel_id,
            algorithm_id,
        })
    }

    #[must_use]
    pub fn scope(&self) -> Scope<'_> {
        match (self.channel_id.as_deref(), self.algorithm_id.as_deref()) {
            (None, None) => Scope::All,
            (Some(channel), None) => Scope::Channel(channel),
            (None, Some(algorithm)) => Scope::Algorithm(algorithm),
            (Some(channel), Some(algorithm)) => Scope::Exact(channel, algorithm),
        }
    }
}

impl From<&PersistenceKey> for KeyPattern {
    fn from(key: &PersistenceKey) -> Self {
        Self {
            channel_id: Some(key.channel_id.clone()),
            algorithm_id: Some(key.algorithm_id.clone()),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {})",
            self.channel_id.as_deref().unwrap_or("*"),
            self.algorithm_id.as_deref().unwrap_or("*")
        )
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn accepts_hex_tokens() {
        assert!(validate_id("3f2a9c").is_ok());
        assert!(validate_id("node-1_a.b").is_ok());
    }

    #[test]
    fn rejects_unsafe_tokens() {
        assert!(validate_id("").is_err());
        assert!(validate_id(".").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a b").is_err());
        assert!(validate_id("x'; DROP TABLE t; --").is_err());
        assert!(validate_id(&"a".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(validate_id(&"a".repeat(MAX_ID_LEN)).is_ok());
    }

    #[test]
    fn key_display_includes_labels() {
        let key = PersistenceKey::new("c1", "a1")
            .unwrap()
            .with_channel_label("node-7")
            .with_algorithm_label("proportional");
        assert_eq!(key.to_string(), "c1 (node-7)/a1 (proportional)");
        assert_eq!(key.channel_label(), Some("node-7"));
    }

    #[test]
    fn labels_do_not_affect_identity_pair() {
        let plain = PersistenceKey::new("c1", "a1").unwrap();
        let labelled = plain.clone().with_channel_label("node");
        assert_eq!(plain.id_pair(), labelled.id_pair());
    }

    #[test]
    fn pattern_scopes() {
        assert_eq!(KeyPattern::all().scope(), Scope::All);
        assert_eq!(KeyPattern::channel("c").unwrap().scope(), Scope::Channel("c"));
        assert_eq!(
            KeyPattern::algorithm("a").unwrap().scope(),
            Scope::Algorithm("a")
        );
        assert_eq!(
            KeyPattern::exact("c", "a").unwrap().scope(),
            Scope::Exact("c", "a")
        );
    }

    #[test]
    fn pattern_from_key_is_exact() {
        let key = PersistenceKey::new("c", "a").unwrap();
        assert_eq!(KeyPattern::from(&key).scope(), Scope::Exact("c", "a"));
    }

    #[test]
    fn pattern_display_uses_star_for_wildcards() {
        assert_eq!(KeyPattern::all().to_string(), "(*, *)");
        assert_eq!(KeyPattern::algorithm("a").unwrap().to_string(), "(*, a)");
    }

    #[test]
    fn pattern_rejects_invalid_component() {
        assert!(KeyPattern::channel("../etc").is_err());
        assert!(KeyPattern::new(None, Some(String::new())).is_err());
    }

    proptest! {
        #[test]
        fn safe_alphabet_always_validates(id in "[A-Za-z0-9_-][A-Za-z0-9._-]{0,60}") {
            prop_assert!(validate_id(&id).is_ok());
        }

        #[test]
        fn path_separators_never_validate(prefix in "[a-z]{0,8}", suffix in "[a-z]{0,8}") {
            let id = format!("{prefix}/{suffix}");
            prop_assert!(validate_id(&id).is_err());
        }
    }
}
