use std::fmt;
use std::sync::Arc;

use crate::error::MetricsError;

/// A single key/value tag attached to a metric.
///
/// Keys are run through the collector's name transformer at attachment time;
/// values must stay within the character set accepted by every supported
/// backend: letters, digits, `-`, `_`, `.` and `/`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    key: String,
    value: String,
}

impl Tag {
    /// Creates a tag from a key and value.
    pub fn new<K, V>(key: K, value: V) -> Tag
    where
        K: Into<String>,
        V: Into<String>,
    {
        Tag { key: key.into(), value: value.into() }
    }

    /// The tag key, as declared.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The tag value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

impl<K: Into<String>, V: Into<String>> From<(K, V)> for Tag {
    fn from((key, value): (K, V)) -> Tag {
        Tag::new(key, value)
    }
}

/// An ordered set of tags declared when constructing a metric.
///
/// The set is an explicit constructor-time descriptor: whatever is in it at
/// attachment time is merged with the collector's default tags,
/// canonicalized, and frozen for the life of the metric.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: Vec<Tag>,
}

impl TagSet {
    /// Creates an empty tag set.
    pub fn new() -> TagSet {
        TagSet { tags: Vec::new() }
    }

    /// Adds a tag, builder-style.
    #[must_use]
    pub fn with<K, V>(mut self, key: K, value: V) -> TagSet
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.push(Tag::new(key, value));
        self
    }

    /// Adds a tag in place.
    pub fn push(&mut self, tag: Tag) {
        self.tags.push(tag);
    }

    /// Returns `true` if the set holds no tags.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterates the declared tags in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.tags.iter()
    }
}

impl<T: Into<Tag>> FromIterator<T> for TagSet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> TagSet {
        TagSet { tags: iter.into_iter().map(Into::into).collect() }
    }
}

/// Transforms a declared tag key into its wire form.
///
/// Must be deterministic and idempotent: applying it twice yields the same
/// result as applying it once.
pub type NameTransformer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The default name transformer: CamelCase to `lower_snake_case`.
///
/// Already-snake keys pass through unchanged, which is what makes the
/// transform idempotent.
pub fn default_name_transformer() -> NameTransformer {
    Arc::new(to_snake_case)
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower_or_digit = false;
    for c in name.chars() {
        if c.is_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower_or_digit = false;
        } else {
            out.push(c);
            prev_lower_or_digit = c.is_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

fn valid_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

/// The canonical, frozen form of a metric's merged tag set.
///
/// Holds both the lexicographically sorted `(key, value)` pairs and their
/// canonical JSON-object encoding, so each wire format can re-encode the tags
/// without parsing the JSON back apart.
#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedTags {
    pairs: Vec<(String, String)>,
    json: String,
}

impl ResolvedTags {
    /// The canonical JSON object string, e.g. `{"host":"web1","route":"/a"}`.
    ///
    /// Keys are sorted; keys and values are restricted to the allowed
    /// character set, so no JSON escaping is ever required.
    pub fn canonical(&self) -> &str {
        &self.json
    }

    /// The sorted `(key, value)` pairs.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Looks up a tag value by (transformed) key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Merges a metric's declared tags with the collector's default tags and
/// produces the canonical form used for the metric key and the wire formats.
///
/// Keys pass through `transform`; a declared key colliding with another
/// declared key or with a default tag fails with [`MetricsError::TagConflict`].
pub fn resolve_tags(
    declared: &TagSet,
    defaults: &TagSet,
    transform: &NameTransformer,
) -> Result<Arc<ResolvedTags>, MetricsError> {
    let mut pairs: Vec<(String, String)> =
        Vec::with_capacity(declared.tags.len() + defaults.tags.len());

    // Conflicts outrank value validation: a tag that both collides and holds
    // a bad value reports the collision. Check every key, declared and
    // default, before validating anything.
    for tag in declared.iter().chain(defaults.iter()) {
        let key = transform(tag.key());
        if pairs.iter().any(|(k, _)| *k == key) {
            return Err(MetricsError::TagConflict { key });
        }
        pairs.push((key, tag.value().to_string()));
    }

    for (key, value) in &pairs {
        validate_tag(key, value)?;
    }

    pairs.sort();

    let mut json = String::with_capacity(2 + pairs.len() * 16);
    json.push('{');
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            json.push(',');
        }
        json.push('"');
        json.push_str(key);
        json.push_str("\":\"");
        json.push_str(value);
        json.push('"');
    }
    json.push('}');

    Ok(Arc::new(ResolvedTags { pairs, json }))
}

fn validate_tag(key: &str, value: &str) -> Result<(), MetricsError> {
    if key.is_empty() || value.is_empty() {
        return Err(MetricsError::InvalidTag { key: key.to_string() });
    }
    if !key.chars().all(valid_tag_char) {
        return Err(MetricsError::InvalidTagValue {
            key: key.to_string(),
            value: key.to_string(),
        });
    }
    if !value.chars().all(valid_tag_char) {
        return Err(MetricsError::InvalidTagValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{default_name_transformer, resolve_tags, to_snake_case, TagSet};
    use crate::error::MetricsError;

    #[test]
    fn snake_case_known_cases() {
        let cases = &[
            ("Route", "route"),
            ("StatusCode", "status_code"),
            ("HTTPStatus", "httpstatus"),
            ("already_snake", "already_snake"),
            ("mixedCase", "mixed_case"),
            ("Status2Code", "status2_code"),
            ("", ""),
        ];

        for (input, expected) in cases {
            assert_eq!(&to_snake_case(input), expected);
        }
    }

    #[test]
    fn canonical_form_sorted_and_merged() {
        let transform = default_name_transformer();
        let declared = TagSet::new().with("Route", "/a");
        let defaults = TagSet::new().with("host", "web1");

        let resolved = resolve_tags(&declared, &defaults, &transform).unwrap();
        assert_eq!(resolved.canonical(), r#"{"host":"web1","route":"/a"}"#);
        assert_eq!(resolved.get("host"), Some("web1"));
        assert_eq!(resolved.get("route"), Some("/a"));
    }

    #[test]
    fn default_tag_collision_is_a_conflict() {
        let transform = default_name_transformer();
        let declared = TagSet::new().with("Host", "app3");
        let defaults = TagSet::new().with("host", "web1");

        match resolve_tags(&declared, &defaults, &transform) {
            Err(MetricsError::TagConflict { key }) => assert_eq!(key, "host"),
            other => panic!("expected TagConflict, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_declared_tag_is_a_conflict() {
        let transform = default_name_transformer();
        let declared = TagSet::new().with("route", "/a").with("Route", "/b");

        assert!(matches!(
            resolve_tags(&declared, &TagSet::new(), &transform),
            Err(MetricsError::TagConflict { .. })
        ));
    }

    #[test]
    fn conflict_outranks_invalid_value() {
        let transform = default_name_transformer();

        // The second `route` tag is both a duplicate and carries an invalid
        // character; the collision is what gets reported.
        let declared = TagSet::new().with("route", "/a").with("route", "bad;value");
        match resolve_tags(&declared, &TagSet::new(), &transform) {
            Err(MetricsError::TagConflict { key }) => assert_eq!(key, "route"),
            other => panic!("expected TagConflict, got {:?}", other),
        }

        // Same priority when the collision is against a default tag.
        let declared = TagSet::new().with("Host", "bad;value");
        let defaults = TagSet::new().with("host", "web1");
        match resolve_tags(&declared, &defaults, &transform) {
            Err(MetricsError::TagConflict { key }) => assert_eq!(key, "host"),
            other => panic!("expected TagConflict, got {:?}", other),
        }
    }

    #[test]
    fn empty_value_rejected() {
        let transform = default_name_transformer();
        let declared = TagSet::new().with("route", "");

        assert!(matches!(
            resolve_tags(&declared, &TagSet::new(), &transform),
            Err(MetricsError::InvalidTag { .. })
        ));
    }

    #[test]
    fn invalid_value_characters_rejected() {
        let transform = default_name_transformer();
        for bad in ["a b", "new\nline", "semi;colon", "qu\"ote"] {
            let declared = TagSet::new().with("route", bad);
            assert!(
                matches!(
                    resolve_tags(&declared, &TagSet::new(), &transform),
                    Err(MetricsError::InvalidTagValue { .. })
                ),
                "value {:?} should have been rejected",
                bad
            );
        }
    }

    proptest! {
        #[test]
        fn snake_case_is_idempotent(input in "[a-zA-Z0-9_]{0,24}") {
            let once = to_snake_case(&input);
            let twice = to_snake_case(&once);
            prop_assert_eq!(once, twice);
        }
    }
}
