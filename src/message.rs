use std::fmt;

use serde::de::{self, Deserialize, Deserializer, IgnoredAny, MapAccess, Visitor};

/// The record carried through the queue, `{"Name": .., "URL": ..}` on the wire.
///
/// Decoding is lenient in the same places `encoding/json` is:
///
/// - keys match `Name` / `URL` in any letter case, unknown keys are skipped
/// - a repeated key overwrites the earlier value
/// - a missing field or a `null` value leaves the field empty
/// - a top-level `null` is an empty profile
///
/// Anything that is not an object (or `null`), and a non-string field value,
/// is still a decode error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub url: String,
}

impl Profile {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Profile {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Structural decode only; values are not validated.
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

impl<'de> Deserialize<'de> for Profile {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_option(ProfileVisitor)
    }
}

struct ProfileVisitor;

impl<'de> Visitor<'de> for ProfileVisitor {
    type Value = Profile;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a profile object or null")
    }

    fn visit_none<E: de::Error>(self) -> Result<Profile, E> {
        Ok(Profile::default())
    }

    fn visit_unit<E: de::Error>(self) -> Result<Profile, E> {
        Ok(Profile::default())
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Profile, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(ProfileVisitor)
    }

    fn visit_map<A>(self, mut map: A) -> Result<Profile, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut profile = Profile::default();

        // Keys are visited in document order, so the last duplicate wins.
        while let Some(key) = map.next_key::<String>()? {
            let field = if key.eq_ignore_ascii_case("name") {
                &mut profile.name
            } else if key.eq_ignore_ascii_case("url") {
                &mut profile.url
            } else {
                map.next_value::<IgnoredAny>()?;
                continue;
            };

            if let Some(value) = map.next_value::<Option<String>>()? {
                *field = value;
            }
        }

        Ok(profile)
    }
}
