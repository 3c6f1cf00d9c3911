use crate::model::Locator;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;

/// Declarative end-marker, turned into a live predicate by
/// [`stabilize::markers::build`](crate::stabilize::markers::build).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndMarkerSpec {
    /// `absent: <locator>` - element no longer present.
    Absent(Locator),
    /// `attribute: {locator, name, one_of}` - attribute value in an expected set.
    Attribute {
        locator: Locator,
        name: String,
        one_of: Vec<String>,
    },
    /// `text_present: <locator>` - element exists with non-empty text.
    TextPresent(Locator),
}

#[derive(Deserialize)]
struct AttributeBody {
    locator: Locator,
    name: String,
    one_of: Vec<String>,
}

impl<'de> Deserialize<'de> for EndMarkerSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(EndMarkerVisitor)
    }
}

struct EndMarkerVisitor;

impl<'de> Visitor<'de> for EndMarkerVisitor {
    type Value = EndMarkerSpec;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an end-marker map with single key (absent, attribute or text_present)")
    }

    fn visit_map<M>(self, mut map: M) -> std::result::Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let key: String = map
            .next_key()?
            .ok_or_else(|| de::Error::custom("expected end-marker type key"))?;

        let spec = match key.as_str() {
            "absent" => EndMarkerSpec::Absent(map.next_value()?),
            "text_present" => EndMarkerSpec::TextPresent(map.next_value()?),
            "attribute" => {
                let body: AttributeBody = map.next_value()?;
                if body.one_of.is_empty() {
                    return Err(de::Error::custom("attribute.one_of must not be empty"));
                }
                EndMarkerSpec::Attribute {
                    locator: body.locator,
                    name: body.name,
                    one_of: body.one_of,
                }
            }
            other => {
                return Err(de::Error::unknown_variant(
                    other,
                    &["absent", "attribute", "text_present"],
                ))
            }
        };

        if map.next_key::<String>()?.is_some() {
            return Err(de::Error::custom("end-marker must have exactly one key"));
        }
        Ok(spec)
    }
}

impl fmt::Display for EndMarkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndMarkerSpec::Absent(l) => write!(f, "absent({})", l),
            EndMarkerSpec::Attribute { locator, name, one_of } => {
                write!(f, "attribute({} @{} in [{}])", locator, name, one_of.join(", "))
            }
            EndMarkerSpec::TextPresent(l) => write!(f, "text_present({})", l),
        }
    }
}
