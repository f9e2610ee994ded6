//! External item GUID parsing
//!
//! Media servers tag items with opaque GUID strings. A handful of schemes
//! carry an identifier the metadata provider understands:
//!
//! | Example | Parsed |
//! |---|---|
//! | `tmdb://603`, `com.plexapp.agents.themoviedb://603?lang=en` | [`ParsedGuid::Tmdb`] |
//! | `imdb://tt0133093`, `com.plexapp.agents.imdb://tt0133093?lang=en` | [`ParsedGuid::Imdb`] |
//! | `tvdb://81189`, `com.plexapp.agents.thetvdb://81189/1/1?lang=en` | [`ParsedGuid::Tvdb`] |
//! | `plex://movie/5d776825880197001ec90000` | [`ParsedGuid::Native`] |
//!
//! Anything else is [`ParsedGuid::Unknown`].

use bridge_traits::ExternalSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedGuid {
    /// Directly encodes a metadata provider id.
    Tmdb(i64),
    Imdb(String),
    Tvdb(String),
    /// Server-native identifier with no external meaning.
    Native(String),
    Unknown,
}

impl ParsedGuid {
    pub fn parse(guid: &str) -> Self {
        let guid = guid.trim();
        let Some((scheme, rest)) = guid.split_once("://") else {
            return ParsedGuid::Unknown;
        };
        let scheme = scheme.to_ascii_lowercase();

        match scheme.as_str() {
            "tmdb" | "com.plexapp.agents.themoviedb" => leading_segment(rest)
                .parse::<i64>()
                .ok()
                .filter(|id| *id > 0)
                .map(ParsedGuid::Tmdb)
                .unwrap_or(ParsedGuid::Unknown),
            "imdb" | "com.plexapp.agents.imdb" => {
                let id = leading_segment(rest);
                if is_imdb_id(id) {
                    ParsedGuid::Imdb(id.to_string())
                } else {
                    ParsedGuid::Unknown
                }
            }
            "tvdb" | "com.plexapp.agents.thetvdb" => {
                let id = leading_segment(rest);
                if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
                    ParsedGuid::Tvdb(id.to_string())
                } else {
                    ParsedGuid::Unknown
                }
            }
            "plex" if !rest.is_empty() => ParsedGuid::Native(rest.to_string()),
            _ => ParsedGuid::Unknown,
        }
    }

    /// Foreign catalog id usable with a find-by-external-id lookup.
    pub fn external_id(&self) -> Option<(&str, ExternalSource)> {
        match self {
            ParsedGuid::Imdb(id) => Some((id, ExternalSource::Imdb)),
            ParsedGuid::Tvdb(id) => Some((id, ExternalSource::Tvdb)),
            _ => None,
        }
    }

    /// Provider id carried by the guid itself.
    pub fn metadata_id(&self) -> Option<i64> {
        match self {
            ParsedGuid::Tmdb(id) => Some(*id),
            _ => None,
        }
    }
}

/// Text up to the first `/`, `?` or `#`.
fn leading_segment(rest: &str) -> &str {
    rest.split(['/', '?', '#']).next().unwrap_or_default()
}

fn is_imdb_id(id: &str) -> bool {
    id.len() > 2 && id.starts_with("tt") && id[2..].bytes().all(|b| b.is_ascii_digit())
}
