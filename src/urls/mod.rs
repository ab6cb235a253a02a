//! Meeting-join URL equivalence.
//!
//! Calendar invites and the bot directory rarely agree on the exact join URL:
//! zoom adds vanity/regional subdomains, hosts differ in case, and the bot
//! directory may echo a normalised form. `equivalent` decides whether two
//! URLs put you in the same call.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use url::Url;

/// Video platform a join URL belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Zoom,
    GoogleMeet,
    MicrosoftTeams,
    Other,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zoom => "zoom",
            Self::GoogleMeet => "google_meet",
            Self::MicrosoftTeams => "microsoft_teams",
            Self::Other => "other",
        }
    }

    /// Accepts our own tags plus the spellings the bot directory uses.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "zoom" => Self::Zoom,
            "google_meet" | "meet" | "google-meet" | "hangouts" => Self::GoogleMeet,
            "microsoft_teams" | "teams" | "microsoft-teams" | "microsoft_teams_live" => {
                Self::MicrosoftTeams
            }
            _ => Self::Other,
        }
    }

    pub fn detect(join_url: &str) -> Self {
        match Url::parse(join_url.trim()) {
            Ok(url) => url
                .host_str()
                .map(|host| Self::from_host(&host.to_ascii_lowercase()))
                .unwrap_or(Self::Other),
            Err(_) => Self::Other,
        }
    }

    fn from_host(host: &str) -> Self {
        if is_zoom_host(host) {
            Self::Zoom
        } else if is_google_host(host) {
            Self::GoogleMeet
        } else if is_teams_host(host) {
            Self::MicrosoftTeams
        } else {
            Self::Other
        }
    }
}

/// Decide whether two join URLs denote the same call.
pub fn equivalent(a: &str, b: &str) -> bool {
    let a = a.trim();
    let b = b.trim();

    if a.eq_ignore_ascii_case(b) {
        return true;
    }

    let (left, right) = match (Url::parse(a), Url::parse(b)) {
        (Ok(left), Ok(right)) => (left, right),
        _ => return a == b,
    };

    let (left_host, right_host) = match (left.host_str(), right.host_str()) {
        (Some(l), Some(r)) => (l.to_ascii_lowercase(), r.to_ascii_lowercase()),
        _ => return a == b,
    };

    if is_zoom_host(&left_host) && is_zoom_host(&right_host) {
        return zoom_equivalent(&left, &right);
    }

    if (is_google_host(&left_host) && is_google_host(&right_host))
        || (is_teams_host(&left_host) && is_teams_host(&right_host))
    {
        return path_and_query_eq(&left, &right);
    }

    path_and_query_eq(&left, &right) && last_two_labels(&left_host) == last_two_labels(&right_host)
}

/// Numeric zoom meeting id from a `/j/<id>` path.
pub fn zoom_meeting_id(url: &Url) -> Option<String> {
    static ZOOM_ID: OnceLock<Regex> = OnceLock::new();
    let re = ZOOM_ID.get_or_init(|| Regex::new(r"/j/(\d+)").expect("valid zoom id pattern"));
    re.captures(url.path())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn zoom_equivalent(left: &Url, right: &Url) -> bool {
    match (zoom_meeting_id(left), zoom_meeting_id(right)) {
        (Some(l), Some(r)) => l == r && query_param(left, "pwd") == query_param(right, "pwd"),
        (None, None) => path_and_query_eq(left, right),
        _ => false,
    }
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

fn path_and_query_eq(left: &Url, right: &Url) -> bool {
    path_and_query(left).eq_ignore_ascii_case(&path_and_query(right))
}

fn last_two_labels(host: &str) -> String {
    let labels: Vec<&str> = host.trim_end_matches('.').rsplit('.').take(2).collect();
    labels.into_iter().rev().collect::<Vec<_>>().join(".")
}

fn host_is(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn is_zoom_host(host: &str) -> bool {
    host_is(host, "zoom.us") || host_is(host, "zoomgov.com")
}

fn is_google_host(host: &str) -> bool {
    host_is(host, "meet.google.com") || host_is(host, "hangouts.google.com")
}

fn is_teams_host(host: &str) -> bool {
    host_is(host, "teams.microsoft.com") || host_is(host, "teams.live.com")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_ignores_case() {
        assert!(equivalent(
            "https://Meet.Google.com/abc-defg-hij",
            "https://meet.google.com/ABC-DEFG-HIJ"
        ));
    }

    #[test]
    fn test_zoom_regional_subdomain() {
        assert!(equivalent(
            "https://us02web.zoom.us/j/1234567890?pwd=abc",
            "https://zoom.us/j/1234567890?pwd=abc"
        ));
    }

    #[test]
    fn test_zoom_password_mismatch() {
        assert!(!equivalent(
            "https://us02web.zoom.us/j/1234567890?pwd=abc",
            "https://us02web.zoom.us/j/1234567890?pwd=xyz"
        ));
    }

    #[test]
    fn test_zoom_ignores_unrelated_query_params() {
        assert!(equivalent(
            "https://acme.zoom.us/j/1234567890?pwd=abc&from=addon",
            "https://zoom.us/j/1234567890?pwd=abc"
        ));
    }

    #[test]
    fn test_zoom_different_meeting_ids() {
        assert!(!equivalent(
            "https://zoom.us/j/1234567890",
            "https://zoom.us/j/9876543210"
        ));
    }

    #[test]
    fn test_zoom_missing_password_on_one_side() {
        assert!(!equivalent(
            "https://zoom.us/j/1234567890?pwd=abc",
            "https://zoom.us/j/1234567890"
        ));
    }

    #[test]
    fn test_google_meet_path_case() {
        assert!(equivalent(
            "https://meet.google.com/abc-defg-hij?authuser=0",
            "https://meet.google.com/ABC-defg-hij?authuser=0"
        ));
        assert!(!equivalent(
            "https://meet.google.com/abc-defg-hij",
            "https://meet.google.com/xyz-defg-hij"
        ));
    }

    #[test]
    fn test_teams_path_and_query() {
        let a = "https://teams.microsoft.com/l/meetup-join/19%3ameeting_abc%40thread.v2/0?context=%7b%7d";
        let b = "https://TEAMS.microsoft.com/l/meetup-join/19%3AMEETING_ABC%40thread.v2/0?context=%7B%7D";
        assert!(equivalent(a, b));
    }

    #[test]
    fn test_other_hosts_tolerate_regional_subdomain() {
        assert!(equivalent(
            "https://eu.webex.com/meet/alice",
            "https://us.webex.com/meet/alice"
        ));
        assert!(!equivalent(
            "https://eu.webex.com/meet/alice",
            "https://eu.example.com/meet/alice"
        ));
    }

    #[test]
    fn test_cross_platform_never_matches() {
        assert!(!equivalent(
            "https://zoom.us/j/1234567890",
            "https://meet.google.com/j/1234567890"
        ));
    }

    #[test]
    fn test_malformed_urls_fall_back_to_exact() {
        assert!(equivalent("not a url", "not a url"));
        assert!(!equivalent("not a url", "https://zoom.us/j/1"));
    }

    #[test]
    fn test_platform_detection() {
        assert_eq!(Platform::detect("https://us02web.zoom.us/j/1"), Platform::Zoom);
        assert_eq!(
            Platform::detect("https://meet.google.com/abc-defg-hij"),
            Platform::GoogleMeet
        );
        assert_eq!(
            Platform::detect("https://teams.microsoft.com/l/meetup-join/x"),
            Platform::MicrosoftTeams
        );
        assert_eq!(Platform::detect("garbage"), Platform::Other);
        assert_eq!(Platform::parse("google_meet"), Platform::GoogleMeet);
        assert_eq!(Platform::parse("ZOOM"), Platform::Zoom);
    }
}
