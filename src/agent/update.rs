//! Release check for the `update` subcommand
//!
//! Queries the GitHub releases API and reports whether a newer agent
//! exists. Swapping the binary itself is left to the package manager or
//! operator tooling.

use semver::Version;
use serde::Deserialize;
use thiserror::Error;

/// GitHub latest-release endpoint
pub const RELEASES_URL: &str = "https://api.github.com/repos/svenvg93/lightspeed/releases/latest";

/// Update check failures
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The releases API was unreachable or answered badly
    #[error("release lookup failed: {0}")]
    Fetch(#[from] reqwest::Error),
    /// The release tag was not a semver
    #[error("release tag {tag:?} is not a version: {source}")]
    BadTag {
        /// Offending tag
        tag: String,
        /// Parser diagnostic
        source: semver::Error,
    },
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// Outcome of a release check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    /// Running the latest release
    UpToDate {
        /// The current version
        current: Version,
    },
    /// A newer release exists
    Available {
        /// The current version
        current: Version,
        /// The newest release
        latest: Version,
    },
}

/// Compares the running version against the latest GitHub release.
///
/// # Errors
///
/// Returns [`UpdateError`] when the API is unreachable or the tag is not
/// a semver.
pub async fn check_latest() -> Result<UpdateCheck, UpdateError> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("lightspeed-agent/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let release: Release = client
        .get(RELEASES_URL)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let tag = release.tag_name.trim_start_matches('v').to_string();
    let latest = Version::parse(&tag).map_err(|source| UpdateError::BadTag {
        tag: release.tag_name.clone(),
        source,
    })?;
    let current =
        Version::parse(env!("CARGO_PKG_VERSION")).expect("crate version is a valid semver");

    if latest > current {
        Ok(UpdateCheck::Available { current, latest })
    } else {
        Ok(UpdateCheck::UpToDate { current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_tag_parses_with_and_without_prefix() {
        let release: Release = serde_json::from_str(r#"{"tag_name":"v0.6.1"}"#).unwrap();
        let tag = release.tag_name.trim_start_matches('v');
        assert_eq!(Version::parse(tag).unwrap(), Version::new(0, 6, 1));
    }
}
