//! Client side of the personality-database API: payload models, proxy leases,
//! the throttled fetcher and the comment pager.
pub mod comments;
pub mod models;
pub mod provider;
pub mod proxy;

use models::ProfileId;

pub const DEFAULT_API_BASE: &str = "https://api.personality-database.com/api/v1";

/// URL templates for the two endpoints the pipeline reads.
#[derive(Debug, Clone)]
pub struct ApiEndpoints {
    base_url: String,
}

impl ApiEndpoints {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn profile_url(&self, id: ProfileId) -> String {
        format!("{}/profile/{}", self.base_url, id)
    }

    pub fn comments_url(&self, id: ProfileId, offset: i64) -> String {
        format!(
            "{}/comments/{}?sort=HOT&offset={}&range=all&version=W3",
            self.base_url, id, offset
        )
    }
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_endpoint_urls() {
        let ep = ApiEndpoints::new("http://localhost:9000/api/v1/");
        assert_eq!(ep.profile_url(ProfileId(7)), "http://localhost:9000/api/v1/profile/7");
        assert_eq!(
            ep.comments_url(ProfileId(7), 20),
            "http://localhost:9000/api/v1/comments/7?sort=HOT&offset=20&range=all&version=W3"
        );
    }
}
