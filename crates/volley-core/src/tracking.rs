//! Open and click tracking: token signing and HTML injection

use hmac::{Hmac, Mac};
use regex::{Captures, Regex};
use sha2::Sha256;
use url::form_urlencoded;
use volley_common::types::{CampaignId, RecipientId};

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies tracking tokens and rewrites outbound HTML.
///
/// Tokens are derived deterministically from the campaign and recipient
/// identifiers plus a server-held secret, so re-sending to the same
/// recipient reuses the same token and verification needs no lookup.
#[derive(Clone)]
pub struct TrackingService {
    secret: String,
    api_base_url: String,
}

impl TrackingService {
    pub fn new(secret: impl Into<String>, api_base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            api_base_url: api_base_url.into(),
        }
    }

    /// Signed token for a campaign-recipient pair, truncated to 32 hex chars
    pub fn sign(&self, campaign_id: CampaignId, recipient_id: RecipientId) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{}:{}", campaign_id, recipient_id).as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        digest[..32].to_string()
    }

    /// Recompute and compare; stateless
    pub fn verify(&self, campaign_id: CampaignId, recipient_id: RecipientId, token: &str) -> bool {
        self.sign(campaign_id, recipient_id) == token
    }

    /// Open-beacon URL carrying campaign, recipient, and token
    pub fn pixel_url(&self, campaign_id: CampaignId, recipient_id: RecipientId) -> String {
        let token = self.sign(campaign_id, recipient_id);
        let query: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("c", &campaign_id.to_string())
            .append_pair("r", &recipient_id.to_string())
            .append_pair("t", &token)
            .finish();
        format!("{}/track/open?{}", self.api_base_url, query)
    }

    /// Redirect-through-tracking URL for a clicked link
    pub fn wrap_url(
        &self,
        original_url: &str,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
    ) -> String {
        let token = self.sign(campaign_id, recipient_id);
        let query: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("c", &campaign_id.to_string())
            .append_pair("r", &recipient_id.to_string())
            .append_pair("t", &token)
            .append_pair("u", original_url)
            .finish();
        format!("{}/track/click?{}", self.api_base_url, query)
    }

    /// Inject tracking into rendered per-recipient HTML: wrap links for
    /// click tracking and append a 1x1 beacon for open tracking.
    ///
    /// Links using mailto:, tel:, javascript:, anchors, unsubscribe
    /// links, and already-wrapped links are left untouched, so the
    /// operation is idempotent.
    pub fn inject(
        &self,
        html: &str,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
    ) -> String {
        let href_re = Regex::new(r#"href=["']([^"']+)["']"#).expect("static regex");

        let mut modified = href_re
            .replace_all(html, |caps: &Captures| {
                let full_tag = &caps[0];
                let url = &caps[1];

                let lower = url.to_lowercase();
                if lower.starts_with("mailto:")
                    || lower.starts_with("tel:")
                    || lower.starts_with("javascript:")
                    || lower.starts_with('#')
                    || lower.contains("unsubscribe")
                    || url.contains("track/click")
                {
                    return full_tag.to_string();
                }

                let tracked = self.wrap_url(url, campaign_id, recipient_id);
                full_tag.replacen(url, &tracked, 1)
            })
            .into_owned();

        let pixel = format!(
            r#"<img src="{}" width="1" height="1" alt="" style="display:none;" />"#,
            self.pixel_url(campaign_id, recipient_id)
        );

        let body_re = Regex::new(r"(?i)</body>").expect("static regex");
        if body_re.is_match(&modified) {
            modified = body_re
                .replacen(&modified, 1, format!("{}</body>", pixel).as_str())
                .into_owned();
        } else {
            modified.push_str(&pixel);
        }

        modified
    }
}

/// Extract the original URL from a wrapped click query string
pub fn original_url_from_query(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "u")
        .map(|(_, v)| v.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn service() -> TrackingService {
        TrackingService::new("test-secret", "https://api.example.com/v1")
    }

    #[test]
    fn test_token_is_deterministic() {
        let svc = service();
        let c = Uuid::new_v4();
        let r = Uuid::new_v4();
        assert_eq!(svc.sign(c, r), svc.sign(c, r));
        assert_eq!(svc.sign(c, r).len(), 32);
    }

    #[test]
    fn test_verify_accepts_own_token_and_rejects_others() {
        let svc = service();
        let c = Uuid::new_v4();
        let r = Uuid::new_v4();
        let token = svc.sign(c, r);
        assert!(svc.verify(c, r, &token));
        assert!(!svc.verify(c, r, "00000000000000000000000000000000"));
        assert!(!svc.verify(r, c, &token));
    }

    #[test]
    fn test_tokens_differ_per_recipient() {
        let svc = service();
        let c = Uuid::new_v4();
        assert_ne!(svc.sign(c, Uuid::new_v4()), svc.sign(c, Uuid::new_v4()));
    }

    #[test]
    fn test_inject_wraps_links_and_adds_pixel() {
        let svc = service();
        let c = Uuid::new_v4();
        let r = Uuid::new_v4();
        let html = r#"<html><body><a href="https://example.com/offer">Go</a></body></html>"#;

        let out = svc.inject(html, c, r);

        assert!(out.contains("track/click?"));
        assert!(out.contains(&format!("c={}", c)));
        assert!(out.contains(&format!("r={}", r)));
        assert!(out.contains("u=https%3A%2F%2Fexample.com%2Foffer"));
        assert!(out.contains(r#"width="1" height="1""#));
        assert!(out.contains("track/open?"));
        // Pixel lands inside the body
        let pixel_pos = out.find("track/open").unwrap();
        let body_pos = out.find("</body>").unwrap();
        assert!(pixel_pos < body_pos);
    }

    #[test]
    fn test_inject_skips_special_links() {
        let svc = service();
        let c = Uuid::new_v4();
        let r = Uuid::new_v4();
        let html = concat!(
            r##"<a href="mailto:a@b.com">mail</a>"##,
            r##"<a href="tel:+15551234">call</a>"##,
            r##"<a href="#section">jump</a>"##,
            r##"<a href="https://example.com/unsubscribe?e=x">Unsubscribe</a>"##,
        );

        let out = svc.inject(html, c, r);

        assert!(out.contains(r#"href="mailto:a@b.com""#));
        assert!(out.contains(r#"href="tel:+15551234""#));
        assert!(out.contains(r##"href="#section""##));
        assert!(out.contains(r#"href="https://example.com/unsubscribe?e=x""#));
    }

    #[test]
    fn test_inject_is_idempotent_for_links() {
        let svc = service();
        let c = Uuid::new_v4();
        let r = Uuid::new_v4();
        let html = r#"<body><a href="https://example.com/x">x</a></body>"#;

        let once = svc.inject(html, c, r);
        let twice = svc.inject(&once, c, r);

        assert_eq!(
            once.matches("track/click").count(),
            twice.matches("track/click").count()
        );
    }

    #[test]
    fn test_pixel_appended_without_body_tag() {
        let svc = service();
        let html = "<p>Hello</p>";
        let out = svc.inject(html, Uuid::new_v4(), Uuid::new_v4());
        assert!(out.starts_with("<p>Hello</p><img"));
    }

    #[test]
    fn test_original_url_extraction() {
        let svc = service();
        let wrapped = svc.wrap_url("https://example.com/page?a=1", Uuid::new_v4(), Uuid::new_v4());
        let query = wrapped.split('?').nth(1).unwrap();
        assert_eq!(
            original_url_from_query(query).as_deref(),
            Some("https://example.com/page?a=1")
        );
    }
}
