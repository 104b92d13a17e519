//! Unsubscribe tokens and the suppression gate

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;
use volley_common::types::CampaignId;
use volley_common::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signed unsubscribe links.
///
/// The token embeds the email (and campaign scope when present) along
/// with an HMAC over that payload, so the unsubscribe endpoint can
/// authenticate requests without a lookup and a forged link cannot
/// suppress an arbitrary address.
#[derive(Clone)]
pub struct UnsubscribeService {
    secret: String,
    base_url: String,
}

/// Verified contents of an unsubscribe token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub email: String,
    pub campaign_id: Option<CampaignId>,
}

impl UnsubscribeService {
    pub fn new(secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into(),
        }
    }

    fn mac_hex(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Opaque token authorizing an unsubscribe for one address
    pub fn token(&self, email: &str, campaign_id: Option<CampaignId>) -> String {
        let payload = match campaign_id {
            Some(id) => format!("{}:{}", email.to_lowercase(), id),
            None => email.to_lowercase(),
        };
        let signature = self.mac_hex(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            signature
        )
    }

    /// Validate a token and recover the address and campaign scope
    pub fn verify(&self, token: &str) -> Result<UnsubscribeRequest> {
        let (encoded, signature) = token
            .split_once('.')
            .ok_or(Error::InvalidToken)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| Error::InvalidToken)?;
        let payload = String::from_utf8(payload_bytes).map_err(|_| Error::InvalidToken)?;

        if self.mac_hex(&payload) != signature {
            return Err(Error::InvalidToken);
        }

        match payload.split_once(':') {
            Some((email, id)) => {
                let campaign_id = id.parse().map_err(|_| Error::InvalidToken)?;
                Ok(UnsubscribeRequest {
                    email: email.to_string(),
                    campaign_id: Some(campaign_id),
                })
            }
            None => Ok(UnsubscribeRequest {
                email: payload,
                campaign_id: None,
            }),
        }
    }

    /// Full unsubscribe URL for an outbound message
    pub fn url(&self, email: &str, campaign_id: Option<CampaignId>) -> String {
        let query: String = form_urlencoded::Serializer::new(String::new())
            .append_pair("token", &self.token(email, campaign_id))
            .finish();
        format!("{}?{}", self.base_url, query)
    }
}
