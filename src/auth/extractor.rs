//! Actix-web extractor for peer requests.

use actix_web::dev::Payload;
use actix_web::{FromRequest, HttpRequest, web};
use secrecy::{ExposeSecret, SecretString};
use std::future::{Ready, ready};
use tracing::warn;

use super::ClusterToken;
use crate::cluster::CLUSTER_TOKEN_HEADER;
use crate::error::AppError;

/// Extract a secret header value, wrapping it in SecretString.
fn extract_secret_header(req: &HttpRequest, header_name: &str) -> Option<SecretString> {
    req.headers()
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(|s| SecretString::from(s.to_string()))
}

/// Guard for endpoints only other nodes may call.
///
/// Requires the `X-Cluster-Token` header to match the configured token.
pub struct ClusterAuth;

impl FromRequest for ClusterAuth {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let Some(token) = req.app_data::<web::Data<ClusterToken>>() else {
            warn!("Cluster token not registered as app data");
            return ready(Err(AppError::Unauthorized(
                "Cluster endpoints are disabled".to_string(),
            )));
        };

        if !token.is_configured() {
            return ready(Err(AppError::Unauthorized(
                "Cluster endpoints are disabled".to_string(),
            )));
        }

        match extract_secret_header(req, CLUSTER_TOKEN_HEADER) {
            Some(ref provided) if token.verify(provided.expose_secret()) => ready(Ok(ClusterAuth)),
            Some(_) => {
                warn!(
                    "Rejected peer request to {} with an invalid cluster token",
                    req.path()
                );
                ready(Err(AppError::Unauthorized(
                    "Invalid cluster token".to_string(),
                )))
            }
            None => ready(Err(AppError::Unauthorized(format!(
                "Missing cluster token. Provide {} header.",
                CLUSTER_TOKEN_HEADER
            )))),
        }
    }
}
