use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{AUTH_FILTER_ID, Filter, parse_filter_config};
use crate::core::{
    context::GatewayContext,
    error::{GatewayError, GatewayResult},
};

pub const DEFAULT_COOKIE_NAME: &str = "gateway-jwt";
pub const DEFAULT_USER_ID_CLAIM: &str = "userId";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthFilterConfig {
    #[serde(alias = "authPath")]
    auth_path: Option<String>,
}

/// Verifies the HS256 token cookie on the configured path and records the
/// user id for the downstream call.
pub struct AuthFilter {
    key: DecodingKey,
    validation: Validation,
    cookie_name: String,
    user_id_claim: String,
}

impl AuthFilter {
    pub fn new(secret: &[u8], cookie_name: impl Into<String>, user_id_claim: impl Into<String>) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            cookie_name: cookie_name.into(),
            user_id_claim: user_id_claim.into(),
        }
    }

    fn user_id(&self, token: &str) -> GatewayResult<String> {
        let data = decode::<Map<String, Value>>(token, &self.key, &self.validation)
            .map_err(|e| GatewayError::Unauthorized(e.to_string()))?;
        match data.claims.get(&self.user_id_claim) {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(GatewayError::Unauthorized(format!(
                "token has no {} claim",
                self.user_id_claim
            ))),
        }
    }
}

#[async_trait]
impl Filter for AuthFilter {
    async fn do_filter(&self, ctx: &Arc<GatewayContext>) -> GatewayResult<()> {
        let Some(entry) = ctx.rule().filter_config(AUTH_FILTER_ID) else {
            return Ok(());
        };
        let config: AuthFilterConfig = parse_filter_config(AUTH_FILTER_ID, &entry.config)?;
        let Some(auth_path) = config.auth_path else {
            return Ok(());
        };

        let (path_matches, token) = ctx.with_request(|request| {
            (
                request.path() == auth_path,
                request.cookie(&self.cookie_name).map(str::to_string),
            )
        });
        if !path_matches {
            return Ok(());
        }

        let token = token.ok_or_else(|| GatewayError::Unauthorized("missing token".into()))?;
        let user_id = self.user_id(&token).inspect_err(|e| {
            tracing::info!(path = %auth_path, error = %e, "Rejecting unauthenticated request");
        })?;
        tracing::debug!(user_id = %user_id, "Request authenticated");
        ctx.with_request_mut(|request| request.set_user_id(user_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;
    use crate::core::{
        model::{FilterConfig, Rule},
        test_support::context_with,
    };

    const SECRET: &[u8] = b"test-secret";

    fn token(claims: Value, secret: &[u8]) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn rule() -> Rule {
        Rule {
            filter_configs: vec![FilterConfig::new(AUTH_FILTER_ID, r#"{"auth_path": "/user/private"}"#)],
            ..Rule::default()
        }
    }

    fn filter() -> AuthFilter {
        AuthFilter::new(SECRET, DEFAULT_COOKIE_NAME, DEFAULT_USER_ID_CLAIM)
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn valid_token_records_user_id() {
        let cookie = format!("gateway-jwt={}", token(json!({"userId": 42, "exp": exp()}), SECRET));
        let (ctx, _rx) = context_with("/user/private", &[("cookie", &cookie)], rule());
        filter().do_filter(&ctx).await.unwrap();
        assert_eq!(ctx.with_request(|r| r.user_id().map(str::to_string)), Some("42".into()));
    }

    #[tokio::test]
    async fn missing_or_forged_token_is_unauthorized() {
        let (ctx, _rx) = context_with("/user/private", &[], rule());
        assert!(matches!(
            filter().do_filter(&ctx).await,
            Err(GatewayError::Unauthorized(_))
        ));

        let forged = format!("gateway-jwt={}", token(json!({"userId": "7", "exp": exp()}), b"other"));
        let (ctx, _rx) = context_with("/user/private", &[("cookie", &forged)], rule());
        assert!(matches!(
            filter().do_filter(&ctx).await,
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn token_without_user_claim_is_unauthorized() {
        let cookie = format!("gateway-jwt={}", token(json!({"exp": exp()}), SECRET));
        let (ctx, _rx) = context_with("/user/private", &[("cookie", &cookie)], rule());
        assert!(filter().do_filter(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn other_paths_pass_through() {
        let (ctx, _rx) = context_with("/user/public", &[], rule());
        filter().do_filter(&ctx).await.unwrap();
        assert!(ctx.with_request(|r| r.user_id().is_none()));
    }
}
