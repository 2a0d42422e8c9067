use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{CRYPTO_FILTER_ID, Filter, parse_filter_config};
use crate::{
    core::{context::GatewayContext, error::GatewayResult},
    ports::cipher::{CipherError, PayloadCipher},
};

const ENCRYPTED_MARKER: &str = "/encrypt/";
const ANONYMOUS_OWNER: &str = "anonymous";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CryptoConfig {
    #[serde(alias = "whiteList")]
    white_list: Vec<String>,
}

/// Decrypts `<prefix>/encrypt/<payload>` paths into `<prefix>?<query>`.
pub struct CryptoFilter {
    cipher: Arc<dyn PayloadCipher>,
}

impl CryptoFilter {
    pub fn new(cipher: Arc<dyn PayloadCipher>) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl Filter for CryptoFilter {
    async fn do_filter(&self, ctx: &Arc<GatewayContext>) -> GatewayResult<()> {
        let config: CryptoConfig = match ctx.rule().filter_config(CRYPTO_FILTER_ID) {
            Some(entry) => parse_filter_config(CRYPTO_FILTER_ID, &entry.config)?,
            None => return Ok(()),
        };

        let (path, owner) = ctx.with_request(|request| {
            (
                request.path().to_string(),
                request.user_id().unwrap_or(ANONYMOUS_OWNER).to_string(),
            )
        });
        if config.white_list.iter().any(|p| *p == path) {
            return Ok(());
        }
        let Some(marker) = path.find(ENCRYPTED_MARKER) else {
            return Ok(());
        };

        let prefix = &path[..marker];
        let payload = &path[marker + ENCRYPTED_MARKER.len()..];
        if payload.is_empty() {
            return Err(CipherError::Malformed("empty payload".into()).into());
        }
        let query = self.cipher.decrypt(&owner, payload).await?;
        tracing::debug!(prefix, owner = %owner, "Decrypted request payload");

        let prefix = prefix.to_string();
        ctx.with_request_mut(|request| {
            request.set_modify_path(prefix);
            request.set_modify_query(query);
        });
        Ok(())
    }
}
