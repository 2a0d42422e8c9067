use std::sync::Arc;

use async_trait::async_trait;

use super::Filter;
use crate::core::{context::GatewayContext, error::GatewayResult};

pub const GRAY_MARKER: &str = "gray_release";
const GRAY_BUCKETS: i32 = 1024;

/// Routes a request to gray instances when it carries the gray marker, or
/// when its client ip falls into the gray hash bucket.
pub struct GrayFilter;

/// 31-multiplier string hash over UTF-16 units, stable across processes.
fn stable_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Truncating remainder: negative hashes never land in the gray bucket.
fn in_gray_bucket(client_ip: &str) -> bool {
    stable_hash(client_ip) % GRAY_BUCKETS == 1
}

#[async_trait]
impl Filter for GrayFilter {
    async fn do_filter(&self, ctx: &Arc<GatewayContext>) -> GatewayResult<()> {
        let gray = ctx.with_request(|request| {
            let marked = request
                .header(GRAY_MARKER)
                .or_else(|| request.cookie(GRAY_MARKER))
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
            marked || in_gray_bucket(request.client_ip())
        });
        if gray {
            tracing::debug!("Request marked gray");
            ctx.set_gray(true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{model::Rule, test_support::context_with};

    #[test]
    fn hash_matches_reference_values() {
        assert_eq!(stable_hash(""), 0);
        assert_eq!(stable_hash("a"), 97);
        assert_eq!(stable_hash("ab"), 97 * 31 + 98);
        assert!(in_gray_bucket("10.0.0.172"));
        assert!(!in_gray_bucket("127.0.0.1"));
        // Negative hash whose low bits are 1.
        assert_eq!(stable_hash("192.168.5.119"), -2_047_579_135);
        assert!(!in_gray_bucket("192.168.5.119"));
    }

    #[tokio::test]
    async fn marker_header_or_cookie_marks_gray() {
        let (ctx, _rx) = context_with("/a", &[("gray_release", "true")], Rule::default());
        GrayFilter.do_filter(&ctx).await.unwrap();
        assert!(ctx.is_gray());

        let (ctx, _rx) = context_with("/a", &[("cookie", "gray_release=true")], Rule::default());
        GrayFilter.do_filter(&ctx).await.unwrap();
        assert!(ctx.is_gray());
    }

    #[tokio::test]
    async fn client_ip_bucket_marks_gray() {
        let (ctx, _rx) = context_with("/a", &[("x-forwarded-for", "10.0.0.172")], Rule::default());
        GrayFilter.do_filter(&ctx).await.unwrap();
        assert!(ctx.is_gray());

        let (ctx, _rx) = context_with("/a", &[("gray_release", "false")], Rule::default());
        GrayFilter.do_filter(&ctx).await.unwrap();
        assert!(!ctx.is_gray());
    }
}
