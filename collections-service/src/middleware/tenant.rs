//! Tenant context middleware for multi-tenancy support.
//!
//! Extracts the tenant id (and optionally the acting staff user) from
//! request headers. These headers are set by the BFF after authenticating
//! the caller and validating their tenant membership, so every scoped
//! endpoint can trust them.
//!
//! Customer-facing endpoints (tracking pixel, payment page callbacks, the
//! gateway webhook) do NOT use this extractor: they resolve the tenant
//! from the resource itself.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

/// Tenant context extracted from request headers.
#[derive(Debug, Clone)]
pub struct TenantContext {
    /// Tenant (business account) the request is scoped to.
    pub tenant_id: Uuid,
    /// Staff user making the request, when the BFF forwards one.
    pub user_id: Option<String>,
}

impl TenantContext {
    pub fn new(tenant_id: Uuid, user_id: Option<String>) -> Self {
        Self { tenant_id, user_id }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("X-Tenant-ID")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!(
                    "Missing X-Tenant-ID header (required from BFF)"
                ))
            })?;

        let tenant_id = Uuid::parse_str(raw).map_err(|_| {
            AppError::Unauthorized(anyhow::anyhow!("X-Tenant-ID header is not a valid UUID"))
        })?;

        // Staff identity is optional; dispute resolution records it when present
        let user_id = parts
            .headers
            .get("X-User-ID")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let span = tracing::Span::current();
        span.record("tenant_id", raw);
        if let Some(ref uid) = user_id {
            span.record("user_id", uid.as_str());
        }

        Ok(TenantContext::new(tenant_id, user_id))
    }
}
