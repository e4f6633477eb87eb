use std::sync::Arc;

use async_trait::async_trait;
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};

use super::error::SmtpError;

#[cfg_attr(feature = "with-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

impl MxRecord {
    pub fn new(preference: u16, exchange: impl Into<String>) -> Self {
        Self {
            preference,
            exchange: exchange.into(),
        }
    }
}

/// MX lookup seam. An empty list means the domain has no MX records.
#[async_trait]
pub trait MxLookup: Send + Sync {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxRecord>, ResolveError>;
}

#[async_trait]
impl MxLookup for TokioAsyncResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxRecord>, ResolveError> {
        let lookup = match self.mx_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        Ok(lookup
            .iter()
            .map(|mx| MxRecord::new(mx.preference(), normalize_exchange(&mx.exchange().to_utf8())))
            .collect())
    }
}

/// Resolver built from the system configuration.
pub fn system_resolver() -> Result<TokioAsyncResolver, SmtpError> {
    TokioAsyncResolver::tokio_from_system_conf().map_err(|source| SmtpError::ResolverInit {
        source: Arc::new(source),
    })
}

/// Candidate exchanges for `hostname`, lowest preference first. Equal
/// preferences keep resolver order.
pub(crate) async fn resolve_exchanges<L>(
    lookup: &L,
    hostname: &str,
) -> Result<Vec<MxRecord>, SmtpError>
where
    L: MxLookup + ?Sized,
{
    let mut records = lookup
        .lookup_mx(hostname)
        .await
        .map_err(|source| SmtpError::Lookup {
            hostname: hostname.to_string(),
            source: Arc::new(source),
        })?;
    records.retain(|record| !record.exchange.is_empty());
    records.sort_by_key(|record| record.preference);
    records.dedup();

    if records.is_empty() {
        return Err(SmtpError::NoMxRecords {
            hostname: hostname.to_string(),
        });
    }
    Ok(records)
}

pub(crate) fn normalize_exchange(exchange: &str) -> String {
    exchange.trim_end_matches('.').to_ascii_lowercase()
}
