use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("failed to set manual DNS {address}: {reason}")]
    SetFailed { address: String, reason: String },

    #[error("failed to delete manual DNS: {reason}")]
    DeleteFailed { reason: String },

    #[error("no network services available for DNS override")]
    NoNetworkServices,
}
