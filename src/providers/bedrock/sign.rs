//! AWS SigV4 signing for Bedrock Converse calls.
//!
//! Grounded on `providers::aws::sign_request`, stripped down: the teacher's
//! version signs on behalf of a single process-wide AWS account, refreshed
//! through `AwsCredentialCache` (assumed-role / IMDS / static). Here every
//! call uses a different tenant's already-decrypted, already-cached (C9)
//! static credential, so there's no refresh-on-expiry concern to reproduce
//! — signing is a pure function of the credential the caller already holds.

use aws_credential_types::Credentials;
use aws_sigv4::{
    http_request::{SignableBody, SignableRequest, SigningSettings, sign},
    sign::v4::SigningParams,
};

use crate::kms::BedrockCredentials;

#[derive(Debug, thiserror::Error)]
pub(super) enum SigningError {
    #[error("failed to build signing params: {0}")]
    Params(String),
    #[error("failed to build signable request: {0}")]
    Request(String),
    #[error("failed to sign request: {0}")]
    Sign(String),
}

pub(super) fn sign_request(
    credentials: &BedrockCredentials,
    region: &str,
    method: &str,
    url: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<Vec<(String, String)>, SigningError> {
    let creds = Credentials::new(
        credentials.access_key_id.clone(),
        credentials.secret_access_key.clone(),
        credentials.session_token.clone(),
        None,
        "bedrock-tenant",
    );
    let identity = creds.into();

    let signing_params = SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name("bedrock")
        .time(std::time::SystemTime::now())
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| SigningError::Params(e.to_string()))?;

    let signable_request = SignableRequest::new(
        method,
        url,
        headers.iter().copied(),
        SignableBody::Bytes(body),
    )
    .map_err(|e| SigningError::Request(e.to_string()))?;

    let (instructions, _signature) = sign(signable_request, &signing_params.into())
        .map_err(|e| SigningError::Sign(e.to_string()))?
        .into_parts();

    Ok(instructions
        .headers()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect())
}
