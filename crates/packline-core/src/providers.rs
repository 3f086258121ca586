//! External provider adapters.
//!
//! The pipeline talks to the LLM field-extraction provider and the OCR
//! provider through two narrow traits. Implementations decide transport,
//! retry, and execution model; the pipeline only requires that calls return
//! before the job-directory lock is taken; no stage holds the lock across a
//! provider call.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::contract::FieldContract;
use crate::intake::{ExtractionRecord, OcrRecord, RawStorageLevel};

/// Environment variable carrying the LLM provider credential.
pub const LLM_API_KEY_ENV: &str = "PACKLINE_LLM_API_KEY";

/// Environment variable carrying the OCR provider credential.
pub const OCR_API_KEY_ENV: &str = "PACKLINE_OCR_API_KEY";

/// Provider call failures. Mapped to `EXTRACTION_FAILED` / `OCR_FAILED` at
/// the pipeline boundary.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider call itself failed.
    #[error("provider call failed: {0}")]
    Call(String),
    /// A required credential is absent from the environment.
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
}

/// What an extraction call gets to work with.
#[derive(Debug)]
pub struct ExtractionRequest<'a> {
    /// The user conversation, flattened for the prompt.
    pub conversation: String,
    /// Prompt variables supplied by the user, kept apart from the template.
    pub user_variables: BTreeMap<String, String>,
    /// The contract whose field keys the provider must emit.
    pub contract: &'a FieldContract,
    /// Raw-payload retention policy for the provenance record.
    pub storage_level: RawStorageLevel,
    /// Retention size cap for the raw response.
    pub max_raw_bytes: usize,
}

/// Field extraction seam.
pub trait ExtractFields {
    /// Runs one extraction call and returns the structured result with full
    /// provenance.
    ///
    /// # Errors
    ///
    /// [`ProviderError`] on transport or provider failures.
    fn extract(&self, request: &ExtractionRequest<'_>) -> Result<ExtractionRecord, ProviderError>;
}

/// OCR seam, used for slot-confidence probes and label reading.
pub trait RunOcr {
    /// Runs OCR over one image file.
    ///
    /// # Errors
    ///
    /// [`ProviderError`] on transport or provider failures.
    fn run_ocr(&self, image_path: &Path) -> Result<OcrRecord, ProviderError>;
}

/// Provider credentials, read once at process start.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub llm_api_key: String,
    pub ocr_api_key: String,
}

impl ProviderCredentials {
    /// Reads both credentials from the environment.
    ///
    /// # Errors
    ///
    /// [`ProviderError::MissingCredential`] naming the first absent variable.
    pub fn from_env() -> Result<Self, ProviderError> {
        let llm_api_key = std::env::var(LLM_API_KEY_ENV)
            .map_err(|_| ProviderError::MissingCredential(LLM_API_KEY_ENV))?;
        let ocr_api_key = std::env::var(OCR_API_KEY_ENV)
            .map_err(|_| ProviderError::MissingCredential(OCR_API_KEY_ENV))?;
        Ok(Self {
            llm_api_key,
            ocr_api_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_credential_names_variable() {
        // The test environment does not carry provider credentials.
        std::env::remove_var(LLM_API_KEY_ENV);
        let err = ProviderCredentials::from_env().expect_err("no credentials in test env");
        assert!(matches!(
            err,
            ProviderError::MissingCredential(LLM_API_KEY_ENV)
        ));
    }
}
