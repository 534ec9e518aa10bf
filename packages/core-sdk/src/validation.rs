use crate::error::ValidationError;
use crate::models::RunParameters;

pub const CREDENTIAL_PREFIX: &str = "pplx-";
pub const CREDENTIAL_LEN: usize = 53;

/**
 * \brief `pplx-` followed by exactly 48 characters.
 */
pub fn is_valid_credential(key: &str) -> bool {
    key.starts_with(CREDENTIAL_PREFIX) && key.chars().count() == CREDENTIAL_LEN
}

/**
 * \brief Picks the supplied credential unless it is blank, otherwise the fallback.
 */
pub fn resolve_credential<'a>(supplied: &'a str, fallback: Option<&'a str>) -> Option<&'a str> {
    if !supplied.trim().is_empty() {
        return Some(supplied);
    }
    fallback.filter(|k| !k.trim().is_empty())
}

/**
 * \brief Checks run parameters and returns the credential to dispatch with.
 *
 * Checks run in the order the user sees them: prompt, credential presence,
 * credential format, then the numeric bounds.
 */
pub fn validate(params: &RunParameters, fallback: Option<&str>) -> Result<String, ValidationError> {
    if params.prompt.trim().is_empty() {
        return Err(ValidationError::EmptyPrompt);
    }
    let credential =
        resolve_credential(&params.credential, fallback).ok_or(ValidationError::MissingCredential)?;
    if !is_valid_credential(credential) {
        return Err(ValidationError::MalformedCredential);
    }
    if !(0.0..=1.0).contains(&params.temperature) {
        return Err(ValidationError::TemperatureOutOfRange(params.temperature));
    }
    if params.max_tokens == 0 {
        return Err(ValidationError::ZeroMaxTokens);
    }
    Ok(credential.to_string())
}
