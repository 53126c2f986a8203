//! Contact form payload and the notification body built from it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("value is not a valid email address: {0}")]
    Malformed(&'static str),
}

/// A syntactically valid mailbox address. The domain is stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(raw: &str) -> Result<EmailAddress, AddressError> {
        let raw = raw.trim();
        if raw.len() > 254 {
            return Err(AddressError::Malformed("address is too long"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(AddressError::Malformed("address contains whitespace"));
        }
        let (local, domain) = match raw.split_once('@') {
            Some((local, domain)) if !domain.contains('@') => (local, domain),
            Some(_) => return Err(AddressError::Malformed("more than one @")),
            None => return Err(AddressError::Malformed("missing @")),
        };
        check_local(local)?;
        check_domain(domain)?;
        Ok(EmailAddress(format!(
            "{local}@{}",
            domain.to_ascii_lowercase()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> &str {
        self.0.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }
}

fn check_local(local: &str) -> Result<(), AddressError> {
    if local.is_empty() {
        return Err(AddressError::Malformed("empty local part"));
    }
    if local.len() > 64 {
        return Err(AddressError::Malformed("local part is too long"));
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return Err(AddressError::Malformed("misplaced dot in local part"));
    }
    let atext = |c: char| c.is_ascii_alphanumeric() || "!#$%&'*+-/=?^_`{|}~.".contains(c);
    if !local.chars().all(atext) {
        return Err(AddressError::Malformed("invalid character in local part"));
    }
    Ok(())
}

fn check_domain(domain: &str) -> Result<(), AddressError> {
    if domain.is_empty() || domain.len() > 255 {
        return Err(AddressError::Malformed("invalid domain length"));
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(AddressError::Malformed("domain needs a dot"));
    }
    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return Err(AddressError::Malformed("invalid domain label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(AddressError::Malformed("domain label starts or ends with a hyphen"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AddressError::Malformed("invalid character in domain"));
        }
    }
    Ok(())
}

impl TryFrom<String> for EmailAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EmailAddress::parse(&value)
    }
}

impl From<EmailAddress> for String {
    fn from(value: EmailAddress) -> Self {
        value.0
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validated body of `POST /send-email`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSubmission {
    pub name: String,
    pub email: EmailAddress,
    pub subject: String,
    pub message: String,
}

/// Replaces the `{user_*}` tokens of `template` with the submission fields.
///
/// Values are inserted verbatim, without HTML escaping.
pub fn render_template(template: &str, submission: &EmailSubmission) -> String {
    [
        ("{user_name}", submission.name.as_str()),
        ("{user_email}", submission.email.as_str()),
        ("{user_subject}", submission.subject.as_str()),
        ("{user_message}", submission.message.as_str()),
    ]
    .into_iter()
    .fold(template.to_string(), |body, (token, value)| {
        body.replace(token, value)
    })
}
