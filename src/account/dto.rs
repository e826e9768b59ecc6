use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, FieldError, Result};

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

fn check_length(errors: &mut Vec<FieldError>, field: &str, value: &str, min: usize, max: usize) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, "is required"));
    } else if value.len() < min || value.len() > max {
        errors.push(FieldError::new(
            field,
            format!("length must be between {min} and {max}"),
        ));
    }
}

/// Activation and reset tokens arrive over a URL; bound their shape before
/// hashing anything.
pub(crate) fn check_token(field: &str, token: &str) -> Result<()> {
    let mut errors = Vec::new();
    check_length(&mut errors, field, token, 4, 128);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    /// Normalizes the email (trim + lowercase) and checks field shapes.
    pub fn validate(&mut self) -> Result<()> {
        self.email = self.email.trim().to_lowercase();
        let mut errors = Vec::new();
        check_length(&mut errors, "firstName", &self.first_name, 2, 32);
        check_length(&mut errors, "lastName", &self.last_name, 1, 32);
        check_length(&mut errors, "email", &self.email, 6, 32);
        if !self.email.is_empty() && !is_valid_email(&self.email) {
            errors.push(FieldError::new("email", "must be a valid email address"));
        }
        check_length(&mut errors, "password", &self.password, 6, 32);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl LoginRequest {
    pub fn validate(&mut self) -> Result<()> {
        self.email = self.email.trim().to_lowercase();
        let mut errors = Vec::new();
        check_length(&mut errors, "email", &self.email, 6, 32);
        check_length(&mut errors, "password", &self.password, 6, 32);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

impl ChangePasswordRequest {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.current_password.is_empty() {
            errors.push(FieldError::new("currentPassword", "is required"));
        }
        check_length(&mut errors, "newPassword", &self.new_password, 6, 32);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    pub reset_token: String,
    pub new_password: String,
}

impl ResetPasswordRequest {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        check_length(&mut errors, "resetToken", &self.reset_token, 4, 128);
        check_length(&mut errors, "newPassword", &self.new_password, 6, 32);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }
}
