//! API token types and the scopes derived from them.

use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// A named permission checked by downstream endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "images:upload")]
    ImagesUpload,
    #[serde(rename = "images:list")]
    ImagesList,
}

impl Scope {
    pub const ALL: &'static [Scope] = &[Scope::ImagesUpload, Scope::ImagesList];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImagesUpload => "images:upload",
            Self::ImagesList => "images:list",
        }
    }
}

/// Kind of API token. Scopes are never stored; they follow from the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Full,
    #[serde(alias = "upload-and-list", alias = "upload_and_list")]
    UploadList,
    #[serde(alias = "list-only")]
    ListOnly,
}

impl TokenType {
    /// Parse a type name as submitted by a client. An empty name means
    /// [`TokenType::Full`].
    pub fn from_name(name: &str) -> Result<Self, AuthError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "full" => Ok(Self::Full),
            "upload_list" | "upload-and-list" | "upload_and_list" => Ok(Self::UploadList),
            "list_only" | "list-only" => Ok(Self::ListOnly),
            other => Err(AuthError::invalid(format!("invalid token type: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::UploadList => "upload_list",
            Self::ListOnly => "list_only",
        }
    }

    pub fn scopes(self) -> &'static [Scope] {
        match self {
            Self::Full => Scope::ALL,
            Self::UploadList => &[Scope::ImagesUpload, Scope::ImagesList],
            Self::ListOnly => &[Scope::ImagesList],
        }
    }

    pub fn grants(self, scope: Scope) -> bool {
        self.scopes().contains(&scope)
    }
}
